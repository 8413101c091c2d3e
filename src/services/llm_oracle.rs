//! LLM oracle - 业务能力层
//!
//! 通过兼容 OpenAI API 的聊天接口判断一批检查项是否出现在文档中
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 进行 API 调用
//! - 支持自定义 API 端点和模型（Gemini、Azure 等兼容服务）

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt::Write as _;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::OracleError;
use crate::models::{Batch, Confidence, MatchOutcome, TokenUsage};
use crate::services::oracle::{DocumentContext, MatchOracle, OracleAnswer};
use crate::utils::truncate_text;

const SYSTEM_INSTRUCTIONS: &str = "You are an expert construction document analyst specializing in matching \
checklist items against construction drawings and specifications.

CRITICAL VALIDATION RULES:
1. ONLY reference sheet numbers or specification codes that ACTUALLY EXIST in the documents
2. DO NOT invent references; use empty arrays [] when nothing specific is found
3. Be conservative: if in doubt, mark the item as not found

MATCHING CRITERIA:
- HIGH: direct mention or clear reference to the checklist item
- MEDIUM: related concept or similar requirement
- LOW: possible connection but unclear

REFERENCE FORMATS:
- Sheet numbers: A1.1, A-01, S2, ARCH-01
- Specification sections (CSI): 03 30 00, 09 91 23

Return ONLY the JSON object requested, no other text.";

/// 引用字段可能是字符串也可能是数组
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum References {
    List(Vec<String>),
    Text(String),
}

impl References {
    fn into_vec(self) -> Vec<String> {
        match self {
            References::List(list) => list,
            References::Text(text) => text
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawMatch {
    checklist_index: i64,
    #[serde(default)]
    found: bool,
    #[serde(default)]
    confidence: Option<String>,
    #[serde(default)]
    sheet_references: Option<References>,
    #[serde(default)]
    spec_references: Option<References>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    validation_score: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawAnswer {
    #[serde(default)]
    matches: Vec<RawMatch>,
}

/// LLM oracle
pub struct LlmOracle {
    client: Client<OpenAIConfig>,
    model_name: String,
    max_tokens: u32,
    has_api_key: bool,
}

impl LlmOracle {
    /// 创建新的 LLM oracle
    pub fn new(config: &Config) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.llm_api_key)
            .with_api_base(&config.llm_api_base_url);

        Self {
            client: Client::with_config(openai_config),
            model_name: config.llm_model_name.clone(),
            max_tokens: config.llm_max_tokens,
            has_api_key: !config.llm_api_key.trim().is_empty(),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// 调用聊天接口，返回 (响应文本, token 用量)
    async fn send_to_llm(&self, user_message: &str, system_message: &str) -> Result<(String, TokenUsage), OracleError> {
        debug!("调用 LLM API，模型: {}", self.model_name);
        debug!("用户消息长度: {} 字符", user_message.len());

        let system_msg = ChatCompletionRequestSystemMessageArgs::default()
            .content(system_message)
            .build()
            .map_err(classify_error)?;
        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(user_message)
            .build()
            .map_err(classify_error)?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(vec![
                ChatCompletionRequestMessage::System(system_msg),
                ChatCompletionRequestMessage::User(user_msg),
            ])
            .temperature(0.1)
            .max_tokens(self.max_tokens)
            .build()
            .map_err(classify_error)?;

        let response = self.client.chat().create(request).await.map_err(|e| {
            warn!("LLM API 调用失败: {}", e);
            classify_error(e)
        })?;

        let usage = response
            .usage
            .as_ref()
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens as u64,
                output_tokens: u.completion_tokens as u64,
                cached_tokens: u
                    .prompt_tokens_details
                    .as_ref()
                    .and_then(|d| d.cached_tokens)
                    .map(|v| v as u64)
                    .unwrap_or(0),
                thoughts_tokens: u
                    .completion_tokens_details
                    .as_ref()
                    .and_then(|d| d.reasoning_tokens)
                    .map(|v| v as u64)
                    .unwrap_or(0),
                total_cost: 0.0,
            })
            .unwrap_or_default()
            .priced(&self.model_name);

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| OracleError::MalformedAnswer("LLM 返回内容为空".to_string()))?;

        debug!("LLM API 调用成功, 输入 {} / 输出 {} tokens", usage.input_tokens, usage.output_tokens);
        Ok((content.trim().to_string(), usage))
    }
}

#[async_trait]
impl MatchOracle for LlmOracle {
    async fn prepare(&self, context: &DocumentContext) -> Result<(), OracleError> {
        if !self.has_api_key {
            return Err(OracleError::Unreachable("LLM_API_KEY 未设置".to_string()));
        }
        debug!("文档上下文: {}", truncate_text(&context.text, 80));
        Ok(())
    }

    async fn match_batch(
        &self,
        batch: &Batch,
        context: &DocumentContext,
        prior_instructions: Option<&str>,
    ) -> Result<OracleAnswer, OracleError> {
        let system_message = build_system_message(prior_instructions);
        let user_message = build_match_prompt(batch, context);

        let (response, usage) = self.send_to_llm(&user_message, &system_message).await?;
        let outcomes = parse_match_response(&response, batch)?;

        Ok(OracleAnswer { outcomes, usage })
    }
}

fn classify_error(err: OpenAIError) -> OracleError {
    match err {
        OpenAIError::Reqwest(e) if e.is_connect() => OracleError::Unreachable(e.to_string()),
        other => OracleError::Api(other.to_string()),
    }
}

fn build_system_message(prior_instructions: Option<&str>) -> String {
    match prior_instructions.map(str::trim).filter(|s| !s.is_empty()) {
        Some(extra) => format!("{}\n\nADDITIONAL INSTRUCTIONS:\n{}", SYSTEM_INSTRUCTIONS, extra),
        None => SYSTEM_INSTRUCTIONS.to_string(),
    }
}

/// 构建批次匹配 prompt，检查项从 1 开始编号
fn build_match_prompt(batch: &Batch, context: &DocumentContext) -> String {
    let mut checklist_text = String::new();
    for (i, item) in batch.items.iter().enumerate() {
        let _ = writeln!(checklist_text, "{}. Category: {}", i + 1, item.category);
        let _ = writeln!(checklist_text, "   Scope: {}", item.scope_of_work);
        let _ = writeln!(checklist_text, "   Checklist: {}", item.description);
        let _ = writeln!(checklist_text, "   Sector: {}\n", item.sector);
    }

    format!(
        r#"Match each checklist item against the construction documents described below.

DOCUMENT CONTEXT:
{}

CHECKLIST ITEMS TO MATCH:
{}
RESPONSE FORMAT:
Return your response in this exact JSON format, one entry per checklist item:
{{
  "matches": [
    {{
      "checklist_index": 1,
      "found": true,
      "confidence": "HIGH",
      "sheet_references": ["A1.1"],
      "spec_references": ["03 30 00"],
      "notes": "Found in architectural drawings",
      "reasoning": "Directly referenced on the floor plan",
      "validation_score": 0.9
    }}
  ],
  "total_items": {}
}}"#,
        context.text,
        checklist_text,
        batch.len()
    )
}

/// 去掉 Markdown 代码块标记
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .trim()
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

/// 解析匹配响应，checklist_index（从 1 开始）映射为 row_id
fn parse_match_response(response: &str, batch: &Batch) -> Result<Vec<MatchOutcome>, OracleError> {
    let json = strip_code_fence(response);
    let answer: RawAnswer = serde_json::from_str(json).map_err(|e| {
        OracleError::MalformedAnswer(format!("{} (响应: {})", e, truncate_text(json, 120)))
    })?;

    answer
        .matches
        .into_iter()
        .map(|raw| {
            let item = usize::try_from(raw.checklist_index)
                .ok()
                .and_then(|idx| idx.checked_sub(1))
                .and_then(|idx| batch.items.get(idx))
                .ok_or_else(|| {
                    OracleError::Validation(format!(
                        "checklist_index {} 超出范围 [1, {}]",
                        raw.checklist_index,
                        batch.len()
                    ))
                })?;

            let confidence = match raw.confidence.as_deref() {
                Some(text) => Confidence::parse(text).unwrap_or_else(|| {
                    warn!("未知的置信度 '{}'，按 LOW 处理", text);
                    Confidence::Low
                }),
                None => Confidence::Low,
            };

            Ok(MatchOutcome {
                row_id: item.row_id,
                found: raw.found,
                confidence,
                sheet_references: raw.sheet_references.map(References::into_vec).unwrap_or_default(),
                spec_references: raw.spec_references.map(References::into_vec).unwrap_or_default(),
                notes: raw.notes.unwrap_or_default(),
                reasoning: raw.reasoning.unwrap_or_default(),
                validation_score: raw.validation_score.unwrap_or(0.0),
            })
        })
        .collect()
}
