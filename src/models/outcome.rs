use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::models::work_item::Batch;

/// 匹配置信度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Confidence::High => "HIGH",
            Confidence::Medium => "MEDIUM",
            Confidence::Low => "LOW",
        }
    }

    /// 大小写不敏感解析
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HIGH" => Some(Confidence::High),
            "MEDIUM" => Some(Confidence::Medium),
            "LOW" => Some(Confidence::Low),
            _ => None,
        }
    }

    /// 降一级：HIGH → MEDIUM，其余不变
    pub fn downgraded(self) -> Self {
        match self {
            Confidence::High => Confidence::Medium,
            other => other,
        }
    }

    /// 没有 validation_score 时用于估算批次得分的默认值
    pub fn estimated_score(self) -> f64 {
        match self {
            Confidence::High => 0.9,
            Confidence::Medium => 0.7,
            Confidence::Low => 0.3,
        }
    }
}

impl Default for Confidence {
    fn default() -> Self {
        Confidence::Low
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Confidence {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Confidence::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("未知的置信度: {}", raw)))
    }
}

/// 单个检查项的匹配结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchOutcome {
    pub row_id: u32,
    pub found: bool,
    #[serde(default)]
    pub confidence: Confidence,
    #[serde(default)]
    pub sheet_references: Vec<String>,
    #[serde(default)]
    pub spec_references: Vec<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub validation_score: f64,
}

impl MatchOutcome {
    /// 重试耗尽后的兜底结果
    pub fn fallback(row_id: u32, cause: &str) -> Self {
        Self {
            row_id,
            found: false,
            confidence: Confidence::Low,
            sheet_references: Vec::new(),
            spec_references: Vec::new(),
            notes: String::new(),
            reasoning: format!("processing failed: {}", cause),
            validation_score: 0.0,
        }
    }

    /// 为整个批次生成兜底结果
    pub fn fallback_for_rows(row_ids: &[u32], cause: &str) -> Vec<Self> {
        row_ids
            .iter()
            .map(|&row_id| Self::fallback(row_id, cause))
            .collect()
    }

    pub fn fallback_for_batch(batch: &Batch, cause: &str) -> Vec<Self> {
        Self::fallback_for_rows(&batch.row_ids(), cause)
    }

    /// 修正结果使其满足不变量
    ///
    /// - validation_score 收敛到 [0, 1]（NaN 视为 0）
    /// - 未找到的项不能是 HIGH 且分数非零
    pub fn normalized(mut self) -> Self {
        if !self.validation_score.is_finite() {
            self.validation_score = 0.0;
        }
        self.validation_score = self.validation_score.clamp(0.0, 1.0);

        if !self.found && self.confidence == Confidence::High && self.validation_score > 0.0 {
            self.confidence = Confidence::Low;
        }
        self
    }
}

/// 计算一组结果的整体置信度得分
///
/// 只统计已找到的项：优先使用 validation_score，为 0 时按置信度估算。
pub fn batch_confidence_score(outcomes: &[MatchOutcome]) -> f64 {
    let scores: Vec<f64> = outcomes
        .iter()
        .filter(|o| o.found)
        .map(|o| {
            if o.validation_score > 0.0 {
                o.validation_score
            } else {
                o.confidence.estimated_score()
            }
        })
        .collect();

    if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(found: bool, confidence: Confidence, score: f64) -> MatchOutcome {
        MatchOutcome {
            row_id: 1,
            found,
            confidence,
            sheet_references: vec![],
            spec_references: vec![],
            notes: String::new(),
            reasoning: String::new(),
            validation_score: score,
        }
    }

    #[test]
    fn test_confidence_parse_case_insensitive() {
        assert_eq!(Confidence::parse("high"), Some(Confidence::High));
        assert_eq!(Confidence::parse(" Medium "), Some(Confidence::Medium));
        assert_eq!(Confidence::parse("LOW"), Some(Confidence::Low));
        assert_eq!(Confidence::parse("certain"), None);
    }

    #[test]
    fn test_confidence_serde_round_trip() {
        let json = serde_json::to_string(&Confidence::Medium).unwrap();
        assert_eq!(json, "\"MEDIUM\"");
        let parsed: Confidence = serde_json::from_str("\"medium\"").unwrap();
        assert_eq!(parsed, Confidence::Medium);
    }

    #[test]
    fn test_fallback_outcome() {
        let o = MatchOutcome::fallback(7, "timeout");
        assert!(!o.found);
        assert_eq!(o.confidence, Confidence::Low);
        assert_eq!(o.validation_score, 0.0);
        assert_eq!(o.reasoning, "processing failed: timeout");
    }

    #[test]
    fn test_normalized_enforces_not_found_invariant() {
        let fixed = outcome(false, Confidence::High, 0.8).normalized();
        assert_eq!(fixed.confidence, Confidence::Low);

        let untouched = outcome(false, Confidence::High, 0.0).normalized();
        assert_eq!(untouched.confidence, Confidence::High);

        let found = outcome(true, Confidence::High, 0.8).normalized();
        assert_eq!(found.confidence, Confidence::High);
    }

    #[test]
    fn test_normalized_clamps_score() {
        assert_eq!(outcome(true, Confidence::Low, 1.7).normalized().validation_score, 1.0);
        assert_eq!(outcome(true, Confidence::Low, -0.2).normalized().validation_score, 0.0);
        assert_eq!(outcome(true, Confidence::Low, f64::NAN).normalized().validation_score, 0.0);
    }

    #[test]
    fn test_batch_confidence_score() {
        let outcomes = vec![
            outcome(true, Confidence::High, 0.95),
            outcome(true, Confidence::Medium, 0.0),
            outcome(false, Confidence::Low, 0.0),
        ];
        let score = batch_confidence_score(&outcomes);
        assert!((score - 0.825).abs() < 1e-9);
        assert_eq!(batch_confidence_score(&[]), 0.0);
    }
}
