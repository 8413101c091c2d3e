//! Token 用量与费用估算

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

/// 单次（或累计）oracle 调用的 token 用量
///
/// 调度器只做透传和累加，不解释其含义。
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cached_tokens: u64,
    #[serde(default)]
    pub thoughts_tokens: u64,
    /// 估算费用（美元）
    #[serde(default)]
    pub total_cost: f64,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cached_tokens + self.thoughts_tokens
    }

    /// 按模型价格表填充 `total_cost`
    pub fn priced(mut self, model: &str) -> Self {
        self.total_cost = ModelPricing::for_model(model).cost_of(&self);
        self
    }
}

impl Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: TokenUsage) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
            cached_tokens: self.cached_tokens + rhs.cached_tokens,
            thoughts_tokens: self.thoughts_tokens + rhs.thoughts_tokens,
            total_cost: self.total_cost + rhs.total_cost,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: TokenUsage) {
        *self = *self + rhs;
    }
}

impl std::iter::Sum for TokenUsage {
    fn sum<I: Iterator<Item = TokenUsage>>(iter: I) -> Self {
        iter.fold(TokenUsage::default(), Add::add)
    }
}

/// 每百万 token 的价格（美元）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
    pub output_thinking: f64,
    pub cached: f64,
    pub thoughts: f64,
}

const DEFAULT_PRICING: ModelPricing = ModelPricing {
    input: 0.15,
    output: 0.60,
    output_thinking: 3.50,
    cached: 0.0375,
    thoughts: 0.15,
};

impl ModelPricing {
    /// 未知模型使用默认价格
    pub fn for_model(model: &str) -> Self {
        match model {
            "gemini-1.5-flash" => ModelPricing {
                input: 0.075,
                output: 0.30,
                output_thinking: 0.30,
                cached: 0.025,
                thoughts: 0.075,
            },
            "gemini-1.5-pro" => ModelPricing {
                input: 0.15,
                output: 0.60,
                output_thinking: 0.60,
                cached: 0.05,
                thoughts: 0.15,
            },
            _ => DEFAULT_PRICING,
        }
    }

    pub fn cost_of(&self, usage: &TokenUsage) -> f64 {
        let per_million = |tokens: u64, price: f64| tokens as f64 / 1_000_000.0 * price;

        // 有思考 token 时输出按思考模式计价
        let output_price = if usage.thoughts_tokens > 0 {
            self.output_thinking
        } else {
            self.output
        };

        per_million(usage.input_tokens, self.input)
            + per_million(usage.output_tokens, output_price)
            + per_million(usage.cached_tokens, self.cached)
            + per_million(usage.thoughts_tokens, self.thoughts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_sum() {
        let a = TokenUsage {
            input_tokens: 100,
            output_tokens: 10,
            total_cost: 0.5,
            ..Default::default()
        };
        let b = TokenUsage {
            input_tokens: 50,
            cached_tokens: 5,
            total_cost: 0.25,
            ..Default::default()
        };
        let total: TokenUsage = vec![a, b].into_iter().sum();
        assert_eq!(total.input_tokens, 150);
        assert_eq!(total.total_tokens(), 165);
        assert!((total.total_cost - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_pricing_default_model() {
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 1_000_000,
            ..Default::default()
        }
        .priced("gemini-2.5-flash");
        assert!((usage.total_cost - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_pricing_thinking_output() {
        let usage = TokenUsage {
            output_tokens: 1_000_000,
            thoughts_tokens: 1_000_000,
            ..Default::default()
        }
        .priced("unknown-model");
        assert!((usage.total_cost - (3.50 + 0.15)).abs() < 1e-9);
    }

    #[test]
    fn test_usage_deserializes_missing_fields() {
        let usage: TokenUsage = serde_json::from_str(r#"{"input_tokens": 12}"#).unwrap();
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.total_cost, 0.0);
    }
}
