//! token 数估算
//!
//! 不依赖分词器：ASCII 单词按 1.3，CJK 字符按 1.5，其余非空白字符按 1 个字节 1/4 计。

use serde::Serialize;

use crate::provider::{ChatMessage, ToolSpec};

/// 每条历史消息的固定开销
pub const PER_MESSAGE_OVERHEAD: u64 = 15;

const fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{3040}'..='\u{30FF}'
        | '\u{AC00}'..='\u{D7AF}'
        | '\u{F900}'..='\u{FAFF}'
        | '\u{FF00}'..='\u{FFEF}')
}

/// 估算一段文本的 token 数
#[must_use]
pub fn estimate_text_tokens(text: &str) -> u64 {
    let mut tenths: u64 = 0;
    let mut other_bytes: u64 = 0;
    let mut in_word = false;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            if !in_word {
                tenths += 13;
                in_word = true;
            }
            continue;
        }
        in_word = false;
        if is_cjk(c) {
            tenths += 15;
        } else if c.is_ascii_punctuation() {
            tenths += 3;
        } else if !c.is_whitespace() {
            other_bytes += c.len_utf8() as u64;
        }
    }
    (tenths + other_bytes * 10 / 4).div_ceil(10)
}

/// 输入 token 明细
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenBreakdown {
    pub system_tokens: u64,
    pub history_tokens: u64,
    pub prompt_tokens: u64,
    pub tools_tokens: u64,
    pub total: u64,
}

/// 估算一次请求的输入 token
#[must_use]
pub fn estimate_request(system: &str, messages: &[ChatMessage], tools: &[ToolSpec]) -> TokenBreakdown {
    let system_tokens = estimate_text_tokens(system);
    let (history, last) = match messages.split_last() {
        Some((last, history)) => (history, Some(last)),
        None => (messages, None),
    };
    let history_tokens = history
        .iter()
        .filter(|m| !m.content.trim().is_empty())
        .map(|m| estimate_text_tokens(&m.content) + PER_MESSAGE_OVERHEAD)
        .sum();
    let prompt_tokens = last.map_or(0, |m| estimate_text_tokens(&m.content));
    let tools_tokens = tools
        .iter()
        .map(|t| {
            let schema = t
                .input_schema
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            estimate_text_tokens(&t.name) + estimate_text_tokens(&t.description) + estimate_text_tokens(&schema)
        })
        .sum();
    TokenBreakdown {
        system_tokens,
        history_tokens,
        prompt_tokens,
        tools_tokens,
        total: system_tokens + history_tokens + prompt_tokens + tools_tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("", 0)]
    #[case("hello", 2)]
    #[case("hello world again", 4)]
    #[case("你好世界", 6)]
    #[case("   ", 0)]
    fn test_estimate_text_tokens(#[case] text: &str, #[case] expected: u64) {
        assert_eq!(estimate_text_tokens(text), expected);
    }

    #[test]
    fn test_breakdown_separates_history_and_prompt() {
        let messages = vec![
            ChatMessage::new("user", "first question"),
            ChatMessage::new("assistant", ""),
            ChatMessage::new("user", "second"),
        ];
        let bd = estimate_request("be brief", &messages, &[]);
        assert_eq!(bd.history_tokens, estimate_text_tokens("first question") + PER_MESSAGE_OVERHEAD);
        assert_eq!(bd.prompt_tokens, 2);
        assert_eq!(bd.system_tokens, 3);
        assert_eq!(bd.total, bd.system_tokens + bd.history_tokens + bd.prompt_tokens);
    }

    #[test]
    fn test_tools_count() {
        let tools = vec![ToolSpec {
            name: "Read".into(),
            description: "read a file".into(),
            input_schema: Some(serde_json::json!({"type": "object"})),
        }];
        assert!(estimate_request("", &[], &tools).tools_tokens > 3);
    }
}
