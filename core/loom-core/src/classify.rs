//! Classification of upstream agent failures.
//!
//! The agent reports failures with an optional machine subtype and a free-text
//! message. Subtypes are matched by prefix first; the message is only consulted
//! when no subtype was supplied.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    ContextLimit,
    BudgetLimit,
    AuthIssue,
    ServerIssue,
    ToolIssue,
    Unknown,
}

impl ErrorCategory {
    /// Resuming the same session is expected to succeed eventually.
    pub fn retryable(&self) -> bool {
        matches!(self, ErrorCategory::ServerIssue | ErrorCategory::Unknown)
    }

    /// A fresh fork is the recommended recovery (resuming would repeat the failure).
    pub fn forkable(&self) -> bool {
        matches!(self, ErrorCategory::ContextLimit)
    }

    /// Settings section the UI should link to, if any.
    pub fn settings_section(&self) -> Option<&'static str> {
        match self {
            ErrorCategory::BudgetLimit => Some("spend"),
            ErrorCategory::AuthIssue => Some("auth"),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::ContextLimit => "context_limit",
            ErrorCategory::BudgetLimit => "budget_limit",
            ErrorCategory::AuthIssue => "auth_issue",
            ErrorCategory::ServerIssue => "server_issue",
            ErrorCategory::ToolIssue => "tool_issue",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

const SUBTYPE_PREFIXES: &[(&str, ErrorCategory)] = &[
    ("error_max_turns", ErrorCategory::ContextLimit),
    ("error_max_input", ErrorCategory::ContextLimit),
    ("error_context", ErrorCategory::ContextLimit),
    ("prompt_too_long", ErrorCategory::ContextLimit),
    ("error_max_budget", ErrorCategory::BudgetLimit),
    ("error_billing", ErrorCategory::BudgetLimit),
    ("error_auth", ErrorCategory::AuthIssue),
    ("authentication", ErrorCategory::AuthIssue),
    ("rate_limit", ErrorCategory::ServerIssue),
    ("overloaded", ErrorCategory::ServerIssue),
    ("api_error", ErrorCategory::ServerIssue),
    ("error_timeout", ErrorCategory::ServerIssue),
    ("error_network", ErrorCategory::ServerIssue),
    ("error_permission", ErrorCategory::ToolIssue),
    ("error_tool", ErrorCategory::ToolIssue),
    ("error_max_structured_output_retries", ErrorCategory::ToolIssue),
];

static MESSAGE_PATTERNS: Lazy<Vec<(Regex, ErrorCategory)>> = Lazy::new(|| {
    let table: [(&str, ErrorCategory); 5] = [
        (
            r"(?i)context (window|length)|prompt is too long|max(imum)? turns|too many tokens",
            ErrorCategory::ContextLimit,
        ),
        (
            r"(?i)budget|spend limit|credit balance|billing",
            ErrorCategory::BudgetLimit,
        ),
        (
            r"(?i)unauthori[sz]ed|invalid api key|authentication|oauth|\b401\b|log ?in again",
            ErrorCategory::AuthIssue,
        ),
        (
            r"(?i)rate limit|overloaded|\b429\b|\b5\d\d\b|timed? ?out|network|connection (reset|refused)|econnreset",
            ErrorCategory::ServerIssue,
        ),
        (
            r"(?i)permission denied|tool execution|structured output",
            ErrorCategory::ToolIssue,
        ),
    ];

    table
        .iter()
        .filter_map(|(pattern, category)| match Regex::new(pattern) {
            Ok(regex) => Some((regex, *category)),
            Err(err) => {
                tracing::warn!(error = %err, pattern, "Invalid error classification pattern");
                None
            }
        })
        .collect()
});

/// Classifies an upstream failure.
pub fn classify_error(subtype: Option<&str>, message: &str) -> ErrorCategory {
    if let Some(subtype) = subtype.map(str::trim).filter(|value| !value.is_empty()) {
        return SUBTYPE_PREFIXES
            .iter()
            .find(|(prefix, _)| subtype.starts_with(prefix))
            .map(|(_, category)| *category)
            .unwrap_or(ErrorCategory::Unknown);
    }

    MESSAGE_PATTERNS
        .iter()
        .find(|(pattern, _)| pattern.is_match(message))
        .map(|(_, category)| *category)
        .unwrap_or(ErrorCategory::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtype_prefix_wins_over_message() {
        assert_eq!(
            classify_error(Some("error_max_turns_exceeded"), "rate limit hit"),
            ErrorCategory::ContextLimit
        );
    }

    #[test]
    fn unrecognised_subtype_is_unknown_even_with_matching_message() {
        assert_eq!(
            classify_error(Some("error_during_execution"), "overloaded"),
            ErrorCategory::Unknown
        );
    }

    #[test]
    fn message_patterns_apply_without_subtype() {
        assert_eq!(
            classify_error(None, "API Error: 529 Overloaded"),
            ErrorCategory::ServerIssue
        );
        assert_eq!(
            classify_error(None, "Invalid API key · Please run /login"),
            ErrorCategory::AuthIssue
        );
        assert_eq!(
            classify_error(Some("  "), "Prompt is too long"),
            ErrorCategory::ContextLimit
        );
        assert_eq!(classify_error(None, "something odd"), ErrorCategory::Unknown);
    }

    #[test]
    fn recovery_flags_follow_taxonomy() {
        assert!(!ErrorCategory::ContextLimit.retryable());
        assert!(ErrorCategory::ContextLimit.forkable());
        assert!(ErrorCategory::ServerIssue.retryable());
        assert!(!ErrorCategory::ServerIssue.forkable());
        assert!(ErrorCategory::Unknown.retryable());
        assert!(!ErrorCategory::BudgetLimit.retryable());
        assert_eq!(ErrorCategory::BudgetLimit.settings_section(), Some("spend"));
        assert_eq!(ErrorCategory::AuthIssue.settings_section(), Some("auth"));
        assert_eq!(ErrorCategory::ToolIssue.settings_section(), None);
    }
}
