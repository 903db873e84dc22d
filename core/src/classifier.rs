//! Provider-error classification.
//!
//! A configurable regex table maps provider error messages to
//! `retryable | permanent` kinds with a retry policy. The built-in table
//! covers the usual transport failures; a three-tier resolved
//! `config/errors/classifier.toml` can extend or override it.

use std::time::Duration;

use regex_lite::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Retryable,
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryPolicy {
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u64,
}

fn default_base_ms() -> u64 {
    200
}
fn default_max_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u64 {
    4
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            max_ms: default_max_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl RetryPolicy {
    /// Exponential delay for a 1-based attempt, capped at `max_ms`.
    pub fn delay(&self, attempt: u64) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as u32;
        let ms = self.base_ms.saturating_mul(1u64 << exp).min(self.max_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ClassifierRule {
    pattern: String,
    class: ErrorClass,
    #[serde(default)]
    retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ClassifierTable {
    #[serde(default)]
    rules: Vec<ClassifierRule>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub class: ErrorClass,
    pub retry: RetryPolicy,
    pub matched_pattern: Option<String>,
}

pub struct ErrorClassifier {
    rules: Vec<(Regex, ErrorClass, RetryPolicy)>,
}

impl ErrorClassifier {
    /// Built-in rules only.
    pub fn builtin() -> Self {
        let table = ClassifierTable {
            rules: builtin_rules(),
        };
        Self::from_table(table)
    }

    /// Built-in rules extended by the first `config/errors/classifier.toml`
    /// found across the tiers. Configured rules are checked first.
    pub fn load(config: &Config) -> Self {
        let mut table = ClassifierTable::default();
        for (_, ai_dir) in config.search_ai_dirs() {
            let path = ai_dir.join("config").join("errors").join("classifier.toml");
            if !path.is_file() {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|raw| toml::from_str::<ClassifierTable>(&raw).map_err(|e| e.to_string()))
            {
                Ok(loaded) => {
                    table = loaded;
                    break;
                }
                Err(e) => warn!(path = %path.display(), "ignoring bad classifier table: {e}"),
            }
        }
        table.rules.extend(builtin_rules());
        Self::from_table(table)
    }

    fn from_table(table: ClassifierTable) -> Self {
        let rules = table
            .rules
            .into_iter()
            .filter_map(|rule| match Regex::new(&rule.pattern) {
                Ok(regex) => Some((regex, rule.class, rule.retry.unwrap_or_default())),
                Err(e) => {
                    warn!(pattern = rule.pattern, "invalid classifier pattern: {e}");
                    None
                }
            })
            .collect();
        Self { rules }
    }

    /// Classify an error message. Unmatched messages are permanent: only
    /// failures the table recognizes are worth retrying.
    pub fn classify(&self, message: &str) -> Classification {
        for (regex, class, retry) in &self.rules {
            if regex.is_match(message) {
                return Classification {
                    class: *class,
                    retry: retry.clone(),
                    matched_pattern: Some(regex.as_str().to_string()),
                };
            }
        }
        Classification {
            class: ErrorClass::Permanent,
            retry: RetryPolicy::default(),
            matched_pattern: None,
        }
    }
}

fn builtin_rules() -> Vec<ClassifierRule> {
    let retryable = [
        r"(?i)timed? ?out",
        r"(?i)connection (reset|refused|closed|aborted)",
        r"(?i)temporarily unavailable",
        r"(?i)stream disconnected",
        r"(?i)overloaded",
        r"(?i)rate limit",
        r"\b429\b",
        r"\b(500|502|503|504)\b",
    ];
    let permanent = [
        r"(?i)invalid api key",
        r"(?i)authentication",
        r"(?i)permission denied",
        r"\b(400|401|403|404|422)\b",
    ];
    let mut rules = Vec::new();
    for pattern in permanent {
        rules.push(ClassifierRule {
            pattern: pattern.to_string(),
            class: ErrorClass::Permanent,
            retry: None,
        });
    }
    for pattern in retryable {
        rules.push(ClassifierRule {
            pattern: pattern.to_string(),
            class: ErrorClass::Retryable,
            retry: None,
        });
    }
    rules
}
