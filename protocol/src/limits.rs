use serde::Deserialize;
use serde::Serialize;

/// Declared limits for a thread. All optional; `None` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turns: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spend: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
    /// Maximum spawn depth below this thread.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<u64>,
    /// Maximum number of child threads this thread may spawn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spawns: Option<u64>,
}

impl Limits {
    /// Merge per-call overrides over declared limits. `Some` wins.
    pub fn with_overrides(&self, overrides: &Limits) -> Limits {
        Limits {
            turns: overrides.turns.or(self.turns),
            tokens: overrides.tokens.or(self.tokens),
            spend: overrides.spend.or(self.spend),
            duration_seconds: overrides.duration_seconds.or(self.duration_seconds),
            depth: overrides.depth.or(self.depth),
            spawns: overrides.spawns.or(self.spawns),
        }
    }
}
