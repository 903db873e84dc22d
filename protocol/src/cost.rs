use serde::Deserialize;
use serde::Serialize;

/// Exact usage for a single turn, retained for audit and for deriving
/// `step_finish` events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnUsage {
    pub turn: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub spend: f64,
}

/// Cumulative cost accumulator for one thread.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cost {
    pub turns: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub spend: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub per_turn: Vec<TurnUsage>,
    /// Wall-clock seconds since the thread started; refreshed by the runner
    /// before each limit check.
    #[serde(default)]
    pub elapsed_seconds: f64,
}

impl Cost {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Fold one turn's usage into the accumulator.
    pub fn record_turn(&mut self, input_tokens: u64, output_tokens: u64, spend: f64) {
        self.turns += 1;
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        self.spend += spend;
        self.per_turn.push(TurnUsage {
            turn: self.turns,
            input_tokens,
            output_tokens,
            spend,
        });
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;

    #[test]
    fn record_turn_accumulates() {
        let mut cost = Cost::default();
        cost.record_turn(100, 20, 0.003);
        cost.record_turn(150, 30, 0.004);
        assert_eq!(cost.turns, 2);
        assert_eq!(cost.total_tokens(), 300);
        assert!((cost.spend - 0.007).abs() < 1e-9);
        assert_eq!(cost.per_turn.len(), 2);
        assert_eq!(cost.per_turn[1].turn, 2);
    }
}
