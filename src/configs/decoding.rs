use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct DecodingConfig {
    /// Wall-clock ceiling for a single `read` call. Unset disables the budget.
    pub realtime_budget_ms: Option<u64>,
}

impl DecodingConfig {
    pub fn realtime_budget(&self) -> Option<Duration> {
        self.realtime_budget_ms.map(Duration::from_millis)
    }
}
