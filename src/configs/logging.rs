use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct LoggingConfig {
    /// Default level, e.g. `info`.
    pub level: Option<String>,
    /// Extra `EnvFilter` directives appended after the level.
    pub filters: Option<String>,
    /// Colored output. Defaults to on.
    pub ansi: Option<bool>,
}

impl LoggingConfig {
    pub fn ansi(&self) -> bool {
        self.ansi.unwrap_or(true)
    }
}
