//! Common configuration types for Stagehand components.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default `EnvFilter` directive when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "sc_service=debug,tower_http=debug";

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObservabilityConfig {
    /// `EnvFilter` directive (trace, debug, info, warn, error or per-target)
    pub log_filter: String,
    /// Enable JSON-formatted logs
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            json_logs: false,
        }
    }
}

impl ObservabilityConfig {
    /// Read `RUST_LOG` and `SC_LOG_JSON` from a variable map.
    ///
    /// `SC_LOG_JSON` accepts `1`/`true`/`yes` (case-insensitive); anything
    /// else selects the plain text formatter.
    #[must_use]
    pub fn from_vars(vars: &HashMap<String, String>) -> Self {
        let log_filter = vars
            .get("RUST_LOG")
            .filter(|s| !s.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        let json_logs = vars
            .get("SC_LOG_JSON")
            .is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"));

        Self {
            log_filter,
            json_logs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_unset() {
        let config = ObservabilityConfig::from_vars(&HashMap::new());
        assert_eq!(config, ObservabilityConfig::default());
    }

    #[test]
    fn test_json_logs_flag() {
        let vars = HashMap::from([
            ("SC_LOG_JSON".to_string(), "TRUE".to_string()),
            ("RUST_LOG".to_string(), "info".to_string()),
        ]);
        let config = ObservabilityConfig::from_vars(&vars);
        assert!(config.json_logs);
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn test_blank_filter_falls_back() {
        let vars = HashMap::from([("RUST_LOG".to_string(), "  ".to_string())]);
        assert_eq!(
            ObservabilityConfig::from_vars(&vars).log_filter,
            DEFAULT_LOG_FILTER
        );
    }
}
