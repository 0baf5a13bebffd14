use std::str::FromStr;

use serde::Deserialize;
use tracing::metadata::Level;
use tracing_subscriber::filter::Targets;

/// Log targets the configured level applies to by default. Targets not in
/// the list, eg. dependencies, stay at `INFO`.
const DEFAULT_TARGETS: &[&str] = &["p2p", "net", "chain", "node"];

#[derive(Deserialize)]
pub struct LoggerConfig {
    #[serde(default = "default_level", deserialize_with = "deserialize_level")]
    pub level: Level,

    /// Log targets the level applies to.
    #[serde(default = "default_targets")]
    pub targets: Vec<String>,
}

impl LoggerConfig {
    /// Build the target filter for this configuration.
    pub fn filter(&self) -> Targets {
        let mut filter = Targets::new().with_default(Level::INFO);

        for target in &self.targets {
            filter = filter.with_target(target.clone(), self.level);
        }
        filter
    }
}

fn deserialize_level<'de, D>(deserializer: D) -> Result<Level, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;

    Level::from_str(&s).map_err(serde::de::Error::custom)
}

fn default_level() -> Level {
    Level::INFO
}

fn default_targets() -> Vec<String> {
    DEFAULT_TARGETS.iter().map(|t| t.to_string()).collect()
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            targets: default_targets(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_applies_level_to_configured_targets_only() {
        let config = LoggerConfig {
            level: Level::TRACE,
            targets: vec!["p2p".to_owned()],
        };
        let filter = config.filter();

        assert!(filter.would_enable("p2p", &Level::TRACE));
        assert!(!filter.would_enable("hyper", &Level::TRACE));
        assert!(filter.would_enable("hyper", &Level::INFO));
    }
}
