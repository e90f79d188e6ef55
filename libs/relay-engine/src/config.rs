use std::time::Duration;

use serde::Deserialize;

use relay_api::format::TypeBinding;

use crate::app::App;
use crate::error::EngineError;
use crate::manager::ManagerConfig;
use crate::topic::{Topic, TopicOptions};

/// Root configuration, parsed from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Application id, handed to the serializer with every value decode.
    #[serde(default = "default_app_id")]
    pub app_id: String,

    /// Delay between `start` and the first subscription.
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,

    #[serde(default)]
    pub transport: TransportConfig,

    /// Stream definitions.
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
}

fn default_app_id() -> String {
    "relay".to_string()
}

fn default_startup_grace_ms() -> u64 {
    2000
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            app_id: default_app_id(),
            startup_grace_ms: default_startup_grace_ms(),
            transport: TransportConfig::default(),
            streams: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Partition count for topics created on first produce.
    #[serde(default = "default_partitions")]
    pub partitions: u32,
}

fn default_partitions() -> u32 {
    1
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            partitions: default_partitions(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    #[serde(default)]
    pub topics: Option<Vec<String>>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub key_type: Option<TypeBinding>,
    #[serde(default)]
    pub value_type: Option<TypeBinding>,
}

impl StreamConfig {
    pub fn options(&self) -> TopicOptions {
        TopicOptions {
            topics: self.topics.clone(),
            pattern: self.pattern.clone(),
            key_type: self.key_type,
            value_type: self.value_type,
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, EngineError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| EngineError::Config(format!("{path}: {e}")))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, EngineError> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.transport.partitions == 0 {
            return Err(EngineError::Config(
                "transport.partitions must be at least 1".into(),
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for stream in &self.streams {
            if !seen.insert(stream.name.as_str()) {
                return Err(EngineError::Config(format!(
                    "duplicate stream name '{}'",
                    stream.name
                )));
            }
        }
        Ok(())
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            startup_grace: self.startup_grace(),
        }
    }

    /// Build one descriptor per stream entry, in file order.
    pub fn descriptors(&self, app: &App) -> Result<Vec<(String, Topic)>, EngineError> {
        self.streams
            .iter()
            .map(|stream| {
                let topic = Topic::new(app, stream.options())
                    .map_err(|e| e.with_context(format!("stream '{}'", stream.name)))?;
                Ok((stream.name.clone(), topic))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::tests::test_app;

    #[test]
    fn test_parse_defaults() {
        let config = RelayConfig::parse("").unwrap();
        assert_eq!(config.app_id, "relay");
        assert_eq!(config.startup_grace(), Duration::from_secs(2));
        assert_eq!(config.transport.partitions, 1);
        assert!(config.streams.is_empty());
    }

    #[test]
    fn test_parse_streams() {
        let config = RelayConfig::parse(
            r#"
            app_id = "orders-app"
            startup_grace_ms = 50

            [transport]
            partitions = 4

            [[streams]]
            name = "orders"
            topics = ["orders", "refunds"]
            key_type = "text"
            value_type = "json"

            [[streams]]
            name = "audit"
            pattern = "audit\\..*"
            "#,
        )
        .unwrap();

        assert_eq!(config.app_id, "orders-app");
        assert_eq!(config.manager_config().startup_grace, Duration::from_millis(50));
        assert_eq!(config.transport.partitions, 4);
        assert_eq!(config.streams.len(), 2);
        assert_eq!(config.streams[0].key_type, Some(TypeBinding::Text));
        assert_eq!(config.streams[0].value_type, Some(TypeBinding::Json));
        assert_eq!(config.streams[1].pattern.as_deref(), Some("audit\\..*"));

        let app = test_app();
        let descriptors = config.descriptors(&app).unwrap();
        assert_eq!(descriptors[0].0, "orders");
        assert_eq!(descriptors[0].1.to_string(), "orders,refunds");
        assert_eq!(descriptors[1].1.to_string(), "audit\\..*");
    }

    #[test]
    fn test_stream_with_topics_and_pattern_is_config_error() {
        let config = RelayConfig::parse(
            r#"
            [[streams]]
            name = "bad"
            topics = ["a"]
            pattern = "b.*"
            "#,
        )
        .unwrap();
        let err = config.descriptors(&test_app()).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        assert!(err.to_string().contains("stream 'bad'"));
    }

    #[test]
    fn test_stream_without_target_is_config_error() {
        let config = RelayConfig::parse("[[streams]]\nname = \"empty\"\ntopics = []\n").unwrap();
        assert!(config.descriptors(&test_app()).is_err());
    }

    #[test]
    fn test_duplicate_stream_names_rejected() {
        let err = RelayConfig::parse(
            r#"
            [[streams]]
            name = "x"
            topics = ["a"]

            [[streams]]
            name = "x"
            topics = ["b"]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate stream name 'x'"));
    }

    #[test]
    fn test_unknown_type_binding_rejected() {
        let result = RelayConfig::parse(
            "[[streams]]\nname = \"s\"\ntopics = [\"a\"]\nvalue_type = \"avro\"\n",
        );
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_zero_partitions_rejected() {
        assert!(RelayConfig::parse("[transport]\npartitions = 0\n").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = RelayConfig::load("/nonexistent/relay.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/relay.toml"));
    }
}
