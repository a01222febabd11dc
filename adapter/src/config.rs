use serde::{Deserialize, Serialize};

/// The configuration of a `GraphLayer`.
///
/// Every field is optional when parsed, an empty JSON object yields the default configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    /// Bake the weights into a shared session and defer weight gradients until `flush`.
    pub buffered: bool,
    /// Destroy native graphs on the rayon pool instead of the releasing thread.
    pub background_teardown: bool,
    pub pool: PoolConfig,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            buffered: false,
            background_teardown: true,
            pool: PoolConfig::default(),
        }
    }
}

/// The configuration of a `BufferPool`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// How many idle buffers each size bucket keeps around.
    pub max_idle_per_bucket: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_bucket: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config: LayerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, LayerConfig::default());
        assert!(config.background_teardown);
        assert_eq!(config.pool.max_idle_per_bucket, 16);
    }

    #[test]
    fn partial_configs_keep_remaining_defaults() {
        let json = r#"{ "buffered": true, "pool": { "max_idle_per_bucket": 2 } }"#;
        let config: LayerConfig = serde_json::from_str(json).unwrap();

        assert!(config.buffered);
        assert!(config.background_teardown);
        assert_eq!(config.pool.max_idle_per_bucket, 2);
    }
}
