use serde::{Deserialize, Serialize};

/// Layer configuration, loaded from vkpulse.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayerConfig {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub query_pool: QueryPoolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Deepest debug-marker nesting level per command buffer that still
    /// gets GPU timestamps. Markers below the cap keep their structure in
    /// the event stream but carry no GPU time. 0 disables the cap.
    #[serde(default)]
    pub max_local_marker_depth: u32,
    /// Override for the profiler socket path.
    pub socket_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPoolConfig {
    /// Timestamp slots created per device. Bounds how much unharvested
    /// GPU work can be in flight.
    #[serde(default = "default_num_timer_query_slots")]
    pub num_timer_query_slots: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_local_marker_depth: 0,
            socket_path: None,
        }
    }
}

impl Default for QueryPoolConfig {
    fn default() -> Self {
        Self {
            num_timer_query_slots: default_num_timer_query_slots(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl LayerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        Self::load(path).unwrap_or_default()
    }
}

/// Returns the config file path. Search order:
/// 1. `VKPULSE_CONFIG` environment variable
/// 2. System-wide config: `/etc/vkpulse/vkpulse.toml`
/// 3. Local fallback: `./vkpulse.toml`
pub fn default_config_path() -> String {
    if let Ok(path) = std::env::var("VKPULSE_CONFIG") {
        return path;
    }
    #[cfg(not(windows))]
    {
        let system_path = "/etc/vkpulse/vkpulse.toml";
        if std::path::Path::new(system_path).exists() {
            return system_path.to_string();
        }
    }
    "vkpulse.toml".to_string()
}

fn default_num_timer_query_slots() -> u32 {
    16384
}
