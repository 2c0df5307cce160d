use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HeronError, HeronResult};

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeronConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: StatementCacheConfig,
    #[serde(default)]
    pub copy: CopyConfig,
}

impl HeronConfig {
    pub fn from_toml_str(text: &str) -> HeronResult<Self> {
        let config: HeronConfig = toml::from_str(text)
            .map_err(|e| HeronError::internal(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> HeronResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        tracing::info!("loaded configuration from {}", path.display());
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> HeronResult<()> {
        if self.server.max_message_size < 1024 {
            return Err(HeronError::internal("server.max_message_size must be >= 1024"));
        }
        let single_byte = |s: &str| s.len() == 1;
        if !single_byte(&self.copy.delimiter) {
            return Err(HeronError::internal("copy.delimiter must be a single byte"));
        }
        if !single_byte(&self.copy.quote) || !single_byte(&self.copy.escape) {
            return Err(HeronError::internal("copy.quote and copy.escape must be single bytes"));
        }
        if self.copy.delimiter == self.copy.quote {
            return Err(HeronError::internal("copy.delimiter and copy.quote must differ"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// PG wire protocol listen address.
    pub listen_addr: String,
    /// Max concurrent connections (0 = unlimited).
    pub max_connections: usize,
    /// Largest frontend message accepted, in bytes. COPY data and
    /// Bind messages are the usual offenders.
    pub max_message_size: usize,
    /// Result encoding for new sessions. `SET output_format` overrides it.
    pub output_format: OutputFormat,
    /// Seconds to wait for active connections after shutdown is requested.
    pub shutdown_drain_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:15432".to_string(),
            max_connections: 0,
            max_message_size: 64 * 1024 * 1024,
            output_format: OutputFormat::Table,
            shutdown_drain_timeout_secs: 30,
        }
    }
}

/// How query results are put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    JsonWithMetaData,
}

impl OutputFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "table" => Some(OutputFormat::Table),
            "json" => Some(OutputFormat::Json),
            "json_with_meta_data" => Some(OutputFormat::JsonWithMetaData),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Table => "table",
            OutputFormat::Json => "json",
            OutputFormat::JsonWithMetaData => "json_with_meta_data",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatementCacheConfig {
    /// Max compiled statements kept per server (0 disables caching).
    pub capacity: usize,
}

impl Default for StatementCacheConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// Defaults for `COPY ... WITH (FORMAT csv)` when the statement leaves an
/// option out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyConfig {
    pub delimiter: String,
    pub quote: String,
    pub escape: String,
    pub null_string: String,
    pub record_terminator: String,
    /// Allow `COPY ... FROM/TO 'file'` against the server's filesystem.
    pub allow_server_files: bool,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            delimiter: ",".to_string(),
            quote: "\"".to_string(),
            escape: "\"".to_string(),
            null_string: String::new(),
            record_terminator: "\n".to_string(),
            allow_server_files: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = HeronConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.output_format, OutputFormat::Table);
        assert_eq!(config.cache.capacity, 1024);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = HeronConfig::from_toml_str(
            r#"
            [server]
            listen_addr = "0.0.0.0:6543"
            output_format = "json_with_meta_data"

            [cache]
            capacity = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:6543");
        assert_eq!(config.server.output_format, OutputFormat::JsonWithMetaData);
        assert_eq!(config.server.shutdown_drain_timeout_secs, 30);
        assert_eq!(config.cache.capacity, 0);
        assert_eq!(config.copy.delimiter, ",");
    }

    #[test]
    fn test_bad_delimiter_rejected() {
        let err = HeronConfig::from_toml_str("[copy]\ndelimiter = \"::\"\n").unwrap_err();
        assert!(err.to_string().contains("delimiter"));
    }

    #[test]
    fn test_delimiter_equal_to_quote_rejected() {
        let mut config = HeronConfig::default();
        config.copy.delimiter = "\"".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heron.toml");
        std::fs::write(&path, "[server]\nmax_connections = 8\n").unwrap();
        let config = HeronConfig::load(&path).unwrap();
        assert_eq!(config.server.max_connections, 8);
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!(OutputFormat::parse("JSON"), Some(OutputFormat::Json));
        assert_eq!(OutputFormat::parse(" table "), Some(OutputFormat::Table));
        assert_eq!(OutputFormat::parse("xml"), None);
        assert_eq!(OutputFormat::JsonWithMetaData.as_str(), "json_with_meta_data");
    }
}
