//! Platform configuration
//!
//! One TOML document drives adapters, replay and fees:
//!
//! ```toml
//! [replay]
//! begin_time = 202401020930
//! end_time = 202401311500
//! tick_enabled = true
//! auto_transform = false
//! output_dir = "outputs_bt"
//!
//! [[parsers]]
//! id = "p1"
//! kind = "jsonl"
//! exchanges = ["SSE"]
//! codes = []
//! params = { path = "data/quotes.jsonl" }
//!
//! [[contracts]]
//! code = "SHFE.rb2405"
//! price_tick = 1.0
//!
//! [fees]
//! commission_rate = 0.0002
//!
//! [live]
//! delivery = "queued"
//! ```

use crate::error::{PlatformError, PlatformResult};
use crate::ingest::DeliveryMode;
use crate::replay::clock::ymdhm_to_nanos;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default)]
    pub replay: ReplayConfig,

    #[serde(default)]
    pub parsers: Vec<ParserConfig>,

    #[serde(default)]
    pub contracts: Vec<ContractConfig>,

    #[serde(default)]
    pub fees: FeeConfig,

    #[serde(default)]
    pub live: LiveConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PlatformConfig {
    /// Parse and validate TOML text.
    pub fn from_toml_str(text: &str) -> PlatformResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| PlatformError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> PlatformResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| PlatformError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    /// Load from `TRADELOOM_CONFIG` or `tradeloom.toml`, falling back to defaults.
    pub fn from_env() -> Self {
        let path =
            std::env::var("TRADELOOM_CONFIG").unwrap_or_else(|_| "tradeloom.toml".to_string());

        Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default platform config ({}): {}", path, e);
            Self::default()
        })
    }

    /// Save to TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> PlatformResult<()> {
        self.replay.validate()?;
        let mut ids = HashSet::new();
        for parser in &self.parsers {
            parser.validate()?;
            if !ids.insert(parser.id.as_str()) {
                return Err(PlatformError::DuplicateId(parser.id.clone()));
            }
        }
        for contract in &self.contracts {
            if contract.code.trim().is_empty() {
                return Err(PlatformError::Config("contract with blank code".into()));
            }
            if !(contract.price_tick > 0.0) {
                return Err(PlatformError::Config(format!(
                    "price_tick of {} must be positive",
                    contract.code
                )));
            }
        }
        if !(self.fees.commission_rate >= 0.0) {
            return Err(PlatformError::Config("commission_rate must be >= 0".into()));
        }
        Ok(())
    }

    /// Minimum price increment of `code`; 1.0 for unlisted instruments.
    pub fn price_tick(&self, code: &str) -> f64 {
        self.contracts
            .iter()
            .find(|c| c.code == code)
            .map_or(1.0, |c| c.price_tick)
    }
}

/// Backtest replay parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// `YYYYMMDDHHMM`; unbounded when absent.
    #[serde(default)]
    pub begin_time: Option<u64>,

    #[serde(default)]
    pub end_time: Option<u64>,

    /// Replay ticks as well as bars.
    #[serde(default = "default_true")]
    pub tick_enabled: bool,

    /// Rescale historical prices with adjustment factors.
    #[serde(default)]
    pub auto_transform: bool,

    /// Root for blotter dumps and persisted user data.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Persist context user data between runs.
    #[serde(default = "default_true")]
    pub persist_userdata: bool,
}

fn default_true() -> bool {
    true
}

fn default_output_dir() -> String {
    "outputs_bt".to_string()
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            begin_time: None,
            end_time: None,
            tick_enabled: true,
            auto_transform: false,
            output_dir: default_output_dir(),
            persist_userdata: true,
        }
    }
}

impl ReplayConfig {
    fn validate(&self) -> PlatformResult<()> {
        let begin = self
            .begin_time
            .map(|t| ymdhm_to_nanos(t).ok_or(t))
            .transpose()
            .map_err(|t| PlatformError::Config(format!("bad begin_time {}", t)))?;
        let end = self
            .end_time
            .map(|t| ymdhm_to_nanos(t).ok_or(t))
            .transpose()
            .map_err(|t| PlatformError::Config(format!("bad end_time {}", t)))?;
        if let (Some(b), Some(e)) = (begin, end) {
            if b > e {
                return Err(PlatformError::Config("begin_time after end_time".into()));
            }
        }
        Ok(())
    }
}

/// One market data parser adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserConfig {
    pub id: String,

    #[serde(default = "default_true")]
    pub active: bool,

    /// Connector kind resolved through the connector registry.
    pub kind: String,

    /// Exchange filter; empty passes all.
    #[serde(default)]
    pub exchanges: Vec<String>,

    /// Instrument filter; empty passes all.
    #[serde(default)]
    pub codes: Vec<String>,

    /// Connector-specific parameters.
    #[serde(default)]
    pub params: toml::Table,
}

impl ParserConfig {
    pub fn new(id: &str, kind: &str) -> Self {
        Self {
            id: id.to_string(),
            active: true,
            kind: kind.to_string(),
            exchanges: Vec::new(),
            codes: Vec::new(),
            params: toml::Table::new(),
        }
    }

    pub fn validate(&self) -> PlatformResult<()> {
        if self.id.trim().is_empty() {
            return Err(PlatformError::Config("parser with blank id".into()));
        }
        if self.kind.trim().is_empty() {
            return Err(PlatformError::Config(format!(
                "parser {} has no connector kind",
                self.id
            )));
        }
        Ok(())
    }
}

/// Static contract information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractConfig {
    pub code: String,

    #[serde(default = "default_price_tick")]
    pub price_tick: f64,
}

fn default_price_tick() -> f64 {
    1.0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeeConfig {
    /// Fraction of turnover charged per fill.
    #[serde(default)]
    pub commission_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    #[serde(default = "default_delivery")]
    pub delivery: DeliveryMode,
}

fn default_delivery() -> DeliveryMode {
    DeliveryMode::Queued
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            delivery: default_delivery(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// EnvFilter directive used when `RUST_LOG` is unset.
    #[serde(default)]
    pub profile: Option<String>,

    /// Also write logs to this file.
    #[serde(default)]
    pub file: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[replay]
begin_time = 202401020930
end_time = 202401311500
auto_transform = true

[[parsers]]
id = "p1"
kind = "jsonl"
exchanges = ["SSE"]
params = { path = "quotes.jsonl", pace_ms = 0 }

[[contracts]]
code = "SHFE.rb2405"
price_tick = 1.0

[fees]
commission_rate = 0.0002

[live]
delivery = "inline"
"#;

    #[test]
    fn test_parse_sample() {
        let config = PlatformConfig::from_toml_str(SAMPLE).unwrap();
        assert!(config.replay.auto_transform);
        assert!(config.replay.tick_enabled);
        assert_eq!(config.replay.output_dir, "outputs_bt");
        assert_eq!(config.parsers.len(), 1);
        assert_eq!(config.parsers[0].exchanges, vec!["SSE".to_string()]);
        assert_eq!(
            config.parsers[0].params.get("path").and_then(|v| v.as_str()),
            Some("quotes.jsonl")
        );
        assert_eq!(config.live.delivery, DeliveryMode::Inline);
        assert_eq!(config.price_tick("SHFE.rb2405"), 1.0);
        assert_eq!(config.price_tick("unknown"), 1.0);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = PlatformConfig::from_toml_str("").unwrap();
        assert!(config.parsers.is_empty());
        assert_eq!(config.live.delivery, DeliveryMode::Queued);
        assert!(config.replay.persist_userdata);
    }

    #[test]
    fn test_duplicate_parser_ids_rejected() {
        let text = r#"
[[parsers]]
id = "p1"
kind = "jsonl"

[[parsers]]
id = "p1"
kind = "channel"
"#;
        assert!(matches!(
            PlatformConfig::from_toml_str(text),
            Err(PlatformError::DuplicateId(_))
        ));
    }

    #[test]
    fn test_bad_time_range_rejected() {
        let text = "[replay]\nbegin_time = 202402010000\nend_time = 202401010000\n";
        assert!(PlatformConfig::from_toml_str(text).is_err());
        let text = "[replay]\nbegin_time = 202413010000\n";
        assert!(PlatformConfig::from_toml_str(text).is_err());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("platform.toml");
        let config = PlatformConfig::from_toml_str(SAMPLE).unwrap();
        config.save(&path).unwrap();
        let loaded = PlatformConfig::load(&path).unwrap();
        assert_eq!(loaded.parsers[0].id, "p1");
        assert_eq!(loaded.fees.commission_rate, 0.0002);
    }
}
