use crate::error::GateError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct GateConfig {
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub reputation: ReputationConfig,
    #[serde(default)]
    pub edge_ban: EdgeBanConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ClassifierConfig {
    #[serde(default = "default_max_input_length")]
    pub max_input_length: usize,
    #[serde(default = "default_excerpt_length")]
    pub excerpt_length: usize,
    /// Use only `custom_rules`, not the built-in set.
    #[serde(default)]
    pub replace_default_rules: bool,
    #[serde(default)] // Empty vec if missing
    pub custom_rules: Vec<CustomRuleConfig>,
    #[serde(default)]
    pub obfuscation: ObfuscationConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CustomRuleConfig {
    pub id: String,
    pub pattern: String,
    #[serde(default = "default_true")]
    pub case_insensitive: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ObfuscationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_obfuscation_threshold")]
    pub threshold: f64,
    #[serde(default = "default_obfuscation_min_length")]
    pub min_length: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReputationConfig {
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
    #[serde(default = "default_incident_log_path")]
    pub incident_log_path: PathBuf,
    /// Background flush period; bounds how much is lost on a crash.
    #[serde(default = "default_persist_interval_secs")]
    pub persist_interval_secs: u64,
    /// Bans are permanent unless this is set.
    #[serde(default)]
    pub ban_ttl_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EdgeBanConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_zone_id_env")]
    pub zone_id_env: String,
    #[serde(default = "default_api_token_env")]
    pub api_token_env: String,
    #[serde(default = "default_edge_notes")]
    pub notes: String,
    /// Override of the Cloudflare API base URL.
    #[serde(default)]
    pub api_base: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProxyConfig {
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    /// Take the origin from `X-Forwarded-For` when it holds a valid IP.
    /// Only safe behind a proxy that overwrites the header.
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_max_input_length() -> usize {
    10 * 1024 // 10KB
}

fn default_excerpt_length() -> usize {
    200
}

fn default_obfuscation_threshold() -> f64 {
    0.8
}

fn default_obfuscation_min_length() -> usize {
    50
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("data/banned-origins.json")
}

fn default_incident_log_path() -> PathBuf {
    PathBuf::from("data/incidents.log")
}

fn default_persist_interval_secs() -> u64 {
    30
}

fn default_zone_id_env() -> String {
    "CF_ZONE_ID".to_string()
}

fn default_api_token_env() -> String {
    "CF_API_KEY".to_string()
}

fn default_edge_notes() -> String {
    "Banned by reputation gate".to_string()
}

fn default_max_body_size() -> usize {
    1048576 // 1MB
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            max_input_length: default_max_input_length(),
            excerpt_length: default_excerpt_length(),
            replace_default_rules: false,
            custom_rules: vec![],
            obfuscation: ObfuscationConfig::default(),
        }
    }
}

impl Default for ObfuscationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: default_obfuscation_threshold(),
            min_length: default_obfuscation_min_length(),
        }
    }
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
            incident_log_path: default_incident_log_path(),
            persist_interval_secs: default_persist_interval_secs(),
            ban_ttl_secs: None,
        }
    }
}

impl Default for EdgeBanConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            zone_id_env: default_zone_id_env(),
            api_token_env: default_api_token_env(),
            notes: default_edge_notes(),
            api_base: None,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_body_size: default_max_body_size(),
            trust_forwarded_for: false,
        }
    }
}

impl GateConfig {
    pub fn from_file(path: &str) -> Result<Self, GateError> {
        let content = fs::read_to_string(path)
            .map_err(|e| GateError::Config(format!("cannot read {}: {}", path, e)))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, GateError> {
        serde_yaml::from_str(content).map_err(|e| GateError::Config(e.to_string()))
    }
}
