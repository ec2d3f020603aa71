use anyhow::Result;
use serde::Deserialize;
use std::path::Path;
use tracing::info;

/// Default chunk size for the block upload protocol: 4 MiB.
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub target: TargetConfig,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub validation: ValidationConfig,

    #[serde(default)]
    pub status: StatusPairs,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub base_url: String,

    #[serde(default)]
    pub api_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    /// Entity holding the business records addressed by envelope id.
    #[serde(default = "default_target_entity")]
    pub entity: String,

    /// Business-key field matched against the event's envelope id.
    #[serde(default = "default_key_field")]
    pub key_field: String,

    /// File-valued attribute receiving the signed artifact.
    #[serde(default = "default_file_attribute")]
    pub file_attribute: String,

    /// Suffix of the conventional display-name field next to the file
    /// attribute.
    #[serde(default = "default_shadow_suffix")]
    pub shadow_suffix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_block_size")]
    pub block_size: usize,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ValidationConfig {
    /// Schema name under which the expected token is stored. Absent means
    /// validation is disabled entirely.
    #[serde(default)]
    pub token_schema: Option<String>,
}

/// One state/status code pair. A category without a configured pair never
/// mutates state/status fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct StatusPair {
    pub state: i64,
    pub status: i64,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct StatusPairs {
    // Webhook log lifecycle.
    #[serde(default)]
    pub received: Option<StatusPair>,
    #[serde(default)]
    pub processed: Option<StatusPair>,
    #[serde(default)]
    pub failed: Option<StatusPair>,

    // Target record, per event category.
    #[serde(default)]
    pub completed: Option<StatusPair>,
    #[serde(default)]
    pub finish_later: Option<StatusPair>,
    #[serde(default)]
    pub declined: Option<StatusPair>,
}

fn default_target_entity() -> String {
    "envelope".to_string()
}
fn default_key_field() -> String {
    "envelope_id".to_string()
}
fn default_file_attribute() -> String {
    "document".to_string()
}
fn default_shadow_suffix() -> String {
    "_name".to_string()
}
fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            entity: default_target_entity(),
            key_field: default_key_field(),
            file_attribute: default_file_attribute(),
            shadow_suffix: default_shadow_suffix(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
        }
    }
}

impl AppConfig {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No config file at {}, using defaults.", path.display());
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path).await?;
        let config: AppConfig = toml::from_str(&content)?;
        info!(
            "Loaded config: target={}, key={}, block_size={}, validation={}",
            config.target.entity,
            config.target.key_field,
            config.upload.block_size,
            config.validation.token_schema.is_some()
        );
        Ok(config)
    }

    /// Field name of the display-name shadow next to the file attribute.
    pub fn shadow_field(&self) -> String {
        format!("{}{}", self.target.file_attribute, self.target.shadow_suffix)
    }
}
