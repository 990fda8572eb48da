use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::Engine as _;
use serde::Deserialize;

/// Written to the config path on first run.
pub const CONFIG_TEMPLATE: &str = include_str!("../config/blobwatchd.example.toml");

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub watch: Vec<WatchRoot>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_true")]
    pub initial_scan: bool,
    #[serde(default = "default_true")]
    pub use_polling: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_transfers: usize,
    /// Custom path for the last-synced state file
    pub state_path: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            initial_scan: true,
            use_polling: true,
            poll_interval_ms: default_poll_interval(),
            debounce_ms: default_debounce_ms(),
            max_concurrent_transfers: default_max_concurrent(),
            state_path: None,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_poll_interval() -> u64 {
    5000
}
fn default_debounce_ms() -> u64 {
    2000
}
fn default_max_concurrent() -> usize {
    4
}

#[derive(Clone, Deserialize)]
pub struct StorageConfig {
    pub account_name: String,
    pub access_key: String,
    /// Override for `https://<account_name>.blob.core.windows.net`
    pub endpoint: Option<String>,
}

impl std::fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageConfig")
            .field("account_name", &self.account_name)
            .field("access_key", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchRoot {
    pub local_path: PathBuf,
    /// `container` or `container/key/prefix`
    pub container_path: String,
    #[serde(default)]
    pub exclude: Vec<String>,
}

pub fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("Could not determine config directory")?;
    Ok(dir.join("blobwatchd").join("config.toml"))
}

pub fn resolve_config_path(custom: Option<&Path>) -> Result<PathBuf> {
    match custom {
        Some(p) => Ok(p.to_path_buf()),
        None => default_config_path(),
    }
}

/// Write the template to `path` if nothing is there yet.
///
/// Returns `true` when the template was written; the caller should stop and
/// let the operator fill it in rather than run against placeholder values.
pub fn ensure_config(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
    }
    std::fs::write(path, CONFIG_TEMPLATE)
        .with_context(|| format!("Failed to write config template: {}", path.display()))?;

    tracing::info!(path = %path.display(), "wrote config template");
    Ok(true)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    validate(&config).with_context(|| format!("Invalid config file: {}", path.display()))?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.storage.account_name.trim().is_empty() {
        anyhow::bail!("storage.account_name must not be empty");
    }
    if config.storage.access_key.trim().is_empty() {
        anyhow::bail!("storage.access_key must not be empty");
    }
    base64::engine::general_purpose::STANDARD
        .decode(config.storage.access_key.trim())
        .context("storage.access_key must be the base64 key from the storage account")?;

    if config.watch.is_empty() {
        anyhow::bail!("at least one [[watch]] entry is required");
    }
    for (i, root) in config.watch.iter().enumerate() {
        if !root.local_path.is_absolute() {
            anyhow::bail!(
                "watch #{i}: local_path must be absolute: {}",
                root.local_path.display()
            );
        }
        if root.container_path.trim_matches('/').is_empty() {
            anyhow::bail!("watch #{i}: container_path must not be empty");
        }
    }

    if config.general.max_concurrent_transfers == 0 {
        anyhow::bail!("general.max_concurrent_transfers must be at least 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const VALID: &str = r#"
        [storage]
        account_name = "acct"
        access_key = "c2VjcmV0"

        [[watch]]
        local_path = "/data"
        container_path = "docs"
    "#;

    fn write(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = load_config(&write(&dir, VALID)).unwrap();

        assert!(cfg.general.initial_scan);
        assert!(cfg.general.use_polling);
        assert_eq!(cfg.general.poll_interval_ms, 5000);
        assert_eq!(cfg.general.max_concurrent_transfers, 4);
        assert_eq!(cfg.watch.len(), 1);
        assert_eq!(cfg.watch[0].container_path, "docs");
        assert!(cfg.watch[0].exclude.is_empty());
    }

    #[test]
    fn relative_watch_path_is_rejected() {
        let dir = TempDir::new().unwrap();
        let content = VALID.replace("\"/data\"", "\"data\"");
        let err = load_config(&write(&dir, &content)).unwrap_err();
        assert!(format!("{err:#}").contains("must be absolute"));
    }

    #[test]
    fn missing_watch_entries_are_rejected() {
        let dir = TempDir::new().unwrap();
        let content = r#"
            [storage]
            account_name = "acct"
            access_key = "c2VjcmV0"
        "#;
        let err = load_config(&write(&dir, content)).unwrap_err();
        assert!(format!("{err:#}").contains("[[watch]]"));
    }

    #[test]
    fn bad_access_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let content = VALID.replace("c2VjcmV0", "not-base64!");
        let err = load_config(&write(&dir, &content)).unwrap_err();
        assert!(format!("{err:#}").contains("access_key"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(load_config(&dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn ensure_config_writes_template_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub").join("config.toml");

        assert!(ensure_config(&path).unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), CONFIG_TEMPLATE);

        std::fs::write(&path, VALID).unwrap();
        assert!(!ensure_config(&path).unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), VALID);
    }

    #[test]
    fn template_parses_but_needs_editing() {
        let parsed: Config = toml::from_str(CONFIG_TEMPLATE).unwrap();
        assert_eq!(parsed.watch.len(), 1);
        assert!(validate(&parsed).is_err());
    }
}
