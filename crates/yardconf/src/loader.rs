//! Config file discovery, loading, and environment variable overlay.

use std::env;
use std::path::{Path, PathBuf};

use crate::{ConfigError, SwitchyardConfig};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local). Only returns files
/// that exist. A CLI override replaces the local file and short-circuits.
pub fn discover_config_files(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/switchyard/config.json");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("switchyard/config.json");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("switchyard.json");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load config from a single JSON file.
pub fn load_from_file(path: &Path) -> Result<SwitchyardConfig, ConfigError> {
    let raw = load_raw(path)?;
    serde_json::from_value(raw).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Load a file as a raw JSON object, before any defaults are applied.
///
/// Files are merged raw so that a key a later file does not mention keeps
/// the earlier file's value instead of snapping back to the compiled
/// default.
fn load_raw(path: &Path) -> Result<serde_json::Value, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let value: serde_json::Value =
        serde_json::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    if !value.is_object() {
        return Err(ConfigError::Parse {
            path: path.to_path_buf(),
            message: "config root must be a JSON object".to_string(),
        });
    }
    Ok(value)
}

impl SwitchyardConfig {
    /// Load configuration from all sources and validate it.
    ///
    /// Load order (later wins): compiled defaults, discovered files, then
    /// environment variables.
    pub fn load(cli_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources(cli_path)?;
        Ok(config)
    }

    /// Load configuration and report which sources contributed.
    pub fn load_with_sources(
        cli_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = serde_json::Value::Object(serde_json::Map::new());

        for path in discover_config_files(cli_path) {
            let raw = load_raw(&path)?;
            merge_value(&mut merged, raw);
            sources.files.push(path);
        }

        // Defaults fill whatever the merged files did not set.
        let mut config: SwitchyardConfig =
            serde_json::from_value(merged).map_err(|e| ConfigError::Parse {
                path: PathBuf::from("<merged>"),
                message: e.to_string(),
            })?;

        apply_env_overrides(&mut config, &mut sources);

        config.validate()?;
        Ok((config, sources))
    }
}

/// Overlay `overlay` onto `base` key-by-key; nested objects merge
/// recursively, everything else replaces.
fn merge_value(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_value(existing, value);
                    }
                    _ => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut SwitchyardConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("SWITCHYARD_BROKER_HOST") {
        config.broker.broker_host = v;
        sources.env_overrides.push("SWITCHYARD_BROKER_HOST".to_string());
    }
    if let Ok(v) = env::var("SWITCHYARD_BROKER_PORT") {
        if let Ok(port) = v.parse() {
            config.broker.broker_port = port;
            sources.env_overrides.push("SWITCHYARD_BROKER_PORT".to_string());
        }
    }
    if let Ok(v) = env::var("SWITCHYARD_CLIENT_ID") {
        config.broker.client_id = v;
        sources.env_overrides.push("SWITCHYARD_CLIENT_ID".to_string());
    }
    if let Ok(v) = env::var("SWITCHYARD_USERNAME") {
        config.broker.username = Some(v);
        sources.env_overrides.push("SWITCHYARD_USERNAME".to_string());
    }
    if let Ok(v) = env::var("SWITCHYARD_PASSWORD") {
        config.broker.password = Some(v);
        sources.env_overrides.push("SWITCHYARD_PASSWORD".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_missing_file_fails() {
        let err = load_from_file(Path::new("/nonexistent/switchyard.json")).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead { .. }));
    }

    #[test]
    fn test_load_bad_json_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = load_from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"broker_host": "broker.lan", "qos": 2}}"#).unwrap();
        let config = load_from_file(file.path()).unwrap();
        assert_eq!(config.broker.broker_host, "broker.lan");
        assert_eq!(config.broker.qos, 2);
        // Unspecified keys fall back to defaults.
        assert_eq!(config.broker.broker_port, 1883);
    }

    #[test]
    fn test_merge_preserves_earlier_keys() {
        let mut base = serde_json::json!({"broker_host": "a", "keepalive": 10});
        let overlay = serde_json::json!({"broker_host": "b"});
        merge_value(&mut base, overlay);
        assert_eq!(base["broker_host"], "b");
        // A key the overlay does not mention survives the merge.
        assert_eq!(base["keepalive"], 10);
    }

    #[test]
    fn test_merge_nested_objects() {
        let mut base = serde_json::json!({"heartbeat": {"topic": "sys/hb", "interval_seconds": 5}});
        let overlay = serde_json::json!({"heartbeat": {"payload": "ok"}});
        merge_value(&mut base, overlay);
        assert_eq!(base["heartbeat"]["topic"], "sys/hb");
        assert_eq!(base["heartbeat"]["payload"], "ok");
    }

    #[test]
    fn test_discover_does_not_panic() {
        let _files = discover_config_files(None);
    }
}
