use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const CONFIG_FILE: &str = ".assistant_config.json";

/// Persisted record of the remote resources this deployment owns.
///
/// An id being present means the corresponding remote resource existed at
/// the time of the last successful save; the reconciler re-verifies on
/// startup and drops ids that no longer resolve.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_store_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub knowledge_base_files: Option<u32>,
}

/// Current Unix time as fractional seconds, matching the on-disk format.
pub fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Get the path to the config file (either in the given dir or the app root)
pub fn config_file_path(working_dir: Option<&Path>) -> PathBuf {
    match working_dir {
        Some(dir) => dir.join(CONFIG_FILE),
        None => PathBuf::from(CONFIG_FILE),
    }
}

/// Check if a persisted config exists
pub fn config_exists(working_dir: Option<&Path>) -> bool {
    config_file_path(working_dir).exists()
}

/// Load the persisted config. Fails soft: a missing file or a parse error
/// yields the empty record so startup can fall through to creation.
pub fn load_config(working_dir: Option<&Path>) -> AssistantConfig {
    let config_path = config_file_path(working_dir);

    let content = match fs::read_to_string(&config_path) {
        Ok(content) => content,
        Err(e) => {
            debug!("No readable config at {}: {}", config_path.display(), e);
            return AssistantConfig::default();
        }
    };

    match serde_json::from_str(&content) {
        Ok(config) => {
            debug!("Loaded config from: {}", config_path.display());
            config
        }
        Err(e) => {
            warn!(
                "Failed to parse config file {}, treating as empty: {}",
                config_path.display(),
                e
            );
            AssistantConfig::default()
        }
    }
}

/// Save the config. Fails soft: returns false and logs on I/O error.
pub fn save_config(config: &AssistantConfig, working_dir: Option<&Path>) -> bool {
    let config_path = config_file_path(working_dir);

    debug!("Saving config to: {}", config_path.display());

    let content = match serde_json::to_string_pretty(config) {
        Ok(content) => content,
        Err(e) => {
            warn!("Failed to serialize config: {}", e);
            return false;
        }
    };

    match fs::write(&config_path, content) {
        Ok(()) => {
            info!("Config saved to: {}", config_path.display());
            true
        }
        Err(e) => {
            warn!(
                "Failed to write config file {}: {}",
                config_path.display(),
                e
            );
            false
        }
    }
}

/// Remove the config file. Used by the full reset.
pub fn clear_config(working_dir: Option<&Path>) -> std::io::Result<()> {
    let config_path = config_file_path(working_dir);

    if config_path.exists() {
        info!("Removing config file: {}", config_path.display());
        fs::remove_file(&config_path)?;
    } else {
        warn!("Config file does not exist: {}", config_path.display());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_roundtrip() {
        let temp_dir = tempdir().unwrap();
        let temp_path = temp_dir.path();

        assert!(!config_exists(Some(temp_path)));
        assert_eq!(load_config(Some(temp_path)), AssistantConfig::default());

        let config = AssistantConfig {
            vector_store_id: Some("vs_123".to_string()),
            assistant_id: Some("asst_456".to_string()),
            created_at: Some(epoch_now()),
            knowledge_base_files: Some(3),
        };
        assert!(save_config(&config, Some(temp_path)));
        assert!(config_exists(Some(temp_path)));

        let loaded = load_config(Some(temp_path));
        assert_eq!(loaded, config);

        clear_config(Some(temp_path)).unwrap();
        assert!(!config_exists(Some(temp_path)));
    }

    #[test]
    fn test_load_tolerates_garbage() {
        let temp_dir = tempdir().unwrap();
        let temp_path = temp_dir.path();

        std::fs::write(config_file_path(Some(temp_path)), "{not json").unwrap();
        assert_eq!(load_config(Some(temp_path)), AssistantConfig::default());
    }

    #[test]
    fn test_absent_keys_stay_absent() {
        let temp_dir = tempdir().unwrap();
        let temp_path = temp_dir.path();

        let config = AssistantConfig {
            vector_store_id: Some("vs_123".to_string()),
            ..Default::default()
        };
        assert!(save_config(&config, Some(temp_path)));

        let raw = std::fs::read_to_string(config_file_path(Some(temp_path))).unwrap();
        assert!(raw.contains("vector_store_id"));
        assert!(!raw.contains("assistant_id"));
    }
}
