use std::path::{Path, PathBuf};

use anyhow::Context;
use courier_queue::QueueConfig;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "COURIER_CONFIG";

fn default_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from("./courier.config.ron"),
        PathBuf::from("/etc/courier/courier.config.ron"),
    ]
}

/// Find the configuration file using the following precedence:
/// 1. `COURIER_CONFIG` environment variable
/// 2. ./courier.config.ron (current working directory)
/// 3. /etc/courier/courier.config.ron (system-wide config)
///
/// # Errors
/// If `COURIER_CONFIG` names a missing file, or none of the defaults exist
pub fn find_config_file() -> anyhow::Result<PathBuf> {
    locate(
        std::env::var_os(CONFIG_ENV).map(PathBuf::from),
        &default_paths(),
    )
}

fn locate(from_env: Option<PathBuf>, defaults: &[PathBuf]) -> anyhow::Result<PathBuf> {
    if let Some(path) = from_env {
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "{CONFIG_ENV} points to non-existent file: {}",
            path.display()
        );
    }

    if let Some(path) = defaults.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = defaults
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )
}

/// Read and parse a RON queue configuration
///
/// # Errors
/// If the file cannot be read or is not a valid configuration
pub fn load(path: &Path) -> anyhow::Result<QueueConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;

    ron::from_str(&content)
        .with_context(|| format!("Failed to parse config from {}", path.display()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use courier_store::StoreConfig;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_env_takes_precedence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let from_env = dir.path().join("env.ron");
        let fallback = dir.path().join("fallback.ron");
        std::fs::write(&from_env, "()").unwrap();
        std::fs::write(&fallback, "()").unwrap();

        let found = locate(Some(from_env.clone()), &[fallback]).unwrap();
        assert_eq!(found, from_env);
    }

    #[test]
    fn test_env_must_exist() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fallback = dir.path().join("fallback.ron");
        std::fs::write(&fallback, "()").unwrap();

        let err = locate(Some(dir.path().join("missing.ron")), &[fallback]).unwrap_err();
        assert!(err.to_string().contains("non-existent"));
    }

    #[test]
    fn test_first_existing_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("missing.ron");
        let present = dir.path().join("present.ron");
        std::fs::write(&present, "()").unwrap();

        assert_eq!(locate(None, &[missing.clone(), present.clone()]).unwrap(), present);

        let err = locate(None, &[missing]).unwrap_err();
        assert!(err.to_string().contains("missing.ron"));
    }

    #[test]
    fn test_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("courier.config.ron");
        std::fs::write(
            &path,
            r#"Courier (
                retry: (max_retries: 3),
                store: File(path: "/srv/courier"),
            )"#,
        )
        .unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(
            config.store,
            StoreConfig::File {
                path: PathBuf::from("/srv/courier"),
                capacity: None,
            }
        );

        std::fs::write(&path, "Courier (retry: 7)").unwrap();
        assert!(load(&path).is_err());
        assert!(load(&dir.path().join("absent.ron")).is_err());
    }
}
