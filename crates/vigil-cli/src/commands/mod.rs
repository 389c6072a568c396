pub mod classify;
pub mod rules;
pub mod run;

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use vigil_types::{PilotConfig, CONFIG_FILENAME};

/// Load `path`, or `./vigil.toml` if it exists, or the defaults.
pub fn load_config(path: Option<&Path>) -> Result<PilotConfig> {
    if let Some(path) = path {
        return PilotConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()));
    }
    let local = Path::new(CONFIG_FILENAME);
    if local.is_file() {
        info!(path = %local.display(), "using local configuration");
        return PilotConfig::load(local)
            .with_context(|| format!("failed to load config {}", local.display()));
    }
    Ok(PilotConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_config_is_loaded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"[guard]\ncooldown_ms = 1234\n").unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.guard.cooldown_ms, 1234);
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let err = load_config(Some(Path::new("/nonexistent/vigil.toml"))).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/vigil.toml"), "{err:#}");
    }

    #[test]
    fn invalid_config_reports_field() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"[delivery]\nretry_attempts = 0\n").unwrap();
        let err = load_config(Some(file.path())).unwrap_err();
        assert!(format!("{err:#}").contains("retry_attempts"), "{err:#}");
    }
}
