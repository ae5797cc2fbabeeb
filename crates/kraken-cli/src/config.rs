//! Boot manifest – reads `kraken.toml`.
//!
//! ```toml
//! [kernel]
//! max_services = 16
//!
//! [kernel.bus]
//! queue_capacity = 32
//!
//! [boot]
//! start_order = ["system", "display", "wifi"]
//!
//! [[boot.services]]
//! name = "wifi"
//! permissions = "WIFI | NETWORK"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use kraken_kernel::KernelConfig;
use kraken_runtime::BootConfig;
use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG_FILE: &str = "kraken.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub kernel: KernelConfig,
    pub boot: BootConfig,
}

/// `$KRAKEN_CONFIG`, or `./kraken.toml`.
pub fn config_path() -> PathBuf {
    config_path_from(std::env::var("KRAKEN_CONFIG").ok())
}

pub(crate) fn config_path_from(var: Option<String>) -> PathBuf {
    var.filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Load the manifest and apply environment overrides. Returns `None` if
/// the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    let mut cfg = load_from(&config_path())?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    toml::from_str(&raw)
        .map(Some)
        .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))
}

/// Apply `KRAKEN_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `KRAKEN_START_ORDER` | `boot.start_order` (comma-separated) |
/// | `KRAKEN_QUEUE_CAPACITY` | `kernel.bus.queue_capacity` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("KRAKEN_START_ORDER") {
        cfg.boot.start_order = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }
    if let Ok(v) = std::env::var("KRAKEN_QUEUE_CAPACITY")
        && let Ok(depth) = v.parse::<usize>()
    {
        cfg.kernel.bus.queue_capacity = depth;
    }
}

/// The effective configuration as TOML.
pub fn render(cfg: &Config) -> Result<String, String> {
    toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kraken_types::Permissions;

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let result = load_from(&dir.path().join("kraken.toml")).expect("no error");
        assert!(result.is_none());
    }

    #[test]
    fn empty_file_yields_stock_firmware() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("kraken.toml");
        fs::write(&path, "").expect("write");

        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.kernel, KernelConfig::default());
        assert_eq!(cfg.boot.services.len(), 4);
    }

    #[test]
    fn manifest_overrides_kernel_and_boot() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("kraken.toml");
        fs::write(
            &path,
            r#"
            [kernel]
            max_services = 8

            [kernel.bus]
            max_listeners = 64

            [boot]
            start_order = ["display"]

            [[boot.services]]
            name = "display"
            permissions = "DISPLAY | AUDIO"
            "#,
        )
        .expect("write");

        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.kernel.max_services, 8);
        assert_eq!(cfg.kernel.bus.max_listeners, 64);
        assert_eq!(cfg.boot.start_order, ["display"]);
        assert_eq!(
            cfg.boot.services[0].permissions,
            Some(Permissions::DISPLAY | Permissions::AUDIO)
        );
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("kraken.toml");
        fs::write(&path, "[kernel\nmax_services = ").expect("write");
        let err = load_from(&path).expect_err("must fail");
        assert!(err.contains("kraken.toml"), "{err}");
    }

    #[test]
    fn rendered_config_loads_back() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("kraken.toml");
        let cfg = Config::default();
        fs::write(&path, render(&cfg).expect("render")).expect("write");
        assert_eq!(load_from(&path).expect("load ok"), Some(cfg));
    }

    #[test]
    fn config_path_defaults_to_working_dir() {
        assert_eq!(config_path_from(None), PathBuf::from("kraken.toml"));
        assert_eq!(config_path_from(Some("  ".into())), PathBuf::from("kraken.toml"));
        assert_eq!(
            config_path_from(Some("/etc/kraken.toml".into())),
            PathBuf::from("/etc/kraken.toml")
        );
    }

    #[test]
    fn env_overrides_start_order_and_queue_depth() {
        // SAFETY: the only test in this crate touching these variables.
        unsafe {
            std::env::set_var("KRAKEN_START_ORDER", "system, display");
            std::env::set_var("KRAKEN_QUEUE_CAPACITY", "not-a-number");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.boot.start_order, ["system", "display"]);
        assert_eq!(cfg.kernel.bus.queue_capacity, 32);

        unsafe { std::env::set_var("KRAKEN_QUEUE_CAPACITY", "8") };
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.kernel.bus.queue_capacity, 8);
        unsafe {
            std::env::remove_var("KRAKEN_START_ORDER");
            std::env::remove_var("KRAKEN_QUEUE_CAPACITY");
        }
    }
}
