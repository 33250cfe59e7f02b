use std::path::Path;

use serde::Deserialize;

/// Configuration record consumed by the core plus the handful of ambient
/// fields the binary needs for the RFB/CLI layer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub layout: String,
    pub variant: String,
    pub rate_limit_hz: f64,
    pub smoother_time_constant: f64,
    pub prefer_dmabuf: bool,
    pub overlay_cursor: bool,

    /// Address the RFB server binds to. Not part of the core; the core
    /// never sees a socket.
    pub listen_addr: String,
    /// Single pre-shared `VncAuth` secret. Left empty by default so a config
    /// without one fails loudly at startup instead of silently
    /// authenticating every client.
    pub password: String,
    /// GL upload format used when the wire format is not in the known set.
    pub shm_format_fallback: String,
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            layout: "us".to_string(),
            variant: String::new(),
            rate_limit_hz: 20.0,
            smoother_time_constant: 0.5,
            prefer_dmabuf: true,
            overlay_cursor: false,
            listen_addr: "127.0.0.1:5900".to_string(),
            password: String::new(),
            shm_format_fallback: "BGRA8888".to_string(),
            log_filter: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&text)?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_expected_rate_limit() {
        let cfg = Config::default();
        assert_eq!(cfg.rate_limit_hz, 20.0);
        assert_eq!(cfg.smoother_time_constant, 0.5);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg: Config = toml::from_str("layout = \"de\"\nprefer_dmabuf = false\n").unwrap();
        assert_eq!(cfg.layout, "de");
        assert!(!cfg.prefer_dmabuf);
        assert_eq!(cfg.rate_limit_hz, 20.0);
    }

    #[test]
    fn from_file_reads_a_real_toml_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("wlrvncd.toml");
        std::fs::write(&path, "listen_addr = \"0.0.0.0:5901\"\nrate_limit_hz = 30.0\n").unwrap();

        let cfg = Config::from_file(&path).expect("from_file");
        assert_eq!(cfg.listen_addr, "0.0.0.0:5901");
        assert_eq!(cfg.rate_limit_hz, 30.0);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.layout, "us");
    }

    #[test]
    fn from_file_missing_path_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("does-not-exist.toml");
        assert!(Config::from_file(&missing).is_err());
    }
}
