//! `knockd.json` daemon configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Locations searched when no config path is given on the command line.
const COMMON_LOCATIONS: &[&str] = &[
    "knockd.json",
    "~/.knockd.json",
    "~/.config/knockd/knockd.json",
    "/etc/knockd/knockd.json",
    "/usr/local/etc/knockd/knockd.json",
];

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DaemonConfig {
    /// Interface the kernel filter attaches to.
    pub network_interface: String,
    /// Directory whose regular files are base32 secret files.
    pub pre_shared_key_directory: String,
    /// Command template run on a completed knock; `%s` ← source address.
    pub success_action: String,
    /// If > 0, the close action runs this many seconds after success
    /// (unless the client refreshes). 0 makes success one-shot.
    pub timeout_seconds: u64,
    /// Command template run at grant expiry; `%s` ← source address.
    pub timeout_action: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            network_interface: "eth0".into(),
            pre_shared_key_directory: "./secrets/".into(),
            success_action: "iptables -A INPUT -p tcp -s %s --dport 22 -j ACCEPT".into(),
            timeout_seconds: 1440,
            timeout_action: "iptables -D INPUT -p tcp -s %s --dport 22 -j ACCEPT".into(),
        }
    }
}

impl DaemonConfig {
    /// Load from an explicit path, or search the common locations. With no
    /// path given and nothing found, the built-in default applies — an
    /// explicitly named file that fails to load is an error, not a fallback.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match discover_config() {
                Some(p) => p,
                None => {
                    eprintln!(
                        "no configuration file found — using defaults; \
                         generate one with `knockd generate defaultconfig > knockd.json`"
                    );
                    return Ok(Self::default());
                }
            },
        };

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(cfg)
    }
}

fn discover_config() -> Option<PathBuf> {
    let home = std::env::var_os("HOME");
    COMMON_LOCATIONS
        .iter()
        .map(|loc| match (loc.strip_prefix("~/"), &home) {
            (Some(rest), Some(home)) => Path::new(home).join(rest),
            _ => PathBuf::from(loc),
        })
        .find(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_documented_field_names() {
        let cfg: DaemonConfig = serde_json::from_str(
            r#"{
                "networkInterface": "enp0s3",
                "preSharedKeyDirectory": "/etc/knockd/secrets",
                "successAction": "echo open %s",
                "timeoutSeconds": 60,
                "timeoutAction": "echo close %s"
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.network_interface, "enp0s3");
        assert_eq!(cfg.pre_shared_key_directory, "/etc/knockd/secrets");
        assert_eq!(cfg.timeout_seconds, 60);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let cfg: DaemonConfig = serde_json::from_str(r#"{"networkInterface": "wlan0"}"#).unwrap();
        assert_eq!(cfg.network_interface, "wlan0");
        assert_eq!(cfg.timeout_seconds, 1440);
        assert!(cfg.success_action.contains("%s"));
    }

    #[test]
    fn test_default_round_trips() {
        let rendered = serde_json::to_string_pretty(&DaemonConfig::default()).unwrap();
        assert!(rendered.contains("networkInterface"));
        let parsed: DaemonConfig = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed.timeout_seconds, DaemonConfig::default().timeout_seconds);
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knockd.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(DaemonConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        assert!(DaemonConfig::load(Some(Path::new("/nonexistent/knockd.json"))).is_err());
    }
}
