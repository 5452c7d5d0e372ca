//! Configuration for documents and the execution host.
//!
//! Loaded from an optional `loom.toml`; every key has a default, so an empty
//! file (or no file) yields a working configuration.
//!
//! ```toml
//! block_prefix = "{r"
//! auto_evaluate = true
//!
//! [host]
//! program = "sh"
//! startup_timeout_ms = 3000
//!
//! [host.options]
//! init = ["export LANG=C.UTF-8"]
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Default time the host gets to come up.
pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 3000;

/// Placeholder replaced by the end-of-output marker in `marker_command`.
pub const MARKER_PLACEHOLDER: &str = "{marker}";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoomConfig {
    /// Identifier used to name the document's session. Defaults to the
    /// document file stem when rendering from the CLI.
    pub document_id: Option<String>,
    /// Designator prefix of evaluable fenced blocks.
    pub block_prefix: String,
    /// Prefix of output region identifiers.
    pub slot_prefix: String,
    /// Evaluate automatically after each pass.
    pub auto_evaluate: bool,
    /// Start the session in the background when the document is created.
    pub prestart_session: bool,
    /// Execution host settings.
    pub host: HostConfig,
}

impl Default for LoomConfig {
    fn default() -> Self {
        Self {
            document_id: None,
            block_prefix: "{r".to_string(),
            slot_prefix: "b".to_string(),
            auto_evaluate: true,
            prestart_session: true,
            host: HostConfig::default(),
        }
    }
}

impl LoomConfig {
    /// Parse configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Self::from_toml_str(&text)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        if self.block_prefix.trim().is_empty() {
            return Err(Error::Config("block_prefix must not be empty".to_string()));
        }
        if self.host.program.trim().is_empty() {
            return Err(Error::Config("host.program must not be empty".to_string()));
        }
        if !self.host.marker_command.contains(MARKER_PLACEHOLDER) {
            return Err(Error::Config(format!(
                "host.marker_command must contain {}",
                MARKER_PLACEHOLDER
            )));
        }
        Ok(())
    }
}

/// Execution host settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Interpreter program kept alive for the whole document.
    pub program: String,
    /// Arguments passed to the interpreter.
    pub args: Vec<String>,
    /// Startup timeout in milliseconds.
    pub startup_timeout_ms: u64,
    /// Command the interpreter runs after each block to print the
    /// end-of-output marker on both stdout and stderr.
    pub marker_command: String,
    /// Options applied while the host starts.
    pub options: StartupOptions,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            program: "sh".to_string(),
            args: Vec::new(),
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
            marker_command: "printf '\\n%s\\n' '{marker}'; printf '\\n%s\\n' '{marker}' >&2"
                .to_string(),
            options: StartupOptions::default(),
        }
    }
}

impl HostConfig {
    /// Startup timeout as a `Duration`.
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

/// Options handed to the host when it starts (mirror, locale, code page and
/// similar environment-level settings).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StartupOptions {
    /// Environment variables for the host process.
    pub env: BTreeMap<String, String>,
    /// Commands evaluated once, right after the host starts.
    pub init: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LoomConfig::default();
        assert_eq!(config.block_prefix, "{r");
        assert_eq!(config.slot_prefix, "b");
        assert!(config.auto_evaluate);
        assert_eq!(config.host.program, "sh");
        assert_eq!(config.host.startup_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config = LoomConfig::from_toml_str("").unwrap();
        assert_eq!(config.block_prefix, "{r");
        assert!(config.prestart_session);
    }

    #[test]
    fn test_partial_toml() {
        let config = LoomConfig::from_toml_str(
            r#"
auto_evaluate = false
document_id = "report"

[host]
program = "bash"
startup_timeout_ms = 500

[host.options]
init = ["export LC_ALL=C"]
env = { LANG = "C.UTF-8" }
"#,
        )
        .unwrap();

        assert!(!config.auto_evaluate);
        assert_eq!(config.document_id.as_deref(), Some("report"));
        assert_eq!(config.host.program, "bash");
        assert_eq!(config.host.startup_timeout_ms, 500);
        assert_eq!(config.host.options.init, vec!["export LC_ALL=C"]);
        assert_eq!(config.host.options.env.get("LANG").map(String::as_str), Some("C.UTF-8"));
        assert!(config.host.marker_command.contains(MARKER_PLACEHOLDER));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            LoomConfig::from_toml_str("block_prefix = \"\""),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            LoomConfig::from_toml_str("[host]\nmarker_command = \"echo done\""),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            LoomConfig::from_toml_str("auto_evaluate = \"yes\""),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = LoomConfig::load_or_default(temp.path().join("loom.toml")).unwrap();
        assert_eq!(config.block_prefix, "{r");
    }

    #[test]
    fn test_load_from_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("loom.toml");
        std::fs::write(&path, "slot_prefix = \"out-\"").unwrap();
        let config = LoomConfig::load(&path).unwrap();
        assert_eq!(config.slot_prefix, "out-");
    }
}
