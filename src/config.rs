//! Configuration types.
//!
//! Secrets and deployment knobs come from the environment (`BotConfig`);
//! rules, timing, sheets and routing come from a JSON settings file
//! (`Settings`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::http::LinksSheet;
use crate::notifier::SheetJob;
use crate::roles::{MigrationConfig, RoleRule};

const DEFAULT_SETTINGS_PATH: &str = "rolekeeper.json";
const DEFAULT_HTTP_PORT: u16 = 8080;

/// Environment-level configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub token: SecretString,
    pub guild_id: u64,
    pub settings_path: PathBuf,
    pub http_port: u16,
    /// Service-account key JSON, or a path to it.
    pub google_credentials: Option<SecretString>,
    /// Read-only fallback for publicly shared sheets.
    pub google_api_key: Option<SecretString>,
}

impl BotConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let token = get("DISCORD_BOT_TOKEN")
            .or_else(|| get("BOT_TOKEN"))
            .ok_or_else(|| ConfigError::MissingEnvVar("DISCORD_BOT_TOKEN".into()))?;

        let guild_id = get("DISCORD_GUILD_ID")
            .ok_or_else(|| ConfigError::MissingEnvVar("DISCORD_GUILD_ID".into()))?
            .parse()
            .map_err(|_| ConfigError::invalid("DISCORD_GUILD_ID", "must be a numeric guild ID"))?;

        let http_port = match get("ROLEKEEPER_HTTP_PORT") {
            Some(port) => port
                .parse()
                .map_err(|_| ConfigError::invalid("ROLEKEEPER_HTTP_PORT", "must be a port number"))?,
            None => DEFAULT_HTTP_PORT,
        };

        Ok(Self {
            token: SecretString::from(token),
            guild_id,
            settings_path: get("ROLEKEEPER_CONFIG")
                .unwrap_or_else(|| DEFAULT_SETTINGS_PATH.to_string())
                .into(),
            http_port,
            google_credentials: get("GOOGLE_CREDENTIALS_JSON").map(SecretString::from),
            google_api_key: get("GOOGLE_API_KEY").map(SecretString::from),
        })
    }
}

/// Resolve a credentials value: inline JSON is returned as-is, anything else
/// is read as a file path.
pub fn read_credentials(value: &str) -> Result<String, ConfigError> {
    let trimmed = value.trim();
    if trimmed.starts_with('{') {
        return Ok(trimmed.to_string());
    }
    Ok(std::fs::read_to_string(trimmed)?)
}

fn default_cooldown_secs() -> u64 {
    5
}

fn default_settle_delay_ms() -> u64 {
    1500
}

fn default_sweep_delay_ms() -> u64 {
    500
}

/// Debounce and pacing knobs for role evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Timing {
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Wait before re-reading a member after a change notification.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Pause between members during sweeps and migrations.
    #[serde(default = "default_sweep_delay_ms")]
    pub sweep_delay_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            settle_delay_ms: default_settle_delay_ms(),
            sweep_delay_ms: default_sweep_delay_ms(),
        }
    }
}

impl Timing {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn sweep_delay(&self) -> Duration {
        Duration::from_millis(self.sweep_delay_ms)
    }
}

fn default_command_prefix() -> String {
    "!".to_string()
}

fn default_timezone() -> String {
    "America/Los_Angeles".to_string()
}

/// File-level settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub rules: Vec<RoleRule>,
    #[serde(default)]
    pub timing: Timing,
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    #[serde(default)]
    pub migration: Option<MigrationConfig>,
    /// IANA name used for sheet dates and the links window.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub sheets: Vec<SheetJob>,
    #[serde(default)]
    pub links: Option<LinksSheet>,
}

impl Settings {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let settings: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse()
            .map_err(|_| ConfigError::invalid("timezone", format!("unknown timezone {:?}", self.timezone)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for rule in &self.rules {
            rule.validate()?;
        }
        if self.command_prefix.trim().is_empty() {
            return Err(ConfigError::invalid("command_prefix", "must not be empty"));
        }
        self.tz()?;

        if let Some(migration) = &self.migration {
            if migration.target.trim().is_empty() || migration.sources.is_empty() {
                return Err(ConfigError::invalid(
                    "migration",
                    "needs a target and at least one source role",
                ));
            }
        }

        let mut names = std::collections::HashSet::new();
        for job in &self.sheets {
            job.validate()?;
            if !names.insert(job.name.as_str()) {
                return Err(ConfigError::invalid(
                    format!("sheets[{}]", job.name),
                    "job names must be unique",
                ));
            }
        }

        if let Some(links) = &self.links {
            links.validate()?;
        }
        Ok(())
    }

    /// Names of jobs that write status cells or mirror to a calendar.
    pub fn writing_jobs(&self) -> Vec<&str> {
        self.sheets
            .iter()
            .filter(|job| job.submitted.is_some() || job.approved.is_some() || job.calendar.is_some())
            .map(|job| job.name.as_str())
            .collect()
    }

    /// Reject read-only sheet access when a job must write back. Without a
    /// status write every notice would be re-posted on each poll.
    pub fn check_sheet_access(&self, writable: bool) -> Result<(), ConfigError> {
        let writing = self.writing_jobs();
        if writable || writing.is_empty() {
            return Ok(());
        }
        Err(ConfigError::invalid(
            "GOOGLE_CREDENTIALS_JSON",
            format!(
                "sheet jobs [{}] write status cells and need a service account; GOOGLE_API_KEY is read-only",
                writing.join(", ")
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_requires_token_and_guild() {
        let err = BotConfig::from_lookup(env(&[("DISCORD_GUILD_ID", "1")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "DISCORD_BOT_TOKEN"));

        let err = BotConfig::from_lookup(env(&[("DISCORD_BOT_TOKEN", "t")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "DISCORD_GUILD_ID"));
    }

    #[test]
    fn env_defaults() {
        let config =
            BotConfig::from_lookup(env(&[("BOT_TOKEN", "t"), ("DISCORD_GUILD_ID", " 123 ")])).unwrap();
        assert_eq!(config.guild_id, 123);
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.settings_path, PathBuf::from("rolekeeper.json"));
        assert!(config.google_credentials.is_none());
        assert!(config.google_api_key.is_none());
    }

    #[test]
    fn env_rejects_bad_numbers() {
        let err = BotConfig::from_lookup(env(&[
            ("DISCORD_BOT_TOKEN", "t"),
            ("DISCORD_GUILD_ID", "guild"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = BotConfig::from_lookup(env(&[
            ("DISCORD_BOT_TOKEN", "t"),
            ("DISCORD_GUILD_ID", "1"),
            ("ROLEKEEPER_HTTP_PORT", "http"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn minimal_settings_use_defaults() {
        let settings = Settings::from_json(
            r#"{"rules": [{"grants": "Role C", "any_requires": [["Role A", "Role B"]]}]}"#,
        )
        .unwrap();
        assert_eq!(settings.timing, Timing::default());
        assert_eq!(settings.timing.settle_delay(), Duration::from_millis(1500));
        assert_eq!(settings.command_prefix, "!");
        assert_eq!(settings.tz().unwrap(), chrono_tz::America::Los_Angeles);
        assert!(settings.sheets.is_empty());
        assert!(settings.writing_jobs().is_empty());
        assert!(settings.check_sheet_access(false).is_ok());
    }

    #[test]
    fn partial_timing_keeps_other_defaults() {
        let settings =
            Settings::from_json(r#"{"rules": [], "timing": {"cooldown_secs": 10}}"#).unwrap();
        assert_eq!(settings.timing.cooldown(), Duration::from_secs(10));
        assert_eq!(settings.timing.sweep_delay_ms, 500);
    }

    #[test]
    fn invalid_settings_rejected() {
        assert!(matches!(
            Settings::from_json("{"),
            Err(ConfigError::ParseError(_))
        ));
        assert!(Settings::from_json(r#"{"rules": [{"grants": "X", "any_requires": []}]}"#).is_err());
        assert!(Settings::from_json(r#"{"rules": [], "timezone": "Mars/Olympus"}"#).is_err());
        assert!(Settings::from_json(r#"{"rules": [], "command_prefix": ""}"#).is_err());
        assert!(
            Settings::from_json(r#"{"rules": [], "migration": {"sources": [], "target": "New"}}"#)
                .is_err()
        );
    }

    #[test]
    fn sample_settings_file_parses() {
        let settings = Settings::from_json(include_str!("../rolekeeper.example.json")).unwrap();
        assert_eq!(settings.rules.len(), 5);
        assert_eq!(settings.sheets.len(), 2);
        assert_eq!(settings.writing_jobs(), vec!["media", "events"]);
        assert!(settings.links.is_some());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rolekeeper.json");
        std::fs::write(&path, r#"{"rules": [], "command_prefix": "?"}"#).unwrap();
        assert_eq!(Settings::load(&path).unwrap().command_prefix, "?");
        assert!(matches!(
            Settings::load(&dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn credentials_inline_or_path() {
        assert_eq!(read_credentials(" {\"a\":1} ").unwrap(), "{\"a\":1}");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.json");
        std::fs::write(&path, "{\"type\":\"service_account\"}").unwrap();
        assert_eq!(
            read_credentials(path.to_str().unwrap()).unwrap(),
            "{\"type\":\"service_account\"}"
        );
    }

    #[test]
    fn read_only_access_rejected_for_writing_jobs() {
        let settings = Settings::from_json(include_str!("../rolekeeper.example.json")).unwrap();
        assert!(settings.check_sheet_access(true).is_ok());

        let err = settings.check_sheet_access(false).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        let message = err.to_string();
        assert!(message.contains("media, events"));
        assert!(message.contains("GOOGLE_API_KEY is read-only"));
    }
}
