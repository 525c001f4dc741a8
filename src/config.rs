use crate::registry::normalize_hostname;
use crate::runtime::AppOptions;
use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_MEMORY_MB: usize = 128;
pub const DEFAULT_MAX_BUFFER_MB: usize = 10;

/// The multi-app configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub port: Option<u16>,
    pub defaults: Option<Defaults>,
    #[serde(default)]
    pub apps: Vec<AppConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Defaults {
    pub timeout_ms: Option<u64>,
    pub memory_mb: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub name: String,
    pub hostname: Option<String>,
    pub path: String,
    pub timeout_ms: Option<u64>,
    pub memory_mb: Option<usize>,
    pub max_buffer_size_mb: Option<usize>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl AppConfig {
    /// The routing key: the explicit hostname, or the app name.
    pub fn hostname(&self) -> String {
        normalize_hostname(self.hostname.as_ref().unwrap_or(&self.name))
    }
}

/// The add/remove/replace sets a reload applies, computed in full before
/// the registry mutates.
#[derive(Debug, Default)]
pub struct ConfigDiff<'a> {
    pub added: Vec<&'a AppConfig>,
    pub removed: Vec<String>,
    pub replaced: Vec<&'a AppConfig>,
}

impl Config {
    /// Reads and parses a config file. Parse errors surface here so a
    /// reload can bail before touching the registry.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashMap::new();
        for app in &self.apps {
            if app.name.is_empty() {
                anyhow::bail!("App entries require a non-empty name");
            }
            if app.path.is_empty() {
                anyhow::bail!("App \"{}\" has an empty path", app.name);
            }
            let hostname = app.hostname();
            if let Some(previous) = seen.insert(hostname.clone(), &app.name) {
                anyhow::bail!(
                    "Hostname \"{hostname}\" is claimed by both \"{previous}\" and \"{}\"",
                    app.name
                );
            }
        }
        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    /// Per-app options with the config-level defaults folded in.
    pub fn resolve_options(&self, app: &AppConfig) -> AppOptions {
        let defaults = self.defaults.clone().unwrap_or_default();

        AppOptions {
            name: app.name.clone(),
            hostname: app.hostname(),
            timeout_ms: app
                .timeout_ms
                .or(defaults.timeout_ms)
                .unwrap_or(DEFAULT_TIMEOUT_MS),
            memory_mb: app
                .memory_mb
                .or(defaults.memory_mb)
                .unwrap_or(DEFAULT_MEMORY_MB),
            max_buffer_size_mb: app.max_buffer_size_mb.unwrap_or(DEFAULT_MAX_BUFFER_MB),
            env: app.env.clone(),
        }
    }

    /// Diffs this config against the registry's hostname → path view:
    /// new hostnames are added, vanished ones removed, and same-hostname
    /// path changes become replacements. Unchanged entries are untouched.
    pub fn diff<'a>(&'a self, current: &HashMap<String, String>) -> ConfigDiff<'a> {
        let mut diff = ConfigDiff::default();

        let next: HashMap<String, &AppConfig> = self
            .apps
            .iter()
            .map(|app| (app.hostname(), app))
            .collect();

        for app in &self.apps {
            match current.get(&app.hostname()) {
                None => diff.added.push(app),
                Some(path) if *path != app.path => diff.replaced.push(app),
                Some(_) => {}
            }
        }

        for hostname in current.keys() {
            if !next.contains_key(hostname) {
                diff.removed.push(hostname.clone());
            }
        }

        diff.removed.sort();
        diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        serde_json::from_str(
            r#"{
                "port": 8080,
                "defaults": { "timeout_ms": 2000, "memory_mb": 64 },
                "apps": [
                    { "name": "a", "hostname": "a.local", "path": "apps/a" },
                    { "name": "b", "path": "apps/b", "timeout_ms": 9000,
                      "env": { "MODE": "prod" } }
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn parses_and_applies_defaults() {
        let config = sample();
        assert_eq!(config.port(), 8080);

        let a = config.resolve_options(&config.apps[0]);
        assert_eq!(a.timeout_ms, 2000);
        assert_eq!(a.memory_mb, 64);
        assert_eq!(a.hostname, "a.local");

        let b = config.resolve_options(&config.apps[1]);
        assert_eq!(b.timeout_ms, 9000);
        assert_eq!(b.hostname, "b");
        assert_eq!(b.env.get("MODE").map(String::as_str), Some("prod"));
    }

    #[test]
    fn hostname_defaults_to_name() {
        let config = sample();
        assert_eq!(config.apps[1].hostname(), "b");
    }

    #[test]
    fn rejects_duplicate_hostnames() {
        let config: Config = serde_json::from_str(
            r#"{ "apps": [
                { "name": "x", "hostname": "same.local", "path": "a" },
                { "name": "y", "hostname": "SAME.local", "path": "b" }
            ] }"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unchanged_config_diffs_to_noop() {
        let config = sample();
        let current = HashMap::from([
            ("a.local".to_string(), "apps/a".to_string()),
            ("b".to_string(), "apps/b".to_string()),
        ]);

        let diff = config.diff(&current);
        assert!(diff.added.is_empty());
        assert!(diff.removed.is_empty());
        assert!(diff.replaced.is_empty());
    }

    #[test]
    fn diff_classifies_add_remove_replace() {
        let config = sample();
        let current = HashMap::from([
            ("a.local".to_string(), "apps/a-old".to_string()),
            ("gone.local".to_string(), "apps/gone".to_string()),
        ]);

        let diff = config.diff(&current);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].name, "b");
        assert_eq!(diff.removed, vec!["gone.local".to_string()]);
        assert_eq!(diff.replaced.len(), 1);
        assert_eq!(diff.replaced[0].name, "a");
    }

    #[test]
    fn parse_failure_is_an_error() {
        let result: Result<Config, _> = serde_json::from_str("{ not json");
        assert!(result.is_err());
    }
}
