use crate::config::Config;
use crate::errors::LoadError;
use crate::runtime::App;
use crate::runtime::AppOptions;
use crate::runtime::Host;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

/// How long a drain may wait for in-flight requests before teardown
/// proceeds anyway.
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

/// Poll interval while waiting for connections to drain.
const DRAIN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("An app is already registered for hostname \"{0}\"")]
    HostnameTaken(String),
    #[error("No app registered for hostname \"{0}\"")]
    UnknownHostname(String),
    #[error("Removing the last app would leave the host empty")]
    LastApp,
    #[error(transparent)]
    Load(#[from] LoadError),
}

/// Connection accounting for one App. The dispatcher bumps the counter on
/// entry and exit of every request; the registry flips `draining` when a
/// removal begins. Counters are atomics so a threaded accept loop could
/// share them unchanged.
#[derive(Debug, Default)]
pub struct DrainState {
    pub active_connections: Arc<AtomicU32>,
    pub draining: Arc<AtomicBool>,
}

impl DrainState {
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}

/// Summary of a hot reload, mostly for the logs.
#[derive(Debug, Default, PartialEq)]
pub struct ReloadSummary {
    pub added: usize,
    pub removed: usize,
    pub replaced: usize,
    pub failed: usize,
}

/// Hostname → App routing over stable storage.
///
/// Apps live in boxed slots so their addresses survive insertions
/// elsewhere; the routing map stores slot indices. The first loaded App
/// becomes the default route for unmatched hostnames.
pub struct AppRegistry {
    host: Host,
    slots: Vec<Option<Box<App>>>,
    routes: HashMap<String, usize>,
    drains: HashMap<String, DrainState>,
    default_slot: Option<usize>,
}

/// Lower-cases, trims, and strips any `:port` suffix so routing is
/// insensitive to how the client spelled the Host header.
pub fn normalize_hostname(host: &str) -> String {
    let host = host.trim();
    let host = match host.split_once(':') {
        Some((name, _port)) => name,
        None => host,
    };
    host.to_lowercase()
}

impl AppRegistry {
    pub fn new(host: Host) -> Self {
        AppRegistry {
            host,
            slots: Vec::new(),
            routes: HashMap::new(),
            drains: HashMap::new(),
            default_slot: None,
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn hostnames(&self) -> Vec<String> {
        let mut hostnames: Vec<String> = self.routes.keys().cloned().collect();
        hostnames.sort();
        hostnames
    }

    /// hostname → source path view, used to diff configs on reload.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.routes
            .iter()
            .filter_map(|(hostname, slot)| {
                self.slots[*slot]
                    .as_ref()
                    .map(|app| (hostname.clone(), app.path.clone()))
            })
            .collect()
    }

    /// Routes a raw Host header to a slot: exact match first, then the
    /// default App, then nothing when the registry is empty.
    pub fn resolve(&self, host: &str) -> Option<usize> {
        let hostname = normalize_hostname(host);
        self.routes.get(&hostname).copied().or(self.default_slot)
    }

    /// Exact-match routing with no default fallback. Multi-app serving
    /// uses this so an unmatched hostname is a 404, not a guess.
    pub fn resolve_exact(&self, host: &str) -> Option<usize> {
        self.routes.get(&normalize_hostname(host)).copied()
    }

    pub fn default_slot(&self) -> Option<usize> {
        self.default_slot
    }

    pub fn app(&self, slot: usize) -> Option<&App> {
        self.slots.get(slot).and_then(|slot| slot.as_deref())
    }

    pub fn app_mut(&mut self, slot: usize) -> Option<&mut App> {
        self.slots.get_mut(slot).and_then(|slot| slot.as_deref_mut())
    }

    pub fn drain_state(&self, hostname: &str) -> Option<&DrainState> {
        self.drains.get(&normalize_hostname(hostname))
    }

    /// Loads an App and inserts its routing and drain entries. The first
    /// successful add becomes the default.
    pub fn add_app(&mut self, path: &str, options: AppOptions) -> Result<(), RegistryError> {
        let hostname = normalize_hostname(&options.hostname);

        if self.routes.contains_key(&hostname) {
            return Err(RegistryError::HostnameTaken(hostname));
        }

        let options = AppOptions {
            hostname: hostname.clone(),
            ..options
        };

        let app = self.host.load_app(path, options)?;

        let slot = self.free_slot();
        self.slots[slot] = Some(Box::new(app));
        self.routes.insert(hostname.clone(), slot);
        self.drains.insert(hostname, DrainState::default());

        if self.default_slot.is_none() {
            self.default_slot = Some(slot);
        }

        tracing::info!(slot, "app registered");
        Ok(())
    }

    /// Marks an App as draining, waits for its in-flight requests (10 ms
    /// polls, 30 s deadline), then tears it down and drops its routes.
    pub fn remove_app(&mut self, hostname: &str) -> Result<(), RegistryError> {
        let hostname = normalize_hostname(hostname);

        let slot = match self.routes.get(&hostname) {
            Some(slot) => *slot,
            None => return Err(RegistryError::UnknownHostname(hostname)),
        };

        if let Some(drain) = self.drains.get(&hostname) {
            drain.draining.store(true, Ordering::SeqCst);
            let deadline = Instant::now() + DRAIN_DEADLINE;

            while drain.active_connections.load(Ordering::SeqCst) > 0 {
                if Instant::now() >= deadline {
                    tracing::warn!(%hostname, "drain deadline elapsed with connections active");
                    break;
                }
                thread::sleep(DRAIN_POLL);
            }
        }

        self.routes.remove(&hostname);
        self.drains.remove(&hostname);

        // The App's drop releases its loop resources, then disposes the
        // engine in the fixed teardown order.
        self.slots[slot] = None;

        // Promote a new default if the removed App held the role.
        if self.default_slot == Some(slot) {
            self.default_slot = self.routes.values().next().copied();
        }

        tracing::info!(%hostname, "app removed");
        Ok(())
    }

    /// Remove followed by Add for a hostname whose source path changed.
    pub fn replace_app(&mut self, path: &str, options: AppOptions) -> Result<(), RegistryError> {
        self.remove_app(&options.hostname)?;
        self.add_app(path, options)
    }

    /// Applies a config diff: removed hostnames drain away, changed paths
    /// are replaced, new hostnames load. The diff is computed against the
    /// registry before anything mutates, and a failed load only skips
    /// that one App.
    pub fn reload(&mut self, config: &Config) -> ReloadSummary {
        let current = self.snapshot();
        let diff = config.diff(&current);
        let mut summary = ReloadSummary::default();

        for hostname in &diff.removed {
            match self.remove_app(hostname) {
                Ok(()) => summary.removed += 1,
                Err(e) => {
                    tracing::error!(%hostname, "reload remove failed: {e}");
                    summary.failed += 1;
                }
            }
        }

        for app in &diff.replaced {
            let options = config.resolve_options(app);
            match self.replace_app(&app.path, options) {
                Ok(()) => summary.replaced += 1,
                Err(e) => {
                    tracing::error!(app = %app.name, "reload replace failed: {e}");
                    summary.failed += 1;
                }
            }
        }

        for app in &diff.added {
            let options = config.resolve_options(app);
            match self.add_app(&app.path, options) {
                Ok(()) => summary.added += 1,
                Err(e) => {
                    tracing::error!(app = %app.name, "reload add failed: {e}");
                    summary.failed += 1;
                }
            }
        }

        summary
    }

    /// Flags every App as draining; used on shutdown.
    pub fn drain_all(&mut self) {
        for drain in self.drains.values() {
            drain.draining.store(true, Ordering::SeqCst);
        }
    }

    /// Waits until no App has in-flight requests or the deadline passes.
    pub fn wait_for_idle(&self, deadline: Duration) {
        let until = Instant::now() + deadline;
        loop {
            let active: u32 = self
                .drains
                .values()
                .map(|drain| drain.active_connections.load(Ordering::SeqCst))
                .sum();
            if active == 0 || Instant::now() >= until {
                return;
            }
            thread::sleep(DRAIN_POLL);
        }
    }

    fn free_slot(&mut self) -> usize {
        match self.slots.iter().position(|slot| slot.is_none()) {
            Some(slot) => slot,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    fn fixture(body: &str) -> assert_fs::TempDir {
        let dir = assert_fs::TempDir::new().unwrap();
        dir.child("index.js")
            .write_str(&format!(
                "export default {{ fetch() {{ return new Response(\"{body}\"); }} }}"
            ))
            .unwrap();
        dir
    }

    fn options(hostname: &str) -> AppOptions {
        AppOptions {
            name: hostname.into(),
            hostname: hostname.into(),
            ..AppOptions::default()
        }
    }

    #[test]
    fn normalizes_hostnames() {
        assert_eq!(normalize_hostname("Example.COM"), "example.com");
        assert_eq!(normalize_hostname("a.local:8080"), "a.local");
        assert_eq!(normalize_hostname("  b.local \t"), "b.local");
        assert_eq!(normalize_hostname("A.Local:3000 "), "a.local");
    }

    #[test]
    fn add_remove_add_is_idempotent() {
        let dir = fixture("ok");
        let mut registry = AppRegistry::new(Host::new());

        registry
            .add_app(dir.path().to_str().unwrap(), options("a.local"))
            .unwrap();
        let first = registry.hostnames();

        registry.remove_app("a.local").unwrap();
        assert!(registry.is_empty());
        assert!(registry.resolve("a.local").is_none());

        registry
            .add_app(dir.path().to_str().unwrap(), options("a.local"))
            .unwrap();
        assert_eq!(registry.hostnames(), first);
        assert!(registry.resolve("a.local").is_some());
    }

    #[test]
    fn duplicate_hostname_is_a_conflict() {
        let dir = fixture("ok");
        let mut registry = AppRegistry::new(Host::new());

        registry
            .add_app(dir.path().to_str().unwrap(), options("a.local"))
            .unwrap();
        let err = registry
            .add_app(dir.path().to_str().unwrap(), options("A.LOCAL"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::HostnameTaken(_)));
    }

    #[test]
    fn unmatched_host_falls_back_to_default() {
        let a = fixture("a");
        let b = fixture("b");
        let mut registry = AppRegistry::new(Host::new());

        registry
            .add_app(a.path().to_str().unwrap(), options("a.local"))
            .unwrap();
        registry
            .add_app(b.path().to_str().unwrap(), options("b.local"))
            .unwrap();

        let default = registry.resolve("a.local").unwrap();
        assert_eq!(registry.resolve("unknown.host").unwrap(), default);
        assert_eq!(registry.resolve("A.LOCAL:9000"), Some(default));
    }

    #[test]
    fn removing_default_promotes_survivor() {
        let a = fixture("a");
        let b = fixture("b");
        let mut registry = AppRegistry::new(Host::new());

        registry
            .add_app(a.path().to_str().unwrap(), options("a.local"))
            .unwrap();
        registry
            .add_app(b.path().to_str().unwrap(), options("b.local"))
            .unwrap();

        registry.remove_app("a.local").unwrap();
        let survivor = registry.resolve("b.local").unwrap();
        assert_eq!(registry.resolve("whatever.host"), Some(survivor));
    }

    #[test]
    fn reload_applies_the_config_diff() {
        use crate::config::Config;

        let a = fixture("a");
        let old = fixture("old");
        let c = fixture("c");

        let mut registry = AppRegistry::new(Host::new());
        registry
            .add_app(a.path().to_str().unwrap(), options("a.local"))
            .unwrap();
        registry
            .add_app(old.path().to_str().unwrap(), options("old.local"))
            .unwrap();

        // a.local keeps its path, old.local disappears, c.local is new.
        let config: Config = serde_json::from_str(&format!(
            r#"{{ "apps": [
                {{ "name": "a", "hostname": "a.local", "path": "{}" }},
                {{ "name": "c", "hostname": "c.local", "path": "{}" }}
            ] }}"#,
            a.path().display(),
            c.path().display()
        ))
        .unwrap();

        let summary = registry.reload(&config);
        assert_eq!(summary.added, 1);
        assert_eq!(summary.removed, 1);
        assert_eq!(summary.replaced, 0);
        assert_eq!(summary.failed, 0);

        assert!(registry.resolve_exact("a.local").is_some());
        assert!(registry.resolve_exact("c.local").is_some());
        assert!(registry.resolve_exact("old.local").is_none());

        // Reloading the same config again is a no-op.
        let summary = registry.reload(&config);
        assert_eq!(summary, ReloadSummary::default());
    }

    #[test]
    fn reload_replaces_apps_whose_path_changed() {
        use crate::config::Config;

        let before = fixture("before");
        let after = fixture("after");

        let mut registry = AppRegistry::new(Host::new());
        registry
            .add_app(before.path().to_str().unwrap(), options("app.local"))
            .unwrap();

        let config: Config = serde_json::from_str(&format!(
            r#"{{ "apps": [
                {{ "name": "app", "hostname": "app.local", "path": "{}" }}
            ] }}"#,
            after.path().display()
        ))
        .unwrap();

        let summary = registry.reload(&config);
        assert_eq!(summary.replaced, 1);
        assert_eq!(summary.added, 0);
        assert_eq!(summary.removed, 0);
        assert!(registry.resolve_exact("app.local").is_some());
    }

    #[test]
    fn slots_are_reused_after_removal() {
        let a = fixture("a");
        let b = fixture("b");
        let mut registry = AppRegistry::new(Host::new());

        registry
            .add_app(a.path().to_str().unwrap(), options("a.local"))
            .unwrap();
        registry.remove_app("a.local").unwrap();
        registry
            .add_app(b.path().to_str().unwrap(), options("b.local"))
            .unwrap();

        assert_eq!(registry.slots.len(), 1);
    }
}
