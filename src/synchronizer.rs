// Active-server selection and generation tagging for asynchronous results.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::config::ServerConfig;
use crate::metrics;

#[derive(Debug, Error, PartialEq)]
pub enum SyncError {
    #[error("unknown server `{0}`")]
    UnknownServer(String),
}

/// A user-facing notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
}

/// Delivers notifications to whoever is watching the overlay.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Notifier that only writes to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        tracing::warn!(title = %notification.title, "{}", notification.message);
    }
}

/// Monotonic counter bumped on every accepted server switch. Snapshot results and feed
/// frames carry the generation they were requested under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Generation(u64);

impl Generation {
    pub fn get(self) -> u64 {
        self.0
    }

    fn next(self) -> Self {
        Generation(self.0 + 1)
    }
}

/// The server currently synchronized against.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveServer {
    pub name: String,
    pub blips_url: String,
    pub feed_url: String,
}

/// Work to perform after an accepted switch.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchPlan {
    pub generation: Generation,
    pub server: ActiveServer,
}

pub struct Synchronizer {
    servers: BTreeMap<String, ServerConfig>,
    active: Option<ActiveServer>,
    generation: Generation,
    notifier: Arc<dyn Notifier>,
}

impl Synchronizer {
    pub fn new(servers: BTreeMap<String, ServerConfig>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            servers,
            active: None,
            generation: Generation::default(),
            notifier,
        }
    }

    /// Select `name` as the active server and bump the generation. An unknown name
    /// notifies the user and leaves everything untouched.
    pub fn switch_server(&mut self, name: &str) -> Result<SwitchPlan, SyncError> {
        let Some(config) = self.servers.get(name) else {
            metrics::SERVER_SWITCHES_TOTAL
                .with_label_values(&["rejected"])
                .inc();
            self.notifier.notify(Notification {
                title: "Error".into(),
                message: format!("Server \"{name}\" doesn't exist"),
            });
            return Err(SyncError::UnknownServer(name.to_string()));
        };

        let server = ActiveServer {
            name: name.to_string(),
            blips_url: config.blips_url(),
            feed_url: config.socket_url(),
        };
        self.generation = self.generation.next();
        self.active = Some(server.clone());

        metrics::SERVER_SWITCHES_TOTAL
            .with_label_values(&["accepted"])
            .inc();
        metrics::SERVER_GENERATION.set(self.generation.get() as i64);
        tracing::info!(server = %name, generation = self.generation.get(), "switching server");

        Ok(SwitchPlan {
            generation: self.generation,
            server,
        })
    }

    /// Whether a result tagged with `generation` still belongs to the active server.
    pub fn is_current(&self, generation: Generation) -> bool {
        self.active.is_some() && generation == self.generation
    }

    pub fn current(&self) -> Option<&ActiveServer> {
        self.active.as_ref()
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn servers(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }
}
