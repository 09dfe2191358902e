// Scripted transports and a collecting notifier shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};

use blipmap::overlay::catalog::MarkerCatalog;
use blipmap::overlay::surface::RecordingSurface;
use blipmap::overlay::{Overlay, OverlaySettings};
use blipmap::session::{Session, SessionHandle, SessionOptions};
use blipmap::synchronizer::{Notification, Notifier, Synchronizer};
use blipmap::transport::{FeedConnector, FeedStream, SnapshotSource, TransportError};

pub const SERVERS: &str = r#"{
    "alpha": {"ip": "10.0.0.1", "socketPort": 30120},
    "bravo": {"ip": "10.0.0.2", "socketPort": 30120}
}"#;

pub const ALPHA_BLIPS: &str = "http://10.0.0.1:30120/blips.json";
pub const BRAVO_BLIPS: &str = "http://10.0.0.2:30120/blips.json";
pub const ALPHA_FEED: &str = "ws://10.0.0.1:30120";
pub const BRAVO_FEED: &str = "ws://10.0.0.2:30120";

/// Snapshot bodies keyed by URL, each returned after its own delay. Queued responses
/// are used once each, in order, before falling back to the fixed one.
#[derive(Default)]
pub struct ScriptedSnapshots {
    responses: HashMap<String, (Duration, String)>,
    queued: Mutex<HashMap<String, VecDeque<(Duration, String)>>>,
    pub fetched: Mutex<Vec<String>>,
}

impl ScriptedSnapshots {
    pub fn respond(mut self, url: &str, delay: Duration, body: &str) -> Self {
        self.responses
            .insert(url.to_string(), (delay, body.to_string()));
        self
    }

    pub fn queue(self, url: &str, delay: Duration, body: &str) -> Self {
        self.queued
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back((delay, body.to_string()));
        self
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

impl SnapshotSource for ScriptedSnapshots {
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<String, TransportError>> {
        self.fetched.lock().unwrap().push(url.to_string());
        let queued = self
            .queued
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(VecDeque::pop_front);
        let response = queued.or_else(|| self.responses.get(url).cloned());
        let url = url.to_string();
        async move {
            match response {
                Some((delay, body)) => {
                    tokio::time::sleep(delay).await;
                    Ok(body)
                }
                None => Err(TransportError::Other(format!("no snapshot for {url}"))),
            }
        }
        .boxed()
    }
}

/// Feed connector whose connections are driven by the test through channels.
#[derive(Default)]
pub struct ChannelFeeds {
    connections: Mutex<Vec<(String, mpsc::UnboundedSender<String>)>>,
}

impl ChannelFeeds {
    pub fn urls(&self) -> Vec<String> {
        let connections = self.connections.lock().unwrap();
        connections.iter().map(|(url, _)| url.clone()).collect()
    }

    /// Push a frame on the most recent connection to `url`.
    pub fn push(&self, url: &str, frame: &str) -> bool {
        let connections = self.connections.lock().unwrap();
        connections
            .iter()
            .rev()
            .find(|(u, _)| u == url)
            .is_some_and(|(_, tx)| tx.unbounded_send(frame.to_string()).is_ok())
    }

    /// Whether the most recent connection to `url` has been dropped by the session.
    pub fn is_closed(&self, url: &str) -> bool {
        let connections = self.connections.lock().unwrap();
        connections
            .iter()
            .rev()
            .find(|(u, _)| u == url)
            .is_some_and(|(_, tx)| tx.is_closed())
    }
}

impl FeedConnector for ChannelFeeds {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<FeedStream, TransportError>> {
        let (tx, rx) = mpsc::unbounded();
        self.connections
            .lock()
            .unwrap()
            .push((url.to_string(), tx));
        async move { Ok(rx.map(Ok).boxed()) }.boxed()
    }
}

#[derive(Default)]
pub struct CollectingNotifier(pub Mutex<Vec<Notification>>);

impl Notifier for CollectingNotifier {
    fn notify(&self, notification: Notification) {
        self.0.lock().unwrap().push(notification);
    }
}

pub struct Harness {
    pub session: Session<RecordingSurface>,
    pub handle: SessionHandle,
    pub snapshots: Arc<ScriptedSnapshots>,
    pub feeds: Arc<ChannelFeeds>,
    pub notes: Arc<CollectingNotifier>,
}

pub fn harness(snapshots: ScriptedSnapshots) -> Harness {
    let snapshots = Arc::new(snapshots);
    let feeds = Arc::new(ChannelFeeds::default());
    let notes = Arc::new(CollectingNotifier::default());

    let overlay = Overlay::new(
        RecordingSurface::new(),
        Arc::new(MarkerCatalog::default()),
        OverlaySettings::default(),
    );
    let servers = serde_json::from_str(SERVERS).unwrap();
    let sync = Synchronizer::new(servers, notes.clone());
    let (session, handle) = Session::new(
        overlay,
        sync,
        snapshots.clone(),
        feeds.clone(),
        SessionOptions::default(),
    );

    Harness {
        session,
        handle,
        snapshots,
        feeds,
        notes,
    }
}
