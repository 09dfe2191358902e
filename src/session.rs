// The session loop: the single task that owns and mutates overlay state.
//
// Commands, snapshot results, feed frames and timer continuations all arrive on channels
// and are handled one at a time. Asynchronous results carry the generation they were
// requested under and are dropped once a server switch has superseded it. Snapshot
// results also carry a request sequence so an older fetch never overwrites a newer one.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::metrics;
use crate::overlay::blip::CategoryKey;
use crate::overlay::cluster::RecreateTicket;
use crate::overlay::players::PlayerFilter;
use crate::overlay::surface::RenderSurface;
use crate::overlay::Overlay;
use crate::protocol::{decode_feed_message, decode_snapshot};
use crate::synchronizer::{Generation, SyncError, Synchronizer};
use crate::transport::{FeedConnector, SnapshotSource, TransportError};

/// Delay between a server switch and the snapshot fetch plus feed connect.
pub const SWITCH_DEBOUNCE: Duration = Duration::from_millis(50);
/// Delay between a cluster teardown and its recreation.
pub const CLUSTER_RECREATE_DELAY: Duration = Duration::from_millis(10);

const COMMAND_BUFFER: usize = 64;

#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("session has shut down")]
    Closed,
}

/// Control requests accepted by a running session.
#[derive(Debug)]
pub enum Command {
    SwitchServer {
        name: String,
        reply: oneshot::Sender<Result<Generation, SyncError>>,
    },
    Refresh,
    SetDisabledCategories(BTreeSet<CategoryKey>),
    SetShowBlips(bool),
    SetPlayerFilter(Option<PlayerFilter>),
    Shutdown,
}

enum SessionEvent {
    BeginSync(Generation),
    SnapshotLoaded {
        generation: Generation,
        seq: u64,
        result: Result<String, TransportError>,
    },
    Feed {
        generation: Generation,
        frame: String,
    },
    FeedConnected(Generation),
    FeedClosed {
        generation: Generation,
        error: Option<TransportError>,
    },
    RecreateClusters(RecreateTicket),
}

/// Summary published after every loop turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OverlayStatus {
    pub server: Option<String>,
    pub generation: u64,
    pub blips: usize,
    pub categories: usize,
    pub marker_slots: usize,
    pub live_slots: usize,
    pub marker_epoch: u64,
    pub players: usize,
    pub cluster_present: bool,
    pub feed_connected: bool,
    pub show_blips: bool,
    pub disabled_categories: Vec<String>,
    pub player_filter: Option<PlayerFilter>,
    /// Attribute names cached players can be filtered on.
    pub filter_attributes: Vec<String>,
    pub last_snapshot_at: Option<DateTime<Utc>>,
    pub stale_discarded: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Re-fetch the snapshot of the active server on this interval.
    pub refresh_interval: Option<Duration>,
}

/// Cloneable handle for driving a running [`Session`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<OverlayStatus>,
}

impl SessionHandle {
    async fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Switch to `name` and return the new generation. Fails without touching state
    /// when the server is unknown.
    pub async fn switch_server(&self, name: &str) -> Result<Generation, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SwitchServer {
            name: name.to_string(),
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| SessionError::Closed)??)
    }

    pub async fn refresh(&self) -> Result<(), SessionError> {
        self.send(Command::Refresh).await
    }

    pub async fn set_disabled_categories(
        &self,
        disabled: BTreeSet<CategoryKey>,
    ) -> Result<(), SessionError> {
        self.send(Command::SetDisabledCategories(disabled)).await
    }

    pub async fn set_show_blips(&self, show: bool) -> Result<(), SessionError> {
        self.send(Command::SetShowBlips(show)).await
    }

    pub async fn set_player_filter(&self, filter: Option<PlayerFilter>) -> Result<(), SessionError> {
        self.send(Command::SetPlayerFilter(filter)).await
    }

    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.send(Command::Shutdown).await
    }

    /// Latest published status.
    pub fn status(&self) -> OverlayStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every published status.
    pub fn watch(&self) -> watch::Receiver<OverlayStatus> {
        self.status.clone()
    }
}

pub struct Session<S> {
    overlay: Overlay<S>,
    sync: Synchronizer,
    snapshots: Arc<dyn SnapshotSource>,
    feeds: Arc<dyn FeedConnector>,
    options: SessionOptions,
    commands: mpsc::Receiver<Command>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    status: watch::Sender<OverlayStatus>,
    feed: Option<JoinHandle<()>>,
    feed_connected: bool,
    snapshot_seq: u64,
    applied_snapshot_seq: u64,
    last_snapshot_at: Option<DateTime<Utc>>,
    stale_discarded: u64,
}

impl<S: RenderSurface + Send + 'static> Session<S> {
    pub fn new(
        overlay: Overlay<S>,
        sync: Synchronizer,
        snapshots: Arc<dyn SnapshotSource>,
        feeds: Arc<dyn FeedConnector>,
        options: SessionOptions,
    ) -> (Self, SessionHandle) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(OverlayStatus::default());

        let session = Self {
            overlay,
            sync,
            snapshots,
            feeds,
            options,
            commands,
            events_tx,
            events_rx,
            status,
            feed: None,
            feed_connected: false,
            snapshot_seq: 0,
            applied_snapshot_seq: 0,
            last_snapshot_at: None,
            stale_discarded: 0,
        };
        session.publish_status();

        let handle = SessionHandle {
            commands: commands_tx,
            status: status_rx,
        };
        (session, handle)
    }

    /// Run until shutdown (or until every handle is dropped) and hand back the overlay.
    pub async fn run(mut self) -> Overlay<S> {
        let mut refresh = self.options.refresh_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                _ = next_tick(&mut refresh) => self.refresh(),
            }
            self.publish_status();
        }

        self.close_feed();
        self.publish_status();
        tracing::info!("session stopped");
        self.overlay
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SwitchServer { name, reply } => {
                let result = self.switch_server(&name);
                let _ = reply.send(result);
            }
            Command::Refresh => self.refresh(),
            Command::SetDisabledCategories(disabled) => {
                self.overlay.set_disabled_categories(disabled)
            }
            Command::SetShowBlips(show) => self.overlay.set_show_blips(show),
            Command::SetPlayerFilter(filter) => self.overlay.set_player_filter(filter),
            Command::Shutdown => {}
        }
    }

    fn switch_server(&mut self, name: &str) -> Result<Generation, SyncError> {
        let plan = self.sync.switch_server(name)?;

        self.close_feed();
        self.overlay.set_player_filter(None);
        self.overlay.drop_players();
        let ticket = self.overlay.reset();

        self.schedule(
            CLUSTER_RECREATE_DELAY,
            SessionEvent::RecreateClusters(ticket),
        );
        self.schedule(SWITCH_DEBOUNCE, SessionEvent::BeginSync(plan.generation));
        Ok(plan.generation)
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::BeginSync(generation) => {
                if !self.accept(generation, "switch") {
                    return;
                }
                self.fetch_snapshot(generation);
                self.open_feed(generation);
            }
            SessionEvent::SnapshotLoaded {
                generation,
                seq,
                result,
            } => {
                if !self.accept(generation, "snapshot") {
                    return;
                }
                if seq <= self.applied_snapshot_seq {
                    tracing::debug!(
                        seq,
                        applied = self.applied_snapshot_seq,
                        "discarding out-of-order snapshot"
                    );
                    self.count_discard("snapshot_order");
                    return;
                }
                if self.apply_snapshot(result) {
                    self.applied_snapshot_seq = seq;
                }
            }
            SessionEvent::Feed { generation, frame } => {
                if !self.accept(generation, "feed") {
                    return;
                }
                self.apply_frame(&frame);
            }
            SessionEvent::FeedConnected(generation) => {
                if !self.accept(generation, "feed_connect") {
                    return;
                }
                self.set_feed_connected(true);
            }
            SessionEvent::FeedClosed { generation, error } => {
                if !self.accept(generation, "feed_close") {
                    return;
                }
                match error {
                    Some(e) => tracing::warn!("Feed closed: {e}"),
                    None => tracing::info!("feed closed by server"),
                }
                self.feed = None;
                self.set_feed_connected(false);
                self.overlay.drop_players();
            }
            SessionEvent::RecreateClusters(ticket) => {
                self.overlay.finish_recreate(ticket);
            }
        }
    }

    /// Whether a result tagged with `generation` may touch state. Counts the rest.
    fn accept(&mut self, generation: Generation, source: &'static str) -> bool {
        if self.sync.is_current(generation) {
            return true;
        }
        tracing::debug!(
            source,
            generation = generation.get(),
            current = self.sync.generation().get(),
            "discarding stale result"
        );
        self.count_discard(source);
        false
    }

    fn count_discard(&mut self, source: &'static str) {
        metrics::STALE_RESULTS_DISCARDED_TOTAL
            .with_label_values(&[source])
            .inc();
        self.stale_discarded += 1;
    }

    fn refresh(&mut self) {
        if self.sync.current().is_none() {
            tracing::debug!("refresh requested with no active server");
            return;
        }
        self.fetch_snapshot(self.sync.generation());
    }

    fn fetch_snapshot(&mut self, generation: Generation) {
        let Some(server) = self.sync.current() else {
            return;
        };
        self.snapshot_seq += 1;
        let seq = self.snapshot_seq;
        let source = self.snapshots.clone();
        let url = server.blips_url.clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let result = source.fetch(&url).await;
            metrics::SNAPSHOT_FETCH_SECONDS.observe(started.elapsed().as_secs_f64());
            let _ = tx.send(SessionEvent::SnapshotLoaded {
                generation,
                seq,
                result,
            });
        });
    }

    /// Load a fetched snapshot. Returns false when it could not be fetched or decoded.
    fn apply_snapshot(&mut self, result: Result<String, TransportError>) -> bool {
        let snapshot = match result.map_err(|e| e.to_string()).and_then(|body| {
            decode_snapshot(&body).map_err(|e| e.to_string())
        }) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!("Failed to load snapshot: {e}");
                metrics::SNAPSHOT_FETCHES_TOTAL
                    .with_label_values(&["error"])
                    .inc();
                return false;
            }
        };

        metrics::SNAPSHOT_FETCHES_TOTAL
            .with_label_values(&["ok"])
            .inc();
        if snapshot.skipped > 0 {
            tracing::warn!(skipped = snapshot.skipped, "snapshot contained invalid blips");
        }
        let ticket = self.overlay.load_snapshot(snapshot.records);
        self.schedule(
            CLUSTER_RECREATE_DELAY,
            SessionEvent::RecreateClusters(ticket),
        );
        self.last_snapshot_at = Some(Utc::now());
        true
    }

    fn apply_frame(&mut self, frame: &str) {
        match decode_feed_message(frame) {
            Ok(Some(event)) => {
                let kind = event.kind();
                let outcome = if self.overlay.apply_event(event) {
                    "applied"
                } else {
                    "ignored"
                };
                metrics::FEED_EVENTS_TOTAL
                    .with_label_values(&[kind, outcome])
                    .inc();
            }
            Ok(None) => {}
            Err(e) => {
                metrics::FEED_DECODE_ERRORS_TOTAL.inc();
                tracing::warn!("Skipping feed message: {e}");
            }
        }
    }

    fn open_feed(&mut self, generation: Generation) {
        let Some(server) = self.sync.current() else {
            return;
        };
        let connector = self.feeds.clone();
        let url = server.feed_url.clone();
        let tx = self.events_tx.clone();

        self.close_feed();
        self.feed = Some(tokio::spawn(async move {
            let mut frames = match connector.connect(&url).await {
                Ok(frames) => {
                    if tx.send(SessionEvent::FeedConnected(generation)).is_err() {
                        return;
                    }
                    frames
                }
                Err(e) => {
                    let _ = tx.send(SessionEvent::FeedClosed {
                        generation,
                        error: Some(e),
                    });
                    return;
                }
            };
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(frame) => {
                        if tx.send(SessionEvent::Feed { generation, frame }).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(SessionEvent::FeedClosed {
                            generation,
                            error: Some(e),
                        });
                        return;
                    }
                }
            }
            let _ = tx.send(SessionEvent::FeedClosed {
                generation,
                error: None,
            });
        }));
    }

    /// Abort the feed task. Dropping its stream closes the connection.
    fn close_feed(&mut self) {
        if let Some(feed) = self.feed.take() {
            feed.abort();
            tracing::debug!("feed closed");
        }
        self.set_feed_connected(false);
    }

    fn set_feed_connected(&mut self, connected: bool) {
        self.feed_connected = connected;
        metrics::FEED_CONNECTED.set(connected as i64);
    }

    fn schedule(&self, delay: Duration, event: SessionEvent) {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        });
    }

    fn publish_status(&self) {
        let overlay = &self.overlay;
        let settings = overlay.settings();
        let status = OverlayStatus {
            server: self.sync.current().map(|s| s.name.clone()),
            generation: self.sync.generation().get(),
            blips: overlay.registry().count(),
            categories: overlay.registry().categories().count(),
            marker_slots: overlay.table().len(),
            live_slots: overlay.table().live_count(),
            marker_epoch: overlay.table().epoch(),
            players: overlay.players().len(),
            cluster_present: overlay.clusters().current().is_some(),
            feed_connected: self.feed_connected,
            show_blips: settings.show_blips,
            disabled_categories: settings
                .disabled
                .iter()
                .map(|c| c.as_str().to_string())
                .collect(),
            player_filter: overlay.players().filter().cloned(),
            filter_attributes: overlay.players().filter_attributes().into_iter().collect(),
            last_snapshot_at: self.last_snapshot_at,
            stale_discarded: self.stale_discarded,
        };
        self.status.send_replace(status);
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
