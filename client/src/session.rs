//! `AnalysisClient` – the realtime analysis client as a whole.
//!
//! Wires the connection manager, correlator, normalizer, publisher and
//! ledger together.  One event task consumes connection events in
//! transport order and runs each handler to completion; shared state sits
//! behind a single mutex that is never held across an `.await`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use birdlens_common::config::Config;
use birdlens_common::detection::{Detection, IdentifiedBird, RawDetection};
use birdlens_common::protocol::CollectedBird;

use crate::backend::{BackendClient, CollectionService};
use crate::connection::{lock, ConnectionEvent, ConnectionManager, ConnectionStatus};
use crate::correlator::{Correlator, Outcome};
use crate::error::{ServiceError, SubmitError};
use crate::ledger::DetectionLedger;
use crate::normalizer::Normalizer;
use crate::publisher::SightingPublisher;
use crate::taxonomy::{EbirdTaxonomy, TaxonomyLookup};
use crate::transport::{Connector, WsConnector};

pub use crate::publisher::UserSession;

/// Broadcast to observers as the client's state moves.
#[derive(Debug, Clone)]
pub enum ClientUpdate {
    Accepted { analysis_id: Option<String> },
    Progress(String),
    /// Deduplicated, enriched result of the current request.
    Completed(Vec<Detection>),
    Failed(String),
    LedgerChanged(Vec<IdentifiedBird>),
    CollectionChanged(Vec<CollectedBird>),
}

#[derive(Default)]
struct Shared {
    correlator: Correlator,
    last_result: Option<Vec<Detection>>,
    ledger: DetectionLedger,
    collection: Vec<CollectedBird>,
    user: Option<UserSession>,
}

struct Inner {
    shared: Mutex<Shared>,
    updates: broadcast::Sender<ClientUpdate>,
    normalizer: Normalizer,
    publisher: SightingPublisher,
}

pub struct AnalysisClient {
    connection: ConnectionManager,
    inner: Arc<Inner>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl AnalysisClient {
    /// Start with explicit collaborators.  Must be called from within a
    /// tokio runtime; connecting starts immediately.
    pub fn start(
        config: &Config,
        connector: Arc<dyn Connector>,
        taxonomy: Arc<dyn TaxonomyLookup>,
        backend: Arc<dyn CollectionService>,
    ) -> Self {
        let (connection, events) = ConnectionManager::start(
            connector,
            config.analysis_ws_url.clone(),
            config.reconnect_delay,
        );
        let (updates, _) = broadcast::channel(64);

        let inner = Arc::new(Inner {
            shared: Mutex::new(Shared::default()),
            updates,
            normalizer: Normalizer::new(taxonomy),
            publisher: SightingPublisher::new(backend),
        });

        let event_task = tokio::spawn(run_events(
            events,
            inner.clone(),
            config.analysis_timeout,
        ));

        AnalysisClient {
            connection,
            inner,
            event_task: Mutex::new(Some(event_task)),
        }
    }

    /// Production wiring: WebSocket link, eBird taxonomy, HTTP backend, and
    /// the user session from the config when it carries one.
    pub fn connect(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .context("Cannot create HTTP client")?;

        let taxonomy = Arc::new(EbirdTaxonomy::new(
            http.clone(),
            &config.ebird_base_url,
            &config.ebird_api_token,
        ));
        let backend = Arc::new(BackendClient::new(http, &config.api_base_url));
        let connector = Arc::new(WsConnector::new(config.http_timeout));

        let client = Self::start(config, connector, taxonomy, backend);
        if let (Some(user_id), Some(token)) = (&config.user_id, &config.auth_token) {
            client.set_user(Some(UserSession::new(user_id.as_str(), token.as_str())));
        }
        Ok(client)
    }

    /// Send `audio` for analysis.
    ///
    /// Refused, with nothing sent and nothing changed, while disconnected,
    /// while another analysis is in flight, or for an empty payload.
    pub fn submit(&self, audio: &[u8], filename: &str) -> Result<(), SubmitError> {
        let mut shared = lock(&self.inner.shared);
        let frame = shared
            .correlator
            .prepare(self.connection.is_connected(), audio, filename)?;
        self.connection.send(frame).map_err(|e| {
            debug!("Submit of {filename} refused: {e}");
            SubmitError::NotConnected
        })?;
        shared.correlator.mark_submitted(filename, Instant::now());
        shared.last_result = None;
        Ok(())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientUpdate> {
        self.inner.updates.subscribe()
    }

    pub fn is_analyzing(&self) -> bool {
        lock(&self.inner.shared).correlator.is_analyzing()
    }

    pub fn analysis_id(&self) -> Option<String> {
        lock(&self.inner.shared)
            .correlator
            .analysis_id()
            .map(String::from)
    }

    /// Enriched detections of the last completed request.
    pub fn last_result(&self) -> Option<Vec<Detection>> {
        lock(&self.inner.shared).last_result.clone()
    }

    /// Failure message of the last failed request.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.inner.shared)
            .correlator
            .last_error()
            .map(String::from)
    }

    /// Species identified this session and not yet collected.
    pub fn ledger(&self) -> Vec<IdentifiedBird> {
        lock(&self.inner.shared).ledger.entries().to_vec()
    }

    pub fn collection(&self) -> Vec<CollectedBird> {
        lock(&self.inner.shared).collection.clone()
    }

    pub fn user(&self) -> Option<UserSession> {
        lock(&self.inner.shared).user.clone()
    }

    /// Switch user (or sign out with `None`).  A different user starts with
    /// an empty ledger and collection view.
    pub fn set_user(&self, user: Option<UserSession>) {
        {
            let mut shared = lock(&self.inner.shared);
            if shared.user == user {
                return;
            }
            shared.user = user;
            shared.ledger.clear();
            shared.collection.clear();
        }
        info!("User session changed – ledger cleared");
        self.inner.notify(ClientUpdate::LedgerChanged(Vec::new()));
        self.inner.notify(ClientUpdate::CollectionChanged(Vec::new()));
    }

    /// Drop one species from the ledger, e.g. once the user collected it.
    pub fn remove_bird(&self, species_code: &str) -> bool {
        let snapshot = {
            let mut shared = lock(&self.inner.shared);
            if !shared.ledger.remove_bird(species_code) {
                return false;
            }
            shared.ledger.entries().to_vec()
        };
        self.inner.notify(ClientUpdate::LedgerChanged(snapshot));
        true
    }

    /// Re-read the durable collection and reconcile the ledger with it.
    pub async fn refresh_collection(&self) -> Result<(), ServiceError> {
        let user = self
            .user()
            .ok_or(ServiceError::MissingCredentials("user session"))?;
        let birds = self.inner.publisher.refresh_collection(&user).await?;
        self.inner.apply_collection(&user, birds);
        Ok(())
    }

    /// Close the link, cancel reconnection and stop the event task.
    pub async fn shutdown(&self) {
        self.connection.shutdown().await;
        let task = lock(&self.event_task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Event task ended abnormally: {e}");
            }
        }
    }
}

impl Inner {
    fn notify(&self, update: ClientUpdate) {
        // No subscribers is fine.
        let _ = self.updates.send(update);
    }

    async fn handle_outcome(&self, outcome: Outcome) {
        match outcome {
            Outcome::Accepted { analysis_id } => {
                self.notify(ClientUpdate::Accepted { analysis_id })
            }
            Outcome::Progress(message) => self.notify(ClientUpdate::Progress(message)),
            Outcome::Failed(message) => self.notify(ClientUpdate::Failed(message)),
            Outcome::Completed(raw) => self.complete(raw).await,
        }
    }

    async fn complete(&self, raw: Vec<RawDetection>) {
        let detections = self.normalizer.normalize(raw).await;
        for d in &detections {
            info!("{d}");
        }

        let (user, ledger) = {
            let mut guard = lock(&self.shared);
            let shared = &mut *guard;
            shared.last_result = Some(detections.clone());
            shared.ledger.add_detections(&detections, Utc::now());
            shared.ledger.reconcile(&shared.collection);
            (shared.user.clone(), shared.ledger.entries().to_vec())
        };
        self.notify(ClientUpdate::Completed(detections.clone()));
        self.notify(ClientUpdate::LedgerChanged(ledger));

        let Some(report) = self.publisher.publish(&detections, user.as_ref()).await else {
            return;
        };
        if let (Some(user), Some(birds)) = (user, report.collection) {
            self.apply_collection(&user, birds);
        }
    }

    /// Install a fresh collection for `user` and reconcile the ledger.
    /// Ignored if the session changed meanwhile.
    fn apply_collection(&self, user: &UserSession, birds: Vec<CollectedBird>) {
        let (removed, ledger) = {
            let mut guard = lock(&self.shared);
            let shared = &mut *guard;
            if shared.user.as_ref() != Some(user) {
                debug!("Discarding collection of a previous session");
                return;
            }
            shared.collection = birds.clone();
            let removed = shared.ledger.reconcile(&shared.collection);
            (removed, shared.ledger.entries().to_vec())
        };
        self.notify(ClientUpdate::CollectionChanged(birds));
        if removed > 0 {
            self.notify(ClientUpdate::LedgerChanged(ledger));
        }
    }
}

async fn run_events(
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    inner: Arc<Inner>,
    analysis_timeout: Option<Duration>,
) {
    let mut expiry = analysis_timeout.map(|timeout| {
        let mut ticker = tokio::time::interval(timeout.min(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        (ticker, timeout)
    });

    loop {
        let event = match expiry.as_mut() {
            Some((ticker, timeout)) => tokio::select! {
                event = events.recv() => event,
                _ = ticker.tick() => {
                    let outcome = lock(&inner.shared).correlator.expire(Instant::now(), *timeout);
                    if let Some(outcome) = outcome {
                        inner.handle_outcome(outcome).await;
                    }
                    continue;
                }
            },
            None => events.recv().await,
        };
        let Some(event) = event else {
            break;
        };

        let outcome = match event {
            ConnectionEvent::Opened => None,
            ConnectionEvent::Frame(text) => lock(&inner.shared).correlator.handle_frame(&text),
            ConnectionEvent::Closed => lock(&inner.shared).correlator.connection_lost(),
        };
        if let Some(outcome) = outcome {
            inner.handle_outcome(outcome).await;
        }
    }
    debug!("Event task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    use crate::connection::tests::{FakeConnector, ServerEnd};
    use crate::normalizer::tests::FakeTaxonomy;
    use crate::publisher::tests::FakeBackend;

    struct Harness {
        client: AnalysisClient,
        server: ServerEnd,
        updates: broadcast::Receiver<ClientUpdate>,
        taxonomy: Arc<FakeTaxonomy>,
        backend: Arc<FakeBackend>,
    }

    async fn harness(config: Config) -> Harness {
        let (connector, mut servers) = FakeConnector::new();
        let taxonomy = FakeTaxonomy::new(&[
            ("X1", "Turdus migratorius", "American Robin"),
            ("blujay", "Cyanocitta cristata", "Blue Jay"),
        ]);
        let backend = Arc::new(FakeBackend::default());
        let client = AnalysisClient::start(&config, connector, taxonomy.clone(), backend.clone());
        let updates = client.subscribe();

        let server = servers.recv().await.unwrap();
        client
            .watch_status()
            .wait_for(|s| s.connected())
            .await
            .unwrap();
        Harness {
            client,
            server,
            updates,
            taxonomy,
            backend,
        }
    }

    async fn next_matching(
        rx: &mut broadcast::Receiver<ClientUpdate>,
        pred: impl Fn(&ClientUpdate) -> bool,
    ) -> ClientUpdate {
        loop {
            let update = rx.recv().await.unwrap();
            if pred(&update) {
                return update;
            }
        }
    }

    async fn terminal(rx: &mut broadcast::Receiver<ClientUpdate>) -> ClientUpdate {
        next_matching(rx, |u| {
            matches!(u, ClientUpdate::Completed(_) | ClientUpdate::Failed(_))
        })
        .await
    }

    const COMPLETED_X1: &str = r#"{"type":"analysis_completed","result":{"detections":[
        {"species_name":"robin","species_code":"X1","confidence":0.9,"start_time":0.0,"end_time":3.0},
        {"species_name":"robin","species_code":"X1","confidence":0.4,"start_time":3.0,"end_time":6.0}]}}"#;

    #[tokio::test]
    async fn test_submit_sends_one_frame() {
        let mut h = harness(Config::default()).await;

        h.client.submit(b"bird", "dawn.wav").unwrap();
        assert!(h.client.is_analyzing());

        let frame = h.server.from_client.recv().await.unwrap();
        let v: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["type"], "analyze_audio");
        assert_eq!(v["filename"], "dawn.wav");
        assert_eq!(v["audio"], "YmlyZA==");
        assert!(h.server.from_client.try_recv().is_err());

        h.client.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_submit_rejected_while_analyzing() {
        let mut h = harness(Config::default()).await;

        // A failed first request leaves an error behind.
        h.client.submit(b"one", "one.wav").unwrap();
        h.server.push(r#"{"type":"error","message":"first failed"}"#);
        terminal(&mut h.updates).await;

        h.client.submit(b"two", "two.wav").unwrap();
        assert_eq!(h.client.last_error(), None);
        h.server.from_client.recv().await.unwrap();
        h.server.from_client.recv().await.unwrap();

        assert_eq!(
            h.client.submit(b"three", "three.wav"),
            Err(SubmitError::AlreadyAnalyzing)
        );
        assert!(h.server.from_client.try_recv().is_err());
        assert!(h.client.is_analyzing());
        assert_eq!(h.client.last_error(), None);
        assert_eq!(h.client.last_result(), None);

        h.client.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_rejected_while_disconnected() {
        let h = harness(Config::default()).await;
        let mut status = h.client.watch_status();
        drop(h.server);
        status.wait_for(|s| !s.connected()).await.unwrap();

        assert_eq!(
            h.client.submit(b"bird", "dawn.wav"),
            Err(SubmitError::NotConnected)
        );
        assert!(!h.client.is_analyzing());
        h.client.shutdown().await;
    }

    #[tokio::test]
    async fn test_completed_result_is_deduplicated_and_enriched() {
        let mut h = harness(Config::default()).await;
        h.client.submit(b"bird", "dawn.wav").unwrap();
        h.server
            .push(r#"{"type":"analysis_accepted","analysis_id":"an-1"}"#);
        h.server.push(COMPLETED_X1);

        let accepted = next_matching(&mut h.updates, |u| matches!(u, ClientUpdate::Accepted { .. })).await;
        assert!(matches!(
            accepted,
            ClientUpdate::Accepted { analysis_id: Some(ref id) } if id == "an-1"
        ));

        match terminal(&mut h.updates).await {
            ClientUpdate::Completed(dets) => {
                assert_eq!(dets.len(), 1);
                assert_eq!(dets[0].species_code, "X1");
                assert_eq!(dets[0].confidence, 0.9);
                assert_eq!(dets[0].common_name.as_deref(), Some("American Robin"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!h.client.is_analyzing());
        assert_eq!(h.client.analysis_id().as_deref(), Some("an-1"));
        assert_eq!(h.client.last_result().unwrap().len(), 1);
        assert_eq!(h.taxonomy.calls(), 1);
        h.client.shutdown().await;
    }

    #[tokio::test]
    async fn test_server_error_fails_request() {
        let mut h = harness(Config::default()).await;
        h.client.submit(b"bird", "dawn.wav").unwrap();
        h.server.push(r#"{"type":"error","message":"boom"}"#);

        match terminal(&mut h.updates).await {
            ClientUpdate::Failed(message) => assert_eq!(message, "boom"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!h.client.is_analyzing());
        assert_eq!(h.client.last_error().as_deref(), Some("boom"));
        h.client.shutdown().await;
    }

    #[tokio::test]
    async fn test_connection_drop_fails_in_flight_request() {
        let mut h = harness(Config::default()).await;
        h.client.submit(b"bird", "dawn.wav").unwrap();
        h.server.push(r#"{"type":"analysis_progress","message":"halfway"}"#);
        drop(h.server);

        let progress = next_matching(&mut h.updates, |u| matches!(u, ClientUpdate::Progress(_))).await;
        assert!(matches!(progress, ClientUpdate::Progress(ref m) if m == "halfway"));
        assert!(matches!(terminal(&mut h.updates).await, ClientUpdate::Failed(_)));
        assert!(!h.client.is_analyzing());
        h.client.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_session_keeps_detections_local() {
        let mut h = harness(Config::default()).await;
        h.client.submit(b"bird", "dawn.wav").unwrap();
        h.server.push(COMPLETED_X1);

        terminal(&mut h.updates).await;
        next_matching(&mut h.updates, |u| matches!(u, ClientUpdate::LedgerChanged(_))).await;

        assert!(h.backend.sightings().is_empty());
        assert_eq!(h.backend.refreshes(), 0);
        let ledger = h.client.ledger();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].species_code, "X1");
        h.client.shutdown().await;
    }

    #[tokio::test]
    async fn test_published_species_leave_the_ledger() {
        let mut h = harness(Config::default()).await;
        h.client.set_user(Some(UserSession::new("u1", "tok")));

        h.client.submit(b"bird", "dawn.wav").unwrap();
        h.server.push(COMPLETED_X1);

        let collection = next_matching(&mut h.updates, |u| {
            matches!(u, ClientUpdate::CollectionChanged(c) if !c.is_empty())
        })
        .await;
        match collection {
            ClientUpdate::CollectionChanged(birds) => {
                assert_eq!(birds[0].species_name, "Turdus migratorius")
            }
            other => panic!("unexpected {other:?}"),
        }

        let sent = h.backend.sightings();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].user_id, "u1");
        assert_eq!(h.backend.refreshes(), 1);
        // Now collected, so no longer new.
        assert!(h.client.ledger().is_empty());
        h.client.shutdown().await;
    }

    #[tokio::test]
    async fn test_sloppy_result_completes_and_publishes_named_species_only() {
        let mut h = harness(Config::default()).await;
        h.client.set_user(Some(UserSession::new("u1", "tok")));

        h.client.submit(b"bird", "dawn.wav").unwrap();
        h.server.push(
            r#"{"type":"analysis_completed","detections":[
                {"confidence":0.7},
                {"species_name":"robin","species_code":"X1","confidence":0.9,"end_time":null}]}"#,
        );

        match terminal(&mut h.updates).await {
            ClientUpdate::Completed(dets) => {
                assert_eq!(dets.len(), 1);
                assert_eq!(dets[0].species_code, "X1");
            }
            other => panic!("unexpected {other:?}"),
        }
        next_matching(&mut h.updates, |u| matches!(u, ClientUpdate::CollectionChanged(_))).await;

        let sent = h.backend.sightings();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].species_name, "Turdus migratorius");
        assert!(!h.client.is_analyzing());
        assert!(h.client.submit(b"bird", "noon.wav").is_ok());
        h.client.shutdown().await;
    }

    #[tokio::test]
    async fn test_user_switch_clears_ledger_and_remove_bird() {
        let mut h = harness(Config::default()).await;
        h.client.submit(b"bird", "dawn.wav").unwrap();
        h.server.push(
            r#"{"type":"analysis_completed","detections":[
                {"species_name":"robin","species_code":"X1","confidence":0.9},
                {"species_name":"jay","species_code":"blujay","confidence":0.8}]}"#,
        );
        terminal(&mut h.updates).await;
        next_matching(&mut h.updates, |u| matches!(u, ClientUpdate::LedgerChanged(_))).await;
        assert_eq!(h.client.ledger().len(), 2);

        assert!(h.client.remove_bird("blujay"));
        assert!(!h.client.remove_bird("blujay"));
        assert_eq!(h.client.ledger().len(), 1);

        h.client.set_user(Some(UserSession::new("u2", "tok2")));
        assert!(h.client.ledger().is_empty());
        assert!(h.client.collection().is_empty());
        h.client.shutdown().await;
    }

    #[tokio::test]
    async fn test_refresh_collection_requires_session() {
        let h = harness(Config::default()).await;
        assert!(matches!(
            h.client.refresh_collection().await,
            Err(ServiceError::MissingCredentials(_))
        ));

        h.backend.collection.lock().unwrap().push(CollectedBird {
            species_name: "Turdus migratorius".into(),
            common_name: "American Robin".into(),
            image_url: None,
            first_seen_at: None,
        });
        h.client.set_user(Some(UserSession::new("u1", "tok")));
        h.client.refresh_collection().await.unwrap();
        assert_eq!(h.client.collection().len(), 1);
        h.client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_analysis_timeout_fails_request() {
        let config = Config {
            analysis_timeout: Some(Duration::from_secs(30)),
            ..Config::default()
        };
        let mut h = harness(config).await;
        h.client.submit(b"bird", "dawn.wav").unwrap();

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(h.client.is_analyzing());

        match terminal(&mut h.updates).await {
            ClientUpdate::Failed(message) => assert!(message.contains("timed out")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!h.client.is_analyzing());
        // The link itself is untouched.
        assert!(h.client.status().connected());
        h.client.shutdown().await;
    }
}
