//! The offline worker: lifecycle coordination and event dispatch.
//!
//! A `Worker` owns one deployment version. The host feeds it lifecycle events
//! through [`Worker::dispatch`]; each event runs as its own task and holds a
//! keep-alive guard until it settles, so [`Worker::settled`] tells the host
//! when it is safe to shut down.
//!
//! Lifecycle of a version: `install` populates its cache generation from the
//! precache manifest, `activate` promotes it and removes every other
//! generation. In between, an update may wait for the clients of the previous
//! version to go away (see [`ActivationPolicy`]).

pub mod activate;
pub mod install;
pub mod keepalive;
pub mod push;
pub mod refresh;
pub mod router;
pub mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::bus::{ClientId, MessageBus};
use crate::cache::{CacheStore, GenerationId, PrecacheManifest};
use crate::error::Result;
use crate::http::{CacheKey, Network, Request, Response};
use crate::models::{ClientMessage, PushSubscription, WorkerMessage};
use crate::notify::{NotificationGateway, NotificationSink};

pub use activate::{ActivationCoordinator, ActivationPolicy, ActivationState};
pub use install::{InstallCoordinator, InstallState};
pub use keepalive::{KeepAlive, KeepAliveGuard};
pub use push::{PushHandler, PushOutcome};
pub use refresh::{RefreshOutcome, RefreshService};
pub use router::{CacheMissPolicy, FetchRouter, Route, RouteTargets, Strategy};
pub use state::WorkerState;

/// Path of the dynamic rates resource, relative to the origin
pub const DEFAULT_DYNAMIC_PATH: &str = "api/latest.json";

/// Path the foreground posts push subscriptions to, relative to the origin
pub const DEFAULT_PUSH_REGISTER_PATH: &str = "push-register";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub version: GenerationId,
    pub origin: Url,
    pub manifest: PrecacheManifest,
    pub dynamic_path: String,
    pub push_register_path: String,
    pub cache_miss: CacheMissPolicy,
    pub activation: ActivationPolicy,
}

impl WorkerConfig {
    pub fn new(version: GenerationId, origin: Url, manifest: PrecacheManifest) -> Self {
        Self {
            version,
            origin,
            manifest,
            dynamic_path: DEFAULT_DYNAMIC_PATH.to_string(),
            push_register_path: DEFAULT_PUSH_REGISTER_PATH.to_string(),
            cache_miss: CacheMissPolicy::default(),
            activation: ActivationPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Install,
    Activate,
    Fetch(Request),
    Push(Option<Vec<u8>>),
    Message { from: ClientId, data: Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Install,
    Activate,
    Fetch,
    Push,
    Message,
}

impl LifecycleEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            LifecycleEvent::Install => EventKind::Install,
            LifecycleEvent::Activate => EventKind::Activate,
            LifecycleEvent::Fetch(_) => EventKind::Fetch,
            LifecycleEvent::Push(_) => EventKind::Push,
            LifecycleEvent::Message { .. } => EventKind::Message,
        }
    }
}

/// How a dispatched event settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Installed(InstallState),
    Activated(ActivationState),
    /// `None` when the request was left unanswered.
    Responded(Option<Response>),
    Pushed(PushOutcome),
    MessageHandled,
    /// The handler task panicked.
    Aborted,
}

/// A dispatched event still running.
pub struct EventTask {
    pub kind: EventKind,
    handle: JoinHandle<EventOutcome>,
}

impl EventTask {
    pub async fn outcome(self) -> EventOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(kind = ?self.kind, error = %e, "Event handler aborted");
                EventOutcome::Aborted
            }
        }
    }
}

/// Snapshot of the worker for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub version: GenerationId,
    pub active: Option<GenerationId>,
    pub generations: Vec<GenerationId>,
    pub install: InstallState,
    pub activation: ActivationState,
    pub waiting: bool,
    pub clients: usize,
}

struct Inner {
    config: WorkerConfig,
    store: CacheStore,
    network: Arc<dyn Network>,
    bus: MessageBus,
    state: Arc<WorkerState>,
    router: FetchRouter,
    installer: InstallCoordinator,
    activator: ActivationCoordinator,
    refresh: Arc<RefreshService>,
    push: PushHandler,
    keep_alive: KeepAlive,
    /// Installed and waiting for the previous version's clients to leave.
    waiting: AtomicBool,
}

/// Clone is cheap - all clones drive the same worker.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<Inner>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        store: CacheStore,
        network: Arc<dyn Network>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        let rates_url = config.origin.join(&config.dynamic_path)?;
        let push_register_url = config.origin.join(&config.push_register_path)?;
        let mut refresh_url = rates_url.clone();
        refresh_url.set_query(Some("refresh=true"));

        let state = Arc::new(WorkerState::new());
        let bus = MessageBus::new();
        let gateway = Arc::new(NotificationGateway::new(
            sink,
            Arc::clone(&state),
            store.clone(),
            config.origin.clone(),
        ));
        let refresh = Arc::new(RefreshService::new(
            refresh_url,
            store.clone(),
            Arc::clone(&network),
            Arc::clone(&gateway),
        ));

        let inner = Inner {
            router: FetchRouter::new(RouteTargets {
                dynamic_path: rates_url.path().to_string(),
                push_register_path: push_register_url.path().to_string(),
            }),
            installer: InstallCoordinator::new(
                config.version.clone(),
                config.manifest.clone(),
                config.origin.clone(),
                store.clone(),
                Arc::clone(&network),
                Arc::clone(&gateway),
            ),
            activator: ActivationCoordinator::new(config.version.clone(), store.clone(), bus.clone()),
            push: PushHandler::new(Arc::clone(&refresh), bus.clone(), gateway),
            refresh,
            config,
            store,
            network,
            bus,
            state,
            keep_alive: KeepAlive::new(),
            waiting: AtomicBool::new(false),
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    pub fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    pub fn state(&self) -> &WorkerState {
        &self.inner.state
    }

    pub fn refresh_service(&self) -> &RefreshService {
        &self.inner.refresh
    }

    /// Run an event on its own task. The keep-alive guard is taken before
    /// this returns, and fetches are routed before the task is spawned.
    pub fn dispatch(&self, event: LifecycleEvent) -> EventTask {
        let kind = event.kind();
        let guard = self.inner.keep_alive.hold();
        let worker = self.clone();

        let task: BoxFuture<'static, EventOutcome> = match event {
            LifecycleEvent::Install => {
                async move { EventOutcome::Installed(worker.inner.installer.install().await) }.boxed()
            }
            LifecycleEvent::Activate => {
                async move { EventOutcome::Activated(worker.inner.activator.activate().await) }.boxed()
            }
            LifecycleEvent::Fetch(request) => {
                let route = self.inner.router.route(&request);
                debug!(route = route.name, method = %request.method, url = %request.url, "Routed fetch");
                let strategy = route.strategy;
                async move { EventOutcome::Responded(worker.respond(strategy, request).await) }.boxed()
            }
            LifecycleEvent::Push(payload) => async move {
                EventOutcome::Pushed(worker.inner.push.handle_push(payload.as_deref()).await)
            }
            .boxed(),
            LifecycleEvent::Message { from, data } => async move {
                worker.handle_message(from, &data).await;
                EventOutcome::MessageHandled
            }
            .boxed(),
        };

        let handle = tokio::spawn(async move {
            let _guard = guard;
            task.await
        });
        EventTask { kind, handle }
    }

    /// Resolves once every dispatched event has settled.
    pub async fn settled(&self) {
        self.inner.keep_alive.settled().await
    }

    /// Bring this version into service: install, then activate as the
    /// activation policy allows. A restart on top of the already active
    /// version skips both.
    pub async fn start(&self) -> ActivationState {
        if self.inner.activator.resume().await {
            info!(generation = %self.inner.config.version, "Resumed active generation");
            return ActivationState::Active;
        }

        let had_previous = self.inner.store.active().await.is_some();
        match self.dispatch(LifecycleEvent::Install).outcome().await {
            EventOutcome::Installed(InstallState::Installed) => {}
            _ => return ActivationState::Idle,
        }

        if self.inner.config.activation == ActivationPolicy::WhenClientsReleased && had_previous {
            // Raised before looking at the clients, so a client leaving from
            // here on sees it and activates in our place
            self.inner.waiting.store(true, Ordering::SeqCst);
            if !self.inner.bus.is_empty().await {
                info!(
                    generation = %self.inner.config.version,
                    clients = self.inner.bus.len().await,
                    "Update waiting for clients to close"
                );
                return ActivationState::Idle;
            }
            if !self.inner.waiting.swap(false, Ordering::SeqCst) {
                // The last client already left and took over activation
                return self.inner.activator.state().await;
            }
        }

        self.activate_now().await
    }

    async fn activate_now(&self) -> ActivationState {
        match self.dispatch(LifecycleEvent::Activate).outcome().await {
            EventOutcome::Activated(state) => state,
            _ => ActivationState::Idle,
        }
    }

    /// Connect a client, controlled by whichever generation is active now.
    pub async fn connect_client(&self) -> (ClientId, mpsc::UnboundedReceiver<WorkerMessage>) {
        let controller = self.inner.store.active().await;
        self.inner.bus.connect(controller).await
    }

    /// Disconnect a client. When the last one leaves, a waiting update is
    /// activated before this returns.
    pub async fn disconnect_client(&self, id: ClientId) -> bool {
        let removed = self.inner.bus.disconnect(id).await;
        if removed && self.inner.bus.is_empty().await && self.inner.waiting.swap(false, Ordering::SeqCst) {
            info!(generation = %self.inner.config.version, "Last client closed, activating update");
            self.activate_now().await;
        }
        removed
    }

    pub async fn status(&self) -> WorkerStatus {
        WorkerStatus {
            version: self.inner.config.version.clone(),
            active: self.inner.store.active().await,
            generations: self.inner.store.list_generations().await,
            install: self.inner.installer.state().await,
            activation: self.inner.activator.state().await,
            waiting: self.inner.waiting.load(Ordering::SeqCst),
            clients: self.inner.bus.len().await,
        }
    }

    /// Dispatch a fetch and wait for its answer.
    pub async fn respond_to(&self, request: Request) -> Option<Response> {
        match self.dispatch(LifecycleEvent::Fetch(request)).outcome().await {
            EventOutcome::Responded(response) => response,
            _ => None,
        }
    }

    /// Answer an intercepted request with the given strategy.
    pub async fn respond(&self, strategy: Strategy, request: Request) -> Option<Response> {
        match strategy {
            Strategy::Refresh => Some(self.inner.refresh.refresh().await.response),
            Strategy::Passthrough => Some(self.register_push(&request).await),
            Strategy::CacheFirst => self.cache_first(request).await,
        }
    }

    async fn cache_first(&self, request: Request) -> Option<Response> {
        let key = CacheKey::for_request(&request);
        if let Some(cached) = self.inner.store.match_active(&key).await {
            debug!(key = %key, age = %cached.age_display(), "Cache hit");
            return Some(cached.response);
        }

        debug!(key = %key, policy = ?self.inner.config.cache_miss, "Cache miss");
        match self.inner.config.cache_miss {
            CacheMissPolicy::NoResponse => None,
            CacheMissPolicy::Network => Some(self.fetch_live(&request).await),
            CacheMissPolicy::NetworkAndStore => {
                let response = self.fetch_live(&request).await;
                if response.ok() && request.method == Method::GET {
                    self.store_miss(key, response.clone()).await;
                }
                Some(response)
            }
        }
    }

    async fn store_miss(&self, key: CacheKey, response: Response) {
        let _guard = self.inner.store.lock_key(&key).await;
        let Some(handle) = self.inner.store.active_handle().await else {
            return;
        };
        if let Err(e) = handle.put(key.clone(), response).await {
            warn!(key = %key, error = %e, "Failed to store fetched response");
        }
    }

    /// Forward a push registration as is. The subscription is only decoded
    /// to log what the registration server is expected to answer.
    async fn register_push(&self, request: &Request) -> Response {
        let subscription = request
            .body
            .as_deref()
            .and_then(|body| serde_json::from_slice::<PushSubscription>(body).ok());
        let Some(subscription) = subscription else {
            debug!(url = %request.url, "Forwarding push registration without a subscription body");
            return self.fetch_live(request).await;
        };

        let expected = subscription.expected_status();
        if !subscription.is_complete() {
            warn!(url = %request.url, expected, "Forwarding incomplete push subscription");
        }
        let response = self.fetch_live(request).await;
        if response.status != expected {
            debug!(expected, status = response.status, "Unexpected push registration status");
        }
        response
    }

    async fn fetch_live(&self, request: &Request) -> Response {
        match self.inner.network.fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %request.url, error = %e, "Network request failed");
                Response::network_error()
            }
        }
    }

    async fn handle_message(&self, from: ClientId, data: &Value) {
        let Some(message) = ClientMessage::decode(data) else {
            return;
        };

        match message {
            ClientMessage::SetNotificationPermissions(enabled) => {
                self.inner.state.set_notifications_enabled(enabled).await;
            }
            ClientMessage::RequestStatusInfo => {
                let version = self
                    .inner
                    .store
                    .active()
                    .await
                    .unwrap_or_else(|| self.inner.config.version.clone());
                let reply = WorkerMessage::StatusInfo {
                    version: version.to_string(),
                };
                if !self.inner.bus.post(from, reply).await {
                    debug!(client = %from, "Status requester is gone");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RatesDocument;
    use crate::testing::{origin, FakeNetwork, RecordingSink};
    use serde_json::json;

    const RATES: &str = r#"{"rates":{"EUR":0.9}}"#;

    struct Fixture {
        worker: Worker,
        network: Arc<FakeNetwork>,
        sink: Arc<RecordingSink>,
    }

    fn manifest_paths(count: usize) -> Vec<String> {
        let mut paths = vec!["index.html".to_string(), "api/latest.json".to_string()];
        let fixed = paths.len();
        paths.extend((fixed..count).map(|i| format!("img/asset{}.png", i)));
        paths
    }

    fn network_for(paths: &[String]) -> Arc<FakeNetwork> {
        let network = FakeNetwork::new();
        for path in paths {
            let absolute = format!("/{}", path);
            network.respond(&absolute, Response::new(200, absolute.as_bytes()));
        }
        network.respond("/api/latest.json", Response::new(200, RATES));
        Arc::new(network)
    }

    fn fixture_with(
        version: &str,
        store: CacheStore,
        network: Arc<FakeNetwork>,
        paths: &[String],
        configure: impl FnOnce(&mut WorkerConfig),
    ) -> Fixture {
        let mut config = WorkerConfig::new(version.into(), origin(), PrecacheManifest::new(paths.iter()));
        configure(&mut config);
        let sink = Arc::new(RecordingSink::new(true));
        let worker = Worker::new(config, store, network.clone(), sink.clone()).unwrap();
        Fixture { worker, network, sink }
    }

    fn fixture(version: &str) -> Fixture {
        let paths = manifest_paths(3);
        fixture_with(version, CacheStore::in_memory(), network_for(&paths), &paths, |_| {})
    }

    fn get(path: &str) -> LifecycleEvent {
        LifecycleEvent::Fetch(Request::get(origin().join(path).unwrap()))
    }

    async fn respond(worker: &Worker, event: LifecycleEvent) -> Option<Response> {
        match worker.dispatch(event).outcome().await {
            EventOutcome::Responded(response) => response,
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    async fn message(worker: &Worker, from: ClientId, data: Value) {
        let outcome = worker.dispatch(LifecycleEvent::Message { from, data }).outcome().await;
        assert_eq!(outcome, EventOutcome::MessageHandled);
    }

    #[tokio::test]
    async fn test_full_lifecycle_with_push() {
        let paths = manifest_paths(23);
        let f = fixture_with("v73", CacheStore::in_memory(), network_for(&paths), &paths, |_| {});

        assert_eq!(f.worker.start().await, ActivationState::Active);
        let handle = f.worker.store().open("v73".into());
        assert_eq!(handle.keys().await.len(), 23);
        assert!(f.worker.store().list_generations().await.contains(&"v73".into()));

        let (a, mut rx_a) = f.worker.connect_client().await;
        let (_b, mut rx_b) = f.worker.connect_client().await;
        message(&f.worker, a, json!({"type": "SET_NOTIFICATION_PERMISSIONS", "payload": true})).await;
        message(&f.worker, a, json!({"type": "REQUEST_STATUS_INFO"})).await;
        assert_eq!(
            rx_a.try_recv().unwrap(),
            WorkerMessage::StatusInfo { version: "v73".into() }
        );
        assert!(rx_b.try_recv().is_err());

        let fresh = r#"{"rates":{"EUR":0.95}}"#;
        f.network.respond("/api/latest.json", Response::new(200, fresh));
        let outcome = f
            .worker
            .dispatch(LifecycleEvent::Push(Some(br#"{"type":"NEW_RATES","data":{"rates":{}}}"#.to_vec())))
            .outcome()
            .await;
        assert_eq!(outcome, EventOutcome::Pushed(PushOutcome::RatesBroadcast { delivered: 2, updated: true }));

        let expected = WorkerMessage::NewRates(RatesDocument(json!({"rates": {"EUR": 0.95}})));
        assert_eq!(rx_a.try_recv().unwrap(), expected);
        assert_eq!(rx_b.try_recv().unwrap(), expected);

        let cached = respond(&f.worker, get("api/latest.json")).await.unwrap();
        assert_eq!(cached.body, fresh.as_bytes());
        assert!(f.sink.titles().contains(&"New Rates available".to_string()));
    }

    #[tokio::test]
    async fn test_refresh_with_server_error_serves_cached_rates() {
        let f = fixture("v1");
        f.worker.start().await;
        let (client, _rx) = f.worker.connect_client().await;
        message(&f.worker, client, json!({"type": "SET_NOTIFICATION_PERMISSIONS", "payload": true})).await;

        f.network.respond("/api/latest.json", Response::new(500, "boom"));
        let response = respond(&f.worker, get("api/latest.json?refresh=true")).await.unwrap();

        assert_eq!(response.body, RATES.as_bytes());
        let cached = respond(&f.worker, get("api/latest.json")).await.unwrap();
        assert_eq!(cached.body, RATES.as_bytes());
        let shown = f.sink.shown();
        assert_eq!(shown.last().unwrap().body, "Rate request failed with code 500");
    }

    #[tokio::test]
    async fn test_notifications_need_client_permission() {
        let f = fixture("v1");
        f.worker.start().await;
        // No client has sent a preference yet
        assert!(f.sink.shown().is_empty());

        let (client, _rx) = f.worker.connect_client().await;
        message(&f.worker, client, json!({"type": "SET_NOTIFICATION_PERMISSIONS", "payload": false})).await;
        respond(&f.worker, get("api/latest.json?refresh=true")).await;
        assert!(f.sink.shown().is_empty());

        message(&f.worker, client, json!({"type": "SET_NOTIFICATION_PERMISSIONS", "payload": true})).await;
        respond(&f.worker, get("api/latest.json?refresh=true")).await;
        assert_eq!(f.sink.titles(), vec!["Rates updated"]);
    }

    #[tokio::test]
    async fn test_unknown_messages_are_ignored() {
        let f = fixture("v1");
        let (client, mut rx) = f.worker.connect_client().await;
        message(&f.worker, client, json!({"type": "SELF_DESTRUCT"})).await;
        message(&f.worker, client, json!("REQUEST_STATUS_INFO")).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(f.worker.state().notifications_enabled().await, None);
    }

    #[tokio::test]
    async fn test_status_info_before_activation_reports_own_version() {
        let f = fixture("v2");
        let (client, mut rx) = f.worker.connect_client().await;
        message(&f.worker, client, json!({"type": "REQUEST_STATUS_INFO"})).await;
        assert_eq!(rx.try_recv().unwrap(), WorkerMessage::StatusInfo { version: "v2".into() });
    }

    #[tokio::test]
    async fn test_cache_first_serves_without_network() {
        let f = fixture("v1");
        f.worker.start().await;
        let before = f.network.hits("/index.html");

        let response = respond(&f.worker, get("index.html")).await.unwrap();
        assert_eq!(response.body, b"/index.html");
        assert_eq!(f.network.hits("/index.html"), before);
    }

    #[tokio::test]
    async fn test_cache_miss_policies() {
        let paths = manifest_paths(3);
        for (policy, expect_response, expect_stored) in [
            (CacheMissPolicy::NoResponse, false, false),
            (CacheMissPolicy::Network, true, false),
            (CacheMissPolicy::NetworkAndStore, true, true),
        ] {
            let network = network_for(&paths);
            network.respond("/extra.css", Response::new(200, "body{}"));
            let f = fixture_with("v1", CacheStore::in_memory(), network, &paths, |c| c.cache_miss = policy);
            f.worker.start().await;

            let response = respond(&f.worker, get("extra.css")).await;
            assert_eq!(response.is_some(), expect_response, "{:?}", policy);

            let key = CacheKey::get(&origin().join("extra.css").unwrap());
            assert_eq!(f.worker.store().match_active(&key).await.is_some(), expect_stored, "{:?}", policy);
        }
    }

    #[tokio::test]
    async fn test_push_registration_is_never_cached() {
        let f = fixture("v1");
        f.worker.start().await;
        f.network.respond("/push-register", Response::new(201, ""));
        let url = origin().join("push-register").unwrap();
        let body = br#"{"key":"k","authSecret":"s","endpoint":"https://push.example/1"}"#.to_vec();

        for _ in 0..2 {
            let event = LifecycleEvent::Fetch(Request::post_json(url.clone(), body.clone()));
            assert_eq!(respond(&f.worker, event).await.unwrap().status, 201);
        }
        assert_eq!(f.network.hits("/push-register"), 2);
        assert!(!f.worker.store().open("v1".into()).keys().await.iter().any(|k| k.as_str().contains("push-register")));

        f.network.fail("/push-register");
        let event = LifecycleEvent::Fetch(Request::post_json(url, body));
        assert_eq!(respond(&f.worker, event).await, Some(Response::network_error()));
    }

    #[tokio::test]
    async fn test_incomplete_push_subscription_is_still_forwarded() {
        let f = fixture("v1");
        f.worker.start().await;
        f.network.respond("/push-register", Response::new(400, "missing endpoint"));
        let url = origin().join("push-register").unwrap();

        let body = br#"{"key":"k","authSecret":"s"}"#.to_vec();
        let event = LifecycleEvent::Fetch(Request::post_json(url.clone(), body));
        assert_eq!(respond(&f.worker, event).await, Some(Response::new(400, "missing endpoint")));

        let event = LifecycleEvent::Fetch(Request::post_json(url, b"not json".to_vec()));
        assert_eq!(respond(&f.worker, event).await, Some(Response::new(400, "missing endpoint")));
        assert_eq!(f.network.hits("/push-register"), 2);
    }

    #[tokio::test]
    async fn test_update_waits_for_clients_to_close() {
        let paths = manifest_paths(3);
        let store = CacheStore::in_memory();
        let network = network_for(&paths);

        let old = fixture_with("v1", store.clone(), network.clone(), &paths, |_| {});
        old.worker.start().await;

        let new = fixture_with("v2", store.clone(), network, &paths, |c| {
            c.activation = ActivationPolicy::WhenClientsReleased
        });
        let (first, _rx1) = new.worker.connect_client().await;
        let (second, _rx2) = new.worker.connect_client().await;

        assert_eq!(new.worker.start().await, ActivationState::Idle);
        assert!(new.worker.status().await.waiting);
        assert_eq!(store.active().await, Some("v1".into()));

        new.worker.disconnect_client(first).await;
        assert_eq!(store.active().await, Some("v1".into()));

        new.worker.disconnect_client(second).await;
        assert_eq!(store.active().await, Some("v2".into()));
        assert_eq!(store.list_generations().await, vec![GenerationId::new("v2")]);
        assert!(!new.worker.status().await.waiting);
    }

    #[tokio::test]
    async fn test_restart_finishes_interrupted_cleanup() {
        let paths = manifest_paths(2);
        let store = CacheStore::in_memory();
        let network = network_for(&paths);
        let manifest = PrecacheManifest::new(paths.iter());
        for version in ["v1", "v2"] {
            store
                .open(version.into())
                .add_all(&manifest, &origin(), network.as_ref())
                .await
                .unwrap();
        }
        store.set_active(&"v2".into()).await.unwrap();

        let f = fixture_with("v2", store.clone(), network, &paths, |_| {});
        assert_eq!(f.worker.start().await, ActivationState::Active);
        assert_eq!(store.list_generations().await, vec![GenerationId::new("v2")]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_last_client_leaving_during_start_activates_update() {
        let paths = manifest_paths(3);
        for round in 0..20 {
            let store = CacheStore::in_memory();
            let network = network_for(&paths);

            let old = fixture_with("v1", store.clone(), network.clone(), &paths, |_| {});
            old.worker.start().await;

            let new = fixture_with("v2", store.clone(), network, &paths, |c| {
                c.activation = ActivationPolicy::WhenClientsReleased
            });
            let (client, _rx) = new.worker.connect_client().await;

            let leaving = {
                let worker = new.worker.clone();
                tokio::spawn(async move { worker.disconnect_client(client).await })
            };
            new.worker.start().await;
            assert!(leaving.await.unwrap());
            new.worker.settled().await;

            assert_eq!(store.active().await, Some("v2".into()), "round {}", round);
            assert_eq!(store.list_generations().await, vec![GenerationId::new("v2")]);
            assert!(!new.worker.status().await.waiting);
        }
    }

    #[tokio::test]
    async fn test_restart_resumes_active_generation() {
        let paths = manifest_paths(3);
        let store = CacheStore::in_memory();
        let network = network_for(&paths);

        let first = fixture_with("v1", store.clone(), network.clone(), &paths, |_| {});
        first.worker.start().await;
        let hits = network.hits("/index.html");

        let restarted = fixture_with("v1", store, network.clone(), &paths, |_| {});
        assert_eq!(restarted.worker.start().await, ActivationState::Active);
        assert_eq!(network.hits("/index.html"), hits);
    }

    #[tokio::test]
    async fn test_failed_install_is_not_activated() {
        let paths = manifest_paths(3);
        let network = network_for(&paths);
        network.fail("/index.html");
        let f = fixture_with("v1", CacheStore::in_memory(), network, &paths, |_| {});

        assert_eq!(f.worker.start().await, ActivationState::Idle);
        let status = f.worker.status().await;
        assert_eq!(status.install, InstallState::Failed);
        assert_eq!(status.active, None);
        assert!(status.generations.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_holds_keep_alive_until_settled() {
        let f = fixture("v1");
        let task = f.worker.dispatch(LifecycleEvent::Install);
        assert_eq!(task.kind, EventKind::Install);
        assert!(f.worker.inner.keep_alive.pending() >= 1);

        f.worker.settled().await;
        assert_eq!(f.worker.inner.keep_alive.pending(), 0);
        assert_eq!(task.outcome().await, EventOutcome::Installed(InstallState::Installed));
    }
}
