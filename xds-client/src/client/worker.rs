//! ADS worker that manages the xDS stream.
//!
//! The worker runs as a background task, managing:
//! - The ADS stream lifecycle (connection, reconnection)
//! - Resource subscriptions and version/nonce tracking
//! - Dispatching resources to watchers
//! - ACK/NACK protocol
//! - Resource expiry timers

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::client::config::{ClientConfig, ServerConfig};
use crate::client::retry::Backoff;
use crate::client::watch::ResourceEvent;
use crate::codec::XdsCodec;
use crate::error::{Error, Result};
use crate::message::{DiscoveryRequest, DiscoveryResponse, ErrorDetail, Node};
use crate::resource::{DecodeResult, DecodedResource, DecoderFn, type_url_suffix, type_urls_equivalent};
use crate::runtime::Runtime;
use crate::transport::{Transport, TransportBuilder, TransportStream};

/// gRPC status code carried in NACKs.
const INVALID_ARGUMENT: i32 = 3;

/// Global counter for generating unique watcher IDs.
static NEXT_WATCHER_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatcherId(u64);

impl WatcherId {
    /// Create a new unique watcher ID.
    pub fn new() -> Self {
        Self(NEXT_WATCHER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for WatcherId {
    fn default() -> Self {
        Self::new()
    }
}

type EventSender = mpsc::Sender<ResourceEvent<DecodedResource>>;

/// Commands sent from `XdsClient` to the worker.
pub(crate) enum WorkerCommand {
    /// Subscribe to a resource.
    Watch {
        /// The type URL of the resource.
        type_url: &'static str,
        /// The resource name.
        name: String,
        /// Unique identifier for this watcher.
        watcher_id: WatcherId,
        /// Channel to send resource events to the watcher.
        event_tx: EventSender,
        /// Decoder function for this resource type.
        decoder: DecoderFn,
        /// Whether all resources must be present in SotW responses.
        all_resources_required_in_sotw: bool,
    },
    /// Unsubscribe a watcher.
    Unwatch {
        /// The watcher to remove.
        watcher_id: WatcherId,
    },
    /// Timer expired for a resource that was never received.
    ResourceTimerExpired {
        /// The type URL suffix of the resource.
        type_key: String,
        /// The resource name.
        name: String,
    },
}

/// State of a cached resource.
#[derive(Debug, Clone)]
enum CachedResource {
    /// Resource has been requested but not yet received.
    Requested,
    /// Resource has been successfully received and validated.
    Received(Arc<DecodedResource>),
    /// Resource does not exist; any earlier value was evicted.
    DoesNotExist,
}

impl CachedResource {
    /// The event a newly registered watcher should see, if any.
    fn to_event(&self) -> Option<ResourceEvent<DecodedResource>> {
        match self {
            Self::Requested => None,
            Self::Received(resource) => Some(ResourceEvent::ResourceChanged(resource.clone())),
            Self::DoesNotExist => Some(ResourceEvent::ResourceDoesNotExist),
        }
    }
}

/// Per-watcher state.
#[derive(Debug)]
struct WatcherEntry {
    event_tx: EventSender,
    name: String,
}

/// Per-type state, keyed by type URL suffix so that v2 and v3 URLs share it.
///
/// Versions survive stream restarts; nonces do not.
struct TypeState {
    /// The type URL used in requests.
    type_url: &'static str,
    decoder: DecoderFn,
    /// Version from the last ACKed response.
    version_info: String,
    /// Nonce from the last response on the current stream.
    nonce: String,
    watchers: HashMap<WatcherId, WatcherEntry>,
    /// Names currently subscribed. Kept sorted so requests are deterministic.
    subscription: BTreeSet<String>,
    cache: HashMap<String, CachedResource>,
    all_resources_required_in_sotw: bool,
}

impl std::fmt::Debug for TypeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeState")
            .field("type_url", &self.type_url)
            .field("version_info", &self.version_info)
            .field("nonce", &self.nonce)
            .field("watchers", &self.watchers)
            .field("subscription", &self.subscription)
            .field("cache", &format!("<{} entries>", self.cache.len()))
            .finish_non_exhaustive()
    }
}

impl TypeState {
    fn new(type_url: &'static str, decoder: DecoderFn, all_resources_required_in_sotw: bool) -> Self {
        Self {
            type_url,
            decoder,
            version_info: String::new(),
            nonce: String::new(),
            watchers: HashMap::new(),
            subscription: BTreeSet::new(),
            cache: HashMap::new(),
            all_resources_required_in_sotw,
        }
    }

    /// Recalculate the subscribed names from the watchers. Returns true if
    /// the set changed.
    fn recalculate_subscription(&mut self) -> bool {
        let names: BTreeSet<String> = self.watchers.values().map(|w| w.name.clone()).collect();
        let changed = names != self.subscription;
        self.subscription = names;
        changed
    }

    fn resource_names(&self) -> Vec<String> {
        self.subscription.iter().cloned().collect()
    }

    /// Get senders for all watchers of a specific resource.
    fn matching_watchers(&self, name: &str) -> Vec<EventSender> {
        self.watchers
            .values()
            .filter(|w| w.name == name)
            .map(|w| w.event_tx.clone())
            .collect()
    }
}

/// The ADS worker manages the xDS stream and dispatches resources to watchers.
pub(crate) struct AdsWorker<TB, C, R> {
    transport_builder: TB,
    codec: C,
    runtime: R,
    node: Node,
    backoff: Backoff,
    /// Priority-ordered list of xDS servers. Only the first is used.
    servers: Vec<ServerConfig>,
    /// Timeout for the initial resource response. None = disabled.
    resource_initial_timeout: Option<Duration>,
    /// Sender used by timer tasks. Weak so that it does not keep the worker
    /// alive once every client handle and watcher is gone.
    command_tx: mpsc::WeakUnboundedSender<WorkerCommand>,
    command_rx: mpsc::UnboundedReceiver<WorkerCommand>,
    /// Per-type state, keyed by type URL suffix.
    type_states: HashMap<String, TypeState>,
    /// Cancellation handles for resource timers, keyed by (type suffix, name).
    /// Dropping the sender cancels the timer.
    resource_timers: HashMap<(String, String), oneshot::Sender<()>>,
    /// Whether a stream is currently established.
    connected: bool,
    /// Incremented for each new stream, for logging.
    stream_id: u64,
}

impl<TB, C, R> AdsWorker<TB, C, R>
where
    TB: TransportBuilder,
    C: XdsCodec,
    R: Runtime,
{
    /// Create a new worker.
    pub(crate) fn new(
        transport_builder: TB,
        codec: C,
        runtime: R,
        config: ClientConfig,
        command_tx: mpsc::WeakUnboundedSender<WorkerCommand>,
        command_rx: mpsc::UnboundedReceiver<WorkerCommand>,
    ) -> Self {
        Self {
            transport_builder,
            codec,
            runtime,
            node: config.node,
            backoff: Backoff::new(config.retry_policy),
            servers: config.servers,
            resource_initial_timeout: config.resource_initial_timeout,
            command_tx,
            command_rx,
            type_states: HashMap::new(),
            resource_timers: HashMap::new(),
            connected: false,
            stream_id: 0,
        }
    }

    /// Run the worker event loop.
    ///
    /// This method runs until all `XdsClient` handles and watchers are
    /// dropped (which closes the command channel).
    pub(crate) async fn run(mut self) {
        let Some(server) = self.servers.first().cloned() else {
            warn!("xDS client has no server configured");
            return;
        };

        loop {
            // Wait for at least one subscription before connecting. Some
            // servers do not send response headers before the first request,
            // so there must be something to send.
            while !self.has_subscriptions() {
                match self.command_rx.recv().await {
                    Some(cmd) => {
                        let _ = self
                            .handle_command::<<TB::Transport as Transport>::Stream>(None, cmd)
                            .await;
                    }
                    None => return,
                }
            }

            let result = self.connect_and_run(&server).await;
            self.connected = false;
            // Expiry timers only run while a request is outstanding on a
            // live stream.
            self.resource_timers.clear();

            match result {
                Ok(()) => return,
                Err(error) => {
                    warn!(server = server.uri(), %error, "xDS stream failed");
                    self.notify_ambient_error(error).await;
                    let Some(delay) = self.backoff.next_backoff() else {
                        warn!(server = server.uri(), "xDS retry attempts exhausted");
                        return;
                    };
                    if !delay.is_zero() && !self.wait_backoff(delay).await {
                        return;
                    }
                }
            }
        }
    }

    /// Connect to the server and run until the stream fails.
    ///
    /// Returns `Ok(())` if the worker should shut down.
    async fn connect_and_run(&mut self, server: &ServerConfig) -> Result<()> {
        // Nonces are tied to the stream
        for type_state in self.type_states.values_mut() {
            type_state.nonce.clear();
        }

        let transport = self.transport_builder.build(server).await?;
        let stream = transport.new_stream(self.build_initial_requests()).await?;

        self.stream_id += 1;
        self.connected = true;
        debug!(stream_id = self.stream_id, server = server.uri(), "ADS stream established");
        self.start_pending_timers();

        self.run_connected(stream).await
    }

    /// Sleep for `delay` while still serving commands.
    ///
    /// Returns false if the worker should shut down.
    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        let runtime = self.runtime.clone();
        let sleep = runtime.sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                cmd = self.command_rx.recv() => match cmd {
                    Some(cmd) => {
                        let _ = self
                            .handle_command::<<TB::Transport as Transport>::Stream>(None, cmd)
                            .await;
                    }
                    None => return false,
                },
            }
        }
    }

    fn has_subscriptions(&self) -> bool {
        self.type_states.values().any(|s| !s.subscription.is_empty())
    }

    /// Build initial DiscoveryRequests for all active subscriptions.
    ///
    /// Each carries the last ACKed version for its type and an empty nonce.
    fn build_initial_requests(&self) -> Vec<Bytes> {
        let mut requests = Vec::new();

        for type_state in self.type_states.values() {
            if type_state.subscription.is_empty() {
                continue;
            }

            let resource_names = type_state.resource_names();
            let request = DiscoveryRequest {
                node: &self.node,
                type_url: type_state.type_url,
                resource_names: &resource_names,
                version_info: &type_state.version_info,
                response_nonce: "",
                error_detail: None,
            };

            match self.codec.encode_request(&request) {
                Ok(bytes) => requests.push(bytes),
                Err(error) => warn!(type_url = type_state.type_url, %error, "failed to encode request"),
            }
        }

        requests
    }

    /// Run the main event loop while connected.
    ///
    /// Returns `Ok(())` if the worker should shut down (command channel closed).
    /// Returns `Err` if an error occurred and the worker should reconnect.
    async fn run_connected<S: TransportStream>(&mut self, mut stream: S) -> Result<()> {
        let mut received_response = false;
        loop {
            tokio::select! {
                result = stream.recv() => {
                    match result {
                        Ok(Some(bytes)) => {
                            if self.handle_response(&mut stream, bytes).await? && !received_response {
                                // The stream is only healthy once the server
                                // has answered something we understand.
                                received_response = true;
                                self.backoff.reset();
                            }
                        }
                        // Stream closed by server; return Err to trigger reconnection
                        Ok(None) => return Err(Error::StreamClosed),
                        Err(e) => return Err(e),
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            self.handle_command(Some(&mut stream), cmd).await?;
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Handle a command, optionally sending network requests if connected.
    ///
    /// When `stream` is `None`, only state updates are performed (disconnected mode).
    /// When `stream` is `Some`, subscription changes trigger network requests.
    async fn handle_command<S: TransportStream>(
        &mut self,
        stream: Option<&mut S>,
        cmd: WorkerCommand,
    ) -> Result<()> {
        match cmd {
            WorkerCommand::Watch {
                type_url,
                name,
                watcher_id,
                event_tx,
                decoder,
                all_resources_required_in_sotw,
            } => {
                let type_key = type_url_suffix(type_url).to_owned();
                if self.add_watcher(
                    type_url,
                    &type_key,
                    name,
                    watcher_id,
                    event_tx,
                    decoder,
                    all_resources_required_in_sotw,
                ) {
                    if let Some(stream) = stream {
                        self.send_request(stream, &type_key).await?;
                    }
                }
            }
            WorkerCommand::Unwatch { watcher_id } => {
                if let Some((type_key, true)) = self.remove_watcher(watcher_id) {
                    if let Some(stream) = stream {
                        self.send_request(stream, &type_key).await?;
                    }
                }
            }
            WorkerCommand::ResourceTimerExpired { type_key, name } => {
                self.handle_resource_timeout(&type_key, &name).await;
            }
        }
        Ok(())
    }

    /// Add a watcher to the state.
    ///
    /// If the resource is already cached, the watcher receives the cached state immediately.
    /// Returns true if subscriptions changed (need to send new request to server).
    #[allow(clippy::too_many_arguments)]
    fn add_watcher(
        &mut self,
        type_url: &'static str,
        type_key: &str,
        name: String,
        watcher_id: WatcherId,
        event_tx: EventSender,
        decoder: DecoderFn,
        all_resources_required_in_sotw: bool,
    ) -> bool {
        let type_state = self
            .type_states
            .entry(type_key.to_owned())
            .or_insert_with(|| TypeState::new(type_url, decoder, all_resources_required_in_sotw));

        let cached = type_state
            .cache
            .entry(name.clone())
            .or_insert(CachedResource::Requested);
        if let Some(event) = cached.to_event() {
            // The channel is fresh, so this cannot be full.
            let _ = event_tx.try_send(event);
        }
        let pending = matches!(cached, CachedResource::Requested);

        type_state.watchers.insert(
            watcher_id,
            WatcherEntry {
                event_tx,
                name: name.clone(),
            },
        );
        let subscriptions_changed = type_state.recalculate_subscription();

        if pending && self.connected {
            self.start_resource_timer(type_key, name);
        }

        subscriptions_changed
    }

    /// Remove a watcher from the state.
    ///
    /// The type's version and cached resources are kept, so that a later
    /// watch is answered from the cache and the next request still carries
    /// the last ACKed version.
    ///
    /// Returns the type key and whether subscriptions changed.
    fn remove_watcher(&mut self, watcher_id: WatcherId) -> Option<(String, bool)> {
        let (type_key, type_state) = self
            .type_states
            .iter_mut()
            .find(|(_, state)| state.watchers.contains_key(&watcher_id))?;

        let entry = type_state.watchers.remove(&watcher_id)?;
        let subscriptions_changed = type_state.recalculate_subscription();

        if !type_state.subscription.contains(&entry.name) {
            self.resource_timers
                .remove(&(type_key.clone(), entry.name.clone()));
            // Nothing references a resource that never arrived.
            if matches!(
                type_state.cache.get(&entry.name),
                Some(CachedResource::Requested)
            ) {
                type_state.cache.remove(&entry.name);
            }
        }

        Some((type_key.clone(), subscriptions_changed))
    }

    /// Send a DiscoveryRequest for a type with its current subscription.
    async fn send_request<S: TransportStream>(&self, stream: &mut S, type_key: &str) -> Result<()> {
        let Some(type_state) = self.type_states.get(type_key) else {
            return Ok(());
        };

        let resource_names = type_state.resource_names();
        let request = DiscoveryRequest {
            node: &self.node,
            type_url: type_state.type_url,
            resource_names: &resource_names,
            version_info: &type_state.version_info,
            response_nonce: &type_state.nonce,
            error_detail: None,
        };

        let bytes = self.codec.encode_request(&request)?;
        stream.send(bytes).await
    }

    /// Handle a response from the server.
    ///
    /// A response is applied all-or-nothing: if any resource fails to decode
    /// or validate, the whole response is NACKed, the previous version is
    /// kept, and watchers are not notified.
    ///
    /// Returns true if the response was for a subscribed type and was
    /// answered with an ACK or NACK.
    async fn handle_response<S: TransportStream>(
        &mut self,
        stream: &mut S,
        bytes: Bytes,
    ) -> Result<bool> {
        let response = match self.codec.decode_response(bytes) {
            Ok(response) => response,
            Err(error) => {
                warn!(%error, "dropping undecodable discovery response");
                return Ok(false);
            }
        };
        let type_key = type_url_suffix(&response.type_url).to_owned();

        let Some(type_state) = self.type_states.get_mut(&type_key) else {
            debug!(type_url = %response.type_url, "ignoring response for unsupported type");
            return Ok(false);
        };
        type_state.nonce = response.nonce.clone();

        let mut valid_resources: Vec<(String, DecodedResource)> = Vec::new();
        let mut errors: Vec<String> = Vec::new();

        for resource_any in &response.resources {
            if !type_urls_equivalent(&resource_any.type_url, &response.type_url) {
                errors.push(format!(
                    "resource type {} does not match response type {}",
                    resource_any.type_url, response.type_url
                ));
                continue;
            }
            match (type_state.decoder)(resource_any.value.clone()) {
                DecodeResult::Success { name, resource } => valid_resources.push((name, resource)),
                DecodeResult::ResourceError { name, error } => errors.push(format!("{name}: {error}")),
                DecodeResult::TopLevelError(error) => errors.push(error.to_string()),
            }
        }

        if !errors.is_empty() {
            let message = errors.join("; ");
            warn!(
                type_url = %response.type_url,
                version = %response.version_info,
                error = %message,
                "NACKing discovery response"
            );
            self.send_nack(stream, &type_key, &response, message).await?;
            return Ok(true);
        }

        type_state.version_info = response.version_info.clone();
        trace!(
            type_url = %response.type_url,
            version = %response.version_info,
            count = valid_resources.len(),
            "accepted discovery response"
        );

        let received_names: HashSet<String> =
            valid_resources.iter().map(|(name, _)| name.clone()).collect();
        self.dispatch_resources(&type_key, valid_resources).await;
        self.detect_deleted_resources(&type_key, &received_names)
            .await;

        self.send_ack(stream, &type_key, &response).await?;
        Ok(true)
    }

    /// Update the cache and deliver each resource to its watchers.
    async fn dispatch_resources(&mut self, type_key: &str, resources: Vec<(String, DecodedResource)>) {
        let Some(type_state) = self.type_states.get_mut(type_key) else {
            return;
        };

        let mut deliveries = Vec::new();
        for (name, resource) in resources {
            let resource = Arc::new(resource);
            type_state
                .cache
                .insert(name.clone(), CachedResource::Received(resource.clone()));
            self.resource_timers
                .remove(&(type_key.to_owned(), name.clone()));
            for event_tx in type_state.matching_watchers(&name) {
                deliveries.push((event_tx, resource.clone()));
            }
        }

        for (event_tx, resource) in deliveries {
            // Ignore send errors (watcher dropped).
            let _ = event_tx.send(ResourceEvent::ResourceChanged(resource)).await;
        }
    }

    /// Detect resources that were deleted (subscribed and previously
    /// received, but missing from this response).
    ///
    /// Only applies to types whose state-of-the-world responses always carry
    /// every subscribed resource.
    async fn detect_deleted_resources(&mut self, type_key: &str, received_names: &HashSet<String>) {
        let Some(type_state) = self.type_states.get_mut(type_key) else {
            return;
        };
        if !type_state.all_resources_required_in_sotw {
            return;
        }

        let deleted_names: Vec<String> = type_state
            .subscription
            .iter()
            .filter(|name| {
                matches!(type_state.cache.get(*name), Some(CachedResource::Received(_)))
                    && !received_names.contains(*name)
            })
            .cloned()
            .collect();

        let mut deliveries = Vec::new();
        for name in deleted_names {
            debug!(type_key, name = %name, "resource removed by server");
            type_state.cache.insert(name.clone(), CachedResource::DoesNotExist);
            deliveries.extend(type_state.matching_watchers(&name));
        }

        for event_tx in deliveries {
            let _ = event_tx.send(ResourceEvent::ResourceDoesNotExist).await;
        }
    }

    /// Tell every watcher that contact with the server was lost.
    async fn notify_ambient_error(&mut self, error: Error) {
        let senders: Vec<EventSender> = self
            .type_states
            .values()
            .flat_map(|s| s.watchers.values().map(|w| w.event_tx.clone()))
            .collect();
        for event_tx in senders {
            let _ = event_tx.send(ResourceEvent::AmbientError(error.clone())).await;
        }
    }

    /// Send an ACK for a response.
    async fn send_ack<S: TransportStream>(
        &self,
        stream: &mut S,
        type_key: &str,
        response: &DiscoveryResponse,
    ) -> Result<()> {
        let Some(type_state) = self.type_states.get(type_key) else {
            return Ok(());
        };

        let resource_names = type_state.resource_names();
        let request = DiscoveryRequest {
            node: &self.node,
            type_url: &response.type_url,
            resource_names: &resource_names,
            version_info: &response.version_info,
            response_nonce: &response.nonce,
            error_detail: None,
        };

        let bytes = self.codec.encode_request(&request)?;
        stream.send(bytes).await
    }

    /// Send a NACK for a response.
    async fn send_nack<S: TransportStream>(
        &self,
        stream: &mut S,
        type_key: &str,
        response: &DiscoveryResponse,
        error_message: String,
    ) -> Result<()> {
        let Some(type_state) = self.type_states.get(type_key) else {
            return Ok(());
        };

        let resource_names = type_state.resource_names();
        let request = DiscoveryRequest {
            node: &self.node,
            type_url: &response.type_url,
            resource_names: &resource_names,
            version_info: &type_state.version_info, // Keep old version for NACK
            response_nonce: &response.nonce,
            error_detail: Some(ErrorDetail {
                code: INVALID_ARGUMENT,
                message: error_message,
            }),
        };

        let bytes = self.codec.encode_request(&request)?;
        stream.send(bytes).await
    }

    /// Start timers for every subscribed resource still waiting for its
    /// first response. Called when a stream is established.
    fn start_pending_timers(&mut self) {
        let pending: Vec<(String, String)> = self
            .type_states
            .iter()
            .flat_map(|(type_key, state)| {
                state
                    .subscription
                    .iter()
                    .filter(|name| matches!(state.cache.get(*name), Some(CachedResource::Requested)))
                    .map(move |name| (type_key.clone(), name.clone()))
            })
            .collect();
        for (type_key, name) in pending {
            self.start_resource_timer(&type_key, name);
        }
    }

    /// Start a timer for a resource in Requested state.
    ///
    /// If a timer is already running for this resource, this is a no-op so
    /// that the original deadline is preserved.
    fn start_resource_timer(&mut self, type_key: &str, name: String) {
        let Some(timeout) = self.resource_initial_timeout else {
            return;
        };
        let key = (type_key.to_owned(), name.clone());
        if self.resource_timers.contains_key(&key) {
            return;
        }

        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let type_key = type_key.to_owned();
        let command_tx = self.command_tx.clone();
        let runtime = self.runtime.clone();

        self.runtime.spawn(async move {
            tokio::select! {
                _ = runtime.sleep(timeout) => {
                    if let Some(command_tx) = command_tx.upgrade() {
                        let _ = command_tx.send(WorkerCommand::ResourceTimerExpired {
                            type_key,
                            name,
                        });
                    }
                }
                _ = cancel_rx => {}
            }
        });

        self.resource_timers.insert(key, cancel_tx);
    }

    /// Handle a resource timer expiration.
    ///
    /// If the resource is still in Requested state, marks it as DoesNotExist
    /// and notifies all watchers interested in this resource.
    async fn handle_resource_timeout(&mut self, type_key: &str, name: &str) {
        if self
            .resource_timers
            .remove(&(type_key.to_owned(), name.to_owned()))
            .is_none()
        {
            // Cancelled after the timer fired.
            return;
        }

        let Some(type_state) = self.type_states.get_mut(type_key) else {
            return;
        };
        if !matches!(type_state.cache.get(name), Some(CachedResource::Requested)) {
            return;
        }

        debug!(type_key, name, "resource not received before timeout");
        type_state
            .cache
            .insert(name.to_owned(), CachedResource::DoesNotExist);

        for event_tx in type_state.matching_watchers(name) {
            let _ = event_tx.send(ResourceEvent::ResourceDoesNotExist).await;
        }
    }
}
