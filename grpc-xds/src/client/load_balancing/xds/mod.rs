/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! The `xds_experimental` LB policy.
//!
//! The policy watches the Cluster named in its config, or the service named by
//! the channel's target when the config names none (and the children of
//! aggregate clusters), then the ClusterLoadAssignment of every leaf cluster,
//! and feeds the merged endpoints to an [`EdsBalancer`]. When the management
//! server is unusable it falls back to a plain policy over the addresses the
//! resolver produced:
//!
//! - no valid xDS response arrived within the fallback timeout of the first
//!   config,
//! - contact with the server was lost and no subchannel is Ready,
//! - contact was lost for longer than the endpoints' stale timeout.
//!
//! Any valid response ends fallback.
//!
//! Watches run as background tasks that push their events onto a queue and
//! ask the channel for a call into [`LbPolicy::work`]; only the channel's
//! serialized calls touch the policy's state.

use std::collections::{HashMap, HashSet, VecDeque};
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xds_client::{
    ClientConfig, ProstCodec, Resource, ResourceEvent, ServerConfig, TonicTransportBuilder,
    XdsClient,
};

use crate::client::ConnectivityState;
use crate::client::load_balancing::eds::{EdsBalancer, EdsBalancerOptions, LoadReporter};
use crate::client::load_balancing::round_robin::RoundRobinBuilder;
use crate::client::load_balancing::{
    ChannelController, GLOBAL_LB_REGISTRY, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState,
    Subchannel, SubchannelState, WeakSubchannel, WorkScheduler, WrappedController,
};
use crate::client::name_resolution::ResolverUpdate;
use crate::client::service_config::{LbConfig, LbPolicyConfig, ParsedJsonLbConfig, parse_policy_list};
use crate::error::XdsError;
use crate::rt::{Runtime, XdsClientRuntime};
use crate::xds::bootstrap::Bootstrap;
use crate::xds::resource::{ClusterKind, ClusterUpdate, EndpointsUpdate};

mod cluster_tree;

use cluster_tree::{ClusterTree, merge_endpoints};

pub static POLICY_NAME: &str = "xds_experimental";
static START: Once = Once::new();

/// How long to wait for the first xDS response before falling back.
pub const DEFAULT_FALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Creates the xDS client for a balancer name. The client's worker runs on
/// `runtime`.
pub trait XdsClientProvider: Send + Sync {
    fn new_client(
        &self,
        balancer_name: &str,
        runtime: Arc<dyn Runtime>,
    ) -> Result<XdsClient, XdsError>;
}

/// Connects to the balancer name over tonic, identifying as the node from the
/// bootstrap config when one is set. A balancer listed in the bootstrap uses
/// that entry's credentials and server features.
#[derive(Debug, Default)]
pub struct BootstrapClientProvider {}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(300);
const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(20);

impl XdsClientProvider for BootstrapClientProvider {
    fn new_client(
        &self,
        balancer_name: &str,
        runtime: Arc<dyn Runtime>,
    ) -> Result<XdsClient, XdsError> {
        let bootstrap = Bootstrap::from_env()?;
        let config = match &bootstrap {
            Some(bootstrap) => {
                let mut config = bootstrap.client_config();
                let listed = bootstrap
                    .xds_servers
                    .iter()
                    .position(|s| s.server_uri == balancer_name);
                match listed {
                    Some(index) => config.servers = vec![config.servers.swap_remove(index)],
                    None => config.servers = vec![ServerConfig::new(balancer_uri(balancer_name))],
                }
                config
            }
            None => ClientConfig::new(Bootstrap::default_node(), balancer_uri(balancer_name)),
        };
        let transport = TonicTransportBuilder::new()
            .with_connect_timeout(CONNECT_TIMEOUT)
            .with_keep_alive(KEEP_ALIVE_INTERVAL, KEEP_ALIVE_TIMEOUT)
            .with_user_agent(format!(
                "{} {}",
                config.node.user_agent_name, config.node.user_agent_version
            ));
        let runtime = XdsClientRuntime::new(runtime);
        Ok(XdsClient::builder(config, transport, ProstCodec, runtime).build())
    }
}

fn balancer_uri(balancer_name: &str) -> String {
    if balancer_name.contains("://") {
        balancer_name.to_string()
    } else {
        format!("http://{balancer_name}")
    }
}

#[derive(Clone)]
pub struct XdsBalancerOptions {
    pub fallback_timeout: Duration,
    pub eds: EdsBalancerOptions,
    /// Receives drop reports for clusters that enable load reporting.
    pub load_reporter: Option<Arc<dyn LoadReporter>>,
}

impl Default for XdsBalancerOptions {
    fn default() -> Self {
        Self {
            fallback_timeout: DEFAULT_FALLBACK_TIMEOUT,
            eds: EdsBalancerOptions::default(),
            load_reporter: None,
        }
    }
}

impl fmt::Debug for XdsBalancerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XdsBalancerOptions")
            .field("fallback_timeout", &self.fallback_timeout)
            .field("eds", &self.eds)
            .field("load_reporter", &self.load_reporter.is_some())
            .finish()
    }
}

/// The parsed `xds_experimental` config.
#[derive(Debug, Clone, PartialEq)]
pub struct XdsConfig {
    pub balancer_name: String,
    /// The root cluster. `None` means the service name the resolver reports.
    pub cluster: Option<String>,
    /// The locality policy; round-robin when `None`.
    pub child_policy: Option<LbPolicyConfig>,
    /// The fallback policy; round-robin when `None`.
    pub fallback_policy: Option<LbPolicyConfig>,
}

#[derive(Deserialize)]
struct JsonConfig {
    #[serde(rename = "BalancerName", default)]
    balancer_name: String,
    #[serde(rename = "Cluster", default)]
    cluster: String,
    #[serde(rename = "ChildPolicy", default)]
    child_policy: Vec<HashMap<String, serde_json::Value>>,
    #[serde(rename = "FallbackPolicy", default)]
    fallback_policy: Vec<HashMap<String, serde_json::Value>>,
}

pub struct XdsBalancerBuilder {
    options: XdsBalancerOptions,
    client_provider: Arc<dyn XdsClientProvider>,
}

impl XdsBalancerBuilder {
    pub fn new(options: XdsBalancerOptions, client_provider: Arc<dyn XdsClientProvider>) -> Self {
        Self {
            options,
            client_provider,
        }
    }
}

impl LbPolicyBuilder for XdsBalancerBuilder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(XdsBalancer::new(
            self.options.clone(),
            self.client_provider.clone(),
            options.work_scheduler,
            options.runtime,
        ))
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        let json: JsonConfig = config
            .convert_to()
            .map_err(|e| XdsError::InvalidConfig(format!("xds_experimental: {e}")))?;
        if json.balancer_name.is_empty() {
            return Err(XdsError::InvalidConfig("xds_experimental: BalancerName is required".into()).into());
        }
        let first_registered = |list: Vec<HashMap<String, serde_json::Value>>| -> Result<Option<LbPolicyConfig>, XdsError> {
            let list = parse_policy_list(list).map_err(XdsError::InvalidConfig)?;
            Ok(GLOBAL_LB_REGISTRY
                .first_registered(&list)
                .map(|(_, config)| config.clone()))
        };
        Ok(Some(LbConfig::new(XdsConfig {
            balancer_name: json.balancer_name,
            cluster: Some(json.cluster).filter(|c| !c.is_empty()),
            child_policy: first_registered(json.child_policy)?,
            fallback_policy: first_registered(json.fallback_policy)?,
        })))
    }
}

/// Registers `xds_experimental` with the global registry, creating xDS clients
/// from the bootstrap config.
pub fn reg() {
    START.call_once(|| {
        GLOBAL_LB_REGISTRY.add_builder(XdsBalancerBuilder::new(
            XdsBalancerOptions::default(),
            Arc::new(BootstrapClientProvider::default()),
        ));
    });
}

// Resolves a policy config to its builder, defaulting to round-robin.
fn policy_builder(config: Option<&LbPolicyConfig>) -> (Arc<dyn LbPolicyBuilder>, Option<LbConfig>) {
    let round_robin = || -> Arc<dyn LbPolicyBuilder> { Arc::new(RoundRobinBuilder {}) };
    let Some(config) = config else {
        return (round_robin(), None);
    };
    let Some(builder) = GLOBAL_LB_REGISTRY.get_policy(&config.name) else {
        warn!(policy = %config.name, "policy is not registered, using round_robin");
        return (round_robin(), None);
    };
    match builder.parse_config(&config.config) {
        Ok(parsed) => (builder, parsed),
        Err(error) => {
            warn!(policy = %config.name, %error, "invalid policy config, using round_robin");
            (round_robin(), None)
        }
    }
}

#[derive(Debug)]
enum Event {
    Cluster {
        client: u64,
        name: String,
        event: ResourceEvent<ClusterUpdate>,
    },
    Endpoints {
        client: u64,
        name: String,
        event: ResourceEvent<EndpointsUpdate>,
    },
    Timer(TimerKind, u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Startup,
    StaleEndpoints,
}

struct EventQueue {
    events: Mutex<VecDeque<Event>>,
    work_scheduler: Arc<dyn WorkScheduler>,
}

impl EventQueue {
    fn push(&self, event: Event) {
        self.events.lock().unwrap().push_back(event);
        self.work_scheduler.schedule_work();
    }

    fn drain(&self) -> VecDeque<Event> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

struct ClientHandle {
    balancer_name: String,
    client: XdsClient,
    generation: u64,
    cancel: CancellationToken,
    cluster_watches: HashMap<String, CancellationToken>,
    endpoint_watches: HashMap<String, CancellationToken>,
}

impl ClientHandle {
    fn close(self) {
        self.cancel.cancel();
    }
}

struct Timer {
    id: u64,
    cancel: CancellationToken,
}

struct Fallback {
    policy: Box<dyn LbPolicy>,
    config: Option<LbPolicyConfig>,
}

pub struct XdsBalancer {
    options: XdsBalancerOptions,
    client_provider: Arc<dyn XdsClientProvider>,
    work_scheduler: Arc<dyn WorkScheduler>,
    runtime: Arc<dyn Runtime>,
    queue: Arc<EventQueue>,
    // Every task and timer hangs off this token.
    cancel: CancellationToken,

    config: Option<XdsConfig>,
    resolved: Option<ResolverUpdate>,

    client: Option<ClientHandle>,
    // The client being replaced, kept until the new one has responded.
    previous_client: Option<ClientHandle>,
    next_generation: u64,

    tree: Option<ClusterTree>,
    endpoints: HashMap<String, Arc<EndpointsUpdate>>,
    stale_after: Option<Duration>,

    eds: Option<EdsBalancer>,
    eds_state: Option<LbState>,

    fallback: Option<Fallback>,
    fallback_subchannels: HashSet<WeakSubchannel>,
    in_fallback: bool,

    lost_contact: bool,
    startup_timer: Option<Timer>,
    stale_timer: Option<Timer>,
    next_timer_id: u64,
}

impl XdsBalancer {
    fn new(
        options: XdsBalancerOptions,
        client_provider: Arc<dyn XdsClientProvider>,
        work_scheduler: Arc<dyn WorkScheduler>,
        runtime: Arc<dyn Runtime>,
    ) -> Self {
        Self {
            options,
            client_provider,
            runtime,
            queue: Arc::new(EventQueue {
                events: Mutex::default(),
                work_scheduler: work_scheduler.clone(),
            }),
            work_scheduler,
            cancel: CancellationToken::new(),
            config: None,
            resolved: None,
            client: None,
            previous_client: None,
            next_generation: 0,
            tree: None,
            endpoints: HashMap::new(),
            stale_after: None,
            eds: None,
            eds_state: None,
            fallback: None,
            fallback_subchannels: HashSet::new(),
            in_fallback: false,
            lost_contact: false,
            startup_timer: None,
            stale_timer: None,
            next_timer_id: 0,
        }
    }

    fn switch_client(&mut self, balancer_name: &str) -> Result<(), XdsError> {
        let client = self
            .client_provider
            .new_client(balancer_name, self.runtime.clone())?;
        let generation = self.next_generation;
        self.next_generation += 1;
        let handle = ClientHandle {
            balancer_name: balancer_name.to_string(),
            client,
            generation,
            cancel: self.cancel.child_token(),
            cluster_watches: HashMap::new(),
            endpoint_watches: HashMap::new(),
        };
        if let Some(old) = self.client.replace(handle) {
            info!(from = %old.balancer_name, to = balancer_name, "xds: switching balancer");
            // A client that never got replaced in time is dropped now.
            if let Some(older) = self.previous_client.replace(old) {
                older.close();
            }
        }
        Ok(())
    }

    // Starts and stops watches to match the cluster tree.
    fn sync_watches(&mut self) {
        let (Some(handle), Some(tree)) = (self.client.as_mut(), self.tree.as_ref()) else {
            return;
        };
        let clusters: HashSet<String> = tree.reachable().into_iter().collect();
        let services: HashSet<String> = tree
            .known_leaves()
            .iter()
            .filter(|c| c.kind == ClusterKind::Eds)
            .map(|c| c.service_name.clone())
            .collect();

        handle.cluster_watches.retain(|name, token| {
            let keep = clusters.contains(name);
            if !keep {
                token.cancel();
            }
            keep
        });
        for name in clusters {
            if !handle.cluster_watches.contains_key(&name) {
                let token = spawn_watch::<ClusterUpdate>(
                    handle,
                    &name,
                    &self.queue,
                    &*self.runtime,
                    |client, name, event| Event::Cluster {
                        client,
                        name,
                        event,
                    },
                );
                handle.cluster_watches.insert(name, token);
            }
        }

        handle.endpoint_watches.retain(|name, token| {
            let keep = services.contains(name);
            if !keep {
                token.cancel();
            }
            keep
        });
        for name in &services {
            if !handle.endpoint_watches.contains_key(name) {
                let token = spawn_watch::<EndpointsUpdate>(
                    handle,
                    name,
                    &self.queue,
                    &*self.runtime,
                    |client, name, event| Event::Endpoints {
                        client,
                        name,
                        event,
                    },
                );
                handle.endpoint_watches.insert(name.clone(), token);
            }
        }
        self.endpoints.retain(|name, _| services.contains(name));
    }

    fn arm_timer(&mut self, kind: TimerKind, timeout: Duration) -> Timer {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        let cancel = self.cancel.child_token();
        let token = cancel.clone();
        let queue = self.queue.clone();
        let sleep = self.runtime.sleep(timeout);
        let _ = self.runtime.spawn(Box::pin(async move {
            tokio::select! {
                _ = sleep => queue.push(Event::Timer(kind, id)),
                _ = token.cancelled() => {}
            }
        }));
        Timer { id, cancel }
    }

    fn process_events(&mut self, channel_controller: &mut dyn ChannelController) {
        loop {
            let events = self.queue.drain();
            if events.is_empty() {
                return;
            }
            for event in events {
                self.handle_event(event, channel_controller);
            }
        }
    }

    fn handle_event(&mut self, event: Event, channel_controller: &mut dyn ChannelController) {
        match event {
            Event::Cluster {
                client,
                name,
                event,
            } => {
                if !self.accept(client, &event) {
                    return;
                }
                self.on_cluster(name, event, channel_controller);
            }
            Event::Endpoints {
                client,
                name,
                event,
            } => {
                if !self.accept(client, &event) {
                    return;
                }
                self.on_endpoints(name, event, channel_controller);
            }
            Event::Timer(kind, id) => {
                let timer = match kind {
                    TimerKind::Startup => &mut self.startup_timer,
                    TimerKind::StaleEndpoints => &mut self.stale_timer,
                };
                if timer.as_ref().is_none_or(|t| t.id != id) {
                    return;
                }
                *timer = None;
                match kind {
                    TimerKind::Startup => {
                        warn!("xds: no response from the management server, falling back");
                        self.enter_fallback(channel_controller);
                    }
                    TimerKind::StaleEndpoints if self.lost_contact => {
                        warn!("xds: endpoints are stale, falling back");
                        self.enter_fallback(channel_controller);
                    }
                    TimerKind::StaleEndpoints => {}
                }
            }
        }
    }

    // Whether an event from the client of `generation` still applies. The
    // first response of a new client retires the one it replaced.
    fn accept<T>(&mut self, generation: u64, event: &ResourceEvent<T>) -> bool {
        if self.client.as_ref().is_some_and(|c| c.generation == generation) {
            if !matches!(event, ResourceEvent::AmbientError(_)) {
                if let Some(previous) = self.previous_client.take() {
                    info!(balancer = %previous.balancer_name, "xds: closing replaced client");
                    previous.close();
                }
            }
            return true;
        }
        self.previous_client
            .as_ref()
            .is_some_and(|c| c.generation == generation)
    }

    fn on_cluster(
        &mut self,
        name: String,
        event: ResourceEvent<ClusterUpdate>,
        channel_controller: &mut dyn ChannelController,
    ) {
        match event {
            ResourceEvent::ResourceChanged(update) => {
                debug!(cluster = %name, "xds: cluster update");
                self.on_valid_response(channel_controller);
                if let Some(tree) = self.tree.as_mut() {
                    tree.set(&name, Some(update));
                }
                self.sync_watches();
                self.update_eds(channel_controller);
            }
            ResourceEvent::ResourceDoesNotExist => {
                let is_root = self.tree.as_ref().is_some_and(|t| t.root() == name);
                if let Some(tree) = self.tree.as_mut() {
                    tree.set(&name, None);
                }
                self.sync_watches();
                if is_root {
                    warn!(cluster = %name, "xds: cluster does not exist, falling back");
                    self.enter_fallback(channel_controller);
                }
            }
            ResourceEvent::AmbientError(error) => self.on_lost_contact(error, channel_controller),
        }
    }

    fn on_endpoints(
        &mut self,
        name: String,
        event: ResourceEvent<EndpointsUpdate>,
        channel_controller: &mut dyn ChannelController,
    ) {
        match event {
            ResourceEvent::ResourceChanged(update) => {
                debug!(service = %name, "xds: endpoints update");
                self.on_valid_response(channel_controller);
                self.endpoints.insert(name, update);
                self.update_eds(channel_controller);
            }
            ResourceEvent::ResourceDoesNotExist => {
                warn!(service = %name, "xds: endpoints do not exist");
                let empty = EndpointsUpdate {
                    cluster_name: name.clone(),
                    drops: vec![],
                    localities: vec![],
                    stale_after: None,
                };
                self.endpoints.insert(name, Arc::new(empty));
                self.update_eds(channel_controller);
            }
            ResourceEvent::AmbientError(error) => self.on_lost_contact(error, channel_controller),
        }
    }

    fn on_valid_response(&mut self, channel_controller: &mut dyn ChannelController) {
        if let Some(timer) = self.startup_timer.take() {
            timer.cancel.cancel();
        }
        if let Some(timer) = self.stale_timer.take() {
            timer.cancel.cancel();
        }
        self.lost_contact = false;
        self.exit_fallback(channel_controller);
    }

    fn on_lost_contact(
        &mut self,
        error: xds_client::Error,
        channel_controller: &mut dyn ChannelController,
    ) {
        if self.lost_contact {
            return;
        }
        warn!(%error, "xds: lost contact with the management server");
        self.lost_contact = true;
        if self.in_fallback {
            return;
        }
        if let Some(stale_after) = self.stale_after {
            let timer = self.arm_timer(TimerKind::StaleEndpoints, stale_after);
            self.stale_timer = Some(timer);
        }
        // Before any endpoints arrived the startup timer decides.
        if self.eds.is_none() && self.startup_timer.is_some() {
            return;
        }
        if !self.eds_ready() {
            self.enter_fallback(channel_controller);
        }
    }

    fn eds_ready(&self) -> bool {
        self.eds_state
            .as_ref()
            .is_some_and(|s| s.connectivity_state == ConnectivityState::Ready)
    }

    // Feeds the merged endpoints of the tree to the EDS balancer, once every
    // cluster and leaf has been received.
    fn update_eds(&mut self, channel_controller: &mut dyn ChannelController) {
        let Some(tree) = self.tree.as_ref() else {
            return;
        };
        let Some(leaves) = tree.leaves() else {
            return;
        };
        let Some(merged) = merge_endpoints(tree.root(), &leaves, &self.endpoints) else {
            return;
        };
        let load_reporter = tree
            .root_update()
            .filter(|c| c.enable_lrs)
            .and(self.options.load_reporter.clone());
        self.stale_after = merged.stale_after;

        if self.eds.is_none() {
            let (builder, config) =
                policy_builder(self.config.as_ref().and_then(|c| c.child_policy.as_ref()));
            self.eds = Some(EdsBalancer::new(
                self.options.eds.clone(),
                self.work_scheduler.clone(),
                self.runtime.clone(),
                builder,
                config,
            ));
        }
        self.with_eds(channel_controller, |eds, cc| {
            eds.set_load_reporter(load_reporter);
            eds.handle_endpoints(&merged, cc);
        });
    }

    // Runs `f` on the EDS balancer and takes in the state it published.
    fn with_eds(
        &mut self,
        channel_controller: &mut dyn ChannelController,
        f: impl FnOnce(&mut EdsBalancer, &mut dyn ChannelController),
    ) {
        let Some(eds) = self.eds.as_mut() else {
            return;
        };
        let mut wrapped = WrappedController::new(channel_controller);
        f(eds, &mut wrapped);
        let Some(state) = wrapped.picker_update.take() else {
            return;
        };
        drop(wrapped);
        self.eds_state = Some(state.clone());
        if self.in_fallback {
            return;
        }
        if self.lost_contact && state.connectivity_state != ConnectivityState::Ready {
            info!("xds: no ready subchannel while out of contact, falling back");
            self.enter_fallback(channel_controller);
            return;
        }
        channel_controller.update_picker(state);
    }

    // Runs `f` on the fallback policy, recording its subchannels and
    // forwarding its state while in fallback.
    fn with_fallback(
        &mut self,
        channel_controller: &mut dyn ChannelController,
        f: impl FnOnce(&mut dyn LbPolicy, &mut dyn ChannelController),
    ) {
        let Some(fallback) = self.fallback.as_mut() else {
            return;
        };
        let mut wrapped = WrappedController::new(channel_controller);
        f(fallback.policy.as_mut(), &mut wrapped);
        let created = std::mem::take(&mut wrapped.created_subchannels);
        let state = wrapped.picker_update.take();
        drop(wrapped);
        for subchannel in created {
            self.fallback_subchannels.insert(subchannel.into());
        }
        if let Some(state) = state.filter(|_| self.in_fallback) {
            channel_controller.update_picker(state);
        }
    }

    fn enter_fallback(&mut self, channel_controller: &mut dyn ChannelController) {
        if self.in_fallback {
            return;
        }
        info!("xds: entering fallback");
        self.in_fallback = true;
        if let Some(timer) = self.startup_timer.take() {
            timer.cancel.cancel();
        }
        self.build_fallback(channel_controller);
    }

    fn build_fallback(&mut self, channel_controller: &mut dyn ChannelController) {
        let config = self.config.as_ref().and_then(|c| c.fallback_policy.clone());
        let (builder, parsed) = policy_builder(config.as_ref());
        let policy = builder.build(LbPolicyOptions {
            work_scheduler: self.work_scheduler.clone(),
            runtime: self.runtime.clone(),
        });
        self.fallback = Some(Fallback { policy, config });
        let update = self.resolved.clone().unwrap_or_default();
        self.with_fallback(channel_controller, |policy, cc| {
            if let Err(error) = policy.resolver_update(update, parsed.as_ref(), cc) {
                warn!(%error, "xds: fallback policy rejected the resolved addresses");
            }
        });
    }

    fn exit_fallback(&mut self, channel_controller: &mut dyn ChannelController) {
        if !self.in_fallback {
            return;
        }
        info!("xds: leaving fallback");
        self.in_fallback = false;
        if let Some(mut fallback) = self.fallback.take() {
            fallback.policy.close(channel_controller);
        }
        channel_controller.update_picker(self.eds_state.clone().unwrap_or_else(LbState::initial));
    }
}

fn spawn_watch<T: Resource>(
    handle: &ClientHandle,
    name: &str,
    queue: &Arc<EventQueue>,
    runtime: &dyn Runtime,
    wrap: fn(u64, String, ResourceEvent<T>) -> Event,
) -> CancellationToken {
    let token = handle.cancel.child_token();
    let cancelled = token.clone();
    let mut watcher = handle.client.watch::<T>(name);
    let generation = handle.generation;
    let queue = queue.clone();
    let name = name.to_string();
    let _ = runtime.spawn(Box::pin(async move {
        loop {
            tokio::select! {
                _ = cancelled.cancelled() => break,
                event = watcher.next() => match event {
                    Some(event) => queue.push(wrap(generation, name.clone(), event)),
                    None => break,
                },
            }
        }
    }));
    token
}

impl LbPolicy for XdsBalancer {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let Some(config) = config.and_then(|c| c.convert_to::<XdsConfig>()) else {
            return Err(XdsError::InvalidConfig("xds_experimental needs a config".into()).into());
        };
        let mut config = (*config).clone();
        if config.cluster.is_none() {
            config.cluster = update.service_name.clone();
        }
        let Some(cluster) = config.cluster.clone() else {
            return Err(XdsError::InvalidConfig(
                "xds_experimental: no Cluster configured and no service name to default to".into(),
            )
            .into());
        };
        self.resolved = Some(update.clone());
        let previous = self.config.replace(config.clone());

        if previous.is_none() {
            let timer = self.arm_timer(TimerKind::Startup, self.options.fallback_timeout);
            self.startup_timer = Some(timer);
        }

        if previous.as_ref().and_then(|p| p.cluster.as_ref()) != Some(&cluster) {
            debug!(%cluster, "xds: watching cluster");
            self.tree = Some(ClusterTree::new(cluster));
            self.endpoints.clear();
        }

        let mut result = Ok(());
        if self
            .client
            .as_ref()
            .is_none_or(|c| c.balancer_name != config.balancer_name)
        {
            if let Err(error) = self.switch_client(&config.balancer_name) {
                warn!(%error, "xds: failed to create xDS client");
                if self.client.is_none() {
                    self.enter_fallback(channel_controller);
                }
                result = Err(error.into());
            }
        }
        self.sync_watches();

        if let Some(previous) = &previous {
            if previous.child_policy != config.child_policy && self.eds.is_some() {
                let (builder, parsed) = policy_builder(config.child_policy.as_ref());
                self.with_eds(channel_controller, |eds, cc| {
                    eds.update_child_policy(builder, parsed, cc);
                });
            }
            let rebuild = self
                .fallback
                .as_ref()
                .is_some_and(|f| f.config != config.fallback_policy);
            if rebuild {
                if let Some(mut fallback) = self.fallback.take() {
                    fallback.policy.close(channel_controller);
                }
                self.build_fallback(channel_controller);
            } else if self.in_fallback {
                let (_, parsed) = policy_builder(config.fallback_policy.as_ref());
                self.with_fallback(channel_controller, |policy, cc| {
                    if let Err(error) = policy.resolver_update(update, parsed.as_ref(), cc) {
                        debug!(%error, "xds: fallback policy rejected update");
                    }
                });
            }
        }

        self.process_events(channel_controller);
        result
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let key = WeakSubchannel::new(&subchannel);
        if self.fallback_subchannels.contains(&key) {
            if state.connectivity_state == ConnectivityState::Shutdown {
                self.fallback_subchannels.remove(&key);
            }
            self.with_fallback(channel_controller, |policy, cc| {
                policy.subchannel_update(subchannel, state, cc);
            });
        } else {
            self.with_eds(channel_controller, |eds, cc| {
                eds.subchannel_update(subchannel, state, cc);
            });
        }
        self.process_events(channel_controller);
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        self.process_events(channel_controller);
        self.with_eds(channel_controller, |eds, cc| eds.work(cc));
        self.with_fallback(channel_controller, |policy, cc| policy.work(cc));
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        self.with_eds(channel_controller, |eds, cc| eds.exit_idle(cc));
        self.with_fallback(channel_controller, |policy, cc| policy.exit_idle(cc));
    }

    fn close(&mut self, channel_controller: &mut dyn ChannelController) {
        self.cancel.cancel();
        self.startup_timer = None;
        self.stale_timer = None;
        if let Some(mut eds) = self.eds.take() {
            eds.close(channel_controller);
        }
        if let Some(mut fallback) = self.fallback.take() {
            fallback.policy.close(channel_controller);
        }
        self.previous_client = None;
        self.client = None;
        self.queue.drain();
    }
}
