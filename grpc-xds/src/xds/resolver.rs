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

//! The `xds` name resolver.
//!
//! For a target `xds:///<service>`, the resolver watches the Listener named
//! `<service>`, then the RouteConfiguration it points at (unless inlined). From
//! the virtual host matching `<service>` it produces:
//!
//! - a service config with one `xds_experimental` child per cluster the routes
//!   can pick, under `xds_cluster_manager_experimental`,
//! - a [`ConfigSelector`](crate::client::name_resolution::ConfigSelector) that
//!   routes each call to one of those clusters.
//!
//! No endpoints are produced; the cluster policies find them through xDS.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Once};

use futures_util::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xds_client::{Resource, ResourceEvent, XdsClient};

use crate::client::load_balancing::cluster_manager::{self, POLICY_NAME as CLUSTER_MANAGER_POLICY};
use crate::client::load_balancing::xds::{BootstrapClientProvider, POLICY_NAME, XdsClientProvider};
use crate::client::name_resolution::{
    ChannelController, ConfigSelector, Resolver, ResolverBuilder, ResolverOptions,
    ResolverUpdate, Target, WorkScheduler, global_registry,
};
use crate::client::service_config::ServiceConfig;
use crate::error::XdsError;
use crate::rt::Runtime;
use crate::xds::bootstrap::Bootstrap;
use crate::xds::config_selector::{ActiveClusters, XdsConfigSelector};
use crate::xds::resource::{ListenerUpdate, RouteConfigUpdate, RouteSource, VirtualHost};

pub static SCHEME: &str = "xds";
static START: Once = Once::new();

/// Registers the `xds` resolver, connecting to the first server of the
/// bootstrap config.
pub fn reg() {
    START.call_once(|| {
        global_registry().add_builder(XdsResolverBuilder::new(Arc::new(
            BootstrapClientProvider::default(),
        )));
    });
}

pub struct XdsResolverBuilder {
    client_provider: Arc<dyn XdsClientProvider>,
    balancer_name: Option<String>,
}

impl XdsResolverBuilder {
    pub fn new(client_provider: Arc<dyn XdsClientProvider>) -> Self {
        Self {
            client_provider,
            balancer_name: None,
        }
    }

    /// Uses `balancer_name` instead of the bootstrap's first server.
    pub fn with_balancer_name(mut self, balancer_name: impl Into<String>) -> Self {
        self.balancer_name = Some(balancer_name.into());
        self
    }

    fn connect(&self, runtime: Arc<dyn Runtime>) -> Result<(String, XdsClient), XdsError> {
        let balancer_name = match &self.balancer_name {
            Some(name) => name.clone(),
            None => Bootstrap::from_env()?
                .and_then(|b| b.xds_servers.into_iter().next())
                .map(|s| s.server_uri)
                .ok_or_else(|| {
                    XdsError::InvalidConfig("no xDS bootstrap config is set".to_string())
                })?,
        };
        let client = self.client_provider.new_client(&balancer_name, runtime)?;
        Ok((balancer_name, client))
    }
}

impl ResolverBuilder for XdsResolverBuilder {
    fn build(&self, target: &Target, options: ResolverOptions) -> Box<dyn Resolver> {
        let service = self.default_authority(target);
        match self.connect(options.runtime.clone()) {
            Ok((balancer_name, client)) => Box::new(XdsResolver::new(
                service,
                balancer_name,
                client,
                options.work_scheduler,
                options.runtime,
            )),
            Err(error) => {
                warn!(%error, target = %target, "xds resolver failed to start");
                options.work_scheduler.schedule_work();
                Box::new(FailingResolver {
                    error: error.to_string(),
                })
            }
        }
    }

    fn scheme(&self) -> &str {
        SCHEME
    }

    fn is_valid_uri(&self, target: &Target) -> bool {
        !self.default_authority(target).is_empty()
    }
}

struct FailingResolver {
    error: String,
}

impl Resolver for FailingResolver {
    fn resolve_now(&mut self) {}

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        let _ = channel_controller.update(ResolverUpdate {
            endpoints: Err(self.error.clone()),
            service_config: Err(self.error.clone()),
            ..Default::default()
        });
    }
}

#[derive(Debug)]
enum Event {
    Listener(ResourceEvent<ListenerUpdate>),
    Route(String, ResourceEvent<RouteConfigUpdate>),
    ClusterUnused,
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
}

struct XdsResolver {
    service: String,
    balancer_name: String,
    client: XdsClient,
    runtime: Arc<dyn Runtime>,
    queue: Arc<EventQueue>,
    cancel: CancellationToken,

    listener: Option<Arc<ListenerUpdate>>,
    route_watch: Option<(String, CancellationToken)>,
    route_config: Option<Arc<RouteConfigUpdate>>,

    clusters: Arc<ActiveClusters>,
    selector: Option<Arc<XdsConfigSelector>>,
}

impl XdsResolver {
    fn new(
        service: String,
        balancer_name: String,
        client: XdsClient,
        work_scheduler: Arc<dyn WorkScheduler>,
        runtime: Arc<dyn Runtime>,
    ) -> Self {
        let queue = Arc::new(EventQueue {
            events: Mutex::default(),
            work_scheduler,
        });
        let weak = Arc::downgrade(&queue);
        let clusters = Arc::new(ActiveClusters::new(move || {
            if let Some(queue) = weak.upgrade() {
                queue.push(Event::ClusterUnused);
            }
        }));
        let resolver = Self {
            service,
            balancer_name,
            client,
            runtime,
            queue,
            cancel: CancellationToken::new(),
            listener: None,
            route_watch: None,
            route_config: None,
            clusters,
            selector: None,
        };
        debug!(listener = %resolver.service, "xds resolver watching listener");
        spawn_watch::<ListenerUpdate>(&resolver, &resolver.service, |_, event| {
            Event::Listener(event)
        });
        resolver
    }

    fn watch_route(&mut self, name: &str) {
        if self.route_watch.as_ref().is_some_and(|(n, _)| n == name) {
            return;
        }
        self.stop_route_watch();
        debug!(route_config = name, "xds resolver watching route config");
        let token = spawn_watch::<RouteConfigUpdate>(self, name, Event::Route);
        self.route_watch = Some((name.to_string(), token));
    }

    fn stop_route_watch(&mut self) {
        if let Some((_, token)) = self.route_watch.take() {
            token.cancel();
        }
        self.route_config = None;
    }

    fn handle_event(&mut self, event: Event, channel_controller: &mut dyn ChannelController) -> bool {
        match event {
            Event::Listener(ResourceEvent::ResourceChanged(listener)) => {
                match &listener.route_source {
                    RouteSource::Rds(name) => self.watch_route(name),
                    RouteSource::Inline(route_config) => {
                        self.stop_route_watch();
                        self.route_config = Some(Arc::new(route_config.clone()));
                    }
                }
                self.listener = Some(listener);
                true
            }
            Event::Listener(ResourceEvent::ResourceDoesNotExist) => {
                warn!(listener = %self.service, "listener does not exist");
                self.listener = None;
                self.stop_route_watch();
                self.report_empty(channel_controller);
                false
            }
            Event::Route(name, event) => {
                if self.route_watch.as_ref().is_none_or(|(n, _)| *n != name) {
                    return false;
                }
                match event {
                    ResourceEvent::ResourceChanged(route_config) => {
                        self.route_config = Some(route_config);
                        true
                    }
                    ResourceEvent::ResourceDoesNotExist => {
                        warn!(route_config = %name, "route config does not exist");
                        self.route_config = None;
                        self.report_empty(channel_controller);
                        false
                    }
                    ResourceEvent::AmbientError(error) => {
                        self.on_error(error, channel_controller);
                        false
                    }
                }
            }
            Event::Listener(ResourceEvent::AmbientError(error)) => {
                self.on_error(error, channel_controller);
                false
            }
            Event::ClusterUnused => {
                if self.selector.is_some() {
                    self.publish(channel_controller);
                }
                false
            }
        }
    }

    // Errors only reach the channel while there is no good config to keep
    // using.
    fn on_error(&mut self, error: xds_client::Error, channel_controller: &mut dyn ChannelController) {
        if self.selector.is_some() {
            warn!(%error, "xds resolver keeps using the last good config");
            return;
        }
        let message = XdsError::from(error).to_string();
        let _ = channel_controller.update(ResolverUpdate {
            endpoints: Ok(vec![]),
            service_config: Err(message),
            ..Default::default()
        });
    }

    // Installs a selector for the matching virtual host, then publishes.
    fn update_selector(&mut self, channel_controller: &mut dyn ChannelController) {
        let (Some(listener), Some(route_config)) = (&self.listener, &self.route_config) else {
            return;
        };
        let Some(virtual_host) = find_virtual_host(&route_config.virtual_hosts, &self.service)
        else {
            warn!(service = %self.service, route_config = %route_config.name, "no virtual host matches");
            self.report_empty(channel_controller);
            return;
        };
        let selector = Arc::new(XdsConfigSelector::new(
            virtual_host.clone(),
            listener.max_stream_duration,
            self.clusters.clone(),
        ));
        // The new selector holds its clusters before the old one lets go, so
        // clusters in both never become unused.
        if let Some(old) = self.selector.replace(selector) {
            old.release();
        }
        self.publish(channel_controller);
    }

    fn publish(&mut self, channel_controller: &mut dyn ChannelController) {
        let json = service_config_json(&self.balancer_name, &self.clusters.names());
        let service_config = channel_controller.parse_service_config(&json);
        if let Err(error) = &service_config {
            warn!(%error, "generated service config was rejected");
        }
        let update = ResolverUpdate {
            endpoints: Ok(vec![]),
            service_config: service_config.map(Some),
            config_selector: self
                .selector
                .clone()
                .map(|s| s as Arc<dyn ConfigSelector>),
            service_name: Some(self.service.clone()),
            ..Default::default()
        };
        if let Err(error) = channel_controller.update(update) {
            debug!(%error, "channel rejected resolver update");
        }
    }

    fn report_empty(&mut self, channel_controller: &mut dyn ChannelController) {
        if let Some(old) = self.selector.take() {
            old.release();
        }
        let _ = channel_controller.update(ResolverUpdate {
            endpoints: Ok(vec![]),
            service_config: Ok(Some(ServiceConfig::default())),
            ..Default::default()
        });
    }
}

impl Resolver for XdsResolver {
    fn resolve_now(&mut self) {}

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        loop {
            let events = std::mem::take(&mut *self.queue.events.lock().unwrap());
            if events.is_empty() {
                return;
            }
            let mut changed = false;
            for event in events {
                changed |= self.handle_event(event, channel_controller);
            }
            if changed {
                self.update_selector(channel_controller);
            }
        }
    }
}

impl Drop for XdsResolver {
    fn drop(&mut self) {
        info!(listener = %self.service, "xds resolver shutting down");
        self.cancel.cancel();
        self.clusters.detach();
        if let Some(selector) = self.selector.take() {
            selector.release();
        }
    }
}

fn spawn_watch<T: Resource>(
    resolver: &XdsResolver,
    name: &str,
    wrap: fn(String, ResourceEvent<T>) -> Event,
) -> CancellationToken {
    let token = resolver.cancel.child_token();
    let cancelled = token.clone();
    let mut watcher = resolver.client.watch::<T>(name);
    let queue = Arc::downgrade(&resolver.queue);
    let name = name.to_string();
    let _ = resolver.runtime.spawn(Box::pin(async move {
        loop {
            tokio::select! {
                _ = cancelled.cancelled() => break,
                event = watcher.next() => {
                    let (Some(event), Some(queue)) = (event, queue.upgrade()) else {
                        break;
                    };
                    queue.push(wrap(name.clone(), event));
                }
            }
        }
    }));
    token
}

/// The LB config for `clusters`: one `xds_experimental` child each under the
/// cluster manager, keyed `cluster:<name>`.
fn service_config_json(balancer_name: &str, clusters: &[String]) -> String {
    let children: serde_json::Map<String, serde_json::Value> = clusters
        .iter()
        .map(|cluster| {
            let child = json!({
                "childPolicy": [{
                    POLICY_NAME: {"BalancerName": balancer_name, "Cluster": cluster}
                }]
            });
            (cluster_manager::child_name(cluster), child)
        })
        .collect();
    json!({
        "loadBalancingConfig": [{CLUSTER_MANAGER_POLICY: {"children": children}}]
    })
    .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum DomainMatch {
    Universal,
    Prefix,
    Suffix,
    Exact,
}

fn domain_match(pattern: &str, host: &str) -> Option<DomainMatch> {
    let pattern = pattern.to_ascii_lowercase();
    let host = host.to_ascii_lowercase();
    if pattern == "*" {
        return Some(DomainMatch::Universal);
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        return host.ends_with(suffix).then_some(DomainMatch::Suffix);
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return host.starts_with(prefix).then_some(DomainMatch::Prefix);
    }
    if pattern.contains('*') {
        return None;
    }
    (pattern == host).then_some(DomainMatch::Exact)
}

/// Exact beats suffix beats prefix beats `*`; among equal kinds the longer
/// pattern wins.
fn find_virtual_host<'a>(virtual_hosts: &'a [VirtualHost], host: &str) -> Option<&'a VirtualHost> {
    virtual_hosts
        .iter()
        .flat_map(|vh| {
            vh.domains
                .iter()
                .filter_map(move |d| domain_match(d, host).map(|m| ((m, d.len()), vh)))
        })
        .max_by_key(|(rank, _)| *rank)
        .map(|(_, vh)| vh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RpcInfo;
    use crate::client::load_balancing::GLOBAL_LB_REGISTRY;
    use crate::client::load_balancing::cluster_manager::ClusterManagerConfig;
    use crate::rt::{XdsClientRuntime, default_runtime};
    use crate::xds::resource::listener::test_util::rds_listener;
    use crate::xds::resource::route_config::test_util::{prefix_route, route_config};
    use envoy_types::pb::envoy::config::listener::v3::Listener;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use xds_client::testutil::{MockAdsServer, MockTransportBuilder, mock_ads};
    use xds_client::{ClientConfig, Node, ProstCodec};

    struct MockProvider(MockTransportBuilder);

    impl XdsClientProvider for MockProvider {
        fn new_client(
            &self,
            balancer_name: &str,
            runtime: Arc<dyn Runtime>,
        ) -> Result<XdsClient, XdsError> {
            let config = ClientConfig::new(Node::new("grpc-xds-test", "0"), balancer_name);
            let runtime = XdsClientRuntime::new(runtime);
            Ok(XdsClient::builder(config, self.0.clone(), ProstCodec, runtime).build())
        }
    }

    struct TestWorkScheduler(mpsc::UnboundedSender<()>);

    impl WorkScheduler for TestWorkScheduler {
        fn schedule_work(&self) {
            let _ = self.0.send(());
        }
    }

    #[derive(Default)]
    struct TestController {
        updates: Vec<ResolverUpdate>,
    }

    impl ChannelController for TestController {
        fn update(&mut self, update: ResolverUpdate) -> Result<(), String> {
            self.updates.push(update);
            Ok(())
        }

        fn parse_service_config(&self, config: &str) -> Result<ServiceConfig, String> {
            ServiceConfig::parse(config)
        }
    }

    struct Harness {
        resolver: Box<dyn Resolver>,
        work_rx: mpsc::UnboundedReceiver<()>,
        server: MockAdsServer,
        cc: TestController,
    }

    impl Harness {
        fn new(target: &str) -> Self {
            let (transport, server) = mock_ads();
            let (tx, work_rx) = mpsc::unbounded_channel();
            let builder = XdsResolverBuilder::new(Arc::new(MockProvider(transport)))
                .with_balancer_name("xds.example.com:443");
            let target: Target = target.parse().unwrap();
            let resolver = builder.build(
                &target,
                ResolverOptions::new("", Arc::new(TestWorkScheduler(tx)), default_runtime()),
            );
            Self {
                resolver,
                work_rx,
                server,
                cc: TestController::default(),
            }
        }

        async fn expect_request(&mut self, type_url: &str, name: &str) {
            loop {
                let request = tokio::time::timeout(Duration::from_secs(5), self.server.next_request())
                    .await
                    .expect("timed out waiting for request")
                    .request;
                if request.type_url == type_url && request.resource_names.iter().any(|n| n == name) {
                    return;
                }
            }
        }

        // Runs one round of work once the resolver asks for it.
        async fn pump(&mut self) {
            tokio::time::timeout(Duration::from_secs(5), self.work_rx.recv())
                .await
                .expect("timed out waiting for work");
            self.resolver.work(&mut self.cc);
        }

        // Runs work until the resolver pushes an update.
        async fn next_update(&mut self) -> ResolverUpdate {
            let seen = self.cc.updates.len();
            while self.cc.updates.len() == seen {
                self.pump().await;
            }
            self.cc.updates.pop().unwrap()
        }
    }

    fn children(update: &ResolverUpdate) -> Vec<String> {
        let config = update.service_config.as_ref().unwrap().as_ref().unwrap();
        let policy = &config.load_balancing_config[0];
        assert_eq!(policy.name, CLUSTER_MANAGER_POLICY);
        let mut names: Vec<String> = policy.config.value()["children"]
            .as_object()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn pick(update: &ResolverUpdate, method: &str) -> (String, Option<Box<dyn FnOnce() + Send + Sync>>) {
        let config = update
            .config_selector
            .as_ref()
            .unwrap()
            .select_config(&RpcInfo::new(method))
            .unwrap();
        (config.cluster.unwrap(), config.on_committed)
    }

    async fn serve_routes(h: &mut Harness, version: &str, routes: Vec<envoy_types::pb::envoy::config::route::v3::Route>) {
        h.server.respond(
            RouteConfigUpdate::TYPE_URL,
            version,
            version,
            &[route_config("rc", &["wrong.example.com", "*.example.com"], routes)],
        );
    }

    #[tokio::test]
    async fn listener_and_routes_produce_config_and_selector() {
        let mut h = Harness::new("xds:///foo.example.com");
        h.expect_request(ListenerUpdate::TYPE_URL, "foo.example.com").await;
        h.server.respond(
            ListenerUpdate::TYPE_URL,
            "1",
            "1",
            &[rds_listener("foo.example.com", "rc")],
        );
        h.pump().await;
        h.expect_request(RouteConfigUpdate::TYPE_URL, "rc").await;
        serve_routes(
            &mut h,
            "1",
            vec![
                prefix_route("/svc.A/", &[("a", 1)]),
                prefix_route("/", &[("b", 1)]),
            ],
        )
        .await;

        let update = h.next_update().await;
        assert_eq!(update.endpoints, Ok(vec![]));
        assert_eq!(update.service_name.as_deref(), Some("foo.example.com"));
        assert_eq!(children(&update), vec!["cluster:a", "cluster:b"]);
        let policy = &update.service_config.as_ref().unwrap().as_ref().unwrap().load_balancing_config[0];
        assert_eq!(
            policy.config.value()["children"]["cluster:a"]["childPolicy"][0][POLICY_NAME],
            json!({"BalancerName": "xds.example.com:443", "Cluster": "a"})
        );
        assert_eq!(pick(&update, "/svc.A/Get").0, "a");
        assert_eq!(pick(&update, "/svc.B/Get").0, "b");
    }

    #[tokio::test]
    async fn clusters_stay_until_calls_commit() {
        let mut h = Harness::new("xds:///foo.example.com");
        h.expect_request(ListenerUpdate::TYPE_URL, "foo.example.com").await;
        h.server.respond(
            ListenerUpdate::TYPE_URL,
            "1",
            "1",
            &[rds_listener("foo.example.com", "rc")],
        );
        h.pump().await;
        h.expect_request(RouteConfigUpdate::TYPE_URL, "rc").await;
        serve_routes(&mut h, "1", vec![prefix_route("/", &[("old", 1)])]).await;
        let update = h.next_update().await;
        let (cluster, on_committed) = pick(&update, "/svc/M");
        assert_eq!(cluster, "old");

        serve_routes(&mut h, "2", vec![prefix_route("/", &[("new", 1)])]).await;
        let update = h.next_update().await;
        assert_eq!(children(&update), vec!["cluster:new", "cluster:old"]);
        assert_eq!(pick(&update, "/svc/M").0, "new");

        (on_committed.unwrap())();
        let update = h.next_update().await;
        assert_eq!(children(&update), vec!["cluster:new"]);
    }

    #[tokio::test]
    async fn removed_listener_clears_config() {
        let mut h = Harness::new("xds:///foo.example.com");
        h.expect_request(ListenerUpdate::TYPE_URL, "foo.example.com").await;
        h.server.respond(
            ListenerUpdate::TYPE_URL,
            "1",
            "1",
            &[rds_listener("foo.example.com", "rc")],
        );
        h.pump().await;
        h.expect_request(RouteConfigUpdate::TYPE_URL, "rc").await;
        serve_routes(&mut h, "1", vec![prefix_route("/", &[("a", 1)])]).await;
        h.next_update().await;

        h.server
            .respond::<Listener>(ListenerUpdate::TYPE_URL, "2", "2", &[]);
        let update = h.next_update().await;
        assert_eq!(update.service_config, Ok(Some(ServiceConfig::default())));
        assert!(update.config_selector.is_none());
        assert_eq!(update.endpoints, Ok(vec![]));
    }

    #[tokio::test]
    async fn missing_bootstrap_fails_resolution() {
        let (transport, _server) = mock_ads();
        let (tx, mut work_rx) = mpsc::unbounded_channel();
        let builder = XdsResolverBuilder::new(Arc::new(MockProvider(transport)));
        let target: Target = "xds:///foo".parse().unwrap();
        // Only meaningful when the test environment carries no bootstrap.
        if Bootstrap::from_env().ok().flatten().is_some() {
            return;
        }
        let options = ResolverOptions::new("", Arc::new(TestWorkScheduler(tx)), default_runtime());
        let mut resolver = builder.build(&target, options);
        work_rx.recv().await.unwrap();
        let mut cc = TestController::default();
        resolver.work(&mut cc);
        assert!(cc.updates[0].service_config.is_err());
        assert!(cc.updates[0].endpoints.is_err());
    }

    #[test]
    fn virtual_host_domain_matching() {
        let vh = |domains: &[&str]| VirtualHost {
            domains: domains.iter().map(|d| d.to_string()).collect(),
            routes: vec![],
            filter_overrides: Default::default(),
        };
        let hosts = vec![
            vh(&["*"]),
            vh(&["foo.*"]),
            vh(&["*.example.com"]),
            vh(&["*.bar.example.com"]),
            vh(&["foo.bar.example.com"]),
        ];
        let matched = |host: &str| {
            find_virtual_host(&hosts, host).map(|vh| vh.domains[0].clone())
        };
        assert_eq!(matched("foo.bar.example.com").as_deref(), Some("foo.bar.example.com"));
        assert_eq!(matched("FOO.BAR.example.com").as_deref(), Some("foo.bar.example.com"));
        assert_eq!(matched("baz.bar.example.com").as_deref(), Some("*.bar.example.com"));
        assert_eq!(matched("baz.example.com").as_deref(), Some("*.example.com"));
        assert_eq!(matched("foo.test").as_deref(), Some("foo.*"));
        assert_eq!(matched("other").as_deref(), Some("*"));
        assert_eq!(find_virtual_host(&hosts[1..2], "other").map(|v| v.domains.len()), None);
        assert_eq!(domain_match("a*b", "axb"), None);
    }

    #[test]
    fn generated_service_config_resolves_to_registered_policies() {
        crate::init();
        let json = service_config_json("xds.example.com:443", &["a".to_string(), "b".to_string()]);
        let service_config = ServiceConfig::parse(&json).unwrap();
        let (builder, entry) = GLOBAL_LB_REGISTRY
            .first_registered(&service_config.load_balancing_config)
            .unwrap();
        assert_eq!(builder.name(), CLUSTER_MANAGER_POLICY);

        let parsed = builder.parse_config(&entry.config).unwrap().unwrap();
        let config = parsed.convert_to::<ClusterManagerConfig>().unwrap();
        let children: Vec<(&str, &str)> = config
            .children
            .iter()
            .map(|(name, child)| (name.as_str(), child.builder.name()))
            .collect();
        assert_eq!(
            children,
            vec![("cluster:a", POLICY_NAME), ("cluster:b", POLICY_NAME)]
        );
    }
}
