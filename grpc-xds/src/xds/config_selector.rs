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

//! Per-call routing for the `xds` resolver.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tonic::Status;
use tonic::metadata::MetadataMap;
use tracing::trace;

use crate::client::RpcInfo;
use crate::client::name_resolution::{ConfigSelector, RpcConfig};
use crate::xds::resource::{FilterConfig, HeaderMatcher, Route, RouteAction, VirtualHost};

/// Reference counts of the clusters calls may be routed to.
///
/// The current selector holds one reference to each cluster it can pick, and
/// every call holds one on its cluster until it commits. A cluster whose count
/// drops to zero is dropped from the service config, after which its LB policy
/// shuts down.
pub(crate) struct ActiveClusters {
    counts: DashMap<String, usize>,
    // Called when a cluster becomes unused. Detached on resolver shutdown.
    on_unused: ArcSwapOption<Box<dyn Fn() + Send + Sync>>,
}

impl ActiveClusters {
    pub(crate) fn new(on_unused: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            counts: DashMap::new(),
            on_unused: ArcSwapOption::from_pointee(Box::new(on_unused) as Box<dyn Fn() + Send + Sync>),
        }
    }

    pub(crate) fn acquire(&self, cluster: &str) {
        *self.counts.entry(cluster.to_string()).or_insert(0) += 1;
    }

    pub(crate) fn release(&self, cluster: &str) {
        let unused = match self.counts.entry(cluster.to_string()) {
            Entry::Occupied(mut entry) => {
                *entry.get_mut() -= 1;
                if *entry.get() == 0 {
                    entry.remove();
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => false,
        };
        if unused {
            trace!(cluster, "cluster no longer referenced");
            if let Some(on_unused) = self.on_unused.load_full() {
                (**on_unused)();
            }
        }
    }

    /// The referenced clusters, sorted.
    pub(crate) fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.counts.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub(crate) fn detach(&self) {
        self.on_unused.store(None);
    }
}

/// A call's reference on its cluster, released on drop. A call that is
/// abandoned before it commits lets go of its cluster all the same.
struct ClusterRef {
    clusters: Arc<ActiveClusters>,
    cluster: String,
}

impl ClusterRef {
    fn new(clusters: &Arc<ActiveClusters>, cluster: &str) -> Self {
        clusters.acquire(cluster);
        Self {
            clusters: clusters.clone(),
            cluster: cluster.to_string(),
        }
    }
}

impl Drop for ClusterRef {
    fn drop(&mut self) {
        self.clusters.release(&self.cluster);
    }
}

/// Routes calls with the routes of one virtual host.
pub struct XdsConfigSelector {
    virtual_host: VirtualHost,
    listener_max_stream_duration: Option<Duration>,
    clusters: Arc<ActiveClusters>,
    released: AtomicBool,
}

impl std::fmt::Debug for XdsConfigSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XdsConfigSelector")
            .field("domains", &self.virtual_host.domains)
            .field("routes", &self.virtual_host.routes.len())
            .finish()
    }
}

impl XdsConfigSelector {
    /// Creates a selector holding a reference to every cluster it routes to.
    pub(crate) fn new(
        virtual_host: VirtualHost,
        listener_max_stream_duration: Option<Duration>,
        clusters: Arc<ActiveClusters>,
    ) -> Self {
        let selector = Self {
            virtual_host,
            listener_max_stream_duration,
            clusters,
            released: AtomicBool::new(false),
        };
        for cluster in selector.cluster_names() {
            selector.clusters.acquire(cluster);
        }
        selector
    }

    fn cluster_names(&self) -> impl Iterator<Item = &str> {
        self.virtual_host
            .routes
            .iter()
            .filter_map(|route| match &route.action {
                RouteAction::WeightedClusters(clusters) => Some(clusters.keys()),
                RouteAction::Unsupported => None,
            })
            .flatten()
            .map(String::as_str)
    }

    /// Drops the selector's references once it has been replaced. Calls
    /// already routed keep theirs until they commit.
    pub(crate) fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        for cluster in self.cluster_names() {
            self.clusters.release(cluster);
        }
    }

    fn find_route(&self, rpc: &RpcInfo) -> Option<&Route> {
        self.virtual_host.routes.iter().find(|route| {
            let matcher = &route.matcher;
            if !matcher.matches_path(&rpc.method) {
                return false;
            }
            if !matcher
                .headers
                .iter()
                .all(|h| h.matches(header_value(&rpc.metadata, h).as_deref()))
            {
                return false;
            }
            matcher
                .fraction_per_million
                .is_none_or(|fraction| fastrand::u32(0..1_000_000) < fraction)
        })
    }
}

// Binary headers never match. Multiple values are joined with commas.
fn header_value(metadata: &MetadataMap, matcher: &HeaderMatcher) -> Option<String> {
    let name = matcher.name.as_str();
    if name.ends_with("-bin") {
        return None;
    }
    if name == "content-type" {
        return Some("application/grpc".to_string());
    }
    let values: Vec<&str> = metadata
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if values.is_empty() {
        return None;
    }
    Some(values.join(","))
}

impl ConfigSelector for XdsConfigSelector {
    fn select_config(&self, rpc: &RpcInfo) -> Result<RpcConfig, Status> {
        let Some(route) = self.find_route(rpc) else {
            return Err(Status::unavailable(format!(
                "no route matches {}",
                rpc.method
            )));
        };
        let RouteAction::WeightedClusters(clusters) = &route.action else {
            return Err(Status::unavailable("matched route does not forward calls"));
        };

        let total: u64 = clusters.values().map(|c| u64::from(c.weight)).sum();
        if total == 0 {
            return Err(Status::unavailable("matched route has no weighted cluster"));
        }
        let mut pick = fastrand::u64(0..total);
        let Some((cluster, weight)) = clusters.iter().find(|(_, c)| {
            let weight = u64::from(c.weight);
            if pick < weight {
                return true;
            }
            pick -= weight;
            false
        }) else {
            return Err(Status::unavailable("matched route has no weighted cluster"));
        };

        // Most specific wins: cluster over route over virtual host.
        let mut filter_overrides: HashMap<String, FilterConfig> =
            self.virtual_host.filter_overrides.clone();
        filter_overrides.extend(route.filter_overrides.clone());
        filter_overrides.extend(weight.filter_overrides.clone());

        let cluster_ref = ClusterRef::new(&self.clusters, cluster);
        Ok(RpcConfig {
            cluster: Some(cluster.clone()),
            timeout: route
                .max_stream_duration
                .or(self.listener_max_stream_duration),
            filter_overrides,
            on_committed: Some(Box::new(move || drop(cluster_ref))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xds::resource::RouteConfigUpdate;
    use crate::xds::resource::route_config::test_util::{prefix_route, route_config};
    use bytes::Bytes;
    use envoy_types::pb::envoy::config::route::v3 as xds_route;
    use envoy_types::pb::envoy::config::route::v3::header_matcher::HeaderMatchSpecifier;
    use std::sync::atomic::AtomicUsize;

    fn virtual_host(routes: Vec<xds_route::Route>) -> VirtualHost {
        let update = RouteConfigUpdate::from_xds(route_config("rc", &["*"], routes)).unwrap();
        update.virtual_hosts.into_iter().next().unwrap()
    }

    fn clusters() -> (Arc<ActiveClusters>, Arc<AtomicUsize>) {
        let unused = Arc::new(AtomicUsize::new(0));
        let counter = unused.clone();
        let clusters = ActiveClusters::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (Arc::new(clusters), unused)
    }

    fn filter(value: &'static str) -> FilterConfig {
        FilterConfig {
            type_url: "type.googleapis.com/test.Filter".to_string(),
            value: Bytes::from_static(value.as_bytes()),
        }
    }

    #[test]
    fn routes_by_path_prefix() {
        let (clusters, _) = clusters();
        let selector = XdsConfigSelector::new(
            virtual_host(vec![
                prefix_route("/svc.A/", &[("a", 1)]),
                prefix_route("/", &[("default", 1)]),
            ]),
            Some(Duration::from_secs(5)),
            clusters,
        );
        let config = selector.select_config(&RpcInfo::new("/svc.A/Get")).unwrap();
        assert_eq!(config.cluster.as_deref(), Some("a"));
        assert_eq!(config.timeout, Some(Duration::from_secs(5)));
        let config = selector.select_config(&RpcInfo::new("/svc.B/Get")).unwrap();
        assert_eq!(config.cluster.as_deref(), Some("default"));
    }

    #[test]
    fn no_matching_route_is_unavailable() {
        let (clusters, _) = clusters();
        let selector = XdsConfigSelector::new(
            virtual_host(vec![prefix_route("/svc.A/", &[("a", 1)])]),
            None,
            clusters,
        );
        let status = selector.select_config(&RpcInfo::new("/svc.B/Get")).unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }

    #[test]
    fn header_matchers_use_call_metadata() {
        let (clusters, _) = clusters();
        let mut route = prefix_route("/", &[("canary", 1)]);
        route.r#match.as_mut().unwrap().headers = vec![xds_route::HeaderMatcher {
            name: "x-env".to_string(),
            header_match_specifier: Some(HeaderMatchSpecifier::ExactMatch("canary".to_string())),
            ..Default::default()
        }];
        let selector = XdsConfigSelector::new(
            virtual_host(vec![route, prefix_route("/", &[("prod", 1)])]),
            None,
            clusters,
        );

        let mut metadata = MetadataMap::new();
        metadata.insert("x-env", "canary".parse().unwrap());
        let rpc = RpcInfo::new("/svc/M").with_metadata(metadata);
        assert_eq!(
            selector.select_config(&rpc).unwrap().cluster.as_deref(),
            Some("canary")
        );
        assert_eq!(
            selector
                .select_config(&RpcInfo::new("/svc/M"))
                .unwrap()
                .cluster
                .as_deref(),
            Some("prod")
        );
    }

    #[test]
    fn weighted_clusters_follow_weights() {
        let (clusters, _) = clusters();
        let selector = XdsConfigSelector::new(
            virtual_host(vec![prefix_route("/", &[("a", 1), ("b", 3), ("never", 0)])]),
            None,
            clusters,
        );
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..4000 {
            let config = selector.select_config(&RpcInfo::new("/svc/M")).unwrap();
            *counts.entry(config.cluster.unwrap()).or_default() += 1;
        }
        assert!(!counts.contains_key("never"));
        let a = counts["a"];
        assert!((800..1200).contains(&a), "a picked {a} times");
    }

    #[test]
    fn filter_overrides_prefer_the_most_specific() {
        let (clusters, _) = clusters();
        let mut vh = virtual_host(vec![prefix_route("/", &[("a", 1)])]);
        vh.filter_overrides
            .insert("f1".to_string(), filter("vhost"));
        vh.filter_overrides
            .insert("f2".to_string(), filter("vhost"));
        vh.filter_overrides
            .insert("f3".to_string(), filter("vhost"));
        let route = &mut vh.routes[0];
        route.filter_overrides.insert("f2".to_string(), filter("route"));
        route.filter_overrides.insert("f3".to_string(), filter("route"));
        if let RouteAction::WeightedClusters(clusters) = &mut route.action {
            clusters["a"]
                .filter_overrides
                .insert("f3".to_string(), filter("cluster"));
        }
        let selector = XdsConfigSelector::new(vh, None, clusters);
        let config = selector.select_config(&RpcInfo::new("/svc/M")).unwrap();
        assert_eq!(config.filter_overrides["f1"], filter("vhost"));
        assert_eq!(config.filter_overrides["f2"], filter("route"));
        assert_eq!(config.filter_overrides["f3"], filter("cluster"));
    }

    #[test]
    fn calls_keep_clusters_alive_until_committed() {
        let (clusters, unused) = clusters();
        let selector = XdsConfigSelector::new(
            virtual_host(vec![prefix_route("/", &[("a", 1)])]),
            None,
            clusters.clone(),
        );
        assert_eq!(clusters.names(), vec!["a"]);

        let config = selector.select_config(&RpcInfo::new("/svc/M")).unwrap();
        selector.release();
        selector.release();
        assert_eq!(clusters.names(), vec!["a"]);
        assert_eq!(unused.load(Ordering::SeqCst), 0);

        (config.on_committed.unwrap())();
        assert!(clusters.names().is_empty());
        assert_eq!(unused.load(Ordering::SeqCst), 1);

        clusters.detach();
        clusters.acquire("b");
        clusters.release("b");
        assert_eq!(unused.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn abandoned_call_releases_its_cluster() {
        let (clusters, unused) = clusters();
        let selector = XdsConfigSelector::new(
            virtual_host(vec![prefix_route("/", &[("a", 1)])]),
            None,
            clusters.clone(),
        );
        let config = selector.select_config(&RpcInfo::new("/svc/M")).unwrap();
        selector.release();
        assert_eq!(clusters.names(), vec!["a"]);

        // The call ends before committing, so the callback never runs.
        drop(config);
        assert!(clusters.names().is_empty());
        assert_eq!(unused.load(Ordering::SeqCst), 1);
    }
}
