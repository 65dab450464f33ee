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

//! The tree of clusters below the root cluster of an xDS balancer.
//!
//! Aggregate clusters name their children, so the tree is assembled from
//! individual Cluster resources by name. An edge that would close a cycle is
//! dropped; otherwise the tree could never become complete.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::warn;

use crate::xds::resource::{
    ClusterKind, ClusterUpdate, EndpointInfo, EndpointsUpdate, HealthStatus, Locality, LocalityId,
};

#[derive(Debug)]
pub(crate) struct ClusterTree {
    root: String,
    updates: HashMap<String, Arc<ClusterUpdate>>,
}

impl ClusterTree {
    pub(crate) fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            updates: HashMap::new(),
        }
    }

    pub(crate) fn root(&self) -> &str {
        &self.root
    }

    pub(crate) fn root_update(&self) -> Option<&Arc<ClusterUpdate>> {
        self.updates.get(&self.root)
    }

    /// Records a cluster's latest value; `None` when it does not exist.
    pub(crate) fn set(&mut self, name: &str, update: Option<Arc<ClusterUpdate>>) {
        match update {
            Some(update) => {
                self.updates.insert(name.to_string(), update);
            }
            None => {
                self.updates.remove(name);
            }
        }
    }

    /// Every cluster reachable from the root, in depth-first order. These are
    /// the clusters that need a watch.
    pub(crate) fn reachable(&self) -> Vec<String> {
        let mut visit = Visit::default();
        self.walk(&self.root, &mut visit);
        visit.order
    }

    /// The leaf clusters in priority order, or `None` while some reachable
    /// cluster has not been received.
    pub(crate) fn leaves(&self) -> Option<Vec<Arc<ClusterUpdate>>> {
        let mut visit = Visit::default();
        self.walk(&self.root, &mut visit);
        if visit.missing {
            return None;
        }
        Some(visit.leaves)
    }

    /// The leaf clusters received so far, complete tree or not.
    pub(crate) fn known_leaves(&self) -> Vec<Arc<ClusterUpdate>> {
        let mut visit = Visit::default();
        self.walk(&self.root, &mut visit);
        visit.leaves
    }

    fn walk(&self, name: &str, visit: &mut Visit) {
        if !visit.seen.insert(name.to_string()) {
            return;
        }
        visit.order.push(name.to_string());
        let Some(update) = self.updates.get(name) else {
            visit.missing = true;
            return;
        };
        match &update.kind {
            ClusterKind::Aggregate { children } => {
                visit.path.push(name.to_string());
                for child in children {
                    if visit.path.contains(child) {
                        warn!(parent = name, child, "aggregate cluster cycle, dropping edge");
                        continue;
                    }
                    self.walk(child, visit);
                }
                visit.path.pop();
            }
            ClusterKind::Eds | ClusterKind::LogicalDns { .. } => {
                visit.leaves.push(update.clone());
            }
        }
    }
}

#[derive(Default)]
struct Visit {
    seen: HashSet<String>,
    path: Vec<String>,
    order: Vec<String>,
    leaves: Vec<Arc<ClusterUpdate>>,
    missing: bool,
}

/// Merges the endpoints of the leaf clusters into one update. Each leaf's
/// priorities come after those of the leaves before it. A LogicalDNS leaf is
/// a single priority with one locality.
///
/// Returns `None` while an EDS leaf has no endpoints yet.
pub(crate) fn merge_endpoints(
    root: &str,
    leaves: &[Arc<ClusterUpdate>],
    endpoints: &HashMap<String, Arc<EndpointsUpdate>>,
) -> Option<EndpointsUpdate> {
    let mut merged = EndpointsUpdate {
        cluster_name: root.to_string(),
        drops: vec![],
        localities: vec![],
        stale_after: None,
    };
    let mut offset = 0;
    for leaf in leaves {
        match &leaf.kind {
            ClusterKind::Eds => {
                let update = endpoints.get(&leaf.service_name)?;
                for locality in &update.localities {
                    merged.localities.push(Locality {
                        priority: locality.priority + offset,
                        ..locality.clone()
                    });
                }
                merged.drops.extend(update.drops.iter().cloned());
                merged.stale_after = match (merged.stale_after, update.stale_after) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                offset += update.priorities();
            }
            ClusterKind::LogicalDns { host } => {
                merged.localities.push(Locality {
                    id: LocalityId::default(),
                    weight: 1,
                    priority: offset,
                    endpoints: vec![EndpointInfo {
                        address: host.clone(),
                        health: HealthStatus::Unknown,
                        weight: 1,
                    }],
                });
                offset += 1;
            }
            ClusterKind::Aggregate { .. } => {}
        }
    }
    Some(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eds(name: &str) -> Arc<ClusterUpdate> {
        Arc::new(ClusterUpdate {
            name: name.to_string(),
            service_name: name.to_string(),
            kind: ClusterKind::Eds,
            enable_lrs: false,
            security: None,
            max_requests: None,
        })
    }

    fn aggregate(name: &str, children: &[&str]) -> Arc<ClusterUpdate> {
        Arc::new(ClusterUpdate {
            kind: ClusterKind::Aggregate {
                children: children.iter().map(|c| c.to_string()).collect(),
            },
            ..(*eds(name)).clone()
        })
    }

    fn names(leaves: &[Arc<ClusterUpdate>]) -> Vec<&str> {
        leaves.iter().map(|l| l.name.as_str()).collect()
    }

    #[test]
    fn single_eds_cluster() {
        let mut tree = ClusterTree::new("c");
        assert_eq!(tree.reachable(), vec!["c"]);
        assert!(tree.leaves().is_none());
        tree.set("c", Some(eds("c")));
        assert_eq!(names(&tree.leaves().unwrap()), vec!["c"]);
    }

    #[test]
    fn aggregate_leaves_in_priority_order() {
        let mut tree = ClusterTree::new("root");
        tree.set("root", Some(aggregate("root", &["a", "b"])));
        assert_eq!(tree.reachable(), vec!["root", "a", "b"]);
        tree.set("a", Some(aggregate("a", &["a1", "a2"])));
        tree.set("b", Some(eds("b")));
        assert!(tree.leaves().is_none());
        tree.set("a1", Some(eds("a1")));
        tree.set("a2", Some(eds("a2")));
        assert_eq!(names(&tree.leaves().unwrap()), vec!["a1", "a2", "b"]);

        // A child that disappears makes the tree incomplete again.
        tree.set("a2", None);
        assert!(tree.leaves().is_none());
    }

    #[test]
    fn cycle_edges_are_dropped() {
        let mut tree = ClusterTree::new("root");
        tree.set("root", Some(aggregate("root", &["a", "leaf"])));
        tree.set("a", Some(aggregate("a", &["root", "leaf"])));
        tree.set("leaf", Some(eds("leaf")));
        assert_eq!(tree.reachable(), vec!["root", "a", "leaf"]);
        assert_eq!(names(&tree.leaves().unwrap()), vec!["leaf"]);
    }

    #[test]
    fn merged_priorities_are_offset_per_leaf() {
        let locality = |zone: &str, priority| Locality {
            id: LocalityId {
                region: "r".to_string(),
                zone: zone.to_string(),
                sub_zone: String::new(),
            },
            weight: 1,
            priority,
            endpoints: vec![],
        };
        let update = |name: &str, localities| {
            Arc::new(EndpointsUpdate {
                cluster_name: name.to_string(),
                drops: vec![],
                localities,
                stale_after: None,
            })
        };
        let dns = Arc::new(ClusterUpdate {
            kind: ClusterKind::LogicalDns {
                host: "dns.example.com:443".to_string(),
            },
            ..(*eds("dns")).clone()
        });
        let leaves = vec![eds("a"), dns, eds("b")];
        let mut endpoints = HashMap::new();
        endpoints.insert(
            "a".to_string(),
            update("a", vec![locality("a0", 0), locality("a1", 1)]),
        );
        assert!(merge_endpoints("root", &leaves, &endpoints).is_none());

        endpoints.insert("b".to_string(), update("b", vec![locality("b0", 0)]));
        let merged = merge_endpoints("root", &leaves, &endpoints).unwrap();
        let priorities: Vec<(String, u32)> = merged
            .localities
            .iter()
            .map(|l| (l.id.zone.clone(), l.priority))
            .collect();
        assert_eq!(
            priorities,
            vec![
                ("a0".to_string(), 0),
                ("a1".to_string(), 1),
                (String::new(), 2),
                ("b0".to_string(), 3),
            ]
        );
        assert_eq!(merged.localities[2].endpoints[0].address, "dns.example.com:443");
    }
}
