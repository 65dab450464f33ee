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

//! The `xds_cluster_manager_experimental` LB policy.
//!
//! The xDS resolver names every cluster its routes can pick as a child of this
//! policy. Each child runs its own policy, usually `xds_experimental` for that
//! cluster, and each call goes to the child of the cluster the config selector
//! chose for it.

use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Once};

use serde::Deserialize;
use tonic::Status;
use tracing::{debug, warn};

use crate::client::load_balancing::balancer_group::BalancerGroup;
use crate::client::load_balancing::{
    ChannelController, Failing, GLOBAL_LB_REGISTRY, LbPolicy, LbPolicyBuilder, LbPolicyOptions,
    LbState, PickResult, Picker, Subchannel, SubchannelState,
};
use crate::client::name_resolution::ResolverUpdate;
use crate::client::service_config::{LbConfig, ParsedJsonLbConfig, parse_policy_list};
use crate::client::{ConnectivityState, RpcInfo};
use crate::error::XdsError;

pub static POLICY_NAME: &str = "xds_cluster_manager_experimental";
static START: Once = Once::new();

/// The name of the child that serves `cluster`.
pub fn child_name(cluster: &str) -> String {
    format!("cluster:{cluster}")
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonChild {
    #[serde(default)]
    child_policy: Vec<HashMap<String, serde_json::Value>>,
}

#[derive(Deserialize)]
struct JsonConfig {
    #[serde(default)]
    children: BTreeMap<String, JsonChild>,
}

/// The parsed cluster manager config: the policy of every child, by child
/// name.
#[derive(Debug, Clone)]
pub struct ClusterManagerConfig {
    pub children: BTreeMap<String, ChildPolicy>,
}

/// The first registered policy of a child's `childPolicy` list.
#[derive(Clone)]
pub struct ChildPolicy {
    pub builder: Arc<dyn LbPolicyBuilder>,
    pub config: Option<LbConfig>,
}

impl fmt::Debug for ChildPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildPolicy")
            .field("policy", &self.builder.name())
            .field("config", &self.config)
            .finish()
    }
}

#[derive(Debug)]
pub struct ClusterManagerBuilder {}

impl LbPolicyBuilder for ClusterManagerBuilder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(ClusterManager {
            children: BalancerGroup::new(options.work_scheduler, options.runtime)
                .with_aggregator(pick_by_cluster),
        })
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
            .map_err(|e| XdsError::InvalidConfig(format!("{POLICY_NAME}: {e}")))?;
        let mut children = BTreeMap::new();
        for (name, child) in json.children {
            let list = parse_policy_list(child.child_policy)
                .map_err(|e| XdsError::InvalidConfig(format!("{POLICY_NAME}: child {name}: {e}")))?;
            let Some((builder, entry)) = GLOBAL_LB_REGISTRY.first_registered(&list) else {
                return Err(XdsError::InvalidConfig(format!(
                    "{POLICY_NAME}: child {name} has no registered policy"
                ))
                .into());
            };
            let config = builder.parse_config(&entry.config)?;
            children.insert(name, ChildPolicy { builder, config });
        }
        Ok(Some(LbConfig::new(ClusterManagerConfig { children })))
    }
}

/// Registers the cluster manager with the global registry.
pub fn reg() {
    START.call_once(|| {
        GLOBAL_LB_REGISTRY.add_builder(ClusterManagerBuilder {});
    });
}

struct ClusterManager {
    children: BalancerGroup<String>,
}

impl LbPolicy for ClusterManager {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let Some(config) = config.and_then(|c| c.convert_to::<ClusterManagerConfig>()) else {
            return Err(XdsError::InvalidConfig(format!("{POLICY_NAME} needs a config")).into());
        };

        let removed: Vec<String> = self
            .children
            .ids()
            .filter(|id| !config.children.contains_key(*id))
            .cloned()
            .collect();
        for id in removed {
            debug!(child = %id, "cluster manager: removing child");
            self.children.remove(&id, channel_controller);
        }

        let mut result = Ok(());
        for (name, child) in &config.children {
            match self.children.builder(name).map(|b| b.name()) {
                None => {
                    debug!(child = %name, policy = child.builder.name(), "cluster manager: adding child");
                    self.children.add(name.clone(), 1, child.builder.clone());
                }
                Some(policy) if policy != child.builder.name() => {
                    self.children
                        .change_builder(name, child.builder.clone(), channel_controller);
                }
                Some(_) => {}
            }
            if let Err(error) = self.children.update_child(
                name,
                update.clone(),
                child.config.clone(),
                channel_controller,
            ) {
                warn!(child = %name, %error, "cluster manager: child rejected update");
                result = Err(error);
            }
        }
        self.children.start(channel_controller);
        result
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        self.children
            .subchannel_update(subchannel, state, channel_controller);
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        self.children.work(channel_controller);
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        self.children.exit_idle(channel_controller);
    }

    fn close(&mut self, channel_controller: &mut dyn ChannelController) {
        self.children.close(channel_controller);
    }
}

// Ready if any child is, then Connecting, then Idle. The picker hands each
// call to its cluster's child whatever that child's state.
fn pick_by_cluster(children: Vec<(&String, u32, &LbState)>) -> LbState {
    let connectivity_state = [
        ConnectivityState::Ready,
        ConnectivityState::Connecting,
        ConnectivityState::Idle,
    ]
    .into_iter()
    .find(|wanted| children.iter().any(|(_, _, s)| s.connectivity_state == *wanted))
    .unwrap_or(ConnectivityState::TransientFailure);
    let picker: Arc<dyn Picker> = if children.is_empty() {
        Arc::new(Failing {
            error: "no clusters are configured".to_string(),
        })
    } else {
        Arc::new(ClusterPicker {
            pickers: children
                .into_iter()
                .map(|(name, _, state)| (name.clone(), state.picker.clone()))
                .collect(),
        })
    };
    LbState {
        connectivity_state,
        picker,
    }
}

struct ClusterPicker {
    pickers: HashMap<String, Arc<dyn Picker>>,
}

impl Picker for ClusterPicker {
    fn pick(&self, request: &RpcInfo) -> PickResult {
        let Some(cluster) = request.cluster.as_deref() else {
            return PickResult::Fail(Status::unavailable("no cluster was selected for the call"));
        };
        match self.pickers.get(&child_name(cluster)) {
            Some(picker) => picker.pick(request),
            None => PickResult::Fail(Status::unavailable(format!("unknown cluster {cluster}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::load_balancing::{QueuingPicker, round_robin};
    use crate::client::load_balancing::test_utils::{self, TestEvent};
    use crate::rt::default_runtime;

    fn parse(json: serde_json::Value) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        ClusterManagerBuilder {}.parse_config(&ParsedJsonLbConfig::from_value(json))
    }

    fn pick(state: &LbState, cluster: Option<&str>) -> PickResult {
        let mut rpc = RpcInfo::new("/test.Service/Method");
        rpc.cluster = cluster.map(str::to_string);
        state.picker.pick(&rpc)
    }

    #[test]
    fn parses_first_registered_child_policy() {
        round_robin::reg();
        let config = parse(serde_json::json!({
            "children": {
                "cluster:a": {"childPolicy": [{"unknown": {}}, {"round_robin": {}}]},
                "cluster:b": {"childPolicy": [{"round_robin": {}}]},
            }
        }))
        .unwrap()
        .unwrap();
        let config = config.convert_to::<ClusterManagerConfig>().unwrap();
        let children: Vec<(&str, &str)> = config
            .children
            .iter()
            .map(|(name, child)| (name.as_str(), child.builder.name()))
            .collect();
        assert_eq!(
            children,
            vec![("cluster:a", "round_robin"), ("cluster:b", "round_robin")]
        );

        let unknown = parse(serde_json::json!({
            "children": {"cluster:a": {"childPolicy": [{"unknown": {}}]}}
        }));
        assert!(unknown.is_err());
    }

    #[tokio::test]
    async fn picks_go_to_the_selected_cluster() {
        round_robin::reg();
        let (mut rx, mut cc, scheduler) = test_utils::setup();
        let mut lb = ClusterManagerBuilder {}.build(LbPolicyOptions {
            work_scheduler: scheduler,
            runtime: default_runtime(),
        });
        let config = parse(serde_json::json!({
            "children": {
                "cluster:a": {"childPolicy": [{"round_robin": {}}]},
                "cluster:b": {"childPolicy": [{"round_robin": {}}]},
            }
        }))
        .unwrap();
        lb.resolver_update(
            ResolverUpdate::from_endpoints(vec![test_utils::endpoint("10.0.0.1:80")]),
            config.as_ref(),
            &mut cc,
        )
        .unwrap();
        // Children start in name order, so the first subchannel is cluster a's.
        let events = test_utils::drain(&mut rx);
        let subchannels = test_utils::new_subchannels(&events);
        assert_eq!(subchannels.len(), 2);

        lb.subchannel_update(
            subchannels[0].clone(),
            &test_utils::state(ConnectivityState::Ready),
            &mut cc,
        );
        let events = test_utils::drain(&mut rx);
        let state = test_utils::last_picker(&events).unwrap();
        assert_eq!(state.connectivity_state, ConnectivityState::Ready);

        match pick(&state, Some("a")) {
            PickResult::Pick(pick) => assert!(Arc::ptr_eq(&pick.subchannel, &subchannels[0])),
            other => panic!("unexpected pick result {other:?}"),
        }
        assert!(matches!(pick(&state, Some("b")), PickResult::Queue));
        assert!(matches!(pick(&state, Some("c")), PickResult::Fail(_)));
        assert!(matches!(pick(&state, None), PickResult::Fail(_)));
    }

    #[tokio::test]
    async fn removed_cluster_closes_its_child() {
        round_robin::reg();
        let (mut rx, mut cc, scheduler) = test_utils::setup();
        let mut lb = ClusterManagerBuilder {}.build(LbPolicyOptions {
            work_scheduler: scheduler,
            runtime: default_runtime(),
        });
        let both = parse(serde_json::json!({
            "children": {
                "cluster:a": {"childPolicy": [{"round_robin": {}}]},
                "cluster:b": {"childPolicy": [{"round_robin": {}}]},
            }
        }))
        .unwrap();
        let update = ResolverUpdate::from_endpoints(vec![test_utils::endpoint("10.0.0.1:80")]);
        lb.resolver_update(update.clone(), both.as_ref(), &mut cc)
            .unwrap();
        test_utils::drain(&mut rx);

        let only_a = parse(serde_json::json!({
            "children": {"cluster:a": {"childPolicy": [{"round_robin": {}}]}}
        }))
        .unwrap();
        lb.resolver_update(update, only_a.as_ref(), &mut cc).unwrap();
        let events = test_utils::drain(&mut rx);
        let removed = events
            .iter()
            .filter(|e| matches!(e, TestEvent::RemoveSubchannel(_)))
            .count();
        assert_eq!(removed, 1);
        let state = test_utils::last_picker(&events).unwrap();
        assert!(matches!(pick(&state, Some("b")), PickResult::Fail(_)));
        assert!(matches!(pick(&state, Some("a")), PickResult::Queue));
    }

    #[test]
    fn no_children_fails_every_call() {
        let state = pick_by_cluster(vec![]);
        assert_eq!(state.connectivity_state, ConnectivityState::TransientFailure);
        assert!(matches!(pick(&state, Some("a")), PickResult::Fail(_)));
    }

    #[test]
    fn idle_child_keeps_manager_out_of_transient_failure() {
        let a = "cluster:a".to_string();
        let idle = LbState {
            connectivity_state: ConnectivityState::Idle,
            picker: Arc::new(QueuingPicker {}),
        };
        let state = pick_by_cluster(vec![(&a, 1, &idle)]);
        assert_eq!(state.connectivity_state, ConnectivityState::Idle);
    }
}
