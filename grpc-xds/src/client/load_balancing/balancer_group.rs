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

//! Composes weighted child policies into one balancer.
//!
//! The group owns its children; each child reaches the channel only through a
//! [`WrappedController`] so the group can record which subchannels belong to
//! which child and track each child's latest state. The combined picker does
//! weighted round-robin over the Ready children.

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt::Debug;
use std::hash::Hash;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::client::load_balancing::{
    ChannelController, Failing, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState, PickResult,
    Picker, QueuingPicker, Subchannel, SubchannelState, WeakSubchannel, WorkScheduler,
    WrappedController,
};
use crate::client::name_resolution::ResolverUpdate;
use crate::client::service_config::LbConfig;
use crate::client::{ConnectivityState, RpcInfo};
use crate::rt::Runtime;

/// Combines child states: Ready if any child is Ready, else Connecting if any
/// is Connecting, else TransientFailure.
///
/// Idle children never raise the result, so a child that was just added cannot
/// pull a Ready group down.
pub fn aggregate_state(states: impl IntoIterator<Item = ConnectivityState>) -> ConnectivityState {
    let mut connecting = false;
    for state in states {
        match state {
            ConnectivityState::Ready => return ConnectivityState::Ready,
            ConnectivityState::Connecting => connecting = true,
            ConnectivityState::Idle
            | ConnectivityState::TransientFailure
            | ConnectivityState::Shutdown => {}
        }
    }
    if connecting {
        ConnectivityState::Connecting
    } else {
        ConnectivityState::TransientFailure
    }
}

/// Combines the children's states, given in insertion order as
/// `(id, weight, state)`, into the group's state.
pub type StateAggregator<T> = fn(Vec<(&T, u32, &LbState)>) -> LbState;

/// The default [`StateAggregator`]: the state follows [`aggregate_state`].
/// The picker fails in transient failure and otherwise does weighted
/// round-robin over the Ready children.
pub fn weighted_round_robin<T>(children: Vec<(&T, u32, &LbState)>) -> LbState {
    let connectivity_state = aggregate_state(children.iter().map(|(_, _, s)| s.connectivity_state));
    let picker: Arc<dyn Picker> = match connectivity_state {
        ConnectivityState::TransientFailure => Arc::new(Failing {
            error: "all localities are in transient failure".to_string(),
        }),
        _ => Arc::new(WeightedRoundRobinPicker::new(
            children
                .into_iter()
                .filter(|(_, _, s)| s.connectivity_state == ConnectivityState::Ready)
                .map(|(_, weight, s)| (weight, s.picker.clone()))
                .collect(),
        )),
    };
    LbState {
        connectivity_state,
        picker,
    }
}

/// A group of child policies keyed by `T` and weighted for picking.
pub struct BalancerGroup<T> {
    children: IndexMap<T, Child<T>>,
    // Subchannel ownership by (id, generation). Entries are dropped only when
    // the channel reports the subchannel as Shutdown.
    subchannel_to_id: HashMap<WeakSubchannel, (T, u64)>,
    pending_work: Arc<Mutex<HashSet<T>>>,
    work_scheduler: Arc<dyn WorkScheduler>,
    runtime: Arc<dyn Runtime>,
    aggregator: StateAggregator<T>,
    next_generation: u64,
    started: bool,
    // Set when something the combined picker depends on changed.
    dirty: bool,
}

struct Child<T> {
    weight: u32,
    builder: Arc<dyn LbPolicyBuilder>,
    policy: Option<Box<dyn LbPolicy>>,
    state: LbState,
    update: Option<ResolverUpdate>,
    config: Option<LbConfig>,
    generation: u64,
    work_scheduler: Arc<ChildWorkScheduler<T>>,
}

impl<T> Child<T> {
    fn idle_state() -> LbState {
        LbState {
            connectivity_state: ConnectivityState::Idle,
            picker: Arc::new(QueuingPicker {}),
        }
    }
}

impl<T> BalancerGroup<T>
where
    T: Clone + Debug + Eq + Hash + Send + Sync + 'static,
{
    /// Creates an empty, stopped group. `work_scheduler` is the parent's;
    /// children asking for work are queued and the parent is asked to call
    /// [`BalancerGroup::work`]. Children are built with `runtime`.
    pub fn new(work_scheduler: Arc<dyn WorkScheduler>, runtime: Arc<dyn Runtime>) -> Self {
        Self {
            children: IndexMap::new(),
            subchannel_to_id: HashMap::new(),
            pending_work: Arc::default(),
            work_scheduler,
            runtime,
            aggregator: weighted_round_robin::<T>,
            next_generation: 0,
            started: false,
            dirty: false,
        }
    }

    /// Replaces how the children's states are combined.
    pub fn with_aggregator(mut self, aggregator: StateAggregator<T>) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn contains(&self, id: &T) -> bool {
        self.children.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &T> {
        self.children.keys()
    }

    pub fn weight(&self, id: &T) -> Option<u32> {
        self.children.get(id).map(|c| c.weight)
    }

    pub fn builder(&self, id: &T) -> Option<&Arc<dyn LbPolicyBuilder>> {
        self.children.get(id).map(|c| &c.builder)
    }

    /// Adds a child. A duplicate id is rejected and the existing child kept.
    ///
    /// The child is built right away when the group is started, otherwise on
    /// [`BalancerGroup::start`]. It contributes Idle until it reports.
    pub fn add(&mut self, id: T, weight: u32, builder: Arc<dyn LbPolicyBuilder>) -> bool {
        if self.children.contains_key(&id) {
            warn!(?id, "balancer group: child already exists, ignoring add");
            return false;
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        let work_scheduler = Arc::new(ChildWorkScheduler {
            pending_work: self.pending_work.clone(),
            parent: self.work_scheduler.clone(),
            id: id.clone(),
            active: AtomicBool::new(true),
        });
        let mut child = Child {
            weight,
            builder,
            policy: None,
            state: Child::<T>::idle_state(),
            update: None,
            config: None,
            generation,
            work_scheduler,
        };
        if self.started {
            child.policy = Some(child.builder.build(LbPolicyOptions {
                work_scheduler: child.work_scheduler.clone(),
                runtime: self.runtime.clone(),
            }));
        }
        debug!(?id, weight, "balancer group: child added");
        self.children.insert(id, child);
        true
    }

    /// Closes and removes a child, removing every subchannel it owns, and
    /// publishes the recomputed state.
    pub fn remove(&mut self, id: &T, channel_controller: &mut dyn ChannelController) {
        let Some(child) = self.children.get(id) else {
            return;
        };
        child.work_scheduler.active.store(false, Ordering::Release);
        self.pending_work.lock().unwrap().remove(id);
        self.close_child(id, channel_controller);
        self.children.shift_remove(id);
        debug!(?id, "balancer group: child removed");
        self.dirty = true;
        self.publish(channel_controller);
    }

    /// Changes a child's weight. Returns false and does nothing when the
    /// weight is unchanged.
    pub fn change_weight(
        &mut self,
        id: &T,
        weight: u32,
        channel_controller: &mut dyn ChannelController,
    ) -> bool {
        let Some(child) = self.children.get_mut(id) else {
            return false;
        };
        if child.weight == weight {
            return false;
        }
        child.weight = weight;
        self.dirty = true;
        self.publish(channel_controller);
        true
    }

    /// Replaces a child's policy builder. A running child is closed and
    /// rebuilt with the new builder and fed its last update.
    pub fn change_builder(
        &mut self,
        id: &T,
        builder: Arc<dyn LbPolicyBuilder>,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(running) = self.children.get(id).map(|c| c.policy.is_some()) else {
            return;
        };
        self.close_child(id, channel_controller);
        if let Some(child) = self.children.get_mut(id) {
            child.builder = builder;
        }
        if running {
            self.start_child(id, channel_controller);
        }
        self.dirty = true;
        self.publish(channel_controller);
    }

    /// Delivers an update to a child. The update is kept and replayed when the
    /// child is (re)built.
    pub fn update_child(
        &mut self,
        id: &T,
        update: ResolverUpdate,
        config: Option<LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let Some(child) = self.children.get_mut(id) else {
            return Err(format!("no child {id:?} in balancer group").into());
        };
        child.update = Some(update.clone());
        child.config = config.clone();
        let Some(policy) = child.policy.as_mut() else {
            return Ok(());
        };
        let mut wrapped = WrappedController::new(channel_controller);
        let result = policy.resolver_update(update, config.as_ref(), &mut wrapped);
        self.resolve_child_controller(id, wrapped);
        self.publish(channel_controller);
        result
    }

    /// Builds every child and replays the updates it was given while the
    /// group was stopped.
    pub fn start(&mut self, channel_controller: &mut dyn ChannelController) {
        if self.started {
            return;
        }
        self.started = true;
        let ids: Vec<T> = self.children.keys().cloned().collect();
        for id in ids {
            self.start_child(&id, channel_controller);
        }
        self.dirty = true;
        self.publish(channel_controller);
    }

    /// Closes every child and their subchannels. The configuration is kept so
    /// the group can be started again.
    pub fn close(&mut self, channel_controller: &mut dyn ChannelController) {
        if !self.started {
            return;
        }
        self.started = false;
        self.pending_work.lock().unwrap().clear();
        let ids: Vec<T> = self.children.keys().cloned().collect();
        for id in ids {
            self.close_child(&id, channel_controller);
        }
        self.dirty = false;
    }

    /// Forwards a subchannel state change to the child that created it.
    pub fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let key = WeakSubchannel::new(&subchannel);
        let owner = if state.connectivity_state == ConnectivityState::Shutdown {
            self.subchannel_to_id.remove(&key)
        } else {
            self.subchannel_to_id.get(&key).cloned()
        };
        let Some((id, generation)) = owner else {
            debug!(?subchannel, "balancer group: update for unknown subchannel");
            return;
        };
        let Some(policy) = self
            .children
            .get_mut(&id)
            .filter(|c| c.generation == generation)
            .and_then(|c| c.policy.as_mut())
        else {
            return;
        };
        let mut wrapped = WrappedController::new(channel_controller);
        policy.subchannel_update(subchannel, state, &mut wrapped);
        self.resolve_child_controller(&id, wrapped);
        self.publish(channel_controller);
    }

    /// Whether a child has asked for work since the last call to `work`.
    pub fn has_pending_work(&self) -> bool {
        !self.pending_work.lock().unwrap().is_empty()
    }

    /// Runs `work` on every child that asked for it.
    pub fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        let ids = mem::take(&mut *self.pending_work.lock().unwrap());
        for id in ids {
            let Some(policy) = self.children.get_mut(&id).and_then(|c| c.policy.as_mut()) else {
                continue;
            };
            let mut wrapped = WrappedController::new(channel_controller);
            policy.work(&mut wrapped);
            self.resolve_child_controller(&id, wrapped);
        }
        self.publish(channel_controller);
    }

    pub fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        let ids: Vec<T> = self.children.keys().cloned().collect();
        for id in ids {
            let Some(policy) = self.children.get_mut(&id).and_then(|c| c.policy.as_mut()) else {
                continue;
            };
            let mut wrapped = WrappedController::new(channel_controller);
            policy.exit_idle(&mut wrapped);
            self.resolve_child_controller(&id, wrapped);
        }
        self.publish(channel_controller);
    }

    /// The combined state of the children, whether or not it was published.
    pub fn state(&self) -> LbState {
        self.build_state()
    }

    fn start_child(&mut self, id: &T, channel_controller: &mut dyn ChannelController) {
        let Some(child) = self.children.get_mut(id) else {
            return;
        };
        if child.policy.is_none() {
            child.policy = Some(child.builder.build(LbPolicyOptions {
                work_scheduler: child.work_scheduler.clone(),
                runtime: self.runtime.clone(),
            }));
        }
        let (Some(update), Some(policy)) = (child.update.clone(), child.policy.as_mut()) else {
            return;
        };
        let mut wrapped = WrappedController::new(channel_controller);
        if let Err(error) = policy.resolver_update(update, child.config.as_ref(), &mut wrapped) {
            debug!(?id, %error, "balancer group: child rejected replayed update");
        }
        self.resolve_child_controller(id, wrapped);
    }

    // Closes a child's policy and removes whatever subchannels it still
    // owns. The child's state goes back to Idle.
    fn close_child(&mut self, id: &T, channel_controller: &mut dyn ChannelController) {
        let Self {
            children,
            subchannel_to_id,
            next_generation,
            ..
        } = self;
        let Some(child) = children.get_mut(id) else {
            return;
        };
        let removed: Vec<WeakSubchannel> = match child.policy.take() {
            Some(mut policy) => {
                let mut wrapped = WrappedController::new(channel_controller);
                policy.close(&mut wrapped);
                wrapped
                    .removed_subchannels
                    .iter()
                    .map(WeakSubchannel::new)
                    .collect()
            }
            None => vec![],
        };
        for (key, (owner, generation)) in subchannel_to_id.iter() {
            if owner != id || *generation != child.generation || removed.contains(key) {
                continue;
            }
            if let Some(subchannel) = key.upgrade() {
                channel_controller.remove_subchannel(&subchannel);
            }
        }
        // The mappings stay until the channel reports Shutdown. Updates for
        // them are ignored because the generation no longer matches.
        child.generation = *next_generation;
        *next_generation += 1;
        child.state = Child::<T>::idle_state();
    }

    // Records what a child did through its wrapped controller.
    fn resolve_child_controller(&mut self, id: &T, wrapped: WrappedController<'_>) {
        let Some(child) = self.children.get_mut(id) else {
            return;
        };
        for subchannel in wrapped.created_subchannels {
            self.subchannel_to_id
                .insert(subchannel.into(), (id.clone(), child.generation));
        }
        if let Some(state) = wrapped.picker_update {
            child.state = state;
            self.dirty = true;
        }
    }

    fn build_state(&self) -> LbState {
        (self.aggregator)(
            self.children
                .iter()
                .map(|(id, c)| (id, c.weight, &c.state))
                .collect(),
        )
    }

    fn publish(&mut self, channel_controller: &mut dyn ChannelController) {
        if !self.started || !mem::take(&mut self.dirty) {
            return;
        }
        let state = self.build_state();
        debug!(state = %state.connectivity_state, "balancer group: publishing picker");
        channel_controller.update_picker(state);
    }
}

struct ChildWorkScheduler<T> {
    pending_work: Arc<Mutex<HashSet<T>>>,
    parent: Arc<dyn WorkScheduler>,
    id: T,
    // Cleared when the child is removed.
    active: AtomicBool,
}

impl<T: Eq + Hash + Clone + Send + Sync> WorkScheduler for ChildWorkScheduler<T> {
    fn schedule_work(&self) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        self.pending_work.lock().unwrap().insert(self.id.clone());
        self.parent.schedule_work();
    }
}

/// Weighted round-robin over child pickers with sticky runs: child `i` is
/// picked `weight_i` times in a row before moving on.
pub struct WeightedRoundRobinPicker {
    pickers: Vec<(u32, Arc<dyn Picker>)>,
    // (index into pickers, picks made at that index)
    cursor: Mutex<(usize, u32)>,
}

impl WeightedRoundRobinPicker {
    pub fn new(pickers: Vec<(u32, Arc<dyn Picker>)>) -> Self {
        Self {
            pickers,
            cursor: Mutex::new((0, 0)),
        }
    }
}

impl Picker for WeightedRoundRobinPicker {
    fn pick(&self, request: &RpcInfo) -> PickResult {
        if self.pickers.is_empty() {
            return PickResult::Queue;
        }
        let picker = {
            let mut cursor = self.cursor.lock().unwrap();
            let (idx, count) = &mut *cursor;
            let (weight, picker) = &self.pickers[*idx];
            *count += 1;
            if *count >= (*weight).max(1) {
                *idx = (*idx + 1) % self.pickers.len();
                *count = 0;
            }
            picker.clone()
        };
        picker.pick(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::load_balancing::round_robin::RoundRobinBuilder;
    use crate::client::load_balancing::test_utils::{
        self, TestChannelController, TestEvent, drain, endpoint, last_picker, new_subchannels,
        pick_n, state,
    };
    use crate::rt::default_runtime;
    use tokio::sync::mpsc;

    const ALL_STATES: [ConnectivityState; 4] = [
        ConnectivityState::Idle,
        ConnectivityState::Connecting,
        ConnectivityState::Ready,
        ConnectivityState::TransientFailure,
    ];

    fn rr() -> Arc<dyn LbPolicyBuilder> {
        Arc::new(RoundRobinBuilder {})
    }

    // Builds a started group with one round_robin child per (weight, address)
    // and returns the subchannel each child created, in order.
    fn group_with_children(
        children: &[(u32, &str)],
    ) -> (
        BalancerGroup<usize>,
        mpsc::UnboundedReceiver<TestEvent>,
        TestChannelController,
        Vec<Arc<dyn Subchannel>>,
    ) {
        let (mut rx, mut cc, scheduler) = test_utils::setup();
        let mut group = BalancerGroup::new(scheduler, default_runtime());
        group.start(&mut cc);
        let mut subchannels = vec![];
        for (id, (weight, address)) in children.iter().enumerate() {
            assert!(group.add(id, *weight, rr()));
            group
                .update_child(
                    &id,
                    ResolverUpdate::from_endpoints(vec![endpoint(address)]),
                    None,
                    &mut cc,
                )
                .unwrap();
            subchannels.extend(new_subchannels(&drain(&mut rx)));
        }
        (group, rx, cc, subchannels)
    }

    #[test]
    fn aggregate_matches_rule_for_every_combination() {
        let mut combinations: Vec<Vec<ConnectivityState>> = vec![vec![]];
        for _ in 0..3 {
            let mut next = combinations.clone();
            for combination in &combinations {
                for state in ALL_STATES {
                    let mut c = combination.clone();
                    c.push(state);
                    next.push(c);
                }
            }
            combinations = next;
        }
        for states in combinations {
            let want = if states.contains(&ConnectivityState::Ready) {
                ConnectivityState::Ready
            } else if states.contains(&ConnectivityState::Connecting) {
                ConnectivityState::Connecting
            } else {
                ConnectivityState::TransientFailure
            };
            assert_eq!(aggregate_state(states.iter().copied()), want, "{states:?}");
        }
    }

    #[test]
    fn idle_never_raises_the_aggregate() {
        assert_eq!(
            aggregate_state([ConnectivityState::Ready, ConnectivityState::Idle]),
            ConnectivityState::Ready
        );
        assert_eq!(
            aggregate_state([ConnectivityState::TransientFailure, ConnectivityState::Idle]),
            ConnectivityState::TransientFailure
        );
    }

    #[tokio::test]
    async fn weighted_round_robin_sticky_runs() {
        let (mut group, mut rx, mut cc, subchannels) =
            group_with_children(&[(1, "10.0.0.0:80"), (2, "10.0.0.1:80"), (3, "10.0.0.2:80")]);
        for subchannel in &subchannels {
            group.subchannel_update(subchannel.clone(), &state(ConnectivityState::Ready), &mut cc);
        }
        let picker = last_picker(&drain(&mut rx)).unwrap();
        assert_eq!(picker.connectivity_state, ConnectivityState::Ready);

        let picks: Vec<String> = pick_n(&picker, 12).into_iter().map(Option::unwrap).collect();
        let pattern = [
            "10.0.0.0:80",
            "10.0.0.1:80",
            "10.0.0.1:80",
            "10.0.0.2:80",
            "10.0.0.2:80",
            "10.0.0.2:80",
        ];
        let want: Vec<String> = pattern
            .iter()
            .chain(pattern.iter())
            .map(|s| s.to_string())
            .collect();
        assert_eq!(picks, want);
    }

    #[tokio::test]
    async fn every_window_respects_weights() {
        let weights = [1u32, 2, 3];
        let picker = WeightedRoundRobinPicker::new(
            weights
                .iter()
                .enumerate()
                .map(|(i, w)| {
                    (
                        *w,
                        Arc::new(Failing {
                            error: i.to_string(),
                        }) as Arc<dyn Picker>,
                    )
                })
                .collect(),
        );
        let rpc = RpcInfo::new("/s/m");
        let picks: Vec<String> = (0..60)
            .map(|_| match picker.pick(&rpc) {
                PickResult::Fail(status) => status.message().to_string(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        for start in 0..(picks.len() - 6) {
            let window = &picks[start..start + 6];
            for (i, w) in weights.iter().enumerate() {
                let n = window.iter().filter(|p| **p == i.to_string()).count();
                assert_eq!(n, *w as usize, "window at {start}");
            }
        }
    }

    #[tokio::test]
    async fn duplicate_add_is_rejected() {
        let (mut group, _rx, _cc, _) = group_with_children(&[(1, "10.0.0.0:80")]);
        assert!(!group.add(0, 5, rr()));
        assert_eq!(group.weight(&0), Some(1));
    }

    #[tokio::test]
    async fn equal_weight_change_does_not_publish() {
        let (mut group, mut rx, mut cc, subchannels) = group_with_children(&[(1, "10.0.0.0:80")]);
        group.subchannel_update(subchannels[0].clone(), &state(ConnectivityState::Ready), &mut cc);
        drain(&mut rx);
        assert!(!group.change_weight(&0, 1, &mut cc));
        assert!(drain(&mut rx).is_empty());
        assert!(group.change_weight(&0, 4, &mut cc));
        assert!(last_picker(&drain(&mut rx)).is_some());
    }

    #[tokio::test]
    async fn empty_ready_set_queues() {
        let (group, _rx, _cc, _) = group_with_children(&[(1, "10.0.0.0:80")]);
        let state = group.state();
        assert_eq!(state.connectivity_state, ConnectivityState::Connecting);
        assert!(matches!(
            state.picker.pick(&RpcInfo::new("/s/m")),
            PickResult::Queue
        ));
    }

    #[tokio::test]
    async fn transient_failure_fails_picks() {
        let (mut group, mut rx, mut cc, subchannels) = group_with_children(&[(1, "10.0.0.0:80")]);
        group.subchannel_update(
            subchannels[0].clone(),
            &state(ConnectivityState::TransientFailure),
            &mut cc,
        );
        let picker = last_picker(&drain(&mut rx)).unwrap();
        assert_eq!(picker.connectivity_state, ConnectivityState::TransientFailure);
        assert!(matches!(
            picker.picker.pick(&RpcInfo::new("/s/m")),
            PickResult::Fail(_)
        ));
    }

    #[tokio::test]
    async fn remove_drops_child_subchannels_and_keeps_mapping_until_shutdown() {
        let (mut group, mut rx, mut cc, subchannels) =
            group_with_children(&[(1, "10.0.0.0:80"), (1, "10.0.0.1:80")]);
        for subchannel in &subchannels {
            group.subchannel_update(subchannel.clone(), &state(ConnectivityState::Ready), &mut cc);
        }
        drain(&mut rx);

        group.remove(&0, &mut cc);
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            TestEvent::RemoveSubchannel(a) if a.address == "10.0.0.0:80"
        )));
        let picker = last_picker(&events).unwrap();
        assert_eq!(
            pick_n(&picker, 3),
            vec![Some("10.0.0.1:80".to_string()); 3]
        );
        assert!(
            group
                .subchannel_to_id
                .contains_key(&WeakSubchannel::new(&subchannels[0]))
        );

        // Late updates for the removed child's subchannel are ignored.
        group.subchannel_update(subchannels[0].clone(), &state(ConnectivityState::Idle), &mut cc);
        assert!(drain(&mut rx).is_empty());

        group.subchannel_update(
            subchannels[0].clone(),
            &state(ConnectivityState::Shutdown),
            &mut cc,
        );
        assert!(
            !group
                .subchannel_to_id
                .contains_key(&WeakSubchannel::new(&subchannels[0]))
        );
    }

    #[tokio::test]
    async fn close_keeps_config_for_restart() {
        let (mut group, mut rx, mut cc, _) = group_with_children(&[(1, "10.0.0.0:80")]);
        group.close(&mut cc);
        let events = drain(&mut rx);
        assert!(
            events
                .iter()
                .any(|e| matches!(e, TestEvent::RemoveSubchannel(_)))
        );
        assert!(!group.is_started());
        assert!(group.contains(&0));

        group.start(&mut cc);
        let events = drain(&mut rx);
        assert_eq!(new_subchannels(&events).len(), 1);
    }

    #[tokio::test]
    async fn stopped_group_builds_children_on_start() {
        let (mut rx, mut cc, scheduler) = test_utils::setup();
        let mut group = BalancerGroup::new(scheduler, default_runtime());
        group.add("a", 1, rr());
        group
            .update_child(
                &"a",
                ResolverUpdate::from_endpoints(vec![endpoint("10.0.0.0:80")]),
                None,
                &mut cc,
            )
            .unwrap();
        assert!(drain(&mut rx).is_empty());
        group.start(&mut cc);
        let events = drain(&mut rx);
        assert_eq!(new_subchannels(&events).len(), 1);
        assert_eq!(
            last_picker(&events).unwrap().connectivity_state,
            ConnectivityState::Connecting
        );
    }
}
