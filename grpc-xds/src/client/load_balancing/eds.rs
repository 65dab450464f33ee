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

//! The EDS balancer: priorities of weighted localities.
//!
//! Each priority is a [`BalancerGroup`] keyed by locality. Only one priority
//! serves traffic at a time. A priority that does not become Ready within the
//! init timeout, fails, or degrades from Ready hands over to the next one; a
//! higher priority that becomes Ready again takes traffic back and closes the
//! lower ones.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info};

use crate::client::load_balancing::balancer_group::BalancerGroup;
use crate::client::load_balancing::{
    ChannelController, LbPolicyBuilder, LbState, PickResult, Picker, Subchannel, SubchannelState,
    WeakSubchannel, WorkScheduler, WrappedController,
};
use crate::client::name_resolution::{Address, Endpoint, ResolverUpdate};
use crate::client::service_config::LbConfig;
use crate::client::{ConnectivityState, RpcInfo};
use crate::rt::Runtime;
use crate::xds::resource::{DropConfig, EndpointsUpdate, Locality, LocalityId};

/// How long a starting priority has to become Ready before the next priority
/// is started alongside it.
pub const DEFAULT_PRIORITY_INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Receives load report events for a cluster.
pub trait LoadReporter: Send + Sync {
    /// A call was dropped by a drop overload of `category`.
    fn call_dropped(&self, category: &str);
}

#[derive(Debug, Clone)]
pub struct EdsBalancerOptions {
    pub priority_init_timeout: Duration,
}

impl Default for EdsBalancerOptions {
    fn default() -> Self {
        Self {
            priority_init_timeout: DEFAULT_PRIORITY_INIT_TIMEOUT,
        }
    }
}

struct InitTimer {
    priority: u32,
    generation: u64,
    cancel: CancellationToken,
}

pub struct EdsBalancer {
    options: EdsBalancerOptions,
    work_scheduler: Arc<dyn WorkScheduler>,
    runtime: Arc<dyn Runtime>,
    child_builder: Arc<dyn LbPolicyBuilder>,
    child_config: Option<LbConfig>,

    groups: BTreeMap<u32, BalancerGroup<LocalityId>>,
    // The localities last given to each group.
    localities: BTreeMap<u32, HashMap<LocalityId, Locality>>,
    priority_states: HashMap<u32, LbState>,
    priority_in_use: Option<u32>,
    priority_max: Option<u32>,
    subchannel_to_priority: HashMap<WeakSubchannel, u32>,

    init_timer: Option<InitTimer>,
    next_timer_generation: u64,
    // Fired init timers, as (priority, generation).
    fired_timers: Arc<Mutex<Vec<(u32, u64)>>>,
    // Group state changes not yet run through the priority state machine.
    pending_states: VecDeque<(u32, LbState)>,

    drops: Vec<DropConfig>,
    load_reporter: Option<Arc<dyn LoadReporter>>,
    // The state of the priority in use, before drops are applied.
    inner_state: Option<LbState>,
}

impl EdsBalancer {
    pub fn new(
        options: EdsBalancerOptions,
        work_scheduler: Arc<dyn WorkScheduler>,
        runtime: Arc<dyn Runtime>,
        child_builder: Arc<dyn LbPolicyBuilder>,
        child_config: Option<LbConfig>,
    ) -> Self {
        Self {
            options,
            work_scheduler,
            runtime,
            child_builder,
            child_config,
            groups: BTreeMap::new(),
            localities: BTreeMap::new(),
            priority_states: HashMap::new(),
            priority_in_use: None,
            priority_max: None,
            subchannel_to_priority: HashMap::new(),
            init_timer: None,
            next_timer_generation: 0,
            fired_timers: Arc::default(),
            pending_states: VecDeque::new(),
            drops: vec![],
            load_reporter: None,
            inner_state: None,
        }
    }

    /// The priority currently serving traffic.
    pub fn priority_in_use(&self) -> Option<u32> {
        self.priority_in_use
    }

    /// Sets where dropped calls are reported. `None` stops reporting.
    pub fn set_load_reporter(&mut self, load_reporter: Option<Arc<dyn LoadReporter>>) {
        self.load_reporter = load_reporter;
    }

    /// Applies a new endpoints update: priorities and localities are added,
    /// reweighted or removed, then the priority in use is re-evaluated.
    pub fn handle_endpoints(
        &mut self,
        update: &EndpointsUpdate,
        channel_controller: &mut dyn ChannelController,
    ) {
        let mut by_priority: BTreeMap<u32, HashMap<LocalityId, Locality>> = BTreeMap::new();
        for locality in &update.localities {
            by_priority
                .entry(locality.priority)
                .or_default()
                .insert(locality.id.clone(), locality.clone());
        }

        let mut priorities_changed = false;
        for (&priority, localities) in &by_priority {
            if !self.groups.contains_key(&priority) {
                debug!(priority, "eds: new priority");
                let group = BalancerGroup::new(self.work_scheduler.clone(), self.runtime.clone());
                self.groups.insert(priority, group);
                priorities_changed = true;
            }
            self.update_localities(priority, localities, channel_controller);
        }

        let removed: Vec<u32> = self
            .groups
            .keys()
            .filter(|p| !by_priority.contains_key(p))
            .copied()
            .collect();
        for priority in removed {
            debug!(priority, "eds: priority removed");
            if let Some(mut group) = self.groups.remove(&priority) {
                group.close(channel_controller);
            }
            self.localities.remove(&priority);
            self.priority_states.remove(&priority);
            priorities_changed = true;
        }
        self.priority_max = self.groups.keys().next_back().copied();

        let drops_changed = self.drops != update.drops;
        self.drops = update.drops.clone();

        if priorities_changed {
            self.handle_priority_change(channel_controller);
        }
        self.process_states(channel_controller);

        if drops_changed && !priorities_changed {
            if let Some(state) = self.inner_state.clone() {
                self.publish(state, channel_controller);
            }
        }
    }

    /// Rebuilds every locality's policy with a new builder or config.
    pub fn update_child_policy(
        &mut self,
        builder: Arc<dyn LbPolicyBuilder>,
        config: Option<LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) {
        let builder_changed = builder.name() != self.child_builder.name();
        self.child_builder = builder;
        self.child_config = config;
        let priorities: Vec<u32> = self.groups.keys().copied().collect();
        for priority in priorities {
            let Some(localities) = self.localities.get(&priority).cloned() else {
                continue;
            };
            let Some(group) = self.groups.get_mut(&priority) else {
                continue;
            };
            let mut wrapped = WrappedController::new(channel_controller);
            for (id, locality) in &localities {
                if builder_changed {
                    group.change_builder(id, self.child_builder.clone(), &mut wrapped);
                }
                let update = ResolverUpdate::from_endpoints(usable_endpoints(locality));
                if let Err(error) =
                    group.update_child(id, update, self.child_config.clone(), &mut wrapped)
                {
                    debug!(%id, %error, "eds: locality rejected update");
                }
            }
            self.resolve_wrapped(priority, wrapped);
        }
        self.process_states(channel_controller);
    }

    pub fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let key = WeakSubchannel::new(&subchannel);
        let priority = if state.connectivity_state == ConnectivityState::Shutdown {
            self.subchannel_to_priority.remove(&key)
        } else {
            self.subchannel_to_priority.get(&key).copied()
        };
        let Some(priority) = priority else {
            return;
        };
        let Some(group) = self.groups.get_mut(&priority) else {
            return;
        };
        let mut wrapped = WrappedController::new(channel_controller);
        group.subchannel_update(subchannel, state, &mut wrapped);
        self.resolve_wrapped(priority, wrapped);
        self.process_states(channel_controller);
    }

    /// Handles fired init timers and work requested by locality policies.
    pub fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        let fired = std::mem::take(&mut *self.fired_timers.lock().unwrap());
        for (priority, generation) in fired {
            self.on_init_timeout(priority, generation, channel_controller);
        }
        let priorities: Vec<u32> = self
            .groups
            .iter()
            .filter(|(_, g)| g.has_pending_work())
            .map(|(p, _)| *p)
            .collect();
        for priority in priorities {
            let Some(group) = self.groups.get_mut(&priority) else {
                continue;
            };
            let mut wrapped = WrappedController::new(channel_controller);
            group.work(&mut wrapped);
            self.resolve_wrapped(priority, wrapped);
        }
        self.process_states(channel_controller);
    }

    pub fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        let priorities: Vec<u32> = self.groups.keys().copied().collect();
        for priority in priorities {
            let Some(group) = self.groups.get_mut(&priority).filter(|g| g.is_started()) else {
                continue;
            };
            let mut wrapped = WrappedController::new(channel_controller);
            group.exit_idle(&mut wrapped);
            self.resolve_wrapped(priority, wrapped);
        }
        self.process_states(channel_controller);
    }

    /// Stops the init timer and closes every priority.
    pub fn close(&mut self, channel_controller: &mut dyn ChannelController) {
        self.stop_init_timer();
        for group in self.groups.values_mut() {
            group.close(channel_controller);
        }
        self.groups.clear();
        self.localities.clear();
        self.priority_states.clear();
        self.pending_states.clear();
        self.priority_in_use = None;
        self.priority_max = None;
    }

    fn update_localities(
        &mut self,
        priority: u32,
        localities: &HashMap<LocalityId, Locality>,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(group) = self.groups.get_mut(&priority) else {
            return;
        };
        let old = self.localities.remove(&priority).unwrap_or_default();
        let mut wrapped = WrappedController::new(channel_controller);

        for (id, locality) in localities {
            let changed = match old.get(id) {
                None => {
                    group.add(id.clone(), locality.weight, self.child_builder.clone());
                    true
                }
                Some(previous) => {
                    group.change_weight(id, locality.weight, &mut wrapped);
                    previous.endpoints != locality.endpoints
                }
            };
            if changed {
                let update = ResolverUpdate::from_endpoints(usable_endpoints(locality));
                if let Err(error) =
                    group.update_child(id, update, self.child_config.clone(), &mut wrapped)
                {
                    debug!(%id, %error, "eds: locality rejected update");
                }
            }
        }
        for id in old.keys().filter(|id| !localities.contains_key(id)) {
            group.remove(id, &mut wrapped);
        }

        self.localities.insert(priority, localities.clone());
        self.resolve_wrapped(priority, wrapped);
    }

    // Records subchannels created under a priority and queues its new state.
    fn resolve_wrapped(&mut self, priority: u32, wrapped: WrappedController<'_>) {
        for subchannel in wrapped.created_subchannels {
            self.subchannel_to_priority
                .insert(subchannel.into(), priority);
        }
        if let Some(state) = wrapped.picker_update {
            self.pending_states.push_back((priority, state));
        }
    }

    fn process_states(&mut self, channel_controller: &mut dyn ChannelController) {
        while let Some((priority, state)) = self.pending_states.pop_front() {
            if self.handle_priority_state(priority, state.clone(), channel_controller) {
                self.publish(state, channel_controller);
            }
        }
    }

    // Reacts to the set of priorities changing.
    fn handle_priority_change(&mut self, channel_controller: &mut dyn ChannelController) {
        let Some(priority_max) = self.priority_max else {
            info!("eds: all priorities removed");
            self.stop_init_timer();
            self.priority_in_use = None;
            self.publish(
                LbState::transient_failure("no priority is available"),
                channel_controller,
            );
            return;
        };
        let Some(in_use) = self.priority_in_use else {
            self.start_priority(0, channel_controller);
            return;
        };
        if !self.groups.contains_key(&in_use) {
            self.priority_in_use = Some(priority_max);
            let state = self
                .priority_states
                .get(&priority_max)
                .cloned()
                .unwrap_or_else(LbState::initial);
            self.publish(state, channel_controller);
            return;
        }
        if let Some(state) = self.priority_states.get(&in_use).cloned() {
            let ready = state.connectivity_state == ConnectivityState::Ready;
            self.publish(state, channel_controller);
            if !ready && self.groups.contains_key(&(in_use + 1)) {
                self.start_priority(in_use + 1, channel_controller);
            }
        }
    }

    // Runs a priority's new state through the state machine. Returns whether
    // the state should be sent to the channel.
    fn handle_priority_state(
        &mut self,
        priority: u32,
        state: LbState,
        channel_controller: &mut dyn ChannelController,
    ) -> bool {
        let Some(in_use) = self.priority_in_use else {
            return false;
        };
        if priority > in_use || !self.groups.contains_key(&priority) {
            debug!(priority, in_use, "eds: ignoring update from unused priority");
            return false;
        }
        let previous = self
            .priority_states
            .insert(priority, state.clone())
            .map(|s| s.connectivity_state)
            .unwrap_or(ConnectivityState::Idle);

        match state.connectivity_state {
            ConnectivityState::Ready => {
                if priority < in_use {
                    info!(priority, in_use, "eds: higher priority is ready, switching");
                    self.priority_in_use = Some(priority);
                    let lower: Vec<u32> = self.groups.range(priority + 1..).map(|(p, _)| *p).collect();
                    for p in lower {
                        if let Some(group) = self.groups.get_mut(&p) {
                            group.close(channel_controller);
                        }
                        self.priority_states.remove(&p);
                    }
                    self.pending_states.retain(|(p, _)| *p <= priority);
                }
                self.stop_init_timer();
                true
            }
            ConnectivityState::TransientFailure => {
                if priority < in_use {
                    return false;
                }
                self.stop_init_timer();
                if self.groups.contains_key(&(priority + 1)) {
                    self.start_priority(priority + 1, channel_controller);
                }
                true
            }
            ConnectivityState::Connecting => {
                if priority < in_use {
                    return false;
                }
                match previous {
                    ConnectivityState::Ready => {
                        if self.groups.contains_key(&(priority + 1)) {
                            self.start_priority(priority + 1, channel_controller);
                        }
                        true
                    }
                    ConnectivityState::TransientFailure => false,
                    _ => true,
                }
            }
            ConnectivityState::Idle | ConnectivityState::Shutdown => false,
        }
    }

    fn start_priority(&mut self, priority: u32, channel_controller: &mut dyn ChannelController) {
        debug!(priority, "eds: starting priority");
        self.priority_in_use = Some(priority);
        let Some(group) = self.groups.get_mut(&priority) else {
            return;
        };
        let mut wrapped = WrappedController::new(channel_controller);
        group.start(&mut wrapped);
        self.resolve_wrapped(priority, wrapped);
        self.arm_init_timer(priority);
    }

    fn arm_init_timer(&mut self, priority: u32) {
        self.stop_init_timer();
        let generation = self.next_timer_generation;
        self.next_timer_generation += 1;
        let cancel = CancellationToken::new();
        let fired_timers = self.fired_timers.clone();
        let work_scheduler = self.work_scheduler.clone();
        let timeout = self.options.priority_init_timeout;
        let token = cancel.clone();
        let sleep = self.runtime.sleep(timeout);
        let _ = self.runtime.spawn(Box::pin(async move {
            tokio::select! {
                _ = sleep => {
                    fired_timers.lock().unwrap().push((priority, generation));
                    work_scheduler.schedule_work();
                }
                _ = token.cancelled() => {}
            }
        }));
        self.init_timer = Some(InitTimer {
            priority,
            generation,
            cancel,
        });
    }

    fn stop_init_timer(&mut self) {
        if let Some(timer) = self.init_timer.take() {
            timer.cancel.cancel();
        }
    }

    fn on_init_timeout(
        &mut self,
        priority: u32,
        generation: u64,
        channel_controller: &mut dyn ChannelController,
    ) {
        let current = self
            .init_timer
            .as_ref()
            .is_some_and(|t| t.priority == priority && t.generation == generation);
        if !current || self.priority_in_use != Some(priority) {
            return;
        }
        self.init_timer = None;
        let ready = self
            .priority_states
            .get(&priority)
            .is_some_and(|s| s.connectivity_state == ConnectivityState::Ready);
        if !ready && self.groups.contains_key(&(priority + 1)) {
            info!(priority, "eds: priority init timeout, starting next priority");
            self.start_priority(priority + 1, channel_controller);
        }
    }

    fn publish(&mut self, state: LbState, channel_controller: &mut dyn ChannelController) {
        self.inner_state = Some(state.clone());
        let state = if self.drops.is_empty() {
            state
        } else {
            LbState {
                connectivity_state: state.connectivity_state,
                picker: Arc::new(DropPicker {
                    drops: self.drops.clone(),
                    load_reporter: self.load_reporter.clone(),
                    child: state.picker,
                }),
            }
        };
        channel_controller.update_picker(state);
    }
}

fn usable_endpoints(locality: &Locality) -> Vec<Endpoint> {
    locality
        .endpoints
        .iter()
        .filter(|e| e.health.is_usable())
        .map(|e| Endpoint::new(vec![Address::tcp(e.address.clone())]))
        .collect()
}

/// Drops a share of calls per drop category before delegating to the picker
/// of the priority in use.
struct DropPicker {
    drops: Vec<DropConfig>,
    load_reporter: Option<Arc<dyn LoadReporter>>,
    child: Arc<dyn Picker>,
}

impl Picker for DropPicker {
    fn pick(&self, request: &RpcInfo) -> PickResult {
        for drop in &self.drops {
            if fastrand::u32(0..1_000_000) < drop.per_million() {
                if let Some(load_reporter) = &self.load_reporter {
                    load_reporter.call_dropped(&drop.category);
                }
                return PickResult::Drop(Status::unavailable(format!(
                    "RPC dropped by drop category {:?}",
                    drop.category
                )));
            }
        }
        self.child.pick(request)
    }
}

impl std::fmt::Debug for EdsBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdsBalancer")
            .field("priorities", &self.groups.keys().collect::<Vec<_>>())
            .field("priority_in_use", &self.priority_in_use)
            .finish_non_exhaustive()
    }
}
