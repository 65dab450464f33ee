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

//! The `round_robin` LB policy: one subchannel per address, picks rotate over
//! the Ready ones.
//!
//! Used as the default locality policy under EDS and as the default fallback
//! policy of the xDS balancer.

use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use indexmap::IndexMap;
use tracing::debug;

use crate::client::ConnectivityState;
use crate::client::load_balancing::{
    ChannelController, GLOBAL_LB_REGISTRY, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState,
    Pick, PickResult, Picker, QueuingPicker, Subchannel, SubchannelState,
};
use crate::client::name_resolution::{Address, ResolverUpdate};
use crate::client::service_config::LbConfig;

pub static POLICY_NAME: &str = "round_robin";
static START: Once = Once::new();

#[derive(Debug)]
pub(crate) struct RoundRobinBuilder {}

impl LbPolicyBuilder for RoundRobinBuilder {
    fn build(&self, _options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(RoundRobinPolicy::default())
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }
}

struct SubchannelEntry {
    subchannel: Arc<dyn Subchannel>,
    state: ConnectivityState,
}

#[derive(Default)]
struct RoundRobinPolicy {
    subchannels: IndexMap<Address, SubchannelEntry>,
    // What was last sent to the channel: the state and, when Ready, the
    // addresses the picker rotates over.
    published: Option<(ConnectivityState, Vec<Address>)>,
}

impl RoundRobinPolicy {
    fn aggregate_state(&self) -> ConnectivityState {
        let states = || self.subchannels.values().map(|e| e.state);
        if states().any(|s| s == ConnectivityState::Ready) {
            ConnectivityState::Ready
        } else if states().any(|s| {
            matches!(s, ConnectivityState::Connecting | ConnectivityState::Idle)
        }) {
            ConnectivityState::Connecting
        } else {
            ConnectivityState::TransientFailure
        }
    }

    fn send_picker(&mut self, channel_controller: &mut dyn ChannelController) {
        let state = self.aggregate_state();
        let ready: Vec<&SubchannelEntry> = self
            .subchannels
            .values()
            .filter(|e| e.state == ConnectivityState::Ready)
            .collect();
        let ready_addresses: Vec<Address> = ready.iter().map(|e| e.subchannel.address()).collect();
        let published = (state, ready_addresses);
        if self.published.as_ref() == Some(&published) {
            return;
        }

        let update = match state {
            ConnectivityState::Ready => LbState {
                connectivity_state: state,
                picker: Arc::new(RoundRobinPicker::new(
                    ready.iter().map(|e| e.subchannel.clone()).collect(),
                )),
            },
            ConnectivityState::TransientFailure => {
                channel_controller.request_resolution();
                LbState::transient_failure("all subchannels are in transient failure")
            }
            _ => LbState {
                connectivity_state: ConnectivityState::Connecting,
                picker: Arc::new(QueuingPicker {}),
            },
        };
        debug!(state = %update.connectivity_state, "round_robin: publishing picker");
        self.published = Some(published);
        channel_controller.update_picker(update);
    }

    fn move_to_transient_failure(
        &mut self,
        channel_controller: &mut dyn ChannelController,
        error: &str,
    ) {
        self.published = Some((ConnectivityState::TransientFailure, vec![]));
        channel_controller.update_picker(LbState::transient_failure(error));
        channel_controller.request_resolution();
    }

    fn remove_all(&mut self, channel_controller: &mut dyn ChannelController) {
        for (_, entry) in self.subchannels.drain(..) {
            channel_controller.remove_subchannel(&entry.subchannel);
        }
    }
}

impl LbPolicy for RoundRobinPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        _config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let endpoints = match update.endpoints {
            Ok(endpoints) => endpoints,
            Err(error) => {
                // Keep using the previous addresses if there are any.
                if self.subchannels.is_empty() {
                    self.move_to_transient_failure(channel_controller, &error);
                }
                return Err(error.into());
            }
        };

        let mut addresses: Vec<Address> = vec![];
        for address in endpoints.into_iter().flat_map(|ep| ep.addresses) {
            if !addresses.contains(&address) {
                addresses.push(address);
            }
        }
        if addresses.is_empty() {
            self.remove_all(channel_controller);
            let error = "received empty address list from the name resolver";
            self.move_to_transient_failure(channel_controller, error);
            return Err(error.into());
        }

        let mut old = std::mem::take(&mut self.subchannels);
        for address in addresses {
            let entry = match old.swap_remove(&address) {
                Some(entry) => entry,
                None => {
                    let subchannel = channel_controller.new_subchannel(&address);
                    subchannel.connect();
                    SubchannelEntry {
                        subchannel,
                        state: ConnectivityState::Idle,
                    }
                }
            };
            self.subchannels.insert(address, entry);
        }
        for (_, entry) in old {
            channel_controller.remove_subchannel(&entry.subchannel);
        }

        self.send_picker(channel_controller);
        Ok(())
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(entry) = self
            .subchannels
            .get_mut(&subchannel.address())
            .filter(|e| Arc::ptr_eq(&e.subchannel, &subchannel))
        else {
            // A subchannel we already removed.
            return;
        };
        if state.connectivity_state == ConnectivityState::Shutdown {
            return;
        }
        entry.state = state.connectivity_state;
        if state.connectivity_state == ConnectivityState::Idle {
            entry.subchannel.connect();
        }
        self.send_picker(channel_controller);
    }

    fn work(&mut self, _channel_controller: &mut dyn ChannelController) {}

    fn exit_idle(&mut self, _channel_controller: &mut dyn ChannelController) {
        for entry in self.subchannels.values() {
            if entry.state == ConnectivityState::Idle {
                entry.subchannel.connect();
            }
        }
    }

    fn close(&mut self, channel_controller: &mut dyn ChannelController) {
        self.remove_all(channel_controller);
        self.published = None;
    }
}

/// Rotates over a fixed set of Ready subchannels, starting at a random one.
struct RoundRobinPicker {
    subchannels: Vec<Arc<dyn Subchannel>>,
    next: AtomicUsize,
}

impl RoundRobinPicker {
    fn new(subchannels: Vec<Arc<dyn Subchannel>>) -> Self {
        let next = fastrand::usize(..subchannels.len().max(1));
        Self {
            subchannels,
            next: AtomicUsize::new(next),
        }
    }
}

impl Picker for RoundRobinPicker {
    fn pick(&self, _request: &crate::client::RpcInfo) -> PickResult {
        if self.subchannels.is_empty() {
            return PickResult::Queue;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.subchannels.len();
        PickResult::Pick(Pick::new(self.subchannels[idx].clone()))
    }
}

/// Registers the `round_robin` policy in the global registry.
pub fn reg() {
    START.call_once(|| {
        GLOBAL_LB_REGISTRY.add_builder(RoundRobinBuilder {});
    });
}
