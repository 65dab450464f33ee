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

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::client::load_balancing::{
    ChannelController, LbState, PickResult, Subchannel, SubchannelState, WorkScheduler,
};
use crate::client::name_resolution::{Address, Endpoint};
use crate::client::{ConnectivityState, RpcInfo};

// A test subchannel that forwards connect calls to a channel.
// This allows tests to verify when a subchannel is asked to connect.
pub(crate) struct TestSubchannel {
    address: Address,
    tx_connect: mpsc::UnboundedSender<TestEvent>,
}

impl TestSubchannel {
    pub(crate) fn new(address: Address, tx_connect: mpsc::UnboundedSender<TestEvent>) -> Self {
        Self {
            address,
            tx_connect,
        }
    }
}

impl Subchannel for TestSubchannel {
    fn address(&self) -> Address {
        self.address.clone()
    }

    fn connect(&self) {
        let _ = self.tx_connect.send(TestEvent::Connect(self.address.clone()));
    }
}

pub(crate) enum TestEvent {
    NewSubchannel(Arc<dyn Subchannel>),
    RemoveSubchannel(Address),
    UpdatePicker(LbState),
    RequestResolution,
    Connect(Address),
    ScheduleWork,
}

impl Debug for TestEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewSubchannel(sc) => write!(f, "NewSubchannel({})", sc.address()),
            Self::RemoveSubchannel(addr) => write!(f, "RemoveSubchannel({addr})"),
            Self::UpdatePicker(state) => write!(f, "UpdatePicker({})", state.connectivity_state),
            Self::RequestResolution => write!(f, "RequestResolution"),
            Self::Connect(addr) => write!(f, "Connect({:?})", addr.address),
            Self::ScheduleWork => write!(f, "ScheduleWork"),
        }
    }
}

/// A test channel controller that forwards calls to a channel.  This allows
/// tests to verify when a channel controller is asked to create subchannels or
/// update the picker.
pub(crate) struct TestChannelController {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl ChannelController for TestChannelController {
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel> {
        let subchannel: Arc<dyn Subchannel> =
            Arc::new(TestSubchannel::new(address.clone(), self.tx_events.clone()));
        self.tx_events
            .send(TestEvent::NewSubchannel(subchannel.clone()))
            .unwrap();
        subchannel
    }

    fn remove_subchannel(&mut self, subchannel: &Arc<dyn Subchannel>) {
        self.tx_events
            .send(TestEvent::RemoveSubchannel(subchannel.address()))
            .unwrap();
    }

    fn update_picker(&mut self, update: LbState) {
        self.tx_events
            .send(TestEvent::UpdatePicker(update))
            .unwrap();
    }

    fn request_resolution(&mut self) {
        self.tx_events.send(TestEvent::RequestResolution).unwrap();
    }
}

pub(crate) struct TestWorkScheduler {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl WorkScheduler for TestWorkScheduler {
    fn schedule_work(&self) {
        let _ = self.tx_events.send(TestEvent::ScheduleWork);
    }
}

/// Channel controller, work scheduler and the receiving end of their events.
pub(crate) fn setup() -> (
    mpsc::UnboundedReceiver<TestEvent>,
    TestChannelController,
    Arc<TestWorkScheduler>,
) {
    let (tx_events, rx_events) = mpsc::unbounded_channel();
    let controller = TestChannelController {
        tx_events: tx_events.clone(),
    };
    let scheduler = Arc::new(TestWorkScheduler { tx_events });
    (rx_events, controller, scheduler)
}

/// Drains every event that is already queued.
pub(crate) fn drain(rx_events: &mut mpsc::UnboundedReceiver<TestEvent>) -> Vec<TestEvent> {
    let mut events = vec![];
    while let Ok(event) = rx_events.try_recv() {
        events.push(event);
    }
    events
}

/// Waits for the next event, failing the test after a second.
pub(crate) async fn next_event(rx_events: &mut mpsc::UnboundedReceiver<TestEvent>) -> TestEvent {
    tokio::time::timeout(Duration::from_secs(1), rx_events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Returns the subchannels created by `events`, in order.
pub(crate) fn new_subchannels(events: &[TestEvent]) -> Vec<Arc<dyn Subchannel>> {
    events
        .iter()
        .filter_map(|e| match e {
            TestEvent::NewSubchannel(sc) => Some(sc.clone()),
            _ => None,
        })
        .collect()
}

/// Returns the last picker update among `events`.
pub(crate) fn last_picker(events: &[TestEvent]) -> Option<LbState> {
    events.iter().rev().find_map(|e| match e {
        TestEvent::UpdatePicker(state) => Some(state.clone()),
        _ => None,
    })
}

pub(crate) fn endpoint(address: &str) -> Endpoint {
    Endpoint::new(vec![Address::tcp(address)])
}

pub(crate) fn state(connectivity_state: ConnectivityState) -> SubchannelState {
    SubchannelState::new(connectivity_state)
}

/// Picks `n` times and returns the picked addresses, or `None` for results
/// that were not picks.
pub(crate) fn pick_n(state: &LbState, n: usize) -> Vec<Option<String>> {
    let rpc = RpcInfo::new("/test.Service/Method");
    (0..n)
        .map(|_| match state.picker.pick(&rpc) {
            PickResult::Pick(pick) => Some(pick.subchannel.address().address),
            _ => None,
        })
        .collect()
}
