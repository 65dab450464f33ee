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

//! Channel idleness.
//!
//! An [`IdlenessManager`] moves the channel into idle mode once no RPC has
//! been active for the configured timeout, and out of it when the next RPC
//! begins. The per-call path is lock-free while the channel is active: the
//! count of active calls doubles as the idle flag by dropping to
//! `-i32::MAX` while the channel is idle or about to become idle. Only a call
//! that observes a non-positive count takes the lock, which it shares with
//! the timer's enter-idle path.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::XdsError;
use crate::rt::Runtime;

/// The channel side of idleness.
pub trait IdlenessEnforcer: Send + Sync {
    /// Tears down the name resolver, LB policy and connections.
    fn enter_idle_mode(&self);

    /// Recreates what [`IdlenessEnforcer::enter_idle_mode`] tore down.
    fn exit_idle_mode(&self) -> Result<(), XdsError>;
}

pub struct IdlenessManager {
    inner: Arc<Inner>,
}

struct Inner {
    enforcer: Arc<dyn IdlenessEnforcer>,
    runtime: Arc<dyn Runtime>,
    timeout: Duration,
    epoch: Instant,

    active_calls: AtomicI32,
    active_since_last_check: AtomicBool,
    // Nanoseconds since `epoch`.
    last_call_end: AtomicU64,
    closed: AtomicBool,

    state: Mutex<IdleState>,
}

#[derive(Default)]
struct IdleState {
    idle: bool,
    timer: Option<CancellationToken>,
}

impl IdlenessManager {
    /// Creates a manager for an active channel and starts its timer on
    /// `runtime`. A zero `timeout` disables idleness.
    pub fn new(
        enforcer: Arc<dyn IdlenessEnforcer>,
        timeout: Duration,
        runtime: Arc<dyn Runtime>,
    ) -> Self {
        let inner = Arc::new(Inner {
            enforcer,
            runtime,
            timeout,
            epoch: Instant::now(),
            active_calls: AtomicI32::new(0),
            active_since_last_check: AtomicBool::new(false),
            last_call_end: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            state: Mutex::default(),
        });
        if !timeout.is_zero() {
            let mut state = inner.state.lock().unwrap();
            Inner::reset_timer(&inner, &mut state, timeout);
        }
        Self { inner }
    }

    fn disabled(&self) -> bool {
        self.inner.timeout.is_zero() || self.inner.closed.load(Ordering::Acquire)
    }

    /// Called before an RPC starts. Takes the channel out of idle mode when
    /// needed; the RPC must fail if this does.
    pub fn on_call_begin(&self) -> Result<(), XdsError> {
        if self.disabled() {
            return Ok(());
        }
        if self.inner.active_calls.fetch_add(1, Ordering::AcqRel) + 1 > 0 {
            self.inner
                .active_since_last_check
                .store(true, Ordering::Release);
            return Ok(());
        }

        // Idle, or the timer is about to make it so.
        if let Err(error) = self.exit_idle_mode() {
            self.inner.active_calls.fetch_sub(1, Ordering::AcqRel);
            return Err(error);
        }
        self.inner
            .active_since_last_check
            .store(true, Ordering::Release);
        Ok(())
    }

    /// Called once an RPC is done.
    pub fn on_call_end(&self) {
        if self.disabled() {
            return;
        }
        let now = self.inner.epoch.elapsed().as_nanos() as u64;
        self.inner.last_call_end.store(now, Ordering::Release);
        let active = self.inner.active_calls.fetch_sub(1, Ordering::AcqRel) - 1;
        if active < -i32::MAX {
            error!(active, "idleness: active call count went negative");
        }
    }

    /// Leaves idle mode if the channel is in it.
    pub fn exit_idle_mode(&self) -> Result<(), XdsError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().unwrap();
        // Several calls can race here after observing a negative count, or
        // the timer may have aborted entering idle before taking the lock.
        // Only the first exit of an idle channel does anything.
        if inner.closed.load(Ordering::Acquire) || !state.idle {
            return Ok(());
        }
        inner.enforcer.exit_idle_mode()?;
        inner.active_calls.fetch_add(i32::MAX, Ordering::AcqRel);
        state.idle = false;
        debug!("idleness: channel is active");
        Inner::reset_timer(inner, &mut state, inner.timeout);
        Ok(())
    }

    pub fn is_idle(&self) -> bool {
        self.inner.state.lock().unwrap().idle
    }

    /// Stops the timer. Later calls into the manager do nothing.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let mut state = self.inner.state.lock().unwrap();
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
    }
}

impl Drop for IdlenessManager {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    // Replaces the running timer with one that fires after `delay`.
    fn reset_timer(this: &Arc<Self>, state: &mut IdleState, delay: Duration) {
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
        if this.closed.load(Ordering::Acquire) {
            return;
        }
        let cancel = CancellationToken::new();
        state.timer = Some(cancel.clone());
        let weak = Arc::downgrade(this);
        let runtime = this.runtime.clone();
        let _ = this
            .runtime
            .spawn(Box::pin(run_timer(weak, runtime, cancel, delay)));
    }

    // Returns the delay until the next check, or `None` once idle.
    fn handle_timeout(&self) -> Option<Duration> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        if self.active_calls.load(Ordering::Acquire) > 0 {
            return Some(self.timeout);
        }
        if self.active_since_last_check.swap(false, Ordering::AcqRel) {
            // Activity since the last check: wait out the timeout from the
            // end of the last call.
            let last_end = Duration::from_nanos(self.last_call_end.load(Ordering::Acquire));
            let deadline = self.epoch + last_end + self.timeout;
            return Some(deadline.saturating_duration_since(Instant::now()));
        }

        if self
            .active_calls
            .compare_exchange(0, -i32::MAX, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Some(self.timeout);
        }
        if !self.try_enter_idle() {
            // A call slipped in between the checks and the swap.
            self.active_calls.fetch_add(i32::MAX, Ordering::AcqRel);
            return Some(self.timeout);
        }
        None
    }

    fn try_enter_idle(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if self.active_calls.load(Ordering::Acquire) != -i32::MAX
            || self.active_since_last_check.load(Ordering::Acquire)
            || self.closed.load(Ordering::Acquire)
        {
            return false;
        }
        self.enforcer.enter_idle_mode();
        state.idle = true;
        state.timer = None;
        debug!("idleness: channel is idle");
        true
    }
}

async fn run_timer(
    inner: Weak<Inner>,
    runtime: Arc<dyn Runtime>,
    cancel: CancellationToken,
    mut delay: Duration,
) {
    loop {
        tokio::select! {
            _ = runtime.sleep(delay) => {}
            _ = cancel.cancelled() => return,
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match inner.handle_timeout() {
            Some(next) => delay = next,
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rt::{CountingRuntime, default_runtime};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct TestEnforcer {
        entered: AtomicUsize,
        exited: AtomicUsize,
        fail_exit: AtomicBool,
    }

    impl IdlenessEnforcer for TestEnforcer {
        fn enter_idle_mode(&self) {
            self.entered.fetch_add(1, Ordering::SeqCst);
        }

        fn exit_idle_mode(&self) -> Result<(), XdsError> {
            if self.fail_exit.load(Ordering::SeqCst) {
                return Err(XdsError::TransientFailure("resolver failed".into()));
            }
            self.exited.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn manager(timeout_ms: u64) -> (IdlenessManager, Arc<TestEnforcer>) {
        let enforcer = Arc::new(TestEnforcer::default());
        let manager = IdlenessManager::new(
            enforcer.clone(),
            Duration::from_millis(timeout_ms),
            default_runtime(),
        );
        (manager, enforcer)
    }

    async fn sleep_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn timer_runs_on_the_given_runtime() {
        let runtime = Arc::new(CountingRuntime::default());
        let enforcer = Arc::new(TestEnforcer::default());
        let manager =
            IdlenessManager::new(enforcer.clone(), Duration::from_millis(50), runtime.clone());
        sleep_ms(60).await;
        assert!(manager.is_idle());
        assert_eq!(runtime.spawned(), 1);
        assert!(runtime.slept() >= 1);

        manager.on_call_begin().unwrap();
        assert_eq!(runtime.spawned(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn enters_idle_without_calls() {
        let (manager, enforcer) = manager(50);
        sleep_ms(45).await;
        assert!(!manager.is_idle());
        sleep_ms(10).await;
        assert!(manager.is_idle());
        assert_eq!(enforcer.entered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn call_in_flight_defers_idle_until_timeout_after_it_ends() {
        let (manager, enforcer) = manager(50);
        manager.on_call_begin().unwrap();

        // The timer fires at 50ms with the call in flight.
        sleep_ms(70).await;
        assert!(!manager.is_idle());
        manager.on_call_end();

        // The check at 100ms sees the call and waits until 70ms + 50ms.
        sleep_ms(45).await;
        assert!(!manager.is_idle());
        sleep_ms(10).await;
        assert!(manager.is_idle());
        assert_eq!(enforcer.entered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn call_exits_idle_and_restarts_timer() {
        let (manager, enforcer) = manager(50);
        sleep_ms(60).await;
        assert!(manager.is_idle());

        manager.on_call_begin().unwrap();
        assert!(!manager.is_idle());
        assert_eq!(enforcer.exited.load(Ordering::SeqCst), 1);
        assert_eq!(manager.inner.active_calls.load(Ordering::SeqCst), 1);
        manager.on_call_end();

        // A concurrent caller racing the first one does not exit again.
        manager.exit_idle_mode().unwrap();
        assert_eq!(enforcer.exited.load(Ordering::SeqCst), 1);

        sleep_ms(120).await;
        assert!(manager.is_idle());
        assert_eq!(enforcer.entered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_exit_fails_the_call() {
        let (manager, enforcer) = manager(50);
        sleep_ms(60).await;
        enforcer.fail_exit.store(true, Ordering::SeqCst);
        assert!(manager.on_call_begin().is_err());
        assert!(manager.is_idle());
        assert_eq!(manager.inner.active_calls.load(Ordering::SeqCst), -i32::MAX);

        enforcer.fail_exit.store(false, Ordering::SeqCst);
        manager.on_call_begin().unwrap();
        assert_eq!(manager.inner.active_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn call_racing_the_timer_aborts_idle() {
        let (manager, enforcer) = manager(50);
        // A call begins after the timer swapped in the sentinel but before it
        // took the lock.
        manager
            .inner
            .active_calls
            .store(-i32::MAX, Ordering::SeqCst);
        manager.on_call_begin().unwrap();
        assert!(!manager.inner.try_enter_idle());
        manager.inner.active_calls.fetch_add(i32::MAX, Ordering::SeqCst);

        assert_eq!(manager.inner.active_calls.load(Ordering::SeqCst), 1);
        assert!(!manager.is_idle());
        assert_eq!(enforcer.entered.load(Ordering::SeqCst), 0);
        assert_eq!(enforcer.exited.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_disables_idleness() {
        let (manager, enforcer) = manager(0);
        manager.on_call_begin().unwrap();
        manager.on_call_end();
        sleep_ms(1000).await;
        assert!(!manager.is_idle());
        assert_eq!(manager.inner.active_calls.load(Ordering::SeqCst), 0);
        assert_eq!(enforcer.entered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_stops_the_timer() {
        let (manager, enforcer) = manager(50);
        manager.close();
        manager.on_call_begin().unwrap();
        sleep_ms(200).await;
        assert!(!manager.is_idle());
        assert_eq!(manager.inner.active_calls.load(Ordering::SeqCst), 0);
        assert_eq!(enforcer.entered.load(Ordering::SeqCst), 0);
    }
}
