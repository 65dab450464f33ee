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

//! The async runtime used by the resolver, the LB policies and the idleness
//! manager for background tasks and timers.
//!
//! Everything in this crate that spawns or sleeps goes through a [`Runtime`]
//! handed to it by the channel, so the channel decides which executor runs
//! xDS watches and fallback timers.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub mod tokio;

/// An abstraction over an asynchronous runtime.
pub trait Runtime: Send + Sync {
    /// Spawns the given asynchronous task to run in the background.
    fn spawn(&self, task: Pin<Box<dyn Future<Output = ()> + Send + 'static>>) -> BoxedTaskHandle;

    /// Returns a future that completes after the specified duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Sleep>>;
}

/// A future that resolves after a specified duration.
pub trait Sleep: Send + Sync + Future<Output = ()> {}

/// A handle to a task started with [`Runtime::spawn`]. Dropping the handle
/// detaches the task.
pub trait TaskHandle: Send + Sync {
    /// Abort the associated task.
    fn abort(&self);
}

pub type BoxedTaskHandle = Box<dyn TaskHandle>;

/// Returns the runtime used when the channel does not supply one.
pub fn default_runtime() -> Arc<dyn Runtime> {
    Arc::new(self::tokio::TokioRuntime::default())
}

/// Lets an `xds-client` worker run on a channel's [`Runtime`].
#[derive(Clone)]
pub struct XdsClientRuntime {
    inner: Arc<dyn Runtime>,
}

impl XdsClientRuntime {
    pub fn new(inner: Arc<dyn Runtime>) -> Self {
        Self { inner }
    }
}

impl fmt::Debug for XdsClientRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XdsClientRuntime").finish_non_exhaustive()
    }
}

impl xds_client::Runtime for XdsClientRuntime {
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // The worker stops when its client is dropped; the handle is not kept.
        let _ = self.inner.spawn(Box::pin(future));
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        self.inner.sleep(duration)
    }
}

/// A tokio runtime that counts what it was asked to do.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct CountingRuntime {
    inner: self::tokio::TokioRuntime,
    pub(crate) spawns: std::sync::atomic::AtomicUsize,
    pub(crate) sleeps: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl CountingRuntime {
    pub(crate) fn spawned(&self) -> usize {
        self.spawns.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub(crate) fn slept(&self) -> usize {
        self.sleeps.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl Runtime for CountingRuntime {
    fn spawn(&self, task: Pin<Box<dyn Future<Output = ()> + Send + 'static>>) -> BoxedTaskHandle {
        self.spawns
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.inner.spawn(task)
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Sleep>> {
        self.sleeps
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.inner.sleep(duration)
    }
}
