//! Resource watcher types.

use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use futures_util::Stream;
use tokio::sync::mpsc;

use crate::client::worker::{WatcherId, WorkerCommand};
use crate::error::Error;
use crate::resource::{DecodedResource, Resource};

/// Events delivered to resource watchers.
#[derive(Debug)]
pub enum ResourceEvent<T> {
    /// The resource was received and validated. Delivered once per response
    /// carrying the resource, and immediately on watch if a value is cached.
    ResourceChanged(Arc<T>),
    /// The resource was not received before the watch expired, or the server
    /// removed it. Any cached value has been evicted.
    ResourceDoesNotExist,
    /// The connection to the xDS server failed. The last received value, if
    /// any, is still the best known state.
    AmbientError(Error),
}

impl<T> Clone for ResourceEvent<T> {
    fn clone(&self) -> Self {
        match self {
            Self::ResourceChanged(r) => Self::ResourceChanged(r.clone()),
            Self::ResourceDoesNotExist => Self::ResourceDoesNotExist,
            Self::AmbientError(e) => Self::AmbientError(e.clone()),
        }
    }
}

/// A watcher for resources of type `T`.
///
/// Implements [`Stream`] to receive resource events.
/// Dropping the watcher unsubscribes from the resource; no events are
/// delivered after that.
#[derive(Debug)]
pub struct ResourceWatcher<T: Resource> {
    event_rx: mpsc::Receiver<ResourceEvent<DecodedResource>>,
    watcher_id: WatcherId,
    command_tx: mpsc::UnboundedSender<WorkerCommand>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Resource> ResourceWatcher<T> {
    pub(crate) fn new(
        event_rx: mpsc::Receiver<ResourceEvent<DecodedResource>>,
        watcher_id: WatcherId,
        command_tx: mpsc::UnboundedSender<WorkerCommand>,
    ) -> Self {
        Self {
            event_rx,
            watcher_id,
            command_tx,
            _marker: PhantomData,
        }
    }

    fn convert(event: ResourceEvent<DecodedResource>) -> Option<ResourceEvent<T>> {
        Some(match event {
            ResourceEvent::ResourceChanged(decoded) => {
                ResourceEvent::ResourceChanged(decoded.downcast::<T>()?)
            }
            ResourceEvent::ResourceDoesNotExist => ResourceEvent::ResourceDoesNotExist,
            ResourceEvent::AmbientError(e) => ResourceEvent::AmbientError(e),
        })
    }
}

impl<T: Resource> Stream for ResourceWatcher<T> {
    type Item = ResourceEvent<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match ready!(self.event_rx.poll_recv(cx)) {
                Some(event) => {
                    // A decoder registered by another resource type with the
                    // same type URL would not downcast; skip its events.
                    if let Some(event) = Self::convert(event) {
                        return Poll::Ready(Some(event));
                    }
                }
                None => return Poll::Ready(None),
            }
        }
    }
}

impl<T: Resource> Drop for ResourceWatcher<T> {
    fn drop(&mut self) {
        let _ = self.command_tx.send(WorkerCommand::Unwatch {
            watcher_id: self.watcher_id,
        });
    }
}
