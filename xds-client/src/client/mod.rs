//! Client interface through which the user can watch and receive updates for xDS resources.

use tokio::sync::mpsc;

use crate::client::config::ClientConfig;
use crate::client::watch::ResourceWatcher;
use crate::client::worker::{AdsWorker, WatcherId, WorkerCommand};
use crate::codec::XdsCodec;
use crate::resource::{Resource, decoder_for};
use crate::runtime::Runtime;
use crate::transport::TransportBuilder;

pub mod config;
pub mod retry;
pub mod watch;
pub(crate) mod worker;

/// Builder for [`XdsClient`].
#[derive(Debug)]
pub struct XdsClientBuilder<TB, C, R> {
    config: ClientConfig,
    transport_builder: TB,
    codec: C,
    runtime: R,
}

impl<TB, C, R> XdsClientBuilder<TB, C, R>
where
    TB: TransportBuilder,
    C: XdsCodec,
    R: Runtime,
{
    /// Create a new builder with the given configuration, transport builder,
    /// codec, and runtime.
    pub fn new(config: ClientConfig, transport_builder: TB, codec: C, runtime: R) -> Self {
        Self {
            config,
            transport_builder,
            codec,
            runtime,
        }
    }

    /// Build the client and start the background worker.
    ///
    /// This spawns a background task that manages the ADS stream.
    /// The task runs until all `XdsClient` handles and watchers are dropped.
    pub fn build(self) -> XdsClient {
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let worker = AdsWorker::new(
            self.transport_builder,
            self.codec,
            self.runtime.clone(),
            self.config,
            command_tx.downgrade(),
            command_rx,
        );

        self.runtime.spawn(async move {
            worker.run().await;
        });

        XdsClient { command_tx }
    }
}

/// The xDS client.
///
/// This is a handle to the background worker that manages the ADS stream.
/// Cloning this handle creates a new reference to the same worker.
///
/// When all `XdsClient` handles and watchers are dropped, the background
/// worker shuts down.
#[derive(Clone, Debug)]
pub struct XdsClient {
    /// Channel to send commands to the worker.
    command_tx: mpsc::UnboundedSender<WorkerCommand>,
}

/// Default buffer size for watcher event channels.
///
/// This provides backpressure when watchers are slow to process events.
const WATCHER_CHANNEL_BUFFER_SIZE: usize = 16;

impl XdsClient {
    /// Create a new builder with the given configuration, transport builder,
    /// codec, and runtime.
    pub fn builder<TB, C, R>(
        config: ClientConfig,
        transport_builder: TB,
        codec: C,
        runtime: R,
    ) -> XdsClientBuilder<TB, C, R>
    where
        TB: TransportBuilder,
        C: XdsCodec,
        R: Runtime,
    {
        XdsClientBuilder::new(config, transport_builder, codec, runtime)
    }

    /// Watch a resource by name.
    ///
    /// Returns a [`ResourceWatcher`] that receives events for this resource.
    /// If the resource is cached, its value is the first event. Dropping the
    /// watcher automatically unsubscribes.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut watcher = client.watch::<ListenerUpdate>("my-listener");
    /// while let Some(event) = watcher.next().await {
    ///     match event {
    ///         ResourceEvent::ResourceChanged(listener) => {
    ///             println!("Listener changed: {listener:?}");
    ///         }
    ///         ResourceEvent::ResourceDoesNotExist => {
    ///             println!("Listener does not exist");
    ///         }
    ///         ResourceEvent::AmbientError(error) => {
    ///             println!("Lost contact with the server: {error}");
    ///         }
    ///     }
    /// }
    /// ```
    pub fn watch<T: Resource>(&self, name: impl Into<String>) -> ResourceWatcher<T> {
        let watcher_id = WatcherId::new();
        let (event_tx, event_rx) = mpsc::channel(WATCHER_CHANNEL_BUFFER_SIZE);

        let _ = self.command_tx.send(WorkerCommand::Watch {
            type_url: T::TYPE_URL,
            name: name.into(),
            watcher_id,
            event_tx,
            decoder: decoder_for::<T>(),
            all_resources_required_in_sotw: T::ALL_RESOURCES_REQUIRED_IN_SOTW,
        });

        ResourceWatcher::new(event_rx, watcher_id, self.command_tx.clone())
    }
}
