//! In-memory ADS transport for tests.
//!
//! [`mock_ads`] returns a [`TransportBuilder`] to hand to the client and a
//! [`MockAdsServer`] handle that plays the management server: it observes
//! every request the client sends, pushes responses, breaks streams and can
//! refuse connections.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use envoy_types::pb::envoy::service::discovery::v3 as discovery;
use envoy_types::pb::google::protobuf::Any;
use prost::Message;
use tokio::sync::mpsc;

use crate::client::config::ServerConfig;
use crate::error::{Error, Result};
use crate::transport::{Transport, TransportBuilder, TransportStream};

/// A request observed by the mock server, tagged with the stream it arrived on.
#[derive(Debug, Clone)]
pub struct MockRequest {
    /// 1-based index of the stream.
    pub stream: usize,
    /// The decoded request.
    pub request: discovery::DiscoveryRequest,
}

#[derive(Debug)]
struct Shared {
    reachable: bool,
    streams: usize,
    current: Option<mpsc::UnboundedSender<Result<Bytes>>>,
    request_tx: mpsc::UnboundedSender<MockRequest>,
    connected_uris: Vec<String>,
}

/// Create a connected mock transport builder and server handle.
pub fn mock_ads() -> (MockTransportBuilder, MockAdsServer) {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Mutex::new(Shared {
        reachable: true,
        streams: 0,
        current: None,
        request_tx,
        connected_uris: Vec::new(),
    }));
    (
        MockTransportBuilder {
            shared: shared.clone(),
        },
        MockAdsServer { shared, request_rx },
    )
}

/// [`TransportBuilder`] side of the mock.
#[derive(Debug, Clone)]
pub struct MockTransportBuilder {
    shared: Arc<Mutex<Shared>>,
}

impl TransportBuilder for MockTransportBuilder {
    type Transport = MockTransport;

    async fn build(&self, server: &ServerConfig) -> Result<Self::Transport> {
        let mut shared = self.shared.lock().unwrap();
        shared.connected_uris.push(server.uri().to_owned());
        if !shared.reachable {
            return Err(Error::Connection(format!("{} is unreachable", server.uri())));
        }
        Ok(MockTransport {
            shared: self.shared.clone(),
        })
    }
}

/// A connection produced by [`MockTransportBuilder`].
#[derive(Debug)]
pub struct MockTransport {
    shared: Arc<Mutex<Shared>>,
}

impl Transport for MockTransport {
    type Stream = MockStream;

    async fn new_stream(&self, initial_requests: Vec<Bytes>) -> Result<Self::Stream> {
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let mut shared = self.shared.lock().unwrap();
        if !shared.reachable {
            return Err(Error::Connection("server went away".into()));
        }
        shared.streams += 1;
        shared.current = Some(response_tx);
        let mut stream = MockStream {
            stream: shared.streams,
            request_tx: shared.request_tx.clone(),
            response_rx,
        };
        drop(shared);
        for request in initial_requests {
            stream.record(request)?;
        }
        Ok(stream)
    }
}

/// One ADS stream of the mock.
#[derive(Debug)]
pub struct MockStream {
    stream: usize,
    request_tx: mpsc::UnboundedSender<MockRequest>,
    response_rx: mpsc::UnboundedReceiver<Result<Bytes>>,
}

impl MockStream {
    fn record(&mut self, request: Bytes) -> Result<()> {
        let request = discovery::DiscoveryRequest::decode(request)?;
        let _ = self.request_tx.send(MockRequest {
            stream: self.stream,
            request,
        });
        Ok(())
    }
}

impl TransportStream for MockStream {
    async fn send(&mut self, request: Bytes) -> Result<()> {
        self.record(request)
    }

    async fn recv(&mut self) -> Result<Option<Bytes>> {
        match self.response_rx.recv().await {
            Some(Ok(bytes)) => Ok(Some(bytes)),
            Some(Err(e)) => Err(e),
            None => Err(Error::StreamClosed),
        }
    }
}

/// Management-server side of the mock.
#[derive(Debug)]
pub struct MockAdsServer {
    shared: Arc<Mutex<Shared>>,
    request_rx: mpsc::UnboundedReceiver<MockRequest>,
}

impl MockAdsServer {
    /// Wait for the next request from the client.
    pub async fn next_request(&mut self) -> MockRequest {
        self.request_rx
            .recv()
            .await
            .expect("mock ADS transport dropped")
    }

    /// Returns the next request if one is already queued.
    pub fn try_next_request(&mut self) -> Option<MockRequest> {
        self.request_rx.try_recv().ok()
    }

    /// Send a response on the current stream. Returns false if no stream is open.
    pub fn send_response(&self, response: discovery::DiscoveryResponse) -> bool {
        let shared = self.shared.lock().unwrap();
        match &shared.current {
            Some(tx) => tx.send(Ok(response.encode_to_vec().into())).is_ok(),
            None => false,
        }
    }

    /// Send `resources` as a response of `type_url`.
    pub fn respond<M: Message>(&self, type_url: &str, version: &str, nonce: &str, resources: &[M]) -> bool {
        self.send_response(discovery::DiscoveryResponse {
            version_info: version.to_owned(),
            type_url: type_url.to_owned(),
            nonce: nonce.to_owned(),
            resources: resources.iter().map(|r| to_any(type_url, r)).collect(),
            ..Default::default()
        })
    }

    /// Fail the current stream.
    pub fn break_stream(&self) {
        if let Some(tx) = self.shared.lock().unwrap().current.take() {
            let _ = tx.send(Err(Error::Connection("stream broken by test".into())));
        }
    }

    /// Control whether new connections and streams succeed.
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.lock().unwrap().reachable = reachable;
    }

    /// Number of streams opened so far.
    pub fn stream_count(&self) -> usize {
        self.shared.lock().unwrap().streams
    }

    /// Server URIs the client tried to connect to, in order.
    pub fn connected_uris(&self) -> Vec<String> {
        self.shared.lock().unwrap().connected_uris.clone()
    }
}

/// Wrap a message as `google.protobuf.Any`.
pub fn to_any<M: Message>(type_url: &str, message: &M) -> Any {
    Any {
        type_url: type_url.to_owned(),
        value: message.encode_to_vec(),
    }
}
