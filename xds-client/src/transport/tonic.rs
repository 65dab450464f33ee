//! `tonic` based transport implementation.
//!
//! This transport uses tonic's low-level `Grpc` client with a `BytesCodec`
//! to send and receive raw bytes, allowing the xDS client layer to handle
//! serialization/deserialization independently.

use crate::client::config::ServerConfig;
use crate::error::{Error, Result};
use crate::transport::{Transport, TransportBuilder, TransportStream};
use bytes::{Buf, BufMut, Bytes};
use http::uri::PathAndQuery;
use tokio::sync::mpsc;
use tokio_stream::StreamExt as _;
use tonic::client::Grpc;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;
use tonic::{Status, Streaming};

/// The gRPC path for the ADS StreamAggregatedResources RPC.
const ADS_PATH: &str =
    "/envoy.service.discovery.v3.AggregatedDiscoveryService/StreamAggregatedResources";

const ADS_CHANNEL_BUFFER_SIZE: usize = 16;

/// A codec that passes bytes through without serialization.
///
/// This allows us to handle serialization in the xDS client layer
/// rather than in the transport layer.
#[derive(Debug, Clone, Copy)]
struct BytesCodec;

impl Codec for BytesCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = BytesEncoder;
    type Decoder = BytesDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        BytesEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        BytesDecoder
    }
}

#[derive(Debug)]
struct BytesEncoder;

impl Encoder for BytesEncoder {
    type Item = Bytes;
    type Error = Status;

    fn encode(
        &mut self,
        item: Self::Item,
        dst: &mut EncodeBuf<'_>,
    ) -> std::result::Result<(), Self::Error> {
        dst.put_slice(&item);
        Ok(())
    }
}

#[derive(Debug)]
struct BytesDecoder;

impl Decoder for BytesDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(
        &mut self,
        src: &mut DecodeBuf<'_>,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        Ok(Some(src.copy_to_bytes(src.remaining())))
    }
}

/// Factory for creating ADS streams using tonic.
#[derive(Clone, Debug)]
pub struct TonicTransport {
    channel: Channel,
}

impl TonicTransport {
    /// Create a transport from an existing tonic [`Channel`].
    ///
    /// Use this when the channel needs settings [`TonicTransportBuilder`]
    /// does not expose, e.g. client certificates.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use tonic::transport::{Certificate, Channel, ClientTlsConfig};
    ///
    /// let tls = ClientTlsConfig::new()
    ///     .ca_certificate(Certificate::from_pem(ca_cert))
    ///     .domain_name("xds.example.com");
    ///
    /// let channel = Channel::from_static("https://xds.example.com:443")
    ///     .tls_config(tls)?
    ///     .connect()
    ///     .await?;
    ///
    /// let transport = TonicTransport::from_channel(channel);
    /// ```
    pub fn from_channel(channel: Channel) -> Self {
        Self { channel }
    }

    /// Connect to an xDS server with default settings.
    pub async fn connect(uri: impl Into<String>) -> Result<Self> {
        TonicTransportBuilder::new()
            .build(&ServerConfig::new(uri))
            .await
    }
}

/// Builder for creating [`TonicTransport`] instances, one per xDS server.
///
/// `https` servers are reached over TLS when one of the `tonic-tls-*`
/// features is enabled. Without a TLS feature they fail to connect.
///
/// # Example
///
/// ```ignore
/// use xds_client::{ClientConfig, Node, TonicTransportBuilder, XdsClient};
///
/// let transport_builder = TonicTransportBuilder::new()
///     .with_connect_timeout(Duration::from_secs(20))
///     .with_user_agent("my-app/1.0");
/// let config = ClientConfig::new(node, "https://xds.example.com:443");
/// let client = XdsClient::builder(config, transport_builder, codec, runtime).build();
/// ```
#[derive(Debug, Clone, Default)]
pub struct TonicTransportBuilder {
    connect_timeout: Option<Duration>,
    keep_alive: Option<(Duration, Duration)>,
    user_agent: Option<String>,
    #[cfg(any(feature = "tonic-tls-ring", feature = "tonic-tls-aws-lc"))]
    tls: Option<tonic::transport::ClientTlsConfig>,
}

impl TonicTransportBuilder {
    /// Create a new transport builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound how long a single connection attempt may take.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Send HTTP/2 pings every `interval`, dropping the connection when one
    /// is not answered within `timeout`. ADS streams can be quiet for a long
    /// time, so this is how a dead management server gets noticed.
    pub fn with_keep_alive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.keep_alive = Some((interval, timeout));
        self
    }

    /// Prefix for the `user-agent` header sent to the management server.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// TLS settings for `https` servers. Defaults to the enabled root stores.
    #[cfg(any(feature = "tonic-tls-ring", feature = "tonic-tls-aws-lc"))]
    pub fn with_tls_config(mut self, tls: tonic::transport::ClientTlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    fn endpoint(&self, server: &ServerConfig) -> Result<Endpoint> {
        let mut endpoint = Endpoint::from_shared(server.uri().to_string())
            .map_err(|e| Error::Connection(format!("{}: {e}", server.uri())))?
            .tcp_nodelay(true);
        if let Some(timeout) = self.connect_timeout {
            endpoint = endpoint.connect_timeout(timeout);
        }
        if let Some((interval, timeout)) = self.keep_alive {
            endpoint = endpoint
                .http2_keep_alive_interval(interval)
                .keep_alive_timeout(timeout)
                .keep_alive_while_idle(true);
        }
        if let Some(user_agent) = &self.user_agent {
            endpoint = endpoint
                .user_agent(user_agent.as_str())
                .map_err(|e| Error::Connection(e.to_string()))?;
        }
        if endpoint.uri().scheme_str() == Some("https") {
            endpoint = self.secure(endpoint)?;
        }
        Ok(endpoint)
    }

    #[cfg(any(feature = "tonic-tls-ring", feature = "tonic-tls-aws-lc"))]
    fn secure(&self, endpoint: Endpoint) -> Result<Endpoint> {
        let tls = self
            .tls
            .clone()
            .unwrap_or_else(|| tonic::transport::ClientTlsConfig::new().with_enabled_roots());
        endpoint
            .tls_config(tls)
            .map_err(|e| Error::Connection(e.to_string()))
    }

    #[cfg(not(any(feature = "tonic-tls-ring", feature = "tonic-tls-aws-lc")))]
    fn secure(&self, endpoint: Endpoint) -> Result<Endpoint> {
        Err(Error::Connection(format!(
            "{}: TLS requires the tonic-tls-ring or tonic-tls-aws-lc feature",
            endpoint.uri()
        )))
    }
}

impl TransportBuilder for TonicTransportBuilder {
    type Transport = TonicTransport;

    async fn build(&self, server: &ServerConfig) -> Result<Self::Transport> {
        let channel = self
            .endpoint(server)?
            .connect()
            .await
            .map_err(|e| Error::Connection(format!("{}: {e}", server.uri())))?;
        debug!(server = server.uri(), "connected to xDS server");
        Ok(TonicTransport::from_channel(channel))
    }
}

impl Transport for TonicTransport {
    type Stream = TonicAdsStream;

    async fn new_stream(&self, initial_requests: Vec<Bytes>) -> Result<Self::Stream> {
        let mut grpc = Grpc::new(self.channel.clone());

        grpc.ready()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        let (tx, rx) = mpsc::channel::<Bytes>(ADS_CHANNEL_BUFFER_SIZE);

        // Initial requests go first so the server sees data as soon as the
        // stream opens.
        let initial_stream = tokio_stream::iter(initial_requests);
        let channel_stream = tokio_stream::wrappers::ReceiverStream::new(rx);
        let request_stream = initial_stream.chain(channel_stream);

        let path = PathAndQuery::from_static(ADS_PATH);

        let response = grpc
            .streaming(tonic::Request::new(request_stream), path, BytesCodec)
            .await
            .map_err(Error::Stream)?;

        Ok(TonicAdsStream {
            sender: tx,
            receiver: response.into_inner(),
        })
    }
}

/// A bidirectional ADS stream backed by tonic.
#[derive(Debug)]
pub struct TonicAdsStream {
    sender: mpsc::Sender<Bytes>,
    receiver: Streaming<Bytes>,
}

impl TransportStream for TonicAdsStream {
    async fn send(&mut self, request: Bytes) -> Result<()> {
        self.sender
            .send(request)
            .await
            .map_err(|_| Error::StreamClosed)?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Bytes>> {
        match self.receiver.message().await {
            Ok(msg) => Ok(msg),
            Err(status) => Err(Error::Stream(status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::envoy::service::discovery::v3::{
        aggregated_discovery_service_server::{
            AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
        },
        DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
    };
    use prost::Message;
    use std::net::SocketAddr;
    use std::pin::Pin;
    use tokio::net::TcpListener;
    use tokio_stream::wrappers::TcpListenerStream;
    use tokio_stream::Stream;
    use tonic::{Request, Response, Status};

    /// Mock ADS server that echoes back a response for each request.
    struct MockAdsServer;

    #[tonic::async_trait]
    impl AggregatedDiscoveryService for MockAdsServer {
        type StreamAggregatedResourcesStream =
            Pin<Box<dyn Stream<Item = std::result::Result<DiscoveryResponse, Status>> + Send>>;

        async fn stream_aggregated_resources(
            &self,
            request: Request<tonic::Streaming<DiscoveryRequest>>,
        ) -> std::result::Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
            let mut inbound = request.into_inner();

            let outbound = async_stream::try_stream! {
                while let Some(req) = inbound.next().await {
                    let req = req?;
                    let response = DiscoveryResponse {
                        version_info: "1".to_string(),
                        type_url: req.type_url.clone(),
                        nonce: "nonce-1".to_string(),
                        resources: vec![],
                        ..Default::default()
                    };
                    yield response;
                }
            };

            Ok(Response::new(Box::pin(outbound)))
        }

        type DeltaAggregatedResourcesStream =
            Pin<Box<dyn Stream<Item = std::result::Result<DeltaDiscoveryResponse, Status>> + Send>>;

        async fn delta_aggregated_resources(
            &self,
            _request: Request<tonic::Streaming<DeltaDiscoveryRequest>>,
        ) -> std::result::Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
            Err(Status::unimplemented("delta not supported in mock"))
        }
    }

    async fn start_mock_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(AggregatedDiscoveryServiceServer::new(MockAdsServer))
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .unwrap();
        });

        // Give the server a moment to start
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        addr
    }

    #[tokio::test]
    async fn test_builder_rejects_malformed_uri() {
        let err = TonicTransportBuilder::new()
            .build(&ServerConfig::new("not a uri"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[cfg(not(any(feature = "tonic-tls-ring", feature = "tonic-tls-aws-lc")))]
    #[tokio::test]
    async fn test_https_without_tls_feature_fails() {
        let err = TonicTransportBuilder::new()
            .build(&ServerConfig::new("https://xds.example.com:443"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("TLS requires"), "{err}");
    }

    #[tokio::test]
    async fn test_builder_connects_with_settings() {
        let addr = start_mock_server().await;
        let transport = TonicTransportBuilder::new()
            .with_connect_timeout(Duration::from_secs(5))
            .with_keep_alive(Duration::from_secs(30), Duration::from_secs(10))
            .with_user_agent("xds-client-test")
            .build(&ServerConfig::new(format!("http://{addr}")))
            .await
            .unwrap();
        let request = DiscoveryRequest {
            type_url: "type.googleapis.com/envoy.config.cluster.v3.Cluster".to_string(),
            ..Default::default()
        };
        let mut stream = transport
            .new_stream(vec![request.encode_to_vec().into()])
            .await
            .unwrap();
        let response = DiscoveryResponse::decode(stream.recv().await.unwrap().unwrap()).unwrap();
        assert_eq!(
            response.type_url,
            "type.googleapis.com/envoy.config.cluster.v3.Cluster"
        );
    }

    #[tokio::test]
    async fn test_tonic_transport_connect_and_stream() {
        let addr = start_mock_server().await;
        let uri = format!("http://{addr}");

        let transport = TonicTransport::connect(&uri).await.unwrap();

        let request = DiscoveryRequest {
            type_url: "type.googleapis.com/envoy.config.listener.v3.Listener".to_string(),
            resource_names: vec!["listener-1".to_string()],
            ..Default::default()
        };
        let request_bytes: Bytes = request.encode_to_vec().into();

        let mut stream = transport.new_stream(vec![request_bytes]).await.unwrap();

        let response_bytes = stream.recv().await.unwrap().unwrap();
        let response = DiscoveryResponse::decode(response_bytes).unwrap();

        assert_eq!(response.version_info, "1");
        assert_eq!(
            response.type_url,
            "type.googleapis.com/envoy.config.listener.v3.Listener"
        );
        assert_eq!(response.nonce, "nonce-1");
    }
}
