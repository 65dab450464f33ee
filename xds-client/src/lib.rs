//! A Rust implementation of [xDS](https://www.envoyproxy.io/docs/envoy/latest/api-docs/xds_protocol) client.
//!
//! This crate provides a protocol-agnostic xDS client. It handles:
//! - ADS stream management (connection, reconnection with backoff)
//! - Resource subscription and watching, with a per-resource cache
//! - Version/nonce tracking and ACK/NACK
//! - Expiry of resources the server never sends
//!
//! It does NOT contain gRPC-specific logic such as:
//! - LDS -> RDS -> CDS -> EDS cascading
//! - gRPC-specific resource validation
//! - Service config generation
//!
//! Instead a gRPC library can use this crate to build these features.
//!
//! # Example
//!
//! ```ignore
//! use futures_util::StreamExt;
//! use xds_client::{XdsClient, ClientConfig, Node, ResourceEvent};
//!
//! // Create node and configuration
//! let node = Node::new("grpc", "1.0").with_id("my-node");
//! let config = ClientConfig::new(node, "https://xds.example.com:443");
//!
//! // Build client with transport, codec, and runtime
//! let client = XdsClient::builder(config, transport_builder, codec, runtime).build();
//!
//! // Watch for Listener resources
//! let mut watcher = client.watch::<ListenerUpdate>("my-listener");
//! while let Some(event) = watcher.next().await {
//!     match event {
//!         ResourceEvent::ResourceChanged(listener) => {
//!             // Process the resource, possibly add cascading watches.
//!             client.watch::<RouteConfigUpdate>(listener.route_config_name());
//!         }
//!         ResourceEvent::ResourceDoesNotExist => {
//!             // The server does not know this resource.
//!         }
//!         ResourceEvent::AmbientError(error) => {
//!             // Lost contact, continue using the last resource.
//!             eprintln!("Ambient error: {error}");
//!         }
//!     }
//! }
//! ```
//!
//! # Feature Flags
//!
//! - `transport-tonic`: Enables the use of the `tonic` transport. This enables `rt-tokio` and `codegen-prost` features. Enabled by default.
//! - `rt-tokio`: Enables the use of the `tokio` runtime. Enabled by default.
//! - `codegen-prost`: Enables the use of the `prost` codec generated resources. Enabled by default.
//! - `test-util`: Enables an in-memory ADS transport for tests.

pub mod client;
pub mod codec;
pub mod error;
pub mod message;
pub mod resource;
pub mod runtime;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testutil;

pub use client::config::{ClientConfig, DEFAULT_RESOURCE_INITIAL_TIMEOUT, ServerConfig};
pub use client::retry::{Backoff, RetryPolicy};
pub use client::watch::{ResourceEvent, ResourceWatcher};
pub use client::{XdsClient, XdsClientBuilder};
pub use codec::XdsCodec;
pub use error::{Error, Result};
pub use message::{
    DiscoveryRequest, DiscoveryResponse, ErrorDetail, Locality, MetadataValue, Node, ResourceAny,
};
pub use resource::{DecodeResult, DecodedResource, Resource, type_url_suffix, type_urls_equivalent};
pub use runtime::Runtime;
pub use transport::{Transport, TransportBuilder, TransportStream};

// Tokio runtime
#[cfg(feature = "rt-tokio")]
pub use runtime::tokio::TokioRuntime;

// Tonic transport
#[cfg(feature = "transport-tonic")]
pub use transport::tonic::{TonicTransport, TonicTransportBuilder};

// Prost codec
#[cfg(feature = "codegen-prost")]
pub use codec::prost::ProstCodec;
