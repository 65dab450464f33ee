//! Crate-owned xDS message types.
//!
//! These types are codegen-agnostic and serve as the interface between
//! the xDS client logic and the codec layer. The codec converts these
//! to/from the wire format (e.g., prost/envoy-types or google-protobuf).

use std::collections::BTreeMap;

use bytes::Bytes;

/// A discovery request to send to the xDS server.
///
/// Borrows from the worker state so that building a request does not clone
/// the node or the subscription set.
#[derive(Debug, Clone)]
pub struct DiscoveryRequest<'a> {
    /// The version_info provided in the most recent successfully processed
    /// response for this type, or empty for the first request.
    pub version_info: &'a str,
    /// The node making the request.
    pub node: &'a Node,
    /// List of resource names to subscribe to.
    pub resource_names: &'a [String],
    /// Type URL of the resource being requested.
    pub type_url: &'a str,
    /// The nonce from the most recent response, or empty for the first
    /// request on a stream.
    pub response_nonce: &'a str,
    /// Error details if this is a NACK (negative acknowledgment).
    pub error_detail: Option<ErrorDetail>,
}

/// A discovery response from the xDS server.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryResponse {
    /// The version of the response data.
    pub version_info: String,
    /// The response resources wrapped as Any protos.
    pub resources: Vec<ResourceAny>,
    /// Type URL of the resources.
    pub type_url: String,
    /// Nonce for this response, to be echoed back in the next request.
    pub nonce: String,
}

/// A resource wrapped as google.protobuf.Any.
#[derive(Debug, Clone)]
pub struct ResourceAny {
    /// Type URL of the resource.
    pub type_url: String,
    /// Serialized resource bytes.
    pub value: Bytes,
}

/// Node identification for the client.
///
/// The node is sent verbatim in every discovery request.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// An opaque node identifier.
    pub id: Option<String>,
    /// The cluster the node belongs to.
    pub cluster: Option<String>,
    /// Locality specifying where the node is running.
    pub locality: Option<Locality>,
    /// Opaque metadata extending the node identifier.
    pub metadata: BTreeMap<String, MetadataValue>,
    /// Free-form string identifying the client type (e.g., "envoy", "grpc").
    pub user_agent_name: String,
    /// Version of the client.
    pub user_agent_version: String,
    /// Client features advertised to the server.
    pub client_features: Vec<String>,
}

impl Node {
    /// Create a new Node with the required user agent fields.
    ///
    /// Other fields (id, cluster, locality, metadata) can be set using
    /// builder methods.
    pub fn new(user_agent_name: impl Into<String>, user_agent_version: impl Into<String>) -> Self {
        Self {
            id: None,
            cluster: None,
            locality: None,
            metadata: BTreeMap::new(),
            user_agent_name: user_agent_name.into(),
            user_agent_version: user_agent_version.into(),
            client_features: Vec::new(),
        }
    }

    /// Set the node ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the cluster.
    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }

    /// Set the locality.
    pub fn with_locality(mut self, locality: Locality) -> Self {
        self.locality = Some(locality);
        self
    }

    /// Set the metadata map.
    pub fn with_metadata(mut self, metadata: BTreeMap<String, MetadataValue>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Add a client feature.
    pub fn with_client_feature(mut self, feature: impl Into<String>) -> Self {
        self.client_features.push(feature.into());
        self
    }
}

/// A JSON-like value carried in [`Node::metadata`].
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    /// A null value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A number.
    Number(f64),
    /// A string.
    String(String),
    /// A list of values.
    List(Vec<MetadataValue>),
    /// A nested map.
    Struct(BTreeMap<String, MetadataValue>),
}

/// Locality information identifying where a node is running.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Locality {
    /// Region the node is in.
    pub region: String,
    /// Zone within the region.
    pub zone: String,
    /// Sub-zone within the zone.
    pub sub_zone: String,
}

/// Error details for NACK responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    /// gRPC status code.
    pub code: i32,
    /// Error message.
    pub message: String,
}
