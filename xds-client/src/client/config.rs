//! Configuration for the xDS client.

use std::time::Duration;

use crate::client::retry::RetryPolicy;
use crate::message::Node;

/// Default time to wait for a subscribed resource before reporting that it
/// does not exist.
pub const DEFAULT_RESOURCE_INITIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Configuration for a single xDS management server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    uri: String,
    /// Opaque server features from the bootstrap, e.g. `ignore_resource_deletion`.
    pub server_features: Vec<String>,
}

impl ServerConfig {
    /// Create a server config for the given URI.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            server_features: Vec::new(),
        }
    }

    /// Returns the server URI.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Returns true if the server advertised the given feature.
    pub fn has_feature(&self, feature: &str) -> bool {
        self.server_features.iter().any(|f| f == feature)
    }
}

/// Configuration for the xDS client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Node identification sent to the xDS server.
    pub node: Node,

    /// Priority-ordered list of xDS servers. Only the first one is used.
    pub servers: Vec<ServerConfig>,

    /// Retry policy for connection attempts.
    ///
    /// Controls the backoff behavior when reconnecting to the xDS server.
    pub retry_policy: RetryPolicy,

    /// How long a watched resource may stay unanswered before watchers are
    /// told it does not exist. `None` disables the timer.
    ///
    /// Default: 15 seconds.
    pub resource_initial_timeout: Option<Duration>,
}

impl ClientConfig {
    /// Create a new configuration with the given node identification and
    /// server URI.
    ///
    /// Uses the default retry policy.
    ///
    /// # Example
    ///
    /// ```
    /// use xds_client::{ClientConfig, Node};
    ///
    /// let node = Node::new("grpc", "1.0")
    ///     .with_id("my-node")
    ///     .with_cluster("my-cluster");
    ///
    /// let config = ClientConfig::new(node, "http://xds.example.com:18000");
    /// ```
    pub fn new(node: Node, server_uri: impl Into<String>) -> Self {
        Self::with_servers(node, vec![ServerConfig::new(server_uri)])
    }

    /// Create a new configuration with an explicit server list.
    pub fn with_servers(node: Node, servers: Vec<ServerConfig>) -> Self {
        Self {
            node,
            servers,
            retry_policy: RetryPolicy::default(),
            resource_initial_timeout: Some(DEFAULT_RESOURCE_INITIAL_TIMEOUT),
        }
    }

    /// Set the retry policy.
    ///
    /// # Example
    ///
    /// ```
    /// use xds_client::{ClientConfig, Node, RetryPolicy};
    /// use std::time::Duration;
    ///
    /// let node = Node::new("grpc", "1.0");
    /// let policy = RetryPolicy::default()
    ///     .with_initial_backoff(Duration::from_millis(500)).unwrap()
    ///     .with_max_backoff(Duration::from_secs(60)).unwrap();
    ///
    /// let config = ClientConfig::new(node, "http://localhost:18000").with_retry_policy(policy);
    /// ```
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the resource initial timeout. `None` disables it.
    pub fn with_resource_initial_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.resource_initial_timeout = timeout;
        self
    }
}
