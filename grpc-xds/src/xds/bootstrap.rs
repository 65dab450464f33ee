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

//! The xDS bootstrap config.
//!
//! The bootstrap JSON names the management servers to talk to and the node
//! identity to present to them. It is read from the file named by
//! `GRPC_XDS_BOOTSTRAP`, or from the contents of `GRPC_XDS_BOOTSTRAP_CONFIG`.
//!
//! ```json
//! {
//!   "xds_servers": [{
//!     "server_uri": "xds.example.com:443",
//!     "channel_creds": [{"type": "google_default"}],
//!     "server_features": ["xds_v3"]
//!   }],
//!   "node": {
//!     "id": "projects/1/networks/default/nodes/abc",
//!     "cluster": "frontend",
//!     "metadata": {"TRAFFICDIRECTOR_NETWORK_NAME": "default"},
//!     "locality": {"region": "us-east1", "zone": "us-east1-b"}
//!   }
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Deserialize;
use tracing::debug;
use xds_client::{ClientConfig, Locality, MetadataValue, Node, ServerConfig};

use crate::error::XdsError;

pub const BOOTSTRAP_FILE_ENV: &str = "GRPC_XDS_BOOTSTRAP";
pub const BOOTSTRAP_CONFIG_ENV: &str = "GRPC_XDS_BOOTSTRAP_CONFIG";

const USER_AGENT_NAME: &str = "gRPC Rust";
const USER_AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Locality weights are applied as sent, without overprovisioning.
const CLIENT_FEATURE_NO_OVERPROVISIONING: &str = "envoy.lb.does_not_support_overprovisioning";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Bootstrap {
    pub xds_servers: Vec<XdsServer>,
    #[serde(default)]
    pub node: Option<NodeConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct XdsServer {
    pub server_uri: String,
    #[serde(default)]
    pub channel_creds: Vec<ChannelCreds>,
    #[serde(default)]
    pub server_features: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChannelCreds {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub locality: Option<LocalityConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LocalityConfig {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub sub_zone: String,
}

const SUPPORTED_CREDS: [&str; 3] = ["insecure", "google_default", "tls"];

impl Bootstrap {
    /// Reads the bootstrap config named by the environment. `Ok(None)` when
    /// neither variable is set.
    pub fn from_env() -> Result<Option<Self>, XdsError> {
        if let Ok(path) = std::env::var(BOOTSTRAP_FILE_ENV) {
            return Self::from_file(path).map(Some);
        }
        if let Ok(json) = std::env::var(BOOTSTRAP_CONFIG_ENV) {
            return Self::parse(&json).map(Some);
        }
        Ok(None)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, XdsError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "reading xDS bootstrap");
        let json = std::fs::read_to_string(path).map_err(|e| {
            XdsError::InvalidConfig(format!("bootstrap file {}: {e}", path.display()))
        })?;
        Self::parse(&json)
    }

    pub fn parse(json: &str) -> Result<Self, XdsError> {
        let bootstrap: Bootstrap = serde_json::from_str(json)
            .map_err(|e| XdsError::InvalidConfig(format!("bootstrap: {e}")))?;
        if bootstrap.xds_servers.is_empty() {
            return Err(XdsError::InvalidConfig(
                "bootstrap: xds_servers is empty".into(),
            ));
        }
        for server in &bootstrap.xds_servers {
            if server.server_uri.is_empty() {
                return Err(XdsError::InvalidConfig(
                    "bootstrap: server_uri is empty".into(),
                ));
            }
            if !server.channel_creds.is_empty()
                && !server
                    .channel_creds
                    .iter()
                    .any(|c| SUPPORTED_CREDS.contains(&c.kind.as_str()))
            {
                return Err(XdsError::InvalidConfig(format!(
                    "bootstrap: no supported channel_creds for {}",
                    server.server_uri
                )));
            }
        }
        Ok(bootstrap)
    }

    /// The node to present when no bootstrap config names one.
    pub fn default_node() -> Node {
        Node::new(USER_AGENT_NAME, USER_AGENT_VERSION)
            .with_client_feature(CLIENT_FEATURE_NO_OVERPROVISIONING)
    }

    pub fn node(&self) -> Node {
        let mut node = Self::default_node();
        let Some(config) = &self.node else {
            return node;
        };
        node.id = config.id.clone();
        node.cluster = config.cluster.clone();
        node.locality = config.locality.as_ref().map(|l| Locality {
            region: l.region.clone(),
            zone: l.zone.clone(),
            sub_zone: l.sub_zone.clone(),
        });
        node.metadata = config
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), metadata_value(v)))
            .collect();
        node
    }

    /// The xDS client config: this node and every server, in order.
    pub fn client_config(&self) -> ClientConfig {
        let servers = self
            .xds_servers
            .iter()
            .map(|s| {
                let mut server = ServerConfig::new(server_uri(s));
                server.server_features = s.server_features.clone();
                server
            })
            .collect();
        ClientConfig::with_servers(self.node(), servers)
    }
}

// Channel credentials other than `insecure` select TLS.
fn server_uri(server: &XdsServer) -> String {
    if server.server_uri.contains("://") {
        return server.server_uri.clone();
    }
    let secure = server
        .channel_creds
        .iter()
        .find(|c| SUPPORTED_CREDS.contains(&c.kind.as_str()))
        .is_some_and(|c| c.kind != "insecure");
    let scheme = if secure { "https" } else { "http" };
    format!("{scheme}://{}", server.server_uri)
}

fn metadata_value(value: &serde_json::Value) -> MetadataValue {
    match value {
        serde_json::Value::Null => MetadataValue::Null,
        serde_json::Value::Bool(b) => MetadataValue::Bool(*b),
        serde_json::Value::Number(n) => MetadataValue::Number(n.as_f64().unwrap_or_default()),
        serde_json::Value::String(s) => MetadataValue::String(s.clone()),
        serde_json::Value::Array(values) => {
            MetadataValue::List(values.iter().map(metadata_value).collect())
        }
        serde_json::Value::Object(fields) => MetadataValue::Struct(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), metadata_value(v)))
                .collect::<BTreeMap<_, _>>(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const BOOTSTRAP: &str = r#"{
        "xds_servers": [
            {
                "server_uri": "xds.example.com:443",
                "channel_creds": [{"type": "unknown"}, {"type": "google_default"}],
                "server_features": ["ignore_resource_deletion"]
            },
            {"server_uri": "http://backup:18000"}
        ],
        "node": {
            "id": "node-1",
            "cluster": "frontend",
            "metadata": {"network": "default", "shards": [1, 2], "canary": true},
            "locality": {"region": "r1", "zone": "z1"}
        }
    }"#;

    #[test]
    fn parses_servers_and_node() {
        let bootstrap = Bootstrap::parse(BOOTSTRAP).unwrap();
        let config = bootstrap.client_config();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].uri(), "https://xds.example.com:443");
        assert!(config.servers[0].has_feature("ignore_resource_deletion"));
        assert_eq!(config.servers[1].uri(), "http://backup:18000");

        let node = config.node;
        assert_eq!(node.id.as_deref(), Some("node-1"));
        assert_eq!(node.cluster.as_deref(), Some("frontend"));
        assert_eq!(node.user_agent_name, "gRPC Rust");
        assert_eq!(node.locality.unwrap().zone, "z1");
        assert_eq!(
            node.metadata.get("shards"),
            Some(&MetadataValue::List(vec![
                MetadataValue::Number(1.0),
                MetadataValue::Number(2.0)
            ]))
        );
        assert_eq!(node.metadata.get("canary"), Some(&MetadataValue::Bool(true)));
    }

    #[test]
    fn rejects_invalid_bootstrap() {
        assert!(Bootstrap::parse("{").is_err());
        assert!(Bootstrap::parse(r#"{"xds_servers": []}"#).is_err());
        assert!(Bootstrap::parse(r#"{"xds_servers": [{"server_uri": ""}]}"#).is_err());
        assert!(
            Bootstrap::parse(
                r#"{"xds_servers": [{"server_uri": "a:1", "channel_creds": [{"type": "alts"}]}]}"#
            )
            .is_err()
        );
    }

    #[test]
    fn missing_node_uses_default_identity() {
        let bootstrap = Bootstrap::parse(r#"{"xds_servers": [{"server_uri": "a:1"}]}"#).unwrap();
        assert_eq!(bootstrap.node(), Bootstrap::default_node());
        assert_eq!(bootstrap.client_config().servers[0].uri(), "http://a:1");
    }

    #[test]
    fn reads_bootstrap_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(BOOTSTRAP.as_bytes()).unwrap();
        let bootstrap = Bootstrap::from_file(file.path()).unwrap();
        assert_eq!(bootstrap.xds_servers.len(), 2);

        let missing = file.path().with_extension("missing");
        assert!(matches!(
            Bootstrap::from_file(missing),
            Err(XdsError::InvalidConfig(_))
        ));
    }
}
