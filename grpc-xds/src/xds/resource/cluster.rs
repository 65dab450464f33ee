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

//! `Cluster` validation.

use bytes::Bytes;
use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::cluster::v3::cluster::{
    ClusterDiscoveryType, DiscoveryType, LbPolicy,
};
use envoy_types::pb::envoy::config::core::v3::RoutingPriority;
use envoy_types::pb::envoy::config::core::v3::address::Address as AddressKind;
use envoy_types::pb::envoy::config::core::v3::config_source::ConfigSourceSpecifier;
use envoy_types::pb::envoy::config::core::v3::socket_address::PortSpecifier;
use envoy_types::pb::envoy::config::core::v3::transport_socket::ConfigType as TransportSocketConfig;
use envoy_types::pb::envoy::config::endpoint::v3::lb_endpoint::HostIdentifier;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::UpstreamTlsContext;
use prost::Message;

use super::{ErrorContext, ValidationError};

const AGGREGATE_CLUSTER_TYPE: &str = "envoy.clusters.aggregate";
const AGGREGATE_CONFIG_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.clusters.aggregate.v3.ClusterConfig";
const TLS_TRANSPORT_SOCKET: &str = "envoy.transport_sockets.tls";
const UPSTREAM_TLS_CONTEXT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext";

/// A validated `Cluster`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterUpdate {
    pub name: String,
    /// The name to request endpoints under. Defaults to the cluster name.
    pub service_name: String,
    pub kind: ClusterKind,
    /// Whether load reports for this cluster go to the management server.
    pub enable_lrs: bool,
    pub security: Option<SecurityConfig>,
    pub max_requests: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterKind {
    Eds,
    /// A single `host:port` resolved through DNS.
    LogicalDns { host: String },
    /// Prioritized child clusters, highest priority first.
    Aggregate { children: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityConfig {
    pub sni: String,
}

// `envoy.extensions.clusters.aggregate.v3.ClusterConfig`
#[derive(Clone, PartialEq, prost::Message)]
struct AggregateClusterConfig {
    #[prost(string, repeated, tag = "1")]
    clusters: Vec<String>,
}

impl xds_client::Resource for ClusterUpdate {
    type Message = Cluster;

    const TYPE_URL: &'static str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
    const ALL_RESOURCES_REQUIRED_IN_SOTW: bool = true;

    fn deserialize(bytes: Bytes) -> xds_client::Result<Self::Message> {
        Ok(Cluster::decode(bytes)?)
    }

    fn name(message: &Self::Message) -> &str {
        &message.name
    }

    fn validate(message: Self::Message) -> xds_client::Result<Self> {
        Ok(Self::from_xds(message)?)
    }
}

impl ClusterUpdate {
    pub(crate) fn from_xds(cluster: Cluster) -> Result<Self, ValidationError> {
        if cluster.lb_policy != LbPolicy::RoundRobin as i32 {
            return Err(ValidationError::new(format!(
                "unsupported lb_policy {}",
                cluster.lb_policy
            ))
            .with_field("lb_policy"));
        }

        let kind = match &cluster.cluster_discovery_type {
            Some(ClusterDiscoveryType::Type(t)) if *t == DiscoveryType::Eds as i32 => {
                let ads = cluster
                    .eds_cluster_config
                    .as_ref()
                    .and_then(|c| c.eds_config.as_ref())
                    .and_then(|cs| cs.config_source_specifier.as_ref())
                    .is_some_and(|s| matches!(s, ConfigSourceSpecifier::Ads(_)));
                if !ads {
                    return Err(ValidationError::new("EDS config source must be ADS")
                        .with_field("eds_cluster_config"));
                }
                ClusterKind::Eds
            }
            Some(ClusterDiscoveryType::Type(t)) if *t == DiscoveryType::LogicalDns as i32 => {
                ClusterKind::LogicalDns {
                    host: logical_dns_host(&cluster).with_field("load_assignment")?,
                }
            }
            Some(ClusterDiscoveryType::ClusterType(custom))
                if custom.name == AGGREGATE_CLUSTER_TYPE =>
            {
                let any = custom
                    .typed_config
                    .as_ref()
                    .filter(|any| any.type_url == AGGREGATE_CONFIG_TYPE_URL)
                    .ok_or_else(|| ValidationError::new("missing aggregate cluster config"))
                    .with_field("cluster_type")?;
                let config = AggregateClusterConfig::decode(any.value.as_slice())
                    .map_err(|e| ValidationError::new(format!("invalid aggregate config: {e}")))
                    .with_field("cluster_type")?;
                if config.clusters.is_empty() {
                    return Err(ValidationError::new("aggregate cluster has no children")
                        .with_field("cluster_type"));
                }
                ClusterKind::Aggregate {
                    children: config.clusters,
                }
            }
            _ => return Err(ValidationError::new("unsupported cluster discovery type")),
        };

        let enable_lrs = match cluster
            .lrs_server
            .as_ref()
            .and_then(|cs| cs.config_source_specifier.as_ref())
        {
            None => false,
            Some(ConfigSourceSpecifier::Self_(_)) => true,
            Some(_) => {
                return Err(ValidationError::new("LRS server must be self").with_field("lrs_server"));
            }
        };

        let max_requests = cluster.circuit_breakers.as_ref().and_then(|cb| {
            cb.thresholds
                .iter()
                .find(|t| t.priority == RoutingPriority::Default as i32)
                .and_then(|t| t.max_requests.as_ref())
                .map(|v| v.value)
        });

        let security = security_config(&cluster).with_field("transport_socket")?;

        let service_name = cluster
            .eds_cluster_config
            .as_ref()
            .map(|c| c.service_name.clone())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| cluster.name.clone());

        Ok(Self {
            name: cluster.name,
            service_name,
            kind,
            enable_lrs,
            security,
            max_requests,
        })
    }
}

fn logical_dns_host(cluster: &Cluster) -> Result<String, ValidationError> {
    let assignment = cluster
        .load_assignment
        .as_ref()
        .ok_or_else(|| ValidationError::new("LOGICAL_DNS cluster needs a load assignment"))?;
    let [locality] = assignment.endpoints.as_slice() else {
        return Err(ValidationError::new("LOGICAL_DNS cluster needs exactly one locality"));
    };
    let [lb_endpoint] = locality.lb_endpoints.as_slice() else {
        return Err(ValidationError::new("LOGICAL_DNS cluster needs exactly one endpoint"));
    };
    let socket = match &lb_endpoint.host_identifier {
        Some(HostIdentifier::Endpoint(endpoint)) => endpoint
            .address
            .as_ref()
            .and_then(|a| a.address.as_ref())
            .and_then(|a| match a {
                AddressKind::SocketAddress(socket) => Some(socket),
                _ => None,
            }),
        _ => None,
    };
    let Some(socket) = socket else {
        return Err(ValidationError::new("LOGICAL_DNS endpoint has no socket address"));
    };
    match socket.port_specifier {
        Some(PortSpecifier::PortValue(port)) => Ok(format!("{}:{port}", socket.address)),
        _ => Err(ValidationError::new("LOGICAL_DNS endpoint has no port")),
    }
}

fn security_config(cluster: &Cluster) -> Result<Option<SecurityConfig>, ValidationError> {
    let Some(socket) = &cluster.transport_socket else {
        return Ok(None);
    };
    if socket.name != TLS_TRANSPORT_SOCKET {
        return Err(ValidationError::new(format!(
            "unsupported transport socket {:?}",
            socket.name
        )));
    }
    let any = match &socket.config_type {
        Some(TransportSocketConfig::TypedConfig(any)) => any,
        None => return Err(ValidationError::new("missing typed_config")),
    };
    if any.type_url != UPSTREAM_TLS_CONTEXT_TYPE_URL {
        return Err(ValidationError::new(format!(
            "unexpected TLS context type {}",
            any.type_url
        )));
    }
    let context = UpstreamTlsContext::decode(any.value.as_slice())
        .map_err(|e| ValidationError::new(format!("invalid UpstreamTlsContext: {e}")))?;
    if context.common_tls_context.is_none() {
        return Err(ValidationError::new("missing common_tls_context"));
    }
    Ok(Some(SecurityConfig { sni: context.sni }))
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use envoy_types::pb::envoy::config::cluster::v3::cluster::{CustomClusterType, EdsClusterConfig};
    use envoy_types::pb::envoy::config::core::v3::{AggregatedConfigSource, ConfigSource};
    use envoy_types::pb::google::protobuf::Any;

    pub(crate) fn eds_cluster(name: &str, service_name: &str) -> Cluster {
        Cluster {
            name: name.to_string(),
            cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32)),
            eds_cluster_config: Some(EdsClusterConfig {
                eds_config: Some(ConfigSource {
                    config_source_specifier: Some(ConfigSourceSpecifier::Ads(
                        AggregatedConfigSource {},
                    )),
                    ..Default::default()
                }),
                service_name: service_name.to_string(),
            }),
            ..Default::default()
        }
    }

    pub(crate) fn aggregate_cluster(name: &str, children: &[&str]) -> Cluster {
        let config = AggregateClusterConfig {
            clusters: children.iter().map(|c| c.to_string()).collect(),
        };
        Cluster {
            name: name.to_string(),
            cluster_discovery_type: Some(ClusterDiscoveryType::ClusterType(CustomClusterType {
                name: AGGREGATE_CLUSTER_TYPE.to_string(),
                typed_config: Some(Any {
                    type_url: AGGREGATE_CONFIG_TYPE_URL.to_string(),
                    value: config.encode_to_vec(),
                }),
            })),
            ..Default::default()
        }
    }
}
