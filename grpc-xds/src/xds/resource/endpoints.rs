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

//! `ClusterLoadAssignment` validation.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use envoy_types::pb::envoy::config::core::v3 as xds_core;
use envoy_types::pb::envoy::config::core::v3::address::Address as AddressKind;
use envoy_types::pb::envoy::config::core::v3::socket_address::PortSpecifier;
use envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use envoy_types::pb::envoy::config::endpoint::v3::LbEndpoint;
use envoy_types::pb::envoy::config::endpoint::v3::lb_endpoint::HostIdentifier;
use prost::Message;

use super::{ErrorContext, ValidationError, duration, per_million};

/// A validated `ClusterLoadAssignment`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointsUpdate {
    pub cluster_name: String,
    pub drops: Vec<DropConfig>,
    pub localities: Vec<Locality>,
    /// How long endpoints stay usable after contact with the management
    /// server is lost.
    pub stale_after: Option<Duration>,
}

/// A drop category and the share of calls it drops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropConfig {
    pub category: String,
    pub numerator: u32,
    pub denominator: u32,
}

impl DropConfig {
    pub fn per_million(&self) -> u32 {
        let scaled = u64::from(self.numerator) * 1_000_000 / u64::from(self.denominator.max(1));
        scaled.min(1_000_000) as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locality {
    pub id: LocalityId,
    pub weight: u32,
    pub priority: u32,
    pub endpoints: Vec<EndpointInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalityId {
    pub region: String,
    pub zone: String,
    pub sub_zone: String,
}

impl LocalityId {
    pub fn is_empty(&self) -> bool {
        self.region.is_empty() && self.zone.is_empty() && self.sub_zone.is_empty()
    }
}

impl fmt::Display for LocalityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.region, self.zone, self.sub_zone)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    /// `host:port`
    pub address: String,
    pub health: HealthStatus,
    pub weight: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
    Draining,
    Timeout,
    Degraded,
}

impl HealthStatus {
    /// Whether calls may be sent to an endpoint in this state.
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Unknown | Self::Healthy)
    }
}

impl From<i32> for HealthStatus {
    fn from(value: i32) -> Self {
        match xds_core::HealthStatus::try_from(value) {
            Ok(xds_core::HealthStatus::Healthy) => Self::Healthy,
            Ok(xds_core::HealthStatus::Unhealthy) => Self::Unhealthy,
            Ok(xds_core::HealthStatus::Draining) => Self::Draining,
            Ok(xds_core::HealthStatus::Timeout) => Self::Timeout,
            Ok(xds_core::HealthStatus::Degraded) => Self::Degraded,
            _ => Self::Unknown,
        }
    }
}

impl xds_client::Resource for EndpointsUpdate {
    type Message = ClusterLoadAssignment;

    const TYPE_URL: &'static str =
        "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";

    fn deserialize(bytes: Bytes) -> xds_client::Result<Self::Message> {
        Ok(ClusterLoadAssignment::decode(bytes)?)
    }

    fn name(message: &Self::Message) -> &str {
        &message.cluster_name
    }

    fn validate(message: Self::Message) -> xds_client::Result<Self> {
        Ok(Self::from_xds(message)?)
    }
}

impl EndpointsUpdate {
    pub(crate) fn from_xds(cla: ClusterLoadAssignment) -> Result<Self, ValidationError> {
        let mut localities = Vec::with_capacity(cla.endpoints.len());
        let mut seen = BTreeSet::new();
        let mut priorities = BTreeSet::new();
        for (i, lle) in cla.endpoints.into_iter().enumerate() {
            let weight = lle.load_balancing_weight.map(|w| w.value).unwrap_or(0);
            if weight == 0 {
                continue;
            }
            let id = lle
                .locality
                .map(|l| LocalityId {
                    region: l.region,
                    zone: l.zone,
                    sub_zone: l.sub_zone,
                })
                .unwrap_or_default();
            if id.is_empty() {
                return Err(ValidationError::new("locality id is empty")
                    .with_field("locality")
                    .with_field_index("endpoints", i));
            }
            if !seen.insert(id.clone()) {
                return Err(ValidationError::new(format!("duplicate locality {id}"))
                    .with_field("locality")
                    .with_field_index("endpoints", i));
            }
            let endpoints = lle
                .lb_endpoints
                .into_iter()
                .enumerate()
                .map(|(j, e)| endpoint(e).with_field_index("lb_endpoints", j))
                .collect::<Result<Vec<_>, _>>()
                .with_field_index("endpoints", i)?;
            priorities.insert(lle.priority);
            localities.push(Locality {
                id,
                weight,
                priority: lle.priority,
                endpoints,
            });
        }

        // Priorities must be 0..N with no gaps.
        if let Some((n, p)) = priorities
            .iter()
            .enumerate()
            .find(|(n, p)| **p as usize != *n)
        {
            return Err(ValidationError::new(format!(
                "priorities are not contiguous: missing priority {n} before {p}"
            ))
            .with_field("endpoints"));
        }

        let mut drops = Vec::new();
        let mut stale_after = None;
        if let Some(policy) = cla.policy {
            for (i, drop) in policy.drop_overloads.into_iter().enumerate() {
                let Some(percentage) = drop.drop_percentage else {
                    continue;
                };
                let numerator = per_million(&percentage)
                    .with_field("drop_percentage")
                    .with_field_index("drop_overloads", i)
                    .with_field("policy")?;
                drops.push(DropConfig {
                    category: drop.category,
                    numerator,
                    denominator: 1_000_000,
                });
            }
            stale_after = policy
                .endpoint_stale_after
                .as_ref()
                .map(duration)
                .transpose()
                .with_field("endpoint_stale_after")
                .with_field("policy")?;
        }

        Ok(Self {
            cluster_name: cla.cluster_name,
            drops,
            localities,
            stale_after,
        })
    }

    /// The number of priorities. Priorities run from 0 to `priorities() - 1`.
    pub fn priorities(&self) -> u32 {
        self.localities
            .iter()
            .map(|l| l.priority + 1)
            .max()
            .unwrap_or(0)
    }
}

fn endpoint(lb_endpoint: LbEndpoint) -> Result<EndpointInfo, ValidationError> {
    let weight = match lb_endpoint.load_balancing_weight {
        None => 1,
        Some(w) if w.value == 0 => {
            return Err(ValidationError::new("endpoint weight must be positive")
                .with_field("load_balancing_weight"));
        }
        Some(w) => w.value,
    };
    let socket = match lb_endpoint.host_identifier {
        Some(HostIdentifier::Endpoint(endpoint)) => endpoint
            .address
            .and_then(|a| a.address)
            .and_then(|a| match a {
                AddressKind::SocketAddress(socket) => Some(socket),
                _ => None,
            }),
        _ => None,
    };
    let Some(socket) = socket else {
        return Err(ValidationError::new("endpoint has no socket address"));
    };
    let Some(PortSpecifier::PortValue(port)) = socket.port_specifier else {
        return Err(ValidationError::new("endpoint has no port"));
    };
    let address = if socket.address.contains(':') {
        format!("[{}]:{port}", socket.address)
    } else {
        format!("{}:{port}", socket.address)
    };
    Ok(EndpointInfo {
        address,
        health: HealthStatus::from(lb_endpoint.health_status),
        weight,
    })
}
