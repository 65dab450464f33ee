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

//! `Listener` validation.

use std::time::Duration;

use bytes::Bytes;
use envoy_types::pb::envoy::config::core::v3::address::Address as AddressKind;
use envoy_types::pb::envoy::config::core::v3::config_source::ConfigSourceSpecifier;
use envoy_types::pb::envoy::config::core::v3::socket_address::PortSpecifier;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::listener::v3::filter::ConfigType as NetworkFilterConfig;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::HttpConnectionManager;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::http_connection_manager::RouteSpecifier;
use envoy_types::pb::google::protobuf::Any;
use prost::Message;

use super::{
    ErrorContext, HttpFilter, RouteConfigUpdate, ValidationError, duration,
    http_filter::validate_filters,
};

const HCM_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";

/// A validated `Listener`.
#[derive(Debug, Clone)]
pub struct ListenerUpdate {
    pub name: String,
    pub route_source: RouteSource,
    /// Upper bound on the duration of every call, unless a route overrides it.
    pub max_stream_duration: Option<Duration>,
    pub http_filters: Vec<HttpFilter>,
    /// Set for server-side listeners, which carry the address they serve on.
    pub inbound: Option<InboundConfig>,
}

/// Where a listener's routes come from.
#[derive(Debug, Clone)]
pub enum RouteSource {
    /// The name of a `RouteConfiguration` to fetch over RDS.
    Rds(String),
    Inline(RouteConfigUpdate),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundConfig {
    pub address: String,
    pub port: u16,
}

impl xds_client::Resource for ListenerUpdate {
    type Message = Listener;

    const TYPE_URL: &'static str = "type.googleapis.com/envoy.config.listener.v3.Listener";
    const ALL_RESOURCES_REQUIRED_IN_SOTW: bool = true;

    fn deserialize(bytes: Bytes) -> xds_client::Result<Self::Message> {
        Ok(Listener::decode(bytes)?)
    }

    fn name(message: &Self::Message) -> &str {
        &message.name
    }

    fn validate(message: Self::Message) -> xds_client::Result<Self> {
        Ok(Self::from_xds(message)?)
    }
}

impl ListenerUpdate {
    pub(crate) fn from_xds(listener: Listener) -> Result<Self, ValidationError> {
        let (hcm, inbound) = match listener.api_listener {
            Some(api_listener) => {
                let any = api_listener
                    .api_listener
                    .ok_or_else(|| ValidationError::new("missing api_listener"))
                    .with_field("api_listener")?;
                (decode_hcm(any).with_field("api_listener")?, None)
            }
            None => {
                let inbound = inbound_address(&listener).with_field("address")?;
                let hcm = server_side_hcm(&listener)?;
                (hcm, Some(inbound))
            }
        };

        let route_source = match hcm.route_specifier {
            Some(RouteSpecifier::Rds(rds)) => {
                match rds.config_source.and_then(|cs| cs.config_source_specifier) {
                    Some(ConfigSourceSpecifier::Ads(_)) => {}
                    _ => {
                        return Err(ValidationError::new("RDS config source must be ADS")
                            .with_field("rds"));
                    }
                }
                if rds.route_config_name.is_empty() {
                    return Err(ValidationError::new("empty route_config_name").with_field("rds"));
                }
                RouteSource::Rds(rds.route_config_name)
            }
            Some(RouteSpecifier::RouteConfig(config)) => {
                RouteSource::Inline(RouteConfigUpdate::from_xds(config).with_field("route_config")?)
            }
            Some(RouteSpecifier::ScopedRoutes(_)) => {
                return Err(ValidationError::new("scoped routes are not supported"));
            }
            None => return Err(ValidationError::new("missing route specifier")),
        };

        let max_stream_duration = hcm
            .common_http_protocol_options
            .as_ref()
            .and_then(|options| options.max_stream_duration.as_ref())
            .map(duration)
            .transpose()
            .with_field("common_http_protocol_options")?;

        let http_filters = validate_filters(hcm.http_filters)?;

        Ok(Self {
            name: listener.name,
            route_source,
            max_stream_duration,
            http_filters,
            inbound,
        })
    }

    /// The name of the route configuration to watch, if routes are not inline.
    pub fn rds_name(&self) -> Option<&str> {
        match &self.route_source {
            RouteSource::Rds(name) => Some(name),
            RouteSource::Inline(_) => None,
        }
    }
}

fn decode_hcm(any: Any) -> Result<HttpConnectionManager, ValidationError> {
    if any.type_url != HCM_TYPE_URL {
        return Err(ValidationError::new(format!(
            "unexpected type {}, want HttpConnectionManager",
            any.type_url
        )));
    }
    HttpConnectionManager::decode(Bytes::from(any.value))
        .map_err(|e| ValidationError::new(format!("invalid HttpConnectionManager: {e}")))
}

// Server-side listeners carry their HttpConnectionManager in the first filter
// chain.
fn server_side_hcm(listener: &Listener) -> Result<HttpConnectionManager, ValidationError> {
    let chain = listener
        .filter_chains
        .first()
        .ok_or_else(|| ValidationError::new("listener has neither api_listener nor filter_chains"))?;
    let filter = chain
        .filters
        .iter()
        .find(|f| {
            matches!(&f.config_type, Some(NetworkFilterConfig::TypedConfig(any)) if any.type_url == HCM_TYPE_URL)
        })
        .ok_or_else(|| {
            ValidationError::new("no HttpConnectionManager filter").with_field_index("filter_chains", 0)
        })?;
    match &filter.config_type {
        Some(NetworkFilterConfig::TypedConfig(any)) => decode_hcm(any.clone())
            .with_field("filters")
            .with_field_index("filter_chains", 0),
        _ => Err(ValidationError::new("missing typed_config")),
    }
}

fn inbound_address(listener: &Listener) -> Result<InboundConfig, ValidationError> {
    let Some(AddressKind::SocketAddress(socket)) = listener
        .address
        .as_ref()
        .and_then(|a| a.address.as_ref())
    else {
        return Err(ValidationError::new("server listener needs a socket address"));
    };
    let port = match socket.port_specifier {
        Some(PortSpecifier::PortValue(port)) => {
            u16::try_from(port).map_err(|_| ValidationError::new(format!("invalid port {port}")))?
        }
        _ => return Err(ValidationError::new("missing port")),
    };
    Ok(InboundConfig {
        address: socket.address.clone(),
        port,
    })
}
