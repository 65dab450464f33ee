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

//! HTTP filters a gRPC client understands.
//!
//! Filters are identified by the type URL of their typed config. A config
//! wrapped in a `TypedStruct` is identified by the URL inside it.

use bytes::Bytes;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::HttpFilter as HttpFilterProto;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::http_filter::ConfigType;
use prost::Message;

use super::{FilterConfig, ValidationError};

const ROUTER_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
const FAULT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.fault.v3.HTTPFault";
const RBAC_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.http.rbac.v3.RBAC";

const TYPED_STRUCT_URLS: [&str; 2] = [
    "type.googleapis.com/udpa.type.v1.TypedStruct",
    "type.googleapis.com/xds.type.v3.TypedStruct",
];

/// The filters with a registered builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpFilterKind {
    /// Terminal filter; must be last.
    Router,
    Fault,
    Rbac,
}

impl HttpFilterKind {
    /// Looks up the filter registered for a typed config URL.
    pub fn from_type_url(type_url: &str) -> Option<Self> {
        match type_url {
            ROUTER_TYPE_URL => Some(Self::Router),
            FAULT_TYPE_URL => Some(Self::Fault),
            RBAC_TYPE_URL => Some(Self::Rbac),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Router)
    }
}

/// A filter of a listener's HTTP connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpFilter {
    pub name: String,
    pub kind: HttpFilterKind,
    pub config: FilterConfig,
}

// `udpa.type.v1.TypedStruct` and `xds.type.v3.TypedStruct` share this layout.
#[derive(Clone, PartialEq, prost::Message)]
struct TypedStruct {
    #[prost(string, tag = "1")]
    type_url: String,
}

fn effective_type_url(type_url: &str, value: &[u8]) -> Result<String, ValidationError> {
    if !TYPED_STRUCT_URLS.contains(&type_url) {
        return Ok(type_url.to_string());
    }
    TypedStruct::decode(value)
        .map(|ts| ts.type_url)
        .map_err(|e| ValidationError::new(format!("invalid TypedStruct: {e}")))
}

/// Validates a filter chain: names are unique, every filter has a registered
/// builder unless it is optional, and the terminal filter comes last.
pub(crate) fn validate_filters(
    filters: Vec<HttpFilterProto>,
) -> Result<Vec<HttpFilter>, ValidationError> {
    if filters.is_empty() {
        return Err(ValidationError::new("at least one HTTP filter is required"));
    }
    let mut out: Vec<HttpFilter> = Vec::with_capacity(filters.len());
    let count = filters.len();
    for (i, filter) in filters.into_iter().enumerate() {
        let with_index = |e: ValidationError| e.with_field_index("http_filters", i);
        if out.iter().any(|f| f.name == filter.name) {
            return Err(with_index(ValidationError::new(format!(
                "duplicate filter name {:?}",
                filter.name
            ))));
        }
        let any = match filter.config_type {
            Some(ConfigType::TypedConfig(any)) => any,
            _ if filter.is_optional => continue,
            _ => return Err(with_index(ValidationError::new("missing typed_config"))),
        };
        let type_url = effective_type_url(&any.type_url, &any.value).map_err(with_index)?;
        let Some(kind) = HttpFilterKind::from_type_url(&type_url) else {
            if filter.is_optional {
                continue;
            }
            return Err(with_index(ValidationError::new(format!(
                "no filter registered for {type_url}"
            ))));
        };
        if kind.is_terminal() && i + 1 != count {
            return Err(with_index(ValidationError::new(
                "terminal filter must be last",
            )));
        }
        out.push(HttpFilter {
            name: filter.name,
            kind,
            config: FilterConfig {
                type_url,
                value: Bytes::from(any.value),
            },
        });
    }
    match out.last() {
        Some(last) if last.kind.is_terminal() => Ok(out),
        _ => Err(ValidationError::new("the last HTTP filter must be the router").with_field("http_filters")),
    }
}

#[cfg(test)]
pub(crate) fn router_filter() -> HttpFilterProto {
    use envoy_types::pb::google::protobuf::Any;
    HttpFilterProto {
        name: "router".to_string(),
        config_type: Some(ConfigType::TypedConfig(Any {
            type_url: ROUTER_TYPE_URL.to_string(),
            value: vec![],
        })),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::google::protobuf::Any;

    fn filter(name: &str, type_url: &str, optional: bool) -> HttpFilterProto {
        HttpFilterProto {
            name: name.to_string(),
            is_optional: optional,
            config_type: Some(ConfigType::TypedConfig(Any {
                type_url: type_url.to_string(),
                value: vec![],
            })),
            ..Default::default()
        }
    }

    #[test]
    fn router_only() {
        let filters = validate_filters(vec![router_filter()]).unwrap();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].kind, HttpFilterKind::Router);
    }

    #[test]
    fn empty_filter_list_is_rejected() {
        assert!(validate_filters(vec![]).is_err());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = validate_filters(vec![
            filter("router", FAULT_TYPE_URL, false),
            router_filter(),
        ])
        .unwrap_err();
        assert!(err.message().contains("duplicate"), "{err}");
    }

    #[test]
    fn unknown_filters_fail_unless_optional() {
        assert!(
            validate_filters(vec![
                filter("unknown", "type.googleapis.com/foo.Bar", false),
                router_filter(),
            ])
            .is_err()
        );
        let filters = validate_filters(vec![
            filter("unknown", "type.googleapis.com/foo.Bar", true),
            router_filter(),
        ])
        .unwrap();
        assert_eq!(filters.len(), 1);
    }

    #[test]
    fn router_must_be_last() {
        assert!(
            validate_filters(vec![router_filter(), filter("fault", FAULT_TYPE_URL, false)])
                .is_err()
        );
        assert!(validate_filters(vec![filter("fault", FAULT_TYPE_URL, false)]).is_err());
    }

    #[test]
    fn typed_struct_is_unwrapped() {
        let typed_struct = TypedStruct {
            type_url: FAULT_TYPE_URL.to_string(),
        };
        let wrapped = HttpFilterProto {
            name: "fault".to_string(),
            config_type: Some(ConfigType::TypedConfig(Any {
                type_url: TYPED_STRUCT_URLS[1].to_string(),
                value: typed_struct.encode_to_vec(),
            })),
            ..Default::default()
        };
        let filters = validate_filters(vec![wrapped, router_filter()]).unwrap();
        assert_eq!(filters[0].kind, HttpFilterKind::Fault);
        assert_eq!(filters[0].config.type_url, FAULT_TYPE_URL);
    }
}
