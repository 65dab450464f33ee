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

//! Validated xDS resources.
//!
//! Each type here implements [`xds_client::Resource`]: the worker decodes the
//! envoy proto and calls `validate`, which either produces the normalized
//! record handed to watchers or fails, making the worker NACK the whole
//! response.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use envoy_types::pb::google::protobuf;
use thiserror::Error;

pub mod cluster;
pub mod endpoints;
pub mod http_filter;
pub mod listener;
pub mod route_config;

pub use cluster::{ClusterKind, ClusterUpdate, SecurityConfig};
pub use endpoints::{DropConfig, EndpointInfo, EndpointsUpdate, HealthStatus, Locality, LocalityId};
pub use http_filter::{HttpFilter, HttpFilterKind};
pub use listener::{InboundConfig, ListenerUpdate, RouteSource};
pub use route_config::{
    ClusterWeight, HeaderMatchKind, HeaderMatcher, PathMatcher, Route, RouteAction,
    RouteConfigUpdate, RouteMatcher, VirtualHost,
};

/// Why a resource was rejected, with the path of the offending field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ValidationError {
    fields: Vec<String>,
    message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            fields: vec![],
            message: message.into(),
        }
    }

    /// Prefixes the error with the field it was found in.
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.fields.push(field.into());
        self
    }

    /// Prefixes the error with an indexed field, e.g. `routes[2]`.
    pub fn with_field_index(self, field: &str, index: usize) -> Self {
        self.with_field(format!("{field}[{index}]"))
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fields.is_empty() {
            return f.write_str(&self.message);
        }
        // Fields are pushed innermost first.
        let path: Vec<&str> = self.fields.iter().rev().map(String::as_str).collect();
        write!(f, "{}: {}", path.join("."), self.message)
    }
}

impl From<ValidationError> for xds_client::Error {
    fn from(error: ValidationError) -> Self {
        xds_client::Error::Validation(error.to_string())
    }
}

/// Adds field context to the error of a `Result`.
pub(crate) trait ErrorContext<T> {
    fn with_field(self, field: &str) -> Result<T, ValidationError>;
    fn with_field_index(self, field: &str, index: usize) -> Result<T, ValidationError>;
}

impl<T> ErrorContext<T> for Result<T, ValidationError> {
    fn with_field(self, field: &str) -> Result<T, ValidationError> {
        self.map_err(|e| e.with_field(field))
    }

    fn with_field_index(self, field: &str, index: usize) -> Result<T, ValidationError> {
        self.map_err(|e| e.with_field_index(field, index))
    }
}

/// An opaque HTTP filter config: the typed config's type URL and bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterConfig {
    pub type_url: String,
    pub value: Bytes,
}

impl From<protobuf::Any> for FilterConfig {
    fn from(any: protobuf::Any) -> Self {
        Self {
            type_url: any.type_url,
            value: Bytes::from(any.value),
        }
    }
}

pub(crate) fn filter_overrides(
    typed_per_filter_config: HashMap<String, protobuf::Any>,
) -> HashMap<String, FilterConfig> {
    typed_per_filter_config
        .into_iter()
        .map(|(name, any)| (name, any.into()))
        .collect()
}

pub(crate) fn duration(d: &protobuf::Duration) -> Result<Duration, ValidationError> {
    if d.seconds < 0 || d.nanos < 0 {
        return Err(ValidationError::new("negative duration"));
    }
    let nanos = u32::try_from(d.nanos).map_err(|_| ValidationError::new("invalid nanos"))?;
    if nanos >= 1_000_000_000 {
        return Err(ValidationError::new("nanos out of range"));
    }
    Ok(Duration::new(d.seconds as u64, nanos))
}

/// Converts an envoy `FractionalPercent` to parts per million.
pub(crate) fn per_million(
    fraction: &envoy_types::pb::envoy::r#type::v3::FractionalPercent,
) -> Result<u32, ValidationError> {
    use envoy_types::pb::envoy::r#type::v3::fractional_percent::DenominatorType;

    let scale = match DenominatorType::try_from(fraction.denominator) {
        Ok(DenominatorType::Hundred) => 10_000,
        Ok(DenominatorType::TenThousand) => 100,
        Ok(DenominatorType::Million) => 1,
        Err(_) => return Err(ValidationError::new("unknown denominator").with_field("denominator")),
    };
    Ok(fraction.numerator.saturating_mul(scale).min(1_000_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_display_has_field_path() {
        let error = ValidationError::new("weight must be positive")
            .with_field("weight")
            .with_field_index("lb_endpoints", 1)
            .with_field_index("endpoints", 0);
        assert_eq!(
            error.to_string(),
            "endpoints[0].lb_endpoints[1].weight: weight must be positive"
        );
        let error: xds_client::Error = error.into();
        assert!(matches!(error, xds_client::Error::Validation(_)));
    }

    #[test]
    fn fractions_normalize_to_per_million() {
        use envoy_types::pb::envoy::r#type::v3::FractionalPercent;
        use envoy_types::pb::envoy::r#type::v3::fractional_percent::DenominatorType;

        let fraction = |numerator, denominator: DenominatorType| FractionalPercent {
            numerator,
            denominator: denominator as i32,
        };
        assert_eq!(per_million(&fraction(5, DenominatorType::Hundred)), Ok(50_000));
        assert_eq!(per_million(&fraction(5, DenominatorType::TenThousand)), Ok(500));
        assert_eq!(per_million(&fraction(5, DenominatorType::Million)), Ok(5));
        assert_eq!(
            per_million(&fraction(500, DenominatorType::Hundred)),
            Ok(1_000_000)
        );
    }

    #[test]
    fn negative_durations_are_rejected() {
        assert!(
            duration(&protobuf::Duration {
                seconds: -1,
                nanos: 0
            })
            .is_err()
        );
        assert_eq!(
            duration(&protobuf::Duration {
                seconds: 1,
                nanos: 500_000_000
            }),
            Ok(Duration::from_millis(1500))
        );
    }
}
