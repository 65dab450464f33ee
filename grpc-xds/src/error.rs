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

//! Error types surfaced to the channel.

use thiserror::Error;
use tonic::Status;

/// Errors the xDS components surface to the channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum XdsError {
    /// The management server does not know the resource, or never sent it.
    #[error("xDS resource {0:?} does not exist")]
    ResourceNotFound(String),

    /// A response carried a type URL this client does not handle.
    #[error("unsupported xDS resource type {0}")]
    ResourceTypeUnsupported(String),

    /// The management server could not be reached.
    #[error("xDS server unavailable: {0}")]
    TransportUnavailable(String),

    /// A configuration (bootstrap, LB config, resource) was rejected.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// No subchannel is ready to take the RPC yet.
    #[error("no subchannel available")]
    NoSubConnAvailable,

    /// Every connection attempt is failing.
    #[error("transient failure: {0}")]
    TransientFailure(String),
}

impl From<xds_client::Error> for XdsError {
    fn from(error: xds_client::Error) -> Self {
        match error {
            xds_client::Error::ResourceDoesNotExist => {
                XdsError::ResourceNotFound("<unknown>".to_string())
            }
            xds_client::Error::Validation(message) => XdsError::InvalidConfig(message),
            xds_client::Error::Decode(error) => XdsError::InvalidConfig(error.to_string()),
            other => XdsError::TransportUnavailable(other.to_string()),
        }
    }
}

impl From<XdsError> for Status {
    fn from(error: XdsError) -> Self {
        match error {
            XdsError::InvalidConfig(_) | XdsError::ResourceTypeUnsupported(_) => {
                Status::internal(error.to_string())
            }
            _ => Status::unavailable(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_map_to_taxonomy() {
        assert_eq!(
            XdsError::from(xds_client::Error::Connection("refused".into())),
            XdsError::TransportUnavailable("connection error: refused".into())
        );
        assert!(matches!(
            XdsError::from(xds_client::Error::Validation("bad".into())),
            XdsError::InvalidConfig(m) if m == "bad"
        ));
        assert!(matches!(
            XdsError::from(xds_client::Error::ResourceDoesNotExist),
            XdsError::ResourceNotFound(_)
        ));
    }

    #[test]
    fn test_status_codes() {
        let status: Status = XdsError::NoSubConnAvailable.into();
        assert_eq!(status.code(), tonic::Code::Unavailable);
        let status: Status = XdsError::InvalidConfig("x".into()).into();
        assert_eq!(status.code(), tonic::Code::Internal);
    }
}
