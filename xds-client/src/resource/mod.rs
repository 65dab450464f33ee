//! Provides abstraction for xDS resources.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};

/// Trait for xDS resources.
///
/// Decoding is split in three steps so that the worker can name the resource
/// in a NACK even when validation fails:
/// - [`deserialize`](Resource::deserialize) parses the wire bytes.
/// - [`name`](Resource::name) extracts the resource name from the message.
/// - [`validate`](Resource::validate) turns the message into the validated
///   record handed to watchers.
///
/// # Example
///
/// ```ignore
/// impl Resource for ListenerUpdate {
///     type Message = ListenerProto;
///     const TYPE_URL: &'static str = "type.googleapis.com/envoy.config.listener.v3.Listener";
///     const ALL_RESOURCES_REQUIRED_IN_SOTW: bool = true;
///
///     fn deserialize(bytes: Bytes) -> Result<ListenerProto> {
///         Ok(ListenerProto::decode(bytes)?)
///     }
///
///     fn name(message: &ListenerProto) -> &str {
///         &message.name
///     }
///
///     fn validate(message: ListenerProto) -> Result<Self> {
///         // Validate fields...
///     }
/// }
/// ```
pub trait Resource: Sized + Send + Sync + fmt::Debug + 'static {
    /// The deserialized wire message.
    type Message;

    /// The xDS type URL for this resource type.
    ///
    /// Example: `"type.googleapis.com/envoy.config.listener.v3.Listener"`
    const TYPE_URL: &'static str;

    /// Whether a state-of-the-world response always carries every subscribed
    /// resource of this type, so that an absent resource has been deleted.
    const ALL_RESOURCES_REQUIRED_IN_SOTW: bool = false;

    /// Parse a message from its serialized bytes.
    fn deserialize(bytes: Bytes) -> Result<Self::Message>;

    /// Returns the resource name.
    ///
    /// The resource name combined with the type URL uniquely identifies a resource.
    fn name(message: &Self::Message) -> &str;

    /// Validate a parsed message.
    ///
    /// The error message is included in the NACK's `error_detail`.
    fn validate(message: Self::Message) -> Result<Self>;
}

/// Returns the part of a type URL that identifies the resource type.
///
/// The v2 and v3 forms of a type URL share the same suffix, e.g.
/// `type.googleapis.com/envoy.api.v2.Listener` and
/// `type.googleapis.com/envoy.config.listener.v3.Listener` both map to
/// `Listener`.
pub fn type_url_suffix(type_url: &str) -> &str {
    type_url
        .rsplit_once('.')
        .map_or(type_url, |(_, suffix)| suffix)
}

/// Returns true if both type URLs name the same resource type.
pub fn type_urls_equivalent(a: &str, b: &str) -> bool {
    type_url_suffix(a) == type_url_suffix(b)
}

/// A type-erased, validated resource.
#[derive(Clone)]
pub struct DecodedResource {
    name: String,
    value: Arc<dyn Any + Send + Sync>,
}

impl DecodedResource {
    /// Wrap a validated resource.
    pub fn new<T: Resource>(name: impl Into<String>, resource: T) -> Self {
        Self {
            name: name.into(),
            value: Arc::new(resource),
        }
    }

    /// Returns the resource name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Recover the concrete resource.
    pub fn downcast<T: Resource>(&self) -> Option<Arc<T>> {
        self.value.clone().downcast::<T>().ok()
    }
}

impl fmt::Debug for DecodedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedResource")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// The outcome of decoding one resource of a response.
#[derive(Debug)]
pub enum DecodeResult {
    /// The resource parsed and validated.
    Success {
        /// The resource name.
        name: String,
        /// The validated resource.
        resource: DecodedResource,
    },
    /// The resource parsed, but failed validation.
    ResourceError {
        /// The resource name.
        name: String,
        /// Why validation failed.
        error: Error,
    },
    /// The resource could not be parsed at all.
    TopLevelError(Error),
}

/// Type-erased decoder registered with the worker for a resource type.
pub(crate) type DecoderFn = Box<dyn Fn(Bytes) -> DecodeResult + Send + Sync>;

pub(crate) fn decoder_for<T: Resource>() -> DecoderFn {
    Box::new(|bytes| {
        let message = match T::deserialize(bytes) {
            Ok(message) => message,
            Err(error) => return DecodeResult::TopLevelError(error),
        };
        let name = T::name(&message).to_owned();
        match T::validate(message) {
            Ok(resource) => DecodeResult::Success {
                resource: DecodedResource::new(name.clone(), resource),
                name,
            },
            Err(error) => DecodeResult::ResourceError { name, error },
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_url_suffix() {
        assert_eq!(
            type_url_suffix("type.googleapis.com/envoy.config.listener.v3.Listener"),
            "Listener"
        );
        assert_eq!(
            type_url_suffix("type.googleapis.com/envoy.api.v2.ClusterLoadAssignment"),
            "ClusterLoadAssignment"
        );
        assert_eq!(type_url_suffix("Cluster"), "Cluster");
    }

    #[test]
    fn test_v2_and_v3_urls_are_equivalent() {
        assert!(type_urls_equivalent(
            "type.googleapis.com/envoy.api.v2.RouteConfiguration",
            "type.googleapis.com/envoy.config.route.v3.RouteConfiguration",
        ));
        assert!(!type_urls_equivalent(
            "type.googleapis.com/envoy.config.cluster.v3.Cluster",
            "type.googleapis.com/envoy.config.listener.v3.Listener",
        ));
    }
}
