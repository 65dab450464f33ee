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

//! Name Resolution for gRPC.
//!
//! Name Resolution is the process by which a channel's target is converted into
//! network addresses (typically IP addresses) used by the channel to connect to
//! a service.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tonic::Status;
use url::Url;

use super::RpcInfo;
use super::service_config::ServiceConfig;
use crate::rt::Runtime;
use crate::xds::resource::FilterConfig;

mod registry;
pub use registry::{ResolverRegistry, global_registry};

/// Target represents a target for gRPC, as specified in:
/// https://github.com/grpc/grpc/blob/master/doc/naming.md.
/// It is parsed from the target string that gets passed during channel creation
/// by the user. gRPC passes it to the resolver and the balancer.
#[derive(Debug, Clone)]
pub struct Target {
    url: Url,
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<Url>() {
            Ok(url) => Ok(Target { url }),
            Err(err) => Err(err.to_string()),
        }
    }
}

impl From<Url> for Target {
    fn from(url: Url) -> Self {
        Target { url }
    }
}

impl Target {
    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// The host part of the authority.
    pub fn authority_host(&self) -> &str {
        self.url.host_str().unwrap_or("")
    }

    /// The port part of the authority.
    pub fn authority_port(&self) -> Option<u16> {
        self.url.port()
    }

    /// Retrieves endpoint from `Url.path()`.
    pub fn path(&self) -> &str {
        self.url.path()
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// A name resolver factory that produces Resolver instances used by the channel
/// to resolve network addresses for the target URI.
pub trait ResolverBuilder: Send + Sync {
    /// Builds a name resolver instance.
    ///
    /// Note that build must not fail.  Instead, an erroring Resolver may be
    /// returned that calls ChannelController.update() with an Err value.
    fn build(&self, target: &Target, options: ResolverOptions) -> Box<dyn Resolver>;

    /// Reports the URI scheme handled by this name resolver.
    fn scheme(&self) -> &str;

    /// Returns the default authority for a channel using this name resolver
    /// and target.
    ///
    /// By default, this method returns the path portion of the target URI,
    /// with the leading prefix removed.
    fn default_authority(&self, target: &Target) -> String {
        let path = target.path();
        path.strip_prefix("/").unwrap_or(path).to_string()
    }

    /// Returns a bool indicating whether the input uri is valid to create a
    /// resolver.
    fn is_valid_uri(&self, uri: &Target) -> bool;
}

/// A collection of data configured on the channel that is constructing this
/// name resolver.
#[non_exhaustive]
pub struct ResolverOptions {
    /// The authority that will be used for the channel by default.
    pub authority: String,

    /// A hook into the channel's work scheduler that allows the Resolver to
    /// request the ability to perform operations on the ChannelController.
    pub work_scheduler: Arc<dyn WorkScheduler>,

    /// The runtime which provides utilities to do async work.
    pub runtime: Arc<dyn Runtime>,
}

impl ResolverOptions {
    pub fn new(
        authority: impl Into<String>,
        work_scheduler: Arc<dyn WorkScheduler>,
        runtime: Arc<dyn Runtime>,
    ) -> Self {
        Self {
            authority: authority.into(),
            work_scheduler,
            runtime,
        }
    }
}

impl fmt::Debug for ResolverOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverOptions")
            .field("authority", &self.authority)
            .finish_non_exhaustive()
    }
}

/// Used to asynchronously request a call into the Resolver's work method.
pub trait WorkScheduler: Send + Sync {
    // Schedules a call into the Resolver's work method.  If there is already a
    // pending work call that has not yet started, this may not schedule another
    // call.
    fn schedule_work(&self);
}

/// Resolver watches for the updates on the specified target.
/// Updates include address updates and service config updates.
pub trait Resolver: Send + Sync {
    /// Asks the resolver to obtain an updated resolver result, if applicable.
    ///
    /// For watch based resolvers, this may be a no-op.
    fn resolve_now(&mut self);

    /// Called serially by the channel to provide access to the
    /// `ChannelController`.
    fn work(&mut self, channel_controller: &mut dyn ChannelController);
}

/// The `ChannelController` trait provides the resolver with functionality
/// to interact with the channel.
pub trait ChannelController: Send + Sync {
    /// Notifies the channel about the current state of the name resolver.  If
    /// an error value is returned, the name resolver should attempt to
    /// re-resolve, if possible.
    fn update(&mut self, update: ResolverUpdate) -> Result<(), String>;

    /// Parses the provided JSON service config.
    fn parse_service_config(&self, config: &str) -> Result<ServiceConfig, String>;
}

/// Chooses the configuration of each RPC. Installed on the channel by
/// resolvers that can route calls, such as the xDS resolver.
pub trait ConfigSelector: Send + Sync + fmt::Debug {
    /// Returns the configuration for the RPC, or the status to fail it with.
    fn select_config(&self, rpc: &RpcInfo) -> Result<RpcConfig, Status>;
}

/// Per-call configuration chosen by a [`ConfigSelector`].
#[derive(Default)]
pub struct RpcConfig {
    /// The cluster the call is routed to.
    pub cluster: Option<String>,
    /// Overrides the call's deadline when shorter.
    pub timeout: Option<Duration>,
    /// HTTP filter configs that override the listener's for this call, by
    /// filter name.
    pub filter_overrides: HashMap<String, FilterConfig>,
    /// Called once the call is committed to a backend (no more retries),
    /// releasing what the selection held. Dropping it uncalled, as for a call
    /// that ends before it commits, releases the same.
    pub on_committed: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl fmt::Debug for RpcConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcConfig")
            .field("cluster", &self.cluster)
            .field("timeout", &self.timeout)
            .field("filter_overrides", &self.filter_overrides)
            .field("on_committed", &self.on_committed.is_some())
            .finish()
    }
}

/// ResolverUpdate contains the current Resolver state relevant to the
/// channel.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ResolverUpdate {
    /// A list of endpoints which each identify a logical host serving the
    /// service indicated by the target URI.
    pub endpoints: Result<Vec<Endpoint>, String>,

    /// The service config which the client should use for communicating with
    /// the service. If it is None, it indicates no service config is present or
    /// the resolver does not provide service configs.
    pub service_config: Result<Option<ServiceConfig>, String>,

    /// Routes individual calls, if the resolver provides one.
    pub config_selector: Option<Arc<dyn ConfigSelector>>,

    /// An optional human-readable note describing context about the
    /// resolution, to be passed along to the LB policy for inclusion in
    /// RPC failure status messages.
    pub resolution_note: Option<String>,

    /// The service named by the channel's target, for policies that watch
    /// resources keyed by it when their config does not name one.
    pub service_name: Option<String>,
}

impl Default for ResolverUpdate {
    fn default() -> Self {
        ResolverUpdate {
            service_config: Ok(Default::default()),
            endpoints: Ok(Default::default()),
            config_selector: None,
            resolution_note: Default::default(),
            service_name: None,
        }
    }
}

impl ResolverUpdate {
    /// An update carrying only `endpoints`.
    pub fn from_endpoints(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints: Ok(endpoints),
            ..Default::default()
        }
    }
}

/// An Endpoint is an address or a collection of addresses which reference one
/// logical server.  Multiple addresses may be used if there are multiple ways
/// which the server can be reached, e.g. via IPv4 and IPv6 addresses.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Endpoint {
    /// Addresses contains a list of addresses used to access this endpoint.
    pub addresses: Vec<Address>,
}

impl Endpoint {
    pub fn new(addresses: Vec<Address>) -> Self {
        Self { addresses }
    }
}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addresses.hash(state);
    }
}

/// An Address is an identifier that indicates how to connect to a server.
#[non_exhaustive]
#[derive(Debug, Clone, Default, Ord, PartialOrd)]
pub struct Address {
    /// The network type is used to identify what kind of transport to create
    /// when connecting to this address.  Typically TCP_IP_NETWORK_TYPE.
    pub network_type: &'static str,

    /// The address itself is passed to the transport in order to create a
    /// connection to it.
    pub address: String,
}

impl Address {
    /// A TCP/IP address in `host:port` form.
    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            network_type: TCP_IP_NETWORK_TYPE,
            address: address.into(),
        }
    }
}

impl Eq for Address {}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.network_type == other.network_type && self.address == other.address
    }
}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.network_type.hash(state);
        self.address.hash(state);
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network_type, self.address)
    }
}

/// Indicates the address is an IPv4 or IPv6 address that should be connected to
/// via TCP/IP.
pub static TCP_IP_NETWORK_TYPE: &str = "tcp";

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_target() {
        struct TestCase {
            input: &'static str,
            want_scheme: &'static str,
            want_host: &'static str,
            want_port: Option<u16>,
            want_path: &'static str,
        }
        let test_cases = vec![
            TestCase {
                input: "xds:///my-service",
                want_scheme: "xds",
                want_host: "",
                want_port: None,
                want_path: "/my-service",
            },
            TestCase {
                input: "xds://control-plane:8080/my-service",
                want_scheme: "xds",
                want_host: "control-plane",
                want_port: Some(8080),
                want_path: "/my-service",
            },
        ];

        for tc in test_cases {
            let target: Target = tc.input.parse().unwrap();
            assert_eq!(target.scheme(), tc.want_scheme);
            assert_eq!(target.authority_host(), tc.want_host);
            assert_eq!(target.authority_port(), tc.want_port);
            assert_eq!(target.path(), tc.want_path);
        }
    }

    #[test]
    fn address_equality_and_display() {
        assert_eq!(Address::tcp("10.0.0.1:80"), Address::tcp("10.0.0.1:80"));
        assert_ne!(Address::tcp("10.0.0.1:80"), Address::tcp("10.0.0.2:80"));
        assert_eq!(Address::tcp("10.0.0.1:80").to_string(), "tcp:10.0.0.1:80");
    }
}
