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

//! Client-side xDS support for gRPC.
//!
//! This crate turns the configuration served by an xDS management server into
//! the pieces a gRPC channel consumes:
//!
//! - an `xds` name resolver ([`xds::resolver`]) that watches the Listener and
//!   RouteConfiguration for the channel's target and produces a service config
//!   plus a per-call config selector,
//! - the `xds_experimental` LB policy ([`client::load_balancing::xds`]) that
//!   watches Cluster and ClusterLoadAssignment resources, drives an EDS
//!   balancer with priorities and localities, and falls back to a plain policy
//!   over the resolved addresses when the management server is unusable,
//! - an idleness controller ([`client::idle`]) that moves the channel in and
//!   out of idle mode.
//!
//! The xDS transport and resource cache live in the `xds-client` crate. This
//! crate provides the gRPC-specific resource validation on top of it
//! ([`xds::resource`]).
//!
//! # Example
//!
//! ```ignore
//! // Register the policies and the resolver once at startup.
//! grpc_xds::init();
//!
//! let builder = grpc_xds::client::name_resolution::global_registry()
//!     .get("xds")
//!     .unwrap();
//! ```

pub mod client;
pub mod error;
pub mod rt;
pub mod xds;

pub use error::XdsError;

/// Registers the LB policies (`round_robin`, `xds_experimental` and
/// `xds_cluster_manager_experimental`) and the `xds` resolver in the global
/// registries. Safe to call more than once.
pub fn init() {
    client::load_balancing::round_robin::reg();
    client::load_balancing::xds::reg();
    client::load_balancing::cluster_manager::reg();
    xds::resolver::reg();
}
