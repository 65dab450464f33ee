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

//! `RouteConfiguration` validation.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use envoy_types::pb::envoy::config::route::v3 as xds_route;
use envoy_types::pb::envoy::config::route::v3::header_matcher::HeaderMatchSpecifier;
use envoy_types::pb::envoy::config::route::v3::route::Action;
use envoy_types::pb::envoy::config::route::v3::route_action::ClusterSpecifier;
use envoy_types::pb::envoy::config::route::v3::route_match::PathSpecifier;
use indexmap::IndexMap;
use prost::Message;
use regex::Regex;
use tracing::warn;

use super::{ErrorContext, FilterConfig, ValidationError, duration, filter_overrides, per_million};

/// A validated `RouteConfiguration`.
#[derive(Debug, Clone)]
pub struct RouteConfigUpdate {
    pub name: String,
    pub virtual_hosts: Vec<VirtualHost>,
}

#[derive(Debug, Clone)]
pub struct VirtualHost {
    pub domains: Vec<String>,
    /// Routes in match order.
    pub routes: Vec<Route>,
    pub filter_overrides: HashMap<String, FilterConfig>,
}

#[derive(Debug, Clone)]
pub struct Route {
    pub matcher: RouteMatcher,
    pub action: RouteAction,
    pub max_stream_duration: Option<Duration>,
    pub filter_overrides: HashMap<String, FilterConfig>,
}

#[derive(Debug, Clone)]
pub struct RouteMatcher {
    pub path: PathMatcher,
    pub case_insensitive: bool,
    pub headers: Vec<HeaderMatcher>,
    /// The share of calls this route matches, out of a million.
    pub fraction_per_million: Option<u32>,
}

#[derive(Debug, Clone)]
pub enum PathMatcher {
    Prefix(String),
    Exact(String),
    Regex(Regex),
}

#[derive(Debug, Clone)]
pub struct HeaderMatcher {
    pub name: String,
    pub kind: HeaderMatchKind,
    pub invert: bool,
}

#[derive(Debug, Clone)]
pub enum HeaderMatchKind {
    Exact(String),
    Regex(Regex),
    /// Matches integers in `[start, end)`.
    Range { start: i64, end: i64 },
    Present(bool),
    Prefix(String),
    Suffix(String),
}

#[derive(Debug, Clone)]
pub enum RouteAction {
    /// Clusters by name, in the order the server listed them.
    WeightedClusters(IndexMap<String, ClusterWeight>),
    /// A route this client cannot forward on. Calls matching it fail.
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterWeight {
    pub weight: u32,
    pub filter_overrides: HashMap<String, FilterConfig>,
}

impl xds_client::Resource for RouteConfigUpdate {
    type Message = xds_route::RouteConfiguration;

    const TYPE_URL: &'static str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";

    fn deserialize(bytes: Bytes) -> xds_client::Result<Self::Message> {
        Ok(xds_route::RouteConfiguration::decode(bytes)?)
    }

    fn name(message: &Self::Message) -> &str {
        &message.name
    }

    fn validate(message: Self::Message) -> xds_client::Result<Self> {
        Ok(Self::from_xds(message)?)
    }
}

impl RouteConfigUpdate {
    pub(crate) fn from_xds(
        message: xds_route::RouteConfiguration,
    ) -> Result<Self, ValidationError> {
        let virtual_hosts = message
            .virtual_hosts
            .into_iter()
            .enumerate()
            .map(|(i, vh)| VirtualHost::from_xds(vh).with_field_index("virtual_hosts", i))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name: message.name,
            virtual_hosts,
        })
    }
}

impl VirtualHost {
    fn from_xds(vh: xds_route::VirtualHost) -> Result<Self, ValidationError> {
        let mut routes = Vec::with_capacity(vh.routes.len());
        for (i, route) in vh.routes.into_iter().enumerate() {
            if let Some(route) = Route::from_xds(route).with_field_index("routes", i)? {
                routes.push(route);
            }
        }
        Ok(Self {
            domains: vh.domains,
            routes,
            filter_overrides: filter_overrides(vh.typed_per_filter_config),
        })
    }
}

impl Route {
    // Returns Ok(None) for routes that are skipped rather than rejected.
    fn from_xds(route: xds_route::Route) -> Result<Option<Self>, ValidationError> {
        let Some(route_match) = route.r#match else {
            return Err(ValidationError::new("route has no match").with_field("match"));
        };
        if !route_match.query_parameters.is_empty() {
            warn!(route = %route.name, "skipping route with query parameter matchers");
            return Ok(None);
        }
        let Some(matcher) = RouteMatcher::from_xds(route_match).with_field("match")? else {
            return Ok(None);
        };

        let (action, max_stream_duration) = match route.action {
            Some(Action::Route(action)) => {
                let max_stream_duration = action
                    .max_stream_duration
                    .as_ref()
                    .and_then(|msd| {
                        msd.grpc_timeout_header_max
                            .as_ref()
                            .or(msd.max_stream_duration.as_ref())
                    })
                    .map(duration)
                    .transpose()
                    .with_field("max_stream_duration")?;
                let Some(clusters) =
                    weighted_clusters(action.cluster_specifier).with_field("route")?
                else {
                    return Ok(None);
                };
                (RouteAction::WeightedClusters(clusters), max_stream_duration)
            }
            // Redirects, direct responses and non-forwarding actions.
            _ => (RouteAction::Unsupported, None),
        };

        Ok(Some(Self {
            matcher,
            action,
            max_stream_duration,
            filter_overrides: filter_overrides(route.typed_per_filter_config),
        }))
    }
}

// Returns Ok(None) when the cluster specifier is one that is skipped.
fn weighted_clusters(
    specifier: Option<ClusterSpecifier>,
) -> Result<Option<IndexMap<String, ClusterWeight>>, ValidationError> {
    match specifier {
        Some(ClusterSpecifier::Cluster(name)) => {
            if name.is_empty() {
                return Err(ValidationError::new("empty cluster name").with_field("cluster"));
            }
            let mut clusters = IndexMap::new();
            clusters.insert(
                name,
                ClusterWeight {
                    weight: 1,
                    filter_overrides: HashMap::new(),
                },
            );
            Ok(Some(clusters))
        }
        Some(ClusterSpecifier::WeightedClusters(wc)) => {
            let mut clusters = IndexMap::new();
            let mut total: u64 = 0;
            for (i, cw) in wc.clusters.into_iter().enumerate() {
                let weight = cw.weight.map(|w| w.value).unwrap_or(0);
                total += u64::from(weight);
                if weight == 0 {
                    continue;
                }
                if cw.name.is_empty() {
                    return Err(ValidationError::new("empty cluster name")
                        .with_field_index("clusters", i)
                        .with_field("weighted_clusters"));
                }
                clusters.insert(
                    cw.name,
                    ClusterWeight {
                        weight,
                        filter_overrides: filter_overrides(cw.typed_per_filter_config),
                    },
                );
            }
            if total == 0 {
                return Err(ValidationError::new("sum of cluster weights must be positive")
                    .with_field("weighted_clusters"));
            }
            #[allow(deprecated)]
            let total_weight = wc.total_weight;
            if let Some(total_weight) = total_weight {
                if u64::from(total_weight.value) != total {
                    return Err(ValidationError::new(format!(
                        "total_weight {} does not match the sum of weights {total}",
                        total_weight.value
                    ))
                    .with_field("weighted_clusters"));
                }
            }
            Ok(Some(clusters))
        }
        Some(ClusterSpecifier::ClusterHeader(_))
        | Some(ClusterSpecifier::ClusterSpecifierPlugin(_))
        | Some(ClusterSpecifier::InlineClusterSpecifierPlugin(_)) => Ok(None),
        None => Err(ValidationError::new("missing cluster specifier")),
    }
}

impl RouteMatcher {
    // Returns Ok(None) for path specifiers that are skipped.
    fn from_xds(m: xds_route::RouteMatch) -> Result<Option<Self>, ValidationError> {
        let case_insensitive = !m.case_sensitive.map(|b| b.value).unwrap_or(true);
        let path = match m.path_specifier {
            Some(PathSpecifier::Prefix(prefix)) => PathMatcher::Prefix(prefix),
            Some(PathSpecifier::Path(path)) => PathMatcher::Exact(path),
            Some(PathSpecifier::SafeRegex(regex)) => {
                PathMatcher::Regex(compile(&regex.regex, false).with_field("safe_regex")?)
            }
            Some(_) => return Ok(None),
            None => return Err(ValidationError::new("missing path specifier")),
        };
        let headers = m
            .headers
            .into_iter()
            .enumerate()
            .map(|(i, h)| HeaderMatcher::from_xds(h).with_field_index("headers", i))
            .collect::<Result<Vec<_>, _>>()?;
        let fraction_per_million = m
            .runtime_fraction
            .and_then(|rf| rf.default_value)
            .map(|f| per_million(&f))
            .transpose()
            .with_field("runtime_fraction")?;
        Ok(Some(Self {
            path,
            case_insensitive,
            headers,
            fraction_per_million,
        }))
    }

    /// Whether the path of a call (`/service/method`) matches.
    pub fn matches_path(&self, path: &str) -> bool {
        match &self.path {
            PathMatcher::Prefix(prefix) if self.case_insensitive => path
                .to_ascii_lowercase()
                .starts_with(&prefix.to_ascii_lowercase()),
            PathMatcher::Prefix(prefix) => path.starts_with(prefix.as_str()),
            PathMatcher::Exact(exact) if self.case_insensitive => path.eq_ignore_ascii_case(exact),
            PathMatcher::Exact(exact) => path == exact,
            PathMatcher::Regex(regex) => regex.is_match(path),
        }
    }
}

impl HeaderMatcher {
    fn from_xds(h: xds_route::HeaderMatcher) -> Result<Self, ValidationError> {
        let kind = match h.header_match_specifier {
            Some(HeaderMatchSpecifier::ExactMatch(value)) => HeaderMatchKind::Exact(value),
            Some(HeaderMatchSpecifier::SafeRegexMatch(regex)) => {
                HeaderMatchKind::Regex(compile(&regex.regex, false).with_field("safe_regex_match")?)
            }
            Some(HeaderMatchSpecifier::RangeMatch(range)) => {
                if range.start > range.end {
                    return Err(ValidationError::new("range start is after its end")
                        .with_field("range_match"));
                }
                HeaderMatchKind::Range {
                    start: range.start,
                    end: range.end,
                }
            }
            Some(HeaderMatchSpecifier::PresentMatch(present)) => HeaderMatchKind::Present(present),
            Some(HeaderMatchSpecifier::PrefixMatch(prefix)) => HeaderMatchKind::Prefix(prefix),
            Some(HeaderMatchSpecifier::SuffixMatch(suffix)) => HeaderMatchKind::Suffix(suffix),
            Some(_) => return Err(ValidationError::new("unsupported header matcher")),
            None => HeaderMatchKind::Present(true),
        };
        Ok(Self {
            name: h.name,
            kind,
            invert: h.invert_match,
        })
    }

    /// Matches against the header's value, `None` when the call does not
    /// carry the header.
    pub fn matches(&self, value: Option<&str>) -> bool {
        let matched = match (&self.kind, value) {
            (HeaderMatchKind::Present(present), value) => value.is_some() == *present,
            (_, None) => false,
            (HeaderMatchKind::Exact(exact), Some(v)) => v == exact,
            (HeaderMatchKind::Regex(regex), Some(v)) => regex.is_match(v),
            (HeaderMatchKind::Range { start, end }, Some(v)) => v
                .parse::<i64>()
                .is_ok_and(|n| *start <= n && n < *end),
            (HeaderMatchKind::Prefix(prefix), Some(v)) => v.starts_with(prefix.as_str()),
            (HeaderMatchKind::Suffix(suffix), Some(v)) => v.ends_with(suffix.as_str()),
        };
        matched != self.invert
    }
}

// Regexes must match the whole input.
fn compile(pattern: &str, case_insensitive: bool) -> Result<Regex, ValidationError> {
    let anchored = format!("^(?:{pattern})$");
    regex::RegexBuilder::new(&anchored)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|e| ValidationError::new(format!("invalid regex {pattern:?}: {e}")))
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    pub(crate) fn prefix_route(prefix: &str, clusters: &[(&str, u32)]) -> xds_route::Route {
        use envoy_types::pb::google::protobuf::UInt32Value;
        let cluster_specifier = if clusters.len() == 1 {
            ClusterSpecifier::Cluster(clusters[0].0.to_string())
        } else {
            ClusterSpecifier::WeightedClusters(xds_route::WeightedCluster {
                clusters: clusters
                    .iter()
                    .map(|(name, weight)| xds_route::weighted_cluster::ClusterWeight {
                        name: name.to_string(),
                        weight: Some(UInt32Value { value: *weight }),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            })
        };
        xds_route::Route {
            r#match: Some(xds_route::RouteMatch {
                path_specifier: Some(PathSpecifier::Prefix(prefix.to_string())),
                ..Default::default()
            }),
            action: Some(Action::Route(xds_route::RouteAction {
                cluster_specifier: Some(cluster_specifier),
                ..Default::default()
            })),
            ..Default::default()
        }
    }

    pub(crate) fn route_config(
        name: &str,
        domains: &[&str],
        routes: Vec<xds_route::Route>,
    ) -> xds_route::RouteConfiguration {
        xds_route::RouteConfiguration {
            name: name.to_string(),
            virtual_hosts: vec![xds_route::VirtualHost {
                name: "vh".to_string(),
                domains: domains.iter().map(|d| d.to_string()).collect(),
                routes,
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use envoy_types::pb::google::protobuf::{BoolValue, UInt32Value};

    fn validate(config: xds_route::RouteConfiguration) -> Result<RouteConfigUpdate, ValidationError> {
        RouteConfigUpdate::from_xds(config)
    }

    #[test]
    fn single_cluster_becomes_weighted_map() {
        let update = validate(route_config("rc", &["*"], vec![prefix_route("/", &[("c1", 1)])]))
            .unwrap();
        let route = &update.virtual_hosts[0].routes[0];
        let RouteAction::WeightedClusters(clusters) = &route.action else {
            panic!("expected weighted clusters");
        };
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters["c1"].weight, 1);
    }

    #[test]
    fn weighted_cluster_total_must_match() {
        let mut route = prefix_route("/", &[("a", 1), ("b", 3)]);
        if let Some(Action::Route(action)) = &mut route.action {
            if let Some(ClusterSpecifier::WeightedClusters(wc)) = &mut action.cluster_specifier {
                #[allow(deprecated)]
                let total_weight = &mut wc.total_weight;
                *total_weight = Some(UInt32Value { value: 5 });
            }
        }
        assert!(validate(route_config("rc", &["*"], vec![route])).is_err());

        let all_zero = prefix_route("/", &[("a", 0), ("b", 0)]);
        assert!(validate(route_config("rc", &["*"], vec![all_zero])).is_err());
    }

    #[test]
    fn zero_weight_clusters_are_dropped() {
        let update = validate(route_config(
            "rc",
            &["*"],
            vec![prefix_route("/", &[("a", 0), ("b", 2)])],
        ))
        .unwrap();
        let RouteAction::WeightedClusters(clusters) = &update.virtual_hosts[0].routes[0].action
        else {
            panic!("expected weighted clusters");
        };
        assert_eq!(clusters.keys().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn query_parameter_and_cluster_header_routes_are_skipped() {
        let mut query = prefix_route("/q", &[("a", 1)]);
        if let Some(m) = &mut query.r#match {
            m.query_parameters.push(xds_route::QueryParameterMatcher {
                name: "debug".to_string(),
                ..Default::default()
            });
        }
        let header = xds_route::Route {
            action: Some(Action::Route(xds_route::RouteAction {
                cluster_specifier: Some(ClusterSpecifier::ClusterHeader("x-cluster".to_string())),
                ..Default::default()
            })),
            ..prefix_route("/h", &[("a", 1)])
        };
        let update = validate(route_config(
            "rc",
            &["*"],
            vec![query, header, prefix_route("/", &[("a", 1)])],
        ))
        .unwrap();
        assert_eq!(update.virtual_hosts[0].routes.len(), 1);
    }

    #[test]
    fn missing_path_specifier_is_rejected() {
        let mut route = prefix_route("/", &[("a", 1)]);
        if let Some(m) = &mut route.r#match {
            m.path_specifier = None;
        }
        let err = validate(route_config("rc", &["*"], vec![route])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "virtual_hosts[0].routes[0].match: missing path specifier"
        );
    }

    #[test]
    fn non_forwarding_action_is_unsupported() {
        let route = xds_route::Route {
            action: Some(Action::NonForwardingAction(Default::default())),
            ..prefix_route("/", &[("a", 1)])
        };
        let update = validate(route_config("rc", &["*"], vec![route])).unwrap();
        assert!(matches!(
            update.virtual_hosts[0].routes[0].action,
            RouteAction::Unsupported
        ));
    }

    #[test]
    fn path_matching_honors_case_sensitivity() {
        let mut route = prefix_route("/Svc/", &[("a", 1)]);
        let update = validate(route_config("rc", &["*"], vec![route.clone()])).unwrap();
        let matcher = &update.virtual_hosts[0].routes[0].matcher;
        assert!(matcher.matches_path("/Svc/Method"));
        assert!(!matcher.matches_path("/svc/Method"));

        if let Some(m) = &mut route.r#match {
            m.case_sensitive = Some(BoolValue { value: false });
        }
        let update = validate(route_config("rc", &["*"], vec![route])).unwrap();
        assert!(update.virtual_hosts[0].routes[0].matcher.matches_path("/svc/Method"));
    }

    #[test]
    fn regex_paths_match_whole_path() {
        let route = xds_route::Route {
            r#match: Some(xds_route::RouteMatch {
                path_specifier: Some(PathSpecifier::SafeRegex(
                    envoy_types::pb::envoy::r#type::matcher::v3::RegexMatcher {
                        regex: "/svc/.*".to_string(),
                        ..Default::default()
                    },
                )),
                ..Default::default()
            }),
            ..prefix_route("/", &[("a", 1)])
        };
        let update = validate(route_config("rc", &["*"], vec![route])).unwrap();
        let matcher = &update.virtual_hosts[0].routes[0].matcher;
        assert!(matcher.matches_path("/svc/Method"));
        assert!(!matcher.matches_path("/other/svc/Method"));
    }

    #[test]
    fn header_matchers() {
        let matcher = |kind, invert| HeaderMatcher {
            name: "x".to_string(),
            kind,
            invert,
        };
        assert!(matcher(HeaderMatchKind::Exact("a".into()), false).matches(Some("a")));
        assert!(!matcher(HeaderMatchKind::Exact("a".into()), false).matches(None));
        assert!(matcher(HeaderMatchKind::Exact("a".into()), true).matches(Some("b")));
        assert!(matcher(HeaderMatchKind::Range { start: 1, end: 10 }, false).matches(Some("9")));
        assert!(!matcher(HeaderMatchKind::Range { start: 1, end: 10 }, false).matches(Some("10")));
        assert!(matcher(HeaderMatchKind::Present(false), false).matches(None));
        assert!(matcher(HeaderMatchKind::Prefix("ab".into()), false).matches(Some("abc")));
        assert!(matcher(HeaderMatchKind::Suffix("bc".into()), false).matches(Some("abc")));
    }
}
