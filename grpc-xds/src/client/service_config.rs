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

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;

/// An in-memory representation of a service config, usually provided to gRPC as
/// a JSON object.
///
/// Only the `loadBalancingConfig` list is interpreted.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ServiceConfig {
    /// LB policies in order of preference.
    pub load_balancing_config: Vec<LbPolicyConfig>,
}

/// One entry of a `loadBalancingConfig` list: a policy name and its raw
/// configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct LbPolicyConfig {
    pub name: String,
    pub config: ParsedJsonLbConfig,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServiceConfig {
    #[serde(default)]
    load_balancing_config: Vec<HashMap<String, serde_json::Value>>,
}

impl ServiceConfig {
    /// Parses a JSON service config.
    pub fn parse(json: &str) -> Result<Self, String> {
        let raw: RawServiceConfig =
            serde_json::from_str(json).map_err(|e| format!("invalid service config: {e}"))?;
        let load_balancing_config = parse_policy_list(raw.load_balancing_config)?;
        Ok(Self {
            load_balancing_config,
        })
    }
}

/// Converts a JSON list of single-key objects (`[{"round_robin": {}}]`) into
/// policy configs.
pub(crate) fn parse_policy_list(
    list: Vec<HashMap<String, serde_json::Value>>,
) -> Result<Vec<LbPolicyConfig>, String> {
    list.into_iter()
        .map(|entry| {
            if entry.len() != 1 {
                return Err(format!(
                    "each LB policy config must have exactly one key, found {}",
                    entry.len()
                ));
            }
            let (name, config) = entry.into_iter().next().ok_or("empty LB policy config")?;
            Ok(LbPolicyConfig {
                name,
                config: ParsedJsonLbConfig::from_value(config),
            })
        })
        .collect()
}

/// A JSON LB policy configuration that has been parsed but not yet
/// interpreted by a policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedJsonLbConfig {
    value: serde_json::Value,
}

impl ParsedJsonLbConfig {
    /// Parses `json` into a config.
    pub fn new(json: &str) -> Result<Self, String> {
        serde_json::from_str(json)
            .map(Self::from_value)
            .map_err(|e| format!("failed to parse LB config JSON: {e}"))
    }

    pub fn from_value(value: serde_json::Value) -> Self {
        Self { value }
    }

    pub fn value(&self) -> &serde_json::Value {
        &self.value
    }

    /// Deserializes the config into the type used by a policy.
    pub fn convert_to<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.value)
    }
}

/// A convenience wrapper for an LB policy's configuration object.
#[derive(Debug, Clone)]
pub struct LbConfig {
    config: Arc<dyn Any + Send + Sync>,
}

impl LbConfig {
    /// Create a new LbConfig wrapper containing the provided config.
    pub fn new(config: impl Any + Send + Sync) -> Self {
        LbConfig {
            config: Arc::new(config),
        }
    }

    /// Convenience method to extract the LB policy's configuration object.
    pub fn convert_to<T: 'static + Send + Sync>(&self) -> Option<Arc<T>> {
        self.config.clone().downcast::<T>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_service_config() {
        let config = ServiceConfig::parse(
            r#"{"loadBalancingConfig":[{"unknown_policy":{}},{"round_robin":{"a":1}}]}"#,
        )
        .unwrap();
        assert_eq!(config.load_balancing_config.len(), 2);
        assert_eq!(config.load_balancing_config[0].name, "unknown_policy");
        assert_eq!(config.load_balancing_config[1].name, "round_robin");
        assert_eq!(
            config.load_balancing_config[1].config.value(),
            &serde_json::json!({"a": 1})
        );
    }

    #[test]
    fn test_parse_empty_service_config() {
        assert_eq!(ServiceConfig::parse("{}").unwrap(), ServiceConfig::default());
    }

    #[test]
    fn test_policy_entry_with_two_keys_is_rejected() {
        assert!(ServiceConfig::parse(r#"{"loadBalancingConfig":[{"a":{},"b":{}}]}"#).is_err());
    }

    #[test]
    fn test_lb_config_downcast() {
        let config = LbConfig::new(42u32);
        assert_eq!(*config.convert_to::<u32>().unwrap(), 42);
        assert!(config.convert_to::<String>().is_none());
    }
}
