//! Typed ingress routing records.
//!
//! The mesh's ingress gateway accepts HTTP on every host and routes `/` to the
//! experiment's entrypoint service. Records are validated when built and
//! serialized as a multi-document YAML manifest.

use std::collections::BTreeMap;

use meshbench_core::{Error, Result};
use serde::{Deserialize, Serialize};

pub const NETWORKING_API_VERSION: &str = "networking.istio.io/v1alpha3";
pub const GATEWAY_NAME: &str = "entrypoint-gateway";
pub const VIRTUAL_SERVICE_NAME: &str = "entrypoint";

/// Check a name (or dotted host) against RFC 1123 label rules.
pub fn validate_dns_name(name: &str) -> Result<()> {
    let valid_label = |label: &str| {
        !label.is_empty()
            && label.len() <= 63
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    };
    if name.len() <= 253 && name.split('.').all(valid_label) {
        Ok(())
    } else {
        Err(Error::configuration(format!(
            "{name:?} is not a valid DNS-1123 name"
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
}

/// A Kubernetes-style object with a typed spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource<S> {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: S,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewaySpec {
    pub selector: BTreeMap<String, String>,
    pub servers: Vec<GatewayServer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayServer {
    pub hosts: Vec<String>,
    pub port: GatewayPort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayPort {
    pub name: String,
    pub number: u16,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualServiceSpec {
    pub hosts: Vec<String>,
    pub gateways: Vec<String>,
    pub http: Vec<HttpRoute>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRoute {
    #[serde(rename = "match")]
    pub matches: Vec<HttpMatch>,
    pub route: Vec<RouteDestination>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpMatch {
    pub uri: UriMatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UriMatch {
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDestination {
    pub destination: Destination,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub host: String,
    pub port: PortSelector,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSelector {
    pub number: u16,
}

pub type Gateway = Resource<GatewaySpec>;
pub type VirtualService = Resource<VirtualServiceSpec>;

/// Gateway accepting HTTP on `port` for all hosts, bound to the ingress pods.
pub fn gateway(port: u16) -> Result<Gateway> {
    if port == 0 {
        return Err(Error::configuration("ingress gateway port must be non-zero"));
    }
    Ok(Resource {
        api_version: NETWORKING_API_VERSION.to_string(),
        kind: "Gateway".to_string(),
        metadata: ObjectMeta {
            name: GATEWAY_NAME.to_string(),
        },
        spec: GatewaySpec {
            selector: BTreeMap::from([("istio".to_string(), "ingressgateway".to_string())]),
            servers: vec![GatewayServer {
                hosts: vec!["*".to_string()],
                port: GatewayPort {
                    name: "http".to_string(),
                    number: port,
                    protocol: "HTTP".to_string(),
                },
            }],
        },
    })
}

/// Route every path through [`GATEWAY_NAME`] to `entrypoint:service_port`.
pub fn entrypoint_route(entrypoint: &str, service_port: u16) -> Result<VirtualService> {
    validate_dns_name(entrypoint)?;
    if service_port == 0 {
        return Err(Error::configuration("service port must be non-zero"));
    }
    Ok(Resource {
        api_version: NETWORKING_API_VERSION.to_string(),
        kind: "VirtualService".to_string(),
        metadata: ObjectMeta {
            name: VIRTUAL_SERVICE_NAME.to_string(),
        },
        spec: VirtualServiceSpec {
            hosts: vec!["*".to_string()],
            gateways: vec![GATEWAY_NAME.to_string()],
            http: vec![HttpRoute {
                matches: vec![HttpMatch {
                    uri: UriMatch {
                        prefix: "/".to_string(),
                    },
                }],
                route: vec![RouteDestination {
                    destination: Destination {
                        host: entrypoint.to_string(),
                        port: PortSelector {
                            number: service_port,
                        },
                    },
                }],
            }],
        },
    })
}

/// The gateway and route as one manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRules {
    pub gateway: Gateway,
    pub route: VirtualService,
}

impl IngressRules {
    pub fn for_entrypoint(entrypoint: &str, service_port: u16, gateway_port: u16) -> Result<Self> {
        Ok(Self {
            gateway: gateway(gateway_port)?,
            route: entrypoint_route(entrypoint, service_port)?,
        })
    }

    pub fn to_yaml(&self) -> Result<String> {
        let gateway = serde_yaml::to_string(&self.gateway)?;
        let route = serde_yaml::to_string(&self.route)?;
        Ok(format!("{gateway}---\n{route}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns_names() {
        for ok in ["a", "service-graph", "istio-system", "svc-0.ns"] {
            assert!(validate_dns_name(ok).is_ok(), "{ok}");
        }
        for bad in ["", "-a", "a-", "A", "a_b", "a..b", "x".repeat(64).as_str()] {
            assert!(validate_dns_name(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_rules_yaml_shape() {
        let yaml = IngressRules::for_entrypoint("a", 8080, 80)
            .unwrap()
            .to_yaml()
            .unwrap();

        let docs: Vec<serde_yaml::Value> = serde_yaml::Deserializer::from_str(&yaml)
            .map(serde_yaml::Value::deserialize)
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(docs.len(), 2);

        let gw = &docs[0];
        assert_eq!(gw["apiVersion"].as_str(), Some(NETWORKING_API_VERSION));
        assert_eq!(gw["kind"].as_str(), Some("Gateway"));
        assert_eq!(gw["spec"]["selector"]["istio"].as_str(), Some("ingressgateway"));
        assert_eq!(gw["spec"]["servers"][0]["port"]["number"].as_u64(), Some(80));

        let vs = &docs[1];
        assert_eq!(vs["metadata"]["name"].as_str(), Some("entrypoint"));
        assert_eq!(vs["spec"]["gateways"][0].as_str(), Some(GATEWAY_NAME));
        let http = &vs["spec"]["http"][0];
        assert_eq!(http["match"][0]["uri"]["prefix"].as_str(), Some("/"));
        assert_eq!(http["route"][0]["destination"]["host"].as_str(), Some("a"));
        assert_eq!(
            http["route"][0]["destination"]["port"]["number"].as_u64(),
            Some(8080)
        );
    }

    #[test]
    fn test_invalid_inputs_rejected_at_construction() {
        assert!(entrypoint_route("Bad_Name", 8080).is_err());
        assert!(entrypoint_route("a", 0).is_err());
        assert!(gateway(0).is_err());
    }
}
