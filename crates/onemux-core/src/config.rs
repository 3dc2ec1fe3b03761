//! Connection and endpoint configuration types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// One downstream target endpoint.
///
/// Accepts either a bare URL string or an object carrying per-target options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetEndpoint {
    /// `"ws://host:port/path"`
    Url(String),
    /// `{url, headers?, sakoya_protocol?, disabled?}`
    Detailed {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        sakoya_protocol: bool,
        #[serde(default)]
        disabled: bool,
    },
}

impl TargetEndpoint {
    /// The endpoint URL.
    pub fn url(&self) -> &str {
        match self {
            TargetEndpoint::Url(url) => url,
            TargetEndpoint::Detailed { url, .. } => url,
        }
    }

    /// Custom headers to overlay on the propagated client headers.
    pub fn headers(&self) -> Option<&HashMap<String, String>> {
        match self {
            TargetEndpoint::Url(_) => None,
            TargetEndpoint::Detailed { headers, .. } => Some(headers),
        }
    }

    /// Whether this target speaks the Sakoya dialect.
    pub fn is_sakoya(&self) -> bool {
        matches!(
            self,
            TargetEndpoint::Detailed {
                sakoya_protocol: true,
                ..
            }
        )
    }

    /// Whether this slot is switched off. Disabled slots never connect.
    pub fn is_disabled(&self) -> bool {
        matches!(self, TargetEndpoint::Detailed { disabled: true, .. })
    }
}

/// Configuration of one proxy connection: the client listen endpoint and the
/// downstream target set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Whether this connection is routed at all.
    #[serde(default)]
    pub enabled: bool,
    /// Client listen endpoint, `ws://host:port/path`.
    pub client_endpoint: String,
    /// Downstream targets, indexed 1..N in routing terms.
    #[serde(default)]
    pub target_endpoints: Vec<TargetEndpoint>,
}

impl ConnectionConfig {
    /// Parses the client endpoint into its route key parts.
    pub fn client_route(&self) -> Result<ClientEndpoint, TransportError> {
        ClientEndpoint::parse(&self.client_endpoint)
    }
}

/// Parsed client listen endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEndpoint {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl ClientEndpoint {
    /// Parses `ws://host:port/path`. The port defaults to 80 and the path
    /// to `/`.
    pub fn parse(endpoint: &str) -> Result<Self, TransportError> {
        let rest = endpoint.strip_prefix("ws://").ok_or_else(|| {
            TransportError::invalid_endpoint(endpoint, "client endpoint must use the ws:// scheme")
        })?;

        let (host_port, path) = match rest.split_once('/') {
            Some((host_port, path)) => (host_port, format!("/{path}")),
            None => (rest, "/".to_string()),
        };

        let (host, port) = match host_port.split_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|e| {
                    TransportError::invalid_endpoint(endpoint, format!("bad port: {e}"))
                })?;
                (host, port)
            }
            None => (host_port, 80),
        };

        if host.is_empty() {
            return Err(TransportError::invalid_endpoint(endpoint, "empty host"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_client_endpoint() {
        let ep = ClientEndpoint::parse("ws://0.0.0.0:5111/bs/yunzai").unwrap();
        assert_eq!(ep.host, "0.0.0.0");
        assert_eq!(ep.port, 5111);
        assert_eq!(ep.path, "/bs/yunzai");

        let ep = ClientEndpoint::parse("ws://127.0.0.1:9000").unwrap();
        assert_eq!(ep.path, "/");

        let ep = ClientEndpoint::parse("ws://localhost/ws").unwrap();
        assert_eq!(ep.port, 80);

        assert!(ClientEndpoint::parse("http://127.0.0.1:9000").is_err());
        assert!(ClientEndpoint::parse("ws://:9000/ws").is_err());
        assert!(ClientEndpoint::parse("ws://host:notaport/ws").is_err());
    }

    #[test]
    fn test_target_endpoint_forms() {
        let bare: TargetEndpoint = serde_json::from_value(json!("ws://127.0.0.1:2536/ws")).unwrap();
        assert_eq!(bare.url(), "ws://127.0.0.1:2536/ws");
        assert!(!bare.is_sakoya());
        assert!(!bare.is_disabled());

        let detailed: TargetEndpoint = serde_json::from_value(json!({
            "url": "ws://127.0.0.1:8765/ws/Bot",
            "headers": {"authorization": "Bearer t"},
            "sakoya_protocol": true,
        }))
        .unwrap();
        assert!(detailed.is_sakoya());
        assert_eq!(
            detailed.headers().unwrap().get("authorization").unwrap(),
            "Bearer t"
        );

        let disabled: TargetEndpoint =
            serde_json::from_value(json!({"url": "ws://x/ws", "disabled": true})).unwrap();
        assert!(disabled.is_disabled());
    }

    #[test]
    fn test_connection_config_defaults() {
        let cfg: ConnectionConfig = serde_json::from_value(json!({
            "client_endpoint": "ws://0.0.0.0:5111/bs/a",
        }))
        .unwrap();
        assert!(!cfg.enabled);
        assert!(cfg.target_endpoints.is_empty());
        assert_eq!(cfg.client_route().unwrap().port, 5111);
    }
}
