// src/device/endpoint.rs
use reqwest::Url;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use crate::error::{Result, SyncError};

pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_MQTTS_PORT: u16 = 8883;

/// Where the controller lives: a device on the LAN speaking HTTP, or a
/// broker relaying its topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEndpoint {
    Http { addr: Ipv4Addr, port: u16 },
    Broker { host: String, port: u16, tls: bool },
}

impl DeviceEndpoint {
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let invalid = || SyncError::InvalidEndpoint(trimmed.to_string());

        if trimmed.is_empty() {
            return Err(invalid());
        }

        if trimmed.contains("://") {
            return Self::parse_broker(trimmed).ok_or_else(invalid);
        }

        let (addr, port) = if let Ok(socket) = SocketAddrV4::from_str(trimmed) {
            (*socket.ip(), socket.port())
        } else {
            let addr = Ipv4Addr::from_str(trimmed).map_err(|_| invalid())?;
            (addr, DEFAULT_HTTP_PORT)
        };

        if addr.is_unspecified() || addr.is_broadcast() || port == 0 {
            return Err(invalid());
        }

        Ok(DeviceEndpoint::Http { addr, port })
    }

    fn parse_broker(input: &str) -> Option<Self> {
        let url = Url::parse(input).ok()?;

        let tls = match url.scheme() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" => true,
            _ => return None,
        };

        if !url.username().is_empty() || url.query().is_some() || url.fragment().is_some() {
            return None;
        }
        if !(url.path().is_empty() || url.path() == "/") {
            return None;
        }

        let host = url.host_str().filter(|h| !h.is_empty())?.to_string();
        let port = url
            .port()
            .unwrap_or(if tls { DEFAULT_MQTTS_PORT } else { DEFAULT_MQTT_PORT });

        Some(DeviceEndpoint::Broker { host, port, tls })
    }

    /// Base URL for the HTTP transport, `None` for brokers.
    pub fn http_base_url(&self) -> Option<String> {
        match self {
            DeviceEndpoint::Http { addr, port } => Some(format!("http://{}:{}", addr, port)),
            DeviceEndpoint::Broker { .. } => None,
        }
    }

    pub fn is_broker(&self) -> bool {
        matches!(self, DeviceEndpoint::Broker { .. })
    }
}

impl FromStr for DeviceEndpoint {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Canonical form, which is also what gets persisted.
impl std::fmt::Display for DeviceEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceEndpoint::Http { addr, port } if *port == DEFAULT_HTTP_PORT => write!(f, "{}", addr),
            DeviceEndpoint::Http { addr, port } => write!(f, "{}:{}", addr, port),
            DeviceEndpoint::Broker { host, port, tls } => {
                let scheme = if *tls { "mqtts" } else { "mqtt" };
                write!(f, "{}://{}:{}", scheme, host, port)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dotted_quad() {
        let endpoint = DeviceEndpoint::parse("192.168.1.50").unwrap();
        assert_eq!(
            endpoint,
            DeviceEndpoint::Http { addr: Ipv4Addr::new(192, 168, 1, 50), port: 80 }
        );
        assert_eq!(endpoint.http_base_url().unwrap(), "http://192.168.1.50:80");
        assert_eq!(endpoint.to_string(), "192.168.1.50");
    }

    #[test]
    fn test_parse_dotted_quad_with_port() {
        let endpoint = DeviceEndpoint::parse(" 10.0.0.7:8080 ").unwrap();
        assert_eq!(endpoint.to_string(), "10.0.0.7:8080");
    }

    #[test]
    fn test_rejects_malformed_addresses() {
        for input in ["", "192.168.1", "192.168.1.256", "192.168.1.50.1", "abc", "0.0.0.0", "255.255.255.255", "1.2.3.4:0"] {
            assert!(
                matches!(DeviceEndpoint::parse(input), Err(SyncError::InvalidEndpoint(_))),
                "{} should be rejected",
                input
            );
        }
    }

    #[test]
    fn test_parse_broker_uri() {
        let endpoint = DeviceEndpoint::parse("mqtt://mqtt.eclipseprojects.io").unwrap();
        assert_eq!(
            endpoint,
            DeviceEndpoint::Broker {
                host: "mqtt.eclipseprojects.io".to_string(),
                port: 1883,
                tls: false
            }
        );
        assert!(endpoint.is_broker());
        assert!(endpoint.http_base_url().is_none());

        let secure = DeviceEndpoint::parse("mqtts://broker.local:9000").unwrap();
        assert_eq!(secure.to_string(), "mqtts://broker.local:9000");
    }

    #[test]
    fn test_rejects_unsupported_broker_uris() {
        for input in ["http://broker.local", "mqtt://", "mqtt://broker.local/topic", "mqtt://u:p@broker.local"] {
            assert!(DeviceEndpoint::parse(input).is_err(), "{} should be rejected", input);
        }
    }

    #[test]
    fn test_display_roundtrips_through_parse() {
        for input in ["192.168.1.50", "10.0.0.7:8080", "mqtt://broker.local:1883"] {
            let endpoint = DeviceEndpoint::parse(input).unwrap();
            assert_eq!(DeviceEndpoint::parse(&endpoint.to_string()).unwrap(), endpoint);
        }
    }
}
