use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub type ItemId = u64;
pub type HostId = u64;
pub type InterfaceId = u64;

/// Which class of items a poller instance serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerType {
    Agent,
    HttpAgent,
}

impl fmt::Display for PollerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollerType::Agent => write!(f, "agent poller"),
            PollerType::HttpAgent => write!(f, "http agent poller"),
        }
    }
}

/// Type of value an item stores
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Float,
    Str,
    Log,
    #[serde(alias = "uint64")]
    Unsigned,
    #[default]
    Text,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Float => "Numeric (float)",
            ValueType::Str => "Character",
            ValueType::Log => "Log",
            ValueType::Unsigned => "Numeric (unsigned)",
            ValueType::Text => "Text",
        };
        f.write_str(name)
    }
}

/// Availability of an interface as last published by the availability manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    #[default]
    Unknown,
    Available,
    Unavailable,
}

/// Network endpoint of a host, the unit of availability tracking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub id: InterfaceId,

    /// IP address or DNS name the check connects to
    pub addr: String,

    pub port: u16,

    #[serde(default)]
    pub available: Availability,

    /// Start of the current error window (seconds), zero when there is none
    #[serde(default)]
    pub errors_from: i64,
}

impl Interface {
    /// Whether the interface is healthy with nothing to recover from
    pub fn is_settled_available(&self) -> bool {
        self.available == Availability::Available && self.errors_from == 0
    }
}

/// Transport security used towards an agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum TlsConnect {
    #[default]
    Unencrypted,
    Certificate(CertificateTls),
    Psk(PskTls),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CertificateTls {
    /// CA bundle; the bundled web PKI roots are used when absent
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PskTls {
    pub identity: String,
    pub psk: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub name: String,
    #[serde(default)]
    pub tls: TlsConnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Agent,
    HttpAgent,
}

/// One configured check, as handed out by the configuration cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDescriptor {
    pub item_id: ItemId,
    pub host: Host,
    pub interface: Interface,
    #[serde(default)]
    pub value_type: ValueType,
    #[serde(default)]
    pub flags: u8,

    /// Item key as configured, before macro expansion
    pub key_orig: String,

    pub check: CheckKind,
}

impl ItemDescriptor {
    pub fn item_type(&self) -> ItemType {
        match self.check {
            CheckKind::Agent(_) => ItemType::Agent,
            CheckKind::Http(_) => ItemType::HttpAgent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckKind {
    Agent(AgentCheck),
    Http(HttpCheck),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCheck {
    /// Expanded key sent to the agent
    pub key: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Head,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostType {
    #[default]
    Raw,
    Json,
    Xml,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrieveMode {
    #[default]
    Body,
    Headers,
    Both,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Raw,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HttpAuth {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    Bearer {
        token: String,
    },
    Ntlm,
    Kerberos,
    Digest,
}

/// HTTP agent item settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpCheck {
    pub url: String,
    pub method: HttpMethod,
    pub query_fields: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub posts: String,
    pub post_type: PostType,
    pub retrieve_mode: RetrieveMode,
    pub output_format: OutputFormat,

    /// Accepted status codes and ranges, e.g. `200,201,300-399`; empty accepts any
    pub status_codes: String,

    pub follow_redirects: bool,
    pub http_proxy: Option<String>,
    pub verify_peer: bool,
    pub verify_host: bool,
    pub ssl_cert_file: Option<PathBuf>,
    pub ssl_key_file: Option<PathBuf>,
    pub ssl_key_password: Option<String>,
    pub auth: HttpAuth,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settled_interface_requires_no_error_window() {
        let mut interface = Interface {
            id: 1,
            addr: "10.0.0.1".into(),
            port: 10050,
            available: Availability::Available,
            errors_from: 0,
        };
        assert!(interface.is_settled_available());

        interface.errors_from = 1_700_000_000;
        assert!(!interface.is_settled_available());

        interface.errors_from = 0;
        interface.available = Availability::Unknown;
        assert!(!interface.is_settled_available());
    }

    #[test]
    fn item_descriptor_from_toml() {
        let raw = r#"
            item_id = 7
            key_orig = "web.page"
            value_type = "text"

            [host]
            id = 1
            name = "web01"

            [interface]
            id = 3
            addr = "192.0.2.10"
            port = 80

            [check]
            type = "http"
            url = "http://192.0.2.10/status"
            status_codes = "200,201"
        "#;

        let item: ItemDescriptor = toml::from_str(raw).unwrap();
        assert_eq!(item.item_type(), ItemType::HttpAgent);
        assert_eq!(item.host.tls, TlsConnect::Unencrypted);
        assert_eq!(item.interface.available, Availability::Unknown);
        match item.check {
            CheckKind::Http(http) => {
                assert_eq!(http.method, HttpMethod::Get);
                assert_eq!(http.status_codes, "200,201");
            }
            CheckKind::Agent(_) => panic!("expected an http check"),
        }
    }
}
