//! HTTP agent request building and response interpretation.

use std::path::PathBuf;

use serde_json::{Map, Value};
use url::Url;

use super::CheckValue;
use crate::error::CheckError;
use crate::item::{HttpAuth, HttpCheck, HttpMethod, OutputFormat, PostType, RetrieveMode};

/// Allow-list of HTTP status codes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusCodes {
    raw: String,
    ranges: Vec<(u16, u16)>,
}

impl StatusCodes {
    /// Parse `200,201,300-399`; an empty string accepts every status
    pub fn parse(raw: &str) -> Result<Self, CheckError> {
        let invalid = || CheckError::config(format!("Invalid status codes \"{raw}\""));
        let mut ranges = Vec::new();

        for token in raw.split(',').map(str::trim).filter(|token| !token.is_empty()) {
            let range = match token.split_once('-') {
                Some((from, to)) => {
                    let from: u16 = from.trim().parse().map_err(|_| invalid())?;
                    let to: u16 = to.trim().parse().map_err(|_| invalid())?;
                    if from > to {
                        return Err(invalid());
                    }
                    (from, to)
                }
                None => {
                    let code: u16 = token.parse().map_err(|_| invalid())?;
                    (code, code)
                }
            };
            ranges.push(range);
        }

        Ok(Self { raw: raw.trim().to_string(), ranges })
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn accepts(&self, status: u16) -> bool {
        self.is_empty() || self.ranges.iter().any(|&(from, to)| (from..=to).contains(&status))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Client certificate presented to the server
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientCertificate {
    pub cert_file: PathBuf,
    /// Key file; the certificate file is expected to hold the key when absent
    pub key_file: Option<PathBuf>,
    pub key_password: Option<String>,
}

/// Settings that live on the client rather than on a single request
///
/// Requests with equal profiles share one client and its connection pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ClientProfile {
    pub proxy: Option<String>,
    pub follow_redirects: bool,
    pub verify_peer: bool,
    pub verify_host: bool,
    pub client_certificate: Option<ClientCertificate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestAuth {
    None,
    Basic { username: String, password: String },
    Bearer { token: String },
}

/// What to do with a response once it arrives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseExpectation {
    pub status_codes: StatusCodes,
    pub retrieve_mode: RetrieveMode,
    pub output_format: OutputFormat,
}

/// Transport-ready HTTP request
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub auth: RequestAuth,
    pub profile: ClientProfile,
    pub expectation: ResponseExpectation,
}

impl HttpRequest {
    /// Build a request from an item; every failure here is a configuration error
    pub fn from_check(check: &HttpCheck) -> Result<Self, CheckError> {
        let mut url = parse_url(&check.url)?;
        if !check.query_fields.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &check.query_fields {
                pairs.append_pair(name, value);
            }
        }

        let mut headers = Vec::with_capacity(check.headers.len() + 1);
        for (name, value) in &check.headers {
            if name.trim().is_empty() {
                return Err(CheckError::config(format!("Invalid header \"{name}: {value}\"")));
            }
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        let content_type = match check.post_type {
            PostType::Raw => None,
            PostType::Json => Some("application/json"),
            PostType::Xml => Some("application/xml"),
        };
        if let Some(content_type) = content_type {
            if !headers.iter().any(|(name, _)| name.eq_ignore_ascii_case("content-type")) {
                headers.push(("Content-Type".to_string(), content_type.to_string()));
            }
        }

        let body = (!check.posts.is_empty()).then(|| check.posts.clone());

        let auth = match &check.auth {
            HttpAuth::None => RequestAuth::None,
            HttpAuth::Basic { username, password } => {
                RequestAuth::Basic { username: username.clone(), password: password.clone() }
            }
            HttpAuth::Bearer { token } => RequestAuth::Bearer { token: token.clone() },
            HttpAuth::Ntlm => return Err(unsupported_auth("NTLM")),
            HttpAuth::Kerberos => return Err(unsupported_auth("Kerberos")),
            HttpAuth::Digest => return Err(unsupported_auth("digest")),
        };

        let client_certificate = match (&check.ssl_cert_file, &check.ssl_key_file) {
            (Some(cert_file), key_file) => Some(ClientCertificate {
                cert_file: cert_file.clone(),
                key_file: key_file.clone(),
                key_password: check.ssl_key_password.clone(),
            }),
            (None, Some(_)) => {
                return Err(CheckError::config("SSL key file is set without a certificate file"));
            }
            (None, None) => None,
        };

        let proxy = match check.http_proxy.as_deref().map(str::trim) {
            Some("") | None => None,
            Some(proxy) => Some(proxy.to_string()),
        };

        Ok(Self {
            method: check.method,
            url,
            headers,
            body,
            auth,
            profile: ClientProfile {
                proxy,
                follow_redirects: check.follow_redirects,
                verify_peer: check.verify_peer,
                verify_host: check.verify_host,
                client_certificate,
            },
            expectation: ResponseExpectation {
                status_codes: StatusCodes::parse(&check.status_codes)?,
                retrieve_mode: check.retrieve_mode,
                output_format: check.output_format,
            },
        })
    }
}

fn unsupported_auth(kind: &str) -> CheckError {
    CheckError::config(format!("{kind} authentication is not supported"))
}

/// Parse a URL, defaulting to `http://` when no scheme is given
fn parse_url(raw: &str) -> Result<Url, CheckError> {
    let raw = raw.trim();
    let with_scheme = if raw.contains("://") { raw.to_string() } else { format!("http://{raw}") };
    let parsed = Url::parse(&with_scheme).map_err(|e| CheckError::config(format!("Invalid URL \"{raw}\": {e}")))?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(CheckError::config(format!("Unsupported URL scheme: {other}"))),
    }
}

/// Raw response handed back by the transport
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

/// Transfer that never produced a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
    pub message: String,
    pub timed_out: bool,
}

impl TransportFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), timed_out: false }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self { message: message.into(), timed_out: true }
    }
}

/// Turn a finished transfer into the item's value
///
/// The response is accepted when the allow-list is empty or contains its
/// status; the error text then names both and carries the body if any.
pub fn interpret_response(
    expectation: &ResponseExpectation,
    via_proxy: bool,
    response: HttpResponse,
) -> Result<CheckValue, CheckError> {
    if response.status == 407 && via_proxy {
        return Err(CheckError::gateway(format!(
            "Proxy rejected the request with response code \"{}\"",
            response.status
        )));
    }

    if !expectation.status_codes.accepts(response.status) {
        let mut message = format!(
            "Response code \"{}\" did not match any of the required status codes \"{}\"",
            response.status,
            expectation.status_codes.as_str()
        );
        if !response.body.is_empty() {
            message.push('\n');
            message.push_str(&response.body);
        }
        return Err(CheckError::not_supported(message));
    }

    Ok(CheckValue::Text(render_output(expectation, response)))
}

/// Error for a transfer that failed below HTTP
pub fn transport_error(failure: TransportFailure, via_proxy: bool) -> CheckError {
    if via_proxy && !failure.timed_out {
        return CheckError::gateway(format!("Cannot perform request through proxy: {}", failure.message));
    }
    CheckError::network(format!("Cannot perform request: {}", failure.message))
}

fn render_output(expectation: &ResponseExpectation, response: HttpResponse) -> String {
    let with_headers = matches!(expectation.retrieve_mode, RetrieveMode::Headers | RetrieveMode::Both);
    let with_body = matches!(expectation.retrieve_mode, RetrieveMode::Body | RetrieveMode::Both);

    match expectation.output_format {
        OutputFormat::Raw => {
            let mut out = String::new();
            if with_headers {
                for (name, value) in &response.headers {
                    out.push_str(&format!("{name}: {value}\r\n"));
                }
                out.push_str("\r\n");
            }
            if with_body {
                out.push_str(&response.body);
            }
            out
        }
        OutputFormat::Json => {
            let mut object = Map::new();
            if with_headers {
                let headers = response
                    .headers
                    .iter()
                    .map(|(name, value)| (name.clone(), Value::String(value.clone())))
                    .collect::<Map<_, _>>();
                object.insert("header".to_string(), Value::Object(headers));
            }
            if with_body {
                let body = serde_json::from_str::<Value>(&response.body)
                    .unwrap_or_else(|_| Value::String(response.body.clone()));
                object.insert("body".to_string(), body);
            }
            Value::Object(object).to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResultCode;

    fn check(url: &str, status_codes: &str) -> HttpCheck {
        HttpCheck { url: url.to_string(), status_codes: status_codes.to_string(), ..Default::default() }
    }

    fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse { status, headers: vec![("Server".into(), "nginx".into())], body: body.into() }
    }

    #[test]
    fn status_code_lists() {
        let codes = StatusCodes::parse("200, 201,300-399").unwrap();
        assert!(codes.accepts(200));
        assert!(codes.accepts(201));
        assert!(codes.accepts(302));
        assert!(!codes.accepts(404));

        assert!(StatusCodes::parse("").unwrap().accepts(500));
        assert_eq!(StatusCodes::parse("20x").unwrap_err().code, ResultCode::ConfigError);
        assert!(StatusCodes::parse("399-300").is_err());
    }

    #[test]
    fn allow_listed_status_yields_body() {
        let request = HttpRequest::from_check(&check("http://192.0.2.1/health", "200,201")).unwrap();
        let value = interpret_response(&request.expectation, false, response(200, "OK")).unwrap();
        assert_eq!(value, CheckValue::Text("OK".into()));
    }

    #[test]
    fn rejected_status_names_code_and_list() {
        let request = HttpRequest::from_check(&check("http://192.0.2.1/health", "200,201")).unwrap();
        let err = interpret_response(&request.expectation, false, response(404, "missing")).unwrap_err();
        assert_eq!(err.code, ResultCode::NotSupported);
        assert!(err.message.contains("404"));
        assert!(err.message.contains("200,201"));
        assert!(err.message.ends_with("\nmissing"));
    }

    #[test]
    fn builds_query_headers_and_body() {
        let mut item = check("example.com/api", "");
        item.query_fields = vec![("q".into(), "a b".into())];
        item.headers = vec![("X-Token".into(), " abc ".into())];
        item.posts = "{\"x\":1}".into();
        item.post_type = PostType::Json;
        item.method = HttpMethod::Post;

        let request = HttpRequest::from_check(&item).unwrap();
        assert_eq!(request.url.as_str(), "http://example.com/api?q=a+b");
        assert_eq!(request.headers[0], ("X-Token".to_string(), "abc".to_string()));
        assert!(request.headers.contains(&("Content-Type".to_string(), "application/json".to_string())));
        assert_eq!(request.body.as_deref(), Some("{\"x\":1}"));
    }

    #[test]
    fn config_errors() {
        assert_eq!(HttpRequest::from_check(&check("ftp://x", "")).unwrap_err().code, ResultCode::ConfigError);
        assert_eq!(HttpRequest::from_check(&check("http://", "")).unwrap_err().code, ResultCode::ConfigError);

        let mut ntlm = check("http://x", "");
        ntlm.auth = HttpAuth::Ntlm;
        assert_eq!(HttpRequest::from_check(&ntlm).unwrap_err().code, ResultCode::ConfigError);
    }

    #[test]
    fn host_and_port_without_scheme_default_to_http() {
        for (raw, expected) in [
            ("example.com:8080/status", "http://example.com:8080/status"),
            ("localhost:8080/health", "http://localhost:8080/health"),
            ("192.0.2.1:8080/x", "http://192.0.2.1:8080/x"),
            ("https://example.com/secure", "https://example.com/secure"),
        ] {
            let request = HttpRequest::from_check(&check(raw, "")).unwrap();
            assert_eq!(request.url.as_str(), expected);
        }
    }

    #[test]
    fn json_output_with_headers() {
        let mut item = check("http://x", "");
        item.output_format = OutputFormat::Json;
        item.retrieve_mode = RetrieveMode::Both;
        let request = HttpRequest::from_check(&item).unwrap();

        let value = interpret_response(&request.expectation, false, response(200, "{\"up\":true}")).unwrap();
        let CheckValue::Text(text) = value else { panic!("expected text") };
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["header"]["Server"], "nginx");
        assert_eq!(parsed["body"]["up"], true);
    }

    #[test]
    fn proxy_failures_are_gateway_errors() {
        let err = transport_error(TransportFailure::new("connection refused"), true);
        assert_eq!(err.code, ResultCode::GatewayError);

        let err = transport_error(TransportFailure::new("connection refused"), false);
        assert_eq!(err.code, ResultCode::NetworkError);

        let expectation = HttpRequest::from_check(&check("http://x", "")).unwrap().expectation;
        let err = interpret_response(&expectation, true, response(407, "")).unwrap_err();
        assert_eq!(err.code, ResultCode::GatewayError);
    }
}
