use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::redirect::Policy;
use reqwest::{Client, Identity, Method, Proxy};
use tracing::debug;

use super::HttpTransport;
use crate::codec::http::{ClientCertificate, ClientProfile, HttpRequest, HttpResponse, RequestAuth, TransportFailure};
use crate::error::CheckError;
use crate::item::HttpMethod;

const MAX_REDIRECTS: usize = 10;

/// reqwest-backed transport, one pooled client per profile
pub struct ReqwestTransport {
    timeout: Duration,
    source_ip: Option<IpAddr>,
    clients: Mutex<HashMap<ClientProfile, Client>>,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration, source_ip: Option<IpAddr>) -> Self {
        Self { timeout, source_ip, clients: Mutex::new(HashMap::new()) }
    }

    fn client(&self, profile: &ClientProfile) -> Result<Client, CheckError> {
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(profile) {
            return Ok(client.clone());
        }

        let client = self.build_client(profile)?;
        debug!(profiles = clients.len() + 1, "built HTTP client for a new profile");
        clients.insert(profile.clone(), client.clone());
        Ok(client)
    }

    fn build_client(&self, profile: &ClientProfile) -> Result<Client, CheckError> {
        let redirects = if profile.follow_redirects { Policy::limited(MAX_REDIRECTS) } else { Policy::none() };

        let mut builder = Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("uppe-poller/", env!("CARGO_PKG_VERSION")))
            .redirect(redirects)
            .danger_accept_invalid_certs(!profile.verify_peer)
            .danger_accept_invalid_hostnames(!profile.verify_host)
            .local_address(self.source_ip);

        if let Some(proxy) = &profile.proxy {
            let proxy = Proxy::all(proxy.as_str())
                .map_err(|e| CheckError::config(format!("Invalid HTTP proxy \"{proxy}\": {e}")))?;
            builder = builder.proxy(proxy);
        }

        if let Some(certificate) = &profile.client_certificate {
            builder = builder.identity(load_identity(certificate)?);
        }

        builder.build().map_err(|e| CheckError::config(format!("Cannot create HTTP client: {e}")))
    }
}

fn load_identity(certificate: &ClientCertificate) -> Result<Identity, CheckError> {
    if certificate.key_password.is_some() {
        return Err(CheckError::config("Encrypted SSL keys are not supported"));
    }

    let read = |path: &std::path::Path| {
        std::fs::read(path).map_err(|e| CheckError::config(format!("Cannot read {}: {e}", path.display())))
    };

    let cert = read(&certificate.cert_file)?;
    let key = match &certificate.key_file {
        Some(key_file) => read(key_file)?,
        None => cert.clone(),
    };

    Identity::from_pkcs8_pem(&cert, &key).map_err(|e| CheckError::config(format!("Cannot load SSL certificate: {e}")))
}

fn method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Head => Method::HEAD,
    }
}

fn failure(e: reqwest::Error) -> TransportFailure {
    if e.is_timeout() { TransportFailure::timeout(e.to_string()) } else { TransportFailure::new(e.to_string()) }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    fn prepare(&self, profile: &ClientProfile) -> Result<(), CheckError> {
        self.client(profile).map(|_| ())
    }

    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportFailure> {
        let client = self.client(&request.profile).map_err(|e| TransportFailure::new(e.message))?;

        let mut builder = client.request(method(request.method), request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match request.auth {
            RequestAuth::None => builder,
            RequestAuth::Basic { username, password } => builder.basic_auth(username, Some(password)),
            RequestAuth::Bearer { token } => builder.bearer_auth(token),
        };
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(failure)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| (name.to_string(), String::from_utf8_lossy(value.as_bytes()).into_owned()))
            .collect();
        let body = response.text().await.map_err(failure)?;

        Ok(HttpResponse { status, headers, body })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::error::ResultCode;

    fn transport() -> ReqwestTransport {
        ReqwestTransport::new(Duration::from_secs(3), None)
    }

    #[test]
    fn clients_are_shared_per_profile() {
        let transport = transport();
        let plain = ClientProfile { verify_peer: true, verify_host: true, ..Default::default() };
        let redirecting = ClientProfile { follow_redirects: true, ..plain.clone() };

        transport.prepare(&plain).unwrap();
        transport.prepare(&plain).unwrap();
        transport.prepare(&redirecting).unwrap();

        assert_eq!(transport.clients.lock().len(), 2);
    }

    #[test]
    fn unreadable_certificate_is_a_config_error() {
        let profile = ClientProfile {
            client_certificate: Some(ClientCertificate {
                cert_file: PathBuf::from("/nonexistent/client.pem"),
                key_file: None,
                key_password: None,
            }),
            ..Default::default()
        };

        assert_eq!(transport().prepare(&profile).unwrap_err().code, ResultCode::ConfigError);
    }

    #[test]
    fn invalid_proxy_is_a_config_error() {
        let profile = ClientProfile { proxy: Some("http://[::1".into()), ..Default::default() };
        assert_eq!(transport().prepare(&profile).unwrap_err().code, ResultCode::ConfigError);
    }
}
