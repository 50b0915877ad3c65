use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::Request;
use hyper::body::Incoming;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;

use super::{Error, HttpRequest, HttpResponse, Result};

/// HTTP-level tuning resolved from the run options.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub max_redirects: u32,
    pub insecure_skip_tls_verify: bool,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_redirects: 10,
            insecure_skip_tls_verify: false,
            user_agent: concat!("stampede/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    cfg: HttpConfig,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new(HttpConfig::default())
    }
}

impl HttpClient {
    pub fn new(cfg: HttpConfig) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);

        let tls = if cfg.insecure_skip_tls_verify {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification::new()))
                .with_no_client_auth()
        } else {
            rustls::ClientConfig::builder()
                .with_root_certificates(native_roots())
                .with_no_client_auth()
        };

        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let inner = Client::builder(TokioExecutor::new()).build(connector);

        Self { inner, cfg }
    }

    pub async fn request(&self, req: HttpRequest) -> Result<HttpResponse> {
        let timeout = req.timeout;
        let fut = self.request_following_redirects(req);

        if let Some(timeout) = timeout {
            match tokio::time::timeout(timeout, fut).await {
                Ok(res) => res,
                Err(_) => Err(Error::Timeout(timeout)),
            }
        } else {
            fut.await
        }
    }

    pub async fn get(&self, url: &str) -> Result<HttpResponse> {
        self.request(HttpRequest::get(url)).await
    }

    async fn request_following_redirects(&self, req: HttpRequest) -> Result<HttpResponse> {
        let mut method = req.method;
        let mut target = req.url;
        let mut body = req.body;
        let mut bytes_sent = 0u64;
        let mut redirects = 0u32;

        loop {
            let parsed =
                url::Url::parse(&target).map_err(|_| Error::InvalidUrl(target.clone()))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(Error::InvalidUrl(target));
            }

            let (response, sent) = self
                .send_one(method.clone(), &target, &req.headers, body.clone())
                .await?;
            bytes_sent = bytes_sent.saturating_add(sent);

            if !is_redirect(response.status) || redirects >= self.cfg.max_redirects {
                if is_redirect(response.status) {
                    return Err(Error::TooManyRedirects(self.cfg.max_redirects));
                }
                return Ok(HttpResponse {
                    bytes_sent,
                    ..response
                });
            }

            let location = response
                .headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("location"))
                .map(|(_, v)| v.clone())
                .ok_or_else(|| Error::Transport("redirect without location".to_string()))?;

            target = parsed
                .join(&location)
                .map_err(|_| Error::InvalidUrl(location))?
                .to_string();

            // 303 switches to GET and drops the body; 301/302 historically do
            // the same for non-GET; 307/308 preserve the method.
            if response.status == 303
                || (matches!(response.status, 301 | 302) && method != http::Method::GET)
            {
                method = http::Method::GET;
                body = Bytes::new();
            }

            redirects += 1;
        }
    }

    async fn send_one(
        &self,
        method: http::Method,
        target: &str,
        headers: &[(String, String)],
        body: Bytes,
    ) -> Result<(HttpResponse, u64)> {
        let uri: hyper::Uri = target
            .parse()
            .map_err(|_| Error::InvalidUrl(target.to_string()))?;

        let mut bytes_sent = (method.as_str().len() + target.len() + body.len()) as u64;

        let mut builder = Request::builder().method(method).uri(uri);
        if !has_header(headers, "user-agent") {
            builder = builder.header(http::header::USER_AGENT, &self.cfg.user_agent);
        }
        if !body.is_empty() && !has_header(headers, "content-length") {
            builder = builder.header(http::header::CONTENT_LENGTH, body.len());
        }
        for (k, v) in headers {
            let name = http::header::HeaderName::from_bytes(k.as_bytes())
                .map_err(|_| Error::InvalidHeader(k.clone()))?;
            let value = http::header::HeaderValue::from_str(v)
                .map_err(|_| Error::InvalidHeader(k.clone()))?;
            bytes_sent = bytes_sent.saturating_add((k.len() + v.len() + 4) as u64);
            builder = builder.header(name, value);
        }

        let request: Request<Full<Bytes>> = builder.body(Full::new(body))?;
        let response: hyper::Response<Incoming> = self.inner.request(request).await?;

        let (parts, incoming) = response.into_parts();
        let status = parts.status.as_u16();
        let response_headers: Vec<(String, String)> = parts
            .headers
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).to_string(),
                )
            })
            .collect();
        let head_bytes: u64 = response_headers
            .iter()
            .map(|(k, v)| (k.len() + v.len() + 4) as u64)
            .sum();

        let body = incoming.collect().await?.to_bytes();
        let bytes_received = head_bytes.saturating_add(body.len() as u64);

        Ok((
            HttpResponse {
                status,
                headers: response_headers,
                body,
                bytes_sent: 0,
                bytes_received,
            },
            bytes_sent,
        ))
    }
}

fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

fn has_header(headers: &[(String, String)], name: &str) -> bool {
    headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
}

fn native_roots() -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

/// Certificate verifier for `insecure_skip_tls_verify`: accepts anything.
#[derive(Debug)]
struct NoVerification(Arc<rustls::crypto::CryptoProvider>);

impl NoVerification {
    fn new() -> Self {
        Self(Arc::new(rustls::crypto::ring::default_provider()))
    }
}

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
