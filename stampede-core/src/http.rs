mod client;

pub use client::{HttpClient, HttpConfig};

use bytes::Bytes;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("stopped after {0} redirects")]
    TooManyRedirects(u32),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<hyper_util::client::legacy::Error> for Error {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<hyper::Error> for Error {
    fn from(err: hyper::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<http::Error> for Error {
    fn from(err: http::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: http::Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn get(url: &str) -> HttpRequest {
        HttpRequest {
            method: http::Method::GET,
            url: url.to_string(),
            headers: Vec::new(),
            body: Bytes::new(),
            timeout: None,
        }
    }

    pub fn post(url: &str, body: Bytes) -> HttpRequest {
        HttpRequest {
            method: http::Method::POST,
            url: url.to_string(),
            headers: Vec::new(),
            body,
            timeout: None,
        }
    }
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl HttpResponse {
    /// 4xx and 5xx statuses count as failed requests for the
    /// `http_req_failed` rate.
    pub fn is_failure(&self) -> bool {
        self.status >= 400
    }
}
