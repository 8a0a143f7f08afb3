//! Control-plane client.
//!
//! Talks to the daemon's control listener, over its unix socket or over
//! TCP loopback. The unix transport drives a raw HTTP/1.1 connection via
//! hyper's client handshake since connection-per-request is fine for
//! control traffic.

use std::path::PathBuf;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;

use imageio_proto::{Error, ImageResult, TicketSpec};

use crate::http::ServerOptions;

/// Where the control listener lives.
#[derive(Debug, Clone)]
pub enum ControlAddress {
    Unix(PathBuf),
    Tcp(String, u16),
}

pub struct ControlClient {
    address: ControlAddress,
    client: reqwest::Client,
}

impl ControlClient {
    pub fn new(address: ControlAddress) -> ImageResult<ControlClient> {
        let client = reqwest::Client::builder()
            .http1_only()
            .build()
            .map_err(|e| Error::Internal(format!("cannot build HTTP client: {e}")))?;
        Ok(ControlClient { address, client })
    }

    pub async fn add_ticket(&self, spec: &TicketSpec) -> ImageResult<()> {
        let body = serde_json::to_vec(spec)
            .map_err(|e| Error::Internal(format!("cannot encode ticket: {e}")))?;
        self.request(Method::PUT, &format!("/tickets/{}", spec.uuid), Some(body))
            .await?;
        Ok(())
    }

    pub async fn get_ticket(&self, id: &str) -> ImageResult<serde_json::Value> {
        let body = self
            .request(Method::GET, &format!("/tickets/{id}"), None)
            .await?;
        serde_json::from_slice(&body)
            .map_err(|e| Error::Internal(format!("invalid ticket status: {e}")))
    }

    pub async fn extend_ticket(&self, id: &str, timeout: u64) -> ImageResult<()> {
        let body = serde_json::to_vec(&serde_json::json!({"timeout": timeout})).unwrap();
        self.request(Method::PATCH, &format!("/tickets/{id}"), Some(body))
            .await?;
        Ok(())
    }

    pub async fn delete_ticket(&self, id: &str, timeout: Option<u64>) -> ImageResult<()> {
        let path = match timeout {
            Some(timeout) => format!("/tickets/{id}?timeout={timeout}"),
            None => format!("/tickets/{id}"),
        };
        self.request(Method::DELETE, &path, None).await?;
        Ok(())
    }

    pub async fn list_tickets(&self) -> ImageResult<Vec<String>> {
        let body = self.request(Method::GET, "/tickets", None).await?;
        serde_json::from_slice(&body)
            .map_err(|e| Error::Internal(format!("invalid ticket list: {e}")))
    }

    /// Server-wide capabilities via the `*` OPTIONS wildcard.
    pub async fn server_options(&self) -> ImageResult<ServerOptions> {
        let body = self
            .request(Method::OPTIONS, "/images/%2A", None)
            .await?;
        serde_json::from_slice(&body)
            .map_err(|e| Error::Internal(format!("invalid options response: {e}")))
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> ImageResult<Vec<u8>> {
        match &self.address {
            ControlAddress::Unix(socket) => self.unix_request(socket, method, path, body).await,
            ControlAddress::Tcp(host, port) => {
                self.tcp_request(host, *port, method, path, body).await
            }
        }
    }

    async fn tcp_request(
        &self,
        host: &str,
        port: u16,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> ImageResult<Vec<u8>> {
        let url = format!("http://{host}:{port}{path}");
        let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
            .map_err(|e| Error::Internal(format!("bad method: {e}")))?;
        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request
                .header("Content-Type", "application/json")
                .body(body);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| Error::Internal(format!("control request failed: {e}")))?;

        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::Internal(format!("control request failed: {e}")))?;
        check_status(status.as_u16(), &bytes)?;
        Ok(bytes.to_vec())
    }

    async fn unix_request(
        &self,
        socket: &PathBuf,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> ImageResult<Vec<u8>> {
        let stream = UnixStream::connect(socket).await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| Error::Internal(format!("control handshake failed: {e}")))?;
        tokio::spawn(conn);

        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(hyper::header::HOST, "localhost");
        if body.is_some() {
            builder = builder.header(hyper::header::CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| Error::Internal(format!("cannot build request: {e}")))?;

        let resp = sender
            .send_request(request)
            .await
            .map_err(|e| Error::Internal(format!("control request failed: {e}")))?;
        let status: StatusCode = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Internal(format!("control request failed: {e}")))?
            .to_bytes();
        check_status(status.as_u16(), &bytes)?;
        Ok(bytes.to_vec())
    }
}

fn check_status(status: u16, body: &[u8]) -> ImageResult<()> {
    if (200..300).contains(&status) {
        return Ok(());
    }
    let reason = String::from_utf8_lossy(body).to_string();
    Err(Error::from_http_status(status, reason))
}
