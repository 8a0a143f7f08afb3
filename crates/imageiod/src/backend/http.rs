//! HTTP backend, used when running as a proxy.
//!
//! Wraps a persistent keep-alive HTTP/1.1 client and re-emits the image
//! protocol against the origin server, forwarding Range/Content-Range and
//! the PATCH bodies. Origin failures map back to the matching error kinds
//! so the proxy surfaces origin status codes.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use imageio_proto::defaults::MAX_CONNECTIONS;
use imageio_proto::{DirtyExtent, Error, Extent, ImageResult};

use crate::backend::{Backend, BackendOptions};

#[derive(Debug, Default, Deserialize)]
struct OriginOptions {
    #[serde(default)]
    features: Vec<String>,
    #[serde(default)]
    max_readers: Option<u32>,
    #[serde(default)]
    max_writers: Option<u32>,
}

pub struct HttpBackend {
    client: reqwest::Client,
    url: String,
    size: u64,
    writable: bool,
    buffer_size: usize,
    max_readers: u32,
    max_writers: u32,
    can_extents: bool,
    can_zero: bool,
    can_flush: bool,
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend").field("url", &self.url).finish()
    }
}

impl HttpBackend {
    pub async fn open(url: &str, opts: &BackendOptions) -> ImageResult<HttpBackend> {
        let mut builder = reqwest::Client::builder().http1_only();
        if opts.insecure_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Internal(format!("cannot build HTTP client: {e}")))?;

        // Probe origin capabilities. An origin without OPTIONS still works
        // with the minimal capability set.
        let origin = match client.request(Method::OPTIONS, url).send().await {
            Ok(resp) if resp.status().is_success() => {
                resp.json::<OriginOptions>().await.unwrap_or_default()
            }
            Ok(resp) => {
                debug!("origin OPTIONS returned {}, using minimal features", resp.status());
                OriginOptions::default()
            }
            Err(e) => return Err(request_error(e)),
        };

        debug!("open {} origin features={:?}", url, origin.features);

        let features = |name: &str| origin.features.iter().any(|f| f == name);
        Ok(HttpBackend {
            client,
            url: url.to_string(),
            size: opts.size_hint,
            writable: opts.writable,
            buffer_size: opts.buffer_size,
            max_readers: origin.max_readers.unwrap_or(MAX_CONNECTIONS),
            max_writers: origin.max_writers.unwrap_or(1),
            can_extents: features("extents"),
            can_zero: features("zero"),
            can_flush: features("flush"),
        })
    }

    async fn check(&self, resp: reqwest::Response) -> ImageResult<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let reason = resp.text().await.unwrap_or_default();
        Err(Error::from_http_status(status.as_u16(), reason))
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn block_size(&self) -> usize {
        1
    }

    fn max_readers(&self) -> u32 {
        self.max_readers
    }

    fn max_writers(&self) -> u32 {
        self.max_writers
    }

    fn supports_extents(&self) -> bool {
        self.can_extents
    }

    fn supports_zero(&self) -> bool {
        // Zero falls back to writing zeroes when the origin lacks PATCH.
        true
    }

    fn supports_flush(&self) -> bool {
        self.can_flush
    }

    async fn read_at(&self, buf: &mut [u8], offset: u64) -> ImageResult<()> {
        let end = offset + buf.len() as u64 - 1;
        let resp = self
            .client
            .get(&self.url)
            .header("Range", format!("bytes={offset}-{end}"))
            .send()
            .await
            .map_err(request_error)?;
        let resp = self.check(resp).await?;
        if resp.status() != StatusCode::PARTIAL_CONTENT && resp.status() != StatusCode::OK {
            return Err(Error::Internal(format!(
                "unexpected origin status {}",
                resp.status()
            )));
        }
        let body = resp.bytes().await.map_err(request_error)?;
        if body.len() != buf.len() {
            return Err(Error::PartialContent {
                expected: buf.len() as u64,
                actual: body.len() as u64,
            });
        }
        buf.copy_from_slice(&body);
        Ok(())
    }

    async fn write_at(&self, buf: &[u8], offset: u64, flush: bool) -> ImageResult<()> {
        if !self.writable {
            return Err(Error::NotSupported("backend is read only".into()));
        }
        let end = offset + buf.len() as u64 - 1;
        let flush = if flush { "y" } else { "n" };
        let resp = self
            .client
            .put(format!("{}?flush={}", self.url, flush))
            .header("Content-Range", format!("bytes {offset}-{end}/*"))
            .body(buf.to_vec())
            .send()
            .await
            .map_err(request_error)?;
        self.check(resp).await?;
        Ok(())
    }

    async fn zero(
        &self,
        offset: u64,
        length: u64,
        flush: bool,
        _punch_hole: bool,
    ) -> ImageResult<()> {
        if !self.writable {
            return Err(Error::NotSupported("backend is read only".into()));
        }

        if !self.can_zero {
            // Old origin; emulate with zero writes.
            let zeros = vec![0u8; (length.min(self.buffer_size as u64)) as usize];
            let mut pos = offset;
            let end = offset + length;
            while pos < end {
                let n = ((end - pos) as usize).min(zeros.len());
                self.write_at(&zeros[..n], pos, false).await?;
                pos += n as u64;
            }
            if flush && self.can_flush {
                self.flush().await?;
            }
            return Ok(());
        }

        let body = json!({
            "op": "zero",
            "offset": offset,
            "size": length,
            "flush": flush,
        });
        let resp = self
            .client
            .patch(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;
        self.check(resp).await?;
        Ok(())
    }

    async fn flush(&self) -> ImageResult<()> {
        if !self.can_flush {
            return Err(Error::NotSupported("origin does not support flush".into()));
        }
        let resp = self
            .client
            .patch(&self.url)
            .json(&json!({"op": "flush"}))
            .send()
            .await
            .map_err(request_error)?;
        self.check(resp).await?;
        Ok(())
    }

    async fn extents_zero(&self) -> ImageResult<Vec<Extent>> {
        if !self.can_extents {
            return Ok(vec![Extent::new(0, self.size, false, false)]);
        }
        let resp = self
            .client
            .get(format!("{}/extents?context=zero", self.url))
            .send()
            .await
            .map_err(request_error)?;
        let resp = self.check(resp).await?;
        resp.json().await.map_err(request_error)
    }

    async fn extents_dirty(&self) -> ImageResult<Vec<DirtyExtent>> {
        if !self.can_extents {
            return Err(Error::NotSupported(
                "origin does not support extents".into(),
            ));
        }
        let resp = self
            .client
            .get(format!("{}/extents?context=dirty", self.url))
            .send()
            .await
            .map_err(request_error)?;
        let resp = self.check(resp).await?;
        resp.json().await.map_err(request_error)
    }

    async fn close(&self) -> ImageResult<()> {
        Ok(())
    }
}

fn request_error(e: reqwest::Error) -> Error {
    Error::Internal(format!("origin request failed: {e}"))
}
