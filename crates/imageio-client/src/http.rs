//! HTTP client for one image resource.
//!
//! Thin wrapper over a persistent keep-alive client, speaking the image
//! data protocol: ranged GET, PUT with Content-Range, JSON PATCH for
//! zero/flush, OPTIONS for capabilities, and the extents sub-resource.

use serde::Deserialize;
use serde_json::json;

use imageio_proto::{DirtyExtent, Error, Extent, ImageResult};

/// Server capabilities reported by OPTIONS.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerOptions {
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub unix_socket: Option<String>,
    #[serde(default)]
    pub max_readers: Option<u32>,
    #[serde(default)]
    pub max_writers: Option<u32>,
}

impl ServerOptions {
    pub fn has_feature(&self, name: &str) -> bool {
        self.features.iter().any(|f| f == name)
    }
}

/// Client bound to one `…/images/{ticket}` URL.
#[derive(Clone)]
pub struct ImageioClient {
    client: reqwest::Client,
    url: String,
}

impl ImageioClient {
    pub fn new(url: &str, insecure: bool) -> ImageResult<ImageioClient> {
        let mut builder = reqwest::Client::builder().http1_only();
        if insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Internal(format!("cannot build HTTP client: {e}")))?;
        Ok(ImageioClient {
            client,
            url: url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn options(&self) -> ImageResult<ServerOptions> {
        let resp = self
            .client
            .request(reqwest::Method::OPTIONS, &self.url)
            .send()
            .await
            .map_err(request_error)?;
        let resp = check(resp).await?;
        resp.json().await.map_err(request_error)
    }

    /// Read exactly `buf.len()` bytes at `offset`.
    pub async fn get(&self, offset: u64, buf: &mut [u8]) -> ImageResult<()> {
        let end = offset + buf.len() as u64 - 1;
        let resp = self
            .client
            .get(&self.url)
            .header("Range", format!("bytes={offset}-{end}"))
            .send()
            .await
            .map_err(request_error)?;
        let resp = check(resp).await?;
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

    /// Write `data` at `offset`. With `flush` the server reaches its
    /// durability point before replying.
    pub async fn put(&self, offset: u64, data: Vec<u8>, flush: bool) -> ImageResult<()> {
        let end = offset + data.len() as u64 - 1;
        let flush = if flush { "y" } else { "n" };
        let resp = self
            .client
            .put(format!("{}?flush={}", self.url, flush))
            .header("Content-Range", format!("bytes {offset}-{end}/*"))
            .body(data)
            .send()
            .await
            .map_err(request_error)?;
        check(resp).await?;
        Ok(())
    }

    pub async fn patch_zero(&self, offset: u64, size: u64, flush: bool) -> ImageResult<()> {
        let body = json!({"op": "zero", "offset": offset, "size": size, "flush": flush});
        let resp = self
            .client
            .patch(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;
        check(resp).await?;
        Ok(())
    }

    pub async fn patch_flush(&self) -> ImageResult<()> {
        let resp = self
            .client
            .patch(&self.url)
            .json(&json!({"op": "flush"}))
            .send()
            .await
            .map_err(request_error)?;
        check(resp).await?;
        Ok(())
    }

    pub async fn extents(&self) -> ImageResult<Vec<Extent>> {
        let resp = self
            .client
            .get(format!("{}/extents?context=zero", self.url))
            .send()
            .await
            .map_err(request_error)?;
        let resp = check(resp).await?;
        resp.json().await.map_err(request_error)
    }

    pub async fn extents_dirty(&self) -> ImageResult<Vec<DirtyExtent>> {
        let resp = self
            .client
            .get(format!("{}/extents?context=dirty", self.url))
            .send()
            .await
            .map_err(request_error)?;
        let resp = check(resp).await?;
        resp.json().await.map_err(request_error)
    }
}

async fn check(resp: reqwest::Response) -> ImageResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let reason = resp.text().await.unwrap_or_default();
    Err(Error::from_http_status(status.as_u16(), reason))
}

fn request_error(e: reqwest::Error) -> Error {
    Error::Internal(format!("request failed: {e}"))
}
