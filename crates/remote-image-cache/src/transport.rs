//! Network side of the loader

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use tracing::{debug, warn};

use crate::decode;
use crate::error::{LoadError, Result};

/// Single-shot retrieval of the payload behind a key. No retries.
#[async_trait]
pub trait FetchTransport: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<Bytes>;
}

/// HTTP client for fetching images by URL
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a transport with reqwest defaults (no request timeout)
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Create a transport whose requests give up after `timeout`
    pub fn with_timeout(timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FetchTransport for HttpTransport {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        debug!(url = %url, "Fetching image");

        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            warn!(status = %response.status(), url = %url, "Failed to fetch image");
            return Err(LoadError::Status(response.status().as_u16()));
        }

        let data = response.bytes().await?;
        if data.is_empty() {
            return Err(LoadError::EmptyBody);
        }

        let info = decode::probe(&data)?;
        debug!(
            url = %url,
            size = data.len(),
            format = ?info.format,
            width = info.width,
            height = info.height,
            "Fetched image"
        );

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, RgbaImage};
    use std::io::Cursor;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn png() -> Vec<u8> {
        let mut buf = Vec::new();
        DynamicImage::ImageRgba8(RgbaImage::new(1, 1))
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    fn transport() -> HttpTransport {
        HttpTransport {
            client: Client::builder().no_proxy().build().unwrap(),
        }
    }

    /// Serve exactly one canned HTTP response and return the URL to hit
    async fn serve_once(status: &'static str, body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await;

            let head = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                status,
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(&body).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        format!("http://{}/image.png", addr)
    }

    #[tokio::test]
    async fn test_fetch_image() {
        let body = png();
        let url = serve_once("200 OK", body.clone()).await;

        let data = transport().fetch(&url).await.unwrap();
        assert_eq!(data.as_ref(), body.as_slice());
    }

    #[tokio::test]
    async fn test_fetch_error_status() {
        let url = serve_once("404 Not Found", b"missing".to_vec()).await;

        let err = transport().fetch(&url).await.unwrap_err();
        assert_eq!(err, LoadError::Status(404));
    }

    #[tokio::test]
    async fn test_fetch_empty_body() {
        let url = serve_once("200 OK", Vec::new()).await;

        let err = transport().fetch(&url).await.unwrap_err();
        assert_eq!(err, LoadError::EmptyBody);
    }

    #[tokio::test]
    async fn test_fetch_non_image() {
        let url = serve_once("200 OK", b"<html></html>".to_vec()).await;

        let err = transport().fetch(&url).await.unwrap_err();
        assert!(matches!(err, LoadError::Decode(_)));
    }

    #[tokio::test]
    async fn test_fetch_invalid_url() {
        let err = transport().fetch("not a url").await.unwrap_err();
        assert!(err.is_transport());
    }
}
