//! HTTP client for an OCI / Docker distribution registry

use async_trait::async_trait;
use futures::TryStreamExt;
use mirror_core::image::{DOCKER_MANIFEST_LIST_V2, DOCKER_MANIFEST_V2, OCI_INDEX_V1, OCI_MANIFEST_V1};
use mirror_core::{Digest, ImageManifest};
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, instrument};
use url::Url;

use crate::blob_store::ByteReader;
use crate::error::{GatewayError, GatewayResult};
use crate::registry::{RegistryBlob, RegistryGateway, RegistryToken, UploadSession};

const DIGEST_HEADER: &str = "Docker-Content-Digest";

/// HTTP registry client configuration
#[derive(Debug, Clone)]
pub struct HttpRegistryConfig {
    /// Registry base URL (e.g. `https://registry.example.com`)
    pub base_url: Url,
    /// Per-request timeout
    pub timeout: Duration,
}

impl HttpRegistryConfig {
    /// Create a configuration with a 30 second timeout
    pub fn new(base_url: &str) -> GatewayResult<Self> {
        Ok(Self {
            base_url: Url::parse(base_url)?,
            timeout: Duration::from_secs(30),
        })
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

/// [`RegistryGateway`] speaking the distribution HTTP API
#[derive(Debug, Clone)]
pub struct HttpRegistryClient {
    client: Client,
    base_url: Url,
}

impl HttpRegistryClient {
    /// Create a client
    pub fn new(config: HttpRegistryConfig) -> GatewayResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: with_trailing_slash(config.base_url),
        })
    }

    /// Resolve a path relative to the registry base, keeping any base path prefix
    fn url(&self, path: &str) -> GatewayResult<Url> {
        Ok(self.base_url.join(path)?)
    }

    fn request(&self, method: Method, url: Url, token: &RegistryToken) -> RequestBuilder {
        self.client.request(method, url).bearer_auth(token.bearer())
    }

    async fn send(request: RequestBuilder) -> GatewayResult<Response> {
        Ok(request.send().await?)
    }

    /// Turn an unexpected response into an error
    async fn unexpected(response: Response, action: &str) -> GatewayError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = format!("{} failed: {}", action, body.trim());
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GatewayError::PermissionDenied(message),
            _ => GatewayError::Protocol {
                status: status.as_u16(),
                message,
            },
        }
    }
}

#[async_trait]
impl RegistryGateway for HttpRegistryClient {
    #[instrument(skip(self, token))]
    async fn blob_exists(
        &self,
        token: &RegistryToken,
        repository: &str,
        digest: &Digest,
    ) -> GatewayResult<bool> {
        let url = self.url(&format!("v2/{}/blobs/{}", repository, digest))?;
        let response = Self::send(self.request(Method::HEAD, url, token)).await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Self::unexpected(response, "blob HEAD").await),
        }
    }

    #[instrument(skip(self, token))]
    async fn initiate_upload(
        &self,
        token: &RegistryToken,
        repository: &str,
    ) -> GatewayResult<UploadSession> {
        let url = self.url(&format!("v2/{}/blobs/uploads/", repository))?;
        let response = Self::send(self.request(Method::POST, url, token)).await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(Self::unexpected(response, "upload initiation").await);
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| GatewayError::Protocol {
                status: response.status().as_u16(),
                message: "upload initiation returned no Location".to_string(),
            })?;
        // Location may be relative to the registry root
        let location = self.base_url.join(location)?.to_string();

        debug!(%location, "Upload session opened");
        Ok(UploadSession {
            repository: repository.to_string(),
            location,
        })
    }

    #[instrument(skip(self, token, body))]
    async fn upload_blob_monolithic(
        &self,
        token: &RegistryToken,
        session: &UploadSession,
        digest: &Digest,
        body: ByteReader,
        size: u64,
    ) -> GatewayResult<()> {
        let mut url = Url::parse(&session.location)?;
        url.query_pairs_mut().append_pair("digest", &digest.to_string());

        let request = self
            .request(Method::PUT, url, token)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, size)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(body)));
        let response = Self::send(request).await?;
        match response.status() {
            StatusCode::CREATED => Ok(()),
            _ => Err(Self::unexpected(response, "monolithic upload").await),
        }
    }

    #[instrument(skip(self, token))]
    async fn cancel_upload(&self, token: &RegistryToken, session: &UploadSession) -> GatewayResult<()> {
        let url = Url::parse(&session.location)?;
        let response = Self::send(self.request(Method::DELETE, url, token)).await?;
        match response.status() {
            // Already gone counts as cancelled
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(()),
            _ => Err(Self::unexpected(response, "upload cancellation").await),
        }
    }

    #[instrument(skip(self, token, manifest), fields(media_type = manifest.media_type()))]
    async fn put_manifest(
        &self,
        token: &RegistryToken,
        repository: &str,
        reference: &str,
        manifest: &ImageManifest,
    ) -> GatewayResult<Digest> {
        let url = self.url(&format!("v2/{}/manifests/{}", repository, reference))?;
        let request = self
            .request(Method::PUT, url, token)
            .header(CONTENT_TYPE, manifest.media_type())
            .body(manifest.body().to_vec());
        let response = Self::send(request).await?;
        if response.status() != StatusCode::CREATED {
            return Err(Self::unexpected(response, "manifest PUT").await);
        }

        let reported = response
            .headers()
            .get(DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Digest::parse(v).ok());
        Ok(reported.unwrap_or_else(|| manifest.digest()))
    }

    #[instrument(skip(self, token))]
    async fn get_manifest(
        &self,
        token: &RegistryToken,
        repository: &str,
        reference: &str,
    ) -> GatewayResult<ImageManifest> {
        let url = self.url(&format!("v2/{}/manifests/{}", repository, reference))?;
        let accept = [OCI_MANIFEST_V1, OCI_INDEX_V1, DOCKER_MANIFEST_V2, DOCKER_MANIFEST_LIST_V2].join(", ");
        let response = Self::send(self.request(Method::GET, url, token).header(ACCEPT, accept)).await?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(GatewayError::NotFound(format!(
                    "Manifest {}:{} not found",
                    repository, reference
                )))
            }
            _ => return Err(Self::unexpected(response, "manifest GET").await),
        }

        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let body = response.bytes().await?.to_vec();
        let manifest = match media_type {
            Some(media_type) => ImageManifest::with_media_type(body, media_type),
            None => ImageManifest::from_body(body),
        };
        manifest.map_err(|e| GatewayError::InvalidData(e.to_string()))
    }

    #[instrument(skip(self, token))]
    async fn get_blob(
        &self,
        token: &RegistryToken,
        repository: &str,
        digest: &Digest,
    ) -> GatewayResult<RegistryBlob> {
        let url = self.url(&format!("v2/{}/blobs/{}", repository, digest))?;
        let response = Self::send(self.request(Method::GET, url, token)).await?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(GatewayError::NotFound(format!("Blob {} not found", digest)))
            }
            _ => return Err(Self::unexpected(response, "blob GET").await),
        }

        let size = response.content_length().ok_or_else(|| GatewayError::Protocol {
            status: 200,
            message: format!("blob {} returned without Content-Length", digest),
        })?;
        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(RegistryBlob {
            size,
            body: Box::new(StreamReader::new(stream)),
        })
    }
}
