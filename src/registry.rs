//! Read-only subset of the registry HTTP API used to discover layer names

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::digest;

const MANIFEST_ACCEPT: &str =
    "application/vnd.oci.image.manifest.v1+json, application/vnd.docker.distribution.manifest.v2+json";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("request to {url} failed")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("bad status code {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("failed to decode response from {url}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("manifest {repository}:{tag} has no layers")]
    NoLayers { repository: String, tag: String },

    #[error("crawl worker failed: {0}")]
    Worker(String),
}

/// `GET /v2/_catalog`
#[derive(Debug, Clone, Deserialize)]
pub struct RepoList {
    #[serde(default)]
    pub repositories: Vec<String>,
}

/// `GET /v2/<name>/tags/list`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Repo {
    pub name: String,
    /// Registries send `null` for a repository without tags
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

impl Repo {
    pub fn tags(&self) -> &[String] {
        self.tags.as_deref().unwrap_or(&[])
    }
}

#[derive(Debug, Deserialize)]
struct LayerList {
    #[serde(default)]
    layers: Vec<LayerDigest>,
}

#[derive(Debug, Deserialize)]
struct LayerDigest {
    digest: String,
}

/// The three registry calls the crawler makes
#[async_trait]
pub trait RegistryApi: Send + Sync {
    async fn catalog(&self) -> Result<Vec<String>, RegistryError>;

    async fn tags(&self, repository: &str) -> Result<Repo, RegistryError>;

    /// Bare digest of the last (top) layer of `repository:tag`
    async fn top_layer(&self, repository: &str, tag: &str) -> Result<String, RegistryError>;
}

/// [`RegistryApi`] over plain HTTP(S), one attempt per request
#[derive(Debug, Clone)]
pub struct HttpRegistry {
    client: Client,
    base_url: String,
}

impl HttpRegistry {
    pub fn new(base_url: &str) -> Self {
        HttpRegistry {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String, accept: Option<&str>) -> Result<T, RegistryError> {
        debug!(url = %url, "GET");
        let mut request = self.client.get(&url);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(source) => return Err(RegistryError::Request { url, source }),
        };

        if response.status() != reqwest::StatusCode::OK {
            return Err(RegistryError::Status {
                url,
                status: response.status().as_u16(),
            });
        }

        match response.json::<T>().await {
            Ok(value) => Ok(value),
            Err(source) => Err(RegistryError::Decode { url, source }),
        }
    }
}

#[async_trait]
impl RegistryApi for HttpRegistry {
    async fn catalog(&self) -> Result<Vec<String>, RegistryError> {
        let list: RepoList = self.get_json(format!("{}/v2/_catalog", self.base_url), None).await?;
        Ok(list.repositories)
    }

    async fn tags(&self, repository: &str) -> Result<Repo, RegistryError> {
        self.get_json(format!("{}/v2/{}/tags/list", self.base_url, repository), None)
            .await
    }

    async fn top_layer(&self, repository: &str, tag: &str) -> Result<String, RegistryError> {
        let url = format!("{}/v2/{}/manifests/{}", self.base_url, repository, tag);
        let manifest: LayerList = self.get_json(url, Some(MANIFEST_ACCEPT)).await?;
        manifest
            .layers
            .last()
            .map(|layer| digest::bare(&layer.digest).to_string())
            .ok_or_else(|| RegistryError::NoLayers {
                repository: repository.to_string(),
                tag: tag.to_string(),
            })
    }
}
