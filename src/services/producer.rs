//! Fetches external datasets and writes them into the object store.
//!
//! A failed fetch or write is local to the run: nothing is stored, no
//! notification is published, and the next scheduled run tries again.

use async_trait::async_trait;
use bytes::Bytes;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{error, info, instrument};

use crate::clock::Clock;
use crate::models::object::StoredObject;
use crate::services::storage_service::{StorageError, StorageService};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },
    #[error("{url} did not return valid JSON: {source}")]
    InvalidJson {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("fetch failed for source `{source_name}`: {error}")]
    Fetch {
        source_name: String,
        #[source]
        error: FetchError,
    },
    #[error("store failed for source `{source_name}`: {error}")]
    Store {
        source_name: String,
        #[source]
        error: StorageError,
    },
}

/// One external dataset.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Where the data comes from, for logs and errors.
    fn location(&self) -> &str;

    async fn fetch(&self) -> Result<Bytes, FetchError>;
}

/// Plain HTTP GET with a request timeout.
pub struct HttpSource {
    client: reqwest::Client,
    url: String,
}

impl HttpSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let url = url.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| FetchError::Request {
                url: url.clone(),
                source,
            })?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl DataSource for HttpSource {
    fn location(&self) -> &str {
        &self.url
    }

    async fn fetch(&self) -> Result<Bytes, FetchError> {
        let request_error = |source| FetchError::Request {
            url: self.url.clone(),
            source,
        };
        let response = self.client.get(&self.url).send().await.map_err(request_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }
        response.bytes().await.map_err(request_error)
    }
}

/// How a source's object key is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyTemplate {
    /// `{prefix}{YYYY-MM-DD}{extension}`, one object per day.
    Dated { prefix: String, extension: String },
    /// The same key every run; each run adds a version.
    Fixed(String),
}

impl KeyTemplate {
    pub fn render(&self, clock: &dyn Clock) -> String {
        match self {
            Self::Dated { prefix, extension } => {
                format!("{}{}{}", prefix, clock.now().format("%Y-%m-%d"), extension)
            }
            Self::Fixed(key) => key.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub name: String,
    pub key: KeyTemplate,
    pub content_type: Option<String>,
    /// Reject payloads that are not JSON.
    pub expect_json: bool,
    /// Skip the write when the payload matches the latest stored version.
    pub skip_unchanged: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProduceOutcome {
    Stored(StoredObject),
    Unchanged { key: String, version: i64 },
}

pub struct Producer {
    storage: StorageService,
    bucket: String,
    source: Arc<dyn DataSource>,
    spec: SourceSpec,
    clock: Arc<dyn Clock>,
}

impl Producer {
    pub fn new(
        storage: StorageService,
        bucket: impl Into<String>,
        source: Arc<dyn DataSource>,
        spec: SourceSpec,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            bucket: bucket.into(),
            source,
            spec,
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Fetch once and store the result.
    #[instrument(skip(self), fields(source = %self.spec.name))]
    pub async fn produce(&self) -> Result<ProduceOutcome, ProducerError> {
        let fetch_error = |error| ProducerError::Fetch {
            source_name: self.spec.name.clone(),
            error,
        };
        let store_error = |error| ProducerError::Store {
            source_name: self.spec.name.clone(),
            error,
        };

        let body = self.source.fetch().await.map_err(fetch_error)?;
        if self.spec.expect_json {
            serde_json::from_slice::<serde_json::Value>(&body)
                .map_err(|source| FetchError::InvalidJson {
                    url: self.source.location().to_string(),
                    source,
                })
                .map_err(fetch_error)?;
        }

        let key = self.spec.key.render(self.clock.as_ref());

        if self.spec.skip_unchanged {
            match self.storage.head_object(&self.bucket, &key).await {
                Ok(latest) if latest.etag == format!("{:x}", md5::compute(&body)) => {
                    info!(%key, version = latest.version, "source data unchanged, skipping write");
                    return Ok(ProduceOutcome::Unchanged {
                        key,
                        version: latest.version,
                    });
                }
                Ok(_) | Err(StorageError::ObjectNotFound { .. }) => {}
                Err(err) => return Err(store_error(err)),
            }
        }

        let stored = self
            .storage
            .put_object(&self.bucket, &key, self.spec.content_type.clone(), body)
            .await
            .map_err(store_error)?;
        info!(
            key = %stored.key,
            version = stored.version,
            size_bytes = stored.size_bytes,
            "source data stored"
        );
        Ok(ProduceOutcome::Stored(stored))
    }
}

/// Every producer that runs on one scheduler trigger.
pub struct ProducerSet {
    producers: Vec<Producer>,
}

impl ProducerSet {
    pub fn new(producers: Vec<Producer>) -> Self {
        Self { producers }
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    /// Producer names, in run order.
    pub fn names(&self) -> Vec<&str> {
        self.producers.iter().map(Producer::name).collect()
    }

    /// Run every producer in order. One failing does not stop the rest.
    pub async fn run_all(&self) -> Vec<Result<ProduceOutcome, ProducerError>> {
        let mut results = Vec::with_capacity(self.producers.len());
        for producer in &self.producers {
            let result = producer.produce().await;
            if let Err(err) = &result {
                error!(source = producer.name(), error = %err, "producer run failed");
            }
            results.push(result);
        }
        results
    }
}
