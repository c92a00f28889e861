//! Client for a discoverd-style HTTP registry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::heartbeat::{Heartbeater, Lease};
use crate::sse::SseDecoder;
use crate::types::{Instance, ServiceConfig, ServiceEvent, ServiceMeta};
use crate::{EventStream, Registry, RegistryError};

/// Default registry address.
pub const DEFAULT_URL: &str = "http://127.0.0.1:1111";

/// Default instance time-to-live; heartbeats run at half of it.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

/// Registry client speaking HTTP.
#[derive(Clone)]
pub struct HttpRegistry {
    client: reqwest::Client,
    base_url: String,
    ttl: Duration,
}

impl HttpRegistry {
    pub fn new(base_url: impl Into<String>) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            ttl: DEFAULT_TTL,
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn put_instance(&self, service: &str, instance: &Instance) -> Result<(), RegistryError> {
        let url = self.url(&format!("/services/{service}/instances/{}", instance.id));
        let response = self
            .client
            .put(&url)
            .timeout(self.ttl)
            .json(instance)
            .send()
            .await?;
        check(response, service).await.map(|_| ())
    }

    /// GETs `path`, mapping 404 to `None`.
    async fn get_optional<T: DeserializeOwned>(
        &self,
        path: &str,
        service: &str,
    ) -> Result<Option<T>, RegistryError> {
        let response = self
            .client
            .get(self.url(path))
            .timeout(self.ttl)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check(response, service).await?;
        Ok(Some(response.json().await?))
    }
}

/// Turns a non-success status into an error.
async fn check(
    response: reqwest::Response,
    service: &str,
) -> Result<reqwest::Response, RegistryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::NOT_FOUND => Err(RegistryError::ServiceNotFound(service.to_string())),
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => {
            Err(RegistryError::Unavailable(body))
        }
        _ => Err(RegistryError::Status {
            status: status.as_u16(),
            body,
        }),
    }
}

struct HttpLease {
    registry: HttpRegistry,
    service: String,
    instance: Instance,
}

#[async_trait]
impl Lease for HttpLease {
    async fn refresh(&self) -> Result<(), RegistryError> {
        self.registry.put_instance(&self.service, &self.instance).await
    }

    async fn release(&self) -> Result<(), RegistryError> {
        let url = self.registry.url(&format!(
            "/services/{}/instances/{}",
            self.service, self.instance.id
        ));
        let response = self.registry.client.delete(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response, &self.service).await.map(|_| ())
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn add_service(&self, service: &str, config: ServiceConfig) -> Result<(), RegistryError> {
        let url = self.url(&format!("/services/{service}"));
        debug!(url = %url, "Adding registry service");
        let response = self.client.put(&url).json(&config).send().await?;
        // The service already existing is fine
        if response.status() == StatusCode::CONFLICT {
            return Ok(());
        }
        check(response, service).await.map(|_| ())
    }

    async fn register_instance(
        &self,
        service: &str,
        instance: Instance,
    ) -> Result<Heartbeater, RegistryError> {
        self.put_instance(service, &instance).await?;
        debug!(service, instance_id = %instance.id, addr = %instance.addr, "Registered instance");
        let lease = Arc::new(HttpLease {
            registry: self.clone(),
            service: service.to_string(),
            instance: instance.clone(),
        });
        Ok(Heartbeater::start(
            service,
            instance,
            lease,
            Some(self.ttl / 2),
        ))
    }

    async fn instances(&self, service: &str) -> Result<Vec<Instance>, RegistryError> {
        self.get_optional(&format!("/services/{service}/instances"), service)
            .await?
            .ok_or_else(|| RegistryError::ServiceNotFound(service.to_string()))
    }

    async fn leader(&self, service: &str) -> Result<Option<Instance>, RegistryError> {
        self.get_optional(&format!("/services/{service}/leader"), service)
            .await
    }

    async fn watch(&self, service: &str) -> Result<EventStream, RegistryError> {
        let url = self.url(&format!("/services/{service}"));
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let response = check(response, service).await?;

        let mut decoder = SseDecoder::default();
        let events = response.bytes_stream().flat_map(move |chunk| {
            let items: Vec<Result<ServiceEvent, RegistryError>> = match chunk {
                Ok(bytes) => decoder
                    .push(&bytes)
                    .into_iter()
                    .map(|data| serde_json::from_str(&data).map_err(RegistryError::from))
                    .collect(),
                Err(e) => {
                    warn!(error = %e, "Registry watch stream failed");
                    vec![Err(RegistryError::Unavailable(e.to_string()))]
                }
            };
            stream::iter(items)
        });

        // The server closing the stream means we lost the watch
        let closed = stream::once(async {
            Err(RegistryError::Unavailable("watch closed".to_string()))
        });
        Ok(events.chain(closed).boxed())
    }

    async fn get_meta(&self, service: &str) -> Result<Option<ServiceMeta>, RegistryError> {
        self.get_optional(&format!("/services/{service}/meta"), service)
            .await
    }

    async fn set_meta(&self, service: &str, meta: ServiceMeta) -> Result<ServiceMeta, RegistryError> {
        let url = self.url(&format!("/services/{service}/meta"));
        let expected = meta.index;
        let response = self.client.put(&url).json(&meta).send().await?;
        if matches!(
            response.status(),
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED
        ) {
            let current = self.get_meta(service).await?.map_or(0, |m| m.index);
            return Err(RegistryError::IndexConflict { expected, current });
        }
        let response = check(response, service).await?;
        Ok(response.json().await?)
    }

    async fn ping(&self) -> Result<(), RegistryError> {
        let response = self
            .client
            .get(self.url("/ping"))
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        check(response, "").await.map(|_| ())
    }
}
