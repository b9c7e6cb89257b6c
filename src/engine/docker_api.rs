use crate::config::ProxySettings;
use crate::engine::events::spawn_event_pump;
use crate::engine::transport::{EngineResponse, Transport};
use crate::engine::{ContainerDescriptor, CreateContainerSpec, Engine, EventSubscription, RoleMatcher};
use crate::error::ProxyError;
use crate::parsers::event_types::PullProgress;
use crate::parsers::ndjson::NdjsonBuffer;
use futures_util::StreamExt;
use hyper::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Docker Engine API client
#[derive(Clone)]
pub struct DockerClient {
    transport: Arc<Transport>,
    api_version: String,
    roles: RoleMatcher,
    reconnect_delay: Duration,
}

#[derive(Debug, Deserialize)]
struct SystemInfo {
    #[serde(rename = "Labels", default)]
    labels: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateBody<'a> {
    image: &'a str,
    env: &'a [String],
    labels: &'a HashMap<String, String>,
    host_config: HostConfigBody<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfigBody<'a> {
    cap_add: &'a [String],
    auto_remove: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateResponse {
    id: String,
    #[serde(default)]
    warnings: Option<Vec<String>>,
}

impl DockerClient {
    pub fn new(settings: &ProxySettings) -> Result<Self, ProxyError> {
        Ok(Self {
            transport: Arc::new(Transport::new(
                &settings.engine_host,
                settings.request_timeout,
            )?),
            api_version: settings.api_version.clone(),
            roles: RoleMatcher::from_settings(settings),
            reconnect_delay: settings.reconnect_delay,
        })
    }

    fn api_path(&self, path: &str) -> String {
        format!("/v{}{}", self.api_version, path)
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<EngineResponse, ProxyError> {
        self.transport.send(method, &self.api_path(path), body).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ProxyError> {
        let resp = self.call(Method::GET, path, None).await?;
        if !resp.is_success() {
            let status = resp.status;
            let body = resp.text().await;
            return Err(ProxyError::EngineUnavailable(format!(
                "GET {path} returned {status}: {body}"
            )));
        }
        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Open the raw `/events` stream.
    pub(crate) async fn open_event_stream(&self) -> Result<EngineResponse, ProxyError> {
        let resp = self.call(Method::GET, "/events", None).await?;
        if !resp.is_success() {
            let status = resp.status;
            let body = resp.text().await;
            return Err(ProxyError::EngineUnavailable(format!(
                "Event subscription returned {status}: {body}"
            )));
        }
        Ok(resp)
    }

    pub(crate) fn roles(&self) -> &RoleMatcher {
        &self.roles
    }

    pub(crate) fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }
}

/// Split `repo[:tag]` into the `fromImage` / `tag` pair the pull endpoint wants.
/// Digests and registry ports are left in the repository part.
pub fn split_image_reference(reference: &str) -> (&str, Option<&str>) {
    if reference.contains('@') {
        return (reference, None);
    }
    let name_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[name_start..].rfind(':') {
        Some(i) => {
            let split = name_start + i;
            (&reference[..split], Some(&reference[split + 1..]))
        }
        None => (reference, None),
    }
}

fn pull_query(reference: &str) -> String {
    let (repo, tag) = split_image_reference(reference);
    let mut query = format!("fromImage={}", urlencoding::encode(repo));
    query.push_str("&tag=");
    query.push_str(&urlencoding::encode(tag.unwrap_or("latest")));
    query
}

/// Check one line of pull progress, logging it and failing on an error entry.
fn check_pull_progress(line: &str) -> Result<(), ProxyError> {
    let progress: PullProgress = match serde_json::from_str(line) {
        Ok(p) => p,
        Err(_) => {
            tracing::debug!("Unparsed pull output: {line}");
            return Ok(());
        }
    };
    if let Some(error) = progress.error {
        return Err(ProxyError::ImagePullFailed(error));
    }
    tracing::debug!(
        "pull: {} {} {}",
        progress.id.unwrap_or_default(),
        progress.status.unwrap_or_default(),
        progress.progress.unwrap_or_default()
    );
    Ok(())
}

impl Engine for DockerClient {
    async fn host_labels(&self) -> Result<Vec<String>, ProxyError> {
        let info: SystemInfo = self.get_json("/info").await?;
        Ok(info.labels.unwrap_or_default())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerDescriptor>, ProxyError> {
        self.get_json("/containers/json").await
    }

    async fn pull_image(&self, reference: &str) -> Result<(), ProxyError> {
        let path = format!("/images/create?{}", pull_query(reference));
        let resp = self.call(Method::POST, &path, None).await?;
        if !resp.is_success() {
            let status = resp.status;
            let body = resp.text().await;
            return Err(ProxyError::ImagePullFailed(format!(
                "{reference}: engine returned {status}: {body}"
            )));
        }

        let mut buffer = NdjsonBuffer::new();
        let mut body = resp.body;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| ProxyError::ImagePullFailed(format!("{reference}: {e}")))?;
            for line in buffer.push(&chunk) {
                check_pull_progress(&line)?;
            }
        }
        if let Some(line) = buffer.finish() {
            check_pull_progress(&line)?;
        }
        Ok(())
    }

    async fn create_container(&self, spec: &CreateContainerSpec) -> Result<String, ProxyError> {
        let body = serde_json::to_vec(&CreateBody {
            image: &spec.image,
            env: &spec.env,
            labels: &spec.labels,
            host_config: HostConfigBody {
                cap_add: &spec.cap_add,
                auto_remove: spec.auto_remove,
            },
        })?;
        let path = format!(
            "/containers/create?name={}",
            urlencoding::encode(&spec.name)
        );

        let resp = self.call(Method::POST, &path, Some(body)).await?;
        if !resp.is_success() {
            let status = resp.status;
            let body = resp.text().await;
            return Err(ProxyError::CreateFailed(format!(
                "{}: engine returned {status}: {body}",
                spec.name
            )));
        }

        let body = resp.bytes().await?;
        let created: CreateResponse = serde_json::from_slice(&body)
            .map_err(|e| ProxyError::CreateFailed(format!("Failed to parse create response: {e}")))?;
        for warning in created.warnings.unwrap_or_default() {
            tracing::warn!("Create {}: {warning}", spec.name);
        }
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), ProxyError> {
        let resp = self
            .call(Method::POST, &format!("/containers/{id}/start"), None)
            .await?;
        // 304: already started
        if resp.is_success() || resp.status == 304 {
            return Ok(());
        }
        let status = resp.status;
        let body = resp.text().await;
        Err(ProxyError::StartFailed(format!(
            "{id}: engine returned {status}: {body}"
        )))
    }

    async fn stop_container(&self, id: &str) -> Result<(), ProxyError> {
        let resp = self
            .call(Method::POST, &format!("/containers/{id}/stop"), None)
            .await?;
        match resp.status {
            s if (200..300).contains(&s) => Ok(()),
            304 => {
                tracing::debug!("Container {id} was already stopped");
                Ok(())
            }
            404 => {
                tracing::debug!("Container {id} is already gone");
                Ok(())
            }
            status => {
                let body = resp.text().await;
                Err(ProxyError::StopFailed(format!(
                    "{id}: engine returned {status}: {body}"
                )))
            }
        }
    }

    fn subscribe_events(&self) -> EventSubscription {
        spawn_event_pump(self.clone())
    }
}
