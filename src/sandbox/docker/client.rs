//! Docker Engine API client
//!
//! Speaks HTTP over the daemon's Unix socket.

use std::path::PathBuf;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyperlocal::UnixConnector;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::config::{ContainerCreate, ExecCreate, ExecInspect, ExecStart, IdResponse, NetworkCreate};
use crate::sandbox::SandboxError;

type HyperClient = Client<UnixConnector, Full<Bytes>>;

/// Outcome of a call where "already gone" is not a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Done,
    AlreadyGone,
}

pub struct DockerClient {
    client: HyperClient,
    socket_path: PathBuf,
}

impl DockerClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build(UnixConnector);
        Self {
            client,
            socket_path: socket_path.into(),
        }
    }

    async fn request<T: Serialize>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&T>,
    ) -> Result<Response<Incoming>, SandboxError> {
        let uri: hyper::Uri = hyperlocal::Uri::new(&self.socket_path, endpoint).into();
        let payload = match body {
            Some(b) => serde_json::to_vec(b).map_err(|e| SandboxError::Backend(e.to_string()))?,
            None => Vec::new(),
        };

        let req = hyper::Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| SandboxError::Backend(e.to_string()))?;

        self.client
            .request(req)
            .await
            .map_err(|e| SandboxError::Backend(format!("docker request to {} failed: {}", endpoint, e)))
    }

    /// Send a request and collect the whole response body
    async fn send_request<T: Serialize>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&T>,
    ) -> Result<(StatusCode, Bytes), SandboxError> {
        let res = self.request(method, endpoint, body).await?;
        let status = res.status();
        let bytes = res
            .into_body()
            .collect()
            .await
            .map_err(|e| SandboxError::Backend(e.to_string()))?
            .to_bytes();
        Ok((status, bytes))
    }

    async fn send_json<T: Serialize, R: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&T>,
    ) -> Result<R, SandboxError> {
        let (status, bytes) = self.send_request(method, endpoint, body).await?;
        if !status.is_success() {
            return Err(api_error(endpoint, status, &bytes));
        }
        serde_json::from_slice(&bytes).map_err(|e| SandboxError::Backend(e.to_string()))
    }

    async fn send_empty(&self, method: Method, endpoint: &str) -> Result<(StatusCode, Bytes), SandboxError> {
        self.send_request::<()>(method, endpoint, None).await
    }

    pub async fn ping(&self) -> Result<(), SandboxError> {
        let (status, bytes) = self.send_empty(Method::GET, "/_ping").await?;
        if !status.is_success() {
            return Err(api_error("/_ping", status, &bytes));
        }
        Ok(())
    }

    /// Create a network unless one with that name exists
    pub async fn ensure_network(&self, network: &NetworkCreate) -> Result<(), SandboxError> {
        let (status, _) = self.send_empty(Method::GET, &format!("/networks/{}", network.name)).await?;
        if status.is_success() {
            return Ok(());
        }
        let (status, bytes) = self.send_request(Method::POST, "/networks/create", Some(network)).await?;
        match status {
            s if s.is_success() => Ok(()),
            StatusCode::CONFLICT => Ok(()),
            s => Err(api_error("/networks/create", s, &bytes)),
        }
    }

    pub async fn create_container(&self, name: &str, spec: &ContainerCreate) -> Result<String, SandboxError> {
        let endpoint = format!("/containers/create?name={}", name);
        let created: IdResponse = self.send_json(Method::POST, &endpoint, Some(spec)).await?;
        Ok(created.id)
    }

    pub async fn start_container(&self, id: &str) -> Result<(), SandboxError> {
        let endpoint = format!("/containers/{}/start", id);
        let (status, bytes) = self.send_empty(Method::POST, &endpoint).await?;
        // 304: already started
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            Ok(())
        } else {
            Err(api_error(&endpoint, status, &bytes))
        }
    }

    pub async fn create_exec(&self, container_id: &str, spec: &ExecCreate) -> Result<String, SandboxError> {
        let endpoint = format!("/containers/{}/exec", container_id);
        let created: IdResponse = self.send_json(Method::POST, &endpoint, Some(spec)).await?;
        Ok(created.id)
    }

    /// Start an exec and return its multiplexed output stream
    pub async fn start_exec(&self, exec_id: &str) -> Result<Incoming, SandboxError> {
        let endpoint = format!("/exec/{}/start", exec_id);
        let res = self
            .request(Method::POST, &endpoint, Some(&ExecStart { detach: false, tty: false }))
            .await?;
        let status = res.status();
        if !status.is_success() {
            let bytes = res
                .into_body()
                .collect()
                .await
                .map(|c| c.to_bytes())
                .unwrap_or_default();
            return Err(api_error(&endpoint, status, &bytes));
        }
        Ok(res.into_body())
    }

    pub async fn inspect_exec(&self, exec_id: &str) -> Result<ExecInspect, SandboxError> {
        self.send_json::<(), _>(Method::GET, &format!("/exec/{}/json", exec_id), None)
            .await
    }

    /// SIGKILL the container; a stopped or missing container counts as killed
    pub async fn kill_container(&self, id: &str) -> Result<Removal, SandboxError> {
        let endpoint = format!("/containers/{}/kill", id);
        let (status, bytes) = self.send_empty(Method::POST, &endpoint).await?;
        match status {
            s if s.is_success() => Ok(Removal::Done),
            StatusCode::NOT_FOUND | StatusCode::CONFLICT => Ok(Removal::AlreadyGone),
            s => Err(api_error(&endpoint, s, &bytes)),
        }
    }

    pub async fn remove_container(&self, id: &str) -> Result<Removal, SandboxError> {
        let endpoint = format!("/containers/{}?force=true&v=true", id);
        let (status, bytes) = self.send_empty(Method::DELETE, &endpoint).await?;
        match status {
            s if s.is_success() => Ok(Removal::Done),
            // 409: removal already in progress
            StatusCode::NOT_FOUND | StatusCode::CONFLICT => Ok(Removal::AlreadyGone),
            s => Err(api_error(&endpoint, s, &bytes)),
        }
    }
}

fn api_error(endpoint: &str, status: StatusCode, body: &[u8]) -> SandboxError {
    let message = serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string());
    SandboxError::Backend(format!("docker API error on {}: {} - {}", endpoint, status, message))
}
