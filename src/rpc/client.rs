//! Sandbox side of the RPC bridge, for runners written in Rust
//!
//! Mirrors what the generated Python stub does: one POST per call, the
//! method kind taken from the response, and short-circuiting kinds handed
//! back as the sentinel block the program must print before exiting.

use std::path::{Path, PathBuf};
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyperlocal::UnixConnector;
use serde_json::{Map, Value};

use super::envelope::{
    encode_key_header, RpcRequest, RpcResponse, CALL_PATH, HEADER_CONVERSATION_KEY, HEADER_ERROR,
    HEADER_METHOD_KIND, HEADER_RUN_ID, HEADER_SANDBOX_ID,
};
use crate::capability::MethodKind;
use crate::stub::{render_sentinel, StubRouting};

const CALL_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("bridge unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("bridge unreachable: {0}")]
    Socket(String),
    #[error("malformed bridge reply: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("call rejected by host (HTTP {status})")]
    Rejected { status: u16 },
    #[error("{name}: {message}")]
    Capability { name: String, message: String },
}

/// Result of a successful call
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// Tool result, the program continues
    Continue(Value),
    /// Agent or behavior call, the program must print `rendered` and exit
    Exit { kind: MethodKind, rendered: String },
}

/// `http://host:port` or `unix:///path/to/socket`
enum Transport {
    Tcp { http: reqwest::Client, url: String },
    Unix { http: Client<UnixConnector, Full<Bytes>>, socket: PathBuf },
}

/// What the client needs from a bridge response
struct Reply {
    status: u16,
    flagged: bool,
    kind: Option<MethodKind>,
    body: Vec<u8>,
}

pub struct CapabilityClient {
    transport: Transport,
    routing: StubRouting,
}

impl CapabilityClient {
    pub fn new(routing: StubRouting) -> Result<Self, ClientError> {
        let transport = match routing.bridge_url.strip_prefix("unix://") {
            Some(socket) => Transport::Unix {
                http: Client::builder(hyper_util::rt::TokioExecutor::new()).build(UnixConnector),
                socket: PathBuf::from(socket),
            },
            None => Transport::Tcp {
                http: reqwest::Client::builder().timeout(CALL_TIMEOUT).build()?,
                url: format!("{}{}", routing.bridge_url.trim_end_matches('/'), CALL_PATH),
            },
        };
        Ok(Self { transport, routing })
    }

    /// Build from the process environment, if routing variables are set
    pub fn from_env() -> Option<Result<Self, ClientError>> {
        StubRouting::from_env_vars(std::env::vars()).map(Self::new)
    }

    pub fn routing(&self) -> &StubRouting {
        &self.routing
    }

    pub async fn call(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<CallOutcome, ClientError> {
        let body = serde_json::to_vec(&RpcRequest {
            capability_name: name.to_string(),
            args,
            kwargs,
        })?;
        let reply = match &self.transport {
            Transport::Tcp { http, url } => self.post_tcp(http, url, body).await?,
            Transport::Unix { http, socket } => self.post_unix(http, socket, body).await?,
        };

        if !(200..300).contains(&reply.status) {
            return Err(ClientError::Rejected { status: reply.status });
        }
        let payload: RpcResponse = serde_json::from_slice(&reply.body)?;

        if reply.flagged || payload.is_error() {
            return Err(ClientError::Capability {
                name: name.to_string(),
                message: payload.error.unwrap_or_else(|| "unknown error".to_string()),
            });
        }

        let kind = reply.kind.unwrap_or(MethodKind::Tool);
        if kind.short_circuits() {
            Ok(CallOutcome::Exit {
                kind,
                rendered: render_sentinel(kind, name, &payload.value.to_string()),
            })
        } else {
            Ok(CallOutcome::Continue(payload.value))
        }
    }

    async fn post_tcp(&self, http: &reqwest::Client, url: &str, body: Vec<u8>) -> Result<Reply, ClientError> {
        let response = http
            .post(url)
            .header("content-type", "application/json")
            .header(HEADER_SANDBOX_ID, &self.routing.sandbox_id)
            .header(HEADER_CONVERSATION_KEY, encode_key_header(&self.routing.conversation_key))
            .header(HEADER_RUN_ID, &self.routing.run_id)
            .body(body)
            .send()
            .await?;

        let headers = response.headers();
        let flagged = headers.get(HEADER_ERROR).map(|v| v.as_bytes() == b"1").unwrap_or(false);
        let kind = headers
            .get(HEADER_METHOD_KIND)
            .and_then(|v| v.to_str().ok())
            .and_then(MethodKind::parse);
        Ok(Reply {
            status: response.status().as_u16(),
            flagged,
            kind,
            body: response.bytes().await?.to_vec(),
        })
    }

    async fn post_unix(
        &self,
        http: &Client<UnixConnector, Full<Bytes>>,
        socket: &Path,
        body: Vec<u8>,
    ) -> Result<Reply, ClientError> {
        let uri: hyper::Uri = hyperlocal::Uri::new(socket, CALL_PATH).into();
        let request = hyper::Request::post(uri)
            .header("content-type", "application/json")
            .header(HEADER_SANDBOX_ID, self.routing.sandbox_id.as_str())
            .header(HEADER_CONVERSATION_KEY, encode_key_header(&self.routing.conversation_key))
            .header(HEADER_RUN_ID, self.routing.run_id.as_str())
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| ClientError::Socket(e.to_string()))?;

        let response = tokio::time::timeout(CALL_TIMEOUT, http.request(request))
            .await
            .map_err(|_| ClientError::Socket("call timed out".into()))?
            .map_err(|e| ClientError::Socket(e.to_string()))?;

        let headers = response.headers();
        let flagged = headers.get(HEADER_ERROR).map(|v| v.as_bytes() == b"1").unwrap_or(false);
        let kind = headers
            .get(HEADER_METHOD_KIND)
            .and_then(|v| v.to_str().ok())
            .and_then(MethodKind::parse);
        let status = response.status().as_u16();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ClientError::Socket(e.to_string()))?
            .to_bytes()
            .to_vec();
        Ok(Reply { status, flagged, kind, body })
    }
}
