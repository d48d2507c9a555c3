//! # Remote Collaborators
//!
//! HTTP implementations of the collaborator traits (reqwest, JSON) and a
//! crypto worker that runs an external command.
//!
//! | Service | Request |
//! |---------|---------|
//! | kingdom | `GET /v1/computations/active?continuation_token=..` |
//! | kingdom | `POST /v1/computations/{id}/confirm` |
//! | kingdom | `POST /v1/computations/{id}/outcome` |
//! | metric values | `GET /v1/metric_values/{provider}/{campaign}/{requisition}` |
//! | peer | `POST /v1/control/concatenated_sketch` (streamed body) |
//! | peer | `POST /v1/control/encrypted_flags_and_counts` (streamed body) |

use crate::clients::{
    ActiveComputation, ActiveComputationStream, BlindLastLayerIndexThenJoinRegistersRequest,
    BlindOneLayerRegisterIndexRequest, ChunkStream, ClientError, ComputationControl, CryptoWorker,
    DecryptOneLayerFlagAndCountRequest, GlobalComputations, MetricValues,
};
use async_trait::async_trait;
use duchy_core::{CompletedReason, RequisitionKey};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Header carrying the computation id of a streamed peer request.
pub const COMPUTATION_ID_HEADER: &str = "x-computation-id";

/// Map an HTTP response status to a client error.
async fn check_status(
    resp: reqwest::Response,
    what: &str,
) -> Result<reqwest::Response, ClientError> {
    let status = resp.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(ClientError::NotFound(what.to_string()));
    }
    if status == reqwest::StatusCode::GONE {
        return Err(ClientError::DataLoss(what.to_string()));
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ClientError::ServerError(status.as_u16(), body));
    }
    Ok(resp)
}

async fn send(
    req: reqwest::RequestBuilder,
    base_url: &str,
) -> Result<reqwest::Response, ClientError> {
    req.send()
        .await
        .map_err(|e| ClientError::ConnectionFailed(format!("{}: {e}", base_url)))
}

// =============================================================================
// KINGDOM
// =============================================================================

#[derive(Debug, Deserialize)]
struct ActiveComputationsPage {
    #[serde(default)]
    computations: Vec<ActiveComputation>,
}

#[derive(Debug, Serialize)]
struct ConfirmBody<'a> {
    ready_requisitions: &'a [RequisitionKey],
}

#[derive(Debug, Serialize)]
struct OutcomeBody {
    reason: CompletedReason,
}

/// HTTP client of the kingdom's global computations service.
#[derive(Clone)]
pub struct KingdomClient {
    http: reqwest::Client,
    base_url: String,
}

impl KingdomClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl GlobalComputations for KingdomClient {
    async fn stream_active_computations(
        &self,
        continuation_token: &str,
    ) -> Result<ActiveComputationStream, ClientError> {
        let req = self
            .http
            .get(format!("{}/v1/computations/active", self.base_url))
            .query(&[("continuation_token", continuation_token)]);
        let resp = check_status(send(req, &self.base_url).await?, "active computations").await?;
        let page: ActiveComputationsPage = resp
            .json()
            .await
            .map_err(|e| ClientError::ParseError(e.to_string()))?;
        Ok(futures::stream::iter(page.computations.into_iter().map(Ok)).boxed())
    }

    async fn confirm_requisitions(
        &self,
        global_id: &str,
        ready: &[RequisitionKey],
    ) -> Result<(), ClientError> {
        let req = self
            .http
            .post(format!("{}/v1/computations/{}/confirm", self.base_url, global_id))
            .json(&ConfirmBody {
                ready_requisitions: ready,
            });
        check_status(send(req, &self.base_url).await?, global_id).await?;
        Ok(())
    }

    async fn report_outcome(
        &self,
        global_id: &str,
        reason: CompletedReason,
    ) -> Result<(), ClientError> {
        let req = self
            .http
            .post(format!("{}/v1/computations/{}/outcome", self.base_url, global_id))
            .json(&OutcomeBody { reason });
        check_status(send(req, &self.base_url).await?, global_id).await?;
        Ok(())
    }
}

// =============================================================================
// METRIC VALUES
// =============================================================================

/// HTTP client of this duchy's metric-value store.
#[derive(Clone)]
pub struct MetricValuesClient {
    http: reqwest::Client,
    base_url: String,
}

impl MetricValuesClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl MetricValues for MetricValuesClient {
    async fn fetch(&self, key: &RequisitionKey) -> Result<Vec<u8>, ClientError> {
        let req = self
            .http
            .get(format!("{}/v1/metric_values/{}", self.base_url, key));
        let resp = check_status(send(req, &self.base_url).await?, &key.to_string()).await?;
        let body = resp
            .bytes()
            .await
            .map_err(|e| ClientError::ConnectionFailed(format!("{}: {e}", self.base_url)))?;
        Ok(body.to_vec())
    }
}

// =============================================================================
// PEER DUCHIES
// =============================================================================

/// HTTP client of a peer duchy's control service.
#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
    base_url: String,
}

impl PeerClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    /// Stream the chunks as one request body. An empty stream sends nothing.
    async fn stream_to(&self, endpoint: &str, mut chunks: ChunkStream) -> Result<(), ClientError> {
        let Some(first) = chunks.next().await else {
            return Ok(());
        };
        let global_id = first.global_id.clone();
        let body = futures::stream::once(async move { first })
            .chain(chunks)
            .map(|chunk| Ok::<_, std::io::Error>(chunk.data));
        let req = self
            .http
            .post(format!("{}/v1/control/{}", self.base_url, endpoint))
            .header(COMPUTATION_ID_HEADER, global_id.as_str())
            .body(reqwest::Body::wrap_stream(body));
        check_status(send(req, &self.base_url).await?, &global_id).await?;
        Ok(())
    }
}

#[async_trait]
impl ComputationControl for PeerClient {
    async fn handle_concatenated_sketch(&self, chunks: ChunkStream) -> Result<(), ClientError> {
        self.stream_to("concatenated_sketch", chunks).await
    }

    async fn handle_encrypted_flags_and_counts(
        &self,
        chunks: ChunkStream,
    ) -> Result<(), ClientError> {
        self.stream_to("encrypted_flags_and_counts", chunks).await
    }
}

// =============================================================================
// CRYPTO
// =============================================================================

/// One request to the crypto command, postcard-encoded on its stdin.
#[derive(Debug, Serialize)]
enum CryptoCall<'a> {
    BlindOneLayerRegisterIndex(&'a BlindOneLayerRegisterIndexRequest),
    BlindLastLayerIndexThenJoinRegisters(&'a BlindLastLayerIndexThenJoinRegistersRequest),
    DecryptOneLayerFlagAndCount(&'a DecryptOneLayerFlagAndCountRequest),
}

/// Crypto worker backed by an external command.
///
/// The command reads one postcard-encoded request from stdin and writes the
/// raw result bytes to stdout; a non-zero exit is a failure.
#[derive(Debug, Clone)]
pub struct CommandCryptoWorker {
    command: PathBuf,
    args: Vec<String>,
}

impl CommandCryptoWorker {
    pub fn new(command: PathBuf, args: Vec<String>) -> Self {
        Self { command, args }
    }

    fn run(&self, call: &CryptoCall<'_>) -> Result<Vec<u8>, ClientError> {
        let input = postcard::to_allocvec(call).map_err(|e| ClientError::Crypto(e.to_string()))?;
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ClientError::Crypto(format!("cannot start {}: {}", self.command.display(), e))
            })?;

        // Feed stdin from its own thread while this one drains stdout and
        // stderr; the command may emit output before it has read all input.
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClientError::Crypto("crypto command has no stdin".to_string()))?;
        let writer = std::thread::spawn(move || stdin.write_all(&input));

        let output = child
            .wait_with_output()
            .map_err(|e| ClientError::Crypto(e.to_string()))?;
        let written = writer
            .join()
            .map_err(|_| ClientError::Crypto("stdin writer panicked".to_string()))?;
        if !output.status.success() {
            return Err(ClientError::Crypto(format!(
                "{} exited with {}: {}",
                self.command.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        written.map_err(|e| ClientError::Crypto(format!("cannot write request: {}", e)))?;
        Ok(output.stdout)
    }
}

impl CryptoWorker for CommandCryptoWorker {
    fn blind_one_layer_register_index(
        &self,
        request: &BlindOneLayerRegisterIndexRequest,
    ) -> Result<Vec<u8>, ClientError> {
        self.run(&CryptoCall::BlindOneLayerRegisterIndex(request))
    }

    fn blind_last_layer_index_then_join_registers(
        &self,
        request: &BlindLastLayerIndexThenJoinRegistersRequest,
    ) -> Result<Vec<u8>, ClientError> {
        self.run(&CryptoCall::BlindLastLayerIndexThenJoinRegisters(request))
    }

    fn decrypt_one_layer_flag_and_count(
        &self,
        request: &DecryptOneLayerFlagAndCountRequest,
    ) -> Result<Vec<u8>, ClientError> {
        self.run(&CryptoCall::DecryptOneLayerFlagAndCount(request))
    }
}

// =============================================================================
// TESTS
// =============================================================================
