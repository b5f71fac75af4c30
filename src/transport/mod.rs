//! gRPC transport layer for idrecon.
//!
//! The `Identify` RPC carries the request and response documents as JSON
//! bytes, so gRPC clients see the same shapes as any JSON caller. Failures are
//! returned as a `Status` whose message is the `{ "error": ... }` body.

use serde::Serialize;
use tonic::{Request, Response, Status};
use tracing::Span;

use crate::error::{ErrorBody, ReconcileError};
use crate::request::IdentifyRequest;
use crate::service::{Cancellation, IdentityService};

pub mod proto {
    tonic::include_proto!("idrecon");
}

use proto::idrecon_server::{Idrecon, IdreconServer};

/// Maximum size of an identify request payload.
const MAX_REQUEST_JSON_BYTES: usize = 16 * 1024; // 16 KiB

/// Maximum size of a response payload. Large clusters can list many values.
const MAX_RESPONSE_JSON_BYTES: usize = 4 * 1024 * 1024; // 4 MiB

/// gRPC service implementation for idrecon.
#[derive(Clone)]
pub struct IdreconServiceImpl {
    service: IdentityService,
}

impl IdreconServiceImpl {
    #[must_use]
    pub fn new(service: IdentityService) -> Self {
        Self { service }
    }

    #[must_use]
    pub fn into_server(self) -> IdreconServer<Self> {
        IdreconServer::new(self)
    }
}

/// Fires its token unless disarmed, so a dropped RPC future cancels the
/// blocking reconciliation it started.
struct CancelOnDrop(Option<Cancellation>);

impl CancelOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(cancel) = self.0.take() {
            cancel.cancel();
        }
    }
}

fn error_status(code: tonic::Code, error: impl Into<String>) -> Status {
    let body = ErrorBody {
        error: error.into(),
    };
    let message = serde_json::to_string(&body).unwrap_or(body.error);
    Status::new(code, message)
}

fn parse_request(bytes: &[u8]) -> Result<IdentifyRequest, Status> {
    if bytes.len() > MAX_REQUEST_JSON_BYTES {
        return Err(error_status(
            tonic::Code::InvalidArgument,
            "request JSON exceeds size limit",
        ));
    }
    serde_json::from_slice(bytes).map_err(|e| {
        error_status(
            tonic::Code::InvalidArgument,
            format!("invalid request JSON: {e}"),
        )
    })
}

fn encode_json<T: Serialize>(value: &T, max: usize) -> Result<Vec<u8>, Status> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| Status::internal(format!("failed to serialize response JSON: {e}")))?;
    if bytes.len() > max {
        return Err(Status::resource_exhausted("serialized JSON exceeds size limit"));
    }
    Ok(bytes)
}

fn status_from_reconcile_error(err: &ReconcileError) -> Status {
    let code = if err.is_client_error() {
        tonic::Code::InvalidArgument
    } else {
        tonic::Code::Internal
    };
    error_status(code, err.to_body().error)
}

#[tonic::async_trait]
impl Idrecon for IdreconServiceImpl {
    async fn identify(
        &self,
        request: Request<proto::IdentifyRequest>,
    ) -> Result<Response<proto::IdentifyResponse>, Status> {
        let req = request.into_inner();
        let parsed = parse_request(&req.request_json)?;

        let service = self.service.clone();
        let cancel = Cancellation::new();
        let guard = CancelOnDrop(Some(cancel.clone()));
        let span = Span::current();

        let result = tokio::task::spawn_blocking(move || {
            let _enter = span.enter();
            service.identify_with_cancel(parsed, &cancel)
        })
        .await
        .map_err(|e| Status::internal(format!("reconcile task failed: {e}")))?;
        guard.disarm();

        let resp = result.map_err(|e| status_from_reconcile_error(&e))?;
        let response_json = encode_json(&resp, MAX_RESPONSE_JSON_BYTES)?;
        Ok(Response::new(proto::IdentifyResponse { response_json }))
    }

    async fn health(
        &self,
        _request: Request<proto::HealthRequest>,
    ) -> Result<Response<proto::HealthResponse>, Status> {
        let store = self.service.store().clone();
        let contacts = tokio::task::spawn_blocking(move || store.len())
            .await
            .map_err(|e| Status::internal(format!("health task failed: {e}")))?
            .map_err(|e| Status::unavailable(e.to_string()))?;

        Ok(Response::new(proto::HealthResponse {
            status: "serving".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            contacts: contacts as u64,
        }))
    }
}
