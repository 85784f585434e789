//! HTTP agent checks.
//!
//! Requests from the whole poller share one engine: clients are reused per
//! profile and a semaphore caps the number of parallel transfers. Each
//! submitted request gets a handle, and completions are matched back to
//! their task through the pending map.

pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

use crate::codec::CheckValue;
use crate::codec::http::{
    ClientProfile, HttpRequest, HttpResponse, ResponseExpectation, TransportFailure, interpret_response,
    transport_error,
};
use crate::error::{CheckError, CheckStage};
use crate::item::HttpCheck;
use crate::task::TaskItem;

pub use transport::ReqwestTransport;

const FAILED: &str = "Cannot perform request";

/// Performs HTTP transfers for the engine
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Make sure a client for this profile can be built
    fn prepare(&self, profile: &ClientProfile) -> Result<(), CheckError>;

    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportFailure>;
}

pub type RequestHandle = u64;

#[derive(Debug)]
pub enum TransferError {
    /// The per-task deadline fired in the given stage
    Deadline(CheckStage),
    Failed(TransportFailure),
}

/// A finished transfer, still detached from its task
#[derive(Debug)]
pub struct HttpCompletion {
    pub handle: RequestHandle,
    pub outcome: Result<HttpResponse, TransferError>,
}

struct PendingRequest {
    task: TaskItem,
    expectation: ResponseExpectation,
    via_proxy: bool,
}

pub struct HttpEngine {
    transport: Arc<dyn HttpTransport>,
    transfers: Arc<Semaphore>,
    next_handle: RequestHandle,
    pending: HashMap<RequestHandle, PendingRequest>,
}

impl HttpEngine {
    pub fn new(transport: Arc<dyn HttpTransport>, max_transfers: usize) -> Self {
        Self {
            transport,
            transfers: Arc::new(Semaphore::new(max_transfers.max(1))),
            next_handle: 0,
            pending: HashMap::new(),
        }
    }

    /// Build and submit a request for one item
    ///
    /// Errors are returned before anything is submitted, so the caller can
    /// fail the item straight away.
    pub fn submit(
        &mut self,
        task: &TaskItem,
        check: &HttpCheck,
        deadline: Instant,
    ) -> Result<BoxFuture<'static, HttpCompletion>, CheckError> {
        let request = HttpRequest::from_check(check)?;
        self.transport.prepare(&request.profile)?;

        self.next_handle += 1;
        let handle = self.next_handle;

        self.pending.insert(
            handle,
            PendingRequest {
                task: task.clone(),
                expectation: request.expectation.clone(),
                via_proxy: request.profile.proxy.is_some(),
            },
        );

        let transport = self.transport.clone();
        let transfers = self.transfers.clone();

        Ok(async move {
            let mut stage = CheckStage::Queued;

            let finished = tokio::select! {
                biased;
                _ = sleep_until(deadline) => None,
                result = transfer(transport, transfers, request, &mut stage) => Some(result),
            };

            let outcome = finished.unwrap_or(Err(TransferError::Deadline(stage)));
            HttpCompletion { handle, outcome }
        }
        .boxed())
    }

    /// Match a completion back to its task and interpret the response
    ///
    /// Returns `None` for requests that were abandoned in the meantime.
    pub fn complete(&mut self, completion: HttpCompletion) -> Option<(TaskItem, Result<CheckValue, CheckError>)> {
        let Some(pending) = self.pending.remove(&completion.handle) else {
            debug!(handle = completion.handle, "completion for an abandoned request");
            return None;
        };

        let result = match completion.outcome {
            Ok(response) => interpret_response(&pending.expectation, pending.via_proxy, response),
            Err(TransferError::Deadline(stage)) => Err(CheckError::timeout(FAILED, stage)),
            Err(TransferError::Failed(failure)) if failure.timed_out => {
                Err(CheckError::timeout(FAILED, CheckStage::Transfer))
            }
            Err(TransferError::Failed(failure)) => Err(transport_error(failure, pending.via_proxy)),
        };

        Some((pending.task, result))
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Forget every pending request; their completions will be ignored
    pub fn abandon_all(&mut self) -> usize {
        let abandoned = self.pending.len();
        self.pending.clear();
        abandoned
    }
}

async fn transfer(
    transport: Arc<dyn HttpTransport>,
    transfers: Arc<Semaphore>,
    request: HttpRequest,
    stage: &mut CheckStage,
) -> Result<HttpResponse, TransferError> {
    let _permit = transfers
        .acquire_owned()
        .await
        .map_err(|_| TransferError::Failed(TransportFailure::new("transfer pool is closed")))?;

    *stage = CheckStage::Transfer;
    transport.execute(request).await.map_err(TransferError::Failed)
}
