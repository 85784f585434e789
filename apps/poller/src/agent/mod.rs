//! Passive agent checks.
//!
//! A check walks `ConnectWait -> Send -> Recv` on one stream. The per-task
//! deadline is polled ahead of the I/O so an expired deadline always wins,
//! and the error then names the stage the check was stuck in.

pub mod transport;

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{Instant, sleep_until};
use tracing::trace;

use crate::codec::CheckValue;
use crate::codec::agent::{Frame, MAX_RESPONSE_SIZE, decode_response, encode_request, parse_frame};
use crate::error::{CheckError, CheckStage};
use crate::item::ValueType;

pub use transport::{AgentStream, Connector, SecureSession, TcpConnector, TlsRegistry};

const FAILED: &str = "Get value from agent failed";
const READ_CHUNK: usize = 4096;

/// Everything one agent check needs, detached from the item descriptor
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub addr: String,
    pub port: u16,
    pub key: String,
    pub value_type: ValueType,
    pub session: Option<SecureSession>,
}

impl AgentRequest {
    fn endpoint(&self) -> String {
        format!("[[{}]:{}]", self.addr, self.port)
    }
}

/// Run one agent check to a terminal result
///
/// The stream is dropped (and so closed) before this returns, whatever the
/// outcome.
pub async fn run_agent_check(
    connector: Arc<dyn Connector>,
    request: AgentRequest,
    deadline: Instant,
) -> Result<CheckValue, CheckError> {
    let mut stage = CheckStage::ConnectWait;

    let finished = tokio::select! {
        biased;
        _ = sleep_until(deadline) => None,
        result = exchange(connector.as_ref(), &request, &mut stage) => Some(result),
    };

    match finished {
        Some(result) => result,
        None => Err(CheckError::timeout(FAILED, stage)),
    }
}

async fn exchange(
    connector: &dyn Connector,
    request: &AgentRequest,
    stage: &mut CheckStage,
) -> Result<CheckValue, CheckError> {
    let endpoint = request.endpoint();

    *stage = CheckStage::ConnectWait;
    let mut stream = connector
        .connect(&request.addr, request.port)
        .await
        .map_err(|e| CheckError::network(format!("{FAILED}: cannot connect to {endpoint}: {e}")))?;

    if let Some(session) = &request.session {
        stream = connector.secure(stream, session).await.map_err(|e| {
            CheckError::network(format!("{FAILED}: TCP successful, cannot establish TLS to {endpoint}: {e}"))
        })?;
    }

    *stage = CheckStage::Send;
    trace!(key = %request.key, %endpoint, "sending agent request");
    let send_error = |e: std::io::Error| CheckError::network(format!("{FAILED}: cannot send request to {endpoint}: {e}"));
    stream.write_all(&encode_request(&request.key)).await.map_err(send_error)?;
    stream.flush().await.map_err(send_error)?;

    *stage = CheckStage::Recv;
    let payload = read_reply(&mut stream, &endpoint).await?;
    drop(stream);

    decode_response(&payload, request.value_type, &request.addr)
}

/// Read until a full frame is buffered or the peer closes
async fn read_reply(stream: &mut AgentStream, endpoint: &str) -> Result<Vec<u8>, CheckError> {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        match parse_frame(&buf)? {
            Frame::Complete(payload) => return Ok(payload.to_vec()),
            Frame::Unframed if buf.len() > MAX_RESPONSE_SIZE => {
                return Err(CheckError::network(format!(
                    "{FAILED}: reply from {endpoint} exceeds the maximum size {MAX_RESPONSE_SIZE} bytes"
                )));
            }
            Frame::Unframed | Frame::Incomplete => {}
        }

        let read = stream
            .read_buf(&mut buf)
            .await
            .map_err(|e| CheckError::network(format!("{FAILED}: cannot read reply from {endpoint}: {e}")))?;

        if read == 0 {
            return match parse_frame(&buf)? {
                Frame::Complete(payload) => Ok(payload.to_vec()),
                Frame::Unframed => Ok(buf.to_vec()),
                Frame::Incomplete if buf.is_empty() => Ok(Vec::new()),
                Frame::Incomplete => Err(CheckError::network(format!(
                    "{FAILED}: connection to {endpoint} closed in the middle of a reply"
                ))),
            };
        }
    }
}
