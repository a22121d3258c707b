use std::io::ErrorKind;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mangapanel_contracts::errors::{Stage, WorkflowError};
use serde_json::Value;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{connect as websocket_connect, Message as WsMessage, WebSocket};

use crate::comfy::{ArtifactRef, ComfyClient, JobHandle};

const SOCKET_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// What the correlator made of one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Not ours: another job, another event type, or not parseable at all.
    Ignored,
    /// Our job finished; the produced image filenames, in server order.
    Completed(Vec<String>),
}

/// Request-scoped correlation state for exactly one outstanding job.
///
/// Frames are matched on `type == "executed"` and `data.prompt_id`; anything
/// else is ignored without a state change. After the first match every
/// further frame is ignored, so the completion fires at most once per job.
#[derive(Debug)]
pub struct JobCorrelator {
    job_id: String,
    matched: bool,
}

impl JobCorrelator {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            matched: false,
        }
    }

    pub fn matched(&self) -> bool {
        self.matched
    }

    pub fn observe(&mut self, raw: &str) -> Observation {
        if self.matched {
            return Observation::Ignored;
        }
        let Ok(value) = serde_json::from_str::<Value>(raw) else {
            return Observation::Ignored;
        };
        if value.get("type").and_then(Value::as_str) != Some("executed") {
            return Observation::Ignored;
        }
        let Some(data) = value.get("data") else {
            return Observation::Ignored;
        };
        if data.get("prompt_id").and_then(Value::as_str) != Some(self.job_id.as_str()) {
            return Observation::Ignored;
        }

        self.matched = true;
        let filenames = data
            .get("output")
            .and_then(|output| output.get("images"))
            .and_then(Value::as_array)
            .map(|images| {
                images
                    .iter()
                    .filter_map(|entry| entry.get("filename").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Observation::Completed(filenames)
    }
}

/// Terminal state of one listening session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenOutcome {
    Completed(ArtifactRef),
    TimedOut,
    Cancelled,
}

/// Listen on the rendering server's notification feed until the job
/// completes, the deadline passes, or the caller cancels.
///
/// Cancellation is silent: the socket is closed and no completion is
/// reported. A matching notification with an empty image list is an error,
/// not a silent no-op.
pub fn wait_for_completion(
    client: &ComfyClient,
    handle: &JobHandle,
    listen_timeout: Duration,
    cancel: &AtomicBool,
) -> Result<ListenOutcome, WorkflowError> {
    let (mut ws, _) = websocket_connect(client.ws_url())
        .map_err(|err| WorkflowError::transport(Stage::Listen, err))?;
    set_socket_read_timeout(&mut ws, Some(SOCKET_READ_TIMEOUT));

    let deadline = Instant::now() + listen_timeout;
    let mut correlator = JobCorrelator::new(&handle.job_id);

    let outcome = loop {
        if cancel.load(Ordering::SeqCst) {
            break ListenOutcome::Cancelled;
        }
        if Instant::now() >= deadline {
            break ListenOutcome::TimedOut;
        }

        let message = match ws.read() {
            Ok(message) => message,
            Err(tungstenite::Error::Io(err))
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                continue;
            }
            Err(err) => {
                let _ = ws.close(None);
                return Err(WorkflowError::transport(Stage::Listen, err));
            }
        };

        let raw = match message {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Binary(bytes) => String::from_utf8_lossy(&bytes).to_string(),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            WsMessage::Close(_) => {
                let _ = ws.close(None);
                return Err(WorkflowError::transport(
                    Stage::Listen,
                    "notification feed closed before the job completed",
                ));
            }
            _ => continue,
        };

        match correlator.observe(&raw) {
            Observation::Ignored => continue,
            Observation::Completed(filenames) => match filenames.first() {
                Some(filename) => break ListenOutcome::Completed(client.artifact_url(filename)),
                None => {
                    let _ = ws.close(None);
                    return Err(WorkflowError::NoArtifactProduced {
                        job_id: handle.job_id.clone(),
                    });
                }
            },
        }
    };

    let _ = ws.close(None);
    Ok(outcome)
}

fn set_socket_read_timeout(
    ws: &mut WebSocket<MaybeTlsStream<TcpStream>>,
    timeout: Option<Duration>,
) {
    match ws.get_mut() {
        MaybeTlsStream::Plain(stream) => {
            let _ = stream.set_read_timeout(timeout);
        }
        MaybeTlsStream::Rustls(stream) => {
            let _ = stream.get_mut().set_read_timeout(timeout);
        }
        _ => {}
    }
}
