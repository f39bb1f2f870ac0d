//! Event Stream Client: one ComfyUI execution attempt, end to end.
//!
//! [`EventStreamClient::open`] connects the WebSocket under the job's
//! `client_id`, submits the workflow through `POST /prompt`, then reads
//! frames until the configured end node reports `executed`. Progress,
//! cache and per-node traffic is forwarded to subscribers on the way.
//!
//! Every `open` settles exactly once. Afterwards the client is closed:
//! subscribers are dropped and a second `open` is rejected.

use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;

use kiln_core::workflow::WorkflowGraph;

use crate::api::ComfyUIApi;
use crate::events::ExecutionEvent;
use crate::messages::{parse_message, ComfyUIMessage, ExecutedData};

/// Bounds for the watchdog tick.
const MIN_WATCHDOG_TICK: Duration = Duration::from_millis(10);
const MAX_WATCHDOG_TICK: Duration = Duration::from_secs(1);

/// Connection settings for one execution attempt.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Engine `host:port`, without scheme.
    pub host: String,
    /// Use `https`/`wss` instead of `http`/`ws`.
    pub secure: bool,
    /// Session identifier shared by the WebSocket and the submission.
    pub client_id: String,
    /// Maximum wall-clock time from connect to the end node's event.
    pub timeout: Duration,
}

impl ClientOptions {
    pub fn http_base(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}", self.host)
    }

    pub fn ws_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}/ws?clientId={}", self.host, self.client_id)
    }
}

/// What to run and which node finishes it.
#[derive(Debug, Clone, Copy)]
pub struct OpenRequest<'a> {
    pub workflow: &'a WorkflowGraph,
    pub end_node_id: &'a str,
}

/// Successful outcome of [`EventStreamClient::open`].
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Prompt id assigned by the engine at submission.
    pub prompt_id: String,
    /// The end node's `executed` payload.
    pub executed: ExecutedData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Open,
    Closed,
}

/// Per-job client for one engine execution. Never reused across jobs.
#[derive(Debug)]
pub struct EventStreamClient {
    options: ClientOptions,
    api: ComfyUIApi,
    listeners: Vec<mpsc::UnboundedSender<ExecutionEvent>>,
    cancel: CancellationToken,
    watchdog_tick: Duration,
    state: SessionState,
}

impl EventStreamClient {
    /// Build a client with its own HTTP connection pool.
    pub fn new(options: ClientOptions) -> Result<Self, StreamError> {
        Self::with_http_client(options, reqwest::Client::new())
    }

    /// Build a client sharing an existing [`reqwest::Client`].
    ///
    /// Fails fast when `host` or `client_id` is empty.
    pub fn with_http_client(
        options: ClientOptions,
        http: reqwest::Client,
    ) -> Result<Self, StreamError> {
        if options.host.trim().is_empty() {
            return Err(StreamError::MissingHost);
        }
        if options.client_id.trim().is_empty() {
            return Err(StreamError::MissingClientId);
        }

        let watchdog_tick = (options.timeout / 10).clamp(MIN_WATCHDOG_TICK, MAX_WATCHDOG_TICK);
        let api = ComfyUIApi::with_client(http, options.http_base());

        Ok(Self {
            options,
            api,
            listeners: Vec::new(),
            cancel: CancellationToken::new(),
            watchdog_tick,
            state: SessionState::Idle,
        })
    }

    /// Abort the execution when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Register a listener for forwarded events.
    ///
    /// The channel closes when the client closes, so a drain loop over
    /// the receiver ends by itself once `open` settles.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ExecutionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.state != SessionState::Closed {
            self.listeners.push(tx);
        }
        rx
    }

    /// Run the workflow and wait for the end node's `executed` event.
    pub async fn open(
        &mut self,
        request: OpenRequest<'_>,
    ) -> Result<ExecutionOutcome, StreamError> {
        if self.state != SessionState::Idle {
            return Err(StreamError::AlreadyClosed);
        }
        self.state = SessionState::Open;

        let outcome = self.run(request).await;
        self.close();
        outcome
    }

    /// Tear down the session: stop dispatch and detach every listener.
    ///
    /// Idempotent. Returns `true` only for the call that actually closed.
    pub fn close(&mut self) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        self.state = SessionState::Closed;
        self.listeners.clear();
        tracing::debug!(client_id = %self.options.client_id, "Event stream client closed");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    // ---- private helpers ----

    async fn run(&mut self, request: OpenRequest<'_>) -> Result<ExecutionOutcome, StreamError> {
        let url = self.options.ws_url();
        let budget = self.options.timeout;
        let opened_at = Instant::now();

        let (mut ws_stream, _response) = tokio::time::timeout(budget, connect_async(&url))
            .await
            .map_err(|_| {
                tracing::warn!(url = %url, timeout_ms = budget.as_millis() as u64, "WebSocket handshake timed out");
                StreamError::Timeout(budget)
            })?
            .map_err(|e| StreamError::Transport(format!("Failed to connect to {url}: {e}")))?;

        tracing::debug!(
            client_id = %self.options.client_id,
            end_node = %request.end_node_id,
            "Connected to ComfyUI event stream",
        );

        let submitted = tokio::time::timeout(
            budget.saturating_sub(opened_at.elapsed()),
            self.api
                .submit_workflow(request.workflow, &self.options.client_id),
        )
        .await
        .map_err(|_| StreamError::Timeout(budget))?
        .map_err(|e| StreamError::Submission(e.to_string()))?;

        let node_errors = submitted
            .has_node_errors()
            .then(|| submitted.node_errors.to_string());
        let queue_number = submitted.number;
        let prompt_id = submitted
            .prompt_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| match &node_errors {
                Some(errors) => StreamError::Submission(format!("Engine rejected nodes: {errors}")),
                None => StreamError::Submission("Response carried no prompt_id".into()),
            })?;

        if let Some(errors) = &node_errors {
            tracing::warn!(prompt_id = %prompt_id, node_errors = %errors, "ComfyUI reported node errors");
        }

        tracing::info!(
            client_id = %self.options.client_id,
            prompt_id = %prompt_id,
            queue_number = ?queue_number,
            "Workflow submitted to ComfyUI",
        );

        let consumed = self
            .consume(&mut ws_stream, request.end_node_id, opened_at)
            .await;

        if let Err(e) = ws_stream.close(None).await {
            tracing::trace!(error = %e, "WebSocket close after settlement failed");
        }

        if matches!(consumed, Err(StreamError::Cancelled)) {
            if let Err(e) = self.api.cancel_execution(&prompt_id).await {
                tracing::warn!(prompt_id = %prompt_id, error = %e, "Failed to remove cancelled prompt");
            }
            if let Err(e) = self.api.interrupt(&prompt_id).await {
                tracing::warn!(prompt_id = %prompt_id, error = %e, "Failed to interrupt cancelled prompt");
            }
        }

        consumed.map(|executed| ExecutionOutcome {
            prompt_id,
            executed,
        })
    }

    /// Read frames until the end node completes, an error arrives, the
    /// watchdog elapses, or the cancellation token fires.
    async fn consume<S>(
        &mut self,
        stream: &mut S,
        end_node_id: &str,
        opened_at: Instant,
    ) -> Result<ExecutedData, StreamError>
    where
        S: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        let mut watchdog = tokio::time::interval(self.watchdog_tick);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Err(StreamError::Cancelled),

                _ = watchdog.tick() => {
                    if opened_at.elapsed() >= self.options.timeout {
                        tracing::warn!(
                            client_id = %self.options.client_id,
                            timeout_ms = self.options.timeout.as_millis() as u64,
                            "Execution watchdog elapsed",
                        );
                        return Err(StreamError::Timeout(self.options.timeout));
                    }
                }

                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(done) = self.dispatch(&text, end_node_id)? {
                            return Ok(done);
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        // Preview images; not part of the result.
                        tracing::trace!(client_id = %self.options.client_id, "Ignoring binary frame");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                            .unwrap_or_else(|| "no close frame".to_string());
                        return Err(StreamError::UnexpectedClose(reason));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(StreamError::Transport(e.to_string())),
                    None => return Err(StreamError::UnexpectedClose("stream ended".into())),
                },
            }
        }
    }

    /// Handle one text frame. `Ok(Some(_))` settles the execution.
    fn dispatch(
        &mut self,
        text: &str,
        end_node_id: &str,
    ) -> Result<Option<ExecutedData>, StreamError> {
        let message = match parse_message(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, raw_message = %text, "Skipping unrecognised ComfyUI message");
                return Ok(None);
            }
        };

        match message {
            ComfyUIMessage::Progress(data) => self.emit(ExecutionEvent::Progress(data)),
            ComfyUIMessage::ExecutionCached(data) => self.emit(ExecutionEvent::Cached(data)),
            ComfyUIMessage::Executing(data) => self.emit(ExecutionEvent::Executing(data)),
            ComfyUIMessage::Executed(data) => {
                if data.node == end_node_id {
                    return Ok(Some(data));
                }
                tracing::debug!(
                    node = %data.node,
                    end_node = %end_node_id,
                    "Intermediate node executed",
                );
                self.emit(ExecutionEvent::Executed(data));
            }
            ComfyUIMessage::ExecutionError(data) | ComfyUIMessage::Error(data) => {
                return Err(StreamError::Execution {
                    message: data.describe(),
                    node_id: data.node_id,
                });
            }
            ComfyUIMessage::ExecutionInterrupted(data) => {
                return Err(StreamError::Execution {
                    message: "Execution interrupted".into(),
                    node_id: data.node_id,
                });
            }
            ComfyUIMessage::Status(data) => {
                tracing::trace!(
                    queue_remaining = data.status.exec_info.queue_remaining,
                    sid = ?data.sid,
                    "ComfyUI queue status",
                );
            }
            ComfyUIMessage::ExecutionStart(_) | ComfyUIMessage::ExecutionSuccess(_) => {}
        }
        Ok(None)
    }

    fn emit(&mut self, event: ExecutionEvent) {
        if self.state == SessionState::Closed {
            return;
        }
        self.listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Failure taxonomy of an execution attempt.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("ComfyUI host is required")]
    MissingHost,

    #[error("Client id is required")]
    MissingClientId,

    /// `POST /prompt` failed or returned no prompt id.
    #[error("Workflow submission failed: {0}")]
    Submission(String),

    #[error("Execution timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The engine reported a node failure.
    #[error("Execution error: {message}")]
    Execution {
        message: String,
        node_id: Option<String>,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed unexpectedly: {0}")]
    UnexpectedClose(String),

    #[error("Client is already closed")]
    AlreadyClosed,

    #[error("Execution cancelled")]
    Cancelled,
}

impl StreamError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            StreamError::MissingHost => "MISSING_HOST",
            StreamError::MissingClientId => "MISSING_CLIENT_ID",
            StreamError::Submission(_) => "SUBMISSION_FAILED",
            StreamError::Timeout(_) => "TIMEOUT",
            StreamError::Execution { .. } => "EXECUTION_ERROR",
            StreamError::Transport(_) => "TRANSPORT_ERROR",
            StreamError::UnexpectedClose(_) => "UNEXPECTED_CLOSE",
            StreamError::AlreadyClosed => "ALREADY_CLOSED",
            StreamError::Cancelled => "CANCELLED",
        }
    }
}
