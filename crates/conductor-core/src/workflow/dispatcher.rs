//! StepDispatcher: sends one step to its worker.
//!
//! Local workers are in-process [`LocalWorker`] handlers registered by name
//! (or shell commands, see [`super::local::CommandWorker`]). Remote workers
//! receive the context packet as a JSON `POST` to their endpoint.
//!
//! Every attempt runs under its own timeout. Failures are classified as
//! transient (retried with exponential backoff) or permanent.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::local::CommandWorker;
use super::needs::Need;
use super::schema::{Step, StepSummary};
use super::worker::{WorkerCard, WorkerCatalog, WorkerTransport};
use crate::audit::{AuditLevel, AuditLog, Direction};

const COMPONENT: &str = "step_dispatcher";

/// What went wrong with a dispatch attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Timeout,
    Connection,
    HttpStatus,
    UnknownWorker,
    NoHandler,
    InvalidResponse,
    WorkerError,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Connection => "connection",
            TransportErrorKind::HttpStatus => "http_status",
            TransportErrorKind::UnknownWorker => "unknown_worker",
            TransportErrorKind::NoHandler => "no_handler",
            TransportErrorKind::InvalidResponse => "invalid_response",
            TransportErrorKind::WorkerError => "worker_error",
        };
        write!(f, "{}", s)
    }
}

/// Classified dispatch failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("transient {kind} error: {message}")]
    Transient {
        kind: TransportErrorKind,
        message: String,
    },
    #[error("permanent {kind} error: {message}")]
    Permanent {
        kind: TransportErrorKind,
        message: String,
    },
}

impl TransportError {
    pub fn transient(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        TransportError::Transient {
            kind,
            message: message.into(),
        }
    }

    pub fn permanent(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        TransportError::Permanent {
            kind,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient { .. })
    }

    pub fn kind(&self) -> TransportErrorKind {
        match self {
            TransportError::Transient { kind, .. } | TransportError::Permanent { kind, .. } => {
                *kind
            }
        }
    }

    pub fn message(&self) -> &str {
        match self {
            TransportError::Transient { message, .. }
            | TransportError::Permanent { message, .. } => message,
        }
    }
}

/// Output of an earlier step, in completion order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriorResult {
    pub step_id: u64,
    pub worker: String,
    pub goal: String,
    pub output: String,
}

/// Everything a worker is told about the step it runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextPacket {
    pub workflow_id: String,
    pub coordinator: String,
    pub step: StepSummary,
    /// 1-based position of this step among executed steps
    pub step_position: usize,
    /// Executed plus queued steps, including this one
    pub total_steps_hint: usize,
    pub user_request: String,
    #[serde(default)]
    pub conversation_history: String,
    pub prior_results: Vec<PriorResult>,
    pub open_needs: Vec<Need>,
    pub remaining_steps: Vec<StepSummary>,
    pub worker_catalog: Vec<WorkerCard>,
    pub capability_policy: BTreeMap<String, String>,
}

impl ContextPacket {
    /// Plain-text rendering for workers that take a prompt.
    pub fn render_prompt(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "You are {} working on step {} of about {} in workflow {}.\n\n",
            self.step.worker, self.step_position, self.total_steps_hint, self.workflow_id
        ));
        out.push_str(&format!("## User request\n{}\n\n", self.user_request));
        if !self.conversation_history.trim().is_empty() {
            out.push_str(&format!(
                "## Conversation history\n{}\n\n",
                self.conversation_history.trim()
            ));
        }
        out.push_str(&format!("## Goal\n{}\n\n", self.step.goal));
        if !self.step.deliverable.is_empty() {
            out.push_str(&format!("## Deliverable\n{}\n\n", self.step.deliverable));
        }
        if !self.step.tool_hints.is_empty() {
            out.push_str(&format!(
                "## Tool hints\n{}\n\n",
                self.step.tool_hints.join(", ")
            ));
        }

        out.push_str("## Prior results\n");
        if self.prior_results.is_empty() {
            out.push_str("(none)\n");
        }
        for prior in &self.prior_results {
            out.push_str(&format!(
                "[Step {}] {}: {}\n{}\n",
                prior.step_id, prior.worker, prior.goal, prior.output
            ));
        }

        out.push_str("\n## Open needs\n");
        if self.open_needs.is_empty() {
            out.push_str("(none)\n");
        }
        for need in &self.open_needs {
            out.push_str(&format!("- [{}] {}\n", need.target_worker, need.request_text));
        }

        out.push_str("\n## Remaining steps\n");
        if self.remaining_steps.is_empty() {
            out.push_str("(none)\n");
        }
        for step in &self.remaining_steps {
            out.push_str(&format!("- {}: {}\n", step.worker, step.goal));
        }

        out.push_str("\n## Workers\n");
        for card in &self.worker_catalog {
            out.push_str(&format!(
                "- {}: capabilities [{}], tools [{}]\n",
                card.name,
                card.capabilities.join(", "),
                card.tools.join(", ")
            ));
        }

        if !self.capability_policy.is_empty() {
            out.push_str("\n## Capability owners\n");
            for (capability, owner) in &self.capability_policy {
                out.push_str(&format!("- {} -> {}\n", capability, owner));
            }
        }

        out.push_str(&format!(
            "\nEnd your answer with `Additional Needs:` followed by `none` or bullet lines \
             `- [TargetName] request`. Ask {} for anything you cannot do yourself.\n",
            self.coordinator
        ));
        out
    }
}

/// An in-process worker.
#[async_trait]
pub trait LocalWorker: Send + Sync {
    async fn handle(&self, packet: &ContextPacket) -> Result<String, TransportError>;
}

/// Adapts a synchronous closure into a [`LocalWorker`].
pub struct FnWorker<F>(F);

impl<F> FnWorker<F>
where
    F: Fn(&ContextPacket) -> Result<String, TransportError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> LocalWorker for FnWorker<F>
where
    F: Fn(&ContextPacket) -> Result<String, TransportError> + Send + Sync,
{
    async fn handle(&self, packet: &ContextPacket) -> Result<String, TransportError> {
        (self.0)(packet)
    }
}

/// Exponential backoff with a ceiling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 500,
            max_delay_ms: 8_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt + 1` (0-based).
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let ms = if base.is_finite() && base >= 0.0 {
            (base as u64).min(self.max_delay_ms)
        } else {
            self.max_delay_ms
        };
        Duration::from_millis(ms)
    }
}

/// Dispatch settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }
}

/// Outcome of a dispatch including retries.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub result: Result<String, TransportError>,
    pub attempts: u32,
}

/// Remote request body: the context packet plus a rendered prompt.
#[derive(Serialize)]
struct RemoteStepRequest<'a> {
    prompt: String,
    #[serde(flatten)]
    packet: &'a ContextPacket,
}

/// Routes steps to local handlers or remote endpoints.
pub struct StepDispatcher {
    catalog: Arc<WorkerCatalog>,
    locals: HashMap<String, Arc<dyn LocalWorker>>,
    client: reqwest::Client,
    config: DispatchConfig,
    audit: Option<AuditLog>,
}

impl StepDispatcher {
    /// Workers declared as local commands get a [`CommandWorker`] automatically.
    pub fn new(catalog: Arc<WorkerCatalog>, config: DispatchConfig) -> Self {
        let mut locals: HashMap<String, Arc<dyn LocalWorker>> = HashMap::new();
        for worker in catalog.descriptors() {
            if let WorkerTransport::Local {
                command: Some(command),
            } = &worker.transport
            {
                locals.insert(
                    worker.name.to_lowercase(),
                    Arc::new(CommandWorker::new(command.clone())),
                );
            }
        }

        Self {
            catalog,
            locals,
            client: reqwest::Client::builder()
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            config,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Register (or replace) the in-process handler for a local worker.
    pub fn register_local(&mut self, name: &str, worker: Arc<dyn LocalWorker>) {
        self.locals.insert(name.trim().to_lowercase(), worker);
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// One attempt, bounded by the per-dispatch timeout.
    pub async fn dispatch(
        &self,
        step: &Step,
        packet: &ContextPacket,
    ) -> Result<String, TransportError> {
        let Some(worker) = self.catalog.get(&step.assigned_worker) else {
            return Err(TransportError::permanent(
                TransportErrorKind::UnknownWorker,
                format!("worker '{}' is not in the catalog", step.assigned_worker),
            ));
        };

        let attempt = async {
            match &worker.transport {
                WorkerTransport::Local { .. } => {
                    let Some(handler) = self.locals.get(&worker.name.to_lowercase()) else {
                        return Err(TransportError::permanent(
                            TransportErrorKind::NoHandler,
                            format!("no local handler registered for '{}'", worker.name),
                        ));
                    };
                    handler.handle(packet).await
                }
                WorkerTransport::Remote { endpoint } => self.post_remote(endpoint, packet).await,
            }
        };

        match tokio::time::timeout(self.config.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::transient(
                TransportErrorKind::Timeout,
                format!(
                    "worker '{}' did not answer within {:?}",
                    worker.name, self.config.timeout
                ),
            )),
        }
    }

    /// Dispatch with the retry policy applied to transient failures.
    pub async fn dispatch_with_retry(&self, step: &Step, packet: &ContextPacket) -> DispatchReport {
        let policy = &self.config.retry;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let error = match self.dispatch(step, packet).await {
                Ok(output) => {
                    return DispatchReport {
                        result: Ok(output),
                        attempts: attempt,
                    }
                }
                Err(e) => e,
            };

            let exhausted = attempt > policy.max_retries;
            if let Some(audit) = &self.audit {
                audit
                    .record_safe(
                        AuditLevel::Warn,
                        COMPONENT,
                        "dispatch_attempt_failed",
                        Direction::Inbound,
                        json!({
                            "workflow_id": packet.workflow_id,
                            "step_id": step.id,
                            "worker": step.assigned_worker,
                            "attempt": attempt,
                            "transient": error.is_transient(),
                            "kind": error.kind(),
                            "error": error.message(),
                        }),
                    )
                    .await;
            }

            if !error.is_transient() || exhausted {
                return DispatchReport {
                    result: Err(error),
                    attempts: attempt,
                };
            }

            let delay = policy.compute_delay(attempt - 1);
            tracing::warn!(
                "[StepDispatcher] Step {} on {} failed (attempt {}/{}), retrying in {:?}: {}",
                step.id,
                step.assigned_worker,
                attempt,
                policy.max_retries + 1,
                delay,
                error
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    async fn post_remote(
        &self,
        endpoint: &str,
        packet: &ContextPacket,
    ) -> Result<String, TransportError> {
        tracing::info!("[StepDispatcher] POST {} (step {})", endpoint, packet.step.id);

        let body = RemoteStepRequest {
            prompt: packet.render_prompt(),
            packet,
        };
        let response = self
            .client
            .post(endpoint)
            .json(&body)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            TransportError::transient(
                TransportErrorKind::Connection,
                format!("Failed to read response body: {}", e),
            )
        })?;

        if !status.is_success() {
            let message = format!("worker returned {}: {}", status, truncate(&text, 500));
            let code = status.as_u16();
            return Err(if code == 408 || code == 429 || status.is_server_error() {
                TransportError::transient(TransportErrorKind::HttpStatus, message)
            } else {
                TransportError::permanent(TransportErrorKind::HttpStatus, message)
            });
        }

        extract_output(&text)
    }
}

fn classify_request_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::transient(TransportErrorKind::Timeout, e.to_string())
    } else if e.is_builder() {
        TransportError::permanent(TransportErrorKind::Connection, e.to_string())
    } else {
        TransportError::transient(
            TransportErrorKind::Connection,
            format!("HTTP request failed: {}", e),
        )
    }
}

/// Response text from `output`/`text`/`content`/`response`, else the raw body.
fn extract_output(body: &str) -> Result<String, TransportError> {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(body) {
        for field in ["output", "text", "content", "response"] {
            if let Some(s) = map.get(field).and_then(|v| v.as_str()) {
                return Ok(s.to_string());
            }
        }
        if let Some(error) = map.get("error").and_then(|v| v.as_str()) {
            return Err(TransportError::permanent(
                TransportErrorKind::WorkerError,
                error.to_string(),
            ));
        }
    }
    if body.trim().is_empty() {
        return Err(TransportError::permanent(
            TransportErrorKind::InvalidResponse,
            "worker returned an empty body",
        ));
    }
    Ok(body.to_string())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::schema::{PlannedStep, StepOrigin};
    use crate::workflow::worker::WorkerDescriptor;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn packet_for(step: &Step) -> ContextPacket {
        ContextPacket {
            workflow_id: "wf-1".to_string(),
            coordinator: "MainAgent".to_string(),
            step: step.summary(),
            step_position: 1,
            total_steps_hint: 1,
            user_request: "find AI trends".to_string(),
            conversation_history: String::new(),
            prior_results: Vec::new(),
            open_needs: Vec::new(),
            remaining_steps: Vec::new(),
            worker_catalog: Vec::new(),
            capability_policy: BTreeMap::new(),
        }
    }

    fn step_for(worker: &str) -> Step {
        Step::from_planned(1, &PlannedStep::new(worker, "do it"), StepOrigin::Plan)
    }

    fn fast_config(max_retries: u32) -> DispatchConfig {
        DispatchConfig {
            timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                max_retries,
                initial_delay_ms: 0,
                max_delay_ms: 0,
                backoff_multiplier: 2.0,
            },
        }
    }

    /// Serve one canned HTTP response per connection.
    async fn spawn_http(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    let n = socket.read(&mut chunk).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    let text = String::from_utf8_lossy(&buf).to_string();
                    if let Some(header_end) = text.find("\r\n\r\n") {
                        let content_length = text[..header_end]
                            .lines()
                            .find_map(|l| {
                                let lower = l.to_ascii_lowercase();
                                lower
                                    .strip_prefix("content-length:")
                                    .and_then(|v| v.trim().parse::<usize>().ok())
                            })
                            .unwrap_or(0);
                        if buf.len() >= header_end + 4 + content_length {
                            break;
                        }
                    }
                }
                let response = format!(
                    "{}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status_line,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{}/step", addr)
    }

    #[test]
    fn test_compute_delay_respects_ceiling() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.compute_delay(0), Duration::from_millis(500));
        assert_eq!(policy.compute_delay(1), Duration::from_millis(1000));
        assert_eq!(policy.compute_delay(10), Duration::from_millis(8000));
    }

    #[tokio::test]
    async fn test_local_dispatch() {
        let catalog = Arc::new(WorkerCatalog::from_descriptors([WorkerDescriptor::local(
            "Worker_SNS",
        )]));
        let mut dispatcher = StepDispatcher::new(catalog, fast_config(0));
        dispatcher.register_local(
            "worker_sns",
            Arc::new(FnWorker::new(|p| Ok(format!("done: {}", p.step.goal)))),
        );
        let step = step_for("Worker_SNS");
        let out = dispatcher.dispatch(&step, &packet_for(&step)).await.unwrap();
        assert_eq!(out, "done: do it");
    }

    #[tokio::test]
    async fn test_unknown_worker_is_permanent_without_retry() {
        let dispatcher = StepDispatcher::new(Arc::new(WorkerCatalog::new()), fast_config(3));
        let step = step_for("Worker_Ghost");
        let report = dispatcher.dispatch_with_retry(&step, &packet_for(&step)).await;
        assert_eq!(report.attempts, 1);
        let err = report.result.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(err.kind(), TransportErrorKind::UnknownWorker);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let catalog = Arc::new(WorkerCatalog::from_descriptors([WorkerDescriptor::local("W")]));
        let mut dispatcher = StepDispatcher::new(catalog, fast_config(2));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        dispatcher.register_local(
            "W",
            Arc::new(FnWorker::new(move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TransportError::transient(TransportErrorKind::Connection, "refused"))
                } else {
                    Ok("third time".to_string())
                }
            })),
        );
        let step = step_for("W");
        let report = dispatcher.dispatch_with_retry(&step, &packet_for(&step)).await;
        assert_eq!(report.result.unwrap(), "third time");
        assert_eq!(report.attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let catalog = Arc::new(WorkerCatalog::from_descriptors([WorkerDescriptor::local("W")]));
        let mut dispatcher = StepDispatcher::new(catalog, fast_config(1));
        dispatcher.register_local(
            "W",
            Arc::new(FnWorker::new(|_| {
                Err(TransportError::transient(TransportErrorKind::Connection, "down"))
            })),
        );
        let step = step_for("W");
        let report = dispatcher.dispatch_with_retry(&step, &packet_for(&step)).await;
        assert_eq!(report.attempts, 2);
        assert!(report.result.is_err());
    }

    struct SlowWorker;

    #[async_trait]
    impl LocalWorker for SlowWorker {
        async fn handle(&self, _packet: &ContextPacket) -> Result<String, TransportError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".to_string())
        }
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let catalog = Arc::new(WorkerCatalog::from_descriptors([WorkerDescriptor::local("W")]));
        let mut config = fast_config(0);
        config.timeout = Duration::from_millis(20);
        let mut dispatcher = StepDispatcher::new(catalog, config);
        dispatcher.register_local("W", Arc::new(SlowWorker));
        let step = step_for("W");
        let err = dispatcher.dispatch(&step, &packet_for(&step)).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.kind(), TransportErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_local_without_handler_is_permanent() {
        let catalog = Arc::new(WorkerCatalog::from_descriptors([WorkerDescriptor::local("W")]));
        let dispatcher = StepDispatcher::new(catalog, fast_config(0));
        let step = step_for("W");
        let err = dispatcher.dispatch(&step, &packet_for(&step)).await.unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::NoHandler);
    }

    #[tokio::test]
    async fn test_remote_dispatch_extracts_output() {
        let endpoint = spawn_http("HTTP/1.1 200 OK", r#"{"output":"remote answer"}"#).await;
        let catalog = Arc::new(WorkerCatalog::from_descriptors([WorkerDescriptor::remote(
            "Worker_Web",
            endpoint,
        )]));
        let dispatcher = StepDispatcher::new(catalog, fast_config(0));
        let step = step_for("Worker_Web");
        let out = dispatcher.dispatch(&step, &packet_for(&step)).await.unwrap();
        assert_eq!(out, "remote answer");
    }

    #[tokio::test]
    async fn test_remote_status_classification() {
        let unavailable = spawn_http("HTTP/1.1 503 Service Unavailable", r#"{"error":"busy"}"#).await;
        let not_found = spawn_http("HTTP/1.1 404 Not Found", "{}").await;
        let catalog = Arc::new(WorkerCatalog::from_descriptors([
            WorkerDescriptor::remote("Busy", unavailable),
            WorkerDescriptor::remote("Missing", not_found),
        ]));
        let dispatcher = StepDispatcher::new(catalog, fast_config(0));

        let step = step_for("Busy");
        let err = dispatcher.dispatch(&step, &packet_for(&step)).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.kind(), TransportErrorKind::HttpStatus);

        let step = step_for("Missing");
        let err = dispatcher.dispatch(&step, &packet_for(&step)).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_remote_connection_refused_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let catalog = Arc::new(WorkerCatalog::from_descriptors([WorkerDescriptor::remote(
            "Gone",
            format!("http://{}/step", addr),
        )]));
        let dispatcher = StepDispatcher::new(catalog, fast_config(0));
        let step = step_for("Gone");
        let err = dispatcher.dispatch(&step, &packet_for(&step)).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_extract_output_fallbacks() {
        assert_eq!(extract_output(r#"{"text":"a"}"#).unwrap(), "a");
        assert_eq!(extract_output("plain text").unwrap(), "plain text");
        assert!(extract_output(r#"{"error":"boom"}"#).is_err());
        assert!(extract_output("  ").is_err());
    }

    #[test]
    fn test_render_prompt_mentions_needs_format() {
        let step = step_for("Worker_SNS");
        let prompt = packet_for(&step).render_prompt();
        assert!(prompt.contains("## Goal\ndo it"));
        assert!(prompt.contains("Additional Needs:"));
        assert!(prompt.contains("Ask MainAgent"));
    }
}
