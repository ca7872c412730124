//! Script gateway: evaluates auditing scripts in fresh V8 isolates.
//!
//! Each evaluation gets a brand new runtime on its own thread. No state leaks
//! between evaluations.
//!
//! V8 isolates are `!Send`, so the runtime lives on a dedicated OS thread and
//! the result comes back over a oneshot channel. Every host op is synchronous
//! and the event loop is never polled, so the evaluation thread needs no
//! async runtime of its own and blocking `Input` reads simply park it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use deno_core::{v8, JsRuntime, RuntimeOptions};
use tokio::sync::Semaphore;

use crate::allowlist::HostAllowList;
use crate::audit::{
    AuditEntryBuilder, AuditLogger, AuditingTransport, EvaluationMode, NoopAuditLogger,
};
use crate::bootstrap::{build_bootstrap, wrap_script, BOOTSTRAP_NAME, SCRIPT_NAME};
use crate::context::ExecutionContext;
use crate::error::EvaluationError;
use crate::http::{HttpClient, ReqwestTransport, DEFAULT_MAX_HTTP_CALLS};
use crate::ipfs::Ipfs;
use crate::ops::{vigil_ext, ContractViolation, SettledValue};
use crate::script::{AuditResult, ScriptSource};
use crate::termination::{Termination, TerminationReason, WaitClock};
use crate::validator::{validate_script, DEFAULT_MAX_SCRIPT_SIZE};
use crate::{HttpTransport, IpfsFetcher};

/// Shortest watchdog sleep while a prompt is outstanding.
const MIN_WATCHDOG_NAP: Duration = Duration::from_millis(10);

/// Limits applied to every evaluation.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Execution budget for one evaluation. Time spent waiting for an
    /// `Input` answer is not charged.
    pub timeout: Duration,
    /// Maximum script size in bytes.
    pub max_script_size: usize,
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Maximum non-interactive evaluations running at once.
    pub max_concurrent: usize,
    /// Maximum interactive evaluations running at once. Kept apart from
    /// `max_concurrent` so idle sessions cannot starve one-shot audits.
    pub max_sessions: usize,
    /// `HttpClient` calls allowed per evaluation.
    pub max_http_calls: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_script_size: DEFAULT_MAX_SCRIPT_SIZE,
            max_heap_size: 64 * 1024 * 1024, // 64 MB
            max_concurrent: 8,
            max_sessions: 32,
            max_http_calls: DEFAULT_MAX_HTTP_CALLS,
        }
    }
}

/// Per-evaluation inputs beyond the script and its context.
#[derive(Debug, Clone, Default)]
pub struct EvaluationOptions {
    /// Value passed as `audit`'s argument. `None` passes `undefined`.
    pub payload: Option<serde_json::Value>,
    /// IPFS directory the script's `Ipfs` capability reads from.
    pub ipfs_directory: Option<String>,
    /// Overrides [`GatewayConfig::timeout`].
    pub timeout: Option<Duration>,
    /// Handle the caller uses to stop the evaluation early.
    pub termination: Option<Termination>,
}

/// Runs auditing scripts and maps what they return to an [`AuditResult`].
pub struct ScriptGateway {
    config: GatewayConfig,
    semaphore: Arc<Semaphore>,
    session_semaphore: Arc<Semaphore>,
    http: Arc<dyn HttpTransport>,
    ipfs_fetcher: Option<Arc<dyn IpfsFetcher>>,
    properties: Arc<BTreeMap<String, String>>,
    audit_logger: Arc<dyn AuditLogger>,
}

impl ScriptGateway {
    /// A gateway with the default reqwest transport, no IPFS fetcher and no
    /// properties.
    pub fn new(config: GatewayConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        let session_semaphore = Arc::new(Semaphore::new(config.max_sessions));
        Self {
            config,
            semaphore,
            session_semaphore,
            http: Arc::new(ReqwestTransport::new(
                Duration::from_secs(30),
                concat!("vigil/", env!("CARGO_PKG_VERSION")),
            )),
            ipfs_fetcher: None,
            properties: Arc::new(BTreeMap::new()),
            audit_logger: Arc::new(NoopAuditLogger),
        }
    }

    /// Use `transport` for every `HttpClient` call.
    pub fn with_http_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.http = transport;
        self
    }

    /// Use `fetcher` for directory-based `Ipfs` capabilities.
    pub fn with_ipfs_fetcher(mut self, fetcher: Arc<dyn IpfsFetcher>) -> Self {
        self.ipfs_fetcher = Some(fetcher);
        self
    }

    /// Expose `properties` to scripts as the frozen `Properties` global.
    pub fn with_properties(mut self, properties: BTreeMap<String, String>) -> Self {
        self.properties = Arc::new(properties);
        self
    }

    /// Send an audit entry for every evaluation to `logger`.
    pub fn with_audit_logger(mut self, logger: Arc<dyn AuditLogger>) -> Self {
        self.audit_logger = logger;
        self
    }

    /// The limits in force.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// The properties handed to scripts.
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Evaluate `source` with no payload.
    pub async fn evaluate(
        &self,
        source: &ScriptSource,
        context: &ExecutionContext,
    ) -> Result<AuditResult, EvaluationError> {
        self.evaluate_with_options(source, context, EvaluationOptions::default())
            .await
    }

    /// Evaluate `source`: validate it, run `audit(payload)` in a fresh
    /// isolate, and map the returned value.
    pub async fn evaluate_with_options(
        &self,
        source: &ScriptSource,
        context: &ExecutionContext,
        options: EvaluationOptions,
    ) -> Result<AuditResult, EvaluationError> {
        let mode = if context.is_interactive() {
            EvaluationMode::Interactive
        } else {
            EvaluationMode::Batch
        };
        let mut audit_builder = AuditEntryBuilder::new(source.as_str(), mode);
        tracing::info!(
            evaluation_id = %audit_builder.evaluation_id(),
            source_len = source.len(),
            mode = ?mode,
            "evaluate: starting"
        );

        let result = self
            .run(source, context, options, &mut audit_builder)
            .await;

        let entry = audit_builder.finish(&result);
        self.audit_logger.log(&entry).await;

        match &result {
            Ok(audit_result) => tracing::info!(
                evaluation_id = %entry.evaluation_id,
                result = audit_result.label(),
                "evaluate: complete"
            ),
            Err(e) => tracing::warn!(
                evaluation_id = %entry.evaluation_id,
                code = e.code(),
                error = %e,
                "evaluate: failed"
            ),
        }

        result
    }

    async fn run(
        &self,
        source: &ScriptSource,
        context: &ExecutionContext,
        options: EvaluationOptions,
        audit_builder: &mut AuditEntryBuilder,
    ) -> Result<AuditResult, EvaluationError> {
        validate_script(source.as_str(), Some(self.config.max_script_size))?;

        let (pool, max) = if context.is_interactive() {
            (&self.session_semaphore, self.config.max_sessions)
        } else {
            (&self.semaphore, self.config.max_concurrent)
        };
        let _permit = pool
            .clone()
            .try_acquire_owned()
            .map_err(|_| EvaluationError::ConcurrencyLimit { max })?;

        let (audit_tx, mut audit_rx) = tokio::sync::mpsc::unbounded_channel();
        let transport: Arc<dyn HttpTransport> =
            Arc::new(AuditingTransport::new(self.http.clone(), audit_tx));

        let job = Evaluation {
            source: source.clone(),
            context: context.clone(),
            payload: options.payload,
            properties: self.properties.clone(),
            http: HttpClient::new(transport, self.config.max_http_calls),
            ipfs: Ipfs::select(self.ipfs_fetcher.clone(), options.ipfs_directory.as_deref()),
            timeout: options.timeout.unwrap_or(self.config.timeout),
            max_heap_size: self.config.max_heap_size,
            termination: options.termination.unwrap_or_default(),
        };

        let (tx, rx) = tokio::sync::oneshot::channel();
        std::thread::Builder::new()
            .name("vigil-eval".into())
            .spawn(move || {
                let result = run_evaluation(job);
                if tx.send(result).is_err() {
                    tracing::warn!("evaluation result receiver dropped before result was sent");
                }
            })
            .map_err(|e| EvaluationError::Execution(e.into()))?;

        let result = match rx.await {
            Ok(result) => result,
            Err(_) => Err(EvaluationError::Execution(anyhow::anyhow!(
                "evaluation thread panicked"
            ))),
        };

        while let Ok(call) = audit_rx.try_recv() {
            audit_builder.record_http_call(call);
        }

        result
    }
}

/// Everything the evaluation thread needs.
struct Evaluation {
    source: ScriptSource,
    context: ExecutionContext,
    payload: Option<serde_json::Value>,
    properties: Arc<BTreeMap<String, String>>,
    http: HttpClient,
    ipfs: Ipfs,
    timeout: Duration,
    max_heap_size: usize,
    termination: Termination,
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// V8 near-heap-limit callback. Terminates execution and grants 1MB grace
/// for the termination to propagate.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the `HeapLimitState` boxed in `run_script`,
    // which removes this callback before the box is dropped.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// Create a fresh runtime with the vigil extension loaded and V8 heap limits
/// set.
fn create_runtime(max_heap_size: usize) -> JsRuntime {
    let create_params = v8::CreateParams::default().heap_limits(0, max_heap_size);
    JsRuntime::new(RuntimeOptions {
        extensions: vec![vigil_ext::init()],
        create_params: Some(create_params),
        ..Default::default()
    })
}

/// Run one evaluation on the current thread.
fn run_evaluation(job: Evaluation) -> Result<AuditResult, EvaluationError> {
    let bootstrap = build_bootstrap(
        HostAllowList::global(),
        &job.properties,
        job.payload.as_ref(),
    )?;

    let wait_clock = WaitClock::new();
    let mut runtime = create_runtime(job.max_heap_size);
    {
        let op_state = runtime.op_state();
        let mut state = op_state.borrow_mut();
        state.put(job.http);
        state.put(job.ipfs);
        state.put(job.context);
        state.put(job.termination.clone());
        state.put(wait_clock.clone());
        state.put(ContractViolation::default());
    }

    runtime
        .execute_script(BOOTSTRAP_NAME, bootstrap)
        .map_err(|e| EvaluationError::Execution(anyhow::anyhow!("bootstrap failed: {e}")))?;

    run_script(&mut runtime, &job.source, job.timeout, &job.termination, &wait_clock)
}

/// Execute the wrapped script under the watchdog and heap guard, then work
/// out what happened.
///
/// Causes are checked in a fixed order: an external termination, the heap
/// guard, the watchdog, a capability contract violation, an engine error,
/// and finally the settled return value.
fn run_script(
    runtime: &mut JsRuntime,
    source: &ScriptSource,
    timeout: Duration,
    termination: &Termination,
    wait_clock: &WaitClock,
) -> Result<AuditResult, EvaluationError> {
    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );

    let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
    let timed_out = Arc::new(AtomicBool::new(false));
    let watchdog_timed_out = timed_out.clone();
    let clock = wait_clock.clone();
    let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();
    let watchdog = std::thread::spawn(move || {
        let started = Instant::now();
        loop {
            let nap = timeout
                .saturating_sub(clock.charged(started))
                .max(MIN_WATCHDOG_NAP);
            match cancel_rx.recv_timeout(nap) {
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    if clock.expire(started, timeout) {
                        watchdog_timed_out.store(true, Ordering::SeqCst);
                        watchdog_handle.terminate_execution();
                        return;
                    }
                }
                _ => return,
            }
        }
    });

    termination.attach(runtime.v8_isolate().thread_safe_handle());
    let exec_error = runtime
        .execute_script(SCRIPT_NAME, wrap_script(source.as_str()))
        .err()
        .map(|e| e.to_string());
    termination.detach();

    // The watchdog must be gone before the runtime is dropped.
    let _ = cancel_tx.send(());
    let _ = watchdog.join();
    runtime
        .v8_isolate()
        .remove_near_heap_limit_callback(near_heap_limit_callback, 0);

    if let Some(reason) = termination.reason() {
        return Err(match reason {
            TerminationReason::Disconnected => EvaluationError::Cancelled,
            TerminationReason::PromptTimeout(limit) => EvaluationError::PromptTimeout {
                timeout_ms: limit.as_millis() as u64,
            },
        });
    }

    if heap_state.triggered.load(Ordering::SeqCst) {
        return Err(EvaluationError::HeapLimitExceeded);
    }

    if timed_out.load(Ordering::SeqCst) {
        return Err(EvaluationError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        });
    }

    let op_state = runtime.op_state();
    let mut state = op_state.borrow_mut();

    if let Some(violation) = state.try_take::<ContractViolation>().and_then(|v| v.0) {
        return Err(EvaluationError::InvalidInputValue(violation));
    }

    if let Some(cause) = exec_error {
        return Err(EvaluationError::ScriptExecution {
            script: source.as_str().to_string(),
            cause,
        });
    }

    let settled = state.try_take::<SettledValue>().ok_or_else(|| {
        EvaluationError::Execution(anyhow::anyhow!("script finished without settling a result"))
    })?;
    settled_result(settled)
}

/// Map the settled report to the evaluation outcome.
fn settled_result(settled: SettledValue) -> Result<AuditResult, EvaluationError> {
    match settled.kind.as_str() {
        "Successful" => Ok(AuditResult::Successful),
        "Failed" => Ok(AuditResult::Failed {
            message: settled.detail,
        }),
        "Aborted" => Ok(AuditResult::Aborted {
            message: settled.detail,
        }),
        "invalid" => Err(EvaluationError::InvalidReturnValue {
            actual_type: settled.detail,
        }),
        other => Err(EvaluationError::Execution(anyhow::anyhow!(
            "unknown settlement kind '{other}'"
        ))),
    }
}
