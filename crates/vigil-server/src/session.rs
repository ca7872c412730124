//! Interactive session controller.
//!
//! One controller per transport connection. It walks the session through
//! `Init → Ready → Executing → Finished`, runs the script on the gateway
//! with a session-backed context, and hands answers from the transport to
//! the blocked script thread.
//!
//! The script thread and the transport meet at two places: the prompt slot,
//! which records how many answers the outstanding prompt still expects, and
//! a FIFO answer channel the script thread blocks on. The script arms the
//! slot before it sends a prompt, so an answer can never race ahead of its
//! prompt, and answers that arrive while nothing is outstanding are dropped.

use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use uuid::Uuid;
use vigil_sandbox::context::{parse_boolean, parse_number};
use vigil_sandbox::{
    AuditResult, EvaluationError, EvaluationOptions, ExecutionContext, FieldValue, Input,
    InputError, InputField, MapApi, Output, ScriptGateway, Termination, TerminationReason,
};

use crate::protocol::{parse_start, record_frame, Command, InfoMessage, Outbound, Response};
use crate::store::{ScriptStore, StoredScript};

/// Default time a prompt may stay unanswered.
pub const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(300);

/// Per-session limits.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long one prompt may wait for its answers.
    pub prompt_timeout: Duration,
    /// Execution budget for the whole evaluation, not counting time spent
    /// waiting for answers. The gateway default when `None`.
    pub execution_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            prompt_timeout: DEFAULT_PROMPT_TIMEOUT,
            execution_timeout: None,
        }
    }
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, no script bound.
    Init,
    /// Script bound, waiting for the start signal.
    Ready,
    /// Script running.
    Executing,
    /// Done. Nothing more happens on this session.
    Finished,
}

/// Number of answers the outstanding prompt still expects.
#[derive(Debug, Default)]
pub struct PromptSlot {
    expected: Mutex<usize>,
}

impl PromptSlot {
    /// Arm the slot for a prompt owing `answers` answers.
    pub fn expect(&self, answers: usize) {
        *self.expected.lock() = answers;
    }

    /// Claim room for one answer. `false` when nothing is outstanding.
    pub fn accept(&self) -> bool {
        let mut expected = self.expected.lock();
        if *expected == 0 {
            return false;
        }
        *expected -= 1;
        true
    }

    /// Forget the outstanding prompt.
    pub fn clear(&self) {
        *self.expected.lock() = 0;
    }

    /// Answers still owed.
    pub fn outstanding(&self) -> usize {
        *self.expected.lock()
    }
}

fn send_command(outbound: &UnboundedSender<Outbound>, command: &Command) -> bool {
    command
        .frames()
        .into_iter()
        .all(|frame| outbound.send(Outbound::Frame(frame)).is_ok())
}

/// `Input` that prompts the session peer and blocks for the answers.
pub struct SessionInput {
    answers: Mutex<std_mpsc::Receiver<String>>,
    prompts: Arc<PromptSlot>,
    outbound: UnboundedSender<Outbound>,
    prompt_timeout: Duration,
}

impl SessionInput {
    /// Prompt through `outbound`, reading answers from `answers`.
    pub fn new(
        answers: std_mpsc::Receiver<String>,
        prompts: Arc<PromptSlot>,
        outbound: UnboundedSender<Outbound>,
        prompt_timeout: Duration,
    ) -> Self {
        Self {
            answers: Mutex::new(answers),
            prompts,
            outbound,
            prompt_timeout,
        }
    }

    /// Send `command` and wait for every answer it owes.
    fn ask(&self, command: Command) -> Result<Vec<String>, InputError> {
        let expected = command.expected_answers();
        self.prompts.expect(expected);
        if !send_command(&self.outbound, &command) {
            self.prompts.clear();
            return Err(InputError::Disconnected);
        }

        let answers = self.answers.lock();
        let deadline = Instant::now() + self.prompt_timeout;
        let mut received = Vec::with_capacity(expected);
        while received.len() < expected {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match answers.recv_timeout(remaining) {
                Ok(answer) => received.push(answer),
                Err(RecvTimeoutError::Timeout) => {
                    self.prompts.clear();
                    tracing::warn!(
                        timeout_ms = self.prompt_timeout.as_millis() as u64,
                        "prompt went unanswered"
                    );
                    return Err(InputError::TimedOut {
                        timeout: self.prompt_timeout,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.prompts.clear();
                    return Err(InputError::Disconnected);
                }
            }
        }
        Ok(received)
    }

    fn ask_one(&self, command: Command) -> Result<String, InputError> {
        Ok(self.ask(command)?.into_iter().next().unwrap_or_default())
    }
}

impl Input for SessionInput {
    fn read_boolean(&self, message: &str) -> Result<Option<bool>, InputError> {
        let answer = self.ask_one(Command::ReadBoolean(message.to_string()))?;
        Ok(parse_boolean(&answer))
    }

    fn read_number(&self, message: &str) -> Result<Option<f64>, InputError> {
        let answer = self.ask_one(Command::ReadNumber(message.to_string()))?;
        Ok(parse_number(&answer))
    }

    fn read_string(&self, message: &str) -> Result<Option<String>, InputError> {
        self.ask_one(Command::ReadString(message.to_string()))
            .map(Some)
    }

    fn read_fields(
        &self,
        message: &str,
        fields: &[InputField],
    ) -> Result<Option<MapApi<String, FieldValue>>, InputError> {
        let answers = self.ask(Command::ReadFields {
            message: message.to_string(),
            fields: fields.to_vec(),
        })?;

        let mut values = MapApi::new();
        for (field, answer) in fields.iter().zip(&answers) {
            match field.field_type.coerce(answer) {
                Some(value) => values.insert(field.name.clone(), value),
                None => tracing::debug!(
                    field = %field.name,
                    field_type = field.field_type.wire_name(),
                    "dropping unparseable field answer"
                ),
            }
        }
        Ok(Some(values))
    }

    fn button(&self, message: &str) -> Result<(), InputError> {
        self.ask(Command::Button(message.to_string())).map(|_| ())
    }
}

/// `Output` that forwards renders to the session peer. Never blocks.
pub struct SessionOutput {
    outbound: UnboundedSender<Outbound>,
}

impl SessionOutput {
    /// Forward renders through `outbound`.
    pub fn new(outbound: UnboundedSender<Outbound>) -> Self {
        Self { outbound }
    }

    fn render(&self, command: Command) {
        if !send_command(&self.outbound, &command) {
            tracing::debug!("render dropped, session transport is gone");
        }
    }
}

impl Output for SessionOutput {
    fn render_text(&self, text: &str) {
        self.render(Command::RenderText(text.to_string()));
    }

    fn render_html(&self, html: &str) {
        self.render(Command::RenderHtml(html.to_string()));
    }

    fn render_markdown(&self, markdown: &str) {
        self.render(Command::RenderMarkdown(markdown.to_string()));
    }
}

/// Drives one interactive session.
pub struct SessionController {
    session_id: Uuid,
    store: Arc<dyn ScriptStore>,
    gateway: Arc<ScriptGateway>,
    config: SessionConfig,
    state: Arc<Mutex<SessionState>>,
    outbound: UnboundedSender<Outbound>,
    script: Option<StoredScript>,
    prompts: Arc<PromptSlot>,
    answers: Option<std_mpsc::Sender<String>>,
    termination: Termination,
    task: Option<JoinHandle<()>>,
}

impl SessionController {
    /// Open a session. The receiver yields everything the transport must
    /// send, starting with the `Connected` notice.
    pub fn new(
        store: Arc<dyn ScriptStore>,
        gateway: Arc<ScriptGateway>,
        config: SessionConfig,
    ) -> (Self, UnboundedReceiver<Outbound>) {
        let (outbound, rx) = unbounded_channel();
        let session_id = Uuid::new_v4();
        let _ = outbound.send(record_frame(&InfoMessage::Connected {
            session_id: session_id.to_string(),
        }));
        tracing::info!(session_id = %session_id, "session opened");

        let controller = Self {
            session_id,
            store,
            gateway,
            config,
            state: Arc::new(Mutex::new(SessionState::Init)),
            outbound,
            script: None,
            prompts: Arc::new(PromptSlot::default()),
            answers: None,
            termination: Termination::new(),
            task: None,
        };
        (controller, rx)
    }

    /// This session's identifier.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Answers the outstanding prompt still expects.
    pub fn outstanding_answers(&self) -> usize {
        self.prompts.outstanding()
    }

    /// Handle one inbound text frame.
    pub async fn handle_frame(&mut self, frame: &str) {
        match self.state() {
            SessionState::Init => self.bind_script(frame).await,
            SessionState::Ready => match parse_start(frame) {
                Some(payload) => self.start(payload),
                None => tracing::debug!(
                    session_id = %self.session_id,
                    "ignoring frame while waiting for start"
                ),
            },
            SessionState::Executing => self.deliver_answer(frame),
            SessionState::Finished => tracing::debug!(
                session_id = %self.session_id,
                "session finished, dropping frame"
            ),
        }
    }

    /// The transport closed. Stops a running script without a response.
    pub fn handle_close(&mut self) {
        let previous = std::mem::replace(&mut *self.state.lock(), SessionState::Finished);
        self.prompts.clear();
        self.answers = None;
        if previous == SessionState::Executing {
            tracing::info!(
                session_id = %self.session_id,
                "transport closed while executing, terminating script"
            );
            self.termination.terminate(TerminationReason::Disconnected);
        }
    }

    /// Wait for the evaluation task, if one was started.
    pub async fn wait(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(session_id = %self.session_id, error = %e, "session task failed");
            }
        }
    }

    async fn bind_script(&mut self, frame: &str) {
        let raw = frame.trim();
        let script = match uuid::Uuid::parse_str(raw) {
            Ok(id) => self.store.load(&id).await,
            Err(_) => None,
        };

        match script {
            Some(script) => {
                tracing::info!(session_id = %self.session_id, script_id = %script.id, "script bound");
                self.script = Some(script);
                *self.state.lock() = SessionState::Ready;
            }
            None => {
                tracing::warn!(session_id = %self.session_id, script_id = %raw, "script not found");
                *self.state.lock() = SessionState::Finished;
                let _ = self.outbound.send(record_frame(&InfoMessage::NotFound {
                    script_id: raw.to_string(),
                }));
                let _ = self.outbound.send(Outbound::Close);
            }
        }
    }

    fn start(&mut self, payload: Option<serde_json::Value>) {
        let Some(script) = self.script.clone() else {
            return;
        };

        let (answers_tx, answers_rx) = std_mpsc::channel();
        self.answers = Some(answers_tx);
        *self.state.lock() = SessionState::Executing;
        let _ = self.outbound.send(record_frame(&InfoMessage::Executing {
            script_id: script.id.to_string(),
        }));
        tracing::info!(session_id = %self.session_id, script_id = %script.id, "script started");

        let context = ExecutionContext::new(
            Arc::new(SessionInput::new(
                answers_rx,
                self.prompts.clone(),
                self.outbound.clone(),
                self.config.prompt_timeout,
            )),
            Arc::new(SessionOutput::new(self.outbound.clone())),
        );
        let options = EvaluationOptions {
            payload,
            ipfs_directory: script.ipfs_directory.clone(),
            timeout: self.config.execution_timeout,
            termination: Some(self.termination.clone()),
        };

        let gateway = self.gateway.clone();
        let state = self.state.clone();
        let outbound = self.outbound.clone();
        let session_id = self.session_id;
        self.task = Some(tokio::spawn(async move {
            let outcome = gateway
                .evaluate_with_options(&script.source, &context, options)
                .await;
            finish(&state, &outbound, session_id, &outcome);
        }));
    }

    fn deliver_answer(&self, frame: &str) {
        if !self.prompts.accept() {
            tracing::warn!(
                session_id = %self.session_id,
                "dropping answer with no outstanding prompt"
            );
            return;
        }
        if let Some(answers) = &self.answers {
            if answers.send(frame.to_string()).is_err() {
                tracing::debug!(session_id = %self.session_id, "script stopped waiting for answers");
            }
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if self.state() == SessionState::Executing {
            self.handle_close();
        }
    }
}

/// Record the outcome unless the transport already went away.
fn finish(
    state: &Mutex<SessionState>,
    outbound: &UnboundedSender<Outbound>,
    session_id: Uuid,
    outcome: &Result<AuditResult, EvaluationError>,
) {
    {
        let mut state = state.lock();
        if *state == SessionState::Finished {
            tracing::debug!(session_id = %session_id, "session closed before completion, no response");
            return;
        }
        *state = SessionState::Finished;
    }
    tracing::info!(
        session_id = %session_id,
        ok = outcome.is_ok(),
        "session finished"
    );
    let _ = outbound.send(record_frame(&Response::from_outcome(outcome)));
    let _ = outbound.send(Outbound::Close);
}
