use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs as async_fs;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::action::{Action, PlannedAction};
use crate::browser::{Browser, BrowserConfig};
use crate::conversation::{ContentPart, Conversation, SubGoal, Turn};
use crate::coords::{RegionOrder, Viewport};
use crate::llm::LlmClient;
use crate::prompt::{system_prompt, PromptOptions};
use crate::protocol::{decode_response, ActionDescriptor, Decision};

// ========================= Core Types =========================

/// One capture of the page: logical viewport plus an encoded screenshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Observation {
    pub viewport: Viewport,
    pub image_base64: String,
    pub mime_type: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelReply {
    pub text: String,
    /// Provider-side reasoning, logged and otherwise ignored.
    pub reasoning: Option<String>,
}

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum AgentError {
    #[error("model error: {0}")]
    Model(String),
    #[error("observer error: {0}")]
    Observer(String),
    #[error("actuator error: {0}")]
    Actuator(String),
    #[error("invalid action: {0}")]
    InvalidAction(String),
    #[error("task {0} already finished")]
    TaskFinished(String),
    #[error("other error: {0}")]
    Other(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    Running,
    Completed { success: bool, message: String },
    StepBudgetExhausted,
}

impl TaskState {
    pub fn is_running(&self) -> bool {
        matches!(self, TaskState::Running)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskReport {
    pub run_id: String,
    pub instruction: String,
    pub state: TaskState,
    pub steps: usize,
    pub sub_goals: Vec<SubGoal>,
    pub memories: Vec<String>,
}

/// State of one instruction being carried out. Every task owns its own
/// transcript; nothing is shared between tasks.
#[derive(Clone, Debug)]
pub struct Task {
    run_id: String,
    instruction: String,
    conversation: Conversation,
    steps: usize,
    state: TaskState,
}

impl Task {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    pub fn report(&self) -> TaskReport {
        TaskReport {
            run_id: self.run_id.clone(),
            instruction: self.instruction.clone(),
            state: self.state.clone(),
            steps: self.steps,
            sub_goals: self.conversation.sub_goals().goals().to_vec(),
            memories: self.conversation.memories().to_vec(),
        }
    }
}

// ========================= Pluggable Subsystems =========================

#[async_trait]
pub trait Observer: Send + Sync {
    async fn observe(&self) -> Result<Observation, AgentError>;
}

#[async_trait]
pub trait ModelCaller: Send + Sync {
    async fn complete(&self, transcript: &[Turn], model: &str) -> Result<ModelReply, AgentError>;
}

#[async_trait]
pub trait Actuator: Send + Sync {
    async fn act(&self, action: &Action) -> Result<(), AgentError>;
}

#[async_trait]
pub trait ScreenshotSink: Send + Sync {
    async fn save(&self, run_id: &str, step: usize, observation: &Observation) -> Result<(), AgentError>;
}

#[async_trait]
impl<T: Observer + ?Sized> Observer for Arc<T> {
    async fn observe(&self) -> Result<Observation, AgentError> {
        (**self).observe().await
    }
}

#[async_trait]
impl<T: Actuator + ?Sized> Actuator for Arc<T> {
    async fn act(&self, action: &Action) -> Result<(), AgentError> {
        (**self).act(action).await
    }
}

#[async_trait]
impl<T: ModelCaller + ?Sized> ModelCaller for Arc<T> {
    async fn complete(&self, transcript: &[Turn], model: &str) -> Result<ModelReply, AgentError> {
        (**self).complete(transcript, model).await
    }
}

// ========================= Agent Core =========================

const ACTION_DONE_TEXT: &str = "The previous action has been executed, here is the latest screenshot. Please continue according to the instruction.";

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CompressionPolicy {
    /// Transcript length above which older turns are folded away.
    pub threshold: usize,
    /// Newest turns kept verbatim. Must cover the system turn to keep it.
    pub keep_recent: usize,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub max_steps: usize,
    /// Track sub-goals and memories and feed them back to the model.
    pub deep_think: bool,
    pub step_delay: Duration,
    pub model: String,
    pub region_order: RegionOrder,
    pub compression: Option<CompressionPolicy>,
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 15,
            deep_think: true,
            step_delay: Duration::from_millis(1000),
            model: env::var("AI_MODEL").unwrap_or_else(|_| "google/gemini-3-flash-preview".into()),
            region_order: RegionOrder::default(),
            compression: None,
            system_prompt: None,
        }
    }
}

pub struct Agent<O, A, M>
where
    O: Observer,
    A: Actuator,
    M: ModelCaller,
{
    observer: O,
    actuator: A,
    model: M,
    cfg: AgentConfig,
    screenshot_sink: Option<Arc<dyn ScreenshotSink>>,
}

impl<O, A, M> Agent<O, A, M>
where
    O: Observer,
    A: Actuator,
    M: ModelCaller,
{
    pub fn new(observer: O, actuator: A, model: M, cfg: AgentConfig) -> Self {
        Self { observer, actuator, model, cfg, screenshot_sink: None }
    }

    pub fn with_screenshot_sink(mut self, sink: Arc<dyn ScreenshotSink>) -> Self {
        self.screenshot_sink = Some(sink);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.cfg
    }

    /// Seeds a transcript with the system prompt and the user instruction.
    pub fn start(&self, instruction: &str) -> Task {
        let prompt = self.cfg.system_prompt.clone().unwrap_or_else(|| {
            system_prompt(PromptOptions { include_sub_goals: self.cfg.deep_think, include_thought: true })
        });
        let mut conversation = Conversation::new(prompt);
        conversation.append_user(vec![ContentPart::text(format!(
            "<user_instruction>{instruction}</user_instruction>"
        ))]);
        let state = if self.cfg.max_steps == 0 {
            TaskState::StepBudgetExhausted
        } else {
            TaskState::Running
        };
        Task {
            run_id: nanoid!(),
            instruction: instruction.to_string(),
            conversation,
            steps: 0,
            state,
        }
    }

    pub async fn run(&self, instruction: &str) -> Result<TaskReport, AgentError> {
        let mut task = self.start(instruction);
        let span = info_span!("task", run_id = %task.run_id);
        async {
            info!(instruction = %instruction, max_steps = self.cfg.max_steps, "task started");
            while task.state.is_running() {
                self.step(&mut task).await?;
                if task.state.is_running() && !self.cfg.step_delay.is_zero() {
                    tokio::time::sleep(self.cfg.step_delay).await;
                }
            }
            info!(steps = task.steps, state = ?task.state, "task finished");
            Ok::<_, AgentError>(task.report())
        }
        .instrument(span)
        .await
    }

    /// Runs one observe, decide, act cycle.
    ///
    /// Observer and model failures are returned as errors and leave the task
    /// running, so the step can be retried. Actuation failures are written
    /// into the transcript for the model to recover from.
    pub async fn step<'a>(&self, task: &'a mut Task) -> Result<&'a TaskState, AgentError> {
        if !task.state.is_running() {
            return Err(AgentError::TaskFinished(task.run_id.clone()));
        }
        let step = task.steps + 1;
        info!(step, "agent step");

        if let Some(policy) = self.cfg.compression {
            if task.conversation.compress(policy.threshold, policy.keep_recent) {
                info!(step, turns = task.conversation.len(), "transcript compressed");
            }
        }

        let observation = self.observer.observe().await?;
        if let Some(sink) = &self.screenshot_sink {
            if let Err(err) = sink.save(&task.run_id, step, &observation).await {
                warn!(step, "screenshot sink failed: {}", err);
            }
        }
        task.conversation.attach_image(ContentPart::image(
            observation.image_base64.clone(),
            observation.mime_type.clone(),
        ));

        let reply = self.model.complete(task.conversation.turns(), &self.cfg.model).await?;
        if let Some(reasoning) = reply.reasoning.as_deref().filter(|r| !r.is_empty()) {
            debug!(step, "model reasoning: {}", reasoning);
        }
        debug!(step, "raw response: {}", reply.text);

        let decision = decode_response(&reply.text);
        if let Some(log) = &decision.log {
            info!(step, log = %log, "model log");
        }
        task.steps = step;

        if let Some(completion) = &decision.completion {
            task.conversation.sub_goals_mut().mark_all_finished();
            task.conversation.append_assistant(reply.text);
            info!(step, success = completion.success, message = %completion.message, "goal completed");
            task.state = TaskState::Completed {
                success: completion.success,
                message: completion.message.clone(),
            };
            return Ok(&task.state);
        }

        if self.cfg.deep_think {
            apply_plan_updates(&mut task.conversation, &decision, step);
        }
        task.conversation.append_assistant(reply.text);

        let context = if self.cfg.deep_think {
            task.conversation.render_context()
        } else {
            String::new()
        };
        let follow_up = match decision.next_action() {
            Some(descriptor) => match self.perform(descriptor, observation.viewport).await {
                Ok(action) => {
                    info!(step, action = ?action, "action done");
                    format!("{ACTION_DONE_TEXT}{context}")
                }
                Err(err) => {
                    warn!(step, kind = %descriptor.kind, "action failed: {}", err);
                    format!(
                        "Action {} failed. Error: {}. Please try a different approach or fix the params.",
                        descriptor.kind, err
                    )
                }
            },
            None => match &decision.error {
                Some(error) => {
                    warn!(step, "model reported error: {}", error);
                    format!("You reported an error: {error}. Please try to recover.{context}")
                }
                None => {
                    debug!(step, "no action in response");
                    format!("Please continue.{context}")
                }
            },
        };
        task.conversation.append_user(vec![ContentPart::text(follow_up)]);

        if task.steps >= self.cfg.max_steps {
            warn!(steps = task.steps, "step budget exhausted");
            task.state = TaskState::StepBudgetExhausted;
        }
        Ok(&task.state)
    }

    async fn perform(
        &self,
        descriptor: &ActionDescriptor,
        viewport: Viewport,
    ) -> Result<Action, AgentError> {
        let planned = PlannedAction::from_descriptor(descriptor, self.cfg.region_order)
            .map_err(|e| AgentError::InvalidAction(e.to_string()))?;
        let action = planned.resolve(viewport);
        debug!(action = ?action, "dispatching action");
        self.actuator.act(&action).await?;
        Ok(action)
    }
}

fn apply_plan_updates(conversation: &mut Conversation, decision: &Decision, step: usize) {
    if let Some(goals) = decision.sub_goals.as_ref().filter(|g| !g.is_empty()) {
        conversation.sub_goals_mut().replace(goals);
        info!(step, count = goals.len(), "plan updated");
    }
    if let Some(indexes) = decision.finished_indexes.as_ref().filter(|i| !i.is_empty()) {
        conversation.sub_goals_mut().mark_finished(indexes.iter().copied());
        info!(step, indexes = ?indexes, "sub-goals finished");
    }
    if let Some(memory) = decision.memory.as_deref().filter(|m| !m.is_empty()) {
        conversation.attach_memory(Some(memory));
        info!(step, memory = %memory, "memory added");
    }
}

// ========================= Defaults & Helpers =========================

pub struct DiskScreenshotSink {
    base_dir: PathBuf,
}

impl DiskScreenshotSink {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self { base_dir: base.as_ref().to_path_buf() }
    }
}

#[async_trait]
impl ScreenshotSink for DiskScreenshotSink {
    async fn save(&self, run_id: &str, step: usize, observation: &Observation) -> Result<(), AgentError> {
        let dir = self.base_dir.join(run_id);
        async_fs::create_dir_all(&dir)
            .await
            .map_err(|e| AgentError::Other(format!("create_dir: {}", e)))?;
        let bytes = B64
            .decode(&observation.image_base64)
            .map_err(|e| AgentError::Other(format!("b64 decode: {}", e)))?;
        let ext = match observation.mime_type.as_str() {
            "image/png" => "png",
            _ => "jpg",
        };
        async_fs::write(dir.join(format!("step_{:03}.{}", step, ext)), &bytes)
            .await
            .map_err(|e| AgentError::Other(format!("write: {}", e)))?;
        Ok(())
    }
}

// ========================= Chromium Adapter =========================

/// Chromium page acting as both observer and actuator.
pub struct ChromiumDevice {
    browser: Browser,
}

impl ChromiumDevice {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self, AgentError> {
        let browser = Browser::launch(cfg)
            .await
            .map_err(|e| AgentError::Other(e.to_string()))?;
        Ok(Self { browser })
    }

    pub async fn connect(ws_url: &str) -> Result<Self, AgentError> {
        let browser = Browser::connect(ws_url)
            .await
            .map_err(|e| AgentError::Other(e.to_string()))?;
        Ok(Self { browser })
    }

    pub fn browser(&self) -> &Browser {
        &self.browser
    }
}

#[async_trait]
impl Observer for ChromiumDevice {
    async fn observe(&self) -> Result<Observation, AgentError> {
        let viewport = self
            .browser
            .viewport()
            .await
            .map_err(|e| AgentError::Observer(e.to_string()))?;
        let image_base64 = self
            .browser
            .screenshot_b64(viewport)
            .await
            .map_err(|e| AgentError::Observer(e.to_string()))?;
        Ok(Observation { viewport, image_base64, mime_type: "image/jpeg".into() })
    }
}

#[async_trait]
impl Actuator for ChromiumDevice {
    async fn act(&self, action: &Action) -> Result<(), AgentError> {
        let action = if action.needs_viewport() {
            let viewport = self
                .browser
                .viewport()
                .await
                .map_err(|e| AgentError::Actuator(e.to_string()))?;
            action.clamped(viewport)
        } else {
            action.clone()
        };
        let result = match &action {
            Action::Navigate { url } => self.browser.goto(url).await,
            Action::Click { at, click_count } => self.browser.click(*at, *click_count).await,
            Action::Input { at, value, mode } => self.browser.input(*at, value, *mode).await,
            Action::Scroll { at, dx, dy, repeat } => {
                self.browser.scroll(*at, *dx, *dy, *repeat).await
            }
            Action::Wait { duration } => {
                tokio::time::sleep(*duration).await;
                Ok(())
            }
        };
        result.map_err(|e| AgentError::Actuator(e.to_string()))
    }
}

// ========================= OpenRouter-backed Model Caller =========================

#[async_trait]
impl ModelCaller for LlmClient {
    async fn complete(&self, transcript: &[Turn], model: &str) -> Result<ModelReply, AgentError> {
        let out = self
            .chat(transcript, model)
            .await
            .map_err(|e| AgentError::Model(e.to_string()))?;
        Ok(ModelReply { text: out.text, reasoning: out.reasoning })
    }
}
