//! Request pipeline: classify, record, route, execute, finalize.
//!
//! ```text
//! submit ──► tasks.inbound ──► InboundHandler ──► process_request ──► dispatch
//!                                                                      │
//!              Chat:  Chat-Agent inline ──────────────────────────────►│ complete / fail
//!              Plan:  PlannerAgent ───────────────────────────────────►│ Planned
//!              Agent: worker pool ──► engine ──► tasks.feedback ──► FeedbackHandler
//! ```
//!
//! Errors never escape a handler except storage failures, which the bus
//! nacks. Everything else ends in `fail()` on the task.

mod handlers;
mod messages;

pub use handlers::{FeedbackHandler, InboundHandler};
pub use messages::{FeedbackMessage, FeedbackStatus, InboundTask};

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::agents::{AgentError, AgentRegistry, PlannerAgent, RegisteredAgent, DEFAULT_DESIGN_HINT};
use crate::bus::{BusError, MessageBus, FEEDBACK_QUEUE, INBOUND_QUEUE};
use crate::classifier::{Classifier, Mode, CHAT_ROLE};
use crate::config::Config;
use crate::llm::{EngineRegistry, LlmError};
use crate::load_balancer::{LoadBalancer, TaskMetadata};
use crate::metrics::{epoch_seconds, MetricsCollector};
use crate::task_state::{Outcome, StoreError, Task, TaskStatus, TaskStore};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No suitable LLM engine available for {0}")]
    NoEngineAvailable(String),

    #[error("No agent registered for role {0}")]
    AgentNotFound(String),

    #[error("Unknown mode '{0}'")]
    UnknownMode(String),

    #[error("Engine '{0}' is configured but has no client")]
    EngineClientMissing(String),

    #[error("Backend error: {0}")]
    Backend(#[from] LlmError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("Local agent {0} did not finish: {1}")]
    LocalAgentAborted(String, String),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl DispatchError {
    pub fn is_storage(&self) -> bool {
        matches!(self, DispatchError::Storage(_))
    }
}

/// Tunables of the pipeline.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Classifications below this confidence are handled as Chat
    pub confidence_threshold: f64,
    pub llm_timeout: Duration,
    pub max_concurrent_agents: usize,
    pub design_hint: String,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            llm_timeout: Duration::from_secs(120),
            max_concurrent_agents: 8,
            design_hint: DEFAULT_DESIGN_HINT.to_string(),
        }
    }
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            llm_timeout: config.llm_timeout,
            max_concurrent_agents: config.max_concurrent_agents,
            ..Self::default()
        }
    }
}

pub struct Dispatcher {
    classifier: Classifier,
    store: Arc<dyn TaskStore>,
    agents: AgentRegistry,
    planner: PlannerAgent,
    balancer: LoadBalancer,
    engines: EngineRegistry,
    bus: Arc<MessageBus>,
    metrics: Arc<MetricsCollector>,
    workers: Arc<Semaphore>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        agents: AgentRegistry,
        balancer: LoadBalancer,
        engines: EngineRegistry,
        bus: Arc<MessageBus>,
        metrics: Arc<MetricsCollector>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            classifier: Classifier::new(),
            store,
            agents,
            planner: PlannerAgent::new(),
            balancer,
            engines,
            bus,
            metrics,
            workers: Arc::new(Semaphore::new(settings.max_concurrent_agents.max(1))),
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    pub fn engines(&self) -> &EngineRegistry {
        &self.engines
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Subscribe the inbound and feedback handlers to the bus.
    pub async fn attach(self: &Arc<Self>) -> Result<(), BusError> {
        self.bus
            .subscribe(INBOUND_QUEUE, Arc::new(InboundHandler::new(Arc::clone(self))))
            .await?;
        self.bus
            .subscribe(FEEDBACK_QUEUE, Arc::new(FeedbackHandler::new(Arc::clone(self))))
            .await
    }

    /// Record a new request and queue it. Returns the task id.
    ///
    /// Without a connected bus the request is processed directly.
    pub async fn submit(
        self: &Arc<Self>,
        prompt: &str,
        profile: Option<String>,
        role: Option<String>,
    ) -> Result<String, DispatchError> {
        let start_time = epoch_seconds();
        let mut payload = Map::new();
        payload.insert("start_time".to_string(), json!(start_time));
        if let Some(ref profile) = profile {
            payload.insert("requested_profile".to_string(), json!(profile));
        }
        if let Some(ref role) = role {
            payload.insert("requested_role".to_string(), json!(role));
        }

        let task_id = self
            .store
            .create(prompt, TaskStatus::Received, payload)
            .await?;
        let inbound = InboundTask {
            profile,
            role,
            ..InboundTask::new(&task_id, prompt, start_time)
        };

        match self.bus.publish(INBOUND_QUEUE, &inbound).await {
            Ok(_) => {
                tracing::info!("Task {} queued", task_id);
            }
            Err(BusError::NotConnected) => {
                tracing::warn!(
                    "Message bus not connected; processing task {} directly",
                    task_id
                );
                let dispatcher = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(err) = dispatcher.process_request(inbound).await {
                        tracing::error!("Direct processing failed: {}", err);
                    }
                });
            }
            Err(err) => {
                tracing::error!("Failed to queue task {}: {}", task_id, err);
                // Counted here since it never reaches process_request
                self.metrics.increment_total_requests();
                self.metrics.task_started();
                self.finish(&task_id, Outcome::Failed(format!("Failed to queue task: {}", err)))
                    .await?;
                return Err(err.into());
            }
        }
        Ok(task_id)
    }

    /// Handle one inbound request. Only storage failures are returned.
    pub async fn process_request(self: &Arc<Self>, inbound: InboundTask) -> Result<(), DispatchError> {
        let Some(task_id) = self.claim(&inbound).await? else {
            return Ok(());
        };
        self.metrics.increment_total_requests();
        self.metrics.task_started();

        match self.analyze_and_dispatch(&task_id, &inbound).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_storage() => Err(err),
            Err(err) => self.fail_task(&task_id, &err).await,
        }
    }

    /// Resolve the store record for an inbound message. `None` means the
    /// message was already handled (a redelivery).
    async fn claim(&self, inbound: &InboundTask) -> Result<Option<String>, DispatchError> {
        match self.store.get(&inbound.task_id).await {
            Ok(task) if task.status == TaskStatus::Received => return Ok(Some(task.task_id)),
            Ok(task) => {
                tracing::debug!(
                    "Task {} already {}; skipping redelivered request",
                    task.task_id,
                    task.status
                );
                return Ok(None);
            }
            Err(StoreError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }

        match self.store.get_history(&inbound.task_id).await {
            Ok(_) => {
                tracing::debug!(
                    "Task {} already finalized; skipping redelivered request",
                    inbound.task_id
                );
                return Ok(None);
            }
            Err(StoreError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }

        // Published by another producer: track it under a fresh id
        let mut payload = Map::new();
        payload.insert("external_task_id".to_string(), json!(inbound.task_id));
        payload.insert(
            "start_time".to_string(),
            json!(inbound.start_time.unwrap_or_else(epoch_seconds)),
        );
        let task_id = self
            .store
            .create(&inbound.prompt, TaskStatus::Processing, payload)
            .await?;
        tracing::info!(
            "Created task {} for external request {}",
            task_id,
            inbound.task_id
        );
        Ok(Some(task_id))
    }

    async fn analyze_and_dispatch(
        self: &Arc<Self>,
        task_id: &str,
        inbound: &InboundTask,
    ) -> Result<(), DispatchError> {
        let analysis = self.classifier.analyze(&inbound.prompt);

        let (mode, role) = match inbound.mode {
            Some(ref mode) => (
                mode.clone(),
                inbound.role.clone().unwrap_or_else(|| analysis.role.clone()),
            ),
            None if analysis.confidence < self.settings.confidence_threshold => {
                tracing::info!(
                    "Low confidence ({:.2}) for task {}; defaulting to Chat",
                    analysis.confidence,
                    task_id
                );
                (Mode::Chat.to_string(), CHAT_ROLE.to_string())
            }
            None => {
                let role = match (analysis.mode, inbound.role.as_ref()) {
                    (Mode::Agent, Some(requested)) => requested.clone(),
                    _ => analysis.role.clone(),
                };
                (analysis.mode.to_string(), role)
            }
        };

        let mut payload = Map::new();
        payload.insert(
            "analysis".to_string(),
            serde_json::to_value(&analysis).unwrap_or(Value::Null),
        );
        payload.insert("mode".to_string(), json!(mode));
        payload.insert("role".to_string(), json!(role));
        if let Some(ref profile) = inbound.profile {
            payload.insert("profile".to_string(), json!(profile));
        }
        self.store
            .update(task_id, Some(TaskStatus::Processing), Some(payload))
            .await?;
        self.store
            .add_history(
                task_id,
                &format!(
                    "Request analyzed: {} (mode {}, role {}, confidence {:.2})",
                    analysis.nature, mode, role, analysis.confidence
                ),
                None,
            )
            .await?;

        self.dispatch(task_id, &inbound.prompt, &mode, &role).await
    }

    /// Route a classified task. Failures other than storage end in `fail()`.
    pub async fn dispatch(
        self: &Arc<Self>,
        task_id: &str,
        prompt: &str,
        mode: &str,
        role: &str,
    ) -> Result<(), DispatchError> {
        let result = match mode.parse::<Mode>() {
            Ok(Mode::Chat) => self.run_chat(task_id, prompt).await,
            Ok(Mode::Agent) => self.run_agent(task_id, prompt, role).await,
            Ok(Mode::Plan) => self.run_plan(task_id, prompt).await,
            Err(unknown) => {
                tracing::error!("Unknown mode '{}' for task {}", unknown, task_id);
                Err(DispatchError::UnknownMode(unknown))
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_storage() => Err(err),
            Err(err) => self.fail_task(task_id, &err).await,
        }
    }

    async fn run_chat(self: &Arc<Self>, task_id: &str, prompt: &str) -> Result<(), DispatchError> {
        let agent = self
            .agents
            .get(CHAT_ROLE)
            .cloned()
            .ok_or_else(|| DispatchError::AgentNotFound(CHAT_ROLE.to_string()))?;
        let reply = match agent {
            RegisteredAgent::Local(agent) => agent.respond(prompt)?,
            RegisteredAgent::Generative(agent) => {
                let backend_prompt = agent.build_prompt(prompt)?;
                self.generate(task_id, CHAT_ROLE, prompt, &backend_prompt)
                    .await?
                    .0
            }
        };
        self.finish(task_id, Outcome::Completed(reply)).await
    }

    async fn run_agent(
        self: &Arc<Self>,
        task_id: &str,
        prompt: &str,
        role: &str,
    ) -> Result<(), DispatchError> {
        let agent = self
            .agents
            .get(role)
            .cloned()
            .ok_or_else(|| DispatchError::AgentNotFound(role.to_string()))?;

        let agent = match agent {
            RegisteredAgent::Local(agent) => {
                // Local agents may touch the filesystem; keep them off the consumer
                let request = prompt.to_string();
                let reply = tokio::task::spawn_blocking(move || agent.respond(&request))
                    .await
                    .map_err(|e| {
                        DispatchError::LocalAgentAborted(role.to_string(), e.to_string())
                    })??;
                return self.finish(task_id, Outcome::Completed(reply)).await;
            }
            RegisteredAgent::Generative(agent) => agent,
        };

        self.store
            .update(task_id, Some(TaskStatus::Executing), None)
            .await?;
        self.store
            .add_history(task_id, &format!("Dispatched to {}", role), None)
            .await?;

        let dispatcher = Arc::clone(self);
        let workers = Arc::clone(&self.workers);
        let task_id = task_id.to_string();
        let prompt = prompt.to_string();
        let role = role.to_string();
        tokio::spawn(async move {
            let _permit = match workers.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::error!("Worker pool closed; task {} not executed", task_id);
                    return;
                }
            };
            let feedback = match agent.build_prompt(&prompt) {
                Ok(backend_prompt) => {
                    dispatcher
                        .execute(&task_id, &role, &prompt, &backend_prompt)
                        .await
                }
                Err(err) => FeedbackMessage::failed(&task_id, err.to_string()),
            };
            dispatcher.report(feedback).await;
        });
        Ok(())
    }

    async fn run_plan(&self, task_id: &str, prompt: &str) -> Result<(), DispatchError> {
        let plan = self.planner.create_plan(&self.settings.design_hint, prompt);
        let steps = plan.len();

        let mut payload = Map::new();
        payload.insert("plan".to_string(), serde_json::to_value(&plan).unwrap_or(Value::Null));
        payload.insert(METRICS_RECORDED.to_string(), Value::Bool(true));
        self.store
            .update(task_id, Some(TaskStatus::Planned), Some(payload))
            .await?;
        self.store
            .add_history(
                task_id,
                &format!("Plan created with {} steps", steps),
                Some(json!({ "steps": steps })),
            )
            .await?;

        // Planned is where this pipeline stops; count it as a success
        let task = self.store.get(task_id).await?;
        self.record_outcome(&task, true);
        tracing::info!("Task {} planned with {} steps", task_id, steps);
        Ok(())
    }

    /// Pick an engine for `request` and run `prompt` on it with the timeout.
    /// Returns the generated text and the engine name.
    async fn generate(
        &self,
        task_id: &str,
        role: &str,
        request: &str,
        prompt: &str,
    ) -> Result<(String, String), DispatchError> {
        let engine = self
            .balancer
            .select_engine(&TaskMetadata::new(request, Some(role)))
            .ok_or_else(|| DispatchError::NoEngineAvailable(role.to_string()))?;
        let handle = self
            .engines
            .get(&engine)
            .ok_or_else(|| DispatchError::EngineClientMissing(engine.clone()))?;

        tracing::info!("Task {} running on engine {} ({})", task_id, engine, role);
        let timeout = self.settings.llm_timeout;
        let text = match tokio::time::timeout(timeout, handle.generate(prompt)).await {
            Ok(result) => result?,
            Err(_) => return Err(LlmError::timeout(timeout).into()),
        };
        Ok((text, engine))
    }

    /// Worker body: run the agent prompt and describe the outcome.
    async fn execute(
        &self,
        task_id: &str,
        role: &str,
        request: &str,
        prompt: &str,
    ) -> FeedbackMessage {
        match self.generate(task_id, role, request, prompt).await {
            Ok((text, engine)) => {
                let mut payload = Map::new();
                payload.insert("result".to_string(), json!(text));
                payload.insert("engine".to_string(), json!(engine));
                payload.insert("role".to_string(), json!(role));
                FeedbackMessage::completed(task_id, payload)
            }
            Err(err) => {
                tracing::warn!("Task {} failed in {}: {}", task_id, role, err);
                FeedbackMessage::failed(task_id, err.to_string())
            }
        }
    }

    /// Publish worker feedback; apply it directly when the bus cannot take it.
    async fn report(&self, feedback: FeedbackMessage) {
        match self.bus.publish(FEEDBACK_QUEUE, &feedback).await {
            Ok(_) => return,
            Err(BusError::NotConnected) => {
                tracing::warn!(
                    "Message bus not connected; applying feedback for task {} directly",
                    feedback.task_id
                );
            }
            Err(err) => {
                tracing::error!(
                    "Failed to publish feedback for task {}: {}; applying directly",
                    feedback.task_id,
                    err
                );
            }
        }
        if let Err(err) = self.apply_feedback(&feedback).await {
            tracing::error!("Failed to apply feedback for task {}: {}", feedback.task_id, err);
        }
    }

    /// Finalize a task from a feedback message.
    pub async fn apply_feedback(&self, feedback: &FeedbackMessage) -> Result<(), DispatchError> {
        match feedback.status {
            FeedbackStatus::Completed => {
                if !feedback.payload.is_empty() {
                    match self
                        .store
                        .update(&feedback.task_id, None, Some(feedback.payload.clone()))
                        .await
                    {
                        Ok(()) => {}
                        Err(StoreError::NotFound(_)) => {
                            tracing::warn!(
                                "Feedback for unknown or finalized task {}",
                                feedback.task_id
                            );
                            return Ok(());
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                self.finish(&feedback.task_id, Outcome::Completed(feedback.result_text()))
                    .await
            }
            FeedbackStatus::Failed => {
                let error = feedback
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string());
                self.finish(&feedback.task_id, Outcome::Failed(error)).await
            }
        }
    }

    async fn fail_task(&self, task_id: &str, err: &DispatchError) -> Result<(), DispatchError> {
        tracing::warn!("Task {} failed: {}", task_id, err);
        self.finish(task_id, Outcome::Failed(err.to_string())).await
    }

    /// Finalize and update metrics. An already finalized task is left alone.
    async fn finish(&self, task_id: &str, outcome: Outcome) -> Result<(), DispatchError> {
        let task = match self.store.get(task_id).await {
            Ok(task) => task,
            Err(StoreError::NotFound(_)) => {
                tracing::warn!("Task {} not active; outcome ignored", task_id);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let success = matches!(outcome, Outcome::Completed(_));
        let result = match outcome {
            Outcome::Completed(ref result) => self.store.complete(task_id, result).await,
            Outcome::Failed(ref error) => self.store.fail(task_id, error).await,
        };
        match result {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => {
                tracing::warn!("Task {} finalized concurrently; outcome ignored", task_id);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        if outcome_recorded(&task) {
            tracing::debug!("Task {} outcome already counted", task_id);
        } else {
            self.record_outcome(&task, success);
        }
        tracing::info!(
            "Task {} {}",
            task_id,
            if success { "completed" } else { "failed" }
        );
        Ok(())
    }

    fn record_outcome(&self, task: &Task, success: bool) {
        if success {
            self.metrics.increment_successful_requests();
        } else {
            self.metrics.increment_failed_requests();
        }
        self.metrics.task_finished();
        if let Some(start) = task.payload.get("start_time").and_then(Value::as_f64) {
            self.metrics.add_response_time(epoch_seconds() - start);
        }
    }
}

/// Set on a task whose metrics outcome has been counted before it was finalized.
const METRICS_RECORDED: &str = "metrics_recorded";

fn outcome_recorded(task: &Task) -> bool {
    task.payload
        .get(METRICS_RECORDED)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Acknowledgement, Envelope, InMemoryBroker, MessageHandler, NackPolicy};
    use crate::config::{EngineConfig, EngineSource};
    use crate::llm::testing::ScriptedGenerator;
    use crate::task_state::InMemoryTaskStore;
    use std::sync::atomic::Ordering;

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        generator: Arc<ScriptedGenerator>,
    }

    fn settings() -> DispatchSettings {
        DispatchSettings {
            llm_timeout: Duration::from_secs(5),
            ..DispatchSettings::default()
        }
    }

    async fn harness_with(
        generator: ScriptedGenerator,
        engines: Vec<EngineConfig>,
        settings: DispatchSettings,
        connect: bool,
    ) -> Harness {
        harness_with_agents(
            generator,
            engines,
            settings,
            connect,
            AgentRegistry::with_defaults(),
        )
        .await
    }

    async fn harness_with_agents(
        generator: ScriptedGenerator,
        engines: Vec<EngineConfig>,
        settings: DispatchSettings,
        connect: bool,
        agents: AgentRegistry,
    ) -> Harness {
        let generator = Arc::new(generator);
        let mut registry = EngineRegistry::new();
        for engine in &engines {
            registry.register(engine.clone(), generator.clone());
        }
        let balancer = LoadBalancer::new(engines, Vec::new(), None);

        let bus = Arc::new(
            MessageBus::new(NackPolicy::Drop).with_poll_interval(Duration::from_millis(10)),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(InMemoryTaskStore::new()),
            agents,
            balancer,
            registry,
            Arc::clone(&bus),
            Arc::new(MetricsCollector::new()),
            settings,
        ));
        if connect {
            bus.connect(Arc::new(InMemoryBroker::new()))
                .await
                .expect("connect");
            dispatcher.attach().await.expect("attach");
            bus.start_consuming().await.expect("consume");
        }
        Harness {
            dispatcher,
            generator,
        }
    }

    async fn harness() -> Harness {
        harness_with(
            ScriptedGenerator::replying("done"),
            vec![EngineConfig::new("local", EngineSource::Local, "llama3")],
            settings(),
            true,
        )
        .await
    }

    /// Poll until the task leaves the in-flight statuses.
    async fn settled(dispatcher: &Dispatcher, task_id: &str) -> Task {
        for _ in 0..500 {
            if let Ok(task) = dispatcher.store().lookup(task_id).await {
                if task.status.is_terminal() || task.status == TaskStatus::Planned {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} did not settle", task_id);
    }

    #[tokio::test]
    async fn test_greeting_completes_with_chat_reply() {
        let h = harness().await;
        let task_id = h
            .dispatcher
            .submit("Hello there", None, None)
            .await
            .expect("submit");

        let task = settled(&h.dispatcher, &task_id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(
            task.result.as_deref(),
            Some("Hello there! How can I assist you today?")
        );
        assert_eq!(task.payload["mode"], json!("Chat"));
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
        assert!(task
            .history
            .iter()
            .any(|e| e.event.starts_with("Request analyzed: greeting")));

        let snapshot = h.dispatcher.metrics().snapshot(Default::default(), 0);
        assert_eq!(snapshot.total_requests, 1);
        assert_eq!(snapshot.successful_requests, 1);
        assert_eq!(snapshot.active_tasks, 0);
    }

    #[tokio::test]
    async fn test_development_request_is_planned() {
        let h = harness().await;
        let task_id = h
            .dispatcher
            .submit("Please develop a login API", None, None)
            .await
            .expect("submit");

        let task = settled(&h.dispatcher, &task_id).await;
        assert_eq!(task.status, TaskStatus::Planned);
        let plan = task.payload["plan"].as_array().expect("plan");
        let numbers: Vec<u64> = plan.iter().filter_map(|s| s["step"].as_u64()).collect();
        assert!(!numbers.is_empty());
        assert_eq!(numbers, (1..=numbers.len() as u64).collect::<Vec<_>>());
        assert!(task
            .history
            .iter()
            .any(|e| e.event == format!("Plan created with {} steps", plan.len())));

        // Planned tasks stay active
        assert!(h.dispatcher.store().get(&task_id).await.is_ok());
        let snapshot = h.dispatcher.metrics().snapshot(Default::default(), 0);
        assert_eq!(snapshot.successful_requests, 1);
    }

    #[tokio::test]
    async fn test_planned_task_is_counted_once() {
        let h = harness().await;
        let task_id = h
            .dispatcher
            .submit("Please develop a login API", None, None)
            .await
            .expect("submit");
        let task = settled(&h.dispatcher, &task_id).await;
        assert_eq!(task.status, TaskStatus::Planned);

        // Execution of the plan reported back later
        let mut payload = Map::new();
        payload.insert("result".to_string(), json!("login API shipped"));
        h.dispatcher
            .apply_feedback(&FeedbackMessage::completed(&task_id, payload))
            .await
            .expect("apply");

        let task = h.dispatcher.store().get_history(&task_id).await.expect("history");
        assert_eq!(task.status, TaskStatus::Completed);
        let snapshot = h.dispatcher.metrics().snapshot(Default::default(), 0);
        assert_eq!(snapshot.total_requests, 1);
        assert_eq!(snapshot.successful_requests, 1);
        assert_eq!(snapshot.failed_requests, 0);
        assert!(snapshot.success_rate <= 1.0);
        assert_eq!(snapshot.active_tasks, 0);
    }

    struct RefusingBroker;

    #[async_trait::async_trait]
    impl crate::bus::Broker for RefusingBroker {
        fn name(&self) -> &str {
            "refusing"
        }

        async fn enqueue(&self, _envelope: &Envelope) -> Result<(), BusError> {
            Err(BusError::Broker("disk full".to_string()))
        }

        async fn next(&self, _queue: &str) -> Result<Option<crate::bus::Delivery>, BusError> {
            Ok(None)
        }

        async fn ack(&self, _delivery: &crate::bus::Delivery) -> Result<(), BusError> {
            Ok(())
        }

        async fn requeue(&self, _delivery: crate::bus::Delivery) -> Result<(), BusError> {
            Ok(())
        }

        async fn dead_letter(&self, _delivery: crate::bus::Delivery) -> Result<(), BusError> {
            Ok(())
        }

        async fn pending(&self, _queue: &str) -> Result<usize, BusError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_queue_failure_is_counted_as_a_request() {
        let h = harness_with(
            ScriptedGenerator::replying("done"),
            vec![EngineConfig::new("local", EngineSource::Local, "llama3")],
            settings(),
            false,
        )
        .await;
        h.dispatcher
            .bus()
            .connect(Arc::new(RefusingBroker))
            .await
            .expect("connect");

        let err = h
            .dispatcher
            .submit("Summarize the quarterly report", None, None)
            .await
            .expect_err("queue refused");
        assert!(matches!(err, DispatchError::Bus(_)));

        let snapshot = h.dispatcher.metrics().snapshot(Default::default(), 0);
        assert_eq!(snapshot.total_requests, 1);
        assert_eq!(snapshot.failed_requests, 1);
        assert_eq!(snapshot.active_tasks, 0);
    }

    #[tokio::test]
    async fn test_agent_request_runs_on_engine() {
        let h = harness().await;
        let task_id = h
            .dispatcher
            .submit("Summarize the quarterly report", None, None)
            .await
            .expect("submit");

        let task = settled(&h.dispatcher, &task_id).await;
        assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.error);
        assert!(task
            .result
            .as_deref()
            .expect("result")
            .starts_with("done [llama3]"));
        assert_eq!(task.payload["engine"], json!("local"));
        assert_eq!(task.payload["role"], json!("Writing-Agent"));
        assert!(task.history.iter().any(|e| e.event == "Dispatched to Writing-Agent"));
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_available_engine_fails_task() {
        let h = harness_with(
            ScriptedGenerator::replying("done"),
            vec![EngineConfig::new("local", EngineSource::Local, "llama3").locked(true)],
            settings(),
            true,
        )
        .await;
        let task_id = h
            .dispatcher
            .submit("Research vector databases", None, None)
            .await
            .expect("submit");

        let task = settled(&h.dispatcher, &task_id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.error.as_deref(),
            Some("No suitable LLM engine available for Research-Agent")
        );
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
        let snapshot = h.dispatcher.metrics().snapshot(Default::default(), 0);
        assert_eq!(snapshot.failed_requests, 1);
    }

    #[tokio::test]
    async fn test_slow_engine_times_out() {
        let h = harness_with(
            ScriptedGenerator::replying("late").delayed(Duration::from_secs(2)),
            vec![EngineConfig::new("local", EngineSource::Local, "llama3")],
            DispatchSettings {
                llm_timeout: Duration::from_millis(50),
                ..DispatchSettings::default()
            },
            true,
        )
        .await;
        let task_id = h
            .dispatcher
            .submit("Investigate the outage", None, None)
            .await
            .expect("submit");

        let task = settled(&h.dispatcher, &task_id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.as_deref().expect("error").contains("Timeout"));
    }

    #[tokio::test]
    async fn test_backend_error_fails_task() {
        let h = harness_with(
            ScriptedGenerator::failing(LlmError::from_status(503, "overloaded", None)),
            vec![EngineConfig::new("local", EngineSource::Local, "llama3")],
            settings(),
            true,
        )
        .await;
        let task_id = h
            .dispatcher
            .submit("Explain ownership", None, None)
            .await
            .expect("submit");

        let task = settled(&h.dispatcher, &task_id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.as_deref().expect("error").contains("overloaded"));
    }

    #[tokio::test]
    async fn test_unknown_mode_fails_task() {
        let h = harness().await;
        let task_id = h
            .dispatcher
            .store()
            .create("do things", TaskStatus::Received, Map::new())
            .await
            .expect("create");
        let inbound = InboundTask {
            mode: Some("Swarm".to_string()),
            ..InboundTask::new(&task_id, "do things", epoch_seconds())
        };
        h.dispatcher.process_request(inbound).await.expect("process");

        let task = settled(&h.dispatcher, &task_id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("Unknown mode 'Swarm'"));
    }

    #[tokio::test]
    async fn test_disconnected_bus_processes_directly() {
        let h = harness_with(
            ScriptedGenerator::replying("done"),
            vec![EngineConfig::new("local", EngineSource::Local, "llama3")],
            settings(),
            false,
        )
        .await;
        let task_id = h
            .dispatcher
            .submit("what is your name?", None, None)
            .await
            .expect("submit");

        let task = settled(&h.dispatcher, &task_id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(
            task.result.as_deref(),
            Some("I am a Chat Agent, here to help with your conversational needs.")
        );
    }

    #[tokio::test]
    async fn test_low_confidence_falls_back_to_chat() {
        let h = harness_with(
            ScriptedGenerator::replying("done"),
            vec![EngineConfig::new("local", EngineSource::Local, "llama3")],
            DispatchSettings {
                confidence_threshold: 0.9,
                ..settings()
            },
            true,
        )
        .await;
        let task_id = h
            .dispatcher
            .submit("summarize this", None, None)
            .await
            .expect("submit");

        let task = settled(&h.dispatcher, &task_id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.payload["mode"], json!("Chat"));
        assert_eq!(task.payload["role"], json!(CHAT_ROLE));
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_requested_role_applies_in_agent_mode() {
        let h = harness().await;
        let task_id = h
            .dispatcher
            .submit("Summarize my inbox", None, Some("Email-Management-Agent".to_string()))
            .await
            .expect("submit");

        let task = settled(&h.dispatcher, &task_id).await;
        assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.error);
        assert_eq!(task.payload["role"], json!("Email-Management-Agent"));

        // Ignored outside Agent mode
        let task_id = h
            .dispatcher
            .submit("hello", None, Some("Email-Management-Agent".to_string()))
            .await
            .expect("submit");
        let task = settled(&h.dispatcher, &task_id).await;
        assert_eq!(task.payload["role"], json!(CHAT_ROLE));
    }

    #[tokio::test]
    async fn test_redelivery_is_skipped() {
        let h = harness().await;
        let task_id = h
            .dispatcher
            .submit("hello", None, None)
            .await
            .expect("submit");
        let task = settled(&h.dispatcher, &task_id).await;
        let history_len = task.history.len();

        h.dispatcher
            .process_request(InboundTask::new(&task_id, "hello", epoch_seconds()))
            .await
            .expect("redelivery");

        let task = h.dispatcher.store().lookup(&task_id).await.expect("lookup");
        assert_eq!(task.history.len(), history_len);
        let snapshot = h.dispatcher.metrics().snapshot(Default::default(), 0);
        assert_eq!(snapshot.total_requests, 1);
    }

    #[tokio::test]
    async fn test_external_request_gets_a_record() {
        let h = harness().await;
        h.dispatcher
            .bus()
            .publish(
                INBOUND_QUEUE,
                &json!({"task_id": "ext-1", "prompt": "develop a parser"}),
            )
            .await
            .expect("publish");

        // Planned tasks stay active, so the new record can be found there
        let mut found = None;
        for _ in 0..500 {
            found = h
                .dispatcher
                .store()
                .list_active()
                .await
                .expect("list")
                .into_iter()
                .find(|t| t.payload.get("external_task_id") == Some(&json!("ext-1")));
            if found.as_ref().is_some_and(|t| t.status == TaskStatus::Planned) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let task = found.expect("record for external request");
        assert_ne!(task.task_id, "ext-1");
        assert_eq!(task.status, TaskStatus::Planned);
        assert!(h.dispatcher.store().lookup("ext-1").await.is_err());
    }

    #[tokio::test]
    async fn test_indexing_runs_without_engines_or_bus() {
        let workspace = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(workspace.path().join("docs")).expect("mkdir");
        std::fs::write(workspace.path().join("docs/notes.md"), "remember").expect("write");
        let agents = AgentRegistry::with_index(crate::agents::IndexSettings {
            root: workspace.path().to_path_buf(),
            ..Default::default()
        });
        let h = harness_with_agents(
            ScriptedGenerator::replying("unused"),
            Vec::new(),
            settings(),
            false,
            agents,
        )
        .await;

        let task_id = h
            .dispatcher
            .store()
            .create("docs", TaskStatus::Received, Map::new())
            .await
            .expect("create");
        let inbound = InboundTask {
            mode: Some("Agent".to_string()),
            role: Some("File-Indexing-Agent".to_string()),
            ..InboundTask::new(&task_id, "docs", epoch_seconds())
        };
        h.dispatcher.process_request(inbound).await.expect("process");

        let task = h.dispatcher.store().get_history(&task_id).await.expect("finalized");
        assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.error);
        let index: Value =
            serde_json::from_str(task.result.as_deref().expect("result")).expect("json");
        assert_eq!(index["files"]["docs/notes.md"], "remember");
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_feedback_handler_acks() {
        let h = harness().await;
        let handler = FeedbackHandler::new(Arc::clone(&h.dispatcher));

        let unknown = Envelope::new(
            FEEDBACK_QUEUE,
            serde_json::to_value(FeedbackMessage::completed(
                "0b8e7d1c-0000-4000-8000-000000000000",
                Map::new(),
            ))
            .expect("serialize"),
        );
        assert_eq!(handler.handle(&unknown).await, Acknowledgement::Ack);

        let malformed = Envelope::new(FEEDBACK_QUEUE, json!({"status": "Completed"}));
        assert_eq!(handler.handle(&malformed).await, Acknowledgement::Nack);

        let task_id = h
            .dispatcher
            .store()
            .create("x", TaskStatus::Executing, Map::new())
            .await
            .expect("create");
        let mut payload = Map::new();
        payload.insert("result".to_string(), json!("all good"));
        let feedback = Envelope::new(
            FEEDBACK_QUEUE,
            serde_json::to_value(FeedbackMessage::completed(&task_id, payload))
                .expect("serialize"),
        );
        assert_eq!(handler.handle(&feedback).await, Acknowledgement::Ack);
        let task = h.dispatcher.store().lookup(&task_id).await.expect("lookup");
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("all good"));
    }

    #[tokio::test]
    async fn test_inbound_handler_nacks_malformed_message() {
        let h = harness().await;
        let handler = InboundHandler::new(Arc::clone(&h.dispatcher));
        let envelope = Envelope::new(INBOUND_QUEUE, json!({"prompt": 3}));
        assert_eq!(handler.handle(&envelope).await, Acknowledgement::Nack);
    }
}
