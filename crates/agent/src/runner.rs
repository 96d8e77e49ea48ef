//! The step loop.
//!
//! One request drives a session through
//! `AwaitingModel → ToolCallsPending → (AwaitingApproval | ExecutingTools) → AwaitingModel → ... → Done`,
//! streaming [`StreamEvent`]s as it goes. The session is loaded from the
//! checkpoint store under a per-session lock, and written back after every
//! completed transition:
//!
//! - a model step that ends the request (`Done`),
//! - a model step whose tool calls need approval (`AwaitingApproval`, with the interrupt),
//! - a tool batch (`AwaitingModel`, or `Rejected` when every call was rejected).
//!
//! Nothing is written when a model call or middleware fails, so the same
//! request can be retried against the last committed state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use agentgate_config::AppConfig;
use agentgate_core::checkpoint::{Checkpoint, CheckpointStore, SessionLocks};
use agentgate_core::error::{Error, Result};
use agentgate_core::event::{DomainEvent, EventBus};
use agentgate_core::interrupt::{Decision, DecisionKind, Interrupt};
use agentgate_core::message::{Message, Role};
use agentgate_core::provider::Provider;
use agentgate_core::session::{Session, StepState};
use agentgate_core::tool::{ToolCall, ToolRegistry, ToolResult};
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clock;
use crate::handler::ProviderHandler;
use crate::middleware::{CallContext, MiddlewareChain, ModelRequest, ModelResponse, RunFlags};
use crate::stream_event::{EventSink, StreamEvent};

/// One chat call: exactly one of `query` or `resume`.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub session_id: String,
    pub query: Option<String>,
    /// One decision per pending tool call, in the interrupt's order.
    pub resume: Option<Vec<Decision>>,
    pub flags: RunFlags,
}

impl ChatRequest {
    pub fn query(session_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            query: Some(query.into()),
            ..Default::default()
        }
    }

    pub fn resume(session_id: impl Into<String>, decisions: Vec<Decision>) -> Self {
        Self {
            session_id: session_id.into(),
            resume: Some(decisions),
            ..Default::default()
        }
    }

    pub fn with_flags(mut self, flags: RunFlags) -> Self {
        self.flags = flags;
        self
    }
}

enum Input {
    Query(String),
    Resume(Vec<Decision>),
}

/// A validated resume: the interrupt it answers and one decision per pending call.
struct ResumePlan {
    interrupt: Interrupt,
    decisions: Vec<Decision>,
}

/// One position in a tool batch.
enum Slot {
    Execute(ToolCall),
    /// Settled without running, e.g. a rejected call.
    Resolved(ToolResult),
}

/// How a model step left the session.
enum StepOutcome {
    Done,
    Suspend(Interrupt),
    Execute(Vec<Slot>),
}

/// How a request ended, short of an error.
enum Outcome {
    Finished,
    Suspended(Interrupt),
}

/// Drives sessions through the step loop.
///
/// Cheap to clone; every field is shared or small.
#[derive(Clone)]
pub struct AgentRunner {
    provider: Arc<dyn Provider>,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    tools: Arc<ToolRegistry>,
    chain: Arc<MiddlewareChain>,
    store: Arc<dyn CheckpointStore>,
    locks: SessionLocks,
    system_prompt: String,
    /// UTC offset for the date stamp, when stamping is on.
    date_offset_hours: Option<i32>,
    max_steps: u32,
    event_bus: Arc<EventBus>,
    buffer: usize,
}

impl AgentRunner {
    /// Create a runner with an empty chain and no system prompt.
    pub fn new(
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        tools: Arc<ToolRegistry>,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            tools,
            chain: Arc::new(MiddlewareChain::new()),
            store,
            locks: SessionLocks::new(),
            system_prompt: String::new(),
            date_offset_hours: None,
            max_steps: 25,
            event_bus: Arc::new(EventBus::new(256)),
            buffer: 128,
        }
    }

    /// Build a runner with every setting taken from `config`.
    pub fn from_config(
        config: &AppConfig,
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        store: Arc<dyn CheckpointStore>,
        chain: MiddlewareChain,
    ) -> Self {
        let mut runner = Self::new(provider, &config.default_model, tools, store)
            .with_chain(chain)
            .with_temperature(config.default_temperature)
            .with_max_tokens(config.default_max_tokens)
            .with_max_steps(config.agent.max_steps)
            .with_system_prompt(&config.agent.system_prompt);
        if config.agent.append_date {
            runner = runner.with_date_stamp(config.retrieval.utc_offset_hours);
        }
        runner
    }

    pub fn with_chain(mut self, chain: MiddlewareChain) -> Self {
        self.chain = Arc::new(chain);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    /// Set the maximum number of model calls per request.
    pub fn with_max_steps(mut self, max: u32) -> Self {
        self.max_steps = max.max(1);
        self
    }

    /// Append the current date at `utc_offset_hours` to the system prompt.
    pub fn with_date_stamp(mut self, utc_offset_hours: i32) -> Self {
        self.date_offset_hours = Some(utc_offset_hours);
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn chain(&self) -> &MiddlewareChain {
        &self.chain
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// The last committed checkpoint of a session.
    pub async fn checkpoint(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.store.get(session_id).await?)
    }

    /// Start a request and return its event stream.
    ///
    /// Boundary errors (`ConflictingInput`, `InvalidResume`) are returned
    /// here, before anything runs or is written. Everything after that is
    /// reported on the stream. The stream ends with exactly one of `done`,
    /// `__interrupt__` or `error`, or simply stops if the receiver is dropped.
    pub async fn run_stream(&self, request: ChatRequest) -> Result<mpsc::Receiver<StreamEvent>> {
        let ChatRequest {
            session_id,
            query,
            resume,
            flags,
        } = request;
        let input = match (query, resume) {
            (Some(query), None) => Input::Query(query),
            (None, Some(decisions)) => Input::Resume(decisions),
            (Some(_), Some(_)) => {
                return Err(Error::ConflictingInput(
                    "provide either a query or a resume decision, not both".into(),
                ));
            }
            (None, None) => {
                return Err(Error::ConflictingInput(
                    "provide a query or a resume decision".into(),
                ));
            }
        };

        let guard = self.locks.lock(&session_id).await;
        let checkpoint = self.store.get(&session_id).await?;

        let (session, plan) = match input {
            Input::Query(query) => {
                if checkpoint
                    .as_ref()
                    .is_some_and(|cp| cp.pending_interrupt.is_some())
                {
                    return Err(Error::ConflictingInput(format!(
                        "session '{session_id}' is waiting for approval; resume it before sending a new query"
                    )));
                }
                let mut session = checkpoint
                    .map(|cp| cp.to_session())
                    .unwrap_or_else(|| Session::new(&session_id));
                session.messages.push(Message::user(query));
                session.state = StepState::AwaitingModel;
                (session, None)
            }
            Input::Resume(decisions) => {
                let plan = validate_resume(&session_id, checkpoint.as_ref(), decisions)?;
                let session = checkpoint
                    .map(|cp| cp.to_session())
                    .unwrap_or_else(|| Session::new(&session_id));
                (session, Some(plan))
            }
        };

        let (sink, rx) = EventSink::channel(self.buffer);
        let runner = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            runner.drive(session, plan, flags, sink).await;
        });
        Ok(rx)
    }

    /// Run a request to its end and collect every event.
    pub async fn invoke(&self, request: ChatRequest) -> Result<Vec<StreamEvent>> {
        let mut rx = self.run_stream(request).await?;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        Ok(events)
    }

    async fn drive(
        self,
        mut session: Session,
        plan: Option<ResumePlan>,
        flags: RunFlags,
        sink: EventSink,
    ) {
        let final_event = match self.advance(&mut session, plan, flags, &sink).await {
            Ok(Outcome::Finished) => {
                info!(session_id = %session.id, state = %session.state, "Request finished");
                StreamEvent::Done {
                    session_id: session.id.clone(),
                    state: session.state,
                }
            }
            Ok(Outcome::Suspended(interrupt)) => {
                info!(
                    session_id = %session.id,
                    pending = interrupt.pending_tool_calls.len(),
                    "Waiting for approval"
                );
                StreamEvent::Interrupted { interrupt }
            }
            Err(Error::Cancelled) => {
                info!(session_id = %session.id, "Client disconnected, stopping request");
                return;
            }
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "Request failed");
                self.event_bus.publish(DomainEvent::RequestFailed {
                    session_id: session.id.clone(),
                    error_message: e.to_string(),
                    timestamp: Utc::now(),
                });
                StreamEvent::Error {
                    message: e.to_string(),
                }
            }
        };
        if sink.emit(final_event).await.is_err() {
            debug!(session_id = %session.id, "Receiver gone before final event");
        }
    }

    async fn advance(
        &self,
        session: &mut Session,
        plan: Option<ResumePlan>,
        flags: RunFlags,
        sink: &EventSink,
    ) -> Result<Outcome> {
        let mut batch = None;
        if let Some(plan) = plan {
            self.event_bus.publish(DomainEvent::SessionResumed {
                session_id: session.id.clone(),
                decisions: plan.decisions.len(),
                timestamp: Utc::now(),
            });
            let (slots, all_rejected) = apply_resume(session, &plan)?;
            self.announce(session, sink).await?;
            if all_rejected {
                self.execute_batch(session, slots, StepState::Rejected, sink)
                    .await?;
                return Ok(Outcome::Finished);
            }
            batch = Some(slots);
        }

        let mut steps = 0u32;
        loop {
            if let Some(slots) = batch.take() {
                self.execute_batch(session, slots, StepState::AwaitingModel, sink)
                    .await?;
            }

            if steps >= self.max_steps {
                return Err(Error::StepLimit {
                    limit: self.max_steps,
                });
            }
            steps += 1;

            let response = self.model_step(session, flags, steps, sink).await?;
            match self.commit_step(session, response, sink).await? {
                StepOutcome::Done => return Ok(Outcome::Finished),
                StepOutcome::Suspend(interrupt) => return Ok(Outcome::Suspended(interrupt)),
                StepOutcome::Execute(slots) => batch = Some(slots),
            }
        }
    }

    /// Run the chain once. Nothing in the session changes here.
    async fn model_step(
        &self,
        session: &Session,
        flags: RunFlags,
        step: u32,
        sink: &EventSink,
    ) -> Result<ModelResponse> {
        let request = ModelRequest {
            messages: session.messages.clone(),
            tools: self.tools.definitions(),
            system_prompt: self.system_prompt(),
            extra_context: session.context.clone(),
        };
        let ctx = CallContext {
            session_id: session.id.clone(),
            step,
            flags,
        };
        let msg_id = uuid::Uuid::new_v4().to_string();
        let handler = ProviderHandler {
            provider: &self.provider,
            model: &self.model,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            sink,
            msg_id: &msg_id,
        };

        let response = self.chain.run(request, &ctx, &handler).await?;
        debug!(
            session_id = %session.id,
            step,
            tool_calls = response.message.tool_calls.len(),
            "Model step complete"
        );
        self.event_bus.publish(DomainEvent::ModelCalled {
            session_id: session.id.clone(),
            step,
            tool_calls: response.message.tool_calls.len(),
            timestamp: Utc::now(),
        });
        Ok(response)
    }

    /// Append the model's answer and decide what happens next.
    async fn commit_step(
        &self,
        session: &mut Session,
        response: ModelResponse,
        sink: &EventSink,
    ) -> Result<StepOutcome> {
        let ModelResponse {
            message,
            state_updates,
            requires_approval,
            ..
        } = response;
        session.context.extend(state_updates);
        let calls = message.tool_calls.clone();
        session.messages.push(message);

        if calls.is_empty() {
            session.state = StepState::Done;
            self.persist(session, None).await?;
            return Ok(StepOutcome::Done);
        }
        session.state = StepState::ToolCallsPending;

        let (pending, allowed): (Vec<ToolCall>, Vec<Vec<DecisionKind>>) = calls
            .iter()
            .filter_map(|call| {
                requires_approval
                    .get(&call.id)
                    .map(|allowed| (call.clone(), allowed.clone()))
            })
            .unzip();

        if pending.is_empty() {
            self.announce(session, sink).await?;
            return Ok(StepOutcome::Execute(
                calls.into_iter().map(Slot::Execute).collect(),
            ));
        }

        let interrupt = Interrupt::new(&session.id, pending, allowed);
        session.state = StepState::AwaitingApproval;
        self.persist(session, Some(interrupt.clone())).await?;
        self.event_bus.publish(DomainEvent::InterruptRaised {
            session_id: session.id.clone(),
            pending: interrupt.pending_tool_calls.len(),
            timestamp: Utc::now(),
        });
        self.announce(session, sink).await?;
        Ok(StepOutcome::Suspend(interrupt))
    }

    /// Emit the tool calls of the latest assistant message.
    async fn announce(&self, session: &Session, sink: &EventSink) -> Result<()> {
        let Some(message) = session.last_assistant() else {
            return Ok(());
        };
        sink.emit(StreamEvent::ToolCallsAnnounced {
            calls: message.tool_calls.clone(),
            msg_id: message.id.clone(),
        })
        .await
    }

    /// Run a batch concurrently and commit results in emission order.
    async fn execute_batch(
        &self,
        session: &mut Session,
        slots: Vec<Slot>,
        next_state: StepState,
        sink: &EventSink,
    ) -> Result<()> {
        session.state = StepState::ExecutingTools;
        let session_id = session.id.clone();
        let results = join_all(slots.into_iter().map(|slot| self.run_slot(&session_id, slot))).await;

        for result in &results {
            session.messages.push(Message::tool_result(
                &result.tool_call_id,
                &result.name,
                &result.content,
            ));
        }
        session.state = next_state;
        self.persist(session, None).await?;
        sink.emit(StreamEvent::ToolOutput { results }).await
    }

    async fn run_slot(&self, session_id: &str, slot: Slot) -> ToolResult {
        let call = match slot {
            Slot::Resolved(result) => return result,
            Slot::Execute(call) => call,
        };
        let started = Instant::now();
        let result = self.tools.invoke(&call).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        debug!(
            session_id,
            tool = %call.name,
            call_id = %call.id,
            success = result.success,
            duration_ms,
            "Tool executed"
        );
        self.event_bus.publish(DomainEvent::ToolExecuted {
            session_id: session_id.to_string(),
            tool_name: call.name.clone(),
            success: result.success,
            duration_ms,
            timestamp: Utc::now(),
        });
        result
    }

    async fn persist(&self, session: &Session, interrupt: Option<Interrupt>) -> Result<()> {
        self.store
            .put(&session.id, Checkpoint::from_session(session, interrupt))
            .await?;
        debug!(
            session_id = %session.id,
            state = %session.state,
            backend = self.store.name(),
            "Checkpoint written"
        );
        Ok(())
    }

    fn system_prompt(&self) -> String {
        match self.date_offset_hours {
            Some(offset) if !self.system_prompt.is_empty() => {
                clock::stamp(&self.system_prompt, clock::today(offset))
            }
            _ => self.system_prompt.clone(),
        }
    }
}

/// Check a resume against the pending interrupt without touching anything.
fn validate_resume(
    session_id: &str,
    checkpoint: Option<&Checkpoint>,
    decisions: Vec<Decision>,
) -> Result<ResumePlan> {
    let interrupt = checkpoint
        .and_then(|cp| cp.pending_interrupt.as_ref())
        .ok_or_else(|| {
            Error::InvalidResume(format!("no pending interrupt for session '{session_id}'"))
        })?;

    let expected = interrupt.pending_tool_calls.len();
    if decisions.len() != expected {
        return Err(Error::InvalidResume(format!(
            "expected {expected} decision(s), got {}",
            decisions.len()
        )));
    }

    for (i, (call, decision)) in interrupt
        .pending_tool_calls
        .iter()
        .zip(&decisions)
        .enumerate()
    {
        let allowed = interrupt
            .allowed_decisions
            .get(i)
            .filter(|a| !a.is_empty())
            .cloned()
            .unwrap_or_else(DecisionKind::all);
        if !allowed.contains(&decision.kind) {
            return Err(Error::InvalidResume(format!(
                "decision '{}' is not allowed for tool '{}'",
                decision.kind.as_str(),
                call.name
            )));
        }
        if decision.kind == DecisionKind::Edit && decision.edited_action.is_none() {
            return Err(Error::InvalidResume(format!(
                "edit decision for tool '{}' has no edited_action",
                call.name
            )));
        }
    }

    Ok(ResumePlan {
        interrupt: interrupt.clone(),
        decisions,
    })
}

/// Apply decisions to the suspended batch.
///
/// Edited calls replace the original in the assistant message so the model
/// sees what actually ran. Returns the batch and whether every call in it
/// was rejected.
fn apply_resume(session: &mut Session, plan: &ResumePlan) -> Result<(Vec<Slot>, bool)> {
    let decided: HashMap<&str, &Decision> = plan
        .interrupt
        .pending_tool_calls
        .iter()
        .map(|c| c.id.as_str())
        .zip(&plan.decisions)
        .collect();

    let assistant = session
        .messages
        .iter_mut()
        .rev()
        .find(|m| m.role == Role::Assistant && m.has_tool_calls())
        .ok_or_else(|| {
            Error::Internal(format!(
                "session '{}' has a pending interrupt but no tool-calling message",
                plan.interrupt.session_id
            ))
        })?;

    let mut slots = Vec::with_capacity(assistant.tool_calls.len());
    let mut all_rejected = true;
    for call in assistant.tool_calls.iter_mut() {
        let Some(decision) = decided.get(call.id.as_str()) else {
            all_rejected = false;
            slots.push(Slot::Execute(call.clone()));
            continue;
        };
        match (decision.kind, &decision.edited_action) {
            (DecisionKind::Reject, _) => {
                let content = decision
                    .message
                    .clone()
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| {
                        format!("Tool call '{}' was rejected by the user.", call.name)
                    });
                slots.push(Slot::Resolved(ToolResult {
                    tool_call_id: call.id.clone(),
                    name: call.name.clone(),
                    content,
                    success: false,
                }));
            }
            (DecisionKind::Edit, Some(action)) => {
                *call = ToolCall {
                    id: call.id.clone(),
                    name: action.name.clone(),
                    arguments: action.arguments.clone(),
                };
                all_rejected = false;
                slots.push(Slot::Execute(call.clone()));
            }
            _ => {
                all_rejected = false;
                slots.push(Slot::Execute(call.clone()));
            }
        }
    }
    session.state = StepState::ExecutingTools;
    Ok((slots, all_rejected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{ApprovalPolicy, HumanInTheLoop};
    use crate::test_helpers::{
        SequentialMockProvider, make_text_response, make_tool_call, make_tool_call_response,
    };
    use agentgate_core::error::{CheckpointError, ProviderError, ToolError};
    use agentgate_core::provider::ProviderResponse;
    use agentgate_core::tool::{Tool, ToolArguments};
    use agentgate_tools::EvalTool;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Minimal store so these tests need nothing outside the crate.
    #[derive(Default)]
    struct MapStore {
        map: Mutex<HashMap<String, Checkpoint>>,
        puts: Mutex<usize>,
    }

    impl MapStore {
        fn puts(&self) -> usize {
            *self.puts.lock().unwrap()
        }
    }

    #[async_trait]
    impl CheckpointStore for MapStore {
        fn name(&self) -> &str {
            "map"
        }

        async fn get(&self, id: &str) -> std::result::Result<Option<Checkpoint>, CheckpointError> {
            Ok(self.map.lock().unwrap().get(id).cloned())
        }

        async fn put(
            &self,
            id: &str,
            checkpoint: Checkpoint,
        ) -> std::result::Result<(), CheckpointError> {
            *self.puts.lock().unwrap() += 1;
            self.map.lock().unwrap().insert(id.to_string(), checkpoint);
            Ok(())
        }
    }

    /// Sleeps `ms` milliseconds, then echoes `text`.
    struct SlowEcho;

    #[async_trait]
    impl Tool for SlowEcho {
        fn name(&self) -> &str {
            "slow_echo"
        }
        fn description(&self) -> &str {
            "Echo after a delay"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        async fn execute(&self, args: &ToolArguments) -> std::result::Result<String, ToolError> {
            let ms = args.get("ms").and_then(|v| v.as_u64()).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(args
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string())
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EvalTool));
        registry.register(Box::new(SlowEcho));
        Arc::new(registry)
    }

    fn gated_chain() -> MiddlewareChain {
        MiddlewareChain::new().with(HumanInTheLoop::new(
            ApprovalPolicy::new().gate("eval_tool", vec![]),
        ))
    }

    fn setup(
        responses: Vec<ProviderResponse>,
        chain: MiddlewareChain,
    ) -> (AgentRunner, Arc<MapStore>, Arc<SequentialMockProvider>) {
        let provider = Arc::new(SequentialMockProvider::new(responses));
        let store = Arc::new(MapStore::default());
        let runner = AgentRunner::new(provider.clone(), "mock-model", registry(), store.clone())
            .with_chain(chain);
        (runner, store, provider)
    }

    fn eval_call(id: &str, expression: &str) -> ToolCall {
        make_tool_call(id, "eval_tool", json!({"expression": expression}))
    }

    fn tool_outputs(events: &[StreamEvent]) -> Vec<Vec<ToolResult>> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolOutput { results } => Some(results.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn direct_answer_finishes() {
        let (runner, store, _) = setup(vec![make_text_response("Hello!")], MiddlewareChain::new());
        let events = runner.invoke(ChatRequest::query("s1", "hi")).await.unwrap();

        assert!(matches!(&events[0], StreamEvent::Token { text, .. } if text == "Hello!"));
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Done {
                session_id: "s1".into(),
                state: StepState::Done
            })
        );
        let cp = store.get("s1").await.unwrap().unwrap();
        assert_eq!(cp.messages.len(), 2);
        assert_eq!(cp.step_state, StepState::Done);
    }

    #[tokio::test]
    async fn ungated_tools_run_without_interrupt() {
        let (runner, store, _) = setup(
            vec![
                make_tool_call_response(vec![eval_call("c1", "2+2")], ""),
                make_text_response("It is 4."),
            ],
            MiddlewareChain::new(),
        );
        let events = runner.invoke(ChatRequest::query("s1", "2+2?")).await.unwrap();

        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Interrupted { .. })));
        let names: Vec<_> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(names, vec!["tool_calls", "tool_output", "token", "done"]);
        assert_eq!(tool_outputs(&events)[0][0].content, "4");

        let cp = store.get("s1").await.unwrap().unwrap();
        let roles: Vec<_> = cp.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn results_commit_in_emission_order() {
        let (runner, store, _) = setup(
            vec![
                make_tool_call_response(
                    vec![
                        make_tool_call("slow", "slow_echo", json!({"text": "first", "ms": 50})),
                        make_tool_call("fast", "slow_echo", json!({"text": "second", "ms": 1})),
                    ],
                    "",
                ),
                make_text_response("done"),
            ],
            MiddlewareChain::new(),
        );
        let events = runner.invoke(ChatRequest::query("s1", "go")).await.unwrap();

        let batch = &tool_outputs(&events)[0];
        assert_eq!(batch[0].tool_call_id, "slow");
        assert_eq!(batch[1].tool_call_id, "fast");
        let cp = store.get("s1").await.unwrap().unwrap();
        assert_eq!(cp.messages[2].content, "first");
        assert_eq!(cp.messages[3].content, "second");
    }

    #[tokio::test]
    async fn tool_errors_are_absorbed() {
        let (runner, _, provider) = setup(
            vec![
                make_tool_call_response(vec![eval_call("c1", "1/0")], ""),
                make_text_response("Cannot divide by zero."),
            ],
            MiddlewareChain::new(),
        );
        let events = runner.invoke(ChatRequest::query("s1", "1/0")).await.unwrap();

        let result = &tool_outputs(&events)[0][0];
        assert!(!result.success);
        assert!(result.content.starts_with("Error: "));
        assert_eq!(provider.call_count(), 2);
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    }

    #[tokio::test]
    async fn gated_call_suspends_before_any_execution() {
        let (runner, store, _) = setup(
            vec![make_tool_call_response(
                vec![
                    make_tool_call("e1", "slow_echo", json!({"text": "hi"})),
                    eval_call("c1", "10+10"),
                ],
                "",
            )],
            gated_chain(),
        );
        let events = runner.invoke(ChatRequest::query("s1", "go")).await.unwrap();

        let names: Vec<_> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(names, vec!["tool_calls", "__interrupt__"]);
        let StreamEvent::Interrupted { interrupt } = events.last().unwrap() else {
            panic!("expected interrupt");
        };
        assert_eq!(interrupt.pending_tool_calls.len(), 1);
        assert_eq!(interrupt.pending_tool_calls[0].id, "c1");

        let cp = store.get("s1").await.unwrap().unwrap();
        assert_eq!(cp.step_state, StepState::AwaitingApproval);
        assert!(cp.pending_interrupt.is_some());
        assert!(!cp.messages.iter().any(|m| m.role == Role::Tool));
    }

    #[tokio::test]
    async fn approve_matches_ungated_execution() {
        let (gated, _, _) = setup(
            vec![
                make_tool_call_response(vec![eval_call("c1", "6*7")], ""),
                make_text_response("42"),
            ],
            gated_chain(),
        );
        gated.invoke(ChatRequest::query("s1", "6*7")).await.unwrap();
        let approved = gated
            .invoke(ChatRequest::resume("s1", vec![Decision::approve()]))
            .await
            .unwrap();

        let (plain, _, _) = setup(
            vec![
                make_tool_call_response(vec![eval_call("c1", "6*7")], ""),
                make_text_response("42"),
            ],
            MiddlewareChain::new(),
        );
        let direct = plain.invoke(ChatRequest::query("s1", "6*7")).await.unwrap();

        assert_eq!(tool_outputs(&approved)[0], tool_outputs(&direct)[0]);
        assert_eq!(approved[0].event_type(), "tool_calls");
    }

    #[tokio::test]
    async fn resume_length_mismatch_leaves_checkpoint() {
        let (runner, store, _) = setup(
            vec![make_tool_call_response(vec![eval_call("c1", "1+1")], "")],
            gated_chain(),
        );
        runner.invoke(ChatRequest::query("s1", "1+1")).await.unwrap();
        let before = store.get("s1").await.unwrap().unwrap();

        let err = runner
            .run_stream(ChatRequest::resume(
                "s1",
                vec![Decision::approve(), Decision::approve()],
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidResume(_)));
        assert!(err.is_boundary());
        assert_eq!(store.get("s1").await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn second_resume_is_invalid() {
        let (runner, _, _) = setup(
            vec![
                make_tool_call_response(vec![eval_call("c1", "1+1")], ""),
                make_text_response("2"),
            ],
            gated_chain(),
        );
        runner.invoke(ChatRequest::query("s1", "1+1")).await.unwrap();
        runner
            .invoke(ChatRequest::resume("s1", vec![Decision::approve()]))
            .await
            .unwrap();
        let err = runner
            .invoke(ChatRequest::resume("s1", vec![Decision::approve()]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidResume(msg) if msg.contains("no pending interrupt")));
    }

    #[tokio::test]
    async fn resume_without_session_is_invalid() {
        let (runner, _, _) = setup(vec![], gated_chain());
        let err = runner
            .invoke(ChatRequest::resume("nobody", vec![Decision::approve()]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidResume(_)));
    }

    #[tokio::test]
    async fn disallowed_decision_is_invalid() {
        let chain = MiddlewareChain::new().with(HumanInTheLoop::new(
            ApprovalPolicy::new().gate("eval_tool", vec![DecisionKind::Approve]),
        ));
        let (runner, _, _) = setup(
            vec![make_tool_call_response(vec![eval_call("c1", "1+1")], "")],
            chain,
        );
        runner.invoke(ChatRequest::query("s1", "1+1")).await.unwrap();

        let err = runner
            .invoke(ChatRequest::resume("s1", vec![Decision::reject(None)]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidResume(msg) if msg.contains("reject")));
    }

    #[tokio::test]
    async fn conflicting_inputs_rejected() {
        let (runner, store, _) = setup(vec![], MiddlewareChain::new());
        let mut request = ChatRequest::query("s1", "hi");
        request.resume = Some(vec![Decision::approve()]);
        let err = runner.invoke(request).await.unwrap_err();
        assert!(matches!(err, Error::ConflictingInput(_)));

        let err = runner
            .invoke(ChatRequest {
                session_id: "s1".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConflictingInput(_)));
        assert_eq!(store.puts(), 0);
    }

    #[tokio::test]
    async fn new_query_while_suspended_is_conflicting() {
        let (runner, _, _) = setup(
            vec![make_tool_call_response(vec![eval_call("c1", "1+1")], "")],
            gated_chain(),
        );
        runner.invoke(ChatRequest::query("s1", "1+1")).await.unwrap();
        let err = runner
            .invoke(ChatRequest::query("s1", "something else"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConflictingInput(_)));
    }

    #[tokio::test]
    async fn sole_rejection_ends_request() {
        let (runner, store, provider) = setup(
            vec![make_tool_call_response(vec![eval_call("c1", "1+1")], "")],
            gated_chain(),
        );
        runner.invoke(ChatRequest::query("s1", "1+1")).await.unwrap();
        let events = runner
            .invoke(ChatRequest::resume(
                "s1",
                vec![Decision::reject(Some("Not now.".into()))],
            ))
            .await
            .unwrap();

        let result = &tool_outputs(&events)[0][0];
        assert_eq!(result.content, "Not now.");
        assert!(!result.success);
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Done { state: StepState::Rejected, .. })
        ));
        assert_eq!(provider.call_count(), 1);

        let cp = store.get("s1").await.unwrap().unwrap();
        assert_eq!(cp.step_state, StepState::Rejected);
        assert!(cp.pending_interrupt.is_none());
        assert_eq!(cp.messages.last().unwrap().content, "Not now.");
    }

    #[tokio::test]
    async fn rejection_does_not_block_ungated_calls() {
        let (runner, _, _) = setup(
            vec![
                make_tool_call_response(
                    vec![
                        eval_call("c1", "1+1"),
                        make_tool_call("e1", "slow_echo", json!({"text": "ran"})),
                    ],
                    "",
                ),
                make_text_response("ok"),
            ],
            gated_chain(),
        );
        runner.invoke(ChatRequest::query("s1", "go")).await.unwrap();
        let events = runner
            .invoke(ChatRequest::resume("s1", vec![Decision::reject(None)]))
            .await
            .unwrap();

        let batch = &tool_outputs(&events)[0];
        assert_eq!(
            batch[0].content,
            "Tool call 'eval_tool' was rejected by the user."
        );
        assert_eq!(batch[1].content, "ran");
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Done { state: StepState::Done, .. })
        ));
    }

    #[tokio::test]
    async fn tool_messages_never_empty() {
        let (runner, store, _) = setup(
            vec![
                make_tool_call_response(
                    vec![
                        eval_call("c1", "1+1"),
                        make_tool_call("e1", "slow_echo", json!({"text": ""})),
                    ],
                    "",
                ),
                make_text_response("ok"),
            ],
            gated_chain(),
        );
        runner.invoke(ChatRequest::query("s1", "go")).await.unwrap();
        let events = runner
            .invoke(ChatRequest::resume(
                "s1",
                vec![Decision::reject(Some("  ".into()))],
            ))
            .await
            .unwrap();

        let batch = &tool_outputs(&events)[0];
        assert_eq!(
            batch[0].content,
            "Tool call 'eval_tool' was rejected by the user."
        );
        assert_eq!(batch[1].content, agentgate_core::tool::NO_OUTPUT);

        let cp = store.get("s1").await.unwrap().unwrap();
        assert!(
            cp.messages
                .iter()
                .filter(|m| m.role == Role::Tool)
                .all(|m| !m.content.is_empty())
        );
    }

    #[tokio::test]
    async fn edit_replaces_call_in_thread() {
        let (runner, store, _) = setup(
            vec![
                make_tool_call_response(vec![eval_call("c1", "10+10")], ""),
                make_text_response("30"),
            ],
            gated_chain(),
        );
        runner.invoke(ChatRequest::query("s1", "10+10")).await.unwrap();
        let events = runner
            .invoke(ChatRequest::resume(
                "s1",
                vec![Decision::edit("eval_tool", json!({"expression": "10+20"}))],
            ))
            .await
            .unwrap();

        let StreamEvent::ToolCallsAnnounced { calls, .. } = &events[0] else {
            panic!("expected re-announced calls");
        };
        assert_eq!(calls[0].arguments["expression"], "10+20");
        assert_eq!(tool_outputs(&events)[0][0].content, "30");

        let cp = store.get("s1").await.unwrap().unwrap();
        let assistant = cp.messages.iter().find(|m| m.has_tool_calls()).unwrap();
        assert_eq!(assistant.tool_calls[0].id, "c1");
        assert_eq!(assistant.tool_calls[0].arguments["expression"], "10+20");
    }

    #[tokio::test]
    async fn model_failure_keeps_last_checkpoint() {
        let provider = Arc::new(SequentialMockProvider::from_results(vec![
            Ok(make_text_response("first answer")),
            Err(ProviderError::RateLimited {
                retry_after_secs: 3,
            }),
        ]));
        let store = Arc::new(MapStore::default());
        let runner = AgentRunner::new(provider, "m", registry(), store.clone());

        runner.invoke(ChatRequest::query("s1", "one")).await.unwrap();
        let before = store.get("s1").await.unwrap().unwrap();

        let events = runner.invoke(ChatRequest::query("s1", "two")).await.unwrap();
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Error { message }) if message.contains("Rate limited")
        ));
        assert_eq!(store.get("s1").await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn step_limit_is_reported() {
        let (runner, store, _) = setup(
            vec![
                make_tool_call_response(vec![eval_call("c1", "1+1")], ""),
                make_tool_call_response(vec![eval_call("c2", "2+2")], ""),
            ],
            MiddlewareChain::new(),
        );
        let runner = runner.with_max_steps(1);
        let events = runner.invoke(ChatRequest::query("s1", "loop")).await.unwrap();

        assert!(matches!(
            events.last(),
            Some(StreamEvent::Error { message }) if message.contains("Step limit of 1")
        ));
        let cp = store.get("s1").await.unwrap().unwrap();
        assert_eq!(cp.step_state, StepState::AwaitingModel);
        assert_eq!(cp.messages.last().unwrap().role, Role::Tool);
    }

    #[tokio::test]
    async fn system_prompt_is_date_stamped() {
        let (runner, _, provider) = setup(vec![make_text_response("hi")], MiddlewareChain::new());
        let runner = runner.with_system_prompt("Be helpful.").with_date_stamp(0);
        runner.invoke(ChatRequest::query("s1", "hi")).await.unwrap();

        let system = &provider.requests()[0].messages[0];
        assert_eq!(system.role, Role::System);
        assert!(system.content.starts_with("Be helpful.\nCurrent date: "));
    }

    #[tokio::test]
    async fn domain_events_published() {
        let (runner, _, _) = setup(
            vec![
                make_tool_call_response(vec![eval_call("c1", "1+1")], ""),
                make_text_response("2"),
            ],
            MiddlewareChain::new(),
        );
        let mut rx = runner.event_bus().subscribe();
        runner.invoke(ChatRequest::query("s1", "1+1")).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.session_id(), "s1");
            kinds.push(event.kind());
        }
        assert_eq!(kinds, vec!["model", "tool", "model"]);
    }

    /// Holds the second model call until released.
    struct HeldProvider {
        inner: SequentialMockProvider,
        release: Arc<tokio::sync::Notify>,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl agentgate_core::provider::Provider for HeldProvider {
        fn name(&self) -> &str {
            "held"
        }

        async fn complete(
            &self,
            request: agentgate_core::provider::ProviderRequest,
        ) -> std::result::Result<ProviderResponse, ProviderError> {
            self.inner.complete(request).await
        }

        async fn stream(
            &self,
            request: agentgate_core::provider::ProviderRequest,
        ) -> std::result::Result<agentgate_core::provider::ChunkReceiver, ProviderError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            if call == 2 {
                self.release.notified().await;
            }
            self.inner.stream(request).await
        }
    }

    #[tokio::test]
    async fn disconnect_after_tool_batch_keeps_commit() {
        let release = Arc::new(tokio::sync::Notify::new());
        let provider = Arc::new(HeldProvider {
            inner: SequentialMockProvider::new(vec![
                make_tool_call_response(vec![eval_call("c1", "10+10")], ""),
                make_text_response("an answer nobody reads"),
                make_text_response("fresh start"),
            ])
            .with_chunk_size(2),
            release: release.clone(),
            calls: Mutex::new(0),
        });
        let store = Arc::new(MapStore::default());
        let runner = AgentRunner::new(provider, "mock-model", registry(), store.clone());

        let mut rx = runner.run_stream(ChatRequest::query("s1", "10+10")).await.unwrap();
        loop {
            match rx.recv().await {
                Some(StreamEvent::ToolOutput { results }) => {
                    assert_eq!(results[0].content, "20");
                    break;
                }
                Some(_) => continue,
                None => panic!("stream ended before tool output"),
            }
        }
        drop(rx);
        release.notify_one();

        // The lock is released once the spawned task stops.
        drop(runner.locks.lock("s1").await);
        let cp = store.get("s1").await.unwrap().unwrap();
        assert_eq!(cp.step_state, StepState::AwaitingModel);
        assert!(cp.pending_interrupt.is_none());
        let last = cp.messages.last().unwrap();
        assert_eq!(last.role, Role::Tool);
        assert_eq!(last.content, "20");
        assert!(!cp.messages.iter().any(|m| m.content.contains("nobody reads")));

        let events = runner.invoke(ChatRequest::query("s1", "again")).await.unwrap();
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
        let cp = store.get("s1").await.unwrap().unwrap();
        assert_eq!(cp.step_state, StepState::Done);
        assert!(cp.messages.iter().any(|m| m.role == Role::Tool && m.content == "20"));
        assert_eq!(cp.messages.last().unwrap().content, "fresh start");
    }

    #[tokio::test]
    async fn dropped_receiver_stops_quietly() {
        let (runner, store, _) = setup(
            vec![make_text_response("a long answer")],
            MiddlewareChain::new(),
        );
        let rx = runner.run_stream(ChatRequest::query("s1", "hi")).await.unwrap();
        drop(rx);
        // The lock is released once the spawned task stops.
        let _guard = runner.locks.lock("s1").await;
        assert!(store.get("s1").await.unwrap().is_none());
    }
}
