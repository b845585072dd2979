//! The agent conversation loop: LLM call → tool-call extraction → tool
//! dispatch → loop, expressed as a pure state machine rather than a
//! streaming channel so the scheduler, not the agent, owns async
//! dispatch.

use std::collections::HashMap;

use foliant_domain::{ChatRequest, ChatResult, Message, ToolCall};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::Tools;

/// One unit of work an agent wants performed: either a model call or a
/// tool execution, keyed by a local call id the agent will later be told
/// the result of via `handle_llm_result`/`handle_tool_result`.
#[derive(Debug, Clone)]
pub enum AgentWorkUnit {
    Llm(ChatRequest),
    Tool {
        call_id: String,
        tool_name: String,
        arguments: Value,
    },
}

/// Final outcome of an agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub success: bool,
    pub iterations: u32,
    pub final_messages: Vec<Message>,
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// JSON-convertible snapshot of a running or finished agent, used for
/// `export_state`/`restore_state` round trips.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: String,
    pub max_iterations: u32,
    pub iteration: u32,
    pub complete: bool,
    pub messages: Vec<Message>,
    pub pending_tool_calls: Vec<ToolCall>,
    pub tool_results: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<AgentResult>,
}

/// A stateful, single-conversation, multi-turn tool-using agent.
///
/// Generic over `T: Tools` rather than boxed as `dyn Tools`: each call
/// site has one concrete tool set in mind, so monomorphizing avoids a
/// vtable indirection on every tool dispatch.
pub struct Agent<T: Tools> {
    pub id: String,
    pub model: String,
    max_iterations: u32,
    iteration: u32,
    messages: Vec<Message>,
    pending_tool_calls: Vec<ToolCall>,
    tool_results: HashMap<String, String>,
    complete: bool,
    result: Option<AgentResult>,
    tools: T,
}

impl<T: Tools> Agent<T> {
    pub fn new(id: impl Into<String>, model: impl Into<String>, max_iterations: u32, tools: T) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            max_iterations,
            iteration: 0,
            messages: Vec::new(),
            pending_tool_calls: Vec::new(),
            tool_results: HashMap::new(),
            complete: false,
            result: None,
            tools,
        }
    }

    /// Seed the conversation with a system prompt and initial user turn.
    pub fn seed(&mut self, system: impl Into<String>, user: impl Into<String>) {
        self.messages.push(Message::system(system));
        self.messages.push(Message::user(user));
    }

    pub fn is_done(&self) -> bool {
        self.complete
    }

    pub fn result(&self) -> Option<&AgentResult> {
        self.result.as_ref()
    }

    pub fn tools(&self) -> &T {
        &self.tools
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    fn unanswered_call_ids(&self) -> Vec<String> {
        self.pending_tool_calls
            .iter()
            .filter(|tc| !self.tool_results.contains_key(&tc.call_id))
            .map(|tc| tc.call_id.clone())
            .collect()
    }

    /// Advances the turn: drains unanswered tool calls first, then issues the next LLM call once every call has an answer.
    pub fn next_work_units(&mut self) -> Vec<AgentWorkUnit> {
        if self.complete {
            return Vec::new();
        }

        let unanswered = self.unanswered_call_ids();
        if !self.pending_tool_calls.is_empty() && !unanswered.is_empty() {
            return unanswered
                .into_iter()
                .filter_map(|call_id| {
                    self.pending_tool_calls
                        .iter()
                        .find(|tc| tc.call_id == call_id)
                        .map(|tc| AgentWorkUnit::Tool {
                            call_id: tc.call_id.clone(),
                            tool_name: tc.function_name.clone(),
                            arguments: serde_json::from_str(&tc.arguments_json)
                                .unwrap_or(Value::Object(Default::default())),
                        })
                })
                .collect();
        }

        self.iteration += 1;
        if self.iteration > self.max_iterations {
            self.finish_failed(format!(
                "did not complete within {} iterations",
                self.max_iterations
            ));
            return Vec::new();
        }

        let mut history: Vec<Message> = self.messages.iter().map(Message::without_images).collect();
        if let Some(last) = history.last_mut() {
            last.images = self.tools.images();
        }

        vec![AgentWorkUnit::Llm(ChatRequest {
            model: self.model.clone(),
            messages: history,
            tools: self.tools.schema(),
            response_format: None,
            temperature: None,
            max_tokens: None,
        })]
    }

    /// Appends the model's reply to history and records any tool calls it made as pending.
    pub fn handle_llm_result(&mut self, chat_result: ChatResult) {
        self.messages.push(Message::assistant(
            chat_result.content,
            chat_result.tool_calls.clone(),
            chat_result.reasoning_details,
        ));

        if !chat_result.tool_calls.is_empty() {
            self.pending_tool_calls = chat_result.tool_calls;
            self.tool_results.clear();
            return;
        }

        if self.tools.is_complete() {
            self.finish_success();
        } else {
            self.messages
                .push(Message::user("please continue using the available tools"));
        }
    }

    /// Records a tool's outcome so the next `next_work_units` call can see it as answered.
    pub fn handle_tool_result(&mut self, tool_call_id: String, result: Option<String>, err: Option<String>) {
        let stored = match (result, err) {
            (_, Some(e)) => serde_json::json!({ "error": e }).to_string(),
            (Some(r), None) => r,
            (None, None) => "{}".to_string(),
        };
        // Idempotent: a later result for the same id overwrites the
        // earlier one; both count as one entry.
        self.tool_results.insert(tool_call_id, stored);

        if self.tool_results.len() < self.pending_tool_calls.len() {
            return;
        }

        // All pending calls answered: append one role=tool message per
        // call in original order, then clear.
        for call in &self.pending_tool_calls {
            if let Some(content) = self.tool_results.get(&call.call_id) {
                self.messages
                    .push(Message::tool_result(call.call_id.clone(), content.clone()));
            }
        }
        self.pending_tool_calls.clear();
        self.tool_results.clear();

        if self.tools.is_complete() {
            self.finish_success();
        }
    }

    fn finish_success(&mut self) {
        self.complete = true;
        self.result = Some(AgentResult {
            success: true,
            iterations: self.iteration,
            final_messages: self.messages.clone(),
            result: self.tools.result(),
            error: None,
        });
    }

    fn finish_failed(&mut self, error: String) {
        self.complete = true;
        // Open question (a), resolved in DESIGN.md: persist accumulated
        // messages even on failure.
        self.result = Some(AgentResult {
            success: false,
            iterations: self.iteration,
            final_messages: self.messages.clone(),
            result: Value::Null,
            error: Some(error),
        });
    }

    pub fn export_state(&self) -> AgentSnapshot {
        AgentSnapshot {
            id: self.id.clone(),
            max_iterations: self.max_iterations,
            iteration: self.iteration,
            complete: self.complete,
            messages: self.messages.clone(),
            pending_tool_calls: self.pending_tool_calls.clone(),
            tool_results: self.tool_results.clone(),
            result: self.result.clone(),
        }
    }

    /// Restore state into a freshly-constructed agent wrapping the same
    /// `Tools`.
    pub fn restore_state(&mut self, snapshot: AgentSnapshot) -> Result<(), foliant_domain::Error> {
        self.id = snapshot.id;
        self.iteration = snapshot.iteration;
        self.max_iterations = snapshot.max_iterations;
        self.complete = snapshot.complete;
        self.messages = snapshot.messages;
        self.pending_tool_calls = snapshot.pending_tool_calls;
        self.tool_results = snapshot.tool_results;
        self.result = snapshot.result;
        Ok(())
    }

    /// Parse a snapshot from JSON, surfacing `Error::MalformedState` on
    /// failure instead of a generic serde error.
    pub fn snapshot_from_json(json: &str) -> Result<AgentSnapshot, foliant_domain::Error> {
        serde_json::from_str(json).map_err(|e| foliant_domain::Error::MalformedState(e.to_string()))
    }
}
