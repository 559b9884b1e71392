//! The Agent Controller (C8): the multi-turn plan/execute loop that answers
//! natural-language queries by interleaving LLM calls with tool calls
//! against the Store, bounded by `max_iterations` and backed by
//! process-local conversation memory.

use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::llm::{ChatReply, LlmAdapter, Message, Role, StopReason, ToolDeclaration};
use crate::store::Store;
use crate::tools::ToolRegistry;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

const SYSTEM_PROMPT: &str = "\
You are a financial analysis assistant with access to a unified store of \
ingested financial records and a fixed set of read-only tools. Call tools \
to gather numbers before answering; never invent figures. When you have \
enough information, answer in plain, concise language.";

/// One conversation's message history plus its last-activity timestamp,
/// used by `ConversationStore::sweep_expired` to reclaim idle entries.
pub struct Conversation {
    pub messages: Vec<Message>,
    pub last_active: Instant,
}

impl Conversation {
    fn new() -> Self {
        Conversation { messages: Vec::new(), last_active: Instant::now() }
    }
}

/// Process-local, per-conversation-locked memory. Each conversation gets its
/// own `tokio::sync::Mutex` so concurrent conversations never block each
/// other; only the top-level map (insertion/eviction) uses a coarser lock.
pub struct ConversationStore {
    conversations: StdMutex<HashMap<Uuid, Arc<AsyncMutex<Conversation>>>>,
    ttl: Duration,
    max_messages: usize,
}

impl ConversationStore {
    pub fn new(ttl: Duration, max_messages: usize) -> Self {
        ConversationStore {
            conversations: StdMutex::new(HashMap::new()),
            ttl,
            max_messages,
        }
    }

    fn get_or_create(&self, id: Uuid) -> Arc<AsyncMutex<Conversation>> {
        let mut map = self.conversations.lock().unwrap_or_else(|p| p.into_inner());
        map.entry(id).or_insert_with(|| Arc::new(AsyncMutex::new(Conversation::new()))).clone()
    }

    /// Drops conversations idle longer than `ttl`. Entries currently locked
    /// (mid-turn) are left alone rather than blocked on.
    pub fn sweep_expired(&self) {
        let mut map = self.conversations.lock().unwrap_or_else(|p| p.into_inner());
        let ttl = self.ttl;
        map.retain(|_, conv| match conv.try_lock() {
            Ok(guard) => guard.last_active.elapsed() < ttl,
            Err(_) => true,
        });
    }

    pub fn len(&self) -> usize {
        self.conversations.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn trim(&self, messages: &mut Vec<Message>) {
        if messages.len() > self.max_messages {
            let excess = messages.len() - self.max_messages;
            messages.drain(0..excess);
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub answer: String,
    pub conversation_id: Uuid,
    pub tool_calls_made: Vec<String>,
    pub iterations: usize,
    pub stop_reason: &'static str,
}

/// Drives the plan/execute loop described in the component design: assemble
/// context, call the LLM, execute any requested tools, and repeat until a
/// final answer or the iteration bound is hit.
pub struct AgentController {
    tool_registry: Arc<ToolRegistry>,
    store: Arc<dyn Store>,
    llm: Arc<LlmAdapter>,
    conversations: Arc<ConversationStore>,
    tool_timeout: Duration,
}

impl AgentController {
    pub fn new(tool_registry: Arc<ToolRegistry>, store: Arc<dyn Store>, llm: Arc<LlmAdapter>, config: &Config) -> Self {
        AgentController {
            tool_registry,
            store,
            llm,
            conversations: Arc::new(ConversationStore::new(
                Duration::from_secs(config.conversation_ttl_s),
                config.conversation_max_messages,
            )),
            tool_timeout: config.tool_timeout,
        }
    }

    /// Spawns the background reaper that periodically sweeps expired
    /// conversations. Call once at startup; the task runs for the life of
    /// the process.
    pub fn spawn_reaper(self: &Arc<Self>) {
        let conversations = Arc::clone(&self.conversations);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                conversations.sweep_expired();
            }
        });
    }

    fn tool_declarations(&self) -> Vec<ToolDeclaration> {
        self.tool_registry
            .specs()
            .map(|spec| ToolDeclaration {
                name: spec.name.to_string(),
                description: spec.description.to_string(),
                parameters_schema: spec.parameters_schema.clone(),
            })
            .collect()
    }

    fn assemble(&self, history: &[Message]) -> Vec<Message> {
        let mut assembled = vec![Message::system(SYSTEM_PROMPT)];
        assembled.extend(history.iter().cloned());
        assembled
    }

    async fn run_tool_call(&self, call: &crate::llm::ToolCall) -> Message {
        let execution = self.tool_registry.execute(self.store.as_ref(), &call.name, call.arguments_json.clone());
        let content = match tokio::time::timeout(self.tool_timeout, execution).await {
            Ok(Ok(value)) => value.to_string(),
            Ok(Err(e)) => json!({ "error": e.kind(), "message": e.to_string() }).to_string(),
            Err(_) => json!({ "error": "ToolTimeout", "message": "tool call exceeded its timeout" }).to_string(),
        };
        Message::tool_result(call.id.clone(), call.name.clone(), content)
    }

    /// `conversation_id` is created fresh (uuid v4) when absent. Bounded by
    /// `max_iterations`; terminates in at most `max_iterations + 1` LLM
    /// calls (§8 termination guarantee).
    pub async fn process_query(
        &self,
        query: &str,
        conversation_id: Option<Uuid>,
        max_iterations: usize,
    ) -> Result<AgentResponse> {
        let conversation_id = conversation_id.unwrap_or_else(Uuid::new_v4);
        let conversation_lock = self.conversations.get_or_create(conversation_id);
        let mut conversation = conversation_lock.lock().await;
        conversation.last_active = Instant::now();
        conversation.messages.push(Message::user(query));

        if max_iterations == 0 {
            let assembled = self.assemble(&conversation.messages);
            return self
                .finish_with_summary(&mut conversation, conversation_id, assembled, Vec::new(), 0)
                .await;
        }

        let tool_declarations = self.tool_declarations();
        let mut tool_calls_made = Vec::new();
        let mut iterations = 0usize;

        loop {
            let assembled = self.assemble(&conversation.messages);
            let reply = self.llm.chat(&assembled, &tool_declarations).await;

            let reply = match reply {
                Ok(reply) => reply,
                Err(CoreError::LLMUnavailable(reason)) => {
                    return Ok(self.graceful_fallback(&mut conversation, conversation_id, &reason, tool_calls_made, iterations));
                }
                Err(e) => return Err(e),
            };

            if reply.tool_calls.is_empty() || reply.stop_reason != StopReason::ToolCalls {
                return Ok(self.finalize(&mut conversation, conversation_id, reply, tool_calls_made, iterations, "final_answer"));
            }

            if let Some(text) = &reply.assistant_text {
                conversation.messages.push(Message::assistant(text.clone()));
            }

            for call in &reply.tool_calls {
                tool_calls_made.push(call.name.clone());
                let tool_message = self.run_tool_call(call).await;
                conversation.messages.push(tool_message);
            }

            iterations += 1;
            if iterations >= max_iterations {
                let assembled = self.assemble(&conversation.messages);
                return self
                    .finish_with_summary(&mut conversation, conversation_id, assembled, tool_calls_made, iterations)
                    .await;
            }
        }
    }

    async fn finish_with_summary(
        &self,
        conversation: &mut Conversation,
        conversation_id: Uuid,
        assembled: Vec<Message>,
        tool_calls_made: Vec<String>,
        iterations: usize,
    ) -> Result<AgentResponse> {
        match self.llm.chat(&assembled, &[]).await {
            Ok(reply) => Ok(self.finalize(conversation, conversation_id, reply, tool_calls_made, iterations, "max_iterations")),
            Err(CoreError::LLMUnavailable(reason)) => {
                Ok(self.graceful_fallback(conversation, conversation_id, &reason, tool_calls_made, iterations))
            }
            Err(e) => Err(e),
        }
    }

    fn finalize(
        &self,
        conversation: &mut Conversation,
        conversation_id: Uuid,
        reply: ChatReply,
        tool_calls_made: Vec<String>,
        iterations: usize,
        stop_reason: &'static str,
    ) -> AgentResponse {
        let answer = reply.assistant_text.unwrap_or_else(|| "(no answer produced)".to_string());
        conversation.messages.push(Message::assistant(answer.clone()));
        self.conversations.trim(&mut conversation.messages);
        AgentResponse { answer, conversation_id, tool_calls_made, iterations, stop_reason }
    }

    fn graceful_fallback(
        &self,
        conversation: &mut Conversation,
        conversation_id: Uuid,
        reason: &str,
        tool_calls_made: Vec<String>,
        iterations: usize,
    ) -> AgentResponse {
        log::error!("LLM unavailable, returning graceful fallback: {reason}");
        let answer = "I couldn't reach the language model to finish answering that. Please try again shortly.".to_string();
        conversation.messages.push(Message::assistant(answer.clone()));
        self.conversations.trim(&mut conversation.messages);
        AgentResponse { answer, conversation_id, tool_calls_made, iterations, stop_reason: "llm_error" }
    }

    #[cfg(test)]
    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmProvider, ToolCall, Usage};
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedProvider {
        calls: AtomicUsize,
        replies: Vec<ChatReply>,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn chat(&self, _messages: &[Message], _tools: &[ToolDeclaration]) -> Result<ChatReply> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.replies.get(i).cloned().unwrap_or(ChatReply {
                assistant_text: Some("fallback".into()),
                tool_calls: vec![],
                usage: Usage::default(),
                stop_reason: StopReason::EndTurn,
            }))
        }
    }

    fn controller_with(replies: Vec<ChatReply>) -> AgentController {
        let config = Config::default();
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let llm = Arc::new(LlmAdapter::with_provider(
            Arc::new(ScriptedProvider { calls: AtomicUsize::new(0), replies }),
            Duration::from_secs(5),
        ));
        AgentController::new(Arc::new(ToolRegistry::new()), store, llm, &config)
    }

    fn tool_call_reply(name: &str, args: Value) -> ChatReply {
        ChatReply {
            assistant_text: None,
            tool_calls: vec![ToolCall { id: "call-1".into(), name: name.into(), arguments_json: args }],
            usage: Usage::default(),
            stop_reason: StopReason::ToolCalls,
        }
    }

    fn final_reply(text: &str) -> ChatReply {
        ChatReply {
            assistant_text: Some(text.into()),
            tool_calls: vec![],
            usage: Usage::default(),
            stop_reason: StopReason::EndTurn,
        }
    }

    #[tokio::test]
    async fn answers_directly_when_no_tool_call_is_made() {
        let controller = controller_with(vec![final_reply("the answer is 42")]);
        let result = controller.process_query("what is the answer?", None, 5).await.unwrap();
        assert_eq!(result.answer, "the answer is 42");
        assert_eq!(result.iterations, 0);
        assert_eq!(result.stop_reason, "final_answer");
    }

    #[tokio::test]
    async fn executes_a_tool_call_then_answers() {
        let controller = controller_with(vec![
            tool_call_reply("get_revenue_by_period", json!({ "start_date": "2024-01-01", "end_date": "2024-03-31" })),
            final_reply("total revenue was 30000"),
        ]);
        let result = controller.process_query("revenue in Q1?", None, 5).await.unwrap();
        assert_eq!(result.tool_calls_made, vec!["get_revenue_by_period"]);
        assert_eq!(result.answer, "total revenue was 30000");
        assert_eq!(result.iterations, 1);
    }

    #[tokio::test]
    async fn zero_max_iterations_forces_immediate_summary_with_no_tools() {
        let controller = controller_with(vec![final_reply("summary without tools")]);
        let result = controller.process_query("anything", None, 0).await.unwrap();
        assert_eq!(result.iterations, 0);
        assert!(result.tool_calls_made.is_empty());
        assert_eq!(result.stop_reason, "max_iterations");
    }

    #[tokio::test]
    async fn iteration_cap_forces_summary_after_one_round() {
        let controller = controller_with(vec![
            tool_call_reply("get_revenue_by_period", json!({ "start_date": "2024-01-01", "end_date": "2024-01-31" })),
            final_reply("forced summary"),
        ]);
        let result = controller.process_query("do three things", None, 1).await.unwrap();
        assert_eq!(result.iterations, 1);
        assert_eq!(result.tool_calls_made.len(), 1);
        assert_eq!(result.stop_reason, "max_iterations");
        assert_eq!(result.answer, "forced summary");
    }

    #[tokio::test]
    async fn reuses_conversation_state_across_calls() {
        let controller = controller_with(vec![final_reply("first"), final_reply("second")]);
        let first = controller.process_query("hi", None, 5).await.unwrap();
        let second = controller
            .process_query("again", Some(first.conversation_id), 5)
            .await
            .unwrap();
        assert_eq!(second.conversation_id, first.conversation_id);
        assert_eq!(controller.conversation_count(), 1);
    }
}
