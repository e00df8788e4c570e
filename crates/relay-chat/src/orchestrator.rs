//! The request pipeline: validate, pre-flight balance, context assembly,
//! dispatch.

use std::sync::Arc;

use relay_core::{new_request_id, ErrorKind, RelayError};
use relay_provider::{
    ChatRequest, EventReceiver, Message, MessageRole, ProviderRouter, ToolChoice, ToolDefinition,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::packager::{build_context, render_tool_prompt, truncate_messages};

/// Requests dispatch only when the balance clears this floor.
pub const MIN_DISPATCH_BALANCE: f64 = 0.001;

/// One stored conversation header.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: i64,
    pub owner_id: i64,
    pub model: String,
    pub system_prompt: Option<String>,
    pub created_at_unix_ms: u64,
}

/// One persisted conversational turn. Append-only once inserted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: i64,
    pub role: MessageRole,
    pub content: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
    pub created_at_unix_ms: u64,
}

/// Insert payload for a new turn.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChatMessage {
    pub conversation_id: i64,
    pub role: MessageRole,
    pub content: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `BalanceStatus` values.
pub enum BalanceStatus {
    Active,
    Exhausted,
}

/// External billing contract consumed pre-flight; the core never debits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UserBalance {
    pub balance: f64,
    pub status: BalanceStatus,
}

/// Store failures surfaced to the orchestrator.
#[derive(Debug, Error)]
pub enum ChatStoreError {
    #[error("record not found")]
    NotFound,
    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Narrow persistence contract the orchestrator depends on.
///
/// Implemented by the SQLite store; tests inject in-memory fakes so the
/// pipeline stays hermetic.
pub trait ChatStore: Send + Sync {
    /// Loads the balance, creating a zero-balance row for unseen users.
    fn ensure_user_balance(&self, user_id: i64) -> Result<UserBalance, ChatStoreError>;

    fn get_conversation(&self, conversation_id: i64)
        -> Result<Option<Conversation>, ChatStoreError>;

    /// All turns of a conversation in insertion order.
    fn list_conversation_messages(
        &self,
        conversation_id: i64,
    ) -> Result<Vec<StoredMessage>, ChatStoreError>;

    fn insert_chat_message(&self, message: NewChatMessage)
        -> Result<StoredMessage, ChatStoreError>;
}

/// Inbound send-message call.
#[derive(Debug, Clone)]
pub struct SendMessageRequest {
    pub conversation_id: i64,
    pub user_id: i64,
    pub content: String,
    /// Overrides the conversation model when present.
    pub model: Option<String>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<ToolChoice>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub stop: Option<Vec<String>>,
}

impl SendMessageRequest {
    pub fn new(conversation_id: i64, user_id: i64, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            user_id,
            content: content.into(),
            model: None,
            tools: Vec::new(),
            tool_choice: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
            stop: None,
        }
    }
}

/// Successful dispatch: the persisted user turn plus the live event channel.
#[derive(Debug)]
pub struct SendMessageOutcome {
    pub user_message: StoredMessage,
    pub effective_model: String,
    pub provider: &'static str,
    pub request_id: String,
    pub events: EventReceiver,
}

/// Runs the chat pipeline against an injected store and router.
pub struct ChatOrchestrator {
    store: Arc<dyn ChatStore>,
    router: Arc<ProviderRouter>,
    system_prompt_inject: Option<String>,
    max_input_chars: usize,
}

impl ChatOrchestrator {
    pub fn new(
        store: Arc<dyn ChatStore>,
        router: Arc<ProviderRouter>,
        system_prompt_inject: Option<String>,
        max_input_chars: usize,
    ) -> Self {
        Self {
            store,
            router,
            system_prompt_inject,
            max_input_chars,
        }
    }

    /// §4.8 pipeline. Validation and balance failures happen before any
    /// side effect; the user turn is persisted before dispatch so the
    /// insert strictly precedes every stream event.
    pub async fn send_message(
        &self,
        request: SendMessageRequest,
    ) -> Result<SendMessageOutcome, RelayError> {
        let request_id = new_request_id();

        if request.content.trim().is_empty() {
            return Err(RelayError::new(ErrorKind::BadRequest, "empty message content")
                .with_request_id(request_id));
        }

        let balance = self
            .store
            .ensure_user_balance(request.user_id)
            .map_err(|error| store_error(error, &request_id))?;
        if balance.status == BalanceStatus::Exhausted || balance.balance < MIN_DISPATCH_BALANCE {
            return Err(RelayError::new(
                ErrorKind::InsufficientBalance,
                format!("balance {} below dispatch floor", balance.balance),
            )
            .with_request_id(request_id));
        }

        let conversation = self
            .store
            .get_conversation(request.conversation_id)
            .map_err(|error| store_error(error, &request_id))?
            // A foreign conversation is indistinguishable from a missing one.
            .filter(|conversation| conversation.owner_id == request.user_id)
            .ok_or_else(|| {
                RelayError::new(
                    ErrorKind::ConversationNotFound,
                    format!("conversation {} not visible", request.conversation_id),
                )
                .with_request_id(request_id.clone())
            })?;

        let effective_model = request
            .model
            .clone()
            .unwrap_or_else(|| conversation.model.clone());

        let user_message = self
            .store
            .insert_chat_message(NewChatMessage {
                conversation_id: conversation.id,
                role: MessageRole::User,
                content: request.content.clone(),
                prompt_tokens: 0,
                completion_tokens: 0,
                cost: 0.0,
            })
            .map_err(|error| store_error(error, &request_id))?;

        let history: Vec<Message> = self
            .store
            .list_conversation_messages(conversation.id)
            .map_err(|error| store_error(error, &request_id))?
            .into_iter()
            .map(|turn| Message {
                role: turn.role,
                content: turn.content,
            })
            .collect();

        let mut context = build_context(
            self.system_prompt_inject.as_deref(),
            conversation.system_prompt.as_deref(),
            history,
        );
        context = truncate_messages(context, self.max_input_chars);
        if !request.tools.is_empty() {
            context.push(Message::system(render_tool_prompt(
                &request.tools,
                request.tool_choice.as_ref(),
            )));
        }

        let adapter = self
            .router
            .select(&effective_model)
            .map_err(|error| error.with_request_id(request_id.clone()))?;
        let provider = adapter.name();

        let mut chat_request = ChatRequest::new(effective_model.clone(), context);
        chat_request.tools = request.tools;
        chat_request.tool_choice = request.tool_choice;
        chat_request.max_tokens = request.max_tokens;
        chat_request.temperature = request.temperature;
        chat_request.top_p = request.top_p;
        chat_request.stop = request.stop;
        chat_request.request_id = Some(request_id.clone());

        let events = adapter.chat_completion(chat_request).await?;

        info!(
            request_id,
            user_id = request.user_id,
            provider,
            model = %effective_model,
            "chat dispatched"
        );

        Ok(SendMessageOutcome {
            user_message,
            effective_model,
            provider,
            request_id,
            events,
        })
    }

    /// Writes the assistant turn once its stream finished, costed from the
    /// central price table.
    pub fn persist_assistant_turn(
        &self,
        conversation_id: i64,
        model: &str,
        content: String,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> Result<StoredMessage, RelayError> {
        let cost = relay_pricing::cost(model, prompt_tokens, completion_tokens);
        self.store
            .insert_chat_message(NewChatMessage {
                conversation_id,
                role: MessageRole::Assistant,
                content,
                prompt_tokens,
                completion_tokens,
                cost,
            })
            .map_err(|error| store_error(error, "-"))
    }
}

fn store_error(error: ChatStoreError, request_id: &str) -> RelayError {
    let kind = match error {
        ChatStoreError::NotFound => ErrorKind::ConversationNotFound,
        ChatStoreError::Backend(_) => ErrorKind::UnknownError,
    };
    RelayError::new(kind, error.to_string()).with_request_id(request_id)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use relay_provider::{ModelInfo, ProviderAdapter};
    use relay_stream::StreamEvent;
    use tokio::sync::mpsc;

    use super::*;

    #[derive(Default)]
    struct FakeStore {
        balance: Mutex<Option<UserBalance>>,
        conversation: Mutex<Option<Conversation>>,
        messages: Mutex<Vec<StoredMessage>>,
    }

    impl FakeStore {
        fn with_balance(self, balance: f64) -> Self {
            *self.balance.lock().expect("lock") = Some(UserBalance {
                balance,
                status: BalanceStatus::Active,
            });
            self
        }

        fn with_conversation(self, conversation: Conversation) -> Self {
            *self.conversation.lock().expect("lock") = Some(conversation);
            self
        }

        fn message_count(&self) -> usize {
            self.messages.lock().expect("lock").len()
        }
    }

    impl ChatStore for FakeStore {
        fn ensure_user_balance(&self, _user_id: i64) -> Result<UserBalance, ChatStoreError> {
            Ok(self.balance.lock().expect("lock").unwrap_or(UserBalance {
                balance: 0.0,
                status: BalanceStatus::Active,
            }))
        }

        fn get_conversation(
            &self,
            conversation_id: i64,
        ) -> Result<Option<Conversation>, ChatStoreError> {
            Ok(self
                .conversation
                .lock()
                .expect("lock")
                .clone()
                .filter(|conversation| conversation.id == conversation_id))
        }

        fn list_conversation_messages(
            &self,
            conversation_id: i64,
        ) -> Result<Vec<StoredMessage>, ChatStoreError> {
            Ok(self
                .messages
                .lock()
                .expect("lock")
                .iter()
                .filter(|message| message.conversation_id == conversation_id)
                .cloned()
                .collect())
        }

        fn insert_chat_message(
            &self,
            message: NewChatMessage,
        ) -> Result<StoredMessage, ChatStoreError> {
            let mut messages = self.messages.lock().expect("lock");
            let stored = StoredMessage {
                id: messages.len() as i64 + 1,
                conversation_id: message.conversation_id,
                role: message.role,
                content: message.content,
                prompt_tokens: message.prompt_tokens,
                completion_tokens: message.completion_tokens,
                cost: message.cost,
                created_at_unix_ms: 0,
            };
            messages.push(stored.clone());
            Ok(stored)
        }
    }

    struct ScriptedAdapter;

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn name(&self) -> &'static str {
            "openai"
        }

        fn is_available(&self) -> bool {
            true
        }

        fn supported_models(&self) -> Vec<ModelInfo> {
            Vec::new()
        }

        async fn chat_completion(
            &self,
            _request: ChatRequest,
        ) -> Result<EventReceiver, RelayError> {
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(StreamEvent::Start);
            let _ = tx.send(StreamEvent::content("pong"));
            let _ = tx.send(StreamEvent::Done);
            Ok(rx)
        }
    }

    fn conversation() -> Conversation {
        Conversation {
            id: 7,
            owner_id: 1,
            model: "gpt-4o".to_string(),
            system_prompt: Some("be brief".to_string()),
            created_at_unix_ms: 0,
        }
    }

    fn orchestrator(store: Arc<FakeStore>) -> ChatOrchestrator {
        let router = Arc::new(ProviderRouter::from_adapters(
            vec![Arc::new(ScriptedAdapter)],
            None,
        ));
        ChatOrchestrator::new(store, router, None, 100_000)
    }

    #[tokio::test]
    async fn functional_happy_path_persists_user_turn_then_streams() {
        let store = Arc::new(
            FakeStore::default()
                .with_balance(1.0)
                .with_conversation(conversation()),
        );
        let subject = orchestrator(Arc::clone(&store));

        let outcome = subject
            .send_message(SendMessageRequest::new(7, 1, "ping"))
            .await
            .expect("dispatch");
        assert_eq!(outcome.user_message.role, MessageRole::User);
        assert_eq!(outcome.effective_model, "gpt-4o");
        assert_eq!(store.message_count(), 1);

        let mut rx = outcome.events;
        assert_eq!(rx.recv().await, Some(StreamEvent::Start));
        assert_eq!(rx.recv().await, Some(StreamEvent::content("pong")));
        assert_eq!(rx.recv().await, Some(StreamEvent::Done));
    }

    #[tokio::test]
    async fn regression_balance_block_happens_before_any_side_effect() {
        let store = Arc::new(
            FakeStore::default()
                .with_balance(0.0009)
                .with_conversation(conversation()),
        );
        let subject = orchestrator(Arc::clone(&store));

        let error = subject
            .send_message(SendMessageRequest::new(7, 1, "ping"))
            .await
            .expect_err("blocked");
        assert_eq!(error.kind, ErrorKind::InsufficientBalance);
        assert_eq!(store.message_count(), 0, "no user turn persisted");
    }

    #[tokio::test]
    async fn unit_empty_content_is_rejected_first() {
        let store = Arc::new(FakeStore::default());
        let subject = orchestrator(Arc::clone(&store));
        let error = subject
            .send_message(SendMessageRequest::new(7, 1, "   "))
            .await
            .expect_err("rejected");
        assert_eq!(error.kind, ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn unit_foreign_conversation_reads_as_missing() {
        let store = Arc::new(
            FakeStore::default()
                .with_balance(1.0)
                .with_conversation(Conversation {
                    owner_id: 99,
                    ..conversation()
                }),
        );
        let subject = orchestrator(Arc::clone(&store));
        let error = subject
            .send_message(SendMessageRequest::new(7, 1, "ping"))
            .await
            .expect_err("hidden");
        assert_eq!(error.kind, ErrorKind::ConversationNotFound);
        assert_eq!(store.message_count(), 0);
    }

    #[tokio::test]
    async fn unit_model_override_wins_over_conversation_model() {
        let store = Arc::new(
            FakeStore::default()
                .with_balance(1.0)
                .with_conversation(conversation()),
        );
        let subject = orchestrator(Arc::clone(&store));
        let mut request = SendMessageRequest::new(7, 1, "ping");
        request.model = Some("gpt-4o-mini".to_string());
        let outcome = subject.send_message(request).await.expect("dispatch");
        assert_eq!(outcome.effective_model, "gpt-4o-mini");
    }

    #[test]
    fn persist_assistant_turn_costs_from_the_central_table() {
        let store = Arc::new(
            FakeStore::default()
                .with_balance(1.0)
                .with_conversation(conversation()),
        );
        let subject = orchestrator(Arc::clone(&store));
        let turn = subject
            .persist_assistant_turn(7, "gpt-4o", "pong".to_string(), 5, 4)
            .expect("persist");
        assert!((turn.cost - 5.25e-5).abs() < 1e-12);
        assert_eq!(turn.role, MessageRole::Assistant);
    }
}
