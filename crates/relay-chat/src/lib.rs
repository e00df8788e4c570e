//! Chat context assembly and orchestration.
//!
//! The packager turns stored conversation state into a provider-ready
//! request (budget truncation, system injection, in-band tool protocol);
//! the orchestrator runs the §4.8 request pipeline against an injected
//! store and router.

mod orchestrator;
mod packager;

pub use orchestrator::{
    BalanceStatus, ChatOrchestrator, ChatStore, ChatStoreError, Conversation, NewChatMessage,
    SendMessageOutcome, SendMessageRequest, StoredMessage, UserBalance, MIN_DISPATCH_BALANCE,
};
pub use packager::{
    build_context, parse_tool_call, render_tool_prompt, truncate_messages, ParsedToolCall,
    ToolCallError, TOOL_CALL_CLOSE, TOOL_CALL_OPEN,
};
