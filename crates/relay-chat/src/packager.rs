//! Message packaging: truncation, system injection, and the in-band tool
//! protocol.

use relay_core::ids::random_id;
use relay_provider::{Message, MessageRole, ToolChoice, ToolDefinition};
use serde_json::Value;
use thiserror::Error;

pub const TOOL_CALL_OPEN: &str = "<tool_call>";
pub const TOOL_CALL_CLOSE: &str = "</tool_call>";
const TOOL_NAME_OPEN: &str = "<tool_name>";
const TOOL_NAME_CLOSE: &str = "</tool_name>";
const TOOL_INPUT_OPEN: &str = "<tool_input>";
const TOOL_INPUT_CLOSE: &str = "</tool_input>";

/// Truncates `messages` to a character budget.
///
/// A leading system message is kept verbatim; the rest of the budget admits
/// messages from the tail backwards, so the result is the system message
/// plus a contiguous suffix of the remaining history in original order.
pub fn truncate_messages(messages: Vec<Message>, max_chars: usize) -> Vec<Message> {
    let total: usize = messages.iter().map(Message::budget_len).sum();
    if total <= max_chars {
        return messages;
    }

    let mut iter = messages.into_iter();
    let mut kept_system = None;
    let mut rest: Vec<Message> = Vec::new();
    if let Some(first) = iter.next() {
        if first.role == MessageRole::System {
            kept_system = Some(first);
        } else {
            rest.push(first);
        }
    }
    rest.extend(iter);

    let remaining = max_chars.saturating_sub(
        kept_system
            .as_ref()
            .map(Message::budget_len)
            .unwrap_or_default(),
    );

    let mut admitted: Vec<Message> = Vec::new();
    let mut used = 0usize;
    for message in rest.into_iter().rev() {
        let len = message.budget_len();
        if used + len > remaining {
            break;
        }
        used += len;
        admitted.push(message);
    }
    admitted.reverse();

    let mut result = Vec::with_capacity(admitted.len() + 1);
    if let Some(system) = kept_system {
        result.push(system);
    }
    result.extend(admitted);
    result
}

/// Assembles the provider-facing context for one dispatch.
///
/// Order: gateway-level inject, conversation system prompt, then history.
pub fn build_context(
    inject: Option<&str>,
    conversation_system: Option<&str>,
    history: Vec<Message>,
) -> Vec<Message> {
    let mut system_text = String::new();
    if let Some(inject) = inject {
        if !inject.trim().is_empty() {
            system_text.push_str(inject.trim());
        }
    }
    if let Some(prompt) = conversation_system {
        if !prompt.trim().is_empty() {
            if !system_text.is_empty() {
                system_text.push_str("\n\n");
            }
            system_text.push_str(prompt.trim());
        }
    }

    let mut context = Vec::with_capacity(history.len() + 1);
    if !system_text.is_empty() {
        context.push(Message::system(system_text));
    }
    context.extend(history);
    context
}

/// Renders the system section teaching the in-band tool protocol.
///
/// Only called for tool-capable requests; a mandatory tool choice prepends a
/// stronger directive.
pub fn render_tool_prompt(tools: &[ToolDefinition], tool_choice: Option<&ToolChoice>) -> String {
    let mut prompt = String::new();

    match tool_choice {
        Some(ToolChoice::Tool { name }) => {
            prompt.push_str(&format!(
                "You MUST respond by calling the tool `{name}`. Do not answer in plain text.\n\n"
            ));
        }
        Some(choice) if choice.is_mandatory() => {
            prompt.push_str(
                "You MUST respond by calling exactly one of the tools below. \
                 Do not answer in plain text.\n\n",
            );
        }
        _ => {}
    }

    prompt.push_str(
        "You have access to the following tools. To call a tool, reply with exactly one block \
         in this format, with the input as a single JSON object:\n",
    );
    prompt.push_str(
        "<tool_call><tool_name>TOOL_NAME</tool_name><tool_input>{\"arg\": \"value\"}</tool_input></tool_call>\n\n",
    );
    prompt.push_str("Available tools:\n");
    for tool in tools {
        prompt.push_str(&format!(
            "- {}: {}\n  parameters: {}\n",
            tool.name, tool.description, tool.parameters
        ));
    }
    prompt
}

/// A tool invocation recovered from assistant text.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    /// Synthetic id in the `toolu_` namespace.
    pub id: String,
    pub name: String,
    pub input: Value,
    /// Assistant text preceding the call block.
    pub prefix_text: String,
}

/// Failures while scanning assistant text for a tool call.
#[derive(Debug, Error, PartialEq)]
pub enum ToolCallError {
    #[error("tool call block is structurally malformed: {0}")]
    MalformedBlock(&'static str),
    #[error("tool input is not valid JSON: {0}")]
    MalformedInput(String),
}

/// Scans assistant text for the first `<tool_call>` block.
///
/// Returns `None` when no block is present. Text after `</tool_call>` is
/// discarded by contract. Malformed JSON input is an explicit error, never
/// swallowed.
pub fn parse_tool_call(text: &str) -> Result<Option<ParsedToolCall>, ToolCallError> {
    let Some(open) = text.find(TOOL_CALL_OPEN) else {
        return Ok(None);
    };
    let prefix_text = text[..open].to_string();
    let body = &text[open + TOOL_CALL_OPEN.len()..];
    let close = body
        .find(TOOL_CALL_CLOSE)
        .ok_or(ToolCallError::MalformedBlock("missing </tool_call>"))?;
    let block = &body[..close];

    let name = section(block, TOOL_NAME_OPEN, TOOL_NAME_CLOSE)
        .ok_or(ToolCallError::MalformedBlock("missing tool name"))?
        .trim()
        .to_string();
    if name.is_empty() {
        return Err(ToolCallError::MalformedBlock("empty tool name"));
    }
    let raw_input = section(block, TOOL_INPUT_OPEN, TOOL_INPUT_CLOSE)
        .ok_or(ToolCallError::MalformedBlock("missing tool input"))?;
    let input: Value = serde_json::from_str(raw_input.trim())
        .map_err(|error| ToolCallError::MalformedInput(error.to_string()))?;

    Ok(Some(ParsedToolCall {
        id: format!("toolu_{}", random_id(24)),
        name,
        input,
        prefix_text,
    }))
}

fn section<'a>(block: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = block.find(open)? + open.len();
    let end = block[start..].find(close)? + start;
    Some(&block[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(role: MessageRole, len: usize) -> Message {
        Message {
            role,
            content: "x".repeat(len),
        }
    }

    #[test]
    fn functional_truncation_keeps_system_and_admits_a_tail_suffix() {
        // Budget 100, system 30, three user turns of 40: only the newest
        // fits the remaining 70.
        let messages = vec![
            message(MessageRole::System, 30),
            message(MessageRole::User, 40),
            message(MessageRole::User, 40),
            message(MessageRole::User, 40),
        ];
        let truncated = truncate_messages(messages, 100);
        assert_eq!(truncated.len(), 2);
        assert_eq!(truncated[0].role, MessageRole::System);
        assert_eq!(truncated[1].role, MessageRole::User);
    }

    #[test]
    fn functional_truncation_admits_two_when_budget_allows() {
        let messages = vec![
            message(MessageRole::System, 30),
            message(MessageRole::User, 40),
            message(MessageRole::User, 40),
            message(MessageRole::User, 30),
        ];
        // Remaining 80 admits the last two turns (30 + 40).
        let truncated = truncate_messages(messages, 110);
        assert_eq!(truncated.len(), 3);
        assert_eq!(truncated[1].budget_len(), 40);
        assert_eq!(truncated[2].budget_len(), 30);
    }

    #[test]
    fn unit_truncation_is_identity_under_budget() {
        let messages = vec![message(MessageRole::User, 10)];
        assert_eq!(truncate_messages(messages.clone(), 100), messages);
    }

    #[test]
    fn regression_oversized_system_is_still_kept_verbatim() {
        let messages = vec![
            message(MessageRole::System, 200),
            message(MessageRole::User, 40),
        ];
        let truncated = truncate_messages(messages, 100);
        assert_eq!(truncated.len(), 1);
        assert_eq!(truncated[0].role, MessageRole::System);
        assert_eq!(truncated[0].budget_len(), 200);
    }

    #[test]
    fn build_context_merges_inject_and_conversation_prompt() {
        let context = build_context(
            Some("be safe"),
            Some("be terse"),
            vec![Message::user("hi")],
        );
        assert_eq!(context.len(), 2);
        assert_eq!(context[0].role, MessageRole::System);
        assert_eq!(context[0].content, "be safe\n\nbe terse");
    }

    #[test]
    fn build_context_without_prompts_is_history_only() {
        let context = build_context(None, None, vec![Message::user("hi")]);
        assert_eq!(context.len(), 1);
        assert_eq!(context[0].role, MessageRole::User);
    }

    #[test]
    fn unit_tool_prompt_lists_tools_and_format() {
        let tools = vec![ToolDefinition {
            name: "search".to_string(),
            description: "web search".to_string(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        let prompt = render_tool_prompt(&tools, Some(&ToolChoice::Auto));
        assert!(prompt.contains("<tool_call><tool_name>"));
        assert!(prompt.contains("- search: web search"));
        assert!(!prompt.contains("MUST"));

        let forced = render_tool_prompt(&tools, Some(&ToolChoice::Required));
        assert!(forced.starts_with("You MUST"));

        let named = render_tool_prompt(
            &tools,
            Some(&ToolChoice::Tool {
                name: "search".to_string(),
            }),
        );
        assert!(named.contains("calling the tool `search`"));
    }

    #[test]
    fn functional_tool_call_parses_with_prefix_and_discarded_suffix() {
        let text = "Let me look that up.<tool_call><tool_name>search</tool_name>\
                    <tool_input>{\"q\":\"rust\"}</tool_input></tool_call>trailing noise";
        let parsed = parse_tool_call(text).expect("parse").expect("present");
        assert_eq!(parsed.name, "search");
        assert_eq!(parsed.input, serde_json::json!({"q": "rust"}));
        assert_eq!(parsed.prefix_text, "Let me look that up.");
        assert!(parsed.id.starts_with("toolu_"));
        assert_eq!(parsed.id.len(), "toolu_".len() + 24);
    }

    #[test]
    fn unit_text_without_block_parses_to_none() {
        assert_eq!(parse_tool_call("plain answer"), Ok(None));
    }

    #[test]
    fn regression_malformed_json_input_is_an_explicit_error() {
        let text = "<tool_call><tool_name>search</tool_name>\
                    <tool_input>{not json}</tool_input></tool_call>";
        match parse_tool_call(text) {
            Err(ToolCallError::MalformedInput(_)) => {}
            other => panic!("expected malformed input error, got {other:?}"),
        }
    }

    #[test]
    fn unit_unclosed_block_is_a_structural_error() {
        let text = "<tool_call><tool_name>search</tool_name>";
        assert!(matches!(
            parse_tool_call(text),
            Err(ToolCallError::MalformedBlock(_))
        ));
    }
}
