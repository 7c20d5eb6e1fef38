use crate::messages::Message;
use crate::tools::ToolDefinition;

/// Everything a provider needs for one reasoning call.
#[derive(Clone, Debug, Default)]
pub struct LlmContext {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

impl LlmContext {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Text of the first user message, typically the task or query that opened the conversation.
    pub fn first_user_text(&self) -> Option<&str> {
        self.messages.iter().find_map(|m| match m {
            Message::User { content } => Some(content.as_str()),
            _ => None,
        })
    }

    pub fn last_user_text(&self) -> Option<&str> {
        self.messages.iter().rev().find_map(|m| match m {
            Message::User { content } => Some(content.as_str()),
            _ => None,
        })
    }

    /// Number of tool results already present, used by scripted providers to tell rounds apart.
    pub fn tool_result_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| matches!(m, Message::Tool { .. }))
            .count()
    }
}
