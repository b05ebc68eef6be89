use parley_core::messages::Message;

/// Ordered, append-only conversation log.
///
/// The only in-place mutation is [`ContextStore::coalesce_assistant`], which
/// extends a trailing `AssistantText` with a streamed delta.
#[derive(Clone, Debug, Default)]
pub struct ContextStore {
    messages: Vec<Message>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Append `delta` to the last message if it is assistant text.
    /// Returns false (and changes nothing) otherwise.
    pub fn coalesce_assistant(&mut self, delta: &str) -> bool {
        match self.messages.last_mut() {
            Some(Message::AssistantText { content }) => {
                content.push_str(delta);
                true
            }
            _ => false,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::ids::ToolCallId;

    #[test]
    fn coalesce_only_touches_trailing_assistant_text() {
        let mut ctx = ContextStore::new();
        ctx.append(Message::user_text("hi"));
        assert!(!ctx.coalesce_assistant("nope"));
        assert_eq!(ctx.len(), 1);

        ctx.append(Message::assistant_text("Hel"));
        assert!(ctx.coalesce_assistant("lo"));
        assert_eq!(ctx.last(), Some(&Message::assistant_text("Hello")));

        ctx.append(Message::tool_output(ToolCallId::from_raw("call_1"), "t", "out"));
        assert!(!ctx.coalesce_assistant("x"));
        assert_eq!(ctx.messages()[1], Message::assistant_text("Hello"));
    }

    #[test]
    fn snapshot_is_detached() {
        let mut ctx = ContextStore::new();
        ctx.append(Message::user_text("a"));
        let snap = ctx.snapshot();
        ctx.append(Message::user_text("b"));
        assert_eq!(snap.len(), 1);
        assert_eq!(ctx.into_messages().len(), 2);
    }
}
