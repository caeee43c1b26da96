#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppAction {
    // Connection
    Connect,
    Shutdown,

    // Typing
    TypingStarted {
        conversation_id: String,
    },
    TypingStopped {
        conversation_id: String,
    },

    // Unread
    MarkRead {
        conversation_id: String,
    },
    FocusConversation {
        conversation_id: Option<String>,
    },
    RefreshUnread,
}

impl AppAction {
    /// Log-safe action tag.
    pub fn tag(&self) -> &'static str {
        match self {
            // Connection
            AppAction::Connect => "Connect",
            AppAction::Shutdown => "Shutdown",

            // Typing
            AppAction::TypingStarted { .. } => "TypingStarted",
            AppAction::TypingStopped { .. } => "TypingStopped",

            // Unread
            AppAction::MarkRead { .. } => "MarkRead",
            AppAction::FocusConversation { .. } => "FocusConversation",
            AppAction::RefreshUnread => "RefreshUnread",
        }
    }
}
