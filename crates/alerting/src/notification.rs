use uuid::Uuid;

/// Maximum message length accepted by Pushover, in characters
pub const MAX_MESSAGE_CHARS: usize = 1024;

/// Maximum title length accepted by Pushover, in characters
pub const MAX_TITLE_CHARS: usize = 250;

const ELLIPSIS: char = '…';

/// Delivery urgency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Regular delivery
    Normal,
    /// Repeats until acknowledged
    Emergency,
}

impl Priority {
    /// Pushover priority value
    pub const fn as_pushover(self) -> i8 {
        match self {
            Self::Normal => 0,
            Self::Emergency => 2,
        }
    }
}

/// An operator notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Short headline
    pub title: String,
    /// Body text
    pub message: String,
    /// Urgency
    pub priority: Priority,
}

impl Notification {
    /// Normal-priority notification
    pub fn normal(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self { title: title.into(), message: message.into(), priority: Priority::Normal }
    }

    /// Emergency notification
    pub fn emergency(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self { title: title.into(), message: message.into(), priority: Priority::Emergency }
    }

    /// Title and message ready to send: the message carries a trace id line and
    /// both fit the service limits.
    pub fn render(&self, trace_id: Uuid) -> (String, String) {
        let trailer = format!("\n\nTrace: {trace_id}");
        let budget = MAX_MESSAGE_CHARS.saturating_sub(trailer.chars().count());
        let mut message = truncate(&self.message, budget);
        message.push_str(&trailer);
        (truncate(&self.title, MAX_TITLE_CHARS), message)
    }
}

/// Cut `text` to at most `max_chars` characters, marking the cut with an ellipsis.
pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_owned();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push(ELLIPSIS);
    out
}
