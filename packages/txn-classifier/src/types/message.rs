//! Message types handed to the pipeline by ingestion connectors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An email or text message as delivered by an ingestion connector.
///
/// Messages are read-only to the classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Connector-assigned message id (unique per user)
    pub id: String,

    /// Provider thread/conversation id, if any
    #[serde(default)]
    pub thread_id: Option<String>,

    /// Domain part of the sender address (e.g. "redfin.com")
    #[serde(default)]
    pub sender_domain: String,

    #[serde(default)]
    pub subject: String,

    #[serde(default)]
    pub body: String,

    pub sent_at: DateTime<Utc>,

    /// Provider labels and folder hints ("SPAM", "Junk Email", "INBOX", ...)
    #[serde(default)]
    pub labels: Vec<String>,

    #[serde(default)]
    pub attachments: Vec<AttachmentSummary>,
}

/// File name and type of an attachment (content is never read).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentSummary {
    pub filename: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

impl AttachmentSummary {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            mime_type: None,
        }
    }
}

impl Message {
    /// Create a message with the given id, subject and body.
    pub fn new(
        id: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            thread_id: None,
            sender_domain: String::new(),
            subject: subject.into(),
            body: body.into(),
            sent_at,
            labels: Vec::new(),
            attachments: Vec::new(),
        }
    }

    /// Set the thread id.
    pub fn in_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    /// Set the sender domain.
    pub fn from_domain(mut self, domain: impl Into<String>) -> Self {
        self.sender_domain = domain.into().to_lowercase();
        self
    }

    /// Add a provider label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    /// Add an attachment summary.
    pub fn with_attachment(mut self, filename: impl Into<String>) -> Self {
        self.attachments.push(AttachmentSummary::new(filename));
        self
    }

    /// Thread id with blank ids treated as absent.
    pub fn thread_ref(&self) -> Option<&str> {
        self.thread_id
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

/// Grouping key for a thread view.
///
/// Messages without a thread id form a singleton keyed by their own id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ThreadKey {
    Thread(String),
    Singleton(String),
}

impl ThreadKey {
    /// Key for a message.
    pub fn for_message(message: &Message) -> Self {
        match message.thread_ref() {
            Some(thread) => ThreadKey::Thread(thread.to_string()),
            None => ThreadKey::Singleton(message.id.clone()),
        }
    }

    pub fn is_singleton(&self) -> bool {
        matches!(self, ThreadKey::Singleton(_))
    }
}

impl std::fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreadKey::Thread(id) => write!(f, "thread:{}", id),
            ThreadKey::Singleton(id) => write!(f, "message:{}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_thread_id_is_singleton() {
        let msg = Message::new("m1", "s", "b", Utc::now()).in_thread("   ");
        assert_eq!(ThreadKey::for_message(&msg), ThreadKey::Singleton("m1".into()));

        let threaded = Message::new("m2", "s", "b", Utc::now()).in_thread("t-9");
        assert_eq!(ThreadKey::for_message(&threaded), ThreadKey::Thread("t-9".into()));
    }
}
