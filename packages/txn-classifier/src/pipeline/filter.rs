//! Ingestion filter: drop spam and trash before any paid analysis.

use std::collections::HashSet;

use crate::types::message::Message;

/// Built-in junk markers across Gmail, Outlook/Exchange and IMAP providers.
const JUNK_LABELS: &[&str] = &[
    "spam",
    "trash",
    "junk",
    "junk email",
    "junkemail",
    "junk e-mail",
    "bulk",
    "bulk mail",
    "deleted",
    "deleted items",
    "deleteditems",
    "deleted messages",
    "[gmail]/spam",
    "[gmail]/trash",
    "[gmail]/bin",
];

/// Rejects messages whose provider labels mark them as junk.
///
/// Unknown labels never reject (fail open).
#[derive(Debug, Clone)]
pub struct IngestionFilter {
    markers: HashSet<String>,
}

impl Default for IngestionFilter {
    fn default() -> Self {
        Self::new(std::iter::empty::<String>())
    }
}

impl IngestionFilter {
    /// Built-in markers plus deployment-specific extras.
    pub fn new(extra: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        let markers = JUNK_LABELS
            .iter()
            .map(|l| l.to_string())
            .chain(extra.into_iter().map(|l| normalize(l.as_ref())))
            .collect();
        Self { markers }
    }

    /// Whether the message should be short-circuited as junk.
    pub fn is_junk(&self, message: &Message) -> bool {
        message
            .labels
            .iter()
            .any(|label| self.markers.contains(&normalize(label)))
    }

    /// The first junk label on a message, for logging.
    pub fn matched_label<'a>(&self, message: &'a Message) -> Option<&'a str> {
        message
            .labels
            .iter()
            .find(|label| self.markers.contains(&normalize(label)))
            .map(String::as_str)
    }
}

/// Lowercase and strip provider prefixes ("\Junk", "CATEGORY_SPAM").
fn normalize(label: &str) -> String {
    let label = label.trim().to_lowercase();
    let label = label.trim_start_matches('\\');
    let label = label.strip_prefix("category_").unwrap_or(label);
    label.replace('_', " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn with_labels(labels: &[&str]) -> Message {
        labels
            .iter()
            .fold(Message::new("m1", "s", "b", Utc::now()), |m, l| m.with_label(*l))
    }

    #[test]
    fn test_provider_junk_markers() {
        let filter = IngestionFilter::default();
        assert!(filter.is_junk(&with_labels(&["INBOX", "SPAM"])));
        assert!(filter.is_junk(&with_labels(&["Junk Email"])));
        assert!(filter.is_junk(&with_labels(&["\\Junk"])));
        assert!(filter.is_junk(&with_labels(&["\\Trash"])));
        assert!(filter.is_junk(&with_labels(&["[Gmail]/Spam"])));
        assert!(filter.is_junk(&with_labels(&["Deleted Items"])));
    }

    #[test]
    fn test_unknown_labels_fail_open() {
        let filter = IngestionFilter::default();
        assert!(!filter.is_junk(&with_labels(&["INBOX", "CATEGORY_PROMOTIONS", "Closings"])));
        assert!(!filter.is_junk(&with_labels(&[])));
    }

    #[test]
    fn test_extra_markers() {
        let filter = IngestionFilter::new(["Quarantine"]);
        assert!(filter.is_junk(&with_labels(&["quarantine"])));
        assert_eq!(
            filter.matched_label(&with_labels(&["INBOX", "Quarantine"])),
            Some("Quarantine")
        );
    }
}
