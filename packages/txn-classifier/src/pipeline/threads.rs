//! Thread grouping.
//!
//! Threads are a one-way index from thread key to message ids ordered by
//! `sent_at` (ties broken by id). The first id is the representative; it is
//! the only message analyzed directly.

use std::collections::HashSet;

use indexmap::IndexMap;

use crate::types::message::{Message, ThreadKey};

/// Thread key to ordered message positions in the input slice.
#[derive(Debug, Clone, Default)]
pub struct ThreadIndex {
    threads: IndexMap<ThreadKey, Vec<usize>>,
}

/// Borrowed view of one thread.
#[derive(Debug, Clone)]
pub struct ThreadView<'a> {
    pub key: &'a ThreadKey,
    pub messages: Vec<&'a Message>,
}

impl<'a> ThreadView<'a> {
    pub fn representative(&self) -> &'a Message {
        self.messages[0]
    }

    /// Every message after the representative.
    pub fn siblings(&self) -> &[&'a Message] {
        &self.messages[1..]
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl ThreadIndex {
    /// Group messages by thread key. Duplicate message ids keep the first
    /// occurrence.
    pub fn build(messages: &[Message]) -> Self {
        let mut seen = HashSet::new();
        let mut threads: IndexMap<ThreadKey, Vec<usize>> = IndexMap::new();
        for (position, message) in messages.iter().enumerate() {
            if !seen.insert(message.id.as_str()) {
                continue;
            }
            threads
                .entry(ThreadKey::for_message(message))
                .or_default()
                .push(position);
        }
        for positions in threads.values_mut() {
            positions.sort_by(|a, b| {
                let (a, b) = (&messages[*a], &messages[*b]);
                a.sent_at.cmp(&b.sent_at).then_with(|| a.id.cmp(&b.id))
            });
        }
        Self { threads }
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ThreadKey> {
        self.threads.keys()
    }

    /// Ordered message ids of a thread.
    pub fn message_ids<'a>(&self, key: &ThreadKey, messages: &'a [Message]) -> Vec<&'a str> {
        self.threads
            .get(key)
            .map(|positions| positions.iter().map(|p| messages[*p].id.as_str()).collect())
            .unwrap_or_default()
    }

    /// Views over every thread, in first-seen order.
    pub fn views<'a>(&'a self, messages: &'a [Message]) -> Vec<ThreadView<'a>> {
        self.threads
            .iter()
            .map(|(key, positions)| ThreadView {
                key,
                messages: positions.iter().map(|p| &messages[*p]).collect(),
            })
            .collect()
    }
}
