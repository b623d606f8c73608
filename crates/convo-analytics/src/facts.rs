//! Compact projection of committed messages. Text is classified once while
//! loading and then dropped.

use crate::context::{MessageContext, UserContext};
use chrono::{DateTime, Utc};
use convo_core::MessageId;
use convo_storage::{ChatStore, StorageError, StoredConversation, StoredMessage};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    Question,
    Exclamation,
    Shouting,
    Statement,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Question => "question",
            MessageKind::Exclamation => "exclamation",
            MessageKind::Shouting => "shouting",
            MessageKind::Statement => "statement",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFact {
    pub message_id: MessageId,
    pub author_id: i64,
    pub ts: DateTime<Utc>,
    pub reply_to_id: Option<MessageId>,
    pub char_count: u32,
    pub word_count: u32,
    pub kind: MessageKind,
    pub has_question: bool,
    pub has_exclamation: bool,
    pub is_shouting: bool,
}

impl MessageFact {
    pub fn from_message(message: &StoredMessage) -> Self {
        let text = message.text.as_str();
        let char_count = text.chars().count();
        let has_question = text.contains('?');
        let has_exclamation = text.contains('!');
        let is_shouting = char_count > 5
            && text.chars().any(char::is_alphabetic)
            && text == text.to_uppercase();

        let kind = if has_question {
            MessageKind::Question
        } else if has_exclamation {
            MessageKind::Exclamation
        } else if is_shouting {
            MessageKind::Shouting
        } else {
            MessageKind::Statement
        };

        Self {
            message_id: message.message_id,
            author_id: message.author_id,
            ts: message.ts,
            reply_to_id: message.reply_to_id,
            char_count: u32::try_from(char_count).unwrap_or(u32::MAX),
            word_count: u32::try_from(text.split_whitespace().count()).unwrap_or(u32::MAX),
            kind,
            has_question,
            has_exclamation,
            is_shouting,
        }
    }

    pub fn is_reply(&self) -> bool {
        self.reply_to_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConversationSnapshot {
    pub conversation_id: String,
    pub title: Option<String>,
    pub kind: Option<String>,
    pub participants_count: Option<i64>,
}

impl ConversationSnapshot {
    fn from_stored(conversation_id: &str, stored: Option<StoredConversation>) -> Self {
        match stored {
            Some(stored) => Self {
                conversation_id: stored.conversation_id,
                title: stored.title,
                kind: stored.kind,
                participants_count: stored.participants_count,
            },
            None => Self {
                conversation_id: conversation_id.to_string(),
                ..Self::default()
            },
        }
    }
}

/// Everything a metric may read. Cloning is cheap; contexts are filled in as
/// earlier phases finish.
#[derive(Debug, Clone, Default)]
pub struct PhaseInput {
    pub conversation: ConversationSnapshot,
    /// Ordered by message id.
    pub facts: Arc<[MessageFact]>,
    /// Usernames from the store, when known.
    pub usernames: Arc<BTreeMap<i64, String>>,
    pub message_context: Option<Arc<MessageContext>>,
    pub user_context: Option<Arc<UserContext>>,
}

impl PhaseInput {
    pub fn new(conversation: ConversationSnapshot, facts: Vec<MessageFact>) -> Self {
        Self {
            conversation,
            facts: facts.into(),
            usernames: Arc::new(BTreeMap::new()),
            message_context: None,
            user_context: None,
        }
    }

    pub fn load(store: &ChatStore, conversation_id: &str) -> Result<Self, StorageError> {
        let conversation =
            ConversationSnapshot::from_stored(conversation_id, store.conversation(conversation_id)?);

        let mut facts = Vec::new();
        store.for_each_message(conversation_id, |message| {
            facts.push(MessageFact::from_message(&message));
        })?;

        let usernames = store
            .users(conversation_id)?
            .into_iter()
            .filter_map(|user| user.username.map(|username| (user.user_id, username)))
            .collect();

        Ok(Self {
            usernames: Arc::new(usernames),
            ..Self::new(conversation, facts)
        })
    }

    pub fn distinct_authors(&self) -> usize {
        let mut authors: Vec<i64> = self.facts.iter().map(|fact| fact.author_id).collect();
        authors.sort_unstable();
        authors.dedup();
        authors.len()
    }
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub(crate) fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    round2(part as f64 * 100.0 / whole as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message(text: &str, reply_to_id: Option<MessageId>) -> StoredMessage {
        StoredMessage {
            conversation_id: "conv-1".to_string(),
            message_id: 1,
            author_id: 7,
            text: text.to_string(),
            ts: Utc
                .with_ymd_and_hms(2026, 4, 2, 8, 30, 0)
                .single()
                .expect("valid timestamp"),
            reply_to_id,
        }
    }

    #[test]
    fn classification_prefers_question_then_exclamation_then_shouting() {
        let cases = [
            ("is it done? yes!", MessageKind::Question),
            ("ship it!", MessageKind::Exclamation),
            ("DEPLOY NOW PLEASE", MessageKind::Shouting),
            ("OK", MessageKind::Statement),
            ("123456789", MessageKind::Statement),
            ("just a note", MessageKind::Statement),
        ];
        for (text, expected) in cases {
            assert_eq!(MessageFact::from_message(&message(text, None)).kind, expected, "{text}");
        }
    }

    #[test]
    fn counts_characters_and_words() {
        let fact = MessageFact::from_message(&message("  héllo   wide world ", Some(3)));
        assert_eq!(fact.char_count, 21);
        assert_eq!(fact.word_count, 3);
        assert!(fact.is_reply());
        assert!(!fact.has_question);
    }

    #[test]
    fn percent_handles_empty_denominator() {
        assert_eq!(percent(1, 3), 33.33);
        assert_eq!(percent(5, 0), 0.0);
    }
}
