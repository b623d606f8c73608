use crate::facts::{MessageFact, MessageKind};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, BTreeSet};

/// Per-author tallies of classified messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorTally {
    pub messages: usize,
    pub questions: usize,
    pub starters: usize,
    pub replies: usize,
    pub chars: u64,
}

impl AuthorTally {
    fn add(&mut self, fact: &MessageFact) {
        self.messages += 1;
        self.chars += u64::from(fact.char_count);
        if fact.has_question {
            self.questions += 1;
        }
        if fact.is_reply() {
            self.replies += 1;
        } else {
            self.starters += 1;
        }
    }
}

/// Published once the message phase is durable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageContext {
    pub by_author: BTreeMap<i64, AuthorTally>,
    pub kind_counts: BTreeMap<MessageKind, usize>,
}

impl MessageContext {
    pub fn derive(facts: &[MessageFact]) -> Self {
        let mut context = Self::default();
        for fact in facts {
            context.by_author.entry(fact.author_id).or_default().add(fact);
            *context.kind_counts.entry(fact.kind).or_default() += 1;
        }
        context
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAggregate {
    pub user_id: i64,
    pub tally: AuthorTally,
    pub first_ts: DateTime<Utc>,
    pub last_ts: DateTime<Utc>,
    pub active_days: usize,
    pub first_day: NaiveDate,
    pub last_day: NaiveDate,
}

impl UserAggregate {
    /// Calendar days from first to last active day, inclusive.
    pub fn span_days(&self) -> i64 {
        (self.last_day - self.first_day).num_days() + 1
    }

    pub fn average_length(&self) -> f64 {
        if self.tally.messages == 0 {
            return 0.0;
        }
        self.tally.chars as f64 / self.tally.messages as f64
    }
}

/// Published once the user phase is durable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserContext {
    pub users: BTreeMap<i64, UserAggregate>,
    pub total_messages: usize,
}

impl UserContext {
    /// Reuses the message-phase tallies when available; the result is the same
    /// either way.
    pub fn derive(facts: &[MessageFact], messages: Option<&MessageContext>) -> Self {
        let derived;
        let tallies = match messages {
            Some(context) => &context.by_author,
            None => {
                derived = MessageContext::derive(facts);
                &derived.by_author
            }
        };

        let mut days: BTreeMap<i64, BTreeSet<NaiveDate>> = BTreeMap::new();
        let mut bounds: BTreeMap<i64, (DateTime<Utc>, DateTime<Utc>)> = BTreeMap::new();
        for fact in facts {
            days.entry(fact.author_id)
                .or_default()
                .insert(fact.ts.date_naive());
            bounds
                .entry(fact.author_id)
                .and_modify(|(first, last)| {
                    *first = (*first).min(fact.ts);
                    *last = (*last).max(fact.ts);
                })
                .or_insert((fact.ts, fact.ts));
        }

        let users = bounds
            .into_iter()
            .filter_map(|(user_id, (first_ts, last_ts))| {
                let active = days.get(&user_id)?;
                Some((
                    user_id,
                    UserAggregate {
                        user_id,
                        tally: tallies.get(&user_id).cloned().unwrap_or_default(),
                        first_ts,
                        last_ts,
                        active_days: active.len(),
                        first_day: *active.first()?,
                        last_day: *active.last()?,
                    },
                ))
            })
            .collect();

        Self {
            users,
            total_messages: facts.len(),
        }
    }

    pub fn active_users(&self) -> usize {
        self.users.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn fact(message_id: i64, author_id: i64, day: i64, question: bool, reply: bool) -> MessageFact {
        MessageFact {
            message_id,
            author_id,
            ts: Utc
                .with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
                .single()
                .expect("valid timestamp")
                + Duration::days(day),
            reply_to_id: reply.then_some(message_id - 1),
            char_count: 10,
            word_count: 2,
            kind: if question {
                MessageKind::Question
            } else {
                MessageKind::Statement
            },
            has_question: question,
            has_exclamation: false,
            is_shouting: false,
        }
    }

    #[test]
    fn user_context_matches_with_and_without_message_context() {
        let facts = vec![
            fact(1, 1, 0, true, false),
            fact(2, 2, 0, false, true),
            fact(3, 1, 3, false, true),
            fact(4, 1, 9, true, false),
        ];
        let messages = MessageContext::derive(&facts);

        let staged = UserContext::derive(&facts, Some(&messages));
        let inline = UserContext::derive(&facts, None);
        assert_eq!(staged, inline);

        let first = &staged.users[&1];
        assert_eq!(first.tally.messages, 3);
        assert_eq!(first.tally.questions, 2);
        assert_eq!(first.tally.starters, 2);
        assert_eq!(first.active_days, 3);
        assert_eq!(first.span_days(), 10);
        assert_eq!(staged.active_users(), 2);
        assert_eq!(messages.kind_counts[&MessageKind::Question], 2);
    }
}
