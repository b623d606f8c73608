//! Conversation-wide summaries. They read the user-phase context when it is
//! published and derive the same aggregates inline otherwise.

use crate::context::UserContext;
use crate::facts::{round2, MessageFact, PhaseInput};
use crate::metric::{Metric, MetricError};
use chrono::Duration;
use convo_core::{MetricCategory, MetricValue};
use serde_json::{json, Value};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};

const WEEK_SAMPLE: usize = 10;

fn user_context(input: &PhaseInput) -> Cow<'_, UserContext> {
    match input.user_context.as_deref() {
        Some(context) => Cow::Borrowed(context),
        None => Cow::Owned(UserContext::derive(&input.facts, None)),
    }
}

fn ratio(numerator: f64, denominator: f64) -> Option<f64> {
    (denominator > 0.0).then(|| round2(numerator / denominator))
}

pub struct ChatHealth;

impl Metric for ChatHealth {
    fn name(&self) -> &'static str {
        "chat_health"
    }

    fn category(&self) -> MetricCategory {
        MetricCategory::Chat
    }

    fn compute(&self, input: &PhaseInput) -> Result<Vec<MetricValue>, MetricError> {
        let context = user_context(input);
        let first = context.users.values().map(|user| user.first_ts).min();
        let last = context.users.values().map(|user| user.last_ts).max();
        let (Some(first), Some(last)) = (first, last) else {
            return Ok(Vec::new());
        };

        let active_users = context.active_users();
        let total_messages = context.total_messages;
        let duration_days = (last - first).num_days();

        Ok(vec![MetricValue::chat_wide(
            self.name(),
            active_users as f64,
            json!({
                "title": input.conversation.title,
                "chat_type": input.conversation.kind,
                "total_members": input.conversation.participants_count,
                "active_users": active_users,
                "total_messages": total_messages,
                "first_message": first.to_rfc3339(),
                "last_message": last.to_rfc3339(),
                "chat_duration_days": duration_days,
                "avg_messages_per_user": ratio(total_messages as f64, active_users as f64),
                "avg_messages_per_day": ratio(total_messages as f64, duration_days as f64),
            }),
        )])
    }
}

#[derive(Default)]
struct WeekStats {
    messages: usize,
    authors: BTreeSet<i64>,
    replies: usize,
}

/// Latest week against the week before it, with weeks starting on Monday.
pub struct GrowthRate;

impl Metric for GrowthRate {
    fn name(&self) -> &'static str {
        "growth_rate"
    }

    fn category(&self) -> MetricCategory {
        MetricCategory::Chat
    }

    fn compute(&self, input: &PhaseInput) -> Result<Vec<MetricValue>, MetricError> {
        let mut weeks: BTreeMap<String, WeekStats> = BTreeMap::new();
        for fact in input.facts.iter() {
            let week = weeks.entry(fact.ts.format("%Y-W%W").to_string()).or_default();
            week.messages += 1;
            week.authors.insert(fact.author_id);
            if fact.is_reply() {
                week.replies += 1;
            }
        }
        if weeks.is_empty() {
            return Ok(Vec::new());
        }

        let mut previous: Option<usize> = None;
        let mut rows = Vec::with_capacity(weeks.len());
        for (label, stats) in &weeks {
            let growth = previous.and_then(|prior| {
                ratio((stats.messages as f64 - prior as f64) * 100.0, prior as f64)
            });
            rows.push(json!({
                "week": label,
                "messages": stats.messages,
                "active_users": stats.authors.len(),
                "replies": stats.replies,
                "prev_week_messages": previous,
                "growth_rate": growth,
            }));
            previous = Some(stats.messages);
        }

        let latest_growth = rows
            .last()
            .and_then(|row| row["growth_rate"].as_f64());
        rows.reverse();
        rows.truncate(WEEK_SAMPLE);

        Ok(vec![MetricValue::chat_wide(
            self.name(),
            latest_growth.unwrap_or(0.0),
            json!({
                "comparable": latest_growth.is_some(),
                "weeks": rows,
            }),
        )])
    }
}

pub struct ParticipationRate;

impl Metric for ParticipationRate {
    fn name(&self) -> &'static str {
        "participation_rate"
    }

    fn category(&self) -> MetricCategory {
        MetricCategory::Chat
    }

    fn compute(&self, input: &PhaseInput) -> Result<Vec<MetricValue>, MetricError> {
        let active_users = user_context(input).active_users();
        let members = input
            .conversation
            .participants_count
            .filter(|count| *count > 0);

        let (value, detail) = match members {
            Some(members) => (
                round2(active_users as f64 * 100.0 / members as f64),
                json!({"active_users": active_users, "participants_count": members}),
            ),
            None => (
                0.0,
                json!({
                    "active_users": active_users,
                    "participants_count": Value::Null,
                    "reason": "participant_count_unknown",
                }),
            ),
        };
        Ok(vec![MetricValue::chat_wide(self.name(), value, detail)])
    }
}

/// Replies that arrive within a day of the message they answer.
pub struct ResponseDynamics;

impl Metric for ResponseDynamics {
    fn name(&self) -> &'static str {
        "response_dynamics"
    }

    fn category(&self) -> MetricCategory {
        MetricCategory::Chat
    }

    fn compute(&self, input: &PhaseInput) -> Result<Vec<MetricValue>, MetricError> {
        let by_id: HashMap<i64, &MessageFact> = input
            .facts
            .iter()
            .map(|fact| (fact.message_id, fact))
            .collect();
        let window = Duration::hours(24);

        let minutes: Vec<f64> = input
            .facts
            .iter()
            .filter_map(|reply| {
                let original = by_id.get(&reply.reply_to_id?)?;
                let elapsed = reply.ts - original.ts;
                (elapsed < window).then(|| elapsed.num_seconds() as f64 / 60.0)
            })
            .collect();

        let total = minutes.len();
        let detail = if total == 0 {
            json!({"total_replies": 0})
        } else {
            let fastest = minutes.iter().copied().fold(f64::INFINITY, f64::min);
            let slowest = minutes.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            json!({
                "total_replies": total,
                "avg_response_minutes": round2(minutes.iter().sum::<f64>() / total as f64),
                "fastest_response": round2(fastest),
                "slowest_response": round2(slowest),
                "quick_replies_under_5min": minutes.iter().filter(|m| **m < 5.0).count(),
                "replies_within_hour": minutes.iter().filter(|m| **m < 60.0).count(),
            })
        };
        Ok(vec![MetricValue::chat_wide(self.name(), total as f64, detail)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MessageContext;
    use crate::facts::{ConversationSnapshot, MessageKind};
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Arc;

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, minute, 0)
            .single()
            .expect("valid timestamp")
    }

    fn fact(message_id: i64, author_id: i64, ts: DateTime<Utc>, reply_to: Option<i64>) -> MessageFact {
        MessageFact {
            message_id,
            author_id,
            ts,
            reply_to_id: reply_to,
            char_count: 5,
            word_count: 1,
            kind: MessageKind::Statement,
            has_question: false,
            has_exclamation: false,
            is_shouting: false,
        }
    }

    fn input(facts: Vec<MessageFact>, participants: Option<i64>) -> PhaseInput {
        PhaseInput::new(
            ConversationSnapshot {
                conversation_id: "conv-1".to_string(),
                participants_count: participants,
                ..ConversationSnapshot::default()
            },
            facts,
        )
    }

    #[test]
    fn response_dynamics_ignores_slow_and_dangling_replies() {
        let facts = vec![
            fact(1, 1, at(2, 9, 0), None),
            fact(2, 2, at(2, 9, 3), Some(1)),
            fact(3, 3, at(2, 10, 30), Some(1)),
            fact(4, 1, at(4, 9, 0), Some(1)),
            fact(5, 2, at(4, 9, 1), Some(42)),
        ];
        let rows = ResponseDynamics.compute(&input(facts, None)).expect("dynamics");
        assert_eq!(rows[0].value, 2.0);
        assert_eq!(rows[0].detail["fastest_response"], json!(3.0));
        assert_eq!(rows[0].detail["slowest_response"], json!(90.0));
        assert_eq!(rows[0].detail["quick_replies_under_5min"], json!(1));
        assert_eq!(rows[0].detail["replies_within_hour"], json!(1));
    }

    #[test]
    fn growth_compares_latest_week_with_previous() {
        // Mon 2 Mar and Mon 9 Mar 2026 start consecutive weeks.
        let mut facts = Vec::new();
        for id in 1..=4 {
            facts.push(fact(id, id, at(3, 12, id as u32), None));
        }
        for id in 5..=10 {
            facts.push(fact(id, id, at(10, 12, id as u32), None));
        }
        let rows = GrowthRate.compute(&input(facts, None)).expect("growth");
        assert_eq!(rows[0].value, 50.0);
        assert_eq!(rows[0].detail["weeks"][0]["prev_week_messages"], json!(4));
    }

    #[test]
    fn participation_without_member_count_is_flagged() {
        let facts = vec![fact(1, 1, at(2, 9, 0), None), fact(2, 2, at(2, 9, 1), None)];
        let unknown = ParticipationRate
            .compute(&input(facts.clone(), None))
            .expect("participation");
        assert_eq!(unknown[0].value, 0.0);
        assert_eq!(unknown[0].detail["reason"], json!("participant_count_unknown"));

        let known = ParticipationRate
            .compute(&input(facts, Some(8)))
            .expect("participation");
        assert_eq!(known[0].value, 25.0);
    }

    #[test]
    fn staged_context_matches_inline_aggregation() {
        let facts = vec![
            fact(1, 1, at(2, 9, 0), None),
            fact(2, 2, at(2, 9, 4), Some(1)),
            fact(3, 1, at(5, 18, 0), None),
            fact(4, 3, at(9, 7, 0), Some(3)),
        ];
        let inline = input(facts.clone(), Some(10));
        let mut staged = inline.clone();
        let messages = MessageContext::derive(&facts);
        staged.user_context = Some(Arc::new(UserContext::derive(&facts, Some(&messages))));
        staged.message_context = Some(Arc::new(messages));

        let metrics: [&dyn Metric; 4] =
            [&ChatHealth, &GrowthRate, &ParticipationRate, &ResponseDynamics];
        for metric in metrics {
            assert_eq!(
                metric.compute(&staged).expect("staged"),
                metric.compute(&inline).expect("inline"),
                "{}",
                metric.name()
            );
        }
    }
}
