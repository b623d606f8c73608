//! One row per user. Aggregates reuse the message-phase tallies when present.

use crate::context::{UserAggregate, UserContext};
use crate::facts::{percent, round2, PhaseInput};
use crate::metric::{Metric, MetricError};
use convo_core::{MetricCategory, MetricValue};
use serde_json::json;
use std::borrow::Cow;

const CONSISTENCY_MIN_SPAN_DAYS: i64 = 7;
const CONTENT_MIN_MESSAGES: usize = 10;

fn user_context(input: &PhaseInput) -> Cow<'_, UserContext> {
    match input.user_context.as_deref() {
        Some(context) => Cow::Borrowed(context),
        None => Cow::Owned(UserContext::derive(
            &input.facts,
            input.message_context.as_deref(),
        )),
    }
}

fn subject(user: &UserAggregate) -> String {
    user.user_id.to_string()
}

pub struct UserActivity;

impl Metric for UserActivity {
    fn name(&self) -> &'static str {
        "user_activity"
    }

    fn category(&self) -> MetricCategory {
        MetricCategory::User
    }

    fn compute(&self, input: &PhaseInput) -> Result<Vec<MetricValue>, MetricError> {
        let context = user_context(input);
        Ok(context
            .users
            .values()
            .map(|user| {
                MetricValue::for_subject(
                    subject(user),
                    self.name(),
                    user.tally.messages as f64,
                    json!({
                        "username": input.usernames.get(&user.user_id),
                        "average_length": round2(user.average_length()),
                        "first_message": user.first_ts.to_rfc3339(),
                        "last_message": user.last_ts.to_rfc3339(),
                        "active_days": user.active_days,
                        "message_share": percent(user.tally.messages, context.total_messages),
                    }),
                )
            })
            .collect())
    }
}

pub(crate) fn engagement_level(percentile: f64) -> &'static str {
    if percentile >= 0.9 {
        "power_user"
    } else if percentile >= 0.75 {
        "active"
    } else if percentile >= 0.5 {
        "regular"
    } else if percentile >= 0.25 {
        "occasional"
    } else {
        "lurker"
    }
}

/// Percent rank of message counts; tied users share the lowest rank.
pub struct UserEngagement;

impl Metric for UserEngagement {
    fn name(&self) -> &'static str {
        "user_engagement"
    }

    fn category(&self) -> MetricCategory {
        MetricCategory::User
    }

    fn compute(&self, input: &PhaseInput) -> Result<Vec<MetricValue>, MetricError> {
        let context = user_context(input);
        let mut counts: Vec<usize> = context
            .users
            .values()
            .map(|user| user.tally.messages)
            .collect();
        counts.sort_unstable();
        let peers = counts.len().saturating_sub(1);

        Ok(context
            .users
            .values()
            .map(|user| {
                let below = counts.partition_point(|count| *count < user.tally.messages);
                let percentile = if peers == 0 {
                    0.0
                } else {
                    below as f64 / peers as f64
                };
                MetricValue::for_subject(
                    subject(user),
                    self.name(),
                    round2(percentile * 100.0),
                    json!({
                        "message_count": user.tally.messages,
                        "engagement_level": engagement_level(percentile),
                    }),
                )
            })
            .collect())
    }
}

pub(crate) fn consistency_level(rate: f64) -> &'static str {
    if rate > 0.5 {
        "highly_consistent"
    } else if rate > 0.25 {
        "regular"
    } else if rate > 0.1 {
        "sporadic"
    } else {
        "rare"
    }
}

/// Only users whose activity spans more than a week.
pub struct UserConsistency;

impl Metric for UserConsistency {
    fn name(&self) -> &'static str {
        "user_consistency"
    }

    fn category(&self) -> MetricCategory {
        MetricCategory::User
    }

    fn compute(&self, input: &PhaseInput) -> Result<Vec<MetricValue>, MetricError> {
        let context = user_context(input);
        Ok(context
            .users
            .values()
            .filter(|user| user.span_days() > CONSISTENCY_MIN_SPAN_DAYS)
            .map(|user| {
                let span = user.span_days();
                let rate = user.active_days as f64 / span as f64;
                MetricValue::for_subject(
                    subject(user),
                    self.name(),
                    round2(rate * 100.0),
                    json!({
                        "active_days": user.active_days,
                        "total_span_days": span,
                        "avg_daily_messages": round2(
                            user.tally.messages as f64 / user.active_days.max(1) as f64
                        ),
                        "consistency_level": consistency_level(rate),
                    }),
                )
            })
            .collect())
    }
}

pub struct UserContentPatterns;

impl Metric for UserContentPatterns {
    fn name(&self) -> &'static str {
        "user_content_patterns"
    }

    fn category(&self) -> MetricCategory {
        MetricCategory::User
    }

    fn compute(&self, input: &PhaseInput) -> Result<Vec<MetricValue>, MetricError> {
        let context = user_context(input);
        Ok(context
            .users
            .values()
            .filter(|user| user.tally.messages > CONTENT_MIN_MESSAGES)
            .map(|user| {
                let tally = &user.tally;
                MetricValue::for_subject(
                    subject(user),
                    self.name(),
                    percent(tally.questions, tally.messages),
                    json!({
                        "total_messages": tally.messages,
                        "questions": tally.questions,
                        "conversation_starters": tally.starters,
                        "replies": tally.replies,
                        "starter_rate": percent(tally.starters, tally.messages),
                    }),
                )
            })
            .collect())
    }
}
