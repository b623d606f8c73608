//! Chat-wide distributions computed straight from the message projection.

use crate::facts::{percent, round2, MessageKind, PhaseInput};
use crate::metric::{Metric, MetricError};
use chrono::{Datelike, Timelike};
use convo_core::{MetricCategory, MetricValue};
use serde_json::{json, Value};
use std::collections::BTreeMap;

const RECENT_MESSAGE_SAMPLE: usize = 100;
const BURST_SAMPLE: usize = 10;
const WEEKDAYS: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

/// Largest bucket; ties resolve to the lowest key.
fn peak<K: Copy + Ord>(counts: &BTreeMap<K, usize>) -> Option<K> {
    counts
        .iter()
        .fold(None, |best: Option<(K, usize)>, (key, count)| match best {
            Some((_, best_count)) if best_count >= *count => best,
            _ => Some((*key, *count)),
        })
        .map(|(key, _)| key)
}

fn distribution<K: Copy + Ord>(
    counts: &BTreeMap<K, usize>,
    total: usize,
    entry: impl Fn(K, usize, f64) -> Value,
) -> Vec<Value> {
    counts
        .iter()
        .map(|(key, count)| entry(*key, *count, percent(*count, total)))
        .collect()
}

pub struct MessageLengths;

impl Metric for MessageLengths {
    fn name(&self) -> &'static str {
        "message_lengths"
    }

    fn category(&self) -> MetricCategory {
        MetricCategory::Message
    }

    fn compute(&self, input: &PhaseInput) -> Result<Vec<MetricValue>, MetricError> {
        let facts = &input.facts;
        if facts.is_empty() {
            return Ok(Vec::new());
        }

        let total_chars: u64 = facts.iter().map(|fact| u64::from(fact.char_count)).sum();
        let total_words: u64 = facts.iter().map(|fact| u64::from(fact.word_count)).sum();
        let mut by_kind: BTreeMap<&str, usize> = BTreeMap::new();
        for fact in facts.iter() {
            *by_kind.entry(fact.kind.as_str()).or_default() += 1;
        }

        // Gap to the same author's previous message, newest messages first.
        let mut previous_by_author = BTreeMap::new();
        let mut by_time: Vec<_> = facts.iter().collect();
        by_time.sort_by_key(|fact| (fact.ts, fact.message_id));
        let mut recent = Vec::with_capacity(by_time.len());
        for fact in by_time {
            let gap = previous_by_author
                .insert(fact.author_id, fact.ts)
                .map(|previous| round2((fact.ts - previous).num_seconds() as f64 / 60.0));
            recent.push(json!({
                "message_id": fact.message_id,
                "author_id": fact.author_id,
                "chars": fact.char_count,
                "words": fact.word_count,
                "type": fact.kind.as_str(),
                "thread": if fact.is_reply() { "reply" } else { "new_thread" },
                "minutes_since_last": gap,
            }));
        }
        recent.reverse();
        recent.truncate(RECENT_MESSAGE_SAMPLE);

        let count = facts.len() as f64;
        let average_chars = round2(total_chars as f64 / count);
        Ok(vec![MetricValue::chat_wide(
            self.name(),
            average_chars,
            json!({
                "average_chars": average_chars,
                "average_words": round2(total_words as f64 / count),
                "by_type": by_kind,
                "recent": recent,
            }),
        )])
    }
}

pub struct HourlyDistribution;

impl Metric for HourlyDistribution {
    fn name(&self) -> &'static str {
        "hourly_distribution"
    }

    fn category(&self) -> MetricCategory {
        MetricCategory::Message
    }

    fn compute(&self, input: &PhaseInput) -> Result<Vec<MetricValue>, MetricError> {
        let mut hours: BTreeMap<u32, usize> = BTreeMap::new();
        for fact in input.facts.iter() {
            *hours.entry(fact.ts.hour()).or_default() += 1;
        }
        let Some(peak_hour) = peak(&hours) else {
            return Ok(Vec::new());
        };

        let buckets = distribution(&hours, input.facts.len(), |hour, count, share| {
            json!({"hour": hour, "message_count": count, "percentage": share})
        });
        Ok(vec![MetricValue::chat_wide(
            self.name(),
            f64::from(peak_hour),
            json!({"peak_hour": peak_hour, "hours": buckets}),
        )])
    }
}

pub struct WeeklyPattern;

impl Metric for WeeklyPattern {
    fn name(&self) -> &'static str {
        "weekly_pattern"
    }

    fn category(&self) -> MetricCategory {
        MetricCategory::Message
    }

    fn compute(&self, input: &PhaseInput) -> Result<Vec<MetricValue>, MetricError> {
        let mut days: BTreeMap<u32, usize> = BTreeMap::new();
        for fact in input.facts.iter() {
            *days
                .entry(fact.ts.weekday().num_days_from_sunday())
                .or_default() += 1;
        }
        let Some(peak_day) = peak(&days) else {
            return Ok(Vec::new());
        };

        let buckets = distribution(&days, input.facts.len(), |day, count, share| {
            json!({
                "day_of_week": day,
                "day_name": WEEKDAYS[day as usize % 7],
                "message_count": count,
                "percentage": share,
            })
        });
        Ok(vec![MetricValue::chat_wide(
            self.name(),
            f64::from(peak_day),
            json!({"peak_day": WEEKDAYS[peak_day as usize % 7], "days": buckets}),
        )])
    }
}

pub struct MessageTypes;

impl Metric for MessageTypes {
    fn name(&self) -> &'static str {
        "message_types"
    }

    fn category(&self) -> MetricCategory {
        MetricCategory::Message
    }

    fn compute(&self, input: &PhaseInput) -> Result<Vec<MetricValue>, MetricError> {
        let total = input.facts.len();
        if total == 0 {
            return Ok(Vec::new());
        }
        let replies = input.facts.iter().filter(|fact| fact.is_reply()).count();
        let new = total - replies;
        let reply_share = percent(replies, total);

        Ok(vec![MetricValue::chat_wide(
            self.name(),
            reply_share,
            json!({
                "reply": {"count": replies, "percentage": reply_share},
                "new": {"count": new, "percentage": percent(new, total)},
            }),
        )])
    }
}

pub struct QuestionPatterns;

impl Metric for QuestionPatterns {
    fn name(&self) -> &'static str {
        "question_patterns"
    }

    fn category(&self) -> MetricCategory {
        MetricCategory::Message
    }

    fn compute(&self, input: &PhaseInput) -> Result<Vec<MetricValue>, MetricError> {
        let total = input.facts.len();
        if total == 0 {
            return Ok(Vec::new());
        }
        let questions = input.facts.iter().filter(|fact| fact.has_question).count();
        let exclamations = input
            .facts
            .iter()
            .filter(|fact| fact.has_exclamation)
            .count();
        let caps = input.facts.iter().filter(|fact| fact.is_shouting).count();
        let question_rate = percent(questions, total);

        Ok(vec![MetricValue::chat_wide(
            self.name(),
            question_rate,
            json!({
                "questions": questions,
                "exclamations": exclamations,
                "caps_messages": caps,
                "statements": input
                    .facts
                    .iter()
                    .filter(|fact| fact.kind == MessageKind::Statement)
                    .count(),
                "total_messages": total,
                "question_rate": question_rate,
            }),
        )])
    }
}

/// Hours whose message count exceeds the mean by more than two standard
/// deviations.
pub struct MessageVelocity;

impl Metric for MessageVelocity {
    fn name(&self) -> &'static str {
        "message_velocity"
    }

    fn category(&self) -> MetricCategory {
        MetricCategory::Message
    }

    fn compute(&self, input: &PhaseInput) -> Result<Vec<MetricValue>, MetricError> {
        let mut buckets: BTreeMap<String, usize> = BTreeMap::new();
        for fact in input.facts.iter() {
            *buckets
                .entry(fact.ts.format("%Y-%m-%d %H:00:00").to_string())
                .or_default() += 1;
        }
        if buckets.is_empty() {
            return Ok(Vec::new());
        }

        let n = buckets.len() as f64;
        let mean = buckets.values().map(|count| *count as f64).sum::<f64>() / n;
        let variance = buckets
            .values()
            .map(|count| (*count as f64 - mean).powi(2))
            .sum::<f64>()
            / n;
        let threshold = mean + 2.0 * variance.sqrt();

        let mut bursts: Vec<(&String, usize)> = buckets
            .iter()
            .filter(|(_, count)| **count as f64 > threshold)
            .map(|(hour, count)| (hour, *count))
            .collect();
        let burst_hours = bursts.len();
        bursts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        let top: Vec<Value> = bursts
            .into_iter()
            .take(BURST_SAMPLE)
            .map(|(hour, count)| {
                json!({
                    "hour_bucket": hour,
                    "message_count": count,
                    "intensity_ratio": round2(count as f64 / mean),
                })
            })
            .collect();

        Ok(vec![MetricValue::chat_wide(
            self.name(),
            burst_hours as f64,
            json!({
                "average_hourly": round2(mean),
                "burst_threshold": round2(threshold),
                "bursts": top,
            }),
        )])
    }
}
