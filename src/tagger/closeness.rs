//! Variant C: communication closeness.
//!
//! The comms summary is the entire input. A contact without one (or with
//! zero threads) gets [`ClosenessAssessment::no_history`] written directly,
//! with no service call.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;

use crate::completion::{CompletionRequest, OutputMode};
use crate::intel::{label, Closeness, ClosenessAssessment, Momentum};
use crate::models::{CommsSummary, Contact, TokenUsage};

use super::schema::{object, one_of, string};
use super::{structured_call, Outcome, Selection, TaggerDeps, Variant};

const SCHEMA_NAME: &str = "closeness_assessment";

const SYSTEM_PROMPT: &str = "\
You judge how close the anchor person is to one contact using only their
communication history.

Weigh channels unequally. Private one-to-one channels (SMS, direct messages)
signal more closeness than email, and group or broadcast threads signal the
least. Weigh recency heavily: recent activity matters far more than old
activity. Weigh reciprocity heavily: bidirectional conversations matter more
than one-way messages.

closeness, most to least intimate:
- active_inner_circle: frequent, recent, reciprocal, private channels
- regular_contact: steady recent two-way contact
- occasional: sporadic two-way contact
- dormant: real past relationship, little recent activity
- one_way: messages mostly flow in one direction
- no_history: nothing meaningful on record

momentum: growing, stable, fading or inactive, judged from the trend over
time.";

pub fn schema() -> Value {
    object(vec![
        (
            "closeness",
            one_of(&[
                Closeness::ActiveInnerCircle,
                Closeness::RegularContact,
                Closeness::Occasional,
                Closeness::Dormant,
                Closeness::OneWay,
                Closeness::NoHistory,
            ]),
        ),
        (
            "momentum",
            one_of(&[
                Momentum::Growing,
                Momentum::Stable,
                Momentum::Fading,
                Momentum::Inactive,
            ]),
        ),
        ("reasoning", string()),
    ])
}

fn date_text(date: Option<NaiveDate>) -> String {
    date.map(|d| d.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// The comms summary as prompt text, anchored to `today` for recency.
pub fn context(summary: &CommsSummary, today: NaiveDate) -> String {
    let mut lines = vec![
        format!("Today: {}", today),
        format!(
            "Totals: {} threads, {} messages",
            summary.total_threads, summary.total_messages
        ),
        format!(
            "First contact: {}; last contact: {}",
            date_text(summary.first_contact_date),
            date_text(summary.last_contact_date)
        ),
        format!("Bidirectional threads: {}%", summary.bidirectional_pct),
        format!("Group email threads: {}%", summary.group_thread_pct),
    ];
    if let Some(channel) = &summary.most_recent_channel {
        lines.push(format!("Most recent channel: {}", channel));
    }
    for (channel, s) in &summary.channels {
        let mut line = format!(
            "- {}: {} threads, {} messages, {} to {}, inbound {}, outbound {}, bidirectional {}",
            channel,
            s.threads,
            s.messages,
            date_text(s.first_date),
            date_text(s.last_date),
            s.inbound,
            s.outbound,
            s.bidirectional
        );
        if let Some(groups) = s.group_threads {
            line.push_str(&format!(", group threads {}", groups));
        }
        lines.push(line);
    }
    lines.push(format!("Timeline: {}", summary.chronological_summary));
    lines.join("\n")
}

pub struct ClosenessTagger {
    deps: TaggerDeps,
    schema: Value,
}

impl ClosenessTagger {
    pub fn new(deps: TaggerDeps) -> Self {
        Self {
            deps,
            schema: schema(),
        }
    }

    async fn assess(&self, contact: &Contact) -> Result<(ClosenessAssessment, TokenUsage)> {
        let summary = match &contact.comms_summary {
            Some(s) if s.total_threads > 0 => s,
            _ => return Ok((ClosenessAssessment::no_history(), TokenUsage::default())),
        };
        let user = context(summary, chrono::Utc::now().date_naive());
        let request = CompletionRequest {
            system: SYSTEM_PROMPT,
            user: &user,
            schema_name: SCHEMA_NAME,
            schema: &self.schema,
            mode: OutputMode::Strict,
        };
        let result =
            structured_call(self.deps.service.as_ref(), &self.deps.retry, &request).await?;
        Ok(result)
    }
}

#[async_trait]
impl Variant for ClosenessTagger {
    fn job(&self) -> &'static str {
        "tag closeness"
    }

    fn select(&self, contact: &Contact, force: bool) -> Selection {
        if contact.closeness.is_some() && !force {
            Selection::Skip
        } else {
            Selection::Process
        }
    }

    async fn process(&self, contact: Contact) -> Result<Outcome> {
        let (assessment, usage) = self.assess(&contact).await?;
        self.deps
            .store
            .write_closeness(contact.id, &assessment)
            .await
            .context("write closeness")?;
        Ok(Outcome {
            labels: vec![
                ("closeness", label(&assessment.closeness)),
                ("momentum", label(&assessment.momentum)),
            ],
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::summarize;
    use crate::job::JobOptions;
    use crate::models::{parse_timestamp, Channel, CommunicationThread, Direction};
    use crate::store::{InMemoryStore, Store};
    use crate::tagger::run_variant;
    use crate::tagger::testing::{fast_retry, pool, ScriptedService};
    use std::sync::Arc;

    const ANSWER: &str =
        r#"{"closeness":"regular_contact","momentum":"stable","reasoning":"monthly texts"}"#;

    async fn store_with(ids: &[i64]) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        for &id in ids {
            store
                .upsert_contact(&Contact {
                    id,
                    first_name: format!("C{}", id),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        store
    }

    fn tagger(store: Arc<InMemoryStore>, service: Arc<ScriptedService>) -> ClosenessTagger {
        ClosenessTagger::new(TaggerDeps {
            store,
            service,
            retry: fast_retry(),
        })
    }

    #[tokio::test]
    async fn no_history_without_service_call() {
        let store = store_with(&[1, 2, 3]).await;
        let service = Arc::new(ScriptedService::always(ANSWER));
        let report = run_variant(
            Arc::new(tagger(store.clone(), service.clone())),
            store.clone(),
            &pool(20),
            &JobOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(service.call_count(), 0);
        assert_eq!(report.tally.succeeded, 3);
        assert_eq!(report.tally.distributions["closeness"]["no_history"], 3);
        let c = store.get_contact(2).await.unwrap().unwrap().closeness.unwrap();
        assert_eq!(label(&c.closeness), "no_history");
        assert_eq!(label(&c.momentum), "inactive");
    }

    #[tokio::test]
    async fn summary_goes_to_service() {
        let store = store_with(&[1]).await;
        let threads = vec![CommunicationThread {
            contact_id: 1,
            channel: Channel::Sms,
            direction: Direction::Bidirectional,
            is_group: false,
            message_count: 40,
            first_message_at: parse_timestamp("2024-06-01"),
            last_message_at: parse_timestamp("2025-02-01"),
        }];
        store.write_comms_summary(1, &summarize(&threads)).await.unwrap();

        let service = Arc::new(ScriptedService::always(ANSWER));
        let report = run_variant(
            Arc::new(tagger(store.clone(), service.clone())),
            store.clone(),
            &pool(4),
            &JobOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(service.call_count(), 1);
        assert_eq!(report.tally.distributions["closeness"]["regular_contact"], 1);
        assert!(report.tally.usage.total() > 0);
    }

    #[tokio::test]
    async fn schema_failure_counts_as_error() {
        let store = store_with(&[1]).await;
        let threads = vec![CommunicationThread {
            contact_id: 1,
            channel: Channel::Email,
            direction: Direction::Inbound,
            is_group: false,
            message_count: 1,
            first_message_at: None,
            last_message_at: parse_timestamp("2020-01-01"),
        }];
        store.write_comms_summary(1, &summarize(&threads)).await.unwrap();

        let service = Arc::new(ScriptedService::always(r#"{"closeness":"besties"}"#));
        let report = run_variant(
            Arc::new(tagger(store.clone(), service.clone())),
            store.clone(),
            &pool(4),
            &JobOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(report.tally.errors, 1);
        assert_eq!(service.call_count(), 1);
        assert!(store.get_contact(1).await.unwrap().unwrap().closeness.is_none());
    }

    #[test]
    fn context_lists_channels_and_timeline() {
        let threads = vec![CommunicationThread {
            contact_id: 1,
            channel: Channel::Email,
            direction: Direction::Outbound,
            is_group: true,
            message_count: 3,
            first_message_at: None,
            last_message_at: parse_timestamp("2024-05-05"),
        }];
        let text = context(&summarize(&threads), NaiveDate::from_ymd_opt(2025, 6, 1).unwrap());
        assert!(text.contains("Today: 2025-06-01"));
        assert!(text.contains("- email: 1 threads"));
        assert!(text.contains("group threads 1"));
        assert!(text.contains("Timeline: 1 email in May 2024"));
    }
}
