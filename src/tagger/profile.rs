//! Variant A: the full intelligence profile.
//!
//! Scores five dimensions against the anchor profile. If the strict call
//! fails on the shape of the output (unparseable content, a refusal, or a
//! schema the endpoint rejects), one more attempt is made in plain JSON
//! mode with the schema spelled out in the prompt.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::completion::{CompletionRequest, OutputMode};
use crate::config::AnchorProfile;
use crate::error::{ErrorClass, ServiceError};
use crate::intel::{
    label, AffinityLevel, CapacityTier, IntelligenceProfile, InviteFit, ProspectType,
    ProximityTier,
};
use crate::models::{Contact, TokenUsage};

use super::anchor::{render_anchor, render_contact};
use super::schema::{object, one_of, score, string, string_list};
use super::{structured_call, Outcome, Selection, TaggerDeps, Variant};

const SCHEMA_NAME: &str = "intelligence_profile";

const SYSTEM_PROMPT: &str = "\
You assess one contact in the network of the anchor person described below.
Return JSON that matches the schema exactly.

Be realistic with numeric scores. Most contacts are loose connections and
belong in the lower or middle tiers; reserve high scores for clear, specific
evidence. Be generous only with qualitative fields (topics, interests,
talking points, personalization hooks).

Score bands:
- relationship_proximity: inner_circle 80-100, close 60-79, warm 40-59,
  familiar 25-39, acquaintance 10-24, distant 0-9
- giving_capacity: major_donor 70-100, mid_level 40-69, grassroots 10-39,
  unknown when there is no signal
- topical_affinity: strong 70-100, moderate 40-69, light 15-39, none 0-14
- sales_fit: score 0-100 with the prospect type that best fits
- outreach_context: invite_fit high / medium / low / none

List shared employers, schools, boards and volunteer organizations only when
both people are connected to the same institution.";

/// The strict schema for [`IntelligenceProfile`].
pub fn schema() -> Value {
    object(vec![
        (
            "relationship_proximity",
            object(vec![
                ("score", score()),
                (
                    "tier",
                    one_of(&[
                        ProximityTier::InnerCircle,
                        ProximityTier::Close,
                        ProximityTier::Warm,
                        ProximityTier::Familiar,
                        ProximityTier::Acquaintance,
                        ProximityTier::Distant,
                    ]),
                ),
                ("shared_employers", string_list()),
                ("shared_schools", string_list()),
                ("shared_boards", string_list()),
                ("shared_volunteering", string_list()),
                ("evidence", string_list()),
                ("reasoning", string()),
            ]),
        ),
        (
            "giving_capacity",
            object(vec![
                ("score", score()),
                (
                    "tier",
                    one_of(&[
                        CapacityTier::MajorDonor,
                        CapacityTier::MidLevel,
                        CapacityTier::Grassroots,
                        CapacityTier::Unknown,
                    ]),
                ),
                ("evidence", string_list()),
                ("reasoning", string()),
            ]),
        ),
        (
            "topical_affinity",
            object(vec![
                ("score", score()),
                (
                    "level",
                    one_of(&[
                        AffinityLevel::Strong,
                        AffinityLevel::Moderate,
                        AffinityLevel::Light,
                        AffinityLevel::Unaligned,
                    ]),
                ),
                ("topics", string_list()),
                ("primary_interests", string_list()),
                ("talking_points", string_list()),
                ("evidence", string_list()),
                ("reasoning", string()),
            ]),
        ),
        (
            "sales_fit",
            object(vec![
                ("score", score()),
                (
                    "prospect_type",
                    one_of(&[
                        ProspectType::EnterpriseBuyer,
                        ProspectType::EntryPoint,
                        ProspectType::Champion,
                        ProspectType::Influencer,
                        ProspectType::NotRelevant,
                    ]),
                ),
                ("evidence", string_list()),
                ("reasoning", string()),
            ]),
        ),
        (
            "outreach_context",
            object(vec![
                ("score", score()),
                (
                    "invite_fit",
                    one_of(&[
                        InviteFit::High,
                        InviteFit::Medium,
                        InviteFit::Low,
                        InviteFit::NotAFit,
                    ]),
                ),
                ("personalization_hooks", string_list()),
                ("suggested_opener", string()),
                ("evidence", string_list()),
                ("reasoning", string()),
            ]),
        ),
    ])
}

pub fn system_prompt(anchor: &AnchorProfile) -> String {
    format!("{}\n\nAnchor person:\n{}", SYSTEM_PROMPT, render_anchor(anchor))
}

/// Contact facts plus the communication narrative when one exists.
pub fn context(contact: &Contact) -> String {
    let mut text = render_contact(contact);
    if let Some(summary) = &contact.comms_summary {
        text.push_str(&format!(
            "\nCommunication history: {} threads, {} messages. {}",
            summary.total_threads, summary.total_messages, summary.chronological_summary
        ));
    }
    text
}

fn lax_fallback_applies(err: &ServiceError) -> bool {
    matches!(err.class(), ErrorClass::Schema | ErrorClass::Client)
}

pub struct ProfileTagger {
    deps: TaggerDeps,
    system: String,
    lax_system: String,
    schema: Value,
}

impl ProfileTagger {
    pub fn new(deps: TaggerDeps, anchor: &AnchorProfile) -> Self {
        let schema = schema();
        let system = system_prompt(anchor);
        let lax_system = format!(
            "{}\n\nRespond with a single JSON object following this JSON Schema:\n{}",
            system, schema
        );
        Self {
            deps,
            system,
            lax_system,
            schema,
        }
    }

    async fn request(&self, user: &str) -> Result<(IntelligenceProfile, TokenUsage), ServiceError> {
        let strict = CompletionRequest {
            system: &self.system,
            user,
            schema_name: SCHEMA_NAME,
            schema: &self.schema,
            mode: OutputMode::Strict,
        };
        let service = self.deps.service.as_ref();
        let first = structured_call::<IntelligenceProfile>(service, &self.deps.retry, &strict)
            .await
            .and_then(|(p, usage)| {
                p.validate().map_err(ServiceError::Schema)?;
                Ok((p, usage))
            });
        match first {
            Err(e) if lax_fallback_applies(&e) => {
                debug!(error = %e, "strict profile call failed, retrying in JSON mode");
                let lax = CompletionRequest {
                    system: &self.lax_system,
                    mode: OutputMode::JsonObject,
                    ..strict
                };
                let (p, usage) =
                    structured_call::<IntelligenceProfile>(service, &self.deps.retry, &lax).await?;
                p.validate().map_err(ServiceError::Schema)?;
                Ok((p, usage))
            }
            other => other,
        }
    }
}

#[async_trait]
impl Variant for ProfileTagger {
    fn job(&self) -> &'static str {
        "tag profile"
    }

    fn select(&self, contact: &Contact, force: bool) -> Selection {
        if contact.ai_tags.is_some() && !force {
            Selection::Skip
        } else {
            Selection::Process
        }
    }

    async fn process(&self, contact: Contact) -> Result<Outcome> {
        let (profile, usage) = self.request(&context(&contact)).await?;
        self.deps
            .store
            .write_intelligence(
                contact.id,
                &profile,
                self.deps.service.model_name(),
                Utc::now(),
            )
            .await
            .context("write intelligence profile")?;

        Ok(Outcome {
            labels: vec![
                ("proximity_tier", label(&profile.relationship_proximity.tier)),
                ("capacity_tier", label(&profile.giving_capacity.tier)),
                ("prospect_type", label(&profile.sales_fit.prospect_type)),
                ("invite_fit", label(&profile.outreach_context.invite_fit)),
            ],
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intel::fixtures;
    use crate::job::JobOptions;
    use crate::store::{InMemoryStore, Store};
    use crate::tagger::run_variant;
    use crate::tagger::testing::{fast_retry, pool, ScriptedService};
    use std::sync::Arc;

    fn profile_json(proximity: u8, tier: ProximityTier) -> String {
        serde_json::to_string(&fixtures::profile(proximity, tier)).unwrap()
    }

    async fn setup(service: ScriptedService) -> (Arc<InMemoryStore>, Arc<ScriptedService>, ProfileTagger) {
        let store = Arc::new(InMemoryStore::new());
        store
            .upsert_contact(&Contact {
                id: 1,
                first_name: "Ana".into(),
                last_name: "Lopez".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let service = Arc::new(service);
        let tagger = ProfileTagger::new(
            TaggerDeps {
                store: store.clone(),
                service: service.clone(),
                retry: fast_retry(),
            },
            &AnchorProfile::default(),
        );
        (store, service, tagger)
    }

    #[test]
    fn schema_is_strict_everywhere() {
        let s = schema();
        assert_eq!(s["additionalProperties"], false);
        let prox = &s["properties"]["relationship_proximity"];
        assert_eq!(prox["additionalProperties"], false);
        assert_eq!(prox["required"].as_array().unwrap().len(), 8);
        assert_eq!(prox["properties"]["tier"]["enum"][0], "inner_circle");
    }

    #[tokio::test]
    async fn writes_profile_and_mirrors() {
        let (store, service, tagger) = setup(ScriptedService::always(profile_json(
            64,
            ProximityTier::Close,
        )))
        .await;
        let report = run_variant(
            Arc::new(tagger),
            store.clone(),
            &pool(2),
            &JobOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(report.tally.succeeded, 1);
        assert_eq!(service.call_count(), 1);
        let contact = store.get_contact(1).await.unwrap().unwrap();
        let tags = contact.ai_tags.unwrap();
        let mirrors = store.mirror_columns(1).await.unwrap();
        assert_eq!(mirrors.proximity_score, Some(tags.relationship_proximity.score as i64));
        assert_eq!(mirrors.proximity_tier.as_deref(), Some("close"));
        assert_eq!(report.tally.distributions["proximity_tier"]["close"], 1);
    }

    #[tokio::test]
    async fn unparseable_strict_output_falls_back_to_json_mode_once() {
        let (_store, service, tagger) = setup(ScriptedService::scripted(
            vec![Ok("not json".to_string())],
            profile_json(30, ProximityTier::Familiar),
        ))
        .await;
        let (profile, _) = tagger.request("Name: Ana Lopez").await.unwrap();
        assert_eq!(profile.relationship_proximity.score, 30);
        assert_eq!(
            *service.modes.lock().unwrap(),
            vec![OutputMode::Strict, OutputMode::JsonObject]
        );
    }

    #[tokio::test]
    async fn fallback_failure_is_an_error() {
        let (_store, service, tagger) = setup(ScriptedService::always("{}")).await;
        let err = tagger.request("Name: Ana Lopez").await.unwrap_err();
        assert!(matches!(err, ServiceError::Schema(_)));
        assert_eq!(service.call_count(), 2);
    }

    #[tokio::test]
    async fn out_of_range_score_is_rejected() {
        let (_store, _service, tagger) =
            setup(ScriptedService::always(profile_json(150, ProximityTier::InnerCircle))).await;
        assert!(tagger.request("Name: Ana Lopez").await.is_err());
    }

    #[tokio::test]
    async fn tagged_contacts_skipped_unless_forced() {
        let (store, service, tagger) =
            setup(ScriptedService::always(profile_json(10, ProximityTier::Acquaintance))).await;
        let tagger = Arc::new(tagger);
        run_variant(tagger.clone(), store.clone(), &pool(1), &JobOptions::default())
            .await
            .unwrap();
        let again = run_variant(tagger.clone(), store.clone(), &pool(1), &JobOptions::default())
            .await
            .unwrap();
        assert_eq!(again.tally.skipped, 1);
        assert_eq!(service.call_count(), 1);

        let forced = JobOptions {
            force: true,
            ..Default::default()
        };
        run_variant(tagger, store, &pool(1), &forced).await.unwrap();
        assert_eq!(service.call_count(), 2);
    }
}
