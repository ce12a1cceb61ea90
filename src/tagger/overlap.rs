//! Variant B: institutional overlap.
//!
//! A refinement pass over contacts whose profile already names a shared
//! employer, school, board or volunteer organization. Both timelines go to
//! the service, which decides per institution whether the tenures
//! overlapped.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::completion::{CompletionRequest, OutputMode};
use crate::config::AnchorProfile;
use crate::intel::{
    label, InstitutionType, OverlapAnalysis, OverlapConfidence, OverlapDepth,
};
use crate::models::Contact;

use super::anchor::{render_anchor, render_contact};
use super::schema::{array, boolean, object, one_of, string};
use super::{structured_call, Outcome, Selection, TaggerDeps, Variant};

const SCHEMA_NAME: &str = "overlap_analysis";

const SYSTEM_PROMPT: &str = "\
You compare the career timelines of the anchor person and one contact.
For each institution both have been part of (employer, school, board or
volunteer organization), report one record.

- contact_period and anchor_period: the years each person was there, as
  written in the input, or \"unknown\".
- temporal_overlap: true only if the two periods actually intersect.
- depth: direct_colleagues when they overlapped in the same team or role
  area, same_organization when they overlapped elsewhere in the
  organization, same_institution when they attended or served at the same
  institution, peripheral for a weak or indirect link.
- confidence: how sure you are the institution is really the same one.

Return an empty list if nothing is genuinely shared.";

pub fn schema() -> Value {
    object(vec![(
        "shared_institutions",
        array(object(vec![
            ("name", string()),
            (
                "institution_type",
                one_of(&[
                    InstitutionType::Employer,
                    InstitutionType::School,
                    InstitutionType::Board,
                    InstitutionType::Volunteer,
                ]),
            ),
            (
                "confidence",
                one_of(&[
                    OverlapConfidence::High,
                    OverlapConfidence::Medium,
                    OverlapConfidence::Low,
                ]),
            ),
            ("contact_period", string()),
            ("anchor_period", string()),
            ("temporal_overlap", boolean()),
            (
                "depth",
                one_of(&[
                    OverlapDepth::DirectColleagues,
                    OverlapDepth::SameOrganization,
                    OverlapDepth::SameInstitution,
                    OverlapDepth::Peripheral,
                ]),
            ),
            ("notes", string()),
        ])),
    )])
}

/// Contact timeline plus the overlap signals found by the profile pass.
pub fn context(contact: &Contact) -> String {
    let mut text = render_contact(contact);
    if let Some(tags) = &contact.ai_tags {
        let p = &tags.relationship_proximity;
        let signals: Vec<String> = [
            ("employers", &p.shared_employers),
            ("schools", &p.shared_schools),
            ("boards", &p.shared_boards),
            ("volunteering", &p.shared_volunteering),
        ]
        .iter()
        .filter(|(_, list)| !list.is_empty())
        .map(|(kind, list)| format!("shared {}: {}", kind, list.join(", ")))
        .collect();
        if !signals.is_empty() {
            text.push_str(&format!("\nSignals from earlier analysis: {}", signals.join("; ")));
        }
    }
    text
}

/// Strongest depth among the records, for the run distribution.
fn strongest(analysis: &OverlapAnalysis) -> String {
    let rank = |d: OverlapDepth| match d {
        OverlapDepth::DirectColleagues => 0,
        OverlapDepth::SameOrganization => 1,
        OverlapDepth::SameInstitution => 2,
        OverlapDepth::Peripheral => 3,
    };
    analysis
        .shared_institutions
        .iter()
        .map(|s| s.depth)
        .min_by_key(|d| rank(*d))
        .map(|d| label(&d))
        .unwrap_or_else(|| "none".to_string())
}

pub struct OverlapTagger {
    deps: TaggerDeps,
    system: String,
    schema: Value,
}

impl OverlapTagger {
    pub fn new(deps: TaggerDeps, anchor: &AnchorProfile) -> Self {
        Self {
            deps,
            system: format!("{}\n\nAnchor person:\n{}", SYSTEM_PROMPT, render_anchor(anchor)),
            schema: schema(),
        }
    }
}

#[async_trait]
impl Variant for OverlapTagger {
    fn job(&self) -> &'static str {
        "tag overlap"
    }

    fn select(&self, contact: &Contact, force: bool) -> Selection {
        let has_signal = contact
            .ai_tags
            .as_ref()
            .map(|t| t.has_overlap_signal())
            .unwrap_or(false);
        if !has_signal || (contact.shared_institutions.is_some() && !force) {
            Selection::Skip
        } else {
            Selection::Process
        }
    }

    async fn process(&self, contact: Contact) -> Result<Outcome> {
        let user = context(&contact);
        let request = CompletionRequest {
            system: &self.system,
            user: &user,
            schema_name: SCHEMA_NAME,
            schema: &self.schema,
            mode: OutputMode::Strict,
        };
        let (analysis, usage) = structured_call::<OverlapAnalysis>(
            self.deps.service.as_ref(),
            &self.deps.retry,
            &request,
        )
        .await?;

        self.deps
            .store
            .write_shared_institutions(contact.id, &analysis.shared_institutions)
            .await
            .context("write shared institutions")?;

        let temporal = analysis
            .shared_institutions
            .iter()
            .any(|s| s.temporal_overlap);
        Ok(Outcome {
            labels: vec![
                ("strongest_depth", strongest(&analysis)),
                ("temporal_overlap", if temporal { "yes" } else { "no" }.to_string()),
            ],
            usage,
        })
    }
}
