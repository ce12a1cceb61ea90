//! Structured intelligence documents produced by the tagger.
//!
//! Every label is a closed enum; a completion whose labels fall outside
//! these sets fails deserialization and is counted as a schema error.
//! Serde names double as the stored label strings, so a denormalized
//! mirror column and the nested document can never disagree on spelling.

use serde::{Deserialize, Serialize};

/// The snake_case label serde writes for a unit enum variant.
pub fn label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

// ============ Variant A: full intelligence profile ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntelligenceProfile {
    pub relationship_proximity: RelationshipProximity,
    pub giving_capacity: GivingCapacity,
    pub topical_affinity: TopicalAffinity,
    pub sales_fit: SalesFit,
    pub outreach_context: OutreachContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipProximity {
    pub score: u8,
    pub tier: ProximityTier,
    pub shared_employers: Vec<String>,
    pub shared_schools: Vec<String>,
    pub shared_boards: Vec<String>,
    pub shared_volunteering: Vec<String>,
    pub evidence: Vec<String>,
    pub reasoning: String,
}

/// Closest first. Score bands: 80-100, 60-79, 40-59, 25-39, 10-24, 0-9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProximityTier {
    InnerCircle,
    Close,
    Warm,
    Familiar,
    Acquaintance,
    Distant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GivingCapacity {
    pub score: u8,
    pub tier: CapacityTier,
    pub evidence: Vec<String>,
    pub reasoning: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityTier {
    MajorDonor,
    MidLevel,
    Grassroots,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicalAffinity {
    pub score: u8,
    pub level: AffinityLevel,
    pub topics: Vec<String>,
    pub primary_interests: Vec<String>,
    pub talking_points: Vec<String>,
    pub evidence: Vec<String>,
    pub reasoning: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffinityLevel {
    Strong,
    Moderate,
    Light,
    #[serde(rename = "none")]
    Unaligned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalesFit {
    pub score: u8,
    pub prospect_type: ProspectType,
    pub evidence: Vec<String>,
    pub reasoning: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProspectType {
    EnterpriseBuyer,
    EntryPoint,
    Champion,
    Influencer,
    NotRelevant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutreachContext {
    pub score: u8,
    pub invite_fit: InviteFit,
    pub personalization_hooks: Vec<String>,
    pub suggested_opener: String,
    pub evidence: Vec<String>,
    pub reasoning: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InviteFit {
    High,
    Medium,
    Low,
    #[serde(rename = "none")]
    NotAFit,
}

/// Flat copies of the profile's key scalars, written in the same UPDATE as
/// the nested document.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileMirrors {
    pub proximity_score: i64,
    pub proximity_tier: String,
    pub capacity_score: i64,
    pub capacity_tier: String,
    pub prospect_score: i64,
    pub prospect_type: String,
    pub invite_fit: String,
}

impl IntelligenceProfile {
    pub fn mirrors(&self) -> ProfileMirrors {
        ProfileMirrors {
            proximity_score: self.relationship_proximity.score as i64,
            proximity_tier: label(&self.relationship_proximity.tier),
            capacity_score: self.giving_capacity.score as i64,
            capacity_tier: label(&self.giving_capacity.tier),
            prospect_score: self.sales_fit.score as i64,
            prospect_type: label(&self.sales_fit.prospect_type),
            invite_fit: label(&self.outreach_context.invite_fit),
        }
    }

    /// Range checks serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        let scores = [
            ("relationship_proximity", self.relationship_proximity.score),
            ("giving_capacity", self.giving_capacity.score),
            ("topical_affinity", self.topical_affinity.score),
            ("sales_fit", self.sales_fit.score),
            ("outreach_context", self.outreach_context.score),
        ];
        for (section, score) in scores {
            if score > 100 {
                return Err(format!("{}.score {} is outside 0-100", section, score));
            }
        }
        Ok(())
    }

    /// True when the profile names at least one shared employer, school,
    /// board, or volunteer organization. Gates the overlap pass.
    pub fn has_overlap_signal(&self) -> bool {
        let p = &self.relationship_proximity;
        [
            &p.shared_employers,
            &p.shared_schools,
            &p.shared_boards,
            &p.shared_volunteering,
        ]
        .iter()
        .any(|list| list.iter().any(|s| !s.trim().is_empty()))
    }
}

// ============ Variant B: institutional overlap ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlapAnalysis {
    pub shared_institutions: Vec<SharedInstitution>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedInstitution {
    pub name: String,
    pub institution_type: InstitutionType,
    pub confidence: OverlapConfidence,
    pub contact_period: String,
    pub anchor_period: String,
    /// Asserted by the completion service from both tenure ranges.
    pub temporal_overlap: bool,
    pub depth: OverlapDepth,
    pub notes: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstitutionType {
    Employer,
    School,
    Board,
    Volunteer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapConfidence {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapDepth {
    DirectColleagues,
    SameOrganization,
    SameInstitution,
    Peripheral,
}

// ============ Variant C: communication closeness ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosenessAssessment {
    pub closeness: Closeness,
    pub momentum: Momentum,
    pub reasoning: String,
}

impl ClosenessAssessment {
    /// The deterministic answer for a contact with no communication history.
    pub fn no_history() -> Self {
        Self {
            closeness: Closeness::NoHistory,
            momentum: Momentum::Inactive,
            reasoning: "No communication history on record.".to_string(),
        }
    }
}

/// Ordered from most to least intimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Closeness {
    ActiveInnerCircle,
    RegularContact,
    Occasional,
    Dormant,
    OneWay,
    NoHistory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Momentum {
    Growing,
    Stable,
    Fading,
    Inactive,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn profile(proximity: u8, tier: ProximityTier) -> IntelligenceProfile {
        IntelligenceProfile {
            relationship_proximity: RelationshipProximity {
                score: proximity,
                tier,
                shared_employers: vec![],
                shared_schools: vec![],
                shared_boards: vec![],
                shared_volunteering: vec![],
                evidence: vec!["connected on LinkedIn".into()],
                reasoning: "thin signal".into(),
            },
            giving_capacity: GivingCapacity {
                score: 30,
                tier: CapacityTier::Grassroots,
                evidence: vec![],
                reasoning: String::new(),
            },
            topical_affinity: TopicalAffinity {
                score: 40,
                level: AffinityLevel::Moderate,
                topics: vec!["outdoor equity".into()],
                primary_interests: vec!["camping".into()],
                talking_points: vec!["recent trip to Yosemite".into()],
                evidence: vec![],
                reasoning: String::new(),
            },
            sales_fit: SalesFit {
                score: 10,
                prospect_type: ProspectType::NotRelevant,
                evidence: vec![],
                reasoning: String::new(),
            },
            outreach_context: OutreachContext {
                score: 20,
                invite_fit: InviteFit::Low,
                personalization_hooks: vec!["both alumni of Cal".into()],
                suggested_opener: "Hi!".into(),
                evidence: vec![],
                reasoning: String::new(),
            },
        }
    }
}
