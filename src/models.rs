//! Core data types flowing through the pipeline.
//!
//! A [`Contact`] carries its source facts plus every derived cache the jobs
//! write (comms summary, intelligence tags, overlap, closeness). Derived
//! fields are `Option`s: absence means "not computed yet", never an error.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::intel::{ClosenessAssessment, IntelligenceProfile, SharedInstitution};
use crate::jsonish::deserialize_loose;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Contact {
    pub id: i64,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub headline: Option<String>,
    /// Free-text "about" section.
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default, deserialize_with = "deserialize_loose")]
    pub employment: Vec<Employment>,
    #[serde(default, deserialize_with = "deserialize_loose")]
    pub education: Vec<Education>,
    #[serde(default, deserialize_with = "deserialize_loose")]
    pub skills: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_loose")]
    pub volunteering: Vec<Volunteering>,

    #[serde(default, deserialize_with = "deserialize_loose")]
    pub comms_summary: Option<CommsSummary>,
    #[serde(default, deserialize_with = "deserialize_loose")]
    pub ai_tags: Option<IntelligenceProfile>,
    #[serde(default, deserialize_with = "deserialize_loose")]
    pub shared_institutions: Option<Vec<SharedInstitution>>,
    #[serde(default)]
    pub closeness: Option<ClosenessAssessment>,
    #[serde(default)]
    pub has_profile_embedding: bool,
}

impl Contact {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name.trim(), self.last_name.trim())
            .trim()
            .to_string()
    }

    /// Text indexed for keyword retrieval: facts plus the qualitative tags
    /// from the intelligence profile.
    pub fn search_text(&self) -> String {
        let mut parts: Vec<String> = vec![self.full_name()];
        for s in [
            &self.headline,
            &self.summary,
            &self.company,
            &self.position,
            &self.city,
            &self.state,
        ]
        .into_iter()
        .flatten()
        {
            parts.push(s.clone());
        }
        for e in &self.employment {
            parts.push(e.company.clone());
            if let Some(t) = &e.title {
                parts.push(t.clone());
            }
        }
        for e in &self.education {
            parts.push(e.school.clone());
            parts.extend(e.degree.iter().cloned());
            parts.extend(e.field_of_study.iter().cloned());
        }
        parts.extend(self.skills.iter().cloned());
        for v in &self.volunteering {
            parts.push(v.organization.clone());
            parts.extend(v.cause.iter().cloned());
        }
        if let Some(tags) = &self.ai_tags {
            let a = &tags.topical_affinity;
            parts.extend(a.topics.iter().cloned());
            parts.extend(a.primary_interests.iter().cloned());
            parts.extend(a.talking_points.iter().cloned());
        }
        parts.retain(|p| !p.trim().is_empty());
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Employment {
    #[serde(alias = "company_name", alias = "organization")]
    pub company: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Education {
    #[serde(alias = "school_name")]
    pub school: String,
    #[serde(default)]
    pub degree: Option<String>,
    #[serde(default, alias = "field")]
    pub field_of_study: Option<String>,
    #[serde(default)]
    pub start_year: Option<String>,
    #[serde(default)]
    pub end_year: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Volunteering {
    #[serde(alias = "company_name")]
    pub organization: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub cause: Option<String>,
}

// ============ Communication threads ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Channel {
    Email,
    Linkedin,
    Sms,
    /// Unknown channel strings land here instead of being dropped.
    Other,
}

impl Channel {
    /// All channels in narrative order.
    pub const ALL: [Channel; 4] = [Channel::Email, Channel::Linkedin, Channel::Sms, Channel::Other];

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "email" | "gmail" | "mail" => Channel::Email,
            "linkedin" | "linkedin_dm" | "linkedin dm" => Channel::Linkedin,
            "sms" | "text" | "imessage" => Channel::Sms,
            _ => Channel::Other,
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Linkedin => "linkedin",
            Channel::Sms => "sms",
            Channel::Other => "other",
        }
    }

    /// Human label for `count` threads on this channel. "SMS" never
    /// pluralizes.
    pub fn label(self, count: usize) -> &'static str {
        let plural = count != 1;
        match (self, plural) {
            (Channel::Email, false) => "email",
            (Channel::Email, true) => "emails",
            (Channel::Linkedin, false) => "LinkedIn DM",
            (Channel::Linkedin, true) => "LinkedIn DMs",
            (Channel::Sms, _) => "SMS",
            (Channel::Other, false) => "other message",
            (Channel::Other, true) => "other messages",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
    Bidirectional,
    Unknown,
}

impl Direction {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "inbound" | "received" => Direction::Inbound,
            "outbound" | "sent" => Direction::Outbound,
            "bidirectional" | "both" => Direction::Bidirectional,
            _ => Direction::Unknown,
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
            Direction::Bidirectional => "bidirectional",
            Direction::Unknown => "unknown",
        }
    }
}

/// One conversation on one channel. Owned by the communication subsystem;
/// this crate only reads them.
#[derive(Debug, Clone)]
pub struct CommunicationThread {
    pub contact_id: i64,
    pub channel: Channel,
    pub direction: Direction,
    pub is_group: bool,
    pub message_count: u32,
    pub first_message_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Parse a stored timestamp. Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` and
/// bare dates; anything else is `None`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

// ============ Comms summary ============

/// Per-contact communication aggregate. Recomputed wholesale on every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommsSummary {
    pub total_threads: u32,
    pub total_messages: u32,
    /// Keyed by channel key; `BTreeMap` keeps serialization stable.
    pub channels: BTreeMap<String, ChannelStats>,
    pub first_contact_date: Option<NaiveDate>,
    pub last_contact_date: Option<NaiveDate>,
    pub bidirectional_pct: f64,
    /// Share of email threads that were group threads.
    pub group_thread_pct: f64,
    pub most_recent_channel: Option<String>,
    pub chronological_summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub threads: u32,
    pub messages: u32,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub inbound: u32,
    pub outbound: u32,
    pub bidirectional: u32,
    /// Only tracked for email.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_threads: Option<u32>,
}

// ============ Service accounting ============

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}
