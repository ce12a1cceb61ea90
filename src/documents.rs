//! Plain-text documents submitted for embedding.
//!
//! Each contact gets two: a profile document built from career facts and
//! an interests document built from topical signals. Missing sections are
//! left out entirely, so document length varies widely between contacts.

use crate::models::Contact;

const MAX_EMPLOYMENT: usize = 10;
const MAX_EDUCATION: usize = 3;
const MAX_SKILLS: usize = 20;
const MAX_VOLUNTEERING: usize = 10;
const MAX_INTEREST_SKILLS: usize = 15;
const PROFILE_ABOUT_CHARS: usize = 1000;
const INTERESTS_ABOUT_CHARS: usize = 500;

/// Truncate to `max_chars` characters, marking the cut with "...".
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Career-facts document. Never empty: the name line is always present.
pub fn profile_text(contact: &Contact) -> String {
    let mut lines: Vec<String> = Vec::new();

    let mut name = contact.full_name();
    if name.is_empty() {
        name = format!("Contact {}", contact.id);
    }
    match non_empty(&contact.headline) {
        Some(headline) => lines.push(format!("{} - {}", name, headline)),
        None => lines.push(name),
    }

    match (non_empty(&contact.position), non_empty(&contact.company)) {
        (Some(position), Some(company)) => {
            lines.push(format!("Current role: {} at {}", position, company))
        }
        (Some(position), None) => lines.push(format!("Current role: {}", position)),
        (None, Some(company)) => lines.push(format!("Current company: {}", company)),
        (None, None) => {}
    }

    let jobs: Vec<String> = contact
        .employment
        .iter()
        .filter(|e| !e.company.trim().is_empty())
        .take(MAX_EMPLOYMENT)
        .map(|e| match non_empty(&e.title) {
            Some(title) => format!("{} at {}", title, e.company.trim()),
            None => e.company.trim().to_string(),
        })
        .collect();
    if !jobs.is_empty() {
        lines.push(format!("Experience: {}", jobs.join("; ")));
    }

    let schools: Vec<String> = contact
        .education
        .iter()
        .filter(|e| !e.school.trim().is_empty())
        .take(MAX_EDUCATION)
        .map(|e| {
            let detail: Vec<&str> = [non_empty(&e.degree), non_empty(&e.field_of_study)]
                .into_iter()
                .flatten()
                .collect();
            if detail.is_empty() {
                e.school.trim().to_string()
            } else {
                format!("{} ({})", e.school.trim(), detail.join(", "))
            }
        })
        .collect();
    if !schools.is_empty() {
        lines.push(format!("Education: {}", schools.join("; ")));
    }

    let skills: Vec<&str> = contact
        .skills
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .take(MAX_SKILLS)
        .collect();
    if !skills.is_empty() {
        lines.push(format!("Skills: {}", skills.join(", ")));
    }

    let volunteering = volunteering_entries(contact, MAX_VOLUNTEERING);
    if !volunteering.is_empty() {
        lines.push(format!("Volunteering: {}", volunteering.join("; ")));
    }

    let location: Vec<&str> = [non_empty(&contact.city), non_empty(&contact.state)]
        .into_iter()
        .flatten()
        .collect();
    if !location.is_empty() {
        lines.push(format!("Location: {}", location.join(", ")));
    }

    if let Some(about) = non_empty(&contact.summary) {
        lines.push(format!("About: {}", truncate_chars(about, PROFILE_ABOUT_CHARS)));
    }

    lines.join("\n")
}

fn volunteering_entries(contact: &Contact, max: usize) -> Vec<String> {
    contact
        .volunteering
        .iter()
        .filter(|v| !v.organization.trim().is_empty())
        .take(max)
        .map(|v| match non_empty(&v.role) {
            Some(role) => format!("{} ({})", v.organization.trim(), role),
            None => v.organization.trim().to_string(),
        })
        .collect()
}

/// Topical-signals document. Empty when the contact has no tags, no
/// headline, no about text, no skills and no volunteering.
pub fn interests_text(contact: &Contact) -> String {
    let mut lines: Vec<String> = Vec::new();

    let mut push_list = |label: &str, items: &[String]| {
        let items: Vec<&str> = items
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();
        if !items.is_empty() {
            lines.push(format!("{}: {}", label, items.join(", ")));
        }
    };

    match &contact.ai_tags {
        Some(tags) => {
            let affinity = &tags.topical_affinity;
            push_list("Topics", &affinity.topics);
            push_list("Interests", &affinity.primary_interests);
            push_list("Talking points", &affinity.talking_points);
            push_list(
                "Personalization hooks",
                &tags.outreach_context.personalization_hooks,
            );
        }
        None => {
            let skills: Vec<String> = contact
                .skills
                .iter()
                .take(MAX_INTEREST_SKILLS)
                .cloned()
                .collect();
            push_list("Skills", &skills);
            push_list(
                "Volunteering",
                &volunteering_entries(contact, MAX_VOLUNTEERING),
            );
        }
    }

    if let Some(headline) = non_empty(&contact.headline) {
        lines.push(format!("Headline: {}", headline));
    }
    if let Some(about) = non_empty(&contact.summary) {
        lines.push(format!("About: {}", truncate_chars(about, INTERESTS_ABOUT_CHARS)));
    }

    lines.join("\n")
}
