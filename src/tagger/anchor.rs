//! Rendering of the anchor profile and contact facts into prompt text.

use crate::config::{AnchorProfile, AnchorTenure};
use crate::models::Contact;

fn period(start: Option<&str>, end: Option<&str>) -> String {
    match (start, end) {
        (Some(s), Some(e)) => format!("{} - {}", s, e),
        (Some(s), None) => format!("{} - present", s),
        (None, Some(e)) => format!("until {}", e),
        (None, None) => "dates unknown".to_string(),
    }
}

fn tenure_line(t: &AnchorTenure) -> String {
    let mut line = t.organization.clone();
    if let Some(title) = &t.title {
        line.push_str(&format!(", {}", title));
    }
    line.push_str(&format!(" ({})", period(t.start.as_deref(), t.end.as_deref())));
    line
}

fn section(out: &mut Vec<String>, heading: &str, items: Vec<String>) {
    if items.is_empty() {
        return;
    }
    out.push(format!("{}:", heading));
    out.extend(items.into_iter().map(|i| format!("- {}", i)));
}

/// The operator's reference profile, with tenure periods.
pub fn render_anchor(anchor: &AnchorProfile) -> String {
    let mut out = vec![format!("Name: {}", anchor.name)];
    if let Some(h) = &anchor.headline {
        out.push(format!("Headline: {}", h));
    }
    if let Some(l) = &anchor.location {
        out.push(format!("Location: {}", l));
    }
    if let Some(s) = &anchor.summary {
        out.push(format!("About: {}", s));
    }
    section(&mut out, "Employment", anchor.employment.iter().map(tenure_line).collect());
    section(&mut out, "Education", anchor.education.iter().map(tenure_line).collect());
    section(&mut out, "Boards", anchor.boards.iter().map(tenure_line).collect());
    section(&mut out, "Volunteering", anchor.volunteering.iter().map(tenure_line).collect());
    out.join("\n")
}

/// A contact's facts with tenure periods, for prompts that compare
/// timelines.
pub fn render_contact(contact: &Contact) -> String {
    let mut out = vec![format!("Name: {}", contact.full_name())];
    if let Some(h) = &contact.headline {
        out.push(format!("Headline: {}", h));
    }
    match (&contact.position, &contact.company) {
        (Some(p), Some(c)) => out.push(format!("Current role: {} at {}", p, c)),
        (None, Some(c)) => out.push(format!("Current company: {}", c)),
        (Some(p), None) => out.push(format!("Current role: {}", p)),
        (None, None) => {}
    }
    let location: Vec<&str> = [contact.city.as_deref(), contact.state.as_deref()]
        .into_iter()
        .flatten()
        .collect();
    if !location.is_empty() {
        out.push(format!("Location: {}", location.join(", ")));
    }
    if let Some(s) = &contact.summary {
        out.push(format!("About: {}", crate::documents::truncate_chars(s, 1500)));
    }

    section(
        &mut out,
        "Employment",
        contact
            .employment
            .iter()
            .map(|e| {
                let mut line = e.company.clone();
                if let Some(t) = &e.title {
                    line.push_str(&format!(", {}", t));
                }
                line.push_str(&format!(
                    " ({})",
                    period(e.start_date.as_deref(), e.end_date.as_deref())
                ));
                line
            })
            .collect(),
    );
    section(
        &mut out,
        "Education",
        contact
            .education
            .iter()
            .map(|e| {
                let detail: Vec<&str> = [e.degree.as_deref(), e.field_of_study.as_deref()]
                    .into_iter()
                    .flatten()
                    .collect();
                let mut line = e.school.clone();
                if !detail.is_empty() {
                    line.push_str(&format!(", {}", detail.join(", ")));
                }
                line.push_str(&format!(
                    " ({})",
                    period(e.start_year.as_deref(), e.end_year.as_deref())
                ));
                line
            })
            .collect(),
    );
    section(&mut out, "Skills", vec![contact.skills.join(", ")].into_iter().filter(|s| !s.is_empty()).collect());
    section(
        &mut out,
        "Volunteering",
        contact
            .volunteering
            .iter()
            .map(|v| {
                let mut line = v.organization.clone();
                if let Some(r) = &v.role {
                    line.push_str(&format!(", {}", r));
                }
                if let Some(c) = &v.cause {
                    line.push_str(&format!(" [{}]", c));
                }
                line
            })
            .collect(),
    );
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Employment;

    #[test]
    fn anchor_lists_tenures_with_periods() {
        let anchor = AnchorProfile {
            name: "Sam Rivera".into(),
            employment: vec![AnchorTenure {
                organization: "Google".into(),
                title: Some("PM".into()),
                start: Some("2012".into()),
                end: None,
            }],
            ..Default::default()
        };
        let text = render_anchor(&anchor);
        assert!(text.starts_with("Name: Sam Rivera"));
        assert!(text.contains("- Google, PM (2012 - present)"));
        assert!(!text.contains("Boards"));
    }

    #[test]
    fn contact_employment_has_periods() {
        let contact = Contact {
            id: 1,
            first_name: "Jo".into(),
            employment: vec![Employment {
                company: "Google".into(),
                title: None,
                start_date: Some("2010".into()),
                end_date: Some("2014".into()),
            }],
            ..Default::default()
        };
        let text = render_contact(&contact);
        assert!(text.contains("- Google (2010 - 2014)"));
        assert!(!text.contains("Skills"));
    }
}
