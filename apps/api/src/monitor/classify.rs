//! Rules that turn one inbox message into status evidence.

use crate::models::application::ApplicationStatus;

use super::inbox::{MessageMeta, BASE_KEYWORDS};

const REJECTION: &[&str] = &[
    "regret",
    "unfortunately",
    "not moving forward",
    "not be moving forward",
    "other candidates",
];
const OFFER: &[&str] = &["pleased to offer", "offer letter", "extend an offer", "job offer"];
const INTERVIEW: &[&str] = &["interview", "schedule a call", "schedule time", "next round"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailSignal {
    /// The portal acknowledged the submission.
    Confirmation,
    Status(ApplicationStatus),
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// The message is about this posting: company named in subject, snippet or
/// sender, or the title named in subject or snippet.
fn is_relevant(msg: &MessageMeta, company: &str, title: &str) -> bool {
    let subject = msg.subject.to_lowercase();
    let snippet = msg.snippet.to_lowercase();
    let from = msg.from.to_lowercase();
    let company = company.trim().to_lowercase();
    let title = title.trim().to_lowercase();

    let company_hit = !company.is_empty()
        && (subject.contains(&company)
            || snippet.contains(&company)
            || from.contains(&company)
            || from.contains(&company.replace(' ', "")));
    let title_hit = !title.is_empty() && (subject.contains(&title) || snippet.contains(&title));
    company_hit || title_hit
}

/// Status phrasing wins over a plain acknowledgement; rejection wins over
/// interview ("unfortunately we will not interview...").
pub fn classify(msg: &MessageMeta, company: &str, title: &str) -> Option<EmailSignal> {
    if !is_relevant(msg, company, title) {
        return None;
    }
    let subject = msg.subject.to_lowercase();
    let text = format!("{subject} {}", msg.snippet.to_lowercase());

    if contains_any(&text, REJECTION) {
        return Some(EmailSignal::Status(ApplicationStatus::Rejected));
    }
    if contains_any(&text, OFFER) {
        return Some(EmailSignal::Status(ApplicationStatus::Offer));
    }
    if contains_any(&text, INTERVIEW) {
        return Some(EmailSignal::Status(ApplicationStatus::Interview));
    }
    if contains_any(&subject, &BASE_KEYWORDS) {
        return Some(EmailSignal::Confirmation);
    }
    None
}
