//! Field location and questionnaire answering.
//!
//! A control is only typed into when exactly one visible element matches a
//! step of the cascade: exact name/id, label-for, adjacent label,
//! placeholder, then ARIA label.

use std::sync::LazyLock;

use regex::Regex;

use super::page::{LabelStrategy, PageError, PortalPage, Question, QuestionKind};
use super::ProfileBundle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKey {
    FullName,
    FirstName,
    LastName,
    Email,
    Phone,
    LinkedIn,
    Portfolio,
}

impl FieldKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKey::FullName => "full_name",
            FieldKey::FirstName => "first_name",
            FieldKey::LastName => "last_name",
            FieldKey::Email => "email",
            FieldKey::Phone => "phone",
            FieldKey::LinkedIn => "linkedin",
            FieldKey::Portfolio => "portfolio",
        }
    }

    pub fn value(&self, bundle: &ProfileBundle) -> Option<String> {
        let v = match self {
            FieldKey::FullName => Some(bundle.full_name.clone()),
            FieldKey::FirstName => bundle.first_name().map(String::from),
            FieldKey::LastName => bundle.last_name(),
            FieldKey::Email => Some(bundle.email.clone()),
            FieldKey::Phone => bundle.phone.clone(),
            FieldKey::LinkedIn => bundle.linkedin_url.clone(),
            FieldKey::Portfolio => bundle.portfolio_url.clone(),
        };
        v.filter(|s| !s.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub key: FieldKey,
    /// Matched against `name` and `id`.
    pub names: &'static [&'static str],
    /// Visible label, placeholder and ARIA texts.
    pub labels: &'static [&'static str],
    /// Family-specific exact selectors tried first.
    pub css: &'static [&'static str],
}

impl FieldSpec {
    pub const fn new(
        key: FieldKey,
        names: &'static [&'static str],
        labels: &'static [&'static str],
        css: &'static [&'static str],
    ) -> Self {
        Self {
            key,
            names,
            labels,
            css,
        }
    }
}

fn quoted(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Text control whose `name` attribute is exactly `name`.
pub fn by_name(name: &str) -> String {
    let name = quoted(name);
    format!("input:not([type='hidden'])[name=\"{name}\"], textarea[name=\"{name}\"]")
}

pub fn by_id(id: &str) -> String {
    let id = quoted(id);
    format!("input:not([type='hidden'])[id=\"{id}\"], textarea[id=\"{id}\"]")
}

async fn unique(page: &dyn PortalPage, selector: String) -> Result<Option<String>, PageError> {
    Ok((page.count(&selector).await? == 1).then_some(selector))
}

/// Runs the cascade for one field. `None` means no confident match.
pub async fn locate(page: &dyn PortalPage, spec: &FieldSpec) -> Result<Option<String>, PageError> {
    for css in spec.css {
        if let Some(sel) = unique(page, css.to_string()).await? {
            return Ok(Some(sel));
        }
    }
    for name in spec.names {
        for sel in [by_name(name), by_id(name)] {
            if let Some(sel) = unique(page, sel).await? {
                return Ok(Some(sel));
            }
        }
    }
    for strategy in [LabelStrategy::For, LabelStrategy::Sibling] {
        for label in spec.labels {
            if let Some(sel) = page.resolve_label(label, strategy).await? {
                if let Some(sel) = unique(page, sel).await? {
                    return Ok(Some(sel));
                }
            }
        }
    }
    for label in spec.labels {
        let sel = format!("input[placeholder=\"{}\" i], textarea[placeholder=\"{}\" i]", quoted(label), quoted(label));
        if let Some(sel) = unique(page, sel).await? {
            return Ok(Some(sel));
        }
    }
    for label in spec.labels {
        let sel = format!("input[aria-label=\"{}\" i], textarea[aria-label=\"{}\" i]", quoted(label), quoted(label));
        if let Some(sel) = unique(page, sel).await? {
            return Ok(Some(sel));
        }
    }
    Ok(None)
}

// ────────────────────────────────────────────────────────────────────────────
// Questionnaire
// ────────────────────────────────────────────────────────────────────────────

static WORK_AUTHORIZATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(authori[sz]ed to work|legally (authori[sz]ed|eligible|able) to work|right to work|eligible to work)")
        .expect("work authorization pattern is valid")
});

static SPONSORSHIP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)sponsor").expect("sponsorship pattern is valid"));

pub fn normalize(s: &str) -> String {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn yes_no(flag: bool) -> String {
    if flag { "Yes" } else { "No" }.to_string()
}

/// Answer from the candidate's own data, or `None` when there is none.
pub fn answer_for(question: &Question, bundle: &ProfileBundle) -> Option<String> {
    let label = normalize(&question.label);

    let custom = bundle
        .custom_answers
        .iter()
        .map(|(k, v)| (normalize(k), v))
        .filter(|(k, _)| !k.is_empty() && label.contains(k.as_str()))
        .max_by_key(|(k, _)| k.len())
        .map(|(_, v)| v.clone());
    if custom.is_some() {
        return custom;
    }

    if SPONSORSHIP.is_match(&question.label) {
        return Some(yes_no(bundle.requires_sponsorship));
    }
    if WORK_AUTHORIZATION.is_match(&question.label) {
        return Some(yes_no(bundle.work_authorized));
    }
    None
}

/// Picks the option matching `answer`: exact text, then yes/no prefix, then containment.
pub fn match_option<'a>(options: impl IntoIterator<Item = &'a str> + Clone, answer: &str) -> Option<&'a str> {
    let answer = normalize(answer);
    if answer.is_empty() {
        return None;
    }
    if let Some(o) = options.clone().into_iter().find(|o| normalize(o) == answer) {
        return Some(o);
    }
    if answer == "yes" || answer == "no" {
        return options
            .into_iter()
            .find(|o| normalize(o).split(' ').next() == Some(answer.as_str()));
    }
    options.into_iter().find(|o| {
        let o = normalize(o);
        !o.is_empty() && (o.contains(&answer) || answer.contains(&o))
    })
}

/// What to do for one question.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Fill { selector: String, value: String },
    Select { selector: String, option: String },
    Click { selector: String },
}

pub fn plan_answer(question: &Question, bundle: &ProfileBundle) -> Option<Action> {
    let answer = answer_for(question, bundle)?;
    match &question.kind {
        QuestionKind::Text => Some(Action::Fill {
            selector: question.selector.clone(),
            value: answer,
        }),
        QuestionKind::Select { options } => {
            match_option(options.iter().map(String::as_str), &answer).map(|o| Action::Select {
                selector: question.selector.clone(),
                option: o.to_string(),
            })
        }
        QuestionKind::Choice { options } => {
            match_option(options.iter().map(|(text, _)| text.as_str()), &answer).and_then(|text| {
                options
                    .iter()
                    .find(|(t, _)| t == text)
                    .map(|(_, selector)| Action::Click {
                        selector: selector.clone(),
                    })
            })
        }
        QuestionKind::Checkbox => (normalize(&answer) == "yes" || normalize(&answer) == "true")
            .then(|| Action::Click {
                selector: question.selector.clone(),
            }),
    }
}
