//! The per-family apply state machine.
//!
//! Every browser call goes through [`Run::act`], which applies the
//! per-action timeout and checks the cancellation token. Once the submit
//! control is about to be clicked the run is "committing": cancellation is
//! ignored from then on so a portal is never left half-submitted.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fields::{self, Action, FieldKey};
use super::page::{PageError, PageFactory, PortalPage};
use super::selectors::FamilySelectors;
use super::{
    captcha, company_domain, confirmation, ApplyError, ApplyErrorKind, ApplyResult, DriverConfig,
    PortalFamily, ProfileBundle, Screenshot, StepRecord,
};
use crate::models::directory::Document;

/// Upper bound on "next page" clicks in multi-page forms.
const MAX_FORM_PAGES: usize = 8;

/// Polls spent waiting for a form marker after the apply click.
const FORM_READY_POLLS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Landed,
    NeedsLogin,
    ReadyToApply,
    OnForm,
    OnUpload,
    OnQuestionnaire,
    OnSubmit,
    OnConfirm,
    Done,
}

impl State {
    fn as_str(&self) -> &'static str {
        match self {
            State::Landed => "landed",
            State::NeedsLogin => "needs_login",
            State::ReadyToApply => "ready_to_apply",
            State::OnForm => "on_form",
            State::OnUpload => "on_upload",
            State::OnQuestionnaire => "on_questionnaire",
            State::OnSubmit => "on_submit",
            State::OnConfirm => "on_confirm",
            State::Done => "done",
        }
    }
}

pub struct PortalDriver {
    pages: Arc<dyn PageFactory>,
    config: DriverConfig,
    cancel: CancellationToken,
}

impl PortalDriver {
    pub fn new(pages: Arc<dyn PageFactory>, config: DriverConfig, cancel: CancellationToken) -> Self {
        Self {
            pages,
            config,
            cancel,
        }
    }

    /// Attempts one submission. Never panics on portal behaviour; every
    /// failure comes back as `ApplyResult::error`.
    pub async fn apply(&self, url: &str, bundle: &ProfileBundle) -> ApplyResult {
        let family = PortalFamily::detect(url);

        if self.cancel.is_cancelled() {
            return ApplyResult::failed(
                family,
                ApplyError::new(ApplyErrorKind::Cancelled, "cancelled before the session opened"),
            );
        }

        info!(%family, url, "Opening portal session");
        let page = match tokio::time::timeout(self.config.action_timeout, self.pages.open()).await {
            Ok(Ok(page)) => page,
            Ok(Err(e)) => {
                return ApplyResult::failed(
                    family,
                    ApplyError::new(ApplyErrorKind::DriverInternal, format!("could not open browser session: {e}")),
                )
            }
            Err(_) => {
                return ApplyResult::failed(
                    family,
                    ApplyError::new(ApplyErrorKind::DriverInternal, "timed out opening browser session"),
                )
            }
        };

        let mut run = Run {
            page: page.as_ref(),
            config: &self.config,
            cancel: &self.cancel,
            family,
            selectors: family.selectors(),
            bundle,
            domain: company_domain(url),
            committing: false,
            submitted: false,
            screenshots: Vec::new(),
            steps: Vec::new(),
        };

        let timed = tokio::time::timeout(self.config.budget, run.execute(url)).await;
        let outcome = match timed {
            Ok(outcome) => outcome,
            Err(_) => Err(ApplyError::new(
                ApplyErrorKind::DriverInternal,
                format!("submission budget of {}s exhausted", self.config.budget.as_secs()),
            )),
        };

        // After the submit click only an explicit portal verdict may fail the
        // attempt; anything else leaves it unverified.
        let outcome = match outcome {
            Err(e) if run.submitted && !matches!(
                e.kind,
                ApplyErrorKind::CaptchaBlocked
                    | ApplyErrorKind::FormFillIncomplete
                    | ApplyErrorKind::UnverifiedSubmission
            ) =>
            {
                Err(ApplyError::new(
                    ApplyErrorKind::UnverifiedSubmission,
                    format!("submitted but could not confirm: {}", e.message),
                ))
            }
            other => other,
        };

        run.screenshot("03-terminal.png").await;
        let final_url = match tokio::time::timeout(self.config.action_timeout, page.current_url()).await {
            Ok(Ok(u)) => Some(u),
            _ => None,
        };
        match tokio::time::timeout(self.config.action_timeout, page.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to close portal session"),
            Err(_) => warn!("Timed out closing portal session"),
        }

        let Run {
            screenshots,
            steps,
            submitted,
            ..
        } = run;

        match outcome {
            Ok(handle) => {
                info!(%family, confirmation = %handle, "Portal submission confirmed");
                ApplyResult {
                    success: true,
                    confirmation: Some(handle),
                    screenshots,
                    error: None,
                    family,
                    final_url,
                    submitted,
                    steps,
                }
            }
            Err(error) => {
                warn!(%family, kind = %error.kind, message = %error.message, "Portal submission failed");
                ApplyResult {
                    success: false,
                    confirmation: None,
                    screenshots,
                    error: Some(error),
                    family,
                    final_url,
                    submitted,
                    steps,
                }
            }
        }
    }
}

impl ApplyResult {
    fn failed(family: PortalFamily, error: ApplyError) -> Self {
        warn!(%family, kind = %error.kind, message = %error.message, "Portal session not started");
        Self {
            success: false,
            confirmation: None,
            screenshots: Vec::new(),
            error: Some(error),
            family,
            final_url: None,
            submitted: false,
            steps: Vec::new(),
        }
    }
}

fn cancelled(during: &str) -> ApplyError {
    ApplyError::new(ApplyErrorKind::Cancelled, format!("cancelled during {during}"))
}

struct Run<'a> {
    page: &'a dyn PortalPage,
    config: &'a DriverConfig,
    cancel: &'a CancellationToken,
    family: PortalFamily,
    selectors: &'static FamilySelectors,
    bundle: &'a ProfileBundle,
    domain: Option<String>,
    committing: bool,
    submitted: bool,
    screenshots: Vec<Screenshot>,
    steps: Vec<StepRecord>,
}

impl<'a> Run<'a> {
    // ── guards ──────────────────────────────────────────────────────────────

    async fn act<T>(
        &self,
        what: &str,
        action: impl Future<Output = Result<T, PageError>>,
    ) -> Result<T, ApplyError> {
        if !self.committing && self.cancel.is_cancelled() {
            return Err(cancelled(what));
        }
        let timed = tokio::time::timeout(self.config.action_timeout, action);
        let result = if self.committing {
            timed.await
        } else {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(cancelled(what)),
                r = timed => r,
            }
        };
        match result {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(PageError::Navigation(m))) => Err(ApplyError::new(
                ApplyErrorKind::NavigationFailed,
                format!("{what}: {m}"),
            )),
            Ok(Err(e)) => Err(ApplyError::new(ApplyErrorKind::DriverInternal, format!("{what}: {e}"))),
            Err(_) => Err(ApplyError::new(
                ApplyErrorKind::DriverInternal,
                format!("{what}: timed out after {}s", self.config.action_timeout.as_secs()),
            )),
        }
    }

    async fn pause(&self, d: Duration) -> Result<(), ApplyError> {
        if self.committing {
            tokio::time::sleep(d).await;
            return Ok(());
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(cancelled("wait")),
            _ = tokio::time::sleep(d) => Ok(()),
        }
    }

    fn enter(&mut self, state: State, detail: impl Into<String>) {
        let detail = detail.into();
        debug!(family = %self.family, state = state.as_str(), %detail, "Portal step");
        self.steps.push(StepRecord {
            state: state.as_str().to_string(),
            detail,
        });
    }

    async fn screenshot(&mut self, name: &str) {
        match tokio::time::timeout(self.config.action_timeout, self.page.screenshot()).await {
            Ok(Ok(png)) => self.screenshots.push(Screenshot {
                name: name.to_string(),
                png: Bytes::from(png),
            }),
            Ok(Err(e)) => warn!(screenshot = name, error = %e, "Screenshot failed"),
            Err(_) => warn!(screenshot = name, "Screenshot timed out"),
        }
    }

    /// First selector in `selectors` with at least one visible match.
    async fn first_present(&self, selectors: &[&'static str]) -> Result<Option<&'static str>, ApplyError> {
        for selector in selectors {
            if self.act("probe", self.page.count(selector)).await? > 0 {
                return Ok(Some(*selector));
            }
        }
        Ok(None)
    }

    async fn wait_for(&self, selectors: &[&'static str], within: Duration) -> Result<Option<&'static str>, ApplyError> {
        let deadline = Instant::now() + within;
        loop {
            if let Some(selector) = self.first_present(selectors).await? {
                return Ok(Some(selector));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            self.pause(self.config.poll_interval).await?;
        }
    }

    async fn click_and_settle(&self, what: &str, selector: &str) -> Result<(), ApplyError> {
        self.act(what, self.page.click(selector)).await?;
        self.act("wait for page", self.page.wait_idle()).await
    }

    // ── states ──────────────────────────────────────────────────────────────

    async fn execute(&mut self, url: &str) -> Result<String, ApplyError> {
        self.enter(State::Landed, url);
        self.act("navigate", self.page.goto(url)).await?;
        self.act("wait for page", self.page.wait_idle()).await?;
        self.screenshot("01-landing.png").await;

        self.authenticate().await?;
        self.open_form().await?;
        self.fill_form().await?;
        self.upload_documents().await?;
        self.answer_questionnaire().await?;
        self.screenshot("02-form-filled.png").await;
        self.submit().await?;
        self.confirm(url).await
    }

    async fn authenticate(&mut self) -> Result<(), ApplyError> {
        if self.first_present(self.selectors.login_form).await?.is_none() {
            return Ok(());
        }
        self.enter(State::NeedsLogin, "login form detected");
        let provider = self.family.provider();
        let bundle = self.bundle;

        if let Some(lease) = bundle.credential_for(provider, self.domain.as_deref()) {
            let missing = |what: &str| ApplyError::new(ApplyErrorKind::AuthRequired, format!("login form has no {what}"));
            let user_field = self.first_present(self.selectors.username).await?.ok_or_else(|| missing("username field"))?;
            let pass_field = self.first_present(self.selectors.password).await?.ok_or_else(|| missing("password field"))?;
            self.act("fill username", self.page.fill(user_field, lease.username())).await?;
            self.act("fill password", self.page.fill(pass_field, lease.password())).await?;
            let button = self.first_present(self.selectors.login_submit).await?.ok_or_else(|| missing("sign-in control"))?;
            self.click_and_settle("sign in", button).await?;

            if self.first_present(self.selectors.login_form).await?.is_some() {
                return Err(ApplyError::new(
                    ApplyErrorKind::AuthRequired,
                    format!("{provider} rejected the stored credentials"),
                ));
            }
            info!(family = %self.family, "Signed in to portal");
            return Ok(());
        }

        if let Some(guest) = self.first_present(self.selectors.guest).await? {
            self.enter(State::NeedsLogin, "continuing as guest");
            return self.click_and_settle("continue as guest", guest).await;
        }

        Err(ApplyError::new(
            ApplyErrorKind::AuthRequired,
            format!("{provider} requires an account and no credentials were provided"),
        ))
    }

    async fn open_form(&mut self) -> Result<(), ApplyError> {
        self.enter(State::ReadyToApply, "looking for apply control");
        if self.first_present(self.selectors.form_ready).await?.is_some() {
            return Ok(());
        }

        let retries = self.config.max_retries.max(1);
        let mut control = None;
        for attempt in 1..=retries {
            if let Some(selector) = self.first_present(self.selectors.apply).await? {
                control = Some(selector);
                break;
            }
            debug!(attempt, "Apply control not visible; scrolling");
            self.act("scroll", self.page.scroll()).await?;
            self.pause(self.config.poll_interval).await?;
        }
        let control = control.ok_or_else(|| {
            ApplyError::new(
                ApplyErrorKind::ApplyControlNotFound,
                format!("no apply control after {retries} attempts"),
            )
        })?;
        self.click_and_settle("click apply", control).await?;

        if let Some(next) = self.first_present(self.selectors.after_apply).await? {
            self.click_and_settle("continue application", next).await?;
        }
        // Some portals only ask for an account after the apply click.
        self.authenticate().await?;

        let within = self.config.poll_interval * FORM_READY_POLLS;
        if self.wait_for(self.selectors.form_ready, within).await?.is_none() {
            debug!(family = %self.family, "No form marker seen; relying on field cascade");
        }
        Ok(())
    }

    async fn fill_known_fields(&self) -> Result<Vec<FieldKey>, ApplyError> {
        let mut filled = Vec::new();
        for spec in self.selectors.fields {
            let Some(value) = spec.key.value(self.bundle) else {
                continue;
            };
            match self.act("locate field", fields::locate(self.page, spec)).await? {
                Some(selector) => {
                    self.act("fill field", self.page.fill(&selector, &value)).await?;
                    filled.push(spec.key);
                }
                None => debug!(field = spec.key.as_str(), "No confident match; leaving untouched"),
            }
        }
        Ok(filled)
    }

    async fn fill_form(&mut self) -> Result<(), ApplyError> {
        self.enter(State::OnForm, "filling contact fields");
        let filled = self.fill_known_fields().await?;
        let has = |key: FieldKey| filled.contains(&key);
        let named = has(FieldKey::FullName)
            || (has(FieldKey::FirstName) && (has(FieldKey::LastName) || self.bundle.last_name().is_none()));
        if !has(FieldKey::Email) || !named {
            let seen: Vec<&str> = filled.iter().map(FieldKey::as_str).collect();
            return Err(ApplyError::new(
                ApplyErrorKind::FormFillIncomplete,
                format!("required name/email fields not identified (filled: [{}])", seen.join(", ")),
            ));
        }
        Ok(())
    }

    async fn upload_documents(&mut self) -> Result<(), ApplyError> {
        let bundle = self.bundle;
        if bundle.resume.is_none() && bundle.cover_letter.is_none() {
            return Ok(());
        }
        self.enter(State::OnUpload, "attaching documents");
        let dir = tempfile::tempdir()
            .map_err(|e| ApplyError::new(ApplyErrorKind::UploadFailed, format!("temp dir: {e}")))?;

        if let Some(resume) = &bundle.resume {
            match self.first_present(self.selectors.resume_input).await? {
                Some(input) => self.upload(dir.path(), input, resume, "resume.pdf").await?,
                None => debug!("Form has no résumé input"),
            }
        }
        if let Some(letter) = &bundle.cover_letter {
            if let Some(input) = self.first_present(self.selectors.cover_letter_input).await? {
                self.upload(dir.path(), input, letter, "cover_letter.pdf").await?;
            }
        }
        Ok(())
    }

    async fn upload(&self, dir: &Path, input: &str, doc: &Document, fallback: &str) -> Result<(), ApplyError> {
        // Portals show the uploaded file's name, so keep the candidate's.
        let name = Path::new(&doc.filename)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .unwrap_or(fallback);
        let path = dir.join(name);
        tokio::fs::write(&path, &doc.content)
            .await
            .map_err(|e| ApplyError::new(ApplyErrorKind::UploadFailed, format!("{name}: {e}")))?;
        self.act("upload", self.page.upload(input, &path))
            .await
            .map_err(|e| match e.kind {
                ApplyErrorKind::Cancelled => e,
                _ => ApplyError::new(ApplyErrorKind::UploadFailed, e.message),
            })
    }

    async fn answer_questionnaire(&mut self) -> Result<(), ApplyError> {
        for page_no in 1..=MAX_FORM_PAGES {
            self.answer_visible_questions().await?;
            if self.first_present(self.selectors.submit).await?.is_some() {
                return Ok(());
            }
            let Some(next) = self.first_present(self.selectors.next_page).await? else {
                return Ok(());
            };
            self.enter(State::OnQuestionnaire, format!("advancing past form page {page_no}"));
            self.click_and_settle("next page", next).await?;
            self.fill_known_fields().await?;
        }
        Ok(())
    }

    async fn answer_visible_questions(&mut self) -> Result<(), ApplyError> {
        let bundle = self.bundle;
        for scope in self.selectors.questionnaire {
            if !self.act("probe", self.page.exists(scope)).await? {
                continue;
            }
            let questions = self.act("read questions", self.page.questions(scope)).await?;
            if questions.is_empty() {
                continue;
            }
            self.enter(State::OnQuestionnaire, format!("{} open question(s) in {scope}", questions.len()));
            for question in &questions {
                match fields::plan_answer(question, bundle) {
                    Some(Action::Fill { selector, value }) => {
                        self.act("answer", self.page.fill(&selector, &value)).await?
                    }
                    Some(Action::Select { selector, option }) => {
                        self.act("answer", self.page.select(&selector, &option)).await?
                    }
                    Some(Action::Click { selector }) => self.act("answer", self.page.click(&selector)).await?,
                    None if question.required => {
                        return Err(ApplyError::new(
                            ApplyErrorKind::FormFillIncomplete,
                            format!("no answer for required question \"{}\"", question.label),
                        ))
                    }
                    None => debug!(question = %question.label, "Skipping optional question"),
                }
            }
        }
        Ok(())
    }

    async fn clear_captcha(&self) -> Result<(), ApplyError> {
        let Some(marker) = self.act("captcha check", captcha::detect(self.page)).await? else {
            return Ok(());
        };
        if self.config.headless {
            return Err(ApplyError::new(
                ApplyErrorKind::CaptchaBlocked,
                format!("CAPTCHA ({marker}) cannot be solved in headless mode"),
            ));
        }
        info!(marker, wait_secs = self.config.captcha_wait.as_secs(), "CAPTCHA detected; waiting for manual solve");
        self.pause(self.config.captcha_wait).await
    }

    async fn submit(&mut self) -> Result<(), ApplyError> {
        self.enter(State::OnSubmit, "locating submit control");
        let retries = self.config.max_retries.max(1);
        let mut ready = None;
        for attempt in 1..=retries {
            if let Some(selector) = self.first_present(self.selectors.submit).await? {
                if self.act("check submit", self.page.is_enabled(selector)).await? {
                    ready = Some(selector);
                    break;
                }
                debug!(attempt, "Submit control disabled");
            }
            self.act("scroll", self.page.scroll()).await?;
            self.pause(self.config.poll_interval).await?;
        }
        let button = ready.ok_or_else(|| {
            ApplyError::new(
                ApplyErrorKind::SubmitButtonMissing,
                format!("no enabled submit control after {retries} attempts"),
            )
        })?;

        self.clear_captcha().await?;

        self.committing = true;
        self.submitted = true;
        self.act("click submit", self.page.click(button)).await?;
        info!(family = %self.family, "Submit clicked");
        if let Err(e) = self.act("wait after submit", self.page.wait_idle()).await {
            warn!(error = %e, "Page did not settle after submit");
        }
        self.clear_captcha().await
    }

    async fn confirm(&mut self, start_url: &str) -> Result<String, ApplyError> {
        self.enter(State::OnConfirm, "waiting for success signal");
        let deadline = Instant::now() + self.config.confirm_timeout;
        loop {
            let url = self.act("read url", self.page.current_url()).await?;
            let text = self.act("read page", self.page.text()).await?;
            let marker = self.first_present(self.selectors.success).await?;
            let url_success = url != start_url && confirmation::url_signals_success(&url);

            if marker.is_some() || url_success || confirmation::text_signals_success(&text) {
                let handle = confirmation::extract(&text)
                    .unwrap_or_else(|| confirmation::synthesize(self.family, Utc::now()));
                self.enter(State::Done, format!("confirmed as {handle}"));
                return Ok(handle);
            }
            if self.first_present(self.selectors.form_errors).await?.is_some() {
                return Err(ApplyError::new(
                    ApplyErrorKind::FormFillIncomplete,
                    "portal reported validation errors after submit",
                ));
            }
            if Instant::now() >= deadline {
                return Err(ApplyError::new(
                    ApplyErrorKind::UnverifiedSubmission,
                    format!("no success signal within {}s of submit", self.config.confirm_timeout.as_secs()),
                ));
            }
            self.pause(self.config.poll_interval).await?;
        }
    }
}
