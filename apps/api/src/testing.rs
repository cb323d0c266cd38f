//! In-memory fakes for every outbound seam, shared by unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::artifacts::LocalArtifactStore;
use crate::directory::MemoryDirectory;
use crate::engine::{Engine, EngineParts, EngineSettings};
use crate::events::EventBus;
use crate::models::application::{Application, SubmissionMethod};
use crate::models::directory::{CandidateProfile, Document, Posting};
use crate::monitor::{AtsProvider, AtsStatus, Inbox, MessageMeta, MonitorError, MonitorSettings};
use crate::portal::fields;
use crate::portal::page::{LabelStrategy, PageError, PageFactory, PortalPage, Question};
use crate::portal::{DriverConfig, PortalFamily};
use crate::scheduler::SchedulerSettings;
use crate::store::{ApplicationStore, LeaseRegistry, MemoryApplicationStore, NewApplication};
use crate::submission::{AttemptLog, MonitorHook, SubmissionWorker, WorkerDeps, WorkerSettings};
use crate::vault::{
    Cipher, ExchangeError, MemoryCredentialStore, TokenExchange, TokenResponse, Vault,
};

// ────────────────────────────────────────────────────────────────────────────
// Token endpoint
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeTokenExchange {
    replies: Mutex<VecDeque<Result<TokenResponse, ExchangeError>>>,
    calls: AtomicUsize,
}

impl FakeTokenExchange {
    pub fn push_ok(&self, token: &str, expires_in: i64) {
        self.replies.lock().unwrap().push_back(Ok(TokenResponse {
            access_token: token.to_string(),
            expires_in,
        }));
    }

    pub fn push_transient(&self) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Err(ExchangeError::Transport("503 Service Unavailable".to_string())));
    }

    pub fn push_rejected(&self) {
        self.replies.lock().unwrap().push_back(Err(ExchangeError::Rejected {
            status: 400,
            body: r#"{"error":"invalid_grant"}"#.to_string(),
        }));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenExchange for FakeTokenExchange {
    async fn refresh(&self, _provider: &str, _refresh_token: &str) -> Result<TokenResponse, ExchangeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.replies.lock().unwrap().pop_front().unwrap_or_else(|| {
            Err(ExchangeError::Rejected {
                status: 400,
                body: "no scripted reply".to_string(),
            })
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Browser page
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Effect {
    Show(String),
    Hide(String),
    Url(String),
    Text(String),
}

#[derive(Default)]
struct PageState {
    url: String,
    text: String,
    present: HashMap<String, usize>,
    disabled: HashSet<String>,
    labels: HashMap<(String, LabelStrategy), String>,
    questions: HashMap<String, Vec<Question>>,
    on_click: HashMap<String, Vec<Effect>>,
    values: HashMap<String, String>,
    answered: HashSet<String>,
    clicks: Vec<String>,
    uploads: Vec<String>,
    scrolls: usize,
    fail_navigation: bool,
    closed: bool,
}

/// A page whose DOM is a set of selectors that are "present". Selectors are
/// matched by exact string.
pub struct ScriptedPage {
    state: Mutex<PageState>,
}

impl ScriptedPage {
    pub fn new(url: &str) -> Self {
        Self {
            state: Mutex::new(PageState {
                url: url.to_string(),
                ..PageState::default()
            }),
        }
    }

    /// A Greenhouse job page with the application form inline. Submitting
    /// lands on a confirmation page carrying `GH-4821`.
    pub fn greenhouse_form(url: &str) -> Self {
        let page = Self::new(url);
        page.set_text("Senior Engineer at Acme. Apply for this job.");
        for sel in [
            "#application_form".to_string(),
            fields::by_name("first_name"),
            fields::by_name("last_name"),
            fields::by_name("email"),
            fields::by_name("phone"),
            "input[type='file'][id*='resume']".to_string(),
            "#submit_app".to_string(),
        ] {
            page.show(&sel);
        }
        page.on_click(
            "#submit_app",
            vec![
                Effect::Url(format!("{url}/confirmation")),
                Effect::Show("#application_confirmation".to_string()),
                Effect::Text("Thank you for applying to Acme. Confirmation number: GH-4821".to_string()),
            ],
        );
        page
    }

    pub fn show(&self, selector: &str) {
        self.state.lock().unwrap().present.insert(selector.to_string(), 1);
    }

    pub fn disable(&self, selector: &str) {
        self.state.lock().unwrap().disabled.insert(selector.to_string());
    }

    pub fn set_text(&self, text: &str) {
        self.state.lock().unwrap().text = text.to_string();
    }

    pub fn label(&self, label: &str, strategy: LabelStrategy, selector: &str) {
        self.state
            .lock()
            .unwrap()
            .labels
            .insert((label.to_lowercase(), strategy), selector.to_string());
    }

    pub fn question(&self, scope: &str, question: Question) {
        let mut state = self.state.lock().unwrap();
        state.present.insert(scope.to_string(), 1);
        state.questions.entry(scope.to_string()).or_default().push(question);
    }

    pub fn on_click(&self, selector: &str, effects: Vec<Effect>) {
        self.state
            .lock()
            .unwrap()
            .on_click
            .insert(selector.to_string(), effects);
    }

    pub fn clear_click_effects(&self, selector: &str) {
        self.state.lock().unwrap().on_click.remove(selector);
    }

    pub fn fail_navigation(&self) {
        self.state.lock().unwrap().fail_navigation = true;
    }

    pub fn value_of(&self, selector: &str) -> Option<String> {
        self.state.lock().unwrap().values.get(selector).cloned()
    }

    pub fn clicks(&self) -> Vec<String> {
        self.state.lock().unwrap().clicks.clone()
    }

    pub fn uploads(&self) -> Vec<String> {
        self.state.lock().unwrap().uploads.clone()
    }

    pub fn scrolls(&self) -> usize {
        self.state.lock().unwrap().scrolls
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    fn require(state: &PageState, selector: &str) -> Result<(), PageError> {
        if state.present.get(selector).copied().unwrap_or(0) > 0 {
            Ok(())
        } else {
            Err(PageError::NotFound(selector.to_string()))
        }
    }
}

/// Shares one `ScriptedPage` so the test can inspect it after the driver
/// has closed its session.
struct SharedPage(Arc<ScriptedPage>);

#[async_trait]
impl PortalPage for SharedPage {
    async fn goto(&self, url: &str) -> Result<(), PageError> {
        let mut state = self.0.state.lock().unwrap();
        if state.fail_navigation {
            return Err(PageError::Navigation(format!("{url}: net::ERR_NAME_NOT_RESOLVED")));
        }
        state.url = url.to_string();
        Ok(())
    }

    async fn wait_idle(&self) -> Result<(), PageError> {
        Ok(())
    }

    async fn current_url(&self) -> Result<String, PageError> {
        Ok(self.0.state.lock().unwrap().url.clone())
    }

    async fn text(&self) -> Result<String, PageError> {
        Ok(self.0.state.lock().unwrap().text.clone())
    }

    async fn count(&self, selector: &str) -> Result<usize, PageError> {
        Ok(self.0.state.lock().unwrap().present.get(selector).copied().unwrap_or(0))
    }

    async fn is_enabled(&self, selector: &str) -> Result<bool, PageError> {
        Ok(!self.0.state.lock().unwrap().disabled.contains(selector))
    }

    async fn click(&self, selector: &str) -> Result<(), PageError> {
        let mut state = self.0.state.lock().unwrap();
        state.clicks.push(selector.to_string());
        state.answered.insert(selector.to_string());
        for effect in state.on_click.get(selector).cloned().unwrap_or_default() {
            match effect {
                Effect::Show(s) => {
                    state.present.insert(s, 1);
                }
                Effect::Hide(s) => {
                    state.present.remove(&s);
                }
                Effect::Url(u) => state.url = u,
                Effect::Text(t) => state.text = t,
            }
        }
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), PageError> {
        let mut state = self.0.state.lock().unwrap();
        state.values.insert(selector.to_string(), value.to_string());
        state.answered.insert(selector.to_string());
        Ok(())
    }

    async fn value(&self, selector: &str) -> Result<String, PageError> {
        Ok(self.0.state.lock().unwrap().values.get(selector).cloned().unwrap_or_default())
    }

    async fn select(&self, selector: &str, option: &str) -> Result<(), PageError> {
        self.fill(selector, option).await
    }

    async fn upload(&self, selector: &str, path: &Path) -> Result<(), PageError> {
        if !path.exists() {
            return Err(PageError::NotFound(path.display().to_string()));
        }
        let mut state = self.0.state.lock().unwrap();
        ScriptedPage::require(&state, selector)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        state.uploads.push(name);
        Ok(())
    }

    async fn scroll(&self) -> Result<(), PageError> {
        self.0.state.lock().unwrap().scrolls += 1;
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, PageError> {
        Ok(b"\x89PNG\r\n\x1a\n".to_vec())
    }

    async fn resolve_label(&self, label: &str, strategy: LabelStrategy) -> Result<Option<String>, PageError> {
        Ok(self
            .0
            .state
            .lock()
            .unwrap()
            .labels
            .get(&(label.to_lowercase(), strategy))
            .cloned())
    }

    async fn questions(&self, scope: &str) -> Result<Vec<Question>, PageError> {
        let state = self.0.state.lock().unwrap();
        Ok(state
            .questions
            .get(scope)
            .map(|qs| {
                qs.iter()
                    .filter(|q| !state.answered.contains(&q.selector))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn close(&self) -> Result<(), PageError> {
        self.0.state.lock().unwrap().closed = true;
        Ok(())
    }
}

/// Hands out scripted pages in order; the last one is reused once the
/// queue runs dry.
pub struct ScriptedPageFactory {
    pages: Mutex<VecDeque<Arc<ScriptedPage>>>,
    last: Mutex<Option<Arc<ScriptedPage>>>,
    opened: AtomicUsize,
}

impl ScriptedPageFactory {
    pub fn new(page: Arc<ScriptedPage>) -> Self {
        Self::sequence(vec![page])
    }

    pub fn sequence(pages: Vec<Arc<ScriptedPage>>) -> Self {
        Self {
            pages: Mutex::new(pages.into()),
            last: Mutex::new(None),
            opened: AtomicUsize::new(0),
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageFactory for ScriptedPageFactory {
    async fn open(&self) -> Result<Box<dyn PortalPage>, PageError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let next = self.pages.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(page) = next {
            *last = Some(page);
        }
        last.clone()
            .map(|page| Box::new(SharedPage(page)) as Box<dyn PortalPage>)
            .ok_or_else(|| PageError::Session("no scripted page".to_string()))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Monitor hook
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingMonitor {
    armed: Mutex<Vec<Uuid>>,
}

impl RecordingMonitor {
    pub fn armed(&self) -> Vec<Uuid> {
        self.armed.lock().unwrap().clone()
    }
}

#[async_trait]
impl MonitorHook for RecordingMonitor {
    async fn arm(&self, application_id: Uuid) {
        self.armed.lock().unwrap().push(application_id);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Status sources
// ────────────────────────────────────────────────────────────────────────────

/// ATS status endpoint keyed by handle. Unknown handles answer 404.
#[derive(Default)]
pub struct FakeAts {
    replies: Mutex<HashMap<String, Option<String>>>,
    calls: AtomicUsize,
}

impl FakeAts {
    pub fn set(&self, handle: &str, status: &str) {
        self.replies
            .lock()
            .unwrap()
            .insert(handle.to_string(), Some(status.to_string()));
    }

    /// The endpoint answers 503 for this handle.
    pub fn fail(&self, handle: &str) {
        self.replies.lock().unwrap().insert(handle.to_string(), None);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AtsProvider for FakeAts {
    async fn status(&self, family: PortalFamily, handle: &str) -> Result<AtsStatus, MonitorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.replies.lock().unwrap().get(handle).cloned();
        let error = |status: u16| MonitorError::Api {
            provider: family.provider().to_string(),
            status,
            message: String::new(),
        };
        match reply {
            Some(Some(status)) => Ok(AtsStatus {
                status,
                stage: None,
                updated_at: None,
                notes: None,
            }),
            Some(None) => Err(error(503)),
            None => Err(error(404)),
        }
    }
}

/// Mailbox that returns every stored message for any query.
#[derive(Default)]
pub struct FakeInbox {
    messages: Mutex<Vec<MessageMeta>>,
    queries: Mutex<Vec<String>>,
}

impl FakeInbox {
    pub fn push(&self, message: MessageMeta) {
        self.messages.lock().unwrap().push(message);
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl Inbox for FakeInbox {
    async fn search(&self, _access_token: &str, query: &str, max_results: u32) -> Result<Vec<String>, MonitorError> {
        self.queries.lock().unwrap().push(query.to_string());
        Ok(self
            .messages
            .lock()
            .unwrap()
            .iter()
            .take(max_results as usize)
            .map(|m| m.id.clone())
            .collect())
    }

    async fn metadata(&self, _access_token: &str, message_id: &str) -> Result<MessageMeta, MonitorError> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.id == message_id)
            .cloned()
            .ok_or_else(|| MonitorError::Api {
                provider: "gmail".to_string(),
                status: 404,
                message: format!("message {message_id} not found"),
            })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Wiring
// ────────────────────────────────────────────────────────────────────────────

pub const GREENHOUSE_URL: &str = "https://boards.greenhouse.io/acme/jobs/42";

/// One candidate with a résumé, one posting, and every component in memory.
pub struct Fixture {
    pub store: Arc<MemoryApplicationStore>,
    pub directory: Arc<MemoryDirectory>,
    pub vault: Arc<Vault>,
    pub tokens: Arc<FakeTokenExchange>,
    pub pages: Arc<ScriptedPageFactory>,
    pub monitor: Arc<RecordingMonitor>,
    pub bus: EventBus,
    pub leases: LeaseRegistry,
    pub candidate: Uuid,
    pub posting: Uuid,
    pub dir: tempfile::TempDir,
}

impl Fixture {
    pub async fn new(url: &str, pages: Vec<Arc<ScriptedPage>>) -> Self {
        let directory = Arc::new(MemoryDirectory::new());
        let tokens = Arc::new(FakeTokenExchange::default());
        let candidate = Uuid::new_v4();
        directory
            .insert_profile(CandidateProfile {
                id: candidate,
                full_name: "Ada Lovelace".to_string(),
                email: "ada@x.io".to_string(),
                phone: Some("+44 20 7946 0000".to_string()),
                linkedin_url: None,
                portfolio_url: None,
                resume: Some(Document {
                    filename: "Ada_Lovelace.pdf".to_string(),
                    content: Bytes::from_static(b"%PDF-1.7"),
                }),
                cover_letter: None,
                custom_answers: HashMap::new(),
                work_authorized: true,
                requires_sponsorship: false,
            })
            .await;
        let fixture = Self {
            store: Arc::new(MemoryApplicationStore::new()),
            vault: Arc::new(Vault::new(
                Cipher::from_secret("test-secret").unwrap(),
                Arc::new(MemoryCredentialStore::new()),
                tokens.clone(),
            )),
            directory,
            tokens,
            pages: Arc::new(ScriptedPageFactory::sequence(pages)),
            monitor: Arc::new(RecordingMonitor::default()),
            bus: EventBus::new(),
            leases: LeaseRegistry::new(),
            candidate,
            posting: Uuid::nil(),
            dir: tempfile::tempdir().unwrap(),
        };
        let posting = fixture.add_posting(Some(url), "Acme", "Senior Engineer").await;
        Self { posting, ..fixture }
    }

    pub async fn add_posting(&self, url: Option<&str>, company: &str, title: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.directory
            .insert_posting(Posting {
                id,
                title: title.to_string(),
                company: company.to_string(),
                url: url.map(String::from),
                apply_url: None,
                location: None,
                salary_max: None,
                recruiter_id: None,
            })
            .await;
        id
    }

    pub fn worker_deps(&self, monitor: Arc<dyn MonitorHook>) -> WorkerDeps {
        WorkerDeps {
            store: self.store.clone(),
            leases: self.leases.clone(),
            directory: self.directory.clone(),
            vault: self.vault.clone(),
            pages: self.pages.clone(),
            artifacts: Arc::new(LocalArtifactStore::new(self.dir.path())),
            bus: self.bus.clone(),
            monitor,
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            driver: DriverConfig::default(),
            max_attempts: 3,
            retry_base: Duration::from_secs(60),
            check_interval_minutes: 60,
            attempt_log: AttemptLog::new(self.dir.path()),
        }
    }

    pub fn worker(&self) -> SubmissionWorker {
        SubmissionWorker::new(self.worker_deps(self.monitor.clone()), self.worker_settings())
    }

    /// The full engine over the fixture's store, directory, vault and pages,
    /// with status sources that know nothing.
    pub fn engine(&self) -> Engine {
        Engine::new(
            EngineParts {
                store: self.store.clone(),
                directory: self.directory.clone(),
                vault: self.vault.clone(),
                pages: self.pages.clone(),
                artifacts: Arc::new(LocalArtifactStore::new(self.dir.path())),
                ats: Arc::new(FakeAts::default()),
                inbox: Arc::new(FakeInbox::default()),
                bus: self.bus.clone(),
            },
            EngineSettings {
                worker: self.worker_settings(),
                scheduler: SchedulerSettings {
                    tick: Duration::from_secs(30),
                    concurrency: 2,
                },
                monitor: MonitorSettings::default(),
            },
            tokio_util::sync::CancellationToken::new(),
        )
    }

    pub async fn pending_for(&self, posting_id: Uuid) -> Application {
        self.store
            .create_application(NewApplication {
                candidate_id: self.candidate,
                posting_id,
                method: SubmissionMethod::Browser,
                submit_intent: true,
            })
            .await
            .unwrap()
            .into_application()
    }

    pub async fn pending(&self) -> Application {
        self.pending_for(self.posting).await
    }
}
