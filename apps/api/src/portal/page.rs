use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PageError {
    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Element not found: {0}")]
    NotFound(String),

    #[error("Browser session error: {0}")]
    Session(String),

    #[error("Script error: {0}")]
    Script(String),
}

/// How a visible label is tied to its control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LabelStrategy {
    /// `<label for="id">`
    For,
    /// Label immediately followed by (or wrapping) the control.
    Sibling,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuestionKind {
    Text,
    /// `<select>`; options are visible texts.
    Select { options: Vec<String> },
    /// Radio group; each option carries its own clickable selector.
    Choice { options: Vec<(String, String)> },
    Checkbox,
}

/// An unanswered screening question found on the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub label: String,
    pub selector: String,
    pub kind: QuestionKind,
    pub required: bool,
}

/// The browser operations the Portal Driver needs. Selectors are CSS unless
/// prefixed with `xpath:`.
#[async_trait]
pub trait PortalPage: Send + Sync {
    async fn goto(&self, url: &str) -> Result<(), PageError>;

    /// Waits until the document has finished loading and the network settles.
    async fn wait_idle(&self) -> Result<(), PageError>;

    async fn current_url(&self) -> Result<String, PageError>;

    /// Visible text of the whole document.
    async fn text(&self) -> Result<String, PageError>;

    /// Number of visible elements matching `selector`.
    async fn count(&self, selector: &str) -> Result<usize, PageError>;

    async fn exists(&self, selector: &str) -> Result<bool, PageError> {
        Ok(self.count(selector).await? > 0)
    }

    async fn is_enabled(&self, selector: &str) -> Result<bool, PageError>;

    async fn click(&self, selector: &str) -> Result<(), PageError>;

    /// Clears the control and types `value`.
    async fn fill(&self, selector: &str, value: &str) -> Result<(), PageError>;

    /// Current value of an input, empty if none.
    async fn value(&self, selector: &str) -> Result<String, PageError>;

    /// Picks the option whose visible text equals `option`.
    async fn select(&self, selector: &str, option: &str) -> Result<(), PageError>;

    async fn upload(&self, selector: &str, path: &Path) -> Result<(), PageError>;

    async fn scroll(&self) -> Result<(), PageError>;

    async fn screenshot(&self) -> Result<Vec<u8>, PageError>;

    /// Locates the control labelled `label` (case-insensitive) and returns a
    /// selector that targets exactly that control.
    async fn resolve_label(
        &self,
        label: &str,
        strategy: LabelStrategy,
    ) -> Result<Option<String>, PageError>;

    /// Empty labelled controls inside `scope`.
    async fn questions(&self, scope: &str) -> Result<Vec<Question>, PageError>;

    async fn close(&self) -> Result<(), PageError>;
}

#[async_trait]
pub trait PageFactory: Send + Sync {
    /// Opens a new, isolated browser session.
    async fn open(&self) -> Result<Box<dyn PortalPage>, PageError>;
}
