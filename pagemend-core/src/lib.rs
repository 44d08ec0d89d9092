use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

/// Opaque identifier for a document held by the external document service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentHandle(String);

impl DocumentHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monotonic token distinguishing successive content states of one handle.
/// Bumped on every successful upload and every successful replace, never
/// reused or decremented.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ContentVersion(u64);

impl ContentVersion {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ContentVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// One located occurrence of a search query on a page. Immutable once
/// produced; a new search replaces the whole list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    /// 0-based ordinal within the page's match list.
    pub index: usize,
    /// Surrounding span text, for display.
    pub span_text: String,
    /// The exact matched substring.
    pub found_text: String,
}

/// Zoom factor clamped to the viewer range. Stored quantized to
/// thousandths so render keys hash and compare exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ZoomFactor(u32);

impl ZoomFactor {
    pub const MIN: f32 = 0.5;
    pub const MAX: f32 = 3.0;
    pub const STEP: f32 = 0.25;
    pub const DEFAULT: f32 = 1.5;

    pub fn new(value: f32) -> Self {
        let value = if value.is_finite() {
            value.clamp(Self::MIN, Self::MAX)
        } else {
            Self::DEFAULT
        };
        Self((value * 1000.0).round() as u32)
    }

    pub fn value(self) -> f32 {
        self.0 as f32 / 1000.0
    }

    pub fn zoom_in(self) -> Self {
        Self::new(self.value() + Self::STEP)
    }

    pub fn zoom_out(self) -> Self {
        Self::new(self.value() - Self::STEP)
    }

    pub fn at_max(self) -> bool {
        self == Self::new(Self::MAX)
    }

    pub fn at_min(self) -> bool {
        self == Self::new(Self::MIN)
    }
}

impl Default for ZoomFactor {
    fn default() -> Self {
        Self::new(Self::DEFAULT)
    }
}

impl fmt::Display for ZoomFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", (self.value() * 100.0).round() as u32)
    }
}

/// The invalidation tuple for render work. Any field change supersedes
/// every queued or in-flight render task carrying the old tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderKey {
    pub handle: DocumentHandle,
    pub version: ContentVersion,
    pub zoom: ZoomFactor,
}

/// Rendered RGBA8 bitmap of one page at one zoom factor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Surface {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    #[error("upload transport failed: {0}")]
    Network(String),
    #[error("document too large: {0}")]
    TooLarge(String),
    #[error("unsupported document format: {0}")]
    UnsupportedFormat(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FindError {
    #[error("search transport failed: {0}")]
    Network(String),
    #[error("search rejected by document service: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplaceError {
    #[error("replace transport failed: {0}")]
    Network(String),
    #[error("hit is stale: {0}")]
    StaleHit(String),
    #[error("replace rejected by document service: {0}")]
    Rejected(String),
}

/// Failure to obtain or parse the bytes backing a render pass. `Fetch` is
/// a transport problem, `Parse` means the rendering library rejected the
/// document; callers surface the two distinctly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentLoadError {
    #[error("failed to fetch document for rendering: {0}")]
    Fetch(String),
    #[error("rendering library rejected the document: {0}")]
    Parse(String),
}

/// A single page failed to render. Non-fatal; sibling pages continue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("page {page} failed to render: {detail}")]
pub struct PageRenderError {
    pub page: usize,
    pub detail: String,
}

/// Errors surfaced by session transitions. The first four gate invalid
/// transitions locally, before any service call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("no document is loaded")]
    NoDocument,
    #[error("search query is blank")]
    BlankQuery,
    #[error("no search hit is selected")]
    NoSelection,
    #[error("replacement text is blank")]
    BlankReplacement,
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Find(#[from] FindError),
    #[error(transparent)]
    Replace(#[from] ReplaceError),
}

/// Payload of the Replace operation. Carries the raw `old_text` rather
/// than an opaque hit identifier, matching the document service contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaceRequest {
    pub page_number: u32,
    pub hit_index: usize,
    pub old_text: String,
    pub new_text: String,
}

/// The external document service. Transport-agnostic; implementations
/// own all byte-level document work, the session never touches document
/// internals.
#[async_trait::async_trait]
pub trait DocumentService: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, filename: &str) -> Result<DocumentHandle, UploadError>;

    async fn find(
        &self,
        handle: &DocumentHandle,
        page_number: u32,
        query: &str,
    ) -> Result<Vec<SearchHit>, FindError>;

    async fn replace(
        &self,
        handle: &DocumentHandle,
        request: ReplaceRequest,
    ) -> Result<(), ReplaceError>;

    /// Fetch the bytes backing a render pass. Keyed by handle and version:
    /// content changes under the same handle after a replace, so any cache
    /// along the way must not key on the handle alone.
    async fn fetch_for_render(
        &self,
        handle: &DocumentHandle,
        version: ContentVersion,
    ) -> Result<Vec<u8>, DocumentLoadError>;
}

/// Client-side state of one editing session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub handle: Option<DocumentHandle>,
    pub content_version: ContentVersion,
    /// 1-based page the session searches on.
    pub page_number: u32,
    pub hits: Vec<SearchHit>,
    /// Always a valid index into `hits` when `Some`.
    pub selection: Option<usize>,
    pub replacement_text: String,
    /// The query that produced `hits`; reused as `old_text` on replace.
    pub last_query: Option<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            handle: None,
            content_version: ContentVersion::default(),
            page_number: 1,
            hits: Vec::new(),
            selection: None,
            replacement_text: String::new(),
            last_query: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Handle or content version changed; renders keyed on the old tuple
    /// are now stale.
    DocumentChanged {
        handle: DocumentHandle,
        version: ContentVersion,
    },
    HitsChanged { count: usize },
    SelectionChanged { selection: Option<usize> },
    PageChanged { page_number: u32 },
}

/// Whether an async transition's response was applied or lost the race to
/// a newer request of the same kind. Superseded responses are dropped
/// silently and never surfaced as failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Superseded,
}

impl Outcome {
    pub fn is_applied(self) -> bool {
        matches!(self, Outcome::Applied)
    }
}

#[derive(Default)]
struct SessionInner {
    state: SessionState,
    upload_seq: u64,
    search_seq: u64,
    replace_seq: u64,
}

/// The editing session state machine. Transitions are serialized by the
/// order calls take the lock; network responses may resolve out of order,
/// so every async transition tags its request with a per-kind sequence
/// number at submission and re-checks it after the await before mutating
/// anything. A mismatch means a newer request of that kind was issued in
/// the meantime and the response is discarded.
pub struct EditSession {
    service: Arc<dyn DocumentService>,
    inner: Mutex<SessionInner>,
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl EditSession {
    pub fn new(service: Arc<dyn DocumentService>) -> Self {
        Self {
            service,
            inner: Mutex::new(SessionInner::default()),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Snapshot of the current session state.
    pub fn state(&self) -> SessionState {
        self.inner.lock().state.clone()
    }

    pub fn events(&self) -> Arc<Mutex<Vec<SessionEvent>>> {
        Arc::clone(&self.events)
    }

    pub fn drain_events(&self) -> Vec<SessionEvent> {
        self.events.lock().drain(..).collect()
    }

    /// The render tuple for the current document, if one is loaded.
    pub fn render_key(&self, zoom: ZoomFactor) -> Option<RenderKey> {
        let inner = self.inner.lock();
        inner.state.handle.clone().map(|handle| RenderKey {
            handle,
            version: inner.state.content_version,
            zoom,
        })
    }

    /// Upload a new document. Valid from any state. On success the handle
    /// is replaced, the version bumped, and hits/selection cleared; on
    /// failure nothing changes and the prior document stays loaded.
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn upload(&self, bytes: Vec<u8>, filename: &str) -> Result<Outcome, SessionError> {
        let seq = {
            let mut inner = self.inner.lock();
            inner.upload_seq += 1;
            inner.upload_seq
        };

        let result = self.service.upload(bytes, filename).await;

        let mut inner = self.inner.lock();
        if seq != inner.upload_seq {
            debug!(seq, latest = inner.upload_seq, "upload response superseded");
            return Ok(Outcome::Superseded);
        }
        let handle = result?;

        inner.state.handle = Some(handle.clone());
        inner.state.content_version = inner.state.content_version.next();
        inner.state.hits.clear();
        inner.state.selection = None;
        inner.state.last_query = None;
        inner.state.page_number = 1;
        let version = inner.state.content_version;
        drop(inner);

        self.push_event(SessionEvent::DocumentChanged { handle, version });
        Ok(Outcome::Applied)
    }

    /// Search the current page for `query`. A blank query is rejected
    /// locally without a service call. Last-submitted-wins: if a newer
    /// search was issued while this one was in flight, or the document
    /// itself changed, the response is discarded.
    #[instrument(skip(self))]
    pub async fn search(&self, query: &str) -> Result<Outcome, SessionError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(SessionError::BlankQuery);
        }

        let (handle, version, page_number, seq) = {
            let mut inner = self.inner.lock();
            let handle = inner.state.handle.clone().ok_or(SessionError::NoDocument)?;
            inner.search_seq += 1;
            (
                handle,
                inner.state.content_version,
                inner.state.page_number,
                inner.search_seq,
            )
        };

        let result = self.service.find(&handle, page_number, query).await;

        let mut inner = self.inner.lock();
        if seq != inner.search_seq
            || inner.state.handle.as_ref() != Some(&handle)
            || inner.state.content_version != version
        {
            debug!(seq, latest = inner.search_seq, "search response superseded");
            return Ok(Outcome::Superseded);
        }
        let hits = result?;

        let count = hits.len();
        inner.state.hits = hits;
        inner.state.selection = None;
        inner.state.last_query = Some(query.to_owned());
        drop(inner);

        self.push_event(SessionEvent::HitsChanged { count });
        Ok(Outcome::Applied)
    }

    /// Select one hit by index. Out-of-range indices (stale UI clicks) are
    /// ignored without error and leave the selection unchanged.
    pub fn select(&self, index: usize) {
        let mut inner = self.inner.lock();
        if index >= inner.state.hits.len() {
            debug!(index, hits = inner.state.hits.len(), "select out of range, ignored");
            return;
        }
        if inner.state.selection == Some(index) {
            return;
        }
        inner.state.selection = Some(index);
        drop(inner);
        self.push_event(SessionEvent::SelectionChanged {
            selection: Some(index),
        });
    }

    pub fn set_replacement_text(&self, text: &str) {
        self.inner.lock().state.replacement_text = text.to_owned();
    }

    /// Change the page subsequent searches run against. 1-based, clamped
    /// to at least 1. Existing hits stay until the next search replaces
    /// them.
    pub fn set_page(&self, page_number: u32) {
        let page_number = page_number.max(1);
        let mut inner = self.inner.lock();
        if inner.state.page_number == page_number {
            return;
        }
        inner.state.page_number = page_number;
        drop(inner);
        self.push_event(SessionEvent::PageChanged { page_number });
    }

    /// Replace the selected hit with the current replacement text. On
    /// success the content version bumps and hits/selection clear: the
    /// document changed, so previous hit offsets are no longer
    /// trustworthy. On failure the session is left bit-identical so the
    /// same replace can be retried without re-searching.
    #[instrument(skip(self))]
    pub async fn replace(&self) -> Result<Outcome, SessionError> {
        let (handle, version, request, seq) = {
            let mut inner = self.inner.lock();
            let handle = inner.state.handle.clone().ok_or(SessionError::NoDocument)?;
            let hit_index = inner.state.selection.ok_or(SessionError::NoSelection)?;
            let old_text = inner.state.last_query.clone().ok_or(SessionError::NoSelection)?;
            let new_text = inner.state.replacement_text.trim().to_owned();
            if new_text.is_empty() {
                return Err(SessionError::BlankReplacement);
            }
            inner.replace_seq += 1;
            let request = ReplaceRequest {
                page_number: inner.state.page_number,
                hit_index,
                old_text,
                new_text,
            };
            (handle, inner.state.content_version, request, inner.replace_seq)
        };

        let result = self.service.replace(&handle, request).await;

        let mut inner = self.inner.lock();
        if seq != inner.replace_seq
            || inner.state.handle.as_ref() != Some(&handle)
            || inner.state.content_version != version
        {
            debug!(seq, latest = inner.replace_seq, "replace response superseded");
            return Ok(Outcome::Superseded);
        }
        result?;

        inner.state.content_version = inner.state.content_version.next();
        inner.state.hits.clear();
        inner.state.selection = None;
        let version = inner.state.content_version;
        drop(inner);

        self.push_event(SessionEvent::DocumentChanged { handle, version });
        Ok(Outcome::Applied)
    }

    fn push_event(&self, event: SessionEvent) {
        self.events.lock().push(event);
    }
}
