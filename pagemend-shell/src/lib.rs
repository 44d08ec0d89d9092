use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, instrument, warn};

use pagemend_core::{EditSession, Outcome, SessionState, Surface, ZoomFactor};
use pagemend_render::{PageSlot, RenderEvent, RenderMode, RenderPass, RenderPipeline};

/// User intents the shell translates into session transitions and render
/// pipeline restarts. Visual layout is out of scope; this mapping is the
/// shell's whole contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Upload { bytes: Vec<u8>, filename: String },
    Search { query: String },
    Select { index: usize },
    SetReplacementText { text: String },
    Replace,
    SetPage { page_number: u32 },
    ZoomIn,
    ZoomOut,
    ResetZoom,
}

/// What the UI shows for one page. A failed page becomes a placeholder;
/// its siblings are unaffected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageView {
    Pending,
    Rendered(Surface),
    Placeholder { detail: String },
}

/// Presentation shell: reflects session state and render pipeline output
/// into view state, and maps intents back onto the session.
pub struct EditorShell {
    session: Arc<EditSession>,
    pipeline: Arc<RenderPipeline>,
    zoom: ZoomFactor,
    pages: Vec<PageView>,
    embedded: Option<Bytes>,
    status: Option<String>,
    active_pass: Option<RenderPass>,
}

impl EditorShell {
    pub fn new(session: Arc<EditSession>, pipeline: Arc<RenderPipeline>) -> Self {
        Self {
            session,
            pipeline,
            zoom: ZoomFactor::default(),
            pages: Vec::new(),
            embedded: None,
            status: None,
            active_pass: None,
        }
    }

    pub fn zoom(&self) -> ZoomFactor {
        self.zoom
    }

    pub fn pages(&self) -> &[PageView] {
        &self.pages
    }

    /// Raw document bytes for the embedded-viewer variant.
    pub fn embedded_document(&self) -> Option<&Bytes> {
        self.embedded.as_ref()
    }

    /// Last user-visible error, cleared by the next applied operation.
    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    #[instrument(skip(self, intent))]
    pub async fn handle_intent(&mut self, intent: Intent) {
        match intent {
            Intent::Upload { bytes, filename } => {
                match self.session.upload(bytes, &filename).await {
                    Ok(Outcome::Applied) => {
                        self.status = None;
                        self.reopen().await;
                    }
                    Ok(Outcome::Superseded) => {}
                    Err(err) => self.report(err.to_string()),
                }
            }
            Intent::Search { query } => match self.session.search(&query).await {
                Ok(_) => self.status = None,
                Err(err) => self.report(err.to_string()),
            },
            Intent::Select { index } => self.session.select(index),
            Intent::SetReplacementText { text } => self.session.set_replacement_text(&text),
            Intent::SetPage { page_number } => self.session.set_page(page_number),
            Intent::Replace => match self.session.replace().await {
                Ok(Outcome::Applied) => {
                    self.status = None;
                    self.reopen().await;
                }
                Ok(Outcome::Superseded) => {}
                Err(err) => self.report(err.to_string()),
            },
            Intent::ZoomIn => self.set_zoom(self.zoom.zoom_in()).await,
            Intent::ZoomOut => self.set_zoom(self.zoom.zoom_out()).await,
            Intent::ResetZoom => self.set_zoom(ZoomFactor::default()).await,
        }
    }

    /// Drain any completed page events without blocking. Returns whether
    /// the view changed; a polling UI loop redraws on `true`.
    pub fn pump(&mut self) -> bool {
        let Some(pass) = self.active_pass.as_mut() else {
            return false;
        };
        let mut changed = false;
        loop {
            match pass.events.try_recv() {
                Ok(event) => {
                    apply_event(&mut self.pages, &mut self.embedded, event);
                    changed = true;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.active_pass = None;
                    break;
                }
            }
        }
        changed
    }

    /// Await the active pass to completion. Blocking counterpart of
    /// [`pump`](Self::pump) for callers without a polling loop.
    pub async fn settle(&mut self) {
        let Some(mut pass) = self.active_pass.take() else {
            return;
        };
        while let Some(event) = pass.events.recv().await {
            apply_event(&mut self.pages, &mut self.embedded, event);
        }
    }

    async fn set_zoom(&mut self, zoom: ZoomFactor) {
        if zoom == self.zoom {
            debug!(%zoom, "zoom unchanged, already at bound");
            return;
        }
        self.zoom = zoom;
        // For an embedded viewer zoom is a pure presentation transform;
        // only decoded pages need a re-render at the new factor.
        if self.pipeline.mode() == RenderMode::DecodedPages {
            self.reopen().await;
        }
    }

    /// Restart rendering for the current (handle, version, zoom) tuple.
    /// Replaces the active pass wholesale, abandoning any unfinished
    /// prior sequence.
    async fn reopen(&mut self) {
        let Some(key) = self.session.render_key(self.zoom) else {
            return;
        };
        match self.pipeline.open(key).await {
            Ok(pass) => {
                self.embedded = None;
                self.pages = match self.pipeline.mode() {
                    RenderMode::DecodedPages => vec![PageView::Pending; pass.page_count],
                    RenderMode::EmbeddedPassthrough => Vec::new(),
                };
                self.active_pass = Some(pass);
            }
            Err(err) => {
                self.pages.clear();
                self.embedded = None;
                self.active_pass = None;
                self.report(err.to_string());
            }
        }
    }

    fn report(&mut self, message: String) {
        warn!(%message, "operation failed");
        self.status = Some(message);
    }
}

fn apply_event(pages: &mut [PageView], embedded: &mut Option<Bytes>, event: RenderEvent) {
    match event {
        RenderEvent::Page { page_index, slot } => {
            if let Some(view) = pages.get_mut(page_index) {
                *view = match slot {
                    PageSlot::Pending => PageView::Pending,
                    PageSlot::Ready(surface) => PageView::Rendered(surface),
                    PageSlot::Failed(detail) => PageView::Placeholder { detail },
                };
            }
        }
        RenderEvent::Embedded { bytes } => {
            *embedded = Some(bytes);
        }
    }
}
