use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use pagemend_core::{
    DocumentLoadError, DocumentService, PageRenderError, RenderKey, Surface, ZoomFactor,
};

pub mod decoder_runtime;

#[cfg(feature = "pdf")]
mod pdfium_decoder;
#[cfg(feature = "pdf")]
pub use pdfium_decoder::PdfiumPageDecoder;

/// A document opened by the rendering library, ready to render pages.
#[async_trait::async_trait]
pub trait DecodedDocument: Send + Sync {
    fn page_count(&self) -> usize;

    async fn render_page(
        &self,
        page_index: usize,
        zoom: ZoomFactor,
    ) -> Result<Surface, PageRenderError>;
}

/// The seam to the rendering library: turns fetched bytes into a
/// [`DecodedDocument`].
#[async_trait::async_trait]
pub trait PageDecoder: Send + Sync {
    async fn open(&self, bytes: Vec<u8>) -> Result<Arc<dyn DecodedDocument>, DocumentLoadError>;
}

/// How the pipeline presents a document. One capability, two variants:
/// `DecodedPages` owns a surface per page and re-renders on zoom changes;
/// `EmbeddedPassthrough` hands the raw bytes to a platform viewer, so zoom
/// is a pure presentation transform and never restarts a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RenderMode {
    #[default]
    DecodedPages,
    EmbeddedPassthrough,
}

/// State of one page's surface slot within the current generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageSlot {
    Pending,
    Ready(Surface),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderEvent {
    /// A page completed (successfully or not) in ascending submission
    /// order; completion order is not otherwise guaranteed.
    Page { page_index: usize, slot: PageSlot },
    /// Passthrough variant: the whole document, for an embedded viewer.
    Embedded { bytes: Bytes },
}

/// One generation's render sequence. A fresh [`RenderPipeline::open`]
/// always starts a new pass from page 0 and ends the previous pass's
/// event stream.
#[derive(Debug)]
pub struct RenderPass {
    pub generation: u64,
    pub page_count: usize,
    pub events: mpsc::UnboundedReceiver<RenderEvent>,
}

#[derive(Default)]
struct PipelineState {
    generation: u64,
    key: Option<RenderKey>,
    slots: Vec<PageSlot>,
}

/// Paginated async rendering pipeline. Every pass is tagged with a
/// generation taken while holding the state lock; page work re-checks the
/// generation under that same lock before writing a surface slot, so a
/// slow render from a superseded (handle, version, zoom) tuple can never
/// overwrite a page of a newer pass. Stale completions are discarded
/// silently.
pub struct RenderPipeline {
    service: Arc<dyn DocumentService>,
    decoder: Option<Arc<dyn PageDecoder>>,
    mode: RenderMode,
    state: Arc<Mutex<PipelineState>>,
}

impl RenderPipeline {
    /// Pipeline that decodes per-page surfaces through `decoder`.
    pub fn decoded(service: Arc<dyn DocumentService>, decoder: Arc<dyn PageDecoder>) -> Self {
        Self {
            service,
            decoder: Some(decoder),
            mode: RenderMode::DecodedPages,
            state: Arc::new(Mutex::new(PipelineState::default())),
        }
    }

    /// Pipeline that hands fetched bytes to a platform viewer untouched.
    pub fn embedded(service: Arc<dyn DocumentService>) -> Self {
        Self {
            service,
            decoder: None,
            mode: RenderMode::EmbeddedPassthrough,
            state: Arc::new(Mutex::new(PipelineState::default())),
        }
    }

    pub fn mode(&self) -> RenderMode {
        self.mode
    }

    pub fn current_generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// The key the current generation was opened with.
    pub fn current_key(&self) -> Option<RenderKey> {
        self.state.lock().key.clone()
    }

    /// Per-page slots of the current generation, for pull-style consumers.
    pub fn snapshot(&self) -> Vec<PageSlot> {
        self.state.lock().slots.clone()
    }

    /// Open a document for the given tuple and start rendering pages. The
    /// generation marker advances before any I/O, so in-flight work for
    /// the previous tuple is already superseded by the time this returns.
    /// If a newer `open` lands while this one is still fetching or
    /// decoding, the returned pass is empty: zero pages, closed stream.
    #[instrument(skip(self), fields(handle = %key.handle, version = %key.version))]
    pub async fn open(&self, key: RenderKey) -> Result<RenderPass, DocumentLoadError> {
        let generation = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.key = Some(key.clone());
            state.slots.clear();
            state.generation
        };

        let bytes = self
            .service
            .fetch_for_render(&key.handle, key.version)
            .await?;
        if self.is_superseded(generation) {
            return Ok(Self::empty_pass(generation));
        }

        match self.mode {
            RenderMode::EmbeddedPassthrough => {
                let (tx, rx) = mpsc::unbounded_channel();
                if !self.is_superseded(generation) {
                    let _ = tx.send(RenderEvent::Embedded {
                        bytes: Bytes::from(bytes),
                    });
                }
                Ok(RenderPass {
                    generation,
                    page_count: 1,
                    events: rx,
                })
            }
            RenderMode::DecodedPages => {
                let decoder = self
                    .decoder
                    .as_ref()
                    .expect("decoded pipelines always carry a decoder");
                let document = decoder.open(bytes).await?;
                let page_count = document.page_count();

                {
                    let mut state = self.state.lock();
                    if state.generation != generation {
                        debug!(generation, "open superseded during decode");
                        return Ok(Self::empty_pass(generation));
                    }
                    state.slots = vec![PageSlot::Pending; page_count];
                }

                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(drive_pages(
                    document,
                    key.zoom,
                    generation,
                    page_count,
                    Arc::clone(&self.state),
                    tx,
                ));

                Ok(RenderPass {
                    generation,
                    page_count,
                    events: rx,
                })
            }
        }
    }

    fn is_superseded(&self, generation: u64) -> bool {
        self.state.lock().generation != generation
    }

    fn empty_pass(generation: u64) -> RenderPass {
        let (_tx, rx) = mpsc::unbounded_channel();
        RenderPass {
            generation,
            page_count: 0,
            events: rx,
        }
    }
}

/// Render pages 0..page_count in ascending submission order. One page's
/// failure marks that slot only and the loop continues. The generation is
/// checked before starting each page and again, under the state lock,
/// before its surface is written.
async fn drive_pages(
    document: Arc<dyn DecodedDocument>,
    zoom: ZoomFactor,
    generation: u64,
    page_count: usize,
    state: Arc<Mutex<PipelineState>>,
    tx: mpsc::UnboundedSender<RenderEvent>,
) {
    for page_index in 0..page_count {
        if state.lock().generation != generation {
            debug!(generation, page_index, "render pass superseded, stopping");
            return;
        }

        let rendered = document.render_page(page_index, zoom).await;

        let slot = match rendered {
            Ok(surface) => PageSlot::Ready(surface),
            Err(err) => {
                warn!(page = err.page, detail = %err.detail, "page render failed");
                PageSlot::Failed(err.detail)
            }
        };

        {
            let mut guard = state.lock();
            if guard.generation != generation {
                debug!(
                    generation,
                    page_index, "render completed for superseded generation, discarded"
                );
                return;
            }
            guard.slots[page_index] = slot.clone();
        }

        if tx.send(RenderEvent::Page { page_index, slot }).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    use pagemend_core::{
        ContentVersion, DocumentHandle, FindError, ReplaceError, ReplaceRequest, SearchHit,
        UploadError,
    };
    use tokio::sync::Notify;

    struct FakeService {
        fail_fetch: bool,
    }

    #[async_trait::async_trait]
    impl DocumentService for FakeService {
        async fn upload(
            &self,
            _bytes: Vec<u8>,
            _filename: &str,
        ) -> Result<DocumentHandle, UploadError> {
            unimplemented!("render tests never upload")
        }

        async fn find(
            &self,
            _handle: &DocumentHandle,
            _page_number: u32,
            _query: &str,
        ) -> Result<Vec<SearchHit>, FindError> {
            unimplemented!("render tests never search")
        }

        async fn replace(
            &self,
            _handle: &DocumentHandle,
            _request: ReplaceRequest,
        ) -> Result<(), ReplaceError> {
            unimplemented!("render tests never replace")
        }

        async fn fetch_for_render(
            &self,
            handle: &DocumentHandle,
            version: ContentVersion,
        ) -> Result<Vec<u8>, DocumentLoadError> {
            if self.fail_fetch {
                return Err(DocumentLoadError::Fetch("connection refused".into()));
            }
            Ok(format!("{handle}:{version}").into_bytes())
        }
    }

    /// Decoder whose surfaces encode the source bytes and page index, so
    /// tests can tell which document a written slot came from. Individual
    /// pages can be gated on a Notify or forced to fail.
    #[derive(Default)]
    struct FakeDecoder {
        page_count: usize,
        gates: Mutex<HashMap<usize, Arc<Notify>>>,
        failing_pages: Mutex<HashSet<usize>>,
        reject_open: bool,
    }

    impl FakeDecoder {
        fn with_pages(page_count: usize) -> Self {
            Self {
                page_count,
                ..Self::default()
            }
        }

        fn gate_page(&self, page_index: usize) -> Arc<Notify> {
            let gate = Arc::new(Notify::new());
            self.gates.lock().insert(page_index, Arc::clone(&gate));
            gate
        }

        fn fail_page(&self, page_index: usize) {
            self.failing_pages.lock().insert(page_index);
        }
    }

    struct FakeDocument {
        bytes: Vec<u8>,
        page_count: usize,
        gates: HashMap<usize, Arc<Notify>>,
        failing_pages: HashSet<usize>,
    }

    #[async_trait::async_trait]
    impl DecodedDocument for FakeDocument {
        fn page_count(&self) -> usize {
            self.page_count
        }

        async fn render_page(
            &self,
            page_index: usize,
            zoom: ZoomFactor,
        ) -> Result<Surface, PageRenderError> {
            if let Some(gate) = self.gates.get(&page_index) {
                gate.notified().await;
            }
            if self.failing_pages.contains(&page_index) {
                return Err(PageRenderError {
                    page: page_index,
                    detail: "decode failure".into(),
                });
            }
            let mut pixels = self.bytes.clone();
            pixels.push(page_index as u8);
            pixels.push((zoom.value() * 100.0) as u8);
            Ok(Surface {
                width: 1,
                height: 1,
                pixels,
            })
        }
    }

    #[async_trait::async_trait]
    impl PageDecoder for FakeDecoder {
        async fn open(
            &self,
            bytes: Vec<u8>,
        ) -> Result<Arc<dyn DecodedDocument>, DocumentLoadError> {
            if self.reject_open {
                return Err(DocumentLoadError::Parse("not a document".into()));
            }
            Ok(Arc::new(FakeDocument {
                bytes,
                page_count: self.page_count,
                gates: self.gates.lock().clone(),
                failing_pages: self.failing_pages.lock().clone(),
            }))
        }
    }

    fn key_for(handle: &str, version: u64) -> RenderKey {
        RenderKey {
            handle: DocumentHandle::new(handle),
            version: ContentVersion::new(version),
            zoom: ZoomFactor::default(),
        }
    }

    fn pipeline(decoder: Arc<FakeDecoder>, mode: RenderMode) -> RenderPipeline {
        let service = Arc::new(FakeService { fail_fetch: false });
        match mode {
            RenderMode::DecodedPages => RenderPipeline::decoded(service, decoder),
            RenderMode::EmbeddedPassthrough => RenderPipeline::embedded(service),
        }
    }

    async fn drain(pass: &mut RenderPass) -> Vec<RenderEvent> {
        let mut events = Vec::new();
        while let Some(event) = pass.events.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn renders_all_pages_in_ascending_order() {
        let decoder = Arc::new(FakeDecoder::with_pages(3));
        let pipeline = pipeline(decoder, RenderMode::DecodedPages);

        let mut pass = pipeline.open(key_for("doc-a", 1)).await.unwrap();
        assert_eq!(pass.page_count, 3);

        let events = drain(&mut pass).await;
        let order: Vec<usize> = events
            .iter()
            .map(|event| match event {
                RenderEvent::Page { page_index, .. } => *page_index,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(order, vec![0, 1, 2]);

        let slots = pipeline.snapshot();
        assert_eq!(slots.len(), 3);
        assert!(slots
            .iter()
            .all(|slot| matches!(slot, PageSlot::Ready(_))));
    }

    #[tokio::test]
    async fn delayed_stale_render_never_writes_a_slot() {
        let decoder = Arc::new(FakeDecoder::with_pages(2));
        let gate = decoder.gate_page(0);
        let pipeline = pipeline(Arc::clone(&decoder), RenderMode::DecodedPages);

        let mut old_pass = pipeline.open(key_for("doc-a", 1)).await.unwrap();
        let old_generation = old_pass.generation;
        // Let the old pass reach page 0 and block on the gate.
        tokio::task::yield_now().await;

        // New document supersedes the tuple while the old render hangs.
        decoder.gates.lock().clear();
        let mut new_pass = pipeline.open(key_for("doc-b", 1)).await.unwrap();
        assert!(new_pass.generation > old_generation);
        let new_events = drain(&mut new_pass).await;
        assert_eq!(new_events.len(), 2);

        // Release the artificially delayed old-generation render: it must
        // complete as a no-op.
        gate.notify_one();
        let old_events = drain(&mut old_pass).await;
        assert!(old_events.is_empty());

        for slot in pipeline.snapshot() {
            match slot {
                PageSlot::Ready(surface) => {
                    assert!(surface.pixels.starts_with(b"doc-b:"));
                }
                other => panic!("unexpected slot {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn one_failing_page_does_not_abort_siblings() {
        let decoder = Arc::new(FakeDecoder::with_pages(3));
        decoder.fail_page(1);
        let pipeline = pipeline(decoder, RenderMode::DecodedPages);

        let mut pass = pipeline.open(key_for("doc-a", 1)).await.unwrap();
        let events = drain(&mut pass).await;
        assert_eq!(events.len(), 3);

        let slots = pipeline.snapshot();
        assert!(matches!(slots[0], PageSlot::Ready(_)));
        assert!(matches!(slots[1], PageSlot::Failed(_)));
        assert!(matches!(slots[2], PageSlot::Ready(_)));
    }

    #[tokio::test]
    async fn fetch_and_parse_failures_are_distinct() {
        let decoder = Arc::new(FakeDecoder::with_pages(1));
        let broken_transport = RenderPipeline::decoded(
            Arc::new(FakeService { fail_fetch: true }),
            Arc::clone(&decoder) as Arc<dyn PageDecoder>,
        );
        let err = broken_transport.open(key_for("doc-a", 1)).await.unwrap_err();
        assert!(matches!(err, DocumentLoadError::Fetch(_)));

        let rejecting = Arc::new(FakeDecoder {
            page_count: 1,
            reject_open: true,
            ..FakeDecoder::default()
        });
        let pipeline = pipeline(rejecting, RenderMode::DecodedPages);
        let err = pipeline.open(key_for("doc-a", 1)).await.unwrap_err();
        assert!(matches!(err, DocumentLoadError::Parse(_)));
    }

    #[tokio::test]
    async fn zoom_change_renders_at_the_new_factor() {
        let decoder = Arc::new(FakeDecoder::with_pages(1));
        let pipeline = pipeline(decoder, RenderMode::DecodedPages);

        let mut key = key_for("doc-a", 1);
        let mut pass = pipeline.open(key.clone()).await.unwrap();
        let events = drain(&mut pass).await;
        let RenderEvent::Page {
            slot: PageSlot::Ready(surface),
            ..
        } = &events[0]
        else {
            panic!("expected a rendered page");
        };
        assert_eq!(*surface.pixels.last().unwrap(), 150);

        key.zoom = ZoomFactor::new(2.0);
        let mut pass = pipeline.open(key).await.unwrap();
        let events = drain(&mut pass).await;
        let RenderEvent::Page {
            slot: PageSlot::Ready(surface),
            ..
        } = &events[0]
        else {
            panic!("expected a rendered page");
        };
        assert_eq!(*surface.pixels.last().unwrap(), 200);
    }

    #[tokio::test]
    async fn embedded_passthrough_emits_version_keyed_bytes() {
        let decoder = Arc::new(FakeDecoder::with_pages(0));
        let pipeline = pipeline(decoder, RenderMode::EmbeddedPassthrough);

        let mut pass = pipeline.open(key_for("doc-a", 2)).await.unwrap();
        assert_eq!(pass.page_count, 1);

        let events = drain(&mut pass).await;
        assert_eq!(events.len(), 1);
        let RenderEvent::Embedded { bytes } = &events[0] else {
            panic!("expected embedded bytes");
        };
        assert_eq!(bytes.as_ref(), b"doc-a:v2");
    }
}
