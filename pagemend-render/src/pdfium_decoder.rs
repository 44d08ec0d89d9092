use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;
use pdfium_render::prelude::*;
use tracing::warn;

use pagemend_core::{DocumentLoadError, PageRenderError, Surface, ZoomFactor};

use crate::decoder_runtime::{self, RuntimeError};
use crate::{DecodedDocument, PageDecoder};

/// Pdfium-backed [`PageDecoder`]. Binds the pdfium library through the
/// decoder runtime, so a process gets exactly one binding.
pub struct PdfiumPageDecoder {
    pdfium: Arc<Pdfium>,
}

impl PdfiumPageDecoder {
    pub fn new() -> Result<Self, RuntimeError> {
        decoder_runtime::init()?;
        let pdfium = bind_pdfium().inspect_err(|_| decoder_runtime::teardown())?;
        Ok(Self {
            pdfium: Arc::new(pdfium),
        })
    }
}

#[async_trait::async_trait]
impl PageDecoder for PdfiumPageDecoder {
    async fn open(&self, bytes: Vec<u8>) -> Result<Arc<dyn DecodedDocument>, DocumentLoadError> {
        let document = self
            .pdfium
            .load_pdf_from_byte_vec(bytes, None)
            .map_err(|err| DocumentLoadError::Parse(err.to_string()))?;
        // SAFETY: the returned PdfDocument holds a reference to the Pdfium
        // bindings owned by self.pdfium. PdfiumDocument stores an Arc clone
        // of those bindings and declares the document field first, so the
        // document drops before the bindings (struct fields drop in
        // declaration order). The reference therefore stays valid for the
        // document's whole lifetime.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
        let page_count = document.pages().len() as usize;
        Ok(Arc::new(PdfiumDocument {
            document: Mutex::new(document),
            page_count,
            pdfium: Arc::clone(&self.pdfium),
        }))
    }
}

struct PdfiumDocument {
    document: Mutex<PdfDocument<'static>>,
    page_count: usize,
    #[allow(dead_code)]
    pdfium: Arc<Pdfium>,
}

#[async_trait::async_trait]
impl DecodedDocument for PdfiumDocument {
    fn page_count(&self) -> usize {
        self.page_count
    }

    async fn render_page(
        &self,
        page_index: usize,
        zoom: ZoomFactor,
    ) -> Result<Surface, PageRenderError> {
        let fail = |detail: String| PageRenderError {
            page: page_index,
            detail,
        };

        let index: PdfPageIndex = page_index
            .try_into()
            .map_err(|_| fail("page index out of supported range".into()))?;

        let document = self.document.lock();
        let page = document
            .pages()
            .get(index)
            .map_err(|err| fail(err.to_string()))?;

        let config = PdfRenderConfig::new().scale_page_by_factor(zoom.value().max(0.1));
        let bitmap = page
            .render_with_config(&config)
            .map_err(|err| fail(err.to_string()))?;
        let image: image::RgbaImage = bitmap.as_image().to_rgba8();
        let (width, height) = image.dimensions();

        Ok(Surface {
            width,
            height,
            pixels: image.into_raw(),
        })
    }
}

fn bind_pdfium() -> Result<Pdfium, RuntimeError> {
    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");
    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => {
            warn!(path = %cwd_path.display(), %err, "no pdfium library beside the executable");
        }
    }

    Pdfium::bind_to_system_library()
        .map(Pdfium::new)
        .map_err(|err| RuntimeError::Bind(err.to_string()))
}
