//! HTTP implementation of [`DocumentService`] against the document
//! service's REST surface:
//!
//! - `POST {base}/upload` — multipart form, field `file`
//! - `GET {base}/{id}/find?page_num=&query=`
//! - `POST {base}/{id}/replace` — JSON body
//! - `GET {base}/{id}/download?v=&t=` — current document bytes
//!
//! ureq is a blocking client, so every request runs inside
//! `spawn_blocking` to keep the runtime's worker threads free for
//! render tasks.

use std::io::Read;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use pagemend_core::{
    ContentVersion, DocumentHandle, DocumentLoadError, DocumentService, FindError, ReplaceError,
    ReplaceRequest, SearchHit, UploadError,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MULTIPART_BOUNDARY: &str = "pagemend-boundary-7d2f1c9b";

#[derive(Clone)]
pub struct HttpDocumentService {
    agent: ureq::Agent,
    base: Url,
}

impl HttpDocumentService {
    /// `base` is the service prefix, e.g. `http://localhost:8000/api/v1/pdf`.
    /// A trailing slash is appended if missing so `Url::join` treats the
    /// last path segment as a directory.
    pub fn new(base: &str) -> Result<Self, url::ParseError> {
        let mut base = base.to_owned();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = Url::parse(&base)?;
        let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();
        Ok(Self { agent, base })
    }

    fn endpoint(&self, path: &str) -> Result<Url, String> {
        self.base
            .join(path)
            .map_err(|err| format!("invalid endpoint {path}: {err}"))
    }

    fn download_url(&self, handle: &DocumentHandle, version: ContentVersion) -> Result<Url, String> {
        let mut url = self.endpoint(&format!("{}/download", handle.as_str()))?;
        // The version defeats any cache keyed on the bare handle; the
        // timestamp defeats intermediaries that ignore the query string
        // semantics entirely.
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        url.query_pairs_mut()
            .append_pair("v", &version.value().to_string())
            .append_pair("t", &millis.to_string());
        Ok(url)
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct FindResponse {
    hits: Vec<WireHit>,
}

#[derive(Debug, Deserialize)]
struct WireHit {
    span_text: String,
    found_text: String,
}

#[derive(Debug, Serialize)]
struct ReplaceBody {
    page_num: u32,
    hit_index: usize,
    old_text: String,
    new_text: String,
}

/// Multipart body with a single `file` part, as the upload endpoint
/// expects. Hand-built so the request is one contiguous byte buffer.
fn multipart_file_body(boundary: &str, filename: &str, bytes: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(bytes.len() + 256);
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/pdf\r\n\r\n");
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

fn status_detail(code: u16, response: ureq::Response) -> String {
    let body = response.into_string().unwrap_or_default();
    let body = body.trim();
    if body.is_empty() {
        format!("HTTP {code}")
    } else {
        format!("HTTP {code}: {body}")
    }
}

#[async_trait::async_trait]
impl DocumentService for HttpDocumentService {
    async fn upload(&self, bytes: Vec<u8>, filename: &str) -> Result<DocumentHandle, UploadError> {
        let url = self
            .endpoint("upload")
            .map_err(UploadError::Network)?
            .to_string();
        let agent = self.agent.clone();
        let body = multipart_file_body(MULTIPART_BOUNDARY, filename, &bytes);
        debug!(%url, size = bytes.len(), "uploading document");

        let response = tokio::task::spawn_blocking(move || {
            agent
                .post(&url)
                .set(
                    "Content-Type",
                    &format!("multipart/form-data; boundary={MULTIPART_BOUNDARY}"),
                )
                .send_bytes(&body)
        })
        .await
        .map_err(|err| UploadError::Network(err.to_string()))?;

        let response = response.map_err(|err| match err {
            ureq::Error::Status(413, response) => {
                UploadError::TooLarge(status_detail(413, response))
            }
            ureq::Error::Status(code @ (400 | 415), response) => {
                UploadError::UnsupportedFormat(status_detail(code, response))
            }
            ureq::Error::Status(code, response) => {
                UploadError::Network(status_detail(code, response))
            }
            ureq::Error::Transport(transport) => UploadError::Network(transport.to_string()),
        })?;

        let payload: UploadResponse = response
            .into_json()
            .map_err(|err| UploadError::Network(format!("malformed upload response: {err}")))?;
        Ok(DocumentHandle::new(payload.file_id))
    }

    async fn find(
        &self,
        handle: &DocumentHandle,
        page_number: u32,
        query: &str,
    ) -> Result<Vec<SearchHit>, FindError> {
        let mut url = self
            .endpoint(&format!("{}/find", handle.as_str()))
            .map_err(FindError::Network)?;
        url.query_pairs_mut()
            .append_pair("page_num", &page_number.to_string())
            .append_pair("query", query);
        let url = url.to_string();
        let agent = self.agent.clone();
        debug!(%url, "searching page");

        let response = tokio::task::spawn_blocking(move || agent.get(&url).call())
            .await
            .map_err(|err| FindError::Network(err.to_string()))?;

        let response = response.map_err(|err| match err {
            ureq::Error::Status(code, response) => {
                FindError::Rejected(status_detail(code, response))
            }
            ureq::Error::Transport(transport) => FindError::Network(transport.to_string()),
        })?;

        let payload: FindResponse = response
            .into_json()
            .map_err(|err| FindError::Network(format!("malformed find response: {err}")))?;
        Ok(payload
            .hits
            .into_iter()
            .enumerate()
            .map(|(index, hit)| SearchHit {
                index,
                span_text: hit.span_text,
                found_text: hit.found_text,
            })
            .collect())
    }

    async fn replace(
        &self,
        handle: &DocumentHandle,
        request: ReplaceRequest,
    ) -> Result<(), ReplaceError> {
        let url = self
            .endpoint(&format!("{}/replace", handle.as_str()))
            .map_err(ReplaceError::Network)?
            .to_string();
        let agent = self.agent.clone();
        let body = ReplaceBody {
            page_num: request.page_number,
            hit_index: request.hit_index,
            old_text: request.old_text,
            new_text: request.new_text,
        };
        debug!(%url, hit_index = body.hit_index, "requesting replace");

        let response = tokio::task::spawn_blocking(move || agent.post(&url).send_json(&body))
            .await
            .map_err(|err| ReplaceError::Network(err.to_string()))?;

        response
            .map_err(|err| match err {
                // The service answers 400 when the hit no longer matches
                // the document's current text.
                ureq::Error::Status(400, response) => {
                    ReplaceError::StaleHit(status_detail(400, response))
                }
                ureq::Error::Status(code, response) => {
                    ReplaceError::Rejected(status_detail(code, response))
                }
                ureq::Error::Transport(transport) => ReplaceError::Network(transport.to_string()),
            })
            .map(|_| ())
    }

    async fn fetch_for_render(
        &self,
        handle: &DocumentHandle,
        version: ContentVersion,
    ) -> Result<Vec<u8>, DocumentLoadError> {
        let url = self
            .download_url(handle, version)
            .map_err(DocumentLoadError::Fetch)?
            .to_string();
        let agent = self.agent.clone();
        debug!(%url, "fetching document bytes");

        tokio::task::spawn_blocking(move || {
            let response = agent.get(&url).call().map_err(|err| match err {
                ureq::Error::Status(code, response) => {
                    DocumentLoadError::Fetch(status_detail(code, response))
                }
                ureq::Error::Transport(transport) => {
                    DocumentLoadError::Fetch(transport.to_string())
                }
            })?;
            let mut bytes = Vec::new();
            response
                .into_reader()
                .read_to_end(&mut bytes)
                .map_err(|err| DocumentLoadError::Fetch(err.to_string()))?;
            Ok(bytes)
        })
        .await
        .map_err(|err| DocumentLoadError::Fetch(err.to_string()))?
    }
}
