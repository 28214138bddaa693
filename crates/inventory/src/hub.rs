//! Listing provider for Hugging Face compatible hubs.

use std::collections::BTreeSet;
use std::time::Duration;

use batchpull_model::{CollectionKind, CollectionRef, FileSeed};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ListingError;
use crate::provider::{BoxFuture, Listing, ListingProvider};

/// Mirror used when no endpoint is configured.
pub const DEFAULT_ENDPOINT: &str = "https://hf-mirror.com";

const PAGE_SIZE: usize = 10_000;
const MAX_PAGES: usize = 1_000;

/// Escaped inside a single URL path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b']')
    .add(b'\\')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}')
    .add(b'/');

/// File paths keep their `/` separators; each segment is escaped.
fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| utf8_percent_encode(segment, SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Revisions such as `refs/convert/parquet` travel as one segment.
fn encode_revision(revision: &str) -> String {
    utf8_percent_encode(revision, SEGMENT).to_string()
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    #[serde(rename = "type")]
    kind: String,
    path: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    lfs: Option<LfsPointer>,
}

#[derive(Debug, Deserialize)]
struct LfsPointer {
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
struct RepoInfo {
    #[serde(default)]
    siblings: Vec<Sibling>,
}

#[derive(Debug, Deserialize)]
struct Sibling {
    rfilename: String,
    #[serde(default)]
    size: Option<u64>,
}

/// Pages through `/api/{datasets|models}/{repo}/tree/{revision}` and fills
/// gaps from the repo's `siblings` list.
pub struct HubListingProvider {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    page_size: usize,
}

impl HubListingProvider {
    pub fn new(
        endpoint: &str,
        token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, ListingError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ListingError::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, endpoint, token))
    }

    pub fn with_client(client: reqwest::Client, endpoint: &str, token: Option<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
            page_size: PAGE_SIZE,
        }
    }

    /// Download URL of one file of the collection.
    pub fn file_url(&self, collection: &CollectionRef, path: &str) -> String {
        let prefix = match collection.kind {
            CollectionKind::Dataset => "datasets/",
            CollectionKind::Model => "",
        };
        format!(
            "{}/{prefix}{}/resolve/{}/{}",
            self.endpoint,
            collection.repo_id,
            encode_revision(&collection.revision),
            encode_path(path)
        )
    }

    fn tree_url(&self, collection: &CollectionRef) -> String {
        format!(
            "{}/api/{}/{}/tree/{}",
            self.endpoint,
            collection.kind.api_segment(),
            collection.repo_id,
            encode_revision(&collection.revision)
        )
    }

    fn info_url(&self, collection: &CollectionRef) -> String {
        format!(
            "{}/api/{}/{}/revision/{}",
            self.endpoint,
            collection.kind.api_segment(),
            collection.repo_id,
            encode_revision(&collection.revision)
        )
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, ListingError> {
        let mut request = self.client.get(url).query(query);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ListingError::Http(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ListingError::NotFound(format!("{url} returned status {status}")));
        }
        if !status.is_success() {
            return Err(ListingError::Http(format!("{url} returned status {status}")));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ListingError::Invalid(format!("failed to decode {url}: {e}")))
    }

    async fn list(
        &self,
        collection: &CollectionRef,
        cancel: CancellationToken,
    ) -> Result<Listing, ListingError> {
        let url = self.tree_url(collection);
        let mut seen = BTreeSet::new();
        let mut entries = Vec::new();

        for page in 1..=MAX_PAGES {
            if cancel.is_cancelled() {
                return Err(ListingError::Cancelled);
            }
            let query = [
                ("recursive", "true".to_string()),
                ("page", page.to_string()),
                ("page_size", self.page_size.to_string()),
            ];
            let batch: Vec<TreeEntry> = tokio::select! {
                _ = cancel.cancelled() => return Err(ListingError::Cancelled),
                result = self.get_json::<Vec<TreeEntry>>(&url, &query) => result?,
            };
            let fetched = batch.len();
            let mut added = 0;
            for entry in batch.into_iter().filter(|e| e.kind == "file") {
                if seen.insert(entry.path.clone()) {
                    let size = entry.lfs.map(|l| l.size).filter(|&s| s > 0).unwrap_or(entry.size);
                    let locator = self.file_url(collection, &entry.path);
                    entries.push(FileSeed::new(entry.path, locator, size)?);
                    added += 1;
                }
            }
            debug!(page, fetched, added, "listed tree page");
            // Servers that ignore `page` repeat the first page forever.
            if fetched < self.page_size || added == 0 {
                break;
            }
        }

        let reported_total = match self.get_json::<RepoInfo>(&self.info_url(collection), &[]).await {
            Ok(info) => {
                let total = info.siblings.len();
                if total > entries.len() {
                    let before = entries.len();
                    merge_siblings(&mut entries, &mut seen, info.siblings, |p| {
                        self.file_url(collection, p)
                    });
                    info!(
                        listed = before,
                        reported = total,
                        merged = entries.len() - before,
                        "supplemented listing from siblings"
                    );
                }
                Some(total)
            }
            Err(e) => {
                warn!(collection = %collection, error = %e, "repo info unavailable");
                None
            }
        };

        Ok(Listing {
            entries,
            reported_total,
        })
    }
}

/// Appends siblings not yet listed. Siblings without a size get `0`.
fn merge_siblings(
    entries: &mut Vec<FileSeed>,
    seen: &mut BTreeSet<String>,
    siblings: Vec<Sibling>,
    locator: impl Fn(&str) -> String,
) {
    for sibling in siblings {
        if !seen.insert(sibling.rfilename.clone()) {
            continue;
        }
        let url = locator(&sibling.rfilename);
        match FileSeed::new(sibling.rfilename, url, sibling.size.unwrap_or(0)) {
            Ok(seed) => entries.push(seed),
            Err(e) => warn!(error = %e, "skipping sibling with unusable name"),
        }
    }
}

impl ListingProvider for HubListingProvider {
    fn list_files<'a>(
        &'a self,
        collection: &'a CollectionRef,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<Listing, ListingError>> {
        Box::pin(self.list(collection, cancel))
    }
}
