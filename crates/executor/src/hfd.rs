//! Adoption of downloads started with hfd.
//!
//! hfd keeps its state in a `.hfd/` directory next to the files: the
//! aria2c input it generated (`aria2c_urls.txt`), the repository info it
//! fetched (`repo_metadata.json`) and the variables of the last run
//! (`last_download_command`).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use batchpull_model::{CollectionKind, CollectionRef, FileSeed, FileStatus};
use batchpull_transfer::{parse_input, probe_file};
use tracing::{debug, warn};

use crate::service::ServiceError;

const METADATA_DIR: &str = ".hfd";
const URLS_FILE: &str = "aria2c_urls.txt";
const REPO_METADATA_FILE: &str = "repo_metadata.json";
const LAST_COMMAND_FILE: &str = "last_download_command";

/// aria2c leaves this next to a file it has not finished.
const CONTROL_SUFFIX: &str = ".aria2";

#[derive(Debug, Clone, PartialEq)]
pub struct ImportedFile {
    pub seed: FileSeed,
    pub status: FileStatus,
}

/// What an hfd directory says about a collection and its files.
#[derive(Debug, Clone)]
pub struct HfdSource {
    pub metadata_dir: PathBuf,
    pub collection: CollectionRef,
    pub files: Vec<ImportedFile>,
}

impl HfdSource {
    pub fn completed(&self) -> impl Iterator<Item = &ImportedFile> {
        self.files
            .iter()
            .filter(|f| f.status == FileStatus::Completed)
    }
}

/// Accepts either the download directory or its `.hfd` subdirectory.
pub fn metadata_dir(source: &Path) -> PathBuf {
    if source.file_name().is_some_and(|n| n == METADATA_DIR) {
        source.to_path_buf()
    } else {
        source.join(METADATA_DIR)
    }
}

/// Reads the hfd state under `source` and checks each listed file against
/// `target`, where the files actually live.
pub fn read_source(source: &Path, target: &Path) -> Result<HfdSource, ServiceError> {
    let dir = metadata_dir(source);
    let urls = dir.join(URLS_FILE);
    let text = fs::read_to_string(&urls).map_err(|e| {
        ServiceError::Import(format!("cannot read {}: {e}", urls.display()))
    })?;
    let entries = parse_input(&text)?;
    if entries.is_empty() {
        return Err(ServiceError::Import(format!(
            "{} lists no files",
            urls.display()
        )));
    }

    let vars = read_last_command(&dir.join(LAST_COMMAND_FILE));
    let metadata = read_repo_metadata(&dir.join(REPO_METADATA_FILE))?;
    let first_uri = &entries[0].uri;

    let repo_id = vars
        .get("REPO_ID")
        .cloned()
        .or_else(|| metadata.id.clone())
        .ok_or_else(|| ServiceError::Import("no repository id in hfd metadata".into()))?;
    let kind = match vars.get("DATASET").map(String::as_str) {
        Some("1" | "true") => CollectionKind::Dataset,
        Some(_) => CollectionKind::Model,
        None if first_uri.contains("/datasets/") => CollectionKind::Dataset,
        None => CollectionKind::Model,
    };
    let revision = vars
        .get("REVISION")
        .filter(|r| !r.is_empty())
        .cloned()
        .or_else(|| revision_from_uri(first_uri))
        .unwrap_or_else(|| "main".into());
    let collection = CollectionRef::new(repo_id, kind, revision)?;

    let mut files = Vec::with_capacity(entries.len());
    for (n, entry) in entries.iter().enumerate() {
        let identity = entry.relative_path().ok_or_else(|| {
            ServiceError::Import(format!("entry {} ({}) has no relative path", n + 1, entry.uri))
        })?;
        let listed = metadata.sizes.get(&identity).copied();
        let status = file_status(&target.join(&identity), listed)?;
        let size = match status {
            FileStatus::Completed => probe_file(&target.join(&identity))?.unwrap_or(0),
            _ => listed.unwrap_or(0),
        };
        files.push(ImportedFile {
            seed: FileSeed::new(identity, entry.uri.clone(), size)?,
            status,
        });
    }

    debug!(
        dir = %dir.display(),
        collection = %collection,
        files = files.len(),
        "read hfd state"
    );
    Ok(HfdSource {
        metadata_dir: dir,
        collection,
        files,
    })
}

/// Completed when the file is there, aria2c is done with it, and its size
/// agrees with the listing when one is known.
fn file_status(path: &Path, listed: Option<u64>) -> Result<FileStatus, ServiceError> {
    let Some(actual) = probe_file(path)? else {
        return Ok(FileStatus::Pending);
    };
    let mut control = path.as_os_str().to_owned();
    control.push(CONTROL_SUFFIX);
    if Path::new(&control).exists() {
        return Ok(FileStatus::Pending);
    }
    match listed {
        Some(expected) if expected > 0 && expected != actual => Ok(FileStatus::Pending),
        _ => Ok(FileStatus::Completed),
    }
}

/// `KEY=value` pairs separated by whitespace. Missing or unreadable is empty.
fn read_last_command(path: &Path) -> HashMap<String, String> {
    let Ok(text) = fs::read_to_string(path) else {
        return HashMap::new();
    };
    text.split_whitespace()
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[derive(Debug, Default)]
struct RepoMetadata {
    id: Option<String>,
    sizes: HashMap<String, u64>,
}

fn read_repo_metadata(path: &Path) -> Result<RepoMetadata, ServiceError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "no repository metadata, sizes unknown");
            return Ok(RepoMetadata::default());
        }
        Err(e) => {
            return Err(ServiceError::Import(format!(
                "cannot read {}: {e}",
                path.display()
            )));
        }
    };
    let value: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| ServiceError::Import(format!("{}: {e}", path.display())))?;

    let sizes = value["siblings"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|s| Some((s["rfilename"].as_str()?.to_string(), s["size"].as_u64()?)))
        .collect();
    Ok(RepoMetadata {
        id: value["id"].as_str().map(str::to_string),
        sizes,
    })
}

/// `…/resolve/<revision>/…` in a hub download URL.
fn revision_from_uri(uri: &str) -> Option<String> {
    let mut segments = uri.split('/');
    segments.find(|s| *s == "resolve")?;
    segments
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_hfd(root: &Path, urls: &str, metadata: &str, command: Option<&str>) {
        let dir = root.join(METADATA_DIR);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(URLS_FILE), urls).unwrap();
        fs::write(dir.join(REPO_METADATA_FILE), metadata).unwrap();
        if let Some(command) = command {
            fs::write(dir.join(LAST_COMMAND_FILE), command).unwrap();
        }
    }

    const URLS: &str = "\
https://hf-mirror.com/datasets/org/set/resolve/main/data/a.parquet
  dir=data
  out=a.parquet
https://hf-mirror.com/datasets/org/set/resolve/main/data/b.parquet
  dir=data
  out=b.parquet
https://hf-mirror.com/datasets/org/set/resolve/main/c.json
  out=c.json
";

    #[test]
    fn files_on_disk_are_completed_unless_aria2_is_still_on_them() {
        let root = tempfile::tempdir().unwrap();
        write_hfd(
            root.path(),
            URLS,
            r#"{"id": "org/set", "siblings": [{"rfilename": "data/a.parquet", "size": 4}]}"#,
            Some("REPO_ID=org/set DATASET=1 REVISION=main TOOL=aria2c"),
        );
        fs::create_dir_all(root.path().join("data")).unwrap();
        fs::write(root.path().join("data/a.parquet"), [0u8; 4]).unwrap();
        fs::write(root.path().join("data/b.parquet"), [0u8; 2]).unwrap();
        fs::write(root.path().join("data/b.parquet.aria2"), b"ctl").unwrap();

        let source = read_source(root.path(), root.path()).unwrap();
        assert_eq!(source.collection.repo_id, "org/set");
        assert_eq!(source.collection.kind, CollectionKind::Dataset);
        assert_eq!(source.files.len(), 3);

        let status: HashMap<&str, FileStatus> = source
            .files
            .iter()
            .map(|f| (f.seed.identity.as_str(), f.status))
            .collect();
        assert_eq!(status["data/a.parquet"], FileStatus::Completed);
        assert_eq!(status["data/b.parquet"], FileStatus::Pending);
        assert_eq!(status["c.json"], FileStatus::Pending);
        assert_eq!(source.completed().count(), 1);
        assert_eq!(source.files[0].seed.size, 4);
    }

    #[test]
    fn accepts_the_metadata_dir_itself_and_infers_from_urls() {
        let root = tempfile::tempdir().unwrap();
        let urls = "https://hub/org/net/resolve/v2/model.safetensors\n  out=model.safetensors\n";
        write_hfd(root.path(), urls, r#"{"id": "org/net"}"#, None);

        let source = read_source(&root.path().join(".hfd"), root.path()).unwrap();
        assert_eq!(source.collection.kind, CollectionKind::Model);
        assert_eq!(source.collection.revision, "v2");
        assert_eq!(source.files[0].seed.size, 0);
    }

    #[test]
    fn size_disagreeing_with_listing_is_not_completed() {
        let root = tempfile::tempdir().unwrap();
        write_hfd(
            root.path(),
            URLS,
            r#"{"id": "org/set", "siblings": [{"rfilename": "c.json", "size": 10}]}"#,
            None,
        );
        fs::write(root.path().join("c.json"), [0u8; 3]).unwrap();
        let source = read_source(root.path(), root.path()).unwrap();
        let c = source.files.iter().find(|f| f.seed.identity == "c.json").unwrap();
        assert_eq!(c.status, FileStatus::Pending);
        assert_eq!(c.seed.size, 10);
    }

    #[test]
    fn missing_state_is_an_import_error() {
        let root = tempfile::tempdir().unwrap();
        let err = read_source(root.path(), root.path()).unwrap_err();
        assert!(matches!(err, ServiceError::Import(_)));

        write_hfd(root.path(), "", "{}", None);
        assert!(matches!(
            read_source(root.path(), root.path()).unwrap_err(),
            ServiceError::Import(_)
        ));
    }
}
