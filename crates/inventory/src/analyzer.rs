use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use batchpull_model::{CollectionKind, CollectionRef, FileSeed, format_size};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ListingError;
use crate::provider::{Listing, ListingProvider};

const MIB: u64 = 1024 * 1024;

/// How many of the largest files an analysis reports.
const LARGEST_FILES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMode {
    /// Every file listed, sizes exact.
    Full,
    /// Every file listed, total size extrapolated from a sample.
    Sampled,
    /// Nothing listed; an order-of-magnitude guess.
    Estimated,
}

impl std::fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => f.write_str("full"),
            Self::Sampled => f.write_str("sampled"),
            Self::Estimated => f.write_str("estimated"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
    /// Sample even small collections.
    pub quick: bool,
    pub sample_size: usize,
    pub timeout: Duration,
    /// Collections with more files than this are sampled.
    pub large_collection_threshold: usize,
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        Self {
            quick: false,
            sample_size: 100,
            timeout: Duration::from_secs(30),
            large_collection_threshold: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TypeStats {
    pub count: usize,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InventoryAnalysis {
    pub collection: CollectionRef,
    pub mode: AnalysisMode,
    /// The listed files; empty in estimated mode.
    pub inventory: Vec<FileSeed>,
    pub total_files: usize,
    /// Exact in full mode, extrapolated otherwise.
    pub total_size: u64,
    pub sample_count: usize,
    pub largest_files: Vec<FileSeed>,
    pub file_types: BTreeMap<String, TypeStats>,
    pub elapsed: Duration,
    pub is_estimated: bool,
    pub reported_total: Option<usize>,
    pub note: Option<String>,
}

impl InventoryAnalysis {
    /// Whether the inventory can drive planning and execution.
    ///
    /// An estimate carries no file list, so it never can.
    pub fn is_actionable(&self) -> bool {
        self.mode != AnalysisMode::Estimated && !self.inventory.is_empty()
    }

    /// Exact sum of the listed sizes.
    pub fn listed_size(&self) -> u64 {
        self.inventory.iter().map(|f| f.size).sum()
    }
}

/// Bounds enumeration in time and summarises the result.
pub struct InventoryAnalyzer {
    provider: Arc<dyn ListingProvider>,
    seed: Option<u64>,
}

impl InventoryAnalyzer {
    pub fn new(provider: Arc<dyn ListingProvider>) -> Self {
        Self {
            provider,
            seed: None,
        }
    }

    /// Fixes the sampling RNG seed for reproducible samples.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Analyzes a collection.
    ///
    /// Never fails: a timed out, failed, cancelled or empty enumeration
    /// degrades to [`AnalysisMode::Estimated`] with the reason in `note`.
    pub async fn analyze(
        &self,
        collection: &CollectionRef,
        options: &AnalyzeOptions,
        cancel: &CancellationToken,
    ) -> InventoryAnalysis {
        let started = Instant::now();
        let token = cancel.child_token();

        let listed = tokio::time::timeout(
            options.timeout,
            self.provider.list_files(collection, token.clone()),
        )
        .await;

        let listing = match listed {
            Ok(Ok(listing)) if !listing.entries.is_empty() => listing,
            Ok(Ok(_)) => {
                warn!(collection = %collection, "listing returned no files");
                return estimate(collection, "listing returned no files", started);
            }
            Ok(Err(e)) => {
                warn!(collection = %collection, error = %e, "enumeration failed");
                return estimate(collection, &format!("enumeration failed: {e}"), started);
            }
            Err(_) => {
                token.cancel();
                let e = ListingError::Timeout(options.timeout);
                warn!(collection = %collection, error = %e, "enumeration aborted");
                return estimate(collection, &e.to_string(), started);
            }
        };

        let total_files = listing.entries.len();
        let sampled = options.quick || total_files > options.large_collection_threshold;
        let analysis = if sampled {
            let mut rng = match self.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            let sample = sample_files(&listing.entries, options.sample_size.max(1), &mut rng);
            let mean = sample.iter().map(|f| f.size as f64).sum::<f64>() / sample.len() as f64;
            let estimated = (mean * total_files as f64) as u64;
            summarise(collection, listing, AnalysisMode::Sampled, estimated, sample.len(), started)
        } else {
            let exact = listing.entries.iter().map(|f| f.size).sum();
            summarise(collection, listing, AnalysisMode::Full, exact, total_files, started)
        };

        info!(
            collection = %collection,
            mode = %analysis.mode,
            files = analysis.total_files,
            size = %format_size(analysis.total_size),
            elapsed_ms = analysis.elapsed.as_millis() as u64,
            "analysis finished"
        );
        analysis
    }
}

/// The largest `k / 2` files plus a uniform sample of the rest.
fn sample_files(files: &[FileSeed], k: usize, rng: &mut StdRng) -> Vec<FileSeed> {
    let mut sorted = files.to_vec();
    sorted.sort_by(|a, b| b.size.cmp(&a.size));
    let large = (k / 2).min(sorted.len());
    let (top, rest) = sorted.split_at(large);
    let random = (k - large).min(rest.len());

    let mut sample = top.to_vec();
    sample.extend(rest.choose_multiple(rng, random).cloned());
    sample
}

fn summarise(
    collection: &CollectionRef,
    listing: Listing,
    mode: AnalysisMode,
    total_size: u64,
    sample_count: usize,
    started: Instant,
) -> InventoryAnalysis {
    let mut file_types: BTreeMap<String, TypeStats> = BTreeMap::new();
    for file in &listing.entries {
        let stats = file_types.entry(file.extension()).or_default();
        stats.count += 1;
        stats.size += file.size;
    }
    let mut largest_files = listing.entries.clone();
    largest_files.sort_by(|a, b| b.size.cmp(&a.size));
    largest_files.truncate(LARGEST_FILES);

    let note = match listing.reported_total {
        Some(reported) if reported > listing.entries.len() => Some(format!(
            "remote reports {reported} files but only {} could be listed",
            listing.entries.len()
        )),
        _ => None,
    };

    InventoryAnalysis {
        collection: collection.clone(),
        mode,
        total_files: listing.entries.len(),
        inventory: listing.entries,
        total_size,
        sample_count,
        largest_files,
        file_types,
        elapsed: started.elapsed(),
        is_estimated: mode != AnalysisMode::Full,
        reported_total: listing.reported_total,
        note,
    }
}

/// Heuristic size guess used when nothing could be listed.
fn estimate(collection: &CollectionRef, reason: &str, started: Instant) -> InventoryAnalysis {
    let (files, per_file) = match collection.kind {
        CollectionKind::Dataset => (1000, 50 * MIB),
        CollectionKind::Model => (100, 10 * MIB),
    };
    InventoryAnalysis {
        collection: collection.clone(),
        mode: AnalysisMode::Estimated,
        inventory: Vec::new(),
        total_files: files,
        total_size: files as u64 * per_file,
        sample_count: 0,
        largest_files: Vec::new(),
        file_types: BTreeMap::new(),
        elapsed: started.elapsed(),
        is_estimated: true,
        reported_total: None,
        note: Some(format!(
            "{reason}; size is a rough guess for a {} and cannot be used for planning",
            collection.kind
        )),
    }
}
