//! Inventory of a remote collection.
//!
//! A [`ListingProvider`] enumerates the files of a collection;
//! [`InventoryAnalyzer`] bounds that enumeration in time and turns it into a
//! full, sampled or estimated [`InventoryAnalysis`].

mod analyzer;
mod hub;
mod provider;

pub use analyzer::{
    AnalysisMode, AnalyzeOptions, InventoryAnalysis, InventoryAnalyzer, TypeStats,
};
pub use hub::{DEFAULT_ENDPOINT, HubListingProvider};
pub use provider::{BoxFuture, Listing, ListingProvider};

/// Errors produced while enumerating a collection.
#[derive(Debug, thiserror::Error)]
pub enum ListingError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("collection not found or not accessible: {0}")]
    NotFound(String),

    #[error("enumeration timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("enumeration cancelled")]
    Cancelled,

    #[error("invalid listing: {0}")]
    Invalid(String),

    #[error(transparent)]
    Model(#[from] batchpull_model::ModelError),
}
