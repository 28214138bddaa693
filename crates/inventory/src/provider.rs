use std::future::Future;
use std::pin::Pin;

use batchpull_model::{CollectionRef, FileSeed};
use tokio_util::sync::CancellationToken;

use crate::ListingError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Files of a collection as reported by the remote side.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Listing {
    pub entries: Vec<FileSeed>,
    /// File count the remote advertises, when it advertises one.
    pub reported_total: Option<usize>,
}

/// Enumerates the files of a remote collection.
///
/// Implementations must check `cancel` between requests and return
/// [`ListingError::Cancelled`] once it fires.
pub trait ListingProvider: Send + Sync {
    fn list_files<'a>(
        &'a self,
        collection: &'a CollectionRef,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<Listing, ListingError>>;
}
