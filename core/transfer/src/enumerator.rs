//! Paged enumeration of a source listing.

use std::sync::Arc;
use tracing::debug;

use skyferry_common::{Error, Result, SourceFile};
use skyferry_storage::SourceProvider;

use crate::retry::RetryExecutor;

/// Pulls listing pages from a source until it reports no continuation token.
pub struct SourceEnumerator {
    source: Arc<dyn SourceProvider>,
    page_size: u32,
    retry: RetryExecutor,
    next_token: Option<String>,
    pages: usize,
    done: bool,
}

impl SourceEnumerator {
    /// Create an enumerator starting at the first page.
    pub fn new(source: Arc<dyn SourceProvider>, page_size: u32, retry: RetryExecutor) -> Self {
        Self {
            source,
            page_size,
            retry,
            next_token: None,
            pages: 0,
            done: false,
        }
    }

    /// Fetch the next page; `Ok(None)` once the listing is exhausted.
    ///
    /// Transient failures are retried. An empty page with a continuation
    /// token is returned as an empty batch, not as the end.
    ///
    /// # Errors
    /// - Authentication errors, unchanged
    /// - `Enumeration` for any other failure left after retries
    pub async fn next_page(&mut self) -> Result<Option<Vec<SourceFile>>> {
        if self.done {
            return Ok(None);
        }

        let token = self.next_token.clone();
        let page = self
            .retry
            .execute(|| self.source.list_page(token.as_deref(), self.page_size))
            .await
            .map_err(|e| {
                if e.is_authentication() {
                    e
                } else {
                    Error::Enumeration(format!(
                        "Listing {} page {} failed: {}",
                        self.source.origin(),
                        self.pages + 1,
                        e
                    ))
                }
            })?;

        self.pages += 1;
        self.next_token = page.next_page_token;
        self.done = self.next_token.is_none();
        debug!(
            "Fetched {} page {} with {} items",
            self.source.origin(),
            self.pages,
            page.files.len()
        );

        Ok(Some(page.files))
    }

    /// Number of pages fetched so far.
    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    /// Whether the listing is exhausted.
    pub fn is_done(&self) -> bool {
        self.done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyferry_common::Origin;
    use skyferry_storage::MemorySource;
    use std::time::Duration;

    use crate::retry::RetryConfig;

    fn file(id: &str) -> SourceFile {
        SourceFile {
            id: id.to_string(),
            name: format!("{}.txt", id),
            parent_ids: Vec::new(),
            size: Some(1),
            content_url: String::new(),
            permissions: Vec::new(),
        }
    }

    fn source(count: usize) -> MemorySource {
        (0..count).fold(MemorySource::new(Origin::GoogleDrive), |s, i| {
            s.with_file(file(&i.to_string()), "x")
        })
    }

    fn quick(max_retries: u32) -> RetryExecutor {
        RetryExecutor::new(
            RetryConfig::new(max_retries)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
        )
    }

    #[tokio::test]
    async fn test_pages_until_exhausted() {
        let source = Arc::new(source(5));
        let mut pages = SourceEnumerator::new(source.clone(), 2, quick(0));

        let mut sizes = Vec::new();
        while let Some(files) = pages.next_page().await.unwrap() {
            sizes.push(files.len());
        }

        assert_eq!(sizes, vec![2, 2, 1]);
        assert!(pages.is_done());
        assert_eq!(pages.pages_fetched(), 3);
        // No call after the last page
        assert!(pages.next_page().await.unwrap().is_none());
        assert_eq!(source.list_calls(), 3);
    }

    #[tokio::test]
    async fn test_empty_listing_yields_one_empty_page() {
        let mut pages = SourceEnumerator::new(Arc::new(source(0)), 10, quick(0));
        assert_eq!(pages.next_page().await.unwrap(), Some(Vec::new()));
        assert!(pages.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let source = Arc::new(source(3).fail_listing_at(1));
        let mut pages = SourceEnumerator::new(source.clone(), 2, quick(2));

        let mut total = 0;
        while let Some(files) = pages.next_page().await.unwrap() {
            total += files.len();
        }
        assert_eq!(total, 3);
        assert_eq!(source.list_calls(), 3);
    }

    #[tokio::test]
    async fn test_failure_after_retries_is_enumeration_error() {
        let source = Arc::new(source(3).fail_listing_at(0));
        let mut pages = SourceEnumerator::new(source, 2, quick(0));
        assert!(matches!(
            pages.next_page().await,
            Err(Error::Enumeration(_))
        ));
    }

    #[tokio::test]
    async fn test_authentication_error_passes_through() {
        let source = Arc::new(source(3).reject_credentials());
        let mut pages = SourceEnumerator::new(source.clone(), 2, quick(3));
        assert!(matches!(
            pages.next_page().await,
            Err(Error::AuthenticationRejected(_))
        ));
        // Not retried
        assert_eq!(source.list_calls(), 1);
    }
}
