//! # Batch Copier
//!
//! One read-then-write cycle: fetch the page after the job's cursor from the
//! source, transform it, upsert it into the target and compute the cursor of
//! the last document. The cursor only moves once the write has been
//! acknowledged, so a failed or interrupted batch can be re-issued as-is.

use std::cmp::Ordering;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cursor::{Cursor, CursorTracker, SortValue, compare_values};
use crate::error::ReindexError;
use crate::models::job_spec::ReindexJobSpec;
use crate::solr::{Document, DocumentSink, DocumentSource, PageRequest};

/// Outcome of one copy cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult {
    pub docs_read: usize,
    pub docs_written: usize,
    /// Sort key of the last document written, or the input cursor for an empty page
    pub cursor: Cursor,
    /// Fewer documents than requested came back
    pub exhausted: bool,
}

/// Copies pages between collections through the Solr capabilities.
#[derive(Clone)]
pub struct BatchCopier {
    source: Arc<dyn DocumentSource>,
    sink: Arc<dyn DocumentSink>,
}

impl BatchCopier {
    pub fn new(source: Arc<dyn DocumentSource>, sink: Arc<dyn DocumentSink>) -> Self {
        Self { source, sink }
    }

    /// Copy the page that follows `cursor`.
    ///
    /// Fails with `InvalidCursor` for a cursor from another key space,
    /// `TransientCopy` for timeouts and retryable collection errors, and
    /// `FatalCopy` for malformed pages, sort keys too long to carry in a
    /// cursor, or rejected writes. Nothing is written when the page fails
    /// these checks.
    pub async fn copy_batch(
        &self,
        spec: &ReindexJobSpec,
        cursor: &Cursor,
        page_size: u32,
    ) -> Result<BatchResult, ReindexError> {
        if page_size == 0 {
            return Err(ReindexError::InvalidSpec(
                "page size must be greater than 0".to_string(),
            ));
        }

        let tracker = CursorTracker::for_job(spec);
        let position = tracker.decode(cursor)?;
        let call_timeout = spec.call_timeout();

        let request = PageRequest {
            query: spec.filters.query.clone(),
            filter_queries: spec.filters.filter_queries.clone(),
            fields: spec
                .field_selection
                .fl(&spec.unique_key_field, &spec.sort_field),
            sort_field: spec.sort_field.clone(),
            after: position.after().cloned(),
            rows: page_size,
        };

        let documents = with_timeout(
            call_timeout,
            "source read",
            self.source.fetch_page(&spec.source, &request),
        )
        .await?;

        if documents.is_empty() {
            debug!(cursor = %cursor, "Source page empty");
            return Ok(BatchResult {
                docs_read: 0,
                docs_written: 0,
                cursor: cursor.clone(),
                exhausted: true,
            });
        }

        if documents.len() > page_size as usize {
            return Err(ReindexError::FatalCopy(format!(
                "source returned {} documents for a page of {}",
                documents.len(),
                page_size
            )));
        }

        let last_key = check_page(spec, position.after(), &documents)?;
        let next_cursor = tracker
            .encode(&last_key)
            .map_err(|err| ReindexError::FatalCopy(err.to_string()))?;
        let docs_read = documents.len();

        let transformed: Vec<Document> = documents
            .into_iter()
            .map(|document| spec.transform.apply(document))
            .collect();

        with_timeout(
            call_timeout,
            "target write",
            self.sink.upsert_batch(&spec.target, &transformed),
        )
        .await?;

        debug!(docs = docs_read, last_key = %last_key, "Batch acknowledged by target");

        Ok(BatchResult {
            docs_read,
            docs_written: transformed.len(),
            cursor: next_cursor,
            exhausted: docs_read < page_size as usize,
        })
    }
}

async fn with_timeout<T, F>(limit: Duration, call: &str, future: F) -> Result<T, ReindexError>
where
    F: Future<Output = Result<T, ReindexError>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(ReindexError::TransientCopy(format!(
            "{} timed out after {}ms",
            call,
            limit.as_millis()
        ))),
    }
}

/// Every document must carry the unique key and a sort key strictly greater
/// than its predecessor (and than the cursor). Returns the last sort key.
fn check_page(
    spec: &ReindexJobSpec,
    after: Option<&SortValue>,
    documents: &[Document],
) -> Result<SortValue, ReindexError> {
    let mut previous = after.cloned();

    for document in documents {
        if !document.contains_key(&spec.unique_key_field) {
            return Err(ReindexError::FatalCopy(format!(
                "document without unique key field '{}'",
                spec.unique_key_field
            )));
        }

        let key = document
            .get(&spec.sort_field)
            .and_then(SortValue::from_json)
            .ok_or_else(|| {
                ReindexError::FatalCopy(format!(
                    "document is missing a single-valued sort field '{}'",
                    spec.sort_field
                ))
            })?;

        if let Some(prev) = &previous {
            let ordering = compare_values(prev, &key)
                .map_err(|err| ReindexError::FatalCopy(err.to_string()))?;
            if ordering != Ordering::Less {
                return Err(ReindexError::FatalCopy(format!(
                    "source page is not strictly ordered by '{}': {} followed by {}",
                    spec.sort_field, prev, key
                )));
            }
        }

        previous = Some(key);
    }

    previous.ok_or_else(|| ReindexError::FatalCopy("empty page".to_string()))
}
