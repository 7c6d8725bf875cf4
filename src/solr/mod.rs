//! Solr collaborator capabilities
//!
//! The batch copier talks to collections only through [`DocumentSource`]
//! ("query ordered by sort key greater than cursor, limit N") and
//! [`DocumentSink`] ("upsert batch of documents, commit"). [`SolrClient`]
//! implements both over Solr's HTTP API.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::cursor::SortValue;
use crate::error::ReindexError;
use crate::models::job_spec::{CollectionRef, DEFAULT_UNIQUE_KEY};

pub mod client;

pub use client::{SolrClient, SolrCredentials, SolrError};

/// A stored Solr document.
pub type Document = Map<String, Value>;

/// One bounded, ordered read of the source collection.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub query: String,
    pub filter_queries: Vec<String>,
    /// `None` fetches all stored fields
    pub fields: Option<Vec<String>>,
    pub sort_field: String,
    /// Only documents whose sort key is strictly greater than this value
    pub after: Option<SortValue>,
    pub rows: u32,
}

impl PageRequest {
    /// Filter queries sent to Solr, including the range filter that skips
    /// everything at or before `after`.
    pub fn effective_filter_queries(&self) -> Vec<String> {
        let mut fqs = self.filter_queries.clone();
        if let Some(after) = &self.after {
            fqs.push(format!("{}:{{{} TO *]", self.sort_field, after.to_query_term()));
        }
        fqs
    }
}

/// Read side of a collection.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Up to `request.rows` documents ordered ascending by `request.sort_field`.
    async fn fetch_page(
        &self,
        collection: &CollectionRef,
        request: &PageRequest,
    ) -> Result<Vec<Document>, ReindexError>;

    /// The `uniqueKey` declared by the collection's schema. Sources without a
    /// schema report `None`.
    async fn unique_key(&self, _collection: &CollectionRef) -> Result<Option<String>, ReindexError> {
        Ok(None)
    }
}

/// Unique key field for jobs reading `collection`: the schema's `uniqueKey`,
/// or `id` when the schema does not declare one.
pub async fn schema_unique_key(
    source: &dyn DocumentSource,
    collection: &CollectionRef,
) -> Result<String, ReindexError> {
    let declared = source
        .unique_key(collection)
        .await?
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty());
    Ok(declared.unwrap_or_else(|| DEFAULT_UNIQUE_KEY.to_string()))
}

/// Write side of a collection. Writes are upserts keyed by the unique key, so
/// re-sending a batch is harmless.
#[async_trait]
pub trait DocumentSink: Send + Sync {
    async fn upsert_batch(
        &self,
        collection: &CollectionRef,
        documents: &[Document],
    ) -> Result<(), ReindexError>;
}
