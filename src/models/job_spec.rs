//! Reindex job specification
//!
//! The immutable description of a requested reindex. A spec is validated once
//! when the job is created and is never mutated afterwards; resumed jobs copy it
//! verbatim.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use url::Url;
use utoipa::ToSchema;

use crate::error::ReindexError;
use crate::solr::Document;

pub const DEFAULT_QUERY: &str = "*:*";
pub const DEFAULT_UNIQUE_KEY: &str = "id";
pub const VERSION_FIELD: &str = "_version_";
pub const MAX_BATCH_SIZE: u32 = 10_000;
pub const DEFAULT_BATCH_SIZE: u32 = 500;

fn default_batch_size() -> u32 {
    DEFAULT_BATCH_SIZE
}

fn default_sort_field() -> String {
    DEFAULT_UNIQUE_KEY.to_string()
}

fn default_unique_key_field() -> String {
    DEFAULT_UNIQUE_KEY.to_string()
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_query() -> String {
    DEFAULT_QUERY.to_string()
}

/// Location of a Solr cluster. Credentials are supplied by the process
/// configuration and never stored with the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ClusterConfig {
    /// Normalized base URL, e.g. `http://solr:8983/solr`
    #[schema(example = "http://localhost:8983/solr")]
    pub base_url: String,
}

impl ClusterConfig {
    /// Parse and normalize a base URL: http(s) only, no query or fragment, no
    /// trailing slash.
    pub fn new(base_url: &str) -> Result<Self, ReindexError> {
        let trimmed = base_url.trim();
        if trimmed.is_empty() {
            return Err(ReindexError::InvalidSpec(
                "cluster base_url cannot be empty".to_string(),
            ));
        }

        let mut url = Url::parse(trimmed).map_err(|err| {
            ReindexError::InvalidSpec(format!("invalid cluster base_url '{}': {}", trimmed, err))
        })?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ReindexError::InvalidSpec(format!(
                "cluster base_url must use http or https, got '{}'",
                url.scheme()
            )));
        }

        url.set_query(None);
        url.set_fragment(None);

        Ok(Self {
            base_url: url.as_str().trim_end_matches('/').to_string(),
        })
    }
}

/// A collection on a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CollectionRef {
    pub cluster: ClusterConfig,
    #[schema(example = "products")]
    pub collection: String,
}

impl CollectionRef {
    pub fn new(base_url: &str, collection: &str) -> Result<Self, ReindexError> {
        let collection = collection.trim();
        if collection.is_empty() {
            return Err(ReindexError::InvalidSpec(
                "collection name cannot be blank".to_string(),
            ));
        }
        if collection.contains('/') {
            return Err(ReindexError::InvalidSpec(format!(
                "collection name '{}' cannot contain '/'",
                collection
            )));
        }

        Ok(Self {
            cluster: ClusterConfig::new(base_url)?,
            collection: collection.to_string(),
        })
    }

    /// `{base_url}/{collection}`
    pub fn endpoint(&self) -> String {
        format!("{}/{}", self.cluster.base_url, self.collection)
    }
}

impl std::fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.endpoint())
    }
}

/// Query and filter queries selecting the documents to copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ReindexFilters {
    #[serde(default = "default_query")]
    #[schema(example = "*:*")]
    pub query: String,
    #[serde(default)]
    pub filter_queries: Vec<String>,
}

impl Default for ReindexFilters {
    fn default() -> Self {
        Self {
            query: default_query(),
            filter_queries: Vec::new(),
        }
    }
}

impl ReindexFilters {
    /// Blank query becomes `*:*`; filter queries are trimmed and blanks dropped.
    pub fn normalized(&self) -> Self {
        let query = self.query.trim();
        Self {
            query: if query.is_empty() {
                default_query()
            } else {
                query.to_string()
            },
            filter_queries: self
                .filter_queries
                .iter()
                .map(|fq| fq.trim())
                .filter(|fq| !fq.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

/// Which stored fields are fetched from the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FieldSelection {
    #[default]
    All,
    Fields { fields: Vec<String> },
}

impl FieldSelection {
    /// Trimmed, de-duplicated field list preserving first occurrence.
    pub fn normalized(&self) -> Result<Self, ReindexError> {
        match self {
            FieldSelection::All => Ok(FieldSelection::All),
            FieldSelection::Fields { fields } => {
                let mut seen = BTreeSet::new();
                let fields: Vec<String> = fields
                    .iter()
                    .map(|field| field.trim())
                    .filter(|field| !field.is_empty() && seen.insert(field.to_string()))
                    .map(str::to_string)
                    .collect();
                if fields.is_empty() {
                    return Err(ReindexError::InvalidSpec(
                        "field selection must name at least one field".to_string(),
                    ));
                }
                Ok(FieldSelection::Fields { fields })
            }
        }
    }

    /// Value for Solr's `fl` parameter. The unique key and sort field are
    /// always included so documents can be keyed and paged.
    pub fn fl(&self, unique_key: &str, sort_field: &str) -> Option<Vec<String>> {
        match self {
            FieldSelection::All => None,
            FieldSelection::Fields { fields } => {
                let mut list = fields.clone();
                for required in [unique_key, sort_field] {
                    if !list.iter().any(|field| field == required) {
                        list.push(required.to_string());
                    }
                }
                Some(list)
            }
        }
    }
}

/// Field-level rewrite applied to every document before it is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema, Default)]
pub struct FieldTransform {
    /// Source field name to target field name
    #[serde(default)]
    pub renames: BTreeMap<String, String>,
    /// Fields removed from the document
    #[serde(default)]
    pub drop_fields: Vec<String>,
}

impl FieldTransform {
    /// Drops configured fields and `_version_`, then applies renames. A rename
    /// whose target already exists overwrites it.
    pub fn apply(&self, mut document: Document) -> Document {
        document.remove(VERSION_FIELD);
        for field in &self.drop_fields {
            document.remove(field);
        }
        for (from, to) in &self.renames {
            if let Some(value) = document.remove(from) {
                document.insert(to.clone(), value);
            }
        }
        document
    }

    fn validate(&self, unique_key: &str) -> Result<(), ReindexError> {
        if self.drop_fields.iter().any(|field| field == unique_key) {
            return Err(ReindexError::InvalidSpec(format!(
                "cannot drop unique key field '{}'",
                unique_key
            )));
        }
        if self.renames.contains_key(unique_key) {
            return Err(ReindexError::InvalidSpec(format!(
                "cannot rename unique key field '{}'",
                unique_key
            )));
        }
        if let Some((from, _)) = self.renames.iter().find(|(_, to)| to.as_str() == unique_key) {
            return Err(ReindexError::InvalidSpec(format!(
                "cannot rename '{}' onto unique key field '{}'",
                from, unique_key
            )));
        }
        for (from, to) in &self.renames {
            if from.trim().is_empty() || to.trim().is_empty() {
                return Err(ReindexError::InvalidSpec(
                    "field renames cannot use blank names".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Retry and backoff policy for transient copy failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RetryPolicy {
    /// Attempts allowed per batch before the job fails
    #[schema(example = 3)]
    pub max_retries: u32,
    #[schema(example = 250)]
    pub initial_backoff_ms: u64,
    #[schema(example = 5000)]
    pub max_backoff_ms: u64,
    /// Uniform jitter as a fraction of the delay, in [0, 1]
    #[schema(example = 0.2)]
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 5_000,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), ReindexError> {
        if self.max_retries == 0 {
            return Err(ReindexError::InvalidSpec(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.initial_backoff_ms == 0 {
            return Err(ReindexError::InvalidSpec(
                "initial_backoff_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ReindexError::InvalidSpec(
                "max_backoff_ms must be >= initial_backoff_ms".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ReindexError::InvalidSpec(
                "jitter_factor must be between 0 and 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Capped exponential delay before the given retry attempt (1-based),
    /// without jitter.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }

    /// Delay before the given retry attempt with uniform jitter in
    /// `[d * (1 - j), d * (1 + j)]`, never above the ceiling.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_backoff(attempt).as_millis() as f64;
        if self.jitter_factor <= 0.0 || base <= 0.0 {
            return Duration::from_millis(base as u64);
        }

        let low = base * (1.0 - self.jitter_factor);
        let high = base * (1.0 + self.jitter_factor);
        let jittered = rand::thread_rng().gen_range(low..=high);
        Duration::from_millis((jittered as u64).min(self.max_backoff_ms))
    }
}

/// Immutable description of a requested reindex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ReindexJobSpec {
    pub source: CollectionRef,
    pub target: CollectionRef,
    #[serde(default)]
    pub filters: ReindexFilters,
    #[serde(default)]
    pub field_selection: FieldSelection,
    #[serde(default)]
    pub transform: FieldTransform,
    /// Documents per batch
    #[serde(default = "default_batch_size")]
    #[schema(example = 500)]
    pub batch_size: u32,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Single-valued field the source is paged by, ascending
    #[serde(default = "default_sort_field")]
    #[schema(example = "id")]
    pub sort_field: String,
    /// Unique key of the source schema, looked up when the job is submitted;
    /// writes upsert on it
    #[serde(default = "default_unique_key_field")]
    #[schema(example = "id")]
    pub unique_key_field: String,
    /// Timeout applied to each collection call
    #[serde(default = "default_call_timeout_ms")]
    #[schema(example = 30000)]
    pub call_timeout_ms: u64,
}

impl ReindexJobSpec {
    /// Spec with default paging and retry settings.
    pub fn new(source: CollectionRef, target: CollectionRef) -> Self {
        Self {
            source,
            target,
            filters: ReindexFilters::default(),
            field_selection: FieldSelection::default(),
            transform: FieldTransform::default(),
            batch_size: default_batch_size(),
            retry: RetryPolicy::default(),
            sort_field: default_sort_field(),
            unique_key_field: default_unique_key_field(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_filters(mut self, filters: ReindexFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_sort_field<S: Into<String>>(mut self, sort_field: S) -> Self {
        self.sort_field = sort_field.into();
        self
    }

    pub fn with_unique_key<S: Into<String>>(mut self, unique_key_field: S) -> Self {
        self.unique_key_field = unique_key_field.into();
        self
    }

    pub fn with_transform(mut self, transform: FieldTransform) -> Self {
        self.transform = transform;
        self
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Check preconditions and return the normalized spec.
    pub fn validate(&self) -> Result<Self, ReindexError> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(ReindexError::InvalidSpec(format!(
                "batch_size must be between 1 and {}",
                MAX_BATCH_SIZE
            )));
        }

        self.retry.validate()?;

        if self.call_timeout_ms == 0 {
            return Err(ReindexError::InvalidSpec(
                "call_timeout_ms must be greater than 0".to_string(),
            ));
        }

        let sort_field = self.sort_field.trim();
        let unique_key_field = self.unique_key_field.trim();
        if sort_field.is_empty() || unique_key_field.is_empty() {
            return Err(ReindexError::InvalidSpec(
                "sort_field and unique_key_field cannot be blank".to_string(),
            ));
        }

        // Re-validate collection refs in case the spec was deserialized directly.
        let source = CollectionRef::new(&self.source.cluster.base_url, &self.source.collection)?;
        let target = CollectionRef::new(&self.target.cluster.base_url, &self.target.collection)?;

        if source == target && sort_field == VERSION_FIELD {
            return Err(ReindexError::InvalidSpec(
                "an in-place reindex cannot page by _version_, which every write changes"
                    .to_string(),
            ));
        }

        self.transform.validate(unique_key_field)?;

        Ok(Self {
            source,
            target,
            filters: self.filters.normalized(),
            field_selection: self.field_selection.normalized()?,
            transform: self.transform.clone(),
            batch_size: self.batch_size,
            retry: self.retry.clone(),
            sort_field: sort_field.to_string(),
            unique_key_field: unique_key_field.to_string(),
            call_timeout_ms: self.call_timeout_ms,
        })
    }
}
