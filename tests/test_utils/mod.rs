//! Test utilities: an in-memory registry database and a scriptable Solr fake.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use migration::{Migrator, MigratorTrait};
use reindex::cursor::SortValue;
use reindex::error::ReindexError;
use reindex::models::{CollectionRef, JobState, ReindexJobSpec, RetryPolicy};
use reindex::registry::JobRegistry;
use reindex::solr::{Document, DocumentSink, DocumentSource, PageRequest};
use sea_orm::{Database, DatabaseConnection};
use serde_json::json;
use uuid::Uuid;

pub const SOLR_URL: &str = "http://solr.test:8983/solr";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// `products_v1 -> products_v2` with fast retries.
pub fn spec(batch_size: u32, max_retries: u32) -> ReindexJobSpec {
    ReindexJobSpec::new(
        CollectionRef::new(SOLR_URL, "products_v1").unwrap(),
        CollectionRef::new(SOLR_URL, "products_v2").unwrap(),
    )
    .with_batch_size(batch_size)
    .with_retry(RetryPolicy {
        max_retries,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        jitter_factor: 0.0,
    })
}

/// Poll the registry until `check` holds or two seconds pass.
pub async fn wait_for<F>(registry: &dyn JobRegistry, job_id: Uuid, check: F) -> JobState
where
    F: Fn(&JobState) -> bool,
{
    for _ in 0..400 {
        let state = registry.get(job_id).await.unwrap();
        if check(&state) {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {} never reached the expected state", job_id);
}

enum Scripted {
    Fail(ReindexError),
    Hang,
}

/// Source and target collections held in memory. Documents carry an integer
/// `id`, which is also the sort key. Fetch calls are numbered from 1 so
/// tests can script failures for specific calls.
#[derive(Default)]
pub struct FakeSolr {
    source: Mutex<Vec<Document>>,
    target: Mutex<BTreeMap<i64, Document>>,
    deliveries: Mutex<Vec<i64>>,
    fetch_script: Mutex<HashMap<usize, Scripted>>,
    upsert_script: Mutex<HashMap<usize, ReindexError>>,
    fetch_after: Mutex<Vec<Option<SortValue>>>,
    fetch_delay: Mutex<Option<Duration>>,
    fetches: AtomicUsize,
    upserts: AtomicUsize,
}

impl FakeSolr {
    /// A source holding ids `1..=count`.
    pub fn with_docs(count: i64) -> Self {
        let fake = Self::default();
        {
            let mut source = fake.source.lock().unwrap();
            for id in 1..=count {
                source.push(doc(id));
            }
        }
        fake
    }

    pub fn fail_fetch_calls(&self, calls: &[usize], error: ReindexError) {
        let mut script = self.fetch_script.lock().unwrap();
        for call in calls {
            script.insert(*call, Scripted::Fail(error.clone()));
        }
    }

    /// The given fetch call never returns.
    pub fn hang_fetch_call(&self, call: usize) {
        self.fetch_script
            .lock()
            .unwrap()
            .insert(call, Scripted::Hang);
    }

    pub fn fail_upsert_calls(&self, calls: &[usize], error: ReindexError) {
        let mut script = self.upsert_script.lock().unwrap();
        for call in calls {
            script.insert(*call, error.clone());
        }
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = Some(delay);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn upsert_calls(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    /// `after` bound of every successful fetch, in call order.
    pub fn fetch_bounds(&self) -> Vec<Option<SortValue>> {
        self.fetch_after.lock().unwrap().clone()
    }

    pub fn target_ids(&self) -> Vec<i64> {
        self.target.lock().unwrap().keys().copied().collect()
    }

    pub fn target_doc(&self, id: i64) -> Option<Document> {
        self.target.lock().unwrap().get(&id).cloned()
    }

    /// Every id written, including re-deliveries.
    pub fn deliveries(&self) -> Vec<i64> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn distinct_deliveries(&self) -> usize {
        self.deliveries().into_iter().collect::<HashSet<_>>().len()
    }
}

pub fn doc(id: i64) -> Document {
    let value = json!({
        "id": id,
        "name": format!("product {}", id),
        "_version_": 1_700_000_000_000_i64 + id,
    });
    value.as_object().cloned().unwrap_or_default()
}

fn key(document: &Document) -> i64 {
    document.get("id").and_then(|v| v.as_i64()).unwrap_or_default()
}

#[async_trait]
impl DocumentSource for FakeSolr {
    async fn fetch_page(
        &self,
        _collection: &CollectionRef,
        request: &PageRequest,
    ) -> Result<Vec<Document>, ReindexError> {
        let call = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;

        let scripted = self.fetch_script.lock().unwrap().remove(&call);
        match scripted {
            Some(Scripted::Fail(error)) => return Err(error),
            Some(Scripted::Hang) => std::future::pending::<()>().await,
            None => {}
        }

        let delay = *self.fetch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let after = match &request.after {
            Some(SortValue::Long(value)) => Some(*value),
            Some(other) => panic!("unexpected sort value {:?}", other),
            None => None,
        };
        self.fetch_after.lock().unwrap().push(request.after.clone());

        let source = self.source.lock().unwrap();
        let mut page: Vec<Document> = source
            .iter()
            .filter(|d| after.is_none_or(|a| key(d) > a))
            .cloned()
            .collect();
        page.sort_by_key(key);
        page.truncate(request.rows as usize);
        Ok(page)
    }
}

#[async_trait]
impl DocumentSink for FakeSolr {
    async fn upsert_batch(
        &self,
        _collection: &CollectionRef,
        documents: &[Document],
    ) -> Result<(), ReindexError> {
        let call = self.upserts.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(error) = self.upsert_script.lock().unwrap().remove(&call) {
            return Err(error);
        }

        let mut target = self.target.lock().unwrap();
        let mut deliveries = self.deliveries.lock().unwrap();
        for document in documents {
            target.insert(key(document), document.clone());
            deliveries.push(key(document));
        }
        Ok(())
    }
}

/// Source and target keyed by long URL-style string ids, sorted as Solr sorts
/// a string field.
#[derive(Default)]
pub struct UrlCatalog {
    source: Vec<Document>,
    target: Mutex<BTreeMap<String, Document>>,
}

impl UrlCatalog {
    /// `count` documents whose ids are at least `min_len` bytes long.
    pub fn with_docs(count: usize, min_len: usize) -> Self {
        let source = (0..count)
            .map(|n| {
                let id = format!(
                    "https://catalog.example.com/{}/item-{:04}",
                    "a".repeat(min_len),
                    n
                );
                json!({"id": id, "title": format!("item {}", n)})
                    .as_object()
                    .cloned()
                    .unwrap_or_default()
            })
            .collect();
        Self {
            source,
            ..Default::default()
        }
    }

    pub fn target_len(&self) -> usize {
        self.target.lock().unwrap().len()
    }
}

fn url_key(document: &Document) -> String {
    document
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl DocumentSource for UrlCatalog {
    async fn fetch_page(
        &self,
        _collection: &CollectionRef,
        request: &PageRequest,
    ) -> Result<Vec<Document>, ReindexError> {
        let after = match &request.after {
            Some(SortValue::Text(value)) => Some(value.clone()),
            Some(other) => panic!("unexpected sort value {:?}", other),
            None => None,
        };
        let mut page: Vec<Document> = self
            .source
            .iter()
            .filter(|d| after.as_ref().is_none_or(|a| url_key(d) > *a))
            .cloned()
            .collect();
        page.sort_by_key(url_key);
        page.truncate(request.rows as usize);
        Ok(page)
    }
}

#[async_trait]
impl DocumentSink for UrlCatalog {
    async fn upsert_batch(
        &self,
        _collection: &CollectionRef,
        documents: &[Document],
    ) -> Result<(), ReindexError> {
        let mut target = self.target.lock().unwrap();
        for document in documents {
            target.insert(url_key(document), document.clone());
        }
        Ok(())
    }
}
