//! Owned cache of service trees.
//!
//! Entries live for a fixed time after they are fetched, then the next read
//! refetches. Mutations patch a cached tree in place. A mutation that cannot
//! find its ancestors means the cached copy has drifted from the store, so the
//! entry is dropped and the next read refetches it.

use crate::error::TreeError;
use crate::model::Schema;
use crate::source::TreeSource;
use crate::tree::{Mutation, MutationOutcome, ServiceTree};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A tree plus bookkeeping about its freshness.
#[derive(Debug)]
pub struct CachedTree {
    pub tree: ServiceTree,
    pub fetched_at: DateTime<Utc>,
    /// Bumped on every applied mutation.
    pub revision: u64,
}

pub type SharedTree = Arc<RwLock<CachedTree>>;

/// Result of routing a mutation through the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Patched {
        outcome: MutationOutcome,
        revision: u64,
    },
    /// Nothing cached for the service; the next read fetches fresh data.
    NotCached,
}

#[derive(Clone)]
pub struct TreeCache {
    entries: Cache<String, SharedTree>,
    source: Arc<dyn TreeSource>,
    schema: Arc<Schema>,
}

impl TreeCache {
    pub fn new(
        source: Arc<dyn TreeSource>,
        schema: Arc<Schema>,
        ttl: Duration,
        max_capacity: u64,
    ) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();

        Self {
            entries,
            source,
            schema,
        }
    }

    /// Return the cached tree for `service_id`, fetching it on a miss.
    ///
    /// Concurrent misses for the same service share one fetch. A failed fetch
    /// is not cached.
    pub async fn get_or_fetch(&self, service_id: &str) -> Result<SharedTree> {
        let source = self.source.clone();
        let schema = self.schema.clone();
        let id = service_id.to_string();

        self.entries
            .try_get_with(service_id.to_string(), async move {
                let record = source.fetch_service(&id).await?;
                let tree = ServiceTree::new(schema, record)
                    .with_context(|| format!("Malformed tree for service {}", id))?;
                if tree.root_id() != id {
                    anyhow::bail!(
                        "Source {} returned service {} for {}",
                        source.name(),
                        tree.root_id(),
                        id
                    );
                }

                info!("Cached service {} from {} source", id, source.name());
                Ok::<_, anyhow::Error>(Arc::new(RwLock::new(CachedTree {
                    tree,
                    fetched_at: Utc::now(),
                    revision: 0,
                })))
            })
            .await
            .map_err(|e| anyhow!("Failed to load service {}: {:#}", service_id, e))
    }

    /// Patch the cached tree of `service_id`, if there is one.
    pub async fn apply(&self, service_id: &str, mutation: Mutation) -> Result<Applied, TreeError> {
        let Some(entry) = self.entries.get(service_id).await else {
            debug!("Service {} not cached; mutation skipped", service_id);
            return Ok(Applied::NotCached);
        };

        let mut cached = entry.write().await;
        match cached.tree.apply(mutation) {
            Ok(outcome) => {
                cached.revision += 1;
                Ok(Applied::Patched {
                    outcome,
                    revision: cached.revision,
                })
            }
            Err(err) if err.is_stale() => {
                drop(cached);
                warn!("Service {} drifted from store ({}); dropping", service_id, err);
                self.entries.invalidate(service_id).await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn invalidate(&self, service_id: &str) {
        self.entries.invalidate(service_id).await;
        debug!("Invalidated service {}", service_id);
    }

    pub fn invalidate_all(&self) {
        self.entries.invalidate_all();
    }

    pub async fn contains(&self, service_id: &str) -> bool {
        self.entries.get(service_id).await.is_some()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::EntityKind;
    use crate::tree::tests::service_fixture;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves the fixture service and counts fetches.
    pub(crate) struct FixtureSource {
        pub(crate) fetches: AtomicUsize,
    }

    impl FixtureSource {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                fetches: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl TreeSource for FixtureSource {
        fn name(&self) -> &str {
            "fixture"
        }

        async fn fetch_service(&self, service_id: &str) -> anyhow::Result<Value> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            match service_id {
                "s1" => Ok(service_fixture()),
                "wrong" => Ok(json!({ "id": "s1" })),
                _ => Err(anyhow!("no such service")),
            }
        }
    }

    pub(crate) fn cache_with(source: Arc<FixtureSource>, ttl: Duration) -> TreeCache {
        TreeCache::new(source, Arc::new(Schema::service()), ttl, 16)
    }

    #[tokio::test]
    async fn test_hit_after_miss() {
        let source = FixtureSource::new();
        let cache = cache_with(source.clone(), Duration::from_secs(60));

        let first = cache.get_or_fetch("s1").await.unwrap();
        let second = cache.get_or_fetch("s1").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_fetch() {
        let source = FixtureSource::new();
        let cache = cache_with(source.clone(), Duration::from_secs(60));

        let (a, b) = tokio::join!(cache.get_or_fetch("s1"), cache.get_or_fetch("s1"));
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_cached() {
        let source = FixtureSource::new();
        let cache = cache_with(source.clone(), Duration::from_secs(60));

        assert!(cache.get_or_fetch("missing").await.is_err());
        assert!(cache.get_or_fetch("missing").await.is_err());
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
        assert!(!cache.contains("missing").await);
    }

    #[tokio::test]
    async fn test_source_returning_other_service_is_rejected() {
        let cache = cache_with(FixtureSource::new(), Duration::from_secs(60));
        let err = cache.get_or_fetch("wrong").await.unwrap_err();
        assert!(err.to_string().contains("returned service s1"));
    }

    #[tokio::test]
    async fn test_entries_expire_after_ttl() {
        let source = FixtureSource::new();
        let cache = cache_with(source.clone(), Duration::from_millis(50));

        cache.get_or_fetch("s1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        cache.get_or_fetch("s1").await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_apply_bumps_revision() {
        let cache = cache_with(FixtureSource::new(), Duration::from_secs(60));
        let entry = cache.get_or_fetch("s1").await.unwrap();

        let applied = cache
            .apply(
                "s1",
                Mutation::Upsert {
                    kind: EntityKind::Job,
                    record: json!({ "id": "j1", "integrationId": "i1", "name": "nightly" }),
                },
            )
            .await
            .unwrap();

        match applied {
            Applied::Patched { outcome, revision } => {
                assert!(outcome.created);
                assert_eq!(revision, 1);
            }
            Applied::NotCached => panic!("expected a patch"),
        }
        assert!(entry.read().await.tree.get(EntityKind::Job, "j1").is_some());
    }

    #[tokio::test]
    async fn test_apply_without_entry_is_skipped() {
        let source = FixtureSource::new();
        let cache = cache_with(source.clone(), Duration::from_secs(60));
        let applied = cache
            .apply(
                "s1",
                Mutation::Remove {
                    kind: EntityKind::Job,
                    id: "j1".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(applied, Applied::NotCached);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_mutation_drops_entry() {
        let source = FixtureSource::new();
        let cache = cache_with(source.clone(), Duration::from_secs(60));
        cache.get_or_fetch("s1").await.unwrap();

        let err = cache
            .apply(
                "s1",
                Mutation::Upsert {
                    kind: EntityKind::Creative,
                    record: json!({ "id": "cr9", "adGroupId": "gone", "name": "x" }),
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_stale());
        assert!(!cache.contains("s1").await);

        cache.get_or_fetch("s1").await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_stale_error_keeps_entry() {
        let cache = cache_with(FixtureSource::new(), Duration::from_secs(60));
        cache.get_or_fetch("s1").await.unwrap();

        let err = cache
            .apply(
                "s1",
                Mutation::Upsert {
                    kind: EntityKind::AdGroup,
                    record: json!({ "id": "a9", "campaignId": "c1", "name": "A" }),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TreeError::NameConflict { .. }));
        assert!(cache.contains("s1").await);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let source = FixtureSource::new();
        let cache = cache_with(source.clone(), Duration::from_secs(60));
        cache.get_or_fetch("s1").await.unwrap();
        cache.invalidate("s1").await;
        cache.get_or_fetch("s1").await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }
}
