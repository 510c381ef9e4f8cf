use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{config::BackupStrategy, errors::Error, ports::StateStore, Result};

/// All records of one collection, tagged with its name so the document is
/// self-describing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollectionDump {
    pub name: String,
    pub records: Vec<serde_json::Value>,
}

/// The serialized output of one snapshot pass: everything a restore needs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDocument {
    pub strategy: String,
    pub created_at: String,
    pub collections: Vec<CollectionDump>,
}

impl SnapshotDocument {
    pub fn record_count(&self) -> usize {
        self.collections.iter().map(|c| c.records.len()).sum()
    }
}

/// Dump every collection named by `strategy` into one document.
///
/// One fetch per collection, so each collection is internally consistent;
/// consistency *across* collections is not guaranteed. All-or-nothing: if any
/// collection cannot be read the whole pass fails and no partial document is
/// produced.
pub async fn produce(store: &dyn StateStore, strategy: &BackupStrategy) -> Result<SnapshotDocument> {
    let mut collections = Vec::with_capacity(strategy.collections.len());

    for name in &strategy.collections {
        let records = store.fetch_all(name).await.map_err(|e| {
            Error::SourceUnavailable(format!("collection {name}: {e}"))
        })?;
        collections.push(CollectionDump {
            name: name.clone(),
            records,
        });
    }

    Ok(SnapshotDocument {
        strategy: strategy.name.clone(),
        created_at: Utc::now().to_rfc3339(),
        collections,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    struct FakeStore {
        collections: HashMap<String, Vec<serde_json::Value>>,
    }

    impl FakeStore {
        fn new(data: &[(&str, usize)]) -> Self {
            let mut collections = HashMap::new();
            for (name, count) in data {
                let records = (0..*count)
                    .map(|i| json!({ "_id": format!("{name}-{i}"), "n": i }))
                    .collect();
                collections.insert(name.to_string(), records);
            }
            Self { collections }
        }
    }

    #[async_trait::async_trait]
    impl StateStore for FakeStore {
        async fn fetch_all(&self, collection: &str) -> Result<Vec<serde_json::Value>> {
            self.collections
                .get(collection)
                .cloned()
                .ok_or_else(|| Error::SourceUnavailable(format!("no such collection: {collection}")))
        }

        async fn insert_many(
            &self,
            _collection: &str,
            _records: &[serde_json::Value],
        ) -> Result<()> {
            Ok(())
        }
    }

    fn strategy(name: &str, collections: &[&str]) -> BackupStrategy {
        BackupStrategy {
            name: name.to_string(),
            collections: collections.iter().map(|s| s.to_string()).collect(),
            priority: 2,
        }
    }

    #[tokio::test]
    async fn produce_tags_each_collection_with_exact_counts() {
        let store = FakeStore::new(&[("users", 3), ("groups", 2)]);
        let doc = produce(&store, &strategy("daily", &["users", "groups"]))
            .await
            .unwrap();

        assert_eq!(doc.strategy, "daily");
        assert_eq!(doc.collections.len(), 2);
        assert_eq!(doc.collections[0].name, "users");
        assert_eq!(doc.collections[0].records.len(), 3);
        assert_eq!(doc.collections[1].name, "groups");
        assert_eq!(doc.collections[1].records.len(), 2);
        assert_eq!(doc.record_count(), 5);
    }

    #[tokio::test]
    async fn produce_is_all_or_nothing() {
        let store = FakeStore::new(&[("users", 3)]);
        let err = produce(&store, &strategy("daily", &["users", "missing"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SourceUnavailable(_)));
    }

    #[tokio::test]
    async fn produce_preserves_collection_order() {
        let store = FakeStore::new(&[("a", 1), ("b", 1), ("c", 1)]);
        let doc = produce(&store, &strategy("full", &["c", "a", "b"]))
            .await
            .unwrap();
        let names: Vec<&str> = doc.collections.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["c", "a", "b"]);
    }
}
