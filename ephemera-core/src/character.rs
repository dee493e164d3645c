//! Character metadata: display name and personal assets.

use crate::coalesce::CoalescingCache;
use crate::error::{CacheError, CacheResult};
use crate::id::{ObjectId, Tag};
use crate::store::{Category, Store, StoreKey, StoreRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Stored `Meta` record of a `CHARACTER#`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterRecord {
    pub name: String,
    /// Personal assets, in overlay order.
    #[serde(default)]
    pub assets: Vec<String>,
}

/// Coalesced character lookups. There is no default: an unknown character
/// fails the request.
pub struct CharacterCache {
    store: Arc<dyn Store>,
    records: CoalescingCache<ObjectId, Arc<CharacterRecord>>,
}

impl CharacterCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            records: CoalescingCache::new("characters"),
        }
    }

    pub async fn get(&self, id: &ObjectId) -> CacheResult<Arc<CharacterRecord>> {
        id.expect_tag(&[Tag::Character])?;
        self.records.add([id.clone()], |ids| self.fetch(ids)).await;
        self.records.get(id).await
    }

    async fn fetch(&self, ids: Vec<ObjectId>) -> CacheResult<HashMap<ObjectId, Arc<CharacterRecord>>> {
        debug!(count = ids.len(), "fetching characters");
        let mut found = HashMap::new();
        if let [id] = ids.as_slice() {
            if let Some(value) = self.store.get_item(id, &Category::Meta).await? {
                let record: CharacterRecord =
                    serde_json::from_value(value).map_err(|err| CacheError::decode(id, err))?;
                found.insert(id.clone(), Arc::new(record));
            }
            return Ok(found);
        }

        let keys: Vec<StoreKey> = ids.into_iter().map(StoreKey::meta).collect();
        for StoreRecord { key, value } in self.store.batch_get_item(&keys).await? {
            let record: CharacterRecord =
                serde_json::from_value(value).map_err(|err| CacheError::decode(&key.id, err))?;
            found.insert(key.id, Arc::new(record));
        }
        Ok(found)
    }

    pub fn invalidate(&self, id: &ObjectId) -> bool {
        self.records.invalidate(id)
    }

    pub fn clear(&self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_character_lookup() {
        let store = Arc::new(MemoryStore::new());
        let id = ObjectId::parse("CHARACTER#tess").unwrap();
        store.put_item(StoreKey::meta(id.clone()), json!({ "name": "Tess", "assets": ["tess-notes"] }));
        let cache = CharacterCache::new(store.clone());

        let record = cache.get(&id).await.unwrap();
        assert_eq!(record.name, "Tess");
        assert_eq!(record.assets, vec!["tess-notes".to_string()]);
        // A lone character is a single-record read.
        assert_eq!(store.stats().get_item_calls(), 1);
        assert_eq!(store.stats().batch_calls(), 0);

        cache.get(&id).await.unwrap();
        assert_eq!(store.stats().round_trips(), 1);
    }

    #[tokio::test]
    async fn test_missing_character_is_fatal() {
        let cache = CharacterCache::new(Arc::new(MemoryStore::new()));
        let err = cache
            .get(&ObjectId::parse("CHARACTER#nobody").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::MissingRequiredKey { cache: "characters", .. }));
    }
}
