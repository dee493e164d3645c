//! Raw per-asset content layers.
//!
//! Each asset may overlay an object with a list of [`Appearance`]s. The store
//! keeps them under the object's `ASSET#<name>` category as
//! `{ "appearances": [...] }`; they are decoded once, here, into the typed
//! render tree the renderer works on.

use crate::coalesce::CoalescingCache;
use crate::error::{CacheError, CacheResult};
use crate::id::{IdError, ObjectId};
use crate::store::{Category, Store, StoreKey, StoreRecord};
use crate::variables::{mapping_of, Dependency};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// One gate on an appearance or an `If` render item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "if")]
    pub expression: String,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// Negate the result of `expression`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub not: bool,
}

impl Condition {
    pub fn new(expression: impl Into<String>, dependencies: Vec<Dependency>) -> Self {
        Self {
            expression: expression.into(),
            dependencies,
            not: false,
        }
    }

    pub fn negated(mut self) -> Self {
        self.not = !self.not;
        self
    }

    pub fn mapping(&self) -> BTreeMap<String, ObjectId> {
        mapping_of(&self.dependencies)
    }
}

/// A node of an appearance's render stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tag")]
pub enum RenderItem {
    #[serde(rename_all = "camelCase")]
    String {
        value: String,
        #[serde(default)]
        space_before: bool,
        #[serde(default)]
        space_after: bool,
    },
    #[serde(rename_all = "camelCase")]
    Link {
        to: ObjectId,
        text: String,
        #[serde(default)]
        space_before: bool,
        #[serde(default)]
        space_after: bool,
    },
    LineBreak,
    Bookmark {
        to: ObjectId,
    },
    If {
        conditions: Vec<Condition>,
        #[serde(default)]
        contents: Vec<RenderItem>,
    },
}

impl RenderItem {
    /// Plain text with no spacing hints.
    pub fn text(value: impl Into<String>) -> Self {
        RenderItem::String {
            value: value.into(),
            space_before: false,
            space_after: false,
        }
    }

    pub fn link(to: ObjectId, text: impl Into<String>) -> Self {
        RenderItem::Link {
            to,
            text: text.into(),
            space_before: false,
            space_after: false,
        }
    }
}

/// A way out of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exit {
    pub to: ObjectId,
    pub name: String,
}

/// A room placed on a map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapRoom {
    pub key: String,
    pub room: ObjectId,
    #[serde(default)]
    pub x: i64,
    #[serde(default)]
    pub y: i64,
}

/// One conditional layer of content contributed by one asset.
///
/// `exits` only means something on rooms and `rooms` only on maps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appearance {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub render: Vec<RenderItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exits: Vec<Exit>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rooms: Vec<MapRoom>,
}

impl Appearance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_item(mut self, item: RenderItem) -> Self {
        self.render.push(item);
        self
    }

    /// Append unhinted text to the render stream.
    pub fn with_text(self, value: impl Into<String>) -> Self {
        self.with_item(RenderItem::text(value))
    }

    pub fn with_exit(mut self, to: ObjectId, name: impl Into<String>) -> Self {
        self.exits.push(Exit { to, name: name.into() });
        self
    }

    pub fn with_room(mut self, key: impl Into<String>, room: ObjectId, x: i64, y: i64) -> Self {
        self.rooms.push(MapRoom {
            key: key.into(),
            room,
            x,
            y,
        });
        self
    }
}

/// Stored form of one asset's overlay of one object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetRecord {
    #[serde(default)]
    pub appearances: Vec<Appearance>,
}

pub type Layers = Arc<Vec<Appearance>>;

type LayerKey = (ObjectId, String);

/// Cache of appearance lists keyed by (object, asset).
pub struct AppearanceCache {
    store: Arc<dyn Store>,
    layers: CoalescingCache<LayerKey, Layers>,
}

impl AppearanceCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            // An asset that says nothing about an object contributes nothing.
            layers: CoalescingCache::with_default("appearances", |_| Arc::new(Vec::new())),
        }
    }

    fn check(id: &ObjectId) -> CacheResult<()> {
        if id.tag().has_appearances() {
            Ok(())
        } else {
            Err(IdError::IllegalTag(id.to_string()).into())
        }
    }

    /// The appearances `asset` gives `id`.
    pub async fn get(&self, id: &ObjectId, asset: &str) -> CacheResult<Layers> {
        Self::check(id)?;
        let key = (id.clone(), asset.to_string());
        self.layers.add([key.clone()], |keys| self.fetch(keys)).await;
        self.layers.get(&key).await
    }

    /// The appearances of `id` for every asset in `assets`, in that order.
    ///
    /// Uncached assets are read in a single batched round trip.
    pub async fn get_across_assets(&self, id: &ObjectId, assets: &[String]) -> CacheResult<Vec<(String, Layers)>> {
        Self::check(id)?;
        let keys: Vec<LayerKey> = assets.iter().map(|asset| (id.clone(), asset.clone())).collect();
        let layers = self.layers.fetch_many(&keys, |keys| self.fetch(keys)).await?;
        Ok(assets.iter().cloned().zip(layers).collect())
    }

    async fn fetch(&self, keys: Vec<LayerKey>) -> CacheResult<HashMap<LayerKey, Layers>> {
        let store_keys: Vec<StoreKey> = keys
            .into_iter()
            .map(|(id, asset)| StoreKey::new(id, Category::Asset(asset)))
            .collect();
        debug!(count = store_keys.len(), "fetching appearances");
        let records = self.store.batch_get_item(&store_keys).await?;

        let mut found = HashMap::new();
        for StoreRecord { key, value } in records {
            let label = key.to_string();
            let Category::Asset(asset) = key.category else {
                continue;
            };
            let record: AssetRecord =
                serde_json::from_value(value).map_err(|err| CacheError::decode(&label, err))?;
            found.insert((key.id, asset), Arc::new(record.appearances));
        }
        Ok(found)
    }

    /// Forget what `asset` says about `id`.
    pub fn invalidate(&self, id: &ObjectId, asset: &str) -> bool {
        self.layers.invalidate(&(id.clone(), asset.to_string()))
    }

    /// Forget every asset's layers for `id`. Returns the assets dropped.
    pub fn invalidate_object(&self, id: &ObjectId) -> Vec<String> {
        self.layers
            .invalidate_where(|(object, _), _| object == id)
            .into_iter()
            .map(|(_, asset)| asset)
            .collect()
    }

    pub fn clear(&self) {
        self.layers.clear();
    }
}
