//! World fixtures: a whole small world as one JSON document.
//!
//! Fixtures seed a [`MemoryStore`] for the headless console and for tests.
//! The layout mirrors the store's record kinds, keyed by object id:
//!
//! ```json
//! {
//!   "version": 1,
//!   "canonAssets": ["base"],
//!   "characters": { "CHARACTER#tess": { "name": "Tess", "assets": ["tess"] } },
//!   "variables": { "VARIABLE#lamp": true },
//!   "computed": { "COMPUTED#dark": { "src": "!lamp", "dependencies": [{ "key": "lamp", "id": "VARIABLE#lamp" }] } },
//!   "appearances": { "base": { "ROOM#hall": [{ "name": "Hall", "render": [] }] } },
//!   "ancestry": { "ASSET#tess": [{ "target": "ASSET#base", "assets": ["tess"] }] },
//!   "descent": {}
//! }
//! ```

use crate::appearance::{Appearance, AssetRecord};
use crate::character::CharacterRecord;
use crate::config::PerceptionConfig;
use crate::error::{Error, Result};
use crate::graph::{EdgeRecord, GraphEdge};
use crate::id::{ObjectId, Tag};
use crate::store::{Category, MemoryStore, StoreKey};
use crate::variables::{ComputedRecord, VariableRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;
use tracing::debug;

/// Current fixture format version.
pub const FIXTURE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldFixture {
    /// Format version for compatibility checking.
    pub version: u32,
    #[serde(default)]
    pub canon_assets: Vec<String>,
    #[serde(default)]
    pub characters: BTreeMap<ObjectId, CharacterRecord>,
    #[serde(default)]
    pub variables: BTreeMap<ObjectId, Value>,
    #[serde(default)]
    pub computed: BTreeMap<ObjectId, ComputedRecord>,
    /// asset → object → layers
    #[serde(default)]
    pub appearances: BTreeMap<String, BTreeMap<ObjectId, Vec<Appearance>>>,
    #[serde(default)]
    pub ancestry: BTreeMap<ObjectId, Vec<GraphEdge>>,
    #[serde(default)]
    pub descent: BTreeMap<ObjectId, Vec<GraphEdge>>,
}

impl Default for WorldFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl WorldFixture {
    pub fn new() -> Self {
        Self {
            version: FIXTURE_VERSION,
            canon_assets: Vec::new(),
            characters: BTreeMap::new(),
            variables: BTreeMap::new(),
            computed: BTreeMap::new(),
            appearances: BTreeMap::new(),
            ancestry: BTreeMap::new(),
            descent: BTreeMap::new(),
        }
    }

    /// Parse a fixture, rejecting other format versions.
    pub fn from_json_str(content: &str) -> Result<Self> {
        let fixture: Self = serde_json::from_str(content)?;
        if fixture.version != FIXTURE_VERSION {
            return Err(Error::VersionMismatch {
                expected: FIXTURE_VERSION,
                found: fixture.version,
            });
        }
        Ok(fixture)
    }

    /// Load from a JSON file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        Self::from_json_str(&content)
    }

    /// Save to a JSON file.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }

    pub fn config(&self) -> PerceptionConfig {
        PerceptionConfig::new().with_canon_assets(self.canon_assets.iter().cloned())
    }

    /// Write every record into `store`.
    ///
    /// Ids filed under the wrong section are rejected before anything is
    /// written.
    pub fn populate(&self, store: &MemoryStore) -> Result<()> {
        self.validate()?;

        for (id, record) in &self.characters {
            store.put_item(StoreKey::meta(id.clone()), serde_json::to_value(record)?);
        }
        for (id, value) in &self.variables {
            let record = VariableRecord { value: value.clone() };
            store.put_item(StoreKey::meta(id.clone()), serde_json::to_value(record)?);
        }
        for (id, record) in &self.computed {
            store.put_item(StoreKey::meta(id.clone()), serde_json::to_value(record)?);
        }
        for (asset, objects) in &self.appearances {
            for (id, appearances) in objects {
                let record = AssetRecord {
                    appearances: appearances.clone(),
                };
                store.put_item(
                    StoreKey::new(id.clone(), Category::Asset(asset.clone())),
                    serde_json::to_value(record)?,
                );
            }
        }
        for (category, edges) in [(Category::Ancestry, &self.ancestry), (Category::Descent, &self.descent)] {
            for (id, connections) in edges {
                let record = EdgeRecord {
                    connections: connections.clone(),
                };
                store.put_item(StoreKey::new(id.clone(), category.clone()), serde_json::to_value(record)?);
            }
        }
        debug!(
            characters = self.characters.len(),
            variables = self.variables.len(),
            computed = self.computed.len(),
            assets = self.appearances.len(),
            "fixture loaded into store"
        );
        Ok(())
    }

    pub fn into_store(self) -> Result<MemoryStore> {
        let store = MemoryStore::new();
        self.populate(&store)?;
        Ok(store)
    }

    fn validate(&self) -> Result<()> {
        for id in self.characters.keys() {
            id.expect_tag(&[Tag::Character])?;
        }
        for id in self.variables.keys() {
            id.expect_tag(&[Tag::Variable])?;
        }
        for id in self.computed.keys() {
            id.expect_tag(&[Tag::Computed])?;
        }
        for objects in self.appearances.values() {
            for id in objects.keys() {
                if !id.tag().has_appearances() {
                    return Err(crate::id::IdError::IllegalTag(id.to_string()).into());
                }
            }
        }
        Ok(())
    }
}
