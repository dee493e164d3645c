//! Testing utilities for the perception core.
//!
//! This module provides tools for integration testing:
//! - `TestWorld` for building a small world without a fixture file
//! - `TestHarness` for running requests against it and mutating the store
//!   the way a collaborator would

use crate::appearance::{Appearance, Condition};
use crate::character::CharacterRecord;
use crate::config::PerceptionConfig;
use crate::context::RequestContext;
use crate::error::Result;
use crate::fixture::WorldFixture;
use crate::graph::{Direction, GraphEdge};
use crate::id::ObjectId;
use crate::store::{MemoryStore, Store, StoreKey};
use crate::variables::{ComputedRecord, Dependency};
use serde_json::{json, Value};
use std::sync::Arc;

/// Parse an id in test code, where a malformed literal is a bug in the test.
pub fn oid(s: &str) -> ObjectId {
    match ObjectId::parse(s) {
        Ok(id) => id,
        Err(err) => panic!("bad test id {s:?}: {err}"),
    }
}

/// A condition that passes when `expression`, evaluated over `bindings`
/// (`(name, id)` pairs), is truthy.
pub fn condition(expression: &str, bindings: &[(&str, &str)]) -> Condition {
    Condition::new(
        expression,
        bindings
            .iter()
            .map(|(key, id)| Dependency::new(*key, oid(id)))
            .collect(),
    )
}

/// Builder for a small world.
#[derive(Debug, Clone, Default)]
pub struct TestWorld {
    fixture: WorldFixture,
}

impl TestWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn canon_asset(mut self, asset: &str) -> Self {
        self.fixture.canon_assets.push(asset.to_string());
        self
    }

    pub fn character(mut self, id: &str, name: &str, assets: &[&str]) -> Self {
        self.fixture.characters.insert(
            oid(id),
            CharacterRecord {
                name: name.to_string(),
                assets: assets.iter().map(|asset| asset.to_string()).collect(),
            },
        );
        self
    }

    pub fn variable(mut self, id: &str, value: Value) -> Self {
        self.fixture.variables.insert(oid(id), value);
        self
    }

    pub fn computed(mut self, id: &str, src: &str, bindings: &[(&str, &str)]) -> Self {
        self.fixture.computed.insert(
            oid(id),
            ComputedRecord {
                src: src.to_string(),
                dependencies: bindings
                    .iter()
                    .map(|(key, id)| Dependency::new(*key, oid(id)))
                    .collect(),
            },
        );
        self
    }

    /// Add a layer to what `asset` says about `object`.
    pub fn appearance(mut self, object: &str, asset: &str, appearance: Appearance) -> Self {
        self.fixture
            .appearances
            .entry(asset.to_string())
            .or_default()
            .entry(oid(object))
            .or_default()
            .push(appearance);
        self
    }

    pub fn edges(mut self, direction: Direction, id: &str, edges: Vec<GraphEdge>) -> Self {
        let table = match direction {
            Direction::Ancestry => &mut self.fixture.ancestry,
            Direction::Descent => &mut self.fixture.descent,
        };
        table.entry(oid(id)).or_default().extend(edges);
        self
    }

    pub fn build(self) -> Result<TestHarness> {
        let config = self.fixture.config();
        let store = Arc::new(self.fixture.into_store()?);
        Ok(TestHarness { store, config })
    }
}

/// A populated store plus the configuration requests run with.
pub struct TestHarness {
    /// The backing store, for stats and direct writes.
    pub store: Arc<MemoryStore>,
    pub config: PerceptionConfig,
}

impl TestHarness {
    /// A fresh request context: empty caches over the shared store.
    pub fn context(&self) -> RequestContext {
        let store: Arc<dyn Store> = self.store.clone();
        RequestContext::new(store, self.config.clone())
    }

    /// Write a variable straight to the store, as a mutation collaborator
    /// would. Caches are not told.
    pub fn write_variable(&self, id: &str, value: Value) {
        self.store
            .put_item(StoreKey::meta(oid(id)), json!({ "value": value }));
    }

    /// Render and flatten to plain text.
    pub async fn look(&self, ctx: &RequestContext, character: &str, object: &str) -> String {
        match ctx.perceive(&oid(character), &oid(object)).await {
            Ok(description) => description.plain_text(),
            Err(err) => panic!("render of {object} for {character} failed: {err}"),
        }
    }
}
