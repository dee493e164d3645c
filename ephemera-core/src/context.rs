//! The per-request cache hierarchy.
//!
//! A [`RequestContext`] is built when a request arrives, passed by reference
//! to everything that needs state, and dropped when the request ends. Nothing
//! outlives it. Collaborators that change the world call the `set_*` and
//! `invalidate_*` methods here so every cache that could hold a stale answer
//! hears about it.

use crate::appearance::AppearanceCache;
use crate::character::CharacterCache;
use crate::config::PerceptionConfig;
use crate::error::CacheResult;
use crate::expression::ExpressionEvaluator;
use crate::graph::DependencyGraphs;
use crate::id::ObjectId;
use crate::render::{PerceptionRenderer, RenderedDescription};
use crate::store::Store;
use crate::variables::VariableStateCache;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub struct RequestContext {
    store: Arc<dyn Store>,
    config: PerceptionConfig,
    characters: CharacterCache,
    variables: VariableStateCache,
    evaluator: ExpressionEvaluator,
    appearances: AppearanceCache,
    graphs: DependencyGraphs,
    renderer: PerceptionRenderer,
}

impl RequestContext {
    pub fn new(store: Arc<dyn Store>, config: PerceptionConfig) -> Self {
        Self {
            characters: CharacterCache::new(store.clone()),
            variables: VariableStateCache::new(store.clone()),
            evaluator: ExpressionEvaluator::new(),
            appearances: AppearanceCache::new(store.clone()),
            graphs: DependencyGraphs::new(store.clone()),
            renderer: PerceptionRenderer::new(),
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> &PerceptionConfig {
        &self.config
    }

    pub fn characters(&self) -> &CharacterCache {
        &self.characters
    }

    pub fn variables(&self) -> &VariableStateCache {
        &self.variables
    }

    pub fn evaluator(&self) -> &ExpressionEvaluator {
        &self.evaluator
    }

    pub fn appearances(&self) -> &AppearanceCache {
        &self.appearances
    }

    pub fn graphs(&self) -> &DependencyGraphs {
        &self.graphs
    }

    pub fn renderer(&self) -> &PerceptionRenderer {
        &self.renderer
    }

    /// What `character` currently perceives of `object`.
    pub async fn perceive(&self, character: &ObjectId, object: &ObjectId) -> CacheResult<Arc<RenderedDescription>> {
        self.renderer.get(self, character, object).await
    }

    /// Evaluate an expression with the given bindings.
    pub async fn evaluate(&self, expression: &str, mapping: &BTreeMap<String, ObjectId>) -> CacheResult<Value> {
        self.evaluator.get(&self.variables, expression, mapping).await
    }

    /// A collaborator wrote `value` to `id`.
    ///
    /// Returns every id whose value may have changed.
    pub fn set_variable(&self, id: &ObjectId, value: Value) -> CacheResult<Vec<ObjectId>> {
        let affected = self.variables.set(id, value)?;
        self.evict_readers(&affected);
        Ok(affected)
    }

    /// Drop the cached value of `id` (and of computed values reading it).
    pub fn invalidate_variable(&self, id: &ObjectId) -> Vec<ObjectId> {
        let cleared = self.variables.invalidate(id);
        self.evict_readers(&cleared);
        cleared
    }

    fn evict_readers(&self, ids: &[ObjectId]) {
        let mut evaluations = 0;
        let mut renders = 0;
        for id in ids {
            evaluations += self.evaluator.invalidate_by_variable(id);
            renders += self.renderer.invalidate_by_variable(id).len();
        }
        debug!(ids = ids.len(), evaluations, renders, "evicted readers");
    }

    /// A collaborator changed what `asset` says about `object`.
    pub fn invalidate_appearance(&self, object: &ObjectId, asset: &str) {
        self.appearances.invalidate(object, asset);
        self.renderer.invalidate_by_object(object);
    }

    /// A collaborator changed `object` in every asset it knows of.
    ///
    /// Returns the assets whose cached layers were dropped.
    pub fn invalidate_object(&self, object: &ObjectId) -> Vec<String> {
        let assets = self.appearances.invalidate_object(object);
        self.renderer.invalidate_by_object(object);
        assets
    }

    /// A character's metadata (for example its asset list) changed.
    pub fn invalidate_character(&self, id: &ObjectId) {
        self.characters.invalidate(id);
        self.renderer.invalidate_character(id);
    }

    pub fn clear(&self) {
        self.characters.clear();
        self.variables.clear();
        self.evaluator.clear();
        self.appearances.clear();
        self.graphs.clear();
        self.renderer.clear();
    }
}
