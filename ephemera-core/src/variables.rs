//! Game-state values: variables and computed expressions.
//!
//! Variables are plain stored values. Computed values are expressions over
//! other variables (or computed values) and are evaluated when fetched. Both
//! are fetched in batches through one [`CoalescingCache`] keyed by id, and
//! collaborators that write state can pin a value with
//! [`VariableStateCache::set`].

use crate::coalesce::CoalescingCache;
use crate::error::{CacheError, CacheResult};
use crate::expression;
use crate::id::{ObjectId, Tag};
use crate::store::{Store, StoreKey};
use futures::future::{FutureExt, LocalBoxFuture};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// One named binding of a condition or computed value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub key: String,
    pub id: ObjectId,
}

impl Dependency {
    pub fn new(key: impl Into<String>, id: ObjectId) -> Self {
        Self { key: key.into(), id }
    }
}

/// Build the name→id mapping an expression is evaluated with.
pub fn mapping_of(dependencies: &[Dependency]) -> BTreeMap<String, ObjectId> {
    dependencies
        .iter()
        .map(|dependency| (dependency.key.clone(), dependency.id.clone()))
        .collect()
}

/// Stored form of a `VARIABLE#` record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableRecord {
    #[serde(default)]
    pub value: Value,
}

/// Stored form of a `COMPUTED#` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputedRecord {
    pub src: String,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

const STATE_TAGS: [Tag; 2] = [Tag::Variable, Tag::Computed];

/// Batched, memoized access to variable and computed values.
pub struct VariableStateCache {
    store: Arc<dyn Store>,
    values: CoalescingCache<ObjectId, Value>,
    overrides: Mutex<HashMap<ObjectId, Value>>,
    /// id -> computed ids whose expressions read it
    dependents: Mutex<HashMap<ObjectId, BTreeSet<ObjectId>>>,
}

impl VariableStateCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            // A variable that was never written reads as null.
            values: CoalescingCache::with_default("variables", |_| Value::Null),
            overrides: Mutex::new(HashMap::new()),
            dependents: Mutex::new(HashMap::new()),
        }
    }

    fn overrides(&self) -> MutexGuard<'_, HashMap<ObjectId, Value>> {
        self.overrides.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dependents(&self) -> MutexGuard<'_, HashMap<ObjectId, BTreeSet<ObjectId>>> {
        self.dependents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn override_of(&self, id: &ObjectId) -> Option<Value> {
        self.overrides().get(id).cloned()
    }

    /// Resolve every binding in `mapping`.
    ///
    /// All ids that are neither cached nor overridden go out in one batched
    /// read, however many names alias the same id.
    pub async fn get(&self, mapping: &BTreeMap<String, ObjectId>) -> CacheResult<BTreeMap<String, Value>> {
        self.get_within(mapping, &[]).await
    }

    fn get_within<'a>(
        &'a self,
        mapping: &'a BTreeMap<String, ObjectId>,
        chain: &'a [ObjectId],
    ) -> LocalBoxFuture<'a, CacheResult<BTreeMap<String, Value>>> {
        async move {
            for id in mapping.values() {
                id.expect_tag(&STATE_TAGS)?;
                if chain.contains(id) {
                    return Err(CacheError::CircularComputed(id.clone()));
                }
            }

            let wanted: BTreeSet<ObjectId> = {
                let overrides = self.overrides();
                mapping
                    .values()
                    .filter(|id| !overrides.contains_key(*id))
                    .cloned()
                    .collect()
            };
            self.values.add(wanted, |ids| self.fetch(ids, chain)).await;

            // A computed value still pending here belongs to another fetch. If
            // it reads anything on this chain, waiting for it would never end.
            for id in mapping.values() {
                if id.tag() == Tag::Computed && self.values.is_pending(id) && self.closes_cycle(id, chain) {
                    debug!(%id, "circular computed across fetches");
                    return Err(CacheError::CircularComputed(id.clone()));
                }
            }

            let mut resolved = BTreeMap::new();
            for (name, id) in mapping {
                let value = match self.override_of(id) {
                    Some(value) => value,
                    None => match self.values.get(id).await {
                        Ok(value) => value,
                        // An override installed while the fetch was failing still wins.
                        Err(err) => self.override_of(id).ok_or(err)?,
                    },
                };
                resolved.insert(name.clone(), value);
            }
            Ok(resolved)
        }
        .boxed_local()
    }

    async fn fetch(&self, ids: Vec<ObjectId>, chain: &[ObjectId]) -> CacheResult<HashMap<ObjectId, Value>> {
        let keys: Vec<StoreKey> = ids.iter().cloned().map(StoreKey::meta).collect();
        debug!(count = keys.len(), "fetching variable state");
        let records = self.store.batch_get_item(&keys).await?;

        let mut values = HashMap::new();
        let mut computed = BTreeMap::new();
        for record in records {
            let id = record.key.id;
            if id.tag() == Tag::Computed {
                let source: ComputedRecord =
                    serde_json::from_value(record.value).map_err(|err| CacheError::decode(&id, err))?;
                computed.insert(id, source);
            } else {
                let variable: VariableRecord =
                    serde_json::from_value(record.value).map_err(|err| CacheError::decode(&id, err))?;
                values.insert(id, variable.value);
            }
        }

        // Computed values in this batch may read slots this batch owns, so
        // those have to be filled before anything is evaluated.
        for id in &ids {
            if !computed.contains_key(id) {
                let value = values.entry(id.clone()).or_insert(Value::Null);
                self.values.fill(id, value.clone());
            }
        }

        for id in evaluation_order(&computed)? {
            let source = &computed[&id];
            let mapping = mapping_of(&source.dependencies);
            self.record_dependents(&id, mapping.values());

            let mut inner_chain = chain.to_vec();
            inner_chain.push(id.clone());
            let bindings = self.get_within(&mapping, &inner_chain).await?;
            let value = expression::evaluate(&source.src, &bindings)?;
            self.values.fill(&id, value.clone());
            values.insert(id, value);
        }
        Ok(values)
    }

    fn record_dependents<'a>(&self, computed: &ObjectId, reads: impl Iterator<Item = &'a ObjectId>) {
        let mut dependents = self.dependents();
        for read in reads {
            dependents
                .entry(read.clone())
                .or_default()
                .insert(computed.clone());
        }
    }

    /// Whether `pending` (transitively) reads a computed value on `chain`.
    fn closes_cycle(&self, pending: &ObjectId, chain: &[ObjectId]) -> bool {
        chain
            .iter()
            .any(|evaluating| self.dependents_of(evaluating).contains(pending))
    }

    /// Computed ids that (transitively) read `id`, not including `id`.
    fn dependents_of(&self, id: &ObjectId) -> Vec<ObjectId> {
        let dependents = self.dependents();
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        let mut queue = vec![id.clone()];
        while let Some(next) = queue.pop() {
            for dependent in dependents.get(&next).into_iter().flatten() {
                if dependent != id && seen.insert(dependent.clone()) {
                    found.push(dependent.clone());
                    queue.push(dependent.clone());
                }
            }
        }
        found
    }

    /// Pin `id` to `value` for the rest of the request.
    ///
    /// The override wins over any fetch, including one that fails. Computed
    /// values reading `id` are dropped so they recompute. Returns every id
    /// whose value may have changed, `id` first.
    pub fn set(&self, id: &ObjectId, value: Value) -> CacheResult<Vec<ObjectId>> {
        id.expect_tag(&STATE_TAGS)?;
        self.overrides().insert(id.clone(), value.clone());
        self.values.set(id.clone(), value);

        let mut affected = vec![id.clone()];
        for dependent in self.dependents_of(id) {
            self.values.invalidate(&dependent);
            affected.push(dependent);
        }
        debug!(%id, affected = affected.len(), "variable set");
        Ok(affected)
    }

    /// Clear the cached value and any override for `id`, and for every
    /// computed value reading it. Returns the ids cleared, `id` first.
    pub fn invalidate(&self, id: &ObjectId) -> Vec<ObjectId> {
        let mut cleared = vec![id.clone()];
        cleared.extend(self.dependents_of(id));
        for cleared_id in &cleared {
            self.overrides().remove(cleared_id);
            self.values.invalidate(cleared_id);
        }
        debug!(%id, cleared = cleared.len(), "variable invalidated");
        cleared
    }

    pub fn is_cached(&self, id: &ObjectId) -> bool {
        self.values.is_cached(id) || self.overrides().contains_key(id)
    }

    pub fn clear(&self) {
        self.values.clear();
        self.overrides().clear();
        self.dependents().clear();
    }
}

/// Order the computed values of one batch so each comes after the computed
/// values from the same batch that it reads.
fn evaluation_order(batch: &BTreeMap<ObjectId, ComputedRecord>) -> CacheResult<Vec<ObjectId>> {
    let mut remaining: BTreeSet<&ObjectId> = batch.keys().collect();
    let mut order = Vec::with_capacity(batch.len());
    while let Some(first) = remaining.first().copied() {
        let ready: Vec<&ObjectId> = remaining
            .iter()
            .copied()
            .filter(|id| {
                batch[*id]
                    .dependencies
                    .iter()
                    .all(|dependency| !remaining.contains(&dependency.id))
            })
            .collect();
        if ready.is_empty() {
            return Err(CacheError::CircularComputed(first.clone()));
        }
        for id in ready {
            remaining.remove(id);
            order.push(id.clone());
        }
    }
    Ok(order)
}
