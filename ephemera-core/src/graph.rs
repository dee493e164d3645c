//! Bidirectional dependency graphs.
//!
//! Ancestry says what an object depends on; descent says what depends on it.
//! The two are mirror images, so every write to one is inverted into the
//! other. A node is `Complete` once its stored edge list has been merged in,
//! and `Partial` while only edges learned by inversion (or from collaborator
//! writes) are known.

use crate::coalesce::CoalescingCache;
use crate::error::{CacheError, CacheResult};
use crate::id::ObjectId;
use crate::store::{Category, Store, StoreKey, StoreRecord};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Ancestry,
    Descent,
}

impl Direction {
    pub fn inverse(self) -> Self {
        match self {
            Direction::Ancestry => Direction::Descent,
            Direction::Descent => Direction::Ancestry,
        }
    }

    fn category(self) -> Category {
        match self {
            Direction::Ancestry => Category::Ancestry,
            Direction::Descent => Category::Descent,
        }
    }

    fn cache_name(self) -> &'static str {
        match self {
            Direction::Ancestry => "ancestry",
            Direction::Descent => "descent",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cache_name())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Completeness {
    #[default]
    Partial,
    Complete,
}

/// A connection from one node to `target`, owned by one or more assets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub target: ObjectId,
    #[serde(default)]
    pub assets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl GraphEdge {
    pub fn new(target: ObjectId, assets: &[&str]) -> Self {
        Self {
            target,
            assets: assets.iter().map(|asset| asset.to_string()).collect(),
            key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    fn same_edge(&self, other: &GraphEdge) -> bool {
        self.target == other.target && self.key == other.key
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: ObjectId,
    #[serde(default)]
    pub completeness: Completeness,
    #[serde(default)]
    pub connections: Vec<GraphEdge>,
}

impl GraphNode {
    pub fn partial(id: ObjectId) -> Self {
        Self {
            id,
            completeness: Completeness::Partial,
            connections: Vec::new(),
        }
    }

    pub fn complete(id: ObjectId, connections: Vec<GraphEdge>) -> Self {
        Self {
            id,
            completeness: Completeness::Complete,
            connections,
        }
    }
}

/// A node and everything reachable from it, depth first, each id once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyTree {
    pub nodes: Vec<GraphNode>,
}

impl DependencyTree {
    pub fn new(nodes: Vec<GraphNode>) -> Self {
        Self { nodes }
    }

    pub fn node(&self, id: &ObjectId) -> Option<&GraphNode> {
        self.nodes.iter().find(|node| &node.id == id)
    }

    /// The same edges seen from the other direction. Every id appears, as a
    /// `Partial` node, even if nothing points back at it.
    pub fn invert(&self) -> DependencyTree {
        let mut order: Vec<ObjectId> = Vec::new();
        let mut inverted: HashMap<ObjectId, GraphNode> = HashMap::new();
        let mut touch = |id: &ObjectId, order: &mut Vec<ObjectId>| {
            if !inverted.contains_key(id) {
                inverted.insert(id.clone(), GraphNode::partial(id.clone()));
                order.push(id.clone());
            }
        };
        for node in &self.nodes {
            touch(&node.id, &mut order);
            for edge in &node.connections {
                touch(&edge.target, &mut order);
            }
        }
        for node in &self.nodes {
            for edge in &node.connections {
                if let Some(target) = inverted.get_mut(&edge.target) {
                    merge_edge(
                        &mut target.connections,
                        GraphEdge {
                            target: node.id.clone(),
                            assets: edge.assets.clone(),
                            key: edge.key.clone(),
                        },
                    );
                }
            }
        }
        DependencyTree {
            nodes: order.into_iter().filter_map(|id| inverted.remove(&id)).collect(),
        }
    }
}

/// Add `edge` to `edges`, unioning asset lists with an existing edge that has
/// the same target and key.
fn merge_edge(edges: &mut Vec<GraphEdge>, edge: GraphEdge) {
    match edges.iter_mut().find(|existing| existing.same_edge(&edge)) {
        Some(existing) => {
            for asset in edge.assets {
                if !existing.assets.contains(&asset) {
                    existing.assets.push(asset);
                }
            }
        }
        None => edges.push(edge),
    }
}

/// Stored form of a node's edge list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeRecord {
    #[serde(default)]
    pub connections: Vec<GraphEdge>,
}

/// One direction's node table plus the fetches that fill it.
struct DependencyGraph {
    direction: Direction,
    nodes: Mutex<HashMap<ObjectId, GraphNode>>,
    fetches: CoalescingCache<ObjectId, Arc<Vec<GraphEdge>>>,
}

impl DependencyGraph {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            nodes: Mutex::new(HashMap::new()),
            fetches: CoalescingCache::with_default(direction.cache_name(), |_| Arc::new(Vec::new())),
        }
    }

    fn nodes(&self) -> MutexGuard<'_, HashMap<ObjectId, GraphNode>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_node_complete(&self, id: &ObjectId) -> bool {
        self.nodes()
            .get(id)
            .is_some_and(|node| node.completeness == Completeness::Complete)
    }

    fn targets(&self, id: &ObjectId) -> Vec<ObjectId> {
        self.nodes()
            .get(id)
            .map(|node| node.connections.iter().map(|edge| edge.target.clone()).collect())
            .unwrap_or_default()
    }

    fn put_node(&self, node: GraphNode) {
        let mut nodes = self.nodes();
        match node.completeness {
            Completeness::Complete => {
                nodes.insert(node.id.clone(), node);
            }
            Completeness::Partial => {
                let existing = nodes
                    .entry(node.id.clone())
                    .or_insert_with(|| GraphNode::partial(node.id.clone()));
                for edge in node.connections {
                    merge_edge(&mut existing.connections, edge);
                }
            }
        }
    }

    /// Fold stored edges into whatever is known locally and mark the node
    /// complete.
    fn merge_fetched(&self, id: &ObjectId, fetched: &[GraphEdge]) {
        let mut nodes = self.nodes();
        let node = nodes
            .entry(id.clone())
            .or_insert_with(|| GraphNode::partial(id.clone()));
        if node.completeness == Completeness::Complete {
            return;
        }
        for edge in fetched {
            merge_edge(&mut node.connections, edge.clone());
        }
        node.completeness = Completeness::Complete;
    }

    fn is_complete(&self, id: &ObjectId) -> bool {
        let nodes = self.nodes();
        let mut seen = HashSet::new();
        let mut stack = vec![id.clone()];
        while let Some(next) = stack.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            match nodes.get(&next) {
                Some(node) if node.completeness == Completeness::Complete => {
                    stack.extend(node.connections.iter().map(|edge| edge.target.clone()));
                }
                _ => return false,
            }
        }
        true
    }

    fn extract(&self, id: &ObjectId) -> DependencyTree {
        let nodes = self.nodes();
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut stack = vec![id.clone()];
        while let Some(next) = stack.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            let node = nodes
                .get(&next)
                .cloned()
                .unwrap_or_else(|| GraphNode::partial(next.clone()));
            // Reverse so the first connection is visited first.
            stack.extend(node.connections.iter().rev().map(|edge| edge.target.clone()));
            order.push(node);
        }
        DependencyTree { nodes: order }
    }

    fn invalidate(&self, id: &ObjectId) {
        if let Some(node) = self.nodes().get_mut(id) {
            node.completeness = Completeness::Partial;
        }
        self.fetches.invalidate(id);
        debug!(direction = %self.direction, %id, "graph node invalidated");
    }

    /// Strip `assets` from the edge `(target, key)` of `id`, dropping the edge
    /// once no asset owns it.
    fn remove_assets(&self, id: &ObjectId, target: &ObjectId, key: &Option<String>, assets: &[String]) -> bool {
        let mut nodes = self.nodes();
        let Some(node) = nodes.get_mut(id) else {
            return false;
        };
        let Some(position) = node
            .connections
            .iter()
            .position(|edge| &edge.target == target && &edge.key == key)
        else {
            return false;
        };
        let edge = &mut node.connections[position];
        edge.assets.retain(|asset| !assets.contains(asset));
        if edge.assets.is_empty() {
            node.connections.remove(position);
        }
        true
    }
}

/// The paired ancestry and descent graphs.
pub struct DependencyGraphs {
    store: Arc<dyn Store>,
    ancestry: DependencyGraph,
    descent: DependencyGraph,
}

impl DependencyGraphs {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            ancestry: DependencyGraph::new(Direction::Ancestry),
            descent: DependencyGraph::new(Direction::Descent),
        }
    }

    fn graph(&self, direction: Direction) -> &DependencyGraph {
        match direction {
            Direction::Ancestry => &self.ancestry,
            Direction::Descent => &self.descent,
        }
    }

    /// The tree rooted at `id`, fetching every reachable incomplete node.
    ///
    /// Traversal is breadth first so each frontier level costs one batched
    /// store read.
    pub async fn get(&self, direction: Direction, id: &ObjectId) -> CacheResult<DependencyTree> {
        let graph = self.graph(direction);
        if graph.is_complete(id) {
            trace!(%direction, %id, "graph served locally");
            return Ok(graph.extract(id));
        }

        let mut visited = HashSet::new();
        let mut frontier = vec![id.clone()];
        while !frontier.is_empty() {
            let level: Vec<ObjectId> = frontier
                .into_iter()
                .filter(|node| visited.insert(node.clone()))
                .collect();
            let incomplete: Vec<ObjectId> = level
                .iter()
                .filter(|node| !graph.is_node_complete(node))
                .cloned()
                .collect();
            if !incomplete.is_empty() {
                let fetched = graph
                    .fetches
                    .fetch_many(&incomplete, |ids| self.fetch(direction, ids))
                    .await?;
                for (node, edges) in incomplete.iter().zip(fetched) {
                    graph.merge_fetched(node, &edges);
                }
            }
            frontier = level
                .iter()
                .flat_map(|node| graph.targets(node))
                .filter(|target| !visited.contains(target))
                .collect();
        }
        Ok(graph.extract(id))
    }

    async fn fetch(&self, direction: Direction, ids: Vec<ObjectId>) -> CacheResult<HashMap<ObjectId, Arc<Vec<GraphEdge>>>> {
        debug!(%direction, count = ids.len(), "fetching graph level");
        let keys: Vec<StoreKey> = ids
            .into_iter()
            .map(|id| StoreKey::new(id, direction.category()))
            .collect();
        let mut found = HashMap::new();
        for StoreRecord { key, value } in self.store.batch_get_item(&keys).await? {
            let record: EdgeRecord =
                serde_json::from_value(value).map_err(|err| CacheError::decode(&key, err))?;
            found.insert(key.id, Arc::new(record.connections));
        }
        Ok(found)
    }

    /// Record a tree learned elsewhere.
    ///
    /// Complete nodes replace what is known; partial nodes add edges. Unless
    /// `non_recursive`, the inverted tree is put into the paired graph too.
    pub fn put(&self, direction: Direction, tree: &DependencyTree, non_recursive: bool) {
        let graph = self.graph(direction);
        for node in &tree.nodes {
            graph.put_node(node.clone());
        }
        if !non_recursive {
            let mirror = self.graph(direction.inverse());
            for node in tree.invert().nodes {
                mirror.put_node(node);
            }
        }
        debug!(%direction, nodes = tree.nodes.len(), non_recursive, "graph put");
    }

    /// Mark `id` partial so the next `get` refetches it.
    pub fn invalidate(&self, direction: Direction, id: &ObjectId) {
        self.graph(direction).invalidate(id);
    }

    /// Remove `edge.assets` from the matching edge of `id`, and from its
    /// mirror in the paired graph.
    pub fn delete(&self, direction: Direction, id: &ObjectId, edge: &GraphEdge) -> bool {
        let here = self
            .graph(direction)
            .remove_assets(id, &edge.target, &edge.key, &edge.assets);
        let mirrored = self
            .graph(direction.inverse())
            .remove_assets(&edge.target, id, &edge.key, &edge.assets);
        here || mirrored
    }

    /// Whether `id` and everything reachable from it is complete.
    pub fn is_complete(&self, direction: Direction, id: &ObjectId) -> bool {
        self.graph(direction).is_complete(id)
    }

    /// The locally known state of one node.
    pub fn node(&self, direction: Direction, id: &ObjectId) -> Option<GraphNode> {
        self.graph(direction).nodes().get(id).cloned()
    }

    pub fn clear(&self) {
        for graph in [&self.ancestry, &self.descent] {
            graph.nodes().clear();
            graph.fetches.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn id(s: &str) -> ObjectId {
        ObjectId::parse(s).unwrap()
    }

    #[test]
    fn test_invert() {
        let tree = DependencyTree::new(vec![
            GraphNode::complete(id("ASSET#a"), vec![GraphEdge::new(id("ASSET#b"), &["a"])]),
            GraphNode::complete(id("ASSET#b"), vec![]),
        ]);
        let inverted = tree.invert();
        assert_eq!(inverted.nodes.len(), 2);
        let b = inverted.node(&id("ASSET#b")).unwrap();
        assert_eq!(b.completeness, Completeness::Partial);
        assert_eq!(b.connections, vec![GraphEdge::new(id("ASSET#a"), &["a"])]);
        assert!(inverted.node(&id("ASSET#a")).unwrap().connections.is_empty());
    }

    #[test]
    fn test_partial_put_unions_assets() {
        let graphs = DependencyGraphs::new(Arc::new(MemoryStore::new()));
        let put = |assets: &[&str]| {
            graphs.put(
                Direction::Ancestry,
                &DependencyTree::new(vec![GraphNode {
                    id: id("ROOM#a"),
                    completeness: Completeness::Partial,
                    connections: vec![GraphEdge::new(id("ROOM#b"), assets)],
                }]),
                true,
            )
        };
        put(&["x"]);
        put(&["y", "x"]);
        let node = graphs.node(Direction::Ancestry, &id("ROOM#a")).unwrap();
        assert_eq!(node.connections, vec![GraphEdge::new(id("ROOM#b"), &["x", "y"])]);
        assert!(graphs.node(Direction::Descent, &id("ROOM#b")).is_none());
    }

    #[test]
    fn test_extract_handles_cycles() {
        let graphs = DependencyGraphs::new(Arc::new(MemoryStore::new()));
        graphs.put(
            Direction::Descent,
            &DependencyTree::new(vec![
                GraphNode::complete(id("ASSET#a"), vec![GraphEdge::new(id("ASSET#b"), &[])]),
                GraphNode::complete(id("ASSET#b"), vec![GraphEdge::new(id("ASSET#a"), &[])]),
            ]),
            false,
        );
        assert!(graphs.is_complete(Direction::Descent, &id("ASSET#a")));
        let tree = graphs.graph(Direction::Descent).extract(&id("ASSET#a"));
        let ids: Vec<&str> = tree.nodes.iter().map(|node| node.id.as_str()).collect();
        assert_eq!(ids, vec!["ASSET#a", "ASSET#b"]);
    }

    #[tokio::test]
    async fn test_get_batches_per_level() {
        let store = Arc::new(MemoryStore::new());
        let edges = |targets: &[&str]| {
            json!({ "connections": targets.iter().map(|t| json!({ "target": t, "assets": ["base"] })).collect::<Vec<_>>() })
        };
        store.put_item(StoreKey::new(id("ASSET#root"), Category::Ancestry), edges(&["ASSET#l", "ASSET#r"]));
        store.put_item(StoreKey::new(id("ASSET#l"), Category::Ancestry), edges(&["ASSET#leaf"]));
        store.put_item(StoreKey::new(id("ASSET#r"), Category::Ancestry), edges(&["ASSET#leaf"]));
        let graphs = DependencyGraphs::new(store.clone());

        let tree = graphs.get(Direction::Ancestry, &id("ASSET#root")).await.unwrap();
        let ids: Vec<&str> = tree.nodes.iter().map(|node| node.id.as_str()).collect();
        assert_eq!(ids, vec!["ASSET#root", "ASSET#l", "ASSET#leaf", "ASSET#r"]);
        assert_eq!(store.stats().batch_calls(), 3);
        assert_eq!(store.batch_log()[1].len(), 2);
        assert!(graphs.is_complete(Direction::Ancestry, &id("ASSET#root")));

        graphs.get(Direction::Ancestry, &id("ASSET#root")).await.unwrap();
        assert_eq!(store.stats().batch_calls(), 3);

        graphs.invalidate(Direction::Ancestry, &id("ASSET#l"));
        assert!(!graphs.is_complete(Direction::Ancestry, &id("ASSET#root")));
        graphs.get(Direction::Ancestry, &id("ASSET#root")).await.unwrap();
        assert_eq!(store.stats().batch_calls(), 4);
        assert_eq!(store.batch_log()[3], vec![StoreKey::new(id("ASSET#l"), Category::Ancestry)]);
    }

    #[test]
    fn test_delete_trims_mirror() {
        let graphs = DependencyGraphs::new(Arc::new(MemoryStore::new()));
        graphs.put(
            Direction::Ancestry,
            &DependencyTree::new(vec![GraphNode::complete(
                id("ASSET#a"),
                vec![GraphEdge::new(id("ASSET#b"), &["one", "two"])],
            )]),
            false,
        );

        assert!(graphs.delete(Direction::Ancestry, &id("ASSET#a"), &GraphEdge::new(id("ASSET#b"), &["one"])));
        let a = graphs.node(Direction::Ancestry, &id("ASSET#a")).unwrap();
        assert_eq!(a.connections, vec![GraphEdge::new(id("ASSET#b"), &["two"])]);
        let b = graphs.node(Direction::Descent, &id("ASSET#b")).unwrap();
        assert_eq!(b.connections, vec![GraphEdge::new(id("ASSET#a"), &["two"])]);

        graphs.delete(Direction::Ancestry, &id("ASSET#a"), &GraphEdge::new(id("ASSET#b"), &["two"]));
        assert!(graphs.node(Direction::Ancestry, &id("ASSET#a")).unwrap().connections.is_empty());
        assert!(graphs.node(Direction::Descent, &id("ASSET#b")).unwrap().connections.is_empty());
    }
}
