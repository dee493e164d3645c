//! Perception rendering.
//!
//! A character perceives an object as the merge of every appearance, across
//! the character's accessible assets, whose conditions currently pass:
//!
//! 1. Accessible assets are the canon assets followed by the character's own.
//! 2. Appearances are taken in asset order and gated on their conditions.
//! 3. Passing layers are merged: render streams and names concatenate, exits
//!    for the same target are replaced by later layers.
//! 4. Bookmarks and `If` items inside the render stream are resolved, then the
//!    join pass produces the final [`Segment`]s.
//! 5. Maps additionally resolve each placed room's name and exits.
//!
//! Each result remembers every variable its conditions read and every object
//! whose appearances it merged, so it can be evicted precisely.

mod merge;

pub use merge::Segment;

use crate::appearance::{Appearance, Condition, Exit, MapRoom, RenderItem};
use crate::coalesce::CoalescingCache;
use crate::context::RequestContext;
use crate::error::CacheResult;
use crate::expression::is_truthy;
use crate::id::{ObjectId, Tag};
use futures::future::{FutureExt, LocalBoxFuture};
use merge::Piece;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, trace};

const PERCEIVABLE: [Tag; 5] = [Tag::Room, Tag::Feature, Tag::Map, Tag::Knowledge, Tag::Bookmark];

/// A room as it appears on a rendered map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedMapRoom {
    pub key: String,
    pub room: ObjectId,
    pub x: i64,
    pub y: i64,
    pub name: String,
    /// Only exits leading to other rooms on the same map.
    pub exits: Vec<Exit>,
}

/// What one character currently perceives of one object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedDescription {
    pub name: String,
    pub render: Vec<Segment>,
    pub exits: Vec<Exit>,
    pub rooms: Vec<RenderedMapRoom>,
    /// Every VARIABLE/COMPUTED id a condition consulted, pass or fail.
    pub dependencies: BTreeSet<ObjectId>,
    /// Every object whose appearances were merged in.
    pub objects: BTreeSet<ObjectId>,
}

impl RenderedDescription {
    /// The rendered text with links flattened to their text.
    pub fn plain_text(&self) -> String {
        let mut text = String::new();
        for segment in &self.render {
            match segment {
                Segment::Text { value } => text.push_str(value),
                Segment::Link { text: link, .. } => text.push_str(link),
                Segment::LineBreak => text.push('\n'),
                Segment::CircularReference { to } => {
                    text.push_str(&format!("[circular {to}]"));
                }
            }
        }
        text
    }
}

/// Passing layers of one object, merged in asset order.
#[derive(Debug, Default)]
struct MergedLayers {
    name: String,
    render: Vec<RenderItem>,
    exits: Vec<Exit>,
    rooms: Vec<MapRoom>,
}

impl MergedLayers {
    fn absorb(&mut self, appearance: &Appearance) {
        if let Some(name) = &appearance.name {
            self.name.push_str(name);
        }
        self.render.extend(appearance.render.iter().cloned());
        for exit in &appearance.exits {
            match self.exits.iter_mut().find(|existing| existing.to == exit.to) {
                Some(existing) => *existing = exit.clone(),
                None => self.exits.push(exit.clone()),
            }
        }
        for room in &appearance.rooms {
            match self.rooms.iter_mut().find(|existing| existing.key == room.key) {
                Some(existing) => *existing = room.clone(),
                None => self.rooms.push(room.clone()),
            }
        }
    }
}

/// State of one render: the asset list and everything consulted so far.
struct RenderPass<'a> {
    ctx: &'a RequestContext,
    assets: Vec<String>,
    dependencies: BTreeSet<ObjectId>,
    objects: BTreeSet<ObjectId>,
}

impl<'a> RenderPass<'a> {
    /// Evaluate every condition; all must pass.
    async fn passes(&mut self, conditions: &[Condition]) -> CacheResult<bool> {
        let mut passed = true;
        for condition in conditions {
            let mapping = condition.mapping();
            self.dependencies.extend(mapping.values().cloned());
            let value = self
                .ctx
                .evaluator()
                .get(self.ctx.variables(), &condition.expression, &mapping)
                .await?;
            if is_truthy(&value) == condition.not {
                passed = false;
            }
        }
        Ok(passed)
    }

    async fn layers(&mut self, object: &ObjectId) -> CacheResult<MergedLayers> {
        self.objects.insert(object.clone());
        let across = self
            .ctx
            .appearances()
            .get_across_assets(object, &self.assets)
            .await?;

        let mut merged = MergedLayers::default();
        for (asset, layers) in &across {
            for appearance in layers.iter() {
                if self.passes(&appearance.conditions).await? {
                    trace!(%object, asset = %asset, "appearance passes");
                    merged.absorb(appearance);
                }
            }
        }
        Ok(merged)
    }

    /// Flatten `items`, resolving `If` gates and splicing bookmarks.
    ///
    /// `chain` holds the bookmarks currently being expanded.
    fn expand<'s>(
        &'s mut self,
        items: &'s [RenderItem],
        chain: &'s mut Vec<ObjectId>,
        out: &'s mut Vec<Piece>,
    ) -> LocalBoxFuture<'s, CacheResult<()>> {
        async move {
            for item in items {
                match item {
                    RenderItem::String {
                        value,
                        space_before,
                        space_after,
                    } => out.push(Piece::Text {
                        value: value.clone(),
                        space_before: *space_before,
                        space_after: *space_after,
                    }),
                    RenderItem::Link {
                        to,
                        text,
                        space_before,
                        space_after,
                    } => out.push(Piece::Link {
                        to: to.clone(),
                        text: text.clone(),
                        space_before: *space_before,
                        space_after: *space_after,
                    }),
                    RenderItem::LineBreak => out.push(Piece::LineBreak),
                    RenderItem::Bookmark { to } => {
                        if chain.contains(to) {
                            debug!(bookmark = %to, "circular bookmark");
                            out.push(Piece::Circular(to.clone()));
                            continue;
                        }
                        let merged = self.layers(to).await?;
                        chain.push(to.clone());
                        self.expand(&merged.render, chain, out).await?;
                        chain.pop();
                    }
                    RenderItem::If { conditions, contents } => {
                        if self.passes(conditions).await? {
                            self.expand(contents, chain, out).await?;
                        }
                    }
                }
            }
            Ok(())
        }
        .boxed_local()
    }
}

type RenderKey = (ObjectId, ObjectId);

/// Per-request cache of rendered descriptions keyed by (character, object).
#[derive(Debug)]
pub struct PerceptionRenderer {
    rendered: CoalescingCache<RenderKey, Arc<RenderedDescription>>,
}

impl Default for PerceptionRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl PerceptionRenderer {
    pub fn new() -> Self {
        Self {
            rendered: CoalescingCache::new("perceptions"),
        }
    }

    /// What `character` perceives of `object`.
    pub async fn get(
        &self,
        ctx: &RequestContext,
        character: &ObjectId,
        object: &ObjectId,
    ) -> CacheResult<Arc<RenderedDescription>> {
        character.expect_tag(&[Tag::Character])?;
        object.expect_tag(&PERCEIVABLE)?;

        let key = (character.clone(), object.clone());
        self.rendered
            .add([key.clone()], |keys| async move {
                let description = Arc::new(render(ctx, character, object).await?);
                Ok::<_, crate::error::CacheError>(
                    keys.into_iter()
                        .map(|key| (key, description.clone()))
                        .collect::<HashMap<_, _>>(),
                )
            })
            .await;
        self.rendered.get(&key).await
    }

    /// Evict every description whose conditions read `id`.
    pub fn invalidate_by_variable(&self, id: &ObjectId) -> Vec<RenderKey> {
        self.rendered
            .invalidate_where(|_, description| description.dependencies.contains(id))
    }

    /// Evict every description that merged appearances of `id`.
    pub fn invalidate_by_object(&self, id: &ObjectId) -> Vec<RenderKey> {
        self.rendered
            .invalidate_where(|_, description| description.objects.contains(id))
    }

    pub fn invalidate_character(&self, id: &ObjectId) -> Vec<RenderKey> {
        self.rendered
            .invalidate_where(|(character, _), _| character == id)
    }

    pub fn is_cached(&self, character: &ObjectId, object: &ObjectId) -> bool {
        self.rendered.is_cached(&(character.clone(), object.clone()))
    }

    pub fn len(&self) -> usize {
        self.rendered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rendered.is_empty()
    }

    pub fn clear(&self) {
        self.rendered.clear();
    }
}

async fn render(ctx: &RequestContext, character: &ObjectId, object: &ObjectId) -> CacheResult<RenderedDescription> {
    let record = ctx.characters().get(character).await?;
    let mut pass = RenderPass {
        ctx,
        assets: ctx.config().accessible_assets(&record.assets),
        dependencies: BTreeSet::new(),
        objects: BTreeSet::new(),
    };
    debug!(%character, %object, assets = pass.assets.len(), "rendering");

    let merged = pass.layers(object).await?;
    let mut pieces = Vec::new();
    let mut chain = vec![object.clone()];
    pass.expand(&merged.render, &mut chain, &mut pieces).await?;

    let mut rooms = Vec::new();
    if object.tag() == Tag::Map {
        let on_map: BTreeSet<ObjectId> = merged.rooms.iter().map(|entry| entry.room.clone()).collect();
        for entry in &merged.rooms {
            let room = pass.layers(&entry.room).await?;
            rooms.push(RenderedMapRoom {
                key: entry.key.clone(),
                room: entry.room.clone(),
                x: entry.x,
                y: entry.y,
                name: room.name,
                exits: room
                    .exits
                    .into_iter()
                    .filter(|exit| on_map.contains(&exit.to))
                    .collect(),
            });
        }
    }

    Ok(RenderedDescription {
        name: merged.name,
        render: merge::join(pieces),
        exits: merged.exits,
        rooms,
        dependencies: pass.dependencies,
        objects: pass.objects,
    })
}
