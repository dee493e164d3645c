//! Perception and state-resolution core for a layered text world.
//!
//! This crate provides:
//! - Request-coalescing caches over a batched key/value store
//! - Memoized variable, computed-value and expression evaluation
//! - Ancestry/descent dependency graphs with partial-knowledge tracking
//! - The perception renderer: what a character currently sees of an object
//!
//! All state lives in a [`RequestContext`], created per request and dropped
//! at its end.
//!
//! # Quick Start
//!
//! ```ignore
//! use ephemera_core::{ObjectId, RequestContext, WorldFixture};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let fixture = WorldFixture::load("world.json").await?;
//!     let config = fixture.config();
//!     let store = Arc::new(fixture.into_store()?);
//!
//!     let ctx = RequestContext::new(store, config);
//!     let seen = ctx
//!         .perceive(&ObjectId::parse("CHARACTER#tess")?, &ObjectId::parse("ROOM#hall")?)
//!         .await?;
//!     println!("{}: {}", seen.name, seen.plain_text());
//!     Ok(())
//! }
//! ```

pub mod appearance;
pub mod character;
pub mod coalesce;
pub mod config;
pub mod context;
pub mod deferred;
pub mod error;
pub mod expression;
pub mod fixture;
pub mod graph;
pub mod id;
pub mod render;
pub mod store;
pub mod testing;
pub mod variables;

pub use appearance::{Appearance, AppearanceCache, Condition, Exit, MapRoom, RenderItem};
pub use character::{CharacterCache, CharacterRecord};
pub use coalesce::CoalescingCache;
pub use config::PerceptionConfig;
pub use context::RequestContext;
pub use deferred::Deferred;
pub use error::{CacheError, CacheResult, Error, Result};
pub use expression::{ExpressionError, ExpressionEvaluator};
pub use fixture::WorldFixture;
pub use graph::{Completeness, DependencyGraphs, DependencyTree, Direction, GraphEdge, GraphNode};
pub use id::{IdError, ObjectId, Tag};
pub use render::{PerceptionRenderer, RenderedDescription, Segment};
pub use store::{Category, MemoryStore, Store, StoreError, StoreKey};
pub use variables::{Dependency, VariableStateCache};
