//! Headless console for the perception core.
//!
//! A simple line-oriented protocol:
//! - Lines starting with `#` are commands (look, set, invalidate, graph, ...)
//! - Any other line is an object id to look at
//!
//! Every line runs as its own request: a fresh `RequestContext` over the
//! shared store, dropped when the line has been answered.

use ephemera_core::{
    Direction, Error, MemoryStore, ObjectId, PerceptionConfig, RenderedDescription, RequestContext, Segment,
    Store, StoreKey, Tag, WorldFixture,
};
use serde_json::{json, Value};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Fixture used when `--world` is not given.
pub const DEFAULT_WORLD: &str = "ephemera/fixtures/tavern.json";

/// Console configuration from the command line.
#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    /// World fixture to load.
    pub world: PathBuf,
    /// Perceiving character; the fixture's first character when unset.
    pub character: Option<String>,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            world: PathBuf::from(DEFAULT_WORLD),
            character: None,
        }
    }
}

/// Parse console configuration from command line arguments.
pub fn parse_config_from_args(args: &[String]) -> HeadlessConfig {
    let mut config = HeadlessConfig::default();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--world" => {
                if let Some(path) = args.get(i + 1) {
                    config.world = PathBuf::from(path);
                    i += 1;
                }
            }
            "--character" => {
                if let Some(id) = args.get(i + 1) {
                    config.character = Some(id.clone());
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    config
}

/// Canon assets from the environment win over the fixture's.
fn perception_config(fixture: &WorldFixture) -> Result<PerceptionConfig, Error> {
    let from_env = PerceptionConfig::from_env()?;
    if from_env.canon_assets.is_empty() {
        Ok(fixture.config())
    } else {
        Ok(from_env)
    }
}

struct Console {
    store: Arc<MemoryStore>,
    config: PerceptionConfig,
    character: ObjectId,
    last_look: Option<ObjectId>,
}

impl Console {
    fn context(&self) -> RequestContext {
        let store: Arc<dyn Store> = self.store.clone();
        RequestContext::new(store, self.config.clone())
    }

    async fn look(&mut self, target: &str) {
        let object = match ObjectId::parse(target) {
            Ok(id) => id,
            Err(e) => {
                println!("[ERROR] {e}");
                return;
            }
        };

        let ctx = self.context();
        let before = self.store.stats().round_trips();
        let first = match ctx.perceive(&self.character, &object).await {
            Ok(description) => description,
            Err(e) => {
                println!("[ERROR] {e}");
                return;
            }
        };
        print_description(&first);

        let round_trips = self.store.stats().round_trips() - before;
        let evaluations = ctx.evaluator().evaluation_count();
        let reused = matches!(
            ctx.perceive(&self.character, &object).await,
            Ok(second) if Arc::ptr_eq(&first, &second)
        );
        println!("[CACHE] {round_trips} store round trips, {evaluations} evaluations, second look reused: {reused}");
        self.last_look = Some(object);
    }

    async fn set(&self, id: &str, raw: &str) {
        let id = match ObjectId::parse(id) {
            Ok(id) if id.tag() == Tag::Variable => id,
            Ok(id) => {
                println!("[ERROR] Only VARIABLE# ids can be written, got {id}");
                return;
            }
            Err(e) => {
                println!("[ERROR] {e}");
                return;
            }
        };
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                println!("[ERROR] Invalid JSON value: {e}");
                return;
            }
        };

        // Write first, then tell the caches, as any mutation collaborator must.
        // The context ends with this line; later lines see the store write.
        self.store
            .put_item(StoreKey::meta(id.clone()), json!({ "value": value.clone() }));
        let ctx = self.context();
        match ctx.set_variable(&id, value) {
            Ok(affected) => {
                let ids: Vec<String> = affected.iter().map(ToString::to_string).collect();
                println!("[SET] {id} written to the store; later lines read the new value");
                println!("[SET] ids affected in this request: {}", ids.join(", "));
            }
            Err(e) => println!("[ERROR] {e}"),
        }
    }

    async fn invalidate(&self, id: &str) {
        let id = match ObjectId::parse(id) {
            Ok(id) => id,
            Err(e) => {
                println!("[ERROR] {e}");
                return;
            }
        };
        let Some(target) = self.last_look.clone() else {
            println!("[ERROR] #look at something first");
            return;
        };

        let ctx = self.context();
        if let Err(e) = ctx.perceive(&self.character, &target).await {
            println!("[ERROR] {e}");
            return;
        }
        let evaluations = ctx.evaluator().evaluation_count();

        let tag = id.tag();
        if tag.is_state() {
            let cleared = ctx.invalidate_variable(&id);
            println!("[INVALIDATED] {} state ids", cleared.len());
        } else if tag == Tag::Character {
            ctx.invalidate_character(&id);
            println!("[INVALIDATED] character {id}");
        } else if tag.has_appearances() {
            let assets = ctx.invalidate_object(&id);
            println!("[INVALIDATED] {id} in assets: {}", assets.join(", "));
        } else {
            println!("[ERROR] Nothing caches {id}");
            return;
        }

        let evicted = !ctx.renderer().is_cached(&self.character, &target);
        println!("[CACHE] render of {target} evicted: {evicted}");
        match ctx.perceive(&self.character, &target).await {
            Ok(description) => {
                print_description(&description);
                println!(
                    "[CACHE] {} evaluations re-run",
                    ctx.evaluator().evaluation_count() - evaluations
                );
            }
            Err(e) => println!("[ERROR] {e}"),
        }
    }

    async fn graph(&self, direction: &str, id: &str) {
        let direction = match direction {
            "ancestry" => Direction::Ancestry,
            "descent" => Direction::Descent,
            other => {
                println!("[ERROR] Unknown direction {other:?}; use ancestry or descent");
                return;
            }
        };
        let id = match ObjectId::parse(id) {
            Ok(id) => id,
            Err(e) => {
                println!("[ERROR] {e}");
                return;
            }
        };

        let ctx = self.context();
        match ctx.graphs().get(direction, &id).await {
            Ok(tree) => {
                println!("[GRAPH] {direction} of {id}");
                for node in &tree.nodes {
                    println!("  {} ({:?})", node.id, node.completeness);
                    for edge in &node.connections {
                        let key = edge.key.as_deref().map(|k| format!(" [{k}]")).unwrap_or_default();
                        println!("    -> {}{key} via {}", edge.target, edge.assets.join(", "));
                    }
                }
            }
            Err(e) => println!("[ERROR] {e}"),
        }
    }

    fn stats(&self) {
        let stats = self.store.stats();
        println!("[STATS]");
        println!("  Character: {}", self.character);
        println!("  Canon assets: {}", self.config.canon_assets.join(", "));
        println!("  get_item calls: {}", stats.get_item_calls());
        println!("  batch_get_item calls: {}", stats.batch_calls());
        println!("  Round trips: {}", stats.round_trips());
    }
}

fn print_description(description: &RenderedDescription) {
    println!("[SEEN] {}", description.name);
    let mut line = String::new();
    for segment in &description.render {
        match segment {
            Segment::Text { value } => line.push_str(value),
            Segment::Link { to, text } => line.push_str(&format!("[{text}]({to})")),
            Segment::LineBreak => {
                println!("  {line}");
                line.clear();
            }
            Segment::CircularReference { to } => line.push_str(&format!("<circular {to}>")),
        }
    }
    if !line.is_empty() {
        println!("  {line}");
    }
    for exit in &description.exits {
        println!("  exit {} -> {}", exit.name, exit.to);
    }
    for room in &description.rooms {
        println!("  room {} at ({}, {}): {} = {}", room.key, room.x, room.y, room.room, room.name);
        for exit in &room.exits {
            println!("    exit {} -> {}", exit.name, exit.to);
        }
    }
    if !description.dependencies.is_empty() {
        let ids: Vec<&str> = description.dependencies.iter().map(|id| id.as_str()).collect();
        println!("  depends on: {}", ids.join(", "));
    }
}

fn print_commands() {
    println!("  #look <ID>                   - Perceive an object (bare ids work too)");
    println!("  #set <VARIABLE#id> <json>    - Write a variable and notify the caches");
    println!("  #invalidate <ID>             - Invalidate an id around the last look");
    println!("  #graph <ancestry|descent> <ID> - Show a dependency tree");
    println!("  #stats                       - Show store call counters");
    println!("  #help                        - Show this help");
    println!("  #quit                        - Exit");
}

/// Run the console until EOF or `#quit`.
pub async fn run_headless(config: HeadlessConfig) -> Result<(), Error> {
    let fixture = WorldFixture::load(&config.world).await?;
    let perception = perception_config(&fixture)?;
    let character = match &config.character {
        Some(id) => ObjectId::parse(id)?,
        None => fixture
            .characters
            .keys()
            .next()
            .cloned()
            .ok_or_else(|| Error::Config("fixture has no characters".to_string()))?,
    };
    let store = Arc::new(fixture.into_store()?);
    info!(world = %config.world.display(), %character, "world loaded");

    let mut console = Console {
        store,
        config: perception,
        character,
        last_look: None,
    };

    println!("=== Ephemera Headless Mode ===");
    println!("World: {}", config.world.display());
    println!("Character: {}", console.character);
    println!();
    println!("Commands:");
    print_commands();
    println!();

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                eprintln!("Error reading input: {e}");
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some(command) = line.strip_prefix('#') else {
            console.look(line).await;
            stdout.flush().ok();
            continue;
        };

        let parts: Vec<&str> = command.split_whitespace().collect();
        match parts.as_slice() {
            ["quit"] | ["exit"] => {
                println!("Goodbye!");
                break;
            }
            ["look", target] => console.look(target).await,
            ["set", id, raw @ ..] if !raw.is_empty() => console.set(id, &raw.join(" ")).await,
            ["invalidate", id] => console.invalidate(id).await,
            ["graph", direction, id] => console.graph(direction, id).await,
            ["stats"] => console.stats(),
            ["help"] => {
                println!("[HELP]");
                print_commands();
            }
            _ => println!("[ERROR] Unknown command. Type #help for help."),
        }
        stdout.flush().ok();
    }

    Ok(())
}
