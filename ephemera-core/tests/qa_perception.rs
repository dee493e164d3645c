//! QA tests for perception rendering.
//!
//! These tests verify what a character sees of rooms, features, maps and
//! bookmarks:
//! - Layer ordering across canon and personal assets
//! - Condition gating, including negated conditions and `If` items
//! - Bookmark splicing and cycle markers
//! - Map aggregation
//! - Coalescing of concurrent renders

use ephemera_core::testing::{condition, oid, TestHarness, TestWorld};
use ephemera_core::{
    Appearance, CacheError, Exit, IdError, RenderItem, Segment, StoreKey,
};
use ephemera_core::store::Category;
use serde_json::json;
use std::sync::Arc;

const TESTER: &str = "CHARACTER#tester";

fn world() -> TestWorld {
    TestWorld::new()
        .canon_asset("base")
        .character(TESTER, "Tester", &["personal"])
}

fn build(world: TestWorld) -> TestHarness {
    world.build().expect("world should build")
}

// =============================================================================
// LAYER ORDERING AND GATING
// =============================================================================

#[tokio::test]
async fn test_canon_then_personal_room() {
    let harness = build(
        world()
            .variable("VARIABLE#testOne", json!(true))
            .variable("VARIABLE#testTwo", json!(false))
            .variable("VARIABLE#testThree", json!(false))
            .variable("VARIABLE#testFour", json!(true))
            .appearance(
                "ROOM#test",
                "base",
                Appearance::new()
                    .with_condition(condition("testOne", &[("testOne", "VARIABLE#testOne")]))
                    .with_name("Test")
                    .with_text("First"),
            )
            .appearance(
                "ROOM#test",
                "base",
                Appearance::new()
                    .with_condition(condition("testTwo", &[("testTwo", "VARIABLE#testTwo")]))
                    .with_name("Wrong")
                    .with_text("Nope"),
            )
            .appearance(
                "ROOM#test",
                "personal",
                Appearance::new()
                    .with_condition(condition("testThree", &[("testThree", "VARIABLE#testThree")]))
                    .with_name("Bad")
                    .with_text("Bad"),
            )
            .appearance(
                "ROOM#test",
                "personal",
                Appearance::new()
                    .with_condition(condition("testFour", &[("testFour", "VARIABLE#testFour")]))
                    .with_name("Room")
                    .with_text("Second"),
            ),
    );
    let ctx = harness.context();

    let seen = ctx.perceive(&oid(TESTER), &oid("ROOM#test")).await.unwrap();
    assert_eq!(seen.name, "TestRoom");
    assert_eq!(seen.render, vec![Segment::text("FirstSecond")]);

    // Failing conditions still count as dependencies.
    let dependencies: Vec<&str> = seen.dependencies.iter().map(|id| id.as_str()).collect();
    assert_eq!(
        dependencies,
        vec![
            "VARIABLE#testFour",
            "VARIABLE#testOne",
            "VARIABLE#testThree",
            "VARIABLE#testTwo"
        ]
    );
}

#[tokio::test]
async fn test_layer_order_is_canon_first() {
    let harness = build(
        world()
            .appearance("FEATURE#sign", "personal", Appearance::new().with_name("B"))
            .appearance("FEATURE#sign", "base", Appearance::new().with_name("A")),
    );
    let ctx = harness.context();
    let seen = ctx.perceive(&oid(TESTER), &oid("FEATURE#sign")).await.unwrap();
    assert_eq!(seen.name, "AB");
}

#[tokio::test]
async fn test_negated_condition() {
    let harness = build(
        world()
            .variable("VARIABLE#lamp", json!(false))
            .appearance(
                "ROOM#cellar",
                "base",
                Appearance::new()
                    .with_condition(condition("lamp", &[("lamp", "VARIABLE#lamp")]).negated())
                    .with_text("Pitch black."),
            )
            .appearance(
                "ROOM#cellar",
                "base",
                Appearance::new()
                    .with_condition(condition("lamp", &[("lamp", "VARIABLE#lamp")]))
                    .with_text("Dusty shelves."),
            ),
    );
    let ctx = harness.context();
    assert_eq!(harness.look(&ctx, TESTER, "ROOM#cellar").await, "Pitch black.");
}

#[tokio::test]
async fn test_all_conditions_must_pass() {
    let harness = build(
        world()
            .variable("VARIABLE#a", json!(true))
            .variable("VARIABLE#b", json!(0))
            .appearance(
                "ROOM#gate",
                "base",
                Appearance::new()
                    .with_condition(condition("a", &[("a", "VARIABLE#a")]))
                    .with_condition(condition("b", &[("b", "VARIABLE#b")]))
                    .with_text("Open"),
            ),
    );
    let ctx = harness.context();
    let seen = ctx.perceive(&oid(TESTER), &oid("ROOM#gate")).await.unwrap();
    assert!(seen.render.is_empty());
    assert_eq!(seen.dependencies.len(), 2);
}

#[tokio::test]
async fn test_if_items_and_spacing() {
    let harness = build(
        world()
            .variable("VARIABLE#coins", json!(5))
            .appearance(
                "ROOM#shop",
                "base",
                Appearance::new()
                    .with_item(RenderItem::String {
                        value: "A small shop.".to_string(),
                        space_before: false,
                        space_after: true,
                    })
                    .with_item(RenderItem::If {
                        conditions: vec![condition("coins >= 3", &[("coins", "VARIABLE#coins")])],
                        contents: vec![RenderItem::text("The keeper smiles.")],
                    })
                    .with_item(RenderItem::If {
                        conditions: vec![condition("coins > 10", &[("coins", "VARIABLE#coins")])],
                        contents: vec![RenderItem::text("The keeper bows.")],
                    })
                    .with_item(RenderItem::LineBreak)
                    .with_item(RenderItem::Link {
                        to: oid("FEATURE#counter"),
                        text: "counter".to_string(),
                        space_before: false,
                        space_after: false,
                    }),
            ),
    );
    let ctx = harness.context();
    let seen = ctx.perceive(&oid(TESTER), &oid("ROOM#shop")).await.unwrap();
    assert_eq!(
        seen.render,
        vec![
            Segment::text("A small shop. The keeper smiles."),
            Segment::LineBreak,
            Segment::Link {
                to: oid("FEATURE#counter"),
                text: "counter".to_string(),
            },
        ]
    );
    assert!(seen.dependencies.contains(&oid("VARIABLE#coins")));
}

#[tokio::test]
async fn test_later_exit_replaces_earlier() {
    let harness = build(
        world()
            .appearance(
                "ROOM#hall",
                "base",
                Appearance::new()
                    .with_exit(oid("ROOM#yard"), "north")
                    .with_exit(oid("ROOM#cellar"), "down"),
            )
            .appearance(
                "ROOM#hall",
                "personal",
                Appearance::new().with_exit(oid("ROOM#yard"), "garden path"),
            ),
    );
    let ctx = harness.context();
    let seen = ctx.perceive(&oid(TESTER), &oid("ROOM#hall")).await.unwrap();
    assert_eq!(
        seen.exits,
        vec![
            Exit {
                to: oid("ROOM#yard"),
                name: "garden path".to_string()
            },
            Exit {
                to: oid("ROOM#cellar"),
                name: "down".to_string()
            },
        ]
    );
}

// =============================================================================
// BOOKMARKS
// =============================================================================

#[tokio::test]
async fn test_bookmark_spliced_in_place() {
    let harness = build(
        world()
            .appearance(
                "ROOM#library",
                "base",
                Appearance::new()
                    .with_text("Shelves. ")
                    .with_item(RenderItem::Bookmark {
                        to: oid("BOOKMARK#motto"),
                    })
                    .with_text(" The end."),
            )
            .appearance("BOOKMARK#motto", "base", Appearance::new().with_text("Read more.")),
    );
    let ctx = harness.context();
    let seen = ctx.perceive(&oid(TESTER), &oid("ROOM#library")).await.unwrap();
    assert_eq!(seen.render, vec![Segment::text("Shelves. Read more. The end.")]);
    assert!(seen.objects.contains(&oid("BOOKMARK#motto")));
}

#[tokio::test]
async fn test_bookmark_cycle_emits_marker() {
    let harness = build(
        world()
            .appearance(
                "ROOM#loop",
                "base",
                Appearance::new().with_item(RenderItem::Bookmark {
                    to: oid("BOOKMARK#a"),
                }),
            )
            .appearance(
                "BOOKMARK#a",
                "base",
                Appearance::new()
                    .with_text("a[")
                    .with_item(RenderItem::Bookmark {
                        to: oid("BOOKMARK#b"),
                    })
                    .with_text("]"),
            )
            .appearance(
                "BOOKMARK#b",
                "base",
                Appearance::new().with_text("b").with_item(RenderItem::Bookmark {
                    to: oid("BOOKMARK#a"),
                }),
            ),
    );
    let ctx = harness.context();
    let seen = ctx.perceive(&oid(TESTER), &oid("ROOM#loop")).await.unwrap();
    assert_eq!(
        seen.render,
        vec![
            Segment::text("a[b"),
            Segment::CircularReference {
                to: oid("BOOKMARK#a")
            },
            Segment::text("]"),
        ]
    );
}

#[tokio::test]
async fn test_self_referencing_bookmark() {
    let harness = build(world().appearance(
        "BOOKMARK#echo",
        "base",
        Appearance::new().with_text("echo ").with_item(RenderItem::Bookmark {
            to: oid("BOOKMARK#echo"),
        }),
    ));
    let ctx = harness.context();
    let text = harness.look(&ctx, TESTER, "BOOKMARK#echo").await;
    assert_eq!(text, "echo [circular BOOKMARK#echo]");
}

// =============================================================================
// MAPS
// =============================================================================

#[tokio::test]
async fn test_map_aggregates_rooms() {
    let harness = build(
        world()
            .appearance(
                "MAP#town",
                "base",
                Appearance::new()
                    .with_name("Town")
                    .with_room("hall", oid("ROOM#hall"), 0, 0)
                    .with_room("yard", oid("ROOM#yard"), 1, 0),
            )
            .appearance(
                "MAP#town",
                "personal",
                Appearance::new().with_room("yard", oid("ROOM#garden"), 2, 0),
            )
            .appearance(
                "ROOM#hall",
                "base",
                Appearance::new()
                    .with_name("Hall")
                    .with_exit(oid("ROOM#garden"), "out")
                    .with_exit(oid("ROOM#cellar"), "down"),
            )
            .appearance("ROOM#garden", "base", Appearance::new().with_name("Garden")),
    );
    let ctx = harness.context();
    let seen = ctx.perceive(&oid(TESTER), &oid("MAP#town")).await.unwrap();

    assert_eq!(seen.name, "Town");
    assert_eq!(seen.rooms.len(), 2);

    let hall = &seen.rooms[0];
    assert_eq!(hall.name, "Hall");
    assert_eq!(
        hall.exits,
        vec![Exit {
            to: oid("ROOM#garden"),
            name: "out".to_string()
        }]
    );

    let yard = &seen.rooms[1];
    assert_eq!(yard.key, "yard");
    assert_eq!(yard.room, oid("ROOM#garden"));
    assert_eq!((yard.x, yard.y), (2, 0));
    assert_eq!(yard.name, "Garden");

    for id in ["MAP#town", "ROOM#hall", "ROOM#garden"] {
        assert!(seen.objects.contains(&oid(id)), "{id} should be recorded");
    }
    assert!(!seen.objects.contains(&oid("ROOM#yard")));
}

// =============================================================================
// FAILURES AND COALESCING
// =============================================================================

#[tokio::test]
async fn test_concurrent_renders_share_one_pass() {
    let harness = build(world().appearance("ROOM#hall", "base", Appearance::new().with_text("Hall")));
    let ctx = harness.context();
    let (character, room) = (oid(TESTER), oid("ROOM#hall"));

    let (first, second) = tokio::join!(ctx.perceive(&character, &room), ctx.perceive(&character, &room));
    assert!(Arc::ptr_eq(&first.unwrap(), &second.unwrap()));
    // One character read, one appearance read.
    assert_eq!(harness.store.stats().get_item_calls(), 1);
    assert_eq!(harness.store.stats().batch_calls(), 1);
}

#[tokio::test]
async fn test_illegal_targets() {
    let harness = build(world());
    let ctx = harness.context();

    let err = ctx.perceive(&oid(TESTER), &oid("VARIABLE#lamp")).await.unwrap_err();
    assert!(matches!(err, CacheError::Id(IdError::IllegalTag(_))));

    let err = ctx.perceive(&oid("ROOM#hall"), &oid("ROOM#hall")).await.unwrap_err();
    assert!(matches!(err, CacheError::Id(IdError::IllegalTag(_))));
}

#[tokio::test]
async fn test_unknown_character_is_fatal() {
    let harness = build(world());
    let ctx = harness.context();
    let err = ctx
        .perceive(&oid("CHARACTER#ghost"), &oid("ROOM#hall"))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::MissingRequiredKey { .. }));
}

#[tokio::test]
async fn test_store_failure_propagates() {
    let harness = build(world().appearance("ROOM#hall", "base", Appearance::new().with_text("Hall")));
    harness
        .store
        .fail_key(StoreKey::new(oid("ROOM#hall"), Category::Asset("base".to_string())));
    let ctx = harness.context();
    let err = ctx.perceive(&oid(TESTER), &oid("ROOM#hall")).await.unwrap_err();
    assert!(matches!(err, CacheError::Store(_)));
}

#[tokio::test]
async fn test_override_masks_failing_variable() {
    let harness = build(
        world().appearance(
            "ROOM#hall",
            "base",
            Appearance::new()
                .with_condition(condition("lamp", &[("lamp", "VARIABLE#lamp")]))
                .with_text("Lit"),
        ),
    );
    harness.store.fail_key(StoreKey::meta(oid("VARIABLE#lamp")));
    let ctx = harness.context();
    ctx.set_variable(&oid("VARIABLE#lamp"), json!(true)).unwrap();
    assert_eq!(harness.look(&ctx, TESTER, "ROOM#hall").await, "Lit");
}
