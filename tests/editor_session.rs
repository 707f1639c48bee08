use std::sync::Arc;

use image::{Rgba, RgbaImage};
use terrapaint::cache::{LocalCache, MemoryBackend};
use terrapaint::canvas::HexColor;
use terrapaint::clock::ManualClock;
use terrapaint::components::tools::{InputEvent, Interaction, Key, Modifiers, PointerButton, Tool};
use terrapaint::editor::{EditorError, EditorEvent, SaveStatus, SurfaceSize, TerritoryEditor};
use terrapaint::geometry::RegionGeometry;
use terrapaint::settings::EditorSettings;
use terrapaint::sync::memory::{MemoryPixelService, MemoryTerritoryService, StaticActor};
use terrapaint::sync::remote::Territory;
use terrapaint::sync::{CommitMode, CommitOutcome, SyncEngine, SyncError, SyncOptions};
use terrapaint::view::{Point, Rect};

const RED: HexColor = HexColor([255, 0, 0]);

struct Harness {
    clock: Arc<ManualClock>,
    territories: Arc<MemoryTerritoryService>,
    pixels: Arc<MemoryPixelService>,
    cache: Arc<LocalCache>,
    engine: Arc<SyncEngine>,
    settings: EditorSettings,
}

impl Harness {
    fn new() -> Self {
        let settings = EditorSettings {
            grid_size: 10,
            retry_backoff_ms: 1,
            ..EditorSettings::default()
        };
        let clock = Arc::new(ManualClock::new(1_000));
        let territories = Arc::new(MemoryTerritoryService::new());
        territories.insert(Territory {
            id: "plot".into(),
            owner_id: Some("ana".into()),
            geometry: RegionGeometry::Polygon(vec![vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0], [0.0, 0.0]]]),
            bounds: None,
        });
        let pixels = Arc::new(MemoryPixelService::new(clock.clone(), 10));
        let cache = Arc::new(LocalCache::new(Arc::new(MemoryBackend::ready()), clock.clone(), &settings));
        let engine = Arc::new(SyncEngine::new(
            territories.clone(),
            pixels.clone(),
            Arc::new(StaticActor::new("ana", "Ana")),
            cache.clone(),
            clock.clone(),
            SyncOptions::from(&settings),
        ));
        Self {
            clock,
            territories,
            pixels,
            cache,
            engine,
            settings,
        }
    }

    async fn open(&self) -> TerritoryEditor {
        let mut editor = TerritoryEditor::new(self.settings.clone(), self.engine.clone(), self.clock.clone());
        editor
            .initialize("plot", SurfaceSize::new(120.0, 120.0, 1.0), None)
            .await
            .unwrap();
        editor.drain_events();
        editor
    }
}

/// Screen position of the centre of cell (x, y) under the current view.
fn cell_pos(editor: &TerritoryEditor, x: i64, y: i64) -> Point {
    editor
        .view()
        .unwrap()
        .world_to_screen(Point::new(x as f64 + 0.5, y as f64 + 0.5))
}

fn click(editor: &mut TerritoryEditor, x: i64, y: i64) {
    let pos = cell_pos(editor, x, y);
    editor.handle_input(InputEvent::PointerDown {
        pos,
        button: PointerButton::Primary,
    });
    editor.handle_input(InputEvent::PointerUp { pos });
}

fn key(editor: &mut TerritoryEditor, key: Key, ctrl: bool, shift: bool) {
    editor.handle_input(InputEvent::KeyDown {
        key,
        modifiers: Modifiers { ctrl, shift },
    });
}

fn statuses(events: &[EditorEvent]) -> Vec<SaveStatus> {
    events
        .iter()
        .filter_map(|e| match e {
            EditorEvent::SaveStatus(s) => Some(s.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn opening_fits_the_whole_territory() {
    let h = Harness::new();
    let editor = h.open().await;
    assert!(editor.is_open());
    assert_eq!(editor.territory_id(), Some("plot"));
    assert_eq!(editor.mask().unwrap().count(), 100);
    // 120px viewport, 10% padding each side, 10 cells
    assert!((editor.zoom_level() - 9.6).abs() < 1e-9);
    assert_eq!(editor.calculate_value(), 0);
}

#[tokio::test]
async fn click_paints_and_history_round_trips() {
    let h = Harness::new();
    let mut editor = h.open().await;
    editor.set_color(RED);

    click(&mut editor, 2, 3);
    assert_eq!(editor.store().unwrap().color_at(2, 3), Some(RED));
    assert!(editor.has_unsaved_changes());
    assert!(editor.save_pending());

    key(&mut editor, Key::Char('z'), true, false);
    assert_eq!(editor.calculate_value(), 0);
    assert!(editor.can_redo());

    key(&mut editor, Key::Char('z'), true, true);
    assert_eq!(editor.calculate_value(), 1);

    key(&mut editor, Key::Char('z'), true, false);
    key(&mut editor, Key::Char('y'), true, false);
    assert_eq!(editor.store().unwrap().color_at(2, 3), Some(RED));
}

#[tokio::test]
async fn fast_stroke_leaves_no_gaps() {
    let h = Harness::new();
    let mut editor = h.open().await;

    let start = cell_pos(&editor, 0, 4);
    let end = cell_pos(&editor, 6, 4);
    editor.handle_input(InputEvent::PointerDown {
        pos: start,
        button: PointerButton::Primary,
    });
    assert!(matches!(editor.interaction(), Interaction::Painting { .. }));
    editor.handle_input(InputEvent::PointerMove { pos: end });
    editor.handle_input(InputEvent::PointerUp { pos: end });

    assert_eq!(editor.calculate_value(), 7);
    assert!(editor.interaction().is_idle());
    // the whole stroke is one undo step
    assert!(editor.undo());
    assert_eq!(editor.calculate_value(), 0);
}

#[tokio::test]
async fn painting_outside_the_mask_is_ignored() {
    let h = Harness::new();
    let mut editor = h.open().await;
    let outside = cell_pos(&editor, -1, 0);
    editor.handle_input(InputEvent::PointerDown {
        pos: outside,
        button: PointerButton::Primary,
    });
    editor.handle_input(InputEvent::PointerUp { pos: outside });
    assert_eq!(editor.calculate_value(), 0);
    assert!(!editor.save_pending());
}

#[tokio::test]
async fn stray_click_after_undo_keeps_redo() {
    let h = Harness::new();
    let mut editor = h.open().await;
    editor.set_color(RED);
    assert!(!editor.can_undo());

    click(&mut editor, 4, 4);
    assert!(editor.can_undo());
    assert!(editor.undo());
    assert!(!editor.can_undo());

    click(&mut editor, -1, 0);
    assert!(editor.can_redo());
    assert!(editor.redo());
    assert_eq!(editor.store().unwrap().color_at(4, 4), Some(RED));
}

#[tokio::test]
async fn keyboard_shortcuts() {
    let h = Harness::new();
    let mut editor = h.open().await;
    let fitted = editor.zoom_level();

    key(&mut editor, Key::Char('e'), false, false);
    assert_eq!(editor.active_tool(), Tool::Eraser);
    key(&mut editor, Key::Char('F'), false, false);
    assert_eq!(editor.active_tool(), Tool::Fill);

    key(&mut editor, Key::Plus, false, false);
    assert!(editor.zoom_level() > fitted);
    key(&mut editor, Key::Char('0'), false, false);
    assert!((editor.zoom_level() - fitted).abs() < 1e-9);
    key(&mut editor, Key::Char('-'), false, false);
    assert!(editor.zoom_level() < fitted);

    let events = editor.drain_events();
    assert!(events.contains(&EditorEvent::ToolChanged(Tool::Eraser)));
    assert!(events.iter().filter(|e| matches!(e, EditorEvent::ZoomChanged(_))).count() >= 3);
}

#[tokio::test]
async fn fill_then_eyedropper_picks_the_color() {
    let h = Harness::new();
    let mut editor = h.open().await;
    editor.set_color(RED);
    editor.set_tool(Tool::Fill);
    click(&mut editor, 5, 5);
    assert_eq!(editor.calculate_value(), 100);

    editor.set_color(HexColor::WHITE);
    editor.set_tool(Tool::Eyedropper);
    click(&mut editor, 0, 0);
    assert_eq!(editor.active_color(), RED);
}

#[tokio::test]
async fn wheel_zoom_keeps_the_cell_under_the_cursor() {
    let h = Harness::new();
    let mut editor = h.open().await;
    let pos = cell_pos(&editor, 7, 2);
    let before = editor.view().unwrap().screen_to_world(pos);
    editor.handle_input(InputEvent::Wheel { pos, delta_y: -1.0 });
    let after = editor.view().unwrap().screen_to_world(pos);
    assert!((before.x - after.x).abs() < 1e-9);
    assert!((before.y - after.y).abs() < 1e-9);
    assert!(editor.zoom_level() > 9.6);
}

#[tokio::test]
async fn pan_tool_drags_the_view() {
    let h = Harness::new();
    let mut editor = h.open().await;
    key(&mut editor, Key::Char('h'), false, false);
    let tx = editor.view().unwrap().translate_x;
    editor.handle_input(InputEvent::PointerDown {
        pos: Point::new(50.0, 50.0),
        button: PointerButton::Primary,
    });
    editor.handle_input(InputEvent::PointerMove {
        pos: Point::new(70.0, 50.0),
    });
    editor.handle_input(InputEvent::PointerUp {
        pos: Point::new(70.0, 50.0),
    });
    assert!((editor.view().unwrap().translate_x - (tx + 20.0)).abs() < 1e-9);
    assert_eq!(editor.calculate_value(), 0);
}

#[tokio::test]
async fn stamp_writes_opaque_samples_as_one_edit() {
    let h = Harness::new();
    let mut editor = h.open().await;

    let mut img = RgbaImage::new(2, 2);
    img.put_pixel(0, 0, Rgba([255, 0, 0, 255]));
    img.put_pixel(1, 0, Rgba([0, 255, 0, 255]));
    img.put_pixel(0, 1, Rgba([0, 0, 255, 255]));
    img.put_pixel(1, 1, Rgba([0, 0, 0, 0]));
    editor.load_stamp_image(img).unwrap();
    assert_eq!(editor.active_tool(), Tool::Stamp);

    editor.set_stamp_rect(Rect::new(4.0, 4.0, 2.0, 2.0));
    assert_eq!(editor.stamp_rect(), Some(Rect::new(4.0, 4.0, 2.0, 2.0)));
    key(&mut editor, Key::Enter, false, false);

    assert_eq!(editor.calculate_value(), 3);
    assert_eq!(editor.store().unwrap().color_at(5, 4), Some(HexColor([0, 255, 0])));
    assert_eq!(editor.store().unwrap().color_at(5, 5), None);
    assert_eq!(editor.active_tool(), Tool::Brush);
    assert_eq!(editor.stamp_rect(), None);

    assert!(editor.undo());
    assert_eq!(editor.calculate_value(), 0);
}

#[tokio::test]
async fn escape_cancels_the_stamp() {
    let h = Harness::new();
    let mut editor = h.open().await;
    editor.load_stamp_image(RgbaImage::from_pixel(3, 3, Rgba([1, 2, 3, 255]))).unwrap();
    key(&mut editor, Key::Escape, false, false);
    assert_eq!(editor.stamp_rect(), None);
    assert_eq!(editor.active_tool(), Tool::Brush);
    assert_eq!(editor.apply_stamp(), 0);
}

#[tokio::test]
async fn save_waits_for_the_debounce() {
    let h = Harness::new();
    let mut editor = h.open().await;
    click(&mut editor, 1, 1);

    editor.tick().await;
    h.clock.advance(1_999);
    editor.tick().await;
    assert!(h.pixels.payloads().is_empty());

    h.clock.advance(1);
    editor.tick().await;
    let payloads = h.pixels.payloads();
    assert_eq!(payloads.len(), 1);
    assert!(!payloads[0].is_delta);
    assert!(!editor.has_unsaved_changes());
    assert!(!editor.save_pending());
    assert_eq!(h.territories.metadata("plot").unwrap().painted_cells, 1);

    let statuses = statuses(&editor.drain_events());
    assert_eq!(statuses, vec![SaveStatus::Pending, SaveStatus::Saving, SaveStatus::Saved]);
}

#[tokio::test]
async fn edits_push_the_deadline_back() {
    let h = Harness::new();
    let mut editor = h.open().await;
    click(&mut editor, 1, 1);
    h.clock.advance(1_500);
    click(&mut editor, 2, 1);
    h.clock.advance(1_500);
    editor.tick().await;
    assert!(h.pixels.payloads().is_empty());
    h.clock.advance(500);
    editor.tick().await;
    assert_eq!(h.pixels.payloads().len(), 1);
}

#[tokio::test]
async fn second_save_goes_as_delta() {
    let h = Harness::new();
    let mut editor = h.open().await;
    click(&mut editor, 1, 1);
    editor.save_now().await.unwrap();

    h.clock.advance(10);
    click(&mut editor, 2, 2);
    let outcome = editor.save_now().await.unwrap();
    let CommitOutcome::Committed(report) = outcome else {
        panic!("commit was deferred");
    };
    assert_eq!(report.mode, CommitMode::Delta);
    let delta = h.pixels.pending_delta("plot").unwrap();
    assert_eq!(delta.len(), 1);
    assert_eq!(delta[0].key(), (2, 2));
}

#[tokio::test]
async fn ownership_change_aborts_the_save() {
    let h = Harness::new();
    let mut editor = h.open().await;
    click(&mut editor, 1, 1);
    h.territories.set_owner("plot", Some("someone-else"));

    let err = editor.save_now().await.unwrap_err();
    assert!(matches!(
        err,
        EditorError::Sync(SyncError::OwnershipChanged { .. })
    ));
    assert!(h.pixels.payloads().is_empty());
    assert!(editor.has_unsaved_changes());
    let statuses = statuses(&editor.drain_events());
    assert!(matches!(statuses.last(), Some(SaveStatus::Error(_))));
}

#[tokio::test]
async fn signed_out_user_cannot_open() {
    let h = Harness::new();
    let engine = Arc::new(SyncEngine::new(
        h.territories.clone(),
        h.pixels.clone(),
        Arc::new(StaticActor::anonymous()),
        h.cache.clone(),
        h.clock.clone(),
        SyncOptions::from(&h.settings),
    ));
    let mut editor = TerritoryEditor::new(h.settings.clone(), engine, h.clock.clone());
    let err = editor
        .initialize("plot", SurfaceSize::new(100.0, 100.0, 1.0), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EditorError::Sync(SyncError::NotAuthenticated)));
    assert!(!editor.is_open());
}

#[tokio::test]
async fn unsaved_session_is_offered_back() {
    let h = Harness::new();
    let mut editor = h.open().await;
    editor.set_color(RED);
    click(&mut editor, 3, 3);
    // writes the session snapshot; the save is not due yet
    editor.tick().await;
    editor.cleanup();
    assert!(h.cache.load_session("plot").await.is_some());

    let mut editor = h.open().await;
    assert_eq!(editor.calculate_value(), 0);
    let offer = editor.recovery_offer().unwrap();
    assert_eq!(offer.snapshot.pixels.len(), 1);

    assert!(editor.accept_recovery());
    assert_eq!(editor.store().unwrap().color_at(3, 3), Some(RED));
    assert!(editor.has_unsaved_changes());
    assert!(editor.recovery_offer().is_none());
}

#[tokio::test]
async fn declined_session_is_deleted() {
    let h = Harness::new();
    let mut editor = h.open().await;
    click(&mut editor, 3, 3);
    editor.tick().await;
    editor.cleanup();

    let mut editor = h.open().await;
    assert!(editor.recovery_offer().is_some());
    editor.decline_recovery().await;
    assert!(editor.recovery_offer().is_none());
    assert_eq!(editor.calculate_value(), 0);
    assert!(h.cache.load_session("plot").await.is_none());
}

#[tokio::test]
async fn redraws_are_coalesced_per_tick() {
    let h = Harness::new();
    let mut editor = h.open().await;
    editor.tick().await;
    let before = editor.redraw_count();

    for x in 0..5 {
        click(&mut editor, x, 0);
    }
    assert_eq!(editor.redraw_count(), before);
    assert!(editor.tick().await);
    assert_eq!(editor.redraw_count(), before + 1);
    assert!(!editor.tick().await);
}

#[tokio::test]
async fn render_shows_painted_cells() {
    let h = Harness::new();
    let mut editor = h.open().await;
    editor.set_color(RED);
    click(&mut editor, 5, 5);
    editor.tick().await;

    let image = editor.render_image().unwrap();
    assert_eq!(image.dimensions(), (120, 120));
    let p = cell_pos(&editor, 5, 5);
    assert_eq!(image.get_pixel(p.x as u32, p.y as u32), &Rgba([255, 0, 0, 255]));
}
