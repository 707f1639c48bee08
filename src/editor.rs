// ============================================================================
// TERRITORY EDITOR: one editing session over one territory
// ============================================================================
//
// Owns the pixel store, history, view transform and render pipeline for the
// open territory and talks to the sync engine for loading and saving. The
// host drives it with three calls:
//
//   handle_input(event)   pointer / wheel / keyboard, synchronous
//   tick().await          once per display refresh: redraw, session
//                         snapshot, debounced save
//   drain_events()        status notifications for the surrounding UI
//
// Timers are polled in tick() against the injected clock rather than
// spawned, so a session never outlives its editor.
// ============================================================================

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use image::RgbaImage;
use tracing::{error, info, warn};

use crate::canvas::{HexColor, PixelStore};
use crate::clock::Clock;
use crate::components::history::HistoryStack;
use crate::components::stamp::{ImageStamp, StampError, StampHit};
use crate::components::tools::{InputEvent, Interaction, Key, Modifiers, PointerButton, Tool, line_cells};
use crate::geometry::{CellMask, GeometryError};
use crate::render::{FrameInput, HANDLE_SIZE, Overlay, RenderPipeline};
use crate::settings::EditorSettings;
use crate::sync::remote::Territory;
use crate::sync::{CommitOutcome, CommitRequest, RecoveryOffer, SyncEngine, SyncError};
use crate::view::{Point, Rect, ViewTransform};

#[derive(Debug, thiserror::Error)]
pub enum EditorError {
    #[error("No territory is open")]
    NotInitialized,
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error(transparent)]
    Stamp(#[from] StampError),
    #[error("Export failed: {0}")]
    Export(#[from] image::ImageError),
}

/// Viewport in CSS pixels plus the device pixel ratio.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SurfaceSize {
    pub width: f64,
    pub height: f64,
    pub device_pixel_ratio: f64,
}

impl SurfaceSize {
    pub fn new(width: f64, height: f64, device_pixel_ratio: f64) -> Self {
        Self {
            width,
            height,
            device_pixel_ratio,
        }
    }

    fn center(&self) -> Point {
        Point::new(self.width / 2.0, self.height / 2.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SaveStatus {
    Pending,
    Saving,
    Saved,
    Error(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum EditorEvent {
    SaveStatus(SaveStatus),
    ToolChanged(Tool),
    ColorChanged(HexColor),
    ZoomChanged(f64),
}

struct Session {
    territory_id: String,
    author_id: String,
    mask: Arc<CellMask>,
    store: PixelStore,
    history: HistoryStack,
    view: ViewTransform,
    pipeline: RenderPipeline,
    viewport: SurfaceSize,
    interaction: Interaction,
    hover: Option<(i64, i64)>,
    stamp: Option<ImageStamp>,
    recovery: Option<RecoveryOffer>,
    save_deadline_ms: Option<u64>,
    last_edit_ms: u64,
}

impl Session {
    fn paint(&mut self, tool: Tool, (x, y): (i64, i64), color: HexColor) -> bool {
        match tool {
            Tool::Brush => self.store.set(x, y, color, &self.author_id),
            Tool::Eraser => self.store.erase(x, y),
            _ => false,
        }
    }

    /// Arm (or push back) the debounced save. True when nothing was pending
    /// before.
    fn mark_edited(&mut self, now: u64, debounce_ms: u64) -> bool {
        self.last_edit_ms = now;
        let newly_pending = self.save_deadline_ms.is_none();
        self.save_deadline_ms = Some(now.saturating_add(debounce_ms));
        self.pipeline.request_redraw();
        newly_pending
    }

    fn fit_view(&mut self, padding: f64) {
        let n = self.mask.grid_size() as f64;
        let world = self
            .mask
            .bounds()
            .map(|cells| Rect::from_cells(&cells))
            .unwrap_or(Rect::new(0.0, 0.0, n, n));
        self.view
            .fit_to_view(&world, self.viewport.width, self.viewport.height, padding);
        self.pipeline.request_redraw();
    }

    fn overlay(&self, tool: Tool, color: HexColor) -> Overlay {
        let hover = self.hover.filter(|&(x, y)| self.mask.contains(x, y)).and_then(|cell| match tool {
            Tool::Brush | Tool::Fill => Some((cell, Some(color))),
            Tool::Eraser | Tool::Eyedropper => Some((cell, None)),
            _ => None,
        });
        Overlay {
            hover,
            stamp: self.stamp.as_ref().map(|s| s.rect()),
        }
    }
}

pub struct TerritoryEditor {
    settings: EditorSettings,
    clock: Arc<dyn Clock>,
    sync: Arc<SyncEngine>,
    tool: Tool,
    color: HexColor,
    events: VecDeque<EditorEvent>,
    session: Option<Session>,
}

impl TerritoryEditor {
    pub fn new(settings: EditorSettings, sync: Arc<SyncEngine>, clock: Arc<dyn Clock>) -> Self {
        let color = settings.default_color;
        Self {
            settings,
            clock,
            sync,
            tool: Tool::default(),
            color,
            events: VecDeque::new(),
            session: None,
        }
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Open `territory_id`. When `territory` is `None` it is fetched from the
    /// territory service.
    pub async fn initialize(
        &mut self,
        territory_id: &str,
        surface: SurfaceSize,
        territory: Option<Territory>,
    ) -> Result<(), EditorError> {
        if self.session.is_some() {
            self.cleanup();
        }
        let actor = self.sync.current_actor().await.ok_or(SyncError::NotAuthenticated)?;
        let territory = match territory {
            Some(t) => t,
            None => self.sync.fetch_territory(territory_id).await?,
        };
        let bbox = match territory.bounds {
            Some(b) => b,
            None => territory.geometry.bounding_box()?,
        };

        let mask = Arc::new(CellMask::build(&territory.geometry, &bbox, self.settings.grid_size));
        if mask.is_empty() {
            warn!("Territory {} has no editable area", territory_id);
        }

        let mut store = PixelStore::new(mask.clone(), self.clock.clone(), self.settings.flood_fill_budget);
        let loaded = self.sync.load_pixels(territory_id).await;
        store.hydrate(&loaded.pixels);
        let recovery = self.sync.recovery_offer(territory_id, loaded.updated_at_ms).await;

        let mut pipeline = RenderPipeline::new(self.settings.checker_size);
        pipeline.set_mask(mask.clone());
        pipeline.resize(surface.width, surface.height, surface.device_pixel_ratio);

        let mut session = Session {
            territory_id: territory_id.to_string(),
            author_id: actor.id,
            mask,
            store,
            history: HistoryStack::new(self.settings.history_limit),
            view: ViewTransform::new(self.settings.min_zoom, self.settings.max_zoom),
            pipeline,
            viewport: surface,
            interaction: Interaction::Idle,
            hover: None,
            stamp: None,
            recovery,
            save_deadline_ms: None,
            last_edit_ms: 0,
        };
        session.fit_view(self.settings.fit_padding);
        info!(
            "Opened territory {} ({} editable cells, {} painted, source {:?}{})",
            territory_id,
            session.mask.count(),
            session.store.len(),
            loaded.source,
            if session.recovery.is_some() { ", recovery offered" } else { "" }
        );
        self.events.push_back(EditorEvent::ZoomChanged(session.view.scale()));
        self.session = Some(session);
        Ok(())
    }

    /// Tear the session down. Unsaved edits stay recoverable through the
    /// session snapshot, if one was written.
    pub fn cleanup(&mut self) {
        if let Some(mut s) = self.session.take() {
            s.save_deadline_ms = None;
            s.pipeline.cancel_redraw();
            s.store.clear();
            s.history.clear();
            info!("Closed territory {}", s.territory_id);
        }
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn territory_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.territory_id.as_str())
    }

    pub fn resize(&mut self, surface: SurfaceSize) {
        if let Some(s) = self.session.as_mut()
            && s.pipeline
                .resize(surface.width, surface.height, surface.device_pixel_ratio)
        {
            s.viewport = surface;
        }
    }

    // ---- recovery -----------------------------------------------------------

    pub fn recovery_offer(&self) -> Option<&RecoveryOffer> {
        self.session.as_ref()?.recovery.as_ref()
    }

    /// Replace the loaded pixels with the recovered session. Undoable.
    pub fn accept_recovery(&mut self) -> bool {
        let now = self.clock.now_ms();
        let debounce = self.settings.save_debounce_ms;
        let Some(s) = self.session.as_mut() else {
            return false;
        };
        let Some(offer) = s.recovery.take() else {
            return false;
        };
        s.history.checkpoint("Recover session", &s.store);
        s.store.recover(&offer.snapshot.pixels);
        info!("Recovered {} cells for {}", offer.snapshot.pixels.len(), s.territory_id);
        if s.mark_edited(now, debounce) {
            self.events.push_back(EditorEvent::SaveStatus(SaveStatus::Pending));
        }
        true
    }

    /// Keep the remote data and delete the stray snapshot.
    pub async fn decline_recovery(&mut self) {
        let Some(s) = self.session.as_mut() else {
            return;
        };
        if s.recovery.take().is_some() {
            self.sync.discard_session(&s.territory_id).await;
        }
    }

    // ========================================================================
    // INPUT
    // ========================================================================

    pub fn handle_input(&mut self, event: InputEvent) {
        match event {
            InputEvent::PointerDown { pos, button } => self.pointer_down(pos, button),
            InputEvent::PointerMove { pos } => self.pointer_move(pos),
            InputEvent::PointerUp { .. } => self.end_gesture(false),
            InputEvent::PointerLeave => self.end_gesture(true),
            InputEvent::Wheel { pos, delta_y } => {
                let step = self.settings.zoom_step;
                if delta_y < 0.0 {
                    self.zoom_at(step, Some(pos));
                } else if delta_y > 0.0 {
                    self.zoom_at(1.0 / step, Some(pos));
                }
            }
            InputEvent::KeyDown { key, modifiers } => self.key_down(key, modifiers),
        }
    }

    fn pointer_down(&mut self, pos: Point, button: PointerButton) {
        let (tool, color) = (self.tool, self.color);
        let now = self.clock.now_ms();
        let debounce = self.settings.save_debounce_ms;
        let Some(s) = self.session.as_mut() else {
            return;
        };
        if !s.interaction.is_idle() {
            return;
        }
        if button == PointerButton::Middle || (button == PointerButton::Primary && tool == Tool::Pan) {
            s.interaction = Interaction::Panning { last: pos };
            return;
        }
        if button != PointerButton::Primary {
            return;
        }

        let cell = s.view.screen_to_cell(pos);
        let mut edited = false;
        let mut picked = None;
        if tool.edits_pixels() {
            s.history.checkpoint(tool.label(), &s.store);
        }
        match tool {
            Tool::Brush | Tool::Eraser => {
                edited = s.paint(tool, cell, color);
                s.interaction = Interaction::Painting { tool, last_cell: cell };
            }
            Tool::Fill => {
                edited = s.store.flood_fill(cell.0, cell.1, color, &s.author_id) > 0;
            }
            Tool::Eyedropper => picked = s.store.color_at(cell.0, cell.1),
            Tool::Stamp => {
                let world = s.view.screen_to_world(pos);
                let radius = HANDLE_SIZE / s.view.scale();
                if let Some(stamp) = &s.stamp {
                    match stamp.hit_test(world, radius) {
                        Some(StampHit::Handle(corner)) => s.interaction = Interaction::StampResizing { corner },
                        Some(StampHit::Body) => {
                            let r = stamp.rect();
                            s.interaction = Interaction::StampDragging {
                                grab: Point::new(world.x - r.x, world.y - r.y),
                            };
                        }
                        None => {}
                    }
                }
            }
            Tool::Pan => {}
        }

        if edited && s.mark_edited(now, debounce) {
            self.events.push_back(EditorEvent::SaveStatus(SaveStatus::Pending));
        }
        if let Some(c) = picked {
            self.set_color(c);
        }
    }

    fn pointer_move(&mut self, pos: Point) {
        let color = self.color;
        let now = self.clock.now_ms();
        let debounce = self.settings.save_debounce_ms;
        let Some(s) = self.session.as_mut() else {
            return;
        };
        let cell = s.view.screen_to_cell(pos);
        if s.hover != Some(cell) {
            s.hover = Some(cell);
            s.pipeline.request_redraw();
        }

        let mut edited = false;
        match s.interaction {
            Interaction::Painting { tool, last_cell } => {
                if cell != last_cell {
                    for c in line_cells(last_cell, cell).into_iter().skip(1) {
                        edited |= s.paint(tool, c, color);
                    }
                    s.interaction = Interaction::Painting { tool, last_cell: cell };
                }
            }
            Interaction::Panning { last } => {
                s.view.pan_by(pos.x - last.x, pos.y - last.y);
                s.interaction = Interaction::Panning { last: pos };
                s.pipeline.request_redraw();
            }
            Interaction::StampDragging { grab } => {
                let world = s.view.screen_to_world(pos);
                if let Some(stamp) = s.stamp.as_mut() {
                    stamp.move_to(Point::new(world.x - grab.x, world.y - grab.y));
                    s.pipeline.request_redraw();
                }
            }
            Interaction::StampResizing { corner } => {
                let world = s.view.screen_to_world(pos);
                if let Some(stamp) = s.stamp.as_mut() {
                    stamp.resize_corner(corner, world);
                    s.pipeline.request_redraw();
                }
            }
            Interaction::Idle => {}
        }

        if edited && s.mark_edited(now, debounce) {
            self.events.push_back(EditorEvent::SaveStatus(SaveStatus::Pending));
        }
    }

    fn end_gesture(&mut self, left_surface: bool) {
        let Some(s) = self.session.as_mut() else {
            return;
        };
        s.interaction = Interaction::Idle;
        if left_surface {
            s.hover = None;
        }
        s.pipeline.request_redraw();
    }

    fn key_down(&mut self, key: Key, modifiers: Modifiers) {
        let step = self.settings.zoom_step;
        match key {
            Key::Char(c) if modifiers.ctrl => match c.to_ascii_lowercase() {
                'z' if modifiers.shift => {
                    self.redo();
                }
                'z' => {
                    self.undo();
                }
                'y' => {
                    self.redo();
                }
                _ => {}
            },
            Key::Plus | Key::Char('+') | Key::Char('=') => self.zoom_at(step, None),
            Key::Minus | Key::Char('-') => self.zoom_at(1.0 / step, None),
            Key::Char('0') => self.fit_view(),
            Key::Escape => self.cancel_stamp(),
            Key::Enter => {
                self.apply_stamp();
            }
            Key::Char(c) => {
                if let Some(tool) = Tool::from_shortcut(c) {
                    self.set_tool(tool);
                }
            }
        }
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    pub fn undo(&mut self) -> bool {
        self.step_history(true)
    }

    pub fn redo(&mut self) -> bool {
        self.step_history(false)
    }

    fn step_history(&mut self, back: bool) -> bool {
        let now = self.clock.now_ms();
        let debounce = self.settings.save_debounce_ms;
        let Some(s) = self.session.as_mut() else {
            return false;
        };
        if !s.interaction.is_idle() {
            return false;
        }
        let moved = if back {
            s.history.undo(&mut s.store)
        } else {
            s.history.redo(&mut s.store)
        };
        if moved.is_none() {
            return false;
        }
        if s.mark_edited(now, debounce) {
            self.events.push_back(EditorEvent::SaveStatus(SaveStatus::Pending));
        }
        true
    }

    /// Zoom by `factor` about `anchor` (screen space), or the viewport
    /// centre.
    pub fn zoom_at(&mut self, factor: f64, anchor: Option<Point>) {
        let Some(s) = self.session.as_mut() else {
            return;
        };
        let before = s.view.scale();
        s.view.zoom_around(factor, anchor.unwrap_or(s.viewport.center()));
        if s.view.scale() != before {
            s.pipeline.request_redraw();
            self.events.push_back(EditorEvent::ZoomChanged(s.view.scale()));
        }
    }

    pub fn fit_view(&mut self) {
        let padding = self.settings.fit_padding;
        let Some(s) = self.session.as_mut() else {
            return;
        };
        s.fit_view(padding);
        self.events.push_back(EditorEvent::ZoomChanged(s.view.scale()));
    }

    pub fn set_tool(&mut self, tool: Tool) {
        if tool == self.tool {
            return;
        }
        if let Some(s) = self.session.as_mut() {
            if self.tool == Tool::Stamp {
                s.stamp = None;
            }
            s.interaction = Interaction::Idle;
            s.pipeline.request_redraw();
        }
        self.tool = tool;
        self.events.push_back(EditorEvent::ToolChanged(tool));
    }

    pub fn set_color(&mut self, color: HexColor) {
        if color == self.color {
            return;
        }
        self.color = color;
        if let Some(s) = self.session.as_mut() {
            s.pipeline.request_redraw();
        }
        self.events.push_back(EditorEvent::ColorChanged(color));
    }

    // ---- image stamp --------------------------------------------------------

    /// Decode an uploaded image and switch to the stamp tool.
    pub fn load_stamp(&mut self, bytes: &[u8]) -> Result<(), EditorError> {
        let threshold = self.settings.stamp_alpha_threshold;
        let s = self.session.as_ref().ok_or(EditorError::NotInitialized)?;
        let stamp = ImageStamp::from_bytes(bytes, &s.mask, threshold)?;
        self.install_stamp(stamp);
        Ok(())
    }

    /// Use an already-decoded image as the stamp.
    pub fn load_stamp_image(&mut self, image: RgbaImage) -> Result<(), EditorError> {
        let threshold = self.settings.stamp_alpha_threshold;
        let s = self.session.as_ref().ok_or(EditorError::NotInitialized)?;
        let stamp = ImageStamp::new(image, &s.mask, threshold)?;
        self.install_stamp(stamp);
        Ok(())
    }

    fn install_stamp(&mut self, stamp: ImageStamp) {
        self.set_tool(Tool::Stamp);
        if let Some(s) = self.session.as_mut() {
            s.stamp = Some(stamp);
            s.pipeline.request_redraw();
        }
    }

    pub fn stamp_rect(&self) -> Option<Rect> {
        self.session.as_ref()?.stamp.as_ref().map(|s| s.rect())
    }

    pub fn set_stamp_rect(&mut self, rect: Rect) {
        if let Some(s) = self.session.as_mut()
            && let Some(stamp) = s.stamp.as_mut()
        {
            stamp.set_rect(rect);
            s.pipeline.request_redraw();
        }
    }

    /// Write the stamp into the store as one undoable edit. Returns the
    /// number of cells written.
    pub fn apply_stamp(&mut self) -> usize {
        let now = self.clock.now_ms();
        let debounce = self.settings.save_debounce_ms;
        let Some(s) = self.session.as_mut() else {
            return 0;
        };
        let Some(stamp) = s.stamp.take() else {
            return 0;
        };
        s.history.checkpoint(Tool::Stamp.label(), &s.store);
        let cells = stamp.rasterize(&s.mask);
        let written = s.store.apply_bulk(cells, &s.author_id);
        s.interaction = Interaction::Idle;
        s.pipeline.request_redraw();
        if written > 0 && s.mark_edited(now, debounce) {
            self.events.push_back(EditorEvent::SaveStatus(SaveStatus::Pending));
        }
        info!("Stamped {} cells", written);
        self.set_tool(Tool::Brush);
        written
    }

    pub fn cancel_stamp(&mut self) {
        if self.tool == Tool::Stamp {
            self.set_tool(Tool::Brush);
        }
    }

    // ========================================================================
    // FRAME LOOP & SAVING
    // ========================================================================

    /// Called once per display refresh. Returns whether a redraw happened.
    pub async fn tick(&mut self) -> bool {
        let now = self.clock.now_ms();
        let (tool, color) = (self.tool, self.color);
        let Some(s) = self.session.as_mut() else {
            return false;
        };

        let overlay = s.overlay(tool, color);
        let drew = s.pipeline.frame(&FrameInput {
            store: &s.store,
            view: &s.view,
            overlay: &overlay,
        });

        if !s.store.changed().is_empty() {
            self.sync
                .refresh_session_snapshot(&s.territory_id, &s.store, s.last_edit_ms)
                .await;
        }

        let due = s.save_deadline_ms.is_some_and(|deadline| now >= deadline);
        if due && !self.sync.is_saving() {
            // failures are reported through the event queue
            let _ = self.save_now().await;
        }
        drew
    }

    /// Commit now, skipping the debounce.
    pub async fn save_now(&mut self) -> Result<CommitOutcome, EditorError> {
        let debounce = self.settings.save_debounce_ms;
        let s = self.session.as_mut().ok_or(EditorError::NotInitialized)?;
        let request = CommitRequest::from_store(&s.territory_id, &s.store);
        s.save_deadline_ms = None;
        self.events.push_back(EditorEvent::SaveStatus(SaveStatus::Saving));

        let result = self.sync.commit(request).await;
        let now = self.clock.now_ms();
        match result {
            Ok(CommitOutcome::Committed(report)) => {
                s.store.acknowledge(&report.committed);
                self.events.push_back(EditorEvent::SaveStatus(SaveStatus::Saved));
                if self.sync.take_pending() || !s.store.changed().is_empty() {
                    s.save_deadline_ms = Some(now.saturating_add(debounce));
                    self.events.push_back(EditorEvent::SaveStatus(SaveStatus::Pending));
                }
                Ok(CommitOutcome::Committed(report))
            }
            Ok(CommitOutcome::Deferred) => {
                s.save_deadline_ms = Some(now.saturating_add(debounce));
                self.events.push_back(EditorEvent::SaveStatus(SaveStatus::Pending));
                Ok(CommitOutcome::Deferred)
            }
            Err(e) => {
                error!("Save of {} failed: {}", s.territory_id, e);
                self.events.push_back(EditorEvent::SaveStatus(SaveStatus::Error(e.to_string())));
                Err(e.into())
            }
        }
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn has_unsaved_changes(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.store.changed().is_empty())
    }

    /// Painted-cell count.
    pub fn calculate_value(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.store.len())
    }

    pub fn zoom_level(&self) -> f64 {
        self.session.as_ref().map_or(1.0, |s| s.view.scale())
    }

    pub fn active_tool(&self) -> Tool {
        self.tool
    }

    pub fn active_color(&self) -> HexColor {
        self.color
    }

    pub fn save_pending(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.save_deadline_ms.is_some())
    }

    pub fn store(&self) -> Option<&PixelStore> {
        self.session.as_ref().map(|s| &s.store)
    }

    pub fn mask(&self) -> Option<&Arc<CellMask>> {
        self.session.as_ref().map(|s| &s.mask)
    }

    pub fn view(&self) -> Option<&ViewTransform> {
        self.session.as_ref().map(|s| &s.view)
    }

    pub fn interaction(&self) -> Interaction {
        self.session.as_ref().map_or(Interaction::Idle, |s| s.interaction)
    }

    pub fn can_undo(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.history.can_undo(&s.store))
    }

    pub fn can_redo(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.history.can_redo(&s.store))
    }

    pub fn redraw_count(&self) -> u64 {
        self.session.as_ref().map_or(0, |s| s.pipeline.dynamic_redraws)
    }

    pub fn drain_events(&mut self) -> Vec<EditorEvent> {
        self.events.drain(..).collect()
    }

    // ========================================================================
    // EXPORT
    // ========================================================================

    /// What the user currently sees, in device pixels.
    pub fn render_image(&self) -> Option<RgbaImage> {
        self.session.as_ref().map(|s| s.pipeline.composite(&s.view))
    }

    /// Grid-sized PNG of the painted cells.
    pub fn export_png(&self, path: &Path) -> Result<(), EditorError> {
        let s = self.session.as_ref().ok_or(EditorError::NotInitialized)?;
        s.store.to_rgba_image().save(path)?;
        Ok(())
    }
}
