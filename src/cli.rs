// ============================================================================
// terrapaint CLI: headless territory painting via command-line arguments
// ============================================================================
//
// Usage examples:
//   terrapaint --geometry plot.geojson --render plot.png
//   terrapaint -g plot.geojson -p pixels.json --out-pixels merged.json
//   terrapaint -g plot.geojson --stamp logo.png --stamp-rect 10,10,40,40 -r out.png
//   terrapaint -g plot.geojson --grid 200 --threshold 64 --stamp logo.png
//
// Runs one editing session against the in-memory services: the geometry
// becomes the territory, the pixel file seeds the remote store, and the
// session is committed once before the outputs are written.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::backend::CacheBackend;
use crate::cache::{FsBackend, LocalCache, MemoryBackend};
use crate::canvas::{HexColor, PixelRecord};
use crate::clock::{Clock, SystemClock};
use crate::editor::{EditorError, SurfaceSize, TerritoryEditor};
use crate::geometry::{GeometryError, RegionGeometry};
use crate::settings::{EditorSettings, SettingsError};
use crate::sync::memory::{MemoryPixelService, MemoryTerritoryService, StaticActor};
use crate::sync::remote::Territory;
use crate::sync::{CommitOutcome, SyncEngine, SyncOptions};
use crate::view::Rect;

const CLI_ACTOR: &str = "cli";

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// terrapaint headless territory painter.
#[derive(Parser, Debug)]
#[command(
    name = "terrapaint",
    about = "Paint a map territory's pixel grid without a display",
    long_about = "Build the paintable mask of a territory from its GeoJSON geometry,\n\
                  merge existing pixels, optionally stamp an image onto it, and write\n\
                  the result as a rendered PNG and/or a pixel JSON file.\n\n\
                  Example:\n  \
                  terrapaint --geometry plot.geojson --stamp logo.png --render out.png"
)]
pub struct CliArgs {
    /// GeoJSON Polygon / MultiPolygon (bare geometry or Feature).
    #[arg(short, long, value_name = "FILE")]
    pub geometry: PathBuf,

    /// Existing pixels as a JSON array of {"x","y","color"} objects.
    #[arg(short, long, value_name = "FILE")]
    pub pixels: Option<PathBuf>,

    /// Image to stamp onto the territory.
    #[arg(long, value_name = "IMAGE")]
    pub stamp: Option<PathBuf>,

    /// Stamp placement in grid cells: x,y,width,height.
    /// Defaults to the fitted placement over the mask.
    #[arg(long, value_name = "X,Y,W,H", requires = "stamp", value_parser = parse_rect)]
    pub stamp_rect: Option<Rect>,

    /// Alpha at or below which stamp texels are skipped (0-255).
    #[arg(long, value_name = "0-255")]
    pub threshold: Option<u8>,

    /// Cells per side of the grid. Overrides the settings file.
    #[arg(long, value_name = "N")]
    pub grid: Option<u32>,

    /// Settings file (TOML). Defaults to the per-user settings file.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Keep the local cache on disk in this directory instead of memory.
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Write the rendered view to this PNG.
    #[arg(short, long, value_name = "FILE.png")]
    pub render: Option<PathBuf>,

    /// Viewport for --render as WIDTHxHEIGHT in CSS pixels.
    #[arg(long, default_value = "800x600", value_parser = parse_viewport)]
    pub viewport: (f64, f64),

    /// Device pixel ratio for --render.
    #[arg(long, default_value_t = 1.0)]
    pub dpr: f64,

    /// Write the grid itself (one pixel per cell) to this PNG.
    #[arg(long, value_name = "FILE.png")]
    pub export: Option<PathBuf>,

    /// Write the resulting pixels as JSON.
    #[arg(short, long, value_name = "FILE")]
    pub out_pixels: Option<PathBuf>,

    /// Territory id; a random one is generated when omitted.
    #[arg(long)]
    pub territory: Option<String>,

    /// Print timing and commit details.
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("could not read '{path}': {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("could not write '{path}': {source}")]
    Write { path: PathBuf, source: std::io::Error },
    #[error("malformed pixel file: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error(transparent)]
    Editor(#[from] EditorError),
    #[error("render failed: {0}")]
    Image(#[from] image::ImageError),
}

/// One cell in the pixel interchange file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CellEntry {
    pub x: u32,
    pub y: u32,
    pub color: HexColor,
}

impl CellEntry {
    fn into_record(self, author_id: &str, at_ms: u64) -> PixelRecord {
        PixelRecord {
            x: self.x,
            y: self.y,
            color: self.color,
            author_id: author_id.to_string(),
            written_at_ms: at_ms,
        }
    }
}

impl From<&PixelRecord> for CellEntry {
    fn from(rec: &PixelRecord) -> Self {
        Self {
            x: rec.x,
            y: rec.y,
            color: rec.color,
        }
    }
}

/// What a run produced, for the summary line.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub painted: usize,
    pub editable: usize,
    pub grid_cells: usize,
    pub stamped: usize,
}

impl RunSummary {
    pub fn coverage(&self) -> f64 {
        if self.grid_cells == 0 {
            0.0
        } else {
            self.editable as f64 / self.grid_cells as f64
        }
    }
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run one headless session and return an OS exit code.
pub async fn run(args: CliArgs) -> ExitCode {
    let start = Instant::now();
    let verbose = args.verbose;
    match execute(args).await {
        Ok(summary) => {
            println!(
                "{} painted cells, mask covers {} of {} cells ({:.1}%)",
                summary.painted,
                summary.editable,
                summary.grid_cells,
                summary.coverage() * 100.0
            );
            if summary.stamped > 0 {
                println!("stamp wrote {} cells", summary.stamped);
            }
            if verbose {
                println!("done in {:.0}ms", start.elapsed().as_secs_f64() * 1000.0);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// The session pipeline behind [`run`].
pub async fn execute(args: CliArgs) -> Result<RunSummary, CliError> {
    // -- Step 1: Settings ------------------------------------------------
    let mut settings = match args.config.clone().or_else(EditorSettings::settings_path) {
        Some(path) => EditorSettings::load(&path)?,
        None => EditorSettings::default(),
    };
    if let Some(grid) = args.grid {
        settings.grid_size = grid;
    }
    if let Some(threshold) = args.threshold {
        settings.stamp_alpha_threshold = threshold;
    }
    settings.validate();
    let grid_cells = settings.cell_count();

    // -- Step 2: Collaborators -------------------------------------------
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let territory_id = args
        .territory
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let geometry = RegionGeometry::from_geojson(&read_text(&args.geometry)?)?;
    let territories = Arc::new(MemoryTerritoryService::new());
    territories.insert(Territory {
        id: territory_id.clone(),
        owner_id: Some(CLI_ACTOR.to_string()),
        geometry,
        bounds: None,
    });

    let pixels = Arc::new(MemoryPixelService::new(clock.clone(), settings.grid_size));
    if let Some(path) = &args.pixels {
        let entries: Vec<CellEntry> = serde_json::from_str(&read_text(path)?)?;
        let now = clock.now_ms();
        let records = entries
            .into_iter()
            .map(|e| e.into_record(CLI_ACTOR, now))
            .collect();
        pixels.seed(&territory_id, records);
    }

    let backend: Arc<dyn CacheBackend> = match &args.cache_dir {
        Some(dir) => Arc::new(FsBackend::new(dir.clone())),
        None => Arc::new(MemoryBackend::new()),
    };
    let cache = Arc::new(LocalCache::new(backend, clock.clone(), &settings));
    let engine = Arc::new(SyncEngine::new(
        territories,
        pixels,
        Arc::new(StaticActor::new(CLI_ACTOR, "Headless")),
        cache,
        clock.clone(),
        SyncOptions::from(&settings),
    ));

    // -- Step 3: Edit ----------------------------------------------------
    let (width, height) = args.viewport;
    let mut editor = TerritoryEditor::new(settings, engine, clock);
    editor
        .initialize(&territory_id, SurfaceSize::new(width, height, args.dpr), None)
        .await?;
    // nothing local to recover from in a fresh process
    editor.decline_recovery().await;

    let mut stamped = 0;
    if let Some(path) = &args.stamp {
        let bytes = std::fs::read(path).map_err(|source| CliError::Read {
            path: path.clone(),
            source,
        })?;
        editor.load_stamp(&bytes)?;
        if let Some(rect) = args.stamp_rect {
            editor.set_stamp_rect(rect);
        }
        stamped = editor.apply_stamp();
    }

    if editor.has_unsaved_changes()
        && let CommitOutcome::Committed(report) = editor.save_now().await?
        && args.verbose
    {
        println!(
            "committed {} cells ({:?}{})",
            report.committed.len(),
            report.mode,
            if report.fell_back { ", after fallback" } else { "" }
        );
    }

    // -- Step 4: Outputs -------------------------------------------------
    editor.tick().await;
    if let Some(path) = &args.render
        && let Some(image) = editor.render_image()
    {
        image.save(path)?;
    }
    if let Some(path) = &args.export {
        editor.export_png(path)?;
    }
    if let Some(path) = &args.out_pixels {
        let entries: Vec<CellEntry> = editor
            .store()
            .map(|store| store.iter().map(CellEntry::from).collect())
            .unwrap_or_default();
        let json = serde_json::to_string_pretty(&entries)?;
        std::fs::write(path, json).map_err(|source| CliError::Write {
            path: path.clone(),
            source,
        })?;
    }

    let summary = RunSummary {
        painted: editor.calculate_value(),
        editable: editor.mask().map_or(0, |m| m.count()),
        grid_cells,
        stamped,
    };
    info!(
        "CLI session {}: {} painted, {} editable",
        territory_id, summary.painted, summary.editable
    );
    editor.cleanup();
    Ok(summary)
}

// ============================================================================
// Helpers
// ============================================================================

fn read_text(path: &Path) -> Result<String, CliError> {
    std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// "x,y,w,h" in grid cells.
fn parse_rect(s: &str) -> Result<Rect, String> {
    let parts: Vec<f64> = s
        .split(',')
        .map(|p| p.trim().parse::<f64>().map_err(|e| format!("'{}': {}", p, e)))
        .collect::<Result<_, _>>()?;
    match parts.as_slice() {
        [x, y, w, h] if *w > 0.0 && *h > 0.0 => Ok(Rect::new(*x, *y, *w, *h)),
        [_, _, _, _] => Err("width and height must be positive".into()),
        _ => Err("expected four comma-separated numbers".into()),
    }
}

/// "WIDTHxHEIGHT".
fn parse_viewport(s: &str) -> Result<(f64, f64), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("'{}' is not WIDTHxHEIGHT", s))?;
    let w: f64 = w.trim().parse().map_err(|e| format!("width: {}", e))?;
    let h: f64 = h.trim().parse().map_err(|e| format!("height: {}", e))?;
    if w <= 0.0 || h <= 0.0 {
        return Err("viewport must be non-empty".into());
    }
    Ok((w, h))
}
