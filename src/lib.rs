#![allow(clippy::too_many_arguments)]

pub mod cache;
pub mod canvas;
pub mod cli;
pub mod clock;
pub mod components;
pub mod editor;
pub mod geometry;
pub mod logger;
pub mod render;
pub mod settings;
pub mod sync;
pub mod view;

pub use canvas::{HexColor, PixelRecord, PixelStore};
pub use editor::{EditorError, EditorEvent, SaveStatus, SurfaceSize, TerritoryEditor};
pub use settings::EditorSettings;
