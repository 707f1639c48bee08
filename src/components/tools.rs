use crate::view::Point;

// ============================================================================
// TOOLS
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Tool {
    #[default]
    Brush,
    Eraser,
    Fill,
    Eyedropper,
    Pan,
    Stamp,
}

impl Tool {
    pub fn label(&self) -> &'static str {
        match self {
            Tool::Brush => "Brush",
            Tool::Eraser => "Eraser",
            Tool::Fill => "Fill",
            Tool::Eyedropper => "Eyedropper",
            Tool::Pan => "Pan",
            Tool::Stamp => "Image Stamp",
        }
    }

    /// Single-key shortcut (case-insensitive). The stamp tool has none; it
    /// is entered by loading an image.
    pub fn from_shortcut(c: char) -> Option<Tool> {
        match c.to_ascii_lowercase() {
            'b' => Some(Tool::Brush),
            'e' => Some(Tool::Eraser),
            'f' => Some(Tool::Fill),
            'i' => Some(Tool::Eyedropper),
            'h' => Some(Tool::Pan),
            _ => None,
        }
    }

    /// Whether a pointer gesture with this tool mutates pixels (and so must
    /// be checkpointed first).
    pub fn edits_pixels(&self) -> bool {
        matches!(self, Tool::Brush | Tool::Eraser | Tool::Fill)
    }
}

// ============================================================================
// INPUT EVENTS
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PointerButton {
    Primary,
    Secondary,
    Middle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Modifiers {
    pub ctrl: bool,
    pub shift: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Plus,
    Minus,
    Escape,
    Enter,
}

/// Discrete input delivered by the host. Positions are in screen space
/// (CSS pixels, before device pixel ratio).
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum InputEvent {
    PointerDown { pos: Point, button: PointerButton },
    PointerMove { pos: Point },
    PointerUp { pos: Point },
    PointerLeave,
    Wheel { pos: Point, delta_y: f64 },
    KeyDown { key: Key, modifiers: Modifiers },
}

// ============================================================================
// INTERACTION STATE MACHINE
// ============================================================================

/// Corner handle of the stamp rectangle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Corner {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl Corner {
    pub fn all() -> [Corner; 4] {
        [Corner::TopLeft, Corner::TopRight, Corner::BottomLeft, Corner::BottomRight]
    }
}

/// What the pointer is currently doing.
///
/// `Idle → Painting → Idle`, `Idle → Panning → Idle`,
/// `Idle → StampDragging | StampResizing → Idle`.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub enum Interaction {
    #[default]
    Idle,
    /// A brush/eraser stroke; `last_cell` is the previous stroke sample
    Painting { tool: Tool, last_cell: (i64, i64) },
    /// `last` is the previous pointer position in screen space
    Panning { last: Point },
    /// `grab` is the offset from the stamp origin to the pointer, in world space
    StampDragging { grab: Point },
    StampResizing { corner: Corner },
}

impl Interaction {
    pub fn is_idle(&self) -> bool {
        matches!(self, Interaction::Idle)
    }
}

/// Cells visited by a straight stroke from `start` to `end` (inclusive),
/// so fast pointer moves leave no gaps.
pub fn line_cells(start: (i64, i64), end: (i64, i64)) -> Vec<(i64, i64)> {
    let (mut x0, mut y0) = start;
    let (x1, y1) = end;
    let dx = (x1 - x0).abs();
    let dy = (y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx - dy;
    let mut cells = Vec::with_capacity((dx.max(dy) + 1) as usize);

    loop {
        cells.push((x0, y0));
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 > -dy {
            err -= dy;
            x0 += sx;
        }
        if e2 < dx {
            err += dx;
            y0 += sy;
        }
    }
    cells
}
