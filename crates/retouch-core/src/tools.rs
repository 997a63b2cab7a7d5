//! Tool state machine.
//!
//! Exactly one tool (or none) is active. Gestures are bound to the tool that
//! owns them; a gesture for any other tool is rejected. Crop and adjust keep
//! draft parameters that survive tool switches until they are applied or
//! reset.

use crate::operation::{AdjustChannel, AdjustParams, AiTask, CropRect, ExtendDirection, Operation, TextStyle};
use crate::raster::Geometry;
use kurbo::Point;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Available tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolId {
    Resize,
    Crop,
    Adjust,
    Background,
    AiExtender,
    Text,
    AiEdit,
}

impl ToolId {
    /// Every tool, in panel order.
    pub fn all() -> [ToolId; 7] {
        [
            ToolId::Resize,
            ToolId::Crop,
            ToolId::Adjust,
            ToolId::Background,
            ToolId::AiExtender,
            ToolId::Text,
            ToolId::AiEdit,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolId::Resize => "resize",
            ToolId::Crop => "crop",
            ToolId::Adjust => "adjust",
            ToolId::Background => "background",
            ToolId::AiExtender => "ai_extender",
            ToolId::Text => "text",
            ToolId::AiEdit => "ai_edit",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            ToolId::Resize => "Resize",
            ToolId::Crop => "Crop",
            ToolId::Adjust => "Adjust",
            ToolId::Background => "Background",
            ToolId::AiExtender => "AI Image Extender",
            ToolId::Text => "Add Text",
            ToolId::AiEdit => "AI Editing",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ToolId::Resize => "Change project dimensions",
            ToolId::Crop => "Crop and trim your image",
            ToolId::Adjust => "Brightness, contrast, and more (Manual saving required)",
            ToolId::Background => "Remove or change background",
            ToolId::AiExtender => "Extend image boundaries with AI",
            ToolId::Text => "Customize in Various Fonts",
            ToolId::AiEdit => "Enhance image quality with AI",
        }
    }

    /// Whether the tool keeps uncommitted parameters.
    pub fn has_draft(&self) -> bool {
        matches!(self, ToolId::Crop | ToolId::Adjust)
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolId {
    type Err = ToolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolId::all()
            .into_iter()
            .find(|tool| tool.as_str() == s)
            .ok_or_else(|| ToolError::UnknownTool(s.to_string()))
    }
}

/// Tool errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("No tool is active")]
    NoActiveTool,
    #[error("Gesture {gesture} is not bound to the {active} tool")]
    GestureNotBound { gesture: &'static str, active: ToolId },
    #[error("The {0} tool has no draft to apply")]
    NoDraft(ToolId),
}

/// A user gesture, already decoded from raw input.
#[derive(Debug, Clone, PartialEq)]
pub enum Gesture {
    /// Set target dimensions. With `keep_aspect` the height follows the width.
    Resize { width: u32, height: u32, keep_aspect: bool },
    /// Drag out a crop rectangle.
    CropDrag { start: Point, end: Point },
    /// Set the crop rectangle numerically.
    CropSet(CropRect),
    CropApply,
    CropReset,
    AdjustSlider { channel: AdjustChannel, value: f32 },
    /// Confirm the adjust draft.
    AdjustApply,
    AdjustReset,
    RemoveBackground,
    Extend { direction: ExtendDirection, amount: u32 },
    PlaceText { content: String, style: TextStyle, position: Point },
    Enhance,
}

impl Gesture {
    /// The tool that owns this gesture.
    pub fn tool(&self) -> ToolId {
        match self {
            Gesture::Resize { .. } => ToolId::Resize,
            Gesture::CropDrag { .. } | Gesture::CropSet(_) | Gesture::CropApply | Gesture::CropReset => {
                ToolId::Crop
            }
            Gesture::AdjustSlider { .. } | Gesture::AdjustApply | Gesture::AdjustReset => ToolId::Adjust,
            Gesture::RemoveBackground => ToolId::Background,
            Gesture::Extend { .. } => ToolId::AiExtender,
            Gesture::PlaceText { .. } => ToolId::Text,
            Gesture::Enhance => ToolId::AiEdit,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Gesture::Resize { .. } => "resize",
            Gesture::CropDrag { .. } => "crop_drag",
            Gesture::CropSet(_) => "crop_set",
            Gesture::CropApply => "crop_apply",
            Gesture::CropReset => "crop_reset",
            Gesture::AdjustSlider { .. } => "adjust_slider",
            Gesture::AdjustApply => "adjust_apply",
            Gesture::AdjustReset => "adjust_reset",
            Gesture::RemoveBackground => "remove_background",
            Gesture::Extend { .. } => "extend",
            Gesture::PlaceText { .. } => "place_text",
            Gesture::Enhance => "enhance",
        }
    }
}

/// What the session should do with a handled gesture.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolAction {
    /// Only draft parameters changed.
    DraftUpdated,
    /// Apply an operation inline.
    Commit(Operation),
    /// Hand a task to the job manager.
    Submit(AiTask),
}

/// Result of a tool switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolSwitch {
    pub previous: Option<ToolId>,
    pub current: Option<ToolId>,
    /// Leaving adjust with an unconfirmed draft; the user should be asked to
    /// apply or reset it.
    pub flush_prompt: bool,
}

/// Tracks the active tool and tool-local drafts.
#[derive(Debug, Clone, Default)]
pub struct ToolMachine {
    active: Option<ToolId>,
    crop_draft: Option<CropRect>,
    adjust_draft: AdjustParams,
}

impl ToolMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<ToolId> {
        self.active
    }

    pub fn crop_draft(&self) -> Option<CropRect> {
        self.crop_draft
    }

    pub fn adjust_draft(&self) -> AdjustParams {
        self.adjust_draft
    }

    /// Whether an unconfirmed adjustment is pending.
    pub fn has_pending_adjust(&self) -> bool {
        !self.adjust_draft.is_neutral()
    }

    /// Activate `tool`. Switching is never blocked.
    pub fn select_tool(&mut self, tool: ToolId) -> ToolSwitch {
        self.switch(Some(tool))
    }

    /// Return to the `none` state.
    pub fn deselect(&mut self) -> ToolSwitch {
        self.switch(None)
    }

    fn switch(&mut self, next: Option<ToolId>) -> ToolSwitch {
        let previous = self.active;
        let flush_prompt =
            previous == Some(ToolId::Adjust) && next != Some(ToolId::Adjust) && self.has_pending_adjust();
        self.active = next;
        log::debug!(
            "Tool {} -> {}",
            previous.map_or("none", |t| t.as_str()),
            next.map_or("none", |t| t.as_str())
        );
        ToolSwitch {
            previous,
            current: next,
            flush_prompt,
        }
    }

    /// Interpret a gesture against the current geometry.
    pub fn handle(&mut self, gesture: Gesture, geometry: Geometry) -> Result<ToolAction, ToolError> {
        let active = self.active.ok_or(ToolError::NoActiveTool)?;
        if gesture.tool() != active {
            return Err(ToolError::GestureNotBound {
                gesture: gesture.name(),
                active,
            });
        }

        Ok(match gesture {
            Gesture::Resize { width, height, keep_aspect } => {
                let height = if keep_aspect {
                    aspect_height(width, geometry)
                } else {
                    height
                };
                ToolAction::Commit(Operation::Resize { width, height })
            }
            Gesture::CropDrag { start, end } => {
                self.crop_draft = Some(CropRect::from_drag(start, end, geometry));
                ToolAction::DraftUpdated
            }
            Gesture::CropSet(rect) => {
                self.crop_draft = Some(rect);
                ToolAction::DraftUpdated
            }
            Gesture::CropApply => {
                let rect = self.crop_draft.ok_or(ToolError::NoDraft(ToolId::Crop))?;
                ToolAction::Commit(Operation::Crop(rect))
            }
            Gesture::CropReset => {
                self.crop_draft = None;
                ToolAction::DraftUpdated
            }
            Gesture::AdjustSlider { channel, value } => {
                self.adjust_draft.set(channel, value);
                ToolAction::DraftUpdated
            }
            Gesture::AdjustApply => {
                if self.adjust_draft.is_neutral() {
                    return Err(ToolError::NoDraft(ToolId::Adjust));
                }
                ToolAction::Commit(Operation::Adjust(self.adjust_draft))
            }
            Gesture::AdjustReset => {
                self.adjust_draft = AdjustParams::default();
                ToolAction::DraftUpdated
            }
            Gesture::RemoveBackground => ToolAction::Submit(AiTask::BackgroundRemove),
            Gesture::Extend { direction, amount } => ToolAction::Submit(AiTask::AiExtend {
                direction,
                amount,
                bounds: geometry,
            }),
            Gesture::PlaceText { content, style, position } => ToolAction::Commit(Operation::TextOverlay {
                id: Uuid::new_v4(),
                content,
                style,
                position,
            }),
            Gesture::Enhance => ToolAction::Submit(AiTask::AiEnhance),
        })
    }

    /// Clear the draft that produced a successfully committed operation.
    pub fn committed(&mut self, op: &Operation) {
        match op {
            Operation::Crop(_) => self.crop_draft = None,
            Operation::Adjust(_) => self.adjust_draft = AdjustParams::default(),
            _ => {}
        }
    }
}

/// Height keeping `geometry`'s aspect ratio at `width`.
fn aspect_height(width: u32, geometry: Geometry) -> u32 {
    let ratio = geometry.height as f64 / geometry.width.max(1) as f64;
    ((width as f64 * ratio).round() as u32).max(1)
}
