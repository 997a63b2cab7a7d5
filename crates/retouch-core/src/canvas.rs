//! Serialized canvas state stored in the project record.

use crate::operation::Operation;
use crate::raster::Geometry;
use serde::{Deserialize, Serialize};

/// Current canvas state format.
pub const CANVAS_STATE_VERSION: u32 = 1;

/// The operation log and resulting geometry, as persisted remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasState {
    pub version: u32,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub operations: Vec<Operation>,
}

impl CanvasState {
    pub fn new(geometry: Geometry, operations: Vec<Operation>) -> Self {
        Self {
            version: CANVAS_STATE_VERSION,
            width: geometry.width,
            height: geometry.height,
            operations,
        }
    }

    pub fn geometry(&self) -> Geometry {
        Geometry::new(self.width, self.height)
    }

    /// Comma-joined operation kinds, in log order.
    pub fn active_transformations(&self) -> String {
        self.operations
            .iter()
            .map(|op| op.kind())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Whether the log contains a background removal.
    pub fn background_removed(&self) -> bool {
        self.operations
            .iter()
            .any(|op| matches!(op, Operation::BackgroundRemove { .. }))
    }

    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{AdjustParams, CropRect, RasterPatch};
    use image::GrayImage;
    use std::sync::Arc;

    #[test]
    fn test_summary_fields() {
        let state = CanvasState::new(
            Geometry::new(400, 300),
            vec![
                Operation::Crop(CropRect::new(0, 0, 400, 300)),
                Operation::BackgroundRemove {
                    patch: RasterPatch::AlphaMask(Arc::new(GrayImage::new(400, 300))),
                },
                Operation::Adjust(AdjustParams::default()),
            ],
        );
        assert_eq!(state.active_transformations(), "crop,background_remove,adjust");
        assert!(state.background_removed());
    }

    #[test]
    fn test_json_round_trip() {
        let state = CanvasState::new(
            Geometry::new(10, 20),
            vec![Operation::Resize { width: 10, height: 20 }],
        );
        let value = state.to_value().unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(CanvasState::from_value(value).unwrap(), state);
        assert_eq!(CanvasState::from_json(&state.to_json().unwrap()).unwrap(), state);
    }

    #[test]
    fn test_missing_operations_default_empty() {
        let state = CanvasState::from_json(r#"{ "version": 1, "width": 5, "height": 6 }"#).unwrap();
        assert!(state.operations.is_empty());
        assert_eq!(state.active_transformations(), "");
        assert!(!state.background_removed());
    }
}
