//! Tile scheduling
//!
//! Partitions a source image into overlapping windows. Windows start every
//! `tile_size - tile_pad` pixels along each axis and are clamped at the
//! trailing edges, so the union of windows always covers the whole image.

use crate::error::{JobError, Result};
use serde::{Deserialize, Serialize};

/// Tiling parameters for one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileParams {
    pub tile_size: u32,
    /// Overlap between neighbouring windows
    pub tile_pad: u32,
    pub scale: u32,
}

impl TileParams {
    pub fn new(tile_size: u32, tile_pad: u32, scale: u32) -> Result<Self> {
        let params = Self {
            tile_size,
            tile_pad,
            scale,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tile_size == 0 {
            return Err(JobError::InvalidParameters("tile_size must be positive".to_string()));
        }
        if self.tile_pad >= self.tile_size {
            return Err(JobError::InvalidParameters(format!(
                "tile_pad ({}) must be smaller than tile_size ({})",
                self.tile_pad, self.tile_size
            )));
        }
        if self.scale == 0 {
            return Err(JobError::InvalidParameters("scale must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn step(&self) -> u32 {
        self.tile_size - self.tile_pad
    }
}

/// A window in source-pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileWindow {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl TileWindow {
    /// Destination rectangle `(x, y, width, height)` in the upscaled output
    pub fn scaled(&self, scale: u32) -> TileWindow {
        TileWindow {
            x: self.x * scale,
            y: self.y * scale,
            width: self.width * scale,
            height: self.height * scale,
        }
    }

    pub fn contains(&self, px: u32, py: u32) -> bool {
        px >= self.x && px < self.x + self.width && py >= self.y && py < self.y + self.height
    }
}

/// Row-major list of windows covering a `width` x `height` image
pub fn schedule(width: u32, height: u32, params: &TileParams) -> Result<Vec<TileWindow>> {
    params.validate()?;
    if width == 0 || height == 0 {
        return Err(JobError::InvalidParameters(format!(
            "image has no pixels ({}x{})",
            width, height
        )));
    }

    let step = params.step() as usize;
    let mut windows = Vec::new();
    for y in (0..height).step_by(step) {
        for x in (0..width).step_by(step) {
            windows.push(TileWindow {
                x,
                y,
                width: params.tile_size.min(width - x),
                height: params.tile_size.min(height - y),
            });
        }
    }

    tracing::debug!(
        width = width,
        height = height,
        tile_size = params.tile_size,
        tile_pad = params.tile_pad,
        tiles = windows.len(),
        "Scheduled tile windows"
    );
    Ok(windows)
}

/// Output dimensions for a source of `width` x `height`
pub fn output_dimensions(width: u32, height: u32, scale: u32) -> Result<(u32, u32)> {
    let w = width.checked_mul(scale);
    let h = height.checked_mul(scale);
    match (w, h) {
        (Some(w), Some(h)) => Ok((w, h)),
        _ => Err(JobError::InvalidParameters(format!(
            "{}x{} at scale {} overflows output dimensions",
            width, height, scale
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_scenario_windows() {
        let params = TileParams::new(512, 64, 4).unwrap();
        let windows = schedule(600, 600, &params).unwrap();

        assert_eq!(params.step(), 448);
        assert_eq!(
            windows,
            vec![
                TileWindow { x: 0, y: 0, width: 512, height: 512 },
                TileWindow { x: 448, y: 0, width: 152, height: 512 },
                TileWindow { x: 0, y: 448, width: 512, height: 152 },
                TileWindow { x: 448, y: 448, width: 152, height: 152 },
            ]
        );
        assert_eq!(output_dimensions(600, 600, 4).unwrap(), (2400, 2400));
    }

    #[test]
    fn test_image_smaller_than_tile_is_single_window() {
        let params = TileParams::new(512, 64, 2).unwrap();
        let windows = schedule(100, 40, &params).unwrap();
        assert_eq!(windows, vec![TileWindow { x: 0, y: 0, width: 100, height: 40 }]);
    }

    #[test]
    fn test_rejects_invalid_parameters() {
        assert!(TileParams::new(64, 64, 4).is_err());
        assert!(TileParams::new(0, 0, 4).is_err());
        assert!(TileParams::new(64, 8, 0).is_err());

        let params = TileParams::new(64, 8, 2).unwrap();
        assert!(schedule(0, 10, &params).is_err());
    }

    #[test]
    fn test_scaled_window() {
        let window = TileWindow { x: 448, y: 0, width: 152, height: 512 };
        assert_eq!(
            window.scaled(4),
            TileWindow { x: 1792, y: 0, width: 608, height: 2048 }
        );
    }
}
