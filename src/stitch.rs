//! Output buffer and stitching
//!
//! Upscaled tiles are pasted into one RGB8 buffer of the full output size.
//! The buffer lives either in memory or in a memory-mapped scratch file, and
//! is finalized into the output raster (plain or GeoTIFF).

use crate::codec::{ensure_parent, is_tiff_path, save_rgb};
use crate::error::{JobError, Result};
use crate::geo::{write_geotiff, GeoMetadata};
use crate::tiling::TileWindow;
use image::RgbImage;
use memmap2::MmapMut;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

const CHANNELS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferMode {
    Memory,
    Mmap,
    /// Memory-mapped once the buffer exceeds the configured byte threshold
    Auto,
}

impl BufferMode {
    /// Concrete mode for a buffer of `bytes`
    pub fn resolve(self, bytes: u64, threshold: u64) -> BufferMode {
        match self {
            BufferMode::Auto if bytes > threshold => BufferMode::Mmap,
            BufferMode::Auto => BufferMode::Memory,
            other => other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BufferMode::Memory => "memory",
            BufferMode::Mmap => "mmap",
            BufferMode::Auto => "auto",
        }
    }
}

impl FromStr for BufferMode {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "ram" => Ok(BufferMode::Memory),
            "mmap" | "memmap" => Ok(BufferMode::Mmap),
            "auto" => Ok(BufferMode::Auto),
            other => Err(JobError::Config(format!("unknown buffer mode: {}", other))),
        }
    }
}

enum Storage {
    Memory(Vec<u8>),
    Mapped { map: MmapMut, path: PathBuf },
}

/// Full-size RGB8 output, exclusively owned by one running job
pub struct OutputBuffer {
    width: u32,
    height: u32,
    scale: u32,
    storage: Storage,
}

impl OutputBuffer {
    /// Allocate a zeroed `width x height` buffer.
    ///
    /// `scratch_path` backs the buffer when the resolved mode is `Mmap`; the
    /// file is removed when the buffer is dropped.
    pub fn create(
        width: u32,
        height: u32,
        scale: u32,
        mode: BufferMode,
        mmap_threshold: u64,
        scratch_path: &Path,
    ) -> Result<Self> {
        let bytes = width as u64 * height as u64 * CHANNELS as u64;
        let resolved = mode.resolve(bytes, mmap_threshold);

        let storage = match resolved {
            BufferMode::Mmap => {
                ensure_parent(scratch_path)?;
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(scratch_path)?;
                file.set_len(bytes)?;
                // SAFETY: the scratch file is created here, named after the job,
                // and only this buffer maps or resizes it until drop removes it.
                let map = unsafe { MmapMut::map_mut(&file)? };
                Storage::Mapped {
                    map,
                    path: scratch_path.to_path_buf(),
                }
            }
            _ => {
                let len = usize::try_from(bytes).map_err(|_| {
                    JobError::InvalidParameters(format!(
                        "output {}x{} does not fit in memory",
                        width, height
                    ))
                })?;
                Storage::Memory(vec![0u8; len])
            }
        };

        debug!(
            width = width,
            height = height,
            bytes = bytes,
            mode = resolved.as_str(),
            "Output buffer allocated"
        );

        Ok(Self {
            width,
            height,
            scale,
            storage,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn mode(&self) -> BufferMode {
        match self.storage {
            Storage::Memory(_) => BufferMode::Memory,
            Storage::Mapped { .. } => BufferMode::Mmap,
        }
    }

    pub fn pixels(&self) -> &[u8] {
        match &self.storage {
            Storage::Memory(buf) => buf,
            Storage::Mapped { map, .. } => map,
        }
    }

    fn pixels_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::Memory(buf) => buf,
            Storage::Mapped { map, .. } => map,
        }
    }

    /// Paste the upscaled tile for source `window`
    pub fn paste(&mut self, window: &TileWindow, tile: &RgbImage) -> Result<()> {
        let dest = window.scaled(self.scale);
        let (tw, th) = tile.dimensions();
        if (tw, th) != (dest.width, dest.height) {
            return Err(JobError::TileShapeMismatch {
                x: window.x,
                y: window.y,
                expected_width: dest.width,
                expected_height: dest.height,
                width: tw,
                height: th,
            });
        }
        if dest.x + dest.width > self.width || dest.y + dest.height > self.height {
            return Err(JobError::InvalidParameters(format!(
                "tile at ({}, {}) extends past {}x{} output",
                dest.x, dest.y, self.width, self.height
            )));
        }

        let out_stride = self.width as usize * CHANNELS;
        let row_len = dest.width as usize * CHANNELS;
        let src = tile.as_raw();
        let dst = self.pixels_mut();
        for row in 0..dest.height as usize {
            let src_start = row * row_len;
            let dst_start = (dest.y as usize + row) * out_stride + dest.x as usize * CHANNELS;
            dst[dst_start..dst_start + row_len].copy_from_slice(&src[src_start..src_start + row_len]);
        }

        if let Storage::Mapped { map, .. } = &self.storage {
            map.flush()?;
        }
        Ok(())
    }

    /// Encode the buffer to `output_path`.
    ///
    /// A TIFF output whose source carries GeoTIFF tags is written with the
    /// source CRS and a rescaled transform; anything else is encoded in the
    /// format implied by the extension. A partial output file is removed on
    /// failure. Consumes the buffer so its scratch file goes away with it.
    pub fn finalize(self, output_path: &Path, source_path: &Path) -> Result<()> {
        let result = self.encode(output_path, source_path);
        if result.is_err() && output_path.exists() {
            if let Err(e) = std::fs::remove_file(output_path) {
                warn!(path = %output_path.display(), error = %e, "Failed to remove partial output");
            }
        }
        result
    }

    fn encode(&self, output_path: &Path, source_path: &Path) -> Result<()> {
        let geo = if is_tiff_path(output_path) {
            GeoMetadata::read(source_path)?
        } else {
            None
        };

        match geo {
            Some(meta) => {
                let src_w = self.width / self.scale;
                let src_h = self.height / self.scale;
                let meta = meta.rescaled(src_w, src_h, self.width, self.height);
                write_geotiff(output_path, self.pixels(), self.width, self.height, &meta)?;
                info!(path = %output_path.display(), "Georeferenced output written");
            }
            None => {
                save_rgb(self.pixels(), self.width, self.height, output_path)?;
                info!(path = %output_path.display(), "Output written");
            }
        }
        Ok(())
    }
}

impl Drop for OutputBuffer {
    fn drop(&mut self) {
        if let Storage::Mapped { path, .. } = &self.storage {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "Scratch buffer removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove scratch buffer"),
            }
        }
    }
}
