//! Per-tile inference adapters
//!
//! The pipeline treats super-resolution as a pure function
//! `enhance(tile, scale) -> upscaled tile` behind the [`Enhancer`] trait.
//!
//! - [`NearestEnhancer`]: deterministic nearest-neighbour upscaling, used
//!   when no model is configured and as a test double
//! - [`OnnxEnhancer`]: Real-ESRGAN style ONNX model run through ONNX Runtime

use crate::error::{JobError, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

/// Opaque upscaling capability.
///
/// Implementations must return exactly `(w * scale) x (h * scale)` pixels for
/// a `w x h` tile, must not mutate the input, and should be deterministic for
/// a given input.
pub trait Enhancer: Send + Sync {
    fn enhance(&self, tile: &RgbImage, scale: u32) -> Result<RgbImage>;

    fn name(&self) -> &str;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NearestEnhancer;

impl Enhancer for NearestEnhancer {
    fn enhance(&self, tile: &RgbImage, scale: u32) -> Result<RgbImage> {
        let (w, h) = tile.dimensions();
        Ok(imageops::resize(tile, w * scale, h * scale, FilterType::Nearest))
    }

    fn name(&self) -> &str {
        "nearest"
    }
}

fn ort_err(err: impl std::fmt::Display) -> JobError {
    JobError::Inference(err.to_string())
}

/// ONNX super-resolution model.
///
/// Each tile is reflect-padded by `context_pad` pixels so the network sees
/// neighbouring context, and the padding is trimmed from the result before it
/// is returned. When the requested scale differs from the model's native
/// scale the output is resampled with Lanczos3.
pub struct OnnxEnhancer {
    session: Mutex<Session>,
    model_scale: u32,
    context_pad: u32,
    name: String,
}

impl OnnxEnhancer {
    pub fn load(model_path: &Path, model_scale: u32, context_pad: u32) -> Result<Self> {
        if !model_path.exists() {
            return Err(JobError::Inference(format!(
                "Model not found: {}",
                model_path.display()
            )));
        }

        ort::init()
            .with_name("superres-node")
            .with_execution_providers([
                ort::execution_providers::CPUExecutionProvider::default().build(),
            ])
            .commit()
            .map_err(ort_err)?;

        let session = Session::builder()
            .map_err(ort_err)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(ort_err)?
            .commit_from_file(model_path)
            .map_err(ort_err)?;

        let name = model_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "onnx".to_string());

        info!(
            model = %name,
            model_scale = model_scale,
            context_pad = context_pad,
            "ONNX super-resolution model loaded"
        );

        Ok(Self {
            session: Mutex::new(session),
            model_scale,
            context_pad,
            name,
        })
    }

    /// Run the network on an already padded RGB image
    fn infer(&self, input: &RgbImage) -> Result<RgbImage> {
        let (w, h) = input.dimensions();
        let mut array = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
        for (x, y, pixel) in input.enumerate_pixels() {
            for c in 0..3 {
                array[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
            }
        }

        let tensor = Tensor::from_array(array).map_err(ort_err)?;

        let (out_w, out_h, data) = {
            let mut session = self
                .session
                .lock()
                .map_err(|_| JobError::Inference("model session poisoned".to_string()))?;
            let outputs = session.run(ort::inputs![tensor]).map_err(ort_err)?;
            let view = outputs[0].try_extract_array::<f32>().map_err(ort_err)?;

            let shape = view.shape().to_vec();
            if shape.len() != 4 || shape[1] != 3 {
                return Err(JobError::Inference(format!(
                    "unexpected model output shape {:?}",
                    shape
                )));
            }
            let (out_h, out_w) = (shape[2], shape[3]);
            let mut data = Vec::with_capacity(out_w * out_h * 3);
            for y in 0..out_h {
                for x in 0..out_w {
                    for c in 0..3 {
                        let v = view[[0, c, y, x]].clamp(0.0, 1.0);
                        data.push((v * 255.0).round() as u8);
                    }
                }
            }
            (out_w as u32, out_h as u32, data)
        };

        RgbImage::from_raw(out_w, out_h, data)
            .ok_or_else(|| JobError::Inference("model output buffer size mismatch".to_string()))
    }
}

/// Mirror `tile` by up to `pad` pixels on every side (edge pixel excluded)
fn reflect_pad(tile: &RgbImage, pad: u32) -> (RgbImage, u32, u32) {
    let (w, h) = tile.dimensions();
    let pad_x = pad.min(w.saturating_sub(1));
    let pad_y = pad.min(h.saturating_sub(1));
    let reflect = |i: i64, n: i64| -> u32 {
        let i = if i < 0 { -i } else { i };
        let i = if i >= n { 2 * (n - 1) - i } else { i };
        i.clamp(0, n - 1) as u32
    };

    let padded = RgbImage::from_fn(w + 2 * pad_x, h + 2 * pad_y, |x, y| {
        let sx = reflect(x as i64 - pad_x as i64, w as i64);
        let sy = reflect(y as i64 - pad_y as i64, h as i64);
        *tile.get_pixel(sx, sy)
    });
    (padded, pad_x, pad_y)
}

impl Enhancer for OnnxEnhancer {
    fn enhance(&self, tile: &RgbImage, scale: u32) -> Result<RgbImage> {
        let (w, h) = tile.dimensions();
        let (padded, pad_x, pad_y) = reflect_pad(tile, self.context_pad);
        let upscaled = self.infer(&padded)?;

        let expected = (padded.width() * self.model_scale, padded.height() * self.model_scale);
        if upscaled.dimensions() != expected {
            return Err(JobError::Inference(format!(
                "model produced {:?}, expected {:?} for scale {}",
                upscaled.dimensions(),
                expected,
                self.model_scale
            )));
        }

        let trimmed = imageops::crop_imm(
            &upscaled,
            pad_x * self.model_scale,
            pad_y * self.model_scale,
            w * self.model_scale,
            h * self.model_scale,
        )
        .to_image();

        debug!(width = w, height = h, pad_x = pad_x, pad_y = pad_y, "Tile inferred");

        if scale == self.model_scale {
            Ok(trimmed)
        } else {
            Ok(imageops::resize(&trimmed, w * scale, h * scale, FilterType::Lanczos3))
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
