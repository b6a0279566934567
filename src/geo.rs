//! GeoTIFF metadata propagation
//!
//! Reads the georeferencing of a source raster (GeoKey directory with its
//! double/ascii parameter tables, plus either ModelPixelScale+ModelTiepoint
//! or ModelTransformation) and writes an upscaled 3-band RGB8 GeoTIFF that
//! inherits the CRS with a rescaled geotransform.

use crate::codec::{ensure_parent, is_tiff_path};
use crate::error::{JobError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tiff::decoder::Decoder;
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const MODEL_TRANSFORMATION: u16 = 34264;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GEO_DOUBLE_PARAMS: u16 = 34736;
const GEO_ASCII_PARAMS: u16 = 34737;

pub const GTIFF_DRIVER: &str = "GTiff";

/// Output band count; alpha and extra bands are not carried over
pub const OUTPUT_BANDS: u16 = 3;

/// Affine pixel-to-world transform.
///
/// `x = a*col + b*row + c`, `y = d*col + e*row + f`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl GeoTransform {
    /// Transform for an output of `out_w x out_h` covering the same extent
    /// as a `src_w x src_h` source. Only the pixel-size terms change.
    pub fn rescale(&self, src_w: u32, src_h: u32, out_w: u32, out_h: u32) -> GeoTransform {
        let x_ratio = out_w as f64 / src_w as f64;
        let y_ratio = out_h as f64 / src_h as f64;
        GeoTransform {
            a: self.a / x_ratio,
            e: self.e / y_ratio,
            ..*self
        }
    }

    fn is_axis_aligned(&self) -> bool {
        self.b == 0.0 && self.d == 0.0
    }

    fn from_pixel_scale(scale: &[f64], tiepoint: &[f64]) -> Result<Self> {
        if scale.len() < 2 || tiepoint.len() < 6 {
            return Err(JobError::Geo(format!(
                "malformed pixel scale ({} values) or tiepoint ({} values)",
                scale.len(),
                tiepoint.len()
            )));
        }
        let (sx, sy) = (scale[0], scale[1]);
        let (i, j, x, y) = (tiepoint[0], tiepoint[1], tiepoint[3], tiepoint[4]);
        Ok(GeoTransform {
            a: sx,
            b: 0.0,
            c: x - i * sx,
            d: 0.0,
            e: -sy,
            f: y + j * sy,
        })
    }

    fn from_matrix(m: &[f64]) -> Result<Self> {
        if m.len() < 16 {
            return Err(JobError::Geo(format!(
                "model transformation needs 16 values, got {}",
                m.len()
            )));
        }
        Ok(GeoTransform {
            a: m[0],
            b: m[1],
            c: m[3],
            d: m[4],
            e: m[5],
            f: m[7],
        })
    }

    fn to_matrix(&self) -> [f64; 16] {
        [
            self.a, self.b, 0.0, self.c, //
            self.d, self.e, 0.0, self.f, //
            0.0, 0.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, 1.0,
        ]
    }
}

/// Georeferencing carried by a source raster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoMetadata {
    pub transform: GeoTransform,
    /// Raw GeoKey directory; encodes the CRS and points into the param tables
    pub geo_keys: Vec<u16>,
    pub double_params: Vec<f64>,
    pub ascii_params: Option<String>,
    pub driver: String,
}

impl GeoMetadata {
    /// Georeferencing of `path`, or `None` when it is not a georeferenced TIFF
    pub fn read(path: &Path) -> Result<Option<GeoMetadata>> {
        if !is_tiff_path(path) {
            return Ok(None);
        }

        let mut decoder = Decoder::new(BufReader::new(File::open(path)?))?;

        let transform = match decoder.find_tag(Tag::Unknown(MODEL_TRANSFORMATION))? {
            Some(value) => Some(GeoTransform::from_matrix(&value.into_f64_vec()?)?),
            None => {
                let scale = decoder.find_tag(Tag::Unknown(MODEL_PIXEL_SCALE))?;
                let tiepoint = decoder.find_tag(Tag::Unknown(MODEL_TIEPOINT))?;
                match (scale, tiepoint) {
                    (Some(scale), Some(tiepoint)) => Some(GeoTransform::from_pixel_scale(
                        &scale.into_f64_vec()?,
                        &tiepoint.into_f64_vec()?,
                    )?),
                    _ => None,
                }
            }
        };

        let Some(transform) = transform else {
            tracing::debug!(path = %path.display(), "TIFF carries no geotransform");
            return Ok(None);
        };

        let geo_keys = match decoder.find_tag(Tag::Unknown(GEO_KEY_DIRECTORY))? {
            Some(value) => value.into_u16_vec()?,
            None => Vec::new(),
        };
        let double_params = match decoder.find_tag(Tag::Unknown(GEO_DOUBLE_PARAMS))? {
            Some(value) => value.into_f64_vec()?,
            None => Vec::new(),
        };
        let ascii_params = match decoder.find_tag(Tag::Unknown(GEO_ASCII_PARAMS))? {
            Some(value) => Some(value.into_string()?),
            None => None,
        };

        Ok(Some(GeoMetadata {
            transform,
            geo_keys,
            double_params,
            ascii_params,
            driver: GTIFF_DRIVER.to_string(),
        }))
    }

    /// Same CRS and driver with the transform rescaled for the output size
    pub fn rescaled(&self, src_w: u32, src_h: u32, out_w: u32, out_h: u32) -> GeoMetadata {
        GeoMetadata {
            transform: self.transform.rescale(src_w, src_h, out_w, out_h),
            ..self.clone()
        }
    }
}

/// Write interleaved RGB8 `pixels` as a GeoTIFF carrying `metadata`
pub fn write_geotiff(
    path: &Path,
    pixels: &[u8],
    width: u32,
    height: u32,
    metadata: &GeoMetadata,
) -> Result<()> {
    if metadata.driver != GTIFF_DRIVER {
        return Err(JobError::Geo(format!("unsupported driver: {}", metadata.driver)));
    }
    let expected = width as usize * height as usize * OUTPUT_BANDS as usize;
    if pixels.len() != expected {
        return Err(JobError::Geo(format!(
            "pixel buffer holds {} bytes, expected {} for {}x{}",
            pixels.len(),
            expected,
            width,
            height
        )));
    }

    ensure_parent(path)?;
    let mut encoder = TiffEncoder::new(BufWriter::new(File::create(path)?))?;
    let mut image = encoder.new_image::<colortype::RGB8>(width, height)?;

    let t = metadata.transform;
    {
        let dir = image.encoder();
        if t.is_axis_aligned() {
            dir.write_tag(Tag::Unknown(MODEL_PIXEL_SCALE), &[t.a, -t.e, 0.0][..])?;
            dir.write_tag(
                Tag::Unknown(MODEL_TIEPOINT),
                &[0.0, 0.0, 0.0, t.c, t.f, 0.0][..],
            )?;
        } else {
            dir.write_tag(Tag::Unknown(MODEL_TRANSFORMATION), &t.to_matrix()[..])?;
        }
        if !metadata.geo_keys.is_empty() {
            dir.write_tag(Tag::Unknown(GEO_KEY_DIRECTORY), &metadata.geo_keys[..])?;
        }
        if !metadata.double_params.is_empty() {
            dir.write_tag(Tag::Unknown(GEO_DOUBLE_PARAMS), &metadata.double_params[..])?;
        }
        if let Some(ascii) = &metadata.ascii_params {
            dir.write_tag(Tag::Unknown(GEO_ASCII_PARAMS), ascii.as_str())?;
        }
    }

    image.write_data(pixels)?;

    tracing::debug!(
        path = %path.display(),
        width = width,
        height = height,
        pixel_width = t.a,
        pixel_height = t.e,
        "GeoTIFF written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn utm_metadata() -> GeoMetadata {
        GeoMetadata {
            transform: GeoTransform {
                a: 10.0,
                b: 0.0,
                c: 500_000.0,
                d: 0.0,
                e: -10.0,
                f: 4_600_000.0,
            },
            // version 1.1.0, 2 keys: GTModelType=Projected, ProjectedCSType=32633
            geo_keys: vec![1, 1, 0, 2, 1024, 0, 1, 1, 3072, 0, 1, 32633],
            double_params: Vec::new(),
            ascii_params: Some("WGS 84 / UTM zone 33N|".to_string()),
            driver: GTIFF_DRIVER.to_string(),
        }
    }

    #[test]
    fn test_rescale_divides_pixel_size_only() {
        let t = GeoTransform { a: 0.5, b: 0.01, c: 100.0, d: 0.02, e: -0.5, f: 200.0 };
        let r = t.rescale(600, 600, 2400, 2400);

        assert_eq!(r.a, 0.125);
        assert_eq!(r.e, -0.125);
        assert_eq!((r.b, r.c, r.d, r.f), (t.b, t.c, t.d, t.f));
    }

    #[test]
    fn test_rescale_uses_independent_axis_ratios() {
        let t = GeoTransform { a: 4.0, b: 0.0, c: 0.0, d: 0.0, e: -6.0, f: 0.0 };
        let r = t.rescale(100, 50, 400, 100);
        assert_eq!(r.a, 1.0);
        assert_eq!(r.e, -3.0);
    }

    #[test]
    fn test_pixel_scale_and_tiepoint_conversion() {
        let t = GeoTransform::from_pixel_scale(&[2.0, 3.0, 0.0], &[10.0, 20.0, 0.0, 1000.0, 5000.0, 0.0])
            .unwrap();
        assert_eq!(t.a, 2.0);
        assert_eq!(t.e, -3.0);
        assert_eq!(t.c, 980.0);
        assert_eq!(t.f, 5060.0);
    }

    #[test]
    fn test_write_then_read_preserves_crs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.tif");
        let meta = utm_metadata().rescaled(4, 4, 8, 8);
        let pixels = vec![128u8; 8 * 8 * 3];

        write_geotiff(&path, &pixels, 8, 8, &meta).unwrap();
        let read = GeoMetadata::read(&path).unwrap().expect("georeferenced");

        assert_eq!(read.transform.a, 5.0);
        assert_eq!(read.transform.e, -5.0);
        assert_eq!(read.transform.c, 500_000.0);
        assert_eq!(read.transform.f, 4_600_000.0);
        assert_eq!(read.geo_keys, meta.geo_keys);
        assert_eq!(read.driver, "GTiff");

        let decoded = image::open(&path).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 8));
        assert_eq!(decoded.color().channel_count(), 3);
    }

    #[test]
    fn test_plain_rasters_have_no_metadata() {
        let dir = TempDir::new().unwrap();
        let png = dir.path().join("a.png");
        let tif = dir.path().join("b.tif");
        let pixels = vec![0u8; 2 * 2 * 3];
        crate::codec::save_rgb(&pixels, 2, 2, &png).unwrap();
        crate::codec::save_rgb(&pixels, 2, 2, &tif).unwrap();

        assert!(GeoMetadata::read(&png).unwrap().is_none());
        assert!(GeoMetadata::read(&tif).unwrap().is_none());
    }

    #[test]
    fn test_rejects_wrong_buffer_size() {
        let dir = TempDir::new().unwrap();
        let err = write_geotiff(&dir.path().join("x.tif"), &[0u8; 5], 2, 2, &utm_metadata());
        assert!(matches!(err, Err(JobError::Geo(_))));
    }
}
