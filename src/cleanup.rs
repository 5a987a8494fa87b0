use std::io::Cursor;
use std::sync::Arc;

use image::{ImageFormat, Rgba, RgbaImage};
use tracing::debug;

/// Below this green level a pixel is never treated as backdrop, whatever its
/// hue balance. Keeps dark green-leaning subject pixels out of the matte.
const GREEN_FLOOR: i32 = 90;
/// Greenness (g minus the larger of r/b) where the backdrop ramp starts.
const GREENNESS_LOW: i32 = 32;
/// Greenness at which a pixel counts as pure backdrop.
const GREENNESS_HIGH: i32 = 110;

#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    #[error("Image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("Matte extraction failed: {0}")]
    Matte(String),
    #[error("Matte changed image dimensions from {0}x{1} to {2}x{3}")]
    DimensionMismatch(u32, u32, u32, u32),
}

/// Stage-one capability: coarse foreground/background segmentation producing
/// an alpha channel from background confidence. The default is a chroma-key
/// matte over the known backdrop; a model-backed matter plugs in here.
pub trait ForegroundMatter: Send + Sync {
    fn matte(&self, image: &RgbaImage) -> Result<RgbaImage, CleanupError>;
}

fn greenness(pixel: &Rgba<u8>) -> i32 {
    let [r, g, b, _] = pixel.0;
    i32::from(g) - i32::from(r.max(b))
}

/// Confidence that a pixel belongs to the backdrop, 0..=255. Monotone in
/// greenness so the derived alpha is monotone in subject confidence.
fn backdrop_confidence(pixel: &Rgba<u8>) -> u8 {
    if i32::from(pixel.0[1]) <= GREEN_FLOOR {
        return 0;
    }
    let ramp = (greenness(pixel) - GREENNESS_LOW) * 255 / (GREENNESS_HIGH - GREENNESS_LOW);
    ramp.clamp(0, 255) as u8
}

/// Chroma-key matte over the vivid-green backdrop band. Pixels outside the
/// key band keep their alpha untouched, so the subject silhouette cannot
/// acquire new holes.
#[derive(Debug, Default)]
pub struct ChromaKeyMatter;

impl ForegroundMatter for ChromaKeyMatter {
    fn matte(&self, image: &RgbaImage) -> Result<RgbaImage, CleanupError> {
        let mut out = image.clone();
        for pixel in out.pixels_mut() {
            let confidence = backdrop_confidence(pixel);
            if confidence > 0 {
                let alpha = u32::from(pixel.0[3]) * u32::from(255 - confidence) / 255;
                pixel.0[3] = alpha as u8;
            }
        }
        Ok(out)
    }
}

/// Stage two: pulls residual key-color tint out of halo pixels. A pixel is a
/// halo candidate if its alpha is partial or its hue still sits in the key
/// band; its green channel is clamped to the red/blue envelope, alpha kept.
pub fn suppress_chroma_artifacts(image: &mut RgbaImage) {
    for pixel in image.pixels_mut() {
        let [r, g, b, a] = pixel.0;
        if a == 0 {
            continue;
        }
        let boundary = a < 255;
        let keyish = greenness(pixel) > GREENNESS_LOW;
        if (boundary || keyish) && g > r.max(b) {
            pixel.0[1] = r.max(b);
        }
    }
}

/// Two-stage background cleanup: matte extraction, then chroma-artifact
/// suppression. Operates on encoded image bytes and returns PNG bytes with
/// an alpha channel; dimensions are always preserved.
pub struct BackgroundCleaner {
    matter: Arc<dyn ForegroundMatter>,
}

impl BackgroundCleaner {
    pub fn new(matter: Arc<dyn ForegroundMatter>) -> Self {
        Self { matter }
    }

    pub fn clean(&self, image_bytes: &[u8]) -> Result<Vec<u8>, CleanupError> {
        let source = image::load_from_memory(image_bytes)?.to_rgba8();
        let (width, height) = source.dimensions();

        let mut matted = self.matter.matte(&source)?;
        if matted.dimensions() != (width, height) {
            let (mw, mh) = matted.dimensions();
            return Err(CleanupError::DimensionMismatch(width, height, mw, mh));
        }

        suppress_chroma_artifacts(&mut matted);
        debug!(width, height, "background cleanup complete");

        let mut buffer = Cursor::new(Vec::new());
        matted.write_to(&mut buffer, ImageFormat::Png)?;
        Ok(buffer.into_inner())
    }
}

impl Default for BackgroundCleaner {
    fn default() -> Self {
        Self::new(Arc::new(ChromaKeyMatter))
    }
}
