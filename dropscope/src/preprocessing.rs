//! Frame preprocessing: grayscale conversion, background correction,
//! thresholding and morphological cleanup into a binary motion mask

use crate::config::{BackgroundMethod, MorphOperation, PipelineConfig, ThresholdMethod};
use crate::error::{DropletError, Result};
use crate::types::{Frame, PixelFormat};
use image::GrayImage;
use ndarray::parallel::prelude::*;
use ndarray::{Array2, Axis};
use rayon::prelude::*;

/// Lifecycle of the background reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundState {
    /// Collecting warm-up frames for the median reference
    WarmingUp { collected: u32, required: u32 },
    Ready,
    /// Discarded; the next frame starts a new warm-up
    Resetting,
}

/// Result of preprocessing one frame
#[derive(Debug, Clone)]
pub enum PreprocessOutcome {
    /// Frame consumed by the background warm-up
    WarmingUp {
        collected: u32,
        required: u32,
        shape: (u32, u32),
    },
    /// Background discarded because the frame shape changed
    Reset {
        previous: (u32, u32),
        current: (u32, u32),
    },
    /// Binary motion mask (0 or 255)
    Mask(GrayImage),
}

impl PreprocessOutcome {
    /// The motion mask; all zero for the warm-up and reset cases
    pub fn into_mask(self) -> GrayImage {
        match self {
            PreprocessOutcome::WarmingUp {
                shape: (w, h), ..
            } => GrayImage::new(w, h),
            PreprocessOutcome::Reset {
                current: (w, h), ..
            } => GrayImage::new(w, h),
            PreprocessOutcome::Mask(mask) => mask,
        }
    }

    pub fn is_mask(&self) -> bool {
        matches!(self, PreprocessOutcome::Mask(_))
    }
}

/// Median reference built from the first frames after a (re)start
#[derive(Debug, Clone)]
pub struct BackgroundModel {
    state: BackgroundState,
    shape: Option<(u32, u32)>,
    samples: Vec<GrayImage>,
    reference: Option<GrayImage>,
}

impl BackgroundModel {
    pub fn new(required: u32) -> Self {
        Self {
            state: BackgroundState::WarmingUp {
                collected: 0,
                required,
            },
            shape: None,
            samples: Vec::new(),
            reference: None,
        }
    }

    pub fn state(&self) -> BackgroundState {
        self.state
    }

    pub fn shape(&self) -> Option<(u32, u32)> {
        self.shape
    }

    pub fn reference(&self) -> Option<&GrayImage> {
        self.reference.as_ref()
    }

    /// Drop the reference and samples; the next frame restarts the warm-up
    pub fn reset(&mut self) {
        self.state = BackgroundState::Resetting;
        self.shape = None;
        self.samples.clear();
        self.reference = None;
    }

    fn set_required(&mut self, required: u32) {
        if let BackgroundState::WarmingUp { collected, .. } = self.state {
            self.state = BackgroundState::WarmingUp {
                collected,
                required,
            };
        }
    }

    /// Add a warm-up sample; computes the median once enough are collected
    fn accumulate(&mut self, gray: &GrayImage, required: u32) -> Result<PreprocessOutcome> {
        let shape = gray.dimensions();
        if self.state == BackgroundState::Resetting {
            self.state = BackgroundState::WarmingUp {
                collected: 0,
                required,
            };
        }
        self.shape.get_or_insert(shape);
        self.samples.push(gray.clone());

        let collected = self.samples.len() as u32;
        if collected >= required {
            self.reference = Some(median_image(&self.samples)?);
            self.samples.clear();
            self.state = BackgroundState::Ready;
            log::info!(
                "Background ready: median of {} frames, shape {}x{}",
                collected,
                shape.0,
                shape.1
            );
        } else {
            self.state = BackgroundState::WarmingUp {
                collected,
                required,
            };
        }

        Ok(PreprocessOutcome::WarmingUp {
            collected,
            required,
            shape,
        })
    }

    /// Absolute difference against the reference
    fn difference(&self, gray: &GrayImage) -> Result<GrayImage> {
        let reference = self
            .reference
            .as_ref()
            .ok_or_else(|| DropletError::internal("background reference missing in Ready state"))?;
        if reference.dimensions() != gray.dimensions() {
            return Err(DropletError::ShapeMismatch {
                expected: reference.dimensions(),
                actual: gray.dimensions(),
            });
        }

        let data: Vec<u8> = gray
            .as_raw()
            .par_iter()
            .zip(reference.as_raw().par_iter())
            .map(|(&a, &b)| a.abs_diff(b))
            .collect();
        to_gray_image(gray.width(), gray.height(), data)
    }
}

/// Cached elliptical structuring element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuringElement {
    size: u32,
    offsets: Vec<(i32, i32)>,
}

impl StructuringElement {
    /// Disc of diameter `size` (odd); offsets with dx² + dy² <= r² + r/2
    pub fn ellipse(size: u32) -> Self {
        let r = (size.max(1) as i32 - 1) / 2;
        let limit = (r * r) as f64 + r as f64 / 2.0;
        let mut offsets = Vec::new();
        for dy in -r..=r {
            for dx in -r..=r {
                if ((dx * dx + dy * dy) as f64) <= limit {
                    offsets.push((dx, dy));
                }
            }
        }
        Self { size, offsets }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn offsets(&self) -> &[(i32, i32)] {
        &self.offsets
    }
}

/// Turns frames into binary motion masks
#[derive(Debug, Clone)]
pub struct Preprocessor {
    background: BackgroundModel,
    kernel: StructuringElement,
    background_method: BackgroundMethod,
    warmup_frames: u32,
    highpass_blur_radius: u32,
    threshold_method: ThresholdMethod,
    threshold_level: u8,
    adaptive_block_size: u32,
    adaptive_c: i32,
    morph_operation: MorphOperation,
}

impl Preprocessor {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            background: BackgroundModel::new(config.background_warmup_frames),
            kernel: StructuringElement::ellipse(config.morph_kernel_size),
            background_method: config.background_method,
            warmup_frames: config.background_warmup_frames,
            highpass_blur_radius: config.highpass_blur_radius,
            threshold_method: config.threshold_method,
            threshold_level: config.threshold_level,
            adaptive_block_size: config.adaptive_block_size,
            adaptive_c: config.adaptive_c,
            morph_operation: config.morph_operation,
        }
    }

    /// Apply new tunables. The kernel is rebuilt only when its size changes;
    /// switching the background method discards the reference.
    pub fn update_config(&mut self, config: &PipelineConfig) {
        if config.morph_kernel_size != self.kernel.size() {
            self.kernel = StructuringElement::ellipse(config.morph_kernel_size);
        }
        if config.background_method != self.background_method {
            self.background_method = config.background_method;
            self.background.reset();
        }
        self.warmup_frames = config.background_warmup_frames;
        self.background.set_required(config.background_warmup_frames);
        self.highpass_blur_radius = config.highpass_blur_radius;
        self.threshold_method = config.threshold_method;
        self.threshold_level = config.threshold_level;
        self.adaptive_block_size = config.adaptive_block_size;
        self.adaptive_c = config.adaptive_c;
        self.morph_operation = config.morph_operation;
    }

    pub fn background_state(&self) -> BackgroundState {
        match self.background_method {
            BackgroundMethod::Static => self.background.state(),
            BackgroundMethod::Highpass => BackgroundState::Ready,
        }
    }

    pub fn background(&self) -> &BackgroundModel {
        &self.background
    }

    pub fn kernel(&self) -> &StructuringElement {
        &self.kernel
    }

    pub fn reset_background(&mut self) {
        self.background.reset();
        log::info!("Background model reset");
    }

    /// Process a frame into a motion mask
    pub fn process(&mut self, frame: &Frame) -> Result<PreprocessOutcome> {
        let gray = to_grayscale(frame)?;
        self.process_gray(&gray)
    }

    /// Same as [`Preprocessor::process`] for an already converted frame
    pub fn process_gray(&mut self, gray: &GrayImage) -> Result<PreprocessOutcome> {
        let corrected = match self.background_method {
            BackgroundMethod::Highpass => highpass(gray, self.highpass_blur_radius),
            BackgroundMethod::Static => match self.background.state() {
                BackgroundState::WarmingUp { .. } | BackgroundState::Resetting => {
                    if let Some(previous) = self.background.shape() {
                        if previous != gray.dimensions() {
                            return Ok(self.shape_changed(previous, gray.dimensions()));
                        }
                    }
                    return self.background.accumulate(gray, self.warmup_frames);
                }
                BackgroundState::Ready => match self.background.difference(gray) {
                    Ok(diff) => diff,
                    Err(DropletError::ShapeMismatch { expected, actual }) => {
                        return Ok(self.shape_changed(expected, actual));
                    }
                    Err(e) => return Err(e),
                },
            },
        };

        let mask = match self.threshold_method {
            ThresholdMethod::Otsu => {
                threshold_binary(&corrected, imageproc::contrast::otsu_level(&corrected))
            }
            ThresholdMethod::Fixed => threshold_binary(&corrected, self.threshold_level),
            ThresholdMethod::Adaptive => {
                adaptive_threshold(&corrected, self.adaptive_block_size, self.adaptive_c)
            }
        };

        let mask = match self.morph_operation {
            MorphOperation::Open => open(&mask, &self.kernel),
            MorphOperation::Close => close(&mask, &self.kernel),
            MorphOperation::Both => close(&open(&mask, &self.kernel), &self.kernel),
            MorphOperation::None => mask,
        };

        Ok(PreprocessOutcome::Mask(mask))
    }

    fn shape_changed(&mut self, previous: (u32, u32), current: (u32, u32)) -> PreprocessOutcome {
        log::warn!(
            "Frame shape changed from {}x{} to {}x{}, resetting background",
            previous.0,
            previous.1,
            current.0,
            current.1
        );
        self.background.reset();
        PreprocessOutcome::Reset { previous, current }
    }
}

fn to_gray_image(width: u32, height: u32, data: Vec<u8>) -> Result<GrayImage> {
    GrayImage::from_raw(width, height, data).ok_or_else(|| {
        DropletError::internal(format!("buffer does not fit a {}x{} image", width, height))
    })
}

/// Convert a frame to single-channel intensity (ITU-R BT.601 weights)
pub fn to_grayscale(frame: &Frame) -> Result<GrayImage> {
    fn luma(r: u8, g: u8, b: u8) -> u8 {
        ((299 * r as u32 + 587 * g as u32 + 114 * b as u32 + 500) / 1000) as u8
    }

    let data: Vec<u8> = match frame.format {
        PixelFormat::Gray8 => frame.data.clone(),
        PixelFormat::Rgb8 => frame
            .data
            .par_chunks_exact(3)
            .map(|px| luma(px[0], px[1], px[2]))
            .collect(),
        PixelFormat::Bgr8 => frame
            .data
            .par_chunks_exact(3)
            .map(|px| luma(px[2], px[1], px[0]))
            .collect(),
        PixelFormat::Rgba8 => frame
            .data
            .par_chunks_exact(4)
            .map(|px| luma(px[0], px[1], px[2]))
            .collect(),
        PixelFormat::Bgra8 => frame
            .data
            .par_chunks_exact(4)
            .map(|px| luma(px[2], px[1], px[0]))
            .collect(),
    };
    to_gray_image(frame.width, frame.height, data)
}

/// Per-pixel median of equally sized images
pub fn median_image(samples: &[GrayImage]) -> Result<GrayImage> {
    let first = samples
        .first()
        .ok_or_else(|| DropletError::internal("median of zero background samples"))?;
    let (width, height) = first.dimensions();
    let pixels = (width * height) as usize;

    let mut flat = Vec::with_capacity(samples.len() * pixels);
    for sample in samples {
        if sample.dimensions() != (width, height) {
            return Err(DropletError::ShapeMismatch {
                expected: (width, height),
                actual: sample.dimensions(),
            });
        }
        flat.extend_from_slice(sample.as_raw());
    }
    let stack = Array2::from_shape_vec((samples.len(), pixels), flat)
        .map_err(|e| DropletError::internal(format!("background stack: {}", e)))?;

    let data: Vec<u8> = stack
        .axis_iter(Axis(1))
        .into_par_iter()
        .map(|column| {
            let mut values = column.to_vec();
            values.sort_unstable();
            let n = values.len();
            if n % 2 == 1 {
                values[n / 2]
            } else {
                ((values[n / 2 - 1] as u16 + values[n / 2] as u16) / 2) as u8
            }
        })
        .collect();

    to_gray_image(width, height, data)
}

/// Gaussian sigma for a (2 * radius + 1) kernel, the same rule OpenCV
/// applies when only the kernel size is given
pub fn gaussian_sigma(radius: u32) -> f32 {
    0.3 * (radius as f32 - 1.0) + 0.8
}

/// Intensity minus its Gaussian-blurred version, clamped at zero
pub fn highpass(gray: &GrayImage, radius: u32) -> GrayImage {
    let blurred = imageproc::filter::gaussian_blur_f32(gray, gaussian_sigma(radius.max(1)));
    let mut out = gray.clone();
    for (px, bl) in out.iter_mut().zip(blurred.iter()) {
        *px = px.saturating_sub(*bl);
    }
    out
}

/// Pixels strictly above `level` become 255, the rest 0
pub fn threshold_binary(gray: &GrayImage, level: u8) -> GrayImage {
    let mut out = gray.clone();
    for px in out.iter_mut() {
        *px = if *px > level { 255 } else { 0 };
    }
    out
}

/// Local mean thresholding: a pixel becomes 255 when it exceeds the mean of
/// its `block_size` x `block_size` neighbourhood minus `c`. Edges replicate.
pub fn adaptive_threshold(gray: &GrayImage, block_size: u32, c: i32) -> GrayImage {
    let radius = block_size / 2;
    let mean = imageproc::filter::box_filter(gray, radius, radius);
    let mut out = gray.clone();
    for (px, m) in out.iter_mut().zip(mean.iter()) {
        *px = if *px as i32 > *m as i32 - c { 255 } else { 0 };
    }
    out
}

/// Shared min/max filter over the structuring element.
/// Out-of-bounds neighbours are ignored.
fn morph_filter(mask: &GrayImage, kernel: &StructuringElement, dilate: bool) -> GrayImage {
    let (w, h) = mask.dimensions();
    let (wi, hi) = (w as i32, h as i32);
    let src = mask.as_raw();
    let mut out = vec![0u8; src.len()];

    out.par_chunks_mut(w as usize)
        .enumerate()
        .for_each(|(y, row)| {
            let y = y as i32;
            for (x, px) in row.iter_mut().enumerate() {
                let x = x as i32;
                let mut hit = !dilate;
                for &(dx, dy) in kernel.offsets() {
                    let (nx, ny) = (x + dx, y + dy);
                    if nx < 0 || ny < 0 || nx >= wi || ny >= hi {
                        continue;
                    }
                    let set = src[(ny * wi + nx) as usize] > 0;
                    if dilate && set {
                        hit = true;
                        break;
                    }
                    if !dilate && !set {
                        hit = false;
                        break;
                    }
                }
                *px = if hit { 255 } else { 0 };
            }
        });

    GrayImage::from_raw(w, h, out).unwrap_or_else(|| GrayImage::new(w, h))
}

pub fn erode(mask: &GrayImage, kernel: &StructuringElement) -> GrayImage {
    morph_filter(mask, kernel, false)
}

pub fn dilate(mask: &GrayImage, kernel: &StructuringElement) -> GrayImage {
    morph_filter(mask, kernel, true)
}

/// Erode then dilate; removes speckle smaller than the kernel
pub fn open(mask: &GrayImage, kernel: &StructuringElement) -> GrayImage {
    dilate(&erode(mask, kernel), kernel)
}

/// Dilate then erode; fills small holes
pub fn close(mask: &GrayImage, kernel: &StructuringElement) -> GrayImage {
    erode(&dilate(mask, kernel), kernel)
}
