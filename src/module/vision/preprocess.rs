//! Image Preprocessing
//!
//! Turns a decoded image into the fixed-shape tensor a backend declares in its
//! `InputContract`. Tensors are counted by a `TensorLedger` and released on drop,
//! so every exit path of a backend gives its buffers back exactly once.

use image::{imageops::FilterType, io::Reader, DynamicImage, Pixel, RgbImage};
use ndarray::{Array, ArrayD, ArrayViewD, IxDyn};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::module::error::{InferenceError, PreprocessError};

/// How the source image is fitted into the square model input.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizePolicy {
    /// Resize both axes independently. Aspect ratio is not preserved but the
    /// whole frame stays visible, so box coordinates map straight back.
    Stretch,
    /// Scale to cover the target and center-crop the overflow.
    Cover,
}

/// Value range the model expects.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalization {
    /// Pixel values divided by 255, range [0, 1].
    Unit,
    /// Raw pixel values, range [0, 255]. For models with an internal rescaling layer.
    Raw,
}

/// Memory layout of a tensor.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// [batch, height, width, channels]
    Nhwc,
    /// [batch, channels, height, width]
    Nchw,
    /// Model output, shape defined by the model.
    Output,
}

/// Input contract declared by a backend.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputContract {
    pub size: u32,
    pub resize: ResizePolicy,
    pub normalization: Normalization,
    /// Layout the model consumes. Preprocessing always yields NHWC.
    pub layout: Layout,
}

impl InputContract {
    pub const CHANNELS: usize = 3;
}

/// Counts live tensors.
///
#[derive(Debug, Default)]
pub struct TensorLedger {
    live: AtomicUsize,
    allocated: AtomicU64,
}

impl TensorLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tensors currently alive.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Tensors ever allocated.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::SeqCst)
    }

    fn acquire(&self) {
        self.live.fetch_add(1, Ordering::SeqCst);
        self.allocated.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Numeric buffer owned by the call that created it. Released on drop.
///
#[derive(Debug)]
pub struct Tensor {
    data: ArrayD<f32>,
    normalization: Normalization,
    layout: Layout,
    ledger: Arc<TensorLedger>,
}

impl Tensor {
    fn new(
        data: ArrayD<f32>,
        normalization: Normalization,
        layout: Layout,
        ledger: Arc<TensorLedger>,
    ) -> Self {
        ledger.acquire();
        Self {
            data,
            normalization,
            layout,
            ledger,
        }
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn view(&self) -> ArrayViewD<'_, f32> {
        self.data.view()
    }

    /// New tensor on the same ledger, e.g. a model output.
    pub fn derive(&self, data: ArrayD<f32>, layout: Layout) -> Tensor {
        Tensor::new(data, self.normalization, layout, Arc::clone(&self.ledger))
    }

    /// Copy into another layout. Only NHWC <-> NCHW are supported.
    pub fn to_layout(&self, layout: Layout) -> Result<Tensor, InferenceError> {
        if layout == self.layout {
            return Ok(self.derive(self.data.clone(), layout));
        }
        let axes = match (self.layout, layout) {
            (Layout::Nhwc, Layout::Nchw) => [0, 3, 1, 2],
            (Layout::Nchw, Layout::Nhwc) => [0, 2, 3, 1],
            (from, to) => {
                return Err(InferenceError::Contract(format!(
                    "can't convert {:?} to {:?}",
                    from, to
                )))
            }
        };
        if self.data.ndim() != 4 {
            return Err(InferenceError::Contract(format!(
                "expected 4 dimensions, got {:?}",
                self.shape()
            )));
        }
        let permuted = self
            .data
            .view()
            .permuted_axes(IxDyn(&axes))
            .as_standard_layout()
            .into_owned();
        Ok(self.derive(permuted, layout))
    }

    /// Rejects a tensor that was not produced for `contract`.
    ///
    /// A tensor with the wrong value range would still run and silently
    /// mispredict, so this is checked before every model call.
    pub fn check_contract(&self, contract: &InputContract) -> Result<(), InferenceError> {
        let sz = contract.size as usize;
        let expected = [1, sz, sz, InputContract::CHANNELS];
        if self.layout != Layout::Nhwc || self.shape() != expected {
            return Err(InferenceError::Contract(format!(
                "expected NHWC {:?}, got {:?} {:?}",
                expected,
                self.layout,
                self.shape()
            )));
        }
        if self.normalization != contract.normalization {
            return Err(InferenceError::Contract(format!(
                "expected {:?} values, got {:?}",
                contract.normalization, self.normalization
            )));
        }
        Ok(())
    }

    /// Rebuilds an 8-bit RGB image from an NHWC tensor.
    pub fn to_rgb_image(&self) -> Result<RgbImage, InferenceError> {
        let shape = self.shape();
        if self.layout != Layout::Nhwc || shape.len() != 4 || shape[3] != 3 {
            return Err(InferenceError::Contract(format!(
                "can't rebuild image from {:?} {:?}",
                self.layout, shape
            )));
        }
        let (h, w) = (shape[1], shape[2]);
        let scale = match self.normalization {
            Normalization::Unit => 255.0,
            Normalization::Raw => 1.0,
        };
        let view = self.view();
        Ok(RgbImage::from_fn(w as u32, h as u32, |x, y| {
            let px = |c: usize| {
                let v = view[[0, y as usize, x as usize, c]] * scale;
                v.round().clamp(0.0, 255.0) as u8
            };
            image::Rgb([px(0), px(1), px(2)])
        }))
    }
}

impl Drop for Tensor {
    fn drop(&mut self) {
        self.ledger.release();
    }
}

/// Image preprocessor shared by all backends.
///
#[derive(Debug, Clone, Default)]
pub struct Preprocessor {
    ledger: Arc<TensorLedger>,
}

impl Preprocessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ledger(&self) -> Arc<TensorLedger> {
        Arc::clone(&self.ledger)
    }

    /// Decode an encoded image (JPEG, PNG, ...).
    pub fn decode(bytes: &[u8]) -> Result<DynamicImage, PreprocessError> {
        let img = Reader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|source| PreprocessError::Read {
                path: "<memory>".to_owned(),
                source,
            })?
            .decode()?;
        Ok(img)
    }

    /// Load and decode an image file.
    pub fn open(path: &Path) -> Result<DynamicImage, PreprocessError> {
        let bytes = std::fs::read(path).map_err(|source| PreprocessError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::decode(&bytes)
    }

    /// Resize and normalize `image` into a [1, size, size, 3] tensor.
    pub fn preprocess(
        &self,
        image: &DynamicImage,
        contract: &InputContract,
    ) -> Result<Tensor, PreprocessError> {
        let sz = contract.size;
        if sz == 0 {
            return Err(PreprocessError::TargetSize(sz));
        }
        if image.width() == 0 || image.height() == 0 {
            return Err(PreprocessError::Empty {
                width: image.width(),
                height: image.height(),
            });
        }
        // Alpha is dropped by the RGB conversion.
        let img: RgbImage = match contract.resize {
            ResizePolicy::Stretch => image.resize_exact(sz, sz, FilterType::Triangle),
            ResizePolicy::Cover => image.resize_to_fill(sz, sz, FilterType::Triangle),
        }
        .to_rgb8();

        let scale = match contract.normalization {
            Normalization::Unit => 1.0 / 255.0,
            Normalization::Raw => 1.0,
        };
        let array = Array::from_shape_fn(
            (1, sz as usize, sz as usize, InputContract::CHANNELS),
            |(_, y, x, c)| {
                let pixel = img.get_pixel(x as u32, y as u32);
                pixel.channels()[c] as f32 * scale
            },
        )
        .into_dyn();
        Ok(Tensor::new(
            array,
            contract.normalization,
            Layout::Nhwc,
            Arc::clone(&self.ledger),
        ))
    }
}
