//! The analysis-model seam, plus two reference models.
//!
//! A model maps a sequence of images `[n, C, H, W]` to a representation `[n, C', H', W']`, one
//! representation frame per image. It must be differentiable with respect to its input on an
//! autodiff backend; its own weights are treated as constants (no model training happens here).

use burn_core as burn;

use burn::tensor::backend::Backend;
use burn::tensor::module::conv2d;
use burn::tensor::ops::ConvOptions;
use burn::tensor::{FloatDType, Tensor, TensorData};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::{Error, Result};

/// A differentiable analysis model.
///
/// `to_device` and `cast` must move/cast every tensor the model holds, so that a migrated engine
/// evaluates the model on the same device and precision as its frames.
pub trait AnalysisModel<B: Backend> {
    /// Representation of every frame of `sequence`.
    fn forward(&self, sequence: Tensor<B, 4>) -> Tensor<B, 4>;

    /// Move the model's tensors to `device`.
    fn to_device(self, device: &B::Device) -> Self
    where
        Self: Sized;

    /// Cast the model's floating-point tensors to `dtype`.
    fn cast(self, dtype: FloatDType) -> Self
    where
        Self: Sized;
}

/// The identity model: the representation is the signal itself.
///
/// Under this model the geodesic is the pixel-space straight line.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl<B: Backend> AnalysisModel<B> for Identity {
    fn forward(&self, sequence: Tensor<B, 4>) -> Tensor<B, 4> {
        sequence
    }

    fn to_device(self, _device: &B::Device) -> Self {
        self
    }

    fn cast(self, _dtype: FloatDType) -> Self {
        self
    }
}

/// A frozen convolutional front end: `tanh(conv2d(x, W) + b)`.
///
/// Weights are drawn once from a seeded `ChaCha8Rng` with variance `1 / fan_in`; the same seed
/// always builds the same model. Padding keeps the spatial size.
#[derive(Debug, Clone)]
pub struct ConvFrontEnd<B: Backend> {
    weight: Tensor<B, 4>,
    bias: Tensor<B, 1>,
    padding: usize,
}

impl<B: Backend> ConvFrontEnd<B> {
    /// `kernel` must be odd so that the padding is symmetric.
    pub fn new(
        device: &B::Device,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        seed: u64,
    ) -> Result<Self> {
        if kernel % 2 == 0 {
            return Err(Error::Domain(format!(
                "kernel size must be odd to keep the spatial size, but got {kernel}"
            )));
        }
        let fan_in = (in_channels * kernel * kernel) as f32;
        let scale = 1.0 / fan_in.sqrt();

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let n_weights = out_channels * in_channels * kernel * kernel;
        let weights: Vec<f32> = (0..n_weights)
            .map(|_| {
                let z: f32 = StandardNormal.sample(&mut rng);
                scale * z
            })
            .collect();
        let biases: Vec<f32> = (0..out_channels)
            .map(|_| {
                let z: f32 = StandardNormal.sample(&mut rng);
                0.1 * z
            })
            .collect();

        let weight = Tensor::from_data(
            TensorData::new(weights, [out_channels, in_channels, kernel, kernel]),
            device,
        );
        let bias = Tensor::from_data(TensorData::new(biases, [out_channels]), device);
        Ok(Self {
            weight,
            bias,
            padding: kernel / 2,
        })
    }

    pub fn out_channels(&self) -> usize {
        self.weight.dims()[0]
    }
}

impl<B: Backend> AnalysisModel<B> for ConvFrontEnd<B> {
    fn forward(&self, sequence: Tensor<B, 4>) -> Tensor<B, 4> {
        let options = ConvOptions::new([1, 1], [self.padding, self.padding], [1, 1], 1);
        conv2d(
            sequence,
            self.weight.clone(),
            Some(self.bias.clone()),
            options,
        )
        .tanh()
    }

    fn to_device(self, device: &B::Device) -> Self {
        Self {
            weight: self.weight.to_device(device),
            bias: self.bias.to_device(device),
            padding: self.padding,
        }
    }

    fn cast(self, dtype: FloatDType) -> Self {
        Self {
            weight: self.weight.cast(dtype),
            bias: self.bias.cast(dtype),
            padding: self.padding,
        }
    }
}
