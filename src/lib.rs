//! # geodesics
//!
//! Approximate geodesics between two signals in the representation space of a model.
//!
//! Given two anchor images and a differentiable analysis model \(f\), this crate optimizes the
//! interior frames of a discretized sequence \(x_0, \dots, x_N\) (with \(x_0, x_N\) pinned to the
//! anchors) to minimize the representational path energy
//!
//! \[
//! E(x) = \sum_{k=1}^{N} \| f(x_k) - f(x_{k-1}) \|_2^2,
//! \]
//!
//! plus a weighted penalty that keeps pixel values in an allowed range.
//!
//! This crate is intentionally small:
//!
//! - it implements the **optimization engine** ([`geodesic::Geodesic`]) and the geometric
//!   primitives it relies on (straight lines, Brownian bridges, deviation from a line, unwrap),
//! - it uses `burn` for tensors and reverse-mode autodiff, and `ndarray` for host-side data,
//! - it does not render plots; it exposes the data series a plotting layer needs.
//!
//! ## Public invariants (must not change)
//!
//! - **Endpoints are pinned**: only the interior frames are ever handed to an optimizer.
//! - **Determinism knobs are explicit**: stochastic helpers take a `seed`.
//! - **Snapshots live on the host**: stored step energies and deviations are `ndarray` arrays,
//!   never backend tensors.
//! - **Non-finite loss is fatal**: synthesis stops with [`Error::NonFiniteLoss`]; it never retries.
//!
//! ## Caveat
//!
//! The result is a local critical point of the path energy. Depending on the geometry of the
//! representation, geodesics between two anchors need not be unique, and the one found depends on
//! the initialization.
//!
//! ## References
//!
//! - Hénaff & Simoncelli, *Geodesics of learned representations* (ICLR 2016).
//!
//! ## Module map
//!
//! - `straightness`: straight lines, translation sequences, Brownian bridges, deviation from line
//! - `unwrap`: phase unwrapping along any axis of an n-dimensional array
//! - `vjp`: vector–Jacobian products via reverse-mode autodiff
//! - `validate`: anchor/model validation and the range penalty
//! - `convergence`: pixel-change stopping rule
//! - `model`: the `AnalysisModel` seam plus two reference models
//! - `optim`: the `SequenceOptimizer` seam, AMSGrad, and an adapter for `burn_optim` optimizers
//! - `config`: engine and synthesis configuration
//! - `geodesic`: the optimization engine
//! - `record`: save/load with consistency checks
//! - `diagnostics`: deviation curves for plotting

use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;

pub mod config;
pub mod convergence;
pub mod diagnostics;
pub mod geodesic;
pub mod model;
pub mod optim;
pub mod record;
pub mod straightness;
pub mod unwrap;
pub mod validate;
pub mod vjp;

mod tensor_ops;

pub use config::{GeodesicConfig, SynthesisConfig};
pub use geodesic::{Geodesic, SynthesisOutcome, SynthesisStatus};
pub use model::{AnalysisModel, ConvFrontEnd, Identity};
pub use optim::{AmsGrad, AmsGradConfig, BurnOptimizer, Evaluation, InteriorFrames, SequenceOptimizer};

/// Default backend: ndarray on the CPU, with autodiff.
pub type GeodesicBackend = Autodiff<NdArray<f32>>;

/// geodesics error variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shape mismatch: {0}")]
    Shape(String),
    #[error("domain error: {0}")]
    Domain(String),
    #[error("found a non-finite loss during optimization (iteration {iteration})")]
    NonFiniteLoss { iteration: usize },
    #[error("saved state is inconsistent with this object: {0}")]
    Inconsistent(String),
    #[error("an optimizer is already set; resumed synthesis must not supply a new one")]
    OptimizerAlreadySet,
    #[error("no gradient was produced for {0}")]
    MissingGradient(&'static str),
    #[error("persistence error: {0}")]
    Persistence(String),
}

pub type Result<T> = std::result::Result<T, Error>;
