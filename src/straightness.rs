//! Reference sequences between two anchors, and how far a trajectory strays from a line.
//!
//! All sequences here have shape `[n_steps + 1, C, H, W]` and are built from anchors of shape
//! `[1, C, H, W]`. Outputs keep the device and float dtype of the inputs.
//!
//! - `make_straight_line`: pixel-space linear interpolation (the "pixelfade")
//! - `translation_sequence`: one-pixel circular shifts along the width axis
//! - `sample_brownian_bridge`: a random walk pinned at both anchors
//! - `deviation_from_line`: distance along / distance from the chord joining the first and last
//!   frames

use burn_core as burn;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::tensor_ops::{frames_as_rows, host_vec, scalar_f64, tensor_like};
use crate::{Error, Result};

pub(crate) fn validate_unbatched<B: Backend>(t: &Tensor<B, 4>) -> Result<()> {
    let dims = t.dims();
    if dims[0] != 1 {
        return Err(Error::Shape(format!(
            "input_tensor batch dimension must be 1, but got shape {dims:?}"
        )));
    }
    Ok(())
}

fn validate_endpoints<B: Backend>(
    start: &Tensor<B, 4>,
    stop: &Tensor<B, 4>,
    n_steps: usize,
) -> Result<()> {
    validate_unbatched(start)?;
    validate_unbatched(stop)?;
    if start.dims() != stop.dims() {
        return Err(Error::Shape(format!(
            "start and stop must be same shape, but got {:?} and {:?}",
            start.dims(),
            stop.dims()
        )));
    }
    if n_steps == 0 {
        return Err(Error::Domain("n_steps must be positive, but got 0".to_string()));
    }
    Ok(())
}

/// Straight line between `start` and `stop` in signal space.
///
/// Frame `i` is \(x_0 + \tfrac{i}{N}(x_N - x_0)\) for \(N\) = `n_steps`; the first and last frames
/// are `start` and `stop` themselves (bit-identical).
pub fn make_straight_line<B: Backend>(
    start: Tensor<B, 4>,
    stop: Tensor<B, 4>,
    n_steps: usize,
) -> Result<Tensor<B, 4>> {
    validate_endpoints(&start, &stop, n_steps)?;

    let delta = stop.clone() - start.clone();
    let mut frames = Vec::with_capacity(n_steps + 1);
    frames.push(start.clone());
    for i in 1..n_steps {
        let t = i as f64 / n_steps as f64;
        frames.push(start.clone() + delta.clone().mul_scalar(t));
    }
    frames.push(stop);
    Ok(Tensor::cat(frames, 0))
}

/// Translate `image` by one pixel per step (circularly) along the width axis.
///
/// Frame `k` is `image` rolled by `k` columns: column `j` of frame `k` is column `j - k`
/// (mod width) of the input.
pub fn translation_sequence<B: Backend>(image: Tensor<B, 4>, n_steps: usize) -> Result<Tensor<B, 4>> {
    validate_unbatched(&image)?;
    if n_steps == 0 {
        return Err(Error::Domain("n_steps must be positive, but got 0".to_string()));
    }
    let width = image.dims()[3];
    if width == 0 {
        return Err(Error::Shape("image must have a non-empty width axis".to_string()));
    }

    let frames = (0..=n_steps)
        .map(|shift| {
            let s = shift % width;
            if s == 0 {
                image.clone()
            } else {
                Tensor::cat(
                    vec![
                        image.clone().narrow(3, width - s, s),
                        image.clone().narrow(3, 0, width - s),
                    ],
                    3,
                )
            }
        })
        .collect();
    Ok(Tensor::cat(frames, 0))
}

/// Sample a Brownian bridge from `start` to `stop`.
///
/// With \(D = C \cdot H \cdot W\) and \(\Delta t = 1/N\), increments are
/// \(dW_k \sim \sigma\,\mathcal N(0, I_D)\) with \(\sigma = 2\,\text{max\_norm}\sqrt{\Delta t / D}\);
/// the walk \(W_k = x_0 + \sum_{j \le k} dW_j\) is pinned by \(B_k = W_k - t_k (W_N - x_N)\).
///
/// The scaling makes the expected deviation from the straight line at the midpoint have norm
/// about `max_norm`. The noise is drawn on the host from `ChaCha8Rng::seed_from_u64(seed)`.
pub fn sample_brownian_bridge<B: Backend>(
    start: Tensor<B, 4>,
    stop: Tensor<B, 4>,
    n_steps: usize,
    max_norm: f64,
    seed: u64,
) -> Result<Tensor<B, 4>> {
    validate_endpoints(&start, &stop, n_steps)?;
    if !(max_norm >= 0.0) {
        return Err(Error::Domain(format!(
            "max_norm must be non-negative, but got {max_norm}"
        )));
    }

    let [_, c, h, w] = start.dims();
    let d = c * h * w;
    let dt = 1.0 / n_steps as f64;
    let sigma = (dt / d as f64).sqrt() * 2.0 * max_norm;

    let x0 = host_vec(start.clone());
    let x1 = host_vec(stop);

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut walk = Array2::<f64>::zeros((n_steps + 1, d));
    for k in 0..d {
        walk[[0, k]] = x0[k];
    }
    for i in 1..=n_steps {
        for k in 0..d {
            let z: f64 = StandardNormal.sample(&mut rng);
            walk[[i, k]] = walk[[i - 1, k]] + sigma * z;
        }
    }

    // Pin the far end: subtract the linearly-growing share of the final miss.
    let mut bridge = Vec::with_capacity((n_steps + 1) * d);
    for i in 0..=n_steps {
        let t = i as f64 / n_steps as f64;
        for k in 0..d {
            let v = if i == n_steps {
                x1[k]
            } else {
                walk[[i, k]] - t * (walk[[n_steps, k]] - x1[k])
            };
            bridge.push(v);
        }
    }

    Ok(tensor_like(bridge, [n_steps + 1, c, h, w], &start))
}

/// Decompose a trajectory into distance along, and distance from, its chord.
///
/// Frames are flattened to vectors \(y_k\). With \(u = (y_N - y_0)/\|y_N - y_0\|\):
///
/// - along: \((y_k - y_0) \cdot u\)
/// - from: \(\|(y_k - y_0) - ((y_k - y_0)\cdot u)\,u\|\)
///
/// If `normalize`, both are divided by the chord length \(\|y_N - y_0\|\), so a straight,
/// evenly-spaced trajectory gives along \(= k/N\) and from \(= 0\).
///
/// Returns two tensors of length `sequence.dims()[0]`.
pub fn deviation_from_line<B: Backend, const D: usize>(
    sequence: Tensor<B, D>,
    normalize: bool,
) -> Result<(Tensor<B, 1>, Tensor<B, 1>)> {
    match chord_coordinates(sequence, normalize)? {
        Chord::Defined(along, from) => Ok((along, from)),
        Chord::Degenerate(chord_length) => Err(Error::Domain(format!(
            "first and last frames must differ to define a line (chord length {chord_length})"
        ))),
    }
}

/// [`deviation_from_line`] on the host, with NaN curves when the chord has zero or non-finite
/// length. Snapshots and plots use this so a model that maps both anchors to the same point
/// still gets a record.
pub(crate) fn deviation_from_line_or_nan<B: Backend, const D: usize>(
    sequence: Tensor<B, D>,
    normalize: bool,
) -> Result<(Vec<f64>, Vec<f64>)> {
    let n = sequence.dims()[0];
    match chord_coordinates(sequence, normalize)? {
        Chord::Defined(along, from) => Ok((host_vec(along), host_vec(from))),
        Chord::Degenerate(_) => Ok((vec![f64::NAN; n], vec![f64::NAN; n])),
    }
}

enum Chord<B: Backend> {
    Defined(Tensor<B, 1>, Tensor<B, 1>),
    Degenerate(f64),
}

fn chord_coordinates<B: Backend, const D: usize>(
    sequence: Tensor<B, D>,
    normalize: bool,
) -> Result<Chord<B>> {
    let n = sequence.dims()[0];
    if n < 2 {
        return Err(Error::Shape(format!(
            "sequence must have at least 2 frames, but got {n}"
        )));
    }

    let y = frames_as_rows(sequence);
    let y0 = y.clone().narrow(0, 0, 1);
    let chord = y.clone().narrow(0, n - 1, 1) - y0.clone();
    let chord_length = scalar_f64(chord.clone().powf_scalar(2.0).sum().sqrt());
    if !(chord_length > 0.0) || !chord_length.is_finite() {
        return Ok(Chord::Degenerate(chord_length));
    }
    let unit = chord.div_scalar(chord_length);

    let centered = y - y0;
    let along = centered.clone().matmul(unit.clone().transpose());
    let projection = along.clone().matmul(unit);
    let from = (centered - projection).powf_scalar(2.0).sum_dim(1).sqrt();

    let along = along.reshape([n]);
    let from = from.reshape([n]);
    if normalize {
        Ok(Chord::Defined(
            along.div_scalar(chord_length),
            from.div_scalar(chord_length),
        ))
    } else {
        Ok(Chord::Defined(along, from))
    }
}
