//! Small tensor helpers shared by the primitives and the engine.

use burn_core as burn;

use burn::tensor::backend::Backend;
use burn::tensor::{DType, FloatDType, Tensor, TensorData};

/// First finite difference along `dim`: `t[k+1] - t[k]`.
///
/// `t.dims()[dim]` must be at least 2.
pub(crate) fn diff<B: Backend, const D: usize>(t: Tensor<B, D>, dim: usize) -> Tensor<B, D> {
    let n = t.dims()[dim];
    debug_assert!(n >= 2, "diff needs at least two slices along dim {dim}");
    t.clone().narrow(dim, 1, n - 1) - t.narrow(dim, 0, n - 1)
}

/// Flatten every frame of `[n, ...]` into a row of a `[n, m]` matrix.
pub(crate) fn frames_as_rows<B: Backend, const D: usize>(t: Tensor<B, D>) -> Tensor<B, 2> {
    let dims = t.dims();
    let n = dims[0];
    let m: usize = dims[1..].iter().product();
    t.reshape([n, m])
}

/// Squared L2 norm of each frame, shape `[n]`.
pub(crate) fn frame_sq_norms<B: Backend, const D: usize>(t: Tensor<B, D>) -> Tensor<B, 1> {
    let n = t.dims()[0];
    frames_as_rows(t).powf_scalar(2.0).sum_dim(1).reshape([n])
}

/// L2 norm of the whole tensor, as a host scalar.
pub(crate) fn l2_norm<B: Backend, const D: usize>(t: Tensor<B, D>) -> f64 {
    scalar_f64(t.powf_scalar(2.0).sum().sqrt())
}

/// Read a single-element tensor back to the host as `f64`, whatever its dtype.
pub(crate) fn scalar_f64<B: Backend>(t: Tensor<B, 1>) -> f64 {
    t.into_data().iter::<f64>().next().unwrap_or(f64::NAN)
}

/// Copy a tensor to a host `Vec<f64>` in row-major order.
pub(crate) fn host_vec<B: Backend, const D: usize>(t: Tensor<B, D>) -> Vec<f64> {
    t.into_data().iter::<f64>().collect()
}

/// Exact element-wise equality (same shape, every element `==`).
pub(crate) fn exactly_equal<B: Backend, const D: usize>(a: Tensor<B, D>, b: Tensor<B, D>) -> bool {
    if a.dims() != b.dims() {
        return false;
    }
    let a = a.into_data();
    let b = b.into_data();
    let equal = a.iter::<f64>().zip(b.iter::<f64>()).all(|(x, y)| x == y);
    equal
}

/// The float dtype a tensor currently holds (`F32` for anything unrecognized).
pub(crate) fn float_dtype<B: Backend, const D: usize>(t: &Tensor<B, D>) -> FloatDType {
    match t.dtype() {
        DType::F64 => FloatDType::F64,
        DType::F16 => FloatDType::F16,
        DType::BF16 => FloatDType::BF16,
        _ => FloatDType::F32,
    }
}

/// Machine epsilon of a float dtype.
pub(crate) fn machine_epsilon(dtype: FloatDType) -> f64 {
    match dtype {
        FloatDType::F64 => f64::EPSILON,
        FloatDType::F16 => 9.765_625e-4,
        FloatDType::BF16 => 7.812_5e-3,
        _ => f32::EPSILON as f64,
    }
}

/// Upload host values as a tensor with the device and float dtype of `like`.
pub(crate) fn tensor_like<B: Backend, const D: usize, const E: usize>(
    values: Vec<f64>,
    shape: [usize; D],
    like: &Tensor<B, E>,
) -> Tensor<B, D> {
    let t = Tensor::<B, D>::from_data(TensorData::new(values, shape), &like.device());
    if t.dtype() == like.dtype() {
        t
    } else {
        t.cast(float_dtype(like))
    }
}

/// `allclose` with an absolute floor, false on shape mismatch.
pub(crate) fn all_close<B: Backend, const D: usize>(
    a: Tensor<B, D>,
    b: Tensor<B, D>,
    rtol: f64,
) -> bool {
    if a.dims() != b.dims() {
        return false;
    }
    let a = host_vec(a);
    let b = host_vec(b);
    a.iter()
        .zip(b.iter())
        .all(|(&x, &y)| scalars_close(x, y, rtol))
}

/// `|x - y| <= atol + rtol * |y|` with a fixed `atol = 1e-8`.
pub(crate) fn scalars_close(x: f64, y: f64, rtol: f64) -> bool {
    (x - y).abs() <= 1e-8 + rtol * y.abs()
}
