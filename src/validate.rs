//! Input checks for anchors and models, and the pixel-range penalty.

use burn_core as burn;

use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;

use crate::model::AnalysisModel;
use crate::straightness::validate_unbatched;
use crate::tensor_ops::{host_vec, scalar_f64};
use crate::{Error, Result};

/// Check an anchor image: batch dimension 1, finite values, and (optionally) every value inside
/// the inclusive `allowed_range`.
pub fn validate_input<B: Backend>(
    image: &Tensor<B, 4>,
    allowed_range: Option<(f64, f64)>,
) -> Result<()> {
    validate_unbatched(image)?;
    // Reductions may skip NaN, so scan every value.
    if !host_vec(image.clone()).iter().all(|v| v.is_finite()) {
        return Err(Error::Domain("input must contain only finite values".to_string()));
    }
    let lo = scalar_f64(image.clone().min());
    let hi = scalar_f64(image.clone().max());
    if let Some((min, max)) = allowed_range {
        if min >= max {
            return Err(Error::Domain(format!(
                "allowed_range[0] must be strictly less than allowed_range[1], but got {allowed_range:?}"
            )));
        }
        if lo < min || hi > max {
            return Err(Error::Domain(format!(
                "input range must lie within {allowed_range:?}, but got ({lo}, {hi})"
            )));
        }
    }
    Ok(())
}

/// Check that `model` accepts `image`, keeps one representation frame per input frame, returns
/// finite values in the input's dtype, and passes gradients back to its input.
pub fn validate_model<B: AutodiffBackend, M: AnalysisModel<B>>(
    model: &M,
    image: &Tensor<B, 4>,
) -> Result<()> {
    let x = Tensor::<B, 4>::from_inner(image.clone().inner()).require_grad();
    let y = model.forward(x.clone());

    if y.dims()[0] != x.dims()[0] {
        return Err(Error::Shape(format!(
            "model changed the number of frames: {:?} -> {:?}",
            x.dims(),
            y.dims()
        )));
    }
    if y.dtype() != x.dtype() {
        return Err(Error::Domain(format!(
            "model changed precision: {:?} -> {:?}",
            x.dtype(),
            y.dtype()
        )));
    }
    let total = scalar_f64(y.clone().sum().detach());
    if !total.is_finite() {
        return Err(Error::Domain("model returned non-finite values".to_string()));
    }

    let grads = y.sum().backward();
    if x.grad(&grads).is_none() {
        return Err(Error::Domain(
            "model must be differentiable with respect to its input".to_string(),
        ));
    }
    Ok(())
}

/// Squared distance of every element to the inclusive `allowed_range`, summed.
///
/// Values inside the range contribute nothing; a value `v > max` contributes `(v - max)^2`, a
/// value `v < min` contributes `(v - min)^2`.
pub fn penalize_range<B: Backend, const D: usize>(
    t: Tensor<B, D>,
    allowed_range: (f64, f64),
) -> Tensor<B, 1> {
    let (min, max) = allowed_range;
    let below = t.clone().sub_scalar(min).clamp_max(0.0);
    let above = t.sub_scalar(max).clamp_min(0.0);
    (below.powf_scalar(2.0) + above.powf_scalar(2.0)).sum()
}
