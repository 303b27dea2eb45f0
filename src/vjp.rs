//! Vector–Jacobian products through burn's reverse-mode autodiff.
//!
//! For \(y = f(x)\) and a direction \(a\) shaped like \(y\), the product
//! \(a^\top \tfrac{\partial y}{\partial x}\) is the gradient of \(\langle y, a \rangle\) with respect
//! to \(x\) when \(a\) is held constant. One backward pass gives it.
//!
//! A burn backward pass consumes the graph it walks. Each call therefore needs a graph built for
//! it: callers recompute `y` from a leaf `x` (see `Geodesic::calculate_jerkiness`). The result lives
//! on `B::InnerBackend`; with a nested backend such as `Autodiff<Autodiff<NdArray>>` that inner
//! backend is itself autodiff, and the product can be differentiated again.

use burn_core as burn;

use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Tensor;

use crate::{Error, Result};

/// \(a^\top \partial y / \partial x\), shaped like `x`.
///
/// `x` must be a tracked leaf (`require_grad`) that `y` was computed from, and `a` must have
/// the shape of `y`. `a` is detached before use, so no gradient flows into it.
pub fn vector_jacobian_product<B: AutodiffBackend, const DX: usize, const DY: usize>(
    y: Tensor<B, DY>,
    x: &Tensor<B, DX>,
    a: Tensor<B, DY>,
) -> Result<Tensor<B::InnerBackend, DX>> {
    if y.dims() != a.dims() {
        return Err(Error::Shape(format!(
            "direction must match the output shape: {:?} vs {:?}",
            a.dims(),
            y.dims()
        )));
    }
    let grads = (y * a.detach()).sum().backward();
    x.grad(&grads).ok_or(Error::MissingGradient("vector-jacobian input"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor_ops::host_vec;
    use crate::GeodesicBackend;
    use burn::tensor::backend::Backend;
    use burn_autodiff::Autodiff;
    use burn::tensor::TensorData;

    type B = GeodesicBackend;

    fn device() -> <B as Backend>::Device {
        <B as Backend>::Device::default()
    }

    fn leaf(values: Vec<f32>, shape: [usize; 2]) -> Tensor<B, 2> {
        Tensor::<B, 2>::from_data(TensorData::new(values, shape), &device()).require_grad()
    }

    #[test]
    fn vjp_of_identity_is_the_direction() -> Result<()> {
        let x = leaf(vec![1.0, -2.0, 0.5, 3.0], [2, 2]);
        let a = Tensor::<B, 2>::from_data(TensorData::new(vec![0.1f32, 0.2, 0.3, 0.4], [2, 2]), &device());
        let g = vector_jacobian_product(x.clone(), &x, a)?;
        let g = host_vec(g);
        for (got, want) in g.iter().zip([0.1, 0.2, 0.3, 0.4].iter()) {
            assert!((got - want).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn vjp_of_a_linear_map_is_the_transpose_product() -> Result<()> {
        // y = W x with x: [3, 1], W: [2, 3]  =>  aᵀ W, shaped like x.
        let w = Tensor::<B, 2>::from_data(
            TensorData::new(vec![1.0f32, 2.0, 3.0, -1.0, 0.0, 4.0], [2, 3]),
            &device(),
        );
        let x = leaf(vec![0.3, -0.7, 1.1], [3, 1]);
        let y = w.matmul(x.clone());
        let a = Tensor::<B, 2>::from_data(TensorData::new(vec![2.0f32, -1.0], [2, 1]), &device());

        let g = host_vec(vector_jacobian_product(y, &x, a)?);
        let expected = [2.0 * 1.0 - 1.0 * -1.0, 2.0 * 2.0, 2.0 * 3.0 - 4.0];
        for (got, want) in g.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-5, "{got} vs {want}");
        }
        Ok(())
    }

    #[test]
    fn vjp_can_be_repeated_on_fresh_graphs() -> Result<()> {
        let x = leaf(vec![1.0, 2.0, 3.0], [1, 3]);
        let a = Tensor::<B, 2>::ones([1, 3], &device());
        let first = host_vec(vector_jacobian_product(x.clone().powf_scalar(2.0), &x, a.clone())?);
        let second = host_vec(vector_jacobian_product(x.clone().powf_scalar(2.0), &x, a)?);
        assert_eq!(first, second);
        for (got, want) in first.iter().zip([2.0, 4.0, 6.0].iter()) {
            assert!((got - want).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn vjp_stays_differentiable_on_a_nested_backend() -> Result<()> {
        type Nested = Autodiff<B>;
        let x_inner = leaf(vec![1.0, -2.0, 0.5], [1, 3]);
        let x = Tensor::<Nested, 2>::from_inner(x_inner.clone()).require_grad();
        let y = x.clone() * x.clone() * x.clone();
        let a = Tensor::<Nested, 2>::ones([1, 3], &device());

        // 3x² on the inner backend, still on its tape.
        let g = vector_jacobian_product(y, &x, a)?;
        assert!(g.is_require_grad());
        for (got, want) in host_vec(g.clone()).iter().zip([3.0, 12.0, 0.75].iter()) {
            assert!((got - want).abs() < 1e-5, "{got} vs {want}");
        }

        let grads = g.sum().backward();
        let second = x_inner
            .grad(&grads)
            .ok_or(Error::MissingGradient("nested input"))?;
        for (got, want) in host_vec(second).iter().zip([6.0, -12.0, 3.0].iter()) {
            assert!((got - want).abs() < 1e-5, "{got} vs {want}");
        }
        Ok(())
    }

    #[test]
    fn vjp_rejects_mismatched_directions() {
        let x = leaf(vec![1.0, 2.0], [1, 2]);
        let a = Tensor::<B, 2>::ones([2, 1], &device());
        assert!(vector_jacobian_product(x.clone(), &x, a).is_err());
    }
}
