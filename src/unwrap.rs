//! Phase unwrapping along one axis of an n-dimensional array.
//!
//! Angles computed with `atan2` jump by \(2\pi\) when they cross \(\pm\pi\). Distances between such
//! angles are meaningless until the jumps are removed. `unwrap` adds the multiple of \(2\pi\) that
//! makes consecutive values along an axis differ by at most \(\pi\), which is the standard
//! (numpy-compatible) unwrap with period \(2\pi\) and discontinuity threshold \(\pi\).

use std::f64::consts::{PI, TAU};

use ndarray::{Array, Axis, Dimension, Zip};

use crate::{Error, Result};

/// Unwrap `p` along `axis` (negative axes count from the end, as in `[-rank, rank - 1]`).
///
/// For each lane along the axis:
///
/// 1. `dp = p[k] - p[k-1]`
/// 2. `dp_m = ((dp + π) mod 2π) - π`, with `dp_m = π` where `dp_m == -π` and `dp > 0`
/// 3. the correction `dp_m - dp` is dropped where `|dp| < π`
/// 4. corrections accumulate: `out[k] = p[k] + Σ_{j ≤ k} correction[j]`
///
/// The first slice along the axis is returned unchanged.
pub fn unwrap<D: Dimension>(p: &Array<f64, D>, axis: isize) -> Result<Array<f64, D>> {
    let rank = p.ndim() as isize;
    if axis >= rank || axis < -rank {
        return Err(Error::Domain(format!(
            "dim must lie within [-p.ndim, p.ndim-1], but got dim={axis} and p.ndim={rank} instead"
        )));
    }
    let axis = Axis(if axis < 0 { axis + rank } else { axis } as usize);

    let mut out = p.to_owned();
    Zip::from(out.lanes_mut(axis))
        .and(p.lanes(axis))
        .for_each(|mut unwrapped, raw| {
            let mut correction = 0.0;
            for k in 1..raw.len() {
                let dp = raw[k] - raw[k - 1];
                if dp.abs() >= PI {
                    let mut dp_m = (dp + PI).rem_euclid(TAU) - PI;
                    if dp_m == -PI && dp > 0.0 {
                        dp_m = PI;
                    }
                    correction += dp_m - dp;
                }
                unwrapped[k] = raw[k] + correction;
            }
        });
    Ok(out)
}
