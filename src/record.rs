//! Saving and resuming a [`Geodesic`].
//!
//! The engine's state is written as a burn [`Record`] through `NamedMpkFileRecorder` with full
//! precision. The model and the optimizer are not part of the record: a resumed engine is built
//! with the same anchors, model and settings, then loads the frames and histories.
//!
//! Loading checks that the saved state belongs to the receiving engine before touching it:
//! anchors, `n_steps`, `range_penalty_lambda`, `allowed_range` and pixelfade must match, and the
//! objective on the pixelfade must agree within 1% (a cheap fingerprint of the model).

use std::path::Path;

use burn_core as burn;

use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Record, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use ndarray::{Array1, Array2};

use crate::geodesic::Geodesic;
use crate::model::AnalysisModel;
use crate::tensor_ops::{all_close, float_dtype, scalars_close};
use crate::Error;

type Inner<B> = <B as AutodiffBackend>::InnerBackend;

/// Relative tolerance for the saved-vs-current objective on the pixelfade.
const FINGERPRINT_RTOL: f64 = 1e-2;

/// Relative tolerance for saved-vs-current tensors (anchors, pixelfade).
const TENSOR_RTOL: f64 = 1e-5;

/// Everything needed to resume a [`Geodesic`], minus its model and optimizer.
#[derive(Record)]
pub struct GeodesicRecord<B: Backend> {
    pub image_a: Tensor<B, 4>,
    pub image_b: Tensor<B, 4>,
    pub interior: Tensor<B, 4>,
    pub pixelfade: Tensor<B, 4>,
    pub n_steps: usize,
    pub range_penalty_lambda: f64,
    pub allowed_min: f64,
    pub allowed_max: f64,
    pub losses: Vec<f64>,
    pub gradient_norm: Vec<f64>,
    pub pixel_change_norm: Vec<f64>,
    /// One `[n_steps]` row per snapshot.
    pub step_energy: Vec<Vec<f64>>,
    /// One row-major `[n_steps + 1, 2]` block per snapshot.
    pub dev_from_line: Vec<Vec<f64>>,
    pub store_progress: usize,
    /// `objective_function(pixelfade)` at save time.
    pub save_check: f64,
}

fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
}

/// Cast `t` to the float dtype of `like`.
fn match_precision<B: Backend, const D: usize>(t: Tensor<B, D>, like: &Tensor<B, D>) -> Tensor<B, D> {
    if t.dtype() == like.dtype() {
        t
    } else {
        t.cast(float_dtype(like))
    }
}

fn different(name: &str, current: impl std::fmt::Debug, saved: impl std::fmt::Debug) -> Error {
    Error::Inconsistent(format!(
        "Saved and initialized {name} are different! Self: {current:?}, Saved: {saved:?}"
    ))
}

impl<B: AutodiffBackend, M: AnalysisModel<B>> Geodesic<B, M> {
    /// Write the engine's state to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> crate::Result<()> {
        let save_check = self.objective_function(Some(self.pixelfade()))?;
        let record = GeodesicRecord::<Inner<B>> {
            image_a: self.image_a.clone(),
            image_b: self.image_b.clone(),
            interior: self.interior.clone(),
            pixelfade: self.pixelfade.clone(),
            n_steps: self.n_steps,
            range_penalty_lambda: self.range_penalty_lambda,
            allowed_min: self.allowed_range.0,
            allowed_max: self.allowed_range.1,
            losses: self.losses.clone(),
            gradient_norm: self.gradient_norm.clone(),
            pixel_change_norm: self.pixel_change_norm.clone(),
            step_energy: self.step_energy.iter().map(|s| s.to_vec()).collect(),
            dev_from_line: self
                .dev_from_line
                .iter()
                .map(|d| d.iter().copied().collect())
                .collect(),
            store_progress: self.store_progress,
            save_check,
        };
        Recorder::<Inner<B>>::record(&recorder(), record, path.as_ref().to_path_buf())
            .map_err(|err| Error::Persistence(format!("{err:?}")))?;
        tracing::debug!(path = %path.as_ref().display(), iterations = self.losses.len(), "saved geodesic");
        Ok(())
    }

    /// Restore frames and histories saved by [`Geodesic::save`].
    ///
    /// `self` must have been built with the same anchors, model and settings as the saved engine.
    /// Tensors land on `self`'s device and in `self`'s precision; to resume elsewhere, call
    /// [`Geodesic::to_device`] or [`Geodesic::cast`] first. On error `self` is unchanged.
    pub fn load(&mut self, path: impl AsRef<Path>) -> crate::Result<()> {
        let device = self.image_a.device();
        let record: GeodesicRecord<Inner<B>> =
            Recorder::<Inner<B>>::load(&recorder(), path.as_ref().to_path_buf(), &device)
                .map_err(|err| Error::Persistence(format!("{err:?}")))?;

        let image_a = match_precision(record.image_a, &self.image_a);
        if !all_close(image_a.clone(), self.image_a.clone(), TENSOR_RTOL) {
            return Err(different("image_a", self.image_a.dims(), image_a.dims()));
        }
        let image_b = match_precision(record.image_b, &self.image_b);
        if !all_close(image_b.clone(), self.image_b.clone(), TENSOR_RTOL) {
            return Err(different("image_b", self.image_b.dims(), image_b.dims()));
        }
        if record.n_steps != self.n_steps {
            return Err(different("n_steps", self.n_steps, record.n_steps));
        }
        if record.range_penalty_lambda != self.range_penalty_lambda {
            return Err(different(
                "range_penalty_lambda",
                self.range_penalty_lambda,
                record.range_penalty_lambda,
            ));
        }
        let allowed_range = (record.allowed_min, record.allowed_max);
        if allowed_range != self.allowed_range {
            return Err(different("allowed_range", self.allowed_range, allowed_range));
        }
        let pixelfade = match_precision(record.pixelfade, &self.pixelfade);
        if !all_close(pixelfade, self.pixelfade.clone(), TENSOR_RTOL) {
            return Err(different("pixelfade", "current", "saved"));
        }

        let current_check = self.objective_function(Some(self.pixelfade()))?;
        if !scalars_close(current_check, record.save_check, FINGERPRINT_RTOL) {
            return Err(Error::Inconsistent(format!(
                "objective_function on pixelfade of saved and initialized Geodesic object are different! Do they use the same model? Self: {current_check}, Saved: {}",
                record.save_check
            )));
        }

        let mut interior_dims = self.image_a.dims();
        interior_dims[0] = self.n_steps - 1;
        if record.interior.dims() != interior_dims {
            return Err(Error::Inconsistent(format!(
                "saved interior frames must be {interior_dims:?}, but got {:?}",
                record.interior.dims()
            )));
        }
        let step_energy = record
            .step_energy
            .into_iter()
            .map(|row| {
                if row.len() == self.n_steps {
                    Ok(Array1::from_vec(row))
                } else {
                    Err(Error::Inconsistent(format!(
                        "saved step_energy snapshot has {} entries, expected {}",
                        row.len(),
                        self.n_steps
                    )))
                }
            })
            .collect::<crate::Result<Vec<_>>>()?;
        let dev_from_line = record
            .dev_from_line
            .into_iter()
            .map(|block| {
                Array2::from_shape_vec((self.n_steps + 1, 2), block)
                    .map_err(|err| Error::Inconsistent(format!("saved dev_from_line snapshot: {err}")))
            })
            .collect::<crate::Result<Vec<_>>>()?;

        self.interior = match_precision(record.interior, &self.image_a);
        self.losses = record.losses;
        self.gradient_norm = record.gradient_norm;
        self.pixel_change_norm = record.pixel_change_norm;
        self.step_energy = step_energy;
        self.dev_from_line = dev_from_line;
        self.store_progress = record.store_progress;
        self.clear_cached_evaluation();
        tracing::debug!(path = %path.as_ref().display(), iterations = self.losses.len(), "loaded geodesic");
        Ok(())
    }
}
