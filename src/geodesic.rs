//! The geodesic optimization engine.
//!
//! A [`Geodesic`] holds two anchor images, an analysis model, and the interior frames of a
//! sequence between the anchors. [`Geodesic::synthesize`] moves the interior frames to minimize
//!
//! \[
//! L(x) = \sum_{k=1}^{N} \| f(x_k) - f(x_{k-1}) \|_2^2 + \lambda \cdot \mathrm{penalty}(x_{1..N-1}),
//! \]
//!
//! where the penalty keeps pixels inside the allowed range. The anchors are never handed to the
//! optimizer, so they stay bit-identical for the engine's whole lifetime.
//!
//! Frames are stored untracked on `B::InnerBackend`. Each objective evaluation lifts the interior
//! into the autodiff backend, builds a fresh graph and runs one backward pass, so there is no
//! gradient state to keep consistent across save/load or precision changes.

use burn_core as burn;

use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{FloatDType, Tensor};
use ndarray::{Array1, Array2, Array3};

use crate::config::{GeodesicConfig, SynthesisConfig};
use crate::convergence::{default_stop_criterion, pixel_change_convergence};
use crate::model::AnalysisModel;
use crate::optim::{AmsGrad, Evaluation, SequenceOptimizer};
use crate::straightness::{deviation_from_line_or_nan, make_straight_line};
use crate::tensor_ops::{
    diff, exactly_equal, float_dtype, frame_sq_norms, host_vec, l2_norm, machine_epsilon,
    scalar_f64,
};
use crate::validate::{penalize_range, validate_input, validate_model};
use crate::vjp::vector_jacobian_product;
use crate::{Error, Result};

type Inner<B> = <B as AutodiffBackend>::InnerBackend;

/// Accelerations within this many machine epsilons of the largest representation norm count as
/// zero in [`Geodesic::calculate_jerkiness`].
const ACCELERATION_RESOLUTION_ULPS: f64 = 64.0;

/// Where the engine is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisStatus {
    /// Built (or loaded) and not yet run.
    Constructed,
    /// Inside `synthesize`.
    Optimizing,
    /// The last run stopped on the pixel-change criterion.
    Converged,
    /// The last run used up `max_iter`.
    MaxIterReached,
    /// The last run hit a non-finite loss.
    NanAborted,
    /// The last run stopped on another error after recording some iterations.
    Interrupted,
}

/// How a successful [`Geodesic::synthesize`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisOutcome {
    Converged { iterations: usize },
    MaxIterReached { iterations: usize },
}

impl SynthesisOutcome {
    /// Iterations run by this call.
    pub fn iterations(&self) -> usize {
        match *self {
            SynthesisOutcome::Converged { iterations }
            | SynthesisOutcome::MaxIterReached { iterations } => iterations,
        }
    }
}

/// The most recent objective evaluation, kept for the next snapshot.
#[derive(Debug, Clone)]
struct LastEvaluation<B: Backend> {
    representation: Tensor<B, 4>,
    step_energy: Tensor<B, 1>,
}

/// Loss and its parts for one sequence.
struct PathEnergy<B: Backend> {
    loss: Tensor<B, 1>,
    representation: Tensor<B, 4>,
    step_energy: Tensor<B, 1>,
}

/// Squared norm of the representation difference between consecutive frames, `[n - 1]`.
pub(crate) fn step_energy<B: Backend>(representation: Tensor<B, 4>) -> Tensor<B, 1> {
    frame_sq_norms(diff(representation, 0))
}

/// Approximate geodesic between two images in the representation space of `M`.
pub struct Geodesic<B: AutodiffBackend, M: AnalysisModel<B>> {
    pub(crate) model: M,
    pub(crate) image_a: Tensor<Inner<B>, 4>,
    pub(crate) image_b: Tensor<Inner<B>, 4>,
    pub(crate) interior: Tensor<Inner<B>, 4>,
    pub(crate) pixelfade: Tensor<Inner<B>, 4>,
    pub(crate) n_steps: usize,
    pub(crate) range_penalty_lambda: f64,
    pub(crate) allowed_range: (f64, f64),
    pub(crate) losses: Vec<f64>,
    pub(crate) gradient_norm: Vec<f64>,
    pub(crate) pixel_change_norm: Vec<f64>,
    pub(crate) step_energy: Vec<Array1<f64>>,
    pub(crate) dev_from_line: Vec<Array2<f64>>,
    pub(crate) store_progress: usize,
    last_evaluation: Option<LastEvaluation<Inner<B>>>,
    optimizer: Option<Box<dyn SequenceOptimizer<B>>>,
    pub(crate) status: SynthesisStatus,
}

impl<B: AutodiffBackend, M: AnalysisModel<B>> Geodesic<B, M> {
    /// Build an engine between `image_a` and `image_b` (each `[1, C, H, W]`).
    ///
    /// The interior starts from the pixelfade, or from `initial_sequence` when given; the latter
    /// must be `[n_steps + 1, C, H, W]` with its first and last frames bit-identical to the
    /// anchors. A smooth but curved initialization (e.g. a Brownian bridge from
    /// [`crate::straightness::sample_brownian_bridge`]) helps when the straight line is a
    /// critical point of the energy.
    pub fn new(
        image_a: Tensor<B, 4>,
        image_b: Tensor<B, 4>,
        model: M,
        config: &GeodesicConfig,
        initial_sequence: Option<Tensor<B, 4>>,
    ) -> Result<Self> {
        let n_steps = config.n_steps;
        let range_penalty_lambda = config.range_penalty_lambda;
        let allowed_range = config.allowed_range;

        if !(range_penalty_lambda >= 0.0) {
            return Err(Error::Domain(format!(
                "range_penalty_lambda must be non-negative, but got {range_penalty_lambda}"
            )));
        }
        if n_steps < 2 {
            return Err(Error::Domain(format!(
                "n_steps must be at least 2 so there is an interior frame to optimize, but got {n_steps}"
            )));
        }

        let image_a = image_a.inner();
        let image_b = image_b.inner();
        validate_input(&image_a, Some(allowed_range))?;
        validate_input(&image_b, Some(allowed_range))?;
        if image_a.dims() != image_b.dims() {
            return Err(Error::Shape(format!(
                "image_a and image_b must have the same shape, but got {:?} and {:?}",
                image_a.dims(),
                image_b.dims()
            )));
        }
        validate_model(&model, &Tensor::<B, 4>::from_inner(image_a.clone()))?;

        let pixelfade = make_straight_line(image_a.clone(), image_b.clone(), n_steps)?;
        let sequence = match initial_sequence {
            None => pixelfade.clone(),
            Some(sequence) => {
                Self::check_initial_sequence(sequence.inner(), &image_a, &image_b, n_steps)?
            }
        };
        let interior = sequence.narrow(0, 1, n_steps - 1);

        Ok(Self {
            model,
            image_a,
            image_b,
            interior,
            pixelfade,
            n_steps,
            range_penalty_lambda,
            allowed_range,
            losses: Vec::new(),
            gradient_norm: Vec::new(),
            pixel_change_norm: Vec::new(),
            step_energy: Vec::new(),
            dev_from_line: Vec::new(),
            store_progress: 0,
            last_evaluation: None,
            optimizer: None,
            status: SynthesisStatus::Constructed,
        })
    }

    fn check_initial_sequence(
        sequence: Tensor<Inner<B>, 4>,
        image_a: &Tensor<Inner<B>, 4>,
        image_b: &Tensor<Inner<B>, 4>,
        n_steps: usize,
    ) -> Result<Tensor<Inner<B>, 4>> {
        let dims = sequence.dims();
        let frame = image_a.dims();
        if dims[0] != n_steps + 1 {
            return Err(Error::Shape(format!(
                "initial_sequence must be [n_steps+1, n_channels, im_height, im_width] = [{}, {}, {}, {}], but got {dims:?}",
                n_steps + 1,
                frame[1],
                frame[2],
                frame[3]
            )));
        }
        if dims[1..] != frame[1..] || dims[1..] != image_b.dims()[1..] {
            return Err(Error::Shape(format!(
                "initial_sequence, image_a, and image_b must have same number of channels, height and width, but got {dims:?}, {frame:?} and {:?}",
                image_b.dims()
            )));
        }

        let sequence = sequence.to_device(&image_a.device());
        let sequence = if sequence.dtype() == image_a.dtype() {
            sequence
        } else {
            sequence.cast(float_dtype(image_a))
        };
        if !exactly_equal(sequence.clone().narrow(0, 0, 1), image_a.clone()) {
            return Err(Error::Domain(
                "First frame of initial_sequence must be the same as image_a".to_string(),
            ));
        }
        if !exactly_equal(sequence.clone().narrow(0, n_steps, 1), image_b.clone()) {
            return Err(Error::Domain(
                "Last frame of initial_sequence must be the same as image_b".to_string(),
            ));
        }
        Ok(sequence)
    }

    /// Loss and its parts. The range penalty only sees the interior of `sequence`.
    fn path_energy(&self, sequence: Tensor<B, 4>, representation: Tensor<B, 4>) -> PathEnergy<B> {
        let n = sequence.dims()[0];
        let step_energy = step_energy(representation.clone());
        let penalty = penalize_range(sequence.narrow(0, 1, n - 2), self.allowed_range);
        let loss = step_energy.clone().sum() + penalty.mul_scalar(self.range_penalty_lambda);
        PathEnergy {
            loss,
            representation,
            step_energy,
        }
    }

    /// Sequences passed in from outside must look like the geodesic.
    fn check_sequence(&self, sequence: &Tensor<B, 4>) -> Result<()> {
        let dims = sequence.dims();
        let frame = self.image_a.dims();
        if dims[0] < 3 || dims[1..] != frame[1..] {
            return Err(Error::Shape(format!(
                "sequence must be [n_frames >= 3, {}, {}, {}], but got {dims:?}",
                frame[1], frame[2], frame[3]
            )));
        }
        Ok(())
    }

    /// Path energy plus weighted range penalty of `sequence` (the current geodesic by default).
    pub fn objective_function(&self, sequence: Option<Tensor<B, 4>>) -> Result<f64> {
        let sequence = match sequence {
            Some(sequence) => {
                self.check_sequence(&sequence)?;
                sequence.inner()
            }
            None => self.geodesic_inner(),
        };
        let sequence = Tensor::<B, 4>::from_inner(sequence);
        let representation = self.model.forward(sequence.clone());
        let energy = self.path_energy(sequence, representation);
        Ok(scalar_f64(energy.loss.detach()))
    }

    /// Evaluate loss and gradient at `frames` (the interior), for the optimizer's closure.
    ///
    /// The whole sequence is the tracked leaf and the interior's gradient is sliced out of it.
    fn evaluate_interior(
        &self,
        frames: Tensor<Inner<B>, 4>,
    ) -> Result<(Evaluation<Inner<B>>, LastEvaluation<Inner<B>>)> {
        let n_interior = frames.dims()[0];
        let sequence = Tensor::<B, 4>::from_inner(Tensor::cat(
            vec![self.image_a.clone(), frames, self.image_b.clone()],
            0,
        ))
        .require_grad();
        let representation = self.model.forward(sequence.clone());
        let energy = self.path_energy(sequence.clone(), representation);

        let last = LastEvaluation {
            representation: energy.representation.inner(),
            step_energy: energy.step_energy.inner(),
        };
        let loss = scalar_f64(energy.loss.clone().detach());
        let grads = energy.loss.backward();
        let grad = sequence
            .grad(&grads)
            .ok_or(Error::MissingGradient("interior frames"))?
            .narrow(0, 1, n_interior);
        Ok((Evaluation { loss, grad }, last))
    }

    /// Run the optimizer on the interior frames.
    ///
    /// Histories append across calls. The first call installs `optimizer`, or AMSGrad with
    /// learning rate 1e-3 when `None`; later calls reuse it and reject a new one with
    /// [`Error::OptimizerAlreadySet`]. A non-finite loss aborts with [`Error::NonFiniteLoss`]
    /// after recording that iteration in every history. The interior keeps its last finite
    /// iterate and the optimizer is dropped so the next call starts fresh.
    pub fn synthesize(
        &mut self,
        config: &SynthesisConfig,
        optimizer: Option<Box<dyn SequenceOptimizer<B>>>,
    ) -> Result<SynthesisOutcome> {
        let mut optimizer: Box<dyn SequenceOptimizer<B>> = match (self.optimizer.take(), optimizer) {
            (Some(existing), Some(_)) => {
                self.optimizer = Some(existing);
                return Err(Error::OptimizerAlreadySet);
            }
            (Some(existing), None) => existing,
            (None, Some(supplied)) => supplied,
            (None, None) => Box::new(AmsGrad::<B>::default()),
        };

        let stop_criterion = match config.stop_criterion {
            Some(criterion) => criterion,
            None => default_stop_criterion(l2_norm(self.pixelfade.clone())),
        };
        tracing::info!(
            stop_criterion,
            stop_iters_to_check = config.stop_iters_to_check,
            max_iter = config.max_iter,
            "starting geodesic synthesis"
        );

        self.store_progress = config.store_progress;
        let status_before = self.status;
        let iterations_before = self.losses.len();
        self.status = SynthesisStatus::Optimizing;
        let outcome = self.run(optimizer.as_mut(), config, stop_criterion);
        match &outcome {
            Err(Error::NonFiniteLoss { .. }) => self.status = SynthesisStatus::NanAborted,
            Err(_) => {
                self.status = if self.losses.len() > iterations_before {
                    SynthesisStatus::Interrupted
                } else {
                    status_before
                };
                self.optimizer = Some(optimizer);
            }
            Ok(done) => {
                self.status = match done {
                    SynthesisOutcome::Converged { .. } => SynthesisStatus::Converged,
                    SynthesisOutcome::MaxIterReached { .. } => SynthesisStatus::MaxIterReached,
                };
                self.optimizer = Some(optimizer);
            }
        }
        outcome
    }

    fn run(
        &mut self,
        optimizer: &mut dyn SequenceOptimizer<B>,
        config: &SynthesisConfig,
        stop_criterion: f64,
    ) -> Result<SynthesisOutcome> {
        for ran in 0..config.max_iter {
            let iteration = self.losses.len();
            if self.store_progress > 0 && iteration % self.store_progress == 0 {
                self.store_snapshot()?;
            }

            let previous = self.interior.clone();
            let mut last = None;
            let (frames, evaluation) = {
                let this = &*self;
                optimizer.step(previous.clone(), &mut |frames: Tensor<Inner<B>, 4>| {
                    let (evaluation, evaluated) = this.evaluate_interior(frames)?;
                    last = Some(evaluated);
                    Ok(evaluation)
                })?
            };

            let gradient_norm = l2_norm(evaluation.grad);
            let pixel_change = l2_norm(frames.clone() - previous);
            self.losses.push(evaluation.loss);
            self.gradient_norm.push(gradient_norm);
            self.pixel_change_norm.push(pixel_change);
            if !evaluation.loss.is_finite() {
                tracing::warn!(iteration, loss = evaluation.loss, "non-finite loss, aborting");
                return Err(Error::NonFiniteLoss { iteration });
            }

            self.interior = frames;
            self.last_evaluation = last;
            tracing::debug!(
                iteration,
                loss = evaluation.loss,
                gradient_norm,
                pixel_change,
                "geodesic step"
            );

            if pixel_change_convergence(
                &self.pixel_change_norm,
                stop_criterion,
                config.stop_iters_to_check,
            ) {
                tracing::info!(
                    iterations = ran + 1,
                    "pixel change norm has converged, stopping synthesis"
                );
                return Ok(SynthesisOutcome::Converged {
                    iterations: ran + 1,
                });
            }
        }
        Ok(SynthesisOutcome::MaxIterReached {
            iterations: config.max_iter,
        })
    }

    /// Append one step-energy and one deviation-from-line snapshot.
    fn store_snapshot(&mut self) -> Result<()> {
        let (representation, energy) = match &self.last_evaluation {
            Some(last) => (last.representation.clone(), last.step_energy.clone()),
            None => {
                let sequence = Tensor::<B, 4>::from_inner(self.geodesic_inner());
                let representation = self.model.forward(sequence).inner();
                (representation.clone(), step_energy(representation))
            }
        };

        let (along, from) = deviation_from_line_or_nan(representation, false)?;
        let mut deviation = Array2::zeros((along.len(), 2));
        for (k, (a, f)) in along.into_iter().zip(from).enumerate() {
            deviation[[k, 0]] = a;
            deviation[[k, 1]] = f;
        }

        self.step_energy.push(Array1::from_vec(host_vec(energy)));
        self.dev_from_line.push(deviation);
        Ok(())
    }

    /// Norm of the representation's acceleration pulled back to pixel space, per interior frame.
    ///
    /// For representation \(y = f(x)\) with acceleration \(a_k = y_{k+1} - 2 y_k + y_{k-1}\), the
    /// result at interior frame \(k\) is \(\| (\hat a_k^\top \partial y_k / \partial x)_k \|^2\) where
    /// \(\hat a_k = a_k / \|a_k\|\). Frames whose acceleration is below floating-point resolution
    /// of the representation get a zero direction, so a path with no representational acceleration
    /// scores exactly zero.
    ///
    /// Returns `[n_frames - 2]`; for the current geodesic that is `[n_steps - 1]`.
    pub fn calculate_jerkiness(&self, sequence: Option<Tensor<B, 4>>) -> Result<Tensor<B, 1>> {
        let sequence = match sequence {
            Some(sequence) => {
                self.check_sequence(&sequence)?;
                sequence.inner()
            }
            None => self.geodesic_inner(),
        };
        let x = Tensor::<B, 4>::from_inner(sequence).require_grad();
        let representation = self.model.forward(x.clone());
        let n = representation.dims()[0];

        let velocity = diff(representation.clone().detach(), 0);
        let acceleration = diff(velocity, 0);
        let magnitude = frame_sq_norms(acceleration.clone()).sqrt();
        let largest = scalar_f64(frame_sq_norms(representation.clone().detach()).max().sqrt());
        let resolution =
            ACCELERATION_RESOLUTION_ULPS * machine_epsilon(float_dtype(&magnitude)) * largest;
        let negligible = magnitude.clone().lower_equal_elem(resolution);
        let scale = magnitude
            .clamp_min(f32::MIN_POSITIVE as f64)
            .recip()
            .mask_fill(negligible, 0.0);
        let direction = acceleration * scale.reshape([n - 2, 1, 1, 1]);

        let pulled_back =
            vector_jacobian_product(representation.narrow(0, 1, n - 2), &x, direction)?;
        let jerkiness = frame_sq_norms(pulled_back.narrow(0, 1, n - 2));
        Ok(Tensor::from_inner(jerkiness))
    }

    fn geodesic_inner(&self) -> Tensor<Inner<B>, 4> {
        Tensor::cat(
            vec![
                self.image_a.clone(),
                self.interior.clone(),
                self.image_b.clone(),
            ],
            0,
        )
    }

    /// Move every tensor (anchors, frames, model, optimizer state) to `device`.
    pub fn to_device(mut self, device: &B::Device) -> Self {
        self.image_a = self.image_a.to_device(device);
        self.image_b = self.image_b.to_device(device);
        self.interior = self.interior.to_device(device);
        self.pixelfade = self.pixelfade.to_device(device);
        self.model = self.model.to_device(device);
        if let Some(optimizer) = self.optimizer.as_mut() {
            optimizer.to_device(device);
        }
        self.last_evaluation = None;
        self
    }

    /// Cast every floating-point tensor (anchors, frames, model, optimizer state) to `dtype`.
    ///
    /// Histories are host `f64` and do not change.
    pub fn cast(mut self, dtype: FloatDType) -> Self {
        self.image_a = self.image_a.cast(dtype);
        self.image_b = self.image_b.cast(dtype);
        self.interior = self.interior.cast(dtype);
        self.pixelfade = self.pixelfade.cast(dtype);
        self.model = self.model.cast(dtype);
        if let Some(optimizer) = self.optimizer.as_mut() {
            optimizer.cast(dtype);
        }
        self.last_evaluation = None;
        self
    }

    /// Forget the cached evaluation after the frames were replaced from outside the loop.
    pub(crate) fn clear_cached_evaluation(&mut self) {
        self.last_evaluation = None;
    }

    /// Current sequence: anchors around the interior frames, `[n_steps + 1, C, H, W]`.
    pub fn geodesic(&self) -> Tensor<B, 4> {
        Tensor::from_inner(self.geodesic_inner())
    }

    /// The straight line between the anchors, `[n_steps + 1, C, H, W]`.
    pub fn pixelfade(&self) -> Tensor<B, 4> {
        Tensor::from_inner(self.pixelfade.clone())
    }

    pub fn image_a(&self) -> Tensor<B, 4> {
        Tensor::from_inner(self.image_a.clone())
    }

    pub fn image_b(&self) -> Tensor<B, 4> {
        Tensor::from_inner(self.image_b.clone())
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn n_steps(&self) -> usize {
        self.n_steps
    }

    pub fn range_penalty_lambda(&self) -> f64 {
        self.range_penalty_lambda
    }

    pub fn allowed_range(&self) -> (f64, f64) {
        self.allowed_range
    }

    /// Snapshot period of the most recent run (`0` if none).
    pub fn store_progress(&self) -> usize {
        self.store_progress
    }

    pub fn status(&self) -> SynthesisStatus {
        self.status
    }

    /// Loss per iteration, across all runs.
    pub fn losses(&self) -> &[f64] {
        &self.losses
    }

    /// L2 norm of the interior gradient per iteration.
    pub fn gradient_norm(&self) -> &[f64] {
        &self.gradient_norm
    }

    /// L2 distance between consecutive interior iterates.
    pub fn pixel_change_norm(&self) -> &[f64] {
        &self.pixel_change_norm
    }

    /// Step-energy snapshots, `[n_snapshots, n_steps]`.
    pub fn step_energy(&self) -> Array2<f64> {
        Array2::from_shape_fn((self.step_energy.len(), self.n_steps), |(i, k)| {
            self.step_energy[i][k]
        })
    }

    /// Deviation-from-line snapshots, `[n_snapshots, n_steps + 1, 2]` with
    /// `[.., .., 0]` the distance along the line and `[.., .., 1]` the distance from it.
    pub fn dev_from_line(&self) -> Array3<f64> {
        Array3::from_shape_fn(
            (self.dev_from_line.len(), self.n_steps + 1, 2),
            |(i, k, c)| self.dev_from_line[i][[k, c]],
        )
    }
}

impl<B: AutodiffBackend, M: AnalysisModel<B> + std::fmt::Debug> std::fmt::Debug for Geodesic<B, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Geodesic")
            .field("model", &self.model)
            .field("frame_shape", &self.image_a.dims())
            .field("n_steps", &self.n_steps)
            .field("range_penalty_lambda", &self.range_penalty_lambda)
            .field("allowed_range", &self.allowed_range)
            .field("iterations", &self.losses.len())
            .field("status", &self.status)
            .finish()
    }
}
