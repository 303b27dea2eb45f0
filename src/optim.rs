//! Optimizers for the interior frames.
//!
//! The engine owns the objective; an optimizer only sees the current interior frames and a
//! closure that evaluates the loss and its gradient at any point. One `step` calls the closure
//! at least once and returns the updated frames together with the evaluation at the frames it
//! was handed.
//!
//! Two implementations:
//!
//! - [`AmsGrad`]: Adam with the AMSGrad max-of-second-moments correction, the engine's default.
//! - [`BurnOptimizer`]: wraps any `burn_optim` optimizer (SGD, Adam, ...) by registering the
//!   closure's gradient against a single parameter.

use std::marker::PhantomData;

use burn_core as burn;

use burn::config::Config;
use burn::module::{Module, Param, ParamId};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{FloatDType, Tensor};
use burn_optim::{GradientsParams, LearningRate, Optimizer};


/// Loss and gradient at one point.
#[derive(Debug, Clone)]
pub struct Evaluation<B: Backend> {
    pub loss: f64,
    pub grad: Tensor<B, 4>,
}

/// Evaluates the objective at the given interior frames.
pub type Objective<'a, B> =
    dyn FnMut(Tensor<B, 4>) -> crate::Result<Evaluation<B>> + 'a;

/// A closure-driven optimizer over the interior frames `[n_steps - 1, C, H, W]`.
///
/// Frames are plain (untracked) tensors on `B::InnerBackend`; the closure builds whatever graph it
/// needs.
pub trait SequenceOptimizer<B: AutodiffBackend> {
    /// One update. Returns the new frames and the evaluation at `frames`.
    fn step(
        &mut self,
        frames: Tensor<B::InnerBackend, 4>,
        objective: &mut Objective<'_, B::InnerBackend>,
    ) -> crate::Result<(Tensor<B::InnerBackend, 4>, Evaluation<B::InnerBackend>)>;

    /// Move internal state to `device`.
    fn to_device(&mut self, _device: &<B::InnerBackend as Backend>::Device) {}

    /// Cast internal state to `dtype`.
    fn cast(&mut self, _dtype: FloatDType) {}
}

/// Settings for [`AmsGrad`]; the defaults are the usual Adam ones.
#[derive(Config, Debug)]
pub struct AmsGradConfig {
    #[config(default = 1e-3)]
    pub learning_rate: f64,
    #[config(default = 0.9)]
    pub beta_1: f64,
    #[config(default = 0.999)]
    pub beta_2: f64,
    #[config(default = 1e-8)]
    pub epsilon: f64,
}

impl AmsGradConfig {
    pub fn init<B: AutodiffBackend>(&self) -> AmsGrad<B> {
        AmsGrad {
            learning_rate: self.learning_rate,
            beta_1: self.beta_1,
            beta_2: self.beta_2,
            epsilon: self.epsilon,
            state: None,
        }
    }
}

#[derive(Debug)]
struct AmsGradState<B: Backend> {
    time: i32,
    moment_1: Tensor<B, 4>,
    moment_2: Tensor<B, 4>,
    max_moment_2: Tensor<B, 4>,
}

impl<B: Backend> AmsGradState<B> {
    fn zeros_like(grad: &Tensor<B, 4>) -> Self {
        let zeros = grad.zeros_like();
        Self {
            time: 0,
            moment_1: zeros.clone(),
            moment_2: zeros.clone(),
            max_moment_2: zeros,
        }
    }

    fn map(self, f: impl Fn(Tensor<B, 4>) -> Tensor<B, 4>) -> Self {
        Self {
            time: self.time,
            moment_1: f(self.moment_1),
            moment_2: f(self.moment_2),
            max_moment_2: f(self.max_moment_2),
        }
    }
}

/// Adam with the AMSGrad correction.
///
/// With gradient \(g_t\):
///
/// - \(m_t = \beta_1 m_{t-1} + (1 - \beta_1) g_t\)
/// - \(v_t = \beta_2 v_{t-1} + (1 - \beta_2) g_t^2\)
/// - \(\hat v_t = \max(\hat v_{t-1}, v_t)\)
/// - \(x_{t} = x_{t-1} - \eta \, \frac{m_t / (1 - \beta_1^t)}{\sqrt{\hat v_t / (1 - \beta_2^t)} + \epsilon}\)
///
/// Moments are created lazily on the first step, with the device and dtype of the gradient.
#[derive(Debug)]
pub struct AmsGrad<B: AutodiffBackend> {
    learning_rate: f64,
    beta_1: f64,
    beta_2: f64,
    epsilon: f64,
    state: Option<AmsGradState<B::InnerBackend>>,
}

impl<B: AutodiffBackend> Default for AmsGrad<B> {
    fn default() -> Self {
        AmsGradConfig::new().init()
    }
}

impl<B: AutodiffBackend> AmsGrad<B> {
    /// Number of steps taken so far.
    pub fn time(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.time as usize)
    }
}

impl<B: AutodiffBackend> SequenceOptimizer<B> for AmsGrad<B> {
    fn step(
        &mut self,
        frames: Tensor<B::InnerBackend, 4>,
        objective: &mut Objective<'_, B::InnerBackend>,
    ) -> crate::Result<(Tensor<B::InnerBackend, 4>, Evaluation<B::InnerBackend>)> {
        let evaluation = objective(frames.clone())?;
        let grad = evaluation.grad.clone();

        let mut state = match self.state.take() {
            Some(state) => state,
            None => AmsGradState::zeros_like(&grad),
        };
        state.time += 1;
        state.moment_1 = state.moment_1.mul_scalar(self.beta_1)
            + grad.clone().mul_scalar(1.0 - self.beta_1);
        state.moment_2 =
            state.moment_2.mul_scalar(self.beta_2) + grad.powf_scalar(2.0).mul_scalar(1.0 - self.beta_2);
        state.max_moment_2 = state.max_moment_2.max_pair(state.moment_2.clone());

        let bias_correction_1 = 1.0 - self.beta_1.powi(state.time);
        let bias_correction_2 = 1.0 - self.beta_2.powi(state.time);
        let denominator = state
            .max_moment_2
            .clone()
            .div_scalar(bias_correction_2)
            .sqrt()
            .add_scalar(self.epsilon);
        let update = state
            .moment_1
            .clone()
            .mul_scalar(self.learning_rate / bias_correction_1)
            / denominator;

        self.state = Some(state);
        Ok((frames - update, evaluation))
    }

    fn to_device(&mut self, device: &<B::InnerBackend as Backend>::Device) {
        self.state = self.state.take().map(|s| s.map(|t| t.to_device(device)));
    }

    fn cast(&mut self, dtype: FloatDType) {
        self.state = self.state.take().map(|s| s.map(|t| t.cast(dtype)));
    }
}

/// The interior frames as a burn module with one parameter, so that `burn_optim` optimizers can
/// update them.
#[derive(Module, Debug)]
pub struct InteriorFrames<B: Backend> {
    pub frames: Param<Tensor<B, 4>>,
}

/// Adapter from a `burn_optim` [`Optimizer`] to [`SequenceOptimizer`].
///
/// The frames keep one `ParamId` for the adapter's lifetime, so stateful optimizers (momentum,
/// Adam moments) accumulate across steps. Burn keeps that state keyed by id and moves it to the
/// parameter's device on every step; a precision change rebuilds the optimizer from `init`, which
/// restarts its state.
pub struct BurnOptimizer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<InteriorFrames<B>, B>,
{
    init: Box<dyn Fn() -> O>,
    optim: O,
    learning_rate: LearningRate,
    id: ParamId,
    _backend: PhantomData<B>,
}

impl<B, O> BurnOptimizer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<InteriorFrames<B>, B>,
{
    /// `init` builds a fresh optimizer, e.g.
    /// `|| SgdConfig::new().init::<B, InteriorFrames<B>>()`.
    pub fn new(init: impl Fn() -> O + 'static, learning_rate: LearningRate) -> Self {
        let optim = init();
        Self {
            init: Box::new(init),
            optim,
            learning_rate,
            id: ParamId::new(),
            _backend: PhantomData,
        }
    }
}

impl<B, O> SequenceOptimizer<B> for BurnOptimizer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<InteriorFrames<B>, B>,
{
    fn step(
        &mut self,
        frames: Tensor<B::InnerBackend, 4>,
        objective: &mut Objective<'_, B::InnerBackend>,
    ) -> crate::Result<(Tensor<B::InnerBackend, 4>, Evaluation<B::InnerBackend>)> {
        let evaluation = objective(frames.clone())?;

        let module = InteriorFrames {
            frames: Param::initialized(self.id.clone(), Tensor::<B, 4>::from_inner(frames).require_grad()),
        };
        let mut grads = GradientsParams::new();
        grads.register(self.id.clone(), evaluation.grad.clone());
        let module = self.optim.step(self.learning_rate, module, grads);

        Ok((module.frames.val().inner(), evaluation))
    }

    fn cast(&mut self, _dtype: FloatDType) {
        self.optim = (self.init)();
    }
}
