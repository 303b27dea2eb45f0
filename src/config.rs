//! Engine and synthesis configuration.
//!
//! Both are burn `Config`s: builder-style `with_*` setters, JSON save/load, and documented
//! defaults.

use burn_core as burn;

use burn::config::Config;

/// Construction-time settings of a [`crate::Geodesic`].
#[derive(Config, Debug)]
pub struct GeodesicConfig {
    /// Number of steps (transitions) in the sequence; there are `n_steps + 1` frames.
    #[config(default = 10)]
    pub n_steps: usize,
    /// Weight of the range penalty on the interior frames.
    #[config(default = 0.1)]
    pub range_penalty_lambda: f64,
    /// Inclusive range the anchors must lie in, and the interior is pushed into.
    #[config(default = "(0.0, 1.0)")]
    pub allowed_range: (f64, f64),
}

/// Per-call settings of [`crate::Geodesic::synthesize`].
#[derive(Config, Debug)]
pub struct SynthesisConfig {
    /// Upper bound on iterations for this call.
    #[config(default = 1000)]
    pub max_iter: usize,
    /// Snapshot period: `0` never snapshots, `k` snapshots before every iteration whose global
    /// index is a multiple of `k`.
    #[config(default = 0)]
    pub store_progress: usize,
    /// Pixel-change threshold; `None` derives it from the pixelfade norm.
    pub stop_criterion: Option<f64>,
    /// How many consecutive iterations must stay under the threshold.
    #[config(default = 50)]
    pub stop_iters_to_check: usize,
}
