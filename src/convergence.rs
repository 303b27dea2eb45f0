//! Stopping rule for geodesic synthesis.
//!
//! Synthesis stops once the interior frames have stopped moving: the L2 distance between
//! consecutive iterates stayed below a criterion for a number of iterations in a row.

/// \((1 + \sqrt 5) / 2\).
pub const GOLDEN_RATIO: f64 = 1.618_033_988_749_895;

/// Default pixel-change criterion: `‖pixelfade‖₂ / 1e4 · φ`.
///
/// Scales with the size and contrast of the anchors, so the same default works for small and
/// large images.
pub fn default_stop_criterion(pixelfade_norm: f64) -> f64 {
    pixelfade_norm / 1e4 * GOLDEN_RATIO
}

/// True once the last `stop_iters_to_check` entries of `pixel_change_norm` are all strictly below
/// `stop_criterion`.
///
/// False while fewer than `stop_iters_to_check` entries exist. `stop_iters_to_check == 0`
/// disables the rule.
pub fn pixel_change_convergence(
    pixel_change_norm: &[f64],
    stop_criterion: f64,
    stop_iters_to_check: usize,
) -> bool {
    let n = pixel_change_norm.len();
    if stop_iters_to_check == 0 || n < stop_iters_to_check {
        return false;
    }
    pixel_change_norm[n - stop_iters_to_check..]
        .iter()
        .all(|&change| change < stop_criterion)
}
