// Utility helpers shared by the session, estimator and logs

use crate::constants::GROWTH_RATE_PER_MS;

/// Multiplier (x100) reached `elapsed_ms` after round start.
pub fn growth(elapsed_ms: i64) -> i64 {
    (100.0 * (GROWTH_RATE_PER_MS * elapsed_ms as f64).exp()).floor() as i64
}

/// Render a x100 multiplier as `1.23`.
pub fn format_factor(x100: i64) -> String {
    format!("{:.2}", x100 as f64 / 100.0)
}
