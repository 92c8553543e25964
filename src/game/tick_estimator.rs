use serde::Serialize;
use std::collections::VecDeque;

use crate::constants::FALLBACK_MICROS_PER_MS;
use crate::models::TickSample;
use crate::utils::growth;

/// Predicted window for the next tick of the running round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TickPrediction {
    pub lower: TickSample,
    pub upper: TickSample,
}

/// Least-squares fit of `elapsed -> micro` kept as running sums so each tick
/// costs O(1), plus a bounded window of recent samples for tick spacing.
#[derive(Debug, Clone)]
pub struct TickEstimator {
    window: usize,
    recent: VecDeque<TickSample>,
    n: f64,
    sum_x: f64,
    sum_y: f64,
    sum_xx: f64,
    sum_xy: f64,
}

impl TickEstimator {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(2),
            recent: VecDeque::with_capacity(window.max(2)),
            n: 0.0,
            sum_x: 0.0,
            sum_y: 0.0,
            sum_xx: 0.0,
            sum_xy: 0.0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.window);
    }

    pub fn len(&self) -> usize {
        self.n as usize
    }

    pub fn last(&self) -> Option<&TickSample> {
        self.recent.back()
    }

    pub fn record(&mut self, sample: TickSample) {
        let x = sample.elapsed as f64;
        let y = sample.micro as f64;
        self.n += 1.0;
        self.sum_x += x;
        self.sum_y += y;
        self.sum_xx += x * x;
        self.sum_xy += x * y;

        if self.recent.len() == self.window {
            self.recent.pop_front();
        }
        self.recent.push_back(sample);
    }

    /// `(intercept, slope)` in microseconds. Falls back to wall-clock rate when
    /// the fit is underdetermined.
    pub fn model(&self) -> (f64, f64) {
        if self.n == 0.0 {
            return (0.0, FALLBACK_MICROS_PER_MS);
        }
        let denominator = self.n * self.sum_xx - self.sum_x * self.sum_x;
        let slope = if self.n < 2.0 || denominator.abs() < f64::EPSILON {
            FALLBACK_MICROS_PER_MS
        } else {
            (self.n * self.sum_xy - self.sum_x * self.sum_y) / denominator
        };
        let intercept = (self.sum_y - slope * self.sum_x) / self.n;
        (intercept, slope)
    }

    pub fn micro_at(&self, elapsed: i64) -> i64 {
        let (intercept, slope) = self.model();
        (intercept + slope * elapsed as f64).round() as i64
    }

    // Internal helper that returns `(lower, upper)` spacing between ticks.
    fn delta_bounds(&self) -> (i64, i64) {
        let mut deltas: Vec<i64> = self
            .recent
            .iter()
            .zip(self.recent.iter().skip(1))
            .map(|(a, b)| b.elapsed - a.elapsed)
            .collect();

        match deltas.len() {
            0 => (0, 0),
            1 => (deltas[0], deltas[0]),
            2 => (deltas[0].min(deltas[1]), deltas[0].max(deltas[1])),
            n => {
                deltas.sort_unstable();
                let lower = (0.05 * n as f64).floor() as usize;
                let upper = (0.95 * n as f64).floor() as usize;
                (deltas[lower], deltas[upper.min(n - 1)])
            }
        }
    }

    fn sample_at(&self, elapsed: i64) -> TickSample {
        TickSample {
            elapsed,
            micro: self.micro_at(elapsed),
            growth: growth(elapsed),
        }
    }

    pub fn predict_next(&self) -> TickPrediction {
        let last = self.recent.back().map(|s| s.elapsed).unwrap_or(0);
        let (lower, upper) = self.delta_bounds();
        TickPrediction {
            lower: self.sample_at(last + lower),
            upper: self.sample_at(last + upper),
        }
    }
}
