//! Small linear model forecasting the near-future load multiplier.
//!
//! Each observation is turned into a feature vector (hour of day as a
//! sin/cos pair, throughput relative to its mean, queue pressure, bias) and
//! paired with the load ratio observed at the next sample. Weights are fit
//! by batch gradient descent over the retained window.

use std::f64::consts::TAU;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::stats::{mean, RingBuffer};

const FEATURES: usize = 5;
const LEARNING_RATE: f64 = 0.05;
const EPOCHS: usize = 500;
/// Training pairs needed before a fit is attempted.
const MIN_PAIRS: usize = 5;
/// Pairs at which confidence is no longer discounted for sample size.
const FULL_CONFIDENCE_PAIRS: f64 = 20.0;
const MAX_MULTIPLIER: f64 = 5.0;
const MAX_RATIO_FEATURE: f64 = 2.0;

/// One point of load history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadObservation {
    /// Local hour in `[0, 24)`, fractional.
    pub hour_of_day: f64,
    /// Completions per second.
    pub throughput: f64,
    pub queue_length: f64,
    /// Request slots available when sampled.
    pub capacity: f64,
}

impl LoadObservation {
    fn load(&self) -> f64 {
        self.throughput + self.queue_length
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    /// Expected next load divided by current load.
    pub multiplier: f64,
    /// In `[0, 1]`.
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy)]
struct Model {
    weights: [f64; FEATURES],
    mean_throughput: f64,
    confidence: f64,
}

pub struct LoadPredictor {
    samples: RingBuffer<LoadObservation>,
    model: Option<Model>,
    last_trained: Option<Instant>,
}

impl LoadPredictor {
    pub fn new(window: usize) -> Self {
        Self {
            samples: RingBuffer::new(window),
            model: None,
            last_trained: None,
        }
    }

    pub fn observe(&mut self, observation: LoadObservation) {
        self.samples.push(observation);
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn is_trained(&self) -> bool {
        self.model.is_some()
    }

    /// Train when never trained or when `interval` has passed since the last fit.
    pub fn maybe_retrain(&mut self, now: Instant, interval: Duration) -> bool {
        let due = self
            .last_trained
            .map_or(true, |t| now.saturating_duration_since(t) >= interval);
        if due && self.train() {
            self.last_trained = Some(now);
            return true;
        }
        false
    }

    /// Fit on the retained window. Returns false when there is too little
    /// history; the previous model is kept in that case.
    pub fn train(&mut self) -> bool {
        let samples: Vec<LoadObservation> = self.samples.iter().copied().collect();
        if samples.len() < MIN_PAIRS + 1 {
            return false;
        }
        let throughputs: Vec<f64> = samples.iter().map(|s| s.throughput).collect();
        let mean_throughput = mean(&throughputs);

        let (xs, ys): (Vec<[f64; FEATURES]>, Vec<f64>) = samples
            .windows(2)
            .map(|w| (features(&w[0], mean_throughput), target(&w[0], &w[1])))
            .unzip();
        let n = xs.len() as f64;

        let mut weights = [0.0; FEATURES];
        for _ in 0..EPOCHS {
            let mut grad = [0.0; FEATURES];
            for (x, y) in xs.iter().zip(&ys) {
                let err = dot(&weights, x) - y;
                for (g, xi) in grad.iter_mut().zip(x) {
                    *g += err * xi;
                }
            }
            for (w, g) in weights.iter_mut().zip(grad) {
                *w -= LEARNING_RATE * 2.0 * g / n;
            }
        }

        let y_mean = mean(&ys);
        let ss_tot: f64 = ys.iter().map(|y| (y - y_mean).powi(2)).sum();
        let ss_res: f64 = xs.iter().zip(&ys).map(|(x, y)| (dot(&weights, x) - y).powi(2)).sum();
        // A flat target has no variance to explain; score the fit against
        // the target's magnitude instead.
        let r_squared = if ss_tot <= f64::EPSILON * n {
            1.0 - (ss_res / n) / y_mean.powi(2).max(f64::EPSILON)
        } else {
            1.0 - ss_res / ss_tot
        };
        let confidence = r_squared.clamp(0.0, 1.0) * (n / FULL_CONFIDENCE_PAIRS).min(1.0);

        debug!(pairs = xs.len(), r_squared, confidence, "load predictor trained");
        self.model = Some(Model {
            weights,
            mean_throughput,
            confidence,
        });
        true
    }

    pub fn predict(&self, current: &LoadObservation) -> Option<Prediction> {
        let model = self.model?;
        let multiplier = dot(&model.weights, &features(current, model.mean_throughput)).clamp(0.0, MAX_MULTIPLIER);
        Some(Prediction {
            multiplier,
            confidence: model.confidence,
        })
    }
}

fn features(obs: &LoadObservation, mean_throughput: f64) -> [f64; FEATURES] {
    let angle = TAU * obs.hour_of_day.rem_euclid(24.0) / 24.0;
    let throughput_ratio = if mean_throughput > 0.0 {
        obs.throughput / mean_throughput
    } else {
        1.0
    };
    let queue_ratio = obs.queue_length / obs.capacity.max(1.0);
    [
        angle.sin(),
        angle.cos(),
        throughput_ratio.clamp(0.0, MAX_RATIO_FEATURE),
        queue_ratio.clamp(0.0, MAX_RATIO_FEATURE),
        1.0,
    ]
}

fn target(current: &LoadObservation, next: &LoadObservation) -> f64 {
    let now = current.load();
    if now <= 0.0 {
        return if next.load() > 0.0 { MAX_MULTIPLIER } else { 1.0 };
    }
    (next.load() / now).clamp(0.0, MAX_MULTIPLIER)
}

fn dot(a: &[f64; FEATURES], b: &[f64; FEATURES]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(hour: f64, throughput: f64, queue: f64) -> LoadObservation {
        LoadObservation {
            hour_of_day: hour,
            throughput,
            queue_length: queue,
            capacity: 10.0,
        }
    }

    #[test]
    fn untrained_predicts_nothing() {
        let mut p = LoadPredictor::new(100);
        assert!(p.predict(&obs(12.0, 1.0, 1.0)).is_none());
        for h in 0..3 {
            p.observe(obs(h as f64, 1.0, 1.0));
        }
        assert!(!p.train());
        assert!(!p.is_trained());
    }

    #[test]
    fn steady_load_predicts_unit_multiplier() {
        let mut p = LoadPredictor::new(100);
        for i in 0..30 {
            p.observe(obs((i % 24) as f64, 10.0, 5.0));
        }
        assert!(p.train());
        let pred = p.predict(&obs(6.0, 10.0, 5.0)).unwrap();
        assert!((pred.multiplier - 1.0).abs() < 0.05, "{pred:?}");
        assert!(pred.confidence > 0.9);
    }

    #[test]
    fn growing_load_predicts_surge() {
        let mut p = LoadPredictor::new(100);
        let mut load = 1.0;
        for i in 0..25 {
            p.observe(obs(i as f64 % 24.0, load, load));
            load *= 1.5;
        }
        assert!(p.train());
        let pred = p.predict(&obs(1.0, 4.0, 4.0)).unwrap();
        assert!(pred.multiplier > 1.2, "{pred:?}");
        assert!(pred.confidence > 0.6, "{pred:?}");
    }

    #[test]
    fn few_pairs_discount_confidence() {
        let mut p = LoadPredictor::new(100);
        for i in 0..7 {
            p.observe(obs(i as f64, 10.0, 5.0));
        }
        assert!(p.train());
        let pred = p.predict(&obs(3.0, 10.0, 5.0)).unwrap();
        assert!(pred.confidence <= 6.0 / 20.0 + 1e-9);
    }

    #[test]
    fn retrain_respects_interval() {
        let mut p = LoadPredictor::new(100);
        for i in 0..10 {
            p.observe(obs(i as f64, 10.0, 5.0));
        }
        let t0 = Instant::now();
        let hour = Duration::from_secs(3600);
        assert!(p.maybe_retrain(t0, hour));
        assert!(!p.maybe_retrain(t0 + Duration::from_secs(60), hour));
        assert!(p.maybe_retrain(t0 + hour, hour));
    }
}
