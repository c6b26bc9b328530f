//! Score-based pool sizing with a cooldown and a load forecast override.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sluice_core::ScalingSection;
use tracing::{debug, info};

use crate::predictor::{LoadObservation, LoadPredictor, Prediction};
use crate::resources::ResourceSignal;
use crate::stats::RingBuffer;

/// Observations kept for predictor training.
const PREDICTOR_WINDOW: usize = 720;
/// Direction changes within the recent window that count as oscillation.
const OSCILLATION_FLIPS: usize = 3;
const RECENT_EVENTS: usize = 10;

/// Everything the scaler looks at for one pool.
#[derive(Debug, Clone)]
pub struct ScalingInputs {
    pub pool: String,
    pub current: usize,
    pub min: usize,
    pub max: usize,
    /// Utilization in `[0, 1]`.
    pub cpu: f64,
    pub memory: f64,
    /// Pending requests weighted by priority; a Normal request counts 1.
    pub pending: f64,
    pub avg_latency_ms: f64,
    /// Host-derived worker ceiling for grow targets.
    pub optimal_workers: Option<usize>,
    pub resource_signal: ResourceSignal,
    pub load: LoadObservation,
}

/// Normalized pressures, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalingFactors {
    pub cpu: f64,
    pub memory: f64,
    pub queue: f64,
    pub latency: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingVerdict {
    ScaleUp,
    ScaleDown,
    Maintain,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingDecision {
    pub pool: String,
    pub verdict: ScalingVerdict,
    pub from: usize,
    pub to: usize,
    pub score: f64,
    pub factors: ScalingFactors,
    pub prediction: Option<Prediction>,
    pub reason: String,
}

impl ScalingDecision {
    pub fn is_actionable(&self) -> bool {
        self.verdict != ScalingVerdict::Maintain && self.from != self.to
    }
}

/// A resize that was attempted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingEvent {
    pub pool: String,
    pub from: usize,
    pub to: usize,
    pub reason: String,
    pub at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub score: f64,
    /// The target sat on the pool's min or max bound.
    pub at_bound: bool,
}

impl ScalingEvent {
    fn direction(&self) -> i8 {
        match self.to.cmp(&self.from) {
            std::cmp::Ordering::Greater => 1,
            std::cmp::Ordering::Less => -1,
            std::cmp::Ordering::Equal => 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScalerStats {
    pub evaluations: u64,
    pub events: usize,
    pub scale_ups: usize,
    pub scale_downs: usize,
    pub failures: usize,
    pub mean_duration_ms: f64,
    pub predictor_trained: bool,
}

pub struct DynamicScaler {
    config: ScalingSection,
    predictor: LoadPredictor,
    events: RingBuffer<ScalingEvent>,
    last_action: HashMap<String, Instant>,
    last_evaluation: Option<Instant>,
    evaluations: u64,
}

impl DynamicScaler {
    pub fn new(config: ScalingSection) -> Self {
        Self {
            events: RingBuffer::new(config.max_events),
            predictor: LoadPredictor::new(PREDICTOR_WINDOW),
            config,
            last_action: HashMap::new(),
            last_evaluation: None,
            evaluations: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &ScalingSection {
        &self.config
    }

    /// True once per `evaluate_interval`; the first call is always due.
    pub fn is_due(&mut self, now: Instant) -> bool {
        let due = self
            .last_evaluation
            .map_or(true, |t| now.saturating_duration_since(t) >= self.config.evaluate_interval());
        if due {
            self.last_evaluation = Some(now);
        }
        due
    }

    /// Feed the predictor and refit it when the retrain interval is up.
    pub fn observe_load(&mut self, observation: LoadObservation, now: Instant) {
        self.predictor.observe(observation);
        if self.predictor.maybe_retrain(now, self.config.retrain_interval()) {
            info!(samples = self.predictor.sample_count(), "load predictor retrained");
        }
    }

    pub fn predict(&self, current: &LoadObservation) -> Option<Prediction> {
        self.predictor.predict(current)
    }

    pub fn factors(&self, inputs: &ScalingInputs) -> ScalingFactors {
        let workers = inputs.current.max(1) as f64;
        let queue_capacity = (workers * self.config.target_queue_per_worker).max(1.0);
        ScalingFactors {
            cpu: inputs.cpu.clamp(0.0, 1.0),
            memory: inputs.memory.clamp(0.0, 1.0),
            queue: (inputs.pending / queue_capacity).clamp(0.0, 1.0),
            latency: (inputs.avg_latency_ms / self.config.target_latency_ms.max(1.0)).clamp(0.0, 1.0),
        }
    }

    /// Weighted average of the factors.
    pub fn score(&self, factors: &ScalingFactors) -> f64 {
        let w = &self.config.weights;
        let total = w.cpu + w.memory + w.queue + w.latency;
        if total <= 0.0 {
            return 0.0;
        }
        (factors.cpu * w.cpu + factors.memory * w.memory + factors.queue * w.queue + factors.latency * w.latency)
            / total
    }

    /// Pure verdict for one pool, ignoring cooldown.
    pub fn decide(&self, inputs: &ScalingInputs, prediction: Option<Prediction>) -> ScalingDecision {
        let c = &self.config;
        let factors = self.factors(inputs);
        let score = self.score(&factors);
        let current = inputs.current.clamp(inputs.min, inputs.max.max(inputs.min));

        let ceiling = inputs
            .optimal_workers
            .map_or(inputs.max, |n| n.clamp(inputs.min, inputs.max))
            .max(current);
        let grow = |n: usize| ((n as f64 * c.scale_up_factor).ceil() as usize).max(n + 1).min(ceiling);
        let shrink = |n: usize| ((n as f64 * c.scale_down_factor).floor() as usize).max(inputs.min);

        let (mut verdict, mut reason) = if score > c.scale_up_threshold {
            (ScalingVerdict::ScaleUp, format!("score {score:.2} above {:.2}", c.scale_up_threshold))
        } else if score < c.scale_down_threshold {
            (ScalingVerdict::ScaleDown, format!("score {score:.2} below {:.2}", c.scale_down_threshold))
        } else {
            (ScalingVerdict::Maintain, format!("score {score:.2} within band"))
        };

        if verdict == ScalingVerdict::Maintain {
            if let Some(p) = prediction.filter(|p| p.confidence > c.predictor_min_confidence) {
                if p.multiplier > c.predictor_upper_bound {
                    verdict = ScalingVerdict::ScaleUp;
                    reason = format!("forecast load x{:.2} (confidence {:.2})", p.multiplier, p.confidence);
                } else if p.multiplier < c.predictor_lower_bound {
                    verdict = ScalingVerdict::ScaleDown;
                    reason = format!("forecast load x{:.2} (confidence {:.2})", p.multiplier, p.confidence);
                }
            }
        }

        if verdict == ScalingVerdict::ScaleDown && inputs.resource_signal == ResourceSignal::ScaleUp {
            verdict = ScalingVerdict::Maintain;
            reason = "scale-down vetoed by resource trend".to_string();
        }

        if verdict == ScalingVerdict::ScaleUp && ceiling < inputs.max && grow(current) == ceiling {
            reason = format!("{reason}, capped at {ceiling} by host capacity");
        }

        let to = match verdict {
            ScalingVerdict::ScaleUp => grow(current),
            ScalingVerdict::ScaleDown => shrink(current),
            ScalingVerdict::Maintain => current,
        };

        ScalingDecision {
            pool: inputs.pool.clone(),
            verdict,
            from: inputs.current,
            to,
            score,
            factors,
            prediction,
            reason,
        }
    }

    /// Decide and return only actions that may run now. An issued action
    /// starts the pool's cooldown.
    pub fn evaluate_at(&mut self, inputs: &ScalingInputs, now: Instant) -> Option<ScalingDecision> {
        self.evaluations += 1;
        let prediction = self.predictor.predict(&inputs.load);
        let decision = self.decide(inputs, prediction);
        if !decision.is_actionable() {
            debug!(pool = %inputs.pool, score = decision.score, "scaling: maintain");
            return None;
        }
        if let Some(remaining) = self.cooldown_remaining(&inputs.pool, now) {
            debug!(
                pool = %inputs.pool,
                remaining_ms = remaining.as_millis() as u64,
                "scaling suppressed by cooldown"
            );
            return None;
        }
        self.last_action.insert(inputs.pool.clone(), now);
        info!(
            pool = %decision.pool,
            from = decision.from,
            to = decision.to,
            score = decision.score,
            reason = %decision.reason,
            "scaling decision"
        );
        Some(decision)
    }

    pub fn cooldown_remaining(&self, pool: &str, now: Instant) -> Option<Duration> {
        let last = *self.last_action.get(pool)?;
        let elapsed = now.saturating_duration_since(last);
        let cooldown = self.config.cooldown();
        (elapsed < cooldown).then(|| cooldown - elapsed)
    }

    /// Record the outcome of executing a decision.
    pub fn record_action(&mut self, decision: &ScalingDecision, reached: usize, min: usize, max: usize, duration: Duration) {
        let success = reached == decision.to;
        self.events.push(ScalingEvent {
            pool: decision.pool.clone(),
            from: decision.from,
            to: reached,
            reason: decision.reason.clone(),
            at: Utc::now(),
            duration_ms: duration.as_millis() as u64,
            success,
            score: decision.score,
            at_bound: reached == max || reached == min,
        });
    }

    pub fn events(&self) -> Vec<ScalingEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn recommendations(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut pools: Vec<&str> = self.events.iter().map(|e| e.pool.as_str()).collect();
        pools.sort_unstable();
        pools.dedup();

        for pool in pools {
            let recent: Vec<&ScalingEvent> = self
                .events
                .iter()
                .rev()
                .filter(|e| e.pool == pool)
                .take(RECENT_EVENTS)
                .collect();

            let flips = recent
                .windows(2)
                .filter(|w| w[0].direction() != 0 && w[0].direction() == -w[1].direction())
                .count();
            if flips >= OSCILLATION_FLIPS {
                out.push(format!(
                    "pool {pool} oscillates ({flips} direction changes); raise scaling.cooldown_secs"
                ));
            }

            let at_max = recent.iter().filter(|e| e.direction() > 0 && e.at_bound).count();
            if at_max >= 3 {
                out.push(format!("pool {pool} keeps hitting max_workers; consider raising it"));
            }

            let failed = recent.iter().filter(|e| !e.success).count();
            if failed > 0 {
                out.push(format!("pool {pool} had {failed} failed scaling actions; investigate unit startup"));
            }
        }
        out
    }

    pub fn stats(&self) -> ScalerStats {
        let events: Vec<&ScalingEvent> = self.events.iter().collect();
        let mean_duration_ms = if events.is_empty() {
            0.0
        } else {
            events.iter().map(|e| e.duration_ms as f64).sum::<f64>() / events.len() as f64
        };
        ScalerStats {
            evaluations: self.evaluations,
            events: events.len(),
            scale_ups: events.iter().filter(|e| e.direction() > 0).count(),
            scale_downs: events.iter().filter(|e| e.direction() < 0).count(),
            failures: events.iter().filter(|e| !e.success).count(),
            mean_duration_ms,
            predictor_trained: self.predictor.is_trained(),
        }
    }
}
