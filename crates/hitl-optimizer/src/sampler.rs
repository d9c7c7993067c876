//! Samplers that propose parameter vectors from trial history.

use hitl_types::HitlResult;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, SQRT_2};

use crate::search::{ParameterDef, ParameterKind, Params, SearchSpace};
use crate::trial::{ObjectiveDirection, Trial, TrialState};

/// Common trait for all sampling strategies.
pub trait Sampler: Send {
    /// Propose the next parameter vector given every trial recorded so far
    /// (running ones included). Fails on a search space with empty or
    /// inverted ranges.
    fn sample(
        &mut self,
        space: &SearchSpace,
        history: &[Trial],
        direction: ObjectiveDirection,
    ) -> HitlResult<Params>;

    /// Human-readable strategy name.
    fn name(&self) -> &str;
}

/// Serializable sampler selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SamplerConfig {
    Random { seed: Option<u64> },
    Tpe(TpeConfig),
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self::Tpe(TpeConfig::default())
    }
}

impl SamplerConfig {
    pub fn build(&self) -> Box<dyn Sampler> {
        match self {
            Self::Random { seed } => Box::new(RandomSampler::new(*seed)),
            Self::Tpe(config) => Box::new(TpeSampler::new(config.clone())),
        }
    }
}

fn rng_from(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

fn sample_uniform(kind: &ParameterKind, rng: &mut StdRng) -> crate::search::ParameterValue {
    let (low, high) = kind.internal_bounds();
    kind.from_internal(rng.random_range(low..=high))
}

// ---- Random sampling ----

/// Independent random sampling across the search space.
#[derive(Debug, Clone)]
pub struct RandomSampler {
    rng: StdRng,
}

impl RandomSampler {
    pub fn new(seed: Option<u64>) -> Self {
        Self { rng: rng_from(seed) }
    }

    fn sample_one(&mut self, space: &SearchSpace) -> Params {
        space
            .parameters
            .iter()
            .map(|param| (param.name.clone(), sample_uniform(&param.kind, &mut self.rng)))
            .collect()
    }
}

impl Sampler for RandomSampler {
    fn sample(
        &mut self,
        space: &SearchSpace,
        _history: &[Trial],
        _direction: ObjectiveDirection,
    ) -> HitlResult<Params> {
        space.validate()?;
        Ok(self.sample_one(space))
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Tree-structured Parzen Estimator ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TpeConfig {
    /// Completed trials required before the model takes over from random
    /// sampling.
    pub n_startup_trials: usize,
    /// Candidates drawn from the "good" density per parameter.
    pub n_ei_candidates: usize,
    /// Treat running trials as the worst possible result so that proposals
    /// made while earlier ones await scoring spread out.
    pub constant_liar: bool,
    pub prior_weight: f64,
    pub seed: Option<u64>,
}

impl Default for TpeConfig {
    fn default() -> Self {
        Self {
            n_startup_trials: 5,
            n_ei_candidates: 24,
            constant_liar: true,
            prior_weight: 1.0,
            seed: None,
        }
    }
}

impl TpeConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_startup_trials(mut self, n: usize) -> Self {
        self.n_startup_trials = n;
        self
    }

    pub fn with_constant_liar(mut self, enabled: bool) -> Self {
        self.constant_liar = enabled;
        self
    }
}

/// Independent (per-parameter) TPE sampler.
///
/// Observations are split into a small "below" set of the best losses and
/// the "above" remainder; each set is modelled as a truncated Gaussian
/// mixture and the candidate maximizing `l(x) / g(x)` wins.
#[derive(Debug, Clone)]
pub struct TpeSampler {
    config: TpeConfig,
    rng: StdRng,
}

impl TpeSampler {
    pub fn new(config: TpeConfig) -> Self {
        let rng = rng_from(config.seed);
        Self { config, rng }
    }

    /// `(internal x, loss)` pairs for one parameter, sorted best first.
    fn observations(
        &self,
        param: &ParameterDef,
        history: &[Trial],
        direction: ObjectiveDirection,
    ) -> Vec<(f64, f64)> {
        let mut obs: Vec<(f64, f64)> = history
            .iter()
            .filter_map(|trial| {
                let value = trial.param(&param.name)?;
                let x = param.kind.to_internal(&value);
                match trial.state {
                    TrialState::Complete => trial
                        .value
                        .filter(|v| v.is_finite())
                        .map(|v| (x, direction.to_loss(v))),
                    TrialState::Running if self.config.constant_liar => Some((x, f64::INFINITY)),
                    _ => None,
                }
            })
            .collect();
        obs.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        obs
    }

    fn sample_param(
        &mut self,
        param: &ParameterDef,
        history: &[Trial],
        direction: ObjectiveDirection,
    ) -> crate::search::ParameterValue {
        let (low, high) = param.kind.internal_bounds();
        if high - low <= 0.0 {
            return param.kind.from_internal(low);
        }

        let obs = self.observations(param, history, direction);
        let n_below = gamma(obs.len());
        let (below, above) = obs.split_at(n_below);
        let below: Vec<f64> = below.iter().map(|(x, _)| *x).collect();
        let above: Vec<f64> = above.iter().map(|(x, _)| *x).collect();

        let l = ParzenEstimator::fit(&below, low, high, self.config.prior_weight);
        let g = ParzenEstimator::fit(&above, low, high, self.config.prior_weight);

        let mut best_x = l.sample(&mut self.rng);
        let mut best_score = l.log_pdf(best_x) - g.log_pdf(best_x);
        for _ in 1..self.config.n_ei_candidates.max(1) {
            let x = l.sample(&mut self.rng);
            let score = l.log_pdf(x) - g.log_pdf(x);
            if score > best_score {
                best_x = x;
                best_score = score;
            }
        }
        param.kind.from_internal(best_x)
    }
}

impl Sampler for TpeSampler {
    fn sample(
        &mut self,
        space: &SearchSpace,
        history: &[Trial],
        direction: ObjectiveDirection,
    ) -> HitlResult<Params> {
        space.validate()?;
        let n_complete = history
            .iter()
            .filter(|t| t.state == TrialState::Complete)
            .count();

        if n_complete < self.config.n_startup_trials {
            return Ok(space
                .parameters
                .iter()
                .map(|param| (param.name.clone(), sample_uniform(&param.kind, &mut self.rng)))
                .collect());
        }

        Ok(space
            .parameters
            .iter()
            .map(|param| (param.name.clone(), self.sample_param(param, history, direction)))
            .collect())
    }

    fn name(&self) -> &str {
        "tpe"
    }
}

/// Size of the "below" split for `n` observations.
fn gamma(n: usize) -> usize {
    ((n as f64 * 0.1).ceil() as usize).min(25)
}

/// Mixture of Gaussians truncated to `[low, high]`, one component per
/// observation plus a wide prior centred on the range.
#[derive(Debug, Clone)]
struct ParzenEstimator {
    mus: Vec<f64>,
    sigmas: Vec<f64>,
    weights: Vec<f64>,
    low: f64,
    high: f64,
}

impl ParzenEstimator {
    fn fit(observations: &[f64], low: f64, high: f64, prior_weight: f64) -> Self {
        let range = high - low;
        let prior_mu = 0.5 * (low + high);

        // (mu, is_prior) sorted by mu so bandwidths come from neighbour gaps.
        let mut points: Vec<(f64, bool)> = observations.iter().map(|&x| (x, false)).collect();
        points.push((prior_mu, true));
        points.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let min_sigma = range / (1.0 + points.len() as f64).min(100.0);
        let mut mus = Vec::with_capacity(points.len());
        let mut sigmas = Vec::with_capacity(points.len());
        let mut weights = Vec::with_capacity(points.len());

        for (i, &(mu, is_prior)) in points.iter().enumerate() {
            let left = if i == 0 { low } else { points[i - 1].0 };
            let right = if i + 1 == points.len() { high } else { points[i + 1].0 };
            let sigma = if is_prior {
                range
            } else {
                (mu - left).max(right - mu).clamp(min_sigma, range)
            };
            mus.push(mu);
            sigmas.push(sigma);
            weights.push(if is_prior { prior_weight } else { 1.0 });
        }

        let total: f64 = weights.iter().sum();
        for w in &mut weights {
            *w /= total;
        }

        Self {
            mus,
            sigmas,
            weights,
            low,
            high,
        }
    }

    fn sample(&self, rng: &mut StdRng) -> f64 {
        let pick: f64 = rng.random();
        let mut acc = 0.0;
        let mut idx = self.weights.len() - 1;
        for (i, w) in self.weights.iter().enumerate() {
            acc += w;
            if pick < acc {
                idx = i;
                break;
            }
        }

        let (mu, sigma) = (self.mus[idx], self.sigmas[idx]);
        for _ in 0..100 {
            let x = mu + sigma * standard_normal(rng);
            if x >= self.low && x <= self.high {
                return x;
            }
        }
        mu.clamp(self.low, self.high)
    }

    fn log_pdf(&self, x: f64) -> f64 {
        let terms: Vec<f64> = self
            .mus
            .iter()
            .zip(&self.sigmas)
            .zip(&self.weights)
            .map(|((&mu, &sigma), &w)| {
                let mass = (normal_cdf((self.high - mu) / sigma) - normal_cdf((self.low - mu) / sigma))
                    .max(1e-12);
                let z = (x - mu) / sigma;
                w.ln() - 0.5 * z * z - sigma.ln() - 0.5 * (2.0 * PI).ln() - mass.ln()
            })
            .collect();

        let max = terms.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if max == f64::NEG_INFINITY {
            return max;
        }
        max + terms.iter().map(|t| (t - max).exp()).sum::<f64>().ln()
    }
}

fn standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = 1.0 - rng.random::<f64>();
    let u2: f64 = rng.random();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / SQRT_2))
}

/// Abramowitz & Stegun 7.1.26, absolute error below 1.5e-7.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = ((((1.061_405_429 * t - 1.453_152_027) * t + 1.421_413_741) * t - 0.284_496_736) * t
        + 0.254_829_592)
        * t;
    sign * (1.0 - poly * (-x * x).exp())
}
