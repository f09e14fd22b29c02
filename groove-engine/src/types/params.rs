//! Adaptive parameters with Bayesian learning

use rand::Rng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};

/// A Beta-distributed parameter learned from weighted outcomes.
///
/// `prior_alpha`/`prior_beta` are the current pseudo-counts; they start at
/// the prior and only ever grow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveParam {
    pub value: f64,
    pub uncertainty: f64,
    pub observations: u64,
    pub prior_alpha: f64,
    pub prior_beta: f64,
}

impl Default for AdaptiveParam {
    fn default() -> Self {
        Self::new_uninformed()
    }
}

impl AdaptiveParam {
    /// Create with uninformed (uniform) prior
    pub fn new_uninformed() -> Self {
        Self::new_with_prior(1.0, 1.0)
    }

    /// Create with informed prior
    pub fn new_with_prior(alpha: f64, beta: f64) -> Self {
        Self {
            value: alpha / (alpha + beta),
            uncertainty: 1.0,
            observations: 0,
            prior_alpha: alpha,
            prior_beta: beta,
        }
    }

    /// Prior centred on `mean` with total pseudo-count `strength`
    pub fn from_mean(mean: f64, strength: f64) -> Self {
        let mean = mean.clamp(0.0, 1.0);
        Self::new_with_prior(mean * strength, (1.0 - mean) * strength)
    }

    /// Bayesian update with an outcome in [0, 1]
    pub fn update(&mut self, outcome: f64, weight: f64) {
        let outcome = outcome.clamp(0.0, 1.0);
        let weight = weight.max(0.0);
        self.observations += 1;
        let effective_weight = weight / (1.0 + self.uncertainty);
        self.prior_alpha += outcome * effective_weight;
        self.prior_beta += (1.0 - outcome) * effective_weight;
        self.value = self.prior_alpha / (self.prior_alpha + self.prior_beta);
        self.uncertainty = 1.0 / (1.0 + (self.observations as f64).sqrt());
    }

    /// Update from a signed outcome in [-1, 1] weighted by its confidence
    pub fn observe(&mut self, value: f64, confidence: f64) {
        self.update((value.clamp(-1.0, 1.0) + 1.0) / 2.0, confidence);
    }

    /// Thompson sample using the supplied RNG
    pub fn sample_with<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match Beta::new(self.prior_alpha, self.prior_beta) {
            Ok(beta) => beta.sample(rng),
            Err(_) => self.value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_uninformed_prior() {
        let param = AdaptiveParam::new_uninformed();
        assert!((param.value - 0.5).abs() < 0.001);
        assert_eq!(param.observations, 0);
    }

    #[test]
    fn test_from_mean_sets_pseudo_counts() {
        let param = AdaptiveParam::from_mean(0.4, 10.0);
        assert!((param.prior_alpha - 4.0).abs() < 1e-9);
        assert!((param.prior_beta - 6.0).abs() < 1e-9);
        assert!((param.value - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_update_moves_toward_outcome() {
        let mut param = AdaptiveParam::new_uninformed();
        param.update(1.0, 1.0);
        assert!(param.value > 0.5);
        assert_eq!(param.observations, 1);
    }

    #[test]
    fn test_observe_negative_value_lowers_mean() {
        let mut param = AdaptiveParam::from_mean(0.5, 10.0);
        param.observe(-0.8, 0.9);
        assert!(param.value < 0.5);
    }

    #[test]
    fn test_update_never_shrinks_pseudo_counts() {
        let mut param = AdaptiveParam::from_mean(0.3, 10.0);
        let (a, b) = (param.prior_alpha, param.prior_beta);
        param.observe(0.2, 0.5);
        assert!(param.prior_alpha >= a);
        assert!(param.prior_beta >= b);
    }

    #[test]
    fn test_uncertainty_decreases_with_observations() {
        let mut param = AdaptiveParam::new_uninformed();
        let initial_uncertainty = param.uncertainty;
        param.update(0.5, 1.0);
        assert!(param.uncertainty < initial_uncertainty);
    }

    #[test]
    fn test_sample_returns_valid_probability() {
        let param = AdaptiveParam::new_uninformed();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let sample = param.sample_with(&mut rng);
            assert!((0.0..=1.0).contains(&sample));
        }
    }

    #[test]
    fn test_degenerate_param_samples_its_value() {
        let param = AdaptiveParam {
            value: 0.25,
            uncertainty: 1.0,
            observations: 0,
            prior_alpha: 0.0,
            prior_beta: 0.0,
        };
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(param.sample_with(&mut rng), 0.25);
    }
}
