use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const RATING_MIN: f64 = 1.0;
pub const RATING_MAX: f64 = 5.0;

/// Keeps `ln(1 - 2|u|)` finite.
const U_BOUND: f64 = 0.5 - 1e-12;

#[derive(Debug, Error, Clone, PartialEq, Serialize)]
pub enum DpError {
    #[error("epsilon must be a positive finite number, got {0}")]
    InvalidEpsilon(f64),
    #[error("sensitivity must be a positive finite number, got {0}")]
    InvalidSensitivity(f64),
}

/// Laplace noise source. Seedable so tests are reproducible.
pub struct LaplaceMechanism {
    rng: ChaCha20Rng,
}

impl LaplaceMechanism {
    pub fn from_entropy() -> Self {
        Self {
            rng: ChaCha20Rng::from_entropy(),
        }
    }

    pub fn seeded(seed: [u8; 32]) -> Self {
        Self {
            rng: ChaCha20Rng::from_seed(seed),
        }
    }

    /// One draw from Laplace(0, scale).
    pub fn sample(&mut self, scale: f64) -> f64 {
        let u = (self.rng.gen::<f64>() - 0.5).clamp(-U_BOUND, U_BOUND);
        let sign = if u >= 0.0 { 1.0 } else { -1.0 };
        -scale * sign * (1.0 - 2.0 * u.abs()).ln()
    }

    /// `value` plus Laplace(sensitivity / epsilon), floored at zero.
    pub fn add_noise(&mut self, value: f64, epsilon: f64, sensitivity: f64) -> Result<f64, DpError> {
        let scale = laplace_scale(epsilon, sensitivity)?;
        Ok((value + self.sample(scale)).max(0.0))
    }

    /// Like [`LaplaceMechanism::add_noise`] but clamped to the rating scale.
    pub fn noisy_rating_mean(
        &mut self,
        mean: f64,
        epsilon: f64,
        sensitivity: f64,
    ) -> Result<f64, DpError> {
        let scale = laplace_scale(epsilon, sensitivity)?;
        Ok((mean + self.sample(scale)).clamp(RATING_MIN, RATING_MAX))
    }
}

fn laplace_scale(epsilon: f64, sensitivity: f64) -> Result<f64, DpError> {
    if !(epsilon.is_finite() && epsilon > 0.0) {
        return Err(DpError::InvalidEpsilon(epsilon));
    }
    if !(sensitivity.is_finite() && sensitivity > 0.0) {
        return Err(DpError::InvalidSensitivity(sensitivity));
    }
    Ok(sensitivity / epsilon)
}

pub fn add_differential_privacy_noise(
    value: f64,
    epsilon: f64,
    sensitivity: f64,
) -> Result<f64, DpError> {
    LaplaceMechanism::from_entropy().add_noise(value, epsilon, sensitivity)
}

pub fn noisy_rating_mean(mean: f64, epsilon: f64, sensitivity: f64) -> Result<f64, DpError> {
    LaplaceMechanism::from_entropy().noisy_rating_mean(mean, epsilon, sensitivity)
}

/// True when the group aggregates at least `k` individuals.
pub fn check_k_anonymity(group_size: usize, k: usize) -> bool {
    group_size >= k
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyVerdict {
    pub is_safe: bool,
    pub message: String,
}

pub fn check_statistical_safety(total: usize, min_required: usize) -> SafetyVerdict {
    if total >= min_required {
        SafetyVerdict {
            is_safe: true,
            message: format!("{total} responses meet the minimum of {min_required}"),
        }
    } else {
        SafetyVerdict {
            is_safe: false,
            message: format!(
                "Not enough responses to display results safely ({total} of {min_required} required)"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn k_anonymity_gate() {
        assert!(!check_k_anonymity(4, 5));
        assert!(check_k_anonymity(5, 5));
        assert!(check_k_anonymity(12, 5));
    }

    #[test]
    fn statistical_safety_reports_shortfall() {
        let verdict = check_statistical_safety(3, 10);
        assert!(!verdict.is_safe);
        assert!(verdict.message.contains("3 of 10"));
        assert!(check_statistical_safety(10, 10).is_safe);
    }

    #[test]
    fn seeded_mechanism_is_reproducible() {
        let mut a = LaplaceMechanism::seeded([7u8; 32]);
        let mut b = LaplaceMechanism::seeded([7u8; 32]);
        for _ in 0..16 {
            assert_eq!(a.sample(1.0), b.sample(1.0));
        }
    }

    #[test]
    fn noise_is_centered_on_the_true_value() {
        let mut mechanism = LaplaceMechanism::seeded([3u8; 32]);
        let n = 20_000;
        let total: f64 = (0..n)
            .map(|_| mechanism.add_noise(100.0, 1.0, 1.0).unwrap())
            .sum();
        let mean = total / n as f64;
        assert!((mean - 100.0).abs() < 0.1, "mean drifted to {mean}");
    }

    #[test]
    fn outputs_are_clamped() {
        let mut mechanism = LaplaceMechanism::seeded([9u8; 32]);
        for _ in 0..1_000 {
            assert!(mechanism.add_noise(0.0, 0.05, 1.0).unwrap() >= 0.0);
            let mean = mechanism.noisy_rating_mean(4.8, 0.05, 1.0).unwrap();
            assert!((RATING_MIN..=RATING_MAX).contains(&mean));
        }
    }

    #[test]
    fn rejects_invalid_parameters() {
        assert_eq!(
            add_differential_privacy_noise(1.0, 0.0, 1.0),
            Err(DpError::InvalidEpsilon(0.0))
        );
        assert_eq!(
            add_differential_privacy_noise(1.0, 1.0, -1.0),
            Err(DpError::InvalidSensitivity(-1.0))
        );
        assert!(noisy_rating_mean(3.0, f64::NAN, 1.0).is_err());
    }

    #[test]
    fn boundary_draws_stay_finite() {
        let mut mechanism = LaplaceMechanism::seeded([0u8; 32]);
        for _ in 0..10_000 {
            assert!(mechanism.sample(2.0).is_finite());
        }
    }
}
