//! Exponential moving average trackers
//!
//! Every smoothed quantity in the synchronizer (CP metrics, CFO means) is an
//! [`Ema`] value updated functionally so convergence can be tested on its own.

/// Exponential moving average `new = alpha * sample + (1 - alpha) * old`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ema {
    alpha: f32,
    mean: Option<f32>,
}

impl Ema {
    /// Tracker whose first sample becomes the mean
    pub fn new(alpha: f32) -> Self {
        Self { alpha, mean: None }
    }

    /// Tracker starting from a fixed value, so the first sample is already smoothed
    pub fn starting_at(alpha: f32, value: f32) -> Self {
        Self {
            alpha,
            mean: Some(value),
        }
    }

    /// Fold one sample into the average
    #[must_use]
    pub fn update(self, sample: f32) -> Self {
        let mean = match self.mean {
            Some(old) => self.alpha * sample + (1.0 - self.alpha) * old,
            None => sample,
        };
        Self {
            alpha: self.alpha,
            mean: Some(mean),
        }
    }

    /// Current average, zero before the first sample
    pub fn value(&self) -> f32 {
        self.mean.unwrap_or(0.0)
    }

    pub fn is_set(&self) -> bool {
        self.mean.is_some()
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    /// Change the smoothing factor, keeping the current mean
    #[must_use]
    pub fn with_alpha(self, alpha: f32) -> Self {
        Self { alpha, mean: self.mean }
    }

    /// Forget the history
    #[must_use]
    pub fn reset(self) -> Self {
        Self {
            alpha: self.alpha,
            mean: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_seeds_mean() {
        let ema = Ema::new(0.1);
        assert!(!ema.is_set());
        assert_eq!(ema.value(), 0.0);
        let ema = ema.update(2.5);
        assert!(ema.is_set());
        assert_eq!(ema.value(), 2.5);
    }

    #[test]
    fn test_update_formula() {
        let ema = Ema::new(0.25).update(4.0).update(0.0);
        assert!((ema.value() - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_starting_at_smooths_first_sample() {
        let ema = Ema::starting_at(0.1, 0.0).update(1.0);
        assert!((ema.value() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_converges_to_constant_input() {
        let mut ema = Ema::starting_at(0.1, 0.0);
        for _ in 0..200 {
            ema = ema.update(0.3);
        }
        assert!((ema.value() - 0.3).abs() < 1e-4);
    }

    #[test]
    fn test_reset_keeps_alpha() {
        let ema = Ema::new(0.2).update(1.0).reset();
        assert!(!ema.is_set());
        assert_eq!(ema.alpha(), 0.2);
        assert_eq!(ema.with_alpha(0.5).update(1.0).alpha(), 0.5);
    }
}
