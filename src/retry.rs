//! Retry backoff policies for the dispatch queue.

/// Default exponential multiplier when not specified
pub const DEFAULT_EXPONENTIAL_MULTIPLIER: f64 = 2.0;

/// Upper bound on a single retry delay (1 hour).
pub const MAX_DELAY_MS: i64 = 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum BackoffConfig {
    /// No delay between retries (immediate retry)
    #[default]
    None,
    /// Linear backoff: delay = base_delay_ms * attempt_number
    Linear { base_delay_ms: i32 },
    /// Exponential backoff: delay = base_delay_ms * multiplier^(attempt_number - 1)
    Exponential { base_delay_ms: i32, multiplier: f64 },
}

impl BackoffConfig {
    pub fn kind_str(&self) -> &'static str {
        match self {
            BackoffConfig::None => "none",
            BackoffConfig::Linear { .. } => "linear",
            BackoffConfig::Exponential { .. } => "exponential",
        }
    }

    pub fn base_delay_ms(&self) -> i32 {
        match self {
            BackoffConfig::None => 0,
            BackoffConfig::Linear { base_delay_ms } => *base_delay_ms,
            BackoffConfig::Exponential { base_delay_ms, .. } => *base_delay_ms,
        }
    }

    pub fn calculate_delay_ms(&self, attempt_number: i32) -> i64 {
        if attempt_number <= 0 {
            return 0;
        }
        let delay = match self {
            BackoffConfig::None => 0,
            BackoffConfig::Linear { base_delay_ms } => {
                if *base_delay_ms <= 0 {
                    return 0;
                }
                (*base_delay_ms as i64) * (attempt_number as i64)
            }
            BackoffConfig::Exponential {
                base_delay_ms,
                multiplier,
            } => {
                if *base_delay_ms <= 0 {
                    return 0;
                }
                // delay = base_delay * multiplier^(attempt - 1)
                let exp = (attempt_number - 1) as f64;
                let factor = multiplier.powf(exp);
                ((*base_delay_ms as f64) * factor) as i64
            }
        };
        delay.min(MAX_DELAY_MS)
    }

    /// Delay for the given attempt as a chrono duration.
    pub fn delay_for_attempt(&self, attempt_number: i32) -> chrono::Duration {
        chrono::Duration::milliseconds(self.calculate_delay_ms(attempt_number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_never_delays() {
        let config = BackoffConfig::None;
        assert_eq!(config.calculate_delay_ms(1), 0);
        assert_eq!(config.calculate_delay_ms(10), 0);
        assert_eq!(config.kind_str(), "none");
    }

    #[test]
    fn linear_scales_with_attempts() {
        let config = BackoffConfig::Linear { base_delay_ms: 100 };
        assert_eq!(config.calculate_delay_ms(1), 100);
        assert_eq!(config.calculate_delay_ms(3), 300);
        assert_eq!(config.calculate_delay_ms(0), 0);
    }

    #[test]
    fn exponential_doubles_by_default_multiplier() {
        let config = BackoffConfig::Exponential {
            base_delay_ms: 1_000,
            multiplier: DEFAULT_EXPONENTIAL_MULTIPLIER,
        };
        assert_eq!(config.calculate_delay_ms(1), 1_000);
        assert_eq!(config.calculate_delay_ms(2), 2_000);
        assert_eq!(config.calculate_delay_ms(4), 8_000);
    }

    #[test]
    fn delays_are_capped() {
        let config = BackoffConfig::Exponential {
            base_delay_ms: 60_000,
            multiplier: 10.0,
        };
        assert_eq!(config.calculate_delay_ms(8), MAX_DELAY_MS);
    }

    #[test]
    fn negative_base_is_treated_as_zero() {
        let config = BackoffConfig::Linear {
            base_delay_ms: -100,
        };
        assert_eq!(config.calculate_delay_ms(5), 0);
    }
}
