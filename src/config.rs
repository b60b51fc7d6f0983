use crate::delay::RetryDelay;
use crate::error::Error;

/// Retry policy of the command loop.
///
/// # Examples
///
/// ```rust
/// use anamnesis::ExecuteConfig;
///
/// let config = ExecuteConfig::default()
///     .with_max_retries(3)?
///     .with_base_delay(50)?
///     .with_max_delay(2_000)?;
///
/// assert_eq!(config.max_retries(), 3);
/// assert_eq!(config.retry_delay().base_delay_ms(), 50);
/// # Ok::<(), anamnesis::Error>(())
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ExecuteConfig {
    max_retries: u32,
    retry_delay: RetryDelay,
}

impl ExecuteConfig {
    /// Upper bound on load / handle / save attempts for one command.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_delay(&self) -> RetryDelay {
        self.retry_delay
    }

    pub fn with_max_retries(self, max_retries: u32) -> Result<Self, Error> {
        if max_retries == 0 {
            return Err(invalid("max_retries cannot be 0", "max_retries"));
        }
        Ok(Self {
            max_retries,
            ..self
        })
    }

    pub fn with_base_delay(self, base_delay_ms: u64) -> Result<Self, Error> {
        if base_delay_ms == 0 {
            return Err(invalid(
                "base_retry_delay_ms cannot be 0",
                "base_retry_delay_ms",
            ));
        }
        if base_delay_ms > self.retry_delay.max_delay_ms() {
            return Err(invalid(
                "base_retry_delay_ms cannot exceed max_retry_delay_ms",
                "base_retry_delay_ms",
            ));
        }
        Ok(Self {
            retry_delay: RetryDelay::new(base_delay_ms, self.retry_delay.max_delay_ms()),
            ..self
        })
    }

    pub fn with_max_delay(self, max_delay_ms: u64) -> Result<Self, Error> {
        if max_delay_ms < self.retry_delay.base_delay_ms() {
            return Err(invalid(
                "max_retry_delay_ms cannot be lower than base_retry_delay_ms",
                "max_retry_delay_ms",
            ));
        }
        Ok(Self {
            retry_delay: RetryDelay::new(self.retry_delay.base_delay_ms(), max_delay_ms),
            ..self
        })
    }
}

impl Default for ExecuteConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay: RetryDelay::default(),
        }
    }
}

fn invalid(message: &str, parameter: &str) -> Error {
    Error::InvalidConfig {
        message: message.to_string(),
        parameter: Some(parameter.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_inputs() {
        match ExecuteConfig::default().with_max_retries(0) {
            Err(Error::InvalidConfig { message, parameter }) => {
                assert_eq!(message, "max_retries cannot be 0");
                assert_eq!(parameter, Some("max_retries".to_string()));
            }
            other => panic!("Expected InvalidConfig error, got {:?}", other),
        }

        match ExecuteConfig::default().with_base_delay(0) {
            Err(Error::InvalidConfig { message, parameter }) => {
                assert_eq!(message, "base_retry_delay_ms cannot be 0");
                assert_eq!(parameter, Some("base_retry_delay_ms".to_string()));
            }
            other => panic!("Expected InvalidConfig error, got {:?}", other),
        }

        let config = ExecuteConfig::default()
            .with_max_retries(7)
            .expect("Failed to set max_retries")
            .with_base_delay(200)
            .expect("Failed to set base_delay");

        assert_eq!(config.max_retries(), 7);
        assert_eq!(config.retry_delay().base_delay_ms(), 200);
    }

    #[test]
    fn delays_must_stay_ordered() {
        let config = ExecuteConfig::default().with_max_delay(1_000).unwrap();
        assert!(config.with_base_delay(2_000).is_err());
        assert!(config.with_max_delay(10).is_err());
        assert_eq!(config.retry_delay().max_delay_ms(), 1_000);
    }
}
