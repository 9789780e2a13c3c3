//! Pacing between consecutive sends of a dispatch pass

use std::time::Duration;

use wapush_core::CampaignConfig;

/// Decides how long to wait after a send before the next one
pub trait PacingPolicy: Send + Sync {
    /// `sent` is the number of sends issued so far in this pass
    fn delay_after(&self, sent: usize) -> Duration;
}

/// Same pause after every send
#[derive(Debug, Clone, Copy)]
pub struct FixedPacing {
    interval: Duration,
}

impl FixedPacing {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn from_config(config: &CampaignConfig) -> Self {
        Self::new(config.pacing())
    }
}

impl Default for FixedPacing {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl PacingPolicy for FixedPacing {
    fn delay_after(&self, _sent: usize) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_pacing() {
        let pacing = FixedPacing::default();
        assert_eq!(pacing.delay_after(1), Duration::from_millis(100));
        assert_eq!(pacing.delay_after(500), Duration::from_millis(100));

        let config = CampaignConfig {
            pacing_ms: 250,
            ..CampaignConfig::default()
        };
        assert_eq!(
            FixedPacing::from_config(&config).delay_after(1),
            Duration::from_millis(250)
        );
    }
}
