//! Host device configuration.

use crate::nvm::{FramError, FramPath};
use crate::power::Harvester;

/// Default shared memory object backing the demo device's image.
pub const DEFAULT_IMAGE: &str = "/chain-demo";

/// Default number of boots per run.
pub const DEFAULT_BOOTS: usize = 8;

/// Default smallest energy budget of a boot, in power draws.
pub const DEFAULT_MIN_DRAWS: u64 = 10;

/// Default largest energy budget of a boot, in power draws.
pub const DEFAULT_MAX_DRAWS: u64 = 120;

/// Configuration of a simulated intermittently-powered device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Name of the shared memory object standing in for FRAM.
    pub image: String,
    /// Boots to run before exiting.
    pub boots: usize,
    /// Smallest energy budget of a boot.
    pub min_draws: u64,
    /// Largest energy budget of a boot.
    pub max_draws: u64,
    /// Seed of the harvester; random if unset.
    pub seed: Option<u64>,
    /// Erase the image before the first boot.
    pub fresh: bool,
    /// Print every boot report.
    pub verbose: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_owned(),
            boots: DEFAULT_BOOTS,
            min_draws: DEFAULT_MIN_DRAWS,
            max_draws: DEFAULT_MAX_DRAWS,
            seed: None,
            fresh: false,
            verbose: false,
        }
    }
}

impl DeviceConfig {
    /// The validated image path.
    ///
    /// # Errors
    ///
    /// Returns [`FramError::BadName`] if `image` is not a valid shared
    /// memory object name.
    pub fn image_path(&self) -> Result<FramPath, FramError> {
        FramPath::new(self.image.as_str())
    }

    /// The power supply described by this configuration.
    pub fn harvester(&self) -> Harvester {
        match self.seed {
            Some(seed) => Harvester::seeded(seed, self.min_draws, self.max_draws),
            None => Harvester::new(self.min_draws, self.max_draws),
        }
    }
}
