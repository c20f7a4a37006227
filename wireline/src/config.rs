/// Configuration for the reactor.
#[derive(Clone)]
pub struct Config {
    /// Number of SQ entries. CQ will be 4x this.
    pub sq_entries: u32,
    /// Maximum number of concurrently watched sockets.
    pub max_sockets: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sq_entries: 256,
            max_sockets: 4096,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.sq_entries == 0 || !self.sq_entries.is_power_of_two() {
            return Err(crate::error::Error::RingSetup(
                "sq_entries must be > 0 and a power of two".into(),
            ));
        }
        if self.max_sockets == 0 || self.max_sockets >= (1 << 24) {
            return Err(crate::error::Error::RingSetup(
                "max_sockets must be > 0 and < 2^24".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use wireline::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .sq_entries(512)
///     .max_sockets(1024)
///     .build()
///     .expect("invalid config");
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of SQ entries. Must be a power of two.
    pub fn sq_entries(mut self, n: u32) -> Self {
        self.config.sq_entries = n;
        self
    }

    /// Set the maximum number of concurrently watched sockets.
    pub fn max_sockets(mut self, n: u32) -> Self {
        self.config.max_sockets = n;
        self
    }

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, crate::error::Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}
