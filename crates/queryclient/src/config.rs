use exprproto::DEFAULT_MAX_FRAME_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Largest frame accepted or produced.
    pub max_frame_size: usize,
}

impl ProviderConfig {
    pub fn builder() -> ProviderConfigBuilder {
        ProviderConfigBuilder::default()
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

#[derive(Debug, Default)]
pub struct ProviderConfigBuilder {
    max_frame_size: Option<usize>,
}

impl ProviderConfigBuilder {
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = Some(max_frame_size);
        self
    }

    pub fn build(self) -> ProviderConfig {
        ProviderConfig {
            max_frame_size: self.max_frame_size.unwrap_or(DEFAULT_MAX_FRAME_SIZE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        assert_eq!(ProviderConfig::default(), ProviderConfig::builder().build());
        let config = ProviderConfig::builder().with_max_frame_size(1024).build();
        assert_eq!(1024, config.max_frame_size);
    }
}
