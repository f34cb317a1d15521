use exprproto::DEFAULT_MAX_FRAME_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerConfig {
    /// Largest frame accepted or produced.
    pub max_frame_size: usize,
    /// Log every decoded tree at debug level.
    pub log_trees: bool,
}

impl HandlerConfig {
    pub fn builder() -> HandlerConfigBuilder {
        HandlerConfigBuilder::default()
    }
}

impl Default for HandlerConfig {
    fn default() -> Self {
        HandlerConfig {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            log_trees: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct HandlerConfigBuilder {
    max_frame_size: Option<usize>,
    log_trees: bool,
}

impl HandlerConfigBuilder {
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = Some(max_frame_size);
        self
    }

    pub fn with_log_trees(mut self, log_trees: bool) -> Self {
        self.log_trees = log_trees;
        self
    }

    pub fn build(self) -> HandlerConfig {
        HandlerConfig {
            max_frame_size: self.max_frame_size.unwrap_or(DEFAULT_MAX_FRAME_SIZE),
            log_trees: self.log_trees,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        assert_eq!(HandlerConfig::default(), HandlerConfig::builder().build());

        let conf = HandlerConfig::builder()
            .with_max_frame_size(1024)
            .with_log_trees(true)
            .build();
        assert_eq!(1024, conf.max_frame_size);
        assert!(conf.log_trees);
    }
}
