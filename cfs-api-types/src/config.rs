//! Engine configuration. Parsing this from a config file or CLI flags is
//! the façade's job (out of scope here); the engine only ever sees an
//! already-populated `EngineConfig`.

/// Options recognized by the read/write engines.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    read_cache_mb: usize,
    write_cache_mb: usize,
    readahead_leng: u64,
    readahead_trigger: u64,
    io_try_cnt: u32,
    io_timeout: std::time::Duration,
    min_log_entry: u32,
    error_on_lost_chunk: bool,
    error_on_no_space: bool,
    preferred_labels: Option<String>,
    lcache_retention: std::time::Duration,
}

impl EngineConfig {
    pub fn read_cache_mb(&self) -> usize {
        self.read_cache_mb
    }

    pub fn write_cache_mb(&self) -> usize {
        self.write_cache_mb
    }

    pub fn readahead_leng(&self) -> u64 {
        self.readahead_leng
    }

    pub fn readahead_trigger(&self) -> u64 {
        self.readahead_trigger
    }

    pub fn io_try_cnt(&self) -> u32 {
        self.io_try_cnt
    }

    /// `Duration::ZERO` means "disabled", matching the `io_timeout = 0`
    /// convention.
    pub fn io_timeout(&self) -> Option<std::time::Duration> {
        if self.io_timeout.is_zero() {
            None
        } else {
            Some(self.io_timeout)
        }
    }

    pub fn min_log_entry(&self) -> u32 {
        self.min_log_entry
    }

    pub fn error_on_lost_chunk(&self) -> bool {
        self.error_on_lost_chunk
    }

    pub fn error_on_no_space(&self) -> bool {
        self.error_on_no_space
    }

    pub fn preferred_labels(&self) -> Option<&str> {
        self.preferred_labels.as_deref()
    }

    pub fn lcache_retention(&self) -> std::time::Duration {
        self.lcache_retention
    }

    pub fn with_read_cache_mb(mut self, v: usize) -> Self {
        self.read_cache_mb = v;
        self
    }

    pub fn with_write_cache_mb(mut self, v: usize) -> Self {
        self.write_cache_mb = v;
        self
    }

    pub fn with_readahead_leng(mut self, v: u64) -> Self {
        self.readahead_leng = v;
        self
    }

    pub fn with_readahead_trigger(mut self, v: u64) -> Self {
        self.readahead_trigger = v;
        self
    }

    pub fn with_io_try_cnt(mut self, v: u32) -> Self {
        self.io_try_cnt = v;
        self
    }

    pub fn with_io_timeout(mut self, v: std::time::Duration) -> Self {
        self.io_timeout = v;
        self
    }

    pub fn with_min_log_entry(mut self, v: u32) -> Self {
        self.min_log_entry = v;
        self
    }

    pub fn with_error_on_lost_chunk(mut self, v: bool) -> Self {
        self.error_on_lost_chunk = v;
        self
    }

    pub fn with_error_on_no_space(mut self, v: bool) -> Self {
        self.error_on_no_space = v;
        self
    }

    pub fn with_preferred_labels(mut self, v: Option<String>) -> Self {
        self.preferred_labels = v;
        self
    }

    pub fn with_lcache_retention(mut self, v: std::time::Duration) -> Self {
        self.lcache_retention = v;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_cache_mb: 128,
            write_cache_mb: 128,
            readahead_leng: 2 * 1024 * 1024,
            readahead_trigger: 20 * 1024 * 1024,
            io_try_cnt: 30,
            io_timeout: std::time::Duration::ZERO,
            min_log_entry: 5,
            error_on_lost_chunk: false,
            error_on_no_space: false,
            preferred_labels: None,
            lcache_retention: std::time::Duration::from_secs_f64(1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.read_cache_mb(), 128);
        assert_eq!(cfg.write_cache_mb(), 128);
        assert_eq!(cfg.readahead_leng(), 2 * 1024 * 1024);
        assert_eq!(cfg.readahead_trigger(), 20 * 1024 * 1024);
        assert_eq!(cfg.io_try_cnt(), 30);
        assert_eq!(cfg.io_timeout(), None);
        assert_eq!(cfg.min_log_entry(), 5);
        assert!(!cfg.error_on_lost_chunk());
        assert!(!cfg.error_on_no_space());
    }

    #[test]
    fn builder_methods_override_defaults() {
        let cfg = EngineConfig::default()
            .with_io_try_cnt(10)
            .with_error_on_lost_chunk(true);
        assert_eq!(cfg.io_try_cnt(), 10);
        assert!(cfg.error_on_lost_chunk());
    }
}
