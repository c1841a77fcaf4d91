//! Configuration types for runtime and execution settings

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Throttling configuration for object-storage traffic
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottleConfig {
    /// Maximum number of requests in flight (0 = no limit)
    pub max_connections: usize,
    /// Requests per second throttle (0 = no throttle)
    pub request_throttle: usize,
    /// Bytes per second streamed while hashing (0 = no throttle)
    pub transfer_throttle: u64,
    /// Chunk size used to convert bytes into transfer tokens
    pub chunk_size: u64,
}

impl ThrottleConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.transfer_throttle > 0 && self.chunk_size == 0 {
            return Err("chunk_size must be specified when using transfer_throttle".to_string());
        }
        if self.transfer_throttle > 0 && self.chunk_size > self.transfer_throttle {
            return Err(format!(
                "chunk_size ({}) must not exceed transfer_throttle ({}) bytes per second",
                self.chunk_size, self.transfer_throttle
            ));
        }
        Ok(())
    }

    /// Transfer tokens available per second
    pub fn transfer_tokens_per_sec(&self) -> usize {
        if self.chunk_size == 0 {
            return 0;
        }
        usize::try_from(self.transfer_throttle / self.chunk_size).unwrap_or(usize::MAX)
    }
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

/// Tracing configuration for debugging
#[derive(Debug, Default, Clone)]
pub struct TracingConfig {
    /// Write log output to this file instead of stderr
    pub debug_log_file: Option<String>,
    /// Write a Chrome trace (chrome://tracing, Perfetto) to `<prefix>-<identifier>.json`
    pub chrome_trace_prefix: Option<String>,
    /// Identifier used in trace file names
    pub trace_identifier: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_throttle_requires_chunk_size() {
        let config = ThrottleConfig {
            transfer_throttle: 1 << 20,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = ThrottleConfig {
            transfer_throttle: 1 << 20,
            chunk_size: 64 << 10,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.transfer_tokens_per_sec(), 16);
    }

    #[test]
    fn chunk_larger_than_rate_is_rejected() {
        let config = ThrottleConfig {
            transfer_throttle: 1024,
            chunk_size: 4096,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
