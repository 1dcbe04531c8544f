//! Runtime configuration for the thunk pool
//!
//! Read once from the environment when the process-wide block source is
//! first used:
//! - `TYPTHON_THUNKS_BLOCKS_PER_MAPPING`: block pairs per OS mapping (1..=64)
//! - `TYPTHON_THUNKS_LOG_*`: see `logging::LogConfig::from_env`

use tracing::warn;

use crate::logging::LogConfig;

/// Block pairs per OS mapping when nothing is configured
pub const DEFAULT_BLOCKS_PER_MAPPING: usize = 8;

/// Upper bound accepted from the environment
pub const MAX_BLOCKS_PER_MAPPING: usize = 64;

#[derive(Debug, Clone)]
pub struct ThunkConfig {
    /// Block pairs requested from the OS at once
    pub blocks_per_mapping: usize,
    /// Logging setup used by `crate::init`
    pub log: LogConfig,
}

impl Default for ThunkConfig {
    fn default() -> Self {
        Self {
            blocks_per_mapping: DEFAULT_BLOCKS_PER_MAPPING,
            log: LogConfig::default(),
        }
    }
}

impl ThunkConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self {
            log: LogConfig::from_env(),
            ..Self::default()
        };

        if let Ok(value) = std::env::var("TYPTHON_THUNKS_BLOCKS_PER_MAPPING") {
            match parse_blocks_per_mapping(&value) {
                Some(blocks) => config.blocks_per_mapping = blocks,
                None => warn!(
                    value = %value,
                    default = DEFAULT_BLOCKS_PER_MAPPING,
                    "ignoring invalid TYPTHON_THUNKS_BLOCKS_PER_MAPPING"
                ),
            }
        }

        config
    }
}

/// Parse a batch size, clamping to the accepted range; `None` if not a number
fn parse_blocks_per_mapping(value: &str) -> Option<usize> {
    let blocks: usize = value.trim().parse().ok()?;
    Some(blocks.clamp(1, MAX_BLOCKS_PER_MAPPING))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ThunkConfig::default();
        assert_eq!(config.blocks_per_mapping, DEFAULT_BLOCKS_PER_MAPPING);
    }

    #[test]
    fn parses_and_clamps_batch_size() {
        assert_eq!(parse_blocks_per_mapping("16"), Some(16));
        assert_eq!(parse_blocks_per_mapping(" 2 "), Some(2));
        assert_eq!(parse_blocks_per_mapping("0"), Some(1));
        assert_eq!(parse_blocks_per_mapping("1000"), Some(MAX_BLOCKS_PER_MAPPING));
        assert_eq!(parse_blocks_per_mapping("eight"), None);
        assert_eq!(parse_blocks_per_mapping("-3"), None);
    }
}
