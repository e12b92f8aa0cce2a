//! # Configuration
//!
//! Every tunable in one flat struct, loaded once at startup from TOML.
//! Missing keys take their defaults; [`TickwireConfig::validate`] rejects
//! values outside the supported ranges before anything is built from them.
//!
//! ```toml
//! enable_compression = true
//! min_packet_size_to_compress = 256
//! compression_engine = "auto"
//! compression_format = "zlib"
//!
//! duplicate_timeout_ms = 500
//! suppression_scope = "per_destination"
//! excluded_types = ["KeepAlive"]
//!
//! server_packet_batch_delay = 20
//! server_packet_batch_size = 128
//! ```

use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch::BatchPolicy;
use crate::compression::{CompressionFormat, EngineSelection};
use crate::error::{TickwireError, TickwireResult};
use crate::filter::SuppressionScope;
use crate::transport::Direction;
use crate::MAX_UNCOMPRESSED_SIZE;

const THRESHOLD_RANGE: RangeInclusive<u32> = 1..=MAX_UNCOMPRESSED_SIZE as u32;
const LEVEL_RANGE: RangeInclusive<u32> = 0..=9;
const ADVANCED_LEVEL_RANGE: RangeInclusive<u32> = 0..=12;
const TIMEOUT_RANGE: RangeInclusive<u64> = 100..=5000;
const MAX_DUPLICATES_RANGE: RangeInclusive<u32> = 1..=20;
const BATCH_DELAY_RANGE: RangeInclusive<u64> = 0..=1000;
const CLIENT_BATCH_SIZE_RANGE: RangeInclusive<usize> = 1..=1024;
const SERVER_BATCH_SIZE_RANGE: RangeInclusive<usize> = 1..=2048;

/// Pipeline configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TickwireConfig {
    // -------------------------------------------------------------------------
    // Compression
    // -------------------------------------------------------------------------
    /// Master switch for outbound compression.
    pub enable_compression: bool,
    /// Payloads shorter than this are sent raw.
    pub min_packet_size_to_compress: u32,
    /// Engine selection.
    pub compression_engine: EngineSelection,
    /// Baseline engine level (0-9).
    pub compression_level: u32,
    /// Accelerated engine level (0-12).
    pub advanced_compression_level: u32,
    /// Permits the accelerated engine.
    pub use_native_compression: bool,
    /// DEFLATE container for the baseline engine.
    pub compression_format: CompressionFormat,
    /// Lets the threshold float above the minimum.
    pub enable_adaptive_compression: bool,
    /// Rejects inbound compressed frames declaring less than the minimum.
    pub validate_decompressed_size: bool,

    // -------------------------------------------------------------------------
    // Duplicate filter
    // -------------------------------------------------------------------------
    /// Master switch for duplicate suppression.
    pub enable_duplicate_filtering: bool,
    /// Identical messages further apart than this are never suppressed.
    pub duplicate_timeout_ms: u64,
    /// Longest run of suppressions before one is forced through.
    pub max_consecutive_duplicates: u32,
    /// Filter position and movement messages.
    pub filter_position_packets: bool,
    /// Filter chunk and block messages.
    pub filter_chunk_packets: bool,
    /// Filter entity messages.
    pub filter_entity_packets: bool,
    /// Cache key granularity.
    pub suppression_scope: SuppressionScope,
    /// Uncategorized type names never filtered.
    pub excluded_types: Vec<String>,
    /// Cache keys allowed before a whole-cache clear.
    pub max_cache_entries: usize,

    // -------------------------------------------------------------------------
    // Batching
    // -------------------------------------------------------------------------
    /// Delay before a scheduled flush on client connections (ms).
    pub client_packet_batch_delay: u64,
    /// Queue length that forces a flush on client connections.
    pub client_packet_batch_size: usize,
    /// Delay before a scheduled flush on server connections (ms).
    pub server_packet_batch_delay: u64,
    /// Queue length that forces a flush on server connections.
    pub server_packet_batch_size: usize,
    /// Enables batching on client connections.
    pub enable_client_optimizations: bool,
    /// Enables batching on server connections.
    pub enable_server_optimizations: bool,
}

impl Default for TickwireConfig {
    fn default() -> Self {
        Self {
            enable_compression: true,
            min_packet_size_to_compress: 256,
            compression_engine: EngineSelection::Auto,
            compression_level: 3,
            advanced_compression_level: 6,
            use_native_compression: true,
            compression_format: CompressionFormat::Zlib,
            enable_adaptive_compression: true,
            validate_decompressed_size: true,

            enable_duplicate_filtering: true,
            duplicate_timeout_ms: 500,
            max_consecutive_duplicates: 3,
            filter_position_packets: true,
            filter_chunk_packets: true,
            filter_entity_packets: true,
            suppression_scope: SuppressionScope::Global,
            excluded_types: Vec::new(),
            max_cache_entries: 1000,

            client_packet_batch_delay: 50,
            client_packet_batch_size: 64,
            server_packet_batch_delay: 20,
            server_packet_batch_size: 128,
            enable_client_optimizations: true,
            enable_server_optimizations: true,
        }
    }
}

fn check<T>(name: &str, value: T, range: &RangeInclusive<T>) -> TickwireResult<()>
where
    T: PartialOrd + std::fmt::Display,
{
    if range.contains(&value) {
        Ok(())
    } else {
        Err(TickwireError::InvalidConfig(format!(
            "{name} = {value} outside {}..={}",
            range.start(),
            range.end()
        )))
    }
}

impl TickwireConfig {
    /// Parses and validates TOML.
    ///
    /// # Errors
    ///
    /// [`TickwireError::InvalidConfig`] for syntax errors, unknown enum
    /// values, or out-of-range settings.
    pub fn from_toml_str(source: &str) -> TickwireResult<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| TickwireError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// I/O errors as [`TickwireError::Transport`], everything else as
    /// [`TickwireError::InvalidConfig`].
    pub fn from_file(path: impl AsRef<Path>) -> TickwireResult<Self> {
        let source = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml_str(&source)?;
        tracing::info!(path = %path.as_ref().display(), "loaded tickwire config");
        Ok(config)
    }

    /// Serializes to TOML.
    ///
    /// # Errors
    ///
    /// [`TickwireError::InvalidConfig`] if serialization fails.
    pub fn to_toml_string(&self) -> TickwireResult<String> {
        toml::to_string(self).map_err(|e| TickwireError::InvalidConfig(e.to_string()))
    }

    /// Checks every numeric setting against its supported range.
    ///
    /// # Errors
    ///
    /// [`TickwireError::InvalidConfig`] naming the first bad setting.
    pub fn validate(&self) -> TickwireResult<()> {
        check("min_packet_size_to_compress", self.min_packet_size_to_compress, &THRESHOLD_RANGE)?;
        check("compression_level", self.compression_level, &LEVEL_RANGE)?;
        check("advanced_compression_level", self.advanced_compression_level, &ADVANCED_LEVEL_RANGE)?;
        check("duplicate_timeout_ms", self.duplicate_timeout_ms, &TIMEOUT_RANGE)?;
        check("max_consecutive_duplicates", self.max_consecutive_duplicates, &MAX_DUPLICATES_RANGE)?;
        check("client_packet_batch_delay", self.client_packet_batch_delay, &BATCH_DELAY_RANGE)?;
        check("server_packet_batch_delay", self.server_packet_batch_delay, &BATCH_DELAY_RANGE)?;
        check("client_packet_batch_size", self.client_packet_batch_size, &CLIENT_BATCH_SIZE_RANGE)?;
        check("server_packet_batch_size", self.server_packet_batch_size, &SERVER_BATCH_SIZE_RANGE)?;
        if self.max_cache_entries == 0 {
            return Err(TickwireError::InvalidConfig("max_cache_entries must be nonzero".into()));
        }
        Ok(())
    }

    /// Batching policy for connections in `direction`.
    #[must_use]
    pub fn batch_policy(&self, direction: Direction) -> BatchPolicy {
        match direction {
            Direction::Client => BatchPolicy {
                enabled: self.enable_client_optimizations,
                delay: Duration::from_millis(self.client_packet_batch_delay),
                batch_size: self.client_packet_batch_size,
            },
            Direction::Server => BatchPolicy {
                enabled: self.enable_server_optimizations,
                delay: Duration::from_millis(self.server_packet_batch_delay),
                batch_size: self.server_packet_batch_size,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TickwireConfig::default();
        config.validate().unwrap();
        assert_eq!(config.min_packet_size_to_compress, 256);
        assert_eq!(config.max_consecutive_duplicates, 3);
        assert_eq!(config.suppression_scope, SuppressionScope::Global);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = TickwireConfig::from_toml_str(
            r#"
            compression_engine = "baseline"
            compression_format = "gzip"
            suppression_scope = "per_destination"
            excluded_types = ["KeepAlive", "Chat"]
            server_packet_batch_size = 512
            "#,
        )
        .unwrap();

        assert_eq!(config.compression_engine, EngineSelection::Baseline);
        assert_eq!(config.compression_format, CompressionFormat::Gzip);
        assert_eq!(config.suppression_scope, SuppressionScope::PerDestination);
        assert_eq!(config.excluded_types, vec!["KeepAlive", "Chat"]);
        assert_eq!(config.server_packet_batch_size, 512);
        assert_eq!(config.duplicate_timeout_ms, 500);
    }

    #[test]
    fn test_out_of_range_rejected() {
        for source in [
            "compression_level = 10",
            "advanced_compression_level = 13",
            "duplicate_timeout_ms = 50",
            "max_consecutive_duplicates = 0",
            "client_packet_batch_size = 2000",
            "server_packet_batch_delay = 1001",
            "min_packet_size_to_compress = 0",
            "max_cache_entries = 0",
        ] {
            let err = TickwireConfig::from_toml_str(source).unwrap_err();
            assert!(matches!(err, TickwireError::InvalidConfig(_)), "{source}");
        }
    }

    #[test]
    fn test_unknown_engine_rejected() {
        assert!(TickwireConfig::from_toml_str("compression_engine = \"turbo\"").is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = TickwireConfig::default();
        config.excluded_types.push("Ping".into());
        config.compression_engine = EngineSelection::Accelerated;

        let text = config.to_toml_string().unwrap();
        assert_eq!(TickwireConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_batch_policy_per_direction() {
        let mut config = TickwireConfig::default();
        config.enable_client_optimizations = false;

        let client = config.batch_policy(Direction::Client);
        assert!(!client.enabled);
        assert_eq!(client.delay, Duration::from_millis(50));
        assert_eq!(client.batch_size, 64);

        let server = config.batch_policy(Direction::Server);
        assert!(server.enabled);
        assert_eq!(server.delay, Duration::from_millis(20));
        assert_eq!(server.batch_size, 128);
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("tickwire_config_{}.toml", std::process::id()));
        std::fs::write(&path, "duplicate_timeout_ms = 750\n").unwrap();

        let config = TickwireConfig::from_file(&path).unwrap();
        assert_eq!(config.duplicate_timeout_ms, 750);

        std::fs::remove_file(&path).ok();
        assert!(matches!(
            TickwireConfig::from_file(&path),
            Err(TickwireError::Transport(_))
        ));
    }
}
