use embassy_time::Duration;

#[cfg(feature = "serde")]
use serde::Deserialize;

/// Tunable timing parameters for the reader loop.
///
/// All fields have defaults matching the PN532's typical passive-polling behavior; most
/// applications can use [`ReaderConfig::default()`] unchanged.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Deserialize))]
#[cfg_attr(feature = "serde", serde(from = "RawMillis"))]
pub struct ReaderConfig {
    /// How long a single detection attempt waits for a tag to answer `InListPassiveTarget`
    pub detection_timeout: Duration,
    /// How often a present tag is re-checked for continued presence
    pub presence_check_interval: Duration,
    /// How long a single presence check waits for the PN532's `Diagnose` response
    pub presence_check_timeout: Duration,
    /// Default timeout applied to [`crate::reader::Reader::request_transceive`] when the caller
    /// doesn't specify one
    pub default_transceive_timeout: Duration,
}

impl ReaderConfig {
    /// `const`-constructible form of [`Default::default`], so a [`crate::reader::Shared`] can
    /// hold a `ReaderConfig` before one is known, without requiring an allocator or a `Mutex` whose
    /// initial value can only be produced at runtime.
    pub const fn const_default() -> Self {
        Self {
            detection_timeout: Duration::from_millis(500),
            presence_check_interval: Duration::from_millis(200),
            presence_check_timeout: Duration::from_millis(100),
            default_transceive_timeout: Duration::from_millis(1000),
        }
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self::const_default()
    }
}

/// `embassy_time::Duration` has no `serde` support of its own, so deserialization goes through a
/// plain-millisecond shadow struct and converts into real `Duration`s afterwards.
#[cfg(feature = "serde")]
#[derive(Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct RawMillis {
    detection_timeout_ms: u64,
    presence_check_interval_ms: u64,
    presence_check_timeout_ms: u64,
    default_transceive_timeout_ms: u64,
}

#[cfg(feature = "serde")]
impl Default for RawMillis {
    fn default() -> Self {
        let defaults = ReaderConfig::default();
        Self {
            detection_timeout_ms: defaults.detection_timeout.as_millis(),
            presence_check_interval_ms: defaults.presence_check_interval.as_millis(),
            presence_check_timeout_ms: defaults.presence_check_timeout.as_millis(),
            default_transceive_timeout_ms: defaults.default_transceive_timeout.as_millis(),
        }
    }
}

#[cfg(feature = "serde")]
impl From<RawMillis> for ReaderConfig {
    fn from(raw: RawMillis) -> Self {
        Self {
            detection_timeout: Duration::from_millis(raw.detection_timeout_ms),
            presence_check_interval: Duration::from_millis(raw.presence_check_interval_ms),
            presence_check_timeout: Duration::from_millis(raw.presence_check_timeout_ms),
            default_transceive_timeout: Duration::from_millis(raw.default_transceive_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ReaderConfig::default();
        assert_eq!(config.detection_timeout, Duration::from_millis(500));
        assert_eq!(config.presence_check_interval, Duration::from_millis(200));
        assert_eq!(config.presence_check_timeout, Duration::from_millis(100));
        assert_eq!(
            config.default_transceive_timeout,
            Duration::from_millis(1000)
        );
    }

    #[cfg(feature = "serde")]
    #[test]
    fn deserializes_partial_overrides_over_defaults() {
        let config: ReaderConfig = serde_json::from_str(r#"{"detection-timeout-ms": 750}"#)
            .expect("valid config");
        assert_eq!(config.detection_timeout, Duration::from_millis(750));
        assert_eq!(config.presence_check_interval, Duration::from_millis(200));
    }
}
