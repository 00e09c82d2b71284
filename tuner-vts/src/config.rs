//! Configuration file loading.
//!
//! The harness reads one TOML file describing the device under test:
//!
//! ```toml
//! [harness]
//! reply_timeout_ms = 3000
//!
//! [[frontend]]
//! id = "FE_DEFAULT"
//! type = "DVBT"
//! frequency_khz = 578000
//!
//! [connections.scan]
//! frontend = "FE_DEFAULT"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::registry::{
    DescramblerDescription, DeviceRegistry, DiseqcMessage, DvrDescription, FilterDescription,
    FrontendDescription, LnbDescription, TimeFilterDescription,
};
use crate::topology::PinnedConnections;

const DEFAULT_REPLY_TIMEOUT_MS: u64 = 3000;
const DEFAULT_EVENT_TIMEOUT_MS: u64 = 3000;
const DEFAULT_RECORD_WAIT_MS: u64 = 100;
const DEFAULT_MIN_RECORD_BYTES: usize = 188 * 10;
const DEFAULT_MIN_PLAYBACK_BYTES: usize = 188 * 10;

/// Configuration file format.
#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    harness: HarnessSection,
    #[serde(default)]
    logging: LoggingSection,
    #[serde(default, rename = "frontend")]
    frontends: Vec<FrontendDescription>,
    #[serde(default, rename = "filter")]
    filters: Vec<FilterDescription>,
    #[serde(default, rename = "dvr")]
    dvrs: Vec<DvrDescription>,
    #[serde(default, rename = "lnb")]
    lnbs: Vec<LnbDescription>,
    #[serde(default, rename = "descrambler")]
    descramblers: Vec<DescramblerDescription>,
    #[serde(default, rename = "time_filter")]
    time_filters: Vec<TimeFilterDescription>,
    #[serde(default, rename = "diseqc_message")]
    diseqc_messages: Vec<DiseqcMessage>,
    #[serde(default)]
    connections: PinnedConnections,
}

#[derive(Debug, Deserialize, Default)]
struct HarnessSection {
    reply_timeout_ms: Option<u64>,
    event_timeout_ms: Option<u64>,
    record_wait_ms: Option<u64>,
    min_record_bytes: Option<usize>,
    min_playback_bytes: Option<usize>,
}

/// `[logging]` section; command line flags take precedence.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct LoggingSection {
    pub log_dir: Option<String>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

/// Timing and volume thresholds applied to every scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Wait for the reply to one request.
    pub reply: Duration,
    /// Wait for an indication or filter event.
    pub event: Duration,
    /// One record worker wait for `DATA_READY`.
    pub record_wait: Duration,
    pub min_record_bytes: usize,
    pub min_playback_bytes: usize,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            reply: Duration::from_millis(DEFAULT_REPLY_TIMEOUT_MS),
            event: Duration::from_millis(DEFAULT_EVENT_TIMEOUT_MS),
            record_wait: Duration::from_millis(DEFAULT_RECORD_WAIT_MS),
            min_record_bytes: DEFAULT_MIN_RECORD_BYTES,
            min_playback_bytes: DEFAULT_MIN_PLAYBACK_BYTES,
        }
    }
}

impl From<&HarnessSection> for Timeouts {
    fn from(section: &HarnessSection) -> Self {
        let defaults = Timeouts::default();
        Self {
            reply: section.reply_timeout_ms.map(Duration::from_millis).unwrap_or(defaults.reply),
            event: section.event_timeout_ms.map(Duration::from_millis).unwrap_or(defaults.event),
            record_wait: section
                .record_wait_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.record_wait),
            min_record_bytes: section.min_record_bytes.unwrap_or(defaults.min_record_bytes),
            min_playback_bytes: section.min_playback_bytes.unwrap_or(defaults.min_playback_bytes),
        }
    }
}

/// Parsed harness configuration.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub timeouts: Timeouts,
    pub logging: LoggingSection,
    pub registry: DeviceRegistry,
    pub pinned: PinnedConnections,
    /// File the configuration was read from, if any.
    pub path: Option<PathBuf>,
}

/// Read and parse the configuration file at `path`.
pub fn load_config(path: &Path) -> Result<HarnessConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::MissingFile(path.to_path_buf()));
    }
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut config = parse_config(&contents, base_dir).map_err(|e| match e {
        ConfigError::Parse { source, .. } => ConfigError::Parse { path: path.to_path_buf(), source },
        other => other,
    })?;
    config.path = Some(path.to_path_buf());
    info!(
        "Loaded config from {} ({} frontend(s), {} filter(s), {} dvr(s))",
        path.display(),
        config.registry.frontends.len(),
        config.registry.filters.len(),
        config.registry.dvrs.len()
    );
    Ok(config)
}

/// Parse configuration text. Relative input files resolve against `base_dir`.
pub fn parse_config(contents: &str, base_dir: &Path) -> Result<HarnessConfig, ConfigError> {
    let file: ConfigFile = toml::from_str(contents).map_err(|source| ConfigError::Parse {
        path: PathBuf::from("<inline>"),
        source,
    })?;

    let mut registry = DeviceRegistry::new();
    for frontend in file.frontends {
        registry.frontends.insert(frontend)?;
    }
    for filter in file.filters {
        registry.filters.insert(filter)?;
    }
    for mut dvr in file.dvrs {
        if let Some(input) = dvr.input_file.take() {
            let resolved = if input.is_relative() { base_dir.join(input) } else { input };
            debug!("dvr {} reads {}", dvr.id, resolved.display());
            dvr.input_file = Some(resolved);
        }
        if dvr.high_threshold == 0 {
            dvr.low_threshold = dvr.buffer_size / 8;
            dvr.high_threshold = dvr.buffer_size / 8 * 7;
        }
        registry.dvrs.insert(dvr)?;
    }
    for lnb in file.lnbs {
        registry.lnbs.insert(lnb)?;
    }
    for descrambler in file.descramblers {
        registry.descramblers.insert(descrambler)?;
    }
    for time_filter in file.time_filters {
        registry.time_filters.insert(time_filter)?;
    }
    for message in file.diseqc_messages {
        registry.diseqc_messages.insert(message)?;
    }

    Ok(HarnessConfig {
        timeouts: Timeouts::from(&file.harness),
        logging: file.logging,
        registry,
        pinned: file.connections,
        path: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DeviceKind;
    use std::io::Write;
    use tuner_hal_protocol::{DvrType, FilterSubType, FrontendType};

    const SAMPLE: &str = r#"
        [harness]
        reply_timeout_ms = 500
        min_record_bytes = 376

        [[frontend]]
        id = "FE_DVBT"
        type = "DVBT"
        frequency_khz = 578000

        [[filter]]
        id = "FILTER_VIDEO"
        main_type = "TS"
        sub_type = "VIDEO"
        pid = 256

        [[dvr]]
        id = "DVR_PLAYBACK"
        type = "PLAYBACK"
        buffer_size = 8192
        input_file = "segment.ts"

        [connections.scan]
        frontend = "FE_DVBT"
    "#;

    #[test]
    fn test_parse_sample() {
        let config = parse_config(SAMPLE, Path::new("/etc/vts")).unwrap();
        assert_eq!(config.timeouts.reply, Duration::from_millis(500));
        assert_eq!(config.timeouts.event, Duration::from_millis(DEFAULT_EVENT_TIMEOUT_MS));
        assert_eq!(config.timeouts.min_record_bytes, 376);

        let frontend = config.registry.frontends.get("FE_DVBT").unwrap();
        assert_eq!(frontend.frontend_type, FrontendType::Dvbt);
        assert_eq!(config.registry.filter_ids(FilterSubType::Video), vec!["FILTER_VIDEO"]);

        let dvr = config.registry.dvrs.get("DVR_PLAYBACK").unwrap();
        assert_eq!(dvr.dvr_type, DvrType::Playback);
        assert_eq!(dvr.input_file.as_deref(), Some(Path::new("/etc/vts/segment.ts")));
        assert_eq!(dvr.low_threshold, 1024);
        assert_eq!(dvr.high_threshold, 7168);

        assert_eq!(config.pinned.scan.unwrap().frontend, "FE_DVBT");
        assert!(config.pinned.live.is_none());
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        let text = r#"
            [[lnb]]
            id = "LNB0"
            [[lnb]]
            id = "LNB0"
        "#;
        match parse_config(text, Path::new(".")) {
            Err(ConfigError::DuplicateId { kind, id }) => {
                assert_eq!(kind, DeviceKind::Lnb);
                assert_eq!(id, "LNB0");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_and_missing_file() {
        assert!(matches!(
            parse_config("[[frontend]]\nid = 3", Path::new(".")),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            load_config(Path::new("/nonexistent/tuner-vts.toml")),
            Err(ConfigError::MissingFile(_))
        ));
    }

    #[test]
    fn test_load_config_records_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.path.as_deref(), Some(file.path()));
        let dvr = config.registry.dvrs.get("DVR_PLAYBACK").unwrap();
        assert_eq!(
            dvr.input_file.as_deref(),
            Some(file.path().parent().unwrap().join("segment.ts").as_path())
        );
    }
}
