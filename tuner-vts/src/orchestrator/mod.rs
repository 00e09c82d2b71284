//! Scenario orchestration.
//!
//! A [`ScenarioRunner`] drives one device session through every named
//! scenario, once per resolved configuration of the scenario's connection
//! family, and records an [`Outcome`] for each run.

mod cleanup;
mod scenarios;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use serde::Serialize;

use crate::config::{HarnessConfig, Timeouts};
use crate::device::{DeviceSession, LoopbackDevice, LoopbackInventory};
use crate::error::{ConfigError, FailureClass, ScenarioError};
use crate::registry::DeviceRegistry;
use crate::topology::{validate, ResolvedConnections};

pub use cleanup::Cleanup;

/// Services starting with this prefix are bound to the in-process loopback device.
pub const LOOPBACK_PREFIX: &str = "loopback";

/// Named end-to-end scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioKind {
    DemuxOpen,
    DemuxAvSyncTime,
    FrontendTune,
    FrontendLinkCiCam,
    FrontendAutoScan,
    FrontendBlindScan,
    FilterStartInDemux,
    FilterIpCid,
    FilterReconfigureStartId,
    FilterTimeFilter,
    FilterLinkage,
    BroadcastAudio,
    BroadcastVideo,
    BroadcastSection,
    BroadcastLnbVideo,
    LnbDiseqc,
    PlaybackAudio,
    PlaybackVideo,
    PlaybackSection,
    RecordTsRecord,
    RecordAttachFilters,
    RecordLnb,
    DescramblerCreate,
    DescramblerScrambledBroadcast,
    DescramblerLnb,
}

impl ScenarioKind {
    pub const ALL: [ScenarioKind; 25] = [
        ScenarioKind::DemuxOpen,
        ScenarioKind::DemuxAvSyncTime,
        ScenarioKind::FrontendTune,
        ScenarioKind::FrontendLinkCiCam,
        ScenarioKind::FrontendAutoScan,
        ScenarioKind::FrontendBlindScan,
        ScenarioKind::FilterStartInDemux,
        ScenarioKind::FilterIpCid,
        ScenarioKind::FilterReconfigureStartId,
        ScenarioKind::FilterTimeFilter,
        ScenarioKind::FilterLinkage,
        ScenarioKind::BroadcastAudio,
        ScenarioKind::BroadcastVideo,
        ScenarioKind::BroadcastSection,
        ScenarioKind::BroadcastLnbVideo,
        ScenarioKind::LnbDiseqc,
        ScenarioKind::PlaybackAudio,
        ScenarioKind::PlaybackVideo,
        ScenarioKind::PlaybackSection,
        ScenarioKind::RecordTsRecord,
        ScenarioKind::RecordAttachFilters,
        ScenarioKind::RecordLnb,
        ScenarioKind::DescramblerCreate,
        ScenarioKind::DescramblerScrambledBroadcast,
        ScenarioKind::DescramblerLnb,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ScenarioKind::DemuxOpen => "demux.open",
            ScenarioKind::DemuxAvSyncTime => "demux.av_sync_time",
            ScenarioKind::FrontendTune => "frontend.tune",
            ScenarioKind::FrontendLinkCiCam => "frontend.link_cicam",
            ScenarioKind::FrontendAutoScan => "frontend.auto_scan",
            ScenarioKind::FrontendBlindScan => "frontend.blind_scan",
            ScenarioKind::FilterStartInDemux => "filter.start_in_demux",
            ScenarioKind::FilterIpCid => "filter.ip_cid",
            ScenarioKind::FilterReconfigureStartId => "filter.reconfigure_start_id",
            ScenarioKind::FilterTimeFilter => "filter.time_filter",
            ScenarioKind::FilterLinkage => "filter.linkage",
            ScenarioKind::BroadcastAudio => "broadcast.audio",
            ScenarioKind::BroadcastVideo => "broadcast.video",
            ScenarioKind::BroadcastSection => "broadcast.section",
            ScenarioKind::BroadcastLnbVideo => "broadcast.lnb_video",
            ScenarioKind::LnbDiseqc => "lnb.diseqc",
            ScenarioKind::PlaybackAudio => "playback.audio",
            ScenarioKind::PlaybackVideo => "playback.video",
            ScenarioKind::PlaybackSection => "playback.section",
            ScenarioKind::RecordTsRecord => "record.ts_record",
            ScenarioKind::RecordAttachFilters => "record.attach_filters",
            ScenarioKind::RecordLnb => "record.lnb",
            ScenarioKind::DescramblerCreate => "descrambler.create",
            ScenarioKind::DescramblerScrambledBroadcast => "descrambler.scrambled_broadcast",
            ScenarioKind::DescramblerLnb => "descrambler.lnb",
        }
    }

    /// Number of configurations this scenario runs for.
    pub fn configurations(self, connections: &ResolvedConnections) -> usize {
        match self {
            ScenarioKind::DemuxOpen
            | ScenarioKind::DemuxAvSyncTime
            | ScenarioKind::FrontendTune
            | ScenarioKind::FrontendLinkCiCam
            | ScenarioKind::FilterStartInDemux
            | ScenarioKind::FilterIpCid
            | ScenarioKind::FilterReconfigureStartId
            | ScenarioKind::BroadcastAudio
            | ScenarioKind::BroadcastVideo
            | ScenarioKind::BroadcastSection => connections.live.len(),
            ScenarioKind::FrontendAutoScan | ScenarioKind::FrontendBlindScan => connections.scan.len(),
            ScenarioKind::FilterTimeFilter => connections.time_filter.len(),
            ScenarioKind::FilterLinkage => 1,
            ScenarioKind::BroadcastLnbVideo | ScenarioKind::LnbDiseqc => connections.lnb_live.len(),
            ScenarioKind::PlaybackAudio | ScenarioKind::PlaybackVideo | ScenarioKind::PlaybackSection => {
                connections.playback.len()
            }
            ScenarioKind::RecordTsRecord | ScenarioKind::RecordAttachFilters => connections.record.len(),
            ScenarioKind::RecordLnb => connections.lnb_record.len(),
            ScenarioKind::DescramblerCreate | ScenarioKind::DescramblerScrambledBroadcast => {
                connections.descrambling.len()
            }
            ScenarioKind::DescramblerLnb => connections.lnb_descrambling.len(),
        }
    }

    /// Whether `filter` selects this scenario. An empty filter selects all.
    pub fn matches(self, filter: Option<&str>) -> bool {
        filter.map_or(true, |f| self.name().contains(f))
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of one scenario run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Skipped { reason: String },
    Failed { class: FailureClass, message: String },
}

impl Outcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Outcome::Skipped { reason: reason.into() }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }
}

impl From<Result<(), ScenarioError>> for Outcome {
    fn from(result: Result<(), ScenarioError>) -> Self {
        match result {
            Ok(()) => Outcome::Passed,
            Err(e) => match e.class() {
                Some(class) => Outcome::Failed { class, message: e.to_string() },
                None => Outcome::skipped(e.to_string()),
            },
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Passed => write!(f, "PASSED"),
            Outcome::Skipped { reason } => write!(f, "SKIPPED ({reason})"),
            Outcome::Failed { class, message } => write!(f, "FAILED [{class:?}] {message}"),
        }
    }
}

/// One row of the report: (service, scenario, configuration index).
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub service: String,
    pub scenario: String,
    /// Index into the resolved configurations; `None` when none resolved.
    pub configuration: Option<usize>,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub duration_ms: u64,
}

/// Every outcome of a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub results: Vec<ScenarioResult>,
}

impl RunReport {
    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.outcome == Outcome::Passed).count()
    }

    pub fn skipped(&self) -> usize {
        self.results.iter().filter(|r| matches!(r.outcome, Outcome::Skipped { .. })).count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_failure()).count()
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }
}

/// Runs scenarios against one device session.
pub struct ScenarioRunner<'a> {
    session: Arc<DeviceSession>,
    registry: &'a DeviceRegistry,
    connections: &'a ResolvedConnections,
    timeouts: Timeouts,
}

impl<'a> ScenarioRunner<'a> {
    pub fn new(
        session: Arc<DeviceSession>,
        registry: &'a DeviceRegistry,
        connections: &'a ResolvedConnections,
        timeouts: Timeouts,
    ) -> Self {
        Self { session, registry, connections, timeouts }
    }

    /// Run every scenario selected by `filter`.
    pub fn run(&self, filter: Option<&str>) -> Vec<ScenarioResult> {
        let mut results = Vec::new();
        for kind in ScenarioKind::ALL {
            if kind.matches(filter) {
                results.extend(self.run_kind(kind));
            }
        }
        results
    }

    fn run_kind(&self, kind: ScenarioKind) -> Vec<ScenarioResult> {
        let c = self.connections;
        match kind {
            ScenarioKind::DemuxOpen => self.each(kind, &c.live, |r, conn| r.demux_open(conn).into()),
            ScenarioKind::DemuxAvSyncTime => self.each(kind, &c.live, |r, conn| match &conn.pcr_filter {
                Some(pcr) => r.demux_av_sync_time(conn, pcr).into(),
                None => Outcome::skipped("no pcr filter in configuration"),
            }),
            ScenarioKind::FrontendTune => self.each(kind, &c.live, |r, conn| r.frontend_tune(conn).into()),
            ScenarioKind::FrontendLinkCiCam => self.each(kind, &c.live, |r, conn| match r.ci_cam_of(&conn.frontend) {
                Some(ci_cam_id) => r.frontend_link_cicam(conn, ci_cam_id).into(),
                None => Outcome::skipped("frontend cannot connect to a CI-CAM"),
            }),
            ScenarioKind::FrontendAutoScan => {
                self.each(kind, &c.scan, |r, conn| r.frontend_scan(conn, false).into())
            }
            ScenarioKind::FrontendBlindScan => {
                self.each(kind, &c.scan, |r, conn| r.frontend_scan(conn, true).into())
            }
            ScenarioKind::FilterStartInDemux => {
                self.each(kind, &c.live, |r, conn| r.filter_start_in_demux(conn).into())
            }
            ScenarioKind::FilterIpCid => self.each(kind, &c.live, |r, conn| match &conn.ip_filter {
                Some(ip) => r.filter_ip_cid(conn, ip).into(),
                None => Outcome::skipped("no ip filter in configuration"),
            }),
            ScenarioKind::FilterReconfigureStartId => {
                self.each(kind, &c.live, |r, conn| r.filter_reconfigure_start_id(conn).into())
            }
            ScenarioKind::FilterTimeFilter => {
                self.each(kind, &c.time_filter, |r, conn| r.filter_time_filter(conn).into())
            }
            ScenarioKind::FilterLinkage => self.each(kind, &[()], |r, _| r.filter_linkage().into()),
            ScenarioKind::BroadcastAudio => {
                self.each(kind, &c.live, |r, conn| r.broadcast(conn, &conn.audio_filter).into())
            }
            ScenarioKind::BroadcastVideo => {
                self.each(kind, &c.live, |r, conn| r.broadcast(conn, &conn.video_filter).into())
            }
            ScenarioKind::BroadcastSection => self.each(kind, &c.live, |r, conn| match &conn.section_filter {
                Some(section) => r.broadcast(conn, section).into(),
                None => Outcome::skipped("no section filter in configuration"),
            }),
            ScenarioKind::BroadcastLnbVideo => {
                self.each(kind, &c.lnb_live, |r, conn| r.broadcast_lnb_video(conn).into())
            }
            ScenarioKind::LnbDiseqc => self.each(kind, &c.lnb_live, |r, conn| {
                if conn.diseqc_messages.is_empty() {
                    Outcome::skipped("no diseqc messages in configuration")
                } else {
                    r.lnb_diseqc(conn).into()
                }
            }),
            ScenarioKind::PlaybackAudio => {
                self.each(kind, &c.playback, |r, conn| r.playback(conn, &conn.audio_filter).into())
            }
            ScenarioKind::PlaybackVideo => {
                self.each(kind, &c.playback, |r, conn| r.playback(conn, &conn.video_filter).into())
            }
            ScenarioKind::PlaybackSection => self.each(kind, &c.playback, |r, conn| match &conn.section_filter {
                Some(section) => r.playback(conn, section).into(),
                None => Outcome::skipped("no section filter in configuration"),
            }),
            ScenarioKind::RecordTsRecord => self.each(kind, &c.record, |r, conn| r.record_ts(conn).into()),
            ScenarioKind::RecordAttachFilters => {
                self.each(kind, &c.record, |r, conn| r.record_attach_filters(conn).into())
            }
            ScenarioKind::RecordLnb => self.each(kind, &c.lnb_record, |r, conn| r.record_lnb(conn).into()),
            ScenarioKind::DescramblerCreate => {
                self.each(kind, &c.descrambling, |r, conn| r.descrambler_create(conn).into())
            }
            ScenarioKind::DescramblerScrambledBroadcast => {
                self.each(kind, &c.descrambling, |r, conn| r.descrambler_broadcast(conn).into())
            }
            ScenarioKind::DescramblerLnb => {
                self.each(kind, &c.lnb_descrambling, |r, conn| r.descrambler_lnb(conn).into())
            }
        }
    }

    /// CI-CAM the frontend `id` can be linked through.
    fn ci_cam_of(&self, id: &str) -> Option<i32> {
        self.registry
            .frontends
            .get(id)
            .filter(|f| f.can_connect_to_cicam)
            .and_then(|f| f.cicam_id)
    }

    fn each<C>(
        &self,
        kind: ScenarioKind,
        configurations: &[C],
        body: impl Fn(&Self, &C) -> Outcome,
    ) -> Vec<ScenarioResult> {
        if configurations.is_empty() {
            info!("[Scenario] {} skipped: no configuration resolved", kind);
            return vec![self.result(kind, None, Outcome::skipped("no configuration resolved"), Duration::ZERO)];
        }
        configurations
            .iter()
            .enumerate()
            .map(|(index, configuration)| {
                let started = Instant::now();
                let outcome = body(self, configuration);
                self.session.clear_routes();
                match &outcome {
                    Outcome::Failed { .. } => warn!("[Scenario] {} #{}: {}", kind, index, outcome),
                    _ => info!("[Scenario] {} #{}: {}", kind, index, outcome),
                }
                self.result(kind, Some(index), outcome, started.elapsed())
            })
            .collect()
    }

    fn result(
        &self,
        kind: ScenarioKind,
        configuration: Option<usize>,
        outcome: Outcome,
        elapsed: Duration,
    ) -> ScenarioResult {
        ScenarioResult {
            service: self.session.service().to_string(),
            scenario: kind.name().to_string(),
            configuration,
            outcome,
            duration_ms: elapsed.as_millis() as u64,
        }
    }
}

/// Resolve and validate the topology of `config`.
pub fn prepare(config: &HarnessConfig) -> Result<ResolvedConnections, ConfigError> {
    let connections = ResolvedConnections::resolve(&config.registry, &config.pinned);
    validate(&connections, &config.registry)?;
    Ok(connections)
}

/// Run the selected scenarios against every named service instance.
pub fn run_services(
    config: &HarnessConfig,
    services: &[String],
    filter: Option<&str>,
) -> Result<RunReport, ConfigError> {
    let connections = prepare(config)?;
    let mut report = RunReport::default();
    for service in services {
        info!("Running scenarios against service {}", service);
        match run_service(config, &connections, service, filter) {
            Ok(results) => report.results.extend(results),
            Err(message) => {
                error!("Service {} failed: {}", service, message);
                report.results.push(ScenarioResult {
                    service: service.clone(),
                    scenario: "service.connect".to_string(),
                    configuration: None,
                    outcome: Outcome::Failed { class: FailureClass::Protocol, message },
                    duration_ms: 0,
                });
            }
        }
    }
    info!(
        "Run finished: {} passed, {} skipped, {} failed",
        report.passed(),
        report.skipped(),
        report.failed()
    );
    Ok(report)
}

fn run_service(
    config: &HarnessConfig,
    connections: &ResolvedConnections,
    service: &str,
    filter: Option<&str>,
) -> Result<Vec<ScenarioResult>, String> {
    if !service.starts_with(LOOPBACK_PREFIX) {
        return Err(format!("no device is bound to service {service:?}"));
    }
    let device = LoopbackDevice::new(LoopbackInventory::from_registry(&config.registry))
        .map_err(|e| format!("failed to start loopback device: {e}"))?;
    let device = Arc::new(device);
    let session = DeviceSession::connect(service, device.clone(), config.timeouts.reply);
    let runner = ScenarioRunner::new(session, &config.registry, connections, config.timeouts);
    let results = runner.run(filter);
    crate::device::DeviceControl::shutdown(device.as_ref());
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_names_are_unique() {
        let mut names: Vec<_> = ScenarioKind::ALL.iter().map(|k| k.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), ScenarioKind::ALL.len());
    }

    #[test]
    fn test_filter_selects_by_substring() {
        assert!(ScenarioKind::RecordLnb.matches(Some("record.")));
        assert!(ScenarioKind::RecordLnb.matches(None));
        assert!(!ScenarioKind::PlaybackAudio.matches(Some("record.")));
    }

    #[test]
    fn test_degraded_becomes_skip() {
        use tuner_hal_protocol::{Operation, ResultCode};
        let degraded: Result<(), ScenarioError> =
            Err(ScenarioError::Degraded { op: Operation::OpenTimeFilter, code: ResultCode::Unavailable });
        assert!(matches!(Outcome::from(degraded), Outcome::Skipped { .. }));

        let failed: Result<(), ScenarioError> = Err(ScenarioError::Expectation("no media".into()));
        assert_eq!(
            Outcome::from(failed),
            Outcome::Failed { class: FailureClass::Expectation, message: "Expectation failed: no media".into() }
        );
    }

    #[test]
    fn test_report_serializes_flat_outcome() {
        let report = RunReport {
            results: vec![ScenarioResult {
                service: "loopback".into(),
                scenario: "demux.open".into(),
                configuration: Some(0),
                outcome: Outcome::skipped("no configuration resolved"),
                duration_ms: 0,
            }],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["results"][0]["outcome"], "skipped");
        assert_eq!(json["results"][0]["reason"], "no configuration resolved");
    }

    const LOOPBACK_CONFIG: &str = r#"
        [harness]
        reply_timeout_ms = 2000
        event_timeout_ms = 2000
        min_record_bytes = 1880
        min_playback_bytes = 1880

        [[frontend]]
        id = "FE_DVBT"
        type = "DVBT"
        frequency_khz = 578000
        status_types = ["DEMOD_LOCK", "SNR"]
        can_connect_to_cicam = true
        cicam_id = 1

        [[frontend]]
        id = "FE_DVBS"
        type = "DVBS"
        frequency_khz = 1200000
        end_frequency_khz = 1300000

        [[filter]]
        id = "FILTER_AUDIO"
        main_type = "TS"
        sub_type = "AUDIO"
        pid = 257

        [[filter]]
        id = "FILTER_VIDEO"
        main_type = "TS"
        sub_type = "VIDEO"
        pid = 256
        monitor_event_types = 1

        [[filter]]
        id = "FILTER_SECTION"
        main_type = "TS"
        sub_type = "SECTION"
        pid = 0

        [[filter]]
        id = "FILTER_PCR"
        main_type = "TS"
        sub_type = "PCR"
        pid = 511

        [[filter]]
        id = "FILTER_RECORD"
        main_type = "TS"
        sub_type = "RECORD"

        [[filter]]
        id = "FILTER_IP"
        main_type = "IP"
        sub_type = "IP_PAYLOAD"
        ip_cid = 7

        [[dvr]]
        id = "DVR_PLAYBACK"
        type = "PLAYBACK"
        buffer_size = 12032
        input_file = "segment.ts"

        [[dvr]]
        id = "DVR_RECORD"
        type = "RECORD"
        buffer_size = 24064

        [[lnb]]
        id = "LNB0"
        voltage = "V13"

        [[descrambler]]
        id = "DESCRAMBLER0"
        cas_system_id = 176

        [[time_filter]]
        id = "TIME_FILTER0"
        time_stamp = 1000

        [[diseqc_message]]
        name = "DISEQC_POWER_ON"
        body = [14, 0, 0, 0, 0, 3]
    "#;

    /// Write 200 packets cycling through the video, audio and section pids.
    fn write_segment(dir: &std::path::Path) {
        let mut data = Vec::new();
        for i in 0..200u16 {
            let pid = [0x100u16, 0x101, 0x000][usize::from(i % 3)];
            let mut packet = vec![0xffu8; tuner_hal_protocol::TS_PACKET_SIZE];
            packet[0] = 0x47;
            packet[1] = (pid >> 8) as u8 & 0x1f;
            packet[2] = pid as u8;
            packet[3] = 0x10 | (i & 0x0f) as u8;
            data.extend_from_slice(&packet);
        }
        std::fs::write(dir.join("segment.ts"), data).unwrap();
    }

    fn loopback_config(text: &str) -> (tempfile::TempDir, HarnessConfig) {
        let dir = tempfile::tempdir().unwrap();
        write_segment(dir.path());
        let config = crate::config::parse_config(text, dir.path()).unwrap();
        (dir, config)
    }

    fn outcome_of<'r>(report: &'r RunReport, scenario: &str) -> Vec<&'r Outcome> {
        report.results.iter().filter(|r| r.scenario == scenario).map(|r| &r.outcome).collect()
    }

    #[test]
    fn test_loopback_run_has_no_failures() {
        let (_dir, config) = loopback_config(LOOPBACK_CONFIG);
        let report = run_services(&config, &["loopback".to_string()], None).unwrap();
        let failures: Vec<_> = report.results.iter().filter(|r| r.outcome.is_failure()).collect();
        assert!(failures.is_empty(), "failures: {:#?}", failures);

        for scenario in [
            "demux.open",
            "demux.av_sync_time",
            "frontend.tune",
            "frontend.link_cicam",
            "frontend.blind_scan",
            "filter.ip_cid",
            "filter.reconfigure_start_id",
            "filter.time_filter",
            "filter.linkage",
            "broadcast.video",
            "broadcast.section",
            "broadcast.lnb_video",
            "lnb.diseqc",
            "playback.audio",
            "record.ts_record",
            "record.lnb",
            "descrambler.create",
            "descrambler.scrambled_broadcast",
            "descrambler.lnb",
        ] {
            let outcomes = outcome_of(&report, scenario);
            assert!(!outcomes.is_empty(), "{scenario} did not run");
            assert!(outcomes.iter().any(|o| **o == Outcome::Passed), "{scenario} never passed");
        }
    }

    #[test]
    fn test_scenario_filter_and_missing_family() {
        let block = "[[time_filter]]\n        id = \"TIME_FILTER0\"\n        time_stamp = 1000";
        assert!(LOOPBACK_CONFIG.contains(block));
        let text = LOOPBACK_CONFIG.replace(block, "");
        let (_dir, config) = loopback_config(&text);
        let report = run_services(&config, &["loopback".to_string()], Some("time_filter")).unwrap();
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].configuration, None);
        assert_eq!(report.results[0].outcome, Outcome::skipped("no configuration resolved"));
    }

    #[test]
    fn test_unsupported_time_filter_is_skipped() {
        let (_dir, config) = loopback_config(LOOPBACK_CONFIG);
        let connections = prepare(&config).unwrap();
        let inventory = LoopbackInventory { time_filter: false, ..LoopbackInventory::from_registry(&config.registry) };
        let device = Arc::new(LoopbackDevice::new(inventory).unwrap());
        let session = DeviceSession::connect("loopback", device, config.timeouts.reply);
        let runner = ScenarioRunner::new(session, &config.registry, &connections, config.timeouts);
        let results = runner.run(Some("filter.time_filter"));
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0].outcome, Outcome::Skipped { .. }));
    }

    #[test]
    fn test_monitor_events_alone_are_not_output() {
        use crate::topology::DescramblingConnection;

        // Pid 511 is absent from the segment, so these filters only ever see monitor events.
        let silent = r#"
        [[filter]]
        id = "FILTER_SILENT_VIDEO"
        main_type = "TS"
        sub_type = "VIDEO"
        pid = 511
        monitor_event_types = 1

        [[filter]]
        id = "FILTER_SILENT_SECTION"
        main_type = "TS"
        sub_type = "SECTION"
        pid = 511
        monitor_event_types = 1
        "#;
        let text = format!("{}\n{}", LOOPBACK_CONFIG.replace("event_timeout_ms = 2000", "event_timeout_ms = 300"), silent);
        let (_dir, config) = loopback_config(&text);
        let connections = ResolvedConnections::default();
        let device = Arc::new(LoopbackDevice::new(LoopbackInventory::from_registry(&config.registry)).unwrap());
        let session = DeviceSession::connect("loopback", device, config.timeouts.reply);
        let runner = ScenarioRunner::new(session, &config.registry, &connections, config.timeouts);

        for silent_filter in ["FILTER_SILENT_VIDEO", "FILTER_SILENT_SECTION"] {
            let conn = DescramblingConnection {
                frontend: None,
                dvr_software_fe: None,
                audio_filter: "FILTER_AUDIO".to_string(),
                video_filter: silent_filter.to_string(),
                descrambler: "DESCRAMBLER0".to_string(),
                dvr_source: Some("DVR_PLAYBACK".to_string()),
                extra_filters: Vec::new(),
            };
            match Outcome::from(runner.descrambler_broadcast(&conn)) {
                Outcome::Failed { class: FailureClass::Liveness, message } => {
                    assert!(message.contains(silent_filter), "{message}")
                }
                other => panic!("{silent_filter}: unexpected {other:?}"),
            }
            runner.session.clear_routes();
        }
    }

    #[test]
    fn test_unknown_service_fails_to_connect() {
        let (_dir, config) = loopback_config(LOOPBACK_CONFIG);
        let report = run_services(&config, &["tuner-hal-1".to_string()], Some("demux")).unwrap();
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].scenario, "service.connect");
        assert!(matches!(report.results[0].outcome, Outcome::Failed { class: FailureClass::Protocol, .. }));
        assert!(report.has_failures());
    }

    #[test]
    fn test_invalid_topology_is_fatal() {
        let text = format!("{LOOPBACK_CONFIG}\n[connections.scan]\nfrontend = \"FE_MISSING\"\n");
        let (_dir, config) = loopback_config(&text);
        assert!(matches!(
            run_services(&config, &["loopback".to_string()], None),
            Err(ConfigError::Validation(_))
        ));
    }
}
