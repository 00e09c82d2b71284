//! Device attribute types shared by requests, indications and the registry.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Size of one MPEG transport stream packet.
pub const TS_PACKET_SIZE: usize = 188;

/// Monitor event bits accepted by a filter.
pub mod monitor {
    /// Report scrambling status changes.
    pub const SCRAMBLING_STATUS: u32 = 1 << 0;
    /// Report IP context id changes.
    pub const IP_CID_CHANGE: u32 = 1 << 1;
}

/// Opaque handle the device assigns to an opened resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle(pub u64);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Caller-chosen token echoed by the reply to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationToken(pub u64);

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token {}", self.0)
    }
}

/// Broadcast standard implemented by a frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrontendType {
    Undefined,
    Analog,
    Atsc,
    Atsc3,
    Dvbc,
    Dvbs,
    Dvbt,
    Isdbs,
    Isdbs3,
    Isdbt,
    Dtmb,
    Iptv,
}

impl FrontendType {
    /// Satellite standards need an LNB in front of the tuner.
    pub fn is_satellite(self) -> bool {
        matches!(self, FrontendType::Dvbs | FrontendType::Isdbs | FrontendType::Isdbs3)
    }
}

/// Status items a frontend can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrontendStatusType {
    DemodLock,
    Snr,
    Ber,
    SignalStrength,
    Uec,
    IsMiso,
}

/// One reported frontend status item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontendStatus {
    DemodLocked(bool),
    Snr(i32),
    Ber(i32),
    SignalStrength(i32),
    Uec(i32),
    IsMiso(bool),
}

impl FrontendStatus {
    pub fn status_type(&self) -> FrontendStatusType {
        match self {
            FrontendStatus::DemodLocked(_) => FrontendStatusType::DemodLock,
            FrontendStatus::Snr(_) => FrontendStatusType::Snr,
            FrontendStatus::Ber(_) => FrontendStatusType::Ber,
            FrontendStatus::SignalStrength(_) => FrontendStatusType::SignalStrength,
            FrontendStatus::Uec(_) => FrontendStatusType::Uec,
            FrontendStatus::IsMiso(_) => FrontendStatusType::IsMiso,
        }
    }
}

/// Tuning parameters sent with tune and scan requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrontendSettings {
    pub frontend_type: FrontendType,
    pub frequency_khz: u64,
    /// Upper bound for blind scans.
    pub end_frequency_khz: Option<u64>,
}

/// Scan strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanType {
    Auto,
    Blind,
}

/// Transport layer a filter parses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterMainType {
    Ts,
    Mmtp,
    Ip,
    Tlv,
    Alp,
}

impl FilterMainType {
    /// In the bit order of [`DemuxCapabilities::link_caps`].
    pub const ALL: [FilterMainType; 5] = [
        FilterMainType::Ts,
        FilterMainType::Mmtp,
        FilterMainType::Ip,
        FilterMainType::Tlv,
        FilterMainType::Alp,
    ];
}

/// Payload a filter extracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterSubType {
    Undefined,
    Section,
    Pes,
    Ts,
    Pcr,
    Temi,
    Audio,
    Video,
    Record,
    Ntp,
    IpPayload,
    Payload,
}

/// Main type and subtype of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterType {
    pub main: FilterMainType,
    pub sub: FilterSubType,
}

impl FilterType {
    pub fn new(main: FilterMainType, sub: FilterSubType) -> Self {
        Self { main, sub }
    }
}

/// Filter configuration applied after open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilterSettings {
    /// Packet id to select; `None` selects every packet.
    pub pid: Option<u16>,
    /// Deliver raw packets instead of parsed payloads.
    pub is_raw: bool,
    /// Delay in milliseconds before events are delivered.
    pub time_delay_ms: u32,
    /// Bytes buffered before events are delivered.
    pub data_delay_bytes: u32,
}

/// Direction of a dvr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DvrType {
    Playback,
    Record,
}

impl fmt::Display for DvrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DvrType::Playback => write!(f, "playback"),
            DvrType::Record => write!(f, "record"),
        }
    }
}

/// Data format moved through a dvr queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataFormat {
    #[default]
    Ts,
    Pes,
    Es,
    ShvTlv,
}

/// Flow-control parameters of a dvr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DvrSettings {
    pub status_mask: u8,
    pub low_threshold: u32,
    pub high_threshold: u32,
    pub packet_size: u32,
    pub data_format: DataFormat,
}

/// Flow status reported for a playback dvr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaybackStatus {
    SpaceEmpty,
    SpaceAlmostEmpty,
    SpaceAlmostFull,
    SpaceFull,
}

impl PlaybackStatus {
    /// Derive the next status from queue occupancy.
    ///
    /// Returns `previous` when occupancy sits between the thresholds.
    pub fn from_occupancy(
        available_to_write: usize,
        available_to_read: usize,
        settings: &DvrSettings,
        previous: PlaybackStatus,
    ) -> PlaybackStatus {
        if available_to_write == 0 {
            PlaybackStatus::SpaceFull
        } else if available_to_read == 0 {
            PlaybackStatus::SpaceEmpty
        } else if available_to_read > settings.high_threshold as usize {
            PlaybackStatus::SpaceAlmostFull
        } else if available_to_read < settings.low_threshold as usize {
            PlaybackStatus::SpaceAlmostEmpty
        } else {
            previous
        }
    }
}

/// Flow status reported for a record dvr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordStatus {
    DataReady,
    LowWater,
    HighWater,
    Overflow,
}

impl RecordStatus {
    /// Derive the next status from queue occupancy.
    pub fn from_occupancy(
        available_to_write: usize,
        available_to_read: usize,
        settings: &DvrSettings,
        previous: RecordStatus,
    ) -> RecordStatus {
        if available_to_write == 0 {
            RecordStatus::Overflow
        } else if available_to_read > settings.high_threshold as usize {
            RecordStatus::HighWater
        } else if available_to_read < settings.low_threshold as usize {
            RecordStatus::LowWater
        } else {
            previous
        }
    }
}

/// LNB supply voltage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LnbVoltage {
    #[default]
    None,
    V5,
    V11,
    V12,
    V13,
    V14,
    V15,
    V18,
    V19,
}

/// LNB 22kHz tone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LnbTone {
    #[default]
    None,
    Continuous,
}

/// Satellite position selected through the LNB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LnbPosition {
    #[default]
    Undefined,
    A,
    B,
}

/// Demux capabilities reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DemuxCapabilities {
    pub num_demux: u32,
    pub num_record: u32,
    pub num_playback: u32,
    pub has_time_filter: bool,
    /// Filter linkage matrix: bit `j` of entry `i` lets a filter of main type
    /// `FilterMainType::ALL[i]` feed one of main type `FilterMainType::ALL[j]`.
    pub link_caps: [u32; 5],
}

impl DemuxCapabilities {
    /// Every (source, sink) main type pair the demux can link.
    pub fn linkages(&self) -> Vec<(FilterMainType, FilterMainType)> {
        let mut pairs = Vec::new();
        for (i, source) in FilterMainType::ALL.into_iter().enumerate() {
            for (j, sink) in FilterMainType::ALL.into_iter().enumerate() {
                if self.link_caps[i] & (1 << j) != 0 {
                    pairs.push((source, sink));
                }
            }
        }
        pairs
    }
}
