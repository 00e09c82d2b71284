//! Read-only catalogs of the devices declared in the configuration.
//!
//! - [`DeviceRegistry`]: one ordered [`Catalog`] per device kind
//! - [`AvPair`]: explicit audio/video filter pairing
//!
//! Declaration order is preserved; it drives enumeration order in the
//! topology resolver.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::Deserialize;
use tuner_hal_protocol::{
    DataFormat, DvrSettings, DvrType, FilterMainType, FilterSettings, FilterSubType, FilterType,
    FrontendSettings, FrontendStatusType, FrontendType, LnbPosition, LnbTone, LnbVoltage,
    TS_PACKET_SIZE,
};

use crate::error::ConfigError;

/// Device kinds known to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Frontend,
    Filter,
    Dvr,
    Lnb,
    Descrambler,
    TimeFilter,
    DiseqcMessage,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::Frontend => "frontend",
            DeviceKind::Filter => "filter",
            DeviceKind::Dvr => "dvr",
            DeviceKind::Lnb => "lnb",
            DeviceKind::Descrambler => "descrambler",
            DeviceKind::TimeFilter => "time filter",
            DeviceKind::DiseqcMessage => "diseqc message",
        };
        f.write_str(name)
    }
}

/// A record the registry can index by id.
pub trait Described {
    const KIND: DeviceKind;
    fn id(&self) -> &str;
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrontendDescription {
    pub id: String,
    #[serde(rename = "type")]
    pub frontend_type: FrontendType,
    #[serde(default)]
    pub is_software: bool,
    #[serde(default)]
    pub frequency_khz: u64,
    #[serde(default)]
    pub end_frequency_khz: Option<u64>,
    #[serde(default)]
    pub status_types: Vec<FrontendStatusType>,
    #[serde(default)]
    pub can_connect_to_cicam: bool,
    #[serde(default)]
    pub cicam_id: Option<i32>,
}

impl FrontendDescription {
    pub fn new(id: impl Into<String>, frontend_type: FrontendType) -> Self {
        Self {
            id: id.into(),
            frontend_type,
            is_software: false,
            frequency_khz: 0,
            end_frequency_khz: None,
            status_types: Vec::new(),
            can_connect_to_cicam: false,
            cicam_id: None,
        }
    }

    /// Mark this frontend as software-implemented.
    pub fn software(mut self) -> Self {
        self.is_software = true;
        self
    }

    pub fn settings(&self) -> FrontendSettings {
        FrontendSettings {
            frontend_type: self.frontend_type,
            frequency_khz: self.frequency_khz,
            end_frequency_khz: self.end_frequency_khz,
        }
    }
}

impl Described for FrontendDescription {
    const KIND: DeviceKind = DeviceKind::Frontend;
    fn id(&self) -> &str {
        &self.id
    }
}

fn default_filter_buffer() -> u32 {
    16 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterDescription {
    pub id: String,
    pub main_type: FilterMainType,
    pub sub_type: FilterSubType,
    #[serde(default = "default_filter_buffer")]
    pub buffer_size: u32,
    #[serde(default)]
    pub pid: Option<u16>,
    #[serde(default)]
    pub use_fmq: bool,
    /// Bitmask of `tuner_hal_protocol::monitor` bits.
    #[serde(default)]
    pub monitor_event_types: u32,
    #[serde(default)]
    pub ip_cid: Option<i32>,
    #[serde(default)]
    pub time_delay_ms: u32,
    #[serde(default)]
    pub data_delay_bytes: u32,
}

impl FilterDescription {
    pub fn new(id: impl Into<String>, main_type: FilterMainType, sub_type: FilterSubType) -> Self {
        Self {
            id: id.into(),
            main_type,
            sub_type,
            buffer_size: default_filter_buffer(),
            pid: None,
            use_fmq: false,
            monitor_event_types: 0,
            ip_cid: None,
            time_delay_ms: 0,
            data_delay_bytes: 0,
        }
    }

    pub fn with_pid(mut self, pid: u16) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn filter_type(&self) -> FilterType {
        FilterType::new(self.main_type, self.sub_type)
    }

    pub fn settings(&self) -> FilterSettings {
        FilterSettings {
            pid: self.pid,
            is_raw: false,
            time_delay_ms: self.time_delay_ms,
            data_delay_bytes: self.data_delay_bytes,
        }
    }
}

impl Described for FilterDescription {
    const KIND: DeviceKind = DeviceKind::Filter;
    fn id(&self) -> &str {
        &self.id
    }
}

fn default_dvr_buffer() -> u32 {
    4 * 1024 * 1024
}

fn default_status_mask() -> u8 {
    0x0f
}

fn default_packet_size() -> u32 {
    TS_PACKET_SIZE as u32
}

#[derive(Debug, Clone, Deserialize)]
pub struct DvrDescription {
    pub id: String,
    #[serde(rename = "type")]
    pub dvr_type: DvrType,
    #[serde(default = "default_dvr_buffer")]
    pub buffer_size: u32,
    #[serde(default = "default_status_mask")]
    pub status_mask: u8,
    #[serde(default)]
    pub low_threshold: u32,
    #[serde(default)]
    pub high_threshold: u32,
    #[serde(default = "default_packet_size")]
    pub packet_size: u32,
    #[serde(default)]
    pub data_format: DataFormat,
    /// Input file fed through a playback dvr.
    #[serde(default)]
    pub input_file: Option<PathBuf>,
}

impl DvrDescription {
    fn new(id: impl Into<String>, dvr_type: DvrType, buffer_size: u32) -> Self {
        Self {
            id: id.into(),
            dvr_type,
            buffer_size,
            status_mask: default_status_mask(),
            low_threshold: buffer_size / 8,
            high_threshold: buffer_size / 8 * 7,
            packet_size: default_packet_size(),
            data_format: DataFormat::Ts,
            input_file: None,
        }
    }

    pub fn playback(id: impl Into<String>, buffer_size: u32, input_file: impl Into<PathBuf>) -> Self {
        let mut dvr = Self::new(id, DvrType::Playback, buffer_size);
        dvr.input_file = Some(input_file.into());
        dvr
    }

    pub fn record(id: impl Into<String>, buffer_size: u32) -> Self {
        Self::new(id, DvrType::Record, buffer_size)
    }

    pub fn settings(&self) -> DvrSettings {
        DvrSettings {
            status_mask: self.status_mask,
            low_threshold: self.low_threshold,
            high_threshold: self.high_threshold,
            packet_size: self.packet_size,
            data_format: self.data_format,
        }
    }
}

impl Described for DvrDescription {
    const KIND: DeviceKind = DeviceKind::Dvr;
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LnbDescription {
    pub id: String,
    /// Opened by name when set, otherwise by the first id the device reports.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub voltage: LnbVoltage,
    #[serde(default)]
    pub tone: LnbTone,
    #[serde(default)]
    pub position: LnbPosition,
}

impl LnbDescription {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            voltage: LnbVoltage::V12,
            tone: LnbTone::None,
            position: LnbPosition::Undefined,
        }
    }
}

impl Described for LnbDescription {
    const KIND: DeviceKind = DeviceKind::Lnb;
    fn id(&self) -> &str {
        &self.id
    }
}

fn default_provision() -> String {
    "PROVISION".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DescramblerDescription {
    pub id: String,
    pub cas_system_id: i32,
    #[serde(default = "default_provision")]
    pub provision: String,
    #[serde(default)]
    pub private_data: Vec<u8>,
}

impl DescramblerDescription {
    pub fn new(id: impl Into<String>, cas_system_id: i32) -> Self {
        Self {
            id: id.into(),
            cas_system_id,
            provision: default_provision(),
            private_data: Vec::new(),
        }
    }
}

impl Described for DescramblerDescription {
    const KIND: DeviceKind = DeviceKind::Descrambler;
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeFilterDescription {
    pub id: String,
    pub time_stamp: u64,
}

impl TimeFilterDescription {
    pub fn new(id: impl Into<String>, time_stamp: u64) -> Self {
        Self { id: id.into(), time_stamp }
    }
}

impl Described for TimeFilterDescription {
    const KIND: DeviceKind = DeviceKind::TimeFilter;
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiseqcMessage {
    pub name: String,
    pub body: Vec<u8>,
}

impl Described for DiseqcMessage {
    const KIND: DeviceKind = DeviceKind::DiseqcMessage;
    fn id(&self) -> &str {
        &self.name
    }
}

/// Ordered catalog of one device kind.
#[derive(Debug, Clone)]
pub struct Catalog<T> {
    items: Vec<T>,
    index: HashMap<String, usize>,
}

impl<T> Default for Catalog<T> {
    fn default() -> Self {
        Self { items: Vec::new(), index: HashMap::new() }
    }
}

impl<T: Described> Catalog<T> {
    /// Add a record, rejecting duplicate ids.
    pub fn insert(&mut self, item: T) -> Result<(), ConfigError> {
        if self.index.contains_key(item.id()) {
            return Err(ConfigError::DuplicateId { kind: T::KIND, id: item.id().to_string() });
        }
        self.index.insert(item.id().to_string(), self.items.len());
        self.items.push(item);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.index.get(id).map(|&i| &self.items[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Ids in declaration order.
    pub fn ids(&self) -> Vec<String> {
        self.items.iter().map(|item| item.id().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// An audio filter and the video filter it is played with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AvPair {
    pub audio: String,
    pub video: String,
}

/// Registry of every declared device.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    pub frontends: Catalog<FrontendDescription>,
    pub filters: Catalog<FilterDescription>,
    pub dvrs: Catalog<DvrDescription>,
    pub lnbs: Catalog<LnbDescription>,
    pub descramblers: Catalog<DescramblerDescription>,
    pub time_filters: Catalog<TimeFilterDescription>,
    pub diseqc_messages: Catalog<DiseqcMessage>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a device of `kind` named `id` is declared.
    pub fn contains(&self, kind: DeviceKind, id: &str) -> bool {
        match kind {
            DeviceKind::Frontend => self.frontends.contains(id),
            DeviceKind::Filter => self.filters.contains(id),
            DeviceKind::Dvr => self.dvrs.contains(id),
            DeviceKind::Lnb => self.lnbs.contains(id),
            DeviceKind::Descrambler => self.descramblers.contains(id),
            DeviceKind::TimeFilter => self.time_filters.contains(id),
            DeviceKind::DiseqcMessage => self.diseqc_messages.contains(id),
        }
    }

    /// Filter ids of one subtype, in declaration order.
    pub fn filter_ids(&self, sub_type: FilterSubType) -> Vec<String> {
        self.filters
            .iter()
            .filter(|f| f.sub_type == sub_type)
            .map(|f| f.id.clone())
            .collect()
    }

    /// Dvr ids of one direction, in declaration order.
    pub fn dvr_ids(&self, dvr_type: DvrType) -> Vec<String> {
        self.dvrs
            .iter()
            .filter(|d| d.dvr_type == dvr_type)
            .map(|d| d.id.clone())
            .collect()
    }

    /// Audio filters paired positionally with video filters.
    ///
    /// Unpaired filters are left out; topology validation reports the count mismatch.
    pub fn av_pairs(&self) -> Vec<AvPair> {
        self.filter_ids(FilterSubType::Audio)
            .into_iter()
            .zip(self.filter_ids(FilterSubType::Video))
            .map(|(audio, video)| AvPair { audio, video })
            .collect()
    }

    pub fn is_software_frontend(&self, id: &str) -> bool {
        self.frontends.get(id).map(|f| f.is_software).unwrap_or(false)
    }

    pub fn is_satellite_frontend(&self, id: &str) -> bool {
        self.frontends
            .get(id)
            .map(|f| f.frontend_type.is_satellite())
            .unwrap_or(false)
    }
}
