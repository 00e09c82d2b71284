//! Per-scenario hardware connections and their generators.
//!
//! Each generator builds role pools from the [`DeviceRegistry`], resolves
//! them under the scenario's rules and maps every surviving combination to a
//! typed connection record. A connection pinned in the configuration
//! replaces generation for its family.

use log::{debug, info};
use serde::Deserialize;
use tuner_hal_protocol::{DvrType, FilterSubType};

use crate::registry::{AvPair, DeviceRegistry};
use crate::topology::resolver::{resolve, resolve_or_pinned, Combination, Pool, Rule};

mod role {
    pub const FRONTEND: &str = "frontend";
    pub const AV: &str = "av_pair";
    pub const SECTION: &str = "section_filter";
    pub const IP: &str = "ip_filter";
    pub const PCR: &str = "pcr_filter";
    pub const BRIDGE: &str = "dvr_software_fe";
    pub const DVR_PLAYBACK: &str = "dvr_playback";
    pub const DVR_RECORD: &str = "dvr_record";
    pub const RECORD_FILTER: &str = "record_filter";
    pub const DVR_SOURCE: &str = "dvr_source";
    pub const DESCRAMBLER: &str = "descrambler";
    pub const LNB: &str = "lnb";
    pub const TIME_FILTER: &str = "time_filter";
}

/// Value bound to a role: a device id, or an audio/video pair.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Device(String),
    Pair(AvPair),
}

impl Slot {
    fn id(&self) -> Option<&str> {
        match self {
            Slot::Device(id) => Some(id),
            Slot::Pair(_) => None,
        }
    }
}

fn devices(ids: Vec<String>) -> Vec<Slot> {
    ids.into_iter().map(Slot::Device).collect()
}

fn pairs(registry: &DeviceRegistry) -> Vec<Slot> {
    registry.av_pairs().into_iter().map(Slot::Pair).collect()
}

fn id_of(combination: &Combination<Slot>, role: &str) -> Option<String> {
    combination.get(role).and_then(Slot::id).map(str::to_string)
}

fn pair_of(combination: &Combination<Slot>) -> AvPair {
    match combination.get(role::AV) {
        Some(Slot::Pair(pair)) => pair.clone(),
        _ => AvPair { audio: String::new(), video: String::new() },
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LiveConnection {
    pub frontend: String,
    #[serde(default)]
    pub dvr_software_fe: Option<String>,
    pub audio_filter: String,
    pub video_filter: String,
    #[serde(default)]
    pub section_filter: Option<String>,
    #[serde(default)]
    pub ip_filter: Option<String>,
    #[serde(default)]
    pub pcr_filter: Option<String>,
    #[serde(default)]
    pub extra_filters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScanConnection {
    pub frontend: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlaybackConnection {
    pub dvr: String,
    pub audio_filter: String,
    pub video_filter: String,
    #[serde(default)]
    pub section_filter: Option<String>,
    #[serde(default)]
    pub extra_filters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RecordConnection {
    /// Live source; exclusive with `dvr_source`.
    #[serde(default)]
    pub frontend: Option<String>,
    #[serde(default)]
    pub dvr_software_fe: Option<String>,
    pub dvr_record: String,
    pub record_filter: String,
    /// Playback source; exclusive with `frontend`.
    #[serde(default)]
    pub dvr_source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DescramblingConnection {
    #[serde(default)]
    pub frontend: Option<String>,
    #[serde(default)]
    pub dvr_software_fe: Option<String>,
    pub audio_filter: String,
    pub video_filter: String,
    pub descrambler: String,
    #[serde(default)]
    pub dvr_source: Option<String>,
    #[serde(default)]
    pub extra_filters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LnbLiveConnection {
    pub frontend: String,
    pub audio_filter: String,
    pub video_filter: String,
    pub lnb: String,
    #[serde(default)]
    pub diseqc_messages: Vec<String>,
    #[serde(default)]
    pub extra_filters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LnbRecordConnection {
    pub frontend: String,
    pub dvr_record: String,
    pub record_filter: String,
    pub lnb: String,
    #[serde(default)]
    pub diseqc_messages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TimeFilterConnection {
    pub time_filter: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LnbDescramblingConnection {
    pub frontend: String,
    pub audio_filter: String,
    pub video_filter: String,
    pub lnb: String,
    pub descrambler: String,
    #[serde(default)]
    pub diseqc_messages: Vec<String>,
}

/// Connections pinned in the configuration file, one optional entry per family.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PinnedConnections {
    pub live: Option<LiveConnection>,
    pub scan: Option<ScanConnection>,
    pub playback: Option<PlaybackConnection>,
    pub record: Option<RecordConnection>,
    pub descrambling: Option<DescramblingConnection>,
    pub lnb_live: Option<LnbLiveConnection>,
    pub lnb_record: Option<LnbRecordConnection>,
    pub time_filter: Option<TimeFilterConnection>,
    pub lnb_descrambling: Option<LnbDescramblingConnection>,
}

/// Every configuration the orchestrator will run, per family.
#[derive(Debug, Clone, Default)]
pub struct ResolvedConnections {
    pub live: Vec<LiveConnection>,
    pub scan: Vec<ScanConnection>,
    pub playback: Vec<PlaybackConnection>,
    pub record: Vec<RecordConnection>,
    pub descrambling: Vec<DescramblingConnection>,
    pub lnb_live: Vec<LnbLiveConnection>,
    pub lnb_record: Vec<LnbRecordConnection>,
    pub time_filter: Vec<TimeFilterConnection>,
    pub lnb_descrambling: Vec<LnbDescramblingConnection>,
}

impl ResolvedConnections {
    /// Resolve every family, honoring pinned entries.
    pub fn resolve(registry: &DeviceRegistry, pinned: &PinnedConnections) -> Self {
        let resolved = Self {
            live: resolve_or_pinned(pinned.live.as_ref(), || generate_live(registry)),
            scan: resolve_or_pinned(pinned.scan.as_ref(), || generate_scan(registry)),
            playback: resolve_or_pinned(pinned.playback.as_ref(), || generate_playback(registry)),
            record: resolve_or_pinned(pinned.record.as_ref(), || generate_record(registry)),
            descrambling: resolve_or_pinned(pinned.descrambling.as_ref(), || {
                generate_descrambling(registry)
            }),
            lnb_live: resolve_or_pinned(pinned.lnb_live.as_ref(), || generate_lnb_live(registry)),
            lnb_record: resolve_or_pinned(pinned.lnb_record.as_ref(), || {
                generate_lnb_record(registry)
            }),
            time_filter: resolve_or_pinned(pinned.time_filter.as_ref(), || {
                generate_time_filter(registry)
            }),
            lnb_descrambling: resolve_or_pinned(pinned.lnb_descrambling.as_ref(), || {
                generate_lnb_descrambling(registry)
            }),
        };
        info!(
            "[Topology] live={} scan={} playback={} record={} descrambling={} lnb_live={} lnb_record={} time_filter={} lnb_descrambling={}",
            resolved.live.len(),
            resolved.scan.len(),
            resolved.playback.len(),
            resolved.record.len(),
            resolved.descrambling.len(),
            resolved.lnb_live.len(),
            resolved.lnb_record.len(),
            resolved.time_filter.len(),
            resolved.lnb_descrambling.len(),
        );
        resolved
    }
}

/// Software frontends need a dvr feeding them; hardware frontends must not get one.
fn bridge_matches_frontend(registry: &DeviceRegistry) -> Rule<'_, Slot> {
    Rule::new("bridge matches frontend", move |c: &Combination<Slot>| {
        let software = id_of(c, role::FRONTEND)
            .map(|fe| registry.is_software_frontend(&fe))
            .unwrap_or(false);
        software == c.is_present(role::BRIDGE)
    })
}

fn source_present<'r>() -> Rule<'r, Slot> {
    Rule::new("frontend or dvr source", |c: &Combination<Slot>| {
        c.is_present(role::FRONTEND) || c.is_present(role::DVR_SOURCE)
    })
}

fn single_source<'r>() -> Rule<'r, Slot> {
    Rule::new("single source", |c: &Combination<Slot>| {
        !(c.is_present(role::FRONTEND) && c.is_present(role::DVR_SOURCE))
    })
}

fn no_dvr_aliasing<'r>() -> Rule<'r, Slot> {
    Rule::new("bridge is not the data source", |c: &Combination<Slot>| {
        match (id_of(c, role::BRIDGE), id_of(c, role::DVR_SOURCE)) {
            (Some(bridge), Some(source)) => bridge != source,
            _ => true,
        }
    })
}

fn satellite_frontend(registry: &DeviceRegistry) -> Rule<'_, Slot> {
    Rule::new("satellite frontend", move |c: &Combination<Slot>| {
        id_of(c, role::FRONTEND)
            .map(|fe| registry.is_satellite_frontend(&fe))
            .unwrap_or(false)
    })
}

fn log_resolved(scenario: &str, count: usize) {
    debug!("[Topology] {} resolved to {} configuration(s)", scenario, count);
}

pub fn generate_live(registry: &DeviceRegistry) -> Vec<LiveConnection> {
    let pools = vec![
        Pool::required(role::FRONTEND, devices(registry.frontends.ids())),
        Pool::required(role::AV, pairs(registry)),
        Pool::optional(role::SECTION, devices(registry.filter_ids(FilterSubType::Section))),
        Pool::optional(role::IP, devices(registry.filter_ids(FilterSubType::IpPayload))),
        Pool::optional(role::PCR, devices(registry.filter_ids(FilterSubType::Pcr))),
        Pool::optional(role::BRIDGE, devices(registry.dvr_ids(DvrType::Playback))),
    ];
    let rules = [bridge_matches_frontend(registry)];
    let out: Vec<_> = resolve(&pools, &rules)
        .iter()
        .map(|c| {
            let pair = pair_of(c);
            LiveConnection {
                frontend: id_of(c, role::FRONTEND).unwrap_or_default(),
                dvr_software_fe: id_of(c, role::BRIDGE),
                audio_filter: pair.audio,
                video_filter: pair.video,
                section_filter: id_of(c, role::SECTION),
                ip_filter: id_of(c, role::IP),
                pcr_filter: id_of(c, role::PCR),
                extra_filters: Vec::new(),
            }
        })
        .collect();
    log_resolved("live", out.len());
    out
}

pub fn generate_scan(registry: &DeviceRegistry) -> Vec<ScanConnection> {
    let out: Vec<_> = registry
        .frontends
        .ids()
        .into_iter()
        .map(|frontend| ScanConnection { frontend })
        .collect();
    log_resolved("scan", out.len());
    out
}

pub fn generate_playback(registry: &DeviceRegistry) -> Vec<PlaybackConnection> {
    let pools = vec![
        Pool::required(role::DVR_PLAYBACK, devices(registry.dvr_ids(DvrType::Playback))),
        Pool::required(role::AV, pairs(registry)),
        Pool::optional(role::SECTION, devices(registry.filter_ids(FilterSubType::Section))),
    ];
    let out: Vec<_> = resolve(&pools, &[])
        .iter()
        .map(|c| {
            let pair = pair_of(c);
            PlaybackConnection {
                dvr: id_of(c, role::DVR_PLAYBACK).unwrap_or_default(),
                audio_filter: pair.audio,
                video_filter: pair.video,
                section_filter: id_of(c, role::SECTION),
                extra_filters: Vec::new(),
            }
        })
        .collect();
    log_resolved("playback", out.len());
    out
}

pub fn generate_record(registry: &DeviceRegistry) -> Vec<RecordConnection> {
    let pools = vec![
        Pool::optional(role::FRONTEND, devices(registry.frontends.ids())),
        Pool::required(role::DVR_RECORD, devices(registry.dvr_ids(DvrType::Record))),
        Pool::required(role::RECORD_FILTER, devices(registry.filter_ids(FilterSubType::Record))),
        Pool::optional(role::BRIDGE, devices(registry.dvr_ids(DvrType::Playback))),
        Pool::optional(role::DVR_SOURCE, devices(registry.dvr_ids(DvrType::Playback))),
    ];
    let rules = [
        source_present(),
        single_source(),
        bridge_matches_frontend(registry),
        no_dvr_aliasing(),
    ];
    let out: Vec<_> = resolve(&pools, &rules)
        .iter()
        .map(|c| RecordConnection {
            frontend: id_of(c, role::FRONTEND),
            dvr_software_fe: id_of(c, role::BRIDGE),
            dvr_record: id_of(c, role::DVR_RECORD).unwrap_or_default(),
            record_filter: id_of(c, role::RECORD_FILTER).unwrap_or_default(),
            dvr_source: id_of(c, role::DVR_SOURCE),
        })
        .collect();
    log_resolved("record", out.len());
    out
}

pub fn generate_descrambling(registry: &DeviceRegistry) -> Vec<DescramblingConnection> {
    let pools = vec![
        Pool::optional(role::FRONTEND, devices(registry.frontends.ids())),
        Pool::required(role::AV, pairs(registry)),
        Pool::required(role::DESCRAMBLER, devices(registry.descramblers.ids())),
        Pool::optional(role::BRIDGE, devices(registry.dvr_ids(DvrType::Playback))),
        Pool::optional(role::DVR_SOURCE, devices(registry.dvr_ids(DvrType::Playback))),
    ];
    let rules = [
        source_present(),
        single_source(),
        bridge_matches_frontend(registry),
        no_dvr_aliasing(),
    ];
    let out: Vec<_> = resolve(&pools, &rules)
        .iter()
        .map(|c| {
            let pair = pair_of(c);
            DescramblingConnection {
                frontend: id_of(c, role::FRONTEND),
                dvr_software_fe: id_of(c, role::BRIDGE),
                audio_filter: pair.audio,
                video_filter: pair.video,
                descrambler: id_of(c, role::DESCRAMBLER).unwrap_or_default(),
                dvr_source: id_of(c, role::DVR_SOURCE),
                extra_filters: Vec::new(),
            }
        })
        .collect();
    log_resolved("descrambling", out.len());
    out
}

pub fn generate_lnb_live(registry: &DeviceRegistry) -> Vec<LnbLiveConnection> {
    let pools = vec![
        Pool::required(role::FRONTEND, devices(registry.frontends.ids())),
        Pool::required(role::AV, pairs(registry)),
        Pool::required(role::LNB, devices(registry.lnbs.ids())),
    ];
    let rules = [satellite_frontend(registry)];
    let diseqc = registry.diseqc_messages.ids();
    let out: Vec<_> = resolve(&pools, &rules)
        .iter()
        .map(|c| {
            let pair = pair_of(c);
            LnbLiveConnection {
                frontend: id_of(c, role::FRONTEND).unwrap_or_default(),
                audio_filter: pair.audio,
                video_filter: pair.video,
                lnb: id_of(c, role::LNB).unwrap_or_default(),
                diseqc_messages: diseqc.clone(),
                extra_filters: Vec::new(),
            }
        })
        .collect();
    log_resolved("lnb live", out.len());
    out
}

pub fn generate_lnb_record(registry: &DeviceRegistry) -> Vec<LnbRecordConnection> {
    let pools = vec![
        Pool::required(role::FRONTEND, devices(registry.frontends.ids())),
        Pool::required(role::DVR_RECORD, devices(registry.dvr_ids(DvrType::Record))),
        Pool::required(role::RECORD_FILTER, devices(registry.filter_ids(FilterSubType::Record))),
        Pool::required(role::LNB, devices(registry.lnbs.ids())),
    ];
    let rules = [satellite_frontend(registry)];
    let diseqc = registry.diseqc_messages.ids();
    let out: Vec<_> = resolve(&pools, &rules)
        .iter()
        .map(|c| LnbRecordConnection {
            frontend: id_of(c, role::FRONTEND).unwrap_or_default(),
            dvr_record: id_of(c, role::DVR_RECORD).unwrap_or_default(),
            record_filter: id_of(c, role::RECORD_FILTER).unwrap_or_default(),
            lnb: id_of(c, role::LNB).unwrap_or_default(),
            diseqc_messages: diseqc.clone(),
        })
        .collect();
    log_resolved("lnb record", out.len());
    out
}

pub fn generate_time_filter(registry: &DeviceRegistry) -> Vec<TimeFilterConnection> {
    let pools = vec![Pool::required(role::TIME_FILTER, devices(registry.time_filters.ids()))];
    let out: Vec<_> = resolve(&pools, &[])
        .iter()
        .map(|c| TimeFilterConnection {
            time_filter: id_of(c, role::TIME_FILTER).unwrap_or_default(),
        })
        .collect();
    log_resolved("time filter", out.len());
    out
}

pub fn generate_lnb_descrambling(registry: &DeviceRegistry) -> Vec<LnbDescramblingConnection> {
    let pools = vec![
        Pool::required(role::FRONTEND, devices(registry.frontends.ids())),
        Pool::required(role::AV, pairs(registry)),
        Pool::required(role::LNB, devices(registry.lnbs.ids())),
        Pool::required(role::DESCRAMBLER, devices(registry.descramblers.ids())),
    ];
    let rules = [satellite_frontend(registry)];
    let diseqc = registry.diseqc_messages.ids();
    let out: Vec<_> = resolve(&pools, &rules)
        .iter()
        .map(|c| {
            let pair = pair_of(c);
            LnbDescramblingConnection {
                frontend: id_of(c, role::FRONTEND).unwrap_or_default(),
                audio_filter: pair.audio,
                video_filter: pair.video,
                lnb: id_of(c, role::LNB).unwrap_or_default(),
                descrambler: id_of(c, role::DESCRAMBLER).unwrap_or_default(),
                diseqc_messages: diseqc.clone(),
            }
        })
        .collect();
    log_resolved("lnb descrambling", out.len());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{
        DescramblerDescription, DvrDescription, FilterDescription, FrontendDescription,
        LnbDescription,
    };
    use tuner_hal_protocol::{FilterMainType, FrontendType};

    fn base_registry() -> DeviceRegistry {
        let mut r = DeviceRegistry::new();
        r.filters
            .insert(FilterDescription::new("A1", FilterMainType::Ts, FilterSubType::Audio))
            .unwrap();
        r.filters
            .insert(FilterDescription::new("V1", FilterMainType::Ts, FilterSubType::Video))
            .unwrap();
        r
    }

    #[test]
    fn test_software_frontend_without_bridge_yields_nothing() {
        let mut r = base_registry();
        r.frontends
            .insert(FrontendDescription::new("F1", FrontendType::Dvbt).software())
            .unwrap();
        assert!(generate_live(&r).is_empty());
    }

    #[test]
    fn test_hardware_frontend_gets_no_bridge() {
        let mut r = base_registry();
        r.frontends.insert(FrontendDescription::new("F1", FrontendType::Dvbt)).unwrap();
        r.dvrs.insert(DvrDescription::playback("P1", 1 << 16, "in.ts")).unwrap();
        let live = generate_live(&r);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].frontend, "F1");
        assert_eq!(live[0].audio_filter, "A1");
        assert_eq!(live[0].video_filter, "V1");
        assert_eq!(live[0].dvr_software_fe, None);
    }

    #[test]
    fn test_software_frontend_uses_each_bridge() {
        let mut r = base_registry();
        r.frontends
            .insert(FrontendDescription::new("F1", FrontendType::Dvbt).software())
            .unwrap();
        r.dvrs.insert(DvrDescription::playback("P1", 1 << 16, "a.ts")).unwrap();
        r.dvrs.insert(DvrDescription::playback("P2", 1 << 16, "b.ts")).unwrap();
        let bridges: Vec<_> = generate_live(&r)
            .into_iter()
            .map(|c| c.dvr_software_fe)
            .collect();
        assert_eq!(bridges, vec![Some("P1".to_string()), Some("P2".to_string())]);
    }

    #[test]
    fn test_record_needs_exactly_one_source() {
        let mut r = DeviceRegistry::new();
        r.frontends.insert(FrontendDescription::new("F1", FrontendType::Dvbt)).unwrap();
        r.dvrs.insert(DvrDescription::record("R1", 1 << 16)).unwrap();
        r.dvrs.insert(DvrDescription::playback("P1", 1 << 16, "a.ts")).unwrap();
        r.filters
            .insert(FilterDescription::new("REC", FilterMainType::Ts, FilterSubType::Record))
            .unwrap();
        let record = generate_record(&r);
        assert_eq!(record.len(), 2);
        for c in &record {
            assert!(c.frontend.is_some() != c.dvr_source.is_some());
            assert_eq!(c.dvr_software_fe, None);
        }
    }

    #[test]
    fn test_lnb_scenarios_need_satellite_frontend() {
        let mut r = base_registry();
        r.frontends.insert(FrontendDescription::new("T", FrontendType::Dvbt)).unwrap();
        r.frontends.insert(FrontendDescription::new("S", FrontendType::Dvbs)).unwrap();
        r.lnbs.insert(LnbDescription::new("L")).unwrap();
        r.descramblers.insert(DescramblerDescription::new("D", 0xb0)).unwrap();
        let lnb = generate_lnb_live(&r);
        assert_eq!(lnb.len(), 1);
        assert_eq!(lnb[0].frontend, "S");
        assert_eq!(generate_lnb_descrambling(&r).len(), 1);
    }

    #[test]
    fn test_pinned_connection_replaces_generation() {
        let mut r = base_registry();
        r.frontends.insert(FrontendDescription::new("F1", FrontendType::Dvbt)).unwrap();
        r.frontends.insert(FrontendDescription::new("F2", FrontendType::Dvbt)).unwrap();
        let pinned = PinnedConnections {
            scan: Some(ScanConnection { frontend: "F2".into() }),
            ..Default::default()
        };
        let resolved = ResolvedConnections::resolve(&r, &pinned);
        assert_eq!(resolved.scan, vec![ScanConnection { frontend: "F2".into() }]);
        assert_eq!(resolved.live.len(), 2);
    }
}
