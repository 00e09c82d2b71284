//! Referential integrity checks between resolved connections and the registry.

use std::fmt;

use thiserror::Error;
use tuner_hal_protocol::{DvrType, FilterSubType};

use crate::registry::{DeviceKind, DeviceRegistry};
use crate::topology::connections::ResolvedConnections;

/// One inconsistency found by [`validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    UnknownDevice { scenario: &'static str, kind: DeviceKind, id: String },
    WrongFilterType { scenario: &'static str, id: String, expected: FilterSubType },
    WrongDvrType { scenario: &'static str, id: String, expected: DvrType },
    UnpairedAvFilters { audio: usize, video: usize },
    MissingBridge { scenario: &'static str, frontend: String },
    UnexpectedBridge { scenario: &'static str, frontend: String },
    MissingSource { scenario: &'static str },
    AmbiguousSource { scenario: &'static str },
    AliasedDvr { scenario: &'static str, id: String },
    MissingInputFile { scenario: &'static str, id: String },
    NotSatellite { scenario: &'static str, frontend: String },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::UnknownDevice { scenario, kind, id } => {
                write!(f, "{scenario}: unknown {kind} {id:?}")
            }
            ValidationIssue::WrongFilterType { scenario, id, expected } => {
                write!(f, "{scenario}: filter {id:?} is not a {expected:?} filter")
            }
            ValidationIssue::WrongDvrType { scenario, id, expected } => {
                write!(f, "{scenario}: dvr {id:?} is not a {expected} dvr")
            }
            ValidationIssue::UnpairedAvFilters { audio, video } => {
                write!(f, "{audio} audio filter(s) but {video} video filter(s)")
            }
            ValidationIssue::MissingBridge { scenario, frontend } => {
                write!(f, "{scenario}: software frontend {frontend:?} has no dvr bridge")
            }
            ValidationIssue::UnexpectedBridge { scenario, frontend } => {
                write!(f, "{scenario}: hardware frontend {frontend:?} has a dvr bridge")
            }
            ValidationIssue::MissingSource { scenario } => {
                write!(f, "{scenario}: neither a frontend nor a dvr source")
            }
            ValidationIssue::AmbiguousSource { scenario } => {
                write!(f, "{scenario}: both a frontend and a dvr source")
            }
            ValidationIssue::AliasedDvr { scenario, id } => {
                write!(f, "{scenario}: dvr {id:?} is both bridge and data source")
            }
            ValidationIssue::MissingInputFile { scenario, id } => {
                write!(f, "{scenario}: playback dvr {id:?} has no input file")
            }
            ValidationIssue::NotSatellite { scenario, frontend } => {
                write!(f, "{scenario}: frontend {frontend:?} cannot drive an lnb")
            }
        }
    }
}

/// Every issue found in one validation pass.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid hardware topology: {}", .issues.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

struct Checker<'a> {
    registry: &'a DeviceRegistry,
    issues: Vec<ValidationIssue>,
}

impl<'a> Checker<'a> {
    fn exists(&mut self, scenario: &'static str, kind: DeviceKind, id: &str) -> bool {
        if self.registry.contains(kind, id) {
            true
        } else {
            self.push(ValidationIssue::UnknownDevice { scenario, kind, id: id.to_string() });
            false
        }
    }

    fn push(&mut self, issue: ValidationIssue) {
        if !self.issues.contains(&issue) {
            self.issues.push(issue);
        }
    }

    fn filter(&mut self, scenario: &'static str, id: &str, expected: FilterSubType) {
        if !self.exists(scenario, DeviceKind::Filter, id) {
            return;
        }
        if let Some(filter) = self.registry.filters.get(id) {
            if filter.sub_type != expected {
                self.push(ValidationIssue::WrongFilterType { scenario, id: id.to_string(), expected });
            }
        }
    }

    fn any_filter(&mut self, scenario: &'static str, id: &str) {
        self.exists(scenario, DeviceKind::Filter, id);
    }

    fn dvr(&mut self, scenario: &'static str, id: &str, expected: DvrType) {
        if !self.exists(scenario, DeviceKind::Dvr, id) {
            return;
        }
        if let Some(dvr) = self.registry.dvrs.get(id) {
            if dvr.dvr_type != expected {
                self.push(ValidationIssue::WrongDvrType { scenario, id: id.to_string(), expected });
            } else if expected == DvrType::Playback && dvr.input_file.is_none() {
                self.push(ValidationIssue::MissingInputFile { scenario, id: id.to_string() });
            }
        }
    }

    fn frontend(&mut self, scenario: &'static str, id: &str, bridge: Option<&str>) {
        if !self.exists(scenario, DeviceKind::Frontend, id) {
            return;
        }
        let software = self.registry.is_software_frontend(id);
        match (software, bridge) {
            (true, None) => {
                self.push(ValidationIssue::MissingBridge { scenario, frontend: id.to_string() })
            }
            (false, Some(_)) => {
                self.push(ValidationIssue::UnexpectedBridge { scenario, frontend: id.to_string() })
            }
            _ => {}
        }
        if let Some(bridge) = bridge {
            self.dvr(scenario, bridge, DvrType::Playback);
        }
    }

    fn satellite(&mut self, scenario: &'static str, id: &str) {
        self.frontend(scenario, id, None);
        if self.registry.frontends.contains(id) && !self.registry.is_satellite_frontend(id) {
            self.push(ValidationIssue::NotSatellite { scenario, frontend: id.to_string() });
        }
    }

    fn source(
        &mut self,
        scenario: &'static str,
        frontend: Option<&str>,
        bridge: Option<&str>,
        dvr_source: Option<&str>,
    ) {
        match (frontend, dvr_source) {
            (None, None) => self.push(ValidationIssue::MissingSource { scenario }),
            (Some(_), Some(_)) => self.push(ValidationIssue::AmbiguousSource { scenario }),
            _ => {}
        }
        if let Some(frontend) = frontend {
            self.frontend(scenario, frontend, bridge);
        }
        if let Some(source) = dvr_source {
            self.dvr(scenario, source, DvrType::Playback);
            if bridge == Some(source) {
                self.push(ValidationIssue::AliasedDvr { scenario, id: source.to_string() });
            }
        }
    }

    fn diseqc(&mut self, scenario: &'static str, names: &[String]) {
        for name in names {
            self.exists(scenario, DeviceKind::DiseqcMessage, name);
        }
    }
}

/// Check every resolved connection against the registry.
///
/// Idempotent: the registry and connections are only read.
pub fn validate(
    connections: &ResolvedConnections,
    registry: &DeviceRegistry,
) -> Result<(), ValidationError> {
    let mut c = Checker { registry, issues: Vec::new() };

    let audio = registry.filter_ids(FilterSubType::Audio).len();
    let video = registry.filter_ids(FilterSubType::Video).len();
    if audio != video {
        c.push(ValidationIssue::UnpairedAvFilters { audio, video });
    }

    for live in &connections.live {
        c.frontend("live", &live.frontend, live.dvr_software_fe.as_deref());
        c.filter("live", &live.audio_filter, FilterSubType::Audio);
        c.filter("live", &live.video_filter, FilterSubType::Video);
        if let Some(id) = &live.section_filter {
            c.filter("live", id, FilterSubType::Section);
        }
        if let Some(id) = &live.ip_filter {
            c.filter("live", id, FilterSubType::IpPayload);
        }
        if let Some(id) = &live.pcr_filter {
            c.filter("live", id, FilterSubType::Pcr);
        }
        for id in &live.extra_filters {
            c.any_filter("live", id);
        }
    }
    for scan in &connections.scan {
        c.exists("scan", DeviceKind::Frontend, &scan.frontend);
    }
    for playback in &connections.playback {
        c.dvr("playback", &playback.dvr, DvrType::Playback);
        c.filter("playback", &playback.audio_filter, FilterSubType::Audio);
        c.filter("playback", &playback.video_filter, FilterSubType::Video);
        if let Some(id) = &playback.section_filter {
            c.filter("playback", id, FilterSubType::Section);
        }
        for id in &playback.extra_filters {
            c.any_filter("playback", id);
        }
    }
    for record in &connections.record {
        c.source(
            "record",
            record.frontend.as_deref(),
            record.dvr_software_fe.as_deref(),
            record.dvr_source.as_deref(),
        );
        c.dvr("record", &record.dvr_record, DvrType::Record);
        c.filter("record", &record.record_filter, FilterSubType::Record);
    }
    for d in &connections.descrambling {
        c.source(
            "descrambling",
            d.frontend.as_deref(),
            d.dvr_software_fe.as_deref(),
            d.dvr_source.as_deref(),
        );
        c.filter("descrambling", &d.audio_filter, FilterSubType::Audio);
        c.filter("descrambling", &d.video_filter, FilterSubType::Video);
        c.exists("descrambling", DeviceKind::Descrambler, &d.descrambler);
        for id in &d.extra_filters {
            c.any_filter("descrambling", id);
        }
    }
    for lnb in &connections.lnb_live {
        c.satellite("lnb live", &lnb.frontend);
        c.filter("lnb live", &lnb.audio_filter, FilterSubType::Audio);
        c.filter("lnb live", &lnb.video_filter, FilterSubType::Video);
        c.exists("lnb live", DeviceKind::Lnb, &lnb.lnb);
        c.diseqc("lnb live", &lnb.diseqc_messages);
        for id in &lnb.extra_filters {
            c.any_filter("lnb live", id);
        }
    }
    for lnb in &connections.lnb_record {
        c.satellite("lnb record", &lnb.frontend);
        c.dvr("lnb record", &lnb.dvr_record, DvrType::Record);
        c.filter("lnb record", &lnb.record_filter, FilterSubType::Record);
        c.exists("lnb record", DeviceKind::Lnb, &lnb.lnb);
        c.diseqc("lnb record", &lnb.diseqc_messages);
    }
    for tf in &connections.time_filter {
        c.exists("time filter", DeviceKind::TimeFilter, &tf.time_filter);
    }
    for d in &connections.lnb_descrambling {
        c.satellite("lnb descrambling", &d.frontend);
        c.filter("lnb descrambling", &d.audio_filter, FilterSubType::Audio);
        c.filter("lnb descrambling", &d.video_filter, FilterSubType::Video);
        c.exists("lnb descrambling", DeviceKind::Lnb, &d.lnb);
        c.exists("lnb descrambling", DeviceKind::Descrambler, &d.descrambler);
        c.diseqc("lnb descrambling", &d.diseqc_messages);
    }

    if c.issues.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { issues: c.issues })
    }
}

/// Boolean verdict of [`validate`].
pub fn is_valid(connections: &ResolvedConnections, registry: &DeviceRegistry) -> bool {
    validate(connections, registry).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DvrDescription, FilterDescription, FrontendDescription};
    use crate::topology::connections::{LiveConnection, PinnedConnections, RecordConnection};
    use tuner_hal_protocol::{FilterMainType, FrontendType};

    fn registry() -> DeviceRegistry {
        let mut r = DeviceRegistry::new();
        r.frontends.insert(FrontendDescription::new("F1", FrontendType::Dvbt)).unwrap();
        r.filters
            .insert(FilterDescription::new("A1", FilterMainType::Ts, FilterSubType::Audio))
            .unwrap();
        r.filters
            .insert(FilterDescription::new("V1", FilterMainType::Ts, FilterSubType::Video))
            .unwrap();
        r.dvrs.insert(DvrDescription::playback("P1", 1 << 16, "in.ts")).unwrap();
        r.dvrs.insert(DvrDescription::record("R1", 1 << 16)).unwrap();
        r
    }

    fn live(frontend: &str) -> LiveConnection {
        LiveConnection {
            frontend: frontend.into(),
            dvr_software_fe: None,
            audio_filter: "A1".into(),
            video_filter: "V1".into(),
            section_filter: None,
            ip_filter: None,
            pcr_filter: None,
            extra_filters: Vec::new(),
        }
    }

    #[test]
    fn test_generated_topology_is_valid() {
        let r = registry();
        let resolved = ResolvedConnections::resolve(&r, &PinnedConnections::default());
        assert!(is_valid(&resolved, &r));
    }

    #[test]
    fn test_unknown_reference_is_reported() {
        let r = registry();
        let connections = ResolvedConnections { live: vec![live("F9")], ..Default::default() };
        let err = validate(&connections, &r).unwrap_err();
        assert_eq!(
            err.issues,
            vec![ValidationIssue::UnknownDevice {
                scenario: "live",
                kind: DeviceKind::Frontend,
                id: "F9".into()
            }]
        );
    }

    #[test]
    fn test_validation_is_idempotent() {
        let r = registry();
        let connections = ResolvedConnections { live: vec![live("F9")], ..Default::default() };
        assert_eq!(validate(&connections, &r), validate(&connections, &r));
    }

    #[test]
    fn test_unpaired_av_filters() {
        let mut r = registry();
        r.filters
            .insert(FilterDescription::new("A2", FilterMainType::Ts, FilterSubType::Audio))
            .unwrap();
        let err = validate(&ResolvedConnections::default(), &r).unwrap_err();
        assert!(err.issues.contains(&ValidationIssue::UnpairedAvFilters { audio: 2, video: 1 }));
    }

    #[test]
    fn test_record_source_rules() {
        let r = registry();
        let neither = RecordConnection {
            frontend: None,
            dvr_software_fe: None,
            dvr_record: "R1".into(),
            record_filter: "A1".into(),
            dvr_source: None,
        };
        let err = validate(
            &ResolvedConnections { record: vec![neither], ..Default::default() },
            &r,
        )
        .unwrap_err();
        assert!(err.issues.contains(&ValidationIssue::MissingSource { scenario: "record" }));
        assert!(err.issues.contains(&ValidationIssue::WrongFilterType {
            scenario: "record",
            id: "A1".into(),
            expected: FilterSubType::Record
        }));
    }

    #[test]
    fn test_wrong_dvr_direction() {
        let r = registry();
        let mut connection = live("F1");
        connection.dvr_software_fe = Some("R1".into());
        let err = validate(
            &ResolvedConnections { live: vec![connection], ..Default::default() },
            &r,
        )
        .unwrap_err();
        assert!(err.issues.contains(&ValidationIssue::WrongDvrType {
            scenario: "live",
            id: "R1".into(),
            expected: DvrType::Playback
        }));
    }
}
