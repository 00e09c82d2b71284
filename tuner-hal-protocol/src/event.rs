//! Filter event records delivered in indication batches.

use bytes::Bytes;

/// Scrambling state reported by a monitor event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScramblingStatus {
    Unknown,
    NotScrambled,
    Scrambled,
}

/// Monitor events enabled through the filter monitor mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    ScramblingStatus(ScramblingStatus),
    IpCid(i32),
}

/// Audio or video access unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaEvent {
    pub stream_id: u16,
    pub pts: Option<u64>,
    pub data_length: u64,
    pub offset: u64,
    pub mpu_sequence_number: u32,
    pub is_secure: bool,
    /// Copy of the payload bytes.
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionEvent {
    pub table_id: u16,
    pub version: u16,
    pub section_num: u16,
    pub data_length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PesEvent {
    pub stream_id: u16,
    pub data_length: u32,
    pub mpu_sequence_number: u32,
}

/// Index entry for a TS record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsRecordEvent {
    pub pid: u16,
    pub ts_index_mask: u32,
    pub sc_index_mask: u32,
    pub byte_number: u64,
    pub pts: u64,
    pub first_mb_in_slice: i32,
}

/// Index entry for an MMTP record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmtpRecordEvent {
    pub sc_hevc_index_mask: u32,
    pub byte_number: u64,
    pub pts: u64,
    pub first_mb_in_slice: i32,
    pub mpu_sequence_number: u32,
    pub ts_index_mask: u32,
}

/// One filter event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventRecord {
    Media(MediaEvent),
    Section(SectionEvent),
    Pes(PesEvent),
    TsRecord(TsRecordEvent),
    MmtpRecord(MmtpRecordEvent),
    Monitor(MonitorEvent),
    /// The filter restarted with a new configuration generation.
    StartId(i32),
}

/// Variant tag of an [`EventRecord`], used for counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventTag {
    Media,
    Section,
    Pes,
    TsRecord,
    MmtpRecord,
    Monitor,
    StartId,
}

impl EventRecord {
    pub fn tag(&self) -> EventTag {
        match self {
            EventRecord::Media(_) => EventTag::Media,
            EventRecord::Section(_) => EventTag::Section,
            EventRecord::Pes(_) => EventTag::Pes,
            EventRecord::TsRecord(_) => EventTag::TsRecord,
            EventRecord::MmtpRecord(_) => EventTag::MmtpRecord,
            EventRecord::Monitor(_) => EventTag::Monitor,
            EventRecord::StartId(_) => EventTag::StartId,
        }
    }

    /// Record index events carry the position of recorded data.
    pub fn is_record(&self) -> bool {
        matches!(self, EventRecord::TsRecord(_) | EventRecord::MmtpRecord(_))
    }

    /// Data-bearing events, as opposed to monitor and start id notices.
    pub fn is_output(&self) -> bool {
        !matches!(self, EventRecord::Monitor(_) | EventRecord::StartId(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notices_are_not_output() {
        let section = EventRecord::Section(SectionEvent { table_id: 0, version: 0, section_num: 0, data_length: 183 });
        assert!(section.is_output());
        assert!(!EventRecord::StartId(1).is_output());
        assert!(!EventRecord::Monitor(MonitorEvent::IpCid(7)).is_output());
    }
}
