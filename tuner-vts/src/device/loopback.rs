//! In-process reference device.
//!
//! Behaves like the default tuner HAL: hardware frontends synthesize TS
//! packets while tuned, playback dvrs consume their queue and feed the demux,
//! filters turn matching packets into events and record dvrs receive the
//! packets of their attached filters. Replies and indications reach the
//! listener in submission order on a single dispatcher thread.
//!
//! Frontends are told apart by type only, so a type listed as software never
//! synthesizes packets.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use tuner_hal_protocol::{
    monitor, notify, CorrelationToken, DemuxCapabilities, DeviceMessage, DvrSettings, DvrType,
    EventRecord, FilterMainType, FilterSettings, FilterSubType, FilterType, FrontendEvent,
    FrontendStatus, FrontendStatusType, FrontendType, Handle, Indication, LnbEvent, LnbPosition,
    LnbTone, LnbVoltage, MediaEvent, MmtpRecordEvent, MonitorEvent, PesEvent, PlaybackStatus,
    RecordStatus, Reply, Request, Response, ResultCode, ScanMessage, ScanType, ScramblingStatus,
    SectionEvent, StreamQueue, TransportError, TsRecordEvent, TS_PACKET_SIZE,
};

use super::{DeviceControl, DeviceListener};
use crate::registry::DeviceRegistry;

const FEED_INTERVAL: Duration = Duration::from_millis(10);
const CONSUMER_WAIT: Duration = Duration::from_millis(20);
const CONSUMER_BATCH_PACKETS: usize = 64;
const PTS_STEP: u64 = 3003;

const MAX_DEMUX: u32 = 4;
const MAX_RECORD: u32 = 2;
const MAX_PLAYBACK: u32 = 2;
/// IP filters may feed MMTP filters.
const LINK_CAPS: [u32; 5] = [0x00, 0x00, 0x02, 0x00, 0x00];

/// Static capabilities of a loopback device.
#[derive(Debug, Clone)]
pub struct LoopbackInventory {
    /// Frontend types fed from a playback dvr instead of the air.
    pub software_frontends: HashSet<FrontendType>,
    pub lnb_count: u32,
    pub lnb_names: Vec<String>,
    /// CAS systems a session can be opened for.
    pub cas_system_ids: Vec<i32>,
    /// CI-CAMs a frontend output can be linked through.
    pub ci_cam_ids: Vec<i32>,
    pub time_filter: bool,
}

impl Default for LoopbackInventory {
    fn default() -> Self {
        Self {
            software_frontends: HashSet::new(),
            lnb_count: 1,
            lnb_names: Vec::new(),
            cas_system_ids: Vec::new(),
            ci_cam_ids: Vec::new(),
            time_filter: true,
        }
    }
}

impl LoopbackInventory {
    /// Provide exactly what the registry describes.
    pub fn from_registry(registry: &DeviceRegistry) -> Self {
        Self {
            software_frontends: registry
                .frontends
                .iter()
                .filter(|f| f.is_software)
                .map(|f| f.frontend_type)
                .collect(),
            lnb_count: registry.lnbs.len() as u32,
            lnb_names: registry.lnbs.iter().filter_map(|l| l.name.clone()).collect(),
            cas_system_ids: registry.descramblers.iter().map(|d| d.cas_system_id).collect(),
            ci_cam_ids: registry
                .frontends
                .iter()
                .filter(|f| f.can_connect_to_cicam)
                .filter_map(|f| f.cicam_id)
                .collect(),
            time_filter: true,
        }
    }
}

struct Worker {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl Worker {
    fn spawn<F>(name: &str, body: F) -> io::Result<Self>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(flag))?;
        Ok(Self { stop, thread })
    }

    fn join(self) {
        self.stop.store(true, Ordering::Release);
        if self.thread.thread().id() == thread::current().id() {
            return;
        }
        if self.thread.join().is_err() {
            error!("[Loopback] worker thread panicked");
        }
    }
}

struct FrontendEntry {
    frontend_type: FrontendType,
    software: bool,
    tuned: bool,
    lnb: Option<Handle>,
    ci_cam: Option<i32>,
    feeder: Option<Worker>,
}

struct DemuxEntry {
    source: Option<Handle>,
}

struct FilterEntry {
    demux: Handle,
    filter_type: FilterType,
    settings: FilterSettings,
    configured: u32,
    started: bool,
    start_id: i32,
    monitor_mask: u32,
    monitor_sent: bool,
    ip_cid: Option<i32>,
    /// Upstream filter; `None` reads from the demux.
    data_source: Option<Handle>,
    offset: u64,
    pts: u64,
    sections: u32,
}

impl FilterEntry {
    fn matches(&self, packet: &[u8]) -> bool {
        self.settings.pid.map_or(true, |pid| packet_pid(packet) == pid)
    }

    /// Events for one batch of matching packets.
    fn events_for(&mut self, matched: &[&[u8]]) -> Vec<EventRecord> {
        let len = matched.len() * TS_PACKET_SIZE;
        let pid = packet_pid(matched[0]);
        let mut events = Vec::new();
        match (self.filter_type.main, self.filter_type.sub) {
            (_, FilterSubType::Audio | FilterSubType::Video) => {
                let mut data = BytesMut::with_capacity(len);
                for packet in matched {
                    data.extend_from_slice(packet);
                }
                events.push(EventRecord::Media(MediaEvent {
                    stream_id: pid,
                    pts: Some(self.pts),
                    data_length: len as u64,
                    offset: self.offset,
                    mpu_sequence_number: 0,
                    is_secure: false,
                    data: data.freeze(),
                }));
            }
            (_, FilterSubType::Section) => {
                for packet in matched {
                    events.push(EventRecord::Section(SectionEvent {
                        table_id: u16::from(packet[5]),
                        version: u16::from((packet[10] >> 1) & 0x1f),
                        section_num: (self.sections & 0xffff) as u16,
                        data_length: (TS_PACKET_SIZE - 5) as u32,
                    }));
                    self.sections = self.sections.wrapping_add(1);
                }
            }
            (_, FilterSubType::Pes) => events.push(EventRecord::Pes(PesEvent {
                stream_id: pid,
                data_length: len as u32,
                mpu_sequence_number: 0,
            })),
            (FilterMainType::Mmtp, _) => events.push(EventRecord::MmtpRecord(MmtpRecordEvent {
                sc_hevc_index_mask: 0,
                byte_number: self.offset,
                pts: self.pts,
                first_mb_in_slice: 0,
                mpu_sequence_number: 0,
                ts_index_mask: 0,
            })),
            _ => {
                for (i, packet) in matched.iter().enumerate() {
                    events.push(EventRecord::TsRecord(TsRecordEvent {
                        pid: packet_pid(packet),
                        ts_index_mask: u32::from(packet[1] & 0x40 != 0),
                        sc_index_mask: 0,
                        byte_number: self.offset + (i * TS_PACKET_SIZE) as u64,
                        pts: self.pts,
                        first_mb_in_slice: 0,
                    }));
                }
            }
        }
        self.offset += len as u64;
        self.pts += PTS_STEP;
        events
    }
}

struct DvrEntry {
    demux: Handle,
    dvr_type: DvrType,
    queue: Arc<StreamQueue>,
    settings: Option<DvrSettings>,
    attached: HashSet<Handle>,
    started: bool,
    record_status: RecordStatus,
    overflowed: bool,
    consumer: Option<Worker>,
}

#[derive(Default)]
struct LnbEntry {
    voltage: LnbVoltage,
    tone: LnbTone,
    position: LnbPosition,
}

#[derive(Default)]
struct DescramblerEntry {
    demux: Option<Handle>,
    key_token: Option<Vec<u8>>,
    pids: Vec<u16>,
}

struct TimeFilterEntry {
    demux: Handle,
    time_stamp: Option<(u64, Instant)>,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    frontends: HashMap<Handle, FrontendEntry>,
    demuxes: HashMap<Handle, DemuxEntry>,
    filters: HashMap<Handle, FilterEntry>,
    dvrs: HashMap<Handle, DvrEntry>,
    lnbs: HashMap<Handle, LnbEntry>,
    descramblers: HashMap<Handle, DescramblerEntry>,
    time_filters: HashMap<Handle, TimeFilterEntry>,
    cas_sessions: u32,
}

impl State {
    fn allocate(&mut self) -> Handle {
        self.next_handle += 1;
        Handle(self.next_handle)
    }

    fn take_workers(&mut self) -> Vec<Worker> {
        let feeders = self.frontends.values_mut().filter_map(|f| f.feeder.take());
        let consumers = self.dvrs.values_mut().filter_map(|d| d.consumer.take());
        feeders.chain(consumers).collect()
    }

    /// Lowest PCR filter of `demux`, the clock every media filter syncs to.
    fn pcr_filter(&self, demux: Handle) -> Option<Handle> {
        self.filters
            .iter()
            .filter(|(_, f)| f.demux == demux && f.filter_type.sub == FilterSubType::Pcr)
            .map(|(h, _)| *h)
            .min()
    }

    fn is_scrambled(&self, filter: &FilterEntry) -> bool {
        let Some(pid) = filter.settings.pid else {
            return false;
        };
        self.descramblers
            .values()
            .any(|d| d.demux == Some(filter.demux) && d.key_token.is_some() && d.pids.contains(&pid))
    }

    /// Monitor events owed to `filter`, sent once per configuration.
    fn monitor_events(&mut self, filter: Handle) -> Vec<Indication> {
        let scrambled = match self.filters.get(&filter) {
            Some(entry) => self.is_scrambled(entry),
            None => return Vec::new(),
        };
        let Some(entry) = self.filters.get_mut(&filter) else {
            return Vec::new();
        };
        if !entry.started || entry.monitor_mask == 0 || entry.monitor_sent {
            return Vec::new();
        }
        entry.monitor_sent = true;

        let mut events = Vec::new();
        if entry.monitor_mask & monitor::SCRAMBLING_STATUS != 0 {
            let status = if scrambled {
                ScramblingStatus::Scrambled
            } else {
                ScramblingStatus::NotScrambled
            };
            events.push(EventRecord::Monitor(MonitorEvent::ScramblingStatus(status)));
        }
        if entry.monitor_mask & monitor::IP_CID_CHANGE != 0 {
            if let Some(cid) = entry.ip_cid {
                events.push(EventRecord::Monitor(MonitorEvent::IpCid(cid)));
            }
        }
        if events.is_empty() {
            Vec::new()
        } else {
            vec![Indication::FilterEvents { filter, events }]
        }
    }

    /// One packet per pid selected by a started filter of `demux`.
    fn synthesize(&self, demux: Handle, continuity: u8) -> Vec<u8> {
        let pids: BTreeSet<u16> = self
            .filters
            .values()
            .filter(|f| f.demux == demux && f.started)
            .map(|f| f.settings.pid.unwrap_or(0))
            .collect();
        let mut data = Vec::with_capacity(pids.len() * TS_PACKET_SIZE);
        for pid in pids {
            data.extend_from_slice(&ts_packet(pid, continuity));
        }
        data
    }

    /// Route whole packets arriving at `demux` to its filters and record dvrs.
    fn deliver(&mut self, demux: Handle, data: &[u8]) -> Vec<Indication> {
        let packets: Vec<&[u8]> = data.chunks_exact(TS_PACKET_SIZE).collect();
        let mut out = Vec::new();

        for (&handle, filter) in self.filters.iter_mut() {
            if filter.demux != demux || !filter.started || filter.data_source.is_some() {
                continue;
            }
            let matched: Vec<&[u8]> = packets.iter().copied().filter(|p| filter.matches(p)).collect();
            if matched.is_empty() {
                continue;
            }
            let events = filter.events_for(&matched);
            out.push(Indication::FilterEvents { filter: handle, events });
        }

        for (&handle, dvr) in self.dvrs.iter_mut() {
            if dvr.demux != demux || dvr.dvr_type != DvrType::Record || !dvr.started || dvr.overflowed {
                continue;
            }
            let Some(settings) = dvr.settings else {
                continue;
            };
            let attached: Vec<&FilterEntry> = dvr
                .attached
                .iter()
                .filter_map(|h| self.filters.get(h))
                .filter(|f| f.started)
                .collect();
            let selected: Vec<u8> = packets
                .iter()
                .filter(|p| attached.iter().any(|f| f.matches(p)))
                .flat_map(|p| p.iter().copied())
                .collect();
            if selected.is_empty() {
                continue;
            }

            let written = dvr.queue.write(&selected);
            let status = if written < selected.len() {
                RecordStatus::Overflow
            } else {
                RecordStatus::from_occupancy(
                    dvr.queue.available_to_write(),
                    dvr.queue.available_to_read(),
                    &settings,
                    dvr.record_status,
                )
            };
            if status == RecordStatus::Overflow {
                warn!("[Loopback] record dvr {} overflowed, holding output until flushed", handle);
                dvr.overflowed = true;
            }
            if status != dvr.record_status {
                dvr.record_status = status;
                out.push(Indication::RecordStatus { dvr: handle, status });
            }
        }
        out
    }
}

/// Outcome of one request.
struct Handled {
    code: ResultCode,
    response: Response,
    indications: Vec<Indication>,
    retired: Vec<Worker>,
}

impl Handled {
    fn ok(response: Response) -> Self {
        Self { code: ResultCode::Success, response, indications: Vec::new(), retired: Vec::new() }
    }

    fn ack() -> Self {
        Self::ok(Response::Ack)
    }

    fn opened(handle: Handle) -> Self {
        Self::ok(Response::Opened { handle })
    }

    fn fail(code: ResultCode) -> Self {
        Self { code, response: Response::Ack, indications: Vec::new(), retired: Vec::new() }
    }

    fn with(mut self, indications: impl IntoIterator<Item = Indication>) -> Self {
        self.indications.extend(indications);
        self
    }

    fn retire(mut self, workers: impl IntoIterator<Item = Worker>) -> Self {
        self.retired.extend(workers);
        self
    }
}

enum Dispatch {
    Message(DeviceMessage),
    Shutdown,
}

struct Inner {
    inventory: LoopbackInventory,
    state: Mutex<State>,
    outbox: Sender<Dispatch>,
    closed: AtomicBool,
}

impl Inner {
    fn send(&self, message: DeviceMessage) {
        if self.outbox.send(Dispatch::Message(message)).is_err() {
            trace!("[Loopback] dispatcher gone, message dropped");
        }
    }

    fn emit(&self, indications: Vec<Indication>) {
        for indication in indications {
            self.send(DeviceMessage::Indication(indication));
        }
    }

    fn deliver(&self, demux: Handle, data: &[u8]) {
        let indications = self.state.lock().deliver(demux, data);
        self.emit(indications);
    }

    fn pump(&self, frontend: Handle, continuity: u8) {
        let indications = {
            let mut state = self.state.lock();
            let demuxes: Vec<Handle> = state
                .demuxes
                .iter()
                .filter(|(_, d)| d.source == Some(frontend))
                .map(|(h, _)| *h)
                .collect();
            let mut out = Vec::new();
            for demux in demuxes {
                let packets = state.synthesize(demux, continuity);
                if !packets.is_empty() {
                    out.extend(state.deliver(demux, &packets));
                }
            }
            out
        };
        self.emit(indications);
    }

    fn spawn_feeder(self: &Arc<Self>, frontend: Handle) -> io::Result<Worker> {
        let inner = Arc::clone(self);
        Worker::spawn("loopback-frontend", move |stop| {
            let mut continuity = 0u8;
            while !stop.load(Ordering::Acquire) {
                inner.pump(frontend, continuity);
                continuity = (continuity + 1) & 0x0f;
                thread::sleep(FEED_INTERVAL);
            }
        })
    }

    fn spawn_consumer(
        self: &Arc<Self>,
        dvr: Handle,
        demux: Handle,
        queue: Arc<StreamQueue>,
        settings: DvrSettings,
    ) -> io::Result<Worker> {
        let inner = Arc::clone(self);
        Worker::spawn("loopback-playback", move |stop| {
            let mut buf = vec![0u8; TS_PACKET_SIZE * CONSUMER_BATCH_PACKETS];
            let mut status = PlaybackStatus::SpaceEmpty;
            while !stop.load(Ordering::Acquire) {
                // Timeouts fall through so stop is observed.
                queue.flag().wait(notify::DATA_READY, CONSUMER_WAIT, true).ok();
                let whole = queue.available_to_read() / TS_PACKET_SIZE * TS_PACKET_SIZE;
                if whole > 0 {
                    let take = whole.min(buf.len());
                    let n = queue.read(&mut buf[..take]);
                    inner.deliver(demux, &buf[..n]);
                }
                let next = PlaybackStatus::from_occupancy(
                    queue.available_to_write(),
                    queue.available_to_read(),
                    &settings,
                    status,
                );
                if next != status {
                    status = next;
                    inner.emit(vec![Indication::PlaybackStatus { dvr, status }]);
                }
            }
        })
    }

    fn handle(self: &Arc<Self>, request: Request) -> Handled {
        use ResultCode::*;

        let mut state = self.state.lock();
        match request {
            Request::OpenFrontend { frontend_type } => {
                let handle = state.allocate();
                let software = self.inventory.software_frontends.contains(&frontend_type);
                state.frontends.insert(
                    handle,
                    FrontendEntry { frontend_type, software, tuned: false, lnb: None, ci_cam: None, feeder: None },
                );
                Handled::opened(handle)
            }
            Request::CloseFrontend { frontend } => match state.frontends.remove(&frontend) {
                Some(entry) => Handled::ack().retire(entry.feeder),
                None => Handled::fail(InvalidArgument),
            },
            Request::Tune { frontend, settings } => {
                let Some(entry) = state.frontends.get_mut(&frontend) else {
                    return Handled::fail(InvalidArgument);
                };
                if settings.frontend_type != entry.frontend_type {
                    return Handled::fail(InvalidArgument);
                }
                let previous = entry.feeder.take();
                entry.tuned = true;
                if !entry.software {
                    match self.spawn_feeder(frontend) {
                        Ok(worker) => entry.feeder = Some(worker),
                        Err(e) => {
                            error!("[Loopback] failed to start feeder: {}", e);
                            return Handled::fail(UnknownError).retire(previous);
                        }
                    }
                }
                debug!("[Loopback] frontend {} tuned to {} kHz", frontend, settings.frequency_khz);
                Handled::ack()
                    .retire(previous)
                    .with([Indication::Frontend { frontend, event: FrontendEvent::Locked }])
            }
            Request::StopTune { frontend } => match state.frontends.get_mut(&frontend) {
                Some(entry) => {
                    entry.tuned = false;
                    Handled::ack().retire(entry.feeder.take())
                }
                None => Handled::fail(InvalidArgument),
            },
            Request::Scan { frontend, settings, scan_type } => {
                let Some(entry) = state.frontends.get(&frontend) else {
                    return Handled::fail(InvalidArgument);
                };
                if settings.frontend_type != entry.frontend_type {
                    return Handled::fail(InvalidArgument);
                }
                let mut frequencies = vec![settings.frequency_khz];
                if let (ScanType::Blind, Some(end)) = (scan_type, settings.end_frequency_khz) {
                    if end > settings.frequency_khz {
                        frequencies.push(end);
                    }
                }
                let messages = [
                    ScanMessage::Locked(true),
                    ScanMessage::Frequencies(frequencies),
                    ScanMessage::ProgressPercent(100),
                    ScanMessage::End(true),
                ];
                Handled::ack().with(messages.into_iter().map(|message| Indication::Scan { frontend, message }))
            }
            Request::StopScan { frontend } => {
                if state.frontends.contains_key(&frontend) {
                    Handled::ack()
                } else {
                    Handled::fail(InvalidArgument)
                }
            }
            Request::GetFrontendStatus { frontend, types } => {
                let Some(entry) = state.frontends.get(&frontend) else {
                    return Handled::fail(InvalidArgument);
                };
                let statuses = types
                    .iter()
                    .map(|t| match t {
                        FrontendStatusType::DemodLock => FrontendStatus::DemodLocked(entry.tuned),
                        FrontendStatusType::Snr => FrontendStatus::Snr(if entry.tuned { 25 } else { 0 }),
                        FrontendStatusType::Ber => FrontendStatus::Ber(0),
                        FrontendStatusType::SignalStrength => {
                            FrontendStatus::SignalStrength(if entry.tuned { 80 } else { 0 })
                        }
                        FrontendStatusType::Uec => FrontendStatus::Uec(0),
                        FrontendStatusType::IsMiso => FrontendStatus::IsMiso(false),
                    })
                    .collect();
                Handled::ok(Response::FrontendStatus { statuses })
            }
            Request::SetLnb { frontend, lnb } => {
                if !state.lnbs.contains_key(&lnb) {
                    return Handled::fail(InvalidArgument);
                }
                match state.frontends.get_mut(&frontend) {
                    Some(entry) => {
                        entry.lnb = Some(lnb);
                        Handled::ack()
                    }
                    None => Handled::fail(InvalidArgument),
                }
            }
            Request::LinkCiCam { frontend, ci_cam_id } => {
                if !self.inventory.ci_cam_ids.contains(&ci_cam_id) {
                    return Handled::fail(Unavailable);
                }
                match state.frontends.get_mut(&frontend) {
                    Some(entry) => {
                        entry.ci_cam = Some(ci_cam_id);
                        Handled::ok(Response::LtsId(0))
                    }
                    None => Handled::fail(InvalidArgument),
                }
            }
            Request::UnlinkCiCam { frontend, ci_cam_id } => match state.frontends.get_mut(&frontend) {
                Some(entry) if entry.ci_cam == Some(ci_cam_id) => {
                    entry.ci_cam = None;
                    Handled::ack()
                }
                Some(_) => Handled::fail(InvalidState),
                None => Handled::fail(InvalidArgument),
            },
            Request::RemoveOutputPid { frontend, pid } => {
                if !state.frontends.contains_key(&frontend) {
                    return Handled::fail(InvalidArgument);
                }
                trace!("[Loopback] no output pid {} to remove on {}", pid, frontend);
                Handled::fail(Unavailable)
            }

            Request::OpenDemux => {
                if state.demuxes.len() as u32 >= MAX_DEMUX {
                    return Handled::fail(Unavailable);
                }
                let handle = state.allocate();
                state.demuxes.insert(handle, DemuxEntry { source: None });
                Handled::opened(handle)
            }
            Request::CloseDemux { demux } => {
                if state.demuxes.remove(&demux).is_none() {
                    return Handled::fail(InvalidArgument);
                }
                state.filters.retain(|_, f| f.demux != demux);
                state.time_filters.retain(|_, t| t.demux != demux);
                let dvrs: Vec<Handle> =
                    state.dvrs.iter().filter(|(_, d)| d.demux == demux).map(|(h, _)| *h).collect();
                let retired: Vec<Worker> = dvrs
                    .into_iter()
                    .filter_map(|h| state.dvrs.remove(&h).and_then(|d| d.consumer))
                    .collect();
                Handled::ack().retire(retired)
            }
            Request::SetDataSource { demux, frontend } => {
                if !state.frontends.contains_key(&frontend) {
                    return Handled::fail(InvalidArgument);
                }
                match state.demuxes.get_mut(&demux) {
                    Some(entry) => {
                        entry.source = Some(frontend);
                        Handled::ack()
                    }
                    None => Handled::fail(InvalidArgument),
                }
            }
            Request::GetDemuxCaps => Handled::ok(Response::DemuxCaps(DemuxCapabilities {
                num_demux: MAX_DEMUX,
                num_record: MAX_RECORD,
                num_playback: MAX_PLAYBACK,
                has_time_filter: self.inventory.time_filter,
                link_caps: LINK_CAPS,
            })),
            Request::GetAvSyncHwId { demux, filter } => {
                let Some(entry) = state.filters.get(&filter) else {
                    return Handled::fail(InvalidArgument);
                };
                if entry.demux != demux || !matches!(entry.filter_type.sub, FilterSubType::Audio | FilterSubType::Video) {
                    return Handled::fail(InvalidState);
                }
                match state.pcr_filter(demux) {
                    Some(pcr) => Handled::ok(Response::AvSyncHwId(pcr)),
                    None => Handled::fail(InvalidState),
                }
            }
            Request::GetAvSyncTime { demux, av_sync_hw_id } => match state.pcr_filter(demux) {
                Some(pcr) if pcr == av_sync_hw_id => {
                    let pts = state.filters.get(&pcr).map_or(0, |f| f.pts);
                    Handled::ok(Response::AvSyncTime(pts as i64))
                }
                Some(_) => Handled::fail(InvalidArgument),
                None => Handled::fail(InvalidState),
            },

            Request::OpenFilter { demux, filter_type, buffer_size } => {
                if !state.demuxes.contains_key(&demux) || buffer_size == 0 {
                    return Handled::fail(InvalidArgument);
                }
                let handle = state.allocate();
                state.filters.insert(
                    handle,
                    FilterEntry {
                        demux,
                        filter_type,
                        settings: FilterSettings::default(),
                        configured: 0,
                        started: false,
                        start_id: 0,
                        monitor_mask: 0,
                        monitor_sent: false,
                        ip_cid: None,
                        data_source: None,
                        offset: 0,
                        pts: 0,
                        sections: 0,
                    },
                );
                Handled::opened(handle)
            }
            Request::ConfigureFilter { filter, settings } => match state.filters.get_mut(&filter) {
                Some(entry) => {
                    entry.settings = settings;
                    entry.configured += 1;
                    Handled::ack()
                }
                None => Handled::fail(InvalidArgument),
            },
            Request::ConfigureMonitorEvent { filter, event_types } => {
                let Some(entry) = state.filters.get_mut(&filter) else {
                    return Handled::fail(InvalidArgument);
                };
                entry.monitor_mask = event_types;
                entry.monitor_sent = false;
                let events = state.monitor_events(filter);
                Handled::ack().with(events)
            }
            Request::ConfigureIpCid { filter, ip_cid } => {
                let Some(entry) = state.filters.get_mut(&filter) else {
                    return Handled::fail(InvalidArgument);
                };
                if entry.filter_type.main != FilterMainType::Ip {
                    return Handled::fail(NotSupported);
                }
                entry.ip_cid = Some(ip_cid);
                let mut handled = Handled::ack();
                if entry.started && entry.monitor_mask & monitor::IP_CID_CHANGE != 0 {
                    handled = handled.with([Indication::FilterEvents {
                        filter,
                        events: vec![EventRecord::Monitor(MonitorEvent::IpCid(ip_cid))],
                    }]);
                }
                handled
            }
            Request::StartFilter { filter } => {
                let Some(entry) = state.filters.get_mut(&filter) else {
                    return Handled::fail(InvalidArgument);
                };
                entry.started = true;
                let mut indications = Vec::new();
                if entry.configured > 1 {
                    entry.start_id += 1;
                    indications.push(Indication::FilterEvents {
                        filter,
                        events: vec![EventRecord::StartId(entry.start_id)],
                    });
                }
                indications.extend(state.monitor_events(filter));
                Handled::ack().with(indications)
            }
            Request::StopFilter { filter } => match state.filters.get_mut(&filter) {
                Some(entry) => {
                    entry.started = false;
                    Handled::ack()
                }
                None => Handled::fail(InvalidArgument),
            },
            Request::FlushFilter { filter } => {
                if state.filters.contains_key(&filter) {
                    Handled::ack()
                } else {
                    Handled::fail(InvalidArgument)
                }
            }
            Request::SetFilterDataSource { filter, source } => {
                let Some(sink) = state.filters.get(&filter) else {
                    return Handled::fail(InvalidArgument);
                };
                if let Some(source) = source {
                    let Some(upstream) = state.filters.get(&source) else {
                        return Handled::fail(InvalidArgument);
                    };
                    let linkable = LINK_CAPS[upstream.filter_type.main as usize] & (1 << sink.filter_type.main as u32);
                    if source == filter || upstream.demux != sink.demux || linkable == 0 {
                        return Handled::fail(InvalidArgument);
                    }
                }
                if let Some(entry) = state.filters.get_mut(&filter) {
                    entry.data_source = source;
                }
                Handled::ack()
            }
            Request::CloseFilter { filter } => {
                if state.filters.remove(&filter).is_none() {
                    return Handled::fail(InvalidArgument);
                }
                for dvr in state.dvrs.values_mut() {
                    dvr.attached.remove(&filter);
                }
                for entry in state.filters.values_mut() {
                    if entry.data_source == Some(filter) {
                        entry.data_source = None;
                    }
                }
                Handled::ack()
            }

            Request::OpenDvr { demux, dvr_type, buffer_size } => {
                if !state.demuxes.contains_key(&demux) || buffer_size == 0 {
                    return Handled::fail(InvalidArgument);
                }
                let limit = match dvr_type {
                    DvrType::Playback => MAX_PLAYBACK,
                    DvrType::Record => MAX_RECORD,
                };
                if state.dvrs.values().filter(|d| d.dvr_type == dvr_type).count() as u32 >= limit {
                    return Handled::fail(Unavailable);
                }
                let handle = state.allocate();
                state.dvrs.insert(
                    handle,
                    DvrEntry {
                        demux,
                        dvr_type,
                        queue: Arc::new(StreamQueue::new(buffer_size as usize)),
                        settings: None,
                        attached: HashSet::new(),
                        started: false,
                        record_status: RecordStatus::DataReady,
                        overflowed: false,
                        consumer: None,
                    },
                );
                Handled::opened(handle)
            }
            Request::ConfigureDvr { dvr, settings } => {
                if settings.packet_size == 0 || settings.low_threshold > settings.high_threshold {
                    return Handled::fail(InvalidArgument);
                }
                match state.dvrs.get_mut(&dvr) {
                    Some(entry) => {
                        entry.settings = Some(settings);
                        Handled::ack()
                    }
                    None => Handled::fail(InvalidArgument),
                }
            }
            Request::GetDvrQueue { dvr } => match state.dvrs.get(&dvr) {
                Some(entry) => Handled::ok(Response::DvrQueue(Arc::clone(&entry.queue))),
                None => Handled::fail(InvalidArgument),
            },
            Request::AttachFilter { dvr, filter } => {
                if !state.filters.contains_key(&filter) {
                    return Handled::fail(InvalidArgument);
                }
                match state.dvrs.get_mut(&dvr) {
                    Some(entry) if entry.dvr_type == DvrType::Record => {
                        entry.attached.insert(filter);
                        Handled::ack()
                    }
                    Some(_) => Handled::fail(InvalidState),
                    None => Handled::fail(InvalidArgument),
                }
            }
            Request::DetachFilter { dvr, filter } => match state.dvrs.get_mut(&dvr) {
                Some(entry) if entry.attached.contains(&filter) => {
                    entry.attached.remove(&filter);
                    Handled::ack()
                }
                _ => Handled::fail(InvalidArgument),
            },
            Request::StartDvr { dvr } => {
                let Some(entry) = state.dvrs.get_mut(&dvr) else {
                    return Handled::fail(InvalidArgument);
                };
                let Some(settings) = entry.settings else {
                    return Handled::fail(InvalidState);
                };
                if entry.dvr_type == DvrType::Playback && entry.consumer.is_none() {
                    match self.spawn_consumer(dvr, entry.demux, Arc::clone(&entry.queue), settings) {
                        Ok(worker) => entry.consumer = Some(worker),
                        Err(e) => {
                            error!("[Loopback] failed to start playback consumer: {}", e);
                            return Handled::fail(UnknownError);
                        }
                    }
                }
                entry.started = true;
                Handled::ack()
            }
            Request::StopDvr { dvr } => match state.dvrs.get_mut(&dvr) {
                Some(entry) => {
                    entry.started = false;
                    Handled::ack().retire(entry.consumer.take())
                }
                None => Handled::fail(InvalidArgument),
            },
            Request::FlushDvr { dvr } => match state.dvrs.get_mut(&dvr) {
                Some(entry) => {
                    if entry.dvr_type == DvrType::Record {
                        entry.overflowed = false;
                        entry.record_status = RecordStatus::DataReady;
                    }
                    Handled::ack()
                }
                None => Handled::fail(InvalidArgument),
            },
            Request::CloseDvr { dvr } => match state.dvrs.remove(&dvr) {
                Some(entry) => Handled::ack().retire(entry.consumer),
                None => Handled::fail(InvalidArgument),
            },

            Request::GetLnbIds => {
                if self.inventory.lnb_count == 0 {
                    return Handled::fail(Unavailable);
                }
                Handled::ok(Response::LnbIds((0..self.inventory.lnb_count).collect()))
            }
            Request::OpenLnbById { id } => {
                if id >= self.inventory.lnb_count {
                    return Handled::fail(InvalidArgument);
                }
                let handle = state.allocate();
                state.lnbs.insert(handle, LnbEntry::default());
                Handled::opened(handle)
            }
            Request::OpenLnbByName { name } => {
                if !self.inventory.lnb_names.contains(&name) {
                    return Handled::fail(Unavailable);
                }
                let handle = state.allocate();
                state.lnbs.insert(handle, LnbEntry::default());
                Handled::opened(handle)
            }
            Request::SetLnbVoltage { lnb, voltage } => match state.lnbs.get_mut(&lnb) {
                Some(entry) => {
                    entry.voltage = voltage;
                    Handled::ack()
                }
                None => Handled::fail(InvalidArgument),
            },
            Request::SetLnbTone { lnb, tone } => match state.lnbs.get_mut(&lnb) {
                Some(entry) => {
                    entry.tone = tone;
                    Handled::ack()
                }
                None => Handled::fail(InvalidArgument),
            },
            Request::SetLnbPosition { lnb, position } => match state.lnbs.get_mut(&lnb) {
                Some(entry) => {
                    entry.position = position;
                    Handled::ack()
                }
                None => Handled::fail(InvalidArgument),
            },
            Request::SendDiseqcMessage { lnb, message } => {
                let Some(entry) = state.lnbs.get(&lnb) else {
                    return Handled::fail(InvalidArgument);
                };
                if message.is_empty() {
                    return Handled::fail(InvalidArgument);
                }
                trace!(
                    "[Loopback] diseqc {:02x?} at {:?}/{:?}/{:?}",
                    message, entry.voltage, entry.tone, entry.position
                );
                Handled::ack().with([Indication::Lnb { lnb, event: LnbEvent::DiseqcMessage(message) }])
            }
            Request::CloseLnb { lnb } => match state.lnbs.remove(&lnb) {
                Some(_) => Handled::ack(),
                None => Handled::fail(InvalidArgument),
            },

            Request::OpenCasSession { cas_system_id, provision, private_data } => {
                if !self.inventory.cas_system_ids.contains(&cas_system_id) {
                    return Handled::fail(Unavailable);
                }
                state.cas_sessions += 1;
                let mut key_token = cas_system_id.to_be_bytes().to_vec();
                key_token.extend_from_slice(&state.cas_sessions.to_be_bytes());
                debug!(
                    "[Loopback] cas session {} for {:#x} ({} provision bytes, {} private bytes)",
                    state.cas_sessions,
                    cas_system_id,
                    provision.len(),
                    private_data.len()
                );
                Handled::ok(Response::CasSession { key_token })
            }
            Request::OpenDescrambler => {
                if self.inventory.cas_system_ids.is_empty() {
                    return Handled::fail(Unavailable);
                }
                let handle = state.allocate();
                state.descramblers.insert(handle, DescramblerEntry::default());
                Handled::opened(handle)
            }
            Request::SetDescramblerSource { descrambler, demux } => {
                if !state.demuxes.contains_key(&demux) {
                    return Handled::fail(InvalidArgument);
                }
                match state.descramblers.get_mut(&descrambler) {
                    Some(entry) => {
                        entry.demux = Some(demux);
                        Handled::ack()
                    }
                    None => Handled::fail(InvalidArgument),
                }
            }
            Request::SetKeyToken { descrambler, token } => {
                if token.is_empty() {
                    return Handled::fail(InvalidArgument);
                }
                match state.descramblers.get_mut(&descrambler) {
                    Some(entry) => {
                        entry.key_token = Some(token);
                        Handled::ack()
                    }
                    None => Handled::fail(InvalidArgument),
                }
            }
            Request::AddPid { descrambler, pid, .. } => match state.descramblers.get_mut(&descrambler) {
                Some(entry) => {
                    if !entry.pids.contains(&pid) {
                        entry.pids.push(pid);
                    }
                    Handled::ack()
                }
                None => Handled::fail(InvalidArgument),
            },
            Request::RemovePid { descrambler, pid, .. } => match state.descramblers.get_mut(&descrambler) {
                Some(entry) if entry.pids.contains(&pid) => {
                    entry.pids.retain(|p| *p != pid);
                    Handled::ack()
                }
                _ => Handled::fail(InvalidArgument),
            },
            Request::CloseDescrambler { descrambler } => match state.descramblers.remove(&descrambler) {
                Some(_) => Handled::ack(),
                None => Handled::fail(InvalidArgument),
            },

            Request::OpenTimeFilter { demux } => {
                if !self.inventory.time_filter {
                    return Handled::fail(Unavailable);
                }
                if !state.demuxes.contains_key(&demux) {
                    return Handled::fail(InvalidArgument);
                }
                let handle = state.allocate();
                state.time_filters.insert(handle, TimeFilterEntry { demux, time_stamp: None });
                Handled::opened(handle)
            }
            Request::SetTimeStamp { time_filter, time_stamp } => match state.time_filters.get_mut(&time_filter) {
                Some(entry) => {
                    entry.time_stamp = Some((time_stamp, Instant::now()));
                    Handled::ack()
                }
                None => Handled::fail(InvalidArgument),
            },
            Request::GetTimeStamp { time_filter } => match state.time_filters.get(&time_filter) {
                Some(TimeFilterEntry { time_stamp: Some((base, set_at)), .. }) => {
                    // 90 kHz system clock.
                    let ticks = set_at.elapsed().as_millis() as u64 * 90;
                    Handled::ok(Response::TimeStamp(Some(base + ticks)))
                }
                Some(_) => Handled::fail(InvalidState),
                None => Handled::fail(InvalidArgument),
            },
            Request::ClearTimeStamp { time_filter } => match state.time_filters.get_mut(&time_filter) {
                Some(entry) => {
                    entry.time_stamp = None;
                    Handled::ack()
                }
                None => Handled::fail(InvalidArgument),
            },
            Request::CloseTimeFilter { time_filter } => match state.time_filters.remove(&time_filter) {
                Some(_) => Handled::ack(),
                None => Handled::fail(InvalidArgument),
            },
        }
    }
}

/// In-process device implementing [`DeviceControl`].
pub struct LoopbackDevice {
    inner: Arc<Inner>,
    listener: Arc<RwLock<Option<Weak<dyn DeviceListener>>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl LoopbackDevice {
    pub fn new(inventory: LoopbackInventory) -> io::Result<Self> {
        let (outbox, inbox) = unbounded();
        let listener: Arc<RwLock<Option<Weak<dyn DeviceListener>>>> = Arc::new(RwLock::new(None));
        let dispatcher = {
            let listener = Arc::clone(&listener);
            thread::Builder::new()
                .name("loopback-dispatch".to_string())
                .spawn(move || dispatch_loop(inbox, listener))?
        };
        info!(
            "[Loopback] device ready ({} software frontend type(s), {} lnb(s), {} cas system(s))",
            inventory.software_frontends.len(),
            inventory.lnb_count,
            inventory.cas_system_ids.len()
        );
        Ok(Self {
            inner: Arc::new(Inner {
                inventory,
                state: Mutex::new(State::default()),
                outbox,
                closed: AtomicBool::new(false),
            }),
            listener,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    pub fn inventory(&self) -> &LoopbackInventory {
        &self.inner.inventory
    }
}

impl DeviceControl for LoopbackDevice {
    fn submit(&self, token: CorrelationToken, request: Request) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::ShuttingDown);
        }
        let op = request.operation();
        let handled = self.inner.handle(request);
        for worker in handled.retired {
            worker.join();
        }
        if !handled.code.is_success() {
            debug!("[Loopback] {} {} -> {:?}", token, op, handled.code);
        }
        self.inner.send(DeviceMessage::Reply(Reply {
            token,
            code: handled.code,
            response: handled.response,
        }));
        self.inner.emit(handled.indications);
        Ok(())
    }

    fn set_listener(&self, listener: Weak<dyn DeviceListener>) {
        *self.listener.write() = Some(listener);
    }

    fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let workers = self.inner.state.lock().take_workers();
        for worker in workers {
            worker.join();
        }
        if self.inner.outbox.send(Dispatch::Shutdown).is_err() {
            trace!("[Loopback] dispatcher already stopped");
        }
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            if dispatcher.thread().id() != thread::current().id() && dispatcher.join().is_err() {
                error!("[Loopback] dispatcher thread panicked");
            }
        }
        info!("[Loopback] device shut down");
    }
}

impl Drop for LoopbackDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch_loop(inbox: Receiver<Dispatch>, listener: Arc<RwLock<Option<Weak<dyn DeviceListener>>>>) {
    while let Ok(Dispatch::Message(message)) = inbox.recv() {
        let target = listener.read().as_ref().and_then(Weak::upgrade);
        match target {
            Some(target) => target.on_message(message),
            None => trace!("[Loopback] no listener registered, message dropped"),
        }
    }
    debug!("[Loopback] dispatcher stopped");
}

fn packet_pid(packet: &[u8]) -> u16 {
    (u16::from(packet[1] & 0x1f) << 8) | u16::from(packet[2])
}

fn ts_packet(pid: u16, continuity: u8) -> [u8; TS_PACKET_SIZE] {
    let mut packet = [0xffu8; TS_PACKET_SIZE];
    packet[0] = 0x47;
    packet[1] = 0x40 | ((pid >> 8) as u8 & 0x1f);
    packet[2] = pid as u8;
    packet[3] = 0x10 | (continuity & 0x0f);
    packet[4] = 0x00;
    packet[5] = if pid == 0 { 0x00 } else { 0x02 };
    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceSession;
    use crate::dvr::{RecordDriver, Transfer};
    use crate::error::ScenarioError;
    use crate::events::EventAggregator;
    use tuner_hal_protocol::{DataFormat, FrontendSettings};

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn connect(inventory: LoopbackInventory) -> (Arc<LoopbackDevice>, Arc<DeviceSession>) {
        let device = Arc::new(LoopbackDevice::new(inventory).unwrap());
        let session = DeviceSession::connect("loopback", device.clone(), TIMEOUT);
        (device, session)
    }

    fn dvr_settings() -> DvrSettings {
        DvrSettings {
            status_mask: 0x0f,
            low_threshold: 188 * 4,
            high_threshold: 188 * 28,
            packet_size: 188,
            data_format: DataFormat::Ts,
        }
    }

    fn open_filter(session: &DeviceSession, demux: Handle, sub: FilterSubType, pid: Option<u16>) -> Handle {
        let filter = session
            .open(Request::OpenFilter {
                demux,
                filter_type: FilterType::new(FilterMainType::Ts, sub),
                buffer_size: 1 << 16,
            })
            .unwrap();
        let settings = FilterSettings { pid, ..FilterSettings::default() };
        session.call(Request::ConfigureFilter { filter, settings }).unwrap();
        filter
    }

    #[test]
    fn test_handles_and_argument_checks() {
        let (_device, session) = connect(LoopbackInventory::default());
        let demux = session.open(Request::OpenDemux).unwrap();
        match session.call(Request::GetDemuxCaps).unwrap() {
            Response::DemuxCaps(caps) => assert_eq!(caps.num_demux, MAX_DEMUX),
            other => panic!("unexpected {:?}", other),
        }
        session.call(Request::CloseDemux { demux }).unwrap();
        assert!(matches!(
            session.call(Request::CloseDemux { demux }),
            Err(ScenarioError::Semantic { code: ResultCode::InvalidArgument, .. })
        ));
    }

    #[test]
    fn test_hardware_tune_feeds_filters() {
        let (_device, session) = connect(LoopbackInventory::default());
        let frontend = session.open(Request::OpenFrontend { frontend_type: FrontendType::Dvbt }).unwrap();
        let demux = session.open(Request::OpenDemux).unwrap();
        session.call(Request::SetDataSource { demux, frontend }).unwrap();

        let filter = open_filter(&session, demux, FilterSubType::Video, Some(0x100));
        let aggregator = EventAggregator::new();
        session.route_filter(filter, aggregator.clone());
        session.call(Request::StartFilter { filter }).unwrap();

        let settings = FrontendSettings { frontend_type: FrontendType::Dvbt, frequency_khz: 578_000, end_frequency_khz: None };
        session.call(Request::Tune { frontend, settings }).unwrap();
        aggregator.wait_for_output(TIMEOUT).unwrap();
        assert_eq!(aggregator.last_media().unwrap().stream_id, 0x100);

        session.call(Request::StopTune { frontend }).unwrap();
        session.call(Request::CloseFilter { filter }).unwrap();
        session.call(Request::CloseDemux { demux }).unwrap();
        session.call(Request::CloseFrontend { frontend }).unwrap();
    }

    #[test]
    fn test_playback_feeds_record_dvr() {
        let (_device, session) = connect(LoopbackInventory::default());
        let demux = session.open(Request::OpenDemux).unwrap();

        let playback = session
            .open(Request::OpenDvr { demux, dvr_type: DvrType::Playback, buffer_size: 188 * 32 })
            .unwrap();
        let record = session
            .open(Request::OpenDvr { demux, dvr_type: DvrType::Record, buffer_size: 188 * 64 })
            .unwrap();
        for dvr in [playback, record] {
            session.call(Request::ConfigureDvr { dvr, settings: dvr_settings() }).unwrap();
        }
        let filter = open_filter(&session, demux, FilterSubType::Record, None);
        session.call(Request::AttachFilter { dvr: record, filter }).unwrap();
        session.call(Request::StartFilter { filter }).unwrap();

        let Response::DvrQueue(record_queue) = session.call(Request::GetDvrQueue { dvr: record }).unwrap() else {
            panic!("expected a queue");
        };
        let Response::DvrQueue(playback_queue) = session.call(Request::GetDvrQueue { dvr: playback }).unwrap() else {
            panic!("expected a queue");
        };
        let mut recorder = RecordDriver::new(record_queue, Duration::from_millis(20));
        recorder.start(None).unwrap();
        session.call(Request::StartDvr { dvr: record }).unwrap();
        session.call(Request::StartDvr { dvr: playback }).unwrap();

        let mut input = Vec::new();
        for cc in 0..10u8 {
            input.extend_from_slice(&ts_packet(0x100, cc));
        }
        assert_eq!(playback_queue.write(&input), input.len());
        assert_eq!(recorder.test_output(input.len(), TIMEOUT).unwrap(), Transfer::Complete(input.len()));
        assert_eq!(&recorder.output()[..], &input[..]);

        recorder.stop();
        session.call(Request::StopDvr { dvr: playback }).unwrap();
        session.call(Request::CloseDvr { dvr: playback }).unwrap();
        session.call(Request::CloseDvr { dvr: record }).unwrap();
    }

    #[test]
    fn test_start_id_after_reconfigure() {
        let (_device, session) = connect(LoopbackInventory::default());
        let demux = session.open(Request::OpenDemux).unwrap();
        let filter = open_filter(&session, demux, FilterSubType::Video, Some(0x100));
        let aggregator = EventAggregator::new();
        session.route_filter(filter, aggregator.clone());

        session.call(Request::StartFilter { filter }).unwrap();
        session.call(Request::StopFilter { filter }).unwrap();
        let settings = FilterSettings { pid: Some(0x101), ..FilterSettings::default() };
        session.call(Request::ConfigureFilter { filter, settings }).unwrap();
        session.call(Request::StartFilter { filter }).unwrap();
        assert_eq!(aggregator.wait_for_start_id(TIMEOUT).unwrap(), 1);
    }

    #[test]
    fn test_monitor_events_once() {
        let (_device, session) = connect(LoopbackInventory::default());
        let demux = session.open(Request::OpenDemux).unwrap();
        let filter = open_filter(&session, demux, FilterSubType::Section, Some(0));
        let aggregator = EventAggregator::new();
        session.route_filter(filter, aggregator.clone());
        session.call(Request::StartFilter { filter }).unwrap();
        session
            .call(Request::ConfigureMonitorEvent { filter, event_types: monitor::SCRAMBLING_STATUS })
            .unwrap();
        aggregator.wait_for_scrambling_status(TIMEOUT).unwrap();
        session.call(Request::StartFilter { filter }).unwrap();
        assert!(aggregator.wait_for_scrambling_status(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_av_sync_follows_lowest_pcr_filter() {
        let (_device, session) = connect(LoopbackInventory::default());
        let demux = session.open(Request::OpenDemux).unwrap();
        let video = open_filter(&session, demux, FilterSubType::Video, Some(0x100));
        let section = open_filter(&session, demux, FilterSubType::Section, Some(0));
        assert!(matches!(
            session.call(Request::GetAvSyncHwId { demux, filter: video }),
            Err(ScenarioError::Semantic { code: ResultCode::InvalidState, .. })
        ));

        let pcr = open_filter(&session, demux, FilterSubType::Pcr, Some(0x1ff));
        let later = open_filter(&session, demux, FilterSubType::Pcr, Some(0x1fe));
        let Response::AvSyncHwId(hw_id) = session.call(Request::GetAvSyncHwId { demux, filter: video }).unwrap() else {
            panic!("expected a sync id");
        };
        assert_eq!(hw_id, pcr);
        assert!(matches!(
            session.call(Request::GetAvSyncHwId { demux, filter: section }),
            Err(ScenarioError::Semantic { code: ResultCode::InvalidState, .. })
        ));
        assert!(matches!(session.call(Request::GetAvSyncTime { demux, av_sync_hw_id: hw_id }), Ok(Response::AvSyncTime(_))));
        assert!(matches!(
            session.call(Request::GetAvSyncTime { demux, av_sync_hw_id: later }),
            Err(ScenarioError::Semantic { code: ResultCode::InvalidArgument, .. })
        ));
    }

    #[test]
    fn test_filter_linkage_respects_caps() {
        let (_device, session) = connect(LoopbackInventory::default());
        let demux = session.open(Request::OpenDemux).unwrap();
        let open = |main| {
            session
                .open(Request::OpenFilter {
                    demux,
                    filter_type: FilterType::new(main, FilterSubType::Undefined),
                    buffer_size: 1 << 16,
                })
                .unwrap()
        };
        let ip = open(FilterMainType::Ip);
        let mmtp = open(FilterMainType::Mmtp);
        let ts = open(FilterMainType::Ts);

        session.call(Request::SetFilterDataSource { filter: mmtp, source: Some(ip) }).unwrap();
        session.call(Request::SetFilterDataSource { filter: mmtp, source: None }).unwrap();
        assert!(matches!(
            session.call(Request::SetFilterDataSource { filter: ts, source: Some(ip) }),
            Err(ScenarioError::Semantic { code: ResultCode::InvalidArgument, .. })
        ));
        assert!(matches!(
            session.call(Request::SetFilterDataSource { filter: ip, source: Some(ip) }),
            Err(ScenarioError::Semantic { code: ResultCode::InvalidArgument, .. })
        ));
    }

    #[test]
    fn test_ci_cam_link_cycle() {
        let inventory = LoopbackInventory { ci_cam_ids: vec![1], ..LoopbackInventory::default() };
        let (_device, session) = connect(inventory);
        let frontend = session.open(Request::OpenFrontend { frontend_type: FrontendType::Dvbt }).unwrap();

        assert!(matches!(
            session.call(Request::LinkCiCam { frontend, ci_cam_id: 2 }),
            Err(ScenarioError::Degraded { .. })
        ));
        assert!(matches!(session.call(Request::LinkCiCam { frontend, ci_cam_id: 1 }), Ok(Response::LtsId(0))));
        assert!(matches!(
            session.call(Request::RemoveOutputPid { frontend, pid: 0x100 }),
            Err(ScenarioError::Degraded { code: ResultCode::Unavailable, .. })
        ));
        session.call(Request::UnlinkCiCam { frontend, ci_cam_id: 1 }).unwrap();
        assert!(matches!(
            session.call(Request::UnlinkCiCam { frontend, ci_cam_id: 1 }),
            Err(ScenarioError::Semantic { code: ResultCode::InvalidState, .. })
        ));
    }

    #[test]
    fn test_detach_unknown_filter() {
        let (_device, session) = connect(LoopbackInventory::default());
        let demux = session.open(Request::OpenDemux).unwrap();
        let dvr = session.open(Request::OpenDvr { demux, dvr_type: DvrType::Record, buffer_size: 188 * 16 }).unwrap();
        let filter = open_filter(&session, demux, FilterSubType::Record, None);
        session.call(Request::AttachFilter { dvr, filter }).unwrap();
        session.call(Request::DetachFilter { dvr, filter }).unwrap();
        assert!(matches!(
            session.call(Request::DetachFilter { dvr, filter }),
            Err(ScenarioError::Semantic { code: ResultCode::InvalidArgument, .. })
        ));
    }

    #[test]
    fn test_optional_features_degrade() {
        let inventory = LoopbackInventory { lnb_count: 0, time_filter: false, ..LoopbackInventory::default() };
        let (_device, session) = connect(inventory);
        let demux = session.open(Request::OpenDemux).unwrap();
        assert!(matches!(
            session.call(Request::OpenTimeFilter { demux }),
            Err(ScenarioError::Degraded { .. })
        ));
        assert!(matches!(session.call(Request::GetLnbIds), Err(ScenarioError::Degraded { .. })));
        assert!(matches!(session.call(Request::OpenDescrambler), Err(ScenarioError::Degraded { .. })));
    }

    #[test]
    fn test_diseqc_rejects_empty_message() {
        let (_device, session) = connect(LoopbackInventory::default());
        let lnb = session.open(Request::OpenLnbById { id: 0 }).unwrap();
        session.call(Request::SendDiseqcMessage { lnb, message: vec![0xe0, 0x10, 0x38] }).unwrap();
        assert!(matches!(
            session.call(Request::SendDiseqcMessage { lnb, message: Vec::new() }),
            Err(ScenarioError::Semantic { .. })
        ));
    }

    #[test]
    fn test_submit_after_shutdown() {
        let (device, _session) = connect(LoopbackInventory::default());
        device.shutdown();
        assert!(matches!(
            device.submit(CorrelationToken(99), Request::OpenDemux),
            Err(TransportError::ShuttingDown)
        ));
    }
}
