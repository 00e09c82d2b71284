//! Requests, replies and indications exchanged with the device.
//!
//! Every [`Request`] is submitted with a [`CorrelationToken`]; the device
//! answers with a [`Reply`] echoing that token. Unsolicited traffic arrives as
//! an [`Indication`]. Both travel to the harness as a [`DeviceMessage`].

use std::fmt;
use std::sync::Arc;

use crate::error::ResultCode;
use crate::event::EventRecord;
use crate::queue::StreamQueue;
use crate::types::*;

/// Operation name of a request, used for whitelists and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    OpenFrontend,
    CloseFrontend,
    Tune,
    StopTune,
    Scan,
    StopScan,
    GetFrontendStatus,
    SetLnb,
    LinkCiCam,
    UnlinkCiCam,
    RemoveOutputPid,
    OpenDemux,
    CloseDemux,
    SetDataSource,
    GetDemuxCaps,
    GetAvSyncHwId,
    GetAvSyncTime,
    OpenFilter,
    ConfigureFilter,
    ConfigureMonitorEvent,
    ConfigureIpCid,
    StartFilter,
    StopFilter,
    FlushFilter,
    SetFilterDataSource,
    CloseFilter,
    OpenDvr,
    ConfigureDvr,
    GetDvrQueue,
    AttachFilter,
    DetachFilter,
    StartDvr,
    StopDvr,
    FlushDvr,
    CloseDvr,
    GetLnbIds,
    OpenLnbById,
    OpenLnbByName,
    SetLnbVoltage,
    SetLnbTone,
    SetLnbPosition,
    SendDiseqcMessage,
    CloseLnb,
    OpenCasSession,
    OpenDescrambler,
    SetDescramblerSource,
    SetKeyToken,
    AddPid,
    RemovePid,
    CloseDescrambler,
    OpenTimeFilter,
    SetTimeStamp,
    GetTimeStamp,
    ClearTimeStamp,
    CloseTimeFilter,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Control-plane request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Open the first frontend of the given standard.
    OpenFrontend { frontend_type: FrontendType },
    CloseFrontend { frontend: Handle },
    Tune { frontend: Handle, settings: FrontendSettings },
    StopTune { frontend: Handle },
    Scan { frontend: Handle, settings: FrontendSettings, scan_type: ScanType },
    StopScan { frontend: Handle },
    GetFrontendStatus { frontend: Handle, types: Vec<FrontendStatusType> },
    SetLnb { frontend: Handle, lnb: Handle },
    /// Route the frontend output through a CI-CAM; answered with the LTS id.
    LinkCiCam { frontend: Handle, ci_cam_id: i32 },
    UnlinkCiCam { frontend: Handle, ci_cam_id: i32 },
    RemoveOutputPid { frontend: Handle, pid: u16 },

    OpenDemux,
    CloseDemux { demux: Handle },
    SetDataSource { demux: Handle, frontend: Handle },
    GetDemuxCaps,
    /// Hardware sync source of an audio or video filter.
    GetAvSyncHwId { demux: Handle, filter: Handle },
    GetAvSyncTime { demux: Handle, av_sync_hw_id: Handle },

    OpenFilter { demux: Handle, filter_type: FilterType, buffer_size: u32 },
    ConfigureFilter { filter: Handle, settings: FilterSettings },
    ConfigureMonitorEvent { filter: Handle, event_types: u32 },
    ConfigureIpCid { filter: Handle, ip_cid: i32 },
    StartFilter { filter: Handle },
    StopFilter { filter: Handle },
    FlushFilter { filter: Handle },
    /// Feed `filter` from another filter, or from its demux with `None`.
    SetFilterDataSource { filter: Handle, source: Option<Handle> },
    CloseFilter { filter: Handle },

    OpenDvr { demux: Handle, dvr_type: DvrType, buffer_size: u32 },
    ConfigureDvr { dvr: Handle, settings: DvrSettings },
    GetDvrQueue { dvr: Handle },
    AttachFilter { dvr: Handle, filter: Handle },
    DetachFilter { dvr: Handle, filter: Handle },
    StartDvr { dvr: Handle },
    StopDvr { dvr: Handle },
    FlushDvr { dvr: Handle },
    CloseDvr { dvr: Handle },

    GetLnbIds,
    OpenLnbById { id: u32 },
    OpenLnbByName { name: String },
    SetLnbVoltage { lnb: Handle, voltage: LnbVoltage },
    SetLnbTone { lnb: Handle, tone: LnbTone },
    SetLnbPosition { lnb: Handle, position: LnbPosition },
    SendDiseqcMessage { lnb: Handle, message: Vec<u8> },
    CloseLnb { lnb: Handle },

    /// Provision a conditional access session and obtain its key token.
    OpenCasSession { cas_system_id: i32, provision: String, private_data: Vec<u8> },
    OpenDescrambler,
    SetDescramblerSource { descrambler: Handle, demux: Handle },
    SetKeyToken { descrambler: Handle, token: Vec<u8> },
    AddPid { descrambler: Handle, pid: u16, filter: Option<Handle> },
    RemovePid { descrambler: Handle, pid: u16, filter: Option<Handle> },
    CloseDescrambler { descrambler: Handle },

    OpenTimeFilter { demux: Handle },
    SetTimeStamp { time_filter: Handle, time_stamp: u64 },
    GetTimeStamp { time_filter: Handle },
    ClearTimeStamp { time_filter: Handle },
    CloseTimeFilter { time_filter: Handle },
}

impl Request {
    /// Get the operation name of this request.
    pub fn operation(&self) -> Operation {
        match self {
            Request::OpenFrontend { .. } => Operation::OpenFrontend,
            Request::CloseFrontend { .. } => Operation::CloseFrontend,
            Request::Tune { .. } => Operation::Tune,
            Request::StopTune { .. } => Operation::StopTune,
            Request::Scan { .. } => Operation::Scan,
            Request::StopScan { .. } => Operation::StopScan,
            Request::GetFrontendStatus { .. } => Operation::GetFrontendStatus,
            Request::SetLnb { .. } => Operation::SetLnb,
            Request::LinkCiCam { .. } => Operation::LinkCiCam,
            Request::UnlinkCiCam { .. } => Operation::UnlinkCiCam,
            Request::RemoveOutputPid { .. } => Operation::RemoveOutputPid,
            Request::OpenDemux => Operation::OpenDemux,
            Request::CloseDemux { .. } => Operation::CloseDemux,
            Request::SetDataSource { .. } => Operation::SetDataSource,
            Request::GetDemuxCaps => Operation::GetDemuxCaps,
            Request::GetAvSyncHwId { .. } => Operation::GetAvSyncHwId,
            Request::GetAvSyncTime { .. } => Operation::GetAvSyncTime,
            Request::OpenFilter { .. } => Operation::OpenFilter,
            Request::ConfigureFilter { .. } => Operation::ConfigureFilter,
            Request::ConfigureMonitorEvent { .. } => Operation::ConfigureMonitorEvent,
            Request::ConfigureIpCid { .. } => Operation::ConfigureIpCid,
            Request::StartFilter { .. } => Operation::StartFilter,
            Request::StopFilter { .. } => Operation::StopFilter,
            Request::FlushFilter { .. } => Operation::FlushFilter,
            Request::SetFilterDataSource { .. } => Operation::SetFilterDataSource,
            Request::CloseFilter { .. } => Operation::CloseFilter,
            Request::OpenDvr { .. } => Operation::OpenDvr,
            Request::ConfigureDvr { .. } => Operation::ConfigureDvr,
            Request::GetDvrQueue { .. } => Operation::GetDvrQueue,
            Request::AttachFilter { .. } => Operation::AttachFilter,
            Request::DetachFilter { .. } => Operation::DetachFilter,
            Request::StartDvr { .. } => Operation::StartDvr,
            Request::StopDvr { .. } => Operation::StopDvr,
            Request::FlushDvr { .. } => Operation::FlushDvr,
            Request::CloseDvr { .. } => Operation::CloseDvr,
            Request::GetLnbIds => Operation::GetLnbIds,
            Request::OpenLnbById { .. } => Operation::OpenLnbById,
            Request::OpenLnbByName { .. } => Operation::OpenLnbByName,
            Request::SetLnbVoltage { .. } => Operation::SetLnbVoltage,
            Request::SetLnbTone { .. } => Operation::SetLnbTone,
            Request::SetLnbPosition { .. } => Operation::SetLnbPosition,
            Request::SendDiseqcMessage { .. } => Operation::SendDiseqcMessage,
            Request::CloseLnb { .. } => Operation::CloseLnb,
            Request::OpenCasSession { .. } => Operation::OpenCasSession,
            Request::OpenDescrambler => Operation::OpenDescrambler,
            Request::SetDescramblerSource { .. } => Operation::SetDescramblerSource,
            Request::SetKeyToken { .. } => Operation::SetKeyToken,
            Request::AddPid { .. } => Operation::AddPid,
            Request::RemovePid { .. } => Operation::RemovePid,
            Request::CloseDescrambler { .. } => Operation::CloseDescrambler,
            Request::OpenTimeFilter { .. } => Operation::OpenTimeFilter,
            Request::SetTimeStamp { .. } => Operation::SetTimeStamp,
            Request::GetTimeStamp { .. } => Operation::GetTimeStamp,
            Request::ClearTimeStamp { .. } => Operation::ClearTimeStamp,
            Request::CloseTimeFilter { .. } => Operation::CloseTimeFilter,
        }
    }
}

/// Payload of a reply.
#[derive(Debug, Clone)]
pub enum Response {
    /// Plain acknowledgement.
    Ack,
    /// A resource was opened.
    Opened { handle: Handle },
    FrontendStatus { statuses: Vec<FrontendStatus> },
    DemuxCaps(DemuxCapabilities),
    /// Shared queue backing a dvr.
    DvrQueue(Arc<StreamQueue>),
    LnbIds(Vec<u32>),
    CasSession { key_token: Vec<u8> },
    TimeStamp(Option<u64>),
    /// Filter whose clock drives A/V sync.
    AvSyncHwId(Handle),
    /// Current sync time in 90 kHz units.
    AvSyncTime(i64),
    /// Local transport stream id assigned by a CI-CAM link.
    LtsId(i32),
}

impl Response {
    /// Handle carried by an `Opened` response.
    pub fn handle(&self) -> Option<Handle> {
        match self {
            Response::Opened { handle } => Some(*handle),
            _ => None,
        }
    }
}

/// Solicited answer to a request.
#[derive(Debug, Clone)]
pub struct Reply {
    pub token: CorrelationToken,
    pub code: ResultCode,
    pub response: Response,
}

impl Reply {
    pub fn ok(token: CorrelationToken, response: Response) -> Self {
        Self { token, code: ResultCode::Success, response }
    }

    pub fn error(token: CorrelationToken, code: ResultCode) -> Self {
        Self { token, code, response: Response::Ack }
    }
}

/// Lock state change of a tuned frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontendEvent {
    Locked,
    NoSignal,
    LostLock,
}

/// Progress message of a running scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanMessage {
    Locked(bool),
    End(bool),
    ProgressPercent(u32),
    Frequencies(Vec<u64>),
}

/// Unsolicited LNB event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LnbEvent {
    Overload,
    DiseqcRxOverflow,
    DiseqcRxTimeout,
    DiseqcRxParityError,
    DiseqcMessage(Vec<u8>),
}

/// Unsolicited device traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Indication {
    Frontend { frontend: Handle, event: FrontendEvent },
    Scan { frontend: Handle, message: ScanMessage },
    /// A batch of filter events, delivered in order.
    FilterEvents { filter: Handle, events: Vec<EventRecord> },
    PlaybackStatus { dvr: Handle, status: PlaybackStatus },
    RecordStatus { dvr: Handle, status: RecordStatus },
    Lnb { lnb: Handle, event: LnbEvent },
}

/// Anything the device delivers to the harness.
#[derive(Debug, Clone)]
pub enum DeviceMessage {
    Reply(Reply),
    Indication(Indication),
}
