//! Scenario bodies and the resource helpers they share.
//!
//! Each scenario acquires device resources through a [`Cleanup`] guard, so
//! everything it opened is closed in reverse order however it ends. Dataflow
//! drivers live inside the scenario body and are stopped before the guard
//! releases the dvrs they feed.

use std::sync::Arc;

use log::{debug, info};
use tuner_hal_protocol::{
    monitor, DvrType, EventRecord, EventTag, FilterMainType, FilterSubType, FilterType,
    FrontendStatus, Handle, Operation, Request, Response, ScanType, StreamQueue,
};

use super::{Cleanup, ScenarioRunner};
use crate::device::FrontendMonitor;
use crate::dvr::{FlushHook, PlaybackDriver, PlaybackEnd, RecordDriver, Transfer};
use crate::error::ScenarioError;
use crate::events::{EventAggregator, EventWait};
use crate::registry::{
    Catalog, Described, DvrDescription, FilterDescription, FrontendDescription,
};
use crate::topology::{
    DescramblingConnection, LiveConnection, LnbDescramblingConnection, LnbLiveConnection,
    LnbRecordConnection, PlaybackConnection, RecordConnection, ScanConnection,
    TimeFilterConnection,
};

/// IP context id configured when the filter description names none.
const DEFAULT_IP_CID: i32 = 1;
/// Buffer of the filters opened to exercise linkage.
const LINKAGE_FILTER_BUFFER: u32 = 16 * 1024 * 1024;

fn lookup<'r, T: Described>(catalog: &'r Catalog<T>, id: &str) -> Result<&'r T, ScenarioError> {
    catalog
        .get(id)
        .ok_or_else(|| ScenarioError::Expectation(format!("{} {:?} is not declared", T::KIND, id)))
}

struct OpenedFrontend<'r> {
    handle: Handle,
    monitor: Arc<FrontendMonitor>,
    description: &'r FrontendDescription,
}

struct OpenedFilter<'r> {
    handle: Handle,
    events: EventAggregator,
    description: &'r FilterDescription,
}

struct OpenedDvr<'r> {
    handle: Handle,
    queue: Arc<StreamQueue>,
    description: &'r DvrDescription,
}

/// Where the data of a demux comes from.
enum Source<'c> {
    /// A tuned frontend; software frontends are fed from `bridge`.
    Frontend { id: &'c str, bridge: Option<&'c str> },
    /// A playback dvr on the same demux.
    Playback(&'c str),
}

impl<'c> Source<'c> {
    fn of(
        frontend: Option<&'c String>,
        bridge: Option<&'c String>,
        dvr_source: Option<&'c String>,
    ) -> Result<Self, ScenarioError> {
        match (frontend, dvr_source) {
            (Some(id), None) => Ok(Source::Frontend { id: id.as_str(), bridge: bridge.map(String::as_str) }),
            (None, Some(dvr)) => Ok(Source::Playback(dvr.as_str())),
            _ => Err(ScenarioError::Expectation(
                "configuration needs exactly one of frontend and dvr source".to_string(),
            )),
        }
    }
}

impl<'a> ScenarioRunner<'a> {
    /// Run `body` with a fresh cleanup guard and release everything afterwards.
    fn guarded<F>(&self, body: F) -> Result<(), ScenarioError>
    where
        F: FnOnce(&mut Cleanup<'_>) -> Result<(), ScenarioError>,
    {
        let mut cleanup = Cleanup::new(&self.session);
        let outcome = body(&mut cleanup);
        let released = cleanup.finish();
        outcome.and(released)
    }

    fn open_frontend(&self, cleanup: &mut Cleanup<'_>, id: &str) -> Result<OpenedFrontend<'a>, ScenarioError> {
        let description = lookup(&self.registry.frontends, id)?;
        let handle = self.session.open(Request::OpenFrontend { frontend_type: description.frontend_type })?;
        cleanup.push(Request::CloseFrontend { frontend: handle });
        let monitor = Arc::new(FrontendMonitor::new());
        self.session.route_frontend(handle, Arc::clone(&monitor));
        Ok(OpenedFrontend { handle, monitor, description })
    }

    fn tune(&self, cleanup: &mut Cleanup<'_>, frontend: &OpenedFrontend<'_>) -> Result<(), ScenarioError> {
        frontend.monitor.reset();
        let settings = frontend.description.settings();
        self.session.call(Request::Tune { frontend: frontend.handle, settings })?;
        cleanup.push(Request::StopTune { frontend: frontend.handle });
        frontend
            .monitor
            .wait_locked(self.timeouts.event)
            .map_err(|e| ScenarioError::elapsed(format!("lock of frontend {}", frontend.description.id), e))?;
        debug!("[Scenario] frontend {} locked at {} kHz", frontend.description.id, settings.frequency_khz);
        Ok(())
    }

    fn open_demux(&self, cleanup: &mut Cleanup<'_>) -> Result<Handle, ScenarioError> {
        let demux = self.session.open(Request::OpenDemux)?;
        cleanup.push(Request::CloseDemux { demux });
        Ok(demux)
    }

    fn open_filter(
        &self,
        cleanup: &mut Cleanup<'_>,
        demux: Handle,
        id: &str,
    ) -> Result<OpenedFilter<'a>, ScenarioError> {
        let description = lookup(&self.registry.filters, id)?;
        let handle = self.session.open(Request::OpenFilter {
            demux,
            filter_type: description.filter_type(),
            buffer_size: description.buffer_size,
        })?;
        cleanup.push(Request::CloseFilter { filter: handle });
        self.session.call(Request::ConfigureFilter { filter: handle, settings: description.settings() })?;
        let events = EventAggregator::new();
        self.session.route_filter(handle, events.clone());
        Ok(OpenedFilter { handle, events, description })
    }

    fn start_filter(&self, cleanup: &mut Cleanup<'_>, filter: Handle) -> Result<(), ScenarioError> {
        self.session.call(Request::StartFilter { filter })?;
        cleanup.push(Request::StopFilter { filter });
        Ok(())
    }

    /// Open and start every filter in `ids`; extra filters only need to run alongside.
    fn start_extra_filters<'i>(
        &self,
        cleanup: &mut Cleanup<'_>,
        demux: Handle,
        ids: impl IntoIterator<Item = &'i String>,
    ) -> Result<(), ScenarioError> {
        for id in ids {
            let filter = self.open_filter(cleanup, demux, id)?;
            self.start_filter(cleanup, filter.handle)?;
        }
        Ok(())
    }

    fn open_dvr(
        &self,
        cleanup: &mut Cleanup<'_>,
        demux: Handle,
        id: &str,
        expected: DvrType,
    ) -> Result<OpenedDvr<'a>, ScenarioError> {
        let description = lookup(&self.registry.dvrs, id)?;
        if description.dvr_type != expected {
            return Err(ScenarioError::Expectation(format!("dvr {id:?} is not a {expected} dvr")));
        }
        let handle = self.session.open(Request::OpenDvr {
            demux,
            dvr_type: description.dvr_type,
            buffer_size: description.buffer_size,
        })?;
        cleanup.push(Request::CloseDvr { dvr: handle });
        self.session.call(Request::ConfigureDvr { dvr: handle, settings: description.settings() })?;
        let queue = match self.session.call(Request::GetDvrQueue { dvr: handle })? {
            Response::DvrQueue(queue) => queue,
            _ => return Err(ScenarioError::UnexpectedResponse { op: Operation::GetDvrQueue }),
        };
        Ok(OpenedDvr { handle, queue, description })
    }

    fn start_dvr(&self, cleanup: &mut Cleanup<'_>, dvr: Handle) -> Result<(), ScenarioError> {
        self.session.call(Request::StartDvr { dvr })?;
        cleanup.push(Request::StopDvr { dvr });
        Ok(())
    }

    /// Open the playback dvr `id` on `demux` and start feeding its input file.
    fn start_playback(
        &self,
        cleanup: &mut Cleanup<'_>,
        demux: Handle,
        id: &str,
    ) -> Result<PlaybackDriver, ScenarioError> {
        let dvr = self.open_dvr(cleanup, demux, id, DvrType::Playback)?;
        let input = dvr
            .description
            .input_file
            .as_deref()
            .ok_or_else(|| ScenarioError::Expectation(format!("playback dvr {id:?} has no input file")))?;
        let mut driver = PlaybackDriver::new(dvr.queue);
        self.session.route_playback(dvr.handle, driver.flow());
        self.start_dvr(cleanup, dvr.handle)?;
        driver.start(input)?;
        Ok(driver)
    }

    /// Open the frontend of `source` and make it the data source of `demux`.
    fn connect_source(
        &self,
        cleanup: &mut Cleanup<'_>,
        demux: Handle,
        source: &Source<'_>,
    ) -> Result<Option<OpenedFrontend<'a>>, ScenarioError> {
        match source {
            Source::Frontend { id, .. } => {
                let frontend = self.open_frontend(cleanup, id)?;
                self.session.call(Request::SetDataSource { demux, frontend: frontend.handle })?;
                Ok(Some(frontend))
            }
            Source::Playback(_) => Ok(None),
        }
    }

    /// Start the data flowing into `demux`. Filters must already be started.
    ///
    /// The returned driver feeds the demux until it is dropped.
    fn run_source(
        &self,
        cleanup: &mut Cleanup<'_>,
        demux: Handle,
        source: &Source<'_>,
        frontend: Option<&OpenedFrontend<'_>>,
    ) -> Result<Option<PlaybackDriver>, ScenarioError> {
        match (source, frontend) {
            (Source::Frontend { bridge, .. }, Some(frontend)) => {
                let driver = match bridge {
                    Some(dvr) => Some(self.start_playback(cleanup, demux, dvr)?),
                    None => None,
                };
                self.tune(cleanup, frontend)?;
                Ok(driver)
            }
            (Source::Playback(dvr), _) => Ok(Some(self.start_playback(cleanup, demux, dvr)?)),
            (Source::Frontend { id, .. }, None) => {
                Err(ScenarioError::Expectation(format!("frontend {id:?} was not connected")))
            }
        }
    }

    fn open_lnb(&self, cleanup: &mut Cleanup<'_>, id: &str, frontend: Handle) -> Result<Handle, ScenarioError> {
        let description = lookup(&self.registry.lnbs, id)?;
        let lnb = match &description.name {
            Some(name) => self.session.open(Request::OpenLnbByName { name: name.clone() })?,
            None => {
                let ids = match self.session.call(Request::GetLnbIds)? {
                    Response::LnbIds(ids) => ids,
                    _ => return Err(ScenarioError::UnexpectedResponse { op: Operation::GetLnbIds }),
                };
                let first = ids
                    .first()
                    .copied()
                    .ok_or_else(|| ScenarioError::Expectation("device reported no lnb".to_string()))?;
                self.session.open(Request::OpenLnbById { id: first })?
            }
        };
        cleanup.push(Request::CloseLnb { lnb });
        self.session.call(Request::SetLnbVoltage { lnb, voltage: description.voltage })?;
        self.session.call(Request::SetLnbTone { lnb, tone: description.tone })?;
        self.session.call(Request::SetLnbPosition { lnb, position: description.position })?;
        self.session.call(Request::SetLnb { frontend, lnb })?;
        Ok(lnb)
    }

    fn send_diseqc(&self, lnb: Handle, names: &[String]) -> Result<(), ScenarioError> {
        for name in names {
            let message = lookup(&self.registry.diseqc_messages, name)?;
            self.session.call(Request::SendDiseqcMessage { lnb, message: message.body.clone() })?;
            debug!("[Scenario] sent diseqc message {}", name);
        }
        Ok(())
    }

    /// Register for the first data batch of `filter`.
    ///
    /// Audio and video filters are only satisfied by a media event. Call this
    /// before the source starts, a batch delivered earlier is not seen.
    fn watch_output(&self, filter: &OpenedFilter<'_>) -> EventWait {
        if matches!(filter.description.sub_type, FilterSubType::Audio | FilterSubType::Video) {
            filter.events.wait_for(|batch| batch.iter().any(|e| e.tag() == EventTag::Media))
        } else {
            filter.events.wait_for(|batch| batch.iter().any(EventRecord::is_output))
        }
    }

    /// Wait for the batch `watch` was registered for and check media payloads are not empty.
    fn expect_output(&self, filter: &OpenedFilter<'_>, watch: EventWait) -> Result<(), ScenarioError> {
        let id = &filter.description.id;
        watch
            .wait(self.timeouts.event)
            .map_err(|e| ScenarioError::elapsed(format!("output of filter {id}"), e))?;
        if matches!(filter.description.sub_type, FilterSubType::Audio | FilterSubType::Video) {
            match filter.events.last_media() {
                Some(media) if media.data_length > 0 => {}
                Some(_) => return Err(ScenarioError::Expectation(format!("filter {id} delivered empty media"))),
                None => return Err(ScenarioError::Expectation(format!("filter {id} delivered no media event"))),
            }
        }
        debug!("[Scenario] filter {} produced {} batch(es)", id, filter.events.batches());
        Ok(())
    }

    pub(super) fn demux_open(&self, conn: &LiveConnection) -> Result<(), ScenarioError> {
        self.guarded(|cleanup| {
            let frontend = self.open_frontend(cleanup, &conn.frontend)?;
            let demux = self.open_demux(cleanup)?;
            self.session.call(Request::SetDataSource { demux, frontend: frontend.handle })?;
            match self.session.call(Request::GetDemuxCaps)? {
                Response::DemuxCaps(caps) if caps.num_demux == 0 => {
                    Err(ScenarioError::Expectation("device reports no demux".to_string()))
                }
                Response::DemuxCaps(caps) => {
                    debug!("[Scenario] demux caps {:?}", caps);
                    Ok(())
                }
                _ => Err(ScenarioError::UnexpectedResponse { op: Operation::GetDemuxCaps }),
            }
        })
    }

    pub(super) fn demux_av_sync_time(&self, conn: &LiveConnection, pcr_filter: &str) -> Result<(), ScenarioError> {
        self.guarded(|cleanup| {
            let frontend = self.open_frontend(cleanup, &conn.frontend)?;
            let demux = self.open_demux(cleanup)?;
            self.session.call(Request::SetDataSource { demux, frontend: frontend.handle })?;
            let media = self.open_filter(cleanup, demux, &conn.video_filter)?;
            let pcr = self.open_filter(cleanup, demux, pcr_filter)?;

            let hw_id = match self.session.call(Request::GetAvSyncHwId { demux, filter: media.handle })? {
                Response::AvSyncHwId(id) => id,
                _ => return Err(ScenarioError::UnexpectedResponse { op: Operation::GetAvSyncHwId }),
            };
            if hw_id != pcr.handle {
                return Err(ScenarioError::Expectation(format!(
                    "av sync id {hw_id} of {} is not pcr filter {pcr_filter}",
                    media.description.id
                )));
            }
            match self.session.call(Request::GetAvSyncTime { demux, av_sync_hw_id: hw_id })? {
                Response::AvSyncTime(time) => {
                    debug!("[Scenario] av sync time {} from {}", time, pcr_filter);
                    Ok(())
                }
                _ => Err(ScenarioError::UnexpectedResponse { op: Operation::GetAvSyncTime }),
            }
        })
    }

    pub(super) fn frontend_tune(&self, conn: &LiveConnection) -> Result<(), ScenarioError> {
        self.guarded(|cleanup| {
            let frontend = self.open_frontend(cleanup, &conn.frontend)?;
            self.tune(cleanup, &frontend)?;
            let types = frontend.description.status_types.clone();
            if types.is_empty() {
                return Ok(());
            }
            let statuses = match self
                .session
                .call(Request::GetFrontendStatus { frontend: frontend.handle, types: types.clone() })?
            {
                Response::FrontendStatus { statuses } => statuses,
                _ => return Err(ScenarioError::UnexpectedResponse { op: Operation::GetFrontendStatus }),
            };
            for wanted in &types {
                if !statuses.iter().any(|s| s.status_type() == *wanted) {
                    return Err(ScenarioError::Expectation(format!("status {wanted:?} was not reported")));
                }
            }
            if statuses.contains(&FrontendStatus::DemodLocked(false)) {
                return Err(ScenarioError::Expectation("demodulator not locked after tune".to_string()));
            }
            Ok(())
        })
    }

    pub(super) fn frontend_scan(&self, conn: &ScanConnection, blind: bool) -> Result<(), ScenarioError> {
        let scan_type = if blind { ScanType::Blind } else { ScanType::Auto };
        self.guarded(|cleanup| {
            let frontend = self.open_frontend(cleanup, &conn.frontend)?;
            frontend.monitor.reset();
            self.session.call(Request::Scan {
                frontend: frontend.handle,
                settings: frontend.description.settings(),
                scan_type,
            })?;
            cleanup.push(Request::StopScan { frontend: frontend.handle });
            frontend
                .monitor
                .wait_scan_end(self.timeouts.event)
                .map_err(|e| ScenarioError::elapsed("scan end", e))?;
            if !frontend.monitor.scan_locked() {
                return Err(ScenarioError::Expectation(format!("{scan_type:?} scan ended without locking")));
            }
            debug!(
                "[Scenario] {:?} scan of {} reported {:?}",
                scan_type,
                frontend.description.id,
                frontend.monitor.scanned_frequencies()
            );
            Ok(())
        })
    }

    /// Route data out of the CI-CAM `ci_cam_id` and back before tuning.
    pub(super) fn frontend_link_cicam(&self, conn: &LiveConnection, ci_cam_id: i32) -> Result<(), ScenarioError> {
        let video = lookup(&self.registry.filters, &conn.video_filter)?;
        self.guarded(|cleanup| {
            let frontend = self.open_frontend(cleanup, &conn.frontend)?;
            let lts_id = match self.session.call(Request::LinkCiCam { frontend: frontend.handle, ci_cam_id })? {
                Response::LtsId(id) => id,
                _ => return Err(ScenarioError::UnexpectedResponse { op: Operation::LinkCiCam }),
            };
            cleanup.push(Request::UnlinkCiCam { frontend: frontend.handle, ci_cam_id });
            debug!("[Scenario] frontend {} linked to ci-cam {} as lts {}", frontend.description.id, ci_cam_id, lts_id);

            if let Some(pid) = video.pid {
                match self.session.call(Request::RemoveOutputPid { frontend: frontend.handle, pid }) {
                    Ok(_) => {}
                    Err(ScenarioError::Degraded { .. }) => debug!("[Scenario] output pid {} not removable", pid),
                    Err(e) => return Err(e),
                }
            }
            cleanup.release_now(Request::UnlinkCiCam { frontend: frontend.handle, ci_cam_id })?;
            self.tune(cleanup, &frontend)
        })
    }

    pub(super) fn filter_start_in_demux(&self, conn: &LiveConnection) -> Result<(), ScenarioError> {
        self.guarded(|cleanup| {
            let frontend = self.open_frontend(cleanup, &conn.frontend)?;
            let demux = self.open_demux(cleanup)?;
            self.session.call(Request::SetDataSource { demux, frontend: frontend.handle })?;
            for id in [&conn.audio_filter, &conn.video_filter] {
                let filter = self.open_filter(cleanup, demux, id)?;
                self.start_filter(cleanup, filter.handle)?;
                self.session.call(Request::FlushFilter { filter: filter.handle })?;
                cleanup.release_now(Request::StopFilter { filter: filter.handle })?;
                cleanup.release_now(Request::CloseFilter { filter: filter.handle })?;
            }
            Ok(())
        })
    }

    pub(super) fn filter_ip_cid(&self, conn: &LiveConnection, ip_filter: &str) -> Result<(), ScenarioError> {
        self.guarded(|cleanup| {
            let frontend = self.open_frontend(cleanup, &conn.frontend)?;
            let demux = self.open_demux(cleanup)?;
            self.session.call(Request::SetDataSource { demux, frontend: frontend.handle })?;
            let filter = self.open_filter(cleanup, demux, ip_filter)?;
            self.session.call(Request::ConfigureMonitorEvent {
                filter: filter.handle,
                event_types: monitor::IP_CID_CHANGE,
            })?;
            self.start_filter(cleanup, filter.handle)?;
            let ip_cid = filter.description.ip_cid.unwrap_or(DEFAULT_IP_CID);
            self.session.call(Request::ConfigureIpCid { filter: filter.handle, ip_cid })?;
            filter
                .events
                .wait_for_ip_cid_change(self.timeouts.event)
                .map_err(|e| ScenarioError::elapsed("ip cid change", e))
        })
    }

    pub(super) fn filter_reconfigure_start_id(&self, conn: &LiveConnection) -> Result<(), ScenarioError> {
        self.guarded(|cleanup| {
            let demux = self.open_demux(cleanup)?;
            let filter = self.open_filter(cleanup, demux, &conn.video_filter)?;
            self.start_filter(cleanup, filter.handle)?;

            let mut previous = None;
            for _ in 0..2 {
                cleanup.release_now(Request::StopFilter { filter: filter.handle })?;
                self.session.call(Request::ConfigureFilter {
                    filter: filter.handle,
                    settings: filter.description.settings(),
                })?;
                self.start_filter(cleanup, filter.handle)?;
                let start_id = filter
                    .events
                    .wait_for_start_id(self.timeouts.event)
                    .map_err(|e| ScenarioError::elapsed("start id", e))?;
                if previous == Some(start_id) {
                    return Err(ScenarioError::Expectation(format!(
                        "start id stayed {start_id} after reconfiguration"
                    )));
                }
                previous = Some(start_id);
            }
            Ok(())
        })
    }

    /// Link a filter pair for every source and sink main type the demux allows.
    pub(super) fn filter_linkage(&self) -> Result<(), ScenarioError> {
        self.guarded(|cleanup| {
            let demux = self.open_demux(cleanup)?;
            let caps = match self.session.call(Request::GetDemuxCaps)? {
                Response::DemuxCaps(caps) => caps,
                _ => return Err(ScenarioError::UnexpectedResponse { op: Operation::GetDemuxCaps }),
            };
            let linkages = caps.linkages();
            if linkages.is_empty() {
                info!("[Scenario] demux reports no filter linkage");
            }
            for (source_type, sink_type) in linkages {
                let source = self.open_linkage_filter(cleanup, demux, source_type)?;
                let sink = self.open_linkage_filter(cleanup, demux, sink_type)?;
                self.session.call(Request::SetFilterDataSource { filter: sink, source: Some(source) })?;
                self.session.call(Request::SetFilterDataSource { filter: sink, source: None })?;
                cleanup.release_now(Request::CloseFilter { filter: sink })?;
                cleanup.release_now(Request::CloseFilter { filter: source })?;
                debug!("[Scenario] linked {:?} filter into {:?} filter", source_type, sink_type);
            }
            Ok(())
        })
    }

    fn open_linkage_filter(
        &self,
        cleanup: &mut Cleanup<'_>,
        demux: Handle,
        main: FilterMainType,
    ) -> Result<Handle, ScenarioError> {
        let filter = self.session.open(Request::OpenFilter {
            demux,
            filter_type: FilterType::new(main, FilterSubType::Undefined),
            buffer_size: LINKAGE_FILTER_BUFFER,
        })?;
        cleanup.push(Request::CloseFilter { filter });
        Ok(filter)
    }

    pub(super) fn filter_time_filter(&self, conn: &TimeFilterConnection) -> Result<(), ScenarioError> {
        let description = lookup(&self.registry.time_filters, &conn.time_filter)?;
        self.guarded(|cleanup| {
            let demux = self.open_demux(cleanup)?;
            let time_filter = self.session.open(Request::OpenTimeFilter { demux })?;
            cleanup.push(Request::CloseTimeFilter { time_filter });
            self.session.call(Request::SetTimeStamp { time_filter, time_stamp: description.time_stamp })?;
            match self.session.call(Request::GetTimeStamp { time_filter })? {
                Response::TimeStamp(Some(now)) if now >= description.time_stamp => {}
                Response::TimeStamp(other) => {
                    return Err(ScenarioError::Expectation(format!(
                        "time stamp {:?} is behind the {} that was set",
                        other, description.time_stamp
                    )))
                }
                _ => return Err(ScenarioError::UnexpectedResponse { op: Operation::GetTimeStamp }),
            }
            self.session.call(Request::ClearTimeStamp { time_filter })?;
            Ok(())
        })
    }

    pub(super) fn broadcast(&self, conn: &LiveConnection, target: &str) -> Result<(), ScenarioError> {
        let source = Source::Frontend {
            id: &conn.frontend,
            bridge: conn.dvr_software_fe.as_deref(),
        };
        self.guarded(|cleanup| {
            let demux = self.open_demux(cleanup)?;
            let frontend = self.connect_source(cleanup, demux, &source)?;
            let filter = self.open_filter(cleanup, demux, target)?;
            self.start_filter(cleanup, filter.handle)?;
            self.start_extra_filters(cleanup, demux, conn.pcr_filter.iter().chain(&conn.extra_filters))?;
            let watch = self.watch_output(&filter);
            let _feed = self.run_source(cleanup, demux, &source, frontend.as_ref())?;
            self.expect_output(&filter, watch)
        })
    }

    pub(super) fn broadcast_lnb_video(&self, conn: &LnbLiveConnection) -> Result<(), ScenarioError> {
        self.guarded(|cleanup| {
            let frontend = self.open_frontend(cleanup, &conn.frontend)?;
            let lnb = self.open_lnb(cleanup, &conn.lnb, frontend.handle)?;
            self.send_diseqc(lnb, &conn.diseqc_messages)?;
            let demux = self.open_demux(cleanup)?;
            self.session.call(Request::SetDataSource { demux, frontend: frontend.handle })?;
            let filter = self.open_filter(cleanup, demux, &conn.video_filter)?;
            self.start_filter(cleanup, filter.handle)?;
            self.start_extra_filters(cleanup, demux, &conn.extra_filters)?;
            let watch = self.watch_output(&filter);
            self.tune(cleanup, &frontend)?;
            self.expect_output(&filter, watch)
        })
    }

    pub(super) fn lnb_diseqc(&self, conn: &LnbLiveConnection) -> Result<(), ScenarioError> {
        self.guarded(|cleanup| {
            let frontend = self.open_frontend(cleanup, &conn.frontend)?;
            let lnb = self.open_lnb(cleanup, &conn.lnb, frontend.handle)?;
            self.send_diseqc(lnb, &conn.diseqc_messages)
        })
    }

    pub(super) fn playback(&self, conn: &PlaybackConnection, target: &str) -> Result<(), ScenarioError> {
        self.guarded(|cleanup| {
            let demux = self.open_demux(cleanup)?;
            let filter = self.open_filter(cleanup, demux, target)?;
            self.start_filter(cleanup, filter.handle)?;
            self.start_extra_filters(cleanup, demux, &conn.extra_filters)?;
            let watch = self.watch_output(&filter);
            let mut driver = self.start_playback(cleanup, demux, &conn.dvr)?;
            self.expect_output(&filter, watch)?;
            match driver.wait_written(self.timeouts.min_playback_bytes, self.timeouts.event)? {
                Transfer::Complete(n) => debug!("[Scenario] playback wrote {} bytes", n),
                Transfer::Partial(n) => info!(
                    "[Scenario] playback wrote {} of {} bytes before the timeout",
                    n, self.timeouts.min_playback_bytes
                ),
            }
            match driver.stop().end {
                PlaybackEnd::ReadError(message) => {
                    Err(ScenarioError::Expectation(format!("playback input failed: {message}")))
                }
                PlaybackEnd::EndOfInput | PlaybackEnd::Stopped => Ok(()),
            }
        })
    }

    /// Record `filter_id` into `dvr_id` while `source` feeds `demux`.
    fn record(
        &self,
        cleanup: &mut Cleanup<'_>,
        demux: Handle,
        filter_id: &str,
        dvr_id: &str,
        source: &Source<'_>,
        frontend: Option<&OpenedFrontend<'_>>,
    ) -> Result<(), ScenarioError> {
        let filter = self.open_filter(cleanup, demux, filter_id)?;
        let dvr = self.open_dvr(cleanup, demux, dvr_id, DvrType::Record)?;
        self.session.call(Request::AttachFilter { dvr: dvr.handle, filter: filter.handle })?;
        cleanup.push(Request::DetachFilter { dvr: dvr.handle, filter: filter.handle });

        let mut driver = RecordDriver::new(dvr.queue, self.timeouts.record_wait);
        self.session.route_record(dvr.handle, driver.flow());
        let flush: FlushHook = {
            let session = Arc::clone(&self.session);
            let handle = dvr.handle;
            Box::new(move || session.call(Request::FlushDvr { dvr: handle }).map(|_| ()))
        };
        driver.start(Some(flush))?;
        self.start_dvr(cleanup, dvr.handle)?;
        self.start_filter(cleanup, filter.handle)?;
        let _feed = self.run_source(cleanup, demux, source, frontend)?;

        match driver.test_output(self.timeouts.min_record_bytes, self.timeouts.event)? {
            Transfer::Complete(n) => debug!("[Scenario] recorded {} bytes", n),
            Transfer::Partial(n) => info!(
                "[Scenario] recorded {} of {} bytes before the timeout",
                n, self.timeouts.min_record_bytes
            ),
        }
        let summary = driver.stop();
        debug!("[Scenario] record dvr {} summary {:?}", dvr.description.id, summary);
        Ok(())
    }

    pub(super) fn record_ts(&self, conn: &RecordConnection) -> Result<(), ScenarioError> {
        let source = Source::of(conn.frontend.as_ref(), conn.dvr_software_fe.as_ref(), conn.dvr_source.as_ref())?;
        self.guarded(|cleanup| {
            let demux = self.open_demux(cleanup)?;
            let frontend = self.connect_source(cleanup, demux, &source)?;
            self.record(cleanup, demux, &conn.record_filter, &conn.dvr_record, &source, frontend.as_ref())
        })
    }

    pub(super) fn record_attach_filters(&self, conn: &RecordConnection) -> Result<(), ScenarioError> {
        self.guarded(|cleanup| {
            let demux = self.open_demux(cleanup)?;
            let filter = self.open_filter(cleanup, demux, &conn.record_filter)?;
            let dvr = self.open_dvr(cleanup, demux, &conn.dvr_record, DvrType::Record)?;
            self.session.call(Request::AttachFilter { dvr: dvr.handle, filter: filter.handle })?;
            cleanup.push(Request::DetachFilter { dvr: dvr.handle, filter: filter.handle });
            self.start_filter(cleanup, filter.handle)?;
            cleanup.release_now(Request::StopFilter { filter: filter.handle })?;
            cleanup.release_now(Request::DetachFilter { dvr: dvr.handle, filter: filter.handle })
        })
    }

    pub(super) fn record_lnb(&self, conn: &LnbRecordConnection) -> Result<(), ScenarioError> {
        let source = Source::Frontend { id: &conn.frontend, bridge: None };
        self.guarded(|cleanup| {
            let demux = self.open_demux(cleanup)?;
            let frontend = self.connect_source(cleanup, demux, &source)?;
            if let Some(frontend) = &frontend {
                let lnb = self.open_lnb(cleanup, &conn.lnb, frontend.handle)?;
                self.send_diseqc(lnb, &conn.diseqc_messages)?;
            }
            self.record(cleanup, demux, &conn.record_filter, &conn.dvr_record, &source, frontend.as_ref())
        })
    }

    /// Play out `filters` through the descrambler `descrambler_id`.
    ///
    /// Filters asking for scrambling status must report it once started.
    fn descrambled(
        &self,
        cleanup: &mut Cleanup<'_>,
        demux: Handle,
        descrambler_id: &str,
        filter_ids: [&str; 2],
        extra_filters: &[String],
        source: &Source<'_>,
        frontend: Option<&OpenedFrontend<'_>>,
    ) -> Result<(), ScenarioError> {
        let description = lookup(&self.registry.descramblers, descrambler_id)?;
        let mut filters = Vec::with_capacity(filter_ids.len());
        for id in filter_ids {
            filters.push(self.open_filter(cleanup, demux, id)?);
        }

        let key_token = match self.session.call(Request::OpenCasSession {
            cas_system_id: description.cas_system_id,
            provision: description.provision.clone(),
            private_data: description.private_data.clone(),
        })? {
            Response::CasSession { key_token } => key_token,
            _ => return Err(ScenarioError::UnexpectedResponse { op: Operation::OpenCasSession }),
        };
        let descrambler = self.session.open(Request::OpenDescrambler)?;
        cleanup.push(Request::CloseDescrambler { descrambler });
        self.session.call(Request::SetDescramblerSource { descrambler, demux })?;
        self.session.call(Request::SetKeyToken { descrambler, token: key_token })?;
        for filter in &filters {
            if let Some(pid) = filter.description.pid {
                self.session.call(Request::AddPid { descrambler, pid, filter: Some(filter.handle) })?;
                cleanup.push(Request::RemovePid { descrambler, pid, filter: Some(filter.handle) });
            }
        }

        let mut monitored = Vec::new();
        for filter in &filters {
            let event_types = filter.description.monitor_event_types & monitor::SCRAMBLING_STATUS;
            if event_types == 0 {
                continue;
            }
            match self.session.call(Request::ConfigureMonitorEvent { filter: filter.handle, event_types }) {
                Ok(_) => monitored.push(filter),
                Err(e @ ScenarioError::Degraded { .. }) => info!("[Scenario] scrambling status unavailable: {}", e),
                Err(e) => return Err(e),
            }
        }

        for filter in &filters {
            self.start_filter(cleanup, filter.handle)?;
        }
        self.start_extra_filters(cleanup, demux, extra_filters)?;
        let watches: Vec<EventWait> = filters.iter().map(|f| self.watch_output(f)).collect();
        let _feed = self.run_source(cleanup, demux, source, frontend)?;

        for (filter, watch) in filters.iter().zip(watches) {
            self.expect_output(filter, watch)?;
        }
        for filter in monitored {
            filter
                .events
                .wait_for_scrambling_status(self.timeouts.event)
                .map_err(|e| ScenarioError::elapsed(format!("scrambling status of {}", filter.description.id), e))?;
        }
        Ok(())
    }

    pub(super) fn descrambler_create(&self, conn: &DescramblingConnection) -> Result<(), ScenarioError> {
        self.guarded(|cleanup| {
            let demux = self.open_demux(cleanup)?;
            if let Some(id) = &conn.frontend {
                let frontend = self.open_frontend(cleanup, id)?;
                self.session.call(Request::SetDataSource { demux, frontend: frontend.handle })?;
            }
            let descrambler = self.session.open(Request::OpenDescrambler)?;
            cleanup.push(Request::CloseDescrambler { descrambler });
            self.session.call(Request::SetDescramblerSource { descrambler, demux })?;
            cleanup.release_now(Request::CloseDescrambler { descrambler })
        })
    }

    pub(super) fn descrambler_broadcast(&self, conn: &DescramblingConnection) -> Result<(), ScenarioError> {
        let source = Source::of(conn.frontend.as_ref(), conn.dvr_software_fe.as_ref(), conn.dvr_source.as_ref())?;
        self.guarded(|cleanup| {
            let demux = self.open_demux(cleanup)?;
            let frontend = self.connect_source(cleanup, demux, &source)?;
            self.descrambled(
                cleanup,
                demux,
                &conn.descrambler,
                [conn.audio_filter.as_str(), conn.video_filter.as_str()],
                &conn.extra_filters,
                &source,
                frontend.as_ref(),
            )
        })
    }

    pub(super) fn descrambler_lnb(&self, conn: &LnbDescramblingConnection) -> Result<(), ScenarioError> {
        let source = Source::Frontend { id: &conn.frontend, bridge: None };
        self.guarded(|cleanup| {
            let demux = self.open_demux(cleanup)?;
            let frontend = self.connect_source(cleanup, demux, &source)?;
            if let Some(frontend) = &frontend {
                let lnb = self.open_lnb(cleanup, &conn.lnb, frontend.handle)?;
                self.send_diseqc(lnb, &conn.diseqc_messages)?;
            }
            self.descrambled(
                cleanup,
                demux,
                &conn.descrambler,
                [conn.audio_filter.as_str(), conn.video_filter.as_str()],
                &[],
                &source,
                frontend.as_ref(),
            )
        })
    }
}
