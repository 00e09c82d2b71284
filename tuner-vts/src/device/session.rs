//! Correlated request/reply calls and indication routing for one device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};
use tuner_hal_protocol::{
    CorrelationToken, DeviceMessage, Handle, Indication, Reply, Request, Response,
};

use super::monitor::FrontendMonitor;
use super::whitelist;
use super::{DeviceControl, DeviceListener};
use crate::dvr::{PlaybackFlow, RecordFlow};
use crate::error::ScenarioError;
use crate::events::EventAggregator;

#[derive(Default)]
struct Routes {
    filters: HashMap<Handle, EventAggregator>,
    playback: HashMap<Handle, PlaybackFlow>,
    record: HashMap<Handle, RecordFlow>,
    frontends: HashMap<Handle, Arc<FrontendMonitor>>,
}

/// Harness-side endpoint of one device service instance.
///
/// [`DeviceSession::call`] submits a request with a fresh correlation token
/// and blocks until the matching reply arrives or the reply timeout elapses.
/// Indications are routed by handle to the component registered for it.
pub struct DeviceSession {
    service: String,
    device: Arc<dyn DeviceControl>,
    next_token: AtomicU64,
    pending: Mutex<HashMap<CorrelationToken, Option<Reply>>>,
    replied: Condvar,
    routes: Mutex<Routes>,
    reply_timeout: Duration,
}

impl DeviceSession {
    /// Bind a session to `device` and register it as the device listener.
    pub fn connect(service: &str, device: Arc<dyn DeviceControl>, reply_timeout: Duration) -> Arc<Self> {
        let session = Arc::new(Self {
            service: service.to_string(),
            device,
            next_token: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            replied: Condvar::new(),
            routes: Mutex::new(Routes::default()),
            reply_timeout,
        });
        let listener: Arc<dyn DeviceListener> = session.clone();
        let weak: Weak<dyn DeviceListener> = Arc::downgrade(&listener);
        session.device.set_listener(weak);
        debug!("[DeviceSession] connected to {}", service);
        session
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    /// Submit `request` and wait for its correlated reply.
    pub fn call(&self, request: Request) -> Result<Response, ScenarioError> {
        let op = request.operation();
        let token = CorrelationToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.pending.lock().insert(token, None);
        trace!("[DeviceSession] {} -> {:?}", token, request);

        if let Err(source) = self.device.submit(token, request) {
            self.pending.lock().remove(&token);
            return Err(ScenarioError::Protocol { op, source });
        }

        let deadline = Instant::now() + self.reply_timeout;
        let mut pending = self.pending.lock();
        let reply = loop {
            if matches!(pending.get(&token), Some(Some(_))) {
                break pending.remove(&token).flatten();
            }
            if self.replied.wait_until(&mut pending, deadline).timed_out() {
                let late = pending.remove(&token).flatten();
                if late.is_none() {
                    warn!("[DeviceSession] no reply to {} ({}) within {:?}", op, token, self.reply_timeout);
                    return Err(ScenarioError::Liveness {
                        what: format!("reply to {op}"),
                        timeout: self.reply_timeout,
                    });
                }
                break late;
            }
        };
        drop(pending);

        let Some(reply) = reply else {
            return Err(ScenarioError::UnexpectedResponse { op });
        };
        whitelist::check(op, reply.code)?;
        Ok(reply.response)
    }

    /// Call and extract the handle of an opened resource.
    pub fn open(&self, request: Request) -> Result<Handle, ScenarioError> {
        let op = request.operation();
        self.call(request)?
            .handle()
            .ok_or(ScenarioError::UnexpectedResponse { op })
    }

    pub fn route_filter(&self, filter: Handle, aggregator: EventAggregator) {
        self.routes.lock().filters.insert(filter, aggregator);
    }

    pub fn route_playback(&self, dvr: Handle, flow: PlaybackFlow) {
        self.routes.lock().playback.insert(dvr, flow);
    }

    pub fn route_record(&self, dvr: Handle, flow: RecordFlow) {
        self.routes.lock().record.insert(dvr, flow);
    }

    pub fn route_frontend(&self, frontend: Handle, monitor: Arc<FrontendMonitor>) {
        self.routes.lock().frontends.insert(frontend, monitor);
    }

    /// Drop every route registered for `handle`.
    pub fn unroute(&self, handle: Handle) {
        let mut routes = self.routes.lock();
        routes.filters.remove(&handle);
        routes.playback.remove(&handle);
        routes.record.remove(&handle);
        routes.frontends.remove(&handle);
    }

    pub fn clear_routes(&self) {
        *self.routes.lock() = Routes::default();
    }

    fn on_reply(&self, reply: Reply) {
        let mut pending = self.pending.lock();
        match pending.get_mut(&reply.token) {
            Some(slot) => {
                *slot = Some(reply);
                self.replied.notify_all();
            }
            None => warn!("[DeviceSession] dropping reply for unknown {}", reply.token),
        }
    }

    /// Route one indication to its registered component.
    fn dispatch(&self, indication: Indication) {
        match indication {
            Indication::FilterEvents { filter, events } => {
                let target = self.routes.lock().filters.get(&filter).cloned();
                match target {
                    Some(aggregator) => aggregator.on_event(&events),
                    None => trace!("[DeviceSession] unrouted events for filter {}", filter),
                }
            }
            Indication::PlaybackStatus { dvr, status } => {
                let target = self.routes.lock().playback.get(&dvr).cloned();
                if let Some(flow) = target {
                    flow.on_status(status);
                }
            }
            Indication::RecordStatus { dvr, status } => {
                let target = self.routes.lock().record.get(&dvr).cloned();
                if let Some(flow) = target {
                    flow.on_status(status);
                }
            }
            Indication::Frontend { frontend, event } => {
                let target = self.routes.lock().frontends.get(&frontend).cloned();
                if let Some(monitor) = target {
                    monitor.on_event(event);
                }
            }
            Indication::Scan { frontend, message } => {
                let target = self.routes.lock().frontends.get(&frontend).cloned();
                if let Some(monitor) = target {
                    monitor.on_scan(message);
                }
            }
            Indication::Lnb { lnb, event } => {
                debug!("[DeviceSession] lnb {} event {:?}", lnb, event);
            }
        }
    }
}

impl DeviceListener for DeviceSession {
    fn on_message(&self, message: DeviceMessage) {
        match message {
            DeviceMessage::Reply(reply) => self.on_reply(reply),
            DeviceMessage::Indication(indication) => self.dispatch(indication),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;
    use tuner_hal_protocol::{EventRecord, Operation, ResultCode, StreamQueue, TransportError};

    /// Answers every request inline with a fixed code.
    struct Scripted {
        code: ResultCode,
        answer: bool,
        listener: RwLock<Option<Weak<dyn DeviceListener>>>,
    }

    impl Scripted {
        fn new(code: ResultCode, answer: bool) -> Arc<Self> {
            Arc::new(Self { code, answer, listener: RwLock::new(None) })
        }

        fn send(&self, message: DeviceMessage) {
            if let Some(listener) = self.listener.read().as_ref().and_then(Weak::upgrade) {
                listener.on_message(message);
            }
        }
    }

    impl DeviceControl for Scripted {
        fn submit(&self, token: CorrelationToken, request: Request) -> Result<(), TransportError> {
            if matches!(request, Request::CloseDemux { .. }) {
                return Err(TransportError::Disconnected);
            }
            if self.answer {
                let response = match request {
                    Request::OpenDemux => Response::Opened { handle: Handle(7) },
                    _ => Response::Ack,
                };
                self.send(DeviceMessage::Reply(Reply { token, code: self.code, response }));
            }
            Ok(())
        }

        fn set_listener(&self, listener: Weak<dyn DeviceListener>) {
            *self.listener.write() = Some(listener);
        }
    }

    #[test]
    fn test_call_returns_correlated_response() {
        let device = Scripted::new(ResultCode::Success, true);
        let session = DeviceSession::connect("test", device, Duration::from_secs(1));
        assert_eq!(session.open(Request::OpenDemux).unwrap(), Handle(7));
    }

    #[test]
    fn test_error_classes() {
        let device = Scripted::new(ResultCode::InvalidState, true);
        let session = DeviceSession::connect("test", device, Duration::from_secs(1));
        assert!(matches!(session.call(Request::OpenDemux), Err(ScenarioError::Semantic { .. })));
        assert!(matches!(
            session.call(Request::CloseDemux { demux: Handle(1) }),
            Err(ScenarioError::Protocol { op: Operation::CloseDemux, .. })
        ));

        let silent = Scripted::new(ResultCode::Success, false);
        let session = DeviceSession::connect("test", silent, Duration::from_millis(30));
        assert!(matches!(session.call(Request::OpenDemux), Err(ScenarioError::Liveness { .. })));
    }

    #[test]
    fn test_late_reply_is_dropped() {
        let device = Scripted::new(ResultCode::Success, false);
        let session = DeviceSession::connect("test", device.clone(), Duration::from_millis(20));
        assert!(session.call(Request::OpenDemux).is_err());
        device.send(DeviceMessage::Reply(Reply::ok(CorrelationToken(1), Response::Ack)));
        assert!(session.pending.lock().is_empty());
    }

    #[test]
    fn test_indications_are_routed_by_handle() {
        let device = Scripted::new(ResultCode::Success, true);
        let session = DeviceSession::connect("test", device.clone(), Duration::from_secs(1));
        let aggregator = EventAggregator::new();
        session.route_filter(Handle(3), aggregator.clone());

        let batch = vec![EventRecord::StartId(1)];
        device.send(DeviceMessage::Indication(Indication::FilterEvents { filter: Handle(4), events: batch.clone() }));
        assert_eq!(aggregator.batches(), 0);
        device.send(DeviceMessage::Indication(Indication::FilterEvents { filter: Handle(3), events: batch }));
        assert_eq!(aggregator.batches(), 1);

        let playback = crate::dvr::PlaybackDriver::new(Arc::new(StreamQueue::new(64)));
        session.route_playback(Handle(5), playback.flow());
        device.send(DeviceMessage::Indication(Indication::PlaybackStatus {
            dvr: Handle(5),
            status: tuner_hal_protocol::PlaybackStatus::SpaceFull,
        }));
        assert!(!playback.flow().keep_writing());

        session.unroute(Handle(3));
        device.send(DeviceMessage::Indication(Indication::FilterEvents { filter: Handle(3), events: vec![] }));
        assert_eq!(aggregator.batches(), 1);
    }
}
