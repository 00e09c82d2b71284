//! Reverse-order release of device resources acquired by a scenario.

use log::{debug, warn};
use tuner_hal_protocol::Request;

use crate::device::DeviceSession;
use crate::error::ScenarioError;

/// Stack of release requests, run last-in first-out.
///
/// Every successful open or start pushes its matching close or stop.
/// [`Cleanup::finish`] runs the stack and reports the first failure; a guard
/// dropped without `finish` still releases everything and logs failures.
pub struct Cleanup<'s> {
    session: &'s DeviceSession,
    stack: Vec<Request>,
}

impl<'s> Cleanup<'s> {
    pub fn new(session: &'s DeviceSession) -> Self {
        Self { session, stack: Vec::new() }
    }

    pub fn push(&mut self, request: Request) {
        self.stack.push(request);
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Release one pending request ahead of the rest of the stack.
    ///
    /// The most recent matching entry is removed; the request is sent even
    /// when nothing matched.
    pub fn release_now(&mut self, request: Request) -> Result<(), ScenarioError> {
        if let Some(pos) = self.stack.iter().rposition(|pending| *pending == request) {
            self.stack.remove(pos);
        }
        self.session.call(request).map(|_| ())
    }

    /// Release everything and return the first failure.
    pub fn finish(mut self) -> Result<(), ScenarioError> {
        let mut first = None;
        while let Some(request) = self.stack.pop() {
            let op = request.operation();
            if let Err(e) = self.session.call(request) {
                warn!("[Cleanup] {} failed: {}", op, e);
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl Drop for Cleanup<'_> {
    fn drop(&mut self) {
        if !self.stack.is_empty() {
            debug!("[Cleanup] releasing {} pending resource(s)", self.stack.len());
        }
        while let Some(request) = self.stack.pop() {
            let op = request.operation();
            if let Err(e) = self.session.call(request) {
                warn!("[Cleanup] {} failed: {}", op, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceControl, DeviceListener};
    use parking_lot::Mutex;
    use std::sync::{Arc, Weak};
    use std::time::Duration;
    use tuner_hal_protocol::{
        CorrelationToken, DeviceMessage, Handle, Reply, Response, ResultCode, TransportError,
    };

    /// Acknowledges everything except `CloseDemux`, recording the order.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Request>>,
        listener: Mutex<Option<Weak<dyn DeviceListener>>>,
    }

    impl DeviceControl for Recorder {
        fn submit(&self, token: CorrelationToken, request: Request) -> Result<(), TransportError> {
            let code = match request {
                Request::CloseDemux { .. } => ResultCode::InvalidState,
                _ => ResultCode::Success,
            };
            self.seen.lock().push(request);
            let reply = Reply { token, code, response: Response::Ack };
            if let Some(listener) = self.listener.lock().as_ref().and_then(Weak::upgrade) {
                listener.on_message(DeviceMessage::Reply(reply));
            }
            Ok(())
        }

        fn set_listener(&self, listener: Weak<dyn DeviceListener>) {
            *self.listener.lock() = Some(listener);
        }
    }

    fn session() -> (Arc<Recorder>, Arc<DeviceSession>) {
        let device = Arc::new(Recorder::default());
        let session = DeviceSession::connect("recorder", device.clone(), Duration::from_millis(200));
        (device, session)
    }

    #[test]
    fn test_finish_runs_in_reverse_and_reports_first_failure() {
        let (device, session) = session();
        let mut cleanup = Cleanup::new(&session);
        cleanup.push(Request::CloseDemux { demux: Handle(1) });
        cleanup.push(Request::CloseFilter { filter: Handle(2) });
        cleanup.push(Request::StopFilter { filter: Handle(2) });

        let result = cleanup.finish();
        assert!(matches!(result, Err(ScenarioError::Semantic { .. })));
        assert_eq!(
            *device.seen.lock(),
            vec![
                Request::StopFilter { filter: Handle(2) },
                Request::CloseFilter { filter: Handle(2) },
                Request::CloseDemux { demux: Handle(1) },
            ]
        );
    }

    #[test]
    fn test_release_now_removes_pending_entry() {
        let (device, session) = session();
        let mut cleanup = Cleanup::new(&session);
        cleanup.push(Request::CloseFilter { filter: Handle(2) });
        cleanup.push(Request::StopFilter { filter: Handle(2) });
        cleanup.release_now(Request::StopFilter { filter: Handle(2) }).unwrap();
        assert_eq!(cleanup.len(), 1);
        drop(cleanup);
        assert_eq!(
            *device.seen.lock(),
            vec![Request::StopFilter { filter: Handle(2) }, Request::CloseFilter { filter: Handle(2) }]
        );
    }
}
