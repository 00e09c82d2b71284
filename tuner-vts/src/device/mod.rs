//! Device-facing side of the harness.
//!
//! A device is anything implementing [`DeviceControl`]: requests go in with a
//! correlation token, replies and indications come back through the
//! registered [`DeviceListener`]. [`DeviceSession`] turns that into blocking
//! calls; [`LoopbackDevice`] is the in-process reference device.

pub mod loopback;
pub mod monitor;
pub mod session;
pub mod whitelist;

use std::sync::Weak;

use tuner_hal_protocol::{CorrelationToken, DeviceMessage, Request, TransportError};

pub use loopback::{LoopbackDevice, LoopbackInventory};
pub use monitor::FrontendMonitor;
pub use session::DeviceSession;

/// Control surface of one device service instance.
pub trait DeviceControl: Send + Sync {
    /// Queue `request`; the reply must echo `token`.
    fn submit(&self, token: CorrelationToken, request: Request) -> Result<(), TransportError>;

    /// Register the receiver for replies and indications.
    fn set_listener(&self, listener: Weak<dyn DeviceListener>);

    /// Release device resources. Later submits fail.
    fn shutdown(&self) {}
}

/// Receives everything a device sends back.
pub trait DeviceListener: Send + Sync {
    fn on_message(&self, message: DeviceMessage);
}
