//! The in-process build log pipeline: structured entries, the bounded bus
//! they are queued on, and the shipper draining them to the remote log
//! socket.

mod bus;
mod entry;
mod shipper;

pub use bus::{BusLogger, LogBus};
pub use entry::{Field, Level, LogEntry};
pub use shipper::{LogShipper, LogShipperBuilder, ShipperHandle, LOG_SOCKET_PATH};

/// Capability set of a build logger. The agent talks to this trait to
/// interleave its own records with the worker's; the bus handle implements
/// it by stamping entries and pushing them. Worker-forwarded entries carry
/// their own timestamps and enter the bus directly.
pub trait BuildLogger: Send + Sync {
    /// Log a plain message.
    fn log_msg(&self, level: Level, text: String);

    /// Open a new activity in the activity forest.
    fn start_activity(
        &self,
        act_id: u64,
        level: Level,
        kind: u64,
        text: String,
        fields: Vec<Field>,
        parent: u64,
    );

    /// Close a previously started activity.
    fn stop_activity(&self, act_id: u64);

    /// Attach a typed result to a running activity.
    fn result(&self, act_id: u64, kind: u64, fields: Vec<Field>);
}
