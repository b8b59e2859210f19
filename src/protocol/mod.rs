//! The framed IPC protocol spoken with the worker subprocess over its
//! stdin/stdout pipe pair, and the remote log wire format derived from it.

mod frame;
mod wire;

pub use frame::{read_frame, write_frame, MAX_FRAME_LEN};
pub use wire::{Command, Event, LogSettings, LogSettingsBuilder};

pub(crate) use wire::encode_batch;
#[cfg(test)]
pub(crate) use wire::decode_batch;
