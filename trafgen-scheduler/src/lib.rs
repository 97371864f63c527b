//! Per-core playback of compiled streams.
//!
//! One [`DpCore`](dp_core::DpCore) runs per data-plane core. It owns the
//! playback [`StreamNode`](node::StreamNode)s of every port assigned to that
//! core and fires them in time order, handing each produced [`Mbuf`] to a
//! [`PacketSink`]. Nothing in here blocks or locks: commands from the control
//! plane arrive as [`CoreCommand`](dp_core::CoreCommand)s and are applied
//! between two firings.

pub mod dp_core;
pub mod mbuf;
pub mod node;
pub mod port;

pub use dp_core::{CoreCommand, CoreState, DpCore, SchedulerError, compile_streams};
pub use mbuf::{Mbuf, PacketSink};
pub use port::{PortEvent, PortState, StopReason};
pub use trafgen_vm::runtime::Time;

slotmap::new_key_type! {
    /// Handle of a playback node inside its core.
    pub struct NodeKey;
}
