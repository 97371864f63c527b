use trafgen_vm::runtime::Time;

use crate::NodeKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortState {
    #[default]
    Idle,
    Transmitting,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The last active stream of the port finished.
    Completed,
    /// The traffic duration elapsed.
    Duration,
    /// Stopped by a command.
    Command,
}

/// Notification for the control plane, drained with
/// [`DpCore::take_port_events`](crate::DpCore::take_port_events).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEvent {
    Started {
        port: u8,
        event_id: u32,
        at: Time,
    },
    Stopped {
        port: u8,
        event_id: u32,
        reason: StopReason,
        at: Time,
    },
}

/// Streams armed on one port of one core.
#[derive(Debug, Default)]
pub struct Port {
    pub(crate) state: PortState,
    pub(crate) nodes: Vec<NodeKey>,
    /// Nodes that are queued or will hand over to a successor before the
    /// port may report completion.
    pub(crate) active_streams: u32,
    pub(crate) event_id: u32,
}

impl Port {
    pub fn state(&self) -> PortState {
        self.state
    }
    pub fn active_streams(&self) -> u32 {
        self.active_streams
    }
    pub fn event_id(&self) -> u32 {
        self.event_id
    }
    pub fn nodes(&self) -> &[NodeKey] {
        &self.nodes
    }
    pub fn is_idle(&self) -> bool {
        self.state == PortState::Idle
    }

    /// One stream finished without a successor; true when it was the last.
    pub(crate) fn release_stream(&mut self) -> bool {
        self.active_streams = self.active_streams.saturating_sub(1);
        self.active_streams == 0
    }
}
