use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    sync::mpsc,
};

use itertools::Itertools;
use slotmap::SlotMap;
use thiserror::Error;
use trafgen_vm::{
    compiler::{CompileError, Context},
    runtime::Time,
    stream::{CompiledStream, Stream, StreamMode},
    utils::error::ReportableError,
};

use crate::{
    NodeKey, PacketSink,
    node::{Firing, NodeState, StreamNode},
    port::{Port, PortEvent, PortState, StopReason},
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulerError {
    #[error("port {0} does not exist on this core")]
    UnknownPort(u8),
    #[error("port {port} is {state:?}, traffic can only start on an idle port")]
    PortNotIdle { port: u8, state: PortState },
    #[error("stream #{index} points at next stream #{next} but the port only has {count} stream(s)")]
    InvalidNextStream {
        index: usize,
        next: usize,
        count: usize,
    },
    #[error("stream {stream_id} on port {port} is not continuous and can not be paused")]
    NotPausable { port: u8, stream_id: u32 },
    #[error("rate factor {0} must be a positive number")]
    InvalidFactor(f64),
    #[error("stream {stream_id}: rate of {pps} packets per second must be a positive number")]
    InvalidRate { stream_id: u32, pps: f64 },
    #[error("stream {stream_id}: {gap} gap of {usec} usec is out of range")]
    InvalidGap {
        stream_id: u32,
        gap: &'static str,
        usec: f64,
    },
    #[error("stream {stream_id}: a burst needs at least one packet and one burst")]
    EmptyBurst { stream_id: u32 },
    #[error("stream {stream_id}: {error}")]
    Compile { stream_id: u32, error: CompileError },
}

impl ReportableError for SchedulerError {
    fn get_labels(&self) -> Vec<(usize, String)> {
        match self {
            SchedulerError::Compile { error, .. } => error.get_labels(),
            _ => vec![],
        }
    }
}

/// Compile the streams of one port as seen by core `phase` of `step_mul`
/// cores sharing them.
pub fn compile_streams(
    ctx: &mut Context,
    streams: &[Stream],
    phase: u32,
    step_mul: u32,
) -> Result<Vec<CompiledStream>, SchedulerError> {
    streams
        .iter()
        .map(|s| {
            let res = if step_mul > 1 {
                s.compile_split(ctx, phase, step_mul)
            } else {
                s.compile(ctx)
            };
            res.map_err(|error| SchedulerError::Compile {
                stream_id: s.id,
                error,
            })
        })
        .collect()
}

/// Timing checks done before a stream is armed. Every gap a node can add to
/// its clock must be finite and the packet rate positive.
fn check_timing(stream: &CompiledStream) -> Result<(), SchedulerError> {
    let stream_id = stream.id;
    if !(stream.pps.is_finite() && stream.pps > 0.0) {
        return Err(SchedulerError::InvalidRate {
            stream_id,
            pps: stream.pps,
        });
    }
    let ibg_usec = match stream.mode {
        StreamMode::MultiBurst { ibg_usec, .. } => ibg_usec,
        _ => 0.0,
    };
    for (gap, usec) in [("inter-stream", stream.isg_usec), ("inter-burst", ibg_usec)] {
        if !(usec.is_finite() && usec >= 0.0) {
            return Err(SchedulerError::InvalidGap {
                stream_id,
                gap,
                usec,
            });
        }
    }
    match stream.bursts() {
        Some((packets, bursts)) if packets == 0 || bursts == 0 => {
            Err(SchedulerError::EmptyBurst { stream_id })
        }
        _ => Ok(()),
    }
}

/// Control plane requests, applied between two firings.
#[derive(Debug, Clone)]
pub enum CoreCommand {
    Start {
        port: u8,
        streams: Vec<CompiledStream>,
        /// Seconds until the port is stopped.
        duration: Option<f64>,
        event_id: u32,
    },
    Stop {
        port: u8,
        /// Only stop if the port still runs this event.
        event_id: Option<u32>,
    },
    Pause {
        port: u8,
    },
    Resume {
        port: u8,
    },
    PauseStreams {
        port: u8,
        stream_ids: Vec<u32>,
    },
    ResumeStreams {
        port: u8,
        stream_ids: Vec<u32>,
    },
    UpdateRate {
        port: u8,
        factor: f64,
    },
    UpdateStreams {
        port: u8,
        ipg_usec: HashMap<u32, f64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoreState {
    #[default]
    Idle,
    Transmitting,
}

#[derive(Debug, Clone, Copy)]
enum EventKind {
    Stream(NodeKey),
    StopPort { port: u8, event_id: u32 },
}

/// Entry of the event heap, ordered by time then by insertion.
#[derive(Debug, Clone, Copy)]
struct Event {
    when: Time,
    seq: u64,
    kind: EventKind,
}
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        (self.when, self.seq) == (other.when, other.seq)
    }
}
impl Eq for Event {}
impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.when, self.seq).cmp(&(other.when, other.seq))
    }
}

fn is_selected(stream_ids: Option<&[u32]>, node: &StreamNode) -> bool {
    stream_ids.is_none_or(|ids| ids.contains(&node.stream_id()))
}

/// Stream scheduler of one data-plane core.
pub struct DpCore {
    thread_id: u8,
    state: CoreState,
    now: Time,
    nodes: SlotMap<NodeKey, StreamNode>,
    events: BinaryHeap<Reverse<Event>>,
    seq: u64,
    ports: Vec<Port>,
    port_events: Vec<PortEvent>,
    receiver: Option<mpsc::Receiver<CoreCommand>>,
}

impl DpCore {
    pub fn new(thread_id: u8, num_ports: u8) -> Self {
        Self {
            thread_id,
            state: CoreState::Idle,
            now: Time::ZERO,
            nodes: SlotMap::with_key(),
            events: BinaryHeap::new(),
            seq: 0,
            ports: (0..num_ports).map(|_| Port::default()).collect(),
            port_events: vec![],
            receiver: None,
        }
    }

    /// A core fed through a command channel, polled by
    /// [`run_until`](Self::run_until).
    pub fn with_channel(thread_id: u8, num_ports: u8) -> (Self, mpsc::Sender<CoreCommand>) {
        let (sender, receiver) = mpsc::channel();
        let mut core = Self::new(thread_id, num_ports);
        core.receiver = Some(receiver);
        (core, sender)
    }

    pub fn thread_id(&self) -> u8 {
        self.thread_id
    }
    pub fn state(&self) -> CoreState {
        self.state
    }
    pub fn now(&self) -> Time {
        self.now
    }
    pub fn port(&self, port: u8) -> Option<&Port> {
        self.ports.get(port as usize)
    }
    pub fn node(&self, key: NodeKey) -> Option<&StreamNode> {
        self.nodes.get(key)
    }
    /// Nodes still held by the core, including stopped ones not yet popped.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }
    pub fn next_event_time(&self) -> Option<Time> {
        self.events.peek().map(|Reverse(e)| e.when)
    }
    pub fn port_nodes(&self, port: u8) -> impl Iterator<Item = &StreamNode> {
        self.port(port)
            .into_iter()
            .flat_map(|p| p.nodes().iter())
            .filter_map(|key| self.nodes.get(*key))
    }
    pub fn take_port_events(&mut self) -> Vec<PortEvent> {
        std::mem::take(&mut self.port_events)
    }

    fn port_mut(&mut self, port: u8) -> Result<&mut Port, SchedulerError> {
        self.ports
            .get_mut(port as usize)
            .ok_or(SchedulerError::UnknownPort(port))
    }

    fn push(&mut self, when: Time, kind: EventKind) {
        self.seq += 1;
        self.events.push(Reverse(Event {
            when,
            seq: self.seq,
            kind,
        }));
    }

    pub fn handle(&mut self, cmd: CoreCommand) -> Result<(), SchedulerError> {
        match cmd {
            CoreCommand::Start {
                port,
                streams,
                duration,
                event_id,
            } => self.start_traffic(port, &streams, duration, event_id),
            CoreCommand::Stop { port, event_id } => self.stop_traffic(port, event_id).map(|_| ()),
            CoreCommand::Pause { port } => self.pause_traffic(port),
            CoreCommand::Resume { port } => self.resume_traffic(port),
            CoreCommand::PauseStreams { port, stream_ids } => self.pause_streams(port, &stream_ids),
            CoreCommand::ResumeStreams { port, stream_ids } => {
                self.resume_streams(port, &stream_ids)
            }
            CoreCommand::UpdateRate { port, factor } => self.update_traffic(port, factor),
            CoreCommand::UpdateStreams { port, ipg_usec } => self.update_streams(port, &ipg_usec),
        }
    }

    /// Apply every command waiting in the channel. Returns how many were read.
    pub fn poll_commands(&mut self) -> usize {
        let Some(receiver) = self.receiver.as_ref() else {
            return 0;
        };
        let commands: Vec<_> = receiver.try_iter().collect();
        let count = commands.len();
        for cmd in commands {
            if let Err(e) = self.handle(cmd) {
                log::error!("core {}: {e}", self.thread_id);
            }
        }
        count
    }

    /// Arm `streams` on an idle port. Self-starting streams fire one
    /// inter-stream gap from now, the others wait for a predecessor.
    pub fn start_traffic(
        &mut self,
        port: u8,
        streams: &[CompiledStream],
        duration: Option<f64>,
        event_id: u32,
    ) -> Result<(), SchedulerError> {
        let state = self.port_mut(port)?.state;
        if state != PortState::Idle {
            return Err(SchedulerError::PortNotIdle { port, state });
        }
        let count = streams.len();
        let bad_next = streams
            .iter()
            .enumerate()
            .find_map(|(index, s)| s.next_stream.filter(|n| *n >= count).map(|next| (index, next)));
        if let Some((index, next)) = bad_next {
            return Err(SchedulerError::InvalidNextStream { index, next, count });
        }
        streams.iter().try_for_each(check_timing)?;

        let now = self.now;
        let keys: Vec<NodeKey> = streams
            .iter()
            .map(|s| self.nodes.insert(StreamNode::new(port, s, self.thread_id, now)))
            .collect();
        let mut active = 0;
        for (key, stream) in keys.iter().zip(streams) {
            let next = stream.next_stream.map(|i| keys[i]);
            let Some(node) = self.nodes.get_mut(*key) else {
                continue;
            };
            node.next = next;
            if node.state() == NodeState::Active {
                active += 1;
                let when = node.time();
                self.push(when, EventKind::Stream(*key));
            }
        }
        let all_paused = !keys.is_empty()
            && keys
                .iter()
                .all(|k| self.nodes.get(*k).is_some_and(StreamNode::is_paused));

        let p = self.port_mut(port)?;
        p.nodes = keys;
        p.active_streams = active;
        p.event_id = event_id;
        p.state = if all_paused {
            PortState::Paused
        } else {
            PortState::Transmitting
        };
        self.state = CoreState::Transmitting;
        self.port_events.push(PortEvent::Started {
            port,
            event_id,
            at: now,
        });
        log::info!(
            "port {port}: started {count} stream(s), {active} self starting, event {event_id}"
        );

        if active == 0 {
            log::warn!("port {port}: no self starting stream, nothing to send");
            self.stop_port(port, None, StopReason::Completed);
        } else if let Some(duration) = duration.filter(|d| *d > 0.0) {
            self.push(
                now + Time::from_secs_f64(duration),
                EventKind::StopPort { port, event_id },
            );
        }
        Ok(())
    }

    /// Stop a port. With `event_id`, only if the port still runs that event.
    /// Returns whether the port was stopped.
    pub fn stop_traffic(&mut self, port: u8, event_id: Option<u32>) -> Result<bool, SchedulerError> {
        self.port_mut(port)?;
        Ok(self.stop_port(port, event_id, StopReason::Command))
    }

    fn stop_port(&mut self, port: u8, event_id: Option<u32>, reason: StopReason) -> bool {
        let Some(p) = self.ports.get_mut(port as usize) else {
            return false;
        };
        if p.is_idle() {
            log::debug!("port {port}: already idle, stop ignored");
            return false;
        }
        if let Some(id) = event_id.filter(|id| *id != p.event_id) {
            log::warn!(
                "port {port}: ignoring stale stop of event {id}, running event {}",
                p.event_id
            );
            return false;
        }
        // queued nodes can only leave the heap from the top, they are
        // dropped when popped
        for key in p.nodes.drain(..) {
            match self.nodes.get(key).map(StreamNode::state) {
                Some(NodeState::Active) => {
                    if let Some(node) = self.nodes.get_mut(key) {
                        node.mark_for_free();
                    }
                }
                Some(_) => {
                    self.nodes.remove(key);
                }
                None => {}
            }
        }
        p.active_streams = 0;
        p.state = PortState::Idle;
        let event_id = p.event_id;
        self.port_events.push(PortEvent::Stopped {
            port,
            event_id,
            reason,
            at: self.now,
        });
        log::info!("port {port}: stopped ({reason:?}), event {event_id}");
        if self.ports.iter().all(Port::is_idle) {
            self.state = CoreState::Idle;
        }
        true
    }

    fn set_pause(&mut self, port: u8, stream_ids: Option<&[u32]>, paused: bool) -> Result<(), SchedulerError> {
        let p = self
            .ports
            .get_mut(port as usize)
            .ok_or(SchedulerError::UnknownPort(port))?;
        if p.is_idle() {
            log::warn!("port {port}: idle, pause/resume ignored");
            return Ok(());
        }
        if paused {
            let burst = p
                .nodes
                .iter()
                .filter_map(|k| self.nodes.get(*k))
                .find(|n| is_selected(stream_ids, n) && !n.is_continuous());
            if let Some(node) = burst {
                return Err(SchedulerError::NotPausable {
                    port,
                    stream_id: node.stream_id(),
                });
            }
        }
        for key in &p.nodes {
            if let Some(node) = self.nodes.get_mut(*key) {
                if is_selected(stream_ids, node) {
                    node.set_pause(paused);
                }
            }
        }
        let all_paused = p
            .nodes
            .iter()
            .filter_map(|k| self.nodes.get(*k))
            .all(StreamNode::is_paused);
        p.state = if all_paused {
            PortState::Paused
        } else {
            PortState::Transmitting
        };
        let what = if paused { "paused" } else { "resumed" };
        match stream_ids {
            Some(ids) => log::info!(
                "port {port}: {what} stream(s) {}, port is {:?}",
                ids.iter().join(","),
                p.state
            ),
            None => log::info!("port {port}: {what}"),
        }
        Ok(())
    }

    /// Suppress sending on every stream of the port; the streams keep
    /// their schedule.
    pub fn pause_traffic(&mut self, port: u8) -> Result<(), SchedulerError> {
        self.set_pause(port, None, true)
    }
    pub fn resume_traffic(&mut self, port: u8) -> Result<(), SchedulerError> {
        self.set_pause(port, None, false)
    }
    pub fn pause_streams(&mut self, port: u8, stream_ids: &[u32]) -> Result<(), SchedulerError> {
        self.set_pause(port, Some(stream_ids), true)
    }
    pub fn resume_streams(&mut self, port: u8, stream_ids: &[u32]) -> Result<(), SchedulerError> {
        self.set_pause(port, Some(stream_ids), false)
    }

    /// Multiply the rate of every stream of the port by `factor`.
    pub fn update_traffic(&mut self, port: u8, factor: f64) -> Result<(), SchedulerError> {
        if !(factor.is_finite() && factor > 0.0) {
            return Err(SchedulerError::InvalidFactor(factor));
        }
        let p = self
            .ports
            .get(port as usize)
            .ok_or(SchedulerError::UnknownPort(port))?;
        if p.is_idle() {
            log::warn!("port {port}: idle, rate update ignored");
            return Ok(());
        }
        for key in &p.nodes {
            if let Some(node) = self.nodes.get_mut(*key) {
                node.update_rate(factor);
            }
        }
        log::info!("port {port}: rate multiplied by {factor}");
        Ok(())
    }

    /// Set an explicit inter-packet gap, in microseconds, per stream id.
    pub fn update_streams(&mut self, port: u8, ipg_usec: &HashMap<u32, f64>) -> Result<(), SchedulerError> {
        let p = self
            .ports
            .get(port as usize)
            .ok_or(SchedulerError::UnknownPort(port))?;
        if let Some((stream_id, usec)) = ipg_usec
            .iter()
            .find(|(_, usec)| !(usec.is_finite() && **usec > 0.0))
        {
            return Err(SchedulerError::InvalidGap {
                stream_id: *stream_id,
                gap: "inter-packet",
                usec: *usec,
            });
        }
        if p.is_idle() {
            log::warn!("port {port}: idle, stream update ignored");
            return Ok(());
        }
        for key in &p.nodes {
            if let Some(node) = self.nodes.get_mut(*key) {
                if let Some(ipg) = ipg_usec.get(&node.stream_id()) {
                    node.set_ipg_ns(ipg * 1e3);
                }
            }
        }
        Ok(())
    }

    /// Process every event due strictly before `end`, then move the clock
    /// to `end`.
    pub fn run_until(&mut self, end: Time, sink: &mut impl PacketSink) {
        loop {
            self.poll_commands();
            let Some(Reverse(event)) = self.events.peek().copied() else {
                break;
            };
            if event.when >= end {
                break;
            }
            self.events.pop();
            self.now = self.now.max(event.when);
            match event.kind {
                EventKind::Stream(key) => self.fire(key, sink),
                EventKind::StopPort { port, event_id } => {
                    self.stop_port(port, Some(event_id), StopReason::Duration);
                }
            }
        }
        self.now = self.now.max(end);
    }

    fn fire(&mut self, key: NodeKey, sink: &mut impl PacketSink) {
        let Some(node) = self.nodes.get_mut(key) else {
            return;
        };
        if node.state() == NodeState::FreeForReuse {
            self.nodes.remove(key);
            return;
        }
        if node.is_emitting() {
            if let Some(mbuf) = node.next_packet() {
                sink.send_node(node, mbuf);
            }
        }
        match node.advance() {
            Firing::Again => {
                let when = node.time();
                self.push(when, EventKind::Stream(key));
            }
            Firing::Done => self.next_stream(key),
        }
    }

    /// Hand over from a node whose last burst just ended.
    fn next_stream(&mut self, cur: NodeKey) {
        let Some(node) = self.nodes.get(cur) else {
            return;
        };
        let (port, next, prev_ns) = (node.port(), node.next, node.time_ns());
        let successor = next.filter(|k| {
            self.nodes
                .get(*k)
                .is_some_and(|n| n.state() == NodeState::Inactive)
        });
        let schedule = successor.and_then(|next| match self.nodes.get_mut(cur) {
            Some(node) if node.action_counter > 0 => {
                node.action_counter -= 1;
                (node.action_counter > 0).then_some(next)
            }
            _ => Some(next),
        });

        if let Some(next) = schedule {
            if let Some(node) = self.nodes.get_mut(next) {
                node.refresh(prev_ns);
                let when = node.time();
                self.push(when, EventKind::Stream(next));
            }
            return;
        }
        let last = self
            .ports
            .get_mut(port as usize)
            .is_some_and(Port::release_stream);
        if last {
            self.stop_port(port, None, StopReason::Completed);
        }
    }
}
