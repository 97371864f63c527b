use std::sync::Arc;

use rand::{RngCore, rngs::OsRng};
use trafgen_vm::{
    runtime::{Time, fastrand::mix_seed, vm::Program},
    stream::{CompiledStream, StreamMode},
};

use crate::{Mbuf, NodeKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Queued in the event heap of its core.
    Active,
    /// Armed but not queued: waiting for a predecessor, or done.
    Inactive,
    /// Released by a stop; dropped the next time it is popped.
    FreeForReuse,
}

#[derive(Debug)]
enum PacketSource {
    /// No program: every packet is the same buffer.
    Const(Mbuf),
    Vm {
        program: Arc<Program>,
        bss: Box<[u8]>,
        prefix: Box<[u8]>,
        suffix: Option<Arc<[u8]>>,
    },
    /// Packets rendered once at arm time, replayed in a loop.
    Cached { mbufs: Box<[Mbuf]>, cursor: usize },
}

impl PacketSource {
    fn new(stream: &CompiledStream, thread_id: u8) -> Self {
        let Some(program) = stream.program.clone() else {
            return PacketSource::Const(Mbuf::new(stream.packet.clone()));
        };
        let mut bss = program.new_bss();
        if program.is_random_seed {
            let seed = stream.random_seed.unwrap_or_else(|| OsRng.next_u32());
            program.set_random_seed(&mut bss, mix_seed(seed, thread_id));
        }
        let mut source = PacketSource::Vm {
            program,
            bss,
            prefix: Box::from(stream.prefix()),
            suffix: stream.suffix.clone(),
        };
        if stream.cache_size > 0 {
            let mbufs = (0..stream.cache_size)
                .filter_map(|_| source.next_packet())
                .collect();
            source = PacketSource::Cached { mbufs, cursor: 0 };
        }
        source
    }

    fn next_packet(&mut self) -> Option<Mbuf> {
        match self {
            PacketSource::Const(mbuf) => Some(mbuf.clone()),
            PacketSource::Vm {
                program,
                bss,
                prefix,
                suffix,
            } => {
                let mut head = prefix.to_vec();
                let full_len = head.len() + suffix.as_ref().map_or(0, |s| s.len());
                let pkt_len = match program.run(bss, &mut head) {
                    0 => full_len,
                    len => len as usize,
                };
                Some(Mbuf::chained(Arc::from(head), suffix.clone(), pkt_len))
            }
            PacketSource::Cached { mbufs, cursor } => {
                let mbuf = mbufs.get(*cursor)?.clone();
                *cursor = (*cursor + 1) % mbufs.len();
                Some(mbuf)
            }
        }
    }
}

/// Smallest step a node clock takes between two firings, so that a run
/// always moves forward.
pub const MIN_GAP_NS: f64 = 1.0;

/// Outcome of one firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Firing {
    /// Queue the node again at its new time.
    Again,
    /// Last packet of the last burst went out; the node is now inactive.
    Done,
}

/// Playback state of one stream on one port of one core.
#[derive(Debug)]
pub struct StreamNode {
    port: u8,
    stream_id: u32,
    mode: StreamMode,
    state: NodeState,
    pub(crate) next: Option<NodeKey>,
    /// Firing time in nanoseconds. Kept fractional so that gaps which are not
    /// a whole number of nanoseconds do not drift.
    time_ns: f64,
    ipg_ns: f64,
    isg_ns: f64,
    ibg_ns: f64,
    single_burst: u32,
    single_burst_refill: u32,
    multi_bursts: u32,
    multi_bursts_refill: u32,
    pub(crate) action_counter: u16,
    paused: bool,
    null_stream: bool,
    source: Option<PacketSource>,
}

impl StreamNode {
    /// Arm `stream` on `port`, first firing `isg` after `now`.
    pub fn new(port: u8, stream: &CompiledStream, thread_id: u8, now: Time) -> Self {
        let (single_burst, multi_bursts) = stream.bursts().unwrap_or((0, 0));
        let state = if stream.self_start {
            NodeState::Active
        } else {
            NodeState::Inactive
        };
        Self {
            port,
            stream_id: stream.id,
            mode: stream.mode,
            state,
            next: None,
            time_ns: now.as_nanos() as f64 + stream.isg_nsec(),
            ipg_ns: stream.ipg_nsec(),
            isg_ns: stream.isg_nsec(),
            ibg_ns: stream.ibg_nsec(),
            single_burst,
            single_burst_refill: single_burst,
            multi_bursts,
            multi_bursts_refill: multi_bursts,
            action_counter: stream.action_count,
            paused: stream.start_paused,
            null_stream: stream.null_stream,
            source: Some(PacketSource::new(stream, thread_id)),
        }
    }

    pub fn port(&self) -> u8 {
        self.port
    }
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }
    pub fn state(&self) -> NodeState {
        self.state
    }
    pub fn is_continuous(&self) -> bool {
        self.mode.is_continuous()
    }
    pub fn time(&self) -> Time {
        Time(self.time_ns.round() as u64)
    }
    pub(crate) fn time_ns(&self) -> f64 {
        self.time_ns
    }
    pub fn ipg_ns(&self) -> f64 {
        self.ipg_ns
    }
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Paused and null streams keep their schedule but send nothing.
    pub fn is_emitting(&self) -> bool {
        !(self.paused || self.null_stream)
    }

    pub fn set_pause(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Scale the packet rate; the already scheduled firing is kept.
    pub fn update_rate(&mut self, factor: f64) {
        self.ipg_ns /= factor;
    }

    pub fn set_ipg_ns(&mut self, ipg_ns: f64) {
        self.ipg_ns = ipg_ns;
    }

    /// Packet to send for the current firing.
    pub fn next_packet(&mut self) -> Option<Mbuf> {
        self.source.as_mut()?.next_packet()
    }

    /// Advance the burst counters and the firing time past the packet just
    /// sent.
    pub fn advance(&mut self) -> Firing {
        if self.is_continuous() {
            self.time_ns += self.ipg_ns.max(MIN_GAP_NS);
            return Firing::Again;
        }
        self.single_burst = self.single_burst.saturating_sub(1);
        if self.single_burst > 0 {
            self.time_ns += self.ipg_ns.max(MIN_GAP_NS);
            return Firing::Again;
        }
        self.multi_bursts = self.multi_bursts.saturating_sub(1);
        if self.multi_bursts == 0 {
            self.state = NodeState::Inactive;
            return Firing::Done;
        }
        self.time_ns += self.ibg_ns;
        self.single_burst = self.single_burst_refill;
        Firing::Again
    }

    /// Rearm an inactive node that a predecessor handed over to, to fire
    /// one inter-stream gap after `prev_ns`. A zero gap still moves the
    /// clock by [`MIN_GAP_NS`], which keeps a loop of chained streams from
    /// firing forever at one instant.
    pub fn refresh(&mut self, prev_ns: f64) {
        self.single_burst = self.single_burst_refill;
        self.multi_bursts = self.multi_bursts_refill;
        self.state = NodeState::Active;
        self.time_ns = prev_ns + self.isg_ns.max(MIN_GAP_NS);
    }

    /// Release the packet buffers and the BSS.
    pub fn mark_for_free(&mut self) {
        self.state = NodeState::FreeForReuse;
        self.next = None;
        self.source = None;
    }
}
