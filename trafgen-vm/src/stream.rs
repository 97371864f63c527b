//! Stream definitions as handed over by the control plane, and their compiled
//! form consumed by the per-core scheduler.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    compiler::{CompileError, Context, StreamVm},
    runtime::vm::Program,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMode {
    Continuous,
    SingleBurst {
        packets: u32,
    },
    MultiBurst {
        packets: u32,
        bursts: u32,
        /// Gap between the last packet of a burst and the first of the next.
        #[serde(default)]
        ibg_usec: f64,
    },
}

impl StreamMode {
    pub fn is_continuous(&self) -> bool {
        matches!(self, StreamMode::Continuous)
    }
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub id: u32,
    pub packet: Vec<u8>,
    #[serde(default)]
    pub vm: StreamVm,
    pub mode: StreamMode,
    pub pps: f64,
    #[serde(default = "yes")]
    pub self_start: bool,
    /// Index (within the same port) of the stream armed when this one ends.
    #[serde(default)]
    pub next_stream: Option<usize>,
    /// Pinned seed of the RANDOM variables; drawn at arm time when absent.
    #[serde(default)]
    pub random_seed: Option<u32>,
    /// Delay before the first packet, also applied when reached through a chain.
    #[serde(default)]
    pub isg_usec: f64,
    /// How many times a chain may re-enter this stream; 0 is unbounded.
    #[serde(default)]
    pub action_count: u16,
    #[serde(default)]
    pub start_paused: bool,
    /// Takes part in chains and timing but never sends.
    #[serde(default)]
    pub null_stream: bool,
    /// Pre-render this many packets at arm time and replay them.
    #[serde(default)]
    pub cache_size: u16,
}

impl Stream {
    pub fn new(id: u32, packet: Vec<u8>, mode: StreamMode, pps: f64) -> Self {
        Self {
            id,
            packet,
            vm: StreamVm::new(),
            mode,
            pps,
            self_start: true,
            next_stream: None,
            random_seed: None,
            isg_usec: 0.0,
            action_count: 0,
            start_paused: false,
            null_stream: false,
            cache_size: 0,
        }
    }
    pub fn with_vm(mut self, vm: StreamVm) -> Self {
        self.vm = vm;
        self
    }
    pub fn with_next(mut self, next: usize) -> Self {
        self.next_stream = Some(next);
        self
    }
    pub fn with_self_start(mut self, self_start: bool) -> Self {
        self.self_start = self_start;
        self
    }
    pub fn with_seed(mut self, seed: u32) -> Self {
        self.random_seed = Some(seed);
        self
    }
    pub fn with_isg_usec(mut self, isg_usec: f64) -> Self {
        self.isg_usec = isg_usec;
        self
    }

    pub fn compile(&self, ctx: &mut Context) -> Result<CompiledStream, CompileError> {
        self.compile_vm(ctx, &self.vm)
    }

    /// Compile the share of this stream sent by core `phase` of `step_mul`.
    pub fn compile_split(
        &self,
        ctx: &mut Context,
        phase: u32,
        step_mul: u32,
    ) -> Result<CompiledStream, CompileError> {
        self.compile_vm(ctx, &self.vm.split(phase, step_mul))
    }

    fn compile_vm(&self, ctx: &mut Context, vm: &StreamVm) -> Result<CompiledStream, CompileError> {
        let program = if vm.is_empty() {
            None
        } else {
            Some(Arc::new(ctx.compile_packet(vm, &self.packet)?))
        };
        let suffix = program
            .as_ref()
            .map(|p| p.prefix_size as usize)
            .filter(|prefix| *prefix < self.packet.len())
            .map(|prefix| Arc::from(&self.packet[prefix..]));
        Ok(CompiledStream {
            id: self.id,
            packet: Arc::from(self.packet.as_slice()),
            program,
            suffix,
            mode: self.mode,
            pps: self.pps,
            self_start: self.self_start,
            next_stream: self.next_stream,
            random_seed: self.random_seed,
            isg_usec: self.isg_usec,
            action_count: self.action_count,
            start_paused: self.start_paused,
            null_stream: self.null_stream,
            cache_size: self.cache_size,
        })
    }
}

/// Immutable, shareable result of compiling a [`Stream`].
#[derive(Debug, Clone)]
pub struct CompiledStream {
    pub id: u32,
    pub packet: Arc<[u8]>,
    pub program: Option<Arc<Program>>,
    /// Read-only packet bytes past the writable prefix, shared by every
    /// playback instance of a VM stream.
    pub suffix: Option<Arc<[u8]>>,
    pub mode: StreamMode,
    pub pps: f64,
    pub self_start: bool,
    pub next_stream: Option<usize>,
    pub random_seed: Option<u32>,
    pub isg_usec: f64,
    pub action_count: u16,
    pub start_paused: bool,
    pub null_stream: bool,
    pub cache_size: u16,
}

impl CompiledStream {
    /// Inter-packet gap in nanoseconds.
    pub fn ipg_nsec(&self) -> f64 {
        1e9 / self.pps
    }
    pub fn isg_nsec(&self) -> f64 {
        self.isg_usec * 1e3
    }
    pub fn ibg_nsec(&self) -> f64 {
        match self.mode {
            StreamMode::MultiBurst { ibg_usec, .. } => ibg_usec * 1e3,
            _ => 0.0,
        }
    }
    /// Packets per burst and number of bursts; `None` for continuous streams.
    pub fn bursts(&self) -> Option<(u32, u32)> {
        match self.mode {
            StreamMode::Continuous => None,
            StreamMode::SingleBurst { packets } => Some((packets, 1)),
            StreamMode::MultiBurst { packets, bursts, .. } => Some((packets, bursts)),
        }
    }
    /// Bytes copied into a fresh buffer for every packet of a VM stream.
    pub fn prefix(&self) -> &[u8] {
        match &self.program {
            Some(p) => &self.packet[..(p.prefix_size as usize).min(self.packet.len())],
            None => &self.packet,
        }
    }
}
