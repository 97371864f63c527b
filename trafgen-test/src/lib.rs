use std::sync::Arc;

use trafgen_scheduler::{DpCore, Mbuf, PacketSink, Time, node::StreamNode};
use trafgen_vm::{
    compiler::Context,
    runtime::vm::checksum::fix_ipv4_checksum,
    stream::{CompiledStream, Stream},
    utils::error::{ReportableError, report},
};

pub use trafgen_vm::runtime::vm::checksum::verify_ipv4_checksum;

/// One packet handed to [`RecordingSink`].
#[derive(Debug, Clone)]
pub struct Sent {
    pub port: u8,
    pub stream_id: u32,
    pub time: Time,
    pub mbuf: Mbuf,
}

/// Keeps every packet the core sends.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub sent: Vec<Sent>,
}

impl PacketSink for RecordingSink {
    fn send_node(&mut self, node: &StreamNode, mbuf: Mbuf) {
        self.sent.push(Sent {
            port: node.port(),
            stream_id: node.stream_id(),
            time: node.time(),
            mbuf,
        });
    }
}

impl RecordingSink {
    pub fn times(&self) -> Vec<Time> {
        self.sent.iter().map(|s| s.time).collect()
    }
    pub fn of_stream(&self, id: u32) -> impl Iterator<Item = &Sent> {
        self.sent.iter().filter(move |s| s.stream_id == id)
    }
    pub fn clear(&mut self) {
        self.sent.clear();
    }
}

pub fn ms(v: u64) -> Time {
    Time(v * 1_000_000)
}
pub fn us(v: u64) -> Time {
    Time::from_usec(v)
}

/// Compile one stream, printing the report of the failure before panicking.
pub fn compile(stream: &Stream) -> CompiledStream {
    compile_with(&mut Context::default(), stream)
}

pub fn compile_with(ctx: &mut Context, stream: &Stream) -> CompiledStream {
    match stream.compile(ctx) {
        Ok(compiled) => compiled,
        Err(e) => {
            let errs: Vec<Box<dyn ReportableError>> = vec![Box::new(e)];
            report(&stream.vm.to_string(), &errs);
            panic!("stream {} failed to compile", stream.id);
        }
    }
}

/// Start `streams` on port 0 of a fresh core and play them until `end`.
pub fn play(streams: &[Stream], end: Time) -> (DpCore, RecordingSink) {
    let compiled: Vec<_> = streams.iter().map(compile).collect();
    let mut core = DpCore::new(0, 1);
    if let Err(e) = core.start_traffic(0, &compiled, None, 1) {
        panic!("start failed: {e}");
    }
    let mut sink = RecordingSink::default();
    core.run_until(end, &mut sink);
    (core, sink)
}

pub const ETH_LEN: usize = 14;
pub const IPV4_OFFSET: usize = ETH_LEN;
pub const IPV4_SRC_OFFSET: usize = IPV4_OFFSET + 12;
pub const IPV4_TTL_OFFSET: usize = IPV4_OFFSET + 8;
pub const UDP_OFFSET: usize = IPV4_OFFSET + 20;

/// Ethernet + IPv4 + UDP packet of `len` bytes with a valid IPv4 checksum.
pub fn udp_packet(len: usize) -> Vec<u8> {
    let mut pkt = vec![0u8; len.max(UDP_OFFSET + 8)];
    pkt[..12].copy_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
    pkt[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
    let ip_len = (pkt.len() - ETH_LEN) as u16;
    let ip = &mut pkt[IPV4_OFFSET..UDP_OFFSET];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&ip_len.to_be_bytes());
    ip[8] = 64;
    ip[9] = 17;
    ip[12..16].copy_from_slice(&[16, 0, 0, 1]);
    ip[16..20].copy_from_slice(&[48, 0, 0, 1]);
    fix_ipv4_checksum(&mut pkt, IPV4_OFFSET);
    let udp = &mut pkt[UDP_OFFSET..UDP_OFFSET + 8];
    udp[0..2].copy_from_slice(&1025u16.to_be_bytes());
    udp[2..4].copy_from_slice(&12u16.to_be_bytes());
    udp[4..6].copy_from_slice(&(ip_len - 20).to_be_bytes());
    pkt
}

pub fn be16(pkt: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([pkt[offset], pkt[offset + 1]])
}
pub fn be32(pkt: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([pkt[offset], pkt[offset + 1], pkt[offset + 2], pkt[offset + 3]])
}

pub fn same_tail(a: &Mbuf, b: &Mbuf) -> bool {
    match (a.tail(), b.tail()) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}
