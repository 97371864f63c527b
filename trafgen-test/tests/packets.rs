use trafgen_scheduler::{DpCore, compile_streams};
use trafgen_test::*;
use trafgen_vm::{
    compiler::{
        ChangePacketSize, Context, FixChecksumIpv4, FlowClientVar, FlowOp, FlowVar, IpRange, PortRange,
        StreamVm, WriteToPacket,
    },
    stream::{Stream, StreamMode},
};

fn continuous(vm: StreamVm, pkt: Vec<u8>) -> Stream {
    Stream::new(1, pkt, StreamMode::Continuous, 1000.0).with_vm(vm)
}

#[test]
fn random_ttl_keeps_the_checksum_valid() {
    let vm = StreamVm::new()
        .with(FlowVar::new("ttl", 1, FlowOp::Random, 1, 255))
        .with(WriteToPacket::new("ttl", IPV4_TTL_OFFSET as u16))
        .with(FixChecksumIpv4 {
            pkt_offset: IPV4_OFFSET as u16,
        });
    let stream = continuous(vm, udp_packet(64)).with_seed(7);
    let (_, sink) = play(&[stream], ms(200));
    assert_eq!(sink.sent.len(), 200);
    let pkts: Vec<Vec<u8>> = sink.sent.iter().map(|s| s.mbuf.to_vec()).collect();
    assert!(pkts.iter().all(|p| verify_ipv4_checksum(p, IPV4_OFFSET)));
    assert!(pkts.iter().all(|p| p[IPV4_TTL_OFFSET] >= 1));
    let distinct = pkts
        .iter()
        .map(|p| p[IPV4_TTL_OFFSET])
        .collect::<std::collections::HashSet<_>>();
    assert!(distinct.len() > 50);
    // every packet owns its head
    assert!(!sink.sent[0].mbuf.ptr_eq(&sink.sent[1].mbuf));
}

#[test]
fn pinned_seed_replays_the_same_packets() {
    let vm = StreamVm::new()
        .with(FlowVar::new("r", 2, FlowOp::Random, 0, 60000))
        .with(WriteToPacket::new("r", UDP_OFFSET as u16));
    let stream = continuous(vm, udp_packet(64)).with_seed(99);
    let ports = |sink: &RecordingSink| -> Vec<u16> {
        sink.sent
            .iter()
            .map(|s| be16(&s.mbuf.to_vec(), UDP_OFFSET))
            .collect()
    };
    let (_, a) = play(&[stream.clone()], ms(50));
    let (_, b) = play(&[stream.clone()], ms(50));
    assert_eq!(ports(&a), ports(&b));

    // another core mixes its id into the seed
    let compiled = compile(&stream);
    let mut core = DpCore::new(1, 1);
    core.start_traffic(0, &[compiled], None, 1).unwrap();
    let mut c = RecordingSink::default();
    core.run_until(ms(50), &mut c);
    assert_ne!(ports(&a), ports(&c));
}

#[test]
fn client_addresses_carry_into_the_port() {
    let min_ip = u32::from_be_bytes([16, 0, 0, 1]);
    let vm = StreamVm::new()
        .with(FlowClientVar {
            name: "client".to_string(),
            ip: IpRange::new(min_ip, min_ip + 9),
            port: PortRange {
                min: 1025,
                max: 65535,
                step: 0,
            },
            flow_limit: None,
            unlimited: false,
        })
        .with(WriteToPacket::new("client.ip", IPV4_SRC_OFFSET as u16))
        .with(WriteToPacket::new("client.port", UDP_OFFSET as u16))
        .with(FixChecksumIpv4 {
            pkt_offset: IPV4_OFFSET as u16,
        });
    let (_, sink) = play(&[continuous(vm, udp_packet(64))], ms(12));
    let pairs: Vec<(u32, u16)> = sink
        .sent
        .iter()
        .map(|s| {
            let p = s.mbuf.to_vec();
            assert!(verify_ipv4_checksum(&p, IPV4_OFFSET));
            (be32(&p, IPV4_SRC_OFFSET) - min_ip, be16(&p, UDP_OFFSET))
        })
        .collect();
    let mut expected: Vec<(u32, u16)> = (0..10).map(|i| (i, 1025)).collect();
    expected.extend([(0, 1026), (1, 1026)]);
    assert_eq!(pairs, expected);
}

#[test]
fn packet_size_follows_the_variable_and_shares_the_tail() {
    let vm = StreamVm::new()
        .with(FlowVar::new("len", 2, FlowOp::Inc, 100, 102))
        .with(ChangePacketSize {
            var_name: "len".to_string(),
        });
    let pkt: Vec<u8> = (0..1000).map(|i| i as u8).collect();
    let (_, sink) = play(&[continuous(vm, pkt.clone())], ms(4));
    let lens: Vec<usize> = sink.sent.iter().map(|s| s.mbuf.len()).collect();
    assert_eq!(lens, vec![100, 101, 102, 100]);
    let first = &sink.sent[0].mbuf;
    assert_eq!(first.head().len(), 64);
    assert_eq!(first.to_vec(), pkt[..100].to_vec());
    assert!(sink.sent.iter().all(|s| same_tail(&s.mbuf, first)));
}

#[test]
fn cache_replays_prerendered_packets() {
    let vm = StreamVm::new()
        .with(FlowVar::new("id", 2, FlowOp::Inc, 0, 999))
        .with(WriteToPacket::new("id", UDP_OFFSET as u16 + 8));
    let mut stream = continuous(vm, udp_packet(64));
    stream.cache_size = 4;
    let (_, sink) = play(&[stream], ms(10));
    let ids: Vec<u16> = sink
        .sent
        .iter()
        .map(|s| be16(&s.mbuf.to_vec(), UDP_OFFSET + 8))
        .collect();
    assert_eq!(ids, vec![0, 1, 2, 3, 0, 1, 2, 3, 0, 1]);
    assert!(sink.sent[1].mbuf.ptr_eq(&sink.sent[5].mbuf));
}

#[test]
fn cores_split_a_counter_without_overlap() {
    let vm = StreamVm::new()
        .with(FlowVar::new("id", 2, FlowOp::Inc, 0, 99))
        .with(WriteToPacket::new("id", UDP_OFFSET as u16 + 8));
    let streams = [continuous(vm, udp_packet(64))];
    let mut ctx = Context::default();
    let mut seen = vec![];
    for core_id in 0..4u8 {
        let compiled = compile_streams(&mut ctx, &streams, core_id as u32, 4).unwrap();
        let mut core = DpCore::new(core_id, 1);
        core.start_traffic(0, &compiled, None, 1).unwrap();
        let mut sink = RecordingSink::default();
        core.run_until(ms(25), &mut sink);
        assert_eq!(sink.sent.len(), 25);
        seen.extend(
            sink.sent
                .iter()
                .map(|s| be16(&s.mbuf.to_vec(), UDP_OFFSET + 8)),
        );
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..100).collect::<Vec<u16>>());
}
