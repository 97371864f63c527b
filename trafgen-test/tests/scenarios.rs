use trafgen_scheduler::{CoreState, PortEvent, PortState, StopReason};
use trafgen_test::*;
use trafgen_vm::stream::{Stream, StreamMode};

fn stops(events: &[PortEvent]) -> Vec<StopReason> {
    events
        .iter()
        .filter_map(|e| match e {
            PortEvent::Stopped { reason, .. } => Some(*reason),
            _ => None,
        })
        .collect()
}

#[test]
fn constant_stream_reuses_one_buffer() {
    let stream = Stream::new(1, udp_packet(64), StreamMode::Continuous, 1000.0);
    let (core, sink) = play(&[stream], ms(1000));
    assert_eq!(sink.sent.len(), 1000);
    let first = &sink.sent[0].mbuf;
    assert!(sink.sent.iter().all(|s| s.mbuf.ptr_eq(first)));
    assert_eq!(sink.sent[999].time, ms(999));
    assert_eq!(core.port(0).unwrap().state(), PortState::Transmitting);
}

#[test]
fn multi_burst_sends_three_clusters() {
    let mode = StreamMode::MultiBurst {
        packets: 10,
        bursts: 3,
        ibg_usec: 1000.0,
    };
    let stream = Stream::new(1, udp_packet(64), mode, 10_000.0);
    let (mut core, sink) = play(&[stream], ms(1000));
    let times = sink.times();
    assert_eq!(times.len(), 30);

    let gaps: Vec<u64> = times.windows(2).map(|w| w[1].0 - w[0].0).collect();
    let cluster_breaks: Vec<usize> = gaps
        .iter()
        .enumerate()
        .filter(|(_, g)| **g > us(100).0)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(cluster_breaks, vec![9, 19]);
    assert!(cluster_breaks.iter().all(|i| gaps[*i] >= ms(1).0));
    assert_eq!(times[10], us(1900));

    let events = core.take_port_events();
    assert_eq!(stops(&events), vec![StopReason::Completed]);
    assert_eq!(core.state(), CoreState::Idle);
}

#[test]
fn chained_bursts_run_back_to_back() {
    let a = Stream::new(1, udp_packet(64), StreamMode::SingleBurst { packets: 5 }, 1000.0).with_next(1);
    let b = Stream::new(2, udp_packet(64), StreamMode::SingleBurst { packets: 3 }, 1000.0)
        .with_self_start(false)
        .with_isg_usec(200.0);
    let compiled = [compile(&a), compile(&b)];

    let mut core = trafgen_scheduler::DpCore::new(0, 1);
    core.start_traffic(0, &compiled, None, 1).unwrap();
    let mut sink = RecordingSink::default();
    core.run_until(us(4100), &mut sink);
    assert_eq!(sink.of_stream(1).count(), 5);
    assert_eq!(sink.of_stream(2).count(), 0);
    assert_eq!(core.port(0).unwrap().state(), PortState::Transmitting);

    core.run_until(ms(1000), &mut sink);
    let b_times: Vec<_> = sink.of_stream(2).map(|s| s.time).collect();
    assert_eq!(b_times, vec![us(4200), us(5200), us(6200)]);
    let ids: Vec<u32> = sink.sent.iter().map(|s| s.stream_id).collect();
    assert_eq!(ids, vec![1, 1, 1, 1, 1, 2, 2, 2]);

    assert!(core.port(0).unwrap().is_idle());
    let events = core.take_port_events();
    assert_eq!(
        events.last(),
        Some(&PortEvent::Stopped {
            port: 0,
            event_id: 1,
            reason: StopReason::Completed,
            at: us(6200)
        })
    );
}

#[test]
fn paused_stream_keeps_ticking() {
    let stream = Stream::new(1, udp_packet(64), StreamMode::Continuous, 100.0);
    let mut core = trafgen_scheduler::DpCore::new(0, 1);
    core.start_traffic(0, &[compile(&stream)], None, 1).unwrap();
    let mut sink = RecordingSink::default();
    core.run_until(ms(95), &mut sink);
    assert_eq!(sink.sent.len(), 10);

    core.pause_traffic(0).unwrap();
    core.run_until(ms(495), &mut sink);
    assert_eq!(sink.sent.len(), 10);
    assert_eq!(core.next_event_time(), Some(ms(500)));

    core.resume_traffic(0).unwrap();
    sink.clear();
    core.run_until(ms(595), &mut sink);
    assert_eq!(sink.times(), (50..60).map(|i| ms(i * 10)).collect::<Vec<_>>());
}
