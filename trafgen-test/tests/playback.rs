use std::{sync::mpsc, thread};

use trafgen_scheduler::{CoreCommand, DpCore, PortEvent, PortState, StopReason};
use trafgen_test::*;
use trafgen_vm::stream::{Stream, StreamMode};

fn burst(id: u32, packets: u32, pps: f64) -> Stream {
    Stream::new(id, udp_packet(64), StreamMode::SingleBurst { packets }, pps)
}

#[test]
fn chain_loops_until_action_count_runs_out() {
    // a -> b -> a, a may be re-entered twice
    let a = burst(1, 2, 1000.0).with_next(1);
    let mut b = burst(2, 1, 1000.0).with_next(0).with_self_start(false);
    b.action_count = 3;
    let (core, sink) = play(&[a, b], ms(1000));
    let ids: Vec<u32> = sink.sent.iter().map(|s| s.stream_id).collect();
    assert_eq!(ids, vec![1, 1, 2, 1, 1, 2, 1, 1, 2]);
    assert!(core.port(0).unwrap().is_idle());
}

#[test]
fn unbounded_loop_never_completes() {
    let a = burst(1, 1, 1000.0).with_next(0).with_isg_usec(1000.0);
    let (core, sink) = play(&[a], ms(100));
    // the gap also delays the first packet
    assert_eq!(sink.sent.len(), 99);
    assert_eq!(core.port(0).unwrap().state(), PortState::Transmitting);
}

#[test]
fn successor_already_running_ends_the_chain() {
    // both self start, a hands over to b which is busy
    let a = burst(1, 1, 1000.0).with_next(1);
    let b = burst(2, 5, 1000.0);
    let (mut core, sink) = play(&[a, b], ms(1000));
    assert_eq!(sink.of_stream(1).count(), 1);
    assert_eq!(sink.of_stream(2).count(), 5);
    let stops: Vec<_> = core
        .take_port_events()
        .into_iter()
        .filter(|e| matches!(e, PortEvent::Stopped { .. }))
        .collect();
    assert_eq!(stops.len(), 1);
}

#[test]
fn streams_armed_paused_wait_for_resume() {
    let mut stream = Stream::new(1, udp_packet(64), StreamMode::Continuous, 10.0);
    stream.start_paused = true;
    let mut core = DpCore::new(0, 1);
    core.start_traffic(0, &[compile(&stream)], None, 1).unwrap();
    assert_eq!(core.port(0).unwrap().state(), PortState::Paused);
    let mut sink = RecordingSink::default();
    core.run_until(ms(500), &mut sink);
    assert!(sink.sent.is_empty());
    core.resume_streams(0, &[1]).unwrap();
    core.run_until(ms(1000), &mut sink);
    assert_eq!(sink.times(), (5..10).map(|i| ms(i * 100)).collect::<Vec<_>>());
}

#[test]
fn null_stream_times_a_chain() {
    let mut gap = burst(1, 1, 1000.0).with_next(1);
    gap.null_stream = true;
    let after = burst(2, 1, 1000.0)
        .with_self_start(false)
        .with_isg_usec(250.0);
    let (core, sink) = play(&[gap, after], ms(1000));
    assert_eq!(sink.sent.len(), 1);
    assert_eq!(sink.sent[0].stream_id, 2);
    assert_eq!(sink.sent[0].time, us(250));
    assert!(core.port(0).unwrap().is_idle());
}

#[test]
fn start_delay_is_the_inter_stream_gap() {
    let stream = burst(1, 2, 1000.0).with_isg_usec(1500.0);
    let (_, sink) = play(&[stream], ms(1000));
    assert_eq!(sink.times(), vec![us(1500), us(2500)]);
}

#[test]
fn commands_from_another_thread() {
    let (mut core, sender) = DpCore::with_channel(0, 2);
    let stream = compile(&Stream::new(7, udp_packet(64), StreamMode::Continuous, 100.0));
    let control = {
        let sender: mpsc::Sender<CoreCommand> = sender.clone();
        thread::spawn(move || {
            sender
                .send(CoreCommand::Start {
                    port: 1,
                    streams: vec![stream],
                    duration: Some(0.1),
                    event_id: 42,
                })
                .unwrap();
        })
    };
    control.join().unwrap();

    let mut sink = RecordingSink::default();
    core.run_until(ms(1000), &mut sink);
    assert_eq!(sink.sent.len(), 10);
    assert!(sink.sent.iter().all(|s| s.port == 1));
    assert_eq!(
        core.take_port_events(),
        vec![
            PortEvent::Started {
                port: 1,
                event_id: 42,
                at: trafgen_scheduler::Time::ZERO
            },
            PortEvent::Stopped {
                port: 1,
                event_id: 42,
                reason: StopReason::Duration,
                at: ms(100)
            }
        ]
    );
    assert!(core.port(0).unwrap().is_idle());
}

#[test]
fn ports_of_one_core_are_independent() {
    let mut core = DpCore::new(0, 2);
    let fast = compile(&Stream::new(1, udp_packet(64), StreamMode::Continuous, 100.0));
    let short = compile(&burst(2, 3, 100.0));
    core.start_traffic(0, &[fast], None, 1).unwrap();
    core.start_traffic(1, &[short], None, 2).unwrap();
    let mut sink = RecordingSink::default();
    core.run_until(ms(100), &mut sink);
    assert_eq!(sink.sent.iter().filter(|s| s.port == 0).count(), 10);
    assert_eq!(sink.sent.iter().filter(|s| s.port == 1).count(), 3);
    assert!(core.port(1).unwrap().is_idle());
    assert_eq!(core.state(), trafgen_scheduler::CoreState::Transmitting);
    core.stop_traffic(0, Some(1)).unwrap();
    assert_eq!(core.state(), trafgen_scheduler::CoreState::Idle);
}
