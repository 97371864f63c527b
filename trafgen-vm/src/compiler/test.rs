use super::*;
use crate::runtime::vm::OpCode;
use super::bytecodegen::calc_prefix_size;
use crate::utils::error::dump_to_string;

fn compile_err(vm: StreamVm, pkt_len: usize) -> CompileError {
    compile(&vm, &vec![0u8; pkt_len]).unwrap_err()
}

fn inc(name: &str, size: u8) -> FlowVar {
    FlowVar::new(name, size, FlowOp::Inc, 0, 10)
}

#[test]
fn duplicate_variable() {
    let vm = StreamVm::new().with(inc("a", 1)).with(inc("a", 2));
    assert_eq!(
        compile_err(vm, 64),
        CompileError(ErrorKind::DuplicateVariable("a".into()), 1)
    );
}

#[test]
fn duplicate_client_variable() {
    let client = FlowClientVar {
        name: "c".into(),
        ip: IpRange::new(1, 10),
        port: PortRange::default(),
        flow_limit: None,
        unlimited: false,
    };
    let vm = StreamVm::new().with(client.clone()).with(client);
    assert_eq!(compile_err(vm, 64).kind(), &ErrorKind::DuplicateVariable("c".into()));
}

#[test]
fn unknown_variable_points_at_user() {
    let vm = StreamVm::new()
        .with(inc("a", 1))
        .with(WriteToPacket::new("b", 0));
    let err = compile_err(vm, 64);
    assert_eq!(err, CompileError(ErrorKind::UnknownVariable("b".into()), 1));
    assert_eq!(err.to_string(), "instruction id '1': variable 'b' is not declared");
    let errs: Vec<Box<dyn ReportableError>> = vec![
        Box::new(err),
        Box::new(compile_err(StreamVm::new(), 64)),
    ];
    assert_eq!(
        dump_to_string(&errs),
        "instruction id '1': variable 'b' is not declared\ninstruction id '0': a stream program needs at least one variable or client generator"
    );
}

#[test]
fn use_before_declaration() {
    let vm = StreamVm::new()
        .with(WriteToPacket::new("a", 0))
        .with(inc("a", 1));
    assert_eq!(
        compile_err(vm, 64),
        CompileError(ErrorKind::UseBeforeDeclaration("a".into()), 0)
    );
}

#[test]
fn invalid_size() {
    let vm = StreamVm::new().with(inc("a", 3));
    assert_eq!(compile_err(vm, 64), CompileError(ErrorKind::InvalidSize(3), 0));
}

#[test]
fn range_checks() {
    let empty = StreamVm::new().with(FlowVar::new("a", 1, FlowOp::Inc, 5, 5));
    assert_eq!(
        compile_err(empty, 64).kind(),
        &ErrorKind::InvalidRange { min: 5, max: 5 }
    );
    let wide = StreamVm::new().with(FlowVar::new("a", 1, FlowOp::Inc, 0, 256));
    assert_eq!(
        compile_err(wide, 64).kind(),
        &ErrorKind::ValueTooWide { value: 256, size: 1 }
    );
    let init = StreamVm::new().with(inc("a", 1).with_init(11));
    assert_eq!(
        compile_err(init, 64).kind(),
        &ErrorKind::InitOutOfRange {
            init: 11,
            min: 0,
            max: 10
        }
    );
}

#[test]
fn rand_limit_checks() {
    let limit = |limit| {
        StreamVm::new().with(FlowVarRandLimit {
            name: "r".into(),
            size: 1,
            limit,
            seed: 1,
            min: 0,
            max: 100,
        })
    };
    assert_eq!(
        compile_err(limit(0), 64).kind(),
        &ErrorKind::InvalidLimit { limit: 0, max: 255 }
    );
    assert_eq!(
        compile_err(limit(300), 64).kind(),
        &ErrorKind::InvalidLimit {
            limit: 300,
            max: 255
        }
    );
    assert!(compile(&limit(255), &[0u8; 64]).is_ok());
}

#[test]
fn client_step_must_fit_the_range() {
    let mut ip = IpRange::new(1, 4);
    ip.step = 5;
    let vm = StreamVm::new().with(FlowClientVar {
        name: "c".into(),
        ip,
        port: PortRange::default(),
        flow_limit: None,
        unlimited: false,
    });
    assert_eq!(
        compile_err(vm, 64).kind(),
        &ErrorKind::InvalidStep { step: 5, range: 4 }
    );
}

#[test]
fn bss_overflow_is_attributed_to_the_overflowing_variable() {
    let vm: StreamVm = (0..9)
        .map(|i| Instruction::from(FlowVar::new(format!("v{i}"), 8, FlowOp::Inc, 0, 10)))
        .collect();
    assert_eq!(
        compile_err(vm, 64),
        CompileError(ErrorKind::BssOverflow { size: 72, max: 64 }, 8)
    );
}

#[test]
fn write_past_end_of_packet() {
    let vm = StreamVm::new()
        .with(inc("a", 4))
        .with(WriteToPacket::new("a", 62));
    assert_eq!(
        compile_err(vm, 64),
        CompileError(
            ErrorKind::PacketOffsetOutOfRange {
                offset: 62,
                len: 4,
                pkt_len: 64
            },
            1
        )
    );
}

#[test]
fn write_past_writable_limit() {
    let vm = StreamVm::new()
        .with(inc("a", 2))
        .with(WriteToPacket::new("a", 14))
        .with(WriteToPacket::new("a", 600));
    assert_eq!(
        compile_err(vm, 1000),
        CompileError(ErrorKind::MaxPacketOffset { offset: 602, max: 512 }, 2)
    );
}

#[test]
fn write_mask_checks() {
    let mask = |pkt_cast_size, shift| {
        StreamVm::new().with(inc("a", 2)).with(WriteMaskToPacket {
            var_name: "a".into(),
            pkt_offset: 0,
            pkt_cast_size,
            mask: 0xFF,
            shift,
            add_value: 0,
            big_endian: true,
        })
    };
    assert_eq!(compile_err(mask(3, 0), 64).kind(), &ErrorKind::InvalidCastSize(3));
    assert_eq!(compile_err(mask(2, 32), 64).kind(), &ErrorKind::InvalidShift(32));
    assert!(compile(&mask(4, -31), &[0u8; 64]).is_ok());
}

#[test]
fn checksum_header_must_fit() {
    let vm = StreamVm::new()
        .with(inc("a", 1))
        .with(FixChecksumIpv4 { pkt_offset: 50 });
    assert_eq!(
        compile_err(vm, 64).kind(),
        &ErrorKind::Ipv4HeaderOutOfRange {
            offset: 50,
            hdr_len: 20,
            pkt_len: 64
        }
    );
}

#[test]
fn checksum_header_length_is_read_from_template() {
    let mut pkt = vec![0u8; 60];
    pkt[14] = 0x4F; // 60 byte header
    let vm = StreamVm::new()
        .with(inc("a", 1))
        .with(FixChecksumIpv4 { pkt_offset: 14 });
    assert_eq!(
        compile(&vm, &pkt).unwrap_err().kind(),
        &ErrorKind::Ipv4HeaderOutOfRange {
            offset: 14,
            hdr_len: 60,
            pkt_len: 60
        }
    );
}

#[test]
fn program_without_variables() {
    assert_eq!(
        compile_err(StreamVm::new(), 64),
        CompileError(ErrorKind::NoVariable, 0)
    );
    let vm = StreamVm::new().with(FixChecksumIpv4 { pkt_offset: 14 });
    assert_eq!(compile_err(vm, 64).kind(), &ErrorKind::NoVariable);
}

#[test]
fn bss_layout_follows_declaration_order() {
    let instrs = [
        Instruction::from(inc("a", 2)),
        Instruction::from(FlowVarRandLimit {
            name: "r".into(),
            size: 2,
            limit: 4,
            seed: 9,
            min: 0,
            max: 100,
        }),
        Instruction::from(FlowClientVar {
            name: "c".into(),
            ip: IpRange::new(1, 2),
            port: PortRange::default(),
            flow_limit: None,
            unlimited: false,
        }),
        Instruction::from(FlowVar::new("x", 1, FlowOp::Random, 0, 9)),
    ];
    let table = VarTable::build(&instrs, &Config::default()).unwrap();
    // the random seed comes first
    let offset = |name: &str| table.get(name).unwrap().offset;
    assert_eq!(offset("a"), 4);
    assert_eq!(offset("r"), 6);
    assert_eq!(offset("c.ip"), 14);
    assert_eq!(offset("c.port"), 18);
    assert_eq!(offset("c.flow_limit"), 20);
    assert_eq!(offset("x"), 24);
    assert_eq!(table.bss_size(), 25);
    assert_eq!(table.declared(), 4);
    assert!(table.has_random());
}

#[test]
fn bss_template_holds_initial_values() {
    let vm = StreamVm::new()
        .with(inc("a", 1).with_init(3))
        .with(FlowVarRandLimit {
            name: "r".into(),
            size: 1,
            limit: 2,
            seed: 0xAABBCCDD,
            min: 0,
            max: 100,
        });
    let program = compile(&vm, &[0u8; 64]).unwrap();
    assert!(!program.is_random_seed);
    // value stored one step behind, then the rand limit value, count, seed
    let mut expected = vec![2, 0, 0];
    expected.extend_from_slice(&0xAABBCCDDu32.to_ne_bytes());
    assert_eq!(&program.bss[..], &expected[..]);
}

#[test]
fn unit_and_stepped_opcodes() {
    let ops = |step| {
        let vm = StreamVm::new().with(inc("a", 1).with_step(step));
        let program = compile(&vm, &[0u8; 64]).unwrap();
        program.records().map(|(_, op)| op).collect::<Vec<_>>()
    };
    assert_eq!(ops(1), vec![OpCode::Inc8]);
    assert_eq!(ops(2), vec![OpCode::Inc8Step]);
    // 12 mod 11 values
    assert_eq!(ops(12), vec![OpCode::Inc8]);
}

#[test]
fn prefix_size_classes() {
    assert_eq!(calc_prefix_size(20, 100), 100);
    assert_eq!(calc_prefix_size(20, 120), 120);
    assert_eq!(calc_prefix_size(20, 1000), 64);
    assert_eq!(calc_prefix_size(100, 1000), 128);
    assert_eq!(calc_prefix_size(200, 1000), 512);
    assert_eq!(calc_prefix_size(20, 150), 64);
    // a short constant tail is not split off
    assert_eq!(calc_prefix_size(100, 180), 180);
}

#[test]
fn program_metadata() {
    let vm = StreamVm::new()
        .with(inc("a", 2))
        .with(WriteToPacket::new("a", 30));
    let program = compile(&vm, &vec![0u8; 1500]).unwrap();
    assert_eq!(program.max_pkt_offset, 32);
    assert_eq!(program.prefix_size, 64);
    assert!(!program.is_pkt_size_var);
    assert_eq!(program.pkt_len, PktLenData::fixed(1500));
}

fn pkt_size_vm(var: FlowVar) -> StreamVm {
    StreamVm::new().with(var).with(ChangePacketSize {
        var_name: "len".into(),
    })
}

#[test]
fn packet_size_is_clamped_to_template() {
    let vm = pkt_size_vm(FlowVar::new("len", 2, FlowOp::Inc, 64, 1500));
    let program = compile(&vm, &[0u8; 512]).unwrap();
    assert!(program.is_pkt_size_var);
    assert_eq!(program.pkt_len.min, 64);
    assert_eq!(program.pkt_len.max, 512);
    assert_eq!(program.pkt_len.expected, 288.0);
}

#[test]
fn packet_size_collapsing_below_minimum_is_raised() {
    let vm = pkt_size_vm(FlowVar::new("len", 2, FlowOp::Inc, 10, 50));
    let program = compile(&vm, &[0u8; 100]).unwrap();
    assert_eq!(
        program.pkt_len,
        PktLenData {
            min: 60,
            max: 60,
            expected: 60.0
        }
    );
    let mut bss = program.new_bss();
    assert_eq!(program.run(&mut bss, &mut [0u8; 100]), 60);
}

#[test]
fn packet_size_range_inverted_by_clamp() {
    let vm = pkt_size_vm(FlowVar::new("len", 2, FlowOp::Inc, 200, 300));
    assert_eq!(
        compile_err(vm, 100),
        CompileError(ErrorKind::InvalidPacketSizeRange { min: 100, max: 100 }, 1)
    );
}

#[test]
fn packet_size_variable_shape() {
    let vm = pkt_size_vm(FlowVar::new("len", 4, FlowOp::Inc, 64, 100));
    assert_eq!(
        compile_err(vm, 128).kind(),
        &ErrorKind::PacketSizeVarWidth {
            name: "len".into(),
            size: 4
        }
    );
    let vm = StreamVm::new()
        .with(FlowVarRandLimit {
            name: "len".into(),
            size: 2,
            limit: 10,
            seed: 1,
            min: 64,
            max: 100,
        })
        .with(ChangePacketSize {
            var_name: "len".into(),
        });
    assert_eq!(
        compile_err(vm, 128).kind(),
        &ErrorKind::PacketSizeVarKind("len".into())
    );
}

#[test]
fn packet_size_change_once() {
    let vm = pkt_size_vm(FlowVar::new("len", 2, FlowOp::Inc, 64, 100)).with(ChangePacketSize {
        var_name: "len".into(),
    });
    assert_eq!(
        compile_err(vm, 128),
        CompileError(ErrorKind::MultiplePacketSizeChange, 2)
    );
}

#[test]
fn packet_too_small_for_size_change() {
    let vm = pkt_size_vm(FlowVar::new("len", 2, FlowOp::Inc, 40, 50));
    assert_eq!(
        compile_err(vm, 42).kind(),
        &ErrorKind::PacketTooSmall { pkt_len: 42, min: 60 }
    );
}

#[test]
fn random_packet_size_average() {
    let vm = pkt_size_vm(FlowVar::new("len", 2, FlowOp::Random, 60, 100));
    let mut ctx = Context::default();
    let program = ctx.compile_packet(&vm, &[0u8; 128]).unwrap();
    assert_eq!(program.pkt_len.expected, 60.0 + FastRandAvgCache::estimate(40));
    assert!((75.0..85.0).contains(&program.pkt_len.expected));
    assert_eq!(ctx.rand_avg_cache().len(), 1);

    let mut exact = Context::new(Config {
        exact_random_avg: true,
        ..Default::default()
    });
    let program = exact.compile_packet(&vm, &[0u8; 128]).unwrap();
    assert_eq!(program.pkt_len.expected, 80.0);
    assert!(exact.rand_avg_cache().is_empty());
}

#[test]
fn rand_avg_cache_memoizes() {
    let mut cache = FastRandAvgCache::new();
    let first = cache.avg(99);
    assert_eq!(cache.avg(99), first);
    assert_eq!(cache.len(), 1);
    cache.clear();
    assert!(cache.is_empty());
}

#[test]
fn split_walks_interleaved_sequences() {
    let vm = StreamVm::new().with(FlowVar::new("a", 1, FlowOp::Inc, 0, 9));
    let split = vm.split(1, 4);
    let Instruction::FlowVar(v) = &split.instructions()[0] else {
        panic!("flow var expected");
    };
    assert_eq!((v.init, v.step), (1, 4));

    let dec = StreamVm::new().with(FlowVar::new("a", 1, FlowOp::Dec, 0, 9).with_init(9));
    let split = dec.split(2, 3);
    let Instruction::FlowVar(v) = &split.instructions()[0] else {
        panic!("flow var expected");
    };
    assert_eq!((v.init, v.step), (7, 3));
}

#[test]
fn split_shares_limits() {
    let vm = StreamVm::new().with(FlowVarRandLimit {
        name: "r".into(),
        size: 1,
        limit: 5,
        seed: 1,
        min: 0,
        max: 9,
    });
    let limits: Vec<u64> = (0..2)
        .map(|phase| match &vm.split(phase, 2).instructions()[0] {
            Instruction::FlowVarRandLimit(v) => v.limit,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(limits, vec![3, 2]);
}

#[test]
fn split_cores_cover_single_core_sequence() {
    let vm = StreamVm::new()
        .with(FlowVar::new("a", 1, FlowOp::Inc, 3, 12).with_step(3))
        .with(WriteToPacket::new("a", 0));
    let values = |vm: &StreamVm, n: usize| {
        let program = compile(vm, &[0u8; 64]).unwrap();
        let mut bss = program.new_bss();
        let mut pkt = [0u8; 64];
        (0..n)
            .map(|_| {
                program.run(&mut bss, &mut pkt);
                pkt[0]
            })
            .collect::<Vec<_>>()
    };
    let single = values(&vm, 12);
    let cores: Vec<_> = (0..3).map(|phase| values(&vm.split(phase, 3), 4)).collect();
    let interleaved: Vec<u8> = (0..4).flat_map(|i| cores.iter().map(move |c| c[i])).collect();
    assert_eq!(interleaved, single);
}

#[test]
fn listing_numbers_instructions() {
    let vm = StreamVm::new()
        .with(inc("a", 1))
        .with(WriteToPacket::new("a", 0));
    let listing = vm.to_string();
    let lines: Vec<_> = listing.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("000: "));
    assert!(lines[1].starts_with("001: "));
}

#[test]
fn instructions_from_json() {
    let json = r#"[
        {"type": "flow_var", "name": "ip_src", "size": 4, "op": "inc", "min": 16, "max": 32, "init": 16},
        {"type": "write_to_packet", "var_name": "ip_src", "pkt_offset": 26},
        {"type": "fix_checksum_ipv4", "pkt_offset": 14}
    ]"#;
    let vm: StreamVm = serde_json::from_str(json).unwrap();
    assert_eq!(vm.len(), 3);
    let Instruction::WriteToPacket(w) = &vm.instructions()[1] else {
        panic!("write expected");
    };
    assert!(w.big_endian);
    assert_eq!(w.add_value, 0);
}
