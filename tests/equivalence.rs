//! Interpreter/dynarec equivalence: the same program from the same initial
//! state must produce the same architectural state and the same ordered
//! I/O trace through both execution engines.

mod common;

use common::{load, real_mode};
use proptest::prelude::*;

/// One synthesizable instruction, kept to the register/immediate subset so
/// programs are always well defined.
#[derive(Clone, Debug)]
enum Insn {
    AluAlImm { family: u8, imm: u8 },
    MovRegImm { reg: u8, imm: u16 },
    IncReg { reg: u8 },
    DecReg { reg: u8 },
    XchgAxReg { reg: u8 },
    ShiftAl { op: u8, count: u8 },
    OutAl { port: u8 },
    JzForward { skip: u8 },
}

impl Insn {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Insn::AluAlImm { family, imm } => {
                out.push(0x04 | (family << 3));
                out.push(*imm);
            }
            Insn::MovRegImm { reg, imm } => {
                out.push(0xb8 | reg);
                out.extend_from_slice(&imm.to_le_bytes());
            }
            Insn::IncReg { reg } => out.push(0x40 | reg),
            Insn::DecReg { reg } => out.push(0x48 | reg),
            Insn::XchgAxReg { reg } => out.push(0x90 | reg),
            Insn::ShiftAl { op, count } => {
                out.push(0xc0);
                out.push(0xc0 | (op << 3));
                out.push(*count);
            }
            Insn::OutAl { port } => {
                out.push(0xe6);
                out.push(*port);
            }
            Insn::JzForward { skip } => {
                out.push(0x74);
                out.push(*skip);
            }
        }
    }
}

fn insn_strategy() -> impl Strategy<Value = Insn> {
    prop_oneof![
        (0u8..8, any::<u8>()).prop_map(|(family, imm)| Insn::AluAlImm { family, imm }),
        (0u8..8, any::<u16>()).prop_map(|(reg, imm)| Insn::MovRegImm { reg, imm }),
        (0u8..8).prop_map(|reg| Insn::IncReg { reg }),
        (0u8..8).prop_map(|reg| Insn::DecReg { reg }),
        (1u8..8).prop_map(|reg| Insn::XchgAxReg { reg }),
        (prop::sample::select(vec![0u8, 1, 4, 5, 7]), 0u8..16)
            .prop_map(|(op, count)| Insn::ShiftAl { op, count }),
        any::<u8>().prop_map(|port| Insn::OutAl { port }),
        (1u8..8).prop_map(|skip| Insn::JzForward { skip }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn interpreter_and_dynarec_states_agree(
        insns in prop::collection::vec(insn_strategy(), 1..24),
        seed_ax in any::<u16>(),
    ) {
        let mut program = Vec::new();
        for insn in &insns {
            insn.encode(&mut program);
        }
        // Jcc skips land inside the program or on the padding below.
        program.extend_from_slice(&[0x90; 16]);
        program.push(0xf4); // hlt

        let mut a = real_mode(0x0300);
        load(&mut a, 0x0300, &program);
        a.regs.set_w(ex86_rs::regs::AX, seed_ax);
        a.exec(4000);

        let mut b = real_mode(0x0300);
        load(&mut b, 0x0300, &program);
        b.regs.set_w(ex86_rs::regs::AX, seed_ax);
        // Run the dynarec engine enough times for blocks to be marked,
        // recorded and replayed.
        b.exec_dynarec(4000);

        prop_assert_eq!(a.regs.dump(), b.regs.dump());
        prop_assert_eq!(a.pc, b.pc);
        let fa = a.snapshot().flags;
        let fb = b.snapshot().flags;
        prop_assert_eq!(fa, fb);
        prop_assert_eq!(&a.bus_mut().trace, &b.bus_mut().trace);
    }

    #[test]
    fn replay_after_warmup_matches_single_run(
        insns in prop::collection::vec(insn_strategy(), 1..12),
    ) {
        // The same routine called in a loop: by the third pass the block
        // is replayed from the recording. Every pass must behave like the
        // first.
        let mut routine = Vec::new();
        for insn in &insns {
            insn.encode(&mut routine);
        }
        routine.extend_from_slice(&[0x90; 16]);
        routine.push(0xc3); // ret

        let driver: &[u8] = &[
            0xe8, 0xfd, 0x00, // call 0x400
            0xe8, 0xfa, 0x00, // call 0x400
            0xe8, 0xf7, 0x00, // call 0x400
            0xf4, // hlt
        ];

        let mut a = real_mode(0x0300);
        load(&mut a, 0x0300, driver);
        load(&mut a, 0x0400, &routine);
        a.exec(6000);

        let mut b = real_mode(0x0300);
        load(&mut b, 0x0300, driver);
        load(&mut b, 0x0400, &routine);
        b.exec_dynarec(6000);

        prop_assert_eq!(a.regs.dump(), b.regs.dump());
        prop_assert_eq!(&a.bus_mut().trace, &b.bus_mut().trace);
    }
}
