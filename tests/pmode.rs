//! Protected mode: entering via GDT + far jump, dropping to ring 3 with
//! IRET, and coming back up through a call gate with a stack switch.

mod common;

use common::{descriptor, gate, load, real_mode};
use ex86_rs::regs::SP;

const GDT_BASE: usize = 0x7000;

/// GDT layout: 0x08 ring-0 code32, 0x10 ring-0 data, 0x1B ring-3 code32,
/// 0x23 ring-3 data, 0x28 call gate to 0x08:0x2000, 0x30 TSS.
fn pmode_machine() -> ex86_rs::Cpu<common::TraceBus> {
    let mut cpu = real_mode(0x0600);

    load(&mut cpu, GDT_BASE + 0x08, &descriptor(0, 0xfffff, 0x9a, 0xc));
    load(&mut cpu, GDT_BASE + 0x10, &descriptor(0, 0xfffff, 0x92, 0xc));
    load(&mut cpu, GDT_BASE + 0x18, &descriptor(0, 0xfffff, 0xfa, 0xc));
    load(&mut cpu, GDT_BASE + 0x20, &descriptor(0, 0xfffff, 0xf2, 0xc));
    load(&mut cpu, GDT_BASE + 0x28, &gate(0x08, 0x2000, 0xec));
    load(&mut cpu, GDT_BASE + 0x30, &descriptor(0x5000, 0x67, 0x89, 0x0));
    cpu.gdt = ex86_rs::cpu::DescTable { base: GDT_BASE as u32, limit: 0xff };

    // TSS: ring-0 stack SS0:ESP0 = 0x10:0x9000.
    load(&mut cpu, 0x5004, &0x9000u32.to_le_bytes());
    load(&mut cpu, 0x5008, &0x10u32.to_le_bytes());
    cpu.tr = ex86_rs::cpu::SysSeg {
        seg: 0x30,
        base: 0x5000,
        limit: 0x67,
        access: 0x89,
    };

    cpu.cr0 |= 1; // PE

    // Real-mode stub: far jump into the 32-bit code segment.
    load(&mut cpu, 0x0600, &[0xea, 0x10, 0x06, 0x08, 0x00]);

    // 32-bit ring-0 code at 0x0610: load SS:ESP, build a ring-3 IRET
    // frame, drop to ring 3.
    load(
        &mut cpu,
        0x0610,
        &[
            0xb8, 0x10, 0x00, 0x00, 0x00, // mov eax, 0x10
            0x8e, 0xd0, // mov ss, ax
            0xbc, 0x00, 0x90, 0x00, 0x00, // mov esp, 0x9000
            0x6a, 0x23, // push 0x23      (ring-3 SS)
            0x68, 0x00, 0x80, 0x00, 0x00, // push 0x8000 (ring-3 ESP)
            0x68, 0x02, 0x00, 0x00, 0x00, // push 0x0002 (EFLAGS)
            0x6a, 0x1b, // push 0x1b      (ring-3 CS)
            0x68, 0x00, 0x07, 0x00, 0x00, // push 0x0700 (EIP)
            0xcf, // iretd
        ],
    );

    // Ring-3 code at 0x0700: far jump through the call gate.
    load(&mut cpu, 0x0700, &[0xea, 0x00, 0x20, 0x00, 0x00, 0x28, 0x00]);

    // Gate target at 0x2000 (ring 0): hlt.
    load(&mut cpu, 0x2000, &[0xf4]);

    cpu
}

#[test]
fn call_gate_raises_privilege_and_switches_stacks() {
    let mut cpu = pmode_machine();

    // Far jump into protected mode.
    cpu.step();
    assert_eq!(cpu.cs.seg, 0x08);
    assert_eq!(cpu.pc, 0x0610);
    assert!(cpu.use32_code);

    // mov eax / mov ss / mov esp / five pushes / iretd.
    for _ in 0..9 {
        cpu.step();
    }
    assert_eq!(cpu.cs.seg, 0x1b);
    assert_eq!(cpu.cpl(), 3);
    assert_eq!(cpu.ss.seg, 0x23);
    assert_eq!(cpu.regs.l(SP), 0x8000);
    assert_eq!(cpu.pc, 0x0700);

    // The gate transfer back to ring 0.
    cpu.step();
    assert_eq!(cpu.cs.seg & !3, 0x08);
    assert_eq!(cpu.cpl(), 0);
    assert_eq!(cpu.ss.seg, 0x10);
    assert_eq!(cpu.pc, 0x2000);
    // The inner stack holds the outer return frame: EIP, CS, ESP, SS.
    assert_eq!(cpu.regs.l(SP), 0x9000 - 16);
    let ram = cpu.ram();
    let word = |addr: usize| {
        u32::from_le_bytes([ram[addr], ram[addr + 1], ram[addr + 2], ram[addr + 3]])
    };
    assert_eq!(word(0x8ff0), 0x0707); // return EIP (after the far jump)
    assert_eq!(word(0x8ff4), 0x001b); // old CS
    assert_eq!(word(0x8ff8), 0x8000); // old ESP
    assert_eq!(word(0x8ffc), 0x0023); // old SS
}
