//! Real-mode execution: MOV + software INT vectoring, divide faults,
//! hardware interrupt delivery and flag behavior.

mod common;

use common::{load, real_mode};
use ex86_rs::regs::{AX, BX, SP};

#[test]
fn mov_then_int_vectors_through_the_ivt() {
    let mut cpu = real_mode(0x7c00);
    // mov ax, 0x1234 ; int 0x10
    load(&mut cpu, 0x7c00, &[0xb8, 0x34, 0x12, 0xcd, 0x10]);
    // IVT entry 0x10 -> 0xF000:0x0123.
    load(&mut cpu, 0x10 * 4, &[0x23, 0x01, 0x00, 0xf0]);
    cpu.flags |= 0x0200; // IF set so we can observe it being cleared

    cpu.step();
    assert_eq!(cpu.regs.w(AX), 0x1234);
    assert_eq!(cpu.pc, 0x7c03);

    cpu.step();
    assert_eq!(cpu.cs.seg, 0xf000);
    assert_eq!(cpu.cs.base.raw(), 0xf0000);
    assert_eq!(cpu.pc, 0x0123);
    // Three words pushed: FLAGS, CS, IP.
    assert_eq!(cpu.regs.w(SP), 0x7000 - 6);
    let ram = cpu.ram();
    let ip = u16::from_le_bytes([ram[0x6ffa], ram[0x6ffb]]);
    let cs = u16::from_le_bytes([ram[0x6ffc], ram[0x6ffd]]);
    assert_eq!(ip, 0x7c05);
    assert_eq!(cs, 0x0000);
    // IF and TF are cleared on delivery.
    assert_eq!(cpu.flags & 0x0300, 0);
}

#[test]
fn divide_by_zero_restarts_at_the_div() {
    let mut cpu = real_mode(0x7c00);
    // div bx with BX = 0.
    load(&mut cpu, 0x7c00, &[0xf7, 0xf3]);
    // IVT entry 0 -> 0x0000:0x0500.
    load(&mut cpu, 0, &[0x00, 0x05, 0x00, 0x00]);
    cpu.regs.set_w(AX, 10);
    cpu.regs.set_w(2, 0); // DX
    cpu.regs.set_w(BX, 0);

    cpu.step();
    assert_eq!(cpu.pc, 0x0500);
    // The pushed return address points at the DIV itself, not past it.
    let ram = cpu.ram();
    let ip = u16::from_le_bytes([ram[0x6ffa], ram[0x6ffb]]);
    assert_eq!(ip, 0x7c00);
}

#[test]
fn divide_overflow_also_faults() {
    let mut cpu = real_mode(0x7c00);
    load(&mut cpu, 0x7c00, &[0xf7, 0xf3]);
    load(&mut cpu, 0, &[0x00, 0x05, 0x00, 0x00]);
    // 0x0001_0000 / 1 does not fit in AX.
    cpu.regs.set_w(AX, 0x0000);
    cpu.regs.set_w(2, 0x0001);
    cpu.regs.set_w(BX, 1);

    cpu.step();
    assert_eq!(cpu.pc, 0x0500);
}

#[test]
fn external_interrupt_is_taken_between_instructions() {
    let mut cpu = real_mode(0x7c00);
    // Two NOPs; the IRQ arrives after the first.
    load(&mut cpu, 0x7c00, &[0x90, 0x90]);
    load(&mut cpu, 0x21 * 4, &[0x00, 0x06, 0x00, 0x00]);
    cpu.flags |= 0x0200;
    cpu.bus_mut().irq_pending = Some(0x21);

    cpu.step();
    assert_eq!(cpu.pc, 0x0600);
    // The interrupted IP (after the first NOP) is on the stack.
    let ram = cpu.ram();
    let ip = u16::from_le_bytes([ram[0x6ffa], ram[0x6ffb]]);
    assert_eq!(ip, 0x7c01);
    assert_eq!(cpu.flags & 0x0200, 0);
}

#[test]
fn trap_flag_raises_debug_exception_after_one_instruction() {
    let mut cpu = real_mode(0x7c00);
    load(&mut cpu, 0x7c00, &[0x90, 0x90]);
    load(&mut cpu, 1 * 4, &[0x00, 0x07, 0x00, 0x00]);
    cpu.flags |= 0x0100; // TF

    cpu.step();
    assert_eq!(cpu.pc, 0x0700);
    let ram = cpu.ram();
    let ip = u16::from_le_bytes([ram[0x6ffa], ram[0x6ffb]]);
    assert_eq!(ip, 0x7c01);
}

#[test]
fn alu_flags_match_reference_for_a_mixed_sequence() {
    let mut cpu = real_mode(0x7c00);
    // add al, 0x7f ; inc al ; cmp al, 0x80 ; pushf
    load(&mut cpu, 0x7c00, &[0x04, 0x7f, 0xfe, 0xc0, 0x3c, 0x80, 0x9c]);
    cpu.regs.set_b(0, 0x01);
    for _ in 0..4 {
        cpu.step();
    }
    let ram = cpu.ram();
    let pushed = u16::from_le_bytes([ram[0x6ffe], ram[0x6fff]]);
    // AL went 0x01 -> 0x80 -> 0x81; cmp 0x81,0x80 leaves CF=0 ZF=0 SF=0
    // OF=0 AF=0 PF(0x01)=0.
    assert_eq!(pushed & 0x08d5, 0x0000);
    assert_eq!(cpu.regs.b(0), 0x81);
}

#[test]
fn out_instructions_reach_the_bus_in_order() {
    let mut cpu = real_mode(0x7c00);
    // mov al, 1 ; out 0x80, al ; mov al, 2 ; out 0x80, al
    load(&mut cpu, 0x7c00, &[0xb0, 0x01, 0xe6, 0x80, 0xb0, 0x02, 0xe6, 0x80]);
    for _ in 0..4 {
        cpu.step();
    }
    use common::IoEvent;
    assert_eq!(
        cpu.bus_mut().trace,
        vec![
            IoEvent::Out { port: 0x80, val: 1 },
            IoEvent::Out { port: 0x80, val: 2 }
        ]
    );
}
