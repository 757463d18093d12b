//! x87 transfers and arithmetic observable through memory.

mod common;

use common::{load, real_mode};
use ex86_rs::regs::AX;

#[test]
fn fld_fstp_round_trips_pi_exactly() {
    let mut cpu = real_mode(0x0400);
    // fld qword [0x3000] ; fstp qword [0x3008] ; hlt
    load(
        &mut cpu,
        0x0400,
        &[0xdd, 0x06, 0x00, 0x30, 0xdd, 0x1e, 0x08, 0x30, 0xf4],
    );
    let pi = std::f64::consts::PI.to_le_bytes();
    load(&mut cpu, 0x3000, &pi);

    cpu.step();
    cpu.step();

    assert_eq!(&cpu.ram()[0x3008..0x3010], &pi);
}

#[test]
fn fild_fistp_preserves_the_exact_integer() {
    let mut cpu = real_mode(0x0400);
    // fild qword [0x3100] ; fistp qword [0x3108] ; hlt
    load(
        &mut cpu,
        0x0400,
        &[0xdf, 0x2e, 0x00, 0x31, 0xdf, 0x3e, 0x08, 0x31, 0xf4],
    );
    // A value that needs the full 64 bits (not representable in f64).
    let big = 0x1234_5678_9abc_def1u64.to_le_bytes();
    load(&mut cpu, 0x3100, &big);

    cpu.step();
    cpu.step();

    assert_eq!(&cpu.ram()[0x3108..0x3110], &big);
}

#[test]
fn fadd_and_fnstsw_compare() {
    let mut cpu = real_mode(0x0400);
    // fld qword [0x3000] ; fadd qword [0x3008] ; fcom qword [0x3010]
    // fnstsw ax ; fstp qword [0x3018]
    load(
        &mut cpu,
        0x0400,
        &[
            0xdd, 0x06, 0x00, 0x30, // fld
            0xdc, 0x06, 0x08, 0x30, // fadd
            0xdc, 0x16, 0x10, 0x30, // fcom
            0xdf, 0xe0, // fnstsw ax
            0xdd, 0x1e, 0x18, 0x30, // fstp
        ],
    );
    load(&mut cpu, 0x3000, &1.5f64.to_le_bytes());
    load(&mut cpu, 0x3008, &2.25f64.to_le_bytes());
    load(&mut cpu, 0x3010, &3.75f64.to_le_bytes());

    for _ in 0..5 {
        cpu.step();
    }

    let out = &cpu.ram()[0x3018..0x3020];
    assert_eq!(out, &3.75f64.to_le_bytes());
    // 3.75 == 3.75: C3 set, C0/C2 clear.
    let sw = cpu.regs.w(AX);
    assert_eq!(sw & 0x4500, 0x4000);
}

#[test]
fn fpu_stack_wraps_through_all_eight_slots() {
    let mut cpu = real_mode(0x0400);
    // Push eight values then store ST(7), which must be the first one.
    let mut program = Vec::new();
    for i in 0..8u8 {
        // fld qword [0x3000 + i*8]
        program.extend_from_slice(&[0xdd, 0x06, i * 8, 0x30]);
    }
    // fxch st(7) ; fstp qword [0x3100]
    program.extend_from_slice(&[0xd9, 0xcf, 0xdd, 0x1e, 0x00, 0x31]);
    load(&mut cpu, 0x0400, &program);
    for i in 0..8u64 {
        let v = (i as f64) + 0.5;
        load(&mut cpu, 0x3000 + (i as usize) * 8, &v.to_le_bytes());
    }

    for _ in 0..10 {
        cpu.step();
    }

    assert_eq!(&cpu.ram()[0x3100..0x3108], &0.5f64.to_le_bytes());
}

#[test]
fn fsave_frstor_round_trips_stack_and_control(){
    let mut cpu = real_mode(0x0400);
    // fld qword [0x3000] ; fld qword [0x3008] ; fnsave [0x3200]
    // frstor [0x3200] ; fstp qword [0x3010] ; fstp qword [0x3018]
    load(
        &mut cpu,
        0x0400,
        &[
            0xdd, 0x06, 0x00, 0x30, // fld a
            0xdd, 0x06, 0x08, 0x30, // fld b
            0xdd, 0x36, 0x00, 0x32, // fnsave [0x3200]
            0xdd, 0x26, 0x00, 0x32, // frstor [0x3200]
            0xdd, 0x1e, 0x10, 0x30, // fstp -> b
            0xdd, 0x1e, 0x18, 0x30, // fstp -> a
        ],
    );
    load(&mut cpu, 0x3000, &(-12.0f64).to_le_bytes());
    load(&mut cpu, 0x3008, &0.375f64.to_le_bytes());

    for _ in 0..6 {
        cpu.step();
    }

    assert_eq!(&cpu.ram()[0x3010..0x3018], &0.375f64.to_le_bytes());
    assert_eq!(&cpu.ram()[0x3018..0x3020], &(-12.0f64).to_le_bytes());
}

#[test]
fn fsave_frstor_round_trips_negative_infinity_and_nan() {
    // A -infinity and a negative quiet NaN both carry an all-ones
    // sign/exponent word in the 80-bit image; saving and restoring them
    // must hand back the same values, not reinterpret the registers.
    let mut cpu = real_mode(0x0400);
    // fld qword [0x3000] ; fld qword [0x3008] ; fnsave [0x3200]
    // frstor [0x3200] ; fstp qword [0x3010] ; fstp qword [0x3018]
    load(
        &mut cpu,
        0x0400,
        &[
            0xdd, 0x06, 0x00, 0x30, // fld -inf
            0xdd, 0x06, 0x08, 0x30, // fld -nan
            0xdd, 0x36, 0x00, 0x32, // fnsave [0x3200]
            0xdd, 0x26, 0x00, 0x32, // frstor [0x3200]
            0xdd, 0x1e, 0x10, 0x30, // fstp -> the nan
            0xdd, 0x1e, 0x18, 0x30, // fstp -> the infinity
        ],
    );
    let neg_inf = (-f64::INFINITY).to_le_bytes();
    let neg_nan = 0xfff8_0000_0000_0000u64.to_le_bytes();
    load(&mut cpu, 0x3000, &neg_inf);
    load(&mut cpu, 0x3008, &neg_nan);

    for _ in 0..6 {
        cpu.step();
    }

    assert_eq!(&cpu.ram()[0x3010..0x3018], &neg_nan);
    assert_eq!(&cpu.ram()[0x3018..0x3020], &neg_inf);
    // The restored values are still x87 values: the stored infinity
    // compares equal to itself (C3), which an MMX-aliased misload would
    // not produce.
    load(
        &mut cpu,
        0x0420,
        &[
            0xdd, 0x06, 0x18, 0x30, // fld qword [0x3018]
            0xdc, 0x16, 0x18, 0x30, // fcom qword [0x3018]
            0xdf, 0xe0, // fnstsw ax
        ],
    );
    cpu.pc = 0x0420;
    for _ in 0..3 {
        cpu.step();
    }
    assert_eq!(cpu.regs.w(AX) & 0x4500, 0x4000);
}

#[test]
fn fild_shadow_survives_fnsave_frstor_exactly() {
    let mut cpu = real_mode(0x0400);
    // fild qword [0x3100] ; fnsave [0x3200] ; frstor [0x3200]
    // fistp qword [0x3108]
    load(
        &mut cpu,
        0x0400,
        &[
            0xdf, 0x2e, 0x00, 0x31, // fild
            0xdd, 0x36, 0x00, 0x32, // fnsave
            0xdd, 0x26, 0x00, 0x32, // frstor
            0xdf, 0x3e, 0x08, 0x31, // fistp
        ],
    );
    // Needs all 64 bits; a double-rounded restore would corrupt the low
    // bits.
    let big = 0x7654_3210_fedc_ba99u64.to_le_bytes();
    load(&mut cpu, 0x3100, &big);

    for _ in 0..4 {
        cpu.step();
    }

    assert_eq!(&cpu.ram()[0x3108..0x3110], &big);
}

#[test]
fn no_fpu_config_raises_nm() {
    let mut cpu = {
        let mut config = ex86_rs::CpuConfig::default();
        config.has_fpu = false;
        let mut cpu = ex86_rs::Cpu::new(config, 1 << 20, common::TraceBus::default()).unwrap();
        cpu.cs.load_real(0x0000, 0x9b);
        cpu.ss.load_real(0x0000, 0x93);
        cpu.ds.load_real(0x0000, 0x93);
        cpu.regs.set_w(ex86_rs::regs::SP, 0x7000);
        cpu.pc = 0x0400;
        cpu
    };
    load(&mut cpu, 0x0400, &[0xd9, 0x06, 0x00, 0x30]); // fld dword
    // IVT entry 7 -> 0x0000:0x0800.
    cpu.ram_mut()[7 * 4] = 0x00;
    cpu.ram_mut()[7 * 4 + 1] = 0x08;

    cpu.step();
    assert_eq!(cpu.pc, 0x0800);
    // Return address points back at the ESC opcode.
    let ram = cpu.ram();
    let ip = u16::from_le_bytes([ram[0x6ffa], ram[0x6ffb]]);
    assert_eq!(ip, 0x0400);
}
