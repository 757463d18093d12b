//! The MMX packed-integer set. MM registers alias the FPU register file;
//! any MMX opcode forces the FPU into MMX mode (tags all valid, TOP zero)
//! and EMMS leaves it.

use crate::bus::Bus;
use crate::cpu::{Cpu, OpFn, OpOutcome};
use crate::fpu::MmxReg;
use crate::interp::set_all;
use crate::mem::{CR0_EM, CR0_TS};

fn mmx_ready<B: Bus>(cpu: &mut Cpu<B>) -> bool {
    if !cpu.has_fpu || cpu.cr0 & CR0_EM != 0 {
        cpu.x86illegal();
        return false;
    }
    if cpu.cr0 & CR0_TS != 0 {
        cpu.x86_int(7);
        return false;
    }
    cpu.fpu.enter_mmx();
    true
}

/// Reads the 64-bit source operand (MM register or memory).
fn mmx_src<B: Bus>(cpu: &mut Cpu<B>) -> Option<u64> {
    if cpu.cpu_mod == 3 {
        Some(cpu.fpu.mm[cpu.cpu_rm].0)
    } else {
        let v = cpu.geteaq();
        if cpu.abrt.is_some() {
            None
        } else {
            Some(v)
        }
    }
}

fn map_b(a: u64, b: u64, f: impl Fn(u8, u8) -> u8) -> u64 {
    let mut out = 0u64;
    for lane in 0..8 {
        let r = f((a >> (lane * 8)) as u8, (b >> (lane * 8)) as u8);
        out |= u64::from(r) << (lane * 8);
    }
    out
}

fn map_w(a: u64, b: u64, f: impl Fn(u16, u16) -> u16) -> u64 {
    let mut out = 0u64;
    for lane in 0..4 {
        let r = f((a >> (lane * 16)) as u16, (b >> (lane * 16)) as u16);
        out |= u64::from(r) << (lane * 16);
    }
    out
}

fn map_l(a: u64, b: u64, f: impl Fn(u32, u32) -> u32) -> u64 {
    let lo = f(a as u32, b as u32);
    let hi = f((a >> 32) as u32, (b >> 32) as u32);
    u64::from(lo) | (u64::from(hi) << 32)
}

macro_rules! mmx_binop {
    ($name:ident, $body:expr) => {
        fn $name<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
            if !mmx_ready(cpu) {
                return OpOutcome::BlockEnd;
            }
            if !cpu.fetch_ea(fetchdat) {
                return OpOutcome::Continue;
            }
            let src = match mmx_src(cpu) {
                Some(v) => v,
                None => return OpOutcome::Continue,
            };
            let dst = cpu.fpu.mm[cpu.cpu_reg].0;
            let f: fn(u64, u64) -> u64 = $body;
            cpu.fpu.mm[cpu.cpu_reg] = MmxReg(f(dst, src));
            cpu.cycles -= 1;
            OpOutcome::Continue
        }
    };
}

// Wrapping adds and subtracts.
mmx_binop!(op_paddb, |d, s| map_b(d, s, |a, b| a.wrapping_add(b)));
mmx_binop!(op_paddw, |d, s| map_w(d, s, |a, b| a.wrapping_add(b)));
mmx_binop!(op_paddd, |d, s| map_l(d, s, |a, b| a.wrapping_add(b)));
mmx_binop!(op_psubb, |d, s| map_b(d, s, |a, b| a.wrapping_sub(b)));
mmx_binop!(op_psubw, |d, s| map_w(d, s, |a, b| a.wrapping_sub(b)));
mmx_binop!(op_psubd, |d, s| map_l(d, s, |a, b| a.wrapping_sub(b)));

// Signed saturation.
mmx_binop!(op_paddsb, |d, s| map_b(d, s, |a, b| (a as i8).saturating_add(b as i8) as u8));
mmx_binop!(op_paddsw, |d, s| map_w(d, s, |a, b| (a as i16).saturating_add(b as i16) as u16));
mmx_binop!(op_psubsb, |d, s| map_b(d, s, |a, b| (a as i8).saturating_sub(b as i8) as u8));
mmx_binop!(op_psubsw, |d, s| map_w(d, s, |a, b| (a as i16).saturating_sub(b as i16) as u16));

// Unsigned saturation.
mmx_binop!(op_paddusb, |d, s| map_b(d, s, |a, b| a.saturating_add(b)));
mmx_binop!(op_paddusw, |d, s| map_w(d, s, |a, b| a.saturating_add(b)));
mmx_binop!(op_psubusb, |d, s| map_b(d, s, |a, b| a.saturating_sub(b)));
mmx_binop!(op_psubusw, |d, s| map_w(d, s, |a, b| a.saturating_sub(b)));

// Comparisons produce all-ones lanes.
mmx_binop!(op_pcmpeqb, |d, s| map_b(d, s, |a, b| if a == b { 0xff } else { 0 }));
mmx_binop!(op_pcmpeqw, |d, s| map_w(d, s, |a, b| if a == b { 0xffff } else { 0 }));
mmx_binop!(op_pcmpeqd, |d, s| map_l(d, s, |a, b| if a == b { 0xffff_ffff } else { 0 }));
mmx_binop!(op_pcmpgtb, |d, s| map_b(d, s, |a, b| if (a as i8) > (b as i8) { 0xff } else { 0 }));
mmx_binop!(op_pcmpgtw, |d, s| map_w(d, s, |a, b| if (a as i16) > (b as i16) { 0xffff } else { 0 }));
mmx_binop!(op_pcmpgtd, |d, s| map_l(d, s, |a, b| if (a as i32) > (b as i32) { 0xffff_ffff } else { 0 }));

// Logic.
mmx_binop!(op_pand, |d, s| d & s);
mmx_binop!(op_pandn, |d, s| !d & s);
mmx_binop!(op_por, |d, s| d | s);
mmx_binop!(op_pxor, |d, s| d ^ s);

// Multiplies.
mmx_binop!(op_pmullw, |d, s| map_w(d, s, |a, b| {
    (i32::from(a as i16) * i32::from(b as i16)) as u16
}));
mmx_binop!(op_pmulhw, |d, s| map_w(d, s, |a, b| {
    ((i32::from(a as i16) * i32::from(b as i16)) >> 16) as u16
}));

fn op_pmaddwd<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !mmx_ready(cpu) {
        return OpOutcome::BlockEnd;
    }
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    let src = match mmx_src(cpu) {
        Some(v) => v,
        None => return OpOutcome::Continue,
    };
    let dst = cpu.fpu.mm[cpu.cpu_reg].0;
    let mut out = 0u64;
    for pair in 0..2 {
        let shift = pair * 32;
        let a0 = (dst >> shift) as u16 as i16;
        let b0 = (src >> shift) as u16 as i16;
        let a1 = (dst >> (shift + 16)) as u16 as i16;
        let b1 = (src >> (shift + 16)) as u16 as i16;
        let sum = i32::from(a0) * i32::from(b0) + i32::from(a1) * i32::from(b1);
        out |= u64::from(sum as u32) << shift;
    }
    cpu.fpu.mm[cpu.cpu_reg] = MmxReg(out);
    cpu.cycles -= 1;
    OpOutcome::Continue
}

// --- pack and unpack ---

fn sat_i16_to_i8(v: i16) -> u8 {
    v.max(-128).min(127) as i8 as u8
}

fn sat_i16_to_u8(v: i16) -> u8 {
    v.max(0).min(255) as u8
}

fn sat_i32_to_i16(v: i32) -> u16 {
    v.max(-32768).min(32767) as i16 as u16
}

mmx_binop!(op_packsswb, |d, s| {
    let mut out = 0u64;
    for lane in 0..4 {
        out |= u64::from(sat_i16_to_i8((d >> (lane * 16)) as u16 as i16)) << (lane * 8);
        out |= u64::from(sat_i16_to_i8((s >> (lane * 16)) as u16 as i16)) << (lane * 8 + 32);
    }
    out
});

mmx_binop!(op_packuswb, |d, s| {
    let mut out = 0u64;
    for lane in 0..4 {
        out |= u64::from(sat_i16_to_u8((d >> (lane * 16)) as u16 as i16)) << (lane * 8);
        out |= u64::from(sat_i16_to_u8((s >> (lane * 16)) as u16 as i16)) << (lane * 8 + 32);
    }
    out
});

mmx_binop!(op_packssdw, |d, s| {
    let mut out = 0u64;
    out |= u64::from(sat_i32_to_i16(d as i32));
    out |= u64::from(sat_i32_to_i16((d >> 32) as i32)) << 16;
    out |= u64::from(sat_i32_to_i16(s as i32)) << 32;
    out |= u64::from(sat_i32_to_i16((s >> 32) as i32)) << 48;
    out
});

mmx_binop!(op_punpcklbw, |d, s| {
    let mut out = 0u64;
    for lane in 0..4 {
        out |= u64::from((d >> (lane * 8)) as u8) << (lane * 16);
        out |= u64::from((s >> (lane * 8)) as u8) << (lane * 16 + 8);
    }
    out
});

mmx_binop!(op_punpcklwd, |d, s| {
    let mut out = 0u64;
    for lane in 0..2 {
        out |= u64::from((d >> (lane * 16)) as u16) << (lane * 32);
        out |= u64::from((s >> (lane * 16)) as u16) << (lane * 32 + 16);
    }
    out
});

mmx_binop!(op_punpckldq, |d, s| {
    u64::from(d as u32) | (u64::from(s as u32) << 32)
});

mmx_binop!(op_punpckhbw, |d, s| {
    let mut out = 0u64;
    for lane in 0..4 {
        out |= u64::from((d >> (lane * 8 + 32)) as u8) << (lane * 16);
        out |= u64::from((s >> (lane * 8 + 32)) as u8) << (lane * 16 + 8);
    }
    out
});

mmx_binop!(op_punpckhwd, |d, s| {
    let mut out = 0u64;
    for lane in 0..2 {
        out |= u64::from((d >> (lane * 16 + 32)) as u16) << (lane * 32);
        out |= u64::from((s >> (lane * 16 + 32)) as u16) << (lane * 32 + 16);
    }
    out
});

mmx_binop!(op_punpckhdq, |d, s| {
    u64::from((d >> 32) as u32) | (u64::from((s >> 32) as u32) << 32)
});

// --- shifts ---

fn shift_w_each(v: u64, f: impl Fn(u16) -> u16) -> u64 {
    map_w(v, 0, |a, _| f(a))
}

fn shift_l_each(v: u64, f: impl Fn(u32) -> u32) -> u64 {
    map_l(v, 0, |a, _| f(a))
}

mmx_binop!(op_psrlw, |d, s| {
    if s > 15 { 0 } else { shift_w_each(d, |a| a >> s) }
});
mmx_binop!(op_psrld, |d, s| {
    if s > 31 { 0 } else { shift_l_each(d, |a| a >> s) }
});
mmx_binop!(op_psrlq, |d, s| if s > 63 { 0 } else { d >> s });
mmx_binop!(op_psraw, |d, s| {
    let sh = s.min(15) as u32;
    shift_w_each(d, |a| ((a as i16) >> sh) as u16)
});
mmx_binop!(op_psrad, |d, s| {
    let sh = s.min(31) as u32;
    shift_l_each(d, |a| ((a as i32) >> sh) as u32)
});
mmx_binop!(op_psllw, |d, s| {
    if s > 15 { 0 } else { shift_w_each(d, |a| a << s) }
});
mmx_binop!(op_pslld, |d, s| {
    if s > 31 { 0 } else { shift_l_each(d, |a| a << s) }
});
mmx_binop!(op_psllq, |d, s| if s > 63 { 0 } else { d << s });

/// 0F 71/72/73: shift-by-immediate groups.
fn mmx_shift_imm<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !mmx_ready(cpu) {
        return OpOutcome::BlockEnd;
    }
    let width = cpu.opcode;
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    if cpu.cpu_mod != 3 {
        cpu.x86illegal();
        return OpOutcome::BlockEnd;
    }
    let imm = u64::from(cpu.getbyte());
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    let v = cpu.fpu.mm[cpu.cpu_rm].0;
    let res = match (width, cpu.cpu_reg) {
        (0x71, 2) => {
            if imm > 15 { 0 } else { shift_w_each(v, |a| a >> imm) }
        }
        (0x71, 4) => {
            let sh = imm.min(15) as u32;
            shift_w_each(v, |a| ((a as i16) >> sh) as u16)
        }
        (0x71, 6) => {
            if imm > 15 { 0 } else { shift_w_each(v, |a| a << imm) }
        }
        (0x72, 2) => {
            if imm > 31 { 0 } else { shift_l_each(v, |a| a >> imm) }
        }
        (0x72, 4) => {
            let sh = imm.min(31) as u32;
            shift_l_each(v, |a| ((a as i32) >> sh) as u32)
        }
        (0x72, 6) => {
            if imm > 31 { 0 } else { shift_l_each(v, |a| a << imm) }
        }
        (0x73, 2) => {
            if imm > 63 { 0 } else { v >> imm }
        }
        (0x73, 6) => {
            if imm > 63 { 0 } else { v << imm }
        }
        _ => {
            cpu.x86illegal();
            return OpOutcome::BlockEnd;
        }
    };
    cpu.fpu.mm[cpu.cpu_rm] = MmxReg(res);
    cpu.cycles -= 1;
    OpOutcome::Continue
}

// --- moves ---

/// 0F 6E: MOVD MM, r/m32.
fn op_movd_mm_ed<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !mmx_ready(cpu) {
        return OpOutcome::BlockEnd;
    }
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    let v = if cpu.cpu_mod == 3 {
        cpu.regs.l(cpu.cpu_rm)
    } else {
        let v = cpu.geteal();
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        v
    };
    cpu.fpu.mm[cpu.cpu_reg] = MmxReg(u64::from(v));
    cpu.cycles -= 1;
    OpOutcome::Continue
}

/// 0F 7E: MOVD r/m32, MM.
fn op_movd_ed_mm<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !mmx_ready(cpu) {
        return OpOutcome::BlockEnd;
    }
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    let v = cpu.fpu.mm[cpu.cpu_reg].0 as u32;
    if cpu.cpu_mod == 3 {
        cpu.regs.set_l(cpu.cpu_rm, v);
    } else {
        cpu.seteal(v);
    }
    cpu.cycles -= 1;
    OpOutcome::Continue
}

/// 0F 6F: MOVQ MM, MM/m64.
fn op_movq_mm_eq<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !mmx_ready(cpu) {
        return OpOutcome::BlockEnd;
    }
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    let v = match mmx_src(cpu) {
        Some(v) => v,
        None => return OpOutcome::Continue,
    };
    cpu.fpu.mm[cpu.cpu_reg] = MmxReg(v);
    cpu.cycles -= 1;
    OpOutcome::Continue
}

/// 0F 7F: MOVQ MM/m64, MM.
fn op_movq_eq_mm<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !mmx_ready(cpu) {
        return OpOutcome::BlockEnd;
    }
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    let v = cpu.fpu.mm[cpu.cpu_reg].0;
    if cpu.cpu_mod == 3 {
        cpu.fpu.mm[cpu.cpu_rm] = MmxReg(v);
    } else {
        cpu.seteaq(v);
    }
    cpu.cycles -= 1;
    OpOutcome::Continue
}

fn op_emms<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    if !cpu.has_fpu || cpu.cr0 & CR0_EM != 0 {
        cpu.x86illegal();
        return OpOutcome::BlockEnd;
    }
    if cpu.cr0 & CR0_TS != 0 {
        cpu.x86_int(7);
        return OpOutcome::BlockEnd;
    }
    cpu.fpu.emms();
    cpu.cycles -= 1;
    OpOutcome::Continue
}

pub(crate) fn install_0f<B: Bus>(t: &mut [OpFn<B>]) {
    set_all(t, 0x60, op_punpcklbw);
    set_all(t, 0x61, op_punpcklwd);
    set_all(t, 0x62, op_punpckldq);
    set_all(t, 0x63, op_packsswb);
    set_all(t, 0x64, op_pcmpgtb);
    set_all(t, 0x65, op_pcmpgtw);
    set_all(t, 0x66, op_pcmpgtd);
    set_all(t, 0x67, op_packuswb);
    set_all(t, 0x68, op_punpckhbw);
    set_all(t, 0x69, op_punpckhwd);
    set_all(t, 0x6a, op_punpckhdq);
    set_all(t, 0x6b, op_packssdw);
    set_all(t, 0x6e, op_movd_mm_ed);
    set_all(t, 0x6f, op_movq_mm_eq);
    set_all(t, 0x71, mmx_shift_imm);
    set_all(t, 0x72, mmx_shift_imm);
    set_all(t, 0x73, mmx_shift_imm);
    set_all(t, 0x74, op_pcmpeqb);
    set_all(t, 0x75, op_pcmpeqw);
    set_all(t, 0x76, op_pcmpeqd);
    set_all(t, 0x77, op_emms);
    set_all(t, 0x7e, op_movd_ed_mm);
    set_all(t, 0x7f, op_movq_eq_mm);
    set_all(t, 0xd1, op_psrlw);
    set_all(t, 0xd2, op_psrld);
    set_all(t, 0xd3, op_psrlq);
    set_all(t, 0xd5, op_pmullw);
    set_all(t, 0xd8, op_psubusb);
    set_all(t, 0xd9, op_psubusw);
    set_all(t, 0xdb, op_pand);
    set_all(t, 0xdc, op_paddusb);
    set_all(t, 0xdd, op_paddusw);
    set_all(t, 0xdf, op_pandn);
    set_all(t, 0xe1, op_psraw);
    set_all(t, 0xe2, op_psrad);
    set_all(t, 0xe5, op_pmulhw);
    set_all(t, 0xe8, op_psubsb);
    set_all(t, 0xe9, op_psubsw);
    set_all(t, 0xeb, op_por);
    set_all(t, 0xec, op_paddsb);
    set_all(t, 0xed, op_paddsw);
    set_all(t, 0xef, op_pxor);
    set_all(t, 0xf1, op_psllw);
    set_all(t, 0xf2, op_pslld);
    set_all(t, 0xf3, op_psllq);
    set_all(t, 0xf5, op_pmaddwd);
    set_all(t, 0xf8, op_psubb);
    set_all(t, 0xf9, op_psubw);
    set_all(t, 0xfa, op_psubd);
    set_all(t, 0xfc, op_paddb);
    set_all(t, 0xfd, op_paddw);
    set_all(t, 0xfe, op_paddd);
}
