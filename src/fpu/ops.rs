//! The x87 escape opcodes (D8..DF).
//!
//! Every handler starts with the availability gate: with no FPU attached or
//! CR0.EM/CR0.TS set, the ESC raises `#NM` with the return address pointing
//! back at the ESC so a handler can emulate or restore context.

use crate::bus::Bus;
use crate::cpu::{Cpu, OpFn, OpOutcome};
use crate::fpu::{
    ext_from_f64, ext_from_i64, f64_from_ext, i64_from_ext_exact, Fpu, MmxReg, C0, C1, C2, C3,
    TAG_EMPTY, TAG_UINT64,
};
use crate::mem::{CR0_EM, CR0_TS};

/// MMX-aliased registers expose an all-ones sign/exponent word in the
/// architectural register image.
const MMX_EXP_SIGN: u16 = 0xffff;

fn fpu_ready<B: Bus>(cpu: &mut Cpu<B>) -> bool {
    if !cpu.has_fpu || cpu.cr0 & (CR0_EM | CR0_TS) != 0 {
        cpu.x86_int(7);
        return false;
    }
    true
}

impl<B: Bus> Cpu<B> {
    #[inline]
    fn st0(&self) -> f64 {
        self.fpu.st[self.fpu.top]
    }

    #[inline]
    fn st(&self, i: usize) -> f64 {
        self.fpu.st[self.fpu.st_index(i)]
    }

    /// Stores to ST(i); any general FP write invalidates the integer
    /// shadow hint.
    fn set_st(&mut self, i: usize, v: f64) {
        let idx = self.fpu.st_index(i);
        self.fpu.st[idx] = v;
        self.fpu.tag[idx] = Fpu::tag_of(v);
    }

    fn set_st0(&mut self, v: f64) {
        let idx = self.fpu.top;
        self.fpu.st[idx] = v;
        self.fpu.tag[idx] = Fpu::tag_of(v);
    }

    fn record_fpu_ptrs(&mut self, mem_form: bool) {
        self.fpu.pc_off = self.oldpc;
        self.fpu.pc_seg = self.cs.seg;
        if mem_form {
            self.fpu.op_off = self.eaaddr;
            self.fpu.op_seg = self.seg(self.ea_seg).seg;
        }
    }

    /// FCOM-style comparison: C3/C2/C0 = equal/unordered/less.
    fn fpu_compare(&mut self, a: f64, b: f64) {
        self.fpu.npxs &= !(C0 | C2 | C3);
        if a.is_nan() || b.is_nan() {
            self.fpu.npxs |= C0 | C2 | C3;
        } else if a == b {
            self.fpu.npxs |= C3;
        } else if a < b {
            self.fpu.npxs |= C0;
        }
    }

    /// The D8/DA/DE arithmetic family: ST(dst) op `src_val`, with the
    /// reversed-direction subtract/divide encodings folded in.
    fn fpu_arith(&mut self, op: usize, dst: usize, src_val: f64, pop_after: bool) {
        match op {
            0 => {
                let v = self.st(dst) + src_val;
                self.set_st(dst, v);
            }
            1 => {
                let v = self.st(dst) * src_val;
                self.set_st(dst, v);
            }
            2 => {
                let a = self.st(dst);
                self.fpu_compare(a, src_val);
            }
            3 => {
                let a = self.st(dst);
                self.fpu_compare(a, src_val);
                self.fpu.pop();
                return;
            }
            4 => {
                let v = self.st(dst) - src_val;
                self.set_st(dst, v);
            }
            5 => {
                let v = src_val - self.st(dst);
                self.set_st(dst, v);
            }
            6 => {
                let v = self.st(dst) / src_val;
                self.set_st(dst, v);
            }
            _ => {
                let v = src_val / self.st(dst);
                self.set_st(dst, v);
            }
        }
        if pop_after {
            self.fpu.pop();
        }
    }
}

/// D8: single-precision memory arithmetic and the ST(0)-destination
/// register forms.
pub(crate) fn op_d8<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !fpu_ready(cpu) {
        return OpOutcome::BlockEnd;
    }
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    cpu.record_fpu_ptrs(cpu.cpu_mod != 3);
    if cpu.cpu_mod == 3 {
        let src = cpu.st(cpu.cpu_rm);
        let op = cpu.cpu_reg;
        cpu.fpu_arith(op, 0, src, false);
    } else {
        let raw = cpu.geteal();
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        let src = f64::from(f32::from_bits(raw));
        let op = cpu.cpu_reg;
        cpu.fpu_arith(op, 0, src, false);
    }
    cpu.cycles -= 8;
    OpOutcome::Continue
}

/// D9: FLD/FST m32, environment, constants, transcendentals.
pub(crate) fn op_d9<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !fpu_ready(cpu) {
        return OpOutcome::BlockEnd;
    }
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    cpu.record_fpu_ptrs(cpu.cpu_mod != 3);
    cpu.cycles -= 8;
    if cpu.cpu_mod == 3 {
        let rm = cpu.cpu_rm;
        match cpu.cpu_reg {
            0 => {
                // FLD ST(i)
                let v = cpu.st(rm);
                let i64v = cpu.fpu.st_i64[cpu.fpu.st_index(rm)];
                let tag = cpu.fpu.tag[cpu.fpu.st_index(rm)];
                cpu.fpu.push(v);
                cpu.fpu.st_i64[cpu.fpu.top] = i64v;
                cpu.fpu.tag[cpu.fpu.top] = tag;
            }
            1 => {
                // FXCH: swap value, integer shadow and tag.
                let a = cpu.fpu.top;
                let b = cpu.fpu.st_index(rm);
                cpu.fpu.st.swap(a, b);
                cpu.fpu.st_i64.swap(a, b);
                cpu.fpu.tag.swap(a, b);
            }
            2 => {
                // FNOP (D9 D0); anything else is undefined.
                if rm != 0 {
                    cpu.x86illegal();
                    return OpOutcome::BlockEnd;
                }
            }
            3 => {
                // FSTP ST(i)
                let v = cpu.st0();
                cpu.set_st(rm, v);
                cpu.fpu.pop();
            }
            4 => match rm {
                0 => {
                    let v = -cpu.st0();
                    cpu.set_st0(v);
                }
                1 => {
                    let v = cpu.st0().abs();
                    cpu.set_st0(v);
                }
                4 => {
                    let v = cpu.st0();
                    cpu.fpu_compare(v, 0.0);
                }
                5 => {
                    // FXAM
                    let idx = cpu.fpu.top;
                    let v = cpu.fpu.st[idx];
                    cpu.fpu.npxs &= !(C0 | C1 | C2 | C3);
                    if v.is_sign_negative() {
                        cpu.fpu.npxs |= C1;
                    }
                    if cpu.fpu.tag[idx] & 3 == TAG_EMPTY {
                        cpu.fpu.npxs |= C0 | C3;
                    } else if v.is_nan() {
                        cpu.fpu.npxs |= C0;
                    } else if v == 0.0 {
                        cpu.fpu.npxs |= C3;
                    } else if v.is_infinite() {
                        cpu.fpu.npxs |= C0 | C2;
                    } else {
                        cpu.fpu.npxs |= C2;
                    }
                }
                _ => {
                    cpu.x86illegal();
                    return OpOutcome::BlockEnd;
                }
            },
            5 => {
                let v = match rm {
                    0 => 1.0,
                    1 => std::f64::consts::LOG2_10,
                    2 => std::f64::consts::LOG2_E,
                    3 => std::f64::consts::PI,
                    4 => std::f64::consts::LOG10_2,
                    5 => std::f64::consts::LN_2,
                    6 => 0.0,
                    _ => {
                        cpu.x86illegal();
                        return OpOutcome::BlockEnd;
                    }
                };
                cpu.fpu.push(v);
            }
            6 => match rm {
                0 => {
                    let v = cpu.st0().exp2() - 1.0;
                    cpu.set_st0(v);
                }
                1 => {
                    // FYL2X: ST(1) = ST(1) * log2(ST(0)), pop.
                    let v = cpu.st(1) * cpu.st0().log2();
                    cpu.set_st(1, v);
                    cpu.fpu.pop();
                }
                2 => {
                    let v = cpu.st0().tan();
                    cpu.set_st0(v);
                    cpu.fpu.push(1.0);
                    cpu.fpu.npxs &= !C2;
                }
                3 => {
                    // FPATAN: ST(1) = atan2(ST(1), ST(0)), pop.
                    let v = cpu.st(1).atan2(cpu.st0());
                    cpu.set_st(1, v);
                    cpu.fpu.pop();
                }
                4 => {
                    // FXTRACT: split exponent and significand.
                    let v = cpu.st0();
                    let exp = if v == 0.0 {
                        f64::NEG_INFINITY
                    } else {
                        v.abs().log2().floor()
                    };
                    let sig = if v == 0.0 { v } else { v / exp.exp2() };
                    cpu.set_st0(exp);
                    cpu.fpu.push(sig);
                }
                5 => {
                    // FPREM1 (IEEE remainder).
                    let a = cpu.st0();
                    let b = cpu.st(1);
                    let q = (a / b).round();
                    let v = a - q * b;
                    cpu.set_st0(v);
                    set_fprem_cc(cpu, q as i64);
                }
                6 => {
                    cpu.fpu.top = cpu.fpu.top.wrapping_sub(1) & 7;
                }
                _ => {
                    cpu.fpu.top = (cpu.fpu.top + 1) & 7;
                }
            },
            _ => match rm {
                0 => {
                    // FPREM: truncating partial remainder.
                    let a = cpu.st0();
                    let b = cpu.st(1);
                    let q = (a / b).trunc();
                    let v = a - q * b;
                    cpu.set_st0(v);
                    set_fprem_cc(cpu, q as i64);
                }
                1 => {
                    let v = cpu.st(1) * (cpu.st0() + 1.0).log2();
                    cpu.set_st(1, v);
                    cpu.fpu.pop();
                }
                2 => {
                    let v = cpu.st0().sqrt();
                    cpu.set_st0(v);
                }
                3 => {
                    let v = cpu.st0();
                    cpu.set_st0(v.sin());
                    cpu.fpu.push(v.cos());
                    cpu.fpu.npxs &= !C2;
                }
                4 => {
                    let v = cpu.st0();
                    let r = cpu.fpu.round_to_i64(v) as f64;
                    cpu.set_st0(r);
                }
                5 => {
                    // FSCALE: ST(0) *= 2^trunc(ST(1)).
                    let e = cpu.st(1).trunc();
                    let v = cpu.st0() * e.exp2();
                    cpu.set_st0(v);
                }
                6 => {
                    let v = cpu.st0().sin();
                    cpu.set_st0(v);
                    cpu.fpu.npxs &= !C2;
                }
                _ => {
                    let v = cpu.st0().cos();
                    cpu.set_st0(v);
                    cpu.fpu.npxs &= !C2;
                }
            },
        }
        return OpOutcome::Continue;
    }

    match cpu.cpu_reg {
        0 => {
            let raw = cpu.geteal();
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            cpu.fpu.push(f64::from(f32::from_bits(raw)));
        }
        2 | 3 => {
            let v = cpu.st0() as f32;
            cpu.seteal(v.to_bits());
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            if cpu.cpu_reg == 3 {
                cpu.fpu.pop();
            }
        }
        4 => {
            // FLDENV
            fpu_load_env(cpu);
        }
        5 => {
            let cw = cpu.geteaw();
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            cpu.fpu.npxc = cw;
        }
        6 => {
            // FNSTENV
            fpu_store_env(cpu);
        }
        7 => {
            let cw = cpu.fpu.npxc;
            cpu.seteaw(cw);
        }
        _ => {
            cpu.x86illegal();
            return OpOutcome::BlockEnd;
        }
    }
    OpOutcome::Continue
}

fn set_fprem_cc<B: Bus>(cpu: &mut Cpu<B>, q: i64) {
    cpu.fpu.npxs &= !(C0 | C1 | C2 | C3);
    if q & 1 != 0 {
        cpu.fpu.npxs |= C1;
    }
    if q & 2 != 0 {
        cpu.fpu.npxs |= C3;
    }
    if q & 4 != 0 {
        cpu.fpu.npxs |= C0;
    }
}

/// DA: 32-bit integer memory arithmetic; FUCOMPP in register form.
pub(crate) fn op_da<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !fpu_ready(cpu) {
        return OpOutcome::BlockEnd;
    }
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    cpu.record_fpu_ptrs(cpu.cpu_mod != 3);
    cpu.cycles -= 8;
    if cpu.cpu_mod == 3 {
        if cpu.cpu_reg == 5 && cpu.cpu_rm == 1 {
            // FUCOMPP
            let a = cpu.st0();
            let b = cpu.st(1);
            cpu.fpu_compare(a, b);
            cpu.fpu.pop();
            cpu.fpu.pop();
            return OpOutcome::Continue;
        }
        cpu.x86illegal();
        return OpOutcome::BlockEnd;
    }
    let raw = cpu.geteal();
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    let src = f64::from(raw as i32);
    let op = cpu.cpu_reg;
    cpu.fpu_arith(op, 0, src, false);
    OpOutcome::Continue
}

/// DB: FILD/FIST m32, 80-bit load/store, FNCLEX/FNINIT.
pub(crate) fn op_db<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !fpu_ready(cpu) {
        return OpOutcome::BlockEnd;
    }
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    cpu.record_fpu_ptrs(cpu.cpu_mod != 3);
    cpu.cycles -= 8;
    if cpu.cpu_mod == 3 {
        match (cpu.cpu_reg, cpu.cpu_rm) {
            (4, 0) | (4, 1) | (4, 4) => {
                // FENI/FDISI/FSETPM: 287 compatibility no-ops.
            }
            (4, 2) => {
                // FNCLEX
                cpu.fpu.npxs &= !0x80ff;
            }
            (4, 3) => {
                cpu.fpu.init();
            }
            _ => {
                cpu.x86illegal();
                return OpOutcome::BlockEnd;
            }
        }
        return OpOutcome::Continue;
    }
    match cpu.cpu_reg {
        0 => {
            let raw = cpu.geteal();
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            cpu.fpu.push(f64::from(raw as i32));
        }
        2 | 3 => {
            let v = cpu.st0();
            let r = cpu.fpu.round_to_i64(v);
            let clamped = r.max(i64::from(i32::MIN)).min(i64::from(i32::MAX)) as u32;
            cpu.seteal(clamped);
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            if cpu.cpu_reg == 3 {
                cpu.fpu.pop();
            }
        }
        5 => {
            // FLD m80
            let mant = cpu.geteaq();
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            let seg = cpu.easeg;
            let off = cpu.eaaddr;
            let exp_sign = cpu.readmemw(seg, off.wrapping_add(8));
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            cpu.fpu.push(f64_from_ext(mant, exp_sign));
        }
        7 => {
            // FSTP m80
            let (mant, exp_sign) = ext_from_f64(cpu.st0());
            let seg = cpu.easeg;
            let off = cpu.eaaddr;
            cpu.writememq(seg, off, mant);
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            cpu.writememw(seg, off.wrapping_add(8), exp_sign);
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            cpu.fpu.pop();
        }
        _ => {
            cpu.x86illegal();
            return OpOutcome::BlockEnd;
        }
    }
    OpOutcome::Continue
}

/// DC: double-precision memory arithmetic and ST(i)-destination forms.
pub(crate) fn op_dc<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !fpu_ready(cpu) {
        return OpOutcome::BlockEnd;
    }
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    cpu.record_fpu_ptrs(cpu.cpu_mod != 3);
    cpu.cycles -= 8;
    if cpu.cpu_mod == 3 {
        // Destination is ST(i); subtraction/division swap direction.
        let st0 = cpu.st0();
        let rm = cpu.cpu_rm;
        match cpu.cpu_reg {
            0 => {
                let v = cpu.st(rm) + st0;
                cpu.set_st(rm, v);
            }
            1 => {
                let v = cpu.st(rm) * st0;
                cpu.set_st(rm, v);
            }
            4 => {
                let v = st0 - cpu.st(rm);
                cpu.set_st(rm, v);
            }
            5 => {
                let v = cpu.st(rm) - st0;
                cpu.set_st(rm, v);
            }
            6 => {
                let v = st0 / cpu.st(rm);
                cpu.set_st(rm, v);
            }
            7 => {
                let v = cpu.st(rm) / st0;
                cpu.set_st(rm, v);
            }
            _ => {
                cpu.x86illegal();
                return OpOutcome::BlockEnd;
            }
        }
    } else {
        let raw = cpu.geteaq();
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        let src = f64::from_bits(raw);
        let op = cpu.cpu_reg;
        cpu.fpu_arith(op, 0, src, false);
    }
    OpOutcome::Continue
}

/// DD: FLD/FST m64, FSAVE/FRSTOR, FNSTSW m16, FFREE/FUCOM.
pub(crate) fn op_dd<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !fpu_ready(cpu) {
        return OpOutcome::BlockEnd;
    }
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    cpu.record_fpu_ptrs(cpu.cpu_mod != 3);
    cpu.cycles -= 8;
    if cpu.cpu_mod == 3 {
        let rm = cpu.cpu_rm;
        match cpu.cpu_reg {
            0 => {
                let idx = cpu.fpu.st_index(rm);
                cpu.fpu.tag[idx] = TAG_EMPTY;
            }
            2 | 3 => {
                let v = cpu.st0();
                cpu.set_st(rm, v);
                if cpu.cpu_reg == 3 {
                    cpu.fpu.pop();
                }
            }
            4 | 5 => {
                let a = cpu.st0();
                let b = cpu.st(rm);
                cpu.fpu_compare(a, b);
                if cpu.cpu_reg == 5 {
                    cpu.fpu.pop();
                }
            }
            _ => {
                cpu.x86illegal();
                return OpOutcome::BlockEnd;
            }
        }
        return OpOutcome::Continue;
    }
    match cpu.cpu_reg {
        0 => {
            let raw = cpu.geteaq();
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            cpu.fpu.push(f64::from_bits(raw));
        }
        2 | 3 => {
            let v = cpu.st0().to_bits();
            cpu.seteaq(v);
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            if cpu.cpu_reg == 3 {
                cpu.fpu.pop();
            }
        }
        4 => {
            fpu_frstor(cpu);
        }
        6 => {
            fpu_fsave(cpu);
        }
        7 => {
            let sw = cpu.fpu.status();
            cpu.seteaw(sw);
        }
        _ => {
            cpu.x86illegal();
            return OpOutcome::BlockEnd;
        }
    }
    OpOutcome::Continue
}

/// DE: 16-bit integer memory arithmetic and the popping register forms.
pub(crate) fn op_de<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !fpu_ready(cpu) {
        return OpOutcome::BlockEnd;
    }
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    cpu.record_fpu_ptrs(cpu.cpu_mod != 3);
    cpu.cycles -= 8;
    if cpu.cpu_mod == 3 {
        let st0 = cpu.st0();
        let rm = cpu.cpu_rm;
        match cpu.cpu_reg {
            0 => {
                let v = cpu.st(rm) + st0;
                cpu.set_st(rm, v);
                cpu.fpu.pop();
            }
            1 => {
                let v = cpu.st(rm) * st0;
                cpu.set_st(rm, v);
                cpu.fpu.pop();
            }
            3 => {
                if rm != 1 {
                    cpu.x86illegal();
                    return OpOutcome::BlockEnd;
                }
                // FCOMPP
                let b = cpu.st(1);
                cpu.fpu_compare(st0, b);
                cpu.fpu.pop();
                cpu.fpu.pop();
            }
            4 => {
                let v = st0 - cpu.st(rm);
                cpu.set_st(rm, v);
                cpu.fpu.pop();
            }
            5 => {
                let v = cpu.st(rm) - st0;
                cpu.set_st(rm, v);
                cpu.fpu.pop();
            }
            6 => {
                let v = st0 / cpu.st(rm);
                cpu.set_st(rm, v);
                cpu.fpu.pop();
            }
            7 => {
                let v = cpu.st(rm) / st0;
                cpu.set_st(rm, v);
                cpu.fpu.pop();
            }
            _ => {
                cpu.x86illegal();
                return OpOutcome::BlockEnd;
            }
        }
        return OpOutcome::Continue;
    }
    let raw = cpu.geteaw();
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    let src = f64::from(raw as i16);
    let op = cpu.cpu_reg;
    cpu.fpu_arith(op, 0, src, false);
    OpOutcome::Continue
}

/// DF: 16/64-bit integer transfers, packed BCD, FNSTSW AX.
pub(crate) fn op_df<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !fpu_ready(cpu) {
        return OpOutcome::BlockEnd;
    }
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    cpu.record_fpu_ptrs(cpu.cpu_mod != 3);
    cpu.cycles -= 8;
    if cpu.cpu_mod == 3 {
        match (cpu.cpu_reg, cpu.cpu_rm) {
            (0, rm) => {
                // FFREEP
                let idx = cpu.fpu.st_index(rm);
                cpu.fpu.tag[idx] = TAG_EMPTY;
                cpu.fpu.pop();
            }
            (4, 0) => {
                let sw = cpu.fpu.status();
                cpu.regs.set_w(crate::regs::AX, sw);
            }
            _ => {
                cpu.x86illegal();
                return OpOutcome::BlockEnd;
            }
        }
        return OpOutcome::Continue;
    }
    match cpu.cpu_reg {
        0 => {
            let raw = cpu.geteaw();
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            cpu.fpu.push(f64::from(raw as i16));
        }
        2 | 3 => {
            let v = cpu.st0();
            let r = cpu.fpu.round_to_i64(v);
            let clamped = r.max(i64::from(i16::MIN)).min(i64::from(i16::MAX)) as u16;
            cpu.seteaw(clamped);
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            if cpu.cpu_reg == 3 {
                cpu.fpu.pop();
            }
        }
        4 => {
            // FBLD: ten packed BCD bytes, sign in the top byte.
            let seg = cpu.easeg;
            let off = cpu.eaaddr;
            let mut digits = [0u8; 9];
            for (i, d) in digits.iter_mut().enumerate() {
                *d = cpu.readmemb(seg, off.wrapping_add(i as u32));
                if cpu.abrt.is_some() {
                    return OpOutcome::Continue;
                }
            }
            let sign = cpu.readmemb(seg, off.wrapping_add(9));
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            let mut val = 0u64;
            for d in digits.iter().rev() {
                val = val * 100 + u64::from(d >> 4) * 10 + u64::from(d & 0xf);
            }
            let mut v = val as f64;
            if sign & 0x80 != 0 {
                v = -v;
            }
            cpu.fpu.push(v);
        }
        5 => {
            // FILD m64: keep the exact integer in the shadow slot.
            let raw = cpu.geteaq();
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            cpu.fpu.push(raw as i64 as f64);
            cpu.fpu.st_i64[cpu.fpu.top] = raw;
            cpu.fpu.tag[cpu.fpu.top] |= TAG_UINT64;
        }
        6 => {
            // FBSTP
            let v = cpu.st0();
            let r = cpu.fpu.round_to_i64(v);
            let neg = r < 0;
            let mut mag = r.unsigned_abs();
            let seg = cpu.easeg;
            let off = cpu.eaaddr;
            for i in 0..9 {
                let lo = (mag % 10) as u8;
                mag /= 10;
                let hi = (mag % 10) as u8;
                mag /= 10;
                cpu.writememb(seg, off.wrapping_add(i), (hi << 4) | lo);
                if cpu.abrt.is_some() {
                    return OpOutcome::Continue;
                }
            }
            cpu.writememb(seg, off.wrapping_add(9), if neg { 0x80 } else { 0 });
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            cpu.fpu.pop();
        }
        7 => {
            // FISTP m64: use the shadow when the value came from FILD m64.
            let idx = cpu.fpu.top;
            let raw = if cpu.fpu.tag[idx] & TAG_UINT64 != 0 {
                cpu.fpu.st_i64[idx]
            } else {
                cpu.fpu.round_to_i64(cpu.fpu.st[idx]) as u64
            };
            cpu.seteaq(raw);
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            cpu.fpu.pop();
        }
        _ => {
            cpu.x86illegal();
            return OpOutcome::BlockEnd;
        }
    }
    OpOutcome::Continue
}

// --- environment and full-state images ---

/// Stores the 14/28-byte environment; layout follows the operand size.
fn fpu_store_env<B: Bus>(cpu: &mut Cpu<B>) {
    let seg = cpu.easeg;
    let off = cpu.eaaddr;
    let cw = cpu.fpu.npxc;
    let sw = cpu.fpu.status();
    let tag = cpu.fpu.gettag();
    if cpu.opsize32() {
        let words = [
            u32::from(cw),
            u32::from(sw),
            u32::from(tag),
            cpu.fpu.pc_off,
            u32::from(cpu.fpu.pc_seg),
            cpu.fpu.op_off,
            u32::from(cpu.fpu.op_seg),
        ];
        for (i, w) in words.iter().enumerate() {
            cpu.writememl(seg, off.wrapping_add((i as u32) * 4), *w);
            if cpu.abrt.is_some() {
                return;
            }
        }
    } else {
        let words = [
            cw,
            sw,
            tag,
            cpu.fpu.pc_off as u16,
            cpu.fpu.pc_seg,
            cpu.fpu.op_off as u16,
            cpu.fpu.op_seg,
        ];
        for (i, w) in words.iter().enumerate() {
            cpu.writememw(seg, off.wrapping_add((i as u32) * 2), *w);
            if cpu.abrt.is_some() {
                return;
            }
        }
    }
}

fn fpu_load_env<B: Bus>(cpu: &mut Cpu<B>) {
    let seg = cpu.easeg;
    let off = cpu.eaaddr;
    if cpu.opsize32() {
        let mut words = [0u32; 7];
        for (i, w) in words.iter_mut().enumerate() {
            *w = cpu.readmeml(seg, off.wrapping_add((i as u32) * 4));
            if cpu.abrt.is_some() {
                return;
            }
        }
        cpu.fpu.npxc = words[0] as u16;
        cpu.fpu.set_status(words[1] as u16);
        cpu.fpu.settag(words[2] as u16);
        cpu.fpu.pc_off = words[3];
        cpu.fpu.pc_seg = words[4] as u16;
        cpu.fpu.op_off = words[5];
        cpu.fpu.op_seg = words[6] as u16;
    } else {
        let mut words = [0u16; 7];
        for (i, w) in words.iter_mut().enumerate() {
            *w = cpu.readmemw(seg, off.wrapping_add((i as u32) * 2));
            if cpu.abrt.is_some() {
                return;
            }
        }
        cpu.fpu.npxc = words[0];
        cpu.fpu.set_status(words[1]);
        cpu.fpu.settag(words[2]);
        cpu.fpu.pc_off = u32::from(words[3]);
        cpu.fpu.pc_seg = words[4];
        cpu.fpu.op_off = u32::from(words[5]);
        cpu.fpu.op_seg = words[6];
    }
}

/// FNSAVE: environment plus the eight 80-bit registers in stack order,
/// then FNINIT.
///
/// The image carries no private markers: MMX-mode slots are written with
/// the architectural all-ones sign/exponent word, FILD slots with their
/// exact 80-bit integer encoding, everything else as the converted value.
fn fpu_fsave<B: Bus>(cpu: &mut Cpu<B>) {
    fpu_store_env(cpu);
    if cpu.abrt.is_some() {
        return;
    }
    let seg = cpu.easeg;
    let regs_off = cpu.eaaddr.wrapping_add(if cpu.opsize32() { 28 } else { 14 });
    for i in 0..8usize {
        let idx = cpu.fpu.st_index(i);
        let (mant, exp_sign) = if cpu.fpu.ismmx {
            (cpu.fpu.mm[idx].0, MMX_EXP_SIGN)
        } else if cpu.fpu.tag[idx] & TAG_UINT64 != 0 {
            ext_from_i64(cpu.fpu.st_i64[idx] as i64)
        } else {
            ext_from_f64(cpu.fpu.st[idx])
        };
        let off = regs_off.wrapping_add((i as u32) * 10);
        cpu.writememq(seg, off, mant);
        if cpu.abrt.is_some() {
            return;
        }
        cpu.writememw(seg, off.wrapping_add(8), exp_sign);
        if cpu.abrt.is_some() {
            return;
        }
    }
    cpu.fpu.init();
}

/// FRSTOR never infers MMX mode from the image (any 80-bit pattern,
/// including a guest's -NaN or -infinity, is a legitimate register value).
/// Each slot restores the float view into `st` and mirrors the mantissa
/// into the aliased MM view; the FILD shadow is rebuilt only when the
/// image encodes an exact 64-bit integer.
fn fpu_frstor<B: Bus>(cpu: &mut Cpu<B>) {
    fpu_load_env(cpu);
    if cpu.abrt.is_some() {
        return;
    }
    let seg = cpu.easeg;
    let regs_off = cpu.eaaddr.wrapping_add(if cpu.opsize32() { 28 } else { 14 });
    cpu.fpu.ismmx = false;
    for i in 0..8usize {
        let off = regs_off.wrapping_add((i as u32) * 10);
        let mant = cpu.readmemq(seg, off);
        if cpu.abrt.is_some() {
            return;
        }
        let exp_sign = cpu.readmemw(seg, off.wrapping_add(8));
        if cpu.abrt.is_some() {
            return;
        }
        let idx = cpu.fpu.st_index(i);
        cpu.fpu.st[idx] = f64_from_ext(mant, exp_sign);
        cpu.fpu.mm[idx] = MmxReg(mant);
        if cpu.fpu.tag[idx] & 3 != TAG_EMPTY {
            if let Some(v) = i64_from_ext_exact(mant, exp_sign) {
                cpu.fpu.st_i64[idx] = v as u64;
                cpu.fpu.tag[idx] |= TAG_UINT64;
            }
        }
    }
}

/// Registers D8..DF into a primary dispatch table.
pub(crate) fn install<B: Bus>(table: &mut [OpFn<B>]) {
    for variant in 0..4usize {
        let base = variant << 8;
        table[base | 0xd8] = op_d8;
        table[base | 0xd9] = op_d9;
        table[base | 0xda] = op_da;
        table[base | 0xdb] = op_db;
        table[base | 0xdc] = op_dc;
        table[base | 0xdd] = op_dd;
        table[base | 0xde] = op_de;
        table[base | 0xdf] = op_df;
    }
}
