//! System instructions: descriptor table management (group 6/7), LAR/LSL,
//! VERR/VERW, control and debug register moves, CLTS, cache management,
//! CPUID/RDTSC and the MSR pair.

use crate::bus::Bus;
use crate::cpu::{Cpu, OpFn, OpOutcome, SysSeg};
use crate::flags::{VM_FLAG, Z_FLAG};
use crate::interp::set_all;
use crate::mem::{CR0_PE, CR0_TS};
use crate::seg::access_dpl;

impl<B: Bus> Cpu<B> {
    /// Real-mode / V86 gate for protected-mode-only instructions.
    fn require_pmode(&mut self) -> bool {
        if !self.protected() || self.eflags & VM_FLAG != 0 {
            self.x86illegal();
            return false;
        }
        true
    }

    fn require_cpl0(&mut self) -> bool {
        if self.protected() && self.cpl() != 0 {
            self.x86gpf(0);
            return false;
        }
        true
    }
}

/// 0F 00: SLDT/STR/LLDT/LTR/VERR/VERW.
fn grp6<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !cpu.require_pmode() {
        return OpOutcome::BlockEnd;
    }
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    match cpu.cpu_reg {
        0 => {
            let sel = cpu.ldt.seg;
            cpu.seteaw(sel);
        }
        1 => {
            let sel = cpu.tr.seg;
            cpu.seteaw(sel);
        }
        2 => {
            if !cpu.require_cpl0() {
                return OpOutcome::BlockEnd;
            }
            let sel = cpu.geteaw();
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            cpu.load_ldt_from_selector(sel);
        }
        3 => {
            if !cpu.require_cpl0() {
                return OpOutcome::BlockEnd;
            }
            let sel = cpu.geteaw();
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            load_tr(cpu, sel);
        }
        4 | 5 => {
            let sel = cpu.geteaw();
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            let write = cpu.cpu_reg == 5;
            let ok = verify_selector(cpu, sel, write);
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            cpu.lazy.rebuild(&mut cpu.flags);
            cpu.set_flag(Z_FLAG, ok);
        }
        _ => {
            cpu.x86illegal();
            return OpOutcome::BlockEnd;
        }
    }
    cpu.cycles -= 6;
    OpOutcome::Continue
}

fn load_tr<B: Bus>(cpu: &mut Cpu<B>, sel: u16) {
    if sel & 4 != 0 || sel & !7 == 0 {
        cpu.x86gpf(sel & !3);
        return;
    }
    let desc = match cpu.fetch_descriptor(sel) {
        Some(d) => d,
        None => return,
    };
    let access = (desc[2] >> 8) as u8;
    if access & 0x1d != 0x09 && access & 0x1d != 0x01 {
        // Must be an available TSS (286 or 386).
        cpu.x86gpf(sel & !3);
        return;
    }
    if access & 0x80 == 0 {
        cpu.abort(crate::cpu::Fault::Np(sel & !3));
        return;
    }
    let mut limit = u32::from(desc[0]) | (u32::from(desc[3] & 0x000f) << 16);
    if desc[3] & 0x0080 != 0 {
        limit = (limit << 12) | 0xfff;
    }
    cpu.tr = SysSeg {
        seg: sel,
        base: u32::from(desc[1])
            | (u32::from(desc[2] & 0xff) << 16)
            | (u32::from(desc[3] & 0xff00) << 16),
        limit,
        access: access | 0x02,
    };
    // Mark the TSS busy.
    cpu.write_descriptor_access(sel, desc[2] | 0x0200);
}

fn verify_selector<B: Bus>(cpu: &mut Cpu<B>, sel: u16, write: bool) -> bool {
    if sel & !3 == 0 {
        return false;
    }
    let desc = match cpu.fetch_descriptor(sel) {
        Some(d) => d,
        None => {
            // Out-of-table selectors clear ZF without faulting.
            cpu.abrt = None;
            return false;
        }
    };
    let access = (desc[2] >> 8) as u8;
    if access & 0x10 == 0 {
        return false;
    }
    let dpl = access_dpl(access);
    let rpl = (sel & 3) as u8;
    if access & 0x0c != 0x0c && dpl < rpl.max(cpu.cpl()) {
        return false;
    }
    if write {
        access & 0x0a == 0x02
    } else {
        access & 0x08 == 0 || access & 0x02 != 0
    }
}

/// 0F 01: SGDT/SIDT/LGDT/LIDT/SMSW/LMSW/INVLPG.
fn grp7<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    match cpu.cpu_reg {
        0 | 1 => {
            if cpu.cpu_mod == 3 {
                cpu.x86illegal();
                return OpOutcome::BlockEnd;
            }
            let table = if cpu.cpu_reg == 0 { cpu.gdt } else { cpu.idt };
            let seg = cpu.easeg;
            let addr = cpu.eaaddr;
            cpu.writememw(seg, addr, table.limit as u16);
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            cpu.writememl(seg, addr.wrapping_add(2), table.base);
        }
        2 | 3 => {
            if cpu.cpu_mod == 3 {
                cpu.x86illegal();
                return OpOutcome::BlockEnd;
            }
            if !cpu.require_cpl0() {
                return OpOutcome::BlockEnd;
            }
            let seg = cpu.easeg;
            let addr = cpu.eaaddr;
            let limit = cpu.readmemw(seg, addr);
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            let mut base = cpu.readmeml(seg, addr.wrapping_add(2));
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            if !cpu.opsize32() {
                base &= 0x00ff_ffff;
            }
            let table = crate::cpu::DescTable {
                base,
                limit: u32::from(limit),
            };
            if cpu.cpu_reg == 2 {
                cpu.gdt = table;
            } else {
                cpu.idt = table;
            }
        }
        4 => {
            let msw = cpu.cr0 as u16;
            cpu.seteaw(msw);
        }
        6 => {
            if !cpu.require_cpl0() {
                return OpOutcome::BlockEnd;
            }
            let v = cpu.geteaw();
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            // LMSW can set but never clear PE.
            let new = (cpu.cr0 & !0x000e) | u32::from(v & 0x000e) | (cpu.cr0 & CR0_PE)
                | u32::from(v & CR0_PE as u16);
            cpu.write_cr0(new);
        }
        7 => {
            if cpu.cpu_mod == 3 || !cpu.is486 {
                cpu.x86illegal();
                return OpOutcome::BlockEnd;
            }
            if !cpu.require_cpl0() {
                return OpOutcome::BlockEnd;
            }
            let seg = cpu.easeg;
            let addr = cpu.eaaddr;
            let lin = seg.raw().wrapping_add(addr);
            cpu.flush_mmu_page(lin);
        }
        _ => {
            cpu.x86illegal();
            return OpOutcome::BlockEnd;
        }
    }
    cpu.cycles -= 6;
    OpOutcome::Continue
}

impl<B: Bus> Cpu<B> {
    /// CR0 writes invalidate translation state when paging or protection
    /// bits change.
    pub(crate) fn write_cr0(&mut self, new: u32) {
        let old = self.cr0;
        self.cr0 = new;
        if (old ^ new) & !0xe != 0 {
            self.flush_mmu_cache();
        }
        if (old ^ new) & (crate::mem::CR0_PG | CR0_PE | crate::mem::CR0_CD) != 0 {
            self.invalidate_code_cache();
        }
    }
}

/// 0F 02: LAR.
fn op_lar<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !cpu.require_pmode() {
        return OpOutcome::BlockEnd;
    }
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    let sel = cpu.geteaw();
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    let visible = lar_lsl_visible(cpu, sel, false);
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    cpu.lazy.rebuild(&mut cpu.flags);
    match visible {
        Some(desc) => {
            cpu.set_flag(Z_FLAG, true);
            if cpu.opsize32() {
                let ar = (u32::from(desc[2]) & 0xff00) | ((u32::from(desc[3]) & 0x00f0) << 16);
                cpu.regs.set_l(cpu.cpu_reg, ar);
            } else {
                cpu.regs.set_w(cpu.cpu_reg, desc[2] & 0xff00);
            }
        }
        None => cpu.set_flag(Z_FLAG, false),
    }
    cpu.cycles -= 11;
    OpOutcome::Continue
}

/// 0F 03: LSL.
fn op_lsl<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !cpu.require_pmode() {
        return OpOutcome::BlockEnd;
    }
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    let sel = cpu.geteaw();
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    let visible = lar_lsl_visible(cpu, sel, true);
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    cpu.lazy.rebuild(&mut cpu.flags);
    match visible {
        Some(desc) => {
            let mut limit = u32::from(desc[0]) | (u32::from(desc[3] & 0x000f) << 16);
            if desc[3] & 0x0080 != 0 {
                limit = (limit << 12) | 0xfff;
            }
            cpu.set_flag(Z_FLAG, true);
            if cpu.opsize32() {
                cpu.regs.set_l(cpu.cpu_reg, limit);
            } else {
                cpu.regs.set_w(cpu.cpu_reg, limit as u16);
            }
        }
        None => cpu.set_flag(Z_FLAG, false),
    }
    cpu.cycles -= 11;
    OpOutcome::Continue
}

fn lar_lsl_visible<B: Bus>(cpu: &mut Cpu<B>, sel: u16, lsl: bool) -> Option<[u16; 4]> {
    if sel & !3 == 0 {
        return None;
    }
    let desc = match cpu.fetch_descriptor(sel) {
        Some(d) => d,
        None => {
            cpu.abrt = None;
            return None;
        }
    };
    let access = (desc[2] >> 8) as u8;
    if access & 0x10 == 0 {
        // System descriptors: only some types are visible.
        let visible = if lsl {
            matches!(access & 0x0f, 0x01 | 0x02 | 0x03 | 0x09 | 0x0b)
        } else {
            matches!(
                access & 0x0f,
                0x01 | 0x02 | 0x03 | 0x04 | 0x05 | 0x09 | 0x0b | 0x0c
            )
        };
        if !visible {
            return None;
        }
    } else if access & 0x0c != 0x0c {
        // Privilege applies except for conforming code.
        let dpl = access_dpl(access);
        if dpl < ((sel & 3) as u8).max(cpu.cpl()) {
            return None;
        }
    }
    Some(desc)
}

/// 0F 06: CLTS.
fn op_clts<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    if !cpu.require_cpl0() {
        return OpOutcome::BlockEnd;
    }
    cpu.cr0 &= !CR0_TS;
    cpu.cycles -= 5;
    OpOutcome::Continue
}

/// 0F 08/09: INVD/WBINVD — cache model is a no-op here.
fn op_invd<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    if !cpu.is486 {
        cpu.x86illegal();
        return OpOutcome::BlockEnd;
    }
    if !cpu.require_cpl0() {
        return OpOutcome::BlockEnd;
    }
    cpu.cycles -= 4;
    OpOutcome::Continue
}

/// 0F 20/21/22/23: control and debug register moves.
fn op_mov_r_crx<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !cpu.require_cpl0() {
        return OpOutcome::BlockEnd;
    }
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    let v = match cpu.cpu_reg {
        0 => cpu.cr0,
        2 => cpu.cr2,
        3 => cpu.cr3,
        4 => cpu.cr4,
        _ => {
            cpu.x86illegal();
            return OpOutcome::BlockEnd;
        }
    };
    cpu.regs.set_l(cpu.cpu_rm, v);
    cpu.cycles -= 6;
    OpOutcome::Continue
}

fn op_mov_crx_r<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !cpu.require_cpl0() {
        return OpOutcome::BlockEnd;
    }
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    let v = cpu.regs.l(cpu.cpu_rm);
    match cpu.cpu_reg {
        0 => cpu.write_cr0(v),
        2 => cpu.cr2 = v,
        3 => {
            cpu.cr3 = v;
            cpu.flush_mmu_cache();
        }
        4 => cpu.cr4 = v,
        _ => {
            cpu.x86illegal();
            return OpOutcome::BlockEnd;
        }
    }
    cpu.cycles -= 10;
    OpOutcome::BlockEnd
}

fn op_mov_r_drx<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !cpu.require_cpl0() {
        return OpOutcome::BlockEnd;
    }
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    let v = cpu.dr[cpu.cpu_reg & 7];
    cpu.regs.set_l(cpu.cpu_rm, v);
    cpu.cycles -= 6;
    OpOutcome::Continue
}

fn op_mov_drx_r<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !cpu.require_cpl0() {
        return OpOutcome::BlockEnd;
    }
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    cpu.dr[cpu.cpu_reg & 7] = cpu.regs.l(cpu.cpu_rm);
    cpu.cycles -= 6;
    OpOutcome::Continue
}

/// 0F 30/31/32: WRMSR, RDTSC, RDMSR.
fn op_wrmsr<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    if !cpu.require_cpl0() {
        return OpOutcome::BlockEnd;
    }
    let msr = cpu.regs.l(1);
    if msr == 0x10 {
        cpu.tsc = (u64::from(cpu.regs.l(2)) << 32) | u64::from(cpu.regs.l(0));
    }
    cpu.cycles -= 9;
    OpOutcome::Continue
}

fn op_rdtsc<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    if cpu.cr4 & (1 << 2) != 0 && cpu.cpl() != 0 {
        cpu.x86gpf(0);
        return OpOutcome::BlockEnd;
    }
    cpu.regs.set_l(0, cpu.tsc as u32);
    cpu.regs.set_l(2, (cpu.tsc >> 32) as u32);
    cpu.cycles -= 9;
    OpOutcome::Continue
}

fn op_rdmsr<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    if !cpu.require_cpl0() {
        return OpOutcome::BlockEnd;
    }
    let msr = cpu.regs.l(1);
    let v = if msr == 0x10 { cpu.tsc } else { 0 };
    cpu.regs.set_l(0, v as u32);
    cpu.regs.set_l(2, (v >> 32) as u32);
    cpu.cycles -= 9;
    OpOutcome::Continue
}

/// 0F A2: CPUID.
fn op_cpuid<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    match cpu.regs.l(0) {
        0 => {
            cpu.regs.set_l(0, 1);
            cpu.regs.set_l(3, 0x756e_6547); // "Genu" in EBX
            cpu.regs.set_l(2, 0x4965_6e69); // "ineI" in EDX
            cpu.regs.set_l(1, 0x6c65_746e); // "ntel" in ECX
        }
        1 => {
            // Family 5 with FPU/TSC/MSR/CX8/MMX when an FPU is attached,
            // else a bare 486SX profile.
            let (sig, features) = if cpu.has_fpu {
                (0x0543, 0x0080_0131)
            } else {
                (0x0420, 0x0000_0130)
            };
            cpu.regs.set_l(0, sig);
            cpu.regs.set_l(3, 0);
            cpu.regs.set_l(1, 0);
            cpu.regs.set_l(2, features);
        }
        _ => {
            cpu.regs.set_l(0, 0);
            cpu.regs.set_l(1, 0);
            cpu.regs.set_l(2, 0);
            cpu.regs.set_l(3, 0);
        }
    }
    cpu.cycles -= 9;
    OpOutcome::Continue
}

pub(crate) fn install_0f<B: Bus>(t: &mut [OpFn<B>]) {
    set_all(t, 0x00, grp6);
    set_all(t, 0x01, grp7);
    set_all(t, 0x02, op_lar);
    set_all(t, 0x03, op_lsl);
    set_all(t, 0x06, op_clts);
    set_all(t, 0x08, op_invd);
    set_all(t, 0x09, op_invd);
    set_all(t, 0x20, op_mov_r_crx);
    set_all(t, 0x21, op_mov_r_drx);
    set_all(t, 0x22, op_mov_crx_r);
    set_all(t, 0x23, op_mov_drx_r);
    set_all(t, 0x30, op_wrmsr);
    set_all(t, 0x31, op_rdtsc);
    set_all(t, 0x32, op_rdmsr);
    set_all(t, 0xa2, op_cpuid);
}
