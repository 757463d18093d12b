//! String instructions and the REP iteration engine.
//!
//! A REP prefix enters [`rep`], which accumulates any further prefixes,
//! then iterates the string opcode against a cycle budget. When the budget
//! runs out with the counter still non-zero, `pc` rewinds to the prefix so
//! the next dispatch re-enters the iteration naturally; a fault mid-
//! iteration restores the pre-iteration registers the same way, which is
//! what makes REP restartable across page faults.

use crate::bus::Bus;
use crate::cpu::{Cpu, OpFn, OpOutcome};
use crate::flags::{D_FLAG, FlagOp};
use crate::interp::set_all;
use crate::regs::{CX, DI, DX, SI};
use crate::seg::SegReg;

impl<B: Bus> Cpu<B> {
    #[inline]
    fn str_index(&self, reg: usize) -> u32 {
        if self.addr32() {
            self.regs.l(reg)
        } else {
            u32::from(self.regs.w(reg))
        }
    }

    #[inline]
    fn str_advance(&mut self, reg: usize, size: u32) {
        let delta = if self.flags & D_FLAG != 0 {
            size.wrapping_neg()
        } else {
            size
        };
        if self.addr32() {
            let v = self.regs.l(reg).wrapping_add(delta);
            self.regs.set_l(reg, v);
        } else {
            let v = self.regs.w(reg).wrapping_add(delta as u16);
            self.regs.set_w(reg, v);
        }
    }

    fn str_counter(&self) -> u32 {
        if self.addr32() {
            self.regs.l(CX)
        } else {
            u32::from(self.regs.w(CX))
        }
    }

    fn set_str_counter(&mut self, c: u32) {
        if self.addr32() {
            self.regs.set_l(CX, c);
        } else {
            self.regs.set_w(CX, c as u16);
        }
    }

    fn str_element_size(&self) -> u32 {
        if self.opsize32() {
            4
        } else {
            2
        }
    }
}

// --- single-shot forms ---

fn op_movsb<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let src_seg = cpu.seg(cpu.ea_seg).base;
    let si = cpu.str_index(SI);
    let di = cpu.str_index(DI);
    let v = cpu.readmemb(src_seg, si);
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    let es = cpu.es.base;
    cpu.writememb(es, di, v);
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    cpu.str_advance(SI, 1);
    cpu.str_advance(DI, 1);
    cpu.cycles -= 7;
    OpOutcome::Continue
}

fn op_movsw<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let size = cpu.str_element_size();
    let src_seg = cpu.seg(cpu.ea_seg).base;
    let si = cpu.str_index(SI);
    let di = cpu.str_index(DI);
    if size == 4 {
        let v = cpu.readmeml(src_seg, si);
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        let es = cpu.es.base;
        cpu.writememl(es, di, v);
    } else {
        let v = cpu.readmemw(src_seg, si);
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        let es = cpu.es.base;
        cpu.writememw(es, di, v);
    }
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    cpu.str_advance(SI, size);
    cpu.str_advance(DI, size);
    cpu.cycles -= 7;
    OpOutcome::Continue
}

fn op_cmpsb<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let src_seg = cpu.seg(cpu.ea_seg).base;
    let si = cpu.str_index(SI);
    let di = cpu.str_index(DI);
    let a = cpu.readmemb(src_seg, si);
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    let es = cpu.es.base;
    let b = cpu.readmemb(es, di);
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    cpu.lazy.set_sub(FlagOp::Sub8, u32::from(a), u32::from(b));
    cpu.str_advance(SI, 1);
    cpu.str_advance(DI, 1);
    cpu.cycles -= 10;
    OpOutcome::Continue
}

fn op_cmpsw<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let size = cpu.str_element_size();
    let src_seg = cpu.seg(cpu.ea_seg).base;
    let si = cpu.str_index(SI);
    let di = cpu.str_index(DI);
    let es = cpu.es.base;
    if size == 4 {
        let a = cpu.readmeml(src_seg, si);
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        let b = cpu.readmeml(es, di);
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        cpu.lazy.set_sub(FlagOp::Sub32, a, b);
    } else {
        let a = cpu.readmemw(src_seg, si);
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        let b = cpu.readmemw(es, di);
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        cpu.lazy.set_sub(FlagOp::Sub16, u32::from(a), u32::from(b));
    }
    cpu.str_advance(SI, size);
    cpu.str_advance(DI, size);
    cpu.cycles -= 10;
    OpOutcome::Continue
}

fn op_stosb<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let di = cpu.str_index(DI);
    let es = cpu.es.base;
    let v = cpu.regs.b(0);
    cpu.writememb(es, di, v);
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    cpu.str_advance(DI, 1);
    cpu.cycles -= 4;
    OpOutcome::Continue
}

fn op_stosw<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let size = cpu.str_element_size();
    let di = cpu.str_index(DI);
    let es = cpu.es.base;
    if size == 4 {
        let v = cpu.regs.l(0);
        cpu.writememl(es, di, v);
    } else {
        let v = cpu.regs.w(0);
        cpu.writememw(es, di, v);
    }
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    cpu.str_advance(DI, size);
    cpu.cycles -= 4;
    OpOutcome::Continue
}

fn op_lodsb<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let si = cpu.str_index(SI);
    if !cpu.check_read(cpu.ea_seg, si, si) {
        return OpOutcome::BlockEnd;
    }
    let src_seg = cpu.seg(cpu.ea_seg).base;
    let v = cpu.readmemb(src_seg, si);
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    cpu.regs.set_b(0, v);
    cpu.str_advance(SI, 1);
    cpu.cycles -= 5;
    OpOutcome::Continue
}

fn op_lodsw<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let size = cpu.str_element_size();
    let si = cpu.str_index(SI);
    if !cpu.check_read(cpu.ea_seg, si, si.wrapping_add(size - 1)) {
        return OpOutcome::BlockEnd;
    }
    let src_seg = cpu.seg(cpu.ea_seg).base;
    if size == 4 {
        let v = cpu.readmeml(src_seg, si);
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        cpu.regs.set_l(0, v);
    } else {
        let v = cpu.readmemw(src_seg, si);
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        cpu.regs.set_w(0, v);
    }
    cpu.str_advance(SI, size);
    cpu.cycles -= 5;
    OpOutcome::Continue
}

fn op_scasb<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let di = cpu.str_index(DI);
    let es = cpu.es.base;
    let b = cpu.readmemb(es, di);
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    let a = cpu.regs.b(0);
    cpu.lazy.set_sub(FlagOp::Sub8, u32::from(a), u32::from(b));
    cpu.str_advance(DI, 1);
    cpu.cycles -= 7;
    OpOutcome::Continue
}

fn op_scasw<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let size = cpu.str_element_size();
    let di = cpu.str_index(DI);
    let es = cpu.es.base;
    if size == 4 {
        let b = cpu.readmeml(es, di);
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        let a = cpu.regs.l(0);
        cpu.lazy.set_sub(FlagOp::Sub32, a, b);
    } else {
        let b = cpu.readmemw(es, di);
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        let a = cpu.regs.w(0);
        cpu.lazy.set_sub(FlagOp::Sub16, u32::from(a), u32::from(b));
    }
    cpu.str_advance(DI, size);
    cpu.cycles -= 7;
    OpOutcome::Continue
}

fn op_insb<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let port = cpu.regs.w(DX);
    if !cpu.check_io_perm(port) {
        return OpOutcome::BlockEnd;
    }
    let di = cpu.str_index(DI);
    let v = cpu.bus.io_in_b(port);
    let es = cpu.es.base;
    cpu.writememb(es, di, v);
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    cpu.str_advance(DI, 1);
    cpu.cycles -= 15;
    OpOutcome::Continue
}

fn op_insw<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let size = cpu.str_element_size();
    let port = cpu.regs.w(DX);
    if !cpu.check_io_perm(port) {
        return OpOutcome::BlockEnd;
    }
    let di = cpu.str_index(DI);
    let es = cpu.es.base;
    if size == 4 {
        let v = cpu.bus.io_in_l(port);
        cpu.writememl(es, di, v);
    } else {
        let v = cpu.bus.io_in_w(port);
        cpu.writememw(es, di, v);
    }
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    cpu.str_advance(DI, size);
    cpu.cycles -= 15;
    OpOutcome::Continue
}

fn op_outsb<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let src_seg = cpu.seg(cpu.ea_seg).base;
    let si = cpu.str_index(SI);
    let v = cpu.readmemb(src_seg, si);
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    let port = cpu.regs.w(DX);
    if !cpu.check_io_perm(port) {
        return OpOutcome::BlockEnd;
    }
    cpu.bus.io_out_b(port, v);
    cpu.str_advance(SI, 1);
    cpu.cycles -= 14;
    OpOutcome::Continue
}

fn op_outsw<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let size = cpu.str_element_size();
    let src_seg = cpu.seg(cpu.ea_seg).base;
    let si = cpu.str_index(SI);
    let port = cpu.regs.w(DX);
    if size == 4 {
        let v = cpu.readmeml(src_seg, si);
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        if !cpu.check_io_perm(port) {
            return OpOutcome::BlockEnd;
        }
        cpu.bus.io_out_l(port, v);
    } else {
        let v = cpu.readmemw(src_seg, si);
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        if !cpu.check_io_perm(port) {
            return OpOutcome::BlockEnd;
        }
        cpu.bus.io_out_w(port, v);
    }
    cpu.str_advance(SI, size);
    cpu.cycles -= 14;
    OpOutcome::Continue
}

// --- the REP engine ---

/// Executes a REP/REPE/REPNE-prefixed instruction. `fv` is the ZF value
/// that keeps a compare/scan iteration going (true for REPE, false for
/// REPNE); plain string moves ignore it.
pub(crate) fn rep<B: Bus>(cpu: &mut Cpu<B>, fv: bool) -> OpOutcome {
    let ipc = cpu.oldpc;
    // Cap uninterruptible time so high-frequency timers stay responsive;
    // the budgets differ between interpreter and recompiler dispatch.
    let budget = if cpu.in_dynarec {
        cpu.rep_cycles_dyn
    } else {
        cpu.rep_cycles_int
    };
    let mut cycles_end = cpu.cycles - budget;
    if cpu.trap {
        // One iteration per single-step trap.
        cycles_end = cpu.cycles + 1;
    }

    cpu.lazy.rebuild(&mut cpu.flags);
    let saved_flags = cpu.flags;
    let str_cost: i32 = if cpu.is486 { 3 } else { 4 };
    let cmp_cost: i32 = if cpu.is486 { 5 } else { 8 };

    loop {
        let opcode = cpu.getbyte();
        if cpu.abrt.is_some() {
            break;
        }
        cpu.opcode = opcode;
        match opcode {
            0x26 => {
                cpu.ea_seg = SegReg::Es;
                cpu.ssegs = true;
                continue;
            }
            0x2e => {
                cpu.ea_seg = SegReg::Cs;
                cpu.ssegs = true;
                continue;
            }
            0x36 => {
                cpu.ea_seg = SegReg::Ss;
                cpu.ssegs = true;
                continue;
            }
            0x3e => {
                cpu.ea_seg = SegReg::Ds;
                cpu.ssegs = true;
                continue;
            }
            0x64 => {
                cpu.ea_seg = SegReg::Fs;
                cpu.ssegs = true;
                continue;
            }
            0x65 => {
                cpu.ea_seg = SegReg::Gs;
                cpu.ssegs = true;
                continue;
            }
            0x66 => {
                cpu.op32 ^= 0x100;
                continue;
            }
            0x67 => {
                cpu.op32 ^= 0x200;
                continue;
            }
            0xc3 => {
                // A stray RET after REP executes on its own.
                cpu.pc = cpu.pc.wrapping_sub(1);
            }
            0x90 => {
                // REP NOP.
            }
            0x6c | 0x6d => {
                // REP INS: one element per slice, I/O permission per
                // element.
                let mut c = cpu.str_counter();
                if c > 0 {
                    let size = if opcode == 0x6c { 1 } else { cpu.str_element_size() };
                    let port = cpu.regs.w(DX);
                    if !cpu.check_io_perm(port) {
                        break;
                    }
                    let di = cpu.str_index(DI);
                    let es = cpu.es.base;
                    match size {
                        1 => {
                            let v = cpu.bus.io_in_b(port);
                            cpu.writememb(es, di, v);
                        }
                        2 => {
                            let v = cpu.bus.io_in_w(port);
                            cpu.writememw(es, di, v);
                        }
                        _ => {
                            let v = cpu.bus.io_in_l(port);
                            cpu.writememl(es, di, v);
                        }
                    }
                    if cpu.abrt.is_some() {
                        break;
                    }
                    cpu.str_advance(DI, size);
                    c -= 1;
                    cpu.set_str_counter(c);
                    cpu.cycles -= 15;
                }
                if c > 0 {
                    cpu.firstrepcycle = false;
                    cpu.pc = ipc;
                } else {
                    cpu.firstrepcycle = true;
                }
            }
            0x6e | 0x6f => {
                let mut c = cpu.str_counter();
                if c > 0 {
                    let size = if opcode == 0x6e { 1 } else { cpu.str_element_size() };
                    let src_seg = cpu.seg(cpu.ea_seg).base;
                    let si = cpu.str_index(SI);
                    let port = cpu.regs.w(DX);
                    match size {
                        1 => {
                            let v = cpu.readmemb(src_seg, si);
                            if cpu.abrt.is_some() {
                                break;
                            }
                            if !cpu.check_io_perm(port) {
                                break;
                            }
                            cpu.bus.io_out_b(port, v);
                        }
                        2 => {
                            let v = cpu.readmemw(src_seg, si);
                            if cpu.abrt.is_some() {
                                break;
                            }
                            if !cpu.check_io_perm(port) {
                                break;
                            }
                            cpu.bus.io_out_w(port, v);
                        }
                        _ => {
                            let v = cpu.readmeml(src_seg, si);
                            if cpu.abrt.is_some() {
                                break;
                            }
                            if !cpu.check_io_perm(port) {
                                break;
                            }
                            cpu.bus.io_out_l(port, v);
                        }
                    }
                    cpu.str_advance(SI, size);
                    c -= 1;
                    cpu.set_str_counter(c);
                    cpu.cycles -= 14;
                }
                if c > 0 {
                    cpu.firstrepcycle = false;
                    cpu.pc = ipc;
                } else {
                    cpu.firstrepcycle = true;
                }
            }
            0xa4 | 0xa5 => {
                // REP MOVS.
                let size = if opcode == 0xa4 { 1 } else { cpu.str_element_size() };
                let mut c = cpu.str_counter();
                while c > 0 {
                    let di = cpu.str_index(DI);
                    if !cpu.check_write(SegReg::Es, di, di.wrapping_add(size - 1)) {
                        break;
                    }
                    let src_seg = cpu.seg(cpu.ea_seg).base;
                    let si = cpu.str_index(SI);
                    let es = cpu.es.base;
                    match size {
                        1 => {
                            let v = cpu.readmemb(src_seg, si);
                            if cpu.abrt.is_some() {
                                break;
                            }
                            cpu.writememb(es, di, v);
                        }
                        2 => {
                            let v = cpu.readmemw(src_seg, si);
                            if cpu.abrt.is_some() {
                                break;
                            }
                            cpu.writememw(es, di, v);
                        }
                        _ => {
                            let v = cpu.readmeml(src_seg, si);
                            if cpu.abrt.is_some() {
                                break;
                            }
                            cpu.writememl(es, di, v);
                        }
                    }
                    if cpu.abrt.is_some() {
                        break;
                    }
                    cpu.str_advance(SI, size);
                    cpu.str_advance(DI, size);
                    c -= 1;
                    cpu.set_str_counter(c);
                    cpu.cycles -= str_cost;
                    if cpu.cycles < cycles_end {
                        break;
                    }
                }
                if c > 0 && cpu.abrt.is_none() {
                    cpu.firstrepcycle = false;
                    cpu.pc = ipc;
                } else if cpu.abrt.is_some() {
                    cpu.pc = ipc;
                } else {
                    cpu.firstrepcycle = true;
                }
            }
            0xaa | 0xab => {
                // REP STOS.
                let size = if opcode == 0xaa { 1 } else { cpu.str_element_size() };
                let mut c = cpu.str_counter();
                while c > 0 {
                    let di = cpu.str_index(DI);
                    if !cpu.check_write(SegReg::Es, di, di.wrapping_add(size - 1)) {
                        break;
                    }
                    let es = cpu.es.base;
                    match size {
                        1 => {
                            let v = cpu.regs.b(0);
                            cpu.writememb(es, di, v);
                        }
                        2 => {
                            let v = cpu.regs.w(0);
                            cpu.writememw(es, di, v);
                        }
                        _ => {
                            let v = cpu.regs.l(0);
                            cpu.writememl(es, di, v);
                        }
                    }
                    if cpu.abrt.is_some() {
                        break;
                    }
                    cpu.str_advance(DI, size);
                    c -= 1;
                    cpu.set_str_counter(c);
                    cpu.cycles -= str_cost;
                    if cpu.cycles < cycles_end {
                        break;
                    }
                }
                if c > 0 && cpu.abrt.is_none() {
                    cpu.firstrepcycle = false;
                    cpu.pc = ipc;
                } else if cpu.abrt.is_some() {
                    cpu.pc = ipc;
                } else {
                    cpu.firstrepcycle = true;
                }
            }
            0xac | 0xad => {
                // REP LODS.
                let size = if opcode == 0xac { 1 } else { cpu.str_element_size() };
                let mut c = cpu.str_counter();
                while c > 0 {
                    let src_seg = cpu.seg(cpu.ea_seg).base;
                    let si = cpu.str_index(SI);
                    match size {
                        1 => {
                            let v = cpu.readmemb(src_seg, si);
                            if cpu.abrt.is_some() {
                                break;
                            }
                            cpu.regs.set_b(0, v);
                        }
                        2 => {
                            let v = cpu.readmemw(src_seg, si);
                            if cpu.abrt.is_some() {
                                break;
                            }
                            cpu.regs.set_w(0, v);
                        }
                        _ => {
                            let v = cpu.readmeml(src_seg, si);
                            if cpu.abrt.is_some() {
                                break;
                            }
                            cpu.regs.set_l(0, v);
                        }
                    }
                    cpu.str_advance(SI, size);
                    c -= 1;
                    cpu.set_str_counter(c);
                    cpu.cycles -= str_cost;
                    if cpu.cycles < cycles_end {
                        break;
                    }
                }
                if c > 0 && cpu.abrt.is_none() {
                    cpu.firstrepcycle = false;
                    cpu.pc = ipc;
                } else if cpu.abrt.is_some() {
                    cpu.pc = ipc;
                } else {
                    cpu.firstrepcycle = true;
                }
            }
            0xa6 | 0xa7 => {
                // REPE/REPNE CMPS.
                let size = if opcode == 0xa6 { 1 } else { cpu.str_element_size() };
                let mut c = cpu.str_counter();
                let mut zf_matches = fv;
                while c > 0 && fv == zf_matches {
                    let src_seg = cpu.seg(cpu.ea_seg).base;
                    let si = cpu.str_index(SI);
                    let di = cpu.str_index(DI);
                    let es = cpu.es.base;
                    match size {
                        1 => {
                            let a = cpu.readmemb(src_seg, si);
                            if cpu.abrt.is_none() {
                                let b = cpu.readmemb(es, di);
                                if cpu.abrt.is_none() {
                                    cpu.lazy.set_sub(FlagOp::Sub8, u32::from(a), u32::from(b));
                                }
                            }
                        }
                        2 => {
                            let a = cpu.readmemw(src_seg, si);
                            if cpu.abrt.is_none() {
                                let b = cpu.readmemw(es, di);
                                if cpu.abrt.is_none() {
                                    cpu.lazy.set_sub(FlagOp::Sub16, u32::from(a), u32::from(b));
                                }
                            }
                        }
                        _ => {
                            let a = cpu.readmeml(src_seg, si);
                            if cpu.abrt.is_none() {
                                let b = cpu.readmeml(es, di);
                                if cpu.abrt.is_none() {
                                    cpu.lazy.set_sub(FlagOp::Sub32, a, b);
                                }
                            }
                        }
                    }
                    if cpu.abrt.is_some() {
                        cpu.flags = saved_flags;
                        cpu.lazy.extract();
                        break;
                    }
                    zf_matches = cpu.zf();
                    cpu.str_advance(SI, size);
                    cpu.str_advance(DI, size);
                    c -= 1;
                    cpu.set_str_counter(c);
                    cpu.cycles -= cmp_cost;
                    if cpu.cycles < cycles_end {
                        break;
                    }
                }
                if cpu.abrt.is_some() {
                    cpu.pc = ipc;
                } else if c > 0 && fv == zf_matches {
                    cpu.firstrepcycle = false;
                    cpu.pc = ipc;
                } else {
                    cpu.firstrepcycle = true;
                }
            }
            0xae | 0xaf => {
                // REPE/REPNE SCAS.
                let size = if opcode == 0xae { 1 } else { cpu.str_element_size() };
                let mut c = cpu.str_counter();
                let mut zf_matches = fv;
                while c > 0 && fv == zf_matches {
                    let di = cpu.str_index(DI);
                    let es = cpu.es.base;
                    match size {
                        1 => {
                            let b = cpu.readmemb(es, di);
                            if cpu.abrt.is_none() {
                                let a = cpu.regs.b(0);
                                cpu.lazy.set_sub(FlagOp::Sub8, u32::from(a), u32::from(b));
                            }
                        }
                        2 => {
                            let b = cpu.readmemw(es, di);
                            if cpu.abrt.is_none() {
                                let a = cpu.regs.w(0);
                                cpu.lazy.set_sub(FlagOp::Sub16, u32::from(a), u32::from(b));
                            }
                        }
                        _ => {
                            let b = cpu.readmeml(es, di);
                            if cpu.abrt.is_none() {
                                let a = cpu.regs.l(0);
                                cpu.lazy.set_sub(FlagOp::Sub32, a, b);
                            }
                        }
                    }
                    if cpu.abrt.is_some() {
                        cpu.flags = saved_flags;
                        cpu.lazy.extract();
                        break;
                    }
                    zf_matches = cpu.zf();
                    cpu.str_advance(DI, size);
                    c -= 1;
                    cpu.set_str_counter(c);
                    cpu.cycles -= cmp_cost;
                    if cpu.cycles < cycles_end {
                        break;
                    }
                }
                if cpu.abrt.is_some() {
                    cpu.pc = ipc;
                } else if c > 0 && fv == zf_matches {
                    cpu.firstrepcycle = false;
                    cpu.pc = ipc;
                } else {
                    cpu.firstrepcycle = true;
                }
            }
            _ => {
                // Not a string instruction: drop the prefix and let the
                // opcode execute on its own.
                cpu.pc = ipc.wrapping_add(1);
            }
        }
        break;
    }
    cpu.block_end = true;
    OpOutcome::BlockEnd
}

pub(crate) fn install<B: Bus>(t: &mut [OpFn<B>]) {
    set_all(t, 0x6c, op_insb);
    set_all(t, 0x6d, op_insw);
    set_all(t, 0x6e, op_outsb);
    set_all(t, 0x6f, op_outsw);
    set_all(t, 0xa4, op_movsb);
    set_all(t, 0xa5, op_movsw);
    set_all(t, 0xa6, op_cmpsb);
    set_all(t, 0xa7, op_cmpsw);
    set_all(t, 0xaa, op_stosb);
    set_all(t, 0xab, op_stosw);
    set_all(t, 0xac, op_lodsb);
    set_all(t, 0xad, op_lodsw);
    set_all(t, 0xae, op_scasb);
    set_all(t, 0xaf, op_scasw);
}
