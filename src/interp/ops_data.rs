//! Data movement: MOV in all forms, LEA, segment register moves, far
//! pointer loads, MOVZX/MOVSX, stack traffic (PUSH/POP/PUSHA/PUSHF/ENTER),
//! XADD/CMPXCHG, BOUND and ARPL.

use crate::bus::Bus;
use crate::cpu::{Cpu, OpFn, OpOutcome};
use crate::flags::{FlagOp, VM_FLAG};
use crate::interp::set_all;
use crate::regs::{BP, SP};
use crate::seg::SegReg;

// --- MOV r/m, r and friends ---

fn op_mov_eb_gb<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    let v = cpu.regs.b(cpu.cpu_reg);
    cpu.seteab(v);
    cpu.cycles -= 1;
    OpOutcome::Continue
}

fn op_mov_ev_gv<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    if cpu.opsize32() {
        let v = cpu.regs.l(cpu.cpu_reg);
        cpu.seteal(v);
    } else {
        let v = cpu.regs.w(cpu.cpu_reg);
        cpu.seteaw(v);
    }
    cpu.cycles -= 1;
    OpOutcome::Continue
}

fn op_mov_gb_eb<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    let v = cpu.geteab();
    if cpu.abrt.is_none() {
        cpu.regs.set_b(cpu.cpu_reg, v);
    }
    cpu.cycles -= 1;
    OpOutcome::Continue
}

fn op_mov_gv_ev<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    if cpu.opsize32() {
        let v = cpu.geteal();
        if cpu.abrt.is_none() {
            cpu.regs.set_l(cpu.cpu_reg, v);
        }
    } else {
        let v = cpu.geteaw();
        if cpu.abrt.is_none() {
            cpu.regs.set_w(cpu.cpu_reg, v);
        }
    }
    cpu.cycles -= 1;
    OpOutcome::Continue
}

/// 8C: MOV Ew, Sw.
fn op_mov_ew_sw<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    if cpu.cpu_reg > 5 {
        cpu.x86illegal();
        return OpOutcome::BlockEnd;
    }
    let sel = cpu.seg(SegReg::from_index(cpu.cpu_reg)).seg;
    if cpu.cpu_mod == 3 && cpu.opsize32() {
        cpu.regs.set_l(cpu.cpu_rm, u32::from(sel));
    } else {
        cpu.seteaw(sel);
    }
    cpu.cycles -= 1;
    OpOutcome::Continue
}

/// 8E: MOV Sw, Ew.
fn op_mov_sw_ew<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    let reg = cpu.cpu_reg;
    if reg == 1 || reg > 5 {
        // CS is not a valid destination.
        cpu.x86illegal();
        return OpOutcome::BlockEnd;
    }
    let sel = cpu.geteaw();
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    let target = SegReg::from_index(reg);
    cpu.loadseg(sel, target);
    cpu.cycles -= 3;
    // A write to SS inhibits interrupts for one instruction; the single
    // threaded loop approximates this by ending the block.
    if target == SegReg::Ss {
        return OpOutcome::BlockEnd;
    }
    OpOutcome::Continue
}

fn op_lea<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    if cpu.cpu_mod == 3 {
        cpu.x86illegal();
        return OpOutcome::BlockEnd;
    }
    if cpu.opsize32() {
        cpu.regs.set_l(cpu.cpu_reg, cpu.eaaddr);
    } else {
        cpu.regs.set_w(cpu.cpu_reg, cpu.eaaddr as u16);
    }
    cpu.cycles -= 1;
    OpOutcome::Continue
}

/// A0..A3: moffs transfers through the live `ea_seg`.
fn op_mov_al_moffs<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let off = if cpu.addr32() { cpu.getlong() } else { u32::from(cpu.getword()) };
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    let seg = cpu.seg(cpu.ea_seg).base;
    let v = cpu.readmemb(seg, off);
    if cpu.abrt.is_none() {
        cpu.regs.set_b(0, v);
    }
    cpu.cycles -= 1;
    OpOutcome::Continue
}

fn op_mov_eax_moffs<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let off = if cpu.addr32() { cpu.getlong() } else { u32::from(cpu.getword()) };
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    let seg = cpu.seg(cpu.ea_seg).base;
    if cpu.opsize32() {
        let v = cpu.readmeml(seg, off);
        if cpu.abrt.is_none() {
            cpu.regs.set_l(0, v);
        }
    } else {
        let v = cpu.readmemw(seg, off);
        if cpu.abrt.is_none() {
            cpu.regs.set_w(0, v);
        }
    }
    cpu.cycles -= 1;
    OpOutcome::Continue
}

fn op_mov_moffs_al<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let off = if cpu.addr32() { cpu.getlong() } else { u32::from(cpu.getword()) };
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    let seg = cpu.seg(cpu.ea_seg).base;
    let v = cpu.regs.b(0);
    cpu.writememb(seg, off, v);
    cpu.cycles -= 1;
    OpOutcome::Continue
}

fn op_mov_moffs_eax<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let off = if cpu.addr32() { cpu.getlong() } else { u32::from(cpu.getword()) };
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    let seg = cpu.seg(cpu.ea_seg).base;
    if cpu.opsize32() {
        let v = cpu.regs.l(0);
        cpu.writememl(seg, off, v);
    } else {
        let v = cpu.regs.w(0);
        cpu.writememw(seg, off, v);
    }
    cpu.cycles -= 1;
    OpOutcome::Continue
}

/// B0..B7: MOV r8, imm8.
fn op_mov_r8_imm<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    let reg = usize::from(cpu.opcode & 7);
    let imm = fetchdat as u8;
    cpu.pc = cpu.pc.wrapping_add(1);
    cpu.regs.set_b(reg, imm);
    cpu.cycles -= 1;
    OpOutcome::Continue
}

/// B8..BF: MOV r, imm16/32.
fn op_mov_r_imm<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    let reg = usize::from(cpu.opcode & 7);
    if cpu.opsize32() {
        let imm = cpu.getlong();
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        cpu.regs.set_l(reg, imm);
    } else {
        let imm = fetchdat as u16;
        cpu.pc = cpu.pc.wrapping_add(2);
        cpu.regs.set_w(reg, imm);
    }
    cpu.cycles -= 1;
    OpOutcome::Continue
}

/// C6/C7: MOV r/m, imm.
fn op_mov_eb_imm<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    let imm = cpu.getbyte();
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    cpu.seteab(imm);
    cpu.cycles -= 1;
    OpOutcome::Continue
}

fn op_mov_ev_imm<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    if cpu.opsize32() {
        let imm = cpu.getlong();
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        cpu.seteal(imm);
    } else {
        let imm = cpu.getword();
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        cpu.seteaw(imm);
    }
    cpu.cycles -= 1;
    OpOutcome::Continue
}

// --- MOVZX / MOVSX ---

fn op_movzx_gv_eb<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    let v = cpu.geteab();
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    if cpu.opsize32() {
        cpu.regs.set_l(cpu.cpu_reg, u32::from(v));
    } else {
        cpu.regs.set_w(cpu.cpu_reg, u16::from(v));
    }
    cpu.cycles -= 3;
    OpOutcome::Continue
}

fn op_movzx_gv_ew<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    let v = cpu.geteaw();
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    if cpu.opsize32() {
        cpu.regs.set_l(cpu.cpu_reg, u32::from(v));
    } else {
        cpu.regs.set_w(cpu.cpu_reg, v);
    }
    cpu.cycles -= 3;
    OpOutcome::Continue
}

fn op_movsx_gv_eb<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    let v = cpu.geteab();
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    if cpu.opsize32() {
        cpu.regs.set_l(cpu.cpu_reg, v as i8 as i32 as u32);
    } else {
        cpu.regs.set_w(cpu.cpu_reg, v as i8 as i16 as u16);
    }
    cpu.cycles -= 3;
    OpOutcome::Continue
}

fn op_movsx_gv_ew<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    let v = cpu.geteaw();
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    if cpu.opsize32() {
        cpu.regs.set_l(cpu.cpu_reg, v as i16 as i32 as u32);
    } else {
        cpu.regs.set_w(cpu.cpu_reg, v);
    }
    cpu.cycles -= 3;
    OpOutcome::Continue
}

// --- XCHG eAX, r ---

fn op_xchg_eax_r<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let reg = usize::from(cpu.opcode & 7);
    if cpu.opsize32() {
        let a = cpu.regs.l(0);
        let b = cpu.regs.l(reg);
        cpu.regs.set_l(0, b);
        cpu.regs.set_l(reg, a);
    } else {
        let a = cpu.regs.w(0);
        let b = cpu.regs.w(reg);
        cpu.regs.set_w(0, b);
        cpu.regs.set_w(reg, a);
    }
    cpu.cycles -= 3;
    OpOutcome::Continue
}

// --- stack traffic ---

fn op_push_r<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let reg = usize::from(cpu.opcode & 7);
    if cpu.opsize32() {
        let v = cpu.regs.l(reg);
        cpu.push_l(v);
    } else {
        let v = cpu.regs.w(reg);
        cpu.push_w(v);
    }
    cpu.cycles -= 2;
    OpOutcome::Continue
}

fn op_pop_r<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let reg = usize::from(cpu.opcode & 7);
    if cpu.opsize32() {
        let v = cpu.pop_l();
        if cpu.abrt.is_none() {
            cpu.regs.set_l(reg, v);
        }
    } else {
        let v = cpu.pop_w();
        if cpu.abrt.is_none() {
            cpu.regs.set_w(reg, v);
        }
    }
    cpu.cycles -= 2;
    OpOutcome::Continue
}

fn op_push_seg<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let seg = match cpu.opcode {
        0x06 => SegReg::Es,
        0x0e => SegReg::Cs,
        0x16 => SegReg::Ss,
        _ => SegReg::Ds,
    };
    let sel = cpu.seg(seg).seg;
    if cpu.opsize32() {
        cpu.push_l(u32::from(sel));
    } else {
        cpu.push_w(sel);
    }
    cpu.cycles -= 2;
    OpOutcome::Continue
}

fn op_pop_seg<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let seg = match cpu.opcode {
        0x07 => SegReg::Es,
        0x17 => SegReg::Ss,
        _ => SegReg::Ds,
    };
    let saved_sp = cpu.regs.l(SP);
    let sel = if cpu.opsize32() {
        let v = cpu.pop_l();
        v as u16
    } else {
        cpu.pop_w()
    };
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    cpu.loadseg(sel, seg);
    if cpu.abrt.is_some() {
        // The pop must not be observable if the load faulted.
        cpu.regs.set_l(SP, saved_sp);
        return OpOutcome::Continue;
    }
    cpu.cycles -= 3;
    if seg == SegReg::Ss {
        return OpOutcome::BlockEnd;
    }
    OpOutcome::Continue
}

/// 0F A0/A1/A8/A9: PUSH/POP FS and GS.
fn op_push_fs_gs<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let seg = if cpu.opcode == 0xa0 { SegReg::Fs } else { SegReg::Gs };
    let sel = cpu.seg(seg).seg;
    if cpu.opsize32() {
        cpu.push_l(u32::from(sel));
    } else {
        cpu.push_w(sel);
    }
    cpu.cycles -= 2;
    OpOutcome::Continue
}

fn op_pop_fs_gs<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let seg = if cpu.opcode == 0xa1 { SegReg::Fs } else { SegReg::Gs };
    let saved_sp = cpu.regs.l(SP);
    let sel = if cpu.opsize32() {
        cpu.pop_l() as u16
    } else {
        cpu.pop_w()
    };
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    cpu.loadseg(sel, seg);
    if cpu.abrt.is_some() {
        cpu.regs.set_l(SP, saved_sp);
    }
    cpu.cycles -= 3;
    OpOutcome::Continue
}

fn op_push_imm<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if cpu.opsize32() {
        let imm = cpu.getlong();
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        cpu.push_l(imm);
    } else {
        let imm = fetchdat as u16;
        cpu.pc = cpu.pc.wrapping_add(2);
        cpu.push_w(imm);
    }
    cpu.cycles -= 2;
    OpOutcome::Continue
}

fn op_push_imm8<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    let imm = fetchdat as u8 as i8;
    cpu.pc = cpu.pc.wrapping_add(1);
    if cpu.opsize32() {
        cpu.push_l(imm as u32);
    } else {
        cpu.push_w(imm as u16);
    }
    cpu.cycles -= 2;
    OpOutcome::Continue
}

/// 8F: POP r/m.
fn op_pop_ev<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    // The pop happens before the EA is resolved, and SP is live in the
    // address computation.
    if cpu.opsize32() {
        let v = cpu.pop_l();
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        if !cpu.fetch_ea(fetchdat) {
            cpu.adjust_sp(-4);
            return OpOutcome::Continue;
        }
        cpu.seteal(v);
        if cpu.abrt.is_some() {
            cpu.adjust_sp(-4);
        }
    } else {
        let v = cpu.pop_w();
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        if !cpu.fetch_ea(fetchdat) {
            cpu.adjust_sp(-2);
            return OpOutcome::Continue;
        }
        cpu.seteaw(v);
        if cpu.abrt.is_some() {
            cpu.adjust_sp(-2);
        }
    }
    cpu.cycles -= 3;
    OpOutcome::Continue
}

fn op_pusha<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let sp = cpu.regs.l(SP);
    if cpu.opsize32() {
        for i in 0..8 {
            let v = if i == SP { sp } else { cpu.regs.l(i) };
            cpu.push_l(v);
            if cpu.abrt.is_some() {
                cpu.regs.set_l(SP, sp);
                return OpOutcome::Continue;
            }
        }
    } else {
        for i in 0..8 {
            let v = if i == SP { sp as u16 } else { cpu.regs.w(i) };
            cpu.push_w(v);
            if cpu.abrt.is_some() {
                cpu.regs.set_l(SP, sp);
                return OpOutcome::Continue;
            }
        }
    }
    cpu.cycles -= 6;
    OpOutcome::Continue
}

fn op_popa<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let sp = cpu.regs.l(SP);
    if cpu.opsize32() {
        for i in (0..8).rev() {
            let v = cpu.pop_l();
            if cpu.abrt.is_some() {
                cpu.regs.set_l(SP, sp);
                return OpOutcome::Continue;
            }
            if i != SP {
                cpu.regs.set_l(i, v);
            }
        }
    } else {
        for i in (0..8).rev() {
            let v = cpu.pop_w();
            if cpu.abrt.is_some() {
                cpu.regs.set_l(SP, sp);
                return OpOutcome::Continue;
            }
            if i != SP {
                cpu.regs.set_w(i, v);
            }
        }
    }
    cpu.cycles -= 6;
    OpOutcome::Continue
}

fn op_pushf<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    if cpu.eflags & VM_FLAG != 0 && cpu.iopl() != 3 {
        cpu.x86gpf(0);
        return OpOutcome::BlockEnd;
    }
    cpu.lazy.rebuild(&mut cpu.flags);
    if cpu.opsize32() {
        // VM and RF never appear on the stack.
        let img = (u32::from(cpu.eflags & !(VM_FLAG | 1)) << 16) | u32::from(cpu.flags);
        cpu.push_l(img);
    } else {
        let img = cpu.flags;
        cpu.push_w(img);
    }
    cpu.cycles -= 2;
    OpOutcome::Continue
}

fn op_popf<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    if cpu.eflags & VM_FLAG != 0 && cpu.iopl() != 3 {
        cpu.x86gpf(0);
        return OpOutcome::BlockEnd;
    }
    let (mut new_flags, new_eflags) = if cpu.opsize32() {
        let img = cpu.pop_l();
        (img as u16, Some((img >> 16) as u16))
    } else {
        let img = cpu.pop_w();
        (img, None)
    };
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    // IF is IOPL-gated; IOPL itself only moves at CPL 0.
    if cpu.protected() {
        if cpu.cpl() > cpu.iopl() {
            new_flags = (new_flags & !crate::flags::I_FLAG) | (cpu.flags & crate::flags::I_FLAG);
        }
        if cpu.cpl() != 0 {
            new_flags = (new_flags & !0x3000) | (cpu.flags & 0x3000);
        }
    }
    cpu.flags = new_flags | 0x0002;
    if let Some(high) = new_eflags {
        // VM cannot be set from POPFD.
        cpu.eflags = (high & !VM_FLAG & 0x3c) | (cpu.eflags & VM_FLAG);
    }
    cpu.lazy.extract();
    cpu.cycles -= 2;
    OpOutcome::BlockEnd
}

fn op_enter<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    let frame_size = fetchdat as u16;
    cpu.pc = cpu.pc.wrapping_add(2);
    let level = cpu.getbyte() & 0x1f;
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    let saved_sp = cpu.regs.l(SP);
    if cpu.opsize32() {
        let ebp = cpu.regs.l(BP);
        cpu.push_l(ebp);
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        let frame_ptr = cpu.regs.l(SP);
        if level > 0 {
            let mut bp = ebp;
            for _ in 1..level {
                bp = bp.wrapping_sub(4);
                let base = cpu.ss.base;
                let v = cpu.readmeml(base, bp);
                if cpu.abrt.is_some() {
                    cpu.regs.set_l(SP, saved_sp);
                    return OpOutcome::Continue;
                }
                cpu.push_l(v);
                if cpu.abrt.is_some() {
                    cpu.regs.set_l(SP, saved_sp);
                    return OpOutcome::Continue;
                }
            }
            cpu.push_l(frame_ptr);
            if cpu.abrt.is_some() {
                cpu.regs.set_l(SP, saved_sp);
                return OpOutcome::Continue;
            }
        }
        cpu.regs.set_l(BP, frame_ptr);
        cpu.adjust_sp(-(i32::from(frame_size)));
    } else {
        let bp = cpu.regs.w(BP);
        cpu.push_w(bp);
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        let frame_ptr = cpu.regs.w(SP);
        if level > 0 {
            let mut walk = bp;
            for _ in 1..level {
                walk = walk.wrapping_sub(2);
                let base = cpu.ss.base;
                let v = cpu.readmemw(base, u32::from(walk));
                if cpu.abrt.is_some() {
                    cpu.regs.set_l(SP, saved_sp);
                    return OpOutcome::Continue;
                }
                cpu.push_w(v);
                if cpu.abrt.is_some() {
                    cpu.regs.set_l(SP, saved_sp);
                    return OpOutcome::Continue;
                }
            }
            cpu.push_w(frame_ptr);
            if cpu.abrt.is_some() {
                cpu.regs.set_l(SP, saved_sp);
                return OpOutcome::Continue;
            }
        }
        cpu.regs.set_w(BP, frame_ptr);
        cpu.adjust_sp(-(i32::from(frame_size)));
    }
    cpu.cycles -= 10;
    OpOutcome::Continue
}

fn op_leave<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    if cpu.stack32 {
        let bp = cpu.regs.l(BP);
        cpu.regs.set_l(SP, bp);
    } else {
        let bp = cpu.regs.w(BP);
        cpu.regs.set_w(SP, bp);
    }
    if cpu.opsize32() {
        let v = cpu.pop_l();
        if cpu.abrt.is_none() {
            cpu.regs.set_l(BP, v);
        }
    } else {
        let v = cpu.pop_w();
        if cpu.abrt.is_none() {
            cpu.regs.set_w(BP, v);
        }
    }
    cpu.cycles -= 4;
    OpOutcome::Continue
}

// --- far pointer loads ---

fn load_far_ptr<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32, seg: SegReg) -> OpOutcome {
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    if cpu.cpu_mod == 3 {
        cpu.x86illegal();
        return OpOutcome::BlockEnd;
    }
    if cpu.opsize32() {
        let off = cpu.geteal();
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        let seg_base = cpu.easeg;
        let addr = cpu.eaaddr;
        let sel = cpu.readmemw(seg_base, addr.wrapping_add(4));
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        cpu.loadseg(sel, seg);
        if cpu.abrt.is_none() {
            cpu.regs.set_l(cpu.cpu_reg, off);
        }
    } else {
        let off = cpu.geteaw();
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        let seg_base = cpu.easeg;
        let addr = cpu.eaaddr;
        let sel = cpu.readmemw(seg_base, addr.wrapping_add(2));
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        cpu.loadseg(sel, seg);
        if cpu.abrt.is_none() {
            cpu.regs.set_w(cpu.cpu_reg, off);
        }
    }
    cpu.cycles -= 6;
    OpOutcome::Continue
}

fn op_les<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    load_far_ptr(cpu, fetchdat, SegReg::Es)
}

fn op_lds<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    load_far_ptr(cpu, fetchdat, SegReg::Ds)
}

fn op_lss<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    load_far_ptr(cpu, fetchdat, SegReg::Ss)
}

fn op_lfs<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    load_far_ptr(cpu, fetchdat, SegReg::Fs)
}

fn op_lgs<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    load_far_ptr(cpu, fetchdat, SegReg::Gs)
}

// --- 486 read-modify-write extensions ---

fn op_xadd_eb_gb<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !cpu.is486 {
        cpu.x86illegal();
        return OpOutcome::BlockEnd;
    }
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    let dst = cpu.geteab();
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    let src = cpu.regs.b(cpu.cpu_reg);
    cpu.lazy.set_add(FlagOp::Add8, u32::from(dst), u32::from(src));
    cpu.seteab(dst.wrapping_add(src));
    if cpu.abrt.is_none() {
        cpu.regs.set_b(cpu.cpu_reg, dst);
    }
    cpu.cycles -= 4;
    OpOutcome::Continue
}

fn op_xadd_ev_gv<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !cpu.is486 {
        cpu.x86illegal();
        return OpOutcome::BlockEnd;
    }
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    if cpu.opsize32() {
        let dst = cpu.geteal();
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        let src = cpu.regs.l(cpu.cpu_reg);
        cpu.lazy.set_add(FlagOp::Add32, dst, src);
        cpu.seteal(dst.wrapping_add(src));
        if cpu.abrt.is_none() {
            cpu.regs.set_l(cpu.cpu_reg, dst);
        }
    } else {
        let dst = cpu.geteaw();
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        let src = cpu.regs.w(cpu.cpu_reg);
        cpu.lazy.set_add(FlagOp::Add16, u32::from(dst), u32::from(src));
        cpu.seteaw(dst.wrapping_add(src));
        if cpu.abrt.is_none() {
            cpu.regs.set_w(cpu.cpu_reg, dst);
        }
    }
    cpu.cycles -= 4;
    OpOutcome::Continue
}

fn op_cmpxchg_eb_gb<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !cpu.is486 {
        cpu.x86illegal();
        return OpOutcome::BlockEnd;
    }
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    let dst = cpu.geteab();
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    let acc = cpu.regs.b(0);
    cpu.lazy.set_sub(FlagOp::Sub8, u32::from(acc), u32::from(dst));
    if acc == dst {
        let v = cpu.regs.b(cpu.cpu_reg);
        cpu.seteab(v);
    } else {
        cpu.regs.set_b(0, dst);
    }
    cpu.cycles -= 5;
    OpOutcome::Continue
}

fn op_cmpxchg_ev_gv<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !cpu.is486 {
        cpu.x86illegal();
        return OpOutcome::BlockEnd;
    }
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    if cpu.opsize32() {
        let dst = cpu.geteal();
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        let acc = cpu.regs.l(0);
        cpu.lazy.set_sub(FlagOp::Sub32, acc, dst);
        if acc == dst {
            let v = cpu.regs.l(cpu.cpu_reg);
            cpu.seteal(v);
        } else {
            cpu.regs.set_l(0, dst);
        }
    } else {
        let dst = cpu.geteaw();
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        let acc = cpu.regs.w(0);
        cpu.lazy.set_sub(FlagOp::Sub16, u32::from(acc), u32::from(dst));
        if acc == dst {
            let v = cpu.regs.w(cpu.cpu_reg);
            cpu.seteaw(v);
        } else {
            cpu.regs.set_w(0, dst);
        }
    }
    cpu.cycles -= 5;
    OpOutcome::Continue
}

/// 0F C7: CMPXCHG8B.
fn op_cmpxchg8b<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    if cpu.cpu_reg != 1 || cpu.cpu_mod == 3 {
        cpu.x86illegal();
        return OpOutcome::BlockEnd;
    }
    let mem = cpu.geteaq();
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    let expect = (u64::from(cpu.regs.l(2)) << 32) | u64::from(cpu.regs.l(0));
    cpu.lazy.rebuild(&mut cpu.flags);
    if mem == expect {
        let new = (u64::from(cpu.regs.l(1)) << 32) | u64::from(cpu.regs.l(3));
        cpu.seteaq(new);
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        cpu.set_flag(crate::flags::Z_FLAG, true);
    } else {
        cpu.regs.set_l(0, mem as u32);
        cpu.regs.set_l(2, (mem >> 32) as u32);
        cpu.set_flag(crate::flags::Z_FLAG, false);
    }
    cpu.cycles -= 6;
    OpOutcome::Continue
}

// --- BOUND / ARPL ---

fn op_bound<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    if cpu.cpu_mod == 3 {
        cpu.x86illegal();
        return OpOutcome::BlockEnd;
    }
    if cpu.opsize32() {
        let low = cpu.geteal() as i32;
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        let seg = cpu.easeg;
        let addr = cpu.eaaddr;
        let high = cpu.readmeml(seg, addr.wrapping_add(4)) as i32;
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        let idx = cpu.regs.l(cpu.cpu_reg) as i32;
        if idx < low || idx > high {
            cpu.x86_int(5);
            return OpOutcome::BlockEnd;
        }
    } else {
        let low = cpu.geteaw() as i16;
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        let seg = cpu.easeg;
        let addr = cpu.eaaddr;
        let high = cpu.readmemw(seg, addr.wrapping_add(2)) as i16;
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        let idx = cpu.regs.w(cpu.cpu_reg) as i16;
        if idx < low || idx > high {
            cpu.x86_int(5);
            return OpOutcome::BlockEnd;
        }
    }
    cpu.cycles -= 7;
    OpOutcome::Continue
}

fn op_arpl<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !cpu.protected() || cpu.eflags & VM_FLAG != 0 {
        cpu.x86illegal();
        return OpOutcome::BlockEnd;
    }
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    let dst = cpu.geteaw();
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    let src = cpu.regs.w(cpu.cpu_reg);
    cpu.lazy.rebuild(&mut cpu.flags);
    if dst & 3 < src & 3 {
        cpu.seteaw((dst & !3) | (src & 3));
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        cpu.set_flag(crate::flags::Z_FLAG, true);
    } else {
        cpu.set_flag(crate::flags::Z_FLAG, false);
    }
    cpu.cycles -= 9;
    OpOutcome::Continue
}

pub(crate) fn install<B: Bus>(t: &mut [OpFn<B>]) {
    set_all(t, 0x06, op_push_seg);
    set_all(t, 0x07, op_pop_seg);
    set_all(t, 0x0e, op_push_seg);
    set_all(t, 0x16, op_push_seg);
    set_all(t, 0x17, op_pop_seg);
    set_all(t, 0x1e, op_push_seg);
    set_all(t, 0x1f, op_pop_seg);

    for op in 0x50..0x58 {
        set_all(t, op, op_push_r);
    }
    for op in 0x58..0x60 {
        set_all(t, op, op_pop_r);
    }

    set_all(t, 0x60, op_pusha);
    set_all(t, 0x61, op_popa);
    set_all(t, 0x62, op_bound);
    set_all(t, 0x63, op_arpl);
    set_all(t, 0x68, op_push_imm);
    set_all(t, 0x6a, op_push_imm8);

    set_all(t, 0x88, op_mov_eb_gb);
    set_all(t, 0x89, op_mov_ev_gv);
    set_all(t, 0x8a, op_mov_gb_eb);
    set_all(t, 0x8b, op_mov_gv_ev);
    set_all(t, 0x8c, op_mov_ew_sw);
    set_all(t, 0x8d, op_lea);
    set_all(t, 0x8e, op_mov_sw_ew);
    set_all(t, 0x8f, op_pop_ev);

    for op in 0x91..0x98 {
        set_all(t, op, op_xchg_eax_r);
    }

    set_all(t, 0x9c, op_pushf);
    set_all(t, 0x9d, op_popf);

    set_all(t, 0xa0, op_mov_al_moffs);
    set_all(t, 0xa1, op_mov_eax_moffs);
    set_all(t, 0xa2, op_mov_moffs_al);
    set_all(t, 0xa3, op_mov_moffs_eax);

    for op in 0xb0..0xb8 {
        set_all(t, op, op_mov_r8_imm);
    }
    for op in 0xb8..0xc0 {
        set_all(t, op, op_mov_r_imm);
    }

    set_all(t, 0xc4, op_les);
    set_all(t, 0xc5, op_lds);
    set_all(t, 0xc6, op_mov_eb_imm);
    set_all(t, 0xc7, op_mov_ev_imm);
    set_all(t, 0xc8, op_enter);
    set_all(t, 0xc9, op_leave);
}

pub(crate) fn install_0f<B: Bus>(t: &mut [OpFn<B>]) {
    set_all(t, 0xa0, op_push_fs_gs);
    set_all(t, 0xa1, op_pop_fs_gs);
    set_all(t, 0xa8, op_push_fs_gs);
    set_all(t, 0xa9, op_pop_fs_gs);
    set_all(t, 0xb0, op_cmpxchg_eb_gb);
    set_all(t, 0xb1, op_cmpxchg_ev_gv);
    set_all(t, 0xb2, op_lss);
    set_all(t, 0xb4, op_lfs);
    set_all(t, 0xb5, op_lgs);
    set_all(t, 0xb6, op_movzx_gv_eb);
    set_all(t, 0xb7, op_movzx_gv_ew);
    set_all(t, 0xbe, op_movsx_gv_eb);
    set_all(t, 0xbf, op_movsx_gv_ew);
    set_all(t, 0xc0, op_xadd_eb_gb);
    set_all(t, 0xc1, op_xadd_ev_gv);
    set_all(t, 0xc7, op_cmpxchg8b);
}
