//! Port I/O instructions and the TSS I/O permission bitmap walk.

use crate::bus::Bus;
use crate::cpu::{Cpu, OpFn, OpOutcome};
use crate::flags::VM_FLAG;
use crate::interp::set_all;
use crate::regs::DX;
use crate::seg::SegBase;

impl<B: Bus> Cpu<B> {
    /// Consults the TSS I/O permission bitmap for `port`. Returns `true`
    /// when the bit allows the access.
    fn checkio(&mut self, port: u16) -> bool {
        self.cpl_override = true;
        let map_base = self.readmemw(SegBase::ZERO, self.tr.base.wrapping_add(0x66));
        self.cpl_override = false;
        if self.abrt.is_some() {
            return false;
        }
        let byte_off = u32::from(map_base) + u32::from(port >> 3);
        if byte_off > self.tr.limit {
            return false;
        }
        self.cpl_override = true;
        let bits = self.readmemb(SegBase::ZERO, self.tr.base.wrapping_add(byte_off));
        self.cpl_override = false;
        if self.abrt.is_some() {
            return false;
        }
        bits & (1 << (port & 7)) == 0
    }

    /// The CPL/IOPL gate in front of every port access. Latches `#GP(0)`
    /// and returns `false` on denial.
    pub(crate) fn check_io_perm(&mut self, port: u16) -> bool {
        if self.protected() && (self.cpl() > self.iopl() || self.eflags & VM_FLAG != 0) {
            if !self.checkio(port) {
                if self.abrt.is_none() {
                    self.x86gpf(0);
                }
                return false;
            }
        }
        true
    }
}

/// E4: IN AL, imm8.
fn op_in_al_imm<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    let port = u16::from(fetchdat as u8);
    cpu.pc = cpu.pc.wrapping_add(1);
    if !cpu.check_io_perm(port) {
        return OpOutcome::BlockEnd;
    }
    let v = cpu.bus.io_in_b(port);
    cpu.regs.set_b(0, v);
    cpu.cycles -= 12;
    OpOutcome::Continue
}

/// E5: IN eAX, imm8.
fn op_in_eax_imm<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    let port = u16::from(fetchdat as u8);
    cpu.pc = cpu.pc.wrapping_add(1);
    if !cpu.check_io_perm(port) {
        return OpOutcome::BlockEnd;
    }
    if cpu.opsize32() {
        let v = cpu.bus.io_in_l(port);
        cpu.regs.set_l(0, v);
    } else {
        let v = cpu.bus.io_in_w(port);
        cpu.regs.set_w(0, v);
    }
    cpu.cycles -= 12;
    OpOutcome::Continue
}

/// E6: OUT imm8, AL.
fn op_out_imm_al<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    let port = u16::from(fetchdat as u8);
    cpu.pc = cpu.pc.wrapping_add(1);
    if !cpu.check_io_perm(port) {
        return OpOutcome::BlockEnd;
    }
    let v = cpu.regs.b(0);
    cpu.bus.io_out_b(port, v);
    cpu.cycles -= 10;
    OpOutcome::Continue
}

/// E7: OUT imm8, eAX.
fn op_out_imm_eax<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    let port = u16::from(fetchdat as u8);
    cpu.pc = cpu.pc.wrapping_add(1);
    if !cpu.check_io_perm(port) {
        return OpOutcome::BlockEnd;
    }
    if cpu.opsize32() {
        let v = cpu.regs.l(0);
        cpu.bus.io_out_l(port, v);
    } else {
        let v = cpu.regs.w(0);
        cpu.bus.io_out_w(port, v);
    }
    cpu.cycles -= 10;
    OpOutcome::Continue
}

fn op_in_al_dx<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let port = cpu.regs.w(DX);
    if !cpu.check_io_perm(port) {
        return OpOutcome::BlockEnd;
    }
    let v = cpu.bus.io_in_b(port);
    cpu.regs.set_b(0, v);
    cpu.cycles -= 12;
    OpOutcome::Continue
}

fn op_in_eax_dx<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let port = cpu.regs.w(DX);
    if !cpu.check_io_perm(port) {
        return OpOutcome::BlockEnd;
    }
    if cpu.opsize32() {
        let v = cpu.bus.io_in_l(port);
        cpu.regs.set_l(0, v);
    } else {
        let v = cpu.bus.io_in_w(port);
        cpu.regs.set_w(0, v);
    }
    cpu.cycles -= 12;
    OpOutcome::Continue
}

fn op_out_dx_al<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let port = cpu.regs.w(DX);
    if !cpu.check_io_perm(port) {
        return OpOutcome::BlockEnd;
    }
    let v = cpu.regs.b(0);
    cpu.bus.io_out_b(port, v);
    cpu.cycles -= 10;
    OpOutcome::Continue
}

fn op_out_dx_eax<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let port = cpu.regs.w(DX);
    if !cpu.check_io_perm(port) {
        return OpOutcome::BlockEnd;
    }
    if cpu.opsize32() {
        let v = cpu.regs.l(0);
        cpu.bus.io_out_l(port, v);
    } else {
        let v = cpu.regs.w(0);
        cpu.bus.io_out_w(port, v);
    }
    cpu.cycles -= 10;
    OpOutcome::Continue
}

pub(crate) fn install<B: Bus>(t: &mut [OpFn<B>]) {
    set_all(t, 0xe4, op_in_al_imm);
    set_all(t, 0xe5, op_in_eax_imm);
    set_all(t, 0xe6, op_out_imm_al);
    set_all(t, 0xe7, op_out_imm_eax);
    set_all(t, 0xec, op_in_al_dx);
    set_all(t, 0xed, op_in_eax_dx);
    set_all(t, 0xee, op_out_dx_al);
    set_all(t, 0xef, op_out_dx_eax);
}
