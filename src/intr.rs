//! Interrupt and exception delivery, plus the far control-transfer
//! machinery it shares with CALL/JMP/RET far (gate traversal, privilege
//! transitions, task switches).
//!
//! Real-mode delivery pushes FLAGS/CS/IP and vectors through the IVT at
//! `idt.base`. Protected-mode delivery resolves an IDT gate, optionally
//! switches to the inner stack from the TSS, and honors interrupt-vs-trap
//! gate IF semantics. Fault delivery happens at the instruction boundary
//! with `oldcs:oldpc` restored, so handlers always see a restartable
//! return address; a fault during delivery escalates to `#DF`, and a fault
//! during that resets the guest.

use log::{debug, trace};

use crate::bus::Bus;
use crate::cpu::{Cpu, Fault};
use crate::flags::{I_FLAG, NT_FLAG, T_FLAG, VM_FLAG};
use crate::mem::CR0_TS;
use crate::seg::{access_dpl, SegBase, SegReg};

/// How a task switch was initiated; decides busy-bit and back-link
/// handling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TaskKind {
    Jump,
    CallOrInt,
    Iret,
}

impl<B: Bus> Cpu<B> {
    #[inline]
    pub(crate) fn iopl(&self) -> u8 {
        ((self.flags >> 12) & 3) as u8
    }

    fn eflags32(&self) -> u32 {
        u32::from(self.flags) | (u32::from(self.eflags) << 16)
    }

    // --- real mode ---

    /// Real-mode vectoring with the current `pc` as the return address
    /// (hardware interrupts, traps at the instruction boundary).
    fn real_int(&mut self, num: u8) {
        let flags = self.flags;
        let cs = self.cs.seg;
        let pc = self.pc;
        let ss = self.ss.base;
        if self.stack32 {
            let esp = self.regs.l(crate::regs::SP);
            self.writememw(ss, esp.wrapping_sub(2), flags);
            self.writememw(ss, esp.wrapping_sub(4), cs);
            self.writememw(ss, esp.wrapping_sub(6), pc as u16);
            if self.abrt.is_some() {
                return;
            }
            self.regs.set_l(crate::regs::SP, esp.wrapping_sub(6));
        } else {
            let sp = self.regs.w(crate::regs::SP);
            self.writememw(ss, u32::from(sp.wrapping_sub(2)), flags);
            self.writememw(ss, u32::from(sp.wrapping_sub(4)), cs);
            self.writememw(ss, u32::from(sp.wrapping_sub(6)), pc as u16);
            if self.abrt.is_some() {
                return;
            }
            self.regs.set_w(crate::regs::SP, sp.wrapping_sub(6));
        }
        let addr = (u32::from(num) << 2).wrapping_add(self.idt.base);
        self.flags &= !(I_FLAG | T_FLAG);
        let new_pc = self.readmemw(SegBase::ZERO, addr);
        let new_cs = self.readmemw(SegBase::ZERO, addr.wrapping_add(2));
        if self.abrt.is_some() {
            return;
        }
        self.pc = u32::from(new_pc);
        self.loadcs(new_cs);
    }

    /// Exception-style delivery: the faulting instruction restarts, so the
    /// saved return address is `oldpc`.
    pub(crate) fn x86_int(&mut self, num: u8) {
        self.lazy.rebuild(&mut self.flags);
        self.pc = self.oldpc;
        if self.protected() {
            self.pmodeint(num, false);
        } else {
            self.real_int(num);
        }
        self.cycles -= 70;
        self.block_end = true;
    }

    /// Software INT n / INT3 / INTO: the return address is the following
    /// instruction.
    pub(crate) fn x86_int_sw(&mut self, num: u8) {
        self.lazy.rebuild(&mut self.flags);
        self.cycles -= self.timing_int;
        if self.protected() {
            self.pmodeint(num, true);
        } else {
            self.real_int(num);
            self.cycles -= self.timing_int_rm;
        }
        self.trap = false;
        self.block_end = true;
    }

    /// Undefined opcode.
    pub(crate) fn x86illegal(&mut self) {
        debug!(
            "illegal opcode {:02x} at {:04x}:{:08x}",
            self.opcode, self.cs.seg, self.oldpc
        );
        self.x86_int(6);
    }

    /// Hardware interrupt / trap at the instruction boundary (no restart).
    pub(crate) fn deliver_int_hw(&mut self, num: u8) {
        if self.protected() {
            self.pmodeint(num, false);
        } else {
            self.real_int(num);
        }
        self.cycles -= 70;
    }

    /// Delivers a latched abort as the matching processor exception.
    pub(crate) fn x86_doabrt(&mut self, fault: Fault) {
        let (vec, err) = match fault {
            Fault::Gp(e) => (13u8, e),
            Fault::Ss(e) => (12, e),
            Fault::Np(e) => (11, e),
            Fault::Pf(e) => (14, e),
        };
        trace!(
            "exception {} err={:04x} at {:04x}:{:08x}",
            vec,
            err,
            self.oldcs,
            self.oldpc
        );
        self.pc = self.oldpc;
        if self.protected() {
            self.pmodeint(vec, false);
            if self.abrt.is_none() {
                self.push_error_code(err);
            }
        } else {
            self.real_int(vec);
        }
        self.block_end = true;
    }

    /// Pushes an exception error code using the width of the gate that was
    /// just traversed.
    pub(crate) fn push_error_code(&mut self, err: u16) {
        if self.cgate32 {
            self.push_l(u32::from(err));
        } else {
            self.push_w(err);
        }
    }

    /// Reads the inner SS:ESP pair for privilege level `dpl` from the TSS.
    fn tss_stack(&mut self, dpl: u8) -> Option<(u16, u32)> {
        let tss32 = self.tr.access & 0x08 != 0;
        let base = self.tr.base;
        self.cpl_override = true;
        let out = if tss32 {
            let off = 4 + u32::from(dpl) * 8;
            if off + 5 > self.tr.limit {
                self.cpl_override = false;
                self.x86gpf(self.tr.seg & !3);
                return None;
            }
            let esp = self.readmeml(SegBase::ZERO, base.wrapping_add(off));
            let ss = self.readmemw(SegBase::ZERO, base.wrapping_add(off + 4));
            (ss, esp)
        } else {
            let off = 2 + u32::from(dpl) * 4;
            if off + 3 > self.tr.limit {
                self.cpl_override = false;
                self.x86gpf(self.tr.seg & !3);
                return None;
            }
            let sp = self.readmemw(SegBase::ZERO, base.wrapping_add(off));
            let ss = self.readmemw(SegBase::ZERO, base.wrapping_add(off + 2));
            (ss, u32::from(sp))
        };
        self.cpl_override = false;
        if self.abrt.is_some() {
            return None;
        }
        Some(out)
    }

    /// Loads SS for an inner-ring transition; the usual `loadseg` CPL
    /// equality checks do not apply because CPL is changing to `dpl`.
    fn load_inner_ss(&mut self, sel: u16, dpl: u8) -> bool {
        if sel & !3 == 0 {
            self.abort(Fault::Ss(0));
            return false;
        }
        let desc = match self.fetch_descriptor(sel) {
            Some(d) => d,
            None => return false,
        };
        let access = (desc[2] >> 8) as u8;
        if (sel & 3) as u8 != dpl || access_dpl(access) != dpl || access & 0x1a != 0x12 {
            self.abort(Fault::Ss(sel & !3));
            return false;
        }
        if access & 0x80 == 0 {
            self.abort(Fault::Ss(sel & !3));
            return false;
        }
        self.ss.load_descriptor(sel, desc);
        self.stack32 = desc[3] & 0x0040 != 0;
        true
    }

    /// Protected-mode interrupt/exception delivery through the IDT.
    ///
    /// `soft` marks INT n/INT3/INTO, which are subject to gate DPL checks
    /// and never set the external bit in pushed error codes.
    pub(crate) fn pmodeint(&mut self, num: u8, soft: bool) {
        let v86 = self.eflags & VM_FLAG != 0;
        if v86 && soft && self.iopl() != 3 {
            self.x86gpf(0);
            return;
        }
        let ext: u16 = if soft { 0 } else { 1 };
        let idx = u32::from(num) * 8;
        if idx + 7 > self.idt.limit {
            self.x86gpf((u16::from(num) << 3) | 2 | ext);
            return;
        }

        self.cpl_override = true;
        let mut gate = [0u16; 4];
        for (i, word) in gate.iter_mut().enumerate() {
            *word = self.readmemw(
                SegBase::ZERO,
                self.idt.base.wrapping_add(idx + (i as u32) * 2),
            );
        }
        self.cpl_override = false;
        if self.abrt.is_some() {
            return;
        }

        let gate_access = (gate[2] >> 8) as u8;
        let gate_dpl = access_dpl(gate_access);
        let gtype = gate_access & 0x1f;
        if soft && gate_dpl < self.cpl() {
            self.x86gpf((u16::from(num) << 3) | 2);
            return;
        }

        match gtype {
            0x05 => {
                // Task gate.
                if gate_access & 0x80 == 0 {
                    self.abort(Fault::Np((u16::from(num) << 3) | 2 | ext));
                    return;
                }
                self.task_gate_switch(gate[1], TaskKind::CallOrInt);
            }
            0x06 | 0x07 | 0x0e | 0x0f => {
                if gate_access & 0x80 == 0 {
                    self.abort(Fault::Np((u16::from(num) << 3) | 2 | ext));
                    return;
                }
                let gate32 = gtype & 0x08 != 0;
                self.cgate32 = gate32;
                let offset = if gate32 {
                    u32::from(gate[0]) | (u32::from(gate[3]) << 16)
                } else {
                    u32::from(gate[0])
                };
                let csel = gate[1];
                if csel & !3 == 0 {
                    self.x86gpf(ext);
                    return;
                }
                let desc = match self.fetch_descriptor(csel) {
                    Some(d) => d,
                    None => return,
                };
                let access = (desc[2] >> 8) as u8;
                if access & 0x18 != 0x18 {
                    self.x86gpf((csel & !3) | ext);
                    return;
                }
                let dpl = access_dpl(access);
                if dpl > self.cpl() {
                    self.x86gpf((csel & !3) | ext);
                    return;
                }
                if access & 0x80 == 0 {
                    self.abort(Fault::Np((csel & !3) | ext));
                    return;
                }

                let conforming = access & 0x04 != 0;
                let old_flags32 = self.eflags32();
                let old_cs = self.cs.seg;
                let old_pc = self.pc;

                if !conforming && dpl < self.cpl() {
                    // Inner-ring transition: switch to the TSS stack.
                    if v86 && dpl != 0 {
                        self.x86gpf((csel & !3) | ext);
                        return;
                    }
                    let (new_ss, new_esp) = match self.tss_stack(dpl) {
                        Some(pair) => pair,
                        None => return,
                    };
                    let old_ss = self.ss.seg;
                    let old_esp = self.regs.l(crate::regs::SP);
                    let (old_es, old_ds, old_fs, old_gs) =
                        (self.es.seg, self.ds.seg, self.fs.seg, self.gs.seg);
                    if !self.load_inner_ss(new_ss, dpl) {
                        return;
                    }
                    if self.stack32 {
                        self.regs.set_l(crate::regs::SP, new_esp);
                    } else {
                        self.regs.set_w(crate::regs::SP, new_esp as u16);
                    }
                    if gate32 {
                        if v86 {
                            self.push_l(u32::from(old_gs));
                            self.push_l(u32::from(old_fs));
                            self.push_l(u32::from(old_ds));
                            self.push_l(u32::from(old_es));
                            // V86 data segments are cleared on entry.
                            self.es.load_null(0);
                            self.ds.load_null(0);
                            self.fs.load_null(0);
                            self.gs.load_null(0);
                        }
                        self.push_l(u32::from(old_ss));
                        self.push_l(old_esp);
                        self.push_l(old_flags32);
                        self.push_l(u32::from(old_cs));
                        self.push_l(old_pc);
                    } else {
                        self.push_w(old_ss);
                        self.push_w(old_esp as u16);
                        self.push_w(old_flags32 as u16);
                        self.push_w(old_cs);
                        self.push_w(old_pc as u16);
                    }
                    if self.abrt.is_some() {
                        return;
                    }
                } else {
                    if v86 {
                        // A V86 interrupt must go to ring 0.
                        self.x86gpf((csel & !3) | ext);
                        return;
                    }
                    if gate32 {
                        self.push_l(old_flags32);
                        self.push_l(u32::from(old_cs));
                        self.push_l(old_pc);
                    } else {
                        self.push_w(old_flags32 as u16);
                        self.push_w(old_cs);
                        self.push_w(old_pc as u16);
                    }
                    if self.abrt.is_some() {
                        return;
                    }
                }

                let target_cpl = if !conforming && dpl < self.cpl() {
                    dpl
                } else {
                    self.cpl()
                };
                let mut cs_desc = desc;
                cs_desc[2] = (cs_desc[2] & !0x6000) | (u16::from(target_cpl) << 13);
                self.loadcs_raw((csel & !3) | u16::from(target_cpl), cs_desc);
                self.pc = offset;

                self.eflags &= !VM_FLAG;
                self.flags &= !(T_FLAG | NT_FLAG);
                if gtype & 0x01 == 0 {
                    // Interrupt gate: block further maskable interrupts.
                    self.flags &= !I_FLAG;
                }
            }
            _ => {
                self.x86gpf((u16::from(num) << 3) | 2 | ext);
            }
        }
    }

    // --- far transfers ---

    /// Far JMP to `sel:off`. In protected mode this resolves code segments,
    /// call gates and task gates/TSS; a gate to an inner ring switches
    /// stacks and leaves the outer SS:ESP/CS:EIP frame on the new stack.
    pub(crate) fn loadcsjmp(&mut self, sel: u16, off: u32) {
        if self.real_or_v86() {
            self.loadcs(sel);
            self.pc = off;
            self.cycles -= self.timing_bt;
            self.block_end = true;
            return;
        }
        self.far_transfer(sel, off, false);
    }

    /// Far CALL to `sel:off`; the return address has already been pushed by
    /// the caller for same-ring transfers (gate traversal pushes its own
    /// frame on ring change).
    pub(crate) fn loadcscall(&mut self, sel: u16, off: u32) {
        self.far_transfer(sel, off, true);
    }

    /// Common protected-mode far-transfer resolution.
    ///
    /// For `is_call`, the same-ring path pushes CS:IP here (on the current
    /// stack, sized by the live operand size).
    fn far_transfer(&mut self, sel: u16, off: u32, is_call: bool) {
        if sel & !3 == 0 {
            self.x86gpf(0);
            return;
        }
        let desc = match self.fetch_descriptor(sel) {
            Some(d) => d,
            None => return,
        };
        let access = (desc[2] >> 8) as u8;
        let dpl = access_dpl(access);

        if access & 0x10 != 0 {
            // Code or data segment.
            if access & 0x08 == 0 {
                self.x86gpf(sel & !3);
                return;
            }
            if access & 0x04 != 0 {
                if dpl > self.cpl() {
                    self.x86gpf(sel & !3);
                    return;
                }
            } else if dpl != self.cpl() {
                self.x86gpf(sel & !3);
                return;
            }
            if access & 0x80 == 0 {
                self.abort(Fault::Np(sel & !3));
                return;
            }
            if is_call {
                let (old_cs, old_pc) = (self.cs.seg, self.pc);
                if self.opsize32() {
                    self.push_l(u32::from(old_cs));
                    self.push_l(old_pc);
                } else {
                    self.push_w(old_cs);
                    self.push_w(old_pc as u16);
                }
                if self.abrt.is_some() {
                    return;
                }
            }
            let cpl = self.cpl();
            let mut cs_desc = desc;
            if access & 0x04 != 0 {
                cs_desc[2] = (cs_desc[2] & !0x6000) | (u16::from(cpl) << 13);
            }
            self.loadcs_raw((sel & !3) | u16::from(cpl), cs_desc);
            self.pc = off;
            self.cycles -= self.timing_bt;
            self.block_end = true;
            return;
        }

        match access & 0x1f {
            0x01 | 0x09 => {
                // Available TSS.
                if dpl < self.cpl() || dpl < (sel & 3) as u8 {
                    self.x86gpf(sel & !3);
                    return;
                }
                let kind = if is_call { TaskKind::CallOrInt } else { TaskKind::Jump };
                self.do_task_switch(sel, desc, kind);
            }
            0x05 => {
                // Task gate.
                if dpl < self.cpl() || dpl < (sel & 3) as u8 {
                    self.x86gpf(sel & !3);
                    return;
                }
                if access & 0x80 == 0 {
                    self.abort(Fault::Np(sel & !3));
                    return;
                }
                let kind = if is_call { TaskKind::CallOrInt } else { TaskKind::Jump };
                self.task_gate_switch(desc[1], kind);
            }
            0x04 | 0x0c => {
                // Call gate (286 or 386).
                self.call_gate_transfer(sel, desc, is_call);
            }
            _ => {
                self.x86gpf(sel & !3);
            }
        }
        self.block_end = true;
    }

    /// Traverses a call gate, switching to the target ring's stack when the
    /// target is more privileged.
    fn call_gate_transfer(&mut self, gsel: u16, gate: [u16; 4], is_call: bool) {
        let gate_access = (gate[2] >> 8) as u8;
        let gate32 = gate_access & 0x08 != 0;
        let gate_dpl = access_dpl(gate_access);
        if gate_dpl < self.cpl() || gate_dpl < (gsel & 3) as u8 {
            self.x86gpf(gsel & !3);
            return;
        }
        if gate_access & 0x80 == 0 {
            self.abort(Fault::Np(gsel & !3));
            return;
        }
        self.cgate32 = gate32;
        let offset = if gate32 {
            u32::from(gate[0]) | (u32::from(gate[3]) << 16)
        } else {
            u32::from(gate[0])
        };
        let param_count = (gate[2] & 0x1f) as u32;
        let csel = gate[1];
        if csel & !3 == 0 {
            self.x86gpf(0);
            return;
        }
        let desc = match self.fetch_descriptor(csel) {
            Some(d) => d,
            None => return,
        };
        let access = (desc[2] >> 8) as u8;
        if access & 0x18 != 0x18 {
            self.x86gpf(csel & !3);
            return;
        }
        let dpl = access_dpl(access);
        if dpl > self.cpl() {
            self.x86gpf(csel & !3);
            return;
        }
        if access & 0x80 == 0 {
            self.abort(Fault::Np(csel & !3));
            return;
        }

        if access & 0x04 == 0 && dpl < self.cpl() {
            // Inner-ring transfer through the gate.
            let (new_ss, new_esp) = match self.tss_stack(dpl) {
                Some(pair) => pair,
                None => return,
            };
            let old_ss = self.ss.seg;
            let old_esp = self.regs.l(crate::regs::SP);
            let old_ss_base = self.ss.base;
            let old_stack32 = self.stack32;
            if !self.load_inner_ss(new_ss, dpl) {
                return;
            }
            if self.stack32 {
                self.regs.set_l(crate::regs::SP, new_esp);
            } else {
                self.regs.set_w(crate::regs::SP, new_esp as u16);
            }
            let (old_cs, old_pc) = (self.cs.seg, self.pc);
            if gate32 {
                self.push_l(u32::from(old_ss));
                self.push_l(old_esp);
                // Parameters are copied from the outer stack.
                for i in (0..param_count).rev() {
                    let word = self.readmeml(old_ss_base, outer_param_addr(old_esp, old_stack32, i * 4));
                    if self.abrt.is_some() {
                        return;
                    }
                    self.push_l(word);
                }
                self.push_l(u32::from(old_cs));
                self.push_l(old_pc);
            } else {
                self.push_w(old_ss);
                self.push_w(old_esp as u16);
                for i in (0..param_count).rev() {
                    let word = self.readmemw(old_ss_base, outer_param_addr(old_esp, old_stack32, i * 2));
                    if self.abrt.is_some() {
                        return;
                    }
                    self.push_w(word);
                }
                self.push_w(old_cs);
                self.push_w(old_pc as u16);
            }
            if self.abrt.is_some() {
                return;
            }
            let mut cs_desc = desc;
            cs_desc[2] = (cs_desc[2] & !0x6000) | (u16::from(dpl) << 13);
            self.loadcs_raw((csel & !3) | u16::from(dpl), cs_desc);
            self.pc = offset;
        } else {
            // Same-ring gate transfer.
            if is_call {
                let (old_cs, old_pc) = (self.cs.seg, self.pc);
                if gate32 {
                    self.push_l(u32::from(old_cs));
                    self.push_l(old_pc);
                } else {
                    self.push_w(old_cs);
                    self.push_w(old_pc as u16);
                }
                if self.abrt.is_some() {
                    return;
                }
            }
            let cpl = self.cpl();
            let mut cs_desc = desc;
            cs_desc[2] = (cs_desc[2] & !0x6000) | (u16::from(cpl) << 13);
            self.loadcs_raw((csel & !3) | u16::from(cpl), cs_desc);
            self.pc = offset;
        }
        self.cycles -= self.timing_bt;
    }

    // --- task switching ---

    /// Resolves a task-gate target TSS selector and switches to it.
    pub(crate) fn task_gate_switch(&mut self, tss_sel: u16, kind: TaskKind) {
        if tss_sel & 4 != 0 || tss_sel & !7 == 0 {
            self.x86gpf(tss_sel & !3);
            return;
        }
        let desc = match self.fetch_descriptor(tss_sel) {
            Some(d) => d,
            None => return,
        };
        let access = (desc[2] >> 8) as u8;
        match access & 0x1f {
            0x01 | 0x09 => self.do_task_switch(tss_sel, desc, kind),
            0x03 | 0x0b if kind == TaskKind::Iret => self.do_task_switch(tss_sel, desc, kind),
            _ => self.x86gpf(tss_sel & !3),
        }
    }

    /// Performs the 286/386 task switch: saves the machine state into the
    /// outgoing TSS, loads the incoming one, and flips the busy bits.
    pub(crate) fn do_task_switch(&mut self, sel: u16, desc: [u16; 4], kind: TaskKind) {
        let access = (desc[2] >> 8) as u8;
        let tss32 = access & 0x08 != 0;
        let min_limit = if tss32 { 0x67 } else { 0x2b };
        let limit = u32::from(desc[0]);
        if limit < min_limit {
            self.x86gpf(sel & !3);
            return;
        }
        if access & 0x80 == 0 {
            self.abort(Fault::Np(sel & !3));
            return;
        }
        let new_base = u32::from(desc[1])
            | (u32::from(desc[2] & 0xff) << 16)
            | (u32::from(desc[3] & 0xff00) << 16);

        self.lazy.rebuild(&mut self.flags);

        // Save outgoing context.
        let old_base = self.tr.base;
        self.cpl_override = true;
        if self.tr.access & 0x08 != 0 {
            let flags32 = self.eflags32();
            let pc = self.pc;
            self.writememl(SegBase::ZERO, old_base.wrapping_add(0x20), pc);
            self.writememl(SegBase::ZERO, old_base.wrapping_add(0x24), flags32);
            for (i, off) in [0x28u32, 0x2c, 0x30, 0x34, 0x38, 0x3c, 0x40, 0x44]
                .iter()
                .enumerate()
            {
                let val = self.regs.l(i);
                self.writememl(SegBase::ZERO, old_base.wrapping_add(*off), val);
            }
            let segs = [self.es.seg, self.cs.seg, self.ss.seg, self.ds.seg, self.fs.seg, self.gs.seg];
            for (i, s) in segs.iter().enumerate() {
                self.writememw(SegBase::ZERO, old_base.wrapping_add(0x48 + (i as u32) * 4), *s);
            }
        } else {
            let pc = self.pc as u16;
            let flags = self.flags;
            self.writememw(SegBase::ZERO, old_base.wrapping_add(0x0e), pc);
            self.writememw(SegBase::ZERO, old_base.wrapping_add(0x10), flags);
            for i in 0..8usize {
                let val = self.regs.w(i);
                self.writememw(SegBase::ZERO, old_base.wrapping_add(0x12 + (i as u32) * 2), val);
            }
            let segs = [self.es.seg, self.cs.seg, self.ss.seg, self.ds.seg];
            for (i, s) in segs.iter().enumerate() {
                self.writememw(SegBase::ZERO, old_base.wrapping_add(0x22 + (i as u32) * 2), *s);
            }
        }
        self.cpl_override = false;
        if self.abrt.is_some() {
            return;
        }

        // Busy-bit bookkeeping.
        match kind {
            TaskKind::Jump | TaskKind::Iret => {
                // Outgoing task is no longer busy.
                let old_sel = self.tr.seg;
                if old_sel & !7 != 0 {
                    if let Some(mut old_desc) = self.fetch_descriptor(old_sel) {
                        old_desc[2] &= !0x0200;
                        self.write_descriptor_access(old_sel, old_desc[2]);
                    }
                }
            }
            TaskKind::CallOrInt => {}
        }
        if kind != TaskKind::Iret {
            let mut new_desc2 = desc[2];
            new_desc2 |= 0x0200;
            self.write_descriptor_access(sel, new_desc2);
        }

        // Back link for nested tasks.
        if kind == TaskKind::CallOrInt {
            let old_sel = self.tr.seg;
            self.cpl_override = true;
            self.writememw(SegBase::ZERO, new_base, old_sel);
            self.cpl_override = false;
        }

        // Load incoming context.
        self.cpl_override = true;
        let (new_pc, new_flags32, new_ldt);
        let mut new_regs = [0u32; 8];
        let mut new_segs = [0u16; 6];
        if tss32 {
            let new_cr3 = self.readmeml(SegBase::ZERO, new_base.wrapping_add(0x1c));
            new_pc = self.readmeml(SegBase::ZERO, new_base.wrapping_add(0x20));
            new_flags32 = self.readmeml(SegBase::ZERO, new_base.wrapping_add(0x24));
            for (i, off) in [0x28u32, 0x2c, 0x30, 0x34, 0x38, 0x3c, 0x40, 0x44]
                .iter()
                .enumerate()
            {
                new_regs[i] = self.readmeml(SegBase::ZERO, new_base.wrapping_add(*off));
            }
            for (i, slot) in new_segs.iter_mut().enumerate() {
                *slot = self.readmemw(SegBase::ZERO, new_base.wrapping_add(0x48 + (i as u32) * 4));
            }
            new_ldt = self.readmemw(SegBase::ZERO, new_base.wrapping_add(0x60));
            if self.abrt.is_none() {
                self.cr3 = new_cr3;
                self.flush_mmu_cache();
            }
        } else {
            new_pc = u32::from(self.readmemw(SegBase::ZERO, new_base.wrapping_add(0x0e)));
            new_flags32 = u32::from(self.readmemw(SegBase::ZERO, new_base.wrapping_add(0x10)));
            for (i, slot) in new_regs.iter_mut().enumerate() {
                *slot = u32::from(self.readmemw(SegBase::ZERO, new_base.wrapping_add(0x12 + (i as u32) * 2)));
            }
            for (i, slot) in new_segs.iter_mut().take(4).enumerate() {
                *slot = self.readmemw(SegBase::ZERO, new_base.wrapping_add(0x22 + (i as u32) * 2));
            }
            new_ldt = self.readmemw(SegBase::ZERO, new_base.wrapping_add(0x2a));
        }
        self.cpl_override = false;
        if self.abrt.is_some() {
            return;
        }

        self.tr = crate::cpu::SysSeg {
            seg: sel,
            base: new_base,
            limit,
            access: access | 0x02,
        };
        self.cr0 |= CR0_TS;

        let mut flags = new_flags32 as u16 | 0x0002;
        if kind == TaskKind::CallOrInt {
            flags |= NT_FLAG;
        }
        self.flags = flags;
        self.eflags = (new_flags32 >> 16) as u16;
        self.lazy.extract();
        for (i, val) in new_regs.iter().enumerate() {
            self.regs.set_l(i, *val);
        }
        self.pc = new_pc;

        // LDT first, the data segments resolve through it.
        self.load_ldt_from_selector(new_ldt);

        if self.eflags & VM_FLAG != 0 {
            self.cs.load_real(new_segs[1], 0xf3);
            self.use32_code = false;
            self.update_use32();
            self.es.load_real(new_segs[0], 0xf3);
            self.ss.load_real(new_segs[2], 0xf3);
            self.ds.load_real(new_segs[3], 0xf3);
            self.fs.load_real(new_segs[4], 0xf3);
            self.gs.load_real(new_segs[5], 0xf3);
            self.stack32 = false;
        } else {
            // CS first so CPL is right for the data segment checks.
            let rpl = (new_segs[1] & 3) as u8;
            self.loadcs_pmode(new_segs[1], rpl);
            if self.abrt.is_some() {
                return;
            }
            self.loadseg(new_segs[2], SegReg::Ss);
            self.loadseg(new_segs[0], SegReg::Es);
            self.loadseg(new_segs[3], SegReg::Ds);
            if tss32 {
                self.loadseg(new_segs[4], SegReg::Fs);
                self.loadseg(new_segs[5], SegReg::Gs);
            }
        }

        trace!("task switch to {:04x} (base {:08x})", sel, new_base);
        self.block_end = true;
    }

    /// Loads LDTR from a selector (task switch and LLDT).
    pub(crate) fn load_ldt_from_selector(&mut self, sel: u16) {
        if sel & !3 == 0 {
            self.ldt = crate::cpu::SysSeg::default();
            return;
        }
        let index = u32::from(sel & !7);
        if index + 7 > self.gdt.limit {
            self.x86gpf(sel & !3);
            return;
        }
        self.cpl_override = true;
        let mut desc = [0u16; 4];
        for (i, word) in desc.iter_mut().enumerate() {
            *word = self.readmemw(SegBase::ZERO, self.gdt.base.wrapping_add(index + (i as u32) * 2));
        }
        self.cpl_override = false;
        if self.abrt.is_some() {
            return;
        }
        let access = (desc[2] >> 8) as u8;
        if access & 0x1f != 0x02 {
            self.x86gpf(sel & !3);
            return;
        }
        let mut limit = u32::from(desc[0]) | (u32::from(desc[3] & 0x000f) << 16);
        if desc[3] & 0x0080 != 0 {
            limit = (limit << 12) | 0xfff;
        }
        self.ldt = crate::cpu::SysSeg {
            seg: sel,
            base: u32::from(desc[1])
                | (u32::from(desc[2] & 0xff) << 16)
                | (u32::from(desc[3] & 0xff00) << 16),
            limit,
            access,
        };
    }

    // --- IRET / RETF ---

    /// Protected-mode IRET (same ring, outer ring, V86 return, task
    /// return).
    pub(crate) fn pmodeiret(&mut self) {
        let op32 = self.opsize32();
        if self.eflags & VM_FLAG != 0 {
            // V86 IRET is IOPL-sensitive.
            if self.iopl() != 3 {
                self.x86gpf(0);
                return;
            }
            let (off, sel, fl) = if op32 {
                let off = self.pop_l();
                let sel = self.pop_l();
                let fl = self.pop_l();
                (off, sel as u16, fl as u16)
            } else {
                let off = self.pop_w();
                let sel = self.pop_w();
                let fl = self.pop_w();
                (u32::from(off), sel, fl)
            };
            if self.abrt.is_some() {
                return;
            }
            // IOPL stays; IF follows the image.
            self.flags = (fl & !0x3000) | (self.flags & 0x3000) | 0x0002;
            self.lazy.extract();
            self.loadcs(sel);
            self.pc = off;
            self.block_end = true;
            return;
        }

        if self.flags & NT_FLAG != 0 {
            // Nested-task return through the back link.
            self.cpl_override = true;
            let link = self.readmemw(SegBase::ZERO, self.tr.base);
            self.cpl_override = false;
            if self.abrt.is_some() {
                return;
            }
            self.task_gate_switch(link, TaskKind::Iret);
            return;
        }

        let old_cpl = self.cpl();
        let (off, sel, flags_img) = if op32 {
            let off = self.pop_l();
            let sel = self.pop_l();
            let fl = self.pop_l();
            (off, sel as u16, fl)
        } else {
            let off = self.pop_w();
            let sel = self.pop_w();
            let fl = self.pop_w();
            (u32::from(off), sel, u32::from(fl))
        };
        if self.abrt.is_some() {
            return;
        }

        if op32 && flags_img & (u32::from(VM_FLAG) << 16) != 0 && old_cpl == 0 {
            // Return to virtual-8086 mode.
            let esp = self.pop_l();
            let ss = self.pop_l() as u16;
            let es = self.pop_l() as u16;
            let ds = self.pop_l() as u16;
            let fs = self.pop_l() as u16;
            let gs = self.pop_l() as u16;
            if self.abrt.is_some() {
                return;
            }
            self.flags = flags_img as u16 | 0x0002;
            self.eflags = (flags_img >> 16) as u16;
            self.lazy.extract();
            self.cs.load_real(sel, 0xf3);
            self.use32_code = false;
            self.update_use32();
            self.ss.load_real(ss, 0xf3);
            self.stack32 = false;
            self.regs.set_l(crate::regs::SP, esp);
            self.es.load_real(es, 0xf3);
            self.ds.load_real(ds, 0xf3);
            self.fs.load_real(fs, 0xf3);
            self.gs.load_real(gs, 0xf3);
            self.pc = off & 0xffff;
            self.block_end = true;
            return;
        }

        let rpl = (sel & 3) as u8;
        if rpl < old_cpl {
            self.x86gpf(sel & !3);
            return;
        }

        if !self.ret_load_cs(sel, rpl) {
            return;
        }

        if rpl > old_cpl {
            // Outer-ring return: restore the outer stack.
            let (esp, ss) = if op32 {
                let esp = self.pop_l();
                let ss = self.pop_l() as u16;
                (esp, ss)
            } else {
                let esp = u32::from(self.pop_w());
                let ss = self.pop_w();
                (esp, ss)
            };
            if self.abrt.is_some() {
                return;
            }
            self.loadseg(ss, SegReg::Ss);
            if self.abrt.is_some() {
                return;
            }
            if self.stack32 {
                self.regs.set_l(crate::regs::SP, esp);
            } else {
                self.regs.set_w(crate::regs::SP, esp as u16);
            }
            self.validate_data_segs_for_cpl(rpl);
        }

        // Flag restore is privilege-filtered.
        let mut mask: u32 = 0x4dd5; // CF PF AF ZF SF TF DF OF NT
        if old_cpl <= self.iopl() {
            mask |= u32::from(I_FLAG);
        }
        if old_cpl == 0 {
            mask |= 0x3000; // IOPL
        }
        let keep = !(mask as u16);
        self.flags = (self.flags & keep) | (flags_img as u16 & mask as u16) | 0x0002;
        if op32 && old_cpl == 0 {
            self.eflags = (flags_img >> 16) as u16 & !VM_FLAG;
        }
        self.lazy.extract();
        self.pc = off;
        self.block_end = true;
    }

    /// Protected-mode far return (RETF), with optional immediate stack
    /// adjustment in bytes.
    pub(crate) fn pmoderetf(&mut self, extra: u16) {
        let op32 = self.opsize32();
        let old_cpl = self.cpl();
        let (off, sel) = if op32 {
            let off = self.pop_l();
            let sel = self.pop_l() as u16;
            (off, sel)
        } else {
            let off = u32::from(self.pop_w());
            let sel = self.pop_w();
            (off, sel)
        };
        if self.abrt.is_some() {
            return;
        }
        let rpl = (sel & 3) as u8;
        if rpl < old_cpl {
            self.x86gpf(sel & !3);
            return;
        }
        if !self.ret_load_cs(sel, rpl) {
            return;
        }

        if rpl > old_cpl {
            let (esp, ss) = if op32 {
                let esp = self.pop_l();
                let ss = self.pop_l() as u16;
                (esp, ss)
            } else {
                let esp = u32::from(self.pop_w());
                let ss = self.pop_w();
                (esp, ss)
            };
            if self.abrt.is_some() {
                return;
            }
            self.loadseg(ss, SegReg::Ss);
            if self.abrt.is_some() {
                return;
            }
            if self.stack32 {
                self.regs.set_l(crate::regs::SP, esp.wrapping_add(u32::from(extra)));
            } else {
                self.regs
                    .set_w(crate::regs::SP, (esp as u16).wrapping_add(extra));
            }
            self.validate_data_segs_for_cpl(rpl);
        } else {
            self.adjust_sp(i32::from(extra));
        }
        self.pc = off;
        self.cycles -= self.timing_bt;
        self.block_end = true;
    }

    /// Validates and loads CS for IRET/RETF at target privilege `rpl`.
    fn ret_load_cs(&mut self, sel: u16, rpl: u8) -> bool {
        if sel & !3 == 0 {
            self.x86gpf(0);
            return false;
        }
        let desc = match self.fetch_descriptor(sel) {
            Some(d) => d,
            None => return false,
        };
        let access = (desc[2] >> 8) as u8;
        if access & 0x18 != 0x18 {
            self.x86gpf(sel & !3);
            return false;
        }
        let dpl = access_dpl(access);
        if access & 0x04 != 0 {
            if dpl > rpl {
                self.x86gpf(sel & !3);
                return false;
            }
        } else if dpl != rpl {
            self.x86gpf(sel & !3);
            return false;
        }
        if access & 0x80 == 0 {
            self.abort(Fault::Np(sel & !3));
            return false;
        }
        let mut cs_desc = desc;
        cs_desc[2] = (cs_desc[2] & !0x6000) | (u16::from(rpl) << 13);
        self.loadcs_raw((sel & !3) | u16::from(rpl), cs_desc);
        true
    }

    /// Nulls any data segment whose DPL forbids use at the new, lower
    /// privilege (outer returns).
    fn validate_data_segs_for_cpl(&mut self, cpl: u8) {
        for r in [SegReg::Es, SegReg::Ds, SegReg::Fs, SegReg::Gs].iter() {
            let seg = self.seg(*r);
            let access = seg.access;
            // Conforming code and higher-DPL segments survive.
            if access & 0x10 != 0 && access & 0x0c != 0x0c && seg.dpl() < cpl {
                self.seg_mut(*r).load_null(0);
            }
        }
    }

    pub(crate) fn adjust_sp(&mut self, bytes: i32) {
        if self.stack32 {
            let esp = self.regs.l(crate::regs::SP);
            self.regs
                .set_l(crate::regs::SP, esp.wrapping_add(bytes as u32));
        } else {
            let sp = self.regs.w(crate::regs::SP);
            self.regs.set_w(crate::regs::SP, sp.wrapping_add(bytes as u16));
        }
    }
}

/// Offset into the outer stack for gate parameter copies.
fn outer_param_addr(old_esp: u32, stack32: bool, delta: u32) -> u32 {
    if stack32 {
        old_esp.wrapping_add(delta)
    } else {
        u32::from((old_esp as u16).wrapping_add(delta as u16))
    }
}
