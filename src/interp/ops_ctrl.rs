//! Control flow: conditional and unconditional jumps, near and far calls,
//! returns, IRET, the LOOP family, software interrupts and group 5.

use crate::bus::Bus;
use crate::cpu::{Cpu, OpFn, OpOutcome};
use crate::flags::FlagOp;
use crate::interp::set_all;
use crate::regs::CX;

impl<B: Bus> Cpu<B> {
    fn branch_to(&mut self, target: u32) {
        self.pc = if self.use32_code { target } else { target & 0xffff };
        self.cycles -= self.timing_bt;
    }
}

/// 70..7F: Jcc rel8.
fn op_jcc_rel8<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    let disp = fetchdat as u8 as i8;
    cpu.pc = cpu.pc.wrapping_add(1);
    let cc = usize::from(cpu.opcode & 0xf);
    cpu.cycles -= 1;
    if cpu.cond(cc) {
        let target = cpu.pc.wrapping_add(disp as u32);
        cpu.branch_to(target);
        return OpOutcome::BlockEnd;
    }
    OpOutcome::Continue
}

/// 0F 80..8F: Jcc rel16/32.
fn op_jcc_rel<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    let disp = if cpu.opsize32() {
        let d = cpu.getlong();
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        d
    } else {
        cpu.pc = cpu.pc.wrapping_add(2);
        fetchdat as u16 as i16 as u32
    };
    let cc = usize::from(cpu.opcode & 0xf);
    cpu.cycles -= 1;
    if cpu.cond(cc) {
        let target = cpu.pc.wrapping_add(disp);
        cpu.branch_to(target);
        return OpOutcome::BlockEnd;
    }
    OpOutcome::Continue
}

/// E8: CALL rel16/32.
fn op_call_rel<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    let disp = if cpu.opsize32() {
        let d = cpu.getlong();
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        d
    } else {
        cpu.pc = cpu.pc.wrapping_add(2);
        fetchdat as u16 as i16 as u32
    };
    let ret = cpu.pc;
    if cpu.opsize32() {
        cpu.push_l(ret);
    } else {
        cpu.push_w(ret as u16);
    }
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    let target = cpu.pc.wrapping_add(disp);
    cpu.branch_to(target);
    OpOutcome::BlockEnd
}

/// E9: JMP rel16/32.
fn op_jmp_rel<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    let disp = if cpu.opsize32() {
        let d = cpu.getlong();
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        d
    } else {
        cpu.pc = cpu.pc.wrapping_add(2);
        fetchdat as u16 as i16 as u32
    };
    let target = cpu.pc.wrapping_add(disp);
    cpu.branch_to(target);
    OpOutcome::BlockEnd
}

/// EB: JMP rel8.
fn op_jmp_rel8<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    let disp = fetchdat as u8 as i8;
    cpu.pc = cpu.pc.wrapping_add(1);
    let target = cpu.pc.wrapping_add(disp as u32);
    cpu.branch_to(target);
    OpOutcome::BlockEnd
}

/// EA: JMP far ptr16:16/32.
fn op_jmp_far<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let off = if cpu.opsize32() {
        cpu.getlong()
    } else {
        u32::from(cpu.getword())
    };
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    let sel = cpu.getword();
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    cpu.loadcsjmp(sel, off);
    OpOutcome::BlockEnd
}

/// 9A: CALL far ptr16:16/32.
fn op_call_far<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    let off = if cpu.opsize32() {
        cpu.getlong()
    } else {
        u32::from(cpu.getword())
    };
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    let sel = cpu.getword();
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    do_call_far(cpu, sel, off);
    OpOutcome::BlockEnd
}

fn do_call_far<B: Bus>(cpu: &mut Cpu<B>, sel: u16, off: u32) {
    if cpu.real_or_v86() {
        let (old_cs, ret) = (cpu.cs.seg, cpu.pc);
        if cpu.opsize32() {
            cpu.push_l(u32::from(old_cs));
            if cpu.abrt.is_some() {
                return;
            }
            cpu.push_l(ret);
        } else {
            cpu.push_w(old_cs);
            if cpu.abrt.is_some() {
                return;
            }
            cpu.push_w(ret as u16);
        }
        if cpu.abrt.is_some() {
            return;
        }
        cpu.loadcs(sel);
        cpu.pc = off;
        cpu.cycles -= cpu.timing_bt;
        cpu.block_end = true;
    } else {
        cpu.loadcscall(sel, off);
    }
}

/// C2/C3: RET near (optionally releasing imm16 bytes).
fn op_ret_imm<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    let extra = fetchdat as u16;
    cpu.pc = cpu.pc.wrapping_add(2);
    ret_near(cpu, extra)
}

fn op_ret<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    ret_near(cpu, 0)
}

fn ret_near<B: Bus>(cpu: &mut Cpu<B>, extra: u16) -> OpOutcome {
    let target = if cpu.opsize32() {
        cpu.pop_l()
    } else {
        u32::from(cpu.pop_w())
    };
    if cpu.abrt.is_some() {
        return OpOutcome::Continue;
    }
    cpu.adjust_sp(i32::from(extra));
    cpu.branch_to(target);
    OpOutcome::BlockEnd
}

/// CA/CB: RET far.
fn op_retf_imm<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    let extra = fetchdat as u16;
    cpu.pc = cpu.pc.wrapping_add(2);
    ret_far(cpu, extra)
}

fn op_retf<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    ret_far(cpu, 0)
}

fn ret_far<B: Bus>(cpu: &mut Cpu<B>, extra: u16) -> OpOutcome {
    if cpu.real_or_v86() {
        let (off, sel) = if cpu.opsize32() {
            let off = cpu.pop_l();
            let sel = cpu.pop_l() as u16;
            (off, sel)
        } else {
            let off = u32::from(cpu.pop_w());
            let sel = cpu.pop_w();
            (off, sel)
        };
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        cpu.adjust_sp(i32::from(extra));
        cpu.loadcs(sel);
        cpu.pc = off;
        cpu.cycles -= cpu.timing_bt;
    } else {
        cpu.pmoderetf(extra);
    }
    OpOutcome::BlockEnd
}

/// CF: IRET.
fn op_iret<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    if cpu.protected() {
        cpu.pmodeiret();
    } else {
        let (off, sel, flags) = if cpu.opsize32() {
            let off = cpu.pop_l();
            let sel = cpu.pop_l() as u16;
            let fl = cpu.pop_l() as u16;
            (off, sel, fl)
        } else {
            let off = u32::from(cpu.pop_w());
            let sel = cpu.pop_w();
            let fl = cpu.pop_w();
            (off, sel, fl)
        };
        if cpu.abrt.is_some() {
            return OpOutcome::Continue;
        }
        cpu.flags = flags | 0x0002;
        cpu.lazy.extract();
        cpu.loadcs(sel);
        cpu.pc = off;
        cpu.cycles -= cpu.timing_bt;
    }
    cpu.trap = false;
    OpOutcome::BlockEnd
}

// --- LOOP family ---

fn loop_counter_dec<B: Bus>(cpu: &mut Cpu<B>) -> bool {
    if cpu.addr32() {
        let c = cpu.regs.l(CX).wrapping_sub(1);
        cpu.regs.set_l(CX, c);
        c != 0
    } else {
        let c = cpu.regs.w(CX).wrapping_sub(1);
        cpu.regs.set_w(CX, c);
        c != 0
    }
}

fn op_loopne<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    let disp = fetchdat as u8 as i8;
    cpu.pc = cpu.pc.wrapping_add(1);
    let go = loop_counter_dec(cpu) && !cpu.zf();
    cpu.cycles -= 2;
    if go {
        let target = cpu.pc.wrapping_add(disp as u32);
        cpu.branch_to(target);
        return OpOutcome::BlockEnd;
    }
    OpOutcome::Continue
}

fn op_loope<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    let disp = fetchdat as u8 as i8;
    cpu.pc = cpu.pc.wrapping_add(1);
    let go = loop_counter_dec(cpu) && cpu.zf();
    cpu.cycles -= 2;
    if go {
        let target = cpu.pc.wrapping_add(disp as u32);
        cpu.branch_to(target);
        return OpOutcome::BlockEnd;
    }
    OpOutcome::Continue
}

fn op_loop<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    let disp = fetchdat as u8 as i8;
    cpu.pc = cpu.pc.wrapping_add(1);
    let go = loop_counter_dec(cpu);
    cpu.cycles -= 2;
    if go {
        let target = cpu.pc.wrapping_add(disp as u32);
        cpu.branch_to(target);
        return OpOutcome::BlockEnd;
    }
    OpOutcome::Continue
}

fn op_jcxz<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    let disp = fetchdat as u8 as i8;
    cpu.pc = cpu.pc.wrapping_add(1);
    let zero = if cpu.addr32() {
        cpu.regs.l(CX) == 0
    } else {
        cpu.regs.w(CX) == 0
    };
    cpu.cycles -= 2;
    if zero {
        let target = cpu.pc.wrapping_add(disp as u32);
        cpu.branch_to(target);
        return OpOutcome::BlockEnd;
    }
    OpOutcome::Continue
}

// --- software interrupts ---

fn op_int3<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    cpu.x86_int_sw(3);
    OpOutcome::BlockEnd
}

fn op_int_imm<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    let vec = fetchdat as u8;
    cpu.pc = cpu.pc.wrapping_add(1);
    cpu.x86_int_sw(vec);
    OpOutcome::BlockEnd
}

fn op_into<B: Bus>(cpu: &mut Cpu<B>, _fetchdat: u32) -> OpOutcome {
    if cpu.of() {
        cpu.x86_int_sw(4);
        return OpOutcome::BlockEnd;
    }
    cpu.cycles -= 3;
    OpOutcome::Continue
}

// --- group 5 ---

fn grp5_ev<B: Bus>(cpu: &mut Cpu<B>, fetchdat: u32) -> OpOutcome {
    if !cpu.fetch_ea(fetchdat) {
        return OpOutcome::Continue;
    }
    match cpu.cpu_reg {
        0 | 1 => {
            // INC/DEC Ev.
            let cf = cpu.cf();
            if cpu.opsize32() {
                let v = cpu.geteal();
                if cpu.abrt.is_some() {
                    return OpOutcome::Continue;
                }
                if cpu.cpu_reg == 0 {
                    cpu.lazy.set_incdec(FlagOp::Inc32, v, cf);
                    cpu.seteal(v.wrapping_add(1));
                } else {
                    cpu.lazy.set_incdec(FlagOp::Dec32, v, cf);
                    cpu.seteal(v.wrapping_sub(1));
                }
            } else {
                let v = cpu.geteaw();
                if cpu.abrt.is_some() {
                    return OpOutcome::Continue;
                }
                if cpu.cpu_reg == 0 {
                    cpu.lazy.set_incdec(FlagOp::Inc16, u32::from(v), cf);
                    cpu.seteaw(v.wrapping_add(1));
                } else {
                    cpu.lazy.set_incdec(FlagOp::Dec16, u32::from(v), cf);
                    cpu.seteaw(v.wrapping_sub(1));
                }
            }
            cpu.cycles -= 2;
            OpOutcome::Continue
        }
        2 => {
            // CALL near Ev.
            let target = if cpu.opsize32() {
                cpu.geteal()
            } else {
                u32::from(cpu.geteaw())
            };
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            let ret = cpu.pc;
            if cpu.opsize32() {
                cpu.push_l(ret);
            } else {
                cpu.push_w(ret as u16);
            }
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            cpu.branch_to(target);
            OpOutcome::BlockEnd
        }
        3 => {
            // CALL far m16:16/32.
            if cpu.cpu_mod == 3 {
                cpu.x86illegal();
                return OpOutcome::BlockEnd;
            }
            let seg = cpu.easeg;
            let addr = cpu.eaaddr;
            let (off, sel) = if cpu.opsize32() {
                let off = cpu.readmeml(seg, addr);
                if cpu.abrt.is_some() {
                    return OpOutcome::Continue;
                }
                let sel = cpu.readmemw(seg, addr.wrapping_add(4));
                (off, sel)
            } else {
                let off = u32::from(cpu.readmemw(seg, addr));
                if cpu.abrt.is_some() {
                    return OpOutcome::Continue;
                }
                let sel = cpu.readmemw(seg, addr.wrapping_add(2));
                (off, sel)
            };
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            do_call_far(cpu, sel, off);
            OpOutcome::BlockEnd
        }
        4 => {
            let target = if cpu.opsize32() {
                cpu.geteal()
            } else {
                u32::from(cpu.geteaw())
            };
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            cpu.branch_to(target);
            OpOutcome::BlockEnd
        }
        5 => {
            // JMP far m16:16/32.
            if cpu.cpu_mod == 3 {
                cpu.x86illegal();
                return OpOutcome::BlockEnd;
            }
            let seg = cpu.easeg;
            let addr = cpu.eaaddr;
            let (off, sel) = if cpu.opsize32() {
                let off = cpu.readmeml(seg, addr);
                if cpu.abrt.is_some() {
                    return OpOutcome::Continue;
                }
                let sel = cpu.readmemw(seg, addr.wrapping_add(4));
                (off, sel)
            } else {
                let off = u32::from(cpu.readmemw(seg, addr));
                if cpu.abrt.is_some() {
                    return OpOutcome::Continue;
                }
                let sel = cpu.readmemw(seg, addr.wrapping_add(2));
                (off, sel)
            };
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            cpu.loadcsjmp(sel, off);
            OpOutcome::BlockEnd
        }
        6 => {
            let val = if cpu.opsize32() {
                cpu.geteal()
            } else {
                u32::from(cpu.geteaw())
            };
            if cpu.abrt.is_some() {
                return OpOutcome::Continue;
            }
            if cpu.opsize32() {
                cpu.push_l(val);
            } else {
                cpu.push_w(val as u16);
            }
            cpu.cycles -= 2;
            OpOutcome::Continue
        }
        _ => {
            cpu.x86illegal();
            OpOutcome::BlockEnd
        }
    }
}

pub(crate) fn install<B: Bus>(t: &mut [OpFn<B>]) {
    for op in 0x70..0x80 {
        set_all(t, op, op_jcc_rel8);
    }
    set_all(t, 0x9a, op_call_far);
    set_all(t, 0xc2, op_ret_imm);
    set_all(t, 0xc3, op_ret);
    set_all(t, 0xca, op_retf_imm);
    set_all(t, 0xcb, op_retf);
    set_all(t, 0xcc, op_int3);
    set_all(t, 0xcd, op_int_imm);
    set_all(t, 0xce, op_into);
    set_all(t, 0xcf, op_iret);
    set_all(t, 0xe0, op_loopne);
    set_all(t, 0xe1, op_loope);
    set_all(t, 0xe2, op_loop);
    set_all(t, 0xe3, op_jcxz);
    set_all(t, 0xe8, op_call_rel);
    set_all(t, 0xe9, op_jmp_rel);
    set_all(t, 0xea, op_jmp_far);
    set_all(t, 0xeb, op_jmp_rel8);
    set_all(t, 0xff, grp5_ev);
}

pub(crate) fn install_0f<B: Bus>(t: &mut [OpFn<B>]) {
    for op in 0x80..0x90 {
        set_all(t, op, op_jcc_rel);
    }
}
