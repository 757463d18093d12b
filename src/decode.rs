//! ModR/M and SIB effective-address resolution.
//!
//! `fetch_ea_*` splits the ModR/M byte into `cpu_mod`/`cpu_reg`/`cpu_rm` and,
//! for memory forms, computes `eaaddr` within the segment selected by
//! `ea_seg` (honoring the BP/ESP stack-segment defaults unless an override
//! prefix was seen). When the access lies inside a single looked-up page the
//! resolved physical address is kept in `eal_r`/`eal_w` so single-spot
//! reads and writes can skip translation entirely.

use crate::bus::Bus;
use crate::cpu::Cpu;
use crate::mem::PAGE_SHIFT;
use crate::regs::{BP, BX, DI, SI};
use crate::seg::SegReg;

impl<B: Bus> Cpu<B> {
    /// Fills `eal_r`/`eal_w` for an access fully inside one page.
    fn fill_ea_fastpaths(&mut self) {
        self.eal_r = None;
        self.eal_w = None;
        if self.easeg.is_null() {
            return;
        }
        let addr = self.easeg.raw().wrapping_add(self.eaaddr);
        if addr & 0xfff > 0xffc {
            return;
        }
        if let Some(page) = self.lookup_read(addr >> PAGE_SHIFT) {
            self.eal_r = Some((page << PAGE_SHIFT) | (addr & 0xfff));
        }
        if let Some(page) = self.lookup_write(addr >> PAGE_SHIFT) {
            self.eal_w = Some((page << PAGE_SHIFT) | (addr & 0xfff));
        }
    }

    /// Applies the stack-segment default unless an override prefix is live.
    fn default_to_ss(&mut self) {
        if !self.ssegs {
            self.ea_seg = SegReg::Ss;
            self.easeg = self.ss.base;
        }
    }

    fn fetch_ea_16_long(&mut self, fetchdat: u32) {
        self.eal_r = None;
        self.eal_w = None;
        self.easeg = self.seg(self.ea_seg).base;
        if self.cpu_mod == 0 && self.cpu_rm == 6 {
            self.eaaddr = u32::from(self.getword());
        } else {
            let disp = match self.cpu_mod {
                0 => 0u16,
                1 => {
                    let d = (fetchdat >> 8) as u8 as i8;
                    self.pc = self.pc.wrapping_add(1);
                    d as u16
                }
                _ => self.getword(),
            };
            let (a, b, ss_based) = match self.cpu_rm {
                0 => (self.regs.w(BX), self.regs.w(SI), false),
                1 => (self.regs.w(BX), self.regs.w(DI), false),
                2 => (self.regs.w(BP), self.regs.w(SI), true),
                3 => (self.regs.w(BP), self.regs.w(DI), true),
                4 => (self.regs.w(SI), 0, false),
                5 => (self.regs.w(DI), 0, false),
                6 => (self.regs.w(BP), 0, true),
                _ => (self.regs.w(BX), 0, false),
            };
            self.eaaddr = u32::from(a.wrapping_add(b).wrapping_add(disp));
            if ss_based {
                self.default_to_ss();
            }
            self.eaaddr &= 0xffff;
        }
        self.fill_ea_fastpaths();
    }

    fn fetch_ea_32_long(&mut self, fetchdat: u32) {
        self.eal_r = None;
        self.eal_w = None;
        self.easeg = self.seg(self.ea_seg).base;
        if self.cpu_rm == 4 {
            let sib = (fetchdat >> 8) as u8;
            match self.cpu_mod {
                0 => {
                    self.eaaddr = self.regs.l(usize::from(sib & 7));
                    self.pc = self.pc.wrapping_add(1);
                }
                1 => {
                    self.pc = self.pc.wrapping_add(1);
                    let disp = self.getbyte() as i8 as u32;
                    self.eaaddr = disp.wrapping_add(self.regs.l(usize::from(sib & 7)));
                }
                _ => {
                    let base = self.cs_base();
                    let disp = self.fastread_l(base.wrapping_add(self.pc).wrapping_add(1));
                    self.eaaddr = disp.wrapping_add(self.regs.l(usize::from(sib & 7)));
                    self.pc = self.pc.wrapping_add(5);
                }
            }
            if sib & 7 == 5 && self.cpu_mod == 0 {
                self.eaaddr = self.getlong();
            } else if sib & 6 == 4 {
                self.default_to_ss();
            }
            if (sib >> 3) & 7 != 4 {
                self.eaaddr = self
                    .eaaddr
                    .wrapping_add(self.regs.l(usize::from((sib >> 3) & 7)) << (sib >> 6));
            }
        } else {
            self.eaaddr = self.regs.l(self.cpu_rm);
            if self.cpu_mod != 0 {
                if self.cpu_rm == 5 {
                    self.default_to_ss();
                }
                if self.cpu_mod == 1 {
                    self.eaaddr = self.eaaddr.wrapping_add((fetchdat >> 8) as u8 as i8 as u32);
                    self.pc = self.pc.wrapping_add(1);
                } else {
                    let disp = self.getlong();
                    self.eaaddr = self.eaaddr.wrapping_add(disp);
                }
            } else if self.cpu_rm == 5 {
                self.eaaddr = self.getlong();
            }
        }
        self.fill_ea_fastpaths();
    }

    /// Decodes a ModR/M byte and resolves any memory operand using the
    /// current address size. Returns `false` when resolution faulted.
    #[inline]
    pub(crate) fn fetch_ea(&mut self, fetchdat: u32) -> bool {
        self.pc = self.pc.wrapping_add(1);
        self.cpu_mod = ((fetchdat >> 6) & 3) as usize;
        self.cpu_reg = ((fetchdat >> 3) & 7) as usize;
        self.cpu_rm = (fetchdat & 7) as usize;
        if self.cpu_mod != 3 {
            if self.addr32() {
                self.fetch_ea_32_long(fetchdat);
            } else {
                self.fetch_ea_16_long(fetchdat);
            }
        }
        self.abrt.is_none()
    }

    // --- effective-address operand accessors ---

    /// Reads the byte operand selected by ModR/M.
    pub(crate) fn geteab(&mut self) -> u8 {
        if self.cpu_mod == 3 {
            return self.regs.b(self.cpu_rm);
        }
        if let Some(phys) = self.eal_r {
            return self.ram[phys as usize];
        }
        let seg = self.easeg;
        let off = self.eaaddr;
        self.readmemb(seg, off)
    }

    pub(crate) fn geteaw(&mut self) -> u16 {
        if self.cpu_mod == 3 {
            return self.regs.w(self.cpu_rm);
        }
        if let Some(phys) = self.eal_r {
            let base = phys as usize;
            return u16::from_le_bytes([self.ram[base], self.ram[base + 1]]);
        }
        let seg = self.easeg;
        let off = self.eaaddr;
        self.readmemw(seg, off)
    }

    pub(crate) fn geteal(&mut self) -> u32 {
        if self.cpu_mod == 3 {
            return self.regs.l(self.cpu_rm);
        }
        if let Some(phys) = self.eal_r {
            let base = phys as usize;
            return u32::from_le_bytes([
                self.ram[base],
                self.ram[base + 1],
                self.ram[base + 2],
                self.ram[base + 3],
            ]);
        }
        let seg = self.easeg;
        let off = self.eaaddr;
        self.readmeml(seg, off)
    }

    pub(crate) fn geteaq(&mut self) -> u64 {
        let seg = self.easeg;
        let off = self.eaaddr;
        self.readmemq(seg, off)
    }

    /// Writes the byte operand selected by ModR/M.
    pub(crate) fn seteab(&mut self, val: u8) {
        if self.cpu_mod == 3 {
            self.regs.set_b(self.cpu_rm, val);
            return;
        }
        if let Some(phys) = self.eal_w {
            self.mark_dirty(phys);
            self.ram[phys as usize] = val;
            return;
        }
        let seg = self.easeg;
        let off = self.eaaddr;
        self.writememb(seg, off, val);
    }

    pub(crate) fn seteaw(&mut self, val: u16) {
        if self.cpu_mod == 3 {
            self.regs.set_w(self.cpu_rm, val);
            return;
        }
        if let Some(phys) = self.eal_w {
            self.mark_dirty(phys);
            let base = phys as usize;
            self.ram[base..base + 2].copy_from_slice(&val.to_le_bytes());
            return;
        }
        let seg = self.easeg;
        let off = self.eaaddr;
        self.writememw(seg, off, val);
    }

    pub(crate) fn seteal(&mut self, val: u32) {
        if self.cpu_mod == 3 {
            self.regs.set_l(self.cpu_rm, val);
            return;
        }
        if let Some(phys) = self.eal_w {
            self.mark_dirty(phys);
            let base = phys as usize;
            self.ram[base..base + 4].copy_from_slice(&val.to_le_bytes());
            return;
        }
        let seg = self.easeg;
        let off = self.eaaddr;
        self.writememl(seg, off, val);
    }

    pub(crate) fn seteaq(&mut self, val: u64) {
        let seg = self.easeg;
        let off = self.eaaddr;
        self.writememq(seg, off, val);
    }
}

#[cfg(test)]
mod tests {
    use crate::cpu::tests::real_mode_cpu;
    use crate::regs::{BP, BX, SI};

    #[test]
    fn bx_si_disp8_form() {
        let mut cpu = real_mode_cpu();
        cpu.regs.set_w(BX, 0x1000);
        cpu.regs.set_w(SI, 0x0234);
        // mod=01 reg=000 rm=000, disp8 = 0x10
        assert!(cpu.fetch_ea(0x1040));
        assert_eq!(cpu.eaaddr, 0x1244);
    }

    #[test]
    fn bp_form_defaults_to_stack_segment() {
        let mut cpu = real_mode_cpu();
        cpu.ss.load_real(0x2000, 0x93);
        cpu.regs.set_w(BP, 0x0100);
        // mod=01 reg=000 rm=110 (BP+disp8), disp8 = 4
        assert!(cpu.fetch_ea(0x0446));
        assert_eq!(cpu.easeg.raw(), 0x2_0000);
        assert_eq!(cpu.eaaddr, 0x0104);
    }

    #[test]
    fn sixteen_bit_wraparound_masks_the_address() {
        let mut cpu = real_mode_cpu();
        cpu.regs.set_w(BX, 0xffff);
        cpu.regs.set_w(SI, 0x0002);
        // mod=00 reg=000 rm=000 (BX+SI)
        assert!(cpu.fetch_ea(0x0000));
        assert_eq!(cpu.eaaddr, 0x0001);
    }
}
