//! Segment register loading and checking.
//!
//! Each segment register carries a descriptor cache `{selector, base, limit
//! window, access byte}` plus a `checked` bit that memoizes a passed limit
//! check until the next reload. Real mode and virtual-8086 loads synthesize
//! the cache directly from the selector; protected-mode loads fetch and
//! validate the descriptor from the GDT or LDT.

use bitflags::bitflags;

use crate::bus::Bus;
use crate::cpu::{Cpu, Fault};
use crate::flags::VM_FLAG;
use crate::mem::CR0_PE;

/// A cached segment base address.
///
/// The null discriminant marks a data segment loaded with a null selector in
/// protected mode; the memory fast path refuses it so the slow path can
/// raise `#GP(0)` on any use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegBase(u32);

impl SegBase {
    pub const NULL: SegBase = SegBase(u32::MAX);
    pub const ZERO: SegBase = SegBase(0);

    #[inline]
    pub fn new(base: u32) -> Self {
        SegBase(base)
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == u32::MAX
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

bitflags! {
    /// Descriptor access-rights byte.
    pub struct Access: u8 {
        const ACCESSED = 1 << 0;
        /// Writable for data segments, readable for code segments.
        const RW = 1 << 1;
        /// Expand-down for data segments, conforming for code segments.
        const DC = 1 << 2;
        const CODE = 1 << 3;
        const NON_SYSTEM = 1 << 4;
        const PRESENT = 1 << 7;
    }
}

/// Extracts the DPL field of an access byte.
#[inline]
pub fn access_dpl(access: u8) -> u8 {
    (access >> 5) & 3
}

/// The architectural segment registers, in instruction-encoding order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegReg {
    pub(crate) fn from_index(idx: usize) -> SegReg {
        match idx & 7 {
            0 => SegReg::Es,
            1 => SegReg::Cs,
            2 => SegReg::Ss,
            3 => SegReg::Ds,
            4 => SegReg::Fs,
            _ => SegReg::Gs,
        }
    }
}

/// One segment register's descriptor cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    /// The visible selector.
    pub seg: u16,
    pub base: SegBase,
    /// Raw limit in bytes (already scaled for granularity).
    pub limit: u32,
    /// Lowest valid offset (non-zero only for expand-down segments).
    pub limit_low: u32,
    /// Highest valid offset.
    pub limit_high: u32,
    pub access: u8,
    /// Memoized limit check; cleared on every reload.
    pub checked: bool,
}

impl Default for Segment {
    fn default() -> Self {
        Segment {
            seg: 0,
            base: SegBase::ZERO,
            limit: 0xffff,
            limit_low: 0,
            limit_high: 0xffff,
            access: 0x93,
            checked: false,
        }
    }
}

impl Segment {
    /// Synthesizes the real-mode / V86 cache for `selector`. Public so an
    /// emulator shell can seed segments when building machine state.
    pub fn load_real(&mut self, selector: u16, access: u8) {
        self.seg = selector;
        self.base = SegBase::new(u32::from(selector) << 4);
        self.limit = 0xffff;
        self.limit_low = 0;
        self.limit_high = 0xffff;
        self.access = access;
        self.checked = false;
    }

    /// Fills the cache from a fetched descriptor.
    pub(crate) fn load_descriptor(&mut self, selector: u16, desc: [u16; 4]) {
        let mut limit = u32::from(desc[0]) | (u32::from(desc[3] & 0x000f) << 16);
        if desc[3] & 0x0080 != 0 {
            // 4 KiB granularity.
            limit = (limit << 12) | 0xfff;
        }
        let access = (desc[2] >> 8) as u8;
        self.seg = selector;
        self.base = SegBase::new(
            u32::from(desc[1]) | (u32::from(desc[2] & 0xff) << 16) | (u32::from(desc[3] & 0xff00) << 16),
        );
        self.limit = limit;
        if access & 0x18 == 0x10 && access & 0x04 != 0 {
            // Expand-down data segment: valid window is above the limit.
            self.limit_low = limit.wrapping_add(1);
            self.limit_high = if desc[3] & 0x0040 != 0 { 0xffff_ffff } else { 0xffff };
        } else {
            self.limit_low = 0;
            self.limit_high = limit;
        }
        self.access = access;
        self.checked = false;
    }

    /// Loads a null selector: the base sentinel forces the memory slow path.
    pub(crate) fn load_null(&mut self, selector: u16) {
        self.seg = selector;
        self.base = SegBase::NULL;
        self.limit = 0;
        self.limit_low = 0;
        self.limit_high = 0;
        self.access = 0;
        self.checked = false;
    }

    #[inline]
    pub fn dpl(&self) -> u8 {
        access_dpl(self.access)
    }
}

impl<B: Bus> Cpu<B> {
    /// Base of the current code segment.
    #[inline]
    pub(crate) fn cs_base(&self) -> u32 {
        self.cs.base.raw()
    }

    /// Current privilege level, derived from the CS access byte (3 in V86).
    #[inline]
    pub fn cpl(&self) -> u8 {
        access_dpl(self.cs.access)
    }

    /// Whether the core is in real or virtual-8086 addressing.
    #[inline]
    pub(crate) fn real_or_v86(&self) -> bool {
        self.cr0 & CR0_PE == 0 || self.eflags & VM_FLAG != 0
    }

    pub(crate) fn seg(&self, r: SegReg) -> &Segment {
        match r {
            SegReg::Es => &self.es,
            SegReg::Cs => &self.cs,
            SegReg::Ss => &self.ss,
            SegReg::Ds => &self.ds,
            SegReg::Fs => &self.fs,
            SegReg::Gs => &self.gs,
        }
    }

    pub(crate) fn seg_mut(&mut self, r: SegReg) -> &mut Segment {
        match r {
            SegReg::Es => &mut self.es,
            SegReg::Cs => &mut self.cs,
            SegReg::Ss => &mut self.ss,
            SegReg::Ds => &mut self.ds,
            SegReg::Fs => &mut self.fs,
            SegReg::Gs => &mut self.gs,
        }
    }

    /// Reads an 8-byte descriptor for `selector` from the GDT or LDT,
    /// checking the table limit. The fault selector in the error code keeps
    /// the caller's RPL bits stripped.
    pub(crate) fn fetch_descriptor(&mut self, selector: u16) -> Option<[u16; 4]> {
        let index = u32::from(selector & !7);
        let (base, limit) = if selector & 4 != 0 {
            (self.ldt.base, self.ldt.limit)
        } else {
            (self.gdt.base, self.gdt.limit)
        };
        if index + 7 > limit {
            self.x86gpf(selector & !3);
            return None;
        }
        self.cpl_override = true;
        let mut desc = [0u16; 4];
        for (i, word) in desc.iter_mut().enumerate() {
            *word = self.readmemw(SegBase::ZERO, base.wrapping_add(index + (i as u32) * 2));
            if self.abrt.is_some() {
                self.cpl_override = false;
                return None;
            }
        }
        self.cpl_override = false;
        Some(desc)
    }

    /// Writes back a descriptor's access word (for marking TSS busy bits).
    pub(crate) fn write_descriptor_access(&mut self, selector: u16, word2: u16) {
        let index = u32::from(selector & !7);
        let base = if selector & 4 != 0 { self.ldt.base } else { self.gdt.base };
        self.cpl_override = true;
        self.writememw(SegBase::ZERO, base.wrapping_add(index + 4), word2);
        self.cpl_override = false;
    }

    /// Loads a data segment register (DS/ES/FS/GS/SS).
    ///
    /// In real mode and V86 the descriptor cache is synthesized; in
    /// protected mode the descriptor is fetched and validated. On any fault
    /// the register is left untouched.
    pub(crate) fn loadseg(&mut self, selector: u16, r: SegReg) {
        debug_assert!(r != SegReg::Cs);
        if self.real_or_v86() {
            let access = if self.eflags & VM_FLAG != 0 { 0xf3 } else { 0x93 };
            self.seg_mut(r).load_real(selector, access);
            if r == SegReg::Ss {
                self.stack32 = false;
            }
            return;
        }

        if selector & !3 == 0 {
            // Null selector: legal for data segments, fatal for SS.
            if r == SegReg::Ss {
                self.x86gpf(0);
                return;
            }
            self.seg_mut(r).load_null(selector);
            return;
        }

        let desc = match self.fetch_descriptor(selector) {
            Some(d) => d,
            None => return,
        };
        let access = (desc[2] >> 8) as u8;
        let rpl = (selector & 3) as u8;
        let dpl = access_dpl(access);

        if r == SegReg::Ss {
            if rpl != self.cpl() || dpl != self.cpl() {
                self.x86gpf(selector & !3);
                return;
            }
            // Must be a writable data segment.
            if access & 0x1a != 0x12 {
                self.x86gpf(selector & !3);
                return;
            }
            if access & 0x80 == 0 {
                self.abort(Fault::Ss(selector & !3));
                return;
            }
        } else {
            // Data or readable code.
            if access & 0x10 == 0 || (access & 0x08 != 0 && access & 0x02 == 0) {
                self.x86gpf(selector & !3);
                return;
            }
            // Privilege applies to data and non-conforming code only.
            if access & 0x0c != 0x0c && dpl < rpl.max(self.cpl()) {
                self.x86gpf(selector & !3);
                return;
            }
            if access & 0x80 == 0 {
                self.abort(Fault::Np(selector & !3));
                return;
            }
        }

        self.seg_mut(r).load_descriptor(selector, desc);
        self.mark_accessed(selector, desc);
        if r == SegReg::Ss {
            self.stack32 = desc[3] & 0x0040 != 0;
        }
    }

    fn mark_accessed(&mut self, selector: u16, desc: [u16; 4]) {
        if desc[2] & 0x0100 == 0 {
            self.write_descriptor_access(selector, desc[2] | 0x0100);
        }
    }

    /// Loads CS for a sequential far transfer (far JMP/RET target already
    /// validated by the caller) or for real/V86 mode.
    pub(crate) fn loadcs_raw(&mut self, selector: u16, desc: [u16; 4]) {
        self.cs.load_descriptor(selector, desc);
        self.use32_code = desc[3] & 0x0040 != 0;
        self.update_use32();
    }

    /// Real-mode / V86 CS load, also used by interrupt delivery.
    pub(crate) fn loadcs(&mut self, selector: u16) {
        if self.real_or_v86() {
            let access = if self.eflags & VM_FLAG != 0 { 0xf3 } else { 0x9b };
            self.cs.load_real(selector, access);
            self.use32_code = false;
            self.update_use32();
            return;
        }
        self.loadcs_pmode(selector, self.cpl());
    }

    /// Protected-mode CS load at privilege `cpl` (direct far JMP path).
    pub(crate) fn loadcs_pmode(&mut self, selector: u16, cpl: u8) {
        if selector & !3 == 0 {
            self.x86gpf(0);
            return;
        }
        let desc = match self.fetch_descriptor(selector) {
            Some(d) => d,
            None => return,
        };
        let access = (desc[2] >> 8) as u8;
        if access & 0x18 != 0x18 {
            // Not a code segment.
            self.x86gpf(selector & !3);
            return;
        }
        let dpl = access_dpl(access);
        if access & 0x04 != 0 {
            // Conforming: may not be more privileged than CPL.
            if dpl > cpl {
                self.x86gpf(selector & !3);
                return;
            }
        } else if dpl != cpl {
            self.x86gpf(selector & !3);
            return;
        }
        if access & 0x80 == 0 {
            self.abort(Fault::Np(selector & !3));
            return;
        }
        let selector = (selector & !3) | u16::from(cpl);
        // CPL lives in the cached access byte's DPL field for conforming
        // segments too.
        let mut desc = desc;
        if access & 0x04 != 0 {
            desc[2] = (desc[2] & !0x6000) | (u16::from(cpl) << 13);
        }
        self.loadcs_raw(selector, desc);
        self.mark_accessed(selector, desc);
    }

    /// Limit and presence check for a read in segment `r` over offsets
    /// `[low, high]`. Memoized via the `checked` bit.
    pub(crate) fn check_read(&mut self, r: SegReg, low: u32, high: u32) -> bool {
        let (limit_low, limit_high, access, seg, checked) = {
            let s = self.seg(r);
            (s.limit_low, s.limit_high, s.access, s.seg, s.checked)
        };
        if checked {
            return true;
        }
        if low < limit_low || high > limit_high {
            self.x86gpf(0);
            return false;
        }
        let rights = Access::from_bits_truncate(access);
        if !self.real_or_v86() && !rights.contains(Access::PRESENT) {
            let fault = if r == SegReg::Ss {
                Fault::Ss(seg & !3)
            } else {
                Fault::Np(seg & !3)
            };
            self.abort(fault);
            return false;
        }
        true
    }

    /// Limit, writability and presence check for a write in segment `r`.
    pub(crate) fn check_write(&mut self, r: SegReg, low: u32, high: u32) -> bool {
        let (limit_low, limit_high, access, seg, checked) = {
            let s = self.seg(r);
            (s.limit_low, s.limit_high, s.access, s.seg, s.checked)
        };
        if checked {
            return true;
        }
        let rights = Access::from_bits_truncate(access);
        if low < limit_low
            || high > limit_high
            || (!self.real_or_v86() && !rights.contains(Access::RW))
        {
            self.x86gpf(0);
            return false;
        }
        if !self.real_or_v86() && !rights.contains(Access::PRESENT) {
            let fault = if r == SegReg::Ss {
                Fault::Ss(seg & !3)
            } else {
                Fault::Np(seg & !3)
            };
            self.abort(fault);
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_limits_scale_with_granularity() {
        let mut seg = Segment::default();
        // Base 0x0001_0000, limit 0x0ffff, byte granular, data RW, present.
        seg.load_descriptor(0x08, [0xffff, 0x0000, 0x9201, 0x0000]);
        assert_eq!(seg.base.raw(), 0x0001_0000);
        assert_eq!(seg.limit_high, 0xffff);
        // Same but page granular with limit 0xfffff: a flat 4 GiB segment.
        seg.load_descriptor(0x08, [0xffff, 0x0000, 0x9200, 0x00cf]);
        assert_eq!(seg.limit_high, 0xffff_ffff);
        assert!(!seg.checked);
    }

    #[test]
    fn expand_down_window_sits_above_the_limit() {
        let mut seg = Segment::default();
        // Expand-down data segment, limit 0x0fff, 16-bit.
        seg.load_descriptor(0x10, [0x0fff, 0x0000, 0x9600, 0x0000]);
        assert_eq!(seg.limit_low, 0x1000);
        assert_eq!(seg.limit_high, 0xffff);
    }

    #[test]
    fn real_mode_load_shifts_the_selector() {
        let mut seg = Segment::default();
        seg.load_real(0xb800, 0x93);
        assert_eq!(seg.base.raw(), 0xb8000);
        assert_eq!(seg.limit_high, 0xffff);
    }
}
