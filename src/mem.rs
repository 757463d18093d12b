//! Linear-to-physical memory translation.
//!
//! Every guest access funnels through the primitives here. The fast path is
//! a pair of TLB-like page tables (`readlookup2`/`writelookup2`) mapping a
//! linear page index to a physical RAM page index; an access that stays
//! inside one looked-up page is a single slice read or write. Everything
//! else — paging, access checks, A/D bit updates, MMIO dispatch — happens in
//! the slow path, which latches a fault in `abrt` instead of returning it.
//!
//! Instruction fetch has its own one-page shortcut (`pccache`) so that the
//! hot `fetch_long` at the top of the dispatch loop is a single bounds-free
//! slice load.

use bitflags::bitflags;

use crate::bus::Bus;
use crate::cpu::{Cpu, Fault};
use crate::seg::SegBase;

/// Log2 of the page size.
pub const PAGE_SHIFT: u32 = 12;
/// Log2 of the SMC tracking granule (64 bytes, 64 granules per page).
pub const GRANULE_SHIFT: u32 = 6;

/// Empty entry in the lookup tables and the fetch cache.
pub(crate) const LOOKUP_EMPTY: u32 = u32::MAX;

/// CR0.PG.
pub const CR0_PG: u32 = 1 << 31;
/// CR0.CD.
pub const CR0_CD: u32 = 1 << 30;
/// CR0.WP (honored from the 486 on).
pub const CR0_WP: u32 = 1 << 16;
/// CR0.TS.
pub const CR0_TS: u32 = 1 << 3;
/// CR0.EM.
pub const CR0_EM: u32 = 1 << 2;
/// CR0.MP.
pub const CR0_MP: u32 = 1 << 1;
/// CR0.PE.
pub const CR0_PE: u32 = 1 << 0;

bitflags! {
    /// Page-fault error code bits pushed with `#PF`.
    pub struct PfErr: u16 {
        /// The fault was a protection violation (page was present).
        const PRESENT = 1 << 0;
        /// The faulting access was a write.
        const WRITE = 1 << 1;
        /// The faulting access came from user (CPL 3) code.
        const USER = 1 << 2;
    }
}

/// Per-physical-page code tracking used for self-modifying-code detection.
#[derive(Clone, Copy, Default)]
pub struct PageEntry {
    /// Bit per 64-byte granule that is covered by at least one code block.
    pub code_present_mask: u64,
    /// Bit per granule written since the last block validation.
    pub dirty_mask: u64,
    /// Head of the list of blocks whose first page is this one.
    pub block_head: Option<u32>,
    /// Head of the list of blocks whose second page is this one.
    pub block_head_2: Option<u32>,
}

impl<B: Bus> Cpu<B> {
    /// Whether `phys` is backed by core-owned RAM (not handler-backed).
    #[inline]
    pub(crate) fn is_ram(&self, phys: u32) -> bool {
        (phys as usize) < self.ram.len() && self.mmio.get(&phys).is_none()
    }

    /// Terminal physical read, after paging.
    pub(crate) fn read_phys_b(&mut self, phys: u32) -> u8 {
        if self.is_ram(phys) {
            self.ram[phys as usize]
        } else {
            self.bus.mem_read_b(phys)
        }
    }

    pub(crate) fn read_phys_w(&mut self, phys: u32) -> u16 {
        u16::from(self.read_phys_b(phys)) | (u16::from(self.read_phys_b(phys.wrapping_add(1))) << 8)
    }

    pub(crate) fn read_phys_l(&mut self, phys: u32) -> u32 {
        u32::from(self.read_phys_w(phys)) | (u32::from(self.read_phys_w(phys.wrapping_add(2))) << 16)
    }

    /// Terminal physical write; marks the SMC dirty granule when the target
    /// page contains translated code.
    pub(crate) fn write_phys_b(&mut self, phys: u32, val: u8) {
        if self.is_ram(phys) {
            self.mark_dirty(phys);
            self.ram[phys as usize] = val;
        } else {
            self.bus.mem_write_b(phys, val);
        }
    }

    pub(crate) fn write_phys_w(&mut self, phys: u32, val: u16) {
        self.write_phys_b(phys, val as u8);
        self.write_phys_b(phys.wrapping_add(1), (val >> 8) as u8);
    }

    pub(crate) fn write_phys_l(&mut self, phys: u32, val: u32) {
        self.write_phys_w(phys, val as u16);
        self.write_phys_w(phys.wrapping_add(2), (val >> 16) as u16);
    }

    #[inline]
    pub(crate) fn mark_dirty(&mut self, phys: u32) {
        let page = (phys >> PAGE_SHIFT) as usize;
        if let Some(entry) = self.pages.get_mut(page) {
            let bit = 1u64 << ((phys >> GRANULE_SHIFT) & 63);
            if entry.code_present_mask & bit != 0 {
                entry.dirty_mask |= bit;
            }
        }
    }

    // --- paging ---

    /// Latches a page fault for `lin` and records CR2.
    fn page_fault(&mut self, lin: u32, err: PfErr) {
        self.cr2 = lin;
        if self.abrt.is_none() {
            self.abrt = Some(Fault::Pf(err.bits()));
        }
    }

    /// Walks the two-level page tables for `lin`. Returns the physical
    /// address, or `None` with a `#PF` latched.
    ///
    /// `cpl_override` (descriptor/TSS accesses) suppresses the user check.
    pub(crate) fn mmu_translate(&mut self, lin: u32, write: bool) -> Option<u32> {
        if self.cr0 & CR0_PG == 0 {
            return Some(lin);
        }
        let user = self.cpl() == 3 && !self.cpl_override;
        let mut err = PfErr::empty();
        if write {
            err |= PfErr::WRITE;
        }
        if user {
            err |= PfErr::USER;
        }

        let pde_addr = (self.cr3 & 0xffff_f000).wrapping_add((lin >> 22) << 2);
        let pde = self.read_phys_l(pde_addr);
        if pde & 1 == 0 {
            self.page_fault(lin, err);
            return None;
        }
        let pte_addr = (pde & 0xffff_f000).wrapping_add(((lin >> 12) & 0x3ff) << 2);
        let pte = self.read_phys_l(pte_addr);
        if pte & 1 == 0 {
            self.page_fault(lin, err);
            return None;
        }

        if user && pde & pte & 4 == 0 {
            self.page_fault(lin, err | PfErr::PRESENT);
            return None;
        }
        if write && pde & pte & 2 == 0 {
            // A 386 supervisor write ignores read-only PTEs; WP arrives
            // with the 486.
            if user || (self.is486 && self.cr0 & CR0_WP != 0) {
                self.page_fault(lin, err | PfErr::PRESENT);
                return None;
            }
        }

        // Accessed and dirty bookkeeping.
        if pde & 0x20 == 0 {
            self.write_phys_l(pde_addr, pde | 0x20);
        }
        let pte_upd = pte | 0x20 | if write { 0x40 } else { 0 };
        if pte_upd != pte {
            self.write_phys_l(pte_addr, pte_upd);
        }

        Some((pte & 0xffff_f000) | (lin & 0xfff))
    }

    // --- lookup table management ---

    #[inline]
    pub(crate) fn lookup_read(&self, lin_page: u32) -> Option<u32> {
        match self.readlookup2[lin_page as usize] {
            LOOKUP_EMPTY => None,
            page => Some(page),
        }
    }

    #[inline]
    pub(crate) fn lookup_write(&self, lin_page: u32) -> Option<u32> {
        match self.writelookup2[lin_page as usize] {
            LOOKUP_EMPTY => None,
            page => Some(page),
        }
    }

    fn add_read_lookup(&mut self, lin: u32, phys: u32) {
        if self.is_ram(phys) {
            self.readlookup2[(lin >> PAGE_SHIFT) as usize] = phys >> PAGE_SHIFT;
        }
    }

    /// Installs a write-lookup entry unless the physical page holds code;
    /// code pages stay on the slow path so writes mark dirty granules.
    fn add_write_lookup(&mut self, lin: u32, phys: u32) {
        if !self.is_ram(phys) {
            return;
        }
        let phys_page = (phys >> PAGE_SHIFT) as usize;
        if self
            .pages
            .get(phys_page)
            .map_or(false, |p| p.code_present_mask != 0)
        {
            return;
        }
        let lin_page = (lin >> PAGE_SHIFT) as usize;
        // Keep the reverse index so the entry can be evicted when this
        // physical page later gains code.
        let old = self.write_inv[phys_page];
        if old != LOOKUP_EMPTY && old != lin_page as u32 {
            self.writelookup2[old as usize] = LOOKUP_EMPTY;
        }
        self.writelookup2[lin_page] = phys_page as u32;
        self.write_inv[phys_page] = lin_page as u32;
    }

    /// Drops any write-lookup entry that resolves to physical page
    /// `phys`, forcing subsequent writes through the slow path.
    pub(crate) fn mem_flush_write_page(&mut self, phys: u32) {
        let phys_page = (phys >> PAGE_SHIFT) as usize;
        if let Some(slot) = self.write_inv.get_mut(phys_page) {
            if *slot != LOOKUP_EMPTY {
                self.writelookup2[*slot as usize] = LOOKUP_EMPTY;
                *slot = LOOKUP_EMPTY;
            }
        }
    }

    /// Invalidates both lookup tables, the reverse index and the fetch
    /// cache. Called on CR3 loads, paging mode changes, and reset.
    pub(crate) fn flush_mmu_cache(&mut self) {
        for slot in self.readlookup2.iter_mut() {
            *slot = LOOKUP_EMPTY;
        }
        for slot in self.writelookup2.iter_mut() {
            *slot = LOOKUP_EMPTY;
        }
        for slot in self.write_inv.iter_mut() {
            *slot = LOOKUP_EMPTY;
        }
        self.pccache = LOOKUP_EMPTY;
    }

    /// Invalidates the translation of a single linear page (INVLPG).
    pub(crate) fn flush_mmu_page(&mut self, lin: u32) {
        let lin_page = (lin >> PAGE_SHIFT) as usize;
        if let Some(phys_page) = self.lookup_write(lin_page as u32) {
            self.write_inv[phys_page as usize] = LOOKUP_EMPTY;
        }
        self.readlookup2[lin_page] = LOOKUP_EMPTY;
        self.writelookup2[lin_page] = LOOKUP_EMPTY;
        if self.pccache == lin_page as u32 {
            self.pccache = LOOKUP_EMPTY;
        }
    }

    // --- slow paths ---

    fn null_seg_fault(&mut self) {
        self.x86gpf(0);
    }

    fn readmemb_slow(&mut self, seg: SegBase, off: u32) -> u8 {
        if seg.is_null() {
            self.null_seg_fault();
            return 0xff;
        }
        let lin = seg.raw().wrapping_add(off);
        match self.mmu_translate(lin, false) {
            Some(phys) => {
                self.add_read_lookup(lin, phys);
                self.read_phys_b(phys)
            }
            None => 0xff,
        }
    }

    fn writememb_slow(&mut self, seg: SegBase, off: u32, val: u8) {
        if seg.is_null() {
            self.null_seg_fault();
            return;
        }
        let lin = seg.raw().wrapping_add(off);
        if let Some(phys) = self.mmu_translate(lin, true) {
            self.add_write_lookup(lin, phys);
            self.write_phys_b(phys, val);
        }
    }

    // --- public primitives (callers must check `abrt`) ---

    pub(crate) fn readmemb(&mut self, seg: SegBase, off: u32) -> u8 {
        let lin = seg.raw().wrapping_add(off);
        if !seg.is_null() {
            if let Some(page) = self.lookup_read(lin >> PAGE_SHIFT) {
                return self.ram[((page << PAGE_SHIFT) | (lin & 0xfff)) as usize];
            }
        }
        self.readmemb_slow(seg, off)
    }

    pub(crate) fn readmemw(&mut self, seg: SegBase, off: u32) -> u16 {
        let lin = seg.raw().wrapping_add(off);
        if lin & 0xfff > 0xffe {
            let lo = self.readmemb(seg, off);
            if self.abrt.is_some() {
                return 0;
            }
            let hi = self.readmemb(seg, off.wrapping_add(1));
            return u16::from(lo) | (u16::from(hi) << 8);
        }
        if !seg.is_null() {
            if let Some(page) = self.lookup_read(lin >> PAGE_SHIFT) {
                let base = ((page << PAGE_SHIFT) | (lin & 0xfff)) as usize;
                return u16::from_le_bytes([self.ram[base], self.ram[base + 1]]);
            }
            if let Some(phys) = self.mmu_translate(lin, false) {
                self.add_read_lookup(lin, phys);
                return self.read_phys_w(phys);
            }
            return 0;
        }
        self.null_seg_fault();
        0
    }

    pub(crate) fn readmeml(&mut self, seg: SegBase, off: u32) -> u32 {
        let lin = seg.raw().wrapping_add(off);
        if lin & 0xfff > 0xffc {
            let lo = self.readmemw(seg, off);
            if self.abrt.is_some() {
                return 0;
            }
            let hi = self.readmemw(seg, off.wrapping_add(2));
            return u32::from(lo) | (u32::from(hi) << 16);
        }
        if !seg.is_null() {
            if let Some(page) = self.lookup_read(lin >> PAGE_SHIFT) {
                let base = ((page << PAGE_SHIFT) | (lin & 0xfff)) as usize;
                return u32::from_le_bytes([
                    self.ram[base],
                    self.ram[base + 1],
                    self.ram[base + 2],
                    self.ram[base + 3],
                ]);
            }
            if let Some(phys) = self.mmu_translate(lin, false) {
                self.add_read_lookup(lin, phys);
                return self.read_phys_l(phys);
            }
            return 0;
        }
        self.null_seg_fault();
        0
    }

    pub(crate) fn readmemq(&mut self, seg: SegBase, off: u32) -> u64 {
        let lo = self.readmeml(seg, off);
        if self.abrt.is_some() {
            return 0;
        }
        let hi = self.readmeml(seg, off.wrapping_add(4));
        u64::from(lo) | (u64::from(hi) << 32)
    }

    pub(crate) fn writememb(&mut self, seg: SegBase, off: u32, val: u8) {
        let lin = seg.raw().wrapping_add(off);
        if !seg.is_null() {
            if let Some(page) = self.lookup_write(lin >> PAGE_SHIFT) {
                self.ram[((page << PAGE_SHIFT) | (lin & 0xfff)) as usize] = val;
                return;
            }
        }
        self.writememb_slow(seg, off, val);
    }

    pub(crate) fn writememw(&mut self, seg: SegBase, off: u32, val: u16) {
        let lin = seg.raw().wrapping_add(off);
        if lin & 0xfff > 0xffe {
            self.writememb(seg, off, val as u8);
            if self.abrt.is_some() {
                return;
            }
            self.writememb(seg, off.wrapping_add(1), (val >> 8) as u8);
            return;
        }
        if !seg.is_null() {
            if let Some(page) = self.lookup_write(lin >> PAGE_SHIFT) {
                let base = ((page << PAGE_SHIFT) | (lin & 0xfff)) as usize;
                self.ram[base..base + 2].copy_from_slice(&val.to_le_bytes());
                return;
            }
            if let Some(phys) = self.mmu_translate(lin, true) {
                self.add_write_lookup(lin, phys);
                self.write_phys_w(phys, val);
            }
            return;
        }
        self.null_seg_fault();
    }

    pub(crate) fn writememl(&mut self, seg: SegBase, off: u32, val: u32) {
        let lin = seg.raw().wrapping_add(off);
        if lin & 0xfff > 0xffc {
            self.writememw(seg, off, val as u16);
            if self.abrt.is_some() {
                return;
            }
            self.writememw(seg, off.wrapping_add(2), (val >> 16) as u16);
            return;
        }
        if !seg.is_null() {
            if let Some(page) = self.lookup_write(lin >> PAGE_SHIFT) {
                let base = ((page << PAGE_SHIFT) | (lin & 0xfff)) as usize;
                self.ram[base..base + 4].copy_from_slice(&val.to_le_bytes());
                return;
            }
            if let Some(phys) = self.mmu_translate(lin, true) {
                self.add_write_lookup(lin, phys);
                self.write_phys_l(phys, val);
            }
            return;
        }
        self.null_seg_fault();
    }

    pub(crate) fn writememq(&mut self, seg: SegBase, off: u32, val: u64) {
        self.writememl(seg, off, val as u32);
        if self.abrt.is_some() {
            return;
        }
        self.writememl(seg, off.wrapping_add(4), (val >> 32) as u32);
    }

    // --- instruction fetch ---

    /// Refreshes the fetch cache for linear address `addr`. Returns `false`
    /// when the page is not plain RAM (uncached fetch) or faulted.
    fn refresh_pccache(&mut self, addr: u32) -> bool {
        match self.mmu_translate(addr, false) {
            Some(phys) if self.is_ram(phys) => {
                self.pccache = addr >> PAGE_SHIFT;
                self.pccache_phys = phys & !0xfff;
                true
            }
            _ => {
                self.pccache = LOOKUP_EMPTY;
                false
            }
        }
    }

    pub(crate) fn fastread_b(&mut self, addr: u32) -> u8 {
        if addr >> PAGE_SHIFT == self.pccache {
            return self.ram[(self.pccache_phys | (addr & 0xfff)) as usize];
        }
        if self.refresh_pccache(addr) {
            return self.ram[(self.pccache_phys | (addr & 0xfff)) as usize];
        }
        if self.abrt.is_some() {
            return 0;
        }
        // Handler-backed code: fetch uncached.
        match self.mmu_translate(addr, false) {
            Some(phys) => self.read_phys_b(phys),
            None => 0,
        }
    }

    pub(crate) fn fastread_w(&mut self, addr: u32) -> u16 {
        if addr & 0xfff > 0xffe {
            let lo = self.fastread_b(addr);
            if self.abrt.is_some() {
                return 0;
            }
            let hi = self.fastread_b(addr.wrapping_add(1));
            return u16::from(lo) | (u16::from(hi) << 8);
        }
        if addr >> PAGE_SHIFT != self.pccache && !self.refresh_pccache(addr) {
            let lo = self.fastread_b(addr);
            if self.abrt.is_some() {
                return 0;
            }
            let hi = self.fastread_b(addr.wrapping_add(1));
            return u16::from(lo) | (u16::from(hi) << 8);
        }
        let base = (self.pccache_phys | (addr & 0xfff)) as usize;
        u16::from_le_bytes([self.ram[base], self.ram[base + 1]])
    }

    pub(crate) fn fastread_l(&mut self, addr: u32) -> u32 {
        if addr & 0xfff < 0xffd {
            if addr >> PAGE_SHIFT != self.pccache && !self.refresh_pccache(addr) {
                if self.abrt.is_some() {
                    return 0;
                }
            } else {
                let base = (self.pccache_phys | (addr & 0xfff)) as usize;
                return u32::from_le_bytes([
                    self.ram[base],
                    self.ram[base + 1],
                    self.ram[base + 2],
                    self.ram[base + 3],
                ]);
            }
        }
        let mut val = 0u32;
        for i in 0..4 {
            let byte = self.fastread_b(addr.wrapping_add(i));
            if self.abrt.is_some() {
                return 0;
            }
            val |= u32::from(byte) << (i * 8);
        }
        val
    }

    /// Fetches the next instruction byte at CS:pc.
    #[inline]
    pub(crate) fn getbyte(&mut self) -> u8 {
        self.pc = self.pc.wrapping_add(1);
        let base = self.cs_base();
        self.fastread_b(base.wrapping_add(self.pc.wrapping_sub(1)))
    }

    #[inline]
    pub(crate) fn getword(&mut self) -> u16 {
        self.pc = self.pc.wrapping_add(2);
        let base = self.cs_base();
        self.fastread_w(base.wrapping_add(self.pc.wrapping_sub(2)))
    }

    #[inline]
    pub(crate) fn getlong(&mut self) -> u32 {
        self.pc = self.pc.wrapping_add(4);
        let base = self.cs_base();
        self.fastread_l(base.wrapping_add(self.pc.wrapping_sub(4)))
    }

    pub(crate) fn getquad(&mut self) -> u64 {
        let lo = self.getlong();
        if self.abrt.is_some() {
            return 0;
        }
        let hi = self.getlong();
        u64::from(lo) | (u64::from(hi) << 32)
    }

    /// Translates `lin` for execution, latching faults (block dispatch).
    pub(crate) fn get_phys(&mut self, lin: u32) -> Option<u32> {
        self.mmu_translate(lin, false)
    }

    /// Translation that never faults (second-page probes during block
    /// validation).
    pub(crate) fn get_phys_noabrt(&mut self, lin: u32) -> Option<u32> {
        let saved = self.abrt.take();
        let saved_cr2 = self.cr2;
        let phys = self.mmu_translate(lin, false);
        self.abrt = saved;
        self.cr2 = saved_cr2;
        phys
    }
}

#[cfg(test)]
mod tests {
    use crate::cpu::tests::real_mode_cpu;
    use crate::seg::SegBase;

    #[test]
    fn slow_path_read_fills_the_lookup_table() {
        let mut cpu = real_mode_cpu();
        cpu.ram_mut()[0x2345] = 0xaa;
        assert!(cpu.lookup_read(2).is_none());
        assert_eq!(cpu.readmemb(SegBase::ZERO, 0x2345), 0xaa);
        assert_eq!(cpu.lookup_read(2), Some(2));
        // The second read takes the fast path against the same page.
        assert_eq!(cpu.readmemb(SegBase::ZERO, 0x2346), 0x00);
    }

    #[test]
    fn null_segment_forces_a_fault() {
        let mut cpu = real_mode_cpu();
        cpu.readmemb(SegBase::NULL, 0x10);
        assert!(cpu.abrt.is_some());
    }

    #[test]
    fn cross_page_word_write_decomposes() {
        let mut cpu = real_mode_cpu();
        cpu.writememw(SegBase::ZERO, 0x1fff, 0xbbaa);
        assert_eq!(cpu.ram()[0x1fff], 0xaa);
        assert_eq!(cpu.ram()[0x2000], 0xbb);
    }

    #[test]
    fn flush_clears_read_and_write_lookups() {
        let mut cpu = real_mode_cpu();
        cpu.readmemb(SegBase::ZERO, 0x5000);
        cpu.writememb(SegBase::ZERO, 0x5001, 1);
        assert!(cpu.lookup_read(5).is_some());
        assert!(cpu.lookup_write(5).is_some());
        cpu.flush_mmu_cache();
        assert!(cpu.lookup_read(5).is_none());
        assert!(cpu.lookup_write(5).is_none());
    }

    #[test]
    fn writes_to_code_pages_mark_dirty_granules() {
        let mut cpu = real_mode_cpu();
        cpu.pages[3].code_present_mask = 1 << 2; // granule 0x3080..0x30bf
        cpu.write_phys_b(0x3085, 0x90);
        assert_eq!(cpu.pages[3].dirty_mask, 1 << 2);
        // Writes outside the covered granule stay clean.
        cpu.write_phys_b(0x3000, 0x90);
        assert_eq!(cpu.pages[3].dirty_mask, 1 << 2);
    }
}
