//! The dynamic-recompilation execution engine.
//!
//! Blocks are call-threaded: a block is marked on first dispatch, recorded
//! on the second (a list of validated instruction starts), and replayed
//! afterwards straight through the interpreter's opcode routines, skipping
//! hash lookups and block bookkeeping per instruction. Replay is only legal
//! while the backing bytes are unchanged, which the page dirty masks
//! guarantee; everything observable is therefore identical to pure
//! interpretation.

pub(crate) mod block;

use crate::bus::Bus;
use crate::cpu::Cpu;
use crate::flags::{I_FLAG, T_FLAG};
use crate::mem::PAGE_SHIFT;
use crate::seg::SegReg;

/// A block never spans more than two pages: cap the source length.
const MAX_BLOCK_BYTES: u32 = 4000;

impl<B: Bus> Cpu<B> {
    /// Runs until at least `cycs` cycles are consumed, using the code cache
    /// whenever caching is permitted.
    pub fn exec_dynarec(&mut self, cycs: i32) -> i32 {
        if !self.use_dynarec {
            return self.exec(cycs);
        }
        let mut consumed = 0;
        self.cycles_main += cycs;
        while self.cycles_main > 0 {
            self.cycles += 1000;
            let cycles_start = self.cycles;
            self.bus.timer_start_period(self.cycles.max(0) as u32);
            self.in_dynarec = true;
            while self.cycles > 0 {
                self.dispatch_block();
            }
            self.in_dynarec = false;
            self.bus.timer_end_period(self.cycles.max(0) as u32);
            let used = cycles_start - self.cycles;
            self.tsc = self.tsc.wrapping_add(used.max(0) as u64);
            self.cycles_main -= used;
            consumed += used;
        }
        consumed
    }

    /// One block's worth of execution plus the boundary events.
    fn dispatch_block(&mut self) {
        self.oldcs = self.cs.seg;
        self.oldpc = self.pc;
        self.oldcpl = self.cpl();
        self.op32 = self.use32;

        if !self.cache_on() {
            self.interpret_block();
        } else {
            self.cached_block();
        }

        if self.abrt.is_some() {
            self.dyn_handle_abort();
        }

        if self.trap {
            self.trap = false;
            self.lazy.rebuild(&mut self.flags);
            self.deliver_int_hw(1);
        } else if self.flags & I_FLAG != 0 && self.bus.pic_int_pending() {
            let vector = self.bus.pic_interrupt();
            if vector != 0xff {
                self.lazy.rebuild(&mut self.flags);
                self.deliver_int_hw(vector);
            }
        }
    }

    fn dyn_handle_abort(&mut self) {
        self.lazy.rebuild(&mut self.flags);
        if let Some(fault) = self.abrt.take() {
            self.x86_doabrt(fault);
            if self.abrt.take().is_some() {
                log::debug!("double fault at {:04x}:{:08x}", self.oldcs, self.oldpc);
                self.cs.seg = self.oldcs;
                self.pc = self.oldpc;
                self.pmodeint(8, false);
                if self.abrt.is_none() {
                    self.push_error_code(0);
                }
                if self.abrt.take().is_some() {
                    log::warn!("triple fault - resetting guest");
                    self.softreset();
                }
            }
        }
    }

    /// Caching is off (CR0.CD or TF): interpret until a natural block end.
    fn interpret_block(&mut self) {
        self.block_end = false;
        while !self.block_end {
            self.oldcs = self.cs.seg;
            self.oldpc = self.pc;
            self.oldcpl = self.cpl();
            self.op32 = self.use32;
            self.run_one();
            let fetch_page = self.cs_base().wrapping_add(self.pc) >> PAGE_SHIFT;
            if fetch_page != self.pccache {
                self.block_end = true;
            }
            if self.abrt.is_some() || self.trap {
                self.block_end = true;
            }
            self.ins = self.ins.wrapping_add(1);
        }
    }

    /// One instruction body shared by every dynarec path (no boundary
    /// events).
    fn run_one(&mut self) {
        self.ea_seg = SegReg::Ds;
        self.ssegs = false;
        let base = self.cs_base();
        let fetchdat = self.fastread_l(base.wrapping_add(self.pc));
        if self.abrt.is_none() {
            self.trap = self.flags & T_FLAG != 0;
            let opcode = (fetchdat & 0xff) as usize;
            self.opcode = opcode as u8;
            self.pc = self.pc.wrapping_add(1);
            let f = self.ops[(opcode | usize::from(self.op32)) & 0x3ff];
            let out = f(self, fetchdat >> 8);
            if out == crate::cpu::OpOutcome::BlockEnd {
                self.block_end = true;
            }
            self.cycles -= 2;
        } else {
            self.cycles -= 2;
        }
        if !self.use32_code {
            self.pc &= 0xffff;
        }
    }

    /// Caching is on: validate or build the block at CS:pc.
    fn cached_block(&mut self) {
        self.trap = false;
        let lin = self.cs_base().wrapping_add(self.pc);
        let phys = match self.get_phys(lin) {
            Some(p) => p,
            None => return, // fault latched; boundary delivers it
        };

        let mut block_idx = self.cache.lookup(phys);
        let mut valid = false;
        if let Some(idx) = block_idx {
            valid = self.block_matches(idx, lin, phys);
            if !valid {
                // The hash slot holds a different alias; the page list may
                // still hold ours.
                let gran = 1u64 << ((phys >> crate::mem::GRANULE_SHIFT) & 63);
                let page_index = (phys >> PAGE_SHIFT) as usize;
                let code_here = self
                    .pages
                    .get(page_index)
                    .map_or(false, |p| p.code_present_mask & gran != 0);
                if code_here {
                    if let Some(found) = self.find_block_on_page(phys) {
                        if self.block_matches(found, lin, phys) {
                            block_idx = Some(found);
                            valid = true;
                        }
                    }
                }
            }
        }

        // Self-modified backing invalidates before reuse.
        if valid {
            let idx = block_idx.unwrap();
            let page_index = (phys >> PAGE_SHIFT) as usize;
            let dirty = self.pages.get(page_index).map_or(0, |p| p.dirty_mask);
            if self.cache.blocks[idx as usize].page_mask & dirty != 0 {
                self.check_flush(page_index, dirty);
                if let Some(page) = self.pages.get_mut(page_index) {
                    page.dirty_mask = 0;
                }
                if !self.cache.blocks[idx as usize].live {
                    valid = false;
                }
            }
        }
        if valid {
            let idx = block_idx.unwrap();
            if self.cache.blocks[idx as usize].page_mask2 != 0 {
                // The second page must still be the same frame and clean.
                // A missing translation here falls back to interpretation
                // so a boundary fault is raised where it belongs.
                let endpc = self.cache.blocks[idx as usize].endpc;
                match self.get_phys_noabrt(endpc) {
                    Some(phys_2) => {
                        let phys_2 = phys_2 & !0xfff;
                        if phys_2 != self.cache.blocks[idx as usize].phys_2 {
                            valid = false;
                        } else {
                            let page2_index = (phys_2 >> PAGE_SHIFT) as usize;
                            let dirty = self.pages.get(page2_index).map_or(0, |p| p.dirty_mask);
                            if self.cache.blocks[idx as usize].page_mask2 & dirty != 0 {
                                self.check_flush(page2_index, dirty);
                                if let Some(page) = self.pages.get_mut(page2_index) {
                                    page.dirty_mask = 0;
                                }
                                if !self.cache.blocks[idx as usize].live {
                                    valid = false;
                                }
                            }
                        }
                    }
                    None => valid = false,
                }
            }
        }

        match block_idx {
            Some(idx) if valid && self.cache.blocks[idx as usize].was_recompiled => {
                self.cache.set_hash(phys, idx);
                self.replay_block(idx);
            }
            Some(idx) if valid => {
                self.record_block(idx);
            }
            _ => {
                // First sighting: mark the block without recording.
                let idx = self.block_init(phys);
                self.mark_block(idx);
            }
        }
    }

    fn block_matches(&self, idx: u32, lin: u32, phys: u32) -> bool {
        let block = &self.cache.blocks[idx as usize];
        block.live
            && block.pc == lin
            && block.cs_base == self.cs_base()
            && block.use32 == self.use32
            && block.stack32 == self.stack32
            && block.phys == phys
    }

    /// First pass: execute and find the block extent.
    fn mark_block(&mut self, idx: u32) {
        let start_pc = self.pc;
        self.block_end = false;
        self.x86_was_reset = false;
        let mut endpc = self.cache.blocks[idx as usize].pc;
        while !self.block_end {
            self.oldcs = self.cs.seg;
            self.oldpc = self.pc;
            self.oldcpl = self.cpl();
            self.op32 = self.use32;
            // Extent is captured before execution so branch targets don't
            // leak into the mask; the margin covers the instruction bytes.
            endpc = self.cs_base().wrapping_add(self.pc).wrapping_add(8);
            self.run_one();
            if self.x86_was_reset {
                break;
            }
            if self.pc.wrapping_sub(start_pc) > MAX_BLOCK_BYTES {
                self.block_end = true;
            }
            if self.trap || self.abrt.is_some() {
                self.block_end = true;
            }
            self.ins = self.ins.wrapping_add(1);
        }
        if self.abrt.is_some() {
            self.delete_block(idx);
            return;
        }
        if self.x86_was_reset {
            self.invalidate_code_cache();
            return;
        }
        self.cache.blocks[idx as usize].endpc = endpc;
        self.block_finalize(idx);
    }

    /// Second pass: execute again, recording instruction starts.
    fn record_block(&mut self, idx: u32) {
        let start_pc = self.pc;
        self.block_end = false;
        self.x86_was_reset = false;
        let mut insns: Vec<u32> = Vec::new();
        while !self.block_end {
            self.oldcs = self.cs.seg;
            self.oldpc = self.pc;
            self.oldcpl = self.cpl();
            self.op32 = self.use32;
            insns.push(self.pc);
            self.run_one();
            if self.x86_was_reset {
                break;
            }
            if self.pc.wrapping_sub(start_pc) > MAX_BLOCK_BYTES {
                self.block_end = true;
            }
            if self.trap || self.abrt.is_some() {
                self.block_end = true;
            }
            self.ins = self.ins.wrapping_add(1);
        }
        if self.abrt.is_some() {
            self.delete_block(idx);
            return;
        }
        if self.x86_was_reset {
            self.invalidate_code_cache();
            return;
        }
        let block = &mut self.cache.blocks[idx as usize];
        block.insns = insns;
        block.was_recompiled = true;
    }

    /// Replays a validated recording through the interpreter routines.
    fn replay_block(&mut self, idx: u32) {
        let count = self.cache.blocks[idx as usize].insns.len();
        for i in 0..count {
            let expect = self.cache.blocks[idx as usize].insns[i];
            if self.pc != expect {
                // A conditional inside the block went the other way this
                // time.
                break;
            }
            self.oldcs = self.cs.seg;
            self.oldpc = self.pc;
            self.oldcpl = self.cpl();
            self.op32 = self.use32;
            self.block_end = false;
            self.run_one();
            self.ins = self.ins.wrapping_add(1);
            if self.abrt.is_some() || self.trap || self.x86_was_reset {
                break;
            }
        }
    }
}
