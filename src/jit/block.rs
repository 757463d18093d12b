//! The code-block cache: a fixed arena of blocks keyed by physical
//! address, an open-addressed one-entry-per-bucket hash, and doubly linked
//! per-page lists (by index, not pointer) used for self-modifying-code
//! invalidation.
//!
//! A block lives in the list of its first page and, when it straddles a
//! page boundary, in a second list on the other page. Deleting a block is
//! a pure index splice; the arena slot is reused when the ring allocator
//! comes back around.

use log::trace;

use crate::bus::Bus;
use crate::cpu::Cpu;
use crate::mem::{GRANULE_SHIFT, PAGE_SHIFT};

/// Arena slots. Eviction is ring order, which approximates LRU by creation
/// time.
const BLOCK_SLOTS: usize = 2048;
/// One-slot hash buckets.
const HASH_SIZE: usize = 8192;

#[inline]
fn hash(phys: u32) -> usize {
    ((phys >> 2) as usize ^ (phys >> PAGE_SHIFT) as usize) & (HASH_SIZE - 1)
}

/// One translated (call-threaded) block.
#[derive(Clone, Debug, Default)]
pub(crate) struct CodeBlock {
    pub live: bool,
    /// Linear address of the first instruction.
    pub pc: u32,
    pub cs_base: u32,
    pub use32: u16,
    pub stack32: bool,
    pub phys: u32,
    pub phys_2: u32,
    /// Linear address one past the last byte.
    pub endpc: u32,
    /// Granule cover on the first page.
    pub page_mask: u64,
    /// Granule cover on the second page (zero when not crossing).
    pub page_mask2: u64,
    pub was_recompiled: bool,
    /// Recorded instruction start offsets (CS-relative).
    pub insns: Vec<u32>,
    // Page list links, by arena index.
    pub next: Option<u32>,
    pub prev: Option<u32>,
    pub next_2: Option<u32>,
    pub prev_2: Option<u32>,
}

pub(crate) struct CodeCache {
    pub(crate) blocks: Vec<CodeBlock>,
    pub(crate) hash: Vec<Option<u32>>,
    block_current: usize,
}

impl CodeCache {
    pub(crate) fn new() -> Self {
        CodeCache {
            blocks: vec![CodeBlock::default(); BLOCK_SLOTS],
            hash: vec![None; HASH_SIZE],
            block_current: 0,
        }
    }

    pub(crate) fn lookup(&self, phys: u32) -> Option<u32> {
        self.hash[hash(phys)]
    }

    pub(crate) fn set_hash(&mut self, phys: u32, idx: u32) {
        self.hash[hash(phys)] = Some(idx);
    }
}

impl<B: Bus> Cpu<B> {
    /// Drops every block and all page code tracking (reset, mode change,
    /// MMIO remap).
    pub(crate) fn invalidate_code_cache(&mut self) {
        for block in self.cache.blocks.iter_mut() {
            block.live = false;
            block.was_recompiled = false;
            block.insns.clear();
            block.next = None;
            block.prev = None;
            block.next_2 = None;
            block.prev_2 = None;
        }
        for slot in self.cache.hash.iter_mut() {
            *slot = None;
        }
        for page in self.pages.iter_mut() {
            page.code_present_mask = 0;
            page.dirty_mask = 0;
            page.block_head = None;
            page.block_head_2 = None;
        }
        self.pccache = crate::mem::LOOKUP_EMPTY;
    }

    /// Allocates (recycling if needed) a block for `phys` at the current
    /// CS:pc and hashes it.
    pub(crate) fn block_init(&mut self, phys: u32) -> u32 {
        self.cache.block_current = (self.cache.block_current + 1) & (BLOCK_SLOTS - 1);
        let idx = self.cache.block_current as u32;
        if self.cache.blocks[idx as usize].live {
            self.delete_block(idx);
        }
        let cs_base = self.cs_base();
        let use32 = self.use32;
        let stack32 = self.stack32;
        let pc = cs_base.wrapping_add(self.pc);
        {
            let block = &mut self.cache.blocks[idx as usize];
            block.live = true;
            block.pc = pc;
            block.cs_base = cs_base;
            block.use32 = use32;
            block.stack32 = stack32;
            block.phys = phys;
            block.phys_2 = 0;
            block.endpc = pc;
            block.page_mask = 0;
            block.page_mask2 = 0;
            block.was_recompiled = false;
            block.insns.clear();
            block.next = None;
            block.prev = None;
            block.next_2 = None;
            block.prev_2 = None;
        }
        self.cache.set_hash(phys, idx);
        idx
    }

    /// Computes the granule masks from the final extent and links the block
    /// onto its page list(s).
    pub(crate) fn block_finalize(&mut self, idx: u32) {
        let (pc, endpc, phys) = {
            let block = &self.cache.blocks[idx as usize];
            (block.pc, block.endpc, block.phys)
        };

        let mut mask = 0u64;
        let start = (pc & 0xfff) >> GRANULE_SHIFT;
        let mut end = (endpc & 0xfff) >> GRANULE_SHIFT;
        if (pc ^ endpc) & !0xfff != 0 {
            // Crosses into the next page: the first page is covered to its
            // end.
            end = 63;
        }
        for g in start..=end {
            mask |= 1u64 << g;
        }
        self.cache.blocks[idx as usize].page_mask = mask;
        let page_index = (phys >> PAGE_SHIFT) as usize;
        if let Some(page) = self.pages.get_mut(page_index) {
            page.code_present_mask |= mask;
        }
        // Writes to this page must take the slow path from now on.
        self.mem_flush_write_page(phys);

        // Second page, when the block crosses.
        if (pc ^ endpc) & !0xfff != 0 {
            if let Some(phys_2) = self.get_phys_noabrt(endpc) {
                let mut mask2 = 0u64;
                for g in 0..=((endpc & 0xfff) >> GRANULE_SHIFT) {
                    mask2 |= 1u64 << g;
                }
                let block = &mut self.cache.blocks[idx as usize];
                block.phys_2 = phys_2 & !0xfff;
                block.page_mask2 = mask2;
                let page2_index = (phys_2 >> PAGE_SHIFT) as usize;
                if let Some(page) = self.pages.get_mut(page2_index) {
                    page.code_present_mask |= mask2;
                }
                self.mem_flush_write_page(phys_2);
            }
        }

        self.add_to_block_list(idx);
    }

    fn add_to_block_list(&mut self, idx: u32) {
        let (phys, phys_2, has_mask2) = {
            let block = &self.cache.blocks[idx as usize];
            if block.page_mask == 0 {
                self.bus.fatal("add_to_block_list - mask = 0");
            }
            (block.phys, block.phys_2, block.page_mask2 != 0)
        };
        let page_index = (phys >> PAGE_SHIFT) as usize;
        if page_index < self.pages.len() {
            let head = self.pages[page_index].block_head;
            self.cache.blocks[idx as usize].next = head;
            self.cache.blocks[idx as usize].prev = None;
            if let Some(h) = head {
                self.cache.blocks[h as usize].prev = Some(idx);
            }
            self.pages[page_index].block_head = Some(idx);
        }
        if has_mask2 {
            let page2_index = (phys_2 >> PAGE_SHIFT) as usize;
            if page2_index < self.pages.len() {
                let head = self.pages[page2_index].block_head_2;
                self.cache.blocks[idx as usize].next_2 = head;
                self.cache.blocks[idx as usize].prev_2 = None;
                if let Some(h) = head {
                    self.cache.blocks[h as usize].prev_2 = Some(idx);
                }
                self.pages[page2_index].block_head_2 = Some(idx);
            }
        }
    }

    fn remove_from_block_list(&mut self, idx: u32) {
        let (phys, phys_2, prev, next, prev_2, next_2, has_mask, has_mask2) = {
            let block = &self.cache.blocks[idx as usize];
            (
                block.phys,
                block.phys_2,
                block.prev,
                block.next,
                block.prev_2,
                block.next_2,
                block.page_mask != 0,
                block.page_mask2 != 0,
            )
        };
        if has_mask {
            match prev {
                Some(p) => self.cache.blocks[p as usize].next = next,
                None => {
                    let page_index = (phys >> PAGE_SHIFT) as usize;
                    if page_index < self.pages.len() {
                        self.pages[page_index].block_head = next;
                    }
                }
            }
            if let Some(n) = next {
                self.cache.blocks[n as usize].prev = prev;
            }
        }
        if has_mask2 {
            match prev_2 {
                Some(p) => self.cache.blocks[p as usize].next_2 = next_2,
                None => {
                    let page2_index = (phys_2 >> PAGE_SHIFT) as usize;
                    if page2_index < self.pages.len() {
                        self.pages[page2_index].block_head_2 = next_2;
                    }
                }
            }
            if let Some(n) = next_2 {
                self.cache.blocks[n as usize].prev_2 = prev_2;
            }
        }
        let block = &mut self.cache.blocks[idx as usize];
        block.next = None;
        block.prev = None;
        block.next_2 = None;
        block.prev_2 = None;
    }

    /// Unlinks and kills a block.
    pub(crate) fn delete_block(&mut self, idx: u32) {
        let phys = self.cache.blocks[idx as usize].phys;
        if self.cache.lookup(phys) == Some(idx) {
            self.cache.hash[hash(phys)] = None;
        }
        self.remove_from_block_list(idx);
        let block = &mut self.cache.blocks[idx as usize];
        block.live = false;
        block.was_recompiled = false;
        block.insns.clear();
    }

    /// Deletes every block on `page_index` whose granule cover intersects
    /// `mask` (SMC invalidation after dirty writes).
    pub(crate) fn check_flush(&mut self, page_index: usize, mask: u64) {
        let mut cursor = self.pages.get(page_index).and_then(|p| p.block_head);
        while let Some(idx) = cursor {
            cursor = self.cache.blocks[idx as usize].next;
            if self.cache.blocks[idx as usize].page_mask & mask != 0 {
                trace!("SMC flush of block {:#x}", self.cache.blocks[idx as usize].pc);
                self.delete_block(idx);
            }
        }
        let mut cursor = self.pages.get(page_index).and_then(|p| p.block_head_2);
        while let Some(idx) = cursor {
            cursor = self.cache.blocks[idx as usize].next_2;
            if self.cache.blocks[idx as usize].page_mask2 & mask != 0 {
                self.delete_block(idx);
            }
        }
    }

    /// Walks the page list for a block whose physical start matches (the
    /// virtual-alias lookup when the hash entry missed).
    pub(crate) fn find_block_on_page(&self, phys: u32) -> Option<u32> {
        let page_index = (phys >> PAGE_SHIFT) as usize;
        let mut cursor = self.pages.get(page_index).and_then(|p| p.block_head);
        while let Some(idx) = cursor {
            let block = &self.cache.blocks[idx as usize];
            if block.live && block.phys == phys {
                return Some(idx);
            }
            cursor = block.next;
        }
        None
    }
}
