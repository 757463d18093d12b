//! This module provides the [`Cpu`] struct: the single mutable nucleus that
//! every operation of the core works on, together with the interpreter
//! execution loop.
//!
//! One `Cpu` owns the architectural register state, the guest RAM, the
//! translation lookup tables and the code cache; the host reaches devices
//! through the [`Bus`] it supplies at construction. `Cpu` is exclusively
//! owned by its caller — nothing in the core is shared or locked.

use log::{debug, warn};
use rangemap::RangeMap;

use crate::bus::Bus;
use crate::error::Error;
use crate::flags::{LazyFlags, I_FLAG, T_FLAG};
use crate::fpu::Fpu;
use crate::interp;
use crate::jit::block::CodeCache;
use crate::mem::{PageEntry, CR0_PE, LOOKUP_EMPTY, PAGE_SHIFT};
use crate::regs::Regs;
use crate::seg::{SegBase, SegReg, Segment};

/// A latched abort: the faults that memory and segment primitives can raise
/// mid-instruction. Checked after every access; delivery happens once, at
/// the instruction boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Fault {
    /// `#GP(selector)`.
    Gp(u16),
    /// `#SS(selector)`.
    Ss(u16),
    /// `#NP(selector)`.
    Np(u16),
    /// `#PF(error code)`; the address is in CR2.
    Pf(u16),
}

/// What an opcode routine tells the dispatch loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OpOutcome {
    Continue,
    /// The instruction ended the basic block (branch, far transfer,
    /// interrupt, serializing state change).
    BlockEnd,
}

/// An opcode routine: receives the three bytes after the opcode in the low
/// bits of `fetchdat`.
pub(crate) type OpFn<B> = fn(&mut Cpu<B>, u32) -> OpOutcome;

/// A descriptor table register (GDTR/IDTR).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DescTable {
    pub base: u32,
    pub limit: u32,
}

/// A system segment register (LDTR/TR).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SysSeg {
    pub seg: u16,
    pub base: u32,
    pub limit: u32,
    pub access: u8,
}

/// Model and timing knobs, fixed at construction.
#[derive(Clone, Copy, Debug)]
pub struct CpuConfig {
    /// 486-class core: enables BSWAP/XADD/CMPXCHG/INVLPG decode, honors
    /// CR0.WP, and uses 486 string timings.
    pub is486: bool,
    /// An x87 is attached; without it every ESC opcode raises `#NM`.
    pub has_fpu: bool,
    /// `exec_dynarec` uses the code cache when caching is permitted.
    pub use_dynarec: bool,
    /// Cycles charged for INT n dispatch.
    pub timing_int: i32,
    /// Additional cycles for real-mode INT n delivery.
    pub timing_int_rm: i32,
    /// Cycles charged for a taken branch.
    pub timing_bt: i32,
    /// REP uninterruptible budget under the interpreter.
    pub rep_cycles_int: i32,
    /// REP uninterruptible budget under the dynarec.
    pub rep_cycles_dyn: i32,
}

impl Default for CpuConfig {
    fn default() -> Self {
        CpuConfig {
            is486: true,
            has_fpu: true,
            use_dynarec: true,
            timing_int: 4,
            timing_int_rm: 26,
            timing_bt: 4,
            rep_cycles_int: 100,
            rep_cycles_dyn: 1000,
        }
    }
}

/// The execution core.
pub struct Cpu<B: Bus> {
    // Architectural register state.
    pub regs: Regs,
    pub es: Segment,
    pub cs: Segment,
    pub ss: Segment,
    pub ds: Segment,
    pub fs: Segment,
    pub gs: Segment,
    /// Offset of the next instruction within CS.
    pub pc: u32,
    /// EFLAGS low word.
    pub flags: u16,
    /// EFLAGS high word (VM, RF, AC).
    pub eflags: u16,
    pub cr0: u32,
    pub cr2: u32,
    pub cr3: u32,
    pub cr4: u32,
    pub dr: [u32; 8],
    pub gdt: DescTable,
    pub idt: DescTable,
    pub ldt: SysSeg,
    pub tr: SysSeg,
    /// Time-stamp counter, advanced by consumed cycles.
    pub tsc: u64,

    // Pre-instruction state for fault restart.
    pub(crate) oldpc: u32,
    pub(crate) oldcs: u16,
    pub(crate) oldcpl: u8,

    // Lazy flag block.
    pub(crate) lazy: LazyFlags,

    // Current code segment default size: 0 or 0x300 (operand|address).
    pub(crate) use32: u16,
    pub use32_code: bool,
    pub stack32: bool,
    /// This instruction's effective size bits (prefixes toggle them).
    pub(crate) op32: u16,

    // Decoded ModR/M state for the instruction in flight.
    pub(crate) ea_seg: SegReg,
    pub(crate) ssegs: bool,
    pub(crate) easeg: SegBase,
    pub(crate) eaaddr: u32,
    pub(crate) cpu_mod: usize,
    pub(crate) cpu_reg: usize,
    pub(crate) cpu_rm: usize,
    pub(crate) eal_r: Option<u32>,
    pub(crate) eal_w: Option<u32>,

    // Pending abort.
    pub(crate) abrt: Option<Fault>,
    pub(crate) cpl_override: bool,
    pub(crate) trap: bool,
    /// Width of the most recently traversed gate (sizes error-code pushes).
    pub(crate) cgate32: bool,
    pub(crate) opcode: u8,
    pub(crate) x86_was_reset: bool,
    pub(crate) nmi_enable: bool,
    nmi_was_high: bool,

    // FPU.
    pub(crate) fpu: Fpu,

    // Memory subsystem.
    pub(crate) ram: Vec<u8>,
    pub(crate) pages: Vec<PageEntry>,
    pub(crate) readlookup2: Box<[u32]>,
    pub(crate) writelookup2: Box<[u32]>,
    pub(crate) write_inv: Box<[u32]>,
    pub(crate) mmio: RangeMap<u32, ()>,
    pub(crate) pccache: u32,
    pub(crate) pccache_phys: u32,

    // Code cache.
    pub(crate) cache: CodeCache,
    pub(crate) block_end: bool,
    pub(crate) in_dynarec: bool,

    // Cycle accounting.
    pub(crate) cycles: i32,
    pub(crate) cycles_main: i32,
    pub(crate) ins: u64,
    pub(crate) firstrepcycle: bool,

    pub(crate) is486: bool,
    pub(crate) has_fpu: bool,
    pub(crate) use_dynarec: bool,
    pub(crate) timing_int: i32,
    pub(crate) timing_int_rm: i32,
    pub(crate) timing_bt: i32,
    pub(crate) rep_cycles_int: i32,
    pub(crate) rep_cycles_dyn: i32,

    // Dispatch tables (four size variants per opcode byte).
    pub(crate) ops: Box<[OpFn<B>]>,
    pub(crate) ops_0f: Box<[OpFn<B>]>,

    pub(crate) bus: B,
}

/// Linear pages in a 32-bit address space.
const LOOKUP_ENTRIES: usize = 1 << 20;

impl<B: Bus> Cpu<B> {
    /// Creates a core with `ram_size` bytes of guest RAM (page aligned,
    /// at most 4 GiB) and the given host bus.
    pub fn new(config: CpuConfig, ram_size: u64, bus: B) -> Result<Self, Error> {
        if ram_size == 0 || ram_size & 0xfff != 0 || ram_size > 1 << 32 {
            return Err(Error::InvalidRamSize(ram_size));
        }
        let ram_pages = (ram_size >> PAGE_SHIFT) as usize;
        let mut cpu = Cpu {
            regs: Regs::default(),
            es: Segment::default(),
            cs: Segment::default(),
            ss: Segment::default(),
            ds: Segment::default(),
            fs: Segment::default(),
            gs: Segment::default(),
            pc: 0,
            flags: 0x0002,
            eflags: 0,
            cr0: 0,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            dr: [0; 8],
            gdt: DescTable::default(),
            idt: DescTable { base: 0, limit: 0x3ff },
            ldt: SysSeg::default(),
            tr: SysSeg::default(),
            tsc: 0,
            oldpc: 0,
            oldcs: 0,
            oldcpl: 0,
            lazy: LazyFlags::default(),
            use32: 0,
            use32_code: false,
            stack32: false,
            op32: 0,
            ea_seg: SegReg::Ds,
            ssegs: false,
            easeg: SegBase::ZERO,
            eaaddr: 0,
            cpu_mod: 0,
            cpu_reg: 0,
            cpu_rm: 0,
            eal_r: None,
            eal_w: None,
            abrt: None,
            cpl_override: false,
            trap: false,
            cgate32: false,
            opcode: 0,
            x86_was_reset: false,
            nmi_enable: true,
            nmi_was_high: false,
            fpu: Fpu::default(),
            ram: vec![0; ram_size as usize],
            pages: vec![PageEntry::default(); ram_pages],
            readlookup2: vec![LOOKUP_EMPTY; LOOKUP_ENTRIES].into_boxed_slice(),
            writelookup2: vec![LOOKUP_EMPTY; LOOKUP_ENTRIES].into_boxed_slice(),
            write_inv: vec![LOOKUP_EMPTY; ram_pages].into_boxed_slice(),
            mmio: RangeMap::new(),
            pccache: LOOKUP_EMPTY,
            pccache_phys: 0,
            cache: CodeCache::new(),
            block_end: false,
            in_dynarec: false,
            cycles: 0,
            cycles_main: 0,
            ins: 0,
            firstrepcycle: true,
            is486: config.is486,
            has_fpu: config.has_fpu,
            use_dynarec: config.use_dynarec,
            timing_int: config.timing_int,
            timing_int_rm: config.timing_int_rm,
            timing_bt: config.timing_bt,
            rep_cycles_int: config.rep_cycles_int,
            rep_cycles_dyn: config.rep_cycles_dyn,
            ops: interp::build_table(),
            ops_0f: interp::build_table_0f(),
            bus,
        };
        cpu.reset();
        Ok(cpu)
    }

    /// The host bus, for test harnesses and device wiring.
    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Re-arms (or masks) NMI delivery; delivering an NMI disarms it until
    /// the host-side mask port re-enables it.
    pub fn set_nmi_enable(&mut self, on: bool) {
        self.nmi_enable = on;
    }

    /// Guest RAM, for loading images.
    pub fn ram_mut(&mut self) -> &mut [u8] {
        &mut self.ram
    }

    pub fn ram(&self) -> &[u8] {
        &self.ram
    }

    /// Marks a physical range as handler-backed: accesses go to the bus and
    /// never enter the lookup tables.
    pub fn map_mmio(&mut self, range: std::ops::Range<u32>) -> Result<(), Error> {
        if range.start >= range.end {
            return Err(Error::InvalidMmioRange);
        }
        self.mmio.insert(range, ());
        self.flush_mmu_cache();
        self.invalidate_code_cache();
        Ok(())
    }

    /// Resets the core to the architectural power-on state. Guest RAM is
    /// preserved; every cache is invalidated.
    pub fn reset(&mut self) {
        self.regs = Regs::default();
        self.flags = 0x0002;
        self.eflags = 0;
        self.lazy = LazyFlags::default();
        self.cr0 = 0;
        self.cr2 = 0;
        self.cr3 = 0;
        self.cr4 = 0;
        self.dr = [0; 8];
        self.es = Segment::default();
        self.ds = Segment::default();
        self.fs = Segment::default();
        self.gs = Segment::default();
        self.ss = Segment::default();
        self.cs = Segment::default();
        self.cs.load_real(0xf000, 0x9b);
        self.pc = 0xfff0;
        self.gdt = DescTable::default();
        self.idt = DescTable { base: 0, limit: 0x3ff };
        self.ldt = SysSeg::default();
        self.tr = SysSeg::default();
        self.use32_code = false;
        self.stack32 = false;
        self.use32 = 0;
        self.op32 = 0;
        self.abrt = None;
        self.trap = false;
        self.fpu = Fpu::default();
        self.flush_mmu_cache();
        self.invalidate_code_cache();
    }

    /// Guest-initiated soft reset (triple fault path).
    pub(crate) fn softreset(&mut self) {
        self.reset();
        self.x86_was_reset = true;
    }

    // --- fault latching ---

    #[inline]
    pub(crate) fn abort(&mut self, fault: Fault) {
        if self.abrt.is_none() {
            self.abrt = Some(fault);
        }
    }

    /// Latches `#GP(err)`.
    #[inline]
    pub(crate) fn x86gpf(&mut self, err: u16) {
        self.abort(Fault::Gp(err));
    }

    // --- size helpers ---

    #[inline]
    pub(crate) fn opsize32(&self) -> bool {
        self.op32 & 0x100 != 0
    }

    #[inline]
    pub(crate) fn addr32(&self) -> bool {
        self.op32 & 0x200 != 0
    }

    pub(crate) fn update_use32(&mut self) {
        self.use32 = if self.use32_code { 0x300 } else { 0 };
    }

    // --- stack helpers ---

    /// Pushes a word; ESP is only moved once the write succeeded, so a
    /// faulting push restarts cleanly.
    pub(crate) fn push_w(&mut self, val: u16) {
        let base = self.ss.base;
        if self.stack32 {
            let esp = self.regs.l(crate::regs::SP).wrapping_sub(2);
            self.writememw(base, esp, val);
            if self.abrt.is_none() {
                self.regs.set_l(crate::regs::SP, esp);
            }
        } else {
            let sp = self.regs.w(crate::regs::SP).wrapping_sub(2);
            self.writememw(base, u32::from(sp), val);
            if self.abrt.is_none() {
                self.regs.set_w(crate::regs::SP, sp);
            }
        }
    }

    pub(crate) fn push_l(&mut self, val: u32) {
        let base = self.ss.base;
        if self.stack32 {
            let esp = self.regs.l(crate::regs::SP).wrapping_sub(4);
            self.writememl(base, esp, val);
            if self.abrt.is_none() {
                self.regs.set_l(crate::regs::SP, esp);
            }
        } else {
            let sp = self.regs.w(crate::regs::SP).wrapping_sub(4);
            self.writememl(base, u32::from(sp), val);
            if self.abrt.is_none() {
                self.regs.set_w(crate::regs::SP, sp);
            }
        }
    }

    pub(crate) fn pop_w(&mut self) -> u16 {
        let base = self.ss.base;
        if self.stack32 {
            let esp = self.regs.l(crate::regs::SP);
            let val = self.readmemw(base, esp);
            if self.abrt.is_none() {
                self.regs.set_l(crate::regs::SP, esp.wrapping_add(2));
            }
            val
        } else {
            let sp = self.regs.w(crate::regs::SP);
            let val = self.readmemw(base, u32::from(sp));
            if self.abrt.is_none() {
                self.regs.set_w(crate::regs::SP, sp.wrapping_add(2));
            }
            val
        }
    }

    pub(crate) fn pop_l(&mut self) -> u32 {
        let base = self.ss.base;
        if self.stack32 {
            let esp = self.regs.l(crate::regs::SP);
            let val = self.readmeml(base, esp);
            if self.abrt.is_none() {
                self.regs.set_l(crate::regs::SP, esp.wrapping_add(4));
            }
            val
        } else {
            let sp = self.regs.w(crate::regs::SP);
            let val = self.readmeml(base, u32::from(sp));
            if self.abrt.is_none() {
                self.regs.set_w(crate::regs::SP, sp.wrapping_add(4));
            }
            val
        }
    }

    // --- the interpreter loop ---

    /// Executes exactly one instruction plus its boundary events. Exposed
    /// for tests and debuggers.
    pub fn step(&mut self) {
        self.step_instruction();
        self.instruction_boundary();
        self.ins = self.ins.wrapping_add(1);
    }

    pub(crate) fn step_instruction(&mut self) {
        self.oldcs = self.cs.seg;
        self.oldpc = self.pc;
        self.oldcpl = self.cpl();
        self.op32 = self.use32;
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
            if out == OpOutcome::BlockEnd {
                self.block_end = true;
            }
            // Baseline cost; individual routines charge their extras.
            self.cycles -= 2;
        } else {
            self.cycles -= 2;
        }

        if !self.use32_code {
            self.pc &= 0xffff;
        }
    }

    /// Fault delivery, single-step traps and external interrupts, in the
    /// architectural priority order.
    pub(crate) fn instruction_boundary(&mut self) {
        if self.abrt.is_some() {
            self.handle_abort();
        }

        if self.trap {
            self.trap = false;
            self.lazy.rebuild(&mut self.flags);
            self.deliver_int_hw(1);
        } else if self.bus.nmi() && self.nmi_enable {
            if !self.nmi_was_high {
                self.nmi_was_high = true;
                self.oldpc = self.pc;
                self.oldcs = self.cs.seg;
                self.x86_int(2);
                self.nmi_enable = false;
            }
        } else {
            self.nmi_was_high = false;
            if self.flags & I_FLAG != 0 && self.bus.pic_int_pending() {
                let vector = self.bus.pic_interrupt();
                if vector != 0xff {
                    self.lazy.rebuild(&mut self.flags);
                    self.deliver_int_hw(vector);
                }
            }
        }
    }

    fn handle_abort(&mut self) {
        self.lazy.rebuild(&mut self.flags);
        if let Some(fault) = self.abrt.take() {
            self.x86_doabrt(fault);
            if self.abrt.take().is_some() {
                debug!("double fault at {:04x}:{:08x}", self.oldcs, self.oldpc);
                self.cs.seg = self.oldcs;
                self.pc = self.oldpc;
                self.pmodeint(8, false);
                if self.abrt.is_none() {
                    self.push_error_code(0);
                }
                if self.abrt.take().is_some() {
                    warn!("triple fault - resetting guest");
                    self.softreset();
                }
            }
        }
    }

    /// Runs the interpreter until at least `cycs` guest cycles have been
    /// consumed, yielding to the host timer wheel in ~100-cycle slices.
    /// Returns the cycles actually consumed.
    pub fn exec(&mut self, cycs: i32) -> i32 {
        let mut consumed = 0;
        self.cycles += cycs;
        while self.cycles > 0 {
            let oldcyc = self.cycles;
            self.bus.timer_start_period(self.cycles.max(0) as u32);
            let mut cycdiff = 0;
            while cycdiff < 100 {
                self.step();
                cycdiff = oldcyc - self.cycles;
            }
            self.tsc = self.tsc.wrapping_add(cycdiff as u64);
            consumed += cycdiff;
            self.bus.timer_end_period(self.cycles.max(0) as u32);
        }
        consumed
    }

    /// Whether the dynarec may cache at this moment.
    pub(crate) fn cache_on(&self) -> bool {
        self.cr0 & crate::mem::CR0_CD == 0 && self.flags & T_FLAG == 0
    }

    /// Whether protected mode is enabled (PE set, independent of V86).
    #[inline]
    pub(crate) fn protected(&self) -> bool {
        self.cr0 & CR0_PE != 0
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal bus for unit tests: open bus reads, writes dropped.
    pub(crate) struct TestBus;

    impl Bus for TestBus {
        fn mem_read_b(&mut self, _addr: u32) -> u8 {
            0xff
        }
        fn mem_write_b(&mut self, _addr: u32, _val: u8) {}
        fn io_in_b(&mut self, _port: u16) -> u8 {
            0xff
        }
        fn io_out_b(&mut self, _port: u16, _val: u8) {}
    }

    /// A 1 MiB real-mode core with CS:IP = 0000:0000.
    pub(crate) fn real_mode_cpu() -> Cpu<TestBus> {
        let mut cpu = Cpu::new(CpuConfig::default(), 0x10_0000, TestBus).unwrap();
        cpu.cs.load_real(0x0000, 0x9b);
        cpu.pc = 0;
        cpu
    }

    #[test]
    fn rejects_unaligned_ram_sizes() {
        assert!(Cpu::new(CpuConfig::default(), 0x1001, TestBus).is_err());
        assert!(Cpu::new(CpuConfig::default(), 0, TestBus).is_err());
    }

    #[test]
    fn reset_state_is_architectural() {
        let cpu = real_mode_cpu();
        assert_eq!(cpu.flags & 0x0002, 0x0002);
        assert_eq!(cpu.cr0 & CR0_PE, 0);
        assert!(!cpu.use32_code);
    }
}
