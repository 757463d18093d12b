//! Architectural state snapshots for save/restore.
//!
//! A snapshot captures exactly the guest-visible machine state (registers,
//! flags, segment descriptor caches, control and table registers, FPU
//! state, TSC). Caches — the lookup tables, the fetch shortcut and the code
//! cache — are derived state and are rebuilt after a restore. Guest RAM is
//! saved by the host alongside, via [`crate::Cpu::ram`].

use crate::bus::Bus;
use crate::cpu::{Cpu, DescTable, SysSeg};
use crate::error::Error;
use crate::fpu::MmxReg;
use crate::seg::Segment;

/// A complete architectural snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct CpuSnapshot {
    pub regs: [u32; 8],
    pub pc: u32,
    pub flags: u16,
    pub eflags: u16,
    pub segs: [Segment; 6],
    pub stack32: bool,
    pub use32_code: bool,
    pub cr0: u32,
    pub cr2: u32,
    pub cr3: u32,
    pub cr4: u32,
    pub dr: [u32; 8],
    pub gdt: DescTable,
    pub idt: DescTable,
    pub ldt: SysSeg,
    pub tr: SysSeg,
    pub tsc: u64,
    /// FPU state; present only when the core has an FPU.
    pub fpu: Option<FpuSnapshot>,
}

/// The FPU portion of a snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct FpuSnapshot {
    pub st: [f64; 8],
    pub st_i64: [u64; 8],
    pub mm: [u64; 8],
    pub tag: [u8; 8],
    pub top: u8,
    pub control: u16,
    pub status: u16,
    pub ismmx: bool,
}

impl<B: Bus> Cpu<B> {
    /// Captures the architectural state.
    pub fn snapshot(&mut self) -> CpuSnapshot {
        self.lazy.rebuild(&mut self.flags);
        CpuSnapshot {
            regs: self.regs.dump(),
            pc: self.pc,
            flags: self.flags,
            eflags: self.eflags,
            segs: [self.es, self.cs, self.ss, self.ds, self.fs, self.gs],
            stack32: self.stack32,
            use32_code: self.use32_code,
            cr0: self.cr0,
            cr2: self.cr2,
            cr3: self.cr3,
            cr4: self.cr4,
            dr: self.dr,
            gdt: self.gdt,
            idt: self.idt,
            ldt: self.ldt,
            tr: self.tr,
            tsc: self.tsc,
            fpu: if self.has_fpu {
                let mut mm = [0u64; 8];
                for (slot, reg) in mm.iter_mut().zip(self.fpu.mm.iter()) {
                    *slot = reg.0;
                }
                Some(FpuSnapshot {
                    st: self.fpu.st,
                    st_i64: self.fpu.st_i64,
                    mm,
                    tag: self.fpu.tag,
                    top: self.fpu.top as u8,
                    control: self.fpu.npxc,
                    status: self.fpu.npxs,
                    ismmx: self.fpu.ismmx,
                })
            } else {
                None
            },
        }
    }

    /// Restores a snapshot, invalidating every derived cache.
    pub fn restore(&mut self, snap: &CpuSnapshot) -> Result<(), Error> {
        if snap.fpu.is_some() != self.has_fpu {
            return Err(Error::SnapshotMismatch);
        }
        self.regs.load(snap.regs);
        self.pc = snap.pc;
        self.flags = snap.flags | 0x0002;
        self.eflags = snap.eflags;
        self.lazy.extract();
        self.es = snap.segs[0];
        self.cs = snap.segs[1];
        self.ss = snap.segs[2];
        self.ds = snap.segs[3];
        self.fs = snap.segs[4];
        self.gs = snap.segs[5];
        self.stack32 = snap.stack32;
        self.use32_code = snap.use32_code;
        self.update_use32();
        self.cr0 = snap.cr0;
        self.cr2 = snap.cr2;
        self.cr3 = snap.cr3;
        self.cr4 = snap.cr4;
        self.dr = snap.dr;
        self.gdt = snap.gdt;
        self.idt = snap.idt;
        self.ldt = snap.ldt;
        self.tr = snap.tr;
        self.tsc = snap.tsc;
        if let Some(fpu) = &snap.fpu {
            self.fpu.st = fpu.st;
            self.fpu.st_i64 = fpu.st_i64;
            for (reg, slot) in self.fpu.mm.iter_mut().zip(fpu.mm.iter()) {
                *reg = MmxReg(*slot);
            }
            self.fpu.tag = fpu.tag;
            self.fpu.top = usize::from(fpu.top & 7);
            self.fpu.npxc = fpu.control;
            self.fpu.npxs = fpu.status;
            self.fpu.ismmx = fpu.ismmx;
        }
        self.abrt = None;
        self.flush_mmu_cache();
        self.invalidate_code_cache();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::cpu::tests::real_mode_cpu;

    #[test]
    fn snapshot_round_trips() {
        let mut cpu = real_mode_cpu();
        cpu.regs.set_l(0, 0xdead_beef);
        cpu.pc = 0x1234;
        cpu.flags = 0x0246;
        let snap = cpu.snapshot();
        cpu.regs.set_l(0, 0);
        cpu.pc = 0;
        cpu.restore(&snap).unwrap();
        assert_eq!(cpu.regs.l(0), 0xdead_beef);
        assert_eq!(cpu.pc, 0x1234);
        let again = cpu.snapshot();
        assert_eq!(snap, again);
    }
}
