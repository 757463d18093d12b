//! REP MOVSB across a page fault: the iteration state left behind by the
//! fault must let a restart complete exactly as if nothing had happened.

mod common;

use common::{descriptor, gate, load, real_mode};
use ex86_rs::regs::{CX, DI, SI, SP};

const PDE_BASE: usize = 0x8000;
const PTE_BASE: usize = 0x9000;

/// Flat 16-bit protected mode with paging: page 0 identity mapped, page 1
/// initially absent. GDT at 0x7000 (code 0x08, data 0x10), IDT at 0x7800
/// with a 16-bit interrupt gate for #PF.
fn paged_machine() -> ex86_rs::Cpu<common::TraceBus> {
    let mut cpu = real_mode(0x0500);

    let code = descriptor(0, 0xfffff, 0x9a, 0x8); // G, 16-bit
    let data = descriptor(0, 0xfffff, 0x92, 0x8);
    load(&mut cpu, 0x7000 + 8, &code);
    load(&mut cpu, 0x7000 + 16, &data);
    cpu.gdt = ex86_rs::cpu::DescTable { base: 0x7000, limit: 0x7f };

    // #PF -> 0x08:0x0700 through a 16-bit interrupt gate.
    let pf_gate = gate(0x08, 0x0700, 0x86);
    load(&mut cpu, 0x7800 + 14 * 8, &pf_gate);
    cpu.idt = ex86_rs::cpu::DescTable { base: 0x7800, limit: 0xff };
    // hlt at the fault handler so stray steps stay put.
    load(&mut cpu, 0x0700, &[0xf4]);

    // Page directory: PDE[0] -> page table; PTE[0] present, PTE[1] absent.
    load(&mut cpu, PDE_BASE, &(PTE_BASE as u32 | 0x03).to_le_bytes());
    load(&mut cpu, PTE_BASE, &0x0000_0003u32.to_le_bytes());
    load(&mut cpu, PTE_BASE + 4, &0u32.to_le_bytes());
    // Identity map the pages holding code, tables and stack (2..=9).
    for page in 2u32..16 {
        load(
            &mut cpu,
            PTE_BASE + page as usize * 4,
            &(((page << 12) | 0x03) as u32).to_le_bytes(),
        );
    }

    cpu.cr3 = PDE_BASE as u32;
    cpu.cr0 |= 0x8000_0001; // PE | PG

    cpu
}

#[test]
fn rep_movsb_faults_restartably_across_a_page() {
    let mut cpu = paged_machine();
    // rep movsb at 0x0500.
    load(&mut cpu, 0x0500, &[0xf3, 0xa4]);
    for i in 0..0x20u8 {
        cpu.ram_mut()[0x0f00 + i as usize] = i;
    }
    cpu.regs.set_w(SI, 0x0f00);
    cpu.regs.set_w(DI, 0x0ff0);
    cpu.regs.set_w(CX, 0x0020);
    cpu.regs.set_w(SP, 0x6000);
    cpu.flags &= !0x0400; // DF = 0

    cpu.step();

    // Sixteen bytes went through before the write to linear 0x1000
    // faulted; the iteration in flight was not committed.
    assert_eq!(cpu.regs.w(CX), 0x0010);
    assert_eq!(cpu.regs.w(SI), 0x0f10);
    assert_eq!(cpu.regs.w(DI), 0x1000);
    assert_eq!(cpu.cr2, 0x1000);
    // We are in the #PF handler with the REP's address on the stack.
    assert_eq!(cpu.pc, 0x0700);
    let ram = cpu.ram();
    let pushed_ip = u16::from_le_bytes([ram[0x5ffa], ram[0x5ffb]]);
    assert_eq!(pushed_ip, 0x0500);
    // Error code: present=0, write, supervisor.
    let err = u16::from_le_bytes([ram[0x5ff8], ram[0x5ff9]]);
    assert_eq!(err, 0x0002);

    // Map page 1 and re-execute the REP from the faulting address.
    load(&mut cpu, PTE_BASE + 4, &0x0000_1003u32.to_le_bytes());
    cpu.pc = 0x0500;
    cpu.step();

    assert_eq!(cpu.regs.w(CX), 0x0000);
    assert_eq!(cpu.regs.w(SI), 0x0f20);
    assert_eq!(cpu.regs.w(DI), 0x1010);
    // Every byte arrived exactly once.
    let ram = cpu.ram();
    for i in 0..0x20usize {
        assert_eq!(ram[0x0ff0 + i], i as u8, "byte {}", i);
    }
}
