//! This module provides the [`Bus`] trait, the complete set of host
//! callbacks the execution core consumes.
//!
//! The core owns guest RAM itself; everything else — memory above the RAM
//! ceiling, handler-backed (MMIO) ranges, port I/O, the timer wheel, the
//! interrupt controller and the NMI line — is reached through this trait.
//! All callbacks run synchronously on the execution thread.

/// Host-side collaborators of the execution core.
///
/// Port and memory callbacks may mutate device state freely; they are invoked
/// mid-instruction and must not call back into the core.
pub trait Bus {
    /// Reads a byte from a physical address that is not core-owned RAM
    /// (above the RAM ceiling, or inside a registered MMIO range).
    fn mem_read_b(&mut self, addr: u32) -> u8;
    /// Writes a byte to a physical address that is not core-owned RAM.
    fn mem_write_b(&mut self, addr: u32, val: u8);

    /// Reads a byte from an I/O port.
    fn io_in_b(&mut self, port: u16) -> u8;
    /// Reads a word from an I/O port.
    fn io_in_w(&mut self, port: u16) -> u16 {
        u16::from(self.io_in_b(port)) | (u16::from(self.io_in_b(port.wrapping_add(1))) << 8)
    }
    /// Reads a doubleword from an I/O port.
    fn io_in_l(&mut self, port: u16) -> u32 {
        u32::from(self.io_in_w(port)) | (u32::from(self.io_in_w(port.wrapping_add(2))) << 16)
    }
    /// Writes a byte to an I/O port.
    fn io_out_b(&mut self, port: u16, val: u8);
    /// Writes a word to an I/O port.
    fn io_out_w(&mut self, port: u16, val: u16) {
        self.io_out_b(port, val as u8);
        self.io_out_b(port.wrapping_add(1), (val >> 8) as u8);
    }
    /// Writes a doubleword to an I/O port.
    fn io_out_l(&mut self, port: u16, val: u32) {
        self.io_out_w(port, val as u16);
        self.io_out_w(port.wrapping_add(2), (val >> 16) as u16);
    }

    /// Called when the core begins a run slice of `cycles` guest cycles, so
    /// the host timer wheel can be armed.
    fn timer_start_period(&mut self, cycles: u32) {
        let _ = cycles;
    }
    /// Called when the core ends a run slice with `cycles` guest cycles left
    /// unconsumed.
    fn timer_end_period(&mut self, cycles: u32) {
        let _ = cycles;
    }

    /// Whether the interrupt controller has an unmasked request pending.
    /// Polled once per instruction boundary; keep it cheap.
    fn pic_int_pending(&mut self) -> bool {
        false
    }
    /// Acknowledges the highest-priority pending request and returns its
    /// vector, or `0xFF` when nothing is pending after all.
    fn pic_interrupt(&mut self) -> u8 {
        0xFF
    }
    /// State of the NMI line. The core latches delivery once per assertion.
    fn nmi(&mut self) -> bool {
        false
    }

    /// An unrecoverable internal inconsistency. Implementations should abort
    /// the emulator; guest triple faults do NOT come through here.
    fn fatal(&mut self, msg: &str) -> ! {
        panic!("{}", msg);
    }
}
