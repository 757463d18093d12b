use ex86_rs::{Bus, Cpu, CpuConfig};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] ex86_rs::Error),
}

/// A bus with no devices: open-bus reads, writes to nowhere.
struct NullBus {
    output: Vec<u8>,
}

impl Bus for NullBus {
    fn mem_read_b(&mut self, _addr: u32) -> u8 {
        0xff
    }

    fn mem_write_b(&mut self, _addr: u32, _val: u8) {}

    fn io_in_b(&mut self, _port: u16) -> u8 {
        0xff
    }

    fn io_out_b(&mut self, port: u16, val: u8) {
        // Treat port 0xE9 as a debug console, Bochs style.
        if port == 0xe9 {
            self.output.push(val);
        }
    }
}

fn main() -> Result<(), Error> {
    env_logger::init();

    // A core with 1 MiB of guest RAM.
    let mut cpu = Cpu::new(CpuConfig::default(), 1 << 20, NullBus { output: Vec::new() })?;

    // A tiny real-mode program at 0000:7C00, boot-sector style:
    //   mov si, msg
    // next:
    //   lodsb
    //   test al, al
    //   jz done
    //   out 0xE9, al
    //   jmp next
    // done:
    //   hlt
    let program: &[u8] = &[
        0xbe, 0x10, 0x7c, // mov si, 0x7c10
        0xac, // lodsb
        0x84, 0xc0, // test al, al
        0x74, 0x04, // jz +4
        0xe6, 0xe9, // out 0xE9, al
        0xeb, 0xf7, // jmp next
        0xf4, // hlt
    ];
    cpu.ram_mut()[0x7c00..0x7c00 + program.len()].copy_from_slice(program);
    cpu.ram_mut()[0x7c10..0x7c1e].copy_from_slice(b"Hello, world!\0");

    cpu.cs.load_real(0x0000, 0x9b);
    cpu.pc = 0x7c00;

    // Run a slice of guest time; the program halts long before it ends.
    cpu.exec(10_000);

    let text = String::from_utf8_lossy(&cpu.bus_mut().output).into_owned();
    println!("guest said: {}", text);

    Ok(())
}
