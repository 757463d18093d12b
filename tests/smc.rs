//! Self-modifying code under the dynarec: a guest store into a page with
//! translated blocks must invalidate them before the next dispatch.

mod common;

use common::{load, real_mode};
use ex86_rs::regs::AX;

#[test]
fn store_into_translated_block_invalidates_it() {
    let mut cpu = real_mode(0x0200);
    // Call the routine at 0x1000 twice (mark, then record), patch its
    // immediate, call a third time.
    load(
        &mut cpu,
        0x0200,
        &[
            0xe8, 0xfd, 0x0d, // call 0x1000
            0xe8, 0xfa, 0x0d, // call 0x1000
            0xc6, 0x06, 0x01, 0x10, 0x02, // mov byte [0x1001], 2
            0xe8, 0xf2, 0x0d, // call 0x1000
            0xf4, // hlt
        ],
    );
    // mov ax, 1 ; ret
    load(&mut cpu, 0x1000, &[0xb8, 0x01, 0x00, 0xc3]);

    cpu.exec_dynarec(3000);

    // The final call executed the patched bytes, not the stale block.
    assert_eq!(cpu.regs.w(AX), 2);
    assert_eq!(cpu.pc, 0x020e, "halted at the end of the driver");
}

#[test]
fn interpreter_and_dynarec_agree_on_the_same_program() {
    let program: &[u8] = &[
        0xb8, 0x34, 0x12, // mov ax, 0x1234
        0x05, 0x11, 0x11, // add ax, 0x1111
        0xbb, 0x02, 0x00, // mov bx, 2
        0xf7, 0xe3, // mul bx
        0xe6, 0x80, // out 0x80, al
        0xf4, // hlt
    ];
    let mut a = real_mode(0x0300);
    load(&mut a, 0x0300, program);
    a.exec(2000);

    let mut b = real_mode(0x0300);
    load(&mut b, 0x0300, program);
    b.exec_dynarec(2000);

    assert_eq!(a.regs.dump(), b.regs.dump());
    assert_eq!(a.pc, b.pc);
    assert_eq!(a.bus_mut().trace, b.bus_mut().trace);
}
