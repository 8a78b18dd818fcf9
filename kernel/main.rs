//! borealis kernel entry point
//!
//! Boot order: stash the boot info, bring up physical memory and the
//! heap, capture the kernel page-table template, install segmentation
//! and the IDT, calibrate the LAPIC timer against the PIT, mount the
//! filesystems from the boot RAM disk, queue `/bin/init`, and release
//! the other cores. The first timer fire replaces the boot context
//! with the first scheduled task.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]

extern crate alloc;

#[macro_use]
pub mod printk;

pub mod arch;
pub mod boot;
pub mod error;
pub mod fs;
pub mod mm;
pub mod syscall;
pub mod task;

use arch::x86_64::lapic::LocalApic;
use arch::x86_64::{cpu, gdt, interrupts, pic, smp};
use task::scheduler::Scheduler;

/// First user program
const INIT_PATH: &str = "/bin/init";

// Boot protocol header and the BSP's boot stack. The bootloader reads
// the header from its own section and enters `kernel_main` on the
// stack named here.
#[cfg(not(test))]
::core::arch::global_asm!(
    ".section .bss",
    ".align 16",
    "bsp_boot_stack_bottom:",
    ".skip 16384",
    "bsp_boot_stack_top:",
    ".section .stivale2hdr, \"a\"",
    ".align 8",
    ".quad kernel_main",
    ".quad bsp_boot_stack_top",
    ".quad 0",
    ".quad 0",
    ".section .text",
);

/// Kernel entry, called by the bootloader with the boot info pointer
#[unsafe(no_mangle)]
pub extern "C" fn kernel_main(boot_info: *const boot::Stivale2Struct) -> ! {
    boot::init(boot_info);
    printkln!("borealis: booting");

    mm::frame_alloc::init_from_boot();
    mm::heap::init();
    mm::paging::init_kernel_template();

    gdt::init();
    gdt::load();
    interrupts::init();
    interrupts::load();
    pic::init();
    pic::enable_irq(1);

    // One-time LAPIC timer calibration on the BSP; the other cores
    // reuse the measured base frequency
    let lapic = LocalApic::new();
    lapic.activate();
    lapic.calibrate_timer();

    let (ramdisk_begin, ramdisk_end) = boot::ramdisk().expect("no boot module with an ext2 image");
    fs::vfs::init(
        mm::higher_half(ramdisk_begin),
        ramdisk_end - ramdisk_begin,
    );

    Scheduler::create_task_from_elf(INIT_PATH, true);

    // Brings up every core (BSP included) and enables interrupts
    smp::start_cores();

    loop {
        cpu::halt();
    }
}

/// Kernel-fatal: print what broke and halt the core
#[cfg(not(test))]
#[panic_handler]
fn panic(info: &::core::panic::PanicInfo) -> ! {
    printkln!("KERNEL PANIC on core {}: {}", cpu::core_id(), info);
    cpu::halt_forever()
}
