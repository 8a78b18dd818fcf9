//! SMP bring-up
//!
//! The bootloader parks every application processor on a spin loop
//! polling its SMP-info `goto_address` field. The BSP writes a fresh
//! stack and the AP entry point into each record; the AP then runs
//! `initialize_core`, builds its per-core state and waits for the first
//! timer fire to pull it into the shared ready queue.

use crate::arch::IrqSpinlock;
use crate::arch::x86_64::{cpu, gdt, interrupts, lapic::LocalApic};
use crate::boot;
use crate::mm::{PAGE_SIZE, frame_alloc, higher_half};
use crate::task::scheduler;

/// Serializes writes to the shared TSS descriptor slot in the GDT
static TSS_INIT_LOCK: IrqSpinlock<()> = IrqSpinlock::new(());

/// Build this core's TSS and scheduler, then enable interrupts
///
/// Shared by the BSP (from `start_cores`) and every AP (as its
/// `goto_address` target).
fn bring_up_core(lapic_id: u32) {
    cpu::set_core_id(lapic_id);

    let tss = gdt::allocate_tss();
    {
        let _guard = TSS_INIT_LOCK.lock();
        let tss_ptr: *const gdt::Tss = tss;
        gdt::load_tss(unsafe { &*tss_ptr });
    }

    let lapic = LocalApic::new();
    lapic.activate();
    lapic.route_timer();

    scheduler::install_for_core(lapic, tss);

    cpu::enable_sse();
    cpu::enable_interrupts();
}

/// AP entry point, jumped to by the bootloader with the core's SMP info
/// record in the first argument register
extern "C" fn initialize_core(smp_info: *mut boot::Stivale2SmpInfo) -> ! {
    gdt::load();
    interrupts::load();

    let lapic_id = unsafe { (*smp_info).lapic_id };
    bring_up_core(lapic_id);

    loop {
        cpu::halt();
    }
}

/// Start every core
///
/// Runs on the BSP after the IDT, frame allocator and filesystems are
/// up. Hands each AP a one-page stack and the `initialize_core` target,
/// then brings the BSP itself online. Interrupts are live on return.
pub fn start_cores() {
    let Some(smp_tag) = boot::smp() else {
        // Uniprocessor handoff; bring up the BSP alone
        printkln!("SMP: no CPU table, single core");
        bring_up_core(0);
        return;
    };

    let (cpu_count, bsp_lapic_id) = unsafe { ((*smp_tag).cpu_count, (*smp_tag).bsp_lapic_id) };
    printkln!("SMP: {} cores, BSP LAPIC id {}", cpu_count, bsp_lapic_id);

    if cpu_count > 1 {
        let infos = unsafe { boot::smp_info_array(smp_tag) };
        for core_index in 0..cpu_count as usize {
            let info = unsafe { infos.add(core_index) };
            let lapic_id = unsafe { (*info).lapic_id };
            if lapic_id == bsp_lapic_id {
                continue;
            }
            if lapic_id as usize >= cpu::MAX_CPUS {
                printkln!("SMP: LAPIC id {} exceeds supported cores", lapic_id);
                continue;
            }

            let stack = higher_half(frame_alloc::request_frame()) + PAGE_SIZE;
            unsafe {
                (*info).target_stack = stack;
                // The write below releases the AP; it must come last
                ::core::ptr::write_volatile(
                    &raw mut (*info).goto_address,
                    initialize_core as *const () as u64,
                );
            }
        }
    }

    bring_up_core(bsp_lapic_id);
}
