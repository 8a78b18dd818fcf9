//! Interrupt descriptor table and interrupt entry
//!
//! Every vector funnels through per-vector naked stubs into one common
//! stub that builds an `InterruptFrame` on the stack and calls
//! `isr_handler`. The frame layout is a C-ABI contract with the stub's
//! push sequence; handlers mutate it in place and `iretq` resumes
//! whatever the scheduler left there.

use ::core::cell::UnsafeCell;

use super::gdt::KERNEL_CODE_SELECTOR;
use super::{cpu, pic};
use crate::task::scheduler::Scheduler;
use crate::syscall;

/// LAPIC timer vector
pub const VECTOR_TIMER: u64 = 48;
/// Keyboard IRQ vector (PIC IRQ 1)
pub const VECTOR_KEYBOARD: u64 = 33;
/// Syscall vector, reachable from ring 3
pub const VECTOR_SYSCALL: u64 = 0x80;
/// Internal yield vector, kernel only
pub const VECTOR_YIELD: u64 = 0x81;
/// LAPIC spurious vector
pub const VECTOR_SPURIOUS: u64 = 255;

/// Saved CPU state, written by the interrupt stubs
///
/// Field order matches the push sequence in `interrupt_common` exactly;
/// do not reorder.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct InterruptFrame {
    pub es: u64,
    pub ds: u64,
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub interrupt_number: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// IDT gate descriptor
#[derive(Clone, Copy)]
#[repr(C)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    type_attributes: u8,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

impl IdtEntry {
    const MISSING: Self = Self {
        offset_low: 0,
        selector: 0,
        ist: 0,
        type_attributes: 0,
        offset_mid: 0,
        offset_high: 0,
        reserved: 0,
    };

    /// 64-bit interrupt gate at the given privilege level
    fn new(handler: u64, dpl: u8) -> Self {
        Self {
            offset_low: handler as u16,
            selector: KERNEL_CODE_SELECTOR,
            ist: 0,
            type_attributes: 0x8E | (dpl & 3) << 5,
            offset_mid: (handler >> 16) as u16,
            offset_high: (handler >> 32) as u32,
            reserved: 0,
        }
    }
}

struct Idt {
    entries: UnsafeCell<[IdtEntry; 256]>,
}

// Safety: entries are written only during single-threaded init and read
// by the CPU afterwards.
unsafe impl Sync for Idt {}

static IDT: Idt = Idt {
    entries: UnsafeCell::new([IdtEntry::MISSING; 256]),
};

fn set_gate(vector: u64, handler: unsafe extern "C" fn(), dpl: u8) {
    unsafe {
        (*IDT.entries.get())[vector as usize] = IdtEntry::new(handler as usize as u64, dpl);
    }
}

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u64,
}

/// Load the IDTR on the calling core
pub fn load() {
    let pointer = DescriptorTablePointer {
        limit: (256 * ::core::mem::size_of::<IdtEntry>() - 1) as u16,
        base: IDT.entries.get() as u64,
    };
    #[cfg(not(test))]
    unsafe {
        ::core::arch::asm!("lidt [{}]", in(reg) &pointer);
    }
    #[cfg(test)]
    {
        let _ = pointer;
    }
}

macro_rules! interrupt_stub {
    ($name:ident, $vector:expr) => {
        // CPU pushed [rip, cs, rflags, rsp, ss]; add a dummy error code
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            ::core::arch::naked_asm!(
                "push 0",
                "push {}",
                "jmp {}",
                const $vector,
                sym interrupt_common,
            );
        }
    };
}

macro_rules! interrupt_stub_err {
    ($name:ident, $vector:expr) => {
        // CPU pushed [error_code, rip, cs, rflags, rsp, ss]
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            ::core::arch::naked_asm!(
                "push {}",
                "jmp {}",
                const $vector,
                sym interrupt_common,
            );
        }
    };
}

/// Common entry: save the register file in `InterruptFrame` order, run
/// the dispatcher, restore and return
///
/// Stack on entry: [vector, error_code, rip, cs, rflags, rsp, ss].
/// The stub pushed the vector below the error code, so after the pushes
/// here the stack images an `InterruptFrame` exactly.
#[unsafe(naked)]
unsafe extern "C" fn interrupt_common() {
    ::core::arch::naked_asm!(
        // The vector sits where `interrupt_number` belongs; swap it out
        // of the way of the register pushes
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rbp",
        "push rsi",
        "push rdi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "xor eax, eax",
        "mov ax, ds",
        "push rax",
        "mov ax, es",
        "push rax",
        // Kernel data segments for the handler
        "mov ax, {kdata}",
        "mov ds, ax",
        "mov es, ax",
        "mov rdi, rsp",
        "call {handler}",
        "pop rax",
        "mov es, ax",
        "pop rax",
        "mov ds, ax",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rdi",
        "pop rsi",
        "pop rbp",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        // Drop interrupt_number and error_code
        "add rsp, 16",
        "iretq",
        kdata = const super::gdt::KERNEL_DATA_SELECTOR,
        handler = sym isr_handler,
    );
}

// Exceptions
interrupt_stub!(isr_stub_0, 0);
interrupt_stub!(isr_stub_1, 1);
interrupt_stub!(isr_stub_2, 2);
interrupt_stub!(isr_stub_3, 3);
interrupt_stub!(isr_stub_4, 4);
interrupt_stub!(isr_stub_5, 5);
interrupt_stub!(isr_stub_6, 6);
interrupt_stub!(isr_stub_7, 7);
interrupt_stub_err!(isr_stub_8, 8);
interrupt_stub!(isr_stub_9, 9);
interrupt_stub_err!(isr_stub_10, 10);
interrupt_stub_err!(isr_stub_11, 11);
interrupt_stub_err!(isr_stub_12, 12);
interrupt_stub_err!(isr_stub_13, 13);
interrupt_stub_err!(isr_stub_14, 14);
interrupt_stub!(isr_stub_16, 16);
interrupt_stub_err!(isr_stub_17, 17);
interrupt_stub!(isr_stub_18, 18);
interrupt_stub!(isr_stub_19, 19);
interrupt_stub!(isr_stub_20, 20);
interrupt_stub_err!(isr_stub_21, 21);
interrupt_stub!(isr_stub_28, 28);
interrupt_stub_err!(isr_stub_29, 29);
interrupt_stub_err!(isr_stub_30, 30);

// Legacy PIC IRQs
interrupt_stub!(isr_stub_32, 32);
interrupt_stub!(isr_stub_33, 33);
interrupt_stub!(isr_stub_34, 34);
interrupt_stub!(isr_stub_35, 35);
interrupt_stub!(isr_stub_36, 36);
interrupt_stub!(isr_stub_37, 37);
interrupt_stub!(isr_stub_38, 38);
interrupt_stub!(isr_stub_39, 39);
interrupt_stub!(isr_stub_40, 40);
interrupt_stub!(isr_stub_41, 41);
interrupt_stub!(isr_stub_42, 42);
interrupt_stub!(isr_stub_43, 43);
interrupt_stub!(isr_stub_44, 44);
interrupt_stub!(isr_stub_45, 45);
interrupt_stub!(isr_stub_46, 46);
interrupt_stub!(isr_stub_47, 47);

// LAPIC timer, syscalls, internal yield, spurious
interrupt_stub!(isr_stub_48, 48);
interrupt_stub!(isr_stub_128, 0x80);
interrupt_stub!(isr_stub_129, 0x81);
interrupt_stub!(isr_stub_255, 255);

/// Populate the IDT (done once by the BSP; all cores share it)
pub fn init() {
    set_gate(0, isr_stub_0, 0);
    set_gate(1, isr_stub_1, 0);
    set_gate(2, isr_stub_2, 0);
    set_gate(3, isr_stub_3, 0);
    set_gate(4, isr_stub_4, 0);
    set_gate(5, isr_stub_5, 0);
    set_gate(6, isr_stub_6, 0);
    set_gate(7, isr_stub_7, 0);
    set_gate(8, isr_stub_8, 0);
    set_gate(9, isr_stub_9, 0);
    set_gate(10, isr_stub_10, 0);
    set_gate(11, isr_stub_11, 0);
    set_gate(12, isr_stub_12, 0);
    set_gate(13, isr_stub_13, 0);
    set_gate(14, isr_stub_14, 0);
    set_gate(16, isr_stub_16, 0);
    set_gate(17, isr_stub_17, 0);
    set_gate(18, isr_stub_18, 0);
    set_gate(19, isr_stub_19, 0);
    set_gate(20, isr_stub_20, 0);
    set_gate(21, isr_stub_21, 0);
    set_gate(28, isr_stub_28, 0);
    set_gate(29, isr_stub_29, 0);
    set_gate(30, isr_stub_30, 0);

    set_gate(32, isr_stub_32, 0);
    set_gate(33, isr_stub_33, 0);
    set_gate(34, isr_stub_34, 0);
    set_gate(35, isr_stub_35, 0);
    set_gate(36, isr_stub_36, 0);
    set_gate(37, isr_stub_37, 0);
    set_gate(38, isr_stub_38, 0);
    set_gate(39, isr_stub_39, 0);
    set_gate(40, isr_stub_40, 0);
    set_gate(41, isr_stub_41, 0);
    set_gate(42, isr_stub_42, 0);
    set_gate(43, isr_stub_43, 0);
    set_gate(44, isr_stub_44, 0);
    set_gate(45, isr_stub_45, 0);
    set_gate(46, isr_stub_46, 0);
    set_gate(47, isr_stub_47, 0);

    set_gate(VECTOR_TIMER, isr_stub_48, 0);
    // Reachable from user mode
    set_gate(VECTOR_SYSCALL, isr_stub_128, 3);
    set_gate(VECTOR_YIELD, isr_stub_129, 0);
    set_gate(VECTOR_SPURIOUS, isr_stub_255, 0);
}

/// Read CR2 (page fault linear address)
fn read_cr2() -> u64 {
    #[cfg(not(test))]
    {
        let cr2: u64;
        unsafe {
            ::core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack));
        }
        cr2
    }
    #[cfg(test)]
    {
        0
    }
}

/// Exceptions are kernel-fatal in this revision: print the offending
/// frame and halt the core
fn exception_handler(frame: &InterruptFrame) -> ! {
    printkln!("Exception: {:#x}", frame.interrupt_number);
    printkln!("Error code: {:#x}", frame.error_code);
    printkln!("RIP: {:#x}", frame.rip);
    printkln!("RSP: {:#x}", frame.rsp);
    printkln!("Core: {}", cpu::core_id());

    if frame.interrupt_number == 0xE {
        printkln!("Page fault, CR2: {:#x}", read_cr2());
    }

    cpu::halt_forever();
}

/// Central interrupt dispatch
extern "C" fn isr_handler(frame: &mut InterruptFrame) {
    match frame.interrupt_number {
        VECTOR_TIMER => {
            let scheduler = cpu::scheduler();
            scheduler.switch_to_next_task(frame);
            scheduler.lapic.send_eoi();
        }
        VECTOR_KEYBOARD => {
            crate::fs::pty::receive_byte(super::io::inb(0x60));
            pic::send_eoi(1);
        }
        VECTOR_SYSCALL => syscall::handle(frame),
        VECTOR_YIELD => Scheduler::handle_yield(frame),
        0..=31 => exception_handler(frame),
        VECTOR_SPURIOUS => {}
        32..=47 => {
            // Stray legacy IRQ; acknowledge so the line does not wedge
            pic::send_eoi((frame.interrupt_number - 32) as u8);
        }
        vector => {
            printkln!("No ISR for interrupt {:#x}.", vector);
            cpu::halt_forever();
        }
    }
}
