//! Tasks
//!
//! A task owns its saved interrupt frame, its address space, its file
//! descriptor table, its userspace allocator and a three-page kernel
//! syscall stack. Tasks move between the shared ready queue and each
//! core's current-task slot as values; everything they own moves with
//! them.

pub mod elf;
pub mod scheduler;

use ::core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::x86_64::gdt::{
    KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR, USER_CODE_SELECTOR, USER_DATA_SELECTOR,
};
use crate::arch::x86_64::interrupts::InterruptFrame;
use crate::fs::vfs::FdTable;
use crate::mm::paging::AddressSpace;
use crate::mm::user_alloc::UserspaceAllocator;
use crate::mm::{PAGE_SIZE, frame_alloc, higher_half};

/// Process identifier; 0 is reserved for the per-core idle task
pub type Pid = u64;

/// Pages in each task's kernel syscall stack
pub const SYSCALL_STACK_PAGE_COUNT: u64 = 3;

/// RFLAGS for fresh tasks: interrupts enabled + mandatory reserved bit
const INITIAL_RFLAGS: u64 = 0x202;

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Runnable (or running)
    Normal,
    /// Off the ready rotation until unblocked
    Blocked,
    /// Blocked specifically on child exit
    WaitingForChild,
    /// Exited; dropped at the next switch
    Terminated,
}

pub struct Task {
    pub pid: Pid,
    pub state: TaskState,
    pub frame: InterruptFrame,
    pub paging: AddressSpace,
    pub fds: FdTable,
    pub user_alloc: UserspaceAllocator,
    /// Top of the syscall stack (loaded into the TSS on every switch)
    pub syscall_stack_top: u64,
    pub syscall_stack_bottom: u64,
    pub parent: Option<Pid>,
}

/// Monotonically increasing pid source, shared by all cores
static NEXT_PID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh pid
pub fn allocate_pid() -> Pid {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

/// Build a task around an entry point and stack
///
/// `set_pid = false` leaves the pid at the reserved idle value 0.
pub fn create_task(
    paging: AddressSpace,
    fds: FdTable,
    user_alloc: UserspaceAllocator,
    entry: u64,
    stack_ptr: u64,
    user_task: bool,
    set_pid: bool,
) -> Task {
    let mut frame = InterruptFrame::default();
    frame.cs = if user_task {
        USER_CODE_SELECTOR as u64
    } else {
        KERNEL_CODE_SELECTOR as u64
    };
    let data = if user_task {
        USER_DATA_SELECTOR as u64
    } else {
        KERNEL_DATA_SELECTOR as u64
    };
    frame.ds = data;
    frame.es = data;
    frame.ss = data;
    frame.rflags = INITIAL_RFLAGS;
    frame.rip = entry;
    frame.rsp = stack_ptr;

    let stack_size = SYSCALL_STACK_PAGE_COUNT * PAGE_SIZE;
    let stack_phys = frame_alloc::request_frames(SYSCALL_STACK_PAGE_COUNT as usize);
    let syscall_stack_top = higher_half(stack_phys) + stack_size;

    Task {
        pid: if set_pid { allocate_pid() } else { 0 },
        state: TaskState::Normal,
        frame,
        paging,
        fds,
        user_alloc,
        syscall_stack_top,
        syscall_stack_bottom: syscall_stack_top - stack_size,
        parent: None,
    }
}
