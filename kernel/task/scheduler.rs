//! Preemptive round-robin scheduler
//!
//! One process-wide ready queue guarded by an interrupt-disabling spin
//! lock; one scheduler instance per core holding the current task, the
//! per-core idle task and the core's pending timer entries. Every LAPIC
//! timer fire (and every internal `0x81` yield) lands in
//! `switch_to_next_task`, which rotates the queue and reprograms the
//! timer for the closest pending deadline.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::arch::IrqSpinlock;
use crate::arch::x86_64::gdt::Tss;
use crate::arch::x86_64::interrupts::InterruptFrame;
use crate::arch::x86_64::lapic::LocalApic;
use crate::arch::x86_64::cpu;
use crate::fs::vfs::{self, FdTable, OpenFlags};
use crate::mm::paging::AddressSpace;
use crate::mm::user_alloc::UserspaceAllocator;
use crate::mm::{PAGE_SIZE, frame_alloc, higher_half};
use crate::task::{self, Pid, SYSCALL_STACK_PAGE_COUNT, Task, elf};

pub use crate::task::TaskState;

/// Ceiling on the time between timer fires
const TIMER_CLAMP_MS: u64 = 100;

/// A pending per-core deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEntry {
    pub milliseconds: u64,
    pub unblock_on_expire: bool,
    pub pid: Pid,
}

/// The shared ready queue; every task not currently on a core lives here
static TASK_QUEUE: IrqSpinlock<Vec<Task>> = IrqSpinlock::new(Vec::new());

/// Subtract elapsed time from every entry, removing the expired ones
///
/// Returns the pids whose expiry should unblock them.
fn expire_timer_entries(entries: &mut Vec<TimerEntry>, elapsed_ms: u64) -> Vec<Pid> {
    let mut expired = Vec::new();
    let mut index = entries.len();
    while index > 0 {
        index -= 1;
        if entries[index].milliseconds <= elapsed_ms {
            let entry = entries.remove(index);
            if entry.unblock_on_expire {
                assert!(entry.pid != 0, "idle task in the timer queue");
                expired.push(entry.pid);
            }
        } else {
            entries[index].milliseconds -= elapsed_ms;
        }
    }
    expired
}

/// Closest pending deadline, clamped to the tick ceiling
fn closest_expiry_ms(entries: &[TimerEntry]) -> u64 {
    entries
        .iter()
        .map(|entry| entry.milliseconds)
        .fold(TIMER_CLAMP_MS, u64::min)
}

/// Per-core scheduler
pub struct Scheduler {
    pub lapic: LocalApic,
    tss: &'static mut Tss,
    idle_task: Task,
    current_task: Option<Task>,
    /// Whether the interrupted frame belongs to a task worth saving
    restore_frame: bool,
    timer_entries: Vec<TimerEntry>,
    /// Interval the LAPIC timer was last programmed with
    current_timer_ms: u64,
}

/// Endless halt; runs whenever a core has nothing else
extern "C" fn idle_loop() -> ! {
    loop {
        cpu::halt();
    }
}

impl Scheduler {
    /// Build a core's scheduler together with its idle task (pid 0)
    pub fn new(lapic: LocalApic, tss: &'static mut Tss) -> Self {
        let idle_stack = higher_half(frame_alloc::request_frame()) + PAGE_SIZE;
        let idle_task = task::create_task(
            AddressSpace::new(),
            FdTable::new(),
            UserspaceAllocator::new(),
            idle_loop as *const () as u64,
            idle_stack,
            false,
            false,
        );

        Self {
            lapic,
            tss,
            idle_task,
            current_task: None,
            restore_frame: false,
            timer_entries: Vec::new(),
            current_timer_ms: TIMER_CLAMP_MS,
        }
    }

    /// This core's scheduler
    pub fn current() -> &'static mut Scheduler {
        cpu::scheduler()
    }

    /// Pid of the task running on this core (0 when idle)
    pub fn current_pid() -> Pid {
        Scheduler::current()
            .current_task
            .as_ref()
            .map(|task| task.pid)
            .unwrap_or(0)
    }

    /// Run `f` against the task currently on this core
    ///
    /// The borrow must not be held across a suspension point: a
    /// suspended task moves into the shared queue and back.
    pub fn with_current_task<R>(f: impl FnOnce(&mut Task) -> R) -> R {
        let scheduler = Scheduler::current();
        let task = scheduler
            .current_task
            .as_mut()
            .expect("no task on this core");
        f(task)
    }

    /// Rotate the ready queue into the interrupted frame
    ///
    /// Saves the outgoing frame (unless it was discarded), pops the
    /// first `Normal` task, or falls back to the idle task with frame
    /// persistence disabled so the next tick will not save idle state.
    pub fn switch_to_next_task(&mut self, frame: &mut InterruptFrame) {
        self.update_timer_entries();

        {
            let mut queue = TASK_QUEUE.lock();

            if self.restore_frame {
                if let Some(mut task) = self.current_task.take() {
                    task.frame = *frame;
                    queue.push(task);
                }
            } else {
                // The outgoing frame is dead: boot context, idle, or an
                // exited task (dropped here; its pages leak, see DESIGN)
                self.current_task.take();
                self.restore_frame = true;
            }

            let next = queue
                .iter()
                .position(|task| task.state == TaskState::Normal)
                .map(|index| queue.remove(index));
            self.current_task = next;
        }

        self.configure_timer_closest_expiry();

        match self.current_task.as_ref() {
            Some(task) => {
                self.tss.set_syscall_stack(task.syscall_stack_top);
                *frame = task.frame;
                task.paging.set_active();
            }
            None => {
                self.restore_frame = false;
                self.tss.set_syscall_stack(self.idle_task.syscall_stack_top);
                *frame = self.idle_task.frame;
                self.idle_task.paging.set_active();
            }
        }
    }

    /// Age the timer entries by the time elapsed since the last program
    fn update_timer_entries(&mut self) {
        let remaining = self.lapic.time_remaining_ms();
        assert!(
            self.current_timer_ms >= remaining,
            "timer ran longer than programmed"
        );
        let elapsed = self.current_timer_ms - remaining;

        for pid in expire_timer_entries(&mut self.timer_entries, elapsed) {
            Scheduler::unblock(pid);
        }
    }

    /// Program the LAPIC for the closest pending deadline
    pub fn configure_timer_closest_expiry(&mut self) {
        self.current_timer_ms = closest_expiry_ms(&self.timer_entries);
        self.lapic.set_time_between_fires(self.current_timer_ms);
    }

    /// The `0x81` vector: a voluntary switch that keeps whatever state
    /// the current task already set on itself
    pub fn handle_yield(frame: &mut InterruptFrame) {
        Scheduler::current().switch_to_next_task(frame);
    }

    /// Park the current task in `new_state` and yield
    ///
    /// Returns the value placed in the saved `rax` by `unsuspend`. The
    /// task is guaranteed `Normal` again on resumption (it may resume
    /// on a different core).
    pub fn suspend_syscall(new_state: TaskState) -> u64 {
        Scheduler::with_current_task(|task| {
            assert!(task.state == TaskState::Normal);
            task.state = new_state;
        });

        let return_value = yield_to_scheduler();

        Scheduler::with_current_task(|task| {
            assert!(task.state == TaskState::Normal);
        });
        return_value
    }

    /// Make a blocked task runnable again
    pub fn unblock(pid: Pid) {
        let mut queue = TASK_QUEUE.lock();
        let task = queue
            .iter_mut()
            .find(|task| task.pid == pid)
            .expect("unblock: task not on the queue");
        assert!(task.state == TaskState::Blocked);
        task.state = TaskState::Normal;
    }

    /// Make a suspended task runnable with a syscall return value
    pub fn unsuspend(pid: Pid, return_value: u64) {
        let mut queue = TASK_QUEUE.lock();
        let task = queue
            .iter_mut()
            .find(|task| task.pid == pid)
            .expect("unsuspend: task not on the queue");
        assert!(
            task.state == TaskState::Blocked || task.state == TaskState::WaitingForChild,
            "unsuspend of a runnable task"
        );
        task.frame.rax = return_value;
        task.state = TaskState::Normal;
    }

    /// Block the current task for at least `milliseconds`
    ///
    /// The wakeup is a per-core timer entry; the unblocked task becomes
    /// eligible for selection by any core on the next tick.
    pub fn sleep_current(milliseconds: u64) {
        assert!(milliseconds > 0);
        {
            let scheduler = Scheduler::current();
            let pid = scheduler
                .current_task
                .as_ref()
                .expect("sleep without a task")
                .pid;
            assert!(pid != 0, "the idle task cannot sleep");
            scheduler.timer_entries.push(TimerEntry {
                milliseconds,
                unblock_on_expire: true,
                pid,
            });
        }
        Scheduler::suspend_syscall(TaskState::Blocked);
    }

    /// Duplicate the current task
    ///
    /// The child gets a deep copy of the user address space, by-value
    /// clones of the descriptor table and userspace allocator, the
    /// parent's saved frame with `rax = 0`, and a byte-for-byte copy of
    /// the syscall stack. Returns the child pid to the parent.
    pub fn fork_current(frame: &InterruptFrame) -> Pid {
        let scheduler = Scheduler::current();
        let parent = scheduler
            .current_task
            .as_ref()
            .expect("fork without a task");

        let mut paging = AddressSpace::new();
        paging.copy_userspace(&parent.paging);

        let mut child = task::create_task(
            paging,
            parent.fds.clone(),
            parent.user_alloc.clone(),
            0,
            0,
            true,
            true,
        );
        child.frame = *frame;
        child.frame.rax = 0;
        child.parent = Some(parent.pid);

        unsafe {
            ::core::ptr::copy_nonoverlapping(
                parent.syscall_stack_bottom as *const u8,
                child.syscall_stack_bottom as *mut u8,
                (SYSCALL_STACK_PAGE_COUNT * PAGE_SIZE) as usize,
            );
        }

        let pid = child.pid;
        TASK_QUEUE.lock().push(child);
        pid
    }

    /// Exit the current task, discarding its frame
    pub fn exit_current(status: i64, frame: &mut InterruptFrame) {
        printkln!("Task exited with status {}.", status);

        let scheduler = Scheduler::current();
        if let Some(task) = scheduler.current_task.as_mut() {
            task.state = TaskState::Terminated;
        }
        scheduler.restore_frame = false;
        scheduler.switch_to_next_task(frame);
    }

    /// Load a program and queue it as a new task
    ///
    /// Descriptors 0/1/2 are opened to the terminal before the task
    /// ever runs.
    pub fn create_task_from_elf(path: &str, user_task: bool) {
        let mut paging = AddressSpace::new();
        let (entry, stack_ptr) = elf::load(path, &mut paging).expect("cannot load ELF");

        let mut task = task::create_task(
            paging,
            FdTable::new(),
            UserspaceAllocator::new(),
            entry,
            stack_ptr,
            user_task,
            true,
        );

        for expected in 0..3 {
            let fd = vfs::open(&mut task.fds, "/dev/tty", OpenFlags::READ_WRITE)
                .expect("terminal unavailable");
            assert!(fd == expected, "stdio descriptors out of order");
        }

        TASK_QUEUE.lock().push(task);
    }
}

/// Build and register this core's scheduler
pub fn install_for_core(lapic: LocalApic, tss: &'static mut Tss) {
    let scheduler = Box::leak(Box::new(Scheduler::new(lapic, tss)));
    scheduler.configure_timer_closest_expiry();
    cpu::install_scheduler(cpu::core_id(), scheduler);
}

/// Raise the internal yield vector and collect the resumption value
fn yield_to_scheduler() -> u64 {
    #[cfg(not(test))]
    {
        let return_value: u64;
        unsafe {
            ::core::arch::asm!("int 0x81", out("rax") return_value);
        }
        return_value
    }
    #[cfg(test)]
    {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pids_are_unique_and_monotonic() {
        let first = task::allocate_pid();
        let second = task::allocate_pid();
        let third = task::allocate_pid();
        assert!(first < second && second < third);
        assert!(first != 0, "0 is reserved for idle tasks");
    }

    #[test]
    fn test_expire_subtracts_and_fires() {
        let mut entries = alloc::vec![
            TimerEntry { milliseconds: 50, unblock_on_expire: true, pid: 7 },
            TimerEntry { milliseconds: 10, unblock_on_expire: true, pid: 8 },
            TimerEntry { milliseconds: 30, unblock_on_expire: false, pid: 9 },
        ];

        let expired = expire_timer_entries(&mut entries, 20);
        assert_eq!(expired, alloc::vec![8]);
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|e| e.pid == 7 && e.milliseconds == 30));
        assert!(entries.iter().any(|e| e.pid == 9 && e.milliseconds == 10));
    }

    #[test]
    fn test_expired_without_unblock_fires_nothing() {
        let mut entries = alloc::vec![TimerEntry {
            milliseconds: 5,
            unblock_on_expire: false,
            pid: 3,
        }];
        assert!(expire_timer_entries(&mut entries, 5).is_empty());
        assert!(entries.is_empty());
    }

    #[test]
    fn test_closest_expiry_clamps_to_tick_ceiling() {
        assert_eq!(closest_expiry_ms(&[]), TIMER_CLAMP_MS);
        let entries = [
            TimerEntry { milliseconds: 250, unblock_on_expire: true, pid: 1 },
            TimerEntry { milliseconds: 40, unblock_on_expire: true, pid: 2 },
        ];
        assert_eq!(closest_expiry_ms(&entries), 40);
        let far = [TimerEntry { milliseconds: 900, unblock_on_expire: true, pid: 1 }];
        assert_eq!(closest_expiry_ms(&far), TIMER_CLAMP_MS);
    }

    #[test]
    fn test_sleep_lower_bound_bookkeeping() {
        // A 50 ms sleep survives ticks summing to less than 50 ms and
        // fires on the tick that crosses the total
        let mut entries = alloc::vec![TimerEntry {
            milliseconds: 50,
            unblock_on_expire: true,
            pid: 4,
        }];
        assert!(expire_timer_entries(&mut entries, 30).is_empty());
        assert!(expire_timer_entries(&mut entries, 10).is_empty());
        assert_eq!(expire_timer_entries(&mut entries, 10), alloc::vec![4]);
    }
}
