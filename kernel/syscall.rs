//! System call dispatch
//!
//! Userspace enters through vector `0x80` with the call number in
//! `rax` and up to six arguments in `rdi, rsi, rdx, rcx, r8, r9`. On
//! return, `rax` carries the result; failures are reported as the
//! negated error number. The handler runs on the calling task's kernel
//! syscall stack with interrupts masked; anything that must wait parks
//! the task via the internal yield vector.
//!
//! Descriptor lookups and offset updates happen in short borrows of the
//! current task, never across a potential suspension: a suspended task
//! moves through the shared queue and may resume on another core.

use alloc::string::String;

use crate::arch::x86_64::cpu;
use crate::arch::x86_64::interrupts::InterruptFrame;
use crate::error::{KernelError, KernelResult};
use crate::fs::vfs::{self, OpenFlags, SeekType, StatRecord};
use crate::fs::{VnodeInfo, pty};
use crate::mm::{PAGE_SIZE, page_align_up};
use crate::task::scheduler::Scheduler;

/// System call numbers (the user-visible ABI)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum SystemCallType {
    Open = 0,
    Read = 1,
    Write = 2,
    Seek = 3,
    Close = 4,
    FileMap = 5,
    TcbSet = 6,
    Fork = 7,
    Exit = 8,
    Sleep = 9,
    Stat = 10,
    FStat = 11,
    SetTerminalSettings = 12,
    Panic = 254,
    Log = 255,
}

impl SystemCallType {
    pub fn from_raw(raw: u64) -> Option<Self> {
        Some(match raw {
            0 => Self::Open,
            1 => Self::Read,
            2 => Self::Write,
            3 => Self::Seek,
            4 => Self::Close,
            5 => Self::FileMap,
            6 => Self::TcbSet,
            7 => Self::Fork,
            8 => Self::Exit,
            9 => Self::Sleep,
            10 => Self::Stat,
            11 => Self::FStat,
            12 => Self::SetTerminalSettings,
            254 => Self::Panic,
            255 => Self::Log,
            _ => return None,
        })
    }
}

/// Longest C string accepted from userspace
const MAX_USER_STRING: usize = 4096;

/// Copy a NUL-terminated string out of the current address space
///
/// The caller's page tables are active, so user pointers dereference
/// directly; a missing terminator within the cap is an error.
fn user_cstr(addr: u64) -> KernelResult<String> {
    if addr == 0 {
        return Err(KernelError::InvalidPath);
    }
    let mut bytes = alloc::vec::Vec::new();
    for index in 0..MAX_USER_STRING {
        let byte = unsafe { *((addr + index as u64) as *const u8) };
        if byte == 0 {
            return Ok(String::from_utf8_lossy(&bytes).into_owned());
        }
        bytes.push(byte);
    }
    Err(KernelError::InvalidPath)
}

/// View a user buffer as a mutable slice
fn user_slice_mut(addr: u64, len: u64) -> KernelResult<&'static mut [u8]> {
    if addr == 0 {
        return Err(KernelError::IoError);
    }
    Ok(unsafe { ::core::slice::from_raw_parts_mut(addr as *mut u8, len as usize) })
}

/// View a user buffer as a slice
fn user_slice(addr: u64, len: u64) -> KernelResult<&'static [u8]> {
    if addr == 0 {
        return Err(KernelError::IoError);
    }
    Ok(unsafe { ::core::slice::from_raw_parts(addr as *const u8, len as usize) })
}

/// Entry from the `0x80` vector
pub fn handle(frame: &mut InterruptFrame) {
    let Some(call) = SystemCallType::from_raw(frame.rax) else {
        printkln!("Unknown system call {}.", frame.rax);
        frame.rax = KernelError::IoError.sysret();
        return;
    };

    // Exit never returns into this frame; the scheduler has already
    // loaded the next task when the dispatcher comes back
    if call == SystemCallType::Exit {
        Scheduler::exit_current(frame.rdi as i64, frame);
        return;
    }

    let result = dispatch(call, frame);
    frame.rax = match result {
        Ok(value) => value,
        Err(error) => error.sysret(),
    };
}

fn dispatch(call: SystemCallType, frame: &mut InterruptFrame) -> KernelResult<u64> {
    let (arg0, arg1, arg2) = (frame.rdi, frame.rsi, frame.rdx);

    match call {
        SystemCallType::Open => {
            let path = user_cstr(arg0)?;
            let flags = OpenFlags::from_bits_truncate(arg1 as u32);
            let fd = Scheduler::with_current_task(|task| {
                vfs::open(&mut task.fds, &path, flags)
            })?;
            Ok(fd as u64)
        }

        SystemCallType::Read => {
            let buf = user_slice_mut(arg1, arg2)?;
            let (vnode_info, fs, offset) = descriptor_target(arg0 as usize)?;
            // The terminal read may suspend; no task borrow is held here
            let count = vfs::filesystems()[fs].read(&vnode_info, buf, offset)?;
            advance_descriptor(arg0 as usize, count as u64);
            Ok(count as u64)
        }

        SystemCallType::Write => {
            let buf = user_slice(arg1, arg2)?;
            let (vnode_info, fs, offset) = descriptor_target(arg0 as usize)?;
            let count = vfs::filesystems()[fs].write(&vnode_info, buf, offset)?;
            advance_descriptor(arg0 as usize, count as u64);
            Ok(count as u64)
        }

        SystemCallType::Seek => {
            let seek = SeekType::from_raw(arg2)?;
            Scheduler::with_current_task(|task| {
                vfs::seek(&mut task.fds, arg0 as usize, arg1 as i64, seek)
            })
        }

        SystemCallType::Close => {
            Scheduler::with_current_task(|task| vfs::close(&mut task.fds, arg0 as usize))?;
            Ok(0)
        }

        SystemCallType::FileMap => file_map(arg0 as usize, arg1, arg2),

        SystemCallType::TcbSet => {
            cpu::set_fs_base(arg0);
            Ok(0)
        }

        // The child wakes with rax already zeroed in its copied frame;
        // the parent receives the new pid
        SystemCallType::Fork => Ok(Scheduler::fork_current(frame)),

        SystemCallType::Sleep => {
            if arg0 > 0 {
                Scheduler::sleep_current(arg0);
            }
            Ok(0)
        }

        SystemCallType::Stat => {
            let path = user_cstr(arg0)?;
            let record = vfs::stat(&path)?;
            write_stat(arg1, &record)?;
            Ok(0)
        }

        SystemCallType::FStat => {
            let record =
                Scheduler::with_current_task(|task| vfs::fstat(&task.fds, arg0 as usize))?;
            write_stat(arg1, &record)?;
            Ok(0)
        }

        SystemCallType::SetTerminalSettings => {
            let kind = Scheduler::with_current_task(|task| {
                task.fds.get(arg0 as usize).map(|desc| desc.vnode.kind)
            })?;
            if kind != crate::fs::VnodeKind::CharacterDevice {
                return Err(KernelError::PermissionDenied);
            }
            pty::set_settings(arg1);
            Ok(0)
        }

        SystemCallType::Panic => {
            let message = user_cstr(arg0).unwrap_or_else(|_| String::from("(bad pointer)"));
            panic!("userspace panic: {}", message);
        }

        SystemCallType::Log => {
            let message = user_cstr(arg0)?;
            printkln!("{}", message);
            Ok(0)
        }

        SystemCallType::Exit => unreachable!("handled before dispatch"),
    }
}

/// Snapshot a descriptor's dispatch material in a short task borrow
fn descriptor_target(fd: usize) -> KernelResult<(VnodeInfo, usize, u64)> {
    Scheduler::with_current_task(|task| {
        let descriptor = task.fds.get(fd)?;
        Ok((
            descriptor.vnode.info(),
            descriptor.vnode.fs,
            descriptor.offset,
        ))
    })
}

/// Advance a descriptor's offset after I/O completed
///
/// The descriptor may have been closed while the task was suspended in
/// a device read; that is not an error, the offset update just drops.
fn advance_descriptor(fd: usize, by: u64) {
    Scheduler::with_current_task(|task| {
        if let Ok(descriptor) = task.fds.get_mut(fd) {
            descriptor.offset += by;
        }
    });
}

/// Map a file into the caller's address space
///
/// A page-rounded region of `length` bytes is mapped at `hint` (page
/// aligned down) or at an allocator-chosen range, then filled from the
/// start of the file. Returns the mapped base address.
fn file_map(fd: usize, hint: u64, length: u64) -> KernelResult<u64> {
    if length == 0 {
        return Err(KernelError::IoError);
    }
    let length = page_align_up(length);
    let page_count = (length / PAGE_SIZE) as usize;

    let base = Scheduler::with_current_task(|task| {
        // Validate the descriptor before touching the address space
        task.fds.get(fd)?;
        let base = if hint != 0 {
            hint & !(PAGE_SIZE - 1)
        } else {
            task.user_alloc.allocate(length)
        };
        task.paging.map_fresh(base, page_count, true);
        Ok::<u64, KernelError>(base)
    })?;

    let (vnode_info, fs, _) = descriptor_target(fd)?;
    let file_size = vfs::filesystems()[fs].size_of(&vnode_info);
    let to_read = file_size.min(length);
    if to_read > 0 {
        // The fresh mapping is live in the current address space
        let target = user_slice_mut(base, to_read)?;
        let read = vfs::filesystems()[fs].read(&vnode_info, target, 0)?;
        if read as u64 != to_read {
            return Err(KernelError::IoError);
        }
    }

    Ok(base)
}

/// Copy a stat record to a user buffer
fn write_stat(addr: u64, record: &StatRecord) -> KernelResult<()> {
    if addr == 0 {
        return Err(KernelError::IoError);
    }
    unsafe {
        ::core::ptr::write_unaligned(addr as *mut StatRecord, *record);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syscall_numbers_match_abi() {
        assert_eq!(SystemCallType::from_raw(0), Some(SystemCallType::Open));
        assert_eq!(SystemCallType::from_raw(3), Some(SystemCallType::Seek));
        assert_eq!(SystemCallType::from_raw(5), Some(SystemCallType::FileMap));
        assert_eq!(SystemCallType::from_raw(8), Some(SystemCallType::Exit));
        assert_eq!(SystemCallType::from_raw(12), Some(SystemCallType::SetTerminalSettings));
        assert_eq!(SystemCallType::from_raw(7), Some(SystemCallType::Fork));
        assert_eq!(SystemCallType::from_raw(254), Some(SystemCallType::Panic));
        assert_eq!(SystemCallType::from_raw(255), Some(SystemCallType::Log));
        assert_eq!(SystemCallType::from_raw(13), None);
    }

    #[test]
    fn test_stat_record_layout() {
        use ::core::mem::{offset_of, size_of};
        assert_eq!(size_of::<StatRecord>(), 24);
        assert_eq!(offset_of!(StatRecord, inode_num), 0);
        assert_eq!(offset_of!(StatRecord, kind), 8);
        assert_eq!(offset_of!(StatRecord, size), 16);
    }
}
