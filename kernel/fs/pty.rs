//! Pseudo-terminal character device
//!
//! Output goes straight to the serial console. Input bytes arrive from
//! the keyboard vector; a task reading an empty terminal blocks and is
//! made runnable again when input shows up. Canonical mode holds bytes
//! back until a full line is buffered; echo mirrors input to the
//! console as it arrives.

use alloc::collections::VecDeque;

use crate::arch::IrqSpinlock;
use crate::printk;
use crate::task::scheduler::{Scheduler, TaskState};

/// Terminal settings bits (the SetTerminalSettings syscall argument)
pub const MODE_ECHO: u64 = 1 << 0;
pub const MODE_CANONICAL: u64 = 1 << 1;

struct PtyState {
    input: VecDeque<u8>,
    echo: bool,
    canonical: bool,
    /// Task blocked on an empty terminal, if any
    waiting_reader: Option<u64>,
}

static PTY: IrqSpinlock<PtyState> = IrqSpinlock::new(PtyState {
    input: VecDeque::new(),
    echo: true,
    canonical: true,
    waiting_reader: None,
});

impl PtyState {
    /// Whether a read can make progress under the current mode
    fn readable(&self) -> bool {
        if self.canonical {
            self.input.contains(&b'\n')
        } else {
            !self.input.is_empty()
        }
    }

    /// Pop buffered input into `buf`; canonical mode stops after the
    /// first newline
    fn drain(&mut self, buf: &mut [u8]) -> usize {
        let mut count = 0;
        while count < buf.len() {
            let Some(byte) = self.input.pop_front() else {
                break;
            };
            buf[count] = byte;
            count += 1;
            if self.canonical && byte == b'\n' {
                break;
            }
        }
        count
    }
}

/// Write terminal output
pub fn write(buf: &[u8]) -> usize {
    printk::write_bytes(buf);
    buf.len()
}

/// Read terminal input, blocking the calling task until some is ready
pub fn read(buf: &mut [u8]) -> usize {
    if buf.is_empty() {
        return 0;
    }
    loop {
        {
            let mut pty = PTY.lock();
            if pty.readable() {
                return pty.drain(buf);
            }
            pty.waiting_reader = Some(Scheduler::current_pid());
        }
        // Stay off the ready queue until input arrives
        Scheduler::suspend_syscall(TaskState::Blocked);
    }
}

/// Feed one input byte from the keyboard vector
///
/// Scancode-to-byte decoding happens upstream; the terminal only
/// buffers, echoes, and wakes a blocked reader.
pub fn receive_byte(byte: u8) {
    let wake = {
        let mut pty = PTY.lock();
        if pty.echo {
            printk::write_bytes(&[byte]);
        }
        pty.input.push_back(byte);
        if pty.readable() {
            pty.waiting_reader.take()
        } else {
            None
        }
    };
    if let Some(pid) = wake {
        Scheduler::unblock(pid);
    }
}

/// Apply terminal settings from the SetTerminalSettings syscall
pub fn set_settings(mode: u64) {
    let mut pty = PTY.lock();
    pty.echo = mode & MODE_ECHO != 0;
    pty.canonical = mode & MODE_CANONICAL != 0;
}

#[cfg(test)]
mod tests {
    use super::*;

    // The terminal is a process-wide singleton; serialize the tests
    static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn reset(echo: bool, canonical: bool) {
        let mut pty = PTY.lock();
        pty.input.clear();
        pty.echo = echo;
        pty.canonical = canonical;
        pty.waiting_reader = None;
    }

    #[test]
    fn test_canonical_read_stops_at_newline() {
        let _serial = TEST_LOCK.lock().unwrap();
        reset(false, true);
        for &b in b"hi\nmore" {
            receive_byte(b);
        }
        let mut buf = [0u8; 16];
        let n = PTY.lock().drain(&mut buf);
        assert_eq!(&buf[..n], b"hi\n");
    }

    #[test]
    fn test_raw_mode_is_readable_per_byte() {
        let _serial = TEST_LOCK.lock().unwrap();
        reset(false, false);
        assert!(!PTY.lock().readable());
        receive_byte(b'x');
        assert!(PTY.lock().readable());
        let mut buf = [0u8; 4];
        let n = PTY.lock().drain(&mut buf);
        assert_eq!(&buf[..n], b"x");
    }

    #[test]
    fn test_incomplete_line_not_readable_in_canonical_mode() {
        let _serial = TEST_LOCK.lock().unwrap();
        reset(false, true);
        receive_byte(b'a');
        receive_byte(b'b');
        assert!(!PTY.lock().readable());
        receive_byte(b'\n');
        assert!(PTY.lock().readable());
    }
}
