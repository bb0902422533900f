//! System call dispatch.
//!
//! Synchronous traps with EC = SVC land here. The syscall number travels in
//! x8, arguments in x0-x5, and the result overwrites x0 in the saved trap
//! frame -- unless the call switched tasks (exit, self-kill), in which case
//! the frame already belongs to the successor and is left alone.

use crate::{
    klog,
    sched::{task::TrapFrame, Scheduler, SCHEDULER},
};

pub const SYS_WRITE: u64 = 1;
pub const SYS_EXIT: u64 = 60;
pub const SYS_KILL: u64 = 129;

const STDOUT_FD: u64 = 1;
const STDERR_FD: u64 = 2;

/// Upper bound on a single `write`, to keep a bad length from walking off
/// into unmapped memory.
const WRITE_MAX: u64 = 4096;

/// Handle the trap described by `frame` against the global scheduler.
pub fn handle(frame: &mut TrapFrame) {
    let now = crate::arch::now_ns();
    let mut sched = SCHEDULER.lock();
    handle_with(&mut sched, frame, now);
}

/// Dispatch one system call. Separated from the global lock so the logic
/// is testable against a local scheduler.
pub fn handle_with(sched: &mut Scheduler, frame: &mut TrapFrame, now: u64) {
    let nr = frame.x[8];
    match nr {
        SYS_WRITE => {
            let ret = sys_write(frame.x[0], frame.x[1], frame.x[2]);
            frame.x[0] = ret as u64;
        }
        SYS_EXIT => {
            // Does not return to the caller: the frame is rewritten to the
            // successor task.
            sched.exit_current_preempt(frame.x[0] as i32, frame, now);
        }
        SYS_KILL => {
            let pid = frame.x[0] as i32;
            let ret = match sched.find_by_pid(pid) {
                Some(tid) => match sched.kill_preempt(tid, frame, now) {
                    // Frame now belongs to the successor; leave it alone.
                    Ok(true) => return,
                    Ok(false) => 0,
                    Err(_) => -1,
                },
                None => -1,
            };
            frame.x[0] = ret as u64;
        }
        _ => {
            log::warn!("syscall: unknown number {}", nr);
            frame.x[0] = (-1i64) as u64;
        }
    }
}

/// `write(fd, buf, count)`: fd 1 and 2 go to the console, everything else
/// is an error. Returns bytes written or -1.
fn sys_write(fd: u64, buf: u64, count: u64) -> i64 {
    if fd != STDOUT_FD && fd != STDERR_FD {
        return -1;
    }
    if buf == 0 {
        return -1;
    }
    let len = count.min(WRITE_MAX) as usize;
    // SAFETY: kernel tasks pass kernel-mapped buffers; the length is capped.
    // A hostile pointer faults into the synchronous-abort path, which
    // panics -- there is no user/kernel isolation at this trap boundary.
    let bytes = unsafe { core::slice::from_raw_parts(buf as *const u8, len) };
    klog::console_write(bytes);
    len as i64
}
