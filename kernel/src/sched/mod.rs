//! Scheduling: weight-fair run queue, task lifecycle, context switching.
//!
//! See [`eevdf`] for the run-queue accounting, [`task`] for the task arena,
//! and [`scheduler`] for the schedule entry points. This module owns the
//! global scheduler instance and the public task API (`spawn`, `exit`,
//! `kill_by_pid`, `yield_now`).

pub mod eevdf;
pub mod pid;
pub mod scheduler;
pub mod task;

use spin::Mutex;

pub use scheduler::{Scheduler, SwitchAction};
pub use task::{TaskArgs, TaskEntry, TaskId};

use crate::{
    error::{KernelError, KernelResult},
    mm::vmalloc::{vfree, vmalloc},
};

use task::KERNEL_STACK_SIZE;

/// Global scheduler. Locked briefly for bookkeeping; the lock is always
/// released before a context switch is performed.
pub static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

/// Initialize the scheduler and create the idle task.
pub fn init() {
    SCHEDULER.lock().init();
}

/// Create a kernel task with its own stack and enqueue it.
///
/// Returns `None` when the stack allocation, PID allocation or task arena
/// is exhausted; partial state is undone.
pub fn spawn(entry: TaskEntry, nice: i32, args: TaskArgs) -> Option<TaskId> {
    let stack = vmalloc(KERNEL_STACK_SIZE)?;
    let tid = SCHEDULER.lock().create_task(entry, nice, args, stack);
    if tid.is_none() {
        vfree(stack, KERNEL_STACK_SIZE);
    }
    tid
}

/// Voluntarily give up the CPU.
pub fn yield_now() {
    let action = {
        let mut sched = SCHEDULER.lock();
        sched.schedule(crate::arch::now_ns())
    };
    perform(action);
}

/// Terminate the calling task. On target this does not return; the
/// successor's context is installed directly.
pub fn exit_current(code: i32) {
    let action = {
        let mut sched = SCHEDULER.lock();
        sched.exit_current(code, crate::arch::now_ns())
    };
    perform(action);
}

/// Kill the task with `pid`.
pub fn kill_by_pid(pid: i32) -> KernelResult<()> {
    let action = {
        let mut sched = SCHEDULER.lock();
        let tid = sched.find_by_pid(pid).ok_or(KernelError::NotFound {
            resource: "task",
            id: pid as u64,
        })?;
        sched.kill(tid, crate::arch::now_ns())?
    };
    perform(action);
    Ok(())
}

/// PID of the running task.
pub fn current_pid() -> Option<i32> {
    SCHEDULER.lock().current_pid()
}

/// Carry out a switch decision once the scheduler lock is dropped.
fn perform(action: SwitchAction) {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    match action {
        SwitchAction::None => {}
        SwitchAction::Switch { prev, next } => {
            // SAFETY: both pointers come from the scheduler's task arena,
            // which is never moved or freed; the lock is dropped, and on a
            // single CPU nothing else mutates these contexts until the
            // switch completes.
            unsafe { crate::arch::aarch64::context::switch_to(prev, next) }
        }
        SwitchAction::Jump { next } => {
            // SAFETY: as above; the previous context is dead (zombie), so
            // installing `next` without saving is exactly right.
            unsafe { crate::arch::aarch64::context::load_context(next) }
        }
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    let _ = action;
}
