//! Core scheduler: task lifecycle and the two schedule entry points.
//!
//! `schedule` is the voluntary path: charge the outgoing task, park it back
//! in the run queue, pick the leftmost task (or idle), and hand back a
//! [`SwitchAction`] describing the context switch to perform once the
//! scheduler lock is dropped. `schedule_preempt` is the interrupt path: the
//! outgoing context is taken from the trap frame and the incoming context
//! is written into it, so the trap return itself resumes the chosen task.
//!
//! Three invariants are asserted (panic on violation) at every transition:
//!
//! 1. READY and non-idle implies queued.
//! 2. RUNNING implies not queued.
//! 3. ZOMBIE implies not queued.

use super::{
    eevdf::RunQueue,
    pid::PidAllocator,
    task::{
        CpuContext, Task, TaskArgs, TaskEntry, TaskId, TaskState, TaskTable, TrapFrame,
        KERNEL_STACK_SIZE, PSTATE_EL1H,
    },
};
use crate::{
    error::{KernelError, KernelResult},
    mm::VirtAddr,
};

// Context slots consumed by the entry trampoline.
const SLOT_ENTRY: usize = 19;
const SLOT_ARGC: usize = 20;
const SLOT_ARGV: usize = 21;
const SLOT_ENVP: usize = 22;
// Link register: where the entry function "returns" to.
const SLOT_LR: usize = 30;

/// What the caller must do after the scheduler lock is released.
#[derive(Debug, Clone, Copy)]
pub enum SwitchAction {
    /// Keep running the current task.
    None,
    /// Save into `prev`, restore from `next`.
    Switch {
        prev: *mut CpuContext,
        next: *const CpuContext,
    },
    /// No previous context (current was killed): install `next` directly.
    Jump { next: *const CpuContext },
}

/// Scheduler state: task arena, run queue, PID space, current/idle.
pub struct Scheduler {
    tasks: TaskTable,
    rq: RunQueue,
    pids: PidAllocator,
    current: Option<TaskId>,
    idle: Option<TaskId>,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            tasks: TaskTable::new(),
            rq: RunQueue::new(),
            pids: PidAllocator::new(),
            current: None,
            idle: None,
        }
    }

    /// Initialize PID space and create the idle task (PID 0, RUNNING,
    /// never enqueued). Panics if the arena cannot hold it.
    pub fn init(&mut self) {
        self.pids.init();
        let idle = Task::blank(0, TaskState::Running, 0);
        let tid = match self.tasks.insert(idle) {
            Some(tid) => tid,
            None => panic!("scheduler: no slot for the idle task"),
        };
        self.idle = Some(tid);
        self.current = Some(tid);
        log::info!("sched: idle task created (pid 0)");
    }

    /// Create a task. `stack_base` is a [`KERNEL_STACK_SIZE`] allocation
    /// owned by the task from here on. Returns `None` (after undoing the
    /// PID reservation) when the arena is full or PIDs ran out; the caller
    /// reclaims the stack in that case.
    pub fn create_task(
        &mut self,
        entry: TaskEntry,
        nice: i32,
        args: TaskArgs,
        stack_base: VirtAddr,
    ) -> Option<TaskId> {
        let pid = self.pids.alloc()?;

        let mut task = Task::blank(pid, TaskState::Ready, nice.clamp(-20, 19));
        task.time_slice_ns = super::eevdf::DEFAULT_SLICE_NS;
        task.kernel_stack = stack_base;

        // First dispatch lands in the entry trampoline with the entry
        // function and its arguments parked in callee-saved slots; falling
        // out of the entry function exits the task.
        let stack_top = (stack_base.as_u64() + KERNEL_STACK_SIZE) & !15;
        task.context.sp = stack_top;
        task.context.pc = crate::arch::task_entry_trampoline_addr();
        task.context.x[SLOT_ENTRY] = entry as usize as u64;
        task.context.x[SLOT_ARGC] = args.argc;
        task.context.x[SLOT_ARGV] = args.argv;
        task.context.x[SLOT_ENVP] = args.envp;
        task.context.x[SLOT_LR] = crate::arch::task_exit_thunk_addr();
        task.context.pstate = PSTATE_EL1H;

        let Some(tid) = self.tasks.insert(task) else {
            self.pids.free(pid);
            return None;
        };
        self.rq.enqueue(tid, self.tasks.get_mut(tid));
        self.assert_invariants(tid);
        Some(tid)
    }

    /// The running task, if any.
    pub fn current(&self) -> Option<TaskId> {
        self.current
    }

    /// PID of the running task.
    pub fn current_pid(&self) -> Option<i32> {
        self.current.map(|tid| self.tasks.get(tid).pid)
    }

    /// Look a task up by PID (zombies included).
    pub fn find_by_pid(&self, pid: i32) -> Option<TaskId> {
        self.tasks.find_by_pid(pid)
    }

    /// Shared task access for inspection.
    pub fn task(&self, tid: TaskId) -> &Task {
        self.tasks.get(tid)
    }

    /// Mutable task access (tests and the nice syscall path).
    pub fn task_mut(&mut self, tid: TaskId) -> &mut Task {
        self.tasks.get_mut(tid)
    }

    /// Voluntary reschedule at time `now`.
    pub fn schedule(&mut self, now: u64) -> SwitchAction {
        let prev = self.current;

        if let Some(p) = prev {
            let idle = self.idle;
            let t = self.tasks.get_mut(p);
            if t.state == TaskState::Running {
                self.rq.update_curr(t, now);
                t.state = TaskState::Ready;
                if Some(p) != idle {
                    self.rq.enqueue(p, t);
                }
            }
            self.assert_invariants(p);
        }

        let next = match self.rq.pick_next().or(self.idle) {
            Some(n) => n,
            None => return SwitchAction::None,
        };

        if Some(next) == prev {
            // Nothing better to run; revert the bookkeeping.
            let t = self.tasks.get_mut(next);
            if t.state == TaskState::Ready {
                t.state = TaskState::Running;
                self.rq.dequeue(t);
            }
            self.assert_invariants(next);
            return SwitchAction::None;
        }

        self.dispatch(next, now);

        let next_ctx = &self.tasks.get(next).context as *const CpuContext;
        match prev {
            Some(p) => SwitchAction::Switch {
                prev: &mut self.tasks.get_mut(p).context as *mut CpuContext,
                next: next_ctx,
            },
            None => SwitchAction::Jump { next: next_ctx },
        }
    }

    /// Preemptive reschedule from interrupt context. The outgoing context
    /// is `*frame`; on a switch the incoming context is written back into
    /// `*frame` so the trap return resumes the new task.
    pub fn schedule_preempt(&mut self, frame: &mut TrapFrame, now: u64) {
        let prev = self.current;

        if let Some(p) = prev {
            let idle = self.idle;
            let t = self.tasks.get_mut(p);
            t.context = *frame;
            if t.state == TaskState::Running {
                self.rq.update_curr(t, now);
                t.state = TaskState::Ready;
                if Some(p) != idle {
                    self.rq.enqueue(p, t);
                }
            }
            self.assert_invariants(p);
        }

        let next = match self.rq.pick_next().or(self.idle) {
            Some(n) => n,
            None => return,
        };

        if Some(next) == prev {
            let t = self.tasks.get_mut(next);
            if t.state == TaskState::Ready {
                t.state = TaskState::Running;
                self.rq.dequeue(t);
            }
            self.assert_invariants(next);
            return;
        }

        self.dispatch(next, now);
        *frame = self.tasks.get(next).context;
    }

    /// Timer-driven preemption: reschedule only once the current task's
    /// slice is spent.
    pub fn tick_preempt(&mut self, frame: &mut TrapFrame, now: u64) {
        if let Some(cur) = self.current {
            let t = self.tasks.get(cur);
            if now.saturating_sub(t.last_charge_ns) < t.time_slice_ns {
                return;
            }
        }
        self.schedule_preempt(frame, now);
    }

    /// Terminate the current task. Frees its PID, leaves the arena slot and
    /// stack in place (zombie), clears `current`, and reschedules.
    pub fn exit_current(&mut self, code: i32, now: u64) -> SwitchAction {
        let Some(cur) = self.current else {
            return SwitchAction::None;
        };
        {
            let t = self.tasks.get_mut(cur);
            log::debug!("sched: pid {} exiting with code {}", t.pid, code);
            self.rq.dequeue(t);
            t.state = TaskState::Zombie;
            let pid = t.pid;
            self.pids.free(pid);
        }
        self.assert_invariants(cur);
        self.current = None;
        self.schedule(now)
    }

    /// Trap-context variant of [`exit_current`](Self::exit_current): the
    /// successor's context is written into `frame` so the trap return
    /// resumes it. The exiting task's saved x0 is never consulted again.
    pub fn exit_current_preempt(&mut self, code: i32, frame: &mut TrapFrame, now: u64) {
        let Some(cur) = self.current else {
            return;
        };
        {
            let t = self.tasks.get_mut(cur);
            log::debug!("sched: pid {} exiting with code {}", t.pid, code);
            self.rq.dequeue(t);
            t.state = TaskState::Zombie;
            let pid = t.pid;
            self.pids.free(pid);
        }
        self.assert_invariants(cur);
        self.current = None;
        self.schedule_preempt(frame, now);
    }

    /// Trap-context kill. Returns `Ok(true)` when the victim was the
    /// running task and `frame` now carries its successor's context --
    /// in that case the caller must not write a return value into the
    /// frame.
    pub fn kill_preempt(
        &mut self,
        tid: TaskId,
        frame: &mut TrapFrame,
        now: u64,
    ) -> KernelResult<bool> {
        let was_current = self.current == Some(tid);
        if was_current {
            let pid = {
                let t = self.tasks.get(tid);
                if t.pid == 0 {
                    return Err(KernelError::InvalidArgument {
                        name: "pid",
                        value: "cannot kill the idle task",
                    });
                }
                if t.state == TaskState::Zombie {
                    return Ok(false);
                }
                t.pid
            };
            {
                let t = self.tasks.get_mut(tid);
                self.rq.dequeue(t);
                t.state = TaskState::Zombie;
            }
            self.pids.free(pid);
            self.tasks.unlink(tid);
            self.assert_invariants(tid);
            self.current = None;
            self.schedule_preempt(frame, now);
            return Ok(true);
        }
        self.kill(tid, now).map(|_| false)
    }

    /// Kill a task. Refuses PID 0, is idempotent on zombies, and when the
    /// victim is the running task reschedules away from it.
    pub fn kill(&mut self, tid: TaskId, now: u64) -> KernelResult<SwitchAction> {
        let pid = {
            let t = self.tasks.get(tid);
            if t.pid == 0 {
                return Err(KernelError::InvalidArgument {
                    name: "pid",
                    value: "cannot kill the idle task",
                });
            }
            if t.state == TaskState::Zombie {
                return Ok(SwitchAction::None);
            }
            t.pid
        };

        {
            let t = self.tasks.get_mut(tid);
            self.rq.dequeue(t);
            t.state = TaskState::Zombie;
        }
        self.pids.free(pid);
        self.tasks.unlink(tid);
        self.assert_invariants(tid);

        if self.current == Some(tid) {
            self.current = None;
            return Ok(self.schedule(now));
        }
        Ok(SwitchAction::None)
    }

    /// Count of runnable tasks in the queue.
    pub fn nr_running(&self) -> u32 {
        self.rq.nr_running
    }

    /// Accessor for slice computation from the timer path.
    pub fn run_queue(&self) -> &RunQueue {
        &self.rq
    }

    fn dispatch(&mut self, next: TaskId, now: u64) {
        {
            let t = self.tasks.get_mut(next);
            self.rq.dequeue(t); // no-op for idle, which is never queued
            t.state = TaskState::Running;
            t.last_charge_ns = now;
        }
        // Slice is computed against the remaining queue load.
        let slice = self.rq.calc_slice(self.tasks.get(next));
        self.tasks.get_mut(next).time_slice_ns = slice;
        self.current = Some(next);
        self.assert_invariants(next);
    }

    fn assert_invariants(&self, tid: TaskId) {
        let t = self.tasks.get(tid);
        let queued = t.is_queued();
        match t.state {
            TaskState::Ready => {
                if t.pid != 0 && !queued {
                    panic!("scheduler invariant: READY pid {} not queued", t.pid);
                }
            }
            TaskState::Running => {
                if queued {
                    panic!("scheduler invariant: RUNNING pid {} still queued", t.pid);
                }
            }
            TaskState::Zombie => {
                if queued {
                    panic!("scheduler invariant: ZOMBIE pid {} still queued", t.pid);
                }
            }
            TaskState::Blocked => {}
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
