//! Tasks and the task arena.
//!
//! A task is a kernel thread of execution: saved CPU context, kernel stack,
//! scheduling bookkeeping and a PID. Tasks live in a fixed arena addressed
//! by [`TaskId`] indices; the global task list threads through the arena
//! with index links instead of pointers. Zombie tasks keep their arena slot
//! and their stack -- reaping is deliberately out of scope.

use crate::mm::VirtAddr;

/// Size of every kernel task stack.
pub const KERNEL_STACK_SIZE: u64 = 16 * 1024;

/// Capacity of the task arena.
pub const MAX_TASKS: usize = 64;

/// Index of a task in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(pub u32);

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// On the CPU right now. At most one task at a time.
    Running,
    /// Runnable, waiting in the run queue (idle is READY but never queued).
    Ready,
    /// Waiting on an event; not runnable.
    Blocked,
    /// Exited or killed; stays in the arena, never runs again.
    Zombie,
}

/// Saved CPU register state: general registers x0-x30 plus stack pointer,
/// program counter and processor state.
///
/// The layout is the contract between the scheduler, the context-switch
/// assembly, and the trap entry code: caller-saved registers land here on a
/// preemption, and the entry trampoline reads its arguments out of the
/// x19-x22 slots.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CpuContext {
    pub x: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

/// A trap frame is the same register set, saved by the exception entry.
pub type TrapFrame = CpuContext;

/// SPSR value for a fresh kernel task: EL1h, DAIF clear.
pub const PSTATE_EL1H: u64 = 0x3C5;

impl CpuContext {
    pub const fn zeroed() -> Self {
        Self {
            x: [0; 31],
            sp: 0,
            pc: 0,
            pstate: 0,
        }
    }
}

/// Entry point signature for kernel tasks: `(argc, argv, envp)`.
pub type TaskEntry = extern "C" fn(usize, usize, usize);

/// Arguments handed to a task's entry point through its initial context.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskArgs {
    pub argc: u64,
    pub argv: u64,
    pub envp: u64,
}

/// One task.
#[derive(Debug, Clone, Copy)]
pub struct Task {
    pub pid: i32,
    pub state: TaskState,
    /// Nice value, -20..=19.
    pub nice: i32,
    /// Slice granted at the last dispatch, nanoseconds.
    pub time_slice_ns: u64,
    /// Accumulated weighted virtual runtime. Monotonically non-decreasing.
    pub vruntime: u64,
    /// Physical timestamp of the last charge; the dedicated slot the
    /// scheduler charges runtime against.
    pub last_charge_ns: u64,
    pub context: CpuContext,
    /// Base of the task's kernel stack allocation (zero for idle, which
    /// runs on the boot stack).
    pub kernel_stack: VirtAddr,
    /// Run-queue node index while queued. `Some` iff the task is in the
    /// run queue.
    pub rq_node: Option<u32>,
    /// Global task list links (arena indices).
    pub next: Option<TaskId>,
    pub prev: Option<TaskId>,
}

impl Task {
    /// A blank task record; the scheduler fills in the rest.
    pub const fn blank(pid: i32, state: TaskState, nice: i32) -> Self {
        Self {
            pid,
            state,
            nice,
            time_slice_ns: 0,
            vruntime: 0,
            last_charge_ns: 0,
            context: CpuContext::zeroed(),
            kernel_stack: VirtAddr::new(0),
            rq_node: None,
            next: None,
            prev: None,
        }
    }

    /// Whether the task currently sits in the run queue.
    pub fn is_queued(&self) -> bool {
        self.rq_node.is_some()
    }
}

/// Fixed task arena plus the global task list.
pub struct TaskTable {
    slots: [Option<Task>; MAX_TASKS],
    head: Option<TaskId>,
}

impl TaskTable {
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_TASKS],
            head: None,
        }
    }

    /// Place `task` into a free slot and link it at the head of the global
    /// list. `None` when the arena is full.
    pub fn insert(&mut self, mut task: Task) -> Option<TaskId> {
        let slot = self.slots.iter().position(|s| s.is_none())?;
        let id = TaskId(slot as u32);

        task.next = self.head;
        task.prev = None;
        self.slots[slot] = Some(task);
        if let Some(old_head) = self.head {
            self.get_mut(old_head).prev = Some(id);
        }
        self.head = Some(id);
        Some(id)
    }

    /// Unlink a task from the global list. The arena slot (and the stack it
    /// references) is retained.
    pub fn unlink(&mut self, id: TaskId) {
        let (prev, next) = {
            let t = self.get_mut(id);
            let links = (t.prev, t.next);
            t.prev = None;
            t.next = None;
            links
        };
        match prev {
            Some(p) => self.get_mut(p).next = next,
            None => {
                if self.head == Some(id) {
                    self.head = next;
                }
            }
        }
        if let Some(n) = next {
            self.get_mut(n).prev = prev;
        }
    }

    pub fn get(&self, id: TaskId) -> &Task {
        self.slots[id.0 as usize]
            .as_ref()
            .expect("task arena: stale task id")
    }

    pub fn get_mut(&mut self, id: TaskId) -> &mut Task {
        self.slots[id.0 as usize]
            .as_mut()
            .expect("task arena: stale task id")
    }

    /// Find a task by PID. Scans arena slots, so zombies that are no longer
    /// on the global list are still found.
    pub fn find_by_pid(&self, pid: i32) -> Option<TaskId> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|t| t.pid == pid))
            .map(|i| TaskId(i as u32))
    }

    /// Iterate the global task list (live tasks only).
    pub fn iter_list(&self) -> TaskListIter<'_> {
        TaskListIter {
            table: self,
            cur: self.head,
        }
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over the global task list, see [`TaskTable::iter_list`].
pub struct TaskListIter<'a> {
    table: &'a TaskTable,
    cur: Option<TaskId>,
}

impl Iterator for TaskListIter<'_> {
    type Item = TaskId;

    fn next(&mut self) -> Option<TaskId> {
        let id = self.cur?;
        self.cur = self.table.get(id).next;
        Some(id)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate alloc;

    use alloc::vec::Vec;

    use super::*;

    #[test]
    fn insert_links_at_head() {
        let mut table = TaskTable::new();
        let a = table.insert(Task::blank(1, TaskState::Ready, 0)).unwrap();
        let b = table.insert(Task::blank(2, TaskState::Ready, 0)).unwrap();
        let c = table.insert(Task::blank(3, TaskState::Ready, 0)).unwrap();

        let pids: Vec<i32> = table.iter_list().map(|id| table.get(id).pid).collect();
        assert_eq!(pids, [3, 2, 1]);
        assert_eq!(table.get(b).prev, Some(c));
        assert_eq!(table.get(b).next, Some(a));
    }

    #[test]
    fn unlink_middle_and_head() {
        let mut table = TaskTable::new();
        let _a = table.insert(Task::blank(1, TaskState::Ready, 0)).unwrap();
        let b = table.insert(Task::blank(2, TaskState::Ready, 0)).unwrap();
        let c = table.insert(Task::blank(3, TaskState::Ready, 0)).unwrap();

        table.unlink(b);
        let pids: Vec<i32> = table.iter_list().map(|id| table.get(id).pid).collect();
        assert_eq!(pids, [3, 1]);

        table.unlink(c);
        let pids: Vec<i32> = table.iter_list().map(|id| table.get(id).pid).collect();
        assert_eq!(pids, [1]);

        // Unlinked tasks are still findable by PID (zombie lookup).
        assert_eq!(table.find_by_pid(2), Some(b));
    }

    #[test]
    fn arena_capacity_is_bounded() {
        let mut table = TaskTable::new();
        for pid in 0..MAX_TASKS as i32 {
            assert!(table.insert(Task::blank(pid, TaskState::Ready, 0)).is_some());
        }
        assert!(table.insert(Task::blank(999, TaskState::Ready, 0)).is_none());
    }
}
