//! Weight-fair run queue.
//!
//! CFS/EEVDF-style accounting: every runnable task is keyed by its virtual
//! runtime in a red-black tree, and the leftmost node (cached by the tree)
//! is always the next task to run. Physical runtime charged to a task is
//! scaled by `NICE_0_WEIGHT / total_load`, so a heavier (lower-nice) task
//! accumulates virtual time more slowly and therefore runs more often.
//!
//! New arrivals have their vruntime clamped up to the queue's
//! `min_vruntime` so they cannot starve incumbents by joining with an
//! ancient clock.

use super::task::{Task, TaskId};
use crate::rbtree::RbTree;

/// Node pool of the run-queue tree; bounds simultaneously runnable tasks.
pub const RQ_CAP: usize = super::task::MAX_TASKS;

/// Scheduling-latency target: every runnable task should get on the CPU
/// within roughly this window.
pub const TARGET_LATENCY_NS: u64 = 6_000_000;
/// Lower bound for a computed slice.
pub const MIN_GRANULARITY_NS: u64 = 750_000;
/// Upper bound for a computed slice.
pub const MAX_SLICE_NS: u64 = 100_000_000;
/// Slice handed out when the queue is empty.
pub const DEFAULT_SLICE_NS: u64 = 4_000_000;
/// Weight of nice 0.
pub const NICE_0_WEIGHT: u64 = 1024;
/// Nice value bounds.
pub const MIN_NICE: i32 = -20;
pub const MAX_NICE: i32 = 19;

/// Nice level to load weight, nice -20 first. Roughly 1.25x per step with
/// nice 0 pinned at 1024.
pub const NICE_TO_WEIGHT: [u32; 40] = [
    88761, 71755, 56483, 46273, 36291, 29154, 23254, 18705, 14949, 11916, //
    9548, 7620, 6100, 4904, 3906, 3121, 2501, 1991, 1586, 1277, //
    1024, 820, 655, 526, 423, 335, 272, 215, 172, 137, //
    110, 87, 70, 56, 45, 36, 29, 23, 18, 15,
];

/// Precomputed `2^32 / weight` multipliers, for implementations that want
/// to divide by a task weight without a hardware divide.
pub const NICE_TO_WMULT: [u32; 40] = [
    48388, 59856, 76040, 92818, 118348, 147320, 184698, 229616, 287308, 360437, //
    449829, 563644, 704093, 875809, 1099582, 1376151, 1717300, 2157191, 2708050, 3363326, //
    4194304, 5237765, 6557202, 8165337, 10153587, 12820798, 15790321, 19976592, 24970740,
    31350126, //
    39045157, 49367440, 61356676, 76695844, 95443717, 119304647, 148102320, 186737708,
    238609294, 286331153,
];

/// Load weight for a (clamped) nice value.
pub fn weight_of(nice: i32) -> u64 {
    let idx = (nice.clamp(MIN_NICE, MAX_NICE) + 20) as usize;
    u64::from(NICE_TO_WEIGHT[idx])
}

/// Clamp and assign a task's nice value.
pub fn set_nice(task: &mut Task, nice: i32) {
    task.nice = nice.clamp(MIN_NICE, MAX_NICE);
}

/// The run queue: vruntime-ordered tree plus aggregate load.
pub struct RunQueue {
    tree: RbTree<u64, TaskId, RQ_CAP>,
    /// Floor for new arrivals; tracks the leftmost task's vruntime.
    pub min_vruntime: u64,
    /// Sum of queued tasks' weights.
    pub load_weight: u64,
    /// Number of queued tasks.
    pub nr_running: u32,
}

impl RunQueue {
    pub const fn new() -> Self {
        Self {
            tree: RbTree::new(),
            min_vruntime: 0,
            load_weight: 0,
            nr_running: 0,
        }
    }

    /// Insert a READY task. New arrivals are clamped up to `min_vruntime`;
    /// non-READY tasks are refused (no-op).
    pub fn enqueue(&mut self, tid: TaskId, task: &mut Task) {
        if task.state != super::task::TaskState::Ready || task.is_queued() {
            return;
        }
        if task.vruntime < self.min_vruntime {
            task.vruntime = self.min_vruntime;
        }
        let Some(node) = self.tree.insert(task.vruntime, tid) else {
            log::error!("sched: run-queue node pool exhausted for pid {}", task.pid);
            return;
        };
        task.rq_node = Some(node);
        self.load_weight += weight_of(task.nice);
        self.nr_running += 1;
    }

    /// Remove a task. Harmless no-op when the task is not queued.
    pub fn dequeue(&mut self, task: &mut Task) {
        let Some(node) = task.rq_node.take() else {
            return;
        };
        self.tree.remove(node);
        self.load_weight = self.load_weight.saturating_sub(weight_of(task.nice));
        self.nr_running = self.nr_running.saturating_sub(1);
    }

    /// The queued task with the smallest vruntime, without removing it.
    pub fn pick_next(&self) -> Option<TaskId> {
        self.tree.leftmost().map(|node| self.tree.value(node))
    }

    /// Charge physical time since the task's last charge as scaled virtual
    /// time, then refresh `min_vruntime`.
    pub fn update_curr(&mut self, task: &mut Task, now: u64) {
        let delta = now.saturating_sub(task.last_charge_ns);
        if delta == 0 {
            return;
        }
        task.last_charge_ns = now;

        let load = self.load_weight.max(NICE_0_WEIGHT);
        task.vruntime += delta * NICE_0_WEIGHT / load;

        self.min_vruntime = match self.tree.leftmost() {
            Some(node) => self.tree.key(node),
            None => task.vruntime,
        };
    }

    /// Slice for `task` under the current load: a weight-proportional share
    /// of the latency target, clamped.
    pub fn calc_slice(&self, task: &Task) -> u64 {
        if self.nr_running == 0 {
            return DEFAULT_SLICE_NS;
        }
        let load = self.load_weight.max(NICE_0_WEIGHT);
        let slice = TARGET_LATENCY_NS * weight_of(task.nice) / load;
        slice.clamp(MIN_GRANULARITY_NS, MAX_SLICE_NS)
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::super::task::{Task, TaskState};
    use super::*;

    fn ready(pid: i32, nice: i32) -> Task {
        Task::blank(pid, TaskState::Ready, nice)
    }

    #[test]
    fn weight_table_anchors() {
        assert_eq!(weight_of(0), 1024);
        assert_eq!(weight_of(-20), 88761);
        assert_eq!(weight_of(19), 15);
        // Out-of-range values clamp.
        assert_eq!(weight_of(-100), 88761);
        assert_eq!(weight_of(100), 15);
    }

    #[test]
    fn set_nice_clamps() {
        let mut t = ready(1, 0);
        set_nice(&mut t, 25);
        assert_eq!(t.nice, 19);
        set_nice(&mut t, -33);
        assert_eq!(t.nice, -20);
        set_nice(&mut t, 5);
        assert_eq!(t.nice, 5);
    }

    #[test]
    fn pick_next_is_lowest_vruntime() {
        let mut rq = RunQueue::new();
        let mut a = ready(1, 0);
        let mut b = ready(2, 0);
        let mut c = ready(3, 0);
        a.vruntime = 300;
        b.vruntime = 100;
        c.vruntime = 200;
        rq.enqueue(TaskId(0), &mut a);
        rq.enqueue(TaskId(1), &mut b);
        rq.enqueue(TaskId(2), &mut c);

        assert_eq!(rq.nr_running, 3);
        assert_eq!(rq.load_weight, 3 * 1024);
        assert_eq!(rq.pick_next(), Some(TaskId(1)));

        rq.dequeue(&mut b);
        assert_eq!(rq.pick_next(), Some(TaskId(2)));
        assert!(!b.is_queued());
    }

    #[test]
    fn dequeue_absent_is_noop() {
        let mut rq = RunQueue::new();
        let mut a = ready(1, 0);
        rq.dequeue(&mut a);
        assert_eq!(rq.nr_running, 0);
        assert_eq!(rq.load_weight, 0);
    }

    #[test]
    fn enqueue_clamps_stale_vruntime() {
        let mut rq = RunQueue::new();
        let mut a = ready(1, 0);
        a.vruntime = 10_000_000;
        rq.enqueue(TaskId(0), &mut a);
        // Advance the floor past the incumbent's key.
        rq.min_vruntime = 10_000_000;

        let mut b = ready(2, 0);
        b.vruntime = 5; // ancient clock
        rq.enqueue(TaskId(1), &mut b);
        assert_eq!(b.vruntime, 10_000_000);
    }

    #[test]
    fn update_curr_scales_by_load() {
        let mut rq = RunQueue::new();
        let mut running = ready(1, 0);
        running.state = TaskState::Running;
        running.last_charge_ns = 1000;

        // Empty queue: load floor is NICE_0, so the charge is 1:1.
        rq.update_curr(&mut running, 2000);
        assert_eq!(running.vruntime, 1000);
        assert_eq!(running.last_charge_ns, 2000);
        assert_eq!(rq.min_vruntime, 1000);

        // With 2048 weight queued, the same wall time charges half.
        let mut x = ready(2, 0);
        let mut y = ready(3, 0);
        x.vruntime = 500;
        y.vruntime = 900;
        rq.enqueue(TaskId(1), &mut x);
        rq.enqueue(TaskId(2), &mut y);
        rq.update_curr(&mut running, 3000);
        assert_eq!(running.vruntime, 1000 + 500);
        // min_vruntime now tracks the leftmost queued task.
        assert_eq!(rq.min_vruntime, 500);
    }

    #[test]
    fn update_curr_zero_delta_is_noop() {
        let mut rq = RunQueue::new();
        let mut t = ready(1, 0);
        t.state = TaskState::Running;
        t.last_charge_ns = 500;
        t.vruntime = 77;
        rq.update_curr(&mut t, 500);
        assert_eq!(t.vruntime, 77);
    }

    #[test]
    fn heavier_task_accrues_less_vruntime() {
        let mut rq = RunQueue::new();
        let mut filler = ready(9, 0);
        rq.enqueue(TaskId(5), &mut filler);

        let mut nice0 = ready(1, 0);
        nice0.state = TaskState::Running;
        let mut nice_neg = ready(2, -5);
        nice_neg.state = TaskState::Running;

        rq.update_curr(&mut nice0, 1_000_000);
        // Same elapsed time, same load; vruntime charge is identical
        // regardless of the task's own weight (the charge scales by queue
        // load, the *slice* scales by task weight).
        let v0 = nice0.vruntime;
        rq.update_curr(&mut nice_neg, 1_000_000);
        assert_eq!(v0, nice_neg.vruntime);

        // The slice, by contrast, favors the heavier task.
        assert!(rq.calc_slice(&nice_neg) > rq.calc_slice(&nice0));
    }

    #[test]
    fn calc_slice_clamps() {
        let mut rq = RunQueue::new();
        let t = ready(1, 0);
        // Empty queue: default slice.
        assert_eq!(rq.calc_slice(&t), DEFAULT_SLICE_NS);

        // One nice-0 task: full latency target, clamped only by bounds.
        let mut a = ready(2, 0);
        rq.enqueue(TaskId(0), &mut a);
        assert_eq!(rq.calc_slice(&t), TARGET_LATENCY_NS);

        // Heavily loaded queue: the slice floors at MIN_GRANULARITY.
        let mut heavy = ready(3, -20);
        let mut heavy2 = ready(4, -20);
        rq.enqueue(TaskId(1), &mut heavy);
        rq.enqueue(TaskId(2), &mut heavy2);
        let weak = ready(5, 19);
        assert_eq!(rq.calc_slice(&weak), MIN_GRANULARITY_NS);
    }

    #[test]
    fn wmult_matches_weight_reciprocals() {
        // Spot-check the reciprocal table: wmult[i] ~= 2^32 / weight[i].
        for i in [0usize, 20, 39] {
            let product = u64::from(NICE_TO_WEIGHT[i]) * u64::from(NICE_TO_WMULT[i]);
            let err = product.abs_diff(1u64 << 32);
            assert!(err < (1u64 << 32) / 100, "entry {} off by {}", i, err);
        }
    }
}
