/*
 * Scheduling Policy Interface
 *
 * A policy owns three tiers of run-queues: one for the system, one per
 * CPU, and one per CPU group it has been attached to. The registry holds
 * the policies in precedence order; `find_best_thread` walks them and,
 * per policy, the current CPU's queue, then the groups containing that
 * CPU, then the system queue. The first scope that beats the check
 * thread supplies the winner, so ties resolve CPU > group > system.
 *
 * Preemption is confined to a policy: a run-queue only claims to preempt
 * a thread scheduled under the same policy. With nothing running (the
 * check thread is None) every non-empty queue qualifies, in precedence
 * order.
 */

use alloc::sync::Arc;

use crate::sched::cpu::{self, CpuGroup, CpuId};
use crate::sched::runq::RunQueue;
use crate::sched::thread::{SchedParam, ThreadAttr};

/// Policy identifiers, in registry (precedence) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PolicyId {
    Rr,
    Fifo,
}

/// The policy interface. Implementations are process-lifetime singletons.
pub trait SchedPolicy: Sync {
    fn id(&self) -> PolicyId;
    fn name(&self) -> &'static str;
    /// Lower precedence value is searched first.
    fn precedence(&self) -> usize;
    fn priority_limits(&self) -> (u8, u8);

    /// The system-wide run-queue.
    fn sys_runq(&self) -> &'static RunQueue;
    /// The per-CPU run-queue.
    fn cpu_runq(&self, cpu: CpuId) -> &'static RunQueue;
    /// Get-or-create this policy's run-queue on a CPU group.
    fn attach_cpu_group(&self, group: &CpuGroup) -> Arc<RunQueue>;

    /// Scheduling decision at the periodic tick for the running thread.
    /// Returns true when the thread's slice is exhausted and it must be
    /// rotated out.
    fn clock_tick(&self, param: &mut SchedParam) -> bool;

    /// Initial parameter block for a thread spawned under this policy.
    fn default_param(&self, attr: &ThreadAttr) -> SchedParam;
}

/// The registered policies in precedence order (RR first, as in the
/// policy table of the system this design follows).
pub fn policies() -> [&'static dyn SchedPolicy; 2] {
    [
        crate::sched::rr::policy(),
        crate::sched::fifo::policy(),
    ]
}

pub fn policy_by_id(id: PolicyId) -> &'static dyn SchedPolicy {
    match id {
        PolicyId::Rr => crate::sched::rr::policy(),
        PolicyId::Fifo => crate::sched::fifo::policy(),
    }
}

/// Thread-vs-thread precedence: policy precedence first, numeric
/// priority within a policy (higher value wins).
pub fn thread_precedence_compare(a: &SchedParam, b: &SchedParam) -> bool {
    let pa = policy_by_id(a.policy_id()).precedence();
    let pb = policy_by_id(b.policy_id()).precedence();
    if pa != pb {
        return pa < pb;
    }
    a.priority() > b.priority()
}

/// Find-and-claim the best runnable thread for `cpu_idx`.
///
/// `check` carries the policy and priority of the thread that would keep
/// the CPU (None when the CPU is idle or its thread is blocking). The
/// winning thread is dequeued from its run-queue before being returned.
pub fn find_best_thread(
    cpu_idx: CpuId,
    check: Option<(PolicyId, u8)>,
) -> Option<crate::sched::thread::ThreadId> {
    for policy in policies() {
        let passes = |runq: &RunQueue| -> bool {
            match check {
                None => runq.runnable() > 0,
                Some((pid, prio)) => pid == policy.id() && runq.preemption_check(Some(prio)),
            }
        };

        // Local CPU queue first.
        let runq = policy.cpu_runq(cpu_idx);
        if passes(runq) {
            if let Some((tid, _)) = runq.dequeue() {
                return Some(tid);
            }
        }

        // Then every group this CPU belongs to.
        for group in cpu::groups_containing(cpu_idx) {
            if let Some(runq) = group.runq(policy.id()) {
                if passes(&runq) {
                    if let Some((tid, _)) = runq.dequeue() {
                        return Some(tid);
                    }
                }
            }
        }

        // Finally the system queue.
        let runq = policy.sys_runq();
        if passes(runq) {
            if let Some((tid, _)) = runq.dequeue() {
                return Some(tid);
            }
        }
    }
    None
}
