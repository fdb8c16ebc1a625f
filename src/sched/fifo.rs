/*
 * SCHED_FIFO Policy
 *
 * Strict priority, no timeslicing. Threads of the same priority run in
 * queue order until they block, yield, or a higher-priority thread
 * preempts them; the tick never rotates a FIFO thread in favor of an
 * equal- or lower-priority one.
 *
 * List placement follows the POSIX rules shared with SCHED_RR:
 * ready-from-blocked and yield go to the tail, a preempted thread goes
 * back to the head, priority raises re-enqueue at the tail of the new
 * priority and priority lowers at its head.
 */

use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;

use lazy_static::lazy_static;

use crate::config::{CONFIG_NR_CPUS, SCHED_PRIO_MAX, SCHED_PRIO_MIN};
use crate::sched::cpu::{CpuGroup, CpuId};
use crate::sched::policy::{PolicyId, SchedPolicy};
use crate::sched::runq::RunQueue;
use crate::sched::thread::{SchedParam, ThreadAttr};

lazy_static! {
    static ref FIFO_SYS_RUNQ: RunQueue = RunQueue::new("FIFO_RUNQ_SYS");
    static ref FIFO_CPU_RUNQS: Vec<RunQueue> = (0..CONFIG_NR_CPUS)
        .map(|idx| RunQueue::new(&format!("FIFO_RUNQ_CPU{}", idx)))
        .collect();
}

pub struct FifoPolicy;

static FIFO_POLICY: FifoPolicy = FifoPolicy;

/// The SCHED_FIFO singleton.
pub fn policy() -> &'static dyn SchedPolicy {
    &FIFO_POLICY
}

impl SchedPolicy for FifoPolicy {
    fn id(&self) -> PolicyId {
        PolicyId::Fifo
    }

    fn name(&self) -> &'static str {
        "SCHED_FIFO"
    }

    fn precedence(&self) -> usize {
        1
    }

    fn priority_limits(&self) -> (u8, u8) {
        (SCHED_PRIO_MIN, SCHED_PRIO_MAX)
    }

    fn sys_runq(&self) -> &'static RunQueue {
        &FIFO_SYS_RUNQ
    }

    fn cpu_runq(&self, cpu: CpuId) -> &'static RunQueue {
        &FIFO_CPU_RUNQS[cpu]
    }

    fn attach_cpu_group(&self, group: &CpuGroup) -> Arc<RunQueue> {
        group.attach_runq(
            PolicyId::Fifo,
            &format!("FIFO_RUNQ_CPU_GROUP{}", group.id),
        )
    }

    fn clock_tick(&self, _param: &mut SchedParam) -> bool {
        // No timeslicing: the running FIFO thread keeps the CPU.
        false
    }

    fn default_param(&self, attr: &ThreadAttr) -> SchedParam {
        SchedParam::Fifo {
            priority: attr.priority.clamp(SCHED_PRIO_MIN, SCHED_PRIO_MAX),
        }
    }
}
