/*
 * SCHED_RR Policy
 *
 * Strict priority with per-thread timeslices. Same queues and placement
 * rules as SCHED_FIFO; additionally every running RR thread burns one
 * tick of its remaining slice per clock tick, and at exhaustion the
 * slice is reloaded and the thread rotates to the tail of its priority's
 * queue. A thread preempted mid-slice resumes with the unexpired
 * remainder, not a fresh slice.
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
    static ref RR_SYS_RUNQ: RunQueue = RunQueue::new("RR_RUNQ_SYS");
    static ref RR_CPU_RUNQS: Vec<RunQueue> = (0..CONFIG_NR_CPUS)
        .map(|idx| RunQueue::new(&format!("RR_RUNQ_CPU{}", idx)))
        .collect();
}

pub struct RrPolicy;

static RR_POLICY: RrPolicy = RrPolicy;

/// The SCHED_RR singleton.
pub fn policy() -> &'static dyn SchedPolicy {
    &RR_POLICY
}

impl SchedPolicy for RrPolicy {
    fn id(&self) -> PolicyId {
        PolicyId::Rr
    }

    fn name(&self) -> &'static str {
        "SCHED_RR"
    }

    fn precedence(&self) -> usize {
        0
    }

    fn priority_limits(&self) -> (u8, u8) {
        (SCHED_PRIO_MIN, SCHED_PRIO_MAX)
    }

    fn sys_runq(&self) -> &'static RunQueue {
        &RR_SYS_RUNQ
    }

    fn cpu_runq(&self, cpu: CpuId) -> &'static RunQueue {
        &RR_CPU_RUNQS[cpu]
    }

    fn attach_cpu_group(&self, group: &CpuGroup) -> Arc<RunQueue> {
        group.attach_runq(PolicyId::Rr, &format!("RR_RUNQ_CPU_GROUP{}", group.id))
    }

    fn clock_tick(&self, param: &mut SchedParam) -> bool {
        match param {
            SchedParam::Rr {
                time_slice,
                remain_slice,
                ..
            } => {
                *remain_slice = remain_slice.saturating_sub(1);
                if *remain_slice == 0 {
                    *remain_slice = *time_slice;
                    return true;
                }
                false
            }
            // A thread under another policy never rotates here.
            _ => false,
        }
    }

    fn default_param(&self, attr: &ThreadAttr) -> SchedParam {
        let slice = crate::config::msecs_to_ticks(attr.time_slice_ms);
        SchedParam::Rr {
            priority: attr.priority.clamp(SCHED_PRIO_MIN, SCHED_PRIO_MAX),
            time_slice: slice,
            remain_slice: slice,
        }
    }
}
