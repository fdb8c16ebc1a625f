/*
 * Thread Records
 *
 * A thread is identified everywhere by its ThreadId; the records
 * themselves live in the scheduler's thread table. Run-queues, wait
 * queues, and per-CPU slots store ids only, and a thread's current
 * queue is derived from its recorded scope rather than a back-pointer.
 *
 * The per-policy scheduling parameters are a tagged enum: each policy
 * matches out its own variant, so there is no opaque byte blob to cast.
 */

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use heapless::String;

use crate::arch::x86_64::context::InterruptContext;
use crate::config::{CONFIG_RR_SLICE_MS, CONFIG_THREAD_STACK_SIZE, NAME_MAX, SCHED_PRIO_MAX, msecs_to_ticks};
use crate::sched::cpu::{CpuId, CpuSet, GroupId};
use crate::sched::mutex::MutexId;
use crate::sched::policy::PolicyId;
use crate::time::timer::TimerId;

/// Thread identifier. Id 0 is never assigned ("no thread").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread-{}", self.0)
    }
}

/// Thread lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// On a run-queue, waiting to be dispatched.
    Ready,
    /// Owning a CPU right now.
    Running,
    /// Waiting on an event (mutex, join, ...).
    Pending,
    /// Gave up the CPU for a while (sleep).
    Delay,
    /// Held off the CPU by suspend().
    Suspended,
    /// Armed with an asynchronous cancel; dies at next dispatch.
    CancelArmed,
    /// Running its cancellation path.
    Canceling,
    /// Ran to completion; waiting to be joined.
    Completed,
    /// Reaped or killed; record pending destruction.
    Terminated,
}

/// What a blocked thread is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    Mutex(MutexId),
    Join(ThreadId),
    Sleep(TimerId),
    /// The zombie reaper waiting for work.
    Reaper,
}

/// Why a blocked thread was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// Not woken yet.
    None,
    /// The awaited event happened.
    Woken,
    /// A timed wait expired.
    TimedOut,
    /// The wait was canceled.
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelType {
    Deferred,
    Async,
}

/// Retval of a canceled thread; matches no legitimate return value.
pub const CANCELED_RETVAL: usize = usize::MAX;

/// Per-policy scheduling parameters, keyed by the thread's policy.
#[derive(Debug, Clone, Copy)]
pub enum SchedParam {
    Fifo {
        priority: u8,
    },
    Rr {
        priority: u8,
        /// Full slice, in ticks.
        time_slice: u32,
        /// Unexpired part of the current slice, in ticks.
        remain_slice: u32,
    },
}

impl SchedParam {
    pub fn priority(&self) -> u8 {
        match *self {
            SchedParam::Fifo { priority } => priority,
            SchedParam::Rr { priority, .. } => priority,
        }
    }

    pub fn set_priority(&mut self, prio: u8) {
        match self {
            SchedParam::Fifo { priority } => *priority = prio,
            SchedParam::Rr { priority, .. } => *priority = prio,
        }
    }

    pub fn policy_id(&self) -> PolicyId {
        match self {
            SchedParam::Fifo { .. } => PolicyId::Fifo,
            SchedParam::Rr { .. } => PolicyId::Rr,
        }
    }
}

/// Which run-queue a Ready thread is sitting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunqScope {
    Cpu(CpuId),
    Group(GroupId),
    System,
}

/// Spawn-time attributes.
#[derive(Debug, Clone)]
pub struct ThreadAttr {
    pub name: &'static str,
    pub policy: PolicyId,
    pub priority: u8,
    /// RR time slice in milliseconds; ignored by FIFO.
    pub time_slice_ms: u64,
    pub stack_size: usize,
    pub affinity: CpuSet,
    pub detached: bool,
    /// Start in Suspended state; released by resume().
    pub start_suspended: bool,
    pub use_fpu: bool,
}

impl Default for ThreadAttr {
    fn default() -> ThreadAttr {
        ThreadAttr {
            name: "thread",
            policy: PolicyId::Rr,
            priority: SCHED_PRIO_MAX / 2,
            time_slice_ms: CONFIG_RR_SLICE_MS,
            stack_size: CONFIG_THREAD_STACK_SIZE,
            affinity: CpuSet::all(),
            detached: false,
            start_suspended: false,
            use_fpu: false,
        }
    }
}

impl ThreadAttr {
    /// The initial scheduling parameter block for this attribute set.
    pub fn sched_param(&self) -> SchedParam {
        match self.policy {
            PolicyId::Fifo => SchedParam::Fifo {
                priority: self.priority,
            },
            PolicyId::Rr => {
                let slice = msecs_to_ticks(self.time_slice_ms);
                SchedParam::Rr {
                    priority: self.priority,
                    time_slice: slice,
                    remain_slice: slice,
                }
            }
        }
    }
}

/// Lazily saved x87/SSE state, 16-byte aligned for fxsave64.
#[repr(C, align(16))]
pub struct FpuState(pub [u8; 512]);

impl FpuState {
    pub fn new() -> Box<FpuState> {
        Box::new(FpuState([0; 512]))
    }
}

/// Cleanup handler pushed by a thread; runs LIFO at completion or
/// cancellation.
pub type CleanupHandler = Box<dyn FnOnce() + Send>;

/// The thread record.
pub struct Thread {
    pub name: String<NAME_MAX>,
    pub id: ThreadId,
    pub state: ThreadState,

    /// CPU the thread last ran (or is running) on.
    pub cpu_idx: CpuId,
    /// CPUs the thread may run on (empty = local only, full = any).
    pub affinity: CpuSet,
    /// True while the thread's register state is live on a CPU (between
    /// dispatch and context save). Guards the wake-vs-switch-out race.
    pub on_cpu: bool,

    pub policy_id: PolicyId,
    pub sched_param: SchedParam,
    /// The run-queue the thread is enqueued on, when Ready.
    pub runq_scope: Option<RunqScope>,

    pub wait_target: Option<WaitTarget>,
    pub wait_status: WaitStatus,

    /// Saved execution context. Boxed so the pointer handed to the
    /// context-switch path stays stable while the table rebalances.
    pub context: Box<InterruptContext>,
    /// Kernel stack; None for threads running on a stack the scheduler
    /// does not own (the boot flow, AP bootstrap flows).
    pub stack: Option<Box<[u8]>>,
    pub stack_size: usize,
    /// Free the stack when the record is reaped.
    pub free_stack_on_exit: bool,

    pub use_fpu: bool,
    pub fpu_state: Option<Box<FpuState>>,

    pub sig_pending: u64,
    pub sig_blocked: u64,

    pub cleanup: Vec<CleanupHandler>,
    pub owned_mutexes: Vec<MutexId>,

    pub cancel_state: CancelState,
    pub cancel_type: CancelType,
    pub cancel_pending: bool,

    /// Thread waiting in join() for this one, if any.
    pub joiner: Option<ThreadId>,
    pub retval: usize,
    pub detached: bool,

    /// Total run time, nanoseconds.
    pub cycles: u64,
    /// Monotonic timestamp of the last dispatch.
    pub resume_cycle: u64,

    /// Idle threads never sit on run-queues.
    pub is_idle: bool,
}

impl Thread {
    pub fn new(
        id: ThreadId,
        name: &str,
        attr: &ThreadAttr,
        context: Box<InterruptContext>,
        stack: Option<Box<[u8]>>,
    ) -> Thread {
        let mut owned: String<NAME_MAX> = String::new();
        let _ = owned.push_str(name);
        Thread {
            name: owned,
            id,
            state: ThreadState::Ready,
            cpu_idx: 0,
            affinity: attr.affinity,
            on_cpu: false,
            policy_id: attr.policy,
            sched_param: attr.sched_param(),
            runq_scope: None,
            wait_target: None,
            wait_status: WaitStatus::None,
            context,
            stack,
            stack_size: attr.stack_size,
            free_stack_on_exit: true,
            use_fpu: attr.use_fpu,
            fpu_state: None,
            sig_pending: 0,
            sig_blocked: 0,
            cleanup: Vec::new(),
            owned_mutexes: Vec::new(),
            cancel_state: CancelState::Enabled,
            cancel_type: CancelType::Deferred,
            cancel_pending: false,
            joiner: None,
            retval: 0,
            detached: attr.detached,
            cycles: 0,
            resume_cycle: 0,
            is_idle: false,
        }
    }

    /// Is the thread in a state that can sit on a run-queue?
    pub fn is_runnable(&self) -> bool {
        matches!(self.state, ThreadState::Ready | ThreadState::CancelArmed)
    }
}

/// Point-in-time view of a thread, for diagnostics.
#[derive(Debug, Clone)]
pub struct ThreadStats {
    pub id: ThreadId,
    pub name: String<NAME_MAX>,
    pub state: ThreadState,
    pub policy: PolicyId,
    pub priority: u8,
    pub cpu_idx: CpuId,
    pub run_ns: u64,
}
