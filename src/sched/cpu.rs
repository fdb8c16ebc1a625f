/*
 * Per-CPU State and CPU Groups
 *
 * Every CPU owns one fixed SchedCpu record: the threads bound to it
 * (current, previous, idle, FPU owner), a need-reschedule flag, and a
 * lock. Only the owning CPU writes `current`; remote CPUs read it
 * atomically when deciding whether a wakeup warrants an IPI.
 *
 * A CpuSet is a bitmap of CPU indices. The empty set means "local CPU
 * only" and the full set means "any CPU"; anything in between names an
 * explicit affinity group. Interning a set yields a CpuGroup: a shared,
 * immutable record with a stable id and one lazily attached run-queue per
 * scheduling policy. Two equal sets always intern to the same group.
 */

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Mutex;

use crate::config::CONFIG_NR_CPUS;
use crate::sched::policy::PolicyId;
use crate::sched::runq::RunQueue;

pub type CpuId = usize;
pub type GroupId = u64;

/// Monotonic per-CPU clock identifier (the only clock this kernel keeps).
pub const CLOCK_MONOTONIC: u32 = 1;

/// Bitmap of CPU indices. CONFIG_NR_CPUS is capped at 64 so one word is
/// always enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuSet(u64);

impl CpuSet {
    const FULL_MASK: u64 = if CONFIG_NR_CPUS >= 64 {
        u64::MAX
    } else {
        (1u64 << CONFIG_NR_CPUS) - 1
    };

    /// The empty set: the thread runs only on its current CPU.
    pub const fn empty() -> CpuSet {
        CpuSet(0)
    }

    /// The full set: the thread may run on every CPU.
    pub const fn all() -> CpuSet {
        CpuSet(Self::FULL_MASK)
    }

    /// A set holding exactly one CPU.
    pub const fn single(cpu: CpuId) -> CpuSet {
        CpuSet(1 << cpu)
    }

    pub fn set(&mut self, cpu: CpuId) {
        self.0 |= 1 << cpu;
    }

    pub fn clear(&mut self, cpu: CpuId) {
        self.0 &= !(1 << cpu);
    }

    pub fn is_set(&self, cpu: CpuId) -> bool {
        self.0 & (1 << cpu) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_all(&self) -> bool {
        self.0 & Self::FULL_MASK == Self::FULL_MASK
    }

    /// Raw bit pattern; the interning key.
    pub fn bits(&self) -> u64 {
        self.0
    }

    /// Lowest CPU index in the set.
    pub fn first(&self) -> Option<CpuId> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as CpuId)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        (0..CONFIG_NR_CPUS).filter(move |&cpu| self.is_set(cpu))
    }
}

/// Raw thread-id value meaning "no thread".
pub const NO_THREAD: u64 = 0;

/// One CPU's scheduling record.
pub struct SchedCpu {
    /// Serializes cross-CPU inspection of this record.
    pub lock: Mutex<()>,
    /// Thread currently on this CPU (raw ThreadId, NO_THREAD if none).
    pub current: AtomicU64,
    /// Thread that ran before the last switch.
    pub previous: AtomicU64,
    /// This CPU's idle thread.
    pub idle: AtomicU64,
    /// Thread whose state is live in the FPU.
    pub fpu_owner: AtomicU64,
    /// A reschedule was requested; honored at the next interrupt return.
    pub need_resched: AtomicBool,
    /// The CPU finished scheduler bootstrap.
    pub online: AtomicBool,
    /// Clock identity driving this CPU's tick.
    pub clock_id: AtomicU64,
}

impl SchedCpu {
    const fn new() -> SchedCpu {
        SchedCpu {
            lock: Mutex::new(()),
            current: AtomicU64::new(NO_THREAD),
            previous: AtomicU64::new(NO_THREAD),
            idle: AtomicU64::new(NO_THREAD),
            fpu_owner: AtomicU64::new(NO_THREAD),
            need_resched: AtomicBool::new(false),
            online: AtomicBool::new(false),
            clock_id: AtomicU64::new(CLOCK_MONOTONIC as u64),
        }
    }
}

static CPUS: [SchedCpu; CONFIG_NR_CPUS] = [const { SchedCpu::new() }; CONFIG_NR_CPUS];

/// The record of a CPU by index.
pub fn cpu(idx: CpuId) -> &'static SchedCpu {
    &CPUS[idx]
}

/// Index of the CPU this code is running on, from the local APIC id.
/// Before the APIC is enabled everything runs on the BSP.
pub fn current_cpu_index() -> CpuId {
    if crate::arch::x86_64::lapic::is_available() {
        let apic_id = crate::arch::x86_64::lapic::id();
        crate::arch::x86_64::smp::cpu_index_of_apic(apic_id).unwrap_or(0)
    } else {
        0
    }
}

/// The record of the CPU this code is running on.
pub fn current_cpu() -> &'static SchedCpu {
    cpu(current_cpu_index())
}

/// Initialize the per-CPU records. Runs once on the BSP before the
/// scheduler starts.
pub fn cpu_early_init() {
    CPUS[0].online.store(true, Ordering::Release);
    log::info!("cpu records initialized ({} max)", CONFIG_NR_CPUS);
}

/// Number of CPUs that completed scheduler bootstrap.
pub fn online_count() -> usize {
    CPUS.iter().filter(|c| c.online.load(Ordering::Acquire)).count()
}

/* CPU groups */

/// The interned form of a CpuSet.
pub struct CpuGroup {
    pub id: GroupId,
    pub cpu_set: CpuSet,
    /// Per-policy run-queues, attached lazily by the policies.
    runqs: Mutex<BTreeMap<PolicyId, Arc<RunQueue>>>,
}

impl CpuGroup {
    /// The group's run-queue for a policy, if that policy attached one.
    pub fn runq(&self, policy: PolicyId) -> Option<Arc<RunQueue>> {
        self.runqs.lock().get(&policy).cloned()
    }

    /// Get-or-create the group's run-queue for a policy.
    pub fn attach_runq(&self, policy: PolicyId, name: &str) -> Arc<RunQueue> {
        let mut runqs = self.runqs.lock();
        runqs
            .entry(policy)
            .or_insert_with(|| Arc::new(RunQueue::new(name)))
            .clone()
    }
}

static CPU_GROUPS: Mutex<Vec<Arc<CpuGroup>>> = Mutex::new(Vec::new());
static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(0);

/// Look up the group interned for a set.
pub fn cpu_group_find(cpu_set: CpuSet) -> Option<Arc<CpuGroup>> {
    CPU_GROUPS
        .lock()
        .iter()
        .find(|g| g.cpu_set == cpu_set)
        .cloned()
}

/// Intern a set: the first caller publishes a new group, later callers
/// with an equal set receive the same one.
pub fn cpu_group_find_or_add(cpu_set: CpuSet) -> Arc<CpuGroup> {
    let mut groups = CPU_GROUPS.lock();
    if let Some(group) = groups.iter().find(|g| g.cpu_set == cpu_set) {
        return group.clone();
    }
    let group = Arc::new(CpuGroup {
        id: NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed),
        cpu_set,
        runqs: Mutex::new(BTreeMap::new()),
    });
    groups.push(group.clone());
    log::info!(
        "cpu group {} published for set {:#x}",
        group.id,
        cpu_set.bits()
    );
    group
}

/// Snapshot of every group containing the given CPU. A CPU may belong to
/// several groups.
pub fn groups_containing(cpu: CpuId) -> Vec<Arc<CpuGroup>> {
    CPU_GROUPS
        .lock()
        .iter()
        .filter(|g| g.cpu_set.is_set(cpu))
        .cloned()
        .collect()
}
