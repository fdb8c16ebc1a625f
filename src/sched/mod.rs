/*
 * Scheduler Core
 *
 * Thread lifecycle, dispatch, context switching, blocking and waking,
 * and the clock-tick hook. Policies decide who runs; this module owns
 * the thread table and moves threads between states.
 *
 * DISPATCH
 *
 * Every context switch funnels through `switch_from_interrupt`, entered
 * from naked interrupt stubs (tick, voluntary yield, reschedule IPI)
 * with the interrupted thread's full register file on the stack. The
 * switch decision asks the policy layer for the best claimant against
 * the current thread; if somebody better exists the outgoing context is
 * copied into its thread record and the incoming record's saved context
 * becomes the new stack pointer for the iretq return.
 *
 * BLOCKING
 *
 * Waits follow a prepare/commit handshake so a wakeup can never be lost
 * between "decided to sleep" and "actually off the CPU":
 *
 *   prepare_wait(target)      record what we are about to wait for
 *   ... publish ourselves to the wait queue, drop its lock ...
 *   block_and_yield()         commit: Pending + switch, unless a waker
 *                             already posted a wait_status
 *   take_wait_status()        collect Woken / TimedOut / Interrupted
 *
 * Wakers that find the target still on a CPU (its context not yet
 * saved) only post the status and nudge the owning CPU; the enqueue
 * happens there. Only one waker wins: posting requires wait_status to
 * still be None.
 */

pub mod cpu;
pub mod fifo;
pub mod mutex;
pub mod policy;
pub mod rr;
pub mod runq;
pub mod thread;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Mutex as SpinLock;

use crate::arch::x86_64::context::{self, InterruptContext};
use crate::arch::x86_64::{interrupts, lapic, pic, vectors};
use crate::config::{SCHED_PRIO_MAX, SCHED_PRIO_MIN};
use crate::errno::{Errno, Result};
use crate::time::{counter, timer};

pub use cpu::{CpuId, CpuSet};
pub use policy::PolicyId;
pub use thread::{
    CANCELED_RETVAL, CancelState, CancelType, RunqScope, SchedParam, Thread, ThreadAttr,
    ThreadId, ThreadState, ThreadStats, WaitStatus, WaitTarget,
};

/// The thread table: every live thread record, keyed by id.
static THREADS: SpinLock<BTreeMap<u64, Thread>> = SpinLock::new(BTreeMap::new());

static NEXT_TID: AtomicU64 = AtomicU64::new(1);
static SCHED_ENABLED: AtomicBool = AtomicBool::new(false);

/// Terminated threads awaiting destruction by the reaper.
static ZOMBIES: SpinLock<Vec<ThreadId>> = SpinLock::new(Vec::new());
static REAPER_TID: AtomicU64 = AtomicU64::new(cpu::NO_THREAD);

/// Run a closure against the thread table with interrupts disabled.
/// Every table access in the kernel goes through here, so the table lock
/// is interrupt-safe by construction.
fn with_table<R>(f: impl FnOnce(&mut BTreeMap<u64, Thread>) -> R) -> R {
    interrupts::without_interrupts(|| {
        let mut table = THREADS.lock();
        f(&mut table)
    })
}

/// Is preemptive scheduling live?
pub fn is_enabled() -> bool {
    SCHED_ENABLED.load(Ordering::SeqCst)
}

/// Id of the thread running on this CPU.
pub fn current() -> ThreadId {
    ThreadId(cpu::current_cpu().current.load(Ordering::SeqCst))
}

/* Enqueue / dequeue plumbing */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Head,
    Tail,
}

/// Put a thread on the run-queue its affinity and policy select, and
/// record the scope on the thread. Caller holds the table lock and has
/// already set the thread Ready.
fn enqueue_locked(table: &mut BTreeMap<u64, Thread>, tid: ThreadId, placement: Placement) {
    let Some(t) = table.get_mut(&tid.0) else {
        return;
    };
    debug_assert!(t.is_runnable());
    debug_assert!(!t.is_idle);

    let pol = policy::policy_by_id(t.policy_id);
    let prio = t.sched_param.priority();

    let scope;
    let enqueue = |rq: &runq::RunQueue| match placement {
        Placement::Head => rq.enqueue_head(tid, prio),
        Placement::Tail => rq.enqueue_tail(tid, prio),
    };

    if t.affinity.is_empty() {
        scope = RunqScope::Cpu(t.cpu_idx);
        enqueue(pol.cpu_runq(t.cpu_idx));
    } else if t.affinity.is_all() {
        scope = RunqScope::System;
        enqueue(pol.sys_runq());
    } else {
        let group = cpu::cpu_group_find_or_add(t.affinity);
        scope = RunqScope::Group(group.id);
        let rq = pol.attach_cpu_group(&group);
        enqueue(&rq);
    }
    t.runq_scope = Some(scope);
}

/// Take a Ready thread off whatever run-queue it is on.
fn remove_from_runq_locked(table: &mut BTreeMap<u64, Thread>, tid: ThreadId) -> bool {
    let (scope, policy_id, prio, affinity) = {
        let Some(t) = table.get_mut(&tid.0) else {
            return false;
        };
        let Some(scope) = t.runq_scope.take() else {
            return false;
        };
        (scope, t.policy_id, t.sched_param.priority(), t.affinity)
    };
    let pol = policy::policy_by_id(policy_id);
    match scope {
        RunqScope::Cpu(idx) => pol.cpu_runq(idx).remove(tid, prio),
        RunqScope::System => pol.sys_runq().remove(tid, prio),
        RunqScope::Group(gid) => {
            // Equal sets intern to the same group, so the affinity leads
            // back to the group the thread was queued on.
            match cpu::cpu_group_find(affinity) {
                Some(group) => {
                    debug_assert_eq!(group.id, gid);
                    match group.runq(policy_id) {
                        Some(rq) => rq.remove(tid, prio),
                        None => false,
                    }
                }
                None => false,
            }
        }
    }
}

/// Decide whether a freshly enqueued thread warrants kicking a CPU, and
/// kick it. Caller holds the table lock.
fn preemption_kick_locked(table: &BTreeMap<u64, Thread>, tid: ThreadId) {
    let Some(t) = table.get(&tid.0) else {
        return;
    };
    let here = cpu::current_cpu_index();

    // Where could the thread run next? A pinned thread names its CPU;
    // anything wider is checked against the local CPU, like the
    // enqueue-preempts contract does.
    let target = if t.affinity.is_empty() {
        t.cpu_idx
    } else if t.affinity.iter().count() == 1 {
        t.affinity.first().unwrap_or(here)
    } else {
        here
    };

    let target_cpu = cpu::cpu(target);
    let cur_raw = target_cpu.current.load(Ordering::SeqCst);
    let preempts = match table.get(&cur_raw) {
        None => true,
        Some(c) if c.is_idle => true,
        // Preemption never crosses policies at a wakeup; within the
        // policy the precedence comparison decides.
        Some(c) => {
            c.policy_id == t.policy_id
                && policy::thread_precedence_compare(&t.sched_param, &c.sched_param)
        }
    };

    if preempts {
        target_cpu.need_resched.store(true, Ordering::SeqCst);
        if target != here && target_cpu.online.load(Ordering::SeqCst) {
            lapic::send_ipi(
                crate::arch::x86_64::smp::apic_id_of(target),
                vectors::IPI_RESCHEDULE,
            );
        }
    }
}

/* Wait / wake protocol */

/// Phase one of blocking: record what the current thread is about to
/// wait for. The thread keeps running until `block_and_yield`.
pub fn prepare_wait(target: WaitTarget) {
    let tid = current();
    with_table(|table| {
        if let Some(t) = table.get_mut(&tid.0) {
            t.wait_target = Some(target);
            t.wait_status = WaitStatus::None;
        }
    });
}

/// Abandon a prepared wait (the resource turned out to be free).
pub fn cancel_wait() {
    let tid = current();
    with_table(|table| {
        if let Some(t) = table.get_mut(&tid.0) {
            t.wait_target = None;
            t.wait_status = WaitStatus::None;
        }
    });
}

/// Phase two: actually block. If a waker already posted a status during
/// the window since `prepare_wait`, the block is skipped entirely.
pub fn block_and_yield() {
    let tid = current();
    let committed = with_table(|table| {
        let Some(t) = table.get_mut(&tid.0) else {
            return false;
        };
        if t.wait_status != WaitStatus::None {
            // Wake arrived before we got off the CPU.
            return false;
        }
        t.state = match t.wait_target {
            Some(WaitTarget::Sleep(_)) => ThreadState::Delay,
            _ => ThreadState::Pending,
        };
        true
    });
    if committed {
        yield_to_scheduler();
    }
}

/// Collect and clear the wait outcome after returning from a block.
pub fn take_wait_status() -> WaitStatus {
    let tid = current();
    with_table(|table| {
        let Some(t) = table.get_mut(&tid.0) else {
            return WaitStatus::None;
        };
        let status = t.wait_status;
        t.wait_status = WaitStatus::None;
        t.wait_target = None;
        status
    })
}

/// What a thread is currently waiting for.
pub fn wait_target_of(tid: ThreadId) -> Option<WaitTarget> {
    with_table(|table| table.get(&tid.0).and_then(|t| t.wait_target))
}

/// Wake a blocked thread with the given status.
///
/// `expect` guards against stale wakers: when given, the thread's
/// recorded wait target must match or the wake is dropped. Returns
/// whether this call delivered the wake.
pub fn wake(tid: ThreadId, status: WaitStatus, expect: Option<WaitTarget>) -> bool {
    let delivered = with_table(|table| {
        let Some(t) = table.get_mut(&tid.0) else {
            return false;
        };
        if let Some(expected) = expect {
            if t.wait_target != Some(expected) {
                return false;
            }
        }
        if t.wait_status != WaitStatus::None {
            // Somebody else (timeout, cancel) claimed this wait already.
            return false;
        }
        t.wait_status = status;

        match t.state {
            ThreadState::Pending | ThreadState::Delay => {
                t.state = ThreadState::Ready;
                if t.on_cpu {
                    // Context still live on its CPU; that CPU finishes
                    // the transition at its next dispatch.
                    let idx = t.cpu_idx;
                    cpu::cpu(idx).need_resched.store(true, Ordering::SeqCst);
                    if idx != cpu::current_cpu_index() {
                        lapic::send_ipi(
                            crate::arch::x86_64::smp::apic_id_of(idx),
                            vectors::IPI_RESCHEDULE,
                        );
                    }
                } else {
                    enqueue_locked(table, tid, Placement::Tail);
                    preemption_kick_locked(table, tid);
                }
                true
            }
            // Pre-block wake: the status handshake is enough, the thread
            // never leaves the CPU.
            _ => true,
        }
    });
    delivered
}

/* Context switch */

/// Trigger the yield software interrupt. The actual switch happens in
/// the interrupt path so the full register file is captured uniformly.
fn yield_to_scheduler() {
    if !is_enabled() {
        return;
    }
    if !interrupts::are_enabled() {
        // Inside a critical section; the pending need_resched flag will
        // be honored at the next interrupt return instead.
        return;
    }
    unsafe {
        core::arch::asm!("int 0x81", options(nostack));
    }
}

/// Voluntarily hand the CPU to the next ready thread; the caller goes to
/// the tail of its priority queue.
pub fn yield_now() {
    yield_to_scheduler();
}

/// Ask for a scheduling decision: switch only if somebody strictly
/// better is runnable.
pub fn reschedule() {
    if !is_enabled() || !interrupts::are_enabled() {
        return;
    }
    unsafe {
        core::arch::asm!("int 0x82", options(nostack));
    }
}

/// The single switch decision point, called from the naked interrupt
/// stubs with interrupts disabled and the interrupted context at `ctx`.
/// Returns the context to resume (possibly the same one).
#[unsafe(no_mangle)]
pub extern "C" fn switch_from_interrupt(
    ctx: *mut InterruptContext,
    vector: u64,
) -> *const InterruptContext {
    let vector = vector as u8;

    // Interrupt-source housekeeping first: tick delivery and EOI.
    match vector {
        v if v == vectors::PIT_TIMER => {
            crate::arch::x86_64::pit::PIT_EVENTER.dispatch();
            pic::end_of_interrupt(vector);
        }
        v if v == vectors::LAPIC_TIMER => {
            lapic::LAPIC_TIMER_EVENTER.dispatch();
            lapic::eoi();
        }
        v if v == vectors::IPI_RESCHEDULE => {
            lapic::eoi();
            cpu::current_cpu().need_resched.store(true, Ordering::SeqCst);
        }
        _ => {} // software vectors: no EOI
    }

    if !is_enabled() {
        return ctx;
    }

    let cpu_idx = cpu::current_cpu_index();
    let cpu_rec = cpu::cpu(cpu_idx);
    let voluntary = vector == vectors::YIELD;
    let requested = cpu_rec.need_resched.swap(false, Ordering::SeqCst) || voluntary
        || vector == vectors::RESCHED_SOFT;

    if !requested {
        return ctx;
    }

    let mut guard = THREADS.lock();
    dispatch_locked(&mut guard, cpu_idx, ctx, voluntary)
}

/// Pick the next thread and switch contexts. Caller holds the table
/// lock with interrupts disabled.
fn dispatch_locked(
    table: &mut BTreeMap<u64, Thread>,
    cpu_idx: CpuId,
    ctx: *mut InterruptContext,
    voluntary: bool,
) -> *const InterruptContext {
    let cpu_rec = cpu::cpu(cpu_idx);
    let cur_tid = ThreadId(cpu_rec.current.load(Ordering::SeqCst));

    // Work out the comparison thread and handle the voluntary rotation.
    let mut check: Option<(PolicyId, u8)> = None;
    let cur_info = table
        .get(&cur_tid.0)
        .map(|t| (t.state, t.is_idle, t.policy_id, t.sched_param.priority()));
    if let Some((ThreadState::Running, false, pid, prio)) = cur_info {
        if voluntary {
            // Yield: tail of our priority, then an open pick.
            if let Some(t) = table.get_mut(&cur_tid.0) {
                t.state = ThreadState::Ready;
            }
            enqueue_locked(table, cur_tid, Placement::Tail);
        } else {
            check = Some((pid, prio));
        }
    }

    let next_tid = match policy::find_best_thread(cpu_idx, check) {
        Some(tid) => tid,
        None => {
            // Nobody better. A still-Running current keeps the CPU;
            // anything else falls back to this CPU's idle thread.
            let keep = table
                .get(&cur_tid.0)
                .map(|t| t.state == ThreadState::Running)
                .unwrap_or(false);
            if keep {
                return ctx;
            }
            ThreadId(cpu_rec.idle.load(Ordering::SeqCst))
        }
    };

    if next_tid == cur_tid {
        // Won our own rotation; nothing to switch.
        if let Some(t) = table.get_mut(&cur_tid.0) {
            t.runq_scope = None;
            t.state = ThreadState::Running;
        }
        return ctx;
    }

    let now = counter::get_monotonic_ns();

    // Save the outgoing thread.
    let mut outgoing_enqueue = None;
    if let Some(cur) = table.get_mut(&cur_tid.0) {
        unsafe {
            *cur.context = *ctx;
        }
        cur.on_cpu = false;
        cur.cycles += now.saturating_sub(cur.resume_cycle);
        match cur.state {
            ThreadState::Running => {
                // Involuntary preemption: head of the priority queue.
                cur.state = ThreadState::Ready;
                if !cur.is_idle {
                    outgoing_enqueue = Some(Placement::Head);
                }
            }
            ThreadState::Ready => {
                // Queued already by a slice rotation, or flipped back by
                // a wake that raced the switch-out.
                if cur.runq_scope.is_none() && !cur.is_idle {
                    outgoing_enqueue = Some(Placement::Head);
                }
            }
            ThreadState::CancelArmed => {
                // Must be dispatched once more to die.
                outgoing_enqueue = Some(Placement::Head);
            }
            // Pending/Delay/Suspended/Completed/...: stays off-queue.
            _ => {}
        }
    }
    if let Some(placement) = outgoing_enqueue {
        enqueue_locked(table, cur_tid, placement);
    }

    // Bring in the winner.
    let next = table
        .get_mut(&next_tid.0)
        .expect("dispatched thread vanished from the table");
    next.runq_scope = None;
    next.cpu_idx = cpu_idx;
    next.on_cpu = true;
    next.resume_cycle = now;

    if next.state == ThreadState::CancelArmed {
        // Asynchronous cancellation: instead of resuming where it was
        // interrupted, the thread runs its cancel path. Its stack below
        // the saved rsp is abandoned; the whole stack is reclaimed at
        // reap time.
        next.state = ThreadState::Canceling;
        next.context.iret_frame.rip = thread_cancel_entry as usize as u64;
    } else {
        next.state = ThreadState::Running;
    }

    let next_ctx = &*next.context as *const InterruptContext;

    cpu_rec.previous.store(cur_tid.0, Ordering::SeqCst);
    cpu_rec.current.store(next_tid.0, Ordering::SeqCst);

    // Lazy FPU: arm the device-not-available trap unless the incoming
    // thread already owns the FPU.
    if cpu_rec.fpu_owner.load(Ordering::SeqCst) == next_tid.0 {
        context::fpu_clear_ts();
    } else {
        context::fpu_set_ts();
    }

    next_ctx
}

/* Clock tick hook */

/// Scheduler part of the periodic tick: accounting plus the policy's
/// slice decision for the running thread. Runs in interrupt context.
pub fn sched_clock_tick() {
    if !is_enabled() {
        return;
    }
    let cpu_idx = cpu::current_cpu_index();
    let cpu_rec = cpu::cpu(cpu_idx);
    let cur_tid = ThreadId(cpu_rec.current.load(Ordering::SeqCst));

    with_table(|table| {
        let rotate = {
            let Some(t) = table.get_mut(&cur_tid.0) else {
                return;
            };
            if t.is_idle {
                // Anything runnable beats idle; let dispatch look.
                cpu_rec.need_resched.store(true, Ordering::SeqCst);
                return;
            }
            if t.state != ThreadState::Running {
                return;
            }
            let pol = policy::policy_by_id(t.policy_id);
            if pol.clock_tick(&mut t.sched_param) {
                t.state = ThreadState::Ready;
                true
            } else {
                false
            }
        };
        if rotate {
            // Slice exhausted: rotate to the tail, reschedule.
            enqueue_locked(table, cur_tid, Placement::Tail);
            cpu_rec.need_resched.store(true, Ordering::SeqCst);
        }
    });
}

/* Thread lifecycle */

extern "C" fn thread_trampoline(entry: extern "C" fn(usize) -> usize, arg: usize) -> ! {
    let retval = entry(arg);
    thread_exit(retval);
}

/// Entry point a CancelArmed thread is redirected into at dispatch.
extern "C" fn thread_cancel_entry() -> ! {
    thread_exit(CANCELED_RETVAL);
}

fn allocate_tid() -> ThreadId {
    ThreadId(NEXT_TID.fetch_add(1, Ordering::SeqCst))
}

/// Build the initial interrupt context for a fresh thread: as if it was
/// interrupted the moment before its first instruction.
fn initial_context(
    rip: u64,
    stack_top: u64,
    rdi: u64,
    rsi: u64,
) -> Box<InterruptContext> {
    let mut ctx = Box::new(InterruptContext::default());
    ctx.iret_frame.rip = rip;
    // Looks like a post-call frame, which keeps the ABI's 16-byte stack
    // alignment contract at the entry function's prologue.
    ctx.iret_frame.rsp = (stack_top & !0xF) - 8;
    ctx.rdi = rdi;
    ctx.rsi = rsi;
    ctx
}

/// Create a thread. It becomes Ready immediately (or Suspended when the
/// attributes say so) and may preempt the caller.
pub fn spawn(
    attr: &ThreadAttr,
    entry: extern "C" fn(usize) -> usize,
    arg: usize,
) -> Result<ThreadId> {
    if attr.priority < SCHED_PRIO_MIN || attr.priority > SCHED_PRIO_MAX {
        return Err(Errno::InvalidArgument);
    }
    if attr.stack_size < 4096 {
        return Err(Errno::InvalidArgument);
    }

    let stack = vec![0u8; attr.stack_size].into_boxed_slice();
    let stack_top = stack.as_ptr() as u64 + attr.stack_size as u64;

    let ctx = initial_context(
        thread_trampoline as usize as u64,
        stack_top,
        entry as usize as u64,
        arg as u64,
    );

    let tid = allocate_tid();
    let mut t = Thread::new(tid, attr.name, attr, ctx, Some(stack));
    if attr.start_suspended {
        t.state = ThreadState::Suspended;
    }

    with_table(|table| {
        let suspended = t.state == ThreadState::Suspended;
        table.insert(tid.0, t);
        if !suspended {
            enqueue_locked(table, tid, Placement::Tail);
            if is_enabled() {
                preemption_kick_locked(table, tid);
            }
        }
    });

    log::info!("spawned '{}' as {}", attr.name, tid);
    Ok(tid)
}

/// Terminate the calling thread: run its cleanup chain LIFO, publish the
/// retval, hand off to a joiner or the reaper.
pub fn thread_exit(retval: usize) -> ! {
    let tid = current();

    // Cleanup handlers run in thread context, outside the table lock.
    loop {
        let handler = with_table(|table| {
            table.get_mut(&tid.0).and_then(|t| t.cleanup.pop())
        });
        match handler {
            Some(h) => h(),
            None => break,
        }
    }

    let joiner = with_table(|table| {
        let Some(t) = table.get_mut(&tid.0) else {
            return None;
        };
        t.retval = retval;
        t.cancel_state = CancelState::Disabled;
        if !t.owned_mutexes.is_empty() {
            log::warn!(
                "{} exiting while owning {} mutex(es)",
                tid,
                t.owned_mutexes.len()
            );
        }
        if t.detached {
            t.state = ThreadState::Terminated;
            interrupts::without_interrupts(|| ZOMBIES.lock().push(tid));
            None
        } else {
            t.state = ThreadState::Completed;
            t.joiner.take()
        }
    });

    match joiner {
        Some(j) => {
            wake(j, WaitStatus::Woken, Some(WaitTarget::Join(tid)));
        }
        None => {
            let reaper = ThreadId(REAPER_TID.load(Ordering::SeqCst));
            if reaper.0 != cpu::NO_THREAD {
                wake(reaper, WaitStatus::Woken, Some(WaitTarget::Reaper));
            }
        }
    }

    yield_to_scheduler();

    // A Completed/Terminated thread is never dispatched again.
    log::error!("{} resumed after exit", tid);
    loop {
        x86_64::instructions::hlt();
    }
}

/// Wait for a thread to complete and collect its retval. The record is
/// released to the reaper afterwards.
pub fn join(tid: ThreadId) -> Result<usize> {
    let me = current();
    if me == tid {
        return Err(Errno::Deadlock);
    }

    loop {
        enum JoinStep {
            Done(usize),
            Wait,
            Fail(Errno),
        }

        prepare_wait(WaitTarget::Join(tid));
        let step = with_table(|table| {
            let Some(t) = table.get_mut(&tid.0) else {
                return JoinStep::Fail(Errno::NotFound);
            };
            if t.detached {
                return JoinStep::Fail(Errno::InvalidArgument);
            }
            match t.state {
                ThreadState::Completed => {
                    let retval = t.retval;
                    t.state = ThreadState::Terminated;
                    ZOMBIES.lock().push(tid);
                    JoinStep::Done(retval)
                }
                ThreadState::Terminated => JoinStep::Fail(Errno::NotFound),
                _ => {
                    if t.joiner.is_some() && t.joiner != Some(me) {
                        return JoinStep::Fail(Errno::Busy);
                    }
                    t.joiner = Some(me);
                    JoinStep::Wait
                }
            }
        });

        match step {
            JoinStep::Done(retval) => {
                cancel_wait();
                let reaper = ThreadId(REAPER_TID.load(Ordering::SeqCst));
                if reaper.0 != cpu::NO_THREAD {
                    wake(reaper, WaitStatus::Woken, Some(WaitTarget::Reaper));
                }
                return Ok(retval);
            }
            JoinStep::Fail(e) => {
                cancel_wait();
                return Err(e);
            }
            JoinStep::Wait => {
                block_and_yield();
                match take_wait_status() {
                    WaitStatus::Interrupted => return Err(Errno::Interrupted),
                    // Woken (or raced): re-check the target's state.
                    _ => continue,
                }
            }
        }
    }
}

fn sleep_timeout_handler(arg: usize, _missed: u64) {
    let tid = ThreadId(arg as u64);
    let target = wait_target_of(tid);
    if let Some(WaitTarget::Sleep(timer_id)) = target {
        wake(tid, WaitStatus::TimedOut, Some(WaitTarget::Sleep(timer_id)));
    }
}

/// Block the calling thread for at least `ns` nanoseconds.
pub fn sleep_ns(ns: u64) -> Result<()> {
    if !is_enabled() {
        // Pre-scheduler: busy wait on the monotonic clock.
        let deadline = counter::get_monotonic_ns() + ns;
        while counter::get_monotonic_ns() < deadline {
            core::hint::spin_loop();
        }
        return Ok(());
    }

    let tid = current();
    let deadline = counter::gettime_ns() + ns;
    let timer_id = timer::timer_add(deadline, 0, sleep_timeout_handler, tid.0 as usize);
    prepare_wait(WaitTarget::Sleep(timer_id));
    block_and_yield();
    match take_wait_status() {
        WaitStatus::TimedOut | WaitStatus::Woken => Ok(()),
        WaitStatus::Interrupted => {
            let _ = timer::timer_remove(timer_id);
            Err(Errno::Interrupted)
        }
        WaitStatus::None => Ok(()),
    }
}

/* Cancellation */

/// Request cancellation of a thread.
pub fn cancel(tid: ThreadId) -> Result<()> {
    enum CancelAction {
        None,
        InterruptWait(WaitTarget),
        ArmKick(CpuId),
    }

    let action = with_table(|table| {
        let Some(t) = table.get_mut(&tid.0) else {
            return Err(Errno::NotFound);
        };
        t.cancel_pending = true;
        if t.cancel_state == CancelState::Disabled {
            return Ok(CancelAction::None);
        }
        match t.state {
            ThreadState::Pending | ThreadState::Delay => {
                Ok(t.wait_target
                    .map(CancelAction::InterruptWait)
                    .unwrap_or(CancelAction::None))
            }
            ThreadState::Ready if t.cancel_type == CancelType::Async => {
                // Dies the next time it is dispatched.
                t.state = ThreadState::CancelArmed;
                Ok(CancelAction::None)
            }
            ThreadState::Running if t.cancel_type == CancelType::Async => {
                t.state = ThreadState::CancelArmed;
                Ok(CancelAction::ArmKick(t.cpu_idx))
            }
            _ => Ok(CancelAction::None),
        }
    })?;

    match action {
        CancelAction::None => {}
        CancelAction::InterruptWait(target) => match target {
            WaitTarget::Mutex(mid) => {
                mutex::interrupt_waiter(mid, tid, WaitStatus::Interrupted);
            }
            WaitTarget::Sleep(timer_id) => {
                let _ = timer::timer_remove(timer_id);
                wake(tid, WaitStatus::Interrupted, Some(WaitTarget::Sleep(timer_id)));
            }
            other => {
                wake(tid, WaitStatus::Interrupted, Some(other));
            }
        },
        CancelAction::ArmKick(idx) => {
            cpu::cpu(idx).need_resched.store(true, Ordering::SeqCst);
            if idx != cpu::current_cpu_index() {
                lapic::send_ipi(
                    crate::arch::x86_64::smp::apic_id_of(idx),
                    vectors::IPI_RESCHEDULE,
                );
            }
        }
    }
    Ok(())
}

/// Deferred cancellation point: a pending cancel against an enabled,
/// deferred-type caller terminates it with the canceled retval.
pub fn testcancel() {
    let tid = current();
    let fire = with_table(|table| {
        let Some(t) = table.get_mut(&tid.0) else {
            return false;
        };
        if t.cancel_pending
            && t.cancel_state == CancelState::Enabled
            && t.cancel_type == CancelType::Deferred
        {
            t.cancel_pending = false;
            t.state = ThreadState::Canceling;
            true
        } else {
            false
        }
    });
    if fire {
        thread_exit(CANCELED_RETVAL);
    }
}

/// Change the caller's cancel state; returns the previous one.
pub fn set_cancel_state(state: CancelState) -> CancelState {
    let tid = current();
    with_table(|table| {
        let t = table.get_mut(&tid.0).expect("current thread in table");
        core::mem::replace(&mut t.cancel_state, state)
    })
}

/// Change the caller's cancel type; returns the previous one.
pub fn set_cancel_type(kind: CancelType) -> CancelType {
    let tid = current();
    with_table(|table| {
        let t = table.get_mut(&tid.0).expect("current thread in table");
        core::mem::replace(&mut t.cancel_type, kind)
    })
}

/// Push a cleanup handler; runs LIFO at completion or cancellation.
pub fn cleanup_push(handler: thread::CleanupHandler) {
    let tid = current();
    with_table(|table| {
        if let Some(t) = table.get_mut(&tid.0) {
            t.cleanup.push(handler);
        }
    });
}

/// Pop the most recent cleanup handler; optionally execute it.
pub fn cleanup_pop(execute: bool) {
    let tid = current();
    let handler = with_table(|table| table.get_mut(&tid.0).and_then(|t| t.cleanup.pop()));
    if execute {
        if let Some(h) = handler {
            h();
        }
    }
}

/* Suspend / resume / signals */

/// Hold a thread off the CPU until `resume`.
pub fn suspend(tid: ThreadId) -> Result<()> {
    let kick = with_table(|table| {
        let Some(t) = table.get_mut(&tid.0) else {
            return Err(Errno::NotFound);
        };
        match t.state {
            ThreadState::Ready => {
                remove_from_runq_locked(table, tid);
                let t = table.get_mut(&tid.0).unwrap();
                t.state = ThreadState::Suspended;
                Ok(None)
            }
            ThreadState::Running => {
                t.state = ThreadState::Suspended;
                Ok(Some(t.cpu_idx))
            }
            _ => Err(Errno::Busy),
        }
    })?;

    if let Some(idx) = kick {
        cpu::cpu(idx).need_resched.store(true, Ordering::SeqCst);
        if idx == cpu::current_cpu_index() {
            yield_to_scheduler();
        } else {
            lapic::send_ipi(
                crate::arch::x86_64::smp::apic_id_of(idx),
                vectors::IPI_RESCHEDULE,
            );
        }
    }
    Ok(())
}

/// Release a suspended thread back to the run-queues.
pub fn resume(tid: ThreadId) -> Result<()> {
    with_table(|table| {
        let Some(t) = table.get_mut(&tid.0) else {
            return Err(Errno::NotFound);
        };
        if t.state != ThreadState::Suspended {
            return Err(Errno::InvalidArgument);
        }
        t.state = ThreadState::Ready;
        enqueue_locked(table, tid, Placement::Tail);
        preemption_kick_locked(table, tid);
        Ok(())
    })
}

/// Post a signal to a thread's pending set. Delivery is the consumer's
/// business; the kernel core only keeps the masks.
pub fn thread_signal(tid: ThreadId, signal: u32) -> Result<()> {
    if signal >= 64 {
        return Err(Errno::InvalidArgument);
    }
    with_table(|table| {
        let Some(t) = table.get_mut(&tid.0) else {
            return Err(Errno::NotFound);
        };
        let bit = 1u64 << signal;
        if t.sig_blocked & bit == 0 {
            t.sig_pending |= bit;
        }
        Ok(())
    })
}

/// Pending-signal set of a thread.
pub fn thread_sigpending(tid: ThreadId) -> Result<u64> {
    with_table(|table| table.get(&tid.0).map(|t| t.sig_pending).ok_or(Errno::NotFound))
}

/* Priority management */

/// A thread's current numeric priority.
pub fn thread_priority(tid: ThreadId) -> Result<u8> {
    with_table(|table| {
        table
            .get(&tid.0)
            .map(|t| t.sched_param.priority())
            .ok_or(Errno::NotFound)
    })
}

/// Set a thread's priority, honoring the queue-placement rules: raised
/// priority re-enqueues at the tail of the new priority, lowered at the
/// head, unchanged does not move the thread at all.
pub fn set_thread_priority(tid: ThreadId, prio: u8) -> Result<()> {
    let prio = prio.clamp(SCHED_PRIO_MIN, SCHED_PRIO_MAX);
    with_table(|table| {
        let (old, state, queued, cpu_idx) = {
            let Some(t) = table.get_mut(&tid.0) else {
                return Err(Errno::NotFound);
            };
            (
                t.sched_param.priority(),
                t.state,
                t.runq_scope.is_some(),
                t.cpu_idx,
            )
        };
        if old == prio {
            return Ok(());
        }

        match state {
            ThreadState::Ready if queued => {
                // remove() finds the thread at its old priority, then it
                // re-enqueues at the new one: tail on a raise, head on a
                // lower.
                remove_from_runq_locked(table, tid);
                if let Some(t) = table.get_mut(&tid.0) {
                    t.sched_param.set_priority(prio);
                }
                let placement = if prio > old {
                    Placement::Tail
                } else {
                    Placement::Head
                };
                enqueue_locked(table, tid, placement);
                preemption_kick_locked(table, tid);
            }
            ThreadState::Running => {
                if let Some(t) = table.get_mut(&tid.0) {
                    t.sched_param.set_priority(prio);
                }
                if prio < old {
                    // Something else may outrank it now.
                    cpu::cpu(cpu_idx).need_resched.store(true, Ordering::SeqCst);
                }
            }
            // Blocked or unqueued threads take the new value with them
            // to their next enqueue.
            _ => {
                if let Some(t) = table.get_mut(&tid.0) {
                    t.sched_param.set_priority(prio);
                }
            }
        }
        Ok(())
    })
}

/* Mutex ownership bookkeeping */

pub(crate) fn note_mutex_acquired(tid: ThreadId, mid: mutex::MutexId) {
    with_table(|table| {
        if let Some(t) = table.get_mut(&tid.0) {
            t.owned_mutexes.push(mid);
        }
    });
}

pub(crate) fn note_mutex_released(tid: ThreadId, mid: mutex::MutexId) {
    with_table(|table| {
        if let Some(t) = table.get_mut(&tid.0) {
            if let Some(pos) = t.owned_mutexes.iter().position(|&m| m == mid) {
                t.owned_mutexes.swap_remove(pos);
            }
        }
    });
}

/* FPU lazy switching */

/// Device-not-available trap: the running thread touched the FPU while
/// TS was set. Save the previous owner's state, load (or init) ours.
pub fn fpu_trap() {
    let cpu_rec = cpu::current_cpu();
    let cur_tid = ThreadId(cpu_rec.current.load(Ordering::SeqCst));

    context::fpu_clear_ts();

    with_table(|table| {
        let owner_raw = cpu_rec.fpu_owner.load(Ordering::SeqCst);
        if owner_raw == cur_tid.0 {
            return;
        }
        if owner_raw != cpu::NO_THREAD {
            if let Some(owner) = table.get_mut(&owner_raw) {
                let area = owner.fpu_state.get_or_insert_with(thread::FpuState::new);
                context::fpu_save(area);
            }
        }
        if let Some(t) = table.get_mut(&cur_tid.0) {
            t.use_fpu = true;
            match &t.fpu_state {
                Some(area) => context::fpu_restore(area),
                None => context::fpu_init_clean(),
            }
        }
        cpu_rec.fpu_owner.store(cur_tid.0, Ordering::SeqCst);
    });
}

/* Idle, reaper, bootstrap */

extern "C" fn idle_thread_main(_arg: usize) -> usize {
    loop {
        x86_64::instructions::hlt();
    }
}

extern "C" fn reaper_thread_main(_arg: usize) -> usize {
    loop {
        let tid = interrupts::without_interrupts(|| ZOMBIES.lock().pop());
        match tid {
            Some(tid) => {
                // A just-exited thread may still be mid-switch on its
                // CPU; its stack cannot be freed under it. Requeue and
                // come back.
                let reaped = with_table(|table| match table.get(&tid.0) {
                    Some(t) if t.on_cpu => {
                        ZOMBIES.lock().push(tid);
                        false
                    }
                    Some(_) => {
                        // Dropping the record frees the stack (when
                        // owned) and the saved context.
                        table.remove(&tid.0);
                        true
                    }
                    None => true,
                });
                if reaped {
                    log::info!("reaped {}", tid);
                } else {
                    yield_now();
                }
            }
            None => {
                prepare_wait(WaitTarget::Reaper);
                block_and_yield();
                let _ = take_wait_status();
            }
        }
    }
}

/// Create the per-CPU idle thread record. Not enqueued anywhere.
fn create_idle_thread(cpu_idx: CpuId) -> ThreadId {
    let attr = ThreadAttr {
        name: "idle",
        policy: PolicyId::Fifo,
        priority: SCHED_PRIO_MIN,
        affinity: CpuSet::single(cpu_idx),
        ..ThreadAttr::default()
    };

    let stack = vec![0u8; 16 * 1024].into_boxed_slice();
    let stack_top = stack.as_ptr() as u64 + stack.len() as u64;
    let ctx = initial_context(
        thread_trampoline as usize as u64,
        stack_top,
        idle_thread_main as usize as u64,
        0,
    );

    let tid = allocate_tid();
    let mut t = Thread::new(tid, "idle", &attr, ctx, Some(stack));
    t.is_idle = true;
    t.cpu_idx = cpu_idx;
    t.state = ThreadState::Ready;

    with_table(|table| {
        table.insert(tid.0, t);
    });
    tid
}

/// Register the flow calling this as a live thread (the boot flow, an AP
/// bootstrap flow). Its context is captured at its first switch-out.
fn adopt_current_flow(name: &str, cpu_idx: CpuId, is_idle: bool) -> ThreadId {
    let attr = ThreadAttr {
        name: "boot",
        policy: PolicyId::Fifo,
        priority: if is_idle { SCHED_PRIO_MIN } else { SCHED_PRIO_MAX / 2 },
        affinity: CpuSet::single(cpu_idx),
        ..ThreadAttr::default()
    };

    let tid = allocate_tid();
    let ctx = Box::new(InterruptContext::default());
    let mut t = Thread::new(tid, name, &attr, ctx, None);
    t.free_stack_on_exit = false;
    t.is_idle = is_idle;
    t.cpu_idx = cpu_idx;
    t.state = ThreadState::Running;
    t.on_cpu = true;
    t.resume_cycle = counter::get_monotonic_ns();

    with_table(|table| {
        table.insert(tid.0, t);
    });
    tid
}

/// Initialize the scheduler on the BSP: per-CPU records, the boot
/// thread, the idle thread, the reaper.
pub fn init() {
    cpu::cpu_early_init();

    let boot_tid = adopt_current_flow("boot", 0, false);
    let cpu0 = cpu::cpu(0);
    cpu0.current.store(boot_tid.0, Ordering::SeqCst);

    let idle_tid = create_idle_thread(0);
    cpu0.idle.store(idle_tid.0, Ordering::SeqCst);

    let reaper_attr = ThreadAttr {
        name: "reaper",
        policy: PolicyId::Fifo,
        priority: SCHED_PRIO_MIN + 1,
        affinity: CpuSet::all(),
        detached: true,
        ..ThreadAttr::default()
    };
    let reaper = spawn(&reaper_attr, reaper_thread_main, 0).expect("reaper spawn");
    REAPER_TID.store(reaper.0, Ordering::SeqCst);

    log::info!("scheduler initialized (boot {}, idle {})", boot_tid, idle_tid);
}

/// Turn on preemptive scheduling. The tick must already be running.
pub fn enable() {
    SCHED_ENABLED.store(true, Ordering::SeqCst);
    log::info!("scheduler enabled");
}

/// Scheduler bootstrap on an application processor. The calling flow
/// becomes the CPU's idle thread and never returns.
pub fn ap_bootstrap(cpu_idx: CpuId) -> ! {
    let idle_tid = adopt_current_flow("idle", cpu_idx, true);
    let cpu_rec = cpu::cpu(cpu_idx);
    cpu_rec.current.store(idle_tid.0, Ordering::SeqCst);
    cpu_rec.idle.store(idle_tid.0, Ordering::SeqCst);
    cpu_rec.online.store(true, Ordering::SeqCst);

    // The local tick drives this CPU's slice accounting and preemption.
    if let Err(e) = crate::time::eventer::local_tick_init(&lapic::LAPIC_TIMER_EVENTER) {
        log::warn!("cpu{}: no local tick ({})", cpu_idx, e);
    }

    crate::arch::x86_64::smp::signal_ap_booted();
    interrupts::enable();

    log::info!("cpu{} entering idle loop", cpu_idx);
    loop {
        x86_64::instructions::hlt();
    }
}

/* Diagnostics */

/// Snapshot of every thread, for logging and the test suites.
pub fn thread_stats() -> Vec<ThreadStats> {
    with_table(|table| {
        table
            .values()
            .map(|t| ThreadStats {
                id: t.id,
                name: t.name.clone(),
                state: t.state,
                policy: t.policy_id,
                priority: t.sched_param.priority(),
                cpu_idx: t.cpu_idx,
                run_ns: t.cycles,
            })
            .collect()
    })
}

/// A thread's current state, for tests and debugging.
pub fn thread_state(tid: ThreadId) -> Result<ThreadState> {
    with_table(|table| table.get(&tid.0).map(|t| t.state).ok_or(Errno::NotFound))
}
