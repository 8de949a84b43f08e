//! # Scheduler
//!
//! Priority bitmask selection and the context-switch protocol.
//!
//! ## Scheduling Masks
//!
//! Every slot owns one bit in two masks:
//!
//! - `original_mask`: cumulative schedulability, mutated by create, pend,
//!   resume and task end.
//! - `working_mask`: what the picker consults. Reset from `original_mask`
//!   at every interrupt reschedule, so pend/resume churn between two
//!   interrupts never leaks into the steady state.
//!
//! A task created between two interrupts is only in `original_mask` and
//! becomes eligible at the next interrupt reschedule.
//!
//! ## Picker
//!
//! Higher priority means lower slot means lower bit, so the next task is the
//! working mask's lowest set bit. `mask & -mask` isolates it, and the 37
//! powers of two below 2^32 have distinct residues modulo 37, which index a
//! lookup table of bit positions.
//!
//! ## Dispatch
//!
//! ```text
//! dispatch(outgoing, next, reason)
//!   ├─ outgoing still Running  → record `reason`
//!   ├─ next == None            → boot/idle context
//!   ├─ next is Created         → Port::init_frame, then first switch
//!   │                            (the task starts in Kernel::run_task)
//!   ├─ next == outgoing        → no switch
//!   ├─ outgoing ended          → Port::switch_to (nothing saved)
//!   └─ otherwise               → Port::save_and_switch
//! ```

use crate::arch::{ContextId, Port};
use crate::error::{Error, Result};
use crate::kernel::{Kernel, KernelState};
use crate::sync::{CriticalSection, IrqState};
use crate::task::{TaskId, TaskState};

/// System tick counter. Wraps.
pub type Tick = u32;

/// Bit position of `2^k % 37` for every `k` in `0..32`. Residues that no
/// power of two produces are 0.
const CTZ_TABLE: [u8; 37] = [
    32, 0, 1, 26, 2, 23, 27, 0, 3, 16, 24, 30, 28, 11, 0, 13, 4, 7, 17, 0, 25, 22, 31, 15, 29,
    10, 12, 6, 0, 21, 14, 9, 5, 20, 8, 19, 18,
];

/// Slot of the lowest set bit of `mask`.
#[inline]
pub fn pick_slot(mask: u32) -> Option<usize> {
    if mask == 0 {
        return None;
    }
    let lowest = mask & mask.wrapping_neg();
    Some(usize::from(CTZ_TABLE[(lowest % 37) as usize]))
}

#[inline]
pub(crate) const fn bit(slot: usize) -> u32 {
    1 << slot
}

// ---------------------------------------------------------------------------
// Scheduler state
// ---------------------------------------------------------------------------

pub(crate) struct Scheduler {
    pub(crate) original_mask: u32,
    pub(crate) working_mask: u32,
    /// Slot of the running task; `None` in the boot/idle context.
    pub(crate) current: Option<usize>,
    /// Tasks dispatched and not since pended or ended.
    pub(crate) running: usize,
    pub(crate) tick: Tick,
    pub(crate) in_isr: bool,
    /// Saved stack pointer of the boot/idle context.
    pub(crate) boot_sp: usize,
}

impl Scheduler {
    pub(crate) const fn new() -> Self {
        Self {
            original_mask: 0,
            working_mask: 0,
            current: None,
            running: 0,
            tick: 0,
            in_isr: false,
            boot_sp: 0,
        }
    }

    #[inline]
    pub(crate) fn set(&mut self, slot: usize) {
        self.original_mask |= bit(slot);
        self.working_mask |= bit(slot);
    }

    #[inline]
    pub(crate) fn clear(&mut self, slot: usize) {
        self.original_mask &= !bit(slot);
        self.working_mask &= !bit(slot);
    }
}

/// Who is giving up the CPU in [`Kernel::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outgoing {
    /// The current context (a task, or boot when no task is current).
    Current,
    /// A task whose entry function returned; its context is discarded.
    Ended,
}

impl<P: Port> KernelState<P> {
    /// Highest-priority task in the working mask.
    ///
    /// # Panics
    /// If the selected slot holds no task or a task that cannot run.
    pub(crate) fn pick_next(&self) -> Option<usize> {
        let slot = pick_slot(self.sched.working_mask)?;
        let state = self.tasks.get(slot).state;
        assert!(
            self.tasks.exists(slot) && state.intersects(TaskState::SCHEDULABLE),
            "sched: picked slot {} in state {:?}",
            slot,
            state
        );
        Some(slot)
    }

    /// Like [`Self::pick_next`], but a running caller may pick itself: the
    /// current task keeps its mask bit while it runs.
    fn peek_next(&self) -> Option<usize> {
        let slot = pick_slot(self.sched.working_mask)?;
        if self.sched.current == Some(slot) {
            Some(slot)
        } else {
            self.pick_next()
        }
    }

    /// Make a task schedulable again, clearing `reason`.
    pub(crate) fn resume(&mut self, id: TaskId, reason: TaskState) -> Result<()> {
        let slot = self.tasks.validate(id)?;
        let tcb = self.tasks.get_mut(slot);
        tcb.state.remove(reason);
        if !tcb
            .state
            .intersects(TaskState::CREATED | TaskState::RUNNING | TaskState::INTERRUPTED)
        {
            tcb.state.insert(TaskState::READY);
        }
        self.sched.set(slot);
        if reason.contains(TaskState::PENDING_SLEEP) {
            self.sleep.unlink(slot);
        }
        log::trace!("sched: resumed slot {} ({:?})", slot, reason);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Kernel API
// ---------------------------------------------------------------------------

impl<P: Port> Kernel<P> {
    /// The task the picker would select now.
    pub fn pick_next_task(&self) -> Option<TaskId> {
        self.with_state(|st| st.peek_next().map(|slot| st.tasks.id_of(slot)))
    }

    /// Reset the working mask from the original mask, as an interrupt
    /// reschedule does.
    pub fn reset_reschedule_engine(&self) {
        self.with_state(|st| st.sched.working_mask = st.sched.original_mask);
    }

    pub fn tick(&self) -> Tick {
        self.with_state(|st| st.sched.tick)
    }

    pub fn set_tick(&self, tick: Tick) {
        self.with_state(|st| st.sched.tick = tick);
    }

    pub fn adjust_tick(&self, offset: i32) {
        self.with_state(|st| st.sched.tick = st.sched.tick.wrapping_add(offset as u32));
    }

    /// Number of tasks dispatched and neither pended nor ended since.
    pub fn running_tasks(&self) -> usize {
        self.with_state(|st| st.sched.running)
    }

    /// Block the calling task until a matching [`Self::resume_task`].
    ///
    /// `reason` must be a non-empty combination of the `PENDING_*` states.
    ///
    /// # Errors
    /// - [`Error::InvalidParam`]: stale handle or bad `reason`.
    /// - [`Error::NotSupported`]: `id` is not the calling task.
    ///
    /// # Panics
    /// If called from interrupt context.
    pub fn pending_task(&'static self, id: TaskId, reason: TaskState) -> Result<()> {
        if reason.is_empty() || !TaskState::PENDING.contains(reason) {
            return Err(Error::InvalidParam);
        }
        let _cs = CriticalSection::enter(&self.port);
        let slot = self.with_state(|st| {
            let slot = st.tasks.validate(id)?;
            assert!(!st.sched.in_isr, "sched: pending from interrupt context");
            if st.sched.current != Some(slot) {
                return Err(Error::NotSupported);
            }
            Ok(slot)
        })?;
        unsafe { self.block_current(slot, reason) };
        Ok(())
    }

    /// Make a pended task schedulable again. Takes effect at the next
    /// reschedule point. Resuming a task that is not pending only clears
    /// `reason`.
    pub fn resume_task(&self, id: TaskId, reason: TaskState) -> Result<()> {
        if !TaskState::PENDING.contains(reason) {
            return Err(Error::InvalidParam);
        }
        self.with_state(|st| st.resume(id, reason))
    }

    /// [`Self::resume_task`] for callers that already run with interrupts
    /// disabled (the interrupt dispatcher, driver hooks).
    pub fn resume_task_idic(&self, id: TaskId, reason: TaskState) -> Result<()> {
        debug_assert!(
            !self.port.interrupts_enabled(),
            "sched: resume_task_idic with interrupts enabled"
        );
        self.resume_task(id, reason)
    }

    /// Pend the current task in `slot` and switch away. Returns once the
    /// task is resumed and dispatched again.
    ///
    /// # Safety
    /// Interrupts are disabled and `slot` is the current task.
    pub(crate) unsafe fn block_current(&'static self, slot: usize, reason: TaskState) {
        let next = self.with_state(|st| {
            debug_assert_eq!(st.sched.current, Some(slot));
            st.sched.clear(slot);
            assert!(st.sched.running > 0, "sched: running count underflow");
            st.sched.running -= 1;
            st.tasks.get_mut(slot).dispatched = false;
            st.pick_next()
        });
        self.dispatch(Outgoing::Current, next, reason);
    }

    /// Hand the CPU to `next` (boot/idle if `None`).
    ///
    /// # Safety
    /// Interrupts are disabled. With [`Outgoing::Ended`], the calling
    /// context has been destroyed and must not touch the kernel after this
    /// returns.
    pub(crate) unsafe fn dispatch(&'static self, outgoing: Outgoing, next: Option<usize>, reason: TaskState) {
        let (from, to, first_run) = self.with_state(|st| {
            let from = match (outgoing, st.sched.current) {
                (Outgoing::Ended, _) => None,
                (Outgoing::Current, None) => Some(ContextId::Boot),
                (Outgoing::Current, Some(slot)) => {
                    let tcb = st.tasks.get_mut(slot);
                    if reason != TaskState::END && tcb.state.contains(TaskState::RUNNING) {
                        tcb.state.remove(TaskState::RUNNING);
                        tcb.state.insert(reason);
                    }
                    Some(ContextId::Task(slot))
                }
            };

            let Some(slot) = next else {
                debug_assert_eq!(st.sched.running, 0, "sched: idle with running tasks");
                st.sched.current = None;
                return (from, ContextId::Boot, None);
            };

            assert!(st.tasks.exists(slot), "sched: dispatching empty slot {}", slot);
            let tcb = st.tasks.get_mut(slot);
            let first_run = tcb.state.contains(TaskState::CREATED).then(|| tcb.initial_sp);
            tcb.state = TaskState::RUNNING;
            let counted = core::mem::replace(&mut tcb.dispatched, true);
            let priority = tcb.priority;
            if !counted {
                st.sched.running += 1;
            }
            st.sched.current = Some(slot);
            log::trace!("sched: {:?} -> slot {} (priority {})", from, slot, priority);
            (from, ContextId::Task(slot), first_run)
        });

        if let (ContextId::Task(slot), Some(stack_top)) = (to, first_run) {
            let sp = self.port.init_frame(self, slot, stack_top);
            self.with_state(|st| st.tasks.get_mut(slot).sp = sp);
        }

        match from {
            None => self.port.switch_to(self, to),
            Some(from) if from == to => {}
            Some(from) => self.port.save_and_switch(self, from, to),
        }
    }

    /// Common body of every task context: run the entry function, then
    /// destroy the task and dispatch the next one without saving anything.
    ///
    /// Ports start each new context here; it is not meant to be called
    /// directly.
    #[doc(hidden)]
    pub fn run_task(&'static self, slot: usize) {
        let (entry, arg, name) = self.with_state(|st| {
            let tcb = st.tasks.get(slot);
            (tcb.entry, tcb.arg, tcb.name)
        });
        let Some(entry) = entry else {
            panic!("sched: slot {} started without an entry function", slot);
        };

        self.port.restore_interrupts(IrqState::ENABLED);
        let code = entry(self, arg);
        if code != 0 {
            log::warn!("task {} exited with code {}", name, code);
        }

        let _ = self.port.disable_interrupts();
        let next = self.with_state(|st| {
            let tcb = st.tasks.get_mut(slot);
            tcb.state = TaskState::END;
            if core::mem::replace(&mut tcb.dispatched, false) {
                st.sched.running -= 1;
            }
            st.sched.working_mask &= !bit(slot);
            st.destroy_idic(slot);
            st.sched.current = None;
            log::debug!("task {} ended", name);
            st.pick_next()
        });
        unsafe { self.dispatch(Outgoing::Ended, next, TaskState::END) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimPort;
    use crate::task::slot_of;
    use crate::testing;
    use quickcheck_macros::quickcheck;
    use std::sync::Mutex;

    fn idle(_: &'static Kernel<SimPort>, _: usize) -> i32 {
        0
    }

    fn pend_self(k: &'static Kernel<SimPort>, _: usize) -> i32 {
        let me = k.current_task().unwrap();
        k.pending_task(me, TaskState::PENDING_SELF).unwrap();
        0
    }

    #[test]
    fn test_pick_slot() {
        assert_eq!(pick_slot(0), None);
        assert_eq!(pick_slot(1), Some(0));
        assert_eq!(pick_slot(0b1011_0000), Some(4));
        assert_eq!(pick_slot(1 << 31), Some(31));
        assert_eq!(pick_slot(u32::MAX), Some(0));
    }

    #[quickcheck]
    fn qc_pick_slot_is_trailing_zeros(mask: u32) -> bool {
        match pick_slot(mask) {
            None => mask == 0,
            Some(slot) => slot == mask.trailing_zeros() as usize,
        }
    }

    #[test]
    fn test_picker_prefers_higher_priority() {
        let k = testing::kernel();
        let low = k.task_create("low", 5, idle, 0, 512).unwrap();
        let high = k.task_create("high", 10, idle, 0, 512).unwrap();

        // Created tasks wait for the next reschedule.
        assert_eq!(k.pick_next_task(), None);
        k.reset_reschedule_engine();
        assert_eq!(k.pick_next_task(), Some(high));

        k.task_delete(high).unwrap();
        k.reset_reschedule_engine();
        assert_eq!(k.pick_next_task(), Some(low));
    }

    #[test]
    fn test_running_task_picks_itself() {
        static PICKED: Mutex<Option<(Option<TaskId>, TaskId)>> = Mutex::new(None);

        fn worker(k: &'static Kernel<SimPort>, _: usize) -> i32 {
            let me = k.current_task().unwrap();
            *PICKED.lock().unwrap() = Some((k.pick_next_task(), me));
            0
        }

        let k = testing::kernel();
        k.task_create("low", 2, idle, 0, 512).unwrap();
        k.task_create("worker", 12, worker, 0, 512).unwrap();
        k.register_dispatcher(Some(testing::reschedule)).unwrap();

        SimPort::raise_interrupt(k);
        let (picked, me) = PICKED.lock().unwrap().unwrap();
        assert_eq!(picked, Some(me));
    }

    #[test]
    fn test_sleep_hands_cpu_to_lower_priority() {
        static EVENTS: Mutex<Vec<String>> = Mutex::new(Vec::new());

        fn high(k: &'static Kernel<SimPort>, _: usize) -> i32 {
            k.sleep(3);
            EVENTS.lock().unwrap().push(format!("high woke at {}", k.tick()));
            0
        }

        fn low(k: &'static Kernel<SimPort>, _: usize) -> i32 {
            let me = k.current_task().unwrap();
            let picked = k.pick_next_task();
            EVENTS.lock().unwrap().push(format!("low ran, picker {}", picked == Some(me)));
            k.pending_task(me, TaskState::PENDING_SELF).unwrap();
            EVENTS.lock().unwrap().push("low resumed".to_string());
            0
        }

        let k = testing::kernel();
        let low_id = k.task_create("low", 5, low, 0, 512).unwrap();
        let high_id = k.task_create("high", 10, high, 0, 512).unwrap();
        k.register_dispatcher(Some(testing::reschedule)).unwrap();

        SimPort::raise_interrupt(k);
        assert_eq!(*EVENTS.lock().unwrap(), ["low ran, picker true"]);
        assert_eq!(k.task_state(high_id), Ok(TaskState::PENDING_SLEEP));
        assert_eq!(k.task_state(low_id), Ok(TaskState::PENDING_SELF));
        assert_eq!(k.running_tasks(), 0);

        k.register_dispatcher(Some(testing::tick)).unwrap();
        for _ in 0..2 {
            SimPort::raise_interrupt(k);
            assert_eq!(k.task_state(high_id), Ok(TaskState::PENDING_SLEEP));
        }
        SimPort::raise_interrupt(k);
        assert_eq!(k.tick(), 3);
        assert_eq!(EVENTS.lock().unwrap().last().unwrap(), "high woke at 3");
        // Ended tasks are destroyed.
        assert_eq!(k.task_state(high_id), Err(Error::InvalidParam));

        k.resume_task(low_id, TaskState::PENDING_SELF).unwrap();
        assert_eq!(k.task_state(low_id), Ok(TaskState::READY));
        SimPort::raise_interrupt(k);
        assert_eq!(EVENTS.lock().unwrap().last().unwrap(), "low resumed");
        assert_eq!(k.task_state(low_id), Err(Error::InvalidParam));
        assert_eq!(k.deinit(), Ok(()));
    }

    #[test]
    fn test_delete_after_dispatch_is_busy() {
        let k = testing::kernel();
        let id = k.task_create("t", 3, pend_self, 0, 512).unwrap();
        k.register_dispatcher(Some(testing::reschedule)).unwrap();

        SimPort::raise_interrupt(k);
        assert_eq!(k.task_state(id), Ok(TaskState::PENDING_SELF));
        assert_eq!(k.task_delete(id), Err(Error::Busy));

        // Resumed but not yet dispatched: still refused.
        k.resume_task(id, TaskState::PENDING_SELF).unwrap();
        assert_eq!(k.task_delete(id), Err(Error::Busy));

        SimPort::raise_interrupt(k);
        assert_eq!(k.task_state(id), Err(Error::InvalidParam));
    }

    #[test]
    fn test_task_end_releases_stack_and_slot() {
        let k = testing::kernel();
        let class = testing::STACK_CLASS;
        let free_before = k.mem_stats(class).unwrap().free;
        let first = k.task_create("t", 7, idle, 0, 512).unwrap();
        k.register_dispatcher(Some(testing::reschedule)).unwrap();

        SimPort::raise_interrupt(k);
        assert_eq!(k.task_state(first), Err(Error::InvalidParam));
        assert_eq!(k.get_task(slot_of(7)), None);
        assert_eq!(k.mem_stats(class).unwrap().free, free_before);
        assert_eq!(k.current_task(), None);

        let second = k.task_create("t", 7, idle, 0, 512).unwrap();
        assert_eq!(second.slot(), first.slot());
        assert_ne!(second.generation(), first.generation());
    }

    #[test]
    fn test_interrupt_preempts_running_task() {
        static EVENTS: Mutex<Vec<&str>> = Mutex::new(Vec::new());

        fn high(_: &'static Kernel<SimPort>, _: usize) -> i32 {
            EVENTS.lock().unwrap().push("high");
            0
        }

        fn low(k: &'static Kernel<SimPort>, _: usize) -> i32 {
            k.task_create("high", 9, high, 0, 512).unwrap();
            EVENTS.lock().unwrap().push("low before");
            SimPort::raise_interrupt(k);
            EVENTS.lock().unwrap().push("low after");
            0
        }

        let k = testing::kernel();
        k.task_create("low", 1, low, 0, 512).unwrap();
        k.register_dispatcher(Some(testing::reschedule)).unwrap();

        SimPort::raise_interrupt(k);
        assert_eq!(*EVENTS.lock().unwrap(), ["low before", "high", "low after"]);
        assert_eq!(k.running_tasks(), 0);
    }

    #[test]
    fn test_pending_task_errors() {
        let k = testing::kernel();
        let id = k.task_create("t", 4, idle, 0, 512).unwrap();
        assert_eq!(
            k.pending_task(id, TaskState::PENDING_SELF),
            Err(Error::NotSupported)
        );
        assert_eq!(k.pending_task(id, TaskState::READY), Err(Error::InvalidParam));
        assert_eq!(k.pending_task(id, TaskState::empty()), Err(Error::InvalidParam));

        k.task_delete(id).unwrap();
        assert_eq!(
            k.pending_task(id, TaskState::PENDING_SELF),
            Err(Error::InvalidParam)
        );
        assert_eq!(
            k.resume_task(id, TaskState::PENDING_SELF),
            Err(Error::InvalidParam)
        );
    }

    #[test]
    fn test_resume_is_idempotent() {
        let k = testing::kernel();
        let id = k.task_create("t", 4, pend_self, 0, 512).unwrap();
        k.register_dispatcher(Some(testing::reschedule)).unwrap();
        SimPort::raise_interrupt(k);

        k.resume_task(id, TaskState::PENDING_SELF).unwrap();
        k.resume_task(id, TaskState::PENDING_SELF).unwrap();
        assert_eq!(k.task_state(id), Ok(TaskState::READY));
        assert_eq!(k.pick_next_task(), Some(id));
    }

    #[test]
    fn test_tick_adjustment() {
        let k = testing::kernel();
        k.set_tick(10);
        k.adjust_tick(-4);
        assert_eq!(k.tick(), 6);
        k.set_tick(u32::MAX);
        k.adjust_tick(2);
        assert_eq!(k.tick(), 1);
    }
}
