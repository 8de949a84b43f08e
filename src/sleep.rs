//! # Sleep Manager
//!
//! One sleep block per slot, parallel to the TCB table; a sleeping task's
//! block is linked into a single unordered list. The tick path scans the
//! whole list once per tick: task counts are small and bounded.

use crate::arch::Port;
use crate::config::{MAX_TASKS, TICK_PERIOD_MS};
use crate::kernel::{Kernel, KernelState};
use crate::list::{Link, Links, ListHead};
use crate::scheduler::Tick;
use crate::sync::CriticalSection;
use crate::task::{TaskId, TaskState};

#[derive(Debug, Clone, Copy)]
struct SleepBlock {
    owner: Option<TaskId>,
    wakeup: Tick,
    link: Link<usize>,
    linked: bool,
}

impl SleepBlock {
    const EMPTY: Self = Self {
        owner: None,
        wakeup: 0,
        link: Link::UNLINKED,
        linked: false,
    };
}

struct SleepBlocks([SleepBlock; MAX_TASKS]);

impl Links for SleepBlocks {
    type Node = usize;

    #[inline]
    fn link(&self, slot: usize) -> Link<usize> {
        self.0[slot].link
    }

    #[inline]
    fn set_link(&mut self, slot: usize, link: Link<usize>) {
        self.0[slot].link = link;
    }
}

pub(crate) struct SleepList {
    blocks: SleepBlocks,
    list: ListHead<usize>,
}

impl SleepList {
    pub(crate) const fn new() -> Self {
        Self {
            blocks: SleepBlocks([SleepBlock::EMPTY; MAX_TASKS]),
            list: ListHead::new(),
        }
    }

    /// Link the block of `slot`, due at `wakeup`.
    pub(crate) fn insert(&mut self, slot: usize, owner: TaskId, wakeup: Tick) {
        self.unlink(slot);
        let block = &mut self.blocks.0[slot];
        block.owner = Some(owner);
        block.wakeup = wakeup;
        block.linked = true;
        self.list.push_back(&mut self.blocks, slot);
    }

    /// Unlink the block of `slot` if it is linked.
    pub(crate) fn unlink(&mut self, slot: usize) {
        if self.blocks.0[slot].linked {
            self.list.remove(&mut self.blocks, slot);
            self.blocks.0[slot] = SleepBlock::EMPTY;
        }
    }

    pub(crate) fn wakeup_of(&self, slot: usize) -> Option<Tick> {
        let block = &self.blocks.0[slot];
        block.linked.then(|| block.wakeup)
    }
}

/// Longest single sleep. Longer requests are clamped so the wrapping due
/// check never sees them as already expired.
pub const MAX_SLEEP_TICKS: Tick = i32::MAX as Tick;

/// Has `wakeup` been reached at `now`? Correct across tick wraparound for
/// sleeps shorter than half the tick range.
#[inline]
pub(crate) fn is_due(now: Tick, wakeup: Tick) -> bool {
    now.wrapping_sub(wakeup) as i32 >= 0
}

/// Convert milliseconds to ticks, rounding down, with a minimum of one tick.
#[inline]
pub const fn ms_to_ticks(ms: u32) -> Tick {
    let ticks = ms / TICK_PERIOD_MS;
    if ticks == 0 {
        1
    } else {
        ticks
    }
}

impl<P: Port> KernelState<P> {
    /// Wake every sleeper due at `now`.
    pub(crate) fn tick_update(&mut self, now: Tick) {
        let mut cursor = self.sleep.list.first();
        while let Some(slot) = cursor {
            cursor = self.sleep.list.next_of(&self.sleep.blocks, slot);

            let block = self.sleep.blocks.0[slot];
            if !is_due(now, block.wakeup) {
                continue;
            }
            self.sleep.unlink(slot);
            match block.owner.map(|owner| self.resume(owner, TaskState::PENDING_SLEEP)) {
                Some(Ok(())) => log::trace!("sleep: slot {} woke at {}", slot, now),
                _ => log::warn!("sleep: dropped stale sleeper in slot {}", slot),
            }
        }
    }
}

impl<P: Port> Kernel<P> {
    /// Block the calling task for `ticks` system ticks, at most
    /// [`MAX_SLEEP_TICKS`].
    ///
    /// # Panics
    /// If called from interrupt context or from the boot context.
    pub fn sleep(&'static self, ticks: Tick) {
        let _cs = CriticalSection::enter(&self.port);
        let slot = self.with_state(|st| {
            assert!(!st.sched.in_isr, "sleep: called from interrupt context");
            let Some(slot) = st.sched.current else {
                panic!("sleep: called from the boot context");
            };
            let owner = st.tasks.id_of(slot);
            let wakeup = st.sched.tick.wrapping_add(ticks.min(MAX_SLEEP_TICKS));
            st.sleep.insert(slot, owner, wakeup);
            slot
        });
        // SAFETY: interrupts are disabled and `slot` is the current task.
        unsafe { self.block_current(slot, TaskState::PENDING_SLEEP) };
    }

    pub fn sleep_ms(&'static self, ms: u32) {
        self.sleep(ms_to_ticks(ms));
    }

    pub fn sleep_seconds(&'static self, seconds: u32) {
        self.sleep(ms_to_ticks(seconds.saturating_mul(1000)));
    }

    /// Tick at which a sleeping task is due, or `None` if it is not asleep.
    pub fn wakeup_tick(&self, id: TaskId) -> Option<Tick> {
        self.with_state(|st| {
            let slot = st.tasks.validate(id).ok()?;
            st.sleep.wakeup_of(slot)
        })
    }
}
