//! # Task Model
//!
//! Defines the Task Control Block (TCB), task states, task handles and the
//! task registry.
//!
//! ## Slots
//!
//! There is exactly one task per priority level. A task's priority selects
//! its slot, and the slot selects its bit in the scheduling masks:
//!
//! ```text
//! priority:  31  30  29 ...   1   0
//! slot:       0   1   2 ...  30  31
//! mask bit:   0   1   2 ...  30  31
//! ```
//!
//! so the highest-priority runnable task is always the lowest set bit.
//!
//! ## Lifecycle
//!
//! ```text
//!  create ──► Created ──► Running ◄──► Interrupted
//!                            │  ▲
//!                       pend │  │ dispatch
//!                            ▼  │
//!                       Pending* ──► Ready
//!                            resume
//!
//!  Running ──► End (entry returned) ──► destroyed
//! ```

use core::fmt;

use bitflags::bitflags;

use crate::arch::Port;
use crate::config::{DEFAULT_TASK_NAME, MAX_TASKS, MAX_TASK_NAME_LEN, MIN_STACK_LEN};
use crate::error::{Error, Result};
use crate::kernel::{Kernel, KernelState};
use crate::mem::{Block, RawBlock};
use crate::scheduler::bit;

bitflags! {
    /// Task state. Several pending reasons may be set at once.
    pub struct TaskState: u8 {
        const INVALID       = 0x00;
        /// Created, never dispatched.
        const CREATED       = 0x01;
        const RUNNING       = 0x02;
        /// Preempted by the interrupt currently being serviced.
        const INTERRUPTED   = 0x04;
        const READY         = 0x08;
        const PENDING_SLEEP = 0x10;
        const PENDING_SELF  = 0x20;
        const PENDING_MSG   = 0x40;
        /// Entry function returned.
        const END           = 0x80;

        /// Every pending reason.
        const PENDING = Self::PENDING_SLEEP.bits | Self::PENDING_SELF.bits | Self::PENDING_MSG.bits;
        /// States the picker may select.
        const SCHEDULABLE = Self::CREATED.bits | Self::READY.bits | Self::INTERRUPTED.bits;
    }
}

/// Task entry function. The return value is the task's exit code; a
/// non-zero code is logged.
pub type TaskEntry<P> = fn(&'static Kernel<P>, usize) -> i32;

/// Slot of the task with the given priority.
#[inline]
pub const fn slot_of(priority: u8) -> usize {
    MAX_TASKS - 1 - priority as usize
}

/// Priority of the task in the given slot.
#[inline]
pub const fn priority_of(slot: usize) -> u8 {
    (MAX_TASKS - 1 - slot) as u8
}

// ---------------------------------------------------------------------------
// Task handle
// ---------------------------------------------------------------------------

/// Generational task handle.
///
/// A handle stays valid until its task is deleted or ends. A later task
/// created at the same priority reuses the slot under a new generation, so
/// a stale handle never aliases it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    slot: u8,
    generation: u16,
}

impl TaskId {
    #[inline]
    pub fn slot(self) -> usize {
        usize::from(self.slot)
    }

    #[inline]
    pub fn priority(self) -> u8 {
        priority_of(self.slot())
    }

    #[inline]
    pub fn generation(self) -> u16 {
        self.generation
    }

    /// Encoding stamped into message headers: `generation << 8 | slot`.
    #[inline]
    pub(crate) fn code(self) -> u32 {
        (u32::from(self.generation) << 8) | u32::from(self.slot)
    }

    #[inline]
    pub(crate) fn from_code(code: u32) -> Self {
        Self {
            slot: (code & 0xff) as u8,
            generation: (code >> 8) as u16,
        }
    }
}

// ---------------------------------------------------------------------------
// Task name
// ---------------------------------------------------------------------------

/// A task name, truncated to [`MAX_TASK_NAME_LEN`] bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TaskName {
    bytes: [u8; MAX_TASK_NAME_LEN],
    len: u8,
}

impl TaskName {
    const EMPTY: Self = Self {
        bytes: [0; MAX_TASK_NAME_LEN],
        len: 0,
    };

    fn new(name: &str) -> Self {
        let name = if name.is_empty() { DEFAULT_TASK_NAME } else { name };
        let mut len = name.len().min(MAX_TASK_NAME_LEN);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        let mut bytes = [0; MAX_TASK_NAME_LEN];
        bytes[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self {
            bytes,
            len: len as u8,
        }
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.bytes[..usize::from(self.len)]).unwrap_or(DEFAULT_TASK_NAME)
    }
}

impl fmt::Debug for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Task Control Block
// ---------------------------------------------------------------------------

/// Task Control Block (TCB), stored inline in the fixed-size task table.
pub(crate) struct Tcb<P: Port> {
    /// Saved stack pointer; rewritten on every switch.
    pub(crate) sp: usize,
    /// Stack pointer before the first dispatch.
    pub(crate) initial_sp: usize,
    pub(crate) stack: Option<RawBlock>,
    pub(crate) priority: u8,
    pub(crate) state: TaskState,
    pub(crate) entry: Option<TaskEntry<P>>,
    pub(crate) arg: usize,
    pub(crate) name: TaskName,
    pub(crate) generation: u16,
    /// Counted in the scheduler's running-task count.
    pub(crate) dispatched: bool,
}

impl<P: Port> Clone for Tcb<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: Port> Copy for Tcb<P> {}

impl<P: Port> Tcb<P> {
    pub(crate) const EMPTY: Self = Self {
        sp: 0,
        initial_sp: 0,
        stack: None,
        priority: 0,
        state: TaskState::INVALID,
        entry: None,
        arg: 0,
        name: TaskName::EMPTY,
        generation: 0,
        dispatched: false,
    };

    /// Zero the TCB, retiring every handle issued for it.
    fn retire(&mut self) {
        *self = Self {
            generation: self.generation.wrapping_add(1),
            ..Self::EMPTY
        };
    }
}

/// Fixed-capacity table of TCBs plus the existence mask.
pub(crate) struct TaskTable<P: Port> {
    tcbs: [Tcb<P>; MAX_TASKS],
    exist_mask: u32,
}

impl<P: Port> TaskTable<P> {
    pub(crate) const fn new() -> Self {
        Self {
            tcbs: [Tcb::EMPTY; MAX_TASKS],
            exist_mask: 0,
        }
    }

    #[inline]
    pub(crate) fn exists(&self, slot: usize) -> bool {
        self.exist_mask & bit(slot) != 0
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.exist_mask == 0
    }

    /// Map a handle to its slot.
    pub(crate) fn validate(&self, id: TaskId) -> Result<usize> {
        let slot = id.slot();
        if slot < MAX_TASKS && self.exists(slot) && self.tcbs[slot].generation == id.generation {
            Ok(slot)
        } else {
            Err(Error::InvalidParam)
        }
    }

    #[inline]
    pub(crate) fn id_of(&self, slot: usize) -> TaskId {
        TaskId {
            slot: slot as u8,
            generation: self.get(slot).generation,
        }
    }

    #[inline]
    pub(crate) fn get(&self, slot: usize) -> &Tcb<P> {
        assert!(slot < MAX_TASKS, "task: slot {} out of range", slot);
        &self.tcbs[slot]
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, slot: usize) -> &mut Tcb<P> {
        assert!(slot < MAX_TASKS, "task: slot {} out of range", slot);
        &mut self.tcbs[slot]
    }
}

impl<P: Port> KernelState<P> {
    /// Tear down the task in `slot`: clear its bits, unlink its sleep
    /// block, free its stack and retire its handle.
    pub(crate) fn destroy_idic(&mut self, slot: usize) {
        self.tasks.exist_mask &= !bit(slot);
        self.sched.clear(slot);
        self.sleep.unlink(slot);

        let tcb = self.tasks.get_mut(slot);
        let stack = tcb.stack.take();
        tcb.retire();
        if let Some(raw) = stack {
            // SAFETY: the stack block was moved into the TCB at creation.
            self.mem.free(unsafe { Block::from_raw(raw) });
        }
    }
}

// ---------------------------------------------------------------------------
// Kernel API
// ---------------------------------------------------------------------------

impl<P: Port> Kernel<P> {
    /// Create a task at `priority` with a stack of `stack_len` bytes taken
    /// from the memory pool.
    ///
    /// The task starts in `Created` state and becomes eligible at the next
    /// interrupt reschedule.
    ///
    /// # Errors
    /// - [`Error::NotInit`]: the kernel is not initialized.
    /// - [`Error::InvalidParam`]: `priority >= MAX_TASKS` or
    ///   `stack_len < MIN_STACK_LEN`.
    /// - [`Error::AlreadyExists`]: a task already holds this priority.
    /// - [`Error::NoMem`]: the pool cannot supply the stack.
    pub fn task_create(
        &self,
        name: &str,
        priority: u8,
        entry: TaskEntry<P>,
        arg: usize,
        stack_len: usize,
    ) -> Result<TaskId> {
        if usize::from(priority) >= MAX_TASKS || stack_len < MIN_STACK_LEN {
            return Err(Error::InvalidParam);
        }
        let slot = slot_of(priority);

        // Optimistic check; repeated below once the stack is in hand.
        self.with_state(|st| {
            if !st.initialized {
                Err(Error::NotInit)
            } else if st.tasks.exists(slot) {
                Err(Error::AlreadyExists)
            } else {
                Ok(())
            }
        })?;

        let stack = self.malloc(stack_len).ok_or(Error::NoMem)?;

        self.with_state(|st| {
            if st.tasks.exists(slot) {
                st.mem.free(stack);
                return Err(Error::AlreadyExists);
            }

            let stack_top = (stack.as_ptr() as usize + stack.len()) & !7;
            let tcb = st.tasks.get_mut(slot);
            *tcb = Tcb {
                sp: stack_top,
                initial_sp: stack_top,
                stack: Some(stack.into_raw()),
                priority,
                state: TaskState::CREATED,
                entry: Some(entry),
                arg,
                name: TaskName::new(name),
                generation: tcb.generation,
                dispatched: false,
            };
            st.tasks.exist_mask |= bit(slot);
            st.sched.original_mask |= bit(slot);

            let id = st.tasks.id_of(slot);
            log::debug!("task: created {:?} at priority {}", st.tasks.get(slot).name, priority);
            Ok(id)
        })
    }

    /// Delete a task that has never run.
    ///
    /// # Errors
    /// - [`Error::InvalidParam`]: stale handle.
    /// - [`Error::Busy`]: the task has been dispatched at least once; it
    ///   must end by returning from its entry function.
    pub fn task_delete(&self, id: TaskId) -> Result<()> {
        self.with_state(|st| {
            let slot = st.tasks.validate(id)?;
            let tcb = st.tasks.get(slot);
            if tcb.state != TaskState::CREATED || tcb.sp != tcb.initial_sp {
                return Err(Error::Busy);
            }
            log::debug!("task: deleted {:?}", tcb.name);
            st.destroy_idic(slot);
            Ok(())
        })
    }

    /// Handle of the task at `slot`, if one exists.
    ///
    /// # Panics
    /// If `slot >= MAX_TASKS`.
    pub fn get_task(&self, slot: usize) -> Option<TaskId> {
        assert!(slot < MAX_TASKS, "task: slot {} out of range", slot);
        self.with_state(|st| st.tasks.exists(slot).then(|| st.tasks.id_of(slot)))
    }

    /// The running task, or `None` in the boot/idle context.
    pub fn current_task(&self) -> Option<TaskId> {
        self.with_state(|st| st.sched.current.map(|slot| st.tasks.id_of(slot)))
    }

    pub fn task_state(&self, id: TaskId) -> Result<TaskState> {
        self.with_state(|st| Ok(st.tasks.get(st.tasks.validate(id)?).state))
    }

    /// Overwrite a task's state. The scheduling masks are left untouched.
    pub fn set_task_state(&self, id: TaskId, state: TaskState) -> Result<()> {
        self.with_state(|st| {
            let slot = st.tasks.validate(id)?;
            st.tasks.get_mut(slot).state = state;
            Ok(())
        })
    }

    pub fn task_name(&self, id: TaskId) -> Result<TaskName> {
        self.with_state(|st| Ok(st.tasks.get(st.tasks.validate(id)?).name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimPort;
    use crate::testing;

    fn idle(_: &'static Kernel<SimPort>, _: usize) -> i32 {
        0
    }

    #[test]
    fn test_slot_mapping() {
        assert_eq!(slot_of(31), 0);
        assert_eq!(slot_of(0), MAX_TASKS - 1);
        assert_eq!(priority_of(slot_of(7)), 7);
    }

    #[test]
    fn test_task_name_truncation() {
        assert_eq!(TaskName::new("worker").as_str(), "worker");
        assert_eq!(TaskName::new("uart-receiver").as_str(), "uart-rec");
        assert_eq!(TaskName::new("").as_str(), DEFAULT_TASK_NAME);
        // "ééééé" is 10 bytes; the cut must land on a char boundary.
        assert_eq!(TaskName::new("ééééé").as_str(), "éééé");
    }

    #[test]
    fn test_sender_code() {
        let id = TaskId {
            slot: 21,
            generation: 0x1234,
        };
        assert_eq!(id.code(), 0x0012_3415);
        assert_eq!(TaskId::from_code(id.code()), id);
    }

    #[test]
    fn test_create_validates_arguments() {
        let k = testing::kernel();
        assert_eq!(
            k.task_create("t", MAX_TASKS as u8, idle, 0, 512),
            Err(Error::InvalidParam)
        );
        assert_eq!(
            k.task_create("t", 3, idle, 0, MIN_STACK_LEN - 1),
            Err(Error::InvalidParam)
        );
        assert_eq!(k.task_create("t", 3, idle, 0, 1 << 20), Err(Error::NoMem));

        let id = k.task_create("t", 3, idle, 0, 512).unwrap();
        assert_eq!(k.task_create("u", 3, idle, 0, 512), Err(Error::AlreadyExists));
        assert_eq!(k.task_state(id), Ok(TaskState::CREATED));
        assert_eq!(k.task_name(id).unwrap().as_str(), "t");
        assert_eq!(id.priority(), 3);
        assert_eq!(k.get_task(slot_of(3)), Some(id));
        assert_eq!(k.get_task(slot_of(4)), None);
        assert_eq!(k.current_task(), None);
    }

    #[test]
    fn test_create_before_init() {
        let k = testing::bare_kernel();
        assert_eq!(k.task_create("t", 1, idle, 0, 512), Err(Error::NotInit));
    }

    #[test]
    fn test_delete_unstarted_task_frees_stack() {
        let k = testing::kernel();
        let class = testing::STACK_CLASS;
        let free_before = k.mem_stats(class).unwrap().free;

        let id = k.task_create("t", 9, idle, 0, 512).unwrap();
        assert_eq!(k.mem_stats(class).unwrap().free, free_before - 1);

        assert_eq!(k.task_delete(id), Ok(()));
        assert_eq!(k.mem_stats(class).unwrap().free, free_before);
        assert_eq!(k.task_state(id), Err(Error::InvalidParam));
        assert_eq!(k.task_delete(id), Err(Error::InvalidParam));

        // The slot is reusable, under a new generation.
        let again = k.task_create("t", 9, idle, 0, 512).unwrap();
        assert_eq!(again.slot(), id.slot());
        assert_ne!(again, id);
        assert_eq!(k.task_state(id), Err(Error::InvalidParam));
    }

    #[test]
    fn test_set_task_state() {
        let k = testing::kernel();
        let id = k.task_create("t", 2, idle, 0, 512).unwrap();
        k.set_task_state(id, TaskState::READY | TaskState::PENDING_SELF)
            .unwrap();
        assert_eq!(
            k.task_state(id),
            Ok(TaskState::READY | TaskState::PENDING_SELF)
        );
        // No longer exactly `Created`.
        assert_eq!(k.task_delete(id), Err(Error::Busy));
    }
}
