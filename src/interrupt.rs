//! # Interrupt Entry/Exit
//!
//! The single trap path shared by every interrupt source:
//!
//! ```text
//! port trap handler (interrupts masked)
//!   └─► Kernel::interrupt_entry()
//!         ├─ current task: Running → Interrupted
//!         ├─ dispatcher(kernel, tick) → IsrAction    ← in_isr
//!         ├─ UPDATE_TICK: tick += 1, sleep wake scan
//!         └─ RESCHEDULE:  working = original, pick, dispatch
//!            otherwise:   resume the interrupted context
//! ```
//!
//! Nested interrupts are not supported: the dispatcher always runs with
//! interrupts disabled.

use bitflags::bitflags;

use crate::arch::Port;
use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::scheduler::{Outgoing, Tick};
use crate::task::TaskState;

bitflags! {
    /// What the kernel does after the dispatcher returns.
    pub struct IsrAction: u8 {
        /// Pick the highest-priority runnable task.
        const RESCHEDULE  = 0x01;
        /// One system tick elapsed.
        const UPDATE_TICK = 0x02;
    }
}

/// The interrupt dispatcher: services the hardware cause and reports what
/// the kernel should do next. Receives the tick value before any update.
pub type Dispatcher<P> = fn(&'static Kernel<P>, Tick) -> IsrAction;

impl<P: Port> Kernel<P> {
    /// Register the interrupt dispatcher, replacing the previous one.
    ///
    /// # Errors
    /// [`Error::InvalidParam`] for `None`; the dispatcher is cleared.
    pub fn register_dispatcher(&self, dispatcher: Option<Dispatcher<P>>) -> Result<()> {
        self.with_state(|st| st.dispatcher = dispatcher);
        dispatcher.map(|_| ()).ok_or(Error::InvalidParam)
    }

    /// Is the interrupt dispatcher running?
    pub fn in_isr(&self) -> bool {
        self.with_state(|st| st.sched.in_isr)
    }

    /// Kernel side of the interrupt trap.
    ///
    /// Called by the port with interrupts disabled, on the stack of the
    /// interrupted context. May switch to another context; returns when the
    /// interrupted context is dispatched again.
    pub fn interrupt_entry(&'static self) {
        debug_assert!(
            !self.port.interrupts_enabled(),
            "isr: entered with interrupts enabled"
        );

        let (dispatcher, tick) = self.with_state(|st| {
            assert!(!st.sched.in_isr, "isr: nested interrupt");
            if let Some(slot) = st.sched.current {
                let tcb = st.tasks.get_mut(slot);
                tcb.state.remove(TaskState::RUNNING);
                tcb.state.insert(TaskState::INTERRUPTED);
            }
            st.sched.in_isr = true;
            (st.dispatcher, st.sched.tick)
        });

        let action = match dispatcher {
            Some(dispatcher) => dispatcher(self, tick),
            None => IsrAction::empty(),
        };

        let next = self.with_state(|st| {
            if action.contains(IsrAction::UPDATE_TICK) {
                st.sched.tick = st.sched.tick.wrapping_add(1);
                let now = st.sched.tick;
                st.tick_update(now);
            }
            st.sched.in_isr = false;

            if action.contains(IsrAction::RESCHEDULE) {
                st.sched.working_mask = st.sched.original_mask;
                st.pick_next()
            } else {
                st.sched.current
            }
        });

        // SAFETY: interrupts are disabled for the whole trap.
        unsafe { self.dispatch(Outgoing::Current, next, TaskState::INTERRUPTED) };
    }
}
