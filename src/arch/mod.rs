//! # Architecture Abstraction Layer
//!
//! Provides a hardware abstraction boundary for the scheduler. The kernel is
//! written purely against [`Port`]; a port supplies interrupt masking, the
//! first stack frame of a task and the register save/restore of a context
//! switch.
//!
//! - `cortex_m4`: PendSV-based port for ARM Cortex-M4 (bare metal only)
//! - `sim`: hosted port, one OS thread per task context (tests, `std`)

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m4;

#[cfg(any(test, feature = "std"))]
pub mod sim;

use crate::kernel::Kernel;
use crate::sync::IrqState;

/// An execution context known to the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextId {
    /// The boot/idle context: whatever called into the kernel before any
    /// task ran. Never represented in the scheduling masks.
    Boot,
    /// The task occupying the given slot.
    Task(usize),
}

/// Platform capability required by the kernel.
///
/// # Safety
///
/// Implementations must honor the switch protocol:
///
/// - `restore_interrupts` re-enables interrupts only if the snapshot was
///   taken with interrupts enabled.
/// - A context started by `init_frame` must begin by calling
///   [`Kernel::run_task`] with the same kernel and slot.
/// - `save_and_switch` suspends the calling context `from` and resumes
///   `to`; it returns once `from` is dispatched again.
/// - `switch_to` resumes `to` without saving the calling context.
pub unsafe trait Port: Sized + Sync + 'static {
    /// Disable interrupts and return the previous state.
    fn disable_interrupts(&self) -> IrqState;

    /// Restore the state captured by [`Self::disable_interrupts`].
    fn restore_interrupts(&self, prev: IrqState);

    fn interrupts_enabled(&self) -> bool;

    /// Build the initial frame of the task in `slot` on the stack ending at
    /// `stack_top` and return the resulting stack pointer.
    ///
    /// # Safety
    /// Interrupts are disabled; `stack_top` is the top of a live stack
    /// block owned by the task.
    unsafe fn init_frame(&self, kernel: &'static Kernel<Self>, slot: usize, stack_top: usize)
        -> usize;

    /// # Safety
    /// Interrupts are disabled and `from` is the calling context.
    unsafe fn save_and_switch(&self, kernel: &'static Kernel<Self>, from: ContextId, to: ContextId);

    /// # Safety
    /// Interrupts are disabled and the calling context is dead: it is never
    /// resumed again.
    unsafe fn switch_to(&self, kernel: &'static Kernel<Self>, to: ContextId);
}
