//! # Synchronization Primitives
//!
//! Interrupt-safe critical sections. All kernel state must be accessed
//! within a critical section to prevent data races between the running
//! context and the interrupt handler.
//!
//! There is no lock counter: entering snapshots the interrupt mask and
//! disables interrupts, leaving re-enables them only if the snapshot had
//! them enabled. Nested sections therefore compose without bookkeeping.

use crate::arch::Port;

/// Snapshot of the interrupt-enable state taken on entry to a critical
/// section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqState {
    enabled: bool,
}

impl IrqState {
    pub const ENABLED: Self = Self { enabled: true };
    pub const DISABLED: Self = Self { enabled: false };

    #[inline]
    pub const fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Were interrupts enabled when the snapshot was taken?
    #[inline]
    pub const fn was_enabled(self) -> bool {
        self.enabled
    }
}

/// RAII critical section guard. Interrupts stay disabled until the guard is
/// dropped.
///
/// # Usage
/// ```ignore
/// let _cs = CriticalSection::enter(kernel.port());
/// // access kernel state
/// ```
///
/// A context switch may happen while a guard is alive (a task blocking in
/// `msgq_recv` holds one); the guard is released when that context is
/// dispatched again and unwinds its own stack.
pub struct CriticalSection<'a, P: Port> {
    port: &'a P,
    prev: IrqState,
}

impl<'a, P: Port> CriticalSection<'a, P> {
    #[inline]
    pub fn enter(port: &'a P) -> Self {
        let prev = port.disable_interrupts();
        Self { port, prev }
    }
}

impl<P: Port> Drop for CriticalSection<'_, P> {
    #[inline]
    fn drop(&mut self) {
        self.port.restore_interrupts(self.prev);
    }
}

/// Execute a closure within a critical section (interrupts disabled).
#[inline]
pub fn critical_section<P: Port, R>(port: &P, f: impl FnOnce() -> R) -> R {
    let _cs = CriticalSection::enter(port);
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimPort;

    #[test]
    fn test_nested_sections_restore_outer_state() {
        let port = SimPort::new();
        assert!(port.interrupts_enabled());
        {
            let _outer = CriticalSection::enter(&port);
            assert!(!port.interrupts_enabled());
            {
                let _inner = CriticalSection::enter(&port);
                assert!(!port.interrupts_enabled());
            }
            // Leaving the inner section must not re-enable interrupts.
            assert!(!port.interrupts_enabled());
        }
        assert!(port.interrupts_enabled());
    }

    #[test]
    fn test_closure_form() {
        let port = SimPort::new();
        let seen = critical_section(&port, || port.interrupts_enabled());
        assert!(!seen);
        assert!(port.interrupts_enabled());
    }

    #[test]
    fn test_restore_disabled_snapshot_is_noop() {
        let port = SimPort::new();
        let _ = port.disable_interrupts();
        port.restore_interrupts(IrqState::DISABLED);
        assert!(!port.interrupts_enabled());
        port.restore_interrupts(IrqState::ENABLED);
        assert!(port.interrupts_enabled());
    }
}
