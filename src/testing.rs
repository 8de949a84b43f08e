//! Shared fixtures for the unit tests: leaked kernels on the simulation
//! port, a standard pool layout and stock dispatchers.

use crate::arch::sim::SimPort;
use crate::interrupt::IsrAction;
use crate::kernel::Kernel;
use crate::mem::PoolClass;
use crate::scheduler::Tick;

pub(crate) const CLASSES: [PoolClass; 3] = [
    PoolClass::new(64, 16),
    PoolClass::new(512, 8),
    PoolClass::new(2048, 8),
];

/// Class that serves a minimum-size task stack.
pub(crate) const STACK_CLASS: usize = 1;

pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub(crate) fn region(len: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; len].into_boxed_slice())
}

/// An uninitialized kernel.
pub(crate) fn bare_kernel() -> &'static Kernel<SimPort> {
    init_logger();
    Box::leak(Box::new(Kernel::new(SimPort::new())))
}

/// A kernel initialized with [`CLASSES`] over a 64 KiB region.
pub(crate) fn kernel() -> &'static Kernel<SimPort> {
    let k = bare_kernel();
    k.init(region(64 * 1024), &CLASSES)
        .expect("test kernel init");
    k
}

pub(crate) fn reschedule(_: &'static Kernel<SimPort>, _: Tick) -> IsrAction {
    IsrAction::RESCHEDULE
}

pub(crate) fn tick(_: &'static Kernel<SimPort>, _: Tick) -> IsrAction {
    IsrAction::UPDATE_TICK | IsrAction::RESCHEDULE
}

pub(crate) fn tick_only(_: &'static Kernel<SimPort>, _: Tick) -> IsrAction {
    IsrAction::UPDATE_TICK
}
