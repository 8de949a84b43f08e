//! # Simulation Port
//!
//! Runs the kernel on a hosted OS. Every task context is a thread; the boot
//! context is whichever thread drives the kernel (the test thread). Exactly
//! one context owns the simulated CPU at a time:
//!
//! ```text
//!  boot ──save_and_switch(Boot, T1)──► T1 runs ──sleep──► T2 runs ──end──► boot
//!   ▲ blocked on condvar                blocked                            │
//!   └──────────────────────────── switch_to(Boot) ◄────────────────────────┘
//! ```
//!
//! Interrupts are synchronous: [`SimPort::raise_interrupt`] runs the trap
//! path on the calling context, exactly where a hardware interrupt would
//! land between two instructions.
//!
//! A panic inside a task thread hands the CPU back to the boot context,
//! which re-raises it.

use core::mem::size_of;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use super::{ContextId, Port};
use crate::kernel::Kernel;
use crate::sync::IrqState;

/// How long the boot context waits for the CPU before declaring the
/// simulation deadlocked.
const BOOT_TIMEOUT: Duration = Duration::from_secs(30);

struct Cpu {
    owner: ContextId,
    panicked: bool,
}

pub struct SimPort {
    irq_enabled: AtomicBool,
    cpu: Mutex<Cpu>,
    handover: Condvar,
}

impl SimPort {
    pub const fn new() -> Self {
        Self {
            irq_enabled: AtomicBool::new(true),
            cpu: Mutex::new(Cpu {
                owner: ContextId::Boot,
                panicked: false,
            }),
            handover: Condvar::new(),
        }
    }

    /// Take an interrupt on the calling context.
    ///
    /// # Panics
    /// If interrupts are disabled.
    pub fn raise_interrupt(kernel: &'static Kernel<SimPort>) {
        let port = kernel.port();
        let prev = port.disable_interrupts();
        assert!(prev.was_enabled(), "sim: interrupt raised with interrupts disabled");
        kernel.interrupt_entry();
        port.restore_interrupts(prev);
    }

    fn lock(&self) -> MutexGuard<'_, Cpu> {
        self.cpu.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until `me` owns the CPU.
    fn wait_for<'a>(&'a self, mut cpu: MutexGuard<'a, Cpu>, me: ContextId) -> MutexGuard<'a, Cpu> {
        while cpu.owner != me {
            cpu = if me == ContextId::Boot {
                let (cpu, timeout) = self
                    .handover
                    .wait_timeout(cpu, BOOT_TIMEOUT)
                    .unwrap_or_else(PoisonError::into_inner);
                assert!(
                    !timeout.timed_out() || cpu.owner == me,
                    "sim: boot context starved (CPU held by {:?})",
                    cpu.owner
                );
                cpu
            } else {
                self.handover.wait(cpu).unwrap_or_else(PoisonError::into_inner)
            };
        }
        if me == ContextId::Boot && cpu.panicked {
            drop(cpu);
            panic!("sim: a task panicked");
        }
        cpu
    }

    fn hand_over(&self, cpu: &mut Cpu, to: ContextId) {
        cpu.owner = to;
        self.handover.notify_all();
    }
}

impl Default for SimPort {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Port for SimPort {
    fn disable_interrupts(&self) -> IrqState {
        IrqState::new(self.irq_enabled.swap(false, Ordering::SeqCst))
    }

    fn restore_interrupts(&self, prev: IrqState) {
        if prev.was_enabled() {
            self.irq_enabled.store(true, Ordering::SeqCst);
        }
    }

    fn interrupts_enabled(&self) -> bool {
        self.irq_enabled.load(Ordering::SeqCst)
    }

    unsafe fn init_frame(&self, kernel: &'static Kernel<Self>, slot: usize, stack_top: usize) -> usize {
        thread::Builder::new()
            .name(format!("task-{}", slot))
            .spawn(move || {
                let port = kernel.port();
                drop(port.wait_for(port.lock(), ContextId::Task(slot)));
                if catch_unwind(AssertUnwindSafe(|| kernel.run_task(slot))).is_err() {
                    let mut cpu = port.lock();
                    cpu.panicked = true;
                    port.hand_over(&mut cpu, ContextId::Boot);
                }
            })
            .unwrap_or_else(|e| panic!("sim: cannot spawn thread for slot {}: {}", slot, e));

        // The frame lives in the thread; reserve the space a register frame
        // would take so the stack pointer still moves.
        stack_top - 16 * size_of::<usize>()
    }

    unsafe fn save_and_switch(&self, _kernel: &'static Kernel<Self>, from: ContextId, to: ContextId) {
        let mut cpu = self.lock();
        self.hand_over(&mut cpu, to);
        drop(self.wait_for(cpu, from));
    }

    unsafe fn switch_to(&self, _kernel: &'static Kernel<Self>, to: ContextId) {
        let mut cpu = self.lock();
        self.hand_over(&mut cpu, to);
    }
}
