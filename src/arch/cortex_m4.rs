//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2) processor.
//! Implements context switching via PendSV, SysTick timer configuration,
//! and PRIMASK-based interrupt masking.
//!
//! ## Context Switch Mechanism
//!
//! Every context, the boot/idle context included, runs in Thread mode on
//! the **PSP**; the **MSP** is left to exception handlers. On exception
//! entry the hardware stacks R0–R3, R12, LR, PC and xPSR onto the PSP. The
//! PendSV handler saves R4–R11 below them and stores the PSP through
//! `SAVE_SP`, then restores the context whose saved PSP is behind
//! `LOAD_SP`.
//!
//! ```text
//! save_and_switch(from, to)          switch_to(to)
//!   SAVE_SP = &sp(from)                SAVE_SP = null
//!   LOAD_SP = &sp(to)                  LOAD_SP = &sp(to)
//!   pend PendSV                        pend PendSV
//!   Thread mode: cpsie; isb; cpsid     Thread mode: cpsie; wfi forever
//!   Handler mode: taken on exit        Handler mode: taken on exit
//! ```
//!
//! The FPU context is not saved: build for `thumbv7em-none-eabi`.
//!
//! ## Interrupt Priorities
//!
//! SysTick and PendSV share the lowest priority (0xFF), so a switch pended
//! from the tick tail-chains after it and never preempts a device ISR.
//!
//! ## Usage
//!
//! ```ignore
//! static KERNEL: Kernel<CortexM4> = Kernel::new(CortexM4::new());
//!
//! #[entry]
//! fn main() -> ! {
//!     let mut cp = cortex_m::Peripherals::take().unwrap();
//!     KERNEL.init(pool_region(), &CLASSES).unwrap();
//!     KERNEL.register_dispatcher(Some(dispatch)).unwrap();
//!     KERNEL.task_create("blink", 3, blink, 0, 1024).unwrap();
//!     cortex_m4::start(&KERNEL, &mut cp.SYST, idle_stack(), idle)
//! }
//! ```

use core::arch::{asm, global_asm};
use core::mem::size_of;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use cortex_m::interrupt;
use cortex_m::peripheral::scb::VectActive;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{SCB, SYST};
use cortex_m::register;
use cortex_m_rt::exception;

use super::{ContextId, Port};
use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::kernel::Kernel;
use crate::sync::IrqState;

/// Words in an initial frame: R4–R11, then the hardware frame.
const FRAME_WORDS: usize = 16;
/// xPSR with only the Thumb bit set.
const XPSR_THUMB: usize = 0x0100_0000;

/// The PRIMASK-based Cortex-M4 port.
pub struct CortexM4 {
    _private: (),
}

impl CortexM4 {
    pub const fn new() -> Self {
        Self { _private: () }
    }
}

impl Default for CortexM4 {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// SysTick configuration
// ---------------------------------------------------------------------------

/// Configure the SysTick timer to fire at `TICK_HZ` from the processor
/// clock.
pub fn configure_systick(syst: &mut SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

// ---------------------------------------------------------------------------
// PendSV trigger
// ---------------------------------------------------------------------------

/// Set the PENDSVSET bit in the Interrupt Control and State Register.
#[inline]
pub fn trigger_pendsv() {
    // ICSR address: 0xE000_ED04, PENDSVSET = bit 28
    const ICSR: *mut u32 = 0xE000_ED04 as *mut u32;
    unsafe {
        ptr::write_volatile(ICSR, 1 << 28);
    }
}

/// Pend the switch and, from Thread mode, open a one-instruction window so
/// PendSV is taken right here.
unsafe fn pend_switch() {
    trigger_pendsv();
    if SCB::vect_active() == VectActive::ThreadMode {
        interrupt::enable();
        cortex_m::asm::isb();
        interrupt::disable();
    }
}

// ---------------------------------------------------------------------------
// Interrupt priority configuration
// ---------------------------------------------------------------------------

/// Set PendSV and SysTick to the lowest interrupt priority.
pub fn set_interrupt_priorities() {
    unsafe {
        // System Handler Priority Register 3 (SHPR3): 0xE000_ED20
        // Bits [23:16] = PendSV priority
        // Bits [31:24] = SysTick priority
        let shpr3: *mut u32 = 0xE000_ED20 as *mut u32;
        let val = ptr::read_volatile(shpr3);
        let val = val | (0xFF << 16) | (0xFF << 24);
        ptr::write_volatile(shpr3, val);
    }
}

// ---------------------------------------------------------------------------
// PendSV handler (context switch)
// ---------------------------------------------------------------------------

/// Where PendSV stores the outgoing PSP; null when the outgoing context is
/// dead.
static SAVE_SP: AtomicPtr<usize> = AtomicPtr::new(ptr::null_mut());
/// Where PendSV loads the incoming PSP from.
static LOAD_SP: AtomicPtr<usize> = AtomicPtr::new(ptr::null_mut());

global_asm!(
    ".section .text.PendSV,\"ax\",%progbits",
    ".global PendSV",
    ".type PendSV,%function",
    ".thumb_func",
    "PendSV:",
    // --- Save current context (skipped for a dead context) ---
    "    ldr r2, ={save}",
    "    ldr r1, [r2]",
    "    cbz r1, 1f",
    "    mrs r0, psp",
    "    stmdb r0!, {{r4-r11}}",
    "    str r0, [r1]",
    // --- Restore next context ---
    "1:",
    "    ldr r2, ={load}",
    "    ldr r1, [r2]",
    "    ldr r0, [r1]",
    "    ldmia r0!, {{r4-r11}}",
    "    msr psp, r0",
    // Return to Thread mode on the PSP
    "    ldr r0, =0xFFFFFFFD",
    "    bx r0",
    ".ltorg",
    save = sym SAVE_SP,
    load = sym LOAD_SP,
);

/// First code of every task context. R0 and R1 come from the frame built
/// by `init_frame`.
extern "C" fn trampoline(kernel: usize, slot: usize) -> ! {
    // SAFETY: `init_frame` stores a `&'static Kernel<CortexM4>` in R0.
    let kernel = unsafe { &*(kernel as *const Kernel<CortexM4>) };
    kernel.run_task(slot);
    loop {
        cortex_m::asm::wfi();
    }
}

unsafe impl Port for CortexM4 {
    #[inline]
    fn disable_interrupts(&self) -> IrqState {
        let enabled = register::primask::read().is_active();
        interrupt::disable();
        IrqState::new(enabled)
    }

    #[inline]
    fn restore_interrupts(&self, prev: IrqState) {
        if prev.was_enabled() {
            unsafe { interrupt::enable() };
        }
    }

    #[inline]
    fn interrupts_enabled(&self) -> bool {
        register::primask::read().is_active()
    }

    unsafe fn init_frame(&self, kernel: &'static Kernel<Self>, slot: usize, stack_top: usize) -> usize {
        debug_assert_eq!(stack_top % 8, 0, "port: misaligned stack top");
        let frame = (stack_top as *mut usize).sub(FRAME_WORDS);
        let words: [usize; FRAME_WORDS] = [
            // R4-R11
            0, 0, 0, 0, 0, 0, 0, 0,
            // R0 (kernel), R1 (slot), R2, R3, R12
            kernel as *const Kernel<Self> as usize, slot, 0, 0, 0,
            // LR, PC, xPSR
            0, trampoline as usize & !1, XPSR_THUMB,
        ];
        ptr::write(frame as *mut [usize; FRAME_WORDS], words);
        debug_assert_eq!(stack_top - frame as usize, FRAME_WORDS * size_of::<usize>());
        frame as usize
    }

    unsafe fn save_and_switch(&self, kernel: &'static Kernel<Self>, from: ContextId, to: ContextId) {
        SAVE_SP.store(kernel.saved_sp_ptr(from), Ordering::Relaxed);
        LOAD_SP.store(kernel.saved_sp_ptr(to), Ordering::Relaxed);
        pend_switch();
    }

    unsafe fn switch_to(&self, kernel: &'static Kernel<Self>, to: ContextId) {
        SAVE_SP.store(ptr::null_mut(), Ordering::Relaxed);
        LOAD_SP.store(kernel.saved_sp_ptr(to), Ordering::Relaxed);
        trigger_pendsv();
        if SCB::vect_active() == VectActive::ThreadMode {
            interrupt::enable();
            loop {
                cortex_m::asm::wfi();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Startup and SysTick handler
// ---------------------------------------------------------------------------

static KERNEL: AtomicPtr<Kernel<CortexM4>> = AtomicPtr::new(ptr::null_mut());

/// Start the kernel. **Does not return.**
///
/// Registers `kernel` with the tick handler, configures SysTick and moves
/// the calling code onto `idle_stack` as the boot/idle context, continuing
/// in `idle`. The first tick reschedules to the highest-priority task.
pub fn start(
    kernel: &'static Kernel<CortexM4>,
    syst: &mut SYST,
    idle_stack: &'static mut [usize],
    idle: extern "C" fn() -> !,
) -> ! {
    interrupt::disable();
    KERNEL.store(kernel as *const _ as *mut _, Ordering::Release);
    set_interrupt_priorities();
    configure_systick(syst);

    let top = idle_stack.as_mut_ptr_range().end as usize & !7;
    unsafe { enter_process_stack(top, idle) }
}

/// Switch Thread mode to the PSP at `psp_top`, enable interrupts and jump
/// to `entry`.
unsafe fn enter_process_stack(psp_top: usize, entry: extern "C" fn() -> !) -> ! {
    asm!(
        "msr psp, r0",
        // CONTROL.SPSEL = 1: Thread mode uses the PSP
        "movs r0, #2",
        "msr control, r0",
        "isb",
        "cpsie i",
        "bx r1",
        in("r0") psp_top,
        in("r1") entry,
        options(noreturn)
    );
}

#[exception]
fn SysTick() {
    let kernel = KERNEL.load(Ordering::Acquire);
    if kernel.is_null() {
        return;
    }
    // SAFETY: `start` stores a `&'static Kernel`.
    let kernel = unsafe { &*kernel };
    let prev = kernel.port().disable_interrupts();
    kernel.interrupt_entry();
    kernel.port().restore_interrupts(prev);
}
