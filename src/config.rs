//! # tickos Configuration
//!
//! Compile-time constants governing the kernel. All limits are fixed at
//! compile time; the only runtime-sized resource is the memory pool, whose
//! layout is passed to [`Kernel::init`](crate::Kernel::init).

/// Number of priority levels, and therefore the maximum number of tasks.
/// One task per priority. Must not exceed 32: every priority owns one bit of
/// the `u32` scheduling masks.
pub const MAX_TASKS: usize = 32;

/// Smallest stack a task may be created with, in bytes.
pub const MIN_STACK_LEN: usize = 512;

/// Task names longer than this are truncated.
pub const MAX_TASK_NAME_LEN: usize = 8;

/// Name recorded for tasks created with an empty name.
pub const DEFAULT_TASK_NAME: &str = "NULL";

/// Maximum number of memory pool size classes.
pub const MAX_POOL_CLASSES: usize = 16;

/// Capacity of the message queue table.
pub const MAX_QUEUES: usize = 16;

/// Length of one system tick in milliseconds.
pub const TICK_PERIOD_MS: u32 = 16;

/// Integrity tag written into every memory pool block header.
pub const MEM_CHECK_FLAG: u32 = 0xdead_beef;

/// Integrity tag written into every message buffer header.
pub const MSG_CHECK_FLAG: u32 = 0x1985_1123;

/// Sender code stamped on messages sent from interrupt context.
pub const INTERRUPT_SENDER: u32 = 0x00f0_beef;

/// Sender code stamped on messages sent from the boot/idle context.
pub const BOOT_SENDER: u32 = 0xffff_ffff;

/// Core clock of the reference board, in Hz. Used by the Cortex-M4 port to
/// derive the SysTick reload value.
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

/// SysTick frequency in Hz, derived from [`TICK_PERIOD_MS`].
pub const TICK_HZ: u32 = 1000 / TICK_PERIOD_MS;

const _: () = assert!(MAX_TASKS <= 32);
const _: () = assert!(MAX_TASKS <= u8::MAX as usize);
