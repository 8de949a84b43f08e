//! # tickos
//!
//! A small preemptive real-time kernel for single-core microcontrollers:
//! one task per priority level, bitmask scheduling, tick-driven sleeps and
//! blocking message queues, all on a block memory pool.
//!
//! ## Overview
//!
//! - **Scheduling**: every priority owns one bit of a 32-bit mask; the
//!   next task is the mask's lowest set bit, found in O(1).
//! - **Interrupts**: a single registered dispatcher decides, per interrupt,
//!   whether the tick advances and whether to reschedule.
//! - **Blocking**: `sleep`, `msgq_recv` and `pending_task` pend the caller;
//!   `resume_task` (directly, from a tick, or from a send) is the only way
//!   back.
//! - **Memory**: stacks and message buffers come from fixed power-of-two
//!   size classes carved out of a `'static` region. No heap.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Application Tasks                    │
//! ├─────────────────────────────────────────────────────────┤
//! │                 Kernel<P> (kernel.rs)                   │
//! │       init · deinit · malloc · free · mem_report        │
//! ├──────────────┬──────────────┬──────────────┬────────────┤
//! │  Scheduler   │  Interrupt   │  Sleep       │  MsgQ      │
//! │  scheduler.rs│  interrupt.rs│  sleep.rs    │  msgq.rs   │
//! │  ─ pick      │  ─ entry     │  ─ sleep     │  ─ send    │
//! │  ─ dispatch  │  ─ dispatcher│  ─ tick scan │  ─ recv    │
//! ├──────────────┴──────────────┴──────────────┴────────────┤
//! │  Task Model (task.rs)    │  Block Pool (mem.rs)         │
//! │  TCB · TaskId · states   │  classes · free lists        │
//! ├──────────────────────────┴──────────────────────────────┤
//! │  list.rs · sync.rs · error.rs · config.rs · log_sink.rs │
//! ├─────────────────────────────────────────────────────────┤
//! │   Port (arch/): cortex_m4.rs (PendSV) · sim.rs (host)   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Memory Model
//!
//! - **No `alloc`**: pure `core` on targets; `std` only for the simulation
//!   port
//! - **One kernel value**: all state lives in a [`Kernel`], usually a
//!   `static`
//! - **Generational handles**: [`TaskId`] and [`QueueId`] are indexes plus
//!   a generation, never addresses
//! - **Critical sections**: interrupt masking through [`Port`]

#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub mod arch;
pub mod config;
pub mod error;
pub mod interrupt;
pub mod kernel;
pub mod list;
pub mod log_sink;
pub mod mem;
pub mod msgq;
pub mod scheduler;
pub mod sleep;
pub mod sync;
pub mod task;

#[cfg(test)]
mod testing;

pub use arch::{ContextId, Port};
pub use error::{Error, Result};
pub use interrupt::{Dispatcher, IsrAction};
pub use kernel::Kernel;
pub use mem::{Block, ClassStats, MemPool, PoolClass};
pub use msgq::{Message, MsgBuf, QueueId, Sender};
pub use scheduler::Tick;
pub use sync::{CriticalSection, IrqState};
pub use task::{TaskEntry, TaskId, TaskName, TaskState};
