//! # Kernel
//!
//! The kernel context: one value owning every piece of kernel state, plus
//! its lifecycle and the memory API.
//!
//! All state sits behind a single [`UnsafeCell`] and is only reached through
//! [`Kernel::with_state`], which holds a critical section for the duration
//! of a closure. Port calls (which may switch contexts) are always made
//! outside those closures.
//!
//! ## Startup Sequence
//!
//! ```text
//! static KERNEL: Kernel<CortexM4> = Kernel::new(CortexM4::new());
//!
//! reset_handler (cortex-m-rt)
//!   └─► main()
//!         ├─► KERNEL.init(region, classes)      ← carve the block pool
//!         ├─► KERNEL.register_dispatcher(..)    ← tick / device dispatcher
//!         ├─► KERNEL.task_create(..) (×N)       ← tasks wait in Created
//!         └─► cortex_m4::start(&KERNEL, syst)   ← SysTick on, idle forever
//!               └─► first tick: RESCHEDULE → highest-priority task
//! ```

use core::cell::UnsafeCell;

use crate::arch::{ContextId, Port};
use crate::error::{Error, Result};
use crate::interrupt::Dispatcher;
use crate::mem::{Block, ClassStats, MemPool, PoolClass};
use crate::msgq::QueueTable;
use crate::scheduler::Scheduler;
use crate::sleep::SleepList;
use crate::sync::CriticalSection;
use crate::task::TaskTable;

// ---------------------------------------------------------------------------
// Kernel state
// ---------------------------------------------------------------------------

pub(crate) struct KernelState<P: Port> {
    pub(crate) mem: MemPool,
    pub(crate) tasks: TaskTable<P>,
    pub(crate) sched: Scheduler,
    pub(crate) sleep: SleepList,
    pub(crate) queues: QueueTable,
    pub(crate) dispatcher: Option<Dispatcher<P>>,
    pub(crate) initialized: bool,
}

impl<P: Port> KernelState<P> {
    const fn new() -> Self {
        Self {
            mem: MemPool::new(),
            tasks: TaskTable::new(),
            sched: Scheduler::new(),
            sleep: SleepList::new(),
            queues: QueueTable::new(),
            dispatcher: None,
            initialized: false,
        }
    }
}

/// The kernel.
///
/// Built in a `static` with [`Kernel::new`]; every API takes `&self`.
/// Blocking calls (`sleep`, `msgq_recv`, `pending_task`) and the interrupt
/// entry need `&'static self`, since a suspended context keeps the kernel
/// borrowed across switches.
pub struct Kernel<P: Port> {
    pub(crate) port: P,
    state: UnsafeCell<KernelState<P>>,
}

// SAFETY: the state is only touched inside `with_state`, which runs with
// interrupts disabled on a single core.
unsafe impl<P: Port> Sync for Kernel<P> {}

impl<P: Port> Kernel<P> {
    pub const fn new(port: P) -> Self {
        Self {
            port,
            state: UnsafeCell::new(KernelState::new()),
        }
    }

    #[inline]
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Run `f` on the kernel state with interrupts disabled.
    ///
    /// `f` must not call back into any API that takes the state again.
    #[inline]
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut KernelState<P>) -> R) -> R {
        let _cs = CriticalSection::enter(&self.port);
        // SAFETY: interrupts are disabled and closures never nest, so this
        // is the only live reference.
        f(unsafe { &mut *self.state.get() })
    }

    /// Address of the stack pointer slot the port saves `ctx` into.
    #[cfg_attr(not(all(target_arch = "arm", target_os = "none")), allow(dead_code))]
    pub(crate) fn saved_sp_ptr(&self, ctx: ContextId) -> *mut usize {
        self.with_state(|st| match ctx {
            ContextId::Boot => core::ptr::addr_of_mut!(st.sched.boot_sp),
            ContextId::Task(slot) => core::ptr::addr_of_mut!(st.tasks.get_mut(slot).sp),
        })
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Initialize the kernel and carve `region` into the pool `classes`.
    /// Returns the number of region bytes consumed.
    ///
    /// # Errors
    /// - [`Error::NotSupported`]: already initialized.
    /// - [`Error::InvalidConfig`], [`Error::NoMem`]: see [`MemPool::init`].
    pub fn init(&self, region: &'static mut [u8], classes: &[PoolClass]) -> Result<usize> {
        self.with_state(|st| {
            if st.initialized {
                return Err(Error::NotSupported);
            }
            let used = st.mem.init(region, classes)?;
            st.initialized = true;
            log::info!("kernel: initialized, {} pool bytes in {} classes", used, classes.len());
            Ok(used)
        })
    }

    /// Tear the kernel down so it can be initialized again.
    ///
    /// # Errors
    /// - [`Error::NotInit`]: not initialized.
    /// - [`Error::Busy`]: tasks or queues are still alive.
    pub fn deinit(&self) -> Result<()> {
        self.with_state(|st| {
            if !st.initialized {
                return Err(Error::NotInit);
            }
            if !st.tasks.is_empty() || !st.queues.is_empty() {
                return Err(Error::Busy);
            }
            st.mem.destroy()?;
            // Task and queue tables keep their generations so handles from
            // before the teardown stay stale.
            st.sched = Scheduler::new();
            st.sleep = SleepList::new();
            st.dispatcher = None;
            st.initialized = false;
            log::info!("kernel: deinitialized");
            Ok(())
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.with_state(|st| st.initialized)
    }

    // -----------------------------------------------------------------------
    // Memory
    // -----------------------------------------------------------------------

    /// Allocate from the kernel pool. See [`MemPool::malloc`].
    pub fn malloc(&self, len: usize) -> Option<Block> {
        self.with_state(|st| st.mem.malloc(len))
    }

    /// # Panics
    /// On a corrupted header or a double free.
    pub fn free(&self, block: Block) {
        self.with_state(|st| st.mem.free(block));
    }

    pub fn add_pool(&self, region: &'static mut [u8], block_size: usize) -> Result<usize> {
        self.with_state(|st| st.mem.add_pool(region, block_size))
    }

    pub fn mem_stats(&self, class: usize) -> Option<ClassStats> {
        self.with_state(|st| st.mem.stats(class))
    }

    pub fn mem_report(&self, prompt: &str) {
        self.with_state(|st| st.mem.report(prompt));
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
    fn test_init_twice_is_refused() {
        let k = testing::kernel();
        assert!(k.is_initialized());
        assert_eq!(
            k.init(testing::region(4096), &testing::CLASSES),
            Err(Error::NotSupported)
        );
    }

    #[test]
    fn test_init_rejects_bad_layout() {
        let k = testing::bare_kernel();
        assert_eq!(k.init(testing::region(4096), &[]), Err(Error::InvalidConfig));
        assert!(!k.is_initialized());
        assert_eq!(k.init(testing::region(16), &testing::CLASSES), Err(Error::NoMem));
        assert!(!k.is_initialized());
    }

    #[test]
    fn test_deinit_lifecycle() {
        let k = testing::bare_kernel();
        assert_eq!(k.deinit(), Err(Error::NotInit));

        k.init(testing::region(64 * 1024), &testing::CLASSES).unwrap();
        let id = k.task_create("t", 1, idle, 0, 512).unwrap();
        assert_eq!(k.deinit(), Err(Error::Busy));

        k.task_delete(id).unwrap();
        let q = k.msgq_create(0).unwrap();
        assert_eq!(k.deinit(), Err(Error::Busy));

        k.msgq_destroy(q).unwrap();
        assert_eq!(k.deinit(), Ok(()));
        assert!(!k.is_initialized());
        assert!(k.malloc(8).is_none());

        // A torn-down kernel can be brought up again.
        k.init(testing::region(64 * 1024), &testing::CLASSES).unwrap();
        assert_eq!(k.tick(), 0);
        assert!(k.task_create("t", 1, idle, 0, 512).is_ok());
    }

    #[test]
    fn test_handles_stay_stale_across_reinit() {
        let k = testing::kernel();
        let old_task = k.task_create("t", 1, idle, 0, 512).unwrap();
        k.task_delete(old_task).unwrap();
        let old_queue = k.msgq_create(0).unwrap();
        k.msgq_destroy(old_queue).unwrap();
        k.deinit().unwrap();

        k.init(testing::region(64 * 1024), &testing::CLASSES).unwrap();
        let task = k.task_create("t", 1, idle, 0, 512).unwrap();
        let queue = k.msgq_create(0).unwrap();
        assert_eq!(task.slot(), old_task.slot());
        assert_ne!(task, old_task);
        assert_ne!(queue, old_queue);
        assert_eq!(k.task_state(old_task), Err(Error::InvalidParam));
        assert_eq!(k.task_delete(old_task), Err(Error::InvalidParam));
        assert_eq!(k.msgq_type(old_queue), Err(Error::InvalidParam));
        assert_eq!(k.msgq_type(queue), Ok(0));
    }

    #[test]
    fn test_memory_api() {
        let k = testing::kernel();
        assert!(k.malloc(0).is_none());

        let mut block = k.malloc(100).unwrap();
        assert_eq!(block.capacity(), 512);
        block.as_bytes_mut().fill(0x5a);
        assert_eq!(k.mem_stats(1).unwrap().used(), 1);

        k.free(block);
        let stats = k.mem_stats(1).unwrap();
        assert_eq!((stats.used(), stats.max_used), (0, 1));
        assert!(k.mem_stats(testing::CLASSES.len()).is_none());
        k.mem_report("test");
    }

    #[test]
    fn test_add_pool_through_kernel() {
        let k = testing::kernel();
        let before = k.mem_stats(0).unwrap();
        let added = k.add_pool(testing::region(4096), 64).unwrap();
        assert!(added > 0);

        let after = k.mem_stats(0).unwrap();
        assert_eq!(after.total, before.total + added);
        assert_eq!(after.free, before.free + added);
        assert_eq!(k.add_pool(testing::region(4096), 100), Err(Error::InvalidParam));
    }

    #[test]
    fn test_uninitialized_kernel() {
        let k = testing::bare_kernel();
        assert!(k.malloc(8).is_none());
        assert_eq!(k.add_pool(testing::region(4096), 64), Err(Error::NotInit));
        assert!(k.mem_stats(0).is_none());
    }
}
