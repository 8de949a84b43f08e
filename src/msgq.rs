//! # Message Queues
//!
//! Blocking FIFO queues of variable-length message buffers, with one
//! registered receiver per queue.
//!
//! ## Buffer Layout
//!
//! ```text
//! pool block:  | BlockHeader (FIFO links) | MsgHeader { tag, sender, len } | payload ... |
//! ```
//!
//! A buffer moves allocator → sender → queue → receiver → allocator. While
//! queued, it is threaded onto the FIFO through the links of its pool block
//! header, so enqueueing never allocates.
//!
//! ## Receive Protocol
//!
//! `msgq_recv` registers the caller as the queue's receiver and, under one
//! critical section, either dequeues or pends with `PENDING_MSG`. A send
//! (from a task or from the interrupt dispatcher) resumes the registered
//! receiver; the receiver re-checks the FIFO once dispatched again, so a
//! send can never slip in between the empty check and the pend.

use core::fmt;
use core::mem::size_of;

use crate::arch::Port;
use crate::config::{BOOT_SENDER, INTERRUPT_SENDER, MAX_QUEUES, MAX_TASKS, MSG_CHECK_FLAG};
use crate::error::{Error, Result};
use crate::kernel::{Kernel, KernelState};
use crate::list::ListHead;
use crate::mem::{Block, BlockLinks, RawBlock};
use crate::sync::CriticalSection;
use crate::task::{TaskId, TaskState};

/// Generational queue handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId {
    index: u8,
    generation: u16,
}

impl QueueId {
    #[inline]
    pub fn index(self) -> usize {
        usize::from(self.index)
    }
}

/// Origin of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sender {
    Task(TaskId),
    /// Sent by the interrupt dispatcher or a driver hook.
    Interrupt,
    /// Sent from the boot/idle context.
    Boot,
}

impl Sender {
    fn code(self) -> u32 {
        match self {
            Sender::Task(id) => id.code(),
            Sender::Interrupt => INTERRUPT_SENDER,
            Sender::Boot => BOOT_SENDER,
        }
    }

    fn from_code(code: u32) -> Self {
        match code {
            INTERRUPT_SENDER => Sender::Interrupt,
            BOOT_SENDER => Sender::Boot,
            code => Sender::Task(TaskId::from_code(code)),
        }
    }
}

#[repr(C)]
struct MsgHeader {
    tag: u32,
    sender: u32,
    len: u32,
}

const MSG_HEADER_LEN: usize = size_of::<MsgHeader>();

/// A message buffer obtained from [`Kernel::msgq_get_buf`].
///
/// Give it away with [`Kernel::msgq_send`] or back with
/// [`Kernel::msgq_release_buf`].
#[must_use = "a dropped buffer is never returned to the pool"]
pub struct MsgBuf {
    block: Block,
}

#[allow(clippy::len_without_is_empty)]
impl MsgBuf {
    fn header(&self) -> &MsgHeader {
        // SAFETY: every `MsgBuf` block starts with a header written by
        // `msgq_get_buf`; pool payloads are aligned for it.
        unsafe { &*(self.block.as_ptr() as *const MsgHeader) }
    }

    fn header_mut(&mut self) -> &mut MsgHeader {
        unsafe { &mut *(self.block.as_ptr() as *mut MsgHeader) }
    }

    #[inline]
    fn is_intact(&self) -> bool {
        self.header().tag == MSG_CHECK_FLAG
    }

    /// Payload length requested from `msgq_get_buf`.
    #[inline]
    pub fn len(&self) -> usize {
        self.header().len as usize
    }

    pub fn payload(&self) -> &[u8] {
        unsafe {
            core::slice::from_raw_parts(self.block.as_ptr().add(MSG_HEADER_LEN), self.len())
        }
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        unsafe {
            core::slice::from_raw_parts_mut(self.block.as_ptr().add(MSG_HEADER_LEN), self.len())
        }
    }
}

impl fmt::Debug for MsgBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgBuf")
            .field("len", &self.len())
            .field("sender", &Sender::from_code(self.header().sender))
            .finish()
    }
}

/// A received message.
#[derive(Debug)]
pub struct Message {
    pub buf: MsgBuf,
    pub sender: Sender,
}

// ---------------------------------------------------------------------------
// Queue table
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct QueueSlot {
    in_use: bool,
    generation: u16,
    msg_type: u32,
    fifo: ListHead<RawBlock>,
    /// Weak: validated against the task table before use.
    receiver: Option<TaskId>,
}

impl QueueSlot {
    const EMPTY: Self = Self {
        in_use: false,
        generation: 0,
        msg_type: 0,
        fifo: ListHead::new(),
        receiver: None,
    };
}

pub(crate) struct QueueTable {
    slots: [QueueSlot; MAX_QUEUES],
    /// Queue each task slot is blocked receiving on.
    blocked_on: [Option<usize>; MAX_TASKS],
}

impl QueueTable {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [QueueSlot::EMPTY; MAX_QUEUES],
            blocked_on: [None; MAX_TASKS],
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.iter().all(|slot| !slot.in_use)
    }

    fn validate(&self, q: QueueId) -> Option<usize> {
        let slot = self.slots.get(q.index())?;
        (slot.in_use && slot.generation == q.generation).then(|| q.index())
    }
}

impl<P: Port> KernelState<P> {
    fn enqueue(&mut self, q: QueueId, mut buf: MsgBuf) -> Result<()> {
        if !buf.is_intact() {
            log::warn!("msgq: rejected corrupted buffer at {:p}", buf.block.as_ptr());
            return Err(Error::InvalidParam);
        }
        let Some(index) = self.queues.validate(q) else {
            self.mem.free(buf.block);
            return Err(Error::InvalidParam);
        };

        let sender = if self.sched.in_isr {
            Sender::Interrupt
        } else {
            match self.sched.current {
                Some(slot) => Sender::Task(self.tasks.id_of(slot)),
                None => Sender::Boot,
            }
        };
        buf.header_mut().sender = sender.code();

        let queue = &mut self.queues.slots[index];
        queue.fifo.push_back(&mut BlockLinks, buf.block.into_raw());

        if let Some(receiver) = queue.receiver {
            if self.tasks.validate(receiver).is_err() {
                self.queues.slots[index].receiver = None;
            } else if self.receiver_waiting(index) {
                self.resume(receiver, TaskState::PENDING_MSG)?;
            }
        }
        Ok(())
    }

    fn dequeue(&mut self, index: usize) -> Option<Message> {
        let raw = self.queues.slots[index].fifo.pop_front(&mut BlockLinks)?;
        // SAFETY: only `enqueue` links blocks into a FIFO, from a `MsgBuf`.
        let buf = MsgBuf {
            block: unsafe { Block::from_raw(raw) },
        };
        let sender = Sender::from_code(buf.header().sender);
        Some(Message { buf, sender })
    }

    /// Is the registered receiver blocked receiving on queue `index`?
    fn receiver_waiting(&self, index: usize) -> bool {
        self.queues.slots[index]
            .receiver
            .and_then(|id| self.tasks.validate(id).ok())
            .map_or(false, |slot| {
                self.queues.blocked_on[slot] == Some(index)
                    && self.tasks.get(slot).state.contains(TaskState::PENDING_MSG)
            })
    }
}

// ---------------------------------------------------------------------------
// Kernel API
// ---------------------------------------------------------------------------

impl<P: Port> Kernel<P> {
    /// Create an empty queue carrying messages of the application-defined
    /// `msg_type`.
    ///
    /// # Errors
    /// [`Error::NoMem`] when the queue table is full.
    pub fn msgq_create(&self, msg_type: u32) -> Result<QueueId> {
        self.with_state(|st| {
            let (index, slot) = st
                .queues
                .slots
                .iter_mut()
                .enumerate()
                .find(|(_, slot)| !slot.in_use)
                .ok_or(Error::NoMem)?;
            *slot = QueueSlot {
                in_use: true,
                generation: slot.generation,
                msg_type,
                ..QueueSlot::EMPTY
            };
            Ok(QueueId {
                index: index as u8,
                generation: slot.generation,
            })
        })
    }

    pub fn msgq_type(&self, q: QueueId) -> Result<u32> {
        self.with_state(|st| {
            let index = st.queues.validate(q).ok_or(Error::InvalidParam)?;
            Ok(st.queues.slots[index].msg_type)
        })
    }

    /// The task that last received from the queue, if any.
    pub fn msgq_receiver(&self, q: QueueId) -> Result<Option<TaskId>> {
        self.with_state(|st| {
            let index = st.queues.validate(q).ok_or(Error::InvalidParam)?;
            Ok(st.queues.slots[index].receiver)
        })
    }

    /// Allocate a buffer with room for `len` payload bytes.
    ///
    /// Returns `None` for a stale queue, `len == 0` or pool exhaustion.
    pub fn msgq_get_buf(&self, q: QueueId, len: usize) -> Option<MsgBuf> {
        if len == 0 {
            return None;
        }
        let total = len.checked_add(MSG_HEADER_LEN)?;
        self.with_state(|st| {
            st.queues.validate(q)?;
            let block = st.mem.malloc(total)?;
            // SAFETY: the block holds at least `MSG_HEADER_LEN` bytes.
            unsafe {
                (block.as_ptr() as *mut MsgHeader).write(MsgHeader {
                    tag: MSG_CHECK_FLAG,
                    sender: 0,
                    len: len as u32,
                });
            }
            Some(MsgBuf { block })
        })
    }

    /// Return an unsent or received buffer to the pool.
    ///
    /// # Errors
    /// [`Error::InvalidParam`] for a stale queue (the buffer is still
    /// released) or a corrupted buffer (the buffer is leaked).
    pub fn msgq_release_buf(&self, q: QueueId, buf: MsgBuf) -> Result<()> {
        self.with_state(|st| {
            if !buf.is_intact() {
                log::warn!("msgq: leaked corrupted buffer at {:p}", buf.block.as_ptr());
                return Err(Error::InvalidParam);
            }
            st.mem.free(buf.block);
            st.queues.validate(q).map(|_| ()).ok_or(Error::InvalidParam)
        })
    }

    /// Append `buf` to the queue and resume its receiver.
    ///
    /// # Errors
    /// [`Error::InvalidParam`] for a stale queue (the buffer is released)
    /// or a corrupted buffer (the buffer is leaked).
    pub fn msgq_send(&self, q: QueueId, buf: MsgBuf) -> Result<()> {
        let _cs = CriticalSection::enter(&self.port);
        self.msgq_send_idic(q, buf)
    }

    /// [`Self::msgq_send`] for callers that already run with interrupts
    /// disabled (the interrupt dispatcher, driver receive hooks).
    pub fn msgq_send_idic(&self, q: QueueId, buf: MsgBuf) -> Result<()> {
        debug_assert!(
            !self.port.interrupts_enabled(),
            "msgq: send_idic with interrupts enabled"
        );
        self.with_state(|st| st.enqueue(q, buf))
    }

    /// Receive the oldest message, blocking while the queue is empty.
    ///
    /// # Errors
    /// [`Error::InvalidParam`] for a stale queue.
    ///
    /// # Panics
    /// If called from interrupt context or from the boot context.
    pub fn msgq_recv(&'static self, q: QueueId) -> Result<Message> {
        let _cs = CriticalSection::enter(&self.port);
        loop {
            let (slot, message) = self.with_state(|st| -> Result<_> {
                assert!(!st.sched.in_isr, "msgq: blocking receive from interrupt context");
                let Some(slot) = st.sched.current else {
                    panic!("msgq: blocking receive from the boot context");
                };
                let index = st.queues.validate(q).ok_or(Error::InvalidParam)?;
                st.queues.slots[index].receiver = Some(st.tasks.id_of(slot));
                let message = st.dequeue(index);
                st.queues.blocked_on[slot] = message.is_none().then_some(index);
                Ok((slot, message))
            })?;

            match message {
                Some(message) => return Ok(message),
                // SAFETY: interrupts are disabled and `slot` is the current task.
                None => unsafe { self.block_current(slot, TaskState::PENDING_MSG) },
            }
        }
    }

    /// Receive the oldest message, or `Ok(None)` if the queue is empty.
    /// A calling task becomes the queue's receiver.
    ///
    /// # Errors
    /// [`Error::InvalidParam`] for a stale queue.
    ///
    /// # Panics
    /// If called from interrupt context.
    pub fn msgq_recv_no_block(&self, q: QueueId) -> Result<Option<Message>> {
        self.with_state(|st| {
            assert!(!st.sched.in_isr, "msgq: receive from interrupt context");
            let index = st.queues.validate(q).ok_or(Error::InvalidParam)?;
            if let Some(slot) = st.sched.current {
                st.queues.slots[index].receiver = Some(st.tasks.id_of(slot));
            }
            Ok(st.dequeue(index))
        })
    }

    /// Free every queued buffer and release the queue.
    ///
    /// # Errors
    /// - [`Error::InvalidParam`]: stale queue.
    /// - [`Error::NotSupported`]: the registered receiver is blocked
    ///   receiving on it.
    pub fn msgq_destroy(&self, q: QueueId) -> Result<()> {
        self.with_state(|st| {
            let index = st.queues.validate(q).ok_or(Error::InvalidParam)?;
            if st.receiver_waiting(index) {
                log::warn!("msgq: queue {} destroyed while its receiver waits", index);
                return Err(Error::NotSupported);
            }
            while let Some(raw) = st.queues.slots[index].fifo.pop_front(&mut BlockLinks) {
                // SAFETY: FIFO nodes are blocks of sent buffers.
                st.mem.free(unsafe { Block::from_raw(raw) });
            }
            let slot = &mut st.queues.slots[index];
            *slot = QueueSlot {
                generation: slot.generation.wrapping_add(1),
                ..QueueSlot::EMPTY
            };
            Ok(())
        })
    }
}
