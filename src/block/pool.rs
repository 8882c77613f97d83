//! Request pools and the pending-request FIFO.
//!
//! Both structures are touched by arbitrary submitting threads and by the
//! protocol domain, so every access funnels through the one lock in here;
//! nothing else in the crate reaches the slots directly.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use spin::Mutex;

use crate::block::request::{
    BlockRequest, Completion, Direction, RequestAttrs, RequestKind,
};
use crate::err::SdError;

/// Index of an owned slot in one of the two pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHandle {
    kind: RequestKind,
    index: usize,
}

impl RequestHandle {
    pub fn kind(&self) -> RequestKind {
        self.kind
    }
}

struct PoolInner {
    simple: Vec<Option<BlockRequest>>,
    complex: Vec<Option<BlockRequest>>,
    simple_free: Vec<usize>,
    complex_free: Vec<usize>,
    pending: VecDeque<RequestHandle>,
    queue_enabled: bool,
}

impl PoolInner {
    fn free_list(&mut self, kind: RequestKind) -> &mut Vec<usize> {
        match kind {
            RequestKind::Simple => &mut self.simple_free,
            RequestKind::Complex => &mut self.complex_free,
        }
    }

    fn slot(&mut self, handle: RequestHandle) -> &mut Option<BlockRequest> {
        match handle.kind {
            RequestKind::Simple => &mut self.simple[handle.index],
            RequestKind::Complex => &mut self.complex[handle.index],
        }
    }
}

/// Fixed-capacity pools of preallocated requests plus the admission FIFO.
pub struct RequestPool {
    inner: Mutex<PoolInner>,
}

impl RequestPool {
    pub fn new(simple_capacity: usize, complex_capacity: usize) -> Self {
        let mut simple = Vec::with_capacity(simple_capacity);
        let mut complex = Vec::with_capacity(complex_capacity);
        for _ in 0..simple_capacity {
            simple.push(Some(BlockRequest::empty(RequestKind::Simple)));
        }
        for _ in 0..complex_capacity {
            complex.push(Some(BlockRequest::empty(RequestKind::Complex)));
        }
        let simple_free = (0..simple_capacity).rev().collect();
        let complex_free = (0..complex_capacity).rev().collect();

        Self {
            inner: Mutex::new(PoolInner {
                simple,
                complex,
                simple_free,
                complex_free,
                pending: VecDeque::new(),
                queue_enabled: false,
            }),
        }
    }

    pub fn try_acquire(&self, kind: RequestKind) -> Option<RequestHandle> {
        let mut inner = self.inner.lock();
        inner
            .free_list(kind)
            .pop()
            .map(|index| RequestHandle { kind, index })
    }

    /// Take a free slot, spinning until one is recycled. Submitting
    /// callers are expected to tolerate the stall.
    pub fn acquire(&self, kind: RequestKind) -> RequestHandle {
        loop {
            if let Some(handle) = self.try_acquire(kind) {
                return handle;
            }
            core::hint::spin_loop();
        }
    }

    /// Bind an I/O to an acquired slot and enqueue it, unless the queue
    /// has been disabled in the meantime; then the slot is released and
    /// the buffer and completion travel back to the caller.
    #[allow(clippy::too_many_arguments)]
    pub fn admit(
        &self,
        handle: RequestHandle,
        direction: Direction,
        start_block: u64,
        block_count: u32,
        attrs: RequestAttrs,
        buffer: Vec<u8>,
        completion: Completion,
    ) -> Result<(), (Vec<u8>, Completion)> {
        let mut inner = self.inner.lock();
        if !inner.queue_enabled {
            inner.free_list(handle.kind).push(handle.index);
            return Err((buffer, completion));
        }
        let request = inner
            .slot(handle)
            .as_mut()
            .expect("acquired slot is occupied");
        request.prepare(direction, start_block, block_count, attrs, buffer, completion);
        inner.pending.push_back(handle);
        Ok(())
    }

    /// Next admitted request, protocol-domain side of the FIFO.
    pub fn pop_pending(&self) -> Option<RequestHandle> {
        self.inner.lock().pending.pop_front()
    }

    /// Move the request out of its slot for servicing; the slot stays
    /// reserved until [`Self::recycle`].
    pub fn take(&self, handle: RequestHandle) -> BlockRequest {
        self.inner
            .lock()
            .slot(handle)
            .take()
            .expect("request taken twice")
    }

    /// Return a serviced request to its slot and free it.
    pub fn recycle(&self, handle: RequestHandle, request: BlockRequest) {
        let mut inner = self.inner.lock();
        *inner.slot(handle) = Some(request);
        inner.free_list(handle.kind).push(handle.index);
    }

    pub fn enable_queue(&self) {
        self.inner.lock().queue_enabled = true;
    }

    /// Returns whether the queue was enabled before.
    pub fn disable_queue(&self) -> bool {
        let mut inner = self.inner.lock();
        core::mem::replace(&mut inner.queue_enabled, false)
    }

    pub fn is_queue_enabled(&self) -> bool {
        self.inner.lock().queue_enabled
    }

    /// Empty the FIFO. Called with the queue disabled so nothing is
    /// admitted behind the drain.
    pub fn drain_pending(&self) -> Vec<RequestHandle> {
        let mut inner = self.inner.lock();
        inner.pending.drain(..).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }
}
