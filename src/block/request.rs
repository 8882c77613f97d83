//! One outstanding storage I/O.
//!
//! A request that fits a single DMA transaction is serviced whole; an
//! oversized one walks a moving window over its buffer, one bounded
//! transaction at a time. Either way the request completes exactly once,
//! with the full byte count or with zero bytes.

use alloc::boxed::Box;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::err::SdError;
use crate::sd::constant::SD_BLOCK_SIZE;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RequestAttrs: u32 {
        /// Bypass any write caching the card performs.
        const WRITE_THROUGH = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Fits one DMA transaction.
    Simple,
    /// Must be split into sequential transactions.
    Complex,
}

/// Owner of the transfer result: called exactly once with the byte count
/// (or the error) and the buffer handed back.
pub type Completion = Box<dyn FnOnce(Result<u64, SdError>, Vec<u8>) + Send>;

/// A pending I/O plus the scratch state of its current sub-transaction.
pub struct BlockRequest {
    kind: RequestKind,
    pub direction: Direction,
    pub start_block: u64,
    pub block_count: u32,
    pub attrs: RequestAttrs,
    buffer: Vec<u8>,
    completion: Option<Completion>,
    // Current DMA window; equals the whole request for a simple one
    window_block: u64,
    window_count: u32,
}

impl BlockRequest {
    /// An empty pool slot.
    pub fn empty(kind: RequestKind) -> Self {
        Self {
            kind,
            direction: Direction::Read,
            start_block: 0,
            block_count: 0,
            attrs: RequestAttrs::empty(),
            buffer: Vec::new(),
            completion: None,
            window_block: 0,
            window_count: 0,
        }
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Bind an admitted I/O to this slot.
    pub fn prepare(
        &mut self,
        direction: Direction,
        start_block: u64,
        block_count: u32,
        attrs: RequestAttrs,
        buffer: Vec<u8>,
        completion: Completion,
    ) {
        self.direction = direction;
        self.start_block = start_block;
        self.block_count = block_count;
        self.attrs = attrs;
        self.buffer = buffer;
        self.completion = Some(completion);
        self.window_block = start_block;
        self.window_count = block_count;
    }

    /// Run the transfer through the single-transaction processor.
    ///
    /// `process` is handed the window's direction, starting block and the
    /// sub-range of the original buffer it covers. Any sub-transaction
    /// failure aborts the remaining windows; earlier successes earn no
    /// partial credit.
    pub fn service<F>(&mut self, max_blocks: u32, mut process: F) -> Result<u64, SdError>
    where
        F: FnMut(Direction, u64, u32, &mut [u8]) -> Result<(), SdError>,
    {
        let total_bytes = self.block_count as u64 * SD_BLOCK_SIZE as u64;
        match self.kind {
            RequestKind::Simple => {
                self.window_block = self.start_block;
                self.window_count = self.block_count;
                process(
                    self.direction,
                    self.window_block,
                    self.window_count,
                    &mut self.buffer[..total_bytes as usize],
                )?;
                Ok(total_bytes)
            }
            RequestKind::Complex => {
                let mut cursor = 0u32;
                while cursor < self.block_count {
                    let chunk = max_blocks.min(self.block_count - cursor);
                    self.window_block = self.start_block + cursor as u64;
                    self.window_count = chunk;

                    let offset = cursor as usize * SD_BLOCK_SIZE as usize;
                    let len = chunk as usize * SD_BLOCK_SIZE as usize;
                    process(
                        self.direction,
                        self.window_block,
                        self.window_count,
                        &mut self.buffer[offset..offset + len],
                    )?;

                    cursor += max_blocks;
                }
                Ok(total_bytes)
            }
        }
    }

    /// Fire the completion and return the slot to its empty state.
    pub fn complete(&mut self, result: Result<u64, SdError>) {
        let buffer = core::mem::take(&mut self.buffer);
        self.block_count = 0;
        self.window_count = 0;
        if let Some(completion) = self.completion.take() {
            completion(result, buffer);
        }
    }
}
