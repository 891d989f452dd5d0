// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Access to the decoder core.
//!
//! The decode session never touches MMIO or the DMA allocator directly. Everything goes through
//! the [`Hardware`] trait, which the platform glue implements on top of the DOS register window,
//! the elementary stream parser and the coherent DMA allocator of the device. The same handle is
//! shared by the protocol thread, the recycler thread and the interrupt entry point, hence all
//! methods take `&self`.

#[cfg(test)]
pub(crate) mod dummy;
pub mod regs;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DmaError {
    #[error("cannot allocate {0} bytes of DMA memory")]
    OutOfMemory(usize),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A coherent DMA region handed out by [`Hardware::dma_alloc`].
///
/// The handle is not `Clone`. [`Hardware::dma_free`] consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct DmaBuffer {
    id: u64,
    paddr: u32,
    size: usize,
}

impl DmaBuffer {
    /// Creates a handle for a region allocated by a `Hardware` implementation. `id` identifies the
    /// CPU mapping of the region for the implementation.
    pub fn new(id: u64, paddr: u32, size: usize) -> Self {
        Self { id, paddr, size }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Bus address of the region, as programmed into the decoder registers.
    pub fn paddr(&self) -> u32 {
        self.paddr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Bus address one past the last byte of the region.
    pub fn end(&self) -> u32 {
        self.paddr.wrapping_add(self.size as u32)
    }
}

/// Opaque primitives of one decoder core.
pub trait Hardware: Send + Sync {
    /// Reads the DOS register at byte offset `reg`.
    fn read_register(&self, reg: u32) -> u32;
    /// Writes `value` to the DOS register at byte offset `reg`.
    fn write_register(&self, reg: u32, value: u32);

    /// Reads the status code posted by the firmware.
    fn read_status(&self) -> u32 {
        self.read_register(regs::DPB_STATUS_REG)
    }

    /// Sets `bits` in register `reg`.
    fn set_register_bits(&self, reg: u32, bits: u32) {
        let value = self.read_register(reg);
        self.write_register(reg, value | bits);
    }

    /// Stops the firmware processor. The core no longer accesses memory once this returns.
    fn halt(&self);

    fn dma_alloc(&self, size: usize) -> Result<DmaBuffer, DmaError>;
    fn dma_free(&self, buffer: DmaBuffer);
    /// Copies `dst.len()` bytes starting at `offset` of `buffer` into `dst`.
    fn dma_read(&self, buffer: &DmaBuffer, offset: usize, dst: &mut [u8]);

    /// Hands compressed bytes to the elementary stream FIFO of the core.
    fn queue_bitstream(&self, data: &[u8]) -> anyhow::Result<()>;

    /// Returns the packed canvas ids (luma and chroma) of output buffer `index`.
    fn canvas_for_buffer(&self, index: usize) -> u32;

    /// Whether the core can take a returned output buffer right now. Polled, never waited on.
    fn can_recycle(&self) -> bool;
    /// Tells the core that output buffer `index` was returned by the consumer.
    fn recycle(&self, index: usize);
}
