// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The colocated motion vector region.
//!
//! Every reference picture writes its motion vectors to one buffer of the region, which B slices
//! then read for temporal direct prediction. The region is a single DMA allocation of
//! `count` buffers of `buf_size` bytes.

use log::debug;
use log::warn;

use crate::backend::DmaBuffer;
use crate::backend::DmaError;
use crate::backend::Hardware;
use crate::decoder::DecodeError;

#[derive(Debug, Default)]
pub struct ColocatedBuffers {
    region: Option<DmaBuffer>,
    buf_size: usize,
    in_use: Vec<bool>,
}

impl ColocatedBuffers {
    /// Allocates `count` buffers of `buf_size` bytes. Nothing is reallocated if the region already
    /// has this geometry, but all buffers become free again. Returns whether a new region was
    /// allocated.
    pub fn configure<H: Hardware + ?Sized>(
        &mut self,
        hw: &H,
        buf_size: usize,
        count: usize,
    ) -> Result<bool, DmaError> {
        if self.region.is_some() && self.buf_size == buf_size && self.in_use.len() == count {
            self.in_use.iter_mut().for_each(|used| *used = false);
            return Ok(false);
        }

        self.free(hw);

        let region = hw.dma_alloc(buf_size * count)?;
        debug!(
            "Colocated region at {:#x}: {} buffers of {} bytes",
            region.paddr(),
            count,
            buf_size
        );

        self.region = Some(region);
        self.buf_size = buf_size;
        self.in_use = vec![false; count];

        Ok(true)
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn count(&self) -> usize {
        if self.region.is_some() {
            self.in_use.len()
        } else {
            0
        }
    }

    /// Bus address of buffer `index`, or `None` if there is no such buffer. With direct 8x8
    /// inference the firmware addresses the buffers at a quarter of their size.
    pub fn address_for(&self, index: usize, direct_8x8: bool) -> Option<u32> {
        let region = self.region.as_ref()?;
        if index >= self.in_use.len() {
            return None;
        }

        let offset = (self.buf_size * index) >> if direct_8x8 { 2 } else { 0 };
        Some(region.paddr().wrapping_add(offset as u32))
    }

    /// Checks that a buffer starting at `addr` fits in the region.
    pub fn check_bounds(&self, addr: u32) -> Result<(), DecodeError> {
        let end = self.region.as_ref().map_or(0, DmaBuffer::end);

        if u64::from(addr) + self.buf_size as u64 > u64::from(end) {
            return Err(DecodeError::ColocatedOutOfBounds { addr, end });
        }

        Ok(())
    }

    /// Takes a free buffer for a new reference picture.
    pub fn alloc_index(&mut self) -> Option<usize> {
        if self.region.is_none() {
            return None;
        }

        let index = self.in_use.iter().position(|used| !used)?;
        self.in_use[index] = true;

        Some(index)
    }

    pub fn release_index(&mut self, index: usize) {
        match self.in_use.get_mut(index) {
            Some(used) => *used = false,
            None => warn!("Releasing unknown colocated buffer {}", index),
        }
    }

    /// Frees the region. Does nothing if it is not allocated.
    pub fn free<H: Hardware + ?Sized>(&mut self, hw: &H) {
        if let Some(region) = self.region.take() {
            debug!("Freeing colocated region at {:#x}", region.paddr());
            hw.dma_free(region);
        }

        self.in_use.clear();
    }
}
