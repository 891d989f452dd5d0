// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a fake decoder core whose only purpose is to let the decoder and the
//! session run so we can test them in isolation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::backend::regs;
use crate::backend::DmaBuffer;
use crate::backend::DmaError;
use crate::backend::Hardware;

/// Bus address of the first DMA region handed out.
const DMA_BASE: u32 = 0x0100_0000;

struct Region {
    paddr: u32,
    data: Vec<u8>,
}

#[derive(Default)]
pub(crate) struct FakeState {
    pub registers: HashMap<u32, u32>,
    /// Every register write, in order.
    pub writes: Vec<(u32, u32)>,
    regions: HashMap<u64, Region>,
    next_id: u64,
    next_paddr: u32,
    pub allocs: usize,
    pub frees: usize,
    /// Allocations fail once this many have succeeded.
    pub fail_alloc_after: Option<usize>,
    /// Keeps the busy bit of the colocated engine set.
    pub co_mb_busy: bool,
    pub can_recycle: bool,
    pub recycled: Vec<usize>,
    /// The firmware runs until `halt` is called.
    pub running: bool,
    pub halts: usize,
    pub freed_while_running: usize,
    pub bitstream: Vec<u8>,
}

pub(crate) struct FakeHardware {
    state: Mutex<FakeState>,
}

/// Canvas ids of the luma and chroma planes of buffer `index`.
pub(crate) fn fake_canvas(index: usize) -> u32 {
    let y = 0x20 + 2 * index as u32;
    y | ((y + 1) << 8) | ((y + 1) << 16)
}

impl FakeHardware {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_paddr: DMA_BASE,
                can_recycle: true,
                running: true,
                ..Default::default()
            }),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn set_register(&self, reg: u32, value: u32) {
        self.state().registers.insert(reg, value);
    }

    pub fn register(&self, reg: u32) -> u32 {
        self.state().registers.get(&reg).copied().unwrap_or(0)
    }

    /// Values written to `reg`, in order.
    pub fn writes_to(&self, reg: u32) -> Vec<u32> {
        self.state()
            .writes
            .iter()
            .filter(|(r, _)| *r == reg)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn clear_writes(&self) {
        self.state().writes.clear();
    }

    /// Copies `data` at the start of the region mapped at `paddr`, like the firmware filling the
    /// parameter dump.
    pub fn fill_region(&self, paddr: u32, data: &[u8]) {
        let mut state = self.state();
        let region = state
            .regions
            .values_mut()
            .find(|r| r.paddr == paddr)
            .expect("no region at this address");
        region.data[..data.len()].copy_from_slice(data);
    }

    pub fn live_regions(&self) -> usize {
        self.state().regions.len()
    }
}

impl Hardware for FakeHardware {
    fn read_register(&self, reg: u32) -> u32 {
        let state = self.state();
        let value = state.registers.get(&reg).copied().unwrap_or(0);

        match reg {
            regs::H264_CO_MB_RW_CTL if state.co_mb_busy => value | (1 << 11),
            regs::CURR_CANVAS_CTRL => (value & 0xff00_0000) | fake_canvas((value >> 24) as usize),
            _ => value,
        }
    }

    fn write_register(&self, reg: u32, value: u32) {
        let mut state = self.state();
        state.registers.insert(reg, value);
        state.writes.push((reg, value));
    }

    fn halt(&self) {
        let mut state = self.state();
        state.running = false;
        state.halts += 1;
    }

    fn dma_alloc(&self, size: usize) -> Result<DmaBuffer, DmaError> {
        let mut state = self.state();

        if matches!(state.fail_alloc_after, Some(n) if state.allocs >= n) {
            return Err(DmaError::OutOfMemory(size));
        }

        let id = state.next_id;
        let paddr = state.next_paddr;
        state.next_id += 1;
        state.next_paddr += ((size as u32) + 0xfff) & !0xfff;
        state.allocs += 1;
        state.regions.insert(
            id,
            Region {
                paddr,
                data: vec![0; size],
            },
        );

        Ok(DmaBuffer::new(id, paddr, size))
    }

    fn dma_free(&self, buffer: DmaBuffer) {
        let mut state = self.state();

        assert!(
            state.regions.remove(&buffer.id()).is_some(),
            "region {:#x} freed twice",
            buffer.paddr()
        );
        state.frees += 1;
        if state.running {
            state.freed_while_running += 1;
        }
    }

    fn dma_read(&self, buffer: &DmaBuffer, offset: usize, dst: &mut [u8]) {
        let state = self.state();
        let region = &state.regions[&buffer.id()];
        dst.copy_from_slice(&region.data[offset..offset + dst.len()]);
    }

    fn queue_bitstream(&self, data: &[u8]) -> anyhow::Result<()> {
        self.state().bitstream.extend_from_slice(data);
        Ok(())
    }

    fn canvas_for_buffer(&self, index: usize) -> u32 {
        fake_canvas(index)
    }

    fn can_recycle(&self) -> bool {
        self.state().can_recycle
    }

    fn recycle(&self, index: usize) {
        self.state().recycled.push(index);
    }
}
