// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fixed-capacity arena of decoded picture descriptors.
//!
//! Slot `i` of the store describes external buffer `i`, so a slot index doubles as the
//! `buf_spec_num` of the picture it holds. The store only enforces the lifecycle of a slot; which
//! pictures stay as references or wait for output is decided by the DPB.

use log::debug;
use thiserror::Error;

use crate::codec::h264::picture::Output;
use crate::codec::h264::picture::PictureData;

/// Maximum number of external buffers the firmware can address.
pub const MAX_VF_BUF_NUM: usize = 27;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("all {0} picture slots are held as reference or pending output")]
    OutOfPictures(usize),
    #[error("picture slot {0} is out of range")]
    IndexOutOfRange(usize),
    #[error("picture slot {index} is {state:?}, expected {expected:?}")]
    InvalidState {
        index: usize,
        state: PictureState,
        expected: PictureState,
    },
    #[error("picture slot {0} is already being decoded")]
    AlreadyDecoding(usize),
}

/// Externally visible state of a slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PictureState {
    Unused,
    InDecode,
    Reference,
    PendingOutput,
}

#[derive(Debug, Default)]
enum Slot {
    #[default]
    Unused,
    InDecode(PictureData),
    Stored(PictureData),
}

impl Slot {
    fn state(&self) -> PictureState {
        match self {
            Slot::Unused => PictureState::Unused,
            Slot::InDecode(_) => PictureState::InDecode,
            Slot::Stored(pic) if pic.is_ref() => PictureState::Reference,
            Slot::Stored(pic) if pic.output() == Output::Done => PictureState::Unused,
            Slot::Stored(_) => PictureState::PendingOutput,
        }
    }
}

#[derive(Debug, Default)]
pub struct PictureStore {
    slots: Vec<Slot>,
    in_decode: Option<usize>,
}

impl PictureStore {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Default::default);

        Self {
            slots,
            in_decode: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn state(&self, index: usize) -> Result<PictureState, StoreError> {
        self.slots
            .get(index)
            .map(Slot::state)
            .ok_or(StoreError::IndexOutOfRange(index))
    }

    /// Number of slots that can be handed out by `allocate` right now.
    pub fn num_free(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state() == PictureState::Unused)
            .count()
    }

    /// Places `pic` in a free slot, marking it as being decoded. `pic.buf_spec_num` is set to the
    /// slot index, which is returned.
    pub fn allocate(&mut self, mut pic: PictureData) -> Result<usize, StoreError> {
        if let Some(index) = self.in_decode {
            return Err(StoreError::AlreadyDecoding(index));
        }

        let index = self
            .slots
            .iter()
            .position(|s| s.state() == PictureState::Unused)
            .ok_or(StoreError::OutOfPictures(self.capacity()))?;

        debug!("Allocated picture slot {}", index);

        pic.buf_spec_num = index;
        self.slots[index] = Slot::InDecode(pic);
        self.in_decode = Some(index);

        Ok(index)
    }

    /// Moves the stored first field in `index` back to decoding, for its second field.
    pub fn reopen(&mut self, index: usize) -> Result<(), StoreError> {
        if let Some(index) = self.in_decode {
            return Err(StoreError::AlreadyDecoding(index));
        }

        let slot = self
            .slots
            .get_mut(index)
            .ok_or(StoreError::IndexOutOfRange(index))?;

        match std::mem::take(slot) {
            Slot::Stored(pic) => {
                *slot = Slot::InDecode(pic);
                self.in_decode = Some(index);
                Ok(())
            }
            other => {
                let state = other.state();
                *slot = other;
                Err(StoreError::InvalidState {
                    index,
                    state,
                    expected: PictureState::Reference,
                })
            }
        }
    }

    /// The picture being decoded, if any.
    pub fn in_decode(&self) -> Option<&PictureData> {
        match self.slots.get(self.in_decode?)? {
            Slot::InDecode(pic) => Some(pic),
            _ => None,
        }
    }

    pub fn in_decode_mut(&mut self) -> Option<&mut PictureData> {
        match self.slots.get_mut(self.in_decode?)? {
            Slot::InDecode(pic) => Some(pic),
            _ => None,
        }
    }

    /// Moves the picture being decoded to the stored state and returns its slot.
    pub fn commit(&mut self) -> Option<usize> {
        let index = self.in_decode.take()?;
        let slot = &mut self.slots[index];

        if let Slot::InDecode(pic) = std::mem::take(slot) {
            *slot = Slot::Stored(pic);
        }

        Some(index)
    }

    /// Drops the picture being decoded without storing it.
    pub fn discard(&mut self) {
        if let Some(index) = self.in_decode.take() {
            debug!("Discarding picture in slot {}", index);
            self.slots[index] = Slot::Unused;
        }
    }

    /// Returns the slot `index` to the unused state. Only a stored picture that is neither a
    /// reference nor waiting for (or held by) the consumer can be released.
    pub fn release(&mut self, index: usize) -> Result<(), StoreError> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(StoreError::IndexOutOfRange(index))?;

        match slot {
            Slot::Unused => Ok(()),
            Slot::Stored(pic) if !pic.is_ref() && pic.output() == Output::Done => {
                debug!("Releasing picture slot {}", index);
                *slot = Slot::Unused;
                Ok(())
            }
            other => Err(StoreError::InvalidState {
                index,
                state: other.state(),
                expected: PictureState::Unused,
            }),
        }
    }

    /// The stored picture in slot `index`, if any.
    pub fn get(&self, index: usize) -> Option<&PictureData> {
        match self.slots.get(index)? {
            Slot::Stored(pic) | Slot::InDecode(pic) => Some(pic),
            Slot::Unused => None,
        }
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut PictureData> {
        match self.slots.get_mut(index)? {
            Slot::Stored(pic) | Slot::InDecode(pic) => Some(pic),
            Slot::Unused => None,
        }
    }

    /// Iterates over the stored pictures and their slot indices.
    pub fn stored(&self) -> impl Iterator<Item = (usize, &PictureData)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| match s {
            Slot::Stored(pic) => Some((i, pic)),
            _ => None,
        })
    }

    pub fn stored_mut(&mut self) -> impl Iterator<Item = (usize, &mut PictureData)> {
        self.slots.iter_mut().enumerate().filter_map(|(i, s)| match s {
            Slot::Stored(pic) => Some((i, pic)),
            _ => None,
        })
    }

    /// Releases every stored picture that is neither a reference nor tied to the consumer.
    pub fn release_unused(&mut self) {
        let unused = self
            .stored()
            .filter(|(_, pic)| !pic.is_ref() && pic.output() == Output::Done)
            .map(|(i, _)| i)
            .collect::<Vec<_>>();

        for index in unused {
            self.slots[index] = Slot::Unused;
        }
    }

    /// Drops all pictures and resizes the store to `capacity` slots.
    pub fn reset(&mut self, capacity: usize) {
        *self = Self::new(capacity);
    }
}
