// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod h264;

use thiserror::Error;

use crate::backend::DmaError;
use crate::codec::h264::dpb::DpbError;
use crate::codec::h264::dpb::MmcoError;
use crate::codec::h264::rpm::ParamError;
use crate::codec::h264::store::StoreError;
use crate::Resolution;

pub type Result<T> = std::result::Result<T, DecodeError>;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no picture slot available until output buffers are returned")]
    OutOfPictures,
    #[error("stream geometry is not supported by the decoder")]
    UnsupportedStreamGeometry,
    #[error("cannot allocate the colocated motion vector buffers")]
    ColocatedAllocationFailed(#[source] DmaError),
    #[error("unexpected status {0:#x} from the firmware")]
    ProtocolViolation(u32),
    #[error("buffer index {0} is out of range")]
    BufferIndexOutOfRange(usize),
    #[error("colocated buffer at {addr:#x} overruns the region ending at {end:#x}")]
    ColocatedOutOfBounds { addr: u32, end: u32 },
    #[error("the colocated motion vector engine stayed busy")]
    HardwareTimeout,
    #[error("the decoder is still processing the previous input")]
    NotIdle,
    #[error("the decode session was aborted")]
    Aborted,
    #[error("timed out waiting for the decoder")]
    Timeout,
    #[error(transparent)]
    Mmco(MmcoError),
    #[error(transparent)]
    Dpb(DpbError),
    #[error(transparent)]
    Dma(#[from] DmaError),
    #[error(transparent)]
    Param(#[from] ParamError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DecodeError {
    /// Whether the error ends the session. Only running out of pictures can be recovered from, by
    /// waiting for the consumer to return buffers.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DecodeError::OutOfPictures)
    }
}

impl From<DpbError> for DecodeError {
    fn from(err: DpbError) -> Self {
        match err {
            DpbError::Store(StoreError::OutOfPictures(_)) => DecodeError::OutOfPictures,
            DpbError::Store(StoreError::IndexOutOfRange(index)) => {
                DecodeError::BufferIndexOutOfRange(index)
            }
            DpbError::Mmco(err) => DecodeError::Mmco(err),
            err => DecodeError::Dpb(err),
        }
    }
}

/// Stream parameters reported to the consumer on a configuration change.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamInfo {
    /// Display resolution after cropping.
    pub resolution: Resolution,
    /// Number of output buffers the consumer must provide.
    pub num_buffers: usize,
}

/// A decoded picture, in output order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReadyFrame {
    /// Index of the output buffer holding the picture.
    pub index: usize,
    pub pic_order_cnt: i32,
    /// Whether the picture was an I or IDR picture.
    pub keyframe: bool,
}

/// Receives the events of a decode session. Called from the protocol thread.
pub trait FrameSink: Send {
    /// The stream geometry changed. Buffers of the previous configuration are no longer used.
    fn format_changed(&mut self, info: &StreamInfo);
    /// `frame` is ready for display. The buffer must be returned once the consumer is done with
    /// it.
    fn frame_ready(&mut self, frame: ReadyFrame);
    /// Output buffer `index` is handed back in an error state, without a picture to display.
    /// This happens to withheld and partially decoded pictures when the session ends.
    fn frame_dropped(&mut self, index: usize);
    /// The decoder consumed its input and can take more.
    fn input_needed(&mut self);
    /// The session hit a fatal error. Output buffers still held are in an error state.
    fn session_aborted(&mut self);
}

/// State of the decoder with respect to its input.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DecodeState {
    /// No input being processed, more can be submitted.
    #[default]
    Idle,
    /// The firmware is working on the last submitted input.
    Processing,
    /// A fatal error occurred, the session can only be stopped.
    Aborted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_out_of_pictures_is_recoverable() {
        assert!(!DecodeError::OutOfPictures.is_fatal());
        assert!(DecodeError::ProtocolViolation(0x99).is_fatal());
        assert!(DecodeError::HardwareTimeout.is_fatal());
        assert!(DecodeError::from(DpbError::NoCurrentPicture).is_fatal());
    }

    #[test]
    fn dpb_errors_map_to_session_errors() {
        assert!(matches!(
            DecodeError::from(DpbError::Store(StoreError::OutOfPictures(22))),
            DecodeError::OutOfPictures
        ));
        assert!(matches!(
            DecodeError::from(DpbError::Store(StoreError::IndexOutOfRange(30))),
            DecodeError::BufferIndexOutOfRange(30)
        ));
        assert!(matches!(
            DecodeError::from(DpbError::Mmco(MmcoError::NoShortTermPic)),
            DecodeError::Mmco(MmcoError::NoShortTermPic)
        ));
        assert!(matches!(
            DecodeError::from(DpbError::NoShortTermRef(3)),
            DecodeError::Dpb(DpbError::NoShortTermRef(3))
        ));
    }
}
