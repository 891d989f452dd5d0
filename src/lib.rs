// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host side of the multi-instance H.264 firmware of Amlogic video decoder cores.
//!
//! The firmware parses the bitstream and runs the fixed-function decode. The host answers its
//! requests: it sizes and manages the decoded picture buffer, programs reference lists and
//! colocated motion vector buffers for every slice, and orders decoded pictures for output.
//!
//! A [`session::Session`] runs one stream on one core, on top of a [`backend::Hardware`]
//! implementation provided by the platform. Decoded pictures are reported to a
//! [`decoder::FrameSink`].

pub mod backend;
pub mod codec;
pub mod decoder;
pub mod session;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}
