// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stream geometry reported by the firmware on a configuration request, and the DPB limits
//! derived from it.

use crate::codec::h264::store::MAX_VF_BUF_NUM;
use crate::Resolution;

/// Largest picture the decoder core handles, in pixels.
const MAX_SIZE_4K: u32 = 4096 * 2304;

/// Buffers reserved on top of the reordering depth for references and pictures in flight.
const BUFFER_SPEC_MARGIN: usize = 16;
/// Extra reference slots the firmware needs on top of the stream's declared count.
const REFERENCE_MARGIN: usize = 14;

/// Bytes of colocated motion vector data per macroblock.
pub const COLOCATED_BYTES_PER_MB: u32 = 96;

/// Returns the maximum DPB size in bytes allowed by `level_idc` (Table A-1).
fn max_dpb_bytes(level_idc: u32) -> usize {
    match level_idc {
        9 | 10 => 152064,
        11 => 345600,
        12 | 13 | 20 => 912384,
        21 => 1824768,
        22 | 30 => 3110400,
        31 => 6912000,
        32 => 7864320,
        40 | 41 => 12582912,
        42 => 13369344,
        50 => 42393600,
        _ => 70778880,
    }
}

/// Number of pictures of `mb_width`x`mb_height` macroblocks fitting in the DPB of `level_idc`,
/// plus one, and never less than `max_reference_frame_num`.
pub fn max_dec_frame_buf_size(
    level_idc: u32,
    max_reference_frame_num: usize,
    mb_width: u32,
    mb_height: u32,
) -> usize {
    let pic_size = (mb_width as usize * mb_height as usize * 384).max(1);
    let size = max_dpb_bytes(level_idc) / pic_size + 1;

    std::cmp::max(size, max_reference_frame_num)
}

/// The bitstream restriction values of the VUI.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BitstreamRestriction {
    pub bitstream_restriction_flag: bool,
    pub num_reorder_frames: u16,
    pub max_dec_frame_buffering: u16,
}

/// Sizes of the decoded picture buffer for one stream configuration.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DpbLimits {
    /// Maximum number of pictures withheld for output reordering.
    pub reorder_pic_num: usize,
    /// Number of external buffers, i.e. the DPB capacity.
    pub active_buffer_spec_num: usize,
    /// Number of reference pictures the firmware may keep, which is also the number of colocated
    /// motion vector buffers.
    pub max_reference_size: usize,
}

impl DpbLimits {
    pub fn new(
        level_idc: u32,
        max_reference_frame_num: usize,
        mb_width: u32,
        mb_height: u32,
        restriction: &BitstreamRestriction,
        no_poc_reorder: bool,
    ) -> Self {
        let mut reorder_pic_num =
            max_dec_frame_buf_size(level_idc, max_reference_frame_num, mb_width, mb_height);

        // The stream's own restriction can only lower the reordering depth.
        let max_dec_frame_buffering = usize::from(restriction.max_dec_frame_buffering);
        if restriction.bitstream_restriction_flag && max_dec_frame_buffering < reorder_pic_num {
            reorder_pic_num = max_dec_frame_buffering;
        }

        let mut active_buffer_spec_num = reorder_pic_num + BUFFER_SPEC_MARGIN;
        let mut max_reference_size = max_reference_frame_num + REFERENCE_MARGIN;

        if active_buffer_spec_num > MAX_VF_BUF_NUM {
            active_buffer_spec_num = MAX_VF_BUF_NUM;
            reorder_pic_num = active_buffer_spec_num - BUFFER_SPEC_MARGIN;
        }

        if max_reference_size > MAX_VF_BUF_NUM {
            max_reference_size = MAX_VF_BUF_NUM;
        }

        if no_poc_reorder {
            reorder_pic_num = 1;
        }

        Self {
            reorder_pic_num,
            active_buffer_spec_num,
            max_reference_size,
        }
    }

    /// Value of the configuration acknowledgement register.
    pub fn packed(&self) -> u32 {
        ((self.max_reference_size as u32) << 24)
            | ((self.active_buffer_spec_num as u32) << 16)
            | ((self.active_buffer_spec_num as u32) << 8)
    }
}

/// Raw words posted by the firmware along with a configuration request.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SequenceInfo {
    /// Macroblock width and total count, bit 31 flags long-term references.
    pub seq_info2: u32,
    /// Sequence flags: `frame_mbs_only_flag` and `chroma_format_idc`.
    pub seq_info: u32,
    /// Right (bits 16..24) and bottom (bits 0..8) cropping.
    pub crop: u32,
    /// `level_idc` (bits 0..8) and `max_num_ref_frames` (bits 8..16).
    pub level_and_refs: u32,
}

/// Everything derived from a `SequenceInfo` the decoder needs to configure itself.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamGeometry {
    /// Macroblock dimensions, aligned up to 4.
    pub mb_width: u32,
    pub mb_height: u32,
    pub mb_total: u32,
    /// Display size after cropping.
    pub display: Resolution,
    pub frame_mbs_only: bool,
    pub level_idc: u32,
    /// The reference count declared by the stream.
    pub max_num_ref_frames: usize,
    pub colocated_buf_size: u32,
    pub limits: DpbLimits,
}

impl SequenceInfo {
    /// Key used to detect a configuration change, ignoring the long-term flag.
    pub fn key(&self) -> u32 {
        self.seq_info2 & !0x8000_0000
    }

    /// Returns the macroblock dimensions if they are valid and within the decoder limits.
    pub fn mb_dimensions(&self) -> Option<(u32, u32)> {
        let mut mb_width = self.seq_info2 & 0xff;
        let mb_total = (self.seq_info2 >> 8) & 0xffff;

        // 256 macroblocks wide does not fit the 8-bit field.
        if mb_width == 0 && mb_total != 0 {
            mb_width = 256;
        }

        if mb_width == 0 {
            return None;
        }

        let mb_height = mb_total / mb_width;
        if mb_height == 0 || is_oversize(mb_width << 4, mb_height << 4) {
            return None;
        }

        Some((mb_width, mb_height))
    }

    /// Computes the stream geometry, or `None` if the macroblock dimensions are invalid.
    pub fn geometry(
        &self,
        restriction: &BitstreamRestriction,
        no_poc_reorder: bool,
    ) -> Option<StreamGeometry> {
        let (mb_width, mb_height) = self.mb_dimensions()?;

        let frame_mbs_only = (self.seq_info >> 15) & 0x1 == 1;
        let chroma_format_idc = (self.seq_info >> 13) & 0x3;
        let chroma444 = u32::from(chroma_format_idc == 3);
        let crop_shift = if frame_mbs_only { 1 } else { 2 };
        let crop_bottom = (self.crop & 0xff) >> crop_shift;
        let crop_right = ((self.crop >> 16) & 0xff) >> crop_shift;

        let crop_unit = if frame_mbs_only { 2 } else { 4 } >> chroma444;
        let max_crop = (8 << chroma444) - 1;

        let width = (mb_width << 4) - crop_unit * std::cmp::min(crop_right, max_crop);
        let mut height = (mb_height << 4) - crop_unit * std::cmp::min(crop_bottom, max_crop);
        if height == 1088 {
            height = 1080;
        }

        let mb_width = (mb_width + 3) & !3;
        let mb_height = (mb_height + 3) & !3;
        let mb_total = mb_width * mb_height;

        let level_idc = self.level_and_refs & 0xff;
        let max_num_ref_frames = ((self.level_and_refs >> 8) & 0xff) as usize;

        let limits = DpbLimits::new(
            level_idc,
            max_num_ref_frames,
            mb_width,
            mb_height,
            restriction,
            no_poc_reorder,
        );

        Some(StreamGeometry {
            mb_width,
            mb_height,
            mb_total,
            display: Resolution { width, height },
            frame_mbs_only,
            level_idc,
            max_num_ref_frames,
            colocated_buf_size: mb_total * COLOCATED_BYTES_PER_MB,
            limits,
        })
    }
}

fn is_oversize(width: u32, height: u32) -> bool {
    height != 0 && width > MAX_SIZE_4K / height
}
