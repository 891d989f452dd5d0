// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sequence and slice header fields dumped by the firmware into local memory.
//!
//! The firmware parses the headers itself and writes the fields the host needs for DPB management
//! to the dump page before raising `SLICE_HEAD_DONE` or `CONFIG_REQUEST`. The page holds
//! `SIZE_RPM` little-endian 16-bit words, stored with every group of four words reversed.

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use enumn::N;
use thiserror::Error;

use crate::codec::h264::geometry::BitstreamRestriction;
use crate::codec::h264::picture::Field;

/// Number of 16-bit words in the dump.
pub const SIZE_RPM: usize = 0x400;
/// Size of the dump in bytes.
pub const RPM_BYTES: usize = SIZE_RPM * 2;

// Sequence parameters.
/// Bit 0: `frame_mbs_only_flag`, bit 1: `mb_adaptive_frame_field_flag`, bit 2:
/// `delta_pic_order_always_zero_flag`.
pub const SPS_FLAGS: usize = 0x04;
/// Bit 3: `bitstream_restriction_flag` of the VUI.
pub const SPS_FLAGS2: usize = 0x05;
pub const NUM_REORDER_FRAMES: usize = 0x06;
pub const MAX_BUFFER_FRAME: usize = 0x07;
pub const LOG2_MAX_FRAME_NUM: usize = 0x08;
pub const PIC_ORDER_CNT_TYPE: usize = 0x09;
pub const LOG2_MAX_PIC_ORDER_CNT_LSB: usize = 0x0a;
pub const OFFSET_FOR_NON_REF_PIC_LO: usize = 0x0b;
pub const OFFSET_FOR_TOP_TO_BOTTOM_FIELD_LO: usize = 0x0d;
pub const NUM_REF_FRAMES_IN_PIC_ORDER_CNT_CYCLE: usize = 0x0f;
pub const MAX_NUM_REF_FRAMES: usize = 0x10;
/// Bit 1: `direct_8x8_inference_flag`, bit 2: direct prediction enabled for the picture.
pub const MODE_8X8_FLAGS: usize = 0x11;

// Slice parameters.
/// Bits 0..5: `nal_unit_type`, bits 5..7: `nal_ref_idc`.
pub const NAL_INFO_MMCO: usize = 0x40;
pub const PIC_PARAMETER_SET_ID: usize = 0x41;
pub const SLICE_TYPE: usize = 0x42;
pub const FIRST_MB_IN_SLICE: usize = 0x43;
pub const FRAME_NUM: usize = 0x44;
/// 1: top field, 2: bottom field, 3: frame.
pub const PICTURE_STRUCTURE: usize = 0x45;
pub const MBAFF_FRAME: usize = 0x46;
pub const IDR_PIC_ID: usize = 0x47;
pub const PIC_ORDER_CNT_LSB: usize = 0x48;
pub const DELTA_PIC_ORDER_CNT_BOTTOM_LO: usize = 0x49;
pub const DELTA_PIC_ORDER_CNT0_LO: usize = 0x4b;
pub const DELTA_PIC_ORDER_CNT1_LO: usize = 0x4d;
pub const NUM_REF_IDX_L0_ACTIVE: usize = 0x4f;
pub const NUM_REF_IDX_L1_ACTIVE: usize = 0x50;
/// Bit 0: `ref_pic_list_modification_flag_l0`, bit 1: `ref_pic_list_modification_flag_l1`.
pub const LIST_MODIFICATION_FLAGS: usize = 0x51;
/// Bit 0: `no_output_of_prior_pics_flag`, bit 1: `long_term_reference_flag`, bit 2:
/// `adaptive_ref_pic_marking_mode_flag`.
pub const REF_PIC_MARKING_FLAGS: usize = 0x52;

/// Marking operations as `(memory_management_control_operation, arg0, arg1)` triplets, ended by
/// operation 0.
pub const MMCO_CMD: usize = 0x60;
pub const MAX_MMCO_CMDS: usize = 32;
/// List 0 modifications as `(modification_of_pic_nums_idc, value)` pairs, ended by idc 3.
pub const LIST0_MODIFICATION: usize = 0xc0;
pub const LIST1_MODIFICATION: usize = 0xe0;
pub const MAX_LIST_MODIFICATIONS: usize = 16;
/// One signed word per frame of the POC cycle.
pub const OFFSET_FOR_REF_FRAME: usize = 0x100;
pub const MAX_OFFSET_FOR_REF_FRAME: usize = 255;

/// Largest number of active entries of a reference list.
pub const MAX_REF_IDX_ACTIVE: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamError {
    #[error("parameter dump too short: {0} bytes")]
    TooShort(usize),
    #[error("invalid slice type {0}")]
    InvalidSliceType(u16),
    #[error("invalid picture structure {0}")]
    InvalidPictureStructure(u16),
    #[error("invalid pic_order_cnt_type {0}")]
    InvalidPicOrderCntType(u16),
    #[error("invalid log2_max_frame_num {0}")]
    InvalidLog2MaxFrameNum(u16),
    #[error("invalid log2_max_pic_order_cnt_lsb {0}")]
    InvalidLog2MaxPicOrderCntLsb(u16),
    #[error("invalid memory_management_control_operation {0}")]
    InvalidMmco(u16),
    #[error("invalid modification_of_pic_nums_idc {0}")]
    InvalidModification(u16),
}

/// Slice types, as numbered by the firmware.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SliceType {
    #[default]
    P = 0,
    B = 1,
    I = 2,
    Sp = 3,
    Si = 4,
}

impl SliceType {
    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P | SliceType::Sp)
    }

    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    pub fn is_i(&self) -> bool {
        matches!(self, SliceType::I | SliceType::Si)
    }
}

/// One reference picture marking operation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarkingOp {
    pub memory_management_control_operation: u8,
    /// Used with operations 1 and 3.
    pub difference_of_pic_nums_minus1: u32,
    /// Used with operation 2.
    pub long_term_pic_num: u32,
    /// Used with operations 3 and 6.
    pub long_term_frame_idx: u32,
    /// Used with operation 4.
    pub max_long_term_frame_idx_plus1: u32,
}

/// One reference picture list modification.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicListModification {
    pub modification_of_pic_nums_idc: u8,
    /// Used with idc 0 and 1.
    pub abs_diff_pic_num_minus1: u32,
    /// Used with idc 2.
    pub long_term_pic_num: u32,
}

/// Sequence level fields needed for POC and picture number derivation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequenceParams {
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub delta_pic_order_always_zero_flag: bool,
    pub log2_max_frame_num: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb: u8,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub offset_for_ref_frame: Vec<i32>,
    pub expected_delta_per_pic_order_cnt_cycle: i32,
    pub max_num_ref_frames: usize,
}

impl SequenceParams {
    pub fn max_frame_num(&self) -> i32 {
        1 << self.log2_max_frame_num
    }

    pub fn max_pic_order_cnt_lsb(&self) -> i32 {
        1 << self.log2_max_pic_order_cnt_lsb
    }
}

/// Slice header fields of the slice whose header was just parsed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceParams {
    pub nal_unit_type: u8,
    pub nal_ref_idc: u8,
    pub pic_parameter_set_id: u16,
    pub slice_type: SliceType,
    pub first_mb_in_slice: u32,
    pub frame_num: i32,
    pub field: Field,
    pub mbaff: bool,
    pub idr_pic_id: u16,
    pub pic_order_cnt_lsb: i32,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt0: i32,
    pub delta_pic_order_cnt1: i32,
    pub num_ref_idx_l0_active: usize,
    pub num_ref_idx_l1_active: usize,
    pub ref_pic_list_modification_flag_l0: bool,
    pub ref_pic_list_modification_flag_l1: bool,
    pub ref_pic_list_modification_l0: Vec<RefPicListModification>,
    pub ref_pic_list_modification_l1: Vec<RefPicListModification>,
    pub no_output_of_prior_pics_flag: bool,
    pub long_term_reference_flag: bool,
    pub adaptive_ref_pic_marking_mode_flag: bool,
    pub ref_pic_marking: Vec<RefPicMarkingOp>,
    /// Whether colocated data is addressed at 8x8 granularity.
    pub direct_8x8: bool,
}

impl SliceParams {
    pub fn is_idr(&self) -> bool {
        self.nal_unit_type == 5
    }
}

/// A copy of the parameter dump in firmware word order.
#[derive(Clone)]
pub struct ParamDump {
    data: Box<[u16; SIZE_RPM]>,
}

impl Default for ParamDump {
    fn default() -> Self {
        Self {
            data: Box::new([0; SIZE_RPM]),
        }
    }
}

impl std::fmt::Debug for ParamDump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamDump")
            .field("nal_info", &self.data[NAL_INFO_MMCO])
            .field("slice_type", &self.data[SLICE_TYPE])
            .field("frame_num", &self.data[FRAME_NUM])
            .finish()
    }
}

impl ParamDump {
    /// Decodes the raw content of the dump page.
    pub fn from_lmem(raw: &[u8]) -> Result<Self, ParamError> {
        if raw.len() < RPM_BYTES {
            return Err(ParamError::TooShort(raw.len()));
        }

        let mut words = [0u16; SIZE_RPM];
        LittleEndian::read_u16_into(&raw[..RPM_BYTES], &mut words);

        let mut dump = Self::default();
        for (dst, src) in dump.data.chunks_exact_mut(4).zip(words.chunks_exact(4)) {
            for j in 0..4 {
                dst[j] = src[3 - j];
            }
        }

        Ok(dump)
    }

    pub fn word(&self, index: usize) -> u16 {
        self.data.get(index).copied().unwrap_or(0)
    }

    /// Reads a signed 32-bit value split in a low and a high word.
    pub fn i32_at(&self, lo: usize) -> i32 {
        (u32::from(self.word(lo)) | (u32::from(self.word(lo + 1)) << 16)) as i32
    }

    pub fn bitstream_restriction(&self) -> BitstreamRestriction {
        BitstreamRestriction {
            bitstream_restriction_flag: (self.word(SPS_FLAGS2) >> 3) & 0x1 == 1,
            num_reorder_frames: self.word(NUM_REORDER_FRAMES),
            max_dec_frame_buffering: self.word(MAX_BUFFER_FRAME),
        }
    }

    /// Bits 0..5 of the NAL info word.
    pub fn nal_unit_type(&self) -> u8 {
        (self.word(NAL_INFO_MMCO) & 0x1f) as u8
    }

    pub fn sequence(&self) -> Result<SequenceParams, ParamError> {
        let flags = self.word(SPS_FLAGS);

        let log2_max_frame_num = self.word(LOG2_MAX_FRAME_NUM);
        if !(4..=16).contains(&log2_max_frame_num) {
            return Err(ParamError::InvalidLog2MaxFrameNum(log2_max_frame_num));
        }

        let pic_order_cnt_type = self.word(PIC_ORDER_CNT_TYPE);
        if pic_order_cnt_type > 2 {
            return Err(ParamError::InvalidPicOrderCntType(pic_order_cnt_type));
        }

        let log2_max_pic_order_cnt_lsb = self.word(LOG2_MAX_PIC_ORDER_CNT_LSB);
        if pic_order_cnt_type == 0 && !(4..=16).contains(&log2_max_pic_order_cnt_lsb) {
            return Err(ParamError::InvalidLog2MaxPicOrderCntLsb(
                log2_max_pic_order_cnt_lsb,
            ));
        }

        let cycle_len = std::cmp::min(
            usize::from(self.word(NUM_REF_FRAMES_IN_PIC_ORDER_CNT_CYCLE)),
            MAX_OFFSET_FOR_REF_FRAME,
        );
        let offset_for_ref_frame = (0..cycle_len)
            .map(|i| i32::from(self.word(OFFSET_FOR_REF_FRAME + i) as i16))
            .collect::<Vec<_>>();
        let expected_delta_per_pic_order_cnt_cycle = offset_for_ref_frame.iter().sum();

        Ok(SequenceParams {
            frame_mbs_only_flag: flags & 0x1 != 0,
            mb_adaptive_frame_field_flag: flags & 0x2 != 0,
            delta_pic_order_always_zero_flag: flags & 0x4 != 0,
            log2_max_frame_num: log2_max_frame_num as u8,
            pic_order_cnt_type: pic_order_cnt_type as u8,
            log2_max_pic_order_cnt_lsb: log2_max_pic_order_cnt_lsb as u8,
            offset_for_non_ref_pic: self.i32_at(OFFSET_FOR_NON_REF_PIC_LO),
            offset_for_top_to_bottom_field: self.i32_at(OFFSET_FOR_TOP_TO_BOTTOM_FIELD_LO),
            offset_for_ref_frame,
            expected_delta_per_pic_order_cnt_cycle,
            max_num_ref_frames: usize::from(self.word(MAX_NUM_REF_FRAMES)),
        })
    }

    pub fn slice(&self) -> Result<SliceParams, ParamError> {
        let nal_info = self.word(NAL_INFO_MMCO);

        let slice_type = self.word(SLICE_TYPE);
        let slice_type =
            SliceType::n(slice_type).ok_or(ParamError::InvalidSliceType(slice_type))?;

        let structure = self.word(PICTURE_STRUCTURE);
        let field =
            Field::from_structure(structure).ok_or(ParamError::InvalidPictureStructure(structure))?;

        let list_flags = self.word(LIST_MODIFICATION_FLAGS);
        let marking_flags = self.word(REF_PIC_MARKING_FLAGS);
        let adaptive_ref_pic_marking_mode_flag = marking_flags & 0x4 != 0;

        let ref_pic_marking = if adaptive_ref_pic_marking_mode_flag {
            self.ref_pic_marking()?
        } else {
            vec![]
        };

        let mode_8x8 = self.word(MODE_8X8_FLAGS);

        Ok(SliceParams {
            nal_unit_type: (nal_info & 0x1f) as u8,
            nal_ref_idc: ((nal_info >> 5) & 0x3) as u8,
            pic_parameter_set_id: self.word(PIC_PARAMETER_SET_ID),
            slice_type,
            first_mb_in_slice: u32::from(self.word(FIRST_MB_IN_SLICE)),
            frame_num: i32::from(self.word(FRAME_NUM)),
            field,
            mbaff: field == Field::Frame && self.word(MBAFF_FRAME) != 0,
            idr_pic_id: self.word(IDR_PIC_ID),
            pic_order_cnt_lsb: i32::from(self.word(PIC_ORDER_CNT_LSB)),
            delta_pic_order_cnt_bottom: self.i32_at(DELTA_PIC_ORDER_CNT_BOTTOM_LO),
            delta_pic_order_cnt0: self.i32_at(DELTA_PIC_ORDER_CNT0_LO),
            delta_pic_order_cnt1: self.i32_at(DELTA_PIC_ORDER_CNT1_LO),
            num_ref_idx_l0_active: std::cmp::min(
                usize::from(self.word(NUM_REF_IDX_L0_ACTIVE)),
                MAX_REF_IDX_ACTIVE,
            ),
            num_ref_idx_l1_active: std::cmp::min(
                usize::from(self.word(NUM_REF_IDX_L1_ACTIVE)),
                MAX_REF_IDX_ACTIVE,
            ),
            ref_pic_list_modification_flag_l0: list_flags & 0x1 != 0,
            ref_pic_list_modification_flag_l1: list_flags & 0x2 != 0,
            ref_pic_list_modification_l0: self.list_modification(LIST0_MODIFICATION)?,
            ref_pic_list_modification_l1: self.list_modification(LIST1_MODIFICATION)?,
            no_output_of_prior_pics_flag: marking_flags & 0x1 != 0,
            long_term_reference_flag: marking_flags & 0x2 != 0,
            adaptive_ref_pic_marking_mode_flag,
            ref_pic_marking,
            direct_8x8: (mode_8x8 & 0x4) != 0 && (mode_8x8 & 0x2) != 0,
        })
    }

    fn ref_pic_marking(&self) -> Result<Vec<RefPicMarkingOp>, ParamError> {
        let mut ops = vec![];

        for i in 0..MAX_MMCO_CMDS {
            let base = MMCO_CMD + i * 3;
            let op = self.word(base);
            let arg0 = u32::from(self.word(base + 1));
            let arg1 = u32::from(self.word(base + 2));

            let marking = match op {
                0 => break,
                1 => RefPicMarkingOp {
                    difference_of_pic_nums_minus1: arg0,
                    ..Default::default()
                },
                2 => RefPicMarkingOp {
                    long_term_pic_num: arg0,
                    ..Default::default()
                },
                3 => RefPicMarkingOp {
                    difference_of_pic_nums_minus1: arg0,
                    long_term_frame_idx: arg1,
                    ..Default::default()
                },
                4 => RefPicMarkingOp {
                    max_long_term_frame_idx_plus1: arg0,
                    ..Default::default()
                },
                5 => RefPicMarkingOp::default(),
                6 => RefPicMarkingOp {
                    long_term_frame_idx: arg0,
                    ..Default::default()
                },
                _ => return Err(ParamError::InvalidMmco(op)),
            };

            ops.push(RefPicMarkingOp {
                memory_management_control_operation: op as u8,
                ..marking
            });
        }

        Ok(ops)
    }

    fn list_modification(&self, start: usize) -> Result<Vec<RefPicListModification>, ParamError> {
        let mut modifications = vec![];

        for i in 0..MAX_LIST_MODIFICATIONS {
            let idc = self.word(start + i * 2);
            let value = u32::from(self.word(start + i * 2 + 1));

            let modification = match idc {
                0 | 1 => RefPicListModification {
                    modification_of_pic_nums_idc: idc as u8,
                    abs_diff_pic_num_minus1: value,
                    ..Default::default()
                },
                2 => RefPicListModification {
                    modification_of_pic_nums_idc: 2,
                    long_term_pic_num: value,
                    ..Default::default()
                },
                3 => break,
                _ => return Err(ParamError::InvalidModification(idc)),
            };

            modifications.push(modification);
        }

        Ok(modifications)
    }
}

/// Builds dump pages the way the firmware lays them out.
#[cfg(test)]
pub(crate) struct RpmBuilder {
    data: [u16; SIZE_RPM],
}

#[cfg(test)]
impl RpmBuilder {
    /// A progressive 4:2:0 sequence with POC type 0, 16-bit frame_num and POC lsb, and a P frame
    /// slice of a reference picture.
    pub fn new() -> Self {
        let mut builder = Self {
            data: [0; SIZE_RPM],
        };

        builder
            .set(SPS_FLAGS, 0x1)
            .set(LOG2_MAX_FRAME_NUM, 16)
            .set(LOG2_MAX_PIC_ORDER_CNT_LSB, 16)
            .set(MAX_NUM_REF_FRAMES, 4)
            .set(PICTURE_STRUCTURE, 3)
            .set(NAL_INFO_MMCO, (1 << 5) | 1)
            .set(SLICE_TYPE, SliceType::P as u16)
            .set(NUM_REF_IDX_L0_ACTIVE, 1)
            .set(NUM_REF_IDX_L1_ACTIVE, 1)
            .set(LIST0_MODIFICATION, 3)
            .set(LIST1_MODIFICATION, 3);

        builder
    }

    pub fn set(&mut self, index: usize, value: u16) -> &mut Self {
        self.data[index] = value;
        self
    }

    pub fn set_i32(&mut self, lo: usize, value: i32) -> &mut Self {
        self.data[lo] = value as u16;
        self.data[lo + 1] = ((value as u32) >> 16) as u16;
        self
    }

    pub fn nal(&mut self, nal_unit_type: u8, nal_ref_idc: u8) -> &mut Self {
        self.set(
            NAL_INFO_MMCO,
            u16::from(nal_unit_type & 0x1f) | (u16::from(nal_ref_idc & 0x3) << 5),
        )
    }

    pub fn mmco(&mut self, ops: &[(u16, u16, u16)]) -> &mut Self {
        self.data[REF_PIC_MARKING_FLAGS] |= 0x4;
        for (i, &(op, arg0, arg1)) in ops.iter().enumerate() {
            self.data[MMCO_CMD + i * 3] = op;
            self.data[MMCO_CMD + i * 3 + 1] = arg0;
            self.data[MMCO_CMD + i * 3 + 2] = arg1;
        }
        self.data[MMCO_CMD + ops.len() * 3] = 0;
        self
    }

    pub fn list_modification(&mut self, list: usize, mods: &[(u16, u16)]) -> &mut Self {
        let start = if list == 0 {
            LIST0_MODIFICATION
        } else {
            LIST1_MODIFICATION
        };

        self.data[LIST_MODIFICATION_FLAGS] |= 1 << list;
        for (i, &(idc, value)) in mods.iter().enumerate() {
            self.data[start + i * 2] = idc;
            self.data[start + i * 2 + 1] = value;
        }
        self.data[start + mods.len() * 2] = 3;
        self
    }

    /// The dump page content, in firmware order.
    pub fn to_lmem(&self) -> Vec<u8> {
        let mut words = [0u16; SIZE_RPM];
        for (dst, src) in words.chunks_exact_mut(4).zip(self.data.chunks_exact(4)) {
            for j in 0..4 {
                dst[3 - j] = src[j];
            }
        }

        let mut raw = vec![0u8; RPM_BYTES];
        LittleEndian::write_u16_into(&words, &mut raw);
        raw
    }

    pub fn build(&self) -> ParamDump {
        ParamDump {
            data: Box::new(self.data),
        }
    }
}
