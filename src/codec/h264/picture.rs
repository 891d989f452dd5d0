// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Field {
    #[default]
    Frame,
    Top,
    Bottom,
}

impl Field {
    /// Returns the field of opposite parity.
    pub fn opposite(&self) -> Self {
        match *self {
            Field::Frame => Field::Frame,
            Field::Top => Field::Bottom,
            Field::Bottom => Field::Top,
        }
    }

    /// Decodes the `picture_structure` word of the parameter dump.
    pub fn from_structure(structure: u16) -> Option<Self> {
        match structure {
            1 => Some(Field::Top),
            2 => Some(Field::Bottom),
            3 => Some(Field::Frame),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Reference {
    #[default]
    None,
    ShortTerm,
    LongTerm,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum IsIdr {
    #[default]
    No,
    Yes {
        idr_pic_id: u16,
    },
}

/// Where the decoded buffer of a picture stands with respect to the consumer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Output {
    /// Decoded, withheld for reordering.
    #[default]
    Pending,
    /// Handed to the consumer with `frame_ready`, not returned yet.
    Displayed,
    /// Never output (flushed on a no-output IDR) or returned by the consumer.
    Done,
}

/// Data associated with a picture of the decoded picture buffer. A picture occupies one external
/// buffer, and both fields of a complementary field pair share it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PictureData {
    pub pic_order_cnt_type: u8,
    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
    pub pic_order_cnt: i32,
    pub pic_order_cnt_msb: i32,
    pub pic_order_cnt_lsb: i32,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt0: i32,
    pub delta_pic_order_cnt1: i32,
    pub frame_num: i32,
    pub frame_num_offset: i32,
    pub frame_num_wrap: i32,
    pub pic_num: i32,
    pub long_term_pic_num: i32,
    pub long_term_frame_idx: u32,
    pub nal_ref_idc: u8,
    pub is_idr: IsIdr,
    pub has_mmco_5: bool,

    /// Structure of the picture as currently held. Becomes `Frame` once the second field of a
    /// pair is decoded.
    pub field: Field,
    /// The field decoded first, for pictures coded as fields.
    pub first_field: Option<Field>,
    pub mbaff: bool,
    /// Whether the picture was coded as a frame (possibly MBAFF) rather than as fields.
    pub coded_frame: bool,
    /// I-slice and IDR markers reported to the consumer.
    pub data_flag: u32,

    /// Index of the external buffer holding the picture.
    pub buf_spec_num: usize,
    /// Index of the colocated motion vector buffer written by this picture, if any.
    pub colocated_buf_index: Option<usize>,

    reference: Reference,
    output: Output,
}

impl PictureData {
    /// Whether the current picture is a reference, either ShortTerm or LongTerm.
    pub fn is_ref(&self) -> bool {
        !matches!(self.reference, Reference::None)
    }

    pub fn set_reference(&mut self, reference: Reference) {
        log::debug!(
            "Set reference of buffer {} (POC {}) to {:?}",
            self.buf_spec_num,
            self.pic_order_cnt,
            reference
        );

        self.reference = reference;
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn output(&self) -> Output {
        self.output
    }

    pub fn set_output(&mut self, output: Output) {
        self.output = output;
    }

    /// Whether the picture still waits to be handed to the consumer.
    pub fn needed_for_output(&self) -> bool {
        matches!(self.output, Output::Pending)
    }

    /// Whether the picture is a single field still waiting for its pair.
    pub fn is_unpaired_field(&self) -> bool {
        !matches!(self.field, Field::Frame)
    }

    /// Whether this picture, currently a first field, is completed by a field of parity
    /// `field` with frame number `frame_num`.
    pub fn is_completed_by(&self, field: Field, frame_num: i32) -> bool {
        self.is_unpaired_field()
            && field != Field::Frame
            && field != self.field
            && self.frame_num == frame_num
    }

    /// Whether the field of parity `field` has been decoded into this picture.
    pub fn has_field(&self, field: Field) -> bool {
        match field {
            Field::Frame => matches!(self.field, Field::Frame),
            _ => matches!(self.field, Field::Frame) || self.field == field,
        }
    }

    /// Merges the second field `second` into this first field, turning the pair into a frame.
    pub fn merge_second_field(&mut self, second: &PictureData) {
        match second.field {
            Field::Top => self.top_field_order_cnt = second.top_field_order_cnt,
            Field::Bottom => self.bottom_field_order_cnt = second.bottom_field_order_cnt,
            Field::Frame => return,
        }

        self.first_field = Some(self.field);
        self.field = Field::Frame;
        self.coded_frame = false;
        self.pic_order_cnt = std::cmp::min(self.top_field_order_cnt, self.bottom_field_order_cnt);
        self.data_flag |= second.data_flag;
        self.has_mmco_5 |= second.has_mmco_5;
    }
}
