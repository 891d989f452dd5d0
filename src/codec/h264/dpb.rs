// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoded picture buffer management.
//!
//! The [`Dpb`] decides which picture a slice belongs to, derives picture order counts and picture
//! numbers, builds the reference picture lists, marks references and orders pictures for output.
//! Storage itself is delegated to the [`PictureStore`]: one slot per frame, shared by both fields
//! of a field pair. Reference marking is tracked per slot, so an operation naming one field of a
//! pair applies to the whole pair.

use log::debug;
use log::trace;
use log::warn;
use thiserror::Error;

use crate::codec::h264::geometry::DpbLimits;
use crate::codec::h264::picture::Field;
use crate::codec::h264::picture::IsIdr;
use crate::codec::h264::picture::Output;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::picture::Reference;
use crate::codec::h264::rpm::RefPicListModification;
use crate::codec::h264::rpm::RefPicMarkingOp;
use crate::codec::h264::rpm::SequenceParams;
use crate::codec::h264::rpm::SliceParams;
use crate::codec::h264::store::PictureStore;
use crate::codec::h264::store::StoreError;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum MaxLongTermFrameIdx {
    #[default]
    NoLongTermFrameIndices,
    Idx(u32),
}

impl MaxLongTermFrameIdx {
    /// Create a value from `max_long_term_frame_idx_plus1`.
    pub fn from_value_plus1(max_long_term_frame_idx_plus1: u32) -> Self {
        match max_long_term_frame_idx_plus1 {
            0 => Self::NoLongTermFrameIndices,
            i @ 1.. => Self::Idx(i - 1),
        }
    }

    /// Whether `long_term_frame_idx` is above the maximum.
    fn exceeded_by(&self, long_term_frame_idx: u32) -> bool {
        match self {
            Self::NoLongTermFrameIndices => true,
            Self::Idx(max) => long_term_frame_idx > *max,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MmcoError {
    #[error("could not find a ShortTerm picture to mark in the DPB")]
    NoShortTermPic,
    #[error("could not find a LongTerm picture to mark in the DPB")]
    NoLongTermPic,
    #[error("unknown memory_management_control_operation {0}")]
    UnknownOperation(u8),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DpbError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Mmco(#[from] MmcoError),
    #[error("no ShortTerm reference found with pic_num {0}")]
    NoShortTermRef(i32),
    #[error("no LongTerm reference found with long_term_pic_num {0}")]
    NoLongTermRef(i32),
    #[error("no picture is being decoded")]
    NoCurrentPicture,
}

/// One entry of a reference picture list: a slot and the field of it that is referenced, or
/// `Field::Frame` for the whole frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RefPicEntry {
    pub slot: usize,
    pub field: Field,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicLists {
    pub list0: Vec<RefPicEntry>,
    pub list1: Vec<RefPicEntry>,
}

/// A picture released for display.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReadyPicture {
    pub buf_spec_num: usize,
    pub pic_order_cnt: i32,
    pub data_flag: u32,
}

/// The picture being decoded.
#[derive(Debug)]
pub struct CurrentPicture {
    /// The frame or field being decoded. For a second field, the slot still holds the first
    /// field until the picture is finished.
    pub pic: PictureData,
    pub slot: usize,
    pub second_field: bool,
    /// Header of the first slice, which carries the marking operations.
    header: SliceParams,
}

#[derive(Debug, Default)]
struct PrevReferencePicInfo {
    frame_num: i32,
    has_mmco_5: bool,
    top_field_order_cnt: i32,
    pic_order_cnt_msb: i32,
    pic_order_cnt_lsb: i32,
    field: Field,
}

#[derive(Debug, Default)]
struct PrevPicInfo {
    frame_num: i32,
    frame_num_offset: i32,
    has_mmco_5: bool,
}

#[derive(Debug, Default)]
pub struct Dpb {
    store: PictureStore,
    limits: DpbLimits,
    /// Number of reference frames declared by the stream, bounding the sliding window.
    max_num_ref_frames: usize,
    max_long_term_frame_idx: MaxLongTermFrameIdx,
    current: Option<CurrentPicture>,
    /// Slot of a first field waiting for its pair. Not eligible for output until paired.
    last_field: Option<usize>,
    prev_slice: Option<SliceParams>,
    prev_ref_pic_info: PrevReferencePicInfo,
    prev_pic_info: PrevPicInfo,
    /// Colocated buffers of pictures no longer used for reference.
    freed_colocated: Vec<usize>,
}

/// 8.2.4.1: picture numbers of fields.
fn field_pic_num(value: i32, field: Field, cur_field: Field) -> i32 {
    if field == cur_field {
        2 * value + 1
    } else {
        2 * value
    }
}

/// 7.4.1.2.4: whether `slice` starts a new picture after `prev`.
fn first_slice_of_new_picture(prev: &SliceParams, slice: &SliceParams, poc_type: u8) -> bool {
    prev.frame_num != slice.frame_num
        || prev.pic_parameter_set_id != slice.pic_parameter_set_id
        || prev.field != slice.field
        || (prev.nal_ref_idc == 0) != (slice.nal_ref_idc == 0)
        || (poc_type == 0
            && (prev.pic_order_cnt_lsb != slice.pic_order_cnt_lsb
                || prev.delta_pic_order_cnt_bottom != slice.delta_pic_order_cnt_bottom))
        || (poc_type == 1
            && (prev.delta_pic_order_cnt0 != slice.delta_pic_order_cnt0
                || prev.delta_pic_order_cnt1 != slice.delta_pic_order_cnt1))
        || prev.is_idr() != slice.is_idr()
        || (prev.is_idr() && slice.is_idr() && prev.idr_pic_id != slice.idr_pic_id)
}

/// Copies fields from the ordered frame list into a field list as per 8.2.4.2.5, alternating
/// parities starting with the parity of the current field.
fn init_ref_field_pic_list(
    frames: &[(usize, &PictureData)],
    cur_field: Field,
    ref_pic_list: &mut Vec<RefPicEntry>,
) {
    let fields_of = |field: Field| {
        frames
            .iter()
            .filter(move |(_, pic)| pic.has_field(field))
            .map(move |&(slot, _)| RefPicEntry { slot, field })
    };

    let mut same = fields_of(cur_field);
    let mut opposite = fields_of(cur_field.opposite());

    loop {
        match same.next() {
            Some(entry) => ref_pic_list.push(entry),
            None => {
                ref_pic_list.extend(opposite);
                break;
            }
        }

        match opposite.next() {
            Some(entry) => ref_pic_list.push(entry),
            None => {
                ref_pic_list.extend(same);
                break;
            }
        }
    }
}

fn frame_entries<'a>(refs: impl IntoIterator<Item = (usize, &'a PictureData)>) -> Vec<RefPicEntry> {
    refs.into_iter()
        .map(|(slot, _)| RefPicEntry {
            slot,
            field: Field::Frame,
        })
        .collect()
}

// When the reference picture list RefPicList1 has more than one entry
// and RefPicList1 is identical to the reference picture list
// RefPicList0, the first two entries RefPicList1[0] and RefPicList1[1]
// are switched.
fn swap_b1_if_needed(b0: &[RefPicEntry], b1: &mut [RefPicEntry]) {
    if b1.len() > 1 && b0 == b1 {
        b1.swap(0, 1);
    }
}

impl Dpb {
    pub fn limits(&self) -> &DpbLimits {
        &self.limits
    }

    /// Number of external buffers, i.e. `mDPB.size` for the firmware.
    pub fn size(&self) -> usize {
        self.store.capacity()
    }

    pub fn store(&self) -> &PictureStore {
        &self.store
    }

    pub fn current(&self) -> Option<&CurrentPicture> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut CurrentPicture> {
        self.current.as_mut()
    }

    /// Applies new limits. Pending pictures are returned in output order and everything else is
    /// dropped.
    pub fn configure(&mut self, limits: DpbLimits, max_num_ref_frames: usize) -> Vec<ReadyPicture> {
        self.store.discard();
        self.current = None;
        let ready = self.drain();

        debug!(
            "Configuring DPB: {:?}, max_num_ref_frames {}",
            limits, max_num_ref_frames
        );

        *self = Self {
            store: PictureStore::new(limits.active_buffer_spec_num),
            limits,
            max_num_ref_frames,
            ..Default::default()
        };

        ready
    }

    /// Drops every picture, keeping the current limits.
    pub fn clear(&mut self) {
        let limits = self.limits;
        let max_num_ref_frames = self.max_num_ref_frames;

        *self = Self {
            store: PictureStore::new(limits.active_buffer_spec_num),
            limits,
            max_num_ref_frames,
            ..Default::default()
        };
    }

    fn references(&self) -> impl Iterator<Item = (usize, &PictureData)> {
        (0..self.store.capacity())
            .filter_map(move |i| self.store.get(i).map(|pic| (i, pic)))
            .filter(|(_, pic)| pic.is_ref())
    }

    fn short_term_refs(&self) -> impl Iterator<Item = (usize, &PictureData)> {
        self.references()
            .filter(|(_, pic)| matches!(pic.reference(), Reference::ShortTerm))
    }

    fn long_term_refs(&self) -> impl Iterator<Item = (usize, &PictureData)> {
        self.references()
            .filter(|(_, pic)| matches!(pic.reference(), Reference::LongTerm))
    }

    pub fn num_ref_frames(&self) -> usize {
        self.store.stored().filter(|(_, pic)| pic.is_ref()).count()
    }

    /// Whether `slice` is the first slice of a new picture.
    pub fn is_new_picture(&self, sps: &SequenceParams, slice: &SliceParams) -> bool {
        match (&self.current, &self.prev_slice) {
            (Some(_), Some(prev)) => {
                first_slice_of_new_picture(prev, slice, sps.pic_order_cnt_type)
            }
            _ => true,
        }
    }

    /// Records a further slice of the current picture.
    pub fn continue_picture(&mut self, slice: &SliceParams) {
        self.prev_slice = Some(slice.clone());
    }

    /// Starts decoding the picture whose first slice is `slice`, returning the slot receiving it.
    /// The second field of a pair reuses the slot of the first one.
    pub fn begin_picture(
        &mut self,
        sps: &SequenceParams,
        slice: &SliceParams,
    ) -> Result<usize, DpbError> {
        if let Some(current) = &self.current {
            return Err(StoreError::AlreadyDecoding(current.slot).into());
        }

        let max_frame_num = sps.max_frame_num();

        if !slice.is_idr() && self.num_ref_frames() > 0 {
            let prev = self.prev_ref_pic_info.frame_num;
            if slice.frame_num != prev && slice.frame_num != (prev + 1) % max_frame_num {
                warn!("Gap in frame_num: {} follows {}", slice.frame_num, prev);
            }
        }

        let mut pic = PictureData::default();
        pic.pic_order_cnt_type = sps.pic_order_cnt_type;
        pic.pic_order_cnt_lsb = slice.pic_order_cnt_lsb;
        pic.delta_pic_order_cnt_bottom = slice.delta_pic_order_cnt_bottom;
        pic.delta_pic_order_cnt0 = slice.delta_pic_order_cnt0;
        pic.delta_pic_order_cnt1 = slice.delta_pic_order_cnt1;
        pic.frame_num = slice.frame_num;
        pic.nal_ref_idc = slice.nal_ref_idc;
        pic.is_idr = if slice.is_idr() {
            IsIdr::Yes {
                idr_pic_id: slice.idr_pic_id,
            }
        } else {
            IsIdr::No
        };
        pic.field = slice.field;
        pic.mbaff = slice.mbaff;
        pic.coded_frame = slice.field == Field::Frame;

        self.compute_pic_order_count(&mut pic, sps);

        pic.pic_order_cnt = match pic.field {
            Field::Frame => std::cmp::min(pic.top_field_order_cnt, pic.bottom_field_order_cnt),
            Field::Top => pic.top_field_order_cnt,
            Field::Bottom => pic.bottom_field_order_cnt,
        };

        pic.pic_num = match pic.field {
            Field::Frame => pic.frame_num,
            _ => 2 * pic.frame_num + 1,
        };

        let first_field = self.last_field.filter(|&index| {
            self.store.get(index).map_or(false, |first| {
                first.is_completed_by(pic.field, pic.frame_num)
                    && !first.has_mmco_5
                    && (first.nal_ref_idc != 0) == (pic.nal_ref_idc != 0)
            })
        });

        let (slot, second_field) = match first_field {
            Some(slot) => {
                self.store.reopen(slot)?;

                if let Some(first) = self.store.get(slot) {
                    match pic.field {
                        Field::Top => pic.bottom_field_order_cnt = first.bottom_field_order_cnt,
                        _ => pic.top_field_order_cnt = first.top_field_order_cnt,
                    }
                    pic.colocated_buf_index = first.colocated_buf_index;
                }

                self.last_field = None;
                (slot, true)
            }
            None => {
                let slot = self.store.allocate(pic.clone())?;

                if let Some(index) = self.last_field.take() {
                    warn!("Field in buffer {} was not paired", index);
                }

                (slot, false)
            }
        };

        pic.buf_spec_num = slot;
        self.update_pic_nums(pic.frame_num, max_frame_num);

        debug!(
            "New picture in buffer {}: {:?} frame_num {} POC {}{}",
            slot,
            pic.field,
            pic.frame_num,
            pic.pic_order_cnt,
            if second_field { " (second field)" } else { "" }
        );

        self.prev_slice = Some(slice.clone());
        self.current = Some(CurrentPicture {
            pic,
            slot,
            second_field,
            header: slice.clone(),
        });

        Ok(slot)
    }

    fn compute_pic_order_count(&mut self, pic: &mut PictureData, sps: &SequenceParams) {
        match pic.pic_order_cnt_type {
            // Spec 8.2.1.1
            0 => {
                let prev_pic_order_cnt_msb;
                let prev_pic_order_cnt_lsb;

                if matches!(pic.is_idr, IsIdr::Yes { .. }) {
                    prev_pic_order_cnt_lsb = 0;
                    prev_pic_order_cnt_msb = 0;
                } else if self.prev_ref_pic_info.has_mmco_5 {
                    prev_pic_order_cnt_msb = 0;
                    prev_pic_order_cnt_lsb =
                        if !matches!(self.prev_ref_pic_info.field, Field::Bottom) {
                            self.prev_ref_pic_info.top_field_order_cnt
                        } else {
                            0
                        };
                } else {
                    prev_pic_order_cnt_msb = self.prev_ref_pic_info.pic_order_cnt_msb;
                    prev_pic_order_cnt_lsb = self.prev_ref_pic_info.pic_order_cnt_lsb;
                }

                let max_pic_order_cnt_lsb = sps.max_pic_order_cnt_lsb();

                if (pic.pic_order_cnt_lsb < prev_pic_order_cnt_lsb)
                    && (prev_pic_order_cnt_lsb.wrapping_sub(pic.pic_order_cnt_lsb)
                        >= max_pic_order_cnt_lsb / 2)
                {
                    pic.pic_order_cnt_msb =
                        prev_pic_order_cnt_msb.wrapping_add(max_pic_order_cnt_lsb);
                } else if (pic.pic_order_cnt_lsb > prev_pic_order_cnt_lsb)
                    && (pic.pic_order_cnt_lsb.wrapping_sub(prev_pic_order_cnt_lsb)
                        > max_pic_order_cnt_lsb / 2)
                {
                    pic.pic_order_cnt_msb =
                        prev_pic_order_cnt_msb.wrapping_sub(max_pic_order_cnt_lsb);
                } else {
                    pic.pic_order_cnt_msb = prev_pic_order_cnt_msb;
                }

                if !matches!(pic.field, Field::Bottom) {
                    pic.top_field_order_cnt =
                        pic.pic_order_cnt_msb.wrapping_add(pic.pic_order_cnt_lsb);
                }

                if !matches!(pic.field, Field::Top) {
                    if matches!(pic.field, Field::Frame) {
                        pic.bottom_field_order_cnt = pic
                            .top_field_order_cnt
                            .wrapping_add(pic.delta_pic_order_cnt_bottom);
                    } else {
                        pic.bottom_field_order_cnt =
                            pic.pic_order_cnt_msb.wrapping_add(pic.pic_order_cnt_lsb);
                    }
                }
            }

            // Spec 8.2.1.2
            1 => {
                self.update_frame_num_offset(pic, sps);

                let num_ref_frames_in_pic_order_cnt_cycle = sps.offset_for_ref_frame.len() as i32;

                let mut abs_frame_num = if num_ref_frames_in_pic_order_cnt_cycle != 0 {
                    pic.frame_num_offset.wrapping_add(pic.frame_num)
                } else {
                    0
                };

                if pic.nal_ref_idc == 0 && abs_frame_num > 0 {
                    abs_frame_num -= 1;
                }

                let mut expected_pic_order_cnt = 0;

                if abs_frame_num > 0 {
                    let pic_order_cnt_cycle_cnt =
                        (abs_frame_num - 1) / num_ref_frames_in_pic_order_cnt_cycle;
                    let frame_num_in_pic_order_cnt_cycle =
                        (abs_frame_num - 1) % num_ref_frames_in_pic_order_cnt_cycle;

                    expected_pic_order_cnt = sps
                        .offset_for_ref_frame
                        .iter()
                        .take(frame_num_in_pic_order_cnt_cycle as usize + 1)
                        .fold(
                            pic_order_cnt_cycle_cnt
                                .wrapping_mul(sps.expected_delta_per_pic_order_cnt_cycle),
                            |acc, offset| acc.wrapping_add(*offset),
                        );
                }

                if pic.nal_ref_idc == 0 {
                    expected_pic_order_cnt =
                        expected_pic_order_cnt.wrapping_add(sps.offset_for_non_ref_pic);
                }

                let top = expected_pic_order_cnt.wrapping_add(pic.delta_pic_order_cnt0);

                if matches!(pic.field, Field::Frame) {
                    pic.top_field_order_cnt = top;
                    pic.bottom_field_order_cnt = top
                        .wrapping_add(sps.offset_for_top_to_bottom_field)
                        .wrapping_add(pic.delta_pic_order_cnt1);
                } else if !matches!(pic.field, Field::Bottom) {
                    pic.top_field_order_cnt = top;
                } else {
                    pic.bottom_field_order_cnt = expected_pic_order_cnt
                        .wrapping_add(sps.offset_for_top_to_bottom_field)
                        .wrapping_add(pic.delta_pic_order_cnt0);
                }
            }

            // Spec 8.2.1.3
            _ => {
                self.update_frame_num_offset(pic, sps);

                let temp_pic_order_cnt = if matches!(pic.is_idr, IsIdr::Yes { .. }) {
                    0
                } else {
                    let cnt = pic.frame_num_offset.wrapping_add(pic.frame_num).wrapping_mul(2);
                    if pic.nal_ref_idc == 0 {
                        cnt.wrapping_sub(1)
                    } else {
                        cnt
                    }
                };

                if matches!(pic.field, Field::Frame) {
                    pic.top_field_order_cnt = temp_pic_order_cnt;
                    pic.bottom_field_order_cnt = temp_pic_order_cnt;
                } else if matches!(pic.field, Field::Bottom) {
                    pic.bottom_field_order_cnt = temp_pic_order_cnt;
                } else {
                    pic.top_field_order_cnt = temp_pic_order_cnt;
                }
            }
        }
    }

    fn update_frame_num_offset(&mut self, pic: &mut PictureData, sps: &SequenceParams) {
        if self.prev_pic_info.has_mmco_5 {
            self.prev_pic_info.frame_num_offset = 0;
        }

        if matches!(pic.is_idr, IsIdr::Yes { .. }) {
            pic.frame_num_offset = 0;
        } else if self.prev_pic_info.frame_num > pic.frame_num {
            pic.frame_num_offset = self
                .prev_pic_info
                .frame_num_offset
                .wrapping_add(sps.max_frame_num());
        } else {
            pic.frame_num_offset = self.prev_pic_info.frame_num_offset;
        }
    }

    fn update_pic_nums(&mut self, frame_num: i32, max_frame_num: i32) {
        for i in 0..self.store.capacity() {
            let pic = match self.store.get_mut(i) {
                Some(pic) if pic.is_ref() => pic,
                _ => continue,
            };

            if *pic.reference() == Reference::LongTerm {
                pic.long_term_pic_num = pic.long_term_frame_idx as i32;
            } else {
                pic.frame_num_wrap = if pic.frame_num > frame_num {
                    pic.frame_num - max_frame_num
                } else {
                    pic.frame_num
                };

                pic.pic_num = pic.frame_num_wrap;
            }
        }
    }

    fn find_short_term_with_pic_num(&self, pic_num: i32, cur_field: Field) -> Option<RefPicEntry> {
        self.short_term_refs().find_map(|(slot, pic)| match cur_field {
            Field::Frame => (pic.field == Field::Frame && pic.pic_num == pic_num)
                .then_some(RefPicEntry { slot, field: Field::Frame }),
            _ => [Field::Top, Field::Bottom]
                .into_iter()
                .find(|&f| {
                    pic.has_field(f) && field_pic_num(pic.frame_num_wrap, f, cur_field) == pic_num
                })
                .map(|field| RefPicEntry { slot, field }),
        })
    }

    fn find_long_term_with_long_term_pic_num(
        &self,
        long_term_pic_num: i32,
        cur_field: Field,
    ) -> Option<RefPicEntry> {
        self.long_term_refs().find_map(|(slot, pic)| match cur_field {
            Field::Frame => (pic.field == Field::Frame
                && pic.long_term_pic_num == long_term_pic_num)
                .then_some(RefPicEntry { slot, field: Field::Frame }),
            _ => [Field::Top, Field::Bottom]
                .into_iter()
                .find(|&f| {
                    pic.has_field(f)
                        && field_pic_num(pic.long_term_frame_idx as i32, f, cur_field)
                            == long_term_pic_num
                })
                .map(|field| RefPicEntry { slot, field }),
        })
    }

    /// 8.2.4.2.1 Initialization process for the reference picture list for P
    /// and SP slices in frames
    fn build_ref_pic_list_p(&self) -> Vec<RefPicEntry> {
        let mut short_term: Vec<_> = self
            .short_term_refs()
            .filter(|(_, pic)| pic.field == Field::Frame)
            .collect();
        short_term.sort_by_key(|(_, pic)| std::cmp::Reverse(pic.pic_num));

        let mut long_term: Vec<_> = self
            .long_term_refs()
            .filter(|(_, pic)| pic.field == Field::Frame)
            .collect();
        long_term.sort_by_key(|(_, pic)| pic.long_term_pic_num);

        frame_entries(short_term.into_iter().chain(long_term))
    }

    /// 8.2.4.2.2 Initialization process for the reference picture list for P
    /// and SP slices in fields
    fn build_ref_field_pic_list_p(&self, cur_pic: &PictureData) -> Vec<RefPicEntry> {
        let mut ref_pic_list_p0 = vec![];

        let mut short_term: Vec<_> = self.short_term_refs().collect();
        short_term.sort_by_key(|(_, pic)| std::cmp::Reverse(pic.frame_num_wrap));

        let mut long_term: Vec<_> = self.long_term_refs().collect();
        long_term.sort_by_key(|(_, pic)| pic.long_term_frame_idx);

        // 8.2.4.2.5
        init_ref_field_pic_list(&short_term, cur_pic.field, &mut ref_pic_list_p0);
        init_ref_field_pic_list(&long_term, cur_pic.field, &mut ref_pic_list_p0);

        ref_pic_list_p0
    }

    /// Orders short term references for B slices: those on the `before` side of the current POC
    /// by descending POC, then the others by ascending POC. `before` includes equal POCs for
    /// fields.
    fn order_b_short_term<'a>(
        refs: &[(usize, &'a PictureData)],
        cur_poc: i32,
        before: impl Fn(i32, i32) -> bool,
        list0: bool,
    ) -> Vec<(usize, &'a PictureData)> {
        let (mut first, mut remaining): (Vec<_>, Vec<_>) =
            refs.iter().copied().partition(|(_, pic)| before(pic.pic_order_cnt, cur_poc) == list0);

        if list0 {
            first.sort_by_key(|(_, pic)| std::cmp::Reverse(pic.pic_order_cnt));
            remaining.sort_by_key(|(_, pic)| pic.pic_order_cnt);
        } else {
            first.sort_by_key(|(_, pic)| pic.pic_order_cnt);
            remaining.sort_by_key(|(_, pic)| std::cmp::Reverse(pic.pic_order_cnt));
        }

        first.append(&mut remaining);
        first
    }

    // 8.2.4.2.3 Initialization process for reference picture lists for B slices
    // in frames
    fn build_ref_pic_list_b(&self, cur_pic: &PictureData) -> (Vec<RefPicEntry>, Vec<RefPicEntry>) {
        let short_term: Vec<_> = self
            .short_term_refs()
            .filter(|(_, pic)| pic.field == Field::Frame)
            .collect();

        let mut long_term: Vec<_> = self
            .long_term_refs()
            .filter(|(_, pic)| pic.field == Field::Frame)
            .collect();
        long_term.sort_by_key(|(_, pic)| pic.long_term_pic_num);

        let before = |poc: i32, cur: i32| poc < cur;

        let ref_pic_list_b0 = frame_entries(
            Self::order_b_short_term(&short_term, cur_pic.pic_order_cnt, before, true)
                .into_iter()
                .chain(long_term.iter().copied()),
        );
        let mut ref_pic_list_b1 = frame_entries(
            Self::order_b_short_term(&short_term, cur_pic.pic_order_cnt, before, false)
                .into_iter()
                .chain(long_term.iter().copied()),
        );

        swap_b1_if_needed(&ref_pic_list_b0, &mut ref_pic_list_b1);

        (ref_pic_list_b0, ref_pic_list_b1)
    }

    /// 8.2.4.2.4 Initialization process for reference picture lists for B
    /// slices in fields
    fn build_ref_field_pic_list_b(
        &self,
        cur_pic: &PictureData,
    ) -> (Vec<RefPicEntry>, Vec<RefPicEntry>) {
        let short_term: Vec<_> = self.short_term_refs().collect();

        let mut long_term: Vec<_> = self.long_term_refs().collect();
        long_term.sort_by_key(|(_, pic)| pic.long_term_frame_idx);

        let before = |poc: i32, cur: i32| poc <= cur;
        let ref_frame_list_0_short_term =
            Self::order_b_short_term(&short_term, cur_pic.pic_order_cnt, before, true);
        let ref_frame_list_1_short_term =
            Self::order_b_short_term(&short_term, cur_pic.pic_order_cnt, before, false);

        let mut ref_pic_list_b0 = vec![];
        let mut ref_pic_list_b1 = vec![];

        // 8.2.4.2.5
        init_ref_field_pic_list(&ref_frame_list_0_short_term, cur_pic.field, &mut ref_pic_list_b0);
        init_ref_field_pic_list(&long_term, cur_pic.field, &mut ref_pic_list_b0);

        init_ref_field_pic_list(&ref_frame_list_1_short_term, cur_pic.field, &mut ref_pic_list_b1);
        init_ref_field_pic_list(&long_term, cur_pic.field, &mut ref_pic_list_b1);

        swap_b1_if_needed(&ref_pic_list_b0, &mut ref_pic_list_b1);

        (ref_pic_list_b0, ref_pic_list_b1)
    }

    /// 8.2.4.3 Modification process for reference picture lists
    fn modify_ref_pic_list(
        &self,
        cur_pic: &PictureData,
        max_frame_num: i32,
        ref_pic_list: &mut Vec<RefPicEntry>,
        modifications: &[RefPicListModification],
        num_ref_idx_active: usize,
    ) -> Result<(), DpbError> {
        let max_pic_num = match cur_pic.field {
            Field::Frame => max_frame_num,
            _ => 2 * max_frame_num,
        };

        let mut pic_num_lx_pred = cur_pic.pic_num;
        let mut ref_idx_lx = 0;

        for modification in modifications {
            let entry = match modification.modification_of_pic_nums_idc {
                // 8.2.4.3.1
                idc @ (0 | 1) => {
                    let abs_diff_pic_num = modification.abs_diff_pic_num_minus1 as i32 + 1;

                    let pic_num_lx_no_wrap = if idc == 0 {
                        if pic_num_lx_pred - abs_diff_pic_num < 0 {
                            pic_num_lx_pred - abs_diff_pic_num + max_pic_num
                        } else {
                            pic_num_lx_pred - abs_diff_pic_num
                        }
                    } else if pic_num_lx_pred + abs_diff_pic_num >= max_pic_num {
                        pic_num_lx_pred + abs_diff_pic_num - max_pic_num
                    } else {
                        pic_num_lx_pred + abs_diff_pic_num
                    };

                    pic_num_lx_pred = pic_num_lx_no_wrap;

                    let pic_num_lx = if pic_num_lx_no_wrap > cur_pic.pic_num {
                        pic_num_lx_no_wrap - max_pic_num
                    } else {
                        pic_num_lx_no_wrap
                    };

                    self.find_short_term_with_pic_num(pic_num_lx, cur_pic.field)
                        .ok_or(DpbError::NoShortTermRef(pic_num_lx))?
                }
                // 8.2.4.3.2
                2 => {
                    let long_term_pic_num = modification.long_term_pic_num as i32;

                    self.find_long_term_with_long_term_pic_num(long_term_pic_num, cur_pic.field)
                        .ok_or(DpbError::NoLongTermRef(long_term_pic_num))?
                }
                _ => break,
            };

            let position = std::cmp::min(ref_idx_lx, ref_pic_list.len());
            ref_pic_list.insert(position, entry);
            ref_idx_lx = position + 1;

            let mut cidx = ref_idx_lx;
            while cidx < ref_pic_list.len() {
                if ref_pic_list[cidx] == entry {
                    ref_pic_list.remove(cidx);
                } else {
                    cidx += 1;
                }
            }

            ref_pic_list.truncate(num_ref_idx_active);
        }

        Ok(())
    }

    /// Returns the reference picture lists of the current picture for `slice`.
    pub fn ref_pic_lists(
        &self,
        sps: &SequenceParams,
        slice: &SliceParams,
    ) -> Result<RefPicLists, DpbError> {
        let cur_pic = &self
            .current
            .as_ref()
            .ok_or(DpbError::NoCurrentPicture)?
            .pic;

        let (mut list0, mut list1) = if slice.slice_type.is_b() {
            match cur_pic.field {
                Field::Frame => self.build_ref_pic_list_b(cur_pic),
                _ => self.build_ref_field_pic_list_b(cur_pic),
            }
        } else if slice.slice_type.is_p() {
            let list0 = match cur_pic.field {
                Field::Frame => self.build_ref_pic_list_p(),
                _ => self.build_ref_field_pic_list_p(cur_pic),
            };
            (list0, vec![])
        } else {
            return Ok(Default::default());
        };

        list0.truncate(slice.num_ref_idx_l0_active);
        if slice.ref_pic_list_modification_flag_l0 {
            self.modify_ref_pic_list(
                cur_pic,
                sps.max_frame_num(),
                &mut list0,
                &slice.ref_pic_list_modification_l0,
                slice.num_ref_idx_l0_active,
            )?;
        }

        if slice.slice_type.is_b() {
            list1.truncate(slice.num_ref_idx_l1_active);
            if slice.ref_pic_list_modification_flag_l1 {
                self.modify_ref_pic_list(
                    cur_pic,
                    sps.max_frame_num(),
                    &mut list1,
                    &slice.ref_pic_list_modification_l1,
                    slice.num_ref_idx_l1_active,
                )?;
            }
        }

        debug!("RefPicList0: {:?}", list0);
        debug!("RefPicList1: {:?}", list1);

        Ok(RefPicLists { list0, list1 })
    }

    pub fn mark_all_as_unused_for_ref(&mut self) {
        for (_, pic) in self.store.stored_mut() {
            pic.set_reference(Reference::None);
        }
    }

    // 8.2.5.3
    fn sliding_window_marking(&mut self) -> Result<(), DpbError> {
        let max_num_ref_frames = std::cmp::max(1, self.max_num_ref_frames);
        let mut num_ref_frames = self.num_ref_frames();

        while num_ref_frames >= max_num_ref_frames {
            let (_, to_unmark) = self
                .store
                .stored_mut()
                .filter(|(_, pic)| matches!(pic.reference(), Reference::ShortTerm))
                .min_by_key(|(_, pic)| pic.frame_num_wrap)
                .ok_or(MmcoError::NoShortTermPic)?;

            to_unmark.set_reference(Reference::None);
            num_ref_frames -= 1;
        }

        Ok(())
    }

    fn mmco_op_1(&mut self, pic: &PictureData, marking: &RefPicMarkingOp) -> Result<(), MmcoError> {
        let pic_num_x = pic.pic_num - (marking.difference_of_pic_nums_minus1 as i32 + 1);

        debug!("MMCO op 1 for pic_num_x {}", pic_num_x);
        trace!("Dpb state before MMCO=1: {:#?}", self);

        let to_mark = self
            .find_short_term_with_pic_num(pic_num_x, pic.field)
            .ok_or(MmcoError::NoShortTermPic)?;

        if let Some(to_mark) = self.store.get_mut(to_mark.slot) {
            to_mark.set_reference(Reference::None);
        }

        Ok(())
    }

    fn mmco_op_2(&mut self, pic: &PictureData, marking: &RefPicMarkingOp) -> Result<(), MmcoError> {
        debug!(
            "MMCO op 2 for long_term_pic_num {}",
            marking.long_term_pic_num
        );
        trace!("Dpb state before MMCO=2: {:#?}", self);

        let to_mark = self
            .find_long_term_with_long_term_pic_num(marking.long_term_pic_num as i32, pic.field)
            .ok_or(MmcoError::NoLongTermPic)?;

        if let Some(to_mark) = self.store.get_mut(to_mark.slot) {
            to_mark.set_reference(Reference::None);
        }

        Ok(())
    }

    fn mmco_op_3(&mut self, pic: &PictureData, marking: &RefPicMarkingOp) -> Result<(), MmcoError> {
        let pic_num_x = pic.pic_num - (marking.difference_of_pic_nums_minus1 as i32 + 1);
        let long_term_frame_idx = marking.long_term_frame_idx;

        debug!("MMCO op 3 for pic_num_x {}", pic_num_x);
        trace!("Dpb state before MMCO=3: {:#?}", self);

        let to_mark_as_long = self
            .find_short_term_with_pic_num(pic_num_x, pic.field)
            .ok_or(MmcoError::NoShortTermPic)?;

        // When LongTermFrameIdx is already assigned to another frame or field pair, it is
        // marked as "unused for reference".
        for (slot, other) in self.store.stored_mut() {
            if slot != to_mark_as_long.slot
                && matches!(other.reference(), Reference::LongTerm)
                && other.long_term_frame_idx == long_term_frame_idx
            {
                other.set_reference(Reference::None);
            }
        }

        if let Some(to_mark) = self.store.get_mut(to_mark_as_long.slot) {
            to_mark.set_reference(Reference::LongTerm);
            to_mark.long_term_frame_idx = long_term_frame_idx;
        }

        Ok(())
    }

    fn mmco_op_4(&mut self, marking: &RefPicMarkingOp) {
        let max_long_term_frame_idx =
            MaxLongTermFrameIdx::from_value_plus1(marking.max_long_term_frame_idx_plus1);

        debug!(
            "MMCO op 4, max_long_term_frame_idx: {:?}",
            max_long_term_frame_idx
        );
        trace!("Dpb state before MMCO=4: {:#?}", self);

        for (_, pic) in self.store.stored_mut() {
            if matches!(pic.reference(), Reference::LongTerm)
                && max_long_term_frame_idx.exceeded_by(pic.long_term_frame_idx)
            {
                pic.set_reference(Reference::None);
            }
        }

        self.max_long_term_frame_idx = max_long_term_frame_idx;
    }

    fn mmco_op_5(&mut self, pic: &mut PictureData) {
        debug!("MMCO op 5, marking all pictures in the DPB as unused for reference");
        trace!("Dpb state before MMCO=5: {:#?}", self);

        self.mark_all_as_unused_for_ref();
        self.max_long_term_frame_idx = MaxLongTermFrameIdx::NoLongTermFrameIndices;

        pic.has_mmco_5 = true;

        // The picture is inferred to have had frame_num equal to 0 and its POCs are made
        // relative to tempPicOrderCnt for all subsequent use.
        pic.frame_num = 0;

        match pic.field {
            Field::Top => {
                pic.top_field_order_cnt = 0;
                pic.pic_order_cnt = 0;
            }
            Field::Bottom => {
                pic.bottom_field_order_cnt = 0;
                pic.pic_order_cnt = 0;
            }
            Field::Frame => {
                pic.top_field_order_cnt = pic.top_field_order_cnt.wrapping_sub(pic.pic_order_cnt);
                pic.bottom_field_order_cnt =
                    pic.bottom_field_order_cnt.wrapping_sub(pic.pic_order_cnt);
                pic.pic_order_cnt =
                    std::cmp::min(pic.top_field_order_cnt, pic.bottom_field_order_cnt);
            }
        }
    }

    fn mmco_op_6(&mut self, pic: &mut PictureData, marking: &RefPicMarkingOp) {
        let long_term_frame_idx = marking.long_term_frame_idx;

        debug!("MMCO op 6, long_term_frame_idx: {}", long_term_frame_idx);
        trace!("Dpb state before MMCO=6: {:#?}", self);

        for (_, other) in self.store.stored_mut() {
            if matches!(other.reference(), Reference::LongTerm)
                && other.long_term_frame_idx == long_term_frame_idx
            {
                other.set_reference(Reference::None);
            }
        }

        pic.set_reference(Reference::LongTerm);
        pic.long_term_frame_idx = long_term_frame_idx;
    }

    fn handle_memory_management_ops(
        &mut self,
        pic: &mut PictureData,
        ops: &[RefPicMarkingOp],
    ) -> Result<(), MmcoError> {
        for marking in ops {
            match marking.memory_management_control_operation {
                1 => self.mmco_op_1(pic, marking)?,
                2 => self.mmco_op_2(pic, marking)?,
                3 => self.mmco_op_3(pic, marking)?,
                4 => self.mmco_op_4(marking),
                5 => self.mmco_op_5(pic),
                6 => self.mmco_op_6(pic, marking),
                other => return Err(MmcoError::UnknownOperation(other)),
            }
        }

        Ok(())
    }

    /// 8.2.5.1, for IDR pictures.
    fn idr_marking(
        &mut self,
        pic: &mut PictureData,
        header: &SliceParams,
        ready: &mut Vec<ReadyPicture>,
    ) {
        if header.no_output_of_prior_pics_flag {
            self.discard_pending();
        } else {
            ready.extend(self.drain());
        }

        self.mark_all_as_unused_for_ref();

        if header.long_term_reference_flag {
            pic.set_reference(Reference::LongTerm);
            pic.long_term_frame_idx = 0;
            self.max_long_term_frame_idx = MaxLongTermFrameIdx::Idx(0);
        } else {
            pic.set_reference(Reference::ShortTerm);
            self.max_long_term_frame_idx = MaxLongTermFrameIdx::NoLongTermFrameIndices;
        }
    }

    fn fill_prev_ref_info(&mut self, pic: &PictureData) {
        let prev = &mut self.prev_ref_pic_info;

        prev.has_mmco_5 = pic.has_mmco_5;
        prev.top_field_order_cnt = pic.top_field_order_cnt;
        prev.pic_order_cnt_msb = pic.pic_order_cnt_msb;
        prev.pic_order_cnt_lsb = pic.pic_order_cnt_lsb;
        prev.field = pic.field;
        prev.frame_num = pic.frame_num;
    }

    fn fill_prev_info(&mut self, pic: &PictureData) {
        let prev = &mut self.prev_pic_info;

        prev.frame_num = pic.frame_num;
        prev.has_mmco_5 = pic.has_mmco_5;
        prev.frame_num_offset = pic.frame_num_offset;
    }

    /// Marks the current picture, stores it and returns the pictures that are due for output.
    pub fn finish_picture(&mut self) -> Result<Vec<ReadyPicture>, DpbError> {
        let CurrentPicture {
            mut pic,
            slot,
            second_field,
            header,
        } = self.current.take().ok_or(DpbError::NoCurrentPicture)?;

        debug!(
            "Finishing picture in buffer {} (POC {})",
            slot, pic.pic_order_cnt
        );

        let mut ready = vec![];

        if pic.nal_ref_idc != 0 {
            // The second field of a reference field pair shares the marking of its first field.
            let first_field_reference = if second_field {
                self.store
                    .get(slot)
                    .filter(|first| first.is_ref())
                    .map(|first| (*first.reference(), first.long_term_frame_idx))
            } else {
                None
            };

            if let Some((reference, long_term_frame_idx)) = first_field_reference {
                pic.set_reference(reference);
                pic.long_term_frame_idx = long_term_frame_idx;
            }

            if header.adaptive_ref_pic_marking_mode_flag {
                if first_field_reference.is_none() {
                    pic.set_reference(Reference::ShortTerm);
                }

                self.handle_memory_management_ops(&mut pic, &header.ref_pic_marking)?;

                if pic.has_mmco_5 {
                    // C.4.5.3: all prior pictures are output.
                    ready.extend(self.drain());
                }
            } else if first_field_reference.is_none() {
                if matches!(pic.is_idr, IsIdr::Yes { .. }) {
                    self.idr_marking(&mut pic, &header, &mut ready);
                } else {
                    self.sliding_window_marking()?;
                    pic.set_reference(Reference::ShortTerm);
                }
            }

            self.fill_prev_ref_info(&pic);
        }

        self.fill_prev_info(&pic);

        let unpaired = !second_field && pic.field != Field::Frame;

        let stored = self
            .store
            .get_mut(slot)
            .ok_or(StoreError::IndexOutOfRange(slot))?;

        if second_field {
            let reference = *pic.reference();
            stored.merge_second_field(&pic);
            stored.set_reference(reference);
            stored.long_term_frame_idx = pic.long_term_frame_idx;
        } else {
            *stored = pic;
        }

        self.store.commit();

        if unpaired {
            self.last_field = Some(slot);
        }

        ready.extend(self.bump_as_needed());
        self.collect_unreferenced_colocated();
        self.store.release_unused();

        Ok(ready)
    }

    /// Number of pictures withheld for output that could be bumped.
    pub fn num_pending(&self) -> usize {
        self.store
            .stored()
            .filter(|(i, pic)| pic.needed_for_output() && Some(*i) != self.last_field)
            .count()
    }

    /// C.4.5.3: outputs the picture with the lowest POC.
    fn bump(&mut self) -> Option<ReadyPicture> {
        let last_field = self.last_field;

        let (index, pic) = self
            .store
            .stored_mut()
            .filter(|(i, pic)| pic.needed_for_output() && Some(*i) != last_field)
            .min_by_key(|(_, pic)| pic.pic_order_cnt)?;

        pic.set_output(Output::Displayed);

        debug!(
            "Bumping picture in buffer {} (POC {})",
            index, pic.pic_order_cnt
        );

        Some(ReadyPicture {
            buf_spec_num: index,
            pic_order_cnt: pic.pic_order_cnt,
            data_flag: pic.data_flag,
        })
    }

    /// Outputs pictures until fewer than `reorder_pic_num` are withheld.
    fn bump_as_needed(&mut self) -> Vec<ReadyPicture> {
        let reorder_pic_num = std::cmp::max(1, self.limits.reorder_pic_num);
        let mut pics = vec![];

        while self.num_pending() >= reorder_pic_num {
            match self.bump() {
                Some(pic) => pics.push(pic),
                None => break,
            }
        }

        pics
    }

    /// Outputs the withheld picture with the lowest POC, to make room when the store is full.
    pub fn bump_one(&mut self) -> Option<ReadyPicture> {
        self.bump()
    }

    /// Outputs all withheld pictures in POC order, including a field without its pair.
    pub fn drain(&mut self) -> Vec<ReadyPicture> {
        self.last_field = None;

        let mut pics = vec![];
        while let Some(pic) = self.bump() {
            pics.push(pic);
        }

        self.collect_unreferenced_colocated();
        self.store.release_unused();

        pics
    }

    /// Buffers holding a picture the consumer never got: the withheld ones and the one being
    /// decoded.
    pub fn undisplayed(&self) -> Vec<usize> {
        let in_decode = self.current.as_ref().map(|current| current.slot);
        let mut indices: Vec<usize> = self
            .store
            .stored()
            .filter(|(_, pic)| pic.needed_for_output())
            .map(|(index, _)| index)
            .chain(in_decode)
            .collect();

        indices.sort_unstable();
        indices.dedup();
        indices
    }

    /// Drops all withheld pictures without outputting them.
    fn discard_pending(&mut self) {
        self.last_field = None;

        for (index, pic) in self.store.stored_mut() {
            if pic.needed_for_output() {
                debug!("Discarding output of buffer {}", index);
                pic.set_output(Output::Done);
            }
        }

        self.store.release_unused();
    }

    /// Takes note that the consumer returned buffer `index`.
    pub fn buffer_returned(&mut self, index: usize) -> Result<(), DpbError> {
        if index >= self.store.capacity() {
            return Err(StoreError::IndexOutOfRange(index).into());
        }

        match self.store.get_mut(index) {
            Some(pic) if pic.output() == Output::Displayed => pic.set_output(Output::Done),
            _ => warn!("Buffer {} returned but was not displayed", index),
        }

        self.collect_unreferenced_colocated();
        self.store.release_unused();

        Ok(())
    }

    fn collect_unreferenced_colocated(&mut self) {
        for (_, pic) in self.store.stored_mut() {
            if pic.is_ref() {
                continue;
            }

            if let Some(index) = pic.colocated_buf_index.take() {
                self.freed_colocated.push(index);
            }
        }
    }

    /// Returns the colocated buffers released since the last call.
    pub fn take_freed_colocated(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.freed_colocated)
    }
}
