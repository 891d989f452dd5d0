// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host side of the multi-instance H.264 firmware protocol.
//!
//! The firmware parses the bitstream and reconstructs pictures, but leaves the decoded picture
//! buffer to the host. After each interrupt it posts a status code in `DPB_STATUS_REG` and waits
//! for the host to answer with an action in the same register. [`H264Decoder::handle_status`]
//! consumes one status code: it reads the parameter dump, updates the [`Dpb`] and programs the
//! per-picture state (reference lists, canvases, colocated motion vector addresses) before
//! letting the firmware resume.

pub mod colocated;

use std::sync::Arc;

use enumn::N;
use log::debug;
use log::error;
use log::warn;

use crate::backend::regs;
use crate::backend::DmaBuffer;
use crate::backend::Hardware;
use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::dpb::DpbError;
use crate::codec::h264::dpb::ReadyPicture;
use crate::codec::h264::dpb::RefPicEntry;
use crate::codec::h264::dpb::RefPicLists;
use crate::codec::h264::geometry::SequenceInfo;
use crate::codec::h264::geometry::StreamGeometry;
use crate::codec::h264::geometry::COLOCATED_BYTES_PER_MB;
use crate::codec::h264::picture::Field;
use crate::codec::h264::picture::Output;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::picture::Reference;
use crate::codec::h264::rpm::ParamDump;
use crate::codec::h264::rpm::SliceParams;
use crate::codec::h264::rpm::RPM_BYTES;
use crate::decoder::h264::colocated::ColocatedBuffers;
use crate::decoder::DecodeError;
use crate::decoder::DecodeState;
use crate::decoder::FrameSink;
use crate::decoder::ReadyFrame;
use crate::decoder::Result;
use crate::decoder::StreamInfo;

/// Firmware workspace.
pub const SIZE_WORKSPACE: usize = 0x20_0000;
/// Slack the firmware reads past the DC/AC prediction buffers.
pub const DCAC_READ_MARGIN: u32 = 64 * 1024;
/// Address the firmware assumes for the start of its workspace.
pub const DEF_BUF_START_ADDR: u32 = 0x100_0000;
/// Local memory page receiving the parameter dump.
pub const SIZE_LMEM: usize = 4096;
pub const SIZE_AUX: usize = 16 * 1024;

/// Number of buffers whose canvases fit in the `ANC*_CANVAS_ADDR` registers.
pub const MAX_CANVAS_BUFFERS: usize = 24;

/// Picture data flags.
pub const I_FLAG: u32 = 0x1;
pub const IDR_FLAG: u32 = 0x2;

/// Reads of the colocated engine control register before giving up on its busy bit.
const CO_MB_POLL_LIMIT: usize = 100_000;

/// Status codes posted by the firmware.
#[derive(N, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    SliceHeadDone = 0x1,
    PicDataDone = 0x2,
    ConfigRequest = 0x11,
    DataRequest = 0x12,
    DecodeBufEmpty = 0x20,
    SearchBufEmpty = 0x22,
}

/// Actions written back by the host.
#[derive(N, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Action {
    SearchHead = 0xf0,
    DecodeSlice = 0xf1,
    ConfigDone = 0xf2,
    DecodeNewpic = 0xf3,
}

/// Register value of one reference list entry.
fn ref_cfg(entry: &RefPicEntry) -> u32 {
    let structure = match entry.field {
        Field::Top => 0x1,
        Field::Bottom => 0x2,
        Field::Frame => 0x3,
    };

    (entry.slot as u32 & 0x1f) | (structure << 5)
}

/// Packs a reference list four entries per word, first entry in the most significant byte. The
/// last word is padded with the last entry, and the list is padded to `min_words` words with
/// the last entry replicated.
fn pack_ref_list(list: &[RefPicEntry], min_words: usize) -> Vec<u32> {
    let mut words: Vec<u32> = list
        .chunks(4)
        .map(|chunk| {
            let last = chunk.last().map_or(0, ref_cfg);
            (0..4).fold(0, |word, i| (word << 8) | chunk.get(i).map_or(last, ref_cfg))
        })
        .collect();

    let last = list.last().map_or(0, ref_cfg);
    if words.len() < min_words {
        words.resize(min_words, last * 0x0101_0101);
    }

    words
}

/// The `info0` word of the frame data of `pic`.
fn frame_info0(pic: &PictureData) -> u32 {
    let mut info0 = if pic.mbaff {
        0xf4c0
    } else {
        match pic.field {
            Field::Top => 0xf400,
            Field::Bottom => 0xf440,
            Field::Frame => 0xf480,
        }
    };

    if pic.bottom_field_order_cnt < pic.top_field_order_cnt {
        info0 |= 0x100;
    }

    info0
}

/// One H.264 decode session on the firmware.
pub struct H264Decoder<H: Hardware, S: FrameSink> {
    hw: Arc<H>,
    sink: S,
    state: DecodeState,
    no_poc_reorder: bool,

    workspace: Option<DmaBuffer>,
    lmem: Option<DmaBuffer>,
    aux: Option<DmaBuffer>,
    colocated: ColocatedBuffers,

    dpb: Dpb,
    /// Masked `seq_info2` of the current configuration, 0 before the first one.
    seq_info2: u32,
    /// `info0`, `info1` and `info2` words of the frame data of each buffer.
    frame_info: Vec<[u32; 3]>,
}

impl<H: Hardware, S: FrameSink> H264Decoder<H, S> {
    /// Allocates the firmware regions and starts the firmware. With `no_poc_reorder`, pictures
    /// are output as soon as they are decoded.
    pub fn new(hw: Arc<H>, sink: S, no_poc_reorder: bool) -> Result<Self> {
        let mut decoder = Self {
            hw,
            sink,
            state: DecodeState::Idle,
            no_poc_reorder,
            workspace: None,
            lmem: None,
            aux: None,
            colocated: Default::default(),
            dpb: Default::default(),
            seq_info2: 0,
            frame_info: vec![],
        };

        // On failure, the regions already allocated are freed when `decoder` is dropped.
        decoder.workspace = Some(decoder.hw.dma_alloc(SIZE_WORKSPACE)?);
        decoder.lmem = Some(decoder.hw.dma_alloc(SIZE_LMEM)?);
        decoder.aux = Some(decoder.hw.dma_alloc(SIZE_AUX)?);
        decoder.start();

        Ok(decoder)
    }

    fn start(&self) {
        let hw = &*self.hw;
        let paddr = |buffer: &Option<DmaBuffer>| buffer.as_ref().map_or(0, DmaBuffer::paddr);

        hw.set_register_bits(regs::POWER_CTL_VLD, (1 << 9) | (1 << 6));
        hw.write_register(regs::MDEC_PIC_DC_THRESH, 0x4040_38aa);
        hw.write_register(regs::PSCALE_CTRL, 0);
        hw.write_register(regs::NAL_SEARCH_CTL, 0);
        hw.write_register(regs::AV_SCRATCH_0, 0);
        hw.write_register(
            regs::AV_SCRATCH_8,
            paddr(&self.workspace)
                .wrapping_sub(DEF_BUF_START_ADDR)
                .wrapping_add(DCAC_READ_MARGIN),
        );
        hw.write_register(regs::LMEM_DUMP_ADR, paddr(&self.lmem));
        hw.write_register(regs::H264_AUX_ADR, paddr(&self.aux));
        hw.write_register(regs::H264_AUX_DATA_SIZE, ((SIZE_AUX as u32) >> 4) << 16);
        // Multi-instance, frame based input.
        hw.write_register(regs::H264_DECODE_MODE, 1);
        hw.write_register(regs::INIT_FLAG_REG, 1);

        debug!(
            "Firmware started, workspace at {:#x}, dump page at {:#x}",
            paddr(&self.workspace),
            paddr(&self.lmem)
        );
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Hands `data` to the firmware and asks it to look for the next slice header.
    pub fn notify_input(&mut self, data: &[u8]) -> Result<()> {
        match self.state {
            DecodeState::Aborted => return Err(DecodeError::Aborted),
            DecodeState::Processing => return Err(DecodeError::NotIdle),
            DecodeState::Idle => (),
        }

        self.hw.queue_bitstream(data)?;
        self.state = DecodeState::Processing;

        let len = data.len() as u32;
        self.hw.write_register(regs::H264_DECODE_INFO, 1 << 13);
        self.hw.write_register(regs::H264_DECODE_SIZE, len);
        self.hw.write_register(regs::VIFF_BIT_CNT, len.wrapping_mul(8));
        self.hw
            .write_register(regs::DPB_STATUS_REG, Action::SearchHead as u32);

        Ok(())
    }

    /// Processes one status code posted by the firmware.
    ///
    /// Errors other than [`DecodeError::OutOfPictures`] leave the session in an inconsistent
    /// state, and the caller must [`abort`](Self::abort) it. `OutOfPictures` can be retried with
    /// the same status once output buffers have been returned.
    pub fn handle_status(&mut self, status: u32) -> Result<()> {
        if self.state == DecodeState::Aborted {
            return Err(DecodeError::Aborted);
        }

        let status = Status::n(status).ok_or(DecodeError::ProtocolViolation(status))?;
        debug!("Firmware status {:?}", status);

        match status {
            Status::ConfigRequest => self.config_request()?,
            Status::SliceHeadDone => self.slice_head_done()?,
            Status::PicDataDone => self.pic_data_done()?,
            Status::DataRequest | Status::DecodeBufEmpty | Status::SearchBufEmpty => {
                self.request_input()
            }
        }

        if self.hw.read_register(regs::WATCHDOG_ACK_REG) == 1 {
            self.hw.write_register(regs::WATCHDOG_ACK_REG, 0);
        }

        Ok(())
    }

    fn request_input(&mut self) {
        self.state = DecodeState::Idle;
        self.sink.input_needed();
    }

    fn load_rpm(&self) -> Result<ParamDump> {
        let lmem = self.lmem.as_ref().ok_or(DecodeError::Aborted)?;
        let mut raw = vec![0u8; RPM_BYTES];
        self.hw.dma_read(lmem, 0, &mut raw);

        Ok(ParamDump::from_lmem(&raw)?)
    }

    fn config_request(&mut self) -> Result<()> {
        let info = SequenceInfo {
            seq_info2: self.hw.read_register(regs::AV_SCRATCH_1),
            seq_info: self.hw.read_register(regs::AV_SCRATCH_2),
            crop: self.hw.read_register(regs::AV_SCRATCH_6),
            level_and_refs: self.hw.read_register(regs::AV_SCRATCH_B),
        };
        let rpm = self.load_rpm()?;

        let geometry = match info.geometry(&rpm.bitstream_restriction(), self.no_poc_reorder) {
            Some(geometry) => geometry,
            None => {
                warn!("Invalid stream dimensions, seq_info2 {:#x}", info.seq_info2);
                self.hw
                    .write_register(regs::AV_SCRATCH_0, self.dpb.limits().packed());
                return Ok(());
            }
        };

        if self.seq_info2 == 0 || self.seq_info2 != info.key() {
            self.reconfigure(&geometry)?;
            self.seq_info2 = info.key();
        }

        self.hw
            .write_register(regs::AV_SCRATCH_0, self.dpb.limits().packed());
        self.hw
            .write_register(regs::DPB_STATUS_REG, Action::ConfigDone as u32);

        Ok(())
    }

    fn reconfigure(&mut self, geometry: &StreamGeometry) -> Result<()> {
        let limits = geometry.limits;

        if geometry.max_num_ref_frames >= limits.active_buffer_spec_num {
            return Err(DecodeError::UnsupportedStreamGeometry);
        }

        debug!(
            "New stream geometry {}x{} ({}x{} MBs): {:?}",
            geometry.display.width,
            geometry.display.height,
            geometry.mb_width,
            geometry.mb_height,
            limits
        );

        for pic in self.dpb.configure(limits, geometry.max_num_ref_frames) {
            self.emit(pic);
        }

        self.frame_info = vec![[0; 3]; limits.active_buffer_spec_num];
        self.sink.format_changed(&StreamInfo {
            resolution: geometry.display,
            num_buffers: limits.active_buffer_spec_num,
        });

        let num_canvases = std::cmp::min(limits.active_buffer_spec_num, MAX_CANVAS_BUFFERS);
        for i in 0..num_canvases {
            self.hw.write_register(
                regs::ANC0_CANVAS_ADDR + 4 * i as u32,
                self.hw.canvas_for_buffer(i),
            );
        }

        self.colocated
            .configure(
                &*self.hw,
                geometry.colocated_buf_size as usize,
                limits.max_reference_size,
            )
            .map_err(DecodeError::ColocatedAllocationFailed)?;

        Ok(())
    }

    fn slice_head_done(&mut self) -> Result<()> {
        let rpm = self.load_rpm()?;
        let sps = rpm.sequence()?;
        let slice = rpm.slice()?;

        let new_picture = self.dpb.is_new_picture(&sps, &slice);
        if new_picture {
            if self.dpb.current().is_some() {
                warn!("New picture started before the previous one was done");
                self.finish_picture()?;
            }

            self.dpb.begin_picture(&sps, &slice)?;

            let mut data_flag = 0;
            if slice.slice_type.is_i() {
                data_flag |= I_FLAG;
            }
            if slice.is_idr() {
                data_flag |= IDR_FLAG;
            }

            let colocated = &mut self.colocated;
            if let Some(current) = self.dpb.current_mut() {
                current.pic.data_flag = data_flag;

                if !current.second_field && slice.nal_ref_idc != 0 {
                    current.pic.colocated_buf_index = colocated.alloc_index();
                    if current.pic.colocated_buf_index.is_none() {
                        warn!("No colocated buffer left for buffer {}", current.slot);
                    }
                }
            }
        } else {
            self.dpb.continue_picture(&slice);
        }

        let lists = self.dpb.ref_pic_lists(&sps, &slice)?;
        self.config_decode_buf(&slice, &lists)?;

        let action = if new_picture {
            Action::DecodeNewpic
        } else {
            Action::DecodeSlice
        };
        self.hw.write_register(regs::DPB_STATUS_REG, action as u32);

        Ok(())
    }

    /// Programs the registers describing the current picture, its references and its colocated
    /// buffers for the slice `slice`.
    fn config_decode_buf(&mut self, slice: &SliceParams, lists: &RefPicLists) -> Result<()> {
        let hw = &*self.hw;
        let current = self.dpb.current().ok_or(DpbError::NoCurrentPicture)?;
        let pic = &current.pic;
        let slot = current.slot;

        hw.write_register(regs::H264_CURRENT_POC_IDX_RESET, 0);
        hw.write_register(regs::H264_CURRENT_POC, pic.pic_order_cnt as u32);
        hw.write_register(regs::H264_CURRENT_POC, pic.top_field_order_cnt as u32);
        hw.write_register(regs::H264_CURRENT_POC, pic.bottom_field_order_cnt as u32);

        hw.write_register(regs::CURR_CANVAS_CTRL, (slot as u32) << 24);
        let canvas = hw.read_register(regs::CURR_CANVAS_CTRL) & 0xff_ffff;
        hw.write_register(regs::REC_CANVAS_ADDR, canvas);
        hw.write_register(regs::DBKR_CANVAS_ADDR, canvas);
        hw.write_register(regs::DBKW_CANVAS_ADDR, canvas);

        let info = self
            .frame_info
            .get_mut(slot)
            .ok_or(DecodeError::BufferIndexOutOfRange(slot))?;
        *info = [
            frame_info0(pic),
            pic.top_field_order_cnt as u32,
            pic.bottom_field_order_cnt as u32,
        ];

        hw.write_register(regs::H264_BUFFER_INFO_INDEX, 16);
        for j in 0..self.dpb.size() {
            let long_term_flag = self
                .dpb
                .store()
                .get(j)
                .filter(|p| matches!(p.reference(), Reference::LongTerm))
                .map_or(0, |p| {
                    u32::from(p.has_field(Field::Top)) | (u32::from(p.has_field(Field::Bottom)) << 1)
                });

            let info = self
                .frame_info
                .get_mut(j)
                .ok_or(DecodeError::BufferIndexOutOfRange(j))?;

            if long_term_flag > 0 {
                for (flag, bit) in [(0x1, 1 << 4), (0x2, 1 << 5)] {
                    if long_term_flag & flag != 0 {
                        info[0] |= bit;
                    } else {
                        info[0] &= !bit;
                    }
                }
            }

            let info0 = if j == slot { info[0] | 0xf } else { info[0] };
            hw.write_register(regs::H264_BUFFER_INFO_DATA, info0);
            hw.write_register(regs::H264_BUFFER_INFO_DATA, info[1]);
            hw.write_register(regs::H264_BUFFER_INFO_DATA, info[2]);
        }

        hw.write_register(regs::H264_BUFFER_INFO_INDEX, 0);
        for word in pack_ref_list(&lists.list0, 8) {
            hw.write_register(regs::H264_BUFFER_INFO_DATA, word);
        }

        hw.write_register(regs::H264_BUFFER_INFO_INDEX, 8);
        for word in pack_ref_list(&lists.list1, 0) {
            hw.write_register(regs::H264_BUFFER_INFO_DATA, word);
        }

        let mut polls = 0;
        while (hw.read_register(regs::H264_CO_MB_RW_CTL) >> 11) & 0x1 == 1 {
            polls += 1;
            if polls >= CO_MB_POLL_LIMIT {
                return Err(DecodeError::HardwareTimeout);
            }
            std::hint::spin_loop();
        }

        let direct_8x8 = slice.direct_8x8;
        let unit = if pic.field == Field::Frame && !pic.mbaff {
            1
        } else {
            2
        };
        let mut offset = unit * COLOCATED_BYTES_PER_MB;
        if direct_8x8 {
            offset >>= 2;
        }
        offset = offset.wrapping_mul(slice.first_mb_in_slice);

        let mut bounds = Ok(());

        match pic
            .colocated_buf_index
            .and_then(|index| self.colocated.address_for(index, direct_8x8))
        {
            Some(addr) => {
                bounds = self.colocated.check_bounds(addr);
                hw.write_register(regs::H264_CO_MB_WR_ADDR, addr.wrapping_add(offset));
            }
            None => hw.write_register(regs::H264_CO_MB_WR_ADDR, 0xffff_ffff),
        }

        if let Some(col) = lists.list1.first() {
            let col_pic = self
                .dpb
                .store()
                .get(col.slot)
                .ok_or(DecodeError::BufferIndexOutOfRange(col.slot))?;

            let l10_structure: u32 = if col_pic.mbaff {
                3
            } else if col_pic.coded_frame {
                2
            } else if col.field == Field::Bottom {
                1
            } else {
                0
            };

            let ref_type = if pic.field == Field::Frame || pic.mbaff {
                pic.pic_order_cnt.abs_diff(col_pic.top_field_order_cnt)
                    >= pic.pic_order_cnt.abs_diff(col_pic.bottom_field_order_cnt)
            } else {
                col.field == Field::Bottom
            };

            let index = col_pic
                .colocated_buf_index
                .ok_or(DecodeError::BufferIndexOutOfRange(col.slot))?;
            let addr = self
                .colocated
                .address_for(index, direct_8x8)
                .ok_or(DecodeError::BufferIndexOutOfRange(index))?;

            if bounds.is_ok() {
                bounds = self.colocated.check_bounds(addr);
            }

            hw.write_register(
                regs::H264_CO_MB_RD_ADDR,
                (addr.wrapping_add(offset) >> 3)
                    | (l10_structure << 30)
                    | (u32::from(ref_type) << 29),
            );
        }

        bounds
    }

    fn pic_data_done(&mut self) -> Result<()> {
        self.finish_picture()?;

        if self.hw.read_register(regs::VIFF_BIT_CNT) > 0 {
            self.hw
                .write_register(regs::DPB_STATUS_REG, Action::SearchHead as u32);
        } else {
            self.request_input();
        }

        Ok(())
    }

    fn finish_picture(&mut self) -> Result<()> {
        for pic in self.dpb.finish_picture()? {
            self.emit(pic);
        }
        self.release_colocated();

        Ok(())
    }

    fn release_colocated(&mut self) {
        for index in self.dpb.take_freed_colocated() {
            self.colocated.release_index(index);
        }
    }

    fn emit(&mut self, pic: ReadyPicture) {
        debug!(
            "Frame ready in buffer {} (POC {})",
            pic.buf_spec_num, pic.pic_order_cnt
        );

        self.sink.frame_ready(ReadyFrame {
            index: pic.buf_spec_num,
            pic_order_cnt: pic.pic_order_cnt,
            keyframe: pic.data_flag & (I_FLAG | IDR_FLAG) != 0,
        });
    }

    /// The consumer is done with output buffer `index`.
    pub fn buffer_returned(&mut self, index: usize) -> Result<()> {
        self.dpb.buffer_returned(index)?;
        self.release_colocated();

        Ok(())
    }

    /// Outputs the withheld picture with the lowest POC, if any. Returns whether a picture was
    /// output.
    pub fn bump_one(&mut self) -> bool {
        match self.dpb.bump_one() {
            Some(pic) => {
                self.emit(pic);
                true
            }
            None => false,
        }
    }

    /// Number of output buffers held by the consumer.
    pub fn outstanding_buffers(&self) -> usize {
        self.dpb
            .store()
            .stored()
            .filter(|(_, pic)| pic.output() == Output::Displayed)
            .count()
    }

    /// Outputs every withheld picture, in POC order.
    pub fn drain(&mut self) {
        for pic in self.dpb.drain() {
            self.emit(pic);
        }
        self.release_colocated();
    }

    /// Ends the session after a fatal error. Does nothing if it was already aborted.
    pub fn abort(&mut self, reason: &DecodeError) {
        if self.state == DecodeState::Aborted {
            return;
        }

        error!("Aborting H.264 session: {}", reason);

        self.drop_undisplayed();
        self.dpb.clear();
        self.release_dma();
        self.state = DecodeState::Aborted;
        self.sink.session_aborted();
    }

    /// Hands back the pictures not output yet, then halts the firmware and frees its regions.
    pub fn teardown(&mut self) {
        self.drop_undisplayed();
        self.dpb.clear();
        self.release_dma();
    }

    fn drop_undisplayed(&mut self) {
        for index in self.dpb.undisplayed() {
            warn!("Dropping undisplayed picture in buffer {}", index);
            self.sink.frame_dropped(index);
        }
    }

    fn release_dma(&mut self) {
        let hw = &*self.hw;

        // The firmware writes to the regions until halted.
        if self.workspace.is_some() {
            hw.halt();
        }

        for buffer in [self.workspace.take(), self.lmem.take(), self.aux.take()]
            .into_iter()
            .flatten()
        {
            hw.dma_free(buffer);
        }

        self.colocated.free(hw);
    }
}

impl<H: Hardware, S: FrameSink> Drop for H264Decoder<H, S> {
    fn drop(&mut self) {
        self.release_dma();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::fake_canvas;
    use crate::backend::dummy::FakeHardware;
    use crate::codec::h264::rpm;
    use crate::codec::h264::rpm::RpmBuilder;
    use crate::codec::h264::rpm::SliceType;
    use crate::Resolution;

    /// 1280x720: 80 macroblocks wide, 3600 in total.
    const SEQ_INFO2_720P: u32 = 80 | (3600 << 8);
    /// First DMA address handed out after the workspace, dump page and aux regions.
    const COLOCATED_BASE: u32 = 0x0120_5000;
    /// 80x48 aligned macroblocks of 96 bytes.
    const COLOCATED_BUF_SIZE: u32 = 80 * 48 * 96;

    #[derive(Default)]
    struct RecordingSink {
        formats: Vec<StreamInfo>,
        frames: Vec<ReadyFrame>,
        dropped: Vec<usize>,
        input_needed: usize,
        aborted: usize,
    }

    impl FrameSink for RecordingSink {
        fn format_changed(&mut self, info: &StreamInfo) {
            self.formats.push(info.clone());
        }

        fn frame_ready(&mut self, frame: ReadyFrame) {
            self.frames.push(frame);
        }

        fn frame_dropped(&mut self, index: usize) {
            self.dropped.push(index);
        }

        fn input_needed(&mut self) {
            self.input_needed += 1;
        }

        fn session_aborted(&mut self) {
            self.aborted += 1;
        }
    }

    type TestDecoder = H264Decoder<FakeHardware, RecordingSink>;

    fn new_decoder(no_poc_reorder: bool) -> (Arc<FakeHardware>, TestDecoder) {
        let _ = env_logger::try_init();
        let hw = Arc::new(FakeHardware::new());
        let decoder =
            H264Decoder::new(Arc::clone(&hw), RecordingSink::default(), no_poc_reorder).unwrap();
        (hw, decoder)
    }

    /// Writes `builder` to the dump page, as the firmware does before raising an interrupt.
    fn load(hw: &FakeHardware, builder: &RpmBuilder) {
        let lmem = hw.register(regs::LMEM_DUMP_ADR);
        hw.fill_region(lmem, &builder.to_lmem());
    }

    fn request_config(hw: &FakeHardware, decoder: &mut TestDecoder, seq_info2: u32, refs: u32) {
        hw.set_register(regs::AV_SCRATCH_1, seq_info2);
        // frame_mbs_only_flag, 4:2:0.
        hw.set_register(regs::AV_SCRATCH_2, (1 << 15) | (1 << 13));
        hw.set_register(regs::AV_SCRATCH_6, 0);
        hw.set_register(regs::AV_SCRATCH_B, 31 | (refs << 8));
        load(hw, &RpmBuilder::new());
        decoder.handle_status(Status::ConfigRequest as u32).unwrap();
    }

    fn configured(no_poc_reorder: bool) -> (Arc<FakeHardware>, TestDecoder) {
        let (hw, mut decoder) = new_decoder(no_poc_reorder);
        request_config(&hw, &mut decoder, SEQ_INFO2_720P, 4);
        decoder.notify_input(&[0; 64]).unwrap();
        (hw, decoder)
    }

    fn idr() -> RpmBuilder {
        let mut builder = RpmBuilder::new();
        builder
            .nal(5, 3)
            .set(rpm::SLICE_TYPE, SliceType::I as u16);
        builder
    }

    fn frame(slice_type: SliceType, frame_num: u16, poc_lsb: u16, nal_ref_idc: u8) -> RpmBuilder {
        let mut builder = RpmBuilder::new();
        builder
            .nal(1, nal_ref_idc)
            .set(rpm::SLICE_TYPE, slice_type as u16)
            .set(rpm::FRAME_NUM, frame_num)
            .set(rpm::PIC_ORDER_CNT_LSB, poc_lsb);
        builder
    }

    /// Decodes a whole single slice picture, leaving the firmware without remaining input.
    fn decode_picture(hw: &FakeHardware, decoder: &mut TestDecoder, builder: &RpmBuilder) {
        load(hw, builder);
        decoder
            .handle_status(Status::SliceHeadDone as u32)
            .unwrap();
        hw.set_register(regs::VIFF_BIT_CNT, 0);
        decoder.handle_status(Status::PicDataDone as u32).unwrap();
    }

    /// Data words written after `H264_BUFFER_INFO_INDEX` was last set to `index`.
    fn buffer_info(hw: &FakeHardware, index: u32) -> Vec<u32> {
        let writes = hw.state().writes.clone();
        let start = writes
            .iter()
            .rposition(|&w| w == (regs::H264_BUFFER_INFO_INDEX, index))
            .unwrap();

        writes[start + 1..]
            .iter()
            .take_while(|(reg, _)| *reg == regs::H264_BUFFER_INFO_DATA)
            .map(|(_, value)| *value)
            .collect()
    }

    fn last_write(hw: &FakeHardware, reg: u32) -> Option<u32> {
        hw.writes_to(reg).last().copied()
    }

    #[test]
    fn start_programs_firmware() {
        let (hw, decoder) = new_decoder(false);

        assert_eq!(hw.register(regs::POWER_CTL_VLD), (1 << 9) | (1 << 6));
        assert_eq!(hw.register(regs::MDEC_PIC_DC_THRESH), 0x4040_38aa);
        assert_eq!(hw.register(regs::AV_SCRATCH_8), 0x1_0000);
        assert_eq!(hw.register(regs::LMEM_DUMP_ADR), 0x0120_0000);
        assert_eq!(hw.register(regs::H264_AUX_ADR), 0x0120_1000);
        assert_eq!(hw.register(regs::H264_AUX_DATA_SIZE), 0x400 << 16);
        assert_eq!(hw.register(regs::H264_DECODE_MODE), 1);
        assert_eq!(hw.register(regs::INIT_FLAG_REG), 1);
        assert_eq!(hw.state().allocs, 3);
        assert_eq!(decoder.state(), DecodeState::Idle);
    }

    #[test]
    fn failed_start_frees_allocated_regions() {
        let _ = env_logger::try_init();
        let hw = Arc::new(FakeHardware::new());
        hw.state().fail_alloc_after = Some(2);

        let result = H264Decoder::new(Arc::clone(&hw), RecordingSink::default(), false);

        assert!(matches!(
            result,
            Err(DecodeError::Dma(crate::backend::DmaError::OutOfMemory(SIZE_AUX)))
        ));
        assert_eq!(hw.state().frees, 2);
        assert_eq!(hw.live_regions(), 0);
    }

    #[test]
    fn input_is_queued_once_idle() {
        let (hw, mut decoder) = new_decoder(false);

        decoder.notify_input(&[0xaa; 100]).unwrap();
        assert_eq!(decoder.state(), DecodeState::Processing);
        assert_eq!(hw.state().bitstream.len(), 100);
        assert_eq!(hw.register(regs::H264_DECODE_INFO), 1 << 13);
        assert_eq!(hw.register(regs::H264_DECODE_SIZE), 100);
        assert_eq!(hw.register(regs::VIFF_BIT_CNT), 800);
        assert_eq!(
            hw.register(regs::DPB_STATUS_REG),
            Action::SearchHead as u32
        );

        assert!(matches!(
            decoder.notify_input(&[0xbb; 10]),
            Err(DecodeError::NotIdle)
        ));
        assert_eq!(hw.state().bitstream.len(), 100);

        decoder
            .handle_status(Status::SearchBufEmpty as u32)
            .unwrap();
        assert_eq!(decoder.state(), DecodeState::Idle);
        assert_eq!(decoder.sink().input_needed, 1);
        decoder.notify_input(&[0xbb; 10]).unwrap();
    }

    #[test]
    fn config_request_sets_up_buffers() {
        let (hw, mut decoder) = new_decoder(false);
        request_config(&hw, &mut decoder, SEQ_INFO2_720P, 4);

        // 21 buffers and 18 references for level 3.1 at 720p.
        assert_eq!(hw.register(regs::AV_SCRATCH_0), 0x1215_1500);
        assert_eq!(
            hw.register(regs::DPB_STATUS_REG),
            Action::ConfigDone as u32
        );
        assert_eq!(
            decoder.sink().formats,
            vec![StreamInfo {
                resolution: Resolution {
                    width: 1280,
                    height: 720
                },
                num_buffers: 21,
            }]
        );
        assert_eq!(hw.register(regs::ANC0_CANVAS_ADDR), fake_canvas(0));
        assert_eq!(
            hw.register(regs::ANC0_CANVAS_ADDR + 4 * 20),
            fake_canvas(20)
        );
        assert_eq!(hw.writes_to(regs::ANC0_CANVAS_ADDR + 4 * 21), vec![]);
        assert_eq!(hw.state().allocs, 4);

        // Same geometry, with the long-term flag toggled.
        hw.clear_writes();
        request_config(&hw, &mut decoder, SEQ_INFO2_720P | 0x8000_0000, 4);
        assert_eq!(decoder.sink().formats.len(), 1);
        assert_eq!(hw.state().allocs, 4);
        assert_eq!(hw.writes_to(regs::ANC0_CANVAS_ADDR), vec![]);
        assert_eq!(
            hw.writes_to(regs::DPB_STATUS_REG),
            vec![Action::ConfigDone as u32]
        );

        // 1920x1080 at the same level needs a new colocated region.
        request_config(&hw, &mut decoder, 120 | (8160 << 8), 4);
        assert_eq!(decoder.sink().formats.len(), 2);
        assert_eq!(
            decoder.sink().formats[1].resolution,
            Resolution {
                width: 1920,
                height: 1080
            }
        );
        assert_eq!(hw.state().allocs, 5);
        assert_eq!(hw.state().frees, 1);
    }

    #[test]
    fn invalid_dimensions_are_not_acknowledged() {
        let (hw, mut decoder) = new_decoder(false);
        hw.clear_writes();

        request_config(&hw, &mut decoder, 0, 4);

        assert_eq!(hw.writes_to(regs::AV_SCRATCH_0), vec![0]);
        assert_eq!(hw.writes_to(regs::DPB_STATUS_REG), vec![]);
        assert!(decoder.sink().formats.is_empty());
    }

    #[test]
    fn too_many_references_is_unsupported() {
        let (hw, mut decoder) = new_decoder(false);
        hw.set_register(regs::AV_SCRATCH_1, SEQ_INFO2_720P);
        hw.set_register(regs::AV_SCRATCH_2, 1 << 15);
        hw.set_register(regs::AV_SCRATCH_B, 31 | (30 << 8));
        load(&hw, &RpmBuilder::new());

        let err = decoder
            .handle_status(Status::ConfigRequest as u32)
            .unwrap_err();

        assert!(matches!(err, DecodeError::UnsupportedStreamGeometry));
        assert!(err.is_fatal());
        assert!(decoder.sink().formats.is_empty());
    }

    #[test]
    fn continuation_slice_reuses_picture() {
        let (hw, mut decoder) = configured(false);

        load(&hw, &idr());
        decoder
            .handle_status(Status::SliceHeadDone as u32)
            .unwrap();
        assert_eq!(
            hw.register(regs::DPB_STATUS_REG),
            Action::DecodeNewpic as u32
        );
        assert_eq!(hw.register(regs::H264_CO_MB_WR_ADDR), COLOCATED_BASE);
        assert_eq!(hw.register(regs::REC_CANVAS_ADDR), fake_canvas(0));

        let mut second_slice = idr();
        second_slice.set(rpm::FIRST_MB_IN_SLICE, 100);
        load(&hw, &second_slice);
        decoder
            .handle_status(Status::SliceHeadDone as u32)
            .unwrap();
        assert_eq!(
            hw.register(regs::DPB_STATUS_REG),
            Action::DecodeSlice as u32
        );
        assert_eq!(hw.writes_to(regs::CURR_CANVAS_CTRL), vec![0, 0]);
        assert_eq!(decoder.dpb.store().num_free(), 20);
        assert_eq!(
            hw.register(regs::H264_CO_MB_WR_ADDR),
            COLOCATED_BASE + 100 * 96
        );

        // More slices are left in the input.
        decoder.handle_status(Status::PicDataDone as u32).unwrap();
        assert_eq!(
            hw.register(regs::DPB_STATUS_REG),
            Action::SearchHead as u32
        );
        assert_eq!(decoder.state(), DecodeState::Processing);

        decoder.drain();
        assert_eq!(
            decoder.sink().frames,
            vec![ReadyFrame {
                index: 0,
                pic_order_cnt: 0,
                keyframe: true
            }]
        );
    }

    #[test]
    fn picture_done_requests_input() {
        let (hw, mut decoder) = configured(false);

        decode_picture(&hw, &mut decoder, &idr());

        assert_eq!(decoder.state(), DecodeState::Idle);
        assert_eq!(decoder.sink().input_needed, 1);
        assert_eq!(decoder.dpb.num_ref_frames(), 1);
    }

    #[test]
    fn reference_lists_are_programmed() {
        let (hw, mut decoder) = configured(false);

        decode_picture(&hw, &mut decoder, &idr());
        decoder.notify_input(&[0; 64]).unwrap();
        load(&hw, &frame(SliceType::P, 1, 8, 1));
        decoder
            .handle_status(Status::SliceHeadDone as u32)
            .unwrap();

        // The P frame lands in buffer 1 and refers to the IDR frame in buffer 0.
        assert_eq!(hw.register(regs::REC_CANVAS_ADDR), fake_canvas(1));
        assert_eq!(buffer_info(&hw, 0), vec![0x6060_6060; 8]);
        assert_eq!(buffer_info(&hw, 8), vec![]);

        let info = buffer_info(&hw, 16);
        assert_eq!(info.len(), 21 * 3);
        assert_eq!(info[0..3], [0xf480, 0, 0]);
        assert_eq!(info[3..6], [0xf480 | 0xf, 8, 8]);
        assert_eq!(
            hw.writes_to(regs::H264_CURRENT_POC)[3..],
            [8, 8, 8]
        );
        assert_eq!(
            hw.register(regs::H264_CO_MB_WR_ADDR),
            COLOCATED_BASE + COLOCATED_BUF_SIZE
        );
    }

    #[test]
    fn b_slice_reads_colocated_reference() {
        let (hw, mut decoder) = configured(false);

        decode_picture(&hw, &mut decoder, &idr());
        decode_picture(&hw, &mut decoder, &frame(SliceType::P, 1, 8, 1));
        load(&hw, &frame(SliceType::B, 2, 4, 0));
        decoder
            .handle_status(Status::SliceHeadDone as u32)
            .unwrap();

        assert_eq!(buffer_info(&hw, 0), vec![0x6060_6060; 8]);
        assert_eq!(buffer_info(&hw, 8), vec![0x6161_6161]);
        // Non-reference pictures do not write motion vectors.
        assert_eq!(hw.register(regs::H264_CO_MB_WR_ADDR), 0xffff_ffff);
        // The P frame is a coded frame, and is as close to POC 4 from both of its fields.
        assert_eq!(
            hw.register(regs::H264_CO_MB_RD_ADDR),
            ((COLOCATED_BASE + COLOCATED_BUF_SIZE) >> 3) | (2 << 30) | (1 << 29)
        );
    }

    #[test]
    fn field_pair_shares_buffer() {
        let (hw, mut decoder) = configured(false);

        let mut top = idr();
        top.set(rpm::SPS_FLAGS, 0).set(rpm::PICTURE_STRUCTURE, 1);
        decode_picture(&hw, &mut decoder, &top);
        assert_eq!(buffer_info(&hw, 16)[0], 0xf400 | 0xf);

        let mut bottom = idr();
        bottom
            .set(rpm::SPS_FLAGS, 0)
            .set(rpm::PICTURE_STRUCTURE, 2)
            .set(rpm::FIRST_MB_IN_SLICE, 10);
        load(&hw, &bottom);
        decoder
            .handle_status(Status::SliceHeadDone as u32)
            .unwrap();

        assert_eq!(hw.writes_to(regs::CURR_CANVAS_CTRL), vec![0, 0]);
        assert_eq!(buffer_info(&hw, 16)[0], 0xf440 | 0xf);
        // Field macroblocks take twice the space of frame ones.
        assert_eq!(
            hw.register(regs::H264_CO_MB_WR_ADDR),
            COLOCATED_BASE + 10 * 192
        );
    }

    #[test]
    fn mbaff_reference_is_read_as_mbaff() {
        let (hw, mut decoder) = configured(false);

        let mut mbaff_idr = idr();
        mbaff_idr.set(rpm::SPS_FLAGS, 0x2).set(rpm::MBAFF_FRAME, 1);
        decode_picture(&hw, &mut decoder, &mbaff_idr);

        let mut b = frame(SliceType::B, 1, 4, 0);
        b.set(rpm::SPS_FLAGS, 0x2)
            .set(rpm::MBAFF_FRAME, 1)
            .set(rpm::FIRST_MB_IN_SLICE, 5);
        load(&hw, &b);
        decoder
            .handle_status(Status::SliceHeadDone as u32)
            .unwrap();

        assert_eq!(hw.register(regs::H264_CO_MB_WR_ADDR), 0xffff_ffff);
        // MBAFF macroblock pairs take twice the space of frame macroblocks.
        assert_eq!(
            hw.register(regs::H264_CO_MB_RD_ADDR),
            ((COLOCATED_BASE + 5 * 192) >> 3) | (3 << 30) | (1 << 29)
        );
    }

    #[test]
    fn field_reference_parity_selects_colocated_field() {
        let (hw, mut decoder) = configured(false);

        let mut top = idr();
        top.set(rpm::SPS_FLAGS, 0).set(rpm::PICTURE_STRUCTURE, 1);
        decode_picture(&hw, &mut decoder, &top);
        let mut bottom = frame(SliceType::I, 0, 0, 3);
        bottom.set(rpm::SPS_FLAGS, 0).set(rpm::PICTURE_STRUCTURE, 2);
        decode_picture(&hw, &mut decoder, &bottom);

        // With a single reference pair, RefPicList1 is RefPicList0 with its first two fields
        // switched, so its head is the field of opposite parity.
        let mut b_top = frame(SliceType::B, 1, 4, 0);
        b_top.set(rpm::SPS_FLAGS, 0).set(rpm::PICTURE_STRUCTURE, 1);
        decode_picture(&hw, &mut decoder, &b_top);

        assert_eq!(
            last_write(&hw, regs::H264_CO_MB_WR_ADDR),
            Some(0xffff_ffff)
        );
        assert_eq!(
            last_write(&hw, regs::H264_CO_MB_RD_ADDR),
            Some((COLOCATED_BASE >> 3) | (1 << 30) | (1 << 29))
        );

        let mut b_bottom = frame(SliceType::B, 1, 4, 0);
        b_bottom
            .set(rpm::SPS_FLAGS, 0)
            .set(rpm::PICTURE_STRUCTURE, 2)
            .set(rpm::FIRST_MB_IN_SLICE, 3);
        load(&hw, &b_bottom);
        decoder
            .handle_status(Status::SliceHeadDone as u32)
            .unwrap();

        assert_eq!(hw.writes_to(regs::CURR_CANVAS_CTRL), vec![0, 0, 1 << 24, 1 << 24]);
        assert_eq!(hw.register(regs::H264_CO_MB_WR_ADDR), 0xffff_ffff);
        assert_eq!(
            hw.register(regs::H264_CO_MB_RD_ADDR),
            (COLOCATED_BASE + 3 * 192) >> 3
        );
    }

    #[test]
    fn direct_8x8_addresses_quarter_buffers() {
        let (hw, mut decoder) = configured(false);
        decode_picture(&hw, &mut decoder, &idr());

        let mut p = frame(SliceType::P, 1, 8, 1);
        p.set(rpm::MODE_8X8_FLAGS, 0x6)
            .set(rpm::FIRST_MB_IN_SLICE, 10);
        decode_picture(&hw, &mut decoder, &p);

        // Second colocated buffer, a quarter of the way in, then 24 bytes per macroblock.
        let p_colocated = COLOCATED_BASE + COLOCATED_BUF_SIZE / 4;
        assert_eq!(
            last_write(&hw, regs::H264_CO_MB_WR_ADDR),
            Some(p_colocated + 10 * 24)
        );

        let mut b = frame(SliceType::B, 2, 4, 0);
        b.set(rpm::MODE_8X8_FLAGS, 0x6)
            .set(rpm::FIRST_MB_IN_SLICE, 10);
        load(&hw, &b);
        decoder
            .handle_status(Status::SliceHeadDone as u32)
            .unwrap();

        assert_eq!(hw.register(regs::H264_CO_MB_WR_ADDR), 0xffff_ffff);
        assert_eq!(
            hw.register(regs::H264_CO_MB_RD_ADDR),
            ((p_colocated + 10 * 24) >> 3) | (2 << 30) | (1 << 29)
        );
    }

    #[test]
    fn abort_hands_back_undisplayed_pictures() {
        let (hw, mut decoder) = configured(false);

        // The IDR frame is withheld for reordering and the P frame is still being decoded.
        decode_picture(&hw, &mut decoder, &idr());
        decoder.notify_input(&[0; 64]).unwrap();
        load(&hw, &frame(SliceType::P, 1, 8, 1));
        decoder
            .handle_status(Status::SliceHeadDone as u32)
            .unwrap();

        decoder.abort(&DecodeError::HardwareTimeout);
        assert!(decoder.sink().frames.is_empty());
        assert_eq!(decoder.sink().dropped, vec![0, 1]);
        assert_eq!(decoder.sink().aborted, 1);
        assert_eq!(hw.state().halts, 1);
        assert_eq!(hw.state().freed_while_running, 0);
        assert_eq!(hw.live_regions(), 0);

        decoder.teardown();
        assert_eq!(decoder.sink().dropped, vec![0, 1]);
    }

    #[test]
    fn teardown_hands_back_withheld_pictures() {
        let (hw, mut decoder) = configured(false);

        decode_picture(&hw, &mut decoder, &idr());
        decode_picture(&hw, &mut decoder, &frame(SliceType::P, 1, 8, 1));

        decoder.teardown();
        assert!(decoder.sink().frames.is_empty());
        assert_eq!(decoder.sink().dropped, vec![0, 1]);
        assert_eq!(decoder.sink().aborted, 0);
        assert_eq!(hw.state().freed_while_running, 0);
        assert_eq!(hw.live_regions(), 0);
    }

    #[test]
    fn full_store_waits_for_returned_buffers() {
        let (hw, mut decoder) = configured(true);

        for n in 0..21 {
            decode_picture(&hw, &mut decoder, &frame(SliceType::P, 0, 2 * n, 0));
        }
        assert_eq!(decoder.sink().frames.len(), 21);
        assert_eq!(decoder.outstanding_buffers(), 21);

        load(&hw, &frame(SliceType::P, 0, 42, 0));
        let err = decoder
            .handle_status(Status::SliceHeadDone as u32)
            .unwrap_err();
        assert!(matches!(err, DecodeError::OutOfPictures));
        assert!(!err.is_fatal());
        assert!(!decoder.bump_one());

        decoder.buffer_returned(3).unwrap();
        assert_eq!(decoder.outstanding_buffers(), 20);
        decoder
            .handle_status(Status::SliceHeadDone as u32)
            .unwrap();
        assert_eq!(last_write(&hw, regs::CURR_CANVAS_CTRL), Some(3 << 24));
    }

    #[test]
    fn returned_index_out_of_range() {
        let (_hw, mut decoder) = configured(false);

        assert!(matches!(
            decoder.buffer_returned(21),
            Err(DecodeError::BufferIndexOutOfRange(21))
        ));
    }

    #[test]
    fn unknown_status_aborts_once() {
        let (hw, mut decoder) = configured(false);
        decode_picture(&hw, &mut decoder, &idr());

        let err = decoder.handle_status(0x99).unwrap_err();
        assert!(matches!(err, DecodeError::ProtocolViolation(0x99)));

        decoder.abort(&err);
        decoder.abort(&err);
        assert_eq!(decoder.state(), DecodeState::Aborted);
        assert_eq!(decoder.sink().aborted, 1);
        assert_eq!(hw.state().frees, 4);
        assert_eq!(hw.live_regions(), 0);

        assert!(matches!(
            decoder.handle_status(Status::PicDataDone as u32),
            Err(DecodeError::Aborted)
        ));
        assert!(matches!(
            decoder.notify_input(&[0; 4]),
            Err(DecodeError::Aborted)
        ));

        decoder.teardown();
        drop(decoder);
        assert_eq!(hw.state().frees, 4);
    }

    #[test]
    fn busy_colocated_engine_times_out() {
        let (hw, mut decoder) = configured(false);
        hw.state().co_mb_busy = true;

        load(&hw, &idr());
        assert!(matches!(
            decoder.handle_status(Status::SliceHeadDone as u32),
            Err(DecodeError::HardwareTimeout)
        ));
    }

    #[test]
    fn watchdog_is_acknowledged() {
        let (hw, mut decoder) = configured(false);
        hw.set_register(regs::WATCHDOG_ACK_REG, 1);

        decoder
            .handle_status(Status::DataRequest as u32)
            .unwrap();

        assert_eq!(hw.register(regs::WATCHDOG_ACK_REG), 0);
    }

    #[test]
    fn ref_list_packing() {
        let entry = |slot, field| RefPicEntry { slot, field };

        assert_eq!(pack_ref_list(&[], 8), vec![0; 8]);

        let list = [
            entry(0, Field::Frame),
            entry(1, Field::Frame),
            entry(2, Field::Top),
        ];
        let mut expected = vec![0x6061_2222];
        expected.resize(8, 0x2222_2222);
        assert_eq!(pack_ref_list(&list, 8), expected);

        let list = [
            entry(4, Field::Bottom),
            entry(5, Field::Top),
            entry(6, Field::Frame),
            entry(7, Field::Frame),
            entry(8, Field::Bottom),
        ];
        assert_eq!(pack_ref_list(&list, 0), vec![0x4425_6667, 0x4848_4848]);
    }
}
