// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Byte offsets of the DOS registers used by the H.264 firmware.

pub const ASSIST_MBOX1_CLR_REG: u32 = 0x01d4;

pub const AV_SCRATCH_0: u32 = 0x09c0;
pub const AV_SCRATCH_1: u32 = 0x09c4;
pub const AV_SCRATCH_2: u32 = 0x09c8;
pub const AV_SCRATCH_4: u32 = 0x09d0;
pub const AV_SCRATCH_6: u32 = 0x09d8;
pub const AV_SCRATCH_8: u32 = 0x09e0;
pub const AV_SCRATCH_9: u32 = 0x09e4;
pub const AV_SCRATCH_B: u32 = 0x09ec;
pub const AV_SCRATCH_C: u32 = 0x09f0;
pub const AV_SCRATCH_E: u32 = 0x09f8;
pub const AV_SCRATCH_G: u32 = 0x0a00;
pub const AV_SCRATCH_H: u32 = 0x0a04;
pub const AV_SCRATCH_J: u32 = 0x0a0c;
pub const AV_SCRATCH_L: u32 = 0x0a14;

pub const PSCALE_CTRL: u32 = 0x2444;
pub const CURR_CANVAS_CTRL: u32 = 0x2600;
pub const REC_CANVAS_ADDR: u32 = 0x2604;
pub const DBKR_CANVAS_ADDR: u32 = 0x2608;
pub const DBKW_CANVAS_ADDR: u32 = 0x260c;
pub const ANC0_CANVAS_ADDR: u32 = 0x2640;
pub const MDEC_PIC_DC_THRESH: u32 = 0x26e0;

pub const LAST_SLICE_MV_ADDR: u32 = 0x2c30;
pub const LAST_MVY: u32 = 0x2c38;
pub const PMV2_X: u32 = 0x2c5c;
pub const PMV3_X: u32 = 0x2c64;

pub const POWER_CTL_VLD: u32 = 0x3020;
pub const M4_CONTROL_REG: u32 = 0x30a4;
pub const VLD_C38: u32 = 0x3160;
pub const VLD_C39: u32 = 0x3164;
pub const VLD_C3D: u32 = 0x3174;
pub const VIFF_BIT_CNT: u32 = 0x3218;

/// Firmware aliases of the scratch registers.
pub const INIT_FLAG_REG: u32 = AV_SCRATCH_2;
pub const NAL_SEARCH_CTL: u32 = AV_SCRATCH_9;
pub const LMEM_DUMP_ADR: u32 = AV_SCRATCH_L;
pub const H264_DECODE_SIZE: u32 = AV_SCRATCH_E;
pub const H264_DECODE_MODE: u32 = AV_SCRATCH_4;
pub const H264_AUX_ADR: u32 = AV_SCRATCH_C;
pub const H264_AUX_DATA_SIZE: u32 = AV_SCRATCH_H;
pub const DPB_STATUS_REG: u32 = AV_SCRATCH_J;
/// Written with 1 by the firmware watchdog, cleared by the host after each interrupt.
pub const WATCHDOG_ACK_REG: u32 = AV_SCRATCH_G;

pub const H264_DECODE_INFO: u32 = M4_CONTROL_REG;
pub const H264_BUFFER_INFO_INDEX: u32 = PMV3_X;
pub const H264_BUFFER_INFO_DATA: u32 = PMV2_X;
pub const H264_CURRENT_POC_IDX_RESET: u32 = LAST_SLICE_MV_ADDR;
pub const H264_CURRENT_POC: u32 = LAST_MVY;
pub const H264_CO_MB_WR_ADDR: u32 = VLD_C38;
pub const H264_CO_MB_RD_ADDR: u32 = VLD_C39;
pub const H264_CO_MB_RW_CTL: u32 = VLD_C3D;
