#![no_main]

//! Runs one picture per parameter dump through the DPB, returning every output buffer right away.

use amvdec::codec::h264::dpb::Dpb;
use amvdec::codec::h264::geometry::DpbLimits;
use amvdec::codec::h264::rpm::ParamDump;
use amvdec::codec::h264::rpm::RPM_BYTES;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut dpb = Dpb::default();
    dpb.configure(
        DpbLimits {
            reorder_pic_num: 4,
            active_buffer_spec_num: 9,
            max_reference_size: 7,
        },
        4,
    );

    for chunk in data.chunks_exact(RPM_BYTES) {
        let Ok(rpm) = ParamDump::from_lmem(chunk) else {
            return;
        };
        let (Ok(sps), Ok(slice)) = (rpm.sequence(), rpm.slice()) else {
            continue;
        };

        if !dpb.is_new_picture(&sps, &slice) {
            dpb.continue_picture(&slice);
        } else if dpb.begin_picture(&sps, &slice).is_err() {
            dpb.clear();
            continue;
        }

        let _ = dpb.ref_pic_lists(&sps, &slice);

        match dpb.finish_picture() {
            Ok(pics) => {
                for pic in pics {
                    let _ = dpb.buffer_returned(pic.buf_spec_num);
                }
            }
            Err(_) => dpb.clear(),
        }
        dpb.take_freed_colocated();
    }

    for pic in dpb.drain() {
        let _ = dpb.buffer_returned(pic.buf_spec_num);
    }
});
