#![no_main]

use amvdec::codec::h264::rpm::ParamDump;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(rpm) = ParamDump::from_lmem(data) {
        let _ = rpm.bitstream_restriction();
        let _ = rpm.sequence();
        let _ = rpm.slice();
    }
});
