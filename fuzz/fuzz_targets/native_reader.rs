#![no_main]

use eeruntime::image::NativeReader;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let reader = NativeReader::new(data);
    let mut offset = 0;
    while offset < reader.size() {
        match reader.decode_string(offset) {
            Ok((next, _)) if next > offset => offset = next,
            _ => break,
        }
    }
    let _ = reader.decode_unsigned(0);
});
