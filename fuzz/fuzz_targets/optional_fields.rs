#![no_main]

use eeruntime::runtime::eetype::{get_inline_field, OptionalFieldTag};
use libfuzzer_sys::fuzz_target;
use strum::IntoEnumIterator;

fuzz_target!(|data: &[u8]| {
    for tag in OptionalFieldTag::iter() {
        let _ = get_inline_field(Some(data), tag, 0);
    }
});
