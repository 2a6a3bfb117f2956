#![no_main]

mod utils;

use libfuzzer_sys::fuzz_target;
use tether_config::{expand_str, ExpandError};
use utils::truncate_utf8;

// Expansion of arbitrary text must terminate without panicking, and text without `${` must come
// back unchanged.
fuzz_target!(|data: &[u8]| {
    let Some(text) = truncate_utf8(data) else {
        return;
    };

    let expanded = expand_str(text, &mut |ty, name| match ty {
        Some("env") => Ok(Some(name.to_ascii_uppercase())),
        Some("fail") => Err(ExpandError::Undefined {
            key: name.to_string(),
        }),
        _ => Ok(None),
    });

    if !text.contains("${") {
        assert_eq!(expanded.ok().as_deref(), Some(text));
    }
});
