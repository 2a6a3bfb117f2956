#![no_main]

mod utils;

use libfuzzer_sys::fuzz_target;
use tether_launch::rpc::parse_request;
use tether_launch::parse_uri;
use utils::truncate_utf8;

// Untrusted gateway documents and launch URIs are either rejected or produce a request that has
// a `type`, a `request` and a `name`.
fuzz_target!(|data: &[u8]| {
    let Some(text) = truncate_utf8(data) else {
        return;
    };

    if let Ok(request) = parse_request(text) {
        assert!(request.get("type").is_some());
        assert!(request.get("request").is_some());
        assert!(request.get("name").is_some());
    }

    let _ = parse_uri(&format!("tether://handler/launch/config?{text}"));
    let _ = parse_uri(&format!("tether://handler/launch/command?{text}"));
    let _ = parse_uri(&format!("tether://handler/launch?{text}"));
});
