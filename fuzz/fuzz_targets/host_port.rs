#![no_main]

use lancet_runner::template::{canonical_header_key, clean_control_chars, derive_host_port, HostPort};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(url) = std::str::from_utf8(data) {
        if url.len() > 10_000 {
            return;
        }

        if let HostPort::Parsed { authority, .. } = derive_host_port(url) {
            assert!(!authority.contains('@'));
        }

        let cleaned = clean_control_chars(url);
        assert!(!cleaned.chars().any(|c| c.is_control()));

        let key = canonical_header_key(url);
        assert_eq!(key.len(), url.len());
    }
});
