#![no_main]

use libfuzzer_sys::fuzz_target;
use sockprobe::decode::SockAddr;

fuzz_target!(|data: &[u8]| {
    // Tracee memory is untrusted; decoding and rendering must never panic
    if let Some(addr) = SockAddr::decode(data) {
        let text = addr.to_string();
        assert!(text.starts_with('<') && text.ends_with('>'));
    }
});
