//! Fuzz target: `protocol::validate_response` / `decode_read_response`
//!
//! Drives arbitrary byte sequences through the register-protocol frame
//! validator and decoder, asserting that malformed input is always reported
//! as such rather than panicking or producing a decode beyond what the
//! frame actually carries.
//!
//! cargo fuzz run fuzz_frame_decoder

#![no_main]

use ecowatt::protocol::{decode_read_response, validate_response, ValidationOutcome};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    match validate_response(data) {
        ValidationOutcome::Ok => {
            // Only reached for a well-formed, CRC-correct frame; decoding
            // against an arbitrary number of requested registers must still
            // never read past the frame's declared byte count.
            let requested: Vec<u16> = (0..16u16).collect();
            let decoded = decode_read_response(data, &requested);
            assert!(decoded.len() <= requested.len());
        }
        ValidationOutcome::CrcError
        | ValidationOutcome::Truncated
        | ValidationOutcome::Malformed
        | ValidationOutcome::Exception(_) => {}
    }
});
