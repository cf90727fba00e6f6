#![no_main]

use libfuzzer_sys::fuzz_target;
use sqlrelay_worker::codec::{Inbound, decode_command, encode_command};

// Any frame either fails to decode or yields something the encoder can
// write back out in the same codec.
fuzz_target!(|data: &[u8]| {
    if let Ok(decoded) = decode_command(data) {
        if let Inbound::Envelope(envelope) = decoded.inbound {
            let _ = encode_command(&envelope, decoded.wire);
        }
    }
});
