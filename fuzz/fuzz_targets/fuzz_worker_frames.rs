#![no_main]

use libfuzzer_sys::fuzz_target;
use sqlrelay_worker::codec::{Inbound, decode_command};
use sqlrelay_worker::{Envelope, WorkerRuntime};

// Feeds decoded frames straight to a runtime. Every envelope must produce a
// message carrying its id, whatever the SQL or snapshot bytes contain.
fuzz_target!(|data: &[u8]| {
    let mut runtime = WorkerRuntime::sqlite();
    runtime.startup();
    for chunk in data.split(|byte| *byte == 0) {
        let Ok(decoded) = decode_command(chunk) else {
            continue;
        };
        if let Inbound::Envelope(Envelope { id, command }) = decoded.inbound {
            let message = runtime.handle(Envelope {
                id: id.clone(),
                command,
            });
            assert_eq!(message.id(), id.as_ref());
        }
    }
});
