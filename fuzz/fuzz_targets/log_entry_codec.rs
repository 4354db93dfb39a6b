#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use regionlog_core::entry::{decode_body, decode_frame, Record};
use regionlog_core::EditBatch;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must decode to an error, never a panic:
    // - Lengths past the end of the buffer
    // - Bad checksums
    // - Unknown record or cell kinds
    // - Overlong varints
    let mut frames = Bytes::copy_from_slice(data);
    while !frames.is_empty() {
        match decode_frame(&mut frames) {
            // A decoded entry must survive re-encoding
            Ok(Record::Entry(entry)) => {
                let Ok(mut again) = entry.encode() else {
                    panic!("decoded entry failed to re-encode");
                };
                match decode_frame(&mut again) {
                    Ok(Record::Entry(back)) => assert_eq!(back, entry),
                    other => panic!("re-encoded entry failed to decode: {:?}", other),
                }
            }
            Ok(Record::Placeholder { .. }) => {}
            Err(_) => break,
        }
    }

    let _ = decode_body(Bytes::copy_from_slice(data));
    let _ = EditBatch::decode(&mut Bytes::copy_from_slice(data));
});
