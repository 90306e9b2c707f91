#![no_main]

use auditstream_storage::ProtoReader;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Feed arbitrary bytes to the proto reader.
    // The reader should handle all malformed inputs gracefully:
    // - Unknown protocol versions
    // - Truncated headers, bodies and padding
    // - Invalid gzip data and dangling bytes after it
    // - Zero or oversized record lengths
    // - Payloads that are not event envelopes
    let mut reader = ProtoReader::new(data);
    for _ in 0..10_000 {
        match reader.read() {
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => break,
        }
    }
    let _ = reader.stats();
});
