#![no_main]

use auditstream_core::PartHeader;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Any header that decodes must survive an encode/decode cycle
    let mut input = data;
    if let Ok(header) = PartHeader::decode(&mut input) {
        let encoded = header.encode();
        assert_eq!(encoded.len(), header.encoded_len());
        assert_eq!(&data[..24], &encoded[..24]);

        let decoded = PartHeader::decode(&mut encoded.as_slice()).unwrap();
        assert_eq!(decoded, header);
    }
});
