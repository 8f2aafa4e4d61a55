#![no_main]

use libfuzzer_sys::fuzz_target;
use replaykit_codec::{BatchDecoder, EXTENDED_CODE_BASE, ExtraDecoder, Message};

fuzz_target!(|data: &[u8]| {
    let mut last_index: Option<u64> = None;
    let mut delivered = 0u64;
    let result = BatchDecoder::new()
        .with_extra_decoder(ExtraDecoder::new(4096))
        .decode(data, |annotated| {
            if let Some(prev) = last_index {
                assert!(annotated.meta.index >= prev || prev.wrapping_add(1) == 0);
            }
            last_index = Some(annotated.meta.index);
            delivered += 1;

            // everything we hand out must encode again
            let mut buf = Vec::new();
            annotated.message.encode(&mut buf).expect("re-encode");
            let code = annotated.message.code();
            assert!(Message::is_known_code(code) || code >= EXTENDED_CODE_BASE);
        });

    if let Ok(count) = result {
        assert_eq!(count, delivered);
    }
});
