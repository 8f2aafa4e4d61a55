#![no_main]

use libfuzzer_sys::fuzz_target;
use replaykit_core::queue::{
    ConsumeStatus, ConsumerSettings, MessageConsumer, SpoolConsumer,
};

fuzz_target!(|data: &[u8]| {
    let settings = ConsumerSettings {
        message_size_limit: 1024,
        ..ConsumerSettings::default()
    };
    let mut consumer = SpoolConsumer::new(data, settings);
    loop {
        let before = consumer.position();
        match consumer.consume_next(|_, _, meta| assert!(meta.size <= 1024)) {
            Ok(ConsumeStatus::Exhausted) | Err(_) => break,
            Ok(_) => assert!(consumer.position() > before),
        }
    }
});
