// Copyright (c) 2026 Meshline
// Licensed under the Apache-2.0 License.

#![no_main]
#![forbid(unsafe_code)]

use libfuzzer_sys::fuzz_target;

use meshline::core::codec::decode;
use meshline::core::types::{CommunityId, MetaName};

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must never panic the decoder, regardless of header,
    // auth block, or payload garbage. Every meta tag resolves so we reach
    // as deep into decode/verify as possible.
    let expected_community = CommunityId::from_public_key(&[0u8; 32]);
    let _ = decode(
        expected_community,
        |_tag| Some(MetaName::from("fuzz")),
        data,
        1 << 16,
    );
});
