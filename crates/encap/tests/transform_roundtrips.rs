//! Property: every supported wrap/compress composition inverts exactly.

use proptest::prelude::*;
use std::sync::Arc;
use stowage_core::{CompressTag, WrapTag};
use stowage_encap::{
    decapsulate, encapsulate, Aes256CtrWrapper, CompressorRegistry, NonceMode, WrapperRegistry,
};

fn registries() -> (CompressorRegistry, WrapperRegistry) {
    let compressors = CompressorRegistry::with_defaults();
    let mut wrappers = WrapperRegistry::with_defaults();
    wrappers
        .register(Arc::new(Aes256CtrWrapper::with_mode(
            [0x5a; 32],
            NonceMode::KeyDerived,
        )))
        .unwrap();
    (compressors, wrappers)
}

const WRAP_TAGS: &[&str] = &[
    "pass",
    "sc",
    "ms512",
    "aes256",
    "svg",
    "png",
    "png3d",
    "sc-png",
    "aes256-sc-svg",
    "ms512-png3d",
];

const COMPRESS_TAGS: &[&str] = &["pass", "zlib", "bz2", "lzma", "zlib-pass"];

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_decap_inverts_encap(
        data in proptest::collection::vec(any::<u8>(), 0..2048),
        wrap_idx in 0..WRAP_TAGS.len(),
        compress_idx in 0..COMPRESS_TAGS.len(),
    ) {
        let (compressors, wrappers) = registries();
        let wrap_tag = WrapTag::new(WRAP_TAGS[wrap_idx]);
        let compress_tag = CompressTag::new(COMPRESS_TAGS[compress_idx]);

        let enc = encapsulate(&compressors, &wrappers, &compress_tag, &wrap_tag, &data).unwrap();
        let dec = decapsulate(&compressors, &wrappers, &compress_tag, &wrap_tag, &enc).unwrap();
        prop_assert_eq!(dec, data);
    }
}

#[test]
fn random_nonce_aes_still_inverts() {
    let compressors = CompressorRegistry::with_defaults();
    let mut wrappers = WrapperRegistry::with_defaults();
    wrappers
        .register(Arc::new(Aes256CtrWrapper::new([0x11; 32])))
        .unwrap();

    let wrap_tag = WrapTag::new("aes256-sc");
    let compress_tag = CompressTag::new("zlib");
    let data = b"nonce goes in front, envelope checks the ciphertext";
    let enc = encapsulate(&compressors, &wrappers, &compress_tag, &wrap_tag, data).unwrap();
    let dec = decapsulate(&compressors, &wrappers, &compress_tag, &wrap_tag, &enc).unwrap();
    assert_eq!(dec.as_slice(), data.as_slice());
}

#[test]
fn min_size_wrapper_meets_backend_minimum() {
    let (compressors, wrappers) = registries();
    let enc = encapsulate(
        &compressors,
        &wrappers,
        &CompressTag::new("pass"),
        &WrapTag::new("ms1000"),
        b"small",
    )
    .unwrap();
    assert!(enc.len() >= 1000);
}
