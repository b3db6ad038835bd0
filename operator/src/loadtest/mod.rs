//! LoadTest resource and helpers used to build new load tests.
mod spec;

pub use spec::{
    ImageDetails, LoadTest, LoadTestPhase, LoadTestPodsStatus, LoadTestSpec, LoadTestStatus,
    LoadTestType, UnknownVariant,
};

#[cfg(feature = "controller")]
mod build;
#[cfg(feature = "controller")]
pub use build::{
    build, generate_name, hash_label_selector, parse_tags, tag_labels, test_file_hash, Error,
    TEST_FILE_HASH_LABEL, TEST_TAG_LABEL_PREFIX,
};
