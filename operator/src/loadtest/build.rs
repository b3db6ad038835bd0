use std::collections::BTreeMap;

use kube::api::ObjectMeta;
use rand::{seq::SliceRandom, Rng};
use sha2::{Digest, Sha256};

use crate::{
    backends::{self, Registry},
    labels::managed_labels_extend,
    loadtest::{LoadTest, LoadTestSpec},
};

/// Label holding the hash of the test file.
pub const TEST_FILE_HASH_LABEL: &str = "test-file-hash";
/// Prefix of labels created from tags.
pub const TEST_TAG_LABEL_PREFIX: &str = "test-tag-";

// Label values are limited to 63 characters.
const MAX_LABEL_VALUE_LEN: usize = 63;
const HASH_LABEL_LEN: usize = 40;

const ADJECTIVES: &[&str] = &[
    "agile", "bold", "brave", "bright", "calm", "clever", "cosmic", "crisp", "daring", "eager",
    "fancy", "fierce", "gentle", "giant", "happy", "hidden", "jolly", "keen", "lively", "lucky",
    "mellow", "mighty", "nimble", "noble", "plucky", "proud", "quick", "quiet", "rapid", "shiny",
    "silent", "sleepy", "snappy", "solid", "steady", "swift", "tidy", "vivid", "witty", "zesty",
];

const NOUNS: &[&str] = &[
    "badger", "beaver", "bison", "cobra", "condor", "coyote", "crane", "dingo", "eagle", "falcon",
    "ferret", "gecko", "heron", "hyena", "ibex", "jackal", "koala", "lemur", "lynx", "marmot",
    "moose", "narwhal", "otter", "panda", "pelican", "puffin", "quokka", "raven", "salmon",
    "shark", "sloth", "tapir", "tiger", "toucan", "viper", "walrus", "wombat", "yak", "zebra",
    "owl",
];

/// Errors produced while building a load test.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Tag string could not be parsed.
    #[error("invalid tag {tag:?}: {reason}")]
    InvalidTag {
        /// Offending tag.
        tag: String,
        /// Why the tag was rejected.
        reason: &'static str,
    },
    /// Spec was rejected by the backend.
    #[error("Backend error: {source}")]
    Backend {
        /// Backend error
        #[from]
        source: backends::Error,
    },
}

/// Generate a load test name made of a random adjective and noun.
pub fn generate_name(rng: &mut impl Rng) -> String {
    let adjective = ADJECTIVES.choose(rng).copied().unwrap_or("quick");
    let noun = NOUNS.choose(rng).copied().unwrap_or("otter");
    format!("loadtest-{adjective}-{noun}")
}

/// Hex encoded hash of the test file, short enough to be a label value.
pub fn test_file_hash(spec: &LoadTestSpec) -> String {
    let content = spec
        .test_file
        .as_ref()
        .map(|file| file.0.as_slice())
        .unwrap_or_default();
    let mut hash = hex::encode(Sha256::digest(content));
    hash.truncate(HASH_LABEL_LEN);
    hash
}

/// Label selector matching every load test created from the same test file.
pub fn hash_label_selector(spec: &LoadTestSpec) -> String {
    format!("{TEST_FILE_HASH_LABEL}={}", test_file_hash(spec))
}

/// Labels derived from the tags of a load test.
pub fn tag_labels(tags: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    tags.iter()
        .map(|(k, v)| (format!("{TEST_TAG_LABEL_PREFIX}{k}"), v.to_owned()))
        .collect()
}

/// Parse tags formatted as `label:value` pairs separated by commas.
pub fn parse_tags(tags: &str) -> Result<BTreeMap<String, String>, Error> {
    let mut parsed = BTreeMap::new();
    for tag in tags.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let invalid = |reason| Error::InvalidTag {
            tag: tag.to_owned(),
            reason,
        };
        let (label, value) = tag.split_once(':').ok_or_else(|| invalid("missing value"))?;
        let (label, value) = (label.trim(), value.trim());
        if label.is_empty() {
            return Err(invalid("missing label"));
        }
        if value.is_empty() {
            return Err(invalid("missing value"));
        }
        if value.len() > MAX_LABEL_VALUE_LEN {
            return Err(invalid("value is longer than 63 characters"));
        }
        parsed.insert(label.to_owned(), value.to_owned());
    }
    Ok(parsed)
}

/// Build a new load test ready to be submitted to the cluster.
///
/// The load test spec is validated and normalized by the backend registered for its type.
pub fn build(
    mut spec: LoadTestSpec,
    registry: &Registry,
    rng: &mut impl Rng,
) -> Result<LoadTest, Error> {
    registry.get(spec.load_test_type)?.transform_spec(&mut spec)?;

    let mut labels = tag_labels(&spec.tags);
    labels.insert(TEST_FILE_HASH_LABEL.to_owned(), test_file_hash(&spec));

    Ok(LoadTest {
        metadata: ObjectMeta {
            name: Some(generate_name(rng)),
            labels: managed_labels_extend(Some(labels)),
            ..Default::default()
        },
        spec,
        status: None,
    })
}
