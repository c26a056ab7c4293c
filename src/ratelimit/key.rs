//! Bucket key generation and handling.

/// Suffix of the sub-key holding the token count.
const TOKEN_SUFFIX: &str = ":token";
/// Suffix of the sub-key holding the last allowed timestamp.
const TIMESTAMP_SUFFIX: &str = ":timestamp";

/// A key that uniquely identifies one bucket in the state store.
///
/// The key is the namespace of the limiter followed directly by the
/// caller-supplied identifier. The empty identifier is a valid key and
/// addresses a single global bucket for the namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// Namespace shared by every bucket of one limiter
    pub namespace: String,
    /// The caller-supplied identifier
    pub identifier: String,
}

impl BucketKey {
    /// Create a new bucket key from a namespace and identifier.
    pub fn new(namespace: &str, identifier: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            identifier: identifier.to_string(),
        }
    }

    /// The base store key for this bucket.
    pub fn to_string_key(&self) -> String {
        format!("{}{}", self.namespace, self.identifier)
    }

    /// Sub-key holding the token count.
    pub fn token_key(&self) -> String {
        format!("{}{}", self.to_string_key(), TOKEN_SUFFIX)
    }

    /// Sub-key holding the last allowed timestamp.
    pub fn timestamp_key(&self) -> String {
        format!("{}{}", self.to_string_key(), TIMESTAMP_SUFFIX)
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
