//! Content digests, tags and repository names.

use std::fmt;
use std::str::FromStr;

use sha2::Digest as _;

use crate::error::RegistryError;

/// The tag clients ask for when they don't name one.
pub const LATEST: &str = "latest";

/// Branch that `latest` resolves to unless configured otherwise.
pub const DEFAULT_BRANCH: &str = "public";

const MAX_TAG_LENGTH: usize = 128;

/// A validated `algorithm:hex` content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(String);

impl Digest {
    /// Digest a byte slice with sha256.
    pub fn sha256(data: &[u8]) -> Self {
        Digest(format!("sha256:{}", hex::encode(sha2::Sha256::digest(data))))
    }

    /// Wrap a finished sha256 hasher.
    pub fn from_sha256(hasher: sha2::Sha256) -> Self {
        Digest(format!("sha256:{}", hex::encode(hasher.finalize())))
    }

    /// Parse and validate a digest string.
    pub fn parse(value: &str) -> Result<Self, RegistryError> {
        let invalid = || RegistryError::InvalidDigest(value.to_owned());

        let (algorithm, encoded) = value.split_once(':').ok_or_else(invalid)?;
        let expected = match algorithm {
            "sha256" => 64,
            "sha384" => 96,
            "sha512" => 128,
            _ => return Err(invalid()),
        };

        if encoded.len() != expected
            || !encoded
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(invalid());
        }

        Ok(Digest(value.to_owned()))
    }

    /// Hash algorithm, e.g. `sha256`.
    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map(|(alg, _)| alg).unwrap_or("")
    }

    /// Hex payload.
    pub fn encoded(&self) -> &str {
        self.0.split_once(':').map(|(_, hex)| hex).unwrap_or("")
    }

    /// The full `algorithm:hex` form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check that `data` hashes to this digest.
    pub fn verify(&self, data: &[u8]) -> Result<(), RegistryError> {
        let actual = match self.algorithm() {
            "sha256" => hex::encode(sha2::Sha256::digest(data)),
            "sha384" => hex::encode(sha2::Sha384::digest(data)),
            "sha512" => hex::encode(sha2::Sha512::digest(data)),
            _ => return Err(RegistryError::InvalidDigest(self.0.clone())),
        };

        if actual != self.encoded() {
            return Err(RegistryError::DigestMismatch {
                expected: self.0.clone(),
                actual: format!("{}:{actual}", self.algorithm()),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Digest::parse(s)
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Whether a reference names content by digest rather than by tag.
pub fn is_digest(reference: &str) -> bool {
    Digest::parse(reference).is_ok()
}

/// Rewrite `latest` to the default branch. Any other tag is returned as is.
pub fn normalize_tag<'a>(reference: &'a str, default_branch: &'a str) -> &'a str {
    if reference == LATEST {
        default_branch
    } else {
        reference
    }
}

/// A manifest reference from a request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// Immutable content digest.
    Digest(Digest),
    /// Mutable tag, resolved by building.
    Tag(String),
}

impl Reference {
    /// Anything that fails the digest grammar is a tag, and must be a valid one.
    pub fn parse(reference: &str) -> Result<Self, RegistryError> {
        if let Ok(digest) = Digest::parse(reference) {
            return Ok(Reference::Digest(digest));
        }
        validate_tag(reference)?;
        Ok(Reference::Tag(reference.to_owned()))
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Digest(digest) => digest.fmt(f),
            Reference::Tag(tag) => f.write_str(tag),
        }
    }
}

/// Validate a tag: `[A-Za-z0-9_][A-Za-z0-9._-]{0,127}`.
pub fn validate_tag(tag: &str) -> Result<(), RegistryError> {
    let mut bytes = tag.bytes();
    let valid = match bytes.next() {
        Some(first) if first.is_ascii_alphanumeric() || first == b'_' => {
            tag.len() <= MAX_TAG_LENGTH
                && bytes.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidTag(tag.to_owned()))
    }
}

/// Validate a repository name: `/`-separated components of
/// `[a-z0-9]+` joined by `.`, `_`, `__` or runs of `-`.
pub fn validate_name(name: &str) -> Result<(), RegistryError> {
    if name.is_empty() || !name.split('/').all(valid_component) {
        return Err(RegistryError::InvalidName(name.to_owned()));
    }
    Ok(())
}

fn valid_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();

    let (Some(&first), Some(&last)) = (bytes.first(), bytes.last()) else {
        return false;
    };
    if !alnum(first) || !alnum(last) {
        return false;
    }

    let mut i = 0;
    while i < bytes.len() {
        if alnum(bytes[i]) {
            i += 1;
            continue;
        }

        let start = i;
        while i < bytes.len() && !alnum(bytes[i]) {
            i += 1;
        }
        match &bytes[start..i] {
            b"." | b"_" | b"__" => {}
            run if run.iter().all(|&b| b == b'-') => {}
            _ => return false,
        }
    }
    true
}
