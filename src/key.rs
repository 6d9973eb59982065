//! Key types shared by every index variant.
//!
//! A key is a fixed-arity tuple of byte-strings; the arity is uniform per
//! index. Prefix keys are lookup patterns with trailing wildcards.

use std::fmt;

use bytes::Bytes;
use smallvec::SmallVec;

use crate::error::{Result, TesseraError};

/// Bytes a key element may never contain: the separators of the serialized
/// form plus whitespace.
const FORBIDDEN_KEY_BYTES: &[u8] = b"\t\n\x0b\x0c\r\x00 ";

/// A fixed-arity ordered sequence of byte-string elements.
///
/// Keys compare element-wise, lexicographically by byte value, which matches
/// the sort order of the serialized index.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(SmallVec<[Bytes; 2]>);

impl Key {
    /// Builds a key from its elements.
    pub fn new<I, T>(elements: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        Key(elements.into_iter().map(Into::into).collect())
    }

    /// The key's elements in order.
    pub fn elements(&self) -> &[Bytes] {
        &self.0
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the key has no elements.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when the key's leading elements equal `prefix`.
    pub fn starts_with(&self, prefix: &[Bytes]) -> bool {
        self.0.len() >= prefix.len() && self.0[..prefix.len()] == *prefix
    }

    /// A new key with `prefix` prepended.
    pub fn prepend(&self, prefix: &[Bytes]) -> Key {
        let mut elements: SmallVec<[Bytes; 2]> =
            SmallVec::with_capacity(prefix.len() + self.0.len());
        elements.extend(prefix.iter().cloned());
        elements.extend(self.0.iter().cloned());
        Key(elements)
    }

    /// A new key with the first `n` elements removed.
    pub fn strip_front(&self, n: usize) -> Key {
        Key(self.0[n..].iter().cloned().collect())
    }

    /// Total bytes of the elements plus the separators between them.
    pub(crate) fn encoded_len(&self) -> usize {
        let payload: usize = self.0.iter().map(|e| e.len()).sum();
        payload + self.0.len().saturating_sub(1)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, element) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}", String::from_utf8_lossy(element))?;
        }
        write!(f, ")")
    }
}

impl<T: Into<Bytes>> FromIterator<T> for Key {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Key::new(iter)
    }
}

/// Validates a key against an index's arity and the element character set.
pub(crate) fn check_key(key: &Key, key_elements: usize) -> Result<()> {
    if key.len() != key_elements {
        return Err(TesseraError::BadKey(format!(
            "{key:?} has {} elements, index expects {key_elements}",
            key.len()
        )));
    }
    for element in key.elements() {
        if element.is_empty() {
            return Err(TesseraError::BadKey(format!("{key:?} has an empty element")));
        }
        if element.iter().any(|b| FORBIDDEN_KEY_BYTES.contains(b)) {
            return Err(TesseraError::BadKey(format!(
                "{key:?} contains whitespace or separator bytes"
            )));
        }
    }
    Ok(())
}

/// Validates a value: newlines and null bytes are reserved by the format.
pub(crate) fn check_value(value: &[u8]) -> Result<()> {
    if value.iter().any(|b| *b == b'\n' || *b == 0) {
        return Err(TesseraError::BadValue(format!(
            "{:?} contains a newline or null byte",
            String::from_utf8_lossy(value)
        )));
    }
    Ok(())
}

/// A lookup pattern for prefix queries: concrete leading elements followed
/// by an optional run of trailing wildcards.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PrefixKey(SmallVec<[Option<Bytes>; 2]>);

impl PrefixKey {
    /// Builds a pattern from per-position elements, `None` being a wildcard.
    pub fn new<I>(elements: I) -> Self
    where
        I: IntoIterator<Item = Option<Bytes>>,
    {
        PrefixKey(elements.into_iter().collect())
    }

    /// An exact-match pattern for `key`.
    pub fn from_key(key: &Key) -> Self {
        PrefixKey(key.elements().iter().cloned().map(Some).collect())
    }

    /// A pattern of `prefix` followed by `wildcards` trailing wildcards.
    pub fn with_wildcards<I, T>(prefix: I, wildcards: usize) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        let mut elements: SmallVec<[Option<Bytes>; 2]> =
            prefix.into_iter().map(|e| Some(e.into())).collect();
        elements.extend(std::iter::repeat(None).take(wildcards));
        PrefixKey(elements)
    }

    /// A new pattern with concrete `prefix` elements prepended.
    pub fn prepend(&self, prefix: &[Bytes]) -> PrefixKey {
        let mut elements: SmallVec<[Option<Bytes>; 2]> =
            SmallVec::with_capacity(prefix.len() + self.0.len());
        elements.extend(prefix.iter().cloned().map(Some));
        elements.extend(self.0.iter().cloned());
        PrefixKey(elements)
    }

    /// Number of positions in the pattern.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the pattern has no positions.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The concrete leading elements, ending at the first wildcard.
    pub fn concrete_elements(&self) -> impl Iterator<Item = &Bytes> {
        self.0
            .iter()
            .take_while(|e| e.is_some())
            .filter_map(|e| e.as_ref())
    }

    /// Number of concrete leading elements.
    pub fn concrete_len(&self) -> usize {
        self.0.iter().take_while(|e| e.is_some()).count()
    }

    /// True when every position is concrete.
    pub fn is_exact(&self) -> bool {
        self.concrete_len() == self.0.len()
    }

    /// The fully concrete key, when the pattern has no wildcards.
    pub fn as_exact_key(&self) -> Option<Key> {
        if self.is_exact() {
            Some(Key(self.0.iter().filter_map(|e| e.clone()).collect()))
        } else {
            None
        }
    }

    /// Validates the pattern for an index of the given arity: the arity must
    /// match, the first position must be concrete, and no concrete element
    /// may follow a wildcard.
    pub(crate) fn check(&self, key_elements: usize) -> Result<()> {
        if self.0.len() != key_elements {
            return Err(TesseraError::BadKey(format!(
                "{self:?} has {} positions, index expects {key_elements}",
                self.0.len()
            )));
        }
        if self.0.first().map(Option::is_none).unwrap_or(true) {
            return Err(TesseraError::BadKey(format!(
                "{self:?} must start with a concrete element"
            )));
        }
        let mut seen_wildcard = false;
        for element in &self.0 {
            match element {
                None => seen_wildcard = true,
                Some(_) if seen_wildcard => {
                    return Err(TesseraError::BadKey(format!(
                        "{self:?} has a concrete element after a wildcard"
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// True when `key` matches this pattern position by position.
    pub fn matches(&self, key: &Key) -> bool {
        if key.len() != self.0.len() {
            return false;
        }
        self.0
            .iter()
            .zip(key.elements())
            .all(|(pattern, element)| match pattern {
                Some(expected) => expected == element,
                None => true,
            })
    }
}

impl fmt::Debug for PrefixKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, element) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match element {
                Some(bytes) => write!(f, "{:?}", String::from_utf8_lossy(bytes))?,
                None => write!(f, "*")?,
            }
        }
        write!(f, ")")
    }
}
