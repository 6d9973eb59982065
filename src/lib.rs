//! Tessera: sorted, immutable graph indices for repository storage.
//!
//! An index maps fixed-arity byte-string keys to opaque values plus zero or
//! more lists of references to other keys. Indices are built in memory,
//! serialized once into a sorted self-describing file, and then read back
//! either whole or piecemeal: the reader bisects the sorted file over a
//! byte-range transport so small lookups touch only a fraction of a large
//! index. Many indices can be stacked into one logical view that tolerates
//! the underlying files being repacked while readers are live.
//!
//! The main types:
//!
//! - [`IndexWriter`] accumulates nodes and serializes them with
//!   [`IndexWriter::finish`].
//! - [`IndexReader`] reads a serialized index lazily through a
//!   [`Transport`].
//! - [`InMemoryIndex`] holds freshly written nodes so they are queryable
//!   before they ever hit disk.
//! - [`CombinedIndex`] merges several indices with earlier members
//!   shadowing later ones.
//! - [`PrefixAdapter`] carves a key namespace out of a wider-arity index.
//! - [`AncestryWalker`] resolves parent closures across all of the above.

#![warn(missing_docs)]

pub mod error;
pub mod format;
pub mod index;
pub mod key;
pub mod transport;

pub use error::{Result, TesseraError};
pub use index::ancestry::{Ancestry, AncestryWalker};
pub use index::builder::IndexWriter;
pub use index::combined::{CombinedIndex, Member, ReloadFunc};
pub use index::memory::InMemoryIndex;
pub use index::prefix::{AddCallback, PrefixAdapter};
pub use index::reader::{IndexReader, ReaderOptions, ReaderStats, Tunables};
pub use index::{Entry, GraphIndex, ParentMap};
pub use key::{Key, PrefixKey};
pub use transport::{LocalTransport, MemoryTransport, Transport};
