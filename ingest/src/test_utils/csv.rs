//! Byte-stream builders over fixture CSV.
//!
//! Real upload bodies arrive in arbitrary network-sized pieces that do not respect
//! record boundaries, so these builders let tests deliver the same fixture bytes whole,
//! re-chunked at a fixed width, or cut at chosen offsets.

use bytes::Bytes;
use futures::stream;

use crate::error::ErrorKind;
use crate::ingest_error;
use crate::workers::ingest::ByteStream;

/// A source yielding the given pieces in order.
pub fn byte_source(parts: Vec<Bytes>) -> ByteStream {
    Box::pin(stream::iter(parts.into_iter().map(Ok)))
}

/// A source yielding `bytes` as a single piece.
pub fn whole_source(bytes: impl Into<Bytes>) -> ByteStream {
    byte_source(vec![bytes.into()])
}

/// A source yielding `bytes` in successive pieces of at most `chunk_len` bytes.
///
/// # Panics
///
/// Panics if `chunk_len` is zero.
pub fn rechunked_source(bytes: impl Into<Bytes>, chunk_len: usize) -> ByteStream {
    assert!(chunk_len > 0, "chunk_len must be positive");

    let mut bytes = bytes.into();

    let mut parts = Vec::new();
    while bytes.len() > chunk_len {
        parts.push(bytes.split_to(chunk_len));
    }
    parts.push(bytes);

    byte_source(parts)
}

/// A source yielding `bytes` cut at the given ascending byte offsets.
///
/// Offsets may fall in the middle of a record or inside a quoted field, the record
/// stream is expected to reassemble them.
///
/// # Panics
///
/// Panics if the offsets are not ascending or exceed the fixture length.
pub fn split_source(bytes: impl Into<Bytes>, offsets: &[usize]) -> ByteStream {
    let mut bytes = bytes.into();

    let mut parts = Vec::new();
    let mut consumed = 0;
    for &offset in offsets {
        assert!(
            offset >= consumed && offset - consumed <= bytes.len(),
            "split offsets must be ascending and within the fixture"
        );

        parts.push(bytes.split_to(offset - consumed));
        consumed = offset;
    }
    parts.push(bytes);

    byte_source(parts)
}

/// A source that never yields, for cancellation and shutdown tests.
pub fn stalled_source() -> ByteStream {
    Box::pin(stream::pending())
}

/// A source yielding `prefix` and then failing with an error of the given kind.
pub fn failing_source(prefix: impl Into<Bytes>, kind: ErrorKind) -> ByteStream {
    Box::pin(stream::iter(vec![
        Ok(prefix.into()),
        Err(ingest_error!(kind, "Injected source failure")),
    ]))
}
