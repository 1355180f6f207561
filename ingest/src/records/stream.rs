use core::pin::Pin;
use core::task::{Context, Poll};

use bytes::Bytes;
use csv_core::{ReadRecordResult, Reader};
use futures::{Stream, ready};
use pin_project_lite::pin_project;

use crate::error::{ErrorKind, IngestError, IngestResult};
use crate::ingest_error;
use crate::types::{RawRecord, RejectReason, RejectedRow};

/// Upper bound on the size of a single CSV record.
///
/// A record that grows past this limit without terminating, usually an unbalanced quote
/// swallowing the rest of the file, poisons every byte after it. There is no safe
/// resynchronization point, so the stream fails instead of buffering without bound.
pub const MAX_RECORD_BYTES: usize = 1024 * 1024;

const INITIAL_OUTPUT_CAPACITY: usize = 4 * 1024;
const INITIAL_ENDS_CAPACITY: usize = 8;

/// One decoded item of a [`RecordStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordItem {
    /// A structurally complete CSV record.
    Record(RawRecord),
    /// A record whose bytes could not be decoded, already mapped to a rejection.
    Malformed(RejectedRow),
}

pin_project! {
    /// Incremental CSV record decoder over a byte stream.
    ///
    /// Bytes are consumed chunk by chunk as the source produces them and records are
    /// emitted as soon as they are complete, so memory usage is bounded by the largest
    /// single record regardless of file size. Record splitting is CSV-aware: a quoted
    /// field may contain delimiters and newlines without breaking the record.
    ///
    /// Undecodable records are emitted as [`RecordItem::Malformed`] and do not stop the
    /// stream. Source I/O errors and records exceeding [`MAX_RECORD_BYTES`] are fatal
    /// and terminate the stream with an error.
    #[must_use = "streams do nothing unless polled"]
    #[derive(Debug)]
    pub struct RecordStream<S> {
        #[pin]
        stream: S,
        reader: Reader,
        current: Bytes,
        offset: usize,
        output: Vec<u8>,
        output_len: usize,
        ends: Vec<usize>,
        ends_len: usize,
        raw: Vec<u8>,
        next_line: u64,
        eof: bool,
        done: bool,
    }
}

impl<S> RecordStream<S> {
    /// Creates a new [`RecordStream`] wrapping `stream`.
    pub fn wrap(stream: S) -> Self {
        RecordStream {
            stream,
            reader: Reader::new(),
            current: Bytes::new(),
            offset: 0,
            output: vec![0; INITIAL_OUTPUT_CAPACITY],
            output_len: 0,
            ends: vec![0; INITIAL_ENDS_CAPACITY],
            ends_len: 0,
            raw: Vec::new(),
            next_line: 1,
            eof: false,
            done: false,
        }
    }
}

impl<S: Stream<Item = IngestResult<Bytes>>> Stream for RecordStream<S> {
    type Item = IngestResult<RecordItem>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if *this.done {
            return Poll::Ready(None);
        }

        loop {
            // Refill the input window once it is exhausted and the source still has
            // bytes. Zero-length chunks are tolerated, the loop just refills again.
            if *this.offset == this.current.len() && !*this.eof {
                match ready!(this.stream.as_mut().poll_next(cx)) {
                    Some(Ok(bytes)) => {
                        *this.current = bytes;
                        *this.offset = 0;
                        continue;
                    }
                    Some(Err(err)) => {
                        *this.done = true;
                        return Poll::Ready(Some(Err(err)));
                    }
                    None => {
                        *this.eof = true;
                    }
                }
            }

            let (result, nin, nout, nend) = {
                let input = &this.current[*this.offset..];

                this.reader.read_record(
                    input,
                    &mut this.output[*this.output_len..],
                    &mut this.ends[*this.ends_len..],
                )
            };

            this.raw
                .extend_from_slice(&this.current[*this.offset..*this.offset + nin]);
            *this.offset += nin;
            *this.output_len += nout;
            *this.ends_len += nend;

            match result {
                ReadRecordResult::InputEmpty => {
                    // The raw buffer must stay bounded even while no complete record
                    // has formed yet.
                    if this.raw.len() > MAX_RECORD_BYTES {
                        *this.done = true;
                        return Poll::Ready(Some(Err(oversized_record(*this.next_line))));
                    }
                }
                ReadRecordResult::OutputFull => {
                    if this.output.len() >= MAX_RECORD_BYTES {
                        *this.done = true;
                        return Poll::Ready(Some(Err(oversized_record(*this.next_line))));
                    }

                    let grown = (this.output.len() * 2).min(MAX_RECORD_BYTES);
                    this.output.resize(grown, 0);
                }
                ReadRecordResult::OutputEndsFull => {
                    // Field offsets are bounded transitively by the record byte cap.
                    let grown = this.ends.len() * 2;
                    this.ends.resize(grown, 0);
                }
                ReadRecordResult::Record => {
                    let consumed = this.raw.as_slice();
                    let bytes = consumed.len();

                    // Blank lines skipped while seeking the record start are consumed
                    // as leading terminator bytes. They advance the line counter but
                    // are not part of the record itself.
                    let body_start = consumed
                        .iter()
                        .position(|byte| *byte != b'\n' && *byte != b'\r')
                        .unwrap_or(consumed.len());
                    let leading_newlines = consumed[..body_start]
                        .iter()
                        .filter(|byte| **byte == b'\n')
                        .count() as u64;

                    let line = *this.next_line + leading_newlines;

                    let mut body = &consumed[body_start..];
                    let body_newlines =
                        body.iter().filter(|byte| **byte == b'\n').count() as u64;
                    *this.next_line = line + body_newlines.max(1);

                    if body.ends_with(b"\r\n") {
                        body = &body[..body.len() - 2];
                    } else if body.ends_with(b"\n") || body.ends_with(b"\r") {
                        body = &body[..body.len() - 1];
                    }
                    let raw = String::from_utf8_lossy(body).into_owned();

                    let mut fields = Vec::with_capacity(*this.ends_len);
                    let mut invalid_utf8 = false;
                    let mut start = 0;
                    for &end in &this.ends[..*this.ends_len] {
                        match std::str::from_utf8(&this.output[start..end]) {
                            Ok(field) => fields.push(field.to_owned()),
                            Err(_) => {
                                invalid_utf8 = true;
                                break;
                            }
                        }

                        start = end;
                    }

                    *this.output_len = 0;
                    *this.ends_len = 0;
                    this.raw.clear();

                    // Fully blank lines are not records, same treatment as the csv
                    // crate's default.
                    if raw.is_empty() && fields.iter().all(String::is_empty) {
                        continue;
                    }

                    let item = if invalid_utf8 {
                        RecordItem::Malformed(RejectedRow::new(
                            line,
                            raw,
                            RejectReason::SchemaError,
                            "record contains invalid utf-8",
                        ))
                    } else {
                        RecordItem::Record(RawRecord {
                            line,
                            bytes,
                            raw,
                            fields,
                        })
                    };

                    return Poll::Ready(Some(Ok(item)));
                }
                ReadRecordResult::End => {
                    *this.done = true;
                    return Poll::Ready(None);
                }
            }
        }
    }
}

fn oversized_record(line: u64) -> IngestError {
    ingest_error!(
        ErrorKind::SchemaError,
        "Oversized CSV record",
        format!(
            "the record starting at line {line} exceeds {MAX_RECORD_BYTES} bytes, the input is likely corrupted"
        )
    )
}
