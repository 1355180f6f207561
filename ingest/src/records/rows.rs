use core::pin::Pin;
use core::task::{Context, Poll};

use futures::{Stream, ready};
use pin_project_lite::pin_project;

use crate::error::{ErrorKind, IngestResult};
use crate::ingest_error;
use crate::records::stream::RecordItem;
use crate::records::validate::RowValidator;
use crate::types::{RejectedRow, ValidRow};

/// Outcome of validating a single data record: a typed row or a rejection.
pub type RowOutcome = Result<ValidRow, RejectedRow>;

pin_project! {
    /// Stream adapter that validates decoded CSV records against a table layout.
    ///
    /// Emits one [`RowOutcome`] per data record, so malformed and invalid rows travel
    /// through the same chunks as valid ones and the consumer can account for both.
    /// When a header is expected it is consumed before the first data record; a
    /// mismatched or undecodable header terminates the stream with an error since every
    /// following row would be meaningless. Fatal errors from the inner decoder pass
    /// through unchanged and end the stream.
    #[must_use = "streams do nothing unless polled"]
    #[derive(Debug)]
    pub struct RowStream<S> {
        #[pin]
        stream: S,
        validator: RowValidator,
        expect_header: bool,
        done: bool,
    }
}

impl<S> RowStream<S> {
    /// Creates a new [`RowStream`] wrapping `stream`.
    pub fn wrap(stream: S, validator: RowValidator, expect_header: bool) -> Self {
        Self {
            stream,
            validator,
            expect_header,
            done: false,
        }
    }
}

impl<S: Stream<Item = IngestResult<RecordItem>>> Stream for RowStream<S> {
    type Item = IngestResult<RowOutcome>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if *this.done {
                return Poll::Ready(None);
            }

            let Some(item) = ready!(this.stream.as_mut().poll_next(cx)) else {
                *this.done = true;
                return Poll::Ready(None);
            };

            let record = match item {
                Ok(RecordItem::Record(record)) => record,
                Ok(RecordItem::Malformed(rejection)) => {
                    if *this.expect_header {
                        *this.done = true;

                        return Poll::Ready(Some(Err(ingest_error!(
                            ErrorKind::SchemaError,
                            "Header is not decodable",
                            rejection.error
                        ))));
                    }

                    return Poll::Ready(Some(Ok(Err(rejection))));
                }
                Err(err) => {
                    *this.done = true;

                    return Poll::Ready(Some(Err(err)));
                }
            };

            if *this.expect_header {
                *this.expect_header = false;

                match this.validator.validate_header(&record) {
                    // The header is consumed, it never counts as a data record.
                    Ok(()) => continue,
                    Err(err) => {
                        *this.done = true;

                        return Poll::Ready(Some(Err(err)));
                    }
                }
            }

            return Poll::Ready(Some(Ok(this.validator.validate(record))));
        }
    }
}
