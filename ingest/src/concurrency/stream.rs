use core::pin::Pin;
use core::task::{Context, Poll};

use futures::Stream;
use ingest_config::shared::BatchConfig;
use pin_project_lite::pin_project;
use tracing::info;

use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};
use crate::types::SourceBytes;

pin_project! {
    /// A stream adapter that groups validated rows into bounded chunks.
    ///
    /// Rows are collected until either the row cap or the byte cap of the chunk
    /// configuration is reached, whichever comes first. The byte cap is a hard limit: a
    /// row that would push a non-empty chunk over it is held back and opens the next
    /// chunk instead. A single row larger than the cap on its own still forms a
    /// one-row chunk, so the stream always makes progress.
    ///
    /// Shutdown signals are observed between rows, which means the pipeline only ever
    /// stops at a chunk boundary.
    #[must_use = "streams do nothing unless polled"]
    #[derive(Debug)]
    pub struct ChunkStream<B, S: Stream<Item = B>> {
        #[pin]
        stream: S,
        shutdown_rx: ShutdownRx,
        items: Vec<S::Item>,
        items_bytes: usize,
        carried: Option<S::Item>,
        batch_config: BatchConfig,
        inner_stream_ended: bool,
        stream_stopped: bool,
    }
}

impl<B, S: Stream<Item = B>> ChunkStream<B, S> {
    /// Creates a new [`ChunkStream`] wrapping `stream`.
    pub fn wrap(stream: S, batch_config: BatchConfig, shutdown_rx: ShutdownRx) -> Self {
        ChunkStream {
            stream,
            shutdown_rx,
            items: Vec::new(),
            items_bytes: 0,
            carried: None,
            batch_config,
            inner_stream_ended: false,
            stream_stopped: false,
        }
    }
}

impl<B: SourceBytes, S: Stream<Item = B>> Stream for ChunkStream<B, S> {
    type Item = ShutdownResult<Vec<S::Item>, Vec<S::Item>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.as_mut().project();

        // Fast path: if the inner stream has already ended, we're done.
        if *this.inner_stream_ended {
            return Poll::Ready(None);
        }

        loop {
            // Fast path: if we've been marked as stopped, terminate immediately.
            if *this.stream_stopped {
                return Poll::Ready(None);
            }

            // Shutdown handling takes priority over all other operations. Any buffered
            // rows are returned with shutdown indication, even an empty chunk, so the
            // consumer learns that shutdown occurred.
            if this.shutdown_rx.has_changed().unwrap_or(false) {
                info!("chunk stream stopped by shutdown signal");

                // Mark the stream as permanently stopped to prevent further polling.
                *this.stream_stopped = true;

                // Acknowledge that we've seen the shutdown signal to maintain watch
                // semantics.
                this.shutdown_rx.mark_unchanged();

                *this.items_bytes = 0;
                return Poll::Ready(Some(ShutdownResult::Shutdown(std::mem::take(this.items))));
            }

            // Pre-allocate chunk capacity when starting to collect rows. This avoids
            // reallocations while a chunk fills up.
            if this.items.is_empty() {
                this.items.reserve_exact(this.batch_config.max_rows);
            }

            // A row held back because it would have pushed the previous chunk over the
            // byte cap is consumed before the inner stream is polled again.
            let next = match this.carried.take() {
                Some(item) => Some(item),
                None => match this.stream.as_mut().poll_next(cx) {
                    Poll::Ready(next) => next,
                    Poll::Pending => return Poll::Pending,
                },
            };

            match next {
                Some(item) => {
                    let item_bytes = item.source_bytes();

                    // The byte cap is enforced before pushing so a finished chunk never
                    // exceeds it. The offending row becomes the first row of the next
                    // chunk.
                    if !this.items.is_empty()
                        && *this.items_bytes + item_bytes > this.batch_config.max_bytes
                    {
                        *this.carried = Some(item);
                        *this.items_bytes = 0;

                        return Poll::Ready(Some(ShutdownResult::Ok(std::mem::take(this.items))));
                    }

                    this.items.push(item);
                    *this.items_bytes += item_bytes;

                    if this.items.len() >= this.batch_config.max_rows
                        || *this.items_bytes >= this.batch_config.max_bytes
                    {
                        *this.items_bytes = 0;

                        return Poll::Ready(Some(ShutdownResult::Ok(std::mem::take(this.items))));
                    }
                }
                None => {
                    // The underlying stream finished. Return the final partial chunk if
                    // there is one, otherwise signal completion.
                    let last = if this.items.is_empty() {
                        None
                    } else {
                        *this.items_bytes = 0;
                        Some(ShutdownResult::Ok(std::mem::take(this.items)))
                    };

                    *this.inner_stream_ended = true;

                    return Poll::Ready(last);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use core::task::Poll;

    use futures::StreamExt;
    use futures::future::poll_fn;
    use pin_project_lite::pin_project;

    use super::*;
    use crate::concurrency::shutdown::create_shutdown_channel;

    /// Test row whose source-byte count is its value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Weighted(usize);

    impl SourceBytes for Weighted {
        fn source_bytes(&self) -> usize {
            self.0
        }
    }

    fn batch_config(max_rows: usize, max_bytes: usize) -> BatchConfig {
        BatchConfig {
            max_rows,
            max_bytes,
        }
    }

    pin_project! {
        struct TwoThenPending {
            emitted: usize,
        }
    }

    impl Stream for TwoThenPending {
        type Item = Weighted;

        fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            match self.emitted {
                0 => {
                    self.emitted = 1;
                    Poll::Ready(Some(Weighted(1)))
                }
                1 => {
                    self.emitted = 2;
                    Poll::Ready(Some(Weighted(2)))
                }
                _ => Poll::Pending,
            }
        }
    }

    async fn collect_ok_chunks<S>(stream: S) -> Vec<Vec<Weighted>>
    where
        S: Stream<Item = ShutdownResult<Vec<Weighted>, Vec<Weighted>>>,
    {
        stream
            .map(|chunk| match chunk {
                ShutdownResult::Ok(items) => items,
                ShutdownResult::Shutdown(_) => panic!("unexpected shutdown"),
            })
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_chunks_close_on_row_cap_with_final_partial_chunk() {
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let rows = futures::stream::iter((0..5).map(|_| Weighted(1)));

        let stream = ChunkStream::wrap(rows, batch_config(2, usize::MAX), shutdown_rx);
        let chunks = collect_ok_chunks(stream).await;

        let lengths: Vec<_> = chunks.iter().map(Vec::len).collect();
        assert_eq!(lengths, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_row_crossing_byte_cap_opens_next_chunk() {
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let rows = futures::stream::iter(vec![Weighted(3), Weighted(3), Weighted(5)]);

        let stream = ChunkStream::wrap(rows, batch_config(10, 8), shutdown_rx);
        let chunks = collect_ok_chunks(stream).await;

        assert_eq!(
            chunks,
            vec![vec![Weighted(3), Weighted(3)], vec![Weighted(5)]],
        );
    }

    #[tokio::test]
    async fn test_oversized_row_forms_single_row_chunk() {
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let rows = futures::stream::iter(vec![Weighted(20), Weighted(1)]);

        let stream = ChunkStream::wrap(rows, batch_config(10, 8), shutdown_rx);
        let chunks = collect_ok_chunks(stream).await;

        assert_eq!(chunks, vec![vec![Weighted(20)], vec![Weighted(1)]]);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_buffered_rows_with_indication() {
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();

        let mut stream = Box::pin(ChunkStream::wrap(
            TwoThenPending { emitted: 0 },
            batch_config(10, usize::MAX),
            shutdown_rx,
        ));

        // On the first poll we buffer both rows and suspend, since the chunk caps have
        // not been reached yet.
        poll_fn(|cx| match stream.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Ready(()),
            _ => panic!("expected pending"),
        })
        .await;

        shutdown_tx.shutdown().unwrap();

        let chunk = poll_fn(|cx| stream.as_mut().poll_next(cx)).await;
        match chunk {
            Some(ShutdownResult::Shutdown(items)) => {
                assert_eq!(items, vec![Weighted(1), Weighted(2)]);
            }
            _ => panic!("expected shutdown flush"),
        }

        assert_eq!(stream.next().await, None);
    }
}
