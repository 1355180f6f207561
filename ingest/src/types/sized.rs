/// Number of source-stream bytes a pipeline item accounts for.
///
/// Chunk assembly caps batches by the amount of CSV text they cover, so items
/// flowing toward the loader report how many upload bytes they consumed.
pub trait SourceBytes {
    fn source_bytes(&self) -> usize;
}

/// Failed items carry no loadable payload and count as zero, so a run of
/// rejections never forces a chunk cut on its own.
impl<T: SourceBytes, E> SourceBytes for Result<T, E> {
    fn source_bytes(&self) -> usize {
        self.as_ref().map(T::source_bytes).unwrap_or(0)
    }
}
