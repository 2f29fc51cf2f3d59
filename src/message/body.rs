//! Message bodies as ordered lists of refcounted chunks
//!
//! The codec produces body content in framed chunks; messages buffer them
//! until a terminal chunk arrives. Chunk payloads are [`bytes::Bytes`], so
//! cloning a message retains each chunk (cheap refcount bump) and dropping
//! the last holder releases the underlying buffer.

use bytes::{Bytes, BytesMut};

/// One framed piece of a message body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BodyChunk {
    data: Bytes,
    last: bool,
}

impl BodyChunk {
    /// A non-terminal content chunk
    #[must_use]
    pub fn new(data: Bytes) -> Self {
        Self { data, last: false }
    }

    /// The terminal chunk, with optional trailing content
    #[must_use]
    pub fn last(data: Bytes) -> Self {
        Self { data, last: true }
    }

    /// An empty terminal chunk, marking end-of-body with no content
    #[must_use]
    pub fn empty_last() -> Self {
        Self {
            data: Bytes::new(),
            last: true,
        }
    }

    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    #[must_use]
    pub fn into_data(self) -> Bytes {
        self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn is_last(&self) -> bool {
        self.last
    }
}

/// Buffered body state of one message
///
/// A body is empty (no chunks), partial (chunks buffered, terminal chunk
/// not yet seen), or complete (terminal chunk present).
#[derive(Debug, Default)]
pub struct Body {
    chunks: Vec<BodyChunk>,
    has_body: bool,
    complete: bool,
}

impl Body {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk; a terminal chunk marks the body complete
    pub fn buffer(&mut self, chunk: BodyChunk) {
        self.has_body = true;
        if chunk.is_last() {
            self.complete = true;
        }
        self.chunks.push(chunk);
    }

    #[must_use]
    pub fn has_body(&self) -> bool {
        self.has_body
    }

    pub fn set_has_body(&mut self, has_body: bool) {
        self.has_body = has_body;
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Sum of buffered chunk lengths, in bytes
    #[must_use]
    pub fn length(&self) -> usize {
        self.chunks.iter().map(BodyChunk::len).sum()
    }

    /// Concatenated body content; None when nothing was ever buffered
    #[must_use]
    pub fn to_bytes(&self) -> Option<Bytes> {
        if self.chunks.is_empty() {
            return None;
        }
        if self.chunks.len() == 1 {
            return Some(self.chunks[0].data().clone());
        }
        let mut out = BytesMut::with_capacity(self.length());
        for chunk in &self.chunks {
            out.extend_from_slice(chunk.data());
        }
        Some(out.freeze())
    }

    /// Chunks in arrival order
    #[must_use]
    pub fn chunks(&self) -> &[BodyChunk] {
        &self.chunks
    }

    /// Replace the body with a single complete chunk
    ///
    /// Previously buffered chunks are released.
    pub fn replace(&mut self, data: Bytes) {
        self.dispose();
        self.buffer(BodyChunk::last(data));
    }

    /// Append an empty terminal chunk when the body never completed
    ///
    /// Returns true when a chunk was appended.
    pub fn finish_if_incomplete(&mut self) -> bool {
        if self.complete {
            return false;
        }
        self.buffer(BodyChunk::empty_last());
        true
    }

    /// Release every buffered chunk
    pub fn dispose(&mut self) {
        self.chunks.clear();
        self.complete = false;
    }

    /// Move the chunk list out, leaving the body temporarily empty
    ///
    /// Used by the chain runner to stream buffered chunks through a filter
    /// while the message itself stays borrowable; pair with
    /// [`Self::restore_chunks`].
    #[must_use]
    pub fn take_chunks(&mut self) -> Vec<BodyChunk> {
        std::mem::take(&mut self.chunks)
    }

    /// Put a (possibly rewritten) chunk list back
    pub fn restore_chunks(&mut self, chunks: Vec<BodyChunk>) {
        self.complete = chunks.iter().any(BodyChunk::is_last);
        if !chunks.is_empty() {
            self.has_body = true;
        }
        self.chunks = chunks;
    }

    /// Clone for message cloning: retains every chunk
    #[must_use]
    pub fn clone_retained(&self) -> Self {
        Self {
            chunks: self.chunks.clone(),
            has_body: self.has_body,
            complete: self.complete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_body() {
        let body = Body::new();
        assert!(!body.has_body());
        assert!(!body.is_complete());
        assert_eq!(body.length(), 0);
        assert_eq!(body.to_bytes(), None);
    }

    #[test]
    fn test_partial_body() {
        let mut body = Body::new();
        body.buffer(BodyChunk::new(Bytes::from_static(b"Hello ")));
        assert!(body.has_body());
        assert!(!body.is_complete());
        assert_eq!(body.length(), 6);
    }

    #[test]
    fn test_complete_body_concatenates() {
        let mut body = Body::new();
        body.buffer(BodyChunk::new(Bytes::from_static(b"Hello ")));
        body.buffer(BodyChunk::last(Bytes::from_static(b"World!")));
        assert!(body.is_complete());
        assert_eq!(body.to_bytes().unwrap().as_ref(), b"Hello World!");
    }

    #[test]
    fn test_empty_terminal_chunk_completes() {
        let mut body = Body::new();
        body.buffer(BodyChunk::new(Bytes::from_static(b"data")));
        body.buffer(BodyChunk::empty_last());
        assert!(body.is_complete());
        assert_eq!(body.length(), 4);
    }

    #[test]
    fn test_length_equals_chunk_sum() {
        let mut body = Body::new();
        body.buffer(BodyChunk::new(Bytes::from_static(b"ab")));
        body.buffer(BodyChunk::new(Bytes::from_static(b"cde")));
        body.buffer(BodyChunk::last(Bytes::from_static(b"f")));

        let sum: usize = body.chunks().iter().map(BodyChunk::len).sum();
        assert_eq!(body.length(), sum);
        assert_eq!(body.length(), 6);
    }

    #[test]
    fn test_replace_releases_old_chunks() {
        let mut body = Body::new();
        body.buffer(BodyChunk::new(Bytes::from_static(b"old")));
        body.replace(Bytes::from_static(b"new"));

        assert_eq!(body.chunks().len(), 1);
        assert!(body.is_complete());
        assert_eq!(body.to_bytes().unwrap().as_ref(), b"new");
    }

    #[test]
    fn test_finish_if_incomplete() {
        let mut body = Body::new();
        body.buffer(BodyChunk::new(Bytes::from_static(b"x")));
        assert!(body.finish_if_incomplete());
        assert!(body.is_complete());
        // Second call is a no-op
        assert!(!body.finish_if_incomplete());
        assert_eq!(body.chunks().len(), 2);
    }

    #[test]
    fn test_dispose_clears() {
        let mut body = Body::new();
        body.buffer(BodyChunk::last(Bytes::from_static(b"x")));
        body.dispose();
        assert_eq!(body.chunks().len(), 0);
        assert!(!body.is_complete());
        // has_body stays true: the message did carry a body at some point
        assert!(body.has_body());
    }

    #[test]
    fn test_take_and_restore_chunks() {
        let mut body = Body::new();
        body.buffer(BodyChunk::new(Bytes::from_static(b"a")));
        body.buffer(BodyChunk::last(Bytes::from_static(b"b")));

        let mut chunks = body.take_chunks();
        assert_eq!(body.chunks().len(), 0);
        chunks[0] = BodyChunk::new(Bytes::from_static(b"A"));
        body.restore_chunks(chunks);

        assert!(body.is_complete());
        assert_eq!(body.to_bytes().unwrap().as_ref(), b"Ab");
    }

    #[test]
    fn test_clone_retained_shares_buffers() {
        let payload = Bytes::from_static(b"shared");
        let mut body = Body::new();
        body.buffer(BodyChunk::last(payload.clone()));

        let copy = body.clone_retained();
        drop(body);

        // The clone still reads the buffer after the original is gone
        assert_eq!(copy.to_bytes().unwrap().as_ref(), b"shared");
    }

    #[test]
    fn test_refcount_released_once_per_holder() {
        let payload = Bytes::from(vec![7u8; 64]);
        let mut body = Body::new();
        body.buffer(BodyChunk::last(payload.clone()));
        let copy = body.clone_retained();

        drop(body);
        drop(copy);

        // Original handle remains sole owner and usable
        assert_eq!(payload.len(), 64);
    }
}
