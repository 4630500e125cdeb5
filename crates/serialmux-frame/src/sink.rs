use serialmux_snapshot::{Result as SnapshotResult, SnapshotError, SnapshotSink, SnapshotSource};

/// Fixed-capacity byte accumulator.
///
/// Tracks how much of a destination buffer has been filled so a message
/// segment can be assembled from arbitrarily-chunked input. The destination
/// is passed to [`fill`](Sink::fill) on every call; the sink itself only
/// holds the cursor, so ownership of the buffer stays with whoever embeds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sink {
    used: usize,
    capacity: usize,
}

impl Sink {
    /// An empty sink expecting `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self { used: 0, capacity }
    }

    /// Restart accumulation for a new segment of `capacity` bytes.
    pub fn reset(&mut self, capacity: usize) {
        self.used = 0;
        self.capacity = capacity;
    }

    /// Bytes still needed to complete the segment.
    pub fn needed(&self) -> usize {
        self.capacity - self.used
    }

    /// Bytes accumulated so far.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Total segment size.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.used == self.capacity
    }

    /// Copy `min(needed, src.len())` bytes from the front of `src` into
    /// `dest[used..]`, advancing both cursors. Returns true iff the segment
    /// is now complete.
    pub fn fill(&mut self, dest: &mut [u8], src: &mut &[u8]) -> bool {
        let n = self.needed().min(src.len());
        dest[self.used..self.used + n].copy_from_slice(&src[..n]);
        self.used += n;
        *src = &src[n..];
        self.used == self.capacity
    }

    /// Persist the cursor pair.
    pub fn save(&self, sink: &mut dyn SnapshotSink) -> SnapshotResult<()> {
        sink.put_u32(self.used as u32)?;
        sink.put_u32(self.capacity as u32)
    }

    /// Restore a cursor pair saved by [`save`](Sink::save).
    pub fn load(source: &mut dyn SnapshotSource) -> SnapshotResult<Self> {
        let used = source.get_u32()? as usize;
        let capacity = source.get_u32()? as usize;
        if used > capacity {
            return Err(SnapshotError::InvalidField(format!(
                "sink cursor {used} past capacity {capacity}"
            )));
        }
        Ok(Self { used, capacity })
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    #[test]
    fn fill_partial_then_complete() {
        let mut sink = Sink::new(6);
        let mut dest = [0u8; 6];

        let mut src: &[u8] = b"0041";
        assert!(!sink.fill(&mut dest, &mut src));
        assert!(src.is_empty());
        assert_eq!(sink.needed(), 2);

        let mut src: &[u8] = b"2a";
        assert!(sink.fill(&mut dest, &mut src));
        assert_eq!(&dest, b"00412a");
        assert!(sink.is_full());
    }

    #[test]
    fn fill_leaves_excess_in_source() {
        let mut sink = Sink::new(3);
        let mut dest = [0u8; 3];
        let mut src: &[u8] = b"abcdef";

        assert!(sink.fill(&mut dest, &mut src));
        assert_eq!(&dest, b"abc");
        assert_eq!(src, b"def");
    }

    #[test]
    fn fill_empty_source_is_noop() {
        let mut sink = Sink::new(4);
        let mut dest = [0u8; 4];
        let mut src: &[u8] = b"";

        assert!(!sink.fill(&mut dest, &mut src));
        assert_eq!(sink.used(), 0);
    }

    #[test]
    fn zero_capacity_is_immediately_full() {
        let mut sink = Sink::new(0);
        let mut dest = [0u8; 0];
        let mut src: &[u8] = b"x";

        assert!(sink.fill(&mut dest, &mut src));
        assert_eq!(src, b"x");
    }

    #[test]
    fn reset_restarts_accumulation() {
        let mut sink = Sink::new(2);
        let mut dest = [0u8; 8];
        let mut src: &[u8] = b"ab";
        sink.fill(&mut dest, &mut src);

        sink.reset(8);
        assert_eq!(sink.used(), 0);
        assert_eq!(sink.needed(), 8);
    }

    #[test]
    fn snapshot_roundtrip() {
        let mut sink = Sink::new(6);
        let mut dest = [0u8; 6];
        let mut src: &[u8] = b"0041";
        sink.fill(&mut dest, &mut src);

        let mut out = BytesMut::new();
        sink.save(&mut out).unwrap();
        let restored = Sink::load(&mut out.freeze()).unwrap();
        assert_eq!(restored, sink);
    }

    #[test]
    fn snapshot_rejects_cursor_past_capacity() {
        let mut out = BytesMut::new();
        SnapshotSink::put_u32(&mut out, 9).unwrap();
        SnapshotSink::put_u32(&mut out, 4).unwrap();
        assert!(matches!(
            Sink::load(&mut out.freeze()),
            Err(SnapshotError::InvalidField(_))
        ));
    }
}
