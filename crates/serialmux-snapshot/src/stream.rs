use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, SnapshotError};

/// Sanity limit for a single length-prefixed buffer: 16 MiB.
///
/// A snapshot never legitimately contains anything close to this; the limit
/// exists so a corrupt length prefix cannot drive a huge allocation.
pub const MAX_SNAPSHOT_BUFFER: usize = 16 * 1024 * 1024;

/// Write half of a typed snapshot stream.
///
/// Integers are big-endian. Buffers and strings carry a `u32` length prefix.
/// Implementors only provide [`put_raw`](SnapshotSink::put_raw); the typed
/// writers are derived from it.
pub trait SnapshotSink {
    /// Append raw bytes to the stream.
    fn put_raw(&mut self, bytes: &[u8]) -> Result<()>;

    fn put_u8(&mut self, value: u8) -> Result<()> {
        self.put_raw(&[value])
    }

    fn put_u16(&mut self, value: u16) -> Result<()> {
        self.put_raw(&value.to_be_bytes())
    }

    fn put_u32(&mut self, value: u32) -> Result<()> {
        self.put_raw(&value.to_be_bytes())
    }

    fn put_u64(&mut self, value: u64) -> Result<()> {
        self.put_raw(&value.to_be_bytes())
    }

    fn put_i32(&mut self, value: i32) -> Result<()> {
        self.put_raw(&value.to_be_bytes())
    }

    /// Write a length-prefixed buffer.
    fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > MAX_SNAPSHOT_BUFFER {
            return Err(SnapshotError::BufferTooLarge {
                size: bytes.len(),
                max: MAX_SNAPSHOT_BUFFER,
            });
        }
        self.put_u32(bytes.len() as u32)?;
        self.put_raw(bytes)
    }

    /// Write a length-prefixed UTF-8 string.
    fn put_str(&mut self, value: &str) -> Result<()> {
        self.put_bytes(value.as_bytes())
    }
}

/// Read half of a typed snapshot stream. Mirror of [`SnapshotSink`].
pub trait SnapshotSource {
    /// Fill `dest` from the stream, failing if it runs out.
    fn get_raw(&mut self, dest: &mut [u8]) -> Result<()>;

    fn get_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.get_raw(&mut buf)?;
        Ok(buf[0])
    }

    fn get_u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.get_raw(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn get_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.get_raw(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn get_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.get_raw(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    fn get_i32(&mut self) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.get_raw(&mut buf)?;
        Ok(i32::from_be_bytes(buf))
    }

    /// Read a length-prefixed buffer.
    fn get_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        if len > MAX_SNAPSHOT_BUFFER {
            return Err(SnapshotError::BufferTooLarge {
                size: len,
                max: MAX_SNAPSHOT_BUFFER,
            });
        }
        let mut buf = vec![0u8; len];
        self.get_raw(&mut buf)?;
        Ok(buf)
    }

    /// Read a length-prefixed UTF-8 string.
    fn get_str(&mut self) -> Result<String> {
        String::from_utf8(self.get_bytes()?).map_err(|_| SnapshotError::InvalidString)
    }
}

impl SnapshotSink for BytesMut {
    fn put_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.put_slice(bytes);
        Ok(())
    }
}

impl SnapshotSource for Bytes {
    fn get_raw(&mut self, dest: &mut [u8]) -> Result<()> {
        if self.remaining() < dest.len() {
            return Err(SnapshotError::Truncated {
                needed: dest.len() - self.remaining(),
            });
        }
        self.copy_to_slice(dest);
        Ok(())
    }
}

/// Adapter writing snapshot data to any `std::io::Write`.
pub struct IoSink<W> {
    inner: W,
}

impl<W: Write> IoSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Consume the adapter and return the inner stream.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> SnapshotSink for IoSink<W> {
    fn put_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes)?;
        Ok(())
    }
}

/// Adapter reading snapshot data from any `std::io::Read`.
pub struct IoSource<R> {
    inner: R,
}

impl<R: Read> IoSource<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Consume the adapter and return the inner stream.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> SnapshotSource for IoSource<R> {
    fn get_raw(&mut self, dest: &mut [u8]) -> Result<()> {
        self.inner.read_exact(dest)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn integer_roundtrip() {
        let mut sink = BytesMut::new();
        SnapshotSink::put_u8(&mut sink,0xab).unwrap();
        SnapshotSink::put_u16(&mut sink,0x1234).unwrap();
        SnapshotSink::put_u32(&mut sink,0xdead_beef).unwrap();
        SnapshotSink::put_u64(&mut sink,0x0102_0304_0506_0708).unwrap();
        SnapshotSink::put_i32(&mut sink,-42).unwrap();

        let mut source = sink.freeze();
        assert_eq!(SnapshotSource::get_u8(&mut source).unwrap(), 0xab);
        assert_eq!(SnapshotSource::get_u16(&mut source).unwrap(), 0x1234);
        assert_eq!(SnapshotSource::get_u32(&mut source).unwrap(), 0xdead_beef);
        assert_eq!(SnapshotSource::get_u64(&mut source).unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(SnapshotSource::get_i32(&mut source).unwrap(), -42);
    }

    #[test]
    fn buffer_and_string_roundtrip() {
        let mut sink = BytesMut::new();
        SnapshotSink::put_bytes(&mut sink,b"payload").unwrap();
        sink.put_str("gps").unwrap();
        SnapshotSink::put_bytes(&mut sink,b"").unwrap();

        let mut source = sink.freeze();
        assert_eq!(source.get_bytes().unwrap(), b"payload");
        assert_eq!(source.get_str().unwrap(), "gps");
        assert!(source.get_bytes().unwrap().is_empty());
    }

    #[test]
    fn integers_are_big_endian() {
        let mut sink = BytesMut::new();
        SnapshotSink::put_u32(&mut sink,0x0102_0304).unwrap();
        assert_eq!(sink.as_ref(), &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn truncated_stream_reports_missing_bytes() {
        let mut source = Bytes::from_static(&[0x00, 0x01]);
        let err = SnapshotSource::get_u32(&mut source).unwrap_err();
        assert!(matches!(err, SnapshotError::Truncated { needed: 2 }));
    }

    #[test]
    fn truncated_buffer_fails() {
        let mut sink = BytesMut::new();
        SnapshotSink::put_u32(&mut sink,10).unwrap();
        sink.put_raw(b"short").unwrap();

        let mut source = sink.freeze();
        assert!(matches!(
            source.get_bytes(),
            Err(SnapshotError::Truncated { .. })
        ));
    }

    #[test]
    fn oversized_buffer_length_rejected() {
        let mut sink = BytesMut::new();
        SnapshotSink::put_u32(&mut sink,u32::MAX).unwrap();

        let mut source = sink.freeze();
        assert!(matches!(
            source.get_bytes(),
            Err(SnapshotError::BufferTooLarge { .. })
        ));
    }

    #[test]
    fn non_utf8_string_rejected() {
        let mut sink = BytesMut::new();
        SnapshotSink::put_bytes(&mut sink,&[0xff, 0xfe]).unwrap();

        let mut source = sink.freeze();
        assert!(matches!(source.get_str(), Err(SnapshotError::InvalidString)));
    }

    #[test]
    fn io_adapters_roundtrip() {
        let mut sink = IoSink::new(Vec::new());
        SnapshotSink::put_u32(&mut sink,7).unwrap();
        sink.put_str("modem").unwrap();

        let wire = sink.into_inner();
        let mut source = IoSource::new(Cursor::new(wire));
        assert_eq!(SnapshotSource::get_u32(&mut source).unwrap(), 7);
        assert_eq!(source.get_str().unwrap(), "modem");
    }

    #[test]
    fn io_source_eof_is_error() {
        let mut source = IoSource::new(Cursor::new(Vec::<u8>::new()));
        assert!(matches!(SnapshotSource::get_u8(&mut source), Err(SnapshotError::Io(_))));
    }
}
