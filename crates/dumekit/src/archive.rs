//! Typed binary stream over a caller-owned byte buffer.
//!
//! The archive is the wire format for every cross-rank transfer. Sizing is
//! two-pass: serialize once against a counting archive, read the overflow
//! size, allocate, serialize again over the real buffer. Writing into a
//! missing or exhausted buffer never fails; it accumulates the overflow
//! count instead. Primitives travel in host byte order with their natural
//! width (peers share an architecture within one job).

use crate::error::{Error, Result};

enum Cursor<'a> {
    /// First pass: no buffer, every byte lands in the overflow count.
    Count,
    Write(&'a mut [u8]),
    Read(&'a [u8]),
}

pub struct SerializeArchive<'a> {
    cursor: Cursor<'a>,
    pos: usize,
    overflow_size: usize,
    failed: bool,
}

impl<'a> SerializeArchive<'a> {
    /// Counting archive for the sizing pass.
    pub fn counting() -> Self {
        SerializeArchive {
            cursor: Cursor::Count,
            pos: 0,
            overflow_size: 0,
            failed: false,
        }
    }

    pub fn writer(buf: &'a mut [u8]) -> Self {
        SerializeArchive {
            cursor: Cursor::Write(buf),
            pos: 0,
            overflow_size: 0,
            failed: false,
        }
    }

    pub fn reader(buf: &'a [u8]) -> Self {
        SerializeArchive {
            cursor: Cursor::Read(buf),
            pos: 0,
            overflow_size: 0,
            failed: false,
        }
    }

    /// Bytes that did not fit in the buffer (everything, for a counting
    /// archive).
    pub fn overflow_size(&self) -> usize {
        self.overflow_size
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// True when no read failed and no write overflowed.
    pub fn validate_finish(&self) -> bool {
        !self.failed && self.overflow_size == 0
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        match &mut self.cursor {
            Cursor::Count => {
                self.overflow_size += bytes.len();
            }
            Cursor::Write(buf) => {
                let avail = buf.len().saturating_sub(self.pos);
                let n = avail.min(bytes.len());
                buf[self.pos..self.pos + n].copy_from_slice(&bytes[..n]);
                self.pos += n;
                self.overflow_size += bytes.len() - n;
            }
            Cursor::Read(_) => {
                self.failed = true;
            }
        }
    }

    pub fn read_bytes(&mut self, out: &mut [u8]) -> Result<()> {
        match &self.cursor {
            Cursor::Read(buf) => {
                if self.pos + out.len() > buf.len() {
                    self.failed = true;
                    return Err(Error::Deserialize(format!(
                        "read of {} bytes past end (pos {}, len {})",
                        out.len(),
                        self.pos,
                        buf.len()
                    )));
                }
                out.copy_from_slice(&buf[self.pos..self.pos + out.len()]);
                self.pos += out.len();
                Ok(())
            }
            _ => {
                self.failed = true;
                Err(Error::Deserialize("archive is not in read mode".into()))
            }
        }
    }

    /// Fixed-length string: raw bytes truncated to `size`, zero-padded when
    /// shorter.
    pub fn write_str_fixed(&mut self, value: &str, size: usize) {
        let bytes = value.as_bytes();
        let n = bytes.len().min(size);
        self.write_bytes(&bytes[..n]);
        for _ in n..size {
            self.write_bytes(&[0u8]);
        }
    }

    pub fn read_str_fixed(&mut self, size: usize) -> Result<String> {
        let mut raw = vec![0u8; size];
        self.read_bytes(&mut raw)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(size);
        String::from_utf8(raw[..end].to_vec())
            .map_err(|e| Error::Deserialize(format!("invalid utf8 in fixed string: {e}")))
    }

    /// Terminator-driven string: bytes followed by a single NUL.
    pub fn write_str(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
        self.write_bytes(&[0u8]);
    }

    pub fn read_str(&mut self) -> Result<String> {
        let mut out = Vec::new();
        loop {
            let mut ch = [0u8; 1];
            self.read_bytes(&mut ch)?;
            if ch[0] == 0 {
                break;
            }
            out.push(ch[0]);
        }
        String::from_utf8(out)
            .map_err(|e| Error::Deserialize(format!("invalid utf8 in string: {e}")))
    }
}

macro_rules! archive_primitive {
    ($ty:ty, $write:ident, $read:ident) => {
        impl SerializeArchive<'_> {
            pub fn $write(&mut self, value: $ty) {
                self.write_bytes(&value.to_ne_bytes());
            }

            pub fn $read(&mut self) -> Result<$ty> {
                let mut raw = [0u8; size_of::<$ty>()];
                self.read_bytes(&mut raw)?;
                Ok(<$ty>::from_ne_bytes(raw))
            }
        }
    };
}

archive_primitive!(u8, write_u8, read_u8);
archive_primitive!(i32, write_i32, read_i32);
archive_primitive!(u32, write_u32, read_u32);
archive_primitive!(i64, write_i64, read_i64);
archive_primitive!(u64, write_u64, read_u64);
archive_primitive!(f32, write_f32, read_f32);
archive_primitive!(f64, write_f64, read_f64);

/// Composite objects serialize themselves; they are responsible for
/// prefixing counts before element sequences and for checking the archive
/// state after container loops.
pub trait Serializable {
    fn serialize(&self, archive: &mut SerializeArchive<'_>) -> Result<()>;
    fn deserialize(&mut self, archive: &mut SerializeArchive<'_>) -> Result<()>;
}

/// Sizing pass for one object.
pub fn serialized_size<T: Serializable>(value: &T) -> Result<usize> {
    let mut archive = SerializeArchive::counting();
    value.serialize(&mut archive)?;
    Ok(archive.overflow_size())
}

/// Count, allocate, write. The result is exactly sized.
pub fn to_bytes<T: Serializable>(value: &T) -> Result<Vec<u8>> {
    let size = serialized_size(value)?;
    let mut buf = vec![0u8; size];
    let mut archive = SerializeArchive::writer(&mut buf);
    value.serialize(&mut archive)?;
    if !archive.validate_finish() {
        return Err(Error::Serialize(format!(
            "write pass overflowed sized buffer by {} bytes",
            archive.overflow_size()
        )));
    }
    Ok(buf)
}

/// Deserialize into an existing (usually default) object.
pub fn read_into<T: Serializable>(value: &mut T, bytes: &[u8]) -> Result<()> {
    let mut archive = SerializeArchive::reader(bytes);
    value.deserialize(&mut archive)?;
    if !archive.validate_finish() {
        return Err(Error::Deserialize("archive state bad after read".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_pass_never_fails() {
        let mut archive = SerializeArchive::counting();
        archive.write_i32(7);
        archive.write_f64(1.5);
        archive.write_str_fixed("abc", 8);
        assert_eq!(archive.overflow_size(), 4 + 8 + 8);
    }

    #[test]
    fn test_write_then_read_primitives() {
        let mut buf = vec![0u8; 4 + 8 + 8 + 4];
        let mut w = SerializeArchive::writer(&mut buf);
        w.write_i32(-3);
        w.write_u64(42);
        w.write_f64(2.25);
        w.write_f32(0.5);
        assert!(w.validate_finish());

        let mut r = SerializeArchive::reader(&buf);
        assert_eq!(r.read_i32().unwrap(), -3);
        assert_eq!(r.read_u64().unwrap(), 42);
        assert_eq!(r.read_f64().unwrap(), 2.25);
        assert_eq!(r.read_f32().unwrap(), 0.5);
        assert!(r.validate_finish());
    }

    #[test]
    fn test_fixed_string_pads_and_truncates() {
        let mut buf = vec![0u8; 8];
        let mut w = SerializeArchive::writer(&mut buf);
        w.write_str_fixed("hi", 4);
        w.write_str_fixed("overlong", 4);
        let mut r = SerializeArchive::reader(&buf);
        assert_eq!(r.read_str_fixed(4).unwrap(), "hi");
        assert_eq!(r.read_str_fixed(4).unwrap(), "over");
    }

    #[test]
    fn test_nul_terminated_string() {
        let mut buf = vec![0u8; 6];
        let mut w = SerializeArchive::writer(&mut buf);
        w.write_str("hello");
        let mut r = SerializeArchive::reader(&buf);
        assert_eq!(r.read_str().unwrap(), "hello");
    }

    #[test]
    fn test_overflowing_write_is_tracked_not_fatal() {
        let mut buf = vec![0u8; 2];
        let mut w = SerializeArchive::writer(&mut buf);
        w.write_i32(1);
        assert_eq!(w.overflow_size(), 2);
        assert!(!w.validate_finish());
    }

    #[test]
    fn test_read_past_end_sets_fail_state() {
        let buf = [0u8; 2];
        let mut r = SerializeArchive::reader(&buf);
        assert!(r.read_i32().is_err());
        assert!(!r.validate_finish());
    }

    struct Point {
        x: f64,
        tag: u32,
    }

    impl Serializable for Point {
        fn serialize(&self, archive: &mut SerializeArchive<'_>) -> Result<()> {
            archive.write_f64(self.x);
            archive.write_u32(self.tag);
            Ok(())
        }

        fn deserialize(&mut self, archive: &mut SerializeArchive<'_>) -> Result<()> {
            self.x = archive.read_f64()?;
            self.tag = archive.read_u32()?;
            Ok(())
        }
    }

    #[test]
    fn test_two_pass_object_roundtrip() {
        let p = Point { x: -0.75, tag: 9 };
        assert_eq!(serialized_size(&p).unwrap(), 12);
        let bytes = to_bytes(&p).unwrap();
        let mut q = Point { x: 0.0, tag: 0 };
        read_into(&mut q, &bytes).unwrap();
        assert_eq!(q.x, -0.75);
        assert_eq!(q.tag, 9);
    }
}
