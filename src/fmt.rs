//! WebAssembly binary format.

use std::io;

pub mod binary;

/// Error while reading bytes.
///
/// The primary purpose is to determine if the error is because an end of file
/// condition has been encountered.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ReadError {
    /// No more bytes are available.
    #[error("unexpected end of input")]
    Eof,
    /// The underlying reader failed.
    #[error(transparent)]
    Io(io::Error),
}

impl ReadError {
    /// If the error is an end of file condition.
    ///
    /// In some cases, EOF is unexpected, but it can also be used to determine there is no additional input.
    #[inline]
    #[must_use]
    pub(crate) fn is_eof(&self) -> bool {
        matches!(self, Self::Eof)
    }
}

impl From<io::Error> for ReadError {
    fn from(value: io::Error) -> Self {
        if value.kind() == io::ErrorKind::UnexpectedEof {
            Self::Eof
        } else {
            Self::Io(value)
        }
    }
}

/// Trait used to read bytes.
pub(crate) trait Read {
    /// Consumes and returns the next read byte.
    ///
    /// # Errors
    ///
    /// Returns a [`ReadError`] which determines if an EOF condition was reached.
    fn next(&mut self) -> Result<u8, ReadError>;

    /// Returns the next byte but does not consume.
    ///
    /// Repeated peeks (with no [next()][Read::next] call) should return the same byte.
    ///
    /// # Errors
    ///
    /// Returns a [`ReadError`] which determines if an EOF condition was reached.
    fn peek(&mut self) -> Result<u8, ReadError>;

    /// Returns the position in the stream of bytes.
    fn pos(&self) -> u64;

    /// Consumes `count` bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`ReadError`] which determines if an EOF condition was reached.
    fn skip(&mut self, mut count: u64) -> Result<(), ReadError> {
        while count > 0 {
            self.next()?;
            count -= 1;
        }

        Ok(())
    }

    /// Consumes `count` bytes into a new buffer.
    ///
    /// # Errors
    ///
    /// Returns a [`ReadError`] which determines if an EOF condition was reached.
    fn take(&mut self, count: u32) -> Result<Vec<u8>, ReadError> {
        let mut bytes = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            bytes.push(self.next()?);
        }
        Ok(bytes)
    }
}

/// A wrapper to implement this crate's [`Read`] trait for [`std::io::Read`] trait implementations.
#[derive(Debug)]
pub(crate) struct IoRead<R>
where
    R: io::Read,
{
    iter: io::Bytes<R>,
    peeked_byte: Option<u8>,
    byte_offset: u64,
}

impl<R> IoRead<R>
where
    R: io::Read,
{
    /// Instantiates a new reader.
    pub(crate) fn new(reader: R) -> Self {
        IoRead {
            iter: reader.bytes(),
            peeked_byte: None,
            byte_offset: 0,
        }
    }
}

impl<R> Read for IoRead<R>
where
    R: io::Read,
{
    #[inline]
    fn next(&mut self) -> Result<u8, ReadError> {
        let b = self.peek()?;
        self.peeked_byte = None;
        self.byte_offset += 1;
        Ok(b)
    }

    #[inline]
    fn peek(&mut self) -> Result<u8, ReadError> {
        if let Some(b) = self.peeked_byte {
            return Ok(b);
        }
        match self.iter.next() {
            Some(Ok(b)) => {
                self.peeked_byte = Some(b);
                Ok(b)
            }
            Some(Err(err)) => Err(ReadError::from(err)),
            None => Err(ReadError::Eof),
        }
    }

    #[inline]
    fn pos(&self) -> u64 {
        self.byte_offset
    }
}

/// A wrapper to implement this crate's [`Read`] trait for byte slices.
#[derive(Debug)]
pub(crate) struct SliceRead<'a> {
    slice: &'a [u8],
    byte_offset: usize,
}

impl<'a> SliceRead<'a> {
    /// Instantiates a new reader.
    #[must_use]
    pub(crate) fn new(slice: &'a [u8]) -> Self {
        SliceRead {
            slice,
            byte_offset: 0,
        }
    }
}

impl<'a> Read for SliceRead<'a> {
    #[inline]
    fn next(&mut self) -> Result<u8, ReadError> {
        let b = self.peek()?;
        self.byte_offset += 1;
        Ok(b)
    }

    #[inline]
    fn peek(&mut self) -> Result<u8, ReadError> {
        self.slice
            .get(self.byte_offset)
            .copied()
            .ok_or(ReadError::Eof)
    }

    #[inline]
    fn pos(&self) -> u64 {
        self.byte_offset as u64
    }

    fn skip(&mut self, count: u64) -> Result<(), ReadError> {
        let remaining = (self.slice.len() - self.byte_offset) as u64;
        if count > remaining {
            self.byte_offset = self.slice.len();
            return Err(ReadError::Eof);
        }
        self.byte_offset += count as usize;
        Ok(())
    }

    fn take(&mut self, count: u32) -> Result<Vec<u8>, ReadError> {
        let count = count as usize;
        let end = self.byte_offset.checked_add(count).ok_or(ReadError::Eof)?;
        let Some(bytes) = self.slice.get(self.byte_offset..end) else {
            self.byte_offset = self.slice.len();
            return Err(ReadError::Eof);
        };
        self.byte_offset = end;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_read_reports_eof() {
        let mut reader = SliceRead::new(&[0x01, 0x02]);
        assert_eq!(reader.peek().unwrap(), 0x01);
        assert_eq!(reader.next().unwrap(), 0x01);
        assert_eq!(reader.next().unwrap(), 0x02);
        assert_eq!(reader.pos(), 2);
        assert!(reader.next().unwrap_err().is_eof());
    }

    #[test]
    fn skip_past_end_is_eof() {
        let mut reader = SliceRead::new(&[0x01, 0x02, 0x03]);
        reader.skip(2).unwrap();
        assert_eq!(reader.pos(), 2);
        assert!(reader.skip(2).unwrap_err().is_eof());
    }

    #[test]
    fn io_read_matches_slice_read() {
        let bytes = [0x0a, 0x0b, 0x0c, 0x0d];
        let mut io = IoRead::new(&bytes[..]);
        let mut slice = SliceRead::new(&bytes);
        assert_eq!(io.take(3).unwrap(), slice.take(3).unwrap());
        assert_eq!(io.pos(), slice.pos());
        assert_eq!(io.peek().unwrap(), 0x0d);
        assert!(io.take(2).unwrap_err().is_eof());
        assert!(slice.take(2).unwrap_err().is_eof());
    }
}
