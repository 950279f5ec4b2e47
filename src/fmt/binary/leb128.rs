//! LEB128 and fixed width integer decoding.
//!
//! The streaming `read_*` functions are used by the module decoder. The
//! `decode_*` functions operate on byte slices and report how many bytes were
//! consumed.

use crate::fmt::{binary::DecodeError, Read, SliceRead};

macro_rules! read_unsigned_leb128 {
    ($func:ident, $num_ty:ty, $bits:literal) => {
        /// Reads an unsigned LEB128 number.
        pub(crate) fn $func<R>(reader: &mut R) -> Result<$num_ty, DecodeError>
        where
            R: Read,
        {
            const BITS: u32 = $bits;

            let n = reader.next()?;
            if n & 0x80 == 0 {
                return Ok(<$num_ty>::from(n));
            }

            let mut result = <$num_ty>::from(n & 0x7f);
            let mut shift = 7;
            loop {
                let n = reader.next()?;

                // Last permitted byte: no continuation bit and no bits beyond
                // the width of the number.
                if shift == BITS - (BITS % 7) && n >= 1 << (BITS % 7) {
                    return Err(DecodeError::Overflow);
                }

                if n & 0x80 == 0 {
                    result |= <$num_ty>::from(n) << shift;
                    return Ok(result);
                }

                result |= <$num_ty>::from(n & 0x7f) << shift;
                shift += 7;
            }
        }
    };
}

read_unsigned_leb128!(read_u32, u32, 32);
read_unsigned_leb128!(read_u64, u64, 64);

macro_rules! read_signed_leb128 {
    ($func:ident, $num_ty:ty, $bits:literal) => {
        /// Reads a signed LEB128 number.
        pub(crate) fn $func<R>(reader: &mut R) -> Result<$num_ty, DecodeError>
        where
            R: Read,
        {
            const BITS: u32 = $bits;

            let mut result = 0;
            let mut shift = 0;
            let mut n;

            loop {
                n = reader.next()?;
                let more = n & 0x80 != 0;

                // In the last permitted byte the unused high bits must all
                // equal the sign bit, and there must be no continuation.
                if shift == BITS - (BITS % 7) {
                    let mask = ((-1i8 << ((BITS % 7).saturating_sub(1))) & 0x7f) as u8;
                    if more || (n & mask != 0 && n & mask != mask) {
                        return Err(DecodeError::Overflow);
                    }
                }

                result |= <$num_ty>::from(n & 0x7f) << shift;
                shift += 7;

                if !more {
                    break;
                }
            }

            if shift < <$num_ty>::BITS && n & 0x40 != 0 {
                result |= -1 << shift;
            }

            Ok(result)
        }
    };
}

read_signed_leb128!(read_s32, i32, 32);
read_signed_leb128!(read_s33, i64, 33);
read_signed_leb128!(read_s64, i64, 64);

/// Reads a 4 byte little endian number.
pub(crate) fn read_u32_le<R>(reader: &mut R) -> Result<u32, DecodeError>
where
    R: Read,
{
    let mut bytes = [0; 4];
    for b in &mut bytes {
        *b = reader.next()?;
    }
    Ok(u32::from_le_bytes(bytes))
}

/// Reads an 8 byte little endian number.
pub(crate) fn read_u64_le<R>(reader: &mut R) -> Result<u64, DecodeError>
where
    R: Read,
{
    let mut bytes = [0; 8];
    for b in &mut bytes {
        *b = reader.next()?;
    }
    Ok(u64::from_le_bytes(bytes))
}

macro_rules! decode_slice {
    ($func:ident, $read:ident, $num_ty:ty, $doc:literal) => {
        #[doc = $doc]
        ///
        /// Returns the value and the number of bytes consumed.
        ///
        /// # Errors
        ///
        /// Returns [`DecodeError::UnexpectedEof`] if the input ends before the
        /// number does and [`DecodeError::Overflow`] if the encoding is too
        /// long or does not fit.
        pub fn $func(bytes: &[u8]) -> Result<($num_ty, usize), DecodeError> {
            let mut reader = SliceRead::new(bytes);
            let value = $read(&mut reader)?;
            Ok((value, reader.pos() as usize))
        }
    };
}

decode_slice!(decode_u32, read_u32, u32, "Decodes an unsigned 32-bit LEB128 number.");
decode_slice!(decode_u64, read_u64, u64, "Decodes an unsigned 64-bit LEB128 number.");
decode_slice!(decode_i32, read_s32, i32, "Decodes a signed 32-bit LEB128 number.");
decode_slice!(decode_i64, read_s64, i64, "Decodes a signed 64-bit LEB128 number.");

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use proptest::prelude::*;

    macro_rules! encode_unsigned_leb128 {
        ($func:ident, $num_ty:ty) => {
            /// Encodes a number to an unsigned LEB128 format.
            pub(crate) fn $func(mut value: $num_ty) -> Vec<u8> {
                let mut result = Vec::new();

                loop {
                    let mut b = u8::try_from(value & 0x7f).unwrap();
                    value >>= 7;

                    let done = value == 0;

                    if !done {
                        b |= 0x80;
                    }
                    result.push(b);

                    if done {
                        return result;
                    }
                }
            }
        };
    }

    encode_unsigned_leb128!(encode_u32, u32);
    encode_unsigned_leb128!(encode_u64, u64);

    macro_rules! encode_signed_leb128 {
        ($func:ident, $num_ty:ty) => {
            /// Encodes a number to a signed LEB128 format.
            pub(crate) fn $func(mut value: $num_ty) -> Vec<u8> {
                let mut result = Vec::new();

                loop {
                    let b = u8::try_from(value & 0x7f).unwrap();
                    value >>= 7;

                    if (value == 0 && b & 0x40 == 0) || (value == -1 && (b & 0x40) != 0) {
                        result.push(b);
                        return result;
                    }

                    result.push(b | 0x80);
                }
            }
        };
    }

    encode_signed_leb128!(encode_s32, i32);
    encode_signed_leb128!(encode_s64, i64);

    #[test]
    fn test_decode_u32() {
        assert_eq!(
            decode_u32(&[0xff, 0xff, 0xff, 0xff, 0x0f]).unwrap(),
            (u32::MAX, 5)
        );
        assert_eq!(decode_u32(&[0x00]).unwrap(), (0, 1));
        assert_eq!(decode_u32(&[0xe5, 0x8e, 0x26]).unwrap(), (624_485, 3));

        // Padded encodings are accepted.
        assert_eq!(decode_u32(&[0x80, 0x80, 0x80, 0x80, 0x00]).unwrap(), (0, 5));
    }

    #[test]
    fn test_decode_u32_errors() {
        // The fifth byte must not have a continuation bit.
        assert!(matches!(
            decode_u32(&[0xff, 0xff, 0xff, 0xff, 0x8f]),
            Err(DecodeError::Overflow)
        ));
        assert!(matches!(
            decode_u32(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x00]),
            Err(DecodeError::Overflow)
        ));

        // 0x10 would be shifted out of a 32-bit value.
        assert!(matches!(
            decode_u32(&[0xff, 0xff, 0xff, 0xff, 0x1f]),
            Err(DecodeError::Overflow)
        ));

        assert!(matches!(
            decode_u32(&[0xff, 0xff]),
            Err(DecodeError::UnexpectedEof)
        ));
        assert!(matches!(decode_u32(&[]), Err(DecodeError::UnexpectedEof)));
    }

    #[test]
    fn test_decode_u64() {
        assert_eq!(
            decode_u64(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01]).unwrap(),
            (u64::MAX, 10)
        );
        assert!(matches!(
            decode_u64(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x02]),
            Err(DecodeError::Overflow)
        ));
    }

    #[test]
    fn test_decode_i32() {
        assert_eq!(
            decode_i32(&[0xff, 0xff, 0xff, 0xff, 0x07]).unwrap(),
            (i32::MAX, 5)
        );
        assert_eq!(
            decode_i32(&[0x80, 0x80, 0x80, 0x80, 0x78]).unwrap(),
            (i32::MIN, 5)
        );
        assert_eq!(decode_i32(&[0x7f]).unwrap(), (-1, 1));
        assert_eq!(decode_i32(&[0x40]).unwrap(), (-64, 1));
        assert_eq!(decode_i32(&[0xc0, 0x7f]).unwrap(), (-64, 2));
        assert_eq!(decode_i32(&[0xc0, 0xbb, 0x78]).unwrap(), (-123_456, 3));
    }

    #[test]
    fn test_decode_i32_errors() {
        assert!(matches!(
            decode_i32(&[0x80, 0x80, 0x80, 0x80, 0x80]),
            Err(DecodeError::Overflow)
        ));

        // The sign bit is set but not extended (final byte should be 0x78).
        assert!(matches!(
            decode_i32(&[0x80, 0x80, 0x80, 0x80, 0x08]),
            Err(DecodeError::Overflow)
        ));
        assert!(matches!(
            decode_i32(&[0x80, 0x80, 0x80, 0x80, 0x38]),
            Err(DecodeError::Overflow)
        ));
    }

    #[test]
    fn test_read_s33() {
        let read = |bytes: &[u8]| read_s33(&mut SliceRead::new(bytes));

        assert_eq!(
            read(&[0xff, 0xff, 0xff, 0xff, 0x0f]).unwrap(),
            i64::from(u32::MAX)
        );
        assert_eq!(
            read(&[0x80, 0x80, 0x80, 0x80, 0x70]).unwrap(),
            i64::from(i32::MIN) * 2
        );
        assert_eq!(read(&[0x40]).unwrap(), -64);
        assert!(matches!(
            read(&[0x80, 0x80, 0x80, 0x80, 0x10]),
            Err(DecodeError::Overflow)
        ));
    }

    #[test]
    fn test_decode_i64() {
        assert_eq!(
            decode_i64(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00]).unwrap(),
            (i64::MAX, 10)
        );
        assert_eq!(
            decode_i64(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x7f]).unwrap(),
            (i64::MIN, 10)
        );
        assert!(matches!(
            decode_i64(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x08]),
            Err(DecodeError::Overflow)
        ));
    }

    #[test]
    fn test_read_le() {
        let bytes = [0x78, 0x56, 0x34, 0x12, 0xef, 0xcd, 0xab, 0x90];
        assert_eq!(
            read_u32_le(&mut SliceRead::new(&bytes)).unwrap(),
            0x1234_5678
        );
        assert_eq!(
            read_u64_le(&mut SliceRead::new(&bytes)).unwrap(),
            0x90ab_cdef_1234_5678
        );
        assert!(matches!(
            read_u64_le(&mut SliceRead::new(&bytes[..7])),
            Err(DecodeError::UnexpectedEof)
        ));
    }

    proptest! {
        #[allow(clippy::ignored_unit_patterns)]
        #[test]
        fn test_encode_decode_u32(n in any::<u32>()) {
            let bytes = encode_u32(n);
            let (value, len) = decode_u32(&bytes).unwrap();
            prop_assert_eq!(value, n);
            prop_assert_eq!(len, bytes.len());
        }

        #[allow(clippy::ignored_unit_patterns)]
        #[test]
        fn test_encode_decode_i32(n in any::<i32>()) {
            let bytes = encode_s32(n);
            let (value, len) = decode_i32(&bytes).unwrap();
            prop_assert_eq!(value, n);
            prop_assert_eq!(len, bytes.len());
        }

        #[allow(clippy::ignored_unit_patterns)]
        #[test]
        fn test_encode_decode_i64(n in any::<i64>()) {
            let bytes = encode_s64(n);
            let (value, len) = decode_i64(&bytes).unwrap();
            prop_assert_eq!(value, n);
            prop_assert_eq!(len, bytes.len());
        }

        #[allow(clippy::ignored_unit_patterns)]
        #[test]
        fn test_long_u32_encoding_overflows(
            prefix in prop::array::uniform5(0x80u8..=0xff),
            rest in prop::collection::vec(any::<u8>(), 1..4),
        ) {
            let mut bytes = prefix.to_vec();
            bytes.extend(rest);
            prop_assert!(matches!(decode_u32(&bytes), Err(DecodeError::Overflow)));
        }
    }
}
