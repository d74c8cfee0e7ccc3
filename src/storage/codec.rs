//! Binary encoding of keys and values for persistent strategies.

use crate::{error::io_invalid_data, Error};

/// Types that can be written to and read back from a byte buffer.
///
/// Encodings must be self delimiting: `decode` consumes exactly the bytes produced by
/// `encode` and advances the input slice past them.
pub trait Codec: Sized {
    /// Appends the encoded form of `self` to `buf`.
    fn encode(&self, buf: &mut Vec<u8>);

    /// Decodes a value from the front of `input`, advancing it.
    fn decode(input: &mut &[u8]) -> Result<Self, Error>;
}

#[inline]
pub(crate) fn take<'a>(input: &mut &'a [u8], len: usize) -> Result<&'a [u8], Error> {
    if input.len() < len {
        return Err(io_invalid_data!(
            "Unexpected end of input, needed {len} bytes but only {} remain",
            input.len()
        ));
    }
    let (head, tail) = input.split_at(len);
    *input = tail;
    Ok(head)
}

macro_rules! impl_codec_int {
    ($($t:ty),*) => {$(
        impl Codec for $t {
            #[inline]
            fn encode(&self, buf: &mut Vec<u8>) {
                buf.extend_from_slice(&self.to_le_bytes());
            }

            #[inline]
            fn decode(input: &mut &[u8]) -> Result<Self, Error> {
                let bytes = take(input, std::mem::size_of::<$t>())?;
                Ok(<$t>::from_le_bytes(bytes.try_into().expect("exact length")))
            }
        }
    )*};
}

impl_codec_int!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128);

impl Codec for bool {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(*self as u8);
    }

    fn decode(input: &mut &[u8]) -> Result<Self, Error> {
        match u8::decode(input)? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(io_invalid_data!("Invalid bool byte {b}")),
        }
    }
}

impl Codec for Vec<u8> {
    fn encode(&self, buf: &mut Vec<u8>) {
        (self.len() as u64).encode(buf);
        buf.extend_from_slice(self);
    }

    fn decode(input: &mut &[u8]) -> Result<Self, Error> {
        let len = u64::decode(input)?;
        let len = usize::try_from(len).map_err(|_| io_invalid_data!("Length {len} too large"))?;
        Ok(take(input, len)?.to_vec())
    }
}

impl Codec for String {
    fn encode(&self, buf: &mut Vec<u8>) {
        (self.len() as u64).encode(buf);
        buf.extend_from_slice(self.as_bytes());
    }

    fn decode(input: &mut &[u8]) -> Result<Self, Error> {
        let bytes = Vec::<u8>::decode(input)?;
        String::from_utf8(bytes).map_err(|e| io_invalid_data!("Invalid utf8 string: {e}"))
    }
}

impl<A: Codec, B: Codec> Codec for (A, B) {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.0.encode(buf);
        self.1.encode(buf);
    }

    fn decode(input: &mut &[u8]) -> Result<Self, Error> {
        Ok((A::decode(input)?, B::decode(input)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T: Codec + PartialEq + std::fmt::Debug>(value: T) {
        let mut buf = Vec::new();
        value.encode(&mut buf);
        buf.push(0xAA);
        let mut input = &buf[..];
        assert_eq!(T::decode(&mut input).unwrap(), value);
        assert_eq!(input, &[0xAA]);
    }

    #[test]
    fn encodings_are_self_delimiting() {
        round_trip(u64::MAX);
        round_trip(-5i32);
        round_trip(true);
        round_trip(String::from("héllo"));
        round_trip(vec![1u8, 2, 3]);
        round_trip((7u16, String::from("seven")));
    }

    #[test]
    fn truncated_input_is_invalid_data() {
        let mut buf = Vec::new();
        String::from("truncated").encode(&mut buf);
        buf.truncate(buf.len() - 1);
        let err = String::decode(&mut &buf[..]).unwrap_err();
        assert!(matches!(err, Error::Io(e) if e.kind() == std::io::ErrorKind::InvalidData));
        assert!(bool::decode(&mut &[2u8][..]).is_err());
    }
}
