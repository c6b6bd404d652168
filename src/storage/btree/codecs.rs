//! Key and value serialization plus the key ordering used by the tree.

use std::cmp::Ordering;
use std::fmt;

use crate::types::{Result, TreeError};

/// Trait implemented by key types that can be stored in the tree.
pub trait KeyCodec: Sized {
    /// Encode `key` into `out`.
    fn encode_key(key: &Self, out: &mut Vec<u8>);

    /// Decode a key from its encoded representation.
    fn decode_key(bytes: &[u8]) -> Result<Self>;
}

/// Trait implemented by value types that can be stored in the tree.
pub trait ValCodec: Sized {
    /// Encode `value` into `out`.
    fn encode_val(value: &Self, out: &mut Vec<u8>);

    /// Decode a value from `src`.
    fn decode_val(src: &[u8]) -> Result<Self>;
}

/// Total order over keys used for every search, split and merge decision.
pub trait KeyComparer<K>: Send + Sync {
    /// Compares two keys.
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// Orders keys by their [`Ord`] implementation.
#[derive(Copy, Clone, Debug, Default)]
pub struct NaturalOrder;

impl<K: Ord> KeyComparer<K> for NaturalOrder {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// Orders keys with a closure.
#[derive(Clone)]
pub struct FnComparer<F>(pub F);

impl<F> fmt::Debug for FnComparer<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnComparer")
    }
}

impl<K, F> KeyComparer<K> for FnComparer<F>
where
    F: Fn(&K, &K) -> Ordering + Send + Sync,
{
    fn compare(&self, a: &K, b: &K) -> Ordering {
        (self.0)(a, b)
    }
}

fn fixed<const N: usize>(bytes: &[u8], what: &'static str) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| TreeError::Corruption(what))
}

macro_rules! int_codec {
    ($($ty:ty),*) => {$(
        impl KeyCodec for $ty {
            fn encode_key(key: &Self, out: &mut Vec<u8>) {
                out.extend_from_slice(&key.to_be_bytes());
            }

            fn decode_key(bytes: &[u8]) -> Result<Self> {
                let what = concat!(stringify!($ty), " key length mismatch");
                Ok(<$ty>::from_be_bytes(fixed(bytes, what)?))
            }
        }

        impl ValCodec for $ty {
            fn encode_val(value: &Self, out: &mut Vec<u8>) {
                out.extend_from_slice(&value.to_be_bytes());
            }

            fn decode_val(src: &[u8]) -> Result<Self> {
                let what = concat!(stringify!($ty), " value length mismatch");
                Ok(<$ty>::from_be_bytes(fixed(src, what)?))
            }
        }
    )*};
}

int_codec!(u32, u64, i32, i64);

impl KeyCodec for Vec<u8> {
    fn encode_key(key: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(key);
    }

    fn decode_key(bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }
}

impl ValCodec for Vec<u8> {
    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(value);
    }

    fn decode_val(src: &[u8]) -> Result<Self> {
        Ok(src.to_vec())
    }
}

impl KeyCodec for String {
    fn encode_key(key: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(key.as_bytes());
    }

    fn decode_key(bytes: &[u8]) -> Result<Self> {
        String::from_utf8(bytes.to_vec())
            .map_err(|_| TreeError::Corruption("string key is not utf-8"))
    }
}

impl ValCodec for String {
    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(value.as_bytes());
    }

    fn decode_val(src: &[u8]) -> Result<Self> {
        String::from_utf8(src.to_vec())
            .map_err(|_| TreeError::Corruption("string value is not utf-8"))
    }
}

impl ValCodec for () {
    fn encode_val(_value: &Self, _out: &mut Vec<u8>) {}

    fn decode_val(src: &[u8]) -> Result<Self> {
        if src.is_empty() {
            Ok(())
        } else {
            Err(TreeError::Corruption("unit value carries payload"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_codecs_reject_bad_lengths() -> Result<()> {
        let mut out = Vec::new();
        u64::encode_key(&0x0102_0304_0506_0708, &mut out);
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(u64::decode_key(&out)?, 0x0102_0304_0506_0708);
        assert!(matches!(u64::decode_key(&out[..7]), Err(TreeError::Corruption(_))));
        assert!(i32::decode_val(&[0, 0]).is_err());
        assert_eq!(i64::decode_val(&(-5i64).to_be_bytes())?, -5);
        Ok(())
    }

    #[test]
    fn string_codec_checks_utf8() {
        assert!(String::decode_key(&[0xff, 0xfe]).is_err());
        assert!(<()>::decode_val(&[1]).is_err());
    }

    #[test]
    fn comparers_order_keys() {
        assert_eq!(NaturalOrder.compare(&1u32, &2u32), Ordering::Less);
        let reverse = FnComparer(|a: &u32, b: &u32| b.cmp(a));
        assert_eq!(reverse.compare(&1, &2), Ordering::Greater);
    }
}
