#![forbid(unsafe_code)]
//! Element serializers for perseq containers.
//!
//! A [`Serializer`] turns values of one type into bytes and back through
//! `std::io` streams. Containers use [`Serializer::fixed_size`] to choose
//! block layouts: a fixed-size serializer lets a container preallocate
//! power-of-two blocks, a variable-size one forces dynamic allocation.
//!
//! Containers never hand serializers absent values; storing "no element"
//! is the container's concern and happens outside the serialized payload.
//!
//! [`default_serializer`] picks the built-in serializer for a primitive
//! type. Types without a built-in use [`BincodeSerializer`], which
//! handles anything implementing serde's traits.

use perseq_error::{PerseqError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use std::marker::PhantomData;

/// Byte-level codec for values of type `E`.
///
/// Serializers are stateless from the caller's perspective; the same
/// serializer may be used for any number of values.
pub trait Serializer<E> {
    /// `Some(n)` when every value serializes to exactly `n` bytes.
    fn fixed_size(&self) -> Option<u64> {
        None
    }

    /// Exact number of bytes `value` will serialize to.
    fn serialized_size(&self, value: &E) -> Result<u64>;

    /// Writes the serialized form of `value` to `out`.
    fn serialize(&self, value: &E, out: &mut dyn Write) -> Result<()>;

    /// Reads one value back from `input`.
    fn deserialize(&self, input: &mut dyn Read) -> Result<E>;
}

macro_rules! fixed_width_serializer {
    ($name:ident, $ty:ty, $width:expr, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl Serializer<$ty> for $name {
            fn fixed_size(&self) -> Option<u64> {
                Some($width)
            }

            fn serialized_size(&self, _value: &$ty) -> Result<u64> {
                Ok($width)
            }

            fn serialize(&self, value: &$ty, out: &mut dyn Write) -> Result<()> {
                out.write_all(&value.to_be_bytes())?;
                Ok(())
            }

            fn deserialize(&self, input: &mut dyn Read) -> Result<$ty> {
                let mut bytes = [0u8; $width];
                input.read_exact(&mut bytes)?;
                Ok(<$ty>::from_be_bytes(bytes))
            }
        }
    };
}

fixed_width_serializer!(ByteSerializer, u8, 1, "Single bytes.");
fixed_width_serializer!(I16Serializer, i16, 2, "Big-endian 16-bit integers.");
fixed_width_serializer!(U16Serializer, u16, 2, "Big-endian 16-bit code units.");
fixed_width_serializer!(I32Serializer, i32, 4, "Big-endian 32-bit integers.");
fixed_width_serializer!(I64Serializer, i64, 8, "Big-endian 64-bit integers.");
fixed_width_serializer!(F32Serializer, f32, 4, "Big-endian IEEE-754 single floats.");
fixed_width_serializer!(F64Serializer, f64, 8, "Big-endian IEEE-754 double floats.");

/// Booleans as one byte, any non-zero value reading back as `true`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoolSerializer;

impl Serializer<bool> for BoolSerializer {
    fn fixed_size(&self) -> Option<u64> {
        Some(1)
    }

    fn serialized_size(&self, _value: &bool) -> Result<u64> {
        Ok(1)
    }

    fn serialize(&self, value: &bool, out: &mut dyn Write) -> Result<()> {
        out.write_all(&[u8::from(*value)])?;
        Ok(())
    }

    fn deserialize(&self, input: &mut dyn Read) -> Result<bool> {
        let mut byte = [0u8; 1];
        input.read_exact(&mut byte)?;
        Ok(byte[0] != 0)
    }
}

fn length_prefix(len: usize) -> Result<i32> {
    i32::try_from(len)
        .map_err(|_| PerseqError::Serialization(format!("payload of {len} bytes exceeds i32 length prefix")))
}

/// Byte arrays as a big-endian `i32` length prefix followed by the bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteArraySerializer;

impl Serializer<Vec<u8>> for ByteArraySerializer {
    fn serialized_size(&self, value: &Vec<u8>) -> Result<u64> {
        Ok(4 + value.len() as u64)
    }

    fn serialize(&self, value: &Vec<u8>, out: &mut dyn Write) -> Result<()> {
        out.write_all(&length_prefix(value.len())?.to_be_bytes())?;
        out.write_all(value)?;
        Ok(())
    }

    fn deserialize(&self, input: &mut dyn Read) -> Result<Vec<u8>> {
        let mut prefix = [0u8; 4];
        input.read_exact(&mut prefix)?;
        let len = i32::from_be_bytes(prefix);
        let len = usize::try_from(len)
            .map_err(|_| PerseqError::Serialization(format!("negative length prefix {len}")))?;
        let mut value = vec![0u8; len];
        input.read_exact(&mut value)?;
        Ok(value)
    }
}

/// Strings as a big-endian `i32` byte-length prefix followed by UTF-8.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl Serializer<String> for StringSerializer {
    fn serialized_size(&self, value: &String) -> Result<u64> {
        Ok(4 + value.len() as u64)
    }

    fn serialize(&self, value: &String, out: &mut dyn Write) -> Result<()> {
        out.write_all(&length_prefix(value.len())?.to_be_bytes())?;
        out.write_all(value.as_bytes())?;
        Ok(())
    }

    fn deserialize(&self, input: &mut dyn Read) -> Result<String> {
        let mut prefix = [0u8; 4];
        input.read_exact(&mut prefix)?;
        let len = i32::from_be_bytes(prefix);
        let len = usize::try_from(len)
            .map_err(|_| PerseqError::Serialization(format!("negative length prefix {len}")))?;
        let mut bytes = vec![0u8; len];
        input.read_exact(&mut bytes)?;
        String::from_utf8(bytes)
            .map_err(|err| PerseqError::Serialization(format!("invalid UTF-8 payload: {err}")))
    }
}

/// Fallback serializer for any serde-compatible type.
#[derive(Debug, Clone, Copy)]
pub struct BincodeSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for BincodeSerializer<T> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> Serializer<T> for BincodeSerializer<T> {
    fn serialized_size(&self, value: &T) -> Result<u64> {
        bincode::serialized_size(value)
            .map_err(|err| PerseqError::Serialization(err.to_string()))
    }

    fn serialize(&self, value: &T, out: &mut dyn Write) -> Result<()> {
        bincode::serialize_into(out, value)
            .map_err(|err| PerseqError::Serialization(err.to_string()))
    }

    fn deserialize(&self, input: &mut dyn Read) -> Result<T> {
        bincode::deserialize_from(input)
            .map_err(|err| PerseqError::Serialization(err.to_string()))
    }
}

/// Types with a built-in serializer.
///
/// This is the registry mapping type identities to serializers: calling
/// [`default_serializer`] (or `T::serializer()`) picks the most efficient
/// codec for `T` at compile time.
pub trait DefaultSerializer: Sized {
    /// The serializer type selected for `Self`.
    type Serializer: Serializer<Self> + Default;

    /// An instance of the selected serializer.
    #[must_use]
    fn serializer() -> Self::Serializer {
        Self::Serializer::default()
    }
}

/// The built-in serializer for `E`.
#[must_use]
pub fn default_serializer<E: DefaultSerializer>() -> E::Serializer {
    E::serializer()
}

macro_rules! default_serializer_impl {
    ($ty:ty, $serializer:ty) => {
        impl DefaultSerializer for $ty {
            type Serializer = $serializer;
        }
    };
}

default_serializer_impl!(bool, BoolSerializer);
default_serializer_impl!(u8, ByteSerializer);
default_serializer_impl!(i16, I16Serializer);
default_serializer_impl!(u16, U16Serializer);
default_serializer_impl!(i32, I32Serializer);
default_serializer_impl!(i64, I64Serializer);
default_serializer_impl!(f32, F32Serializer);
default_serializer_impl!(f64, F64Serializer);
default_serializer_impl!(Vec<u8>, ByteArraySerializer);
default_serializer_impl!(String, StringSerializer);
