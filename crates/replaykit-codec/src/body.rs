//! Reads message bodies in the varbincode layout: unsigned integers as
//! leb128, signed integers as signed leb128, strings and byte buffers as
//! a leb128 length followed by that many bytes.
//!
//! Lengths come straight off the wire, so a buffer is only grown as far
//! as the input actually goes.  A length that runs past the end of the
//! input is an error, never an allocation of the declared size.

use serde::de::{self, DeserializeSeed, Visitor};
use std::fmt::Display;
use std::io::Read;
use thiserror::Error;

#[derive(Error, Debug)]
pub(crate) enum BodyError {
    #[error("{0}")]
    Message(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("leb128 value is too large")]
    Overflow,

    #[error("declares {declared} bytes but only {present} follow")]
    Truncated { declared: u64, present: usize },

    #[error("value out of range for {0}")]
    OutOfRange(&'static str),

    #[error("invalid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("invalid bool encoding {0}")]
    Bool(u8),

    #[error("invalid option tag {0}")]
    OptionTag(u8),

    #[error("{0} cannot appear in a message body")]
    Unsupported(&'static str),
}

impl de::Error for BodyError {
    fn custom<T: Display>(msg: T) -> Self {
        BodyError::Message(msg.to_string())
    }
}

impl From<leb128::read::Error> for BodyError {
    fn from(err: leb128::read::Error) -> Self {
        match err {
            leb128::read::Error::IoError(err) => BodyError::Io(err),
            _ => BodyError::Overflow,
        }
    }
}

type Result<T> = std::result::Result<T, BodyError>;

pub(crate) struct BodyDeserializer<R> {
    reader: R,
}

impl<R: Read> BodyDeserializer<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self { reader }
    }

    fn read_unsigned(&mut self) -> Result<u64> {
        Ok(leb128::read::unsigned(&mut self.reader)?)
    }

    fn read_signed(&mut self) -> Result<i64> {
        Ok(leb128::read::signed(&mut self.reader)?)
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.reader.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    fn read_len(&mut self) -> Result<usize> {
        usize::try_from(self.read_unsigned()?).map_err(|_| BodyError::OutOfRange("usize"))
    }

    fn read_vec(&mut self) -> Result<Vec<u8>> {
        let declared = self.read_unsigned()?;
        let mut buf = Vec::new();
        self.reader.by_ref().take(declared).read_to_end(&mut buf)?;
        if (buf.len() as u64) < declared {
            return Err(BodyError::Truncated {
                declared,
                present: buf.len(),
            });
        }
        Ok(buf)
    }

    fn read_string(&mut self) -> Result<String> {
        Ok(String::from_utf8(self.read_vec()?)?)
    }
}

macro_rules! unsigned {
    ($($method:ident => $visit:ident: $ty:ty),* $(,)?) => {
        $(
            fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
                let value = self.read_unsigned()?;
                let value = <$ty>::try_from(value)
                    .map_err(|_| BodyError::OutOfRange(stringify!($ty)))?;
                visitor.$visit(value)
            }
        )*
    };
}

macro_rules! signed {
    ($($method:ident => $visit:ident: $ty:ty),* $(,)?) => {
        $(
            fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
                let value = self.read_signed()?;
                let value = <$ty>::try_from(value)
                    .map_err(|_| BodyError::OutOfRange(stringify!($ty)))?;
                visitor.$visit(value)
            }
        )*
    };
}

macro_rules! unsupported {
    ($($method:ident),* $(,)?) => {
        $(
            fn $method<V: Visitor<'de>>(self, _visitor: V) -> Result<V::Value> {
                Err(BodyError::Unsupported(stringify!($method)))
            }
        )*
    };
}

impl<'de, R: Read> de::Deserializer<'de> for &mut BodyDeserializer<R> {
    type Error = BodyError;

    unsigned! {
        deserialize_u16 => visit_u16: u16,
        deserialize_u32 => visit_u32: u32,
        deserialize_u64 => visit_u64: u64,
    }

    signed! {
        deserialize_i16 => visit_i16: i16,
        deserialize_i32 => visit_i32: i32,
        deserialize_i64 => visit_i64: i64,
    }

    unsupported! {
        deserialize_any,
        deserialize_f32,
        deserialize_f64,
        deserialize_char,
        deserialize_identifier,
        deserialize_ignored_any,
    }

    fn deserialize_u8<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        visitor.visit_u8(self.read_byte()?)
    }

    fn deserialize_i8<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        visitor.visit_i8(self.read_byte()? as i8)
    }

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.read_byte()? {
            0 => visitor.visit_bool(false),
            1 => visitor.visit_bool(true),
            other => Err(BodyError::Bool(other)),
        }
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        visitor.visit_string(self.read_string()?)
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        visitor.visit_string(self.read_string()?)
    }

    fn deserialize_bytes<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        visitor.visit_byte_buf(self.read_vec()?)
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        visitor.visit_byte_buf(self.read_vec()?)
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.read_byte()? {
            0 => visitor.visit_none(),
            1 => visitor.visit_some(self),
            other => Err(BodyError::OptionTag(other)),
        }
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value> {
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        let remaining = self.read_len()?;
        visitor.visit_seq(Fields {
            de: self,
            remaining,
        })
    }

    fn deserialize_tuple<V: Visitor<'de>>(self, len: usize, visitor: V) -> Result<V::Value> {
        visitor.visit_seq(Fields {
            de: self,
            remaining: len,
        })
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        len: usize,
        visitor: V,
    ) -> Result<V::Value> {
        de::Deserializer::deserialize_tuple(self, len, visitor)
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        let remaining = self.read_len()?;
        visitor.visit_map(Fields {
            de: self,
            remaining,
        })
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value> {
        de::Deserializer::deserialize_tuple(self, fields.len(), visitor)
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        _visitor: V,
    ) -> Result<V::Value> {
        Err(BodyError::Unsupported("deserialize_enum"))
    }

    fn is_human_readable(&self) -> bool {
        false
    }
}

/// Positional access to the elements of a struct, tuple or sequence.
struct Fields<'a, R> {
    de: &'a mut BodyDeserializer<R>,
    remaining: usize,
}

impl<'de, R: Read> de::SeqAccess<'de> for Fields<'_, R> {
    type Error = BodyError;

    fn next_element_seed<T: DeserializeSeed<'de>>(&mut self, seed: T) -> Result<Option<T::Value>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        seed.deserialize(&mut *self.de).map(Some)
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.remaining)
    }
}

impl<'de, R: Read> de::MapAccess<'de> for Fields<'_, R> {
    type Error = BodyError;

    fn next_key_seed<K: DeserializeSeed<'de>>(&mut self, seed: K) -> Result<Option<K::Value>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        seed.deserialize(&mut *self.de).map(Some)
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> Result<V::Value> {
        seed.deserialize(&mut *self.de)
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.remaining)
    }
}
