/*
 * Copyright 2024-2025 the redis-steward developers
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! The RESP value model and conversions in and out of it.

use crate::error::{resp, Error};

/// A single RESP value, owning the data read from or written to the server.
///
/// Cloneable so one value can be delivered to several consumers, e.g. every
/// callback subscribed to the same channel.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RespValue {
    /// A null bulk string or null array
    Nil,

    /// Zero or more nested values
    Array(Vec<RespValue>),

    /// In Redis terminology a string is a byte array; clients interpret the
    /// bytes as they see fit
    BulkString(Vec<u8>),

    /// An error reply from the server
    Error(String),

    /// Redis defines integers as signed and 64-bit
    Integer(i64),

    SimpleString(String),
}

impl RespValue {
    /// Turns a server error reply into an `Err`, leaving every other value
    /// untouched.
    pub(crate) fn into_result(self) -> Result<RespValue, Error> {
        match self {
            RespValue::Error(message) => Err(Error::Remote(message)),
            value => Ok(value),
        }
    }

    /// Pushes an argument onto a command under construction.
    ///
    /// Panics when called on anything other than an array.
    pub fn push<T: Into<RespValue>>(&mut self, item: T) {
        match self {
            RespValue::Array(values) => values.push(item.into()),
            _ => panic!("can only push to an array"),
        }
    }

    /// Appends arguments onto a command under construction, for commands
    /// with variable arity such as `rpush`.
    ///
    /// Panics when called on anything other than an array.
    pub fn append<T, I>(mut self, items: I) -> Self
    where
        T: Into<RespValue>,
        I: IntoIterator<Item = T>,
    {
        match &mut self {
            RespValue::Array(values) => values.extend(items.into_iter().map(Into::into)),
            _ => panic!("can only append to an array"),
        }
        self
    }
}

/// Builds a RESP array, usually a command to send.  Every element must
/// satisfy `Into<RespValue>`; mixed element types are fine.
#[macro_export]
macro_rules! resp_array {
    ($($e:expr),* $(,)?) => {
        $crate::protocol::RespValue::Array(vec![
            $(
                $e.into(),
            )*
        ])
    }
}

impl From<String> for RespValue {
    fn from(value: String) -> RespValue {
        RespValue::BulkString(value.into_bytes())
    }
}

impl<'a> From<&'a String> for RespValue {
    fn from(value: &'a String) -> RespValue {
        RespValue::BulkString(value.as_bytes().to_vec())
    }
}

impl<'a> From<&'a str> for RespValue {
    fn from(value: &'a str) -> RespValue {
        RespValue::BulkString(value.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for RespValue {
    fn from(value: Vec<u8>) -> RespValue {
        RespValue::BulkString(value)
    }
}

impl<'a> From<&'a [u8]> for RespValue {
    fn from(value: &'a [u8]) -> RespValue {
        RespValue::BulkString(value.to_vec())
    }
}

// Command arguments travel as bulk strings, so numeric arguments are encoded
// in their textual form rather than as RESP integers.
macro_rules! number_into_resp {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for RespValue {
                fn from(value: $ty) -> RespValue {
                    RespValue::BulkString(value.to_string().into_bytes())
                }
            }
        )*
    };
}

number_into_resp!(i32, i64, u32, u64, usize);

/// Conversion out of a decoded reply.
///
/// Implementing this makes a type a valid result for `CommandClient::send`
/// and friends.  Conversion fails either because the reply shape does not
/// match, or because the reply was a server error.
pub trait FromResp: Sized {
    /// Converts, treating a server error reply as an `Err`.
    fn from_resp(resp: RespValue) -> Result<Self, Error> {
        Self::from_resp_int(resp.into_result()?)
    }

    fn from_resp_int(resp: RespValue) -> Result<Self, Error>;
}

impl FromResp for RespValue {
    fn from_resp_int(value: RespValue) -> Result<RespValue, Error> {
        Ok(value)
    }
}

impl FromResp for String {
    fn from_resp_int(value: RespValue) -> Result<String, Error> {
        match value {
            RespValue::BulkString(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            RespValue::SimpleString(string) => Ok(string),
            other => Err(resp("cannot convert into a string", other)),
        }
    }
}

impl FromResp for Vec<u8> {
    fn from_resp_int(value: RespValue) -> Result<Vec<u8>, Error> {
        match value {
            RespValue::BulkString(bytes) => Ok(bytes),
            other => Err(resp("not a bulk string", other)),
        }
    }
}

impl FromResp for i64 {
    fn from_resp_int(value: RespValue) -> Result<i64, Error> {
        match value {
            RespValue::Integer(i) => Ok(i),
            other => Err(resp("cannot convert into an i64", other)),
        }
    }
}

macro_rules! bounded_integer_from_resp {
    ($($ty:ident),* $(,)?) => {
        $(
            #[allow(clippy::cast_lossless)]
            impl FromResp for $ty {
                fn from_resp_int(value: RespValue) -> Result<Self, Error> {
                    let raw = i64::from_resp_int(value)?;
                    <$ty>::try_from(raw).map_err(|_| {
                        resp(
                            concat!("i64 out of range for ", stringify!($ty)),
                            RespValue::Integer(raw),
                        )
                    })
                }
            }
        )*
    };
}

bounded_integer_from_resp!(isize, usize, i32, u32, u64);

impl FromResp for bool {
    fn from_resp_int(value: RespValue) -> Result<bool, Error> {
        match i64::from_resp_int(value)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(resp(
                "i64 is not a boolean",
                RespValue::Integer(other),
            )),
        }
    }
}

impl FromResp for () {
    fn from_resp_int(value: RespValue) -> Result<(), Error> {
        match value {
            RespValue::SimpleString(string) if string == "OK" => Ok(()),
            other => Err(resp("expected OK", other)),
        }
    }
}

impl<T: FromResp> FromResp for Option<T> {
    fn from_resp_int(value: RespValue) -> Result<Option<T>, Error> {
        match value {
            RespValue::Nil => Ok(None),
            other => Ok(Some(T::from_resp_int(other)?)),
        }
    }
}

impl<T: FromResp> FromResp for Vec<T> {
    fn from_resp_int(value: RespValue) -> Result<Vec<T>, Error> {
        match value {
            RespValue::Array(values) => {
                let mut out = Vec::with_capacity(values.len());
                for value in values {
                    out.push(T::from_resp(value)?);
                }
                Ok(out)
            }
            other => Err(resp("cannot convert into a vector", other)),
        }
    }
}
