/*
 * Copyright 2024-2025 the redis-steward developers
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Framing between [`RespValue`]s and bytes on the wire.
//!
//! Decoding is incremental: a partial frame leaves the buffer untouched and
//! yields `None`, so the reader restarts cleanly however the bytes arrive.

use std::str;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;

use super::resp::RespValue;

/// The RESP codec; plugs into `tokio_util`'s `Framed` transport.
pub(crate) struct RespCodec;

impl Encoder<RespValue> for RespCodec {
    type Error = Error;

    fn encode(&mut self, value: RespValue, dst: &mut BytesMut) -> Result<(), Error> {
        write_value(value, dst);
        Ok(())
    }
}

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RespValue>, Error> {
        let (value, consumed) = {
            let mut cursor = Cursor::new(&buf[..]);
            match parse_value(&mut cursor)? {
                Some(value) => (value, cursor.pos),
                None => return Ok(None),
            }
        };
        buf.advance(consumed);
        Ok(Some(value))
    }
}

fn write_crlf(dst: &mut BytesMut) {
    dst.put_slice(b"\r\n");
}

fn write_header(prefix: u8, len: i64, dst: &mut BytesMut) {
    dst.put_u8(prefix);
    dst.put_slice(len.to_string().as_bytes());
    write_crlf(dst);
}

fn write_value(value: RespValue, dst: &mut BytesMut) {
    match value {
        RespValue::Nil => write_header(b'$', -1, dst),
        RespValue::SimpleString(string) => {
            dst.put_u8(b'+');
            dst.put_slice(string.as_bytes());
            write_crlf(dst);
        }
        RespValue::Error(message) => {
            dst.put_u8(b'-');
            dst.put_slice(message.as_bytes());
            write_crlf(dst);
        }
        RespValue::Integer(value) => write_header(b':', value, dst),
        RespValue::BulkString(bytes) => {
            write_header(b'$', bytes.len() as i64, dst);
            dst.put_slice(&bytes);
            write_crlf(dst);
        }
        RespValue::Array(values) => {
            write_header(b'*', values.len() as i64, dst);
            for value in values {
                write_value(value, dst);
            }
        }
    }
}

/// A read position over the undecoded buffer.  Nothing is consumed from the
/// real buffer until a whole value has parsed.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn take_byte(&mut self) -> Option<u8> {
        let byte = self.buf.get(self.pos).copied()?;
        self.pos += 1;
        Some(byte)
    }

    /// The bytes up to the next CRLF, consuming the terminator too.  `None`
    /// until the terminator has arrived.
    fn take_line(&mut self) -> Option<&'a [u8]> {
        let buf = self.buf;
        let start = self.pos;
        let mut at = start;
        while at + 1 < buf.len() {
            if buf[at] == b'\r' && buf[at + 1] == b'\n' {
                self.pos = at + 2;
                return Some(&buf[start..at]);
            }
            at += 1;
        }
        None
    }

    fn take_exact(&mut self, len: usize) -> Option<&'a [u8]> {
        let buf = self.buf;
        if buf.len() - self.pos < len {
            return None;
        }
        let slice = &buf[self.pos..self.pos + len];
        self.pos += len;
        Some(slice)
    }
}

/// Lengths and integer replies share one textual form: an optional minus
/// sign and decimal digits, CRLF-terminated.
fn parse_integer_line(cursor: &mut Cursor) -> Result<Option<i64>, Error> {
    let Some(line) = cursor.take_line() else {
        return Ok(None);
    };
    let text = str::from_utf8(line)
        .map_err(|_| Error::RESP(format!("integer is not valid UTF-8: {:?}", line), None))?;
    let value = text
        .parse()
        .map_err(|_| Error::RESP(format!("not an integer: {}", text), None))?;
    Ok(Some(value))
}

fn parse_bulk_string(cursor: &mut Cursor) -> Result<Option<RespValue>, Error> {
    let Some(len) = parse_integer_line(cursor)? else {
        return Ok(None);
    };
    match len {
        -1 => Ok(Some(RespValue::Nil)),
        len if len >= 0 => {
            let Some(bytes) = cursor.take_exact(len as usize) else {
                return Ok(None);
            };
            let value = RespValue::BulkString(bytes.to_vec());
            match cursor.take_exact(2) {
                None => Ok(None),
                Some(b"\r\n") => Ok(Some(value)),
                Some(tail) => Err(Error::RESP(
                    format!("bulk string not CRLF-terminated: {:?}", tail),
                    None,
                )),
            }
        }
        len => Err(Error::RESP(format!("invalid bulk string length: {}", len), None)),
    }
}

fn parse_array(cursor: &mut Cursor) -> Result<Option<RespValue>, Error> {
    let Some(len) = parse_integer_line(cursor)? else {
        return Ok(None);
    };
    match len {
        -1 => Ok(Some(RespValue::Nil)),
        len if len >= 0 => {
            let mut values = Vec::with_capacity(len as usize);
            for _ in 0..len {
                match parse_value(cursor)? {
                    Some(value) => values.push(value),
                    None => return Ok(None),
                }
            }
            Ok(Some(RespValue::Array(values)))
        }
        len => Err(Error::RESP(format!("invalid array length: {}", len), None)),
    }
}

fn parse_value(cursor: &mut Cursor) -> Result<Option<RespValue>, Error> {
    let Some(prefix) = cursor.take_byte() else {
        return Ok(None);
    };
    match prefix {
        b'+' => Ok(cursor
            .take_line()
            .map(|line| RespValue::SimpleString(String::from_utf8_lossy(line).into_owned()))),
        b'-' => Ok(cursor
            .take_line()
            .map(|line| RespValue::Error(String::from_utf8_lossy(line).into_owned()))),
        b':' => Ok(parse_integer_line(cursor)?.map(RespValue::Integer)),
        b'$' => parse_bulk_string(cursor),
        b'*' => parse_array(cursor),
        other => Err(Error::RESP(format!("unexpected frame prefix: {}", other), None)),
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    use crate::protocol::resp::RespValue;

    use super::RespCodec;

    fn encode(value: RespValue) -> BytesMut {
        let mut bytes = BytesMut::new();
        RespCodec.encode(value, &mut bytes).unwrap();
        bytes
    }

    fn decode(bytes: &mut BytesMut) -> Option<RespValue> {
        RespCodec.decode(bytes).unwrap()
    }

    #[test]
    fn commands_encode_as_arrays_of_bulk_strings() {
        let bytes = encode(resp_array!["set", "x", "1"]);
        assert_eq!(&b"*3\r\n$3\r\nset\r\n$1\r\nx\r\n$1\r\n1\r\n"[..], &bytes[..]);
    }

    #[test]
    fn bulk_string_length_counts_bytes_not_characters() {
        let bytes = encode(resp_array!["set", "k", "déjà"]);
        assert_eq!(&b"*3\r\n$3\r\nset\r\n$1\r\nk\r\n$6\r\nd\xc3\xa9j\xc3\xa0\r\n"[..], &bytes[..]);
    }

    #[test]
    fn simple_replies_decode() {
        let mut bytes = BytesMut::from(&b"+OK\r\n:42\r\n:-7\r\n-ERR nope\r\n"[..]);
        assert_eq!(decode(&mut bytes), Some(RespValue::SimpleString("OK".to_owned())));
        assert_eq!(decode(&mut bytes), Some(RespValue::Integer(42)));
        assert_eq!(decode(&mut bytes), Some(RespValue::Integer(-7)));
        assert_eq!(decode(&mut bytes), Some(RespValue::Error("ERR nope".to_owned())));
        assert_eq!(decode(&mut bytes), None);
        assert!(bytes.is_empty());
    }

    #[test]
    fn null_bulk_string_and_null_array_decode_to_nil() {
        let mut bytes = BytesMut::from(&b"$-1\r\n*-1\r\n"[..]);
        assert_eq!(decode(&mut bytes), Some(RespValue::Nil));
        assert_eq!(decode(&mut bytes), Some(RespValue::Nil));
    }

    #[test]
    fn empty_bulk_string_is_not_nil() {
        let mut bytes = BytesMut::from(&b"$0\r\n\r\n"[..]);
        assert_eq!(decode(&mut bytes), Some(RespValue::BulkString(Vec::new())));
    }

    #[test]
    fn nested_arrays_round_trip() {
        let value = RespValue::Array(vec![
            RespValue::Integer(1),
            RespValue::Array(vec![
                RespValue::BulkString(b"inner".to_vec()),
                RespValue::Nil,
            ]),
            RespValue::SimpleString("done".to_owned()),
        ]);
        let mut bytes = encode(value.clone());
        assert_eq!(decode(&mut bytes), Some(value));
        assert!(bytes.is_empty());
    }

    #[test]
    fn partial_input_is_left_in_the_buffer() {
        let full = b"*2\r\n$5\r\nhello\r\n$5\r\nworld\r\n";
        for split in 1..full.len() {
            let mut bytes = BytesMut::from(&full[..split]);
            assert_eq!(decode(&mut bytes), None, "split at {}", split);
            assert_eq!(&bytes[..], &full[..split], "nothing consumed at {}", split);

            bytes.extend_from_slice(&full[split..]);
            assert_eq!(
                decode(&mut bytes),
                Some(RespValue::Array(vec![
                    RespValue::BulkString(b"hello".to_vec()),
                    RespValue::BulkString(b"world".to_vec()),
                ]))
            );
        }
    }

    #[test]
    fn pipelined_replies_decode_one_at_a_time() {
        let mut bytes = BytesMut::from(&b"+OK\r\n$3\r\nfoo\r\n"[..]);
        assert_eq!(decode(&mut bytes), Some(RespValue::SimpleString("OK".to_owned())));
        assert_eq!(decode(&mut bytes), Some(RespValue::BulkString(b"foo".to_vec())));
        assert_eq!(decode(&mut bytes), None);
    }

    #[test]
    fn unknown_prefixes_are_rejected() {
        let mut bytes = BytesMut::from(&b"!bad\r\n"[..]);
        assert!(RespCodec.decode(&mut bytes).is_err());
    }

    #[test]
    fn malformed_lengths_are_rejected() {
        let mut bytes = BytesMut::from(&b"$abc\r\n"[..]);
        assert!(RespCodec.decode(&mut bytes).is_err());
        let mut bytes = BytesMut::from(&b"$-2\r\n"[..]);
        assert!(RespCodec.decode(&mut bytes).is_err());
    }

    #[test]
    fn pubsub_ack_shape_round_trips() {
        let value = RespValue::Array(vec![
            RespValue::BulkString(b"subscribe".to_vec()),
            RespValue::BulkString(b"events".to_vec()),
            RespValue::Integer(1),
        ]);
        let mut bytes = encode(value.clone());
        assert_eq!(decode(&mut bytes), Some(value));
    }
}
