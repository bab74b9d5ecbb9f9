/// RESP2 (Redis Serialization Protocol) parsing and encoding
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::str;

/// RESP data types
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple String (+OK\r\n)
    SimpleString(String),
    /// Error (-ERR message\r\n)
    Error(String),
    /// Integer (:123\r\n)
    Integer(i64),
    /// Bulk String ($5\r\nhello\r\n)
    BulkString(Option<Bytes>), // None represents NULL
    /// Array (*2\r\n$5\r\nhello\r\n$5\r\nworld\r\n)
    Array(Option<Vec<RespValue>>), // None represents NULL array
}

impl RespValue {
    pub fn bulk<B: Into<Bytes>>(data: B) -> Self {
        RespValue::BulkString(Some(data.into()))
    }
}

/// RESP parser for reading Redis replies
pub struct RespParser;

/// RESP encoder for writing Redis commands
pub struct RespEncoder;

/// Parse error types
#[derive(Debug, thiserror::Error)]
pub enum RespParseError {
    #[error("Invalid RESP format: {0}")]
    InvalidFormat(String),
    #[error("Invalid UTF-8: {0}")]
    InvalidUtf8(#[from] str::Utf8Error),
    #[error("Invalid integer: {0}")]
    InvalidInteger(#[from] btoi::ParseIntegerError),
}

impl RespParser {
    /// Parse one value from the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched when the value is not
    /// complete yet; otherwise consumes exactly the bytes of that value.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<RespValue>, RespParseError> {
        match Self::parse_slice(buf)? {
            Some((value, consumed)) => {
                buf.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Parse one value from `input`, returning it with the number of bytes it spans
    pub fn parse_slice(input: &[u8]) -> Result<Option<(RespValue, usize)>, RespParseError> {
        let Some(&first_byte) = input.first() else {
            return Ok(None);
        };

        let Some((line, mut pos)) = Self::read_line(input) else {
            return Ok(None);
        };
        let body = line.get(1..).unwrap_or_default();

        match first_byte {
            b'+' => Ok(Some((RespValue::SimpleString(str::from_utf8(body)?.to_string()), pos))),
            b'-' => Ok(Some((RespValue::Error(str::from_utf8(body)?.to_string()), pos))),
            b':' => Ok(Some((RespValue::Integer(btoi::btoi(body)?), pos))),
            b'$' => {
                let size: i64 = btoi::btoi(body)?;
                if size == -1 {
                    return Ok(Some((RespValue::BulkString(None), pos)));
                }
                if size < 0 {
                    return Err(RespParseError::InvalidFormat(
                        "Invalid bulk string size".to_string(),
                    ));
                }

                let size = size as usize;
                if input.len() < pos + size + 2 {
                    return Ok(None);
                }
                if &input[pos + size..pos + size + 2] != b"\r\n" {
                    return Err(RespParseError::InvalidFormat(
                        "Missing \\r\\n after bulk string".to_string(),
                    ));
                }

                let content = Bytes::copy_from_slice(&input[pos..pos + size]);
                Ok(Some((RespValue::BulkString(Some(content)), pos + size + 2)))
            }
            b'*' => {
                let size: i64 = btoi::btoi(body)?;
                if size == -1 {
                    return Ok(Some((RespValue::Array(None), pos)));
                }
                if size < 0 {
                    return Err(RespParseError::InvalidFormat("Invalid array size".to_string()));
                }

                let mut elements = Vec::with_capacity((size as usize).min(1024));
                for _ in 0..size {
                    match Self::parse_slice(&input[pos..])? {
                        Some((element, consumed)) => {
                            elements.push(element);
                            pos += consumed;
                        }
                        None => return Ok(None),
                    }
                }
                Ok(Some((RespValue::Array(Some(elements)), pos)))
            }
            _ => Err(RespParseError::InvalidFormat(format!(
                "Unknown RESP type: {}",
                first_byte as char
            ))),
        }
    }

    /// Line without its \r\n, and the offset just past it
    fn read_line(input: &[u8]) -> Option<(&[u8], usize)> {
        input
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|end| (&input[..end], end + 2))
    }
}

impl RespEncoder {
    /// Encode a RESP value to bytes
    pub fn encode(value: &RespValue) -> Bytes {
        let mut buf = BytesMut::new();
        Self::encode_into(&mut buf, value);
        buf.freeze()
    }

    /// Encode a RESP value into an existing buffer
    pub fn encode_into(buf: &mut BytesMut, value: &RespValue) {
        match value {
            RespValue::SimpleString(s) => {
                buf.put_u8(b'+');
                buf.extend_from_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::Error(s) => {
                buf.put_u8(b'-');
                buf.extend_from_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::Integer(n) => {
                buf.put_u8(b':');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::BulkString(Some(data)) => {
                buf.put_u8(b'$');
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                buf.extend_from_slice(data);
                buf.put_slice(b"\r\n");
            }
            RespValue::BulkString(None) => {
                buf.extend_from_slice(b"$-1\r\n");
            }
            RespValue::Array(Some(elements)) => {
                buf.put_u8(b'*');
                buf.extend_from_slice(elements.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                for element in elements {
                    Self::encode_into(buf, element);
                }
            }
            RespValue::Array(None) => {
                buf.extend_from_slice(b"*-1\r\n");
            }
        }
    }

    /// Build a command array from a command name and binary-safe arguments
    pub fn create_command(command: &str, args: &[&[u8]]) -> RespValue {
        let mut elements = Vec::with_capacity(args.len() + 1);
        elements.push(RespValue::bulk(Bytes::copy_from_slice(command.as_bytes())));
        for arg in args {
            elements.push(RespValue::bulk(Bytes::copy_from_slice(arg)));
        }

        RespValue::Array(Some(elements))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_string() {
        let mut buf = BytesMut::from("+OK\r\n");
        let result = RespParser::parse(&mut buf).unwrap().unwrap();
        assert_eq!(result, RespValue::SimpleString("OK".to_string()));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_error() {
        let mut buf = BytesMut::from("-ERR unknown command\r\n");
        let result = RespParser::parse(&mut buf).unwrap().unwrap();
        assert_eq!(result, RespValue::Error("ERR unknown command".to_string()));
    }

    #[test]
    fn test_parse_integer() {
        let mut buf = BytesMut::from(":-42\r\n");
        let result = RespParser::parse(&mut buf).unwrap().unwrap();
        assert_eq!(result, RespValue::Integer(-42));
    }

    #[test]
    fn test_parse_null_bulk_string() {
        let mut buf = BytesMut::from("$-1\r\n");
        let result = RespParser::parse(&mut buf).unwrap().unwrap();
        assert_eq!(result, RespValue::BulkString(None));
    }

    #[test]
    fn test_parse_binary_bulk_string() {
        let mut buf = BytesMut::from(&b"$4\r\na\r\nb\r\n"[..]);
        let result = RespParser::parse(&mut buf).unwrap().unwrap();
        assert_eq!(result, RespValue::bulk(&b"a\r\nb"[..]));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_scan_reply() {
        let mut buf = BytesMut::from("*2\r\n$2\r\n17\r\n*2\r\n$5\r\nu:1:a\r\n$5\r\nu:1:b\r\n");
        let result = RespParser::parse(&mut buf).unwrap().unwrap();
        let expected = RespValue::Array(Some(vec![
            RespValue::bulk("17"),
            RespValue::Array(Some(vec![RespValue::bulk("u:1:a"), RespValue::bulk("u:1:b")])),
        ]));
        assert_eq!(result, expected);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_input_is_left_in_buffer() {
        let full = b"*2\r\n$5\r\nhello\r\n$5\r\nworld\r\n";
        for cut in 1..full.len() {
            let mut buf = BytesMut::from(&full[..cut]);
            assert!(RespParser::parse(&mut buf).unwrap().is_none());
            assert_eq!(buf.len(), cut);
        }

        let mut buf = BytesMut::from(&full[..]);
        buf.extend_from_slice(b"+OK\r\n");
        assert!(RespParser::parse(&mut buf).unwrap().is_some());
        assert_eq!(&buf[..], b"+OK\r\n");
    }

    #[test]
    fn test_invalid_input() {
        let mut buf = BytesMut::from("?what\r\n");
        assert!(RespParser::parse(&mut buf).is_err());

        let mut buf = BytesMut::from(":12x\r\n");
        assert!(matches!(
            RespParser::parse(&mut buf),
            Err(RespParseError::InvalidInteger(_))
        ));
    }

    #[test]
    fn test_encode_command() {
        let command = RespEncoder::create_command("SET", &[b"key".as_slice(), b"value", b"PX", b"100"]);
        let encoded = RespEncoder::encode(&command);
        let expected = "*5\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n$2\r\nPX\r\n$3\r\n100\r\n";
        assert_eq!(encoded, Bytes::from(expected));
    }
}
