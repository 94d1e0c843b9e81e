/*!
 * Wire Protocol
 *
 * Parses client requests and encodes replies. Requests are either RESP arrays
 * of bulk strings (`*<n>\r\n$<len>\r\n<data>\r\n...`) or inline commands (one
 * whitespace-separated line). Replies use the RESP encodings for simple
 * strings, errors, integers, bulk strings, nil and arrays.
 */

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// Largest accepted bulk string (512 MiB, same ceiling as Redis)
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;
/// Largest accepted number of array elements in one request
const MAX_ARRAY_LEN: i64 = 1024 * 1024;
/// Longest inline command line before we give up waiting for a newline
const MAX_INLINE_LEN: usize = 64 * 1024;
/// Argument slots reserved up front; a header alone cannot claim more
const PREALLOC_ARGS: usize = 64;

/// Framing errors. The connection survives them; the unparsed input is dropped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Protocol error: expected '$', got '{0}'")]
    ExpectedBulk(char),
    #[error("Protocol error: invalid multibulk length")]
    InvalidArrayLen,
    #[error("Protocol error: invalid bulk length")]
    InvalidBulkLen,
    #[error("Protocol error: expected CRLF")]
    ExpectedCrlf,
    #[error("Protocol error: too big inline request")]
    InlineTooLong,
    #[error("Protocol error: unbalanced quotes in request")]
    UnbalancedQuotes,
    #[error("Protocol error: empty request")]
    Empty,
}

impl ProtocolError {
    /// Whether parsing can resume after the offending request
    ///
    /// Only inline lines qualify: the bad line is dropped and the next line
    /// starts a new request. A broken RESP frame leaves no reliable boundary.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProtocolError::UnbalancedQuotes | ProtocolError::Empty)
    }
}

/// A parsed request: upper-cased command name plus raw arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub args: Vec<Bytes>,
}

impl Command {
    pub fn new(name: &str, args: Vec<Bytes>) -> Self {
        Self {
            name: name.to_ascii_uppercase(),
            args,
        }
    }

    /// The first positional argument, which is the key for keyed commands
    #[inline]
    pub fn key(&self) -> Option<&Bytes> {
        self.args.first()
    }

    fn from_parts(mut parts: Vec<Bytes>) -> Result<Self, ProtocolError> {
        if parts.is_empty() {
            return Err(ProtocolError::Empty);
        }
        let name = String::from_utf8_lossy(&parts.remove(0)).to_ascii_uppercase();
        Ok(Self { name, args: parts })
    }
}

/// Parse a single request from the front of `data`
///
/// # Returns
/// * `Ok(Some((consumed_bytes, command)))` - a complete request
/// * `Ok(None)` - incomplete data, need more bytes
/// * `Err(...)` - malformed input
pub fn parse_one(data: &[u8]) -> Result<Option<(usize, Command)>, ProtocolError> {
    if data.is_empty() {
        return Ok(None);
    }
    if data[0] != b'*' {
        return parse_inline(data);
    }

    let (i, n) = match read_decimal_line(&data[1..])? {
        Some(x) => x,
        None => return Ok(None),
    };
    if n <= 0 || n > MAX_ARRAY_LEN {
        return Err(ProtocolError::InvalidArrayLen);
    }
    let mut cursor = 1 + i;

    let mut items: Vec<Bytes> = Vec::with_capacity((n as usize).min(PREALLOC_ARGS));
    for _ in 0..n {
        if cursor >= data.len() {
            return Ok(None);
        }
        if data[cursor] != b'$' {
            return Err(ProtocolError::ExpectedBulk(data[cursor] as char));
        }

        let (i2, len) = match read_decimal_line(&data[cursor + 1..])? {
            Some(x) => x,
            None => return Ok(None),
        };
        if !(0..=MAX_BULK_LEN).contains(&len) {
            return Err(ProtocolError::InvalidBulkLen);
        }
        cursor += 1 + i2;

        let len = len as usize;
        if cursor + len + 2 > data.len() {
            return Ok(None);
        }
        if &data[cursor + len..cursor + len + 2] != b"\r\n" {
            return Err(ProtocolError::ExpectedCrlf);
        }
        items.push(Bytes::copy_from_slice(&data[cursor..cursor + len]));
        cursor += len + 2;
    }

    Ok(Some((cursor, Command::from_parts(items)?)))
}

/// Inline form: `PING hello\r\n`, as typed into telnet
///
/// Arguments split on whitespace. Double-quoted arguments understand the
/// escapes `\n`, `\r`, `\t`, `\\` and `\"`; single-quoted ones only `\'`.
fn parse_inline(data: &[u8]) -> Result<Option<(usize, Command)>, ProtocolError> {
    let Some(nl) = data.iter().position(|&b| b == b'\n') else {
        if data.len() > MAX_INLINE_LEN {
            return Err(ProtocolError::InlineTooLong);
        }
        return Ok(None);
    };
    let line = &data[..nl];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let parts = split_inline_args(line)?;
    Ok(Some((nl + 1, Command::from_parts(parts)?)))
}

fn split_inline_args(line: &[u8]) -> Result<Vec<Bytes>, ProtocolError> {
    let mut args = Vec::new();
    let mut i = 0;
    loop {
        while line.get(i).is_some_and(|b| b.is_ascii_whitespace()) {
            i += 1;
        }
        let Some(first) = line.get(i).copied() else {
            return Ok(args);
        };

        let mut arg = Vec::new();
        if first == b'"' || first == b'\'' {
            i = read_quoted(line, i + 1, first, &mut arg)?;
            // a closing quote must end the argument
            if line.get(i).is_some_and(|b| !b.is_ascii_whitespace()) {
                return Err(ProtocolError::UnbalancedQuotes);
            }
        } else {
            while let Some(b) = line.get(i).copied().filter(|b| !b.is_ascii_whitespace()) {
                arg.push(b);
                i += 1;
            }
        }
        args.push(Bytes::from(arg));
    }
}

/// Copy a quoted argument starting after its opening quote into `out`
///
/// Returns the index just past the closing quote.
fn read_quoted(line: &[u8], mut i: usize, quote: u8, out: &mut Vec<u8>) -> Result<usize, ProtocolError> {
    loop {
        match line.get(i).copied() {
            None => return Err(ProtocolError::UnbalancedQuotes),
            Some(b'\\') if i + 1 < line.len() => {
                let next = line[i + 1];
                let unescaped = match (quote, next) {
                    (b'"', b'n') => Some(b'\n'),
                    (b'"', b'r') => Some(b'\r'),
                    (b'"', b't') => Some(b'\t'),
                    (b'"', b'\\') | (b'"', b'"') => Some(next),
                    (b'\'', b'\'') => Some(next),
                    _ => None,
                };
                match unescaped {
                    Some(b) => {
                        out.push(b);
                        i += 2;
                    }
                    None => {
                        out.push(b'\\');
                        i += 1;
                    }
                }
            }
            Some(b) if b == quote => return Ok(i + 1),
            Some(b) => {
                out.push(b);
                i += 1;
            }
        }
    }
}

/// Parse every complete request in `buf`, consuming what was parsed
///
/// Leading whitespace, blank lines included, is skipped. Commands parsed
/// before an error are still pushed to `out`. On a recoverable error the
/// offending line has already been consumed, so the caller may call again.
pub fn parse_many(buf: &mut BytesMut, out: &mut Vec<Command>) -> Result<(), ProtocolError> {
    loop {
        let blank = buf.iter().take_while(|b| b.is_ascii_whitespace()).count();
        buf.advance(blank);

        match parse_one(&buf[..]) {
            Ok(Some((consumed, cmd))) => {
                buf.advance(consumed);
                out.push(cmd);
            }
            Ok(None) => return Ok(()),
            Err(e) => {
                if e.is_recoverable() {
                    if let Some(nl) = buf.iter().position(|&b| b == b'\n') {
                        buf.advance(nl + 1);
                    }
                }
                return Err(e);
            }
        }
    }
}

/// Read a signed decimal followed by CRLF; `None` when the line is incomplete
fn read_decimal_line(s: &[u8]) -> Result<Option<(usize, i64)>, ProtocolError> {
    let Some(cr) = s.iter().position(|&b| b == b'\r') else {
        // a length line longer than this cannot be valid
        if s.len() > 20 {
            return Err(ProtocolError::InvalidBulkLen);
        }
        return Ok(None);
    };
    if cr + 1 >= s.len() {
        return Ok(None);
    }
    if s[cr + 1] != b'\n' {
        return Err(ProtocolError::ExpectedCrlf);
    }
    let num = std::str::from_utf8(&s[..cr])
        .ok()
        .and_then(|t| t.parse::<i64>().ok())
        .ok_or(ProtocolError::InvalidBulkLen)?;
    Ok(Some((cr + 2, num)))
}

/// A reply produced by a command handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Nil,
    Array(Vec<Reply>),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Simple("OK".into())
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Reply::Error(msg.into())
    }

    /// `-ERR wrong number of arguments for '<cmd>' command`
    pub fn wrong_arity(cmd: &str) -> Self {
        Reply::Error(format!(
            "ERR wrong number of arguments for '{}' command",
            cmd.to_ascii_lowercase()
        ))
    }

    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Reply::Simple(s) => write_simple(s, out),
            Reply::Error(e) => write_error(e, out),
            Reply::Integer(i) => write_integer(*i, out),
            Reply::Bulk(b) => write_bulk(b, out),
            Reply::Nil => write_null(out),
            Reply::Array(items) => {
                write_array_len(items.len(), out);
                for item in items {
                    item.encode(out);
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.encode(&mut out);
        out.freeze()
    }
}

//
// RESP encoders
//

/// `+<s>\r\n`
pub fn write_simple(s: &str, out: &mut BytesMut) {
    out.reserve(s.len() + 3);
    out.extend_from_slice(b"+");
    out.extend_from_slice(s.as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// `-<s>\r\n`
pub fn write_error(s: &str, out: &mut BytesMut) {
    out.reserve(s.len() + 3);
    out.extend_from_slice(b"-");
    out.extend_from_slice(s.as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// `$<len>\r\n<data>\r\n`
pub fn write_bulk(b: &[u8], out: &mut BytesMut) {
    let len = b.len().to_string();
    out.reserve(1 + len.len() + 2 + b.len() + 2);
    out.extend_from_slice(b"$");
    out.extend_from_slice(len.as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(b);
    out.extend_from_slice(b"\r\n");
}

/// `$-1\r\n`
pub fn write_null(out: &mut BytesMut) {
    out.extend_from_slice(b"$-1\r\n");
}

/// `:<i>\r\n`
pub fn write_integer(i: i64, out: &mut BytesMut) {
    out.extend_from_slice(b":");
    out.extend_from_slice(i.to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// `*<n>\r\n`, followed by the caller's elements
pub fn write_array_len(n: usize, out: &mut BytesMut) {
    out.extend_from_slice(b"*");
    out.extend_from_slice(n.to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_frames_wait_for_more() {
        assert_eq!(parse_one(b"*2\r\n$3\r\nGET\r\n$1\r").unwrap(), None);
        assert_eq!(parse_one(b"*2\r\n$3\r\nGE").unwrap(), None);
        assert_eq!(parse_one(b"*2").unwrap(), None);
        assert_eq!(parse_one(b"PING").unwrap(), None);
    }

    #[test]
    fn command_names_are_case_insensitive() {
        let (n, cmd) = parse_one(b"*2\r\n$3\r\nget\r\n$1\r\nk\r\n").unwrap().unwrap();
        assert_eq!(n, 20);
        assert_eq!(cmd.name, "GET");
        assert_eq!(cmd.key().unwrap().as_ref(), b"k");
    }

    #[test]
    fn inline_commands() {
        let (n, cmd) = parse_one(b"set  a 1\r\nGET a\r\n").unwrap().unwrap();
        assert_eq!(n, 10);
        assert_eq!(cmd, Command::new("SET", vec![Bytes::from("a"), Bytes::from("1")]));
    }

    #[test]
    fn malformed_frames_error() {
        assert_eq!(parse_one(b"*1\r\n:3\r\n"), Err(ProtocolError::ExpectedBulk(':')));
        assert_eq!(parse_one(b"*0\r\n"), Err(ProtocolError::InvalidArrayLen));
        assert_eq!(parse_one(b"*1\r\n$-5\r\n"), Err(ProtocolError::InvalidBulkLen));
        assert_eq!(parse_one(b"*1\r\n$1\r\nab\r\n"), Err(ProtocolError::ExpectedCrlf));
        assert_eq!(parse_one(b"*x\r\n"), Err(ProtocolError::InvalidBulkLen));
    }

    #[test]
    fn parse_many_keeps_commands_before_error() {
        let mut buf = BytesMut::from(&b"PING\r\n\r\n*1\r\n:1\r\n"[..]);
        let mut out = Vec::new();
        assert!(parse_many(&mut buf, &mut out).is_err());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "PING");
    }

    #[test]
    fn huge_array_header_waits_without_reserving() {
        // a bare header announcing a million arguments is just an incomplete frame
        assert_eq!(parse_one(b"*1048576\r\n").unwrap(), None);
        assert_eq!(parse_one(b"*1048576\r\n$3\r\nGET\r\n").unwrap(), None);
        assert_eq!(parse_one(b"*1048577\r\n"), Err(ProtocolError::InvalidArrayLen));
    }

    #[test]
    fn arrays_longer_than_the_reservation_still_parse() {
        let mut frame = b"*100\r\n$5\r\nMSET_\r\n".to_vec();
        for _ in 0..99 {
            frame.extend_from_slice(b"$1\r\nx\r\n");
        }
        let (n, cmd) = parse_one(&frame).unwrap().unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(cmd.args.len(), 99);
    }

    #[test]
    fn inline_quoting() {
        let (_, cmd) = parse_one(b"SET k \"a b\\r\\n\"\r\n").unwrap().unwrap();
        assert_eq!(cmd.args, vec![Bytes::from("k"), Bytes::from("a b\r\n")]);

        let (_, cmd) = parse_one(b"SET 'it\\'s' \"\"\r\n").unwrap().unwrap();
        assert_eq!(cmd.args, vec![Bytes::from("it's"), Bytes::from("")]);

        assert_eq!(parse_one(b"SET \"open\r\n"), Err(ProtocolError::UnbalancedQuotes));
        assert_eq!(parse_one(b"SET \"a\"b\r\n"), Err(ProtocolError::UnbalancedQuotes));
    }

    #[test]
    fn blank_lines_are_skipped() {
        let mut buf = BytesMut::from(&b"   \r\n\t\r\nPING\r\n  \n"[..]);
        let mut out = Vec::new();
        parse_many(&mut buf, &mut out).unwrap();
        assert_eq!(out, vec![Command::new("PING", vec![])]);
        assert!(buf.is_empty());
        // parse_one alone still rejects a blank line
        assert_eq!(parse_one(b"   \r\n"), Err(ProtocolError::Empty));
    }

    #[test]
    fn bad_inline_line_is_consumed() {
        let mut buf = BytesMut::from(&b"GET \"k\r\nPING\r\n"[..]);
        let mut out = Vec::new();
        let err = parse_many(&mut buf, &mut out).unwrap_err();
        assert_eq!(err, ProtocolError::UnbalancedQuotes);
        assert!(err.is_recoverable());
        assert!(out.is_empty());

        parse_many(&mut buf, &mut out).unwrap();
        assert_eq!(out, vec![Command::new("PING", vec![])]);
    }

    #[test]
    fn resp_framing_errors_are_not_recoverable() {
        let mut buf = BytesMut::from(&b"*1\r\n#oops\r\n"[..]);
        let err = parse_many(&mut buf, &mut Vec::new()).unwrap_err();
        assert!(!err.is_recoverable());
        assert_eq!(&buf[..], b"*1\r\n#oops\r\n");
    }

    #[test]
    fn reply_encodings() {
        assert_eq!(Reply::ok().to_bytes().as_ref(), b"+OK\r\n");
        assert_eq!(Reply::Nil.to_bytes().as_ref(), b"$-1\r\n");
        assert_eq!(Reply::Integer(-2).to_bytes().as_ref(), b":-2\r\n");
        assert_eq!(Reply::Bulk(Bytes::from("hi")).to_bytes().as_ref(), b"$2\r\nhi\r\n");
        assert_eq!(
            Reply::wrong_arity("PING").to_bytes().as_ref(),
            b"-ERR wrong number of arguments for 'ping' command\r\n"
        );
        assert_eq!(
            Reply::Array(vec![Reply::Integer(1), Reply::Nil]).to_bytes().as_ref(),
            b"*2\r\n:1\r\n$-1\r\n"
        );
    }
}
