use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::frame::{Reply, Request};

/// Upper bound on elements in one request array.
pub const MAX_ARGS: usize = 1024;
/// Upper bound on a single bulk string.
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

const MAX_LINE_LEN: usize = 64 * 1024;
const MAX_REPLY_DEPTH: usize = 8;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("frame too large: {0}")]
    TooLarge(String),
}

fn malformed(message: impl Into<String>) -> ProtocolError {
    ProtocolError::Malformed(message.into())
}

/// Decodes requests and encodes replies; used by the daemon.
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerCodec;

/// Encodes requests and decodes replies; used by [`crate::client::Client`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientCodec;

impl Decoder for ServerCodec {
    type Item = Request;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Request>, ProtocolError> {
        loop {
            if src.is_empty() {
                return Ok(None);
            }
            if src[0] == b'*' {
                return decode_array(src);
            }
            match decode_inline(src)? {
                Inline::Incomplete => return Ok(None),
                Inline::Blank => continue,
                Inline::Request(request) => return Ok(Some(request)),
            }
        }
    }
}

impl Encoder<Reply> for ServerCodec {
    type Error = ProtocolError;

    fn encode(&mut self, reply: Reply, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        write_reply(&reply, dst);
        Ok(())
    }
}

impl Encoder<Request> for ClientCodec {
    type Error = ProtocolError;

    fn encode(&mut self, request: Request, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if request.args().len() > MAX_ARGS {
            return Err(ProtocolError::TooLarge(format!(
                "{} arguments exceeds limit of {}",
                request.args().len(),
                MAX_ARGS
            )));
        }
        put_header(b'*', request.args().len() as i64, dst);
        for arg in request.args() {
            put_bulk(arg, dst);
        }
        Ok(())
    }
}

impl Decoder for ClientCodec {
    type Item = Reply;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Reply>, ProtocolError> {
        match parse_reply(&src[..], 0, 0)? {
            Some((reply, used)) => {
                src.advance(used);
                Ok(Some(reply))
            }
            None => Ok(None),
        }
    }
}

fn decode_array(src: &mut BytesMut) -> Result<Option<Request>, ProtocolError> {
    let Some((header, mut pos)) = read_line(&src[..], 1)? else {
        return Ok(None);
    };
    let count = parse_int(header)?;
    if count <= 0 {
        src.advance(pos);
        return Ok(Some(Request::default()));
    }
    let count = count as usize;
    if count > MAX_ARGS {
        return Err(ProtocolError::TooLarge(format!(
            "{} arguments exceeds limit of {}",
            count, MAX_ARGS
        )));
    }

    let mut ranges = Vec::with_capacity(count);
    for _ in 0..count {
        match src.get(pos).copied() {
            None => return Ok(None),
            Some(b'$') => {}
            Some(other) => {
                return Err(malformed(format!(
                    "expected '$' in request array, got {:?}",
                    other as char
                )))
            }
        }
        let Some((len_line, start)) = read_line(&src[..], pos + 1)? else {
            return Ok(None);
        };
        let len = parse_int(len_line)?;
        if len < 0 {
            return Err(malformed("null bulk string in request"));
        }
        let len = len as usize;
        if len > MAX_BULK_LEN {
            return Err(ProtocolError::TooLarge(format!(
                "bulk string of {} bytes exceeds limit of {}",
                len, MAX_BULK_LEN
            )));
        }
        let end = start + len;
        if src.len() < end + 2 {
            src.reserve(end + 2 - src.len());
            return Ok(None);
        }
        if &src[end..end + 2] != b"\r\n" {
            return Err(malformed("bulk string not terminated by CRLF"));
        }
        ranges.push(start..end);
        pos = end + 2;
    }

    let frame = src.split_to(pos).freeze();
    Ok(Some(Request::new(
        ranges.into_iter().map(|range| frame.slice(range)).collect(),
    )))
}

enum Inline {
    Incomplete,
    Blank,
    Request(Request),
}

/// `PING\r\n` style requests typed by hand into a socket.
///
/// Arguments are split on whitespace, so an inline request cannot carry an
/// argument containing spaces; `run` command lines need the bulk array form.
fn decode_inline(src: &mut BytesMut) -> Result<Inline, ProtocolError> {
    let Some(idx) = src.iter().position(|b| *b == b'\n') else {
        if src.len() > MAX_LINE_LEN {
            return Err(ProtocolError::TooLarge("inline request exceeds limit".into()));
        }
        return Ok(Inline::Incomplete);
    };

    let line = src.split_to(idx + 1).freeze();
    let args: Vec<Bytes> = line[..]
        .split(|b| b.is_ascii_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| line.slice_ref(part))
        .collect();

    if args.is_empty() {
        Ok(Inline::Blank)
    } else {
        Ok(Inline::Request(Request::new(args)))
    }
}

fn parse_reply(
    buf: &[u8],
    pos: usize,
    depth: usize,
) -> Result<Option<(Reply, usize)>, ProtocolError> {
    if depth > MAX_REPLY_DEPTH {
        return Err(malformed("reply nested too deeply"));
    }
    let Some(&kind) = buf.get(pos) else {
        return Ok(None);
    };
    let Some((line, next)) = read_line(buf, pos + 1)? else {
        return Ok(None);
    };

    let reply = match kind {
        b'+' => Reply::Status(String::from_utf8_lossy(line).into_owned()),
        b'-' => Reply::Error(String::from_utf8_lossy(line).into_owned()),
        b':' => Reply::Integer(parse_int(line)?),
        b'$' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((Reply::Nil, next)));
            }
            let len = len as usize;
            if len > MAX_BULK_LEN {
                return Err(ProtocolError::TooLarge(format!(
                    "bulk reply of {} bytes exceeds limit",
                    len
                )));
            }
            let end = next + len;
            if buf.len() < end + 2 {
                return Ok(None);
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err(malformed("bulk reply not terminated by CRLF"));
            }
            return Ok(Some((
                Reply::Bulk(Bytes::copy_from_slice(&buf[next..end])),
                end + 2,
            )));
        }
        b'*' => {
            let count = parse_int(line)?;
            if count < 0 {
                return Ok(Some((Reply::Nil, next)));
            }
            let count = count as usize;
            if count > MAX_ARGS {
                return Err(ProtocolError::TooLarge(format!(
                    "array reply of {} elements exceeds limit",
                    count
                )));
            }
            let mut items = Vec::with_capacity(count);
            let mut cursor = next;
            for _ in 0..count {
                match parse_reply(buf, cursor, depth + 1)? {
                    Some((item, after)) => {
                        items.push(item);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }
            return Ok(Some((Reply::Array(items), cursor)));
        }
        other => {
            return Err(malformed(format!(
                "unexpected reply type {:?}",
                other as char
            )))
        }
    };

    Ok(Some((reply, next)))
}

/// Line starting at `pos` up to CRLF, and the offset just past the CRLF.
fn read_line(buf: &[u8], pos: usize) -> Result<Option<(&[u8], usize)>, ProtocolError> {
    let Some(rest) = buf.get(pos..) else {
        return Ok(None);
    };
    match rest.windows(2).position(|w| w == b"\r\n") {
        Some(idx) => Ok(Some((&rest[..idx], pos + idx + 2))),
        None if rest.len() > MAX_LINE_LEN => {
            Err(ProtocolError::TooLarge("header line exceeds limit".into()))
        }
        None => Ok(None),
    }
}

fn parse_int(line: &[u8]) -> Result<i64, ProtocolError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| malformed(format!("invalid length {:?}", String::from_utf8_lossy(line))))
}

fn write_reply(reply: &Reply, dst: &mut BytesMut) {
    match reply {
        Reply::Status(text) => put_simple(b'+', text, dst),
        Reply::Error(text) => put_simple(b'-', text, dst),
        Reply::Integer(n) => put_header(b':', *n, dst),
        Reply::Bulk(data) => put_bulk(data, dst),
        Reply::Nil => dst.extend_from_slice(b"$-1\r\n"),
        Reply::Array(items) => {
            put_header(b'*', items.len() as i64, dst);
            for item in items {
                write_reply(item, dst);
            }
        }
    }
}

fn put_header(kind: u8, n: i64, dst: &mut BytesMut) {
    dst.put_u8(kind);
    dst.extend_from_slice(n.to_string().as_bytes());
    dst.extend_from_slice(b"\r\n");
}

fn put_bulk(data: &[u8], dst: &mut BytesMut) {
    put_header(b'$', data.len() as i64, dst);
    dst.extend_from_slice(data);
    dst.extend_from_slice(b"\r\n");
}

// Simple strings cannot carry CR or LF.
fn put_simple(kind: u8, text: &str, dst: &mut BytesMut) {
    dst.put_u8(kind);
    dst.extend(
        text.bytes()
            .map(|b| if b == b'\r' || b == b'\n' { b' ' } else { b }),
    );
    dst.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Vec<Request> {
        let mut codec = ServerCodec;
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(request) = codec.decode(&mut buf).unwrap() {
            out.push(request);
        }
        out
    }

    #[test]
    fn decodes_bulk_array_request() {
        let requests = decode_all(b"*3\r\n$3\r\nrun\r\n$8\r\n0000abcd\r\n$7\r\necho hi\r\n");
        assert_eq!(
            requests,
            vec![Request::from_strs(&["run", "0000abcd", "echo hi"])]
        );
    }

    #[test]
    fn waits_for_complete_frame() {
        let mut codec = ServerCodec;
        let mut buf = BytesMut::from(&b"*2\r\n$7\r\ndestroy\r\n$8\r\n0000"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"abcd\r\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Request::from_strs(&["destroy", "0000abcd"]))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn pipelined_requests_decode_in_order() {
        let requests = decode_all(b"*1\r\n$4\r\nping\r\n*1\r\n$6\r\ncreate\r\n");
        assert_eq!(
            requests,
            vec![Request::from_strs(&["ping"]), Request::from_strs(&["create"])]
        );
    }

    #[test]
    fn bulk_strings_are_binary_safe() {
        let requests = decode_all(b"*2\r\n$3\r\nrun\r\n$6\r\na\r\nb\0c\r\n");
        assert_eq!(requests[0].args()[1].as_ref(), b"a\r\nb\0c");
    }

    #[test]
    fn inline_requests_and_blank_lines() {
        let requests = decode_all(b"\r\n  \nPING\r\ndestroy   0000abcd\n");
        assert_eq!(
            requests,
            vec![
                Request::from_strs(&["PING"]),
                Request::from_strs(&["destroy", "0000abcd"])
            ]
        );
    }

    #[test]
    fn inline_arguments_cannot_contain_spaces() {
        let requests = decode_all(b"run 0000abcd echo hi\r\n");
        assert_eq!(
            requests,
            vec![Request::from_strs(&["run", "0000abcd", "echo", "hi"])]
        );
    }

    #[test]
    fn empty_array_is_an_empty_request() {
        let requests = decode_all(b"*0\r\n");
        assert_eq!(requests.len(), 1);
        assert!(requests[0].is_empty());
    }

    #[test]
    fn rejects_non_bulk_elements() {
        let mut buf = BytesMut::from(&b"*1\r\n:5\r\n"[..]);
        assert!(matches!(
            ServerCodec.decode(&mut buf),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_bad_lengths_and_terminators() {
        let mut buf = BytesMut::from(&b"*x\r\n"[..]);
        assert!(matches!(
            ServerCodec.decode(&mut buf),
            Err(ProtocolError::Malformed(_))
        ));

        let mut buf = BytesMut::from(&b"*1\r\n$2\r\nabcd\r\n"[..]);
        assert!(matches!(
            ServerCodec.decode(&mut buf),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_oversized_arrays() {
        let mut buf = BytesMut::from(format!("*{}\r\n", MAX_ARGS + 1).as_bytes());
        assert!(matches!(
            ServerCodec.decode(&mut buf),
            Err(ProtocolError::TooLarge(_))
        ));
    }

    #[test]
    fn encodes_run_reply() {
        let reply = Reply::Array(vec![
            Reply::Integer(0),
            Reply::bulk("/tmp/o"),
            Reply::bulk("/tmp/e"),
        ]);
        let mut dst = BytesMut::new();
        ServerCodec.encode(reply, &mut dst).unwrap();
        assert_eq!(&dst[..], b"*3\r\n:0\r\n$6\r\n/tmp/o\r\n$6\r\n/tmp/e\r\n");
    }

    #[test]
    fn simple_strings_cannot_break_framing() {
        let mut dst = BytesMut::new();
        ServerCodec
            .encode(Reply::error("bad\r\nthing"), &mut dst)
            .unwrap();
        assert_eq!(&dst[..], b"-ERR bad  thing\r\n");
    }

    #[test]
    fn client_decodes_nested_and_partial_replies() {
        let mut codec = ClientCodec;
        let mut buf = BytesMut::from(&b"+pong\r\n-ERR unknown handle\r\n*3\r\n:123\r\n$-1\r\n$2\r\nhi"[..]);

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Reply::Status("pong".into()))
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Reply::Error("ERR unknown handle".into()))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"\r\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Reply::Array(vec![
                Reply::Integer(123),
                Reply::Nil,
                Reply::bulk("hi")
            ]))
        );
    }

    #[test]
    fn client_encodes_requests_as_bulk_arrays() {
        let mut dst = BytesMut::new();
        ClientCodec
            .encode(Request::from_strs(&["destroy", "0000abcd"]), &mut dst)
            .unwrap();
        assert_eq!(&dst[..], b"*2\r\n$7\r\ndestroy\r\n$8\r\n0000abcd\r\n");
    }
}
