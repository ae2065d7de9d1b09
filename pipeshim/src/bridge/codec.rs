//! Line framing for the request and response pipes.
//!
//! Uses AnyDelimiterCodec for newline framing on raw bytes + serde_json for
//! serialization. UTF-8 is checked per line, so one bad line cannot poison
//! the stream. Works over any AsyncRead/AsyncWrite (FIFOs, sockets,
//! in-memory duplex).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, Encoder};

use super::protocol::{Request, Response};

/// Longest accepted line, terminator excluded.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// How much of an overlong line is kept in its [`DecodeError`].
const OVERLONG_PREFIX: usize = 80;

/// A line that could not be turned into a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid request: {reason}")]
pub struct DecodeError {
    /// The offending line, as received. Invalid UTF-8 is replaced with U+FFFD.
    pub line: String,
    pub reason: String,
}

impl DecodeError {
    pub fn new(line: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            reason: reason.into(),
        }
    }
}

/// Messages that can travel as one JSON line.
pub trait Frame: DeserializeOwned {
    /// Checks invariants serde cannot express.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

impl Frame for Request {
    fn validate(&self) -> Result<(), String> {
        if self.method.trim().is_empty() {
            return Err("method must be a non-empty string".to_string());
        }
        Ok(())
    }
}

impl Frame for Response {}

/// Decode one line of raw bytes or text. Blank lines yield `Ok(None)`.
pub fn decode_line<T: Frame>(line: impl AsRef<[u8]>) -> Result<Option<T>, DecodeError> {
    let bytes = line.as_ref();
    let text = std::str::from_utf8(bytes).map_err(|e| {
        DecodeError::new(
            String::from_utf8_lossy(bytes),
            format!("line is not valid UTF-8: {}", e),
        )
    })?;

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let message: T =
        serde_json::from_str(trimmed).map_err(|e| DecodeError::new(text, e.to_string()))?;
    message
        .validate()
        .map_err(|reason| DecodeError::new(text, reason))?;
    Ok(Some(message))
}

/// Encode one message as a single newline-terminated line.
///
/// serde_json escapes control characters inside strings, so the output never
/// contains a newline other than the terminator.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Codec that frames messages by newline and serializes with JSON.
///
/// Decode faults (bad UTF-8, bad JSON, overlong lines) are yielded as items
/// rather than codec errors, so one bad line never ends the framed stream.
/// Codec errors are reserved for I/O.
pub struct JsonLineCodec<T> {
    inner: AnyDelimiterCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLineCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLineCodec<T> {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    /// Lines longer than `max_length` bytes are discarded up to the next
    /// newline and reported once as a [`DecodeError`].
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), max_length),
            _phantom: PhantomData,
        }
    }

    pub fn max_length(&self) -> usize {
        self.inner.max_length()
    }

    fn next_line(
        &mut self,
        src: &mut BytesMut,
        eof: bool,
    ) -> Result<Option<Result<T, DecodeError>>, io::Error>
    where
        T: Frame,
    {
        loop {
            let chunk = if eof {
                self.inner.decode_eof(src)
            } else {
                self.inner.decode(src)
            };

            let line = match chunk {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(None),
                Err(AnyDelimiterCodecError::Io(e)) => return Err(e),
                Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                    let prefix = &src[..src.len().min(OVERLONG_PREFIX)];
                    return Ok(Some(Err(DecodeError::new(
                        String::from_utf8_lossy(prefix),
                        format!("line exceeds {} bytes", self.max_length()),
                    ))));
                }
            };

            if let Some(item) = decode_line(&line).transpose() {
                return Ok(Some(item));
            }
        }
    }
}

impl<T: Frame> Decoder for JsonLineCodec<T> {
    type Item = Result<T, DecodeError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.next_line(src, false)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // A final line without its newline is still a message.
        self.next_line(src, true)
    }
}

impl<T: Serialize> Encoder<T> for JsonLineCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_string(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding line");
        self.inner.encode(json, dst).map_err(|e| match e {
            AnyDelimiterCodecError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{RequestId, Scalar};

    fn decode_all(input: impl AsRef<[u8]>) -> Vec<Result<Request, DecodeError>> {
        decode_all_with(JsonLineCodec::<Request>::new(), input)
    }

    fn decode_all_with(
        mut codec: JsonLineCodec<Request>,
        input: impl AsRef<[u8]>,
    ) -> Vec<Result<Request, DecodeError>> {
        let mut buf = BytesMut::from(input.as_ref());
        let mut items = Vec::new();
        while let Some(item) = codec.decode(&mut buf).unwrap() {
            items.push(item);
        }
        while let Some(item) = codec.decode_eof(&mut buf).unwrap() {
            items.push(item);
        }
        items
    }

    #[test]
    fn decode_skips_blank_lines() {
        let items = decode_all("\n   \n{\"method\":\"a\",\"args\":[]}\n\n");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap().method, "a");
    }

    #[test]
    fn decode_keeps_going_after_a_bad_line() {
        let items = decode_all("not json\n{\"method\":\"b\",\"args\":[1]}\n");
        assert_eq!(items.len(), 2);

        let err = items[0].as_ref().unwrap_err();
        assert_eq!(err.line, "not json");

        let req = items[1].as_ref().unwrap();
        assert_eq!(req.method, "b");
        assert_eq!(req.args, vec![Scalar::Int(1)]);
    }

    #[test]
    fn invalid_utf8_line_is_reported_and_the_next_line_survives() {
        let items = decode_all(
            b"{\"method\":\"echo\",\"args\":[\"\xff\"]}\n{\"method\":\"echo\",\"args\":[\"after\"],\"id\":\"2\"}\n",
        );
        assert_eq!(items.len(), 2);

        let err = items[0].as_ref().unwrap_err();
        assert!(err.reason.starts_with("line is not valid UTF-8"), "{}", err.reason);
        assert_eq!(err.line, "{\"method\":\"echo\",\"args\":[\"\u{fffd}\"]}");

        let req = items[1].as_ref().unwrap();
        assert_eq!(req.id, Some(RequestId::from("2")));
        assert_eq!(req.args, vec![Scalar::from("after")]);
    }

    #[test]
    fn overlong_line_is_reported_once_then_skipped() {
        let mut input = format!("{{\"method\":\"{}\"}}\n", "x".repeat(64));
        input.push_str("{\"method\":\"ok\"}\n");

        let items = decode_all_with(JsonLineCodec::with_max_length(32), &input);
        assert_eq!(items.len(), 2);

        let err = items[0].as_ref().unwrap_err();
        assert_eq!(err.reason, "line exceeds 32 bytes");
        assert!(err.line.starts_with("{\"method\":\"xxx"));
        assert_eq!(items[1].as_ref().unwrap().method, "ok");
    }

    #[test]
    fn decode_handles_crlf_and_missing_final_newline() {
        let items = decode_all("{\"method\":\"a\"}\r\n{\"method\":\"b\"}");
        let methods: Vec<_> = items
            .into_iter()
            .map(|r| r.unwrap().method)
            .collect();
        assert_eq!(methods, vec!["a", "b"]);
    }

    #[test]
    fn non_scalar_args_are_decode_errors() {
        for line in [
            r#"{"method":"m","args":[null]}"#,
            r#"{"method":"m","args":[[1,2]]}"#,
            r#"{"method":"m","args":[{"k":1}]}"#,
        ] {
            let err = decode_line::<Request>(line).unwrap_err();
            assert_eq!(err.line, line);
        }
    }

    #[test]
    fn missing_or_empty_method_is_a_decode_error() {
        assert!(decode_line::<Request>(r#"{"args":[]}"#).is_err());

        let err = decode_line::<Request>(r#"{"method":"  ","args":[]}"#).unwrap_err();
        assert_eq!(err.reason, "method must be a non-empty string");
        assert_eq!(
            err.to_string(),
            "invalid request: method must be a non-empty string"
        );
    }

    #[test]
    fn blank_line_is_not_a_message() {
        assert_eq!(decode_line::<Request>("   ").unwrap(), None);
    }

    #[test]
    fn encode_produces_exactly_one_line() {
        let req = Request::new("say", vec![Scalar::from("two\nlines")]).with_id("x");
        let line = encode_line(&req).unwrap();

        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn codec_roundtrip_requests() {
        let requests = vec![
            Request::new("echo", vec![Scalar::from("hi")]).with_id("1"),
            Request::new("add", vec![Scalar::Int(2), Scalar::Int(3)]),
            Request::new(
                "processData",
                vec![Scalar::from("f.txt"), Scalar::Int(100), Scalar::Bool(true)],
            )
            .with_id(RequestId::Int(9)),
            Request::new("calculate", vec![Scalar::Float(1.5), Scalar::Float(-2.25)]),
        ];

        let mut codec = JsonLineCodec::<Request>::new();
        let mut buf = BytesMut::new();
        for req in &requests {
            codec.encode(req.clone(), &mut buf).unwrap();
        }

        let mut decoded = Vec::new();
        while let Some(item) = codec.decode(&mut buf).unwrap() {
            decoded.push(item.unwrap());
        }
        assert_eq!(decoded, requests);
    }

    #[test]
    fn codec_roundtrip_response() {
        let resp = Response::failure(Some("7".into()), "walk", "TIMEOUT");
        let mut codec = JsonLineCodec::<Response>::new();
        let mut buf = BytesMut::new();

        codec.encode(resp.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();

        assert_eq!(decoded, resp);
    }

    #[test]
    fn partial_line_waits_for_more_input() {
        let mut codec = JsonLineCodec::<Request>::new();
        let mut buf = BytesMut::from("{\"method\":\"ech");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"o\"}\n");
        let req = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(req.method, "echo");
    }
}
