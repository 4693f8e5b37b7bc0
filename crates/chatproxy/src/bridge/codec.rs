//! Line codec for envelopes.
//!
//! Each frame is `base64(utf8(json(envelope)))` terminated by a newline, so
//! payloads that contain newlines or control bytes never break the
//! line-oriented pipe. Uses LinesCodec for framing + serde_json + base64.

use std::marker::PhantomData;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use super::protocol::Envelope;
use crate::fault::Fault;

/// Upper bound for a single encoded line.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

const LARGE_FRAME_BYTES: usize = 100_000;

/// Encode an envelope to a single line (without the trailing newline).
pub fn encode_line<T: Envelope>(item: &T) -> Result<String, Fault> {
    let json = serde_json::to_vec(item)
        .map_err(|e| Fault::protocol(format!("failed to serialize envelope: {e}")))?;
    let json_len = json.len();
    tracing::trace!(json_size_bytes = json_len, "Encoding frame");
    if json_len > LARGE_FRAME_BYTES {
        tracing::info!(
            json_size_bytes = json_len,
            json_size_kb = json_len / 1024,
            "Large frame being encoded"
        );
    }
    Ok(STANDARD.encode(json))
}

/// Decode and validate one line.
pub fn decode_line<T: Envelope>(line: &str) -> Result<T, Fault> {
    let bytes = STANDARD
        .decode(line.trim())
        .map_err(|e| Fault::protocol(format!("frame is not valid base64: {e}")))?;
    let text = std::str::from_utf8(&bytes)
        .map_err(|e| Fault::protocol(format!("frame is not valid UTF-8: {e}")))?;
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| Fault::protocol(format!("frame is not valid JSON: {e}")))?;
    if value.is_null() {
        return Err(Fault::protocol("frame decoded to null"));
    }
    let item: T = serde_json::from_value(value)
        .map_err(|e| Fault::protocol(format!("frame has an incompatible shape: {e}")))?;
    item.validate()?;
    Ok(item)
}

/// Codec that frames envelopes as base64 lines.
///
/// Wraps LinesCodec and adds the envelope encoding on top.
pub struct EnvelopeCodec<T> {
    inner: LinesCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for EnvelopeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EnvelopeCodec<T> {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
            _phantom: PhantomData,
        }
    }
}

fn line_fault(e: LinesCodecError) -> Fault {
    match e {
        LinesCodecError::MaxLineLengthExceeded => Fault::protocol("frame exceeds maximum line length"),
        LinesCodecError::Io(e) => Fault::process(format!("pipe I/O error: {e}")),
    }
}

impl<T: Envelope> Decoder for EnvelopeCodec<T> {
    type Item = T;
    type Error = Fault;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.inner.decode(src).map_err(line_fault)? {
                // Blank lines carry nothing; skip them.
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return decode_line(&line).map(Some),
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode_eof(src).map_err(line_fault)? {
            Some(line) if line.trim().is_empty() => Ok(None),
            Some(line) => decode_line(&line).map(Some),
            None => Ok(None),
        }
    }
}

impl<T: Envelope> Encoder<T> for EnvelopeCodec<T> {
    type Error = Fault;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = encode_line(&item)?;
        self.inner.encode(line, dst).map_err(line_fault)
    }
}
