//! Incremental STOMP decoder / encoder
//!
//! The decoder works on a growing buffer: WebSocket messages are appended
//! as they arrive and complete frames are split off the front. Heart-beat
//! EOLs between frames are skipped.

use bytes::{BufMut, Bytes, BytesMut};
use errors::HeraldError;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::frame::{
    escape_header, unescape_header, Command, Frame, StompVersion, HEADER_CONTENT_LENGTH,
};

/// Frame-level parse failures
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("header line before command line")]
    HeaderBeforeCommand,

    #[error("malformed header line: {0}")]
    MalformedHeader(String),

    #[error("invalid header escape: {0}")]
    InvalidEscape(String),

    #[error("duplicate content-length header")]
    DuplicateContentLength,

    #[error("invalid content-length '{0}'")]
    InvalidContentLength(String),

    #[error("frame body not terminated by NUL")]
    MissingTerminator,

    #[error("frame exceeds {0} bytes")]
    TooLarge(usize),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FrameError> for HeraldError {
    fn from(err: FrameError) -> Self {
        HeraldError::StompProtocol(err.to_string())
    }
}

/// STOMP codec bound to the session's negotiated version
#[derive(Debug, Clone)]
pub struct StompCodec {
    version: StompVersion,
    max_frame_bytes: usize,
}

impl StompCodec {
    pub fn new(version: StompVersion, max_frame_bytes: usize) -> Self {
        Self {
            version,
            max_frame_bytes,
        }
    }

    pub fn version(&self) -> StompVersion {
        self.version
    }

    pub fn set_version(&mut self, version: StompVersion) {
        self.version = version;
    }

    fn check_size(&self, buffered: usize) -> Result<(), FrameError> {
        if buffered > self.max_frame_bytes {
            return Err(FrameError::TooLarge(self.max_frame_bytes));
        }
        Ok(())
    }

    /// Encode into a fresh buffer
    pub fn encode_to_bytes(&mut self, frame: &Frame) -> Bytes {
        let mut dst = BytesMut::with_capacity(64 + frame.body.len());
        write_frame(frame, self.version, &mut dst);
        dst.freeze()
    }
}

impl Default for StompCodec {
    fn default() -> Self {
        Self::new(StompVersion::V1_2, 1024 * 1024)
    }
}

/// Position of the next `\n` at or after `from`
fn find_eol(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..].iter().position(|&b| b == b'\n').map(|p| p + from)
}

/// Line content without the trailing `\r`
fn line_at(buf: &[u8], start: usize, eol: usize) -> &[u8] {
    let line = &buf[start..eol];
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn skip_heartbeats(src: &mut BytesMut) {
    let mut skip = 0;
    loop {
        match &src[skip..] {
            [b'\n', ..] => skip += 1,
            [b'\r', b'\n', ..] => skip += 2,
            _ => break,
        }
    }
    if skip > 0 {
        let _ = src.split_to(skip);
    }
}

impl Decoder for StompCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        skip_heartbeats(src);
        if src.is_empty() {
            return Ok(None);
        }

        // Command line
        let Some(cmd_eol) = find_eol(src, 0) else {
            self.check_size(src.len())?;
            return Ok(None);
        };
        let command_line = line_at(src, 0, cmd_eol);
        if command_line.contains(&b':') {
            return Err(FrameError::HeaderBeforeCommand);
        }
        let command_text = std::str::from_utf8(command_line)
            .map_err(|_| FrameError::UnknownCommand(String::from_utf8_lossy(command_line).into()))?;
        let command: Command = command_text.parse().map_err(FrameError::UnknownCommand)?;

        let unescape = self.version.escapes_headers() && !command.is_connect_family();

        // Header block
        let mut headers = Vec::new();
        let mut content_length: Option<usize> = None;
        let mut pos = cmd_eol + 1;
        let body_start = loop {
            let Some(eol) = find_eol(src, pos) else {
                self.check_size(src.len())?;
                return Ok(None);
            };
            let line = line_at(src, pos, eol);
            if line.is_empty() {
                break eol + 1;
            }
            let text = std::str::from_utf8(line)
                .map_err(|_| FrameError::MalformedHeader("header is not UTF-8".to_string()))?;
            let Some((raw_name, raw_value)) = text.split_once(':') else {
                return Err(FrameError::MalformedHeader(text.to_string()));
            };
            let (name, value) = if unescape {
                (
                    unescape_header(raw_name).map_err(FrameError::InvalidEscape)?,
                    unescape_header(raw_value).map_err(FrameError::InvalidEscape)?,
                )
            } else {
                (raw_name.to_string(), raw_value.to_string())
            };
            if name == HEADER_CONTENT_LENGTH {
                if content_length.is_some() {
                    return Err(FrameError::DuplicateContentLength);
                }
                let len = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| FrameError::InvalidContentLength(value.clone()))?;
                // Reject before any offset arithmetic on the client's number
                if len > self.max_frame_bytes {
                    return Err(FrameError::TooLarge(self.max_frame_bytes));
                }
                content_length = Some(len);
            }
            headers.push((name, value));
            pos = eol + 1;
        };

        // Body: content-length is authoritative, otherwise read to NUL
        let body_end = match content_length {
            Some(len) => {
                let end = body_start
                    .checked_add(len)
                    .ok_or(FrameError::TooLarge(self.max_frame_bytes))?;
                if src.len() <= end {
                    self.check_size(end.saturating_add(1))?;
                    return Ok(None);
                }
                if src[end] != 0 {
                    return Err(FrameError::MissingTerminator);
                }
                end
            },
            None => match src[body_start..].iter().position(|&b| b == 0) {
                Some(p) => body_start + p,
                None => {
                    self.check_size(src.len())?;
                    return Ok(None);
                },
            },
        };
        self.check_size(body_end + 1)?;

        let mut raw = src.split_to(body_end + 1).freeze();
        let body = raw.split_off(body_start).slice(..body_end - body_start);

        Ok(Some(Frame {
            command,
            headers,
            body,
        }))
    }
}

fn write_frame(frame: &Frame, version: StompVersion, dst: &mut BytesMut) {
    let escape = version.escapes_headers() && !frame.command.is_connect_family();
    dst.put_slice(frame.command.as_str().as_bytes());
    dst.put_u8(b'\n');
    for (name, value) in &frame.headers {
        if escape {
            dst.put_slice(escape_header(name).as_bytes());
            dst.put_u8(b':');
            dst.put_slice(escape_header(value).as_bytes());
        } else {
            dst.put_slice(name.as_bytes());
            dst.put_u8(b':');
            dst.put_slice(value.as_bytes());
        }
        dst.put_u8(b'\n');
    }
    dst.put_u8(b'\n');
    dst.put_slice(&frame.body);
    dst.put_u8(0);
}

impl Encoder<&Frame> for StompCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: &Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        write_frame(frame, self.version, dst);
        Ok(())
    }
}
