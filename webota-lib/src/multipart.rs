//! Streaming `multipart/form-data` decoder.
//!
//! The body is fed in whatever pieces the transport reads. File contents are
//! handed out as they arrive, without buffering the whole part; text fields are
//! buffered up to [`MAX_FIELD_LEN`] bytes.

use log::debug;

/// Longest boundary allowed by RFC 2046.
pub const MAX_BOUNDARY_LEN: usize = 70;
/// Largest header block accepted for a single part.
pub const MAX_HEADER_LEN: usize = 1024;
/// Largest text field value accepted.
pub const MAX_FIELD_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, derive_more::Error)]
pub enum MultipartError {
    #[display("Content-Type is not multipart/form-data with a boundary")]
    MissingBoundary,
    #[display("multipart boundary longer than 70 bytes")]
    BoundaryTooLong,
    #[display("malformed part headers")]
    MalformedHeaders,
    #[display("part headers larger than 1024 bytes")]
    HeadersTooLarge,
    #[display("form field larger than 256 bytes")]
    FieldTooLarge,
    #[display("body ended before the closing boundary")]
    Truncated,
}

/// A decoded piece of the body.
#[derive(Debug, PartialEq, Eq)]
pub enum Part<'p> {
    /// A complete text field
    Field { name: String, value: String },
    /// A part with a `filename` parameter begins
    FileStart { name: String, filename: String },
    /// Next bytes of the current file part
    FileData(&'p [u8]),
    /// The current file part is complete
    FileEnd,
}

#[derive(Debug)]
enum State {
    /// Before the first delimiter
    Preamble,
    /// After a delimiter: either `--` (close) or CRLF (next part)
    Delimiter,
    Headers,
    Field { name: String, value: Vec<u8> },
    File,
    /// Closing delimiter seen; everything after it is ignored
    Done,
    Failed(MultipartError),
}

#[derive(Debug)]
pub struct MultipartDecoder {
    /// `CRLF -- boundary`
    delimiter: Vec<u8>,
    buf: Vec<u8>,
    state: State,
}

impl MultipartDecoder {
    /// Build a decoder from a `Content-Type` header value.
    pub fn from_content_type(content_type: &str) -> Result<Self, MultipartError> {
        let mut params = content_type.split(';');
        let mime = params.next().unwrap_or_default().trim();
        if !mime.eq_ignore_ascii_case("multipart/form-data") {
            return Err(MultipartError::MissingBoundary);
        }

        let boundary = params
            .filter_map(|p| p.split_once('='))
            .find(|(key, _)| key.trim().eq_ignore_ascii_case("boundary"))
            .map(|(_, value)| unquote(value.trim()))
            .ok_or(MultipartError::MissingBoundary)?;
        Self::new(boundary)
    }

    /// Build a decoder for a known boundary.
    pub fn new(boundary: &str) -> Result<Self, MultipartError> {
        if boundary.is_empty() {
            return Err(MultipartError::MissingBoundary);
        }
        if boundary.len() > MAX_BOUNDARY_LEN {
            return Err(MultipartError::BoundaryTooLong);
        }

        let mut delimiter = Vec::with_capacity(boundary.len() + 4);
        delimiter.extend_from_slice(b"\r\n--");
        delimiter.extend_from_slice(boundary.as_bytes());
        debug!("Multipart: boundary {boundary:?}");

        Ok(Self {
            delimiter,
            // The first delimiter may start the body without a preceding CRLF
            buf: b"\r\n".to_vec(),
            state: State::Preamble,
        })
    }

    /// Decode the next piece of the body.
    ///
    /// Once an error is returned every later call returns it again.
    pub fn feed(&mut self, data: &[u8], mut emit: impl FnMut(Part<'_>)) -> Result<(), MultipartError> {
        if let State::Failed(e) = &self.state {
            return Err(e.clone());
        }
        self.buf.extend_from_slice(data);

        let result = self.process(&mut emit);
        if let Err(e) = &result {
            debug!("Multipart: {e}");
            self.state = State::Failed(e.clone());
            self.buf.clear();
        }
        result
    }

    /// Check that the closing delimiter was seen.
    pub fn finish(&self) -> Result<(), MultipartError> {
        match &self.state {
            State::Done => Ok(()),
            State::Failed(e) => Err(e.clone()),
            _ => Err(MultipartError::Truncated),
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    fn process(&mut self, emit: &mut impl FnMut(Part<'_>)) -> Result<(), MultipartError> {
        loop {
            match std::mem::replace(&mut self.state, State::Done) {
                State::Preamble => {
                    if let Some(at) = find(&self.buf, &self.delimiter) {
                        self.buf.drain(..at + self.delimiter.len());
                        self.state = State::Delimiter;
                    } else {
                        let keep = self.delimiter.len() - 1;
                        if self.buf.len() > keep {
                            self.buf.drain(..self.buf.len() - keep);
                        }
                        self.state = State::Preamble;
                        return Ok(());
                    }
                }
                State::Delimiter => {
                    if self.buf.starts_with(b"--") {
                        self.buf.clear();
                        return Ok(());
                    } else if self.buf.starts_with(b"\r\n") {
                        self.buf.drain(..2);
                        self.state = State::Headers;
                    } else if matches!(self.buf.first(), Some(b' ' | b'\t')) {
                        // Transport padding after the boundary
                        self.buf.drain(..1);
                        self.state = State::Delimiter;
                    } else if self.buf.len() < 2 {
                        self.state = State::Delimiter;
                        return Ok(());
                    } else {
                        return Err(MultipartError::MalformedHeaders);
                    }
                }
                State::Headers => {
                    if self.buf.starts_with(b"\r\n") {
                        // No Content-Disposition at all
                        return Err(MultipartError::MalformedHeaders);
                    }
                    match find(&self.buf, b"\r\n\r\n") {
                        Some(at) if at <= MAX_HEADER_LEN => {
                            let headers = PartHeaders::parse(&self.buf[..at])?;
                            self.buf.drain(..at + 4);
                            if let Some(filename) = headers.filename {
                                emit(Part::FileStart {
                                    name: headers.name,
                                    filename,
                                });
                                self.state = State::File;
                            } else {
                                self.state = State::Field {
                                    name: headers.name,
                                    value: Vec::new(),
                                };
                            }
                        }
                        Some(_) => return Err(MultipartError::HeadersTooLarge),
                        None if self.buf.len() > MAX_HEADER_LEN + 3 => {
                            return Err(MultipartError::HeadersTooLarge);
                        }
                        None => {
                            self.state = State::Headers;
                            return Ok(());
                        }
                    }
                }
                State::Field { name, mut value } => {
                    let (len, closed) = self.scan_body();
                    if value.len() + len > MAX_FIELD_LEN {
                        return Err(MultipartError::FieldTooLarge);
                    }
                    value.extend_from_slice(&self.buf[..len]);
                    if closed {
                        self.buf.drain(..len + self.delimiter.len());
                        emit(Part::Field {
                            name,
                            value: String::from_utf8_lossy(&value).into_owned(),
                        });
                        self.state = State::Delimiter;
                    } else {
                        self.buf.drain(..len);
                        self.state = State::Field { name, value };
                        return Ok(());
                    }
                }
                State::File => {
                    let (len, closed) = self.scan_body();
                    if len > 0 {
                        emit(Part::FileData(&self.buf[..len]));
                    }
                    if closed {
                        self.buf.drain(..len + self.delimiter.len());
                        emit(Part::FileEnd);
                        self.state = State::Delimiter;
                    } else {
                        self.buf.drain(..len);
                        self.state = State::File;
                        return Ok(());
                    }
                }
                State::Done => {
                    self.buf.clear();
                    return Ok(());
                }
                State::Failed(e) => {
                    self.state = State::Failed(e.clone());
                    return Err(e);
                }
            }
        }
    }

    /// How much of the buffer belongs to the current part, and whether the
    /// part ends there. The tail that could start a delimiter is held back.
    fn scan_body(&self) -> (usize, bool) {
        match find(&self.buf, &self.delimiter) {
            Some(at) => (at, true),
            None => (self.buf.len().saturating_sub(self.delimiter.len() - 1), false),
        }
    }
}

struct PartHeaders {
    name: String,
    filename: Option<String>,
}

impl PartHeaders {
    fn parse(block: &[u8]) -> Result<Self, MultipartError> {
        let block = std::str::from_utf8(block).map_err(|_| MultipartError::MalformedHeaders)?;

        let mut disposition = None;
        for line in block.split("\r\n") {
            let (key, value) = line
                .split_once(':')
                .ok_or(MultipartError::MalformedHeaders)?;
            if key.trim().eq_ignore_ascii_case("content-disposition") {
                disposition = Some(value.trim());
            }
        }

        let mut params = disposition
            .ok_or(MultipartError::MalformedHeaders)?
            .split(';');
        if !params
            .next()
            .is_some_and(|kind| kind.trim().eq_ignore_ascii_case("form-data"))
        {
            return Err(MultipartError::MalformedHeaders);
        }

        let mut name = None;
        let mut filename = None;
        for param in params {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            match key.trim().to_ascii_lowercase().as_str() {
                "name" => name = Some(unquote(value.trim()).to_string()),
                "filename" => filename = Some(unquote(value.trim()).to_string()),
                _ => {}
            }
        }

        Ok(Self {
            name: name.ok_or(MultipartError::MalformedHeaders)?,
            filename,
        })
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDARY: &str = "----WebKitFormBoundary7MA4YWxkTrZu0gW";

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Owned {
        Field(String, String),
        FileStart(String, String),
        FileData(Vec<u8>),
        FileEnd,
    }

    fn body(parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, filename, content) in parts {
            out.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match filename {
                Some(f) => out.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{f}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                ),
                None => out.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            out.extend_from_slice(content);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        out
    }

    /// Decode `data` in pieces of `chunk` bytes, merging adjacent file data.
    fn decode(data: &[u8], chunk: usize) -> Result<Vec<Owned>, MultipartError> {
        let mut decoder = MultipartDecoder::new(BOUNDARY)?;
        let mut parts: Vec<Owned> = Vec::new();
        for piece in data.chunks(chunk) {
            decoder.feed(piece, |part| match part {
                Part::Field { name, value } => parts.push(Owned::Field(name, value)),
                Part::FileStart { name, filename } => parts.push(Owned::FileStart(name, filename)),
                Part::FileData(bytes) => match parts.last_mut() {
                    Some(Owned::FileData(acc)) => acc.extend_from_slice(bytes),
                    _ => parts.push(Owned::FileData(bytes.to_vec())),
                },
                Part::FileEnd => parts.push(Owned::FileEnd),
            })?;
        }
        decoder.finish()?;
        Ok(parts)
    }

    fn image() -> Vec<u8> {
        // Contains CRLFs, dashes and a near-miss of the delimiter
        let mut image: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
        image.extend_from_slice(format!("\r\n--{}", &BOUNDARY[..20]).as_bytes());
        image.extend_from_slice(b"\r\n\r\n--\r\n-");
        image
    }

    #[test]
    fn test_every_chunk_split_decodes_the_same() {
        let image = image();
        let data = body(&[
            ("password", None, b"secret123"),
            ("firmware", Some("firmware.bin"), &image),
        ]);
        let expected = vec![
            Owned::Field("password".to_string(), "secret123".to_string()),
            Owned::FileStart("firmware".to_string(), "firmware.bin".to_string()),
            Owned::FileData(image.clone()),
            Owned::FileEnd,
        ];
        for chunk in (1..=64).chain([100, 511, 1024, 4096, data.len()]) {
            assert_eq!(decode(&data, chunk).unwrap(), expected, "chunk={chunk}");
        }
    }

    #[test]
    fn test_preamble_and_epilogue_are_ignored() {
        let mut data = b"This is a preamble\r\n".to_vec();
        data.extend(body(&[("a", None, b"1")]));
        data.extend_from_slice(b"epilogue with --junk\r\n");
        assert_eq!(
            decode(&data, 7).unwrap(),
            vec![Owned::Field("a".to_string(), "1".to_string())]
        );
    }

    #[test]
    fn test_empty_file_part() {
        let data = body(&[("firmware", Some(""), b"")]);
        assert_eq!(
            decode(&data, 3).unwrap(),
            vec![
                Owned::FileStart("firmware".to_string(), String::new()),
                Owned::FileEnd
            ]
        );
    }

    #[test]
    fn test_truncated_body() {
        let data = body(&[("firmware", Some("fw.bin"), b"0123456789")]);
        let cut = &data[..data.len() - 10];
        assert_eq!(decode(cut, 16), Err(MultipartError::Truncated));
        assert_eq!(decode(&[], 1), Err(MultipartError::Truncated));
    }

    #[test]
    fn test_field_too_large() {
        let value = vec![b'x'; MAX_FIELD_LEN + 1];
        let data = body(&[("password", None, &value)]);
        assert_eq!(decode(&data, 50), Err(MultipartError::FieldTooLarge));

        let value = vec![b'x'; MAX_FIELD_LEN];
        assert!(decode(&body(&[("password", None, &value)]), 50).is_ok());
    }

    #[test]
    fn test_headers_too_large() {
        let mut data = format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"a\"\r\n").into_bytes();
        data.extend_from_slice(format!("X-Padding: {}\r\n\r\n", "p".repeat(MAX_HEADER_LEN)).as_bytes());
        assert_eq!(decode(&data, 64), Err(MultipartError::HeadersTooLarge));
    }

    #[test]
    fn test_malformed_headers() {
        let no_name = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data\r\n\r\nx\r\n--{BOUNDARY}--\r\n"
        );
        assert_eq!(decode(no_name.as_bytes(), 5), Err(MultipartError::MalformedHeaders));

        let no_disposition = format!(
            "--{BOUNDARY}\r\nContent-Type: text/plain\r\n\r\nx\r\n--{BOUNDARY}--\r\n"
        );
        assert_eq!(
            decode(no_disposition.as_bytes(), 5),
            Err(MultipartError::MalformedHeaders)
        );

        let garbage_after_boundary = format!("--{BOUNDARY}xx\r\n");
        assert_eq!(
            decode(garbage_after_boundary.as_bytes(), 5),
            Err(MultipartError::MalformedHeaders)
        );
    }

    #[test]
    fn test_error_is_sticky() {
        let mut decoder = MultipartDecoder::new(BOUNDARY).unwrap();
        let bad = format!("--{BOUNDARY}\r\nbogus\r\n\r\n");
        assert!(decoder.feed(bad.as_bytes(), |_| {}).is_err());
        assert_eq!(
            decoder.feed(b"anything", |_| panic!("no parts after an error")),
            Err(MultipartError::MalformedHeaders)
        );
        assert_eq!(decoder.finish(), Err(MultipartError::MalformedHeaders));
    }

    #[test]
    fn test_content_type_parsing() {
        assert!(MultipartDecoder::from_content_type(&format!(
            "multipart/form-data; boundary={BOUNDARY}"
        ))
        .is_ok());
        assert!(MultipartDecoder::from_content_type("Multipart/Form-Data; charset=utf-8; BOUNDARY=\"abc def\"").is_ok());
        assert_eq!(
            MultipartDecoder::from_content_type("application/octet-stream").err(),
            Some(MultipartError::MissingBoundary)
        );
        assert_eq!(
            MultipartDecoder::from_content_type("multipart/form-data").err(),
            Some(MultipartError::MissingBoundary)
        );
        assert_eq!(
            MultipartDecoder::from_content_type("multipart/form-data; boundary=\"\"").err(),
            Some(MultipartError::MissingBoundary)
        );
        assert_eq!(
            MultipartDecoder::from_content_type(&format!(
                "multipart/form-data; boundary={}",
                "b".repeat(MAX_BOUNDARY_LEN + 1)
            ))
            .err(),
            Some(MultipartError::BoundaryTooLong)
        );
    }

    #[test]
    fn test_quoted_boundary_decodes() {
        let mut decoder = MultipartDecoder::from_content_type("multipart/form-data; boundary=\"q b\"").unwrap();
        let mut fields = Vec::new();
        decoder
            .feed(
                b"--q b\r\nContent-Disposition: form-data; name=\"k\"\r\n\r\nv\r\n--q b--",
                |part| {
                    if let Part::Field { name, value } = part {
                        fields.push((name, value));
                    }
                },
            )
            .unwrap();
        assert!(decoder.is_done());
        assert_eq!(fields, vec![("k".to_string(), "v".to_string())]);
    }
}
