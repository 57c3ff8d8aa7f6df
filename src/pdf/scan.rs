//! Content stream scanning ahead of decoding
//!
//! `lopdf` stops decoding at the first token it cannot make sense of and hands
//! back the operations read so far. The scanner walks the raw bytes first: it
//! checks that strings, arrays and dictionaries are closed, counts operators so
//! a short decode can be detected, and splits inline images out so their data
//! is carried over byte for byte.

use lopdf::content::Content;
use lopdf::{Dictionary, Object};

/// A run of a content stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment<'a> {
    /// Ordinary operations; `operators` is how many the bytes hold
    Operations { bytes: &'a [u8], operators: usize },
    /// `BI ... ID data EI`; `header` is the key/value pairs up to and including `ID`
    InlineImage { header: &'a [u8], data: &'a [u8] },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    Operand,
    Open,
    Close,
    Keyword(&'a [u8]),
}

/// Split a content stream into operation runs and inline images
///
/// Fails with a description of the first structural problem: an unterminated
/// string, array or dictionary, a stray delimiter, or operands left over at the
/// end of the stream.
pub(crate) fn split_content(input: &[u8]) -> Result<Vec<Segment<'_>>, String> {
    let mut scanner = Scanner::new(input);
    let mut segments = Vec::new();
    let mut start = 0;
    let mut operators = 0;
    let mut nesting = 0usize;
    let mut operands = false;

    while let Some(token) = scanner.next_token()? {
        match token {
            Token::Operand | Token::Keyword(b"true" | b"false" | b"null") => operands = true,
            Token::Open => nesting += 1,
            Token::Close => {
                nesting = nesting
                    .checked_sub(1)
                    .ok_or_else(|| scanner.error("closing delimiter without an opening one"))?;
                operands = true;
            }
            Token::Keyword(b"BI") => {
                if nesting > 0 || operands {
                    return Err(scanner.error("BI inside an operand list"));
                }
                if operators > 0 {
                    segments.push(Segment::Operations {
                        bytes: &input[start..scanner.position - 2],
                        operators,
                    });
                }
                let (header, data) = scanner.inline_image()?;
                segments.push(Segment::InlineImage { header, data });
                start = scanner.position;
                operators = 0;
            }
            Token::Keyword(_) => {
                if nesting > 0 {
                    return Err(scanner.error("operator inside an array or dictionary"));
                }
                operators += 1;
                operands = false;
            }
        }
    }

    if nesting > 0 {
        return Err("unterminated array or dictionary".to_string());
    }
    if operands {
        return Err("operands without an operator at the end of the stream".to_string());
    }
    if operators > 0 {
        segments.push(Segment::Operations {
            bytes: &input[start..],
            operators,
        });
    }
    Ok(segments)
}

struct Scanner<'a> {
    input: &'a [u8],
    position: usize,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input, position: 0 }
    }

    fn error(&self, message: &str) -> String {
        format!("{} at byte {}", message, self.position)
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.input.get(self.position + offset).copied()
    }

    fn next_token(&mut self) -> Result<Option<Token<'a>>, String> {
        self.skip_whitespace();
        let Some(ch) = self.peek(0) else {
            return Ok(None);
        };

        let token = match ch {
            b'(' => {
                self.skip_literal_string()?;
                Token::Operand
            }
            b'<' if self.peek(1) == Some(b'<') => {
                self.position += 2;
                Token::Open
            }
            b'>' if self.peek(1) == Some(b'>') => {
                self.position += 2;
                Token::Close
            }
            b'<' => {
                self.skip_hex_string()?;
                Token::Operand
            }
            b'[' => {
                self.position += 1;
                Token::Open
            }
            b']' => {
                self.position += 1;
                Token::Close
            }
            b'/' => {
                self.position += 1;
                self.skip_regular();
                Token::Operand
            }
            b')' | b'>' | b'{' | b'}' => return Err(self.error(&format!("unexpected '{}'", ch as char))),
            _ => {
                let start = self.position;
                self.skip_regular();
                let word = &self.input[start..self.position];
                if matches!(word[0], b'+' | b'-' | b'.' | b'0'..=b'9') {
                    Token::Operand
                } else {
                    Token::Keyword(word)
                }
            }
        };
        Ok(Some(token))
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.peek(0) {
            match ch {
                b'%' => {
                    while self.peek(0).is_some_and(|c| c != b'\r' && c != b'\n') {
                        self.position += 1;
                    }
                }
                _ if is_whitespace(ch) => self.position += 1,
                _ => break,
            }
        }
    }

    fn skip_regular(&mut self) {
        while self.peek(0).is_some_and(is_regular) {
            self.position += 1;
        }
    }

    fn skip_literal_string(&mut self) -> Result<(), String> {
        let start = self.position;
        self.position += 1;
        let mut depth = 1;
        while let Some(ch) = self.peek(0) {
            self.position += 1;
            match ch {
                // The escaped byte never opens or closes anything
                b'\\' => self.position += 1,
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
        Err(format!("unterminated string starting at byte {}", start))
    }

    fn skip_hex_string(&mut self) -> Result<(), String> {
        let start = self.position;
        self.position += 1;
        while let Some(ch) = self.peek(0) {
            self.position += 1;
            match ch {
                b'>' => return Ok(()),
                _ if ch.is_ascii_hexdigit() || is_whitespace(ch) => {}
                _ => return Err(format!("invalid byte {:#04x} in hex string starting at byte {}", ch, start)),
            }
        }
        Err(format!("unterminated hex string starting at byte {}", start))
    }

    /// Read an inline image whose `BI` was just consumed
    fn inline_image(&mut self) -> Result<(&'a [u8], &'a [u8]), String> {
        let header_start = self.position;
        loop {
            match self.next_token()? {
                Some(Token::Keyword(b"ID")) => break,
                Some(Token::Keyword(b"true" | b"false" | b"null")) => {}
                Some(Token::Keyword(_)) => return Err(self.error("operator inside an inline image dictionary")),
                Some(_) => {}
                None => return Err("inline image without ID".to_string()),
            }
        }
        let header = &self.input[header_start..self.position];

        // A single white-space byte separates ID from the data
        match (self.peek(0), self.peek(1)) {
            (Some(b'\r'), Some(b'\n')) => self.position += 2,
            (Some(ch), _) if is_whitespace(ch) => self.position += 1,
            _ => {}
        }
        let data_start = self.position;

        if let Some(length) = inline_data_len(header) {
            let data_end = data_start + length;
            if data_end <= self.input.len() {
                self.position = data_end;
                self.skip_whitespace();
                if self.at_end_marker() {
                    self.position += 2;
                    return Ok((header, &self.input[data_start..data_end]));
                }
            }
            self.position = data_start;
        }

        // Without a usable length the data ends at the first white-space delimited EI
        let mut cursor = data_start;
        while cursor + 2 <= self.input.len() {
            self.position = cursor;
            let after_space = cursor == data_start || is_whitespace(self.input[cursor - 1]);
            if after_space && self.at_end_marker() {
                let data_end = if cursor > data_start { cursor - 1 } else { cursor };
                self.position = cursor + 2;
                return Ok((header, &self.input[data_start..data_end]));
            }
            cursor += 1;
        }
        Err(format!("inline image data starting at byte {} has no EI", data_start))
    }

    fn at_end_marker(&self) -> bool {
        self.peek(0) == Some(b'E')
            && self.peek(1) == Some(b'I')
            && self.peek(2).map_or(true, |ch| is_whitespace(ch) || is_delimiter(ch))
    }
}

/// Byte length of unfiltered inline image data, when the header pins it down
fn inline_data_len(header: &[u8]) -> Option<usize> {
    let operation = Content::decode(header).ok()?.operations.into_iter().next()?;
    let dict = inline_dictionary(&operation.operands)?;
    let get = |short: &[u8], long: &[u8]| dict.get(short).or_else(|_| dict.get(long)).ok();

    if get(b"F", b"Filter").is_some() {
        return None;
    }
    let width = usize::try_from(get(b"W", b"Width")?.as_i64().ok()?).ok()?;
    let height = usize::try_from(get(b"H", b"Height")?.as_i64().ok()?).ok()?;
    let mask = matches!(get(b"IM", b"ImageMask"), Some(Object::Boolean(true)));
    let bits = if mask {
        1
    } else {
        usize::try_from(get(b"BPC", b"BitsPerComponent")?.as_i64().ok()?).ok()?
    };
    let components = if mask {
        1
    } else {
        match get(b"CS", b"ColorSpace")? {
            Object::Name(name) => match name.as_slice() {
                b"G" | b"DeviceGray" => 1,
                b"RGB" | b"DeviceRGB" => 3,
                b"CMYK" | b"DeviceCMYK" => 4,
                _ => return None,
            },
            _ => return None,
        }
    };

    let stride = width.checked_mul(components)?.checked_mul(bits)?.div_ceil(8);
    height.checked_mul(stride)
}

/// Key/value operands of an inline image header as a dictionary
pub(crate) fn inline_dictionary(operands: &[Object]) -> Option<Dictionary> {
    if operands.len() % 2 != 0 {
        return None;
    }
    let mut dict = Dictionary::new();
    for pair in operands.chunks(2) {
        match pair {
            [Object::Name(key), value] => dict.set(key.clone(), value.clone()),
            _ => return None,
        }
    }
    Some(dict)
}

fn is_whitespace(ch: u8) -> bool {
    matches!(ch, b' ' | b'\t' | b'\n' | b'\r' | b'\0' | b'\x0C')
}

fn is_delimiter(ch: u8) -> bool {
    matches!(ch, b'(' | b')' | b'<' | b'>' | b'[' | b']' | b'{' | b'}' | b'/' | b'%')
}

fn is_regular(ch: u8) -> bool {
    !is_whitespace(ch) && !is_delimiter(ch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operator_counts(input: &[u8]) -> Vec<usize> {
        split_content(input)
            .unwrap()
            .iter()
            .map(|segment| match segment {
                Segment::Operations { operators, .. } => *operators,
                Segment::InlineImage { .. } => 0,
            })
            .collect()
    }

    #[test]
    fn test_counts_operators() {
        assert_eq!(operator_counts(b"q 1 0 0 1 0 0 cm BT /F1 12 Tf (a) Tj ET Q"), vec![5]);
        assert_eq!(operator_counts(b"[(a) -20 (b)] TJ % trailing comment"), vec![1]);
        assert_eq!(operator_counts(b"/P <</MCID 0 /Alt (x\\)y)>> BDC EMC"), vec![2]);
        assert!(split_content(b"  \n").unwrap().is_empty());
    }

    #[test]
    fn test_truncated_streams_rejected() {
        for input in [
            b"BT /F1 12 Tf (Hello) Tj ET 0 0 m (unterminated".as_slice(),
            b"BT /F1 12 Tf <4142 Tj",
            b"q 1 0 0 1 0 0 cm [1 2 Q",
            b"BT /F1 12 Tf ET }}} 1 1 l",
            b"0 0 m 10 10",
            b"<</A 1 BDC",
            b"] TJ",
        ] {
            assert!(split_content(input).is_err(), "{}", String::from_utf8_lossy(input));
        }
    }

    #[test]
    fn test_inline_image_with_known_length() {
        // The data itself contains " EI "
        let input = b"q BI /W 2 /H 1 /BPC 8 /CS /RGB ID \x01 EI \x05\x06 EI Q";
        let segments = split_content(input).unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0], Segment::Operations { bytes: b"q ", operators: 1 });
        assert_eq!(
            segments[1],
            Segment::InlineImage {
                header: b" /W 2 /H 1 /BPC 8 /CS /RGB ID",
                data: b"\x01 EI \x05\x06",
            }
        );
        assert_eq!(segments[2], Segment::Operations { bytes: b" Q", operators: 1 });
    }

    #[test]
    fn test_inline_image_found_by_end_marker() {
        let input = b"BI /W 4 /H 4 /BPC 8 /CS /CS0 /F /AHx ID\n0a0bEI0c\nEI\nS";
        match &split_content(input).unwrap()[0] {
            Segment::InlineImage { data, .. } => assert_eq!(*data, b"0a0bEI0c"),
            other => panic!("expected an inline image, got {:?}", other),
        }
    }

    #[test]
    fn test_inline_image_without_end() {
        assert!(split_content(b"BI /W 1 /H 1 /CS /G /BPC 8 ID").is_err());
        assert!(split_content(b"BI /W 1 /H 1").is_err());
    }
}
