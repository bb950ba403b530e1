use super::{sha1_of, BencodeError, BencodeKind, BencodeResult, BencodeValue, Span};

use tracing::instrument;

/// Decodes a complete bencode document.
///
/// The whole buffer must be consumed; anything left after the first value is
/// reported as `TrailingGarbage`. Use [`decode_prefix`] when the value is
/// embedded in a larger stream.
///
/// # Example
/// For input `b"i42e"` this returns an `Integer(42)` whose span covers the
/// entire input.
#[instrument(skip(buf), level = "trace", fields(len = buf.len()))]
pub fn decode(buf: &[u8]) -> BencodeResult<BencodeValue> {
    let (value, consumed) = decode_prefix(buf)?;
    if consumed != buf.len() {
        return Err(BencodeError::TrailingGarbage { pos: consumed });
    }
    Ok(value)
}

/// Decodes the first bencode value in `buf`, returning it together with the
/// number of bytes consumed.
pub fn decode_prefix(buf: &[u8]) -> BencodeResult<(BencodeValue, usize)> {
    let mut cursor = Cursor { buf, pos: 0 };
    let value = cursor.decode_value()?;
    Ok((value, cursor.pos))
}

/// Positional reader over the source buffer.
///
/// Decoding tracks a single offset into the original bytes; every value's
/// span is `[offset before, offset after)`, which is what makes per-node
/// digests possible without re-encoding.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> BencodeResult<u8> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn bump(&mut self) -> BencodeResult<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, n: usize) -> BencodeResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or(BencodeError::LengthOverflow { pos: self.pos })?;
        if end > self.buf.len() {
            return Err(BencodeError::UnexpectedEof);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Consumes the byte `expected` or fails with `Unexpected`.
    fn expect(&mut self, expected: u8) -> BencodeResult<()> {
        let pos = self.pos;
        let byte = self.bump()?;
        if byte != expected {
            return Err(BencodeError::Unexpected { byte, pos });
        }
        Ok(())
    }

    fn decode_value(&mut self) -> BencodeResult<BencodeValue> {
        let start = self.pos;
        let kind = match self.peek()? {
            b'0'..=b'9' => BencodeKind::Bytes(self.decode_bytes()?),
            b'i' => BencodeKind::Integer(self.decode_integer()?),
            b'l' => BencodeKind::List(self.decode_list()?),
            b'd' => BencodeKind::Dict(self.decode_dict()?),
            byte => {
                return Err(BencodeError::Unexpected {
                    byte,
                    pos: self.pos,
                })
            }
        };
        let span = Span {
            start,
            end: self.pos,
        };
        Ok(BencodeValue {
            kind,
            digest: sha1_of(&self.buf[span.start..span.end]),
            span,
        })
    }

    /// `i<decimal>e`, full i64 range; no leading zeros, no `-0`.
    fn decode_integer(&mut self) -> BencodeResult<i64> {
        self.expect(b'i')?;
        let digits_start = self.pos;

        let negative = if self.peek()? == b'-' {
            self.bump()?;
            true
        } else {
            false
        };

        let mut value: i64 = 0;
        let mut digit_count = 0usize;
        let mut leading_zero = false;
        loop {
            let pos = self.pos;
            match self.bump()? {
                b'e' => break,
                byte @ b'0'..=b'9' => {
                    if digit_count == 0 && byte == b'0' {
                        leading_zero = true;
                    } else if leading_zero {
                        return Err(BencodeError::InvalidLeadingZero { pos: digits_start });
                    }
                    digit_count += 1;
                    let digit = i64::from(byte - b'0');
                    // Accumulate negated so that i64::MIN parses.
                    value = value
                        .checked_mul(10)
                        .and_then(|v| v.checked_sub(digit))
                        .ok_or(BencodeError::InvalidInteger { pos: digits_start })?;
                }
                byte => return Err(BencodeError::Unexpected { byte, pos }),
            }
        }

        if digit_count == 0 {
            return Err(BencodeError::InvalidInteger { pos: digits_start });
        }
        if negative && leading_zero {
            return Err(BencodeError::NegativeZero { pos: digits_start });
        }
        if negative {
            Ok(value)
        } else {
            value
                .checked_neg()
                .ok_or(BencodeError::InvalidInteger { pos: digits_start })
        }
    }

    /// `<decimal length>:<raw bytes>`; a zero length is legal.
    fn decode_bytes(&mut self) -> BencodeResult<Vec<u8>> {
        let length_start = self.pos;
        let mut length: usize = 0;
        loop {
            let pos = self.pos;
            match self.bump()? {
                b':' => break,
                byte @ b'0'..=b'9' => {
                    length = length
                        .checked_mul(10)
                        .and_then(|l| l.checked_add(usize::from(byte - b'0')))
                        .ok_or(BencodeError::LengthOverflow { pos: length_start })?;
                }
                byte => return Err(BencodeError::Unexpected { byte, pos }),
            }
        }
        Ok(self.take(length)?.to_vec())
    }

    /// `l ... e`, zero or more values.
    fn decode_list(&mut self) -> BencodeResult<Vec<BencodeValue>> {
        self.expect(b'l')?;
        let mut list = Vec::new();
        while self.peek()? != b'e' {
            list.push(self.decode_value()?);
        }
        self.bump()?;
        Ok(list)
    }

    /// `d ... e`; keys are byte strings in strictly ascending byte order.
    fn decode_dict(&mut self) -> BencodeResult<Vec<(Vec<u8>, BencodeValue)>> {
        self.expect(b'd')?;
        let mut dict: Vec<(Vec<u8>, BencodeValue)> = Vec::new();
        while self.peek()? != b'e' {
            let key_pos = self.pos;
            match self.peek()? {
                b'0'..=b'9' => {}
                byte => return Err(BencodeError::Unexpected { byte, pos: key_pos }),
            }
            let key = self.decode_bytes()?;
            if let Some((prev, _)) = dict.last() {
                match prev.as_slice().cmp(&key) {
                    std::cmp::Ordering::Less => {}
                    std::cmp::Ordering::Equal => {
                        return Err(BencodeError::DuplicateKey { pos: key_pos })
                    }
                    std::cmp::Ordering::Greater => {
                        return Err(BencodeError::UnsortedKeys { pos: key_pos })
                    }
                }
            }
            let value = self.decode_value()?;
            dict.push((key, value));
        }
        self.bump()?;
        Ok(dict)
    }
}
