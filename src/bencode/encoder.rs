use super::{BencodeKind, BencodeResult, BencodeValue};

use std::io::Write;
use tracing::instrument;

fn encode_bytes<W: Write>(writer: &mut W, s: &[u8]) -> BencodeResult<()> {
    write!(writer, "{}:", s.len())?;
    writer.write_all(s)?;
    Ok(())
}

fn encode_integer<W: Write>(writer: &mut W, i: i64) -> BencodeResult<()> {
    write!(writer, "i{}e", i)?;
    Ok(())
}

fn encode_list<W: Write>(writer: &mut W, list: &[BencodeValue]) -> BencodeResult<()> {
    writer.write_all(b"l")?;
    for item in list {
        encode_value(writer, item)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

/// Pairs are kept in sorted key order by the decoder, so emitting them as
/// stored reproduces the canonical byte sequence.
fn encode_dict<W: Write>(writer: &mut W, dict: &[(Vec<u8>, BencodeValue)]) -> BencodeResult<()> {
    writer.write_all(b"d")?;
    for (key, value) in dict {
        encode_bytes(writer, key)?;
        encode_value(writer, value)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

fn encode_value<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    match &value.kind {
        BencodeKind::Bytes(s) => encode_bytes(writer, s),
        BencodeKind::Integer(i) => encode_integer(writer, *i),
        BencodeKind::List(list) => encode_list(writer, list),
        BencodeKind::Dict(dict) => encode_dict(writer, dict),
    }
}

/// Writes the canonical bencoding of `value`.
///
/// Canonically bencoded input round-trips: `encode(decode(b)) == b`.
#[instrument(skip(writer, value), level = "trace")]
pub fn encode<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    encode_value(writer, value)
}

/// Encodes `value` into a fresh buffer.
pub fn to_bytes(value: &BencodeValue) -> BencodeResult<Vec<u8>> {
    let mut buffer = Vec::new();
    encode(&mut buffer, value)?;
    Ok(buffer)
}
