//! MessagePack encoding and decoding of wire values
//!
//! Encoding goes through `rmp`'s writers. Decoding classifies markers with
//! `rmp::Marker` and walks the payload with a bounds-checked cursor, so
//! truncated input is reported as [`DecodeError::Truncated`] rather than
//! treated as corruption. The framing layer relies on that distinction to
//! wait for more bytes.

use rmp::Marker;
use rmp::encode;

use crate::rpc::error::{DecodeError, EncodeError};
use crate::rpc::value::{
    BUFFER_EXT_TYPE, Buffer, TABPAGE_EXT_TYPE, Tabpage, Value, WINDOW_EXT_TYPE, Window,
};

/// Maximum container nesting accepted by the decoder
///
/// Decoding, display and comparison all recurse once per level, so this has
/// to fit comfortably in a 2 MiB worker stack.
pub const MAX_DEPTH: usize = 64;

// ============================================================================
// Encoding
// ============================================================================

/// Encode a value into a fresh buffer
pub fn encode(value: &Value) -> Result<Vec<u8>, EncodeError> {
    let mut buf = Vec::with_capacity(64);
    encode_into(&mut buf, value)?;
    Ok(buf)
}

/// Append the encoding of `value` to `buf`
pub fn encode_into(buf: &mut Vec<u8>, value: &Value) -> Result<(), EncodeError> {
    match value {
        Value::Nil => encode::write_nil(buf).map_err(EncodeError::write)?,
        Value::Boolean(b) => encode::write_bool(buf, *b).map_err(EncodeError::write)?,
        Value::Integer(i) => {
            encode::write_sint(buf, *i).map_err(EncodeError::write)?;
        }
        Value::Float(x) => encode::write_f64(buf, *x).map_err(EncodeError::write)?,
        Value::String(s) => encode::write_str(buf, s).map_err(EncodeError::write)?,
        Value::Array(items) => {
            encode::write_array_len(buf, length(items.len())?).map_err(EncodeError::write)?;
            for item in items {
                encode_into(buf, item)?;
            }
        }
        Value::Map(entries) => {
            encode::write_map_len(buf, length(entries.len())?).map_err(EncodeError::write)?;
            for (key, item) in entries {
                encode_into(buf, key)?;
                encode_into(buf, item)?;
            }
        }
        Value::Buffer(Buffer(id)) => encode_handle(buf, BUFFER_EXT_TYPE, *id)?,
        Value::Window(Window(id)) => encode_handle(buf, WINDOW_EXT_TYPE, *id)?,
        Value::Tabpage(Tabpage(id)) => encode_handle(buf, TABPAGE_EXT_TYPE, *id)?,
        Value::Ext(ty, data) => {
            encode::write_ext_meta(buf, length(data.len())?, *ty).map_err(EncodeError::write)?;
            buf.extend_from_slice(data);
        }
    }
    Ok(())
}

fn encode_handle(buf: &mut Vec<u8>, ty: i8, id: i64) -> Result<(), EncodeError> {
    let mut payload = Vec::with_capacity(9);
    encode::write_sint(&mut payload, id).map_err(EncodeError::write)?;
    encode::write_ext_meta(buf, length(payload.len())?, ty).map_err(EncodeError::write)?;
    buf.extend_from_slice(&payload);
    Ok(())
}

fn length(len: usize) -> Result<u32, EncodeError> {
    u32::try_from(len).map_err(|_| EncodeError::TooLong(len))
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode exactly one value spanning the whole input
pub fn decode(input: &[u8]) -> Result<Value, DecodeError> {
    let (value, used) = decode_prefix(input)?;
    if used != input.len() {
        return Err(DecodeError::TrailingBytes(input.len() - used));
    }
    Ok(value)
}

/// Decode one value from the front of `input`, returning it with the number
/// of bytes consumed
pub fn decode_prefix(input: &[u8]) -> Result<(Value, usize), DecodeError> {
    let mut cursor = Cursor::new(input, MAX_DEPTH);
    let value = cursor.read_value(0)?;
    Ok((value, cursor.pos))
}

/// Decode exactly one value whose nesting may not exceed `limit`
pub(crate) fn decode_within(input: &[u8], limit: usize) -> Result<Value, DecodeError> {
    let mut cursor = Cursor::new(input, limit);
    let value = cursor.read_value(0)?;
    if cursor.pos != input.len() {
        return Err(DecodeError::TrailingBytes(input.len() - cursor.pos));
    }
    Ok(value)
}

/// Length of the value at the front of `input` without building it
///
/// Walks markers only, iteratively, so it finds the end of frames the
/// decoder rejects for their content (bad UTF-8, overflowing integers, bad
/// handle payloads, excessive nesting). Fails with `Truncated` when the value
/// is incomplete and with `ReservedMarker` when no boundary can be found.
pub fn skip_prefix(input: &[u8]) -> Result<usize, DecodeError> {
    let mut cursor = Cursor::new(input, MAX_DEPTH);
    let mut remaining: usize = 1;
    while remaining > 0 {
        remaining -= 1;
        let byte = cursor.u8()?;
        let (children, payload) = match Marker::from_u8(byte) {
            Marker::Null
            | Marker::True
            | Marker::False
            | Marker::FixPos(_)
            | Marker::FixNeg(_) => (0, 0),
            Marker::U8 | Marker::I8 => (0, 1),
            Marker::U16 | Marker::I16 => (0, 2),
            Marker::U32 | Marker::I32 | Marker::F32 => (0, 4),
            Marker::U64 | Marker::I64 | Marker::F64 => (0, 8),
            Marker::FixStr(len) => (0, usize::from(len)),
            Marker::Str8 | Marker::Bin8 => (0, usize::from(cursor.u8()?)),
            Marker::Str16 | Marker::Bin16 => (0, usize::from(cursor.u16()?)),
            Marker::Str32 | Marker::Bin32 => (0, cursor.u32()? as usize),
            Marker::FixArray(len) => (usize::from(len), 0),
            Marker::Array16 => (usize::from(cursor.u16()?), 0),
            Marker::Array32 => (cursor.u32()? as usize, 0),
            Marker::FixMap(len) => (usize::from(len) * 2, 0),
            Marker::Map16 => (usize::from(cursor.u16()?) * 2, 0),
            Marker::Map32 => ((cursor.u32()? as usize).saturating_mul(2), 0),
            // Extension payloads are preceded by their type byte
            Marker::FixExt1 => (0, 2),
            Marker::FixExt2 => (0, 3),
            Marker::FixExt4 => (0, 5),
            Marker::FixExt8 => (0, 9),
            Marker::FixExt16 => (0, 17),
            Marker::Ext8 => (0, usize::from(cursor.u8()?) + 1),
            Marker::Ext16 => (0, usize::from(cursor.u16()?) + 1),
            Marker::Ext32 => (0, (cursor.u32()? as usize).saturating_add(1)),
            Marker::Reserved => return Err(DecodeError::ReservedMarker(byte)),
        };
        cursor.take(payload)?;
        remaining = remaining.saturating_add(children);
    }
    Ok(cursor.pos)
}

struct Cursor<'a> {
    input: &'a [u8],
    pos: usize,
    limit: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a [u8], limit: usize) -> Self {
        Self {
            input,
            pos: 0,
            limit,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).ok_or(DecodeError::Truncated)?;
        let bytes = self.input.get(self.pos..end).ok_or(DecodeError::Truncated)?;
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let bytes = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn read_value(&mut self, depth: usize) -> Result<Value, DecodeError> {
        if depth > self.limit {
            return Err(DecodeError::DepthLimitExceeded(self.limit));
        }

        let byte = self.u8()?;
        let value = match Marker::from_u8(byte) {
            Marker::Null => Value::Nil,
            Marker::True => Value::Boolean(true),
            Marker::False => Value::Boolean(false),
            Marker::FixPos(n) => Value::Integer(i64::from(n)),
            Marker::FixNeg(n) => Value::Integer(i64::from(n)),
            Marker::U8 => Value::Integer(i64::from(self.u8()?)),
            Marker::U16 => Value::Integer(i64::from(self.u16()?)),
            Marker::U32 => Value::Integer(i64::from(self.u32()?)),
            Marker::U64 => {
                let n = self.u64()?;
                Value::Integer(i64::try_from(n).map_err(|_| DecodeError::IntegerOverflow(n))?)
            }
            Marker::I8 => Value::Integer(i64::from(self.u8()? as i8)),
            Marker::I16 => Value::Integer(i64::from(self.u16()? as i16)),
            Marker::I32 => Value::Integer(i64::from(self.u32()? as i32)),
            Marker::I64 => Value::Integer(self.u64()? as i64),
            Marker::F32 => Value::Float(f64::from(f32::from_bits(self.u32()?))),
            Marker::F64 => Value::Float(f64::from_bits(self.u64()?)),
            Marker::FixStr(len) => self.read_str(usize::from(len))?,
            Marker::Str8 | Marker::Bin8 => {
                let len = usize::from(self.u8()?);
                self.read_str(len)?
            }
            Marker::Str16 | Marker::Bin16 => {
                let len = usize::from(self.u16()?);
                self.read_str(len)?
            }
            Marker::Str32 | Marker::Bin32 => {
                let len = self.u32()? as usize;
                self.read_str(len)?
            }
            Marker::FixArray(len) => self.read_array(usize::from(len), depth)?,
            Marker::Array16 => {
                let len = usize::from(self.u16()?);
                self.read_array(len, depth)?
            }
            Marker::Array32 => {
                let len = self.u32()? as usize;
                self.read_array(len, depth)?
            }
            Marker::FixMap(len) => self.read_map(usize::from(len), depth)?,
            Marker::Map16 => {
                let len = usize::from(self.u16()?);
                self.read_map(len, depth)?
            }
            Marker::Map32 => {
                let len = self.u32()? as usize;
                self.read_map(len, depth)?
            }
            Marker::FixExt1 => self.read_ext(1)?,
            Marker::FixExt2 => self.read_ext(2)?,
            Marker::FixExt4 => self.read_ext(4)?,
            Marker::FixExt8 => self.read_ext(8)?,
            Marker::FixExt16 => self.read_ext(16)?,
            Marker::Ext8 => {
                let len = usize::from(self.u8()?);
                self.read_ext(len)?
            }
            Marker::Ext16 => {
                let len = usize::from(self.u16()?);
                self.read_ext(len)?
            }
            Marker::Ext32 => {
                let len = self.u32()? as usize;
                self.read_ext(len)?
            }
            Marker::Reserved => return Err(DecodeError::ReservedMarker(byte)),
        };
        Ok(value)
    }

    fn read_str(&mut self, len: usize) -> Result<Value, DecodeError> {
        let bytes = self.take(len)?;
        let s = std::str::from_utf8(bytes).map_err(|e| DecodeError::InvalidUtf8(e.to_string()))?;
        Ok(Value::String(s.to_string()))
    }

    fn read_array(&mut self, len: usize, depth: usize) -> Result<Value, DecodeError> {
        // Every element needs at least one byte; reject absurd lengths early
        if len > self.input.len().saturating_sub(self.pos) {
            return Err(DecodeError::Truncated);
        }
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            items.push(self.read_value(depth + 1)?);
        }
        Ok(Value::Array(items))
    }

    fn read_map(&mut self, len: usize, depth: usize) -> Result<Value, DecodeError> {
        if len.saturating_mul(2) > self.input.len().saturating_sub(self.pos) {
            return Err(DecodeError::Truncated);
        }
        let mut entries = Vec::with_capacity(len);
        for _ in 0..len {
            let key = self.read_value(depth + 1)?;
            let value = self.read_value(depth + 1)?;
            entries.push((key, value));
        }
        Ok(Value::Map(entries))
    }

    fn read_ext(&mut self, len: usize) -> Result<Value, DecodeError> {
        let ty = self.u8()? as i8;
        let data = self.take(len)?;
        match ty {
            BUFFER_EXT_TYPE => Ok(Value::Buffer(Buffer(handle_id(ty, data)?))),
            WINDOW_EXT_TYPE => Ok(Value::Window(Window(handle_id(ty, data)?))),
            TABPAGE_EXT_TYPE => Ok(Value::Tabpage(Tabpage(handle_id(ty, data)?))),
            _ => Ok(Value::Ext(ty, data.to_vec())),
        }
    }
}

/// Handles carry an encoded integer as their extension payload
fn handle_id(ty: i8, data: &[u8]) -> Result<i64, DecodeError> {
    match decode(data) {
        Ok(Value::Integer(id)) => Ok(id),
        Ok(other) => Err(DecodeError::InvalidExtension {
            ty,
            reason: format!("expected integer payload, found {}", other.kind()),
        }),
        Err(e) => Err(DecodeError::InvalidExtension {
            ty,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: Value) {
        let bytes = encode(&value).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, value, "round trip changed {value}");
    }

    #[test]
    fn test_round_trip_scalars() {
        for value in [
            Value::Nil,
            Value::Boolean(true),
            Value::Boolean(false),
            Value::Integer(0),
            Value::Integer(127),
            Value::Integer(128),
            Value::Integer(-1),
            Value::Integer(-33),
            Value::Integer(65_536),
            Value::Integer(i64::MIN),
            Value::Integer(i64::MAX),
            Value::Float(1.5),
            Value::Float(-0.25),
            Value::from(""),
            Value::from("Just a flesh wound."),
            Value::from("naïve café ✓"),
            Value::from("x".repeat(70_000)),
        ] {
            round_trip(value);
        }
    }

    #[test]
    fn test_round_trip_containers_and_handles() {
        round_trip(Value::Array(vec![]));
        round_trip(Value::empty_map());
        round_trip(Value::Array(vec![
            Value::Buffer(Buffer(1)),
            Value::Window(Window(1000)),
            Value::Tabpage(Tabpage(2)),
            Value::Ext(7, vec![1, 2, 3]),
        ]));
        round_trip(Value::map([
            ("lines", Value::from(vec!["a", "b"])),
            ("nested", Value::map([("ok", Value::Boolean(true))])),
            ("nil", Value::Nil),
        ]));
        round_trip(Value::Map(vec![(Value::Integer(1), Value::from("one"))]));
        round_trip(Value::Array((0..20).map(Value::from).collect()));
    }

    #[test]
    fn test_handle_wire_format() {
        let bytes = encode(&Value::Buffer(Buffer(3))).unwrap();
        // fixext1, type 0, payload positive fixint 3
        assert_eq!(bytes, vec![0xd4, 0x00, 0x03]);
    }

    #[test]
    fn test_decode_truncated_input() {
        let bytes = encode(&Value::from(vec!["hello", "world"])).unwrap();
        for cut in 0..bytes.len() {
            assert!(
                matches!(decode(&bytes[..cut]), Err(DecodeError::Truncated)),
                "prefix of {cut} bytes should be truncated"
            );
        }
    }

    #[test]
    fn test_decode_rejects_ill_typed_input() {
        assert!(matches!(
            decode(&[0xc1]),
            Err(DecodeError::ReservedMarker(0xc1))
        ));
        // str8 with invalid UTF-8 payload
        assert!(matches!(
            decode(&[0xd9, 0x02, 0xff, 0xfe]),
            Err(DecodeError::InvalidUtf8(_))
        ));
        // uint64 above i64::MAX
        assert!(matches!(
            decode(&[0xcf, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]),
            Err(DecodeError::IntegerOverflow(u64::MAX))
        ));
        // buffer handle whose payload is a string
        assert!(matches!(
            decode(&[0xd5, 0x00, 0xa1, b'x']),
            Err(DecodeError::InvalidExtension { ty: 0, .. })
        ));
        assert!(matches!(
            decode(&[0xc0, 0xc0]),
            Err(DecodeError::TrailingBytes(1))
        ));
    }

    fn nested(levels: usize) -> Vec<u8> {
        let mut bytes = vec![0x91; levels];
        bytes.push(0xc0);
        bytes
    }

    #[test]
    fn test_decode_depth_limit() {
        assert!(decode(&nested(MAX_DEPTH)).is_ok());
        assert!(matches!(
            decode(&nested(MAX_DEPTH + 1)),
            Err(DecodeError::DepthLimitExceeded(MAX_DEPTH))
        ));
        assert!(matches!(
            decode(&nested(4096)),
            Err(DecodeError::DepthLimitExceeded(MAX_DEPTH))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_deepest_value_fits_worker_stack() {
        let handle = tokio::spawn(async {
            let value = decode(&nested(MAX_DEPTH)).unwrap();
            let rendered = value.to_string();
            let unpacked = value.clone().unpack_extensions();
            assert_eq!(unpacked, value);
            rendered.len()
        });
        // Every level renders as "[" and "]" around the nil
        assert_eq!(handle.await.unwrap(), MAX_DEPTH * 2 + 3);
    }

    #[test]
    fn test_skip_prefix_finds_end_of_ill_typed_values() {
        // [2, "ev", ["\xff"]] followed by a valid nil
        let mut bytes = vec![0x93, 0x02, 0xa2, b'e', b'v', 0x91, 0xa1, 0xff];
        let frame_len = bytes.len();
        bytes.push(0xc0);

        assert!(matches!(
            decode_prefix(&bytes),
            Err(DecodeError::InvalidUtf8(_))
        ));
        assert_eq!(skip_prefix(&bytes).unwrap(), frame_len);

        let overflow = [0x92, 0xcf, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc0];
        assert_eq!(skip_prefix(&overflow).unwrap(), overflow.len());

        let deep = nested(4096);
        assert_eq!(skip_prefix(&deep).unwrap(), deep.len());

        let handle = [0x91, 0xd5, 0x00, 0xa1, b'x'];
        assert_eq!(skip_prefix(&handle).unwrap(), handle.len());
    }

    #[test]
    fn test_skip_prefix_incomplete_and_unframeable() {
        let bytes = encode(&Value::from(vec!["hello", "world"])).unwrap();
        assert!(matches!(
            skip_prefix(&bytes[..bytes.len() - 1]),
            Err(DecodeError::Truncated)
        ));
        assert!(matches!(
            skip_prefix(&[0x92, 0xc0, 0xc1]),
            Err(DecodeError::ReservedMarker(0xc1))
        ));
    }

    #[test]
    fn test_decode_within_shares_depth_budget() {
        assert!(decode_within(&nested(3), 3).is_ok());
        assert!(matches!(
            decode_within(&nested(4), 3),
            Err(DecodeError::DepthLimitExceeded(3))
        ));
    }

    #[test]
    fn test_decode_binary_as_string() {
        assert_eq!(decode(&[0xc4, 0x02, b'o', b'k']).unwrap(), Value::from("ok"));
    }

    #[test]
    fn test_decode_prefix_reports_consumed_bytes() {
        let mut bytes = encode(&Value::from(5)).unwrap();
        bytes.extend(encode(&Value::from("next")).unwrap());
        let (value, used) = decode_prefix(&bytes).unwrap();
        assert_eq!(value, Value::from(5));
        assert_eq!(used, 1);
    }
}
