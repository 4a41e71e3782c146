//! Structural pre-check for lib0 v1 update blobs.
//!
//! Yrs reads string payloads without checking their encoding, so a blob that
//! is well formed apart from invalid UTF-8 would leave a broken `str` inside
//! the document. [`check_update_v1`] walks the struct section the same way
//! the decoder does and validates every string on the way. The delete set
//! carries no strings and is left to yrs.
//!
//! ```text
//! update  := varuint(clients) client*  delete_set
//! client  := varuint(structs) varuint(client) varuint(clock) struct*
//! struct  := 0 varuint(len)                      (gc)
//!          | 10 varuint(len)                     (skip)
//!          | info [origin] [right] [parent [sub]] content
//! ```

use crate::error::TextError;

const STRUCT_GC: u8 = 0;
const STRUCT_SKIP: u8 = 10;

const HAS_ORIGIN: u8 = 0b1000_0000;
const HAS_RIGHT_ORIGIN: u8 = 0b0100_0000;
const HAS_PARENT_SUB: u8 = 0b0010_0000;
const CONTENT_MASK: u8 = 0b0000_1111;

const CONTENT_DELETED: u8 = 1;
const CONTENT_BINARY: u8 = 3;
const CONTENT_STRING: u8 = 4;
const CONTENT_EMBED: u8 = 5;
const CONTENT_FORMAT: u8 = 6;
const CONTENT_TYPE: u8 = 7;

const TYPE_XML_ELEMENT: u8 = 3;

/// Reject `blob` if any string it carries is not valid UTF-8, or if it ends
/// before the struct section does.
///
/// Content kinds a text buffer never produces (JSON, any, subdocuments,
/// moves) are rejected outright.
pub(crate) fn check_update_v1(blob: &[u8]) -> Result<(), TextError> {
    let mut cursor = Cursor::new(blob);
    let clients = cursor.var()?;
    for _ in 0..clients {
        let structs = cursor.var()?;
        cursor.var()?; // client
        cursor.var()?; // first clock
        for _ in 0..structs {
            check_struct(&mut cursor)?;
        }
    }
    Ok(())
}

fn check_struct(cursor: &mut Cursor<'_>) -> Result<(), TextError> {
    let info = cursor.byte()?;
    if info == STRUCT_GC || info == STRUCT_SKIP {
        cursor.var()?;
        return Ok(());
    }

    if info & HAS_ORIGIN != 0 {
        cursor.id()?;
    }
    if info & HAS_RIGHT_ORIGIN != 0 {
        cursor.id()?;
    }
    if info & (HAS_ORIGIN | HAS_RIGHT_ORIGIN) == 0 {
        if cursor.var()? == 1 {
            cursor.string()?;
        } else {
            cursor.id()?;
        }
        if info & HAS_PARENT_SUB != 0 {
            cursor.string()?;
        }
    }

    match info & CONTENT_MASK {
        CONTENT_DELETED => {
            cursor.var()?;
        }
        CONTENT_BINARY => {
            cursor.buf()?;
        }
        CONTENT_STRING | CONTENT_EMBED => {
            cursor.string()?;
        }
        CONTENT_FORMAT => {
            cursor.string()?;
            cursor.string()?;
        }
        CONTENT_TYPE => {
            if cursor.byte()? == TYPE_XML_ELEMENT {
                cursor.string()?;
            }
        }
        other => {
            return Err(TextError::Decode(format!(
                "unsupported content kind {other} in text update"
            )))
        }
    }
    Ok(())
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn byte(&mut self) -> Result<u8, TextError> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| TextError::Decode("unexpected end of update".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn var(&mut self) -> Result<u64, TextError> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let b = self.byte()?;
            value |= u64::from(b & 0x7F) << shift;
            if b & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(TextError::Decode("variable-length integer overflow".into()));
            }
        }
    }

    fn id(&mut self) -> Result<(), TextError> {
        self.var()?;
        self.var()?;
        Ok(())
    }

    fn buf(&mut self) -> Result<&'a [u8], TextError> {
        let len = usize::try_from(self.var()?)
            .map_err(|_| TextError::Decode("buffer length overflow".into()))?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| TextError::Decode("unexpected end of update".into()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn string(&mut self) -> Result<&'a str, TextError> {
        let offset = self.pos;
        let bytes = self.buf()?;
        std::str::from_utf8(bytes)
            .map_err(|e| TextError::Decode(format!("invalid UTF-8 in string at byte {offset}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TextStore;

    fn position_of(haystack: &[u8], needle: &[u8]) -> usize {
        haystack
            .windows(needle.len())
            .position(|w| w == needle)
            .unwrap()
    }

    #[test]
    fn test_accepts_store_output() {
        let mut store = TextStore::new("doc");
        store.insert(0, "héllo wörld").unwrap();
        store.delete(1, 2).unwrap();
        store.insert(0, "🙂").unwrap();

        assert!(check_update_v1(&store.encode_full_state()).is_ok());
        assert!(check_update_v1(&TextStore::new("doc").encode_full_state()).is_ok());
    }

    #[test]
    fn test_rejects_invalid_utf8_content() {
        let mut store = TextStore::new("doc");
        store.insert(0, "hello").unwrap();
        let mut blob = store.encode_full_state();
        let at = position_of(&blob, b"hello");
        blob[at + 1] = 0xFF;

        let err = check_update_v1(&blob).unwrap_err();
        assert!(matches!(err, TextError::Decode(ref msg) if msg.contains("UTF-8")));
    }

    #[test]
    fn test_rejects_invalid_utf8_parent_name() {
        let mut store = TextStore::new("room");
        store.insert(0, "x").unwrap();
        let mut blob = store.encode_full_state();
        let at = position_of(&blob, b"room");
        blob[at] = 0xC3;

        assert!(check_update_v1(&blob).is_err());
    }

    #[test]
    fn test_rejects_truncated_blob() {
        let mut store = TextStore::new("doc");
        store.insert(0, "hello").unwrap();
        let blob = store.encode_full_state();
        let at = position_of(&blob, b"hello");

        assert!(check_update_v1(&blob[..at + 2]).is_err());
        assert!(check_update_v1(&[]).is_err());
    }

    #[test]
    fn test_rejects_oversized_length() {
        // One client, one struct, string content claiming far more bytes
        // than the blob holds.
        let blob = [1, 1, 7, 0, 0x04, 1, 1, b'd', 0xFF, 0xFF, 0x03, b'a'];
        assert!(check_update_v1(&blob).is_err());
    }
}
