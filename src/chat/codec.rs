/// Chat wire codec — frames TCP messages and UDP beacons.
///
/// Every message starts with a single opcode byte. On TCP the payloads are
/// length-prefixed UTF-16LE strings (no BOM); on UDP the two datagrams are
/// a bare 1-byte request and a fixed 17-byte beacon whose tail is a CRC-32
/// over the `age ‖ uid` bytes. All integers are little-endian.
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// SERVER_INFO_REQUEST — client asks servers to announce themselves (UDP).
pub const OP_INFO_REQUEST: u8 = 1;
/// SERVER_INFO — server beacon carrying `(age, uid, crc)` (UDP).
pub const OP_SERVER_INFO: u8 = 2;
/// SAY — client submits message text (TCP).
pub const OP_SAY: u8 = 3;
/// SET_NAME — client registers a display name (TCP).
pub const OP_SET_NAME: u8 = 4;
/// SAY_DISPATCH — server fans a named message out to clients (TCP).
pub const OP_SAY_DISPATCH: u8 = 5;

/// A SERVER_INFO datagram is exactly opcode + age + uid + crc.
pub const BEACON_LEN: usize = 17;

/// SET_NAME carries a u8 length field.
pub const MAX_NAME_BYTES: usize = u8::MAX as usize;
/// SAY and SAY_DISPATCH carry u16 length fields.
pub const MAX_TEXT_BYTES: usize = u16::MAX as usize;

/// Codec error: an over-limit payload, bytes that are not UTF-16LE, or an
/// underlying I/O failure.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("name exceeds {MAX_NAME_BYTES} encoded bytes")]
    NameTooLong,
    #[error("message exceeds {MAX_TEXT_BYTES} encoded bytes")]
    TextTooLong,
    #[error("payload is not valid UTF-16LE")]
    InvalidUtf16,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A framed TCP message, either direction.
///
/// Clients send `Say` and `SetName`; servers send `Dispatch`. Each side
/// simply ignores frames it never expects, which also gives the skip
/// behavior for future opcodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Message text submitted by a client.
    Say(String),
    /// Display name registered by a client.
    SetName(String),
    /// A named message fanned out by the server.
    Dispatch { name: String, text: String },
}

/// Encode a string as UTF-16LE without BOM.
pub fn encode_utf16le(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

/// Decode UTF-16LE bytes. Odd lengths and unpaired surrogates are errors.
pub fn decode_utf16le(bytes: &[u8]) -> Result<String, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::InvalidUtf16);
    }
    let units = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
    char::decode_utf16(units)
        .collect::<Result<String, _>>()
        .map_err(|_| CodecError::InvalidUtf16)
}

/// Length of a string's UTF-16LE encoding, without materializing it.
pub fn utf16le_len(s: &str) -> usize {
    s.encode_utf16().count() * 2
}

/// A tokio codec for the chat TCP framing.
#[derive(Debug, Default)]
pub struct ChatCodec;

impl Decoder for ChatCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(&opcode) = src.first() else {
                return Ok(None);
            };

            match opcode {
                OP_SAY => {
                    if src.len() < 3 {
                        return Ok(None);
                    }
                    let len = u16::from_le_bytes([src[1], src[2]]) as usize;
                    if src.len() < 3 + len {
                        return Ok(None);
                    }
                    src.advance(3);
                    let payload = src.split_to(len);
                    return Ok(Some(Frame::Say(decode_utf16le(&payload)?)));
                }
                OP_SET_NAME => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    let len = src[1] as usize;
                    if src.len() < 2 + len {
                        return Ok(None);
                    }
                    src.advance(2);
                    let payload = src.split_to(len);
                    return Ok(Some(Frame::SetName(decode_utf16le(&payload)?)));
                }
                OP_SAY_DISPATCH => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    let name_len = src[1] as usize;
                    if src.len() < 4 + name_len {
                        return Ok(None);
                    }
                    let text_len =
                        u16::from_le_bytes([src[2 + name_len], src[3 + name_len]]) as usize;
                    if src.len() < 4 + name_len + text_len {
                        return Ok(None);
                    }
                    src.advance(2);
                    let name = src.split_to(name_len);
                    src.advance(2);
                    let text = src.split_to(text_len);
                    return Ok(Some(Frame::Dispatch {
                        name: decode_utf16le(&name)?,
                        text: decode_utf16le(&text)?,
                    }));
                }
                _ => {
                    // Unknown opcode — skip the byte and keep scanning.
                    src.advance(1);
                }
            }
        }
    }
}

impl Encoder<Frame> for ChatCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Frame::Say(text) => {
                let payload = encode_utf16le(&text);
                if payload.len() > MAX_TEXT_BYTES {
                    return Err(CodecError::TextTooLong);
                }
                dst.reserve(3 + payload.len());
                dst.put_u8(OP_SAY);
                dst.put_u16_le(payload.len() as u16);
                dst.put_slice(&payload);
            }
            Frame::SetName(name) => {
                let payload = encode_utf16le(&name);
                if payload.len() > MAX_NAME_BYTES {
                    return Err(CodecError::NameTooLong);
                }
                dst.reserve(2 + payload.len());
                dst.put_u8(OP_SET_NAME);
                dst.put_u8(payload.len() as u8);
                dst.put_slice(&payload);
            }
            Frame::Dispatch { name, text } => {
                let name_bytes = encode_utf16le(&name);
                if name_bytes.len() > MAX_NAME_BYTES {
                    return Err(CodecError::NameTooLong);
                }
                let text_bytes = encode_utf16le(&text);
                if text_bytes.len() > MAX_TEXT_BYTES {
                    return Err(CodecError::TextTooLong);
                }
                dst.reserve(4 + name_bytes.len() + text_bytes.len());
                dst.put_u8(OP_SAY_DISPATCH);
                dst.put_u8(name_bytes.len() as u8);
                dst.put_slice(&name_bytes);
                dst.put_u16_le(text_bytes.len() as u16);
                dst.put_slice(&text_bytes);
            }
        }
        Ok(())
    }
}

/// A server-info beacon: how long the advertising server has lived, and the
/// random identity it chose at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beacon {
    /// Whole seconds since the server was created.
    pub age_secs: u32,
    /// The server's random 64-bit identity.
    pub uid: u64,
}

impl Beacon {
    /// Encode into the fixed 17-byte SERVER_INFO datagram.
    pub fn encode(&self) -> [u8; BEACON_LEN] {
        let mut buf = [0u8; BEACON_LEN];
        buf[0] = OP_SERVER_INFO;
        buf[1..5].copy_from_slice(&self.age_secs.to_le_bytes());
        buf[5..13].copy_from_slice(&self.uid.to_le_bytes());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[1..13]);
        buf[13..17].copy_from_slice(&hasher.finalize().to_le_bytes());
        buf
    }

    /// Parse a received datagram.
    ///
    /// Returns `None` for anything that is not a well-formed beacon —
    /// wrong length, wrong opcode, or CRC mismatch. Malformed beacons are
    /// dropped, never treated as errors.
    pub fn decode(datagram: &[u8]) -> Option<Beacon> {
        if datagram.len() != BEACON_LEN || datagram[0] != OP_SERVER_INFO {
            return None;
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&datagram[1..13]);
        let crc = u32::from_le_bytes(datagram[13..17].try_into().unwrap());
        if hasher.finalize() != crc {
            return None;
        }
        Some(Beacon {
            age_secs: u32::from_le_bytes(datagram[1..5].try_into().unwrap()),
            uid: u64::from_le_bytes(datagram[5..13].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn encode(frame: Frame) -> BytesMut {
        let mut codec = ChatCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        buf
    }

    fn decode(buf: &mut BytesMut) -> Option<Frame> {
        let mut codec = ChatCodec;
        codec.decode(buf).unwrap()
    }

    // ── UTF-16LE ─────────────────────────────────────────────────

    #[test]
    fn utf16_roundtrip_ascii() {
        let bytes = encode_utf16le("hello");
        assert_eq!(bytes, vec![b'h', 0, b'e', 0, b'l', 0, b'l', 0, b'o', 0]);
        assert_eq!(decode_utf16le(&bytes).unwrap(), "hello");
    }

    #[test]
    fn utf16_roundtrip_surrogate_pairs() {
        let input = "snow \u{2603} and beyond \u{1F30D}";
        let bytes = encode_utf16le(input);
        assert_eq!(decode_utf16le(&bytes).unwrap(), input);
    }

    #[test]
    fn utf16_rejects_odd_length() {
        assert!(matches!(
            decode_utf16le(&[b'h', 0, b'i']),
            Err(CodecError::InvalidUtf16)
        ));
    }

    #[test]
    fn utf16_rejects_lone_surrogate() {
        // 0xD800 with no low surrogate following.
        assert!(matches!(
            decode_utf16le(&[0x00, 0xD8]),
            Err(CodecError::InvalidUtf16)
        ));
    }

    #[test]
    fn utf16_len_counts_code_units() {
        assert_eq!(utf16le_len("hi"), 4);
        assert_eq!(utf16le_len("\u{1F30D}"), 4); // surrogate pair
    }

    // ── Frame encoding ───────────────────────────────────────────

    #[test]
    fn encode_say_layout() {
        let buf = encode(Frame::Say("hi".into()));
        assert_eq!(&buf[..], &[OP_SAY, 4, 0, b'h', 0, b'i', 0]);
    }

    #[test]
    fn encode_set_name_layout() {
        let buf = encode(Frame::SetName("al".into()));
        assert_eq!(&buf[..], &[OP_SET_NAME, 4, b'a', 0, b'l', 0]);
    }

    #[test]
    fn encode_dispatch_layout() {
        let buf = encode(Frame::Dispatch {
            name: "a".into(),
            text: "b".into(),
        });
        assert_eq!(&buf[..], &[OP_SAY_DISPATCH, 2, b'a', 0, 2, 0, b'b', 0]);
    }

    #[test]
    fn encode_rejects_long_name() {
        let name = "n".repeat(128); // 256 encoded bytes
        let mut codec = ChatCodec;
        let mut buf = BytesMut::new();
        let err = codec.encode(Frame::SetName(name), &mut buf).unwrap_err();
        assert!(matches!(err, CodecError::NameTooLong));
        assert!(buf.is_empty());
    }

    #[test]
    fn encode_rejects_long_text() {
        let text = "x".repeat(40_000); // 80 000 encoded bytes
        let mut codec = ChatCodec;
        let mut buf = BytesMut::new();
        let err = codec.encode(Frame::Say(text), &mut buf).unwrap_err();
        assert!(matches!(err, CodecError::TextTooLong));
        assert!(buf.is_empty());
    }

    // ── Frame decoding ───────────────────────────────────────────

    #[test]
    fn decode_empty_buffer() {
        let mut buf = BytesMut::new();
        assert!(decode(&mut buf).is_none());
    }

    #[test]
    fn decode_partial_then_complete() {
        let full = encode(Frame::Say("hello".into()));

        let mut buf = BytesMut::from(&full[..4]);
        assert!(decode(&mut buf).is_none());

        buf.extend_from_slice(&full[4..]);
        let frame = decode(&mut buf).unwrap();
        assert_eq!(frame, Frame::Say("hello".into()));
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_two_frames_in_one_read() {
        let mut buf = encode(Frame::SetName("alice".into()));
        buf.extend_from_slice(&encode(Frame::Say("hi".into())));

        let first = decode(&mut buf).unwrap();
        assert_eq!(first, Frame::SetName("alice".into()));
        let second = decode(&mut buf).unwrap();
        assert_eq!(second, Frame::Say("hi".into()));
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_skips_unknown_opcodes() {
        let mut buf = BytesMut::from(&[0xFF, 0x7F][..]);
        buf.extend_from_slice(&encode(Frame::Say("hi".into())));

        let frame = decode(&mut buf).unwrap();
        assert_eq!(frame, Frame::Say("hi".into()));
    }

    #[test]
    fn decode_dispatch_with_empty_name() {
        let mut buf = encode(Frame::Dispatch {
            name: String::new(),
            text: "notice".into(),
        });
        let frame = decode(&mut buf).unwrap();
        assert_eq!(
            frame,
            Frame::Dispatch {
                name: String::new(),
                text: "notice".into(),
            }
        );
    }

    #[test]
    fn roundtrip_dispatch_unicode() {
        let original = Frame::Dispatch {
            name: "ålice".into(),
            text: "héllo \u{1F30D}".into(),
        };
        let mut buf = encode(original.clone());
        let decoded = decode(&mut buf).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn roundtrip_say_at_name_boundary() {
        // 127 BMP chars = 254 bytes, the largest name the u8 field admits.
        let original = Frame::Dispatch {
            name: "n".repeat(127),
            text: "t".into(),
        };
        let mut buf = encode(original.clone());
        assert_eq!(decode(&mut buf).unwrap(), original);
    }

    // ── Beacons ──────────────────────────────────────────────────

    #[test]
    fn beacon_is_seventeen_bytes_with_valid_crc() {
        let beacon = Beacon {
            age_secs: 42,
            uid: 0xDEAD_BEEF_CAFE_F00D,
        };
        let wire = beacon.encode();
        assert_eq!(wire.len(), BEACON_LEN);
        assert_eq!(wire[0], OP_SERVER_INFO);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&wire[1..13]);
        assert_eq!(
            hasher.finalize(),
            u32::from_le_bytes(wire[13..17].try_into().unwrap())
        );

        assert_eq!(Beacon::decode(&wire), Some(beacon));
    }

    #[test]
    fn beacon_rejects_wrong_length() {
        let wire = Beacon { age_secs: 1, uid: 2 }.encode();
        assert_eq!(Beacon::decode(&wire[..16]), None);
    }

    #[test]
    fn beacon_rejects_wrong_opcode() {
        let mut wire = Beacon { age_secs: 1, uid: 2 }.encode();
        wire[0] = OP_INFO_REQUEST;
        assert_eq!(Beacon::decode(&wire), None);
    }

    #[test]
    fn beacon_rejects_corrupted_payload() {
        let mut wire = Beacon { age_secs: 1, uid: 2 }.encode();
        wire[5] ^= 0x01; // flip a uid bit, CRC no longer matches
        assert_eq!(Beacon::decode(&wire), None);
    }

    #[test]
    fn beacon_ignores_info_request_datagram() {
        assert_eq!(Beacon::decode(&[OP_INFO_REQUEST]), None);
    }
}
