//! DBGp frame decoding: `<ascii-decimal-length>\0<xml-bytes>\0`.
//!
//! The decoder is a streaming state machine over an accumulating byte
//! buffer, the same shape as the teacher's `Header::read_from`/
//! `HeaderField::read_from` loop — read until a delimiter, parse the
//! prefix, then read the declared number of bytes — except DBGp delimits
//! the length with a single `\0` instead of `\r\n`-terminated header lines,
//! and the payload length is a byte count declared up front rather than
//! implied by a blank line.

use log::warn;

/// Accumulates bytes from the wire and yields complete DBGp messages.
///
/// Lengths are byte counts, not character counts: the decoder never looks
/// inside the XML payload, so it is correct for UTF-8 without any special
/// casing.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly-read bytes from the socket into the decoder.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract every complete message currently buffered. A non-numeric or
    /// non-positive length triggers framing recovery: the offending NUL is
    /// skipped and a warning logged, the connection is not torn down.
    pub fn drain_messages(&mut self) -> Vec<Vec<u8>> {
        let mut messages = Vec::new();
        while let Some(outcome) = self.try_extract_one() {
            match outcome {
                Extracted::Message(xml) => messages.push(xml),
                Extracted::Recovered => continue,
            }
        }
        messages
    }

    fn try_extract_one(&mut self) -> Option<Extracted> {
        let nul_pos = self.buf.iter().position(|&b| b == 0)?;

        let prefix = &self.buf[..nul_pos];
        let prefix_str = match std::str::from_utf8(prefix) {
            Ok(s) => s,
            Err(_) => {
                warn!("dbgp: non-utf8 length prefix, skipping frame");
                self.buf.drain(..=nul_pos);
                return Some(Extracted::Recovered);
            }
        };

        let length: i64 = match prefix_str.parse() {
            Ok(n) => n,
            Err(_) => {
                warn!("dbgp: malformed frame length {prefix_str:?}, skipping");
                self.buf.drain(..=nul_pos);
                return Some(Extracted::Recovered);
            }
        };

        if length <= 0 {
            warn!("dbgp: non-positive frame length {length}, skipping");
            self.buf.drain(..=nul_pos);
            return Some(Extracted::Recovered);
        }
        let length = length as usize;

        // need `length` xml bytes plus the trailing NUL
        let payload_start = nul_pos + 1;
        let payload_end = payload_start + length;
        if self.buf.len() < payload_end + 1 {
            // incomplete: wait for more bytes, do not consume anything yet
            return None;
        }
        if self.buf[payload_end] != 0 {
            warn!("dbgp: frame missing trailing NUL, skipping declared length");
            self.buf.drain(..=nul_pos);
            return Some(Extracted::Recovered);
        }

        let xml = self.buf[payload_start..payload_end].to_vec();
        self.buf.drain(..=payload_end);
        Some(Extracted::Message(xml))
    }
}

enum Extracted {
    Message(Vec<u8>),
    Recovered,
}

/// Encode an outbound command: `<verb> -i <txid> <args>\0`.
pub fn encode_command(verb: &str, txid: u64, args: &[(char, String)], trailing_b64: Option<&str>) -> Vec<u8> {
    let mut out = String::new();
    out.push_str(verb);
    out.push_str(" -i ");
    out.push_str(&txid.to_string());
    for (flag, value) in args {
        out.push_str(" -");
        out.push(*flag);
        out.push(' ');
        out.push_str(value);
    }
    if let Some(b64) = trailing_b64 {
        out.push_str(" -- ");
        out.push_str(b64);
    }
    let mut bytes = out.into_bytes();
    bytes.push(0);
    bytes
}

#[cfg(test)]
mod test {
    use super::*;

    fn frame(xml: &str) -> Vec<u8> {
        let mut out = xml.len().to_string().into_bytes();
        out.push(0);
        out.extend_from_slice(xml.as_bytes());
        out.push(0);
        out
    }

    #[test]
    fn single_chunk_single_message() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&frame("<hi/>"));
        let messages = decoder.drain_messages();
        assert_eq!(messages, vec![b"<hi/>".to_vec()]);
    }

    #[test]
    fn single_chunk_multiple_messages() {
        let mut decoder = FrameDecoder::new();
        let mut buf = frame("<a/>");
        buf.extend_from_slice(&frame("<b/>"));
        decoder.push(&buf);
        let messages = decoder.drain_messages();
        assert_eq!(messages, vec![b"<a/>".to_vec(), b"<b/>".to_vec()]);
    }

    #[test]
    fn byte_at_a_time_matches_single_chunk() {
        let whole = frame("<response status=\"break\"/>");
        let mut decoder = FrameDecoder::new();
        let mut messages = Vec::new();
        for byte in &whole {
            decoder.push(std::slice::from_ref(byte));
            messages.extend(decoder.drain_messages());
        }
        assert_eq!(messages, vec![b"<response status=\"break\"/>".to_vec()]);
    }

    #[test]
    fn incomplete_frame_yields_nothing_until_rest_arrives() {
        let whole = frame("<incomplete/>");
        let mut decoder = FrameDecoder::new();
        decoder.push(&whole[..whole.len() - 3]);
        assert!(decoder.drain_messages().is_empty());
        decoder.push(&whole[whole.len() - 3..]);
        assert_eq!(decoder.drain_messages(), vec![b"<incomplete/>".to_vec()]);
    }

    #[test]
    fn non_numeric_length_is_recovered_not_fatal() {
        let mut decoder = FrameDecoder::new();
        let mut buf = b"garbage\0".to_vec();
        buf.extend_from_slice(&frame("<ok/>"));
        decoder.push(&buf);
        assert_eq!(decoder.drain_messages(), vec![b"<ok/>".to_vec()]);
    }

    #[test]
    fn zero_length_is_recovered() {
        let mut decoder = FrameDecoder::new();
        let mut buf = b"0\0".to_vec();
        buf.extend_from_slice(&frame("<ok/>"));
        decoder.push(&buf);
        assert_eq!(decoder.drain_messages(), vec![b"<ok/>".to_vec()]);
    }

    #[test]
    fn frame_length_is_a_byte_count() {
        // invariant 1: L equals the byte length of X, including multi-byte UTF-8
        let xml = "<property>caf\u{e9}</property>";
        let encoded = frame(xml);
        let declared_len: usize = std::str::from_utf8(&encoded[..encoded.iter().position(|&b| b == 0).unwrap()])
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(declared_len, xml.as_bytes().len());

        let mut decoder = FrameDecoder::new();
        decoder.push(&encoded);
        let messages = decoder.drain_messages();
        assert_eq!(messages[0], xml.as_bytes());
    }

    #[test]
    fn encode_command_places_free_form_args_after_double_dash() {
        let encoded = encode_command("breakpoint_set", 3, &[('t', "conditional".to_string())], Some("ZXhwcg=="));
        let text = std::str::from_utf8(&encoded[..encoded.len() - 1]).unwrap();
        assert_eq!(text, "breakpoint_set -i 3 -t conditional -- ZXhwcg==");
    }
}
