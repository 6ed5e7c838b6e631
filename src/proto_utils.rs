//! Header-level DNS parsing that avoids a full `Message` decode on hot paths.

use std::str::from_utf8;

use hickory_proto::op::ResponseCode;

const HEADER_LEN: usize = 12;
const MAX_POINTER_JUMPS: usize = 5;

/// Header fields plus the first question.
pub struct PacketHead<'a> {
    pub id: u16,
    pub truncated: bool,
    pub rcode: ResponseCode,
    /// Lowercase, no trailing dot.
    pub qname: &'a str,
    pub qtype: u16,
}

/// `buf` receives the normalized name; 256 bytes covers any valid name.
pub fn parse_head<'a>(packet: &[u8], buf: &'a mut [u8]) -> Option<PacketHead<'a>> {
    if packet.len() < HEADER_LEN {
        return None;
    }
    let qd_count = u16::from_be_bytes([packet[4], packet[5]]);
    if qd_count == 0 {
        return None;
    }

    let (name_len, after_name) = read_name(packet, HEADER_LEN, buf)?;
    if packet.len() < after_name + 4 {
        return None;
    }

    Some(PacketHead {
        id: u16::from_be_bytes([packet[0], packet[1]]),
        truncated: is_truncated(packet),
        rcode: response_code(packet)?,
        qname: from_utf8(&buf[..name_len]).ok()?,
        qtype: u16::from_be_bytes([packet[after_name], packet[after_name + 1]]),
    })
}

/// Returns the written length in `buf` and the offset right after the name.
fn read_name(packet: &[u8], start: usize, buf: &mut [u8]) -> Option<(usize, usize)> {
    let mut pos = start;
    let mut end = None;
    let mut written = 0;
    let mut jumps = 0;

    loop {
        let len = *packet.get(pos)? as usize;
        if len == 0 {
            return Some((written, end.unwrap_or(pos + 1)));
        }
        if len & 0xC0 == 0xC0 {
            let lo = *packet.get(pos + 1)? as usize;
            end.get_or_insert(pos + 2);
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return None;
            }
            pos = ((len & 0x3F) << 8) | lo;
            continue;
        }

        let label = packet.get(pos + 1..pos + 1 + len)?;
        if written > 0 {
            *buf.get_mut(written)? = b'.';
            written += 1;
        }
        let dst = buf.get_mut(written..written + len)?;
        for (d, s) in dst.iter_mut().zip(label) {
            *d = s.to_ascii_lowercase();
        }
        written += len;
        pos += 1 + len;
    }
}

#[inline]
pub fn response_code(packet: &[u8]) -> Option<ResponseCode> {
    packet.get(3).map(|b| ResponseCode::from(0, b & 0x0F))
}

#[inline]
pub fn is_truncated(packet: &[u8]) -> bool {
    packet.get(2).is_some_and(|b| b & 0x02 != 0)
}

#[inline]
pub fn set_id(packet: &mut [u8], id: u16) {
    if packet.len() >= 2 {
        packet[..2].copy_from_slice(&id.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Message, MessageType, Query};
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    fn packet(name: &str, qtype: RecordType) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(0xBEEF);
        msg.add_query(Query::query(Name::from_str(name).unwrap(), qtype));
        msg.to_vec().unwrap()
    }

    #[test]
    fn parses_id_name_and_type() {
        let bytes = packet("WWW.Example.COM.", RecordType::AAAA);
        let mut buf = [0u8; 256];
        let head = parse_head(&bytes, &mut buf).expect("head");
        assert_eq!(head.id, 0xBEEF);
        assert_eq!(head.qname, "www.example.com");
        assert_eq!(head.qtype, u16::from(RecordType::AAAA));
        assert!(!head.truncated);
        assert_eq!(head.rcode, ResponseCode::NoError);
    }

    #[test]
    fn reads_truncation_and_rcode_of_responses() {
        let mut msg = Message::new();
        msg.set_message_type(MessageType::Response);
        msg.set_truncated(true);
        msg.set_response_code(ResponseCode::ServFail);
        msg.add_query(Query::query(Name::from_str("a.test.").unwrap(), RecordType::A));
        let bytes = msg.to_vec().unwrap();
        assert!(is_truncated(&bytes));
        assert_eq!(response_code(&bytes), Some(ResponseCode::ServFail));
    }

    #[test]
    fn rejects_short_and_questionless_packets() {
        let mut buf = [0u8; 256];
        assert!(parse_head(&[0u8; 4], &mut buf).is_none());
        assert!(parse_head(&[0u8; 12], &mut buf).is_none());
    }

    #[test]
    fn set_id_rewrites_header() {
        let mut bytes = packet("a.test.", RecordType::A);
        set_id(&mut bytes, 7);
        assert_eq!(&bytes[..2], &[0, 7]);
    }
}
