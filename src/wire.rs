//! Binary frames exchanged with the gateway.
//!
//! Commands carry an 8-byte header (`u16` kind, `u16` reserved = 1, `u32`
//! handle, all big-endian) followed by command-specific arguments. Frames
//! from the gateway open with a big-endian `u16` discriminator: 2 is a
//! command acknowledgement, 4 and 5 are network replies (last reply / more
//! to follow). Unless noted otherwise the remaining fields are
//! little-endian; trunk/node addresses and RAD50 values in lookup results
//! are big-endian.

use bytes::{BufMut, Bytes};

use crate::status::Status;

pub(crate) const CMD_CONNECT: u16 = 0x0001;
pub(crate) const CMD_CANCEL_REQUEST: u16 = 0x0008;
pub(crate) const CMD_NODE_ADDRESS: u16 = 0x000b;
pub(crate) const CMD_NODE_NAME: u16 = 0x000c;
pub(crate) const CMD_LOCAL_NODE: u16 = 0x000d;
pub(crate) const CMD_SEND_REQUEST: u16 = 0x0012;

/// Discriminator byte of a command acknowledgement (`00 02` lead).
pub(crate) const FRAME_ACK: u8 = 0x02;

/// Reply flags: terminal reply of a request.
pub(crate) const REPLY_LAST: u16 = 4;
/// Reply flags: more replies to follow.
pub(crate) const REPLY_MORE: u16 = 5;

/// Reply header length; the payload starts here.
pub(crate) const REPLY_HEADER_LEN: usize = 20;

/// Result kind of an acknowledgement that accepted a send-request command.
const ACK_KIND_ACCEPT: u16 = 2;

/// Synthetic inner ack fed to pending commands when the transport drops.
/// Parses to facility 0xDE, error code 1.
pub(crate) const NACK_DISCONNECT: [u8; 4] = [0x00, 0x00, 0xde, 0x01];

/// The status the sentinel carries.
pub(crate) const NACK_DISCONNECT_STATUS: Status = Status::new(0xde, 1);

fn header(kind: u16, handle: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24);
    buf.put_u16(kind);
    buf.put_u16(1);
    buf.put_u32(handle);
    buf
}

/// The connect command: all-zero handle, the gateway assigns one.
pub(crate) fn connect() -> Vec<u8> {
    let mut buf = header(CMD_CONNECT, 0);
    buf.put_bytes(0, 10);
    buf
}

pub(crate) fn cancel_request(handle: u32, request_id: u16) -> Vec<u8> {
    let mut buf = header(CMD_CANCEL_REQUEST, handle);
    buf.put_u16_le(request_id);
    buf
}

pub(crate) fn node_address(handle: u32, name: u32) -> Vec<u8> {
    let mut buf = header(CMD_NODE_ADDRESS, handle);
    buf.put_bytes(0, 8);
    buf.put_u32_le(name);
    buf
}

pub(crate) fn node_name(handle: u32, address: u16) -> Vec<u8> {
    let mut buf = header(CMD_NODE_NAME, handle);
    buf.put_bytes(0, 8);
    buf.put_u16(address);
    buf
}

pub(crate) fn local_node(handle: u32) -> Vec<u8> {
    let mut buf = header(CMD_LOCAL_NODE, handle);
    buf.put_bytes(0, 8);
    buf
}

pub(crate) fn send_request(
    handle: u32,
    task: u32,
    address: u16,
    multi: bool,
    timeout_ms: u32,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = header(CMD_SEND_REQUEST, handle);
    buf.reserve(16 + payload.len());
    buf.put_bytes(0, 8);
    buf.put_u32_le(task);
    buf.put_u16(address);
    buf.put_u16_le(multi as u16);
    buf.put_u32_le(timeout_ms);
    buf.put_slice(payload);
    buf
}

pub(crate) fn u16_le(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

pub(crate) fn u16_be(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

pub(crate) fn u32_le(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

pub(crate) fn u32_be(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Status word of an inner ack frame.
pub(crate) fn ack_status(inner: &[u8]) -> Result<Status, Status> {
    if inner.len() < 4 {
        return Err(Status::BUG);
    }
    Ok(Status::from_raw(u16_le(inner, 2) as i16))
}

/// Status word of an inner ack, folded so a bad status is the error.
///
/// The disconnect sentinel is an error even though its error code is
/// positive; callers must see the disconnection rather than a short frame.
pub(crate) fn ack_good_status(inner: &[u8]) -> Result<Status, Status> {
    let status = ack_status(inner)?;
    if inner == NACK_DISCONNECT {
        return Err(status);
    }
    if status.is_good() { Ok(status) } else { Err(status) }
}

/// Handle assigned by a connect acknowledgement.
pub(crate) fn connect_ack_handle(inner: &[u8]) -> Result<u32, Status> {
    ack_good_status(inner)?;
    if inner.len() < 9 {
        return Err(Status::BUG);
    }
    Ok(u32_be(inner, 5))
}

/// Request id granted by an accept acknowledgement.
pub(crate) fn accept_ack_request_id(inner: &[u8]) -> Result<u16, Status> {
    ack_good_status(inner)?;
    if inner.len() < 8 || u16_le(inner, 0) != ACK_KIND_ACCEPT {
        return Err(Status::BUG);
    }
    Ok(u16_le(inner, 6))
}

/// Trunk/node address in a node-lookup or local-node acknowledgement.
pub(crate) fn ack_node_address(inner: &[u8]) -> Result<u16, Status> {
    ack_good_status(inner)?;
    if inner.len() < 6 {
        return Err(Status::BUG);
    }
    Ok(u16_be(inner, 4))
}

/// RAD50 node name in a name-lookup acknowledgement.
pub(crate) fn ack_node_name(inner: &[u8]) -> Result<u32, Status> {
    ack_good_status(inner)?;
    if inner.len() < 8 {
        return Err(Status::BUG);
    }
    Ok(u32_be(inner, 4))
}

/// Parsed header of a network reply.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ReplyHeader {
    pub flags: u16,
    pub status: Status,
    pub sender: u16,
    pub request_id: u16,
}

impl ReplyHeader {
    pub fn is_last(&self) -> bool {
        self.flags == REPLY_LAST
    }
}

/// Split a network reply into its header and payload.
pub(crate) fn parse_reply(pkt: &Bytes) -> Option<(ReplyHeader, Bytes)> {
    if pkt.len() < REPLY_HEADER_LEN {
        return None;
    }
    let header = ReplyHeader {
        flags: u16_be(pkt, 0),
        status: Status::from_raw(u16_le(pkt, 2) as i16),
        sender: u16_be(pkt, 4),
        request_id: u16_le(pkt, 18),
    };
    Some((header, pkt.slice(REPLY_HEADER_LEN..)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_is_the_documented_literal() {
        let mut expected = vec![0x00, 0x01, 0x00, 0x01];
        expected.extend_from_slice(&[0; 14]);
        assert_eq!(connect(), expected);
        assert_eq!(connect().len(), 18);
    }

    #[test]
    fn command_header_layout() {
        let frame = cancel_request(0x1234_5678, 0x0102);
        assert_eq!(&frame[..8], &[0x00, 0x08, 0x00, 0x01, 0x12, 0x34, 0x56, 0x78]);
        // request id is little-endian
        assert_eq!(&frame[8..], &[0x02, 0x01]);
    }

    #[test]
    fn node_lookup_frames() {
        let frame = node_address(7, 0xaabbccdd);
        assert_eq!(frame.len(), 20);
        assert_eq!(&frame[8..16], &[0; 8]);
        assert_eq!(&frame[16..], &[0xdd, 0xcc, 0xbb, 0xaa]);

        let frame = node_name(7, 0x0201);
        assert_eq!(frame.len(), 18);
        // trunk/node addresses travel big-endian
        assert_eq!(&frame[16..], &[0x02, 0x01]);

        assert_eq!(local_node(7).len(), 16);
    }

    #[test]
    fn send_request_layout() {
        let frame = send_request(9, 0x0a0b0c0d, 0x0201, true, 1000, &[0xee, 0xff]);
        assert_eq!(&frame[..2], &[0x00, 0x12]);
        assert_eq!(&frame[8..16], &[0; 8]);
        assert_eq!(&frame[16..20], &[0x0d, 0x0c, 0x0b, 0x0a]); // task, LE
        assert_eq!(&frame[20..22], &[0x02, 0x01]); // address, BE
        assert_eq!(&frame[22..24], &[0x01, 0x00]); // multi-flag, LE
        assert_eq!(&frame[24..28], &1000u32.to_le_bytes());
        assert_eq!(&frame[28..], &[0xee, 0xff]);
    }

    #[test]
    fn ack_status_reads_inner_offset_2() {
        // kind = 2, status = SUCCESS (raw 0x0001)
        let inner = [0x02, 0x00, 0x01, 0x00];
        assert_eq!(ack_status(&inner).unwrap(), Status::SUCCESS);
        assert_eq!(ack_status(&[0x02, 0x00]), Err(Status::BUG));
    }

    #[test]
    fn nack_sentinel_decodes_to_disconnect_indicator() {
        let status = ack_status(&NACK_DISCONNECT).unwrap();
        assert_eq!(status.facility(), 0xde);
        assert_eq!(status.err_code(), 1);
        assert_eq!(status, NACK_DISCONNECT_STATUS);
    }

    #[test]
    fn sentinel_fails_lookups_with_its_own_status() {
        // A caller whose command was pending at disconnect must surface the
        // sentinel status, not a short-frame BUG.
        assert_eq!(ack_node_address(&NACK_DISCONNECT), Err(NACK_DISCONNECT_STATUS));
        assert_eq!(accept_ack_request_id(&NACK_DISCONNECT), Err(NACK_DISCONNECT_STATUS));
    }

    #[test]
    fn connect_ack_handle_is_big_endian_at_5() {
        let mut inner = vec![0x00, 0x00, 0x01, 0x00, 0xaa];
        inner.extend_from_slice(&[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(connect_ack_handle(&inner).unwrap(), 0x1234_5678);
        assert_eq!(connect_ack_handle(&inner[..7]), Err(Status::BUG));
    }

    #[test]
    fn accept_ack_request_id_at_6() {
        let inner = [0x02, 0x00, 0x01, 0x00, 0x00, 0x00, 0x2a, 0x00];
        assert_eq!(accept_ack_request_id(&inner).unwrap(), 0x002a);

        // bad status wins over shape checks
        let nak = [0x02, 0x00, 0x01, 0xff, 0x00, 0x00, 0x2a, 0x00];
        assert_eq!(
            accept_ack_request_id(&nak),
            Err(Status::from_raw(i16::from_le_bytes([0x01, 0xff])))
        );

        // wrong result kind
        let wrong = [0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x2a, 0x00];
        assert_eq!(accept_ack_request_id(&wrong), Err(Status::BUG));
    }

    #[test]
    fn reply_header_fields() {
        let mut pkt = vec![0x00, 0x05]; // flags = 5, more to follow
        pkt.extend_from_slice(&[0x01, 0x00]); // status = SUCCESS, LE
        pkt.extend_from_slice(&[0x02, 0x01]); // sender, BE
        pkt.extend_from_slice(&[0; 12]);
        pkt.extend_from_slice(&[0x2a, 0x00]); // request id, LE
        pkt.extend_from_slice(b"payload");

        let (header, payload) = parse_reply(&Bytes::from(pkt)).unwrap();
        assert_eq!(header.flags, REPLY_MORE);
        assert!(!header.is_last());
        assert_eq!(header.status, Status::SUCCESS);
        assert_eq!(header.sender, 0x0201);
        assert_eq!(header.request_id, 0x002a);
        assert_eq!(&payload[..], b"payload");
    }

    #[test]
    fn short_reply_is_rejected() {
        assert!(parse_reply(&Bytes::from_static(&[0u8; 19])).is_none());
    }
}
