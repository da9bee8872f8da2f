//! Wire codec: fixed-size framed messages over a sequenced-packet socket.
//!
//! Every message is exactly [`Frame::WIRE_SIZE`] bytes; there is no length
//! prefix because `SOCK_SEQPACKET` preserves message boundaries for us. A
//! read shorter than that is either a clean peer shutdown (zero bytes) or a
//! malformed peer (anything else), both reported as errors to the caller.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use log::debug;

use crate::error::{Error, ErrorKind};
use crate::selector::Selector;
use crate::status::ServerStatus;

/// Message tags, stable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Nak = 0,
    Ack = 1,
    Request = 2,
    Release = 3,
    Signal = 4,
    Status = 5,
}

impl Tag {
    fn from_u32(v: u32) -> Option<Tag> {
        match v {
            0 => Some(Tag::Nak),
            1 => Some(Tag::Ack),
            2 => Some(Tag::Request),
            3 => Some(Tag::Release),
            4 => Some(Tag::Signal),
            5 => Some(Tag::Status),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Tag::Nak => "NAK",
            Tag::Ack => "ACK",
            Tag::Request => "REQUEST",
            Tag::Release => "RELEASE",
            Tag::Signal => "SIGNAL",
            Tag::Status => "STATUS",
        }
    }
}

/// A decoded protocol frame.
#[derive(Debug, Clone, Copy)]
pub enum Frame {
    Nak,
    Ack,
    Request(Selector),
    Release(Selector),
    Signal(Selector),
    Status(ServerStatus),
}

impl Frame {
    pub fn tag(&self) -> Tag {
        match self {
            Frame::Nak => Tag::Nak,
            Frame::Ack => Tag::Ack,
            Frame::Request(_) => Tag::Request,
            Frame::Release(_) => Tag::Release,
            Frame::Signal(_) => Tag::Signal,
            Frame::Status(_) => Tag::Status,
        }
    }

    /// Total wire size: a 4-byte tag plus the larger of the two payload
    /// variants (selector: 12 bytes: u16+u8+pad+u32+u32; status: 16 bytes).
    pub const WIRE_SIZE: usize = 4 + 16;

    fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&(self.tag() as u32).to_ne_bytes());
        match self {
            Frame::Nak | Frame::Ack => {}
            Frame::Request(sel) | Frame::Release(sel) | Frame::Signal(sel) => {
                encode_selector(sel, &mut buf[4..]);
            }
            Frame::Status(status) => {
                encode_status(status, &mut buf[4..]);
            }
        }
        buf
    }

    fn decode(buf: &[u8; Self::WIRE_SIZE]) -> Result<Frame, Error> {
        let tag_val = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
        let tag =
            Tag::from_u32(tag_val).ok_or_else(|| Error::bad_message(format!("tag {tag_val}")))?;
        Ok(match tag {
            Tag::Nak => Frame::Nak,
            Tag::Ack => Frame::Ack,
            Tag::Request => Frame::Request(decode_selector(&buf[4..])),
            Tag::Release => Frame::Release(decode_selector(&buf[4..])),
            Tag::Signal => Frame::Signal(decode_selector(&buf[4..])),
            Tag::Status => Frame::Status(decode_status(&buf[4..])),
        })
    }
}

fn encode_selector(sel: &Selector, out: &mut [u8]) {
    out[0..2].copy_from_slice(&sel.crate_mask.to_ne_bytes());
    out[2] = sel.irq_mask;
    out[3] = 0;
    out[4..8].copy_from_slice(&sel.vector.to_ne_bytes());
    out[8..12].copy_from_slice(&sel.payload.to_ne_bytes());
}

fn decode_selector(buf: &[u8]) -> Selector {
    Selector::new(
        u16::from_ne_bytes(buf[0..2].try_into().unwrap()),
        buf[2],
        u32::from_ne_bytes(buf[4..8].try_into().unwrap()),
        u32::from_ne_bytes(buf[8..12].try_into().unwrap()),
    )
}

fn encode_status(status: &ServerStatus, out: &mut [u8]) {
    out[0..4].copy_from_slice(&status.pid.to_ne_bytes());
    out[4..8].copy_from_slice(&status.crates.to_ne_bytes());
    out[8..12].copy_from_slice(&status.clients.to_ne_bytes());
    out[12..16].copy_from_slice(&status.irq_requests.to_ne_bytes());
}

fn decode_status(buf: &[u8]) -> ServerStatus {
    ServerStatus {
        pid: i32::from_ne_bytes(buf[0..4].try_into().unwrap()),
        crates: u32::from_ne_bytes(buf[4..8].try_into().unwrap()),
        clients: u32::from_ne_bytes(buf[8..12].try_into().unwrap()),
        irq_requests: u32::from_ne_bytes(buf[12..16].try_into().unwrap()),
    }
}

/// Outcome of a frame read: a real frame, clean peer closure, or an error.
#[derive(Debug)]
pub enum RecvOutcome {
    Frame(Frame),
    PeerClosed,
}

/// Send a single frame. Logs at DEBUG with the connection token for
/// traceability.
pub fn send(stream: &mut UnixStream, frame: &Frame, token: u64) -> Result<(), Error> {
    debug!("token={token} send {}", frame.tag().name());
    let buf = frame.encode();
    stream.write_all(&buf).map_err(Error::from)?;
    Ok(())
}

/// Receive a single frame, or detect peer closure.
pub fn recv(stream: &mut UnixStream, token: u64) -> Result<RecvOutcome, Error> {
    let mut buf = [0u8; Frame::WIRE_SIZE];
    let mut total = 0;
    loop {
        match stream.read(&mut buf[total..]) {
            Ok(0) if total == 0 => return Ok(RecvOutcome::PeerClosed),
            Ok(0) => {
                return Err(Error::bad_message("short read before end of frame"));
            }
            Ok(n) => {
                total += n;
                if total == buf.len() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::from(e)),
        }
    }
    let frame = Frame::decode(&buf)?;
    debug!("token={token} recv {}", frame.tag().name());
    Ok(RecvOutcome::Frame(frame))
}

/// Send a frame and wait up to `timeout_ms` for an ACK/NAK reply. Expiry is
/// reported as a [`crate::error::ErrorKind::Transient`] error, which callers
/// treat identically to an explicit NAK.
pub fn send_and_expect_ack_timeout(
    stream: &mut UnixStream,
    frame: &Frame,
    token: u64,
    timeout_ms: u64,
) -> Result<(), Error> {
    use std::os::fd::AsRawFd;

    send(stream, frame, token)?;

    let mut pfd = libc::pollfd {
        fd: stream.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms as libc::c_int) };
    if rc < 0 {
        return Err(Error::from(std::io::Error::last_os_error()));
    }
    if rc == 0 {
        return Err(Error::transient("timed out waiting for ACK/NAK"));
    }

    match recv(stream, token)? {
        RecvOutcome::PeerClosed => Err(Error::peer_closed()),
        RecvOutcome::Frame(Frame::Ack) => Ok(()),
        RecvOutcome::Frame(Frame::Nak) => {
            Err(Error::new(ErrorKind::InvalidArgument, "peer sent NAK"))
        }
        RecvOutcome::Frame(other) => {
            Err(Error::bad_message(format!("expected ACK/NAK, got {}", other.tag().name())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_frame_round_trips() {
        let sel = Selector::new(0x1234, 0x56, 0xDEAD_BEEF, 0xCAFE_F00D);
        let frame = Frame::Request(sel);
        let buf = frame.encode();
        let decoded = Frame::decode(&buf).unwrap();
        match decoded {
            Frame::Request(d) => assert_eq!(d, sel),
            _ => panic!("wrong tag decoded"),
        }
    }

    #[test]
    fn ack_nak_have_no_payload_but_fixed_size() {
        assert_eq!(Frame::Ack.encode().len(), Frame::WIRE_SIZE);
        assert_eq!(Frame::Nak.encode().len(), Frame::WIRE_SIZE);
    }

    #[test]
    fn status_frame_round_trips() {
        let status = ServerStatus {
            pid: 4242,
            crates: 0x000F,
            clients: 3,
            irq_requests: 7,
        };
        let frame = Frame::Status(status);
        let buf = frame.encode();
        match Frame::decode(&buf).unwrap() {
            Frame::Status(d) => assert_eq!(d, status),
            _ => panic!("wrong tag decoded"),
        }
    }

    #[test]
    fn unknown_tag_is_bad_message() {
        let mut buf = [0u8; Frame::WIRE_SIZE];
        buf[0..4].copy_from_slice(&99u32.to_ne_bytes());
        let err = Frame::decode(&buf).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::BadMessage);
    }

    #[test]
    fn send_recv_round_trip_over_real_socketpair() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        let sel = Selector::new(0x0001, 0x02, 0xDEAD_BEEF, 9);
        send(&mut a, &Frame::Signal(sel), 1).unwrap();
        match recv(&mut b, 2).unwrap() {
            RecvOutcome::Frame(Frame::Signal(d)) => assert_eq!(d, sel),
            _ => panic!("expected SIGNAL frame"),
        }
    }

    #[test]
    fn peer_closed_is_detected() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(a);
        let mut b = b;
        match recv(&mut b, 1).unwrap() {
            RecvOutcome::PeerClosed => {}
            _ => panic!("expected peer closed"),
        }
    }
}
