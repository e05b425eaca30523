//! Typed header queues.
//!
//! Small fixed-width headers travel over POSIX message queues, one
//! queue per header type so that FIFO order holds per type. The
//! payload itself never rides the queue; headers only carry the slot
//! id, status, timestamp, and sender pid.

use std::ffi::CString;

use nix::mqueue::{
    mq_close, mq_getattr, mq_open, mq_receive, mq_remove_nonblock, mq_send, mq_set_nonblock,
    mq_unlink, MQ_OFlag, MqAttr, MqdT,
};
use nix::sys::stat::Mode;

use crate::error::{IpcError, Result};

/// Wire width of one header.
pub const HEADER_LEN: usize = 32;

const MAX_MSGS: i64 = 10;

/// Header types, by wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    /// A finished call whose result sits in the payload store.
    Return = 10,
    /// A child's acknowledgement that it started executing a call.
    Running = 20,
    /// A new call whose arguments sit in the payload store.
    Call = 30,
}

impl MessageType {
    /// Decodes a wire value.
    #[must_use]
    pub const fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            10 => Some(Self::Return),
            20 => Some(Self::Running),
            30 => Some(Self::Call),
            _ => None,
        }
    }

    /// Queue-name suffix for this type.
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Return => "ret",
            Self::Running => "run",
            Self::Call => "call",
        }
    }
}

/// One queue message: the identity and state of a call in flight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Header {
    /// Which queue the header belongs on.
    pub kind: MessageType,
    /// Call id; also the payload-store slot address.
    pub id: u64,
    /// The call's status discriminant at send time.
    pub status: u8,
    /// Seconds since the epoch when the sender changed the status.
    pub time: f64,
    /// Pid of the sending process.
    pub pid: i32,
}

impl Header {
    /// Encodes to the fixed wire layout.
    #[must_use]
    pub fn to_wire(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&(self.kind as u32).to_le_bytes());
        buf[4..12].copy_from_slice(&self.id.to_le_bytes());
        buf[12] = self.status;
        buf[16..24].copy_from_slice(&self.time.to_bits().to_le_bytes());
        buf[24..28].copy_from_slice(&self.pid.to_le_bytes());
        buf
    }

    /// Decodes from the wire layout.
    ///
    /// # Errors
    /// `Corrupt` when the buffer is short or the type tag is unknown.
    pub fn from_wire(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(IpcError::Corrupt(format!(
                "header is {} bytes, expected {HEADER_LEN}",
                buf.len()
            )));
        }
        let raw_kind = u32::from_le_bytes(buf[0..4].try_into().expect("sliced"));
        let kind = MessageType::from_wire(raw_kind)
            .ok_or_else(|| IpcError::Corrupt(format!("unknown header type {raw_kind}")))?;
        Ok(Self {
            kind,
            id: u64::from_le_bytes(buf[4..12].try_into().expect("sliced")),
            status: buf[12],
            time: f64::from_bits(u64::from_le_bytes(buf[16..24].try_into().expect("sliced"))),
            pid: i32::from_le_bytes(buf[24..28].try_into().expect("sliced")),
        })
    }
}

/// A single-type header queue.
pub struct HeaderQueue {
    mqd: Option<MqdT>,
    nonblocking: std::cell::Cell<bool>,
}

impl HeaderQueue {
    /// Opens (creating if needed) the queue under `name`.
    ///
    /// # Errors
    /// `mq_open` failures, classified.
    pub fn open(name: &str) -> Result<Self> {
        let c_name = CString::new(name.as_bytes())
            .map_err(|e| IpcError::Invalid(format!("queue name: {e}")))?;
        let attr = MqAttr::new(0, MAX_MSGS, HEADER_LEN as i64, 0);
        let mqd = mq_open(
            c_name.as_c_str(),
            MQ_OFlag::O_RDWR | MQ_OFlag::O_CREAT,
            Mode::from_bits_truncate(0o600),
            Some(&attr),
        )
        .map_err(|e| IpcError::from_errno(e, "mq_open"))?;
        Ok(Self {
            mqd: Some(mqd),
            nonblocking: std::cell::Cell::new(false),
        })
    }

    /// Enqueues one header.
    ///
    /// # Errors
    /// `Transient` when the queue is full (`EAGAIN` in nonblocking
    /// mode) or the send was interrupted; `Identity` when the queue is
    /// gone.
    pub fn send(&self, header: &Header) -> Result<()> {
        self.set_blocking(false)?;
        mq_send(self.mqd(), &header.to_wire(), 0)
            .map_err(|e| IpcError::from_errno(e, "mq_send"))
    }

    /// Dequeues the next header.
    ///
    /// Nonblocking mode returns `Ok(None)` immediately on an empty
    /// queue; blocking mode also returns `Ok(None)` when a signal
    /// interrupts the wait, so callers re-check their shutdown flags.
    ///
    /// # Errors
    /// Identity loss or decode failures.
    pub fn recv(&self, block: bool) -> Result<Option<Header>> {
        self.set_blocking(block)?;
        let mut buf = [0u8; HEADER_LEN];
        let mut prio = 0u32;
        match mq_receive(self.mqd(), &mut buf, &mut prio) {
            Ok(n) => Header::from_wire(&buf[..n]).map(Some),
            Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR) => Ok(None),
            Err(e) => Err(IpcError::from_errno(e, "mq_receive")),
        }
    }

    /// Number of headers currently queued.
    ///
    /// # Errors
    /// `mq_getattr` failures.
    pub fn depth(&self) -> Result<usize> {
        let attr = mq_getattr(self.mqd()).map_err(|e| IpcError::from_errno(e, "mq_getattr"))?;
        Ok(attr.curmsgs().max(0) as usize)
    }

    /// Removes the kernel object for `name`; open descriptors survive.
    pub fn unlink_by_name(name: &str) {
        if let Ok(c_name) = CString::new(name.as_bytes()) {
            let _ = mq_unlink(c_name.as_c_str());
        }
    }

    fn mqd(&self) -> &MqdT {
        self.mqd.as_ref().expect("queue open")
    }

    fn set_blocking(&self, block: bool) -> Result<()> {
        let want_nonblock = !block;
        if self.nonblocking.get() == want_nonblock {
            return Ok(());
        }
        let res = if want_nonblock {
            mq_set_nonblock(self.mqd())
        } else {
            mq_remove_nonblock(self.mqd())
        };
        res.map_err(|e| IpcError::from_errno(e, "mq_setattr"))?;
        self.nonblocking.set(want_nonblock);
        Ok(())
    }
}

impl Drop for HeaderQueue {
    fn drop(&mut self) {
        // Close the descriptor only; the kernel object stays until a
        // purge calls `unlink_by_name`.
        if let Some(mqd) = self.mqd.take() {
            let _ = mq_close(mqd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("/stoker_mqtest_{}_{}", tag, std::process::id())
    }

    fn header(kind: MessageType, id: u64) -> Header {
        Header {
            kind,
            id,
            status: 2,
            time: 1_700_000_000.25,
            pid: 4242,
        }
    }

    #[test]
    fn wire_roundtrip() {
        let h = header(MessageType::Call, 77);
        let decoded = Header::from_wire(&h.to_wire()).unwrap();
        assert_eq!(h, decoded);
    }

    #[test]
    fn wire_rejects_garbage() {
        assert!(Header::from_wire(&[0u8; 8]).is_err());
        let mut buf = header(MessageType::Return, 1).to_wire();
        buf[0..4].copy_from_slice(&99u32.to_le_bytes());
        assert!(Header::from_wire(&buf).is_err());
    }

    #[test]
    fn send_recv_fifo() {
        let name = unique_name("fifo");
        let q = HeaderQueue::open(&name).unwrap();
        q.send(&header(MessageType::Call, 1)).unwrap();
        q.send(&header(MessageType::Call, 2)).unwrap();

        assert_eq!(q.recv(false).unwrap().unwrap().id, 1);
        assert_eq!(q.recv(false).unwrap().unwrap().id, 2);
        assert!(q.recv(false).unwrap().is_none());

        HeaderQueue::unlink_by_name(&name);
    }

    #[test]
    fn depth_reports_pending() {
        let name = unique_name("depth");
        let q = HeaderQueue::open(&name).unwrap();
        assert_eq!(q.depth().unwrap(), 0);
        q.send(&header(MessageType::Running, 9)).unwrap();
        assert_eq!(q.depth().unwrap(), 1);
        let _ = q.recv(false).unwrap();
        assert_eq!(q.depth().unwrap(), 0);
        HeaderQueue::unlink_by_name(&name);
    }
}
