//! The three-way transport contract: lock + payload store + typed
//! header queues, assembled behind one trait so the mediator can run
//! against the real POSIX channel or an in-memory test double.

use std::time::Duration;

use crate::error::{IpcError, Result};
use crate::guid::Guid;
use crate::lock::ShmLock;
use crate::queue::{Header, HeaderQueue, MessageType};
use crate::store::{PayloadStore, RESERVED_SLOT};

/// Default payload-store size: 5 MiB.
pub const DEFAULT_STORE_SIZE: usize = 5 * 1024 * 1024;

/// Protocol version written into the reserved header slot.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Which side of the fork this channel serves.
///
/// The parent owns the reserved header slot and uses a tighter retry
/// back-off than children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// The daemon process issuing calls.
    #[default]
    Parent,
    /// A forked worker servicing calls.
    Child,
}

/// One received message: the header plus, for payload-bearing types,
/// the record bytes read from the store.
#[derive(Debug)]
pub struct Frame {
    /// The queue header.
    pub header: Header,
    /// Record bytes for `Call`/`Return` headers; `None` for `Running`
    /// headers and for stale headers whose slot has already vanished.
    pub payload: Option<Vec<u8>>,
}

/// The channel operations the mediator drives.
pub trait Transport {
    /// Attaches lock, store, and queues; the parent also writes the
    /// protocol header record at the reserved slot.
    fn setup(&mut self, role: Role) -> Result<()>;

    /// Destroys and recreates all three underlying objects.
    fn purge(&mut self) -> Result<()>;

    /// Drops and re-opens the handles without destroying anything,
    /// picking up objects recreated after an identity loss.
    fn reattach(&mut self) -> Result<()>;

    /// Detaches and removes the kernel objects for good (daemon
    /// shutdown). The channel is unusable afterwards until `setup`.
    fn teardown(&mut self);

    /// Writes the payload (when the type carries one) and enqueues the
    /// header, retrying transient failures up to three times.
    fn put(&mut self, header: Header, payload: Option<&[u8]>) -> Result<()>;

    /// Dequeues the next header of `kind` (any type when `None`,
    /// scanning returns, then acks, then calls) and resolves its
    /// payload. Nonblocking form returns `Ok(None)` on empty.
    fn get(&mut self, kind: Option<MessageType>, block: bool) -> Result<Option<Frame>>;

    /// Best-effort removal of a payload slot.
    fn drop_slot(&mut self, id: u64) -> Result<()>;

    /// Total queued headers, for statistics.
    fn pending_messages(&self) -> Result<usize>;

    /// Size of the payload store in bytes.
    fn store_size(&self) -> usize;

    /// Resizes the store; only valid before the first `setup`.
    fn set_store_size(&mut self, bytes: usize) -> Result<()>;

    /// Writes a random record through the store and reads it back,
    /// reporting whether it round-tripped intact. Used to decide
    /// whether a corruption error was a fluke.
    fn self_test(&mut self) -> Result<bool>;
}

/// Retry delay: `base * 2^min(attempt, 8) - base`.
///
/// Attempt 0 yields zero so the first retry is immediate.
#[must_use]
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(8));
    base * factor - base
}

const PUT_ATTEMPTS: u32 = 3;
const SELF_TEST_SLOT: u64 = u64::MAX;

struct Attached {
    lock: ShmLock,
    store: PayloadStore,
    // Indexed as [call, running, return].
    queues: [HeaderQueue; 3],
}

impl Attached {
    fn queue(&self, kind: MessageType) -> &HeaderQueue {
        match kind {
            MessageType::Call => &self.queues[0],
            MessageType::Running => &self.queues[1],
            MessageType::Return => &self.queues[2],
        }
    }
}

/// The real POSIX channel: pshared robust lock, shm payload store, and
/// one message queue per header type, all named off the guid.
pub struct PosixChannel {
    guid: Guid,
    role: Role,
    store_size: usize,
    attached: Option<Attached>,
    warned_oversize: bool,
}

impl PosixChannel {
    /// Creates an unattached channel for `guid`.
    #[must_use]
    pub fn new(guid: Guid) -> Self {
        Self {
            guid,
            role: Role::Parent,
            store_size: DEFAULT_STORE_SIZE,
            attached: None,
            warned_oversize: false,
        }
    }

    /// The transport token.
    #[must_use]
    pub const fn guid(&self) -> &Guid {
        &self.guid
    }

    fn attach(&mut self) -> Result<()> {
        let lock = ShmLock::open(&self.guid.lock_name())?;
        let store = PayloadStore::attach(&self.guid.store_name(), self.store_size)?;
        let queues = [
            HeaderQueue::open(&self.guid.queue_name(MessageType::Call.suffix()))?,
            HeaderQueue::open(&self.guid.queue_name(MessageType::Running.suffix()))?,
            HeaderQueue::open(&self.guid.queue_name(MessageType::Return.suffix()))?,
        ];
        self.attached = Some(Attached {
            lock,
            store,
            queues,
        });
        Ok(())
    }

    fn unlink_all(&self) {
        for kind in [MessageType::Call, MessageType::Running, MessageType::Return] {
            HeaderQueue::unlink_by_name(&self.guid.queue_name(kind.suffix()));
        }
        PayloadStore::unlink_by_name(&self.guid.store_name());
        ShmLock::unlink_by_name(&self.guid.lock_name());
    }

    fn parts(&mut self) -> Result<&mut Attached> {
        self.attached
            .as_mut()
            .ok_or_else(|| IpcError::Invalid("transport not set up".into()))
    }

    fn parts_ref(&self) -> Result<&Attached> {
        self.attached
            .as_ref()
            .ok_or_else(|| IpcError::Invalid("transport not set up".into()))
    }

    fn write_header_record(&mut self) -> Result<()> {
        let store_size = self.store_size;
        let a = self.parts()?;
        let record = format!("{{\"version\":\"{PROTOCOL_VERSION}\",\"size\":{store_size}}}");
        let guard = a.lock.guard()?;
        a.store.write(RESERVED_SLOT, record.as_bytes())?;
        drop(guard);
        Ok(())
    }

    fn backoff_base(&self) -> Duration {
        match self.role {
            Role::Parent => Duration::from_millis(20),
            Role::Child => Duration::from_millis(100),
        }
    }

    fn put_once(&mut self, header: Header, payload: Option<&[u8]>) -> Result<()> {
        let a = self.parts()?;
        let guard = a.lock.guard()?;
        if let Some(bytes) = payload {
            a.store.write(header.id, bytes)?;
        }
        a.queue(header.kind).send(&header)?;
        drop(guard);
        Ok(())
    }

    fn check_oversize(&mut self, id: u64, len: usize) {
        if self.warned_oversize || len <= self.store_size / 50 {
            return;
        }
        self.warned_oversize = true;
        tracing::warn!(
            id,
            bytes = len,
            store = self.store_size,
            recommended = len * 60,
            "call payload exceeds 2% of the payload store; grow the store"
        );
    }
}

impl Transport for PosixChannel {
    fn setup(&mut self, role: Role) -> Result<()> {
        self.role = role;
        if self.attached.is_some() {
            return Ok(());
        }
        self.attach()?;
        if role == Role::Parent {
            self.write_header_record()?;
        }
        Ok(())
    }

    fn purge(&mut self) -> Result<()> {
        let role = self.role;
        self.attached = None;
        self.unlink_all();
        self.attach()?;
        if role == Role::Parent {
            self.write_header_record()?;
        }
        Ok(())
    }

    fn reattach(&mut self) -> Result<()> {
        self.attached = None;
        self.attach()?;
        if self.role == Role::Parent {
            self.write_header_record()?;
        }
        Ok(())
    }

    fn teardown(&mut self) {
        self.attached = None;
        self.unlink_all();
    }

    fn put(&mut self, header: Header, payload: Option<&[u8]>) -> Result<()> {
        let base = self.backoff_base();
        let mut last = None;
        for attempt in 0..PUT_ATTEMPTS {
            match self.put_once(header, payload) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => {
                    std::thread::sleep(backoff_delay(base, attempt));
                    last = Some(e);
                }
                Err(e) if e.is_identity() => {
                    tracing::warn!(error = %e, "transport identity lost during put; reattaching");
                    self.reattach()?;
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| IpcError::Transient("put retries exhausted".into())))
    }

    fn get(&mut self, kind: Option<MessageType>, block: bool) -> Result<Option<Frame>> {
        let order: &[MessageType] = match kind {
            Some(MessageType::Call) => &[MessageType::Call],
            Some(MessageType::Running) => &[MessageType::Running],
            Some(MessageType::Return) => &[MessageType::Return],
            None => &[MessageType::Return, MessageType::Running, MessageType::Call],
        };

        let mut received = None;
        {
            let a = self.parts()?;
            for (idx, k) in order.iter().enumerate() {
                // Only the final queue in the scan may block, or a drain
                // of an earlier empty queue would stall the caller.
                let may_block = block && idx == order.len() - 1;
                if let Some(header) = a.queue(*k).recv(may_block)? {
                    let payload = match k {
                        MessageType::Running => None,
                        MessageType::Call => {
                            let guard = a.lock.guard()?;
                            let bytes = a.store.read(header.id);
                            drop(guard);
                            bytes
                        }
                        MessageType::Return => {
                            let guard = a.lock.guard()?;
                            let bytes = a.store.read(header.id);
                            a.store.remove(header.id);
                            drop(guard);
                            bytes
                        }
                    };
                    received = Some(Frame { header, payload });
                    break;
                }
            }
        }

        if let Some(frame) = &received {
            if let Some(bytes) = &frame.payload {
                self.check_oversize(frame.header.id, bytes.len());
            }
        }
        Ok(received)
    }

    fn drop_slot(&mut self, id: u64) -> Result<()> {
        let a = self.parts()?;
        let guard = a.lock.guard()?;
        a.store.remove(id);
        drop(guard);
        Ok(())
    }

    fn pending_messages(&self) -> Result<usize> {
        let a = self.parts_ref()?;
        let mut total = 0;
        for kind in [MessageType::Call, MessageType::Running, MessageType::Return] {
            total += a.queue(kind).depth()?;
        }
        Ok(total)
    }

    fn store_size(&self) -> usize {
        self.store_size
    }

    fn set_store_size(&mut self, bytes: usize) -> Result<()> {
        if self.attached.is_some() {
            return Err(IpcError::Invalid(
                "store size must be set before setup".into(),
            ));
        }
        self.store_size = bytes;
        Ok(())
    }

    fn self_test(&mut self) -> Result<bool> {
        use rand::Rng;
        let mut blob = vec![0u8; 512];
        rand::rng().fill(blob.as_mut_slice());

        let a = self.parts()?;
        let guard = a.lock.guard()?;
        a.store.write(SELF_TEST_SLOT, &blob)?;
        let echoed = a.store.read(SELF_TEST_SLOT);
        a.store.remove(SELF_TEST_SLOT);
        drop(guard);

        Ok(echoed.as_deref() == Some(blob.as_slice()))
    }
}
