//! Call records.
//!
//! A `Call` is the unit the mediator moves around: immutable identity
//! (id, method, arguments) plus mutable status. Its id doubles as the
//! payload-store slot address, so ids are process-unique, monotonic,
//! and start above the reserved header slot.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use stoker_ipc::{Header, MessageType, FIRST_CALL_SLOT};

use crate::error::{Result, WorkerError};
use crate::promise::Promise;

/// A call id; also the payload slot address.
pub type CallId = u64;

static NEXT_ID: AtomicU64 = AtomicU64::new(FIRST_CALL_SLOT);

/// Status of a call. Monotone over `{Called, Running, Returned}`;
/// reachable again at `Uncalled` only through [`Call::retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallStatus {
    /// Created (or reset by a retry); not yet on the wire.
    Uncalled,
    /// Written to the transport, waiting for a child.
    Called,
    /// A child acknowledged and is executing.
    Running,
    /// The child returned a result.
    Returned,
    /// Cancelled before a child picked it up.
    Cancelled,
    /// Lost: the servicing child died first.
    Timeout,
}

impl CallStatus {
    /// Wire discriminant.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Uncalled => 0,
            Self::Called => 1,
            Self::Running => 2,
            Self::Returned => 3,
            Self::Cancelled => 4,
            Self::Timeout => 5,
        }
    }

    /// Decodes a wire discriminant.
    #[must_use]
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Uncalled),
            1 => Some(Self::Called),
            2 => Some(Self::Running),
            3 => Some(Self::Returned),
            4 => Some(Self::Cancelled),
            5 => Some(Self::Timeout),
            _ => None,
        }
    }

    /// Whether the call is finished.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Returned | Self::Cancelled | Self::Timeout)
    }

    /// The stable name used in the `time` map.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Uncalled => "uncalled",
            Self::Called => "called",
            Self::Running => "running",
            Self::Returned => "returned",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }
}

impl Serialize for CallStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for CallStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = u8::deserialize(deserializer)?;
        Self::from_u8(raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown call status {raw}")))
    }
}

/// The wire form: exactly the fields that cross the payload store.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireCall {
    id: CallId,
    pid: i32,
    status: CallStatus,
    method: String,
    args: Vec<Value>,
    time: BTreeMap<String, f64>,
    result: Option<Value>,
}

/// One remote method invocation.
#[derive(Debug)]
pub struct Call {
    id: CallId,
    /// The worker operation to invoke.
    pub method: String,
    /// Ordered invocation arguments; freed by [`gc`](Self::gc).
    pub args: Vec<Value>,
    /// The servicing child; zero until claimed.
    pub pid: i32,
    status: CallStatus,
    time: BTreeMap<String, f64>,
    /// The produced value, or the error sentinel.
    pub result: Option<Value>,
    size: usize,
    /// Submission attempts (1 + retries).
    pub attempts: u32,
    /// Errors observed while servicing this call.
    pub errors: u32,
    promise: Option<Promise>,
    collected: bool,
}

fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl Call {
    /// Creates a fresh call with a process-unique monotonic id.
    #[must_use]
    pub fn create(method: impl Into<String>, args: Vec<Value>) -> Self {
        let method = method.into();
        // Footprint approximation: the serialized arguments plus a
        // fixed overhead for the envelope.
        let size = serde_json::to_vec(&args).map_or(0, |v| v.len()) + method.len() + 96;
        let mut call = Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            method,
            args,
            pid: 0,
            status: CallStatus::Uncalled,
            time: BTreeMap::new(),
            result: None,
            size,
            attempts: 1,
            errors: 0,
            promise: None,
            collected: false,
        };
        call.stamp(CallStatus::Uncalled);
        call
    }

    /// The id.
    #[must_use]
    pub const fn id(&self) -> CallId {
        self.id
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> CallStatus {
        self.status
    }

    /// Approximate byte footprint at creation.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Whether [`gc`](Self::gc) already freed the payload fields.
    #[must_use]
    pub const fn is_collected(&self) -> bool {
        self.collected
    }

    /// Timestamp at which `status` was entered, if it ever was.
    #[must_use]
    pub fn time_of(&self, status: CallStatus) -> Option<f64> {
        self.time.get(status.name()).copied()
    }

    /// The parent-side promise, created on first access. Never
    /// serialized, never crosses a process boundary.
    pub fn promise(&mut self) -> Promise {
        self.promise.get_or_insert_with(Promise::new).clone()
    }

    /// Whether the promise exists and is settled.
    #[must_use]
    pub fn promise_settled(&self) -> bool {
        self.promise.as_ref().is_some_and(Promise::is_settled)
    }

    /// Transitions to `Called`.
    ///
    /// # Errors
    /// Status regressions.
    pub fn called(&mut self) -> Result<()> {
        self.set_status(CallStatus::Called)
    }

    /// Transitions to `Running`, claiming the call for `pid`.
    ///
    /// # Errors
    /// Status regressions.
    pub fn running(&mut self, pid: i32) -> Result<()> {
        self.set_status(CallStatus::Running)?;
        self.pid = pid;
        Ok(())
    }

    /// Transitions to `Returned` with the produced value.
    ///
    /// # Errors
    /// Status regressions.
    pub fn returned(&mut self, result: Option<Value>) -> Result<()> {
        self.set_status(CallStatus::Returned)?;
        self.result = result;
        Ok(())
    }

    /// Transitions to `Cancelled`.
    ///
    /// # Errors
    /// Status regressions.
    pub fn cancelled(&mut self) -> Result<()> {
        self.set_status(CallStatus::Cancelled)
    }

    /// Transitions to `Timeout` (the "call died" terminal state).
    ///
    /// # Errors
    /// Status regressions.
    pub fn timeout(&mut self) -> Result<()> {
        self.set_status(CallStatus::Timeout)
    }

    /// Resets to `Uncalled` for a fresh submission attempt; the id is
    /// kept.
    pub fn retry(&mut self) {
        self.attempts += 1;
        self.status = CallStatus::Uncalled;
        self.stamp(CallStatus::Uncalled);
    }

    /// Applies a status change, stamping the entry time.
    ///
    /// # Errors
    /// Any strict decrease (the only way back down is [`retry`]).
    pub fn set_status(&mut self, status: CallStatus) -> Result<()> {
        if status.as_u8() < self.status.as_u8() {
            return Err(WorkerError::validation(format!(
                "call {} status cannot go {} -> {}",
                self.id,
                self.status.name(),
                status.name()
            )));
        }
        self.status = status;
        self.stamp(status);
        Ok(())
    }

    /// Builds the queue header announcing this call under `kind`.
    #[must_use]
    pub fn header(&self, kind: MessageType) -> Header {
        Header {
            kind,
            id: self.id,
            status: self.status.as_u8(),
            time: unix_now(),
            pid: std::process::id() as i32,
        }
    }

    /// Serializes the wire fields (`promise` is parent-only and never
    /// included).
    ///
    /// # Errors
    /// Serialization failures.
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        let wire = WireCall {
            id: self.id,
            pid: self.pid,
            status: self.status,
            method: self.method.clone(),
            args: self.args.clone(),
            time: self.time.clone(),
            result: self.result.clone(),
        };
        serde_json::to_vec(&wire)
            .map_err(|e| WorkerError::Corruption(format!("encode call {}: {e}", self.id)))
    }

    /// Deserializes a call from its wire form.
    ///
    /// # Errors
    /// Corrupt bytes.
    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        let wire: WireCall = serde_json::from_slice(bytes)
            .map_err(|e| WorkerError::Corruption(format!("decode call: {e}")))?;
        let size = bytes.len();
        Ok(Self {
            id: wire.id,
            method: wire.method,
            args: wire.args,
            pid: wire.pid,
            status: wire.status,
            time: wire.time,
            result: wire.result,
            size,
            attempts: 1,
            errors: 0,
            promise: None,
            collected: false,
        })
    }

    fn stamp(&mut self, status: CallStatus) {
        self.time.insert(status.name().to_string(), unix_now());
    }

    /// Frees the payload fields of a terminal call so history stays
    /// cheap. Returns whether collection happened.
    pub fn gc(&mut self) -> bool {
        if !self.status.is_terminal() || self.collected {
            return false;
        }
        self.args = Vec::new();
        self.result = None;
        self.collected = true;
        true
    }
}
