//! In-memory transport double.
//!
//! Mediator logic that has nothing to do with shared memory — call
//! accounting, promise settlement, reaped-pid reconciliation, error
//! thresholds — is tested against this instead of the POSIX channel.
//! The mock is a cloneable handle over shared state, so a test keeps
//! one clone to play the child's side while the mediator owns another.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use stoker_ipc::{Frame, Header, IpcError, MessageType, Role, Transport};

#[derive(Default)]
struct MockState {
    queues: HashMap<u32, VecDeque<Header>>,
    slots: HashMap<u64, Vec<u8>>,
    store_size: usize,
    setup_count: u32,
    purge_count: u32,
    reattach_count: u32,
    teardown_count: u32,
    fail_next_put: Option<IpcError>,
    fail_next_get: Option<IpcError>,
    self_test_ok: bool,
}

/// A cloneable in-memory [`Transport`].
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Rc<RefCell<MockState>>,
}

impl MockTransport {
    /// A fresh mock with a 5 MiB nominal store.
    #[must_use]
    pub fn new() -> Self {
        let mock = Self::default();
        {
            let mut state = mock.state.borrow_mut();
            state.store_size = stoker_ipc::DEFAULT_STORE_SIZE;
            state.self_test_ok = true;
        }
        mock
    }

    /// Queues a header (and optional payload) as if the other side put
    /// it.
    pub fn inject(&self, header: Header, payload: Option<Vec<u8>>) {
        let mut state = self.state.borrow_mut();
        if let Some(bytes) = payload {
            state.slots.insert(header.id, bytes);
        }
        state
            .queues
            .entry(header.kind as u32)
            .or_default()
            .push_back(header);
    }

    /// Pops the oldest CALL header with its payload, as a child would.
    #[must_use]
    pub fn take_call(&self) -> Option<(Header, Option<Vec<u8>>)> {
        let mut state = self.state.borrow_mut();
        let header = state
            .queues
            .get_mut(&(MessageType::Call as u32))
            .and_then(VecDeque::pop_front)?;
        let payload = state.slots.get(&header.id).cloned();
        Some((header, payload))
    }

    /// Current payload bytes at `id`.
    #[must_use]
    pub fn slot(&self, id: u64) -> Option<Vec<u8>> {
        self.state.borrow().slots.get(&id).cloned()
    }

    /// Number of live payload slots.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.state.borrow().slots.len()
    }

    /// Queue depth for one header type.
    #[must_use]
    pub fn queue_len(&self, kind: MessageType) -> usize {
        self.state
            .borrow()
            .queues
            .get(&(kind as u32))
            .map_or(0, VecDeque::len)
    }

    /// Makes the next `put` fail with `e`.
    pub fn fail_next_put(&self, e: IpcError) {
        self.state.borrow_mut().fail_next_put = Some(e);
    }

    /// Makes the next `get` fail with `e`.
    pub fn fail_next_get(&self, e: IpcError) {
        self.state.borrow_mut().fail_next_get = Some(e);
    }

    /// Scripts the self-test outcome.
    pub fn set_self_test_ok(&self, ok: bool) {
        self.state.borrow_mut().self_test_ok = ok;
    }

    /// How often `setup` ran.
    #[must_use]
    pub fn setup_count(&self) -> u32 {
        self.state.borrow().setup_count
    }

    /// How often `purge` ran.
    #[must_use]
    pub fn purge_count(&self) -> u32 {
        self.state.borrow().purge_count
    }

    /// How often `reattach` ran.
    #[must_use]
    pub fn reattach_count(&self) -> u32 {
        self.state.borrow().reattach_count
    }

    /// How often `teardown` ran.
    #[must_use]
    pub fn teardown_count(&self) -> u32 {
        self.state.borrow().teardown_count
    }
}

impl Transport for MockTransport {
    fn setup(&mut self, _role: Role) -> stoker_ipc::Result<()> {
        self.state.borrow_mut().setup_count += 1;
        Ok(())
    }

    fn purge(&mut self) -> stoker_ipc::Result<()> {
        let mut state = self.state.borrow_mut();
        state.purge_count += 1;
        state.queues.clear();
        state.slots.clear();
        Ok(())
    }

    fn reattach(&mut self) -> stoker_ipc::Result<()> {
        self.state.borrow_mut().reattach_count += 1;
        Ok(())
    }

    fn teardown(&mut self) {
        let mut state = self.state.borrow_mut();
        state.teardown_count += 1;
        state.queues.clear();
        state.slots.clear();
    }

    fn put(&mut self, header: Header, payload: Option<&[u8]>) -> stoker_ipc::Result<()> {
        {
            let mut state = self.state.borrow_mut();
            if let Some(e) = state.fail_next_put.take() {
                return Err(e);
            }
        }
        self.inject(header, payload.map(<[u8]>::to_vec));
        Ok(())
    }

    fn get(
        &mut self,
        kind: Option<MessageType>,
        _block: bool,
    ) -> stoker_ipc::Result<Option<Frame>> {
        let mut state = self.state.borrow_mut();
        if let Some(e) = state.fail_next_get.take() {
            return Err(e);
        }
        let order = match kind {
            Some(k) => vec![k],
            None => vec![MessageType::Return, MessageType::Running, MessageType::Call],
        };
        for k in order {
            let Some(header) = state
                .queues
                .get_mut(&(k as u32))
                .and_then(VecDeque::pop_front)
            else {
                continue;
            };
            let payload = match k {
                MessageType::Running => None,
                MessageType::Call => state.slots.get(&header.id).cloned(),
                MessageType::Return => state.slots.remove(&header.id),
            };
            return Ok(Some(Frame { header, payload }));
        }
        Ok(None)
    }

    fn drop_slot(&mut self, id: u64) -> stoker_ipc::Result<()> {
        self.state.borrow_mut().slots.remove(&id);
        Ok(())
    }

    fn pending_messages(&self) -> stoker_ipc::Result<usize> {
        Ok(self
            .state
            .borrow()
            .queues
            .values()
            .map(VecDeque::len)
            .sum())
    }

    fn store_size(&self) -> usize {
        self.state.borrow().store_size
    }

    fn set_store_size(&mut self, bytes: usize) -> stoker_ipc::Result<()> {
        self.state.borrow_mut().store_size = bytes;
        Ok(())
    }

    fn self_test(&mut self) -> stoker_ipc::Result<bool> {
        Ok(self.state.borrow().self_test_ok)
    }
}
