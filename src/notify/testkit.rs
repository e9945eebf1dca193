//! In-memory collaborator doubles for exercising the engine without a real
//! store, scheduler, or network.

use std::collections::VecDeque;

use bytes::Bytes;
use hashbrown::{HashMap, HashSet};

use super::cluster::{
    Dispatcher, MessageTag, RecvHandle, RefcountDelta, Store, Transport, ValueType,
};
use super::effects::{NotifySet, RankNotify, RcChange, RefWrite};
use super::error::{DispatchError, StoreError, TransportError};
use super::{ItemId, Rank};

/// Installs the fmt subscriber so traced cascades show up in test output.
/// Safe to call from every test; only the first call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// One deferred effect a store mutation should raise.
#[derive(Clone, Debug)]
pub enum Cascade {
    Notify(RankNotify),
    Ref(RefWrite),
    Rc(RcChange),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreCall {
    pub id: ItemId,
    pub subscript: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub vtype: ValueType,
    pub transfer: RefcountDelta,
    pub remote: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdjustCall {
    pub id: ItemId,
    pub delta: RefcountDelta,
    pub remote: bool,
}

/// Store double. `home` overrides ownership per id; everything else belongs
/// to `default_owner`. A cascade registered for an id fires once, on the
/// first local mutation that touches it.
pub struct MockStore {
    pub default_owner: Rank,
    pub home: HashMap<ItemId, Rank>,
    pub cascades: HashMap<ItemId, Vec<Cascade>>,
    pub stores: Vec<StoreCall>,
    pub adjusts: Vec<AdjustCall>,
    pub fail: HashSet<ItemId>,
}

impl MockStore {
    pub fn new(default_owner: Rank) -> Self {
        Self {
            default_owner,
            home: HashMap::new(),
            cascades: HashMap::new(),
            stores: Vec::new(),
            adjusts: Vec::new(),
            fail: HashSet::new(),
        }
    }

    pub fn cascade_on(&mut self, id: ItemId, effects: Vec<Cascade>) {
        self.cascades.insert(id, effects);
    }

    fn fire_cascade(&mut self, id: ItemId, notifs: &mut NotifySet) {
        let Some(effects) = self.cascades.remove(&id) else {
            return;
        };
        for effect in effects {
            match effect {
                Cascade::Notify(n) => notifs.notify.push(n),
                Cascade::Ref(r) => notifs.references.push(r),
                Cascade::Rc(c) => {
                    notifs.rc_changes.insert(c);
                }
            }
        }
    }

    fn check(&self, id: ItemId) -> Result<(), StoreError> {
        if self.fail.contains(&id) {
            Err(StoreError::Refused { id, code: 1 })
        } else {
            Ok(())
        }
    }
}

impl Store for MockStore {
    fn locate(&self, id: ItemId) -> Rank {
        self.home.get(&id).copied().unwrap_or(self.default_owner)
    }

    fn store_local(
        &mut self,
        id: ItemId,
        subscript: Option<&[u8]>,
        value: &[u8],
        vtype: ValueType,
        transfer: RefcountDelta,
        notifs: &mut NotifySet,
    ) -> Result<(), StoreError> {
        self.check(id)?;
        self.stores.push(StoreCall {
            id,
            subscript: subscript.map(<[u8]>::to_vec),
            value: value.to_vec(),
            vtype,
            transfer,
            remote: false,
        });
        self.fire_cascade(id, notifs);
        Ok(())
    }

    fn store_remote(
        &mut self,
        id: ItemId,
        subscript: Option<&[u8]>,
        value: &[u8],
        vtype: ValueType,
        transfer: RefcountDelta,
        _notifs: &mut NotifySet,
    ) -> Result<(), StoreError> {
        self.check(id)?;
        self.stores.push(StoreCall {
            id,
            subscript: subscript.map(<[u8]>::to_vec),
            value: value.to_vec(),
            vtype,
            transfer,
            remote: true,
        });
        Ok(())
    }

    fn refcount_local(
        &mut self,
        id: ItemId,
        delta: RefcountDelta,
        notifs: &mut NotifySet,
    ) -> Result<(), StoreError> {
        self.check(id)?;
        self.adjusts.push(AdjustCall {
            id,
            delta,
            remote: false,
        });
        self.fire_cascade(id, notifs);
        Ok(())
    }

    fn refcount_remote(
        &mut self,
        id: ItemId,
        delta: RefcountDelta,
        _notifs: &mut NotifySet,
    ) -> Result<(), StoreError> {
        self.check(id)?;
        self.adjusts.push(AdjustCall {
            id,
            delta,
            remote: true,
        });
        Ok(())
    }
}

/// One recorded `put_local`/`put_remote` work item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutCall {
    pub target: Rank,
    pub payload: Vec<u8>,
    pub work_type: i32,
    pub priority: i32,
}

/// Dispatcher double: records everything; `fail_targets` makes puts for the
/// listed ranks refuse.
#[derive(Default)]
pub struct MockDispatcher {
    pub closes: Vec<ItemId>,
    pub sub_closes: Vec<(ItemId, Vec<u8>)>,
    pub puts_local: Vec<PutCall>,
    pub puts_remote: Vec<PutCall>,
    pub fail_targets: HashSet<Rank>,
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn put(
        &mut self,
        target: Rank,
        payload: &[u8],
        work_type: i32,
        priority: i32,
    ) -> Result<PutCall, DispatchError> {
        if self.fail_targets.contains(&target) {
            return Err(DispatchError::Refused(1));
        }
        Ok(PutCall {
            target,
            payload: payload.to_vec(),
            work_type,
            priority,
        })
    }
}

impl Dispatcher for MockDispatcher {
    fn deliver_close(&mut self, id: ItemId) -> Result<(), DispatchError> {
        self.closes.push(id);
        Ok(())
    }

    fn deliver_sub_close(&mut self, id: ItemId, subscript: &[u8]) -> Result<(), DispatchError> {
        self.sub_closes.push((id, subscript.to_vec()));
        Ok(())
    }

    fn put_local(
        &mut self,
        target: Rank,
        payload: &[u8],
        work_type: i32,
        priority: i32,
    ) -> Result<(), DispatchError> {
        let call = self.put(target, payload, work_type, priority)?;
        self.puts_local.push(call);
        Ok(())
    }

    fn put_remote(
        &mut self,
        target: Rank,
        payload: &[u8],
        work_type: i32,
        priority: i32,
    ) -> Result<(), DispatchError> {
        let call = self.put(target, payload, work_type, priority)?;
        self.puts_remote.push(call);
        Ok(())
    }
}

/// Transport double. Sends loop back into a per-tag FIFO, so a batch sent on
/// one side can be received on the other inside a single test. Replies a
/// "remote" peer would produce are pre-scripted with [`push_incoming`].
///
/// [`push_incoming`]: MockTransport::push_incoming
#[derive(Default)]
pub struct MockTransport {
    queues: HashMap<MessageTag, VecDeque<Bytes>>,
    handles: Vec<(Rank, MessageTag)>,
    pub sent: Vec<(Rank, MessageTag, Bytes)>,
    pub syncs: Vec<Rank>,
}

impl MockTransport {
    pub fn loopback() -> Self {
        Self::default()
    }

    pub fn push_incoming(&mut self, tag: MessageTag, payload: impl Into<Bytes>) {
        self.queues.entry(tag).or_default().push_back(payload.into());
    }

    pub fn queued(&self, tag: MessageTag) -> usize {
        self.queues.get(&tag).map_or(0, VecDeque::len)
    }
}

impl Transport for MockTransport {
    fn post_recv(&mut self, src: Rank, tag: MessageTag) -> Result<RecvHandle, TransportError> {
        self.handles.push((src, tag));
        Ok(RecvHandle(self.handles.len() as u64 - 1))
    }

    fn send(&mut self, dest: Rank, tag: MessageTag, payload: &[u8]) -> Result<(), TransportError> {
        let bytes = Bytes::copy_from_slice(payload);
        self.sent.push((dest, tag, bytes.clone()));
        self.queues.entry(tag).or_default().push_back(bytes);
        Ok(())
    }

    fn wait(&mut self, handle: RecvHandle) -> Result<Bytes, TransportError> {
        let (src, tag) = self.handles[handle.0 as usize];
        self.queues
            .get_mut(&tag)
            .and_then(VecDeque::pop_front)
            .ok_or(TransportError::Closed(src))
    }

    fn synchronize(&mut self, peer: Rank) -> Result<(), TransportError> {
        self.syncs.push(peer);
        Ok(())
    }
}
