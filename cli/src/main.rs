use std::collections::VecDeque;

use bytes::Bytes;
use hashbrown::HashMap;
use tracing::{debug, info, warn};

use lattice::notify::cluster::{
    Dispatcher, EngineConfig, MessageTag, RecvHandle, RefcountDelta, Store, Topology, Transport,
    ValueType,
};
use lattice::notify::effects::{NotifySet, RankNotify, RcChange, RefWrite};
use lattice::notify::engine::Engine;
use lattice::notify::error::{DispatchError, StoreError, TransportError};
use lattice::notify::{ItemId, Rank};

/// Single-process store for the demo: every item lives on the one server.
/// An item holds a value, a write count, close subscribers, and reference
/// cells waiting for its value; the count reaching zero closes the item and
/// raises the corresponding effects.
struct DemoStore {
    owner: Rank,
    values: HashMap<ItemId, Bytes>,
    write_counts: HashMap<ItemId, i32>,
    subscribers: HashMap<ItemId, Vec<(Rank, Option<Bytes>)>>,
    waiting_refs: HashMap<ItemId, Vec<(ItemId, Option<Bytes>)>>,
}

impl DemoStore {
    fn new(owner: Rank) -> Self {
        Self {
            owner,
            values: HashMap::new(),
            write_counts: HashMap::new(),
            subscribers: HashMap::new(),
            waiting_refs: HashMap::new(),
        }
    }

    fn close(&mut self, id: ItemId, notifs: &mut NotifySet) {
        info!(id, "item closed");
        for (rank, subscript) in self.subscribers.remove(&id).unwrap_or_default() {
            notifs.notify.push(RankNotify {
                rank,
                id,
                subscript,
            });
        }
        if let Some(waiting) = self.waiting_refs.remove(&id) {
            let value = self.values.get(&id).cloned().unwrap_or_default();
            for (target, subscript) in waiting {
                notifs.references.push(RefWrite {
                    id: target,
                    subscript,
                    value: value.clone(),
                    vtype: ValueType::Blob,
                    transfer: RefcountDelta::new(0, -1),
                });
            }
        }
    }
}

impl Store for DemoStore {
    fn locate(&self, _id: ItemId) -> Rank {
        self.owner
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
        info!(
            id,
            subscript = subscript.map(String::from_utf8_lossy).as_deref(),
            vtype = vtype.name(),
            bytes = value.len(),
            "storing value"
        );
        self.values.insert(id, Bytes::copy_from_slice(value));
        if !transfer.is_zero() {
            notifs.rc_changes.insert(RcChange {
                id,
                delta: transfer,
                must_preacquire: false,
            });
        }
        Ok(())
    }

    fn store_remote(
        &mut self,
        id: ItemId,
        subscript: Option<&[u8]>,
        value: &[u8],
        vtype: ValueType,
        transfer: RefcountDelta,
        notifs: &mut NotifySet,
    ) -> Result<(), StoreError> {
        warn!(id, "demo cluster has one server; treating remote store as local");
        self.store_local(id, subscript, value, vtype, transfer, notifs)
    }

    fn refcount_local(
        &mut self,
        id: ItemId,
        delta: RefcountDelta,
        notifs: &mut NotifySet,
    ) -> Result<(), StoreError> {
        let count = self.write_counts.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        *count += delta.write;
        debug!(id, write_count = *count, "adjusted refcount");
        if *count == 0 {
            self.close(id, notifs);
        }
        Ok(())
    }

    fn refcount_remote(
        &mut self,
        id: ItemId,
        delta: RefcountDelta,
        notifs: &mut NotifySet,
    ) -> Result<(), StoreError> {
        warn!(id, "demo cluster has one server; applying remote delta locally");
        self.refcount_local(id, delta, notifs)
    }
}

/// Logs work items instead of queueing them.
struct DemoDispatcher;

impl Dispatcher for DemoDispatcher {
    fn deliver_close(&mut self, id: ItemId) -> Result<(), DispatchError> {
        info!(id, "close released ready work on this server");
        Ok(())
    }

    fn deliver_sub_close(&mut self, id: ItemId, subscript: &[u8]) -> Result<(), DispatchError> {
        info!(
            id,
            subscript = %String::from_utf8_lossy(subscript),
            "subscripted close released ready work on this server"
        );
        Ok(())
    }

    fn put_local(
        &mut self,
        target: Rank,
        payload: &[u8],
        work_type: i32,
        priority: i32,
    ) -> Result<(), DispatchError> {
        info!(
            target,
            payload = %String::from_utf8_lossy(payload),
            work_type,
            priority,
            "queued control work item"
        );
        Ok(())
    }

    fn put_remote(
        &mut self,
        target: Rank,
        payload: &[u8],
        work_type: i32,
        priority: i32,
    ) -> Result<(), DispatchError> {
        info!(
            target,
            payload = %String::from_utf8_lossy(payload),
            work_type,
            priority,
            "shipped control work item"
        );
        Ok(())
    }
}

/// In-memory loopback transport; nothing in the demo leaves the process.
#[derive(Default)]
struct DemoTransport {
    queues: HashMap<MessageTag, VecDeque<Bytes>>,
    handles: Vec<(Rank, MessageTag)>,
}

impl Transport for DemoTransport {
    fn post_recv(&mut self, src: Rank, tag: MessageTag) -> Result<RecvHandle, TransportError> {
        self.handles.push((src, tag));
        Ok(RecvHandle(self.handles.len() as u64 - 1))
    }

    fn send(&mut self, dest: Rank, tag: MessageTag, payload: &[u8]) -> Result<(), TransportError> {
        debug!(dest, ?tag, bytes = payload.len(), "send");
        self.queues
            .entry(tag)
            .or_default()
            .push_back(Bytes::copy_from_slice(payload));
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
        debug!(peer, "synchronize");
        Ok(())
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    // One server (rank 6 of 8) owning everything. Item 42 has one write
    // outstanding; workers 0 and 2 subscribed to its close, item 7 waits for
    // its value as a reference cell, and worker 4 subscribed to item 7.
    let topology = Topology::new(8, 2);
    let mut store = DemoStore::new(6);
    store.values.insert(42, Bytes::from_static(b"answer"));
    store.write_counts.insert(42, 1);
    store.write_counts.insert(7, 1);
    store
        .subscribers
        .insert(42, vec![(0, None), (2, Some(Bytes::from_static(b"member")))]);
    store.waiting_refs.insert(42, vec![(7, None)]);
    store.subscribers.insert(7, vec![(4, None)]);

    let mut engine = Engine::new(
        6,
        topology,
        EngineConfig::default(),
        store,
        DemoDispatcher,
        DemoTransport::default(),
    );

    // Release the last write on item 42 and drain the cascade: the close
    // notifies workers 0 and 2, writes item 42's value through to item 7,
    // and the transferred write count closes item 7 for worker 4.
    let mut set = engine.new_set();
    set.rc_changes.insert(RcChange {
        id: 42,
        delta: RefcountDelta::new(0, -1),
        must_preacquire: false,
    });
    engine.resolve_all(&mut set).expect("cascade failed to drain");
    assert!(set.is_empty());
    info!("all effects drained");
}
