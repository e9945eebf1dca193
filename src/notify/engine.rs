use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use tracing::{debug, trace};

use super::cluster::{
    Dispatcher, EngineConfig, MessageTag, Store, Topology, Transport, CONTROL_WORK_PRIORITY,
    CONTROL_WORK_TYPE,
};
use super::effects::{NotifySet, RankNotify};
use super::error::NotifyError;
use super::scratch::Scratch;
use super::wire::{self, BatchCounts, PreparedBatch};
use super::{ItemId, Rank};

/// Which pending refcount deltas a pass applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RcApply {
    /// Locally-owned deltas plus any flagged must-preacquire, which cannot
    /// be deferred to another process.
    LocalAndPreacquire,
    /// Everything, remote deltas included.
    All,
}

/// The `close <id> [<subscript>]` control payload, rebuilt only when the
/// (id, subscript) pair differs from the previous entry's. Consecutive
/// entries for the same close event are the common case, so the buffer is
/// usually filled once per event. Subscript identity is pointer-and-length.
#[derive(Default)]
struct ClosePayload {
    key: Option<(ItemId, Option<(usize, usize)>)>,
    buf: Vec<u8>,
}

impl ClosePayload {
    fn fill(&mut self, id: ItemId, subscript: Option<&Bytes>) -> &[u8] {
        let key = (id, subscript.map(|s| (s.as_ptr() as usize, s.len())));
        if self.key != Some(key) {
            self.buf.clear();
            self.buf.extend_from_slice(format!("close {id}").as_bytes());
            if let Some(sub) = subscript {
                self.buf.push(b' ');
                self.buf.extend_from_slice(sub);
            }
            self.key = Some(key);
        }
        &self.buf
    }
}

/// LocalResolver and Orchestrator in one: owns the collaborators and drives
/// a NotifySet through them. One engine per process; all methods run on the
/// process's single thread.
pub struct Engine<S, D, T> {
    rank: Rank,
    topology: Topology,
    config: EngineConfig,
    pub store: S,
    pub dispatch: D,
    pub transport: T,
}

impl<S: Store, D: Dispatcher, T: Transport> Engine<S, D, T> {
    pub fn new(
        rank: Rank,
        topology: Topology,
        config: EngineConfig,
        store: S,
        dispatch: D,
        transport: T,
    ) -> Self {
        Self {
            rank,
            topology,
            config,
            store,
            dispatch,
            transport,
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// A fresh effect set using the configured merge strategy.
    pub fn new_set(&self) -> NotifySet {
        NotifySet::new(self.config.rc_merge)
    }

    fn am_server(&self) -> bool {
        self.topology.is_server(self.rank)
    }

    /// Resolves every effect in `set`, local or remote, until a full pass
    /// leaves all three queues empty. Refcount deltas go first because
    /// applying one can close items and enqueue notifications; close
    /// notifications go next and never enqueue anything; reference writes go
    /// last and can enqueue both of the others, which is why this loops to a
    /// fixed point instead of making one pass.
    pub fn resolve_all(&mut self, set: &mut NotifySet) -> Result<(), NotifyError> {
        while !set.is_empty() {
            if !set.rc_changes.is_empty() {
                self.apply_rc_changes(set, RcApply::All)?;
            }
            debug_assert!(set.rc_changes.is_empty());

            if !set.notify.is_empty() {
                self.close_notify(set)?;
            }
            debug_assert!(set.notify.is_empty());
            debug_assert!(set.rc_changes.is_empty());

            if !set.references.is_empty() {
                self.set_refs(set, false)?;
            }
            debug_assert!(set.references.is_empty());
        }
        debug_assert!(set.is_empty());
        Ok(())
    }

    /// Resolves only what needs no network hop, leaving the remainder in
    /// `set` for the caller to ship. Reference writes first (they can add
    /// refcount work), then local and must-preacquire deltas, then the
    /// notifications dispatchable in process.
    pub fn resolve_local(&mut self, set: &mut NotifySet) -> Result<(), NotifyError> {
        assert!(self.am_server(), "local pass only runs on a server");
        self.set_refs(set, true)?;
        self.apply_rc_changes(set, RcApply::LocalAndPreacquire)?;
        self.local_notify_pass(set)?;
        Ok(())
    }

    /// Server reply path. With `client_notifies` set, remaining work after
    /// the local pass is packed for the requesting client to finish and
    /// `Some` is returned; the caller reports the counts in its reply header
    /// and ships the batch with [`wire::send_batch`]. Otherwise everything
    /// is resolved here and the reply carries no batch.
    pub fn prepare_reply<'b>(
        &mut self,
        set: &mut NotifySet,
        scratch: &mut Scratch<'b>,
    ) -> Result<Option<(BatchCounts, PreparedBatch<'b>)>, NotifyError> {
        if !self.config.client_notifies {
            self.resolve_all(set)?;
            return Ok(None);
        }
        self.resolve_local(set)?;
        if set.is_empty() {
            return Ok(None);
        }
        Ok(Some(wire::pack_into(set, scratch)))
    }

    /// Client side of [`prepare_reply`]: receives the batch a server handed
    /// off, per the counts from the reply header, and resolves it fully.
    ///
    /// [`prepare_reply`]: Engine::prepare_reply
    pub fn handle_reply(&mut self, server: Rank, counts: &BatchCounts) -> Result<(), NotifyError> {
        if counts.is_empty() {
            return Ok(());
        }
        debug!(
            server,
            notify = counts.notify,
            references = counts.references,
            rc_changes = counts.rc_changes,
            "finishing handed-off notification work"
        );
        let mut set = self.new_set();
        wire::recv_batch(&mut self.transport, server, counts, &mut set)?;
        self.resolve_all(&mut set)?;
        Ok(())
    }

    /// Applies queued reference writes. `local_only` restricts the pass to
    /// items this process owns and leaves the rest queued; the full pass
    /// keeps going until the queue is empty, cascaded appends included.
    fn set_refs(&mut self, set: &mut NotifySet, local_only: bool) -> Result<(), NotifyError> {
        if local_only {
            let mut i = 0;
            while i < set.references.len() {
                let id = set.references.get(i).id;
                if self.store.locate(id) != self.rank {
                    i += 1;
                    continue;
                }
                let entry = set.references.swap_remove(i);
                self.set_ref(entry, set)?;
            }
        } else {
            while !set.references.is_empty() {
                let entry = set.references.swap_remove(set.references.len() - 1);
                self.set_ref(entry, set)?;
            }
        }
        Ok(())
    }

    fn set_ref(
        &mut self,
        entry: super::effects::RefWrite,
        set: &mut NotifySet,
    ) -> Result<(), NotifyError> {
        debug!(
            id = entry.id,
            vtype = entry.vtype.name(),
            read = entry.transfer.read,
            write = entry.transfer.write,
            "writing reference value"
        );
        let owner = self.store.locate(entry.id);
        if owner == self.rank {
            self.store.store_local(
                entry.id,
                entry.subscript.as_deref(),
                &entry.value,
                entry.vtype,
                entry.transfer,
                set,
            )?;
            return Ok(());
        }
        if self.am_server() {
            self.transport.synchronize(owner)?;
        }
        self.store.store_remote(
            entry.id,
            entry.subscript.as_deref(),
            &entry.value,
            entry.vtype,
            entry.transfer,
            set,
        )?;
        Ok(())
    }

    /// Applies queued refcount deltas per `mode` and removes them. A
    /// zero/zero delta is already applied: removed without touching the
    /// store or the network. Cascaded appends during the pass are picked up
    /// by the same loop.
    fn apply_rc_changes(&mut self, set: &mut NotifySet, mode: RcApply) -> Result<(), NotifyError> {
        let mut i = 0;
        while i < set.rc_changes.len() {
            let change = set.rc_changes.get(i);
            if change.delta.is_zero() {
                set.rc_changes.swap_remove(i);
                continue;
            }
            let local = self.store.locate(change.id) == self.rank;
            let applies = mode == RcApply::All || local || change.must_preacquire;
            if !applies {
                i += 1;
                continue;
            }
            set.rc_changes.swap_remove(i);
            trace!(
                id = change.id,
                read = change.delta.read,
                write = change.delta.write,
                local,
                "applying refcount delta"
            );
            if local {
                self.store.refcount_local(change.id, change.delta, set)?;
            } else {
                let owner = self.store.locate(change.id);
                if self.am_server() {
                    self.transport.synchronize(owner)?;
                }
                self.store.refcount_remote(change.id, change.delta, set)?;
            }
        }
        Ok(())
    }

    /// Dispatches every queued close notification, remote targets included.
    /// Dispatching never enqueues further effects, so the queue's backing
    /// storage is taken wholesale; on an error the entries not yet
    /// dispatched (the failing one included) go back on the queue.
    fn close_notify(&mut self, set: &mut NotifySet) -> Result<(), NotifyError> {
        let entries = set.notify.take_entries();
        let mut payload = ClosePayload::default();
        for (i, entry) in entries.iter().enumerate() {
            if let Err(err) = self.dispatch_close(entry, &mut payload) {
                for undelivered in &entries[i..] {
                    set.notify.push(undelivered.clone());
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn dispatch_close(
        &mut self,
        entry: &RankNotify,
        payload: &mut ClosePayload,
    ) -> Result<(), NotifyError> {
        let target = entry.rank;
        let server = self.topology.map_to_server(target);
        if self.am_server() && target == self.rank {
            self.deliver_self(entry)?;
        } else if server == target {
            // A server subscribed over the sync channel.
            self.notify_server(server, entry.id, entry.subscript.as_deref())?;
        } else {
            let buf = payload.fill(entry.id, entry.subscript.as_ref());
            if server == self.rank {
                self.dispatch
                    .put_local(target, buf, CONTROL_WORK_TYPE, CONTROL_WORK_PRIORITY)?;
            } else {
                if self.am_server() {
                    self.transport.synchronize(server)?;
                }
                self.dispatch
                    .put_remote(target, buf, CONTROL_WORK_TYPE, CONTROL_WORK_PRIORITY)?;
            }
        }
        Ok(())
    }

    /// The notify part of the local pass: delivers entries targeting this
    /// server or a worker it owns, leaves the rest queued.
    fn local_notify_pass(&mut self, set: &mut NotifySet) -> Result<(), NotifyError> {
        let mut payload = ClosePayload::default();
        let mut i = 0;
        while i < set.notify.len() {
            let entry = set.notify.get(i);
            let target = entry.rank;
            if target == self.rank {
                match &entry.subscript {
                    Some(sub) => self.dispatch.deliver_sub_close(entry.id, sub)?,
                    None => self.dispatch.deliver_close(entry.id)?,
                }
            } else if self.topology.map_to_server(target) == self.rank {
                let buf = payload.fill(entry.id, entry.subscript.as_ref());
                self.dispatch
                    .put_local(target, buf, CONTROL_WORK_TYPE, CONTROL_WORK_PRIORITY)?;
            } else {
                i += 1;
                continue;
            }
            set.notify.swap_remove(i);
        }
        Ok(())
    }

    /// Close delivered to this server itself, straight into the ready-work
    /// channel.
    fn deliver_self(&mut self, entry: &RankNotify) -> Result<(), NotifyError> {
        trace!(id = entry.id, "delivering close to own ready-work channel");
        match &entry.subscript {
            Some(sub) => self.dispatch.deliver_sub_close(entry.id, sub)?,
            None => self.dispatch.deliver_close(entry.id)?,
        }
        Ok(())
    }

    /// Single-item close request to a subscribed remote server. The receive
    /// for the reply code is posted before the request goes out, then waited
    /// on; at most one round trip is ever outstanding.
    fn notify_server(
        &mut self,
        server: Rank,
        id: ItemId,
        subscript: Option<&[u8]>,
    ) -> Result<(), NotifyError> {
        debug!(server, id, "notifying subscribed server of close");
        if self.am_server() {
            self.transport.synchronize(server)?;
        }
        let request = wire::encode_notify_request(id, subscript);
        let handle = self.transport.post_recv(server, MessageTag::Response)?;
        self.transport.send(server, MessageTag::Notify, &request)?;
        let reply = self.transport.wait(handle)?;
        let code = LittleEndian::read_i32(&reply[0..4]);
        if code != 0 {
            return Err(NotifyError::RemoteRefused { server, code });
        }
        Ok(())
    }
}
