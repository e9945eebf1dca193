use bytes::Bytes;
use typed_builder::TypedBuilder;

use super::effects::{NotifySet, RcMergeStrategy};
use super::error::{DispatchError, StoreError, TransportError};
use super::{ItemId, Rank};

/// Work type reserved for in-process `close` control items.
pub const CONTROL_WORK_TYPE: i32 = 1;
/// Priority for `close` control items.
pub const CONTROL_WORK_PRIORITY: i32 = 1;

/// Message tags reserved by the notification subsystem.
///
/// `Notify` carries a single-item close request to a subscribed server;
/// `Response` carries its integer reply code; `ResponseNotif` carries the
/// sections of a packed batch, in layout order.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageTag {
    Notify,
    Response,
    ResponseNotif,
}

/// Token for one outstanding non-blocking receive. At most one is in flight
/// per remote entry, so transports never juggle more than a handful.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecvHandle(pub u64);

/// Storage-level type of a reference value, carried through the wire so the
/// receiving store can write it back with the right representation.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueType {
    Null,
    Integer,
    Float,
    String,
    Blob,
    Container,
    Multiset,
    Ref,
    Struct,
}

impl ValueType {
    pub fn name(&self) -> &'static str {
        match self {
            ValueType::Null => "null",
            ValueType::Integer => "integer",
            ValueType::Float => "float",
            ValueType::String => "string",
            ValueType::Blob => "blob",
            ValueType::Container => "container",
            ValueType::Multiset => "multiset",
            ValueType::Ref => "ref",
            ValueType::Struct => "struct",
        }
    }
}

impl From<ValueType> for u8 {
    fn from(t: ValueType) -> Self {
        t as u8
    }
}

impl TryFrom<u8> for ValueType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ValueType::Null),
            1 => Ok(ValueType::Integer),
            2 => Ok(ValueType::Float),
            3 => Ok(ValueType::String),
            4 => Ok(ValueType::Blob),
            5 => Ok(ValueType::Container),
            6 => Ok(ValueType::Multiset),
            7 => Ok(ValueType::Ref),
            8 => Ok(ValueType::Struct),
            _ => Err(()),
        }
    }
}

/// A read/write refcount pair. Used both as a signed delta and as the
/// budget transferred along with a reference-cell write.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefcountDelta {
    pub read: i32,
    pub write: i32,
}

impl RefcountDelta {
    pub fn new(read: i32, write: i32) -> Self {
        Self { read, write }
    }

    /// A zero/zero delta is a valid entry that is already applied.
    pub fn is_zero(&self) -> bool {
        self.read == 0 && self.write == 0
    }
}

/// Process layout of the cluster: `comm_size` ranks, of which the last
/// `servers` are data servers. Every worker maps deterministically to one
/// server; servers map to themselves.
#[derive(Clone, Copy, Debug)]
pub struct Topology {
    comm_size: u32,
    servers: u32,
}

impl Topology {
    pub fn new(comm_size: u32, servers: u32) -> Self {
        assert!(servers >= 1 && servers < comm_size);
        Self { comm_size, servers }
    }

    pub fn comm_size(&self) -> u32 {
        self.comm_size
    }

    pub fn workers(&self) -> u32 {
        self.comm_size - self.servers
    }

    pub fn is_server(&self, rank: Rank) -> bool {
        rank >= self.workers()
    }

    pub fn map_to_server(&self, rank: Rank) -> Rank {
        if self.is_server(rank) {
            rank
        } else {
            self.workers() + rank % self.servers
        }
    }
}

/// Engine knobs, set once at startup.
#[derive(TypedBuilder, Clone, Debug)]
pub struct EngineConfig {
    /// When true, a server resolves only what is local in its reply path and
    /// packs the remainder for the requesting client to finish. When false,
    /// the server resolves everything itself before replying.
    #[builder(default = true)]
    pub client_notifies: bool,
    /// Strategy for merging pending refcount deltas on insert.
    #[builder(default = RcMergeStrategy::Indexed)]
    pub rc_merge: RcMergeStrategy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// The storage collaborator. `locate` is the deterministic id→owner mapping;
/// the local/remote pairs write through directly or via the owner's client
/// channel. Every mutating call may append further effects to the passed
/// NotifySet; that is the cascading channel.
pub trait Store {
    fn locate(&self, id: ItemId) -> Rank;

    fn store_local(
        &mut self,
        id: ItemId,
        subscript: Option<&[u8]>,
        value: &[u8],
        vtype: ValueType,
        transfer: RefcountDelta,
        notifs: &mut NotifySet,
    ) -> Result<(), StoreError>;

    fn store_remote(
        &mut self,
        id: ItemId,
        subscript: Option<&[u8]>,
        value: &[u8],
        vtype: ValueType,
        transfer: RefcountDelta,
        notifs: &mut NotifySet,
    ) -> Result<(), StoreError>;

    fn refcount_local(
        &mut self,
        id: ItemId,
        delta: RefcountDelta,
        notifs: &mut NotifySet,
    ) -> Result<(), StoreError>;

    fn refcount_remote(
        &mut self,
        id: ItemId,
        delta: RefcountDelta,
        notifs: &mut NotifySet,
    ) -> Result<(), StoreError>;
}

/// The scheduling collaborator. `deliver_close`/`deliver_sub_close` feed this
/// server's own ready-work channel; `put_local` enqueues a work item for a
/// worker belonging to this server without a network hop; `put_remote` ships
/// one to a worker elsewhere. Close work items go in with
/// [`CONTROL_WORK_TYPE`] and [`CONTROL_WORK_PRIORITY`].
pub trait Dispatcher {
    fn deliver_close(&mut self, id: ItemId) -> Result<(), DispatchError>;

    fn deliver_sub_close(&mut self, id: ItemId, subscript: &[u8]) -> Result<(), DispatchError>;

    fn put_local(
        &mut self,
        target: Rank,
        payload: &[u8],
        work_type: i32,
        priority: i32,
    ) -> Result<(), DispatchError>;

    fn put_remote(
        &mut self,
        target: Rank,
        payload: &[u8],
        work_type: i32,
        priority: i32,
    ) -> Result<(), DispatchError>;
}

/// The transport collaborator: point-to-point primitives plus the rendezvous
/// handshake two servers use before talking to each other. Requests that
/// expect a reply post the receive before sending and wait on that single
/// outstanding handle.
pub trait Transport {
    fn post_recv(&mut self, src: Rank, tag: MessageTag) -> Result<RecvHandle, TransportError>;

    fn send(&mut self, dest: Rank, tag: MessageTag, payload: &[u8]) -> Result<(), TransportError>;

    fn wait(&mut self, handle: RecvHandle) -> Result<Bytes, TransportError>;

    fn synchronize(&mut self, peer: Rank) -> Result<(), TransportError>;

    fn recv(&mut self, src: Rank, tag: MessageTag) -> Result<Bytes, TransportError> {
        let handle = self.post_recv(src, tag)?;
        self.wait(handle)
    }
}
