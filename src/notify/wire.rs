use arrayref::array_ref;
use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use tracing::trace;

use super::cluster::{MessageTag, RefcountDelta, Transport, ValueType};
use super::effects::{NotifySet, RankNotify, RcChange, RefWrite};
use super::error::TransportError;
use super::scratch::{BlobBuilder, Region, Scratch};
use super::{ItemId, MAX_SUBSCRIPT_LEN, Rank};

/// Fixed notification record: id:i64, rank:u32, subscript index:i32.
pub const PACKED_NOTIF_BYTES: usize = 16;
/// Fixed reference record: id:i64, type:u8, read:i32, write:i32,
/// subscript index:i32, value index:i32.
pub const PACKED_REF_BYTES: usize = 25;
/// Fixed refcount-delta record: id:i64, read:i32, write:i32, preacquire:u8.
pub const PACKED_RC_BYTES: usize = 17;
/// Counts header: five u32 fields.
pub const COUNTS_BYTES: usize = 20;

/// Out-of-band counts header describing one packed batch. Travels inside the
/// normal request/response exchange ahead of the batch sections.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchCounts {
    pub notify: u32,
    pub references: u32,
    pub rc_changes: u32,
    pub extra_count: u32,
    pub extra_bytes: u32,
}

impl BatchCounts {
    pub fn is_empty(&self) -> bool {
        self.notify == 0 && self.references == 0 && self.rc_changes == 0
    }

    pub fn encode(&self) -> [u8; COUNTS_BYTES] {
        let mut buf = [0u8; COUNTS_BYTES];
        LittleEndian::write_u32(&mut buf[0..4], self.notify);
        LittleEndian::write_u32(&mut buf[4..8], self.references);
        LittleEndian::write_u32(&mut buf[8..12], self.rc_changes);
        LittleEndian::write_u32(&mut buf[12..16], self.extra_count);
        LittleEndian::write_u32(&mut buf[16..20], self.extra_bytes);
        buf
    }

    pub fn decode(buf: &[u8; COUNTS_BYTES]) -> Self {
        Self {
            notify: LittleEndian::read_u32(&buf[0..4]),
            references: LittleEndian::read_u32(&buf[4..8]),
            rc_changes: LittleEndian::read_u32(&buf[8..12]),
            extra_count: LittleEndian::read_u32(&buf[12..16]),
            extra_bytes: LittleEndian::read_u32(&buf[16..20]),
        }
    }
}

/// A batch laid out and ready to ship: the shared extra-data blob plus the
/// three fixed-record sections, each backed by scratch or heap.
#[derive(Debug)]
pub struct PreparedBatch<'a> {
    extra: Region<'a>,
    extra_len: usize,
    notifs: Region<'a>,
    refs: Region<'a>,
    rc: Region<'a>,
}

/// Packs every entry of `set` into a transmittable batch. Fixed-size record
/// sections are sized up front; subscripts and values go into the shared
/// blob exactly once, with an entry that is pointer-and-length identical to
/// the previous entry's payload collapsed to a back-reference index. `-1`
/// in a record's variable field means "absent".
pub fn pack_into<'a>(set: &NotifySet, scratch: &mut Scratch<'a>) -> (BatchCounts, PreparedBatch<'a>) {
    let notify_count = set.notify.len();
    let refs_count = set.references.len();
    let rc_count = set.rc_changes.len();

    let mut notifs = scratch.alloc(notify_count * PACKED_NOTIF_BYTES);
    let mut refs = scratch.alloc(refs_count * PACKED_REF_BYTES);
    let mut rc = scratch.alloc(rc_count * PACKED_RC_BYTES);
    let mut blob = BlobBuilder::new(scratch.take_rest());

    let mut extra_count: i32 = 0;

    // "No previous entry" is an explicit state here, not a sentinel index:
    // (payload ptr, payload len, blob index) of the last appended bytes.
    let mut last_subscript: Option<(usize, usize, i32)> = None;

    let out = notifs.as_mut_slice();
    for (i, entry) in set.notify.iter().enumerate() {
        let rec = &mut out[i * PACKED_NOTIF_BYTES..(i + 1) * PACKED_NOTIF_BYTES];
        LittleEndian::write_i64(&mut rec[0..8], entry.id);
        LittleEndian::write_u32(&mut rec[8..12], entry.rank);
        let sub_ix = match &entry.subscript {
            None => -1,
            Some(sub) => {
                assert!(sub.len() <= MAX_SUBSCRIPT_LEN, "subscript exceeds encodable length");
                let key = (sub.as_ptr() as usize, sub.len());
                match last_subscript {
                    Some((ptr, len, ix)) if (ptr, len) == key => ix,
                    _ => {
                        let ix = extra_count;
                        blob.append(sub);
                        last_subscript = Some((key.0, key.1, ix));
                        extra_count += 1;
                        ix
                    }
                }
            }
        };
        LittleEndian::write_i32(&mut rec[12..16], sub_ix);
    }

    let mut last_value: Option<(usize, usize, i32)> = None;

    let out = refs.as_mut_slice();
    for (i, entry) in set.references.iter().enumerate() {
        let rec = &mut out[i * PACKED_REF_BYTES..(i + 1) * PACKED_REF_BYTES];
        LittleEndian::write_i64(&mut rec[0..8], entry.id);
        rec[8] = entry.vtype.into();
        LittleEndian::write_i32(&mut rec[9..13], entry.transfer.read);
        LittleEndian::write_i32(&mut rec[13..17], entry.transfer.write);

        let sub_ix = match &entry.subscript {
            None => -1,
            Some(sub) => {
                assert!(sub.len() <= MAX_SUBSCRIPT_LEN, "subscript exceeds encodable length");
                let ix = extra_count;
                blob.append(sub);
                extra_count += 1;
                ix
            }
        };
        LittleEndian::write_i32(&mut rec[17..21], sub_ix);

        let key = (entry.value.as_ptr() as usize, entry.value.len());
        let val_ix = match last_value {
            Some((ptr, len, ix)) if (ptr, len) == key => ix,
            _ => {
                let ix = extra_count;
                blob.append(&entry.value);
                last_value = Some((key.0, key.1, ix));
                extra_count += 1;
                ix
            }
        };
        LittleEndian::write_i32(&mut rec[21..25], val_ix);
    }

    let out = rc.as_mut_slice();
    for (i, change) in set.rc_changes.iter().enumerate() {
        let rec = &mut out[i * PACKED_RC_BYTES..(i + 1) * PACKED_RC_BYTES];
        LittleEndian::write_i64(&mut rec[0..8], change.id);
        LittleEndian::write_i32(&mut rec[8..12], change.delta.read);
        LittleEndian::write_i32(&mut rec[12..16], change.delta.write);
        rec[16] = change.must_preacquire as u8;
    }

    let (extra, extra_len) = blob.finish();
    let counts = BatchCounts {
        notify: notify_count as u32,
        references: refs_count as u32,
        rc_changes: rc_count as u32,
        extra_count: extra_count as u32,
        extra_bytes: extra_len as u32,
    };
    trace!(
        notify = counts.notify,
        references = counts.references,
        rc_changes = counts.rc_changes,
        extra_bytes = counts.extra_bytes,
        "packed notification batch"
    );
    let batch = PreparedBatch {
        extra,
        extra_len,
        notifs,
        refs,
        rc,
    };
    (counts, batch)
}

/// Ships a prepared batch to `dest` in layout order: extra-data blob first,
/// then the notification, reference, and refcount-delta record sections.
/// Empty sections are not sent at all.
pub fn send_batch<T: Transport>(
    transport: &mut T,
    dest: Rank,
    counts: &BatchCounts,
    batch: &PreparedBatch<'_>,
) -> Result<(), TransportError> {
    if counts.extra_bytes > 0 {
        trace!(count = counts.extra_count, bytes = counts.extra_bytes, "sending extra data");
        transport.send(
            dest,
            MessageTag::ResponseNotif,
            &batch.extra.as_slice()[..batch.extra_len],
        )?;
    }
    if counts.notify > 0 {
        trace!(count = counts.notify, "sending notification records");
        transport.send(dest, MessageTag::ResponseNotif, batch.notifs.as_slice())?;
    }
    if counts.references > 0 {
        trace!(count = counts.references, "sending reference records");
        transport.send(dest, MessageTag::ResponseNotif, batch.refs.as_slice())?;
    }
    if counts.rc_changes > 0 {
        trace!(count = counts.rc_changes, "sending refcount records");
        transport.send(dest, MessageTag::ResponseNotif, batch.rc.as_slice())?;
    }
    Ok(())
}

fn blob_entry(ix: i32, extra: &[Bytes]) -> Option<Bytes> {
    if ix < 0 {
        return None;
    }
    let ix = ix as usize;
    assert!(ix < extra.len(), "blob index out of range");
    Some(extra[ix].clone())
}

/// Receives a batch described by `counts` from `src` and reconstructs its
/// entries into `set`. The blob arrives first and is scanned once into an
/// index table of `Bytes` slices; every record's variable field resolves
/// through that table, so entry payloads alias the received allocation and
/// keep it alive. Refcount deltas go through insert-with-merge.
pub fn recv_batch<T: Transport>(
    transport: &mut T,
    src: Rank,
    counts: &BatchCounts,
    set: &mut NotifySet,
) -> Result<(), TransportError> {
    let mut extra: Vec<Bytes> = Vec::with_capacity(counts.extra_count as usize);
    if counts.extra_bytes > 0 {
        trace!(count = counts.extra_count, bytes = counts.extra_bytes, "receiving extra data");
        let blob = transport.recv(src, MessageTag::ResponseNotif)?;
        assert_eq!(blob.len(), counts.extra_bytes as usize, "extra data size mismatch");
        let mut pos = 0usize;
        for _ in 0..counts.extra_count {
            let len = LittleEndian::read_u32(&blob[pos..pos + 4]) as usize;
            pos += 4;
            extra.push(blob.slice(pos..pos + len));
            pos += len;
        }
        // The whole blob must be consumed exactly.
        assert_eq!(pos, blob.len(), "trailing bytes in extra data blob");
    }

    if counts.notify > 0 {
        trace!(count = counts.notify, "receiving notification records");
        set.notify.reserve_for(counts.notify as usize);
        let buf = transport.recv(src, MessageTag::ResponseNotif)?;
        assert_eq!(buf.len(), counts.notify as usize * PACKED_NOTIF_BYTES);
        for chunk in buf.chunks_exact(PACKED_NOTIF_BYTES) {
            let rec = array_ref![chunk, 0, PACKED_NOTIF_BYTES];
            let sub_ix = LittleEndian::read_i32(&rec[12..16]);
            set.notify.push(RankNotify {
                id: LittleEndian::read_i64(&rec[0..8]),
                rank: LittleEndian::read_u32(&rec[8..12]),
                subscript: blob_entry(sub_ix, &extra),
            });
        }
    }

    if counts.references > 0 {
        trace!(count = counts.references, "receiving reference records");
        set.references.reserve_for(counts.references as usize);
        let buf = transport.recv(src, MessageTag::ResponseNotif)?;
        assert_eq!(buf.len(), counts.references as usize * PACKED_REF_BYTES);
        for chunk in buf.chunks_exact(PACKED_REF_BYTES) {
            let rec = array_ref![chunk, 0, PACKED_REF_BYTES];
            let vtype = ValueType::try_from(rec[8]).expect("unknown value type tag");
            let sub_ix = LittleEndian::read_i32(&rec[17..21]);
            let val_ix = LittleEndian::read_i32(&rec[21..25]);
            let value = blob_entry(val_ix, &extra).expect("reference record without a value");
            set.references.push(RefWrite {
                id: LittleEndian::read_i64(&rec[0..8]),
                subscript: blob_entry(sub_ix, &extra),
                value,
                vtype,
                transfer: RefcountDelta::new(
                    LittleEndian::read_i32(&rec[9..13]),
                    LittleEndian::read_i32(&rec[13..17]),
                ),
            });
        }
    }

    if counts.rc_changes > 0 {
        trace!(count = counts.rc_changes, "receiving refcount records");
        set.rc_changes.reserve_for(counts.rc_changes as usize);
        let buf = transport.recv(src, MessageTag::ResponseNotif)?;
        assert_eq!(buf.len(), counts.rc_changes as usize * PACKED_RC_BYTES);
        for chunk in buf.chunks_exact(PACKED_RC_BYTES) {
            let rec = array_ref![chunk, 0, PACKED_RC_BYTES];
            set.rc_changes.insert(RcChange {
                id: LittleEndian::read_i64(&rec[0..8]),
                delta: RefcountDelta::new(
                    LittleEndian::read_i32(&rec[8..12]),
                    LittleEndian::read_i32(&rec[12..16]),
                ),
                must_preacquire: rec[16] != 0,
            });
        }
    }

    trace!("batch received");
    Ok(())
}

/// Encodes a single-item remote notify request: id, subscript length, then
/// the subscript bytes. The reply is a single i32 code (0 = accepted).
pub fn encode_notify_request(id: ItemId, subscript: Option<&[u8]>) -> Vec<u8> {
    let sub_len = subscript.map_or(0, <[u8]>::len);
    assert!(sub_len <= MAX_SUBSCRIPT_LEN, "subscript exceeds encodable length");
    let mut buf = Vec::with_capacity(12 + sub_len);
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(&(sub_len as u32).to_le_bytes());
    if let Some(sub) = subscript {
        buf.extend_from_slice(sub);
    }
    buf
}

/// Inverse of [`encode_notify_request`], for the server side of the
/// exchange. The subscript aliases the received buffer.
pub fn decode_notify_request(buf: &Bytes) -> (ItemId, Option<Bytes>) {
    let id = LittleEndian::read_i64(&buf[0..8]);
    let sub_len = LittleEndian::read_u32(&buf[8..12]) as usize;
    assert_eq!(buf.len(), 12 + sub_len, "notify request size mismatch");
    let subscript = if sub_len == 0 {
        None
    } else {
        Some(buf.slice(12..12 + sub_len))
    };
    (id, subscript)
}
