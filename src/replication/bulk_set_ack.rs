//! Bulk-set-ack messages: confirmations that pushed entries are durable on
//! a responsible node. Receiving an ack for a key this node is *not*
//! responsible for marks the local copy for removal, without creating a
//! cluster-visible tombstone.

use std::io::Write;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread;

use byteorder::{BigEndian, ByteOrder};
use crossbeam_channel::{bounded, Receiver, Sender};

use crate::constants::TSB_LOCAL_REMOVAL;
use crate::core::key::StoreKey;
use crate::core::store::internal::StoreCore;
use crate::replication::{discard, partition_of, worker_loop};
use crate::ring::Msg;
use crate::stats::Statistics;

pub(crate) struct BulkSetAckMsg<K: StoreKey> {
    body: Vec<u8>,
    cap: usize,
    free_tx: Sender<BulkSetAckMsg<K>>,
    _key: PhantomData<K>,
}

impl<K: StoreKey> BulkSetAckMsg<K> {
    const ENTRY_LEN: usize = K::ENCODED_LEN + 8;

    /// Append one (key, timestamp) entry; refused when the message cap
    /// would be exceeded.
    pub fn add(&mut self, key: &K, timestamp_bits: u64) -> bool {
        if self.body.len() + Self::ENTRY_LEN > self.cap {
            return false;
        }
        let start = self.body.len();
        self.body.resize(start + Self::ENTRY_LEN, 0);
        let entry = &mut self.body[start..];
        key.write_to(&mut entry[..K::ENCODED_LEN]);
        BigEndian::write_u64(&mut entry[K::ENCODED_LEN..K::ENCODED_LEN + 8], timestamp_bits);
        true
    }

    pub fn has_entries(&self) -> bool {
        !self.body.is_empty()
    }
}

impl<K: StoreKey> Msg for BulkSetAckMsg<K> {
    fn msg_type(&self) -> u64 {
        K::BULK_SET_ACK_MSG_TYPE
    }

    fn msg_length(&self) -> u64 {
        self.body.len() as u64
    }

    fn write_content(&self, w: &mut dyn Write) -> std::io::Result<u64> {
        w.write_all(&self.body)?;
        Ok(self.body.len() as u64)
    }

    fn done(mut self: Box<Self>) {
        self.body.clear();
        let free_tx = self.free_tx.clone();
        let _ = free_tx.send(*self);
    }
}

pub(crate) struct BulkSetAckState<K: StoreKey> {
    core: Arc<StoreCore<K>>,
    out_free_rx: Receiver<BulkSetAckMsg<K>>,
}

impl<K: StoreKey> BulkSetAckState<K> {
    pub fn launch(core: Arc<StoreCore<K>>) -> Arc<Self> {
        let cfg = &core.cfg;
        let msg_ring = core
            .msg_ring()
            .expect("bulk-set-ack launched without a msg ring")
            .clone();

        let (out_free_tx, out_free_rx) = bounded(cfg.out_bulk_set_ack_msgs);
        for _ in 0..cfg.out_bulk_set_ack_msgs {
            let _ = out_free_tx.send(BulkSetAckMsg {
                body: Vec::new(),
                cap: cfg.bulk_set_ack_msg_cap,
                free_tx: out_free_tx.clone(),
                _key: PhantomData,
            });
        }

        let (in_free_tx, in_free_rx) = bounded(cfg.in_bulk_set_ack_msgs);
        let (in_msg_tx, in_msg_rx) = bounded::<BulkSetAckMsg<K>>(cfg.in_bulk_set_ack_msgs);
        for _ in 0..cfg.in_bulk_set_ack_msgs {
            let _ = in_free_tx.send(BulkSetAckMsg {
                body: Vec::new(),
                cap: cfg.bulk_set_ack_msg_cap,
                free_tx: in_free_tx.clone(),
                _key: PhantomData,
            });
        }

        let state = Arc::new(Self {
            core: core.clone(),
            out_free_rx,
        });

        {
            let stats = core.stats.clone();
            let in_free_rx = in_free_rx.clone();
            let in_msg_tx = in_msg_tx.clone();
            let pool_wait = cfg.msg_timeout;
            msg_ring.set_msg_handler(
                K::BULK_SET_ACK_MSG_TYPE,
                Box::new(move |r, l| {
                    let mut msg = match in_free_rx.recv_timeout(pool_wait) {
                        Ok(msg) => msg,
                        Err(_) => {
                            discard(r, l)?;
                            Statistics::incr(&stats.in_bulk_set_ack_drops);
                            return Ok(l);
                        }
                    };
                    msg.body.resize(l as usize, 0);
                    if let Err(e) = r.read_exact(&mut msg.body) {
                        Box::new(msg).done();
                        Statistics::incr(&stats.in_bulk_set_ack_invalids);
                        return Err(e);
                    }
                    Statistics::incr(&stats.in_bulk_set_acks);
                    if let Err(e) = in_msg_tx.try_send(msg) {
                        Box::new(e.into_inner()).done();
                        Statistics::incr(&stats.in_bulk_set_ack_drops);
                    }
                    Ok(l)
                }),
            );
        }

        for i in 0..cfg.in_bulk_set_ack_workers {
            let state = state.clone();
            let in_msg_rx = in_msg_rx.clone();
            let _ = thread::Builder::new()
                .name(format!("ember-inbulksetack-{i}"))
                .spawn(move || {
                    let shutdown = state.core.shutdown.clone();
                    worker_loop(&shutdown, &in_msg_rx, |msg| state.in_bulk_set_ack(msg));
                });
        }

        state
    }

    /// Pull a pooled outgoing ack message; blocks when the pool is empty.
    pub fn new_out_msg(&self) -> Option<BulkSetAckMsg<K>> {
        self.out_free_rx.recv().ok().map(|mut msg| {
            msg.body.clear();
            msg
        })
    }

    fn in_bulk_set_ack(&self, msg: BulkSetAckMsg<K>) {
        let entry_len = BulkSetAckMsg::<K>::ENTRY_LEN;
        let Some(ring) = self.core.msg_ring().and_then(|m| m.ring()) else {
            // Without a ring there is no way to know what this node is
            // responsible for; keep everything.
            Box::new(msg).done();
            return;
        };
        let partition_bit_count = ring.partition_bit_count();
        for entry in msg.body.chunks_exact(entry_len) {
            let key = K::read_from(&entry[..K::ENCODED_LEN]);
            let timestamp_bits = BigEndian::read_u64(&entry[K::ENCODED_LEN..K::ENCODED_LEN + 8]);
            let partition = partition_of(key.key_a(), partition_bit_count);
            if ring.responsible(partition) {
                continue;
            }
            let removal_bits = timestamp_bits | TSB_LOCAL_REMOVAL;
            Statistics::incr(&self.core.stats.in_bulk_set_ack_writes);
            match self.core.write_internal(&key, removal_bits, bytes::Bytes::new()) {
                Ok(prior) => {
                    if prior >= removal_bits {
                        Statistics::incr(&self.core.stats.in_bulk_set_ack_writes_overridden);
                    }
                }
                Err(_) => Statistics::incr(&self.core.stats.in_bulk_set_ack_write_errors),
            }
        }
        Box::new(msg).done();
    }
}
