//! Bulk-set messages: batches of (key, timestamp, value) entries streamed
//! to a peer. Incoming entries go through the internal write path; when
//! the sender asked for acknowledgement, every accepted entry is collected
//! into a bulk-set-ack aimed back at it.

use std::io::Write;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread;

use byteorder::{BigEndian, ByteOrder};
use crossbeam_channel::{bounded, Receiver, Sender};

use crate::constants::{BULK_SET_MSG_ENTRY_OVERHEAD, BULK_SET_MSG_HEADER_SIZE};
use crate::core::key::StoreKey;
use crate::core::store::internal::StoreCore;
use crate::replication::{discard, worker_loop};
use crate::replication::bulk_set_ack::{BulkSetAckMsg, BulkSetAckState};
use crate::ring::Msg;
use crate::stats::Statistics;

pub(crate) struct BulkSetMsg<K: StoreKey> {
    header: [u8; BULK_SET_MSG_HEADER_SIZE],
    body: Vec<u8>,
    cap: usize,
    free_tx: Sender<BulkSetMsg<K>>,
    _key: PhantomData<K>,
}

impl<K: StoreKey> BulkSetMsg<K> {
    pub fn ack_node_id(&self) -> u64 {
        BigEndian::read_u64(&self.header)
    }

    pub fn set_ack_node_id(&mut self, node_id: u64) {
        BigEndian::write_u64(&mut self.header, node_id);
    }

    /// Append an entry: key, timestamp:8, length:4, value. Refused when it
    /// would push the message past its cap.
    pub fn add(&mut self, key: &K, timestamp_bits: u64, value: &[u8]) -> bool {
        let entry_len = K::ENCODED_LEN + BULK_SET_MSG_ENTRY_OVERHEAD + value.len();
        if BULK_SET_MSG_HEADER_SIZE + self.body.len() + entry_len > self.cap {
            return false;
        }
        let start = self.body.len();
        self.body.resize(start + K::ENCODED_LEN + BULK_SET_MSG_ENTRY_OVERHEAD, 0);
        let entry = &mut self.body[start..];
        key.write_to(&mut entry[..K::ENCODED_LEN]);
        BigEndian::write_u64(&mut entry[K::ENCODED_LEN..K::ENCODED_LEN + 8], timestamp_bits);
        BigEndian::write_u32(
            &mut entry[K::ENCODED_LEN + 8..K::ENCODED_LEN + 12],
            value.len() as u32,
        );
        self.body.extend_from_slice(value);
        true
    }

    pub fn has_entries(&self) -> bool {
        !self.body.is_empty()
    }
}

impl<K: StoreKey> Msg for BulkSetMsg<K> {
    fn msg_type(&self) -> u64 {
        K::BULK_SET_MSG_TYPE
    }

    fn msg_length(&self) -> u64 {
        (BULK_SET_MSG_HEADER_SIZE + self.body.len()) as u64
    }

    fn write_content(&self, w: &mut dyn Write) -> std::io::Result<u64> {
        w.write_all(&self.header)?;
        w.write_all(&self.body)?;
        Ok((self.header.len() + self.body.len()) as u64)
    }

    fn done(mut self: Box<Self>) {
        self.header = [0u8; BULK_SET_MSG_HEADER_SIZE];
        self.body.clear();
        let free_tx = self.free_tx.clone();
        let _ = free_tx.send(*self);
    }
}

pub(crate) struct BulkSetState<K: StoreKey> {
    core: Arc<StoreCore<K>>,
    ack: Arc<BulkSetAckState<K>>,
    out_free_rx: Receiver<BulkSetMsg<K>>,
}

impl<K: StoreKey> BulkSetState<K> {
    pub fn launch(core: Arc<StoreCore<K>>, ack: Arc<BulkSetAckState<K>>) -> Arc<Self> {
        let cfg = &core.cfg;
        let msg_ring = core
            .msg_ring()
            .expect("bulk-set launched without a msg ring")
            .clone();

        let (out_free_tx, out_free_rx) = bounded(cfg.out_bulk_set_msgs);
        for _ in 0..cfg.out_bulk_set_msgs {
            let _ = out_free_tx.send(BulkSetMsg {
                header: [0u8; BULK_SET_MSG_HEADER_SIZE],
                body: Vec::new(),
                cap: cfg.bulk_set_msg_cap,
                free_tx: out_free_tx.clone(),
                _key: PhantomData,
            });
        }

        let (in_free_tx, in_free_rx) = bounded(cfg.in_bulk_set_msgs);
        let (in_msg_tx, in_msg_rx) = bounded::<BulkSetMsg<K>>(cfg.in_bulk_set_msgs);
        for _ in 0..cfg.in_bulk_set_msgs {
            let _ = in_free_tx.send(BulkSetMsg {
                header: [0u8; BULK_SET_MSG_HEADER_SIZE],
                body: Vec::new(),
                cap: cfg.bulk_set_msg_cap,
                free_tx: in_free_tx.clone(),
                _key: PhantomData,
            });
        }

        let state = Arc::new(Self {
            core: core.clone(),
            ack,
            out_free_rx,
        });

        {
            let stats = core.stats.clone();
            let in_free_rx = in_free_rx.clone();
            let in_msg_tx = in_msg_tx.clone();
            let pool_wait = cfg.msg_timeout;
            msg_ring.set_msg_handler(
                K::BULK_SET_MSG_TYPE,
                Box::new(move |r, l| {
                    if l < BULK_SET_MSG_HEADER_SIZE as u64 {
                        discard(r, l)?;
                        Statistics::incr(&stats.in_bulk_set_invalids);
                        return Ok(l);
                    }
                    let mut msg = match in_free_rx.recv_timeout(pool_wait) {
                        Ok(msg) => msg,
                        Err(_) => {
                            discard(r, l)?;
                            Statistics::incr(&stats.in_bulk_set_drops);
                            return Ok(l);
                        }
                    };
                    if let Err(e) = r.read_exact(&mut msg.header) {
                        Box::new(msg).done();
                        Statistics::incr(&stats.in_bulk_set_invalids);
                        return Err(e);
                    }
                    msg.body.resize(l as usize - BULK_SET_MSG_HEADER_SIZE, 0);
                    if let Err(e) = r.read_exact(&mut msg.body) {
                        Box::new(msg).done();
                        Statistics::incr(&stats.in_bulk_set_invalids);
                        return Err(e);
                    }
                    Statistics::incr(&stats.in_bulk_sets);
                    if let Err(e) = in_msg_tx.try_send(msg) {
                        Box::new(e.into_inner()).done();
                        Statistics::incr(&stats.in_bulk_set_drops);
                    }
                    Ok(l)
                }),
            );
        }

        for i in 0..cfg.in_bulk_set_workers {
            let state = state.clone();
            let in_msg_rx = in_msg_rx.clone();
            let _ = thread::Builder::new()
                .name(format!("ember-inbulkset-{i}"))
                .spawn(move || {
                    let shutdown = state.core.shutdown.clone();
                    worker_loop(&shutdown, &in_msg_rx, |msg| state.in_bulk_set(msg));
                });
        }

        state
    }

    /// Pull a pooled outgoing message. The ack-node-id defaults to the
    /// local node so receivers know whom to acknowledge; senders expecting
    /// no ack overwrite it with zero.
    pub fn new_out_msg(&self) -> Option<BulkSetMsg<K>> {
        let mut msg = self.out_free_rx.recv().ok()?;
        msg.header = [0u8; BULK_SET_MSG_HEADER_SIZE];
        msg.body.clear();
        if let Some(ring) = self.core.msg_ring().and_then(|m| m.ring()) {
            msg.set_ack_node_id(ring.local_node_id());
        }
        Some(msg)
    }

    fn in_bulk_set(&self, msg: BulkSetMsg<K>) {
        let stats = &self.core.stats;
        let ring = self.core.msg_ring().and_then(|m| m.ring());
        let ack_node_id = msg.ack_node_id();
        let want_acks = ack_node_id != 0 && ring.is_some();
        let mut ack_msg: Option<BulkSetAckMsg<K>> = None;
        let entry_head = K::ENCODED_LEN + BULK_SET_MSG_ENTRY_OVERHEAD;
        let body = &msg.body;
        let mut i = 0;
        while i + entry_head <= body.len() {
            let key = K::read_from(&body[i..i + K::ENCODED_LEN]);
            let timestamp_bits =
                BigEndian::read_u64(&body[i + K::ENCODED_LEN..i + K::ENCODED_LEN + 8]);
            let length =
                BigEndian::read_u32(&body[i + K::ENCODED_LEN + 8..i + entry_head]) as usize;
            i += entry_head;
            if i + length > body.len() {
                Statistics::incr(&stats.in_bulk_set_invalids);
                break;
            }
            let value = bytes::Bytes::copy_from_slice(&body[i..i + length]);
            i += length;
            Statistics::incr(&stats.in_bulk_set_writes);
            match self.core.write_internal(&key, timestamp_bits, value) {
                Ok(prior) => {
                    if prior >= timestamp_bits {
                        Statistics::incr(&stats.in_bulk_set_writes_overridden);
                        continue;
                    }
                    if want_acks {
                        if ack_msg.is_none() {
                            ack_msg = self.ack.new_out_msg();
                        }
                        let Some(ack) = ack_msg.as_mut() else { continue };
                        if !ack.add(&key, timestamp_bits) {
                            if let Some(full) = ack_msg.take() {
                                self.send_ack(full, ack_node_id);
                            }
                            if let Some(mut fresh) = self.ack.new_out_msg() {
                                fresh.add(&key, timestamp_bits);
                                ack_msg = Some(fresh);
                            }
                        }
                    }
                }
                Err(_) => Statistics::incr(&stats.in_bulk_set_write_errors),
            }
        }
        if let Some(ack) = ack_msg.take() {
            if ack.has_entries() {
                self.send_ack(ack, ack_node_id);
            } else {
                Box::new(ack).done();
            }
        }
        Box::new(msg).done();
    }

    fn send_ack(&self, ack: BulkSetAckMsg<K>, node_id: u64) {
        if let Some(msg_ring) = self.core.msg_ring() {
            Statistics::incr(&self.core.stats.out_bulk_set_acks);
            msg_ring.msg_to_node(Box::new(ack), node_id, self.core.cfg.msg_timeout);
        }
    }
}
