//! Pull replication.
//!
//! Outgoing: on a jittered interval, each owned partition is carved into
//! per-worker sub-ranges, each summarized into a salted bloom filter and
//! sent to the partition's other replicas. A sub-range holding more than
//! `bloom_n` entries is covered by several messages, each spanning the
//! keys its scan actually visited.
//!
//! Incoming: a received summary is answered with a bulk-set of local
//! entries missing from it, the scan staggered by this node's replica
//! index so concurrent responders send different data first. The response
//! carries ack-node-id 0: if it is lost, the next pass retries.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use byteorder::{BigEndian, ByteOrder};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::constants::{
    BLOOM_FILTER_HEADER_SIZE, BULK_SET_MSG_ENTRY_OVERHEAD, PULL_REPLICATION_MSG_HEADER_SIZE,
    TSB_DELETION, TSB_LOCAL_REMOVAL,
};
use crate::core::background::{launcher_loop, BgNotification};
use crate::core::key::StoreKey;
use crate::core::store::internal::StoreCore;
use crate::core::timestamp;
use crate::replication::bloom::KtBloomFilter;
use crate::replication::bulk_set::BulkSetState;
use crate::replication::{discard, partition_of, worker_loop};
use crate::ring::{Msg, Ring};
use crate::stats::Statistics;

const FULL_HEADER_SIZE: usize = PULL_REPLICATION_MSG_HEADER_SIZE + BLOOM_FILTER_HEADER_SIZE;

/// The key_a range `[start, stop]` covered by a partition.
fn partition_range(p: u64, partition_bit_count: u16) -> (u64, u64) {
    if partition_bit_count == 0 {
        return (0, u64::MAX);
    }
    let shift = 64 - u32::from(partition_bit_count).min(32);
    let start = p << shift;
    let partition_count = 1u64 << u32::from(partition_bit_count).min(32);
    let stop = if p + 1 == partition_count {
        u64::MAX
    } else {
        ((p + 1) << shift) - 1
    };
    (start, stop)
}

pub(crate) struct PullReplicationMsg {
    msg_type: u64,
    header: Vec<u8>,
    body: Vec<u8>,
    free_tx: Sender<PullReplicationMsg>,
}

impl PullReplicationMsg {
    fn node_id(&self) -> u64 {
        BigEndian::read_u64(&self.header[0..8])
    }

    fn cutoff(&self) -> u64 {
        BigEndian::read_u64(&self.header[20..28])
    }

    fn range_start(&self) -> u64 {
        BigEndian::read_u64(&self.header[28..36])
    }

    fn range_stop(&self) -> u64 {
        BigEndian::read_u64(&self.header[36..44])
    }
}

impl Msg for PullReplicationMsg {
    fn msg_type(&self) -> u64 {
        self.msg_type
    }

    fn msg_length(&self) -> u64 {
        (self.header.len() + self.body.len()) as u64
    }

    fn write_content(&self, w: &mut dyn Write) -> std::io::Result<u64> {
        w.write_all(&self.header)?;
        w.write_all(&self.body)?;
        Ok((self.header.len() + self.body.len()) as u64)
    }

    fn done(self: Box<Self>) {
        let free_tx = self.free_tx.clone();
        let _ = free_tx.send(*self);
    }
}

pub(crate) struct PullState<K: StoreKey> {
    core: Arc<StoreCore<K>>,
    bulk_set: Arc<BulkSetState<K>>,
    pub out_notify_tx: Sender<BgNotification>,
    pub out_abort: Arc<AtomicBool>,
    out_iteration: AtomicU32,
    out_free_rx: Receiver<PullReplicationMsg>,
    blooms: Mutex<Vec<KtBloomFilter>>,
}

impl<K: StoreKey> PullState<K> {
    pub fn launch(core: Arc<StoreCore<K>>, bulk_set: Arc<BulkSetState<K>>) -> Arc<Self> {
        let cfg = &core.cfg;
        let msg_ring = core
            .msg_ring()
            .expect("pull replication launched without a msg ring")
            .clone();

        let (out_free_tx, out_free_rx) = bounded(cfg.out_pull_replication_msgs);
        for _ in 0..cfg.out_pull_replication_msgs {
            let _ = out_free_tx.send(PullReplicationMsg {
                msg_type: K::PULL_REPLICATION_MSG_TYPE,
                header: vec![0u8; FULL_HEADER_SIZE],
                body: Vec::new(),
                free_tx: out_free_tx.clone(),
            });
        }
        let (in_free_tx, in_free_rx) = bounded(cfg.in_pull_replication_msgs);
        let (in_msg_tx, in_msg_rx) = bounded::<PullReplicationMsg>(cfg.in_pull_replication_msgs);
        for _ in 0..cfg.in_pull_replication_msgs {
            let _ = in_free_tx.send(PullReplicationMsg {
                msg_type: K::PULL_REPLICATION_MSG_TYPE,
                header: vec![0u8; FULL_HEADER_SIZE],
                body: Vec::new(),
                free_tx: in_free_tx.clone(),
            });
        }

        let (out_notify_tx, out_notify_rx) = bounded(1);
        let out_abort = Arc::new(AtomicBool::new(false));
        let state = Arc::new(Self {
            core: core.clone(),
            bulk_set,
            out_notify_tx,
            out_abort: out_abort.clone(),
            out_iteration: AtomicU32::new(rand::random::<u16>() as u32),
            out_free_rx,
            blooms: Mutex::new(Vec::new()),
        });

        {
            let stats = core.stats.clone();
            msg_ring.set_msg_handler(
                K::PULL_REPLICATION_MSG_TYPE,
                Box::new(move |r, l| {
                    if l < FULL_HEADER_SIZE as u64 {
                        discard(r, l)?;
                        Statistics::incr(&stats.in_pull_replication_invalids);
                        return Ok(l);
                    }
                    // A partial summary drops a chunk of the bitfield and
                    // is useless, so there is no pool-wait here; a full
                    // pool just sheds the message.
                    let mut msg = match in_free_rx.try_recv() {
                        Ok(msg) => msg,
                        Err(_) => {
                            discard(r, l)?;
                            Statistics::incr(&stats.in_pull_replication_drops);
                            return Ok(l);
                        }
                    };
                    if let Err(e) = r.read_exact(&mut msg.header) {
                        Box::new(msg).done();
                        Statistics::incr(&stats.in_pull_replication_invalids);
                        return Err(e);
                    }
                    msg.body.resize(l as usize - FULL_HEADER_SIZE, 0);
                    if let Err(e) = r.read_exact(&mut msg.body) {
                        Box::new(msg).done();
                        Statistics::incr(&stats.in_pull_replication_invalids);
                        return Err(e);
                    }
                    Statistics::incr(&stats.in_pull_replications);
                    if let Err(e) = in_msg_tx.try_send(msg) {
                        Box::new(e.into_inner()).done();
                        Statistics::incr(&stats.in_pull_replication_drops);
                    }
                    Ok(l)
                }),
            );
        }

        for i in 0..cfg.in_pull_replication_workers {
            let state = state.clone();
            let in_msg_rx = in_msg_rx.clone();
            let _ = thread::Builder::new()
                .name(format!("ember-inpullrepl-{i}"))
                .spawn(move || {
                    let shutdown = state.core.shutdown.clone();
                    worker_loop(&shutdown, &in_msg_rx, |msg| state.in_pull_replication(msg));
                });
        }

        {
            let state = state.clone();
            let shutdown = core.shutdown.clone();
            let interval = cfg.out_pull_replication_interval;
            let _ = thread::Builder::new()
                .name("ember-outpullrepl".to_string())
                .spawn(move || {
                    let abort = state.out_abort.clone();
                    launcher_loop(shutdown, out_notify_rx, interval, abort, || {
                        state.out_pass();
                    });
                });
        }

        state
    }

    /// Answer one received summary with the entries it is missing.
    fn in_pull_replication(&self, msg: PullReplicationMsg) {
        let core = &self.core;
        let Some(msg_ring) = core.msg_ring() else {
            Box::new(msg).done();
            return;
        };
        let Some(ring) = msg_ring.ring() else {
            Box::new(msg).done();
            return;
        };
        let filter = match KtBloomFilter::from_parts(
            &msg.header[PULL_REPLICATION_MSG_HEADER_SIZE..],
            &msg.body,
        ) {
            Ok(filter) => filter,
            Err(_) => {
                Statistics::incr(&core.stats.in_pull_replication_invalids);
                Box::new(msg).done();
                return;
            }
        };
        // The remote computed this cutoff from its own ignore-recent
        // setting; use the same one for the response scan.
        let cutoff = msg.cutoff();
        let range_start = msg.range_start();
        let range_stop = msg.range_stop();
        let node_id = msg.node_id();
        Box::new(msg).done();

        let tombstone_cutoff =
            timestamp::now_bits().saturating_sub(core.cfg.tombstone_age_bits());
        let budget = std::cell::Cell::new(core.cfg.bulk_set_msg_cap as i64);
        let mut missing: Vec<K> = Vec::new();
        let mut cb = |key: &K, timestamp_bits: u64, length: u32| {
            if timestamp_bits & TSB_DELETION == 0 || timestamp_bits >= tombstone_cutoff {
                if !filter.may_have(key, timestamp_bits) {
                    missing.push(*key);
                    budget.set(
                        budget.get()
                            - ((K::ENCODED_LEN + BULK_SET_MSG_ENTRY_OVERHEAD) as i64
                                + length as i64),
                    );
                    if budget.get() <= 0 {
                        return false;
                    }
                }
            }
            true
        };
        // Stagger the scan start by this node's replica position so the
        // puller doesn't get identical responses from every replica.
        let partition = partition_of(range_start, ring.partition_bit_count());
        let replica_index = ring.responsible_replica(partition).unwrap_or(0) as u64;
        let replica_count = ring.replica_count().max(1) as u64;
        let scan_start = range_start + (range_stop - range_start) / replica_count * replica_index;
        core.locmap.scan_callback(
            scan_start,
            range_stop,
            0,
            TSB_LOCAL_REMOVAL,
            cutoff,
            u64::MAX,
            &mut cb,
        );
        if budget.get() > 0 && scan_start > range_start {
            core.locmap.scan_callback(
                range_start,
                scan_start - 1,
                0,
                TSB_LOCAL_REMOVAL,
                cutoff,
                u64::MAX,
                &mut cb,
            );
        }
        if missing.is_empty() {
            return;
        }
        let Some(mut bsm) = self.bulk_set.new_out_msg() else {
            return;
        };
        // No ack expected: a lost response is retried by the next pass.
        bsm.set_ack_node_id(0);
        let mut value = Vec::new();
        for key in &missing {
            value.clear();
            match core.read_raw(key, &mut value) {
                Ok((0, _)) => continue,
                Ok((bits, has_value)) => {
                    if bits & TSB_LOCAL_REMOVAL != 0 {
                        continue;
                    }
                    if !has_value && bits & TSB_DELETION == 0 {
                        continue;
                    }
                    let payload: &[u8] = if has_value { &value } else { &[] };
                    if !bsm.add(key, bits, payload) {
                        break;
                    }
                    Statistics::incr(&core.stats.out_bulk_set_values);
                }
                Err(_) => continue,
            }
        }
        if bsm.has_entries() {
            Statistics::incr(&core.stats.out_bulk_sets);
            msg_ring.msg_to_node(Box::new(bsm), node_id, core.cfg.msg_timeout);
        } else {
            Box::new(bsm).done();
        }
    }

    /// One full outgoing pass over every owned partition.
    fn out_pass(&self) {
        let core = &self.core;
        let Some(msg_ring) = core.msg_ring() else { return };
        let Some(ring) = msg_ring.ring() else { return };
        let partition_bit_count = ring.partition_bit_count();
        let partition_count: u64 = 1 << u32::from(partition_bit_count).min(32);
        let ring_version = ring.version();
        let iteration = self.out_iteration.fetch_add(1, Ordering::Relaxed) as u16;
        let cutoff =
            timestamp::now_bits().saturating_sub(core.cfg.replication_ignore_recent_bits());
        let workers = core.cfg.out_pull_replication_workers.max(1) as u64;
        let begin = Instant::now();
        thread::scope(|scope| {
            for w in 0..workers {
                let ring = ring.clone();
                scope.spawn(move || {
                    let mut filter = self
                        .blooms
                        .lock()
                        .pop()
                        .unwrap_or_else(|| {
                            KtBloomFilter::new(core.cfg.bloom_n, core.cfg.bloom_p, iteration)
                        });
                    let first = partition_count / workers * w;
                    for p in (first..partition_count).chain(0..first) {
                        if self.out_abort.load(Ordering::Acquire) {
                            break;
                        }
                        match msg_ring.ring() {
                            Some(current) if current.version() == ring_version => {}
                            _ => break,
                        }
                        if ring.responsible(p as u32) {
                            self.out_pass_range(
                                p,
                                w,
                                workers,
                                partition_bit_count,
                                iteration,
                                ring_version,
                                cutoff,
                                ring.as_ref(),
                                &mut filter,
                            );
                        }
                    }
                    self.blooms.lock().push(filter);
                });
            }
        });
        debug!(
            elapsed_ms = begin.elapsed().as_millis() as u64,
            "out pull replication pass"
        );
    }

    /// Summarize worker `w`'s sub-range of partition `p`, one message per
    /// `bloom_n` entries scanned.
    #[allow(clippy::too_many_arguments)]
    fn out_pass_range(
        &self,
        p: u64,
        w: u64,
        workers: u64,
        partition_bit_count: u16,
        iteration: u16,
        ring_version: i64,
        cutoff: u64,
        ring: &dyn Ring,
        filter: &mut KtBloomFilter,
    ) {
        let core = &self.core;
        let Some(msg_ring) = core.msg_ring() else { return };
        let (partition_start, partition_stop) = partition_range(p, partition_bit_count);
        let span = partition_stop - partition_start;
        let mut range_begin = partition_start + span / workers * w;
        let range_end = if w + 1 == workers {
            partition_stop
        } else {
            partition_start + span / workers * (w + 1) - 1
        };
        loop {
            let covered_from = range_begin;
            filter.reset(iteration);
            let (resume, more) = core.locmap.scan_callback(
                range_begin,
                range_end,
                0,
                TSB_LOCAL_REMOVAL,
                cutoff,
                core.cfg.bloom_n,
                &mut |key: &K, timestamp_bits, _length| {
                    filter.add(key, timestamp_bits);
                    true
                },
            );
            if self.out_abort.load(Ordering::Acquire) {
                return;
            }
            match msg_ring.ring() {
                Some(current) if current.version() == ring_version => {}
                _ => return,
            }
            if more && resume <= covered_from {
                return;
            }
            let covered_to = if more { resume - 1 } else { range_end };
            let Ok(mut msg) = self.out_free_rx.recv() else {
                return;
            };
            BigEndian::write_u64(&mut msg.header[0..8], ring.local_node_id());
            BigEndian::write_u64(&mut msg.header[8..16], ring_version as u64);
            BigEndian::write_u32(&mut msg.header[16..20], p as u32);
            BigEndian::write_u64(&mut msg.header[20..28], cutoff);
            BigEndian::write_u64(&mut msg.header[28..36], covered_from);
            BigEndian::write_u64(&mut msg.header[36..44], covered_to);
            filter.write_header(&mut msg.header[PULL_REPLICATION_MSG_HEADER_SIZE..]);
            msg.body.clear();
            msg.body.extend_from_slice(filter.bitfield());
            Statistics::incr(&core.stats.out_pull_replications);
            msg_ring.msg_to_other_replicas(Box::new(msg), p as u32, core.cfg.msg_timeout);
            if !more {
                return;
            }
            range_begin = resume;
        }
    }
}
