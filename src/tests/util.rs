//! Shared test fixtures: a recording message ring and small-geometry
//! store builders.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempfile::TempDir;

use crate::ring::{Msg, MsgHandler, MsgRing, Ring};
use crate::{GroupStore, StoreKey, ValueStore};

static TRACING_INIT: Once = Once::new();

/// Route store logs through the capturing test writer; recovery summaries
/// and file errors then show up in failing tests' output.
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

pub struct RingPlaceholder {
    pub version: i64,
    pub partition_bit_count: u16,
    pub replica_count: usize,
    pub local_node_id: u64,
    pub responsible_for_everything: bool,
}

impl RingPlaceholder {
    pub fn new(local_node_id: u64, responsible_for_everything: bool) -> Arc<dyn Ring> {
        Arc::new(Self {
            version: 1,
            partition_bit_count: 8,
            replica_count: 2,
            local_node_id,
            responsible_for_everything,
        })
    }
}

impl Ring for RingPlaceholder {
    fn version(&self) -> i64 {
        self.version
    }

    fn partition_bit_count(&self) -> u16 {
        self.partition_bit_count
    }

    fn replica_count(&self) -> usize {
        self.replica_count
    }

    fn responsible(&self, _partition: u32) -> bool {
        self.responsible_for_everything
    }

    fn responsible_replica(&self, _partition: u32) -> Option<usize> {
        if self.responsible_for_everything {
            Some(0)
        } else {
            None
        }
    }

    fn local_node_id(&self) -> u64 {
        self.local_node_id
    }
}

pub struct SentMsg {
    pub msg_type: u64,
    pub to_node: Option<u64>,
    pub to_partition: Option<u32>,
    pub content: Vec<u8>,
}

/// Records outbound messages and lets tests feed inbound byte streams
/// straight into the handlers the store registered.
pub struct MsgRingPlaceholder {
    ring: Option<Arc<dyn Ring>>,
    handlers: Mutex<HashMap<u64, MsgHandler>>,
    pub sent: Mutex<Vec<SentMsg>>,
}

impl MsgRingPlaceholder {
    pub fn new(ring: Option<Arc<dyn Ring>>) -> Arc<Self> {
        Arc::new(Self {
            ring,
            handlers: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn deliver(&self, msg_type: u64, bytes: &[u8]) -> std::io::Result<u64> {
        let handlers = self.handlers.lock();
        let handler = handlers.get(&msg_type).expect("no handler registered");
        let mut cursor = std::io::Cursor::new(bytes);
        handler(&mut cursor as &mut dyn Read, bytes.len() as u64)
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn take_sent(&self) -> Vec<SentMsg> {
        std::mem::take(&mut self.sent.lock())
    }

    fn record(&self, msg: Box<dyn Msg>, to_node: Option<u64>, to_partition: Option<u32>) {
        let mut content = Vec::new();
        let written = msg.write_content(&mut content).expect("write_content");
        assert_eq!(written, msg.msg_length());
        self.sent.lock().push(SentMsg {
            msg_type: msg.msg_type(),
            to_node,
            to_partition,
            content,
        });
        msg.done();
    }
}

impl MsgRing for MsgRingPlaceholder {
    fn ring(&self) -> Option<Arc<dyn Ring>> {
        self.ring.clone()
    }

    fn set_msg_handler(&self, msg_type: u64, handler: MsgHandler) {
        self.handlers.lock().insert(msg_type, handler);
    }

    fn msg_to_node(&self, msg: Box<dyn Msg>, node_id: u64, _timeout: Duration) {
        self.record(msg, Some(node_id), None);
    }

    fn msg_to_other_replicas(&self, msg: Box<dyn Msg>, partition: u32, _timeout: Duration) {
        self.record(msg, None, Some(partition));
    }
}

fn small_builder<K: StoreKey>(
    dir: &TempDir,
    msg_ring: Option<Arc<MsgRingPlaceholder>>,
) -> crate::StoreBuilder<K> {
    init_tracing();
    let mut builder = crate::Store::<K>::builder(
        dir.path().join("values"),
        dir.path().join("valuestoc"),
    )
    .workers(2)
    .page_size(4096)
    .checksum_interval(1024)
    .locmap_page_size(8192)
    .bloom_n(1024)
    .in_pull_replication_msgs(4)
    .out_pull_replication_msgs(4)
    .in_bulk_set_msgs(4)
    .out_bulk_set_msgs(4)
    .in_bulk_set_ack_msgs(4)
    .out_bulk_set_ack_msgs(4)
    .replication_ignore_recent(Duration::ZERO)
    .msg_timeout(Duration::from_millis(50));
    if let Some(msg_ring) = msg_ring {
        builder = builder.msg_ring(msg_ring);
    }
    builder
}

pub fn test_value_store(dir: &TempDir, msg_ring: Option<Arc<MsgRingPlaceholder>>) -> ValueStore {
    let store = small_builder(dir, msg_ring).build().unwrap();
    store.enable_writes();
    store
}

pub fn test_group_store(dir: &TempDir, msg_ring: Option<Arc<MsgRingPlaceholder>>) -> GroupStore {
    let store = small_builder(dir, msg_ring).build().unwrap();
    store.enable_writes();
    store
}

/// Poll `cond` until it holds or two seconds pass.
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}
