//! External cluster interfaces.
//!
//! The store never computes partitions, replica assignments or ring
//! versions; it consumes a caller-provided [`Ring`] snapshot and posts
//! outbound messages through a caller-provided [`MsgRing`] transport. The
//! transport is expected to frame length-prefixed messages and to dispatch
//! inbound ones to the handler registered for their 64-bit type id.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

/// Immutable snapshot of cluster membership for one ring version.
pub trait Ring: Send + Sync {
    /// Version of this snapshot; a changed version invalidates in-flight
    /// replication passes.
    fn version(&self) -> i64;

    /// Number of high key_a bits that select a partition.
    fn partition_bit_count(&self) -> u16;

    /// Number of replicas assigned to each partition.
    fn replica_count(&self) -> usize;

    /// Whether the local node is responsible for `partition`.
    fn responsible(&self, partition: u32) -> bool;

    /// The local node's 0-based position among the replicas responsible for
    /// `partition`, or `None` when not responsible.
    fn responsible_replica(&self, partition: u32) -> Option<usize>;

    /// The local node's id.
    fn local_node_id(&self) -> u64;
}

/// An outbound message. Implementations are pooled; the transport calls
/// [`Msg::done`] once the content has been written (or abandoned) so the
/// buffers return to their pool.
pub trait Msg: Send {
    fn msg_type(&self) -> u64;
    fn msg_length(&self) -> u64;

    /// Write exactly `msg_length()` bytes of content to `w`, returning the
    /// count actually written.
    fn write_content(&self, w: &mut dyn Write) -> std::io::Result<u64>;

    /// Return the message to its pool.
    fn done(self: Box<Self>);
}

/// Handler for one inbound message type: `(reader, declared_length)` to
/// `(bytes_consumed)`. The handler must consume exactly the declared length
/// from the reader unless the reader itself fails.
pub type MsgHandler = Box<dyn Fn(&mut dyn Read, u64) -> std::io::Result<u64> + Send + Sync>;

/// Message transport bound to the ring.
pub trait MsgRing: Send + Sync {
    /// The current ring snapshot, if one is known yet.
    fn ring(&self) -> Option<Arc<dyn Ring>>;

    /// Register the handler for a message type. Replaces any prior handler.
    fn set_msg_handler(&self, msg_type: u64, handler: MsgHandler);

    /// Queue a message to one node. Best effort; on timeout or transport
    /// failure the message is dropped and `done()` is still called.
    fn msg_to_node(&self, msg: Box<dyn Msg>, node_id: u64, timeout: Duration);

    /// Queue a message to every other replica of a partition.
    fn msg_to_other_replicas(&self, msg: Box<dyn Msg>, partition: u32, timeout: Duration);
}
