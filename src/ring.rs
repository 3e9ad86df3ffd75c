//! The partition ring seam.
//!
//! The engine never talks to the network itself. An embedding process hands
//! it a [`MsgRing`]; the engine registers one handler per message type it
//! understands and ships outgoing messages through `msg_to_node` /
//! `msg_to_other_replicas`. Partition ownership questions go through
//! [`Ring`]. Everything here is stateless from the engine's point of view: a
//! lost message is repaired by a later replication pass.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

/// A snapshot of the partition/replica ring.
pub trait Ring: Send + Sync {
    /// Changes whenever node assignments change; passes abandon work when the
    /// version moves under them.
    fn version(&self) -> i64;

    /// How many of `key_a`'s top bits select a partition.
    fn partition_bit_count(&self) -> u16;

    /// Whether this node currently holds the partition.
    fn responsible(&self, partition: u32) -> bool;

    /// This node's id, carried in messages that want a directed reply.
    fn local_node_id(&self) -> u64;
}

/// An outgoing message. Implementations that wrap a pooled buffer return it
/// to the pool on drop.
pub trait Msg: Send {
    fn msg_type(&self) -> u64;
    fn msg_length(&self) -> u64;
    /// Writes exactly `msg_length` bytes of content, returning the count.
    fn write_content(&self, w: &mut dyn Write) -> std::io::Result<u64>;
}

/// Callback invoked by the transport when a message of a registered type
/// arrives: `(content reader, declared length) -> bytes consumed`. Handlers
/// must drain the reader even when they drop the message, to keep the stream
/// framed.
pub type MsgHandler = Box<dyn Fn(&mut dyn Read, u64) -> std::io::Result<u64> + Send + Sync>;

/// The transport the engine replicates over.
pub trait MsgRing: Send + Sync {
    /// The current ring, if one is known yet.
    fn ring(&self) -> Option<Arc<dyn Ring>>;

    /// Registers the handler for one message type id.
    fn set_msg_handler(&self, msg_type: u64, handler: MsgHandler);

    /// Sends to a specific node; may silently drop after `timeout`.
    fn msg_to_node(&self, node_id: u64, msg: Box<dyn Msg>, timeout: Duration);

    /// Sends to the other replicas of `partition`; may silently drop after
    /// `timeout`.
    fn msg_to_other_replicas(&self, msg: Box<dyn Msg>, partition: u32, timeout: Duration);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Fixed ring answering every ownership question the same way.
    pub struct StaticRing {
        pub version: i64,
        pub partition_bits: u16,
        pub responsible: bool,
        pub node_id: u64,
    }

    impl Ring for StaticRing {
        fn version(&self) -> i64 {
            self.version
        }
        fn partition_bit_count(&self) -> u16 {
            self.partition_bits
        }
        fn responsible(&self, _partition: u32) -> bool {
            self.responsible
        }
        fn local_node_id(&self) -> u64 {
            self.node_id
        }
    }

    /// Captures outgoing messages instead of sending them.
    #[derive(Default)]
    pub struct MsgRingPlaceholder {
        pub ring: Option<Arc<dyn Ring>>,
        pub handlers: Mutex<Vec<(u64, MsgHandler)>>,
        pub sent: Mutex<Vec<(u64, Vec<u8>)>>,
    }

    impl MsgRingPlaceholder {
        pub fn with_ring(ring: Arc<dyn Ring>) -> Self {
            Self {
                ring: Some(ring),
                ..Default::default()
            }
        }

        fn capture(&self, msg: Box<dyn Msg>) {
            let mut body = Vec::new();
            msg.write_content(&mut body).expect("vec write");
            assert_eq!(body.len() as u64, msg.msg_length());
            self.sent.lock().push((msg.msg_type(), body));
        }
    }

    impl MsgRing for MsgRingPlaceholder {
        fn ring(&self) -> Option<Arc<dyn Ring>> {
            self.ring.clone()
        }

        fn set_msg_handler(&self, msg_type: u64, handler: MsgHandler) {
            self.handlers.lock().push((msg_type, handler));
        }

        fn msg_to_node(&self, _node_id: u64, msg: Box<dyn Msg>, _timeout: Duration) {
            self.capture(msg);
        }

        fn msg_to_other_replicas(&self, msg: Box<dyn Msg>, _partition: u32, _timeout: Duration) {
            self.capture(msg);
        }
    }
}
