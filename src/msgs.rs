//! Pooled message buffers for the replication protocols.
//!
//! Every protocol keeps a fixed number of incoming and outgoing message
//! bodies to cap memory. Incoming messages beyond the pool are drained off
//! the wire and dropped (counted by the caller); outgoing acquisition blocks
//! until a body frees up. An outgoing message returns its body to the pool
//! when it is dropped, wherever the transport stopped caring about it.

use std::io::Read;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::ring::Msg;

/// What happened to an incoming message.
pub(crate) enum Intake {
    Queued,
    Dropped,
}

/// Reads and discards `len` bytes so the stream stays framed.
fn discard(r: &mut dyn Read, len: u64) -> std::io::Result<()> {
    let mut toss = [0u8; 8192];
    let mut left = len;
    while left > 0 {
        let take = left.min(toss.len() as u64) as usize;
        let n = r.read(&mut toss[..take])?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "short message body",
            ));
        }
        left -= n as u64;
    }
    Ok(())
}

pub(crate) struct InMsgPool {
    free_tx: Sender<Vec<u8>>,
    free_rx: Receiver<Vec<u8>>,
    msg_tx: Sender<Vec<u8>>,
    pub msg_rx: Receiver<Vec<u8>>,
}

impl InMsgPool {
    pub fn new(msgs: usize, body_cap: usize) -> Self {
        let msgs = msgs.max(1);
        let (free_tx, free_rx) = bounded(msgs);
        let (msg_tx, msg_rx) = bounded(msgs);
        for _ in 0..msgs {
            free_tx
                .send(Vec::with_capacity(body_cap))
                .expect("sized for exactly this many bodies");
        }
        Self {
            free_tx,
            free_rx,
            msg_tx,
            msg_rx,
        }
    }

    /// Takes a message off the wire: into a pooled body if one is free,
    /// otherwise drained and dropped.
    pub fn intake(&self, r: &mut dyn Read, len: u64) -> std::io::Result<Intake> {
        let mut body = match self.free_rx.try_recv() {
            Ok(body) => body,
            Err(_) => {
                discard(r, len)?;
                return Ok(Intake::Dropped);
            }
        };
        body.clear();
        body.resize(len as usize, 0);
        if let Err(e) = r.read_exact(&mut body) {
            let _ = self.free_tx.send(body);
            return Err(e);
        }
        self.msg_tx.send(body).expect("queue sized like the pool");
        Ok(Intake::Queued)
    }

    /// Returns a processed body to the pool.
    pub fn release(&self, body: Vec<u8>) {
        let _ = self.free_tx.send(body);
    }

    #[cfg(test)]
    pub fn try_take(&self) -> Option<Vec<u8>> {
        self.msg_rx.try_recv().ok()
    }

    #[cfg(test)]
    pub fn queue(&self, body: Vec<u8>) {
        self.msg_tx.send(body).expect("test queue");
    }
}

pub(crate) struct OutMsgPool {
    free_tx: Sender<Vec<u8>>,
    free_rx: Receiver<Vec<u8>>,
}

impl OutMsgPool {
    pub fn new(msgs: usize, body_cap: usize) -> Self {
        let msgs = msgs.max(1);
        let (free_tx, free_rx) = bounded(msgs);
        for _ in 0..msgs {
            free_tx
                .send(Vec::with_capacity(body_cap))
                .expect("sized for exactly this many bodies");
        }
        Self { free_tx, free_rx }
    }

    /// Blocks until an outgoing body is available.
    pub fn acquire(&self, msg_type: u64) -> PooledMsg {
        let mut body = self.free_rx.recv().expect("pool outlives acquirers");
        body.clear();
        PooledMsg {
            msg_type,
            body,
            pool: self.free_tx.clone(),
        }
    }
}

/// An outgoing message backed by a pooled body. Dropping it, whether sent or
/// not, requeues the body.
pub(crate) struct PooledMsg {
    msg_type: u64,
    pub body: Vec<u8>,
    pool: Sender<Vec<u8>>,
}

impl Msg for PooledMsg {
    fn msg_type(&self) -> u64 {
        self.msg_type
    }

    fn msg_length(&self) -> u64 {
        self.body.len() as u64
    }

    fn write_content(&self, w: &mut dyn std::io::Write) -> std::io::Result<u64> {
        w.write_all(&self.body)?;
        Ok(self.body.len() as u64)
    }
}

impl Drop for PooledMsg {
    fn drop(&mut self) {
        let _ = self.pool.send(std::mem::take(&mut self.body));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_intake_queues_then_drops() {
        let pool = InMsgPool::new(1, 16);
        let intake = pool.intake(&mut Cursor::new(vec![7u8; 24]), 24).unwrap();
        assert!(matches!(intake, Intake::Queued));
        // Pool of one: the next message is drained and dropped.
        let intake = pool.intake(&mut Cursor::new(vec![8u8; 24]), 24).unwrap();
        assert!(matches!(intake, Intake::Dropped));
        let body = pool.try_take().unwrap();
        assert_eq!(body, vec![7u8; 24]);
        pool.release(body);
        let intake = pool.intake(&mut Cursor::new(vec![9u8; 4]), 4).unwrap();
        assert!(matches!(intake, Intake::Queued));
    }

    #[test]
    fn test_intake_short_body_is_an_error() {
        let pool = InMsgPool::new(1, 16);
        assert!(pool.intake(&mut Cursor::new(vec![1u8; 10]), 100).is_err());
        // The body went back to the pool despite the error.
        let intake = pool.intake(&mut Cursor::new(vec![2u8; 8]), 8).unwrap();
        assert!(matches!(intake, Intake::Queued));
    }

    #[test]
    fn test_dropped_message_still_drains_the_stream() {
        let pool = InMsgPool::new(1, 16);
        pool.intake(&mut Cursor::new(vec![1u8; 8]), 8).unwrap();
        let mut cursor = Cursor::new(vec![2u8; 32]);
        pool.intake(&mut cursor, 20).unwrap();
        assert_eq!(cursor.position(), 20);
    }

    #[test]
    fn test_pooled_msg_returns_body_on_drop() {
        let pool = OutMsgPool::new(1, 16);
        {
            let mut msg = pool.acquire(42);
            msg.body.extend_from_slice(b"abc");
            assert_eq!(msg.msg_type(), 42);
            assert_eq!(msg.msg_length(), 3);
            let mut out = Vec::new();
            assert_eq!(msg.write_content(&mut out).unwrap(), 3);
            assert_eq!(out, b"abc");
        }
        // Dropped above; acquire must not block.
        let msg = pool.acquire(43);
        assert_eq!(msg.msg_length(), 0);
    }
}
