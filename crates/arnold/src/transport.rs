//! Membership and message delivery between the engines of a pool.
//!
//! The [`LocalPool`] keeps every engine of a simulation in one process.
//! Messages still go through [`MessageCodec`] on every send, so what an
//! engine receives is exactly what the wire format can carry.
use std::{fmt::Debug, sync::Arc};

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use hashbrown::{HashMap, HashSet};
use tokio::{
    sync::{mpsc, Mutex},
    time::Instant,
};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info, warn};

use crate::{
    engine::{Delivery, EngineMsg},
    error::Error,
    peer::PeerId,
    wire::{Message, MessageCodec},
};

/// How an engine reaches the other members of its pool.
pub trait Transport: Debug + Send + Sync {
    /// Deliver `msg` to `to`. Returns the bytes that went over the wire.
    fn send<'a>(&'a self, to: PeerId, msg: &'a Message) -> BoxFuture<'a, Result<usize, Error>>;

    /// Sends to `peer` keep failing, it is probably dead. The transport
    /// treats it as gone, every member is told it left.
    fn mark_suspect(&self, peer: PeerId);

    /// Leave the pool.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// The two inboxes of a member.
#[derive(Debug, Clone)]
struct Inbox {
    messages: mpsc::Sender<Delivery>,
    control: mpsc::UnboundedSender<EngineMsg>,
}

#[derive(Debug, Default)]
struct PoolState {
    members: HashMap<PeerId, Inbox>,
    /// Sends to these peers fail this many more times.
    failing: HashMap<PeerId, u32>,
    /// Piece payloads sent by these peers are corrupted on the way.
    corrupting: HashSet<PeerId>,
    suspects: HashSet<PeerId>,
}

/// What a new member gets from the pool.
#[derive(Debug)]
pub struct Membership {
    pub local: PeerId,
    pub transport: Arc<dyn Transport>,
    pub messages: mpsc::Receiver<Delivery>,
    pub control: mpsc::UnboundedReceiver<EngineMsg>,
    /// Lets the owner of the engine stop it.
    pub control_tx: mpsc::UnboundedSender<EngineMsg>,
}

/// An in-process pool of engines.
#[derive(Debug, Clone)]
pub struct LocalPool {
    state: Arc<Mutex<PoolState>>,
    queue_capacity: usize,
}

impl LocalPool {
    /// `queue_capacity` bounds the received-message queue of every member,
    /// senders wait while it is full. Membership changes are never held
    /// back, so members may join before any engine runs.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            state: Arc::default(),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a new member and tell it and everybody else about each
    /// other.
    pub async fn join(&self, local: PeerId) -> Result<Membership, Error> {
        let (messages_tx, messages) = mpsc::channel(self.queue_capacity);
        let (control_tx, control) = mpsc::unbounded_channel();

        let mut state = self.state.lock().await;
        for (peer, inbox) in state.members.iter() {
            inbox.control.send(EngineMsg::PeerJoined(local))?;
            control_tx.send(EngineMsg::PeerJoined(*peer))?;
        }
        state.members.insert(
            local,
            Inbox {
                messages: messages_tx,
                control: control_tx.clone(),
            },
        );
        info!("{local} joined the pool of {}", state.members.len());

        let transport = LocalTransport {
            local,
            pool: self.clone(),
        };
        Ok(Membership {
            local,
            transport: Arc::new(transport),
            messages,
            control,
            control_tx,
        })
    }

    /// Remove `peer` and tell everybody, `peer` included: a member that
    /// did not leave on its own stops on that news.
    pub async fn leave(&self, peer: PeerId) {
        let mut state = self.state.lock().await;
        let Some(gone) = state.members.remove(&peer) else {
            return;
        };
        debug!("{peer} left the pool");
        for inbox in state.members.values().chain([&gone]) {
            // a member that stopped listening is leaving too
            let _ = inbox.control.send(EngineMsg::PeerLeft(peer));
        }
    }

    /// Tell every member that the pool is done.
    pub async fn terminate(&self) {
        let state = self.state.lock().await;
        info!("terminating the pool");
        for inbox in state.members.values() {
            let _ = inbox.control.send(EngineMsg::PoolTerminated);
        }
    }

    pub async fn members(&self) -> Vec<PeerId> {
        self.state.lock().await.members.keys().copied().collect()
    }

    /// Make the next `count` sends to `peer` fail.
    pub async fn fail_sends_to(&self, peer: PeerId, count: u32) {
        self.state.lock().await.failing.insert(peer, count);
    }

    /// Flip every byte of the piece payloads `peer` sends from now on.
    pub async fn corrupt_pieces_from(&self, peer: PeerId) {
        self.state.lock().await.corrupting.insert(peer);
    }

    pub async fn is_suspect(&self, peer: &PeerId) -> bool {
        self.state.lock().await.suspects.contains(peer)
    }

    async fn deliver(&self, from: PeerId, to: PeerId, msg: &Message) -> Result<usize, Error> {
        let (inbox, corrupt) = {
            let mut state = self.state.lock().await;
            if let Some(left) = state.failing.get_mut(&to) {
                if *left > 0 {
                    *left -= 1;
                    return Err(Error::SendFailed(to));
                }
            }
            let inbox = state
                .members
                .get(&to)
                .map(|i| i.messages.clone())
                .ok_or(Error::PeerNotFound(to))?;
            (inbox, state.corrupting.contains(&from))
        };

        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf)?;
        let len = buf.len();
        let Some(mut msg) = codec.decode(&mut buf)? else {
            return Err(Error::MalformedMessage("truncated frame"));
        };
        if corrupt {
            if let Message::Piece { data, .. } = &mut msg {
                *data = data.iter().map(|b| !b).collect::<Bytes>();
            }
        }

        inbox
            .send(Delivery {
                from,
                msg,
                len,
                at: Instant::now(),
            })
            .await
            .map_err(|_| Error::PeerGone(to))?;
        Ok(len)
    }
}

/// The [`Transport`] of one member of a [`LocalPool`].
#[derive(Debug)]
pub struct LocalTransport {
    local: PeerId,
    pool: LocalPool,
}

impl Transport for LocalTransport {
    fn send<'a>(&'a self, to: PeerId, msg: &'a Message) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(self.pool.deliver(self.local, to, msg))
    }

    fn mark_suspect(&self, peer: PeerId) {
        warn!("{} suspects {peer} is dead", self.local);
        let pool = self.pool.clone();
        tokio::spawn(async move {
            pool.state.lock().await.suspects.insert(peer);
            pool.leave(peer).await;
        });
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.pool.leave(self.local))
    }
}

#[cfg(test)]
mod tests {
    use crate::{credit::CreditValue, wire::Chunk};

    use super::*;

    fn id(n: u8) -> PeerId {
        PeerId::from([n; 20])
    }

    #[tokio::test]
    async fn members_learn_about_each_other() {
        let pool = LocalPool::new(8);
        let mut a = pool.join(id(1)).await.unwrap();
        let mut b = pool.join(id(2)).await.unwrap();

        assert_eq!(a.control.recv().await, Some(EngineMsg::PeerJoined(id(2))));
        assert_eq!(b.control.recv().await, Some(EngineMsg::PeerJoined(id(1))));

        b.transport.close().await;
        assert_eq!(a.control.recv().await, Some(EngineMsg::PeerLeft(id(2))));
        assert!(matches!(
            a.transport.send(id(2), &Message::Have(1)).await,
            Err(Error::PeerNotFound(_))
        ));

        pool.terminate().await;
        assert_eq!(a.control.recv().await, Some(EngineMsg::PoolTerminated));
    }

    #[tokio::test]
    async fn messages_go_through_the_codec() {
        let pool = LocalPool::new(8);
        let a = pool.join(id(1)).await.unwrap();
        let mut b = pool.join(id(2)).await.unwrap();

        let msg = Message::Request {
            chunk: Chunk::new(3, 16, 16),
            credit: CreditValue::new(-2.0, 4),
        };
        let len = a.transport.send(id(2), &msg).await.unwrap();
        let d = b.messages.recv().await.unwrap();
        assert_eq!(d.from, id(1));
        assert_eq!(d.msg, msg);
        assert_eq!(d.len, len);
        // header, id, chunk and credit
        assert_eq!(len, 4 + 1 + 12 + 16);
    }

    #[tokio::test]
    async fn faults_can_be_injected() {
        let pool = LocalPool::new(8);
        let a = pool.join(id(1)).await.unwrap();
        let mut b = pool.join(id(2)).await.unwrap();

        pool.fail_sends_to(id(2), 2).await;
        for _ in 0..2 {
            assert!(matches!(
                a.transport.send(id(2), &Message::Have(0)).await,
                Err(Error::SendFailed(_))
            ));
        }
        a.transport.send(id(2), &Message::Have(0)).await.unwrap();
        assert_eq!(b.messages.recv().await.unwrap().msg, Message::Have(0));

        pool.corrupt_pieces_from(id(1)).await;
        let piece = Message::Piece {
            chunk: Chunk::new(0, 0, 2),
            data: Bytes::from_static(&[0, 7]),
            credit: CreditValue::default(),
        };
        a.transport.send(id(2), &piece).await.unwrap();
        let Message::Piece { data, .. } = b.messages.recv().await.unwrap().msg else {
            panic!("expected a piece");
        };
        assert_eq!(&data[..], &[0xff, 0xf8]);
    }

    #[tokio::test]
    async fn suspects_are_dropped_from_the_pool() {
        let pool = LocalPool::new(8);
        let a = pool.join(id(1)).await.unwrap();
        let mut b = pool.join(id(2)).await.unwrap();
        let mut c = pool.join(id(3)).await.unwrap();
        for _ in 0..2 {
            assert!(matches!(c.control.recv().await, Some(EngineMsg::PeerJoined(_))));
        }
        while let Ok(msg) = b.control.try_recv() {
            assert!(matches!(msg, EngineMsg::PeerJoined(_)));
        }

        a.transport.mark_suspect(id(2));
        assert_eq!(c.control.recv().await, Some(EngineMsg::PeerLeft(id(2))));
        // the suspect hears it too, so its engine stops
        assert_eq!(b.control.recv().await, Some(EngineMsg::PeerLeft(id(2))));
        assert!(pool.is_suspect(&id(2)).await);
        assert!(!pool.members().await.contains(&id(2)));
    }
}
