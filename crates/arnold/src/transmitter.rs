//! The transmitter sends what the engine decided to send.
//!
//! It owns four queues, served in strict priority: requests, bookkeeping,
//! data and retries. It never looks at scheduling state, it only turns
//! [`Outgoing`] messages into sends on the [`Transport`].
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use hashbrown::{HashMap, HashSet};
use tokio::{
    select,
    sync::{mpsc, Notify},
    time::{sleep_until, Instant},
};
use tracing::{debug, info, trace, warn};

use crate::{
    config::Config,
    context::{Outgoing, Priority},
    error::Error,
    peer::PeerId,
    transport::Transport,
    utils::to_human_readable,
    wire::MessageId,
};

#[derive(Debug)]
pub enum TransmitterMsg {
    Send(Outgoing),
    /// Send what is queued, without retries, and stop.
    Quit,
}

/// What the engine holds to feed the transmitter.
#[derive(Debug, Clone)]
pub struct TransmitterHandle {
    tx: mpsc::UnboundedSender<TransmitterMsg>,
    data_pending: Arc<AtomicUsize>,
    ideal_data_queue: usize,
}

impl TransmitterHandle {
    pub fn send(&self, out: Outgoing) -> Result<(), Error> {
        if out.priority == Priority::Data {
            self.data_pending.fetch_add(1, Ordering::Relaxed);
        }
        self.tx.send(TransmitterMsg::Send(out))?;
        Ok(())
    }

    pub fn quit(&self) -> Result<(), Error> {
        self.tx.send(TransmitterMsg::Quit)?;
        Ok(())
    }

    /// Data messages not sent yet.
    pub fn data_pending(&self) -> usize {
        self.data_pending.load(Ordering::Relaxed)
    }

    /// The data queue is short enough to take another piece message.
    pub fn needs_data(&self) -> bool {
        self.data_pending() < self.ideal_data_queue
    }
}

#[derive(Debug)]
struct Queued {
    out: Outgoing,
    attempts: u32,
    /// Retries wait before they are sent again.
    not_before: Option<Instant>,
}

/// Totals of a transmitter, for the final statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransmitterReport {
    pub sent: HashMap<MessageId, u64>,
    pub bytes: u64,
    pub retries: u64,
    pub dropped: u64,
    pub max_queue_len: usize,
}

impl TransmitterReport {
    pub fn messages(&self) -> u64 {
        self.sent.values().sum()
    }
}

impl fmt::Display for TransmitterReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent {} messages ({}), {} retries, {} dropped, longest queue {}",
            self.messages(),
            to_human_readable(self.bytes as f64),
            self.retries,
            self.dropped,
            self.max_queue_len
        )
    }
}

#[derive(Debug)]
pub struct Transmitter {
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    rx: mpsc::UnboundedReceiver<TransmitterMsg>,
    request: VecDeque<Queued>,
    bookkeeping: VecDeque<Queued>,
    data: VecDeque<Queued>,
    retry: VecDeque<Queued>,
    /// Peers we gave up on, nothing is sent to them anymore.
    dead: HashSet<PeerId>,
    data_pending: Arc<AtomicUsize>,
    /// Woken whenever a data message leaves, so the engine can refill.
    engine: Arc<Notify>,
    report: TransmitterReport,
    stopping: bool,
}

impl Transmitter {
    pub fn new(
        config: Arc<Config>,
        transport: Arc<dyn Transport>,
        engine: Arc<Notify>,
    ) -> (Self, TransmitterHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let data_pending = Arc::new(AtomicUsize::new(0));
        let handle = TransmitterHandle {
            tx,
            data_pending: data_pending.clone(),
            ideal_data_queue: config.ideal_transmitter_queue_length,
        };
        let transmitter = Self {
            config,
            transport,
            rx,
            request: VecDeque::new(),
            bookkeeping: VecDeque::new(),
            data: VecDeque::new(),
            retry: VecDeque::new(),
            dead: HashSet::new(),
            data_pending,
            engine,
            report: TransmitterReport::default(),
            stopping: false,
        };
        (transmitter, handle)
    }

    fn queue_len(&self) -> usize {
        self.request.len() + self.bookkeeping.len() + self.data.len() + self.retry.len()
    }

    fn enqueue(&mut self, msg: TransmitterMsg) {
        match msg {
            TransmitterMsg::Send(out) => {
                let queued = Queued {
                    out,
                    attempts: 0,
                    not_before: None,
                };
                match queued.out.priority {
                    Priority::Request => self.request.push_back(queued),
                    Priority::Bookkeeping => self.bookkeeping.push_back(queued),
                    Priority::Data => self.data.push_back(queued),
                }
                self.report.max_queue_len = self.report.max_queue_len.max(self.queue_len());
            }
            TransmitterMsg::Quit => {
                debug!("transmitter is draining {} messages", self.queue_len());
                self.stopping = true;
            }
        }
    }

    fn retry_is_due(&self, now: Instant) -> bool {
        self.retry
            .front()
            .is_some_and(|q| q.not_before.map_or(true, |t| t <= now))
    }

    /// The next message to send. A retry that has been waiting for a whole
    /// idle period goes before fresh traffic, otherwise it comes last.
    fn next(&mut self) -> Option<Queued> {
        let now = Instant::now();
        if self.stopping {
            return self
                .request
                .pop_front()
                .or_else(|| self.bookkeeping.pop_front())
                .or_else(|| self.data.pop_front())
                .or_else(|| self.retry.pop_front());
        }
        let starved = self.retry.front().and_then(|q| q.not_before).is_some_and(|t| {
            now.saturating_duration_since(t) > self.config.transmitter_idle()
        });
        if starved {
            return self.retry.pop_front();
        }
        if let Some(q) = self
            .request
            .pop_front()
            .or_else(|| self.bookkeeping.pop_front())
            .or_else(|| self.data.pop_front())
        {
            return Some(q);
        }
        if self.retry_is_due(now) {
            return self.retry.pop_front();
        }
        None
    }

    fn sent_data(&mut self, q: &Queued) {
        if q.out.priority == Priority::Data {
            let _ = self
                .data_pending
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
            self.engine.notify_one();
        }
    }

    async fn transmit(&mut self, mut q: Queued) {
        let to = q.out.to;
        if self.dead.contains(&to) {
            trace!("dropped {:?} for dead peer {to}", q.out.msg.id());
            self.report.dropped += 1;
            self.sent_data(&q);
            return;
        }
        match self.transport.send(to, &q.out.msg).await {
            Ok(len) => {
                trace!("sent {} to {to}", q.out.msg.id().name());
                *self.report.sent.entry(q.out.msg.id()).or_default() += 1;
                self.report.bytes += len as u64;
                self.sent_data(&q);
            }
            Err(e) if self.stopping => {
                debug!("could not send to {to} while stopping: {e}");
                self.report.dropped += 1;
                self.sent_data(&q);
            }
            Err(e) => {
                q.attempts += 1;
                if q.attempts > self.config.maximal_send_retries {
                    warn!(
                        "giving up on {} to {to} after {} attempts: {e}",
                        q.out.msg.id().name(),
                        q.attempts
                    );
                    self.report.dropped += 1;
                    self.dead.insert(to);
                    self.transport.mark_suspect(to);
                    self.sent_data(&q);
                } else {
                    debug!("send to {to} failed, will retry: {e}");
                    self.report.retries += 1;
                    q.not_before = Some(Instant::now() + self.config.transmitter_retry());
                    self.retry.push_back(q);
                }
            }
        }
    }

    pub async fn run(mut self) -> TransmitterReport {
        loop {
            while let Ok(msg) = self.rx.try_recv() {
                self.enqueue(msg);
            }
            if let Some(q) = self.next() {
                self.transmit(q).await;
                continue;
            }
            if self.stopping {
                break;
            }

            let wake_at = self
                .retry
                .front()
                .and_then(|q| q.not_before)
                .unwrap_or_else(|| Instant::now() + self.config.transmitter_idle());
            select! {
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.enqueue(msg),
                    // the engine is gone, nothing new will come
                    None => self.stopping = true,
                },
                _ = sleep_until(wake_at) => {}
            }
        }
        info!("transmitter: {}", self.report);
        self.report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures::future::BoxFuture;

    use crate::wire::Message;

    use super::*;

    fn id(n: u8) -> PeerId {
        PeerId::from([n; 20])
    }

    /// Records every send, failing the first `fail` of them.
    #[derive(Debug, Default)]
    struct Recorder {
        sent: Mutex<Vec<(PeerId, Message)>>,
        fail: Mutex<u32>,
        suspects: Mutex<Vec<PeerId>>,
    }

    impl Transport for Recorder {
        fn send<'a>(
            &'a self,
            to: PeerId,
            msg: &'a Message,
        ) -> BoxFuture<'a, Result<usize, Error>> {
            Box::pin(async move {
                let mut fail = self.fail.lock().unwrap();
                if *fail > 0 {
                    *fail -= 1;
                    return Err(Error::SendFailed(to));
                }
                self.sent.lock().unwrap().push((to, msg.clone()));
                Ok(1)
            })
        }

        fn mark_suspect(&self, peer: PeerId) {
            self.suspects.lock().unwrap().push(peer);
        }

        fn close(&self) -> BoxFuture<'_, ()> {
            Box::pin(async {})
        }
    }

    fn setup(recorder: Arc<Recorder>) -> (Transmitter, TransmitterHandle) {
        let config = Config {
            maximal_send_retries: 2,
            transmitter_retry_ms: 1,
            ..Default::default()
        };
        Transmitter::new(Arc::new(config), recorder, Arc::new(Notify::new()))
    }

    fn out(priority: Priority, to: u8, msg: Message) -> Outgoing {
        Outgoing {
            priority,
            to: id(to),
            msg,
        }
    }

    #[tokio::test]
    async fn queues_are_served_in_priority_order() {
        let recorder = Arc::new(Recorder::default());
        let (transmitter, handle) = setup(recorder.clone());

        handle.send(out(Priority::Data, 1, Message::Have(3))).unwrap();
        handle.send(out(Priority::Bookkeeping, 1, Message::Have(2))).unwrap();
        handle.send(out(Priority::Request, 1, Message::Have(1))).unwrap();
        assert_eq!(handle.data_pending(), 1);
        handle.quit().unwrap();

        let report = transmitter.run().await;
        let sent: Vec<Message> = recorder.sent.lock().unwrap().iter().map(|(_, m)| m.clone()).collect();
        assert_eq!(sent, vec![Message::Have(1), Message::Have(2), Message::Have(3)]);
        assert_eq!(report.messages(), 3);
        assert_eq!(handle.data_pending(), 0);
        assert!(handle.needs_data());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sends_are_retried() {
        let recorder = Arc::new(Recorder::default());
        *recorder.fail.lock().unwrap() = 2;
        let (transmitter, handle) = setup(recorder.clone());
        let task = tokio::spawn(transmitter.run());

        handle.send(out(Priority::Bookkeeping, 1, Message::Have(0))).unwrap();
        // the clock is paused, it jumps over the retry delays while we sleep
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        handle.quit().unwrap();

        let report = task.await.unwrap();
        assert_eq!(report.retries, 2);
        assert_eq!(report.dropped, 0);
        assert_eq!(recorder.sent.lock().unwrap().len(), 1);
        assert!(recorder.suspects.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hopeless_peers_are_suspected() {
        let recorder = Arc::new(Recorder::default());
        *recorder.fail.lock().unwrap() = 100;
        let (transmitter, handle) = setup(recorder.clone());
        let task = tokio::spawn(transmitter.run());

        handle.send(out(Priority::Request, 4, Message::Have(0))).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        // the peer is dead now, this one is dropped without a try
        handle.send(out(Priority::Request, 4, Message::Have(1))).unwrap();
        handle.quit().unwrap();

        let report = task.await.unwrap();
        assert_eq!(report.retries, 2);
        assert_eq!(report.dropped, 2);
        assert!(recorder.sent.lock().unwrap().is_empty());
        assert_eq!(*recorder.suspects.lock().unwrap(), vec![id(4)]);
    }
}
