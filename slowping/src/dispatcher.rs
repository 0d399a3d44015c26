use dashmap::DashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::config::{Config, DispatchMode, FullQueuePolicy};
use crate::delay::DelayPolicy;
use crate::reply::{ReplyEngine, Transport};

/// An ICMP message (IP header already stripped) and the address it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub source: Ipv4Addr,
    pub bytes: Vec<u8>,
}

/// Per-source state. Entries are never evicted, so the map grows with the
/// number of distinct sources seen over the process lifetime.
enum Sources {
    /// Queue feeding the source's dedicated task. The task owns the delay.
    Workers(DashMap<Ipv4Addr, mpsc::Sender<Vec<u8>>>),
    /// Delay state only; processing happens on the caller's path.
    Inline(DashMap<Ipv4Addr, DelayPolicy>),
}

/// Routes datagrams to per-source processing.
///
/// Datagrams from one source are handled strictly in arrival order. In worker
/// mode different sources are independent; in inline mode every sleep blocks
/// the caller, and so every other source.
pub struct Dispatcher<T: Transport> {
    engine: Arc<ReplyEngine<T>>,
    sources: Sources,
    ceiling_ms: u64,
    queue_depth: usize,
    full_queue: FullQueuePolicy,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(engine: ReplyEngine<T>, config: &Config) -> Self {
        let sources = match config.mode {
            DispatchMode::Worker => Sources::Workers(DashMap::new()),
            DispatchMode::Inline => Sources::Inline(DashMap::new()),
        };
        Self {
            engine: Arc::new(engine),
            sources,
            ceiling_ms: config.ceiling_ms,
            queue_depth: config.queue_depth.max(1),
            full_queue: config.full_queue,
        }
    }

    /// Number of distinct sources seen so far.
    pub fn sources(&self) -> usize {
        match &self.sources {
            Sources::Workers(map) => map.len(),
            Sources::Inline(map) => map.len(),
        }
    }

    /// Hand a datagram to its source's context.
    ///
    /// Worker mode returns once the datagram is queued (or dropped, under the
    /// `drop` policy). Inline mode returns after the reply has been sent.
    /// Must be called from within a tokio runtime.
    pub async fn dispatch(&self, datagram: Datagram) {
        match &self.sources {
            Sources::Workers(map) => self.enqueue(map, datagram).await,
            Sources::Inline(map) => self.process_inline(map, datagram).await,
        }
    }

    async fn enqueue(&self, map: &DashMap<Ipv4Addr, mpsc::Sender<Vec<u8>>>, datagram: Datagram) {
        let Datagram { source, bytes } = datagram;

        // The shard guard must be gone before any await below.
        let tx = map
            .entry(source)
            .or_insert_with(|| self.spawn_worker(source))
            .value()
            .clone();

        match self.full_queue {
            FullQueuePolicy::Block => {
                if tx.send(bytes).await.is_err() {
                    tracing::warn!("Worker for {} has stopped, dropping datagram", source);
                }
            }
            FullQueuePolicy::Drop => match tx.try_send(bytes) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        "Queue for {} is full ({} pending), dropping datagram",
                        source,
                        self.queue_depth
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::warn!("Worker for {} has stopped, dropping datagram", source);
                }
            },
        }
    }

    fn spawn_worker(&self, source: Ipv4Addr) -> mpsc::Sender<Vec<u8>> {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(self.queue_depth);
        let engine = self.engine.clone();
        let mut policy = DelayPolicy::new(self.ceiling_ms);

        tracing::info!("New source {}, starting worker", source);
        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                engine
                    .process(source, &bytes, || policy.next_delay())
                    .await;
            }
        });
        tx
    }

    async fn process_inline(&self, map: &DashMap<Ipv4Addr, DelayPolicy>, datagram: Datagram) {
        let source = datagram.source;
        let ceiling_ms = self.ceiling_ms;

        map.entry(source).or_insert_with(|| {
            tracing::info!("New source {}", source);
            DelayPolicy::new(ceiling_ms)
        });

        // The entry guard lives only inside the closure, never across the sleep.
        self.engine
            .process(source, &datagram.bytes, || {
                map.entry(source)
                    .or_insert_with(|| DelayPolicy::new(ceiling_ms))
                    .next_delay()
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::testing::{echo_request, RecordingTransport, SentPacket};
    use slowping_common::{verify, IcmpHeader, ICMP_ECHO_REPLY, ICMP_HEADER_LEN};
    use std::time::Duration;
    use tokio::time::{sleep, Instant};

    const A: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
    const B: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 7);

    fn new_dispatcher(
        mode: DispatchMode,
        ceiling_ms: u64,
        queue_depth: usize,
        full_queue: FullQueuePolicy,
    ) -> (Dispatcher<RecordingTransport>, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let config = Config {
            mode,
            ceiling_ms,
            queue_depth,
            full_queue,
            ..Config::default()
        };
        let dispatcher = Dispatcher::new(ReplyEngine::new(transport.clone()), &config);
        (dispatcher, transport)
    }

    fn datagram(source: Ipv4Addr, bytes: Vec<u8>) -> Datagram {
        Datagram { source, bytes }
    }

    /// Time between successive replies, the first measured from `start`.
    fn gaps(start: Instant, sent: &[SentPacket]) -> Vec<Duration> {
        let mut prev = start;
        sent.iter()
            .map(|p| {
                let gap = p.at.duration_since(prev);
                prev = p.at;
                gap
            })
            .collect()
    }

    fn assert_gaps_follow(gaps: &[Duration], expected_ms: &[u64]) {
        assert_eq!(gaps.len(), expected_ms.len());
        for (gap, ms) in gaps.iter().zip(expected_ms) {
            let want = Duration::from_millis(*ms);
            assert!(
                *gap >= want && *gap < want + Duration::from_millis(2),
                "gap {:?}, expected about {:?}",
                gap,
                want
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_replies_in_order_with_doubling_delay() {
        let (dispatcher, transport) = new_dispatcher(DispatchMode::Worker, 8, 100, FullQueuePolicy::Block);
        let start = Instant::now();

        for seq in 0..6u16 {
            let payload = format!("payload-{}", seq);
            dispatcher
                .dispatch(datagram(A, echo_request(0x42, seq, payload.as_bytes())))
                .await;
        }
        sleep(Duration::from_secs(1)).await;

        let sent = transport.sent_to(A);
        assert_eq!(sent.len(), 6);
        assert_gaps_follow(&gaps(start, &sent), &[1, 2, 4, 8, 1, 2]);

        for (seq, packet) in sent.iter().enumerate() {
            let header = IcmpHeader::decode(&packet.bytes).unwrap();
            assert_eq!(header.icmp_type, ICMP_ECHO_REPLY);
            assert_eq!(header.identifier, 0x42);
            assert_eq!(header.sequence, seq as u16);
            assert_eq!(
                &packet.bytes[ICMP_HEADER_LEN..],
                format!("payload-{}", seq).as_bytes()
            );
            assert!(verify(&packet.bytes));
        }
        assert_eq!(dispatcher.sources(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_sources_are_independent() {
        let (dispatcher, transport) =
            new_dispatcher(DispatchMode::Worker, 1_048_576, 100, FullQueuePolicy::Block);
        let start = Instant::now();

        for seq in 0..3u16 {
            dispatcher.dispatch(datagram(A, echo_request(1, seq, b"a"))).await;
            dispatcher.dispatch(datagram(B, echo_request(2, seq, b"b"))).await;
        }
        sleep(Duration::from_secs(1)).await;

        assert_eq!(dispatcher.sources(), 2);
        for (source, id) in [(A, 1u16), (B, 2u16)] {
            let sent = transport.sent_to(source);
            assert_eq!(sent.len(), 3);
            // Each source runs its own 1, 2, 4 chain in parallel with the other.
            assert_gaps_follow(&gaps(start, &sent), &[1, 2, 4]);
            for (seq, packet) in sent.iter().enumerate() {
                let header = IcmpHeader::decode(&packet.bytes).unwrap();
                assert_eq!(header.identifier, id);
                assert_eq!(header.sequence, seq as u16);
                assert!(verify(&packet.bytes));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_inline_serializes_all_sources() {
        let (dispatcher, transport) =
            new_dispatcher(DispatchMode::Inline, 1_048_576, 100, FullQueuePolicy::Block);
        let start = Instant::now();

        for seq in 0..3u16 {
            dispatcher.dispatch(datagram(A, echo_request(1, seq, b"a"))).await;
            dispatcher.dispatch(datagram(B, echo_request(2, seq, b"b"))).await;
        }

        // Everything is done by the time dispatch returns.
        let sent = transport.sent();
        assert_eq!(sent.len(), 6);
        assert_eq!(dispatcher.sources(), 2);

        let order: Vec<Ipv4Addr> = sent.iter().map(|p| p.dest).collect();
        assert_eq!(order, vec![A, B, A, B, A, B]);
        // Per-source delays still double independently, but the sleeps add up.
        assert_gaps_follow(&gaps(start, &sent), &[1, 1, 2, 2, 4, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_echo_and_malformed_do_not_advance_delay() {
        for mode in [DispatchMode::Worker, DispatchMode::Inline] {
            let (dispatcher, transport) = new_dispatcher(mode, 1_048_576, 100, FullQueuePolicy::Block);
            let start = Instant::now();

            let mut echo_reply = echo_request(5, 0, b"");
            echo_reply[0] = ICMP_ECHO_REPLY;
            dispatcher.dispatch(datagram(A, echo_reply)).await;
            dispatcher.dispatch(datagram(A, vec![8, 0, 0])).await;
            dispatcher.dispatch(datagram(A, vec![13, 0, 0, 0, 0, 0, 0, 0])).await;
            dispatcher.dispatch(datagram(A, echo_request(5, 1, b""))).await;
            dispatcher.dispatch(datagram(A, echo_request(5, 2, b""))).await;
            sleep(Duration::from_secs(1)).await;

            let sent = transport.sent_to(A);
            assert_eq!(sent.len(), 2, "mode {:?}", mode);
            assert_gaps_follow(&gaps(start, &sent), &[1, 2]);
            let seqs: Vec<u16> = sent
                .iter()
                .map(|p| IcmpHeader::decode(&p.bytes).unwrap().sequence)
                .collect();
            assert_eq!(seqs, vec![1, 2]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_policy_discards_when_queue_full() {
        let (dispatcher, transport) = new_dispatcher(DispatchMode::Worker, 1_048_576, 1, FullQueuePolicy::Drop);

        // No await point yields to the worker, so only the first fits.
        for seq in 0..4u16 {
            dispatcher.dispatch(datagram(A, echo_request(3, seq, b""))).await;
        }
        sleep(Duration::from_secs(1)).await;

        let sent = transport.sent_to(A);
        assert_eq!(sent.len(), 1);
        assert_eq!(IcmpHeader::decode(&sent[0].bytes).unwrap().sequence, 0);

        // The source keeps being served afterwards.
        dispatcher.dispatch(datagram(A, echo_request(3, 9, b""))).await;
        sleep(Duration::from_secs(1)).await;
        let sent = transport.sent_to(A);
        assert_eq!(sent.len(), 2);
        assert_eq!(IcmpHeader::decode(&sent[1].bytes).unwrap().sequence, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_policy_waits_for_space() {
        let (dispatcher, transport) = new_dispatcher(DispatchMode::Worker, 1_048_576, 1, FullQueuePolicy::Block);

        for seq in 0..4u16 {
            dispatcher.dispatch(datagram(A, echo_request(3, seq, b""))).await;
        }
        sleep(Duration::from_secs(1)).await;

        let seqs: Vec<u16> = transport
            .sent_to(A)
            .iter()
            .map(|p| IcmpHeader::decode(&p.bytes).unwrap().sequence)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
    }
}
