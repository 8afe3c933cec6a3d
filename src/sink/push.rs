//! Bounded push queue in front of the transport session
//!
//! Producers (the capture callbacks) enqueue packets without ever blocking;
//! a transmit task drains the queue into the transport. Buffered duration is
//! bounded per modality: when a queue exceeds `max_queue_duration` the sink
//! reports the depth on the status channel and sheds oldest non-keyframe
//! packets first. Transport failures are reported asynchronously, never
//! returned to a producer.

use log::{error, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::pipeline::health::PipelineHealth;
use crate::pipeline::status::{ERR_TRANSPORT_SEND, StatusChannel, StatusMessage};
use crate::pipeline::types::{EncodedPacket, MediaKind};
use crate::sink::transport::TransportSession;

/// Queue-duration reports are repeated at most this often while the bound
/// stays exceeded.
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// How long `close` waits for the transmit task to drain before giving up.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

struct Queues {
    audio: VecDeque<(u64, EncodedPacket)>,
    video: VecDeque<(u64, EncodedPacket)>,
    audio_depth: Duration,
    video_depth: Duration,
    next_seq: u64,
    /// False until connected and again after a transport failure;
    /// packets pushed while closed are counted as drops.
    open: bool,
    last_report: Option<Instant>,
}

struct SinkShared {
    queues: Mutex<Queues>,
    notify: Notify,
    status: StatusChannel,
    health: Arc<PipelineHealth>,
    max_queue_duration: Duration,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Handle to the push sink. Clones share the same queue; one clone stays
/// with the coordinator for lifecycle calls while others go to the
/// per-modality frame handlers.
#[derive(Clone)]
pub struct PushSink {
    shared: Arc<SinkShared>,
    cancel: CancellationToken,
    handle: Handle,
}

impl PushSink {
    pub fn new(
        max_queue_duration: Duration,
        status: StatusChannel,
        health: Arc<PipelineHealth>,
        handle: Handle,
    ) -> Self {
        Self {
            shared: Arc::new(SinkShared {
                queues: Mutex::new(Queues {
                    audio: VecDeque::new(),
                    video: VecDeque::new(),
                    audio_depth: Duration::ZERO,
                    video_depth: Duration::ZERO,
                    next_seq: 0,
                    open: false,
                    last_report: None,
                }),
                notify: Notify::new(),
                status,
                health,
                max_queue_duration,
                worker: Mutex::new(None),
            }),
            cancel: CancellationToken::new(),
            handle,
        }
    }

    /// Connect the transport and start the transmit task. Called from the
    /// init path, outside the runtime; connect failures propagate
    /// synchronously and abort startup.
    pub fn connect(&self, mut transport: Box<dyn TransportSession>) -> anyhow::Result<()> {
        self.handle.block_on(transport.connect())?;

        if let Ok(mut queues) = self.shared.queues.lock() {
            queues.open = true;
        }

        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        let worker = self
            .handle
            .spawn(async move { transmit_loop(shared, transport, cancel).await });
        if let Ok(mut slot) = self.shared.worker.lock() {
            *slot = Some(worker);
        }
        Ok(())
    }

    /// Enqueue one packet. Never blocks the calling thread beyond the queue
    /// lock; excess buildup is shed here, transmission errors surface on the
    /// status channel.
    pub fn push(&self, packet: EncodedPacket) {
        let Ok(mut queues) = self.shared.queues.lock() else {
            return;
        };

        if !queues.open {
            self.shared.health.record_drop();
            return;
        }

        let seq = queues.next_seq;
        queues.next_seq += 1;
        match packet.kind {
            MediaKind::Audio => {
                queues.audio_depth += packet.duration;
                queues.audio.push_back((seq, packet));
            }
            MediaKind::Video => {
                queues.video_depth += packet.duration;
                queues.video.push_back((seq, packet));
            }
        }

        let bound = self.shared.max_queue_duration;
        let q = &mut *queues;
        if q.audio_depth > bound || q.video_depth > bound {
            self.report_depth(q);

            let dropped = shed(&mut q.audio, &mut q.audio_depth, bound)
                + shed(&mut q.video, &mut q.video_depth, bound);
            for _ in 0..dropped {
                self.shared.health.record_drop();
            }
            if dropped > 0 {
                warn!("push queue over {:?}, shed {} packets", bound, dropped);
            }
        }

        drop(queues);
        self.shared.notify.notify_one();
    }

    /// Stop the transmit task, draining what it can, and drop the queue.
    pub fn close(&self) {
        self.cancel.cancel();
        self.shared.notify.notify_one();

        let worker = self
            .shared
            .worker
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(worker) = worker {
            let result = self
                .handle
                .block_on(async { tokio::time::timeout(CLOSE_GRACE, worker).await });
            if result.is_err() {
                warn!("transmit task did not drain within {:?}", CLOSE_GRACE);
            }
        }

        if let Ok(mut queues) = self.shared.queues.lock() {
            queues.open = false;
            queues.audio.clear();
            queues.video.clear();
            queues.audio_depth = Duration::ZERO;
            queues.video_depth = Duration::ZERO;
        }
    }

    /// Current buffered duration per modality (audio, video).
    pub fn queue_depths(&self) -> (Duration, Duration) {
        self.shared
            .queues
            .lock()
            .map(|q| (q.audio_depth, q.video_depth))
            .unwrap_or((Duration::ZERO, Duration::ZERO))
    }

    fn report_depth(&self, queues: &mut Queues) {
        let due = queues
            .last_report
            .is_none_or(|at| at.elapsed() >= REPORT_INTERVAL);
        if due {
            queues.last_report = Some(Instant::now());
            self.shared.status.post(StatusMessage::QueueDurationReport {
                audio: queues.audio_depth,
                video: queues.video_depth,
            });
        }
    }
}

/// Drop oldest non-keyframe packets until the queue fits its bound again.
/// A keyframe is only dropped when nothing else remains to shed, and never
/// the last packet standing.
fn shed(
    queue: &mut VecDeque<(u64, EncodedPacket)>,
    depth: &mut Duration,
    bound: Duration,
) -> usize {
    let mut dropped = 0;
    while *depth > bound {
        let victim = match queue.iter().position(|(_, p)| !p.keyframe) {
            Some(idx) => idx,
            None if queue.len() > 1 => 0,
            None => break,
        };
        match queue.remove(victim) {
            Some((_, packet)) => {
                *depth = depth.saturating_sub(packet.duration);
                dropped += 1;
            }
            None => break,
        }
    }
    dropped
}

fn pop_next(queues: &mut Queues) -> Option<EncodedPacket> {
    let take_audio = match (queues.audio.front(), queues.video.front()) {
        (Some((a, _)), Some((v, _))) => a < v,
        (Some(_), None) => true,
        (None, _) => false,
    };

    let (queue, depth) = if take_audio {
        (&mut queues.audio, &mut queues.audio_depth)
    } else {
        (&mut queues.video, &mut queues.video_depth)
    };
    queue.pop_front().map(|(_, packet)| {
        *depth = depth.saturating_sub(packet.duration);
        packet
    })
}

async fn transmit_loop(
    shared: Arc<SinkShared>,
    mut transport: Box<dyn TransportSession>,
    cancel: CancellationToken,
) {
    info!("transmit task started");
    loop {
        let packet = match shared.queues.lock() {
            Ok(mut queues) => pop_next(&mut queues),
            Err(_) => break,
        };

        match packet {
            Some(packet) => {
                if let Err(e) = transport.send(&packet).await {
                    error!("push transport failed: {e:#}");
                    shared.health.record_network_error();
                    shared.status.post(StatusMessage::FatalError {
                        code: ERR_TRANSPORT_SEND,
                        detail: format!("{e:#}"),
                    });
                    if let Ok(mut queues) = shared.queues.lock() {
                        queues.open = false;
                        queues.audio.clear();
                        queues.video.clear();
                        queues.audio_depth = Duration::ZERO;
                        queues.video_depth = Duration::ZERO;
                    }
                    break;
                }
                shared.health.record_sent(packet.size(), packet.keyframe);
            }
            None => {
                // Queue drained: on shutdown that means we are done,
                // otherwise wait for the next producer.
                if cancel.is_cancelled() {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = shared.notify.notified() => {}
                }
            }
        }
    }
    transport.close().await;
    info!("transmit task finished");
}
