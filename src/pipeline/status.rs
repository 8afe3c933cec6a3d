//! Cross-thread status channel between pipeline workers and the control thread

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// A video encoder session hit an unrecoverable engine error.
pub const ERR_VIDEO_ENCODE: i32 = -1;
/// An audio encoder session hit an unrecoverable engine error.
pub const ERR_AUDIO_ENCODE: i32 = -2;
/// The transport session failed while sending.
pub const ERR_TRANSPORT_SEND: i32 = -3;

/// Asynchronous notification from a pipeline worker to the control thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusMessage {
    /// Unrecoverable failure somewhere in the pipeline, with a numeric code
    /// from the `ERR_*` constants and a human-readable detail string.
    FatalError { code: i32, detail: String },

    /// The push queue exceeded its configured duration bound.
    QueueDurationReport { audio: Duration, video: Duration },
}

/// Result of a [`StatusChannel::get`] call.
#[derive(Debug)]
pub enum Recv {
    /// A message was dequeued.
    Message(StatusMessage),
    /// The timeout elapsed with no message available.
    Timeout,
    /// The channel was aborted; no further messages will arrive.
    Aborted,
}

struct Shared {
    queue: Mutex<VecDeque<StatusMessage>>,
    cond: Condvar,
    aborted: AtomicBool,
    capacity: usize,
}

/// Bounded message channel from pipeline workers to the control thread.
///
/// Producers never block: when the queue is full, the oldest queue-duration
/// report is shed first (fatal errors are only dropped when nothing else
/// remains to shed). The consumer blocks up to a caller-supplied timeout.
/// `abort()` is the terminal cue: it wakes every waiter and makes all
/// subsequent receives return [`Recv::Aborted`] once the queue drains.
#[derive(Clone)]
pub struct StatusChannel {
    shared: Arc<Shared>,
}

impl StatusChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                cond: Condvar::new(),
                aborted: AtomicBool::new(false),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Enqueue a message without blocking. Returns false when the channel
    /// has been aborted and the message was discarded.
    pub fn post(&self, msg: StatusMessage) -> bool {
        if self.is_aborted() {
            return false;
        }

        let mut queue = match self.shared.queue.lock() {
            Ok(queue) => queue,
            Err(_) => return false,
        };

        if queue.len() >= self.shared.capacity {
            // Shed a report before ever touching a fatal error.
            let victim = queue
                .iter()
                .position(|m| matches!(m, StatusMessage::QueueDurationReport { .. }))
                .unwrap_or(0);
            queue.remove(victim);
        }

        queue.push_back(msg);
        drop(queue);
        self.shared.cond.notify_one();
        true
    }

    /// Dequeue the next message, waiting up to `timeout`.
    pub fn get(&self, timeout: Duration) -> Recv {
        let deadline = Instant::now() + timeout;

        let mut queue = match self.shared.queue.lock() {
            Ok(queue) => queue,
            Err(_) => return Recv::Aborted,
        };

        loop {
            if let Some(msg) = queue.pop_front() {
                return Recv::Message(msg);
            }
            if self.is_aborted() {
                return Recv::Aborted;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Recv::Timeout;
            }

            let (guard, result) = match self.shared.cond.wait_timeout(queue, remaining) {
                Ok(pair) => pair,
                Err(_) => return Recv::Aborted,
            };
            queue = guard;
            if result.timed_out() && queue.is_empty() {
                return if self.is_aborted() {
                    Recv::Aborted
                } else {
                    Recv::Timeout
                };
            }
        }
    }

    /// Terminally close the channel, waking every blocked receiver.
    pub fn abort(&self) {
        self.shared.aborted.store(true, Ordering::Relaxed);

        // Lock briefly so waiters cannot miss the wakeup between their
        // abort check and the wait.
        let _guard = self.shared.queue.lock();
        self.shared.cond.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_post_then_get() {
        let channel = StatusChannel::new(8);
        channel.post(StatusMessage::FatalError {
            code: ERR_TRANSPORT_SEND,
            detail: "peer closed".into(),
        });

        match channel.get(Duration::from_millis(100)) {
            Recv::Message(StatusMessage::FatalError { code, .. }) => {
                assert_eq!(code, ERR_TRANSPORT_SEND);
            }
            other => panic!("expected fatal error, got {:?}", other),
        }
    }

    #[test]
    fn test_get_times_out() {
        let channel = StatusChannel::new(8);
        let started = Instant::now();
        assert!(matches!(
            channel.get(Duration::from_millis(50)),
            Recv::Timeout
        ));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_abort_wakes_blocked_receiver() {
        let channel = StatusChannel::new(8);
        let receiver = channel.clone();

        let handle = thread::spawn(move || receiver.get(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(50));
        channel.abort();

        assert!(matches!(handle.join().unwrap(), Recv::Aborted));
        assert!(!channel.post(StatusMessage::QueueDurationReport {
            audio: Duration::ZERO,
            video: Duration::ZERO,
        }));
    }

    #[test]
    fn test_full_channel_sheds_reports_before_errors() {
        let channel = StatusChannel::new(2);
        channel.post(StatusMessage::QueueDurationReport {
            audio: Duration::from_millis(1),
            video: Duration::ZERO,
        });
        channel.post(StatusMessage::FatalError {
            code: ERR_VIDEO_ENCODE,
            detail: "engine".into(),
        });
        // Overflows the capacity of 2: the report must go, not the error.
        channel.post(StatusMessage::QueueDurationReport {
            audio: Duration::from_millis(2),
            video: Duration::ZERO,
        });

        match channel.get(Duration::from_millis(10)) {
            Recv::Message(StatusMessage::FatalError { code, .. }) => {
                assert_eq!(code, ERR_VIDEO_ENCODE)
            }
            other => panic!("fatal error must survive shedding, got {:?}", other),
        }
        assert!(matches!(
            channel.get(Duration::from_millis(10)),
            Recv::Message(StatusMessage::QueueDurationReport { audio, .. })
                if audio == Duration::from_millis(2)
        ));
    }

    #[test]
    fn test_drains_queued_messages_after_abort() {
        let channel = StatusChannel::new(8);
        channel.post(StatusMessage::FatalError {
            code: ERR_AUDIO_ENCODE,
            detail: "late".into(),
        });
        channel.abort();

        assert!(matches!(
            channel.get(Duration::from_millis(10)),
            Recv::Message(_)
        ));
        assert!(matches!(
            channel.get(Duration::from_millis(10)),
            Recv::Aborted
        ));
    }
}
