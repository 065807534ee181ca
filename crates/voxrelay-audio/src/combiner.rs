//! Outbound audio combiner.
//!
//! Speech engines stream synthesized audio as many small chunks of uneven
//! size. Forwarding each one as its own client message makes browser
//! playback stutter, so the combiner queues them and releases one
//! contiguous frame at most `flush_interval` after the first queued chunk.
//!
//! The queue is flushed on three triggers:
//! - the flush deadline elapses (the caller waits on [`AudioCombiner::deadline`]),
//! - the engine signals the end of its turn (the caller calls [`AudioCombiner::flush`]),
//! - the queued size reaches `max_buffered_bytes` ([`AudioCombiner::push`] returns the frame).

use crate::config::CombinerConfig;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use tokio::time::Instant;
use voxrelay_types::{AudioFormat, AudioFrame};

#[derive(Debug)]
pub struct AudioCombiner {
    config: CombinerConfig,
    format: AudioFormat,
    queue: VecDeque<Bytes>,
    queued_bytes: usize,
    deadline: Option<Instant>,
}

impl AudioCombiner {
    pub fn new(config: CombinerConfig, format: AudioFormat) -> Self {
        Self {
            config,
            format,
            queue: VecDeque::new(),
            queued_bytes: 0,
            deadline: None,
        }
    }

    /// Queues an engine frame.
    ///
    /// Empty frames are ignored. Returns the combined frame when the queue
    /// reached the configured size ceiling and had to be flushed early.
    pub fn push(&mut self, frame: AudioFrame) -> Option<AudioFrame> {
        if frame.is_empty() {
            return None;
        }
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.config.flush_interval());
        }
        self.queued_bytes += frame.len();
        self.queue.push_back(frame.into_data());

        if self.queued_bytes >= self.config.max_buffered_bytes {
            tracing::debug!(
                queued_bytes = self.queued_bytes,
                "combiner reached size ceiling, flushing early"
            );
            return self.flush();
        }
        None
    }

    /// Concatenates everything queued into one frame and clears the queue.
    ///
    /// Returns `None` when nothing is queued.
    pub fn flush(&mut self) -> Option<AudioFrame> {
        self.deadline = None;
        if self.queue.is_empty() {
            return None;
        }

        let combined = if self.queue.len() == 1 {
            self.queue.pop_front().unwrap_or_default()
        } else {
            let mut buf = BytesMut::with_capacity(self.queued_bytes);
            for chunk in self.queue.drain(..) {
                buf.extend_from_slice(&chunk);
            }
            buf.freeze()
        };
        self.queued_bytes = 0;

        Some(AudioFrame::outbound(combined, self.format))
    }

    /// Drops everything queued without emitting it. Returns the bytes dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.queued_bytes;
        self.queue.clear();
        self.queued_bytes = 0;
        self.deadline = None;
        dropped
    }

    /// When the current queue must be flushed, if anything is queued.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }
}

/// Sleeps until `deadline`, or forever when there is none.
///
/// Meant as a `tokio::select!` branch next to the engine event stream so an
/// idle combiner never wakes its task.
pub async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn format() -> AudioFormat {
        AudioFormat::mono(24_000)
    }

    fn chunk(bytes: &[u8]) -> AudioFrame {
        AudioFrame::outbound(bytes.to_vec(), format())
    }

    #[test]
    fn empty_queue_flushes_nothing() {
        let mut combiner = AudioCombiner::new(CombinerConfig::default(), format());
        assert!(combiner.flush().is_none());
        assert!(combiner.deadline().is_none());
    }

    #[test]
    fn empty_frames_are_never_queued() {
        let mut combiner = AudioCombiner::new(CombinerConfig::default(), format());
        assert!(combiner.push(chunk(&[])).is_none());
        assert!(combiner.is_empty());
        assert!(combiner.deadline().is_none());
        assert!(combiner.flush().is_none());
    }

    #[tokio::test]
    async fn burst_combines_into_one_frame_in_order() {
        let mut combiner = AudioCombiner::new(CombinerConfig::default(), format());
        for i in 0..10u8 {
            assert!(combiner.push(chunk(&[i, i])).is_none());
        }
        assert_eq!(combiner.queued_bytes(), 20);

        let frame = combiner.flush().expect("queued audio should flush");
        let expected: Vec<u8> = (0..10u8).flat_map(|i| [i, i]).collect();
        assert_eq!(frame.data().as_ref(), expected.as_slice());
        assert!(combiner.is_empty());
        assert!(combiner.flush().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_is_set_by_first_frame_only() {
        let config = CombinerConfig {
            flush_interval_ms: 100,
            ..CombinerConfig::default()
        };
        let mut combiner = AudioCombiner::new(config, format());
        let start = Instant::now();

        combiner.push(chunk(&[1, 2]));
        let first = combiner.deadline().expect("deadline after first frame");
        assert_eq!(first, start + Duration::from_millis(100));

        tokio::time::advance(Duration::from_millis(40)).await;
        combiner.push(chunk(&[3, 4]));
        assert_eq!(combiner.deadline(), Some(first));

        sleep_until_deadline(combiner.deadline()).await;
        assert_eq!(Instant::now(), first);
        assert_eq!(combiner.flush().unwrap().len(), 4);
        assert!(combiner.deadline().is_none());
    }

    #[tokio::test]
    async fn size_ceiling_flushes_early() {
        let config = CombinerConfig {
            flush_interval_ms: 100,
            max_buffered_bytes: 6,
        };
        let mut combiner = AudioCombiner::new(config, format());
        assert!(combiner.push(chunk(&[0; 4])).is_none());
        let flushed = combiner.push(chunk(&[1; 4])).expect("ceiling reached");
        assert_eq!(flushed.len(), 8);
        assert!(combiner.is_empty());
    }

    #[tokio::test]
    async fn discard_drops_queue() {
        let mut combiner = AudioCombiner::new(CombinerConfig::default(), format());
        combiner.push(chunk(&[9; 10]));
        assert_eq!(combiner.discard(), 10);
        assert!(combiner.flush().is_none());
    }
}
