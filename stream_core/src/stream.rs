//! Producer/consumer stream primitive.
//!
//! A generation worker runs on a blocking thread and pushes audio through a
//! [`FragmentSink`]; the session loop pulls from the paired
//! [`FragmentStream`] with a timeout. End of stream is explicit
//! (`finish`/`fail`) and is also implied when either side is dropped or the
//! consumer closes its end.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::fragment::Fragment;

/// Cooperative cancellation flag shared by the coordinator and the worker.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// What travels from the worker to the session loop.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Fragment(Fragment),
    Finished,
    Failed(String),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SinkError {
    #[error("generation was cancelled")]
    Cancelled,
    #[error("stream closed by consumer")]
    Closed,
}

enum EventSender {
    Bounded(mpsc::Sender<StreamEvent>),
    Unbounded(mpsc::UnboundedSender<StreamEvent>),
}

enum EventReceiver {
    Bounded(mpsc::Receiver<StreamEvent>),
    Unbounded(mpsc::UnboundedReceiver<StreamEvent>),
}

/// Create a connected sink/stream pair.
///
/// With `capacity = None` the channel is unbounded; with a capacity,
/// [`FragmentSink::push`] blocks the producer thread while the buffer is
/// full.
pub fn fragment_channel(cancel: CancelToken, capacity: Option<usize>) -> (FragmentSink, FragmentStream) {
    let (tx, rx) = match capacity {
        Some(cap) => {
            let (tx, rx) = mpsc::channel(cap.max(1));
            (EventSender::Bounded(tx), EventReceiver::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (EventSender::Unbounded(tx), EventReceiver::Unbounded(rx))
        }
    };
    (
        FragmentSink {
            tx,
            cancel,
            next_index: AtomicU64::new(0),
        },
        FragmentStream { rx },
    )
}

/// Producer half. Must only be used from a blocking (non-async) thread
/// when the channel is bounded.
pub struct FragmentSink {
    tx: EventSender,
    cancel: CancelToken,
    next_index: AtomicU64,
}

impl FragmentSink {
    /// Push one fragment of generated audio. Empty buffers are skipped.
    ///
    /// An error means the producer should stop generating.
    pub fn push(&self, samples: impl Into<Arc<[f32]>>) -> Result<(), SinkError> {
        if self.cancel.is_cancelled() {
            return Err(SinkError::Cancelled);
        }
        let samples: Arc<[f32]> = samples.into();
        if samples.is_empty() {
            return Ok(());
        }
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        self.send(StreamEvent::Fragment(Fragment::new(index, samples)))
    }

    /// Signal normal completion.
    pub fn finish(&self) {
        let _ = self.send(StreamEvent::Finished);
    }

    /// Signal a generation error. Ends the stream.
    pub fn fail(&self, message: impl Into<String>) {
        let _ = self.send(StreamEvent::Failed(message.into()));
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Number of fragments pushed so far.
    pub fn pushed(&self) -> u64 {
        self.next_index.load(Ordering::Relaxed)
    }

    fn send(&self, event: StreamEvent) -> Result<(), SinkError> {
        match &self.tx {
            EventSender::Bounded(tx) => tx.blocking_send(event).map_err(|_| SinkError::Closed),
            EventSender::Unbounded(tx) => tx.send(event).map_err(|_| SinkError::Closed),
        }
    }
}

/// Result of one pull from the stream.
#[derive(Debug, PartialEq)]
pub enum Recv {
    Event(StreamEvent),
    /// Nothing arrived within the wait; not an error.
    Timeout,
    /// Producer side dropped without further events.
    Closed,
}

/// Consumer half.
pub struct FragmentStream {
    rx: EventReceiver,
}

impl FragmentStream {
    pub async fn recv_timeout(&mut self, wait: Duration) -> Recv {
        let next = match &mut self.rx {
            EventReceiver::Bounded(rx) => tokio::time::timeout(wait, rx.recv()).await,
            EventReceiver::Unbounded(rx) => tokio::time::timeout(wait, rx.recv()).await,
        };
        match next {
            Ok(Some(event)) => Recv::Event(event),
            Ok(None) => Recv::Closed,
            Err(_) => Recv::Timeout,
        }
    }

    /// End the stream from the consumer side; later pushes fail with
    /// [`SinkError::Closed`].
    pub fn close(&mut self) {
        match &mut self.rx {
            EventReceiver::Bounded(rx) => rx.close(),
            EventReceiver::Unbounded(rx) => rx.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_assigns_sequential_indices() {
        let (sink, mut stream) = fragment_channel(CancelToken::new(), None);
        sink.push(vec![0.1f32; 4]).unwrap();
        sink.push(Vec::<f32>::new()).unwrap();
        sink.push(vec![0.2f32; 2]).unwrap();
        sink.finish();
        assert_eq!(sink.pushed(), 2);

        let wait = Duration::from_millis(50);
        match stream.recv_timeout(wait).await {
            Recv::Event(StreamEvent::Fragment(f)) => assert_eq!((f.index(), f.len()), (0, 4)),
            other => panic!("unexpected {other:?}"),
        }
        match stream.recv_timeout(wait).await {
            Recv::Event(StreamEvent::Fragment(f)) => assert_eq!((f.index(), f.len()), (1, 2)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(stream.recv_timeout(wait).await, Recv::Event(StreamEvent::Finished));
        drop(sink);
        assert_eq!(stream.recv_timeout(wait).await, Recv::Closed);
    }

    #[tokio::test]
    async fn test_recv_times_out_without_data() {
        let (_sink, mut stream) = fragment_channel(CancelToken::new(), Some(4));
        assert_eq!(stream.recv_timeout(Duration::from_millis(10)).await, Recv::Timeout);
    }

    #[test]
    fn test_push_after_cancel_or_close() {
        let cancel = CancelToken::new();
        let (sink, mut stream) = fragment_channel(cancel.clone(), None);
        stream.close();
        assert_eq!(sink.push(vec![1.0f32]), Err(SinkError::Closed));

        cancel.cancel();
        assert_eq!(sink.push(vec![1.0f32]), Err(SinkError::Cancelled));
    }
}
