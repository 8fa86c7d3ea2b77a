//! Heartbeat framing for long-lived streaming responses.
//!
//! Wraps a lazy stream so that the consumer sees a heartbeat immediately, then
//! again after every `interval` without output. The source is driven by a
//! spawned task feeding a bounded channel; dropping the receiving end stops
//! the task and drops the source (closing its cursor).

use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// Frames sent in-flight before the source produces output.
const FRAME_BUFFER: usize = 16;

/// One unit of a heartbeat-framed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<T> {
    Heartbeat,
    Item(T),
}

impl<T> Frame<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Frame<U> {
        match self {
            Frame::Heartbeat => Frame::Heartbeat,
            Frame::Item(item) => Frame::Item(f(item)),
        }
    }
}

/// Interleave heartbeats with the items of `source`.
///
/// The stream ends after `source` ends, or right after forwarding the first
/// error.
pub fn with_heartbeats<T, E>(
    source: BoxStream<'static, Result<T, E>>,
    interval: Duration,
) -> ReceiverStream<Result<Frame<T>, E>>
where
    T: Send + 'static,
    E: Send + 'static,
{
    let (tx, rx) = mpsc::channel(FRAME_BUFFER);

    tokio::spawn(async move {
        if tx.send(Ok(Frame::Heartbeat)).await.is_err() {
            return;
        }

        let mut source = source;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = tx.closed() => {
                    debug!("stream consumer went away");
                    break;
                }
                next = source.next() => match next {
                    Some(Ok(item)) => {
                        if tx.send(Ok(Frame::Item(item))).await.is_err() {
                            break;
                        }
                        ticker.reset();
                    }
                    Some(Err(err)) => {
                        let _ = tx.send(Err(err)).await;
                        break;
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if tx.send(Ok(Frame::Heartbeat)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    ReceiverStream::new(rx)
}
