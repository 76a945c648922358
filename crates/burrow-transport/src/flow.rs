//! Per-stream flow control
//!
//! Each side may buffer at most [`STREAM_WINDOW`] unread bytes per stream.
//! A writer spends send credit for every byte it writes and waits once the
//! credit is gone; the reader hands credit back with window-update frames as
//! the application consumes data.

use burrow_proto::STREAM_WINDOW;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll, Waker};

#[derive(Debug)]
struct SendCredit {
    available: u32,
    waker: Option<Waker>,
    reset: bool,
}

/// Flow-control state shared by a stream and the session dispatching to it
#[derive(Debug)]
pub(crate) struct FlowControl {
    send: Mutex<SendCredit>,
    /// Bytes received and not yet read by the application
    buffered: AtomicU32,
}

impl FlowControl {
    pub(crate) fn new() -> Self {
        Self {
            send: Mutex::new(SendCredit {
                available: STREAM_WINDOW,
                waker: None,
                reset: false,
            }),
            buffered: AtomicU32::new(0),
        }
    }

    /// Wait until the peer allows at least one more byte
    pub(crate) fn poll_send_credit(&self, cx: &mut Context<'_>) -> Poll<io::Result<u32>> {
        let mut send = self.send.lock().unwrap_or_else(PoisonError::into_inner);

        if send.reset {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "stream reset",
            )));
        }
        if send.available > 0 {
            return Poll::Ready(Ok(send.available));
        }

        send.waker = Some(cx.waker().clone());
        Poll::Pending
    }

    pub(crate) fn spend(&self, n: u32) {
        let mut send = self.send.lock().unwrap_or_else(PoisonError::into_inner);
        send.available = send.available.saturating_sub(n);
    }

    /// Credit granted by a window update from the peer
    pub(crate) fn grant(&self, delta: u32) {
        let mut send = self.send.lock().unwrap_or_else(PoisonError::into_inner);
        send.available = send.available.saturating_add(delta);
        if let Some(waker) = send.waker.take() {
            waker.wake();
        }
    }

    /// Fail any pending or future write
    pub(crate) fn reset(&self) {
        let mut send = self.send.lock().unwrap_or_else(PoisonError::into_inner);
        send.reset = true;
        if let Some(waker) = send.waker.take() {
            waker.wake();
        }
    }

    /// Account for `len` inbound bytes; `false` if they overrun the window
    pub(crate) fn receive(&self, len: u32) -> bool {
        let previous = self.buffered.fetch_add(len, Ordering::AcqRel);
        if previous.saturating_add(len) > STREAM_WINDOW {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// The application read `n` buffered bytes
    pub(crate) fn consume(&self, n: u32) {
        self.buffered.fetch_sub(n, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::poll_fn;

    #[tokio::test]
    async fn test_writer_waits_for_grant() {
        let flow = std::sync::Arc::new(FlowControl::new());

        let credit = poll_fn(|cx| flow.poll_send_credit(cx)).await.unwrap();
        assert_eq!(credit, STREAM_WINDOW);
        flow.spend(STREAM_WINDOW);

        let waiter = {
            let flow = flow.clone();
            tokio::spawn(async move { poll_fn(|cx| flow.poll_send_credit(cx)).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        flow.grant(1024);
        assert_eq!(waiter.await.unwrap().unwrap(), 1024);
    }

    #[tokio::test]
    async fn test_reset_fails_waiting_writer() {
        let flow = std::sync::Arc::new(FlowControl::new());
        flow.spend(STREAM_WINDOW);

        let waiter = {
            let flow = flow.clone();
            tokio::spawn(async move { poll_fn(|cx| flow.poll_send_credit(cx)).await })
        };
        tokio::task::yield_now().await;

        flow.reset();
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn test_receive_window_overrun() {
        let flow = FlowControl::new();

        assert!(flow.receive(STREAM_WINDOW - 10));
        assert!(!flow.receive(11));
        assert!(flow.receive(10));

        flow.consume(100);
        assert!(flow.receive(100));
        assert!(!flow.receive(1));
    }
}
