//! Outstanding pings and their pong waiters.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// Resolves when the pong answering a ping arrives.
///
/// Fails with [`Error::ConnectionClosed`] if the connection ends first.
#[derive(Debug)]
#[must_use = "a PongWaiter does nothing unless awaited"]
pub struct PongWaiter {
    rx: oneshot::Receiver<Result<()>>,
}

impl Future for PongWaiter {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| {
            res.unwrap_or_else(|_| {
                Err(Error::ConnectionClosed {
                    code: 1006,
                    reason: String::new(),
                })
            })
        })
    }
}

/// Pings waiting for a pong, oldest first.
#[derive(Debug, Default)]
pub(crate) struct PingRegistry {
    waiting: VecDeque<(Vec<u8>, oneshot::Sender<Result<()>>)>,
}

impl PingRegistry {
    pub(crate) fn contains(&self, data: &[u8]) -> bool {
        self.waiting.iter().any(|(d, _)| d == data)
    }

    pub(crate) fn len(&self) -> usize {
        self.waiting.len()
    }

    /// # Errors
    ///
    /// Returns [`Error::DuplicatePing`] if `data` is already waiting.
    pub(crate) fn register(&mut self, data: Vec<u8>) -> Result<PongWaiter> {
        if self.contains(&data) {
            return Err(Error::DuplicatePing);
        }
        let (tx, rx) = oneshot::channel();
        self.waiting.push_back((data, tx));
        Ok(PongWaiter { rx })
    }

    /// Acknowledge the ping matching `data` and every ping sent before it.
    /// Returns how many pings were acknowledged; unsolicited pongs match none.
    pub(crate) fn acknowledge(&mut self, data: &[u8]) -> usize {
        let Some(pos) = self.waiting.iter().position(|(d, _)| d == data) else {
            return 0;
        };
        for (_, tx) in self.waiting.drain(..=pos) {
            let _ = tx.send(Ok(()));
        }
        pos + 1
    }

    /// Fail every waiter with `err`.
    pub(crate) fn abort(&mut self, err: &Error) {
        for (_, tx) in self.waiting.drain(..) {
            let _ = tx.send(Err(err.clone()));
        }
    }
}

/// Four random bytes not currently used by an outstanding ping.
pub(crate) fn unique_payload(registry: &PingRegistry) -> Result<Vec<u8>> {
    loop {
        let mut data = vec![0u8; 4];
        getrandom::getrandom(&mut data).map_err(|e| Error::Io(format!("random source: {e}")))?;
        if !registry.contains(&data) {
            return Ok(data);
        }
    }
}
