//! In-memory transport for session and dispatcher tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bluer::{Address, Uuid};
use tokio::sync::mpsc;

use super::{Transport, TransportError, TransportEvent};

/// What the fake device does after a write.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Send the written bytes back as a notification.
    Echo,
    /// Send these bytes as a notification.
    Bytes(Vec<u8>),
    /// Stay silent.
    Silent,
}

#[derive(Default)]
struct Inner {
    written: Vec<Vec<u8>>,
    replies: VecDeque<Reply>,
    events: Option<mpsc::Sender<TransportEvent>>,
    fail_connect: bool,
    fail_write: bool,
    write_limit: Option<usize>,
    disconnects: usize,
}

/// Test-side handle for inspecting and steering a [`MockTransport`].
#[derive(Clone, Default)]
pub struct MockHandle {
    inner: Arc<Mutex<Inner>>,
}

impl MockHandle {
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().written.clone()
    }

    /// Queue the reply to the next write. With nothing queued, writes are echoed.
    pub fn push_reply(&self, reply: Reply) {
        self.inner.lock().unwrap().replies.push_back(reply);
    }

    pub fn fail_connect(&self) {
        self.inner.lock().unwrap().fail_connect = true;
    }

    pub fn fail_write(&self, fail: bool) {
        self.inner.lock().unwrap().fail_write = fail;
    }

    /// Fail every write once `count` writes have gone through.
    pub fn fail_writes_after(&self, count: usize) {
        self.inner.lock().unwrap().write_limit = Some(count);
    }

    pub fn disconnects(&self) -> usize {
        self.inner.lock().unwrap().disconnects
    }

    /// Deliver an unsolicited notification.
    pub fn notify(&self, data: Vec<u8>) {
        self.emit(TransportEvent::Notification(data));
    }

    pub fn lose_link(&self) {
        self.emit(TransportEvent::LinkLost);
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(tx) = self.inner.lock().unwrap().events.as_ref() {
            let _ = tx.try_send(event);
        }
    }
}

pub struct MockTransport {
    handle: MockHandle,
}

impl MockTransport {
    pub fn new() -> (Self, MockHandle) {
        let handle = MockHandle::default();
        (
            Self {
                handle: handle.clone(),
            },
            handle,
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self, _address: Address) -> Result<(), TransportError> {
        if self.handle.inner.lock().unwrap().fail_connect {
            return Err(TransportError::MissingService(Uuid::nil()));
        }
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let (tx, rx) = mpsc::channel(32);
        self.handle.inner.lock().unwrap().events = Some(tx);
        Ok(rx)
    }

    async fn unsubscribe(&mut self) -> Result<(), TransportError> {
        self.handle.inner.lock().unwrap().events = None;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let reply = {
            let mut inner = self.handle.inner.lock().unwrap();
            let over_limit = inner.write_limit.is_some_and(|limit| inner.written.len() >= limit);
            if inner.fail_write || over_limit {
                return Err(TransportError::NotConnected);
            }
            inner.written.push(data.to_vec());
            inner.replies.pop_front().unwrap_or(Reply::Echo)
        };
        match reply {
            Reply::Echo => self.handle.notify(data.to_vec()),
            Reply::Bytes(bytes) => self.handle.notify(bytes),
            Reply::Silent => {}
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let mut inner = self.handle.inner.lock().unwrap();
        inner.events = None;
        inner.disconnects += 1;
        Ok(())
    }
}
