/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::{
    bounded as cb_bounded, Receiver as CReceiver, RecvTimeoutError, Sender as CSender,
    TrySendError,
};
use thiserror::Error;

use super::stats;

#[derive(Debug, Error, PartialEq)]
pub enum Error<T> {
    #[error("the queue operation has timed out")]
    Timeout,
    #[error("the queue is full")]
    Full(Option<T>),
    #[error("the queue has terminated")]
    Terminated(Option<T>, Option<Vec<T>>),
}

#[derive(Debug, Default)]
struct QueueCounter {
    input: AtomicU64,
    output: AtomicU64,
    terminated: AtomicBool,
}

/// Bounded MPMC queue between pipeline stages. Dropping every `Sender`
/// terminates the queue: receivers drain what is buffered, then see
/// `Error::Terminated`. Sends block while the queue is full.
pub fn bounded<T>(size: usize) -> (Sender<T>, Receiver<T>, StatsHandle<T>) {
    let (s, r) = cb_bounded(size);
    let counter = Arc::new(QueueCounter::default());
    (
        Sender {
            sender: s,
            counter: counter.clone(),
        },
        Receiver {
            receiver: r.clone(),
            counter: counter.clone(),
        },
        StatsHandle {
            receiver: r,
            counter,
        },
    )
}

pub struct Sender<T> {
    sender: CSender<T>,
    counter: Arc<QueueCounter>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            counter: self.counter.clone(),
        }
    }
}

impl<T> Sender<T> {
    pub fn terminated(&self) -> bool {
        self.counter.terminated.load(Ordering::Relaxed)
    }

    // Blocks until there is room in the queue.
    pub fn send(&self, msg: T) -> Result<(), Error<T>> {
        match self.sender.send(msg) {
            Ok(()) => {
                self.counter.input.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.counter.terminated.store(true, Ordering::Release);
                Err(Error::Terminated(Some(e.0), None))
            }
        }
    }

    pub fn try_send(&self, msg: T) -> Result<(), Error<T>> {
        match self.sender.try_send(msg) {
            Ok(()) => {
                self.counter.input.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(m)) => Err(Error::Full(Some(m))),
            Err(TrySendError::Disconnected(m)) => {
                self.counter.terminated.store(true, Ordering::Release);
                Err(Error::Terminated(Some(m), None))
            }
        }
    }

}

pub struct Receiver<T> {
    receiver: CReceiver<T>,
    counter: Arc<QueueCounter>,
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.clone(),
            counter: self.counter.clone(),
        }
    }
}

impl<T> Receiver<T> {
    pub fn terminated(&self) -> bool {
        self.counter.terminated.load(Ordering::Relaxed)
    }

    pub fn recv(&self, timeout: Option<Duration>) -> Result<T, Error<T>> {
        let res = match timeout {
            Some(t) => self.receiver.recv_timeout(t),
            None => self
                .receiver
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };
        match res {
            Ok(v) => {
                self.counter.output.fetch_add(1, Ordering::Relaxed);
                Ok(v)
            }
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                self.counter.terminated.store(true, Ordering::Release);
                Err(Error::Terminated(None, None))
            }
        }
    }

    // Clears msgs, then receives up to msgs.capacity() messages: whatever
    // is immediately available, or a single blocking receive when the
    // queue is empty.
    pub fn recv_all(&self, msgs: &mut Vec<T>, timeout: Option<Duration>) -> Result<(), Error<T>> {
        msgs.clear();
        while msgs.len() < msgs.capacity() {
            match self.receiver.try_recv() {
                Ok(v) => {
                    self.counter.output.fetch_add(1, Ordering::Relaxed);
                    msgs.push(v);
                }
                Err(_) => break,
            }
        }
        if !msgs.is_empty() {
            return Ok(());
        }
        match self.recv(timeout) {
            Ok(v) => {
                msgs.push(v);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

pub struct StatsHandle<T> {
    receiver: CReceiver<T>,
    counter: Arc<QueueCounter>,
}

impl<T: Send> stats::OwnedCountable for StatsHandle<T> {
    fn get_counters(&self) -> Vec<stats::Counter> {
        vec![
            (
                "in",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(self.counter.input.swap(0, Ordering::Relaxed)),
            ),
            (
                "out",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(self.counter.output.swap(0, Ordering::Relaxed)),
            ),
            (
                "pending",
                stats::CounterType::Gauged,
                stats::CounterValue::Unsigned(self.receiver.len() as u64),
            ),
        ]
    }

    fn closed(&self) -> bool {
        self.counter.terminated.load(Ordering::Relaxed)
    }
}
