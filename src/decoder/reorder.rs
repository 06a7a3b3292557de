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

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::info;

use crate::common::enums::L4Protocol;
use crate::common::PacketInformation;
use crate::flow_generator::Pools;
use crate::utils::queue;
use crate::utils::stats;

pub const FLUSH_CHANNEL_SIZE: usize = 200;

const STALL_RECHECK: Duration = Duration::from_millis(100);
const DRAIN_CHUNK: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushSignal {
    Drain,
    Shutdown,
}

#[derive(Debug, Default)]
pub struct ReorderCounter {
    pub dispatched: AtomicU64,
    pub ignored: AtomicU64,
    pub stalls: AtomicU64,
}

impl stats::RefCountable for ReorderCounter {
    fn get_counters(&self) -> Vec<stats::Counter> {
        vec![
            (
                "dispatched",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(self.dispatched.swap(0, Ordering::Relaxed)),
            ),
            (
                "ignored",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(self.ignored.swap(0, Ordering::Relaxed)),
            ),
            (
                "stalls",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(self.stalls.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}

struct Ring {
    slots: Vec<Option<PacketInformation>>,
    // lowest packet index not yet dispatched
    start: i64,
}

/// Fixed-size, index-addressed ring restoring original capture order over
/// the parallel decoders. Slot `i % size` holds the packet with index `i`;
/// the drain side walks `start` forward while slots are filled.
///
/// A writer whose index does not fit the window parks on a condvar until
/// the drain advances `start`; it requests a drain first so the wait
/// cannot outlive the backlog. Keeping writes within `start + size - 1`
/// means no two in-flight indices share a slot.
pub struct ReorderBuffer {
    size: i64,
    ring: Mutex<Ring>,
    space: Condvar,
    flush_signal: queue::Sender<FlushSignal>,
    counter: Arc<ReorderCounter>,
}

impl ReorderBuffer {
    pub fn new(
        size: usize,
        flush_signal: queue::Sender<FlushSignal>,
        counter: Arc<ReorderCounter>,
    ) -> Self {
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, || None);
        ReorderBuffer {
            size: size as i64,
            ring: Mutex::new(Ring { slots, start: 1 }),
            space: Condvar::new(),
            flush_signal,
            counter,
        }
    }

    pub fn put(&self, packet: PacketInformation) {
        let mut ring = self.ring.lock().unwrap();
        while packet.packet_idx - ring.start >= self.size {
            self.counter.stalls.fetch_add(1, Ordering::Relaxed);
            let _ = self.flush_signal.try_send(FlushSignal::Drain);
            let (guard, _) = self.space.wait_timeout(ring, STALL_RECHECK).unwrap();
            ring = guard;
        }
        let slot = (packet.packet_idx % self.size) as usize;
        ring.slots[slot] = Some(packet);
    }

    // One drain pass: dispatches filled slots from `start` forward and
    // stops at the first empty one. Dispatch runs outside the ring lock so
    // stalled writers can make progress while the shards consume.
    pub fn drain<F: FnMut(PacketInformation)>(&self, mut dispatch: F) -> u64 {
        let mut drained = 0u64;
        loop {
            let mut chunk = Vec::with_capacity(DRAIN_CHUNK);
            {
                let mut ring = self.ring.lock().unwrap();
                while chunk.len() < DRAIN_CHUNK {
                    let slot = (ring.start % self.size) as usize;
                    match ring.slots[slot].take() {
                        Some(packet) => {
                            ring.start += 1;
                            chunk.push(packet);
                        }
                        None => break,
                    }
                }
            }
            if chunk.is_empty() {
                return drained;
            }
            self.space.notify_all();
            drained += chunk.len() as u64;
            for packet in chunk {
                dispatch(packet);
            }
        }
    }
}

/// Drives the reorder buffer: every signal triggers one drain pass that
/// hands packets to the flow shards in ingest-index order. A shutdown
/// signal performs the final drain and stops the task.
pub struct ReorderFlusher {
    thread_handle: Option<JoinHandle<()>>,
}

impl ReorderFlusher {
    pub fn start(
        buffer: Arc<ReorderBuffer>,
        signal: queue::Receiver<FlushSignal>,
        pools: Arc<Pools>,
    ) -> Self {
        let handle = thread::spawn(move || {
            loop {
                let stop = match signal.recv(None) {
                    Ok(FlushSignal::Drain) => false,
                    Ok(FlushSignal::Shutdown) => true,
                    Err(_) => true,
                };
                buffer.drain(|packet| {
                    match packet.transport {
                        Some(L4Protocol::Tcp) | Some(L4Protocol::Udp) => {
                            buffer.counter.dispatched.fetch_add(1, Ordering::Relaxed);
                            pools.add(packet);
                        }
                        None => {
                            buffer.counter.ignored.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
                if stop {
                    break;
                }
            }
            info!("reorder flusher exited");
        });
        ReorderFlusher {
            thread_handle: Some(handle),
        }
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;

    fn packet(idx: i64) -> PacketInformation {
        PacketInformation {
            packet_idx: idx,
            timestamp: idx,
            transport: Some(L4Protocol::Tcp),
            ..Default::default()
        }
    }

    fn new_buffer(size: usize) -> (ReorderBuffer, queue::Receiver<FlushSignal>) {
        let (sender, receiver, _) = queue::bounded(FLUSH_CHANNEL_SIZE);
        (
            ReorderBuffer::new(size, sender, Arc::new(ReorderCounter::default())),
            receiver,
        )
    }

    #[test]
    fn out_of_order_input_drains_in_order() {
        let (buffer, _signal) = new_buffer(64);
        for idx in [3i64, 1, 2, 5, 4] {
            buffer.put(packet(idx));
        }
        let mut seen = vec![];
        let drained = buffer.drain(|p| seen.push(p.packet_idx));
        assert_eq!(drained, 5);
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn drain_stops_at_gap() {
        let (buffer, _signal) = new_buffer(64);
        buffer.put(packet(1));
        buffer.put(packet(3));
        let mut seen = vec![];
        buffer.drain(|p| seen.push(p.packet_idx));
        assert_eq!(seen, vec![1]);

        buffer.put(packet(2));
        let mut seen = vec![];
        buffer.drain(|p| seen.push(p.packet_idx));
        assert_eq!(seen, vec![2, 3]);
    }

    #[test]
    fn every_packet_dispatched_exactly_once() {
        let (buffer, _signal) = new_buffer(32);
        let buffer = Arc::new(buffer);
        let drainer = {
            let buffer = buffer.clone();
            let done = Arc::new(AtomicBool::new(false));
            let done_flag = done.clone();
            let handle = thread::spawn(move || {
                let mut seen = vec![];
                while !done_flag.load(Ordering::Relaxed) {
                    buffer.drain(|p| seen.push(p.packet_idx));
                    thread::sleep(Duration::from_millis(1));
                }
                buffer.drain(|p| seen.push(p.packet_idx));
                seen
            });
            (handle, done)
        };

        let total = 1000i64;
        for idx in 1..=total {
            buffer.put(packet(idx));
        }
        drainer.1.store(true, Ordering::Relaxed);
        let seen = drainer.0.join().unwrap();
        assert_eq!(seen.len(), total as usize);
        assert_eq!(seen, (1..=total).collect::<Vec<_>>());
    }

    #[test]
    fn size_one_window_in_order() {
        let (buffer, _signal) = new_buffer(1);
        let buffer = Arc::new(buffer);
        let writer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                for idx in 1..=10 {
                    buffer.put(packet(idx));
                }
            })
        };
        let mut seen = vec![];
        while seen.len() < 10 {
            buffer.drain(|p| seen.push(p.packet_idx));
            thread::yield_now();
        }
        writer.join().unwrap();
        assert_eq!(seen, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn stall_requests_flush() {
        let (buffer, signal) = new_buffer(2);
        let buffer = Arc::new(buffer);
        buffer.put(packet(1));
        buffer.put(packet(2));
        let writer = {
            let buffer = buffer.clone();
            thread::spawn(move || buffer.put(packet(3)))
        };
        // the stalled writer asks for a drain
        assert_eq!(
            signal.recv(Some(Duration::from_secs(1))).unwrap(),
            FlushSignal::Drain
        );
        buffer.drain(|_| {});
        writer.join().unwrap();
        let mut seen = vec![];
        buffer.drain(|p| seen.push(p.packet_idx));
        assert_eq!(seen, vec![3]);
    }
}
