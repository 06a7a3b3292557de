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

use std::mem;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Condvar, Mutex,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{info, warn};

use crate::common::PacketInformation;
use crate::metric::FlowMetric;
use crate::utils::queue::{self, Error};
use crate::utils::stats::{self, Countable};

use super::flow_config::FlowTimeout;
use super::flow_map::{FlowMap, FlowMapCounter, FlushStats, PortFilter};

/// A fingerprint maps to shard `fingerprint % NUM_FLOW_SHARDS`, so one
/// shard owns all packets of a flow, in both directions.
pub const NUM_FLOW_SHARDS: usize = 14;

const SHARD_BATCH_SIZE: usize = 128;
const SHARD_QUEUE_SIZE: usize = 300;
const RECV_TIMEOUT: Duration = Duration::from_secs(1);

enum ShardMessage {
    Packets(Vec<PacketInformation>),
    Flush {
        force: bool,
        now: i64,
        barrier: Arc<FlushBarrier>,
    },
}

// Aggregates per-shard flush statistics; the mutex is only entered at
// flush boundaries.
pub struct FlushBarrier {
    state: Mutex<(usize, FlushStats)>,
    cond: Condvar,
}

impl FlushBarrier {
    fn new(remaining: usize) -> Self {
        FlushBarrier {
            state: Mutex::new((remaining, FlushStats::default())),
            cond: Condvar::new(),
        }
    }

    fn complete(&self, stats: FlushStats) {
        let mut state = self.state.lock().unwrap();
        state.0 -= 1;
        state.1.merge(&stats);
        if state.0 == 0 {
            self.cond.notify_all();
        }
    }

    fn wait(&self) -> FlushStats {
        let mut state = self.state.lock().unwrap();
        while state.0 > 0 {
            state = self.cond.wait(state).unwrap();
        }
        state.1
    }
}

struct Shard {
    sender: queue::Sender<ShardMessage>,
    cache: Mutex<Vec<PacketInformation>>,
}

/// Router over the flow shards. Owns one worker thread per shard; each
/// worker holds its FlowMap exclusively and consumes packet batches and
/// flush commands from a bounded queue.
pub struct Pools {
    shards: Vec<Shard>,
    running: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Pools {
    pub fn new(
        timeout: FlowTimeout,
        tcp_filter: &[u16],
        udp_filter: &[u16],
        drop_incomplete_tcp: bool,
        metrics: Vec<Arc<dyn FlowMetric>>,
        stats_collector: &stats::Collector,
    ) -> Self {
        let tcp_filter = Arc::new(PortFilter::new(tcp_filter));
        let udp_filter = Arc::new(PortFilter::new(udp_filter));
        let metrics = Arc::new(metrics);
        let running = Arc::new(AtomicBool::new(true));

        let mut shards = Vec::with_capacity(NUM_FLOW_SHARDS);
        let mut handles = Vec::with_capacity(NUM_FLOW_SHARDS);
        for id in 0..NUM_FLOW_SHARDS {
            let (sender, receiver, stats_handle) = queue::bounded(SHARD_QUEUE_SIZE);
            stats_collector.register_countable(
                "flow-map-queue",
                Countable::Owned(Box::new(stats_handle)),
                vec![("id", id.to_string())],
            );
            let counter = Arc::new(FlowMapCounter::default());
            stats_collector.register_countable(
                "flow-map",
                Countable::Owned(Box::new(counter.clone())),
                vec![("id", id.to_string())],
            );

            let mut flow_map = FlowMap::new(
                id,
                timeout,
                tcp_filter.clone(),
                udp_filter.clone(),
                drop_incomplete_tcp,
                metrics.clone(),
                counter,
            );
            let running = running.clone();
            handles.push(thread::spawn(move || {
                while running.load(Ordering::Relaxed) {
                    match receiver.recv(Some(RECV_TIMEOUT)) {
                        Ok(ShardMessage::Packets(batch)) => {
                            for packet in &batch {
                                flow_map.inject(packet);
                            }
                        }
                        Ok(ShardMessage::Flush {
                            force,
                            now,
                            barrier,
                        }) => {
                            barrier.complete(flow_map.flush(force, now));
                        }
                        Err(Error::Timeout) => continue,
                        Err(_) => break,
                    }
                }
            }));
            shards.push(Shard {
                sender,
                cache: Mutex::new(Vec::with_capacity(SHARD_BATCH_SIZE)),
            });
        }

        Pools {
            shards,
            running,
            handles: Mutex::new(handles),
        }
    }

    pub fn shard_count() -> u64 {
        NUM_FLOW_SHARDS as u64
    }

    pub fn add(&self, packet: PacketInformation) {
        let shard = &self.shards[packet.flow_key.shard(NUM_FLOW_SHARDS as u64)];
        let mut cache = shard.cache.lock().unwrap();
        cache.push(packet);
        if cache.len() >= SHARD_BATCH_SIZE {
            let batch = mem::replace(&mut *cache, Vec::with_capacity(SHARD_BATCH_SIZE));
            drop(cache);
            if shard.sender.send(ShardMessage::Packets(batch)).is_err() {
                warn!("flow shard queue terminated, dropping packet batch");
            }
        }
    }

    // Expires timed out flows on every shard and waits for completion.
    // `now` is the packet clock, not wall time. A forced flush expires
    // every live flow.
    pub fn flush(&self, force: bool, now: i64) {
        let barrier = Arc::new(FlushBarrier::new(self.shards.len()));
        for shard in &self.shards {
            let batch = {
                let mut cache = shard.cache.lock().unwrap();
                mem::replace(&mut *cache, Vec::with_capacity(SHARD_BATCH_SIZE))
            };
            if !batch.is_empty() {
                if shard.sender.send(ShardMessage::Packets(batch)).is_err() {
                    warn!("flow shard queue terminated, dropping packet batch");
                }
            }
            let _ = shard.sender.send(ShardMessage::Flush {
                force,
                now,
                barrier: barrier.clone(),
            });
        }
        let stats = barrier.wait();
        info!(
            "{} / {} TCP flows flushed",
            stats.tcp_flushed, stats.tcp_count
        );
        info!(
            "{} / {} UDP flows flushed",
            stats.udp_flushed, stats.udp_count
        );
    }

    // Stops the shard threads. Callers flush(force=true) first; anything
    // still queued afterwards would be abandoned.
    pub fn close(&self) {
        self.running.store(false, Ordering::Relaxed);
        for handle in self.handles.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}
