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
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use rand::Rng;

use crate::common::PacketData;
use crate::config::Config;
use crate::decoder::reorder::{
    FlushSignal, ReorderBuffer, ReorderCounter, ReorderFlusher, FLUSH_CHANNEL_SIZE,
};
use crate::decoder::{DecoderPool, DECODER_BATCH_SIZE};
use crate::error::{Error, Result};
use crate::flow_generator::{FlowTimeout, Pools};
use crate::metric::{FlowMetric, FlowMetricSet};
use crate::sender::MetricSenderThread;
use crate::source::PacketSource;
use crate::utils::queue;
use crate::utils::stats::{self, Countable, RefCountable};

// a packet clock jumping this many flush intervals ahead is treated as a
// spike rather than real time passing
const SPIKE_INTERVALS: i64 = 3;
const SPIKE_GIVE_UP: u32 = 1000;

#[derive(Debug, Default)]
struct IngestCounter {
    packets: AtomicU64,
    bytes: AtomicU64,
    read_errors: AtomicU64,
    empty_packets: AtomicU64,
    spikes: AtomicU64,
}

impl RefCountable for IngestCounter {
    fn get_counters(&self) -> Vec<stats::Counter> {
        vec![
            (
                "packets",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(self.packets.load(Ordering::Relaxed)),
            ),
            (
                "bytes",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(self.bytes.load(Ordering::Relaxed)),
            ),
            (
                "read_errors",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(self.read_errors.load(Ordering::Relaxed)),
            ),
            (
                "empty_packets",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(self.empty_packets.load(Ordering::Relaxed)),
            ),
            (
                "spikes",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(self.spikes.load(Ordering::Relaxed)),
            ),
        ]
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RunSummary {
    pub packets: i64,
    pub first_packet_timestamp: i64,
    pub last_packet_timestamp: i64,
    pub records_written: u64,
}

/// Owns the whole pipeline and drives it from a packet source: assigns
/// dense indices, batches raw packets towards the decoder channels,
/// schedules the periodic pool flushes on the packet clock, and runs the
/// ordered shutdown once the source is exhausted.
pub struct Analyzer {
    config: Config,
    stats: Arc<stats::Collector>,
    pools: Arc<Pools>,
    decoder_pool: Option<DecoderPool>,
    reorder_flusher: ReorderFlusher,
    flush_signal: queue::Sender<FlushSignal>,
    metric_sender: MetricSenderThread,
    counter: Arc<IngestCounter>,
}

impl Analyzer {
    pub fn new(config: Config) -> Self {
        let stats_collector = Arc::new(stats::Collector::new());

        let (export_sender, export_receiver, export_stats) =
            queue::bounded(config.export_buffer_size);
        stats_collector.register_countable(
            "export-queue",
            Countable::Owned(Box::new(export_stats)),
            vec![],
        );
        let mut metric_sender = MetricSenderThread::new(
            export_receiver,
            config.output_dir.clone(),
            &stats_collector,
        );
        metric_sender.start();

        let metric_set: Arc<dyn FlowMetric> = Arc::new(FlowMetricSet::new(
            config.metric_sampling_rate,
            config.compute_request_response,
            export_sender,
            &stats_collector,
        ));

        let pools = Arc::new(Pools::new(
            FlowTimeout::new(
                config.tcp_timeout,
                config.tcp_fin_timeout,
                config.tcp_rst_timeout,
                config.udp_timeout,
            ),
            &config.tcp_filter,
            &config.udp_filter,
            config.drop_incomplete_tcp,
            vec![metric_set],
            &stats_collector,
        ));

        let (flush_signal, flush_receiver, _) = queue::bounded(FLUSH_CHANNEL_SIZE);
        let reorder_counter = Arc::new(ReorderCounter::default());
        stats_collector.register_countable(
            "reorder",
            Countable::Owned(Box::new(reorder_counter.clone())),
            vec![],
        );
        let reorder = Arc::new(ReorderBuffer::new(
            config.reorder_buffer_size,
            flush_signal.clone(),
            reorder_counter,
        ));
        let reorder_flusher = ReorderFlusher::start(reorder.clone(), flush_receiver, pools.clone());

        let decoder_pool = DecoderPool::new(
            config.decoder_workers,
            config.decoder_channels,
            config.sampling_rate,
            Pools::shard_count(),
            reorder,
            flush_signal.clone(),
            &stats_collector,
        );

        let counter = Arc::new(IngestCounter::default());
        stats_collector.register_countable(
            "ingest",
            Countable::Ref(Arc::downgrade(&counter) as Weak<dyn RefCountable>),
            vec![],
        );

        Analyzer {
            config,
            stats: stats_collector,
            pools,
            decoder_pool: Some(decoder_pool),
            reorder_flusher,
            flush_signal,
            metric_sender,
            counter,
        }
    }

    /// Reads the source to depletion (or to `packet-limit`), then shuts
    /// the pipeline down in order so that no packet and no flow is
    /// abandoned.
    pub fn run(&mut self, mut source: Box<dyn PacketSource>) -> Result<RunSummary> {
        let decoder_pool = self.decoder_pool.take().expect("analyzer can only run once");
        let flush_interval = self.config.flush_interval.as_nanos() as i64;
        let packet_limit = if self.config.packet_limit == 0 {
            i64::MAX
        } else {
            self.config.packet_limit as i64
        };

        let mut rng = rand::thread_rng();
        let mut batch = Vec::with_capacity(DECODER_BATCH_SIZE);
        let mut packet_idx = 0i64;
        let mut first_timestamp = 0i64;
        let mut last_timestamp = 0i64;
        let mut flush_at = 0i64;
        let mut spike_count = 0u32;

        while packet_idx < packet_limit {
            let raw = match source.read_packet() {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) if e.is_recoverable() => {
                    self.counter.read_errors.fetch_add(1, Ordering::Relaxed);
                    debug!("skipping unreadable packet: {}", e);
                    continue;
                }
                Err(e) => return Err(Error::Source(e)),
            };
            // zero length packets surface with bogus timestamps, drop them
            if raw.data.is_empty() {
                self.counter.empty_packets.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            if packet_idx == 0 {
                first_timestamp = raw.timestamp;
                flush_at = first_timestamp + flush_interval;
            }
            packet_idx += 1;
            last_timestamp = raw.timestamp;
            self.counter.packets.fetch_add(1, Ordering::Relaxed);
            self.counter
                .bytes
                .fetch_add(raw.data.len() as u64, Ordering::Relaxed);

            batch.push(PacketData {
                data: raw.data,
                timestamp: raw.timestamp,
                packet_idx,
                interface: raw.interface,
            });
            if batch.len() == DECODER_BATCH_SIZE {
                let channel = rng.gen_range(0..decoder_pool.channels());
                decoder_pool.send(
                    channel,
                    mem::replace(&mut batch, Vec::with_capacity(DECODER_BATCH_SIZE)),
                );
            }

            if last_timestamp > flush_at {
                if last_timestamp - flush_at >= SPIKE_INTERVALS * flush_interval {
                    if spike_count > SPIKE_GIVE_UP {
                        warn!("{} timestamp spikes in a row, advancing the flush clock softly", spike_count);
                        flush_at += flush_interval;
                    } else {
                        self.counter.spikes.fetch_add(1, Ordering::Relaxed);
                        spike_count += 1;
                        continue;
                    }
                } else {
                    flush_at = last_timestamp + flush_interval;
                }
                spike_count = 0;
                info!(
                    "flushing pools at packet clock {} (packet {})",
                    last_timestamp, packet_idx
                );
                self.pools.flush(false, last_timestamp);
            }
        }

        // shutdown: trailing batch first, then stop the stages front to
        // back so nothing in flight is lost
        if !batch.is_empty() {
            decoder_pool.send(0, batch);
        }
        decoder_pool.close();

        let _ = self.flush_signal.send(FlushSignal::Shutdown);
        self.reorder_flusher.join();

        self.pools.flush(true, last_timestamp);
        self.pools.close();

        let records_written = self.metric_sender.join().map_err(Error::Export)?;
        self.stats.log_counters();

        let summary = RunSummary {
            packets: packet_idx,
            first_packet_timestamp: first_timestamp,
            last_packet_timestamp: last_timestamp,
            records_written,
        };
        info!(
            "analysis finished: {} packets, {} records",
            summary.packets, summary.records_written
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;

    use super::*;
    use crate::source::{self, RawCapture};

    struct VecSource {
        frames: Vec<RawCapture>,
    }

    impl PacketSource for VecSource {
        fn read_packet(&mut self) -> source::Result<Option<RawCapture>> {
            if self.frames.is_empty() {
                Ok(None)
            } else {
                Ok(Some(self.frames.remove(0)))
            }
        }
    }

    fn ipv4_tcp_frame(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        flags: u8,
        payload_len: u16,
        timestamp: i64,
    ) -> RawCapture {
        let total = 20 + 20 + payload_len;
        let mut data = vec![0u8; 20];
        data[0] = 0x45;
        data[2..4].copy_from_slice(&total.to_be_bytes());
        data[8] = 64;
        data[9] = 6;
        data[12..16].copy_from_slice(&src.octets());
        data[16..20].copy_from_slice(&dst.octets());
        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
        tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
        tcp[12] = 5 << 4;
        tcp[13] = flags;
        data.extend(tcp);
        data.extend(vec![0u8; payload_len as usize]);
        RawCapture {
            data,
            timestamp,
            interface: 0,
        }
    }

    fn test_config(dir: &PathBuf) -> Config {
        let mut config = Config::load("{}").unwrap();
        config.output_dir = dir.clone();
        config.decoder_workers = 2;
        config.decoder_channels = 2;
        config
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "flowmeter-analyzer-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn read_records(dir: &PathBuf) -> Vec<serde_json::Value> {
        let content = fs::read_to_string(dir.join(crate::sender::METRIC_FILE_NAME)).unwrap();
        if content.is_empty() {
            return vec![];
        }
        content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn empty_input_empty_output() {
        let dir = temp_dir("empty");
        let mut analyzer = Analyzer::new(test_config(&dir));
        let summary = analyzer.run(Box::new(VecSource { frames: vec![] })).unwrap();
        assert_eq!(summary.packets, 0);
        assert_eq!(summary.records_written, 0);
        assert!(read_records(&dir).is_empty());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn distinct_flows_yield_distinct_records() {
        let dir = temp_dir("flows");
        let mut frames = vec![];
        // 5 flows, 2 packets each, interleaved
        for i in 0..5u8 {
            let client = Ipv4Addr::new(10, 0, 0, 1 + i);
            let server = Ipv4Addr::new(192, 168, 0, 1);
            frames.push(ipv4_tcp_frame(client, server, 40000 + i as u16, 80, 0x02, 0, i as i64));
            frames.push(ipv4_tcp_frame(server, client, 80, 40000 + i as u16, 0x12, 0, 10 + i as i64));
        }
        let mut analyzer = Analyzer::new(test_config(&dir));
        let summary = analyzer.run(Box::new(VecSource { frames })).unwrap();
        assert_eq!(summary.packets, 10);
        assert_eq!(summary.records_written, 5);

        let records = read_records(&dir);
        assert_eq!(records.len(), 5);
        for record in &records {
            assert_eq!(record["protocol"], "TCP");
            assert_eq!(record["packets"], 2);
            assert_eq!(record["portServer"], 80);
            assert_eq!(record["serverClientUnclear"], false);
        }
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn packet_limit_stops_ingest() {
        let dir = temp_dir("limit");
        let mut frames = vec![];
        for i in 0..100 {
            frames.push(ipv4_tcp_frame(
                Ipv4Addr::new(10, 0, 0, 1),
                Ipv4Addr::new(10, 0, 0, 2),
                40000,
                80,
                0x10,
                10,
                i,
            ));
        }
        let mut config = test_config(&dir);
        config.packet_limit = 7;
        let mut analyzer = Analyzer::new(config);
        let summary = analyzer.run(Box::new(VecSource { frames })).unwrap();
        assert_eq!(summary.packets, 7);
        // one flow, forced out at shutdown
        assert_eq!(summary.records_written, 1);
        let records = read_records(&dir);
        assert_eq!(records[0]["packets"], 7);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn flow_duration_spans_packet_clock() {
        let dir = temp_dir("duration");
        let frames = vec![
            ipv4_tcp_frame(
                Ipv4Addr::new(10, 9, 0, 1),
                Ipv4Addr::new(10, 9, 0, 2),
                40000,
                80,
                0x02,
                0,
                1_000,
            ),
            ipv4_tcp_frame(
                Ipv4Addr::new(10, 9, 0, 2),
                Ipv4Addr::new(10, 9, 0, 1),
                80,
                40000,
                0x12,
                0,
                5_000,
            ),
        ];
        let mut analyzer = Analyzer::new(test_config(&dir));
        analyzer.run(Box::new(VecSource { frames })).unwrap();
        let records = read_records(&dir);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["duration"], 4_000);
        assert_eq!(records[0]["portClient"], 40000);
        let _ = fs::remove_dir_all(&dir);
    }
}
