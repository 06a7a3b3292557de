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

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::common::enums::L4Protocol;
use crate::common::{FlowKey, PacketInformation};
use crate::metric::FlowMetric;
use crate::utils::bitmap::Bitmap;
use crate::utils::stats;

use super::flow::{TcpFlow, UdpFlow};
use super::flow_config::FlowTimeout;

/// Port allow-set applied before a packet may create or update flow state.
/// An empty set admits everything.
pub struct PortFilter {
    bitmap: Bitmap,
    admit_all: bool,
}

impl PortFilter {
    pub fn new(ports: &[u16]) -> Self {
        let mut bitmap = Bitmap::new(u16::MAX as usize, false);
        for port in ports {
            // cannot be out of bounds for a u16
            let _ = bitmap.set(*port as usize, true);
        }
        PortFilter {
            bitmap,
            admit_all: ports.is_empty(),
        }
    }

    pub fn admits(&self, src_port: u16, dst_port: u16) -> bool {
        self.admit_all
            || self.bitmap.get(src_port as usize).unwrap_or(false)
            || self.bitmap.get(dst_port as usize).unwrap_or(false)
    }
}

#[derive(Debug, Default)]
pub struct FlowMapCounter {
    pub tcp_flows: AtomicU64,
    pub udp_flows: AtomicU64,
    pub filtered: AtomicU64,
    pub incomplete_dropped: AtomicU64,
}

impl stats::RefCountable for FlowMapCounter {
    fn get_counters(&self) -> Vec<stats::Counter> {
        vec![
            (
                "tcp_flows",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(self.tcp_flows.swap(0, Ordering::Relaxed)),
            ),
            (
                "udp_flows",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(self.udp_flows.swap(0, Ordering::Relaxed)),
            ),
            (
                "filtered",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(self.filtered.swap(0, Ordering::Relaxed)),
            ),
            (
                "incomplete_dropped",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(self.incomplete_dropped.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FlushStats {
    pub tcp_flushed: u64,
    pub tcp_count: u64,
    pub udp_flushed: u64,
    pub udp_count: u64,
}

impl FlushStats {
    pub fn merge(&mut self, other: &FlushStats) {
        self.tcp_flushed += other.tcp_flushed;
        self.tcp_count += other.tcp_count;
        self.udp_flushed += other.udp_flushed;
        self.udp_count += other.udp_count;
    }
}

// One shard of the flow store. Not thread-safe: a shard is owned by
// exactly one thread, concurrency happens across shards.
pub struct FlowMap {
    id: usize,
    tcp_flows: HashMap<FlowKey, TcpFlow>,
    udp_flows: HashMap<FlowKey, UdpFlow>,

    tcp_filter: Arc<PortFilter>,
    udp_filter: Arc<PortFilter>,
    timeout: FlowTimeout,
    drop_incomplete_tcp: bool,

    metrics: Arc<Vec<Arc<dyn FlowMetric>>>,
    counter: Arc<FlowMapCounter>,
}

impl FlowMap {
    pub fn new(
        id: usize,
        timeout: FlowTimeout,
        tcp_filter: Arc<PortFilter>,
        udp_filter: Arc<PortFilter>,
        drop_incomplete_tcp: bool,
        metrics: Arc<Vec<Arc<dyn FlowMetric>>>,
        counter: Arc<FlowMapCounter>,
    ) -> Self {
        FlowMap {
            id,
            tcp_flows: HashMap::new(),
            udp_flows: HashMap::new(),
            tcp_filter,
            udp_filter,
            timeout,
            drop_incomplete_tcp,
            metrics,
            counter,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn len(&self) -> usize {
        self.tcp_flows.len() + self.udp_flows.len()
    }

    pub fn inject(&mut self, packet: &PacketInformation) {
        match packet.transport {
            Some(L4Protocol::Tcp) => {
                if !self.tcp_filter.admits(packet.src_port, packet.dst_port) {
                    self.counter.filtered.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                match self.tcp_flows.entry(packet.flow_key) {
                    Entry::Occupied(mut e) => e.get_mut().add_packet(packet, &self.timeout),
                    Entry::Vacant(e) => {
                        e.insert(TcpFlow::new(packet, &self.timeout));
                        self.counter.tcp_flows.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Some(L4Protocol::Udp) => {
                if !self.udp_filter.admits(packet.src_port, packet.dst_port) {
                    self.counter.filtered.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                match self.udp_flows.entry(packet.flow_key) {
                    Entry::Occupied(mut e) => e.get_mut().add_packet(packet, &self.timeout),
                    Entry::Vacant(e) => {
                        e.insert(UdpFlow::new(packet, &self.timeout));
                        self.counter.udp_flows.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            None => (),
        }
    }

    // Expires flows whose deadline lies before `now`, the latest timestamp
    // observed in the packet stream. A forced flush expires everything.
    pub fn flush(&mut self, force: bool, now: i64) -> FlushStats {
        let mut stats = FlushStats {
            tcp_count: self.tcp_flows.len() as u64,
            udp_count: self.udp_flows.len() as u64,
            ..Default::default()
        };

        let metrics = self.metrics.clone();
        let counter = self.counter.clone();
        let drop_incomplete = self.drop_incomplete_tcp;

        let mut tcp_flushed = 0;
        self.tcp_flows.retain(|_, flow| {
            if !force && flow.flow.timeout_at >= now {
                return true;
            }
            tcp_flushed += 1;
            if drop_incomplete && !flow.has_syn_ack() {
                counter.incomplete_dropped.fetch_add(1, Ordering::Relaxed);
            } else {
                for metric in metrics.iter() {
                    metric.on_tcp_flush(flow);
                }
            }
            false
        });
        stats.tcp_flushed = tcp_flushed;

        let mut udp_flushed = 0;
        self.udp_flows.retain(|_, flow| {
            if !force && flow.flow.timeout_at >= now {
                return true;
            }
            udp_flushed += 1;
            for metric in metrics.iter() {
                metric.on_udp_flush(flow);
            }
            false
        });
        stats.udp_flushed = udp_flushed;

        stats
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    use super::*;
    use crate::common::enums::TcpFlags;
    use crate::common::flow_key;

    #[derive(Default)]
    struct RecordingMetric {
        tcp: Mutex<Vec<(FlowKey, usize, bool)>>, // key, packets, unclear
        udp: Mutex<Vec<(FlowKey, u16, u16)>>,    // key, client port, server port
    }

    impl FlowMetric for RecordingMetric {
        fn on_tcp_flush(&self, flow: &TcpFlow) {
            self.tcp.lock().unwrap().push((
                flow.flow.flow_key,
                flow.flow.packets.len(),
                flow.flow.server_client_unclear,
            ));
        }

        fn on_udp_flush(&self, flow: &UdpFlow) {
            self.udp.lock().unwrap().push((
                flow.flow.flow_key,
                flow.flow.client_port,
                flow.flow.server_port,
            ));
        }
    }

    fn new_map(
        drop_incomplete: bool,
        tcp_ports: &[u16],
    ) -> (FlowMap, Arc<RecordingMetric>) {
        let recorder = Arc::new(RecordingMetric::default());
        let metrics: Vec<Arc<dyn FlowMetric>> = vec![recorder.clone()];
        let map = FlowMap::new(
            0,
            FlowTimeout {
                tcp: 10_000_000,
                tcp_fin: 2_000_000,
                tcp_rst: 1_000_000,
                udp: 5_000_000,
            },
            Arc::new(PortFilter::new(tcp_ports)),
            Arc::new(PortFilter::new(&[])),
            drop_incomplete,
            Arc::new(metrics),
            Arc::new(FlowMapCounter::default()),
        );
        (map, recorder)
    }

    fn tcp_packet(
        idx: i64,
        flags: TcpFlags,
        from_client: bool,
        timestamp: i64,
        payload_len: u16,
    ) -> PacketInformation {
        let (src_digest, dst_digest, src_port, dst_port) = if from_client {
            (0xau64, 0xbu64, 40000u16, 80u16)
        } else {
            (0xb, 0xa, 80, 40000)
        };
        PacketInformation {
            packet_idx: idx,
            timestamp,
            flow_key: flow_key(src_digest, dst_digest, L4Protocol::Tcp, src_port, dst_port),
            transport: Some(L4Protocol::Tcp),
            src_digest,
            dst_digest,
            src_ip: Ipv4Addr::new(192, 168, 1, 1).into(),
            dst_ip: Ipv4Addr::new(192, 168, 1, 2).into(),
            src_port,
            dst_port,
            payload_len,
            tcp_flags: flags,
            ..Default::default()
        }
    }

    #[test]
    fn two_packet_flow_forced_flush() {
        let (mut map, recorder) = new_map(false, &[]);
        map.inject(&tcp_packet(1, TcpFlags::SYN, true, 0, 0));
        map.inject(&tcp_packet(2, TcpFlags::SYN_ACK, false, 1_000_000, 0));
        assert_eq!(map.len(), 1);

        let stats = map.flush(true, 100_000_000);
        assert_eq!(stats.tcp_flushed, 1);
        assert_eq!(stats.tcp_count, 1);
        let flushed = recorder.tcp.lock().unwrap();
        assert_eq!(flushed.len(), 1);
        let (_, packets, unclear) = flushed[0];
        assert_eq!(packets, 2);
        assert!(!unclear);
    }

    #[test]
    fn rst_expires_with_short_deadline() {
        let (mut map, recorder) = new_map(false, &[]);
        let ms = 1_000_000i64;
        map.inject(&tcp_packet(1, TcpFlags::SYN, true, 0, 0));
        map.inject(&tcp_packet(2, TcpFlags::SYN_ACK, false, ms, 0));
        map.inject(&tcp_packet(3, TcpFlags::ACK, true, 2 * ms, 0));
        map.inject(&tcp_packet(4, TcpFlags::RST, true, 3 * ms, 0));

        // deadline is 3ms + 1ms rst timeout, expired at 5ms without force
        let stats = map.flush(false, 5 * ms);
        assert_eq!(stats.tcp_flushed, 1);
        assert_eq!(recorder.tcp.lock().unwrap()[0].1, 4);
    }

    #[test]
    fn unexpired_flow_survives_flush() {
        let (mut map, recorder) = new_map(false, &[]);
        map.inject(&tcp_packet(1, TcpFlags::SYN, true, 0, 0));
        let stats = map.flush(false, 1_000_000);
        assert_eq!(stats.tcp_flushed, 0);
        assert_eq!(map.len(), 1);
        assert!(recorder.tcp.lock().unwrap().is_empty());
    }

    #[test]
    fn port_filter_drops_before_flow_creation() {
        let (mut map, recorder) = new_map(false, &[443]);
        map.inject(&tcp_packet(1, TcpFlags::SYN, true, 0, 0)); // 40000 -> 80
        assert_eq!(map.len(), 0);
        map.flush(true, 0);
        assert!(recorder.tcp.lock().unwrap().is_empty());
    }

    #[test]
    fn drop_incomplete_tcp_suppresses_record() {
        let (mut map, recorder) = new_map(true, &[]);
        map.inject(&tcp_packet(1, TcpFlags::SYN, true, 0, 0));
        let stats = map.flush(true, 0);
        // the flow is removed but no metric is emitted
        assert_eq!(stats.tcp_flushed, 1);
        assert_eq!(map.len(), 0);
        assert!(recorder.tcp.lock().unwrap().is_empty());

        map.inject(&tcp_packet(2, TcpFlags::SYN, true, 0, 0));
        map.inject(&tcp_packet(3, TcpFlags::SYN_ACK, false, 1, 0));
        map.flush(true, 0);
        assert_eq!(recorder.tcp.lock().unwrap().len(), 1);
    }

    #[test]
    fn udp_unclear_direction() {
        let (mut map, recorder) = new_map(false, &[]);
        let packet = PacketInformation {
            packet_idx: 1,
            timestamp: 0,
            flow_key: flow_key(0xa, 0xb, L4Protocol::Udp, 53, 40000),
            transport: Some(L4Protocol::Udp),
            src_digest: 0xa,
            dst_digest: 0xb,
            src_port: 53,
            dst_port: 40000,
            payload_len: 50,
            ..Default::default()
        };
        map.inject(&packet);
        map.flush(true, 0);
        let udp = recorder.udp.lock().unwrap();
        assert_eq!(udp.len(), 1);
        let (_, client_port, server_port) = udp[0];
        assert_eq!(client_port, 40000);
        assert_eq!(server_port, 53);
    }
}
