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
use std::sync::Arc;

use log::warn;
use serde_json::{json, Map, Value};

use crate::flow_generator::{Flow, TcpFlow, UdpFlow};
use crate::utils::queue;
use crate::utils::stats;

use super::rr::{ReqResIdentifier, RequestResponse};
use super::FlowMetric;

pub type MetricRecord = Map<String, Value>;

trait RegistrableMetric: Send + Sync {
    fn on_flush(&self, flow: &Flow) -> MetricRecord;
}

trait RegistrableRrMetric: Send + Sync {
    fn on_flush(&self, flow: &Flow, pairs: &[RequestResponse]) -> MetricRecord;
}

#[derive(Debug, Default)]
pub struct MetricSetCounter {
    pub serialized: AtomicU64,
    pub rr_dropped: AtomicU64,
}

impl stats::RefCountable for MetricSetCounter {
    fn get_counters(&self) -> Vec<stats::Counter> {
        vec![
            (
                "serialized",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(self.serialized.swap(0, Ordering::Relaxed)),
            ),
            (
                "rr_dropped",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(self.rr_dropped.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}

/// The registered flow-level metrics. One instance is shared by all
/// shards; per-flow callbacks merge the individual metric mappings into a
/// single record (last write wins on duplicate keys), serialize it once,
/// and push the line onto the bounded export queue.
pub struct FlowMetricSet {
    compute_rr: bool,
    rr_identifier: Option<ReqResIdentifier>,

    export: queue::Sender<String>,

    metrics: Vec<Box<dyn RegistrableMetric>>,
    rr_metrics: Vec<Box<dyn RegistrableRrMetric>>,
    counter: Arc<MetricSetCounter>,
}

impl FlowMetricSet {
    pub fn new(
        metric_sampling_rate: i64,
        compute_rr: bool,
        export: queue::Sender<String>,
        stats_collector: &stats::Collector,
    ) -> Self {
        let counter = Arc::new(MetricSetCounter::default());
        stats_collector.register_countable(
            "flow-metrics",
            stats::Countable::Owned(Box::new(counter.clone())),
            vec![],
        );

        let mut set = FlowMetricSet {
            compute_rr,
            rr_identifier: None,
            export,
            metrics: vec![
                Box::new(MetricSamplingRate {
                    sampling_rate: metric_sampling_rate,
                }),
                Box::new(MetricProtocol),
                Box::new(MetricFlowSize),
                Box::new(MetricPackets),
                Box::new(MetricFlowDuration),
            ],
            rr_metrics: vec![],
            counter,
        };
        if compute_rr {
            set.rr_identifier = Some(ReqResIdentifier::new());
            set.rr_metrics.push(Box::new(MetricRequestResponses));
        }
        set
    }

    fn on_flush(&self, flow: &Flow, pairs: &[RequestResponse]) {
        let mut combined = MetricRecord::new();
        for metric in &self.metrics {
            for (key, value) in metric.on_flush(flow) {
                combined.insert(key, value);
            }
        }
        if self.compute_rr {
            for metric in &self.rr_metrics {
                for (key, value) in metric.on_flush(flow, pairs) {
                    combined.insert(key, value);
                }
            }
        }

        // a malformed record would taint the whole output file
        let serialized = match serde_json::to_string(&combined) {
            Ok(s) => s,
            Err(e) => panic!("metric serialization failed: {}", e),
        };
        self.counter.serialized.fetch_add(1, Ordering::Relaxed);
        if self.export.send(serialized).is_err() {
            warn!("metric export queue terminated, record lost");
        }
    }
}

impl FlowMetric for FlowMetricSet {
    fn on_tcp_flush(&self, flow: &TcpFlow) {
        let mut pairs = vec![];
        if let Some(identifier) = self.rr_identifier.as_ref() {
            let (rr, drop_flow) = identifier.identify(&flow.flow);
            if drop_flow {
                self.counter.rr_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            pairs = rr;
        }
        self.on_flush(&flow.flow, &pairs);
    }

    fn on_udp_flush(&self, flow: &UdpFlow) {
        let mut pairs = vec![];
        if let Some(identifier) = self.rr_identifier.as_ref() {
            let (rr, drop_flow) = identifier.identify(&flow.flow);
            if drop_flow {
                self.counter.rr_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            pairs = rr;
        }
        self.on_flush(&flow.flow, &pairs);
    }
}

struct MetricSamplingRate {
    sampling_rate: i64,
}

impl RegistrableMetric for MetricSamplingRate {
    fn on_flush(&self, _flow: &Flow) -> MetricRecord {
        let mut record = MetricRecord::new();
        record.insert("samplingRate".into(), json!(self.sampling_rate));
        record
    }
}

struct MetricProtocol;

impl RegistrableMetric for MetricProtocol {
    fn on_flush(&self, flow: &Flow) -> MetricRecord {
        let mut record = MetricRecord::new();
        record.insert("protocol".into(), json!(flow.protocol.as_str()));
        record.insert("portClient".into(), json!(flow.client_port));
        record.insert("portServer".into(), json!(flow.server_port));
        // digests are stored signed for the downstream document store
        record.insert("addressClient".into(), json!(flow.client_digest as i64));
        record.insert("addressServer".into(), json!(flow.server_digest as i64));
        record.insert("clientInterface".into(), json!(flow.client_interface));
        record.insert("serverInterface".into(), json!(flow.server_interface));
        record.insert(
            "serverClientUnclear".into(),
            json!(flow.server_client_unclear),
        );
        record
    }
}

struct MetricFlowSize;

impl RegistrableMetric for MetricFlowSize {
    fn on_flush(&self, flow: &Flow) -> MetricRecord {
        let mut record = MetricRecord::new();
        record.insert("size".into(), json!(flow.payload_bytes()));
        record
    }
}

struct MetricPackets;

impl RegistrableMetric for MetricPackets {
    fn on_flush(&self, flow: &Flow) -> MetricRecord {
        let mut record = MetricRecord::new();
        record.insert("packets".into(), json!(flow.packets.len()));
        record
    }
}

struct MetricFlowDuration;

impl RegistrableMetric for MetricFlowDuration {
    fn on_flush(&self, flow: &Flow) -> MetricRecord {
        let mut record = MetricRecord::new();
        record.insert(
            "duration".into(),
            json!(flow.last_timestamp() - flow.first_timestamp()),
        );
        record
    }
}

struct MetricRequestResponses;

impl RegistrableRrMetric for MetricRequestResponses {
    fn on_flush(&self, _flow: &Flow, pairs: &[RequestResponse]) -> MetricRecord {
        let mut record = MetricRecord::new();
        record.insert("requestResponses".into(), json!(pairs.len()));
        record.insert(
            "rrDurations".into(),
            json!(pairs.iter().map(|p| p.response_delay()).collect::<Vec<_>>()),
        );
        record
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::common::enums::{L4Protocol, TcpFlags};
    use crate::common::{flow_key, PacketInformation};
    use crate::flow_generator::FlowTimeout;

    fn handshake_flow() -> TcpFlow {
        let timeout = FlowTimeout::default();
        let syn = PacketInformation {
            packet_idx: 1,
            timestamp: 0,
            flow_key: flow_key(0xaaa, 0xbbb, L4Protocol::Tcp, 40000, 80),
            transport: Some(L4Protocol::Tcp),
            src_digest: 0xaaa,
            dst_digest: 0xbbb,
            src_ip: Ipv4Addr::new(10, 1, 0, 1).into(),
            dst_ip: Ipv4Addr::new(10, 1, 0, 2).into(),
            src_port: 40000,
            dst_port: 80,
            tcp_flags: TcpFlags::SYN,
            ..Default::default()
        };
        let mut syn_ack = syn.clone();
        syn_ack.packet_idx = 2;
        syn_ack.timestamp = 1_000_000;
        syn_ack.src_digest = 0xbbb;
        syn_ack.dst_digest = 0xaaa;
        syn_ack.src_port = 80;
        syn_ack.dst_port = 40000;
        syn_ack.tcp_flags = TcpFlags::SYN_ACK;

        let mut flow = TcpFlow::new(&syn, &timeout);
        flow.add_packet(&syn_ack, &timeout);
        flow
    }

    #[test]
    fn merged_record_fields() {
        let (sender, receiver, _) = queue::bounded(16);
        let set = FlowMetricSet::new(1000, false, sender, &stats::Collector::new());
        set.on_tcp_flush(&handshake_flow());

        let line = receiver.recv(None).unwrap();
        let record: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(record["protocol"], "TCP");
        assert_eq!(record["portClient"], 40000);
        assert_eq!(record["portServer"], 80);
        assert_eq!(record["addressClient"], 0xaaa);
        assert_eq!(record["addressServer"], 0xbbb);
        assert_eq!(record["serverClientUnclear"], false);
        assert_eq!(record["packets"], 2);
        assert_eq!(record["duration"], 1_000_000);
        assert_eq!(record["samplingRate"], 1000);
        assert_eq!(record["size"], 0);
        assert!(record.get("requestResponses").is_none());
    }

    #[test]
    fn rr_enabled_drops_payload_free_flow() {
        let (sender, receiver, _) = queue::bounded(16);
        let set = FlowMetricSet::new(1000, true, sender, &stats::Collector::new());
        set.on_tcp_flush(&handshake_flow());
        assert!(receiver
            .recv(Some(std::time::Duration::from_millis(10)))
            .is_err());
    }
}
