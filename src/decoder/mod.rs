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

pub mod reorder;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::info;
use rand::Rng;

use crate::common::consts::*;
use crate::common::enums::{EthernetType, IpProtocol, L4Protocol, TcpFlags};
use crate::common::{address_digest, flow_key, PacketData, PacketInformation};
use crate::utils::bytes::{read_u16_be, read_u32_be};
use crate::utils::queue;
use crate::utils::stats::{self, Countable, RefCountable};

use reorder::{FlushSignal, ReorderBuffer};

pub const DECODER_BATCH_SIZE: usize = 1200;
pub const DECODER_QUEUE_SIZE: usize = 40000;

// roughly one reorder drain request per twenty decoded batches
const FLUSH_SIGNAL_PERCENT: u32 = 5;

#[derive(Debug, Default)]
pub struct DecoderCounter {
    pub decoded: AtomicU64,
    pub no_transport: AtomicU64,
    pub sampled_out: AtomicU64,
    pub jumbograms: AtomicU64,
}

impl RefCountable for DecoderCounter {
    fn get_counters(&self) -> Vec<stats::Counter> {
        vec![
            (
                "decoded",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(self.decoded.swap(0, Ordering::Relaxed)),
            ),
            (
                "no_transport",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(self.no_transport.swap(0, Ordering::Relaxed)),
            ),
            (
                "sampled_out",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(self.sampled_out.swap(0, Ordering::Relaxed)),
            ),
            (
                "jumbograms",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(self.jumbograms.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}

/// Decodes raw capture bytes into `PacketInformation`. Layer attempts
/// follow the capture flavors seen in the wild: raw IPv4 first, then
/// Ethernet (with 802.1Q and GRE unwrapping), then raw IPv6 with
/// extension header skipping. A packet that does not yield an IP layer
/// plus a TCP/UDP header is still emitted, with no transport, and ignored
/// downstream.
pub struct Decoder {
    sampling_modulus: u64,
    shard_count: u64,
    counter: Arc<DecoderCounter>,
}

impl Decoder {
    pub fn new(sampling_rate: f64, shard_count: u64, counter: Arc<DecoderCounter>) -> Self {
        // keep the modulus at exactly 1 for full sampling, float division
        // would not guarantee that
        let sampling_modulus = if sampling_rate == 100.0 {
            1
        } else {
            (shard_count as f64 * 100.0 / sampling_rate).round() as u64
        };
        Decoder {
            sampling_modulus,
            shard_count,
            counter,
        }
    }

    pub fn decode(&self, packet: &PacketData) -> PacketInformation {
        let mut info = PacketInformation {
            packet_idx: packet.packet_idx,
            timestamp: packet.timestamp,
            interface: packet.interface,
            ..Default::default()
        };

        let data = packet.data.as_slice();
        let decoded = self.decode_ipv4(data, &mut info)
            || self.decode_ethernet(data, &mut info)
            || self.decode_ipv6(data, &mut info);

        if !decoded {
            self.counter.no_transport.fetch_add(1, Ordering::Relaxed);
            return info;
        }
        self.counter.decoded.fetch_add(1, Ordering::Relaxed);

        // deterministic per-fingerprint sampling keeps or drops both
        // directions of a flow together
        if info.flow_key.0 % self.sampling_modulus > self.shard_count - 1 {
            info.transport = None;
            self.counter.sampled_out.fetch_add(1, Ordering::Relaxed);
        }
        info
    }

    fn decode_ethernet(&self, data: &[u8], info: &mut PacketInformation) -> bool {
        if data.len() < ETH_HEADER_SIZE {
            return false;
        }
        let mut eth_type = read_u16_be(&data[FIELD_OFFSET_ETH_TYPE..]);
        let mut offset = ETH_HEADER_SIZE;
        if eth_type == EthernetType::Dot1Q {
            if data.len() < ETH_HEADER_SIZE + VLAN_HEADER_SIZE {
                return false;
            }
            eth_type = read_u16_be(&data[FIELD_OFFSET_ETH_TYPE + VLAN_HEADER_SIZE..]);
            offset += VLAN_HEADER_SIZE;
        }
        match eth_type {
            e if e == EthernetType::Ipv4 => self.decode_ipv4(&data[offset..], info),
            e if e == EthernetType::Ipv6 => self.decode_ipv6(&data[offset..], info),
            _ => false,
        }
    }

    fn decode_ipv4(&self, data: &[u8], info: &mut PacketInformation) -> bool {
        if data.len() < IPV4_HEADER_SIZE {
            return false;
        }
        if data[FIELD_OFFSET_IHL] >> 4 != 4 {
            return false;
        }
        let ihl = (data[FIELD_OFFSET_IHL] & 0xF) as usize;
        if ihl < 5 || data.len() < ihl * 4 {
            return false;
        }

        info.src_digest = address_digest(&data[FIELD_OFFSET_SIP..FIELD_OFFSET_SIP + IPV4_ADDR_LEN]);
        info.dst_digest = address_digest(&data[FIELD_OFFSET_DIP..FIELD_OFFSET_DIP + IPV4_ADDR_LEN]);
        info.src_ip = <[u8; 4]>::try_from(&data[FIELD_OFFSET_SIP..FIELD_OFFSET_SIP + IPV4_ADDR_LEN])
            .unwrap()
            .into();
        info.dst_ip = <[u8; 4]>::try_from(&data[FIELD_OFFSET_DIP..FIELD_OFFSET_DIP + IPV4_ADDR_LEN])
            .unwrap()
            .into();

        // later fragments carry no transport header
        if read_u16_be(&data[FIELD_OFFSET_FRAG..]) & 0x1FFF != 0 {
            return false;
        }

        let total_len = read_u16_be(&data[FIELD_OFFSET_TOTAL_LEN..]);
        let ip_payload = total_len.saturating_sub((ihl * 4) as u16);
        let l4 = &data[ihl * 4..];
        match data[FIELD_OFFSET_PROTO] {
            p if p == IpProtocol::Tcp => self.decode_tcp(l4, ip_payload, info),
            p if p == IpProtocol::Udp => self.decode_udp(l4, info),
            p if p == IpProtocol::Gre => self.decode_gre(l4, info),
            _ => false,
        }
    }

    fn decode_ipv6(&self, data: &[u8], info: &mut PacketInformation) -> bool {
        if data.len() < IPV6_HEADER_SIZE {
            return false;
        }
        if data[0] >> 4 != 6 {
            return false;
        }
        let mut payload_len = read_u16_be(&data[FIELD_OFFSET_PAYLOAD_LEN..]);
        if payload_len == 0 {
            // jumbograms are unsupported
            self.counter.jumbograms.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        info.src_digest =
            address_digest(&data[FIELD_OFFSET_IPV6_SRC..FIELD_OFFSET_IPV6_SRC + IPV6_ADDR_LEN]);
        info.dst_digest =
            address_digest(&data[FIELD_OFFSET_IPV6_DST..FIELD_OFFSET_IPV6_DST + IPV6_ADDR_LEN]);
        info.src_ip =
            <[u8; 16]>::try_from(&data[FIELD_OFFSET_IPV6_SRC..FIELD_OFFSET_IPV6_SRC + IPV6_ADDR_LEN])
                .unwrap()
                .into();
        info.dst_ip =
            <[u8; 16]>::try_from(&data[FIELD_OFFSET_IPV6_DST..FIELD_OFFSET_IPV6_DST + IPV6_ADDR_LEN])
                .unwrap()
                .into();

        let mut next_header = data[FIELD_OFFSET_NEXT_HEADER];
        let mut offset = IPV6_HEADER_SIZE;
        loop {
            let is_extension = next_header == IpProtocol::Ipv6HopByHop
                || next_header == IpProtocol::Ipv6Routing
                || next_header == IpProtocol::Ipv6Fragment
                || next_header == IpProtocol::Ipv6Destination;
            if !is_extension {
                break;
            }
            if data.len() < offset + 8 {
                return false;
            }
            let ext_len = if next_header == IpProtocol::Ipv6Fragment {
                8
            } else {
                (data[offset + 1] as usize + 1) * 8
            };
            if (payload_len as usize) < ext_len || data.len() < offset + ext_len {
                return false;
            }
            next_header = data[offset];
            payload_len -= ext_len as u16;
            offset += ext_len;
        }

        let l4 = &data[offset..];
        match next_header {
            p if p == IpProtocol::Tcp => self.decode_tcp(l4, payload_len, info),
            p if p == IpProtocol::Udp => self.decode_udp(l4, info),
            p if p == IpProtocol::Gre => self.decode_gre(l4, info),
            _ => false,
        }
    }

    fn decode_gre(&self, data: &[u8], info: &mut PacketInformation) -> bool {
        if data.len() < GRE_HEADER_SIZE {
            return false;
        }
        let flags = read_u16_be(&data[0..]);
        let protocol = read_u16_be(&data[2..]);
        let mut header_size = GRE_HEADER_SIZE;
        if flags & GRE_FLAGS_CSUM_MASK != 0 {
            header_size += 4;
        }
        if flags & GRE_FLAGS_KEY_MASK != 0 {
            header_size += 4;
        }
        if flags & GRE_FLAGS_SEQ_MASK != 0 {
            header_size += 4;
        }
        if data.len() < header_size {
            return false;
        }
        // the flow is keyed on the encapsulated packet
        match protocol {
            p if p == EthernetType::Ipv4 => self.decode_ipv4(&data[header_size..], info),
            p if p == EthernetType::Ipv6 => self.decode_ipv6(&data[header_size..], info),
            _ => false,
        }
    }

    fn decode_tcp(&self, l4: &[u8], ip_payload: u16, info: &mut PacketInformation) -> bool {
        if l4.len() < TCP_HEADER_SIZE {
            return false;
        }
        let data_offset = (l4[FIELD_OFFSET_TCP_DATAOFF] >> 4) as u16;
        info.src_port = read_u16_be(&l4[0..]);
        info.dst_port = read_u16_be(&l4[2..]);
        info.tcp_seq = read_u32_be(&l4[FIELD_OFFSET_TCP_SEQ..]);
        info.tcp_ack = read_u32_be(&l4[FIELD_OFFSET_TCP_ACK..]);
        info.tcp_flags = TcpFlags::from_bits_truncate(l4[FIELD_OFFSET_TCP_FLAG]);
        // data offset counts 32 bit words
        info.payload_len = ip_payload.saturating_sub(data_offset * 4);
        info.transport = Some(L4Protocol::Tcp);
        info.flow_key = flow_key(
            info.src_digest,
            info.dst_digest,
            L4Protocol::Tcp,
            info.src_port,
            info.dst_port,
        );
        true
    }

    fn decode_udp(&self, l4: &[u8], info: &mut PacketInformation) -> bool {
        if l4.len() < UDP_HEADER_SIZE {
            return false;
        }
        info.src_port = read_u16_be(&l4[0..]);
        info.dst_port = read_u16_be(&l4[2..]);
        // the UDP length field, header included
        info.payload_len = read_u16_be(&l4[FIELD_OFFSET_UDP_LEN..]);
        info.transport = Some(L4Protocol::Udp);
        info.flow_key = flow_key(
            info.src_digest,
            info.dst_digest,
            L4Protocol::Udp,
            info.src_port,
            info.dst_port,
        );
        true
    }
}

/// W decoder workers sharing C <= W bounded channels, workers assigned to
/// channels round-robin. The ingest driver picks a channel uniformly at
/// random per batch. Every worker writes its results straight into the
/// reorder buffer and occasionally nudges the drain task.
pub struct DecoderPool {
    senders: Vec<queue::Sender<Vec<PacketData>>>,
    handles: Vec<JoinHandle<()>>,
}

impl DecoderPool {
    pub fn new(
        workers: usize,
        channels: usize,
        sampling_rate: f64,
        shard_count: u64,
        reorder: Arc<ReorderBuffer>,
        flush_signal: queue::Sender<FlushSignal>,
        stats_collector: &stats::Collector,
    ) -> Self {
        let workers = workers.max(1);
        let channels = channels.clamp(1, workers);

        let mut senders = Vec::with_capacity(channels);
        let mut receivers = Vec::with_capacity(channels);
        for id in 0..channels {
            let (sender, receiver, stats_handle) = queue::bounded(DECODER_QUEUE_SIZE);
            stats_collector.register_countable(
                "decoder-queue",
                Countable::Owned(Box::new(stats_handle)),
                vec![("id", id.to_string())],
            );
            senders.push(sender);
            receivers.push(receiver);
        }

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let receiver = receivers[id % channels].clone();
            let counter = Arc::new(DecoderCounter::default());
            stats_collector.register_countable(
                "decoder",
                Countable::Owned(Box::new(counter.clone())),
                vec![("id", id.to_string())],
            );
            let decoder = Decoder::new(sampling_rate, shard_count, counter.clone());
            let reorder = reorder.clone();
            let flush_signal = flush_signal.clone();
            handles.push(thread::spawn(move || {
                let mut rng = rand::thread_rng();
                while let Ok(batch) = receiver.recv(None) {
                    for packet in &batch {
                        reorder.put(decoder.decode(packet));
                    }
                    if rng.gen_range(0..100) < FLUSH_SIGNAL_PERCENT {
                        let _ = flush_signal.try_send(FlushSignal::Drain);
                    }
                }
                info!("decoder {} exited", id);
            }));
        }

        DecoderPool { senders, handles }
    }

    pub fn channels(&self) -> usize {
        self.senders.len()
    }

    // Blocks when the chosen channel is full; this is where ingest slows
    // down to decoder speed.
    pub fn send(&self, channel: usize, batch: Vec<PacketData>) {
        if self.senders[channel].send(batch).is_err() {
            log::warn!("decoder channel {} terminated", channel);
        }
    }

    // Closes the channels; each worker drains what is queued and exits.
    pub fn close(self) {
        drop(self.senders);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}
