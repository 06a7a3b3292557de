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

use std::net::{IpAddr, Ipv4Addr};

use crate::common::enums::{L4Protocol, TcpFlags};
use crate::common::{FlowKey, PacketInformation};

use super::flow_config::FlowTimeout;

// Ports above this are ephemeral; used by the direction heuristic when no
// handshake was observed.
const MAX_REGISTERED_PORT: u16 = 49151;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Open,
    Closing,
    Closed,
    Reset,
}

/// One packet as recorded inside a flow, in ingest-index order.
#[derive(Debug, Clone, Copy)]
pub struct FlowPacket {
    pub timestamp: i64,
    pub packet_idx: i64,
    pub payload_len: u16,
    pub from_client: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TcpSegment {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
}

/// A bidirectional conversation between two endpoints. The client is the
/// endpoint that initiated the connection, or the one guessed from port
/// numbers when no SYN was seen; the assignment is made once, from the
/// first admitted packet, and never changes afterwards.
#[derive(Debug, Clone)]
pub struct Flow {
    pub flow_key: FlowKey,
    pub protocol: L4Protocol,
    pub timeout_at: i64,

    pub client_digest: u64,
    pub server_digest: u64,
    pub client_port: u16,
    pub server_port: u16,
    pub client_addr: IpAddr,
    pub server_addr: IpAddr,
    pub client_interface: u8,
    pub server_interface: u8,
    pub server_client_unclear: bool,

    pub packets: Vec<FlowPacket>,
}

impl Flow {
    fn new(flow_key: FlowKey, protocol: L4Protocol) -> Self {
        Flow {
            flow_key,
            protocol,
            timeout_at: 0,
            client_digest: 0,
            server_digest: 0,
            client_port: 0,
            server_port: 0,
            client_addr: Ipv4Addr::UNSPECIFIED.into(),
            server_addr: Ipv4Addr::UNSPECIFIED.into(),
            client_interface: 0,
            server_interface: 0,
            server_client_unclear: false,
            packets: Vec::new(),
        }
    }

    fn add_packet(&mut self, packet: &PacketInformation) {
        self.packets.push(FlowPacket {
            from_client: self.client_digest == packet.src_digest
                && self.client_port == packet.src_port,
            packet_idx: packet.packet_idx,
            timestamp: packet.timestamp,
            payload_len: packet.payload_len,
        });
    }

    fn assign_from_client(&mut self, packet: &PacketInformation) {
        self.client_digest = packet.src_digest;
        self.client_port = packet.src_port;
        self.client_addr = packet.src_ip;
        self.client_interface = packet.interface;
        self.server_digest = packet.dst_digest;
        self.server_port = packet.dst_port;
        self.server_addr = packet.dst_ip;
        self.server_interface = packet.interface;
    }

    fn assign_from_server(&mut self, packet: &PacketInformation) {
        self.client_digest = packet.dst_digest;
        self.client_port = packet.dst_port;
        self.client_addr = packet.dst_ip;
        self.client_interface = packet.interface;
        self.server_digest = packet.src_digest;
        self.server_port = packet.src_port;
        self.server_addr = packet.src_ip;
        self.server_interface = packet.interface;
    }

    pub fn first_timestamp(&self) -> i64 {
        self.packets.first().map(|p| p.timestamp).unwrap_or(0)
    }

    pub fn last_timestamp(&self) -> i64 {
        self.packets.last().map(|p| p.timestamp).unwrap_or(0)
    }

    pub fn payload_bytes(&self) -> u64 {
        self.packets.iter().map(|p| p.payload_len as u64).sum()
    }
}

#[derive(Debug, Clone)]
pub struct TcpFlow {
    pub flow: Flow,
    pub segments: Vec<TcpSegment>,
    pub rst_index: i32,
    pub first_fin_index: i32,
}

impl TcpFlow {
    pub fn new(packet: &PacketInformation, timeout: &FlowTimeout) -> Self {
        let mut f = TcpFlow {
            flow: Flow::new(packet.flow_key, L4Protocol::Tcp),
            segments: Vec::new(),
            rst_index: -1,
            first_fin_index: -1,
        };
        f.set_client_server(packet);
        f.add_packet(packet, timeout);
        f
    }

    pub fn add_packet(&mut self, packet: &PacketInformation, timeout: &FlowTimeout) {
        self.flow.add_packet(packet);
        self.segments.push(TcpSegment {
            seq: packet.tcp_seq,
            ack: packet.tcp_ack,
            flags: packet.tcp_flags,
        });

        let flags = packet.tcp_flags;
        if flags.contains(TcpFlags::RST) {
            self.rst_index = self.flow.packets.len() as i32 - 1;
            self.flow.timeout_at = packet.timestamp + timeout.tcp_rst;
        } else if flags.contains(TcpFlags::FIN) && self.first_fin_index == -1 {
            self.first_fin_index = self.flow.packets.len() as i32 - 1;
            self.flow.timeout_at = packet.timestamp + timeout.tcp_fin;
        } else {
            self.flow.timeout_at = packet.timestamp + timeout.tcp;
        }
    }

    fn set_client_server(&mut self, packet: &PacketInformation) {
        let flags = packet.tcp_flags & (TcpFlags::SYN | TcpFlags::ACK);
        if flags == TcpFlags::SYN {
            self.flow.assign_from_client(packet);
            self.flow.server_client_unclear = false;
        } else if flags == TcpFlags::SYN_ACK {
            self.flow.assign_from_server(packet);
            self.flow.server_client_unclear = false;
        } else if packet.src_port <= MAX_REGISTERED_PORT && packet.src_port < packet.dst_port {
            // sender talks from a standardized port into the ephemeral range
            self.flow.assign_from_server(packet);
            self.flow.server_client_unclear = true;
        } else {
            self.flow.assign_from_client(packet);
            self.flow.server_client_unclear = true;
        }
    }

    // Closed is never derived here, a flow is implicitly closed when it is
    // flushed out of the shard.
    pub fn state(&self) -> FlowState {
        if self.rst_index >= 0 {
            FlowState::Reset
        } else if self.first_fin_index >= 0 {
            FlowState::Closing
        } else {
            FlowState::Open
        }
    }

    pub fn has_syn_ack(&self) -> bool {
        self.segments
            .iter()
            .any(|s| s.flags.contains(TcpFlags::SYN_ACK))
    }
}

#[derive(Debug, Clone)]
pub struct UdpFlow {
    pub flow: Flow,
}

impl UdpFlow {
    pub fn new(packet: &PacketInformation, timeout: &FlowTimeout) -> Self {
        let mut f = UdpFlow {
            flow: Flow::new(packet.flow_key, L4Protocol::Udp),
        };
        f.set_client_server(packet);
        f.add_packet(packet, timeout);
        f
    }

    pub fn add_packet(&mut self, packet: &PacketInformation, timeout: &FlowTimeout) {
        self.flow.add_packet(packet);
        self.flow.timeout_at = packet.timestamp + timeout.udp;
    }

    fn set_client_server(&mut self, packet: &PacketInformation) {
        if packet.src_port <= MAX_REGISTERED_PORT && packet.src_port < packet.dst_port {
            self.flow.assign_from_server(packet);
        } else {
            self.flow.assign_from_client(packet);
        }
        // without a handshake UDP direction is always a guess
        self.flow.server_client_unclear = true;
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::common::flow_key;

    fn tcp_packet(
        src_digest: u64,
        dst_digest: u64,
        src_port: u16,
        dst_port: u16,
        flags: TcpFlags,
        timestamp: i64,
        payload_len: u16,
    ) -> PacketInformation {
        PacketInformation {
            packet_idx: 1,
            timestamp,
            flow_key: flow_key(src_digest, dst_digest, L4Protocol::Tcp, src_port, dst_port),
            transport: Some(L4Protocol::Tcp),
            src_digest,
            dst_digest,
            src_ip: Ipv4Addr::new(10, 0, 0, 1).into(),
            dst_ip: Ipv4Addr::new(10, 0, 0, 2).into(),
            src_port,
            dst_port,
            payload_len,
            tcp_flags: flags,
            ..Default::default()
        }
    }

    const TIMEOUT: FlowTimeout = FlowTimeout {
        tcp: 10_000_000,
        tcp_fin: 2_000_000,
        tcp_rst: 1_000_000,
        udp: 5_000_000,
    };

    #[test]
    fn syn_sender_is_client() {
        let f = TcpFlow::new(
            &tcp_packet(0xa, 0xb, 40000, 80, TcpFlags::SYN, 0, 0),
            &TIMEOUT,
        );
        assert_eq!(f.flow.client_digest, 0xa);
        assert_eq!(f.flow.client_port, 40000);
        assert_eq!(f.flow.server_port, 80);
        assert!(!f.flow.server_client_unclear);
        assert!(f.flow.packets[0].from_client);
    }

    #[test]
    fn syn_ack_sender_is_server() {
        let f = TcpFlow::new(
            &tcp_packet(0xb, 0xa, 80, 40000, TcpFlags::SYN_ACK, 0, 0),
            &TIMEOUT,
        );
        assert_eq!(f.flow.client_digest, 0xa);
        assert_eq!(f.flow.client_port, 40000);
        assert_eq!(f.flow.server_digest, 0xb);
        assert!(!f.flow.server_client_unclear);
        assert!(!f.flow.packets[0].from_client);
    }

    #[test]
    fn ack_first_packet_uses_port_heuristic() {
        // 33000 is a registered port but not lower than 443, so the
        // server rule does not fire and the sender becomes the client
        let f = TcpFlow::new(
            &tcp_packet(0xa, 0xb, 33000, 443, TcpFlags::ACK, 0, 100),
            &TIMEOUT,
        );
        assert_eq!(f.flow.client_digest, 0xa);
        assert!(f.flow.server_client_unclear);

        let f = TcpFlow::new(
            &tcp_packet(0xb, 0xa, 443, 33000, TcpFlags::ACK, 0, 100),
            &TIMEOUT,
        );
        assert_eq!(f.flow.client_digest, 0xa);
        assert_eq!(f.flow.server_port, 443);
        assert!(f.flow.server_client_unclear);
    }

    #[test]
    fn client_server_fixed_after_creation() {
        let mut f = TcpFlow::new(
            &tcp_packet(0xa, 0xb, 40000, 80, TcpFlags::SYN, 0, 0),
            &TIMEOUT,
        );
        f.add_packet(
            &tcp_packet(0xb, 0xa, 80, 40000, TcpFlags::SYN_ACK, 1, 0),
            &TIMEOUT,
        );
        assert_eq!(f.flow.client_digest, 0xa);
        assert_eq!(f.flow.client_port, 40000);
        assert!(!f.flow.packets[1].from_client);
    }

    #[test]
    fn deadline_priority() {
        let mut f = TcpFlow::new(
            &tcp_packet(0xa, 0xb, 40000, 80, TcpFlags::SYN, 100, 0),
            &TIMEOUT,
        );
        assert_eq!(f.flow.timeout_at, 100 + TIMEOUT.tcp);

        f.add_packet(
            &tcp_packet(0xa, 0xb, 40000, 80, TcpFlags::FIN_ACK, 200, 0),
            &TIMEOUT,
        );
        assert_eq!(f.flow.timeout_at, 200 + TIMEOUT.tcp_fin);
        assert_eq!(f.first_fin_index, 1);
        assert_eq!(f.state(), FlowState::Closing);

        f.add_packet(
            &tcp_packet(0xa, 0xb, 40000, 80, TcpFlags::RST, 300, 0),
            &TIMEOUT,
        );
        assert_eq!(f.flow.timeout_at, 300 + TIMEOUT.tcp_rst);
        assert_eq!(f.rst_index, 2);
        assert_eq!(f.state(), FlowState::Reset);
    }

    #[test]
    fn first_fin_index_is_sticky() {
        let mut f = TcpFlow::new(
            &tcp_packet(0xa, 0xb, 40000, 80, TcpFlags::FIN_ACK, 0, 0),
            &TIMEOUT,
        );
        assert_eq!(f.first_fin_index, 0);
        f.add_packet(
            &tcp_packet(0xb, 0xa, 80, 40000, TcpFlags::FIN_ACK, 1, 0),
            &TIMEOUT,
        );
        assert_eq!(f.first_fin_index, 0);
        // a later FIN falls back to the established deadline
        assert_eq!(f.flow.timeout_at, 1 + TIMEOUT.tcp);
    }

    #[test]
    fn udp_direction_heuristic() {
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
        let f = UdpFlow::new(&packet, &TIMEOUT);
        assert_eq!(f.flow.server_digest, 0xa);
        assert_eq!(f.flow.server_port, 53);
        assert_eq!(f.flow.client_port, 40000);
        assert!(f.flow.server_client_unclear);
        assert_eq!(f.flow.timeout_at, TIMEOUT.udp);
        assert!(!f.flow.packets[0].from_client);
    }

    #[test]
    fn has_syn_ack_scan() {
        let mut f = TcpFlow::new(
            &tcp_packet(0xa, 0xb, 40000, 80, TcpFlags::SYN, 0, 0),
            &TIMEOUT,
        );
        assert!(!f.has_syn_ack());
        f.add_packet(
            &tcp_packet(0xb, 0xa, 80, 40000, TcpFlags::SYN_ACK, 1, 0),
            &TIMEOUT,
        );
        assert!(f.has_syn_ack());
    }
}
