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

use super::enums::{L4Protocol, TcpFlags};
use super::flow_key::FlowKey;

/// A raw packet as handed over by the capture source. `packet_idx` is the
/// dense, monotonically increasing index assigned by the ingest driver,
/// starting at 1. It doubles as the reorder buffer address.
#[derive(Debug, Clone)]
pub struct PacketData {
    pub data: Vec<u8>,
    pub timestamp: i64,
    pub packet_idx: i64,
    pub interface: u8,
}

/// Decoded form of one packet. Exactly one of these is produced per raw
/// packet; `transport` is None when the packet is not TCP/UDP, could not be
/// decoded, or was excluded by sampling. The TCP fields are only
/// meaningful for `transport == Some(Tcp)`.
#[derive(Debug, Clone)]
pub struct PacketInformation {
    pub packet_idx: i64,
    pub timestamp: i64,
    pub interface: u8,

    pub flow_key: FlowKey,
    pub transport: Option<L4Protocol>,

    pub src_digest: u64,
    pub dst_digest: u64,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload_len: u16,

    pub tcp_flags: TcpFlags,
    pub tcp_seq: u32,
    pub tcp_ack: u32,
}

impl Default for PacketInformation {
    fn default() -> Self {
        PacketInformation {
            packet_idx: 0,
            timestamp: 0,
            interface: 0,
            flow_key: FlowKey::default(),
            transport: None,
            src_digest: 0,
            dst_digest: 0,
            src_ip: Ipv4Addr::UNSPECIFIED.into(),
            dst_ip: Ipv4Addr::UNSPECIFIED.into(),
            src_port: 0,
            dst_port: 0,
            payload_len: 0,
            tcp_flags: TcpFlags::empty(),
            tcp_seq: 0,
            tcp_ack: 0,
        }
    }
}
