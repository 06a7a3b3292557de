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

pub const ETH_HEADER_SIZE: usize = 14;
pub const VLAN_HEADER_SIZE: usize = 4;
pub const ETH_TYPE_LEN: usize = 2;
pub const FIELD_OFFSET_ETH_TYPE: usize = 12;

pub const IPV4_HEADER_SIZE: usize = 20;
pub const FIELD_OFFSET_IHL: usize = 0;
pub const FIELD_OFFSET_TOTAL_LEN: usize = 2;
pub const FIELD_OFFSET_FRAG: usize = 6;
pub const FIELD_OFFSET_PROTO: usize = 9;
pub const FIELD_OFFSET_SIP: usize = 12;
pub const FIELD_OFFSET_DIP: usize = 16;
pub const IPV4_ADDR_LEN: usize = 4;

pub const IPV6_HEADER_SIZE: usize = 40;
pub const FIELD_OFFSET_PAYLOAD_LEN: usize = 4;
pub const FIELD_OFFSET_NEXT_HEADER: usize = 6;
pub const FIELD_OFFSET_IPV6_SRC: usize = 8;
pub const FIELD_OFFSET_IPV6_DST: usize = 24;
pub const IPV6_ADDR_LEN: usize = 16;

pub const TCP_HEADER_SIZE: usize = 20;
pub const FIELD_OFFSET_TCP_SEQ: usize = 4;
pub const FIELD_OFFSET_TCP_ACK: usize = 8;
pub const FIELD_OFFSET_TCP_DATAOFF: usize = 12;
pub const FIELD_OFFSET_TCP_FLAG: usize = 13;

pub const UDP_HEADER_SIZE: usize = 8;
pub const FIELD_OFFSET_UDP_LEN: usize = 4;

pub const GRE_HEADER_SIZE: usize = 4;
pub const GRE_FLAGS_CSUM_MASK: u16 = 0x8000;
pub const GRE_FLAGS_KEY_MASK: u16 = 0x2000;
pub const GRE_FLAGS_SEQ_MASK: u16 = 0x1000;

// ERF framing: an 18 byte record header in front of the Ethernet frame.
// Byte 8 is the record type, byte 9 carries the interface in its low bits.
pub const ERF_HEADER_SIZE: usize = 18;
pub const ERF_TYPE_OFFSET: usize = 8;
pub const ERF_TYPE_ETH: u8 = 0x02;
pub const ERF_FLAGS_OFFSET: usize = 9;
pub const ERF_FLAGS_IFACE_MASK: u8 = 0x03;
