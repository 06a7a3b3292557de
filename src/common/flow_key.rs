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

use std::fmt;
use std::hash::Hasher;

use twox_hash::XxHash64;

use super::enums::L4Protocol;

/// Symmetric fingerprint of a transport conversation. Swapping the two
/// endpoints yields the same key for the same protocol, so both directions
/// of a flow land in the same map entry and the same shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FlowKey(pub u64);

impl FlowKey {
    pub fn shard(&self, shard_count: u64) -> usize {
        (self.0 % shard_count) as usize
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

pub fn address_digest(addr: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(addr);
    hasher.finish()
}

// Endpoints hash independently over port||digest and combine with wrapping
// addition. Addition commutes, which is what makes the key symmetric.
pub fn flow_key(
    src_digest: u64,
    dst_digest: u64,
    protocol: L4Protocol,
    src_port: u16,
    dst_port: u16,
) -> FlowKey {
    let hash_src = endpoint_hash(src_port, src_digest);
    let hash_dst = endpoint_hash(dst_port, dst_digest);
    FlowKey(
        hash_src
            .wrapping_add(u8::from(protocol) as u64)
            .wrapping_add(hash_dst),
    )
}

fn endpoint_hash(port: u16, digest: u64) -> u64 {
    let mut buf = [0u8; 10];
    buf[..2].copy_from_slice(&port.to_le_bytes());
    buf[2..].copy_from_slice(&digest.to_le_bytes());
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(&buf);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_symmetric() {
        let cases = [
            (0x1122u64, 0x3344u64, 40000u16, 80u16),
            (u64::MAX, 0, 1, 65535),
            (0xdeadbeef, 0xdeadbeef, 443, 443),
            (7, 13, 53, 40001),
        ];
        for (a, b, pa, pb) in cases {
            for proto in [L4Protocol::Tcp, L4Protocol::Udp] {
                assert_eq!(
                    flow_key(a, b, proto, pa, pb),
                    flow_key(b, a, proto, pb, pa),
                    "key must not depend on direction"
                );
            }
        }
    }

    #[test]
    fn key_depends_on_protocol() {
        let tcp = flow_key(1, 2, L4Protocol::Tcp, 80, 40000);
        let udp = flow_key(1, 2, L4Protocol::Udp, 80, 40000);
        assert_ne!(tcp, udp);
        // TCP tags the sum with 1, UDP with 0
        assert_eq!(tcp.0, udp.0.wrapping_add(1));
    }

    #[test]
    fn shard_is_stable() {
        let key = flow_key(11, 22, L4Protocol::Tcp, 1234, 80);
        assert_eq!(key.shard(14), (key.0 % 14) as usize);
        assert!(key.shard(14) < 14);
    }
}
