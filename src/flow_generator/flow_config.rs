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

use std::time::Duration;

pub const TIMEOUT_TCP: Duration = Duration::from_secs(300);
pub const TIMEOUT_TCP_FIN: Duration = Duration::from_secs(35);
pub const TIMEOUT_TCP_RST: Duration = Duration::from_secs(5);
pub const TIMEOUT_UDP: Duration = Duration::from_secs(120);

/// Flow expiry deadlines in nanoseconds, fixed at shard construction.
/// A packet always replaces its flow's deadline: RST wins over a first
/// FIN, which wins over the established timeout.
#[derive(Debug, Clone, Copy)]
pub struct FlowTimeout {
    pub tcp: i64,
    pub tcp_fin: i64,
    pub tcp_rst: i64,
    pub udp: i64,
}

impl FlowTimeout {
    pub fn new(tcp: Duration, tcp_fin: Duration, tcp_rst: Duration, udp: Duration) -> Self {
        Self {
            tcp: tcp.as_nanos() as i64,
            tcp_fin: tcp_fin.as_nanos() as i64,
            tcp_rst: tcp_rst.as_nanos() as i64,
            udp: udp.as_nanos() as i64,
        }
    }
}

impl Default for FlowTimeout {
    fn default() -> Self {
        Self::new(TIMEOUT_TCP, TIMEOUT_TCP_FIN, TIMEOUT_TCP_RST, TIMEOUT_UDP)
    }
}
