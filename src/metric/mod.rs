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

pub mod flows;
pub mod rr;

use crate::flow_generator::{TcpFlow, UdpFlow};

/// Callback contract invoked by the flow shards when a flow is flushed.
/// Implementations run on the shard threads, concurrently across shards.
/// Registration happens at startup only.
pub trait FlowMetric: Send + Sync {
    fn on_tcp_flush(&self, flow: &TcpFlow);
    fn on_udp_flush(&self, flow: &UdpFlow);
}

pub use flows::FlowMetricSet;
pub use rr::{ReqResIdentifier, RequestResponse};
