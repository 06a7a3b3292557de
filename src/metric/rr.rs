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

use crate::flow_generator::Flow;

/// One paired client request burst and the server response that follows
/// it. Timestamps are packet-clock nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestResponse {
    pub request_start: i64,
    pub request_end: i64,
    pub request_bytes: u64,
    pub response_start: i64,
    pub response_bytes: u64,
}

impl RequestResponse {
    pub fn response_delay(&self) -> i64 {
        self.response_start - self.request_end
    }
}

/// Walks a flow's packet list and pairs client→server bursts with the
/// server→client burst that follows. Only payload-carrying packets count;
/// a flow without any payload is reported as droppable, in which case the
/// caller emits no record at all.
pub struct ReqResIdentifier;

impl ReqResIdentifier {
    pub fn new() -> Self {
        ReqResIdentifier
    }

    // Returns the identified pairs and whether the flow should be dropped.
    pub fn identify(&self, flow: &Flow) -> (Vec<RequestResponse>, bool) {
        let mut bursts = Vec::new();
        for packet in flow.packets.iter().filter(|p| p.payload_len > 0) {
            match bursts.last_mut() {
                Some((from_client, _, end, bytes)) if *from_client == packet.from_client => {
                    *end = packet.timestamp;
                    *bytes += packet.payload_len as u64;
                }
                _ => bursts.push((
                    packet.from_client,
                    packet.timestamp,
                    packet.timestamp,
                    packet.payload_len as u64,
                )),
            }
        }
        if bursts.is_empty() {
            return (vec![], true);
        }

        let mut pairs = Vec::new();
        let mut i = 0;
        while i + 1 < bursts.len() {
            let (from_client, start, end, bytes) = bursts[i];
            if !from_client {
                // a response with no preceding request, skip it
                i += 1;
                continue;
            }
            let (_, resp_start, _, resp_bytes) = bursts[i + 1];
            pairs.push(RequestResponse {
                request_start: start,
                request_end: end,
                request_bytes: bytes,
                response_start: resp_start,
                response_bytes: resp_bytes,
            });
            i += 2;
        }
        (pairs, false)
    }
}
