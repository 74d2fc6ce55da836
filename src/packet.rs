// Copyright (c) 2025 The LLUDP Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::Bytes;

use crate::throttle::Category;

/// A serialized outgoing packet together with the metadata the egress
/// pipeline needs for throttling and reliability accounting.
///
/// The payload buffer itself is opaque to the pipeline; it is handed to the
/// send sink unchanged.
#[derive(Clone, Debug)]
pub struct OutgoingPacket {
    /// Throttle category of the packet.
    pub category: Category,

    /// Serialized packet bytes.
    pub payload: Bytes,

    /// Sequence number assigned when the packet was recorded as reliable.
    /// Zero until then.
    pub sequence: u32,

    /// Number of times the packet has been resent.
    pub resend_count: u32,

    /// Tick at which the packet was last handed to the send sink.
    pub tick_sent: i32,
}

impl OutgoingPacket {
    /// Create a packet ready for enqueueing.
    pub fn new(category: Category, payload: Bytes) -> Self {
        Self {
            category,
            payload,
            sequence: 0,
            resend_count: 0,
            tick_sent: 0,
        }
    }

    /// Length of the serialized payload, used for token accounting.
    pub fn payload_len(&self) -> u32 {
        self.payload.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_len() {
        let pkt = OutgoingPacket::new(Category::Texture, Bytes::from_static(&[0u8; 600]));
        assert_eq!(pkt.payload_len(), 600);
        assert_eq!(pkt.sequence, 0);
        assert_eq!(pkt.resend_count, 0);
    }
}
