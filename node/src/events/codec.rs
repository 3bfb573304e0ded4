// Copyright 2020 The Trilith Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::bail;
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::{MessageHeader, PeerMessage, HEADER_SIZE};
use trilith::{constants::WIRE_VERSION, wire::WireDecode};

/// Frames [`PeerMessage`]s over a delegate socket: the 8-byte header
/// followed by `payload_size` bytes of payload.
#[derive(Debug)]
pub struct MessagesCodec {
    /// Maximum accepted payload length in bytes.
    max_message_len: u32,
}

impl MessagesCodec {
    /// Creates a codec with the given payload cap.
    pub fn new(max_message_len: u32) -> Self {
        Self { max_message_len }
    }
}

impl Decoder for MessagesCodec {
    type Item = PeerMessage;
    type Error = anyhow::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = MessageHeader::from_wire(&buf[..HEADER_SIZE])?;
        if header.version != WIRE_VERSION {
            bail!(
                "peer speaks wire version {}, local version is {}",
                header.version,
                WIRE_VERSION
            );
        }
        if header.payload_size > self.max_message_len {
            bail!(
                "received message is too long: payload = {}, allowed = {}",
                header.payload_size,
                self.max_message_len
            );
        }

        let frame_len = HEADER_SIZE + header.payload_size as usize;
        if buf.len() < frame_len {
            return Ok(None);
        }

        let message = PeerMessage::decode_payload(&header, &buf[HEADER_SIZE..frame_len])?;
        buf.advance(frame_len);
        Ok(Some(message))
    }
}

impl Encoder<PeerMessage> for MessagesCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, msg: PeerMessage, buf: &mut BytesMut) -> Result<(), Self::Error> {
        buf.extend_from_slice(&msg.to_frame());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut codec = MessagesCodec::new(1024);
        let frame = PeerMessage::HeartBeat.to_frame();

        let mut buf = BytesMut::from(&frame[..HEADER_SIZE - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        let mut buf = BytesMut::from(&frame[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(PeerMessage::HeartBeat));
        assert!(buf.is_empty());
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut codec = MessagesCodec::new(1024);
        let mut buf = BytesMut::new();
        codec.encode(PeerMessage::HeartBeat, &mut buf).unwrap();
        codec.encode(PeerMessage::TipRequest, &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(PeerMessage::HeartBeat));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(PeerMessage::TipRequest));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn oversized_payloads_are_rejected() {
        let mut codec = MessagesCodec::new(4);
        let frame = PeerMessage::PullRequest {
            hash: trilith_crypto::hash(b"wanted"),
        }
        .to_frame();
        let mut buf = BytesMut::from(&frame[..]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
