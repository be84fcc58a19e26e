// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Subscription contract for the upstream frame producer. The real bus is an
//! external collaborator; this module only owns the subscribe/iterate/decode
//! shape so a pub/sub-backed implementation and a deterministic in-memory
//! one used by tests can share call sites.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;

use anyhow::{Context, Result};
use serde::Deserialize;

/// A single decoded pub/sub message from the producer.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub sequence: u64,
    pub timestamp: String,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub rgb: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct FrameEnvelope {
    data: String,
    time: String,
    size: (u32, u32, u32),
    frame_number: u64,
}

impl Frame {
    /// Decodes a bus envelope, base64-decoding the payload. Deferred so
    /// workers that never touch pixel data (e.g. `probe`) don't pay for it.
    pub fn decode(envelope_json: &str) -> Result<Self> {
        let envelope: FrameEnvelope =
            serde_json::from_str(envelope_json).context("malformed frame envelope")?;
        let rgb = base64::decode(envelope.data).context("frame payload was not valid base64")?;
        let (width, height, channels) = envelope.size;
        Ok(Frame {
            sequence: envelope.frame_number,
            timestamp: envelope.time,
            width,
            height,
            channels,
            rgb,
        })
    }
}

/// Subscribes to one named channel and yields a lazy, potentially-infinite,
/// non-restartable sequence of frames. On bus connection loss the source
/// surfaces a bounded error and terminates; it does not auto-reconnect.
pub trait FrameSource: Send {
    /// Blocks until the next frame is available or the bus connection is
    /// lost. Returns `Ok(None)` only when the source has been deliberately
    /// closed (used by the in-memory test double); a real bus failure is an
    /// `Err`.
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// A bus endpoint as resolved from configuration.
#[derive(Debug, Clone)]
pub struct BusEndpoint {
    pub host: String,
    pub port: u16,
    pub channel: String,
}

/// Deterministic in-memory frame source backed by a fixed list, standing in
/// for the real pub/sub client in tests and the integration-test harness.
pub struct FakeFrameSource {
    frames: std::collections::VecDeque<Frame>,
}

impl FakeFrameSource {
    pub fn new(frames: Vec<Frame>) -> Self {
        FakeFrameSource {
            frames: frames.into(),
        }
    }
}

impl FrameSource for FakeFrameSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        Ok(self.frames.pop_front())
    }
}

/// A real bus subscription: connects to the endpoint over TCP, sends the
/// channel name as a single subscribe line, then reads one frame envelope
/// per line for the rest of the connection's life. The producer and the
/// wire format on its side of the socket are the external collaborator;
/// this is only the consuming half, using the same newline-delimited JSON
/// idiom the rest of this binary speaks.
pub struct BusFrameSource {
    lines: std::io::Lines<BufReader<TcpStream>>,
}

impl BusFrameSource {
    pub fn connect(endpoint: &BusEndpoint) -> Result<Self> {
        let mut stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .with_context(|| format!("connecting to frame bus at {}:{}", endpoint.host, endpoint.port))?;
        writeln!(stream, "{}", endpoint.channel).context("subscribing to frame bus channel")?;
        let reader = BufReader::new(stream);
        Ok(BusFrameSource {
            lines: reader.lines(),
        })
    }
}

impl FrameSource for BusFrameSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match self.lines.next() {
            Some(Ok(line)) if line.trim().is_empty() => self.next_frame(),
            Some(Ok(line)) => Frame::decode(&line).map(Some),
            Some(Err(err)) => Err(err).context("frame bus connection lost"),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_envelope_and_base64_payload() {
        let payload = base64::encode([1u8, 2, 3]);
        let envelope = format!(
            r#"{{"data":"{payload}","time":"00:00:01.000000","size":[1,1,3],"frame_number":7}}"#
        );
        let frame = Frame::decode(&envelope).unwrap();
        assert_eq!(frame.sequence, 7);
        assert_eq!(frame.rgb, vec![1, 2, 3]);
        assert_eq!((frame.width, frame.height, frame.channels), (1, 1, 3));
    }

    #[test]
    fn fake_source_yields_frames_in_order_then_ends() {
        let frames = vec![
            Frame {
                sequence: 0,
                timestamp: "t0".into(),
                width: 1,
                height: 1,
                channels: 3,
                rgb: vec![],
            },
            Frame {
                sequence: 1,
                timestamp: "t1".into(),
                width: 1,
                height: 1,
                channels: 3,
                rgb: vec![],
            },
        ];
        let mut source = FakeFrameSource::new(frames);
        assert_eq!(source.next_frame().unwrap().unwrap().sequence, 0);
        assert_eq!(source.next_frame().unwrap().unwrap().sequence, 1);
        assert!(source.next_frame().unwrap().is_none());
    }
}
