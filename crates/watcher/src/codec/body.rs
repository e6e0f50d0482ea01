// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-kind body layouts.
//!
//! Strings are `u16` length + UTF-8, lists are `u16` count + items, node
//! addresses are a family byte (4 or 6) followed by the octets, and colors
//! are four RGBA bytes.

use super::CodecError;
use crate::envelope::{MessageType, SCHEMA_VERSION};
use crate::message::{
    Color, ColorMessage, ConnectivityMessage, DataPointMessage, EdgeMessage, GpsMessage,
    LabelMessage, NodeEvent, NodeStatusMessage, Payload, SeekPosition, StatusKind, StreamInfo,
    TestMessage,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const MAX_FIELD_LEN: usize = u16::MAX as usize;

pub(super) fn write_body(out: &mut Vec<u8>, payload: &Payload) -> Result<(), CodecError> {
    match payload {
        Payload::Status(kind) => out.write_u8(kind.to_u8())?,
        Payload::Test(m) => {
            write_str(out, "text", &m.text)?;
            write_count(out, "ints", m.ints.len())?;
            for v in &m.ints {
                out.write_i32::<BigEndian>(*v)?;
            }
        }
        Payload::Gps(m) => {
            write_addr(out, &m.node)?;
            out.write_f64::<BigEndian>(m.lat)?;
            out.write_f64::<BigEndian>(m.lng)?;
            out.write_f64::<BigEndian>(m.alt)?;
        }
        Payload::Label(m) => {
            write_addr(out, &m.node)?;
            write_str(out, "text", &m.text)?;
            out.write_f32::<BigEndian>(m.font_size)?;
            write_color(out, &m.foreground);
            write_color(out, &m.background);
            out.write_u32::<BigEndian>(m.expiration_ms)?;
            out.write_u8(m.add as u8)?;
            write_str(out, "layer", &m.layer)?;
        }
        Payload::Edge(m) => {
            write_addr(out, &m.node1)?;
            write_addr(out, &m.node2)?;
            write_color(out, &m.color);
            out.write_f32::<BigEndian>(m.width)?;
            out.write_u8(m.bidirectional as u8)?;
            out.write_u32::<BigEndian>(m.expiration_ms)?;
            out.write_u8(m.add as u8)?;
            write_str(out, "layer", &m.layer)?;
        }
        Payload::Color(m) => {
            write_addr(out, &m.node)?;
            write_color(out, &m.color);
            out.write_u32::<BigEndian>(m.flash_period_ms)?;
            out.write_u32::<BigEndian>(m.expiration_ms)?;
            write_str(out, "layer", &m.layer)?;
        }
        Payload::Connectivity(m) => {
            write_addr(out, &m.node)?;
            write_str(out, "layer", &m.layer)?;
            write_count(out, "neighbors", m.neighbors.len())?;
            for n in &m.neighbors {
                write_addr(out, n)?;
            }
        }
        Payload::DataPoint(m) => {
            write_addr(out, &m.node)?;
            write_str(out, "name", &m.name)?;
            write_count(out, "points", m.points.len())?;
            for p in &m.points {
                out.write_f64::<BigEndian>(*p)?;
            }
        }
        Payload::NodeStatus(m) => {
            write_addr(out, &m.node)?;
            out.write_u8(match m.event {
                NodeEvent::Connect => 0,
                NodeEvent::Disconnect => 1,
            })?;
        }
        Payload::Seek(pos) => out.write_i64::<BigEndian>(pos.to_offset())?,
        Payload::Start | Payload::Stop => {}
        Payload::Speed(speed) => out.write_f32::<BigEndian>(*speed)?,
        Payload::PlaybackTimeRange { min, max } => {
            out.write_i64::<BigEndian>(*min)?;
            out.write_i64::<BigEndian>(*max)?;
        }
        Payload::ListStreams(streams) => {
            write_count(out, "streams", streams.len())?;
            for s in streams {
                out.write_u32::<BigEndian>(s.uid)?;
                write_str(out, "description", &s.description)?;
            }
        }
        Payload::SubscribeStream(uid) => out.write_u32::<BigEndian>(*uid)?,
        Payload::StreamDescription(desc) => write_str(out, "description", desc)?,
        Payload::Hello { version } => out.write_u16::<BigEndian>(*version)?,
        Payload::Unknown { body, .. } => out.extend_from_slice(body),
    }
    Ok(())
}

pub(super) fn read_body(
    message_type: MessageType,
    version: u16,
    body: &[u8],
) -> Result<Payload, CodecError> {
    let mut r = BodyReader {
        buf: body,
        message_type,
    };

    let payload = match message_type {
        MessageType::Status => {
            let raw = r.u8()?;
            let kind = StatusKind::from_u8(raw)
                .ok_or_else(|| r.malformed(format!("unknown status {}", raw)))?;
            Payload::Status(kind)
        }
        MessageType::Test => {
            let text = r.string()?;
            let n = r.u16()? as usize;
            let mut ints = Vec::with_capacity(n.min(r.remaining() / 4));
            for _ in 0..n {
                ints.push(r.i32()?);
            }
            Payload::Test(TestMessage { text, ints })
        }
        MessageType::Gps => Payload::Gps(GpsMessage {
            node: r.addr()?,
            lat: r.f64()?,
            lng: r.f64()?,
            alt: r.f64()?,
        }),
        MessageType::Label => Payload::Label(LabelMessage {
            node: r.addr()?,
            text: r.string()?,
            font_size: r.f32()?,
            foreground: r.color()?,
            background: r.color()?,
            expiration_ms: r.u32()?,
            add: r.bool()?,
            layer: r.string()?,
        }),
        MessageType::Edge => Payload::Edge(EdgeMessage {
            node1: r.addr()?,
            node2: r.addr()?,
            color: r.color()?,
            width: r.f32()?,
            bidirectional: r.bool()?,
            expiration_ms: r.u32()?,
            add: r.bool()?,
            layer: r.string()?,
        }),
        MessageType::Color => Payload::Color(ColorMessage {
            node: r.addr()?,
            color: r.color()?,
            flash_period_ms: r.u32()?,
            expiration_ms: r.u32()?,
            layer: r.string()?,
        }),
        MessageType::Connectivity => {
            let node = r.addr()?;
            let layer = r.string()?;
            let n = r.u16()? as usize;
            let mut neighbors = Vec::with_capacity(n.min(r.remaining() / 5));
            for _ in 0..n {
                neighbors.push(r.addr()?);
            }
            Payload::Connectivity(ConnectivityMessage {
                node,
                layer,
                neighbors,
            })
        }
        MessageType::DataPoint => {
            let node = r.addr()?;
            let name = r.string()?;
            let n = r.u16()? as usize;
            let mut points = Vec::with_capacity(n.min(r.remaining() / 8));
            for _ in 0..n {
                points.push(r.f64()?);
            }
            Payload::DataPoint(DataPointMessage { node, name, points })
        }
        MessageType::NodeStatus => {
            let node = r.addr()?;
            let event = match r.u8()? {
                0 => NodeEvent::Connect,
                1 => NodeEvent::Disconnect,
                other => return Err(r.malformed(format!("unknown node event {}", other))),
            };
            Payload::NodeStatus(NodeStatusMessage { node, event })
        }
        MessageType::Seek => {
            let offset = r.i64()?;
            let pos = SeekPosition::from_offset(offset)
                .ok_or_else(|| r.malformed(format!("invalid seek offset {}", offset)))?;
            Payload::Seek(pos)
        }
        MessageType::Start => Payload::Start,
        MessageType::Stop => Payload::Stop,
        MessageType::Speed => Payload::Speed(r.f32()?),
        MessageType::PlaybackTimeRange => Payload::PlaybackTimeRange {
            min: r.i64()?,
            max: r.i64()?,
        },
        MessageType::ListStreams => {
            let n = r.u16()? as usize;
            let mut streams = Vec::with_capacity(n.min(r.remaining() / 6));
            for _ in 0..n {
                streams.push(StreamInfo {
                    uid: r.u32()?,
                    description: r.string()?,
                });
            }
            Payload::ListStreams(streams)
        }
        MessageType::SubscribeStream => Payload::SubscribeStream(r.u32()?),
        MessageType::StreamDescription => Payload::StreamDescription(r.string()?),
        MessageType::Hello => Payload::Hello { version: r.u16()? },
        MessageType::Unknown(tag) => {
            return Ok(Payload::Unknown {
                tag,
                body: body.to_vec(),
            })
        }
    };

    // Newer peers may append fields we do not know about.
    if version <= SCHEMA_VERSION && r.remaining() > 0 {
        return Err(r.malformed(format!("{} unread body bytes", r.remaining())));
    }
    Ok(payload)
}

fn write_str(out: &mut Vec<u8>, field: &'static str, s: &str) -> Result<(), CodecError> {
    write_count(out, field, s.len())?;
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn write_count(out: &mut Vec<u8>, field: &'static str, len: usize) -> Result<(), CodecError> {
    if len > MAX_FIELD_LEN {
        return Err(CodecError::FieldTooLong {
            field,
            len,
            max: MAX_FIELD_LEN,
        });
    }
    out.write_u16::<BigEndian>(len as u16)?;
    Ok(())
}

fn write_addr(out: &mut Vec<u8>, addr: &IpAddr) -> Result<(), CodecError> {
    match addr {
        IpAddr::V4(v4) => {
            out.write_u8(4)?;
            out.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.write_u8(6)?;
            out.extend_from_slice(&v6.octets());
        }
    }
    Ok(())
}

fn write_color(out: &mut Vec<u8>, c: &Color) {
    out.extend_from_slice(&[c.r, c.g, c.b, c.a]);
}

/// Cursor over one record body.
struct BodyReader<'a> {
    buf: &'a [u8],
    message_type: MessageType,
}

impl BodyReader<'_> {
    fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn malformed(&self, reason: String) -> CodecError {
        CodecError::Malformed {
            message_type: self.message_type,
            reason,
        }
    }

    fn short(&self) -> CodecError {
        self.malformed("body truncated".into())
    }

    fn take(&mut self, n: usize) -> Result<&[u8], CodecError> {
        if self.buf.len() < n {
            return Err(self.short());
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        self.buf.read_u8().map_err(|_| self.short())
    }

    fn bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.u8()? != 0)
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        self.buf.read_u16::<BigEndian>().map_err(|_| self.short())
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        self.buf.read_u32::<BigEndian>().map_err(|_| self.short())
    }

    fn i32(&mut self) -> Result<i32, CodecError> {
        self.buf.read_i32::<BigEndian>().map_err(|_| self.short())
    }

    fn i64(&mut self) -> Result<i64, CodecError> {
        self.buf.read_i64::<BigEndian>().map_err(|_| self.short())
    }

    fn f32(&mut self) -> Result<f32, CodecError> {
        self.buf.read_f32::<BigEndian>().map_err(|_| self.short())
    }

    fn f64(&mut self) -> Result<f64, CodecError> {
        self.buf.read_f64::<BigEndian>().map_err(|_| self.short())
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?.to_vec();
        String::from_utf8(bytes).map_err(|e| self.malformed(format!("invalid UTF-8: {}", e)))
    }

    fn color(&mut self) -> Result<Color, CodecError> {
        let c = self.take(4)?;
        Ok(Color {
            r: c[0],
            g: c[1],
            b: c[2],
            a: c[3],
        })
    }

    fn addr(&mut self) -> Result<IpAddr, CodecError> {
        match self.u8()? {
            4 => {
                let o = self.take(4)?;
                Ok(IpAddr::V4(Ipv4Addr::new(o[0], o[1], o[2], o[3])))
            }
            6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(self.take(16)?);
                Ok(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            family => Err(self.malformed(format!("unknown address family {}", family))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_families() {
        let mut out = Vec::new();
        write_addr(&mut out, &"10.0.0.1".parse().unwrap()).unwrap();
        assert_eq!(out, vec![4, 10, 0, 0, 1]);

        let mut out = Vec::new();
        write_addr(&mut out, &"::1".parse().unwrap()).unwrap();
        assert_eq!(out.len(), 17);
        assert_eq!(out[0], 6);
    }

    #[test]
    fn test_bad_address_family() {
        let err = read_body(MessageType::Gps, SCHEMA_VERSION, &[9, 0, 0]).unwrap_err();
        assert!(err.to_string().contains("address family"));
    }

    #[test]
    fn test_invalid_seek_offset() {
        let body = (-5i64).to_be_bytes();
        assert!(read_body(MessageType::Seek, SCHEMA_VERSION, &body).is_err());
    }

    #[test]
    fn test_string_too_long() {
        let mut out = Vec::new();
        let long = "x".repeat(MAX_FIELD_LEN + 1);
        assert!(matches!(
            write_str(&mut out, "text", &long),
            Err(CodecError::FieldTooLong { field: "text", .. })
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let body = [0, 2, 0xFF, 0xFE];
        assert!(read_body(MessageType::StreamDescription, SCHEMA_VERSION, &body).is_err());
    }
}
