// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Rendering of received messages.

use chrono::{Local, TimeZone};
use colored::*;
use watcher::{Message, Payload};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OutputFormat {
    Pretty,
    Json,
    Compact,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "p" => Ok(OutputFormat::Pretty),
            "json" | "j" => Ok(OutputFormat::Json),
            "compact" | "c" => Ok(OutputFormat::Compact),
            _ => Err(format!("Unknown format: {}", s)),
        }
    }
}

/// Local wall-clock rendering of a millisecond timestamp.
pub fn format_timestamp(ms: i64) -> String {
    match Local.timestamp_millis_opt(ms).single() {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => format!("{} ms", ms),
    }
}

pub fn render(msg: &Message, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => serde_json::to_string(msg).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e)),
        OutputFormat::Compact => format!("{} {} {}", msg.timestamp, msg.message_type().tag(), summary(&msg.payload)),
        OutputFormat::Pretty => format!(
            "{} {:<18} {}",
            format_timestamp(msg.timestamp).dimmed(),
            msg.message_type().to_string().cyan(),
            summary(&msg.payload)
        ),
    }
}

/// One-line description of a payload.
pub fn summary(payload: &Payload) -> String {
    match payload {
        Payload::Status(kind) => format!("{:?}", kind),
        Payload::Test(t) => format!("\"{}\" {:?}", t.text, t.ints),
        Payload::Gps(g) => format!("{} at ({:.2}, {:.2}, {:.2})", g.node, g.lat, g.lng, g.alt),
        Payload::Label(l) => format!(
            "{} {} \"{}\" on {}",
            if l.add { "add" } else { "remove" },
            l.node,
            l.text,
            l.layer
        ),
        Payload::Edge(e) => format!(
            "{} {} {} {} on {}",
            if e.add { "add" } else { "remove" },
            e.node1,
            if e.bidirectional { "<->" } else { "->" },
            e.node2,
            e.layer
        ),
        Payload::Color(c) => format!(
            "{} #{:02x}{:02x}{:02x}{:02x} on {}",
            c.node, c.color.r, c.color.g, c.color.b, c.color.a, c.layer
        ),
        Payload::Connectivity(c) => format!(
            "{} has {} neighbors on {}",
            c.node,
            c.neighbors.len(),
            c.layer
        ),
        Payload::DataPoint(d) => format!("{} {} = {:?}", d.node, d.name, d.points),
        Payload::NodeStatus(n) => format!("{} {:?}", n.node, n.event),
        Payload::Seek(pos) => format!("{:?}", pos),
        Payload::Start => "start".into(),
        Payload::Stop => "stop".into(),
        Payload::Speed(s) => format!("{}x", s),
        Payload::PlaybackTimeRange { min, max } => {
            format!("{} .. {}", format_timestamp(*min), format_timestamp(*max))
        }
        Payload::ListStreams(streams) => format!("{} streams", streams.len()),
        Payload::SubscribeStream(uid) => format!("stream {}", uid),
        Payload::StreamDescription(d) => format!("\"{}\"", d),
        Payload::Hello { version } => format!("protocol {}", version),
        Payload::Unknown { tag, body } => format!("tag {} ({} bytes)", tag, body.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use watcher::GpsMessage;

    fn gps() -> Message {
        Message::at(
            42,
            Payload::Gps(GpsMessage {
                node: "10.1.1.1".parse().unwrap(),
                lat: 1.0,
                lng: 2.5,
                alt: 0.0,
            }),
        )
    }

    #[test]
    fn test_compact_line() {
        assert_eq!(
            render(&gps(), OutputFormat::Compact),
            "42 3 10.1.1.1 at (1.00, 2.50, 0.00)"
        );
    }

    #[test]
    fn test_json_line_parses() {
        let line = render(&gps(), OutputFormat::Json);
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["timestamp"], 42);
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert!("xml".parse::<OutputFormat>().is_err());
    }
}
