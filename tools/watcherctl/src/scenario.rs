// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Random mobility scenario.
//!
//! Nodes drift through a bounded box at constant speed and heading; two
//! nodes are neighbors while they are within `radius` of each other.

use std::f64::consts::PI;
use std::net::{IpAddr, Ipv4Addr};
use watcher::{
    Color, ConnectivityMessage, GpsMessage, LabelMessage, Message, Payload,
};

/// Scenario parameters.
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    pub nodes: u32,
    pub width: f64,
    pub height: f64,
    pub depth: f64,
    pub radius: f64,
    pub layers: u32,
    /// Chance (0..=100) that a node gets a label each step.
    pub label_percent: u8,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            nodes: 10,
            width: 500.0,
            height: 500.0,
            depth: 20.0,
            radius: 100.0,
            layers: 1,
            label_percent: 10,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Node {
    x: f64,
    y: f64,
    z: f64,
    speed: f64,
    theta: f64,
    phi: f64,
}

pub struct Scenario {
    config: ScenarioConfig,
    nodes: Vec<Node>,
    rng: fastrand::Rng,
}

const MIN_SPEED: f64 = 2.0;
const MAX_SPEED: f64 = 10.0;

/// Address of the node at `index`, counting from 0.0.0.1.
pub fn node_address(index: u32) -> IpAddr {
    IpAddr::V4(Ipv4Addr::from(index + 1))
}

impl Scenario {
    pub fn new(config: ScenarioConfig, seed: u64) -> Self {
        let mut rng = fastrand::Rng::with_seed(seed);
        let nodes = (0..config.nodes)
            .map(|_| Node {
                x: rng.f64() * config.width,
                y: rng.f64() * config.height,
                z: rng.f64() * config.depth,
                speed: MIN_SPEED + rng.f64() * (MAX_SPEED - MIN_SPEED),
                theta: (rng.f64() * 2.0 - 1.0) * PI,
                phi: (rng.f64() - 0.5) * PI,
            })
            .collect();
        Self { config, nodes, rng }
    }

    /// Advance every node one step, wrapping at the box edges.
    pub fn step(&mut self) {
        let (w, h, d) = (self.config.width, self.config.height, self.config.depth);
        for node in &mut self.nodes {
            node.x = wrap(node.x + node.theta.cos() * node.speed, w);
            node.y = wrap(node.y + node.theta.sin() * node.speed, h);
            node.z = wrap(node.z + node.phi.sin() * node.speed, d);
        }
    }

    /// Indices of the nodes within range of node `i`.
    pub fn neighbors(&self, i: usize) -> Vec<usize> {
        let me = self.nodes[i];
        self.nodes
            .iter()
            .enumerate()
            .filter(|(j, other)| *j != i && distance(&me, other) <= self.config.radius)
            .map(|(j, _)| j)
            .collect()
    }

    /// Messages describing the current step, stamped `timestamp`.
    pub fn messages(&mut self, timestamp: i64) -> Vec<Message> {
        let mut out = Vec::new();
        for i in 0..self.nodes.len() {
            let node = self.nodes[i];
            let addr = node_address(i as u32);
            out.push(Message::at(
                timestamp,
                Payload::Gps(GpsMessage {
                    node: addr,
                    lat: node.x,
                    lng: node.y,
                    alt: node.z,
                }),
            ));

            if self.rng.u8(..100) < self.config.label_percent {
                out.push(Message::at(
                    timestamp,
                    Payload::Label(LabelMessage {
                        node: addr,
                        text: "Label".into(),
                        font_size: 10.0,
                        foreground: Color::WHITE,
                        background: Color::BLUE,
                        expiration_ms: 5_000,
                        add: true,
                        layer: "Labels".into(),
                    }),
                ));
            }

            let neighbors: Vec<IpAddr> = self
                .neighbors(i)
                .into_iter()
                .map(|j| node_address(j as u32))
                .collect();
            for layer in 0..self.config.layers {
                out.push(Message::at(
                    timestamp,
                    Payload::Connectivity(ConnectivityMessage {
                        node: addr,
                        layer: format!("ConnectivityMessages_{}", layer),
                        neighbors: neighbors.clone(),
                    }),
                ));
            }
        }
        out
    }
}

fn wrap(value: f64, max: f64) -> f64 {
    if max <= 0.0 {
        0.0
    } else {
        value.rem_euclid(max)
    }
}

fn distance(a: &Node, b: &Node) -> f64 {
    ((b.x - a.x).powi(2) + (b.y - a.y).powi(2) + (b.z - a.z).powi(2)).sqrt()
}
