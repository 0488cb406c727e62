//! Follower handles: one worker process, its ring, and its outbox.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::channel::Channel;
use crate::paths;

/// Upper bound on queued frames per follower. A healthy follower drains far
/// below this; hitting it means the worker is gone, and we shed the oldest
/// frames rather than grow without bound.
pub const MAX_OUTBOX_FRAMES: usize = 65_536;

pub struct Follower {
    pub pid: u32,
    channel: Option<Channel>,
    outbox: VecDeque<Vec<u8>>,
    shed: u64,
}

impl Follower {
    pub fn new(pid: u32) -> Self {
        Follower {
            pid,
            channel: None,
            outbox: VecDeque::new(),
            shed: 0,
        }
    }

    pub fn queued(&self) -> usize {
        self.outbox.len()
    }

    /// Append one frame, shedding from the head if the bound is hit.
    pub fn enqueue(&mut self, frame: Vec<u8>) {
        if self.outbox.len() >= MAX_OUTBOX_FRAMES {
            self.outbox.pop_front();
            self.shed += 1;
            if self.shed.is_power_of_two() {
                warn!(
                    pid = self.pid,
                    shed = self.shed,
                    "follower outbox full, shedding oldest frames"
                );
            }
        }
        self.outbox.push_back(frame);
    }

    /// Open the ring if needed, then drain the outbox until it is empty or
    /// the ring pushes back. A rejected frame goes back to the head so the
    /// follower sees frames in append order across ticks.
    pub fn flush(&mut self) {
        if self.outbox.is_empty() || !self.ensure_channel() {
            return;
        }
        let channel = self.channel.as_mut().expect("channel just opened");

        while let Some(frame) = self.outbox.pop_front() {
            if !channel.fits(frame.len()) {
                warn!(
                    pid = self.pid,
                    frame_len = frame.len(),
                    capacity = channel.capacity(),
                    "dropping frame larger than follower ring"
                );
                continue;
            }
            if !channel.put(&frame) {
                // Backpressure: everything behind this frame stays queued
                // too, even if smaller frames would fit, to keep order.
                self.outbox.push_front(frame);
                break;
            }
        }
    }

    fn ensure_channel(&mut self) -> bool {
        if self.channel.is_some() {
            return true;
        }
        match Channel::open(&paths::follower_channel_path(self.pid)) {
            Ok(channel) => {
                debug!(pid = self.pid, "opened follower channel");
                self.channel = Some(channel);
                true
            }
            Err(e) => {
                // The worker may not have created its ring yet; keep the
                // outbox and retry next tick.
                debug!(pid = self.pid, error = %e, "follower channel not ready");
                false
            }
        }
    }
}
