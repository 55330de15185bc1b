// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 brotherd developers

//! Per-device data channel.
//!
//! A [`DataChannel`] owns one worker thread running the scan-session state
//! machine over the device's TCP scan port. The thread starts paused; the
//! device handler binds an item with [`DataChannel::set_item`] and then
//! [`DataChannel::kick`]s it when the matching button-press notification
//! arrives. Failures never tear the channel down: the session pauses and
//! the next kick starts over at the connect step.

mod hook;
pub mod params;
mod session;

use crate::config::{DeviceConfig, ItemConfig};
use crate::engine::{self, Mailbox, Post};
use crate::error::{Error, Result};
use session::{Session, Step};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub use session::SCAN_PORT;

/// How long a paused channel parks before re-checking its mailbox. The wake
/// semaphore makes real commands instant; this only bounds shutdown.
const PAUSE_WAIT: Duration = Duration::from_secs(1);

enum Command {
    SetItem(Arc<ItemConfig>),
    Kick,
    Stop,
}

/// Handle to a running data-channel task.
pub struct DataChannel {
    post: Post<Command>,
    thread: Option<JoinHandle<()>>,
    device_ip: Ipv4Addr,
}

impl DataChannel {
    /// Spawn the channel task for `device`, starting paused.
    pub fn create(device: &Arc<DeviceConfig>) -> Result<DataChannel> {
        let session = Session::new(device)?;
        Self::spawn(device.ip, session)
    }

    fn spawn(device_ip: Ipv4Addr, session: Session) -> Result<DataChannel> {
        let (post, mailbox) = engine::mailbox();
        let thread = std::thread::Builder::new()
            .name(format!("data-channel-{}", device_ip))
            .spawn(move || channel_loop(session, &mailbox))
            .map_err(Error::Io)?;
        Ok(DataChannel {
            post,
            thread: Some(thread),
            device_ip,
        })
    }

    /// Bind `item` as the channel's active destination. Applied by the task
    /// only while paused; mid-session changes are rejected there.
    pub fn set_item(&self, item: Arc<ItemConfig>) {
        if self.post.send(Command::SetItem(item)).is_err() {
            log::error!("[channel {}] could not post item selection", self.device_ip);
        }
    }

    /// Wake the paused channel and start a scan session.
    pub fn kick(&self) {
        if self.post.send(Command::Kick).is_err() {
            log::error!("[channel {}] could not post kick", self.device_ip);
        }
    }

    /// Stop the task and join it. Called implicitly on drop.
    pub fn stop(&mut self) {
        let _ = self.post.send(Command::Stop);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("[channel {}] task panicked", self.device_ip);
            }
        }
    }
}

impl Drop for DataChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

fn channel_loop(mut session: Session, mailbox: &Mailbox<Command>) {
    let mut step = Step::Paused;

    loop {
        // Drain commands first so a kick posted while a step ran is seen
        // before the next step.
        let mut stopping = false;
        while let Some(command) = mailbox.take() {
            match command {
                Command::SetItem(item) => {
                    if step == Step::Paused {
                        session.load_item(item);
                    } else {
                        log::error!(
                            "[channel {}] refusing to change item while a session is active",
                            session.device_ip()
                        );
                    }
                }
                Command::Kick => {
                    if step != Step::Paused {
                        log::error!(
                            "[channel {}] ignoring kick, channel is not sleeping",
                            session.device_ip()
                        );
                    } else if !session.has_item() {
                        log::error!(
                            "[channel {}] ignoring kick, no item is bound",
                            session.device_ip()
                        );
                    } else {
                        session.begin();
                        step = Step::Connect;
                    }
                }
                Command::Stop => stopping = true,
            }
        }
        if stopping {
            session.abort();
            return;
        }

        match step {
            Step::Paused => {
                mailbox.wait(PAUSE_WAIT);
            }
            current => {
                step = match session.dispatch(current) {
                    Ok(next) => next,
                    Err(err) => {
                        log::error!(
                            "[channel {}] {:?} step failed: {}; the channel will pause",
                            session.device_ip(),
                            current,
                            err
                        );
                        session.abort();
                        Step::Paused
                    }
                };
            }
        }
    }
}
