// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 brotherd developers

//! Device handler: discovery, registration and button dispatch.
//!
//! One cooperative loop owns the shared UDP button listener and one record
//! per configured device. Each ~1 s tick it advances the per-device ping
//! and registration schedules, then waits on the listener socket; a
//! button-press datagram is matched to a device by source IP and to an
//! item by its `(FUNC, USER)` pair, and the device's data channel is
//! kicked into a scan session.

mod passwd;

use crate::channel::DataChannel;
use crate::config::{Config, DeviceConfig, ItemConfig, ScanFunc};
use crate::error::Result;
use crate::snmp::{SnmpClient, MAX_BATCH, SNMP_PORT};
use crate::transport::{Conn, ConnKind};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// UDP port the devices send button notifications to.
pub const BUTTON_PORT: u16 = 54925;

/// Device reachability probe interval.
const PING_INTERVAL: Duration = Duration::from_secs(5);

/// Destination registrations expire on the device after this long; refresh
/// on the same period.
const REGISTER_INTERVAL: Duration = Duration::from_secs(360);

/// Upper bound on one loop iteration while idle.
const TICK_TIMEOUT: Duration = Duration::from_secs(1);

/// Status values that count as "device will accept a scan session".
const READY_STATUSES: [i64; 3] = [10001, 10006, 40038];

/// Process-global APPNUM source. An item keeps its number for the process
/// lifetime once assigned.
static APPNUM: AtomicU32 = AtomicU32::new(1);

fn next_appnum() -> u32 {
    APPNUM.fetch_add(1, Ordering::Relaxed)
}

/// One registered destination: an item plus its stable APPNUM.
struct Destination {
    item: Arc<ItemConfig>,
    appnum: u32,
}

/// Runtime record for one discovered device.
struct Device {
    config: Arc<DeviceConfig>,
    snmp: SnmpClient,
    channel: DataChannel,
    /// Address of the host interface that routes to this device.
    local_ip: Ipv4Addr,
    reachable: bool,
    next_ping: Instant,
    next_register: Instant,
    destinations: Vec<Destination>,
}

/// The daemon's top-level loop.
pub struct DeviceHandler {
    conn: Conn,
    button_port: u16,
    devices: Vec<Device>,
}

impl DeviceHandler {
    /// Probe every configured device and spawn a data channel for each one
    /// that answers. Binds the shared button listener on `button_port`.
    pub fn new(config: &Config, button_port: u16) -> Result<DeviceHandler> {
        Self::with_ports(config, button_port, SNMP_PORT)
    }

    fn with_ports(config: &Config, button_port: u16, snmp_port: u16) -> Result<DeviceHandler> {
        let mut conn = Conn::open(ConnKind::Udp, TICK_TIMEOUT)?;
        conn.bind(button_port)?;
        let button_port = conn.pin_local_port()?;

        let now = Instant::now();
        let mut devices = Vec::with_capacity(config.devices.len());
        for dev_config in &config.devices {
            match Self::discover(dev_config, snmp_port, now) {
                Ok(device) => devices.push(device),
                Err(err) => {
                    log::error!("[device {}] discovery failed: {}", dev_config.ip, err);
                }
            }
        }

        Ok(DeviceHandler {
            conn,
            button_port,
            devices,
        })
    }

    fn discover(config: &Arc<DeviceConfig>, snmp_port: u16, now: Instant) -> Result<Device> {
        let mut snmp = SnmpClient::new(SocketAddrV4::new(config.ip, snmp_port), config.timeout)?;
        let status = snmp.get_printer_status()?;
        let reachable = READY_STATUSES.contains(&status);
        log::info!(
            "[device {}] discovered (status {}{})",
            config.ip,
            status,
            if reachable { "" } else { ", not ready" }
        );

        let channel = DataChannel::create(config)?;
        let destinations = config
            .items
            .iter()
            .map(|item| Destination {
                item: Arc::clone(item),
                appnum: next_appnum(),
            })
            .collect();

        Ok(Device {
            config: Arc::clone(config),
            snmp,
            channel,
            local_ip: local_ip_for(config.ip),
            reachable,
            next_ping: now + PING_INTERVAL,
            next_register: now,
            destinations,
        })
    }

    /// Actual port the button listener is bound to.
    pub fn button_port(&self) -> u16 {
        self.button_port
    }

    /// Run until `shutdown` is raised, then unregister and stop channels.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        log::info!(
            "[device] handler running, {} device(s), button port {}",
            self.devices.len(),
            self.button_port
        );
        while !shutdown.load(Ordering::Relaxed) {
            self.tick();
        }
        self.shutdown();
    }

    /// One scheduling round: pings, registrations, then a bounded wait for
    /// a button notification.
    fn tick(&mut self) {
        let now = Instant::now();
        let button_port = self.button_port;

        for device in &mut self.devices {
            if now >= device.next_ping {
                ping(device);
                device.next_ping = now + PING_INTERVAL;
            }
            if !device.reachable {
                continue;
            }
            if now >= device.next_register {
                register(device, button_port);
                device.next_register = now + REGISTER_INTERVAL;
            }
        }

        match self.conn.poll(TICK_TIMEOUT) {
            Ok(true) => self.dispatch_button_event(),
            Ok(false) => {}
            Err(err) => log::error!("[device] button listener poll failed: {}", err),
        }
    }

    fn dispatch_button_event(&mut self) {
        let mut buf = [0u8; 1024];
        let n = match self.conn.receive(&mut buf) {
            Ok(n) => n,
            Err(err) => {
                log::error!("[device] button listener receive failed: {}", err);
                return;
            }
        };
        let peer = match self.conn.peer_ip() {
            Ok(ip) => ip,
            Err(_) => return,
        };

        let (func, user) = match parse_button_notification(&buf[..n]) {
            Some(parsed) => parsed,
            None => {
                log::warn!("[device {}] malformed scan button notification", peer);
                return;
            }
        };

        let device = match self.devices.iter().find(|dev| dev.config.ip == peer) {
            Some(device) => device,
            None => {
                log::warn!("[device {}] scan button event from unknown device", peer);
                return;
            }
        };
        match device.config.find_item(func, &user) {
            Some(item) => {
                log::info!(
                    "[device {}] scan button pressed: {} \"{}\"",
                    peer,
                    func,
                    user
                );
                device.channel.set_item(Arc::clone(item));
                device.channel.kick();
            }
            None => {
                log::warn!(
                    "[device {}] scan button event for unknown item {} \"{}\"",
                    peer,
                    func,
                    user
                );
            }
        }
    }

    fn shutdown(&mut self) {
        log::info!("[device] shutting down");
        for device in &mut self.devices {
            let descriptors: Vec<String> = device
                .destinations
                .iter()
                .map(|dest| descriptor(dest, device.local_ip, self.button_port))
                .collect();
            for batch in descriptors.chunks(MAX_BATCH) {
                // Not all firmware implements unregister; failures are noise.
                if let Err(err) = device.snmp.unregister_destinations(batch) {
                    log::debug!(
                        "[device {}] destination unregister failed: {}",
                        device.config.ip,
                        err
                    );
                }
            }
            device.channel.stop();
        }
    }
}

fn ping(device: &mut Device) {
    match device.snmp.get_printer_status() {
        Ok(status) if READY_STATUSES.contains(&status) => {
            if !device.reachable {
                log::info!(
                    "[device {}] reachable again (status {})",
                    device.config.ip,
                    status
                );
            }
            device.reachable = true;
        }
        Ok(status) => {
            log::warn!("[device {}] unavailable (status {})", device.config.ip, status);
            device.reachable = false;
        }
        Err(err) => {
            log::warn!("[device {}] status query failed: {}", device.config.ip, err);
            device.reachable = false;
        }
    }
}

fn register(device: &mut Device, button_port: u16) {
    if device.destinations.is_empty() {
        return;
    }
    let descriptors: Vec<String> = device
        .destinations
        .iter()
        .map(|dest| descriptor(dest, device.local_ip, button_port))
        .collect();
    for batch in descriptors.chunks(MAX_BATCH) {
        match device.snmp.register_destinations(batch) {
            Ok(()) => log::debug!(
                "[device {}] registered {} destination(s)",
                device.config.ip,
                batch.len()
            ),
            Err(err) => log::error!(
                "[device {}] destination registration failed: {}",
                device.config.ip,
                err
            ),
        }
    }
}

/// Build the semicolon-delimited descriptor the device stores per
/// destination and echoes back in button notifications.
fn descriptor(dest: &Destination, local_ip: Ipv4Addr, button_port: u16) -> String {
    let brid = match &dest.item.password {
        Some(password) => {
            let bytes = password.as_bytes();
            passwd::encode([bytes[0], bytes[1], bytes[2], bytes[3]])
        }
        None => String::new(),
    };
    format!(
        "TYPE=BR;BUTTON=SCAN;USER=\"{}\";FUNC={};HOST={}:{};APPNUM={};DURATION={};BRID={};CC=1;",
        dest.item.hostname,
        dest.item.scan_func,
        local_ip,
        button_port,
        dest.appnum,
        REGISTER_INTERVAL.as_secs(),
        brid
    )
}

/// Extract `(FUNC, USER)` from a button notification payload. The first
/// four bytes are framing; the rest is a semicolon-delimited property list.
fn parse_button_notification(payload: &[u8]) -> Option<(ScanFunc, String)> {
    let text = String::from_utf8_lossy(payload.get(4..)?);
    let mut user = None;
    let mut func = None;
    for prop in text.split(';') {
        if let Some((key, value)) = prop.split_once('=') {
            match key.trim() {
                "USER" => user = Some(value.trim().trim_matches('"').to_string()),
                "FUNC" => func = ScanFunc::parse(value.trim()),
                _ => {}
            }
        }
    }
    Some((func?, user?))
}

/// IPv4 of the interface that routes to `dest`: connect a throwaway UDP
/// socket and read back its source address. Falls back to the primary
/// local address when the route is unavailable.
fn local_ip_for(dest: Ipv4Addr) -> Ipv4Addr {
    let routed = UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect((dest, SNMP_PORT))?;
            socket.local_addr()
        })
        .ok();
    match routed {
        Some(SocketAddr::V4(addr)) if !addr.ip().is_unspecified() => *addr.ip(),
        _ => match local_ip_address::local_ip() {
            Ok(IpAddr::V4(ip)) => ip,
            _ => Ipv4Addr::UNSPECIFIED,
        },
    }
}
