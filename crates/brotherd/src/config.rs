// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 brotherd developers

//! Configuration schema and the line-oriented config file parser.
//!
//! The file format is a flat list of directives. `define-preset` opens a
//! reusable parameter template, `ip` opens a device, `preset` instantiates
//! a template as an item on the current device. Every `hostname` /
//! `password` / `scan.*` / `network.page.*` line binds to the innermost
//! open block; before any block directive that is the built-in `default`
//! preset, so a top-of-file `hostname` line renames every destination the
//! file goes on to define.

use crate::channel::params::ScanParams;
use crate::error::{Error, Result};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Config path used when `-c` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "brother.config";

/// Display hostname used when the config never sets one.
pub const DEFAULT_HOSTNAME: &str = "brother-open";

/// Hostnames show on a one-line device display.
const MAX_HOSTNAME_LEN: usize = 15;

const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_PAGE_INIT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_PAGE_FINISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Scan function selected on the device's panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanFunc {
    Image,
    Ocr,
    Email,
    File,
}

impl ScanFunc {
    pub const ALL: [ScanFunc; 4] = [ScanFunc::Image, ScanFunc::Ocr, ScanFunc::Email, ScanFunc::File];

    pub fn as_str(self) -> &'static str {
        match self {
            ScanFunc::Image => "IMAGE",
            ScanFunc::Ocr => "OCR",
            ScanFunc::Email => "EMAIL",
            ScanFunc::File => "FILE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == s)
    }
}

impl fmt::Display for ScanFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One registered scan destination.
#[derive(Debug, Clone)]
pub struct ItemConfig {
    /// Name shown on the device's panel (identity together with the func).
    pub hostname: String,
    /// Optional 4-character PIN, encoded into the BRID descriptor field.
    pub password: Option<String>,
    /// How long to wait for the first page after the handshake.
    pub page_init_timeout: Duration,
    /// Per-chunk deadline while a page is streaming.
    pub page_finish_timeout: Duration,
    pub scan_func: ScanFunc,
    /// Parameter template copied into the data channel on selection.
    pub params: ScanParams,
    /// Shell hook run per page and once per job.
    pub scan_command: Option<String>,
}

/// One scanner on the network.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub ip: Ipv4Addr,
    /// Socket timeout applied to every connection toward this device.
    pub timeout: Duration,
    pub items: Vec<Arc<ItemConfig>>,
}

impl DeviceConfig {
    /// Look up an item by its `(scan_func, hostname)` identity.
    pub fn find_item(&self, func: ScanFunc, hostname: &str) -> Option<&Arc<ItemConfig>> {
        self.items
            .iter()
            .find(|item| item.scan_func == func && item.hostname == hostname)
    }
}

/// The loaded configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub devices: Vec<Arc<DeviceConfig>>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            Error::Config(format!("could not read '{}': {}", path.display(), err))
        })?;
        Config::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Config> {
        Parser::new().run(text)
    }

    pub fn find_device(&self, ip: Ipv4Addr) -> Option<&Arc<DeviceConfig>> {
        self.devices.iter().find(|dev| dev.ip == ip)
    }
}

// ===== Parser =====

/// Mutable item-shaped state shared by presets and items under construction.
#[derive(Debug, Clone)]
struct Template {
    hostname: String,
    password: Option<String>,
    page_init_timeout: Duration,
    page_finish_timeout: Duration,
    params: ScanParams,
    scan_command: Option<String>,
}

fn builtin_params() -> ScanParams {
    let mut params = ScanParams::new();
    for (id, value) in [
        (b'A', ""),
        (b'B', "50"),
        (b'C', "JPEG"),
        (b'D', "SIN"),
        (b'E', ""),
        (b'F', ""),
        (b'G', "1"),
        (b'J', ""),
        (b'L', "128"),
        (b'M', "CGRAY"),
        (b'N', "50"),
        (b'P', "A4"),
        (b'R', "300,300"),
        (b'T', "JPEG"),
    ] {
        // Infallible: the table is empty and every value is in range.
        let _ = params.push(id, value);
    }
    params
}

fn builtin_template() -> Template {
    Template {
        hostname: DEFAULT_HOSTNAME.to_string(),
        password: None,
        page_init_timeout: DEFAULT_PAGE_INIT_TIMEOUT,
        page_finish_timeout: DEFAULT_PAGE_FINISH_TIMEOUT,
        params: builtin_params(),
        scan_command: None,
    }
}

struct DeviceBuilder {
    ip: Ipv4Addr,
    timeout: Duration,
    items: Vec<(ScanFunc, Template)>,
}

/// Which block the next item-scoped directive binds to.
enum Block {
    /// `presets[idx]`; index 0 is the built-in default.
    Preset(usize),
    /// Most recently instantiated item of the most recent device.
    Item,
    /// An `ip` line is open but no item has been instantiated yet.
    None,
}

struct Parser {
    presets: Vec<(String, Template)>,
    devices: Vec<DeviceBuilder>,
    block: Block,
    /// scan.param ids already set in the current block.
    seen_params: Vec<u8>,
}

impl Parser {
    fn new() -> Self {
        Parser {
            presets: vec![("default".to_string(), builtin_template())],
            devices: Vec::new(),
            block: Block::Preset(0),
            seen_params: Vec::new(),
        }
    }

    fn run(mut self, text: &str) -> Result<Config> {
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            self.directive(line)
                .map_err(|err| annotate(err, lineno + 1))?;
        }
        self.finish()
    }

    fn directive(&mut self, line: &str) -> Result<()> {
        let (keyword, rest) = match line.split_once(char::is_whitespace) {
            Some((kw, rest)) => (kw, rest.trim()),
            None => (line, ""),
        };

        match keyword {
            "define-preset" => self.define_preset(one_arg(keyword, rest)?),
            "ip" => self.open_device(one_arg(keyword, rest)?),
            "preset" => self.instantiate_preset(rest),
            "hostname" => self.set_hostname(one_arg(keyword, rest)?),
            "password" => self.set_password(one_arg(keyword, rest)?),
            "network.timeout" => self.set_network_timeout(one_arg(keyword, rest)?),
            "network.page.init.timeout" => {
                let secs = parse_seconds(keyword, one_arg(keyword, rest)?)?;
                self.template(keyword)?.page_init_timeout = secs;
                Ok(())
            }
            "network.page.finish.timeout" => {
                let secs = parse_seconds(keyword, one_arg(keyword, rest)?)?;
                self.template(keyword)?.page_finish_timeout = secs;
                Ok(())
            }
            "scan.param" => self.set_scan_param(rest),
            "scan.func" => self.set_scan_command(rest),
            other => Err(Error::Config(format!("invalid configuration option '{}'", other))),
        }
    }

    fn template(&mut self, keyword: &str) -> Result<&mut Template> {
        match self.block {
            Block::Preset(idx) => Ok(&mut self.presets[idx].1),
            Block::Item => {
                let device = self.devices.last_mut().ok_or_else(|| {
                    Error::Config(format!("'{}' outside any preset or item block", keyword))
                })?;
                device
                    .items
                    .last_mut()
                    .map(|(_, tpl)| tpl)
                    .ok_or_else(|| {
                        Error::Config(format!("'{}' outside any preset or item block", keyword))
                    })
            }
            Block::None => Err(Error::Config(format!(
                "'{}' specified before a preset or item block is open",
                keyword
            ))),
        }
    }

    fn define_preset(&mut self, name: &str) -> Result<()> {
        check_hostname(name)?;
        if self.presets.iter().any(|(pname, _)| pname == name) {
            return Err(Error::Config(format!("preset '{}' defined twice", name)));
        }
        let mut tpl = self.presets[0].1.clone();
        tpl.hostname = name.to_string();
        self.presets.push((name.to_string(), tpl));
        self.block = Block::Preset(self.presets.len() - 1);
        self.seen_params.clear();
        Ok(())
    }

    fn open_device(&mut self, addr: &str) -> Result<()> {
        let ip: Ipv4Addr = addr
            .parse()
            .map_err(|_| Error::Config(format!("invalid device address '{}'", addr)))?;
        if self.devices.iter().any(|dev| dev.ip == ip) {
            return Err(Error::Config(format!("device {} configured twice", ip)));
        }
        self.devices.push(DeviceBuilder {
            ip,
            timeout: DEFAULT_NETWORK_TIMEOUT,
            items: Vec::new(),
        });
        self.block = Block::None;
        self.seen_params.clear();
        Ok(())
    }

    fn instantiate_preset(&mut self, rest: &str) -> Result<()> {
        let mut args = rest.split_whitespace();
        let (name, func) = match (args.next(), args.next(), args.next()) {
            (Some(name), Some(func), None) => (name, func),
            _ => {
                return Err(Error::Config(
                    "'preset' takes a preset name and a scan function".into(),
                ))
            }
        };

        let func = ScanFunc::parse(func)
            .ok_or_else(|| Error::Config(format!("invalid scan function '{}'", func)))?;
        let tpl = self
            .presets
            .iter()
            .find(|(pname, _)| pname == name)
            .map(|(_, tpl)| tpl.clone())
            .ok_or_else(|| Error::Config(format!("preset '{}' was not defined yet", name)))?;
        let device = self.devices.last_mut().ok_or_else(|| {
            Error::Config(format!(
                "cannot use preset '{}' before configuring a device (start with 'ip x.x.x.x')",
                name
            ))
        })?;

        device.items.push((func, tpl));
        self.block = Block::Item;
        self.seen_params.clear();
        Ok(())
    }

    fn set_hostname(&mut self, name: &str) -> Result<()> {
        check_hostname(name)?;
        self.template("hostname")?.hostname = name.to_string();
        Ok(())
    }

    fn set_password(&mut self, password: &str) -> Result<()> {
        if password.len() != 4 || !password.is_ascii() {
            return Err(Error::Config(
                "password must be exactly 4 ASCII characters".into(),
            ));
        }
        self.template("password")?.password = Some(password.to_string());
        Ok(())
    }

    fn set_network_timeout(&mut self, value: &str) -> Result<()> {
        let secs = parse_seconds("network.timeout", value)?;
        let device = self
            .devices
            .last_mut()
            .ok_or_else(|| Error::Config("'network.timeout' specified without a device".into()))?;
        device.timeout = secs;
        Ok(())
    }

    fn set_scan_param(&mut self, rest: &str) -> Result<()> {
        let mut args = rest.split_whitespace();
        let (id, value) = match (args.next(), args.next(), args.next()) {
            (Some(id), Some(value), None) => (id, value),
            _ => return Err(Error::Config("'scan.param' takes an id and a value".into())),
        };
        if id.len() != 1 || !id.is_ascii() {
            return Err(Error::Config(format!("invalid scan.param id '{}'", id)));
        }
        let id = id.as_bytes()[0];
        if self.seen_params.contains(&id) {
            return Err(Error::Config(format!(
                "scan.param '{}' set twice in the same block",
                id as char
            )));
        }
        self.template("scan.param")?.params.set(id, value)?;
        self.seen_params.push(id);
        Ok(())
    }

    fn set_scan_command(&mut self, rest: &str) -> Result<()> {
        if rest.is_empty() {
            return Err(Error::Config("'scan.func' takes a shell command".into()));
        }
        self.template("scan.func")?.scan_command = Some(rest.to_string());
        Ok(())
    }

    fn finish(self) -> Result<Config> {
        let mut devices = Vec::with_capacity(self.devices.len());
        for builder in self.devices {
            let mut items: Vec<Arc<ItemConfig>> = Vec::with_capacity(builder.items.len());
            for (func, tpl) in builder.items {
                if items
                    .iter()
                    .any(|existing| existing.scan_func == func && existing.hostname == tpl.hostname)
                {
                    return Err(Error::Config(format!(
                        "device {} has two '{}' items named '{}'",
                        builder.ip, func, tpl.hostname
                    )));
                }
                items.push(Arc::new(ItemConfig {
                    hostname: tpl.hostname,
                    password: tpl.password,
                    page_init_timeout: tpl.page_init_timeout,
                    page_finish_timeout: tpl.page_finish_timeout,
                    scan_func: func,
                    params: tpl.params,
                    scan_command: tpl.scan_command,
                }));
            }
            devices.push(Arc::new(DeviceConfig {
                ip: builder.ip,
                timeout: builder.timeout,
                items,
            }));
        }
        Ok(Config { devices })
    }
}

fn annotate(err: Error, lineno: usize) -> Error {
    match err {
        Error::Config(msg) => Error::Config(format!("line {}: {}", lineno, msg)),
        other => other,
    }
}

fn one_arg<'a>(keyword: &str, rest: &'a str) -> Result<&'a str> {
    let mut args = rest.split_whitespace();
    match (args.next(), args.next()) {
        (Some(arg), None) => Ok(arg),
        _ => Err(Error::Config(format!("'{}' takes exactly one argument", keyword))),
    }
}

fn parse_seconds(keyword: &str, value: &str) -> Result<Duration> {
    value
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| Error::Config(format!("invalid '{}' value '{}'", keyword, value)))
}

fn check_hostname(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_HOSTNAME_LEN || !name.is_ascii() {
        return Err(Error::Config(format!(
            "hostname '{}' must be 1-{} ASCII bytes",
            name, MAX_HOSTNAME_LEN
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# Shared settings
hostname front-desk

define-preset duplex600
scan.param R 600,600
scan.param D DUP
network.page.finish.timeout 8

ip 10.0.0.149
network.timeout 5
preset duplex600 IMAGE
password 1234
scan.func scanimage-postprocess.sh

preset default FILE
hostname archive
"#;

    #[test]
    fn full_config_parses() {
        let config = Config::parse(SAMPLE).expect("parse");
        assert_eq!(config.devices.len(), 1);

        let device = &config.devices[0];
        assert_eq!(device.ip, Ipv4Addr::new(10, 0, 0, 149));
        assert_eq!(device.timeout, Duration::from_secs(5));
        assert_eq!(device.items.len(), 2);

        let image = device
            .find_item(ScanFunc::Image, "duplex600")
            .expect("image item");
        assert_eq!(image.params.get(b'R'), Some("600,600"));
        assert_eq!(image.params.get(b'D'), Some("DUP"));
        assert_eq!(image.page_finish_timeout, Duration::from_secs(8));
        assert_eq!(image.password.as_deref(), Some("1234"));
        assert_eq!(
            image.scan_command.as_deref(),
            Some("scanimage-postprocess.sh")
        );

        // The FILE item came from the default preset, renamed at item level.
        let file = device
            .find_item(ScanFunc::File, "archive")
            .expect("file item");
        assert_eq!(file.hostname, "archive");
        assert_eq!(file.params.get(b'R'), Some("300,300"));
        assert!(file.password.is_none());
    }

    #[test]
    fn top_level_hostname_renames_the_default_preset() {
        let config = Config::parse("hostname desk\nip 10.0.0.2\npreset default IMAGE\n")
            .expect("parse");
        assert!(config.devices[0].find_item(ScanFunc::Image, "desk").is_some());
    }

    #[test]
    fn preset_inherits_builtin_defaults() {
        let config = Config::parse("ip 10.0.0.2\npreset default OCR\n").expect("parse");
        let item = &config.devices[0].items[0];
        assert_eq!(item.params.get(b'M'), Some("CGRAY"));
        assert_eq!(item.params.get(b'C'), Some("JPEG"));
        assert_eq!(item.hostname, DEFAULT_HOSTNAME);
        assert_eq!(item.page_init_timeout, DEFAULT_PAGE_INIT_TIMEOUT);
    }

    #[test]
    fn directives_need_an_open_block() {
        let err = Config::parse("ip 10.0.0.2\npassword 1234\n").expect_err("no item open");
        assert!(err.to_string().contains("line 2"));

        assert!(Config::parse("ip 10.0.0.2\nscan.param R 300,300\n").is_err());
    }

    #[test]
    fn preset_requires_a_device() {
        assert!(Config::parse("preset default IMAGE\n").is_err());
    }

    #[test]
    fn unknown_directive_is_rejected() {
        let err = Config::parse("colour purple\n").expect_err("unknown keyword");
        assert!(err.to_string().contains("invalid configuration option"));
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(Config::parse("ip 999.0.0.1\n").is_err());
        assert!(Config::parse("hostname this-name-is-way-too-long\n").is_err());
        assert!(Config::parse("password 123\n").is_err());
        assert!(Config::parse("scan.param ZZ 1\n").is_err());
        assert!(Config::parse("scan.param Z 1\n").is_err()); // unknown id
        assert!(Config::parse("scan.param R 0123456789ABCDEF\n").is_err());
        assert!(Config::parse("network.timeout soon\nip 10.0.0.2\n").is_err());
    }

    #[test]
    fn duplicate_scan_param_in_one_block_is_rejected() {
        let text = "define-preset p\nscan.param R 300,300\nscan.param R 600,600\n";
        assert!(Config::parse(text).is_err());
    }

    #[test]
    fn duplicate_item_identity_is_rejected() {
        let text = "ip 10.0.0.2\npreset default IMAGE\npreset default IMAGE\n";
        let err = Config::parse(text).expect_err("duplicate identity");
        assert!(err.to_string().contains("two 'IMAGE' items"));
    }

    #[test]
    fn duplicate_device_is_rejected() {
        assert!(Config::parse("ip 10.0.0.2\nip 10.0.0.2\n").is_err());
    }

    #[test]
    fn comments_and_blanks_are_ignored() {
        let config = Config::parse("# nothing\n\n   \nip 10.0.0.3\n").expect("parse");
        assert_eq!(config.devices.len(), 1);
        assert!(config.devices[0].items.is_empty());
    }

    #[test]
    fn scan_func_tags_roundtrip() {
        for func in ScanFunc::ALL {
            assert_eq!(ScanFunc::parse(func.as_str()), Some(func));
        }
        assert_eq!(ScanFunc::parse("FAX"), None);
    }
}
