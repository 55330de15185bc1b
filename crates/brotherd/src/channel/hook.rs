// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 brotherd developers

//! User hook invocation.
//!
//! The hook runs as `/bin/sh -c <command>` with the scan context exported
//! through `SCANNER_*` environment variables. Hooks are serialised: the
//! data channel waits for the child before touching the connection again,
//! so a slow hook naturally back-pressures the scanner's chunk pacing.

use crate::config::ScanFunc;
use crate::error::{Error, Result};
use std::net::Ipv4Addr;
use std::process::Command;

/// Everything a hook invocation exports.
pub struct HookContext<'a> {
    pub xdpi: i64,
    pub ydpi: i64,
    pub width: i64,
    pub height: i64,
    pub page: u16,
    pub device_ip: Ipv4Addr,
    pub hostname: &'a str,
    pub func: ScanFunc,
    /// Set for per-page invocations, absent for the job-end invocation.
    pub filename: Option<&'a str>,
}

/// Run the hook and wait for it. A child that exits non-zero is logged and
/// tolerated; a child that cannot be spawned fails the current page.
pub fn run(command: &str, ctx: &HookContext<'_>) -> Result<()> {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(command)
        .env("SCANNER_XDPI", ctx.xdpi.to_string())
        .env("SCANNER_YDPI", ctx.ydpi.to_string())
        .env("SCANNER_WIDTH", ctx.width.to_string())
        .env("SCANNER_HEIGHT", ctx.height.to_string())
        .env("SCANNER_PAGE", ctx.page.to_string())
        .env("SCANNER_IP", ctx.device_ip.to_string())
        .env("SCANNER_HOSTNAME", ctx.hostname)
        .env("SCANNER_FUNC", ctx.func.as_str());
    if let Some(filename) = ctx.filename {
        cmd.env("SCANNER_FILENAME", filename);
    }

    let status = cmd
        .status()
        .map_err(|err| Error::Hook(format!("could not spawn '{}': {}", command, err)))?;
    if !status.success() {
        log::warn!(
            "[hook] '{}' for {} exited with {}",
            command,
            ctx.device_ip,
            status
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(filename: Option<&str>) -> HookContext<'_> {
        HookContext {
            xdpi: 300,
            ydpi: 300,
            width: 2480,
            height: 3507,
            page: 1,
            device_ip: Ipv4Addr::new(10, 0, 0, 149),
            hostname: "front-desk",
            func: ScanFunc::File,
            filename,
        }
    }

    #[test]
    fn per_page_hook_sees_the_full_environment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("env.txt");
        let command = format!(
            "echo \"$SCANNER_XDPI $SCANNER_PAGE $SCANNER_IP $SCANNER_FUNC $SCANNER_FILENAME\" > {}",
            out.display()
        );

        run(&command, &ctx(Some("scan0.jpeg"))).expect("hook run");
        let text = std::fs::read_to_string(&out).expect("read");
        assert_eq!(text.trim(), "300 1 10.0.0.149 FILE scan0.jpeg");
    }

    #[test]
    fn job_end_hook_has_no_filename() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("env.txt");
        let command = format!(
            "echo \"${{SCANNER_FILENAME-unset}}\" > {}",
            out.display()
        );

        run(&command, &ctx(None)).expect("hook run");
        let text = std::fs::read_to_string(&out).expect("read");
        assert_eq!(text.trim(), "unset");
    }

    #[test]
    fn nonzero_exit_is_tolerated() {
        run("exit 3", &ctx(None)).expect("non-zero exit is not fatal");
    }
}
