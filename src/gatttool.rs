//! ==============================================================================
//! gatttool.rs - bluetooth le transport for miflora sensors
//! ==============================================================================
//!
//! purpose:
//!     provides REAL access to miflora sensors by driving bluez `gatttool` in
//!     interactive mode as a subprocess. one `read` = one connection:
//!
//!         connect
//!         char-read-hnd 0x38          (battery + firmware)
//!         char-write-req 0x33 a01f    (only on firmware >= 2.6.6)
//!         char-read-hnd 0x35          (sensor data)
//!         disconnect
//!
//! why subprocess?:
//!     gatttool ships with bluez on every raspberry pi image and keeps the
//!     host free of a native ble stack. the child is spawned with
//!     kill_on_drop, so a timed out or cancelled read tears the connection
//!     down instead of leaving a zombie attached to the adapter.
//!
//! relationships:
//!     - implements: source.rs (RawSource)
//!     - uses: miflora.rs (payload decoding)
//!
//! ==============================================================================

use crate::domain::RawReading;
use crate::miflora;
use crate::source::{RawSource, TransportError};

use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

const VALUE_MARKER: &str = "Characteristic value/descriptor:";
const WRITE_OK_MARKER: &str = "written successfully";
const CONNECT_OK_MARKER: &str = "Connection successful";

pub struct GatttoolSource {
    adapter: String,
    sysfs_root: PathBuf,
}

impl GatttoolSource {
    pub fn new(adapter: impl Into<String>) -> Self {
        tracing::info!("Using GATTTOOL sensor source (bluez)");
        Self {
            adapter: adapter.into(),
            sysfs_root: PathBuf::from("/sys/class/bluetooth"),
        }
    }
}

#[async_trait]
impl RawSource for GatttoolSource {
    async fn open(&self) -> Result<(), TransportError> {
        let path = self.sysfs_root.join(&self.adapter);
        tokio::fs::metadata(&path)
            .await
            .map_err(|e| TransportError::Adapter {
                adapter: self.adapter.clone(),
                reason: format!("{}: {}", path.display(), e),
            })?;
        tracing::info!(adapter = %self.adapter, "bluetooth adapter acquired");
        Ok(())
    }

    async fn close(&self) {
        tracing::info!(adapter = %self.adapter, "bluetooth adapter released");
    }

    async fn read(&self, identifier: &str) -> Result<RawReading, TransportError> {
        let mut session = Session::spawn(&self.adapter, identifier)?;

        session.send("connect").await?;
        session.expect(CONNECT_OK_MARKER).await?;

        session
            .send(&format!("char-read-hnd 0x{:02x}", miflora::HANDLE_FIRMWARE))
            .await?;
        let firmware = miflora::decode_firmware(&session.read_value().await?)?;

        if miflora::needs_mode_change(&firmware.version) {
            session
                .send(&format!(
                    "char-write-req 0x{:02x} {}",
                    miflora::HANDLE_MODE_CHANGE,
                    hex::encode(miflora::MODE_CHANGE_REALTIME)
                ))
                .await?;
            session.expect(WRITE_OK_MARKER).await?;
        }

        session
            .send(&format!("char-read-hnd 0x{:02x}", miflora::HANDLE_SENSOR_DATA))
            .await?;
        let data = miflora::decode_sensor_data(&session.read_value().await?)?;

        session.finish().await;

        Ok(RawReading {
            observed_at: Utc::now(),
            firmware_version: firmware.version,
            battery_percent: firmware.battery_percent,
            conductivity: data.conductivity,
            light_lux: data.light_lux,
            moisture_percent: data.moisture_percent,
            temperature_celsius: data.temperature_celsius,
        })
    }
}

/// one interactive gatttool process bound to one device
struct Session {
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
}

impl Session {
    fn spawn(adapter: &str, mac: &str) -> Result<Self, TransportError> {
        let mut child = Command::new("gatttool")
            .args(["-i", adapter, "-b", mac, "-I"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Connection(format!("failed to run gatttool: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Connection("gatttool stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Connection("gatttool stdout unavailable".into()))?;

        Ok(Self {
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
        })
    }

    async fn send(&mut self, command: &str) -> Result<(), TransportError> {
        tracing::trace!(command, "gatttool <-");
        self.stdin
            .write_all(format!("{}\n", command).as_bytes())
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))
    }

    /// next line that isn't prompt noise, or an error if gatttool reports one
    async fn next_line(&mut self) -> Result<String, TransportError> {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| TransportError::Connection(e.to_string()))?
                .ok_or_else(|| TransportError::Connection("gatttool exited".into()))?;
            let line = strip_ansi(&line);
            tracing::trace!(line = %line, "gatttool ->");

            if let Some(err) = error_in(&line) {
                return Err(err);
            }
            if !line.trim().is_empty() {
                return Ok(line);
            }
        }
    }

    async fn expect(&mut self, marker: &str) -> Result<(), TransportError> {
        loop {
            if self.next_line().await?.contains(marker) {
                return Ok(());
            }
        }
    }

    async fn read_value(&mut self) -> Result<Vec<u8>, TransportError> {
        loop {
            let line = self.next_line().await?;
            if line.contains(VALUE_MARKER) {
                return parse_value(&line);
            }
        }
    }

    async fn finish(mut self) {
        let _ = self.send("disconnect").await;
        let _ = self.send("exit").await;
        let _ = self.child.wait().await;
    }
}

fn error_in(line: &str) -> Option<TransportError> {
    let lower = line.to_ascii_lowercase();
    if lower.contains("connect error") || lower.contains("connection refused") {
        Some(TransportError::Connection(line.trim().to_string()))
    } else if lower.contains("error:") || lower.contains("failed") {
        Some(TransportError::Protocol(line.trim().to_string()))
    } else {
        None
    }
}

/// decode "Characteristic value/descriptor: 64 2a 33 2e 32" into bytes
fn parse_value(line: &str) -> Result<Vec<u8>, TransportError> {
    let (_, tail) = line
        .split_once(VALUE_MARKER)
        .ok_or_else(|| TransportError::Protocol(format!("no value in {:?}", line)))?;

    let digits: String = tail.split_whitespace().collect();
    hex::decode(&digits)
        .map_err(|e| TransportError::Protocol(format!("bad hex {:?}: {}", digits, e)))
}

/// gatttool -I colours its prompt; drop escape sequences
fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            for c in chars.by_ref() {
                if c.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}
