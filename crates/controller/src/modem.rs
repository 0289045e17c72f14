//! SIM900-family GSM modem speaking AT commands over a serial line.
//!
//! The `modem` feature gates the real UART link (rppal); without it a mock
//! transport logs every message and always succeeds. Every wait on the line
//! is bounded by a deadline so one tick can never stall the control loop.

use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::transport::{Handshake, SendResult, Transport};

#[cfg(feature = "modem")]
use rppal::uart::{Parity, Uart};

const CTRL_Z: u8 = 0x1A;
const IDLE_POLL: Duration = Duration::from_millis(5);

// ---------------------------------------------------------------------------
// Reply classification
// ---------------------------------------------------------------------------

/// `+CREG: 0,1` (home) or `+CREG: 0,5` (roaming).
pub fn is_registered(reply: &str) -> bool {
    reply.contains("+CREG: 0,1") || reply.contains("+CREG: 0,5")
}

/// RSSI from a `+CSQ: <rssi>,<ber>` reply.
pub fn signal_quality(reply: &str) -> Option<u8> {
    let rest = &reply[reply.find("+CSQ:")? + 5..];
    rest.trim_start().split(',').next()?.trim().parse().ok()
}

/// Final reply after the message body was submitted.
pub fn classify_delivery(reply: &str) -> SendResult {
    if reply.contains("OK") && reply.contains("+CMGS:") {
        SendResult::Success
    } else if reply.contains("ERROR") {
        SendResult::HardFailure
    } else {
        SendResult::SoftFailure
    }
}

// ---------------------------------------------------------------------------
// AT driver
// ---------------------------------------------------------------------------

/// Byte pipe to the modem.
pub trait SerialLink {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()>;
    /// Whatever arrived, possibly nothing (`Ok(0)`); may block briefly.
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize>;
}

#[derive(Debug, Clone, Copy)]
pub struct ModemTimeouts {
    /// Liveness `AT` and the `>` prompt.
    pub probe: Duration,
    pub command: Duration,
    /// Wait for `+CMGS:` after the body.
    pub send: Duration,
    pub registration_attempts: u32,
    pub registration_pause: Duration,
}

impl From<&TransportConfig> for ModemTimeouts {
    fn from(cfg: &TransportConfig) -> Self {
        Self {
            probe: Duration::from_millis(1000),
            command: Duration::from_millis(cfg.command_timeout_ms),
            send: Duration::from_millis(cfg.send_timeout_ms),
            registration_attempts: cfg.registration_attempts,
            registration_pause: Duration::from_secs(2),
        }
    }
}

impl ModemTimeouts {
    /// Longest a handshake can block: the liveness probe, `ATZ`, every
    /// `AT+CREG?` with the pauses between them, `AT+CMGF=1` and `AT+CSQ`.
    pub fn worst_case_handshake(&self) -> Duration {
        let n = self.registration_attempts;
        self.probe
            .saturating_add(self.command.saturating_mul(n.saturating_add(3)))
            .saturating_add(self.registration_pause.saturating_mul(n.saturating_sub(1)))
    }

    /// Longest a single send can block: probe, `>` prompt, confirmation.
    pub fn worst_case_send(&self) -> Duration {
        self.probe.saturating_mul(2).saturating_add(self.send)
    }
}

#[cfg_attr(not(feature = "modem"), allow(dead_code))]
pub struct AtModem<L> {
    link: L,
    timeouts: ModemTimeouts,
}

#[cfg_attr(not(feature = "modem"), allow(dead_code))]
impl<L: SerialLink> AtModem<L> {
    pub fn new(link: L, timeouts: ModemTimeouts) -> Self {
        Self { link, timeouts }
    }

    /// Read until one of `terminators` shows up or `timeout` elapses.
    fn read_until(&mut self, timeout: Duration, terminators: &[&str]) -> String {
        let deadline = Instant::now() + timeout;
        let mut reply = String::new();
        let mut buf = [0u8; 128];

        while Instant::now() < deadline {
            match self.link.read_chunk(&mut buf) {
                Ok(0) => std::thread::sleep(IDLE_POLL),
                Ok(n) => {
                    reply.push_str(&String::from_utf8_lossy(&buf[..n]));
                    if terminators.iter().any(|t| reply.contains(t)) {
                        break;
                    }
                }
                Err(e) => {
                    warn!("modem: read failed: {e:#}");
                    break;
                }
            }
        }
        debug!(reply = %reply.trim(), "modem: reply");
        reply
    }

    /// Send one command line and collect the reply up to OK/ERROR.
    fn command(&mut self, cmd: &str, timeout: Duration) -> Option<String> {
        debug!(%cmd, "modem: >>");
        if let Err(e) = self.link.write_all(format!("{cmd}\r\n").as_bytes()) {
            warn!(%cmd, "modem: write failed: {e:#}");
            return None;
        }
        Some(self.read_until(timeout, &["OK", "ERROR"]))
    }

    fn command_ok(&mut self, cmd: &str, timeout: Duration) -> bool {
        self.command(cmd, timeout)
            .is_some_and(|reply| reply.contains("OK"))
    }

    fn wait_for_registration(&mut self) -> bool {
        for attempt in 1..=self.timeouts.registration_attempts {
            let timeout = self.timeouts.command;
            if self.command("AT+CREG?", timeout).is_some_and(|r| is_registered(&r)) {
                return true;
            }
            info!(attempt, "modem: waiting for network registration");
            if attempt < self.timeouts.registration_attempts {
                std::thread::sleep(self.timeouts.registration_pause);
            }
        }
        false
    }
}

impl<L: SerialLink> Transport for AtModem<L> {
    fn handshake(&mut self) -> Handshake {
        let t = self.timeouts;

        if !self.command_ok("AT", t.probe) {
            warn!("modem: not responding");
            return Handshake::Failure;
        }
        if !self.command_ok("ATZ", t.command) {
            warn!("modem: reset failed");
            return Handshake::Failure;
        }
        if !self.wait_for_registration() {
            warn!(attempts = t.registration_attempts, "modem: network registration failed");
            return Handshake::Failure;
        }
        if !self.command_ok("AT+CMGF=1", t.command) {
            warn!("modem: could not select SMS text mode");
            return Handshake::Failure;
        }
        match self.command("AT+CSQ", t.command).as_deref().and_then(signal_quality) {
            Some(rssi) => info!(rssi, "modem: ready"),
            None => info!("modem: ready (signal quality unknown)"),
        }
        Handshake::Success
    }

    fn send(&mut self, recipient: &str, text: &str) -> SendResult {
        let t = self.timeouts;

        if !self.command_ok("AT", t.probe) {
            warn!(%recipient, "modem: not responding before send");
            return SendResult::HardFailure;
        }

        let cmgs = format!("AT+CMGS=\"{recipient}\"\r\n");
        if let Err(e) = self.link.write_all(cmgs.as_bytes()) {
            warn!(%recipient, "modem: write failed: {e:#}");
            return SendResult::HardFailure;
        }
        if !self.read_until(t.probe, &[">", "ERROR"]).contains('>') {
            warn!(%recipient, "modem: no SMS prompt");
            return SendResult::SoftFailure;
        }

        let mut body = text.as_bytes().to_vec();
        body.push(CTRL_Z);
        if let Err(e) = self.link.write_all(&body) {
            warn!(%recipient, "modem: write failed: {e:#}");
            return SendResult::HardFailure;
        }

        let result = classify_delivery(&self.read_until(t.send, &["OK", "ERROR"]));
        match result {
            SendResult::Success => info!(%recipient, "modem: SMS sent"),
            SendResult::SoftFailure => warn!(%recipient, "modem: SMS not confirmed"),
            SendResult::HardFailure => warn!(%recipient, "modem: SMS rejected"),
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Real UART link (production: requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "modem")]
pub struct UartLink {
    uart: Uart,
}

#[cfg(feature = "modem")]
impl UartLink {
    pub fn open(device: &str, baud: u32) -> Result<Self> {
        use anyhow::Context;

        let mut uart = Uart::with_path(device, baud, Parity::None, 8, 1)
            .with_context(|| format!("open serial device {device}"))?;
        uart.set_read_mode(0, Duration::from_millis(50))?;
        uart.set_write_mode(true)?;
        Ok(Self { uart })
    }
}

#[cfg(feature = "modem")]
impl SerialLink for UartLink {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < bytes.len() {
            written += self.uart.write(&bytes[written..])?;
        }
        Ok(())
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.uart.read(buf)?)
    }
}

#[cfg(feature = "modem")]
pub fn open(cfg: &TransportConfig) -> Result<Box<dyn Transport + Send>> {
    let link = UartLink::open(&cfg.device, cfg.baud)?;
    info!(device = %cfg.device, baud = cfg.baud, "modem: serial link open");
    Ok(Box::new(AtModem::new(link, ModemTimeouts::from(cfg))))
}

// ---------------------------------------------------------------------------
// Mock modem (development: no hardware, logs messages)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "modem"))]
pub struct MockModem {
    pub(super) sent: Vec<(String, String)>,
}

#[cfg(not(feature = "modem"))]
impl Transport for MockModem {
    fn handshake(&mut self) -> Handshake {
        info!("[mock-modem] handshake ok (no hardware)");
        Handshake::Success
    }

    fn send(&mut self, recipient: &str, text: &str) -> SendResult {
        info!(%recipient, %text, "[mock-modem] SMS");
        self.sent.push((recipient.to_string(), text.to_string()));
        SendResult::Success
    }
}

#[cfg(not(feature = "modem"))]
pub fn open(cfg: &TransportConfig) -> Result<Box<dyn Transport + Send>> {
    info!(device = %cfg.device, "[mock-modem] serial device not opened");
    Ok(Box::new(MockModem { sent: Vec::new() }))
}

// ===========================================================================
// Tests
// ===========================================================================
