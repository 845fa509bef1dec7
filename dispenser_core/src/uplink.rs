//! OTAA join/retry protocol state machine for the LoRa radio module.
//!
//! The module speaks a CRLF-terminated AT command dialect over a serial
//! link. Two machines run in parallel: the fine-grained join step and the
//! coarse session status. `poll` never sleeps; callers drive it repeatedly
//! from the cooperative loop and every deadline compares a wrapping 32-bit
//! millisecond clock.
//!
//! The original firmware capped only the initial `AT` probe; every later
//! step retried forever. Here each configuration step and the join itself
//! carry explicit re-send caps, and exhausting any of them parks the
//! session in terminal `Failed`.

use dispenser_traits::{Clock, SerialLink};
use eyre::WrapErr;

use crate::config::UplinkCfg;
use crate::error::Result;
use crate::hw_error::map_hw_error;

const RX_BUFFER_SIZE: usize = 128;

const ACK_AT: &str = "+AT: OK";
const ACK_MODE: &str = "+MODE:";
const ACK_KEY: &str = "+KEY:";
const ACK_CLASS: &str = "+CLASS:";
const ACK_PORT: &str = "+PORT:";
const JOIN_OK_NETID: &str = "+JOIN: NetID";
const JOIN_OK_DONE: &str = "+JOIN: Done";
const JOIN_FAILED: &str = "+JOIN: Join failed";

/// Fine-grained handshake step. Each `Send*` issues one command and arms a
/// deadline; each `Wait*` is advanced by `poll`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStep {
    SendAt,
    WaitAt,
    SendMode,
    WaitMode,
    SendKey,
    WaitKey,
    SendClass,
    WaitClass,
    SendPort,
    WaitPort,
    SendJoin,
    WaitJoin,
    /// Module reported a join failure; back off briefly before re-sending.
    JoinFailedWait,
    /// Terminal; the session stays joined for its lifetime.
    Ready,
}

/// Coarse session status, the surface consumed by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkStatus {
    Disconnected,
    Connecting,
    Joining,
    Joined,
    Failed,
}

pub struct Uplink<P: SerialLink, C: Clock> {
    port: P,
    clock: C,
    cfg: UplinkCfg,
    step: JoinStep,
    status: UplinkStatus,
    rx_buf: Vec<u8>,
    at_retries: u8,
    step_retries: u8,
    join_attempts: u8,
    step_start_ms: u32,
}

impl<P: SerialLink, C: Clock> Uplink<P, C> {
    /// Create a session ready to probe the module; the first `poll` sends
    /// `AT`.
    pub fn new(port: P, clock: C, cfg: UplinkCfg) -> Self {
        let step_start_ms = clock.now_ms();
        Self {
            port,
            clock,
            cfg,
            step: JoinStep::SendAt,
            status: UplinkStatus::Connecting,
            rx_buf: Vec::with_capacity(RX_BUFFER_SIZE),
            at_retries: 0,
            step_retries: 0,
            join_attempts: 0,
            step_start_ms,
        }
    }

    pub fn status(&self) -> UplinkStatus {
        self.status
    }

    pub fn step(&self) -> JoinStep {
        self.step
    }

    /// Whether the session can make no further progress.
    pub fn is_terminal(&self) -> bool {
        self.step == JoinStep::Ready || self.status == UplinkStatus::Failed
    }

    /// One non-blocking turn of the state machine: consume at most one
    /// buffered response line, then run the step's send/timeout action.
    pub fn poll(&mut self) -> Result<()> {
        if self.is_terminal() {
            return Ok(());
        }
        if let Some(line) = self.read_line()? {
            tracing::debug!(line = %line, "uplink rx");
            self.handle_line(&line);
        }
        self.drive()
    }

    /// Format and fire one uplink message. Fire-and-forget: no delivery
    /// acknowledgment is tracked. Returns `false` without touching the port
    /// unless the session is joined.
    pub fn send_message(&mut self, msg: &str) -> Result<bool> {
        if self.status != UplinkStatus::Joined {
            return Ok(false);
        }
        let cmd = format!("AT+MSG=\"{msg}\"");
        self.write_line(&cmd)?;
        tracing::info!(msg, "uplink message sent");
        Ok(true)
    }

    fn read_line(&mut self) -> Result<Option<String>> {
        while let Some(ch) = self
            .port
            .read_byte()
            .map_err(|e| eyre::Report::new(map_hw_error(&*e)))
            .wrap_err("uplink read")?
        {
            match ch {
                b'\r' => {}
                b'\n' => {
                    let line = String::from_utf8_lossy(&self.rx_buf).into_owned();
                    self.rx_buf.clear();
                    return Ok(Some(line));
                }
                _ if self.rx_buf.len() < RX_BUFFER_SIZE - 1 => self.rx_buf.push(ch),
                // Overflowed line: drop it and start over.
                _ => self.rx_buf.clear(),
            }
        }
        Ok(None)
    }

    fn handle_line(&mut self, line: &str) {
        if self.step == JoinStep::WaitJoin {
            if line.contains(JOIN_OK_NETID) || line.contains(JOIN_OK_DONE) {
                tracing::info!("network joined");
                self.step = JoinStep::Ready;
                self.status = UplinkStatus::Joined;
                return;
            }
            if line.contains(JOIN_FAILED) {
                tracing::warn!("join rejected, backing off before retry");
                self.step_start_ms = self.clock.now_ms();
                self.step = JoinStep::JoinFailedWait;
                return;
            }
        }
        let advance = match self.step {
            JoinStep::WaitAt if line.contains(ACK_AT) => Some(JoinStep::SendMode),
            JoinStep::WaitMode if line.contains(ACK_MODE) => Some(JoinStep::SendKey),
            JoinStep::WaitKey if line.contains(ACK_KEY) => Some(JoinStep::SendClass),
            JoinStep::WaitClass if line.contains(ACK_CLASS) => Some(JoinStep::SendPort),
            JoinStep::WaitPort if line.contains(ACK_PORT) => Some(JoinStep::SendJoin),
            _ => None,
        };
        if let Some(next) = advance {
            self.step = next;
            self.at_retries = 0;
            self.step_retries = 0;
        }
    }

    fn drive(&mut self) -> Result<()> {
        match self.step {
            JoinStep::SendAt => {
                self.send_command("AT")?;
                self.step = JoinStep::WaitAt;
            }
            JoinStep::WaitAt => {
                if self.deadline_expired(self.cfg.response_timeout_ms) {
                    self.at_retries += 1;
                    if self.at_retries >= self.cfg.max_at_retries {
                        tracing::error!(
                            retries = self.at_retries,
                            "radio module not responding, session failed"
                        );
                        self.status = UplinkStatus::Failed;
                    } else {
                        tracing::debug!(retry = self.at_retries, "AT probe timeout");
                        self.step = JoinStep::SendAt;
                    }
                }
            }
            JoinStep::SendMode => {
                self.send_command("AT+MODE=LWOTAA")?;
                self.step = JoinStep::WaitMode;
            }
            JoinStep::WaitMode => self.retry_on_timeout(JoinStep::SendMode),
            JoinStep::SendKey => {
                let cmd = format!("AT+KEY=APPKEY,\"{}\"", self.cfg.app_key);
                self.send_command(&cmd)?;
                self.step = JoinStep::WaitKey;
            }
            JoinStep::WaitKey => self.retry_on_timeout(JoinStep::SendKey),
            JoinStep::SendClass => {
                self.send_command("AT+CLASS=A")?;
                self.step = JoinStep::WaitClass;
            }
            JoinStep::WaitClass => self.retry_on_timeout(JoinStep::SendClass),
            JoinStep::SendPort => {
                let cmd = format!("AT+PORT={}", self.cfg.port);
                self.send_command(&cmd)?;
                self.step = JoinStep::WaitPort;
            }
            JoinStep::WaitPort => self.retry_on_timeout(JoinStep::SendPort),
            JoinStep::SendJoin => {
                self.send_command("AT+JOIN")?;
                self.status = UplinkStatus::Joining;
                self.step = JoinStep::WaitJoin;
            }
            JoinStep::WaitJoin => {
                if self.deadline_expired(self.cfg.join_timeout_ms) {
                    tracing::warn!("join deadline expired");
                    self.rearm_join();
                }
            }
            JoinStep::JoinFailedWait => {
                if self.deadline_expired(self.cfg.response_timeout_ms) {
                    self.rearm_join();
                }
            }
            JoinStep::Ready => {}
        }
        Ok(())
    }

    /// Bounded re-send for the configuration steps after the module has
    /// answered the initial probe.
    fn retry_on_timeout(&mut self, resend: JoinStep) {
        if !self.deadline_expired(self.cfg.response_timeout_ms) {
            return;
        }
        self.step_retries += 1;
        if self.step_retries >= self.cfg.max_step_retries {
            tracing::error!(step = ?resend, "configuration step retries exhausted");
            self.status = UplinkStatus::Failed;
        } else {
            self.step = resend;
        }
    }

    fn rearm_join(&mut self) {
        self.join_attempts += 1;
        if self.join_attempts >= self.cfg.max_join_attempts {
            tracing::error!(attempts = self.join_attempts, "join attempts exhausted");
            self.status = UplinkStatus::Failed;
        } else {
            self.step = JoinStep::SendJoin;
        }
    }

    fn deadline_expired(&self, timeout_ms: u32) -> bool {
        self.clock.elapsed_since(self.step_start_ms) > timeout_ms
    }

    fn send_command(&mut self, cmd: &str) -> Result<()> {
        self.rx_buf.clear();
        self.write_line(cmd)?;
        tracing::debug!(cmd, "uplink tx");
        self.step_start_ms = self.clock.now_ms();
        Ok(())
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        self.port
            .write_all(line.as_bytes())
            .and_then(|()| self.port.write_all(b"\r\n"))
            .map_err(|e| eyre::Report::new(map_hw_error(&*e)))
            .wrap_err("uplink write")
    }
}
