//! The AT transport: serial port ownership, the single-outstanding-command
//! arbiter, and classification of inbound traffic.
//!
//! The port is owned by a background IO task. Callers reach it through
//! message passing: `exec` claims the one in-flight slot, hands the command
//! to the task over a channel, and awaits a oneshot reply that the task
//! fires once a response terminator (or the deadline) is hit. Unsolicited
//! lines that arrive while no command is outstanding are published as
//! notifications instead of being buffered.
use crate::codec::{scan_terminator, trim_blank_lines, LineFramer, Terminator};
use crate::errors::{Error, Result};
use crate::events::{Event, EventBus};
use crate::parse;
use bytes::Bytes;
use log::{debug, error, trace, warn};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Carriage return; terminates every command except a PDU body.
pub const TERMINATOR_CR: u8 = 0x0D;
/// Ctrl-Z; terminates the hex PDU body sent after a `> ` prompt.
pub const TERMINATOR_SUB: u8 = 0x1A;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_TIMEOUT_MS: u64 = 60_000;

/// Per-command knobs for [`AtTransport::exec_with`].
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// How long to wait for a response terminator. Valid range
    /// 1..=60 000 ms; default 10 s.
    pub timeout: Duration,
    /// The single byte written after the command text.
    pub terminator: u8,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            terminator: TERMINATOR_CR,
        }
    }
}

/// An unsolicited `+XXX: ...` line received while no command was in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// The tag between `+` and `:`, e.g. `CMTI`.
    pub name: String,
    /// The whole line, verbatim.
    pub line: String,
}

impl Notification {
    /// If this is a `+CMTI` new-message indication, returns the
    /// `(storage, index)` it carries.
    pub fn new_message(&self) -> Option<(String, u32)> {
        if self.name != "CMTI" {
            return None;
        }
        let fields = parse::info_response("+CMTI", &self.line)?;
        let storage = fields.first()?.clone();
        let index = fields.get(1)?.parse().ok()?;
        Some((storage, index))
    }
}

struct Request {
    command: String,
    terminator: u8,
    timeout: Duration,
    reply: oneshot::Sender<Result<String>>,
}

struct IoHandle {
    req_tx: mpsc::UnboundedSender<Request>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// One serial port, one command at a time.
pub struct AtTransport {
    path: String,
    baud: u32,
    events: EventBus,
    urc_tx: mpsc::UnboundedSender<Notification>,
    urc_rx: StdMutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    handle: StdMutex<Option<IoHandle>>,
    slot: Mutex<()>,
}

impl AtTransport {
    /// Creates a transport bound to a serial device path. The port is not
    /// touched until [`open`](Self::open).
    pub fn new(path: impl Into<String>, baud: u32) -> Self {
        let (urc_tx, urc_rx) = mpsc::unbounded_channel();
        Self {
            path: path.into(),
            baud,
            events: EventBus::new(),
            urc_tx,
            urc_rx: StdMutex::new(Some(urc_rx)),
            handle: StdMutex::new(None),
            slot: Mutex::new(()),
        }
    }
    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }
    /// Subscribes to the event surface.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.events.subscribe()
    }
    /// Takes the unsolicited-notification receiver. Can only be taken once.
    pub fn take_urc_rx(&self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        self.urc_rx.lock().unwrap().take()
    }
    /// Whether the port is currently open.
    pub fn is_open(&self) -> bool {
        self.handle
            .lock()
            .unwrap()
            .as_ref()
            .map(|h| !h.task.is_finished())
            .unwrap_or(false)
    }

    /// Opens the serial port and starts the IO task. Idempotent: a second
    /// call on an open transport does nothing (and emits no second
    /// `port-open`).
    pub async fn open(&self) -> Result<()> {
        {
            let handle = self.handle.lock().unwrap();
            if handle.is_some() {
                debug!("open() on an already-open port, ignoring");
                return Ok(());
            }
        }
        let builder = tokio_serial::new(&self.path, self.baud);
        let stream = tokio_serial::SerialStream::open(&builder)
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
        debug!("opened serial port {} at {} baud", self.path, self.baud);
        self.install(stream);
        Ok(())
    }

    /// Wires an already-open byte stream into the transport. This is the
    /// seam the tests use with an in-memory duplex pipe.
    pub(crate) fn install<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let events = self.events.clone();
        let urc_tx = self.urc_tx.clone();
        let task = tokio::spawn(run_io(stream, req_rx, stop_rx, events, urc_tx));
        *self.handle.lock().unwrap() = Some(IoHandle {
            req_tx,
            stop_tx: Some(stop_tx),
            task,
        });
        self.events.publish(Event::PortOpen);
    }

    /// Closes the port, rejecting any in-flight command with `PortClosed`.
    /// Idempotent.
    pub async fn close(&self) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(mut handle) = handle {
            if let Some(stop) = handle.stop_tx.take() {
                let _ = stop.send(());
            }
            let _ = (&mut handle.task).await;
        }
    }

    /// Sends `cmd` with default options and awaits its classified response.
    pub async fn exec(&self, cmd: &str) -> Result<String> {
        self.exec_with(cmd, ExecOptions::default()).await
    }

    /// Sends `cmd` followed by the terminator byte and awaits the response
    /// buffer, resolved verbatim once `OK`, `ERROR` or `> ` is seen at a
    /// line start. A modem-reported `ERROR` still resolves; structured
    /// failures are the session layer's business.
    pub async fn exec_with(&self, cmd: &str, opts: ExecOptions) -> Result<String> {
        let ms = opts.timeout.as_millis() as u64;
        if ms == 0 || ms > MAX_TIMEOUT_MS {
            return Err(Error::Validation(format!(
                "timeout must be within 1..={} ms, got {}",
                MAX_TIMEOUT_MS, ms
            )));
        }
        // The one in-flight slot. No queueing: losing the race is an error.
        let _slot = self.slot.try_lock().map_err(|_| Error::Busy)?;
        let req_tx = {
            let handle = self.handle.lock().unwrap();
            match handle.as_ref() {
                Some(h) => h.req_tx.clone(),
                None => return Err(Error::PortClosed),
            }
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        self.events.publish(Event::Command(cmd.to_string()));
        trace!("issuing command: {:?}", cmd);
        req_tx
            .send(Request {
                command: cmd.to_string(),
                terminator: opts.terminator,
                timeout: opts.timeout,
                reply: reply_tx,
            })
            .map_err(|_| Error::PortClosed)?;
        match reply_rx.await {
            Ok(result) => result,
            // The IO task died without replying.
            Err(_) => Err(Error::PortClosed),
        }
    }
}

struct Pending {
    command: String,
    terminator: u8,
    deadline: Instant,
    reply: oneshot::Sender<Result<String>>,
    buf: String,
    scanned: usize,
}

async fn run_io<S>(
    stream: S,
    mut req_rx: mpsc::UnboundedReceiver<Request>,
    mut stop_rx: oneshot::Receiver<()>,
    events: EventBus,
    urc_tx: mpsc::UnboundedSender<Notification>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut rd, mut wr) = tokio::io::split(stream);
    let mut framer = LineFramer::new();
    let mut raw = vec![0u8; 1024];
    let mut idle_buf = String::new();
    let mut pending: Option<Pending> = None;
    loop {
        let deadline = pending.as_ref().map(|p| p.deadline);
        tokio::select! {
            _ = &mut stop_rx => {
                debug!("transport stopping");
                break;
            }
            _ = async { tokio::time::sleep_until(deadline.unwrap()).await }, if deadline.is_some() => {
                // Deadline hit: abandon the write state and free the slot.
                // The port stays open; anything that trickles in later is
                // classified as idle traffic.
                let p = pending.take().unwrap();
                warn!("command {:?} timed out", p.command);
                let _ = p.reply.send(Err(Error::Timeout {
                    command: p.command,
                    terminator: p.terminator,
                }));
            }
            req = req_rx.recv(), if pending.is_none() => {
                let Some(req) = req else {
                    debug!("request channel closed, transport exiting");
                    break;
                };
                let mut data = Vec::with_capacity(req.command.len() + 1);
                data.extend_from_slice(req.command.as_bytes());
                data.push(req.terminator);
                let write = async {
                    wr.write_all(&data).await?;
                    wr.flush().await
                };
                match write.await {
                    Ok(()) => {
                        pending = Some(Pending {
                            deadline: Instant::now() + req.timeout,
                            command: req.command,
                            terminator: req.terminator,
                            reply: req.reply,
                            buf: String::new(),
                            scanned: 0,
                        });
                    }
                    Err(e) => {
                        error!("write failed: {}", e);
                        let _ = req.reply.send(Err(Error::Io(e)));
                    }
                }
            }
            read = rd.read(&mut raw) => {
                match read {
                    Ok(0) => {
                        debug!("stream ran out, transport exiting");
                        break;
                    }
                    Ok(n) => {
                        events.publish(Event::RawBytes(Bytes::copy_from_slice(&raw[..n])));
                        let norm = framer.feed(&raw[..n]);
                        trace!("received: {:?}", norm);
                        if let Some(p) = pending.as_mut() {
                            p.buf.push_str(&norm);
                            if let Some(t) = scan_terminator(&p.buf, &mut p.scanned) {
                                let p = pending.take().unwrap();
                                trace!("response complete ({:?})", t);
                                let response = trim_blank_lines(&p.buf).to_string();
                                events.publish(Event::Response(response.clone()));
                                let _ = p.reply.send(Ok(response));
                            }
                        } else {
                            idle_buf.push_str(&norm);
                            drain_idle_lines(&mut idle_buf, &events, &urc_tx);
                        }
                    }
                    Err(e) => {
                        error!("read failed: {}", e);
                        break;
                    }
                }
            }
        }
    }
    if let Some(p) = pending.take() {
        let _ = p.reply.send(Err(Error::PortClosed));
    }
    events.publish(Event::PortClose);
}

/// Classifies complete idle lines: `+XXX:` lines become notifications,
/// anything else is noise (already visible on the raw-bytes event).
fn drain_idle_lines(
    idle_buf: &mut String,
    events: &EventBus,
    urc_tx: &mpsc::UnboundedSender<Notification>,
) {
    while let Some(i) = idle_buf.find('\n') {
        let line = idle_buf[..i].trim().to_string();
        idle_buf.drain(..=i);
        if line.is_empty() {
            continue;
        }
        match parse::notification_name(&line) {
            Some(name) => {
                debug!("notification: {}", line);
                events.publish(Event::Notification(line.clone()));
                let _ = urc_tx.send(Notification {
                    name: name.to_string(),
                    line,
                });
            }
            None => trace!("discarding idle line: {:?}", line),
        }
    }
}
