//! A library for driving cellular modems that speak the Hayes/AT command
//! set over a serial port, aimed squarely at sending and receiving SMS in
//! PDU mode.
//!
//! The pieces: [`AtTransport`] frames the byte stream and arbitrates one
//! command at a time; [`SmsTransceiver`] runs the modem initialization
//! sequence and exposes the high-level operations (list/read/delete/send,
//! info queries, cell geolocation); concatenated messages are reassembled
//! into logical ones before your code sees them. Unsolicited `+CMTI`
//! indications drive the live receive path; see
//! [`SmsTransceiver::process_notification`].

pub mod cmd;
mod codec;
pub mod errors;
pub mod events;
pub mod geolocation;
mod gsm_encoding;
mod parse;
pub mod pdu;
mod reassembly;
pub mod transport;
mod util;

use crate::cmd::ensure_ok;
use crate::cmd::sms::SmsMessage;
use crate::events::Event;
use crate::reassembly::Reassembler;
use crate::transport::{AtTransport, Notification};
use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

pub use crate::errors::{Error, Result};
pub use crate::pdu::PduType;

/// The baud rates the underlying ports accept. 8N1 is assumed.
pub const BAUD_RATES: [u32; 8] = [
    9_600, 14_400, 19_200, 38_400, 57_600, 115_200, 128_000, 256_000,
];

/// The commands run once, in order, when the port first opens: echo off,
/// result codes on, verbose responses, no auto-answer, `+CMTI` indications
/// for new messages, and PDU mode.
const INIT_SEQUENCE: [&str; 6] = [
    "ATE0",
    "ATQ0",
    "ATV1",
    "ATS0=0",
    "AT+CNMI=2,1,0,0,0",
    "AT+CMGF=0",
];

/// Configuration for an [`SmsTransceiver`].
#[derive(Debug, Clone)]
pub struct TransceiverOptions {
    /// OS path of the serial device, e.g. `/dev/ttyUSB0`.
    pub path: String,
    /// One of [`BAUD_RATES`]; default 115200.
    pub baud: u32,
    /// Reassemble concatenated messages (default). Turned off, fragments
    /// surface individually with their sequence numbers.
    pub concat: bool,
}

impl Default for TransceiverOptions {
    fn default() -> Self {
        Self {
            path: "/dev/ttyUSB0".into(),
            baud: 115_200,
            concat: true,
        }
    }
}

/// A modem session: one serial port, the initialization handshake, and the
/// SMS/network operations on top of it.
///
/// Operations serialize on the transport's single in-flight slot; issuing
/// a second command while one is outstanding fails with [`Error::Busy`]
/// rather than queueing.
pub struct SmsTransceiver {
    pub(crate) transport: AtTransport,
    pub(crate) concat: bool,
    pub(crate) ready: AtomicBool,
    pub(crate) live: StdMutex<Reassembler>,
}

impl SmsTransceiver {
    pub fn new(options: TransceiverOptions) -> Result<Self> {
        if !BAUD_RATES.contains(&options.baud) {
            return Err(Error::Validation(format!(
                "baud rate {} is not one of {:?}",
                options.baud, BAUD_RATES
            )));
        }
        Ok(Self {
            transport: AtTransport::new(options.path, options.baud),
            concat: options.concat,
            ready: AtomicBool::new(false),
            live: StdMutex::new(Reassembler::new()),
        })
    }

    /// The underlying transport, for raw `exec` access and events.
    pub fn transport(&self) -> &AtTransport {
        &self.transport
    }

    /// Subscribes to the event surface.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.transport.subscribe()
    }

    /// Takes the unsolicited-notification receiver; feed what it yields to
    /// [`process_notification`](Self::process_notification).
    pub fn take_notification_rx(
        &self,
    ) -> Option<tokio::sync::mpsc::UnboundedReceiver<Notification>> {
        self.transport.take_urc_rx()
    }

    /// Opens the port and, the first time, runs the initialization
    /// sequence. Idempotent once open.
    pub async fn open(&self) -> Result<()> {
        self.transport.open().await?;
        if !self.ready.load(Ordering::Acquire) {
            self.initialize().await?;
        }
        Ok(())
    }

    /// Closes the port. Idempotent.
    pub async fn close(&self) {
        self.transport.close().await;
    }

    pub(crate) async fn initialize(&self) -> Result<()> {
        for command in INIT_SEQUENCE {
            let response = self.transport.exec(command).await?;
            if ensure_ok(&response).is_err() {
                return Err(Error::InitFailure {
                    command: command.to_string(),
                    response,
                });
            }
        }
        info!("modem initialized: PDU mode, +CMTI indications on");
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    /// The live receive path. A `+CMTI` indication makes the session read
    /// the stored fragment and run it through reassembly; when that
    /// completes a logical message, it is returned and published as an
    /// [`Event::Message`]. Anything other than `+CMTI` yields `None`.
    pub async fn process_notification(
        &self,
        notification: &Notification,
    ) -> Result<Option<SmsMessage>> {
        let Some((storage, index)) = notification.new_message() else {
            return Ok(None);
        };
        debug!("new message indication: {} slot {}", storage, index);
        let Some(fragment) = self.read_fragment(index).await? else {
            return Ok(None);
        };
        let complete = if self.concat {
            self.live.lock().unwrap().push(fragment)
        } else {
            Some(fragment)
        };
        if let Some(message) = &complete {
            self.transport.events().publish(Event::Message(message.clone()));
        }
        Ok(complete)
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    //! A scripted fake modem on an in-memory duplex pipe.
    use super::*;
    use std::sync::atomic::Ordering;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// A session wired to a pipe, with the init handshake already marked
    /// done so tests can script only the operation under test.
    pub(crate) async fn session() -> (SmsTransceiver, DuplexStream) {
        let (session, far) = raw_session().await;
        session.ready.store(true, Ordering::Release);
        (session, far)
    }

    /// Like [`session`], but with the init handshake still pending.
    pub(crate) async fn raw_session() -> (SmsTransceiver, DuplexStream) {
        let session = SmsTransceiver::new(TransceiverOptions {
            path: "test".into(),
            ..Default::default()
        })
        .unwrap();
        let (near, far) = tokio::io::duplex(16 * 1024);
        session.transport.install(near);
        (session, far)
    }

    /// Plays the modem's side: for each `(expected, reply)` entry, reads
    /// one command (up to its terminator byte), asserts it starts with
    /// `expected`, and writes back `reply`.
    pub(crate) fn script(
        mut far: DuplexStream,
        entries: Vec<(&'static str, &'static str)>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            for (expected, reply) in entries {
                let mut command = Vec::new();
                loop {
                    let n = far.read(&mut buf).await.expect("script read failed");
                    command.extend_from_slice(&buf[..n]);
                    if command.contains(&0x0D) || command.contains(&0x1A) {
                        break;
                    }
                }
                let text = String::from_utf8_lossy(&command);
                assert!(
                    text.starts_with(expected),
                    "modem script expected a command starting {:?}, got {:?}",
                    expected,
                    text
                );
                far.write_all(reply.as_bytes()).await.unwrap();
            }
            // Keep the pipe open; dropping it would look like the device
            // vanishing mid-test.
            std::future::pending::<()>().await;
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cmd::sms::ConcatState;
    use crate::pdu::testgen;
    use crate::test_util::{raw_session, script, session};

    fn cmti(index: u32) -> Notification {
        Notification {
            name: "CMTI".into(),
            line: format!("+CMTI: \"SM\",{}", index),
        }
    }

    #[test]
    fn baud_rate_is_validated() {
        let err = SmsTransceiver::new(TransceiverOptions {
            baud: 12_345,
            ..Default::default()
        });
        assert!(matches!(err, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn initialization_runs_the_exact_sequence() {
        let (session, far) = raw_session().await;
        let mut events = session.subscribe();
        script(
            far,
            vec![
                ("ATE0\r", "\r\nOK\r\n"),
                ("ATQ0\r", "\r\nOK\r\n"),
                ("ATV1\r", "\r\nOK\r\n"),
                ("ATS0=0\r", "\r\nOK\r\n"),
                ("AT+CNMI=2,1,0,0,0\r", "\r\nOK\r\n"),
                ("AT+CMGF=0\r", "\r\nOK\r\n"),
            ],
        );
        session.initialize().await.unwrap();
        assert!(session.ready.load(std::sync::atomic::Ordering::Acquire));
        let mut commands = 0;
        while let Ok(ev) = events.try_recv() {
            if let Event::Command(_) = ev {
                commands += 1;
            }
        }
        assert_eq!(commands, 6);
    }

    #[tokio::test]
    async fn initialization_fails_fast() {
        let (session, far) = raw_session().await;
        script(
            far,
            vec![("ATE0\r", "\r\nOK\r\n"), ("ATQ0\r", "\r\nERROR\r\n")],
        );
        match session.initialize().await {
            Err(Error::InitFailure { command, response }) => {
                assert_eq!(command, "ATQ0");
                assert_eq!(response, "ERROR");
            }
            other => panic!("expected InitFailure, got {:?}", other),
        }
        assert!(!session.ready.load(std::sync::atomic::Ordering::Acquire));
    }

    #[tokio::test]
    async fn live_receive_merges_three_out_of_order_fragments() {
        let (session, far) = session().await;
        let mut events = session.subscribe();
        let p1 = testgen::deliver("+8190000000000", "t1", Some((17, 3, 1)));
        let p2 = testgen::deliver("+8190000000000", "t2", Some((17, 3, 2)));
        let p3 = testgen::deliver("+8190000000000", "t3", Some((17, 3, 3)));
        let r5 = format!("\r\n+CMGR: 0,,0\r\n{}\r\nOK\r\n", p2);
        let r4 = format!("\r\n+CMGR: 0,,0\r\n{}\r\nOK\r\n", p1);
        let r6 = format!("\r\n+CMGR: 0,,0\r\n{}\r\nOK\r\n", p3);
        script(
            far,
            vec![
                ("AT+CMGR=5", Box::leak(r5.into_boxed_str())),
                ("AT+CMGR=4", Box::leak(r4.into_boxed_str())),
                ("AT+CMGR=6", Box::leak(r6.into_boxed_str())),
            ],
        );
        assert!(session.process_notification(&cmti(5)).await.unwrap().is_none());
        assert!(session.process_notification(&cmti(4)).await.unwrap().is_none());
        let merged = session
            .process_notification(&cmti(6))
            .await
            .unwrap()
            .expect("third fragment should complete the message");
        assert_eq!(merged.text, "t1t2t3");
        let concat = merged.concat.as_ref().unwrap();
        assert_eq!(concat.reference, 17);
        assert_eq!(
            concat.state,
            ConcatState::Merged {
                indexes: vec![Some(4), Some(5), Some(6)]
            }
        );
        let mut messages = 0;
        while let Ok(ev) = events.try_recv() {
            if let Event::Message(_) = ev {
                messages += 1;
            }
        }
        assert_eq!(messages, 1);
    }

    #[tokio::test]
    async fn live_receive_emits_plain_messages_immediately() {
        let (session, far) = session().await;
        let p = testgen::deliver("+8190000000000", "plain", None);
        let reply = format!("\r\n+CMGR: 0,,0\r\n{}\r\nOK\r\n", p);
        script(far, vec![("AT+CMGR=2", Box::leak(reply.into_boxed_str()))]);
        let message = session
            .process_notification(&cmti(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.text, "plain");
        assert_eq!(message.index, 2);
    }

    #[tokio::test]
    async fn live_receive_without_concat_yields_raw_fragments() {
        let session = SmsTransceiver::new(TransceiverOptions {
            path: "test".into(),
            concat: false,
            ..Default::default()
        })
        .unwrap();
        let (near, far) = tokio::io::duplex(16 * 1024);
        session.transport.install(near);
        session
            .ready
            .store(true, std::sync::atomic::Ordering::Release);
        let p = testgen::deliver("+8190000000000", "frag", Some((9, 2, 1)));
        let reply = format!("\r\n+CMGR: 0,,0\r\n{}\r\nOK\r\n", p);
        script(far, vec![("AT+CMGR=1", Box::leak(reply.into_boxed_str()))]);
        let fragment = session
            .process_notification(&cmti(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            fragment.concat.as_ref().unwrap().state,
            ConcatState::Fragment { sequence: 1 }
        );
    }

    #[tokio::test]
    async fn non_cmti_notifications_are_ignored() {
        let (session, _far) = session().await;
        let n = Notification {
            name: "HCSQ".into(),
            line: "+HCSQ: \"LTE\",46".into(),
        };
        assert!(session.process_notification(&n).await.unwrap().is_none());
    }
}
