//! Listing, reading, deleting, sending and storing SMS messages.
//!
//! Everything here runs in PDU mode (the initialization sequence pins
//! `AT+CMGF=0`); message bodies on the wire are uppercase hex PDUs handed
//! to the `pdu` codec. Concatenated messages are reassembled before they
//! reach the caller unless the session was configured with `concat` off.
use crate::cmd::{ensure_ok, has_prompt, validate_destination};
use crate::errors::{Error, Result};
use crate::parse;
use crate::pdu::{self, ParsedPdu, PduType};
use crate::reassembly;
use crate::transport::{ExecOptions, TERMINATOR_SUB};
use crate::util::{int_field, FromModemInt};
use crate::SmsTransceiver;
use chrono::{DateTime, FixedOffset};
use log::debug;
use num_derive::FromPrimitive;

/// The storage status of an SMS message (as listed by `AT+CMGL`).
#[repr(u8)]
#[derive(Debug, FromPrimitive, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageStatus {
    /// Received and unread.
    ReceivedUnread = 0,
    /// Received and read.
    ReceivedRead = 1,
    /// Outgoing and unsent.
    StoredUnsent = 2,
    /// Outgoing and sent.
    StoredSent = 3,
    /// Any kind (used for listing only).
    All = 4,
}

/// Concatenation metadata on a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcatInfo {
    /// Groups the fragments of one logical message.
    pub reference: u16,
    /// How many fragments the message was split into (positive).
    pub total: u8,
    pub state: ConcatState,
}

/// Where a concatenated message is in its life: a lone fragment still
/// knows only its own position; a merged message knows where every
/// fragment was stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConcatState {
    /// An individual fragment, before reassembly. 1-based.
    Fragment { sequence: u8 },
    /// A reassembled message: storage indexes ordered by sequence, one per
    /// fragment, `None` where a fragment never turned up.
    Merged { indexes: Vec<Option<u32>> },
}

/// An SMS message, after any reassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsMessage {
    /// Storage index in the modem's memory.
    pub index: u32,
    pub status: MessageStatus,
    /// SMS-DELIVER (received) or SMS-SUBMIT (outgoing).
    pub kind: PduType,
    /// Sender; set iff this is a DELIVER.
    pub from: Option<String>,
    /// Recipient; set iff this is a SUBMIT.
    pub to: Option<String>,
    /// Service-centre timestamp; DELIVER only.
    pub date: Option<DateTime<FixedOffset>>,
    /// Absent on single messages.
    pub concat: Option<ConcatInfo>,
    /// Full text; a partially reassembled message substitutes `[?]` for
    /// each missing fragment.
    pub text: String,
}

/// Per-storage-area occupancy, from `AT+CPMS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageArea {
    pub memory: String,
    pub used: u32,
    pub total: u32,
}

/// The three `CPMS` storage slots: read/delete, write/send, and receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageStorage {
    pub read: StorageArea,
    pub write: StorageArea,
    pub receive: StorageArea,
}

const STORAGE_NAMES: [&str; 3] = ["SM", "ME", "MT"];

fn message_from_pdu(index: u32, status: MessageStatus, parsed: ParsedPdu) -> SmsMessage {
    SmsMessage {
        index,
        status,
        kind: parsed.kind,
        from: parsed.origination,
        to: parsed.destination,
        date: parsed.timestamp,
        concat: parsed.concat.map(|c| ConcatInfo {
            reference: c.reference,
            total: c.total,
            state: ConcatState::Fragment {
                sequence: c.sequence,
            },
        }),
        text: parsed.text,
    }
}

/// Walks a `+CMGL` response with a two-state machine: a header line
/// announces a message, the following line must be its hex PDU.
fn parse_cmgl(response: &str) -> Result<Vec<SmsMessage>> {
    let mut out = vec![];
    let mut pending: Option<(u32, MessageStatus)> = None;
    for line in response.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        if let Some(fields) = parse::info_response("+CMGL", line) {
            if pending.is_some() {
                return Err(Error::Protocol(
                    "+CMGL header without a PDU line".to_string(),
                ));
            }
            let index = int_field(&fields, 0, "CMGL index")?;
            let status = MessageStatus::from_integer(int_field(&fields, 1, "CMGL stat")?)?;
            pending = Some((index, status));
        } else if let Some((index, status)) = pending.take() {
            if !parse::is_hex_pdu(line) {
                return Err(Error::Protocol(format!(
                    "expected a hex PDU after the +CMGL header, got {:?}",
                    line
                )));
            }
            out.push(message_from_pdu(index, status, pdu::parse_pdu(line)?));
        } else if line.starts_with("OK") {
            break;
        }
    }
    if pending.is_some() {
        return Err(Error::Protocol(
            "+CMGL header without a PDU line".to_string(),
        ));
    }
    Ok(out)
}

impl SmsTransceiver {
    /// Lists stored messages (`AT+CMGL`), sorted by index and, with
    /// concatenation handling on, reassembled into logical messages.
    pub async fn list_messages(&self, status: MessageStatus) -> Result<Vec<SmsMessage>> {
        let response = self
            .transport
            .exec(&format!("AT+CMGL={}", status as u8))
            .await?;
        ensure_ok(&response)?;
        let mut messages = parse_cmgl(&response)?;
        messages.sort_by_key(|m| m.index);
        if self.concat {
            Ok(reassembly::merge_list(messages))
        } else {
            Ok(messages)
        }
    }

    /// Reads one stored slot (`AT+CMGR`) without touching reassembly; a
    /// concatenated slot comes back as its lone fragment.
    pub(crate) async fn read_fragment(&self, index: u32) -> Result<Option<SmsMessage>> {
        let response = self.transport.exec(&format!("AT+CMGR={}", index)).await?;
        let mut lines = response.lines().map(str::trim).filter(|l| !l.is_empty());
        let Some(fields) = lines.next().and_then(|l| parse::info_response("+CMGR", l)) else {
            return Ok(None);
        };
        let status = MessageStatus::from_integer(int_field(&fields, 0, "CMGR stat")?)?;
        let Some(pdu_line) = lines.next().filter(|l| parse::is_hex_pdu(l)) else {
            return Ok(None);
        };
        Ok(Some(message_from_pdu(
            index,
            status,
            pdu::parse_pdu(pdu_line)?,
        )))
    }

    /// Reads the message stored at `index` (`AT+CMGR`). When the slot
    /// holds one fragment of a concatenated message and concatenation
    /// handling is on, the whole store is listed and the merged message
    /// containing that fragment is returned instead.
    pub async fn read_message(&self, index: u32) -> Result<Option<SmsMessage>> {
        let Some(message) = self.read_fragment(index).await? else {
            return Ok(None);
        };
        if self.concat && message.concat.is_some() {
            let merged = self.list_messages(MessageStatus::All).await?;
            return Ok(merged.into_iter().find(|m| covers_index(m, index)));
        }
        Ok(Some(message))
    }

    /// Deletes the message at `index` (`AT+CMGD`), first reading it so the
    /// caller learns what went away. Deleting one fragment of a merged
    /// message deletes every fragment of it.
    pub async fn delete_message(&self, index: u32) -> Result<Option<SmsMessage>> {
        let message = self.read_message(index).await?;
        for target in fragment_targets(index, message.as_ref()) {
            let response = self.transport.exec(&format!("AT+CMGD={}", target)).await?;
            ensure_ok(&response)?;
        }
        Ok(message)
    }

    /// Deletes every stored message (`AT+CMGD=0,4`).
    pub async fn delete_all_messages(&self) -> Result<()> {
        let response = self.transport.exec("AT+CMGD=0,4").await?;
        ensure_ok(&response)
    }

    /// Sends a message (`AT+CMGS`), splitting it into concatenated
    /// fragments as needed. Fragments go out strictly in sequence; the
    /// first failure aborts with no rollback of the parts already sent.
    pub async fn send_message(&self, destination: &str, text: &str) -> Result<()> {
        validate_destination(destination)?;
        for segment in pdu::build_submit(destination, text)? {
            self.two_phase_submit(format!("AT+CMGS={}", segment.tpdu_len), &segment.hex)
                .await?;
        }
        Ok(())
    }

    /// Stores a message in the outgoing store without sending it
    /// (`AT+CMGW=<len>,2`). Returns the storage index of each fragment.
    pub async fn write_submit_message(
        &self,
        destination: &str,
        text: &str,
    ) -> Result<Vec<u32>> {
        validate_destination(destination)?;
        let mut indexes = vec![];
        for segment in pdu::build_submit(destination, text)? {
            let response = self
                .two_phase_submit(format!("AT+CMGW={},2", segment.tpdu_len), &segment.hex)
                .await?;
            let fields = response
                .lines()
                .find_map(|l| parse::info_response("+CMGW", l))
                .ok_or_else(|| {
                    Error::Protocol(format!("no +CMGW index in response {:?}", response))
                })?;
            indexes.push(int_field(&fields, 0, "CMGW index")?);
        }
        Ok(indexes)
    }

    /// Sends a stored message (`AT+CMSS`), fragment by fragment for a
    /// concatenated one. The first non-`OK` aborts.
    pub async fn send_stored_message(&self, index: u32) -> Result<()> {
        let message = self.read_message(index).await?;
        for target in fragment_targets(index, message.as_ref()) {
            let response = self.transport.exec(&format!("AT+CMSS={}", target)).await?;
            ensure_ok(&response)?;
        }
        Ok(())
    }

    /// Reports the three `AT+CPMS` storage areas.
    pub async fn message_storage(&self) -> Result<MessageStorage> {
        let response = self.transport.exec("AT+CPMS?").await?;
        ensure_ok(&response)?;
        let fields = response
            .lines()
            .find_map(|l| parse::info_response("+CPMS", l))
            .ok_or_else(|| Error::Protocol("no +CPMS line in response".to_string()))?;
        if fields.len() < 9 {
            return Err(Error::Protocol(format!(
                "+CPMS reported {} fields, expected 9",
                fields.len()
            )));
        }
        let area = |i: usize| -> Result<StorageArea> {
            Ok(StorageArea {
                memory: fields[i].clone(),
                used: int_field(&fields, i + 1, "CPMS used")?,
                total: int_field(&fields, i + 2, "CPMS total")?,
            })
        };
        Ok(MessageStorage {
            read: area(0)?,
            write: area(3)?,
            receive: area(6)?,
        })
    }

    /// Points all three `AT+CPMS` storage areas at `memory` and reports
    /// the resulting occupancy.
    pub async fn set_message_storage(&self, memory: &str) -> Result<MessageStorage> {
        if !STORAGE_NAMES.contains(&memory) {
            return Err(Error::Validation(format!(
                "storage memory must be one of {:?}, got {:?}",
                STORAGE_NAMES, memory
            )));
        }
        let response = self
            .transport
            .exec(&format!("AT+CPMS=\"{0}\",\"{0}\",\"{0}\"", memory))
            .await?;
        ensure_ok(&response)?;
        let fields = response
            .lines()
            .find_map(|l| parse::info_response("+CPMS", l))
            .ok_or_else(|| Error::Protocol("no +CPMS line in response".to_string()))?;
        if fields.len() < 6 {
            return Err(Error::Protocol(format!(
                "+CPMS reported {} fields, expected 6",
                fields.len()
            )));
        }
        let area = |i: usize| -> Result<StorageArea> {
            Ok(StorageArea {
                memory: memory.to_string(),
                used: int_field(&fields, i, "CPMS used")?,
                total: int_field(&fields, i + 1, "CPMS total")?,
            })
        };
        Ok(MessageStorage {
            read: area(0)?,
            write: area(2)?,
            receive: area(4)?,
        })
    }

    /// The `CMGS`/`CMGW` dance: announce the TPDU length, wait for the
    /// `> ` prompt, then push the hex PDU terminated by Ctrl-Z.
    async fn two_phase_submit(&self, announce: String, pdu_hex: &str) -> Result<String> {
        let first = self.transport.exec(&announce).await?;
        if !has_prompt(&first) {
            return Err(Error::Modem(first));
        }
        debug!("prompt received for {:?}, sending PDU", announce);
        let second = self
            .transport
            .exec_with(
                pdu_hex,
                ExecOptions {
                    terminator: TERMINATOR_SUB,
                    ..Default::default()
                },
            )
            .await?;
        ensure_ok(&second)?;
        Ok(second)
    }
}

fn covers_index(message: &SmsMessage, index: u32) -> bool {
    if message.index == index {
        return true;
    }
    match &message.concat {
        Some(ConcatInfo {
            state: ConcatState::Merged { indexes },
            ..
        }) => indexes.contains(&Some(index)),
        _ => false,
    }
}

/// The storage slots an operation on `index` actually touches: every known
/// fragment for a merged message, otherwise just the index itself.
fn fragment_targets(index: u32, message: Option<&SmsMessage>) -> Vec<u32> {
    if let Some(SmsMessage {
        concat:
            Some(ConcatInfo {
                state: ConcatState::Merged { indexes },
                ..
            }),
        ..
    }) = message
    {
        let known: Vec<u32> = indexes.iter().flatten().copied().collect();
        if !known.is_empty() {
            return known;
        }
    }
    vec![index]
}
