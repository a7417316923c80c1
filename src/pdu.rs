//! The SMS PDU codec: parsing hex-encoded SMS-DELIVER/SMS-SUBMIT TPDUs and
//! building SMS-SUBMIT PDUs (including concatenated ones) from a
//! destination and a text.
//!
//! Everything here speaks the 3GPP TS 23.040 wire format: semi-octet BCD
//! addresses and timestamps, a first octet of flag bits, an optional User
//! Data Header for concatenation, and user data in either the GSM 7-bit
//! alphabet or UCS-2 (see the `gsm_encoding` module).
use crate::errors::{Error, Result};
use crate::gsm_encoding::{
    gsm_decode, pack_septets, try_gsm_encode, ucs2_decode, ucs2_encode, unpack_septets,
};
use chrono::{DateTime, FixedOffset, TimeZone};
use std::fmt;

/// PDU type, as carried in the two low bits of the first octet.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PduType {
    /// A message received from the network.
    Deliver,
    /// An outbound (or stored-outbound) message.
    Submit,
}

impl fmt::Display for PduType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PduType::Deliver => write!(f, "SMS-DELIVER"),
            PduType::Submit => write!(f, "SMS-SUBMIT"),
        }
    }
}

/// User data encoding, from bits 2..3 of the data coding scheme.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageEncoding {
    Gsm7Bit,
    EightBit,
    Ucs2,
    Reserved,
}

impl MessageEncoding {
    fn from_dcs(dcs: u8) -> Self {
        match dcs & 0x0C {
            0x00 => MessageEncoding::Gsm7Bit,
            0x04 => MessageEncoding::EightBit,
            0x08 => MessageEncoding::Ucs2,
            _ => MessageEncoding::Reserved,
        }
    }
}

/// The concatenation header of one fragment, from UDH information element
/// 0x00 (8-bit reference) or 0x08 (16-bit reference).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConcatFragment {
    /// Identifies which logical message this fragment belongs to.
    pub reference: u16,
    /// Total number of fragments (positive).
    pub total: u8,
    /// This fragment's 1-based position.
    pub sequence: u8,
}

/// A decoded PDU.
#[derive(Debug, Clone)]
pub struct ParsedPdu {
    pub kind: PduType,
    /// Sender; set for SMS-DELIVER only.
    pub origination: Option<String>,
    /// Recipient; set for SMS-SUBMIT only.
    pub destination: Option<String>,
    /// Service-centre timestamp; SMS-DELIVER only.
    pub timestamp: Option<DateTime<FixedOffset>>,
    /// Present when this PDU is one fragment of a concatenated message.
    pub concat: Option<ConcatFragment>,
    pub text: String,
}

/// One wire-ready segment out of [`build_submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitSegment {
    /// Uppercase hex PDU, including the leading zero SMSC octet.
    pub hex: String,
    /// TPDU octet count (excludes the SMSC octet) for `AT+CMGS=`/`AT+CMGW=`.
    pub tpdu_len: usize,
}

/// Byte cursor with bounds-checked reads; running past the end of a
/// truncated PDU is a decode error, not a panic.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
    fn u8(&mut self, what: &'static str) -> Result<u8> {
        let b = *self.data.get(self.pos).ok_or(Error::InvalidPdu(what))?;
        self.pos += 1;
        Ok(b)
    }
    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(Error::InvalidPdu(what))?;
        let s = self.data.get(self.pos..end).ok_or(Error::InvalidPdu(what))?;
        self.pos = end;
        Ok(s)
    }
    fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

fn decode_bcd(b: u8) -> u32 {
    u32::from(b & 0x0F) * 10 + u32::from(b >> 4)
}

/// Reads a sender/recipient address: length (useful semi-octets), type
/// octet, then digits. Alphanumeric addresses are GSM 7-bit packed names.
fn decode_address(r: &mut Reader) -> Result<String> {
    let len = r.u8("address length")? as usize;
    let ton = r.u8("address type")?;
    let data = r.take((len + 1) / 2, "address digits")?;
    if ton & 0x70 == 0x50 {
        let septets = unpack_septets(data, 0, len * 4 / 7);
        return Ok(gsm_decode(&septets));
    }
    let mut number = String::with_capacity(len + 1);
    if ton & 0x70 == 0x10 {
        number.push('+');
    }
    let mut digits = 0;
    for &b in data {
        for nibble in [b & 0x0F, b >> 4] {
            if digits < len && nibble <= 9 {
                number.push(char::from(b'0' + nibble));
                digits += 1;
            }
        }
    }
    Ok(number)
}

/// Builds the address field for a destination number: optional leading `+`
/// selects the international type-of-number.
fn encode_address(number: &str) -> Result<Vec<u8>> {
    let (ton, digits) = match number.strip_prefix('+') {
        Some(rest) => (0x91, rest),
        None => (0x81, number),
    };
    let mut out = Vec::with_capacity(2 + (digits.len() + 1) / 2);
    out.push(digits.len() as u8);
    out.push(ton);
    let bytes = digits.as_bytes();
    for pair in bytes.chunks(2) {
        let lo = pair[0] - b'0';
        let hi = pair.get(1).map(|d| d - b'0').unwrap_or(0x0F);
        out.push(hi << 4 | lo);
    }
    Ok(out)
}

/// Service-centre timestamp: six swapped-BCD fields plus a zone octet in
/// quarter hours, sign in bit 3.
fn decode_timestamp(b: &[u8]) -> Option<DateTime<FixedOffset>> {
    let year = 2000 + decode_bcd(b[0]) as i32;
    let month = decode_bcd(b[1]);
    let day = decode_bcd(b[2]);
    let hour = decode_bcd(b[3]);
    let minute = decode_bcd(b[4]);
    let second = decode_bcd(b[5]);
    let quarters = i32::from(b[6] & 0x07) * 10 + i32::from(b[6] >> 4);
    let offset_secs = quarters * 15 * 60 * if b[6] & 0x08 != 0 { -1 } else { 1 };
    let offset = FixedOffset::east_opt(offset_secs)?;
    offset
        .with_ymd_and_hms(year, month, day, hour, minute, second)
        .single()
}

struct UserData<'a> {
    concat: Option<ConcatFragment>,
    /// Octets covered by the UDH, including its length octet.
    header_len: usize,
    body: &'a [u8],
}

/// Walks the User Data Header looking for a concatenation element.
fn decode_user_data(ud: &[u8], udhi: bool) -> Result<UserData> {
    if !udhi {
        return Ok(UserData {
            concat: None,
            header_len: 0,
            body: ud,
        });
    }
    let udhl = *ud.first().ok_or(Error::InvalidPdu("UDHI set but no user data"))? as usize;
    let header = ud
        .get(1..1 + udhl)
        .ok_or(Error::InvalidPdu("UDH length past end of data"))?;
    let mut concat = None;
    let mut i = 0;
    while i + 1 < header.len() {
        let (id, len) = (header[i], header[i + 1] as usize);
        let data = header
            .get(i + 2..i + 2 + len)
            .ok_or(Error::InvalidPdu("UDH element length past end of header"))?;
        match (id, len) {
            (0x00, 3) => {
                concat = Some(ConcatFragment {
                    reference: u16::from(data[0]),
                    total: data[1],
                    sequence: data[2],
                });
            }
            (0x08, 4) => {
                concat = Some(ConcatFragment {
                    reference: u16::from(data[0]) << 8 | u16::from(data[1]),
                    total: data[2],
                    sequence: data[3],
                });
            }
            _ => {}
        }
        i += 2 + len;
    }
    Ok(UserData {
        concat,
        header_len: 1 + udhl,
        body: &ud[1 + udhl..],
    })
}

fn decode_text(ud: &UserData, encoding: MessageEncoding, udl: usize) -> Result<String> {
    match encoding {
        MessageEncoding::Gsm7Bit => {
            // The UDL counts septets, header octets included; text restarts
            // on a septet boundary after the header's fill bits.
            if ud.header_len == 0 {
                let septets = unpack_septets(ud.body, 0, udl);
                return Ok(gsm_decode(&septets));
            }
            let header_bits = ud.header_len * 8;
            let fill = (7 - header_bits % 7) % 7;
            let skip = (header_bits + fill) / 7;
            let count = udl.saturating_sub(skip);
            let septets = unpack_septets(ud.body, fill, count);
            Ok(gsm_decode(&septets))
        }
        MessageEncoding::Ucs2 => {
            let take = udl
                .saturating_sub(ud.header_len)
                .min(ud.body.len());
            Ok(ucs2_decode(&ud.body[..take]))
        }
        e => Err(Error::UnsupportedEncoding(e, ud.body.to_vec())),
    }
}

/// Parses a hex PDU, SMSC prefix included, into its interesting parts.
pub fn parse_pdu(hex_pdu: &str) -> Result<ParsedPdu> {
    let bytes =
        hex::decode(hex_pdu.trim()).map_err(|_| Error::InvalidPdu("not a hex octet string"))?;
    let mut r = Reader::new(&bytes);
    let sca_len = r.u8("SMSC length")? as usize;
    r.take(sca_len, "SMSC address")?;
    let fo = r.u8("first octet")?;
    let udhi = fo & 0x40 != 0;
    match fo & 0x03 {
        0x00 => {
            let origination = decode_address(&mut r)?;
            let _pid = r.u8("protocol identifier")?;
            let dcs = r.u8("data coding scheme")?;
            let scts = r.take(7, "service centre timestamp")?;
            let timestamp = decode_timestamp(scts);
            let udl = r.u8("user data length")? as usize;
            let ud = decode_user_data(r.rest(), udhi)?;
            let text = decode_text(&ud, MessageEncoding::from_dcs(dcs), udl)?;
            Ok(ParsedPdu {
                kind: PduType::Deliver,
                origination: Some(origination),
                destination: None,
                timestamp,
                concat: ud.concat,
                text,
            })
        }
        0x01 => {
            let _mr = r.u8("message reference")?;
            let destination = decode_address(&mut r)?;
            let _pid = r.u8("protocol identifier")?;
            let dcs = r.u8("data coding scheme")?;
            match fo & 0x18 {
                0x10 => {
                    r.u8("validity period")?;
                }
                0x08 | 0x18 => {
                    r.take(7, "validity period")?;
                }
                _ => {}
            }
            let udl = r.u8("user data length")? as usize;
            let ud = decode_user_data(r.rest(), udhi)?;
            let text = decode_text(&ud, MessageEncoding::from_dcs(dcs), udl)?;
            Ok(ParsedPdu {
                kind: PduType::Submit,
                origination: None,
                destination: Some(destination),
                timestamp: None,
                concat: ud.concat,
                text,
            })
        }
        _ => Err(Error::InvalidPdu("unsupported message type indicator")),
    }
}

// Size limits from TS 23.040: a lone 7-bit message carries 160 septets
// (153 behind a 6-octet UDH); UCS-2 carries 140 octets (134 behind one).
const GSM7_SINGLE: usize = 160;
const GSM7_PART: usize = 153;
const UCS2_SINGLE: usize = 140;
const UCS2_PART: usize = 134;

fn concat_udh(reference: u8, total: u8, sequence: u8) -> Vec<u8> {
    vec![0x05, 0x00, 0x03, reference, total, sequence]
}

/// Splits septets on part boundaries without orphaning an escape pair.
fn split_gsm7(mut septets: Vec<u8>, max: usize) -> Vec<Vec<u8>> {
    let mut parts = vec![];
    while septets.len() > max {
        let mut at = max;
        if septets[at - 1] == 0x1B {
            at -= 1;
        }
        let rest = septets.split_off(at);
        parts.push(std::mem::replace(&mut septets, rest));
    }
    parts.push(septets);
    parts
}

/// Splits UTF-16 code units without cutting a surrogate pair in half.
fn split_ucs2(text: &str, max_units: usize) -> Vec<Vec<u8>> {
    let units: Vec<u16> = text.encode_utf16().collect();
    let mut parts = vec![];
    let mut start = 0;
    while start < units.len() {
        let mut end = (start + max_units).min(units.len());
        if end < units.len() && (0xD800..0xDC00).contains(&units[end - 1]) {
            end -= 1;
        }
        parts.push(units[start..end].iter().flat_map(|u| u.to_be_bytes()).collect());
        start = end;
    }
    parts
}

struct Segment {
    dcs: u8,
    udh: Option<Vec<u8>>,
    packed: Vec<u8>,
    udl: usize,
}

fn segment_text(text: &str) -> Vec<Segment> {
    if let Some(septets) = try_gsm_encode(text) {
        if septets.len() <= GSM7_SINGLE {
            let udl = septets.len();
            return vec![Segment {
                dcs: 0x00,
                udh: None,
                packed: pack_septets(&septets, 0),
                udl,
            }];
        }
        let parts = split_gsm7(septets, GSM7_PART);
        let reference = rand::random::<u8>();
        let total = parts.len() as u8;
        parts
            .into_iter()
            .enumerate()
            .map(|(i, part)| {
                let udh = concat_udh(reference, total, i as u8 + 1);
                let header_bits = udh.len() * 8;
                let fill = (7 - header_bits % 7) % 7;
                let udl = (header_bits + fill) / 7 + part.len();
                Segment {
                    dcs: 0x00,
                    packed: pack_septets(&part, fill),
                    udh: Some(udh),
                    udl,
                }
            })
            .collect()
    } else {
        let encoded = ucs2_encode(text);
        if encoded.len() <= UCS2_SINGLE {
            let udl = encoded.len();
            return vec![Segment {
                dcs: 0x08,
                udh: None,
                packed: encoded,
                udl,
            }];
        }
        let parts = split_ucs2(text, UCS2_PART / 2);
        let reference = rand::random::<u8>();
        let total = parts.len() as u8;
        parts
            .into_iter()
            .enumerate()
            .map(|(i, part)| {
                let udh = concat_udh(reference, total, i as u8 + 1);
                let udl = udh.len() + part.len();
                Segment {
                    dcs: 0x08,
                    packed: part,
                    udh: Some(udh),
                    udl,
                }
            })
            .collect()
    }
}

/// Builds one or more SMS-SUBMIT PDUs carrying `text` to `dest`, in
/// sending order. More than one segment means the message went out
/// concatenated and each part must be submitted separately.
pub fn build_submit(dest: &str, text: &str) -> Result<Vec<SubmitSegment>> {
    let address = encode_address(dest)?;
    let segments = segment_text(text);
    let out = segments
        .into_iter()
        .map(|seg| {
            let mut tpdu = Vec::with_capacity(8 + address.len() + seg.packed.len());
            let mut fo = 0x11; // SMS-SUBMIT, relative validity period
            if seg.udh.is_some() {
                fo |= 0x40;
            }
            tpdu.push(fo);
            tpdu.push(0x00); // message reference: let the modem pick
            tpdu.extend_from_slice(&address);
            tpdu.push(0x00); // protocol identifier
            tpdu.push(seg.dcs);
            tpdu.push(0xAA); // validity period: 4 days
            tpdu.push(seg.udl as u8);
            if let Some(udh) = &seg.udh {
                tpdu.extend_from_slice(udh);
            }
            tpdu.extend_from_slice(&seg.packed);
            let tpdu_len = tpdu.len();
            let mut pdu = Vec::with_capacity(tpdu_len + 1);
            pdu.push(0x00); // no SMSC: use the modem's configured one
            pdu.extend_from_slice(&tpdu);
            SubmitSegment {
                hex: hex::encode_upper(&pdu),
                tpdu_len,
            }
        })
        .collect();
    Ok(out)
}


#[cfg(test)]
mod test {
    use super::*;

    // The much-copied GSM study-group example message.
    const DELIVER_PDU: &str =
        "07911326880736F4040B911346610089F60000208062917314080CC8F71D14969741F977FD07";

    #[test]
    fn parse_plain_deliver() {
        let pdu = parse_pdu(DELIVER_PDU).unwrap();
        assert_eq!(pdu.kind, PduType::Deliver);
        assert_eq!(pdu.origination.as_deref(), Some("+31641600986"));
        assert_eq!(pdu.destination, None);
        assert_eq!(pdu.text, "How are you?");
        assert!(pdu.concat.is_none());
        let ts = pdu.timestamp.unwrap();
        assert_eq!(ts.format("%Y-%m-%dT%H:%M:%S").to_string(), "2002-08-26T19:37:41");
    }

    #[test]
    fn parse_generated_deliver_with_timestamp() {
        let hex = testgen::deliver("+8190000000000", "hello", None);
        let pdu = parse_pdu(&hex).unwrap();
        assert_eq!(pdu.origination.as_deref(), Some("+8190000000000"));
        assert_eq!(pdu.text, "hello");
        let ts = pdu.timestamp.unwrap();
        assert_eq!(ts.to_rfc3339(), "2025-07-12T08:30:05+09:00");
    }

    #[test]
    fn parse_deliver_fragment_concat_header() {
        let hex = testgen::deliver("+8190000000000", "part two", Some((17, 3, 2)));
        let pdu = parse_pdu(&hex).unwrap();
        assert_eq!(
            pdu.concat,
            Some(ConcatFragment {
                reference: 17,
                total: 3,
                sequence: 2
            })
        );
        assert_eq!(pdu.text, "part two");
    }

    #[test]
    fn submit_single_round_trip() {
        let segments = build_submit("+8190000000000", "short and sweet").unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].tpdu_len, (segments[0].hex.len() / 2) - 1);
        let pdu = parse_pdu(&segments[0].hex).unwrap();
        assert_eq!(pdu.kind, PduType::Submit);
        assert_eq!(pdu.destination.as_deref(), Some("+8190000000000"));
        assert_eq!(pdu.text, "short and sweet");
        assert!(pdu.concat.is_none());
    }

    #[test]
    fn submit_long_text_concatenates() {
        let text = "z".repeat(200);
        let segments = build_submit("+8190000000000", &text).unwrap();
        assert_eq!(segments.len(), 2);
        let parts: Vec<ParsedPdu> = segments
            .iter()
            .map(|s| parse_pdu(&s.hex).unwrap())
            .collect();
        let c0 = parts[0].concat.unwrap();
        let c1 = parts[1].concat.unwrap();
        assert_eq!((c0.total, c0.sequence), (2, 1));
        assert_eq!((c1.total, c1.sequence), (2, 2));
        assert_eq!(c0.reference, c1.reference);
        assert_eq!(parts[0].text.len(), 153);
        assert_eq!(format!("{}{}", parts[0].text, parts[1].text), text);
    }

    #[test]
    fn submit_ucs2_when_alphabet_does_not_fit() {
        let segments = build_submit("+8190000000000", "日本語のテキスト").unwrap();
        assert_eq!(segments.len(), 1);
        let pdu = parse_pdu(&segments[0].hex).unwrap();
        assert_eq!(pdu.text, "日本語のテキスト");
    }

    #[test]
    fn odd_length_address_pads_with_f() {
        let segments = build_submit("12345", "x").unwrap();
        let pdu = parse_pdu(&segments[0].hex).unwrap();
        assert_eq!(pdu.destination.as_deref(), Some("12345"));
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(matches!(parse_pdu("zz"), Err(Error::InvalidPdu(_))));
        assert!(matches!(parse_pdu("07"), Err(Error::InvalidPdu(_))));
        // Truncated in the middle of the address.
        assert!(matches!(parse_pdu("00040B91"), Err(Error::InvalidPdu(_))));
    }
}
