//! Modem identity and network state: device info, operator, registration,
//! signal quality, PDP contexts, and the cell coordinates used for
//! geolocation.
use crate::cmd::{ensure_ok, single_value};
use crate::errors::{Error, Result};
use crate::geolocation::GeolocationOptions;
use crate::parse;
use crate::util::{int_field, FromModemInt};
use crate::SmsTransceiver;
use num_derive::FromPrimitive;
use serde_json::Value;

/// Device identity, from the `AT+CGMx` family plus `AT+CNUM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModemInfo {
    pub manufacturer: String,
    pub model: String,
    pub revision: String,
    /// IMEI / serial number.
    pub serial: String,
    /// The subscriber number, when the SIM knows it.
    pub number: Option<String>,
}

/// The current registration state of the modem (from `AT+CREG`).
#[repr(u8)]
#[derive(Debug, FromPrimitive, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum RegistrationState {
    /// Not registered, and not searching for a new operator at present.
    NotRegisteredAndDisabled = 0,
    /// Registered, and on our 'home' network (i.e. not roaming).
    RegisteredHome = 1,
    /// Not registered, and searching for a new operator.
    NotRegisteredSearching = 2,
    /// Registration denied.
    RegistrationDenied = 3,
    /// Registration state unknown.
    Unknown = 4,
    /// Registered, and on a 'roaming' network.
    RegisteredRoaming = 5,
}

impl RegistrationState {
    /// `true` for `RegisteredHome` and `RegisteredRoaming`.
    pub fn is_registered(&self) -> bool {
        matches!(
            self,
            RegistrationState::RegisteredHome | RegistrationState::RegisteredRoaming
        )
    }
}

/// One packet-data context, merged from `AT+CGDCONT?`, `AT+CGACT?` and
/// `AT+CGPADDR`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdpContext {
    pub cid: u32,
    /// `IP`, `IPV6`, `PPP`, ...
    pub pdp_type: String,
    pub apn: String,
    pub active: bool,
    pub address: Option<String>,
}

/// Operator and registration state, from `AT+COPS`/`AT+CREG`, plus the
/// configured packet-data contexts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Long alphanumeric operator name, when registered.
    pub operator: Option<String>,
    /// Mobile Country Code, from the numeric `COPS` read.
    pub mcc: Option<u16>,
    /// Mobile Network Code, likewise.
    pub mnc: Option<u16>,
    pub registration: RegistrationState,
    pub contexts: Vec<PdpContext>,
}

/// Signal quality (`AT+CSQ`), with the raw RSSI step mapped to dBm.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SignalQuality {
    /// −113 dBm (floor) .. −51 dBm (ceiling); `None` when the modem
    /// reports the value as unknown (99, usually).
    pub rssi_dbm: Option<i32>,
    /// Channel bit error rate, verbatim; on plenty of modems this is
    /// permanently 99.
    pub ber: Option<u32>,
}

/// The serving cell, plus whatever the geolocation service said about it.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationInfo {
    pub mcc: u16,
    pub mnc: u16,
    /// Location Area Code, decoded from the 4-digit hex in `+CREG`.
    pub lac: u32,
    /// Cell ID, decoded from hex likewise.
    pub cid: u32,
    /// The geolocation service's JSON response, verbatim; `None` when no
    /// API token was configured.
    pub location: Option<Value>,
}

fn rssi_to_dbm(raw: u32) -> Option<i32> {
    match raw {
        0 => Some(-113),
        1..=30 => Some(-113 + 2 * raw as i32),
        31 => Some(-51),
        _ => None,
    }
}

fn parse_plmn(oper: &str) -> Result<(u16, u16)> {
    if oper.len() < 5 || !oper.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::Protocol(format!(
            "numeric operator {:?} is not an MCC+MNC string",
            oper
        )));
    }
    let mcc = oper[..3]
        .parse()
        .map_err(|_| Error::Protocol("bad MCC".to_string()))?;
    let mnc = oper[3..]
        .parse()
        .map_err(|_| Error::Protocol("bad MNC".to_string()))?;
    Ok((mcc, mnc))
}

fn hex_field(fields: &[String], i: usize, what: &str) -> Result<u32> {
    fields
        .get(i)
        .and_then(|f| u32::from_str_radix(f, 16).ok())
        .ok_or_else(|| Error::Protocol(format!("missing or non-hex {} field", what)))
}

impl SmsTransceiver {
    /// Queries manufacturer, model, revision, serial and own number.
    pub async fn modem_info(&self) -> Result<ModemInfo> {
        let manufacturer = single_value(&self.transport.exec("AT+CGMI").await?)?;
        let model = single_value(&self.transport.exec("AT+CGMM").await?)?;
        let revision = single_value(&self.transport.exec("AT+CGMR").await?)?;
        let serial = single_value(&self.transport.exec("AT+CGSN").await?)?;
        let response = self.transport.exec("AT+CNUM").await?;
        ensure_ok(&response)?;
        let number = response
            .lines()
            .find_map(|l| parse::info_response("+CNUM", l))
            .and_then(|fields| fields.get(1).cloned())
            .filter(|n| !n.is_empty());
        Ok(ModemInfo {
            manufacturer,
            model,
            revision,
            serial,
            number,
        })
    }

    /// Reads the operator name by querying `COPS` in long-alphanumeric
    /// format. Returns `None` when the field is absent (not registered).
    async fn operator_field(&self, format: u8) -> Result<Option<String>> {
        ensure_ok(
            &self
                .transport
                .exec(&format!("AT+COPS=3,{}", format))
                .await?,
        )?;
        let response = self.transport.exec("AT+COPS?").await?;
        ensure_ok(&response)?;
        Ok(response
            .lines()
            .find_map(|l| parse::info_response("+COPS", l))
            .and_then(|fields| fields.get(2).cloned())
            .filter(|o| !o.is_empty()))
    }

    async fn registration_state(&self) -> Result<(RegistrationState, Vec<String>)> {
        let response = self.transport.exec("AT+CREG?").await?;
        ensure_ok(&response)?;
        let fields = response
            .lines()
            .find_map(|l| parse::info_response("+CREG", l))
            .ok_or_else(|| Error::Protocol("no +CREG line in response".to_string()))?;
        let state = RegistrationState::from_integer(int_field(&fields, 1, "CREG stat")?)?;
        Ok((state, fields))
    }

    /// Operator, registration state, PLMN codes and packet-data contexts.
    pub async fn network_info(&self) -> Result<NetworkInfo> {
        let operator = self.operator_field(0).await?;
        let plmn = match self.operator_field(2).await? {
            Some(numeric) => Some(parse_plmn(&numeric)?),
            None => None,
        };
        let (registration, _) = self.registration_state().await?;
        let contexts = self.pdp_contexts().await?;
        Ok(NetworkInfo {
            operator,
            mcc: plmn.map(|p| p.0),
            mnc: plmn.map(|p| p.1),
            registration,
            contexts,
        })
    }

    async fn pdp_contexts(&self) -> Result<Vec<PdpContext>> {
        let response = self.transport.exec("AT+CGDCONT?").await?;
        ensure_ok(&response)?;
        let mut contexts = vec![];
        for fields in parse::info_rows("+CGDCONT", &response) {
            contexts.push(PdpContext {
                cid: int_field(&fields, 0, "CGDCONT cid")?,
                pdp_type: fields.get(1).cloned().unwrap_or_default(),
                apn: fields.get(2).cloned().unwrap_or_default(),
                active: false,
                address: None,
            });
        }
        if contexts.is_empty() {
            return Ok(contexts);
        }
        let response = self.transport.exec("AT+CGACT?").await?;
        ensure_ok(&response)?;
        for fields in parse::info_rows("+CGACT", &response) {
            let cid = int_field(&fields, 0, "CGACT cid")?;
            let active = int_field(&fields, 1, "CGACT state")? == 1;
            if let Some(ctx) = contexts.iter_mut().find(|c| c.cid == cid) {
                ctx.active = active;
            }
        }
        let cids: Vec<String> = contexts.iter().map(|c| c.cid.to_string()).collect();
        let response = self
            .transport
            .exec(&format!("AT+CGPADDR={}", cids.join(",")))
            .await?;
        ensure_ok(&response)?;
        for fields in parse::info_rows("+CGPADDR", &response) {
            let cid = int_field(&fields, 0, "CGPADDR cid")?;
            let address = fields.get(1).cloned().filter(|a| !a.is_empty());
            if let Some(ctx) = contexts.iter_mut().find(|c| c.cid == cid) {
                ctx.address = address;
            }
        }
        Ok(contexts)
    }

    /// Signal quality (`AT+CSQ`), mapped to dBm.
    pub async fn signal_quality(&self) -> Result<SignalQuality> {
        let response = self.transport.exec("AT+CSQ").await?;
        ensure_ok(&response)?;
        let fields = response
            .lines()
            .find_map(|l| parse::info_response("+CSQ", l))
            .ok_or_else(|| Error::Protocol("no +CSQ line in response".to_string()))?;
        let rssi_dbm = fields
            .first()
            .and_then(|f| f.parse::<u32>().ok())
            .and_then(rssi_to_dbm);
        let ber = fields.get(1).and_then(|f| f.parse().ok());
        Ok(SignalQuality { rssi_dbm, ber })
    }

    /// Reads the serving cell (`AT+CREG=2` then `AT+CREG?`) and the
    /// numeric PLMN, then optionally asks the geolocation service where
    /// that cell is.
    pub async fn location_info(&self, options: &GeolocationOptions) -> Result<LocationInfo> {
        ensure_ok(&self.transport.exec("AT+CREG=2").await?)?;
        let (_, fields) = self.registration_state().await?;
        if fields.len() < 4 {
            return Err(Error::Protocol(
                "+CREG reported no location data (is AT+CREG=2 supported?)".to_string(),
            ));
        }
        let lac = hex_field(&fields, 2, "CREG lac")?;
        let cid = hex_field(&fields, 3, "CREG cid")?;
        let numeric = self.operator_field(2).await?.ok_or_else(|| {
            Error::Protocol("no numeric operator; not registered?".to_string())
        })?;
        let (mcc, mnc) = parse_plmn(&numeric)?;
        let location = match &options.token {
            Some(_) => Some(options.resolve(mcc, mnc, lac, cid).await?),
            None => None,
        };
        Ok(LocationInfo {
            mcc,
            mnc,
            lac,
            cid,
            location,
        })
    }
}
