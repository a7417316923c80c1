//! Cell-tower geolocation: asks a regional HTTPS endpoint where the
//! serving cell is and passes the answer through verbatim.
use crate::errors::Result;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// The four regional API endpoints.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Region {
    #[default]
    UsEast,
    UsWest,
    Europe,
    AsiaPacific,
}

impl Region {
    fn host(&self) -> &'static str {
        match self {
            Region::UsEast => "us1.unwiredlabs.com",
            Region::UsWest => "us2.unwiredlabs.com",
            Region::Europe => "eu1.unwiredlabs.com",
            Region::AsiaPacific => "ap1.unwiredlabs.com",
        }
    }
}

/// How (and whether) to resolve cell coordinates into a location. With no
/// token, `location_info` still reports the cell but skips the HTTP call.
#[derive(Debug, Clone, Default)]
pub struct GeolocationOptions {
    /// API token. `None` disables resolution.
    pub token: Option<String>,
    pub region: Region,
    /// Forwarded as the JSON `accept-language` member.
    pub accept_language: Option<String>,
}

#[derive(Serialize)]
struct CellTower {
    lac: u32,
    cid: u32,
}

#[derive(Serialize)]
struct GeolocationRequest<'a> {
    token: &'a str,
    radio: &'static str,
    mcc: u16,
    mnc: u16,
    cells: Vec<CellTower>,
    address: u8,
    #[serde(rename = "accept-language", skip_serializing_if = "Option::is_none")]
    accept_language: Option<&'a str>,
}

impl GeolocationOptions {
    /// POSTs the serving cell to the regional endpoint. The response JSON
    /// is returned verbatim; interpreting it is the caller's business.
    pub(crate) async fn resolve(&self, mcc: u16, mnc: u16, lac: u32, cid: u32) -> Result<Value> {
        let body = GeolocationRequest {
            token: self.token.as_deref().unwrap_or_default(),
            radio: "gsm",
            mcc,
            mnc,
            cells: vec![CellTower { lac, cid }],
            address: 1,
            accept_language: self.accept_language.as_deref(),
        };
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let response = client
            .post(format!("https://{}/v2/process", self.region.host()))
            .json(&body)
            .send()
            .await?;
        Ok(response.json().await?)
    }
}
