//! OSI lower-layer addressing for one redundancy group
//!
//! AP titles are dotted object identifiers (`1.1.1.999`); commas are
//! accepted in place of dots. Selectors are byte strings written as
//! decimal or `0x` hex tokens separated by space, comma, dot or dash.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::error::{Result, Tase2Error};

const PSELECTOR_MAX: usize = 16;
const SSELECTOR_MAX: usize = 16;
const TSELECTOR_MAX: usize = 4;

/// Presentation/session/transport selector bytes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector(Vec<u8>);

impl Selector {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsiParameters {
    pub local_ap_title: Option<String>,
    pub local_ae_qualifier: Option<i32>,
    pub remote_ap_title: Option<String>,
    pub remote_ae_qualifier: Option<i32>,
    pub local_psel: Selector,
    pub local_ssel: Selector,
    pub local_tsel: Selector,
    pub remote_psel: Selector,
    pub remote_ssel: Selector,
    pub remote_tsel: Selector,
}

impl OsiParameters {
    /// Parse the `osi` object of a connection entry.
    pub fn from_json(osi: &Value) -> Result<Self> {
        let obj = osi
            .as_object()
            .ok_or_else(|| Tase2Error::osi("'OSI' section is not valid"))?;

        let ae_qualifier = |key: &str| -> Result<Option<i32>> {
            match obj.get(key) {
                None => Ok(None),
                Some(v) => v
                    .as_i64()
                    .and_then(|q| i32::try_from(q).ok())
                    .map(Some)
                    .ok_or_else(|| Tase2Error::osi(format!("bad format for '{}'", key))),
            }
        };

        let ap_title = |key: &str| -> Result<Option<String>> {
            match obj.get(key) {
                None => Ok(None),
                Some(v) => {
                    let raw = v
                        .as_str()
                        .ok_or_else(|| Tase2Error::osi(format!("bad format for '{}'", key)))?;
                    parse_ap_title(raw)
                        .map(Some)
                        .map_err(|_| Tase2Error::osi(format!("'{}' is not valid", key)))
                },
            }
        };

        let selector = |key: &str, max: usize| -> Result<Selector> {
            match obj.get(key) {
                None => Ok(Selector::default()),
                Some(v) => {
                    let raw = v
                        .as_str()
                        .ok_or_else(|| Tase2Error::osi(format!("bad format for '{}'", key)))?;
                    parse_selector(raw, max)
                },
            }
        };

        Ok(Self {
            local_ae_qualifier: ae_qualifier("local_ae_qualifier")?,
            remote_ae_qualifier: ae_qualifier("remote_ae_qualifier")?,
            local_ap_title: ap_title("local_ap_title")?,
            remote_ap_title: ap_title("remote_ap_title")?,
            local_psel: selector("local_psel", PSELECTOR_MAX)?,
            local_ssel: selector("local_ssel", SSELECTOR_MAX)?,
            local_tsel: selector("local_tsel", TSELECTOR_MAX)?,
            remote_psel: selector("remote_psel", PSELECTOR_MAX)?,
            remote_ssel: selector("remote_ssel", SSELECTOR_MAX)?,
            remote_tsel: selector("remote_tsel", TSELECTOR_MAX)?,
        })
    }
}

fn ap_title_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    if let Some(re) = PATTERN.get() {
        return Ok(re);
    }
    let re = Regex::new(r"^[0-9.]*$").map_err(|e| Tase2Error::osi(e.to_string()))?;
    Ok(PATTERN.get_or_init(|| re))
}

/// Normalize an AP title to dotted form, rejecting anything but digits.
pub fn parse_ap_title(raw: &str) -> Result<String> {
    let title = raw.replace(',', ".");
    if ap_title_pattern()?.is_match(&title) {
        Ok(title)
    } else {
        Err(Tase2Error::osi(format!("AP title '{}' contains invalid characters", raw)))
    }
}

/// Parse a selector into at most `max` bytes.
pub fn parse_selector(raw: &str, max: usize) -> Result<Selector> {
    let mut bytes = Vec::new();

    for token in raw.split([' ', ',', '.', '-']).filter(|t| !t.is_empty()) {
        if bytes.len() >= max {
            return Err(Tase2Error::osi(
                "bad format for 'OSI Selector' (too many bytes)",
            ));
        }

        let parsed = match token.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => token.parse::<u64>(),
        };
        let value = parsed
            .map_err(|_| Tase2Error::osi("bad format for 'OSI Selector' (not a byte)"))?;
        let byte = u8::try_from(value)
            .map_err(|_| Tase2Error::osi("bad format for 'OSI Selector' (exceed a byte)"))?;
        bytes.push(byte);
    }

    Ok(Selector(bytes))
}
