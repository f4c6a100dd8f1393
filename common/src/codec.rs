//! Text form of the fan's status reply: `<key>value<key2>value2...`.
//!
//! Firmware revisions differ on whether they emit closing tags, so `</key>` segments are accepted
//! and ignored. Integer sensors report `-99` when not fitted.

use std::{collections::HashMap, fmt::Write};

use thiserror::Error;

use crate::types::DeviceState;

pub const ABSENT_SENTINEL: i32 = -99;

const KEY_SPEED: &str = "fanspd";
const KEY_TIMER: &str = "timeremaining";
const KEY_DAMPER: &str = "doorinprocess";
const KEY_MAC: &str = "macaddr";
const KEY_IP: &str = "ipaddr";
const KEY_INTERLOCK1: &str = "interlock1";
const KEY_INTERLOCK2: &str = "interlock2";
const KEY_MODEL: &str = "model";
const KEY_SOFTWARE: &str = "softver";
const KEY_CFM: &str = "cfm";
const KEY_POWER: &str = "power";
const KEY_INSIDE: &str = "house_temp";
const KEY_ATTIC: &str = "attic_temp";
const KEY_OUTSIDE: &str = "oa_temp";
const KEY_SETPOINT: &str = "setpoint";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("status reply is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` has invalid value `{value}`")]
    InvalidValue { field: &'static str, value: String },
}

pub fn encode(state: &DeviceState) -> String {
    let mut out = String::new();
    let mut push = |key: &str, value: &dyn std::fmt::Display| {
        let _ = write!(out, "<{key}>{value}");
    };

    push(KEY_SPEED, &state.speed);
    push(KEY_TIMER, &state.timer_minutes);
    push(KEY_DAMPER, &u8::from(state.damper_operating));
    push(KEY_MAC, &state.mac_address);
    push(KEY_IP, &state.ip_address);
    push(KEY_INTERLOCK1, &u8::from(state.interlock1));
    push(KEY_INTERLOCK2, &u8::from(state.interlock2));
    if let Some(model) = &state.model {
        push(KEY_MODEL, model);
    }
    if let Some(software) = &state.software_version {
        push(KEY_SOFTWARE, software);
    }
    push(KEY_CFM, &state.cfm.unwrap_or(ABSENT_SENTINEL));
    push(KEY_POWER, &state.power_watts.unwrap_or(ABSENT_SENTINEL));
    push(KEY_INSIDE, &state.inside_temp.unwrap_or(ABSENT_SENTINEL));
    push(KEY_ATTIC, &state.attic_temp.unwrap_or(ABSENT_SENTINEL));
    push(KEY_OUTSIDE, &state.outside_temp.unwrap_or(ABSENT_SENTINEL));
    push(KEY_SETPOINT, &state.setpoint.unwrap_or(ABSENT_SENTINEL));

    out
}

pub fn decode(text: &str) -> Result<DeviceState, DecodeError> {
    let fields = split_fields(text);

    let mut state = DeviceState::new(
        required(&fields, KEY_MAC)?.to_string(),
        fields.get(KEY_IP).copied().unwrap_or_default().to_string(),
    );
    state.speed = parse_int(KEY_SPEED, required(&fields, KEY_SPEED)?)?;
    state.timer_minutes = parse_int(KEY_TIMER, required(&fields, KEY_TIMER)?)?;
    state.damper_operating = optional_flag(&fields, KEY_DAMPER)?;
    state.interlock1 = optional_flag(&fields, KEY_INTERLOCK1)?;
    state.interlock2 = optional_flag(&fields, KEY_INTERLOCK2)?;
    state.model = optional_text(&fields, KEY_MODEL);
    state.software_version = optional_text(&fields, KEY_SOFTWARE);
    state.cfm = optional_int(&fields, KEY_CFM)?;
    state.power_watts = optional_int(&fields, KEY_POWER)?;
    state.inside_temp = optional_int(&fields, KEY_INSIDE)?;
    state.attic_temp = optional_int(&fields, KEY_ATTIC)?;
    state.outside_temp = optional_int(&fields, KEY_OUTSIDE)?;
    state.setpoint = optional_int(&fields, KEY_SETPOINT)?;

    Ok(state)
}

fn split_fields(text: &str) -> HashMap<&str, &str> {
    text.split('<')
        .filter(|segment| !segment.is_empty() && !segment.starts_with('/'))
        .filter_map(|segment| segment.split_once('>'))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect()
}

fn required<'a>(
    fields: &HashMap<&str, &'a str>,
    key: &'static str,
) -> Result<&'a str, DecodeError> {
    fields
        .get(key)
        .copied()
        .filter(|value| !value.is_empty())
        .ok_or(DecodeError::MissingField(key))
}

fn parse_int(field: &'static str, value: &str) -> Result<i32, DecodeError> {
    value.parse::<i32>().map_err(|_| DecodeError::InvalidValue {
        field,
        value: value.to_string(),
    })
}

fn optional_int(
    fields: &HashMap<&str, &str>,
    key: &'static str,
) -> Result<Option<i32>, DecodeError> {
    match fields.get(key) {
        Some(value) if !value.is_empty() => {
            let parsed = parse_int(key, value)?;
            Ok((parsed != ABSENT_SENTINEL).then_some(parsed))
        }
        _ => Ok(None),
    }
}

fn optional_flag(fields: &HashMap<&str, &str>, key: &'static str) -> Result<bool, DecodeError> {
    Ok(optional_int(fields, key)?.is_some_and(|value| value != 0))
}

fn optional_text(fields: &HashMap<&str, &str>, key: &str) -> Option<String> {
    fields
        .get(key)
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
}
