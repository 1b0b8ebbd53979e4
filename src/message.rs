//! Wiz JSON-RPC messages, replies and device identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::errors::Error;

type Result<T> = std::result::Result<T, Error>;

/// Identifies a single device on the network.
///
/// Wiz bulbs identify themselves by MAC address, so a serial is the MAC as 12
/// lower case hex digits. Separators are stripped when one is created.
///
/// # Example
///
/// ```
/// use wiz_script_rs::Serial;
///
/// let serial = Serial::new("A8:BB:50:00:00:01");
/// assert_eq!(serial.as_str(), "a8bb50000001");
/// assert!("nope".parse::<Serial>().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Serial(String);

impl Serial {
    const LEN: usize = 12;

    /// Create a serial without validating it.
    pub fn new(raw: &str) -> Self {
        Serial(
            raw.trim()
                .chars()
                .filter(|c| !matches!(c, ':' | '-'))
                .flat_map(char::to_lowercase)
                .collect(),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_valid(&self) -> bool {
        self.0.len() == Self::LEN && self.0.chars().all(|c| c.is_ascii_hexdigit())
    }
}

impl FromStr for Serial {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let serial = Serial::new(s);
        if serial.is_valid() {
            Ok(serial)
        } else {
            Err(Error::InvalidSerial(s.to_string()))
        }
    }
}

impl From<&str> for Serial {
    fn from(raw: &str) -> Self {
        Serial::new(raw)
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The JSON-RPC methods understood by Wiz bulbs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum Method {
    GetPilot,
    SetPilot,
    SetState,
    Reboot,
    Reset,
    GetSystemConfig,
    GetUserConfig,
    GetModelConfig,
    GetPower,
    Registration,
}

/// A single request to send to a device.
///
/// A message without a `target` goes to whatever reference it is sent with. A
/// message with a `target` only ever goes to that device.
///
/// # Example
///
/// ```
/// use wiz_script_rs::{Message, Method, Serial};
///
/// let msg = Message::set_state(false).to(Serial::new("d073d5000001"));
/// assert_eq!(msg.method, Method::SetState);
/// assert_eq!(
///     String::from_utf8(msg.to_bytes().unwrap()).unwrap(),
///     r#"{"method":"setState","params":{"state":false}}"#
/// );
/// ```
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub method: Method,
    pub params: Option<Value>,
    #[serde(skip)]
    pub target: Option<Serial>,
}

impl Message {
    pub fn new(method: Method) -> Self {
        Message {
            method,
            params: None,
            target: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    /// Send this message only to `serial`.
    pub fn to(mut self, serial: Serial) -> Self {
        self.target = Some(serial);
        self
    }

    pub fn get_pilot() -> Self {
        Message::new(Method::GetPilot)
    }

    pub fn set_pilot(params: Value) -> Self {
        Message::new(Method::SetPilot).with_params(params)
    }

    pub fn set_state(on: bool) -> Self {
        Message::new(Method::SetState).with_params(json!({ "state": on }))
    }

    pub fn reboot() -> Self {
        Message::new(Method::Reboot)
    }

    pub fn get_system_config() -> Self {
        Message::new(Method::GetSystemConfig)
    }

    pub fn get_power() -> Self {
        Message::new(Method::GetPower)
    }

    /// The broadcast message bulbs answer with their MAC address.
    pub fn registration() -> Self {
        Message::new(Method::Registration).with_params(json!({
            "phoneMac": "AAAAAAAAAAAA",
            "register": false,
            "phoneIp": "1.2.3.4",
            "id": "1"
        }))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Error::json_dump)
    }
}

/// A reply from one device to one [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    pub serial: Serial,
    pub method: Method,
    pub result: Value,
}

impl Reply {
    pub fn new(serial: Serial, method: Method, result: Value) -> Self {
        Reply {
            serial,
            method,
            result,
        }
    }

    /// Build a reply from a raw JSON-RPC response.
    ///
    /// A response carrying an `error` member is a rejection.
    pub fn from_response(serial: Serial, method: Method, response: &Value) -> Result<Self> {
        if let Some(error) = response.get("error") {
            let reason = error
                .get("message")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| error.to_string());
            return Err(Error::rejected(&serial, method, &reason));
        }
        let result = response.get("result").cloned().unwrap_or(Value::Null);
        Ok(Reply::new(serial, method, result))
    }

    pub fn is(&self, method: Method) -> bool {
        self.method == method
    }

    /// The power state reported by a `getPilot` reply.
    pub fn emitting(&self) -> Option<bool> {
        self.result.get("state").and_then(Value::as_bool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_names() {
        assert_eq!(Method::GetPilot.to_string(), "getPilot");
        assert_eq!(Method::from_str("setState").unwrap(), Method::SetState);
        assert_eq!(
            serde_json::to_value(Method::GetSystemConfig).unwrap(),
            json!("getSystemConfig")
        );
    }

    #[test]
    fn test_serial_validation() {
        assert!("d073d5000001".parse::<Serial>().is_ok());
        assert!("D0-73-D5-00-00-01".parse::<Serial>().is_ok());
        assert_eq!(
            "d073d50000".parse::<Serial>().unwrap_err(),
            Error::InvalidSerial("d073d50000".to_string())
        );
    }

    #[test]
    fn test_message_serialization_skips_target() {
        let msg = Message::get_pilot().to(Serial::new("d073d5000001"));
        let value: Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(value, json!({"method": "getPilot"}));
    }

    #[test]
    fn test_reply_from_response() {
        let serial = Serial::new("d073d5000001");
        let reply = Reply::from_response(
            serial.clone(),
            Method::GetPilot,
            &json!({"method": "getPilot", "result": {"state": true, "dimming": 50}}),
        )
        .unwrap();
        assert_eq!(reply.emitting(), Some(true));
        assert!(reply.is(Method::GetPilot));

        let err = Reply::from_response(
            serial.clone(),
            Method::SetPilot,
            &json!({"error": {"code": -32600, "message": "Invalid Request"}}),
        )
        .unwrap_err();
        assert_eq!(
            err,
            Error::rejected(&serial, Method::SetPilot, "Invalid Request")
        );
    }
}
