//! Snapshot document: the full device list as a JSON array.

use fleet_core::Device;

use crate::error::ProtocolError;

/// Encodes the full device list as a pretty-printed JSON array.
pub fn encode_snapshot(devices: &[Device]) -> Result<String, ProtocolError> {
    serde_json::to_string_pretty(devices).map_err(|e| ProtocolError::encode("snapshot", e))
}

/// Decodes a snapshot document.
///
/// Blank documents decode to an empty fleet. Every record is validated; one
/// bad record rejects the whole document so a corrupt file is never half-loaded.
pub fn decode_snapshot(document: &str) -> Result<Vec<Device>, ProtocolError> {
    if document.trim().is_empty() {
        return Ok(Vec::new());
    }

    let devices: Vec<Device> =
        serde_json::from_str(document).map_err(|e| ProtocolError::malformed("snapshot", e))?;

    devices
        .into_iter()
        .map(|d| {
            d.validated().map_err(|e| ProtocolError::InvalidDevice {
                what: "snapshot",
                reason: e.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_camel_case_document() {
        let document = r#"[
    {
        "deviceName": "Router",
        "IPHost": "192.168.1.1",
        "port": 9000,
        "commands": ["STATUS", "UPTIME"]
    },
    {
        "deviceName": "Switch",
        "IPHost": "192.168.1.2",
        "port": 9001,
        "commands": []
    }
]"#;
        let devices = decode_snapshot(document).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].name.as_str(), "Router");
        assert_eq!(devices[1].port, 9001);
    }

    #[test]
    fn test_blank_document_is_empty_fleet() {
        assert!(decode_snapshot("").unwrap().is_empty());
        assert!(decode_snapshot("  \n").unwrap().is_empty());
        assert!(decode_snapshot("[]").unwrap().is_empty());
    }

    #[test]
    fn test_encode_is_json_array() {
        let devices = vec![Device::new("D1", "127.0.0.1", 9000, ["STATUS"])];
        let document = encode_snapshot(&devices).unwrap();
        let value: serde_json::Value = serde_json::from_str(&document).unwrap();
        assert!(value.is_array());
        assert_eq!(value[0]["deviceName"], "D1");
    }

    #[test]
    fn test_corrupt_document_rejected() {
        assert!(decode_snapshot("{\"deviceName\": \"D1\"}").is_err());
        assert!(decode_snapshot(r#"[{"deviceName": "", "IPHost": "h", "port": 1}]"#).is_err());
    }
}
