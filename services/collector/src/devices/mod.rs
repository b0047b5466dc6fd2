//! Device integrations
//!
//! Each device exposes pure parsing functions (raw payload to typed record)
//! and a thin client that fetches the payload through a homewatt-link
//! connection.

pub mod fronius;
pub mod hafnertec;
pub mod senec;
pub mod solvis;
pub mod weather;

use errors::{protocol_error, HomewattError, HomewattResult};
use reqwest::Response;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Split of grid and battery flows into non-negative directions
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergySources {
    pub feed_in: f64,
    pub grid_import: f64,
    pub charging: f64,
    pub discharging: f64,
}

impl EnergySources {
    /// `grid` is positive when importing; `battery_charge` is positive when charging
    pub fn split(grid: f64, battery_charge: f64) -> Self {
        let (feed_in, grid_import) = if grid < 0.0 { (-grid, 0.0) } else { (0.0, grid) };
        let (charging, discharging) = if battery_charge < 0.0 {
            (0.0, -battery_charge)
        } else {
            (battery_charge, 0.0)
        };
        Self {
            feed_in,
            grid_import,
            charging,
            discharging,
        }
    }
}

fn require_ok(response: &Response) -> HomewattResult<()> {
    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(HomewattError::UnexpectedStatus {
            endpoint: response.url().to_string(),
            status: status.as_u16(),
        });
    }
    Ok(())
}

/// Require a 200 response and decode its body as JSON
pub(crate) async fn read_json(device: &str, response: Response) -> HomewattResult<Value> {
    require_ok(&response)?;
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| protocol_error!(device, "invalid JSON: {}", e))
}

/// Require a 200 response and return its body as text
pub(crate) async fn read_text(response: Response) -> HomewattResult<String> {
    require_ok(&response)?;
    Ok(response.text().await?)
}

/// Numeric field of a JSON object, 0 when absent or not a number
pub(crate) fn number(object: &Value, key: &str) -> f64 {
    object.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_import_and_charge() {
        let sources = EnergySources::split(350.0, 1200.0);
        assert_eq!(sources.grid_import, 350.0);
        assert_eq!(sources.feed_in, 0.0);
        assert_eq!(sources.charging, 1200.0);
        assert_eq!(sources.discharging, 0.0);
    }

    #[test]
    fn test_split_feed_in_and_discharge() {
        let sources = EnergySources::split(-2100.5, -400.0);
        assert_eq!(sources.feed_in, 2100.5);
        assert_eq!(sources.grid_import, 0.0);
        assert_eq!(sources.charging, 0.0);
        assert_eq!(sources.discharging, 400.0);
    }

    #[test]
    fn test_number_defaults_to_zero() {
        let object = json!({"P_PV": 1534.2, "P_Akku": null, "Mode": "bidirectional"});
        assert_eq!(number(&object, "P_PV"), 1534.2);
        assert_eq!(number(&object, "P_Akku"), 0.0);
        assert_eq!(number(&object, "Mode"), 0.0);
        assert_eq!(number(&object, "P_Grid"), 0.0);
    }
}
