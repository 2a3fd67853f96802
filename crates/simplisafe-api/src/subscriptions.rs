// Subscription discovery
//
// Each subscription is one monitored location with one base station. The
// device-level model hangs off these records and is not part of this crate.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, error};

use crate::client::ApiClient;
use crate::error::Error;

/// One active subscription on the account.
#[derive(Debug, Clone, Deserialize)]
pub struct Subscription {
    /// Subscription id; also the system id carried by stream events.
    pub sid: u64,
    pub location: Location,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub sid: Option<u64>,
    pub system: SystemInfo,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Base-station summary. `version` is 2 or 3.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemInfo {
    pub version: u8,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Deserialize)]
struct SubscriptionsResponse {
    #[serde(default)]
    subscriptions: Vec<Value>,
}

impl ApiClient {
    /// List active subscriptions.
    ///
    /// `GET /v1/users/{user_id}/subscriptions?activeOnly=true`
    ///
    /// Locations without system version data are skipped with an error
    /// log; they cannot be mapped to a system model.
    pub async fn subscriptions(&self) -> Result<Vec<Subscription>, Error> {
        let user_id = self.user_id().ok_or_else(|| Error::InvalidCredentials {
            message: "not authenticated: user id unknown".into(),
        })?;

        let path = format!("users/{user_id}/subscriptions");
        debug!(user_id, "listing subscriptions");
        let resp: SubscriptionsResponse = self
            .get_with_params(&path, &[("activeOnly", "true".to_owned())])
            .await?;

        Ok(resp
            .subscriptions
            .into_iter()
            .filter_map(parse_subscription)
            .collect())
    }
}

fn parse_subscription(raw: Value) -> Option<Subscription> {
    let location = &raw["location"];
    if location["system"].get("version").is_none() {
        error!(
            location = %location["sid"],
            "skipping location with missing system data"
        );
        return None;
    }

    match Subscription::deserialize(&raw) {
        Ok(subscription) => Some(subscription),
        Err(e) => {
            error!(subscription = %raw["sid"], error = %e, "skipping malformed subscription");
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn location_without_version_is_skipped() {
        let raw = json!({
            "sid": 12345,
            "location": {"sid": 67890, "system": {"serial": "1234ABCD"}}
        });
        assert!(parse_subscription(raw).is_none());
    }

    #[test]
    fn extra_fields_are_retained() {
        let raw = json!({
            "sid": 12345,
            "uid": 1,
            "location": {
                "sid": 67890,
                "street1": "1234 Main Street",
                "system": {"serial": "1234ABCD", "version": 3, "alarmState": "OFF"}
            }
        });
        let sub = parse_subscription(raw).unwrap();
        assert_eq!(sub.sid, 12345);
        assert_eq!(sub.location.sid, Some(67890));
        assert_eq!(sub.location.system.version, 3);
        assert_eq!(sub.location.system.serial.as_deref(), Some("1234ABCD"));
        assert_eq!(sub.location.system.extra["alarmState"], "OFF");
        assert_eq!(sub.location.extra["street1"], "1234 Main Street");
        assert_eq!(sub.extra["uid"], 1);
    }
}
