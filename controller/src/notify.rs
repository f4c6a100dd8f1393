use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use tracing::info;

use fanwatch_common::TOPIC_ALERTS;

use crate::{services::NotificationAuthority, store::AlarmHandle};

#[derive(Debug, Serialize)]
struct AlertPayload<'a> {
    title: &'a str,
    subtitle: &'a str,
    body: &'a str,
    #[serde(rename = "issuedAt")]
    issued_at: DateTime<Utc>,
}

fn alert_payload(
    title: &str,
    subtitle: &str,
    body: &str,
    issued_at: DateTime<Utc>,
) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&AlertPayload {
        title,
        subtitle,
        body,
        issued_at,
    })
}

/// Delivers user-facing alerts over MQTT, gated on the alarm's notification switch.
#[derive(Clone)]
pub struct MqttNotifier {
    mqtt: AsyncClient,
    alarm: AlarmHandle,
}

impl MqttNotifier {
    pub fn new(mqtt: AsyncClient, alarm: AlarmHandle) -> Self {
        Self { mqtt, alarm }
    }
}

#[async_trait]
impl NotificationAuthority for MqttNotifier {
    async fn is_authorized(&self) -> bool {
        self.alarm.settings().notifications_enabled
    }

    async fn issue(&self, title: &str, subtitle: &str, body: &str) -> anyhow::Result<()> {
        let payload = alert_payload(title, subtitle, body, Utc::now())?;
        self.mqtt
            .publish(TOPIC_ALERTS, QoS::AtLeastOnce, false, payload)
            .await?;
        info!("alert issued: {title}: {subtitle}");
        Ok(())
    }
}
