pub const TOPIC_DEVICE_STATE_PREFIX: &str = "fanwatch/device";
pub const TOPIC_MONITOR_NEXT_CHECK: &str = "fanwatch/monitor/next_check";
pub const TOPIC_MONITOR_FLAGS: &str = "fanwatch/monitor/flags";
pub const TOPIC_ALERTS: &str = "fanwatch/alerts";

pub fn device_state_topic(mac_address: &str) -> String {
    let id: String = mac_address
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    format!("{TOPIC_DEVICE_STATE_PREFIX}/{id}/state")
}
