use crate::key::KeyParams;

/// Convert an http(s) base URL to its ws(s) form.
pub fn to_websocket_base(base_url: &str) -> String {
    let base_url = base_url.trim_end_matches('/');
    if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if base_url.starts_with("ws://") || base_url.starts_with("wss://") {
        base_url.to_string()
    } else {
        format!("ws://{}", base_url)
    }
}

/// Streaming endpoint URL for a session request.
pub fn process_telemetry_url(base_url: &str, params: &KeyParams) -> String {
    let mut url = format!(
        "{}/f1/process-telemetry/{}/{}",
        to_websocket_base(base_url),
        params.season,
        params.round
    );

    let mut query = Vec::new();
    if let Some(drivers) = params.drivers.as_ref().filter(|d| !d.is_empty()) {
        query.push(format!("drivers={}", drivers.join(",")));
    }
    if let Some(frame_skip) = params.frame_skip {
        query.push(format!("frame_skip={}", frame_skip));
    }
    if !query.is_empty() {
        url.push('?');
        url.push_str(&query.join("&"));
    }
    url
}
