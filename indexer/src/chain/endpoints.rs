use alloy::transports::http::reqwest::Url;

const INVALID: &str = "<invalid endpoint>";

/// Ordered endpoint candidates for one logical call.
///
/// Endpoints matching the preferred pattern come first, in configuration order,
/// followed by the rest. Selection is a pure function of the indices already
/// tried, so no failover state survives between calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointRotation {
    order: Vec<usize>,
}

impl EndpointRotation {
    pub fn new<S: AsRef<str>>(endpoints: &[S], preferred_pattern: Option<&str>) -> Self {
        let mut order: Vec<usize> = (0..endpoints.len()).collect();
        if let Some(pattern) = preferred_pattern.filter(|p| !p.is_empty()) {
            // Stable sort keeps configuration order within each group.
            order.sort_by_key(|&i| !endpoints[i].as_ref().contains(pattern));
        }
        Self { order }
    }

    pub fn pick_next(&self, tried: &[usize]) -> Option<usize> {
        self.order.iter().copied().find(|i| !tried.contains(i))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Reduces an endpoint URL to `scheme://host[:port]`, dropping API keys in paths or userinfo.
pub fn sanitize_endpoint(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return INVALID.to_string();
    };
    let Some(host) = parsed.host_str() else {
        return INVALID.to_string();
    };
    match parsed.port() {
        Some(port) => format!("{}://{host}:{port}", parsed.scheme()),
        None => format!("{}://{host}", parsed.scheme()),
    }
}
