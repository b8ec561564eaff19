use std::time::{Duration, Instant};

use serde::Serialize;
use url::Url;

use crate::commands::Dispatcher;

const SLOW_AFTER: Duration = Duration::from_millis(1500);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerHealth {
    /// Responded in under 1.5 s.
    Healthy,
    /// Responded in 1.5 to 5 s.
    Slow,
    /// Timed out, refused, or the URL has no HTTP equivalent.
    Unreachable,
}

/// `<server_url>/healthz` over plain HTTP(S): `ws` maps to `http`, `wss` to
/// `https`.
pub fn health_url(server_url: &Url) -> Option<Url> {
    let mut url = server_url.clone();
    let scheme = match url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        _ => return None,
    };
    url.set_scheme(scheme).ok()?;
    url.set_query(None);
    url.path_segments_mut().ok()?.pop_if_empty().push("healthz");
    Some(url)
}

/// Pings the cluster-watch service and classifies its response time.
pub async fn probe(server_url: &Url) -> ServerHealth {
    let Some(url) = health_url(server_url) else {
        log::warn!("health: no http equivalent for {server_url}");
        return ServerHealth::Unreachable;
    };

    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(c) => c,
        Err(_) => return ServerHealth::Unreachable,
    };

    let started = Instant::now();
    match client.get(url.clone()).send().await {
        Ok(_) => {
            if started.elapsed() > SLOW_AFTER {
                ServerHealth::Slow
            } else {
                ServerHealth::Healthy
            }
        }
        Err(e) => {
            log::info!("health: {url} unreachable: {e}");
            ServerHealth::Unreachable
        }
    }
}

impl Dispatcher {
    pub async fn check_health(&self) -> ServerHealth {
        probe(&self.config().server_url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_urls_map_to_http() {
        let ws = Url::parse("ws://127.0.0.1:8080/api/v1/").unwrap();
        assert_eq!(
            health_url(&ws).unwrap().as_str(),
            "http://127.0.0.1:8080/api/v1/healthz"
        );

        let wss = Url::parse("wss://watch.example.com").unwrap();
        assert_eq!(
            health_url(&wss).unwrap().as_str(),
            "https://watch.example.com/healthz"
        );

        assert!(health_url(&Url::parse("unix:/tmp/watch.sock").unwrap()).is_none());
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        let url = Url::parse("ws://127.0.0.1:1/").unwrap();
        assert_eq!(probe(&url).await, ServerHealth::Unreachable);
    }
}
