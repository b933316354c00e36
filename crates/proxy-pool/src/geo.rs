//! Best-effort IP geolocation for proxies without a configured country

use std::time::Duration;

use account_store::BoxFuture;
use serde::Deserialize;
use tracing::warn;

const DEFAULT_GEO_URL: &str = "http://ip-api.com";
const GEO_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolves an IP address to an ISO country code. Failures yield `None`.
pub trait GeoLookup: Send + Sync {
    fn country_of<'a>(&'a self, ip: &'a str) -> BoxFuture<'a, Option<String>>;
}

/// Lookup against the ip-api.com JSON endpoint.
pub struct IpApiLookup {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeoResponse {
    country_code: Option<String>,
}

impl IpApiLookup {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_base_url(client, DEFAULT_GEO_URL)
    }

    pub fn with_base_url(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn lookup(&self, ip: &str) -> Option<String> {
        let url = format!("{}/json/{ip}?fields=countryCode", self.base_url);
        let resp = match self.client.get(&url).timeout(GEO_TIMEOUT).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                warn!(ip, status = %resp.status(), "geo lookup rejected");
                return None;
            }
            Err(e) => {
                warn!(ip, error = %e, "geo lookup failed");
                return None;
            }
        };
        match resp.json::<GeoResponse>().await {
            Ok(body) => body
                .country_code
                .filter(|c| !c.is_empty())
                .map(|c| c.to_ascii_uppercase()),
            Err(e) => {
                warn!(ip, error = %e, "geo lookup returned unreadable body");
                None
            }
        }
    }
}

impl GeoLookup for IpApiLookup {
    fn country_of<'a>(&'a self, ip: &'a str) -> BoxFuture<'a, Option<String>> {
        Box::pin(self.lookup(ip))
    }
}
