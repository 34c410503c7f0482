use reqwest::StatusCode;

use crate::error::{ExecutionError, Result};

pub const MAVEN_SCHEME: &str = "mvn";

/// Redirect hops followed before a probe gives up.
const MAX_REDIRECTS: usize = 10;

const PROBE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// A dependency location: a Maven coordinate URI or a direct artifact URL.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DependencyUri {
    Maven(String),
    Url(String),
}

impl DependencyUri {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Maven(s) | Self::Url(s) => s,
        }
    }

    pub fn scheme(&self) -> &str {
        match self {
            Self::Maven(_) => MAVEN_SCHEME,
            Self::Url(s) => s.split(':').next().unwrap_or(""),
        }
    }
}

impl std::fmt::Display for DependencyUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the probe client: no automatic redirect following, so terminal
/// URIs are observed by [`normalize`] itself.
pub(crate) fn probe_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(PROBE_TIMEOUT)
        .build()
        .expect("failed to create the dependency probe client")
}

/// Normalize one raw dependency string.
///
/// Maven URIs and anything already pointing at a `.jar` pass through.
/// Other http(s) URLs are probed (GET, body dropped) and 301/302/303/307
/// responses are followed manually so the terminal URI is recorded. URLs
/// with other schemes are logged and left unchanged.
pub async fn normalize(http: &reqwest::Client, raw: &str) -> Result<DependencyUri> {
    let scheme =
        scheme_of(raw).ok_or_else(|| ExecutionError::BadDependencyUrl(raw.to_string()))?;

    if scheme.eq_ignore_ascii_case(MAVEN_SCHEME) {
        return Ok(DependencyUri::Maven(raw.to_string()));
    }
    if raw.ends_with(".jar") {
        return Ok(DependencyUri::Url(raw.to_string()));
    }
    if !scheme.eq_ignore_ascii_case("http") && !scheme.eq_ignore_ascii_case("https") {
        tracing::warn!(uri = raw, "unsupported dependency URL scheme, leaving as-is");
        return Ok(DependencyUri::Url(raw.to_string()));
    }

    let mut url = raw.to_string();
    for _ in 0..MAX_REDIRECTS {
        let response = http.get(&url).send().await?;
        if !is_redirect(response.status()) {
            return Ok(DependencyUri::Url(url));
        }
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok());
        match location {
            Some(location) => {
                tracing::info!(from = %url, to = location, "following a dependency redirect");
                url = location.to_string();
            }
            None => return Ok(DependencyUri::Url(url)),
        }
    }
    Err(ExecutionError::DependencyResolution(format!(
        "too many redirects for {raw}"
    )))
}

fn scheme_of(raw: &str) -> Option<&str> {
    let (scheme, rest) = raw.split_once(':')?;
    if scheme.is_empty() || rest.is_empty() {
        return None;
    }
    if !scheme.chars().next()?.is_ascii_alphabetic() {
        return None;
    }
    if !scheme
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    {
        return None;
    }
    Some(scheme)
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307)
}
