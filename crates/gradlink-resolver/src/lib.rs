//! Profile resolver contract + the HTML search implementation.
//!
//! The engine only depends on [`ProfileResolver`]; everything else here is
//! one concrete way to satisfy it. Resolvers fail soft from the scheduler's
//! point of view: any error or timeout is converted to an unmatched outcome
//! at the call site.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const CRATE_NAME: &str = "gradlink-resolver";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("search request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("search returned http status {status}")]
    HttpStatus { status: u16 },
}

/// External lookup collaborator: at most one normalized profile URL per
/// query.
#[async_trait]
pub trait ProfileResolver: Send + Sync {
    async fn resolve(&self, name: &str, affiliation: &str)
        -> Result<Option<String>, ResolveError>;
}

#[derive(Debug, Clone)]
pub struct SearchResolverConfig {
    pub endpoint: String,
    pub profile_host: String,
    pub query_prefix: String,
    pub user_agent: String,
    pub timeout: Duration,
}

impl Default for SearchResolverConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://html.duckduckgo.com/html/".to_string(),
            profile_host: "linkedin.com/in/".to_string(),
            query_prefix: "linkedin".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                .to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl SearchResolverConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            endpoint: std::env::var("GRADLINK_SEARCH_ENDPOINT").unwrap_or(defaults.endpoint),
            profile_host: std::env::var("GRADLINK_PROFILE_HOST").unwrap_or(defaults.profile_host),
            query_prefix: std::env::var("GRADLINK_QUERY_PREFIX").unwrap_or(defaults.query_prefix),
            user_agent: std::env::var("GRADLINK_USER_AGENT").unwrap_or(defaults.user_agent),
            timeout: std::env::var("GRADLINK_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
        }
    }
}

/// Queries an HTML search endpoint and extracts the first profile link from
/// the result page.
#[derive(Debug)]
pub struct SearchResolver {
    client: reqwest::Client,
    endpoint: Url,
    profile_host: String,
    query_prefix: String,
}

impl SearchResolver {
    pub fn new(config: SearchResolverConfig) -> anyhow::Result<Self> {
        let endpoint = Url::parse(&config.endpoint)
            .with_context(|| format!("parsing search endpoint {}", config.endpoint))?;
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building search client")?;
        Ok(Self {
            client,
            endpoint,
            profile_host: config.profile_host,
            query_prefix: config.query_prefix,
        })
    }
}

#[async_trait]
impl ProfileResolver for SearchResolver {
    async fn resolve(
        &self,
        name: &str,
        affiliation: &str,
    ) -> Result<Option<String>, ResolveError> {
        let query = format!("{} {} {}", self.query_prefix, name, affiliation);
        let response = self
            .client
            .get(self.endpoint.clone())
            .query(&[("q", query.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ResolveError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        let url = extract_profile_url(&body, &self.endpoint, &self.profile_host);
        debug!(name, matched = url.is_some(), "search resolved");
        Ok(url)
    }
}

/// First anchor in the page whose cleaned target (query and fragment
/// stripped) contains the profile host marker. Search engines wrap result
/// links in `uddg=`-style redirects, so those are unwrapped first.
pub fn extract_profile_url(html: &str, base: &Url, profile_host: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let anchors = Selector::parse("a[href]").expect("static selector");

    for element in document.select(&anchors) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let Some(target) = resolve_link(base, href) else {
            continue;
        };
        let clean = target.split(['?', '#']).next().unwrap_or_default();
        if clean.contains(profile_host) {
            return Some(clean.to_string());
        }
    }
    None
}

fn resolve_link(base: &Url, href: &str) -> Option<String> {
    let url = base.join(href).ok()?;
    for (key, value) in url.query_pairs() {
        if key == "uddg" {
            let target = value.into_owned();
            return target.starts_with("http").then_some(target);
        }
    }
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

/// Canned name -> URL resolver for tests and offline dry runs.
#[derive(Debug, Default)]
pub struct ScriptedResolver {
    profiles: HashMap<String, String>,
    calls: AtomicUsize,
}

impl ScriptedResolver {
    pub fn new(profiles: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            profiles: profiles.into_iter().collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProfileResolver for ScriptedResolver {
    async fn resolve(
        &self,
        name: &str,
        _affiliation: &str,
    ) -> Result<Option<String>, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.profiles.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://html.duckduckgo.com/html/").unwrap()
    }

    const HOST: &str = "linkedin.com/in/";

    #[test]
    fn unwraps_redirect_links_and_strips_tracking() {
        let html = r#"
            <html><body>
            <a href="/settings">settings</a>
            <a href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fwww.linkedin.com%2Fin%2Fana-silva%3Ftrk%3Dpublic&rut=abc">Ana Silva</a>
            </body></html>
        "#;
        assert_eq!(
            extract_profile_url(html, &base(), HOST),
            Some("https://www.linkedin.com/in/ana-silva".to_string())
        );
    }

    #[test]
    fn takes_first_direct_profile_link() {
        let html = r#"
            <a href="https://example.com/about">about</a>
            <a href="https://www.linkedin.com/in/bruno?x=1#top">Bruno</a>
            <a href="https://www.linkedin.com/in/carla">Carla</a>
        "#;
        assert_eq!(
            extract_profile_url(html, &base(), HOST),
            Some("https://www.linkedin.com/in/bruno".to_string())
        );
    }

    #[test]
    fn ignores_non_profile_and_non_http_targets() {
        let html = r#"
            <a href="javascript:void(0)">noop</a>
            <a href="/l/?uddg=javascript%3Aalert(1)">bad redirect</a>
            <a href="https://www.linkedin.com/company/acme">company page</a>
        "#;
        assert_eq!(extract_profile_url(html, &base(), HOST), None);
    }

    #[test]
    fn empty_page_yields_none() {
        assert_eq!(extract_profile_url("", &base(), HOST), None);
    }

    #[tokio::test]
    async fn scripted_resolver_answers_by_name_and_counts_calls() {
        let resolver = ScriptedResolver::new([(
            "Ana".to_string(),
            "https://www.linkedin.com/in/ana".to_string(),
        )]);
        assert_eq!(
            resolver.resolve("Ana", "State University").await.unwrap(),
            Some("https://www.linkedin.com/in/ana".to_string())
        );
        assert_eq!(resolver.resolve("Bruno", "Elsewhere").await.unwrap(), None);
        assert_eq!(resolver.calls(), 2);
    }
}
