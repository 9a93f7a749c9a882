//! Where the site list comes from: the config file or a remote JSON endpoint

use crate::domain::types::Site;
use crate::infra::config::SiteEntry;
use crate::io::notifier::{basic_auth_header, parse_url_with_auth};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SiteSourceError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(u16),
}

#[async_trait]
pub trait SiteSource: Send + Sync {
    /// Fetch the full current site list
    async fn fetch(&self) -> Result<Vec<Site>, SiteSourceError>;

    fn name(&self) -> &'static str;
}

/// Fixed list, usually from `[[sites]]` in the config file
pub struct StaticSites {
    sites: Vec<Site>,
}

impl StaticSites {
    pub fn new(sites: Vec<Site>) -> Self {
        Self { sites }
    }
}

#[async_trait]
impl SiteSource for StaticSites {
    async fn fetch(&self) -> Result<Vec<Site>, SiteSourceError> {
        Ok(self.sites.clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// JSON array of site entries served over HTTP
pub struct HttpSites {
    client: reqwest::Client,
    url: String,
    auth_header: Option<String>,
}

impl HttpSites {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let (url, username, password) = parse_url_with_auth(url);
        let auth_header = match (username, password) {
            (Some(u), Some(p)) => Some(basic_auth_header(&u, &p)),
            _ => None,
        };
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url, auth_header })
    }
}

#[async_trait]
impl SiteSource for HttpSites {
    async fn fetch(&self) -> Result<Vec<Site>, SiteSourceError> {
        let mut request = self.client.get(&self.url).header("Accept", "application/json");
        if let Some(auth) = &self.auth_header {
            request = request.header("Authorization", auth);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SiteSourceError::Status(status.as_u16()));
        }

        let entries: Vec<SiteEntry> = response.json().await?;
        debug!(url = %self.url, sites = %entries.len(), "site_list_fetched");
        Ok(entries.into_iter().map(Site::from).collect())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{GeoPoint, SiteId};

    #[tokio::test]
    async fn test_static_sites() {
        let site = Site {
            id: SiteId(1),
            label: "Plant".to_string(),
            center: GeoPoint::new(25.650648, -100.373529),
            radius_m: 15.0,
            enabled: true,
            group: String::new(),
        };
        let source = StaticSites::new(vec![site.clone()]);
        assert_eq!(source.fetch().await.unwrap(), vec![site]);
        assert_eq!(source.name(), "static");
    }

    #[test]
    fn test_site_entry_json() {
        let entries: Vec<SiteEntry> = serde_json::from_str(
            r#"[{"id":5,"label":"Dock","lat":25.6,"lng":-100.3,"radius_m":30.0,"group":"south"}]"#,
        )
        .unwrap();
        let site = Site::from(entries[0].clone());
        assert_eq!(site.id, SiteId(5));
        assert!(site.enabled);
        assert_eq!(site.group, "south");
    }
}
