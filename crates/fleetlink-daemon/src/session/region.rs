//! One token manager per geographic region.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fleetlink_core::Config;

use super::authenticator::{Authenticator, HttpAuthenticator};
use super::error::AuthError;
use super::token::{TokenManager, TokenSource, TokenTiming};

/// Region name used when no regions are configured.
pub const DEFAULT_REGION: &str = "default";

/// Region code embedded in a relay hostname: the last `-` segment of the
/// first DNS label (`relay-103-eu.example.cloud` gives `eu`).
pub fn region_code(host: &str) -> Option<&str> {
    let label = host.split('.').next()?;
    let (_, code) = label.rsplit_once('-')?;
    (!code.is_empty()).then_some(code)
}

/// Independent token managers keyed by region, with host-to-region routing.
pub struct RegionalAuthenticator {
    managers: BTreeMap<String, Arc<TokenManager>>,
    default_region: String,
}

impl RegionalAuthenticator {
    /// `default_region` must be one of the keys of `managers`.
    pub fn new(
        managers: BTreeMap<String, Arc<TokenManager>>,
        default_region: impl Into<String>,
    ) -> Result<Self, AuthError> {
        let default_region = default_region.into();
        if !managers.contains_key(&default_region) {
            return Err(AuthError::UnknownRegion {
                host: default_region,
            });
        }
        Ok(Self {
            managers,
            default_region,
        })
    }

    /// Build HTTP-backed managers for every configured region. Without any
    /// regions a single [`DEFAULT_REGION`] uses the integrator API base.
    pub fn from_config(config: &Config) -> Result<Self, AuthError> {
        let timing = TokenTiming::from(&config.session);
        let integrator = &config.integrator;
        let mut managers = BTreeMap::new();

        let make = |api_base: &str| -> Result<Arc<TokenManager>, AuthError> {
            let auth: Arc<dyn Authenticator> = Arc::new(HttpAuthenticator::new(
                api_base,
                integrator.tag.clone(),
                integrator.secret.clone(),
            )?);
            Ok(Arc::new(TokenManager::new(auth, timing)))
        };

        if config.regions.is_empty() {
            managers.insert(DEFAULT_REGION.to_string(), make(&integrator.api_base)?);
            return Self::new(managers, DEFAULT_REGION);
        }
        for region in &config.regions {
            managers.insert(region.name.clone(), make(&region.api_base)?);
        }
        let default_region = config
            .default_region
            .clone()
            .or_else(|| config.regions.first().map(|r| r.name.clone()))
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        Self::new(managers, default_region)
    }

    pub fn default_region(&self) -> &str {
        &self.default_region
    }

    /// Configured region names, sorted.
    pub fn regions(&self) -> Vec<String> {
        self.managers.keys().cloned().collect()
    }

    pub fn manager(&self, region: &str) -> Option<&Arc<TokenManager>> {
        self.managers.get(region)
    }

    /// Region serving `host`, falling back to the default region.
    pub fn region_for_host<'a>(&'a self, host: &'a str) -> &'a str {
        region_code(host)
            .filter(|code| self.managers.contains_key(*code))
            .unwrap_or(self.default_region.as_str())
    }

    pub fn manager_for_host(&self, host: &str) -> Result<&Arc<TokenManager>, AuthError> {
        self.managers
            .get(self.region_for_host(host))
            .ok_or_else(|| AuthError::UnknownRegion {
                host: host.to_string(),
            })
    }

    /// Refresh every region that needs it. Failures are collected per region.
    pub async fn ensure_all_valid(&self) -> HashMap<String, AuthError> {
        let mut errors = HashMap::new();
        for (region, manager) in &self.managers {
            if let Err(e) = manager.ensure_valid().await {
                warn!(region = %region, error = %e, "Region token refresh failed");
                errors.insert(region.clone(), e);
            }
        }
        errors
    }

    /// Authenticate every region unconditionally.
    pub async fn authenticate_all(&self) -> HashMap<String, AuthError> {
        let mut errors = HashMap::new();
        for (region, manager) in &self.managers {
            if let Err(e) = manager.authenticate().await {
                errors.insert(region.clone(), e);
            }
        }
        errors
    }

    /// Returns how many regions started a new refresh loop.
    pub fn start_auto_refresh_all(&self, ctx: &CancellationToken) -> usize {
        let started = self
            .managers
            .values()
            .filter(|m| m.start_auto_refresh(ctx))
            .count();
        info!(started, "Regional auto refresh started");
        started
    }

    pub fn stop_auto_refresh_all(&self) -> usize {
        self.managers
            .values()
            .filter(|m| m.stop_auto_refresh())
            .count()
    }
}

#[async_trait]
impl TokenSource for RegionalAuthenticator {
    async fn token_for_host(&self, host: &str) -> Result<String, AuthError> {
        self.manager_for_host(host)?.token_for_host(host).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::session::token::tests::FakeAuthenticator;
    use fleetlink_core::config::RegionConfig;

    fn regional(eu: &Arc<FakeAuthenticator>, us: &Arc<FakeAuthenticator>) -> RegionalAuthenticator {
        let mut managers = BTreeMap::new();
        managers.insert(
            "eu".to_string(),
            Arc::new(TokenManager::with_defaults(Arc::clone(eu) as Arc<dyn Authenticator>)),
        );
        managers.insert(
            "us".to_string(),
            Arc::new(TokenManager::with_defaults(Arc::clone(us) as Arc<dyn Authenticator>)),
        );
        RegionalAuthenticator::new(managers, "eu").unwrap()
    }

    #[test]
    fn region_code_from_hostname() {
        assert_eq!(region_code("relay-103-eu.example.cloud"), Some("eu"));
        assert_eq!(region_code("relay-7-us"), Some("us"));
        assert_eq!(region_code("relay.example.cloud"), None);
        assert_eq!(region_code("relay-.example"), None);
        assert_eq!(region_code(""), None);
    }

    #[test]
    fn unknown_region_falls_back_to_default() {
        let auth = regional(
            &FakeAuthenticator::lasting(chrono::Duration::hours(1)),
            &FakeAuthenticator::lasting(chrono::Duration::hours(1)),
        );
        assert_eq!(auth.region_for_host("relay-1-us.example"), "us");
        assert_eq!(auth.region_for_host("relay-1-ap.example"), "eu");
        assert_eq!(auth.region_for_host("localhost"), "eu");
        assert_eq!(auth.regions(), vec!["eu".to_string(), "us".to_string()]);
    }

    #[test]
    fn default_region_must_exist() {
        let err = RegionalAuthenticator::new(BTreeMap::new(), "eu");
        assert!(matches!(err, Err(AuthError::UnknownRegion { .. })));
    }

    #[tokio::test]
    async fn tokens_come_from_the_hosts_region() {
        let eu = FakeAuthenticator::lasting(chrono::Duration::hours(1));
        let us = FakeAuthenticator::lasting(chrono::Duration::hours(1));
        let auth = regional(&eu, &us);

        auth.token_for_host("relay-2-us.example").await.unwrap();
        assert_eq!(us.calls(), 1);
        assert_eq!(eu.calls(), 0);
    }

    #[tokio::test]
    async fn ensure_all_valid_collects_per_region_errors() {
        let eu = FakeAuthenticator::failing();
        let us = FakeAuthenticator::lasting(chrono::Duration::hours(1));
        let auth = regional(&eu, &us);

        let errors = auth.ensure_all_valid().await;
        assert_eq!(errors.len(), 1);
        assert!(errors.contains_key("eu"));
        assert_eq!(us.calls(), 1);
        assert!(auth.manager("us").unwrap().current_token().is_ok());
    }

    #[tokio::test]
    async fn auto_refresh_all_is_idempotent() {
        let auth = regional(
            &FakeAuthenticator::lasting(chrono::Duration::hours(1)),
            &FakeAuthenticator::lasting(chrono::Duration::hours(1)),
        );
        let ctx = CancellationToken::new();
        assert_eq!(auth.start_auto_refresh_all(&ctx), 2);
        assert_eq!(auth.start_auto_refresh_all(&ctx), 0);
        assert_eq!(auth.stop_auto_refresh_all(), 2);
        assert_eq!(auth.stop_auto_refresh_all(), 0);
    }

    #[test]
    fn from_config_without_regions_uses_integrator_base() {
        let config = Config::default();
        let auth = RegionalAuthenticator::from_config(&config).unwrap();
        assert_eq!(auth.default_region(), DEFAULT_REGION);

        let mut config = Config::default();
        config.regions = vec![
            RegionConfig {
                name: "eu".into(),
                api_base: "https://eu.example".into(),
            },
            RegionConfig {
                name: "us".into(),
                api_base: "https://us.example".into(),
            },
        ];
        config.default_region = Some("us".into());
        let auth = RegionalAuthenticator::from_config(&config).unwrap();
        assert_eq!(auth.default_region(), "us");
        assert_eq!(auth.regions().len(), 2);
    }
}
