//! Domain resolver.
//!
//! Every site answers on its own name. Custom domains can be bound to a
//! site, and at most one of them may be flagged primary; the primary
//! domain, when there is one, is the site's public hostname.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::error::{ControlError, ControlResult, EntityKind};
use crate::naming::validate_hostname;
use crate::records::{SiteDomainRecord, SiteRecord};
use crate::store::ControlStore;
use crate::types::{DomainId, SiteId, SiteStatus};

/// Resolves and edits the hostnames a site answers on.
pub struct DomainResolver {
    store: Arc<dyn ControlStore>,
}

impl DomainResolver {
    /// Create a new resolver.
    pub fn new(store: Arc<dyn ControlStore>) -> Self {
        Self { store }
    }

    async fn site(&self, id: &SiteId) -> ControlResult<SiteRecord> {
        self.store
            .get_site(id)
            .await?
            .ok_or_else(|| ControlError::not_found(EntityKind::Site, id))
    }

    /// The hostname a site is served on.
    ///
    /// The site's primary domain when one is flagged, the site's own name
    /// otherwise. Observing two primaries is reported as an invariant
    /// violation instead of picking one.
    pub async fn primary_domain_name(&self, site: &SiteId) -> ControlResult<String> {
        let site = self.site(site).await?;
        let domains = self.store.list_domains(site.name()).await?;

        let mut primaries = domains.iter().filter(|d| d.primary);
        match (primaries.next(), primaries.next()) {
            (None, _) => Ok(site.name().to_string()),
            (Some(domain), None) => Ok(domain.name.to_string()),
            (Some(first), Some(second)) => Err(ControlError::invariant(format!(
                "site {} has more than one primary domain ({}, {})",
                site.name(),
                first.name,
                second.name
            ))),
        }
    }

    /// Bind a custom domain to a site.
    ///
    /// Flagging it primary demotes the site's other domains in the same
    /// store operation.
    pub async fn add_domain(
        &self,
        site: &SiteId,
        hostname: &str,
        primary: bool,
    ) -> ControlResult<SiteDomainRecord> {
        let hostname = hostname.to_ascii_lowercase();
        validate_hostname(&hostname)?;

        let site = self.site(site).await?;
        if site.status == SiteStatus::Archived {
            return Err(ControlError::validation(format!(
                "site {} is archived",
                site.name()
            )));
        }
        if hostname == site.name().as_str() {
            return Err(ControlError::validation(format!(
                "{hostname} is the site's own name"
            )));
        }

        let now = Utc::now();
        let record = SiteDomainRecord {
            name: DomainId::new(hostname),
            site: site.name().clone(),
            primary,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_domain(&record).await?;

        info!(domain = %record.name, site = %record.site, primary, "domain added");
        Ok(record)
    }

    /// Flag or unflag a domain as its site's primary.
    pub async fn set_primary(
        &self,
        domain: &DomainId,
        primary: bool,
    ) -> ControlResult<SiteDomainRecord> {
        let record = self.store.set_domain_primary(domain, primary).await?;
        info!(domain = %record.name, site = %record.site, primary, "domain primary flag set");
        Ok(record)
    }

    /// Unbind a domain.
    pub async fn remove_domain(&self, domain: &DomainId) -> ControlResult<()> {
        self.store.delete_domain(domain).await?;
        info!(domain = %domain, "domain removed");
        Ok(())
    }

    /// A site's domains, oldest first.
    pub async fn domains(&self, site: &SiteId) -> ControlResult<Vec<SiteDomainRecord>> {
        self.site(site).await?;
        self.store.list_domains(site).await
    }
}

impl std::fmt::Debug for DomainResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainResolver").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::records::{BenchRecord, SiteData};
    use crate::store::MemoryStore;
    use crate::types::{
        AppId, BenchId, BenchStatus, DeployCandidateId, PlanId, ReleaseGroupId, ServerId,
    };

    async fn resolver_with_sites(names: &[&str]) -> DomainResolver {
        let store: Arc<dyn ControlStore> = Arc::new(MemoryStore::new());
        let now = Utc::now();
        store
            .insert_bench_within_capacity(
                &BenchRecord {
                    name: BenchId::new("bench-erp-abc123"),
                    group: ReleaseGroupId::new("erp"),
                    candidate: DeployCandidateId::new("candidate-erp"),
                    server: ServerId::new("f1.harbour.test"),
                    workers: 1,
                    gunicorn_workers: 2,
                    status: BenchStatus::Active,
                    active_job: None,
                    error: None,
                    created_at: now,
                    updated_at: now,
                },
                None,
            )
            .await
            .unwrap();
        for name in names {
            store
                .insert_site(&SiteRecord {
                    data: SiteData {
                        name: SiteId::new(*name),
                        subdomain: name.split('.').next().unwrap().to_owned(),
                        bench: BenchId::new("bench-erp-abc123"),
                        server: ServerId::new("f1.harbour.test"),
                        plan: PlanId::new("basic"),
                        apps: vec![AppId::new("erp")],
                        active_job: None,
                        error: None,
                        created_at: now,
                        updated_at: now,
                    },
                    status: SiteStatus::Active,
                })
                .await
                .unwrap();
        }
        DomainResolver::new(store)
    }

    #[tokio::test]
    async fn fresh_site_resolves_to_own_name() {
        let resolver = resolver_with_sites(&["acme.harbour.test"]).await;
        let site = SiteId::new("acme.harbour.test");
        assert_eq!(
            resolver.primary_domain_name(&site).await.unwrap(),
            "acme.harbour.test"
        );
    }

    #[tokio::test]
    async fn primary_flag_moves_resolution() {
        let resolver = resolver_with_sites(&["acme.harbour.test"]).await;
        let site = SiteId::new("acme.harbour.test");

        resolver
            .add_domain(&site, "shop.example.com", false)
            .await
            .unwrap();
        assert_eq!(
            resolver.primary_domain_name(&site).await.unwrap(),
            "acme.harbour.test"
        );

        let shop = DomainId::new("shop.example.com");
        resolver.set_primary(&shop, true).await.unwrap();
        assert_eq!(
            resolver.primary_domain_name(&site).await.unwrap(),
            "shop.example.com"
        );

        resolver
            .add_domain(&site, "www.example.com", true)
            .await
            .unwrap();
        assert_eq!(
            resolver.primary_domain_name(&site).await.unwrap(),
            "www.example.com"
        );

        resolver
            .set_primary(&DomainId::new("www.example.com"), false)
            .await
            .unwrap();
        assert_eq!(
            resolver.primary_domain_name(&site).await.unwrap(),
            "acme.harbour.test"
        );
    }

    #[tokio::test]
    async fn other_sites_do_not_interfere() {
        let resolver = resolver_with_sites(&["acme.harbour.test", "beta.harbour.test"]).await;
        let acme = SiteId::new("acme.harbour.test");
        let beta = SiteId::new("beta.harbour.test");

        resolver
            .add_domain(&beta, "beta.example.com", true)
            .await
            .unwrap();
        assert_eq!(
            resolver.primary_domain_name(&acme).await.unwrap(),
            "acme.harbour.test"
        );

        let taken = resolver.add_domain(&acme, "beta.example.com", true).await;
        assert!(matches!(taken, Err(ControlError::Validation(_))));
    }

    #[tokio::test]
    async fn own_name_and_bad_hostnames_are_rejected() {
        let resolver = resolver_with_sites(&["acme.harbour.test"]).await;
        let site = SiteId::new("acme.harbour.test");

        assert!(resolver
            .add_domain(&site, "acme.harbour.test", false)
            .await
            .is_err());
        assert!(resolver.add_domain(&site, "bad host", false).await.is_err());
        assert!(resolver
            .add_domain(&SiteId::new("nope.harbour.test"), "shop.example.com", false)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn removing_primary_reverts_to_default() {
        let resolver = resolver_with_sites(&["acme.harbour.test"]).await;
        let site = SiteId::new("acme.harbour.test");

        resolver
            .add_domain(&site, "shop.example.com", true)
            .await
            .unwrap();
        resolver
            .remove_domain(&DomainId::new("shop.example.com"))
            .await
            .unwrap();

        assert!(resolver.domains(&site).await.unwrap().is_empty());
        assert_eq!(
            resolver.primary_domain_name(&site).await.unwrap(),
            "acme.harbour.test"
        );
    }
}
