//! Integration tests for domain resolution across sites.

mod common;

use common::fixtures::{active_site, provisioned};
use common::TestPlane;
use harbour_control::types::DomainId;
use harbour_control::{ControlError, SiteStatus};

#[tokio::test]
async fn each_site_resolves_independently() {
    let tp = TestPlane::new();
    let bench = provisioned(&tp).await;
    let acme = active_site(&tp, "acme", &bench.name).await;
    let globex = active_site(&tp, "globex", &bench.name).await;
    let domains = tp.plane.domains();

    domains
        .add_domain(globex.name(), "www.globex.com", true)
        .await
        .unwrap();

    assert_eq!(
        domains.primary_domain_name(acme.name()).await.unwrap(),
        "acme.harbour.test"
    );
    assert_eq!(
        domains.primary_domain_name(globex.name()).await.unwrap(),
        "www.globex.com"
    );

    // A hostname belongs to at most one site
    let err = domains
        .add_domain(acme.name(), "www.globex.com", false)
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Validation(_)), "{err}");
}

#[tokio::test]
async fn unflagging_primary_falls_back_to_site_name() {
    let tp = TestPlane::new();
    let bench = provisioned(&tp).await;
    let site = active_site(&tp, "acme", &bench.name).await;
    let domains = tp.plane.domains();

    domains
        .add_domain(site.name(), "acme.example.org", true)
        .await
        .unwrap();
    let resolved = domains.primary_domain_name(site.name()).await.unwrap();
    assert_eq!(resolved, "acme.example.org");
    assert_ne!(resolved, site.name().as_str());

    domains
        .set_primary(&DomainId::new("acme.example.org"), false)
        .await
        .unwrap();
    assert_eq!(
        domains.primary_domain_name(site.name()).await.unwrap(),
        site.name().as_str()
    );
}

#[tokio::test]
async fn archived_site_accepts_no_domains() {
    let tp = TestPlane::new();
    let bench = provisioned(&tp).await;
    let site = active_site(&tp, "acme", &bench.name).await;

    tp.plane.sites().archive_site(site.name()).await.unwrap();
    tp.reconcile().await;
    assert_eq!(
        tp.plane.sites().site(site.name()).await.unwrap().status,
        SiteStatus::Archived
    );

    let err = tp
        .plane
        .domains()
        .add_domain(site.name(), "www.acme.com", true)
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Validation(_)), "{err}");
}
