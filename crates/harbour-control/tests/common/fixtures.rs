//! Test fixtures for control plane integration tests.

use harbour_control::records::{BenchRecord, DeployCandidateRecord, SiteRecord};
use harbour_control::types::{AppId, BenchId, PlanId, ReleaseGroupId, SiteId};
use harbour_control::{
    AppSpec, BenchRequest, CandidateStatus, HostStatus, PlanSpec, ProxyServerId, ProxyServerSpec,
    ReleaseGroupSpec, ServerId, ServerSpec, SiteRequest,
};

use super::{TestPlane, PROXY, SERVER};

/// Registers the default proxy and server.
pub async fn register_hosts(tp: &TestPlane) {
    tp.plane
        .registry()
        .register_proxy_server(ProxyServerSpec {
            name: ProxyServerId::new(PROXY),
            status: HostStatus::Active,
            ip: Some("10.0.0.2".to_owned()),
            private_ip: None,
        })
        .await
        .unwrap();
    register_server(tp, SERVER).await;
}

/// Registers an active server behind the default proxy.
pub async fn register_server(tp: &TestPlane, name: &str) {
    tp.plane
        .registry()
        .register_server(ServerSpec {
            name: ServerId::new(name),
            status: HostStatus::Active,
            ip: None,
            private_ip: None,
            proxy_server: ProxyServerId::new(PROXY),
        })
        .await
        .unwrap();
}

/// Builder for release groups and their apps.
pub struct ReleaseBuilder {
    group: String,
    apps: Vec<String>,
    enabled: bool,
}

impl ReleaseBuilder {
    /// Creates a builder for the named group with a single `frappe` app.
    pub fn new(group: &str) -> Self {
        Self {
            group: group.to_owned(),
            apps: vec!["frappe".to_owned()],
            enabled: true,
        }
    }

    /// Adds an app to the group.
    pub fn with_app(mut self, app: &str) -> Self {
        self.apps.push(app.to_owned());
        self
    }

    /// Marks the group disabled.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Stores the apps and the group.
    pub async fn create(self, tp: &TestPlane) -> ReleaseGroupId {
        let releases = tp.plane.releases();
        for app in &self.apps {
            releases
                .upsert_app(AppSpec {
                    name: AppId::new(app.as_str()),
                    repository: format!("https://git.harbour.test/{app}.git"),
                    branch: "main".to_owned(),
                    hash: format!("{app}-0001"),
                })
                .await
                .unwrap();
        }

        let group = releases
            .upsert_release_group(ReleaseGroupSpec {
                name: ReleaseGroupId::new(self.group.as_str()),
                apps: self.apps.iter().map(|a| AppId::new(a.as_str())).collect(),
                enabled: self.enabled,
                config: serde_json::json!({"python": "3.11"}),
            })
            .await
            .unwrap();
        group.name
    }
}

/// Takes a candidate of the group and reconciles until it is built.
pub async fn built_candidate(tp: &TestPlane, group: &ReleaseGroupId) -> DeployCandidateRecord {
    let candidate = tp
        .plane
        .releases()
        .create_deploy_candidate(group)
        .await
        .unwrap();
    tp.reconcile().await;

    let candidate = tp
        .plane
        .releases()
        .deploy_candidate(&candidate.id)
        .await
        .unwrap();
    assert_eq!(candidate.status, CandidateStatus::Built);
    candidate
}

/// Bench request for the candidate on the default server.
pub fn bench_request(candidate: &DeployCandidateRecord) -> BenchRequest {
    BenchRequest {
        candidate: candidate.id.clone(),
        server: ServerId::new(SERVER),
        workers: 1,
        gunicorn_workers: 2,
    }
}

/// Creates a bench on the default server and reconciles until it is active.
pub async fn active_bench(tp: &TestPlane, group: &ReleaseGroupId) -> BenchRecord {
    let candidate = built_candidate(tp, group).await;
    let bench = tp
        .plane
        .benches()
        .create_bench(bench_request(&candidate))
        .await
        .unwrap();
    tp.reconcile().await;
    tp.plane.benches().bench(&bench.name).await.unwrap()
}

/// Stores the default plan.
pub async fn plan(tp: &TestPlane) -> PlanId {
    tp.plane
        .sites()
        .upsert_plan(PlanSpec {
            name: PlanId::new("basic"),
            price_usd: 10.0,
            price_inr: 800.0,
            period: 30,
        })
        .await
        .unwrap()
        .name
}

/// Site request installing `frappe` on the bench.
pub fn site_request(subdomain: &str, bench: &BenchId) -> SiteRequest {
    SiteRequest {
        subdomain: subdomain.to_owned(),
        server: ServerId::new(SERVER),
        bench: bench.clone(),
        plan: PlanId::new("basic"),
        apps: vec![AppId::new("frappe")],
        admin_password: "s3cret-admin".to_owned(),
    }
}

/// Creates a site and reconciles until the install finishes.
pub async fn active_site(tp: &TestPlane, subdomain: &str, bench: &BenchId) -> SiteRecord {
    let site = tp
        .plane
        .sites()
        .create_site(site_request(subdomain, bench))
        .await
        .unwrap();
    tp.reconcile().await;
    tp.plane.sites().site(site.name()).await.unwrap()
}

/// Everything up to an active bench with the default plan stored.
pub async fn provisioned(tp: &TestPlane) -> BenchRecord {
    register_hosts(tp).await;
    let group = ReleaseBuilder::new("erp").create(tp).await;
    plan(tp).await;
    active_bench(tp, &group).await
}

/// Site identifier under the test root domain.
pub fn site_id(subdomain: &str) -> SiteId {
    SiteId::new(format!("{subdomain}.{}", super::ROOT_DOMAIN))
}
