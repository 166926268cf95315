//! Integration tests for site lifecycle scenarios.

mod common;

use common::fixtures::{active_site, provisioned, site_request};
use common::{TestPlane, PROXY, SERVER};
use harbour_control::agent::{RemoteStatus, REDACTED};
use harbour_control::store::JobStore;
use harbour_control::{
    ControlError, JobFilter, JobStatus, JobTarget, JobType, MockBehaviour, SiteAction, SiteStatus,
};

#[tokio::test]
async fn site_walks_through_every_lifecycle_action() {
    let tp = TestPlane::new();
    let bench = provisioned(&tp).await;
    let site = active_site(&tp, "acme", &bench.name).await;
    let id = site.name().clone();
    let sites = tp.plane.sites();

    let steps = [
        (SiteAction::Suspend, SiteStatus::Suspended),
        (SiteAction::Unsuspend, SiteStatus::Active),
        (SiteAction::Deactivate, SiteStatus::Inactive),
        (SiteAction::Activate, SiteStatus::Active),
        (SiteAction::Restore, SiteStatus::Active),
        (SiteAction::Archive, SiteStatus::Archived),
    ];

    for (action, expected) in steps {
        let started = sites.transition(&id, action).await.unwrap();
        assert!(started.data.active_job.is_some(), "{action} holds the site");

        tp.reconcile().await;
        let finished = sites.site(&id).await.unwrap();
        assert_eq!(finished.status, expected, "after {action}");
        assert!(finished.data.active_job.is_none());
    }

    // Archived is terminal
    let err = sites.restore_site(&id).await.unwrap_err();
    assert!(
        matches!(err, ControlError::InvalidStateTransition { .. }),
        "{err}"
    );
}

#[tokio::test]
async fn restore_holds_site_in_installing() {
    let tp = TestPlane::new();
    let bench = provisioned(&tp).await;
    let site = active_site(&tp, "acme", &bench.name).await;
    tp.agent
        .set_behaviour(JobType::RestoreSite, MockBehaviour::NeverRespond);

    let restoring = tp.plane.sites().restore_site(site.name()).await.unwrap();
    assert_eq!(restoring.status, SiteStatus::Installing);
}

#[tokio::test]
async fn disallowed_action_is_rejected_without_a_job() {
    let tp = TestPlane::new();
    let bench = provisioned(&tp).await;
    let site = active_site(&tp, "acme", &bench.name).await;

    for action in [SiteAction::Unsuspend, SiteAction::Activate] {
        let err = tp
            .plane
            .sites()
            .transition(site.name(), action)
            .await
            .unwrap_err();
        assert!(
            matches!(err, ControlError::InvalidStateTransition { .. }),
            "{action}: {err}"
        );
    }

    assert!(tp.agent.submissions_of(JobType::UnsuspendSite).is_empty());
    assert!(tp.agent.submissions_of(JobType::ActivateSite).is_empty());
}

#[tokio::test]
async fn action_during_in_flight_job_conflicts() {
    let tp = TestPlane::new();
    let bench = provisioned(&tp).await;
    let site = active_site(&tp, "acme", &bench.name).await;
    tp.agent
        .set_behaviour(JobType::SuspendSite, MockBehaviour::NeverRespond);

    let suspending = tp.plane.sites().suspend_site(site.name()).await.unwrap();
    let in_flight = suspending.data.active_job.clone().unwrap();
    assert_eq!(suspending.status, SiteStatus::Active);

    for action in [SiteAction::Deactivate, SiteAction::Suspend, SiteAction::Archive] {
        let err = tp
            .plane
            .sites()
            .transition(site.name(), action)
            .await
            .unwrap_err();
        match err {
            ControlError::StateConflict { job, .. } => assert_eq!(job, in_flight.to_string()),
            other => panic!("{action}: expected state conflict, got {other}"),
        }
    }

    assert_eq!(tp.agent.submissions_of(JobType::SuspendSite).len(), 1);
    assert!(tp.agent.submissions_of(JobType::DeactivateSite).is_empty());
    assert!(tp.agent.submissions_of(JobType::ArchiveSite).is_empty());
}

#[tokio::test]
async fn silent_install_times_out_and_breaks_site() {
    let tp = TestPlane::new();
    let bench = provisioned(&tp).await;
    tp.agent
        .set_behaviour(JobType::NewSite, MockBehaviour::NeverRespond);

    let site = tp
        .plane
        .sites()
        .create_site(site_request("acme", &bench.name))
        .await
        .unwrap();
    let job_id = site.data.active_job.clone().unwrap();

    // Still running before the deadline
    tp.reconcile().await;
    assert_eq!(
        tp.plane.sites().site(site.name()).await.unwrap().status,
        SiteStatus::Installing
    );

    let report = tp.reconcile_after_deadlines().await;
    assert_eq!(report.timed_out, 1);

    let job = tp.plane.dispatcher().job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Timeout);

    let site = tp.plane.sites().site(site.name()).await.unwrap();
    assert_eq!(site.status, SiteStatus::Broken);
    assert!(site.data.active_job.is_none());
    assert!(site.data.error.as_deref().unwrap().contains("timed out"));

    // A broken site can be restored
    tp.agent.set_behaviour(JobType::NewSite, MockBehaviour::Succeed);
    tp.plane.sites().restore_site(site.name()).await.unwrap();
    tp.reconcile().await;
    assert_eq!(
        tp.plane.sites().site(site.name()).await.unwrap().status,
        SiteStatus::Active
    );
}

#[tokio::test]
async fn rejected_install_breaks_site_immediately() {
    let tp = TestPlane::new();
    let bench = provisioned(&tp).await;
    tp.agent.set_behaviour(
        JobType::NewSite,
        MockBehaviour::Reject("bench is full".to_owned()),
    );

    let site = tp
        .plane
        .sites()
        .create_site(site_request("acme", &bench.name))
        .await
        .unwrap();
    assert_eq!(site.status, SiteStatus::Broken);
    assert_eq!(
        site.data.error.as_deref(),
        Some("agent dispatch error: agent rejected job: bench is full")
    );
}

#[tokio::test]
async fn failed_lifecycle_job_breaks_site() {
    let tp = TestPlane::new();
    let bench = provisioned(&tp).await;
    let site = active_site(&tp, "acme", &bench.name).await;
    tp.agent.set_behaviour(
        JobType::DeactivateSite,
        MockBehaviour::Fail("proxy config invalid".to_owned()),
    );

    tp.plane.sites().deactivate_site(site.name()).await.unwrap();
    tp.reconcile().await;

    let site = tp.plane.sites().site(site.name()).await.unwrap();
    assert_eq!(site.status, SiteStatus::Broken);
    assert!(site
        .data
        .error
        .as_deref()
        .unwrap()
        .contains("proxy config invalid"));
}

#[tokio::test]
async fn proxy_actions_run_on_the_proxy() {
    let tp = TestPlane::new();
    let bench = provisioned(&tp).await;
    let site = active_site(&tp, "acme", &bench.name).await;

    tp.plane.sites().suspend_site(site.name()).await.unwrap();
    tp.reconcile().await;
    tp.plane.sites().archive_site(site.name()).await.unwrap();

    let suspend = tp.agent.submissions_of(JobType::SuspendSite);
    assert_eq!(suspend.len(), 1);
    assert_eq!(suspend[0].address, "10.0.0.2");
    assert_eq!(suspend[0].path, "proxy/sites/acme.harbour.test/suspend");

    let archive = tp.agent.submissions_of(JobType::ArchiveSite);
    assert_eq!(archive.len(), 1);
    assert_eq!(archive[0].address, SERVER);

    let jobs = tp
        .plane
        .store()
        .list_jobs(&JobFilter::new().with_target(JobTarget::Site(site.name().clone())))
        .await
        .unwrap();
    assert!(jobs
        .iter()
        .any(|j| j.job_type == JobType::SuspendSite && j.host == PROXY));
}

#[tokio::test]
async fn admin_password_is_delivered_but_never_stored() {
    let tp = TestPlane::new();
    let bench = provisioned(&tp).await;
    let site = tp
        .plane
        .sites()
        .create_site(site_request("acme", &bench.name))
        .await
        .unwrap();

    let delivered = tp.agent.submissions_of(JobType::NewSite);
    assert_eq!(delivered[0].data["admin_password"], "s3cret-admin");

    let job_id = site.data.active_job.unwrap();
    let stored = tp.plane.dispatcher().job(&job_id).await.unwrap();
    assert_eq!(stored.payload["admin_password"], REDACTED);
    assert!(!serde_json::to_string(&stored)
        .unwrap()
        .contains("s3cret-admin"));
}

#[tokio::test]
async fn callback_outcome_wins_over_later_poll() {
    let tp = TestPlane::new();
    let bench = provisioned(&tp).await;
    let site = active_site(&tp, "acme", &bench.name).await;
    tp.agent
        .set_behaviour(JobType::SuspendSite, MockBehaviour::NeverRespond);

    let started = tp.plane.sites().suspend_site(site.name()).await.unwrap();
    let job_id = started.data.active_job.unwrap();

    let accepted = tp
        .plane
        .dispatcher()
        .record_outcome(&job_id, RemoteStatus::Success, None, None)
        .await
        .unwrap();
    assert!(accepted);
    assert_eq!(
        tp.plane.sites().site(site.name()).await.unwrap().status,
        SiteStatus::Suspended
    );

    // A second, conflicting report is ignored
    let accepted = tp
        .plane
        .dispatcher()
        .record_outcome(
            &job_id,
            RemoteStatus::Failure,
            None,
            Some("late".to_owned()),
        )
        .await
        .unwrap();
    assert!(!accepted);
    let site = tp.plane.sites().site(site.name()).await.unwrap();
    assert_eq!(site.status, SiteStatus::Suspended);
    assert!(site.data.error.is_none());
}
