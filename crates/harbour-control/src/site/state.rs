//! Typestate pattern for the site lifecycle.
//!
//! Site states are encoded in the type system so that a transition the
//! lifecycle table does not allow is a compile-time error. Records loaded
//! from storage come back as [`AnySite`], which checks a requested
//! [`SiteAction`] at runtime.
//!
//! ```text
//!            ┌────────────┐
//! Pending ──▶│ Installing │──▶ Active ◀──▶ Suspended
//!            └────────────┘     │  ▲
//!                  ▲            │  └────▶ Inactive
//!                  └── restore ─┤
//!                               ▼
//!           Broken ───────▶ Archived
//! ```

use std::marker::PhantomData;

use crate::error::{ControlError, ControlResult};
use crate::records::{SiteData, SiteRecord};
use crate::types::{JobType, SiteStatus};

/// Marker trait for site states.
pub trait SiteState: private::Sealed + Send + Sync {
    /// Get the persisted status.
    fn persisted() -> SiteStatus;
}

mod private {
    pub trait Sealed {}
}

macro_rules! site_state {
    ($(#[$meta:meta])* $name:ident => $status:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl private::Sealed for $name {}

        impl SiteState for $name {
            fn persisted() -> SiteStatus {
                SiteStatus::$status
            }
        }
    };
}

site_state!(
    /// Site recorded, install job not yet delivered.
    Pending => Pending
);
site_state!(
    /// Install or restore running on the agent.
    Installing => Installing
);
site_state!(
    /// Site is live.
    Active => Active
);
site_state!(
    /// Site deactivated.
    Inactive => Inactive
);
site_state!(
    /// Site suspended.
    Suspended => Suspended
);
site_state!(
    /// A lifecycle job failed.
    Broken => Broken
);
site_state!(
    /// Site removed.
    Archived => Archived
);

/// A site in a specific state.
#[derive(Debug)]
pub struct Site<S: SiteState> {
    data: SiteData,
    _state: PhantomData<S>,
}

impl<S: SiteState> Site<S> {
    /// Get a reference to the site data.
    #[must_use]
    pub const fn data(&self) -> &SiteData {
        &self.data
    }

    /// Get the current status.
    #[must_use]
    pub fn status(&self) -> SiteStatus {
        S::persisted()
    }

    /// Convert into a storable record.
    #[must_use]
    pub fn into_record(self) -> SiteRecord {
        SiteRecord {
            data: self.data,
            status: S::persisted(),
        }
    }

    fn transition<T: SiteState>(self) -> Site<T> {
        Site {
            data: self.data,
            _state: PhantomData,
        }
    }

    fn transition_with<T: SiteState>(mut self, f: impl FnOnce(&mut SiteData)) -> Site<T> {
        f(&mut self.data);
        self.data.updated_at = chrono::Utc::now();
        self.transition()
    }

    /// Record a failed lifecycle job.
    #[must_use]
    pub fn fail(self, error: String) -> Site<Broken> {
        self.transition_with(|data| {
            data.active_job = None;
            data.error = Some(error);
        })
    }
}

impl Site<Pending> {
    /// Create a new site in the pending state.
    #[must_use]
    pub const fn create(data: SiteData) -> Self {
        Self {
            data,
            _state: PhantomData,
        }
    }

    /// The install job reached the agent.
    #[must_use]
    pub fn start_installing(self) -> Site<Installing> {
        self.transition()
    }
}

impl Site<Installing> {
    /// Install or restore finished.
    #[must_use]
    pub fn activate(self) -> Site<Active> {
        self.transition()
    }
}

impl Site<Active> {
    /// Route the site to the suspended page.
    #[must_use]
    pub fn suspend(self) -> Site<Suspended> {
        self.transition()
    }

    /// Route the site to the inactive page.
    #[must_use]
    pub fn deactivate(self) -> Site<Inactive> {
        self.transition()
    }

    /// Restore the site from a backup.
    #[must_use]
    pub fn restore(self) -> Site<Installing> {
        self.transition()
    }

    /// Drop the site from its bench.
    #[must_use]
    pub fn archive(self) -> Site<Archived> {
        self.transition()
    }
}

impl Site<Suspended> {
    /// Lift the suspension.
    #[must_use]
    pub fn unsuspend(self) -> Site<Active> {
        self.transition()
    }

    /// Drop the site from its bench.
    #[must_use]
    pub fn archive(self) -> Site<Archived> {
        self.transition()
    }
}

impl Site<Inactive> {
    /// Lift the deactivation.
    #[must_use]
    pub fn activate(self) -> Site<Active> {
        self.transition()
    }

    /// Drop the site from its bench.
    #[must_use]
    pub fn archive(self) -> Site<Archived> {
        self.transition()
    }
}

impl Site<Broken> {
    /// Restore the site from a backup.
    #[must_use]
    pub fn restore(self) -> Site<Installing> {
        self.transition()
    }

    /// Drop the site from its bench.
    #[must_use]
    pub fn archive(self) -> Site<Archived> {
        self.transition()
    }
}

/// A lifecycle operation on an existing site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiteAction {
    /// Active → Suspended, on the proxy.
    Suspend,
    /// Suspended → Active, on the proxy.
    Unsuspend,
    /// Active → Inactive, on the proxy.
    Deactivate,
    /// Inactive → Active, on the proxy.
    Activate,
    /// Active or Broken → Active through Installing, on the server.
    Restore,
    /// Anything but Pending or Installing → Archived, on the server.
    Archive,
}

impl SiteAction {
    /// Every lifecycle action.
    pub const ALL: [Self; 6] = [
        Self::Suspend,
        Self::Unsuspend,
        Self::Deactivate,
        Self::Activate,
        Self::Restore,
        Self::Archive,
    ];

    /// Get the action name as used in API paths.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Suspend => "suspend",
            Self::Unsuspend => "unsuspend",
            Self::Deactivate => "deactivate",
            Self::Activate => "activate",
            Self::Restore => "restore",
            Self::Archive => "archive",
        }
    }

    /// Agent job that carries the action.
    #[must_use]
    pub const fn job_type(&self) -> JobType {
        match self {
            Self::Suspend => JobType::SuspendSite,
            Self::Unsuspend => JobType::UnsuspendSite,
            Self::Deactivate => JobType::DeactivateSite,
            Self::Activate => JobType::ActivateSite,
            Self::Restore => JobType::RestoreSite,
            Self::Archive => JobType::ArchiveSite,
        }
    }

    /// Whether the job runs on the proxy fronting the site's server.
    #[must_use]
    pub const fn runs_on_proxy(&self) -> bool {
        matches!(
            self,
            Self::Suspend | Self::Unsuspend | Self::Deactivate | Self::Activate
        )
    }

    /// Status reached when the job succeeds.
    #[must_use]
    pub const fn target(&self) -> SiteStatus {
        match self {
            Self::Suspend => SiteStatus::Suspended,
            Self::Deactivate => SiteStatus::Inactive,
            Self::Unsuspend | Self::Activate | Self::Restore => SiteStatus::Active,
            Self::Archive => SiteStatus::Archived,
        }
    }

    /// Action carried by a lifecycle job type.
    #[must_use]
    pub const fn from_job_type(job_type: JobType) -> Option<Self> {
        match job_type {
            JobType::SuspendSite => Some(Self::Suspend),
            JobType::UnsuspendSite => Some(Self::Unsuspend),
            JobType::DeactivateSite => Some(Self::Deactivate),
            JobType::ActivateSite => Some(Self::Activate),
            JobType::RestoreSite => Some(Self::Restore),
            JobType::ArchiveSite => Some(Self::Archive),
            _ => None,
        }
    }
}

impl std::str::FromStr for SiteAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| format!("unknown site action: {s}"))
    }
}

impl std::fmt::Display for SiteAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn invalid(from: SiteStatus, to: SiteStatus) -> ControlError {
    ControlError::InvalidStateTransition {
        from: from.as_str(),
        to: to.as_str(),
    }
}

/// A type-erased site that can be in any state.
#[derive(Debug)]
pub enum AnySite {
    /// Site in pending state.
    Pending(Site<Pending>),
    /// Site in installing state.
    Installing(Site<Installing>),
    /// Site in active state.
    Active(Site<Active>),
    /// Site in inactive state.
    Inactive(Site<Inactive>),
    /// Site in suspended state.
    Suspended(Site<Suspended>),
    /// Site in broken state.
    Broken(Site<Broken>),
    /// Site in archived state.
    Archived(Site<Archived>),
}

impl AnySite {
    /// Create an `AnySite` from a stored record.
    #[must_use]
    pub fn from_record(record: SiteRecord) -> Self {
        let data = record.data;
        match record.status {
            SiteStatus::Pending => Self::Pending(Site::create(data)),
            SiteStatus::Installing => Self::Installing(Site::create(data).transition()),
            SiteStatus::Active => Self::Active(Site::create(data).transition()),
            SiteStatus::Inactive => Self::Inactive(Site::create(data).transition()),
            SiteStatus::Suspended => Self::Suspended(Site::create(data).transition()),
            SiteStatus::Broken => Self::Broken(Site::create(data).transition()),
            SiteStatus::Archived => Self::Archived(Site::create(data).transition()),
        }
    }

    /// Get a reference to the site data.
    #[must_use]
    pub const fn data(&self) -> &SiteData {
        match self {
            Self::Pending(s) => s.data(),
            Self::Installing(s) => s.data(),
            Self::Active(s) => s.data(),
            Self::Inactive(s) => s.data(),
            Self::Suspended(s) => s.data(),
            Self::Broken(s) => s.data(),
            Self::Archived(s) => s.data(),
        }
    }

    /// Get the current status.
    #[must_use]
    pub const fn status(&self) -> SiteStatus {
        match self {
            Self::Pending(_) => SiteStatus::Pending,
            Self::Installing(_) => SiteStatus::Installing,
            Self::Active(_) => SiteStatus::Active,
            Self::Inactive(_) => SiteStatus::Inactive,
            Self::Suspended(_) => SiteStatus::Suspended,
            Self::Broken(_) => SiteStatus::Broken,
            Self::Archived(_) => SiteStatus::Archived,
        }
    }

    /// The install job reached the agent.
    pub fn start_installing(self) -> ControlResult<Self> {
        match self {
            Self::Pending(s) => Ok(Self::Installing(s.start_installing())),
            other => Err(invalid(other.status(), SiteStatus::Installing)),
        }
    }

    /// The install job succeeded.
    ///
    /// A site still pending, because the outcome arrived before the
    /// delivery was recorded, passes through installing.
    pub fn finish_install(self) -> ControlResult<Self> {
        match self {
            Self::Pending(s) => Ok(Self::Active(s.start_installing().activate())),
            Self::Installing(s) => Ok(Self::Active(s.activate())),
            other => Err(invalid(other.status(), SiteStatus::Active)),
        }
    }

    /// A lifecycle job failed. Archived sites stay archived.
    pub fn fail(self, error: String) -> ControlResult<Self> {
        let broken = match self {
            Self::Pending(s) => s.fail(error),
            Self::Installing(s) => s.fail(error),
            Self::Active(s) => s.fail(error),
            Self::Inactive(s) => s.fail(error),
            Self::Suspended(s) => s.fail(error),
            Self::Broken(s) => s.fail(error),
            Self::Archived(_) => {
                return Err(invalid(SiteStatus::Archived, SiteStatus::Broken));
            }
        };
        Ok(Self::Broken(broken))
    }

    /// Apply a lifecycle action to the site.
    ///
    /// Returns the site in the state it holds while the action's job runs.
    /// For most actions that is the state it is already in; `restore`
    /// moves it to installing. Fails with an invalid transition when the
    /// lifecycle table does not allow the action from the current state.
    pub fn begin(self, action: SiteAction) -> ControlResult<Self> {
        let from = self.status();
        let next = match (self, action) {
            (Self::Active(s), SiteAction::Restore) => Self::Installing(s.restore()),
            (Self::Broken(s), SiteAction::Restore) => Self::Installing(s.restore()),
            (
                site @ Self::Active(_),
                SiteAction::Suspend | SiteAction::Deactivate | SiteAction::Archive,
            )
            | (site @ Self::Suspended(_), SiteAction::Unsuspend | SiteAction::Archive)
            | (site @ Self::Inactive(_), SiteAction::Activate | SiteAction::Archive)
            | (site @ Self::Broken(_), SiteAction::Archive) => site,
            _ => return Err(invalid(from, action.target())),
        };
        Ok(next)
    }

    /// Complete a lifecycle action whose job succeeded.
    pub fn complete(self, action: SiteAction) -> ControlResult<Self> {
        let from = self.status();
        let next = match (self, action) {
            (Self::Active(s), SiteAction::Suspend) => Self::Suspended(s.suspend()),
            (Self::Active(s), SiteAction::Deactivate) => Self::Inactive(s.deactivate()),
            (Self::Active(s), SiteAction::Archive) => Self::Archived(s.archive()),
            (Self::Suspended(s), SiteAction::Unsuspend) => Self::Active(s.unsuspend()),
            (Self::Suspended(s), SiteAction::Archive) => Self::Archived(s.archive()),
            (Self::Inactive(s), SiteAction::Activate) => Self::Active(s.activate()),
            (Self::Inactive(s), SiteAction::Archive) => Self::Archived(s.archive()),
            (Self::Broken(s), SiteAction::Archive) => Self::Archived(s.archive()),
            (Self::Installing(s), SiteAction::Restore) => Self::Active(s.activate()),
            _ => return Err(invalid(from, action.target())),
        };
        Ok(next)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{AppId, BenchId, PlanId, ServerId, SiteId};
    use chrono::Utc;

    fn test_data() -> SiteData {
        let now = Utc::now();
        SiteData {
            name: SiteId::new("acme.harbour.test"),
            subdomain: "acme".to_owned(),
            bench: BenchId::new("bench-test"),
            server: ServerId::new("f1.harbour.test"),
            plan: PlanId::new("basic"),
            apps: vec![AppId::new("frappe")],
            active_job: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn loaded(status: SiteStatus) -> AnySite {
        AnySite::from_record(SiteRecord {
            data: test_data(),
            status,
        })
    }

    #[test]
    fn install_path_transitions() {
        let pending = Site::<Pending>::create(test_data());
        assert_eq!(pending.status(), SiteStatus::Pending);

        let installing = pending.start_installing();
        assert_eq!(installing.status(), SiteStatus::Installing);

        let active = installing.activate();
        assert_eq!(active.status(), SiteStatus::Active);
        assert_eq!(active.into_record().status, SiteStatus::Active);
    }

    #[test]
    fn fail_records_error() {
        let installing = Site::<Pending>::create(test_data()).start_installing();
        let broken = installing.fail("bench unreachable".to_owned());
        assert_eq!(broken.status(), SiteStatus::Broken);
        assert_eq!(broken.data().error.as_deref(), Some("bench unreachable"));
    }

    #[test]
    fn loaded_site_follows_install_path() {
        let installing = loaded(SiteStatus::Pending).start_installing().unwrap();
        assert_eq!(installing.status(), SiteStatus::Installing);
        assert_eq!(
            installing.finish_install().unwrap().status(),
            SiteStatus::Active
        );

        // Outcome recorded before the delivery
        let active = loaded(SiteStatus::Pending).finish_install().unwrap();
        assert_eq!(active.status(), SiteStatus::Active);

        assert!(loaded(SiteStatus::Active).start_installing().is_err());
        assert!(loaded(SiteStatus::Suspended).finish_install().is_err());
    }

    #[test]
    fn loaded_site_fails_unless_archived() {
        let broken = loaded(SiteStatus::Suspended)
            .fail("proxy unreachable".to_owned())
            .unwrap();
        assert_eq!(broken.status(), SiteStatus::Broken);
        assert_eq!(broken.data().error.as_deref(), Some("proxy unreachable"));
        assert!(broken.data().active_job.is_none());

        let err = loaded(SiteStatus::Archived)
            .fail("late".to_owned())
            .unwrap_err();
        assert!(matches!(
            err,
            ControlError::InvalidStateTransition {
                from: "archived",
                to: "broken"
            }
        ));
    }

    #[test]
    fn suspend_and_unsuspend() {
        let active = loaded(SiteStatus::Active);
        let held = active.begin(SiteAction::Suspend).unwrap();
        assert_eq!(held.status(), SiteStatus::Active);

        let suspended = held.complete(SiteAction::Suspend).unwrap();
        assert_eq!(suspended.status(), SiteStatus::Suspended);

        let active = suspended
            .begin(SiteAction::Unsuspend)
            .unwrap()
            .complete(SiteAction::Unsuspend)
            .unwrap();
        assert_eq!(active.status(), SiteStatus::Active);
    }

    #[test]
    fn restore_holds_installing() {
        for status in [SiteStatus::Active, SiteStatus::Broken] {
            let held = loaded(status).begin(SiteAction::Restore).unwrap();
            assert_eq!(held.status(), SiteStatus::Installing);
            let done = held.complete(SiteAction::Restore).unwrap();
            assert_eq!(done.status(), SiteStatus::Active);
        }
    }

    #[test]
    fn lifecycle_table_is_enforced() {
        let allowed = |status: SiteStatus, action: SiteAction| {
            loaded(status).begin(action).is_ok()
        };

        assert!(!allowed(SiteStatus::Suspended, SiteAction::Suspend));
        assert!(!allowed(SiteStatus::Active, SiteAction::Unsuspend));
        assert!(!allowed(SiteStatus::Inactive, SiteAction::Deactivate));
        assert!(!allowed(SiteStatus::Pending, SiteAction::Archive));
        assert!(!allowed(SiteStatus::Installing, SiteAction::Restore));
        assert!(!allowed(SiteStatus::Suspended, SiteAction::Restore));

        for action in SiteAction::ALL {
            assert!(!allowed(SiteStatus::Archived, action));
        }

        for status in [
            SiteStatus::Active,
            SiteStatus::Inactive,
            SiteStatus::Suspended,
            SiteStatus::Broken,
        ] {
            assert!(allowed(status, SiteAction::Archive));
        }
    }

    #[test]
    fn invalid_action_names_states() {
        let err = loaded(SiteStatus::Archived)
            .begin(SiteAction::Activate)
            .unwrap_err();
        assert!(matches!(
            err,
            ControlError::InvalidStateTransition {
                from: "archived",
                to: "active"
            }
        ));
    }

    #[test]
    fn action_names_parse_back() {
        for action in SiteAction::ALL {
            assert_eq!(action.as_str().parse::<SiteAction>(), Ok(action));
            assert_eq!(SiteAction::from_job_type(action.job_type()), Some(action));
        }
        assert!("delete".parse::<SiteAction>().is_err());
        assert!(SiteAction::from_job_type(JobType::NewSite).is_none());
    }
}
