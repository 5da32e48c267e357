//! The migration task engine.
//!
//! A migration advances one phase per reconcile tick. The itinerary, an
//! ordered list of steps gated by feature flags, is re-selected at the
//! start of every tick from the migration's observed state; when it
//! changes, the phase resets to the new itinerary's first step, which is
//! how the cancel and failure paths splice in. Every handler is idempotent:
//! re-running a phase whose invariant already holds is a no-op.

use std::time::Duration;

use tracing::info;

use crate::crd::condition::{Category, Condition, TRUE};
use crate::crd::plan::{PlanPv, PvcRef};
use crate::crd::{
    CANCELED, CANCELING, FAILED, MigCluster, MigMigration, MigPlan, MigStorage,
};
use crate::compat::CompatClient;
use crate::controller::error::Result;
use crate::settings::Settings;

// Requeue. Local to this controller; other controllers tune their own.
pub const FAST_REQUEUE: Duration = Duration::from_millis(100);
pub const POLL_REQUEUE: Duration = Duration::from_secs(3);

/// Condition messages.
pub const SUCCEEDED_MESSAGE: &str = "The migration has completed successfully.";
pub const FAILED_MESSAGE: &str = "The migration has failed. See: Errors.";
pub const CANCEL_IN_PROGRESS_MESSAGE: &str = "The migration is being canceled.";
pub const CANCELED_MESSAGE: &str = "The migration has been canceled.";
pub const STAGE_NO_OP_MESSAGE: &str =
    "Stage migration was run without any PVs. No Velero operations were initiated.";

/// Condition types owned by the engine.
pub const STAGE_PODS_CREATED: &str = "StagePodsCreated";
pub const STAGE_NO_OP: &str = "StageNoOp";

/// Phases of the migration itineraries.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum Phase {
    /// Initial phase; serialized as the empty string.
    #[default]
    Created,
    Started,
    Prepare,
    EnsureCloudSecretPropagated,
    PreBackupHooks,
    PostBackupHooks,
    PreRestoreHooks,
    PostRestoreHooks,
    PreBackupHooksFailed,
    PostBackupHooksFailed,
    PreRestoreHooksFailed,
    PostRestoreHooksFailed,
    EnsureInitialBackup,
    InitialBackupCreated,
    InitialBackupFailed,
    AnnotateResources,
    EnsureStagePodsFromRunning,
    EnsureStagePodsFromTemplates,
    EnsureStagePodsFromOrphanedPVCs,
    StagePodsCreated,
    RestartResticSidecar,
    ResticRestarted,
    QuiesceApplications,
    EnsureQuiesced,
    UnQuiesceApplications,
    EnsureStageBackup,
    StageBackupCreated,
    StageBackupFailed,
    EnsureInitialBackupReplicated,
    EnsureStageBackupReplicated,
    EnsureStageRestore,
    StageRestoreCreated,
    StageRestoreFailed,
    EnsureFinalRestore,
    FinalRestoreCreated,
    FinalRestoreFailed,
    Verification,
    EnsureStagePodsDeleted,
    EnsureStagePodsTerminated,
    EnsureAnnotationsDeleted,
    EnsureLabelsDeleted,
    DeleteMigrated,
    EnsureMigratedDeleted,
    DeleteBackups,
    DeleteRestores,
    MigrationFailed,
    Canceling,
    Canceled,
    Completed,
}

impl Phase {
    /// Phase name as persisted in status. `Created` is the empty string so
    /// a fresh migration resumes from the itinerary head.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Created => "",
            Phase::Started => "Started",
            Phase::Prepare => "Prepare",
            Phase::EnsureCloudSecretPropagated => "EnsureCloudSecretPropagated",
            Phase::PreBackupHooks => "PreBackupHooks",
            Phase::PostBackupHooks => "PostBackupHooks",
            Phase::PreRestoreHooks => "PreRestoreHooks",
            Phase::PostRestoreHooks => "PostRestoreHooks",
            Phase::PreBackupHooksFailed => "PreBackupHooksFailed",
            Phase::PostBackupHooksFailed => "PostBackupHooksFailed",
            Phase::PreRestoreHooksFailed => "PreRestoreHooksFailed",
            Phase::PostRestoreHooksFailed => "PostRestoreHooksFailed",
            Phase::EnsureInitialBackup => "EnsureInitialBackup",
            Phase::InitialBackupCreated => "InitialBackupCreated",
            Phase::InitialBackupFailed => "InitialBackupFailed",
            Phase::AnnotateResources => "AnnotateResources",
            Phase::EnsureStagePodsFromRunning => "EnsureStagePodsFromRunning",
            Phase::EnsureStagePodsFromTemplates => "EnsureStagePodsFromTemplates",
            Phase::EnsureStagePodsFromOrphanedPVCs => "EnsureStagePodsFromOrphanedPVCs",
            Phase::StagePodsCreated => "StagePodsCreated",
            Phase::RestartResticSidecar => "RestartResticSidecar",
            Phase::ResticRestarted => "ResticRestarted",
            Phase::QuiesceApplications => "QuiesceApplications",
            Phase::EnsureQuiesced => "EnsureQuiesced",
            Phase::UnQuiesceApplications => "UnQuiesceApplications",
            Phase::EnsureStageBackup => "EnsureStageBackup",
            Phase::StageBackupCreated => "StageBackupCreated",
            Phase::StageBackupFailed => "StageBackupFailed",
            Phase::EnsureInitialBackupReplicated => "EnsureInitialBackupReplicated",
            Phase::EnsureStageBackupReplicated => "EnsureStageBackupReplicated",
            Phase::EnsureStageRestore => "EnsureStageRestore",
            Phase::StageRestoreCreated => "StageRestoreCreated",
            Phase::StageRestoreFailed => "StageRestoreFailed",
            Phase::EnsureFinalRestore => "EnsureFinalRestore",
            Phase::FinalRestoreCreated => "FinalRestoreCreated",
            Phase::FinalRestoreFailed => "FinalRestoreFailed",
            Phase::Verification => "Verification",
            Phase::EnsureStagePodsDeleted => "EnsureStagePodsDeleted",
            Phase::EnsureStagePodsTerminated => "EnsureStagePodsTerminated",
            Phase::EnsureAnnotationsDeleted => "EnsureAnnotationsDeleted",
            Phase::EnsureLabelsDeleted => "EnsureLabelsDeleted",
            Phase::DeleteMigrated => "DeleteMigrated",
            Phase::EnsureMigratedDeleted => "EnsureMigratedDeleted",
            Phase::DeleteBackups => "DeleteBackups",
            Phase::DeleteRestores => "DeleteRestores",
            Phase::MigrationFailed => "MigrationFailed",
            Phase::Canceling => "Canceling",
            Phase::Canceled => "Canceled",
            Phase::Completed => "Completed",
        }
    }

    /// Parse a persisted phase name. Unknown names map to `None`; the
    /// engine treats them as off-itinerary and completes.
    pub fn parse(name: &str) -> Option<Phase> {
        ALL_PHASES.iter().copied().find(|p| p.as_str() == name)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

const ALL_PHASES: &[Phase] = &[
    Phase::Created,
    Phase::Started,
    Phase::Prepare,
    Phase::EnsureCloudSecretPropagated,
    Phase::PreBackupHooks,
    Phase::PostBackupHooks,
    Phase::PreRestoreHooks,
    Phase::PostRestoreHooks,
    Phase::PreBackupHooksFailed,
    Phase::PostBackupHooksFailed,
    Phase::PreRestoreHooksFailed,
    Phase::PostRestoreHooksFailed,
    Phase::EnsureInitialBackup,
    Phase::InitialBackupCreated,
    Phase::InitialBackupFailed,
    Phase::AnnotateResources,
    Phase::EnsureStagePodsFromRunning,
    Phase::EnsureStagePodsFromTemplates,
    Phase::EnsureStagePodsFromOrphanedPVCs,
    Phase::StagePodsCreated,
    Phase::RestartResticSidecar,
    Phase::ResticRestarted,
    Phase::QuiesceApplications,
    Phase::EnsureQuiesced,
    Phase::UnQuiesceApplications,
    Phase::EnsureStageBackup,
    Phase::StageBackupCreated,
    Phase::StageBackupFailed,
    Phase::EnsureInitialBackupReplicated,
    Phase::EnsureStageBackupReplicated,
    Phase::EnsureStageRestore,
    Phase::StageRestoreCreated,
    Phase::StageRestoreFailed,
    Phase::EnsureFinalRestore,
    Phase::FinalRestoreCreated,
    Phase::FinalRestoreFailed,
    Phase::Verification,
    Phase::EnsureStagePodsDeleted,
    Phase::EnsureStagePodsTerminated,
    Phase::EnsureAnnotationsDeleted,
    Phase::EnsureLabelsDeleted,
    Phase::DeleteMigrated,
    Phase::EnsureMigratedDeleted,
    Phase::DeleteBackups,
    Phase::DeleteRestores,
    Phase::MigrationFailed,
    Phase::Canceling,
    Phase::Canceled,
    Phase::Completed,
];

/// Step-inclusion flags, derived once per tick from plan and migration.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);
    /// Only when quiesce was requested.
    pub const QUIESCE: Flags = Flags(0x01);
    /// Only when stage pods were created (durable condition).
    pub const HAS_STAGE_PODS: Flags = Flags(0x02);
    /// Only when PVs are migrated.
    pub const HAS_PVS: Flags = Flags(0x04);
    /// Only when the migration requests verification.
    pub const HAS_VERIFY: Flags = Flags(0x08);

    pub const fn union(self, other: Flags) -> Flags {
        Flags(self.0 | other.0)
    }

    /// Whether every bit of `required` is set.
    pub fn contains(self, required: Flags) -> bool {
        self.0 & required.0 == required.0
    }

    /// Whether any bit of `wanted` is set.
    pub fn intersects(self, wanted: Flags) -> bool {
        self.0 & wanted.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;
    fn bitor(self, rhs: Flags) -> Flags {
        self.union(rhs)
    }
}

/// One itinerary entry: a phase plus its inclusion predicate.
#[derive(Clone, Copy, Debug)]
pub struct Step {
    pub phase: Phase,
    /// Included only when ALL of these flags are set.
    pub all: Flags,
    /// Included only when ANY of these flags is set (empty: always).
    pub any: Flags,
}

impl Step {
    const fn new(phase: Phase) -> Step {
        Step {
            phase,
            all: Flags::NONE,
            any: Flags::NONE,
        }
    }

    const fn all(phase: Phase, flags: Flags) -> Step {
        Step {
            phase,
            all: flags,
            any: Flags::NONE,
        }
    }

    /// Whether the step is eligible under the given flag set.
    pub fn eligible(&self, flags: Flags) -> bool {
        flags.contains(self.all) && (self.any.is_empty() || flags.intersects(self.any))
    }
}

/// A named, ordered list of steps.
#[derive(Debug)]
pub struct Itinerary {
    pub name: &'static str,
    pub steps: &'static [Step],
}

impl Itinerary {
    /// The first phase of the itinerary.
    pub fn first_phase(&self) -> Phase {
        self.steps.first().map(|s| s.phase).unwrap_or(Phase::Completed)
    }

    /// Progress report: (position, total). Position is 1-based; an unknown
    /// phase reports 0.
    pub fn progress_report(&self, phase: Phase) -> (usize, usize) {
        let position = self
            .steps
            .iter()
            .position(|s| s.phase == phase)
            .map(|i| i + 1)
            .unwrap_or(0);
        (position, self.steps.len())
    }

    /// Index of a phase within the itinerary.
    fn position(&self, phase: Phase) -> Option<usize> {
        self.steps.iter().position(|s| s.phase == phase)
    }
}

/// Volume pre-copy without cut-over.
pub static STAGE_ITINERARY: Itinerary = Itinerary {
    name: "Stage",
    steps: &[
        Step::new(Phase::Created),
        Step::new(Phase::Started),
        Step::new(Phase::Prepare),
        Step::new(Phase::EnsureCloudSecretPropagated),
        Step::all(Phase::EnsureStagePodsFromRunning, Flags::HAS_PVS),
        Step::all(Phase::EnsureStagePodsFromTemplates, Flags::HAS_PVS),
        Step::all(Phase::EnsureStagePodsFromOrphanedPVCs, Flags::HAS_PVS),
        Step::all(Phase::StagePodsCreated, Flags::HAS_STAGE_PODS),
        Step::all(Phase::AnnotateResources, Flags::HAS_PVS),
        Step::all(Phase::RestartResticSidecar, Flags::HAS_STAGE_PODS),
        Step::all(Phase::ResticRestarted, Flags::HAS_STAGE_PODS),
        Step::all(Phase::QuiesceApplications, Flags::QUIESCE),
        Step::all(Phase::EnsureQuiesced, Flags::QUIESCE),
        Step::all(Phase::EnsureStageBackup, Flags::HAS_PVS),
        Step::all(Phase::StageBackupCreated, Flags::HAS_PVS),
        Step::all(Phase::EnsureStageBackupReplicated, Flags::HAS_PVS),
        Step::all(Phase::EnsureStageRestore, Flags::HAS_PVS),
        Step::all(Phase::StageRestoreCreated, Flags::HAS_PVS),
        Step::all(Phase::EnsureStagePodsDeleted, Flags::HAS_STAGE_PODS),
        Step::all(Phase::EnsureStagePodsTerminated, Flags::HAS_STAGE_PODS),
        Step::all(Phase::EnsureAnnotationsDeleted, Flags::HAS_PVS),
        Step::new(Phase::EnsureLabelsDeleted),
        Step::new(Phase::Completed),
    ],
};

/// Final cut-over when the plan migrates PVs.
pub static FINAL_ITINERARY: Itinerary = Itinerary {
    name: "Final",
    steps: &[
        Step::new(Phase::Created),
        Step::new(Phase::Started),
        Step::new(Phase::Prepare),
        Step::new(Phase::EnsureCloudSecretPropagated),
        Step::new(Phase::PreBackupHooks),
        Step::new(Phase::EnsureInitialBackup),
        Step::new(Phase::InitialBackupCreated),
        Step::all(Phase::EnsureStagePodsFromRunning, Flags::HAS_PVS),
        Step::all(Phase::EnsureStagePodsFromTemplates, Flags::HAS_PVS),
        Step::all(Phase::EnsureStagePodsFromOrphanedPVCs, Flags::HAS_PVS),
        Step::all(Phase::StagePodsCreated, Flags::HAS_STAGE_PODS),
        Step::all(Phase::AnnotateResources, Flags::HAS_PVS),
        Step::all(Phase::RestartResticSidecar, Flags::HAS_STAGE_PODS),
        Step::all(Phase::ResticRestarted, Flags::HAS_STAGE_PODS),
        Step::all(Phase::QuiesceApplications, Flags::QUIESCE),
        Step::all(Phase::EnsureQuiesced, Flags::QUIESCE),
        Step::all(Phase::EnsureStageBackup, Flags::HAS_PVS),
        Step::all(Phase::StageBackupCreated, Flags::HAS_PVS),
        Step::all(Phase::EnsureStageBackupReplicated, Flags::HAS_PVS),
        Step::all(Phase::EnsureStageRestore, Flags::HAS_PVS),
        Step::all(Phase::StageRestoreCreated, Flags::HAS_PVS),
        Step::all(Phase::EnsureStagePodsDeleted, Flags::HAS_STAGE_PODS),
        Step::all(Phase::EnsureStagePodsTerminated, Flags::HAS_STAGE_PODS),
        Step::all(Phase::EnsureAnnotationsDeleted, Flags::HAS_PVS),
        Step::new(Phase::EnsureInitialBackupReplicated),
        Step::new(Phase::PostBackupHooks),
        Step::new(Phase::PreRestoreHooks),
        Step::new(Phase::EnsureFinalRestore),
        Step::new(Phase::FinalRestoreCreated),
        Step::new(Phase::EnsureLabelsDeleted),
        Step::new(Phase::PostRestoreHooks),
        Step::all(Phase::Verification, Flags::HAS_VERIFY),
        Step::new(Phase::Completed),
    ],
};

/// Final cut-over with all PV and stage phases elided.
pub static FINAL_NO_PVS_ITINERARY: Itinerary = Itinerary {
    name: "FinalNoPVs",
    steps: &[
        Step::new(Phase::Created),
        Step::new(Phase::Started),
        Step::new(Phase::Prepare),
        Step::new(Phase::EnsureCloudSecretPropagated),
        Step::new(Phase::PreBackupHooks),
        Step::new(Phase::EnsureInitialBackup),
        Step::new(Phase::InitialBackupCreated),
        Step::all(Phase::QuiesceApplications, Flags::QUIESCE),
        Step::all(Phase::EnsureQuiesced, Flags::QUIESCE),
        Step::new(Phase::EnsureInitialBackupReplicated),
        Step::new(Phase::PostBackupHooks),
        Step::new(Phase::PreRestoreHooks),
        Step::new(Phase::EnsureFinalRestore),
        Step::new(Phase::FinalRestoreCreated),
        Step::new(Phase::EnsureLabelsDeleted),
        Step::new(Phase::PostRestoreHooks),
        Step::all(Phase::Verification, Flags::HAS_VERIFY),
        Step::new(Phase::Completed),
    ],
};

/// Cooperative cancellation: issued BR resources are deleted, not
/// interrupted.
pub static CANCEL_ITINERARY: Itinerary = Itinerary {
    name: "Cancel",
    steps: &[
        Step::new(Phase::Canceling),
        Step::new(Phase::DeleteBackups),
        Step::new(Phase::DeleteRestores),
        Step::all(Phase::EnsureStagePodsDeleted, Flags::HAS_STAGE_PODS),
        Step::all(Phase::EnsureAnnotationsDeleted, Flags::HAS_PVS),
        Step::new(Phase::DeleteMigrated),
        Step::new(Phase::EnsureMigratedDeleted),
        Step::all(Phase::UnQuiesceApplications, Flags::QUIESCE),
        Step::new(Phase::Canceled),
        Step::new(Phase::Completed),
    ],
};

/// Rollback after failure.
pub static FAILED_ITINERARY: Itinerary = Itinerary {
    name: "Failed",
    steps: &[
        Step::new(Phase::MigrationFailed),
        Step::all(Phase::EnsureStagePodsDeleted, Flags::HAS_STAGE_PODS),
        Step::all(Phase::EnsureAnnotationsDeleted, Flags::HAS_PVS),
        Step::new(Phase::DeleteMigrated),
        Step::new(Phase::EnsureMigratedDeleted),
        Step::all(Phase::UnQuiesceApplications, Flags::QUIESCE),
        Step::new(Phase::Completed),
    ],
};

/// The next eligible phase after `current` in the itinerary under the
/// given flag set. Off-itinerary phases and exhausted itineraries
/// complete.
pub fn next_phase(itinerary: &Itinerary, current: Phase, flags: Flags) -> Phase {
    let Some(position) = itinerary.position(current) else {
        return Phase::Completed;
    };
    for step in &itinerary.steps[position + 1..] {
        if step.eligible(flags) {
            return step.phase;
        }
    }
    Phase::Completed
}

/// Choose the itinerary for the migration's observed state.
pub fn select_itinerary(
    failed: bool,
    canceled: bool,
    stage: bool,
    migrates_pvs: bool,
) -> &'static Itinerary {
    if failed {
        &FAILED_ITINERARY
    } else if canceled {
        &CANCEL_ITINERARY
    } else if stage {
        &STAGE_ITINERARY
    } else if migrates_pvs {
        &FINAL_ITINERARY
    } else {
        &FINAL_NO_PVS_ITINERARY
    }
}

/// The referenced plan with both clusters resolved to usable clients.
/// Valid for the lifetime of one reconcile tick.
pub struct PlanResources {
    pub plan: MigPlan,
    pub src_cluster: MigCluster,
    pub dest_cluster: MigCluster,
    pub storage: MigStorage,
    pub src_client: CompatClient,
    pub dest_client: CompatClient,
}

/// One migration attempt in flight. Built fresh each reconcile from the
/// persisted phase; dropped after status is written back.
pub struct Task<'a> {
    /// Host-cluster client.
    pub client: kube::Client,
    /// The migration being executed.
    pub owner: &'a mut MigMigration,
    /// Resolved plan and cluster clients.
    pub plan: PlanResources,
    /// Current phase, parsed from status.
    pub phase: Phase,
    /// Requeue after this duration; `None` leaves requeue to the watch.
    pub requeue: Option<Duration>,
    /// Selected itinerary.
    pub itinerary: &'static Itinerary,
    /// Errors accumulated this tick.
    pub errors: Vec<String>,
    /// Progress lines for the current phase.
    pub progress: Vec<String>,
}

impl<'a> Task<'a> {
    /// Create a task resuming from the migration's persisted phase.
    pub fn new(client: kube::Client, owner: &'a mut MigMigration, plan: PlanResources) -> Self {
        let phase = owner
            .status
            .as_ref()
            .and_then(|s| Phase::parse(&s.phase))
            .unwrap_or_default();
        Self {
            client,
            owner,
            plan,
            phase,
            requeue: Some(FAST_REQUEUE),
            itinerary: &STAGE_ITINERARY,
            errors: Vec::new(),
            progress: Vec::new(),
        }
    }

    /// Run one tick: select the itinerary, execute the current phase, and
    /// advance or hold.
    pub async fn run(&mut self) -> Result<()> {
        self.init();
        info!(
            stage = self.stage(),
            itinerary = self.itinerary.name,
            phase = %self.phase,
            "[RUN]"
        );

        match self.phase {
            Phase::Created | Phase::Started => self.next(),
            Phase::Prepare => {
                self.ensure_stage_pods_deleted().await?;
                self.delete_annotations().await?;
                if Settings::get().plan.enable_intelligent_pv_resize && self.has_pvs() {
                    self.collect_volume_usage().await?;
                }
                self.next();
            }
            Phase::EnsureCloudSecretPropagated => {
                if self.cloud_secrets_propagated().await? {
                    self.next();
                } else {
                    self.requeue = Some(POLL_REQUEUE);
                }
            }
            Phase::PreBackupHooks
            | Phase::PostBackupHooks
            | Phase::PreRestoreHooks
            | Phase::PostRestoreHooks => {
                self.run_hook_phase().await?;
            }
            Phase::EnsureInitialBackup => {
                self.ensure_initial_backup().await?;
                self.requeue = None;
                self.next();
            }
            Phase::InitialBackupCreated => {
                self.observe_backup_phase(BackupKind::Initial).await?;
            }
            Phase::AnnotateResources => {
                self.annotate_stage_resources().await?;
                self.next();
            }
            Phase::EnsureStagePodsFromRunning => {
                self.ensure_stage_pods_from_running().await?;
                self.requeue = None;
                self.next();
            }
            Phase::EnsureStagePodsFromTemplates => {
                self.ensure_stage_pods_from_templates().await?;
                self.requeue = None;
                self.next();
            }
            Phase::EnsureStagePodsFromOrphanedPVCs => {
                self.ensure_stage_pods_from_orphaned_pvcs().await?;
                self.requeue = None;
                self.next();
            }
            Phase::StagePodsCreated => {
                let report = self.stage_pods_started().await?;
                self.progress.extend(report.progress);
                if report.failed {
                    let reasons = report.reasons;
                    self.fail(Phase::MigrationFailed, reasons);
                } else if report.started {
                    self.next();
                } else {
                    self.requeue = None;
                }
            }
            Phase::RestartResticSidecar => {
                self.restart_restic_pods().await?;
                self.requeue = Some(POLL_REQUEUE);
                self.next();
            }
            Phase::ResticRestarted => {
                if self.restic_pods_started().await? {
                    self.next();
                } else {
                    self.requeue = Some(POLL_REQUEUE);
                }
            }
            Phase::QuiesceApplications => {
                self.quiesce_applications().await?;
                self.next();
            }
            Phase::EnsureQuiesced => {
                if self.quiesced_pods_terminated().await? {
                    self.next();
                } else {
                    self.requeue = Some(POLL_REQUEUE);
                }
            }
            Phase::UnQuiesceApplications => {
                self.unquiesce_applications().await?;
                self.next();
            }
            Phase::EnsureStageBackup => {
                self.ensure_stage_backup().await?;
                self.requeue = None;
                self.next();
            }
            Phase::StageBackupCreated => {
                self.observe_backup_phase(BackupKind::Stage).await?;
            }
            Phase::EnsureInitialBackupReplicated => {
                self.observe_backup_replicated(BackupKind::Initial).await?;
            }
            Phase::EnsureStageBackupReplicated => {
                self.observe_backup_replicated(BackupKind::Stage).await?;
            }
            Phase::EnsureStageRestore => {
                self.ensure_stage_restore().await?;
                self.requeue = None;
                self.next();
            }
            Phase::StageRestoreCreated => {
                self.observe_restore_phase(RestoreKind::Stage).await?;
            }
            Phase::EnsureFinalRestore => {
                self.ensure_final_restore().await?;
                self.requeue = None;
                self.next();
            }
            Phase::FinalRestoreCreated => {
                self.observe_restore_phase(RestoreKind::Final).await?;
            }
            Phase::Verification => {
                if self.verification_completed().await? {
                    self.next();
                } else {
                    self.requeue = Some(POLL_REQUEUE);
                }
            }
            Phase::EnsureStagePodsDeleted => {
                self.ensure_stage_pods_deleted().await?;
                self.next();
            }
            Phase::EnsureStagePodsTerminated => {
                if self.stage_pods_terminated().await? {
                    self.next();
                } else {
                    self.requeue = Some(POLL_REQUEUE);
                }
            }
            Phase::EnsureAnnotationsDeleted => {
                if !self.keep_annotations() {
                    self.delete_annotations().await?;
                }
                self.next();
            }
            Phase::EnsureLabelsDeleted => {
                if !self.keep_annotations() {
                    self.delete_labels().await?;
                }
                self.next();
            }
            Phase::DeleteMigrated => {
                self.delete_migrated().await?;
                self.next();
            }
            Phase::EnsureMigratedDeleted => {
                if self.migrated_resources_deleted().await? {
                    self.next();
                } else {
                    self.requeue = Some(POLL_REQUEUE);
                }
            }
            Phase::DeleteBackups => {
                self.delete_backups().await?;
                self.next();
            }
            Phase::DeleteRestores => {
                self.delete_restores().await?;
                self.next();
            }
            Phase::Canceling => {
                self.conditions().set(
                    Condition::new(CANCELING, TRUE, Category::Advisory)
                        .reason("Canceled")
                        .message(CANCEL_IN_PROGRESS_MESSAGE)
                        .durable(true),
                );
                self.next();
            }
            Phase::Canceled => {
                self.conditions().delete(CANCELING);
                self.conditions().set(
                    Condition::new(CANCELED, TRUE, Category::Advisory)
                        .reason("Canceled")
                        .message(CANCELED_MESSAGE)
                        .durable(true),
                );
                self.next();
            }
            Phase::MigrationFailed => {
                if Settings::get().migration.failure_rollback {
                    self.next();
                } else {
                    self.phase = Phase::Completed;
                }
            }
            // Out-of-tree phases reached only through fail().
            Phase::InitialBackupFailed
            | Phase::StageBackupFailed
            | Phase::StageRestoreFailed
            | Phase::FinalRestoreFailed
            | Phase::PreBackupHooksFailed
            | Phase::PostBackupHooksFailed
            | Phase::PreRestoreHooksFailed
            | Phase::PostRestoreHooksFailed => {
                self.requeue = None;
                self.next();
            }
            Phase::Completed => {}
        }

        if self.phase == Phase::Completed {
            self.requeue = None;
            info!("[COMPLETED]");
        }

        Ok(())
    }

    /// Select the itinerary and reset the phase when it changed.
    fn init(&mut self) {
        self.requeue = Some(FAST_REQUEUE);
        self.itinerary = select_itinerary(
            self.failed(),
            self.canceled(),
            self.stage(),
            self.plan.plan.migrates_pvs_in_final(),
        );
        let recorded = self
            .owner
            .status
            .as_ref()
            .map(|s| s.itinerary.clone())
            .unwrap_or_default();
        if recorded != self.itinerary.name {
            self.phase = self.itinerary.first_phase();
        }
        if self.stage() && !self.has_pvs() {
            self.conditions().set(
                Condition::new(STAGE_NO_OP, TRUE, Category::Warn)
                    .message(STAGE_NO_OP_MESSAGE)
                    .durable(true),
            );
        }
    }

    /// Advance to the next eligible step, skipping steps whose flags do
    /// not hold. Falling off the end (or starting off-itinerary) completes.
    pub fn next(&mut self) {
        self.phase = next_phase(self.itinerary, self.phase, self.flags());
    }

    /// The only path to a failure phase: record reasons, set the durable
    /// Failed condition with the failing phase as reason, and jump.
    pub fn fail(&mut self, next_phase: Phase, reasons: Vec<String>) {
        let failed_at = self.phase;
        let message = if reasons.is_empty() {
            FAILED_MESSAGE.to_string()
        } else {
            format!("{FAILED_MESSAGE} {}", reasons.join(" "))
        };
        self.errors.extend(reasons);
        let errors = self.errors.clone();
        self.owner.add_errors(&errors);
        self.conditions().set(
            Condition::new(FAILED, TRUE, Category::Advisory)
                .reason(failed_at.as_str())
                .message(message)
                .durable(true),
        );
        self.phase = next_phase;
    }

    /// Flag set derived from the plan and migration for this tick.
    pub fn flags(&self) -> Flags {
        let mut flags = Flags::NONE;
        if self.has_pvs() {
            flags = flags | Flags::HAS_PVS;
        }
        if self.has_stage_pods() {
            flags = flags | Flags::HAS_STAGE_PODS;
        }
        if self.quiesce() {
            flags = flags | Flags::QUIESCE;
        }
        if self.has_verify() {
            flags = flags | Flags::HAS_VERIFY;
        }
        flags
    }

    pub fn conditions(&mut self) -> &mut crate::crd::Conditions {
        &mut self
            .owner
            .status
            .get_or_insert_with(Default::default)
            .conditions
    }

    /// Migration UID, used in correlation labels.
    pub fn uid(&self) -> String {
        kube::ResourceExt::uid(self.owner).unwrap_or_default()
    }

    pub fn failed(&self) -> bool {
        self.owner.has_errors()
            || self
                .owner
                .status
                .as_ref()
                .is_some_and(|s| s.conditions.has(FAILED))
    }

    pub fn canceled(&self) -> bool {
        self.owner.spec.canceled
            || self
                .owner
                .status
                .as_ref()
                .is_some_and(|s| s.conditions.has_any(&[CANCELED, CANCELING]))
    }

    pub fn stage(&self) -> bool {
        self.owner.spec.stage
    }

    pub fn quiesce(&self) -> bool {
        self.owner.spec.quiesce_pods
    }

    pub fn keep_annotations(&self) -> bool {
        self.owner.spec.keep_annotations
    }

    pub fn has_verify(&self) -> bool {
        self.owner.spec.verify
    }

    pub fn has_pvs(&self) -> bool {
        self.plan.plan.has_pvs()
    }

    pub fn has_stage_pods(&self) -> bool {
        self.owner
            .status
            .as_ref()
            .is_some_and(|s| s.conditions.has(STAGE_PODS_CREATED))
    }

    pub fn source_namespaces(&self) -> Vec<String> {
        self.plan.plan.source_namespaces()
    }

    pub fn destination_namespaces(&self) -> Vec<String> {
        self.plan.plan.destination_namespaces()
    }

    /// Claims included in the plan (not skipped), keyed by namespace/name.
    pub fn pvc_mapping(&self) -> std::collections::BTreeMap<PvcRef, PlanPv> {
        self.plan
            .plan
            .included_pvs()
            .into_iter()
            .map(|pv| (pv.pvc.clone(), pv.clone()))
            .collect()
    }

    /// Correlation labels for resources owned by this migration: plan and
    /// migration labels merged.
    pub fn correlation_labels(&self) -> std::collections::BTreeMap<String, String> {
        crate::resources::common::merged_labels(
            self.plan.plan.correlation_labels(),
            self.owner.correlation_labels(),
        )
    }
}

/// Which logical backup a phase observes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BackupKind {
    Initial,
    Stage,
}

/// Which restore a phase observes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RestoreKind {
    Stage,
    Final,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_round_trip() {
        for phase in ALL_PHASES {
            assert_eq!(Phase::parse(phase.as_str()), Some(*phase));
        }
        assert_eq!(Phase::parse(""), Some(Phase::Created));
        assert_eq!(Phase::parse("NotAPhase"), None);
    }

    #[test]
    fn test_step_eligibility() {
        let step = Step::all(Phase::EnsureStageBackup, Flags::HAS_PVS);
        assert!(step.eligible(Flags::HAS_PVS));
        assert!(step.eligible(Flags::HAS_PVS | Flags::QUIESCE));
        assert!(!step.eligible(Flags::QUIESCE));
        assert!(!step.eligible(Flags::NONE));
    }

    #[test]
    fn test_select_itinerary_priority() {
        assert_eq!(select_itinerary(true, true, true, true).name, "Failed");
        assert_eq!(select_itinerary(false, true, true, true).name, "Cancel");
        assert_eq!(select_itinerary(false, false, true, true).name, "Stage");
        assert_eq!(select_itinerary(false, false, false, true).name, "Final");
        assert_eq!(
            select_itinerary(false, false, false, false).name,
            "FinalNoPVs"
        );
    }

    #[test]
    fn test_itineraries_terminate_in_completed() {
        for itinerary in [
            &STAGE_ITINERARY,
            &FINAL_ITINERARY,
            &FINAL_NO_PVS_ITINERARY,
            &CANCEL_ITINERARY,
            &FAILED_ITINERARY,
        ] {
            assert_eq!(
                itinerary.steps.last().map(|s| s.phase),
                Some(Phase::Completed),
                "{} must end in Completed",
                itinerary.name
            );
        }
    }

    #[test]
    fn test_progress_report() {
        let (n, total) = STAGE_ITINERARY.progress_report(Phase::Prepare);
        assert_eq!(n, 3);
        assert_eq!(total, STAGE_ITINERARY.steps.len());

        let (n, _) = STAGE_ITINERARY.progress_report(Phase::EnsureFinalRestore);
        assert_eq!(n, 0);
    }

    #[test]
    fn test_final_itinerary_orders_backup_before_restore() {
        let backup = FINAL_ITINERARY.position(Phase::EnsureStageBackup).unwrap();
        let replicated = FINAL_ITINERARY
            .position(Phase::EnsureStageBackupReplicated)
            .unwrap();
        let restore = FINAL_ITINERARY.position(Phase::EnsureStageRestore).unwrap();
        let pods_deleted = FINAL_ITINERARY
            .position(Phase::EnsureStagePodsDeleted)
            .unwrap();
        assert!(backup < replicated);
        assert!(replicated < restore);
        assert!(restore < pods_deleted);
    }
}
