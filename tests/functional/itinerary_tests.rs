//! Phase-walk tests for the migration itineraries.
//!
//! Each test drives the production itinerary selection and advancement
//! against mocked migration state and asserts the observed phase order.

use migration_operator::controller::migration::task::{
    CANCEL_ITINERARY, FAILED_ITINERARY, FINAL_ITINERARY, Phase, STAGE_ITINERARY,
};

use crate::MockMigrationState;

fn position(phases: &[Phase], phase: Phase) -> Option<usize> {
    phases.iter().position(|p| *p == phase)
}

#[test]
fn test_stage_with_one_pvc() {
    let mut state = MockMigrationState::stage(true);
    let visited = state.walk();

    // Stage pods are created, backed up, restored, and torn down, in that
    // order.
    let created = position(&visited, Phase::EnsureStagePodsFromRunning).unwrap();
    let backup = position(&visited, Phase::EnsureStageBackup).unwrap();
    let replicated = position(&visited, Phase::EnsureStageBackupReplicated).unwrap();
    let restore = position(&visited, Phase::EnsureStageRestore).unwrap();
    let deleted = position(&visited, Phase::EnsureStagePodsDeleted).unwrap();
    let terminated = position(&visited, Phase::EnsureStagePodsTerminated).unwrap();
    assert!(created < backup);
    assert!(backup < replicated);
    assert!(replicated < restore);
    assert!(restore < deleted);
    assert!(deleted < terminated);

    assert_eq!(visited.last(), Some(&Phase::Completed));
    // Stage pods were torn down before completion.
    assert!(!state.has_stage_pods);
    // No quiesce was requested, so no quiesce phase ran.
    assert_eq!(position(&visited, Phase::QuiesceApplications), None);
}

#[test]
fn test_stage_without_pvs_skips_all_pv_phases() {
    let mut state = MockMigrationState::stage(false);
    let visited = state.walk();

    for phase in [
        Phase::EnsureStagePodsFromRunning,
        Phase::EnsureStagePodsFromTemplates,
        Phase::EnsureStagePodsFromOrphanedPVCs,
        Phase::StagePodsCreated,
        Phase::AnnotateResources,
        Phase::EnsureStageBackup,
        Phase::StageBackupCreated,
        Phase::EnsureStageBackupReplicated,
        Phase::EnsureStageRestore,
        Phase::StageRestoreCreated,
        Phase::EnsureAnnotationsDeleted,
    ] {
        assert_eq!(position(&visited, phase), None, "{phase:?} should be skipped");
    }
    assert_eq!(visited.last(), Some(&Phase::Completed));
}

#[test]
fn test_final_with_hooks_and_quiesce() {
    let mut state = MockMigrationState::final_migration(true)
        .with_quiesce()
        .with_verify();
    let visited = state.walk();

    // Hooks bracket the backup and restore.
    let pre_backup = position(&visited, Phase::PreBackupHooks).unwrap();
    let initial_backup = position(&visited, Phase::EnsureInitialBackup).unwrap();
    let post_backup = position(&visited, Phase::PostBackupHooks).unwrap();
    let pre_restore = position(&visited, Phase::PreRestoreHooks).unwrap();
    let final_restore = position(&visited, Phase::EnsureFinalRestore).unwrap();
    let post_restore = position(&visited, Phase::PostRestoreHooks).unwrap();
    assert!(pre_backup < initial_backup);
    assert!(initial_backup < post_backup);
    assert!(post_backup < pre_restore);
    assert!(pre_restore < final_restore);
    assert!(final_restore < post_restore);

    // Quiesce runs before the stage backup captures volumes.
    let quiesce = position(&visited, Phase::QuiesceApplications).unwrap();
    let stage_backup = position(&visited, Phase::EnsureStageBackup).unwrap();
    assert!(quiesce < stage_backup);

    // Verification runs last before completion.
    let verification = position(&visited, Phase::Verification).unwrap();
    assert!(post_restore < verification);
    assert_eq!(visited.last(), Some(&Phase::Completed));
}

#[test]
fn test_final_no_pvs_elides_stage_machinery() {
    let mut state = MockMigrationState::final_migration(false);
    let visited = state.walk();

    assert!(position(&visited, Phase::EnsureInitialBackup).is_some());
    assert!(position(&visited, Phase::EnsureFinalRestore).is_some());
    assert_eq!(position(&visited, Phase::EnsureStageBackup), None);
    assert_eq!(position(&visited, Phase::EnsureStagePodsFromRunning), None);
    assert_eq!(visited.last(), Some(&Phase::Completed));
}

#[test]
fn test_failure_splices_in_failed_itinerary() {
    let mut state = MockMigrationState::final_migration(true).with_quiesce();

    // Advance partway into the final itinerary.
    for _ in 0..8 {
        state.step();
    }
    assert_eq!(state.itinerary_name, FINAL_ITINERARY.name);

    // A phase failure records errors; the next tick selects Failed and
    // resets to its first step.
    state.failed = true;
    state.step();
    assert_eq!(state.itinerary_name, FAILED_ITINERARY.name);

    let visited = state.walk();
    // Rollback un-quiesces the source applications.
    assert!(position(&visited, Phase::UnQuiesceApplications).is_some());
    assert_eq!(visited.last(), Some(&Phase::Completed));
}

#[test]
fn test_cancellation_mid_migration() {
    let mut state = MockMigrationState::final_migration(true);

    // Run until stage pods exist.
    while !state.has_stage_pods {
        state.step();
    }

    // User cancels; the next tick switches to the cancel itinerary.
    state.canceled = true;
    state.step();
    assert_eq!(state.itinerary_name, CANCEL_ITINERARY.name);

    let visited = state.walk();
    let backups = position(&visited, Phase::DeleteBackups).unwrap();
    let restores = position(&visited, Phase::DeleteRestores).unwrap();
    let pods = position(&visited, Phase::EnsureStagePodsDeleted).unwrap();
    let canceled = position(&visited, Phase::Canceled).unwrap();
    assert!(backups < restores);
    assert!(restores < pods);
    assert!(pods < canceled);
    assert_eq!(visited.last(), Some(&Phase::Completed));
}

#[test]
fn test_cancel_beats_stage_selection() {
    let mut state = MockMigrationState::stage(true);
    state.canceled = true;
    let itinerary = state.select();
    assert_eq!(itinerary.name, CANCEL_ITINERARY.name);
    assert_eq!(state.phase, Phase::Canceling);
}

#[test]
fn test_phase_monotonicity_within_itinerary() {
    for mut state in [
        MockMigrationState::stage(true),
        MockMigrationState::stage(false),
        MockMigrationState::final_migration(true).with_quiesce().with_verify(),
        MockMigrationState::final_migration(false),
    ] {
        let visited = state.walk();
        let itinerary = state.select();
        let mut last_index = 0;
        for phase in &visited {
            let index = itinerary
                .steps
                .iter()
                .position(|s| s.phase == *phase)
                .unwrap_or_else(|| panic!("{phase:?} not in {}", itinerary.name));
            assert!(
                index >= last_index,
                "{phase:?} moved backwards in {}",
                itinerary.name
            );
            last_index = index;
        }
    }
}

#[test]
fn test_flag_filtered_steps_never_observed() {
    // Property: a step gated on HasPVs is never the observed phase when
    // the plan has zero non-skip PVs.
    let mut state = MockMigrationState::stage(false);
    let visited = state.walk();
    for step in STAGE_ITINERARY.steps {
        if step.all.contains(migration_operator::controller::migration::task::Flags::HAS_PVS) {
            assert_eq!(position(&visited, step.phase), None);
        }
    }
}
