//! Mock migration state for functional tests.
//!
//! Instead of duplicating engine logic, this mock:
//! 1. Uses the actual `select_itinerary` and `next_phase` functions
//! 2. Simulates only the externally observable state (flags, phase)
//! 3. Tracks the walked phase sequence for assertions
//!
//! This keeps the tests in sync with production behavior automatically.

use migration_operator::controller::migration::task::{
    Flags, Itinerary, Phase, next_phase, select_itinerary,
};

/// The logical state of one migration, as the engine observes it.
#[derive(Clone, Debug)]
pub struct MockMigrationState {
    /// Stage migration (volume pre-copy) instead of final cut-over.
    pub stage: bool,
    /// The plan selects at least one non-skip PV.
    pub has_pvs: bool,
    /// Quiesce was requested.
    pub quiesce: bool,
    /// Verification was requested.
    pub verify: bool,
    /// Stage pods were created (durable condition).
    pub has_stage_pods: bool,
    /// The migration was canceled.
    pub canceled: bool,
    /// Errors or a Failed condition are present.
    pub failed: bool,
    /// Current phase.
    pub phase: Phase,
    /// Itinerary recorded in status.
    pub itinerary_name: &'static str,
}

impl MockMigrationState {
    /// A fresh stage migration.
    pub fn stage(has_pvs: bool) -> Self {
        Self {
            stage: true,
            has_pvs,
            quiesce: false,
            verify: false,
            has_stage_pods: false,
            canceled: false,
            failed: false,
            phase: Phase::Created,
            itinerary_name: "",
        }
    }

    /// A fresh final migration.
    pub fn final_migration(has_pvs: bool) -> Self {
        Self {
            stage: false,
            has_pvs,
            quiesce: false,
            verify: false,
            has_stage_pods: false,
            canceled: false,
            failed: false,
            phase: Phase::Created,
            itinerary_name: "",
        }
    }

    pub fn with_quiesce(mut self) -> Self {
        self.quiesce = true;
        self
    }

    pub fn with_verify(mut self) -> Self {
        self.verify = true;
        self
    }

    /// The flag set the engine would derive this tick.
    pub fn flags(&self) -> Flags {
        let mut flags = Flags::NONE;
        if self.has_pvs {
            flags = flags | Flags::HAS_PVS;
        }
        if self.has_stage_pods {
            flags = flags | Flags::HAS_STAGE_PODS;
        }
        if self.quiesce {
            flags = flags | Flags::QUIESCE;
        }
        if self.verify {
            flags = flags | Flags::HAS_VERIFY;
        }
        flags
    }

    /// Select the itinerary as the engine's init step would, resetting the
    /// phase when the itinerary changed.
    pub fn select(&mut self) -> &'static Itinerary {
        let itinerary = select_itinerary(
            self.failed,
            self.canceled,
            self.stage,
            // The plan migrates PVs in final exactly when it has any.
            self.has_pvs,
        );
        if self.itinerary_name != itinerary.name {
            self.itinerary_name = itinerary.name;
            self.phase = itinerary.first_phase();
        }
        itinerary
    }

    /// One engine advance, simulating side effects on the flags: stage
    /// pod creation phases set the stage-pod condition, termination
    /// clears it.
    pub fn step(&mut self) {
        let itinerary = self.select();

        // Simulate the durable StagePodsCreated condition the handlers
        // maintain.
        match self.phase {
            Phase::EnsureStagePodsFromRunning
            | Phase::EnsureStagePodsFromTemplates
            | Phase::EnsureStagePodsFromOrphanedPVCs => {
                if self.has_pvs {
                    self.has_stage_pods = true;
                }
            }
            Phase::EnsureStagePodsTerminated => {
                self.has_stage_pods = false;
            }
            _ => {}
        }

        self.phase = next_phase(itinerary, self.phase, self.flags());
    }

    /// Walk until Completed (or a step budget runs out), returning every
    /// phase visited in order.
    pub fn walk(&mut self) -> Vec<Phase> {
        let mut visited = vec![self.phase];
        for _ in 0..128 {
            if self.phase == Phase::Completed {
                break;
            }
            self.step();
            visited.push(self.phase);
        }
        assert_eq!(self.phase, Phase::Completed, "walk did not terminate");
        visited
    }
}
