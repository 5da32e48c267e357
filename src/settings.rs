//! Environment-derived configuration.
//!
//! Loaded once at startup and shared read-only. Every knob has a documented
//! default; parse failures abort startup rather than run with a half-read
//! configuration.

use std::sync::OnceLock;

/// Environment variable names.
pub const NS_LIMIT: &str = "NAMESPACE_LIMIT";
pub const POD_LIMIT: &str = "POD_LIMIT";
pub const PV_LIMIT: &str = "PV_LIMIT";
pub const EXCLUDED_RESOURCES: &str = "EXCLUDED_RESOURCES";
pub const ENABLE_INTELLIGENT_PV_RESIZE: &str = "ENABLE_INTELLIGENT_PV_RESIZE";
pub const MIGRATION_FAILURE_ROLLBACK: &str = "MIGRATION_FAILURE_ROLLBACK";
pub const STAGE_POD_IMAGE: &str = "STAGE_POD_IMAGE";
pub const HOOK_RUNNER_IMAGE: &str = "HOOK_RUNNER_IMAGE";
pub const RSYNC_TRANSFER_IMAGE: &str = "RSYNC_TRANSFER_IMAGE";
pub const CORS_ALLOWED_ORIGINS: &str = "CORS_ALLOWED_ORIGINS";

/// Resource kinds tracked for exclusion defaults.
pub const IS_RESOURCE: &str = "imagestreams";
pub const PV_RESOURCE: &str = "persistentvolumes";
pub const PVC_RESOURCE: &str = "persistentvolumeclaims";

/// Plan limits and feature flags.
#[derive(Clone, Debug)]
pub struct PlanSettings {
    /// Maximum number of namespaces on a plan.
    pub ns_limit: usize,
    /// Maximum number of pods across a plan's namespaces.
    pub pod_limit: usize,
    /// Maximum number of PVs on a plan.
    pub pv_limit: usize,
    /// Recompute destination PVC sizes from observed usage.
    pub enable_intelligent_pv_resize: bool,
    /// Resource kinds excluded from every plan.
    pub excluded_resources: Vec<String>,
}

/// Migration behavior flags.
#[derive(Clone, Debug)]
pub struct MigrationSettings {
    /// Run the rollback itinerary when a migration fails. When disabled the
    /// failed itinerary collapses straight to Completed.
    pub failure_rollback: bool,
    /// Image for stage pods.
    pub stage_pod_image: String,
    /// Image for hook jobs without a custom image.
    pub hook_runner_image: String,
    /// Image for rsync transfer and client pods.
    pub rsync_transfer_image: String,
}

/// Discovery API settings.
#[derive(Clone, Debug)]
pub struct DiscoverySettings {
    /// Origins allowed by the read-only inventory API.
    pub cors_allowed_origins: Vec<String>,
}

/// All operator settings.
#[derive(Clone, Debug)]
pub struct Settings {
    pub plan: PlanSettings,
    pub migration: MigrationSettings,
    pub discovery: DiscoverySettings,
}

static SETTINGS: OnceLock<Settings> = OnceLock::new();

impl Settings {
    /// Load settings from the environment.
    pub fn load() -> Result<Self, SettingsError> {
        Ok(Self {
            plan: PlanSettings {
                ns_limit: env_limit(NS_LIMIT, 10)?,
                pod_limit: env_limit(POD_LIMIT, 100)?,
                pv_limit: env_limit(PV_LIMIT, 100)?,
                enable_intelligent_pv_resize: env_bool(ENABLE_INTELLIGENT_PV_RESIZE, false)?,
                excluded_resources: env_list(EXCLUDED_RESOURCES),
            },
            migration: MigrationSettings {
                failure_rollback: env_bool(MIGRATION_FAILURE_ROLLBACK, false)?,
                stage_pod_image: env_string(STAGE_POD_IMAGE, "registry.access.redhat.com/ubi8/ubi-minimal:latest"),
                hook_runner_image: env_string(HOOK_RUNNER_IMAGE, "quay.io/konveyor/hook-runner:latest"),
                rsync_transfer_image: env_string(RSYNC_TRANSFER_IMAGE, "quay.io/konveyor/rsync-transfer:latest"),
            },
            discovery: DiscoverySettings {
                cors_allowed_origins: env_list(CORS_ALLOWED_ORIGINS),
            },
        })
    }

    /// Initialize the process-wide settings. Called once from main so a
    /// bad value surfaces as a startup error instead of a panic.
    pub fn init() -> Result<&'static Self, SettingsError> {
        if SETTINGS.get().is_none() {
            let loaded = Self::load()?;
            let _ = SETTINGS.set(loaded);
        }
        Ok(Self::get())
    }

    /// Access the process-wide settings, loading from the environment on
    /// first use if [`Settings::init`] has not run. An unparseable value
    /// aborts the process; running with a half-read configuration is
    /// never an option.
    pub fn get() -> &'static Self {
        SETTINGS.get_or_init(|| match Self::load() {
            Ok(settings) => settings,
            Err(e) => panic!("invalid environment configuration: {e}"),
        })
    }
}

/// Error parsing an environment variable.
#[derive(Debug, thiserror::Error)]
#[error("invalid value for {variable}: {value}")]
pub struct SettingsError {
    pub variable: String,
    pub value: String,
}

fn env_limit(name: &str, default: usize) -> Result<usize, SettingsError> {
    match std::env::var(name) {
        Ok(value) => value.parse().map_err(|_| SettingsError {
            variable: name.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool, SettingsError> {
    match std::env::var(name) {
        Ok(value) => match value.as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(SettingsError {
                variable: name.to_string(),
                value,
            }),
        },
        Err(_) => Ok(default),
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_list(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Kinds included in the initial (resource) backup. Empty means all.
pub fn included_initial_resources() -> Vec<String> {
    Vec::new()
}

/// Kinds excluded from the initial backup by default.
pub fn excluded_initial_resources() -> Vec<String> {
    vec![
        IS_RESOURCE.to_string(),
        PV_RESOURCE.to_string(),
        PVC_RESOURCE.to_string(),
    ]
}

/// Kinds included in the stage (volume) backup.
pub fn included_stage_resources() -> Vec<String> {
    vec![
        "serviceaccounts".to_string(),
        PV_RESOURCE.to_string(),
        PVC_RESOURCE.to_string(),
        "namespaces".to_string(),
        IS_RESOURCE.to_string(),
        "secrets".to_string(),
        "configmaps".to_string(),
        "pods".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::load().unwrap();
        assert_eq!(settings.plan.ns_limit, 10);
        assert_eq!(settings.plan.pod_limit, 100);
        assert_eq!(settings.plan.pv_limit, 100);
        assert!(!settings.plan.enable_intelligent_pv_resize);
        assert!(!settings.migration.failure_rollback);
    }

    #[test]
    fn test_stage_resources_cover_volume_reconstruction() {
        let kinds = included_stage_resources();
        for kind in [
            "persistentvolumes",
            "persistentvolumeclaims",
            "namespaces",
            "pods",
        ] {
            assert!(kinds.contains(&kind.to_string()), "missing {kind}");
        }
    }
}
