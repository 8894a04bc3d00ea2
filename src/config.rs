//! Configuration: campaign parameters, validation, version selectors
//!
//! Input errors fail fast before any state is touched: conflicting budget
//! options, non-positive budgets, zero workers, unknown subsystem versions.

use crate::mutator::MutatorKind;
use crate::scheduler::SchedulerKind;
use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_TIMEOUT_SECS: f64 = 10.0;
pub const DEFAULT_ITERATIONS: u64 = 1000;

/// Promotion thresholds when `--promote-threshold` is not given: the
/// single-worker loop promotes only clearly interesting inputs, the
/// multi-worker loop catches any positive signal.
pub const SINGLE_WORKER_PROMOTE_THRESHOLD: f64 = 0.5;
pub const MULTI_WORKER_PROMOTE_THRESHOLD: f64 = 0.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("--iterations and --hours are mutually exclusive")]
    ConflictingBudgets,
    #[error("hours must be positive")]
    NonPositiveHours,
    #[error("timeout must be positive")]
    NonPositiveTimeout,
    #[error("workers must be at least 1")]
    ZeroWorkers,
    #[error("min-energy must be <= max-energy")]
    InvertedEnergyBounds,
    #[error("unknown {subsystem} version '{name}'; known versions: {known}")]
    UnknownVersion {
        subsystem: &'static str,
        name: String,
        known: String,
    },
}

/// Either an iteration budget or a wall-clock budget, never both.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Budget {
    Iterations(u64),
    Hours(f64),
}

impl Budget {
    pub fn from_args(iterations: Option<u64>, hours: Option<f64>) -> Result<Self, ConfigError> {
        match (iterations, hours) {
            (Some(_), Some(_)) => Err(ConfigError::ConflictingBudgets),
            (Some(iterations), None) => {
                if iterations == 0 {
                    // Zero is allowed as an explicit no-op campaign.
                    Ok(Budget::Iterations(0))
                } else {
                    Ok(Budget::Iterations(iterations))
                }
            }
            (None, Some(hours)) => {
                if hours > 0.0 {
                    Ok(Budget::Hours(hours))
                } else {
                    Err(ConfigError::NonPositiveHours)
                }
            }
            (None, None) => Ok(Budget::Iterations(DEFAULT_ITERATIONS)),
        }
    }

    pub fn iteration_limit(&self) -> Option<u64> {
        match self {
            Budget::Iterations(n) => Some(*n),
            Budget::Hours(_) => None,
        }
    }

    pub fn hours_limit(&self) -> Option<f64> {
        match self {
            Budget::Iterations(_) => None,
            Budget::Hours(h) => Some(*h),
        }
    }
}

/// Per-subsystem implementation selectors, resolved through the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsystemVersions {
    pub isinteresting: String,
    pub mutator: String,
    pub parser: String,
    pub power_scheduler: String,
    pub seed_corpus: String,
}

impl Default for SubsystemVersions {
    fn default() -> Self {
        Self {
            isinteresting: "base".to_string(),
            mutator: "base".to_string(),
            parser: "base".to_string(),
            power_scheduler: "base".to_string(),
            seed_corpus: "base".to_string(),
        }
    }
}

/// Registered implementations per subsystem. One entry each today; the
/// table is the extension point for alternates.
const VERSION_REGISTRY: &[(&str, &[&str])] = &[
    ("isinteresting", &["base"]),
    ("mutator", &["base"]),
    ("parser", &["base"]),
    ("power_scheduler", &["base"]),
    ("seed_corpus", &["base"]),
];

pub fn resolve_version(subsystem: &'static str, name: &str) -> Result<(), ConfigError> {
    let known = VERSION_REGISTRY
        .iter()
        .find(|(key, _)| *key == subsystem)
        .map(|(_, versions)| *versions)
        .unwrap_or(&[]);
    if known.contains(&name) {
        Ok(())
    } else {
        Err(ConfigError::UnknownVersion {
            subsystem,
            name: name.to_string(),
            known: known.join(", "),
        })
    }
}

impl SubsystemVersions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        resolve_version("isinteresting", &self.isinteresting)?;
        resolve_version("mutator", &self.mutator)?;
        resolve_version("parser", &self.parser)?;
        resolve_version("power_scheduler", &self.power_scheduler)?;
        resolve_version("seed_corpus", &self.seed_corpus)?;
        Ok(())
    }
}

/// Fully parsed campaign configuration.
#[derive(Debug, Clone)]
pub struct FuzzConfig {
    pub target: String,
    pub scheduler_kind: SchedulerKind,
    pub mutator_kind: MutatorKind,
    pub budget: Budget,
    pub timeout_secs: f64,
    pub rng_seed: Option<u64>,
    pub workers: usize,
    pub db_path: PathBuf,
    pub corpus_dir: PathBuf,
    pub targets_dir: PathBuf,
    pub targets_file: Option<PathBuf>,
    pub promote_threshold: Option<f64>,
    pub min_energy: u32,
    pub max_energy: u32,
    pub versions: SubsystemVersions,
}

impl FuzzConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_secs <= 0.0 {
            return Err(ConfigError::NonPositiveTimeout);
        }
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.min_energy > self.max_energy {
            return Err(ConfigError::InvertedEnergyBounds);
        }
        if let Budget::Hours(hours) = self.budget {
            if hours <= 0.0 {
                return Err(ConfigError::NonPositiveHours);
            }
        }
        self.versions.validate()
    }

    /// Promotion threshold, with the per-mode default applied.
    pub fn effective_promote_threshold(&self) -> f64 {
        self.promote_threshold.unwrap_or(if self.workers > 1 {
            MULTI_WORKER_PROMOTE_THRESHOLD
        } else {
            SINGLE_WORKER_PROMOTE_THRESHOLD
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> FuzzConfig {
        FuzzConfig {
            target: "json-decoder".to_string(),
            scheduler_kind: SchedulerKind::Heap,
            mutator_kind: MutatorKind::Auto,
            budget: Budget::Iterations(100),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            rng_seed: Some(42),
            workers: 1,
            db_path: PathBuf::from("runs.sqlite"),
            corpus_dir: PathBuf::from("seed_corpus"),
            targets_dir: PathBuf::from("targets"),
            targets_file: None,
            promote_threshold: None,
            min_energy: 1,
            max_energy: 128,
            versions: SubsystemVersions::default(),
        }
    }

    #[test]
    fn test_budget_conflict() {
        assert!(matches!(
            Budget::from_args(Some(10), Some(1.0)),
            Err(ConfigError::ConflictingBudgets)
        ));
        assert_eq!(
            Budget::from_args(None, None).unwrap(),
            Budget::Iterations(DEFAULT_ITERATIONS)
        );
        assert_eq!(Budget::from_args(Some(0), None).unwrap(), Budget::Iterations(0));
        assert!(matches!(
            Budget::from_args(None, Some(0.0)),
            Err(ConfigError::NonPositiveHours)
        ));
        assert_eq!(Budget::from_args(None, Some(2.5)).unwrap(), Budget::Hours(2.5));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = base_config();
        config.timeout_secs = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::NonPositiveTimeout)));

        let mut config = base_config();
        config.workers = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroWorkers)));

        let mut config = base_config();
        config.min_energy = 100;
        config.max_energy = 10;
        assert!(matches!(config.validate(), Err(ConfigError::InvertedEnergyBounds)));

        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_version_registry() {
        assert!(resolve_version("isinteresting", "base").is_ok());
        let err = resolve_version("isinteresting", "v2").unwrap_err();
        assert!(err.to_string().contains("known versions"));

        let mut versions = SubsystemVersions::default();
        versions.power_scheduler = "exponential".to_string();
        assert!(versions.validate().is_err());
    }

    #[test]
    fn test_promote_threshold_defaults() {
        let mut config = base_config();
        assert_eq!(config.effective_promote_threshold(), 0.5);
        config.workers = 4;
        assert_eq!(config.effective_promote_threshold(), 0.0);
        config.promote_threshold = Some(0.25);
        assert_eq!(config.effective_promote_threshold(), 0.25);
    }
}
