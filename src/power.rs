//! Power scheduler: how many mutations each seed earns per selection
//!
//! Seeds fuzzed less often weigh more; average interestingness and bug
//! finds boost the weight. Weights are scaled so the mean energy sits at
//! the midpoint of [min_energy, max_energy], then clamped per seed.

use std::collections::HashMap;

pub const DEFAULT_MIN_ENERGY: u32 = 1;
pub const DEFAULT_MAX_ENERGY: u32 = 128;

const WEIGHT_FLOOR: f64 = 1e-6;
const BUG_BONUS_CAP: u64 = 5;

/// Per-seed inputs, keyed by the seed's ordinal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeedEnergyInput {
    pub id: i64,
    pub fuzz_count: u64,
    pub avg_interesting_score: Option<f64>,
    pub bug_count: Option<u64>,
}

/// `ordinal -> energy` assignments, all within the configured bounds.
#[derive(Debug, Clone, Default)]
pub struct PowerSchedule {
    pub seed_energies: HashMap<i64, u32>,
}

impl PowerSchedule {
    pub fn energy_for(&self, ordinal: i64) -> Option<u32> {
        self.seed_energies.get(&ordinal).copied()
    }
}

fn seed_weight(seed: &SeedEnergyInput) -> f64 {
    let mut weight = 1.0 / (1.0 + seed.fuzz_count as f64);
    if let Some(avg) = seed.avg_interesting_score {
        if avg > 0.0 {
            weight *= 1.0 + avg.ln_1p();
        }
    }
    if let Some(bugs) = seed.bug_count {
        if bugs > 0 {
            weight *= 1.0 + bugs.min(BUG_BONUS_CAP) as f64;
        }
    }
    weight.max(WEIGHT_FLOOR)
}

/// Round half-to-even, so an all-equal population lands exactly on the
/// midpoint energy instead of drifting up.
fn round_half_to_even(value: f64) -> f64 {
    let floor = value.floor();
    let fraction = value - floor;
    if (fraction - 0.5).abs() < f64::EPSILON {
        if (floor as i64) % 2 == 0 {
            floor
        } else {
            floor + 1.0
        }
    } else {
        value.round()
    }
}

/// Compute integer energies in [min_energy, max_energy] for every seed.
pub fn compute_power_schedule(
    seeds: &[SeedEnergyInput],
    min_energy: u32,
    max_energy: u32,
) -> PowerSchedule {
    if seeds.is_empty() {
        return PowerSchedule::default();
    }

    let min_e = min_energy.max(1);
    let max_e = max_energy.max(min_e);

    let weights: Vec<f64> = seeds.iter().map(seed_weight).collect();
    let total_weight: f64 = weights.iter().sum();
    let total_weight = if total_weight > 0.0 { total_weight } else { 1.0 };

    let mean_energy = (min_e as f64 + max_e as f64) / 2.0;
    let scale = mean_energy * seeds.len() as f64 / total_weight;

    let mut seed_energies = HashMap::with_capacity(seeds.len());
    for (seed, weight) in seeds.iter().zip(&weights) {
        let raw = weight * scale;
        let energy = round_half_to_even(raw) as i64;
        let energy = energy.clamp(min_e as i64, max_e as i64) as u32;
        seed_energies.insert(seed.id, energy);
    }
    PowerSchedule { seed_energies }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(id: i64, fuzz_count: u64) -> SeedEnergyInput {
        SeedEnergyInput {
            id,
            fuzz_count,
            ..SeedEnergyInput::default()
        }
    }

    #[test]
    fn test_equal_weights_give_midpoint_energy() {
        let seeds = vec![input(0, 0), input(1, 0), input(2, 0)];
        let schedule = compute_power_schedule(&seeds, DEFAULT_MIN_ENERGY, DEFAULT_MAX_ENERGY);
        for ordinal in 0..3 {
            assert_eq!(schedule.energy_for(ordinal), Some(64));
        }
    }

    #[test]
    fn test_energies_always_within_bounds() {
        let mut seeds = Vec::new();
        for i in 0..50 {
            seeds.push(SeedEnergyInput {
                id: i,
                fuzz_count: (i as u64) * 17 % 23,
                avg_interesting_score: Some((i as f64) / 50.0),
                bug_count: Some((i as u64) % 7),
            });
        }
        for (min_e, max_e) in [(1, 128), (1, 1), (4, 16), (10, 5)] {
            let schedule = compute_power_schedule(&seeds, min_e, max_e);
            let low = min_e.max(1);
            let high = max_e.max(low);
            for energy in schedule.seed_energies.values() {
                assert!(*energy >= low && *energy <= high, "energy {energy} out of [{low}, {high}]");
            }
        }
    }

    #[test]
    fn test_under_fuzzed_seeds_get_more_energy() {
        let seeds = vec![input(0, 0), input(1, 100)];
        let schedule = compute_power_schedule(&seeds, 1, 128);
        assert!(schedule.energy_for(0).unwrap() > schedule.energy_for(1).unwrap());
    }

    #[test]
    fn test_bug_and_score_boosts() {
        let plain = input(0, 4);
        let scored = SeedEnergyInput {
            id: 1,
            fuzz_count: 4,
            avg_interesting_score: Some(0.8),
            bug_count: None,
        };
        let buggy = SeedEnergyInput {
            id: 2,
            fuzz_count: 4,
            avg_interesting_score: None,
            bug_count: Some(3),
        };
        let capped = SeedEnergyInput {
            id: 3,
            fuzz_count: 4,
            avg_interesting_score: None,
            bug_count: Some(50),
        };
        assert!(seed_weight(&scored) > seed_weight(&plain));
        assert!(seed_weight(&buggy) > seed_weight(&scored));
        // Bug bonus caps at 5.
        assert!((seed_weight(&capped) - seed_weight(&plain) * 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_score_is_no_boost() {
        let zero = SeedEnergyInput {
            id: 0,
            fuzz_count: 2,
            avg_interesting_score: Some(0.0),
            bug_count: Some(0),
        };
        assert!((seed_weight(&zero) - seed_weight(&input(0, 2))).abs() < 1e-12);
    }

    #[test]
    fn test_empty_input() {
        let schedule = compute_power_schedule(&[], 1, 128);
        assert!(schedule.seed_energies.is_empty());
    }

    #[test]
    fn test_round_half_to_even() {
        assert_eq!(round_half_to_even(64.5), 64.0);
        assert_eq!(round_half_to_even(65.5), 66.0);
        assert_eq!(round_half_to_even(64.4), 64.0);
        assert_eq!(round_half_to_even(64.6), 65.0);
        assert_eq!(round_half_to_even(2.0), 2.0);
    }
}
