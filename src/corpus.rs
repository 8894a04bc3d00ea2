//! Seed corpus: manifest-driven seed sets grouped by family and bucket
//!
//! A manifest names one JSON file per family; each family file declares its
//! buckets and seeds. Sampling supports uniform and weighted single draws
//! plus exact-ratio batches without replacement. Group targets (e.g.
//! `cidrize-runner`) pool several families with an even total split.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Ordinal base for seeds promoted out of fuzzing runs, disjoint from the
/// 0..K-1 range used by corpus seeds.
pub const DISCOVERED_ORDINAL_BASE: i64 = 1_000_000;

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("target family mismatch in {path}: expected '{expected}', got '{actual}'")]
    FamilyMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("duplicate seed id '{seed_id}' in {path}")]
    DuplicateSeedId { seed_id: String, path: PathBuf },
    #[error("seed '{seed_id}' references unknown bucket '{bucket}' in {path}")]
    UnknownSeedBucket {
        seed_id: String,
        bucket: String,
        path: PathBuf,
    },
    #[error("unknown target/family '{name}'; known families: {known}")]
    UnknownTarget { name: String, known: String },
    #[error("unknown bucket '{bucket}' for family '{family}'")]
    UnknownBucket { bucket: String, family: String },
    #[error("bucket '{bucket}' has no seeds")]
    EmptyBucket { bucket: String },
    #[error("family '{family}' has no buckets")]
    NoBuckets { family: String },
    #[error("bucket ratios must not be empty")]
    EmptyRatios,
    #[error("bucket ratio must be >= 0 for '{bucket}'")]
    NegativeRatio { bucket: String },
    #[error("sum of bucket ratios must be > 0")]
    ZeroRatioSum,
    #[error("requested {requested} seeds from bucket '{bucket}' for '{target}', but only {available} available")]
    BucketCapacity {
        requested: usize,
        bucket: String,
        target: String,
        available: usize,
    },
    #[error("group allocation overflow for '{target}': '{family}' requested {requested} from '{bucket}', but only {remaining} remaining after global bucket planning")]
    GroupOverflow {
        target: String,
        family: String,
        requested: usize,
        bucket: String,
        remaining: usize,
    },
    #[error("group allocation mismatch for '{target}': last family '{family}' needs {needed} total but remaining bucket counts sum to {got}")]
    GroupMismatch {
        target: String,
        family: String,
        needed: usize,
        got: usize,
    },
}

/// An immutable input artifact loaded from the corpus or promoted out of
/// a fuzzing run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Seed {
    pub seed_id: String,
    pub family: String,
    pub bucket: String,
    pub label: String,
    pub text: String,
    pub tags: Vec<String>,
    pub expected: String,
    pub ordinal: i64,
    pub fingerprint: String,
}

impl Seed {
    pub fn content_bytes(&self) -> &[u8] {
        self.text.as_bytes()
    }
}

/// First 16 hex chars of SHA-256 over the raw bytes.
pub fn fingerprint_bytes(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..16].to_string()
}

/// Build a seed for an input promoted mid-campaign.
pub fn make_discovered_seed(text: &str, family: &str, bucket: &str, ordinal: i64) -> Seed {
    Seed {
        seed_id: format!("disc_{:06}", ordinal),
        family: family.to_string(),
        bucket: bucket.to_string(),
        label: format!("discovered_{}", ordinal),
        text: text.to_string(),
        tags: vec!["discovered".to_string()],
        expected: "unknown".to_string(),
        ordinal,
        fingerprint: fingerprint_bytes(text.as_bytes()),
    }
}

#[derive(Debug, Clone)]
pub struct SeedBucket {
    pub name: String,
    pub description: String,
    pub seeds: Vec<Seed>,
}

/// All seeds for one family, grouped by bucket in declaration order.
#[derive(Debug, Clone)]
pub struct TargetSeedSet {
    pub family: String,
    pub dataset_id: String,
    buckets: Vec<SeedBucket>,
}

impl TargetSeedSet {
    pub fn bucket_names(&self) -> Vec<&str> {
        self.buckets.iter().map(|b| b.name.as_str()).collect()
    }

    pub fn bucket(&self, name: &str) -> Result<&SeedBucket, CorpusError> {
        self.buckets
            .iter()
            .find(|b| b.name == name)
            .ok_or_else(|| CorpusError::UnknownBucket {
                bucket: name.to_string(),
                family: self.family.clone(),
            })
    }

    pub fn seeds(&self) -> Vec<&Seed> {
        self.buckets.iter().flat_map(|b| b.seeds.iter()).collect()
    }

    /// Uniform or weighted single draw.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        bucket: Option<&str>,
        bucket_weights: Option<&BTreeMap<String, f64>>,
    ) -> Result<Seed, CorpusError> {
        if let Some(name) = bucket {
            let bucket = self.bucket(name)?;
            return bucket
                .seeds
                .choose(rng)
                .cloned()
                .ok_or_else(|| CorpusError::EmptyBucket {
                    bucket: name.to_string(),
                });
        }

        if self.buckets.is_empty() {
            return Err(CorpusError::NoBuckets {
                family: self.family.clone(),
            });
        }

        if let Some(weights) = bucket_weights {
            let weighted: Vec<(usize, f64)> = self
                .buckets
                .iter()
                .enumerate()
                .map(|(i, b)| (i, weights.get(&b.name).copied().unwrap_or(0.0).max(0.0)))
                .collect();
            let total: f64 = weighted.iter().map(|(_, w)| w).sum();
            if total > 0.0 {
                let mut roll = rng.gen::<f64>() * total;
                for (index, weight) in &weighted {
                    roll -= weight;
                    if roll <= 0.0 && *weight > 0.0 {
                        let bucket = &self.buckets[*index];
                        return bucket.seeds.choose(rng).cloned().ok_or_else(|| {
                            CorpusError::EmptyBucket {
                                bucket: bucket.name.clone(),
                            }
                        });
                    }
                }
            }
        }

        let bucket = self.buckets.choose(rng).expect("buckets checked non-empty");
        bucket
            .seeds
            .choose(rng)
            .cloned()
            .ok_or_else(|| CorpusError::EmptyBucket {
                bucket: bucket.name.clone(),
            })
    }

    pub fn summary(&self) -> SeedSetSummary {
        SeedSetSummary {
            family: self.family.clone(),
            dataset_id: self.dataset_id.clone(),
            total_seeds: self.buckets.iter().map(|b| b.seeds.len()).sum(),
            bucket_counts: self
                .buckets
                .iter()
                .map(|b| (b.name.clone(), b.seeds.len()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SeedSetSummary {
    pub family: String,
    pub dataset_id: String,
    pub total_seeds: usize,
    pub bucket_counts: BTreeMap<String, usize>,
}

/// The full corpus: families plus the alias and group tables that map
/// runtime target names onto them.
#[derive(Debug)]
pub struct SeedCorpus {
    targets: BTreeMap<String, TargetSeedSet>,
    aliases: BTreeMap<String, String>,
    groups: BTreeMap<String, Vec<String>>,
    pub manifest_path: PathBuf,
}

fn default_aliases() -> BTreeMap<String, String> {
    [
        ("json-decoder", "json"),
        ("ipv4-parser", "ipv4"),
        ("ipv6-parser", "ipv6"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn default_groups() -> BTreeMap<String, Vec<String>> {
    [("cidrize-runner", vec!["ipv4", "ipv6"])]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.into_iter().map(String::from).collect()))
        .collect()
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(default)]
    targets: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawBucket {
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct RawSeed {
    id: String,
    bucket: String,
    #[serde(default)]
    label: Option<String>,
    content: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    expected: Option<String>,
    #[serde(default)]
    fingerprint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawFamilyFile {
    target_family: String,
    #[serde(default)]
    dataset_id: Option<String>,
    #[serde(default)]
    buckets: Vec<RawBucket>,
    #[serde(default)]
    seeds: Vec<RawSeed>,
}

impl SeedCorpus {
    /// Load `manifest.json` from `corpus_dir` plus every family file it
    /// names.
    pub fn load(corpus_dir: &Path) -> Result<Self, CorpusError> {
        let manifest_path = corpus_dir.join("manifest.json");
        let manifest_text = read_file(&manifest_path)?;
        let manifest: RawManifest = parse_json(&manifest_path, &manifest_text)?;

        let mut targets = BTreeMap::new();
        for (family, rel_path) in &manifest.targets {
            let file_path = corpus_dir.join(rel_path);
            targets.insert(family.clone(), load_family_file(&file_path, family)?);
        }

        Ok(Self {
            targets,
            aliases: default_aliases(),
            groups: default_groups(),
            manifest_path,
        })
    }

    pub fn families(&self) -> Vec<&str> {
        self.targets.keys().map(String::as_str).collect()
    }

    /// Resolve a target or alias to its single family name.
    pub fn resolve_family(&self, name: &str) -> Result<&str, CorpusError> {
        let family = self.aliases.get(name).map(String::as_str).unwrap_or(name);
        match self.targets.get_key_value(family) {
            Some((key, _)) => Ok(key.as_str()),
            None => Err(self.unknown_target(name)),
        }
    }

    /// Families backing a target name: one for plain targets and aliases,
    /// several for group targets.
    pub fn resolve_families(&self, name: &str) -> Result<Vec<&str>, CorpusError> {
        if let Some(members) = self.groups.get(name) {
            let mut out = Vec::with_capacity(members.len());
            for member in members {
                out.push(self.resolve_family(member)?);
            }
            return Ok(out);
        }
        Ok(vec![self.resolve_family(name)?])
    }

    pub fn target(&self, name: &str) -> Result<&TargetSeedSet, CorpusError> {
        let family = self.resolve_family(name)?;
        Ok(&self.targets[family])
    }

    /// Union of all seeds backing a target, group members in order.
    pub fn seeds_for_target(&self, name: &str) -> Result<Vec<&Seed>, CorpusError> {
        let mut out = Vec::new();
        for family in self.resolve_families(name)? {
            out.extend(self.targets[family].seeds());
        }
        Ok(out)
    }

    pub fn sample<R: Rng + ?Sized>(
        &self,
        name: &str,
        rng: &mut R,
        bucket: Option<&str>,
        bucket_weights: Option<&BTreeMap<String, f64>>,
    ) -> Result<Seed, CorpusError> {
        self.target(name)?.sample(rng, bucket, bucket_weights)
    }

    /// Draw exactly `total` seeds without replacement, with per-bucket
    /// counts derived from `bucket_ratios` via largest-remainder rounding.
    pub fn sample_ratio_batch<R: Rng + ?Sized>(
        &self,
        name: &str,
        total: usize,
        bucket_ratios: &BTreeMap<String, f64>,
        rng: &mut R,
        shuffle: bool,
    ) -> Result<Vec<Seed>, CorpusError> {
        if self.groups.contains_key(name) {
            return self.sample_ratio_batch_grouped(name, total, bucket_ratios, rng, shuffle);
        }

        let seed_set = self.target(name)?;
        let known: HashSet<String> = seed_set.bucket_names().iter().map(|s| s.to_string()).collect();
        let counts = plan_bucket_counts(total, bucket_ratios, &known, &seed_set.family)?;
        let mut batch = sample_from_buckets(seed_set, &counts, rng, name)?;
        if shuffle && batch.len() > 1 {
            batch.shuffle(rng);
        }
        Ok(batch)
    }

    fn sample_ratio_batch_grouped<R: Rng + ?Sized>(
        &self,
        name: &str,
        total: usize,
        bucket_ratios: &BTreeMap<String, f64>,
        rng: &mut R,
        shuffle: bool,
    ) -> Result<Vec<Seed>, CorpusError> {
        let families = self.resolve_families(name)?;
        let family_totals = split_total_evenly(total, families.len());

        let first_set = &self.targets[families[0]];
        let known: HashSet<String> = first_set.bucket_names().iter().map(|s| s.to_string()).collect();
        let global_counts = plan_bucket_counts(total, bucket_ratios, &known, &first_set.family)?;

        let mut remaining = global_counts.clone();
        let mut out = Vec::with_capacity(total);

        for (index, family) in families.iter().enumerate() {
            let seed_set = &self.targets[*family];
            let last = index == families.len() - 1;

            let counts = if last {
                // The final member absorbs whatever the plan still owes so
                // the global bucket counts line up exactly.
                let counts = remaining.clone();
                let got: usize = counts.values().sum();
                if got != family_totals[index] {
                    return Err(CorpusError::GroupMismatch {
                        target: name.to_string(),
                        family: seed_set.family.clone(),
                        needed: family_totals[index],
                        got,
                    });
                }
                counts
            } else {
                let family_known: HashSet<String> =
                    seed_set.bucket_names().iter().map(|s| s.to_string()).collect();
                let counts = plan_bucket_counts(
                    family_totals[index],
                    bucket_ratios,
                    &family_known,
                    &seed_set.family,
                )?;
                for (bucket, count) in &counts {
                    let left = remaining.get(bucket).copied().unwrap_or(0);
                    if *count > left {
                        return Err(CorpusError::GroupOverflow {
                            target: name.to_string(),
                            family: seed_set.family.clone(),
                            requested: *count,
                            bucket: bucket.clone(),
                            remaining: left,
                        });
                    }
                }
                counts
            };

            let label = format!("{}:{}", name, seed_set.family);
            out.extend(sample_from_buckets(seed_set, &counts, rng, &label)?);
            for (bucket, count) in &counts {
                if let Some(left) = remaining.get_mut(bucket) {
                    *left -= count;
                }
            }
        }

        if shuffle && out.len() > 1 {
            out.shuffle(rng);
        }
        Ok(out)
    }

    pub fn summary(&self) -> Vec<SeedSetSummary> {
        self.targets.values().map(TargetSeedSet::summary).collect()
    }

    fn unknown_target(&self, name: &str) -> CorpusError {
        let mut known: Vec<&str> = self.families();
        known.extend(self.groups.keys().map(String::as_str));
        known.sort_unstable();
        CorpusError::UnknownTarget {
            name: name.to_string(),
            known: known.join(", "),
        }
    }
}

fn read_file(path: &Path) -> Result<String, CorpusError> {
    std::fs::read_to_string(path).map_err(|source| CorpusError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_json<T: for<'de> Deserialize<'de>>(path: &Path, text: &str) -> Result<T, CorpusError> {
    serde_json::from_str(text).map_err(|source| CorpusError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn load_family_file(path: &Path, expected_family: &str) -> Result<TargetSeedSet, CorpusError> {
    let text = read_file(path)?;
    let raw: RawFamilyFile = parse_json(path, &text)?;

    if raw.target_family != expected_family {
        return Err(CorpusError::FamilyMismatch {
            path: path.to_path_buf(),
            expected: expected_family.to_string(),
            actual: raw.target_family,
        });
    }

    let mut buckets: Vec<SeedBucket> = raw
        .buckets
        .iter()
        .map(|b| SeedBucket {
            name: b.name.clone(),
            description: b.description.clone(),
            seeds: Vec::new(),
        })
        .collect();
    let index_by_name: HashMap<String, usize> = buckets
        .iter()
        .enumerate()
        .map(|(i, b)| (b.name.clone(), i))
        .collect();

    let mut seen_ids = HashSet::new();
    for (ordinal, raw_seed) in raw.seeds.into_iter().enumerate() {
        if !seen_ids.insert(raw_seed.id.clone()) {
            return Err(CorpusError::DuplicateSeedId {
                seed_id: raw_seed.id,
                path: path.to_path_buf(),
            });
        }
        let Some(&bucket_index) = index_by_name.get(&raw_seed.bucket) else {
            return Err(CorpusError::UnknownSeedBucket {
                seed_id: raw_seed.id,
                bucket: raw_seed.bucket,
                path: path.to_path_buf(),
            });
        };
        let fingerprint = raw_seed
            .fingerprint
            .unwrap_or_else(|| fingerprint_bytes(raw_seed.content.as_bytes()));
        buckets[bucket_index].seeds.push(Seed {
            seed_id: raw_seed.id.clone(),
            family: expected_family.to_string(),
            bucket: raw_seed.bucket,
            label: raw_seed.label.unwrap_or_else(|| raw_seed.id.clone()),
            text: raw_seed.content,
            tags: raw_seed.tags,
            expected: raw_seed.expected.unwrap_or_else(|| "unknown".to_string()),
            ordinal: ordinal as i64,
            fingerprint,
        });
    }

    Ok(TargetSeedSet {
        family: expected_family.to_string(),
        dataset_id: raw
            .dataset_id
            .unwrap_or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()),
        buckets,
    })
}

fn sample_from_buckets<R: Rng + ?Sized>(
    seed_set: &TargetSeedSet,
    counts: &BTreeMap<String, usize>,
    rng: &mut R,
    target_label: &str,
) -> Result<Vec<Seed>, CorpusError> {
    let mut out = Vec::new();
    for (bucket_name, &count) in counts {
        let bucket = seed_set.bucket(bucket_name)?;
        if count > bucket.seeds.len() {
            return Err(CorpusError::BucketCapacity {
                requested: count,
                bucket: bucket_name.clone(),
                target: target_label.to_string(),
                available: bucket.seeds.len(),
            });
        }
        if count > 0 {
            out.extend(bucket.seeds.choose_multiple(rng, count).cloned());
        }
    }
    Ok(out)
}

/// Even split of `total` into `n_parts`, earlier parts taking the excess.
fn split_total_evenly(total: usize, n_parts: usize) -> Vec<usize> {
    let base = total / n_parts;
    let remainder = total % n_parts;
    (0..n_parts)
        .map(|i| base + usize::from(i < remainder))
        .collect()
}

/// Largest-remainder bucket counts. Ties resolve by larger raw remainder,
/// then larger normalized ratio, then bucket name ascending.
fn plan_bucket_counts(
    total: usize,
    bucket_ratios: &BTreeMap<String, f64>,
    known_buckets: &HashSet<String>,
    family: &str,
) -> Result<BTreeMap<String, usize>, CorpusError> {
    if bucket_ratios.is_empty() {
        return Err(CorpusError::EmptyRatios);
    }
    for (bucket, &ratio) in bucket_ratios {
        if !known_buckets.contains(bucket) {
            return Err(CorpusError::UnknownBucket {
                bucket: bucket.clone(),
                family: family.to_string(),
            });
        }
        if ratio < 0.0 {
            return Err(CorpusError::NegativeRatio {
                bucket: bucket.clone(),
            });
        }
    }
    let ratio_sum: f64 = bucket_ratios.values().sum();
    if ratio_sum <= 0.0 {
        return Err(CorpusError::ZeroRatioSum);
    }

    let mut counts = BTreeMap::new();
    let mut order: Vec<(String, f64, f64)> = Vec::new(); // (name, remainder, normalized)
    for (bucket, &ratio) in bucket_ratios {
        let normalized = ratio / ratio_sum;
        let raw = normalized * total as f64;
        let floor = raw.floor() as usize;
        counts.insert(bucket.clone(), floor);
        order.push((bucket.clone(), raw - floor as f64, normalized));
    }

    let assigned: usize = counts.values().sum();
    let mut leftover = total - assigned;
    order.sort_by(|a, b| {
        b.1.total_cmp(&a.1)
            .then(b.2.total_cmp(&a.2))
            .then(a.0.cmp(&b.0))
    });
    let mut index = 0;
    while leftover > 0 {
        let bucket = &order[index % order.len()].0;
        *counts.get_mut(bucket).expect("planned bucket") += 1;
        leftover -= 1;
        index += 1;
    }
    Ok(counts)
}
