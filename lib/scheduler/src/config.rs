// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Scheduler settings and the resource limit file.
//!
//! The limit file is whitespace-delimited plain text: a record count followed
//! by `name min_frac max_frac sm_partition mem_limit_bytes` per client.
//! Missing or malformed content is fatal at startup and recoverable on
//! hot reload (the previous table stays in effect).

use std::path::PathBuf;

use crate::client::ClientLimits;
use crate::SM_GLOBAL_LIMIT;

/// Process-level settings, fixed at startup from the CLI.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// TCP port the daemon listens on.
    pub port: u16,
    /// Quota granted while no burst estimate exists, in ms.
    pub base_quota: f64,
    /// Lower bound for the adaptive quota, in ms.
    pub min_quota: f64,
    /// Sliding usage window, in ms.
    pub window_size: f64,
    /// Limit file name within `limit_file_dir`.
    pub limit_file: String,
    /// Directory containing (and watched for) the limit file.
    pub limit_file_dir: PathBuf,
    /// 0 = info, 1 = debug, 2+ = trace.
    pub verbosity: u8,
    /// When set, the full grant history is dumped here as JSON on shutdown.
    pub history_dump: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            port: 50051,
            base_quota: 250.0,
            min_quota: 100.0,
            window_size: 10_000.0,
            limit_file: "resource-config.txt".to_string(),
            limit_file_dir: PathBuf::from("."),
            verbosity: 0,
            history_dump: None,
        }
    }
}

impl SchedulerConfig {
    pub fn limit_file_path(&self) -> PathBuf {
        self.limit_file_dir.join(&self.limit_file)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read limit file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("limit file ended early: expected {expected} records, found {found}")]
    MissingRecords { expected: usize, found: usize },

    #[error("invalid {field} in record {index}: {token:?}")]
    InvalidField {
        field: &'static str,
        index: usize,
        token: String,
    },

    #[error("record {index} ({name}): fractions must lie in [0, 1] with min <= max")]
    BadFractions { index: usize, name: String },

    #[error("record {index} ({name}): sm_partition must lie in [0, {SM_GLOBAL_LIMIT}]")]
    BadPartition { index: usize, name: String },
}

/// Read and parse the limit file named by `config`.
pub fn load_limits(config: &SchedulerConfig) -> Result<Vec<(String, ClientLimits)>, ConfigError> {
    let path = config.limit_file_path();
    let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io { path, source })?;
    parse_limits(&text, config)
}

/// Parse limit-file text into `(name, limits)` records.
///
/// `max_quota` is derived per record as `min_frac * window_size`; trailing
/// tokens beyond the declared count are ignored.
pub fn parse_limits(
    text: &str,
    config: &SchedulerConfig,
) -> Result<Vec<(String, ClientLimits)>, ConfigError> {
    let mut tokens = text.split_whitespace();

    let count_token = tokens.next().unwrap_or("");
    let count: usize = count_token
        .parse()
        .map_err(|_| ConfigError::InvalidField {
            field: "record count",
            index: 0,
            token: count_token.to_string(),
        })?;

    let mut entries = Vec::with_capacity(count);
    for index in 0..count {
        let name = next_token(&mut tokens, index, count)?.to_string();
        let min_frac = parse_field::<f64>(&mut tokens, "min_frac", index, count)?;
        let max_frac = parse_field::<f64>(&mut tokens, "max_frac", index, count)?;
        let sm_partition = parse_field::<u32>(&mut tokens, "sm_partition", index, count)?;
        let mem_limit = parse_field::<u64>(&mut tokens, "mem_limit", index, count)?;

        if !(0.0..=1.0).contains(&min_frac) || !(0.0..=1.0).contains(&max_frac) || min_frac > max_frac
        {
            return Err(ConfigError::BadFractions { index, name });
        }
        if sm_partition > SM_GLOBAL_LIMIT {
            return Err(ConfigError::BadPartition { index, name });
        }

        let limits = ClientLimits {
            min_frac,
            max_frac,
            sm_partition,
            mem_limit,
            base_quota: config.base_quota,
            min_quota: config.min_quota,
            max_quota: min_frac * config.window_size,
        };
        entries.push((name, limits));
    }

    Ok(entries)
}

fn next_token<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    index: usize,
    expected: usize,
) -> Result<&'a str, ConfigError> {
    tokens.next().ok_or(ConfigError::MissingRecords {
        expected,
        found: index,
    })
}

fn parse_field<'a, T: std::str::FromStr>(
    tokens: &mut impl Iterator<Item = &'a str>,
    field: &'static str,
    index: usize,
    expected: usize,
) -> Result<T, ConfigError> {
    let token = next_token(tokens, index, expected)?;
    token.parse().map_err(|_| ConfigError::InvalidField {
        field,
        index,
        token: token.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_two_records() {
        let config = SchedulerConfig::default();
        let text = "2\npod-a 0.25 0.5 30 1073741824\npod-b 0.5 1.0 70 2147483648\n";
        let entries = parse_limits(text, &config).unwrap();
        assert_eq!(entries.len(), 2);

        let (name, limits) = &entries[0];
        assert_eq!(name, "pod-a");
        assert_eq!(limits.min_frac, 0.25);
        assert_eq!(limits.max_frac, 0.5);
        assert_eq!(limits.sm_partition, 30);
        assert_eq!(limits.mem_limit, 1 << 30);
        assert_eq!(limits.base_quota, 250.0);
        assert_eq!(limits.min_quota, 100.0);
        assert_eq!(limits.max_quota, 0.25 * 10_000.0);
    }

    #[test]
    fn test_trailing_tokens_ignored() {
        let config = SchedulerConfig::default();
        let text = "1 pod-a 0.5 1.0 50 1000 ignored garbage";
        let entries = parse_limits(text, &config).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_bad_count_rejected() {
        let config = SchedulerConfig::default();
        let err = parse_limits("many pod-a 0.5 1.0 50 1000", &config).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidField {
                field: "record count",
                ..
            }
        ));
    }

    #[test]
    fn test_short_file_rejected() {
        let config = SchedulerConfig::default();
        let err = parse_limits("2 pod-a 0.5 1.0 50 1000", &config).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingRecords {
                expected: 2,
                found: 1
            }
        ));
    }

    #[test]
    fn test_malformed_fraction_rejected() {
        let config = SchedulerConfig::default();
        let err = parse_limits("1 pod-a lots 1.0 50 1000", &config).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidField {
                field: "min_frac",
                ..
            }
        ));
    }

    #[test]
    fn test_out_of_range_records_rejected() {
        let config = SchedulerConfig::default();
        assert!(matches!(
            parse_limits("1 pod-a 0.8 0.5 50 1000", &config).unwrap_err(),
            ConfigError::BadFractions { .. }
        ));
        assert!(matches!(
            parse_limits("1 pod-a 0.5 1.5 50 1000", &config).unwrap_err(),
            ConfigError::BadFractions { .. }
        ));
        assert!(matches!(
            parse_limits("1 pod-a 0.5 1.0 101 1000", &config).unwrap_err(),
            ConfigError::BadPartition { .. }
        ));
    }

    #[test]
    fn test_load_limits_missing_file() {
        let config = SchedulerConfig {
            limit_file_dir: PathBuf::from("/nonexistent"),
            ..Default::default()
        };
        assert!(matches!(
            load_limits(&config).unwrap_err(),
            ConfigError::Io { .. }
        ));
    }
}
