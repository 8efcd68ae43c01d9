use core::error::Error;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Deserializer;

/// Errors raised while loading or validating the GPU configuration.
#[derive(Debug, derive_more::Display)]
pub enum ConfigError {
    #[display("invalid GPU sharing strategy `{value}`, should be one of time-sharing or mps")]
    InvalidSharingStrategy { value: String },
    #[display("max shared clients per GPU should be > 0 for the {strategy} sharing strategy")]
    MissingMaxSharedClients { strategy: SharingStrategy },
    #[display("GPU sharing strategy needs to be specified when max shared clients per GPU > 0")]
    MissingSharingStrategy,
    #[display("GPU partitioning cannot be combined with GPU sharing")]
    PartitionWithSharing,
    #[display("invalid health critical XID `{value}`")]
    InvalidXid { value: String },
    #[display("failed to load GPU config file {}", path.display())]
    ConfigFile { path: PathBuf },
}

impl Error for ConfigError {}

/// How a physical GPU is shared between containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum SharingStrategy {
    #[display("time-sharing")]
    TimeSharing,
    #[display("mps")]
    Mps,
}

impl FromStr for SharingStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "time-sharing" => Ok(Self::TimeSharing),
            "mps" => Ok(Self::Mps),
            other => Err(ConfigError::InvalidSharingStrategy {
                value: other.to_string(),
            }),
        }
    }
}

/// Accepts `""` as "no strategy", everything else must name a known strategy.
fn deserialize_optional_strategy<'de, D>(deserializer: D) -> Result<Option<SharingStrategy>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    match value.as_deref() {
        None | Some("") => Ok(None),
        Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GpuSharingConfig {
    #[serde(
        rename = "GPUSharingStrategy",
        deserialize_with = "deserialize_optional_strategy"
    )]
    pub gpu_sharing_strategy: Option<SharingStrategy>,
    #[serde(rename = "MaxSharedClientsPerGPU")]
    pub max_shared_clients_per_gpu: u32,
}

/// Settings used to configure the GPUs on a node.
///
/// The JSON form uses the same keys as the node config file written by the
/// cluster provisioner, e.g. `{"GPUSharingConfig": {"GPUSharingStrategy": "mps", ...}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    /// MIG partition size, empty disables partitioning
    #[serde(rename = "GPUPartitionSize")]
    pub gpu_partition_size: String,
    /// Number of time-shared clients per GPU.
    /// Deprecated in favor of `gpu_sharing_config`.
    #[serde(rename = "MaxTimeSharedClientsPerGPU")]
    pub max_time_shared_clients_per_gpu: u32,
    #[serde(rename = "GPUSharingConfig")]
    pub gpu_sharing_config: GpuSharingConfig,
    /// XID codes that mark a GPU unhealthy
    #[serde(rename = "HealthCriticalXid")]
    pub health_critical_xid: Vec<u32>,
}

impl GpuConfig {
    /// Load a config from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, Report<ConfigError>> {
        let content = std::fs::read_to_string(path).change_context(ConfigError::ConfigFile {
            path: path.to_path_buf(),
        })?;
        serde_json::from_str(&content).change_context(ConfigError::ConfigFile {
            path: path.to_path_buf(),
        })
    }

    /// Folds the legacy time-sharing field into the sharing config and checks
    /// that a strategy is set exactly when clients per GPU is positive.
    pub fn add_defaults_and_validate(&mut self) -> Result<(), Report<ConfigError>> {
        if self.max_time_shared_clients_per_gpu > 0 {
            if self.gpu_sharing_config.gpu_sharing_strategy.is_some()
                || self.gpu_sharing_config.max_shared_clients_per_gpu > 0
            {
                tracing::info!(
                    "Both MaxTimeSharedClientsPerGPU and GPUSharingConfig are set, use the value of MaxTimeSharedClientsPerGPU"
                );
            }
            self.gpu_sharing_config = GpuSharingConfig {
                gpu_sharing_strategy: Some(SharingStrategy::TimeSharing),
                max_shared_clients_per_gpu: self.max_time_shared_clients_per_gpu,
            };
        } else {
            match self.gpu_sharing_config.gpu_sharing_strategy {
                Some(strategy) if self.gpu_sharing_config.max_shared_clients_per_gpu == 0 => {
                    return Err(Report::new(ConfigError::MissingMaxSharedClients { strategy }));
                }
                None if self.gpu_sharing_config.max_shared_clients_per_gpu > 0 => {
                    return Err(Report::new(ConfigError::MissingSharingStrategy));
                }
                _ => {}
            }
        }

        if !self.gpu_partition_size.is_empty() && self.sharing_enabled() {
            return Err(Report::new(ConfigError::PartitionWithSharing)).attach_printable_lazy(
                || format!("partition size: {}", self.gpu_partition_size),
            );
        }
        Ok(())
    }

    pub fn sharing_strategy(&self) -> Option<SharingStrategy> {
        self.gpu_sharing_config.gpu_sharing_strategy
    }

    pub fn max_shared_clients_per_gpu(&self) -> u32 {
        self.gpu_sharing_config.max_shared_clients_per_gpu
    }

    pub fn sharing_enabled(&self) -> bool {
        self.gpu_sharing_config.max_shared_clients_per_gpu > 0
    }

    pub fn partitioning_enabled(&self) -> bool {
        !self.gpu_partition_size.is_empty()
    }
}

/// Parses a comma separated XID list such as `"61, 31"`.
///
/// Blank input means no codes. Entries are trimmed; any entry that is not an
/// integer rejects the whole list.
pub fn parse_health_critical_xid(input: &str) -> Result<Vec<u32>, Report<ConfigError>> {
    if input.trim().is_empty() {
        return Ok(Vec::new());
    }
    input
        .split(',')
        .map(str::trim)
        .map(|value| {
            value.parse::<u32>().change_context(ConfigError::InvalidXid {
                value: value.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use similar_asserts::assert_eq;
    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn no_sharing_is_valid() {
        let mut config = GpuConfig::default();
        config
            .add_defaults_and_validate()
            .expect("empty config should validate");
        assert_eq!(config, GpuConfig::default());
        assert!(!config.sharing_enabled());
    }

    #[test]
    fn legacy_time_shared_clients_default_to_time_sharing() {
        let mut config = GpuConfig {
            max_time_shared_clients_per_gpu: 10,
            ..Default::default()
        };
        config
            .add_defaults_and_validate()
            .expect("legacy config should validate");

        assert_eq!(config.sharing_strategy(), Some(SharingStrategy::TimeSharing));
        assert_eq!(config.max_shared_clients_per_gpu(), 10);
        assert_eq!(config.max_time_shared_clients_per_gpu, 10);
    }

    #[test]
    fn legacy_field_wins_over_sharing_config() {
        let mut config = GpuConfig {
            max_time_shared_clients_per_gpu: 4,
            gpu_sharing_config: GpuSharingConfig {
                gpu_sharing_strategy: Some(SharingStrategy::Mps),
                max_shared_clients_per_gpu: 8,
            },
            ..Default::default()
        };
        config
            .add_defaults_and_validate()
            .expect("legacy config should validate");

        assert_eq!(config.sharing_strategy(), Some(SharingStrategy::TimeSharing));
        assert_eq!(config.max_shared_clients_per_gpu(), 4);
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        let err = "invalid"
            .parse::<SharingStrategy>()
            .expect_err("unknown strategy should fail");
        assert!(matches!(err, ConfigError::InvalidSharingStrategy { .. }));

        let json = r#"{"GPUSharingConfig": {"GPUSharingStrategy": "invalid", "MaxSharedClientsPerGPU": 10}}"#;
        assert!(serde_json::from_str::<GpuConfig>(json).is_err());
    }

    #[test]
    fn clients_without_strategy_is_rejected() {
        let mut config = GpuConfig {
            gpu_sharing_config: GpuSharingConfig {
                gpu_sharing_strategy: None,
                max_shared_clients_per_gpu: 3,
            },
            ..Default::default()
        };
        let report = config
            .add_defaults_and_validate()
            .expect_err("clients without strategy should fail");
        assert!(matches!(
            report.current_context(),
            ConfigError::MissingSharingStrategy
        ));
    }

    #[test]
    fn strategy_without_clients_is_rejected() {
        let mut config = GpuConfig {
            gpu_sharing_config: GpuSharingConfig {
                gpu_sharing_strategy: Some(SharingStrategy::Mps),
                max_shared_clients_per_gpu: 0,
            },
            ..Default::default()
        };
        let report = config
            .add_defaults_and_validate()
            .expect_err("strategy without clients should fail");
        assert!(matches!(
            report.current_context(),
            ConfigError::MissingMaxSharedClients {
                strategy: SharingStrategy::Mps
            }
        ));
    }

    #[test]
    fn partitioning_with_sharing_is_rejected() {
        let mut config = GpuConfig {
            gpu_partition_size: "1g.5gb".to_string(),
            max_time_shared_clients_per_gpu: 2,
            ..Default::default()
        };
        let report = config
            .add_defaults_and_validate()
            .expect_err("partitioning and sharing should not combine");
        assert!(matches!(
            report.current_context(),
            ConfigError::PartitionWithSharing
        ));
    }

    #[test]
    fn parse_xid_list() {
        assert_eq!(
            parse_health_critical_xid("61, 31").expect("should parse"),
            vec![61, 31]
        );
        assert_eq!(
            parse_health_critical_xid("31,  32,34").expect("should parse"),
            vec![31, 32, 34]
        );
        assert_eq!(
            parse_health_critical_xid("").expect("should parse"),
            Vec::<u32>::new()
        );
    }

    #[test]
    fn parse_xid_list_rejects_garbage() {
        let report = parse_health_critical_xid("31,32,x").expect_err("x is not an XID");
        assert!(matches!(
            report.current_context(),
            ConfigError::InvalidXid { value } if value == "x"
        ));
    }

    #[test]
    fn load_config_file() {
        let mut file = NamedTempFile::new().expect("should create temp file");
        file.write_all(
            br#"{
                "GPUPartitionSize": "",
                "GPUSharingConfig": {
                    "GPUSharingStrategy": "mps",
                    "MaxSharedClientsPerGPU": 10
                },
                "HealthCriticalXid": [48, 79]
            }"#,
        )
        .expect("should write config");

        let mut config = GpuConfig::from_file(file.path()).expect("should load config");
        config
            .add_defaults_and_validate()
            .expect("config should validate");

        assert_eq!(config.sharing_strategy(), Some(SharingStrategy::Mps));
        assert_eq!(config.max_shared_clients_per_gpu(), 10);
        assert_eq!(config.health_critical_xid, vec![48, 79]);
    }

    #[test]
    fn empty_strategy_string_means_unset() {
        let config: GpuConfig =
            serde_json::from_str(r#"{"GPUSharingConfig": {"GPUSharingStrategy": ""}}"#)
                .expect("should deserialize");
        assert_eq!(config.sharing_strategy(), None);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let report = GpuConfig::from_file(Path::new("/nonexistent/gpu_config.json"))
            .expect_err("missing file should fail");
        assert!(matches!(
            report.current_context(),
            ConfigError::ConfigFile { .. }
        ));
    }
}
