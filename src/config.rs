use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};

/// Placement of the filesystem partition on the flash chip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// First chip sector of the partition
    #[serde(default)]
    pub first_sector: u32,
    /// Number of sectors in the partition
    pub sector_count: u32,
}

impl PartitionConfig {
    /// Parse a configuration such as `{"first_sector": 16, "sector_count": 240}`
    pub fn from_json(text: &str) -> FsResult<Self> {
        serde_json::from_str(text).map_err(|e| {
            log::warn!("invalid partition configuration: {}", e);
            FsError::InvalidConfig
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::{FlashPartition, NorFlashPartition};
    use crate::ram_flash::RamNorFlash;

    #[test]
    fn parse_partition_config() {
        let config =
            PartitionConfig::from_json(r#"{"first_sector": 4, "sector_count": 12}"#).expect("parse");
        assert_eq!(
            config,
            PartitionConfig {
                first_sector: 4,
                sector_count: 12
            }
        );

        let config = PartitionConfig::from_json(r#"{"sector_count": 8}"#).expect("parse");
        assert_eq!(config.first_sector, 0);
    }

    #[test]
    fn reject_malformed_config() {
        assert_eq!(
            PartitionConfig::from_json(r#"{"first_sector": 1}"#),
            Err(FsError::InvalidConfig)
        );
        assert_eq!(
            PartitionConfig::from_json("sector_count=8"),
            Err(FsError::InvalidConfig)
        );
    }

    #[test]
    fn partition_from_config() {
        let config = PartitionConfig::from_json(r#"{"first_sector": 2, "sector_count": 6}"#)
            .expect("parse");
        let part = NorFlashPartition::from_config(RamNorFlash::new(512, 8), &config).expect("fit");
        assert_eq!(part.sector_count(), 6);
        assert_eq!(part.size(), 6 * 512);

        let too_big = PartitionConfig {
            first_sector: 4,
            sector_count: 6,
        };
        assert!(NorFlashPartition::from_config(RamNorFlash::new(512, 8), &too_big).is_err());
    }
}
