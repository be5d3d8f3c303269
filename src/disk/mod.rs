//! Raw block-device inspection.

pub mod partition_table;

pub use partition_table::{
    DEFAULT_SECTOR_SIZE, MIN_CANDIDATE_BYTES, OsClass, Partition, candidate_partitions,
    parse_partitions, parse_partitions_with_sector_size,
};
