//! Test infrastructure for index rebuilding.
//!
//! An in-memory catalog that executes the DDL the strategies issue, plus
//! recording notifiers and quick builders for indexes and configurations.

#![allow(dead_code)]

pub mod fakes;

pub use fakes::*;

use std::time::Duration;

use helios_reindexing::{
    Index, LockRetries, LockRetryStep, ReindexingConfig, ScheduleConfig,
};

pub const GIB: u64 = 1024 * 1024 * 1024;

/// A valid btree index on `public.users`, 4 GiB with 1 GiB of bloat.
pub fn index(oid: u32, name: &str) -> Index {
    Index {
        oid,
        schema: "public".to_string(),
        name: name.to_string(),
        table: "users".to_string(),
        definition: format!("CREATE INDEX {name} ON public.users USING btree (email)"),
        unique: false,
        valid: true,
        partitioned: false,
        exclusion: false,
        expression: false,
        ondisk_size_bytes: 4 * GIB,
        bloat_size_bytes: Some(GIB),
    }
}

/// `index` with the given size and bloat.
pub fn sized(oid: u32, name: &str, size: u64, bloat: Option<u64>) -> Index {
    Index {
        ondisk_size_bytes: size,
        bloat_size_bytes: bloat,
        ..index(oid, name)
    }
}

/// Defaults, with every day scheduled.
pub fn test_config() -> ReindexingConfig {
    ReindexingConfig {
        schedule: ScheduleConfig::always(),
        ..Default::default()
    }
}

/// Three short in-transaction attempts.
pub fn quick_swap_retries() -> LockRetries {
    LockRetries::new().with_timing(vec![
        LockRetryStep {
            lock_timeout: Duration::from_millis(100),
            sleep: Duration::from_millis(10),
        };
        3
    ])
}

/// Two short attempts outside a transaction, then one without a lock timeout.
pub fn quick_removal_retries() -> LockRetries {
    LockRetries::for_index_removal().with_timing(vec![
        LockRetryStep {
            lock_timeout: Duration::from_millis(100),
            sleep: Duration::from_millis(10),
        };
        2
    ])
}
