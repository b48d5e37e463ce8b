// Activity Record
// One-line-per-field diagnostic summary of the last run of a control

use crate::execution::control::ExecutionStatus;

use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityRecord {
    pub kind_label: &'static str,
    pub block_id: String,
    pub run_id: Uuid,
    pub time: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub run_time_ms: Option<u128>,
    /// Label of the block an exception came from
    pub exception_block: Option<String>,
}

impl fmt::Display for ActivityRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let run_time = match self.run_time_ms {
            Some(ms) => ms.to_string(),
            None => "N/A".to_string(),
        };

        write!(
            f,
            "{}: {}\n+ Run ID: {}\n+ Time (UTC): {}\n+ Status: {}\n+ Run time (ms): {}\n+ Exception from block: {}",
            self.kind_label,
            self.block_id,
            self.run_id,
            self.time.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.status,
            run_time,
            self.exception_block.as_deref().unwrap_or("N/A"),
        )
    }
}
