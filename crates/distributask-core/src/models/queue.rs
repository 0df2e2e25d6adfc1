use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};

use super::task::{OwnerId, TaskId};

/// The minimal identifier distributed through the queue in place of the full task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueReference {
    pub task_id: TaskId,
    pub owner_id: OwnerId,
}

impl Display for QueueReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "task {} (owner {})", self.task_id, self.owner_id)
    }
}
