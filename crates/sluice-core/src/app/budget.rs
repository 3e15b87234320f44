//! InvocationBudget - 1 回の invocation に与えられた wall-clock budget
//!
//! remaining = limit - safety_buffer - elapsed（0 で打ち止め）

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::ports::Clock;

#[derive(Clone)]
pub struct InvocationBudget {
    clock: Arc<dyn Clock>,
    started_at: DateTime<Utc>,
    limit: Duration,
    safety_buffer: Duration,
}

impl InvocationBudget {
    /// Starts counting now.
    pub fn start(clock: Arc<dyn Clock>, limit: Duration, safety_buffer: Duration) -> Self {
        let started_at = clock.now();
        Self {
            clock,
            started_at,
            limit,
            safety_buffer,
        }
    }

    pub fn elapsed(&self) -> Duration {
        // a clock that went backwards counts as no time spent
        (self.clock.now() - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn remaining(&self) -> Duration {
        self.limit
            .saturating_sub(self.safety_buffer)
            .saturating_sub(self.elapsed())
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Per-call timeout capped by what is left.
    pub fn call_timeout(&self, per_call: Duration) -> Duration {
        per_call.min(self.remaining())
    }
}
