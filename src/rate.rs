use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::credentials::CredentialMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudget {
    pub anonymous: Duration,
    pub authenticated: Duration,
}

impl Default for RateBudget {
    fn default() -> Self {
        Self {
            anonymous: Duration::from_millis(1000),
            authenticated: Duration::from_millis(500),
        }
    }
}

impl RateBudget {
    pub fn unthrottled() -> Self {
        Self {
            anonymous: Duration::ZERO,
            authenticated: Duration::ZERO,
        }
    }

    pub fn spacing(&self, mode: CredentialMode) -> Duration {
        match mode {
            CredentialMode::Unauthenticated => self.anonymous,
            CredentialMode::Bearer => self.authenticated,
        }
    }
}

#[derive(Debug)]
pub struct RateGovernor {
    budget: RateBudget,
    last_call: Mutex<Option<Instant>>,
}

impl RateGovernor {
    pub fn new(budget: RateBudget) -> Self {
        Self {
            budget,
            last_call: Mutex::new(None),
        }
    }

    pub fn budget(&self) -> RateBudget {
        self.budget
    }

    pub fn acquire(&self, mode: CredentialMode) {
        let spacing = self.budget.spacing(mode);
        let mut last = self
            .last_call
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < spacing {
                let wait = spacing - elapsed;
                tracing::trace!(wait_ms = wait.as_millis() as u64, "rate governor holding call");
                thread::sleep(wait);
            }
        }
        *last = Some(Instant::now());
    }
}

impl Default for RateGovernor {
    fn default() -> Self {
        Self::new(RateBudget::default())
    }
}
