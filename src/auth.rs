use anyhow::Result;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::AuthSettings;

/// Injected supplier login capability. Credential handling, login-script
/// execution and browser work all live with the caller.
#[async_trait]
pub trait SupplierLogin: Send + Sync {
    async fn login(&self) -> Result<()>;
}

/// Why a re-login was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginTrigger {
    Startup,
    ConsecutivePriceFailures,
    PrimaryPeriodic,
    SecondaryPeriodic,
}

/// Multi-tier re-login scheduling with a circuit breaker. Counters are
/// driven by the scraping loop; the coordinator decides when a login is
/// due and whether auth is currently disabled.
#[derive(Debug)]
pub struct AuthCoordinator {
    settings: AuthSettings,
    consecutive_price_failures: u32,
    products_processed: usize,
    consecutive_auth_failures: u32,
    disabled_until: Option<Instant>,
    logins_performed: usize,
}

impl AuthCoordinator {
    pub fn new(settings: AuthSettings) -> Self {
        Self {
            settings,
            consecutive_price_failures: 0,
            products_processed: 0,
            consecutive_auth_failures: 0,
            disabled_until: None,
            logins_performed: 0,
        }
    }

    pub fn logins_performed(&self) -> usize {
        self.logins_performed
    }

    /// A price extraction failed; returns the trigger once the consecutive
    /// threshold is reached.
    pub fn record_price_failure(&mut self) -> Option<LoginTrigger> {
        self.consecutive_price_failures += 1;
        if self.consecutive_price_failures >= self.settings.consecutive_failure_threshold {
            warn!(
                "{} consecutive price-extraction failures; login due",
                self.consecutive_price_failures
            );
            return Some(LoginTrigger::ConsecutivePriceFailures);
        }
        None
    }

    pub fn record_price_success(&mut self) {
        self.consecutive_price_failures = 0;
    }

    /// A product finished processing; returns a periodic trigger when one
    /// of the intervals elapses.
    pub fn record_product_processed(&mut self) -> Option<LoginTrigger> {
        self.products_processed += 1;
        let primary = self.settings.primary_periodic_interval;
        let secondary = self.settings.secondary_periodic_interval;
        if primary > 0 && self.products_processed % primary == 0 {
            return Some(LoginTrigger::PrimaryPeriodic);
        }
        if secondary > 0 && self.products_processed % secondary == 0 {
            return Some(LoginTrigger::SecondaryPeriodic);
        }
        None
    }

    /// Auth is disabled while the circuit breaker cooldown runs.
    pub fn is_disabled(&self) -> bool {
        matches!(self.disabled_until, Some(until) if Instant::now() < until)
    }

    /// Perform a login for the given trigger, honouring the circuit
    /// breaker. Returns whether a login actually ran and succeeded.
    pub async fn attempt_login(
        &mut self,
        login: &dyn SupplierLogin,
        trigger: LoginTrigger,
    ) -> Result<bool> {
        if !self.settings.enabled {
            return Ok(false);
        }
        if self.is_disabled() {
            warn!("Auth circuit breaker open; skipping login ({:?})", trigger);
            return Ok(false);
        }

        info!("Triggering supplier login ({:?})", trigger);
        match login.login().await {
            Ok(()) => {
                self.consecutive_auth_failures = 0;
                self.consecutive_price_failures = 0;
                self.logins_performed += 1;
                info!("Supplier login succeeded");
                Ok(true)
            }
            Err(e) => {
                self.consecutive_auth_failures += 1;
                warn!(
                    "Supplier login failed ({} consecutive): {}",
                    self.consecutive_auth_failures, e
                );
                if self.consecutive_auth_failures >= self.settings.max_consecutive_auth_failures {
                    let cooldown =
                        Duration::from_secs(self.settings.auth_failure_delay_seconds);
                    warn!(
                        "Disabling auth for {:?} after {} consecutive failures",
                        cooldown, self.consecutive_auth_failures
                    );
                    self.disabled_until = Some(Instant::now() + cooldown);
                    self.consecutive_auth_failures = 0;
                }
                Ok(false)
            }
        }
    }
}
