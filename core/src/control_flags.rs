//! Iteration and budget ceilings for the controller loop.
//!
//! Both flags latch when a `step()` finds them at the limit; the latch is
//! what `increase_limit` consults, so a limit can only be raised after it
//! was actually hit. Iteration counting belongs to the controller and is
//! advanced by `step()`; cost belongs to the LLM call site and is synced in
//! from metrics, so the budget flag's `step()` only ever checks.

use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;
use crate::error::WindlassErr;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IterationControlFlag {
    pub current_value: i64,
    pub max_value: i64,
    pub limit_increase_amount: i64,
    #[serde(default)]
    hit_limit: bool,
}

impl IterationControlFlag {
    pub fn new(max_value: i64, limit_increase_amount: i64) -> Self {
        Self {
            current_value: 0,
            max_value,
            limit_increase_amount,
            hit_limit: false,
        }
    }

    pub fn reached_limit(&mut self) -> bool {
        self.hit_limit = self.current_value >= self.max_value;
        self.hit_limit
    }

    /// Advance one step, or refuse with the quota error when at the limit.
    pub fn step(&mut self) -> Result<()> {
        if self.reached_limit() {
            return Err(WindlassErr::ReachedMaxIteration {
                current: self.current_value,
                max: self.max_value,
            });
        }
        self.current_value += 1;
        Ok(())
    }

    /// Extend the ceiling after a refusal. Headless sessions have nobody to
    /// approve the extension, so the request is ignored there.
    pub fn increase_limit(&mut self, headless_mode: bool) {
        if !headless_mode && self.hit_limit {
            self.max_value += self.limit_increase_amount;
            self.hit_limit = false;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BudgetControlFlag {
    pub current_value: f64,
    pub max_value: f64,
    pub limit_increase_amount: f64,
    #[serde(default)]
    hit_limit: bool,
}

impl BudgetControlFlag {
    pub fn new(max_value: f64, limit_increase_amount: f64) -> Self {
        Self {
            current_value: 0.0,
            max_value,
            limit_increase_amount,
            hit_limit: false,
        }
    }

    pub fn reached_limit(&mut self) -> bool {
        self.hit_limit = self.current_value >= self.max_value;
        self.hit_limit
    }

    /// Cost is accumulated externally; pull the latest total in before a
    /// check.
    pub fn sync_current(&mut self, accumulated_cost: f64) {
        self.current_value = accumulated_cost;
    }

    /// Check only; the budget flag never advances its own value.
    pub fn step(&mut self) -> Result<()> {
        if self.reached_limit() {
            return Err(WindlassErr::ReachedMaxBudget {
                current: self.current_value,
                max: self.max_value,
            });
        }
        Ok(())
    }

    /// Extend the ceiling from the current spend. Unlike iterations, an
    /// explicit budget extension is honored even in headless mode.
    pub fn increase_limit(&mut self, _headless_mode: bool) {
        if self.hit_limit {
            self.max_value = self.current_value + self.limit_increase_amount;
            self.hit_limit = false;
        }
    }
}

/// A budget flag behind a shared reference. The parent controller and every
/// delegate hold clones of the same flag, so an extension granted while a
/// delegate is running is visible to both sides.
#[derive(Debug, Clone)]
pub struct SharedBudgetFlag(Arc<Mutex<BudgetControlFlag>>);

impl SharedBudgetFlag {
    pub fn new(flag: BudgetControlFlag) -> Self {
        Self(Arc::new(Mutex::new(flag)))
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut BudgetControlFlag) -> R) -> R {
        let mut guard = match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn shares_storage_with(&self, other: &SharedBudgetFlag) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for SharedBudgetFlag {
    fn eq(&self, other: &Self) -> bool {
        if self.shares_storage_with(other) {
            return true;
        }
        let ours = self.with(|flag| flag.clone());
        other.with(|theirs| ours == *theirs)
    }
}

/// Serializes as the inner flag; deserializing produces a fresh (unshared)
/// reference, like the metrics handle.
impl Serialize for SharedBudgetFlag {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.with(|flag| flag.clone()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SharedBudgetFlag {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        Ok(SharedBudgetFlag::new(BudgetControlFlag::deserialize(
            deserializer,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_steps_until_limit() {
        let mut flag = IterationControlFlag::new(3, 10);
        for expected in 1..=3 {
            assert!(flag.step().is_ok());
            assert_eq!(flag.current_value, expected);
        }
        assert!(matches!(
            flag.step(),
            Err(WindlassErr::ReachedMaxIteration { current: 3, max: 3 })
        ));
    }

    #[test]
    fn iteration_extension_is_refused_headless() {
        let mut flag = IterationControlFlag::new(1, 5);
        assert!(flag.step().is_ok());
        assert!(flag.step().is_err());

        flag.increase_limit(true);
        assert!(flag.step().is_err(), "headless extension must not apply");

        flag.increase_limit(false);
        assert_eq!(flag.max_value, 6);
        assert!(flag.step().is_ok());
    }

    #[test]
    fn iteration_extension_requires_latched_hit() {
        let mut flag = IterationControlFlag::new(10, 5);
        flag.increase_limit(false);
        assert_eq!(flag.max_value, 10, "no hit, no extension");
    }

    #[test]
    fn budget_checks_without_advancing() {
        let mut flag = BudgetControlFlag::new(5.0, 5.0);
        assert!(flag.step().is_ok());
        assert_eq!(flag.current_value, 0.0);

        flag.sync_current(6.0);
        assert!(matches!(
            flag.step(),
            Err(WindlassErr::ReachedMaxBudget { .. })
        ));
    }

    #[test]
    fn budget_extension_ignores_headless_and_rebases_on_current() {
        let mut flag = BudgetControlFlag::new(5.0, 5.0);
        flag.sync_current(6.0);
        assert!(flag.step().is_err());

        flag.increase_limit(true);
        assert_eq!(flag.max_value, 11.0);
        assert!(flag.step().is_ok());
    }
}
