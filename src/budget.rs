use rustc_hash::FxHashMap;
use tracing::trace;
use crate::safe_converter::{PrecheckedCast, SafeCast};

/// budget id 0 means that a window is not backed by a shared budget
pub const NO_BUDGET: u64 = 0;

#[derive(Default)]
struct Budget {
    available: u64,
    watchers: Vec<u64>,
}

/// Shared credit pools that several streams draw from in addition to their own windows. A
///  stream whose claim cannot be satisfied is registered as a watcher and should retry when
///  [`BudgetDebitor::flush`] lists it after the budget was credited.
#[derive(Default)]
pub struct BudgetDebitor {
    budgets: FxHashMap<u64, Budget>,
}

impl BudgetDebitor {
    pub fn new() -> BudgetDebitor {
        Default::default()
    }

    pub fn available(&self, budget_id: u64) -> u64 {
        self.budgets.get(&budget_id)
            .map(|b| b.available)
            .unwrap_or(0)
    }

    pub fn credit(&mut self, budget_id: u64, amount: u64) -> u64 {
        let budget = self.budgets.entry(budget_id).or_default();
        budget.available += amount;
        trace!("budget {}: credited {}, now {}", budget_id, amount, budget.available);
        budget.available
    }

    /// Claims up to `maximum` bytes: all of `maximum` if available, otherwise whatever is left
    ///  if that is at least `minimum`, otherwise nothing.
    pub fn claim(&mut self, budget_id: u64, watcher: u64, minimum: u32, maximum: u32) -> u32 {
        if budget_id == NO_BUDGET {
            return maximum;
        }

        let budget = self.budgets.entry(budget_id).or_default();
        let minimum: u64 = minimum.max(1).safe_cast();
        let maximum_u64: u64 = maximum.safe_cast();

        let claimed = if budget.available >= maximum_u64 {
            maximum_u64
        }
        else if budget.available >= minimum {
            budget.available
        }
        else {
            0
        };

        if claimed == 0 {
            if maximum > 0 && !budget.watchers.contains(&watcher) {
                trace!("budget {}: {} waiting for credit", budget_id, watcher);
                budget.watchers.push(watcher);
            }
        }
        else {
            budget.available -= claimed;
            budget.watchers.retain(|w| *w != watcher);
        }
        claimed.prechecked_cast()
    }

    /// stops watching the budget, e.g. because the watcher's stream is closed
    pub fn release(&mut self, budget_id: u64, watcher: u64) {
        if let Some(budget) = self.budgets.get_mut(&budget_id) {
            budget.watchers.retain(|w| *w != watcher);
        }
    }

    /// Returns the watchers that should retry their claims, in registration order. Watchers are
    ///  only listed if there is credit available, and they must register again (by claiming)
    ///  if their retry fails.
    pub fn flush(&mut self, budget_id: u64) -> Vec<u64> {
        match self.budgets.get_mut(&budget_id) {
            Some(budget) if budget.available > 0 => std::mem::take(&mut budget.watchers),
            _ => Vec::new(),
        }
    }
}
