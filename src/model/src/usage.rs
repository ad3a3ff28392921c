//! Mutable per-key spending counters.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use session_amount::Amount;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub transaction_count: u64,
    pub total_spent: Amount,
    pub spent_today: Amount,
    pub last_reset_day: NaiveDate,
    pub last_used: Option<DateTime<Utc>>,
    pub last_nonce: u64,
}

impl Usage {
    pub fn zero(today: NaiveDate) -> Self {
        Usage {
            transaction_count: 0,
            total_spent: Amount::zero(),
            spent_today: Amount::zero(),
            last_reset_day: today,
            last_used: None,
            last_nonce: 0,
        }
    }

    /// What `spent_today` *would* read as against `today`, without
    /// mutating anything — the daily cap check on the read path must
    /// never reset the counter itself (P6).
    pub fn effective_spent_today(&self, today: NaiveDate) -> Amount {
        if self.last_reset_day == today {
            self.spent_today.clone()
        } else {
            Amount::zero()
        }
    }

    /// Applies a successful spend: bumps the transaction count, adds to
    /// the lifetime and (possibly freshly reset) daily totals, and
    /// advances the nonce high-water mark. Called under the key's lock.
    pub fn record(&mut self, amount: &Amount, nonce: u64, today: NaiveDate, now: DateTime<Utc>) {
        self.transaction_count += 1;
        self.total_spent = self.total_spent.add(amount);
        if self.last_reset_day != today {
            self.spent_today = Amount::zero();
            self.last_reset_day = today;
        }
        self.spent_today = self.spent_today.add(amount);
        self.last_used = Some(now);
        self.last_nonce = nonce;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn daily_reset_read_path_does_not_mutate() {
        let today = Utc::now().date_naive();
        let mut usage = Usage::zero(today);
        usage.spent_today = Amount::parse("5.00").unwrap();
        let yesterday = today - Duration::days(1);
        usage.last_reset_day = yesterday;

        let effective = usage.effective_spent_today(today);
        assert_eq!(effective.format(), "0");
        // Must be unchanged — the read path never resets the stored value.
        assert_eq!(usage.last_reset_day, yesterday);
        assert_eq!(usage.spent_today.format(), "5");
    }

    #[test]
    fn record_resets_daily_total_on_new_day() {
        let today = Utc::now().date_naive();
        let mut usage = Usage::zero(today);
        usage.spent_today = Amount::parse("5.00").unwrap();
        usage.last_reset_day = today - Duration::days(1);

        usage.record(&Amount::parse("1.00").unwrap(), 1, today, Utc::now());
        assert_eq!(usage.spent_today.format(), "1");
        assert_eq!(usage.total_spent.format(), "1");
        assert_eq!(usage.last_nonce, 1);
        assert_eq!(usage.transaction_count, 1);
    }
}
