use std::collections::HashSet;

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use tracing::debug;

use crate::error::EngineError;
use crate::models::Term;

/// Ordered business days of a term: the interpolation axis for deadlines.
///
/// Weeks `1..max_week` contribute Monday through Friday (week 0 and the final
/// week are orientation and finals, and never carry interpolated deadlines).
/// Holidays are removed. The list is sorted, de-duplicated and never empty.
#[derive(Debug, Clone)]
pub struct BusinessCalendar {
    days: Vec<NaiveDate>,
}

impl BusinessCalendar {
    pub fn build(term: &Term, holidays: &[NaiveDate]) -> Result<Self, EngineError> {
        let max_week = term.weeks.iter().map(|w| w.week_nbr).max().unwrap_or(0);
        let holidays: HashSet<NaiveDate> = holidays.iter().copied().collect();

        let mut days = Vec::with_capacity(75);
        for week in 1..max_week {
            for entry in term.weeks.iter().filter(|w| w.week_nbr == week) {
                days.extend((0..5).map(|offset| entry.monday + Duration::days(offset)));
            }
        }
        days.retain(|day| !holidays.contains(day));
        days.sort_unstable();
        days.dedup();

        if days.is_empty() {
            return Err(EngineError::EmptyCalendar(term.key.clone()));
        }

        debug!(term = %term.key, business_days = days.len(), "built term calendar");
        Ok(Self { days })
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn last_index(&self) -> usize {
        self.days.len() - 1
    }

    /// Day at a business-day ordinal, clamped into the term.
    pub fn day(&self, index: i64) -> NaiveDate {
        let clamped = index.clamp(0, self.last_index() as i64) as usize;
        self.days[clamped]
    }

    /// Exact match, else the first business day not before `date`.
    /// Dates after the last business day map to the last index.
    pub fn index_on_or_after(&self, date: NaiveDate) -> usize {
        match self.days.binary_search(&date) {
            Ok(index) => index,
            Err(index) => index.min(self.last_index()),
        }
    }
}

pub fn is_weekday(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Weekdays `d` with `from <= d < today`; zero when `from` is not before `today`.
pub fn weekdays_since(from: NaiveDate, today: NaiveDate) -> i64 {
    from.iter_days()
        .take_while(|day| *day < today)
        .filter(|day| is_weekday(*day))
        .count() as i64
}
