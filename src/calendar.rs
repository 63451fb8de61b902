//! Trading calendar and market state oracle
//!
//! The oracle answers one question for the engine and the sweep: may an order
//! execute right now? Anything it cannot answer with certainty (a date outside
//! the calendar's covered years, an ambiguous local time) is reported as
//! `Unknown` and treated as closed.

use crate::error::{PaperError, Result};
use crate::types::Timestamp;
use chrono::{Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Trading session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketState {
    PreMarket,
    Open,
    AfterHours,
    Closed,
    Weekend,
    Holiday,
    /// The calendar cannot classify this instant
    Unknown,
}

impl MarketState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketState::PreMarket => "PRE_MARKET",
            MarketState::Open => "OPEN",
            MarketState::AfterHours => "AFTER_HOURS",
            MarketState::Closed => "CLOSED",
            MarketState::Weekend => "WEEKEND",
            MarketState::Holiday => "HOLIDAY",
            MarketState::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "PRE_MARKET" | "PRE" => Some(MarketState::PreMarket),
            "OPEN" | "REGULAR" => Some(MarketState::Open),
            "AFTER_HOURS" | "POST" => Some(MarketState::AfterHours),
            "CLOSED" => Some(MarketState::Closed),
            "WEEKEND" => Some(MarketState::Weekend),
            "HOLIDAY" => Some(MarketState::Holiday),
            "UNKNOWN" => Some(MarketState::Unknown),
            _ => None,
        }
    }

    /// Only the regular session executes orders
    pub fn allows_execution(&self) -> bool {
        matches!(self, MarketState::Open)
    }
}

impl fmt::Display for MarketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trading session times, in the calendar's local time zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTimes {
    pub pre_market_open: NaiveTime,
    pub market_open: NaiveTime,
    pub market_close: NaiveTime,
    pub after_hours_close: NaiveTime,
}

/// Trading calendar trait
pub trait TradingCalendar: Send + Sync {
    /// Get the timezone for this calendar
    fn timezone(&self) -> Tz;

    /// Whether the calendar has holiday data for this date
    fn covers(&self, date: NaiveDate) -> bool;

    fn is_holiday(&self, date: NaiveDate) -> bool;

    /// Check if a date is a trading day
    fn is_trading_day(&self, date: NaiveDate) -> bool {
        self.covers(date) && !is_weekend(date) && !self.is_holiday(date)
    }

    /// Get session times for a date
    fn session_times(&self, date: NaiveDate) -> Option<SessionTimes>;

    /// Get the next trading day after the given date
    fn next_trading_day(&self, date: NaiveDate) -> Result<NaiveDate> {
        let mut current = date + Duration::days(1);
        while self.covers(current) {
            if self.is_trading_day(current) {
                return Ok(current);
            }
            current += Duration::days(1);
        }
        Err(PaperError::CalendarError(format!(
            "No trading day after {} within the covered years",
            date
        )))
    }

    /// Get the previous trading day before the given date
    fn previous_trading_day(&self, date: NaiveDate) -> Result<NaiveDate> {
        let mut current = date - Duration::days(1);
        while self.covers(current) {
            if self.is_trading_day(current) {
                return Ok(current);
            }
            current -= Duration::days(1);
        }
        Err(PaperError::CalendarError(format!(
            "No trading day before {} within the covered years",
            date
        )))
    }

    /// Get all trading days between two dates (inclusive)
    fn trading_days_between(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        let mut days = Vec::new();
        let mut current = start;

        while current <= end {
            if self.is_trading_day(current) {
                days.push(current);
            }
            current += Duration::days(1);
        }

        days
    }
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

/// `n`-th (1-based) occurrence of `weekday` in a month
fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u8) -> Option<NaiveDate> {
    NaiveDate::from_weekday_of_month_opt(year, month, weekday, n)
}

/// Last occurrence of `weekday` in a month
fn last_weekday(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    let mut day = first_of_next.pred_opt()?;
    while day.weekday() != weekday {
        day = day.pred_opt()?;
    }
    Some(day)
}

/// Gregorian Easter Sunday (anonymous algorithm)
fn easter_sunday(year: i32) -> Option<NaiveDate> {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32)
}

/// Saturday holidays move to Friday, Sunday holidays to Monday
fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

/// NYSE trading calendar
///
/// Holidays are derived from the exchange's rules for every year in
/// `first_year..=last_year`.
#[derive(Debug, Clone)]
pub struct NyseCalendar {
    first_year: i32,
    last_year: i32,
    holidays: HashSet<NaiveDate>,
    early_closes: HashSet<NaiveDate>,
}

impl NyseCalendar {
    /// Create a calendar covering the given years (inclusive)
    pub fn new(first_year: i32, last_year: i32) -> Self {
        let mut holidays = HashSet::new();
        let mut early_closes = HashSet::new();
        for year in first_year..=last_year {
            holidays.extend(Self::holidays_for_year(year));
            early_closes.extend(Self::early_closes_for_year(year));
        }
        // Observed holidays always win over half days
        early_closes.retain(|d| !holidays.contains(d));

        Self {
            first_year,
            last_year,
            holidays,
            early_closes,
        }
    }

    fn holidays_for_year(year: i32) -> Vec<NaiveDate> {
        let mut days = Vec::new();

        // New Year's Day falling on a Saturday is not observed on the Friday
        if let Some(new_year) = NaiveDate::from_ymd_opt(year, 1, 1) {
            if new_year.weekday() != Weekday::Sat {
                days.push(observed(new_year));
            }
        }
        days.extend(nth_weekday(year, 1, Weekday::Mon, 3)); // MLK Day
        days.extend(nth_weekday(year, 2, Weekday::Mon, 3)); // Presidents' Day
        days.extend(easter_sunday(year).map(|e| e - Duration::days(2))); // Good Friday
        days.extend(last_weekday(year, 5, Weekday::Mon)); // Memorial Day
        if year >= 2022 {
            days.extend(NaiveDate::from_ymd_opt(year, 6, 19).map(observed));
        }
        days.extend(NaiveDate::from_ymd_opt(year, 7, 4).map(observed));
        days.extend(nth_weekday(year, 9, Weekday::Mon, 1)); // Labor Day
        days.extend(nth_weekday(year, 11, Weekday::Thu, 4)); // Thanksgiving
        days.extend(NaiveDate::from_ymd_opt(year, 12, 25).map(observed));

        days
    }

    fn early_closes_for_year(year: i32) -> Vec<NaiveDate> {
        let mut days = Vec::new();
        days.extend(NaiveDate::from_ymd_opt(year, 7, 3));
        days.extend(nth_weekday(year, 11, Weekday::Thu, 4).map(|t| t + Duration::days(1)));
        days.extend(NaiveDate::from_ymd_opt(year, 12, 24));
        days.retain(|d| !is_weekend(*d));
        days
    }

    /// Add an ad-hoc closure (e.g. a national day of mourning)
    pub fn add_holiday(&mut self, date: NaiveDate) {
        self.early_closes.remove(&date);
        self.holidays.insert(date);
    }

    pub fn is_early_close(&self, date: NaiveDate) -> bool {
        self.early_closes.contains(&date)
    }

    pub fn covered_years(&self) -> (i32, i32) {
        (self.first_year, self.last_year)
    }
}

impl Default for NyseCalendar {
    fn default() -> Self {
        Self::new(2020, 2035)
    }
}

impl TradingCalendar for NyseCalendar {
    fn timezone(&self) -> Tz {
        chrono_tz::America::New_York
    }

    fn covers(&self, date: NaiveDate) -> bool {
        (self.first_year..=self.last_year).contains(&date.year())
    }

    fn is_holiday(&self, date: NaiveDate) -> bool {
        self.holidays.contains(&date)
    }

    fn session_times(&self, date: NaiveDate) -> Option<SessionTimes> {
        if !self.is_trading_day(date) {
            return None;
        }
        let (market_close, after_hours_close) = if self.is_early_close(date) {
            (hm(13, 0), hm(17, 0))
        } else {
            (hm(16, 0), hm(20, 0))
        };
        Some(SessionTimes {
            pre_market_open: hm(4, 0),
            market_open: hm(9, 30),
            market_close,
            after_hours_close,
        })
    }
}

/// Oracle answer for one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketStatus {
    pub can_execute_orders: bool,
    pub market_state: MarketState,
    /// Start of the next regular session, when the market is not open
    pub next_trading_session: Option<Timestamp>,
}

impl MarketStatus {
    /// Status for an instant the calendar cannot classify
    pub fn unknown() -> Self {
        Self {
            can_execute_orders: false,
            market_state: MarketState::Unknown,
            next_trading_session: None,
        }
    }
}

/// Market State Oracle
#[derive(Clone)]
pub struct MarketOracle {
    calendar: Arc<dyn TradingCalendar>,
}

impl MarketOracle {
    pub fn new(calendar: Arc<dyn TradingCalendar>) -> Self {
        Self { calendar }
    }

    pub fn nyse() -> Self {
        Self::new(Arc::new(NyseCalendar::default()))
    }

    pub fn calendar(&self) -> &dyn TradingCalendar {
        self.calendar.as_ref()
    }

    /// Classify `at` and decide whether orders may execute
    pub fn status(&self, at: Timestamp) -> MarketStatus {
        let tz = self.calendar.timezone();
        let local = at.with_timezone(&tz);
        let date = local.date_naive();
        let time = local.time();

        if !self.calendar.covers(date) {
            return MarketStatus::unknown();
        }

        let market_state = if is_weekend(date) {
            MarketState::Weekend
        } else if self.calendar.is_holiday(date) {
            MarketState::Holiday
        } else {
            match self.calendar.session_times(date) {
                Some(times) if time < times.pre_market_open => MarketState::Closed,
                Some(times) if time < times.market_open => MarketState::PreMarket,
                Some(times) if time < times.market_close => MarketState::Open,
                Some(times) if time < times.after_hours_close => MarketState::AfterHours,
                Some(_) => MarketState::Closed,
                None => MarketState::Unknown,
            }
        };

        let can_execute_orders = market_state.allows_execution();
        let next_trading_session = if can_execute_orders {
            None
        } else {
            self.next_session_open(at)
        };

        MarketStatus {
            can_execute_orders,
            market_state,
            next_trading_session,
        }
    }

    /// Start of the first regular session strictly after `at`
    pub fn next_session_open(&self, at: Timestamp) -> Option<Timestamp> {
        let tz = self.calendar.timezone();
        let local = at.with_timezone(&tz);
        let today = local.date_naive();

        if let Some(times) = self.calendar.session_times(today) {
            if local.time() < times.market_open {
                return self.session_instant(today, times.market_open);
            }
        }

        let next_day = self.calendar.next_trading_day(today).ok()?;
        let times = self.calendar.session_times(next_day)?;
        self.session_instant(next_day, times.market_open)
    }

    fn session_instant(&self, date: NaiveDate, time: NaiveTime) -> Option<Timestamp> {
        self.calendar
            .timezone()
            .from_local_datetime(&date.and_time(time))
            .single()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

impl fmt::Debug for MarketOracle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarketOracle")
            .field("timezone", &self.calendar.timezone())
            .finish()
    }
}

/// Source of "now" for the engine and the sweep
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// Settable clock for simulations and tests
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    pub fn new(now: Timestamp) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: Timestamp) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    /// New York local time to UTC
    fn ny(y: i32, m: u32, d: u32, hour: u32, minute: u32) -> Timestamp {
        chrono_tz::America::New_York
            .with_ymd_and_hms(y, m, d, hour, minute, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_nyse_calendar() {
        let calendar = NyseCalendar::default();

        // Test weekday
        assert!(calendar.is_trading_day(date(2024, 1, 8)));

        // Test weekend
        assert!(!calendar.is_trading_day(date(2024, 1, 6)));

        // Test holiday
        assert!(!calendar.is_trading_day(date(2024, 1, 1)));
    }

    #[test]
    fn test_rule_based_holidays_2024() {
        let calendar = NyseCalendar::default();
        let expected = [
            date(2024, 1, 1),
            date(2024, 1, 15),
            date(2024, 2, 19),
            date(2024, 3, 29),
            date(2024, 5, 27),
            date(2024, 6, 19),
            date(2024, 7, 4),
            date(2024, 9, 2),
            date(2024, 11, 28),
            date(2024, 12, 25),
        ];
        for day in expected {
            assert!(calendar.is_holiday(day), "{} should be a holiday", day);
        }
    }

    #[test]
    fn test_weekend_observance() {
        let calendar = NyseCalendar::default();
        // July 4th 2026 is a Saturday, observed Friday
        assert!(calendar.is_holiday(date(2026, 7, 3)));
        // Christmas 2022 is a Sunday, observed Monday
        assert!(calendar.is_holiday(date(2022, 12, 26)));
        // New Year's Day 2022 is a Saturday and is not observed
        assert!(!calendar.is_holiday(date(2021, 12, 31)));
        // Juneteenth not observed before 2022
        assert!(!calendar.is_holiday(date(2021, 6, 18)));
    }

    #[test]
    fn test_early_close() {
        let calendar = NyseCalendar::default();
        let black_friday = date(2024, 11, 29);
        assert!(calendar.is_early_close(black_friday));
        let times = calendar.session_times(black_friday).unwrap();
        assert_eq!(times.market_close.hour(), 13);

        let oracle = MarketOracle::nyse();
        assert_eq!(oracle.status(ny(2024, 11, 29, 12, 0)).market_state, MarketState::Open);
        assert_eq!(
            oracle.status(ny(2024, 11, 29, 14, 0)).market_state,
            MarketState::AfterHours
        );
    }

    #[test]
    fn test_next_trading_day() {
        let calendar = NyseCalendar::default();
        let friday = date(2024, 1, 5);
        assert_eq!(calendar.next_trading_day(friday).unwrap(), date(2024, 1, 8));
        // Skips Good Friday
        assert_eq!(
            calendar.previous_trading_day(date(2024, 4, 1)).unwrap(),
            date(2024, 3, 28)
        );
    }

    #[test]
    fn test_trading_days_between() {
        let calendar = NyseCalendar::default();
        let days = calendar.trading_days_between(date(2024, 1, 8), date(2024, 1, 12));
        assert_eq!(days.len(), 5);
    }

    #[test]
    fn test_session_states() {
        let oracle = MarketOracle::nyse();
        let cases = [
            (ny(2024, 1, 9, 3, 0), MarketState::Closed),
            (ny(2024, 1, 9, 8, 0), MarketState::PreMarket),
            (ny(2024, 1, 9, 9, 30), MarketState::Open),
            (ny(2024, 1, 9, 15, 59), MarketState::Open),
            (ny(2024, 1, 9, 16, 0), MarketState::AfterHours),
            (ny(2024, 1, 9, 21, 0), MarketState::Closed),
            (ny(2024, 1, 13, 12, 0), MarketState::Weekend),
            (ny(2024, 12, 25, 12, 0), MarketState::Holiday),
        ];
        for (at, expected) in cases {
            let status = oracle.status(at);
            assert_eq!(status.market_state, expected, "at {}", at);
            assert_eq!(status.can_execute_orders, expected == MarketState::Open);
        }
    }

    #[test]
    fn test_next_session_after_weekend() {
        let oracle = MarketOracle::nyse();
        let status = oracle.status(ny(2024, 1, 13, 12, 0));
        assert_eq!(status.next_trading_session, Some(ny(2024, 1, 16, 9, 30)));

        let early = oracle.status(ny(2024, 1, 9, 8, 0));
        assert_eq!(early.next_trading_session, Some(ny(2024, 1, 9, 9, 30)));

        let open = oracle.status(ny(2024, 1, 9, 10, 0));
        assert_eq!(open.next_trading_session, None);
    }

    #[test]
    fn test_uncovered_year_fails_closed() {
        let oracle = MarketOracle::new(Arc::new(NyseCalendar::new(2024, 2025)));
        let status = oracle.status(ny(2030, 3, 5, 11, 0));
        assert_eq!(status.market_state, MarketState::Unknown);
        assert!(!status.can_execute_orders);

        // Last covered day has no next session
        let last = oracle.status(ny(2025, 12, 31, 18, 0));
        assert_eq!(last.next_trading_session, None);
    }

    #[test]
    fn test_manual_clock() {
        let start = ny(2024, 1, 9, 10, 0);
        let clock = ManualClock::new(start);
        clock.advance(Duration::hours(2));
        assert_eq!(clock.now(), start + Duration::hours(2));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }
}
