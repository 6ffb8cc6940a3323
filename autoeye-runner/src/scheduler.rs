//! Scheduling context: which (symbol, timeframe) pairs are due.
//!
//! Each pair becomes due when its timeframe's current bar closes. A pair is
//! claimed with `try_begin` and stays claimed until `complete` (success,
//! next due at the following bar close) or `release` (failure, still due).
//! A claimed pair is never handed out twice, so full-scan and incremental
//! runs for the same pair cannot overlap.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;

use autoeye_core::domain::Timeframe;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PairSchedule {
    next_due: Option<DateTime<Utc>>,
    in_flight: bool,
}

/// Due times and in-flight flags for every tracked pair.
#[derive(Debug, Default)]
pub struct SchedulerContext {
    pairs: Mutex<BTreeMap<(String, Timeframe), PairSchedule>>,
}

impl SchedulerContext {
    /// Every pair starts due.
    pub fn new(symbols: &[String], timeframes: &[Timeframe]) -> Self {
        let pairs = symbols
            .iter()
            .flat_map(|s| {
                timeframes
                    .iter()
                    .map(move |tf| ((s.clone(), *tf), PairSchedule::default()))
            })
            .collect();
        Self {
            pairs: Mutex::new(pairs),
        }
    }

    /// Pairs due at `now` and not in flight, grouped by symbol.
    pub fn due(&self, now: DateTime<Utc>) -> BTreeMap<String, Vec<Timeframe>> {
        let pairs = self.pairs.lock().unwrap();
        let mut out: BTreeMap<String, Vec<Timeframe>> = BTreeMap::new();
        for ((symbol, tf), schedule) in pairs.iter() {
            if !schedule.in_flight && schedule.next_due.map_or(true, |due| due <= now) {
                out.entry(symbol.clone()).or_default().push(*tf);
            }
        }
        out
    }

    /// Claim a pair; false when it is unknown or already in flight.
    pub fn try_begin(&self, symbol: &str, timeframe: Timeframe) -> bool {
        let mut pairs = self.pairs.lock().unwrap();
        match pairs.get_mut(&(symbol.to_string(), timeframe)) {
            Some(schedule) if !schedule.in_flight => {
                schedule.in_flight = true;
                true
            }
            _ => false,
        }
    }

    /// Finish a claimed pair; it is next due when the bar open at `now` closes.
    pub fn complete(&self, symbol: &str, timeframe: Timeframe, now: DateTime<Utc>) {
        let mut pairs = self.pairs.lock().unwrap();
        if let Some(schedule) = pairs.get_mut(&(symbol.to_string(), timeframe)) {
            schedule.in_flight = false;
            schedule.next_due = Some(timeframe.next_boundary(now));
        }
    }

    /// Give up a claimed pair without moving its due time.
    pub fn release(&self, symbol: &str, timeframe: Timeframe) {
        let mut pairs = self.pairs.lock().unwrap();
        if let Some(schedule) = pairs.get_mut(&(symbol.to_string(), timeframe)) {
            schedule.in_flight = false;
        }
    }

    /// Make every idle pair due immediately.
    pub fn mark_all_due(&self) {
        let mut pairs = self.pairs.lock().unwrap();
        for schedule in pairs.values_mut().filter(|s| !s.in_flight) {
            schedule.next_due = None;
        }
    }

    /// Make the idle pairs of `symbols` due immediately; others keep their times.
    pub fn mark_symbols_due(&self, symbols: &[String]) {
        let mut pairs = self.pairs.lock().unwrap();
        for ((symbol, _), schedule) in pairs.iter_mut() {
            if !schedule.in_flight && symbols.contains(symbol) {
                schedule.next_due = None;
            }
        }
    }

    pub fn next_due(&self, symbol: &str, timeframe: Timeframe) -> Option<DateTime<Utc>> {
        self.pairs
            .lock()
            .unwrap()
            .get(&(symbol.to_string(), timeframe))
            .and_then(|s| s.next_due)
    }

    /// Earliest due time across idle pairs; `None` when one is due now.
    pub fn earliest_due(&self) -> Option<DateTime<Utc>> {
        let pairs = self.pairs.lock().unwrap();
        let mut earliest: Option<DateTime<Utc>> = None;
        for schedule in pairs.values().filter(|s| !s.in_flight) {
            let due = schedule.next_due?;
            earliest = Some(earliest.map_or(due, |e| e.min(due)));
        }
        earliest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn ctx() -> SchedulerContext {
        SchedulerContext::new(
            &["EURUSD".to_string(), "XAUUSD".to_string()],
            &[Timeframe::M15, Timeframe::H1],
        )
    }

    #[test]
    fn everything_starts_due() {
        let now = Utc.with_ymd_and_hms(2026, 2, 2, 10, 7, 0).unwrap();
        let due = ctx().due(now);
        assert_eq!(due.len(), 2);
        assert_eq!(due["EURUSD"], vec![Timeframe::M15, Timeframe::H1]);
    }

    #[test]
    fn completion_waits_for_next_bar_close() {
        let sched = ctx();
        let now = Utc.with_ymd_and_hms(2026, 2, 2, 10, 7, 0).unwrap();
        assert!(sched.try_begin("EURUSD", Timeframe::M15));
        sched.complete("EURUSD", Timeframe::M15, now);
        assert_eq!(
            sched.next_due("EURUSD", Timeframe::M15),
            Some(Utc.with_ymd_and_hms(2026, 2, 2, 10, 15, 0).unwrap())
        );

        assert!(!sched.due(now)["EURUSD"].contains(&Timeframe::M15));
        let later = now + Duration::minutes(8);
        assert!(sched.due(later)["EURUSD"].contains(&Timeframe::M15));
    }

    #[test]
    fn in_flight_pair_cannot_be_claimed_twice() {
        let sched = ctx();
        let now = Utc.with_ymd_and_hms(2026, 2, 2, 10, 7, 0).unwrap();
        assert!(sched.try_begin("XAUUSD", Timeframe::H1));
        assert!(!sched.try_begin("XAUUSD", Timeframe::H1));
        assert!(!sched.due(now)["XAUUSD"].contains(&Timeframe::H1));
        assert!(!sched.try_begin("GBPUSD", Timeframe::H1));

        // failure leaves the pair due for the next tick
        sched.release("XAUUSD", Timeframe::H1);
        assert!(sched.due(now)["XAUUSD"].contains(&Timeframe::H1));
        assert_eq!(sched.next_due("XAUUSD", Timeframe::H1), None);
    }

    #[test]
    fn mark_all_due_resets_idle_pairs() {
        let sched = ctx();
        let now = Utc.with_ymd_and_hms(2026, 2, 2, 10, 7, 0).unwrap();
        for symbol in ["EURUSD", "XAUUSD"] {
            for tf in [Timeframe::M15, Timeframe::H1] {
                assert!(sched.try_begin(symbol, tf));
                sched.complete(symbol, tf, now);
            }
        }
        assert!(sched.due(now).is_empty());
        assert_eq!(
            sched.earliest_due(),
            Some(Utc.with_ymd_and_hms(2026, 2, 2, 10, 15, 0).unwrap())
        );
        sched.mark_all_due();
        assert_eq!(sched.due(now).len(), 2);
        assert_eq!(sched.earliest_due(), None);
    }

    #[test]
    fn marking_symbols_due_leaves_others_scheduled() {
        let sched = ctx();
        let now = Utc.with_ymd_and_hms(2026, 2, 2, 10, 7, 0).unwrap();
        for symbol in ["EURUSD", "XAUUSD"] {
            for tf in [Timeframe::M15, Timeframe::H1] {
                assert!(sched.try_begin(symbol, tf));
                sched.complete(symbol, tf, now);
            }
        }
        assert!(sched.try_begin("XAUUSD", Timeframe::H1));

        sched.mark_symbols_due(&["XAUUSD".to_string()]);
        let due = sched.due(now);
        assert_eq!(due.len(), 1);
        assert_eq!(due["XAUUSD"], vec![Timeframe::M15]);
        assert_eq!(sched.next_due("XAUUSD", Timeframe::M15), None);
        // in-flight pairs keep their time
        assert!(sched.next_due("XAUUSD", Timeframe::H1).is_some());
        assert_eq!(
            sched.next_due("EURUSD", Timeframe::M15),
            Some(Utc.with_ymd_and_hms(2026, 2, 2, 10, 15, 0).unwrap())
        );
    }
}
