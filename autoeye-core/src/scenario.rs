//! Scenario builder: transitions and deals derived from the element set.
//!
//! A transition is anchored on a live H1 zone the price is interacting
//! with and waits for an M15 confirmation in the same direction. A triggered
//! transition produces at most one deal, which then tracks price through its
//! own state machine. Both kinds are keyed by content-derived ids and only
//! ever move forward; nothing here owns elements, it refers to them by id.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    price_key, DealState, Direction, Element, ElementId, ElementKind, ElementType, FvgStatus,
    Lifecycle, LifecycleError, ScenarioId, SnrStatus, Timeframe, TransitionState,
};
use crate::reconcile::ChangeKind;
use crate::snapshot::SymbolSnapshot;
use crate::trend::TrendDirection;

pub const ANCHOR_TIMEFRAME: Timeframe = Timeframe::H1;
pub const CONFIRM_TIMEFRAME: Timeframe = Timeframe::M15;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub enabled: bool,
    pub expiry_hours: i64,
    /// Skip deals with no take-profit target.
    pub require_tp: bool,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            expiry_hours: 12,
            require_tp: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    TrendContinuation,
    ReversalAtOpposite,
}

impl TransitionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransitionKind::TrendContinuation => "trend_continuation",
            TransitionKind::ReversalAtOpposite => "reversal_at_opposite",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceZone {
    pub low: f64,
    pub high: f64,
}

impl PriceZone {
    pub fn contains(&self, price: f64) -> bool {
        price >= self.low && price <= self.high
    }

    pub fn size(&self) -> f64 {
        self.high - self.low
    }
}

impl From<(f64, f64)> for PriceZone {
    fn from((low, high): (f64, f64)) -> Self {
        PriceZone { low, high }
    }
}

/// What a transition waits for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conditions {
    pub anchor_id: ElementId,
    pub anchor_type: ElementType,
    pub anchor_zone: PriceZone,
    pub direction: Direction,
    pub confirm_timeframe: Timeframe,
    /// Confirmations must form at or after this time.
    pub confirm_after: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub id: ScenarioId,
    pub symbol: String,
    pub kind: TransitionKind,
    pub state: TransitionState,
    pub trend_at_creation: TrendDirection,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub conditions: Conditions,
    pub evidence_ids: Vec<ElementId>,
    #[serde(default)]
    pub confirmation_id: Option<ElementId>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealSide {
    Long,
    Short,
}

impl DealSide {
    fn from_direction(d: Direction) -> Self {
        match d {
            Direction::Bullish => DealSide::Long,
            Direction::Bearish => DealSide::Short,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TakeProfit {
    pub price: f64,
    pub target_id: ElementId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub id: ScenarioId,
    pub symbol: String,
    pub state: DealState,
    pub side: DealSide,
    pub transition_ref: ScenarioId,
    pub entry: PriceZone,
    pub sl: f64,
    #[serde(default)]
    pub tp: Option<TakeProfit>,
    pub evidence_ids: Vec<ElementId>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub armed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
}

/// Persisted scenarios of one symbol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioBook {
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub deals: Vec<Deal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioKind {
    Transition,
    Deal,
}

/// One inserted or advanced scenario, for the change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioChange {
    pub id: ScenarioId,
    pub kind: ScenarioKind,
    pub change: ChangeKind,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioOutcome {
    pub book: ScenarioBook,
    pub changes: Vec<ScenarioChange>,
    pub transitions_created: usize,
    pub deals_created: usize,
}

/// Recompute scenarios for `snapshot` on top of `prior`.
///
/// New transitions are generated first so they can trigger in the same
/// cycle; deals are derived from triggered transitions afterwards.
pub fn build(
    prior: Option<&ScenarioBook>,
    snapshot: &SymbolSnapshot,
    trend: TrendDirection,
    config: &ScenarioConfig,
    now: DateTime<Utc>,
) -> Result<ScenarioOutcome, LifecycleError> {
    let mut book = prior.cloned().unwrap_or_default();
    let mut changes = Vec::new();
    let price = snapshot.market.price;
    let htf: Vec<&Element> = elements_of(snapshot, ANCHOR_TIMEFRAME);
    let ltf: Vec<&Element> = elements_of(snapshot, CONFIRM_TIMEFRAME);
    let expiry = Duration::hours(config.expiry_hours.max(1));

    let mut transitions_created = 0;
    if let (Some(price), Some(trend_dir)) = (price, trend.as_direction()) {
        let wanted = [
            (TransitionKind::TrendContinuation, trend_dir),
            (TransitionKind::ReversalAtOpposite, trend_dir.opposite()),
        ];
        for (kind, direction) in wanted {
            let Some(anchor) = select_anchor(&htf, direction, price, now) else {
                continue;
            };
            let id = ScenarioId::from_seed(&[
                "transition",
                &snapshot.symbol,
                kind.as_str(),
                direction.as_str(),
                anchor.id.as_str(),
            ]);
            if book.transitions.iter().any(|t| t.id == id) {
                continue;
            }
            book.transitions.push(Transition {
                id: id.clone(),
                symbol: snapshot.symbol.clone(),
                kind,
                state: TransitionState::Active,
                trend_at_creation: trend,
                created_at: now,
                expires_at: now + expiry,
                conditions: Conditions {
                    anchor_id: anchor.id.clone(),
                    anchor_type: anchor.element_type(),
                    anchor_zone: anchor.zone().into(),
                    direction,
                    confirm_timeframe: CONFIRM_TIMEFRAME,
                    confirm_after: anchor.signal_time(),
                },
                evidence_ids: vec![anchor.id.clone()],
                confirmation_id: None,
                closed_at: None,
            });
            transitions_created += 1;
            changes.push(ScenarioChange {
                id,
                kind: ScenarioKind::Transition,
                change: ChangeKind::Inserted,
                state: String::new(),
            });
        }
    }

    for transition in book.transitions.iter_mut() {
        if transition.state != TransitionState::Active {
            continue;
        }
        let next = advance_transition(transition, &htf, &ltf, now);
        if let Some((state, confirmation)) = next {
            transition.state = transition.state.advance(state)?;
            transition.closed_at = Some(now);
            if let Some(c) = confirmation {
                transition.evidence_ids.push(c.clone());
                transition.confirmation_id = Some(c);
            }
            record(&mut changes, &transition.id, ScenarioKind::Transition, state.label());
        }
    }

    let mut deals_created = 0;
    if let Some(price) = price {
        let triggered: Vec<Transition> = book
            .transitions
            .iter()
            .filter(|t| t.state == TransitionState::Triggered)
            .filter(|t| !book.deals.iter().any(|d| d.transition_ref == t.id))
            .cloned()
            .collect();
        for transition in triggered {
            if let Some(deal) = build_deal(&transition, &htf, &ltf, price, config, now, expiry) {
                deals_created += 1;
                changes.push(ScenarioChange {
                    id: deal.id.clone(),
                    kind: ScenarioKind::Deal,
                    change: ChangeKind::Inserted,
                    state: String::new(),
                });
                book.deals.push(deal);
            }
        }
    }

    for i in 0..book.deals.len() {
        if book.deals[i].state.is_terminal() {
            continue;
        }
        let transition = book
            .transitions
            .iter()
            .find(|t| t.id == book.deals[i].transition_ref);
        let Some(next) = advance_deal(&book.deals[i], transition, &htf, price, now) else {
            continue;
        };
        let deal = &mut book.deals[i];
        deal.state = deal.state.advance(next)?;
        match next {
            DealState::Armed => deal.armed_at = Some(now),
            DealState::Entered => deal.entered_at = Some(now),
            _ => deal.closed_at = Some(now),
        }
        let id = deal.id.clone();
        record(&mut changes, &id, ScenarioKind::Deal, next.label());
    }

    // inserted entries carry their state after this cycle
    for change in changes.iter_mut().filter(|c| c.change == ChangeKind::Inserted) {
        change.state = match change.kind {
            ScenarioKind::Transition => book
                .transitions
                .iter()
                .find(|t| t.id == change.id)
                .map(|t| t.state.label())
                .unwrap_or_default()
                .to_string(),
            ScenarioKind::Deal => book
                .deals
                .iter()
                .find(|d| d.id == change.id)
                .map(|d| d.state.label())
                .unwrap_or_default()
                .to_string(),
        };
    }

    book.transitions
        .sort_by(|a, b| (a.created_at, a.id.as_str()).cmp(&(b.created_at, b.id.as_str())));
    book.deals
        .sort_by(|a, b| (a.created_at, a.id.as_str()).cmp(&(b.created_at, b.id.as_str())));

    Ok(ScenarioOutcome {
        book,
        changes,
        transitions_created,
        deals_created,
    })
}

fn elements_of(snapshot: &SymbolSnapshot, tf: Timeframe) -> Vec<&Element> {
    snapshot
        .timeframe(tf)
        .map(|s| {
            s.elements
                .iter()
                .filter(|e| matches!(e.element_type(), ElementType::Fvg | ElementType::Snr))
                .collect()
        })
        .unwrap_or_default()
}

/// An inserted entry already reports its final state; only record updates
/// for entries that existed before this cycle.
fn record(changes: &mut Vec<ScenarioChange>, id: &ScenarioId, kind: ScenarioKind, state: &str) {
    if changes
        .iter()
        .any(|c| &c.id == id && c.change == ChangeKind::Inserted)
    {
        return;
    }
    changes.push(ScenarioChange {
        id: id.clone(),
        kind,
        change: ChangeKind::Updated,
        state: state.to_string(),
    });
}

/// Price is interacting with the element: inside its zone, or the zone has
/// already been touched/retested.
fn interacts(element: &Element, price: f64) -> bool {
    let (low, high) = element.zone();
    let inside = price >= low && price <= high;
    let revisited = match &element.kind {
        ElementKind::Fvg(fvg) => fvg.status == FvgStatus::Touched,
        ElementKind::Snr(snr) => snr.status == SnrStatus::Retested,
        ElementKind::Fractal(_) => false,
    };
    inside || revisited
}

/// Latest signal first, then the tighter zone, then the id.
fn rank(a: &&Element, b: &&Element) -> std::cmp::Ordering {
    let size = |e: &Element| {
        let (l, h) = e.zone();
        h - l
    };
    b.signal_time()
        .cmp(&a.signal_time())
        .then(size(*a).total_cmp(&size(*b)))
        .then(a.id.cmp(&b.id))
}

fn select_anchor<'a>(
    htf: &[&'a Element],
    direction: Direction,
    price: f64,
    now: DateTime<Utc>,
) -> Option<&'a Element> {
    htf.iter()
        .copied()
        .filter(|e| !e.is_terminal())
        .filter(|e| e.direction() == Some(direction))
        .filter(|e| e.signal_time() <= now)
        .filter(|e| interacts(e, price))
        .min_by(rank)
}

fn select_confirmation<'a>(
    ltf: &[&'a Element],
    direction: Direction,
    after: DateTime<Utc>,
) -> Option<&'a Element> {
    ltf.iter()
        .copied()
        .filter(|e| !e.is_terminal())
        .filter(|e| e.direction() == Some(direction))
        .filter(|e| e.signal_time() >= after)
        .min_by(rank)
}

fn advance_transition(
    transition: &Transition,
    htf: &[&Element],
    ltf: &[&Element],
    now: DateTime<Utc>,
) -> Option<(TransitionState, Option<ElementId>)> {
    if transition.expires_at <= now {
        return Some((TransitionState::Expired, None));
    }
    let anchor = htf.iter().find(|e| e.id == transition.conditions.anchor_id);
    match anchor {
        None => return Some((TransitionState::Invalid, None)),
        Some(a) if a.is_terminal() => return Some((TransitionState::Invalid, None)),
        Some(_) => {}
    }
    let c = &transition.conditions;
    select_confirmation(ltf, c.direction, c.confirm_after)
        .map(|e| (TransitionState::Triggered, Some(e.id.clone())))
}

/// Nearest live H1 zone edge beyond `price` in the trade direction.
fn choose_take_profit(
    htf: &[&Element],
    side: DealSide,
    price: f64,
    exclude: &ElementId,
) -> Option<TakeProfit> {
    htf.iter()
        .copied()
        .filter(|e| !e.is_terminal() && &e.id != exclude)
        .filter_map(|e| {
            let (low, high) = e.zone();
            let (level, distance) = match side {
                DealSide::Long if low > price => (low, low - price),
                DealSide::Short if high < price => (high, price - high),
                _ => return None,
            };
            Some((distance, e, level))
        })
        .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.id.cmp(&b.1.id)))
        .map(|(_, e, level)| TakeProfit {
            price: level,
            target_id: e.id.clone(),
        })
}

#[allow(clippy::too_many_arguments)]
fn build_deal(
    transition: &Transition,
    htf: &[&Element],
    ltf: &[&Element],
    price: f64,
    config: &ScenarioConfig,
    now: DateTime<Utc>,
    expiry: Duration,
) -> Option<Deal> {
    let confirmation_id = transition.confirmation_id.as_ref()?;
    let confirmation = ltf.iter().find(|e| &e.id == confirmation_id)?;
    let anchor = htf
        .iter()
        .find(|e| e.id == transition.conditions.anchor_id)?;

    let side = DealSide::from_direction(transition.conditions.direction);
    let entry: PriceZone = confirmation.zone().into();
    let (anchor_low, anchor_high) = anchor.zone();
    let sl = match side {
        DealSide::Long => anchor_low,
        DealSide::Short => anchor_high,
    };
    let tp = choose_take_profit(htf, side, price, &anchor.id);
    if tp.is_none() && config.require_tp {
        return None;
    }

    let tp_key = tp
        .as_ref()
        .map(|t| price_key(t.price))
        .unwrap_or_else(|| "none".to_string());
    let id = ScenarioId::from_seed(&[
        "deal",
        &transition.symbol,
        transition.id.as_str(),
        confirmation_id.as_str(),
        &price_key(entry.low),
        &price_key(entry.high),
        &price_key(sl),
        &tp_key,
    ]);

    let mut evidence_ids = transition.evidence_ids.clone();
    if let Some(t) = &tp {
        evidence_ids.push(t.target_id.clone());
    }

    Some(Deal {
        id,
        symbol: transition.symbol.clone(),
        state: DealState::Candidate,
        side,
        transition_ref: transition.id.clone(),
        entry,
        sl,
        tp,
        evidence_ids,
        created_at: now,
        expires_at: now + expiry,
        armed_at: None,
        entered_at: None,
        closed_at: None,
    })
}

fn advance_deal(
    deal: &Deal,
    transition: Option<&Transition>,
    htf: &[&Element],
    price: Option<f64>,
    now: DateTime<Utc>,
) -> Option<DealState> {
    if deal.expires_at <= now {
        return Some(DealState::Expired);
    }
    let transition_dead = match transition {
        None => true,
        Some(t) => t.state == TransitionState::Invalid,
    };
    let anchor_dead = transition
        .map(|t| {
            htf.iter()
                .find(|e| e.id == t.conditions.anchor_id)
                .map(|e| e.is_terminal())
                .unwrap_or(true)
        })
        .unwrap_or(true);
    if transition_dead || anchor_dead {
        return Some(DealState::Cancelled);
    }

    let price = price?;
    let stopped = match deal.side {
        DealSide::Long => price <= deal.sl,
        DealSide::Short => price >= deal.sl,
    };
    if stopped {
        return Some(DealState::Cancelled);
    }

    match deal.state {
        DealState::Candidate if deal.entry.contains(price) => Some(DealState::Armed),
        DealState::Armed => {
            let left = match deal.side {
                DealSide::Long => price > deal.entry.high,
                DealSide::Short => price < deal.entry.low,
            };
            left.then_some(DealState::Entered)
        }
        _ => None,
    }
}
