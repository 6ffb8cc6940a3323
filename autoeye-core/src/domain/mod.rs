//! Domain types for AutoEye

pub mod bar;
pub mod element;
pub mod ids;
pub mod status;
pub mod timeframe;

pub use bar::{validate_window, Bar, BarSequenceError};
pub use element::{
    BreakType, Direction, Element, ElementKind, ElementType, Fractal, FractalType, Fvg, LRule,
    MitigationTrigger, Snr, SnrRole,
};
pub use ids::{content_hash, price_key, ElementId, ScenarioId};
pub use status::{
    DealState, FractalStatus, FvgStatus, Lifecycle, LifecycleError, SnrStatus, TransitionState,
};
pub use timeframe::{Timeframe, TimeframeParseError};
