//! Table-driven state machines for call control and media negotiation.
//!
//! The tables are the single source of truth for what each machine accepts;
//! the call task only interprets them. Lookups that miss are dropped with a
//! warning rather than treated as errors, since overlapping push
//! notifications routinely arrive after a call has moved on.

mod call_table;
mod media_table;
pub mod types;

pub use call_table::lookup as call_lookup;
pub use media_table::lookup as media_lookup;
pub use types::{
    CallAction, CallEventKind, CallState, CallTransition, MediaAction, MediaEventKind, MediaState,
    MediaTransition,
};
