//! Tour State Machine & Prefetch Pipeline (spec.md §4.7-4.8, C7+C8).
//!
//! Sits above `docent_orchestrator`: every tour narration (live or
//! prefetched) is an ordinary `ask_prefetch`/`ask` request driven through
//! `Orchestrator::ask`, so this crate owns only the *sequencing* — which
//! stop is current, which upcoming stops are being prefetched, and how an
//! interrupting question folds back into the tour once it resolves.

mod collect;
mod machine;
mod narration;
mod prefetch;

pub use machine::{StartTourRequest, TourMachine};
pub use prefetch::PrefetchPipeline;
