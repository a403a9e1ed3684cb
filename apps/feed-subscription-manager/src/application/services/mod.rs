//! Application Services
//!
//! - `WatchlistService`: watchlist use cases over the subscription ledger
//! - `SessionScheduler`: daily end-of-day trigger

mod scheduler;
mod watchlist;

pub use scheduler::SessionScheduler;
pub use watchlist::{
    AddOutcome, AddWatchlistRequest, EodSummary, FailedInstrument, PreloadReport, RestoreReport,
    WatchlistService,
};
