//! Link bandwidth limits
//!
//! Resolves per-stream bpp against every bandwidth constraint the streams
//! share: plain links, MST links and DP tunnel groups.

pub mod limits;
pub mod solver;
pub mod stream;

pub use limits::LinkBwLimits;
pub use solver::{
    compute_pipe_bpp, solve_link_limits, solve_with_limits, Assignment, CheckerChain,
    LinkBwChecker, LinkCapacityChecker, LinkCheck, PipeBppConfigurator, StreamConfig,
    StreamConfigurator,
};
pub use stream::{validate_streams, Stream, StreamId, StreamMask, MAX_STREAMS};
