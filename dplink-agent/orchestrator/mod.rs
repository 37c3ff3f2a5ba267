pub mod negotiator;
pub mod scenario;

pub use negotiator::{DisplayLink, LinkReport, NegotiationReport, Negotiator};
pub use scenario::{CapacityChange, Scenario, SimTopology};
