//! Membership Module
//!
//! Node identities and views, the heartbeat failure detector, RTT probing,
//! and the leader oracle built on top of them.

mod view;
pub mod detector;
pub mod oracle;
pub mod probe;

pub use view::{NodeId, View, ViewDiff};
pub use detector::{DetectorInput, FailureDetector, Liveness, RequestId, RtoMap};
pub use oracle::{LeaderOracle, OracleEvent, OracleInput};
pub use probe::RttEstimator;
