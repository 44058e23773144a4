//! Prefix routing table and routing-service façade.

mod radix;
mod route_table;
mod rule_table;
mod service;

pub use radix::RadixTree;
pub use route_table::RouteTable;
pub use rule_table::RuleTable;
pub use service::{DefaultRoutingService, ResolvedInstance, RoutingService};
