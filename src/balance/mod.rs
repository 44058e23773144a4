//! Client-side load balancing: target parsing, balancer state machine,
//! picker policies and resolvers.

mod balancer;
mod picker;
mod resolver;
mod ring;
mod target;

pub use balancer::{Balancer, ClientConn, ConnState, SubConnHandle};
pub use picker::{CallOptions, Picker, KETAMA_HASH, RANDOM, WEIGHT_RANDOM};
pub use resolver::{DynamicPrefixResolver, NamingResolver};
pub use ring::Ring;
pub use target::{parse_dial_target, DialOptions, DialTarget, ETCD_SCHEME};
