//! Authentication (session gate) and topic authorization.

pub mod gate;
pub mod permissions;

pub use gate::{
    parse_cookie_pairs, GateDecision, InMemorySessionStore, NextHandler, NotFound, SessionGate,
    SessionStore,
};
pub use permissions::{AclRule, AllowAll, Authorizer, TopicAcl};
