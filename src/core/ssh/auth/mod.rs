//! Trait-based authentication strategies for SSH connections (Strategy
//! pattern). The control plane normally only ever needs [`KeyAuth`] with
//! the shared signer's current key; [`AgentAuth`] and [`AuthChain`]
//! exist for migration scenarios and a pluggable authentication design.

mod agent;
mod chain;
mod key;
mod traits;

pub use agent::AgentAuth;
pub use chain::AuthChain;
pub use key::KeyAuth;
pub use traits::AuthStrategy;
