//! Authentication strategies for endpoint connections.
//!
//! Endpoints authenticate with a private key file referenced by the
//! registry. Strategies implement [`AuthStrategy`] so the transport can
//! stay agnostic of how credentials are presented.

mod key;
mod traits;

pub use key::KeyAuth;
pub use traits::AuthStrategy;
