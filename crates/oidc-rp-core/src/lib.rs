//! OpenID Connect relying-party session management: authorization code with PKCE,
//! token lifecycle with silent renewal, and cross-context session coordination.

pub mod auth;
pub mod config;

pub use auth::{AuthError, Session, SessionEvent, SessionManager};
pub use config::{ConfigError, ConfigLocator, RetryPolicy, RpConfig};
