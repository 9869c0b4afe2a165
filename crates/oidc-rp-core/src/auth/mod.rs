mod callback;
mod coordinator;
mod discovery;
mod error;
mod events;
mod flow;
mod id_token;
mod loopback;
mod manager;
mod manual;
mod pkce;
mod protocol;
mod renewal;
mod request;
mod session;
mod token_store;
mod utils;

#[cfg(test)]
pub(crate) mod test_support;

pub use callback::CallbackParams;
pub use coordinator::{
    ChangeReceiver, CrossContextCoordinator, Incoming, Reconciliation, SessionChange,
    SessionChannel,
};
pub use discovery::DiscoveryDocument;
pub use error::AuthError;
pub use events::{EventBus, SessionEvent, SubscriptionId};
pub use flow::{FlowPreference, InvalidFlow, LoginFlow};
pub use id_token::{Audience, IdTokenClaims, IdTokenValidator};
pub use loopback::{run_loopback_login, LoopbackListener};
pub use manager::{SessionManager, SessionManagerBuilder};
pub use manual::run_manual_login;
pub use pkce::{AuthChallenge, PkcePair};
pub use protocol::{AuthorizationRequest, ProtocolClient};
pub use renewal::{
    renewal_time, FallbackRenewal, RefreshTokenRenewal, RenewFn, RenewFuture, RenewState,
    RenewalTransaction, SilentAuthorizeRenewal, SilentNavigator, SilentRenewScheduler,
};
pub use request::AuthRequestState;
pub use session::{Session, TokenSet, TokenType};
pub use token_store::{FileBackend, MemoryBackend, StorageScope, StoreBackend, TokenStore};
pub use utils::random_token;
