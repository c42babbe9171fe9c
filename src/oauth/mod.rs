//! OAuth 2.0 client side of delegation
//!
//! Features:
//! - Master token acquisition: authorization code + PKCE (RFC 7636) with a
//!   single-shot local callback listener, or the device grant (RFC 8628)
//! - Refresh-token grant before falling back to interactive sign-in
//! - Actor tokens via client credentials
//! - Per-service token exchange (RFC 8693) with a cached result per service

mod acquirer;
mod actor;
mod auth_code;
mod browser;
mod callback;
pub mod claims;
mod device;
mod endpoint;
mod exchange;
pub mod pkce;
mod token;

pub use acquirer::{CredentialAcquirer, LoginStrategy};
pub use actor::ActorTokenMinter;
pub use auth_code::{AuthorizationCodeFlow, RequestedActor};
pub use browser::{BrowserLauncher, PrintOnly, SystemBrowser};
pub use callback::{CallbackListener, CallbackResult};
pub use claims::{Audience, TokenClaims, decode_unverified};
pub use device::{DeviceAuthorization, DeviceFlow};
pub use endpoint::{
    ClientAuth, GRANT_DEVICE_CODE, GRANT_TOKEN_EXCHANGE, GrantError, TOKEN_TYPE_ACCESS_TOKEN,
    TOKEN_TYPE_JWT, TokenEndpoint, TokenResponse,
};
pub use exchange::TokenExchanger;
pub use pkce::PkcePair;
pub use token::{ActorToken, DelegatedToken, MasterToken, ServiceIdentity, unix_now};
