//! Session and credential lifecycle engine for signet.
//!
//! This crate implements "Sign in with an external identity provider" for
//! native and web clients:
//!
//! - **Authorization Code Flow with PKCE** (RFC 7636) and per-flow nonces
//! - **Identity-token claim validation** (issuer, audience, freshness, nonce)
//! - **Progressive account lockout** after repeated failures
//! - **Refresh-token rotation** with reuse (theft) detection
//! - **Device binding** and a per-account **concurrent-session cap**
//!
//! The engine owns no storage. It talks to four repository traits (see
//! [`repository`]) and to a [`TokenExchangeClient`] for the provider call.
//! [`memory`] holds in-process repositories; `signet-store` provides
//! SQLite ones.
//!
//! # Architecture
//!
//! ```text
//! AuthFlow
//! ├── PkceStore        (state, verifier, nonce; single use)
//! ├── ClaimsValidator  (iss / aud / exp / iat / nonce)
//! ├── LockoutGuard     (progressive lockout, atomic counters)
//! ├── SessionManager   (create, rotate, revoke, cap)
//! └── AuditSink        (lifecycle events)
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use signet_auth_engine::memory::{
//!     MemoryAccountRepository, MemoryLockoutRepository, MemoryPendingAuthRepository,
//!     MemorySessionRepository,
//! };
//! use signet_auth_engine::{
//!     AuthFlow, AuthFlowDeps, EngineConfig, Fingerprint, TokenExchangeClient,
//!     TracingAuditSink,
//! };
//!
//! # async fn example(exchange: Arc<dyn TokenExchangeClient>) -> signet_auth_engine::Result<()> {
//! let config = EngineConfig::from_file("signet.toml")?;
//! let flow = AuthFlow::new(
//!     config,
//!     AuthFlowDeps {
//!         accounts: Arc::new(MemoryAccountRepository::new()),
//!         lockouts: Arc::new(MemoryLockoutRepository::new()),
//!         sessions: Arc::new(MemorySessionRepository::new()),
//!         pending: Arc::new(MemoryPendingAuthRepository::new()),
//!         exchange,
//!         audit: Arc::new(TracingAuditSink),
//!     },
//! )?;
//!
//! let start = flow.initiate().await?;
//! println!("redirect to {}", start.authorization_url);
//!
//! // ... provider redirects back with `code` and `state` ...
//! let device = Fingerprint::normalize("MyApp/1.0 (iPhone)");
//! let sign_in = flow.complete("code", &start.state, None, &device).await?;
//! println!("session {}", sign_in.credentials.session.id);
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod claims;
pub mod config;
pub mod crypto;
mod deadline;
pub mod error;
pub mod exchange;
pub mod lockout;
pub mod memory;
pub mod model;
pub mod orchestrator;
pub mod pkce;
pub mod repository;
pub mod session;
pub mod token;

pub use audit::{AuditSink, AuthEvent, NoopAuditSink, TracingAuditSink};
pub use claims::{ClaimsValidator, Identity, VerifiedClaims};
pub use config::{
    ClaimsConfig, EngineConfig, LockoutConfig, PkceConfig, ProviderConfig, SessionConfig,
    SessionLimitPolicy, StorageConfig,
};
pub use error::{AuthEngineError, ClaimViolation, Result};
pub use exchange::{HttpExchangeConfig, HttpTokenExchange, IdTokenVerifier, TokenExchangeClient};
pub use lockout::{LockedStatus, LockoutGuard, LockoutPolicy};
pub use model::{Account, Fingerprint, LockoutState, PendingAuthRequest, Session};
pub use orchestrator::{AuthFlow, AuthFlowDeps, SignIn, SignInStart};
pub use pkce::{PkceChallenge, PkceGrant, PkceStore};
pub use repository::{
    AccountRepository, LimitOutcome, LockoutRepository, PendingAuthRepository, RepoResult,
    RepositoryError, SessionRepository,
};
pub use session::{IssuedCredentials, Rotation, SessionManager};
pub use token::{AccessClaims, AccessTokenSigner};
