//! OpenID Connect session and token lifecycle
//!
//! # Module Layout
//!
//! - [`callback`]    -- Parsing of the provider's redirect parameters
//! - [`clock`]       -- Injectable wall clock
//! - [`discovery`]   -- Provider metadata and signing key retrieval
//! - [`flow`]        -- Authorization URL, code exchange, refresh, end-session
//! - [`id_token`]    -- Identity token signature and claim validation
//! - [`manager`]     -- Session state machine coordinating all sub-modules
//! - [`navigator`]   -- Full-page redirect and silent round trip seams
//! - [`random`]      -- `state`/`nonce` generation and PKCE
//! - [`session`]     -- Session, snapshot, pending login and event types
//! - [`timer`]       -- Single rearmable renewal timer
//! - [`token_store`] -- Persistence of the session and pending login

pub mod callback;
pub mod clock;
pub mod discovery;
pub mod flow;
pub mod id_token;
pub mod manager;
pub mod navigator;
pub mod random;
pub mod session;
pub mod timer;
pub mod token_store;

pub use manager::{CallbackResult, SessionManager, SessionManagerBuilder};
pub use session::{Session, SessionEvent, SessionSnapshot, SessionState};
