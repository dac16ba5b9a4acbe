pub mod client;
pub mod credentials;
pub mod error;
pub mod payloads;

pub use client::{HostClient, HostClientFactory, RestClientFactory, RestHostClient};
pub use credentials::{ConfigCredentialService, CredentialError, CredentialService, HostCredential};
pub use error::GithubApiError;
pub use payloads::*;
