pub mod oidc;
pub mod paystack;

pub use oidc::{
    AuthorizeUrlParams, IdTokenClaims, OidcClient, OidcError, ProviderMetadata, TokenResponse,
    DISCOVERY_TTL,
};
pub use paystack::{
    verify_webhook_signature, CheckoutMetadata, Customer, InitializeData, InitializeRequest,
    PaystackClient, PaystackError, Transaction,
};
