mod claims;
mod jwt;
mod resolver;

pub use claims::Claims;
pub use jwt::{sign_token, JwtValidator};
pub use resolver::{IdentityResolver, JwtIdentityResolver};
