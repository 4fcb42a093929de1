mod jwt;
mod middleware;

#[cfg(test)]
pub use jwt::SessionClaims;
pub use jwt::JwtService;
pub use middleware::{AdminUser, AuthUser};
