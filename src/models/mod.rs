pub mod circuit_breaker;
pub mod delivery;
pub mod fcm;
pub mod gateway;
pub mod health;
pub mod idempotency;
pub mod message;
pub mod notification;
pub mod recipient;
pub mod request;
pub mod response;
pub mod retry;
pub mod status;
pub mod template;
pub mod validation;
