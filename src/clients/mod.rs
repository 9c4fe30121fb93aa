pub mod circuit_breaker;
pub mod database;
pub mod directory;
pub mod fcm;
pub mod gateway;
pub mod health;
pub mod http;
pub mod memory;
pub mod rbmq;
pub mod redis;
pub mod template;
