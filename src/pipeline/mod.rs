pub mod assembler;
pub mod binder;
pub mod dispatcher;
pub mod guard;
pub mod resolver;
pub mod scheduler;
pub mod service;
pub mod validator;
