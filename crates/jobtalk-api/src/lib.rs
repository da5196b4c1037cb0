pub mod access;
pub mod applications;
pub mod auth;
pub mod conversations;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod routes;
pub mod state;
