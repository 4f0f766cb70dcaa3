pub mod agent;
pub mod config;
pub mod database;
pub mod error;
pub mod http_client;
pub mod llm_client;
pub mod runtime;
pub mod server;
pub mod store;
pub mod twilio;
pub mod webhook;

#[cfg(test)]
pub(crate) mod test_support;
