pub mod access;
pub mod connection;
pub mod dispatcher;
pub mod fabric;
pub mod identity;
pub mod registry;
pub mod store;
pub mod tracker;

#[cfg(test)]
pub(crate) mod testing;
