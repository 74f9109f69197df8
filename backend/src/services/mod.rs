pub mod admin_service;
pub mod catalog;
pub mod collector;
pub mod poller;
pub mod read_cache;
pub mod scheduler;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;
