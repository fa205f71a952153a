pub(crate) mod block;
pub(crate) mod free_list;
pub(crate) mod heap;
#[cfg(test)]
mod integration;
pub(crate) mod region;
pub(crate) mod stats;
pub(crate) mod vm;

#[cfg(test)]
pub static TEST_MUTEX: std::sync::RwLock<()> = std::sync::RwLock::new(());
