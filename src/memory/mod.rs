pub(crate) mod block_pool;
pub(crate) mod config;
pub(crate) mod diagnostics;
pub(crate) mod error;
pub(crate) mod fallback;
pub(crate) mod integration;
pub(crate) mod manager;
pub(crate) mod pool_box;
pub(crate) mod shared;
pub(crate) mod size_class;
pub(crate) mod slot_map;
pub(crate) mod stats;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
