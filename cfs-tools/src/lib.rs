pub mod async_lru_cache;
pub mod broadcast;
pub mod lru_cache;
