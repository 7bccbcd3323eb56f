#[path = "../common/mod.rs"]
mod common;

mod catalog_tests;
mod config_tests;
mod fence_tests;
mod meta_cache_tests;
mod posix_cache_tests;
mod tiered_cache_tests;
