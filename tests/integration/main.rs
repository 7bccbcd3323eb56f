#[path = "../common/mod.rs"]
mod common;

mod fsops_tests;
mod hotreload_tests;
