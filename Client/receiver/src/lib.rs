pub mod args;
pub mod storage;
