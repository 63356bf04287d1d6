pub mod json;
pub mod retry;
