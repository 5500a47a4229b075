pub mod condition;
pub mod mutex;
