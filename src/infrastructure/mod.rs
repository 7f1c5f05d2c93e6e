pub mod database;
pub mod scanner;
