pub mod history;
pub mod stamp;
pub mod tools;
