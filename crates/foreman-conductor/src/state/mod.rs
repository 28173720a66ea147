pub mod persist;
pub mod run;
pub mod table;
