pub mod catalog;
pub mod db_external;
pub mod db_internal;
pub mod file_reader;
pub mod utils;
