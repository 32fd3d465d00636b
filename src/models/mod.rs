pub mod datasource;
pub mod instruction;
pub mod processed;
pub mod table;
