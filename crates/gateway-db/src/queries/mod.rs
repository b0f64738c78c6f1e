pub mod memory_fts;
pub mod schedules;
