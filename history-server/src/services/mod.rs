pub mod scan_scheduler;
