pub mod forwarded_records;
