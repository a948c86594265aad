pub mod receipts;
pub mod results;
pub mod summary;
