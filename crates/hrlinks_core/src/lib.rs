pub mod calendar;
pub mod distance;
pub mod listing;
pub mod properties;
pub mod reconcile;
pub mod runlog;
pub mod runtime;
pub mod store;
