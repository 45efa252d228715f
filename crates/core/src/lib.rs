pub mod check;
pub mod kernels;
pub mod layout;
pub mod problem;
pub mod record;
pub mod report;
pub mod sweep;
pub mod timing;
