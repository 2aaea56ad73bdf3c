pub mod backend;
pub mod listmodels;
pub mod review;
