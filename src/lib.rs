#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate static_assertions;

#[macro_use]
pub mod log;
pub mod bounded_vec;
pub mod commands;
pub mod registers;
pub mod taint_origin;
pub mod trace;
