#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate serde_derive;

pub mod error;
pub mod logger;
