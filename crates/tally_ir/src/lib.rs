pub mod entity;
pub mod records;
pub mod schema;
pub mod utils;

pub use entity::{EntityClass, EntityRef};
pub use records::{ComplexTransaction, ComplexTransactionStatus, Transaction};
pub use schema::*;
