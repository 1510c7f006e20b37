pub mod clock;
pub mod element;
pub mod error;

pub use clock::MtimeClock;
pub use element::{Element, ElementMap};
pub use error::{Result, StoreError};
