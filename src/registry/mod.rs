pub mod node;
pub mod store;

pub use node::{NodeRecord, Source};
pub use store::Registry;
