pub mod actions;
pub mod bitmap;
pub mod bootstrap;
pub mod merge;
pub mod model;
pub mod selectors;
pub mod state_store;

pub use model::AppState;
pub use state_store::StateStore;
